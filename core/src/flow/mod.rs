//! Flow records and identifiers.

pub mod id;
mod options;
mod stats;

pub use id::{FlowId, FlowKey, TCP_PROTOCOL, UDP_PROTOCOL};
pub use options::{OptionsContainer, OPTION_SEPARATOR};
pub use stats::PacketStatistics;

use crate::classify::hints::HintSet;
use crate::classify::metadata::ClassificationMetadata;
use crate::classify::tags::{FacetTags, TagContainer};
use crate::ids::DeviceId;
use crate::store::Timestamped;
use crate::time::TimeVal;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

/// Shared handle to a flow. The flow table owns the record; the packet
/// descriptor and the flow-level stage chain hold handles that end their
/// life after emission.
pub type FlowRef = Rc<RefCell<Flow>>;

/// A bidirectional L4 conversation with counters, identifiers and the
/// classification state.
#[derive(Debug)]
pub struct Flow {
    id: FlowId,
    first_packet: TimeVal,
    last_packet: TimeVal,
    upload_bytes: u64,
    download_bytes: u64,
    upload_packets: u64,
    download_packets: u64,
    statistics: Option<PacketStatistics>,
    user_id: Option<DeviceId>,
    equipment_id: Option<DeviceId>,
    hints: HintSet,
    tags: FacetTags,
    options: OptionsContainer,
    /// Flow packet count at the moment the most recent hint arrived.
    last_hinted_packet: u64,
    /// Flow packet count when the flow first became final overall.
    first_final_packet: u64,
}

impl Flow {
    pub fn new(id: FlowId, metadata: Arc<ClassificationMetadata>) -> Self {
        Flow {
            id,
            first_packet: TimeVal::default(),
            last_packet: TimeVal::default(),
            upload_bytes: 0,
            download_bytes: 0,
            upload_packets: 0,
            download_packets: 0,
            statistics: None,
            user_id: None,
            equipment_id: None,
            hints: HintSet::default(),
            tags: FacetTags::new(metadata),
            options: OptionsContainer::default(),
            last_hinted_packet: 0,
            first_final_packet: u64::MAX,
        }
    }

    /// Starts collecting detailed size/IAT statistics.
    pub fn enable_detailed_statistics(&mut self) {
        if self.statistics.is_none() {
            self.statistics = Some(PacketStatistics::default());
        }
    }

    /// Registers one packet of the flow.
    pub fn packet(&mut self, ts: TimeVal, upload: bool, length: u64) {
        self.last_packet = ts;
        if self.first_packet.is_zero() {
            self.first_packet = ts;
        }
        if upload {
            self.upload_bytes += length;
            self.upload_packets += 1;
        } else {
            self.download_bytes += length;
            self.download_packets += 1;
        }
        if let Some(stats) = self.statistics.as_mut() {
            stats.packet(ts, upload, length);
        }
    }

    /// Registers a classification hint; remembers the packet count so the
    /// evaluator can skip flows without fresh evidence.
    pub fn set_hint(&mut self, block_id: u32, sig_id: u32) -> bool {
        self.last_hinted_packet = self.packets_number();
        self.hints.set(block_id, sig_id)
    }

    pub fn set_tag(&mut self, facet_id: u32, focus_id: u32, is_final: bool) {
        self.tags.set_tag(facet_id, focus_id, is_final);
        self.latch_final();
    }

    pub fn set_tags(&mut self, new_tags: &TagContainer, block_id: u32, is_final: bool) {
        self.tags.set_tags(new_tags, block_id, is_final);
        self.latch_final();
    }

    fn latch_final(&mut self) {
        if self.first_final_packet == u64::MAX && self.tags.is_final() {
            self.first_final_packet = self.packets_number();
        }
    }

    pub fn is_final(&self) -> bool {
        self.tags.is_final()
    }

    pub fn id(&self) -> &FlowId {
        &self.id
    }

    pub fn first_packet(&self) -> TimeVal {
        self.first_packet
    }

    pub fn last_packet(&self) -> TimeVal {
        self.last_packet
    }

    pub fn upload_packets(&self) -> u64 {
        self.upload_packets
    }

    pub fn download_packets(&self) -> u64 {
        self.download_packets
    }

    pub fn upload_bytes(&self) -> u64 {
        self.upload_bytes
    }

    pub fn download_bytes(&self) -> u64 {
        self.download_bytes
    }

    pub fn packets_number(&self) -> u64 {
        self.upload_packets + self.download_packets
    }

    pub fn statistics(&self) -> Option<&PacketStatistics> {
        self.statistics.as_ref()
    }

    pub fn user_id(&self) -> Option<&DeviceId> {
        self.user_id.as_ref()
    }

    pub fn set_user_id(&mut self, id: DeviceId) {
        self.user_id = Some(id);
    }

    pub fn equipment_id(&self) -> Option<&DeviceId> {
        self.equipment_id.as_ref()
    }

    pub fn set_equipment_id(&mut self, id: DeviceId) {
        self.equipment_id = Some(id);
    }

    pub fn hints(&self) -> &HintSet {
        &self.hints
    }

    pub fn tags(&self) -> &FacetTags {
        &self.tags
    }

    pub fn options(&self) -> &OptionsContainer {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut OptionsContainer {
        &mut self.options
    }

    pub fn last_hinted_packet(&self) -> u64 {
        self.last_hinted_packet
    }

    pub fn first_final_packet(&self) -> u64 {
        self.first_final_packet
    }
}

impl Timestamped for Flow {
    fn last_activity(&self) -> TimeVal {
        self.last_packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::metadata::tests::test_metadata;

    fn flow() -> Flow {
        Flow::new(FlowId::default(), Arc::new(test_metadata()))
    }

    #[test]
    fn counters_track_every_packet() {
        let mut f = flow();
        let calls = [(true, 70), (false, 120), (true, 40)];
        for (i, (up, len)) in calls.iter().enumerate() {
            f.packet(TimeVal::new(100 + i as i64, 0), *up, *len);
        }
        assert_eq!(f.upload_packets() + f.download_packets(), calls.len() as u64);
        assert_eq!(f.upload_bytes(), 110);
        assert_eq!(f.download_bytes(), 120);
        assert_eq!(f.first_packet(), TimeVal::new(100, 0));
        assert_eq!(f.last_packet(), TimeVal::new(102, 0));
    }

    #[test]
    fn hint_updates_last_hinted_packet() {
        let mut f = flow();
        f.packet(TimeVal::new(100, 0), true, 70);
        assert_eq!(f.last_hinted_packet(), 0);
        f.set_hint(1, 1);
        assert_eq!(f.last_hinted_packet(), 1);
        f.packet(TimeVal::new(101, 0), false, 70);
        assert!(f.last_hinted_packet() < f.packets_number());
    }

    #[test]
    fn first_final_packet_latches_once() {
        let mut f = flow();
        f.packet(TimeVal::new(100, 0), true, 70);
        f.packet(TimeVal::new(101, 0), true, 70);
        assert_eq!(f.first_final_packet(), u64::MAX);

        // Facet 1 is the required one in the test metadata.
        f.set_tag(1, 1, true);
        assert!(f.is_final());
        assert_eq!(f.first_final_packet(), 2);

        f.packet(TimeVal::new(102, 0), true, 70);
        f.set_tag(2, 1, true);
        assert_eq!(f.first_final_packet(), 2, "latched value must not move");
    }
}
