//! The per-packet processing context.
//!
//! A single descriptor is reused for every captured packet. Stages peel
//! their protocol layer by pushing a layer slice onto the descriptor's
//! stack; the remaining payload advances accordingly. The stack is
//! append-only within one packet; `initialize` clears it for the next one.

use crate::flow::{FlowId, FlowRef};
use crate::ids::DeviceId;
use crate::stage::StageHandle;
use crate::time::TimeVal;

use std::fmt::Write as _;

/// Upper bound on the layer stack depth; deeper packets indicate a
/// mis-wired stage graph.
const MAX_LAYER_DEPTH: usize = 30;

/// Capture header of the packet being processed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureHeader {
    pub ts: TimeVal,
    /// Bytes actually captured.
    pub caplen: u32,
    /// Bytes on the wire.
    pub origlen: u32,
}

/// Direction of a packet relative to the subscriber.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    #[default]
    Undefined,
    Uplink,
    Downlink,
}

/// Rewrites a layer's header in a dump buffer after lower layers were
/// stripped: receives the header bytes and the layer's new total length.
pub type HeaderFix = fn(header: &mut [u8], total_len: u32);

#[derive(Debug, Clone, Copy)]
struct LayerSlice {
    stage: StageHandle,
    offset: usize,
    header_len: usize,
    payload_len: usize,
    fix: Option<HeaderFix>,
}

/// Mutable state of the packet currently walking the stage graph.
pub struct PacketDescriptor {
    header: CaptureHeader,
    data: Vec<u8>,
    packet_number: u64,
    layers: Vec<LayerSlice>,
    payload_offset: usize,
    payload_len: usize,
    pub direction: Direction,
    user_id: Option<DeviceId>,
    equipment_id: Option<DeviceId>,
    flow: Option<FlowRef>,
    flow_number: u64,
    flow_id: FlowId,
    scratch: Vec<u8>,
}

impl PacketDescriptor {
    pub fn new() -> Self {
        PacketDescriptor {
            header: CaptureHeader::default(),
            data: Vec::with_capacity(65536),
            packet_number: 0,
            layers: Vec::with_capacity(MAX_LAYER_DEPTH),
            payload_offset: 0,
            payload_len: 0,
            direction: Direction::Undefined,
            user_id: None,
            equipment_id: None,
            flow: None,
            flow_number: 0,
            flow_id: FlowId::default(),
            scratch: Vec::new(),
        }
    }

    /// Loads the next captured packet, copying its bytes into the reused
    /// buffer, and resets all per-packet state.
    pub fn load(&mut self, header: CaptureHeader, bytes: &[u8], packet_number: u64) {
        self.header = header;
        self.data.clear();
        self.data.extend_from_slice(bytes);
        self.initialize(packet_number);
    }

    /// Clears the layer stack, direction, ids and flow association.
    pub fn initialize(&mut self, packet_number: u64) {
        self.packet_number = packet_number;
        self.layers.clear();
        self.payload_offset = 0;
        self.payload_len = self.data.len();
        self.direction = Direction::Undefined;
        self.user_id = None;
        self.equipment_id = None;
        self.flow = None;
        self.flow_number = 0;
        self.flow_id.reset();
    }

    pub fn header(&self) -> &CaptureHeader {
        &self.header
    }

    pub fn packet_number(&self) -> u64 {
        self.packet_number
    }

    /// The part of the packet not yet claimed by any layer.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.payload_offset..self.payload_offset + self.payload_len]
    }

    /// Number of layers on the stack.
    pub fn level(&self) -> usize {
        self.layers.len()
    }

    /// Claims the first `header_len` payload bytes as `stage`'s header and
    /// advances the payload. Panics on a header longer than the payload or
    /// on a runaway stack; both indicate a stage bug, not packet damage.
    pub fn push_layer(&mut self, stage: StageHandle, header_len: usize) {
        self.push_layer_with_fix(stage, header_len, None);
    }

    pub fn push_layer_with_fix(
        &mut self,
        stage: StageHandle,
        header_len: usize,
        fix: Option<HeaderFix>,
    ) {
        assert!(
            header_len <= self.payload_len,
            "stage claimed {} header bytes of a {} byte payload",
            header_len,
            self.payload_len
        );
        assert!(self.layers.len() < MAX_LAYER_DEPTH, "layer stack overflow");
        self.layers.push(LayerSlice {
            stage,
            offset: self.payload_offset,
            header_len,
            payload_len: self.payload_len - header_len,
            fix,
        });
        self.payload_offset += header_len;
        self.payload_len -= header_len;
    }

    fn layer(&self, stage: StageHandle) -> Option<&LayerSlice> {
        self.layers.iter().find(|l| l.stage == stage)
    }

    /// Header bytes previously claimed by `stage`, or `None` when the stage
    /// is not on the stack.
    pub fn segment(&self, stage: StageHandle) -> Option<&[u8]> {
        self.layer(stage)
            .map(|l| &self.data[l.offset..l.offset + l.header_len])
    }

    /// Payload length below `stage`'s header, counting the truncated tail.
    pub fn segment_payload_len(&self, stage: StageHandle) -> u32 {
        match self.layer(stage) {
            Some(l) => l.payload_len as u32 + (self.header.origlen - self.header.caplen),
            None => 0,
        }
    }

    /// Header plus payload length of `stage`'s layer, counting the truncated
    /// tail.
    pub fn segment_total_len(&self, stage: StageHandle) -> u32 {
        match self.layer(stage) {
            Some(l) => {
                (l.header_len + l.payload_len) as u32 + (self.header.origlen - self.header.caplen)
            }
            None => 0,
        }
    }

    pub fn flow_id(&self) -> &FlowId {
        &self.flow_id
    }

    pub fn flow_id_mut(&mut self) -> &mut FlowId {
        &mut self.flow_id
    }

    pub fn flow(&self) -> Option<&FlowRef> {
        self.flow.as_ref()
    }

    pub fn set_flow(&mut self, flow: FlowRef) {
        self.flow = Some(flow);
    }

    pub fn flow_number(&self) -> u64 {
        self.flow_number
    }

    pub fn set_flow_number(&mut self, n: u64) {
        self.flow_number = n;
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

    /// Builds a contiguous dump buffer starting at `base`'s header (the whole
    /// packet when `base` is `None`), truncated to `snap_len` when non-zero.
    /// With `fix_headers`, each layer's header-fix hook runs on the copy so
    /// that length fields match the shortened packet. Returns the bytes and
    /// the capture header describing them.
    pub fn to_byte_array(
        &mut self,
        base: Option<StageHandle>,
        snap_len: usize,
        fix_headers: bool,
    ) -> Option<(&[u8], CaptureHeader)> {
        let start = match base {
            None => 0,
            Some(stage) => self.layer(stage)?.offset,
        };
        let available = self.data.len() - start;
        let caplen = if snap_len > 0 {
            snap_len.min(available)
        } else {
            available
        };

        self.scratch.clear();
        self.scratch.extend_from_slice(&self.data[start..start + caplen]);

        if fix_headers {
            for layer in self.layers.iter().filter(|l| l.offset >= start) {
                if let Some(fix) = layer.fix {
                    let rel = layer.offset - start;
                    if rel + layer.header_len <= self.scratch.len() {
                        let total = (layer.header_len + layer.payload_len) as u32;
                        fix(&mut self.scratch[rel..rel + layer.header_len], total);
                    }
                }
            }
        }

        let header = CaptureHeader {
            ts: self.header.ts,
            caplen: caplen as u32,
            origlen: self.header.origlen - start as u32,
        };
        Some((&self.scratch, header))
    }

    /// One-line rendering of the layer stack for trace logging.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "packet no. {}:", self.packet_number);
        for layer in &self.layers {
            let _ = write!(
                out,
                " [stage {} off {} hdr {} pay {}]",
                layer.stage.index(),
                layer.offset,
                layer.header_len,
                layer.payload_len
            );
        }
        out
    }
}

impl Default for PacketDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(i: usize) -> StageHandle {
        StageHandle::for_tests(i)
    }

    fn descriptor(bytes: &[u8]) -> PacketDescriptor {
        let mut pkt = PacketDescriptor::new();
        let header = CaptureHeader {
            ts: TimeVal::new(100, 0),
            caplen: bytes.len() as u32,
            origlen: bytes.len() as u32,
        };
        pkt.load(header, bytes, 1);
        pkt
    }

    #[test]
    fn layers_advance_the_payload() {
        let mut pkt = descriptor(&[0u8; 50]);
        pkt.push_layer(handle(0), 14);
        pkt.push_layer(handle(1), 20);
        assert_eq!(pkt.payload().len(), 16);
        assert_eq!(pkt.segment(handle(0)).unwrap().len(), 14);
        assert_eq!(pkt.segment_total_len(handle(1)), 36);
        assert_eq!(pkt.segment_payload_len(handle(1)), 16);
        assert!(pkt.segment(handle(9)).is_none());
        assert_eq!(pkt.level(), 2);
    }

    #[test]
    fn truncated_tail_counts_into_lengths() {
        let mut pkt = PacketDescriptor::new();
        let header = CaptureHeader {
            ts: TimeVal::new(100, 0),
            caplen: 40,
            origlen: 100,
        };
        pkt.load(header, &[0u8; 40], 1);
        pkt.push_layer(handle(0), 14);
        assert_eq!(pkt.segment_total_len(handle(0)), 100);
        assert_eq!(pkt.segment_payload_len(handle(0)), 86);
    }

    #[test]
    fn initialize_clears_per_packet_state() {
        let mut pkt = descriptor(&[0u8; 20]);
        pkt.push_layer(handle(0), 10);
        pkt.direction = Direction::Uplink;
        pkt.set_flow_number(7);
        pkt.initialize(2);
        assert_eq!(pkt.level(), 0);
        assert_eq!(pkt.payload().len(), 20);
        assert_eq!(pkt.direction, Direction::Undefined);
        assert_eq!(pkt.flow_number(), 0);
        assert!(pkt.flow().is_none());
    }

    #[test]
    fn byte_array_from_base_layer_with_snaplen() {
        let bytes: Vec<u8> = (0u8..60).collect();
        let mut pkt = descriptor(&bytes);
        pkt.push_layer(handle(0), 14);
        pkt.push_layer(handle(1), 20);

        let (dump, header) = pkt.to_byte_array(Some(handle(1)), 10, false).unwrap();
        assert_eq!(dump.len(), 10);
        assert_eq!(dump[0], 14, "dump starts at the base layer's header");
        assert_eq!(header.caplen, 10);
        assert_eq!(header.origlen, 46);
    }

    #[test]
    fn header_fix_runs_on_the_copy() {
        fn put_total(header: &mut [u8], total: u32) {
            header[0..2].copy_from_slice(&(total as u16).to_be_bytes());
        }
        let mut pkt = descriptor(&[0u8; 30]);
        pkt.push_layer_with_fix(handle(0), 8, Some(put_total));
        let original_first = pkt.payload()[0];

        let (dump, _) = pkt.to_byte_array(None, 0, true).unwrap();
        assert_eq!(u16::from_be_bytes([dump[0], dump[1]]), 30);
        // The live packet bytes stay untouched.
        assert_eq!(pkt.payload()[0], original_first);
        assert_eq!(pkt.data[0], 0);
    }
}
