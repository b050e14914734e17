//! GTP-C control-plane stage.
//!
//! Maintains the tunnel table from create/update/delete signalling and SGSN
//! context migration. Notes carried over from field experience:
//! - updates addressed to tunnel id 0 are dropped (version moves, recovery)
//! - if either node wants a context deleted, it is deleted regardless of the
//!   response
//! - node addresses are IPv4 and are not cross-checked
//! - in SGSN migrations the primary sub-channel comes first and all
//!   secondaries follow before another primary

use crate::config::params;
use crate::ids::DeviceId;
use crate::packet::PacketDescriptor;
use crate::protocols::{be_u16, be_u32, ipv4_at};
use crate::protocols::gtp;
use crate::protocols::ipv4::Ipv4Stage;
use crate::stage::{EngineState, Ports, Stage, StageHandle, StageMap, Verdict};
use crate::time::TimeVal;
use crate::tunnel::{
    EndpointPair, NodeRole, TunnelContext, TunnelEndpoint, TunnelRef, TunnelState,
};

use std::fs::File;
use std::io::{BufWriter, Write};
use std::net::Ipv4Addr;

use anyhow::{Context, Result};

const MESSAGE_TYPE_CREATE_REQUEST: u8 = 16;
const MESSAGE_TYPE_CREATE_RESPONSE: u8 = 17;
const MESSAGE_TYPE_UPDATE_REQUEST: u8 = 18;
const MESSAGE_TYPE_UPDATE_RESPONSE: u8 = 19;
const MESSAGE_TYPE_DELETE_REQUEST: u8 = 20;
const MESSAGE_TYPE_DELETE_RESPONSE: u8 = 21;
const MESSAGE_TYPE_SGSN_REQUEST: u8 = 50;
const MESSAGE_TYPE_SGSN_RESPONSE: u8 = 51;
const MESSAGE_TYPE_SGSN_ACKNOWLEDGEMENT: u8 = 52;

const IE_CAUSE: u8 = 1;
const IE_IMSI: u8 = 2;
const IE_DATA_TEID: u8 = 16;
const IE_CONTROL_TEID: u8 = 17;
const IE_NSAPI: u8 = 20;
const IE_CHARGING_ID: u8 = 127;
const IE_USER_IP: u8 = 128;
const IE_PDP_CONTEXT: u8 = 130;
const IE_APN: u8 = 131;
const IE_GSN_ADDRESS: u8 = 133;
const IE_RAT_TYPE: u8 = 151;
const IE_USER_LOCATION: u8 = 152;
const IE_IMEISV: u8 = 154;

/// Request accepted.
const CAUSE_ACCEPTED: u8 = 128;

/// Sub-channel id value meaning "not seen yet".
const NO_SUBCHANNEL: u8 = 255;

/// Fixed value lengths of the type-value (type ≤ 127) information elements
/// the engine understands. Unknown low-type elements abort the message: their
/// length cannot be inferred.
fn tv_length(ie_type: u8) -> Option<usize> {
    match ie_type {
        IE_CAUSE => Some(1),
        IE_IMSI => Some(8),
        3 => Some(6),   // routeing area identity
        4 => Some(4),   // TLLI
        5 => Some(4),   // P-TMSI
        8 => Some(1),   // reordering required
        9 => Some(28),  // authentication triplet
        11 => Some(1),  // MAP cause
        12 => Some(3),  // P-TMSI signature
        13 => Some(1),  // MS validated
        14 => Some(1),  // recovery
        15 => Some(1),  // selection mode
        IE_DATA_TEID => Some(4),
        IE_CONTROL_TEID => Some(4),
        18 => Some(5),  // TEID data II
        19 => Some(1),  // teardown indication
        IE_NSAPI => Some(1),
        21 => Some(1),  // RANAP cause
        22 => Some(9),  // RAB context
        23 => Some(1),  // radio priority SMS
        24 => Some(1),  // radio priority
        25 => Some(2),  // packet flow id
        26 => Some(2),  // charging characteristics
        27 => Some(2),  // trace reference
        28 => Some(2),  // trace type
        IE_CHARGING_ID => Some(4),
        _ => None,
    }
}

struct Ie<'a> {
    ie_type: u8,
    /// Value bytes.
    value: &'a [u8],
    /// The whole element including type and length prefix.
    raw: &'a [u8],
}

/// Walks a GTP-C information element stream. Type bytes above 127 carry a
/// two-byte length prefix; below, the length comes from the static table.
struct IeCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> IeCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        IeCursor { buf, pos: 0 }
    }

    fn next(&mut self) -> Result<Option<Ie<'a>>, &'static str> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let start = self.pos;
        let ie_type = self.buf[start];
        let (value_start, value_len) = if ie_type <= 127 {
            match tv_length(ie_type) {
                Some(len) => (start + 1, len),
                None => return Err("unknown IE"),
            }
        } else {
            if start + 3 > self.buf.len() {
                return Err("truncated IE length");
            }
            (start + 3, be_u16(self.buf, start + 1) as usize)
        };
        let end = value_start + value_len;
        if end > self.buf.len() {
            return Err("IE length exceeds payload");
        }
        self.pos = end;
        Ok(Some(Ie {
            ie_type,
            value: &self.buf[value_start..end],
            raw: &self.buf[start..end],
        }))
    }
}

/// Values shared by several message handlers.
#[derive(Default)]
struct CommonIes {
    cause: Option<u8>,
    user_id: Option<DeviceId>,
    equipment_id: Option<DeviceId>,
    data_teid: u32,
    control_teid: u32,
    subchannel: u8,
    user_ip: Option<Ipv4Addr>,
    control_ip: Option<Ipv4Addr>,
    data_ip: Option<Ipv4Addr>,
    apn: Option<String>,
    rat_type: u8,
    location: Option<String>,
}

impl CommonIes {
    fn collect(ies: &[u8], stage: &str, packet_no: u64) -> Option<CommonIes> {
        let mut out = CommonIes {
            subchannel: NO_SUBCHANNEL,
            ..Default::default()
        };
        let mut cursor = IeCursor::new(ies);
        loop {
            let ie = match cursor.next() {
                Ok(Some(ie)) => ie,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("{}: {}, dropping packet (no. {})", stage, e, packet_no);
                    return None;
                }
            };
            match ie.ie_type {
                IE_CAUSE => out.cause = Some(ie.value[0]),
                IE_IMSI => out.user_id = DeviceId::from_tbcd(ie.value),
                IE_IMEISV => out.equipment_id = DeviceId::from_tbcd(ie.value),
                IE_DATA_TEID => out.data_teid = be_u32(ie.value, 0),
                IE_CONTROL_TEID => out.control_teid = be_u32(ie.value, 0),
                // A second NSAPI element is the linked one; keep the first.
                IE_NSAPI if out.subchannel == NO_SUBCHANNEL => {
                    out.subchannel = ie.value[0] & 0x0f
                }
                IE_USER_IP if ie.value.len() == 6 => {
                    out.user_ip = Some(ipv4_at(ie.value, 2));
                }
                IE_GSN_ADDRESS if ie.value.len() == 4 => {
                    // Control address comes first, data address second.
                    let addr = ipv4_at(ie.value, 0);
                    if out.control_ip.is_none() {
                        out.control_ip = Some(addr);
                    } else {
                        out.data_ip = Some(addr);
                    }
                }
                IE_APN => out.apn = decode_apn(ie.value),
                IE_RAT_TYPE if !ie.value.is_empty() => out.rat_type = ie.value[0],
                IE_USER_LOCATION => out.location = decode_location(ie.value),
                _ => {}
            }
        }
        Some(out)
    }
}

/// Decodes the length-prefixed label list of an access point name.
fn decode_apn(value: &[u8]) -> Option<String> {
    let mut labels = Vec::new();
    let mut pos = 0;
    while pos < value.len() {
        let len = value[pos] as usize;
        let label = value.get(pos + 1..pos + 1 + len)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += len + 1;
    }
    if labels.is_empty() {
        return None;
    }
    Some(labels.join("."))
}

/// Renders user location information as `mcc:mnc:lac:ci`.
fn decode_location(value: &[u8]) -> Option<String> {
    if value.len() != 8 || value[0] > 1 {
        log::warn!(
            "unknown user location IE, length: {}, type: {}",
            value.len(),
            value.first().copied().unwrap_or(0)
        );
        return None;
    }
    let mcc = [value[1] & 0x0f, value[1] >> 4, value[2] & 0x0f];
    let mnc = [value[3] & 0x0f, value[3] >> 4, value[2] >> 4];
    let lac = be_u16(value, 4);
    let ci = be_u16(value, 6);

    let mut out = format!("{}{}{}:{}{}", mcc[0], mcc[1], mcc[2], mnc[0], mnc[1]);
    if mnc[2] < 15 {
        out.push_str(&mnc[2].to_string());
    }
    out.push_str(&format!(":{}:{}", lac, ci));
    Some(out)
}

/// One line of the tunnel context log:
/// `created|deleted|user|equipment|user-ip|apn|rat|location`.
pub(crate) fn format_context_record(context: &TunnelContext, deleted: Option<TimeVal>) -> String {
    let deleted = match deleted {
        Some(ts) => ts.to_string(),
        None => "na".to_string(),
    };
    format!(
        "{}|{}|{}|{}|{}|{}|{}|{}\n",
        context.created,
        deleted,
        context
            .user_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "na".to_string()),
        context
            .equipment_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "na".to_string()),
        context
            .user_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "na".to_string()),
        context.apn.as_deref().unwrap_or("na"),
        context.rat_name(),
        context.location.as_deref().unwrap_or("na"),
    )
}

pub struct GtpControlStage {
    name: String,
    handle: StageHandle,
    ports: Ports,
    ip_stage: Option<StageHandle>,
    writer: Option<BufWriter<File>>,
    file_prefix: Option<String>,
    file_postfix: Option<String>,
    current_file_size: u64,
    max_file_size: u64,
    /// Seconds without user-plane activity after which a context is purged
    /// at file rollover; 0 keeps contexts forever.
    tunnel_timeout: u64,
    contexts_written: u64,
}

impl GtpControlStage {
    pub fn new(
        name: &str,
        settings: &toml::value::Table,
        ports: Ports,
        handle: StageHandle,
        stages: &StageMap,
    ) -> Result<Self> {
        let ip_stage = match params::str(settings, "ipStage") {
            Some(stage_name) => Some(
                stages
                    .require(stage_name)
                    .with_context(|| format!("{}: ipStage", name))?,
            ),
            None => {
                log::warn!("{}: ipStage not set, unable to track tunnels", name);
                None
            }
        };
        let file_prefix = params::str(settings, "filePrefix").map(str::to_string);
        let file_postfix = params::str(settings, "filePostfix").map(str::to_string);
        if file_prefix.is_some() != file_postfix.is_some() {
            log::warn!("{}: filePrefix/filePostfix incomplete, context log disabled", name);
        }

        let mut stage = GtpControlStage {
            name: name.to_string(),
            handle,
            ports,
            ip_stage,
            writer: None,
            file_prefix,
            file_postfix,
            current_file_size: 0,
            max_file_size: params::u64(settings, "maxFileSize").unwrap_or(1 << 27),
            tunnel_timeout: 0,
            contexts_written: 0,
        };
        stage.apply_settings(settings);
        Ok(stage)
    }

    fn apply_settings(&mut self, settings: &toml::value::Table) {
        if let Some(timeout) = params::u64(settings, "tunnelTimeout") {
            self.tunnel_timeout = timeout;
            if timeout == 0 {
                log::warn!(
                    "{}: tunnel timeout is 0, stale contexts will not be purged; \
                     this can exhaust memory on long measurements",
                    self.name
                );
            } else {
                log::info!("{}: contexts time out after {}s", self.name, timeout);
            }
        }
        if let Some(size) = params::u64(settings, "maxFileSize") {
            self.max_file_size = size;
        }
    }

    fn output_enabled(&self) -> bool {
        self.file_prefix.is_some() && self.file_postfix.is_some()
    }

    /// Destination address of the outer IP header; GTP-C messages address
    /// the receiving node's endpoint.
    fn outer_dst(&self, packet: &PacketDescriptor) -> Option<Ipv4Addr> {
        let segment = packet.segment(self.ip_stage?)?;
        Ipv4Stage::addresses(segment).map(|(_, dst)| dst)
    }

    fn write_context(&mut self, state: &mut EngineState, context: &TunnelContext, deleted: Option<TimeVal>) {
        if !self.output_enabled() {
            return;
        }
        let record = format_context_record(context, deleted);
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write_all(record.as_bytes()) {
                log::error!("{}: writing context log failed: {}", self.name, e);
                state.stop = true;
                return;
            }
            self.contexts_written += 1;
            self.current_file_size += record.len() as u64;
            if self.max_file_size > 0 && self.current_file_size >= self.max_file_size {
                state.rotate = true;
            }
        }
    }

    /// Unlinks and logs a context.
    fn delete_context(
        &mut self,
        state: &mut EngineState,
        context: &TunnelRef,
        write: bool,
        deleted: Option<TimeVal>,
    ) {
        state.tunnels.remove(context);
        if write {
            let ctx = context.borrow();
            self.write_context(state, &ctx, deleted);
        }
    }

    fn handle_create_request_primary(
        &mut self,
        packet: &PacketDescriptor,
        ies: &[u8],
        state: &mut EngineState,
    ) {
        let no = packet.packet_number();
        let Some(common) = CommonIes::collect(ies, &self.name, no) else {
            return;
        };
        let (Some(control_ip), Some(data_ip)) = (common.control_ip, common.data_ip) else {
            log::warn!(
                "{}: invalid create request: cannot read node addresses (no. {})",
                self.name,
                no
            );
            return;
        };
        if common.data_teid == 0
            || common.control_teid == 0
            || common.subchannel == NO_SUBCHANNEL
            || common.user_id.is_none()
        {
            log::warn!(
                "{}: invalid create request: missing plane info, sub-channel or subscriber (no. {})",
                self.name,
                no
            );
            return;
        }

        let control_endpoint = TunnelEndpoint::new(control_ip, common.control_teid);
        let data_endpoint = TunnelEndpoint::new(data_ip, common.data_teid);

        // Requests originate on the access side.
        state.tunnels.register_role(data_ip, NodeRole::Access);

        if let Some(stale) = state.tunnels.lookup_control(&control_endpoint) {
            log::warn!(
                "{}: create request for an already known control endpoint, removing existing context (no. {})",
                self.name,
                no
            );
            self.delete_context(state, &stale, true, Some(packet.header().ts));
        }

        let mut context = TunnelContext::new(
            packet.header().ts,
            TunnelState::Creating,
            common.subchannel,
            common.user_id,
        );
        context.equipment_id = common.equipment_id;
        context.apn = common.apn;
        context.rat_type = common.rat_type;
        context.location = common.location;
        context.user_ip = common.user_ip;
        context.control.a = Some(control_endpoint);
        context.data.insert(
            common.subchannel,
            EndpointPair {
                a: Some(data_endpoint),
                b: None,
            },
        );

        let context = state.tunnels.adopt(context);
        state.tunnels.register_control(control_endpoint, &context);
        state.tunnels.register_data(data_endpoint, &context);
        if let Some(addr) = common.user_ip {
            state.tunnels.register_user_ip(addr, &context);
        }
    }

    fn handle_create_request_secondary(
        &mut self,
        packet: &PacketDescriptor,
        teid: u32,
        ies: &[u8],
        state: &mut EngineState,
    ) {
        let no = packet.packet_number();
        let Some(dst) = self.outer_dst(packet) else {
            log::warn!("{}: unable to find node address (no. {})", self.name, no);
            return;
        };
        let Some(common) = CommonIes::collect(ies, &self.name, no) else {
            return;
        };
        let Some(data_ip) = common.data_ip else {
            log::warn!(
                "{}: invalid create request (secondary): no data plane address (no. {})",
                self.name,
                no
            );
            return;
        };
        if common.data_teid == 0 || common.subchannel == NO_SUBCHANNEL {
            log::warn!(
                "{}: invalid create request (secondary): cannot read data plane info (no. {})",
                self.name,
                no
            );
            return;
        }

        let key = TunnelEndpoint::new(dst, teid);
        let Some(context) = state.tunnels.lookup_control(&key) else {
            log::warn!(
                "{}: create request (secondary) for non-existing context, dropping packet (no. {})",
                self.name,
                no
            );
            return;
        };
        if !context.borrow().is_established() {
            log::warn!(
                "{}: create request (secondary) for non-established context, dropping packet (no. {})",
                self.name,
                no
            );
            return;
        }

        state.tunnels.register_role(data_ip, NodeRole::Access);
        let data_endpoint = TunnelEndpoint::new(data_ip, common.data_teid);

        {
            let mut ctx = context.borrow_mut();
            let pair = if ctx.control.b.as_ref() == Some(&key) {
                EndpointPair {
                    a: Some(data_endpoint),
                    b: None,
                }
            } else if ctx.control.a.as_ref() == Some(&key) {
                EndpointPair {
                    a: None,
                    b: Some(data_endpoint),
                }
            } else {
                log::warn!(
                    "{}: create request (secondary) with unmatched control endpoint, dropping packet (no. {})",
                    self.name,
                    no
                );
                return;
            };
            ctx.data.insert(common.subchannel, pair);
            ctx.state = TunnelState::Creating;
            ctx.pending_subchannel = common.subchannel;
        }
        state.tunnels.register_data(data_endpoint, &context);
    }

    fn handle_create_response(
        &mut self,
        packet: &PacketDescriptor,
        teid: u32,
        ies: &[u8],
        state: &mut EngineState,
    ) {
        let no = packet.packet_number();
        if teid == 0 {
            log::warn!(
                "{}: create response to tunnel id 0, dropping packet (no. {})",
                self.name,
                no
            );
            return;
        }
        let Some(dst) = self.outer_dst(packet) else {
            log::warn!("{}: unable to find node address (no. {})", self.name, no);
            return;
        };
        let key = TunnelEndpoint::new(dst, teid);
        let Some(context) = state.tunnels.lookup_control(&key) else {
            log::warn!(
                "{}: create response for non-existing context, dropping packet (no. {})",
                self.name,
                no
            );
            return;
        };
        if context.borrow().state != TunnelState::Creating {
            log::warn!(
                "{}: create response for already created context, dropping packet (no. {})",
                self.name,
                no
            );
            return;
        }
        let Some(common) = CommonIes::collect(ies, &self.name, no) else {
            return;
        };

        if common.cause != Some(CAUSE_ACCEPTED) {
            log::info!("{}: create request rejected (no. {})", self.name, no);
            let (pending, primary) = {
                let ctx = context.borrow();
                (ctx.pending_subchannel, ctx.primary_subchannel)
            };
            if pending == primary {
                self.delete_context(state, &context, false, None);
            } else {
                // Detach only the pending secondary sub-channel.
                let pair = context.borrow_mut().data.remove(&pending);
                match pair {
                    Some(pair) => {
                        for endpoint in [pair.a, pair.b].into_iter().flatten() {
                            state.tunnels.unregister_data(&endpoint);
                        }
                    }
                    None => log::warn!(
                        "{}: unable to find secondary sub-channel to remove (no. {})",
                        self.name,
                        no
                    ),
                }
            }
            return;
        }

        let Some(data_ip) = common.data_ip.filter(|_| common.data_teid != 0) else {
            log::warn!(
                "{}: invalid create response: cannot read data plane info (no. {})",
                self.name,
                no
            );
            return;
        };

        if common.control_teid != 0 {
            let Some(control_ip) = common.control_ip else {
                log::warn!(
                    "{}: create response control endpoint without address (no. {})",
                    self.name,
                    no
                );
                return;
            };
            {
                let ctx = context.borrow();
                if ctx.pending_subchannel != ctx.primary_subchannel {
                    log::warn!(
                        "{}: create response with control endpoint for a secondary sub-channel, dropping packet (no. {})",
                        self.name,
                        no
                    );
                    return;
                }
                if ctx.is_established() {
                    log::warn!(
                        "{}: create response for already established context, dropping packet (no. {})",
                        self.name,
                        no
                    );
                    return;
                }
            }
            let control_endpoint = TunnelEndpoint::new(control_ip, common.control_teid);
            context.borrow_mut().control.b = Some(control_endpoint);
            state.tunnels.register_control(control_endpoint, &context);
        }

        // Responses originate on the gateway side.
        state.tunnels.register_role(data_ip, NodeRole::Gateway);
        let data_endpoint = TunnelEndpoint::new(data_ip, common.data_teid);

        let replaced = {
            let mut ctx = context.borrow_mut();
            let pending = ctx.pending_subchannel;
            let control = ctx.control;
            let Some(pair) = ctx.data.get_mut(&pending) else {
                drop(ctx);
                log::warn!(
                    "{}: cannot find data plane for create response, dropping context (no. {})",
                    self.name,
                    no
                );
                self.delete_context(state, &context, false, None);
                return;
            };
            // The response fills the half opposite the addressed endpoint.
            let slot = if control.b.as_ref() == Some(&key) {
                &mut pair.a
            } else if control.a.as_ref() == Some(&key) {
                &mut pair.b
            } else {
                log::warn!(
                    "{}: create response with unmatched control endpoint, dropping packet (no. {})",
                    self.name,
                    no
                );
                return;
            };
            let replaced = slot.replace(data_endpoint);
            ctx.state = TunnelState::Established;
            replaced
        };
        if let Some(old) = replaced {
            log::warn!(
                "{}: create response for already existing data endpoint (no. {})",
                self.name,
                no
            );
            state.tunnels.unregister_data(&old);
        }
        state.tunnels.register_data(data_endpoint, &context);

        if let Some(addr) = common.user_ip {
            // Stale contexts can own the address when delete signalling was
            // lost.
            if let Some(stale) = state.tunnels.lookup_user_ip(addr) {
                if !std::rc::Rc::ptr_eq(&stale, &context) {
                    log::warn!(
                        "{}: deleting stale context for {} (delete signalling probably lost)",
                        self.name,
                        addr
                    );
                    self.delete_context(state, &stale, true, None);
                }
            }
            context.borrow_mut().user_ip = Some(addr);
            state.tunnels.register_user_ip(addr, &context);
        }
    }

    fn handle_update_request(
        &mut self,
        packet: &PacketDescriptor,
        teid: u32,
        ies: &[u8],
        state: &mut EngineState,
    ) {
        let no = packet.packet_number();
        let Some(dst) = self.outer_dst(packet) else {
            log::warn!("{}: unable to find node address (no. {})", self.name, no);
            return;
        };
        let key = TunnelEndpoint::new(dst, teid);
        let Some(context) = state.tunnels.lookup_control(&key) else {
            // Frequent where only part of the access network is monitored.
            log::info!(
                "{}: update request for non-existing context, dropping packet (no. {})",
                self.name,
                no
            );
            return;
        };
        let Some(common) = CommonIes::collect(ies, &self.name, no) else {
            return;
        };
        if common.data_teid == 0 || common.data_ip.is_none() || common.subchannel == NO_SUBCHANNEL
        {
            // Gateway-initiated updates carry these fields optionally only.
            log::debug!("{}: update request carries no endpoints (no. {})", self.name, no);
            return;
        }
        let data_ip = common.data_ip.unwrap();

        if self.replace_endpoints(state, &context, &key, &common, data_ip, NodeRole::Access, no) {
            let mut ctx = context.borrow_mut();
            ctx.state = TunnelState::Updating;
            ctx.pending_subchannel = common.subchannel;
        }
    }

    fn handle_update_response(
        &mut self,
        packet: &PacketDescriptor,
        teid: u32,
        ies: &[u8],
        state: &mut EngineState,
    ) {
        let no = packet.packet_number();
        let Some(dst) = self.outer_dst(packet) else {
            log::warn!("{}: unable to find node address (no. {})", self.name, no);
            return;
        };
        let key = TunnelEndpoint::new(dst, teid);
        let Some(context) = state.tunnels.lookup_control(&key) else {
            log::info!(
                "{}: update response for non-existing context, dropping packet (no. {})",
                self.name,
                no
            );
            return;
        };
        let Some(common) = CommonIes::collect(ies, &self.name, no) else {
            return;
        };
        if common.data_teid == 0 || common.data_ip.is_none() {
            log::debug!("{}: update response carries no endpoints (no. {})", self.name, no);
            return;
        }
        let data_ip = common.data_ip.unwrap();
        if !context.borrow().control.is_complete() {
            log::warn!(
                "{}: update response for context without complete control pair, dropping packet (no. {})",
                self.name,
                no
            );
            return;
        }

        let mut common = common;
        common.subchannel = context.borrow().pending_subchannel;
        if self.replace_endpoints(state, &context, &key, &common, data_ip, NodeRole::Gateway, no) {
            context.borrow_mut().state = TunnelState::Established;
        }
    }

    /// Replaces the control (when present) and data endpoint halves opposite
    /// the addressed control endpoint `key`. Returns false when the message
    /// did not match the context's endpoints.
    #[allow(clippy::too_many_arguments)]
    fn replace_endpoints(
        &mut self,
        state: &mut EngineState,
        context: &TunnelRef,
        key: &TunnelEndpoint,
        common: &CommonIes,
        data_ip: Ipv4Addr,
        role: NodeRole,
        no: u64,
    ) -> bool {
        if common.control_teid != 0 {
            if let Some(control_ip) = common.control_ip {
                if common.subchannel != context.borrow().primary_subchannel {
                    log::warn!(
                        "{}: control endpoint update for a secondary sub-channel (no. {})",
                        self.name,
                        no
                    );
                }
                let new_endpoint = TunnelEndpoint::new(control_ip, common.control_teid);
                let old = {
                    let mut ctx = context.borrow_mut();
                    if ctx.control.b.as_ref() == Some(key) {
                        ctx.control.a.replace(new_endpoint)
                    } else if ctx.control.a.as_ref() == Some(key) {
                        ctx.control.b.replace(new_endpoint)
                    } else {
                        None
                    }
                };
                if let Some(old) = old {
                    state.tunnels.unregister_control(&old);
                }
                state.tunnels.register_control(new_endpoint, context);
            }
        }

        state.tunnels.register_role(data_ip, role);
        let data_endpoint = TunnelEndpoint::new(data_ip, common.data_teid);
        let old = {
            let mut ctx = context.borrow_mut();
            let control = ctx.control;
            let Some(pair) = ctx.data.get_mut(&common.subchannel) else {
                drop(ctx);
                log::warn!(
                    "{}: endpoint update for non-existing sub-channel, dropping packet (no. {})",
                    self.name,
                    no
                );
                return false;
            };
            if control.b.as_ref() == Some(key) {
                pair.a.replace(data_endpoint)
            } else if control.a.as_ref() == Some(key) {
                pair.b.replace(data_endpoint)
            } else {
                log::warn!(
                    "{}: endpoint update with unmatched control endpoint, dropping packet (no. {})",
                    self.name,
                    no
                );
                return false;
            }
        };
        if let Some(old) = old {
            state.tunnels.unregister_data(&old);
        }
        state.tunnels.register_data(data_endpoint, context);
        true
    }

    fn handle_delete_request(
        &mut self,
        packet: &PacketDescriptor,
        teid: u32,
        state: &mut EngineState,
    ) {
        let no = packet.packet_number();
        if teid == 0 {
            log::warn!(
                "{}: delete request to tunnel id 0, dropping packet (no. {})",
                self.name,
                no
            );
            return;
        }
        let Some(dst) = self.outer_dst(packet) else {
            log::warn!("{}: unable to find node address (no. {})", self.name, no);
            return;
        };
        let key = TunnelEndpoint::new(dst, teid);
        match state.tunnels.lookup_control(&key) {
            Some(context) => {
                self.delete_context(state, &context, true, Some(packet.header().ts))
            }
            None => log::info!(
                "{}: delete request for non-existing context, dropping packet (no. {})",
                self.name,
                no
            ),
        }
    }

    fn handle_sgsn_response(
        &mut self,
        packet: &PacketDescriptor,
        ies: &[u8],
        state: &mut EngineState,
    ) {
        let no = packet.packet_number();
        let mut user_id: Option<DeviceId> = None;
        let mut inherited: Option<TunnelRef> = None;

        let mut cursor = IeCursor::new(ies);
        loop {
            let ie = match cursor.next() {
                Ok(Some(ie)) => ie,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("{}: {}, dropping packet (no. {})", self.name, e, no);
                    return;
                }
            };
            match ie.ie_type {
                IE_CAUSE => {
                    if ie.value[0] != CAUSE_ACCEPTED {
                        log::info!("{}: rejected SGSN context update (no. {})", self.name, no);
                        return;
                    }
                }
                IE_IMSI => user_id = DeviceId::from_tbcd(ie.value),
                IE_PDP_CONTEXT => {
                    let Some(pdp) = parse_sgsn_pdp(ie.raw) else {
                        log::warn!(
                            "{}: unable to parse migrated context, dropping packet (no. {})",
                            self.name,
                            no
                        );
                        return;
                    };
                    let key = TunnelEndpoint::new(pdp.control_ip, pdp.control_teid);

                    if inherited.is_none() {
                        if let Some(existing) = state.tunnels.lookup_control(&key) {
                            if existing.borrow().user_id != user_id {
                                log::warn!(
                                    "{}: SGSN migration replaces context with different subscriber (no. {})",
                                    self.name,
                                    no
                                );
                                self.delete_context(
                                    state,
                                    &existing,
                                    true,
                                    Some(packet.header().ts),
                                );
                            } else {
                                log::debug!(
                                    "{}: SGSN migration for already known context (no. {})",
                                    self.name,
                                    no
                                );
                                return;
                            }
                        }
                    }

                    let attach_secondary = inherited
                        .as_ref()
                        .map(|ctx| ctx.borrow().control.a.as_ref() == Some(&key))
                        .unwrap_or(false);
                    let data_endpoint = TunnelEndpoint::new(pdp.data_ip, pdp.data_teid);

                    if attach_secondary {
                        let context = inherited.as_ref().unwrap();
                        context.borrow_mut().data.insert(
                            pdp.subchannel,
                            EndpointPair {
                                a: Some(data_endpoint),
                                b: None,
                            },
                        );
                        state.tunnels.register_data(data_endpoint, context);
                    } else {
                        let mut context = TunnelContext::new(
                            packet.header().ts,
                            TunnelState::Established,
                            pdp.subchannel,
                            user_id,
                        );
                        context.control.a = Some(key);
                        context.user_ip = Some(pdp.user_ip);
                        context.data.insert(
                            pdp.subchannel,
                            EndpointPair {
                                a: Some(data_endpoint),
                                b: None,
                            },
                        );
                        let context = state.tunnels.adopt(context);
                        state.tunnels.register_control(key, &context);
                        state.tunnels.register_data(data_endpoint, &context);
                        state.tunnels.register_user_ip(pdp.user_ip, &context);
                        inherited = Some(context);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Fields of a migrated context carried inside an SGSN response.
struct SgsnPdp {
    subchannel: u8,
    control_teid: u32,
    data_teid: u32,
    user_ip: Ipv4Addr,
    control_ip: Ipv4Addr,
    data_ip: Ipv4Addr,
}

/// Parses the packed PDP context information element (`b` includes the type
/// and length bytes). The element nests quality profiles of variable length,
/// hence the hop-by-hop walk.
fn parse_sgsn_pdp(b: &[u8]) -> Option<SgsnPdp> {
    let at = |i: usize| b.get(i).copied();
    let subchannel = at(3)? & 0x0f;

    let mut p: usize = 1;
    p += at(p + 4)? as usize + 5; // quality profile (subscribed)
    p += at(p)? as usize + 1; // quality profile (requested)
    p += at(p)? as usize + 7; // quality profile (negotiated) + flags

    if b.len() < p + 8 {
        return None;
    }
    let control_teid = be_u32(b, p);
    p += 4;
    let data_teid = be_u32(b, p);
    p += 7;

    if b.len() < p + 5 {
        return None;
    }
    let user_ip = ipv4_at(b, p + 1);
    p += at(p)? as usize + 1;

    if at(p)? != 4 {
        return None; // only IPv4 node addresses are handled
    }
    p += 1;
    if b.len() < p + 4 {
        return None;
    }
    let control_ip = ipv4_at(b, p);
    p += 4;

    if at(p)? != 4 {
        return None;
    }
    p += 1;
    if b.len() < p + 4 {
        return None;
    }
    let data_ip = ipv4_at(b, p);

    if control_teid == 0 || data_teid == 0 || subchannel == NO_SUBCHANNEL {
        return None;
    }
    Some(SgsnPdp {
        subchannel,
        control_teid,
        data_teid,
        user_ip,
        control_ip,
        data_ip,
    })
}

impl Stage for GtpControlStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_packet(&mut self, packet: &mut PacketDescriptor, state: &mut EngineState) -> Verdict {
        let header = match gtp::peel(packet.payload()) {
            Ok(header) => header,
            Err(e) => {
                log::warn!(
                    "{}: {}, dropping packet (no. {})",
                    self.name,
                    e,
                    packet.packet_number()
                );
                return Verdict::Unparsed;
            }
        };

        let payload_len = packet.payload().len();
        if payload_len < header.header_len + header.ies_len {
            log::warn!(
                "{}: payload too short for the declared GTP-C message, dropping packet (no. {})",
                self.name,
                packet.packet_number()
            );
            return Verdict::Unparsed;
        }

        // The control stage claims the whole message.
        packet.push_layer(self.handle, payload_len);

        if header.ies_len == 0 {
            log::debug!(
                "{}: GTP-C message carries no information elements (no. {})",
                self.name,
                packet.packet_number()
            );
            return Verdict::Drop;
        }
        if self.ip_stage.is_none() {
            return self.ports.forward_default();
        }

        let segment = packet
            .segment(self.handle)
            .expect("own layer pushed above");
        let ies = &segment[header.header_len..header.header_len + header.ies_len];

        match header.msg_type {
            MESSAGE_TYPE_CREATE_REQUEST => {
                if header.teid == 0 {
                    self.handle_create_request_primary(packet, ies, state);
                } else {
                    self.handle_create_request_secondary(packet, header.teid, ies, state);
                }
            }
            MESSAGE_TYPE_CREATE_RESPONSE => {
                self.handle_create_response(packet, header.teid, ies, state)
            }
            MESSAGE_TYPE_UPDATE_REQUEST => {
                if header.teid != 0 {
                    self.handle_update_request(packet, header.teid, ies, state);
                }
            }
            MESSAGE_TYPE_UPDATE_RESPONSE => {
                self.handle_update_response(packet, header.teid, ies, state)
            }
            MESSAGE_TYPE_DELETE_REQUEST => self.handle_delete_request(packet, header.teid, state),
            MESSAGE_TYPE_DELETE_RESPONSE | MESSAGE_TYPE_SGSN_REQUEST
            | MESSAGE_TYPE_SGSN_ACKNOWLEDGEMENT => {
                // Nothing to learn: deletes already happened on the request,
                // the request/ack legs of a migration carry no endpoints.
            }
            MESSAGE_TYPE_SGSN_RESPONSE => self.handle_sgsn_response(packet, ies, state),
            other => {
                log::debug!(
                    "{}: not processing GTP-C message of type {} (no. {})",
                    self.name,
                    other,
                    packet.packet_number()
                );
            }
        }

        self.ports.forward_default()
    }

    fn configure(&mut self, settings: &toml::value::Table) {
        self.apply_settings(settings);
    }

    fn get_status(&mut self, state: &EngineState, _: u64, _: u64) -> String {
        let (access, gateway) = state.tunnels.role_counts();
        format!(
            "control tunnels: {}, data tunnels: {}, user IPs: {}, access IPs: {}, gateway IPs: {}, contexts written: {}",
            state.tunnels.control_count(),
            state.tunnels.data_count(),
            state.tunnels.user_ip_count(),
            access,
            gateway,
            self.contexts_written,
        )
    }

    fn open_new_files(&mut self, state: &mut EngineState) {
        if self.output_enabled() {
            let prefix = self.file_prefix.clone().unwrap();
            let postfix = self.file_postfix.clone().unwrap();
            match state.files.open(&prefix, &postfix) {
                Ok(writer) => {
                    self.writer = Some(writer);
                    self.current_file_size = 0;
                }
                Err(e) => {
                    log::error!("{}: {:#}", self.name, e);
                    state.stop = true;
                    return;
                }
            }
        }

        // Purge contexts without user-plane activity at rollover.
        if self.tunnel_timeout > 0 {
            let now = state.current_time;
            let timeout = self.tunnel_timeout;
            let mut purged = Vec::new();
            state.tunnels.purge_inactive(now, timeout, |ctx| purged.push(ctx));
            for context in purged {
                let ctx = context.borrow();
                self.write_context(state, &ctx, None);
            }
        }
    }

    fn drain(&mut self, state: &mut EngineState) {
        let mut all = Vec::new();
        state.tunnels.drain(|ctx| all.push(ctx));
        for context in all {
            let ctx = context.borrow();
            self.write_context(state, &ctx, None);
        }
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::CaptureHeader;
    use crate::stage::tests_support;
    use crate::time::TimeVal;

    const IP_HANDLE: usize = 1;
    const GTPC_HANDLE: usize = 5;

    fn ie_tv(ie_type: u8, value: &[u8]) -> Vec<u8> {
        let mut ie = vec![ie_type];
        ie.extend_from_slice(value);
        ie
    }

    fn ie_tlv(ie_type: u8, value: &[u8]) -> Vec<u8> {
        let mut ie = vec![ie_type];
        ie.extend_from_slice(&(value.len() as u16).to_be_bytes());
        ie.extend_from_slice(value);
        ie
    }

    fn stage() -> GtpControlStage {
        let mut stages = StageMap::default();
        stages.insert("ip", StageHandle::for_tests(IP_HANDLE));
        let mut settings = toml::value::Table::new();
        settings.insert("ipStage".into(), toml::Value::String("ip".into()));
        GtpControlStage::new(
            "gtpc",
            &settings,
            Ports::new(None, vec![]),
            StageHandle::for_tests(GTPC_HANDLE),
            &stages,
        )
        .unwrap()
    }

    fn message(src: [u8; 4], dst: [u8; 4], msg_type: u8, teid: u32, ies: &[u8]) -> PacketDescriptor {
        let gtp = gtp::tests::build(msg_type, teid, ies, false);
        let ip = crate::protocols::ipv4::tests::header(src, dst, 17, 0);
        let mut bytes = ip[..20].to_vec();
        bytes.extend_from_slice(&gtp);

        let mut packet = PacketDescriptor::new();
        packet.load(
            CaptureHeader {
                ts: TimeVal::new(100, 0),
                caplen: bytes.len() as u32,
                origlen: bytes.len() as u32,
            },
            &bytes,
            1,
        );
        packet.push_layer(StageHandle::for_tests(IP_HANDLE), 20);
        packet
    }

    const SGSN: [u8; 4] = [10, 1, 0, 1];
    const SGSN_DATA: [u8; 4] = [10, 1, 0, 2];
    const GGSN: [u8; 4] = [10, 2, 0, 1];
    const GGSN_DATA: [u8; 4] = [10, 2, 0, 2];
    const IMSI_TBCD: [u8; 8] = [0x21, 0x43, 0x65, 0x87, 0x09, 0x21, 0x43, 0xf5];

    fn create_request() -> Vec<u8> {
        let mut ies = vec![];
        ies.extend(ie_tv(IE_IMSI, &IMSI_TBCD));
        ies.extend(ie_tv(IE_DATA_TEID, &0x100u32.to_be_bytes()));
        ies.extend(ie_tv(IE_CONTROL_TEID, &0x200u32.to_be_bytes()));
        ies.extend(ie_tv(IE_NSAPI, &[5]));
        ies.extend(ie_tlv(IE_USER_IP, &[0xf1, 0x21, 172, 16, 0, 9]));
        ies.extend(ie_tlv(IE_APN, b"\x08internet\x03apn"));
        ies.extend(ie_tlv(IE_GSN_ADDRESS, &SGSN));
        ies.extend(ie_tlv(IE_GSN_ADDRESS, &SGSN_DATA));
        ies.extend(ie_tlv(IE_RAT_TYPE, &[1]));
        ies
    }

    fn create_response() -> Vec<u8> {
        let mut ies = vec![];
        ies.extend(ie_tv(IE_CAUSE, &[CAUSE_ACCEPTED]));
        ies.extend(ie_tv(IE_DATA_TEID, &0x300u32.to_be_bytes()));
        ies.extend(ie_tv(IE_CONTROL_TEID, &0x400u32.to_be_bytes()));
        ies.extend(ie_tlv(IE_USER_IP, &[0xf1, 0x21, 172, 16, 0, 9]));
        ies.extend(ie_tlv(IE_GSN_ADDRESS, &GGSN));
        ies.extend(ie_tlv(IE_GSN_ADDRESS, &GGSN_DATA));
        ies
    }

    fn establish(stage: &mut GtpControlStage, state: &mut EngineState) {
        let mut request = message(SGSN, GGSN, MESSAGE_TYPE_CREATE_REQUEST, 0, &create_request());
        stage.process_packet(&mut request, state);
        let mut response =
            message(GGSN, SGSN, MESSAGE_TYPE_CREATE_RESPONSE, 0x200, &create_response());
        stage.process_packet(&mut response, state);
    }

    #[test]
    fn create_handshake_establishes_context() {
        let mut stage = stage();
        let mut state = tests_support::state();
        establish(&mut stage, &mut state);

        let sgsn_half = TunnelEndpoint::new(SGSN.into(), 0x200);
        let ggsn_half = TunnelEndpoint::new(GGSN.into(), 0x400);
        let context = state.tunnels.lookup_control(&sgsn_half).expect("context");
        assert!(state.tunnels.lookup_control(&ggsn_half).is_some());

        {
            let ctx = context.borrow();
            assert_eq!(ctx.state, TunnelState::Established);
            assert!(ctx.is_established());
            assert_eq!(ctx.user_id.unwrap().to_string(), "123456789012345");
            assert_eq!(ctx.apn.as_deref(), Some("internet.apn"));
            assert_eq!(ctx.rat_name(), "UTRAN");
            assert_eq!(ctx.user_ip, Some("172.16.0.9".parse().unwrap()));
            let pair = ctx.data.get(&5).expect("primary sub-channel");
            assert_eq!(pair.a, Some(TunnelEndpoint::new(SGSN_DATA.into(), 0x100)));
            assert_eq!(pair.b, Some(TunnelEndpoint::new(GGSN_DATA.into(), 0x300)));
        }

        assert_eq!(state.tunnels.role_of(SGSN_DATA.into()), Some(NodeRole::Access));
        assert_eq!(state.tunnels.role_of(GGSN_DATA.into()), Some(NodeRole::Gateway));
        assert!(state
            .tunnels
            .touch_data(&TunnelEndpoint::new(GGSN_DATA.into(), 0x300), TimeVal::new(101, 0))
            .is_some());
        assert!(state.tunnels.lookup_user_ip("172.16.0.9".parse().unwrap()).is_some());
    }

    #[test]
    fn rejected_create_removes_the_pending_context() {
        let mut stage = stage();
        let mut state = tests_support::state();
        let mut request = message(SGSN, GGSN, MESSAGE_TYPE_CREATE_REQUEST, 0, &create_request());
        stage.process_packet(&mut request, &mut state);
        assert_eq!(state.tunnels.control_count(), 1);

        let mut ies = create_response();
        ies[1] = 200; // cause: rejected
        let mut response = message(GGSN, SGSN, MESSAGE_TYPE_CREATE_RESPONSE, 0x200, &ies);
        stage.process_packet(&mut response, &mut state);
        assert_eq!(state.tunnels.control_count(), 0);
        assert_eq!(state.tunnels.data_count(), 0);
    }

    #[test]
    fn delete_request_purges_immediately() {
        let mut stage = stage();
        let mut state = tests_support::state();
        establish(&mut stage, &mut state);
        assert_eq!(state.tunnels.control_count(), 2);

        let mut delete = message(GGSN, SGSN, MESSAGE_TYPE_DELETE_REQUEST, 0x200, &ie_tv(19, &[1]));
        stage.process_packet(&mut delete, &mut state);
        assert_eq!(state.tunnels.control_count(), 0);
        assert_eq!(state.tunnels.data_count(), 0);
        assert_eq!(state.tunnels.user_ip_count(), 0);
    }

    #[test]
    fn update_replaces_the_opposite_data_half() {
        let mut stage = stage();
        let mut state = tests_support::state();
        establish(&mut stage, &mut state);

        // A relocated access node announces a new data endpoint; the message
        // is addressed to the gateway's control half.
        let new_data: [u8; 4] = [10, 1, 0, 3];
        let mut ies = vec![];
        ies.extend(ie_tv(IE_DATA_TEID, &0x500u32.to_be_bytes()));
        ies.extend(ie_tv(IE_NSAPI, &[5]));
        ies.extend(ie_tlv(IE_GSN_ADDRESS, &SGSN));
        ies.extend(ie_tlv(IE_GSN_ADDRESS, &new_data));
        let mut update = message(SGSN, GGSN, MESSAGE_TYPE_UPDATE_REQUEST, 0x400, &ies);
        stage.process_packet(&mut update, &mut state);

        let context = state
            .tunnels
            .lookup_control(&TunnelEndpoint::new(GGSN.into(), 0x400))
            .unwrap();
        {
            let ctx = context.borrow();
            assert_eq!(ctx.state, TunnelState::Updating);
            let pair = ctx.data.get(&5).unwrap();
            assert_eq!(pair.a, Some(TunnelEndpoint::new(new_data.into(), 0x500)));
        }
        // The old access data endpoint is gone, the new one resolves.
        assert!(state
            .tunnels
            .touch_data(&TunnelEndpoint::new(SGSN_DATA.into(), 0x100), TimeVal::new(101, 0))
            .is_none());
        assert!(state
            .tunnels
            .touch_data(&TunnelEndpoint::new(new_data.into(), 0x500), TimeVal::new(101, 0))
            .is_some());
    }

    #[test]
    fn unknown_low_type_ie_aborts_the_message() {
        let mut stage = stage();
        let mut state = tests_support::state();
        let mut ies = create_request();
        ies.splice(0..0, ie_tv(99, &[0]).into_iter().take(1)); // bare unknown type byte
        let mut request = message(SGSN, GGSN, MESSAGE_TYPE_CREATE_REQUEST, 0, &ies);
        stage.process_packet(&mut request, &mut state);
        assert_eq!(state.tunnels.control_count(), 0);
    }

    #[test]
    fn context_record_layout() {
        let mut context = TunnelContext::new(
            TimeVal::new(100, 500),
            TunnelState::Established,
            5,
            DeviceId::from_tbcd(&IMSI_TBCD),
        );
        context.user_ip = Some("172.16.0.9".parse().unwrap());
        context.apn = Some("internet.apn".to_string());
        context.rat_type = 2;
        assert_eq!(
            format_context_record(&context, Some(TimeVal::new(200, 0))),
            "100.000500|200.000000|123456789012345|na|172.16.0.9|internet.apn|GERAN|na\n"
        );
        assert_eq!(
            format_context_record(&context, None),
            "100.000500|na|123456789012345|na|172.16.0.9|internet.apn|GERAN|na\n"
        );
    }

    #[test]
    fn apn_and_location_decoding() {
        assert_eq!(decode_apn(b"\x08internet"), Some("internet".to_string()));
        assert_eq!(decode_apn(b"\x03apn\x02hu"), Some("apn.hu".to_string()));
        assert_eq!(decode_apn(b"\x09oops"), None, "label exceeds element");

        // MCC 216, MNC 30, LAC 0x1234, CI 0x5678.
        let loc = [0, 0x12, 0xf6, 0x03, 0x12, 0x34, 0x56, 0x78];
        assert_eq!(decode_location(&loc), Some("216:30:4660:22136".to_string()));
    }
}
