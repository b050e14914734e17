//! Tunnel contexts established by control-plane signalling.
//!
//! A context binds a subscriber to the endpoints of its tunnel: a
//! bidirectional control endpoint pair plus one data endpoint pair per
//! sub-channel. The table indexes contexts by control endpoint, by data
//! endpoint and by the tunnelled user address; all indexes share ownership
//! of the context. A serial-keyed time-sorted list tracks last activity so
//! stale contexts can be purged from its head.

use crate::ids::DeviceId;
use crate::store::{TimeSortedMap, Timestamped};
use crate::time::TimeVal;

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::rc::Rc;

/// Shared handle to a tunnel context.
pub type TunnelRef = Rc<RefCell<TunnelContext>>;

/// One direction of a tunnel: the identifier together with the address that
/// owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TunnelEndpoint {
    pub addr: Ipv4Addr,
    pub teid: u32,
}

impl TunnelEndpoint {
    pub fn new(addr: Ipv4Addr, teid: u32) -> Self {
        TunnelEndpoint { addr, teid }
    }
}

/// Both directions of a control or data connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct EndpointPair {
    /// The half learned from the request (access side).
    pub a: Option<TunnelEndpoint>,
    /// The half learned from the response (gateway side).
    pub b: Option<TunnelEndpoint>,
}

impl EndpointPair {
    pub fn is_complete(&self) -> bool {
        self.a.is_some() && self.b.is_some()
    }

}

/// Role of a core-network node address, learned from signalling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Access side (serving node); traffic sourced here goes uplink.
    Access,
    /// Gateway side; traffic sourced here goes downlink.
    Gateway,
}

/// Lifecycle of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Creating,
    Established,
    Updating,
}

/// Per-subscriber tunnel state.
#[derive(Debug)]
pub struct TunnelContext {
    pub serial: u64,
    pub created: TimeVal,
    last_activity: TimeVal,
    pub state: TunnelState,
    /// Sub-channel the pending create/update refers to.
    pub pending_subchannel: u8,
    pub primary_subchannel: u8,
    pub user_id: Option<DeviceId>,
    pub equipment_id: Option<DeviceId>,
    pub user_ip: Option<Ipv4Addr>,
    pub apn: Option<String>,
    pub rat_type: u8,
    pub location: Option<String>,
    pub control: EndpointPair,
    /// Data endpoint pairs per sub-channel id.
    pub data: BTreeMap<u8, EndpointPair>,
}

impl TunnelContext {
    pub fn new(created: TimeVal, state: TunnelState, subchannel: u8, user_id: Option<DeviceId>) -> Self {
        TunnelContext {
            serial: 0,
            created,
            last_activity: created,
            state,
            pending_subchannel: subchannel,
            primary_subchannel: subchannel,
            user_id,
            equipment_id: None,
            user_ip: None,
            apn: None,
            rat_type: 0,
            location: None,
            control: EndpointPair::default(),
            data: BTreeMap::new(),
        }
    }

    pub fn is_established(&self) -> bool {
        self.control.is_complete()
    }

    pub fn touch(&mut self, ts: TimeVal) {
        self.last_activity = ts;
    }

    /// Textual radio technology tag for the context log.
    pub fn rat_name(&self) -> &'static str {
        match self.rat_type {
            0 => "na",
            1 => "UTRAN",
            2 => "GERAN",
            3 => "WLAN",
            _ => "invalid_RAT",
        }
    }
}

impl Timestamped for TunnelContext {
    fn last_activity(&self) -> TimeVal {
        self.last_activity
    }
}

/// The engine's tunnel state: contexts with their indexes and the node-role
/// map used to orient user-plane traffic.
pub struct TunnelTable {
    next_serial: u64,
    /// Activity-ordered list; timeout 0, purged explicitly.
    list: TimeSortedMap<u64, TunnelRef>,
    control: HashMap<TunnelEndpoint, TunnelRef>,
    data: HashMap<TunnelEndpoint, TunnelRef>,
    by_user_ip: HashMap<Ipv4Addr, TunnelRef>,
    roles: HashMap<Ipv4Addr, NodeRole>,
}

impl TunnelTable {
    pub fn new() -> Self {
        TunnelTable {
            next_serial: 0,
            list: TimeSortedMap::new(),
            control: HashMap::new(),
            data: HashMap::new(),
            by_user_ip: HashMap::new(),
            roles: HashMap::new(),
        }
    }

    /// Takes ownership of a fresh context, assigning its serial and placing
    /// it at the tail of the activity list.
    pub fn adopt(&mut self, mut context: TunnelContext) -> TunnelRef {
        self.next_serial += 1;
        context.serial = self.next_serial;
        let context = Rc::new(RefCell::new(context));
        self.list.insert(self.next_serial, Rc::clone(&context));
        context
    }

    pub fn register_control(&mut self, endpoint: TunnelEndpoint, context: &TunnelRef) {
        self.control.insert(endpoint, Rc::clone(context));
    }

    pub fn unregister_control(&mut self, endpoint: &TunnelEndpoint) {
        self.control.remove(endpoint);
    }

    pub fn register_data(&mut self, endpoint: TunnelEndpoint, context: &TunnelRef) {
        self.data.insert(endpoint, Rc::clone(context));
    }

    pub fn unregister_data(&mut self, endpoint: &TunnelEndpoint) {
        self.data.remove(endpoint);
    }

    pub fn register_user_ip(&mut self, addr: Ipv4Addr, context: &TunnelRef) {
        self.by_user_ip.insert(addr, Rc::clone(context));
    }

    pub fn lookup_control(&self, endpoint: &TunnelEndpoint) -> Option<TunnelRef> {
        self.control.get(endpoint).map(Rc::clone)
    }

    pub fn lookup_user_ip(&self, addr: Ipv4Addr) -> Option<TunnelRef> {
        self.by_user_ip.get(&addr).map(Rc::clone)
    }

    /// Data-endpoint lookup on the user plane; refreshes the context's
    /// activity and its list position.
    pub fn touch_data(&mut self, endpoint: &TunnelEndpoint, ts: TimeVal) -> Option<TunnelRef> {
        let context = self.data.get(endpoint).map(Rc::clone)?;
        let serial = {
            let mut ctx = context.borrow_mut();
            ctx.touch(ts);
            ctx.serial
        };
        self.list.move_to_end(&serial);
        Some(context)
    }

    /// Learns a node's role; conflicting signalling is reported once per
    /// occurrence and the first role wins.
    pub fn register_role(&mut self, addr: Ipv4Addr, role: NodeRole) {
        match self.roles.get(&addr) {
            None => {
                self.roles.insert(addr, role);
            }
            Some(previous) if *previous != role => {
                log::warn!(
                    "inconsistent node role for {}: trying to set {:?}, previous one was {:?}",
                    addr,
                    role,
                    previous
                );
            }
            Some(_) => {}
        }
    }

    pub fn role_of(&self, addr: Ipv4Addr) -> Option<NodeRole> {
        self.roles.get(&addr).copied()
    }

    /// Unlinks the context from every index and the activity list. The
    /// caller keeps its handle for emission.
    pub fn remove(&mut self, context: &TunnelRef) {
        self.unlink_indexes(context);
        let serial = context.borrow().serial;
        self.list.remove(&serial);
    }

    /// Purges contexts whose last user-plane activity is older than
    /// `timeout` seconds before `now`, handing each to `callback` after
    /// unlinking. A timeout of zero purges nothing.
    pub fn purge_inactive<F>(&mut self, now: TimeVal, timeout: u64, mut callback: F)
    where
        F: FnMut(TunnelRef),
    {
        if timeout == 0 {
            return;
        }
        let mut expired = Vec::new();
        self.list.set_timeout(timeout);
        self.list.cleanup(Some(now), |context| expired.push(context));
        self.list.set_timeout(0);
        for context in expired {
            self.unlink_indexes(&context);
            callback(context);
        }
    }

    /// Removes every context, handing each to `callback`.
    pub fn drain<F>(&mut self, mut callback: F)
    where
        F: FnMut(TunnelRef),
    {
        let mut all = Vec::new();
        self.list.cleanup(None, |context| all.push(context));
        for context in all {
            self.unlink_indexes(&context);
            callback(context);
        }
    }

    fn unlink_indexes(&mut self, context: &TunnelRef) {
        let ctx = context.borrow();
        if let Some(endpoint) = ctx.control.a {
            self.control.remove(&endpoint);
        }
        if let Some(endpoint) = ctx.control.b {
            self.control.remove(&endpoint);
        }
        for pair in ctx.data.values() {
            for endpoint in [pair.a, pair.b].into_iter().flatten() {
                self.data.remove(&endpoint);
            }
        }
        if let Some(addr) = ctx.user_ip {
            if let Some(owner) = self.by_user_ip.get(&addr) {
                if Rc::ptr_eq(owner, context) {
                    self.by_user_ip.remove(&addr);
                }
            }
        }
    }

    pub fn control_count(&self) -> usize {
        self.control.len()
    }

    pub fn data_count(&self) -> usize {
        self.data.len()
    }

    pub fn user_ip_count(&self) -> usize {
        self.by_user_ip.len()
    }

    pub fn role_counts(&self) -> (usize, usize) {
        let access = self
            .roles
            .values()
            .filter(|r| **r == NodeRole::Access)
            .count();
        (access, self.roles.len() - access)
    }
}

impl Default for TunnelTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(table: &mut TunnelTable, sec: i64, teid: u32) -> TunnelRef {
        let created = TimeVal::new(sec, 0);
        let ctx = table.adopt(TunnelContext::new(created, TunnelState::Creating, 5, None));
        let control = TunnelEndpoint::new(Ipv4Addr::new(10, 1, 0, 1), teid);
        let data = TunnelEndpoint::new(Ipv4Addr::new(10, 2, 0, 1), teid);
        ctx.borrow_mut().control.a = Some(control);
        ctx.borrow_mut().data.insert(5, EndpointPair {
            a: Some(data),
            b: None,
        });
        table.register_control(control, &ctx);
        table.register_data(data, &ctx);
        ctx
    }

    #[test]
    fn data_lookup_touches_activity() {
        let mut table = TunnelTable::new();
        let ctx = context(&mut table, 100, 1);
        let endpoint = TunnelEndpoint::new(Ipv4Addr::new(10, 2, 0, 1), 1);

        let hit = table.touch_data(&endpoint, TimeVal::new(500, 0)).unwrap();
        assert!(Rc::ptr_eq(&hit, &ctx));
        assert_eq!(ctx.borrow().last_activity(), TimeVal::new(500, 0));

        let miss = TunnelEndpoint::new(Ipv4Addr::new(10, 2, 0, 1), 99);
        assert!(table.touch_data(&miss, TimeVal::new(501, 0)).is_none());
    }

    #[test]
    fn remove_unlinks_every_index() {
        let mut table = TunnelTable::new();
        let ctx = context(&mut table, 100, 1);
        ctx.borrow_mut().user_ip = Some(Ipv4Addr::new(172, 16, 0, 9));
        table.register_user_ip(Ipv4Addr::new(172, 16, 0, 9), &ctx);

        table.remove(&ctx);
        assert_eq!(table.control_count(), 0);
        assert_eq!(table.data_count(), 0);
        assert_eq!(table.user_ip_count(), 0);
        assert!(table
            .lookup_control(&TunnelEndpoint::new(Ipv4Addr::new(10, 1, 0, 1), 1))
            .is_none());
    }

    #[test]
    fn purge_drops_only_stale_contexts() {
        let mut table = TunnelTable::new();
        let old = context(&mut table, 100, 1);
        let fresh = context(&mut table, 100, 2);
        table.touch_data(
            &TunnelEndpoint::new(Ipv4Addr::new(10, 2, 0, 1), 2),
            TimeVal::new(5000, 0),
        );

        let mut purged = vec![];
        table.purge_inactive(TimeVal::new(5000, 0), 3600, |ctx| {
            purged.push(ctx.borrow().serial);
        });
        assert_eq!(purged, vec![old.borrow().serial]);
        assert_eq!(table.data_count(), 1);
        drop(fresh);

        // Timeout zero means unbounded lifetime.
        let mut table = TunnelTable::new();
        context(&mut table, 100, 1);
        table.purge_inactive(TimeVal::new(1 << 40, 0), 0, |_| panic!("no purge"));
    }

    #[test]
    fn role_conflicts_keep_first_entry() {
        let mut table = TunnelTable::new();
        let addr = Ipv4Addr::new(10, 1, 0, 1);
        table.register_role(addr, NodeRole::Access);
        table.register_role(addr, NodeRole::Gateway);
        assert_eq!(table.role_of(addr), Some(NodeRole::Access));
    }
}
