//! Time-sorted associative store for flows and tunnel contexts.
//!
//! Entries live both in a hash map and in an insertion-ordered list; because
//! capture timestamps are monotone and every update relinks the touched entry
//! to the tail, the list stays sorted by last activity. Cleanup therefore
//! only ever inspects the head.

use crate::time::TimeVal;

use std::cell::RefCell;
use std::hash::Hash;
use std::rc::Rc;

use hashlink::linked_hash_map::{LinkedHashMap, RawEntryMut};

/// Implemented by values that carry a last-activity timestamp.
pub trait Timestamped {
    fn last_activity(&self) -> TimeVal;
}

impl<T: Timestamped> Timestamped for Rc<RefCell<T>> {
    fn last_activity(&self) -> TimeVal {
        self.borrow().last_activity()
    }
}

/// Map with entries kept in ascending last-activity order.
///
/// A timeout of zero disables inactivity-based cleanup; entries then leave
/// the map only through [`TimeSortedMap::remove`] or an unconditional
/// [`TimeSortedMap::cleanup`] with no current time.
pub struct TimeSortedMap<K, V> {
    map: LinkedHashMap<K, V>,
    timeout: u64,
}

impl<K, V> TimeSortedMap<K, V>
where
    K: Hash + Eq,
    V: Timestamped,
{
    pub fn new() -> Self {
        TimeSortedMap {
            map: LinkedHashMap::new(),
            timeout: 0,
        }
    }

    /// Seconds of inactivity after which `cleanup` drops an entry.
    pub fn set_timeout(&mut self, timeout: u64) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> u64 {
        self.timeout
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Adds a new entry at the tail of the activity list.
    pub fn insert(&mut self, key: K, value: V) {
        self.map.insert(key, value);
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    /// Relinks an entry to the tail of the activity list in O(1).
    pub fn move_to_end(&mut self, key: &K) {
        if let RawEntryMut::Occupied(mut entry) = self.map.raw_entry_mut().from_key(key) {
            entry.to_back();
        }
    }

    /// Removes expired entries from the head of the list, handing each to
    /// `callback`. With `now == None` every entry is removed unconditionally
    /// (shutdown drain). Expiry compares whole seconds: an entry expires when
    /// `now.sec > last_activity.sec + timeout`.
    pub fn cleanup<F>(&mut self, now: Option<TimeVal>, mut callback: F)
    where
        F: FnMut(V),
    {
        loop {
            let expired = match (self.map.front(), now) {
                (Some(_), None) => true,
                (Some((_, v)), Some(t)) => {
                    self.timeout != 0 && t.sec > v.last_activity().sec + self.timeout as i64
                }
                (None, _) => return,
            };
            if !expired {
                return;
            }
            let (_, value) = self.map.pop_front().expect("non-empty head");
            callback(value);
        }
    }

    /// Entries in ascending last-activity order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }
}

impl<K, V> Default for TimeSortedMap<K, V>
where
    K: Hash + Eq,
    V: Timestamped,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Entry(TimeVal);

    impl Timestamped for Entry {
        fn last_activity(&self) -> TimeVal {
            self.0
        }
    }

    fn map_with(entries: &[(u32, i64)], timeout: u64) -> TimeSortedMap<u32, Entry> {
        let mut map = TimeSortedMap::new();
        map.set_timeout(timeout);
        for (key, sec) in entries {
            map.insert(*key, Entry(TimeVal::new(*sec, 0)));
        }
        map
    }

    #[test]
    fn cleanup_removes_exactly_the_expired_prefix() {
        let mut map = map_with(&[(1, 100), (2, 150), (3, 200)], 60);
        let mut gone = vec![];
        map.cleanup(Some(TimeVal::new(215, 0)), |e| gone.push(e.0.sec));
        // 100 + 60 < 215 expires; 150 + 60 = 210 < 215 expires; 200 survives.
        assert_eq!(gone, vec![100, 150]);
        assert_eq!(map.len(), 1);
        assert!(map.get(&3).is_some());
    }

    #[test]
    fn cleanup_boundary_is_strict() {
        let mut map = map_with(&[(1, 100)], 60);
        let mut gone = 0;
        map.cleanup(Some(TimeVal::new(160, 999_999)), |_| gone += 1);
        assert_eq!(gone, 0, "160 > 100 + 60 is false, entry must survive");
        map.cleanup(Some(TimeVal::new(161, 0)), |_| gone += 1);
        assert_eq!(gone, 1);
    }

    #[test]
    fn zero_timeout_disables_expiry() {
        let mut map = map_with(&[(1, 0)], 0);
        map.cleanup(Some(TimeVal::new(1 << 40, 0)), |_| panic!("must not expire"));
        assert_eq!(map.len(), 1);

        let mut drained = 0;
        map.cleanup(None, |_| drained += 1);
        assert_eq!(drained, 1);
        assert!(map.is_empty());
    }

    #[test]
    fn move_to_end_keeps_activity_order() {
        let mut map = map_with(&[(1, 100), (2, 110), (3, 120)], 0);
        // Entry 1 sees new activity and is relinked to the tail.
        map.map.get_mut(&1).unwrap().0 = TimeVal::new(130, 0);
        map.move_to_end(&1);

        let order: Vec<u32> = map.iter().map(|(k, _)| *k).collect();
        assert_eq!(order, vec![2, 3, 1]);
        let times: Vec<i64> = map.iter().map(|(_, v)| v.last_activity().sec).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted, "list must stay ascending in last activity");
    }
}
