use std::fmt;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;

use crate::packet::{Packet, TransportProtocol};

/// Identifies one conversation between a device client and a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub protocol: TransportProtocol,
    pub client: SocketAddrV4,
    pub remote: SocketAddrV4,
}

impl FlowKey {
    pub fn new(protocol: TransportProtocol, client: SocketAddrV4, remote: SocketAddrV4) -> Self {
        Self {
            protocol,
            client,
            remote,
        }
    }

    /// Key of a device-originated packet.
    pub fn from_packet(packet: &Packet) -> Self {
        Self::new(packet.protocol(), packet.source(), packet.destination())
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.client, self.remote)
    }
}

/// Entries that track when they last carried traffic.
pub trait Activity {
    fn last_activity(&self) -> Instant;
}

/// Concurrent flow table keyed by [`FlowKey`].
///
/// Shared between a relay's output and input halves; per-key access never
/// blocks other flows for longer than a shard lock.
pub struct FlowTable<T> {
    entries: DashMap<FlowKey, T>,
}

impl<T: Activity> FlowTable<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert an entry, returning the one it replaced.
    pub fn insert(&self, key: FlowKey, entry: T) -> Option<T> {
        self.entries.insert(key, entry)
    }

    pub fn get(&self, key: &FlowKey) -> Option<Ref<'_, FlowKey, T>> {
        self.entries.get(key)
    }

    pub fn get_mut(&self, key: &FlowKey) -> Option<RefMut<'_, FlowKey, T>> {
        self.entries.get_mut(key)
    }

    pub fn remove(&self, key: &FlowKey) -> Option<T> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    /// Remove only if the current entry satisfies `predicate`.
    pub fn remove_if(&self, key: &FlowKey, predicate: impl FnOnce(&T) -> bool) -> Option<T> {
        self.entries
            .remove_if(key, |_, entry| predicate(entry))
            .map(|(_, entry)| entry)
    }

    pub fn contains(&self, key: &FlowKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove and return every entry idle for at least `timeout`.
    pub fn take_idle(&self, now: Instant, timeout: Duration) -> Vec<(FlowKey, T)> {
        let idle: Vec<FlowKey> = self
            .entries
            .iter()
            .filter(|e| now.saturating_duration_since(e.value().last_activity()) >= timeout)
            .map(|e| *e.key())
            .collect();

        idle.into_iter()
            .filter_map(|key| {
                // re-check under the shard lock: the flow may have seen traffic meanwhile
                self.entries.remove_if(&key, |_, entry| {
                    now.saturating_duration_since(entry.last_activity()) >= timeout
                })
            })
            .collect()
    }

    /// Key of the least recently active entry.
    pub fn oldest(&self) -> Option<FlowKey> {
        self.entries
            .iter()
            .min_by_key(|e| e.value().last_activity())
            .map(|e| *e.key())
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<(FlowKey, T)> {
        let keys: Vec<FlowKey> = self.entries.iter().map(|e| *e.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Activity> Default for FlowTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    struct Entry {
        id: u32,
        seen: Instant,
    }

    impl Activity for Entry {
        fn last_activity(&self) -> Instant {
            self.seen
        }
    }

    fn key(port: u16) -> FlowKey {
        FlowKey::new(
            TransportProtocol::Udp,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), port),
            SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443),
        )
    }

    #[test]
    fn test_insert_and_get() {
        let table = FlowTable::new();
        let now = Instant::now();
        assert!(table.insert(key(1000), Entry { id: 1, seen: now }).is_none());

        assert_eq!(table.get(&key(1000)).map(|e| e.id), Some(1));
        assert!(table.get(&key(1001)).is_none());
        assert_eq!(table.len(), 1);

        table.get_mut(&key(1000)).unwrap().id = 5;
        assert_eq!(table.remove(&key(1000)).map(|e| e.id), Some(5));
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_if_checks_identity() {
        let table = FlowTable::new();
        table.insert(key(1), Entry { id: 2, seen: Instant::now() });

        assert!(table.remove_if(&key(1), |e| e.id == 1).is_none());
        assert!(table.contains(&key(1)));
        assert!(table.remove_if(&key(1), |e| e.id == 2).is_some());
        assert!(!table.contains(&key(1)));
    }

    #[test]
    fn test_take_idle_and_oldest() {
        let table = FlowTable::new();
        let start = Instant::now();
        table.insert(key(1), Entry { id: 1, seen: start });
        table.insert(key(2), Entry { id: 2, seen: start + Duration::from_secs(90) });

        assert_eq!(table.oldest(), Some(key(1)));

        let now = start + Duration::from_secs(120);
        let idle = table.take_idle(now, Duration::from_secs(60));
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].0, key(1));
        assert_eq!(table.len(), 1);

        assert_eq!(table.drain().len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(key(4000).to_string(), "udp 10.0.0.2:4000 -> 93.184.216.34:443");
    }
}
