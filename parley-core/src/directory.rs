//! Peer directory: the one shared table of peer addresses and last-contact times.
//! Internally synchronized; callers never hold a copy that can go stale silently.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::protocol::UserId;

/// Known address of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub user_id: UserId,
    pub address: String,
    /// Peer's listening port. 0 = unknown, needs a directory-service lookup before use.
    pub port: u16,
    pub last_contact: Instant,
    pub connected: bool,
}

impl PeerEntry {
    /// Entry is usable for an outbound connection.
    pub fn is_routable(&self) -> bool {
        self.port != 0 && !self.address.is_empty()
    }
}

/// Thread-safe map of user id to peer entry.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<UserId, PeerEntry>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    // A panic while holding the lock cannot leave a half-written entry, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<UserId, PeerEntry>> {
        self.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<UserId, PeerEntry>> {
        self.peers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the entry for `user_id`, resetting its contact time.
    pub fn upsert(&self, user_id: UserId, address: impl Into<String>, port: u16) {
        let entry = PeerEntry {
            user_id,
            address: address.into(),
            port,
            last_contact: Instant::now(),
            connected: true,
        };
        self.write().insert(user_id, entry);
    }

    /// Refresh contact time without changing the address. Returns false if the peer is unknown.
    pub fn touch(&self, user_id: UserId) -> bool {
        match self.write().get_mut(&user_id) {
            Some(entry) => {
                entry.last_contact = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Record inbound contact. A non-zero port upserts. A zero port keeps the known port and only
    /// refreshes address and contact time, or inserts a port-0 placeholder for an unknown sender.
    pub fn observe(&self, user_id: UserId, address: impl Into<String>, port: u16) {
        let address = address.into();
        if port != 0 {
            self.upsert(user_id, address, port);
            return;
        }
        let mut peers = self.write();
        match peers.get_mut(&user_id) {
            Some(entry) => {
                entry.address = address;
                entry.last_contact = Instant::now();
            }
            None => {
                peers.insert(
                    user_id,
                    PeerEntry {
                        user_id,
                        address,
                        port: 0,
                        last_contact: Instant::now(),
                        connected: true,
                    },
                );
            }
        }
    }

    /// Merge an address reported by the directory service. A known routable entry keeps its
    /// address, port and connected flag, since inbound traffic refreshes those; a missing or
    /// port-0 entry takes the listed address. New entries start disconnected.
    pub fn merge_listed(&self, user_id: UserId, address: impl Into<String>, port: u16) {
        let mut peers = self.write();
        match peers.get_mut(&user_id) {
            Some(entry) => {
                if !entry.is_routable() {
                    entry.address = address.into();
                    entry.port = port;
                }
                entry.last_contact = Instant::now();
            }
            None => {
                peers.insert(
                    user_id,
                    PeerEntry {
                        user_id,
                        address: address.into(),
                        port,
                        last_contact: Instant::now(),
                        connected: false,
                    },
                );
            }
        }
    }

    pub fn lookup(&self, user_id: UserId) -> Option<PeerEntry> {
        self.read().get(&user_id).cloned()
    }

    pub fn remove(&self, user_id: UserId) -> Option<PeerEntry> {
        self.write().remove(&user_id)
    }

    /// Drop every entry (logout).
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Flip the connected flag after a send attempt. Unknown peers are ignored.
    pub fn set_connected(&self, user_id: UserId, connected: bool) {
        if let Some(entry) = self.write().get_mut(&user_id) {
            entry.connected = connected;
        }
    }

    /// Remove entries with no contact for longer than `ttl`. Returns the evicted ids.
    pub fn evict_idle(&self, ttl: Duration) -> Vec<UserId> {
        let now = Instant::now();
        let mut peers = self.write();
        let idle: Vec<UserId> = peers
            .values()
            .filter(|e| now.duration_since(e.last_contact) > ttl)
            .map(|e| e.user_id)
            .collect();
        for id in &idle {
            peers.remove(id);
        }
        idle
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn user_ids(&self) -> Vec<UserId> {
        self.read().keys().copied().collect()
    }
}

/// Last known set of online friends; turns each poll result into a presence diff.
#[derive(Debug, Default)]
pub struct OnlineSet {
    online: HashSet<UserId>,
}

/// Who came online and who went offline between two polls.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PresenceDiff {
    pub came_online: Vec<UserId>,
    pub went_offline: Vec<UserId>,
}

impl PresenceDiff {
    pub fn is_empty(&self) -> bool {
        self.came_online.is_empty() && self.went_offline.is_empty()
    }
}

impl OnlineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set with `now_online` and return the difference. Output is sorted.
    pub fn update(&mut self, now_online: impl IntoIterator<Item = UserId>) -> PresenceDiff {
        let next: HashSet<UserId> = now_online.into_iter().collect();
        let mut came_online: Vec<UserId> = next.difference(&self.online).copied().collect();
        let mut went_offline: Vec<UserId> = self.online.difference(&next).copied().collect();
        came_online.sort();
        went_offline.sort();
        self.online = next;
        PresenceDiff {
            came_online,
            went_offline,
        }
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.online.contains(&user_id)
    }

    /// Forget one user without a full poll (e.g. after local eviction).
    pub fn remove(&mut self, user_id: UserId) -> bool {
        self.online.remove(&user_id)
    }

    pub fn clear(&mut self) {
        self.online.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    #[test]
    fn upsert_then_lookup() {
        let dir = PeerDirectory::new();
        dir.upsert(UserId(1), "10.0.0.5", 5000);
        let e = dir.lookup(UserId(1)).unwrap();
        assert_eq!(e.address, "10.0.0.5");
        assert_eq!(e.port, 5000);
        assert!(e.connected);
        assert!(e.is_routable());
    }

    #[test]
    fn touch_keeps_address() {
        let dir = PeerDirectory::new();
        assert!(!dir.touch(UserId(1)));
        dir.upsert(UserId(1), "10.0.0.5", 5000);
        let before = dir.lookup(UserId(1)).unwrap().last_contact;
        std::thread::sleep(Duration::from_millis(2));
        assert!(dir.touch(UserId(1)));
        let after = dir.lookup(UserId(1)).unwrap();
        assert!(after.last_contact > before);
        assert_eq!(after.address, "10.0.0.5");
        assert_eq!(after.port, 5000);
    }

    #[test]
    fn remove_and_clear() {
        let dir = PeerDirectory::new();
        dir.upsert(UserId(1), "a", 1);
        dir.upsert(UserId(2), "b", 2);
        assert!(dir.remove(UserId(1)).is_some());
        assert!(dir.lookup(UserId(1)).is_none());
        dir.clear();
        assert!(dir.lookup(UserId(2)).is_none());
        assert!(dir.is_empty());
    }

    #[test]
    fn observe_zero_port_keeps_known_port() {
        let dir = PeerDirectory::new();
        dir.upsert(UserId(3), "192.168.1.2", 5001);
        dir.observe(UserId(3), "192.168.1.9", 0);
        let e = dir.lookup(UserId(3)).unwrap();
        assert_eq!(e.port, 5001);
        assert_eq!(e.address, "192.168.1.9");
    }

    #[test]
    fn observe_unknown_sender_without_port_is_placeholder() {
        let dir = PeerDirectory::new();
        dir.observe(UserId(4), "192.168.1.9", 0);
        let e = dir.lookup(UserId(4)).unwrap();
        assert_eq!(e.port, 0);
        assert!(!e.is_routable());
        dir.observe(UserId(4), "192.168.1.9", 5002);
        assert_eq!(dir.lookup(UserId(4)).unwrap().port, 5002);
    }

    #[test]
    fn set_connected_flag() {
        let dir = PeerDirectory::new();
        dir.upsert(UserId(1), "a", 1);
        dir.set_connected(UserId(1), false);
        assert!(!dir.lookup(UserId(1)).unwrap().connected);
        dir.set_connected(UserId(99), false);
        assert!(dir.lookup(UserId(99)).is_none());
    }

    #[test]
    fn merge_listed_keeps_live_state() {
        let dir = PeerDirectory::new();
        dir.merge_listed(UserId(1), "10.0.0.1", 5000);
        let e = dir.lookup(UserId(1)).unwrap();
        assert_eq!((e.address.as_str(), e.port, e.connected), ("10.0.0.1", 5000, false));

        dir.observe(UserId(2), "192.168.1.7", 6001);
        dir.set_connected(UserId(2), false);
        dir.merge_listed(UserId(2), "10.0.0.2", 5000);
        let e = dir.lookup(UserId(2)).unwrap();
        assert_eq!((e.address.as_str(), e.port), ("192.168.1.7", 6001));
        assert!(!e.connected);

        dir.observe(UserId(3), "192.168.1.8", 0);
        dir.merge_listed(UserId(3), "10.0.0.3", 5003);
        let e = dir.lookup(UserId(3)).unwrap();
        assert_eq!((e.address.as_str(), e.port), ("10.0.0.3", 5003));
        assert!(e.connected);
    }

    #[test]
    fn evict_idle_only_removes_stale() {
        let dir = PeerDirectory::new();
        dir.upsert(UserId(1), "a", 1);
        std::thread::sleep(Duration::from_millis(30));
        dir.upsert(UserId(2), "b", 2);
        let evicted = dir.evict_idle(Duration::from_millis(15));
        assert_eq!(evicted, vec![UserId(1)]);
        assert!(dir.lookup(UserId(2)).is_some());
    }

    /// Random upsert/touch/remove sequences checked against a plain map model.
    #[test]
    fn random_sequences_match_model() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let dir = PeerDirectory::new();
            let mut model: HashMap<UserId, (String, u16)> = HashMap::new();
            for _ in 0..200 {
                let id = UserId(rng.gen_range(0..8));
                match rng.gen_range(0..4) {
                    0 | 1 => {
                        let addr = format!("10.0.0.{}", rng.gen_range(1..255));
                        let port = rng.gen_range(1..u16::MAX);
                        dir.upsert(id, addr.clone(), port);
                        model.insert(id, (addr, port));
                    }
                    2 => {
                        assert_eq!(dir.touch(id), model.contains_key(&id));
                    }
                    _ => {
                        dir.remove(id);
                        model.remove(&id);
                    }
                }
            }
            for raw in 0..8 {
                let id = UserId(raw);
                let got = dir.lookup(id).map(|e| (e.address, e.port));
                assert_eq!(got, model.get(&id).cloned());
            }
            dir.clear();
            assert!((0..8).all(|raw| dir.lookup(UserId(raw)).is_none()));
        }
    }

    #[test]
    fn concurrent_writers() {
        let dir = Arc::new(PeerDirectory::new());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let dir = dir.clone();
                std::thread::spawn(move || {
                    for i in 0..100u64 {
                        let id = UserId(t * 1000 + i);
                        dir.upsert(id, "127.0.0.1", 5000);
                        dir.touch(id);
                        if i % 2 == 0 {
                            dir.remove(id);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(dir.len(), 8 * 50);
    }

    #[test]
    fn online_set_diff() {
        let mut set = OnlineSet::new();
        let d = set.update([UserId(1), UserId(2)]);
        assert_eq!(d.came_online, vec![UserId(1), UserId(2)]);
        assert!(d.went_offline.is_empty());
        let d = set.update([UserId(2), UserId(3)]);
        assert_eq!(d.came_online, vec![UserId(3)]);
        assert_eq!(d.went_offline, vec![UserId(1)]);
        assert!(set.update([UserId(2), UserId(3)]).is_empty());
        assert!(set.contains(UserId(3)));
    }
}
