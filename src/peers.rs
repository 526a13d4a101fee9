//! Peer registry (spec §4.2): the set of discovered peers and their
//! last-heard timestamps, with admission, refresh, expiry and disposal.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol::StoreInfo;

pub type StoreId = String;

struct Entry {
    last_heard: Instant,
}

pub struct PeerRegistry {
    self_id: StoreId,
    peers: Mutex<std::collections::HashMap<StoreId, Entry>>,
}

/// Outcome of observing a `StoreInfo` sample, telling the caller whether it
/// needs to re-advertise its own presence (spec §4.2 discovery rule).
#[derive(Debug, PartialEq, Eq)]
pub enum Discovery {
    /// A brand-new peer; presence should be re-advertised so it discovers us.
    NewPeer,
    /// A known peer refreshed within the responsiveness window; no action.
    Refreshed,
    /// A known peer refreshed *after* being silent longer than the
    /// responsiveness window; presence should be re-advertised.
    StaleRefresh,
    /// The sample was about ourselves; ignored.
    SelfSample,
}

impl PeerRegistry {
    pub fn new(self_id: impl Into<StoreId>) -> Self {
        PeerRegistry { self_id: self_id.into(), peers: Mutex::new(std::collections::HashMap::new()) }
    }

    /// Process a valid `StoreInfo` sample (spec §4.2 invariant 6: never
    /// admits `self_id`).
    pub fn observe_info(&self, info: &StoreInfo, responsiveness_window: Duration) -> Discovery {
        if info.store_id == self.self_id {
            return Discovery::SelfSample;
        }
        let now = Instant::now();
        let mut peers = self.peers.lock();
        match peers.get_mut(&info.store_id) {
            None => {
                peers.insert(info.store_id.clone(), Entry { last_heard: now });
                Discovery::NewPeer
            }
            Some(entry) => {
                let was_stale = now.duration_since(entry.last_heard) > responsiveness_window;
                entry.last_heard = now;
                if was_stale {
                    Discovery::StaleRefresh
                } else {
                    Discovery::Refreshed
                }
            }
        }
    }

    /// A `StoreInfo` instance disposal: the peer is gone immediately.
    pub fn observe_disposal(&self, store_id: &str) {
        self.peers.lock().remove(store_id);
    }

    /// A liveliness-changed (`NOT_ALIVE_NO_WRITERS` / `NOT_ALIVE_DISPOSED`)
    /// notification for `store_id`.
    pub fn observe_liveliness_loss(&self, store_id: &str) {
        self.peers.lock().remove(store_id);
    }

    /// Evict every peer whose `last_heard` exceeds `staleness_window`.
    /// Returns the evicted ids, for logging.
    pub fn sweep_stale(&self, staleness_window: Duration) -> Vec<StoreId> {
        let now = Instant::now();
        let mut peers = self.peers.lock();
        let stale: Vec<StoreId> = peers
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_heard) > staleness_window)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            peers.remove(id);
        }
        stale
    }

    /// A consistent snapshot of currently-known peer ids.
    pub fn snapshot(&self) -> HashSet<StoreId> {
        self.peers.lock().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> StoreInfo {
        StoreInfo { store_id: id.into(), root: "/r".into(), home: format!("/r/{id}") }
    }

    #[test]
    fn self_sample_never_admitted() {
        let reg = PeerRegistry::new("self");
        assert_eq!(reg.observe_info(&info("self"), Duration::from_secs(4)), Discovery::SelfSample);
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn new_peer_is_admitted() {
        let reg = PeerRegistry::new("self");
        assert_eq!(reg.observe_info(&info("p1"), Duration::from_secs(4)), Discovery::NewPeer);
        assert_eq!(reg.snapshot(), HashSet::from(["p1".to_string()]));
    }

    #[test]
    fn fresh_refresh_is_quiet() {
        let reg = PeerRegistry::new("self");
        reg.observe_info(&info("p1"), Duration::from_secs(4));
        assert_eq!(reg.observe_info(&info("p1"), Duration::from_secs(4)), Discovery::Refreshed);
    }

    #[test]
    fn stale_refresh_asks_for_readvertisement() {
        let reg = PeerRegistry::new("self");
        reg.observe_info(&info("p1"), Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(
            reg.observe_info(&info("p1"), Duration::from_millis(5)),
            Discovery::StaleRefresh
        );
    }

    #[test]
    fn disposal_removes_peer() {
        let reg = PeerRegistry::new("self");
        reg.observe_info(&info("p1"), Duration::from_secs(4));
        reg.observe_disposal("p1");
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn liveliness_loss_removes_peer() {
        let reg = PeerRegistry::new("self");
        reg.observe_info(&info("p1"), Duration::from_secs(4));
        reg.observe_liveliness_loss("p1");
        assert!(reg.snapshot().is_empty());
    }

    #[test]
    fn sweep_evicts_only_stale_peers() {
        let reg = PeerRegistry::new("self");
        reg.observe_info(&info("fresh"), Duration::from_secs(4));
        reg.observe_info(&info("old"), Duration::from_secs(4));
        std::thread::sleep(Duration::from_millis(20));
        reg.observe_info(&info("fresh"), Duration::from_secs(4));
        let evicted = reg.sweep_stale(Duration::from_millis(10));
        assert_eq!(evicted, vec!["old".to_string()]);
        assert_eq!(reg.snapshot(), HashSet::from(["fresh".to_string()]));
    }
}
