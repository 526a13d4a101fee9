//! Messaging adapter (spec §4.1): typed wrappers over a DDS-like pub/sub
//! substrate, partitioned by `root`.
//!
//! [`Transport`] is the seam a production deployment would implement against
//! a real pub/sub product (DDS, Zenoh, MQTT with retained messages, ...).
//! [`LocalBus`] is the reference implementation used by every test and by
//! any single-process deployment that wants several [`crate::Store`]s to
//! federate without an external broker — the same role `NetworkCore` plays
//! for p2panda-net in a gossip-based system, just swapped for
//! `tokio::sync::broadcast` since there is no wire to cross in-process.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::protocol::{CacheHit, CacheHitMv, CacheMiss, CacheMissMv, KeyValue, Sample, StoreInfo};

const CHANNEL_CAPACITY: usize = 1024;

/// A non-blocking drain handle over one topic's broadcast stream.
pub struct Reader<T> {
    rx: broadcast::Receiver<Sample<T>>,
}

impl<T: Clone> Reader<T> {
    fn new(rx: broadcast::Receiver<Sample<T>>) -> Self {
        Reader { rx }
    }

    /// Block until the next sample arrives. Used by the controller's
    /// always-on handler tasks (remote-put ingestion, serving misses) as
    /// opposed to `take()`'s non-blocking drain used by `resolve`'s poll loop.
    pub async fn recv(&mut self) -> Option<Sample<T>> {
        loop {
            match self.rx.recv().await {
                Ok(sample) => return Some(sample),
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("messaging: reader lagged, dropped {n} samples");
                    continue;
                }
            }
        }
    }

    /// Drain every sample currently queued for this reader. Lagged samples
    /// (the reader fell behind the channel's ring buffer) are logged and
    /// skipped rather than treated as fatal — a later re-advertisement or
    /// retry will recover the lost information, matching the substrate's
    /// best-effort delivery contract.
    pub fn take(&mut self) -> Vec<Sample<T>> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(sample) => out.push(sample),
                Err(broadcast::error::TryRecvError::Empty) => break,
                Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    log::warn!("messaging: reader lagged, dropped {n} samples");
                    continue;
                }
            }
        }
        out
    }
}

/// Six typed topics plus a liveliness-loss signal, all scoped to one
/// partition (`root`).
pub trait Transport: Send + Sync {
    fn publish_store_info(&self, info: StoreInfo);
    fn dispose_store_info(&self, store_id: &str);
    fn subscribe_store_info(&self) -> Reader<StoreInfo>;

    fn publish_key_value(&self, kv: KeyValue);
    fn dispose_key_value(&self, key: &str, source_store_id: &str);
    fn subscribe_key_value(&self) -> Reader<KeyValue>;

    fn publish_cache_miss(&self, m: CacheMiss);
    fn subscribe_cache_miss(&self) -> Reader<CacheMiss>;

    fn publish_cache_hit(&self, h: CacheHit);
    fn subscribe_cache_hit(&self) -> Reader<CacheHit>;

    fn publish_cache_miss_mv(&self, m: CacheMissMv);
    fn subscribe_cache_miss_mv(&self) -> Reader<CacheMissMv>;

    fn publish_cache_hit_mv(&self, h: CacheHitMv);
    fn subscribe_cache_hit_mv(&self) -> Reader<CacheHitMv>;

    /// A production adapter calls this when it detects (via the substrate's
    /// liveliness-changed listener) that a remote writer vanished without a
    /// graceful instance dispose.
    fn report_liveliness_loss(&self, store_id: &str);
    fn subscribe_liveliness_loss(&self) -> broadcast::Receiver<String>;
}

struct BusInner {
    store_info: broadcast::Sender<Sample<StoreInfo>>,
    key_value: broadcast::Sender<Sample<KeyValue>>,
    cache_miss: broadcast::Sender<Sample<CacheMiss>>,
    cache_hit: broadcast::Sender<Sample<CacheHit>>,
    cache_miss_mv: broadcast::Sender<Sample<CacheMissMv>>,
    cache_hit_mv: broadcast::Sender<Sample<CacheHitMv>>,
    liveliness_loss: broadcast::Sender<String>,
}

impl Default for BusInner {
    fn default() -> Self {
        BusInner {
            store_info: broadcast::channel(CHANNEL_CAPACITY).0,
            key_value: broadcast::channel(CHANNEL_CAPACITY).0,
            cache_miss: broadcast::channel(CHANNEL_CAPACITY).0,
            cache_hit: broadcast::channel(CHANNEL_CAPACITY).0,
            cache_miss_mv: broadcast::channel(CHANNEL_CAPACITY).0,
            cache_hit_mv: broadcast::channel(CHANNEL_CAPACITY).0,
            liveliness_loss: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }
}

/// Cheaply `Clone`-able handle onto one partition's six topics.
#[derive(Clone)]
pub struct LocalBus {
    inner: Arc<BusInner>,
}

struct PartitionEntry {
    bus: LocalBus,
    refcount: usize,
}

static PARTITIONS: OnceLock<Mutex<HashMap<String, PartitionEntry>>> = OnceLock::new();

impl LocalBus {
    /// Look up (or create) the bus shared by every store whose `root` is
    /// `partition` — the in-process analogue of joining a DDS partition.
    /// Every call here must be matched by one `release_partition` call
    /// (spec §9/§10: a lazily-initialized shared resource with reference
    /// counting), which is `Store::close`'s job.
    pub fn for_partition(partition: &str) -> Self {
        let registry = PARTITIONS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut map = registry.lock();
        let entry = map.entry(partition.to_string()).or_insert_with(|| PartitionEntry {
            bus: LocalBus { inner: Arc::new(BusInner::default()) },
            refcount: 0,
        });
        entry.refcount += 1;
        entry.bus.clone()
    }

    /// Release one reference to `partition`'s bus. Once the last store
    /// sharing it has released, the registry entry is torn down — a later
    /// `for_partition` call for the same `root` starts a fresh bus rather
    /// than rejoining one nobody is listening on anymore.
    pub fn release_partition(partition: &str) {
        let registry = PARTITIONS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut map = registry.lock();
        if let std::collections::hash_map::Entry::Occupied(mut entry) = map.entry(partition.to_string()) {
            entry.get_mut().refcount -= 1;
            if entry.get().refcount == 0 {
                entry.remove();
            }
        }
    }
}

impl Transport for LocalBus {
    fn publish_store_info(&self, info: StoreInfo) {
        let _ = self.inner.store_info.send(Sample::valid(info));
    }

    fn dispose_store_info(&self, store_id: &str) {
        let info = StoreInfo { store_id: store_id.to_string(), root: String::new(), home: String::new() };
        let _ = self.inner.store_info.send(Sample::disposal(info));
    }

    fn subscribe_store_info(&self) -> Reader<StoreInfo> {
        Reader::new(self.inner.store_info.subscribe())
    }

    fn publish_key_value(&self, kv: KeyValue) {
        let _ = self.inner.key_value.send(Sample::valid(kv));
    }

    fn dispose_key_value(&self, key: &str, source_store_id: &str) {
        let kv = KeyValue {
            key: key.to_string(),
            value: String::new(),
            source_store_id: source_store_id.to_string(),
            version: 0,
        };
        let _ = self.inner.key_value.send(Sample::disposal(kv));
    }

    fn subscribe_key_value(&self) -> Reader<KeyValue> {
        Reader::new(self.inner.key_value.subscribe())
    }

    fn publish_cache_miss(&self, m: CacheMiss) {
        let _ = self.inner.cache_miss.send(Sample::valid(m));
    }

    fn subscribe_cache_miss(&self) -> Reader<CacheMiss> {
        Reader::new(self.inner.cache_miss.subscribe())
    }

    fn publish_cache_hit(&self, h: CacheHit) {
        let _ = self.inner.cache_hit.send(Sample::valid(h));
    }

    fn subscribe_cache_hit(&self) -> Reader<CacheHit> {
        Reader::new(self.inner.cache_hit.subscribe())
    }

    fn publish_cache_miss_mv(&self, m: CacheMissMv) {
        let _ = self.inner.cache_miss_mv.send(Sample::valid(m));
    }

    fn subscribe_cache_miss_mv(&self) -> Reader<CacheMissMv> {
        Reader::new(self.inner.cache_miss_mv.subscribe())
    }

    fn publish_cache_hit_mv(&self, h: CacheHitMv) {
        let _ = self.inner.cache_hit_mv.send(Sample::valid(h));
    }

    fn subscribe_cache_hit_mv(&self) -> Reader<CacheHitMv> {
        Reader::new(self.inner.cache_hit_mv.subscribe())
    }

    fn report_liveliness_loss(&self, store_id: &str) {
        let _ = self.inner.liveliness_loss.send(store_id.to_string());
    }

    fn subscribe_liveliness_loss(&self) -> broadcast::Receiver<String> {
        self.inner.liveliness_loss.subscribe()
    }
}
