//! Coherence controller (spec §4.4) — the core state machine binding the
//! messaging adapter to the local store: publishes presence and local
//! mutations, serves incoming misses from the local store, issues misses
//! and collects hits for local resolves, and applies remote puts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Timings;
use crate::local_store::LocalStore;
use crate::messaging::Transport;
use crate::peers::{Discovery, PeerRegistry};
use crate::protocol::{CacheHit, CacheHitMv, CacheMiss, CacheMissMv, KeyValue, StoreInfo};
use crate::uri;

pub struct Controller {
    store_id: String,
    home: String,
    local: Arc<LocalStore>,
    peers: Arc<PeerRegistry>,
    transport: Arc<dyn Transport>,
    timings: Timings,
    cancel: CancellationToken,
}

pub struct Handle {
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Handle {
    /// Stop every background task. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Controller {
    pub fn new(
        store_id: impl Into<String>,
        home: impl Into<String>,
        local: Arc<LocalStore>,
        peers: Arc<PeerRegistry>,
        transport: Arc<dyn Transport>,
        timings: Timings,
    ) -> Arc<Self> {
        Arc::new(Controller {
            store_id: store_id.into(),
            home: home.into(),
            local,
            peers,
            transport,
            timings,
            cancel: CancellationToken::new(),
        })
    }

    /// Start every background task: the four always-on reader loops and the
    /// periodic presence advertiser. Advertises immediately, per spec §3
    /// ("the controller starts immediately and advertises presence").
    pub fn start(self: &Arc<Self>) -> Handle {
        self.advertise_presence();

        let tasks = vec![
            tokio::spawn(self.clone().run_store_info_loop()),
            tokio::spawn(self.clone().run_key_value_loop()),
            tokio::spawn(self.clone().run_cache_miss_loop()),
            tokio::spawn(self.clone().run_cache_miss_mv_loop()),
            tokio::spawn(self.clone().run_liveliness_loop()),
            tokio::spawn(self.clone().run_advertise_loop()),
        ];

        Handle { tasks, cancel: self.cancel.clone() }
    }

    // ─── Outgoing mutations (called from the front-end API) ────────────────

    pub fn publish_put(&self, key: &str, value: &str, version: u64) {
        self.transport.publish_key_value(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            source_store_id: self.store_id.clone(),
            version,
        });
    }

    pub fn publish_remove(&self, key: &str) {
        self.transport.dispose_key_value(key, &self.store_id);
    }

    pub fn advertise_presence(&self) {
        self.transport.publish_store_info(StoreInfo {
            store_id: self.store_id.clone(),
            root: self.local.root.clone(),
            home: self.home.clone(),
        });
    }

    pub fn close(&self) {
        self.transport.dispose_store_info(&self.store_id);
        self.cancel.cancel();
    }

    // ─── Background loops ───────────────────────────────────────────────────

    async fn run_advertise_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.timings.advertise_interval) => {
                    self.advertise_presence();
                    let evicted = self.peers.sweep_stale(self.timings.staleness_window);
                    for id in evicted {
                        log::debug!("controller({}): evicted stale peer {id}", self.store_id);
                    }
                }
            }
        }
    }

    async fn run_store_info_loop(self: Arc<Self>) {
        let mut reader = self.transport.subscribe_store_info();
        loop {
            let sample = tokio::select! {
                _ = self.cancel.cancelled() => return,
                s = reader.recv() => s,
            };
            let Some(sample) = sample else { return };
            if sample.disposed {
                self.peers.observe_disposal(&sample.data.store_id);
                continue;
            }
            if !sample.valid_data {
                continue;
            }
            match self.peers.observe_info(&sample.data, self.timings.responsiveness_window) {
                Discovery::NewPeer | Discovery::StaleRefresh => self.advertise_presence(),
                Discovery::Refreshed | Discovery::SelfSample => {}
            }
        }
    }

    async fn run_liveliness_loop(self: Arc<Self>) {
        let mut rx = self.transport.subscribe_liveliness_loss();
        loop {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => return,
                m = rx.recv() => m,
            };
            match msg {
                Ok(store_id) => self.peers.observe_liveliness_loss(&store_id),
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            }
        }
    }

    /// Incoming `KeyValue` (remote put / remote remove), spec §4.4.
    async fn run_key_value_loop(self: Arc<Self>) {
        let mut reader = self.transport.subscribe_key_value();
        loop {
            let sample = tokio::select! {
                _ = self.cancel.cancelled() => return,
                s = reader.recv() => s,
            };
            let Some(sample) = sample else { return };

            if sample.disposed {
                if self.local.delete(&sample.data.key) {
                    self.local.notify_observers(&sample.data.key, None, None);
                }
                continue;
            }

            if !sample.valid_data {
                continue;
            }

            let kv = sample.data;
            if kv.source_store_id == self.store_id {
                continue; // self-originated; ignore
            }
            if uri::is_meta_resource(&kv.key) {
                continue; // computed, never stored
            }
            if self.local.update_value(&kv.key, &kv.value, kv.version) {
                self.local.notify_observers(&kv.key, Some(&kv.value), Some(kv.version));
            }
        }
    }

    /// Serve a remote single-value lookup (spec §4.4).
    async fn run_cache_miss_loop(self: Arc<Self>) {
        let mut reader = self.transport.subscribe_cache_miss();
        loop {
            let sample = tokio::select! {
                _ = self.cancel.cancelled() => return,
                s = reader.recv() => s,
            };
            let Some(sample) = sample else { return };
            if !sample.valid_data || sample.data.source_store_id == self.store_id {
                continue;
            }
            self.serve_miss(sample.data).await;
        }
    }

    async fn serve_miss(&self, miss: CacheMiss) {
        let key = miss.key.clone();
        let answer = if uri::is_meta_resource(&key) && key.starts_with(&self.home) {
            self.local.resolve_metaresource(&key).map(|value| (value, 0u64))
        } else {
            self.local.get_value(&key)
        };

        let hit = match answer {
            Some((value, version)) => CacheHit {
                source_store_id: self.store_id.clone(),
                dest_store_id: miss.source_store_id,
                key,
                value: Some(value),
                version: Some(version),
            },
            None => CacheHit {
                source_store_id: self.store_id.clone(),
                dest_store_id: miss.source_store_id,
                key,
                value: None,
                version: None,
            },
        };
        self.transport.publish_cache_hit(hit);
    }

    /// Serve a remote wildcard lookup (spec §4.4), with response jitter to
    /// de-synchronize reply storms.
    async fn run_cache_miss_mv_loop(self: Arc<Self>) {
        let mut reader = self.transport.subscribe_cache_miss_mv();
        loop {
            let sample = tokio::select! {
                _ = self.cancel.cancelled() => return,
                s = reader.recv() => s,
            };
            let Some(sample) = sample else { return };
            if !sample.valid_data || sample.data.source_store_id == self.store_id {
                continue;
            }
            let this = self.clone_handle_for_task();
            tokio::spawn(async move { this.serve_miss_mv(sample.data).await });
        }
    }

    // Background jitter sleeps must not block the dispatch loop itself, so
    // `serve_miss_mv` runs detached; it needs its own `Arc<Controller>`.
    fn clone_handle_for_task(self: &Arc<Self>) -> Arc<Self> {
        self.clone()
    }

    async fn serve_miss_mv(&self, miss: CacheMissMv) {
        let pattern = miss.key_pattern.clone();
        let xs = self.local.get_all(&pattern);
        let entries = if xs.is_empty() { None } else { Some(xs) };

        self.jitter_sleep().await;

        let hit = CacheHitMv {
            source_store_id: self.store_id.clone(),
            dest_store_id: miss.source_store_id,
            key_pattern: pattern,
            entries,
        };
        self.transport.publish_cache_hit_mv(hit);
    }

    async fn jitter_sleep(&self) {
        let (lo, hi) = self.timings.jitter_multiplier_range;
        let multiplier = rand::thread_rng().gen_range(lo..hi);
        tokio::time::sleep(self.timings.jitter_unit * multiplier).await;
    }

    // ─── Outgoing resolve / resolveAll (spec §4.4) ──────────────────────────

    /// Wait briefly for `peers.snapshot()` to become non-empty, up to ~100ms.
    async fn settle_and_capture_peers(&self) -> HashSet<String> {
        tokio::time::sleep(self.timings.settle_delay).await;
        let mut waited = Duration::ZERO;
        let cap = Duration::from_millis(100);
        let step = Duration::from_millis(10);
        loop {
            let peers = self.peers.snapshot();
            if !peers.is_empty() || waited >= cap {
                return peers;
            }
            tokio::time::sleep(step).await;
            waited += step;
        }
    }

    /// Single-value resolve (REDESIGN FLAG #1: always uses the `CacheHit`
    /// reader, never `CacheHitMv`'s).
    pub async fn resolve(&self, key: &str, timeout: Option<Duration>) -> (Option<String>, Option<u64>) {
        let peers = self.settle_and_capture_peers().await;
        let max_retries = (peers.len() * 2).max(10);
        let delta = self.timings.resolve_backoff_step;
        let timeout = timeout.unwrap_or(self.timings.resolve_base_interval);

        let mut hit_reader = self.transport.subscribe_cache_hit();
        let miss = CacheMiss { source_store_id: self.store_id.clone(), key: key.to_string() };
        self.transport.publish_cache_miss(miss.clone());

        let mut answered: HashSet<String> = HashSet::new();
        let mut best: (Option<String>, Option<u64>) = (None, None);
        let mut retries: usize = 0;

        loop {
            let backoff = timeout + delta * (retries.saturating_sub(1) as u32) / 10;
            tokio::time::sleep(backoff).await;

            if retries > 0 && retries % 10 == 0 {
                self.transport.publish_cache_miss(miss.clone());
            }

            for sample in hit_reader.take() {
                if !sample.valid_data || sample.data.key != key || sample.data.dest_store_id != self.store_id {
                    continue;
                }
                answered.insert(sample.data.source_store_id.clone());
                if let Some(v) = sample.data.version {
                    let better = match best.1 {
                        Some(current_best) => v > current_best,
                        None => true,
                    };
                    if better {
                        best = (sample.data.value.clone(), Some(v));
                    }
                }
            }

            retries += 1;
            if answered == peers || retries >= max_retries {
                break;
            }
        }

        best
    }

    /// Wildcard resolve (spec §4.4), consolidated by highest version per key.
    pub async fn resolve_all(&self, pattern: &str, _timeout: Option<Duration>) -> Vec<(String, String, u64)> {
        let peers = self.settle_and_capture_peers().await;

        let mut hitmv_reader = self.transport.subscribe_cache_hit_mv();
        let miss = CacheMissMv { source_store_id: self.store_id.clone(), key_pattern: pattern.to_string() };
        self.transport.publish_cache_miss_mv(miss.clone());

        let mut answered: HashSet<String> = HashSet::new();
        let mut accumulator: Vec<(String, String, u64)> = Vec::new();
        let mut retries: usize = 0;
        let max_retries = (peers.len() * 2).max(10) * 4; // generous ceiling; no per-peer timeout signal on this path

        loop {
            tokio::time::sleep(self.timings.resolve_base_interval).await;

            if retries > 0 && retries % 10 == 0 {
                self.transport.publish_cache_miss_mv(miss.clone());
            }

            for sample in hitmv_reader.take() {
                if !sample.valid_data || sample.data.key_pattern != pattern {
                    continue;
                }
                if !answered.insert(sample.data.source_store_id.clone()) {
                    continue; // already have this peer's answer
                }
                if let Some(entries) = sample.data.entries {
                    accumulator.extend(entries);
                }
            }

            retries += 1;
            if answered == peers || retries >= max_retries {
                break;
            }
        }

        consolidate_by_highest_version(accumulator)
    }
}

fn consolidate_by_highest_version(entries: Vec<(String, String, u64)>) -> Vec<(String, String, u64)> {
    let mut best: std::collections::HashMap<String, (String, String, u64)> = std::collections::HashMap::new();
    for (k, v, ver) in entries {
        match best.get(&k) {
            Some((_, _, existing_ver)) if *existing_ver >= ver => {}
            _ => {
                best.insert(k.clone(), (k, v, ver));
            }
        }
    }
    best.into_values().collect()
}
