//! A peer-to-peer distributed cache federation core.
//!
//! Each [`Store`] owns a disjoint slice of a shared `root` keyspace (its
//! `home`), opportunistically caches values it doesn't own under a bounded
//! LRU, and resolves misses by asking its peers over a pub/sub substrate.
//! Conflicts between concurrent writers are settled by a monotonic
//! per-key version: highest version wins.
//!
//! ```no_run
//! use castellan::{Store, Timings};
//!
//! # async fn example() {
//! let store = Store::new("store-a", "/fleet", "/fleet/store-a", 1024, Timings::default()).unwrap();
//! store.put("/fleet/store-a/status", "ready");
//! assert_eq!(store.get("/fleet/store-a/status").await, Some("ready".to_string()));
//! store.close();
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod dput;
pub mod error;
pub mod local_store;
pub mod messaging;
pub mod peers;
pub mod protocol;
pub mod uri;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

pub use config::Timings;
pub use error::CastellanError;

use controller::{Controller, Handle};
use local_store::{LocalStore, ObserverFn};
use messaging::{LocalBus, Transport};
use peers::PeerRegistry;

/// Front-end handle to one participant in the federation. Composes the
/// local store, peer registry and coherence controller; this is the only
/// type application code needs to touch.
pub struct Store {
    local: Arc<LocalStore>,
    peers: Arc<PeerRegistry>,
    controller: Arc<Controller>,
    handle: Handle,
    root: String,
    closed: AtomicBool,
}

impl Store {
    /// Join (or create) the federation partitioned by `root`, owning the
    /// `home` sub-tree. `cache_size` bounds the LRU-evicted cache of values
    /// this store doesn't own. Starts the background controller tasks and
    /// advertises presence immediately.
    ///
    /// Fails if `home` doesn't fall under `root` (spec invariant: `home`
    /// must have `root` as a prefix) — the one config error this crate
    /// actually surfaces, per its policy that every other condition is
    /// transient and comes back as `None`/`false`/`vec![]` instead.
    pub fn new(
        store_id: impl Into<String>,
        root: impl Into<String>,
        home: impl Into<String>,
        cache_size: usize,
        timings: Timings,
    ) -> Result<Self, CastellanError> {
        let root = root.into();
        let home = home.into();
        let store_id = store_id.into();

        if !home.starts_with(&root) {
            return Err(CastellanError::InvalidConfig(format!(
                "home {home:?} must have root {root:?} as a prefix"
            )));
        }

        let local = Arc::new(LocalStore::new(store_id.clone(), root.clone(), home.clone(), cache_size));
        let peers = Arc::new(PeerRegistry::new(store_id.clone()));
        let transport: Arc<dyn Transport> = Arc::new(LocalBus::for_partition(&root));
        let controller = Controller::new(store_id, home, local.clone(), peers.clone(), transport, timings);

        register_builtin_metaresources(&local, &peers);

        let handle = controller.start();

        Ok(Store { local, peers, controller, handle, root, closed: AtomicBool::new(false) })
    }

    /// Store a value under `uri` (must fall under this store's `home`),
    /// bump its version, publish the put, and notify local observers.
    pub fn put(&self, uri: &str, value: &str) {
        if uri::is_meta_resource(uri) {
            log::debug!("store: refusing to put meta-resource {uri}");
            return;
        }
        let version = self.local.next_version(uri);
        if self.local.update_value(uri, value, version) {
            self.controller.publish_put(uri, value, version);
            self.local.notify_observers(uri, Some(value), Some(version));
        }
    }

    /// Delta-merge `patch` (a JSON object) into the value currently stored
    /// at `uri` (parsed as JSON; absent values start from `{}`), or apply an
    /// inline `uri#k=v&k2=v2` patch when `patch` is `None`. The merge base
    /// comes from `get`, not a local-only read, so a key this store hasn't
    /// seen yet resolves against the federation first instead of merging
    /// against `{}` and clobbering whatever peers actually hold.
    pub async fn dput(&self, uri: &str, patch: Option<&Value>) {
        let (base_uri, inline_pairs) = dput::split_inline_patch(uri);

        let existing = self.get(base_uri).await;
        let current = existing
            .as_deref()
            .filter(|v| !v.is_empty())
            .and_then(|v| serde_json::from_str::<Value>(v).ok())
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
        // `next_version` is computed after the resolve above, so it sees
        // whatever `get` just installed locally on a remote hit.
        let version = match existing.as_deref() {
            Some(v) if !v.is_empty() => self.local.next_version(base_uri),
            _ => 0,
        };

        let merged = match patch {
            Some(patch) => dput::merge(current, patch.clone()),
            None => {
                let mut acc = current;
                for (k, v) in inline_pairs {
                    acc = dput::merge(acc, dput::dot_to_value(k, v));
                }
                acc
            }
        };

        let serialized = merged.to_string();
        if self.local.update_value(base_uri, &serialized, version) {
            self.controller.publish_put(base_uri, &serialized, version);
            self.local.notify_observers(base_uri, Some(&serialized), Some(version));
        }
    }

    /// Value alone (REDESIGN FLAG #4's intentional asymmetry with
    /// `resolve`). A home meta-resource resolves locally; anything else on
    /// a cache miss falls back to a network round-trip, whose result is
    /// installed into the local cache and announced to observers before
    /// being returned — matching the original's `get`-always-resolves
    /// behavior rather than leaving the caller to miss twice.
    pub async fn get(&self, uri: &str) -> Option<String> {
        if uri::is_meta_resource(uri) {
            if uri.starts_with(&self.local.home) {
                return self.local.resolve_metaresource(uri);
            }
            let (value, version) = self.resolve(uri, None).await;
            if let (Some(value), Some(version)) = (&value, version) {
                self.local.notify_observers(uri, Some(value), Some(version));
            }
            return value;
        }

        if let Some((v, _)) = self.local.get_value(uri) {
            return Some(v);
        }

        let (value, version) = self.resolve(uri, None).await;
        match (value, version) {
            (Some(value), Some(version)) => {
                self.local.update_value(uri, &value, version);
                self.local.notify_observers(uri, Some(&value), Some(version));
                Some(value)
            }
            _ => None,
        }
    }

    /// Local-only read with version, for callers that need it without
    /// paying for a network round-trip.
    pub fn get_value(&self, uri: &str) -> Option<(String, u64)> {
        self.local.get_value(uri)
    }

    /// Local-only wildcard scan; unlike `get`, never triggers a resolve.
    pub fn get_all(&self, pattern: &str) -> Vec<(String, String, u64)> {
        self.local.get_all(pattern)
    }

    /// Remove `uri` locally and publish the removal so peers drop their
    /// cached copies too.
    pub fn remove(&self, uri: &str) {
        if self.local.delete(uri) {
            self.controller.publish_remove(uri);
            self.local.notify_observers(uri, None, None);
        }
    }

    /// Always resolves against the federation (never short-circuits on a
    /// local hit, unlike `get`) and returns both value and version.
    pub async fn resolve(&self, uri: &str, timeout: Option<Duration>) -> (Option<String>, Option<u64>) {
        self.controller.resolve(uri, timeout).await
    }

    /// Resolve every key matching `pattern` against the federation,
    /// consolidating local and remote answers by highest version per key.
    pub async fn resolve_all(&self, pattern: &str, timeout: Option<Duration>) -> Vec<(String, String, u64)> {
        let mut local = self.local.get_all(pattern);
        let remote = self.controller.resolve_all(pattern, timeout).await;
        local.extend(remote);
        dedup_by_highest_version(local)
    }

    /// Register an observer invoked for every local update whose key
    /// bidirectionally `fnmatch`es `pattern`. Fires for both local puts and
    /// ingested remote puts, never while any internal lock is held.
    pub fn observe(&self, pattern: impl Into<String>, callback: Arc<ObserverFn>) {
        self.local.observe(pattern, callback);
    }

    /// Stop background tasks, announce departure from the federation, and
    /// release this store's reference to its partition's bus. Idempotent —
    /// a second call is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handle.stop();
        self.controller.close();
        LocalBus::release_partition(&self.root);
    }
}

fn dedup_by_highest_version(entries: Vec<(String, String, u64)>) -> Vec<(String, String, u64)> {
    let mut best: std::collections::HashMap<String, (String, String, u64)> = std::collections::HashMap::new();
    for (k, v, ver) in entries {
        match best.get(&k) {
            Some((_, _, existing)) if *existing >= ver => {}
            _ => {
                best.insert(k.clone(), (k, v, ver));
            }
        }
    }
    best.into_values().collect()
}

/// `~keys~` (owned keys under a prefix) and `~stores~` (known peer ids),
/// the two built-in meta-resources spec §3 calls out as pre-registered.
fn register_builtin_metaresources(local: &Arc<LocalStore>, peers: &Arc<PeerRegistry>) {
    local.register_metaresource(
        "~keys~",
        Arc::new(|store: &LocalStore, prefix: &str| {
            let mut keys = store.keys_under(prefix);
            keys.sort();
            keys.join(",")
        }),
    );

    let peers = peers.clone();
    local.register_metaresource(
        "~stores~",
        Arc::new(move |_store: &LocalStore, _prefix: &str| {
            let mut ids: Vec<String> = peers.snapshot().into_iter().collect();
            ids.sort();
            ids.join(",")
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_root(name: &str) -> String {
        format!("/fed/{name}")
    }

    #[test]
    fn home_outside_root_is_rejected() {
        let err = Store::new("s1", "/fed/home-check", "/elsewhere/s1", 8, Timings::fast()).unwrap_err();
        assert!(matches!(err, CastellanError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn put_get_roundtrip_is_local_only() {
        let root = fresh_root("rt");
        let store = Store::new("s1", &root, format!("{root}/s1"), 64, Timings::fast()).unwrap();
        store.put(&format!("{root}/s1/x"), "hello");
        assert_eq!(store.get(&format!("{root}/s1/x")).await, Some("hello".to_string()));
        store.close();
    }

    #[tokio::test]
    async fn remove_clears_local_value() {
        let root = fresh_root("rm");
        let store = Store::new("s1", &root, format!("{root}/s1"), 64, Timings::fast()).unwrap();
        store.put(&format!("{root}/s1/x"), "hello");
        store.remove(&format!("{root}/s1/x"));
        assert_eq!(store.get_value(&format!("{root}/s1/x")), None);
        store.close();
    }

    #[tokio::test]
    async fn keys_metaresource_lists_owned_keys_under_prefix() {
        let root = fresh_root("mk");
        let store = Store::new("s1", &root, format!("{root}/s1"), 64, Timings::fast()).unwrap();
        store.put(&format!("{root}/s1/a"), "1");
        store.put(&format!("{root}/s1/b"), "2");
        let got = store.get(&format!("{root}/s1/~keys~")).await.unwrap();
        let mut keys: Vec<&str> = got.split(',').collect();
        keys.sort();
        assert_eq!(keys, vec![format!("{root}/s1/a"), format!("{root}/s1/b")]);
        store.close();
    }

    #[tokio::test]
    async fn dput_merges_inline_patch_into_json_object() {
        let root = fresh_root("dp");
        let store = Store::new("s1", &root, format!("{root}/s1"), 64, Timings::fast()).unwrap();
        let uri = format!("{root}/s1/task#status=running&owner=s1");
        store.dput(&uri, None).await;
        let base = format!("{root}/s1/task");
        let got: Value = serde_json::from_str(&store.get(&base).await.unwrap()).unwrap();
        assert_eq!(got["status"], "running");
        assert_eq!(got["owner"], "s1");
        store.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dput_resolves_remote_base_before_merging() {
        let root = fresh_root("dput-remote");
        let a = Store::new("a", &root, format!("{root}/a"), 64, Timings::fast()).unwrap();
        let b = Store::new("b", &root, format!("{root}/b"), 64, Timings::fast()).unwrap();

        a.put(&format!("{root}/a/task"), r#"{"status":"queued"}"#);

        // b has never seen this key locally; dput must resolve it from a
        // instead of merging the patch against `{}`.
        b.dput(&format!("{root}/a/task#owner=b"), None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let got: Value = serde_json::from_str(&a.get(&format!("{root}/a/task")).await.unwrap()).unwrap();
        assert_eq!(got["status"], "queued");
        assert_eq!(got["owner"], "b");

        a.close();
        b.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_fetches_value_from_remote_peer() {
        let root = fresh_root("resolve");
        let a = Store::new("a", &root, format!("{root}/a"), 64, Timings::fast()).unwrap();
        let b = Store::new("b", &root, format!("{root}/b"), 64, Timings::fast()).unwrap();
        b.put(&format!("{root}/b/x"), "from-b");

        let (value, version) = a.resolve(&format!("{root}/b/x"), Some(Duration::from_millis(200))).await;
        assert_eq!(value, Some("from-b".to_string()));
        assert_eq!(version, Some(0));

        a.close();
        b.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_all_collects_matches_from_remote_peer() {
        let root = fresh_root("resolve-all");
        let a = Store::new("a", &root, format!("{root}/a"), 64, Timings::fast()).unwrap();
        let b = Store::new("b", &root, format!("{root}/b"), 64, Timings::fast()).unwrap();
        b.put(&format!("{root}/b/1"), "one");
        b.put(&format!("{root}/b/2"), "two");

        let mut got = a.resolve_all(&format!("{root}/b/*"), Some(Duration::from_millis(200))).await;
        got.sort();
        assert_eq!(
            got,
            vec![
                (format!("{root}/b/1"), "one".to_string(), 0),
                (format!("{root}/b/2"), "two".to_string(), 0),
            ]
        );

        a.close();
        b.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn get_on_miss_resolves_remotely_and_caches_result() {
        let root = fresh_root("get-miss");
        let a = Store::new("a", &root, format!("{root}/a"), 64, Timings::fast()).unwrap();
        let b = Store::new("b", &root, format!("{root}/b"), 64, Timings::fast()).unwrap();
        a.put(&format!("{root}/a/x"), "hello");

        let got = b.get(&format!("{root}/a/x")).await;
        assert_eq!(got, Some("hello".to_string()));
        // installed into b's cached map (not owned, since /a isn't b's home)
        assert_eq!(b.get_value(&format!("{root}/a/x")), Some(("hello".to_string(), 0)));

        a.close();
        b.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_put_is_ingested_and_observable() {
        let root = fresh_root("ingest");
        let a = Store::new("a", &root, format!("{root}/a"), 64, Timings::fast()).unwrap();
        let b = Store::new("b", &root, format!("{root}/b"), 64, Timings::fast()).unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        a.observe(format!("{root}/b/*"), Arc::new(move |uri: &str, value: Option<&str>, _version| {
            seen2.lock().unwrap().push((uri.to_string(), value.map(str::to_string)));
        }));

        b.put(&format!("{root}/b/x"), "hi");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let log = seen.lock().unwrap();
        assert!(log.iter().any(|(uri, v)| uri == &format!("{root}/b/x") && v.as_deref() == Some("hi")));

        a.close();
        b.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resolve_reflects_highest_version_after_repeated_puts() {
        let root = fresh_root("version-reconcile");
        let a = Store::new("a", &root, format!("{root}/a"), 64, Timings::fast()).unwrap();
        let b = Store::new("b", &root, format!("{root}/b"), 64, Timings::fast()).unwrap();

        a.put(&format!("{root}/a/x"), "v0");
        let (value, version) = b.resolve(&format!("{root}/a/x"), Some(Duration::from_millis(200))).await;
        assert_eq!(value, Some("v0".to_string()));
        assert_eq!(version, Some(0));

        a.put(&format!("{root}/a/x"), "v1");
        let (value, version) = b.resolve(&format!("{root}/a/x"), Some(Duration::from_millis(200))).await;
        assert_eq!(value, Some("v1".to_string()));
        assert_eq!(version, Some(1));

        a.close();
        b.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_peer_is_evicted_from_others_registry() {
        let root = fresh_root("peer-disposal");
        let a = Store::new("a", &root, format!("{root}/a"), 64, Timings::fast()).unwrap();
        let b = Store::new("b", &root, format!("{root}/b"), 64, Timings::fast()).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stores = a.get(&format!("{root}/a/~stores~")).await.unwrap();
        assert!(stores.split(',').any(|id| id == "b"));

        b.close();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stores_after = a.get(&format!("{root}/a/~stores~")).await.unwrap();
        assert!(!stores_after.split(',').any(|id| id == "b"));

        a.close();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remove_propagates_to_peers_cached_copy() {
        let root = fresh_root("remove-propagation");
        let a = Store::new("a", &root, format!("{root}/a"), 64, Timings::fast()).unwrap();
        let b = Store::new("b", &root, format!("{root}/b"), 64, Timings::fast()).unwrap();

        a.put(&format!("{root}/a/x"), "hello");
        let got = b.get(&format!("{root}/a/x")).await;
        assert_eq!(got, Some("hello".to_string()));
        assert!(b.get_value(&format!("{root}/a/x")).is_some());

        a.remove(&format!("{root}/a/x"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(b.get_value(&format!("{root}/a/x")), None);

        a.close();
        b.close();
    }
}
