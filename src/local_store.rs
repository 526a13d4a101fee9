//! Local store (spec §4.3): the two maps (home-owned vs. cached) keyed by
//! URI to `(value, version)`, versioned updates, wildcard scan, observer
//! fan-out, and meta-resource dispatch.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use crate::uri;

pub type ObserverFn = dyn Fn(&str, Option<&str>, Option<u64>) + Send + Sync;

/// A meta-resource handler: given the trimmed URI prefix (REDESIGN FLAG #5 —
/// never a tuple), produce the resource's opaque string value. Receives a
/// reference to the owning store so built-ins like `~keys~` can inspect it.
pub type MetaResourceFn = dyn Fn(&LocalStore, &str) -> String + Send + Sync;

struct Maps {
    owned: HashMap<String, (String, u64)>,
    cached: LruCache<String, (String, u64)>,
}

pub struct LocalStore {
    pub store_id: String,
    pub root: String,
    pub home: String,
    maps: Mutex<Maps>,
    observers: Mutex<HashMap<String, Arc<ObserverFn>>>,
    metaresources: Mutex<HashMap<String, Arc<MetaResourceFn>>>,
}

impl LocalStore {
    pub fn new(store_id: impl Into<String>, root: impl Into<String>, home: impl Into<String>, cache_size: usize) -> Self {
        let cap = NonZeroUsize::new(cache_size.max(1)).unwrap();
        LocalStore {
            store_id: store_id.into(),
            root: root.into(),
            home: home.into(),
            maps: Mutex::new(Maps { owned: HashMap::new(), cached: LruCache::new(cap) }),
            observers: Mutex::new(HashMap::new()),
            metaresources: Mutex::new(HashMap::new()),
        }
    }

    fn is_owned_uri(&self, key: &str) -> bool {
        key.starts_with(&self.home)
    }

    /// Local read, no network. Invariant 1-3: owned and cached are disjoint
    /// and scoped by prefix, so a plain lookup in the right map suffices.
    pub fn get_value(&self, uri: &str) -> Option<(String, u64)> {
        let mut maps = self.maps.lock();
        if self.is_owned_uri(uri) {
            maps.owned.get(uri).cloned()
        } else {
            // `get`, not `peek` — a read marks the entry recently used, so a
            // hot cached key survives eviction under the bound in §4.3.
            maps.cached.get(uri).cloned()
        }
    }

    pub fn get_version(&self, uri: &str) -> Option<u64> {
        self.get_value(uri).map(|(_, v)| v)
    }

    pub fn next_version(&self, uri: &str) -> u64 {
        self.get_version(uri).map(|v| v + 1).unwrap_or(0)
    }

    /// Monotonic write, the sole path into `owned`/`cached`. Rejects
    /// meta-resource URIs (invariant 7) and stale/equal versions (invariant 5,
    /// spec §7 "version regression").
    pub fn update_value(&self, key: &str, value: &str, version: u64) -> bool {
        if uri::is_meta_resource(key) {
            log::debug!("local_store: refusing to store meta-resource {key}");
            return false;
        }

        let mut maps = self.maps.lock();
        if self.is_owned_uri(key) {
            let current = maps.owned.get(key).map(|(_, v)| *v);
            if current.is_some_and(|c| version <= c) {
                return false;
            }
            maps.owned.insert(key.to_string(), (value.to_string(), version));
            true
        } else {
            let current = maps.cached.peek(key).map(|(_, v)| *v);
            if current.is_some_and(|c| version <= c) {
                return false;
            }
            maps.cached.put(key.to_string(), (value.to_string(), version));
            true
        }
    }

    /// Delete locally without publishing anything on the wire — used both
    /// for a local `remove` (the caller publishes separately) and for
    /// applying a remote disposal.
    pub fn delete(&self, key: &str) -> bool {
        let mut maps = self.maps.lock();
        if maps.owned.remove(key).is_some() {
            true
        } else {
            maps.cached.pop(key).is_some()
        }
    }

    pub fn owned_len(&self) -> usize {
        self.maps.lock().owned.len()
    }

    pub fn cached_len(&self) -> usize {
        self.maps.lock().cached.len()
    }

    pub fn owned_keys(&self) -> Vec<String> {
        self.maps.lock().owned.keys().cloned().collect()
    }

    /// Wildcard scan of both maps (spec §4.3 `get_all`). A meta-resource
    /// pattern is dispatched to its registered handler first, matching the
    /// original's `getAll` (the `~name~` check precedes its glob scan);
    /// everything else falls through to the glob scan of `owned`/`cached`.
    pub fn get_all(&self, pattern: &str) -> Vec<(String, String, u64)> {
        if uri::is_meta_resource(pattern) {
            return match self.resolve_metaresource(pattern) {
                Some(value) => vec![(pattern.to_string(), value, 0)],
                None => Vec::new(),
            };
        }

        let Ok(matcher) = uri::compile_glob(pattern) else { return Vec::new() };
        let maps = self.maps.lock();
        let mut out = Vec::new();
        for (k, (v, ver)) in maps.owned.iter() {
            if matcher.is_match(k) {
                out.push((k.clone(), v.clone(), *ver));
            }
        }
        for (k, (v, ver)) in maps.cached.iter() {
            if matcher.is_match(k) {
                out.push((k.clone(), v.clone(), *ver));
            }
        }
        out
    }

    pub fn observe(&self, pattern: impl Into<String>, callback: Arc<ObserverFn>) {
        self.observers.lock().insert(pattern.into(), callback);
    }

    /// Bidirectional fnmatch fan-out (spec §4.3, design note: deliberate).
    /// Must run with no lock held, since callbacks may re-enter the store.
    pub fn notify_observers(&self, key: &str, value: Option<&str>, version: Option<u64>) {
        let callbacks: Vec<Arc<ObserverFn>> = {
            let observers = self.observers.lock();
            observers
                .iter()
                .filter(|(pattern, _)| uri::fnmatch_either(key, pattern))
                .map(|(_, cb)| cb.clone())
                .collect()
        };
        for cb in callbacks {
            cb(key, value, version);
        }
    }

    pub fn register_metaresource(&self, name: impl Into<String>, handler: Arc<MetaResourceFn>) {
        self.metaresources.lock().insert(name.into(), handler);
    }

    /// Dispatch a meta-resource URI to its registered handler, receiving the
    /// trimmed prefix alone (REDESIGN FLAG #5).
    pub fn resolve_metaresource(&self, uri: &str) -> Option<String> {
        let (prefix, segment) = crate::uri::split_meta_resource(uri)?;
        let handler = self.metaresources.lock().get(segment).cloned()?;
        Some(handler(self, prefix))
    }

    pub fn has_metaresource(&self, segment: &str) -> bool {
        self.metaresources.lock().contains_key(segment)
    }

    /// Built-in `~keys~`: owned keys under a literal prefix, or matching a
    /// glob pattern if `prefix` contains `*`. Matches the original's
    /// `__get_keys_under` (glob vs. prefix branch).
    pub fn keys_under(&self, prefix: &str) -> Vec<String> {
        let keys = self.owned_keys();
        if prefix.contains('*') {
            let pattern = format!("{prefix}*");
            let Ok(matcher) = uri::compile_glob(&pattern) else { return Vec::new() };
            keys.into_iter().filter(|k| matcher.is_match(k)).collect()
        } else {
            keys.into_iter().filter(|k| k.starts_with(prefix)).collect()
        }
    }
}
