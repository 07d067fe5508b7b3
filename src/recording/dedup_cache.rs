// src/recording/dedup_cache.rs
//! Content-addressed dedup cache for shared payloads
//!
//! Two instances exist, one per payload class (event data, state
//! attributes). Resolution order on lookup:
//!
//! 1. the in-flight pending map (staged this batch, id not yet known)
//! 2. a bounded LRU of payload → committed id
//! 3. a store lookup filtered by hash and confirmed by full payload
//!    equality, so colliding hashes never merge distinct payloads
//!
//! The cache is authoritative only after a successful commit: ids assigned
//! inside a transaction are promoted by `post_commit_pending` and discarded
//! by `discard_pending_ids` when the transaction rolls back.
//!
//! Not thread-safe by design; only the worker thread mutates it.

use crate::storage::PayloadClass;
use crate::utils::errors::Result;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Stable 64-bit content hash stored in the `hash` column
pub fn hash_payload(payload: &str) -> i64 {
    let digest = Sha256::digest(payload.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// Where a row's shared-payload reference points
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadRef {
    /// Already committed under this id
    Committed(i64),
    /// Staged in the pending map under this payload key
    Pending(Arc<str>),
}

/// A payload staged for the next commit
#[derive(Debug)]
pub struct PendingPayload {
    pub hash: i64,
    /// Assigned during flush, inside the transaction
    pub id: Option<i64>,
}

/// Bounded dedup store for one payload class
pub struct ContentAddressedCache {
    class: PayloadClass,
    ids: LruCache<Arc<str>, i64>,
    pending: HashMap<Arc<str>, PendingPayload>,
    hits: u64,
    misses: u64,
}

impl ContentAddressedCache {
    pub fn new(class: PayloadClass, capacity: NonZeroUsize) -> Self {
        Self {
            class,
            ids: LruCache::new(capacity),
            pending: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn class(&self) -> PayloadClass {
        self.class
    }

    /// Resolve a payload to a reference, or `None` on a total miss (caller
    /// then stages a new row). `lookup` is the store probe: hash filter,
    /// equality confirm.
    pub fn get<F>(&mut self, payload: &Arc<str>, hash: i64, lookup: F) -> Result<Option<PayloadRef>>
    where
        F: FnOnce(i64, &str) -> Result<Option<i64>>,
    {
        if self.pending.contains_key(payload) {
            self.hits += 1;
            return Ok(Some(PayloadRef::Pending(Arc::clone(payload))));
        }

        if let Some(&id) = self.ids.get(payload) {
            self.hits += 1;
            return Ok(Some(PayloadRef::Committed(id)));
        }

        if let Some(id) = lookup(hash, payload)? {
            self.ids.put(Arc::clone(payload), id);
            self.hits += 1;
            return Ok(Some(PayloadRef::Committed(id)));
        }

        self.misses += 1;
        Ok(None)
    }

    /// Stage a brand-new payload for the next commit
    pub fn stage(&mut self, payload: Arc<str>, hash: i64) {
        self.pending
            .insert(payload, PendingPayload { hash, id: None });
    }

    /// Iterate staged payloads so the flush can insert them
    pub fn pending_mut(&mut self) -> impl Iterator<Item = (&Arc<str>, &mut PendingPayload)> {
        self.pending.iter_mut()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Id assigned to a staged payload during the current flush
    pub fn pending_id(&self, payload: &Arc<str>) -> Option<i64> {
        self.pending.get(payload).and_then(|entry| entry.id)
    }

    /// After a successful commit: promote every staged id into the LRU and
    /// clear the pending map. Dedup lookups are trustworthy again once this
    /// has run.
    pub fn post_commit_pending(&mut self) {
        for (payload, entry) in self.pending.drain() {
            match entry.id {
                Some(id) => {
                    self.ids.put(payload, id);
                }
                None => {
                    // A committed flush should have assigned every id.
                    warn!(
                        class = self.class.label(),
                        "staged payload committed without an id"
                    );
                }
            }
        }
    }

    /// After a failed commit: the transaction rolled back, so assigned ids
    /// point at rows that no longer exist. Keep the staged payloads for the
    /// retry, wipe the ids.
    pub fn discard_pending_ids(&mut self) {
        for entry in self.pending.values_mut() {
            entry.id = None;
        }
    }

    /// Scrub in-memory entries for ids removed by retention. Storage is
    /// untouched; this only invalidates the shortcut.
    pub fn evict_purged(&mut self, purged: &HashSet<i64>) {
        let stale: Vec<Arc<str>> = self
            .ids
            .iter()
            .filter(|(_, id)| purged.contains(id))
            .map(|(payload, _)| Arc::clone(payload))
            .collect();
        let evicted = stale.len();
        for payload in stale {
            self.ids.pop(&payload);
        }
        if evicted > 0 {
            debug!(class = self.class.label(), evicted, "evicted purged ids");
        }
    }

    /// Drop everything; committed ids no longer correspond to a real store
    /// after corruption recovery.
    pub fn reset(&mut self) {
        self.ids.clear();
        self.pending.clear();
    }

    /// Periodic memory bound: drop the LRU shortcut, keep staged payloads
    pub fn expire(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            cached: self.ids.len(),
            pending: self.pending.len(),
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub cached: usize,
    pub pending: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> ContentAddressedCache {
        ContentAddressedCache::new(PayloadClass::EventData, NonZeroUsize::new(4).unwrap())
    }

    fn key(payload: &str) -> Arc<str> {
        Arc::from(payload)
    }

    fn no_store(_hash: i64, _payload: &str) -> Result<Option<i64>> {
        Ok(None)
    }

    #[test]
    fn test_total_miss_then_stage() {
        let mut cache = cache();
        let payload = key(r#"{"a":1}"#);
        let hash = hash_payload(&payload);

        assert_eq!(cache.get(&payload, hash, no_store).unwrap(), None);
        cache.stage(Arc::clone(&payload), hash);

        // Second sighting in the same batch resolves to the staged entry.
        assert_eq!(
            cache.get(&payload, hash, no_store).unwrap(),
            Some(PayloadRef::Pending(Arc::clone(&payload)))
        );
    }

    #[test]
    fn test_commit_promotes_pending_into_lru() {
        let mut cache = cache();
        let payload = key(r#"{"a":1}"#);
        let hash = hash_payload(&payload);

        cache.stage(Arc::clone(&payload), hash);
        for (_, entry) in cache.pending_mut() {
            entry.id = Some(42);
        }
        assert_eq!(cache.pending_id(&payload), Some(42));
        cache.post_commit_pending();

        assert_eq!(cache.pending_len(), 0);
        assert_eq!(
            cache.get(&payload, hash, no_store).unwrap(),
            Some(PayloadRef::Committed(42))
        );
    }

    #[test]
    fn test_failed_commit_leaves_no_stale_ids() {
        let mut cache = cache();
        let payload = key(r#"{"a":1}"#);
        let hash = hash_payload(&payload);

        cache.stage(Arc::clone(&payload), hash);
        for (_, entry) in cache.pending_mut() {
            entry.id = Some(42);
        }
        cache.discard_pending_ids();

        // Still staged for the retry, but the rolled-back id is gone.
        assert_eq!(cache.pending_id(&payload), None);
        assert_eq!(
            cache.get(&payload, hash, no_store).unwrap(),
            Some(PayloadRef::Pending(payload))
        );
    }

    #[test]
    fn test_store_hit_populates_lru() {
        let mut cache = cache();
        let payload = key(r#"{"a":1}"#);
        let hash = hash_payload(&payload);

        let mut probes = 0;
        let result = cache
            .get(&payload, hash, |h, p| {
                probes += 1;
                assert_eq!(h, hash);
                assert_eq!(p, payload.as_ref());
                Ok(Some(7))
            })
            .unwrap();
        assert_eq!(result, Some(PayloadRef::Committed(7)));

        // Cached now; the store must not be probed again.
        let result = cache
            .get(&payload, hash, |_, _| panic!("store probed on LRU hit"))
            .unwrap();
        assert_eq!(result, Some(PayloadRef::Committed(7)));
        assert_eq!(probes, 1);
    }

    #[test]
    fn test_colliding_hashes_stay_distinct() {
        let mut cache = cache();
        let a = key(r#"{"a":1}"#);
        let b = key(r#"{"b":2}"#);
        let shared_hash = 99;

        // The store holds payload `a` under this hash; an equality-checking
        // probe must not return it for payload `b`.
        let lookup = |_: i64, probe: &str| -> Result<Option<i64>> {
            Ok((probe == a.as_ref()).then_some(1))
        };
        assert_eq!(
            cache.get(&a, shared_hash, lookup).unwrap(),
            Some(PayloadRef::Committed(1))
        );
        assert_eq!(cache.get(&b, shared_hash, lookup).unwrap(), None);

        cache.stage(Arc::clone(&b), shared_hash);
        assert_eq!(cache.pending_len(), 1);
        assert_eq!(
            cache.get(&a, shared_hash, no_store).unwrap(),
            Some(PayloadRef::Committed(1))
        );
    }

    #[test]
    fn test_evict_purged_spares_unrelated_entries() {
        let mut cache = cache();
        let a = key(r#"{"a":1}"#);
        let b = key(r#"{"b":2}"#);

        cache.stage(Arc::clone(&a), hash_payload(&a));
        cache.stage(Arc::clone(&b), hash_payload(&b));
        let mut next = 1;
        for (_, entry) in cache.pending_mut() {
            entry.id = Some(next);
            next += 1;
        }
        cache.post_commit_pending();

        let purged_id = cache
            .get(&a, hash_payload(&a), no_store)
            .unwrap()
            .and_then(|r| match r {
                PayloadRef::Committed(id) => Some(id),
                PayloadRef::Pending(_) => None,
            })
            .unwrap();

        cache.evict_purged(&HashSet::from([purged_id]));

        assert_eq!(cache.get(&a, hash_payload(&a), no_store).unwrap(), None);
        assert!(matches!(
            cache.get(&b, hash_payload(&b), no_store).unwrap(),
            Some(PayloadRef::Committed(_))
        ));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut cache = cache();
        let a = key(r#"{"a":1}"#);
        cache.stage(Arc::clone(&a), hash_payload(&a));
        cache.reset();
        assert_eq!(cache.pending_len(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_capacity_is_bounded() {
        let mut cache = cache();
        for i in 0..10 {
            let payload = key(&format!(r#"{{"i":{}}}"#, i));
            cache.stage(Arc::clone(&payload), hash_payload(&payload));
        }
        let mut next = 1;
        for (_, entry) in cache.pending_mut() {
            entry.id = Some(next);
            next += 1;
        }
        cache.post_commit_pending();
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_hash_payload_is_stable_and_discriminating() {
        assert_eq!(hash_payload("{}"), hash_payload("{}"));
        assert_ne!(hash_payload(r#"{"a":1}"#), hash_payload(r#"{"a":2}"#));
    }
}
