//! A single bounded cache tier.
//!
//! A level owns an entry index (metadata), resident values, and an eviction
//! policy. Persistent levels also write each entry to a [`BackingStore`] and
//! hydrate values lazily from it on read, so a restarted process can
//! [`load`](CacheLevel::load) the previous contents.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::CacheError;
use crate::eviction::EvictionPolicy;
use crate::store::BackingStore;
use crate::value::{self, CacheValue};

/// Store key prefix for entry blobs.
const ENTRY_PREFIX: &str = "entry:";

/// Store key of the metadata index blob.
const INDEX_KEY: &str = ".index";

/// Index changes tolerated before the index blob is rewritten.
const INDEX_SAVE_INTERVAL: usize = 64;

/// Capacity limits of a level. A limit of `None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capacity {
    pub max_entries: Option<usize>,
    pub max_bytes: Option<usize>,
}

impl Capacity {
    /// At most `n` entries, any size.
    pub fn entries(n: usize) -> Self {
        Self {
            max_entries: Some(n),
            max_bytes: None,
        }
    }

    /// At most `n` bytes of estimated payload, any count.
    pub fn bytes(n: usize) -> Self {
        Self {
            max_entries: None,
            max_bytes: Some(n),
        }
    }

    /// Adds a byte limit to this capacity.
    pub fn with_max_bytes(mut self, n: usize) -> Self {
        self.max_bytes = Some(n);
        self
    }

    /// Whether a single entry of `size` bytes could ever fit.
    pub fn admits(&self, size: usize) -> bool {
        self.max_entries.map_or(true, |max| max > 0) && self.max_bytes.map_or(true, |max| size <= max)
    }

    /// Whether `count` entries totalling `bytes` are within limits.
    pub fn fits(&self, count: usize, bytes: usize) -> bool {
        self.max_entries.map_or(true, |max| count <= max) && self.max_bytes.map_or(true, |max| bytes <= max)
    }
}

/// Metadata kept for every entry in a level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub key: String,
    /// Estimated payload size, used for capacity accounting only
    pub size_bytes: usize,
    pub created_at: SystemTime,
    pub last_accessed: SystemTime,
    pub access_count: u64,
}

impl EntryMeta {
    fn new(key: &str, size_bytes: usize) -> Self {
        let now = SystemTime::now();
        Self {
            key: key.to_string(),
            size_bytes,
            created_at: now,
            last_accessed: now,
            access_count: 0,
        }
    }
}

/// Counters for one level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LevelStats {
    pub name: String,
    pub hits: u64,
    pub misses: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Entries removed because their time-to-live elapsed
    pub expirations: u64,
    pub entry_count: usize,
    pub bytes_used: usize,
    /// Failed writes to the backing store
    pub write_failures: u64,
}

impl LevelStats {
    /// Calculate the hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// One tier of a multi-level cache.
///
/// Not synchronized: [`CacheManager`](crate::CacheManager) serializes access
/// to all of its levels behind one lock.
pub struct CacheLevel<V> {
    name: String,
    capacity: Capacity,
    policy: Box<dyn EvictionPolicy>,
    index: HashMap<String, EntryMeta>,
    /// Resident values. For persistent levels only entries whose blob write
    /// failed are resident; everything else is read back from the store.
    values: HashMap<String, V>,
    bytes_used: usize,
    store: Option<Box<dyn BackingStore>>,
    /// Entry lifetime applied on top of the eviction policy
    ttl: Option<Duration>,
    /// Index changes not yet written to the store
    unsaved_changes: usize,
    stats: LevelStats,
}

impl<V: CacheValue> CacheLevel<V> {
    /// Creates an in-memory level.
    pub fn new(name: impl Into<String>, capacity: Capacity, policy: Box<dyn EvictionPolicy>) -> Self {
        let name = name.into();
        debug!(level = %name, policy = policy.name(), ?capacity, "Created cache level");
        Self {
            stats: LevelStats {
                name: name.clone(),
                ..Default::default()
            },
            name,
            capacity,
            policy,
            index: HashMap::new(),
            values: HashMap::new(),
            bytes_used: 0,
            store: None,
            ttl: None,
            unsaved_changes: 0,
        }
    }

    /// Expires entries `ttl` after they were written, whatever the eviction
    /// policy. A zero duration disables expiry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = (!ttl.is_zero()).then_some(ttl);
        self
    }

    /// Creates a level persisted to `store`. Call [`load`](Self::load) to pick
    /// up entries written by a previous instance.
    pub fn persistent<S>(name: impl Into<String>, capacity: Capacity, policy: Box<dyn EvictionPolicy>, store: S) -> Self
    where
        S: BackingStore + 'static,
    {
        let mut level = Self::new(name, capacity, policy);
        level.store = Some(Box::new(store));
        level
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn is_persistent(&self) -> bool {
        self.store.is_some()
    }

    /// Number of entries currently indexed.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Aggregate estimated size of all entries.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Metadata for `key`, without touching recency.
    pub fn entry(&self, key: &str) -> Option<&EntryMeta> {
        self.index.get(key)
    }

    /// Looks up `key`, updating recency and access counters on a hit.
    pub fn get(&mut self, key: &str) -> Option<V> {
        self.get_with_size(key).map(|(value, _)| value)
    }

    /// Like [`get`](Self::get), also returning the entry's recorded size.
    pub(crate) fn get_with_size(&mut self, key: &str) -> Option<(V, usize)> {
        self.purge_expired();

        if !self.index.contains_key(key) {
            self.stats.misses += 1;
            return None;
        }

        let value = match self.values.get(key) {
            Some(value) => value.clone(),
            None => match self.hydrate(key) {
                Some(value) => value,
                None => {
                    // Unreadable entry: forget it so other entries stay consistent
                    self.remove_entry(key);
                    self.index_changed();
                    self.stats.misses += 1;
                    return None;
                }
            },
        };

        let meta = self.index.get_mut(key)?;
        meta.last_accessed = SystemTime::now();
        meta.access_count += 1;
        self.policy.on_access(meta);
        self.stats.hits += 1;

        let mut value = value;
        value.on_hit(meta);
        Some((value, meta.size_bytes))
    }

    /// Inserts `value` under `key`, evicting as needed.
    ///
    /// `size_hint` overrides [`CacheValue::estimated_size`]. Returns
    /// `Ok(false)` if the entry alone exceeds the level's capacity; nothing
    /// is evicted in that case.
    ///
    /// # Errors
    /// Returns [`CacheError::CapacityMisconfigured`] if the level is over
    /// capacity and the policy offers no victim.
    pub fn put(&mut self, key: &str, value: V, size_hint: Option<usize>) -> Result<bool, CacheError> {
        let size = size_hint.unwrap_or_else(|| value.estimated_size());
        if !self.capacity.admits(size) {
            debug!(level = %self.name, key, size, "Entry exceeds level capacity, declined");
            return Ok(false);
        }

        self.purge_expired();

        let replaced = match self.index.remove(key) {
            Some(old) => {
                self.bytes_used = self.bytes_used.saturating_sub(old.size_bytes);
                self.values.remove(key);
                self.policy.on_remove(key);
                true
            }
            None => false,
        };

        while !self.capacity.fits(self.index.len() + 1, self.bytes_used + size) {
            let Some(victim) = self.policy.select_victim(&self.index) else {
                error!(
                    level = %self.name,
                    entries = self.index.len(),
                    bytes = self.bytes_used,
                    "Over capacity but eviction policy returned no victim"
                );
                if replaced {
                    // The replaced entry is gone, so drop its blob and index record
                    self.delete_blob(key);
                    self.save_index();
                }
                return Err(CacheError::CapacityMisconfigured {
                    level: self.name.clone(),
                });
            };
            self.remove_entry(&victim);
            self.stats.evictions += 1;
            debug!(level = %self.name, key = %victim, "Evicted entry");
        }

        let meta = EntryMeta::new(key, size);
        let resident = match self.write_blob(key, &value) {
            Ok(persisted) => !persisted,
            Err(e) => {
                warn!(level = %self.name, key, error = %e, "Failed to persist cache entry, keeping it in memory");
                self.stats.write_failures += 1;
                // Do not leave a stale blob behind for a replaced entry
                self.delete_blob(key);
                true
            }
        };
        if resident {
            self.values.insert(key.to_string(), value);
        }

        self.policy.on_insert(&meta);
        self.index.insert(key.to_string(), meta);
        self.bytes_used += size;
        self.index_changed();
        Ok(true)
    }

    /// Removes `key`. Returns true if it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        let removed = self.remove_entry(key).is_some();
        if removed {
            self.index_changed();
        }
        removed
    }

    /// Removes every entry whose key matches `predicate`. Returns the count.
    pub fn remove_where<F: Fn(&str) -> bool>(&mut self, predicate: F) -> usize {
        let keys: Vec<String> = self.index.keys().filter(|k| predicate(k)).cloned().collect();
        for key in &keys {
            self.remove_entry(key);
        }
        if !keys.is_empty() {
            self.index_changed();
        }
        keys.len()
    }

    /// Removes every entry whose key starts with `prefix`.
    pub fn remove_prefix(&mut self, prefix: &str) -> usize {
        self.remove_where(|key| key.starts_with(prefix))
    }

    /// Returns true if `key` is present. Does not count as an access.
    pub fn contains(&mut self, key: &str) -> bool {
        self.purge_expired();
        self.index.contains_key(key)
    }

    /// Removes every entry, including persisted blobs.
    pub fn clear(&mut self) {
        if let Some(store) = &self.store {
            match store.list_keys() {
                Ok(keys) => {
                    for key in keys.iter().filter(|k| k.starts_with(ENTRY_PREFIX)) {
                        if let Err(e) = store.delete(key) {
                            warn!(level = %self.name, key = %key, error = %e, "Failed to delete cache blob");
                        }
                    }
                }
                Err(e) => warn!(level = %self.name, error = %e, "Failed to list cache blobs"),
            }
        }

        self.index.clear();
        self.values.clear();
        self.policy.clear();
        self.bytes_used = 0;
        self.save_index();
    }

    /// Rebuilds the entry index from the backing store.
    ///
    /// Only metadata is loaded; values are read back on first access. Blobs
    /// without metadata are deleted, entries that are expired or too large
    /// are dropped, and if the stored set exceeds capacity the policy's
    /// victims are dropped until it fits. Returns the number of entries kept.
    /// Non-persistent levels return `Ok(0)`.
    ///
    /// # Errors
    /// Returns an error if the store cannot be listed or read.
    pub fn load(&mut self) -> Result<usize, CacheError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let metas: Vec<EntryMeta> = match store.read(INDEX_KEY)? {
            Some(bytes) => match value::decode(&bytes) {
                Ok(metas) => metas,
                Err(e) => {
                    warn!(level = %self.name, error = %e, "Corrupt cache index, starting empty");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };
        let stored: HashSet<String> = store
            .list_keys()?
            .into_iter()
            .filter_map(|k| k.strip_prefix(ENTRY_PREFIX).map(str::to_string))
            .collect();

        self.index.clear();
        self.values.clear();
        self.policy.clear();

        let now = SystemTime::now();
        for meta in metas {
            if !stored.contains(&meta.key) {
                debug!(level = %self.name, key = %meta.key, "Indexed entry has no blob, skipping");
                continue;
            }
            if !self.capacity.admits(meta.size_bytes) || self.is_expired(&meta, now) {
                continue;
            }
            self.index.insert(meta.key.clone(), meta);
        }

        for key in stored.iter().filter(|k| !self.index.contains_key(k.as_str())) {
            self.delete_blob(key);
        }

        self.bytes_used = self.index.values().map(|m| m.size_bytes).sum();
        let metas: Vec<&EntryMeta> = self.index.values().collect();
        self.policy.restore(&metas);

        let mut dropped = 0;
        while !self.capacity.fits(self.index.len(), self.bytes_used) {
            let Some(victim) = self.policy.select_victim(&self.index) else {
                break;
            };
            self.remove_entry(&victim);
            dropped += 1;
        }

        self.save_index();
        info!(level = %self.name, entries = self.index.len(), dropped, "Loaded persistent cache level");
        Ok(self.index.len())
    }

    /// Snapshot of this level's counters.
    pub fn stats(&self) -> LevelStats {
        LevelStats {
            entry_count: self.index.len(),
            bytes_used: self.bytes_used,
            ..self.stats.clone()
        }
    }

    fn is_expired(&self, meta: &EntryMeta, now: SystemTime) -> bool {
        let past_ttl = self.ttl.is_some_and(|ttl| {
            now.duration_since(meta.created_at)
                .map(|age| age > ttl)
                .unwrap_or(false)
        });
        past_ttl || self.policy.is_expired(meta, now)
    }

    fn purge_expired(&mut self) {
        if self.ttl.is_none() && !self.policy.has_expiry() {
            return;
        }
        let now = SystemTime::now();
        let expired: Vec<String> = self
            .index
            .values()
            .filter(|meta| self.is_expired(meta, now))
            .map(|meta| meta.key.clone())
            .collect();
        if expired.is_empty() {
            return;
        }
        for key in &expired {
            self.remove_entry(key);
            self.stats.expirations += 1;
        }
        debug!(level = %self.name, count = expired.len(), "Purged expired entries");
        self.index_changed();
    }

    fn remove_entry(&mut self, key: &str) -> Option<EntryMeta> {
        let meta = self.index.remove(key)?;
        self.values.remove(key);
        self.bytes_used = self.bytes_used.saturating_sub(meta.size_bytes);
        self.policy.on_remove(key);
        self.delete_blob(key);
        Some(meta)
    }

    /// Returns Ok(true) if the value was written, Ok(false) for memory levels.
    fn write_blob(&self, key: &str, value: &V) -> Result<bool, CacheError> {
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let bytes = value::encode(value)?;
        store.write(&entry_key(key), &bytes)?;
        Ok(true)
    }

    fn delete_blob(&self, key: &str) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&entry_key(key)) {
                warn!(level = %self.name, key, error = %e, "Failed to delete cache blob");
            }
        }
    }

    fn hydrate(&self, key: &str) -> Option<V> {
        let store = self.store.as_ref()?;
        match store.read(&entry_key(key)) {
            Ok(Some(bytes)) => match value::decode(&bytes) {
                Ok(value) => {
                    debug!(level = %self.name, key, "Hydrated entry from store");
                    Some(value)
                }
                Err(e) => {
                    warn!(level = %self.name, key, error = %e, "Corrupt cache blob, treating as miss");
                    None
                }
            },
            Ok(None) => {
                warn!(level = %self.name, key, "Cache blob missing, treating as miss");
                None
            }
            Err(e) => {
                warn!(level = %self.name, key, error = %e, "Failed to read cache blob, treating as miss");
                None
            }
        }
    }
}

impl<V> CacheLevel<V> {
    /// Writes the entry index to the backing store.
    ///
    /// Index changes are written in batches, and access metadata only on
    /// `flush`, `clear`, `load` and drop. If the process dies between saves,
    /// blobs written since the last save are discarded as orphans by the
    /// next `load`.
    pub fn flush(&mut self) {
        self.save_index();
    }

    fn index_changed(&mut self) {
        self.unsaved_changes += 1;
        if self.unsaved_changes >= INDEX_SAVE_INTERVAL {
            self.save_index();
        }
    }

    fn save_index(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        self.unsaved_changes = 0;
        let mut metas: Vec<&EntryMeta> = self.index.values().collect();
        metas.sort_by(|a, b| a.key.cmp(&b.key));

        let result = value::encode(&metas).and_then(|bytes| Ok(store.write(INDEX_KEY, &bytes)?));
        if let Err(e) = result {
            warn!(level = %self.name, error = %e, "Failed to persist cache index");
            self.stats.write_failures += 1;
        }
    }
}

impl<V> Drop for CacheLevel<V> {
    fn drop(&mut self) {
        self.save_index();
    }
}

fn entry_key(key: &str) -> String {
    format!("{}{}", ENTRY_PREFIX, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eviction::{LfuPolicy, LruPolicy, PolicyKind, TtlPolicy};
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn lru_level(max_entries: usize) -> CacheLevel<String> {
        CacheLevel::new("memory", Capacity::entries(max_entries), Box::new(LruPolicy::new()))
    }

    fn persistent_level(store: &MemoryStore, max_entries: usize) -> CacheLevel<String> {
        CacheLevel::persistent(
            "disk",
            Capacity::entries(max_entries),
            Box::new(LruPolicy::new()),
            store.clone(),
        )
    }

    #[test]
    fn test_basic_put_get() {
        let mut level = lru_level(10);
        assert!(level.put("a", "alpha".to_string(), None).unwrap());

        assert_eq!(level.get("a").as_deref(), Some("alpha"));
        assert_eq!(level.get("b"), None);
        assert_eq!(level.len(), 1);
        assert_eq!(level.bytes_used(), 5);
    }

    #[test]
    fn test_hit_updates_access_metadata() {
        let mut level = lru_level(10);
        level.put("a", "x".to_string(), None).unwrap();
        let before = level.entry("a").unwrap().last_accessed;

        level.get("a");
        level.get("a");

        let meta = level.entry("a").unwrap();
        assert_eq!(meta.access_count, 2);
        assert!(meta.last_accessed >= before);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let mut level = lru_level(2);
        level.put("a", "1".to_string(), None).unwrap();
        level.put("b", "2".to_string(), None).unwrap();
        level.get("a");
        level.put("c", "3".to_string(), None).unwrap();

        assert!(level.contains("a"));
        assert!(!level.contains("b"));
        assert!(level.contains("c"));
        assert_eq!(level.stats().evictions, 1);
    }

    #[test]
    fn test_lfu_level_keeps_hot_entry() {
        let mut level: CacheLevel<String> =
            CacheLevel::new("memory", Capacity::entries(2), Box::new(LfuPolicy::new()));
        level.put("hot", "1".to_string(), None).unwrap();
        level.put("cold", "2".to_string(), None).unwrap();
        level.get("hot");
        level.get("hot");
        level.put("new", "3".to_string(), None).unwrap();

        assert!(level.contains("hot"));
        assert!(!level.contains("cold"));
    }

    #[test]
    fn test_oversized_entry_is_declined() {
        let mut level: CacheLevel<String> =
            CacheLevel::new("memory", Capacity::bytes(10), Box::new(LruPolicy::new()));
        level.put("small", "abc".to_string(), None).unwrap();

        assert!(!level.put("big", "x".repeat(11), None).unwrap());
        // Nothing was evicted to make room
        assert!(level.contains("small"));
        assert!(!level.contains("big"));
    }

    #[test]
    fn test_zero_entry_capacity_declines() {
        let mut level = lru_level(0);
        assert!(!level.put("a", "1".to_string(), None).unwrap());
        assert!(level.is_empty());
    }

    #[test]
    fn test_byte_capacity_evicts_until_fit() {
        let mut level: CacheLevel<String> =
            CacheLevel::new("memory", Capacity::bytes(10), Box::new(LruPolicy::new()));
        level.put("a", "aaaa".to_string(), None).unwrap();
        level.put("b", "bbbb".to_string(), None).unwrap();
        level.put("c", "cccccccc".to_string(), None).unwrap();

        assert!(!level.contains("a"));
        assert!(!level.contains("b"));
        assert!(level.contains("c"));
        assert!(level.bytes_used() <= 10);
    }

    #[test]
    fn test_size_hint_overrides_estimate() {
        let mut level: CacheLevel<String> =
            CacheLevel::new("memory", Capacity::bytes(100), Box::new(LruPolicy::new()));
        assert!(!level.put("a", "tiny".to_string(), Some(500)).unwrap());
        assert!(level.put("a", "tiny".to_string(), Some(50)).unwrap());
        assert_eq!(level.bytes_used(), 50);
    }

    #[test]
    fn test_replace_updates_size() {
        let mut level = lru_level(2);
        level.put("a", "12345".to_string(), None).unwrap();
        level.put("a", "12".to_string(), None).unwrap();

        assert_eq!(level.len(), 1);
        assert_eq!(level.bytes_used(), 2);
        assert_eq!(level.get("a").as_deref(), Some("12"));
    }

    #[test]
    fn test_remove_and_prefix_removal() {
        let mut level = lru_level(10);
        level.put("thumbnail:1", "t".to_string(), None).unwrap();
        level.put("thumbnail:2", "t".to_string(), None).unwrap();
        level.put("image:1", "i".to_string(), None).unwrap();

        assert!(level.remove("image:1"));
        assert!(!level.remove("image:1"));
        assert_eq!(level.remove_prefix("thumbnail:"), 2);
        assert!(level.is_empty());
        assert_eq!(level.bytes_used(), 0);
    }

    #[test]
    fn test_ttl_policy_entries_expire_on_lookup() {
        let mut level: CacheLevel<String> = CacheLevel::new(
            "memory",
            Capacity::entries(10),
            Box::new(TtlPolicy::new(Duration::from_millis(20))),
        );
        level.put("a", "1".to_string(), None).unwrap();
        assert!(level.contains("a"));

        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(level.get("a"), None);
        let stats = level.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.entry_count, 0);
    }

    #[test]
    fn test_level_ttl_expires_under_lru() {
        let mut level = lru_level(10).with_ttl(Duration::from_millis(20));
        assert_eq!(level.ttl(), Some(Duration::from_millis(20)));
        level.put("a", "1".to_string(), None).unwrap();
        assert_eq!(level.get("a").as_deref(), Some("1"));

        std::thread::sleep(Duration::from_millis(50));

        assert!(!level.contains("a"));
        assert_eq!(level.get("a"), None);
        assert_eq!(level.stats().expirations, 1);
        assert_eq!(level.stats().evictions, 0);
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let mut level = lru_level(10).with_ttl(Duration::ZERO);
        assert_eq!(level.ttl(), None);
        level.put("a", "1".to_string(), None).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(level.contains("a"));
    }

    #[test]
    fn test_load_drops_entries_past_level_ttl() {
        let store = MemoryStore::new();
        {
            let mut level = persistent_level(&store, 10);
            level.put("old", "1".to_string(), None).unwrap();
        }
        std::thread::sleep(Duration::from_millis(50));

        let mut level = persistent_level(&store, 10).with_ttl(Duration::from_millis(20));
        assert_eq!(level.load().unwrap(), 0);
        assert_eq!(store.read("entry:old").unwrap(), None);
    }

    #[test]
    fn test_stats_hit_rate() {
        let mut level = lru_level(10);
        level.put("a", "1".to_string(), None).unwrap();
        level.get("a");
        level.get("a");
        level.get("a");
        level.get("missing");

        let stats = level.stats();
        assert_eq!(stats.name, "memory");
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_persistent_values_hydrate_from_store() {
        let store = MemoryStore::new();
        let mut level = persistent_level(&store, 10);
        level.put("k", "value".to_string(), None).unwrap();

        let reads = store.read_count();
        assert_eq!(level.get("k").as_deref(), Some("value"));
        assert_eq!(store.read_count(), reads + 1);
    }

    #[test]
    fn test_persistent_reload() {
        let store = MemoryStore::new();
        {
            let mut level = persistent_level(&store, 10);
            level.put("a", "1".to_string(), None).unwrap();
            level.put("b", "2".to_string(), None).unwrap();
            level.remove("b");
        }

        let mut level = persistent_level(&store, 10);
        assert_eq!(level.load().unwrap(), 1);
        assert_eq!(level.get("a").as_deref(), Some("1"));
        assert_eq!(level.get("b"), None);
    }

    #[test]
    fn test_load_trims_to_capacity() {
        let store = MemoryStore::new();
        {
            let mut level = persistent_level(&store, 10);
            for key in ["a", "b", "c", "d"] {
                level.put(key, key.to_string(), None).unwrap();
                std::thread::sleep(Duration::from_millis(2));
            }
            level.get("a");
        }

        let mut level = persistent_level(&store, 2);
        assert_eq!(level.load().unwrap(), 2);
        // Most recently used survive
        assert!(level.contains("a"));
        assert!(level.contains("d"));
        assert!(!level.contains("b"));
        assert_eq!(store.read("entry:b").unwrap(), None);
    }

    #[test]
    fn test_load_deletes_orphan_blobs() {
        let store = MemoryStore::new();
        store.write("entry:orphan", b"\"x\"").unwrap();

        let mut level = persistent_level(&store, 10);
        assert_eq!(level.load().unwrap(), 0);
        assert_eq!(store.read("entry:orphan").unwrap(), None);
    }

    #[test]
    fn test_load_survives_corrupt_index() {
        let store = MemoryStore::new();
        store.write(".index", b"not json").unwrap();

        let mut level = persistent_level(&store, 10);
        assert_eq!(level.load().unwrap(), 0);
    }

    #[test]
    fn test_non_persistent_load_is_noop() {
        let mut level = lru_level(10);
        level.put("a", "1".to_string(), None).unwrap();
        assert_eq!(level.load().unwrap(), 0);
        assert!(level.contains("a"));
    }

    #[test]
    fn test_corrupt_blob_is_a_miss() {
        let store = MemoryStore::new();
        let mut level = persistent_level(&store, 10);
        level.put("bad", "ok".to_string(), None).unwrap();
        level.put("good", "ok".to_string(), None).unwrap();
        store.write("entry:bad", b"{{{").unwrap();

        assert_eq!(level.get("bad"), None);
        assert!(!level.contains("bad"));
        assert_eq!(level.get("good").as_deref(), Some("ok"));
    }

    #[test]
    fn test_write_failure_keeps_entry_in_memory() {
        let store = MemoryStore::new();
        let mut level = persistent_level(&store, 10);
        store.set_fail_writes(true);

        assert!(level.put("k", "v".to_string(), None).unwrap());
        assert_eq!(level.get("k").as_deref(), Some("v"));
        assert!(level.stats().write_failures >= 1);
    }

    #[test]
    fn test_index_writes_are_batched() {
        let store = MemoryStore::new();
        let mut level = persistent_level(&store, 1000);
        for i in 0..10 {
            level.put(&format!("k{}", i), "v".to_string(), None).unwrap();
        }
        // One blob per entry and no index rewrite yet
        assert_eq!(store.write_count(), 10);
        assert_eq!(store.read(".index").unwrap(), None);

        level.flush();
        assert_eq!(store.write_count(), 11);

        for i in 10..10 + INDEX_SAVE_INTERVAL {
            level.put(&format!("k{}", i), "v".to_string(), None).unwrap();
        }
        assert_eq!(store.write_count() as usize, 11 + INDEX_SAVE_INTERVAL + 1);
    }

    #[test]
    fn test_clear_deletes_blobs() {
        let store = MemoryStore::new();
        let mut level = persistent_level(&store, 10);
        level.put("a", "1".to_string(), None).unwrap();
        level.put("b", "2".to_string(), None).unwrap();

        level.clear();
        assert!(level.is_empty());
        assert_eq!(store.list_keys().unwrap(), vec![".index".to_string()]);
    }

    struct NoVictim;

    impl EvictionPolicy for NoVictim {
        fn name(&self) -> &'static str {
            "none"
        }
        fn on_insert(&mut self, _entry: &EntryMeta) {}
        fn on_access(&mut self, _entry: &EntryMeta) {}
        fn on_remove(&mut self, _key: &str) {}
        fn clear(&mut self) {}
        fn select_victim(&self, _entries: &HashMap<String, EntryMeta>) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_missing_victim_is_capacity_error() {
        let mut level: CacheLevel<String> = CacheLevel::new("broken", Capacity::entries(1), Box::new(NoVictim));
        level.put("a", "1".to_string(), None).unwrap();

        let result = level.put("b", "2".to_string(), None);
        assert!(matches!(result, Err(CacheError::CapacityMisconfigured { ref level }) if level == "broken"));
        assert!(level.contains("a"));
    }

    #[test]
    fn test_failed_replace_drops_old_value_from_store() {
        let store = MemoryStore::new();
        let mut level: CacheLevel<String> =
            CacheLevel::persistent("broken", Capacity::bytes(10), Box::new(NoVictim), store.clone());
        level.put("a", "aaaa".to_string(), None).unwrap();
        level.put("b", "bbbb".to_string(), None).unwrap();

        let result = level.put("a", "aaaaaaaa".to_string(), None);
        assert!(matches!(result, Err(CacheError::CapacityMisconfigured { .. })));
        assert!(!level.contains("a"));
        assert_eq!(store.read("entry:a").unwrap(), None);

        let saved: Vec<EntryMeta> = value::decode(&store.read(INDEX_KEY).unwrap().unwrap()).unwrap();
        let keys: Vec<&str> = saved.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["b"]);
    }

    #[test]
    fn test_policy_kind_builds_working_level() {
        for kind in [PolicyKind::Lru, PolicyKind::Lfu, PolicyKind::Fifo, PolicyKind::Ttl(Duration::from_secs(60))] {
            let mut level: CacheLevel<String> = CacheLevel::new("memory", Capacity::entries(3), kind.build());
            for i in 0..10 {
                level.put(&format!("k{}", i), i.to_string(), None).unwrap();
                assert!(level.len() <= 3, "{}", kind);
            }
        }
    }
}
