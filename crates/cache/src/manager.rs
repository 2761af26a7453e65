//! Multi-level cache orchestration.
//!
//! Levels are probed fastest-first. A hit in a slower level is copied into
//! every faster level before it is returned; writes go to every level.

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::level::{CacheLevel, Capacity, LevelStats};
use crate::store::FsStore;
use crate::value::CacheValue;

/// An ordered stack of [`CacheLevel`]s behind a single lock.
///
/// Every operation holds the lock for its whole traversal of the levels, so
/// concurrent `get`/`put`/`invalidate` calls never interleave. The level order
/// is fixed at construction.
pub struct CacheManager<V> {
    levels: Mutex<Vec<CacheLevel<V>>>,
}

impl<V: CacheValue> CacheManager<V> {
    /// Creates a manager over `levels`, fastest first.
    pub fn new(levels: Vec<CacheLevel<V>>) -> Self {
        info!(
            levels = ?levels.iter().map(|l| l.name().to_string()).collect::<Vec<_>>(),
            "Created cache manager"
        );
        Self {
            levels: Mutex::new(levels),
        }
    }

    /// Builds the default `L1`/`L2`/`Disk` stack and loads the disk level.
    ///
    /// If the disk directory cannot be opened the disk level runs in memory.
    pub fn from_config(config: &CacheConfig) -> Self {
        let l1 = CacheLevel::new(
            "L1",
            Capacity::entries(config.l1_size),
            config.policy_for(config.l1_ttl).build(),
        )
        .with_ttl(config.l1_ttl);
        let l2 = CacheLevel::new(
            "L2",
            Capacity::entries(config.l2_size),
            config.policy_for(config.l2_ttl).build(),
        )
        .with_ttl(config.l2_ttl);

        let disk_capacity = Capacity::entries(config.disk_size);
        let disk_policy = config.policy_for(config.disk_ttl);
        let disk = if config.persist_disk {
            match FsStore::new(&config.disk_cache_dir) {
                Ok(store) => {
                    let mut level = CacheLevel::persistent("Disk", disk_capacity, disk_policy.build(), store)
                        .with_ttl(config.disk_ttl);
                    if let Err(e) = level.load() {
                        warn!(dir = %config.disk_cache_dir.display(), error = %e, "Failed to load disk cache");
                    }
                    level
                }
                Err(e) => {
                    warn!(
                        dir = %config.disk_cache_dir.display(),
                        error = %e,
                        "Cannot open disk cache directory, disk level will not persist"
                    );
                    CacheLevel::new("Disk", disk_capacity, disk_policy.build()).with_ttl(config.disk_ttl)
                }
            }
        } else {
            CacheLevel::new("Disk", disk_capacity, disk_policy.build()).with_ttl(config.disk_ttl)
        };

        Self::new(vec![l1, l2, disk])
    }

    /// Probes each level in order. A hit at level `i` is promoted into levels
    /// `0..i` before returning.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut levels = self.levels.lock();

        let (index, value, size) = levels
            .iter_mut()
            .enumerate()
            .find_map(|(i, level)| level.get_with_size(key).map(|(value, size)| (i, value, size)))?;

        for faster in levels[..index].iter_mut() {
            match faster.put(key, value.clone(), Some(size)) {
                Ok(true) => debug!(key, level = faster.name(), "Promoted entry"),
                Ok(false) => {}
                Err(e) => warn!(key, level = faster.name(), error = %e, "Promotion failed"),
            }
        }
        Some(value)
    }

    /// Writes `value` to every level.
    ///
    /// Levels that decline the entry (too large, or a capacity error) are
    /// skipped. Returns true if at least one level stored it.
    pub fn put(&self, key: &str, value: V, size_hint: Option<usize>) -> bool {
        let mut levels = self.levels.lock();
        let mut accepted = false;

        for level in levels.iter_mut() {
            match level.put(key, value.clone(), size_hint) {
                Ok(true) => accepted = true,
                Ok(false) => debug!(key, level = level.name(), "Level declined entry"),
                Err(e) => warn!(key, level = level.name(), error = %e, "Level declined entry"),
            }
        }
        accepted
    }

    /// Removes `key` from every level. Returns true if any level had it.
    pub fn invalidate(&self, key: &str) -> bool {
        let mut levels = self.levels.lock();
        levels.iter_mut().fold(false, |found, level| level.remove(key) || found)
    }

    /// Removes every key starting with `prefix` from every level. Returns the
    /// number of entries removed across all levels.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut levels = self.levels.lock();
        levels.iter_mut().map(|level| level.remove_prefix(prefix)).sum()
    }

    /// Clears every level.
    pub fn clear(&self) {
        let mut levels = self.levels.lock();
        for level in levels.iter_mut() {
            level.clear();
        }
        info!("Cleared all cache levels");
    }

    /// Returns true if any level holds `key`. Does not promote.
    pub fn contains(&self, key: &str) -> bool {
        let mut levels = self.levels.lock();
        levels.iter_mut().any(|level| level.contains(key))
    }

    /// Returns the cached value for `key`, or computes it with `f`, stores it
    /// and returns it.
    ///
    /// `f` runs without the lock held, so two racing callers may both compute;
    /// the later `put` wins.
    pub fn get_or_insert_with<F>(&self, key: &str, size_hint: Option<usize>, f: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = f();
        self.put(key, value.clone(), size_hint);
        value
    }

    /// Per-level counters, fastest level first.
    pub fn stats(&self) -> Vec<LevelStats> {
        self.levels.lock().iter().map(|level| level.stats()).collect()
    }

    /// Level names, fastest first.
    pub fn level_names(&self) -> Vec<String> {
        self.levels.lock().iter().map(|level| level.name().to_string()).collect()
    }

    /// Runs `f` against the level called `name` while holding the lock.
    pub fn with_level<R>(&self, name: &str, f: impl FnOnce(&mut CacheLevel<V>) -> R) -> Option<R> {
        let mut levels = self.levels.lock();
        levels.iter_mut().find(|level| level.name() == name).map(f)
    }

    /// Persists the entry index of every persistent level.
    pub fn flush(&self) {
        for level in self.levels.lock().iter_mut() {
            level.flush();
        }
    }
}
