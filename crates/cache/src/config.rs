//! Cache configuration: level sizes, time-to-live values, eviction policy and
//! the disk cache location.
//!
//! Settings are read once, at construction time, from the `cache` section of a
//! [`ConfigProvider`]. Missing or malformed keys fall back to the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use starbrowse_config::{default_cache_dir, ConfigExt, ConfigProvider, Settings};
use tracing::warn;

use crate::eviction::PolicyKind;

/// Config section holding cache settings.
pub const SECTION: &str = "cache";

const GB: u64 = 1024 * 1024 * 1024;

/// Configuration for the default three-level cache stack.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Max entries in the first memory level
    pub l1_size: usize,
    pub l1_ttl: Duration,
    /// Max entries in the second memory level
    pub l2_size: usize,
    pub l2_ttl: Duration,
    /// Max entries in the disk level
    pub disk_size: usize,
    pub disk_ttl: Duration,
    /// Capacity of the decoded thumbnail LRU in [`ImageCache`](crate::ImageCache)
    pub thumbnail_memory_limit: usize,
    pub eviction_policy: PolicyKind,
    pub disk_cache_dir: PathBuf,
    /// Whether the disk level writes to `disk_cache_dir`
    pub persist_disk: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_size: 1000,
            l1_ttl: Duration::from_secs(300),
            l2_size: 5000,
            l2_ttl: Duration::from_secs(1800),
            disk_size: 10_000,
            disk_ttl: Duration::from_secs(86_400),
            thumbnail_memory_limit: 100,
            eviction_policy: PolicyKind::Lru,
            disk_cache_dir: Self::default_disk_dir(),
            persist_disk: true,
        }
    }
}

impl CacheConfig {
    /// `<platform cache dir>/starbrowse/disk_cache`
    pub fn default_disk_dir() -> PathBuf {
        default_cache_dir().join("disk_cache")
    }

    /// Reads the `cache` section of `provider`.
    pub fn from_provider<P: ConfigProvider + ?Sized>(provider: &P) -> Self {
        let defaults = Self::default();

        let eviction_policy = match provider.raw(SECTION, "eviction_policy") {
            Some(name) => name.parse::<PolicyKind>().unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to LRU eviction");
                PolicyKind::Lru
            }),
            None => defaults.eviction_policy,
        };
        let disk_cache_dir = provider
            .raw(SECTION, "disk_cache_dir")
            .map(PathBuf::from)
            .unwrap_or(defaults.disk_cache_dir);

        Self {
            l1_size: provider.get_or(SECTION, "l1_size", defaults.l1_size),
            l1_ttl: secs(provider, "l1_ttl", defaults.l1_ttl),
            l2_size: provider.get_or(SECTION, "l2_size", defaults.l2_size),
            l2_ttl: secs(provider, "l2_ttl", defaults.l2_ttl),
            disk_size: provider.get_or(SECTION, "disk_size", defaults.disk_size),
            disk_ttl: secs(provider, "disk_ttl", defaults.disk_ttl),
            thumbnail_memory_limit: provider.get_or(SECTION, "thumbnail_memory_limit", defaults.thumbnail_memory_limit),
            eviction_policy,
            disk_cache_dir,
            persist_disk: provider.get_bool_or(SECTION, "persist_disk", defaults.persist_disk),
        }
    }

    /// Writes this configuration into `settings` under the `cache` section.
    pub fn write_to(&self, settings: &mut Settings) {
        let policy = match self.eviction_policy {
            PolicyKind::Lru => "lru",
            PolicyKind::Lfu => "lfu",
            PolicyKind::Fifo => "fifo",
            PolicyKind::Ttl(_) => "ttl",
        };
        settings.set(SECTION, "l1_size", self.l1_size);
        settings.set(SECTION, "l1_ttl", self.l1_ttl.as_secs());
        settings.set(SECTION, "l2_size", self.l2_size);
        settings.set(SECTION, "l2_ttl", self.l2_ttl.as_secs());
        settings.set(SECTION, "disk_size", self.disk_size);
        settings.set(SECTION, "disk_ttl", self.disk_ttl.as_secs());
        settings.set(SECTION, "thumbnail_memory_limit", self.thumbnail_memory_limit);
        settings.set(SECTION, "eviction_policy", policy);
        settings.set(SECTION, "disk_cache_dir", self.disk_cache_dir.display());
        settings.set(SECTION, "persist_disk", self.persist_disk);
    }

    /// Scales memory level sizes to the amount of physical RAM.
    pub fn tuned_for_memory(mut self, total_ram_bytes: u64) -> Self {
        let (l1, l2, thumbnails) = if total_ram_bytes < 4 * GB {
            (500, 2000, 100)
        } else if total_ram_bytes > 16 * GB {
            (4000, 20_000, 1000)
        } else if total_ram_bytes > 8 * GB {
            (2000, 10_000, 500)
        } else {
            return self;
        };
        self.l1_size = l1;
        self.l2_size = l2;
        self.thumbnail_memory_limit = thumbnails;
        self
    }

    /// The configured policy, carrying `ttl` if it is time-based.
    pub fn policy_for(&self, ttl: Duration) -> PolicyKind {
        self.eviction_policy.with_ttl(ttl)
    }

    pub fn with_eviction_policy(mut self, policy: PolicyKind) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_sizes(mut self, l1: usize, l2: usize, disk: usize) -> Self {
        self.l1_size = l1;
        self.l2_size = l2;
        self.disk_size = disk;
        self
    }

    /// Sets the L1, L2 and disk entry lifetimes.
    pub fn with_ttls(mut self, l1: Duration, l2: Duration, disk: Duration) -> Self {
        self.l1_ttl = l1;
        self.l2_ttl = l2;
        self.disk_ttl = disk;
        self
    }

    pub fn with_thumbnail_limit(mut self, limit: usize) -> Self {
        self.thumbnail_memory_limit = limit;
        self
    }

    /// Sets the disk cache directory.
    pub fn with_disk_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.disk_cache_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn with_persist_disk(mut self, persist: bool) -> Self {
        self.persist_disk = persist;
        self
    }
}

fn secs<P: ConfigProvider + ?Sized>(provider: &P, key: &str, default: Duration) -> Duration {
    Duration::from_secs(provider.get_or(SECTION, key, default.as_secs()))
}
