//! Pool and resource monitor settings, read from the `memory` section.

use std::time::Duration;

use starbrowse_config::{ConfigExt, ConfigProvider, Settings, MB};

/// Config section holding memory settings.
pub const SECTION: &str = "memory";

/// Largest share of physical RAM the pool may target, in percent.
const MAX_POOL_SHARE_PERCENT: u64 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Cleanup target for the pool, in bytes
    pub max_pool_size: usize,
    /// When false, buffers are allocated fresh and freed on release
    pub enable_memory_pool: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: 100 * MB,
            enable_memory_pool: true,
        }
    }
}

impl PoolConfig {
    pub fn from_provider<P: ConfigProvider + ?Sized>(provider: &P) -> Self {
        let defaults = Self::default();
        Self {
            max_pool_size: provider.get_or(SECTION, "max_pool_size", defaults.max_pool_size),
            enable_memory_pool: provider.get_bool_or(SECTION, "enable_memory_pool", defaults.enable_memory_pool),
        }
    }

    /// Caps `max_pool_size` at 5% of `total_ram_bytes`.
    pub fn clamp_to_system(mut self, total_ram_bytes: u64) -> Self {
        let cap = total_ram_bytes / 100 * MAX_POOL_SHARE_PERCENT;
        if cap > 0 {
            let cap = usize::try_from(cap).unwrap_or(usize::MAX);
            self.max_pool_size = self.max_pool_size.min(cap);
        }
        self
    }

    pub fn write_to(&self, settings: &mut Settings) {
        settings.set(SECTION, "max_pool_size", self.max_pool_size);
        settings.set(SECTION, "enable_memory_pool", self.enable_memory_pool);
    }
}

/// Settings for [`ResourceManager`](crate::ResourceManager).
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceConfig {
    /// System memory use, in percent, above which the monitor cleans up
    pub gc_threshold: f64,
    pub monitor_interval: Duration,
    /// Always run cleanups in aggressive mode
    pub aggressive_cleanup: bool,
    pub monitoring_enabled: bool,
    /// Minimum time between two monitor-triggered cleanups
    pub cleanup_cooldown: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            gc_threshold: 80.0,
            monitor_interval: Duration::from_secs(10),
            aggressive_cleanup: false,
            monitoring_enabled: true,
            cleanup_cooldown: Duration::from_secs(60),
        }
    }
}

impl ResourceConfig {
    pub fn from_provider<P: ConfigProvider + ?Sized>(provider: &P) -> Self {
        let defaults = Self::default();
        Self {
            gc_threshold: provider.get_or(SECTION, "gc_threshold", defaults.gc_threshold),
            monitor_interval: millis_or_secs(provider, "monitor_interval", defaults.monitor_interval),
            aggressive_cleanup: provider.get_bool_or(SECTION, "aggressive_cleanup", defaults.aggressive_cleanup),
            monitoring_enabled: provider.get_bool_or(SECTION, "monitoring_enabled", defaults.monitoring_enabled),
            cleanup_cooldown: millis_or_secs(provider, "cleanup_cooldown", defaults.cleanup_cooldown),
        }
    }

    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    pub fn with_gc_threshold(mut self, percent: f64) -> Self {
        self.gc_threshold = percent;
        self
    }

    pub fn with_cleanup_cooldown(mut self, cooldown: Duration) -> Self {
        self.cleanup_cooldown = cooldown;
        self
    }

    pub fn with_aggressive_cleanup(mut self, aggressive: bool) -> Self {
        self.aggressive_cleanup = aggressive;
        self
    }

    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitoring_enabled = enabled;
        self
    }
}

/// Durations are whole seconds; fractional values such as `0.5` are accepted.
fn millis_or_secs<P: ConfigProvider + ?Sized>(provider: &P, key: &str, default: Duration) -> Duration {
    let secs: f64 = provider.get_or(SECTION, key, default.as_secs_f64());
    if secs.is_finite() && secs >= 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    #[test]
    fn test_defaults() {
        let pool = PoolConfig::default();
        assert_eq!(pool.max_pool_size, 100 * MB);
        assert!(pool.enable_memory_pool);

        let resource = ResourceConfig::default();
        assert_eq!(resource.gc_threshold, 80.0);
        assert_eq!(resource.monitor_interval, Duration::from_secs(10));
        assert_eq!(resource.cleanup_cooldown, Duration::from_secs(60));
        assert!(!resource.aggressive_cleanup);
        assert!(resource.monitoring_enabled);
    }

    #[test]
    fn test_from_provider() {
        let settings = Settings::new()
            .with(SECTION, "max_pool_size", 1024)
            .with(SECTION, "enable_memory_pool", "no")
            .with(SECTION, "gc_threshold", 65.5)
            .with(SECTION, "monitor_interval", 0.25)
            .with(SECTION, "aggressive_cleanup", "yes");

        let pool = PoolConfig::from_provider(&settings);
        assert_eq!(pool.max_pool_size, 1024);
        assert!(!pool.enable_memory_pool);

        let resource = ResourceConfig::from_provider(&settings);
        assert_eq!(resource.gc_threshold, 65.5);
        assert_eq!(resource.monitor_interval, Duration::from_millis(250));
        assert!(resource.aggressive_cleanup);
        assert_eq!(resource.cleanup_cooldown, Duration::from_secs(60));
    }

    #[test]
    fn test_negative_interval_uses_default() {
        let settings = Settings::new().with(SECTION, "monitor_interval", -3);
        let resource = ResourceConfig::from_provider(&settings);
        assert_eq!(resource.monitor_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_clamp_to_system() {
        // 5% of 1 GB is about 51 MB
        let clamped = PoolConfig::default().clamp_to_system(GB);
        assert_eq!(clamped.max_pool_size as u64, GB / 100 * 5);

        let roomy = PoolConfig::default().clamp_to_system(16 * GB);
        assert_eq!(roomy.max_pool_size, 100 * MB);

        let unknown = PoolConfig::default().clamp_to_system(0);
        assert_eq!(unknown.max_pool_size, 100 * MB);
    }

    #[test]
    fn test_pool_settings_roundtrip() {
        let config = PoolConfig {
            max_pool_size: 4 * MB,
            enable_memory_pool: false,
        };
        let mut settings = Settings::new();
        config.write_to(&mut settings);
        assert_eq!(PoolConfig::from_provider(&settings), config);
    }
}
