//! Memory watchdog: samples process and system memory on a background
//! thread and runs registered cleanups when usage crosses a threshold.
//!
//! "Cleanup" means running every registered callback (pool trims, cache
//! shrinks) and sweeping the tracked-resource registry, dropping entries
//! whose objects are gone and running their finalizers.

use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::ResourceConfig;
use crate::pool::MemoryPool;
use crate::pressure::MemoryPressure;
use crate::system::{MemoryProbe, MemorySample, SystemProbe};

const MB: u64 = 1024 * 1024;

/// How long `stop_monitoring` waits for the monitor thread to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Sweep passes made by an aggressive cleanup.
const AGGRESSIVE_PASSES: usize = 3;

/// Tracked objects above this size are reported after an aggressive cleanup.
const LARGE_OBJECT_BYTES: usize = 1024 * 1024;

/// RSS growth during a batch that triggers a cleanup when the batch ends.
const BATCH_GROWTH_LIMIT: u64 = 100 * MB;

/// Outcome of a cleanup callback.
pub type CleanupResult = Result<(), Box<dyn Error + Send + Sync>>;

type CleanupFn = dyn Fn() -> CleanupResult + Send + Sync;

/// Identifies a registered cleanup callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// What a cleanup pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanupReport {
    pub aggressive: bool,
    /// Callbacks invoked, including those that failed
    pub callbacks_run: usize,
    pub callback_failures: usize,
    pub dead_resources: usize,
    pub finalizers_run: usize,
    /// Tracked objects over 1 MB still alive after an aggressive cleanup
    pub large_survivors: usize,
    pub elapsed: Duration,
}

/// Result of sweeping the tracked-resource registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub dead_resources: usize,
    pub finalizers_run: usize,
}

impl SweepSummary {
    fn is_empty(&self) -> bool {
        self.dead_resources == 0 && self.finalizers_run == 0
    }
}

/// Current memory figures, in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryUsage {
    pub rss_bytes: u64,
    pub vms_bytes: u64,
    /// System-wide memory in use, 0.0 to 100.0
    pub percent_used: f64,
    /// Highest RSS seen by this manager
    pub peak_rss_bytes: u64,
    pub system_total_bytes: u64,
    pub system_available_bytes: u64,
}

impl MemoryUsage {
    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_percent(self.percent_used)
    }

    pub fn rss_mb(&self) -> f64 {
        self.rss_bytes as f64 / MB as f64
    }
}

struct TrackedResource {
    object: Weak<dyn Any + Send + Sync>,
    size_hint: usize,
}

struct Finalizer {
    target: Weak<dyn Any + Send + Sync>,
    callback: Box<dyn FnOnce() + Send>,
}

struct Inner {
    config: ResourceConfig,
    probe: Arc<dyn MemoryProbe>,
    callbacks: Mutex<Vec<(CallbackId, Arc<CleanupFn>)>>,
    next_callback: AtomicU64,
    tracked: Mutex<HashMap<String, TrackedResource>>,
    finalizers: Mutex<Vec<Finalizer>>,
    peak_rss: AtomicU64,
    last_cleanup: Mutex<Option<Instant>>,
}

impl Inner {
    fn sample(&self) -> MemorySample {
        let sample = self.probe.sample();
        self.peak_rss.fetch_max(sample.rss_bytes, Ordering::Relaxed);
        sample
    }

    fn usage(&self) -> MemoryUsage {
        let sample = self.sample();
        MemoryUsage {
            rss_bytes: sample.rss_bytes,
            vms_bytes: sample.vms_bytes,
            percent_used: sample.percent_used(),
            peak_rss_bytes: self.peak_rss.load(Ordering::Relaxed),
            system_total_bytes: sample.system_total_bytes,
            system_available_bytes: sample.system_available_bytes,
        }
    }

    fn check_memory(&self) -> Option<CleanupReport> {
        let usage = self.usage();
        let pressure = usage.pressure();
        debug!(
            rss_mb = usage.rss_mb(),
            percent = usage.percent_used,
            %pressure,
            "Memory sample"
        );

        if usage.percent_used <= self.config.gc_threshold {
            return None;
        }
        let last_cleanup = *self.last_cleanup.lock();
        let cooled_down = match last_cleanup {
            Some(at) => at.elapsed() >= self.config.cleanup_cooldown,
            None => true,
        };
        if !cooled_down {
            return None;
        }

        warn!(
            percent = usage.percent_used,
            threshold = self.config.gc_threshold,
            %pressure,
            "Memory usage exceeds threshold, triggering cleanup"
        );
        Some(self.trigger_cleanup(pressure.is_critical()))
    }

    fn trigger_cleanup(&self, force_aggressive: bool) -> CleanupReport {
        let started = Instant::now();
        let aggressive = force_aggressive || self.config.aggressive_cleanup;
        let before = self.sample();
        let mut report = CleanupReport {
            aggressive,
            ..Default::default()
        };

        // Run outside the lock so callbacks may register or unregister
        let callbacks: Vec<(CallbackId, Arc<CleanupFn>)> = self.callbacks.lock().clone();
        for (id, callback) in callbacks {
            report.callbacks_run += 1;
            match catch_unwind(AssertUnwindSafe(|| (*callback)())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    report.callback_failures += 1;
                    warn!(callback = id.0, error = %e, "Cleanup callback failed");
                }
                Err(panic) => {
                    report.callback_failures += 1;
                    warn!(callback = id.0, panic = %panic_message(&*panic), "Cleanup callback panicked");
                }
            }
        }

        let passes = if aggressive { AGGRESSIVE_PASSES } else { 1 };
        for _ in 0..passes {
            let sweep = self.sweep();
            report.dead_resources += sweep.dead_resources;
            report.finalizers_run += sweep.finalizers_run;
            if sweep.is_empty() {
                break;
            }
        }

        if aggressive {
            report.large_survivors = self.log_large_survivors();
        }

        *self.last_cleanup.lock() = Some(Instant::now());
        report.elapsed = started.elapsed();

        let after = self.sample();
        let freed_mb = (before.rss_bytes as f64 - after.rss_bytes as f64) / MB as f64;
        info!(
            aggressive,
            callbacks = report.callbacks_run,
            failures = report.callback_failures,
            dead_resources = report.dead_resources,
            freed_mb,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Memory cleanup finished"
        );
        report
    }

    fn sweep(&self) -> SweepSummary {
        let mut summary = SweepSummary::default();

        {
            let mut tracked = self.tracked.lock();
            let before = tracked.len();
            tracked.retain(|_, resource| resource.object.strong_count() > 0);
            summary.dead_resources = before - tracked.len();
        }

        let due: Vec<Finalizer> = {
            let mut finalizers = self.finalizers.lock();
            let (dead, alive): (Vec<Finalizer>, Vec<Finalizer>) = finalizers
                .drain(..)
                .partition(|f: &Finalizer| f.target.strong_count() == 0);
            *finalizers = alive;
            dead
        };
        for finalizer in due {
            summary.finalizers_run += 1;
            if let Err(panic) = catch_unwind(AssertUnwindSafe(finalizer.callback)) {
                warn!(panic = %panic_message(&*panic), "Finalizer panicked");
            }
        }

        if !summary.is_empty() {
            debug!(
                dead_resources = summary.dead_resources,
                finalizers_run = summary.finalizers_run,
                "Swept tracked resources"
            );
        }
        summary
    }

    fn log_large_survivors(&self) -> usize {
        let tracked = self.tracked.lock();
        let mut survivors = 0;
        for (id, resource) in tracked.iter() {
            if resource.size_hint > LARGE_OBJECT_BYTES && resource.object.strong_count() > 0 {
                survivors += 1;
                info!(
                    id = %id,
                    size_mb = resource.size_hint as f64 / MB as f64,
                    "Large object survived cleanup"
                );
            }
        }
        survivors
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Monitor {
    stop: mpsc::Sender<()>,
    done: mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

/// Watches memory usage and coordinates cleanups.
///
/// One manager per application context. Dropping it stops the monitor and
/// runs a final aggressive cleanup.
pub struct ResourceManager {
    inner: Arc<Inner>,
    monitor: Mutex<Option<Monitor>>,
    shut_down: AtomicBool,
}

impl ResourceManager {
    /// Creates a manager reading live system counters.
    pub fn new(config: ResourceConfig) -> Self {
        Self::with_probe(config, Arc::new(SystemProbe))
    }

    /// Creates a manager reading memory figures from `probe`.
    pub fn with_probe(config: ResourceConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        info!(
            gc_threshold = config.gc_threshold,
            monitor_interval_secs = config.monitor_interval.as_secs_f64(),
            aggressive = config.aggressive_cleanup,
            "Resource manager initialized"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                probe,
                callbacks: Mutex::new(Vec::new()),
                next_callback: AtomicU64::new(1),
                tracked: Mutex::new(HashMap::new()),
                finalizers: Mutex::new(Vec::new()),
                peak_rss: AtomicU64::new(0),
                last_cleanup: Mutex::new(None),
            }),
            monitor: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }

    /// Registers a callback run on every cleanup.
    pub fn register_cleanup_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn() -> CleanupResult + Send + Sync + 'static,
    {
        let id = CallbackId(self.inner.next_callback.fetch_add(1, Ordering::Relaxed));
        self.inner.callbacks.lock().push((id, Arc::new(callback)));
        debug!(callback = id.0, "Registered cleanup callback");
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unregister_cleanup_callback(&self, id: CallbackId) -> bool {
        let mut callbacks = self.inner.callbacks.lock();
        let before = callbacks.len();
        callbacks.retain(|(other, _)| *other != id);
        callbacks.len() != before
    }

    /// Registers `pool.cleanup()` as a cleanup callback.
    pub fn register_pool(&self, pool: &MemoryPool) -> CallbackId {
        let pool = pool.clone();
        self.register_cleanup_callback(move || {
            pool.cleanup();
            Ok(())
        })
    }

    /// Tracks `resource` under `id` without keeping it alive.
    pub fn track_resource<T: Any + Send + Sync>(&self, id: impl Into<String>, resource: &Arc<T>) {
        self.track(id.into(), resource, 0);
    }

    /// Like [`track_resource`](Self::track_resource), recording an
    /// approximate size so the object is reported if it survives an
    /// aggressive cleanup.
    pub fn register_large_object<T: Any + Send + Sync>(&self, id: impl Into<String>, resource: &Arc<T>, size_hint: usize) {
        let id = id.into();
        debug!(
            id = %id,
            type_name = std::any::type_name::<T>(),
            size_mb = size_hint as f64 / MB as f64,
            "Registering large object"
        );
        self.track(id, resource, size_hint);
    }

    fn track<T: Any + Send + Sync>(&self, id: String, resource: &Arc<T>, size_hint: usize) {
        let object: Weak<dyn Any + Send + Sync> = Arc::downgrade(resource) as Weak<dyn Any + Send + Sync>;
        self.inner.tracked.lock().insert(id, TrackedResource { object, size_hint });
    }

    /// Returns false if `id` was not tracked.
    pub fn untrack_resource(&self, id: &str) -> bool {
        self.inner.tracked.lock().remove(id).is_some()
    }

    /// The tracked object, if it is still alive and of type `T`.
    pub fn get_tracked_resource<T: Any + Send + Sync>(&self, id: &str) -> Option<Arc<T>> {
        let object = self.inner.tracked.lock().get(id)?.object.upgrade()?;
        object.downcast::<T>().ok()
    }

    pub fn tracked_resource_count(&self) -> usize {
        self.inner.tracked.lock().len()
    }

    /// Runs `callback` at the first cleanup after `target` has been dropped.
    pub fn register_finalizer<T, F>(&self, target: &Arc<T>, callback: F)
    where
        T: Any + Send + Sync,
        F: FnOnce() + Send + 'static,
    {
        let target: Weak<dyn Any + Send + Sync> = Arc::downgrade(target) as Weak<dyn Any + Send + Sync>;
        self.inner.finalizers.lock().push(Finalizer {
            target,
            callback: Box::new(callback),
        });
        debug!(type_name = std::any::type_name::<T>(), "Registered finalizer");
    }

    /// Drops registry entries whose objects are gone and runs their
    /// finalizers.
    pub fn cleanup_tracked_resources(&self) -> SweepSummary {
        self.inner.sweep()
    }

    /// Runs every cleanup callback and sweeps tracked resources.
    ///
    /// A callback that fails or panics is logged; the others still run.
    /// Aggressive mode (forced, or configured) sweeps repeatedly and reports
    /// large tracked objects that are still alive.
    pub fn trigger_cleanup(&self, force_aggressive: bool) -> CleanupReport {
        self.inner.trigger_cleanup(force_aggressive)
    }

    /// Samples memory once and cleans up if usage is over the threshold and
    /// the cooldown since the last cleanup has passed. This is what the
    /// monitor thread runs on every tick.
    pub fn check_memory(&self) -> Option<CleanupReport> {
        self.inner.check_memory()
    }

    pub fn get_memory_usage(&self) -> MemoryUsage {
        self.inner.usage()
    }

    /// Starts the background monitor. Returns false if monitoring is
    /// disabled, already running, or the thread could not be spawned.
    pub fn start_monitoring(&self) -> bool {
        if !self.inner.config.monitoring_enabled {
            info!("Memory monitoring disabled by configuration");
            return false;
        }
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return false;
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let inner = Arc::clone(&self.inner);
        let interval = self.inner.config.monitor_interval;

        let spawned = thread::Builder::new()
            .name("memory-monitor".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            inner.check_memory();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Memory monitor thread exiting");
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(thread) => {
                *monitor = Some(Monitor {
                    stop: stop_tx,
                    done: done_rx,
                    thread,
                });
                info!(interval_secs = interval.as_secs_f64(), "Memory monitoring started");
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn memory monitor thread");
                false
            }
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Stops the monitor, waiting up to two seconds for it to exit. A
    /// thread that does not exit in time is left to finish on its own.
    /// Returns false if no monitor was running.
    pub fn stop_monitoring(&self) -> bool {
        let Some(monitor) = self.monitor.lock().take() else {
            return false;
        };
        let _ = monitor.stop.send(());

        match monitor.done.recv_timeout(STOP_TIMEOUT) {
            Ok(()) => {
                if monitor.thread.join().is_err() {
                    warn!("Memory monitor thread panicked");
                }
                info!("Memory monitoring stopped");
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("Memory monitor thread exited abnormally");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_secs = STOP_TIMEOUT.as_secs(), "Memory monitor thread did not stop in time, detaching");
            }
        }
        true
    }

    /// Starts a batch operation. Dropping the guard logs elapsed time and
    /// RSS change, and cleans up if RSS grew by more than 100 MB.
    pub fn begin_batch(&self, name: impl Into<String>, estimated_bytes: u64) -> BatchGuard {
        let name = name.into();
        let start_rss = self.inner.sample().rss_bytes;
        info!(
            operation = %name,
            estimated_mb = estimated_bytes as f64 / MB as f64,
            "Starting batch operation"
        );
        BatchGuard {
            inner: Arc::clone(&self.inner),
            name,
            started: Instant::now(),
            start_rss,
            failure: None,
        }
    }

    /// Stops monitoring, runs a final aggressive cleanup and clears all
    /// registries. Later calls do nothing.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Resource manager shutting down");
        self.stop_monitoring();
        self.inner.trigger_cleanup(true);

        self.inner.callbacks.lock().clear();
        self.inner.tracked.lock().clear();
        self.inner.finalizers.lock().clear();
        info!("Resource manager shutdown complete");
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceManager")
            .field("config", &self.inner.config)
            .field("monitoring", &self.is_monitoring())
            .field("tracked", &self.tracked_resource_count())
            .finish()
    }
}

/// Scope of a batch operation started by [`ResourceManager::begin_batch`].
#[must_use = "the batch ends when the guard is dropped"]
pub struct BatchGuard {
    inner: Arc<Inner>,
    name: String,
    started: Instant,
    start_rss: u64,
    failure: Option<String>,
}

impl BatchGuard {
    /// Records that the batch failed; logged when the guard drops.
    pub fn fail(&mut self, reason: impl fmt::Display) {
        self.failure = Some(reason.to_string());
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        let end_rss = self.inner.sample().rss_bytes;
        let growth = end_rss.saturating_sub(self.start_rss);
        let change_mb = (end_rss as f64 - self.start_rss as f64) / MB as f64;

        if let Some(reason) = &self.failure {
            error!(operation = %self.name, error = %reason, "Batch operation failed");
        }
        info!(
            operation = %self.name,
            elapsed_secs = elapsed.as_secs_f64(),
            memory_change_mb = change_mb,
            "Completed batch operation"
        );

        if growth > BATCH_GROWTH_LIMIT {
            info!(operation = %self.name, memory_change_mb = change_mb, "Significant memory increase, triggering cleanup");
            self.inner.trigger_cleanup(false);
        }
    }
}
