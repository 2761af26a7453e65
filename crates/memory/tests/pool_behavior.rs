use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use starbrowse_memory::{
    BufferKind, ImageBuffer, MemoryPool, MemoryProbe, MemorySample, ResourceConfig, ResourceManager,
};

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

#[test]
fn released_buffer_is_reused_for_same_size() {
    let pool = MemoryPool::new(10 * MB);

    let first = pool.get_buffer(2 * MB, BufferKind::Bytes).expect("first buffer");
    let chunk = first.chunk_id().expect("pooled chunk");
    assert!(first.release());

    let second = pool.get_buffer(2 * MB, BufferKind::Bytes).expect("second buffer");
    assert_eq!(second.chunk_id(), Some(chunk));
    assert_eq!(pool.chunk_info(chunk).expect("chunk info").use_count, 2);
    assert_eq!(pool.stats().total_chunks, 1);
}

#[test]
fn outstanding_buffers_never_share_a_chunk() {
    let pool = MemoryPool::new(MB);
    let mut rng = StdRng::seed_from_u64(7);
    let mut held = Vec::new();

    for _ in 0..500 {
        if !held.is_empty() && rng.gen_bool(0.4) {
            let index = rng.gen_range(0..held.len());
            drop(held.swap_remove(index));
        } else {
            let size = rng.gen_range(1..64 * KB);
            held.push(pool.get_buffer(size, BufferKind::Bytes).expect("buffer"));
        }

        let ids: HashSet<_> = held.iter().filter_map(|b| b.chunk_id()).collect();
        assert_eq!(ids.len(), held.len());
        assert_eq!(pool.stats().used_chunks, held.len());
    }
}

#[test]
fn back_to_back_borrows_get_different_chunks() {
    let pool = MemoryPool::new(10 * MB);
    let a = pool.get_buffer(4 * KB, BufferKind::Float32).expect("a");
    let b = pool.get_buffer(4 * KB, BufferKind::Float32).expect("b");
    assert_ne!(a.chunk_id(), b.chunk_id());
}

#[test]
fn double_release_leaves_pool_consistent() {
    let pool = MemoryPool::new(10 * MB);
    let buffer = pool.get_buffer(8 * KB, BufferKind::Bytes).expect("buffer");
    let handle = buffer.release_handle();

    assert!(handle.release());
    assert!(!handle.release());
    drop(buffer);

    let stats = pool.stats();
    assert_eq!(stats.used_chunks, 0);
    assert_eq!(stats.unused_chunks, 1);

    // The chunk can be lent again, and the old handle cannot take it back
    let again = pool.get_buffer(8 * KB, BufferKind::Bytes).expect("again");
    assert!(!handle.release());
    assert_eq!(pool.stats().used_chunks, 1);
    drop(again);
}

#[test]
fn release_all_returns_every_image_buffer() {
    let images = ImageBuffer::new(MemoryPool::new(10 * MB));
    let leases: Vec<_> = (0..4)
        .map(|_| images.get_buffer_for_image(64, 64, 3).expect("image buffer"))
        .collect();
    assert_eq!(images.pool().stats().used_chunks, 4);

    assert_eq!(images.release_all(), 4);
    assert_eq!(images.pool().stats().used_chunks, 0);
    drop(leases);
    assert_eq!(images.pool().stats().used_chunks, 0);
}

struct ScriptedProbe {
    percent: Mutex<f64>,
}

impl MemoryProbe for ScriptedProbe {
    fn sample(&self) -> MemorySample {
        let total = 8_000 * MB as u64;
        let used = (total as f64 * *self.percent.lock() / 100.0) as u64;
        MemorySample {
            rss_bytes: 300 * MB as u64,
            vms_bytes: 600 * MB as u64,
            system_total_bytes: total,
            system_available_bytes: total - used,
        }
    }
}

#[test]
fn every_callback_runs_once_even_when_one_fails() {
    let probe = Arc::new(ScriptedProbe {
        percent: Mutex::new(95.0),
    });
    let manager = ResourceManager::with_probe(ResourceConfig::default(), probe);
    assert!(manager.get_memory_usage().percent_used > 90.0);

    let calls: Arc<Vec<AtomicUsize>> = Arc::new((0..4).map(|_| AtomicUsize::new(0)).collect());
    for i in 0..4 {
        let calls = Arc::clone(&calls);
        manager.register_cleanup_callback(move || {
            calls[i].fetch_add(1, Ordering::SeqCst);
            match i {
                1 => Err("cache shrink failed".into()),
                2 => panic!("callback bug"),
                _ => Ok(()),
            }
        });
    }

    let report = manager.trigger_cleanup(true);
    assert!(report.aggressive);
    assert_eq!(report.callbacks_run, 4);
    assert_eq!(report.callback_failures, 2);
    for count in calls.iter() {
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn pool_registered_with_manager_is_trimmed_on_cleanup() {
    let probe = Arc::new(ScriptedProbe {
        percent: Mutex::new(10.0),
    });
    let manager = ResourceManager::with_probe(ResourceConfig::default(), probe);
    let pool = MemoryPool::new(MB);
    manager.register_pool(&pool);

    let held: Vec<_> = (0..3)
        .map(|_| pool.get_buffer(512 * KB, BufferKind::Bytes).expect("buffer"))
        .collect();
    drop(held);
    assert!(pool.stats().total_allocated > MB);

    manager.trigger_cleanup(false);
    assert!(pool.stats().total_allocated <= MB);
}

#[test]
fn monitor_cleans_up_when_threshold_exceeded() {
    let probe = Arc::new(ScriptedProbe {
        percent: Mutex::new(50.0),
    });
    let config = ResourceConfig::default()
        .with_monitor_interval(Duration::from_millis(10))
        .with_cleanup_cooldown(Duration::from_secs(60));
    let manager = ResourceManager::with_probe(config, probe.clone());

    let runs = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&runs);
    manager.register_cleanup_callback(move || {
        r.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    assert!(manager.start_monitoring());
    assert!(!manager.start_monitoring());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    *probe.percent.lock() = 85.0;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while runs.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    // Cooldown keeps later ticks from cleaning again
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    assert!(manager.stop_monitoring());
    assert!(!manager.is_monitoring());
    assert!(!manager.stop_monitoring());
}
