//! Size-bucketed pool of reusable buffers.
//!
//! Buffers are lent out as [`PooledBuffer`]s. Dropping the buffer (or calling
//! its [`ReleaseHandle`]) returns the chunk to the pool for the next request
//! in the same size class. Borrowers must not keep using a buffer after it
//! has been released; the pool does not enforce this.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::chunk::{BufferKind, ChunkId, ChunkStorage, MemoryChunk, SharedStorage};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::system::physical_ram_bytes;

/// Share of `max_pool_size` a cleanup pass trims the pool down to.
const CLEANUP_TARGET_PERCENT: usize = 80;

/// Coarse size classes used to match requests with idle chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SizeBucket {
    /// Up to 1 KB
    Tiny,
    /// Up to 10 KB
    Small,
    /// Up to 100 KB
    Medium,
    /// Up to 1 MB
    Large,
    /// Up to 10 MB
    Xl,
    Xxl,
}

impl SizeBucket {
    pub fn for_size(size: usize) -> Self {
        const KB: usize = 1024;
        const MB: usize = 1024 * KB;
        if size <= KB {
            SizeBucket::Tiny
        } else if size <= 10 * KB {
            SizeBucket::Small
        } else if size <= 100 * KB {
            SizeBucket::Medium
        } else if size <= MB {
            SizeBucket::Large
        } else if size <= 10 * MB {
            SizeBucket::Xl
        } else {
            SizeBucket::Xxl
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SizeBucket::Tiny => "tiny",
            SizeBucket::Small => "small",
            SizeBucket::Medium => "medium",
            SizeBucket::Large => "large",
            SizeBucket::Xl => "xl",
            SizeBucket::Xxl => "xxl",
        }
    }
}

impl fmt::Display for SizeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub total_chunks: usize,
    pub used_chunks: usize,
    pub unused_chunks: usize,
    pub total_allocated: usize,
    pub used_bytes: usize,
    pub unused_bytes: usize,
    pub max_pool_size: usize,
}

/// Snapshot of one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub id: ChunkId,
    pub size: usize,
    pub kind: BufferKind,
    pub bucket: SizeBucket,
    pub in_use: bool,
    pub use_count: u64,
    pub created_at: Instant,
    pub last_used: Instant,
}

impl ChunkInfo {
    fn of(chunk: &MemoryChunk) -> Self {
        Self {
            id: chunk.id(),
            size: chunk.size(),
            kind: chunk.kind(),
            bucket: SizeBucket::for_size(chunk.size()),
            in_use: chunk.is_in_use(),
            use_count: chunk.use_count(),
            created_at: chunk.created_at(),
            last_used: chunk.last_used(),
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    chunks: HashMap<ChunkId, MemoryChunk>,
    /// Chunk ids per size class, in allocation order
    buckets: HashMap<SizeBucket, Vec<ChunkId>>,
    total_allocated: usize,
    next_id: u64,
}

impl PoolState {
    fn find_available(&self, bucket: SizeBucket, size: usize, kind: BufferKind) -> Option<ChunkId> {
        self.buckets.get(&bucket)?.iter().copied().find(|id| {
            self.chunks
                .get(id)
                .is_some_and(|c| !c.is_in_use() && c.kind() == kind && c.size() >= size)
        })
    }

    fn insert(&mut self, chunk: MemoryChunk) {
        let id = chunk.id();
        self.total_allocated += chunk.size();
        self.buckets.entry(SizeBucket::for_size(chunk.size())).or_default().push(id);
        self.chunks.insert(id, chunk);
    }

    fn remove(&mut self, id: ChunkId) -> Option<MemoryChunk> {
        let chunk = self.chunks.remove(&id)?;
        self.total_allocated = self.total_allocated.saturating_sub(chunk.size());
        if let Some(ids) = self.buckets.get_mut(&SizeBucket::for_size(chunk.size())) {
            ids.retain(|&other| other != id);
        }
        Some(chunk)
    }

    fn idle_oldest_first(&self) -> Vec<ChunkId> {
        let mut idle: Vec<&MemoryChunk> = self.chunks.values().filter(|c| !c.is_in_use()).collect();
        idle.sort_by_key(|c| (c.last_used(), c.id()));
        idle.into_iter().map(MemoryChunk::id).collect()
    }

    /// Drops idle chunks, least recently used first, until `incoming` more
    /// bytes fit under `target`. Returns (chunks removed, bytes freed).
    fn trim(&mut self, target: usize, incoming: usize) -> (usize, usize) {
        let mut removed = 0;
        let mut freed = 0;
        for id in self.idle_oldest_first() {
            if self.total_allocated.saturating_add(incoming) <= target {
                break;
            }
            if let Some(chunk) = self.remove(id) {
                removed += 1;
                freed += chunk.size();
            }
        }
        (removed, freed)
    }
}

struct PoolShared {
    state: Mutex<PoolState>,
    max_pool_size: usize,
    enabled: bool,
}

impl PoolShared {
    fn release(&self, id: ChunkId, lease: u64) -> bool {
        let mut state = self.state.lock();
        match state.chunks.get_mut(&id) {
            // Only the borrower of the current lease may release the chunk
            Some(chunk) if chunk.use_count() == lease => chunk.release(),
            _ => false,
        }
    }
}

/// Releases one lease of a pooled buffer.
///
/// Cloneable and idempotent: the first `release` returns the chunk to its
/// pool, later calls do nothing. A handle outliving its pool is harmless.
#[derive(Clone)]
pub struct ReleaseHandle {
    pool: Weak<PoolShared>,
    chunk: Option<(ChunkId, u64)>,
    released: Arc<AtomicBool>,
}

impl ReleaseHandle {
    fn detached() -> Self {
        Self {
            pool: Weak::new(),
            chunk: None,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns the buffer to the pool. Returns true only for the call that
    /// actually released it.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        match (self.pool.upgrade(), self.chunk) {
            (Some(pool), Some((id, lease))) => pool.release(id, lease),
            _ => true,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("chunk", &self.chunk)
            .field("released", &self.is_released())
            .finish()
    }
}

/// A buffer borrowed from a [`MemoryPool`]. Released on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    storage: SharedStorage,
    requested: usize,
    kind: BufferKind,
    handle: ReleaseHandle,
}

impl PooledBuffer {
    /// Chunk backing this buffer, if it came from the pool.
    pub fn chunk_id(&self) -> Option<ChunkId> {
        self.handle.chunk.map(|(id, _)| id)
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Bytes asked for.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Usable size in bytes. At least [`requested`](Self::requested) unless
    /// the pool fell back to a smaller allocation.
    pub fn len(&self) -> usize {
        self.storage.lock().len_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Locks the buffer for reading or writing.
    pub fn lock(&self) -> MutexGuard<'_, ChunkStorage> {
        self.storage.lock()
    }

    /// Zero-fills the buffer.
    pub fn zero(&self) {
        self.storage.lock().zero();
    }

    /// A handle that can release this buffer independently of it.
    pub fn release_handle(&self) -> ReleaseHandle {
        self.handle.clone()
    }

    /// Returns the buffer to the pool now.
    pub fn release(self) -> bool {
        self.handle.release()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.handle.release();
    }
}

/// Pool of reusable buffers grouped by [`SizeBucket`].
///
/// `max_pool_size` is a cleanup target rather than a hard cap: a burst of
/// concurrent borrows may push the pool past it, and idle chunks are
/// trimmed back on the next allocation that would exceed it.
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    pub fn new(max_pool_size: usize) -> Self {
        Self::with_enabled(max_pool_size, true)
    }

    /// Builds a pool from configuration, capped to a share of physical RAM.
    pub fn from_config(config: &PoolConfig) -> Self {
        let config = match physical_ram_bytes() {
            Some(total) => config.clone().clamp_to_system(total),
            None => config.clone(),
        };
        info!(
            max_pool_mb = config.max_pool_size as f64 / (1024.0 * 1024.0),
            enabled = config.enable_memory_pool,
            "Memory pool initialized"
        );
        Self::with_enabled(config.max_pool_size, config.enable_memory_pool)
    }

    fn with_enabled(max_pool_size: usize, enabled: bool) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                max_pool_size,
                enabled,
            }),
        }
    }

    pub fn max_pool_size(&self) -> usize {
        self.shared.max_pool_size
    }

    /// Whether buffers are reused. A disabled pool hands out fresh buffers
    /// that are freed on release.
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled
    }

    /// Borrows a buffer of at least `size` bytes.
    ///
    /// Reuses an idle chunk from the matching size class when one is large
    /// enough; otherwise allocates a new chunk, first trimming idle chunks if
    /// the pool would grow past its maximum.
    ///
    /// # Errors
    /// Returns [`PoolError::AllocationFailed`] if memory could not be
    /// allocated, including after the reduced-size retry.
    pub fn get_buffer(&self, size: usize, kind: BufferKind) -> Result<PooledBuffer, PoolError> {
        if !self.shared.enabled {
            let mut chunk = MemoryChunk::allocate(ChunkId(0), size, kind)?;
            let storage = chunk.acquire().ok_or(PoolError::AllocationFailed {
                requested: size,
                fallback: None,
            })?;
            return Ok(PooledBuffer {
                storage,
                requested: size,
                kind,
                handle: ReleaseHandle::detached(),
            });
        }

        let mut state = self.shared.state.lock();
        let bucket = SizeBucket::for_size(size);

        let id = match state.find_available(bucket, size, kind) {
            Some(id) => id,
            None => {
                if state.total_allocated.saturating_add(size) > self.shared.max_pool_size {
                    let (removed, freed) = state.trim(self.cleanup_target(), size);
                    if removed > 0 {
                        debug!(removed, freed, "Trimmed idle chunks before allocation");
                    }
                }
                state.next_id += 1;
                let chunk = MemoryChunk::allocate(ChunkId(state.next_id), size, kind)?;
                let id = chunk.id();
                state.insert(chunk);
                id
            }
        };

        let chunk = state.chunks.get_mut(&id).ok_or(PoolError::AllocationFailed {
            requested: size,
            fallback: None,
        })?;
        let storage = chunk.acquire().ok_or(PoolError::AllocationFailed {
            requested: size,
            fallback: None,
        })?;
        let lease = chunk.use_count();

        Ok(PooledBuffer {
            storage,
            requested: size,
            kind,
            handle: ReleaseHandle {
                pool: Arc::downgrade(&self.shared),
                chunk: Some((id, lease)),
                released: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    /// Trims idle chunks, oldest first, until the pool is back under its
    /// cleanup target. Returns the number of bytes freed.
    pub fn cleanup(&self) -> usize {
        let (removed, freed) = self.shared.state.lock().trim(self.cleanup_target(), 0);
        if removed > 0 {
            info!(removed, freed_mb = freed as f64 / (1024.0 * 1024.0), "Cleaned up memory chunks");
        }
        freed
    }

    /// Drops every idle chunk. Chunks still lent out are kept. Returns the
    /// number of chunks dropped.
    pub fn clear(&self) -> usize {
        let mut state = self.shared.state.lock();
        let idle = state.idle_oldest_first();
        for id in &idle {
            state.remove(*id);
        }
        info!(cleared = idle.len(), "Cleared unused memory chunks");

        let in_use = state.chunks.len();
        if in_use > 0 {
            warn!(in_use, "Memory chunks still in use, cannot free");
        }
        idle.len()
    }

    /// Resizes an idle chunk. Returns false if it is lent out or unknown.
    pub fn resize_chunk(&self, id: ChunkId, new_size: usize) -> bool {
        let mut state = self.shared.state.lock();
        let Some(mut chunk) = state.remove(id) else {
            return false;
        };
        let resized = chunk.resize(new_size);
        state.insert(chunk);
        resized
    }

    /// Zero-fills an idle chunk. Returns false if it is lent out or unknown.
    pub fn clear_chunk(&self, id: ChunkId) -> bool {
        let mut state = self.shared.state.lock();
        state.chunks.get_mut(&id).is_some_and(MemoryChunk::clear)
    }

    pub fn chunk_info(&self, id: ChunkId) -> Option<ChunkInfo> {
        self.shared.state.lock().chunks.get(&id).map(ChunkInfo::of)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let mut stats = PoolStats {
            total_chunks: state.chunks.len(),
            total_allocated: state.total_allocated,
            max_pool_size: self.shared.max_pool_size,
            ..Default::default()
        };
        for chunk in state.chunks.values() {
            if chunk.is_in_use() {
                stats.used_chunks += 1;
                stats.used_bytes += chunk.size();
            } else {
                stats.unused_chunks += 1;
                stats.unused_bytes += chunk.size();
            }
        }
        stats
    }

    fn cleanup_target(&self) -> usize {
        self.shared.max_pool_size / 100 * CLEANUP_TARGET_PERCENT
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("max_pool_size", &self.shared.max_pool_size)
            .field("enabled", &self.shared.enabled)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KB: usize = 1024;
    const MB: usize = 1024 * 1024;

    #[test]
    fn test_size_buckets() {
        assert_eq!(SizeBucket::for_size(0), SizeBucket::Tiny);
        assert_eq!(SizeBucket::for_size(KB), SizeBucket::Tiny);
        assert_eq!(SizeBucket::for_size(KB + 1), SizeBucket::Small);
        assert_eq!(SizeBucket::for_size(10 * KB), SizeBucket::Small);
        assert_eq!(SizeBucket::for_size(100 * KB), SizeBucket::Medium);
        assert_eq!(SizeBucket::for_size(MB), SizeBucket::Large);
        assert_eq!(SizeBucket::for_size(2 * MB), SizeBucket::Xl);
        assert_eq!(SizeBucket::for_size(10 * MB + 1), SizeBucket::Xxl);
        assert_eq!(SizeBucket::Xl.to_string(), "xl");
    }

    #[test]
    fn test_reuse_after_release() {
        let pool = MemoryPool::new(10 * MB);
        let first = pool.get_buffer(4 * KB, BufferKind::Bytes).unwrap();
        let id = first.chunk_id().unwrap();
        drop(first);

        let second = pool.get_buffer(3 * KB, BufferKind::Bytes).unwrap();
        assert_eq!(second.chunk_id(), Some(id));
        assert_eq!(second.len(), 4 * KB);
        assert_eq!(pool.chunk_info(id).unwrap().use_count, 2);
    }

    #[test]
    fn test_kind_must_match() {
        let pool = MemoryPool::new(10 * MB);
        let floats = pool.get_buffer(4 * KB, BufferKind::Float32).unwrap();
        let float_id = floats.chunk_id();
        drop(floats);

        let bytes = pool.get_buffer(4 * KB, BufferKind::Bytes).unwrap();
        assert_ne!(bytes.chunk_id(), float_id);
        assert!(bytes.lock().as_bytes().is_some());
    }

    #[test]
    fn test_smaller_idle_chunk_not_reused() {
        let pool = MemoryPool::new(10 * MB);
        drop(pool.get_buffer(2 * KB, BufferKind::Bytes).unwrap());

        let larger = pool.get_buffer(8 * KB, BufferKind::Bytes).unwrap();
        assert!(larger.len() >= 8 * KB);
        assert_eq!(pool.stats().total_chunks, 2);
    }

    #[test]
    fn test_stale_handle_does_not_release_new_lease() {
        let pool = MemoryPool::new(10 * MB);
        let first = pool.get_buffer(KB, BufferKind::Bytes).unwrap();
        let stale = first.release_handle();
        drop(first);

        let second = pool.get_buffer(KB, BufferKind::Bytes).unwrap();
        assert!(!stale.release());
        assert_eq!(pool.stats().used_chunks, 1);
        drop(second);
        assert_eq!(pool.stats().used_chunks, 0);
    }

    #[test]
    fn test_allocation_trims_idle_chunks() {
        let pool = MemoryPool::new(10 * MB);
        let buffers: Vec<_> = (0..4).map(|_| pool.get_buffer(2 * MB, BufferKind::Bytes).unwrap()).collect();
        drop(buffers);
        assert_eq!(pool.stats().total_allocated, 8 * MB);

        // Needs a new 4 MB chunk: idle ones are trimmed to make headroom
        let big = pool.get_buffer(4 * MB, BufferKind::Bytes).unwrap();
        let stats = pool.stats();
        assert!(stats.total_allocated <= 8 * MB, "{:?}", stats);
        assert_eq!(stats.used_chunks, 1);
        drop(big);
    }

    #[test]
    fn test_overshoot_tolerated_while_borrowed() {
        let pool = MemoryPool::new(MB);
        let a = pool.get_buffer(MB, BufferKind::Bytes).unwrap();
        let b = pool.get_buffer(MB, BufferKind::Bytes).unwrap();
        assert_eq!(pool.stats().total_allocated, 2 * MB);
        drop(a);
        drop(b);

        pool.cleanup();
        assert!(pool.stats().total_allocated <= MB);
    }

    #[test]
    fn test_clear_keeps_in_use_chunks() {
        let pool = MemoryPool::new(10 * MB);
        let held = pool.get_buffer(KB, BufferKind::Bytes).unwrap();
        drop(pool.get_buffer(64 * KB, BufferKind::Bytes).unwrap());

        assert_eq!(pool.clear(), 1);
        let stats = pool.stats();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.used_chunks, 1);
        assert_eq!(stats.total_allocated, KB);
        drop(held);
    }

    #[test]
    fn test_float_chunks_account_rounded_bytes() {
        let pool = MemoryPool::new(10 * MB);
        let buffer = pool.get_buffer(10, BufferKind::Float32).unwrap();
        assert_eq!(buffer.len(), 12);

        let stats = pool.stats();
        assert_eq!(stats.total_allocated, 12);
        assert_eq!(stats.used_bytes, 12);
        drop(buffer);
        assert_eq!(pool.stats().unused_bytes, 12);
    }

    #[test]
    fn test_resize_chunk() {
        let pool = MemoryPool::new(10 * MB);
        let buffer = pool.get_buffer(KB, BufferKind::Bytes).unwrap();
        let id = buffer.chunk_id().unwrap();

        assert!(!pool.resize_chunk(id, 64 * KB));
        drop(buffer);
        assert!(pool.resize_chunk(id, 64 * KB));

        let info = pool.chunk_info(id).unwrap();
        assert_eq!(info.size, 64 * KB);
        assert_eq!(info.bucket, SizeBucket::Medium);
        assert_eq!(pool.stats().total_allocated, 64 * KB);
        assert!(!pool.resize_chunk(ChunkId(999), KB));
    }

    #[test]
    fn test_clear_chunk_and_zero() {
        let pool = MemoryPool::new(10 * MB);
        let buffer = pool.get_buffer(16, BufferKind::Bytes).unwrap();
        let id = buffer.chunk_id().unwrap();
        buffer.lock().as_bytes_mut().unwrap().fill(9);
        buffer.zero();
        assert!(buffer.lock().as_bytes().unwrap().iter().all(|&b| b == 0));
        buffer.lock().as_bytes_mut().unwrap().fill(9);

        assert!(!pool.clear_chunk(id));
        drop(buffer);
        assert!(pool.clear_chunk(id));

        let again = pool.get_buffer(16, BufferKind::Bytes).unwrap();
        assert!(again.lock().as_bytes().unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_disabled_pool_does_not_retain() {
        let pool = MemoryPool::with_enabled(10 * MB, false);
        let buffer = pool.get_buffer(KB, BufferKind::Float32).unwrap();
        assert_eq!(buffer.chunk_id(), None);
        assert!(buffer.len() >= KB);
        assert!(buffer.release());
        assert_eq!(pool.stats().total_chunks, 0);
    }

    #[test]
    fn test_handle_outlives_pool() {
        let pool = MemoryPool::new(MB);
        let buffer = pool.get_buffer(KB, BufferKind::Bytes).unwrap();
        let handle = buffer.release_handle();
        drop(pool);

        assert!(handle.release());
        assert!(!handle.release());
        drop(buffer);
    }
}
