//! Shaped `f32` image buffers on top of a [`MemoryPool`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::chunk::{BufferKind, ChunkStorage, SharedStorage};
use crate::error::PoolError;
use crate::pool::{MemoryPool, PooledBuffer, ReleaseHandle};

/// Identifier of a buffer handed out by an [`ImageBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// Pixel layouts with a fixed channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorLayout {
    /// Single luminance channel
    L,
    Rgb,
    Rgba,
}

impl ColorLayout {
    pub fn channels(&self) -> usize {
        match self {
            ColorLayout::L => 1,
            ColorLayout::Rgb => 3,
            ColorLayout::Rgba => 4,
        }
    }
}

struct Tracked {
    shape: (usize, usize, usize),
    /// None for buffers that did not come from the pool
    handle: Option<ReleaseHandle>,
}

type Registry = Mutex<HashMap<BufferId, Tracked>>;

enum Backing {
    Pooled(PooledBuffer),
    Owned(SharedStorage),
}

/// A `height x width x channels` buffer of `f32` samples, row-major with
/// interleaved channels.
///
/// Released when dropped, through [`ImageLease::release`], or by the owning
/// [`ImageBuffer`]'s `release`/`release_all`.
pub struct ImageLease {
    id: BufferId,
    shape: (usize, usize, usize),
    backing: Backing,
    registry: Weak<Registry>,
}

impl ImageLease {
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// `(height, width, channels)`
    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    /// Number of `f32` samples in the view.
    pub fn len(&self) -> usize {
        let (h, w, c) = self.shape;
        h * w * c
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the samples live in a pool chunk.
    pub fn is_pooled(&self) -> bool {
        matches!(self.backing, Backing::Pooled(_))
    }

    /// Runs `f` with exclusive access to exactly [`len`](Self::len) samples.
    pub fn with_pixels<R>(&self, f: impl FnOnce(&mut [f32]) -> R) -> R {
        let mut storage = match &self.backing {
            Backing::Pooled(buffer) => buffer.lock(),
            Backing::Owned(storage) => storage.lock(),
        };
        let data: &mut [f32] = storage.as_f32_mut().unwrap_or_default();
        let len = self.len().min(data.len());
        f(&mut data[..len])
    }

    /// Index of sample `(y, x, channel)` in the slice passed to
    /// [`with_pixels`](Self::with_pixels).
    pub fn index(&self, y: usize, x: usize, channel: usize) -> usize {
        let (_, w, c) = self.shape;
        (y * w + x) * c + channel
    }

    /// A handle that releases this buffer without consuming the lease.
    pub fn release_handle(&self) -> Option<ReleaseHandle> {
        match &self.backing {
            Backing::Pooled(buffer) => Some(buffer.release_handle()),
            Backing::Owned(_) => None,
        }
    }

    /// Returns the buffer and stops tracking it. Same as dropping the lease.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ImageLease {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }
        // A pooled buffer goes back to its pool when `backing` drops
    }
}

impl fmt::Debug for ImageLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageLease")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

/// Hands out image-shaped buffers and tracks them until release.
pub struct ImageBuffer {
    pool: MemoryPool,
    registry: Arc<Registry>,
    next_id: AtomicU64,
}

impl ImageBuffer {
    pub fn new(pool: MemoryPool) -> Self {
        Self {
            pool,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    /// Borrows a `height x width x channels` `f32` buffer.
    ///
    /// The pool is asked for `width * height * channels * 4` bytes. If it
    /// returns less (after an allocation fallback) the pooled chunk is given
    /// back and an exact-size buffer is allocated instead, so the lease never
    /// holds fewer samples than the shape needs.
    ///
    /// # Errors
    /// Returns [`PoolError::AllocationFailed`] if no buffer of the needed size
    /// can be allocated.
    pub fn get_buffer_for_image(&self, width: usize, height: usize, channels: usize) -> Result<ImageLease, PoolError> {
        let bytes = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(channels))
            .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
            .ok_or(PoolError::AllocationFailed {
                requested: usize::MAX,
                fallback: None,
            })?;

        let pooled = self.pool.get_buffer(bytes, BufferKind::Float32)?;
        let backing = if pooled.len() >= bytes {
            Backing::Pooled(pooled)
        } else {
            debug!(requested = bytes, got = pooled.len(), "Pool buffer too small, allocating exact size");
            drop(pooled);
            let storage = ChunkStorage::try_new(bytes, BufferKind::Float32).map_err(|_| PoolError::AllocationFailed {
                requested: bytes,
                fallback: None,
            })?;
            Backing::Owned(Arc::new(Mutex::new(storage)))
        };

        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shape = (height, width, channels);
        let handle = match &backing {
            Backing::Pooled(buffer) => Some(buffer.release_handle()),
            Backing::Owned(_) => None,
        };
        self.registry.lock().insert(id, Tracked { shape, handle });

        Ok(ImageLease {
            id,
            shape,
            backing,
            registry: Arc::downgrade(&self.registry),
        })
    }

    pub fn get_buffer_for_layout(&self, width: usize, height: usize, layout: ColorLayout) -> Result<ImageLease, PoolError> {
        self.get_buffer_for_image(width, height, layout.channels())
    }

    /// Releases a tracked buffer by id. Returns false if it is not tracked.
    pub fn release(&self, id: BufferId) -> bool {
        let Some(tracked) = self.registry.lock().remove(&id) else {
            return false;
        };
        if let Some(handle) = tracked.handle {
            handle.release();
        }
        true
    }

    /// Releases every tracked buffer. Returns how many were released.
    pub fn release_all(&self) -> usize {
        let tracked: Vec<(BufferId, Tracked)> = self.registry.lock().drain().collect();
        for (id, entry) in &tracked {
            let (h, w, c) = entry.shape;
            debug!(%id, height = h, width = w, channels = c, "Releasing image buffer");
            if let Some(handle) = &entry.handle {
                handle.release();
            }
        }
        if !tracked.is_empty() {
            info!(released = tracked.len(), "Released all image buffers");
        }
        tracked.len()
    }

    pub fn active_buffer_count(&self) -> usize {
        self.registry.lock().len()
    }
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("pool", &self.pool)
            .field("active", &self.active_buffer_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1024 * 1024;

    fn buffers() -> ImageBuffer {
        ImageBuffer::new(MemoryPool::new(10 * MB))
    }

    #[test]
    fn test_shape_and_view_length() {
        let images = buffers();
        let lease = images.get_buffer_for_image(4, 3, 3).unwrap();
        assert_eq!(lease.shape(), (3, 4, 3));
        assert_eq!(lease.len(), 36);
        assert!(lease.is_pooled());
        assert_eq!(lease.with_pixels(|px| px.len()), 36);
        assert_eq!(images.active_buffer_count(), 1);
    }

    #[test]
    fn test_pixel_writes_are_visible() {
        let images = buffers();
        let lease = images.get_buffer_for_layout(2, 2, ColorLayout::Rgba).unwrap();
        let at = lease.index(1, 0, 2);
        lease.with_pixels(|px| px[at] = 0.5);
        assert_eq!(lease.with_pixels(|px| px[at]), 0.5);
        assert_eq!(at, 10);
    }

    #[test]
    fn test_drop_untracks_and_returns_chunk() {
        let images = buffers();
        let lease = images.get_buffer_for_layout(8, 8, ColorLayout::L).unwrap();
        assert_eq!(images.pool().stats().used_chunks, 1);
        drop(lease);
        assert_eq!(images.active_buffer_count(), 0);
        assert_eq!(images.pool().stats().used_chunks, 0);
    }

    #[test]
    fn test_release_by_id() {
        let images = buffers();
        let lease = images.get_buffer_for_image(16, 16, 1).unwrap();
        let id = lease.id();

        assert!(images.release(id));
        assert!(!images.release(id));
        assert_eq!(images.pool().stats().used_chunks, 0);
        // Dropping after an explicit release is harmless
        drop(lease);
        assert_eq!(images.pool().stats().total_chunks, 1);
    }

    #[test]
    fn test_lease_release_returns_chunk() {
        let images = buffers();
        let lease = images.get_buffer_for_image(8, 8, 3).unwrap();
        let chunk = lease.release_handle().unwrap();

        lease.release();
        assert!(chunk.is_released());
        assert_eq!(images.active_buffer_count(), 0);
        assert_eq!(images.pool().stats().used_chunks, 0);
        assert_eq!(images.release_all(), 0);
    }

    #[test]
    fn test_release_all_frees_every_chunk() {
        let images = buffers();
        let leases: Vec<_> = (1..=3).map(|n| images.get_buffer_for_image(n * 10, 10, 3).unwrap()).collect();
        assert_eq!(images.pool().stats().used_chunks, 3);

        assert_eq!(images.release_all(), 3);
        assert_eq!(images.active_buffer_count(), 0);
        assert_eq!(images.pool().stats().used_chunks, 0);
        drop(leases);
        assert_eq!(images.release_all(), 0);
    }

    #[test]
    fn test_overflowing_shape_is_an_error() {
        let images = buffers();
        let err = images.get_buffer_for_image(usize::MAX, 2, 3).unwrap_err();
        assert!(matches!(err, PoolError::AllocationFailed { .. }));
        assert_eq!(images.active_buffer_count(), 0);
    }

    #[test]
    fn test_layout_channels() {
        assert_eq!(ColorLayout::L.channels(), 1);
        assert_eq!(ColorLayout::Rgb.channels(), 3);
        assert_eq!(ColorLayout::Rgba.channels(), 4);
    }
}
