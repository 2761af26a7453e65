//! Reusable raw buffers.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::PoolError;

/// Size allocation falls back to when a larger request cannot be satisfied.
pub const FALLBACK_ALLOCATION: usize = 1024 * 1024;

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// `f32` samples, the usual working format for image math
    Float32,
    /// Raw bytes
    Bytes,
}

/// The memory behind a chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkStorage {
    Float32(Vec<f32>),
    Bytes(Vec<u8>),
}

impl ChunkStorage {
    /// Allocates a zeroed buffer covering at least `size` bytes, without
    /// aborting the process if the allocator refuses.
    pub fn try_new(size: usize, kind: BufferKind) -> Result<Self, std::collections::TryReserveError> {
        match kind {
            BufferKind::Float32 => {
                let elements = size.div_ceil(4).max(1);
                let mut data: Vec<f32> = Vec::new();
                data.try_reserve_exact(elements)?;
                data.resize(elements, 0.0);
                Ok(ChunkStorage::Float32(data))
            }
            BufferKind::Bytes => {
                let mut data: Vec<u8> = Vec::new();
                data.try_reserve_exact(size)?;
                data.resize(size, 0);
                Ok(ChunkStorage::Bytes(data))
            }
        }
    }

    pub fn kind(&self) -> BufferKind {
        match self {
            ChunkStorage::Float32(_) => BufferKind::Float32,
            ChunkStorage::Bytes(_) => BufferKind::Bytes,
        }
    }

    /// Size of the buffer in bytes.
    pub fn len_bytes(&self) -> usize {
        match self {
            ChunkStorage::Float32(data) => data.len() * std::mem::size_of::<f32>(),
            ChunkStorage::Bytes(data) => data.len(),
        }
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            ChunkStorage::Float32(data) => Some(data),
            ChunkStorage::Bytes(_) => None,
        }
    }

    pub fn as_f32_mut(&mut self) -> Option<&mut [f32]> {
        match self {
            ChunkStorage::Float32(data) => Some(data),
            ChunkStorage::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            ChunkStorage::Bytes(data) => Some(data),
            ChunkStorage::Float32(_) => None,
        }
    }

    pub fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            ChunkStorage::Bytes(data) => Some(data),
            ChunkStorage::Float32(_) => None,
        }
    }

    /// Zero-fills the buffer in place.
    pub fn zero(&mut self) {
        match self {
            ChunkStorage::Float32(data) => data.fill(0.0),
            ChunkStorage::Bytes(data) => data.fill(0),
        }
    }
}

/// Shared handle to a chunk's storage.
pub type SharedStorage = Arc<Mutex<ChunkStorage>>;

/// Identifier of a chunk within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub(crate) u64);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk#{}", self.0)
    }
}

/// A reusable buffer with lending state.
///
/// A chunk is lent to at most one borrower at a time: `acquire` on a chunk
/// that is already in use is refused.
#[derive(Debug)]
pub struct MemoryChunk {
    id: ChunkId,
    size: usize,
    kind: BufferKind,
    storage: SharedStorage,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    in_use: bool,
}

impl MemoryChunk {
    /// Allocates a chunk of `size` bytes.
    ///
    /// If the allocation fails and `size` is above [`FALLBACK_ALLOCATION`],
    /// one retry is made at that size; the resulting chunk is smaller than
    /// requested.
    ///
    /// # Errors
    /// Returns [`PoolError::AllocationFailed`] if no buffer could be allocated.
    pub fn allocate(id: ChunkId, size: usize, kind: BufferKind) -> Result<Self, PoolError> {
        let storage = match ChunkStorage::try_new(size, kind) {
            Ok(storage) => storage,
            Err(e) if size > FALLBACK_ALLOCATION => {
                warn!(requested = size, fallback = FALLBACK_ALLOCATION, error = %e, "Buffer allocation failed, retrying smaller");
                match ChunkStorage::try_new(FALLBACK_ALLOCATION, kind) {
                    Ok(storage) => storage,
                    Err(e) => {
                        error!(requested = size, error = %e, "Fallback buffer allocation failed");
                        return Err(PoolError::AllocationFailed {
                            requested: size,
                            fallback: Some(FALLBACK_ALLOCATION),
                        });
                    }
                }
            }
            Err(e) => {
                error!(requested = size, error = %e, "Buffer allocation failed");
                return Err(PoolError::AllocationFailed {
                    requested: size,
                    fallback: None,
                });
            }
        };

        let size = storage.len_bytes();
        debug!(%id, size, ?kind, "Allocated memory chunk");
        let now = Instant::now();
        Ok(Self {
            id,
            size,
            kind,
            storage: Arc::new(Mutex::new(storage)),
            created_at: now,
            last_used: now,
            use_count: 0,
            in_use: false,
        })
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Usable size in bytes. `Float32` chunks round the requested size up
    /// to whole samples.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    /// Number of times the chunk has been lent out.
    pub fn use_count(&self) -> u64 {
        self.use_count
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Lends the chunk out. Returns `None` if it is already in use.
    pub fn acquire(&mut self) -> Option<SharedStorage> {
        if self.in_use {
            warn!(id = %self.id, "Chunk is already in use, refusing second borrower");
            return None;
        }
        self.in_use = true;
        self.last_used = Instant::now();
        self.use_count += 1;
        Some(Arc::clone(&self.storage))
    }

    /// Returns the chunk to the idle state. Returns false if it was not lent.
    pub fn release(&mut self) -> bool {
        if !self.in_use {
            return false;
        }
        self.in_use = false;
        self.last_used = Instant::now();
        true
    }

    /// Replaces the buffer with a fresh one of `new_size` bytes.
    ///
    /// Refused (returns false) while the chunk is lent, or if the new buffer
    /// cannot be allocated; the old buffer is kept in both cases.
    pub fn resize(&mut self, new_size: usize) -> bool {
        if self.in_use {
            warn!(id = %self.id, "Cannot resize memory chunk while in use");
            return false;
        }
        match ChunkStorage::try_new(new_size, self.kind) {
            Ok(storage) => {
                self.size = storage.len_bytes();
                self.storage = Arc::new(Mutex::new(storage));
                true
            }
            Err(e) => {
                warn!(id = %self.id, new_size, error = %e, "Failed to resize memory chunk");
                false
            }
        }
    }

    /// Zero-fills an idle chunk. Returns false if the chunk is lent.
    pub fn clear(&mut self) -> bool {
        if self.in_use {
            warn!(id = %self.id, "Cannot clear memory chunk while in use");
            return false;
        }
        self.storage.lock().zero();
        true
    }
}
