//! Buffer pooling and memory supervision for image decoding.
//!
//! - [`MemoryPool`] lends out reusable buffers grouped by size class.
//! - [`ImageBuffer`] shapes pool buffers as `height x width x channels`
//!   `f32` images and tracks them until they are released.
//! - [`ResourceManager`] samples memory in the background and runs
//!   registered cleanups when usage crosses a threshold.

pub mod chunk;
pub mod config;
pub mod error;
pub mod image_buffer;
pub mod pool;
pub mod pressure;
pub mod resource;
pub mod system;

pub use chunk::{BufferKind, ChunkId, ChunkStorage, MemoryChunk, SharedStorage, FALLBACK_ALLOCATION};
pub use config::{PoolConfig, ResourceConfig};
pub use error::PoolError;
pub use image_buffer::{BufferId, ColorLayout, ImageBuffer, ImageLease};
pub use pool::{ChunkInfo, MemoryPool, PoolStats, PooledBuffer, ReleaseHandle, SizeBucket};
pub use pressure::MemoryPressure;
pub use resource::{
    BatchGuard, CallbackId, CleanupReport, CleanupResult, MemoryUsage, ResourceManager, SweepSummary,
};
pub use system::{MemoryProbe, MemorySample, SystemProbe};
