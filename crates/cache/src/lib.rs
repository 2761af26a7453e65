//! StarBrowse cache library
//!
//! Multi-level cache with pluggable eviction (LRU, LFU, FIFO, TTL), memory
//! and persistent levels, and an image cache for thumbnails and full images.

pub mod config;
pub mod error;
pub mod eviction;
pub mod image_cache;
pub mod item;
pub mod level;
pub mod manager;
pub mod store;
pub mod value;

pub use config::CacheConfig;
pub use error::CacheError;
pub use eviction::{EvictionPolicy, FifoPolicy, LfuPolicy, LruPolicy, PolicyKind, TtlPolicy, UnknownPolicy};
pub use image_cache::{ImageCache, ImageCodec, RgbaCodec};
pub use item::{ImageCacheItem, ImageMetadata};
pub use level::{CacheLevel, Capacity, EntryMeta, LevelStats};
pub use manager::CacheManager;
pub use store::{BackingStore, FsStore, MemoryStore};
pub use value::CacheValue;
