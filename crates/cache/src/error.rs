use std::io;

/// Errors produced by the cache layer.
///
/// Most cache failures are absorbed (a failed persistence write degrades to a
/// memory-only entry, a corrupt blob degrades to a miss). These variants
/// surface where a caller can act on them.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// I/O error from a backing store
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Payload could not be serialized or deserialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Image payload could not be encoded
    #[error("encoding error: {0}")]
    Encoding(String),
    /// A level is over capacity but its eviction policy has no victim to offer
    #[error("cache level `{level}` is over capacity with no eviction candidate")]
    CapacityMisconfigured { level: String },
    /// A persisted blob exists but does not hold a valid entry
    #[error("corrupt cache entry: {0}")]
    Corrupt(String),
}
