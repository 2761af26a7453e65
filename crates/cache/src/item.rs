//! Serializable envelope for cached thumbnails and images.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::level::EntryMeta;
use crate::value::{self, base64_bytes, CacheValue};

/// Free-form metadata attached to a cached image.
pub type ImageMetadata = BTreeMap<String, serde_json::Value>;

/// Cache payload for one image.
///
/// Pixel payloads are stored as encoded image bytes, never as live handles,
/// so an item survives a round trip through a persistent level. Empty
/// payloads are normalized to `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageCacheItem {
    pub image_id: i64,
    /// Encoded thumbnail pixmap
    #[serde(with = "base64_bytes", default)]
    pub pixmap_data: Option<Vec<u8>>,
    /// Encoded full image
    #[serde(with = "base64_bytes", default)]
    pub image_data: Option<Vec<u8>>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub metadata: ImageMetadata,
    pub last_accessed: SystemTime,
    pub access_count: u64,
}

impl ImageCacheItem {
    pub fn new(image_id: i64) -> Self {
        Self {
            image_id,
            pixmap_data: None,
            image_data: None,
            path: None,
            metadata: ImageMetadata::new(),
            last_accessed: SystemTime::now(),
            access_count: 0,
        }
    }

    pub fn with_pixmap_data(mut self, data: Vec<u8>) -> Self {
        self.pixmap_data = non_empty(data);
        self
    }

    pub fn with_image_data(mut self, data: Vec<u8>) -> Self {
        self.image_data = non_empty(data);
        self
    }

    pub fn with_path(mut self, path: Option<&Path>) -> Self {
        self.path = path.map(Path::to_path_buf);
        self
    }

    pub fn with_metadata(mut self, metadata: ImageMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Serializes the item to its persisted form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CacheError> {
        value::encode(self)
    }

    /// Restores an item from [`to_bytes`](Self::to_bytes) output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CacheError> {
        let mut item: Self = value::decode(bytes)?;
        item.pixmap_data = item.pixmap_data.and_then(non_empty);
        item.image_data = item.image_data.and_then(non_empty);
        Ok(item)
    }
}

impl CacheValue for ImageCacheItem {
    fn estimated_size(&self) -> usize {
        let payload = self.pixmap_data.as_ref().map_or(0, Vec::len) + self.image_data.as_ref().map_or(0, Vec::len);
        let path = self.path.as_ref().map_or(0, |p| p.as_os_str().len());
        let metadata: usize = self.metadata.iter().map(|(k, v)| k.len() + v.to_string().len()).sum();
        std::mem::size_of::<Self>() + payload + path + metadata
    }

    /// Access tracking mirrors the level entry that served the item.
    fn on_hit(&mut self, meta: &EntryMeta) {
        self.last_accessed = meta.last_accessed;
        self.access_count = meta.access_count;
    }
}

fn non_empty(data: Vec<u8>) -> Option<Vec<u8>> {
    if data.is_empty() {
        None
    } else {
        Some(data)
    }
}
