//! Image-specific cache facade.
//!
//! [`ImageCache`] stores thumbnails under `thumbnail:<id>` and full images
//! under `image:<id>` in a shared [`CacheManager`], and keeps a small LRU of
//! already-decoded thumbnail pixmaps so repeated redraws skip the manager
//! probe and the decode entirely.

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, ImageFormat, RgbaImage};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::item::{ImageCacheItem, ImageMetadata};
use crate::manager::CacheManager;

const THUMBNAIL_PREFIX: &str = "thumbnail:";
const IMAGE_PREFIX: &str = "image:";

/// Converts between a UI pixmap type and the encoded bytes the cache stores.
pub trait ImageCodec: Send + Sync {
    type Pixmap: Clone + Send;

    /// Encodes `pixmap` into a self-describing image format.
    fn encode_pixmap(&self, pixmap: &Self::Pixmap) -> Result<Vec<u8>, CacheError>;

    /// Decodes bytes produced by [`encode_pixmap`](Self::encode_pixmap).
    /// Empty or unparseable input yields `None`.
    fn decode_pixmap(&self, bytes: &[u8]) -> Option<Self::Pixmap>;
}

/// PNG codec for shared RGBA pixmaps.
#[derive(Debug, Clone, Copy, Default)]
pub struct RgbaCodec;

impl ImageCodec for RgbaCodec {
    type Pixmap = Arc<RgbaImage>;

    fn encode_pixmap(&self, pixmap: &Self::Pixmap) -> Result<Vec<u8>, CacheError> {
        let mut bytes = Vec::new();
        pixmap
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(|e| CacheError::Encoding(e.to_string()))?;
        Ok(bytes)
    }

    fn decode_pixmap(&self, bytes: &[u8]) -> Option<Self::Pixmap> {
        decode_image(bytes).map(|img| Arc::new(img.to_rgba8()))
    }
}

fn encode_image(image: &DynamicImage) -> Result<Vec<u8>, CacheError> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| CacheError::Encoding(e.to_string()))?;
    Ok(bytes)
}

fn decode_image(bytes: &[u8]) -> Option<DynamicImage> {
    if bytes.is_empty() {
        return None;
    }
    let image = image::load_from_memory(bytes).ok()?;
    if image.width() == 0 || image.height() == 0 {
        return None;
    }
    Some(image)
}

fn thumbnail_key(image_id: i64) -> String {
    format!("{}{}", THUMBNAIL_PREFIX, image_id)
}

fn image_key(image_id: i64) -> String {
    format!("{}{}", IMAGE_PREFIX, image_id)
}

/// Bounded LRU of decoded pixmaps keyed by image id.
struct PixmapLru<P> {
    pixmaps: HashMap<i64, P>,
    /// front = least recently used
    order: VecDeque<i64>,
    limit: usize,
}

impl<P: Clone> PixmapLru<P> {
    fn new(limit: usize) -> Self {
        Self {
            pixmaps: HashMap::new(),
            order: VecDeque::new(),
            limit,
        }
    }

    fn touch(&mut self, id: i64) {
        self.order.retain(|&k| k != id);
        self.order.push_back(id);
    }

    fn get(&mut self, id: i64) -> Option<P> {
        let pixmap = self.pixmaps.get(&id)?.clone();
        self.touch(id);
        Some(pixmap)
    }

    fn insert(&mut self, id: i64, pixmap: P) {
        if self.limit == 0 {
            return;
        }
        self.pixmaps.insert(id, pixmap);
        self.touch(id);
        while self.pixmaps.len() > self.limit {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.pixmaps.remove(&oldest);
        }
    }

    fn remove(&mut self, id: i64) -> bool {
        self.order.retain(|&k| k != id);
        self.pixmaps.remove(&id).is_some()
    }

    fn clear(&mut self) {
        self.pixmaps.clear();
        self.order.clear();
    }
}

/// Thumbnail and full-image cache over a shared [`CacheManager`].
pub struct ImageCache<C: ImageCodec = RgbaCodec> {
    manager: Arc<CacheManager<ImageCacheItem>>,
    codec: C,
    pixmaps: Mutex<PixmapLru<C::Pixmap>>,
}

impl ImageCache<RgbaCodec> {
    /// Creates a cache using the PNG RGBA codec.
    pub fn new(manager: Arc<CacheManager<ImageCacheItem>>, thumbnail_memory_limit: usize) -> Self {
        Self::with_codec(manager, RgbaCodec, thumbnail_memory_limit)
    }

    /// Builds the default level stack from `config` and wraps it.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            Arc::new(CacheManager::from_config(config)),
            config.thumbnail_memory_limit,
        )
    }
}

impl<C: ImageCodec> ImageCache<C> {
    pub fn with_codec(manager: Arc<CacheManager<ImageCacheItem>>, codec: C, thumbnail_memory_limit: usize) -> Self {
        Self {
            manager,
            codec,
            pixmaps: Mutex::new(PixmapLru::new(thumbnail_memory_limit)),
        }
    }

    /// The underlying multi-level cache.
    pub fn manager(&self) -> &Arc<CacheManager<ImageCacheItem>> {
        &self.manager
    }

    /// Number of decoded thumbnails held locally.
    pub fn resident_thumbnails(&self) -> usize {
        self.pixmaps.lock().pixmaps.len()
    }

    /// Returns the thumbnail for `image_id`, from the local LRU if possible.
    ///
    /// A cached thumbnail that fails to decode is dropped from the cache and
    /// reported as `None`.
    pub fn get_thumbnail(&self, image_id: i64) -> Option<C::Pixmap> {
        if let Some(pixmap) = self.pixmaps.lock().get(image_id) {
            return Some(pixmap);
        }

        let key = thumbnail_key(image_id);
        let item = self.manager.get(&key)?;
        match item.pixmap_data.as_deref().and_then(|bytes| self.codec.decode_pixmap(bytes)) {
            Some(pixmap) => {
                self.pixmaps.lock().insert(image_id, pixmap.clone());
                Some(pixmap)
            }
            None => {
                warn!(image_id, "Cached thumbnail is empty or corrupt, dropping it");
                self.manager.invalidate(&key);
                None
            }
        }
    }

    /// Caches a thumbnail. Returns true if any cache level stored it.
    pub fn set_thumbnail(
        &self,
        image_id: i64,
        pixmap: &C::Pixmap,
        path: Option<&Path>,
        metadata: Option<ImageMetadata>,
    ) -> bool {
        let bytes = match self.codec.encode_pixmap(pixmap) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(image_id, error = %e, "Failed to encode thumbnail");
                return false;
            }
        };

        let item = ImageCacheItem::new(image_id)
            .with_pixmap_data(bytes)
            .with_path(path)
            .with_metadata(metadata.unwrap_or_default());

        self.pixmaps.lock().insert(image_id, pixmap.clone());
        self.manager.put(&thumbnail_key(image_id), item, None)
    }

    /// Returns the cached full image for `image_id`.
    pub fn get_image(&self, image_id: i64) -> Option<DynamicImage> {
        let key = image_key(image_id);
        let item = self.manager.get(&key)?;
        match item.image_data.as_deref().and_then(decode_image) {
            Some(image) => Some(image),
            None => {
                warn!(image_id, "Cached image is empty or corrupt, dropping it");
                self.manager.invalidate(&key);
                None
            }
        }
    }

    /// Caches a full image. Returns true if any cache level stored it.
    pub fn set_image(
        &self,
        image_id: i64,
        image: &DynamicImage,
        path: Option<&Path>,
        metadata: Option<ImageMetadata>,
    ) -> bool {
        let bytes = match encode_image(image) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(image_id, error = %e, "Failed to encode image");
                return false;
            }
        };

        let item = ImageCacheItem::new(image_id)
            .with_image_data(bytes)
            .with_path(path)
            .with_metadata(metadata.unwrap_or_default());
        self.manager.put(&image_key(image_id), item, None)
    }

    /// Removes everything cached for `image_id`. Returns true if anything was
    /// removed.
    pub fn remove(&self, image_id: i64) -> bool {
        let local = self.pixmaps.lock().remove(image_id);
        let thumbnail = self.manager.invalidate(&thumbnail_key(image_id));
        let image = self.manager.invalidate(&image_key(image_id));
        local || thumbnail || image
    }

    /// Drops all thumbnails and images. Other keys in the shared manager are
    /// left alone.
    pub fn clear(&self) {
        self.pixmaps.lock().clear();
        let removed = self.manager.invalidate_prefix(THUMBNAIL_PREFIX) + self.manager.invalidate_prefix(IMAGE_PREFIX);
        debug!(removed, "Cleared image cache");
    }
}
