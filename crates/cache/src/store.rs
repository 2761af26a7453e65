//! Key-addressable blob stores backing persistent cache levels.
//!
//! [`FsStore`] keeps one file per key in a directory. File names are the hex
//! encoding of the key so any string key maps to a safe, reversible name.
//! [`MemoryStore`] is an in-process store, useful for tests and for levels
//! that should survive a cache rebuild but not the process.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Minimal blob store contract used by persistent cache levels.
pub trait BackingStore: Send {
    /// Writes `bytes` under `key`, replacing any previous blob.
    fn write(&self, key: &str, bytes: &[u8]) -> io::Result<()>;

    /// Reads the blob stored under `key`, or `None` if there is none.
    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>>;

    /// Deletes the blob under `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> io::Result<()>;

    /// Lists every key currently stored.
    fn list_keys(&self) -> io::Result<Vec<String>>;
}

const BLOB_EXTENSION: &str = "blob";

/// Directory-backed blob store.
#[derive(Debug, Clone)]
pub struct FsStore {
    dir: PathBuf,
}

impl FsStore {
    /// Opens a store rooted at `dir`, creating the directory if needed.
    pub fn new<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory holding the blobs.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", encode_key(key), BLOB_EXTENSION))
    }
}

impl BackingStore for FsStore {
    fn write(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.key_to_path(key);
        let tmp_path = path.with_extension("tmp");

        // Write to a temp file first so a crash never leaves a torn blob
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &path)
    }

    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.key_to_path(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        match fs::remove_file(self.key_to_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn list_keys(&self) -> io::Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            if let Some(key) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(decode_key)
            {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

fn encode_key(key: &str) -> String {
    key.bytes().map(|b| format!("{:02x}", b)).collect()
}

fn decode_key(hex: &str) -> Option<String> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let bytes = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect::<Option<Vec<u8>>>()?;
    String::from_utf8(bytes).ok()
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    reads: AtomicU64,
    writes: AtomicU64,
    fail_writes: AtomicBool,
}

/// In-process blob store.
///
/// Clones share the same contents, so a clone handed to a fresh
/// [`CacheLevel`](crate::CacheLevel) sees what a previous level wrote.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `read` calls served so far.
    pub fn read_count(&self) -> u64 {
        self.inner.reads.load(Ordering::Relaxed)
    }

    /// Number of successful `write` calls so far.
    pub fn write_count(&self) -> u64 {
        self.inner.writes.load(Ordering::Relaxed)
    }

    /// Makes every subsequent `write` fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Number of blobs stored.
    pub fn len(&self) -> usize {
        self.inner.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackingStore for MemoryStore {
    fn write(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        if self.inner.fail_writes.load(Ordering::Relaxed) {
            return Err(io::Error::new(io::ErrorKind::Other, "store is read-only"));
        }
        self.inner.blobs.lock().insert(key.to_string(), bytes.to_vec());
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.inner.blobs.lock().get(key).cloned())
    }

    fn delete(&self, key: &str) -> io::Result<()> {
        self.inner.blobs.lock().remove(key);
        Ok(())
    }

    fn list_keys(&self) -> io::Result<Vec<String>> {
        let mut keys: Vec<String> = self.inner.blobs.lock().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_key_encoding_is_reversible() {
        for key in ["thumbnail:42", "image:7", "a/b\\c d", "", "ünïcode"] {
            assert_eq!(decode_key(&encode_key(key)).as_deref(), Some(key));
        }
        assert_eq!(decode_key("abc"), None);
        assert_eq!(decode_key("zz"), None);
    }

    #[test]
    fn test_fs_store_write_read_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsStore::new(temp_dir.path()).unwrap();

        store.write("thumbnail:1", b"hello").unwrap();
        assert_eq!(store.read("thumbnail:1").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.read("thumbnail:2").unwrap(), None);

        store.write("thumbnail:1", b"replaced").unwrap();
        assert_eq!(store.read("thumbnail:1").unwrap(), Some(b"replaced".to_vec()));

        store.delete("thumbnail:1").unwrap();
        assert_eq!(store.read("thumbnail:1").unwrap(), None);
        // Deleting again is fine
        store.delete("thumbnail:1").unwrap();
    }

    #[test]
    fn test_fs_store_list_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsStore::new(temp_dir.path()).unwrap();

        store.write("b", b"2").unwrap();
        store.write("a", b"1").unwrap();
        // Stray files are ignored
        fs::write(temp_dir.path().join("notes.txt"), b"x").unwrap();

        assert_eq!(store.list_keys().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_fs_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        FsStore::new(temp_dir.path()).unwrap().write("k", b"v").unwrap();

        let reopened = FsStore::new(temp_dir.path()).unwrap();
        assert_eq!(reopened.read("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_fs_store_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("a").join("b");
        let store = FsStore::new(&nested).unwrap();
        assert!(store.dir().is_dir());
    }

    #[test]
    fn test_memory_store_shared_between_clones() {
        let store = MemoryStore::new();
        let clone = store.clone();

        store.write("k", b"v").unwrap();
        assert_eq!(clone.read("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.read_count(), 1);
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn test_memory_store_failing_writes() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.write("k", b"v").is_err());
        assert!(store.is_empty());

        store.set_fail_writes(false);
        store.write("k", b"v").unwrap();
        assert_eq!(store.len(), 1);
    }
}
