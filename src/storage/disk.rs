//! Persistent cache tier: one bincode file per resource

use crate::actor::lock;
use crate::storage::cache::{normalize_url, CachedResource};
use crate::storage::resource::ResourceKey;
use crate::{MapError, Result};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const FILE_EXTENSION: &str = "bin";
const TEMP_EXTENSION: &str = "tmp";

#[derive(Serialize, Deserialize)]
struct DiskRecord {
    key: ResourceKey,
    entry: CachedResource,
}

struct DiskIndex {
    files: LruCache<String, u64>,
    bytes: u64,
}

/// Directory of cached resources with its own LRU byte budget
pub struct DiskStore {
    root: PathBuf,
    max_bytes: u64,
    index: Mutex<DiskIndex>,
}

impl DiskStore {
    /// Opens (creating if needed) a store rooted at `root`, indexing any
    /// files a previous run left behind oldest first.
    pub fn open(root: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut found = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let path = entry.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(FILE_EXTENSION) => {
                    let metadata = entry.metadata()?;
                    let modified = metadata.modified().ok();
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        found.push((modified, name.to_string(), metadata.len()));
                    }
                }
                Some(TEMP_EXTENSION) => {
                    // Leftover from an interrupted write
                    let _ = fs::remove_file(&path);
                }
                _ => {}
            }
        }
        found.sort();

        let mut index = DiskIndex {
            files: LruCache::unbounded(),
            bytes: 0,
        };
        for (_, name, size) in found {
            index.bytes += size;
            index.files.put(name, size);
        }
        log::info!(
            "opened disk cache at {} ({} files, {} bytes)",
            root.display(),
            index.files.len(),
            index.bytes
        );

        let store = Self {
            root,
            max_bytes,
            index: Mutex::new(index),
        };
        store.evict_over_budget();
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stable file name for a key: hash of the kind and normalized URL
    pub fn file_name(key: &ResourceKey) -> String {
        let hash = fxhash::hash64(&(key.kind, normalize_url(&key.url)));
        format!("{:016x}.{}", hash, FILE_EXTENSION)
    }

    pub fn load(&self, key: &ResourceKey) -> Result<Option<CachedResource>> {
        let name = Self::file_name(key);
        if lock(&self.index).files.get(&name).is_none() {
            return Ok(None);
        }
        let bytes = match fs::read(self.root.join(&name)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.forget(&name);
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let record: DiskRecord = bincode::deserialize(&bytes)?;
        if record.key.kind != key.kind || normalize_url(&record.key.url) != normalize_url(&key.url)
        {
            // Hash collision with another resource
            return Ok(None);
        }
        Ok(Some(record.entry))
    }

    pub fn store(&self, key: &ResourceKey, entry: &CachedResource) -> Result<()> {
        let record = DiskRecord {
            key: key.clone(),
            entry: entry.clone(),
        };
        let bytes = bincode::serialize(&record)?;
        let size = bytes.len() as u64;
        let name = Self::file_name(key);
        if size > self.max_bytes {
            self.remove(key)?;
            return Err(MapError::Cache(format!(
                "{} bytes exceed the disk budget",
                size
            )));
        }

        let temp = self
            .root
            .join(format!("{}.{:x}.{}", name, fastrand::u64(..), TEMP_EXTENSION));
        fs::write(&temp, &bytes)?;
        if let Err(err) = fs::rename(&temp, self.root.join(&name)) {
            let _ = fs::remove_file(&temp);
            return Err(err.into());
        }

        {
            let mut index = lock(&self.index);
            if let Some(previous) = index.files.put(name, size) {
                index.bytes -= previous;
            }
            index.bytes += size;
        }
        self.evict_over_budget();
        Ok(())
    }

    pub fn remove(&self, key: &ResourceKey) -> Result<()> {
        let name = Self::file_name(key);
        self.forget(&name);
        match fs::remove_file(self.root.join(&name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn clear(&self) -> Result<()> {
        let names: Vec<String> = {
            let mut index = lock(&self.index);
            index.bytes = 0;
            let names = index.files.iter().map(|(name, _)| name.clone()).collect();
            index.files.clear();
            names
        };
        for name in names {
            let _ = fs::remove_file(self.root.join(name));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        lock(&self.index).files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        lock(&self.index).bytes
    }

    fn forget(&self, name: &str) {
        let mut index = lock(&self.index);
        if let Some(size) = index.files.pop(name) {
            index.bytes -= size;
        }
    }

    fn evict_over_budget(&self) {
        let evicted: Vec<String> = {
            let mut index = lock(&self.index);
            let mut evicted = Vec::new();
            while index.bytes > self.max_bytes {
                match index.files.pop_lru() {
                    Some((name, size)) => {
                        index.bytes -= size;
                        evicted.push(name);
                    }
                    None => break,
                }
            }
            evicted
        };
        for name in evicted {
            log::debug!("evicting {} from disk cache", name);
            if let Err(err) = fs::remove_file(self.root.join(&name)) {
                if err.kind() != ErrorKind::NotFound {
                    log::warn!("failed to remove cached file {}: {}", name, err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::resource::ResourceKind;
    use std::sync::Arc;

    fn key(url: &str) -> ResourceKey {
        ResourceKey {
            kind: ResourceKind::Tile,
            url: url.to_string(),
        }
    }

    fn entry(bytes: &[u8]) -> CachedResource {
        CachedResource {
            data: Some(Arc::new(bytes.to_vec())),
            etag: Some("\"v1\"".into()),
            ..CachedResource::default()
        }
    }

    #[test]
    fn test_store_and_reload_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path(), 1 << 20).unwrap();
            store.store(&key("https://a/1"), &entry(b"one")).unwrap();
            assert_eq!(store.len(), 1);
        }

        let store = DiskStore::open(dir.path(), 1 << 20).unwrap();
        let loaded = store.load(&key("https://a/1")).unwrap().unwrap();
        assert_eq!(loaded.data.as_deref().map(|d| d.as_slice()), Some(&b"one"[..]));
        assert_eq!(loaded.etag.as_deref(), Some("\"v1\""));
        assert!(store.load(&key("https://a/2")).unwrap().is_none());
    }

    #[test]
    fn test_normalized_urls_share_a_file() {
        assert_eq!(
            DiskStore::file_name(&key("https://a/1?access_token=secret#frag")),
            DiskStore::file_name(&key("https://a/1"))
        );
    }

    #[test]
    fn test_budget_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let record_size = bincode::serialize(&DiskRecord {
            key: key("https://a/0"),
            entry: entry(&[0u8; 100]),
        })
        .unwrap()
        .len() as u64;
        let store = DiskStore::open(dir.path(), record_size * 2 + record_size / 2).unwrap();

        for i in 0..3 {
            store
                .store(&key(&format!("https://a/{}", i)), &entry(&[0u8; 100]))
                .unwrap();
        }
        assert_eq!(store.len(), 2);
        assert!(store.load(&key("https://a/0")).unwrap().is_none());
        assert!(store.load(&key("https://a/2")).unwrap().is_some());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1 << 20).unwrap();
        store.store(&key("https://a/1"), &entry(b"one")).unwrap();
        fs::write(dir.path().join(DiskStore::file_name(&key("https://a/1"))), b"junk").unwrap();
        assert!(store.load(&key("https://a/1")).is_err());
    }
}
