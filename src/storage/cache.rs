use crate::actor::lock;
use crate::core::config::CacheConfig;
use crate::storage::disk::DiskStore;
use crate::storage::resource::{now, ResourceKey, Response, Timestamp};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// A cached response together with its validators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResource {
    pub data: Option<Arc<Vec<u8>>>,
    pub no_content: bool,
    pub etag: Option<String>,
    pub expires: Option<Timestamp>,
    pub modified: Option<Timestamp>,
    pub must_revalidate: bool,
    pub stored_at: Timestamp,
}

impl Default for CachedResource {
    fn default() -> Self {
        Self {
            data: None,
            no_content: false,
            etag: None,
            expires: None,
            modified: None,
            must_revalidate: false,
            stored_at: now(),
        }
    }
}

impl CachedResource {
    /// Cacheable copy of a successful response. Errors and bare `304`s are
    /// not cacheable.
    pub fn from_response(response: &Response, stored_at: Timestamp) -> Option<Self> {
        if response.error.is_some() || (response.data.is_none() && !response.no_content) {
            return None;
        }
        Some(Self {
            data: response.data.clone(),
            no_content: response.no_content,
            etag: response.etag.clone(),
            expires: response.expires,
            modified: response.modified,
            must_revalidate: response.must_revalidate,
            stored_at,
        })
    }

    /// An entry without an expiry never goes stale on its own
    pub fn is_stale(&self, now: Timestamp) -> bool {
        self.expires.map(|expires| expires <= now).unwrap_or(false)
    }

    pub fn to_response(&self) -> Response {
        Response {
            data: self.data.clone(),
            no_content: self.no_content,
            etag: self.etag.clone(),
            expires: self.expires,
            modified: self.modified,
            must_revalidate: self.must_revalidate,
            ..Response::default()
        }
    }

    pub fn size(&self) -> u64 {
        self.data.as_ref().map(|data| data.len() as u64).unwrap_or(0)
    }
}

/// Strips the parts of a URL that do not change the resource: the fragment
/// and any `access_token` query parameter.
pub fn normalize_url(url: &str) -> String {
    let url = url.split('#').next().unwrap_or(url);
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with("access_token="))
        .collect();
    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, kept.join("&"))
    }
}

/// Cache statistics
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub bytes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}

struct MemoryTier {
    entries: LruCache<ResourceKey, Arc<CachedResource>>,
    bytes: u64,
    stats: CacheStats,
}

/// Two-tier resource cache: a byte-budgeted in-memory LRU in front of an
/// optional [`DiskStore`].
///
/// Entries are shared as `Arc`s and replaced wholesale, so a reader holds
/// either the old or the new entry. Disk failures are logged and read as
/// misses.
pub struct ResourceCache {
    memory: Mutex<MemoryTier>,
    max_bytes: u64,
    disk: Option<DiskStore>,
}

impl ResourceCache {
    pub fn new(config: &CacheConfig) -> Self {
        let disk = config.disk_path.as_ref().and_then(|path| {
            match DiskStore::open(path, config.disk_max_bytes) {
                Ok(store) => Some(store),
                Err(err) => {
                    log::warn!(
                        "disk cache at {} unavailable, using memory only: {}",
                        path.display(),
                        err
                    );
                    None
                }
            }
        });
        Self::with_disk(config.max_bytes, disk)
    }

    pub fn memory_only(max_bytes: u64) -> Self {
        Self::with_disk(max_bytes, None)
    }

    pub fn with_disk(max_bytes: u64, disk: Option<DiskStore>) -> Self {
        Self {
            memory: Mutex::new(MemoryTier {
                entries: LruCache::unbounded(),
                bytes: 0,
                stats: CacheStats::default(),
            }),
            max_bytes,
            disk,
        }
    }

    /// Memory tier first, then disk. May block on file I/O.
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<CachedResource>> {
        self.get_memory(key).or_else(|| self.get_disk(key))
    }

    /// Looks up the memory tier only. A miss is counted here when there is
    /// no disk tier to fall back on.
    pub fn get_memory(&self, key: &ResourceKey) -> Option<Arc<CachedResource>> {
        let key = normalized_key(key);
        let mut memory = lock(&self.memory);
        match memory.entries.get(&key).cloned() {
            Some(entry) => {
                memory.stats.hits += 1;
                Some(entry)
            }
            None => {
                if self.disk.is_none() {
                    memory.stats.misses += 1;
                }
                None
            }
        }
    }

    /// Reads the disk tier and promotes a hit into memory. Blocks on file
    /// I/O, so callers on a latency-sensitive thread hand it to a blocking
    /// pool.
    pub fn get_disk(&self, key: &ResourceKey) -> Option<Arc<CachedResource>> {
        let disk = self.disk.as_ref()?;
        let key = normalized_key(key);
        let from_disk = match disk.load(&key) {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("disk cache read failed for {}: {}", key, err);
                None
            }
        };

        match from_disk {
            Some(entry) => {
                let entry = Arc::new(entry);
                let mut memory = lock(&self.memory);
                memory.stats.hits += 1;
                self.insert_memory(&mut memory, key, entry.clone());
                Some(entry)
            }
            None => {
                lock(&self.memory).stats.misses += 1;
                None
            }
        }
    }

    pub fn put(&self, key: &ResourceKey, entry: CachedResource) {
        let key = normalized_key(key);
        if let Some(disk) = &self.disk {
            if let Err(err) = disk.store(&key, &entry) {
                log::warn!("disk cache write failed for {}: {}", key, err);
            }
        }
        let mut memory = lock(&self.memory);
        self.insert_memory(&mut memory, key, Arc::new(entry));
    }

    /// Applies a `304 Not Modified` to the cached entry: the payload stays,
    /// validators and expiry are refreshed. Returns the refreshed entry.
    pub fn refresh(&self, key: &ResourceKey, response: &Response) -> Option<Arc<CachedResource>> {
        let current = self.get(key)?;
        let mut refreshed = (*current).clone();
        if response.etag.is_some() {
            refreshed.etag = response.etag.clone();
        }
        if response.modified.is_some() {
            refreshed.modified = response.modified;
        }
        refreshed.expires = response.expires;
        refreshed.must_revalidate = response.must_revalidate;
        refreshed.stored_at = now();
        self.put(key, refreshed);
        self.peek(key)
    }

    /// Looks up the memory tier without touching LRU order or statistics
    pub fn peek(&self, key: &ResourceKey) -> Option<Arc<CachedResource>> {
        lock(&self.memory).entries.peek(&normalized_key(key)).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        lock(&self.memory).entries.contains(&normalized_key(key))
    }

    pub fn remove(&self, key: &ResourceKey) {
        let key = normalized_key(key);
        {
            let mut memory = lock(&self.memory);
            if let Some(entry) = memory.entries.pop(&key) {
                memory.bytes -= entry.size();
            }
        }
        if let Some(disk) = &self.disk {
            if let Err(err) = disk.remove(&key) {
                log::warn!("disk cache remove failed for {}: {}", key, err);
            }
        }
    }

    pub fn clear(&self) {
        {
            let mut memory = lock(&self.memory);
            memory.entries.clear();
            memory.bytes = 0;
        }
        if let Some(disk) = &self.disk {
            if let Err(err) = disk.clear() {
                log::warn!("disk cache clear failed: {}", err);
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.memory).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        lock(&self.memory).bytes
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn has_disk(&self) -> bool {
        self.disk.is_some()
    }

    pub fn stats(&self) -> CacheStats {
        let memory = lock(&self.memory);
        CacheStats {
            size: memory.entries.len(),
            bytes: memory.bytes,
            ..memory.stats.clone()
        }
    }

    fn insert_memory(&self, memory: &mut MemoryTier, key: ResourceKey, entry: Arc<CachedResource>) {
        let size = entry.size();
        if size > self.max_bytes {
            // Never cache something that would flush everything else
            if let Some(previous) = memory.entries.pop(&key) {
                memory.bytes -= previous.size();
            }
            log::debug!("{} ({} bytes) exceeds the memory cache budget", key, size);
            return;
        }
        if let Some(previous) = memory.entries.put(key, entry) {
            memory.bytes -= previous.size();
        }
        memory.bytes += size;
        while memory.bytes > self.max_bytes {
            match memory.entries.pop_lru() {
                Some((evicted, entry)) => {
                    memory.bytes -= entry.size();
                    memory.stats.evictions += 1;
                    log::debug!("evicted {} from memory cache", evicted);
                }
                None => break,
            }
        }
    }
}

fn normalized_key(key: &ResourceKey) -> ResourceKey {
    ResourceKey {
        kind: key.kind,
        url: normalize_url(&key.url),
    }
}
