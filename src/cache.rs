use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use image::DynamicImage;
use sha2::{Digest, Sha256};

use crate::errors::AppResult;

const DEFAULT_CAPACITY: usize = 1000;

/// Cumulative counters. `clear()` does not reset these.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate_percent: f64,
    pub current_size: usize,
    pub capacity: usize,
}

struct CacheInner {
    entries: HashMap<String, DynamicImage>,
    /// Recency order, least recent at the front.
    order: VecDeque<String>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// In-memory LRU of decoded thumbnails keyed by file path, mtime, and
/// requested size, so a re-exported file never serves a stale preview.
/// An optional disk tier persists thumbnails as PNG across runs.
pub struct ThumbnailCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    disk_dir: Option<PathBuf>,
}

/// Cache key is the truncated digest of path, mtime, and size; editing
/// the file changes the key and the stale entry ages out of the LRU.
fn cache_key(path: &Path, size: u32) -> AppResult<String> {
    let mtime = std::fs::metadata(path)?
        .modified()?
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let digest = Sha256::digest(format!("{}:{}:{}", path.display(), mtime, size).as_bytes());
    Ok(hex::encode(digest)[..16].to_string())
}

impl ThumbnailCache {
    pub fn new(capacity: usize, disk_dir: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            capacity: capacity.max(1),
            disk_dir,
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY, None)
    }

    /// Cache sized per the saved config, with the disk tier in the default
    /// cache directory when enabled.
    pub fn from_config(config: &crate::config::Config) -> AppResult<Self> {
        let disk_dir = if config.thumbnail_disk_cache {
            Some(crate::config::get_thumbnail_cache_directory()?)
        } else {
            None
        };
        Ok(Self::new(config.thumbnail_cache_capacity, disk_dir))
    }

    /// Cached thumbnail for `path` at `size`, or `None`. A memory hit
    /// promotes the entry to most-recently-used; a disk hit promotes it
    /// into memory and still counts as a hit.
    pub fn get(&self, path: &Path, size: u32) -> Option<DynamicImage> {
        let key = cache_key(path, size).ok()?;

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(image) = inner.entries.get(&key).cloned() {
                inner.hits += 1;
                touch(&mut inner.order, &key);
                return Some(image);
            }
        }

        if let Some(image) = self.load_from_disk(&key) {
            self.insert(&key, image.clone());
            self.inner.lock().unwrap().hits += 1;
            return Some(image);
        }

        self.inner.lock().unwrap().misses += 1;
        None
    }

    /// Store a thumbnail keyed by the file's current mtime. An earlier
    /// entry for a since-modified file becomes unreachable and ages out.
    pub fn put(&self, path: &Path, size: u32, image: DynamicImage) -> AppResult<()> {
        let key = cache_key(path, size)?;
        self.write_to_disk(&key, &image);
        self.insert(&key, image);
        Ok(())
    }

    /// Convenience wrapper: serve from cache or decode and resize the
    /// source file, caching the result.
    pub fn get_or_create(&self, path: &Path, size: u32) -> AppResult<DynamicImage> {
        if let Some(image) = self.get(path, size) {
            return Ok(image);
        }
        let image = image::open(path)?.thumbnail(size, size);
        self.put(path, size, image.clone())?;
        Ok(image)
    }

    fn insert(&self, key: &str, image: DynamicImage) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.insert(key.to_string(), image).is_none() {
            inner.order.push_back(key.to_string());
        } else {
            touch(&mut inner.order, key);
        }

        while inner.entries.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
            } else {
                break;
            }
        }
    }

    fn disk_path(&self, key: &str) -> Option<PathBuf> {
        self.disk_dir.as_ref().map(|dir| dir.join(format!("{}.thumb.png", key)))
    }

    fn load_from_disk(&self, key: &str) -> Option<DynamicImage> {
        let path = self.disk_path(key)?;
        if !path.exists() {
            return None;
        }
        match image::open(&path) {
            Ok(image) => Some(image),
            Err(e) => {
                // Corrupt disk entry counts as a miss and gets removed
                log::warn!("Dropping corrupt cached thumbnail {}: {}", path.display(), e);
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    fn write_to_disk(&self, key: &str, image: &DynamicImage) {
        let Some(path) = self.disk_path(key) else {
            return;
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                log::warn!("Cannot create thumbnail cache dir: {}", e);
                return;
            }
        }
        if let Err(e) = image.save(&path) {
            log::warn!("Failed to persist thumbnail {}: {}", path.display(), e);
        }
    }

    /// Drop all in-memory entries. Counters and the disk tier survive.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Remove every persisted thumbnail. The disk tier is unbounded, so
    /// reclaiming its space is an explicit operation.
    pub fn clear_disk_cache(&self) -> AppResult<usize> {
        let Some(dir) = &self.disk_dir else {
            return Ok(0);
        };
        let mut removed = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let is_thumb = path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(".thumb.png"))
                .unwrap_or(false);
            if is_thumb {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        log::info!("Cleared {} persisted thumbnail(s)", removed);
        Ok(removed)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let total = inner.hits + inner.misses;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate_percent: if total == 0 {
                0.0
            } else {
                inner.hits as f64 * 100.0 / total as f64
            },
            current_size: inner.entries.len(),
            capacity: self.capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn touch(order: &mut VecDeque<String>, key: &str) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        order.remove(pos);
    }
    order.push_back(key.to_string());
}
