/*!
The format manager's blob cache: a small
freshness-tracked store the manager consults before going to the
[`crate::BlobStore`] for `kopia.repository`/`kopia.blobcfg`. Staleness
is judged purely by the cache's own recorded mtime, never by asking
the backing store.
*/
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobCacheError {
    #[error("blob cache I/O error")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, BlobCacheError>;

/// `(bytes, mtime, hit)` — `hit` is `false` when the entry was
/// absent, in which case `bytes` is empty and `mtime` is the call
/// time, never meant to be interpreted as real freshness.
pub struct CacheEntry {
    pub bytes: Vec<u8>,
    pub mtime: DateTime<Utc>,
    pub hit: bool,
}

pub trait BlobCache: Send + Sync {
    fn get(&self, id: &str) -> Result<CacheEntry>;
    fn put(&self, id: &str, bytes: &[u8]) -> Result<DateTime<Utc>>;
    fn remove(&self, ids: &[&str]);
}

/// No caching at all: every read misses, forcing a round trip to the
/// backing blob store.
#[derive(Default)]
pub struct NullBlobCache;

impl BlobCache for NullBlobCache {
    fn get(&self, _id: &str) -> Result<CacheEntry> {
        Ok(CacheEntry {
            bytes: Vec::new(),
            mtime: Utc::now(),
            hit: false,
        })
    }

    fn put(&self, _id: &str, _bytes: &[u8]) -> Result<DateTime<Utc>> {
        Ok(Utc::now())
    }

    fn remove(&self, _ids: &[&str]) {}
}

/// An in-process cache keyed by blob ID, with insertion time as the
/// freshness marker. Cloning shares the same backing map.
#[derive(Clone, Default)]
pub struct MemoryBlobCache {
    entries: Arc<Mutex<HashMap<String, (Vec<u8>, DateTime<Utc>)>>>,
}

impl MemoryBlobCache {
    pub fn new() -> MemoryBlobCache {
        MemoryBlobCache::default()
    }
}

impl BlobCache for MemoryBlobCache {
    fn get(&self, id: &str) -> Result<CacheEntry> {
        let entries = self.entries.lock().expect("cache mutex poisoned");
        match entries.get(id) {
            Some((bytes, mtime)) => Ok(CacheEntry {
                bytes: bytes.clone(),
                mtime: *mtime,
                hit: true,
            }),
            None => Ok(CacheEntry {
                bytes: Vec::new(),
                mtime: Utc::now(),
                hit: false,
            }),
        }
    }

    fn put(&self, id: &str, bytes: &[u8]) -> Result<DateTime<Utc>> {
        let mtime = Utc::now();
        self.entries
            .lock()
            .expect("cache mutex poisoned")
            .insert(id.to_string(), (bytes.to_vec(), mtime));
        Ok(mtime)
    }

    fn remove(&self, ids: &[&str]) {
        let mut entries = self.entries.lock().expect("cache mutex poisoned");
        for id in ids {
            entries.remove(*id);
        }
    }
}

/// A cache directory on the local filesystem; freshness is the file's
/// own mtime. A marker file records when the cache directory itself
/// was created, for operators diagnosing a stale cache.
#[derive(Clone)]
pub struct DiskBlobCache {
    dir: PathBuf,
}

impl DiskBlobCache {
    pub fn open(dir: impl Into<PathBuf>) -> Result<DiskBlobCache> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let marker = dir.join(".vault-cache");
        if !marker.exists() {
            fs::File::create(&marker)?.write_all(Utc::now().to_rfc3339().as_bytes())?;
        }
        Ok(DiskBlobCache { dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }
}

impl BlobCache for DiskBlobCache {
    fn get(&self, id: &str) -> Result<CacheEntry> {
        let path = self.path_for(id);
        match fs::read(&path) {
            Ok(bytes) => {
                let mtime = fs::metadata(&path)?.modified()?;
                let secs = mtime
                    .duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs() as i64;
                let mtime = chrono::Utc
                    .timestamp_opt(secs, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                Ok(CacheEntry { bytes, mtime, hit: true })
            }
            Err(_) => Ok(CacheEntry {
                bytes: Vec::new(),
                mtime: Utc::now(),
                hit: false,
            }),
        }
    }

    fn put(&self, id: &str, bytes: &[u8]) -> Result<DateTime<Utc>> {
        fs::write(self.path_for(id), bytes)?;
        let mtime = fs::metadata(self.path_for(id))?.modified()?;
        let secs = mtime
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        Ok(chrono::Utc
            .timestamp_opt(secs, 0)
            .single()
            .unwrap_or_else(Utc::now))
    }

    fn remove(&self, ids: &[&str]) {
        for id in ids {
            let _ = fs::remove_file(self.path_for(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_cache_always_misses() {
        let cache = NullBlobCache;
        cache.put("id", b"data").unwrap();
        assert!(!cache.get("id").unwrap().hit);
    }

    #[test]
    fn memory_cache_hits_after_put() {
        let cache = MemoryBlobCache::new();
        cache.put("id", b"data").unwrap();
        let entry = cache.get("id").unwrap();
        assert!(entry.hit);
        assert_eq!(entry.bytes, b"data");
    }

    #[test]
    fn memory_cache_remove_clears_entries() {
        let cache = MemoryBlobCache::new();
        cache.put("id", b"data").unwrap();
        cache.remove(&["id"]);
        assert!(!cache.get("id").unwrap().hit);
    }

    #[test]
    fn disk_cache_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let a = DiskBlobCache::open(dir.path()).unwrap();
        a.put("id", b"data").unwrap();
        let b = DiskBlobCache::open(dir.path()).unwrap();
        let entry = b.get("id").unwrap();
        assert!(entry.hit);
        assert_eq!(entry.bytes, b"data");
    }
}
