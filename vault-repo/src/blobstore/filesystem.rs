//! A local-directory blob store. Writes land via a temp file plus
//! rename so a reader never observes a partial blob, matching the
//! atomic-put contract every `BlobStore` must satisfy.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};

use vault_core::RetentionMode;

use super::{BlobMetadata, BlobStore, BlobStoreError, PutOptions, Result};

#[derive(Clone)]
pub struct FilesystemBlobStore {
    root: PathBuf,
    temp_counter: Arc<AtomicU64>,
}

impl FilesystemBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<FilesystemBlobStore> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FilesystemBlobStore {
            root,
            temp_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn temp_path(&self) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(".tmp-{}-{}", std::process::id(), n))
    }
}

fn mtime_of(path: &Path) -> std::io::Result<DateTime<Utc>> {
    let metadata = fs::metadata(path)?;
    let modified = metadata.modified()?;
    let secs = modified
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    Ok(Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now))
}

impl BlobStore for FilesystemBlobStore {
    fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(prefix) || name.starts_with(".tmp-") {
                continue;
            }
            let metadata = entry.metadata()?;
            out.push(BlobMetadata {
                id: name.to_string(),
                length: metadata.len(),
                timestamp: mtime_of(&entry.path())?,
            });
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn get_blob(&self, id: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        let path = self.path_for(id);
        let mut file = fs::File::open(&path)
            .map_err(|_| BlobStoreError::NotFound(id.to_string()))?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        let start = (offset as usize).min(data.len());
        let end = match length {
            Some(len) => (start + len as usize).min(data.len()),
            None => data.len(),
        };
        Ok(data[start..end].to_vec())
    }

    fn get_metadata(&self, id: &str) -> Result<BlobMetadata> {
        let path = self.path_for(id);
        let metadata = fs::metadata(&path).map_err(|_| BlobStoreError::NotFound(id.to_string()))?;
        Ok(BlobMetadata {
            id: id.to_string(),
            length: metadata.len(),
            timestamp: mtime_of(&path)?,
        })
    }

    fn put_blob(&self, id: &str, data: &[u8], _options: PutOptions) -> Result<()> {
        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.path_for(id))?;
        Ok(())
    }

    fn delete_blob(&self, id: &str) -> Result<()> {
        fs::remove_file(self.path_for(id)).map_err(|_| BlobStoreError::NotFound(id.to_string()))
    }

    fn get_retention(&self, _id: &str) -> Result<(RetentionMode, Option<DateTime<Utc>>)> {
        // The local filesystem has no object-lock primitive to query.
        Ok((RetentionMode::Unset, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::open(dir.path()).unwrap();
        store.put_blob("p0123", b"hello", PutOptions::default()).unwrap();
        assert_eq!(store.get_blob("p0123", 0, None).unwrap(), b"hello");
    }

    #[test]
    fn missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::open(dir.path()).unwrap();
        assert!(matches!(
            store.get_blob("missing", 0, None).unwrap_err(),
            BlobStoreError::NotFound(_)
        ));
    }

    #[test]
    fn put_does_not_leave_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::open(dir.path()).unwrap();
        store.put_blob("p0123", b"hello", PutOptions::default()).unwrap();
        let listed = store.list_blobs("").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "p0123");
    }

    #[test]
    fn delete_then_get_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::open(dir.path()).unwrap();
        store.put_blob("p0123", b"hello", PutOptions::default()).unwrap();
        store.delete_blob("p0123").unwrap();
        assert!(matches!(
            store.get_metadata("p0123").unwrap_err(),
            BlobStoreError::NotFound(_)
        ));
    }
}
