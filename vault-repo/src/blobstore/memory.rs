//! An in-memory blob store: the reference implementation used by
//! tests and as a starting point for new backends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use vault_core::RetentionMode;

use super::{BlobMetadata, BlobStore, BlobStoreError, PutOptions, Result};

struct StoredBlob {
    data: Vec<u8>,
    timestamp: DateTime<Utc>,
    retention_mode: RetentionMode,
    retention_expiry: Option<DateTime<Utc>>,
}

/// Cloning a `MemoryBlobStore` yields a new view over the same
/// backing map, matching the convention that backends are cheaply
/// shareable handles rather than owned storage.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<String, StoredBlob>>>,
}

impl MemoryBlobStore {
    pub fn new() -> MemoryBlobStore {
        MemoryBlobStore::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobMetadata>> {
        let blobs = self.blobs.lock().expect("blob store mutex poisoned");
        let mut out: Vec<BlobMetadata> = blobs
            .iter()
            .filter(|(id, _)| id.starts_with(prefix))
            .map(|(id, blob)| BlobMetadata {
                id: id.clone(),
                length: blob.data.len() as u64,
                timestamp: blob.timestamp,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn get_blob(&self, id: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>> {
        let blobs = self.blobs.lock().expect("blob store mutex poisoned");
        let blob = blobs
            .get(id)
            .ok_or_else(|| BlobStoreError::NotFound(id.to_string()))?;
        let start = offset as usize;
        if start > blob.data.len() {
            return Ok(Vec::new());
        }
        let end = match length {
            Some(len) => (start + len as usize).min(blob.data.len()),
            None => blob.data.len(),
        };
        Ok(blob.data[start..end].to_vec())
    }

    fn get_metadata(&self, id: &str) -> Result<BlobMetadata> {
        let blobs = self.blobs.lock().expect("blob store mutex poisoned");
        let blob = blobs
            .get(id)
            .ok_or_else(|| BlobStoreError::NotFound(id.to_string()))?;
        Ok(BlobMetadata {
            id: id.to_string(),
            length: blob.data.len() as u64,
            timestamp: blob.timestamp,
        })
    }

    fn put_blob(&self, id: &str, data: &[u8], options: PutOptions) -> Result<()> {
        let mut blobs = self.blobs.lock().expect("blob store mutex poisoned");
        let now = Utc::now();
        let retention_expiry = options
            .retention_period_secs
            .map(|secs| now + chrono::Duration::seconds(secs));
        blobs.insert(
            id.to_string(),
            StoredBlob {
                data: data.to_vec(),
                timestamp: now,
                retention_mode: options.retention_mode,
                retention_expiry,
            },
        );
        Ok(())
    }

    fn delete_blob(&self, id: &str) -> Result<()> {
        let mut blobs = self.blobs.lock().expect("blob store mutex poisoned");
        if blobs.remove(id).is_none() {
            return Err(BlobStoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn get_retention(&self, id: &str) -> Result<(RetentionMode, Option<DateTime<Utc>>)> {
        let blobs = self.blobs.lock().expect("blob store mutex poisoned");
        let blob = blobs
            .get(id)
            .ok_or_else(|| BlobStoreError::NotFound(id.to_string()))?;
        Ok((blob.retention_mode, blob.retention_expiry))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let store = MemoryBlobStore::new();
        store.put_blob("p0123", b"hello world", PutOptions::default()).unwrap();
        let bytes = store.get_blob("p0123", 0, None).unwrap();
        assert_eq!(bytes, b"hello world");
    }

    #[test]
    fn get_blob_respects_offset_and_length() {
        let store = MemoryBlobStore::new();
        store.put_blob("p0123", b"hello world", PutOptions::default()).unwrap();
        let bytes = store.get_blob("p0123", 6, Some(5)).unwrap();
        assert_eq!(bytes, b"world");
    }

    #[test]
    fn missing_blob_is_not_found() {
        let store = MemoryBlobStore::new();
        let err = store.get_blob("missing", 0, None).unwrap_err();
        assert!(matches!(err, BlobStoreError::NotFound(_)));
    }

    #[test]
    fn list_blobs_filters_by_prefix_and_sorts() {
        let store = MemoryBlobStore::new();
        store.put_blob("pbbb", b"1", PutOptions::default()).unwrap();
        store.put_blob("paaa", b"2", PutOptions::default()).unwrap();
        store.put_blob("qzzz", b"3", PutOptions::default()).unwrap();
        let listed = store.list_blobs("p").unwrap();
        let ids: Vec<_> = listed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["paaa", "pbbb"]);
    }

    #[test]
    fn delete_removes_the_blob() {
        let store = MemoryBlobStore::new();
        store.put_blob("p0123", b"data", PutOptions::default()).unwrap();
        store.delete_blob("p0123").unwrap();
        assert!(matches!(
            store.get_metadata("p0123").unwrap_err(),
            BlobStoreError::NotFound(_)
        ));
    }
}
