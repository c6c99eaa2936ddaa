/*!
The sole storage primitive the rest of the engine depends on. Every
other subsystem — the format manager, the content layer, the uploader
and restorer — only ever talks to a repository through this trait, so
swapping storage backends never touches their logic.

This trait is deliberately synchronous: OS threads, not cooperative
tasks, are the unit of concurrency here, and a blob store with a plain
`&self -> Result<T>` shape is what a thread-per-worker uploader/restorer
wants to call without routing through an executor.
*/
pub mod filesystem;
pub mod memory;

use std::io;

use chrono::{DateTime, Utc};
use thiserror::Error;

use vault_core::RetentionMode;

pub use filesystem::FilesystemBlobStore;
pub use memory::MemoryBlobStore;

#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("blob {0:?} not found")]
    NotFound(String),
    #[error("blob {0:?} already exists")]
    AlreadyExists(String),
    #[error("blob store I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, BlobStoreError>;

#[derive(Clone, Debug, PartialEq)]
pub struct BlobMetadata {
    pub id: String,
    pub length: u64,
    pub timestamp: DateTime<Utc>,
}

/// Retention instructions accompanying a `PutBlob` call, mirroring an
/// S3-compatible object-lock API.
#[derive(Clone, Copy, Debug, Default)]
pub struct PutOptions {
    pub retention_mode: RetentionMode,
    pub retention_period_secs: Option<i64>,
}

/// The abstract storage primitive. Implementations must make
/// `put_blob` atomic: a reader observing a blob sees either all of it
/// (with its final length) or none of it, never a partial write.
pub trait BlobStore: Send + Sync {
    fn list_blobs(&self, prefix: &str) -> Result<Vec<BlobMetadata>>;
    fn get_blob(&self, id: &str, offset: u64, length: Option<u64>) -> Result<Vec<u8>>;
    fn get_metadata(&self, id: &str) -> Result<BlobMetadata>;
    fn put_blob(&self, id: &str, data: &[u8], options: PutOptions) -> Result<()>;
    fn delete_blob(&self, id: &str) -> Result<()>;
    fn get_retention(&self, id: &str) -> Result<(RetentionMode, Option<DateTime<Utc>>)>;
}
