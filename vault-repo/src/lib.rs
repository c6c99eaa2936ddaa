//! vault-repo implements the storage-facing half of a vault
//! repository: the abstract blob store and its caches, the format
//! manager that owns `kopia.repository`/`kopia.blobcfg`, the
//! content/object layer that turns chunk streams into deduplicated
//! pack blobs, and the uploader/restorer pair that walk filesystem
//! trees against that content layer.
//!
//! `vault-core` supplies the algorithm-agnostic building blocks
//! (hashing, encryption, ECC, the format descriptor types); this
//! crate is where those building blocks meet actual I/O.
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod blobcache;
pub mod blobstore;
pub mod content;
pub mod format_manager;
pub mod fs_tree;
pub mod restorer;
pub mod uploader;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use blobcache::BlobCache;
pub use blobstore::{BlobMetadata, BlobStore, BlobStoreError, PutOptions};
pub use content::{ContentError, ContentManager, ObjectWriter};
pub use format_manager::{FormatManager, FormatManagerError};
pub use fs_tree::{Entry, FsError, FsTree};
pub use restorer::{
    FilesystemOutput, RestoreOptions, RestoreOutput, RestoreSummary, Restorer, RestorerError,
    ShallowOutput, TarOutput,
};
pub use uploader::{UploadOptions, UploadResult, Uploader};
