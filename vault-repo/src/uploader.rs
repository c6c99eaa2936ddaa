/*!
The uploader (C8): walks an [`FsTree`], turning directories into
nested manifest objects and files into content-addressed objects via
a [`ContentManager`].

A hash-cache (the previous snapshot's per-file metadata hashes) lets a
repeat upload skip re-reading unchanged files entirely: if a file's
`fnv64a(name, mtime-ns, mode, size, uid, gid)` matches the cached
value *and* its mtime is older than `HashCacheCutoff`, the cached
object ID is reused verbatim. The cutoff guards against trusting a
cache entry for a file that might still be mid-write.

Directory discovery is single-threaded (cheap: it is metadata only);
file content is hashed and written by a fixed pool of worker threads
pulling from a shared queue, the parallelism that actually matters
for wall-clock time.
*/
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vault_core::error::{ErrorKind, RepoError};
use vault_core::{DirEntry, ObjectId};

use crate::blobstore::BlobStore;
use crate::content::{ContentError, ContentManager};
use crate::fs_tree::{Entry, EntryKind, FsError, FsTree};

#[derive(Error, Debug)]
pub enum UploaderError {
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("failed to decode the hash cache or a directory listing: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("failed to encode the hash cache or a directory listing: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("{0}")]
    EntryFailed(String),
}

impl From<UploaderError> for RepoError {
    fn from(err: UploaderError) -> RepoError {
        match err {
            UploaderError::Content(e) => RepoError::from(e),
            UploaderError::Fs(e) => RepoError::new(ErrorKind::Transient, e),
            UploaderError::Decode(e) => RepoError::new(ErrorKind::Corruption, e),
            UploaderError::Encode(e) => RepoError::new(ErrorKind::Transient, e),
            UploaderError::EntryFailed(message) => RepoError::new(
                ErrorKind::Transient,
                std::io::Error::new(std::io::ErrorKind::Other, message),
            ),
        }
    }
}

type Result<T> = std::result::Result<T, UploaderError>;

const HASH_CACHE_TAG: u8 = b'h';
const DIRECTORY_TAG: u8 = b'k';

fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

#[derive(Clone, Serialize, Deserialize)]
struct HashCacheEntry {
    metadata_hash: u64,
    object_id: ObjectId,
    last_used_ns: i64,
}

/// A prior snapshot's per-path metadata hashes, consulted so unchanged
/// files never have their content re-read.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct HashCache {
    entries: HashMap<String, HashCacheEntry>,
}

impl HashCache {
    pub fn empty() -> HashCache {
        HashCache::default()
    }

    fn from_bytes(bytes: &[u8]) -> Result<HashCache> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    fn touch(&mut self, path: &str, metadata_hash: u64, object_id: ObjectId, now: i64) {
        self.entries.insert(
            path.to_string(),
            HashCacheEntry {
                metadata_hash,
                object_id,
                last_used_ns: now,
            },
        );
    }

    /// Drops entries whose last use predates `now - retention_secs`,
    /// bounding the cache's growth across many snapshots.
    fn prune(&mut self, now: i64, retention_secs: i64) {
        let cutoff = now.saturating_sub(retention_secs.saturating_mul(1_000_000_000));
        self.entries.retain(|_, e| e.last_used_ns >= cutoff);
    }
}

#[derive(Clone, Debug)]
pub struct UploadOptions {
    /// Worker threads consuming the file-hashing queue.
    pub workers: usize,
    /// A cache hit is only trusted for files whose mtime is older
    /// than `now - hash_cache_min_age_secs` (default 1 hour).
    pub hash_cache_min_age_secs: i64,
    /// Ignores this percentage of otherwise-valid cache hits,
    /// uniformly at random, to periodically force a deep re-hash.
    pub force_hash_percentage: u8,
    /// Per-entry I/O errors are recorded and skipped rather than
    /// aborting the whole upload.
    pub ignore_file_errors: bool,
    /// Stops dispatching new file work once this many bytes have been
    /// read from sources; `None` means unbounded.
    pub max_upload_bytes: Option<u64>,
    /// How long a hash-cache entry survives without being touched
    /// again before the next run prunes it.
    pub hash_cache_retention_secs: i64,
    /// Polled between work items; once set, no new work is
    /// dispatched and the run finishes marked incomplete.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for UploadOptions {
    fn default() -> UploadOptions {
        UploadOptions {
            workers: num_cpus::get().max(1),
            hash_cache_min_age_secs: 3600,
            force_hash_percentage: 0,
            ignore_file_errors: false,
            max_upload_bytes: None,
            hash_cache_retention_secs: 30 * 24 * 3600,
            cancel: None,
        }
    }
}

pub struct UploadResult {
    pub root: DirEntry,
    pub hash_cache: ObjectId,
    /// Set when a per-entry error or cancellation left the snapshot
    /// partial.
    pub incomplete_reason: Option<String>,
    pub bytes_read: u64,
}

enum Node {
    Dir { entry: Entry, children: Vec<Node> },
    File { entry: Entry, index: usize },
    Leaf { entry: Entry },
}

#[derive(Debug)]
enum FileOutcome {
    Written(ObjectId),
    /// Cancellation or the upload byte budget stopped this file before
    /// it was read; never a hard error, just an incomplete snapshot.
    Skipped,
    Failed(String),
}

fn force_hash(pct: u8) -> bool {
    pct > 0 && rand::thread_rng().gen_range(0_u32..100) < u32::from(pct)
}

/// Drives an [`FsTree`] walk into a [`ContentManager`], the
/// hash-cache-aware counterpart of [`crate::restorer::Restorer`].
pub struct Uploader<S: BlobStore, T: FsTree> {
    content: ContentManager<S>,
    tree: Arc<T>,
}

impl<S: BlobStore + Clone + 'static, T: FsTree + 'static> Uploader<S, T> {
    pub fn new(content: ContentManager<S>, tree: T) -> Uploader<S, T> {
        Uploader {
            content,
            tree: Arc::new(tree),
        }
    }

    fn cancelled(&self, options: &UploadOptions) -> bool {
        options
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn build_node(
        &self,
        relative_path: &Path,
        entry: Entry,
        files: &mut Vec<Entry>,
        options: &UploadOptions,
        incomplete: &mut Option<String>,
    ) -> Result<Node> {
        if !entry.is_directory() {
            return Ok(match entry.kind {
                EntryKind::File => {
                    let index = files.len();
                    files.push(entry.clone());
                    Node::File { entry, index }
                }
                _ => Node::Leaf { entry },
            });
        }

        if self.cancelled(options) {
            *incomplete = Some("cancelled".to_string());
            return Ok(Node::Leaf { entry });
        }

        let mut children = match self.tree.read_dir(relative_path) {
            Ok(children) => children,
            Err(e) if options.ignore_file_errors => {
                *incomplete = Some(e.to_string());
                return Ok(Node::Leaf { entry });
            }
            Err(e) => return Err(e.into()),
        };
        children.sort_by(|a, b| a.name.cmp(&b.name));

        let mut nodes = Vec::with_capacity(children.len());
        for child in children {
            if child.is_error() {
                *incomplete = Some(format!("{}: unreadable", child.relative_path.display()));
                nodes.push(Node::Leaf { entry: child });
                continue;
            }
            let child_path = child.relative_path.clone();
            nodes.push(self.build_node(&child_path, child, files, options, incomplete)?);
        }
        Ok(Node::Dir { entry, children: nodes })
    }

    fn process_files(
        &self,
        files: &[Entry],
        hash_cache: &HashCache,
        options: &UploadOptions,
    ) -> (Vec<FileOutcome>, Vec<(String, u64, ObjectId)>, u64, bool) {
        let workers = options.workers.max(1);
        let now = now_ns();
        let cutoff = now.saturating_sub(options.hash_cache_min_age_secs.saturating_mul(1_000_000_000));
        let bytes_read = AtomicU64::new(0);
        let was_cancelled = AtomicBool::new(false);

        let (work_tx, work_rx) = crossbeam_channel::unbounded::<(usize, Entry)>();
        for (i, entry) in files.iter().enumerate() {
            work_tx.send((i, entry.clone())).expect("receiver outlives every sender");
        }
        drop(work_tx);

        let results: Arc<std::sync::Mutex<Vec<Option<FileOutcome>>>> =
            Arc::new(std::sync::Mutex::new((0..files.len()).map(|_| None).collect()));
        let touches: Arc<std::sync::Mutex<Vec<(String, u64, ObjectId)>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let content = self.content.clone();
                let tree = self.tree.clone();
                let results = results.clone();
                let touches = touches.clone();
                let bytes_read = &bytes_read;
                let was_cancelled = &was_cancelled;
                scope.spawn(move || {
                    while let Ok((index, entry)) = work_rx.recv() {
                        if options
                            .cancel
                            .as_ref()
                            .is_some_and(|flag| flag.load(Ordering::Relaxed))
                            || options
                                .max_upload_bytes
                                .is_some_and(|max| bytes_read.load(Ordering::Relaxed) >= max)
                        {
                            was_cancelled.store(true, Ordering::Relaxed);
                            results.lock().expect("results mutex poisoned")[index] =
                                Some(FileOutcome::Skipped);
                            continue;
                        }

                        let path_key = entry.relative_path.to_string_lossy().into_owned();
                        let metadata_hash = entry.to_dir_entry(None).metadata_hash();

                        let cached = if entry.mtime_ns <= cutoff {
                            hash_cache.entries.get(&path_key).filter(|e| {
                                e.metadata_hash == metadata_hash && !force_hash(options.force_hash_percentage)
                            })
                        } else {
                            None
                        };

                        let outcome = if let Some(cached) = cached {
                            touches.lock().expect("touches mutex poisoned").push((
                                path_key,
                                metadata_hash,
                                cached.object_id.clone(),
                            ));
                            FileOutcome::Written(cached.object_id.clone())
                        } else {
                            match tree.open(&entry.relative_path) {
                                Ok(mut reader) => {
                                    let mut writer = content.writer(None);
                                    match std::io::copy(&mut reader, &mut writer) {
                                        Ok(n) => {
                                            bytes_read.fetch_add(n, Ordering::Relaxed);
                                            match writer.finish() {
                                                Ok(object_id) => {
                                                    touches.lock().expect("touches mutex poisoned").push((
                                                        path_key,
                                                        metadata_hash,
                                                        object_id.clone(),
                                                    ));
                                                    FileOutcome::Written(object_id)
                                                }
                                                Err(e) => FileOutcome::Failed(e.to_string()),
                                            }
                                        }
                                        Err(e) => FileOutcome::Failed(e.to_string()),
                                    }
                                }
                                Err(e) => FileOutcome::Failed(e.to_string()),
                            }
                        };
                        results.lock().expect("results mutex poisoned")[index] = Some(outcome);
                    }
                });
            }
        });

        let results = Arc::try_unwrap(results)
            .expect("all worker threads have joined")
            .into_inner()
            .expect("results mutex poisoned")
            .into_iter()
            .map(|o| o.expect("every index was visited exactly once"))
            .collect();
        let touches = Arc::try_unwrap(touches)
            .expect("all worker threads have joined")
            .into_inner()
            .expect("touches mutex poisoned");
        (
            results,
            touches,
            bytes_read.load(Ordering::Relaxed),
            was_cancelled.load(Ordering::Relaxed),
        )
    }

    fn assemble(
        &self,
        node: Node,
        results: &[FileOutcome],
        options: &UploadOptions,
        incomplete: &mut Option<String>,
    ) -> Result<DirEntry> {
        match node {
            Node::Leaf { entry } => Ok(entry.to_dir_entry(None)),
            Node::File { entry, index } => match &results[index] {
                FileOutcome::Written(object_id) => Ok(entry.to_dir_entry(Some(object_id.clone()))),
                FileOutcome::Skipped => {
                    *incomplete = Some("cancelled".to_string());
                    Ok(entry.to_dir_entry(None))
                }
                FileOutcome::Failed(message) => {
                    if !options.ignore_file_errors {
                        return Err(UploaderError::EntryFailed(message.clone()));
                    }
                    *incomplete = Some(message.clone());
                    let mut failed = entry;
                    failed.kind = EntryKind::Error {
                        message: message.clone(),
                    };
                    Ok(failed.to_dir_entry(None))
                }
            },
            Node::Dir { entry, children } => {
                let mut dir_entries = Vec::with_capacity(children.len());
                for child in children {
                    dir_entries.push(self.assemble(child, results, options, incomplete)?);
                }
                dir_entries.sort_by(|a, b| a.name.cmp(&b.name));
                let listing = rmp_serde::to_vec(&dir_entries)?;
                let mut writer = self.content.writer(Some(DIRECTORY_TAG));
                writer.write(&listing)?;
                let object_id = writer.finish()?;
                Ok(entry.to_dir_entry(Some(object_id)))
            }
        }
    }

    /// Walks the whole tree and writes it as a nested object graph,
    /// reusing `previous_hash_cache` entries for files the cache says
    /// have not changed.
    pub fn upload(
        &self,
        previous_hash_cache: Option<&ObjectId>,
        options: &UploadOptions,
    ) -> Result<UploadResult> {
        let mut hash_cache = match previous_hash_cache {
            Some(id) => HashCache::from_bytes(&self.content.read_object(id)?)?,
            None => HashCache::empty(),
        };

        let root_entry = self.tree.root()?;
        let mut files = Vec::new();
        let mut incomplete = None;
        let root_node = self.build_node(Path::new(""), root_entry, &mut files, options, &mut incomplete)?;

        let (results, touches, bytes_read, was_cancelled) =
            self.process_files(&files, &hash_cache, options);
        if was_cancelled {
            incomplete = Some("cancelled".to_string());
        }

        let now = now_ns();
        for (path, metadata_hash, object_id) in touches {
            hash_cache.touch(&path, metadata_hash, object_id, now);
        }
        hash_cache.prune(now, options.hash_cache_retention_secs);

        let root = self.assemble(root_node, &results, options, &mut incomplete)?;
        self.content.seal_open_pack()?;

        let cache_bytes = hash_cache.to_bytes()?;
        let mut cache_writer = self.content.writer(Some(HASH_CACHE_TAG));
        cache_writer.write(&cache_bytes)?;
        let hash_cache_id = cache_writer.finish()?;
        self.content.seal_open_pack()?;

        Ok(UploadResult {
            root,
            hash_cache: hash_cache_id,
            incomplete_reason: incomplete,
            bytes_read,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::MemoryBlobStore;
    use crate::format_manager::Provider;
    use crate::fs_tree::LocalFsTree;
    use std::fs;
    use vault_core::{
        Encryption, HashAlgorithm, HashParameters, KeyDerivationSecret, MutableParameters, ObjectFormat,
        OwnerInfo,
    };

    fn provider() -> Arc<Provider> {
        Arc::new(Provider {
            hash: HashAlgorithm::Blake3,
            hash_params: HashParameters::new(b"hmac-secret".to_vec()),
            encryption: Encryption::Aes256Gcm,
            key_derivation_secret: KeyDerivationSecret::derive(b"master-key-0123456789abcdef"),
            mutable_parameters: MutableParameters::default(),
            object_format: ObjectFormat::default(),
            ecc: None,
        })
    }

    fn uploader(root: &Path) -> Uploader<MemoryBlobStore, LocalFsTree> {
        let content = ContentManager::new(MemoryBlobStore::new(), provider());
        Uploader::new(content, LocalFsTree::new(root))
    }

    #[test]
    fn uploads_a_small_tree() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b.txt"), b"world").unwrap();

        let up = uploader(dir.path());
        let result = up.upload(None, &UploadOptions::default()).unwrap();
        assert!(result.incomplete_reason.is_none());
        assert!(result.root.object_id.is_some());
    }

    #[test]
    fn repeat_upload_over_an_unchanged_tree_reuses_the_same_object_ids() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        // `hash_cache_min_age_secs: 0` makes the freshness cutoff
        // `now`, so a file written moments ago is still eligible for
        // a cache hit; the default 1h guard would otherwise force a
        // re-hash in this fast-running test.
        let mut options = UploadOptions::default();
        options.hash_cache_min_age_secs = 0;

        let up = uploader(dir.path());
        let first = up.upload(None, &options).unwrap();
        let second = up.upload(Some(&first.hash_cache), &options).unwrap();

        assert!(second.incomplete_reason.is_none());
        assert_eq!(second.root.object_id, first.root.object_id);
    }

    #[test]
    fn force_hash_percentage_of_zero_never_forces() {
        assert!(!force_hash(0));
    }

    #[test]
    fn unreadable_entry_is_recorded_not_aborted_when_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("locked")).unwrap();

        let up = uploader(dir.path());
        let mut options = UploadOptions::default();
        options.ignore_file_errors = true;
        // A plain directory read will not actually fail here (no
        // permission manipulation in the test harness), so this just
        // exercises the success path with the flag set.
        let result = up.upload(None, &options).unwrap();
        assert!(result.root.object_id.is_some());
    }

    #[test]
    fn unignored_file_failure_aborts_the_whole_upload() {
        let dir = tempfile::tempdir().unwrap();
        let up = uploader(dir.path());
        let entry = Entry {
            relative_path: PathBuf::from("bad.txt"),
            name: "bad.txt".to_string(),
            kind: EntryKind::File,
            mode: 0o644,
            size: 0,
            mtime_ns: 0,
            birthtime_ns: None,
            owner: OwnerInfo::default(),
            device: (0, 0),
        };
        let node = Node::File { entry, index: 0 };
        let results = vec![FileOutcome::Failed("disk on fire".to_string())];
        let mut incomplete = None;
        let options = UploadOptions::default();
        let err = up
            .assemble(node, &results, &options, &mut incomplete)
            .unwrap_err();
        assert!(matches!(err, UploaderError::EntryFailed(_)));
    }

    #[test]
    fn cancellation_marks_the_snapshot_incomplete() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..8 {
            fs::write(dir.path().join(format!("f{i}.txt")), vec![i as u8; 1 << 20]).unwrap();
        }
        let up = uploader(dir.path());
        let cancel = Arc::new(AtomicBool::new(true));
        let mut options = UploadOptions::default();
        options.cancel = Some(cancel);
        let result = up.upload(None, &options).unwrap();
        assert!(result.incomplete_reason.is_some());
    }
}
