/*!
The restorer (C9): the symmetric counterpart of [`crate::uploader::Uploader`].
Walks a directory-manifest object tree and replays it through a
pluggable [`RestoreOutput`] sink, the way the uploader walks a real
tree and writes it into the content layer.

Three sinks are provided: [`FilesystemOutput`] writes to a real
directory, [`ShallowOutput`] writes `<name>.kopia-entry` placeholder
files instead of content, and [`TarOutput`] serializes the tree to a
tar stream. All three share the same walk in [`Restorer::restore`];
only the destination differs.
*/
use std::collections::HashSet;
use std::fs;
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use vault_core::error::{ErrorKind, RepoError};
use vault_core::{DirEntry, EntryType, ObjectId};

use crate::blobstore::BlobStore;
use crate::content::{ContentError, ContentManager};

#[derive(Error, Debug)]
pub enum RestorerError {
    #[error(transparent)]
    Content(#[from] ContentError),
    #[error("failed to decode a directory listing: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0}")]
    EntryFailed(String),
}

impl From<RestorerError> for RepoError {
    fn from(err: RestorerError) -> RepoError {
        match err {
            RestorerError::Content(e) => RepoError::from(e),
            RestorerError::Decode(e) => RepoError::new(ErrorKind::Corruption, e),
            RestorerError::Io(e) => RepoError::new(ErrorKind::Transient, e),
            RestorerError::EntryFailed(message) => RepoError::new(
                ErrorKind::Transient,
                io::Error::new(io::ErrorKind::Other, message),
            ),
        }
    }
}

type Result<T> = std::result::Result<T, RestorerError>;

/// How deep the restorer recurses into the object tree before
/// switching to metadata-only placeholders, and how large a file has
/// to be before the same switch applies at any depth.
#[derive(Clone, Default)]
pub struct RestoreOptions {
    pub incremental: bool,
    pub delete_extra: bool,
    pub ignore_errors: bool,
    /// Directories at or past this depth are written as placeholders
    /// rather than expanded; `None` means always expand fully.
    pub restore_dir_entry_at_depth: Option<usize>,
    /// Files at or above this size are written as placeholders
    /// regardless of depth; `None` disables the size check.
    pub min_size_for_placeholder: Option<u64>,
    pub progress: Option<Arc<dyn Fn(u64, u64) + Send + Sync>>,
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug)]
pub struct RestoreSummary {
    pub files_written: u64,
    pub files_skipped: u64,
    pub bytes_written: u64,
    pub incomplete_reason: Option<String>,
}

/// The pluggable sink a [`Restorer`] walk writes into.
pub trait RestoreOutput {
    /// Whether this sink can safely receive writes for sibling entries
    /// out of order. All three provided sinks are not, since the
    /// restorer itself is single-threaded; kept for parity with the
    /// uploader's worker-pool shape and a future concurrent sink.
    fn parallelizable(&self) -> bool {
        false
    }

    fn begin_directory(&mut self, relative_path: &Path, entry: &DirEntry) -> io::Result<()>;
    fn finish_directory(&mut self, relative_path: &Path, entry: &DirEntry) -> io::Result<()>;

    /// Writes a metadata-only placeholder instead of expanding `entry`
    /// (a directory or a large file past `MinSizeForPlaceholder`).
    fn write_dir_entry(&mut self, relative_path: &Path, entry: &DirEntry) -> io::Result<()>;

    fn write_file(&mut self, relative_path: &Path, entry: &DirEntry, data: &[u8]) -> io::Result<()>;

    /// `Some((size, mtime_ns))` of whatever is already at `relative_path`,
    /// for the incremental skip check; `None` if nothing is there yet.
    fn existing_file_metadata(&self, relative_path: &Path) -> Option<(u64, i64)>;

    fn symlink_exists(&self, relative_path: &Path) -> bool;
    fn create_symlink(&mut self, relative_path: &Path, target: &str) -> io::Result<()>;

    /// Removes anything at `relative_path` not named in `keep`. A
    /// no-op unless the sink is a real filesystem and `DeleteExtra`
    /// was requested.
    fn prune_directory(&mut self, _relative_path: &Path, _keep: &HashSet<String>) -> io::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Two seconds: the incremental-skip mtime tolerance. Clock
/// granularity on some filesystems is coarser than a nanosecond, so
/// exact equality is too strict.
const INCREMENTAL_MTIME_TOLERANCE_NS: i64 = 2_000_000_000;

/// Walks a manifest object tree against a [`ContentManager`], the
/// read-path counterpart of [`crate::uploader::Uploader`].
pub struct Restorer<S: BlobStore> {
    content: ContentManager<S>,
}

impl<S: BlobStore + Clone + 'static> Restorer<S> {
    pub fn new(content: ContentManager<S>) -> Restorer<S> {
        Restorer { content }
    }

    fn cancelled(&self, options: &RestoreOptions) -> bool {
        options
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn decode_listing(&self, object_id: &ObjectId) -> Result<Vec<DirEntry>> {
        let bytes = self.content.read_object(object_id)?;
        Ok(rmp_serde::from_slice(&bytes)?)
    }

    fn should_placeholder(&self, entry: &DirEntry, depth: usize, options: &RestoreOptions) -> bool {
        if let Some(limit) = options.restore_dir_entry_at_depth {
            if depth >= limit {
                return true;
            }
        }
        if let Some(min_size) = options.min_size_for_placeholder {
            if entry.entry_type == EntryType::File && entry.size >= min_size {
                return true;
            }
        }
        false
    }

    fn restore_file(
        &self,
        relative_path: &Path,
        entry: &DirEntry,
        output: &mut dyn RestoreOutput,
        options: &RestoreOptions,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        if options.incremental {
            if let Some((size, mtime_ns)) = output.existing_file_metadata(relative_path) {
                if size == entry.size && (mtime_ns - entry.mtime_ns).abs() <= INCREMENTAL_MTIME_TOLERANCE_NS
                {
                    summary.files_skipped += 1;
                    return Ok(());
                }
            }
        }

        let object_id = match &entry.object_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let data = self.content.read_object(object_id)?;
        output.write_file(relative_path, entry, &data)?;
        summary.files_written += 1;
        summary.bytes_written += data.len() as u64;
        if let Some(progress) = &options.progress {
            progress(summary.bytes_written, data.len() as u64);
        }
        Ok(())
    }

    fn restore_entry(
        &self,
        relative_path: &Path,
        entry: &DirEntry,
        depth: usize,
        output: &mut dyn RestoreOutput,
        options: &RestoreOptions,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        if self.cancelled(options) {
            summary.incomplete_reason = Some("cancelled".to_string());
            return Ok(());
        }

        let outcome = match &entry.entry_type {
            EntryType::Directory if self.should_placeholder(entry, depth, options) => {
                output.write_dir_entry(relative_path, entry).map_err(RestorerError::from)
            }
            EntryType::Directory => self.restore_directory(relative_path, entry, depth, output, options, summary),
            EntryType::File if self.should_placeholder(entry, depth, options) => {
                output.write_dir_entry(relative_path, entry).map_err(RestorerError::from)
            }
            EntryType::File => self.restore_file(relative_path, entry, output, options, summary),
            EntryType::Symlink { target } => {
                if !output.symlink_exists(relative_path) {
                    output.create_symlink(relative_path, target).map_err(RestorerError::from)
                } else {
                    Ok(())
                }
            }
            EntryType::Error { message } => Err(RestorerError::EntryFailed(message.clone())),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(e) if options.ignore_errors => {
                summary.incomplete_reason = Some(e.to_string());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn restore_directory(
        &self,
        relative_path: &Path,
        entry: &DirEntry,
        depth: usize,
        output: &mut dyn RestoreOutput,
        options: &RestoreOptions,
        summary: &mut RestoreSummary,
    ) -> Result<()> {
        output.begin_directory(relative_path, entry)?;

        let children = match &entry.object_id {
            Some(id) => self.decode_listing(id)?,
            None => Vec::new(),
        };

        let mut kept = HashSet::with_capacity(children.len());
        for child in &children {
            kept.insert(child.name.clone());
            let child_path = relative_path.join(&child.name);
            self.restore_entry(&child_path, child, depth + 1, output, options, summary)?;
        }

        if options.delete_extra {
            output.prune_directory(relative_path, &kept)?;
        }

        output.finish_directory(relative_path, entry)?;
        Ok(())
    }

    /// Restores `root` (and everything beneath it) into `output`.
    pub fn restore(
        &self,
        root: &DirEntry,
        output: &mut dyn RestoreOutput,
        options: &RestoreOptions,
    ) -> Result<RestoreSummary> {
        let mut summary = RestoreSummary {
            files_written: 0,
            files_skipped: 0,
            bytes_written: 0,
            incomplete_reason: None,
        };
        self.restore_entry(Path::new(""), root, 0, output, options, &mut summary)?;
        output.close()?;
        Ok(summary)
    }
}

/// Writes a restored tree to a real directory on disk.
pub struct FilesystemOutput {
    root: PathBuf,
}

impl FilesystemOutput {
    pub fn new(root: impl Into<PathBuf>) -> FilesystemOutput {
        FilesystemOutput { root: root.into() }
    }

    fn absolute(&self, relative_path: &Path) -> PathBuf {
        self.root.join(relative_path)
    }
}

impl RestoreOutput for FilesystemOutput {
    fn begin_directory(&mut self, relative_path: &Path, _entry: &DirEntry) -> io::Result<()> {
        fs::create_dir_all(self.absolute(relative_path))
    }

    fn finish_directory(&mut self, relative_path: &Path, entry: &DirEntry) -> io::Result<()> {
        let path = self.absolute(relative_path);
        fs::set_permissions(&path, fs::Permissions::from_mode(entry.mode))
    }

    fn write_dir_entry(&mut self, relative_path: &Path, entry: &DirEntry) -> io::Result<()> {
        let path = self.absolute(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let placeholder_path = {
            let mut name = path.into_os_string();
            name.push(".kopia-entry");
            PathBuf::from(name)
        };
        let json = serde_json::to_vec_pretty(entry)?;
        fs::write(placeholder_path, json)
    }

    fn write_file(&mut self, relative_path: &Path, entry: &DirEntry, data: &[u8]) -> io::Result<()> {
        let path = self.absolute(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, data)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(entry.mode))
    }

    fn existing_file_metadata(&self, relative_path: &Path) -> Option<(u64, i64)> {
        let metadata = fs::metadata(self.absolute(relative_path)).ok()?;
        let mtime_ns = metadata.mtime() * 1_000_000_000 + metadata.mtime_nsec();
        Some((metadata.len(), mtime_ns))
    }

    fn symlink_exists(&self, relative_path: &Path) -> bool {
        fs::symlink_metadata(self.absolute(relative_path))
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    fn create_symlink(&mut self, relative_path: &Path, target: &str) -> io::Result<()> {
        let path = self.absolute(relative_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(target, path)
    }

    fn prune_directory(&mut self, relative_path: &Path, keep: &HashSet<String>) -> io::Result<()> {
        let absolute = self.absolute(relative_path);
        let read_dir = match fs::read_dir(&absolute) {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        for item in read_dir {
            let item = item?;
            let name = item.file_name().to_string_lossy().into_owned();
            if keep.contains(&name) || name.ends_with(".kopia-entry") {
                continue;
            }
            let path = item.path();
            if item.file_type()?.is_dir() {
                fs::remove_dir_all(path)?;
            } else {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// Writes metadata-only `<name>.kopia-entry` placeholders for every
/// entry instead of real content, re-expandable by a later restore.
pub struct ShallowOutput {
    root: PathBuf,
}

impl ShallowOutput {
    pub fn new(root: impl Into<PathBuf>) -> ShallowOutput {
        ShallowOutput { root: root.into() }
    }

    fn placeholder_path(&self, relative_path: &Path) -> PathBuf {
        let mut name = self.root.join(relative_path).into_os_string();
        name.push(".kopia-entry");
        PathBuf::from(name)
    }
}

impl RestoreOutput for ShallowOutput {
    fn begin_directory(&mut self, relative_path: &Path, _entry: &DirEntry) -> io::Result<()> {
        fs::create_dir_all(self.root.join(relative_path))
    }

    fn finish_directory(&mut self, _relative_path: &Path, _entry: &DirEntry) -> io::Result<()> {
        Ok(())
    }

    fn write_dir_entry(&mut self, relative_path: &Path, entry: &DirEntry) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(entry)?;
        fs::write(self.placeholder_path(relative_path), json)
    }

    fn write_file(&mut self, relative_path: &Path, entry: &DirEntry, _data: &[u8]) -> io::Result<()> {
        self.write_dir_entry(relative_path, entry)
    }

    fn existing_file_metadata(&self, _relative_path: &Path) -> Option<(u64, i64)> {
        None
    }

    fn symlink_exists(&self, _relative_path: &Path) -> bool {
        false
    }

    fn create_symlink(&mut self, relative_path: &Path, target: &str) -> io::Result<()> {
        let entry_json = serde_json::json!({ "symlinkTarget": target });
        let json = serde_json::to_vec_pretty(&entry_json)?;
        fs::write(self.placeholder_path(relative_path), json)
    }
}

/// Serializes a restored tree to a tar archive. Sequential by
/// construction: `tar::Builder` owns the one writer the whole walk
/// shares.
pub struct TarOutput<W: io::Write> {
    builder: tar::Builder<W>,
}

impl<W: io::Write> TarOutput<W> {
    pub fn new(writer: W) -> TarOutput<W> {
        TarOutput {
            builder: tar::Builder::new(writer),
        }
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.builder.into_inner()
    }

    fn header_for(&self, entry: &DirEntry, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_size(size);
        header.set_mode(entry.mode);
        header.set_mtime((entry.mtime_ns / 1_000_000_000).max(0) as u64);
        header.set_uid(u64::from(entry.owner.uid));
        header.set_gid(u64::from(entry.owner.gid));
        header
    }
}

impl<W: io::Write> RestoreOutput for TarOutput<W> {
    fn begin_directory(&mut self, relative_path: &Path, entry: &DirEntry) -> io::Result<()> {
        if relative_path.as_os_str().is_empty() {
            return Ok(());
        }
        let mut header = self.header_for(entry, 0);
        header.set_entry_type(tar::EntryType::Directory);
        header.set_cksum();
        let mut path = relative_path.to_path_buf().into_os_string();
        path.push("/");
        self.builder.append_data(&mut header, PathBuf::from(path), io::empty())
    }

    fn finish_directory(&mut self, _relative_path: &Path, _entry: &DirEntry) -> io::Result<()> {
        Ok(())
    }

    fn write_dir_entry(&mut self, relative_path: &Path, entry: &DirEntry) -> io::Result<()> {
        self.write_file(relative_path, entry, &[])
    }

    fn write_file(&mut self, relative_path: &Path, entry: &DirEntry, data: &[u8]) -> io::Result<()> {
        let mut header = self.header_for(entry, data.len() as u64);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        self.builder.append_data(&mut header, relative_path, data)
    }

    fn existing_file_metadata(&self, _relative_path: &Path) -> Option<(u64, i64)> {
        None
    }

    fn symlink_exists(&self, _relative_path: &Path) -> bool {
        false
    }

    fn create_symlink(&mut self, relative_path: &Path, target: &str) -> io::Result<()> {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        header.set_cksum();
        self.builder.append_link(&mut header, relative_path, Path::new(target))
    }

    fn close(&mut self) -> io::Result<()> {
        self.builder.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::MemoryBlobStore;
    use crate::content::ContentManager;
    use crate::format_manager::Provider;
    use crate::fs_tree::LocalFsTree;
    use crate::uploader::{UploadOptions, Uploader};
    use vault_core::{
        Encryption, HashAlgorithm, HashParameters, KeyDerivationSecret, MutableParameters, ObjectFormat,
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

    fn upload_tree(root: &Path) -> (ContentManager<MemoryBlobStore>, DirEntry) {
        let content = ContentManager::new(MemoryBlobStore::new(), provider());
        let uploader = Uploader::new(content.clone(), LocalFsTree::new(root));
        let result = uploader.upload(None, &UploadOptions::default()).unwrap();
        (content, result.root)
    }

    #[test]
    fn restores_a_small_tree_to_the_filesystem() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub").join("b.txt"), b"world").unwrap();
        let (content, root) = upload_tree(src.path());

        let dst = tempfile::tempdir().unwrap();
        let restorer = Restorer::new(content);
        let mut output = FilesystemOutput::new(dst.path());
        let summary = restorer.restore(&root, &mut output, &RestoreOptions::default()).unwrap();

        assert_eq!(summary.files_written, 2);
        assert_eq!(fs::read(dst.path().join("a.txt")).unwrap(), b"hello");
        assert_eq!(fs::read(dst.path().join("sub").join("b.txt")).unwrap(), b"world");
    }

    /// A full round trip (upload a tree, restore it elsewhere, diff
    /// the two trees) is a stronger check than asserting individual
    /// file contents one at a time: it also catches a missing file, an
    /// extra one, or a directory nested at the wrong depth.
    #[test]
    fn upload_then_restore_reproduces_the_source_tree() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(src.path().join("sub")).unwrap();
        fs::write(src.path().join("sub").join("b.txt"), b"world").unwrap();
        fs::create_dir(src.path().join("sub").join("nested")).unwrap();
        fs::write(src.path().join("sub").join("nested").join("c.txt"), b"!").unwrap();
        let (content, root) = upload_tree(src.path());

        let dst = tempfile::tempdir().unwrap();
        let restorer = Restorer::new(content);
        let mut output = FilesystemOutput::new(dst.path());
        restorer.restore(&root, &mut output, &RestoreOptions::default()).unwrap();

        assert!(!dir_diff::is_different(src.path(), dst.path()).unwrap());
    }

    #[test]
    fn incremental_restore_skips_unchanged_files() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let (content, root) = upload_tree(src.path());

        let dst = tempfile::tempdir().unwrap();
        let restorer = Restorer::new(content);
        let mut output = FilesystemOutput::new(dst.path());
        let first = restorer.restore(&root, &mut output, &RestoreOptions::default()).unwrap();
        assert_eq!(first.files_written, 1);

        let options = RestoreOptions {
            incremental: true,
            ..RestoreOptions::default()
        };
        let second = restorer.restore(&root, &mut output, &options).unwrap();
        assert_eq!(second.files_written, 0);
        assert_eq!(second.files_skipped, 1);
    }

    #[test]
    fn delete_extra_removes_files_not_in_the_snapshot() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let (content, root) = upload_tree(src.path());

        let dst = tempfile::tempdir().unwrap();
        fs::write(dst.path().join("stale.txt"), b"old").unwrap();

        let restorer = Restorer::new(content);
        let mut output = FilesystemOutput::new(dst.path());
        let options = RestoreOptions {
            delete_extra: true,
            ..RestoreOptions::default()
        };
        restorer.restore(&root, &mut output, &options).unwrap();

        assert!(!dst.path().join("stale.txt").exists());
        assert!(dst.path().join("a.txt").exists());
    }

    #[test]
    fn shallow_output_writes_placeholders_instead_of_content() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let (content, root) = upload_tree(src.path());

        let dst = tempfile::tempdir().unwrap();
        let restorer = Restorer::new(content);
        let mut output = ShallowOutput::new(dst.path());
        restorer.restore(&root, &mut output, &RestoreOptions::default()).unwrap();

        assert!(dst.path().join("a.txt.kopia-entry").exists());
        assert!(!dst.path().join("a.txt").exists());
    }

    #[test]
    fn tar_output_contains_every_file() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let (content, root) = upload_tree(src.path());

        let restorer = Restorer::new(content);
        let mut output = TarOutput::new(Vec::new());
        restorer.restore(&root, &mut output, &RestoreOptions::default()).unwrap();
        let bytes = output.into_inner().unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("a.txt")));
    }

    #[test]
    fn entry_error_aborts_unless_ignored() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("a.txt"), b"hello").unwrap();
        let (content, mut root) = upload_tree(src.path());
        let children = {
            let bytes = content.read_object(root.object_id.as_ref().unwrap()).unwrap();
            let mut entries: Vec<DirEntry> = rmp_serde::from_slice(&bytes).unwrap();
            entries[0].entry_type = EntryType::Error {
                message: "read failed".to_string(),
            };
            entries
        };
        let listing = rmp_serde::to_vec(&children).unwrap();
        let mut writer = content.writer(Some(b'k'));
        writer.write(&listing).unwrap();
        root.object_id = Some(writer.finish().unwrap());

        let dst = tempfile::tempdir().unwrap();
        let restorer = Restorer::new(content);

        let mut output = FilesystemOutput::new(dst.path());
        let err = restorer.restore(&root, &mut output, &RestoreOptions::default()).unwrap_err();
        assert!(matches!(err, RestorerError::EntryFailed(_)));

        let options = RestoreOptions {
            ignore_errors: true,
            ..RestoreOptions::default()
        };
        let summary = restorer.restore(&root, &mut output, &options).unwrap();
        assert!(summary.incomplete_reason.is_some());
    }
}
