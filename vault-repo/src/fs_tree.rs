/*!
The abstract filesystem tree the uploader walks (C7): a directory
listing source decoupled from `std::fs` so the uploader's worker pool
never has to know whether it is reading real disk or a fixture.

[`Entry`] carries everything a [`vault_core::DirEntry`] needs except
the object ID, which only exists once the uploader has actually
written (or skipped, on a hash-cache hit) the entry's content.
*/
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

use vault_core::{DirEntry, EntryType, ObjectId, OwnerInfo};

#[derive(Error, Debug)]
pub enum FsError {
    #[error("i/o error reading {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("path contained invalid utf-8: {0}")]
    InvalidUtf8(PathBuf),
}

type Result<T> = std::result::Result<T, FsError>;

/// What kind of thing an [`Entry`] names, mirroring
/// [`vault_core::EntryType`] but carrying the raw symlink target
/// rather than whatever the manifest will eventually say.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink { target: String },
    /// The entry could not be stat'd or read; `message` lets the
    /// uploader record it and move on rather than aborting the walk.
    Error { message: String },
}

/// One item discovered while walking a tree.
#[derive(Clone, Debug)]
pub struct Entry {
    pub relative_path: PathBuf,
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub mtime_ns: i64,
    pub birthtime_ns: Option<i64>,
    pub owner: OwnerInfo,
    pub device: (u32, u32),
}

impl Entry {
    pub fn is_directory(&self) -> bool {
        matches!(self.kind, EntryKind::Directory)
    }

    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, EntryKind::Error { .. })
    }

    fn entry_type(&self) -> EntryType {
        match &self.kind {
            EntryKind::File => EntryType::File,
            EntryKind::Directory => EntryType::Directory,
            EntryKind::Symlink { target } => EntryType::Symlink {
                target: target.clone(),
            },
            EntryKind::Error { message } => EntryType::Error {
                message: message.clone(),
            },
        }
    }

    /// Builds the manifest entry the uploader stores for this item.
    /// `object_id` is `None` for directories (whose content is the
    /// parent manifest's listing, addressed separately) and for error
    /// entries.
    pub fn to_dir_entry(&self, object_id: Option<ObjectId>) -> DirEntry {
        DirEntry {
            name: self.name.clone(),
            entry_type: self.entry_type(),
            mode: self.mode,
            size: self.size,
            mtime_ns: self.mtime_ns,
            birthtime_ns: self.birthtime_ns,
            owner: self.owner,
            device: self.device,
            xattrs: Vec::new(),
            object_id,
        }
    }
}

fn error_entry(relative_path: PathBuf, name: String, message: String) -> Entry {
    Entry {
        relative_path,
        name,
        kind: EntryKind::Error { message },
        mode: 0,
        size: 0,
        mtime_ns: 0,
        birthtime_ns: None,
        owner: OwnerInfo::default(),
        device: (0, 0),
    }
}

fn system_time_to_ns(time: Option<SystemTime>) -> i64 {
    match time {
        Some(t) => match t.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => d.as_nanos().min(i64::MAX as u128) as i64,
            Err(e) => -(e.duration().as_nanos().min(i64::MAX as u128) as i64),
        },
        None => 0,
    }
}

#[cfg(unix)]
fn platform_metadata(metadata: &fs::Metadata) -> (u32, OwnerInfo, (u32, u32)) {
    use std::os::unix::fs::MetadataExt;
    let mode = metadata.mode();
    let owner = OwnerInfo {
        uid: metadata.uid(),
        gid: metadata.gid(),
    };
    let rdev = metadata.rdev();
    // Linux's packed major/minor encoding; approximate enough for the
    // device field to round-trip through a manifest on the same host.
    let device = (((rdev >> 8) & 0xfff) as u32, (rdev & 0xff) as u32);
    (mode, owner, device)
}

#[cfg(not(unix))]
fn platform_metadata(metadata: &fs::Metadata) -> (u32, OwnerInfo, (u32, u32)) {
    let mode = if metadata.is_dir() { 0o755 } else { 0o644 };
    (mode, OwnerInfo::default(), (0, 0))
}

/// An abstract filesystem source the uploader walks. The trait exists
/// so tests (and any future archive-replay driver) can supply a tree
/// without touching disk; [`LocalFsTree`] is the only implementation
/// that does.
pub trait FsTree: Send + Sync {
    /// The entry describing the tree's own root directory.
    fn root(&self) -> Result<Entry>;

    /// Lists the immediate children of `relative_path` (empty for the
    /// root). Order is unspecified; the uploader name-sorts each
    /// directory's children itself before writing its manifest.
    fn read_dir(&self, relative_path: &Path) -> Result<Vec<Entry>>;

    /// Opens a file entry for reading its content.
    fn open(&self, relative_path: &Path) -> Result<Box<dyn io::Read + Send>>;
}

/// Walks a real directory on the local filesystem.
#[derive(Clone)]
pub struct LocalFsTree {
    root: PathBuf,
}

impl LocalFsTree {
    pub fn new(root: impl Into<PathBuf>) -> LocalFsTree {
        LocalFsTree { root: root.into() }
    }

    fn absolute(&self, relative_path: &Path) -> PathBuf {
        self.root.join(relative_path)
    }
}

impl FsTree for LocalFsTree {
    fn root(&self) -> Result<Entry> {
        let metadata = fs::metadata(&self.root).map_err(|source| FsError::Io {
            path: self.root.clone(),
            source,
        })?;
        let (mode, owner, device) = platform_metadata(&metadata);
        Ok(Entry {
            relative_path: PathBuf::new(),
            name: String::new(),
            kind: EntryKind::Directory,
            mode,
            size: metadata.len(),
            mtime_ns: system_time_to_ns(metadata.modified().ok()),
            birthtime_ns: metadata.created().ok().map(|t| system_time_to_ns(Some(t))),
            owner,
            device,
        })
    }

    fn read_dir(&self, relative_path: &Path) -> Result<Vec<Entry>> {
        let absolute = self.absolute(relative_path);
        let read_dir = fs::read_dir(&absolute).map_err(|source| FsError::Io {
            path: absolute.clone(),
            source,
        })?;

        let mut entries = Vec::new();
        for item in read_dir {
            let item = item.map_err(|source| FsError::Io {
                path: absolute.clone(),
                source,
            })?;
            let name = match item.file_name().into_string() {
                Ok(name) => name,
                Err(_) => return Err(FsError::InvalidUtf8(item.path())),
            };
            let child_relative = relative_path.join(&name);

            let metadata = match fs::symlink_metadata(item.path()) {
                Ok(m) => m,
                Err(source) => {
                    entries.push(error_entry(child_relative, name, source.to_string()));
                    continue;
                }
            };

            let link_target = if metadata.file_type().is_symlink() {
                match fs::read_link(item.path()) {
                    Ok(target) => Some(target.to_string_lossy().into_owned()),
                    Err(source) => {
                        entries.push(error_entry(child_relative, name, source.to_string()));
                        continue;
                    }
                }
            } else {
                None
            };

            let kind = match &link_target {
                Some(target) => EntryKind::Symlink {
                    target: target.clone(),
                },
                None if metadata.is_dir() => EntryKind::Directory,
                None => EntryKind::File,
            };
            let (mode, owner, device) = platform_metadata(&metadata);
            entries.push(Entry {
                relative_path: child_relative,
                name,
                kind,
                mode,
                size: metadata.len(),
                mtime_ns: system_time_to_ns(metadata.modified().ok()),
                birthtime_ns: metadata.created().ok().map(|t| system_time_to_ns(Some(t))),
                owner,
                device,
            });
        }
        Ok(entries)
    }

    fn open(&self, relative_path: &Path) -> Result<Box<dyn io::Read + Send>> {
        let absolute = self.absolute(relative_path);
        let file = fs::File::open(&absolute).map_err(|source| FsError::Io {
            path: absolute,
            source,
        })?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b.txt"), b"world").unwrap();

        let tree = LocalFsTree::new(dir.path());
        let root_entries = tree.read_dir(Path::new("")).unwrap();
        assert_eq!(root_entries.len(), 2);
        let file = root_entries.iter().find(|e| e.name == "a.txt").unwrap();
        assert!(file.is_file());
        assert_eq!(file.size, 5);
        let sub = root_entries.iter().find(|e| e.name == "sub").unwrap();
        assert!(sub.is_directory());

        let sub_entries = tree.read_dir(&sub.relative_path).unwrap();
        assert_eq!(sub_entries.len(), 1);
        assert_eq!(sub_entries[0].name, "b.txt");
    }

    #[test]
    fn open_reads_file_content() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let tree = LocalFsTree::new(dir.path());
        let mut reader = tree.open(Path::new("a.txt")).unwrap();
        let mut buf = Vec::new();
        io::Read::read_to_end(&mut reader, &mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    #[cfg(unix)]
    fn symlinks_are_reported_with_their_target() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("target.txt"), b"hi").unwrap();
        std::os::unix::fs::symlink("target.txt", dir.path().join("link")).unwrap();

        let tree = LocalFsTree::new(dir.path());
        let entries = tree.read_dir(Path::new("")).unwrap();
        let link = entries.iter().find(|e| e.name == "link").unwrap();
        assert!(matches!(&link.kind, EntryKind::Symlink { target } if target == "target.txt"));
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let tree = LocalFsTree::new(dir.path());
        assert!(tree.read_dir(Path::new("missing")).is_err());
    }
}
