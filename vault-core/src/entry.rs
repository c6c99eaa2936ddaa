/*!
Directory manifest entries.

A directory's plaintext is a name-sorted list of these, stored as an
object like any other content. Ownership and device fields are
populated from the filesystem abstraction on platforms that have them
and left at their defaults elsewhere.
*/
use serde::{Deserialize, Serialize};

use crate::ids::ObjectId;

/// Owning user/group, carried independently of whether the restoring
/// platform can apply them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerInfo {
    pub uid: u32,
    pub gid: u32,
}

/// What kind of filesystem object a [`DirEntry`] describes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    File,
    Directory,
    Symlink { target: String },
    /// An entry that could not be read; `message` is recorded so the
    /// rest of the snapshot can proceed rather than aborting.
    Error { message: String },
}

/// One entry in a directory manifest: name, metadata, and a reference
/// to its content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub entry_type: EntryType,
    pub mode: u32,
    pub size: u64,
    /// Nanoseconds since the Unix epoch.
    pub mtime_ns: i64,
    pub birthtime_ns: Option<i64>,
    pub owner: OwnerInfo,
    /// `(major, minor)` device numbers; zero for non-device entries.
    pub device: (u32, u32),
    pub xattrs: Vec<(String, Vec<u8>)>,
    /// `None` for directories with no content of their own (they are
    /// addressed by the parent manifest) and for error entries.
    pub object_id: Option<ObjectId>,
}

impl DirEntry {
    /// The `fnv64a(name, mtime-ns, mode, size, uid, gid)` hash the
    /// uploader's hash-cache keys on: cheap to recompute from
    /// metadata alone, so a cache hit never touches file contents.
    pub fn metadata_hash(&self) -> u64 {
        let mut hash = fnv1a64(&[]);
        hash = fnv1a64_continue(hash, self.name.as_bytes());
        hash = fnv1a64_continue(hash, &self.mtime_ns.to_le_bytes());
        hash = fnv1a64_continue(hash, &self.mode.to_le_bytes());
        hash = fnv1a64_continue(hash, &self.size.to_le_bytes());
        hash = fnv1a64_continue(hash, &self.owner.uid.to_le_bytes());
        hash = fnv1a64_continue(hash, &self.owner.gid.to_le_bytes());
        hash
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

fn fnv1a64(data: &[u8]) -> u64 {
    fnv1a64_continue(FNV_OFFSET_BASIS, data)
}

fn fnv1a64_continue(mut hash: u64, data: &[u8]) -> u64 {
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
