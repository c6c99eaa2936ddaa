/*!
Content and object identifiers.

A [`ContentId`] names a single chunk's plaintext. An [`ObjectId`] is
either a direct reference to one content ID, a recursive (indirect)
reference to a content ID whose plaintext is a list of entries
pointing at further objects, or a small payload inlined directly into
the identifier.
*/
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single ASCII tag byte identifying the role of a content ID, e.g.
/// `k` for directory manifests, `h` for the hash-cache, or a
/// caller-chosen byte in `g..z` for user content. The mapping beyond
/// `p`/`q`/`k`/`h` is a convention fixed by the caller, not enforced
/// here.
pub type ContentTag = u8;

/// The keyed hash of a chunk's plaintext, optionally prefixed by a
/// single tag byte. Stable across runs and machines that share the
/// same [`crate::hash::HashParameters`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentId {
    tag: Option<ContentTag>,
    #[serde(with = "serde_bytes")]
    digest: Vec<u8>,
}

impl ContentId {
    /// Builds a content ID from a raw digest with no role tag.
    pub fn from_digest(digest: Vec<u8>) -> ContentId {
        ContentId { tag: None, digest }
    }

    /// Builds a content ID from a raw digest with a role tag, e.g.
    /// `b'k'` for a directory manifest.
    pub fn tagged(tag: ContentTag, digest: Vec<u8>) -> ContentId {
        ContentId {
            tag: Some(tag),
            digest,
        }
    }

    pub fn tag(&self) -> Option<ContentTag> {
        self.tag
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// The wire form used as a blob-store key component and as the
    /// map key inside a pack index: the tag byte (if any) followed by
    /// the lowercase-hex digest.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(self.digest.len() * 2 + 1);
        if let Some(tag) = self.tag {
            s.push(tag as char);
        }
        for byte in &self.digest {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.to_hex())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One entry in the plaintext of an indirect object: a byte range of
/// the logical stream, and the object that supplies those bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectEntry {
    pub offset: u64,
    pub length: u64,
    pub object_id: ObjectId,
}

/// A reference to content: either a single chunk, a recursive index
/// of further objects, or a small literal payload carried inline so
/// that tiny files need not round-trip through the blob store at all.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectId {
    /// Direct reference to one content ID.
    Direct(ContentId),
    /// Reference to a content ID whose plaintext, once decoded, is a
    /// MessagePack-encoded `Vec<IndirectEntry>`.
    Indirect(ContentId),
    /// A payload small enough to store without ever writing a chunk.
    Inline(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl ObjectId {
    /// `true` for [`ObjectId::Indirect`].
    pub fn is_indirect(&self) -> bool {
        matches!(self, ObjectId::Indirect(_))
    }

    /// The underlying content ID, if this object id names one
    /// (direct or indirect); `None` for inline payloads.
    pub fn content_id(&self) -> Option<&ContentId> {
        match self {
            ObjectId::Direct(id) | ObjectId::Indirect(id) => Some(id),
            ObjectId::Inline(_) => None,
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Direct(id) => write!(f, "{id}"),
            ObjectId::Indirect(id) => write!(f, "I{id}"),
            ObjectId::Inline(bytes) => write!(f, "inline:{}B", bytes.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trips_tag() {
        let id = ContentId::tagged(b'k', vec![0xAB, 0xCD]);
        assert_eq!(id.to_hex(), "kabcd");
        let untagged = ContentId::from_digest(vec![0xAB, 0xCD]);
        assert_eq!(untagged.to_hex(), "abcd");
    }

    #[test]
    fn serde_round_trip() {
        let entries = vec![IndirectEntry {
            offset: 0,
            length: 10,
            object_id: ObjectId::Direct(ContentId::from_digest(vec![1, 2, 3])),
        }];
        let bytes = rmp_serde::to_vec(&entries).unwrap();
        let back: Vec<IndirectEntry> = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(entries, back);
    }
}
