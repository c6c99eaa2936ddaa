/*!
This crate contains the data structures that are shared between every
consumer of a vault repository: the algorithm-agnostic content/object
identifiers, the pluggable hashing, encryption and erasure-coding
envelopes, and the JSON repository format descriptor.

None of the types in this crate perform I/O. When a type derives
`Serialize`/`Deserialize` and is meant to live inside a pack blob or an
indirect object body, the representation produced by `rmp-serde`'s
compact encoding is the canonical on-disk form; the root format blobs
(`kopia.repository`, `kopia.blobcfg`) are the exception and use plain
JSON, since they are meant to be legible without the rest of the
repository.
*/

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::similar_names)]
#![allow(clippy::missing_errors_doc)]

pub mod ecc;
pub mod encryption;
pub mod entry;
pub mod error;
pub mod format;
pub mod hash;
pub mod ids;

pub use ecc::{EccAlgorithm, EccError};
pub use encryption::{Encryption, EncryptionError, KeyDerivationSecret};
pub use entry::{DirEntry, EntryType, OwnerInfo};
pub use error::{ErrorKind, RepoError};
pub use format::{
    BlobStorageConfiguration, ContentFormat, EpochParameters, FormatError, FormatVersion,
    IndexVersion, KeyDerivation, KopiaRepository, KNOWN_FEATURES, MutableParameters, ObjectFormat,
    RepositoryConfig, RetentionMode, UpgradeLockIntent,
};
pub use hash::{HashAlgorithm, HashParameters};
pub use ids::{ContentId, IndirectEntry, ObjectId};
