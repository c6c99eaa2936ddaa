/*!
Cross-cutting error taxonomy.

Every fallible operation in the engine returns a specific, per-module
error (`EncryptionError`, `EccError`, ...). At the public boundary of
`vault-repo` those are folded into a [`RepoError`] carrying one of the
[`ErrorKind`]s described below, so that callers can make retry/abort
decisions without matching on every concrete error type.
*/
use std::fmt;

use thiserror::Error;

/// The taxonomy a caller should branch on, independent of which
/// subsystem raised the error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A blob or filesystem entry does not exist.
    NotFound,
    /// A password or AEAD authentication tag did not verify.
    Authentication,
    /// A hash, CRC, or structural check failed: the data is corrupt.
    Corruption,
    /// A network or I/O error that a caller may retry.
    Transient,
    /// An operation was rejected by policy (upgrade lock, retention).
    PolicyViolation,
    /// The operation was cancelled by the caller.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Authentication => "authentication failed",
            ErrorKind::Corruption => "corruption detected",
            ErrorKind::Transient => "transient error",
            ErrorKind::PolicyViolation => "policy violation",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A tagged error that preserves both the taxonomy kind and the
/// underlying cause.
#[derive(Error, Debug)]
#[error("{kind}: {source}")]
pub struct RepoError {
    pub kind: ErrorKind,
    #[source]
    pub source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

impl RepoError {
    pub fn new(
        kind: ErrorKind,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> RepoError {
        RepoError {
            kind,
            source: Box::new(source),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}
