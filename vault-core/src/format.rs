/*!
The repository format descriptor (C5 data model).

Everything in this module is plain data plus the pure predicates and
validation rules that do not require talking to a blob store: the KDF
identifiers, the JSON envelope shapes, and the upgrade-lock time-based
state machine. The stateful side of the Format Manager — caching,
refresh, and the blob reads/writes that drive it — lives in
`vault-repo` since it is the first layer in this workspace that
performs I/O.
*/
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::ecc::EccAlgorithm;
use crate::encryption::Encryption;
use crate::hash::HashAlgorithm;

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("upgrade lock owner_id must not be empty")]
    EmptyOwnerId,
    #[error("upgrade lock message must not be empty")]
    EmptyMessage,
    #[error("io_drain_timeout must be positive")]
    NonPositiveDrainTimeout,
    #[error("max_permitted_clock_drift must be positive")]
    NonPositiveClockDrift,
    #[error("status_poll_interval must not exceed io_drain_timeout")]
    PollIntervalTooLarge,
    #[error("advance_notice_duration must exceed max_permitted_clock_drift + 2*io_drain_timeout")]
    InsufficientAdvanceNotice,
    #[error("an upgrade lock with owner_id {existing:?} already exists; cannot set one for {requested:?}")]
    OwnerMismatch { existing: String, requested: String },
    #[error("advance_notice_duration may only increase for an existing lock")]
    AdvanceNoticeMayNotDecrease,
    #[error("advance_notice_duration may not be cleared once set")]
    AdvanceNoticeMayNotBeCleared,
    #[error("advance_notice_duration may not be introduced once a lock exists without one")]
    AdvanceNoticeMayNotBeIntroduced,
    #[error("scrypt parameters were rejected: {0}")]
    InvalidScryptParams(String),
    #[error("required feature {0:?} is not recognized by this engine")]
    UnknownRequiredFeature(String),
}

/// Feature strings a `RepositoryConfig.required_features` entry may
/// legitimately name. An unrecognized entry means a newer engine wrote
/// this repository and this build must refuse to open it rather than
/// silently ignore whatever that feature guards.
pub const KNOWN_FEATURES: &[&str] = &["ecc", "epoch-manager"];

type Result<T> = std::result::Result<T, FormatError>;

/// KDF applied to the password (salted by the repository's
/// `uniqueID`) to derive the key that unwraps `encryptedFormatBytes`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyDerivation {
    Scrypt { log_n: u8, r: u32, p: u32 },
    Pbkdf2 { iterations: u32 },
}

impl KeyDerivation {
    /// The conventional default: `scrypt-65536-8-1`.
    pub fn default_scrypt() -> KeyDerivation {
        KeyDerivation::Scrypt {
            log_n: 16,
            r: 8,
            p: 1,
        }
    }

    /// The `keyAlgo` wire identifier, e.g. `scrypt-65536-8-1`.
    pub fn identifier(self) -> String {
        match self {
            KeyDerivation::Scrypt { log_n, r, p } => {
                format!("scrypt-{}-{r}-{p}", 1_u64 << log_n)
            }
            KeyDerivation::Pbkdf2 { iterations } => format!("pbkdf2-{iterations}"),
        }
    }

    /// Derives a 32-byte format-encryption key from `password` salted
    /// by the repository's `uniqueID`.
    pub fn derive(self, password: &[u8], unique_id: &[u8]) -> Result<[u8; 32]> {
        let mut key = [0_u8; 32];
        match self {
            KeyDerivation::Scrypt { log_n, r, p } => {
                let params = scrypt::Params::new(log_n, r, p, 32)
                    .map_err(|e| FormatError::InvalidScryptParams(e.to_string()))?;
                scrypt::scrypt(password, unique_id, &params, &mut key)
                    .map_err(|e| FormatError::InvalidScryptParams(e.to_string()))?;
            }
            KeyDerivation::Pbkdf2 { iterations } => {
                pbkdf2_hmac::<Sha256>(password, unique_id, iterations, &mut key);
            }
        }
        Ok(key)
    }
}

/// The unencrypted `kopia.repository` envelope: enough to bootstrap
/// decryption of [`RepositoryConfig`] given only the password.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KopiaRepository {
    pub unique_id: [u8; 32],
    pub key_algo: KeyDerivation,
    pub encryption: Encryption,
    #[serde(with = "serde_bytes")]
    pub encrypted_format_bytes: Vec<u8>,
}

impl KopiaRepository {
    /// HKDF-derives the content-encryption key derivation secret from
    /// the format-encryption key, mirroring
    /// [`crate::encryption::KeyDerivationSecret::derive`] but scoped
    /// to unwrapping the format blob itself rather than content.
    pub fn format_key_derivation_secret(format_key: &[u8; 32]) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(None, format_key);
        let mut okm = [0_u8; 32];
        hk.expand(b"vault-repo format-blob key v1", &mut okm)
            .expect("32 bytes is a valid HKDF-SHA256 output length");
        okm
    }
}

/// `formatVersion`: newer versions unlock newer behavior (password
/// rotation requires at least `V3`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FormatVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexVersion {
    V1 = 1,
    V2 = 2,
}

/// Epoch-compaction bookkeeping: how often indexes are rolled up into
/// a new epoch and how long tombstoned content survives before a
/// compaction pass may reclaim it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochParameters {
    pub epoch_duration_secs: i64,
    pub full_checkpoint_frequency: u32,
    pub cleanup_safety_margin_secs: i64,
}

impl Default for EpochParameters {
    fn default() -> EpochParameters {
        EpochParameters {
            epoch_duration_secs: 24 * 3600,
            full_checkpoint_frequency: 7,
            cleanup_safety_margin_secs: 4 * 3600,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MutableParameters {
    pub format_version: FormatVersion,
    pub max_pack_size: usize,
    pub index_version: IndexVersion,
    pub epoch_parameters: EpochParameters,
    pub enable_password_change: bool,
}

impl Default for MutableParameters {
    fn default() -> MutableParameters {
        MutableParameters {
            format_version: FormatVersion::V3,
            max_pack_size: 20 << 20,
            index_version: IndexVersion::V2,
            epoch_parameters: EpochParameters::default(),
            enable_password_change: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ObjectFormat {
    pub splitter: String,
}

impl Default for ObjectFormat {
    fn default() -> ObjectFormat {
        ObjectFormat {
            splitter: "dynamic-4m-chunker".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContentFormat {
    pub hash: HashAlgorithm,
    pub encryption: Encryption,
    #[serde(with = "serde_bytes")]
    pub hmac_secret: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub master_key: Vec<u8>,
    pub mutable_parameters: MutableParameters,
    pub ecc: Option<EccAlgorithm>,
}

/// `{ownerID, creationTime, advanceNoticeDuration, ioDrainTimeout,
/// statusPollInterval, maxPermittedClockDrift, message}` published
/// into `repoConfig.upgradeLock`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeLockIntent {
    pub owner_id: String,
    pub creation_time: DateTime<Utc>,
    /// Zero means "no advance notice configured".
    pub advance_notice_duration_secs: i64,
    pub io_drain_timeout_secs: i64,
    pub status_poll_interval_secs: i64,
    pub max_permitted_clock_drift_secs: i64,
    pub message: String,
}

impl UpgradeLockIntent {
    pub fn validate(&self) -> Result<()> {
        if self.owner_id.is_empty() {
            return Err(FormatError::EmptyOwnerId);
        }
        if self.message.is_empty() {
            return Err(FormatError::EmptyMessage);
        }
        if self.io_drain_timeout_secs <= 0 {
            return Err(FormatError::NonPositiveDrainTimeout);
        }
        if self.max_permitted_clock_drift_secs <= 0 {
            return Err(FormatError::NonPositiveClockDrift);
        }
        if self.status_poll_interval_secs > self.io_drain_timeout_secs {
            return Err(FormatError::PollIntervalTooLarge);
        }
        if self.advance_notice_duration_secs > 0
            && self.advance_notice_duration_secs
                <= self.max_permitted_clock_drift_secs + 2 * self.io_drain_timeout_secs
        {
            return Err(FormatError::InsufficientAdvanceNotice);
        }
        Ok(())
    }

    fn drift_plus_drain(&self) -> i64 {
        self.max_permitted_clock_drift_secs + 2 * self.io_drain_timeout_secs
    }

    /// `true` once writers must treat the repository as locked.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        let sufficient_notice = self.advance_notice_duration_secs > self.drift_plus_drain();
        let threshold = if sufficient_notice {
            self.creation_time
                + chrono::Duration::seconds(
                    self.advance_notice_duration_secs - self.drift_plus_drain(),
                )
        } else {
            self.creation_time
        };
        now >= threshold
    }

    /// `true` once all writers are guaranteed to have observed the
    /// lock and drained their in-flight I/O.
    pub fn is_writers_drained(&self, now: DateTime<Utc>) -> bool {
        now >= self.upgrade_time()
    }

    pub fn upgrade_time(&self) -> DateTime<Utc> {
        self.creation_time
            + chrono::Duration::seconds(self.advance_notice_duration_secs.max(self.drift_plus_drain()))
    }

    /// Merges an updated intent from the same owner into `self`,
    /// enforcing that `advanceNoticeDuration` only ever grows: it may
    /// not be cleared once set, may not be introduced where the lock
    /// previously had none, and may not otherwise decrease.
    pub fn merge(&self, updated: &UpgradeLockIntent) -> Result<UpgradeLockIntent> {
        if self.owner_id != updated.owner_id {
            return Err(FormatError::OwnerMismatch {
                existing: self.owner_id.clone(),
                requested: updated.owner_id.clone(),
            });
        }
        if self.advance_notice_duration_secs > 0 && updated.advance_notice_duration_secs == 0 {
            return Err(FormatError::AdvanceNoticeMayNotBeCleared);
        }
        if self.advance_notice_duration_secs == 0 && updated.advance_notice_duration_secs > 0 {
            return Err(FormatError::AdvanceNoticeMayNotBeIntroduced);
        }
        if updated.advance_notice_duration_secs < self.advance_notice_duration_secs {
            return Err(FormatError::AdvanceNoticeMayNotDecrease);
        }
        updated.validate()?;
        Ok(updated.clone())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub content_format: ContentFormat,
    pub object_format: ObjectFormat,
    pub upgrade_lock: Option<UpgradeLockIntent>,
    pub required_features: Vec<String>,
}

impl RepositoryConfig {
    /// Rejects the first `required_features` entry this build does not
    /// recognize (see [`KNOWN_FEATURES`]).
    pub fn validate_required_features(&self) -> Result<()> {
        for feature in &self.required_features {
            if !KNOWN_FEATURES.contains(&feature.as_str()) {
                return Err(FormatError::UnknownRequiredFeature(feature.clone()));
            }
        }
        Ok(())
    }
}

/// Retention mode applied to a blob, mirroring object-lock semantics
/// offered by S3-compatible stores.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetentionMode {
    Unset,
    Governance,
    Compliance,
}

impl Default for RetentionMode {
    fn default() -> RetentionMode {
        RetentionMode::Unset
    }
}

/// The `kopia.blobcfg` payload, encrypted the same way as
/// `encryptedFormatBytes`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BlobStorageConfiguration {
    pub retention_mode: RetentionMode,
    pub retention_period_secs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn lock(advance_notice_secs: i64, drain_secs: i64, drift_secs: i64) -> UpgradeLockIntent {
        UpgradeLockIntent {
            owner_id: "owner-1".to_string(),
            creation_time: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            advance_notice_duration_secs: advance_notice_secs,
            io_drain_timeout_secs: drain_secs,
            status_poll_interval_secs: drain_secs / 2,
            max_permitted_clock_drift_secs: drift_secs,
            message: "upgrading".to_string(),
        }
    }

    #[test]
    fn validate_rejects_insufficient_advance_notice() {
        let l = lock(100, 60, 10);
        assert!(matches!(
            l.validate(),
            Err(FormatError::InsufficientAdvanceNotice)
        ));
    }

    #[test]
    fn validate_accepts_zero_advance_notice() {
        let l = lock(0, 60, 10);
        assert!(l.validate().is_ok());
    }

    #[test]
    fn locked_immediately_without_sufficient_notice() {
        let l = lock(0, 60, 10);
        assert!(l.is_locked(l.creation_time));
    }

    #[test]
    fn locked_waits_for_threshold_with_sufficient_notice() {
        let l = lock(1000, 60, 10); // drift_plus_drain = 130
        let just_before = l.creation_time + chrono::Duration::seconds(1000 - 130 - 1);
        let just_after = l.creation_time + chrono::Duration::seconds(1000 - 130 + 1);
        assert!(!l.is_locked(just_before));
        assert!(l.is_locked(just_after));
    }

    #[test]
    fn writers_drained_at_upgrade_time() {
        let l = lock(1000, 60, 10);
        assert!(!l.is_writers_drained(l.upgrade_time() - chrono::Duration::seconds(1)));
        assert!(l.is_writers_drained(l.upgrade_time()));
    }

    #[test]
    fn merge_rejects_different_owner() {
        let original = lock(0, 60, 10);
        let mut updated = lock(0, 60, 10);
        updated.owner_id = "owner-2".to_string();
        assert!(matches!(
            original.merge(&updated),
            Err(FormatError::OwnerMismatch { .. })
        ));
    }

    #[test]
    fn merge_rejects_decreasing_advance_notice() {
        let original = lock(1000, 60, 10);
        let updated = lock(500, 60, 10);
        assert!(matches!(
            original.merge(&updated),
            Err(FormatError::AdvanceNoticeMayNotDecrease)
        ));
    }

    #[test]
    fn merge_allows_increasing_advance_notice() {
        let original = lock(1000, 60, 10);
        let updated = lock(2000, 60, 10);
        assert!(original.merge(&updated).is_ok());
    }

    #[test]
    fn merge_rejects_clearing_advance_notice() {
        let original = lock(1000, 60, 10);
        let updated = lock(0, 60, 10);
        assert!(matches!(
            original.merge(&updated),
            Err(FormatError::AdvanceNoticeMayNotBeCleared)
        ));
    }

    #[test]
    fn merge_rejects_introducing_advance_notice() {
        let original = lock(0, 60, 10);
        let updated = lock(1000, 60, 10);
        assert!(matches!(
            original.merge(&updated),
            Err(FormatError::AdvanceNoticeMayNotBeIntroduced)
        ));
    }

    #[test]
    fn merge_allows_holding_zero_advance_notice_steady() {
        let original = lock(0, 60, 10);
        let updated = lock(0, 60, 10);
        assert!(original.merge(&updated).is_ok());
    }

    #[test]
    fn key_derivation_identifiers_match_wire_format() {
        assert_eq!(KeyDerivation::default_scrypt().identifier(), "scrypt-65536-8-1");
        assert_eq!(
            KeyDerivation::Pbkdf2 { iterations: 600_000 }.identifier(),
            "pbkdf2-600000"
        );
    }

    #[test]
    fn scrypt_derivation_is_deterministic() {
        let kdf = KeyDerivation::Scrypt { log_n: 10, r: 8, p: 1 };
        let a = kdf.derive(b"hunter2", b"some-unique-id").unwrap();
        let b = kdf.derive(b"hunter2", b"some-unique-id").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn pbkdf2_derivation_is_deterministic() {
        let kdf = KeyDerivation::Pbkdf2 { iterations: 1000 };
        let a = kdf.derive(b"hunter2", b"some-unique-id").unwrap();
        let b = kdf.derive(b"hunter2", b"some-unique-id").unwrap();
        assert_eq!(a, b);
    }
}
