/*!
The central state machine (C5): owns the lifetime of
`kopia.repository`, `kopia.blobcfg`, and their decoded forms, and
coordinates password authentication, cached-vs-live staleness,
mutable-parameter updates, password rotation, and the multi-client
upgrade-lock protocol.
*/
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

use vault_core::{
    BlobStorageConfiguration, ContentFormat, EccAlgorithm, Encryption, EncryptionError,
    FormatError, HashAlgorithm, HashParameters, KeyDerivation, KeyDerivationSecret,
    KopiaRepository, MutableParameters, ObjectFormat, RepositoryConfig, UpgradeLockIntent,
};

use crate::blobcache::BlobCache;
use crate::blobstore::{BlobStore, BlobStoreError, PutOptions};

pub const KOPIA_REPOSITORY_BLOB_ID: &str = "kopia.repository";
pub const KOPIA_BLOBCFG_BLOB_ID: &str = "kopia.blobcfg";

const DEFAULT_VALID_DURATION_SECS: i64 = 15 * 60;
const MIN_VALID_DURATION_SECS: i64 = 1;
const MAX_VALID_DURATION_SECS: i64 = 15 * 60;

fn backup_blob_id(owner_id: &str) -> String {
    format!("{KOPIA_REPOSITORY_BLOB_ID}.backup.{owner_id}")
}

#[derive(Error, Debug)]
pub enum FormatManagerError {
    #[error("repository is already initialized")]
    AlreadyInitialized,
    #[error("kopia.blobcfg is present without kopia.repository; possible corruption")]
    PossibleCorruption,
    #[error("repository has not been initialized or opened")]
    NotInitialized,
    #[error("invalid password")]
    InvalidPassword,
    #[error("password change is not enabled for this repository (requires format version >= 3)")]
    PasswordChangeNotEnabled,
    #[error("no upgrade is in progress")]
    NoUpgradeInProgress,
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Encryption(#[from] EncryptionError),
    #[error(transparent)]
    BlobStore(#[from] BlobStoreError),
    #[error(transparent)]
    BlobCache(#[from] crate::blobcache::BlobCacheError),
    #[error("malformed JSON envelope")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, FormatManagerError>;

/// The unencrypted JSON shape of `kopia.repository` on the wire.
#[derive(Serialize, Deserialize)]
struct KopiaRepositoryJson {
    unique_id_hex: String,
    key_algo: KeyDerivation,
    encryption: Encryption,
    encrypted_format_bytes_hex: String,
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn from_hex(s: &str) -> std::result::Result<Vec<u8>, FormatManagerError> {
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|_| {
                FormatManagerError::Json(serde_json::Error::io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "invalid hex in kopia.repository",
                )))
            })
        })
        .collect()
}

impl KopiaRepositoryJson {
    fn from_domain(repo: &KopiaRepository) -> KopiaRepositoryJson {
        KopiaRepositoryJson {
            unique_id_hex: to_hex(&repo.unique_id),
            key_algo: repo.key_algo,
            encryption: repo.encryption,
            encrypted_format_bytes_hex: to_hex(&repo.encrypted_format_bytes),
        }
    }

    fn into_domain(self) -> Result<KopiaRepository> {
        let unique_id_bytes = from_hex(&self.unique_id_hex)?;
        let mut unique_id = [0_u8; 32];
        let n = unique_id_bytes.len().min(32);
        unique_id[..n].copy_from_slice(&unique_id_bytes[..n]);
        Ok(KopiaRepository {
            unique_id,
            key_algo: self.key_algo,
            encryption: self.encryption,
            encrypted_format_bytes: from_hex(&self.encrypted_format_bytes_hex)?,
        })
    }
}

/// The fresh, consistent bundle a manager swaps into place after
/// every refresh: a reader always sees one of these atomically, never
/// a mix of old and new fields.
pub struct Provider {
    pub hash: HashAlgorithm,
    pub hash_params: HashParameters,
    pub encryption: Encryption,
    pub key_derivation_secret: KeyDerivationSecret,
    pub mutable_parameters: MutableParameters,
    pub object_format: ObjectFormat,
    pub ecc: Option<EccAlgorithm>,
}

impl Provider {
    /// The configured ECC wrapper, if this repository's content
    /// format enables one.
    pub fn ecc(&self) -> Option<EccAlgorithm> {
        self.ecc
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("hash", &self.hash)
            .field("hash_params", &self.hash_params)
            .field("encryption", &self.encryption)
            .field("key_derivation_secret", &"<redacted>")
            .field("mutable_parameters", &self.mutable_parameters)
            .field("object_format", &self.object_format)
            .field("ecc", &self.ecc)
            .finish()
    }
}

struct ManagerState {
    repo_config: RepositoryConfig,
    kopia_repository: KopiaRepository,
    blob_config: Option<BlobStorageConfiguration>,
    format_key: [u8; 32],
    valid_until: DateTime<Utc>,
    provider: Arc<Provider>,
    refresh_count: u64,
}

fn build_provider(config: &RepositoryConfig) -> Provider {
    Provider {
        hash: config.content_format.hash,
        hash_params: HashParameters::new(config.content_format.hmac_secret.clone()),
        encryption: config.content_format.encryption,
        key_derivation_secret: KeyDerivationSecret::derive(&config.content_format.master_key),
        mutable_parameters: config.content_format.mutable_parameters.clone(),
        object_format: config.object_format.clone(),
        ecc: config.content_format.ecc,
    }
}

/// Clamps a caller-supplied cache-validity window into `[1s, 15m]`,
/// applying the 15-minute default when the input is non-positive.
fn clamp_valid_duration(secs: i64) -> i64 {
    if secs <= 0 {
        DEFAULT_VALID_DURATION_SECS
    } else {
        secs.clamp(MIN_VALID_DURATION_SECS, MAX_VALID_DURATION_SECS)
    }
}

pub struct FormatManager<S: BlobStore, C: BlobCache> {
    store: S,
    cache: C,
    valid_duration_secs: i64,
    state: RwLock<Option<ManagerState>>,
}

impl<S: BlobStore, C: BlobCache> FormatManager<S, C> {
    pub fn new(store: S, cache: C, valid_duration_secs: i64) -> FormatManager<S, C> {
        FormatManager {
            store,
            cache,
            valid_duration_secs: clamp_valid_duration(valid_duration_secs),
            state: RwLock::new(None),
        }
    }

    /// §4.4.1: creates a brand-new repository. Fails loudly if either
    /// root blob is already present.
    #[instrument(skip(self, password, hash_secret, master_key))]
    pub fn initialize(
        &self,
        password: &[u8],
        hash: HashAlgorithm,
        hash_secret: Vec<u8>,
        encryption: Encryption,
        master_key: Vec<u8>,
        mutable_parameters: MutableParameters,
    ) -> Result<()> {
        match self.store.get_metadata(KOPIA_REPOSITORY_BLOB_ID) {
            Ok(_) => return Err(FormatManagerError::AlreadyInitialized),
            Err(BlobStoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        match self.store.get_metadata(KOPIA_BLOBCFG_BLOB_ID) {
            Ok(_) => return Err(FormatManagerError::PossibleCorruption),
            Err(BlobStoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let mut unique_id = [0_u8; 32];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut unique_id);
        let key_algo = KeyDerivation::default_scrypt();
        let format_key = key_algo.derive(password, &unique_id)?;

        let repo_config = RepositoryConfig {
            content_format: ContentFormat {
                hash,
                encryption,
                hmac_secret: hash_secret,
                master_key,
                mutable_parameters,
                ecc: None,
            },
            object_format: ObjectFormat::default(),
            upgrade_lock: None,
            required_features: Vec::new(),
        };

        let blob_config = BlobStorageConfiguration::default();
        let encrypted_format_bytes =
            self.write_all(&repo_config, &blob_config, &key_algo, encryption, &unique_id, &format_key)?;

        let provider = build_provider(&repo_config);
        *self.state.write().expect("state lock poisoned") = Some(ManagerState {
            repo_config,
            kopia_repository: KopiaRepository {
                unique_id,
                key_algo,
                encryption,
                encrypted_format_bytes,
            },
            blob_config: Some(blob_config),
            format_key,
            valid_until: Utc::now() + chrono::Duration::seconds(self.valid_duration_secs),
            provider: Arc::new(provider),
            refresh_count: 0,
        });
        debug!("initialized new repository");
        Ok(())
    }

    fn write_all(
        &self,
        repo_config: &RepositoryConfig,
        blob_config: &BlobStorageConfiguration,
        key_algo: &KeyDerivation,
        encryption: Encryption,
        unique_id: &[u8; 32],
        format_key: &[u8; 32],
    ) -> Result<Vec<u8>> {
        let secret = KeyDerivationSecret::from_raw(*format_key);
        let plaintext = serde_json::to_vec(repo_config)?;
        let mut encrypted_format_bytes = Vec::new();
        encryption.encrypt(&mut encrypted_format_bytes, &plaintext, KOPIA_REPOSITORY_BLOB_ID.as_bytes(), &secret)?;

        let blobcfg_plaintext = serde_json::to_vec(blob_config)?;
        let mut encrypted_blobcfg = Vec::new();
        encryption.encrypt(&mut encrypted_blobcfg, &blobcfg_plaintext, KOPIA_BLOBCFG_BLOB_ID.as_bytes(), &secret)?;

        let retention = PutOptions {
            retention_mode: blob_config.retention_mode,
            retention_period_secs: if blob_config.retention_period_secs > 0 {
                Some(blob_config.retention_period_secs)
            } else {
                None
            },
        };

        // blobcfg first, then kopia.repository: a crash in between
        // leaves the repo readable under its previous parameters.
        self.store.put_blob(KOPIA_BLOBCFG_BLOB_ID, &encrypted_blobcfg, retention)?;

        let envelope = KopiaRepositoryJson::from_domain(&KopiaRepository {
            unique_id: *unique_id,
            key_algo: *key_algo,
            encryption,
            encrypted_format_bytes: encrypted_format_bytes.clone(),
        });
        let envelope_bytes = serde_json::to_vec(&envelope)?;
        self.store
            .put_blob(KOPIA_REPOSITORY_BLOB_ID, &envelope_bytes, PutOptions::default())?;

        self.cache.remove(&[KOPIA_REPOSITORY_BLOB_ID, KOPIA_BLOBCFG_BLOB_ID]);
        Ok(encrypted_format_bytes)
    }

    /// Returns the current [`Provider`], refreshing from the blob
    /// store first if the cached state has gone stale.
    #[instrument(skip(self, password))]
    pub fn provider(&self, password: &[u8]) -> Result<Arc<Provider>> {
        let now = Utc::now();
        {
            let guard = self.state.read().expect("state lock poisoned");
            if let Some(state) = guard.as_ref() {
                if now < state.valid_until {
                    return Ok(state.provider.clone());
                }
            }
        }
        self.refresh(password)
    }

    /// §4.4.2: re-fetches the root blobs through the [`BlobCache`],
    /// attempts decryption with the cached key first, and only pays
    /// the KDF cost again if that fails.
    #[instrument(skip(self, password))]
    pub fn refresh(&self, password: &[u8]) -> Result<Arc<Provider>> {
        let cached_key = {
            let guard = self.state.read().expect("state lock poisoned");
            guard.as_ref().map(|s| s.format_key)
        };

        let envelope_entry = self.fetch_through_cache(KOPIA_REPOSITORY_BLOB_ID)?;
        let envelope: KopiaRepositoryJson = serde_json::from_slice(&envelope_entry.bytes)?;
        let repo = envelope.into_domain()?;

        let (repo_config, format_key) = self.decrypt_with_retry(&repo, password, cached_key)?;
        repo_config.validate_required_features()?;

        let blob_config = match self.fetch_through_cache(KOPIA_BLOBCFG_BLOB_ID) {
            Ok(entry) if entry.hit || !entry.bytes.is_empty() => {
                let secret = KeyDerivationSecret::from_raw(format_key);
                let mut plaintext = Vec::new();
                repo.encryption
                    .decrypt(&mut plaintext, &entry.bytes, KOPIA_BLOBCFG_BLOB_ID.as_bytes(), &secret)?;
                Some(serde_json::from_slice(&plaintext)?)
            }
            Ok(_) => None,
            Err(FormatManagerError::BlobStore(BlobStoreError::NotFound(_))) => None,
            Err(e) => return Err(e),
        };

        let provider = Arc::new(build_provider(&repo_config));
        let valid_until = envelope_entry.mtime + chrono::Duration::seconds(self.valid_duration_secs);

        let mut guard = self.state.write().expect("state lock poisoned");
        let refresh_count = guard.as_ref().map_or(0, |s| s.refresh_count) + 1;
        *guard = Some(ManagerState {
            repo_config,
            kopia_repository: repo,
            blob_config,
            format_key,
            valid_until,
            provider: provider.clone(),
            refresh_count,
        });
        trace!(refresh_count, "format manager refreshed");
        Ok(provider)
    }

    fn fetch_through_cache(&self, id: &str) -> Result<crate::blobcache::CacheEntry> {
        let entry = self.cache.get(id)?;
        let now = Utc::now();
        if entry.hit
            && (now - entry.mtime) <= chrono::Duration::seconds(self.valid_duration_secs)
        {
            return Ok(entry);
        }
        let bytes = match self.store.get_blob(id, 0, None) {
            Ok(b) => b,
            Err(BlobStoreError::NotFound(_)) if id == KOPIA_BLOBCFG_BLOB_ID => {
                return Ok(crate::blobcache::CacheEntry {
                    bytes: Vec::new(),
                    mtime: now,
                    hit: false,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let mtime = self.cache.put(id, &bytes)?;
        Ok(crate::blobcache::CacheEntry { bytes, mtime, hit: true })
    }

    fn decrypt_with_retry(
        &self,
        repo: &KopiaRepository,
        password: &[u8],
        cached_key: Option<[u8; 32]>,
    ) -> Result<(RepositoryConfig, [u8; 32])> {
        if let Some(key) = cached_key {
            if let Ok(config) = self.try_decrypt(repo, &key) {
                return Ok((config, key));
            }
        }
        let key = repo.key_algo.derive(password, &repo.unique_id)?;
        match self.try_decrypt(repo, &key) {
            Ok(config) => Ok((config, key)),
            Err(_) => {
                warn!("format blob decryption failed for both cached and freshly-derived keys");
                Err(FormatManagerError::InvalidPassword)
            }
        }
    }

    fn try_decrypt(&self, repo: &KopiaRepository, key: &[u8; 32]) -> Result<RepositoryConfig> {
        let secret = KeyDerivationSecret::from_raw(*key);
        let mut plaintext = Vec::new();
        repo.encryption.decrypt(
            &mut plaintext,
            &repo.encrypted_format_bytes,
            KOPIA_REPOSITORY_BLOB_ID.as_bytes(),
            &secret,
        )?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// §4.4.4: mutates the in-memory config under the manager lock,
    /// then writes blobcfg before kopia.repository.
    #[instrument(skip(self, mutate))]
    pub fn set_parameters(&self, mutate: impl FnOnce(&mut RepositoryConfig)) -> Result<()> {
        let mut guard = self.state.write().expect("state lock poisoned");
        let state = guard.as_mut().ok_or(FormatManagerError::NotInitialized)?;
        mutate(&mut state.repo_config);
        state.repo_config.validate_required_features()?;
        let blob_config = state.blob_config.unwrap_or_default();
        state.kopia_repository.encrypted_format_bytes = self.write_all(
            &state.repo_config,
            &blob_config,
            &state.kopia_repository.key_algo,
            state.kopia_repository.encryption,
            &state.kopia_repository.unique_id,
            &state.format_key,
        )?;
        state.provider = Arc::new(build_provider(&state.repo_config));
        Ok(())
    }

    /// §4.4.4: rejected unless `enablePasswordChange` (format version
    /// >= 3); rederives the format key and rewrites both root blobs.
    #[instrument(skip(self, old_password, new_password))]
    pub fn change_password(&self, old_password: &[u8], new_password: &[u8]) -> Result<()> {
        let mut guard = self.state.write().expect("state lock poisoned");
        let state = guard.as_mut().ok_or(FormatManagerError::NotInitialized)?;
        if !state.repo_config.content_format.mutable_parameters.enable_password_change {
            return Err(FormatManagerError::PasswordChangeNotEnabled);
        }
        let current_key = state
            .kopia_repository
            .key_algo
            .derive(old_password, &state.kopia_repository.unique_id)?;
        if current_key != state.format_key {
            return Err(FormatManagerError::InvalidPassword);
        }
        let new_key = state
            .kopia_repository
            .key_algo
            .derive(new_password, &state.kopia_repository.unique_id)?;
        state.format_key = new_key;
        let blob_config = state.blob_config.unwrap_or_default();
        state.kopia_repository.encrypted_format_bytes = self.write_all(
            &state.repo_config,
            &blob_config,
            &state.kopia_repository.key_algo,
            state.kopia_repository.encryption,
            &state.kopia_repository.unique_id,
            &new_key,
        )?;
        Ok(())
    }

    /// §4.4.5: publishes (or merges) an upgrade-lock intent, backing
    /// up the pre-upgrade format blob first.
    #[instrument(skip(self))]
    pub fn set_upgrade_lock_intent(&self, intent: UpgradeLockIntent) -> Result<()> {
        intent.validate()?;
        let mut guard = self.state.write().expect("state lock poisoned");
        let state = guard.as_mut().ok_or(FormatManagerError::NotInitialized)?;

        let merged = match &state.repo_config.upgrade_lock {
            Some(existing) => existing.merge(&intent)?,
            None => intent,
        };

        let backup_id = backup_blob_id(&merged.owner_id);
        let current_envelope = KopiaRepositoryJson::from_domain(&state.kopia_repository);
        let current_bytes = serde_json::to_vec(&current_envelope)?;
        self.store.put_blob(&backup_id, &current_bytes, PutOptions::default())?;

        state.repo_config.upgrade_lock = Some(merged);
        let blob_config = state.blob_config.unwrap_or_default();
        state.kopia_repository.encrypted_format_bytes = self.write_all(
            &state.repo_config,
            &blob_config,
            &state.kopia_repository.key_algo,
            state.kopia_repository.encryption,
            &state.kopia_repository.unique_id,
            &state.format_key,
        )?;
        Ok(())
    }

    /// §4.4.5: bumps the format version, clears the lock, and deletes
    /// the backup blob. Fails if no upgrade is in progress.
    #[instrument(skip(self))]
    pub fn commit_upgrade(&self) -> Result<()> {
        let mut guard = self.state.write().expect("state lock poisoned");
        let state = guard.as_mut().ok_or(FormatManagerError::NotInitialized)?;
        let lock = state
            .repo_config
            .upgrade_lock
            .take()
            .ok_or(FormatManagerError::NoUpgradeInProgress)?;

        state.repo_config.content_format.mutable_parameters.format_version =
            vault_core::FormatVersion::V3;
        let blob_config = state.blob_config.unwrap_or_default();
        state.kopia_repository.encrypted_format_bytes = self.write_all(
            &state.repo_config,
            &blob_config,
            &state.kopia_repository.key_algo,
            state.kopia_repository.encryption,
            &state.kopia_repository.unique_id,
            &state.format_key,
        )?;
        let _ = self.store.delete_blob(&backup_blob_id(&lock.owner_id));
        Ok(())
    }

    /// §4.4.5: restores the pre-upgrade format blob from its backup
    /// and deletes the backup. Fails if no upgrade is in progress.
    #[instrument(skip(self))]
    pub fn rollback_upgrade(&self) -> Result<()> {
        let mut guard = self.state.write().expect("state lock poisoned");
        let state = guard.as_mut().ok_or(FormatManagerError::NotInitialized)?;
        let lock = state
            .repo_config
            .upgrade_lock
            .clone()
            .ok_or(FormatManagerError::NoUpgradeInProgress)?;

        let backup_id = backup_blob_id(&lock.owner_id);
        let backup_bytes = self.store.get_blob(&backup_id, 0, None)?;
        self.store
            .put_blob(KOPIA_REPOSITORY_BLOB_ID, &backup_bytes, PutOptions::default())?;
        self.cache.remove(&[KOPIA_REPOSITORY_BLOB_ID]);
        self.store.delete_blob(&backup_id)?;

        let envelope: KopiaRepositoryJson = serde_json::from_slice(&backup_bytes)?;
        state.kopia_repository = envelope.into_domain()?;
        state.repo_config.upgrade_lock = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobcache::MemoryBlobCache;
    use crate::blobstore::MemoryBlobStore;

    fn manager() -> FormatManager<MemoryBlobStore, MemoryBlobCache> {
        FormatManager::new(MemoryBlobStore::new(), MemoryBlobCache::new(), 0)
    }

    fn init(mgr: &FormatManager<MemoryBlobStore, MemoryBlobCache>, password: &[u8]) {
        mgr.initialize(
            password,
            HashAlgorithm::Blake3,
            b"hmac-secret".to_vec(),
            Encryption::Aes256Gcm,
            b"0123456789abcdef0123456789abcdef".to_vec(),
            MutableParameters::default(),
        )
        .unwrap();
    }

    #[test]
    fn initialize_then_refresh_round_trips() {
        let mgr = manager();
        init(&mgr, b"hunter2");
        let provider = mgr.refresh(b"hunter2").unwrap();
        assert_eq!(provider.hash, HashAlgorithm::Blake3);
    }

    #[test]
    fn double_initialize_fails() {
        let mgr = manager();
        init(&mgr, b"hunter2");
        let err = mgr
            .initialize(
                b"hunter2",
                HashAlgorithm::Blake3,
                b"s".to_vec(),
                Encryption::Aes256Gcm,
                b"k".to_vec(),
                MutableParameters::default(),
            )
            .unwrap_err();
        assert!(matches!(err, FormatManagerError::AlreadyInitialized));
    }

    #[test]
    fn wrong_password_on_cold_refresh_fails() {
        let store = MemoryBlobStore::new();
        let cache = MemoryBlobCache::new();
        let writer = FormatManager::new(store.clone(), cache.clone(), 0);
        init(&writer, b"hunter2");

        // A second manager sharing the same backing store/cache has no
        // cached format key of its own, so this exercises the cold
        // KDF-and-decrypt path rather than the cache-hit shortcut.
        let reader = FormatManager::new(store, cache, 0);
        let err = reader.refresh(b"wrong-password").unwrap_err();
        assert!(matches!(err, FormatManagerError::InvalidPassword));
        assert!(reader.refresh(b"hunter2").is_ok());
    }

    #[test]
    fn set_parameters_persists_mutation() {
        let mgr = manager();
        init(&mgr, b"hunter2");
        mgr.set_parameters(|cfg| {
            cfg.required_features.push("ecc".to_string());
        })
        .unwrap();
        let provider = mgr.refresh(b"hunter2").unwrap();
        assert_eq!(provider.hash, HashAlgorithm::Blake3);
    }

    #[test]
    fn set_parameters_rejects_unknown_required_feature() {
        let mgr = manager();
        init(&mgr, b"hunter2");
        let err = mgr
            .set_parameters(|cfg| cfg.required_features.push("time-travel".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            FormatManagerError::Format(FormatError::UnknownRequiredFeature(_))
        ));
    }

    #[test]
    fn change_password_then_refresh_with_new_password() {
        let mgr = manager();
        init(&mgr, b"hunter2");
        mgr.change_password(b"hunter2", b"new-password").unwrap();
        assert!(mgr.refresh(b"new-password").is_ok());
    }

    #[test]
    fn change_password_rejects_wrong_old_password() {
        let mgr = manager();
        init(&mgr, b"hunter2");
        let err = mgr.change_password(b"not-it", b"new-password").unwrap_err();
        assert!(matches!(err, FormatManagerError::InvalidPassword));
    }

    #[test]
    fn upgrade_lock_lifecycle() {
        let mgr = manager();
        init(&mgr, b"hunter2");
        let intent = UpgradeLockIntent {
            owner_id: "owner-1".to_string(),
            creation_time: Utc::now(),
            advance_notice_duration_secs: 0,
            io_drain_timeout_secs: 60,
            status_poll_interval_secs: 30,
            max_permitted_clock_drift_secs: 5,
            message: "upgrading format".to_string(),
        };
        mgr.set_upgrade_lock_intent(intent).unwrap();
        mgr.commit_upgrade().unwrap();
        let err = mgr.commit_upgrade().unwrap_err();
        assert!(matches!(err, FormatManagerError::NoUpgradeInProgress));
    }

    #[test]
    fn rollback_restores_previous_format_blob() {
        let mgr = manager();
        init(&mgr, b"hunter2");
        let intent = UpgradeLockIntent {
            owner_id: "owner-1".to_string(),
            creation_time: Utc::now(),
            advance_notice_duration_secs: 0,
            io_drain_timeout_secs: 60,
            status_poll_interval_secs: 30,
            max_permitted_clock_drift_secs: 5,
            message: "upgrading format".to_string(),
        };
        mgr.set_upgrade_lock_intent(intent).unwrap();
        mgr.rollback_upgrade().unwrap();
        let err = mgr.rollback_upgrade().unwrap_err();
        assert!(matches!(err, FormatManagerError::NoUpgradeInProgress));
    }
}
