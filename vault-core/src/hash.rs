/*!
Keyed hashing (C1).

Every algorithm here is an HMAC or a keyed hash: content IDs must be
unforgeable by anyone who does not hold the HMAC secret, otherwise an
attacker controlling the blob store could plant chunks that collide
with the deduplication index. Truncation to a shorter prefix is a
property of the algorithm variant, not a runtime parameter, so two
engines that agree on a [`HashAlgorithm`] value always agree on the
length of the content IDs it produces.
*/
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Sha224, Sha256};
use sha3::{Sha3_224, Sha3_256};

/// The HMAC secret keying every hash function. Kept separate from the
/// AEAD master key; derived once per repository and carried in
/// [`crate::format::RepositoryConfig::content_format`].
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashParameters {
    #[serde(with = "serde_bytes")]
    hmac_secret: Vec<u8>,
}

impl std::fmt::Debug for HashParameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashParameters")
            .field("hmac_secret", &"<redacted>")
            .finish()
    }
}

impl HashParameters {
    pub fn new(hmac_secret: Vec<u8>) -> HashParameters {
        HashParameters { hmac_secret }
    }

    pub fn hmac_secret(&self) -> &[u8] {
        &self.hmac_secret
    }
}

/// The registered hash algorithms. This is a closed, compile-time
/// enumerable catalogue rather than a runtime registry: the set of
/// algorithms is append-only and populated at build time, which an
/// enum models more directly than a mutable map populated during
/// process startup.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashAlgorithm {
    HmacSha256,
    HmacSha256Trunc128,
    HmacSha224,
    HmacSha3_224,
    HmacSha3_256,
    Blake3,
    Blake3Trunc128,
}

impl HashAlgorithm {
    /// The output length of this algorithm in bytes, after truncation.
    pub fn output_len(self) -> usize {
        match self {
            HashAlgorithm::HmacSha256 => 32,
            HashAlgorithm::HmacSha256Trunc128 => 16,
            HashAlgorithm::HmacSha224 => 28,
            HashAlgorithm::HmacSha3_224 => 28,
            HashAlgorithm::HmacSha3_256 => 32,
            HashAlgorithm::Blake3 => 32,
            HashAlgorithm::Blake3Trunc128 => 16,
        }
    }

    /// Appends the hash of `data` to `output` and returns the slice
    /// that was appended. Thread-safe: no hasher state is shared
    /// between calls, each call constructs its own.
    pub fn hash_append<'a>(
        self,
        output: &'a mut Vec<u8>,
        data: &[u8],
        params: &HashParameters,
    ) -> &'a [u8] {
        let start = output.len();
        let secret = params.hmac_secret();
        match self {
            HashAlgorithm::HmacSha256 | HashAlgorithm::HmacSha256Trunc128 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(secret)
                    .expect("HMAC accepts keys of any length");
                mac.update(data);
                let full = mac.finalize().into_bytes();
                output.extend_from_slice(&full[..self.output_len()]);
            }
            HashAlgorithm::HmacSha224 => {
                let mut mac = Hmac::<Sha224>::new_from_slice(secret)
                    .expect("HMAC accepts keys of any length");
                mac.update(data);
                output.extend_from_slice(&mac.finalize().into_bytes());
            }
            HashAlgorithm::HmacSha3_224 => {
                let mut mac = Hmac::<Sha3_224>::new_from_slice(secret)
                    .expect("HMAC accepts keys of any length");
                mac.update(data);
                output.extend_from_slice(&mac.finalize().into_bytes());
            }
            HashAlgorithm::HmacSha3_256 => {
                let mut mac = Hmac::<Sha3_256>::new_from_slice(secret)
                    .expect("HMAC accepts keys of any length");
                mac.update(data);
                output.extend_from_slice(&mac.finalize().into_bytes());
            }
            HashAlgorithm::Blake3 | HashAlgorithm::Blake3Trunc128 => {
                let mut key = [0_u8; 32];
                let n = secret.len().min(32);
                key[..n].copy_from_slice(&secret[..n]);
                let full = blake3::keyed_hash(&key, data);
                output.extend_from_slice(&full.as_bytes()[..self.output_len()]);
            }
        }
        &output[start..]
    }

    /// Convenience wrapper around [`HashAlgorithm::hash_append`] that
    /// allocates a fresh buffer.
    pub fn hash(self, data: &[u8], params: &HashParameters) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.output_len());
        self.hash_append(&mut out, data, params);
        out
    }

    /// The catalogue of algorithms a fresh engine understands.
    pub fn supported_algorithms() -> &'static [HashAlgorithm] {
        &[
            HashAlgorithm::HmacSha256,
            HashAlgorithm::HmacSha256Trunc128,
            HashAlgorithm::HmacSha224,
            HashAlgorithm::HmacSha3_224,
            HashAlgorithm::HmacSha3_256,
            HashAlgorithm::Blake3,
            HashAlgorithm::Blake3Trunc128,
        ]
    }
}
