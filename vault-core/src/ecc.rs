/*!
Erasure-coded outer wrapper (C3).

An optional layer on top of the encryption envelope: pads the
ciphertext out to a whole number of shards, computes Reed-Solomon
parity shards, and prefixes every shard (parity and data alike) with
its own CRC-32 so that a corrupt shard can be detected and
reconstructed from its siblings without touching the AEAD tag at all.
The wire layout is exactly `(crc ‖ shard)+` — the original length
needed to trim padding back off lives inside the padded data itself,
at a fixed trailing offset, rather than in a header ahead of the
shards.
*/
use crc32fast::Hasher as Crc32;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};
use std::convert::TryInto;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EccError {
    #[error("more than {parity} shard(s) are erased in a block of {total}; cannot reconstruct")]
    TooManyErasures { parity: usize, total: usize },
    #[error("reed-solomon engine rejected the shard layout: {0}")]
    Layout(#[from] reed_solomon_erasure::Error),
    #[error("encoded data is shorter than one shard block")]
    Truncated,
    #[error("plaintext of {plaintext_len} bytes exceeds this shard layout's {capacity}-byte capacity")]
    PlaintextExceedsShardCapacity { plaintext_len: usize, capacity: usize },
}

type Result<T> = std::result::Result<T, EccError>;

/// The one supported ECC scheme: Reed-Solomon with per-shard CRC-32.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EccAlgorithm {
    pub overhead_percent: u32,
    pub max_shard_size: usize,
}

const CRC_LEN: usize = 4;

/// Bytes reserved at the tail of the padded plaintext to carry the
/// original length. Kept inside the padded data itself — at a fixed
/// offset from the end, so decode never needs to know the length to
/// find it — rather than as a separate header ahead of the shard
/// stream: the wire layout stays exactly `(crc ‖ shard)+`, matching
/// what a declared-size table computed from shard math alone predicts.
const LENGTH_SUFFIX_LEN: usize = 8;

impl EccAlgorithm {
    pub fn new(overhead_percent: u32, max_shard_size: usize) -> EccAlgorithm {
        EccAlgorithm {
            overhead_percent,
            max_shard_size,
        }
    }

    /// Derives `(dataShards, parityShards)` from `overheadPercent`.
    ///
    /// Starts from 128 data shards and scales parity with overhead;
    /// when that would leave only a single parity shard the roles
    /// invert so every layout carries at least two parity shards.
    pub fn shard_counts(self) -> (usize, usize) {
        let overhead = self.overhead_percent.max(1);
        let mut data = 128_usize;
        let mut parity = ((128 * overhead as usize) / 100).clamp(1, 128);
        if parity == 1 {
            parity = 2;
            data = (200 / overhead as usize).clamp(128, 254);
        }
        (data, parity)
    }

    fn shard_size(self, plaintext_len: usize) -> usize {
        let (data, _) = self.shard_counts();
        let shard = self.max_shard_size.max(1);
        // Smallest shard size, bounded by max_shard_size, that covers
        // the plaintext plus the trailing length suffix across `data`
        // shards.
        let needed = (plaintext_len + LENGTH_SUFFIX_LEN).div_ceil(data).max(1);
        needed.min(shard).max(1)
    }

    /// The output size [`EccAlgorithm::encode`] produces for a given
    /// plaintext length, computed purely from this algorithm's shard
    /// layout — no separate header is ever added on top of it.
    pub fn encoded_len(self, plaintext_len: usize) -> usize {
        let (data_shards, parity_shards) = self.shard_counts();
        let shard_size = self.shard_size(plaintext_len);
        (data_shards + parity_shards) * (shard_size + CRC_LEN)
    }

    /// Pads `plaintext` to `dataShards * shardSize`, with the original
    /// length stored as a trailing 8-byte field at a fixed offset from
    /// the end of the padded data (not a separate header ahead of the
    /// shards), computes parity shards, and lays the result out as
    /// `(crc ‖ parityShard)+ (crc ‖ dataShard)+`.
    pub fn encode(self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let (data_shards, parity_shards) = self.shard_counts();
        let shard_size = self.shard_size(plaintext.len());
        let padded_len = data_shards * shard_size;
        if plaintext.len() + LENGTH_SUFFIX_LEN > padded_len {
            return Err(EccError::PlaintextExceedsShardCapacity {
                plaintext_len: plaintext.len(),
                capacity: padded_len - LENGTH_SUFFIX_LEN,
            });
        }

        let mut padded = vec![0_u8; padded_len];
        padded[..plaintext.len()].copy_from_slice(plaintext);
        padded[padded_len - LENGTH_SUFFIX_LEN..].copy_from_slice(&(plaintext.len() as u64).to_le_bytes());

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(data_shards + parity_shards);
        for i in 0..data_shards {
            let start = i * shard_size;
            shards.push(padded[start..start + shard_size].to_vec());
        }
        for _ in 0..parity_shards {
            shards.push(vec![0_u8; shard_size]);
        }

        let rs = ReedSolomon::new(data_shards, parity_shards)?;
        rs.encode(&mut shards)?;

        let mut out = Vec::with_capacity((shard_size + CRC_LEN) * shards.len());
        // Parity shards precede data shards in the layout.
        for shard in shards[data_shards..].iter().chain(shards[..data_shards].iter()) {
            let mut crc = Crc32::new();
            crc.update(shard);
            out.extend_from_slice(&crc.finalize().to_le_bytes());
            out.extend_from_slice(shard);
        }
        Ok(out)
    }

    /// Inverse of [`EccAlgorithm::encode`]: verifies every shard's
    /// CRC, reconstructs any that fail, then recovers the original
    /// length from its fixed trailing offset in the reassembled padded
    /// data and trims back to it.
    pub fn decode(self, encoded: &[u8]) -> Result<Vec<u8>> {
        let (data_shards, parity_shards) = self.shard_counts();
        let total = data_shards + parity_shards;
        if encoded.is_empty() || encoded.len() % total != 0 {
            return Err(EccError::Truncated);
        }
        let block = encoded.len() / total;
        if block <= CRC_LEN {
            return Err(EccError::Truncated);
        }
        let shard_size = block - CRC_LEN;

        let mut shards: Vec<Option<Vec<u8>>> = Vec::with_capacity(total);
        let mut erasures = 0_usize;
        for i in 0..total {
            let start = i * block;
            let (crc_bytes, body) = encoded[start..start + block].split_at(CRC_LEN);
            let expected = u32::from_le_bytes(crc_bytes.try_into().unwrap());
            let mut crc = Crc32::new();
            crc.update(body);
            if crc.finalize() == expected {
                shards.push(Some(body.to_vec()));
            } else {
                shards.push(None);
                erasures += 1;
            }
        }
        if erasures > parity_shards {
            return Err(EccError::TooManyErasures {
                parity: parity_shards,
                total,
            });
        }

        // Layout stores parity first, then data; reorder to the
        // (data, parity) order `ReedSolomon` expects.
        let mut ordered: Vec<Option<Vec<u8>>> = Vec::with_capacity(total);
        ordered.extend(shards[parity_shards..].iter().cloned());
        ordered.extend(shards[..parity_shards].iter().cloned());

        if erasures > 0 {
            let rs = ReedSolomon::new(data_shards, parity_shards)?;
            rs.reconstruct(&mut ordered)?;
        }

        let mut padded = Vec::with_capacity(data_shards * shard_size);
        for shard in ordered.iter().take(data_shards) {
            padded.extend_from_slice(shard.as_ref().expect("reconstructed above"));
        }
        if padded.len() < LENGTH_SUFFIX_LEN {
            return Err(EccError::Truncated);
        }
        let split = padded.len() - LENGTH_SUFFIX_LEN;
        let plaintext_len = u64::from_le_bytes(padded[split..].try_into().unwrap()) as usize;
        if plaintext_len > split {
            return Err(EccError::Truncated);
        }
        padded.truncate(plaintext_len);
        Ok(padded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_counts_scale_with_overhead() {
        let algo = EccAlgorithm::new(10, 1 << 20);
        let (data, parity) = algo.shard_counts();
        assert_eq!(data, 128);
        assert_eq!(parity, 12);
    }

    #[test]
    fn shard_counts_invert_at_low_overhead() {
        let algo = EccAlgorithm::new(1, 1 << 20);
        let (data, parity) = algo.shard_counts();
        assert_eq!(parity, 2);
        assert!(data >= 128);
    }

    #[test]
    fn round_trips_without_corruption() {
        let algo = EccAlgorithm::new(10, 256);
        let plaintext = b"round trip me please, reed-solomon".repeat(50);
        let encoded = algo.encode(&plaintext).unwrap();
        let decoded = algo.decode(&encoded).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn reconstructs_corrupted_shards() {
        let algo = EccAlgorithm::new(10, 256);
        let plaintext = b"reed-solomon can survive some bit rot".repeat(50);
        let mut encoded = algo.encode(&plaintext).unwrap();
        // Flip a byte inside the first shard's body, past its CRC
        // header, so the CRC check marks it erased.
        let block = encoded.len() / (128 + 12);
        let victim = CRC_LEN + block / 2;
        encoded[victim] ^= 0xFF;
        let decoded = algo.decode(&encoded).unwrap();
        assert_eq!(decoded, plaintext);
    }

    #[test]
    fn encoded_len_matches_the_declared_size_table() {
        for overhead in [1_u32, 10, 50, 100] {
            for plaintext_len in [0_usize, 1, 255, 4096, 1 << 16] {
                let algo = EccAlgorithm::new(overhead, 4096);
                let plaintext = vec![0_u8; plaintext_len];
                let encoded = algo.encode(&plaintext).unwrap();
                assert_eq!(
                    encoded.len(),
                    algo.encoded_len(plaintext_len),
                    "overhead={overhead} plaintext_len={plaintext_len}"
                );
            }
        }
    }

    #[test]
    fn encode_has_no_separate_length_header() {
        // The wire layout is exactly `(crc ‖ shard)+`: its size must be
        // an exact multiple of one shard block, with nothing extra
        // tacked on before or after.
        let algo = EccAlgorithm::new(10, 256);
        let encoded = algo.encode(b"no header here").unwrap();
        let (data_shards, parity_shards) = algo.shard_counts();
        assert_eq!(encoded.len() % (data_shards + parity_shards), 0);
    }

    #[test]
    fn rejects_plaintext_that_exceeds_shard_capacity() {
        let algo = EccAlgorithm::new(10, 4);
        let (data_shards, _) = algo.shard_counts();
        let plaintext = vec![0_u8; data_shards * 4 + 1];
        let err = algo.encode(&plaintext).unwrap_err();
        assert!(matches!(err, EccError::PlaintextExceedsShardCapacity { .. }));
    }

    #[test]
    fn fails_when_erasures_exceed_parity() {
        let algo = EccAlgorithm::new(10, 256);
        let plaintext = b"x".repeat(4096);
        let mut encoded = algo.encode(&plaintext).unwrap();
        let (_, parity) = algo.shard_counts();
        let block = encoded.len() / (128 + parity);
        for i in 0..=parity {
            let victim = i * block + CRC_LEN + 1;
            encoded[victim] ^= 0xFF;
        }
        let err = algo.decode(&encoded).unwrap_err();
        assert!(matches!(err, EccError::TooManyErasures { .. }));
    }
}
