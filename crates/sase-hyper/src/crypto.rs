//! Packet Sealing
//!
//! AEAD transform run by the crypto workers. Payloads are split into records
//! of at most `chunk_size` plaintext bytes; each record is written as
//! `nonce || ciphertext || tag` and authenticated with its record index.
//!
//! AES-256-GCM is used when the CPU has AES and carry-less multiply,
//! ChaCha20-Poly1305 otherwise.

use crate::caps::Capabilities;
use crate::error::{HyperError, HyperResult};
use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Nonce bytes per record
pub const NONCE_LEN: usize = 12;

/// Tag bytes per record
pub const TAG_LEN: usize = 16;

/// Framing bytes added to every record
pub const RECORD_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Key length for both algorithms
pub const KEY_LEN: usize = 32;

/// Supported AEAD algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoAlgorithm {
    /// AES-256-GCM (hardware AES)
    Aes256Gcm,
    /// ChaCha20-Poly1305 (software)
    ChaCha20Poly1305,
}

impl CryptoAlgorithm {
    /// Pick the algorithm for the detected hardware
    pub fn select(caps: Capabilities, force_software: bool) -> Self {
        if caps.has_hw_aes_gcm() && !force_software {
            CryptoAlgorithm::Aes256Gcm
        } else {
            CryptoAlgorithm::ChaCha20Poly1305
        }
    }

    fn aead(self) -> &'static aead::Algorithm {
        match self {
            CryptoAlgorithm::Aes256Gcm => &aead::AES_256_GCM,
            CryptoAlgorithm::ChaCha20Poly1305 => &aead::CHACHA20_POLY1305,
        }
    }
}

/// Sealed size of `len` plaintext bytes
///
/// An empty payload still produces one (empty) record.
pub fn sealed_len(len: usize, chunk_size: usize) -> usize {
    let records = if len == 0 {
        1
    } else {
        len.div_ceil(chunk_size.max(1))
    };
    len + records * RECORD_OVERHEAD
}

/// Generate a random 256-bit key
pub fn generate_key() -> HyperResult<[u8; KEY_LEN]> {
    let mut key = [0u8; KEY_LEN];
    SystemRandom::new()
        .fill(&mut key)
        .map_err(|_| HyperError::Initialization("system RNG unavailable".into()))?;
    Ok(key)
}

/// Keyed AEAD context shared by all workers
pub struct CryptoContext {
    algorithm: CryptoAlgorithm,
    key: LessSafeKey,
    /// Per-context nonce prefix
    prefix: [u8; 4],
    /// Nonce counter
    counter: AtomicU64,
    bytes_sealed: AtomicU64,
    bytes_opened: AtomicU64,
}

impl CryptoContext {
    /// Create context with a random nonce prefix
    pub fn new(algorithm: CryptoAlgorithm, key: &[u8; KEY_LEN]) -> HyperResult<Self> {
        let mut prefix = [0u8; 4];
        SystemRandom::new()
            .fill(&mut prefix)
            .map_err(|_| HyperError::Initialization("system RNG unavailable".into()))?;
        Self::with_prefix(algorithm, key, prefix)
    }

    /// Create context with an explicit nonce prefix
    ///
    /// Two contexts sharing a key must not share a prefix.
    pub fn with_prefix(
        algorithm: CryptoAlgorithm,
        key: &[u8; KEY_LEN],
        prefix: [u8; 4],
    ) -> HyperResult<Self> {
        let unbound = UnboundKey::new(algorithm.aead(), key)
            .map_err(|_| HyperError::Initialization("invalid AEAD key".into()))?;
        tracing::debug!(?algorithm, "crypto context created");
        Ok(Self {
            algorithm,
            key: LessSafeKey::new(unbound),
            prefix,
            counter: AtomicU64::new(0),
            bytes_sealed: AtomicU64::new(0),
            bytes_opened: AtomicU64::new(0),
        })
    }

    /// Algorithm in use
    pub fn algorithm(&self) -> CryptoAlgorithm {
        self.algorithm
    }

    /// Plaintext bytes sealed so far
    pub fn bytes_sealed(&self) -> u64 {
        self.bytes_sealed.load(Ordering::Relaxed)
    }

    /// Plaintext bytes opened so far
    pub fn bytes_opened(&self) -> u64 {
        self.bytes_opened.load(Ordering::Relaxed)
    }

    /// Next nonce (unique per key)
    #[inline]
    fn next_nonce(&self) -> [u8; NONCE_LEN] {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.prefix);
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Seal `plaintext` into records of at most `chunk_size` bytes
    ///
    /// Fails without partial output when `output_length` is smaller than
    /// [`sealed_len`]. The returned buffer is exactly `sealed_len` bytes.
    pub fn seal(
        &self,
        plaintext: &[u8],
        chunk_size: usize,
        output_length: usize,
    ) -> HyperResult<Vec<u8>> {
        let chunk_size = chunk_size.max(1);
        let required = sealed_len(plaintext.len(), chunk_size);
        if output_length < required {
            return Err(HyperError::TransformFailure(format!(
                "output length {} below sealed size {}",
                output_length, required
            )));
        }

        let mut out = Vec::with_capacity(required);
        let mut seal_record = |index: u32, chunk: &[u8]| -> HyperResult<()> {
            let nonce = self.next_nonce();
            out.extend_from_slice(&nonce);
            let start = out.len();
            out.extend_from_slice(chunk);
            let tag = self
                .key
                .seal_in_place_separate_tag(
                    Nonce::assume_unique_for_key(nonce),
                    Aad::from(index.to_le_bytes()),
                    &mut out[start..],
                )
                .map_err(|_| HyperError::TransformFailure("seal failed".into()))?;
            out.extend_from_slice(tag.as_ref());
            Ok(())
        };

        if plaintext.is_empty() {
            seal_record(0, &[])?;
        } else {
            for (index, chunk) in plaintext.chunks(chunk_size).enumerate() {
                seal_record(index as u32, chunk)?;
            }
        }

        debug_assert_eq!(out.len(), required);
        self.bytes_sealed
            .fetch_add(plaintext.len() as u64, Ordering::Relaxed);
        Ok(out)
    }

    /// Open records produced by [`CryptoContext::seal`] with the same chunk size
    pub fn open(&self, sealed: &[u8], chunk_size: usize) -> HyperResult<Vec<u8>> {
        let chunk_size = chunk_size.max(1);
        if sealed.len() < RECORD_OVERHEAD {
            return Err(HyperError::TransformFailure("truncated record".into()));
        }

        let mut plaintext = Vec::with_capacity(sealed.len());
        let mut record = Vec::with_capacity(chunk_size + TAG_LEN);
        for (index, chunk) in sealed.chunks(chunk_size + RECORD_OVERHEAD).enumerate() {
            if chunk.len() < RECORD_OVERHEAD {
                return Err(HyperError::TransformFailure("truncated record".into()));
            }
            let (nonce, body) = chunk.split_at(NONCE_LEN);
            let nonce = Nonce::try_assume_unique_for_key(nonce)
                .map_err(|_| HyperError::TransformFailure("bad nonce".into()))?;

            record.clear();
            record.extend_from_slice(body);
            let opened = self
                .key
                .open_in_place(nonce, Aad::from((index as u32).to_le_bytes()), &mut record)
                .map_err(|_| HyperError::TransformFailure("authentication failed".into()))?;
            plaintext.extend_from_slice(opened);
        }

        self.bytes_opened
            .fetch_add(plaintext.len() as u64, Ordering::Relaxed);
        Ok(plaintext)
    }
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("algorithm", &self.algorithm)
            .field("bytes_sealed", &self.bytes_sealed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [0x42; KEY_LEN];

    fn context(algorithm: CryptoAlgorithm) -> CryptoContext {
        CryptoContext::with_prefix(algorithm, &KEY, [1, 2, 3, 4]).unwrap()
    }

    #[test]
    fn test_sealed_len() {
        assert_eq!(sealed_len(0, 100), RECORD_OVERHEAD);
        assert_eq!(sealed_len(100, 100), 100 + RECORD_OVERHEAD);
        assert_eq!(sealed_len(101, 100), 101 + 2 * RECORD_OVERHEAD);
    }

    #[test]
    fn test_algorithm_select() {
        let hw = Capabilities::AES | Capabilities::CLMUL;
        assert_eq!(CryptoAlgorithm::select(hw, false), CryptoAlgorithm::Aes256Gcm);
        assert_eq!(
            CryptoAlgorithm::select(hw, true),
            CryptoAlgorithm::ChaCha20Poly1305
        );
        assert_eq!(
            CryptoAlgorithm::select(Capabilities::empty(), false),
            CryptoAlgorithm::ChaCha20Poly1305
        );
    }

    #[test]
    fn test_seal_open_multi_record() {
        for algorithm in [CryptoAlgorithm::Aes256Gcm, CryptoAlgorithm::ChaCha20Poly1305] {
            let ctx = context(algorithm);
            let plaintext: Vec<u8> = (0..250u16).map(|i| i as u8).collect();
            let sealed = ctx.seal(&plaintext, 100, sealed_len(250, 100)).unwrap();

            assert_eq!(sealed.len(), 250 + 3 * RECORD_OVERHEAD);
            assert_ne!(&sealed[NONCE_LEN..NONCE_LEN + 100], &plaintext[..100]);
            assert_eq!(ctx.open(&sealed, 100).unwrap(), plaintext);
            assert_eq!(ctx.bytes_sealed(), 250);
        }
    }

    #[test]
    fn test_empty_payload() {
        let ctx = context(CryptoAlgorithm::ChaCha20Poly1305);
        let sealed = ctx.seal(&[], 64, RECORD_OVERHEAD).unwrap();
        assert_eq!(sealed.len(), RECORD_OVERHEAD);
        assert!(ctx.open(&sealed, 64).unwrap().is_empty());
    }

    #[test]
    fn test_output_too_small() {
        let ctx = context(CryptoAlgorithm::ChaCha20Poly1305);
        let result = ctx.seal(&[0u8; 64], 64, 64);
        assert!(matches!(result, Err(HyperError::TransformFailure(_))));
        assert_eq!(ctx.bytes_sealed(), 0);
    }

    #[test]
    fn test_nonces_unique() {
        let ctx = context(CryptoAlgorithm::ChaCha20Poly1305);
        let a = ctx.seal(b"same", 64, 64).unwrap();
        let b = ctx.seal(b"same", 64, 64).unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tamper_detected() {
        let ctx = context(CryptoAlgorithm::Aes256Gcm);
        let mut sealed = ctx.seal(b"payload bytes", 64, 128).unwrap();
        sealed[NONCE_LEN] ^= 0xff;
        assert!(matches!(
            ctx.open(&sealed, 64),
            Err(HyperError::TransformFailure(_))
        ));
    }

    #[test]
    fn test_reordered_records_rejected() {
        let ctx = context(CryptoAlgorithm::ChaCha20Poly1305);
        let sealed = ctx.seal(&[7u8; 20], 10, 128).unwrap();
        let record = 10 + RECORD_OVERHEAD;
        let mut swapped = sealed[record..].to_vec();
        swapped.extend_from_slice(&sealed[..record]);
        assert!(ctx.open(&swapped, 10).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let ctx = context(CryptoAlgorithm::ChaCha20Poly1305);
        let sealed = ctx.seal(b"secret", 64, 64).unwrap();
        let other =
            CryptoContext::with_prefix(CryptoAlgorithm::ChaCha20Poly1305, &[7; KEY_LEN], [0; 4])
                .unwrap();
        assert!(other.open(&sealed, 64).is_err());
    }
}
