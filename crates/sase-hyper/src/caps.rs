//! Hardware Capability Probe
//!
//! One-time detection of vector and crypto instruction support. The result
//! is cached for the life of the process and decides which copy path the
//! ring uses and which AEAD the crypto pool runs.

use std::sync::OnceLock;

bitflags::bitflags! {
    /// Detected hardware acceleration features
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        /// 128-bit vector unit (SSE2 / NEON)
        const SIMD = 1 << 0;
        /// Hardware AES rounds (AES-NI / ARMv8 AES)
        const AES = 1 << 1;
        /// Carry-less multiply (PCLMULQDQ / PMULL), used by GHASH
        const CLMUL = 1 << 2;
        /// SHA-1 instructions
        const SHA1 = 1 << 3;
        /// SHA-256 instructions
        const SHA2 = 1 << 4;
        /// 256-bit vector unit
        const AVX2 = 1 << 5;
    }
}

static DETECTED: OnceLock<Capabilities> = OnceLock::new();

impl Capabilities {
    /// Detect capabilities of the running CPU.
    ///
    /// The probe runs on first call only; later calls return the cached
    /// descriptor. Missing features simply leave their bit cleared.
    pub fn detect() -> Self {
        *DETECTED.get_or_init(|| {
            let caps = probe();
            tracing::debug!(bits = caps.bits(), features = ?caps.names(), "CPU capabilities detected");
            caps
        })
    }

    /// Vectorized copy is available
    #[inline]
    pub fn has_vector_copy(&self) -> bool {
        self.contains(Capabilities::SIMD)
    }

    /// AES-GCM can run on dedicated instructions
    #[inline]
    pub fn has_hw_aes_gcm(&self) -> bool {
        self.contains(Capabilities::AES | Capabilities::CLMUL)
    }

    /// Feature names, for diagnostics
    pub fn names(&self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

#[cfg(target_arch = "x86_64")]
fn probe() -> Capabilities {
    let mut caps = Capabilities::empty();
    if is_x86_feature_detected!("sse2") {
        caps |= Capabilities::SIMD;
    }
    if is_x86_feature_detected!("avx2") {
        caps |= Capabilities::AVX2;
    }
    if is_x86_feature_detected!("aes") {
        caps |= Capabilities::AES;
    }
    if is_x86_feature_detected!("pclmulqdq") {
        caps |= Capabilities::CLMUL;
    }
    if is_x86_feature_detected!("sha") {
        caps |= Capabilities::SHA1 | Capabilities::SHA2;
    }
    caps
}

#[cfg(target_arch = "aarch64")]
fn probe() -> Capabilities {
    use std::arch::is_aarch64_feature_detected;

    let mut caps = Capabilities::empty();
    if is_aarch64_feature_detected!("neon") {
        caps |= Capabilities::SIMD;
    }
    if is_aarch64_feature_detected!("aes") {
        caps |= Capabilities::AES;
    }
    if is_aarch64_feature_detected!("pmull") {
        caps |= Capabilities::CLMUL;
    }
    // FEAT_SHA2 implies FEAT_SHA1
    if is_aarch64_feature_detected!("sha2") {
        caps |= Capabilities::SHA1 | Capabilities::SHA2;
    }
    caps
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn probe() -> Capabilities {
    Capabilities::empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_is_cached() {
        let first = Capabilities::detect();
        let second = Capabilities::detect();
        assert_eq!(first, second);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_x86_64_has_simd() {
        // SSE2 is part of the x86_64 baseline
        assert!(Capabilities::detect().has_vector_copy());
    }

    #[test]
    fn test_hw_aes_needs_clmul() {
        assert!(!Capabilities::AES.has_hw_aes_gcm());
        assert!((Capabilities::AES | Capabilities::CLMUL).has_hw_aes_gcm());
    }

    #[test]
    fn test_names() {
        let caps = Capabilities::SIMD | Capabilities::SHA2;
        assert_eq!(caps.names(), vec!["SIMD", "SHA2"]);
        assert!(Capabilities::empty().names().is_empty());
    }
}
