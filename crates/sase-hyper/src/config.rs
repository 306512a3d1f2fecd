//! Pipeline Configuration
//!
//! Immutable configuration snapshots. Updates replace the whole snapshot
//! atomically, so readers on the hot path always observe a consistent
//! bundle without taking a lock.
//!
//! Ring capacity, payload size, worker count, burst tuning, the two
//! `FORCE_*` flags and `PIN_WORKERS` are structural: they are read once when
//! the pipeline is built. Batch size, chunk size and `ADAPTIVE_BATCH` are re-read on every
//! cycle.

use crate::error::{HyperError, HyperResult};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default ring capacity (slots)
pub const DEFAULT_RING_CAPACITY: usize = 1024;

/// Default slot payload size
pub const DEFAULT_PAYLOAD_SIZE: usize = 2048;

/// Default packets per ingestion batch
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Default AEAD record size (one MTU)
pub const DEFAULT_CHUNK_SIZE: usize = 1500;

bitflags::bitflags! {
    /// Behavior flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct PipelineFlags: u32 {
        /// Use the scalar copy path even when SIMD is available
        const FORCE_SCALAR_COPY = 1 << 0;
        /// Use ChaCha20-Poly1305 even when hardware AES is available
        const FORCE_SOFTWARE_CRYPTO = 1 << 1;
        /// Scale ingestion batches with the burst level
        const ADAPTIVE_BATCH = 1 << 2;
        /// Pin crypto worker `i` to core `i % cores` (Linux only)
        const PIN_WORKERS = 1 << 3;
    }
}

impl PipelineFlags {
    /// Flags read once at construction
    pub const STRUCTURAL: Self = Self::FORCE_SCALAR_COPY
        .union(Self::FORCE_SOFTWARE_CRYPTO)
        .union(Self::PIN_WORKERS);
}

/// Behavior when the ring is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackPressure {
    /// Reject the newest packet immediately
    #[default]
    Drop,
    /// Wait up to `timeout_ms` for a slot to be released
    Block { timeout_ms: u64 },
}

impl BackPressure {
    /// Block timeout, if any
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            BackPressure::Drop => None,
            BackPressure::Block { timeout_ms } => Some(Duration::from_millis(*timeout_ms)),
        }
    }
}

/// Burst tracker tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BurstConfig {
    /// Moving-average window (samples)
    pub window: usize,
    /// Rate above baseline × multiplier is a burst
    pub multiplier: f64,
    /// Rate above baseline × this is elevated
    pub elevated_multiplier: f64,
    /// Rates below this (bytes/sec) are idle
    pub idle_floor_bps: f64,
}

impl Default for BurstConfig {
    fn default() -> Self {
        Self {
            window: 10,
            multiplier: 3.0,
            elevated_multiplier: 1.5,
            idle_floor_bps: 1024.0,
        }
    }
}

impl BurstConfig {
    /// Check tuning values
    pub fn validate(&self) -> HyperResult<()> {
        if self.window == 0 {
            return Err(HyperError::Initialization("burst window must be positive".into()));
        }
        if !(self.elevated_multiplier >= 1.0 && self.multiplier > self.elevated_multiplier) {
            return Err(HyperError::Initialization(format!(
                "burst multipliers must satisfy 1 <= elevated ({}) < burst ({})",
                self.elevated_multiplier, self.multiplier
            )));
        }
        if !(self.idle_floor_bps >= 0.0) {
            return Err(HyperError::Initialization("idle floor must be non-negative".into()));
        }
        Ok(())
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of ring slots (power of two)
    pub ring_capacity: usize,
    /// Bytes per slot payload region
    pub payload_size: usize,
    /// Packets per ingestion batch
    pub batch_size: usize,
    /// Maximum plaintext bytes per sealed record
    pub chunk_size: usize,
    /// Crypto worker threads
    pub worker_count: usize,
    /// Full-ring policy
    pub back_pressure: BackPressure,
    /// Behavior flags
    pub flags: PipelineFlags,
    /// Burst tracker tuning
    pub burst: BurstConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            payload_size: DEFAULT_PAYLOAD_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            worker_count: num_cpus(),
            back_pressure: BackPressure::default(),
            flags: PipelineFlags::empty(),
            burst: BurstConfig::default(),
        }
    }
}

/// Get number of CPUs
fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl PipelineConfig {
    /// Parse from JSON host settings, filling missing fields with defaults
    pub fn from_json(json: &str) -> HyperResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| HyperError::Initialization(format!("config parse: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check all values are usable
    pub fn validate(&self) -> HyperResult<()> {
        if self.ring_capacity == 0 || !self.ring_capacity.is_power_of_two() {
            return Err(HyperError::Initialization(format!(
                "ring capacity {} is not a positive power of two",
                self.ring_capacity
            )));
        }
        if self.payload_size == 0 {
            return Err(HyperError::Initialization("payload size must be positive".into()));
        }
        if self.batch_size == 0 {
            return Err(HyperError::Initialization("batch size must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(HyperError::Initialization("chunk size must be positive".into()));
        }
        if self.worker_count == 0 {
            return Err(HyperError::Initialization("worker count must be positive".into()));
        }

        self.burst.validate()
    }
}

/// Lock-free configuration store with atomic snapshot swap
pub struct ConfigStore {
    current: ArcSwap<PipelineConfig>,
    version: AtomicU64,
}

impl ConfigStore {
    /// Create store from a validated config
    pub fn new(config: PipelineConfig) -> HyperResult<Self> {
        config.validate()?;
        Ok(Self {
            current: ArcSwap::from_pointee(config),
            version: AtomicU64::new(1),
        })
    }

    /// Current snapshot
    #[inline]
    pub fn current(&self) -> Arc<PipelineConfig> {
        self.current.load_full()
    }

    /// Current batch size without cloning the snapshot
    #[inline]
    pub fn batch_size(&self) -> usize {
        self.current.load().batch_size
    }

    /// Current chunk size without cloning the snapshot
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.current.load().chunk_size
    }

    /// Current flags
    #[inline]
    pub fn flags(&self) -> PipelineFlags {
        self.current.load().flags
    }

    /// Snapshot version, bumped on every apply
    #[inline(always)]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Atomically replace the configuration
    ///
    /// Structural fields are only read at construction; changing them here
    /// has no effect on a running pipeline.
    pub fn apply(&self, config: PipelineConfig) -> HyperResult<u64> {
        config.validate()?;

        let old = self.current.load();
        if old.ring_capacity != config.ring_capacity
            || old.payload_size != config.payload_size
            || old.worker_count != config.worker_count
            || old.burst != config.burst
            || (old.flags ^ config.flags).intersects(PipelineFlags::STRUCTURAL)
        {
            tracing::warn!("structural config change ignored until pipeline rebuild");
        }

        tracing::info!(
            batch_size = config.batch_size,
            chunk_size = config.chunk_size,
            flags = config.flags.bits(),
            "pipeline configured"
        );
        self.current.store(Arc::new(config));
        Ok(self.version.fetch_add(1, Ordering::AcqRel) + 1)
    }
}
