//! Hyper Pipeline
//!
//! Owns one ring, one crypto pool and one burst tracker built from a single
//! configuration.
//!
//! ```text
//! ingest ──► PacketRing ──► read ──► seal ──► CryptoPool ──► wait/take_output
//!               │                                 ▲
//!               └── rx bytes ──► BurstTracker ────┘ next_batch_size
//! ```

use crate::burst::{BurstLevel, BurstTracker, TrafficDelta};
use crate::caps::Capabilities;
use crate::config::{ConfigStore, PipelineConfig, PipelineFlags};
use crate::crypto::{CryptoAlgorithm, CryptoContext, KEY_LEN};
use crate::error::{HyperError, HyperResult};
use crate::listener::PipelineListener;
use crate::pool::{CryptoPool, JobHandle};
use crate::ring::{CopyPath, PacketHeader, PacketRing, SlotHandle};
use crate::stats::{PipelineStats, PipelineStatsSnapshot, WorkerStatsSnapshot};
use std::sync::Arc;

/// Packet transport and crypto offload pipeline
pub struct Pipeline {
    config: Arc<ConfigStore>,
    caps: Capabilities,
    ring: Arc<PacketRing>,
    pool: CryptoPool,
    burst: BurstTracker,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Build pipeline for the running CPU and start its workers
    pub fn new(config: PipelineConfig, key: &[u8; KEY_LEN]) -> HyperResult<Self> {
        Self::with_capabilities(config, key, Capabilities::detect())
    }

    /// Build pipeline for an explicit capability descriptor
    pub fn with_capabilities(
        config: PipelineConfig,
        key: &[u8; KEY_LEN],
        caps: Capabilities,
    ) -> HyperResult<Self> {
        config.validate()?;

        let copy_path = CopyPath::select(caps, config.flags.contains(PipelineFlags::FORCE_SCALAR_COPY));
        let ring = Arc::new(PacketRing::with_policy(
            config.ring_capacity,
            config.payload_size,
            config.back_pressure,
            copy_path,
        )?);

        let algorithm = CryptoAlgorithm::select(
            caps,
            config.flags.contains(PipelineFlags::FORCE_SOFTWARE_CRYPTO),
        );
        let context = CryptoContext::new(algorithm, key)?;
        let burst = BurstTracker::new(config.burst.clone())?;

        let config = Arc::new(ConfigStore::new(config)?);
        let stats = Arc::new(PipelineStats::default());
        let pool = CryptoPool::new(ring.clone(), context, config.clone(), stats.clone())?;
        pool.start()?;

        tracing::info!(
            capacity = ring.capacity(),
            payload_size = ring.payload_size(),
            ?copy_path,
            ?algorithm,
            workers = pool.worker_count(),
            "hyper pipeline ready"
        );

        Ok(Self {
            config,
            caps,
            ring,
            pool,
            burst,
            stats,
        })
    }

    /// Write a packet into the ring
    ///
    /// Drops and block timeouts are counted before the error is returned.
    pub fn ingest(&self, payload: &[u8], header: PacketHeader) -> HyperResult<SlotHandle> {
        match self.ring.push(payload, header) {
            Ok(handle) => {
                self.stats.record_rx(payload.len() as u64);
                Ok(handle)
            }
            Err(e) => {
                match e {
                    HyperError::CapacityExceeded => self.stats.record_drop(),
                    HyperError::Timeout => self.stats.record_write_timeout(),
                    _ => {}
                }
                Err(e)
            }
        }
    }

    /// Take the next packet from the ring
    #[inline]
    pub fn read(&self) -> Option<SlotHandle> {
        self.ring.read()
    }

    /// Return a slot to the ring
    #[inline]
    pub fn release(&self, slot: SlotHandle) -> HyperResult<()> {
        self.ring.release(slot)
    }

    /// Queue a read slot for sealing, sizing the output for its payload
    #[inline]
    pub fn seal(&self, slot: SlotHandle) -> HyperResult<JobHandle> {
        self.pool.submit_sized(slot)
    }

    /// Feed a traffic sample to the burst tracker
    pub fn observe(&self, delta: TrafficDelta, timestamp_ns: u64) -> BurstLevel {
        self.burst.observe(delta, timestamp_ns)
    }

    /// Override the burst level until the next traffic sample
    pub fn submit_burst_hint(&self, level: BurstLevel) {
        self.burst.submit_hint(level);
    }

    /// Register or clear the listener for burst changes and sealed packets
    pub fn set_listener(&self, listener: Option<Arc<dyn PipelineListener>>) {
        self.burst.set_listener(listener.clone());
        self.pool.set_listener(listener);
    }

    /// Current burst level
    #[inline]
    pub fn burst_level(&self) -> BurstLevel {
        self.burst.level()
    }

    /// Packets to take in the next ingestion cycle
    ///
    /// With `ADAPTIVE_BATCH` the configured batch size is scaled by the burst
    /// level, never below one packet nor above the ring capacity.
    pub fn next_batch_size(&self) -> usize {
        let config = self.config.current();
        if !config.flags.contains(PipelineFlags::ADAPTIVE_BATCH) {
            return config.batch_size;
        }
        let scaled = (config.batch_size as f64 * self.burst.level().batch_scale()).round() as usize;
        scaled.clamp(1, self.ring.capacity())
    }

    /// Swap in a new configuration; returns the new version
    pub fn configure(&self, config: PipelineConfig) -> HyperResult<u64> {
        self.config.apply(config)
    }

    /// Active configuration snapshot
    pub fn config(&self) -> Arc<PipelineConfig> {
        self.config.current()
    }

    /// Capability descriptor the pipeline was built for
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Packet ring
    pub fn ring(&self) -> &Arc<PacketRing> {
        &self.ring
    }

    /// Crypto pool
    pub fn pool(&self) -> &CryptoPool {
        &self.pool
    }

    /// Burst tracker
    pub fn burst(&self) -> &BurstTracker {
        &self.burst
    }

    /// Counter snapshot
    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Per-worker counters
    pub fn worker_stats(&self) -> Vec<WorkerStatsSnapshot> {
        self.pool.worker_stats()
    }

    /// Stop the crypto workers; queued jobs fail with `PoolShutdown`
    pub fn shutdown(&self) {
        self.pool.shutdown();
        tracing::info!("hyper pipeline stopped");
    }
}
