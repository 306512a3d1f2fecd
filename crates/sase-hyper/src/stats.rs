//! Pipeline Statistics
//!
//! Lock-free counters for the ingestion path and the crypto pool. Every
//! update is mirrored to the `metrics` facade; without an installed
//! recorder that is a no-op.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline-wide counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct PipelineStats {
    /// Packets written into the ring
    pub rx_packets: AtomicU64,
    /// Payload bytes written into the ring
    pub rx_bytes: AtomicU64,
    /// Packets rejected by the drop policy
    pub dropped: AtomicU64,
    /// Packets rejected after a blocking write timed out
    pub write_timeouts: AtomicU64,
    /// Jobs accepted by the crypto pool
    pub jobs_submitted: AtomicU64,
    /// Jobs sealed successfully
    pub jobs_completed: AtomicU64,
    /// Jobs that failed, timed out in the queue or hit shutdown
    pub jobs_failed: AtomicU64,
    /// Jobs released before a worker started them
    pub jobs_cancelled: AtomicU64,
    /// Sealed output bytes
    pub sealed_bytes: AtomicU64,
}

impl PipelineStats {
    /// Count a packet written into the ring
    #[inline(always)]
    pub fn record_rx(&self, bytes: u64) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        metrics::counter!("hyper_rx_packets_total").increment(1);
        metrics::counter!("hyper_rx_bytes_total").increment(bytes);
    }

    /// Count a packet dropped on a full ring
    #[inline(always)]
    pub fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hyper_dropped_total").increment(1);
    }

    /// Count a blocking write that gave up
    #[inline(always)]
    pub fn record_write_timeout(&self) {
        self.write_timeouts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hyper_write_timeouts_total").increment(1);
    }

    /// Count an accepted job
    #[inline(always)]
    pub fn record_submit(&self) {
        self.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hyper_jobs_submitted_total").increment(1);
    }

    /// Count a sealed job and its output size
    #[inline(always)]
    pub fn record_complete(&self, sealed_bytes: u64) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.sealed_bytes.fetch_add(sealed_bytes, Ordering::Relaxed);
        metrics::counter!("hyper_jobs_completed_total").increment(1);
        metrics::counter!("hyper_sealed_bytes_total").increment(sealed_bytes);
    }

    /// Count a job that ended without output
    #[inline(always)]
    pub fn record_failure(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hyper_jobs_failed_total").increment(1);
    }

    /// Count a job cancelled by release
    #[inline(always)]
    pub fn record_cancel(&self) {
        self.jobs_cancelled.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("hyper_jobs_cancelled_total").increment(1);
    }

    /// Get statistics snapshot
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            write_timeouts: self.write_timeouts.load(Ordering::Relaxed),
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_cancelled: self.jobs_cancelled.load(Ordering::Relaxed),
            sealed_bytes: self.sealed_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStatsSnapshot {
    /// Packets written into the ring
    pub rx_packets: u64,
    /// Payload bytes written into the ring
    pub rx_bytes: u64,
    /// Packets rejected by the drop policy
    pub dropped: u64,
    /// Packets rejected after a blocking write timed out
    pub write_timeouts: u64,
    /// Jobs accepted by the crypto pool
    pub jobs_submitted: u64,
    /// Jobs sealed successfully
    pub jobs_completed: u64,
    /// Jobs that ended without output
    pub jobs_failed: u64,
    /// Jobs cancelled before starting
    pub jobs_cancelled: u64,
    /// Sealed output bytes
    pub sealed_bytes: u64,
}

impl PipelineStatsSnapshot {
    /// Fraction of offered packets that were dropped
    pub fn drop_rate(&self) -> f64 {
        let offered = self.rx_packets + self.dropped + self.write_timeouts;
        if offered == 0 {
            return 0.0;
        }
        (self.dropped + self.write_timeouts) as f64 / offered as f64
    }

    /// Jobs submitted but not yet finished
    pub fn jobs_pending(&self) -> u64 {
        self.jobs_submitted
            .saturating_sub(self.jobs_completed + self.jobs_failed + self.jobs_cancelled)
    }
}

/// Worker-local counters, written only by the owning worker
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Jobs sealed by this worker
    pub processed: AtomicU64,
    /// Plaintext bytes sealed by this worker
    pub total_bytes: AtomicU64,
    /// Capture timestamp of the last sealed packet
    pub last_timestamp_ns: AtomicU64,
    /// Pinned core + 1; zero when the worker is not pinned
    pinned_core: AtomicU64,
}

impl WorkerStats {
    /// Count a sealed packet
    #[inline(always)]
    pub fn record(&self, bytes: u64, timestamp_ns: u64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.last_timestamp_ns.store(timestamp_ns, Ordering::Relaxed);
    }

    /// Record the core the worker thread is bound to
    pub fn record_pinned(&self, core: usize) {
        self.pinned_core.store(core as u64 + 1, Ordering::Release);
    }

    /// Get snapshot for `worker_id`
    pub fn snapshot(&self, worker_id: usize) -> WorkerStatsSnapshot {
        let pinned = self.pinned_core.load(Ordering::Acquire);
        WorkerStatsSnapshot {
            worker_id,
            processed: self.processed.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            last_timestamp_ns: self.last_timestamp_ns.load(Ordering::Relaxed),
            pinned_core: pinned.checked_sub(1).map(|core| core as usize),
        }
    }
}

/// Worker snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    /// Worker index
    pub worker_id: usize,
    /// Jobs sealed
    pub processed: u64,
    /// Plaintext bytes sealed
    pub total_bytes: u64,
    /// Capture timestamp of the last sealed packet
    pub last_timestamp_ns: u64,
    /// Core the worker is pinned to
    pub pinned_core: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_stats() {
        let stats = PipelineStats::default();
        stats.record_rx(100);
        stats.record_rx(200);
        stats.record_drop();
        stats.record_submit();
        stats.record_submit();
        stats.record_complete(128);

        let snap = stats.snapshot();
        assert_eq!(snap.rx_packets, 2);
        assert_eq!(snap.rx_bytes, 300);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.sealed_bytes, 128);
        assert_eq!(snap.jobs_pending(), 1);
        assert!((snap.drop_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::default();
        stats.record(64, 10);
        stats.record(36, 20);

        let snap = stats.snapshot(3);
        assert_eq!(snap.worker_id, 3);
        assert_eq!(snap.processed, 2);
        assert_eq!(snap.total_bytes, 100);
        assert_eq!(snap.last_timestamp_ns, 20);
        assert_eq!(snap.pinned_core, None);

        stats.record_pinned(0);
        assert_eq!(stats.snapshot(3).pinned_core, Some(0));
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_string(&PipelineStatsSnapshot::default()).unwrap();
        assert!(json.contains("\"jobs_completed\":0"));
    }
}
