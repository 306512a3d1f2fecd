//! Burst Tracker
//!
//! Keeps short moving averages of receive and transmit throughput and turns
//! the current rate into a discrete burst level. The level is a pacing hint
//! only; nothing in the data path depends on it for correctness.
//!
//! The sampling side takes a short lock; the level itself is published
//! through an atomic so any thread can read it without contention.

use crate::config::BurstConfig;
use crate::error::HyperResult;
use crate::listener::{ListenerCell, PipelineListener};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Discrete traffic intensity
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BurstLevel {
    /// Below the idle floor
    Idle = 0,
    /// Around the baseline
    Normal = 1,
    /// Noticeably above the baseline
    Elevated = 2,
    /// Above baseline × burst multiplier
    Burst = 3,
}

impl BurstLevel {
    #[inline]
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BurstLevel::Normal,
            2 => BurstLevel::Elevated,
            3 => BurstLevel::Burst,
            _ => BurstLevel::Idle,
        }
    }

    /// Batch size multiplier for this level
    pub fn batch_scale(self) -> f64 {
        match self {
            BurstLevel::Idle => 0.5,
            BurstLevel::Normal => 1.0,
            BurstLevel::Elevated => 1.5,
            BurstLevel::Burst => 2.0,
        }
    }
}

/// Bytes moved since the previous observation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficDelta {
    /// Received bytes
    pub rx_bytes: u64,
    /// Transmitted bytes
    pub tx_bytes: u64,
}

impl TrafficDelta {
    /// Delta with both directions set
    pub fn new(rx_bytes: u64, tx_bytes: u64) -> Self {
        Self { rx_bytes, tx_bytes }
    }
}

/// Fixed-size moving average of rates (bytes/sec)
#[derive(Debug)]
struct RateWindow {
    samples: VecDeque<f64>,
    sum: f64,
    size: usize,
}

impl RateWindow {
    fn new(size: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(size),
            sum: 0.0,
            size,
        }
    }

    fn baseline(&self) -> Option<f64> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.sum / self.samples.len() as f64)
        }
    }

    fn push(&mut self, rate: f64) {
        if self.samples.len() == self.size {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(rate);
        self.sum += rate;
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }
}

#[derive(Debug)]
struct TrackerState {
    rx: RateWindow,
    tx: RateWindow,
    /// Timestamp of the last rate sample; None until the clock is anchored
    last_ns: Option<u64>,
    /// Bytes observed with no elapsed time, folded into the next sample
    pending: TrafficDelta,
}

/// Moving-average burst detector
#[derive(Debug)]
pub struct BurstTracker {
    config: BurstConfig,
    state: Mutex<TrackerState>,
    level: AtomicU8,
    listener: ListenerCell,
}

impl BurstTracker {
    /// Create tracker; the window size is fixed for its lifetime
    pub fn new(config: BurstConfig) -> HyperResult<Self> {
        config.validate()?;
        let state = TrackerState {
            rx: RateWindow::new(config.window),
            tx: RateWindow::new(config.window),
            last_ns: None,
            pending: TrafficDelta::default(),
        };
        Ok(Self {
            config,
            state: Mutex::new(state),
            level: AtomicU8::new(BurstLevel::Idle as u8),
            listener: ListenerCell::default(),
        })
    }

    /// Tuning in effect
    pub fn config(&self) -> &BurstConfig {
        &self.config
    }

    /// Register or clear the listener notified on level changes
    pub fn set_listener(&self, listener: Option<Arc<dyn PipelineListener>>) {
        self.listener.set(listener);
    }

    /// Record traffic moved up to `timestamp_ns` and return the new level
    ///
    /// The first call anchors the clock. Its bytes are kept and counted in
    /// the first rate sample.
    pub fn observe(&self, delta: TrafficDelta, timestamp_ns: u64) -> BurstLevel {
        let mut state = self.state.lock();

        let Some(last_ns) = state.last_ns else {
            state.last_ns = Some(timestamp_ns);
            state.pending = delta;
            return self.level();
        };

        state.pending.rx_bytes = state.pending.rx_bytes.saturating_add(delta.rx_bytes);
        state.pending.tx_bytes = state.pending.tx_bytes.saturating_add(delta.tx_bytes);
        if timestamp_ns <= last_ns {
            return self.level();
        }

        let elapsed = (timestamp_ns - last_ns) as f64 / 1_000_000_000.0;
        let rx_rate = state.pending.rx_bytes as f64 / elapsed;
        let tx_rate = state.pending.tx_bytes as f64 / elapsed;
        state.last_ns = Some(timestamp_ns);
        state.pending = TrafficDelta::default();

        let rx_level = self.classify(rx_rate, state.rx.baseline());
        let tx_level = self.classify(tx_rate, state.tx.baseline());
        state.rx.push(rx_rate);
        state.tx.push(tx_rate);

        let level = rx_level.max(tx_level);
        let previous = BurstLevel::from_u8(self.level.swap(level as u8, Ordering::AcqRel));
        drop(state);
        if previous != level {
            tracing::debug!(?previous, ?level, rx_rate, tx_rate, "burst level changed");
            self.notify(level);
        }
        level
    }

    /// Override the level with an external hint
    ///
    /// The hint holds until the next rate sample reclassifies traffic.
    pub fn submit_hint(&self, level: BurstLevel) {
        let previous = BurstLevel::from_u8(self.level.swap(level as u8, Ordering::AcqRel));
        if previous != level {
            tracing::debug!(?previous, ?level, "burst level hinted");
            self.notify(level);
        }
    }

    fn notify(&self, level: BurstLevel) {
        if let Some(listener) = self.listener.get() {
            listener.on_burst_level(level);
        }
    }

    fn classify(&self, rate: f64, baseline: Option<f64>) -> BurstLevel {
        if rate < self.config.idle_floor_bps {
            return BurstLevel::Idle;
        }
        match baseline {
            None => BurstLevel::Normal,
            Some(base) if rate > base * self.config.multiplier => BurstLevel::Burst,
            Some(base) if rate > base * self.config.elevated_multiplier => BurstLevel::Elevated,
            Some(_) => BurstLevel::Normal,
        }
    }

    /// Latest level
    #[inline]
    pub fn level(&self) -> BurstLevel {
        BurstLevel::from_u8(self.level.load(Ordering::Acquire))
    }

    /// Receive baseline (bytes/sec), undefined until the first sample
    pub fn rx_baseline(&self) -> Option<f64> {
        self.state.lock().rx.baseline()
    }

    /// Transmit baseline (bytes/sec), undefined until the first sample
    pub fn tx_baseline(&self) -> Option<f64> {
        self.state.lock().tx.baseline()
    }

    /// Clear all samples; level returns to Idle
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.rx.clear();
        state.tx.clear();
        state.last_ns = None;
        state.pending = TrafficDelta::default();
        let previous = self.level.swap(BurstLevel::Idle as u8, Ordering::AcqRel);
        drop(state);
        if previous != BurstLevel::Idle as u8 {
            self.notify(BurstLevel::Idle);
        }
    }
}
