//! OpenSASE Hyper Data Plane
//!
//! Packet ring transport with offloaded AEAD sealing and burst-aware pacing.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        HYPER PIPELINE                            │
//! │                                                                  │
//! │  ingest ──► ┌──────────────────────┐ ──► read ──► seal           │
//! │             │     PacketRing       │               │             │
//! │             │ N × 64B-aligned slots│               ▼             │
//! │             │ Free→Filled→InFlight │      ┌─────────────────┐    │
//! │             │    →Processed→Free   │      │   CryptoPool    │    │
//! │             └──────────────────────┘      │ hyper-crypto-0  │    │
//! │                        ▲                  │ hyper-crypto-1  │    │
//! │                        │ release          │      ...        │    │
//! │                        │                  └────────┬────────┘    │
//! │                        └──── wait / take_output ◄──┘             │
//! │                                                                  │
//! │  rx/tx deltas ──► BurstTracker ──► next_batch_size               │
//! │  PipelineListener ◄── level changes, sealed packets              │
//! │  Capabilities::detect() ──► copy path + AEAD selection           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Properties
//!
//! 1. **Zero-copy handoff**: slots are written once, consumers and workers
//!    borrow them in place
//! 2. **Generation handles**: recycled slots and jobs reject stale handles
//! 3. **Bounded waits**: job completion waits on a condition variable, never
//!    spins
//! 4. **Snapshot config**: batch and chunk sizes swap atomically under load

#![warn(missing_docs)]

pub mod burst;
pub mod caps;
pub mod config;
pub mod crypto;
pub mod error;
pub mod listener;
pub mod pipeline;
pub mod pool;
pub mod ring;
pub mod stats;

pub use burst::{BurstLevel, BurstTracker, TrafficDelta};
pub use caps::Capabilities;
pub use config::{BackPressure, BurstConfig, ConfigStore, PipelineConfig, PipelineFlags};
pub use crypto::{sealed_len, CryptoAlgorithm, CryptoContext};
pub use error::{HyperError, HyperResult};
pub use listener::PipelineListener;
pub use pipeline::Pipeline;
pub use pool::{CryptoPool, JobHandle, JobState, WaitStatus};
pub use ring::{CopyPath, PacketHeader, PacketMeta, PacketRing, SlotHandle, SlotState, SlotView};
pub use stats::{PipelineStats, PipelineStatsSnapshot, WorkerStatsSnapshot};
