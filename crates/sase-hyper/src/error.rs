//! Error types for the hyper data plane

use thiserror::Error;

/// Hyper data plane error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HyperError {
    /// Invalid construction parameters; nothing was created
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Write rejected by the back-pressure policy
    #[error("ring capacity exceeded")]
    CapacityExceeded,

    /// Handle refers to a slot or job that has since been recycled
    #[error("stale handle")]
    StaleHandle,

    /// Crypto transform failed, job marked failed
    #[error("transform failure: {0}")]
    TransformFailure(String),

    /// Bounded wait expired
    #[error("timed out")]
    Timeout,

    /// Packet larger than the slot payload region
    #[error("payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Offset/length outside of the source buffer
    #[error("invalid range: offset {offset} + length {length} > {available}")]
    InvalidRange {
        offset: usize,
        length: usize,
        available: usize,
    },

    /// Slot is pinned by a reader or a pending job
    #[error("slot busy")]
    SlotBusy,

    /// Slot is not in a state that allows the operation
    #[error("invalid slot state: {0}")]
    InvalidSlotState(&'static str),

    /// Job is running and cannot be released
    #[error("job running")]
    JobRunning,

    /// Job output requested before completion
    #[error("job not ready")]
    JobNotReady,

    /// Worker pool has been shut down
    #[error("pool shut down")]
    PoolShutdown,
}

impl HyperError {
    /// Whether the caller may retry the same operation later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HyperError::CapacityExceeded
                | HyperError::Timeout
                | HyperError::SlotBusy
                | HyperError::JobRunning
                | HyperError::JobNotReady
        )
    }
}

/// Result type for the hyper data plane
pub type HyperResult<T> = Result<T, HyperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable() {
        assert!(HyperError::CapacityExceeded.is_recoverable());
        assert!(HyperError::Timeout.is_recoverable());
        assert!(!HyperError::StaleHandle.is_recoverable());
        assert!(!HyperError::TransformFailure("x".into()).is_recoverable());
    }

    #[test]
    fn test_display() {
        let err = HyperError::PayloadTooLarge { len: 32, max: 16 };
        assert_eq!(err.to_string(), "payload too large: 32 > 16");
    }
}
