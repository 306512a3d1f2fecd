//! Pipeline Event Listener
//!
//! Optional callbacks for burst level changes and sealed packets. Callbacks
//! run on the thread that produced the event (the caller of `observe` or a
//! crypto worker), after internal locks are dropped, so they must be cheap.

use crate::burst::BurstLevel;
use crate::ring::SlotHandle;
use parking_lot::RwLock;
use std::sync::Arc;

/// Receiver of pipeline events
pub trait PipelineListener: Send + Sync {
    /// The burst level changed, either from a sample or from a hint
    fn on_burst_level(&self, level: BurstLevel) {
        let _ = level;
    }

    /// A crypto job sealed `slot` into `sealed_bytes` of output
    fn on_packet_processed(&self, slot: SlotHandle, sealed_bytes: usize) {
        let _ = (slot, sealed_bytes);
    }
}

/// Replaceable listener registration
#[derive(Default)]
pub(crate) struct ListenerCell(RwLock<Option<Arc<dyn PipelineListener>>>);

impl ListenerCell {
    pub(crate) fn set(&self, listener: Option<Arc<dyn PipelineListener>>) {
        *self.0.write() = listener;
    }

    #[inline]
    pub(crate) fn get(&self) -> Option<Arc<dyn PipelineListener>> {
        self.0.read().clone()
    }
}

impl std::fmt::Debug for ListenerCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ListenerCell")
            .field(&self.0.read().is_some())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Listener that records every event it sees
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub(crate) levels: Mutex<Vec<BurstLevel>>,
        pub(crate) processed: Mutex<Vec<(SlotHandle, usize)>>,
    }

    impl PipelineListener for Recorder {
        fn on_burst_level(&self, level: BurstLevel) {
            self.levels.lock().push(level);
        }

        fn on_packet_processed(&self, slot: SlotHandle, sealed_bytes: usize) {
            self.processed.lock().push((slot, sealed_bytes));
        }
    }

    struct Silent;

    impl PipelineListener for Silent {}

    #[test]
    fn test_cell_replace_and_clear() {
        let cell = ListenerCell::default();
        assert!(cell.get().is_none());

        let recorder = Arc::new(Recorder::default());
        cell.set(Some(recorder.clone()));
        if let Some(listener) = cell.get() {
            listener.on_burst_level(BurstLevel::Burst);
        }
        assert_eq!(*recorder.levels.lock(), vec![BurstLevel::Burst]);

        // Default methods ignore events
        cell.set(Some(Arc::new(Silent)));
        if let Some(listener) = cell.get() {
            listener.on_burst_level(BurstLevel::Idle);
        }
        assert_eq!(recorder.levels.lock().len(), 1);

        cell.set(None);
        assert!(cell.get().is_none());
    }
}
