use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::CaseId;
use crate::queue::OpId;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// What the engine tells the UI layer. Transient retry failures never show
/// up here; only offline fallbacks and terminal sync outcomes do.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// A mutation could not reach the backend and was queued locally.
    OfflineFallback { case_id: CaseId, op_id: OpId },
    /// A queued mutation was committed to the backend.
    SyncSuccess { case_id: CaseId, op_id: OpId },
    /// A queued mutation exhausted its options and was dead-lettered.
    SyncFailure { case_id: CaseId, op_id: OpId },
    /// The owning case now requires operator-triggered resync.
    NeedsManualResync { case_id: CaseId },
}

impl EngineEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::OfflineFallback { .. } => "offline_fallback",
            Self::SyncSuccess { .. } => "sync_success",
            Self::SyncFailure { .. } => "sync_failure",
            Self::NeedsManualResync { .. } => "needs_manual_resync",
        }
    }
}

/// Fire-and-forget broadcast of engine events. Emitting never blocks and
/// never fails: with no subscribers the event is simply dropped.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
