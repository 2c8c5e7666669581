//! Offline-resilient case lifecycle engine for a hospital case-booking
//! application.
//!
//! Keeps a booking's status history and amendment trail consistent and
//! durably recoverable while the backend is unreachable, and reconciles
//! locally-issued identifiers with server-issued ones once connectivity
//! returns. Mutations go remote-first through [`store::CaseStore`];
//! retryable failures fall back to the durable [`queue::OfflineQueue`],
//! which [`sync::SyncEngine`] drains when the [`monitor::ConnectionMonitor`]
//! reports the backend reachable again.

pub mod amendment;
pub mod event;
pub mod history;
pub mod model;
pub mod monitor;
pub mod queue;
pub mod reference;
pub mod remote;
pub mod storage;
pub mod store;
pub mod sync;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use event::{EngineEvent, EventBus};
pub use model::{
    Case, CaseFilter, CaseId, CaseReference, CaseStatus, Country, NewCaseData, SyncStatus,
    UnixTimeMs, UserId,
};
pub use monitor::{ConnectionMonitor, ConnectionState, MonitorConfig};
pub use queue::{OfflineQueue, OpId, PendingOperation, QueueConfig, QueueError};
pub use remote::{RemoteCase, RemoteCaseService, RemoteError};
pub use storage::{FileStore, MemoryStore, SqliteStore, StateStore, StoreError};
pub use store::{CaseLedger, CaseStore};
pub use sync::{DrainReport, SyncConfig, SyncEngine};

pub const CREATE_CASE_TIMEOUT: Duration = Duration::from_secs(30);
pub const STATUS_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);
pub const AMEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const LIST_CASES_TIMEOUT: Duration = Duration::from_secs(30);
pub const ALLOCATE_REFERENCE_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_RETRY_ATTEMPTS: u32 = 5;
pub const BASE_RETRY_DELAY_MS: u64 = 1_000;
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;
pub const JITTER_MAX_MS: u64 = 1_000;
pub const MAX_QUEUE_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

/// Failure classification shared across the engine. Whether an error is
/// queued for retry or surfaced immediately is decided here, once, rather
/// than per call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Validation,
    Conflict,
    NotFound,
    RateLimited,
    ServerError,
    Storage,
    Serialization,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Validation => "VALIDATION_ERROR",
            Self::Conflict => "CONFLICT",
            Self::NotFound => "NOT_FOUND",
            Self::RateLimited => "RATE_LIMITED",
            Self::ServerError => "SERVER_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::RateLimited | Self::ServerError | Self::Storage => {
                ErrorSeverity::Transient
            }
            Self::Serialization | Self::Internal => ErrorSeverity::Fatal,
            Self::Validation | Self::Conflict | Self::NotFound | Self::Unknown => {
                ErrorSeverity::Permanent
            }
        }
    }

    /// Retryable failures are queued; everything else surfaces immediately.
    /// A conflict is a real answer from the backend, not a transport
    /// hiccup, so it is never retried.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::ServerError | Self::Storage
        )
    }

    #[must_use]
    pub const fn http_status_hint(self) -> Option<u16> {
        match self {
            Self::Validation => Some(400),
            Self::NotFound => Some(404),
            Self::Timeout => Some(408),
            Self::Conflict => Some(409),
            Self::RateLimited => Some(429),
            Self::ServerError | Self::Internal => Some(500),
            _ => None,
        }
    }
}

/// The error surface of [`store::CaseStore`].
#[derive(Debug, Error)]
pub enum CaseError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("case {0} has already been amended; override privilege required")]
    AlreadyAmended(CaseId),

    #[error("case not found: {0}")]
    NotFound(CaseId),

    #[error("remote rejected the request: {0}")]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StoreError),
}
