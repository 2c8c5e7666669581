use lru::LruCache;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::model::{AmendmentPatch, CaseId, CaseStatus, NewCaseData, UnixTimeMs, UserId};
use crate::remote::RemoteError;
use crate::storage::{StateStore, StoreBatch, StoreError};
use crate::{
    AMEND_TIMEOUT, BASE_RETRY_DELAY_MS, CREATE_CASE_TIMEOUT, JITTER_MAX_MS, MAX_QUEUE_ENTRIES,
    MAX_RETRY_ATTEMPTS, MAX_RETRY_DELAY_MS, STATUS_UPDATE_TIMEOUT,
};

/// Validated operation identifier - immutable after construction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId(String);

impl OpId {
    const MAX_LENGTH: usize = 128;

    pub fn new(id: impl Into<String>) -> Result<Self, QueueError> {
        let id = id.into().trim().to_string();
        if id.is_empty() {
            return Err(QueueError::InvalidId("OpId cannot be empty".into()));
        }
        if id.len() > Self::MAX_LENGTH {
            return Err(QueueError::InvalidId(format!(
                "OpId exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(QueueError::InvalidId(
                "OpId contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".into(),
            ));
        }
        Ok(Self(id))
    }

    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The mutation a queued operation will replay against the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    Create {
        data: NewCaseData,
        /// Token paired with the provisional reference so competing
        /// provisional numbers reconcile unambiguously.
        client_token: Option<String>,
    },
    StatusUpdate {
        status: CaseStatus,
        actor: UserId,
        details: Option<String>,
        attachments: Vec<String>,
        timestamp: UnixTimeMs,
    },
    Amend {
        patch: AmendmentPatch,
        actor: UserId,
        reason: Option<String>,
        allow_override: bool,
        timestamp: UnixTimeMs,
    },
}

impl OperationKind {
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::StatusUpdate { .. } => "status_update",
            Self::Amend { .. } => "amend",
        }
    }

    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        match self {
            Self::Create { .. } => CREATE_CASE_TIMEOUT,
            Self::StatusUpdate { .. } => STATUS_UPDATE_TIMEOUT,
            Self::Amend { .. } => AMEND_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    MaxAttemptsExceeded,
    NonRetryable,
    ReconciliationFailed,
}

/// Operation state machine:
/// `Pending -> InFlight -> { Committed | Pending (retry) | DeadLettered }`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpState {
    Pending,
    InFlight {
        started_at: UnixTimeMs,
    },
    Committed {
        committed_at: UnixTimeMs,
    },
    DeadLettered {
        reason: DeadLetterReason,
        dead_at: UnixTimeMs,
    },
}

impl OpState {
    #[must_use]
    pub const fn state_name(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight { .. } => "in_flight",
            Self::Committed { .. } => "committed",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Committed { .. } | Self::DeadLettered { .. })
    }
}

/// A durably queued mutation awaiting the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub op_id: OpId,
    pub case_id: CaseId,
    pub kind: OperationKind,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
    pub state: OpState,
    pub attempt_count: u32,
    pub next_retry_at: Option<UnixTimeMs>,
    pub last_error: Option<RemoteError>,
}

impl PendingOperation {
    #[must_use]
    pub fn new(case_id: CaseId, kind: OperationKind, now: UnixTimeMs) -> Self {
        Self {
            op_id: OpId::generate(),
            case_id,
            kind,
            created_at: now,
            updated_at: now,
            state: OpState::Pending,
            attempt_count: 0,
            next_retry_at: None,
            last_error: None,
        }
    }

    #[must_use]
    pub fn is_due(&self, now: UnixTimeMs) -> bool {
        matches!(self.state, OpState::Pending) && self.next_retry_at.map_or(true, |t| now >= t)
    }

    #[must_use]
    pub const fn is_dead_lettered(&self) -> bool {
        matches!(self.state, OpState::DeadLettered { .. })
    }

    fn mark_in_flight(&mut self, now: UnixTimeMs) {
        self.state = OpState::InFlight { started_at: now };
        self.attempt_count += 1;
        self.updated_at = now;
    }

    fn mark_committed(&mut self, now: UnixTimeMs) {
        self.state = OpState::Committed { committed_at: now };
        self.updated_at = now;
        self.next_retry_at = None;
        self.last_error = None;
    }

    fn mark_failed(&mut self, error: RemoteError, now: UnixTimeMs, config: &QueueConfig) {
        self.updated_at = now;

        if !error.is_retryable() {
            self.state = OpState::DeadLettered {
                reason: DeadLetterReason::NonRetryable,
                dead_at: now,
            };
            self.next_retry_at = None;
        } else if self.attempt_count >= config.max_attempts {
            self.state = OpState::DeadLettered {
                reason: DeadLetterReason::MaxAttemptsExceeded,
                dead_at: now,
            };
            self.next_retry_at = None;
        } else {
            self.state = OpState::Pending;
            self.next_retry_at = Some(now.add_millis(backoff_delay(self.attempt_count, config)));
        }

        self.last_error = Some(error);
    }

    fn mark_dead_lettered(&mut self, reason: DeadLetterReason, now: UnixTimeMs) {
        self.state = OpState::DeadLettered {
            reason,
            dead_at: now,
        };
        self.updated_at = now;
        self.next_retry_at = None;
    }

    fn reset_for_retry(&mut self, now: UnixTimeMs) {
        self.state = OpState::Pending;
        self.attempt_count = 0;
        self.next_retry_at = None;
        self.updated_at = now;
    }
}

/// Exponential backoff, capped, with jitter so a burst of retries does not
/// stampede the backend.
fn backoff_delay(attempt: u32, config: &QueueConfig) -> u64 {
    let exponent = attempt.min(16);
    let exponential = config
        .base_backoff_ms
        .saturating_mul(2u64.saturating_pow(exponent));
    let jitter = if config.jitter_max_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=config.jitter_max_ms)
    };
    exponential
        .min(config.max_backoff_ms)
        .saturating_add(jitter)
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("offline queue is full ({max} entries)")]
    Overflow { max: usize },

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("duplicate operation: {0}")]
    DuplicateOp(String),

    #[error("operation not found: {0}")]
    NotFound(String),

    #[error("operation {op_id} was already committed")]
    AlreadyCommitted { op_id: String },

    #[error("invalid state transition for {op_id}: {from} -> {to}")]
    InvalidTransition {
        op_id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error(transparent)]
    Storage(#[from] StoreError),
}

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub max_entries: usize,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_max_ms: u64,
    pub committed_cache_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_entries: MAX_QUEUE_ENTRIES,
            max_attempts: MAX_RETRY_ATTEMPTS,
            base_backoff_ms: BASE_RETRY_DELAY_MS,
            max_backoff_ms: MAX_RETRY_DELAY_MS,
            jitter_max_ms: JITTER_MAX_MS,
            committed_cache_size: 1_024,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_entries == 0 {
            return Err(QueueError::Config("max_entries must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(QueueError::Config("max_attempts must be > 0".into()));
        }
        if self.base_backoff_ms == 0 {
            return Err(QueueError::Config("base_backoff_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub enqueued: AtomicU64,
    pub committed: AtomicU64,
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub duplicate_rejections: AtomicU64,
    pub overflow_rejections: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl QueueMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            duplicate_rejections: self.duplicate_rejections.load(Ordering::Relaxed),
            overflow_rejections: self.overflow_rejections.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueueMetricsSnapshot {
    pub enqueued: u64,
    pub committed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub duplicate_rejections: u64,
    pub overflow_rejections: u64,
    pub storage_errors: u64,
}

struct QueueState {
    /// Insertion order is creation order; per-case FIFO depends on it.
    ops: Vec<PendingOperation>,
    /// Recently committed op ids, so a retained handle to an operation that
    /// already committed cannot be enqueued or re-armed again.
    committed: LruCache<String, UnixTimeMs>,
}

impl QueueState {
    fn new(committed_cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(committed_cache_size)
            .unwrap_or_else(|| NonZeroUsize::new(1_024).expect("non-zero literal"));
        Self {
            ops: Vec::new(),
            committed: LruCache::new(cache_size),
        }
    }

    fn find(&self, op_id: &OpId) -> Option<usize> {
        self.ops.iter().position(|o| &o.op_id == op_id)
    }
}

/// Durable, append-ordered store of pending mutations. Only `CaseStore`
/// enqueues; only `SyncEngine` drains.
pub struct OfflineQueue {
    storage: Arc<dyn StateStore>,
    config: QueueConfig,
    state: RwLock<QueueState>,
    metrics: Arc<QueueMetrics>,
}

impl OfflineQueue {
    /// Load the queue from durable storage. Operations found in flight were
    /// interrupted by a crash and go back to pending.
    pub async fn open(
        storage: Arc<dyn StateStore>,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        config.validate()?;

        let snapshot = storage.load().await?;
        let mut state = QueueState::new(config.committed_cache_size);
        let mut recovered = StoreBatch::new();

        for mut op in snapshot.operations {
            if matches!(op.state, OpState::InFlight { .. }) {
                warn!(op_id = %op.op_id, "recovering interrupted in-flight operation");
                op.state = OpState::Pending;
                op.next_retry_at = None;
                recovered = recovered.upsert_op(op.clone());
            }
            state.ops.push(op);
        }

        if !recovered.is_empty() {
            storage.apply(recovered).await?;
        }

        info!(entries = state.ops.len(), "offline queue loaded");

        Ok(Self {
            storage,
            config,
            state: RwLock::new(state),
            metrics: Arc::new(QueueMetrics::new()),
        })
    }

    #[instrument(skip(self, op), fields(op_id = %op.op_id, case_id = %op.case_id))]
    pub async fn enqueue(&self, op: PendingOperation) -> Result<(), QueueError> {
        let mut state = self.state.write().await;

        if state.committed.contains(op.op_id.as_str()) {
            self.metrics
                .duplicate_rejections
                .fetch_add(1, Ordering::Relaxed);
            return Err(QueueError::AlreadyCommitted {
                op_id: op.op_id.as_str().to_string(),
            });
        }

        if state.find(&op.op_id).is_some() {
            self.metrics
                .duplicate_rejections
                .fetch_add(1, Ordering::Relaxed);
            return Err(QueueError::DuplicateOp(op.op_id.as_str().to_string()));
        }

        if state.ops.len() >= self.config.max_entries {
            self.metrics
                .overflow_rejections
                .fetch_add(1, Ordering::Relaxed);
            return Err(QueueError::Overflow {
                max: self.config.max_entries,
            });
        }

        // Memory first, then persist - rollback on failure.
        state.ops.push(op.clone());
        if let Err(e) = self.storage.apply(StoreBatch::new().upsert_op(op)).await {
            state.ops.pop();
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }

        self.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Operations ready for draining: at most one per case, in creation
    /// order. A case whose oldest live operation is in flight, backing off,
    /// or dead-lettered contributes nothing - later operations for it must
    /// wait.
    pub async fn due_operations(&self, now: UnixTimeMs) -> Vec<PendingOperation> {
        let state = self.state.read().await;
        let mut seen: HashSet<&str> = HashSet::new();
        let mut due = Vec::new();

        for op in &state.ops {
            if !seen.insert(op.case_id.as_str()) {
                continue;
            }
            if op.is_due(now) {
                due.push(op.clone());
            }
        }

        due
    }

    #[instrument(skip(self), fields(op_id = %op_id.as_str()))]
    pub async fn mark_in_flight(
        &self,
        op_id: &OpId,
        now: UnixTimeMs,
    ) -> Result<PendingOperation, QueueError> {
        let mut state = self.state.write().await;
        let index = state
            .find(op_id)
            .ok_or_else(|| QueueError::NotFound(op_id.as_str().to_string()))?;

        let op = &mut state.ops[index];
        if !matches!(op.state, OpState::Pending) {
            return Err(QueueError::InvalidTransition {
                op_id: op_id.as_str().to_string(),
                from: op.state.state_name(),
                to: "in_flight",
            });
        }

        op.mark_in_flight(now);
        let updated = op.clone();

        self.persist_update(updated.clone()).await?;
        Ok(updated)
    }

    /// Commit an operation: terminal, removed from the queue, remembered in
    /// the committed cache.
    #[instrument(skip(self), fields(op_id = %op_id.as_str()))]
    pub async fn commit(
        &self,
        op_id: &OpId,
        now: UnixTimeMs,
    ) -> Result<PendingOperation, QueueError> {
        let mut state = self.state.write().await;
        let index = state
            .find(op_id)
            .ok_or_else(|| QueueError::NotFound(op_id.as_str().to_string()))?;

        if !matches!(state.ops[index].state, OpState::InFlight { .. }) {
            return Err(QueueError::InvalidTransition {
                op_id: op_id.as_str().to_string(),
                from: state.ops[index].state.state_name(),
                to: "committed",
            });
        }

        self.storage
            .apply(StoreBatch::new().delete_op(op_id.clone()))
            .await
            .map_err(|e| {
                self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
                e
            })?;

        let mut op = state.ops.remove(index);
        op.mark_committed(now);
        state.committed.put(op.op_id.as_str().to_string(), now);

        self.metrics.committed.fetch_add(1, Ordering::Relaxed);
        info!(kind = op.kind.kind_name(), "operation committed");
        Ok(op)
    }

    /// Record a failed attempt. Retryable errors back off and return to
    /// pending until the attempt budget runs out; everything else
    /// dead-letters immediately.
    #[instrument(skip(self, error), fields(op_id = %op_id.as_str()))]
    pub async fn fail(
        &self,
        op_id: &OpId,
        error: RemoteError,
        now: UnixTimeMs,
    ) -> Result<PendingOperation, QueueError> {
        let mut state = self.state.write().await;
        let index = state
            .find(op_id)
            .ok_or_else(|| QueueError::NotFound(op_id.as_str().to_string()))?;

        let op = &mut state.ops[index];
        if !matches!(op.state, OpState::InFlight { .. }) {
            return Err(QueueError::InvalidTransition {
                op_id: op_id.as_str().to_string(),
                from: op.state.state_name(),
                to: "pending",
            });
        }

        op.mark_failed(error, now, &self.config);
        let updated = op.clone();

        if updated.is_dead_lettered() {
            self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
            warn!(attempts = updated.attempt_count, "operation dead-lettered");
        } else {
            self.metrics.retried.fetch_add(1, Ordering::Relaxed);
        }

        self.persist_update(updated.clone()).await?;
        Ok(updated)
    }

    /// Move an operation straight to the dead-letter shelf, bypassing the
    /// retry budget. Used when reconciliation cannot resolve its case id.
    #[instrument(skip(self), fields(op_id = %op_id.as_str()))]
    pub async fn dead_letter(
        &self,
        op_id: &OpId,
        reason: DeadLetterReason,
        now: UnixTimeMs,
    ) -> Result<PendingOperation, QueueError> {
        let mut state = self.state.write().await;
        let index = state
            .find(op_id)
            .ok_or_else(|| QueueError::NotFound(op_id.as_str().to_string()))?;

        let op = &mut state.ops[index];
        if op.state.is_terminal() {
            return Err(QueueError::InvalidTransition {
                op_id: op_id.as_str().to_string(),
                from: op.state.state_name(),
                to: "dead_lettered",
            });
        }

        op.mark_dead_lettered(reason, now);
        let updated = op.clone();

        self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.persist_update(updated.clone()).await?;
        Ok(updated)
    }

    /// Operator-triggered resync: re-arm a dead-lettered operation with a
    /// fresh attempt budget.
    #[instrument(skip(self), fields(op_id = %op_id.as_str()))]
    pub async fn retry_dead_letter(
        &self,
        op_id: &OpId,
        now: UnixTimeMs,
    ) -> Result<PendingOperation, QueueError> {
        let mut state = self.state.write().await;

        if state.committed.contains(op_id.as_str()) {
            return Err(QueueError::AlreadyCommitted {
                op_id: op_id.as_str().to_string(),
            });
        }

        let index = state
            .find(op_id)
            .ok_or_else(|| QueueError::NotFound(op_id.as_str().to_string()))?;

        let op = &mut state.ops[index];
        if !op.is_dead_lettered() {
            return Err(QueueError::InvalidTransition {
                op_id: op_id.as_str().to_string(),
                from: op.state.state_name(),
                to: "pending",
            });
        }

        op.reset_for_retry(now);
        let updated = op.clone();
        self.persist_update(updated.clone()).await?;
        Ok(updated)
    }

    /// Operator-triggered purge of a dead-lettered operation. The only
    /// deletion path besides commit.
    #[instrument(skip(self), fields(op_id = %op_id.as_str()))]
    pub async fn purge_dead_letter(&self, op_id: &OpId) -> Result<(), QueueError> {
        let mut state = self.state.write().await;
        let index = state
            .find(op_id)
            .ok_or_else(|| QueueError::NotFound(op_id.as_str().to_string()))?;

        if !state.ops[index].is_dead_lettered() {
            return Err(QueueError::InvalidTransition {
                op_id: op_id.as_str().to_string(),
                from: state.ops[index].state.state_name(),
                to: "purged",
            });
        }

        self.storage
            .apply(StoreBatch::new().delete_op(op_id.clone()))
            .await?;
        state.ops.remove(index);
        Ok(())
    }

    /// Reconciliation rewrite: point every live operation that still targets
    /// the provisional id at the canonical one.
    #[instrument(skip(self), fields(from = %from.as_str(), to = %to.as_str()))]
    pub async fn rewrite_case_id(
        &self,
        from: &CaseId,
        to: &CaseId,
    ) -> Result<usize, QueueError> {
        let mut state = self.state.write().await;
        let mut batch = StoreBatch::new();
        let mut rewritten = 0;

        for op in state.ops.iter_mut() {
            if &op.case_id == from && !op.state.is_terminal() {
                op.case_id = to.clone();
                batch = batch.upsert_op(op.clone());
                rewritten += 1;
            }
        }

        if rewritten > 0 {
            self.storage.apply(batch).await?;
            info!(rewritten, "rewrote provisional case id on pending operations");
        }

        Ok(rewritten)
    }

    pub async fn get(&self, op_id: &OpId) -> Option<PendingOperation> {
        let state = self.state.read().await;
        state.find(op_id).map(|i| state.ops[i].clone())
    }

    pub async fn dead_letters(&self) -> Vec<PendingOperation> {
        let state = self.state.read().await;
        state
            .ops
            .iter()
            .filter(|o| o.is_dead_lettered())
            .cloned()
            .collect()
    }

    /// Live (non-terminal) operations still queued for a case.
    pub async fn pending_for_case(&self, case_id: &CaseId) -> usize {
        let state = self.state.read().await;
        state
            .ops
            .iter()
            .filter(|o| &o.case_id == case_id && !o.state.is_terminal())
            .count()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.ops.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.ops.is_empty()
    }

    #[must_use]
    pub fn metrics(&self) -> QueueMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn persist_update(&self, updated: PendingOperation) -> Result<(), QueueError> {
        if let Err(e) = self
            .storage
            .apply(StoreBatch::new().upsert_op(updated))
            .await
        {
            self.metrics.storage_errors.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
        Ok(())
    }
}
