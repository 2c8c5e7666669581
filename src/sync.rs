use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, instrument, warn};

use crate::event::{EngineEvent, EventBus};
use crate::model::{CaseId, SyncStatus, UnixTimeMs};
use crate::monitor::ConnectionState;
use crate::queue::{DeadLetterReason, OfflineQueue, OperationKind, PendingOperation};
use crate::remote::{with_timeout, RemoteCase, RemoteCaseService, RemoteError};
use crate::store::CaseLedger;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Backstop timer; the offline->online transition is the primary drain
    /// trigger.
    pub drain_interval: Duration,
    /// Concurrency bound across cases. Within a case there is never more
    /// than one operation in flight.
    pub max_concurrent_cases: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drain_interval: Duration::from_secs(60),
            max_concurrent_cases: 4,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub committed: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

enum OpOutcome {
    Committed,
    Retried,
    DeadLettered,
}

/// Drains the offline queue against the backend. The single consumer of the
/// queue: `CaseStore` enqueues, this engine dequeues. Explicitly constructed
/// and shut down, injected where needed - never a global.
pub struct SyncEngine {
    queue: Arc<OfflineQueue>,
    remote: Arc<dyn RemoteCaseService>,
    ledger: Arc<CaseLedger>,
    events: EventBus,
    config: SyncConfig,
    permits: Arc<Semaphore>,
    drain_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        queue: Arc<OfflineQueue>,
        remote: Arc<dyn RemoteCaseService>,
        ledger: Arc<CaseLedger>,
        events: EventBus,
        config: SyncConfig,
    ) -> Arc<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(config.max_concurrent_cases.max(1)));
        Arc::new(Self {
            queue,
            remote,
            ledger,
            events,
            config,
            permits,
            drain_lock: Mutex::new(()),
            shutdown,
            shutdown_rx,
            handle: Mutex::new(None),
        })
    }

    /// Spawn the drain loop: immediate drain on each offline->online
    /// transition, periodic backstop otherwise.
    pub async fn start(self: &Arc<Self>, mut transitions: broadcast::Receiver<ConnectionState>) {
        let engine = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(engine.config.drain_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut transitions_open = true;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = interval.tick() => {
                        let _ = engine.drain().await;
                    }
                    result = transitions.recv(), if transitions_open => match result {
                        Ok(ConnectionState::Online) => {
                            info!("connectivity restored, draining offline queue");
                            let _ = engine.drain().await;
                        }
                        Ok(ConnectionState::Offline) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => {
                            transitions_open = false;
                        }
                    }
                }
            }
        });

        *self.handle.lock().await = Some(handle);
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Drain everything currently due. Each pass takes at most one operation
    /// per case (FIFO within the case) and runs different cases
    /// concurrently. Passes repeat until nothing more is due; retryable
    /// failures leave future retry timestamps and drop out of the due set.
    #[instrument(skip(self))]
    pub async fn drain(self: &Arc<Self>) -> DrainReport {
        let _guard = self.drain_lock.lock().await;
        let mut report = DrainReport::default();

        loop {
            let due = self.queue.due_operations(UnixTimeMs::now()).await;
            if due.is_empty() {
                break;
            }

            let mut tasks = JoinSet::new();
            for op in due {
                let Ok(permit) = self.permits.clone().acquire_owned().await else {
                    break;
                };
                let engine = Arc::clone(self);
                tasks.spawn(async move {
                    let _permit = permit;
                    engine.process_operation(op).await
                });
            }

            let before = report;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Some(OpOutcome::Committed)) => report.committed += 1,
                    Ok(Some(OpOutcome::Retried)) => report.retried += 1,
                    Ok(Some(OpOutcome::DeadLettered)) => report.dead_lettered += 1,
                    Ok(None) => {}
                    Err(e) => error!(error = %e, "drain task failed"),
                }
            }

            // A pass that moved nothing (e.g. local storage refusing every
            // bookkeeping write) must not spin.
            if report == before {
                break;
            }
        }

        report
    }

    async fn process_operation(&self, op: PendingOperation) -> Option<OpOutcome> {
        let op = match self.queue.mark_in_flight(&op.op_id, UnixTimeMs::now()).await {
            Ok(op) => op,
            Err(e) => {
                warn!(op_id = %op.op_id, error = %e, "skipping operation");
                return None;
            }
        };

        // Per-case FIFO guarantees the create drains before its dependents,
        // so a dependent operation still holding a provisional id means its
        // create never committed. That is fatal to the operation, not
        // retryable.
        if !matches!(op.kind, OperationKind::Create { .. }) && op.case_id.is_provisional() {
            return self.reconciliation_failure(&op).await;
        }

        match self.submit(&op).await {
            Ok(committed_create) => {
                if let Err(e) = self.queue.commit(&op.op_id, UnixTimeMs::now()).await {
                    warn!(op_id = %op.op_id, error = %e, "commit bookkeeping failed");
                    return None;
                }

                let case_id = match committed_create {
                    Some(remote_case) if op.case_id.is_provisional() => {
                        self.reconcile_create(&op, remote_case).await
                    }
                    Some(remote_case) => remote_case.id,
                    None => op.case_id.clone(),
                };

                self.finalize_case(&case_id).await;
                self.events.emit(EngineEvent::SyncSuccess {
                    case_id,
                    op_id: op.op_id.clone(),
                });
                Some(OpOutcome::Committed)
            }
            Err(e) => match self.queue.fail(&op.op_id, e, UnixTimeMs::now()).await {
                Ok(failed) if failed.is_dead_lettered() => {
                    self.surface_dead_letter(&failed).await;
                    Some(OpOutcome::DeadLettered)
                }
                // Transient retry failures are never surfaced to the user.
                Ok(_) => Some(OpOutcome::Retried),
                Err(err) => {
                    warn!(op_id = %op.op_id, error = %err, "failure bookkeeping failed");
                    None
                }
            },
        }
    }

    async fn submit(&self, op: &PendingOperation) -> Result<Option<RemoteCase>, RemoteError> {
        let limit = op.kind.default_timeout();
        match &op.kind {
            OperationKind::Create { data, .. } => {
                let remote_case = with_timeout(limit, self.remote.create_case(data)).await?;
                Ok(Some(remote_case))
            }
            OperationKind::StatusUpdate {
                status,
                actor,
                details,
                attachments,
                ..
            } => {
                with_timeout(
                    limit,
                    self.remote.update_status(
                        &op.case_id,
                        *status,
                        actor,
                        details.as_deref(),
                        attachments,
                    ),
                )
                .await?;
                Ok(None)
            }
            OperationKind::Amend { patch, actor, .. } => {
                with_timeout(limit, self.remote.amend(&op.case_id, patch, actor)).await?;
                Ok(None)
            }
        }
    }

    /// A committed create with a provisional id: rewrite every still-pending
    /// operation to the canonical id and swap the ledger record's identity.
    async fn reconcile_create(&self, op: &PendingOperation, remote_case: RemoteCase) -> CaseId {
        match self.queue.rewrite_case_id(&op.case_id, &remote_case.id).await {
            Ok(rewritten) if rewritten > 0 => {
                info!(
                    provisional = %op.case_id,
                    canonical = %remote_case.id,
                    rewritten,
                    "reconciled pending operations"
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(op_id = %op.op_id, error = %e, "queue rewrite failed");
            }
        }

        if let Err(e) = self
            .ledger
            .reconcile(&op.case_id, &remote_case.id, &remote_case.reference_number)
            .await
        {
            warn!(op_id = %op.op_id, error = %e, "ledger reconciliation failed");
        }

        remote_case.id
    }

    /// Once nothing is queued for a case anymore, it is fully synced.
    async fn finalize_case(&self, case_id: &CaseId) {
        if self.queue.pending_for_case(case_id).await == 0 {
            if let Err(e) = self.ledger.set_sync_status(case_id, SyncStatus::Synced).await {
                warn!(%case_id, error = %e, "failed to mark case synced");
            }
        }
    }

    async fn surface_dead_letter(&self, op: &PendingOperation) {
        if let Err(e) = self
            .ledger
            .set_sync_status(&op.case_id, SyncStatus::NeedsResync)
            .await
        {
            warn!(case_id = %op.case_id, error = %e, "failed to flag case for resync");
        }
        self.events.emit(EngineEvent::SyncFailure {
            case_id: op.case_id.clone(),
            op_id: op.op_id.clone(),
        });
        self.events.emit(EngineEvent::NeedsManualResync {
            case_id: op.case_id.clone(),
        });
    }

    async fn reconciliation_failure(&self, op: &PendingOperation) -> Option<OpOutcome> {
        warn!(
            op_id = %op.op_id,
            case_id = %op.case_id,
            "canonical id unknown for dependent operation"
        );
        match self
            .queue
            .dead_letter(
                &op.op_id,
                DeadLetterReason::ReconciliationFailed,
                UnixTimeMs::now(),
            )
            .await
        {
            Ok(dead) => {
                self.surface_dead_letter(&dead).await;
                Some(OpOutcome::DeadLettered)
            }
            Err(e) => {
                warn!(op_id = %op.op_id, error = %e, "dead-letter bookkeeping failed");
                None
            }
        }
    }
}
