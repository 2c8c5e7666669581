use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::amendment::{self, AmendError};
use crate::event::{EngineEvent, EventBus};
use crate::model::{
    AmendmentPatch, Case, CaseFilter, CaseId, CaseReference, CaseStatus, Country, NewCaseData,
    StatusHistoryEntry, SyncStatus, UnixTimeMs, UserId,
};
use crate::queue::{OfflineQueue, OpId, OperationKind, PendingOperation};
use crate::reference::ReferenceNumberAllocator;
use crate::remote::{with_timeout, RemoteCaseService};
use crate::storage::{StateStore, StoreBatch, StoreError};
use crate::{
    CaseError, ALLOCATE_REFERENCE_TIMEOUT, AMEND_TIMEOUT, CREATE_CASE_TIMEOUT, LIST_CASES_TIMEOUT,
    STATUS_UPDATE_TIMEOUT,
};

/// The locally materialized case set, shared by `CaseStore` and
/// `SyncEngine` and written through to durable storage on every mutation.
pub struct CaseLedger {
    storage: Arc<dyn StateStore>,
    cases: RwLock<HashMap<String, Case>>,
}

impl CaseLedger {
    pub async fn open(storage: Arc<dyn StateStore>) -> Result<Self, StoreError> {
        let snapshot = storage.load().await?;
        let cases = snapshot
            .cases
            .into_iter()
            .map(|c| (c.id.as_str().to_string(), c))
            .collect();
        Ok(Self {
            storage,
            cases: RwLock::new(cases),
        })
    }

    pub async fn get(&self, id: &CaseId) -> Option<Case> {
        self.cases.read().await.get(id.as_str()).cloned()
    }

    pub async fn upsert(&self, case: Case) -> Result<(), StoreError> {
        self.storage
            .apply(StoreBatch::new().upsert_case(case.clone()))
            .await?;
        self.cases
            .write()
            .await
            .insert(case.id.as_str().to_string(), case);
        Ok(())
    }

    pub async fn remove(&self, id: &CaseId) -> Result<(), StoreError> {
        self.storage
            .apply(StoreBatch::new().delete_case(id.clone()))
            .await?;
        self.cases.write().await.remove(id.as_str());
        Ok(())
    }

    /// Mutate one case in place and persist the result. Returns `None` when
    /// the case is unknown.
    pub async fn update<F>(&self, id: &CaseId, mutate: F) -> Result<Option<Case>, StoreError>
    where
        F: FnOnce(&mut Case),
    {
        let mut cases = self.cases.write().await;
        let Some(case) = cases.get_mut(id.as_str()) else {
            return Ok(None);
        };
        mutate(case);
        let updated = case.clone();
        self.storage
            .apply(StoreBatch::new().upsert_case(updated.clone()))
            .await?;
        Ok(Some(updated))
    }

    pub async fn set_sync_status(
        &self,
        id: &CaseId,
        status: SyncStatus,
    ) -> Result<Option<Case>, StoreError> {
        self.update(id, |case| case.sync_status = status).await
    }

    /// Swap a provisional identity for the canonical one the backend issued.
    /// The provisional reference number is discarded, never persisted as
    /// final.
    pub async fn reconcile(
        &self,
        provisional: &CaseId,
        canonical: &CaseId,
        reference_number: &str,
    ) -> Result<Option<Case>, StoreError> {
        let mut cases = self.cases.write().await;
        let Some(mut case) = cases.remove(provisional.as_str()) else {
            return Ok(None);
        };

        case.id = canonical.clone();
        case.reference = CaseReference::canonical(reference_number);

        self.storage
            .apply(
                StoreBatch::new()
                    .delete_case(provisional.clone())
                    .upsert_case(case.clone()),
            )
            .await?;
        cases.insert(canonical.as_str().to_string(), case.clone());
        Ok(Some(case))
    }

    pub async fn list(&self, filter: &CaseFilter) -> Vec<Case> {
        let cases = self.cases.read().await;
        let mut matched: Vec<Case> = cases
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        matched
    }

    pub async fn len(&self) -> usize {
        self.cases.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.cases.read().await.is_empty()
    }
}

fn validate_new_case(data: &NewCaseData) -> Result<(), CaseError> {
    let required = [
        ("hospital", &data.fields.hospital),
        ("department", &data.fields.department),
        ("date_of_surgery", &data.fields.date_of_surgery),
        ("procedure_type", &data.fields.procedure_type),
    ];
    for (name, value) in required {
        if value.trim().is_empty() {
            return Err(CaseError::Validation(format!("{name} must not be empty")));
        }
    }
    Ok(())
}

/// The façade callers use. Every mutating call goes remote-first; retryable
/// failures fall back to local materialization plus a queued operation, so
/// callers never block on a dead backend. Non-retryable failures surface
/// immediately and are never queued.
pub struct CaseStore {
    remote: Arc<dyn RemoteCaseService>,
    queue: Arc<OfflineQueue>,
    ledger: Arc<CaseLedger>,
    allocator: ReferenceNumberAllocator,
    events: EventBus,
}

impl CaseStore {
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteCaseService>,
        queue: Arc<OfflineQueue>,
        ledger: Arc<CaseLedger>,
        events: EventBus,
    ) -> Self {
        let allocator = ReferenceNumberAllocator::new(remote.clone());
        Self {
            remote,
            queue,
            ledger,
            allocator,
            events,
        }
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[instrument(skip(self, data), fields(country = %data.country))]
    pub async fn create_case(&self, data: NewCaseData) -> Result<Case, CaseError> {
        validate_new_case(&data)?;
        let now = UnixTimeMs::now();

        match with_timeout(CREATE_CASE_TIMEOUT, self.remote.create_case(&data)).await {
            Ok(remote_case) => {
                let case = Case::new(
                    remote_case.id,
                    CaseReference::canonical(remote_case.reference_number),
                    data.country,
                    data.fields,
                    data.submitted_by,
                    now,
                );
                self.ledger.upsert(case.clone()).await?;
                Ok(case)
            }
            Err(e) if e.is_retryable() => {
                let id = CaseId::provisional();
                let reference = self.allocator.provisional(&data.country);
                let client_token = reference.client_token.clone();

                let mut case = Case::new(
                    id.clone(),
                    reference,
                    data.country.clone(),
                    data.fields.clone(),
                    data.submitted_by.clone(),
                    now,
                );
                case.sync_status = SyncStatus::Pending;
                self.ledger.upsert(case.clone()).await?;

                let op = PendingOperation::new(
                    id.clone(),
                    OperationKind::Create { data, client_token },
                    now,
                );
                let op_id = op.op_id.clone();
                if let Err(err) = self.queue.enqueue(op).await {
                    // A materialized case with no queued create would never
                    // sync; undo the fallback before surfacing.
                    if let Err(cleanup) = self.ledger.remove(&id).await {
                        warn!(%id, error = %cleanup, "failed to roll back offline case");
                    }
                    return Err(err.into());
                }

                info!(case_id = %id, "backend unreachable, case queued for sync");
                self.events.emit(EngineEvent::OfflineFallback {
                    case_id: id,
                    op_id,
                });
                Ok(case)
            }
            Err(e) => Err(CaseError::Remote(e)),
        }
    }

    #[instrument(skip(self, details, attachments), fields(case_id = %id, status = status.as_str()))]
    pub async fn update_status(
        &self,
        id: &CaseId,
        status: CaseStatus,
        actor: &UserId,
        details: Option<String>,
        attachments: Vec<String>,
    ) -> Result<Case, CaseError> {
        if self.ledger.get(id).await.is_none() {
            return Err(CaseError::NotFound(id.clone()));
        }
        let now = UnixTimeMs::now();
        let entry = StatusHistoryEntry {
            status,
            timestamp: now,
            actor: actor.clone(),
            details: details.clone(),
            attachments: attachments.clone(),
        };

        match with_timeout(
            STATUS_UPDATE_TIMEOUT,
            self.remote
                .update_status(id, status, actor, details.as_deref(), &attachments),
        )
        .await
        {
            Ok(()) => self.record_status_locally(id, entry, None).await,
            Err(e) if e.is_retryable() => {
                let updated = self
                    .record_status_locally(id, entry, Some(SyncStatus::Pending))
                    .await?;

                let op = PendingOperation::new(
                    id.clone(),
                    OperationKind::StatusUpdate {
                        status,
                        actor: actor.clone(),
                        details,
                        attachments,
                        timestamp: now,
                    },
                    now,
                );
                let op_id = op.op_id.clone();
                self.queue.enqueue(op).await?;
                self.events.emit(EngineEvent::OfflineFallback {
                    case_id: id.clone(),
                    op_id,
                });
                Ok(updated)
            }
            Err(e) => Err(CaseError::Remote(e)),
        }
    }

    async fn record_status_locally(
        &self,
        id: &CaseId,
        entry: StatusHistoryEntry,
        sync_status: Option<SyncStatus>,
    ) -> Result<Case, CaseError> {
        let status = entry.status;
        let actor = entry.actor.clone();
        let timestamp = entry.timestamp;
        let updated = self
            .ledger
            .update(id, move |case| {
                case.status_history.record(entry);
                case.status = status;
                case.processed_by = Some(actor);
                case.processed_at = Some(timestamp);
                if let Some(sync_status) = sync_status {
                    case.sync_status = sync_status;
                }
            })
            .await?;
        updated.ok_or_else(|| CaseError::NotFound(id.clone()))
    }

    /// The single-amendment policy is enforced locally before the remote
    /// attempt: queuing a doomed amend would waste retry budget and hide a
    /// real defect from the user.
    #[instrument(skip(self, patch, reason), fields(case_id = %id, allow_override))]
    pub async fn amend_case(
        &self,
        id: &CaseId,
        patch: AmendmentPatch,
        actor: &UserId,
        reason: Option<String>,
        allow_override: bool,
    ) -> Result<Case, CaseError> {
        let now = UnixTimeMs::now();
        let Some(mut case) = self.ledger.get(id).await else {
            return Err(CaseError::NotFound(id.clone()));
        };

        match amendment::apply_amendment(&mut case, &patch, actor, reason.clone(), allow_override, now)
        {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(case),
            Err(AmendError::AlreadyAmended) => {
                return Err(CaseError::AlreadyAmended(id.clone()))
            }
        }

        match with_timeout(AMEND_TIMEOUT, self.remote.amend(id, &patch, actor)).await {
            Ok(_) => {
                self.ledger.upsert(case.clone()).await?;
                Ok(case)
            }
            Err(e) if e.is_retryable() => {
                case.sync_status = SyncStatus::Pending;
                self.ledger.upsert(case.clone()).await?;

                let op = PendingOperation::new(
                    id.clone(),
                    OperationKind::Amend {
                        patch,
                        actor: actor.clone(),
                        reason,
                        allow_override,
                        timestamp: now,
                    },
                    now,
                );
                let op_id = op.op_id.clone();
                self.queue.enqueue(op).await?;
                self.events.emit(EngineEvent::OfflineFallback {
                    case_id: id.clone(),
                    op_id,
                });
                Ok(case)
            }
            Err(e) => Err(CaseError::Remote(e)),
        }
    }

    /// Atomic backend allocation, falling back to a tagged provisional
    /// reference when the backend is unreachable.
    pub async fn generate_reference_number(
        &self,
        country: &Country,
    ) -> Result<CaseReference, CaseError> {
        match with_timeout(ALLOCATE_REFERENCE_TIMEOUT, self.allocator.allocate(country)).await {
            Ok(reference) => Ok(reference),
            Err(e) if e.is_retryable() => Ok(self.allocator.provisional(country)),
            Err(e) => Err(CaseError::Remote(e)),
        }
    }

    /// Remote-first listing. Synced remote results refresh the ledger, but
    /// never clobber a case with pending local state.
    pub async fn list_cases(&self, filter: &CaseFilter) -> Result<Vec<Case>, CaseError> {
        match with_timeout(LIST_CASES_TIMEOUT, self.remote.list_cases(filter)).await {
            Ok(remote_cases) => {
                for remote_case in remote_cases {
                    let keep_local = match self.ledger.get(&remote_case.id).await {
                        Some(local) => !local.sync_status.is_synced(),
                        None => false,
                    };
                    if !keep_local {
                        self.ledger.upsert(remote_case).await?;
                    }
                }
                Ok(self.ledger.list(filter).await)
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "listing from local ledger, backend unreachable");
                Ok(self.ledger.list(filter).await)
            }
            Err(e) => Err(CaseError::Remote(e)),
        }
    }

    /// Dead-lettered operations retained for operator inspection.
    pub async fn dead_letters(&self) -> Vec<PendingOperation> {
        self.queue.dead_letters().await
    }

    /// Operator-triggered manual resync of one dead-lettered operation.
    pub async fn retry_dead_letter(&self, op_id: &OpId) -> Result<(), CaseError> {
        let now = UnixTimeMs::now();
        let op = self.queue.retry_dead_letter(op_id, now).await?;
        self.ledger
            .set_sync_status(&op.case_id, SyncStatus::Pending)
            .await?;
        Ok(())
    }
}
