#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use casebook_core::amendment::apply_amendment;
use casebook_core::event::EventBus;
use casebook_core::model::{
    AmendableFields, AmendmentEntry, AmendmentPatch, Case, CaseFilter, CaseId, CaseReference,
    CaseStatus, Country, NewCaseData, StatusHistoryEntry, UnixTimeMs, UserId,
};
use casebook_core::queue::{OfflineQueue, QueueConfig};
use casebook_core::reference::ReferenceNumberAllocator;
use casebook_core::remote::{RemoteCase, RemoteCaseService, RemoteError};
use casebook_core::storage::{MemoryStore, StateStore};
use casebook_core::store::{CaseLedger, CaseStore};
use casebook_core::sync::{SyncConfig, SyncEngine};

struct MockState {
    reference_counters: HashMap<String, u64>,
    case_sequence: u64,
    cases: HashMap<String, Case>,
    calls: Vec<String>,
}

/// Switchable in-memory backend with atomic per-country reference counters
/// and a recorded call order.
pub struct MockRemote {
    online: AtomicBool,
    fail_next: AtomicU32,
    state: Mutex<MockState>,
}

impl MockRemote {
    pub fn new(online: bool) -> Arc<Self> {
        Arc::new(Self {
            online: AtomicBool::new(online),
            fail_next: AtomicU32::new(0),
            state: Mutex::new(MockState {
                reference_counters: HashMap::new(),
                case_sequence: 0,
                cases: HashMap::new(),
                calls: Vec::new(),
            }),
        })
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Inject `n` network failures even while online.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn case(&self, id: &str) -> Option<Case> {
        self.state.lock().unwrap().cases.get(id).cloned()
    }

    pub fn case_count(&self) -> usize {
        self.state.lock().unwrap().cases.len()
    }

    fn gate(&self) -> Result<(), RemoteError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::network("backend unreachable"));
        }
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RemoteError::network("injected network failure"));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl RemoteCaseService for MockRemote {
    async fn create_case(&self, payload: &NewCaseData) -> Result<RemoteCase, RemoteError> {
        self.gate()?;
        let mut state = self.state.lock().unwrap();

        state.case_sequence += 1;
        let id = CaseId::new(format!("C{}", state.case_sequence));

        let counter = state
            .reference_counters
            .entry(payload.country.code().to_string())
            .or_insert(0);
        *counter += 1;
        let reference_number =
            ReferenceNumberAllocator::format_reference(&payload.country, *counter);

        let case = Case::new(
            id.clone(),
            CaseReference::canonical(reference_number.clone()),
            payload.country.clone(),
            payload.fields.clone(),
            payload.submitted_by.clone(),
            UnixTimeMs::now(),
        );
        state.cases.insert(id.as_str().to_string(), case);
        state.calls.push(format!("create:{}", id));

        Ok(RemoteCase {
            id,
            reference_number,
        })
    }

    async fn allocate_reference(&self, country: &Country) -> Result<String, RemoteError> {
        self.gate()?;
        let mut state = self.state.lock().unwrap();
        let counter = state
            .reference_counters
            .entry(country.code().to_string())
            .or_insert(0);
        *counter += 1;
        Ok(ReferenceNumberAllocator::format_reference(country, *counter))
    }

    async fn update_status(
        &self,
        id: &CaseId,
        status: CaseStatus,
        actor: &UserId,
        details: Option<&str>,
        attachments: &[String],
    ) -> Result<(), RemoteError> {
        self.gate()?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("status:{}:{}", id, status.as_str()));

        let Some(case) = state.cases.get_mut(id.as_str()) else {
            return Err(RemoteError::not_found(format!("no such case: {id}")));
        };
        case.status_history.record(StatusHistoryEntry {
            status,
            timestamp: UnixTimeMs::now(),
            actor: actor.clone(),
            details: details.map(str::to_string),
            attachments: attachments.to_vec(),
        });
        case.status = status;
        Ok(())
    }

    async fn amend(
        &self,
        id: &CaseId,
        patch: &AmendmentPatch,
        actor: &UserId,
    ) -> Result<AmendmentEntry, RemoteError> {
        self.gate()?;
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("amend:{id}"));

        let Some(case) = state.cases.get_mut(id.as_str()) else {
            return Err(RemoteError::not_found(format!("no such case: {id}")));
        };
        // The backend trusts the engine's single-amendment enforcement.
        match apply_amendment(case, patch, actor, None, true, UnixTimeMs::now()) {
            Ok(Some(entry)) => Ok(entry),
            Ok(None) => Ok(AmendmentEntry {
                amendment_id: "mock-noop".into(),
                timestamp: UnixTimeMs::now(),
                actor: actor.clone(),
                reason: None,
                changes: Vec::new(),
            }),
            Err(_) => Err(RemoteError::conflict("already amended")),
        }
    }

    async fn list_cases(&self, filter: &CaseFilter) -> Result<Vec<Case>, RemoteError> {
        self.gate()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .cases
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    async fn health_check(&self) -> Result<(), RemoteError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::network("backend unreachable"))
        }
    }
}

/// One client session: store, queue, ledger and engine over shared storage.
pub struct Harness {
    pub store: CaseStore,
    pub engine: Arc<SyncEngine>,
    pub queue: Arc<OfflineQueue>,
    pub ledger: Arc<CaseLedger>,
    pub events: EventBus,
}

pub async fn build_harness(remote: Arc<MockRemote>, queue_config: QueueConfig) -> Harness {
    let storage: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let queue = Arc::new(
        OfflineQueue::open(storage.clone(), queue_config)
            .await
            .expect("queue open"),
    );
    let ledger = Arc::new(CaseLedger::open(storage).await.expect("ledger open"));
    let events = EventBus::default();

    let store = CaseStore::new(
        remote.clone(),
        queue.clone(),
        ledger.clone(),
        events.clone(),
    );
    let engine = SyncEngine::new(
        queue.clone(),
        remote,
        ledger.clone(),
        events.clone(),
        SyncConfig::default(),
    );

    Harness {
        store,
        engine,
        queue,
        ledger,
        events,
    }
}

/// Fast-retry queue config for tests that exercise the attempt budget.
pub fn fast_retry_config(max_attempts: u32) -> QueueConfig {
    QueueConfig {
        max_attempts,
        base_backoff_ms: 1,
        max_backoff_ms: 10,
        jitter_max_ms: 0,
        ..Default::default()
    }
}

pub fn booking(hospital: &str) -> NewCaseData {
    NewCaseData {
        country: Country::new("SG").expect("valid country"),
        fields: AmendableFields {
            hospital: hospital.into(),
            department: "orthopedics".into(),
            date_of_surgery: "2026-09-01".into(),
            procedure_type: "knee replacement".into(),
            doctor_name: Some("Dr. Lim".into()),
            time_of_procedure: None,
            special_instruction: None,
        },
        submitted_by: UserId::new("booker"),
    }
}
