use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::model::{Case, CaseId};
use crate::queue::{OpId, PendingOperation};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const MAX_STORE_BYTES: usize = 100 * 1024 * 1024;
const MAX_SNAPSHOT_OPERATIONS: usize = 10_000;
const MAX_SNAPSHOT_CASES: usize = 10_000;
const STORE_MAGIC: &[u8; 4] = b"CBST";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("store too large: {size} bytes, max {max}")]
    StoreTooLarge { size: usize, max: usize },

    #[error("too many pending operations: {count}, max {max}")]
    TooManyOperations { count: usize, max: usize },

    #[error("too many cases: {count}, max {max}")]
    TooManyCases { count: usize, max: usize },

    #[error("sqlite error: {0}")]
    Sqlite(String),
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Everything the engine persists: the locally materialized cases and the
/// pending operation queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub schema_version: u32,
    pub cases: Vec<Case>,
    pub operations: Vec<PendingOperation>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            cases: Vec::new(),
            operations: Vec::new(),
        }
    }
}

/// A set of writes applied as one atomic unit, so a crash between an
/// enqueue and its case upsert (or a commit and its removal) cannot leave a
/// half-applied operation.
#[derive(Debug, Default)]
pub struct StoreBatch {
    upsert_cases: Vec<Case>,
    delete_cases: Vec<CaseId>,
    upsert_ops: Vec<PendingOperation>,
    delete_ops: Vec<OpId>,
}

impl StoreBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn upsert_case(mut self, case: Case) -> Self {
        self.upsert_cases.push(case);
        self
    }

    #[must_use]
    pub fn delete_case(mut self, id: CaseId) -> Self {
        self.delete_cases.push(id);
        self
    }

    #[must_use]
    pub fn upsert_op(mut self, op: PendingOperation) -> Self {
        self.upsert_ops.push(op);
        self
    }

    #[must_use]
    pub fn delete_op(mut self, id: OpId) -> Self {
        self.delete_ops.push(id);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upsert_cases.is_empty()
            && self.delete_cases.is_empty()
            && self.upsert_ops.is_empty()
            && self.delete_ops.is_empty()
    }
}

fn apply_to_snapshot(snapshot: &mut StoreSnapshot, batch: &StoreBatch) {
    for case in &batch.upsert_cases {
        match snapshot.cases.iter_mut().find(|c| c.id == case.id) {
            Some(slot) => *slot = case.clone(),
            None => snapshot.cases.push(case.clone()),
        }
    }
    for id in &batch.delete_cases {
        snapshot.cases.retain(|c| &c.id != id);
    }
    for op in &batch.upsert_ops {
        match snapshot.operations.iter_mut().find(|o| o.op_id == op.op_id) {
            Some(slot) => *slot = op.clone(),
            None => snapshot.operations.push(op.clone()),
        }
    }
    for id in &batch.delete_ops {
        snapshot.operations.retain(|o| &o.op_id != id);
    }
}

/// Durable local persistence, keyed by case id and queue-entry id.
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<StoreSnapshot, StoreError>;
    async fn apply(&self, batch: StoreBatch) -> Result<(), StoreError>;
    async fn sync(&self) -> Result<(), StoreError>;
}

// ----------------------------------------------------------------------------
// In-memory backend
// ----------------------------------------------------------------------------

/// Non-durable backend for tests and ephemeral embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreSnapshot>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        Ok(self.state.read().await.clone())
    }

    async fn apply(&self, batch: StoreBatch) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        apply_to_snapshot(&mut state, &batch);
        Ok(())
    }

    async fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Single-file backend
// ----------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotPayload {
    cases: Vec<Case>,
    operations: Vec<PendingOperation>,
}

/// File-backed store: one CBOR envelope with a blake3 checksum, replaced
/// atomically (temp file, fsync, rename, parent-dir fsync) on every apply.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: RwLock<StoreSnapshot>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let snapshot = if path.exists() {
            let bytes = std::fs::read(&path)?;
            if bytes.is_empty() {
                return Err(StoreError::Corrupted {
                    reason: "empty file",
                });
            }
            decode_snapshot(&bytes)?
        } else {
            StoreSnapshot::default()
        };

        Ok(Self {
            path,
            state: RwLock::new(snapshot),
        })
    }

    fn write_to_disk(&self, snapshot: &StoreSnapshot) -> Result<(), StoreError> {
        let encoded = encode_snapshot(snapshot)?;

        let tmp_path = self.path.with_extension("tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(&encoded)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for FileStore {
    async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        Ok(self.state.read().await.clone())
    }

    async fn apply(&self, batch: StoreBatch) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let mut updated = state.clone();
        apply_to_snapshot(&mut updated, &batch);
        self.write_to_disk(&updated)?;
        *state = updated;
        Ok(())
    }

    async fn sync(&self) -> Result<(), StoreError> {
        // Every apply already fsyncs the file and its directory.
        Ok(())
    }
}

fn encode_snapshot(snapshot: &StoreSnapshot) -> Result<Vec<u8>, StoreError> {
    let payload = SnapshotPayload {
        cases: snapshot.cases.clone(),
        operations: snapshot.operations.clone(),
    };

    let mut payload_bytes = Vec::new();
    ciborium::into_writer(&payload, &mut payload_bytes)?;

    let checksum = blake3::hash(&payload_bytes);

    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: snapshot.schema_version,
        checksum: *checksum.as_bytes(),
        payload: payload_bytes,
    };

    let mut envelope_bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut envelope_bytes)?;
    Ok(envelope_bytes)
}

fn decode_snapshot(bytes: &[u8]) -> Result<StoreSnapshot, StoreError> {
    if bytes.len() > MAX_STORE_BYTES {
        return Err(StoreError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_STORE_BYTES,
        });
    }

    let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual_checksum = blake3::hash(&envelope.payload);
    if actual_checksum.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual_checksum.as_bytes()),
        });
    }

    let payload: SnapshotPayload = ciborium::from_reader(&envelope.payload[..])?;

    if payload.operations.len() > MAX_SNAPSHOT_OPERATIONS {
        return Err(StoreError::TooManyOperations {
            count: payload.operations.len(),
            max: MAX_SNAPSHOT_OPERATIONS,
        });
    }
    if payload.cases.len() > MAX_SNAPSHOT_CASES {
        return Err(StoreError::TooManyCases {
            count: payload.cases.len(),
            max: MAX_SNAPSHOT_CASES,
        });
    }

    if envelope.schema_version < CURRENT_SCHEMA_VERSION {
        return migrate(envelope.schema_version, payload);
    }

    Ok(StoreSnapshot {
        schema_version: envelope.schema_version,
        cases: payload.cases,
        operations: payload.operations,
    })
}

fn migrate(from_version: u32, _payload: SnapshotPayload) -> Result<StoreSnapshot, StoreError> {
    // No earlier schema has shipped.
    Err(StoreError::UnknownSchema(from_version))
}

// ----------------------------------------------------------------------------
// SQLite backend
// ----------------------------------------------------------------------------

/// SQLite-backed store: one row per case and per pending operation, each
/// apply in a single transaction.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::with_connection(rusqlite::Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(rusqlite::Connection::open_in_memory()?)
    }

    fn with_connection(conn: rusqlite::Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cases (
                id TEXT PRIMARY KEY,
                data BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pending_operations (
                op_id TEXT PRIMARY KEY,
                case_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                data BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_operations_case
                ON pending_operations(case_id);
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait::async_trait]
impl StateStore for SqliteStore {
    async fn load(&self) -> Result<StoreSnapshot, StoreError> {
        let conn = self.conn.lock().await;

        let mut cases = Vec::new();
        let mut stmt = conn.prepare("SELECT data FROM cases")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let data: Vec<u8> = row.get(0)?;
            cases.push(serde_json::from_slice(&data)?);
        }

        let mut operations = Vec::new();
        let mut stmt = conn.prepare(
            "SELECT data FROM pending_operations ORDER BY created_at ASC, op_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let data: Vec<u8> = row.get(0)?;
            operations.push(serde_json::from_slice(&data)?);
        }

        Ok(StoreSnapshot {
            schema_version: CURRENT_SCHEMA_VERSION,
            cases,
            operations,
        })
    }

    async fn apply(&self, batch: StoreBatch) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        for case in &batch.upsert_cases {
            let data = serde_json::to_vec(case)?;
            tx.execute(
                r#"
                INSERT INTO cases (id, data) VALUES (?1, ?2)
                ON CONFLICT(id) DO UPDATE SET data = excluded.data
                "#,
                rusqlite::params![case.id.as_str(), data],
            )?;
        }
        for id in &batch.delete_cases {
            tx.execute("DELETE FROM cases WHERE id = ?1", [id.as_str()])?;
        }
        for op in &batch.upsert_ops {
            let data = serde_json::to_vec(op)?;
            tx.execute(
                r#"
                INSERT INTO pending_operations (op_id, case_id, created_at, data)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(op_id) DO UPDATE SET
                    case_id = excluded.case_id,
                    created_at = excluded.created_at,
                    data = excluded.data
                "#,
                rusqlite::params![
                    op.op_id.as_str(),
                    op.case_id.as_str(),
                    op.created_at.0 as i64,
                    data
                ],
            )?;
        }
        for id in &batch.delete_ops {
            tx.execute(
                "DELETE FROM pending_operations WHERE op_id = ?1",
                [id.as_str()],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    async fn sync(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AmendableFields, CaseReference, Country, UnixTimeMs, UserId};
    use crate::queue::{OperationKind, PendingOperation};
    use tempfile::tempdir;

    fn sample_case(id: &str) -> Case {
        Case::new(
            CaseId::new(id),
            CaseReference::canonical("SG-000001"),
            Country::new("SG").unwrap(),
            AmendableFields::default(),
            UserId::new("booker"),
            UnixTimeMs(1_000),
        )
    }

    fn sample_op(case_id: &str) -> PendingOperation {
        PendingOperation::new(
            CaseId::new(case_id),
            OperationKind::StatusUpdate {
                status: crate::model::CaseStatus::Preparing,
                actor: UserId::new("booker"),
                details: None,
                attachments: Vec::new(),
                timestamp: UnixTimeMs(2_000),
            },
            UnixTimeMs(2_000),
        )
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryStore::new();
        let case = sample_case("C1");
        let op = sample_op("C1");

        store
            .apply(StoreBatch::new().upsert_case(case.clone()).upsert_op(op.clone()))
            .await
            .unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.cases.len(), 1);
        assert_eq!(snapshot.operations.len(), 1);

        store
            .apply(StoreBatch::new().delete_op(op.op_id.clone()))
            .await
            .unwrap();
        let snapshot = store.load().await.unwrap();
        assert!(snapshot.operations.is_empty());
    }

    #[tokio::test]
    async fn upsert_replaces_existing_case() {
        let store = MemoryStore::new();
        let mut case = sample_case("C1");
        store
            .apply(StoreBatch::new().upsert_case(case.clone()))
            .await
            .unwrap();

        case.fields.hospital = "City Hospital".into();
        store
            .apply(StoreBatch::new().upsert_case(case.clone()))
            .await
            .unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.cases.len(), 1);
        assert_eq!(snapshot.cases[0].fields.hospital, "City Hospital");
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.bin");

        {
            let store = FileStore::open(&path).unwrap();
            store
                .apply(
                    StoreBatch::new()
                        .upsert_case(sample_case("C1"))
                        .upsert_op(sample_op("C1")),
                )
                .await
                .unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.cases.len(), 1);
        assert_eq!(snapshot.operations.len(), 1);
        assert_eq!(snapshot.cases[0].id.as_str(), "C1");
    }

    #[tokio::test]
    async fn file_store_atomic_write_leaves_no_tmp() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.bin");

        let store = FileStore::open(&path).unwrap();
        store
            .apply(StoreBatch::new().upsert_case(sample_case("C1")))
            .await
            .unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let snapshot = StoreSnapshot {
            cases: vec![sample_case("C1")],
            ..Default::default()
        };
        let mut encoded = encode_snapshot(&snapshot).unwrap();
        if let Some(byte) = encoded.last_mut() {
            *byte ^= 0xFF;
        }

        assert!(decode_snapshot(&encoded).is_err());
    }

    #[test]
    fn future_schema_is_rejected() {
        let snapshot = StoreSnapshot {
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            ..Default::default()
        };
        let encoded = encode_snapshot(&snapshot).unwrap();

        assert!(matches!(
            decode_snapshot(&encoded),
            Err(StoreError::FutureSchema { .. })
        ));
    }

    #[test]
    fn oversized_input_is_rejected() {
        let oversized = vec![0u8; MAX_STORE_BYTES + 1];
        assert!(matches!(
            decode_snapshot(&oversized),
            Err(StoreError::StoreTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn sqlite_store_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let case = sample_case("C1");
        let op = sample_op("C1");

        store
            .apply(
                StoreBatch::new()
                    .upsert_case(case.clone())
                    .upsert_op(op.clone()),
            )
            .await
            .unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.cases.len(), 1);
        assert_eq!(snapshot.operations.len(), 1);
        assert_eq!(snapshot.operations[0].op_id, op.op_id);

        store
            .apply(
                StoreBatch::new()
                    .delete_case(case.id.clone())
                    .delete_op(op.op_id.clone()),
            )
            .await
            .unwrap();

        let snapshot = store.load().await.unwrap();
        assert!(snapshot.cases.is_empty());
        assert!(snapshot.operations.is_empty());
    }

    #[tokio::test]
    async fn sqlite_store_orders_operations_by_creation() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut first = sample_op("C1");
        first.created_at = UnixTimeMs(1_000);
        let mut second = sample_op("C1");
        second.created_at = UnixTimeMs(2_000);

        // Insert out of order; load must come back in creation order.
        store
            .apply(
                StoreBatch::new()
                    .upsert_op(second.clone())
                    .upsert_op(first.clone()),
            )
            .await
            .unwrap();

        let snapshot = store.load().await.unwrap();
        assert_eq!(snapshot.operations[0].op_id, first.op_id);
        assert_eq!(snapshot.operations[1].op_id, second.op_id);
    }
}
