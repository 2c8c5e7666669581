use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    AmendmentEntry, AmendmentPatch, Case, CaseFilter, CaseId, CaseStatus, Country, NewCaseData,
    UserId,
};
use crate::ErrorKind;

/// Failure reported by the backend or the transport, classified so that
/// retryable vs. non-retryable is a type-level decision rather than a
/// caught-exception heuristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{}: {message}", .kind.code())]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
    pub http_status: Option<u16>,
}

impl RemoteError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
        }
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    #[must_use]
    pub fn timeout() -> Self {
        Self::new(ErrorKind::Timeout, "request timed out")
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// Classify a bare HTTP status the way the application layer would.
    #[must_use]
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let kind = match status {
            400 => ErrorKind::Validation,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            409 => ErrorKind::Conflict,
            429 => ErrorKind::RateLimited,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        };
        Self {
            kind,
            message: message.into(),
            http_status: Some(status),
        }
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Bound a remote call; expiry classifies as a retryable timeout.
pub(crate) async fn with_timeout<T, F>(
    limit: std::time::Duration,
    fut: F,
) -> Result<T, RemoteError>
where
    F: std::future::Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::timeout()),
    }
}

/// The backend's acknowledgement of a committed create.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCase {
    pub id: CaseId,
    pub reference_number: String,
}

/// The authoritative backend, out of scope to reimplement. `health_check`
/// is the probe the `ConnectionMonitor` runs; everything else is the case
/// API proper. The backend is not required to deduplicate retried calls;
/// the caller dedups on the history composite key.
#[async_trait::async_trait]
pub trait RemoteCaseService: Send + Sync {
    async fn create_case(&self, payload: &NewCaseData) -> Result<RemoteCase, RemoteError>;

    /// Atomic per-country increment-and-read.
    async fn allocate_reference(&self, country: &Country) -> Result<String, RemoteError>;

    async fn update_status(
        &self,
        id: &CaseId,
        status: CaseStatus,
        actor: &UserId,
        details: Option<&str>,
        attachments: &[String],
    ) -> Result<(), RemoteError>;

    async fn amend(
        &self,
        id: &CaseId,
        patch: &AmendmentPatch,
        actor: &UserId,
    ) -> Result<AmendmentEntry, RemoteError>;

    async fn list_cases(&self, filter: &CaseFilter) -> Result<Vec<Case>, RemoteError>;

    async fn health_check(&self) -> Result<(), RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_classification() {
        assert_eq!(
            RemoteError::from_http_status(400, "bad").kind,
            ErrorKind::Validation
        );
        assert_eq!(
            RemoteError::from_http_status(409, "dup").kind,
            ErrorKind::Conflict
        );
        assert_eq!(
            RemoteError::from_http_status(503, "down").kind,
            ErrorKind::ServerError
        );
        assert_eq!(
            RemoteError::from_http_status(418, "teapot").kind,
            ErrorKind::Unknown
        );
    }

    #[test]
    fn retryability_follows_kind() {
        assert!(RemoteError::network("unreachable").is_retryable());
        assert!(RemoteError::timeout().is_retryable());
        assert!(RemoteError::from_http_status(500, "boom").is_retryable());
        assert!(!RemoteError::validation("bad payload").is_retryable());
        assert!(!RemoteError::conflict("already amended").is_retryable());
    }
}
