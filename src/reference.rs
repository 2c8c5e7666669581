use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

use crate::model::{CaseReference, Country, UnixTimeMs};
use crate::remote::{RemoteCaseService, RemoteError};

/// Prefix marking a locally derived reference that a canonical one will
/// replace during reconciliation.
pub const PROVISIONAL_REFERENCE_PREFIX: &str = "TMP";

/// Width of the zero-padded sequence in a canonical reference.
pub const REFERENCE_SEQUENCE_WIDTH: usize = 6;

/// Produces case reference numbers: atomically via the backend while online,
/// provisionally from local entropy while offline.
pub struct ReferenceNumberAllocator {
    remote: Arc<dyn RemoteCaseService>,
}

impl ReferenceNumberAllocator {
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteCaseService>) -> Self {
        Self { remote }
    }

    /// Online path. Uniqueness and per-country monotonicity hold because the
    /// increment-and-read is a single atomic backend operation, not a
    /// read-then-write from this client.
    pub async fn allocate(&self, country: &Country) -> Result<CaseReference, RemoteError> {
        let number = self.remote.allocate_reference(country).await?;
        Ok(CaseReference::canonical(number))
    }

    /// Offline path. The number is not guaranteed unique across independent
    /// offline clients; the paired client token is what reconciliation keys
    /// on, and the number itself is discarded once a canonical one is
    /// committed.
    #[must_use]
    pub fn provisional(&self, country: &Country) -> CaseReference {
        let suffix: u16 = rand::thread_rng().gen();
        CaseReference {
            number: format!(
                "{}-{}-{}{:04x}",
                PROVISIONAL_REFERENCE_PREFIX,
                country.code(),
                UnixTimeMs::now().0,
                suffix
            ),
            provisional: true,
            client_token: Some(Uuid::new_v4().to_string()),
        }
    }

    /// Canonical rendering shared by backends and fakes.
    #[must_use]
    pub fn format_reference(country: &Country, sequence: u64) -> String {
        format!(
            "{}-{:0width$}",
            country.code(),
            sequence,
            width = REFERENCE_SEQUENCE_WIDTH
        )
    }
}
