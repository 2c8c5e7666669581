use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::history::StatusHistory;

/// Prefix for identifiers issued locally while the backend is unreachable.
pub const PROVISIONAL_ID_PREFIX: &str = "offline_";

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(CaseId);
typed_id!(UserId);

impl CaseId {
    /// Mint a provisional id for a case created while offline. Canonical ids
    /// come from the backend and never carry the prefix.
    #[must_use]
    pub fn provisional() -> Self {
        Self(format!("{}{}", PROVISIONAL_ID_PREFIX, Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_ID_PREFIX)
    }
}

/// Explicit timestamp unit.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    #[must_use]
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or_default(),
        )
    }

    #[must_use]
    pub const fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

/// Country code used to key the backend's reference counters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Country(String);

impl Country {
    const MAX_LENGTH: usize = 8;

    pub fn new(code: impl Into<String>) -> Option<Self> {
        let code = code.into().trim().to_ascii_uppercase();
        if code.is_empty() || code.len() > Self::MAX_LENGTH {
            return None;
        }
        if !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        Some(Self(code))
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Closed set of lifecycle states. Transition legality is not validated:
/// whatever status a caller records is appended as given.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Booked,
    Preparing,
    PendingDelivery,
    Delivered,
    Completed,
    ToBeBilled,
    Closed,
    Cancelled,
}

impl CaseStatus {
    /// The seeded status of every new booking.
    #[must_use]
    pub const fn initial() -> Self {
        Self::Booked
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Booked => "booked",
            Self::Preparing => "preparing",
            Self::PendingDelivery => "pending_delivery",
            Self::Delivered => "delivered",
            Self::Completed => "completed",
            Self::ToBeBilled => "to_be_billed",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A case reference number. Provisional references are locally derived and
/// carry a client token so reconciliation never has to rely on the
/// provisional number itself being unique.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseReference {
    pub number: String,
    pub provisional: bool,
    pub client_token: Option<String>,
}

impl CaseReference {
    #[must_use]
    pub fn canonical(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            provisional: false,
            client_token: None,
        }
    }
}

/// The fields an amendment may touch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmendableFields {
    pub hospital: String,
    pub department: String,
    pub date_of_surgery: String,
    pub procedure_type: String,
    pub doctor_name: Option<String>,
    pub time_of_procedure: Option<String>,
    pub special_instruction: Option<String>,
}

/// One field-level delta inside an amendment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

/// Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: CaseStatus,
    pub timestamp: UnixTimeMs,
    pub actor: UserId,
    pub details: Option<String>,
    pub attachments: Vec<String>,
}

/// Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmendmentEntry {
    pub amendment_id: String,
    pub timestamp: UnixTimeMs,
    pub actor: UserId,
    pub reason: Option<String>,
    pub changes: Vec<FieldChange>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    NeedsResync,
}

impl SyncStatus {
    #[must_use]
    pub const fn is_synced(self) -> bool {
        matches!(self, Self::Synced)
    }

    #[must_use]
    pub const fn is_pending(self) -> bool {
        matches!(self, Self::Pending)
    }

    #[must_use]
    pub const fn needs_resync(self) -> bool {
        matches!(self, Self::NeedsResync)
    }
}

/// A single booking with its audit trails. History and amendment entries are
/// plain owned values; they never point back at the case.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: CaseId,
    pub reference: CaseReference,
    pub country: Country,
    pub fields: AmendableFields,
    pub status: CaseStatus,
    pub submitted_by: UserId,
    pub submitted_at: UnixTimeMs,
    pub processed_by: Option<UserId>,
    pub processed_at: Option<UnixTimeMs>,
    pub status_history: StatusHistory,
    pub amendment_history: Vec<AmendmentEntry>,
    pub is_amended: bool,
    pub original_values: Option<AmendableFields>,
    pub sync_status: SyncStatus,
}

impl Case {
    /// Build a new booking with its seeded initial history entry.
    #[must_use]
    pub fn new(
        id: CaseId,
        reference: CaseReference,
        country: Country,
        fields: AmendableFields,
        submitted_by: UserId,
        submitted_at: UnixTimeMs,
    ) -> Self {
        let mut status_history = StatusHistory::new();
        status_history.record(StatusHistoryEntry {
            status: CaseStatus::initial(),
            timestamp: submitted_at,
            actor: submitted_by.clone(),
            details: None,
            attachments: Vec::new(),
        });

        Self {
            id,
            reference,
            country,
            fields,
            status: CaseStatus::initial(),
            submitted_by,
            submitted_at,
            processed_by: None,
            processed_at: None,
            status_history,
            amendment_history: Vec::new(),
            is_amended: false,
            original_values: None,
            sync_status: SyncStatus::Synced,
        }
    }
}

/// Input for `CaseStore::create_case`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewCaseData {
    pub country: Country,
    pub fields: AmendableFields,
    pub submitted_by: UserId,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseFilter {
    pub country: Option<Country>,
    pub status: Option<CaseStatus>,
    pub department: Option<String>,
}

impl CaseFilter {
    #[must_use]
    pub fn matches(&self, case: &Case) -> bool {
        if let Some(country) = &self.country {
            if &case.country != country {
                return false;
            }
        }
        if let Some(status) = self.status {
            if case.status != status {
                return false;
            }
        }
        if let Some(department) = &self.department {
            if &case.fields.department != department {
                return false;
            }
        }
        true
    }
}

/// A sparse patch over the amendable fields. `None` leaves a field untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmendmentPatch {
    pub hospital: Option<String>,
    pub department: Option<String>,
    pub date_of_surgery: Option<String>,
    pub procedure_type: Option<String>,
    pub doctor_name: Option<String>,
    pub time_of_procedure: Option<String>,
    pub special_instruction: Option<String>,
}

impl AmendmentPatch {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hospital.is_none()
            && self.department.is_none()
            && self.date_of_surgery.is_none()
            && self.procedure_type.is_none()
            && self.doctor_name.is_none()
            && self.time_of_procedure.is_none()
            && self.special_instruction.is_none()
    }
}
