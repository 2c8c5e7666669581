use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    AmendableFields, AmendmentEntry, AmendmentPatch, Case, FieldChange, UnixTimeMs, UserId,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmendError {
    #[error("case has already been amended once; override privilege required")]
    AlreadyAmended,
}

/// Apply an amendment to a case.
///
/// The first amendment snapshots the then-current amendable fields into
/// `original_values` exactly once; later amendments never overwrite the
/// snapshot. A second amendment without override fails with no mutation.
/// With override the entry is appended alongside the first, never replacing
/// it. A patch that changes nothing is a no-op and returns `Ok(None)`
/// without consuming the single-amendment budget.
pub fn apply_amendment(
    case: &mut Case,
    patch: &AmendmentPatch,
    actor: &UserId,
    reason: Option<String>,
    allow_override: bool,
    now: UnixTimeMs,
) -> Result<Option<AmendmentEntry>, AmendError> {
    if case.is_amended && !allow_override {
        return Err(AmendError::AlreadyAmended);
    }

    let (updated, changes) = diff_fields(&case.fields, patch);
    if changes.is_empty() {
        return Ok(None);
    }

    if case.original_values.is_none() {
        case.original_values = Some(case.fields.clone());
    }

    let entry = AmendmentEntry {
        amendment_id: Uuid::new_v4().to_string(),
        timestamp: now,
        actor: actor.clone(),
        reason,
        changes,
    };

    case.fields = updated;
    case.is_amended = true;
    case.amendment_history.push(entry.clone());

    Ok(Some(entry))
}

/// Compute the patched fields plus the per-field diff. Unchanged fields are
/// omitted from the change list.
#[must_use]
pub fn diff_fields(
    current: &AmendableFields,
    patch: &AmendmentPatch,
) -> (AmendableFields, Vec<FieldChange>) {
    let mut updated = current.clone();
    let mut changes = Vec::new();

    let mut diff_required = |field: &str, slot: &mut String, new: &Option<String>| {
        if let Some(new) = new {
            if new != slot {
                changes.push(FieldChange {
                    field: field.to_string(),
                    old_value: Some(slot.clone()),
                    new_value: Some(new.clone()),
                });
                *slot = new.clone();
            }
        }
    };

    diff_required("hospital", &mut updated.hospital, &patch.hospital);
    diff_required("department", &mut updated.department, &patch.department);
    diff_required(
        "date_of_surgery",
        &mut updated.date_of_surgery,
        &patch.date_of_surgery,
    );
    diff_required(
        "procedure_type",
        &mut updated.procedure_type,
        &patch.procedure_type,
    );

    let mut diff_optional = |field: &str, slot: &mut Option<String>, new: &Option<String>| {
        if let Some(new) = new {
            if slot.as_deref() != Some(new.as_str()) {
                changes.push(FieldChange {
                    field: field.to_string(),
                    old_value: slot.clone(),
                    new_value: Some(new.clone()),
                });
                *slot = Some(new.clone());
            }
        }
    };

    diff_optional("doctor_name", &mut updated.doctor_name, &patch.doctor_name);
    diff_optional(
        "time_of_procedure",
        &mut updated.time_of_procedure,
        &patch.time_of_procedure,
    );
    diff_optional(
        "special_instruction",
        &mut updated.special_instruction,
        &patch.special_instruction,
    );

    (updated, changes)
}
