use serde::{Deserialize, Serialize};

use crate::model::{CaseStatus, StatusHistoryEntry};

/// Append-only status trail, kept sorted ascending by timestamp.
///
/// Two dedup rules guard against duplicate submission during retried network
/// calls: the initial status keeps only its earliest occurrence, and every
/// other entry is deduplicated on the (status, timestamp, actor) composite
/// key.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusHistory {
    entries: Vec<StatusHistoryEntry>,
}

impl StatusHistory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> &[StatusHistoryEntry] {
        &self.entries
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&StatusHistoryEntry> {
        self.entries.last()
    }

    /// Append an entry, returning `false` when it was deduplicated away.
    pub fn record(&mut self, entry: StatusHistoryEntry) -> bool {
        if entry.status == CaseStatus::initial() {
            if let Some(pos) = self
                .entries
                .iter()
                .position(|e| e.status == CaseStatus::initial())
            {
                if self.entries[pos].timestamp <= entry.timestamp {
                    return false;
                }
                // The new submission is earlier; it wins, the later one goes.
                self.entries.remove(pos);
            }
        } else if self.entries.iter().any(|e| {
            e.status == entry.status && e.timestamp == entry.timestamp && e.actor == entry.actor
        }) {
            return false;
        }

        let pos = self
            .entries
            .partition_point(|e| e.timestamp <= entry.timestamp);
        self.entries.insert(pos, entry);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{UnixTimeMs, UserId};
    use proptest::prelude::*;

    fn entry(status: CaseStatus, ts: u64, actor: &str) -> StatusHistoryEntry {
        StatusHistoryEntry {
            status,
            timestamp: UnixTimeMs(ts),
            actor: UserId::new(actor),
            details: None,
            attachments: Vec::new(),
        }
    }

    #[test]
    fn initial_entries_collapse_to_earliest() {
        let mut history = StatusHistory::new();
        assert!(history.record(entry(CaseStatus::Booked, 2_000, "a")));
        assert!(!history.record(entry(CaseStatus::Booked, 3_000, "b")));
        assert_eq!(history.len(), 1);
        assert_eq!(history.entries()[0].timestamp, UnixTimeMs(2_000));

        // An earlier submission replaces the later one.
        assert!(history.record(entry(CaseStatus::Booked, 1_000, "c")));
        assert_eq!(history.len(), 1);
        assert_eq!(history.entries()[0].timestamp, UnixTimeMs(1_000));
    }

    #[test]
    fn composite_key_dedupes_retried_updates() {
        let mut history = StatusHistory::new();
        assert!(history.record(entry(CaseStatus::Preparing, 1_000, "a")));
        assert!(!history.record(entry(CaseStatus::Preparing, 1_000, "a")));
        // Same status and time from a different actor is a distinct entry.
        assert!(history.record(entry(CaseStatus::Preparing, 1_000, "b")));
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn entries_stay_sorted_by_timestamp() {
        let mut history = StatusHistory::new();
        history.record(entry(CaseStatus::Booked, 1_000, "a"));
        history.record(entry(CaseStatus::Delivered, 3_000, "a"));
        history.record(entry(CaseStatus::Preparing, 2_000, "a"));

        let timestamps: Vec<u64> = history.entries().iter().map(|e| e.timestamp.0).collect();
        assert_eq!(timestamps, vec![1_000, 2_000, 3_000]);
    }

    #[test]
    fn latest_reflects_newest_entry() {
        let mut history = StatusHistory::new();
        history.record(entry(CaseStatus::Booked, 1_000, "a"));
        history.record(entry(CaseStatus::Closed, 5_000, "a"));
        assert_eq!(history.latest().unwrap().status, CaseStatus::Closed);
    }

    fn arb_status() -> impl Strategy<Value = CaseStatus> {
        prop_oneof![
            Just(CaseStatus::Booked),
            Just(CaseStatus::Preparing),
            Just(CaseStatus::PendingDelivery),
            Just(CaseStatus::Delivered),
            Just(CaseStatus::Completed),
            Just(CaseStatus::Closed),
        ]
    }

    proptest! {
        #[test]
        fn record_preserves_order_and_uniqueness(
            inputs in proptest::collection::vec((arb_status(), 0u64..100, 0u8..3), 0..40)
        ) {
            let mut history = StatusHistory::new();
            for (status, ts, actor) in inputs {
                history.record(entry(status, ts, &format!("actor-{actor}")));
            }

            let entries = history.entries();
            for pair in entries.windows(2) {
                prop_assert!(pair[0].timestamp <= pair[1].timestamp);
            }

            let initial_count = entries
                .iter()
                .filter(|e| e.status == CaseStatus::initial())
                .count();
            prop_assert!(initial_count <= 1);

            for (i, a) in entries.iter().enumerate() {
                for b in &entries[i + 1..] {
                    prop_assert!(
                        !(a.status == b.status
                            && a.timestamp == b.timestamp
                            && a.actor == b.actor)
                    );
                }
            }
        }
    }
}
