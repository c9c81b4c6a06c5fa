//! Test fixtures.
//!
//! Deterministic timestamps, sample records and checklists, and a
//! file-backed store that cleans up after itself.

use chrono::{DateTime, TimeZone, Utc};
use fleetcheck_model::{Checklist, ChecklistItem, ChecklistKind, DriverRecord, ValidationState};
use fleetcheck_storage::FileStore;
use tempfile::TempDir;
use uuid::Uuid;

/// Checklist name used by the sample records.
pub const SAMPLE_CHECKLIST: &str = "Conduite";

/// A fixed instant on day `day` of May 2024, 08:30 UTC.
pub fn timestamp(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 8, 30, 0)
        .single()
        .expect("Invalid fixture day")
}

/// A deterministic record id.
pub fn record_id(n: u128) -> Uuid {
    Uuid::from_u128(0x0f1e_e7c0_0000_4000_8000_0000_0000_0000 | n)
}

/// A record with one evaluated question on [`SAMPLE_CHECKLIST`].
///
/// `last_evaluated` and the question date are `timestamp(day)`.
pub fn sample_record(n: u128, name: &str, state: ValidationState, day: u32) -> DriverRecord {
    let mut record = DriverRecord::with_id(record_id(n), name);
    record.period_start = Some(timestamp(1));
    record.evaluate(SAMPLE_CHECKLIST, "q1", state, timestamp(day));
    record
}

/// `count` distinct partially validated records evaluated on day 2.
pub fn sample_records(count: usize) -> Vec<DriverRecord> {
    (0..count)
        .map(|i| {
            sample_record(
                i as u128 + 1,
                &format!("Driver {}", i + 1),
                ValidationState::Partial,
                2,
            )
        })
        .collect()
}

/// A small periodic checklist with two sections.
pub fn sample_checklist(title: &str) -> Checklist {
    let mut checklist = Checklist::new(title, ChecklistKind::Periodic);
    checklist.items = vec![
        ChecklistItem::category("Avant le départ"),
        ChecklistItem::question("Contrôle des pneus"),
        ChecklistItem::question("Niveaux"),
        ChecklistItem::category("En route"),
        ChecklistItem::question("Distances de sécurité"),
    ];
    checklist
}

/// A file-backed store in a temporary directory.
pub struct TempStore {
    /// The store.
    pub store: FileStore,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl TempStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = FileStore::open(temp_dir.path()).expect("Failed to open file store");
        Self {
            store,
            _temp_dir: temp_dir,
        }
    }

    /// Opens a second handle on the same directory, as a restarted process would.
    pub fn reopen(&self) -> FileStore {
        FileStore::open(self._temp_dir.path()).expect("Failed to reopen file store")
    }
}

impl Default for TempStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TempStore {
    type Target = FileStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcheck_storage::KeyValueStore;

    #[test]
    fn sample_records_are_distinct() {
        let records = sample_records(3);
        assert_eq!(records.len(), 3);
        assert_ne!(records[0].id, records[1].id);
        assert_eq!(records[2].name, "Driver 3");
        assert_eq!(records[0].last_evaluated, Some(timestamp(2)));
    }

    #[test]
    fn temp_store_survives_reopen() {
        let temp = TempStore::new();
        temp.save("records", b"[]").unwrap();
        assert_eq!(temp.reopen().load("records").unwrap(), Some(b"[]".to_vec()));
    }

    #[test]
    fn sample_checklist_has_sections() {
        let checklist = sample_checklist("Semestriel");
        assert_eq!(checklist.sections().len(), 2);
        assert_eq!(checklist.questions().count(), 3);
    }
}
