//! Conflict detection and resolution between the local and remote replica.
//!
//! There are exactly two replicas. A record present on both sides is in
//! conflict when its `last_evaluated` timestamps differ *and* the fields a
//! human edits (states, notes, period start) actually differ. Conflicts are
//! resolved by [`merge`], a deterministic per-field rule set.

use crate::record::{DriverRecord, QuestionMap, ValidationState};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// Marker placed between two divergent notes fused by [`merge`].
pub const NOTE_FUSION_SEPARATOR: &str = "\n\n--- Fusion ---\n\n";

/// A record edited on both replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConflict {
    /// Record id.
    pub record_id: Uuid,
    /// Local snapshot.
    pub local: DriverRecord,
    /// Remote snapshot.
    pub remote: DriverRecord,
    /// Local `last_evaluated`.
    pub local_last_evaluated: Option<DateTime<Utc>>,
    /// Remote `last_evaluated`.
    pub remote_last_evaluated: Option<DateTime<Utc>>,
}

impl SyncConflict {
    /// Creates a conflict between two snapshots of the same record.
    pub fn new(local: DriverRecord, remote: DriverRecord) -> Self {
        Self {
            record_id: local.id,
            local_last_evaluated: local.last_evaluated,
            remote_last_evaluated: remote.last_evaluated,
            local,
            remote,
        }
    }

    /// Returns true if the remote snapshot was evaluated more recently.
    pub fn remote_is_newer(&self) -> bool {
        self.remote_last_evaluated > self.local_last_evaluated
    }

    /// Produces the record chosen by `resolution`.
    pub fn resolve(&self, resolution: ConflictResolution) -> DriverRecord {
        match resolution {
            ConflictResolution::KeepLocal => self.local.clone(),
            ConflictResolution::AcceptRemote => self.remote.clone(),
            ConflictResolution::Merge => merge(&self.local, &self.remote),
        }
    }
}

/// Resolution for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Keep local version.
    KeepLocal,
    /// Accept remote version.
    AcceptRemote,
    /// Field-wise merge.
    Merge,
}

/// Policy for conflicts found during a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Merge automatically.
    #[default]
    AutoMerge,
    /// Leave conflicting records untouched and report them for a human decision.
    Manual,
}

impl ConflictPolicy {
    /// Returns true if this policy automatically resolves conflicts.
    pub fn auto_resolves(&self) -> bool {
        matches!(self, ConflictPolicy::AutoMerge)
    }
}

/// Finds local records whose remote counterpart diverged.
pub fn detect_conflicts(local: &[DriverRecord], remote: &[DriverRecord]) -> Vec<SyncConflict> {
    let remote_by_id: HashMap<Uuid, &DriverRecord> =
        remote.iter().map(|record| (record.id, record)).collect();

    local
        .iter()
        .filter_map(|local| {
            let remote = remote_by_id.get(&local.id)?;
            if local.last_evaluated == remote.last_evaluated {
                return None;
            }
            has_significant_differences(local, remote)
                .then(|| SyncConflict::new(local.clone(), (*remote).clone()))
        })
        .collect()
}

/// Returns true if states, notes or period start differ.
///
/// Entries equal to their default (unvalidated, empty note) count as absent.
pub fn has_significant_differences(a: &DriverRecord, b: &DriverRecord) -> bool {
    significant_states(a) != significant_states(b)
        || significant_notes(a) != significant_notes(b)
        || a.period_start != b.period_start
}

fn significant_states(record: &DriverRecord) -> BTreeMap<(&str, &str), ValidationState> {
    flatten(&record.checklist_states)
        .filter(|(_, state)| **state != ValidationState::Unvalidated)
        .map(|(key, state)| (key, *state))
        .collect()
}

fn significant_notes(record: &DriverRecord) -> BTreeMap<(&str, &str), &str> {
    flatten(&record.checklist_notes)
        .filter(|(_, note)| !note.is_empty())
        .map(|(key, note)| (key, note.as_str()))
        .collect()
}

fn flatten<T>(map: &QuestionMap<T>) -> impl Iterator<Item = ((&str, &str), &T)> {
    map.iter().flat_map(|(checklist, questions)| {
        questions
            .iter()
            .map(move |(question, value)| ((checklist.as_str(), question.as_str()), value))
    })
}

/// Merges two versions of the same record.
///
/// - `last_evaluated`: the later one
/// - `period_start`: the earlier one; it anchors a regulatory deadline
/// - states: more progress wins; not-applicable is sticky on either side.
///   A not-applicable remote state replaces a local one too, rather than
///   the local value being kept, so that the state merge is commutative.
/// - notes: divergent notes are fused with [`NOTE_FUSION_SEPARATOR`]
/// - dates: the later one
/// - name: from the more recently evaluated side, local on ties
///
/// Pure; `merge(a, a) == a`.
pub fn merge(local: &DriverRecord, remote: &DriverRecord) -> DriverRecord {
    let name = if remote.last_evaluated > local.last_evaluated {
        remote.name.clone()
    } else {
        local.name.clone()
    };

    DriverRecord {
        id: local.id,
        name,
        checklist_states: merge_maps(&local.checklist_states, &remote.checklist_states, |l, r| {
            Some(merge_state(
                l.copied().unwrap_or_default(),
                r.copied().unwrap_or_default(),
            ))
        }),
        checklist_notes: merge_maps(&local.checklist_notes, &remote.checklist_notes, |l, r| {
            Some(merge_note(l, r))
        }),
        checklist_dates: merge_maps(&local.checklist_dates, &remote.checklist_dates, |l, r| {
            l.max(r).copied()
        }),
        last_evaluated: local.last_evaluated.max(remote.last_evaluated),
        period_start: earliest(local.period_start, remote.period_start),
    }
}

/// Per-question state rule.
///
/// Not-applicable on either side wins regardless of which side is local.
/// Written against the four current states: a new state needs its own
/// arm here rather than falling into the numeric comparison.
fn merge_state(local: ValidationState, remote: ValidationState) -> ValidationState {
    match (local.progress(), remote.progress()) {
        (Some(l), Some(r)) => {
            if r > l {
                remote
            } else {
                local
            }
        }
        _ => ValidationState::NotApplicable,
    }
}

fn merge_note(local: Option<&String>, remote: Option<&String>) -> String {
    match (local, remote) {
        (Some(l), Some(r)) if l.is_empty() => r.clone(),
        (Some(l), Some(r)) if r.is_empty() || l == r => l.clone(),
        (Some(l), Some(r)) => {
            if already_fused(l, r) {
                l.clone()
            } else if already_fused(r, l) {
                r.clone()
            } else {
                format!("{l}{NOTE_FUSION_SEPARATOR}{r}")
            }
        }
        (Some(note), None) | (None, Some(note)) => note.clone(),
        (None, None) => String::new(),
    }
}

/// True if every fused segment of `note` already appears in `fused`.
fn already_fused(fused: &str, note: &str) -> bool {
    let segments: Vec<&str> = fused.split(NOTE_FUSION_SEPARATOR).collect();
    note.split(NOTE_FUSION_SEPARATOR)
        .all(|segment| segments.contains(&segment))
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

fn merge_maps<T>(
    local: &QuestionMap<T>,
    remote: &QuestionMap<T>,
    merge_value: impl Fn(Option<&T>, Option<&T>) -> Option<T>,
) -> QuestionMap<T> {
    let checklists: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();
    checklists
        .into_iter()
        .map(|checklist| {
            let l = local.get(checklist);
            let r = remote.get(checklist);
            let questions: BTreeSet<&String> = l
                .into_iter()
                .flat_map(BTreeMap::keys)
                .chain(r.into_iter().flat_map(BTreeMap::keys))
                .collect();
            let merged = questions
                .into_iter()
                .filter_map(|question| {
                    let value = merge_value(
                        l.and_then(|m| m.get(question)),
                        r.and_then(|m| m.get(question)),
                    )?;
                    Some((question.clone(), value))
                })
                .collect();
            (checklist.clone(), merged)
        })
        .collect()
}
