//! Driver records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-checklist map from question id to a value.
pub type QuestionMap<T> = BTreeMap<String, BTreeMap<String, T>>;

/// Validation state of one question for one driver.
///
/// Serialized as its numeric code. The codes of the first three states are
/// ordered by progress; [`ValidationState::NotApplicable`] sits outside that
/// order (see [`ValidationState::progress`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ValidationState {
    /// Not validated yet.
    #[default]
    Unvalidated,
    /// Partially validated.
    Partial,
    /// Fully validated.
    Validated,
    /// The question does not apply to this driver.
    NotApplicable,
}

impl ValidationState {
    /// Converts to the numeric wire code.
    pub fn code(self) -> u8 {
        match self {
            ValidationState::Unvalidated => 0,
            ValidationState::Partial => 1,
            ValidationState::Validated => 2,
            ValidationState::NotApplicable => 3,
        }
    }

    /// Converts from the numeric wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ValidationState::Unvalidated),
            1 => Some(ValidationState::Partial),
            2 => Some(ValidationState::Validated),
            3 => Some(ValidationState::NotApplicable),
            _ => None,
        }
    }

    /// Progress rank used by the merge: higher means more progress.
    ///
    /// Returns `None` for [`ValidationState::NotApplicable`], which is not
    /// comparable. The merge relies on this exact set of states; a new state
    /// must be given an explicit place here and in `merge_state`.
    pub fn progress(self) -> Option<u8> {
        match self {
            ValidationState::Unvalidated => Some(0),
            ValidationState::Partial => Some(1),
            ValidationState::Validated => Some(2),
            ValidationState::NotApplicable => None,
        }
    }
}

impl TryFrom<u8> for ValidationState {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown validation state {code}"))
    }
}

impl From<ValidationState> for u8 {
    fn from(state: ValidationState) -> Self {
        state.code()
    }
}

/// A tracked driver.
///
/// The three per-checklist maps are keyed the same way (checklist name, then
/// question id) but may cover different questions; a missing entry means
/// the default (unvalidated, no note, no date).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverRecord {
    /// Stable identifier; also the remote folder and file name.
    pub id: Uuid,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Validation state per checklist and question.
    #[serde(default)]
    pub checklist_states: QuestionMap<ValidationState>,
    /// Free-text notes per checklist and question.
    #[serde(default)]
    pub checklist_notes: QuestionMap<String>,
    /// Evaluation date per checklist and question.
    #[serde(default)]
    pub checklist_dates: QuestionMap<DateTime<Utc>>,
    /// Most recent evaluation of any question.
    #[serde(default)]
    pub last_evaluated: Option<DateTime<Utc>>,
    /// Start of the current compliance period.
    #[serde(default)]
    pub period_start: Option<DateTime<Utc>>,
}

impl DriverRecord {
    /// Creates a record with a fresh id whose period starts now.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            period_start: Some(Utc::now()),
            ..Self::with_id(Uuid::new_v4(), name)
        }
    }

    /// Creates an empty record with a known id.
    pub fn with_id(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            checklist_states: BTreeMap::new(),
            checklist_notes: BTreeMap::new(),
            checklist_dates: BTreeMap::new(),
            last_evaluated: None,
            period_start: None,
        }
    }

    /// Returns the state of a question, defaulting to unvalidated.
    pub fn state(&self, checklist: &str, question: &str) -> ValidationState {
        self.checklist_states
            .get(checklist)
            .and_then(|states| states.get(question))
            .copied()
            .unwrap_or_default()
    }

    /// Returns the note of a question, defaulting to empty.
    pub fn note(&self, checklist: &str, question: &str) -> &str {
        self.checklist_notes
            .get(checklist)
            .and_then(|notes| notes.get(question))
            .map_or("", String::as_str)
    }

    /// Returns when a question was last evaluated.
    pub fn evaluated_at(&self, checklist: &str, question: &str) -> Option<DateTime<Utc>> {
        self.checklist_dates
            .get(checklist)
            .and_then(|dates| dates.get(question))
            .copied()
    }

    /// Records an evaluation: sets the state and date, and bumps `last_evaluated`.
    pub fn evaluate(
        &mut self,
        checklist: &str,
        question: &str,
        state: ValidationState,
        at: DateTime<Utc>,
    ) {
        self.checklist_states
            .entry(checklist.to_string())
            .or_default()
            .insert(question.to_string(), state);
        self.checklist_dates
            .entry(checklist.to_string())
            .or_default()
            .insert(question.to_string(), at);
        self.last_evaluated = Some(self.last_evaluated.map_or(at, |prev| prev.max(at)));
    }

    /// Sets or clears (when empty) the note of a question.
    pub fn set_note(&mut self, checklist: &str, question: &str, note: impl Into<String>) {
        let note = note.into();
        if note.is_empty() {
            if let Some(notes) = self.checklist_notes.get_mut(checklist) {
                notes.remove(question);
                if notes.is_empty() {
                    self.checklist_notes.remove(checklist);
                }
            }
        } else {
            self.checklist_notes
                .entry(checklist.to_string())
                .or_default()
                .insert(question.to_string(), note);
        }
    }

    /// Deadline by which the current period must be completed.
    pub fn compliance_deadline(&self, validity: Duration) -> Option<DateTime<Utc>> {
        self.period_start.map(|start| start + validity)
    }

    /// Serializes to JSON.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Deserializes from JSON.
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}
