//! Property-based test generators using proptest.
//!
//! Key spaces are kept small so that two generated records overlap on
//! checklist and question names often enough to exercise the merge rules.

use chrono::{DateTime, TimeZone, Utc};
use fleetcheck_model::{DriverRecord, QuestionMap, ValidationState};
use proptest::prelude::*;
use uuid::Uuid;

/// Strategy for any validation state.
pub fn validation_state_strategy() -> impl Strategy<Value = ValidationState> {
    prop_oneof![
        Just(ValidationState::Unvalidated),
        Just(ValidationState::Partial),
        Just(ValidationState::Validated),
        Just(ValidationState::NotApplicable),
    ]
}

/// Strategy for whole-second timestamps between 2020 and 2030.
pub fn timestamp_strategy() -> impl Strategy<Value = DateTime<Utc>> {
    (1_577_836_800i64..1_893_456_000i64).prop_map(|secs| {
        Utc.timestamp_opt(secs, 0)
            .single()
            .expect("Timestamp in range")
    })
}

/// Strategy for checklist names drawn from a small fixed set.
pub fn checklist_name_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("Initial".to_string()),
        Just("Periodic".to_string()),
        Just("Specialized".to_string()),
    ]
}

/// Strategy for question ids drawn from a small fixed set.
pub fn question_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("q[0-5]").expect("Invalid regex")
}

/// Strategy for a checklist/question map with values from `value`.
pub fn question_map_strategy<T, S>(value: S) -> impl Strategy<Value = QuestionMap<T>>
where
    T: std::fmt::Debug,
    S: Strategy<Value = T>,
{
    prop::collection::btree_map(
        checklist_name_strategy(),
        prop::collection::btree_map(question_id_strategy(), value, 0..4),
        0..3,
    )
}

/// Strategy for notes, including the empty note.
pub fn note_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z ]{0,12}").expect("Invalid regex")
}

/// Strategy for a record with the given id.
pub fn driver_record_with_id(id: Uuid) -> impl Strategy<Value = DriverRecord> {
    (
        "[A-Z][a-z]{1,8}",
        question_map_strategy(validation_state_strategy()),
        question_map_strategy(note_strategy()),
        question_map_strategy(timestamp_strategy()),
        proptest::option::of(timestamp_strategy()),
        proptest::option::of(timestamp_strategy()),
    )
        .prop_map(
            move |(name, states, notes, dates, last_evaluated, period_start)| DriverRecord {
                id,
                name,
                checklist_states: states,
                checklist_notes: notes,
                checklist_dates: dates,
                last_evaluated,
                period_start,
            },
        )
}

/// Strategy for a record with a random id.
pub fn driver_record_strategy() -> impl Strategy<Value = DriverRecord> {
    any::<u128>().prop_flat_map(|n| driver_record_with_id(Uuid::from_u128(n)))
}

/// Strategy for two versions of the same record.
pub fn record_pair_strategy() -> impl Strategy<Value = (DriverRecord, DriverRecord)> {
    any::<u128>().prop_flat_map(|n| {
        let id = Uuid::from_u128(n);
        (driver_record_with_id(id), driver_record_with_id(id))
    })
}

/// Strategy for arbitrary JSON documents serialized to bytes.
pub fn json_payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    let leaf = prop_oneof![
        Just(serde_json::Value::Null),
        any::<bool>().prop_map(serde_json::Value::from),
        any::<i64>().prop_map(serde_json::Value::from),
        "[a-zA-Z0-9 ]{0,16}".prop_map(serde_json::Value::from),
    ];
    let value = leaf.prop_recursive(3, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::from),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|map| serde_json::Value::Object(map.into_iter().collect())),
        ]
    });
    value.prop_map(|v| serde_json::to_vec(&v).expect("JSON serialization"))
}

/// Strategy for serialized records, the payload the codec carries in practice.
pub fn record_payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    driver_record_strategy().prop_map(|record| record.to_json().expect("JSON serialization"))
}
