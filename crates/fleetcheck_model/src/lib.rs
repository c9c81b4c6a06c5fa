//! # fleetcheck model
//!
//! Data model and conflict resolver for the fleetcheck replica.
//!
//! This crate provides:
//! - [`DriverRecord`] with per-checklist validation states, notes and dates
//! - [`Checklist`] definitions with implicit category grouping
//! - [`PendingOperation`] for the offline retry queue
//! - Conflict detection and the deterministic per-field [`merge`]
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod checklist;
mod conflict;
mod operation;
mod record;

pub use checklist::{Checklist, ChecklistItem, ChecklistKind, Section};
pub use conflict::{
    detect_conflicts, has_significant_differences, merge, ConflictPolicy, ConflictResolution,
    SyncConflict, NOTE_FUSION_SEPARATOR,
};
pub use operation::{OperationKind, PendingOperation};
pub use record::{DriverRecord, QuestionMap, ValidationState};
