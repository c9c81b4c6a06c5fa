//! # fleetcheck testkit
//!
//! Test utilities for fleetcheck.
//!
//! This crate provides:
//! - Fixtures: fixed timestamps, sample records and checklists, temporary stores
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fleetcheck_testkit::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn merge_is_idempotent(record in driver_record_strategy()) {
//!         prop_assert_eq!(merge(&record, &record), record);
//!     }
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use fixtures::*;
pub use generators::*;
