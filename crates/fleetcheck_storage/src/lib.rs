//! # fleetcheck storage
//!
//! Persistent key-value storage used by the local replica, the offline
//! queue and the secret cache.
//!
//! Stores are **opaque blob stores**: they load and save byte blobs by key
//! and never interpret what they hold. Callers own the serialization format.
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral state
//! - [`FileStore`] - One file per key inside a directory
//!
//! ## Example
//!
//! ```rust
//! use fleetcheck_storage::{InMemoryStore, KeyValueStore};
//!
//! let store = InMemoryStore::new();
//! store.save("records", b"[]").unwrap();
//! assert_eq!(store.load("records").unwrap().as_deref(), Some(&b"[]"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use store::{validate_key, KeyValueStore};
