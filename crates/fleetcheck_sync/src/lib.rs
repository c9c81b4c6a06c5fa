//! # fleetcheck sync
//!
//! Keeps the device's driver records in step with the organization's
//! remote document store.
//!
//! This crate provides:
//! - Organization secret cache and payload key service
//! - Remote store abstraction with in-memory and HTTP implementations
//! - Local replica with mutation commands and change observers
//! - Sync engine: fetch, reconcile, apply, upload
//! - Durable offline queue with bounded retries
//! - Debounced auto-sync of local edits
//!
//! ## Architecture
//!
//! There are exactly two replicas: the local one and the remote store.
//! A full pass is **fetch-then-push**:
//! 1. Fetch and decode every remote record (falling back to its backup)
//! 2. Reconcile with the local set, merging conflicts field by field
//! 3. Apply the result locally
//! 4. Upload what the remote side is missing
//!
//! ## Key Invariants
//!
//! - At most one remote-writing operation runs at a time
//! - One undecodable remote record never aborts a pass
//! - A rejected credential is refreshed and retried exactly once
//! - A local edit made during a pass is merged, not overwritten
//! - Queued operations are replayed in enqueue order

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auto_sync;
mod config;
mod connectivity;
mod credentials;
mod engine;
mod error;
#[cfg(feature = "http")]
mod http;
mod payload;
mod queue;
mod remote;
mod replica;
mod secret;

pub use auto_sync::AutoSync;
pub use config::{HttpStoreConfig, QueueConfig, SecretConfig, SyncConfig};
pub use connectivity::Connectivity;
pub use credentials::{organization_scope, CredentialProvider, StaticCredentials};
pub use engine::{
    reconcile, PassReport, PushReport, Reconciliation, SyncEngine, SyncState, SyncStats,
};
pub use error::{SyncError, SyncResult};
#[cfg(feature = "http")]
pub use http::{HttpRemoteStore, HttpSecretAuthority};
pub use payload::PayloadCodec;
pub use queue::{DrainReport, OfflineQueue, OperationDispatcher, QUEUE_KEY};
pub use remote::{InMemoryRemoteStore, RemoteEntry, RemoteLayout, RemoteStore};
pub use replica::{
    ChangeOrigin, LocalReplica, Mutation, ReplicaChange, ReplicaObserver, CHECKLISTS_KEY,
    LAST_SYNCED_KEY, RECORDS_KEY,
};
pub use secret::{
    CachedSecret, KeyService, OrganizationSecret, SecretAuthority, StaticSecretAuthority,
    SECRET_STORE_KEY,
};
