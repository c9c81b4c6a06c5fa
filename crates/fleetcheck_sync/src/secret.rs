//! Organization secret and payload key service.
//!
//! Every device of an organization derives the same payload key from a
//! shared secret published by the secret authority. The service caches the
//! secret in the local key-value store, derives the key once per secret and
//! refetches when the cache is older than the refresh interval, when asked
//! to, or when the codec meets a payload sealed under a rotated secret.

use crate::config::SecretConfig;
use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleetcheck_codec::SymmetricKey;
use fleetcheck_storage::KeyValueStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Store key of the cached secret.
pub const SECRET_STORE_KEY: &str = "organization_secret";

/// Response of the secret authority.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrganizationSecret {
    /// The shared secret.
    pub secret: String,
    /// Display name of the organization.
    #[serde(default)]
    pub organization_name: String,
    /// When the secret was last changed by the organization.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for OrganizationSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrganizationSecret")
            .field("secret", &"[REDACTED]")
            .field("organization_name", &self.organization_name)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Remote authority publishing the organization secret.
#[async_trait]
pub trait SecretAuthority: Send + Sync {
    /// Fetches the current secret.
    async fn fetch_secret(&self) -> SyncResult<OrganizationSecret>;
}

/// An in-process authority for tests and local development.
#[derive(Debug)]
pub struct StaticSecretAuthority {
    current: RwLock<OrganizationSecret>,
    fetches: AtomicUsize,
    offline: AtomicBool,
}

impl StaticSecretAuthority {
    /// Creates an authority publishing `secret`.
    pub fn new(secret: impl Into<String>, organization_name: impl Into<String>) -> Self {
        Self {
            current: RwLock::new(OrganizationSecret {
                secret: secret.into(),
                organization_name: organization_name.into(),
                updated_at: Some(Utc::now()),
            }),
            fetches: AtomicUsize::new(0),
            offline: AtomicBool::new(false),
        }
    }

    /// Publishes a new secret.
    pub fn rotate(&self, secret: impl Into<String>) {
        let mut current = self.current.write();
        current.secret = secret.into();
        current.updated_at = Some(Utc::now());
    }

    /// Makes every fetch fail with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of fetches served or refused.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretAuthority for StaticSecretAuthority {
    async fn fetch_secret(&self) -> SyncResult<OrganizationSecret> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }
        Ok(self.current.read().clone())
    }
}

/// Locally cached secret with its fetch time.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedSecret {
    /// The shared secret.
    pub secret: String,
    /// Display name of the organization.
    #[serde(default)]
    pub organization_name: String,
    /// When the secret was fetched.
    pub cached_at: DateTime<Utc>,
}

impl std::fmt::Debug for CachedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedSecret")
            .field("secret", &"[REDACTED]")
            .field("organization_name", &self.organization_name)
            .field("cached_at", &self.cached_at)
            .finish()
    }
}

struct KeyState {
    cached: Option<CachedSecret>,
    key: SymmetricKey,
    /// Bumped on every successful refresh.
    generation: u64,
}

/// Derives and caches the payload key.
///
/// Reads are lock-free in practice (a short `RwLock` read); refreshes are
/// single-flight: a caller arriving while a refresh runs waits for it and
/// reuses its result instead of fetching again.
pub struct KeyService {
    authority: Arc<dyn SecretAuthority>,
    store: Arc<dyn KeyValueStore>,
    config: SecretConfig,
    state: RwLock<KeyState>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl KeyService {
    /// Opens the service, loading any cached secret from `store`.
    ///
    /// An unreadable cache entry is ignored.
    pub fn open(
        authority: Arc<dyn SecretAuthority>,
        store: Arc<dyn KeyValueStore>,
        config: SecretConfig,
    ) -> SyncResult<Self> {
        let cached = match store.load(SECRET_STORE_KEY)? {
            Some(bytes) => match serde_json::from_slice::<CachedSecret>(&bytes) {
                Ok(cached) if !cached.secret.is_empty() => Some(cached),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "ignoring unreadable cached organization secret");
                    None
                }
            },
            None => None,
        };

        let secret = cached
            .as_ref()
            .map_or(config.default_secret.as_str(), |c| c.secret.as_str());
        let key = SymmetricKey::derive(secret, &config.key_salt);

        Ok(Self {
            authority,
            store,
            state: RwLock::new(KeyState {
                cached,
                key,
                generation: 0,
            }),
            config,
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// The key derived from the current secret.
    pub fn current_key(&self) -> SymmetricKey {
        self.state.read().key.clone()
    }

    /// The cached secret, or the default secret if none was ever fetched.
    pub fn current_secret_or_default(&self) -> String {
        self.state
            .read()
            .cached
            .as_ref()
            .map_or_else(|| self.config.default_secret.clone(), |c| c.secret.clone())
    }

    /// The cached secret, if any.
    pub fn cached_secret(&self) -> Option<CachedSecret> {
        self.state.read().cached.clone()
    }

    /// Key together with the refresh generation it belongs to.
    pub(crate) fn snapshot(&self) -> (SymmetricKey, u64) {
        let state = self.state.read();
        (state.key.clone(), state.generation)
    }

    /// Returns true if no secret is cached or the cache is older than the
    /// refresh interval.
    pub fn is_stale(&self) -> bool {
        let state = self.state.read();
        let Some(cached) = &state.cached else {
            return true;
        };
        match chrono::Duration::from_std(self.config.refresh_interval) {
            Ok(interval) => Utc::now() - cached.cached_at >= interval,
            Err(_) => false,
        }
    }

    /// Fetches the secret from the authority, caches it and swaps the key.
    pub async fn refresh_from_authority(&self) -> SyncResult<String> {
        let generation = self.state.read().generation;
        self.refresh_unless_newer(generation).await
    }

    /// Refreshes only if the cache is stale. Returns true if a fetch happened.
    pub async fn refresh_if_stale(&self) -> SyncResult<bool> {
        if !self.is_stale() {
            return Ok(false);
        }
        self.refresh_from_authority().await?;
        Ok(true)
    }

    /// Refreshes unless a refresh newer than `observed` already completed.
    pub(crate) async fn refresh_unless_newer(&self, observed: u64) -> SyncResult<String> {
        let _guard = self.refresh_lock.lock().await;
        if self.state.read().generation != observed {
            return Ok(self.current_secret_or_default());
        }

        let fetched = self.authority.fetch_secret().await?;
        if fetched.secret.is_empty() {
            return Err(SyncError::Authority("authority returned an empty secret".into()));
        }

        let cached = CachedSecret {
            secret: fetched.secret,
            organization_name: fetched.organization_name,
            cached_at: Utc::now(),
        };
        self.store
            .save(SECRET_STORE_KEY, &serde_json::to_vec(&cached)?)?;

        let key = SymmetricKey::derive(&cached.secret, &self.config.key_salt);
        let secret = cached.secret.clone();
        info!(organization = %cached.organization_name, "organization secret refreshed");

        let mut state = self.state.write();
        state.cached = Some(cached);
        state.key = key;
        state.generation += 1;
        Ok(secret)
    }
}

impl std::fmt::Debug for KeyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("KeyService")
            .field("cached", &state.cached)
            .field("generation", &state.generation)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
