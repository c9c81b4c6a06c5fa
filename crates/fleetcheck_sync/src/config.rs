//! Configuration for the sync layer.

use fleetcheck_model::ConflictPolicy;
use std::time::Duration;

/// Configuration for sync passes and pushes.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Root folder of the application on the remote store.
    pub base_path: String,
    /// Organization scope used when no account is authenticated.
    pub fallback_scope: String,
    /// Seal uploaded payloads.
    pub encrypt: bool,
    /// Compress uploaded payloads.
    pub compress: bool,
    /// Wrap uploads in the signed metadata envelope.
    pub sign_metadata: bool,
    /// What to do with conflicting records.
    pub conflict_policy: ConflictPolicy,
    /// Request timeout for remote calls.
    pub request_timeout: Duration,
    /// Quiet period before local mutations are pushed.
    pub debounce: Duration,
}

impl SyncConfig {
    /// Creates a configuration rooted at `base_path`.
    pub fn new(base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            fallback_scope: "shared-dev".into(),
            encrypt: true,
            compress: true,
            sign_metadata: false,
            conflict_policy: ConflictPolicy::AutoMerge,
            request_timeout: Duration::from_secs(30),
            debounce: Duration::from_secs(2),
        }
    }

    /// Sets the fallback organization scope.
    pub fn with_fallback_scope(mut self, scope: impl Into<String>) -> Self {
        self.fallback_scope = scope.into();
        self
    }

    /// Enables or disables sealing.
    pub fn with_encryption(mut self, encrypt: bool) -> Self {
        self.encrypt = encrypt;
        self
    }

    /// Enables or disables compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Enables or disables the signed metadata envelope.
    pub fn with_signed_metadata(mut self, sign: bool) -> Self {
        self.sign_metadata = sign;
        self
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the auto-sync debounce.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("FleetCheck")
    }
}

/// Configuration for the offline queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Failed drains after which an item is dropped.
    pub max_retries: u32,
    /// Pause between two items of a drain.
    pub inter_item_delay: Duration,
    /// Start a drain right after an enqueue while online.
    pub drain_on_enqueue: bool,
}

impl QueueConfig {
    /// Creates a configuration with the given retry ceiling.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            inter_item_delay: Duration::from_millis(500),
            drain_on_enqueue: true,
        }
    }

    /// Sets the pause between items.
    pub fn with_inter_item_delay(mut self, delay: Duration) -> Self {
        self.inter_item_delay = delay;
        self
    }

    /// Enables or disables the drain after enqueue.
    pub fn with_drain_on_enqueue(mut self, drain: bool) -> Self {
        self.drain_on_enqueue = drain;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Configuration for the organization secret and key derivation.
#[derive(Clone)]
pub struct SecretConfig {
    /// Age after which the cached secret is refetched.
    pub refresh_interval: Duration,
    /// Salt appended to the secret before hashing.
    pub key_salt: String,
    /// Secret used before any organization secret was fetched.
    ///
    /// Payloads written by older app versions were sealed under this secret.
    pub default_secret: String,
}

impl SecretConfig {
    /// Sets the refresh interval.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Sets the key salt.
    pub fn with_key_salt(mut self, salt: impl Into<String>) -> Self {
        self.key_salt = salt.into();
        self
    }

    /// Sets the default secret.
    pub fn with_default_secret(mut self, secret: impl Into<String>) -> Self {
        self.default_secret = secret.into();
        self
    }
}

impl Default for SecretConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(24 * 60 * 60),
            key_salt: "fleetcheck-payload-v1".into(),
            default_secret: "fleetcheck-shared-default-secret".into(),
        }
    }
}

impl std::fmt::Debug for SecretConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretConfig")
            .field("refresh_interval", &self.refresh_interval)
            .field("key_salt", &self.key_salt)
            .field("default_secret", &"[REDACTED]")
            .finish()
    }
}

/// Endpoints of the HTTP remote store and secret authority.
#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// Drive root URL, e.g. `https://graph.example.com/v1.0/me/drive`.
    pub store_url: String,
    /// Secret authority URL; `/organization/secret` is appended.
    pub authority_url: String,
    /// Request timeout.
    pub timeout: Duration,
}

impl HttpStoreConfig {
    /// Creates a configuration with a 30s timeout.
    pub fn new(store_url: impl Into<String>, authority_url: impl Into<String>) -> Self {
        Self {
            store_url: store_url.into(),
            authority_url: authority_url.into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Sets the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.base_path, "FleetCheck");
        assert_eq!(config.fallback_scope, "shared-dev");
        assert!(config.encrypt && config.compress);
        assert!(!config.sign_metadata);
        assert_eq!(config.conflict_policy, ConflictPolicy::AutoMerge);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.debounce, Duration::from_secs(2));
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("Other")
            .with_fallback_scope("local")
            .with_encryption(false)
            .with_signed_metadata(true)
            .with_conflict_policy(ConflictPolicy::Manual)
            .with_debounce(Duration::from_millis(10));

        assert_eq!(config.base_path, "Other");
        assert_eq!(config.fallback_scope, "local");
        assert!(!config.encrypt);
        assert!(config.sign_metadata);
        assert_eq!(config.conflict_policy, ConflictPolicy::Manual);
        assert_eq!(config.debounce, Duration::from_millis(10));
    }

    #[test]
    fn queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.inter_item_delay, Duration::from_millis(500));
        assert!(config.drain_on_enqueue);
    }

    #[test]
    fn secret_config_redacts_default_secret() {
        let config = SecretConfig::default();
        assert_eq!(config.refresh_interval, Duration::from_secs(86_400));
        assert!(!format!("{config:?}").contains(&config.default_secret));
    }
}
