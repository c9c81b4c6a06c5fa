//! Bearer credentials and organization scoping.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of bearer tokens for the remote store.
///
/// Token acquisition is owned by the host application.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Returns a token for the next request.
    async fn bearer_token(&self) -> SyncResult<String>;

    /// Drops the current token; the next call to
    /// [`bearer_token`](Self::bearer_token) must obtain a fresh one.
    async fn invalidate(&self);

    /// Authenticated account, usually an e-mail address.
    fn account(&self) -> Option<String>;
}

/// A fixed token, for tests and local development.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    token: RwLock<Option<String>>,
    next_token: RwLock<Option<String>>,
    account: Option<String>,
    invalidations: AtomicUsize,
}

impl StaticCredentials {
    /// Creates a provider returning `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
            ..Self::default()
        }
    }

    /// A provider with no token; every request is anonymous.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Sets the authenticated account.
    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// Token handed out after the next invalidation.
    pub fn rotate_on_invalidate(&self, token: impl Into<String>) {
        *self.next_token.write() = Some(token.into());
    }

    /// Number of invalidations so far.
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn bearer_token(&self) -> SyncResult<String> {
        self.token
            .read()
            .clone()
            .ok_or_else(|| SyncError::Unauthorized("no credential available".into()))
    }

    async fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.next_token.write().take() {
            *self.token.write() = Some(next);
        }
    }

    fn account(&self) -> Option<String> {
        self.account.clone()
    }
}

/// Folder name namespacing an organization's data on the remote store.
///
/// The domain of an e-mail account (`ada@acme.fr` gives `acme.fr`), or the
/// whole account otherwise, lowercased with characters outside
/// `[a-z0-9._-]` replaced by `_`. Falls back to `fallback` when
/// unauthenticated.
pub fn organization_scope(account: Option<&str>, fallback: &str) -> String {
    let Some(account) = account.map(str::trim).filter(|a| !a.is_empty()) else {
        return fallback.to_string();
    };
    let domain = account
        .rsplit_once('@')
        .map_or(account, |(_, domain)| domain);

    let scope: String = domain
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    let scope = scope.trim_matches('.');

    if scope.is_empty() {
        fallback.to_string()
    } else {
        scope.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_from_email_domain() {
        assert_eq!(organization_scope(Some("ada@Acme-Transport.fr"), "dev"), "acme-transport.fr");
        assert_eq!(organization_scope(Some("fleet manager"), "dev"), "fleet_manager");
    }

    #[test]
    fn scope_falls_back_when_unauthenticated() {
        assert_eq!(organization_scope(None, "shared-dev"), "shared-dev");
        assert_eq!(organization_scope(Some("  "), "shared-dev"), "shared-dev");
        assert_eq!(organization_scope(Some("ada@..."), "shared-dev"), "shared-dev");
    }

    #[tokio::test]
    async fn static_credentials_rotate() {
        let credentials = StaticCredentials::new("first").with_account("ada@acme.fr");
        credentials.rotate_on_invalidate("second");

        assert_eq!(credentials.bearer_token().await.unwrap(), "first");
        credentials.invalidate().await;
        assert_eq!(credentials.bearer_token().await.unwrap(), "second");
        assert_eq!(credentials.invalidations(), 1);
        assert_eq!(credentials.account().as_deref(), Some("ada@acme.fr"));
    }

    #[tokio::test]
    async fn anonymous_is_unauthorized() {
        let err = StaticCredentials::anonymous().bearer_token().await.unwrap_err();
        assert!(err.is_unauthorized());
    }
}
