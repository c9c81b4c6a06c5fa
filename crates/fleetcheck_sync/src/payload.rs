//! Payload codec bound to the key service.

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::secret::KeyService;
use fleetcheck_codec::{
    decode, decode_with, encode, encode_with_metadata, Decoded, EncodeOptions, KEY_RETRY_CASCADE,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Encodes uploads with the configured layers and decodes downloads with
/// the full cascade.
///
/// When nothing in the cascade succeeds but the blob looks sealed, the
/// organization secret may have rotated since it was cached: the key is
/// refreshed once and the sealed formats are retried once.
pub struct PayloadCodec {
    keys: Arc<KeyService>,
    options: EncodeOptions,
    sign_metadata: bool,
}

impl PayloadCodec {
    /// Creates a codec using the encoding settings of `config`.
    pub fn new(keys: Arc<KeyService>, config: &SyncConfig) -> Self {
        Self {
            keys,
            options: EncodeOptions {
                encrypt: config.encrypt,
                compress: config.compress,
            },
            sign_metadata: config.sign_metadata,
        }
    }

    /// The key service.
    pub fn keys(&self) -> &Arc<KeyService> {
        &self.keys
    }

    /// Encodes raw bytes.
    pub fn encode(&self, bytes: &[u8]) -> SyncResult<Vec<u8>> {
        let key = self.keys.current_key();
        let blob = if self.sign_metadata && self.options.encrypt {
            encode_with_metadata(bytes, &key, self.options.compress)?
        } else {
            encode(bytes, &key, self.options)?
        };
        Ok(blob)
    }

    /// Serializes `value` to JSON and encodes it.
    pub fn encode_json<T: Serialize>(&self, value: &T) -> SyncResult<Vec<u8>> {
        self.encode(&serde_json::to_vec(value)?)
    }

    /// Decodes a blob of unknown provenance.
    pub async fn decode(&self, blob: &[u8]) -> SyncResult<Decoded> {
        let (key, generation) = self.keys.snapshot();
        let err = match decode(blob, &key) {
            Ok(decoded) => return Ok(decoded),
            Err(err) => err,
        };
        if !err.is_probably_wrong_key() {
            return Err(err.into());
        }

        warn!(bytes = blob.len(), "payload looks sealed under another key, refreshing secret");
        if let Err(refresh_err) = self.keys.refresh_unless_newer(generation).await {
            warn!(error = %refresh_err, "secret refresh failed");
            return Err(err.into());
        }

        match decode_with(KEY_RETRY_CASCADE, blob, &self.keys.current_key()) {
            Ok(decoded) => {
                debug!(method = ?decoded.method, "payload decoded after secret refresh");
                Ok(decoded)
            }
            Err(_) => Err(err.into()),
        }
    }

    /// Decodes a blob and deserializes the JSON inside.
    pub async fn decode_json<T: DeserializeOwned>(&self, blob: &[u8]) -> SyncResult<T> {
        let decoded = self.decode(blob).await?;
        Ok(serde_json::from_slice(&decoded.bytes)?)
    }
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("options", &self.options)
            .field("sign_metadata", &self.sign_metadata)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecretConfig;
    use crate::error::SyncError;
    use crate::secret::StaticSecretAuthority;
    use fleetcheck_codec::{CompressionAlgorithm, DecodeMethod, SymmetricKey};
    use fleetcheck_storage::InMemoryStore;

    fn codec(
        authority: Arc<StaticSecretAuthority>,
        config: &SyncConfig,
    ) -> PayloadCodec {
        let keys = KeyService::open(authority, Arc::new(InMemoryStore::new()), SecretConfig::default())
            .unwrap();
        PayloadCodec::new(Arc::new(keys), config)
    }

    #[tokio::test]
    async fn round_trips_with_default_layers() {
        let authority = Arc::new(StaticSecretAuthority::new("org", "Acme"));
        let codec = codec(authority.clone(), &SyncConfig::default());

        let blob = codec.encode(br#"{"name":"Ada"}"#).unwrap();
        let decoded = codec.decode(&blob).await.unwrap();
        assert_eq!(decoded.bytes, br#"{"name":"Ada"}"#);
        assert_eq!(authority.fetch_count(), 0);
    }

    #[tokio::test]
    async fn signed_envelope_when_configured() {
        let authority = Arc::new(StaticSecretAuthority::new("org", "Acme"));
        let codec = codec(authority, &SyncConfig::default().with_signed_metadata(true));

        let blob = codec.encode_json(&serde_json::json!({"n": 1})).unwrap();
        let decoded = codec.decode(&blob).await.unwrap();
        assert!(matches!(decoded.method, DecodeMethod::SignedEnvelope {
                compressed: Some(CompressionAlgorithm::Zlib)
            }));
        let value: serde_json::Value = codec.decode_json(&blob).await.unwrap();
        assert_eq!(value["n"], 1);
    }

    #[tokio::test]
    async fn rotated_secret_is_refreshed_once() {
        let authority = Arc::new(StaticSecretAuthority::new("rotated", "Acme"));
        let codec = codec(authority.clone(), &SyncConfig::default());

        let rotated_key = SymmetricKey::derive("rotated", &SecretConfig::default().key_salt);
        let plaintext = br#"{"n":123456}"#;
        let blob = encode(plaintext, &rotated_key, EncodeOptions::encrypted_only()).unwrap();
        assert_eq!(blob.len(), 40);

        let decoded = codec.decode(&blob).await.unwrap();
        assert_eq!(decoded.bytes, plaintext);
        assert_eq!(decoded.method, DecodeMethod::Aead);
        assert_eq!(authority.fetch_count(), 1);

        // The refreshed key now opens it directly.
        codec.decode(&blob).await.unwrap();
        assert_eq!(authority.fetch_count(), 1);
    }

    #[tokio::test]
    async fn rotated_secret_opens_compressed_payloads() {
        let authority = Arc::new(StaticSecretAuthority::new("rotated", "Acme"));
        let codec = codec(authority.clone(), &SyncConfig::default());

        let rotated_key = SymmetricKey::derive("rotated", &SecretConfig::default().key_salt);
        let plaintext = br#"{"name":"Ada","checklistStates":{}}"#;
        let blob = encode(plaintext, &rotated_key, EncodeOptions::default()).unwrap();

        let decoded = codec.decode(&blob).await.unwrap();
        assert_eq!(decoded.bytes, plaintext);
        assert_eq!(
            decoded.method,
            DecodeMethod::DecryptThenDecompress(CompressionAlgorithm::Zlib)
        );
        assert_eq!(authority.fetch_count(), 1);
    }

    #[tokio::test]
    async fn garbage_refreshes_once_then_fails() {
        let authority = Arc::new(StaticSecretAuthority::new("org", "Acme"));
        let codec = codec(authority.clone(), &SyncConfig::default());

        let garbage: Vec<u8> = (0u8..40).map(|b| b.wrapping_mul(37) ^ 0xA5).collect();
        let err = codec.decode(&garbage).await.unwrap_err();
        assert!(matches!(err, SyncError::Codec(ref e) if e.is_probably_wrong_key()));
        assert_eq!(authority.fetch_count(), 1);
    }

    #[tokio::test]
    async fn structured_garbage_does_not_refresh() {
        let authority = Arc::new(StaticSecretAuthority::new("org", "Acme"));
        let codec = codec(authority.clone(), &SyncConfig::default());

        assert!(codec.decode(b"short").await.is_err());
        assert_eq!(authority.fetch_count(), 0);
    }

    #[tokio::test]
    async fn refresh_failure_reports_decode_error() {
        let authority = Arc::new(StaticSecretAuthority::new("org", "Acme"));
        authority.set_offline(true);
        let codec = codec(authority.clone(), &SyncConfig::default());

        let garbage = vec![0xFFu8; 64];
        assert!(matches!(codec.decode(&garbage).await, Err(SyncError::Codec(_))));
    }
}
