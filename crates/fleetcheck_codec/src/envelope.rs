//! Signed-metadata envelope.
//!
//! ## Layout
//!
//! ```text
//! u32 BE metadata length || metadata JSON || HMAC-SHA256(metadata) || nonce || ciphertext || tag
//! ```
//!
//! The metadata is signed separately from the AEAD seal so that its
//! authenticity can be checked before any decryption is attempted. The
//! checksum inside the metadata covers the sealed plaintext and is verified
//! after opening.

use crate::crypto::{Cipher, SymmetricKey, MIN_SEALED_LEN};
use crate::error::{CodecResult, StepFailure};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Current envelope schema version.
pub const ENVELOPE_VERSION: u32 = 1;

const LEN_PREFIX_SIZE: usize = 4;
const SIGNATURE_SIZE: usize = 32;
/// Smallest metadata block that can be valid JSON (`{}`).
const MIN_METADATA_LEN: usize = 2;

/// Smallest blob that can be an envelope.
pub const MIN_ENVELOPE_LEN: usize =
    LEN_PREFIX_SIZE + MIN_METADATA_LEN + SIGNATURE_SIZE + MIN_SEALED_LEN;

/// Metadata carried in front of a sealed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeMetadata {
    /// Envelope schema version.
    pub version: u32,
    /// When the payload was sealed.
    pub encrypted_at: DateTime<Utc>,
    /// Hex SHA-256 of the sealed plaintext.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl EnvelopeMetadata {
    /// Creates metadata for `plaintext`, stamped now.
    #[must_use]
    pub fn for_plaintext(plaintext: &[u8]) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            encrypted_at: Utc::now(),
            checksum: Some(sha256_hex(plaintext)),
        }
    }
}

/// The verified content of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedEnvelope {
    /// Authenticated metadata.
    pub metadata: EnvelopeMetadata,
    /// Opened plaintext, checksum-verified when the metadata carries one.
    pub plaintext: Vec<u8>,
}

/// Seals `plaintext` inside a signed envelope.
pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> CodecResult<Vec<u8>> {
    assemble(key, &EnvelopeMetadata::for_plaintext(plaintext), plaintext)
}

pub(crate) fn assemble(
    key: &SymmetricKey,
    metadata: &EnvelopeMetadata,
    plaintext: &[u8],
) -> CodecResult<Vec<u8>> {
    let metadata_json = serde_json::to_vec(metadata)?;
    let signature = sign(key, &metadata_json);
    let sealed = Cipher::new(key).encrypt(plaintext)?;

    let mut out = Vec::with_capacity(
        LEN_PREFIX_SIZE + metadata_json.len() + SIGNATURE_SIZE + sealed.len(),
    );
    // Metadata is a few hundred bytes at most; the cast cannot truncate.
    out.extend_from_slice(&(metadata_json.len() as u32).to_be_bytes());
    out.extend_from_slice(&metadata_json);
    out.extend_from_slice(&signature);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Opens a signed envelope.
///
/// Verification order: framing, HMAC over the raw metadata bytes, metadata
/// parse, AEAD open, checksum.
pub fn open(key: &SymmetricKey, blob: &[u8]) -> Result<OpenedEnvelope, StepFailure> {
    if blob.len() < MIN_ENVELOPE_LEN {
        return Err(StepFailure::TooShort {
            len: blob.len(),
            min: MIN_ENVELOPE_LEN,
        });
    }

    let (prefix, rest) = blob.split_at(LEN_PREFIX_SIZE);
    let mut len_bytes = [0u8; LEN_PREFIX_SIZE];
    len_bytes.copy_from_slice(prefix);
    let metadata_len = u32::from_be_bytes(len_bytes) as usize;

    if metadata_len < MIN_METADATA_LEN || metadata_len > rest.len() - SIGNATURE_SIZE - MIN_SEALED_LEN
    {
        return Err(StepFailure::Malformed(format!(
            "metadata length {metadata_len} out of range"
        )));
    }

    let (metadata_json, rest) = rest.split_at(metadata_len);
    let (signature, sealed) = rest.split_at(SIGNATURE_SIZE);

    verify(key, metadata_json, signature)?;

    let metadata: EnvelopeMetadata = serde_json::from_slice(metadata_json)
        .map_err(|e| StepFailure::Malformed(format!("metadata: {e}")))?;

    let plaintext = Cipher::new(key)
        .decrypt(sealed)
        .ok_or(StepFailure::Decryption)?;

    if let Some(expected) = &metadata.checksum {
        let actual = sha256_hex(&plaintext);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(StepFailure::Integrity(format!(
                "checksum mismatch: expected {expected}, got {actual}"
            )));
        }
    }

    Ok(OpenedEnvelope {
        metadata,
        plaintext,
    })
}

fn mac(key: &SymmetricKey) -> HmacSha256 {
    HmacSha256::new_from_slice(&key.mac_key()).expect("HMAC can take key of any size")
}

fn sign(key: &SymmetricKey, metadata_json: &[u8]) -> [u8; SIGNATURE_SIZE] {
    let mut mac = mac(key);
    mac.update(metadata_json);
    mac.finalize().into_bytes().into()
}

fn verify(key: &SymmetricKey, metadata_json: &[u8], signature: &[u8]) -> Result<(), StepFailure> {
    let mut mac = mac(key);
    mac.update(metadata_json);
    mac.verify_slice(signature)
        .map_err(|_| StepFailure::Integrity("metadata signature mismatch".into()))
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SymmetricKey {
        SymmetricKey::derive("envelope-secret", "salt")
    }

    #[test]
    fn seal_open_roundtrip() {
        let blob = seal(&key(), br#"{"id":1}"#).unwrap();
        let opened = open(&key(), &blob).unwrap();
        assert_eq!(opened.plaintext, br#"{"id":1}"#);
        assert_eq!(opened.metadata.version, ENVELOPE_VERSION);
        assert_eq!(
            opened.metadata.checksum.as_deref(),
            Some(sha256_hex(br#"{"id":1}"#).as_str())
        );
    }

    #[test]
    fn metadata_is_readable_json() {
        let blob = seal(&key(), b"{}").unwrap();
        let len = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
        let value: serde_json::Value = serde_json::from_slice(&blob[4..4 + len]).unwrap();
        assert_eq!(value["version"], 1);
        assert!(value["encryptedAt"].is_string());
        assert!(value["checksum"].is_string());
    }

    #[test]
    fn too_short_blob() {
        let err = open(&key(), &[0u8; MIN_ENVELOPE_LEN - 1]).unwrap_err();
        assert!(matches!(err, StepFailure::TooShort { .. }));
    }

    #[test]
    fn absurd_metadata_length() {
        let mut blob = seal(&key(), b"{}").unwrap();
        blob[..4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            open(&key(), &blob).unwrap_err(),
            StepFailure::Malformed(_)
        ));
    }

    #[test]
    fn tampered_metadata_fails_signature() {
        let mut blob = seal(&key(), b"{}").unwrap();
        // Byte 6 sits inside the metadata JSON.
        blob[6] ^= 0x01;
        assert!(matches!(
            open(&key(), &blob).unwrap_err(),
            StepFailure::Integrity(_)
        ));
    }

    #[test]
    fn wrong_key_fails_signature() {
        let blob = seal(&key(), b"{}").unwrap();
        let other = SymmetricKey::derive("rotated", "salt");
        assert!(matches!(
            open(&other, &blob).unwrap_err(),
            StepFailure::Integrity(_)
        ));
    }

    #[test]
    fn tampered_ciphertext_fails_decryption() {
        let mut blob = seal(&key(), br#"{"a":"b"}"#).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x80;
        assert_eq!(open(&key(), &blob).unwrap_err(), StepFailure::Decryption);
    }

    #[test]
    fn checksum_mismatch_is_integrity_failure() {
        let metadata = EnvelopeMetadata {
            version: ENVELOPE_VERSION,
            encrypted_at: Utc::now(),
            checksum: Some(sha256_hex(b"something else")),
        };
        let blob = assemble(&key(), &metadata, b"{}").unwrap();
        assert!(matches!(
            open(&key(), &blob).unwrap_err(),
            StepFailure::Integrity(reason) if reason.contains("checksum")
        ));
    }

    #[test]
    fn missing_checksum_is_accepted() {
        let metadata = EnvelopeMetadata {
            version: ENVELOPE_VERSION,
            encrypted_at: Utc::now(),
            checksum: None,
        };
        let blob = assemble(&key(), &metadata, b"[]").unwrap();
        assert_eq!(open(&key(), &blob).unwrap().plaintext, b"[]");
    }
}
