//! Error types for the payload codec.

use crate::cascade::Strategy;
use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Key material has the wrong length.
    #[error("invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize {
        /// Expected key size in bytes.
        expected: usize,
        /// Actual key size in bytes.
        actual: usize,
    },

    /// Sealing failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Compressing or decompressing failed.
    #[error("compression failed: {0}")]
    Compression(String),

    /// Envelope metadata could not be serialized.
    #[error("metadata serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),

    /// No decode strategy produced a structured payload.
    #[error("payload matched none of {} decode strategies (looks encrypted: {looks_encrypted})", attempts.len())]
    Undecodable {
        /// Result of the "looks encrypted" heuristic for the blob.
        looks_encrypted: bool,
        /// Every strategy tried, in order, with its failure reason.
        attempts: Vec<Attempt>,
    },
}

impl CodecError {
    /// Returns true if the blob looked encrypted but nothing could open it.
    ///
    /// This usually means the payload was sealed under a different key.
    pub fn is_probably_wrong_key(&self) -> bool {
        matches!(
            self,
            CodecError::Undecodable {
                looks_encrypted: true,
                ..
            }
        )
    }

    /// Returns the integrity failure reported by the signed-envelope step, if any.
    pub fn integrity_failure(&self) -> Option<&str> {
        match self {
            CodecError::Undecodable { attempts, .. } => {
                attempts.iter().find_map(|attempt| match &attempt.reason {
                    StepFailure::Integrity(reason) => Some(reason.as_str()),
                    _ => None,
                })
            }
            _ => None,
        }
    }
}

/// One failed strategy in a decode cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// The strategy that was tried.
    pub strategy: Strategy,
    /// Why it did not produce a payload.
    pub reason: StepFailure,
}

/// Why a single decode strategy failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepFailure {
    /// The blob is too short for this format.
    #[error("blob too short ({len} bytes, need {min})")]
    TooShort {
        /// Blob length.
        len: usize,
        /// Minimum length for the format.
        min: usize,
    },

    /// The framing of the blob is invalid.
    #[error("malformed: {0}")]
    Malformed(String),

    /// The output of the step is not valid JSON.
    #[error("output is not structured text")]
    NotStructured,

    /// HMAC or checksum verification failed.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// AES-GCM authentication failed.
    #[error("decryption failed")]
    Decryption,

    /// No decompressor accepted the data.
    #[error("decompression failed: {0}")]
    Decompression(String),
}
