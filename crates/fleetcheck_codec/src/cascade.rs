//! The ordered decode cascade.

use crate::compression::CompressionAlgorithm;
use crate::crypto::{Cipher, SymmetricKey, MIN_SEALED_LEN};
use crate::envelope::{self, EnvelopeMetadata, MIN_ENVELOPE_LEN};
use crate::error::{Attempt, CodecError, CodecResult, StepFailure};
use serde::de::IgnoredAny;
use std::ops::ControlFlow;

/// A named way of turning an unknown blob back into a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// The blob is already JSON.
    Plaintext,
    /// Signed metadata envelope around a sealed payload.
    SignedEnvelope,
    /// Bare AES-GCM sealed payload.
    Aead,
    /// Compressed payload, possibly sealed after decompression.
    Decompress,
    /// Sealed compressed payload.
    DecryptThenDecompress,
}

/// Every strategy, in the order the decoder tries them.
pub const FULL_CASCADE: &[Strategy] = &[
    Strategy::Plaintext,
    Strategy::SignedEnvelope,
    Strategy::Aead,
    Strategy::Decompress,
    Strategy::DecryptThenDecompress,
];

/// Strategies retried after the key has been refreshed: every format that
/// a blob sealed under the refreshed key can take.
pub const KEY_RETRY_CASCADE: &[Strategy] = &[
    Strategy::SignedEnvelope,
    Strategy::Aead,
    Strategy::DecryptThenDecompress,
];

/// How a blob was successfully decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMethod {
    /// Untouched JSON.
    Plaintext,
    /// Signed envelope; `compressed` names the decompressor applied to the
    /// opened plaintext, if one was needed.
    SignedEnvelope {
        /// Decompressor applied after opening.
        compressed: Option<CompressionAlgorithm>,
    },
    /// Bare sealed payload.
    Aead,
    /// Compressed JSON.
    Decompress(CompressionAlgorithm),
    /// Sealed payload that had been compressed after sealing.
    DecompressThenDecrypt(CompressionAlgorithm),
    /// Compressed payload that had been sealed after compressing.
    DecryptThenDecompress(CompressionAlgorithm),
}

/// A successfully decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// The JSON payload.
    pub bytes: Vec<u8>,
    /// Which step produced it.
    pub method: DecodeMethod,
    /// Envelope metadata, for [`DecodeMethod::SignedEnvelope`].
    pub metadata: Option<EnvelopeMetadata>,
}

impl Decoded {
    fn new(bytes: Vec<u8>, method: DecodeMethod) -> Self {
        Self {
            bytes,
            method,
            metadata: None,
        }
    }
}

impl Strategy {
    /// Returns a stable, human-readable name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Plaintext => "plaintext",
            Strategy::SignedEnvelope => "signed-envelope",
            Strategy::Aead => "aead",
            Strategy::Decompress => "decompress",
            Strategy::DecryptThenDecompress => "decrypt-then-decompress",
        }
    }

    /// Runs this strategy against `blob`.
    ///
    /// Pure: the only inputs are the blob and the key.
    pub fn attempt(self, blob: &[u8], key: &SymmetricKey) -> Result<Decoded, StepFailure> {
        match self {
            Strategy::Plaintext => {
                if is_structured(blob) {
                    Ok(Decoded::new(blob.to_vec(), DecodeMethod::Plaintext))
                } else {
                    Err(StepFailure::NotStructured)
                }
            }
            Strategy::SignedEnvelope => {
                if blob.len() < MIN_ENVELOPE_LEN {
                    return Err(StepFailure::TooShort {
                        len: blob.len(),
                        min: MIN_ENVELOPE_LEN,
                    });
                }
                let opened = envelope::open(key, blob)?;
                let (bytes, compressed) = if is_structured(&opened.plaintext) {
                    (opened.plaintext, None)
                } else {
                    let (algorithm, bytes) = decompress_structured(&opened.plaintext)
                        .ok_or(StepFailure::NotStructured)?;
                    (bytes, Some(algorithm))
                };
                Ok(Decoded {
                    bytes,
                    method: DecodeMethod::SignedEnvelope { compressed },
                    metadata: Some(opened.metadata),
                })
            }
            Strategy::Aead => {
                if blob.len() < MIN_SEALED_LEN {
                    return Err(StepFailure::TooShort {
                        len: blob.len(),
                        min: MIN_SEALED_LEN,
                    });
                }
                let plaintext = Cipher::new(key)
                    .decrypt(blob)
                    .ok_or(StepFailure::Decryption)?;
                if is_structured(&plaintext) {
                    Ok(Decoded::new(plaintext, DecodeMethod::Aead))
                } else {
                    Err(StepFailure::NotStructured)
                }
            }
            Strategy::Decompress => {
                let cipher = Cipher::new(key);
                for algorithm in CompressionAlgorithm::CASCADE {
                    let Ok(inflated) = algorithm.decompress(blob) else {
                        continue;
                    };
                    if is_structured(&inflated) {
                        return Ok(Decoded::new(inflated, DecodeMethod::Decompress(algorithm)));
                    }
                    if let Some(plaintext) = cipher.decrypt(&inflated) {
                        if is_structured(&plaintext) {
                            return Ok(Decoded::new(
                                plaintext,
                                DecodeMethod::DecompressThenDecrypt(algorithm),
                            ));
                        }
                    }
                }
                Err(StepFailure::Decompression(
                    "no algorithm produced a structured payload".into(),
                ))
            }
            Strategy::DecryptThenDecompress => {
                let plaintext = Cipher::new(key)
                    .decrypt(blob)
                    .ok_or(StepFailure::Decryption)?;
                let (algorithm, bytes) =
                    decompress_structured(&plaintext).ok_or_else(|| {
                        StepFailure::Decompression("opened payload is not compressed JSON".into())
                    })?;
                Ok(Decoded::new(
                    bytes,
                    DecodeMethod::DecryptThenDecompress(algorithm),
                ))
            }
        }
    }
}

/// Decodes `blob` with the full cascade.
pub fn decode(blob: &[u8], key: &SymmetricKey) -> CodecResult<Decoded> {
    decode_with(FULL_CASCADE, blob, key)
}

/// Decodes `blob` trying `strategies` in order, stopping at the first success.
///
/// # Errors
///
/// Returns [`CodecError::Undecodable`] listing every failed attempt.
pub fn decode_with(
    strategies: &[Strategy],
    blob: &[u8],
    key: &SymmetricKey,
) -> CodecResult<Decoded> {
    let outcome = strategies
        .iter()
        .try_fold(Vec::new(), |mut attempts, &strategy| {
            match strategy.attempt(blob, key) {
                Ok(decoded) => ControlFlow::Break(decoded),
                Err(reason) => {
                    attempts.push(Attempt { strategy, reason });
                    ControlFlow::Continue(attempts)
                }
            }
        });

    match outcome {
        ControlFlow::Break(decoded) => Ok(decoded),
        ControlFlow::Continue(attempts) => Err(CodecError::Undecodable {
            looks_encrypted: looks_encrypted(blob),
            attempts,
        }),
    }
}

/// Returns true if `bytes` parse as JSON.
pub fn is_structured(bytes: &[u8]) -> bool {
    serde_json::from_slice::<IgnoredAny>(bytes).is_ok()
}

/// Advisory heuristic: long enough to be sealed, and not structured text.
///
/// Only used to choose which failure to report and whether a key refresh
/// is worth trying; it never gates whether decoding is attempted.
pub fn looks_encrypted(blob: &[u8]) -> bool {
    if blob.len() < MIN_SEALED_LEN {
        return false;
    }
    match std::str::from_utf8(blob) {
        Err(_) => true,
        Ok(_) => !is_structured(blob),
    }
}

fn decompress_structured(data: &[u8]) -> Option<(CompressionAlgorithm, Vec<u8>)> {
    CompressionAlgorithm::CASCADE.into_iter().find_map(|algorithm| {
        algorithm
            .decompress(data)
            .ok()
            .filter(|inflated| is_structured(inflated))
            .map(|inflated| (algorithm, inflated))
    })
}
