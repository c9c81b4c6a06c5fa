//! # fleetcheck codec
//!
//! Transport encoding for replica payloads.
//!
//! Encoding is a fixed pipeline: optionally compress (zlib), then optionally
//! seal with AES-256-GCM. A signed variant prefixes the sealed payload with
//! a length-prefixed JSON metadata block and an HMAC-SHA256 over it.
//!
//! Decoding cannot assume the pipeline that produced a blob: payloads come
//! from this device, from the web backend and from older app versions. The
//! decoder therefore runs an ordered [`Strategy`] cascade and stops at the
//! first strategy whose output parses as JSON:
//!
//! 1. [`Strategy::Plaintext`] - untouched JSON
//! 2. [`Strategy::SignedEnvelope`] - metadata + HMAC + sealed payload
//! 3. [`Strategy::Aead`] - bare sealed payload
//! 4. [`Strategy::Decompress`] - zlib / raw DEFLATE, then optionally unseal
//! 5. [`Strategy::DecryptThenDecompress`] - unseal, then decompress
//!
//! Every strategy is pure. Key rotation (retrying with a refreshed key) is
//! the caller's concern; [`KEY_RETRY_CASCADE`] names the strategies worth
//! retrying.
//!
//! ## Usage
//!
//! ```
//! use fleetcheck_codec::{decode, encode, DecodeMethod, EncodeOptions, SymmetricKey};
//!
//! let key = SymmetricKey::derive("organization-secret", "salt");
//! let blob = encode(br#"{"name":"Ada"}"#, &key, EncodeOptions::default()).unwrap();
//!
//! let decoded = decode(&blob, &key).unwrap();
//! assert_eq!(decoded.bytes, br#"{"name":"Ada"}"#);
//! assert!(matches!(decoded.method, DecodeMethod::DecryptThenDecompress(_)));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cascade;
mod compression;
mod crypto;
mod encoder;
mod envelope;
mod error;

pub use cascade::{
    decode, decode_with, is_structured, looks_encrypted, DecodeMethod, Decoded, Strategy,
    FULL_CASCADE, KEY_RETRY_CASCADE,
};
pub use compression::CompressionAlgorithm;
pub use crypto::{Cipher, SymmetricKey, KEY_SIZE, MIN_SEALED_LEN, NONCE_SIZE, TAG_SIZE};
pub use encoder::{encode, encode_with_metadata, EncodeOptions};
pub use envelope::{EnvelopeMetadata, OpenedEnvelope, ENVELOPE_VERSION, MIN_ENVELOPE_LEN};
pub use error::{Attempt, CodecError, CodecResult, StepFailure};
