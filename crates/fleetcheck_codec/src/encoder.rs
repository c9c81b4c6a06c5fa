//! Encoding pipeline.

use crate::compression::CompressionAlgorithm;
use crate::crypto::{Cipher, SymmetricKey};
use crate::envelope;
use crate::error::CodecResult;

/// Which layers to apply when encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Seal with AES-256-GCM.
    pub encrypt: bool,
    /// Compress with zlib before sealing.
    pub compress: bool,
}

impl EncodeOptions {
    /// Neither compression nor encryption.
    #[must_use]
    pub fn plain() -> Self {
        Self {
            encrypt: false,
            compress: false,
        }
    }

    /// Encryption without compression.
    #[must_use]
    pub fn encrypted_only() -> Self {
        Self {
            encrypt: true,
            compress: false,
        }
    }

    /// Compression without encryption.
    #[must_use]
    pub fn compressed_only() -> Self {
        Self {
            encrypt: false,
            compress: true,
        }
    }
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            encrypt: true,
            compress: true,
        }
    }
}

/// Encodes `bytes`: compress first, then seal.
pub fn encode(bytes: &[u8], key: &SymmetricKey, options: EncodeOptions) -> CodecResult<Vec<u8>> {
    let mut out = if options.compress {
        CompressionAlgorithm::Zlib.compress(bytes)?
    } else {
        bytes.to_vec()
    };
    if options.encrypt {
        out = Cipher::new(key).encrypt(&out)?;
    }
    Ok(out)
}

/// Encodes `bytes` inside a signed metadata envelope.
///
/// Always seals; `compress` controls whether the sealed plaintext is the
/// zlib-compressed payload.
pub fn encode_with_metadata(
    bytes: &[u8],
    key: &SymmetricKey,
    compress: bool,
) -> CodecResult<Vec<u8>> {
    if compress {
        envelope::seal(key, &CompressionAlgorithm::Zlib.compress(bytes)?)
    } else {
        envelope::seal(key, bytes)
    }
}
