//! Compression algorithms understood by the codec.

use crate::error::{CodecError, CodecResult};
use flate2::read::{DeflateDecoder, ZlibDecoder};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Upper bound on decompressed output, guarding against inflation bombs.
const MAX_DECOMPRESSED_LEN: u64 = 64 * 1024 * 1024;

/// A compression format.
///
/// Zlib is what this codec writes. Raw DEFLATE (no zlib header) is what
/// some mobile senders emit under the name "zlib", so the decoder tries
/// both, in [`CompressionAlgorithm::CASCADE`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// RFC 1950 zlib stream.
    Zlib,
    /// RFC 1951 raw DEFLATE stream.
    Deflate,
}

impl CompressionAlgorithm {
    /// Order in which the decoder tries the algorithms.
    pub const CASCADE: [CompressionAlgorithm; 2] =
        [CompressionAlgorithm::Zlib, CompressionAlgorithm::Deflate];

    /// Compresses `data`.
    pub fn compress(self, data: &[u8]) -> CodecResult<Vec<u8>> {
        match self {
            CompressionAlgorithm::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| CodecError::Compression(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| CodecError::Compression(e.to_string()))
            }
            CompressionAlgorithm::Deflate => {
                let mut encoder =
                    flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| CodecError::Compression(e.to_string()))?;
                encoder
                    .finish()
                    .map_err(|e| CodecError::Compression(e.to_string()))
            }
        }
    }

    /// Decompresses `data`.
    pub fn decompress(self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let mut out = Vec::new();
        let read = match self {
            CompressionAlgorithm::Zlib => ZlibDecoder::new(data)
                .take(MAX_DECOMPRESSED_LEN + 1)
                .read_to_end(&mut out),
            CompressionAlgorithm::Deflate => DeflateDecoder::new(data)
                .take(MAX_DECOMPRESSED_LEN + 1)
                .read_to_end(&mut out),
        };
        read.map_err(|e| CodecError::Compression(format!("{self:?}: {e}")))?;

        if out.len() as u64 > MAX_DECOMPRESSED_LEN {
            return Err(CodecError::Compression(format!(
                "{self:?}: output exceeds {MAX_DECOMPRESSED_LEN} bytes"
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_roundtrip() {
        let data = br#"{"checklist":"Conduite","state":2}"#.repeat(20);
        let compressed = CompressionAlgorithm::Zlib.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(
            CompressionAlgorithm::Zlib.decompress(&compressed).unwrap(),
            data
        );
    }

    #[test]
    fn deflate_roundtrip() {
        let data = b"raw deflate payload".repeat(10);
        let compressed = CompressionAlgorithm::Deflate.compress(&data).unwrap();
        assert_eq!(
            CompressionAlgorithm::Deflate.decompress(&compressed).unwrap(),
            data
        );
    }

    #[test]
    fn zlib_rejects_garbage() {
        assert!(CompressionAlgorithm::Zlib
            .decompress(b"definitely not zlib")
            .is_err());
    }

    #[test]
    fn zlib_header_distinguishes_formats() {
        let compressed = CompressionAlgorithm::Deflate.compress(b"abc").unwrap();
        assert!(CompressionAlgorithm::Zlib.decompress(&compressed).is_err());
    }
}
