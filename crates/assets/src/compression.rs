//! Payload compression policy.
//!
//! Payload units (a whole mesh blob, or a single texture page) are compressed
//! with the LZ4 block format. When the result is larger than
//! [`COMPRESSION_FALLBACK_RATIO`] of the input the unit is stored raw instead,
//! because decoding would cost more than the bytes it saves.
//!
//! Decompression always needs the original size, which the metadata carries.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{trace, warn};

use crate::error::{AssetError, AssetResult};

/// Units whose compressed size exceeds this fraction of the original are stored raw.
pub const COMPRESSION_FALLBACK_RATIO: f64 = 0.8;

/// Upper bound on how many decoded bytes one byte of an LZ4 block can produce.
pub const LZ4_MAX_EXPANSION: u64 = 255;

/// How a payload unit is encoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompressionMode {
    /// Raw bytes.
    #[default]
    None,
    /// LZ4 block format.
    Lz4,
}

impl CompressionMode {
    /// Metadata string for this mode.
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionMode::None => "None",
            CompressionMode::Lz4 => "LZ4",
        }
    }

    /// Parses a metadata string.
    ///
    /// Anything other than `LZ4` reads as [`CompressionMode::None`], so an unknown
    /// mode falls back to a raw copy instead of failing the load.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("lz4") {
            CompressionMode::Lz4
        } else {
            if !value.eq_ignore_ascii_case("none") {
                warn!("Unknown compression mode '{}', treating payload as raw", value);
            }
            CompressionMode::None
        }
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CompressionMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CompressionMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::parse(&value))
    }
}

/// One compressed unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compressed {
    pub mode: CompressionMode,
    pub bytes: Vec<u8>,
}

/// Whether a compressed size is too close to the original to be worth keeping.
#[inline]
pub fn exceeds_fallback_ratio(compressed_len: usize, original_len: usize) -> bool {
    compressed_len as f64 > original_len as f64 * COMPRESSION_FALLBACK_RATIO
}

/// Compresses one unit, falling back to raw storage when LZ4 does not pay off.
pub fn compress(bytes: &[u8]) -> Compressed {
    if bytes.is_empty() {
        return Compressed {
            mode: CompressionMode::None,
            bytes: Vec::new(),
        };
    }

    let compressed = lz4_flex::block::compress(bytes);

    if exceeds_fallback_ratio(compressed.len(), bytes.len()) {
        trace!(
            "LZ4 produced {} of {} bytes, storing raw",
            compressed.len(),
            bytes.len()
        );
        Compressed {
            mode: CompressionMode::None,
            bytes: bytes.to_vec(),
        }
    } else {
        trace!("LZ4 compressed {} -> {} bytes", bytes.len(), compressed.len());
        Compressed {
            mode: CompressionMode::Lz4,
            bytes: compressed,
        }
    }
}

/// Decodes `src` into `dst`, whose length is the unit's original size.
///
/// # Errors
///
/// Returns [`AssetError::Corrupt`] if the decoded size differs from `dst.len()`
/// (for raw units, if `src` and `dst` lengths differ), or a decompression error
/// for malformed LZ4 data.
pub fn decompress_into(mode: CompressionMode, src: &[u8], dst: &mut [u8]) -> AssetResult<()> {
    match mode {
        CompressionMode::None => {
            if src.len() != dst.len() {
                return Err(AssetError::Corrupt(format!(
                    "raw unit holds {} bytes but {} were declared",
                    src.len(),
                    dst.len()
                )));
            }
            dst.copy_from_slice(src);
        }
        CompressionMode::Lz4 => {
            let written = lz4_flex::block::decompress_into(src, dst)?;
            if written != dst.len() {
                return Err(AssetError::Corrupt(format!(
                    "LZ4 unit decoded to {} bytes but {} were declared",
                    written,
                    dst.len()
                )));
            }
        }
    }
    Ok(())
}

/// Checks that `stored` payload bytes can decode to `original` bytes under `mode`.
///
/// Run before allocating anything from a declared size.
pub fn check_unit_size(mode: CompressionMode, stored: u64, original: u64) -> AssetResult<()> {
    let plausible = match mode {
        CompressionMode::None => stored == original,
        CompressionMode::Lz4 => original <= stored.saturating_mul(LZ4_MAX_EXPANSION),
    };
    if !plausible {
        return Err(AssetError::Corrupt(format!(
            "{} unit of {} bytes cannot decode to the declared {} bytes",
            mode, stored, original
        )));
    }
    Ok(())
}

/// Allocates a zeroed buffer for decoded bytes, failing instead of aborting.
pub fn alloc_output(size: u64) -> AssetResult<Vec<u8>> {
    let len = usize::try_from(size)
        .map_err(|_| AssetError::Corrupt(format!("{} bytes do not fit in memory", size)))?;
    let mut dst = Vec::new();
    dst.try_reserve_exact(len)
        .map_err(|e| AssetError::Corrupt(format!("cannot allocate {} bytes: {}", len, e)))?;
    dst.resize(len, 0);
    Ok(dst)
}

/// Decodes `src` into a new buffer of `original_size` bytes.
///
/// The declared size is checked against `src` before anything is allocated.
pub fn decompress(mode: CompressionMode, src: &[u8], original_size: usize) -> AssetResult<Vec<u8>> {
    check_unit_size(mode, src.len() as u64, original_size as u64)?;
    let mut dst = alloc_output(original_size as u64)?;
    decompress_into(mode, src, &mut dst)?;
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_implausible_sizes_are_corrupt() {
        let huge = 4_400_000_000_000_000_000usize;
        let err = decompress(CompressionMode::None, &[0; 44], huge).unwrap_err();
        assert!(matches!(err, AssetError::Corrupt(_)));

        let err = decompress(CompressionMode::Lz4, &[0; 8], 8 * 255 + 1).unwrap_err();
        assert!(matches!(err, AssetError::Corrupt(_)));

        assert!(check_unit_size(CompressionMode::Lz4, 8, 8 * 255).is_ok());
        assert!(check_unit_size(CompressionMode::Lz4, u64::MAX, u64::MAX).is_ok());
        assert!(check_unit_size(CompressionMode::None, 3, 4).is_err());
    }

    #[test]
    fn test_parse_is_permissive() {
        assert_eq!(CompressionMode::parse("LZ4"), CompressionMode::Lz4);
        assert_eq!(CompressionMode::parse("lz4"), CompressionMode::Lz4);
        assert_eq!(CompressionMode::parse("None"), CompressionMode::None);
        assert_eq!(CompressionMode::parse("zstd"), CompressionMode::None);
        assert_eq!(CompressionMode::parse(""), CompressionMode::None);
    }

    #[test]
    fn test_serde_uses_metadata_strings() {
        assert_eq!(serde_json::to_string(&CompressionMode::Lz4).unwrap(), "\"LZ4\"");
        let mode: CompressionMode = serde_json::from_str("\"brotli\"").unwrap();
        assert_eq!(mode, CompressionMode::None);
    }

    #[test]
    fn test_compressible_data_uses_lz4() {
        let data = vec![7u8; 4096];
        let unit = compress(&data);
        assert_eq!(unit.mode, CompressionMode::Lz4);
        assert!(unit.bytes.len() < data.len() / 10);
        assert_eq!(decompress(unit.mode, &unit.bytes, data.len()).unwrap(), data);
    }

    #[test]
    fn test_incompressible_data_falls_back_to_raw() {
        // xorshift noise does not compress
        let mut state = 0x2545_F491_u32;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();

        let unit = compress(&data);
        assert_eq!(unit.mode, CompressionMode::None);
        assert_eq!(unit.bytes, data);
    }

    #[test]
    fn test_empty_unit_is_raw() {
        let unit = compress(&[]);
        assert_eq!(unit.mode, CompressionMode::None);
        assert!(unit.bytes.is_empty());
        assert!(decompress(unit.mode, &unit.bytes, 0).unwrap().is_empty());
    }

    #[test]
    fn test_fallback_boundary() {
        assert!(!exceeds_fallback_ratio(80, 100));
        assert!(exceeds_fallback_ratio(81, 100));
    }

    #[test]
    fn test_size_mismatch_is_corrupt() {
        let data = vec![1u8; 256];
        let unit = compress(&data);
        assert!(matches!(
            decompress(CompressionMode::None, &data, 200),
            Err(AssetError::Corrupt(_))
        ));
        assert!(decompress(unit.mode, &unit.bytes, 300).is_err());
    }
}
