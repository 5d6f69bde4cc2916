//! Error types for asset packing and loading.

use std::path::PathBuf;
use thiserror::Error;

/// Error type for asset container and packer operations.
#[derive(Error, Debug)]
pub enum AssetError {
    /// File not found.
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The container was written by an incompatible codec.
    #[error("Container schema version {found} does not match supported version {expected}")]
    SchemaMismatch {
        /// Schema version read from the file.
        found: u16,
        /// Schema version compiled into this build.
        expected: u16,
    },

    /// The container holds a newer or older layout of this asset type.
    #[error("{asset_type} content version {found} is not supported (expected {expected})")]
    ContentVersionMismatch {
        asset_type: String,
        found: u16,
        expected: u16,
    },

    /// The container holds a different kind of asset.
    #[error("Expected a {expected} asset, found {found}")]
    WrongType { expected: String, found: String },

    /// The file ended before the declared section did.
    #[error("Truncated {section}: expected {expected} bytes, found {found}")]
    Truncated {
        section: &'static str,
        expected: u64,
        found: u64,
    },

    /// Metadata is not valid JSON or is missing fields.
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Metadata parsed but describes something impossible.
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Declared sizes disagree with the payload.
    #[error("Corrupt asset: {0}")]
    Corrupt(String),

    /// LZ4 block decode failed.
    #[error("Decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    /// Packer input rejected before anything was written.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for asset operations.
pub type AssetResult<T> = Result<T, AssetError>;
