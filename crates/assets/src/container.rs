//! Binary asset container.
//!
//! Every cooked asset is stored as one container:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 4 | type tag (`MESH`, `TXTR`, `MTRL`) |
//! | 4 | 4 | version word: schema version in the high 16 bits, content version in the low 16 |
//! | 8 | 4 | metadata length |
//! | 12 | 4 | payload length |
//! | 16 | .. | metadata (JSON text), then payload |
//!
//! All integers are little-endian and there is no padding. The schema version
//! is checked before anything past the version word is read. The content
//! version is left to the typed readers in [`mesh`](crate::mesh),
//! [`texture`](crate::texture) and [`material`](crate::material).
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use renderer_assets::container::{AssetContainer, AssetType};
//!
//! # fn example() -> renderer_assets::AssetResult<()> {
//! let container = AssetContainer::new(AssetType::MATERIAL, 1, "{}".to_owned(), Vec::new());
//! container.save(Path::new("cooked/default.mat"))?;
//!
//! let loaded = AssetContainer::load(Path::new("cooked/default.mat"))?;
//! assert_eq!(loaded.asset_type(), AssetType::MATERIAL);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use tracing::{debug, error};

use crate::error::{AssetError, AssetResult};

/// Container layout version compiled into this codec.
pub const CONTAINER_SCHEMA_VERSION: u16 = 1;

/// Size of the fixed header preceding metadata and payload.
pub const HEADER_SIZE: usize = 16;

/// Four-byte ASCII tag identifying what a container holds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssetType([u8; 4]);

impl AssetType {
    pub const MESH: Self = Self(*b"MESH");
    pub const TEXTURE: Self = Self(*b"TXTR");
    pub const MATERIAL: Self = Self(*b"MTRL");

    #[inline]
    pub const fn new(tag: [u8; 4]) -> Self {
        Self(tag)
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AssetType({self})")
    }
}

/// A typed, versioned record of JSON metadata plus an opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetContainer {
    asset_type: AssetType,
    content_version: u16,
    metadata: String,
    payload: Vec<u8>,
}

impl AssetContainer {
    pub fn new(
        asset_type: AssetType,
        content_version: u16,
        metadata: String,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            asset_type,
            content_version,
            metadata,
            payload,
        }
    }

    #[inline]
    pub fn asset_type(&self) -> AssetType {
        self.asset_type
    }

    #[inline]
    pub fn content_version(&self) -> u16 {
        self.content_version
    }

    /// JSON document describing how to interpret the payload.
    #[inline]
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consumes the container, returning the payload without copying.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Packed version word as stored on disk.
    #[inline]
    pub fn version_word(&self) -> u32 {
        (u32::from(CONTAINER_SCHEMA_VERSION) << 16) | u32::from(self.content_version)
    }

    /// Fails unless the container holds `expected` at content version `version`.
    pub fn expect(&self, expected: AssetType, version: u16) -> AssetResult<()> {
        if self.asset_type != expected {
            return Err(AssetError::WrongType {
                expected: expected.to_string(),
                found: self.asset_type.to_string(),
            });
        }
        if self.content_version != version {
            return Err(AssetError::ContentVersionMismatch {
                asset_type: expected.to_string(),
                found: self.content_version,
                expected: version,
            });
        }
        Ok(())
    }

    /// Writes the container in its on-disk layout.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer fails or a section is larger than `u32::MAX` bytes.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> AssetResult<()> {
        let metadata_len = section_len("metadata", self.metadata.len())?;
        let payload_len = section_len("payload", self.payload.len())?;

        writer.write_all(self.asset_type.as_bytes())?;
        writer.write_all(&self.version_word().to_le_bytes())?;
        writer.write_all(&metadata_len.to_le_bytes())?;
        writer.write_all(&payload_len.to_le_bytes())?;
        writer.write_all(self.metadata.as_bytes())?;
        writer.write_all(&self.payload)?;
        Ok(())
    }

    /// Reads a container, rejecting a schema mismatch before the section lengths are read.
    ///
    /// Sections are read through a bounded reader, so a corrupt length field
    /// produces [`AssetError::Truncated`] rather than a huge allocation.
    pub fn read_from<R: Read>(reader: &mut R) -> AssetResult<Self> {
        let mut tag = [0u8; 4];
        read_field(reader, &mut tag, "type tag")?;

        let mut word = [0u8; 4];
        read_field(reader, &mut word, "version word")?;
        let version = u32::from_le_bytes(word);
        let schema = (version >> 16) as u16;
        if schema != CONTAINER_SCHEMA_VERSION {
            return Err(AssetError::SchemaMismatch {
                found: schema,
                expected: CONTAINER_SCHEMA_VERSION,
            });
        }
        let content_version = (version & 0xFFFF) as u16;

        let mut len = [0u8; 4];
        read_field(reader, &mut len, "metadata length")?;
        let metadata_len = u32::from_le_bytes(len);
        read_field(reader, &mut len, "payload length")?;
        let payload_len = u32::from_le_bytes(len);

        let metadata = read_section(reader, "metadata", metadata_len)?;
        let metadata = String::from_utf8(metadata)
            .map_err(|_| AssetError::InvalidMetadata("metadata is not valid UTF-8".to_owned()))?;
        let payload = read_section(reader, "payload", payload_len)?;

        Ok(Self {
            asset_type: AssetType(tag),
            content_version,
            metadata,
            payload,
        })
    }

    /// Serializes into a fresh byte vector.
    pub fn to_bytes(&self) -> AssetResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.metadata.len() + self.payload.len());
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> AssetResult<Self> {
        Self::read_from(&mut bytes)
    }

    /// Writes the container to `path`, truncating any existing file.
    pub fn save(&self, path: &Path) -> AssetResult<()> {
        let file = File::create(path).map_err(|e| {
            error!("Failed to open {:?} for writing: {}", path, e);
            AssetError::Io(e)
        })?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)?;
        writer.flush()?;

        debug!(
            "Saved {} asset to {:?} ({} bytes metadata, {} bytes payload)",
            self.asset_type,
            path,
            self.metadata.len(),
            self.payload.len()
        );
        Ok(())
    }

    /// Reads the whole container at `path` into memory.
    pub fn load(path: &Path) -> AssetResult<Self> {
        let file = File::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => AssetError::FileNotFound(path.to_path_buf()),
            _ => AssetError::Io(e),
        })?;
        let container = Self::read_from(&mut BufReader::new(file)).inspect_err(|e| {
            error!("Failed to load asset {:?}: {}", path, e);
        })?;

        debug!(
            "Loaded {} asset v{} from {:?}",
            container.asset_type, container.content_version, path
        );
        Ok(container)
    }
}

fn section_len(section: &'static str, len: usize) -> AssetResult<u32> {
    u32::try_from(len).map_err(|_| {
        AssetError::InvalidInput(format!("{section} of {len} bytes exceeds the container limit"))
    })
}

fn read_field<R: Read>(reader: &mut R, buf: &mut [u8], section: &'static str) -> AssetResult<()> {
    let expected = buf.len() as u64;
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => AssetError::Truncated {
            section,
            expected,
            found: 0,
        },
        _ => AssetError::Io(e),
    })
}

fn read_section<R: Read>(reader: &mut R, section: &'static str, len: u32) -> AssetResult<Vec<u8>> {
    let mut buf = Vec::new();
    reader.take(u64::from(len)).read_to_end(&mut buf)?;
    if buf.len() as u64 != u64::from(len) {
        return Err(AssetError::Truncated {
            section,
            expected: u64::from(len),
            found: buf.len() as u64,
        });
    }
    Ok(buf)
}
