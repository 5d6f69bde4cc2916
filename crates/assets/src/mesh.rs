//! Mesh packing and unpacking.
//!
//! A mesh container stores the vertex bytes followed by the index bytes as a
//! single compressed unit. The metadata records both sizes, so unpacking
//! decompresses the blob and splits it at the vertex buffer size; no separate
//! offset is stored.
//!
//! # Example
//!
//! ```
//! use glam::Vec3;
//! use renderer_assets::mesh::{MeshData, VertexPncvF32, pack_vertices};
//!
//! # fn example() -> renderer_assets::AssetResult<()> {
//! let vertices = [
//!     VertexPncvF32::new(Vec3::ZERO, Vec3::Y, Vec3::ONE, [0.0, 0.0]),
//!     VertexPncvF32::new(Vec3::X, Vec3::Y, Vec3::ONE, [1.0, 0.0]),
//!     VertexPncvF32::new(Vec3::Z, Vec3::Y, Vec3::ONE, [0.0, 1.0]),
//! ];
//! let container = pack_vertices(&vertices, &[0u32, 1, 2], "triangle.obj")?;
//!
//! let mesh = MeshData::from_container(&container)?;
//! assert_eq!(mesh.info.vertex_count(), 3);
//! assert_eq!(mesh.info.index_count(), 3);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use renderer_core::ScopedTimer;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::compression::{self, CompressionMode};
use crate::container::{AssetContainer, AssetType};
use crate::error::{AssetError, AssetResult};

/// Content version of mesh containers.
pub const MESH_CONTENT_VERSION: u16 = 1;

/// Layout of one vertex in a mesh payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    #[default]
    Unknown,
    /// Position, normal, color and UV, all 32-bit floats.
    PncvF32,
    /// Float position and UV with 8-bit normal and color.
    P32N8C8V16,
}

impl VertexFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            VertexFormat::Unknown => "Unknown",
            VertexFormat::PncvF32 => "PNCV_F32",
            VertexFormat::P32N8C8V16 => "P32N8C8V16",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "PNCV_F32" => VertexFormat::PncvF32,
            "P32N8C8V16" => VertexFormat::P32N8C8V16,
            _ => VertexFormat::Unknown,
        }
    }

    /// Size of one vertex in bytes, if the format is known.
    pub fn stride(self) -> Option<usize> {
        match self {
            VertexFormat::Unknown => None,
            VertexFormat::PncvF32 => Some(size_of::<VertexPncvF32>()),
            VertexFormat::P32N8C8V16 => Some(size_of::<VertexP32N8C8V16>()),
        }
    }
}

impl fmt::Display for VertexFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vertex type that can be packed directly.
///
/// Every format starts with a `[f32; 3]` position.
pub trait MeshVertex: Pod {
    const FORMAT: VertexFormat;

    fn position(&self) -> Vec3;
}

/// Full-precision vertex.
///
/// # Memory Layout
///
/// - Offset 0: position (12 bytes)
/// - Offset 12: normal (12 bytes)
/// - Offset 24: color (12 bytes)
/// - Offset 36: uv (8 bytes)
/// - Total size: 44 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct VertexPncvF32 {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

impl VertexPncvF32 {
    #[inline]
    pub fn new(position: Vec3, normal: Vec3, color: Vec3, uv: [f32; 2]) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
            color: color.to_array(),
            uv,
        }
    }
}

impl MeshVertex for VertexPncvF32 {
    const FORMAT: VertexFormat = VertexFormat::PncvF32;

    #[inline]
    fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }
}

/// Compact vertex with quantized normal and color.
///
/// Normals map `[-1, 1]` to `[0, 255]`; colors map `[0, 1]` to `[0, 255]`.
/// Two padding bytes keep the UV 4-byte aligned (28 bytes total).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct VertexP32N8C8V16 {
    pub position: [f32; 3],
    pub normal: [u8; 3],
    pub color: [u8; 3],
    pub _pad: [u8; 2],
    pub uv: [f32; 2],
}

impl VertexP32N8C8V16 {
    pub fn new(position: Vec3, normal: Vec3, color: Vec3, uv: Vec2) -> Self {
        let n = (normal + Vec3::ONE) * 0.5;
        Self {
            position: position.to_array(),
            normal: quantize_unorm(n),
            color: quantize_unorm(color),
            _pad: [0; 2],
            uv: uv.to_array(),
        }
    }

    /// Dequantized normal.
    pub fn normal(&self) -> Vec3 {
        dequantize_unorm(self.normal) * 2.0 - Vec3::ONE
    }

    /// Dequantized color.
    pub fn color(&self) -> Vec3 {
        dequantize_unorm(self.color)
    }
}

impl MeshVertex for VertexP32N8C8V16 {
    const FORMAT: VertexFormat = VertexFormat::P32N8C8V16;

    #[inline]
    fn position(&self) -> Vec3 {
        Vec3::from_array(self.position)
    }
}

fn quantize_unorm(v: Vec3) -> [u8; 3] {
    let q = (v.clamp(Vec3::ZERO, Vec3::ONE) * 255.0).round();
    [q.x as u8, q.y as u8, q.z as u8]
}

fn dequantize_unorm(v: [u8; 3]) -> Vec3 {
    Vec3::new(f32::from(v[0]), f32::from(v[1]), f32::from(v[2])) / 255.0
}

/// Bounding sphere and box of a mesh, derived from its positions.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MeshBounds {
    /// Center of the axis-aligned box, also the sphere center.
    pub origin: Vec3,
    pub radius: f32,
    /// Half size of the box on each axis.
    pub extents: Vec3,
}

impl MeshBounds {
    /// Metadata order: origin xyz, radius, extents xyz.
    pub fn to_array(&self) -> [f32; 7] {
        [
            self.origin.x,
            self.origin.y,
            self.origin.z,
            self.radius,
            self.extents.x,
            self.extents.y,
            self.extents.z,
        ]
    }

    pub fn from_slice(values: &[f32]) -> Option<Self> {
        match values {
            [ox, oy, oz, r, ex, ey, ez] => Some(Self {
                origin: Vec3::new(*ox, *oy, *oz),
                radius: *r,
                extents: Vec3::new(*ex, *ey, *ez),
            }),
            _ => None,
        }
    }
}

/// Computes the bounds of a set of positions.
///
/// The box center is the midpoint of the min/max corners and the radius is the
/// furthest distance from that center. No positions yields a zero bound.
pub fn calculate_bounds(positions: &[Vec3]) -> MeshBounds {
    if positions.is_empty() {
        return MeshBounds::default();
    }

    let (min, max) = positions.iter().fold(
        (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
        |(min, max), p| (min.min(*p), max.max(*p)),
    );
    let origin = (min + max) * 0.5;
    let extents = (max - min) * 0.5;

    let radius_sq = positions
        .iter()
        .map(|p| p.distance_squared(origin))
        .fold(0.0f32, f32::max);

    MeshBounds {
        origin,
        radius: radius_sq.sqrt(),
        extents,
    }
}

/// Reads the position of every vertex in a packed vertex buffer.
pub fn vertex_positions(format: VertexFormat, vertices: &[u8]) -> AssetResult<Vec<Vec3>> {
    let stride = format
        .stride()
        .ok_or_else(|| AssetError::InvalidInput("unknown vertex format".to_owned()))?;
    if vertices.len() % stride != 0 {
        return Err(AssetError::InvalidInput(format!(
            "vertex buffer of {} bytes is not a multiple of the {} byte {} stride",
            vertices.len(),
            stride,
            format
        )));
    }

    Ok(vertices
        .chunks_exact(stride)
        .map(|v| Vec3::from_array(bytemuck::pod_read_unaligned::<[f32; 3]>(&v[..12])))
        .collect())
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MeshMetadata {
    format: String,
    compression: CompressionMode,
    vb_size: u64,
    ib_size: u64,
    index_size: u8,
    source_file: String,
    bounds: Vec<f32>,
}

/// Description of a packed mesh, read from container metadata.
#[derive(Clone, Debug, PartialEq)]
pub struct MeshInfo {
    pub vertex_format: VertexFormat,
    pub compression: CompressionMode,
    pub vertex_buffer_size: u64,
    pub index_buffer_size: u64,
    /// Bytes per index, 2 or 4.
    pub index_size: u8,
    pub source_file: String,
    pub bounds: MeshBounds,
}

impl MeshInfo {
    /// Parses and validates mesh metadata.
    ///
    /// # Errors
    ///
    /// Fails if the container is not a mesh, has an unsupported content version,
    /// or its sizes contradict the vertex format and index size.
    pub fn read(container: &AssetContainer) -> AssetResult<Self> {
        container.expect(AssetType::MESH, MESH_CONTENT_VERSION)?;
        let meta: MeshMetadata = serde_json::from_str(container.metadata())?;

        let bounds = MeshBounds::from_slice(&meta.bounds).ok_or_else(|| {
            AssetError::InvalidMetadata(format!(
                "bounds must have 7 values, found {}",
                meta.bounds.len()
            ))
        })?;

        let info = Self {
            vertex_format: VertexFormat::parse(&meta.format),
            compression: meta.compression,
            vertex_buffer_size: meta.vb_size,
            index_buffer_size: meta.ib_size,
            index_size: meta.index_size,
            source_file: meta.source_file,
            bounds,
        };

        if !matches!(info.index_size, 2 | 4) {
            return Err(AssetError::InvalidMetadata(format!(
                "index size must be 2 or 4, found {}",
                info.index_size
            )));
        }
        if info.index_buffer_size % u64::from(info.index_size) != 0 {
            return Err(AssetError::InvalidMetadata(format!(
                "index buffer of {} bytes is not a multiple of {}",
                info.index_buffer_size, info.index_size
            )));
        }
        if let Some(stride) = info.vertex_format.stride()
            && info.vertex_buffer_size % stride as u64 != 0
        {
            return Err(AssetError::InvalidMetadata(format!(
                "vertex buffer of {} bytes is not a multiple of the {} stride",
                info.vertex_buffer_size, info.vertex_format
            )));
        }

        Ok(info)
    }

    /// Number of vertices, or zero for an unknown format.
    pub fn vertex_count(&self) -> u64 {
        self.vertex_format
            .stride()
            .map_or(0, |stride| self.vertex_buffer_size / stride as u64)
    }

    #[inline]
    pub fn index_count(&self) -> u64 {
        self.index_buffer_size / u64::from(self.index_size)
    }
}

/// Packs raw vertex and index bytes into a mesh container.
///
/// # Arguments
///
/// * `format` - Layout of `vertices`
/// * `vertices` - Packed vertex data, a whole number of vertices
/// * `indices` - Packed index data
/// * `index_size` - Bytes per index (2 or 4)
/// * `source_file` - Provenance recorded in the metadata
///
/// # Errors
///
/// Returns [`AssetError::InvalidInput`] for an unknown format, an index size other
/// than 2 or 4, or buffers that are not whole multiples of their element size.
pub fn pack_mesh(
    format: VertexFormat,
    vertices: &[u8],
    indices: &[u8],
    index_size: u8,
    source_file: &str,
) -> AssetResult<AssetContainer> {
    let _timer = ScopedTimer::new("pack mesh");

    if !matches!(index_size, 2 | 4) {
        return Err(AssetError::InvalidInput(format!(
            "index size must be 2 or 4, got {index_size}"
        )));
    }
    if indices.len() % usize::from(index_size) != 0 {
        return Err(AssetError::InvalidInput(format!(
            "index buffer of {} bytes is not a multiple of {}",
            indices.len(),
            index_size
        )));
    }
    let positions = vertex_positions(format, vertices)?;
    let bounds = calculate_bounds(&positions);

    let mut blob = Vec::with_capacity(vertices.len() + indices.len());
    blob.extend_from_slice(vertices);
    blob.extend_from_slice(indices);
    let unit = compression::compress(&blob);

    let metadata = MeshMetadata {
        format: format.as_str().to_owned(),
        compression: unit.mode,
        vb_size: vertices.len() as u64,
        ib_size: indices.len() as u64,
        index_size,
        source_file: source_file.to_owned(),
        bounds: bounds.to_array().to_vec(),
    };

    debug!(
        "Packed {} mesh from '{}': {} vertices, {} indices, {} -> {} bytes ({})",
        format,
        source_file,
        positions.len(),
        indices.len() / usize::from(index_size),
        blob.len(),
        unit.bytes.len(),
        unit.mode
    );

    Ok(AssetContainer::new(
        AssetType::MESH,
        MESH_CONTENT_VERSION,
        serde_json::to_string(&metadata)?,
        unit.bytes,
    ))
}

/// Packs typed vertices with 32-bit indices.
pub fn pack_vertices<V: MeshVertex>(
    vertices: &[V],
    indices: &[u32],
    source_file: &str,
) -> AssetResult<AssetContainer> {
    pack_mesh(
        V::FORMAT,
        bytemuck::cast_slice(vertices),
        bytemuck::cast_slice(indices),
        4,
        source_file,
    )
}

/// Decompresses a mesh payload and splits it into vertex and index bytes.
///
/// # Errors
///
/// Returns an error if the payload does not decode to exactly
/// `vertex_buffer_size + index_buffer_size` bytes.
pub fn unpack_mesh(info: &MeshInfo, payload: &[u8]) -> AssetResult<(Vec<u8>, Vec<u8>)> {
    let _timer = ScopedTimer::new("unpack mesh");

    let vb_size = usize::try_from(info.vertex_buffer_size)
        .map_err(|_| AssetError::Corrupt("vertex buffer size overflows".to_owned()))?;
    let ib_size = usize::try_from(info.index_buffer_size)
        .map_err(|_| AssetError::Corrupt("index buffer size overflows".to_owned()))?;

    let total = vb_size
        .checked_add(ib_size)
        .ok_or_else(|| AssetError::Corrupt("mesh size overflows".to_owned()))?;

    let mut vertices = compression::decompress(info.compression, payload, total)?;
    let indices = vertices.split_off(vb_size);
    Ok((vertices, indices))
}

/// A mesh read back from a container.
#[derive(Clone, Debug)]
pub struct MeshData {
    pub info: MeshInfo,
    pub vertices: Vec<u8>,
    pub indices: Vec<u8>,
}

impl MeshData {
    pub fn from_container(container: &AssetContainer) -> AssetResult<Self> {
        let info = MeshInfo::read(container)?;
        let (vertices, indices) = unpack_mesh(&info, container.payload())?;
        Ok(Self {
            info,
            vertices,
            indices,
        })
    }

    /// Loads and unpacks a `.msh` file.
    pub fn load(path: &Path) -> AssetResult<Self> {
        Self::from_container(&AssetContainer::load(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: f32, y: f32, z: f32) -> VertexPncvF32 {
        VertexPncvF32::new(Vec3::new(x, y, z), Vec3::Y, Vec3::ONE, [0.0, 0.0])
    }

    #[test]
    fn test_vertex_sizes() {
        assert_eq!(size_of::<VertexPncvF32>(), 44);
        assert_eq!(size_of::<VertexP32N8C8V16>(), 28);
        assert_eq!(VertexFormat::PncvF32.stride(), Some(44));
        assert_eq!(VertexFormat::Unknown.stride(), None);
    }

    #[test]
    fn test_format_strings() {
        for format in [VertexFormat::PncvF32, VertexFormat::P32N8C8V16] {
            assert_eq!(VertexFormat::parse(format.as_str()), format);
        }
        assert_eq!(VertexFormat::parse("P16"), VertexFormat::Unknown);
    }

    #[test]
    fn test_bounds_two_vertices() {
        let bounds = calculate_bounds(&[Vec3::ZERO, Vec3::new(2.0, 0.0, 0.0)]);
        assert_eq!(bounds.origin, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(bounds.extents, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(bounds.radius, 1.0);
    }

    #[test]
    fn test_bounds_single_vertex() {
        let bounds = calculate_bounds(&[Vec3::new(3.0, -1.0, 2.0)]);
        assert_eq!(bounds.origin, Vec3::new(3.0, -1.0, 2.0));
        assert_eq!(bounds.extents, Vec3::ZERO);
        assert_eq!(bounds.radius, 0.0);
    }

    #[test]
    fn test_bounds_empty_is_zero() {
        assert_eq!(calculate_bounds(&[]), MeshBounds::default());
    }

    #[test]
    fn test_bounds_negative_coordinates() {
        let bounds = calculate_bounds(&[Vec3::splat(-4.0), Vec3::splat(-2.0)]);
        assert_eq!(bounds.origin, Vec3::splat(-3.0));
        assert_eq!(bounds.extents, Vec3::ONE);
        assert!((bounds.radius - 3.0f32.sqrt()).abs() < 1e-6);
    }

    #[test]
    fn test_pack_records_metadata() {
        let vertices = [vertex(0.0, 0.0, 0.0), vertex(2.0, 0.0, 0.0), vertex(0.0, 1.0, 0.0)];
        let container = pack_vertices(&vertices, &[0, 1, 2], "tri.obj").unwrap();
        let info = MeshInfo::read(&container).unwrap();

        assert_eq!(info.vertex_format, VertexFormat::PncvF32);
        assert_eq!(info.vertex_buffer_size, 3 * 44);
        assert_eq!(info.index_buffer_size, 12);
        assert_eq!(info.index_size, 4);
        assert_eq!(info.source_file, "tri.obj");
        assert_eq!(info.bounds.origin, Vec3::new(1.0, 0.5, 0.0));

        let json: serde_json::Value = serde_json::from_str(container.metadata()).unwrap();
        assert_eq!(json["vbSize"], 132);
        assert_eq!(json["format"], "PNCV_F32");
        assert_eq!(json["bounds"].as_array().unwrap().len(), 7);
    }

    #[test]
    fn test_round_trip_u16_indices() {
        let vertices: Vec<VertexP32N8C8V16> = (0..64)
            .map(|i| {
                VertexP32N8C8V16::new(
                    Vec3::new(i as f32, 0.0, 0.0),
                    Vec3::Z,
                    Vec3::new(1.0, 0.5, 0.0),
                    Vec2::new(0.25, 0.75),
                )
            })
            .collect();
        let indices: Vec<u16> = (0..64).collect();
        let vb: &[u8] = bytemuck::cast_slice(&vertices);
        let ib: &[u8] = bytemuck::cast_slice(&indices);

        let container = pack_mesh(VertexFormat::P32N8C8V16, vb, ib, 2, "line.obj").unwrap();
        let mesh = MeshData::from_container(&container).unwrap();
        assert_eq!(mesh.vertices, vb);
        assert_eq!(mesh.indices, ib);
        assert_eq!(mesh.info.vertex_count(), 64);
        assert_eq!(mesh.info.index_count(), 64);
    }

    #[test]
    fn test_quantized_vertex_round_trip() {
        let v = VertexP32N8C8V16::new(
            Vec3::ZERO,
            Vec3::new(0.0, -1.0, 1.0),
            Vec3::new(1.0, 0.0, 0.5),
            Vec2::ZERO,
        );
        assert_eq!(v.normal, [128, 0, 255]);
        assert!((v.normal() - Vec3::new(0.0, -1.0, 1.0)).abs().max_element() <= 2.0 / 255.0);
        assert!((v.color() - Vec3::new(1.0, 0.0, 0.5)).abs().max_element() <= 1.0 / 255.0);
    }

    #[test]
    fn test_pack_rejects_bad_input() {
        let vb = [0u8; 44];
        assert!(pack_mesh(VertexFormat::Unknown, &vb, &[], 4, "").is_err());
        assert!(pack_mesh(VertexFormat::PncvF32, &vb[..40], &[], 4, "").is_err());
        assert!(pack_mesh(VertexFormat::PncvF32, &vb, &[0; 3], 2, "").is_err());
        assert!(pack_mesh(VertexFormat::PncvF32, &vb, &[0; 4], 1, "").is_err());
    }

    #[test]
    fn test_unpack_rejects_size_mismatch() {
        let vertices = [vertex(0.0, 0.0, 0.0)];
        let container = pack_vertices(&vertices, &[0], "").unwrap();
        let mut info = MeshInfo::read(&container).unwrap();
        info.index_buffer_size += 4;
        assert!(unpack_mesh(&info, container.payload()).is_err());
    }

    fn corrupt_mesh(compression: &str, vb_size: u64, payload: Vec<u8>) -> AssetContainer {
        let metadata = serde_json::json!({
            "format": "PNCV_F32",
            "compression": compression,
            "vbSize": vb_size,
            "ibSize": 0,
            "indexSize": 4,
            "sourceFile": "",
            "bounds": [0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        });
        AssetContainer::new(AssetType::MESH, 1, metadata.to_string(), payload)
    }

    #[test]
    fn test_huge_declared_size_is_corrupt() {
        let container = corrupt_mesh("None", 4_400_000_000_000_000_000, vec![0; 44]);
        assert!(matches!(
            MeshData::from_container(&container),
            Err(AssetError::Corrupt(_))
        ));

        let container = corrupt_mesh("LZ4", 44 * 1_000_000, vec![0; 44]);
        assert!(matches!(
            MeshData::from_container(&container),
            Err(AssetError::Corrupt(_))
        ));
    }

    #[test]
    fn test_read_rejects_other_types() {
        let container = AssetContainer::new(AssetType::TEXTURE, 1, "{}".to_owned(), Vec::new());
        assert!(matches!(
            MeshInfo::read(&container),
            Err(AssetError::WrongType { .. })
        ));
        let container = AssetContainer::new(AssetType::MESH, 2, "{}".to_owned(), Vec::new());
        assert!(matches!(
            MeshInfo::read(&container),
            Err(AssetError::ContentVersionMismatch { .. })
        ));
    }
}
