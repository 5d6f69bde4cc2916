//! Cooked asset formats.
//!
//! This crate reads and writes the binary containers the renderer consumes:
//! - [`container`]: the typed, versioned container layout
//! - [`compression`]: LZ4 with a raw fallback
//! - [`mesh`], [`texture`], [`material`]: packers and readers per asset type

pub mod compression;
pub mod container;
mod error;
pub mod material;
pub mod mesh;
pub mod texture;

pub use compression::{COMPRESSION_FALLBACK_RATIO, CompressionMode};
pub use container::{AssetContainer, AssetType, CONTAINER_SCHEMA_VERSION};
pub use error::{AssetError, AssetResult};
pub use material::{MaterialInfo, TransparencyMode, pack_material};
pub use mesh::{
    MeshBounds, MeshData, MeshInfo, MeshVertex, VertexFormat, VertexP32N8C8V16, VertexPncvF32,
    calculate_bounds, pack_mesh, pack_vertices, unpack_mesh,
};
pub use texture::{
    PageExtent, PageInfo, TextureData, TextureFormat, TextureInfo, generate_mip_chain,
    mip_chain_extents, pack_texture, unpack_texture, unpack_texture_page,
};

/// File extension of cooked meshes.
pub const MESH_EXTENSION: &str = "msh";
/// File extension of cooked textures.
pub const TEXTURE_EXTENSION: &str = "tex";
/// File extension of cooked materials.
pub const MATERIAL_EXTENSION: &str = "mat";
