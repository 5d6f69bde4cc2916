//! GPU-resident meshes, textures, materials and the ids that name them.

use std::fmt;

use renderer_assets::{MeshBounds, TransparencyMode, VertexFormat};
use renderer_rhi::buffer::Buffer;
use renderer_rhi::command::IndexType;
use renderer_rhi::image::{Extent2D, ImageFormat};
use renderer_rhi::vertex::{VertexAttributeFormat, VertexLayout};
use renderer_rhi::{DescriptorSetHandle, ImageHandle, PipelineHandle, PipelineLayoutHandle};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub(crate) fn from_index(index: usize) -> Self {
                Self(index as u32)
            }

            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

define_id!(
    /// A mesh uploaded to the renderer.
    MeshId
);
define_id!(
    /// A texture uploaded to the renderer.
    TextureId
);
define_id!(
    /// A material registered with the renderer.
    MaterialId
);

/// Vertex input layout matching a cooked vertex format.
pub fn vertex_layout(format: VertexFormat) -> Option<VertexLayout> {
    let stride = format.stride()? as u32;
    let layout = match format {
        VertexFormat::PncvF32 => VertexLayout::new(stride)
            .attribute(0, VertexAttributeFormat::Float32x3, 0)
            .attribute(1, VertexAttributeFormat::Float32x3, 12)
            .attribute(2, VertexAttributeFormat::Float32x3, 24)
            .attribute(3, VertexAttributeFormat::Float32x2, 36),
        VertexFormat::P32N8C8V16 => VertexLayout::new(stride)
            .attribute(0, VertexAttributeFormat::Float32x3, 0)
            .attribute(1, VertexAttributeFormat::Unorm8x3, 12)
            .attribute(2, VertexAttributeFormat::Unorm8x3, 15)
            .attribute(3, VertexAttributeFormat::Float32x2, 20),
        VertexFormat::Unknown => return None,
    };
    Some(layout)
}

/// Vertex and index buffers of an uploaded mesh.
#[derive(Clone, Debug)]
pub struct GpuMesh {
    pub vertex_buffer: Buffer,
    pub index_buffer: Option<Buffer>,
    pub index_type: IndexType,
    pub vertex_count: u32,
    pub index_count: u32,
    pub format: VertexFormat,
    pub bounds: MeshBounds,
}

/// A sampled image with its full mip chain uploaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuTexture {
    pub image: ImageHandle,
    pub extent: Extent2D,
    pub mip_levels: u32,
    pub format: ImageFormat,
}

/// A base effect: one pipeline layout with opaque and blended pipelines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Effect {
    pub layout: PipelineLayoutHandle,
    pub opaque: PipelineHandle,
    pub blended: PipelineHandle,
    pub vertex_format: VertexFormat,
    pub textured: bool,
}

impl Effect {
    /// Pipeline used for a transparency mode.
    pub fn pipeline(&self, transparency: TransparencyMode) -> PipelineHandle {
        match transparency {
            TransparencyMode::Transparent => self.blended,
            TransparencyMode::Opaque | TransparencyMode::Masked => self.opaque,
        }
    }
}

/// What a draw needs from its material.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GpuMaterial {
    pub name: String,
    pub pipeline: PipelineHandle,
    pub layout: PipelineLayoutHandle,
    pub vertex_format: VertexFormat,
    /// Set 2, present for textured effects.
    pub texture_set: Option<DescriptorSetHandle>,
    pub transparency: TransparencyMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layouts_match_strides() {
        let full = vertex_layout(VertexFormat::PncvF32).unwrap();
        assert_eq!(full.stride, 44);
        full.validate().unwrap();

        let packed = vertex_layout(VertexFormat::P32N8C8V16).unwrap();
        assert_eq!(packed.stride, 28);
        packed.validate().unwrap();

        assert!(vertex_layout(VertexFormat::Unknown).is_none());
    }

    #[test]
    fn test_ids_order_by_index() {
        assert!(MeshId::from_index(1) < MeshId::from_index(2));
        assert_eq!(format!("{:?}", MaterialId::from_index(3)), "MaterialId(3)");
    }
}
