//! Graphics pipeline management.
//!
//! # Overview
//!
//! - [`PipelineLayout`] holds descriptor set layouts and push constant ranges
//! - [`Pipeline`] is a created graphics pipeline bound to one layout
//! - [`GraphicsPipelineBuilder`] provides a flexible builder for graphics pipeline creation
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use renderer_rhi::GpuBackend;
//! use renderer_rhi::image::ImageFormat;
//! use renderer_rhi::pipeline::{GraphicsPipelineBuilder, PipelineLayout};
//! use renderer_rhi::shader::{Shader, ShaderStage};
//! use renderer_rhi::vertex::VertexLayout;
//!
//! # fn example(backend: &dyn GpuBackend, vertices: VertexLayout) -> Result<(), renderer_rhi::RhiError> {
//! let vs = Shader::from_spirv_file(backend, Path::new("mesh.vert.spv"), ShaderStage::Vertex, "main")?;
//! let fs = Shader::from_spirv_file(backend, Path::new("mesh.frag.spv"), ShaderStage::Fragment, "main")?;
//! let layout = PipelineLayout::new(backend, &[], &[])?;
//!
//! let pipeline = GraphicsPipelineBuilder::new()
//!     .vertex_shader(&vs)
//!     .fragment_shader(&fs)
//!     .vertex_layout(vertices)
//!     .color_attachment_format(ImageFormat::Bgra8Srgb)
//!     .depth_attachment_format(ImageFormat::D32Float)
//!     .build(backend, &layout)?;
//! # Ok(())
//! # }
//! ```

use tracing::{debug, info};

use crate::backend::GpuBackend;
use crate::descriptor::ShaderStages;
use crate::error::{RhiError, RhiResult};
use crate::handle::{
    DescriptorSetLayoutHandle, PipelineHandle, PipelineLayoutHandle, ShaderModuleHandle,
};
use crate::image::ImageFormat;
use crate::shader::{Shader, ShaderStage};
use crate::vertex::VertexLayout;

/// A push constant block visible to some stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub offset: u32,
    pub size: u32,
}

/// Creation parameters for a pipeline layout.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineLayoutDesc {
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

/// Pipeline layout: the descriptor sets and push constants a pipeline uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineLayout {
    handle: PipelineLayoutHandle,
    set_count: u32,
}

impl PipelineLayout {
    /// Creates a pipeline layout.
    ///
    /// # Arguments
    ///
    /// * `backend` - The GPU backend
    /// * `set_layouts` - Descriptor set layouts, in set index order
    /// * `push_constant_ranges` - Push constant ranges
    pub fn new(
        backend: &dyn GpuBackend,
        set_layouts: &[DescriptorSetLayoutHandle],
        push_constant_ranges: &[PushConstantRange],
    ) -> RhiResult<Self> {
        let desc = PipelineLayoutDesc {
            set_layouts: set_layouts.to_vec(),
            push_constant_ranges: push_constant_ranges.to_vec(),
        };
        let handle = backend.create_pipeline_layout(&desc)?;

        debug!(
            "Created pipeline layout with {} set(s) and {} push constant range(s)",
            set_layouts.len(),
            push_constant_ranges.len()
        );

        Ok(Self {
            handle,
            set_count: set_layouts.len() as u32,
        })
    }

    #[inline]
    pub fn handle(&self) -> PipelineLayoutHandle {
        self.handle
    }

    #[inline]
    pub fn set_count(&self) -> u32 {
        self.set_count
    }

    pub fn destroy(self, backend: &dyn GpuBackend) {
        backend.destroy_pipeline_layout(self.handle);
    }
}

/// Primitive topology for input assembly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    #[default]
    TriangleList,
    TriangleStrip,
}

/// Polygon rasterization mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
}

/// Face culling mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

/// Front face winding order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FrontFace {
    #[default]
    CounterClockwise,
    Clockwise,
}

/// Depth comparison operator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Never,
    #[default]
    Less,
    Equal,
    LessOrEqual,
    Greater,
    Always,
}

/// Blend factor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcAlpha,
    OneMinusSrcAlpha,
}

/// Blend operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
}

/// Color blend attachment configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ColorBlendAttachment {
    pub blend_enable: bool,
    pub src_color_blend_factor: BlendFactor,
    pub dst_color_blend_factor: BlendFactor,
    pub color_blend_op: BlendOp,
    pub src_alpha_blend_factor: BlendFactor,
    pub dst_alpha_blend_factor: BlendFactor,
    pub alpha_blend_op: BlendOp,
}

impl Default for ColorBlendAttachment {
    fn default() -> Self {
        Self {
            blend_enable: false,
            src_color_blend_factor: BlendFactor::One,
            dst_color_blend_factor: BlendFactor::Zero,
            color_blend_op: BlendOp::Add,
            src_alpha_blend_factor: BlendFactor::One,
            dst_alpha_blend_factor: BlendFactor::Zero,
            alpha_blend_op: BlendOp::Add,
        }
    }
}

impl ColorBlendAttachment {
    /// Blending disabled; the fragment color overwrites the target.
    pub fn opaque() -> Self {
        Self::default()
    }

    /// Standard alpha blending: `src * src_alpha + dst * (1 - src_alpha)`.
    pub fn alpha_blend() -> Self {
        Self {
            blend_enable: true,
            src_color_blend_factor: BlendFactor::SrcAlpha,
            dst_color_blend_factor: BlendFactor::OneMinusSrcAlpha,
            ..Self::default()
        }
    }
}

/// A shader stage as referenced by a pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShaderStageDesc {
    pub stage: ShaderStage,
    pub module: ShaderModuleHandle,
    pub entry_point: String,
}

/// Everything the backend needs to create a graphics pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct GraphicsPipelineDesc {
    pub layout: PipelineLayoutHandle,
    pub stages: Vec<ShaderStageDesc>,
    pub vertex_layout: VertexLayout,
    pub topology: PrimitiveTopology,
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_test_enable: bool,
    pub depth_write_enable: bool,
    pub depth_compare_op: CompareOp,
    pub color_blend: ColorBlendAttachment,
    pub color_attachment_format: Option<ImageFormat>,
    pub depth_attachment_format: Option<ImageFormat>,
}

/// A created graphics pipeline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pipeline {
    handle: PipelineHandle,
    layout: PipelineLayoutHandle,
}

impl Pipeline {
    #[inline]
    pub fn handle(&self) -> PipelineHandle {
        self.handle
    }

    #[inline]
    pub fn layout(&self) -> PipelineLayoutHandle {
        self.layout
    }

    pub fn destroy(self, backend: &dyn GpuBackend) {
        backend.destroy_pipeline(self.handle);
    }
}

/// Builder for creating graphics pipelines.
///
/// Defaults:
///
/// - Primitive topology: Triangle list
/// - Polygon mode: Fill
/// - Cull mode: Back-face culling
/// - Front face: Counter-clockwise
/// - Depth test and write: Enabled (if depth format is set)
/// - Depth compare op: Less
/// - Blending: Disabled
pub struct GraphicsPipelineBuilder<'a> {
    vertex_shader: Option<&'a Shader>,
    fragment_shader: Option<&'a Shader>,
    vertex_layout: VertexLayout,
    topology: PrimitiveTopology,
    polygon_mode: PolygonMode,
    cull_mode: CullMode,
    front_face: FrontFace,
    depth_test_enable: bool,
    depth_write_enable: bool,
    depth_compare_op: CompareOp,
    color_blend: ColorBlendAttachment,
    color_attachment_format: Option<ImageFormat>,
    depth_attachment_format: Option<ImageFormat>,
}

impl Default for GraphicsPipelineBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> GraphicsPipelineBuilder<'a> {
    /// Creates a new graphics pipeline builder with default settings.
    pub fn new() -> Self {
        Self {
            vertex_shader: None,
            fragment_shader: None,
            vertex_layout: VertexLayout::default(),
            topology: PrimitiveTopology::TriangleList,
            polygon_mode: PolygonMode::Fill,
            cull_mode: CullMode::Back,
            front_face: FrontFace::CounterClockwise,
            depth_test_enable: true,
            depth_write_enable: true,
            depth_compare_op: CompareOp::Less,
            color_blend: ColorBlendAttachment::opaque(),
            color_attachment_format: None,
            depth_attachment_format: None,
        }
    }

    /// Sets the vertex shader. The build fails without one.
    pub fn vertex_shader(mut self, shader: &'a Shader) -> Self {
        self.vertex_shader = Some(shader);
        self
    }

    /// Sets the fragment shader. The build fails without one.
    pub fn fragment_shader(mut self, shader: &'a Shader) -> Self {
        self.fragment_shader = Some(shader);
        self
    }

    pub fn vertex_layout(mut self, layout: VertexLayout) -> Self {
        self.vertex_layout = layout;
        self
    }

    pub fn topology(mut self, topology: PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    pub fn polygon_mode(mut self, mode: PolygonMode) -> Self {
        self.polygon_mode = mode;
        self
    }

    pub fn cull_mode(mut self, mode: CullMode) -> Self {
        self.cull_mode = mode;
        self
    }

    pub fn front_face(mut self, face: FrontFace) -> Self {
        self.front_face = face;
        self
    }

    pub fn depth_test_enable(mut self, enable: bool) -> Self {
        self.depth_test_enable = enable;
        self
    }

    pub fn depth_write_enable(mut self, enable: bool) -> Self {
        self.depth_write_enable = enable;
        self
    }

    pub fn depth_compare_op(mut self, op: CompareOp) -> Self {
        self.depth_compare_op = op;
        self
    }

    pub fn color_blend_attachment(mut self, attachment: ColorBlendAttachment) -> Self {
        self.color_blend = attachment;
        self
    }

    pub fn color_attachment_format(mut self, format: ImageFormat) -> Self {
        self.color_attachment_format = Some(format);
        self
    }

    pub fn depth_attachment_format(mut self, format: ImageFormat) -> Self {
        self.depth_attachment_format = Some(format);
        self
    }

    /// Validates the configuration and produces the backend description.
    pub fn describe(&self, layout: &PipelineLayout) -> RhiResult<GraphicsPipelineDesc> {
        let vertex_shader = self.vertex_shader.ok_or_else(|| {
            RhiError::PipelineError("Vertex shader is required".to_string())
        })?;
        let fragment_shader = self.fragment_shader.ok_or_else(|| {
            RhiError::PipelineError("Fragment shader is required".to_string())
        })?;

        if vertex_shader.stage() != ShaderStage::Vertex {
            return Err(RhiError::PipelineError(format!(
                "Expected a vertex shader, got {}",
                vertex_shader.stage()
            )));
        }
        if fragment_shader.stage() != ShaderStage::Fragment {
            return Err(RhiError::PipelineError(format!(
                "Expected a fragment shader, got {}",
                fragment_shader.stage()
            )));
        }
        if let Some(format) = self.depth_attachment_format
            && !format.is_depth()
        {
            return Err(RhiError::PipelineError(format!(
                "{:?} is not a depth format",
                format
            )));
        }
        self.vertex_layout.validate()?;

        let has_depth = self.depth_attachment_format.is_some();
        let stage = |shader: &Shader| ShaderStageDesc {
            stage: shader.stage(),
            module: shader.handle(),
            entry_point: shader.entry_point().to_string(),
        };

        Ok(GraphicsPipelineDesc {
            layout: layout.handle(),
            stages: vec![stage(vertex_shader), stage(fragment_shader)],
            vertex_layout: self.vertex_layout.clone(),
            topology: self.topology,
            polygon_mode: self.polygon_mode,
            cull_mode: self.cull_mode,
            front_face: self.front_face,
            depth_test_enable: self.depth_test_enable && has_depth,
            depth_write_enable: self.depth_write_enable && has_depth,
            depth_compare_op: self.depth_compare_op,
            color_blend: self.color_blend,
            color_attachment_format: self.color_attachment_format,
            depth_attachment_format: self.depth_attachment_format,
        })
    }

    /// Builds the graphics pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Vertex or fragment shader is not set or has the wrong stage
    /// - The vertex layout is inconsistent
    /// - Pipeline creation fails
    pub fn build(self, backend: &dyn GpuBackend, layout: &PipelineLayout) -> RhiResult<Pipeline> {
        let desc = self.describe(layout)?;
        let handle = backend.create_graphics_pipeline(&desc)?;

        info!(
            "Graphics pipeline created (cull {:?}, blend {})",
            desc.cull_mode, desc.color_blend.blend_enable
        );

        Ok(Pipeline {
            handle,
            layout: layout.handle(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;
    use crate::shader::{SPIRV_MAGIC, ShaderCode};
    use crate::vertex::VertexAttributeFormat;

    fn shader(backend: &HeadlessBackend, stage: ShaderStage) -> Shader {
        let code = ShaderCode::from_words(vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0], stage, "main")
            .unwrap();
        Shader::from_code(backend, &code).unwrap()
    }

    #[test]
    fn test_color_blend_attachment_alpha_blend() {
        let attachment = ColorBlendAttachment::alpha_blend();
        assert!(attachment.blend_enable);
        assert_eq!(attachment.src_color_blend_factor, BlendFactor::SrcAlpha);
        assert_eq!(attachment.dst_color_blend_factor, BlendFactor::OneMinusSrcAlpha);
        assert!(!ColorBlendAttachment::opaque().blend_enable);
    }

    #[test]
    fn test_default_trait_implementations() {
        assert_eq!(PrimitiveTopology::default(), PrimitiveTopology::TriangleList);
        assert_eq!(PolygonMode::default(), PolygonMode::Fill);
        assert_eq!(CullMode::default(), CullMode::Back);
        assert_eq!(FrontFace::default(), FrontFace::CounterClockwise);
        assert_eq!(CompareOp::default(), CompareOp::Less);
    }

    #[test]
    fn test_builder_requires_shaders() {
        let backend = HeadlessBackend::new();
        let layout = PipelineLayout::new(&backend, &[], &[]).unwrap();
        let err = GraphicsPipelineBuilder::new().describe(&layout).unwrap_err();
        assert!(matches!(err, RhiError::PipelineError(_)));
    }

    #[test]
    fn test_builder_rejects_swapped_stages() {
        let backend = HeadlessBackend::new();
        let layout = PipelineLayout::new(&backend, &[], &[]).unwrap();
        let vs = shader(&backend, ShaderStage::Vertex);
        let fs = shader(&backend, ShaderStage::Fragment);
        let result = GraphicsPipelineBuilder::new()
            .vertex_shader(&fs)
            .fragment_shader(&vs)
            .describe(&layout);
        assert!(result.is_err());
    }

    #[test]
    fn test_depth_disabled_without_depth_attachment() {
        let backend = HeadlessBackend::new();
        let layout = PipelineLayout::new(&backend, &[], &[]).unwrap();
        let vs = shader(&backend, ShaderStage::Vertex);
        let fs = shader(&backend, ShaderStage::Fragment);

        let desc = GraphicsPipelineBuilder::new()
            .vertex_shader(&vs)
            .fragment_shader(&fs)
            .vertex_layout(VertexLayout::new(12).attribute(0, VertexAttributeFormat::Float32x3, 0))
            .describe(&layout)
            .unwrap();
        assert!(!desc.depth_test_enable);
        assert!(!desc.depth_write_enable);
        assert_eq!(desc.stages.len(), 2);

        let pipeline = GraphicsPipelineBuilder::new()
            .vertex_shader(&vs)
            .fragment_shader(&fs)
            .depth_attachment_format(ImageFormat::D32Float)
            .build(&backend, &layout)
            .unwrap();
        assert_eq!(pipeline.layout(), layout.handle());
    }
}
