//! Main renderer orchestration.
//!
//! This module provides the [`Renderer`], the engine context that owns every
//! GPU resource the renderer creates and runs the frame loop.
//!
//! # Resource Destruction Order
//!
//! Everything is destroyed through deletion queues, which run in reverse
//! creation order:
//! 1. Wait for every frame slot's fence
//! 2. Flush the swapchain queue (depth buffer)
//! 3. Flush the main queue (materials' pipelines, meshes, textures, frame
//!    slots, upload context)
//! 4. Destroy descriptor pools, then cached set layouts

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use glam::{Mat4, Vec3};
use tracing::{debug, error, info, warn};

use renderer_assets::{MaterialInfo, MeshData, TextureData, TransparencyMode, VertexFormat};
use renderer_core::{RendererConfig, ScopedTimer, VarFlags, VarRegistry};
use renderer_rhi::buffer::{Buffer, BufferUsage};
use renderer_rhi::command::{CommandList, RenderingInfo, Viewport};
use renderer_rhi::descriptor::{
    DescriptorAllocator, DescriptorBindingBuilder, DescriptorBuilder, DescriptorLayoutCache,
    DescriptorType, ShaderStages,
};
use renderer_rhi::image::{Extent2D, SamplerDesc};
use renderer_rhi::pipeline::{ColorBlendAttachment, GraphicsPipelineBuilder, PipelineLayout};
use renderer_rhi::shader::{Shader, ShaderCode};
use renderer_rhi::{DescriptorSetHandle, DescriptorSetLayoutHandle, GpuBackend, SamplerHandle};

use crate::MAX_FRAMES_IN_FLIGHT;
use crate::deletion_queue::{Deletion, DeletionQueue};
use crate::depth_buffer::{DEFAULT_DEPTH_FORMAT, DepthBuffer};
use crate::error::{RenderError, RenderResult};
use crate::frame_manager::{BeginFrame, FrameRing, FrameTarget, FrameTimeouts};
use crate::render_object::{
    DrawBindings, DrawStats, RenderObject, object_data, record_draws, sort_objects,
};
use crate::resources::{
    Effect, GpuMaterial, GpuMesh, GpuTexture, MaterialId, MeshId, TextureId, vertex_layout,
};
use crate::ubo::{CameraUBO, SceneUBO};
use crate::uniform::{UniformLayout, UniformSlot};
use crate::upload::{self, UploadContext};

/// Variable toggling the per-frame pipeline/mesh sort (0 or 1).
pub const SORT_OBJECTS_VAR: &str = "render.sort_objects";
/// Variable holding the number of frames between stat logs (0 disables).
pub const STATS_INTERVAL_VAR: &str = "render.stats_interval";

/// Texture slot a material's texture set is built from.
pub const BASE_COLOR_SLOT: &str = "baseColor";

/// What happened to a call to [`Renderer::draw_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and presented.
    Rendered(DrawStats),
    /// Nothing was rendered; the next call may succeed.
    Skipped,
}

/// Counters since the renderer was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub frames_rendered: u64,
    pub frames_skipped: u64,
    pub swapchain_recreations: u32,
    pub total_draws: u64,
    pub last_frame: DrawStats,
}

/// Resources created once at startup, before the renderer exists.
struct Core {
    frames: FrameRing,
    upload: UploadContext,
    uniform_layout: UniformLayout,
    camera_slot: UniformSlot,
    scene_slot: UniformSlot,
    uniform_buffer: Buffer,
    global_set: DescriptorSetHandle,
    global_layout: DescriptorSetLayoutHandle,
    texture_layout: DescriptorSetLayoutHandle,
    sampler: SamplerHandle,
    depth: DepthBuffer,
}

/// Engine context: backend handle, frame ring, resource registries and the
/// render object list.
///
/// The renderer is driven from a single thread.
pub struct Renderer {
    backend: Arc<dyn GpuBackend>,
    deletion: DeletionQueue,
    /// Resources sized to the swapchain; rebuilt on recreation.
    swapchain_deletion: DeletionQueue,
    layout_cache: DescriptorLayoutCache,
    descriptor_allocator: DescriptorAllocator,

    frames: FrameRing,
    upload: UploadContext,
    uniform_layout: UniformLayout,
    camera_slot: UniformSlot,
    scene_slot: UniformSlot,
    uniform_buffer: Buffer,
    global_set: DescriptorSetHandle,
    global_layout: DescriptorSetLayoutHandle,
    texture_layout: DescriptorSetLayoutHandle,
    sampler: SamplerHandle,
    depth: DepthBuffer,

    meshes: Vec<GpuMesh>,
    mesh_names: HashMap<String, MeshId>,
    textures: Vec<GpuTexture>,
    texture_names: HashMap<String, TextureId>,
    effects: HashMap<String, Effect>,
    materials: Vec<GpuMaterial>,
    material_names: HashMap<String, MaterialId>,
    objects: Vec<RenderObject>,

    camera: CameraUBO,
    /// `None` animates the ambient color with the frame number.
    scene: Option<SceneUBO>,
    clear_color: [f32; 4],
    stats: RenderStats,
    shut_down: bool,
}

impl Renderer {
    /// Creates the renderer and registers its variables in `vars`.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable clashes with an existing one of another
    /// type or any startup resource cannot be created. Resources created
    /// before the failure are released.
    pub fn new(
        backend: Arc<dyn GpuBackend>,
        config: &RendererConfig,
        vars: &mut VarRegistry,
    ) -> RenderResult<Self> {
        vars.create_int(
            SORT_OBJECTS_VAR,
            "Sort render objects by pipeline and mesh before drawing",
            1,
            VarFlags::empty(),
        )?;
        vars.create_int(
            STATS_INTERVAL_VAR,
            "Frames between draw statistic logs, 0 disables",
            120,
            VarFlags::empty(),
        )?;

        info!(
            "Initializing renderer on {} backend ({}x{} surface)",
            backend.name(),
            backend.surface_extent().width,
            backend.surface_extent().height
        );

        let mut deletion = DeletionQueue::new("main");
        let mut swapchain_deletion = DeletionQueue::new("swapchain");
        let mut layout_cache = DescriptorLayoutCache::new();
        let mut descriptor_allocator = DescriptorAllocator::new();

        let core = match Self::create_core(
            &backend,
            config,
            &mut deletion,
            &mut swapchain_deletion,
            &mut layout_cache,
            &mut descriptor_allocator,
        ) {
            Ok(core) => core,
            Err(e) => {
                error!("Renderer initialization failed: {}", e);
                swapchain_deletion.flush(backend.as_ref());
                deletion.flush(backend.as_ref());
                descriptor_allocator.cleanup(backend.as_ref());
                layout_cache.cleanup(backend.as_ref());
                return Err(e);
            }
        };

        let aspect = core.depth.extent().aspect_ratio();
        info!("Renderer initialized");

        Ok(Self {
            backend,
            deletion,
            swapchain_deletion,
            layout_cache,
            descriptor_allocator,
            frames: core.frames,
            upload: core.upload,
            uniform_layout: core.uniform_layout,
            camera_slot: core.camera_slot,
            scene_slot: core.scene_slot,
            uniform_buffer: core.uniform_buffer,
            global_set: core.global_set,
            global_layout: core.global_layout,
            texture_layout: core.texture_layout,
            sampler: core.sampler,
            depth: core.depth,
            meshes: Vec::new(),
            mesh_names: HashMap::new(),
            textures: Vec::new(),
            texture_names: HashMap::new(),
            effects: HashMap::new(),
            materials: Vec::new(),
            material_names: HashMap::new(),
            objects: Vec::new(),
            camera: CameraUBO::look_at(Vec3::new(0.0, 6.0, 10.0), Vec3::ZERO, aspect),
            scene: None,
            clear_color: config.clear_color,
            stats: RenderStats::default(),
            shut_down: false,
        })
    }

    fn create_core(
        backend: &Arc<dyn GpuBackend>,
        config: &RendererConfig,
        deletion: &mut DeletionQueue,
        swapchain_deletion: &mut DeletionQueue,
        cache: &mut DescriptorLayoutCache,
        allocator: &mut DescriptorAllocator,
    ) -> RenderResult<Core> {
        let device = backend.as_ref();

        let mut upload = UploadContext::new(device, deletion, config.upload_timeout())?;

        let frames = FrameRing::new(
            Arc::clone(backend),
            deletion,
            cache,
            allocator,
            config.max_objects,
            FrameTimeouts {
                fence: config.fence_timeout(),
                acquire: config.acquire_timeout(),
            },
        )?;

        // Camera and scene share one buffer, one region per frame slot
        let mut uniform_layout = UniformLayout::from_limits(&device.limits());
        let camera_slot = uniform_layout.register_type::<CameraUBO>("camera");
        let scene_slot = uniform_layout.register_type::<SceneUBO>("scene");
        let uniform_buffer = Buffer::new(
            device,
            BufferUsage::Uniform,
            uniform_layout.buffer_size(MAX_FRAMES_IN_FLIGHT),
            "global uniforms",
        )?;
        deletion.push(Deletion::Buffer(uniform_buffer.handle()));
        debug!(
            "Uniform layout: stride {} bytes, buffer {} bytes",
            uniform_layout.stride(),
            uniform_buffer.size()
        );

        let stages = ShaderStages::VERTEX | ShaderStages::FRAGMENT;
        let (global_set, global_layout) = DescriptorBuilder::begin(cache, allocator)
            .bind_buffer(
                0,
                uniform_buffer.handle(),
                0,
                CameraUBO::SIZE as u64,
                DescriptorType::UniformBufferDynamic,
                stages,
            )
            .bind_buffer(
                1,
                uniform_buffer.handle(),
                0,
                SceneUBO::SIZE as u64,
                DescriptorType::UniformBufferDynamic,
                stages,
            )
            .build(device)?;

        let texture_layout = cache.create_layout(
            device,
            &[DescriptorBindingBuilder::combined_image_sampler(
                0,
                ShaderStages::FRAGMENT,
            )],
        )?;

        let sampler = device.create_sampler(&SamplerDesc::nearest())?;
        deletion.push(Deletion::Sampler(sampler));

        let depth = DepthBuffer::new(
            device,
            &mut upload,
            swapchain_deletion,
            device.surface_extent(),
        )?;

        Ok(Core {
            frames,
            upload,
            uniform_layout,
            camera_slot,
            scene_slot,
            uniform_buffer,
            global_set,
            global_layout,
            texture_layout,
            sampler,
            depth,
        })
    }

    // =========================================================================
    // Effects and materials
    // =========================================================================

    /// Builds the opaque and blended pipelines of an effect.
    ///
    /// Textured effects get a third descriptor set holding one combined
    /// image sampler. Shader modules are destroyed once both pipelines exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken, the vertex format is unknown,
    /// or shader/pipeline creation fails.
    pub fn create_effect(
        &mut self,
        name: &str,
        vertex: &ShaderCode,
        fragment: &ShaderCode,
        vertex_format: VertexFormat,
        textured: bool,
    ) -> RenderResult<()> {
        if self.effects.contains_key(name) {
            return Err(RenderError::Unsupported(format!(
                "effect '{}' already exists",
                name
            )));
        }
        let _timer = ScopedTimer::new("create effect");
        let input = vertex_layout(vertex_format).ok_or_else(|| {
            RenderError::Unsupported(format!(
                "effect '{}' uses vertex format {}",
                name, vertex_format
            ))
        })?;
        let backend = self.backend.as_ref();

        let mut set_layouts = vec![self.global_layout, self.frames.object_layout()];
        if textured {
            set_layouts.push(self.texture_layout);
        }
        let layout = PipelineLayout::new(backend, &set_layouts, &[])?;
        self.deletion.push(Deletion::PipelineLayout(layout.handle()));

        let vs = Shader::from_code(backend, vertex)?;
        let fs = match Shader::from_code(backend, fragment) {
            Ok(fs) => fs,
            Err(e) => {
                vs.destroy(backend);
                return Err(e.into());
            }
        };

        let builder = || {
            GraphicsPipelineBuilder::new()
                .vertex_shader(&vs)
                .fragment_shader(&fs)
                .vertex_layout(input.clone())
                .color_attachment_format(backend.swapchain_format())
                .depth_attachment_format(DEFAULT_DEPTH_FORMAT)
        };
        let opaque = builder()
            .color_blend_attachment(ColorBlendAttachment::opaque())
            .build(backend, &layout);
        let blended = builder()
            .color_blend_attachment(ColorBlendAttachment::alpha_blend())
            .depth_write_enable(false)
            .build(backend, &layout);

        vs.destroy(backend);
        fs.destroy(backend);

        for pipeline in [&opaque, &blended].into_iter().flatten() {
            self.deletion.push(Deletion::Pipeline(pipeline.handle()));
        }
        let opaque = opaque?;
        let blended = blended?;

        info!(
            "Effect '{}' created ({}, {})",
            name,
            vertex_format,
            if textured { "textured" } else { "untextured" }
        );
        self.effects.insert(
            name.to_string(),
            Effect {
                layout: layout.handle(),
                opaque: opaque.handle(),
                blended: blended.handle(),
                vertex_format,
                textured,
            },
        );
        Ok(())
    }

    /// Registers a material drawn with `effect`.
    ///
    /// Textured effects need a texture; a texture given to an untextured
    /// effect is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is taken, the effect or texture is
    /// unknown, a textured effect gets no texture, or the texture set cannot
    /// be built.
    pub fn create_material(
        &mut self,
        name: &str,
        effect: &str,
        texture: Option<TextureId>,
        transparency: TransparencyMode,
    ) -> RenderResult<MaterialId> {
        if self.material_names.contains_key(name) {
            return Err(RenderError::Unsupported(format!(
                "material '{}' already exists",
                name
            )));
        }
        let effect_info = self
            .effects
            .get(effect)
            .ok_or_else(|| RenderError::UnknownResource {
                kind: "effect",
                name: effect.to_string(),
            })?;

        let texture_set = match (effect_info.textured, texture) {
            (true, Some(id)) => {
                let gpu = self
                    .textures
                    .get(id.index())
                    .ok_or_else(|| RenderError::UnknownResource {
                        kind: "texture",
                        name: format!("{:?}", id),
                    })?;
                let (set, _) =
                    DescriptorBuilder::begin(&mut self.layout_cache, &mut self.descriptor_allocator)
                        .bind_image(
                            0,
                            Some(self.sampler),
                            gpu.image,
                            DescriptorType::CombinedImageSampler,
                            ShaderStages::FRAGMENT,
                        )
                        .build(self.backend.as_ref())?;
                Some(set)
            }
            (true, None) => {
                return Err(RenderError::Unsupported(format!(
                    "material '{}' uses textured effect '{}' without a texture",
                    name, effect
                )));
            }
            (false, Some(_)) => {
                warn!(
                    "Material '{}': effect '{}' is untextured, ignoring texture",
                    name, effect
                );
                None
            }
            (false, None) => None,
        };

        let id = MaterialId::from_index(self.materials.len());
        self.materials.push(GpuMaterial {
            name: name.to_string(),
            pipeline: effect_info.pipeline(transparency),
            layout: effect_info.layout,
            vertex_format: effect_info.vertex_format,
            texture_set,
            transparency,
        });
        self.material_names.insert(name.to_string(), id);
        debug!("Material '{}' registered as {:?}", name, id);
        Ok(id)
    }

    // =========================================================================
    // Meshes and textures
    // =========================================================================

    /// Uploads a mesh and registers it under `name`.
    pub fn upload_mesh(&mut self, name: &str, mesh: &MeshData) -> RenderResult<MeshId> {
        if self.mesh_names.contains_key(name) {
            return Err(RenderError::Unsupported(format!(
                "mesh '{}' already exists",
                name
            )));
        }
        let gpu = upload::upload_mesh(
            self.backend.as_ref(),
            &mut self.upload,
            &mut self.deletion,
            mesh,
            name,
        )?;

        let id = MeshId::from_index(self.meshes.len());
        self.meshes.push(gpu);
        self.mesh_names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Uploads a texture and registers it under `name`.
    pub fn upload_texture(&mut self, name: &str, texture: &TextureData) -> RenderResult<TextureId> {
        if self.texture_names.contains_key(name) {
            return Err(RenderError::Unsupported(format!(
                "texture '{}' already exists",
                name
            )));
        }
        let gpu = upload::upload_texture(
            self.backend.as_ref(),
            &mut self.upload,
            &mut self.deletion,
            texture,
            name,
        )?;

        let id = TextureId::from_index(self.textures.len());
        self.textures.push(gpu);
        self.texture_names.insert(name.to_string(), id);
        Ok(id)
    }

    /// Loads a `.msh` container, named after its file stem.
    ///
    /// A mesh already registered under that name is returned as is.
    pub fn load_mesh(&mut self, path: &Path) -> RenderResult<MeshId> {
        let name = asset_name(path);
        if let Some(&id) = self.mesh_names.get(&name) {
            return Ok(id);
        }
        info!("Loading mesh: {}", path.display());
        let mesh = MeshData::load(path)?;
        self.upload_mesh(&name, &mesh)
    }

    /// Loads a `.tex` container, named after its file stem.
    pub fn load_texture(&mut self, path: &Path) -> RenderResult<TextureId> {
        let name = asset_name(path);
        if let Some(&id) = self.texture_names.get(&name) {
            return Ok(id);
        }
        info!("Loading texture: {}", path.display());
        let texture = TextureData::load(path)?;
        self.upload_texture(&name, &texture)
    }

    /// Loads a `.mat` container and the texture it references.
    ///
    /// The texture comes from the `baseColor` slot, or the first slot if that
    /// one is missing. Its path is relative to the material's directory.
    pub fn load_material(&mut self, path: &Path) -> RenderResult<MaterialId> {
        let name = asset_name(path);
        if let Some(&id) = self.material_names.get(&name) {
            return Ok(id);
        }
        info!("Loading material: {}", path.display());
        let info = MaterialInfo::load(path)?;

        let texture_path = info
            .texture(BASE_COLOR_SLOT)
            .or_else(|| info.textures.values().next().map(String::as_str));
        let texture = match texture_path {
            Some(relative) => {
                let dir = path.parent().unwrap_or_else(|| Path::new(""));
                Some(self.load_texture(&dir.join(relative))?)
            }
            None => None,
        };

        self.create_material(&name, &info.base_effect, texture, info.transparency)
    }

    // =========================================================================
    // Scene
    // =========================================================================

    /// Adds an object to draw every frame.
    ///
    /// # Errors
    ///
    /// Returns an error if either id is unknown, the mesh's vertex format does
    /// not match the material's effect, or the object buffer is full.
    pub fn add_object(
        &mut self,
        mesh: MeshId,
        material: MaterialId,
        transform: Mat4,
    ) -> RenderResult<()> {
        let gpu_mesh = self
            .meshes
            .get(mesh.index())
            .ok_or_else(|| RenderError::UnknownResource {
                kind: "mesh",
                name: format!("{:?}", mesh),
            })?;
        let gpu_material =
            self.materials
                .get(material.index())
                .ok_or_else(|| RenderError::UnknownResource {
                    kind: "material",
                    name: format!("{:?}", material),
                })?;
        if gpu_mesh.format != gpu_material.vertex_format {
            return Err(RenderError::Unsupported(format!(
                "material '{}' expects {} vertices, mesh has {}",
                gpu_material.name, gpu_material.vertex_format, gpu_mesh.format
            )));
        }

        let capacity = self.frames.max_objects();
        if self.objects.len() >= capacity as usize {
            return Err(RenderError::TooManyObjects {
                count: self.objects.len() + 1,
                capacity,
            });
        }

        self.objects
            .push(RenderObject::new(mesh, material, transform));
        Ok(())
    }

    pub fn clear_objects(&mut self) {
        self.objects.clear();
    }

    pub fn objects(&self) -> &[RenderObject] {
        &self.objects
    }

    pub fn set_camera(&mut self, camera: CameraUBO) {
        self.camera = camera;
    }

    #[inline]
    pub fn camera(&self) -> &CameraUBO {
        &self.camera
    }

    /// Fixes the scene data. `None` restores the animated default.
    pub fn set_scene(&mut self, scene: Option<SceneUBO>) {
        self.scene = scene;
    }

    // =========================================================================
    // Frame loop
    // =========================================================================

    /// Renders one frame.
    ///
    /// Recreates the swapchain first when the previous frame found it out of
    /// date or suboptimal. A frame whose image could not be acquired, or whose
    /// surface is zero-sized, is reported as [`FrameOutcome::Skipped`].
    ///
    /// # Errors
    ///
    /// Returns an error if the renderer was shut down or a GPU call failed.
    /// Check [`RenderError::is_fatal`] to decide whether to keep going.
    pub fn draw_frame(&mut self, vars: &VarRegistry) -> RenderResult<FrameOutcome> {
        if self.shut_down {
            return Err(RenderError::ShutDown);
        }

        if self.frames.take_swapchain_dirty() && !self.recreate_swapchain()? {
            self.stats.frames_skipped += 1;
            return Ok(FrameOutcome::Skipped);
        }

        let target = match self.frames.begin_frame()? {
            BeginFrame::Ready(target) => target,
            BeginFrame::Skipped => {
                self.stats.frames_skipped += 1;
                return Ok(FrameOutcome::Skipped);
            }
        };

        let frame_number = self.frames.frame_number();
        let recorded = self
            .record_frame(target, vars)
            .and_then(|(commands, stats)| {
                self.frames.submit(commands)?;
                Ok(stats)
            });
        let stats = match recorded {
            Ok(stats) => stats,
            Err(e) => {
                if let Err(abandon) = self.frames.abandon_frame() {
                    error!("Failed to abandon frame {}: {}", frame_number, abandon);
                }
                return Err(e);
            }
        };
        self.frames.present()?;

        self.stats.frames_rendered += 1;
        self.stats.total_draws += u64::from(stats.draws);
        self.stats.last_frame = stats;

        let interval = vars.get_int(STATS_INTERVAL_VAR).unwrap_or(0);
        if interval > 0 && (frame_number + 1) % interval as u64 == 0 {
            info!(
                "Frame {}: {} objects, {} draws, {} pipeline binds, {} mesh binds, {} texture binds",
                frame_number,
                stats.objects,
                stats.draws,
                stats.pipeline_binds,
                stats.mesh_binds,
                stats.texture_binds
            );
        }

        Ok(FrameOutcome::Rendered(stats))
    }

    /// Steps 4 and 5: frame data writes and command recording.
    fn record_frame(
        &mut self,
        target: FrameTarget,
        vars: &VarRegistry,
    ) -> RenderResult<(CommandList, DrawStats)> {
        let FrameTarget {
            image_index,
            mut recorder,
            ..
        } = target;

        if vars.get_int(SORT_OBJECTS_VAR).unwrap_or(1) != 0 {
            sort_objects(&mut self.objects, &self.materials);
        }

        let scene = self
            .scene
            .unwrap_or_else(|| SceneUBO::animated(self.frames.frame_number()));
        let camera_offset = self.frames.write_uniform(
            &self.uniform_buffer,
            &self.uniform_layout,
            self.camera_slot,
            &self.camera,
        )?;
        let scene_offset = self.frames.write_uniform(
            &self.uniform_buffer,
            &self.uniform_layout,
            self.scene_slot,
            &scene,
        )?;
        self.frames.write_objects(&object_data(&self.objects))?;

        let extent = self.depth.extent();
        recorder.begin_rendering(RenderingInfo {
            image_index,
            depth: Some(self.depth.image()),
            clear_color: self.clear_color,
            clear_depth: 1.0,
            extent,
        });
        recorder.set_viewport(Viewport::from_extent(extent));
        recorder.set_scissor(extent);

        let bindings = DrawBindings {
            global_set: self.global_set,
            global_offsets: [camera_offset, scene_offset],
            object_set: self.frames.current_slot().object_set(),
        };
        let stats = record_draws(
            &mut recorder,
            &self.objects,
            &self.meshes,
            &self.materials,
            &bindings,
        );

        recorder.end_rendering();
        Ok((recorder.end()?, stats))
    }

    /// Waits for the GPU, then rebuilds the swapchain and the depth buffer.
    ///
    /// Returns `false` when the surface is zero-sized; recreation is retried
    /// on the next frame.
    fn recreate_swapchain(&mut self) -> RenderResult<bool> {
        let extent = self.backend.surface_extent();
        if extent.is_empty() {
            debug!("Ignoring resize to zero dimensions");
            self.frames.mark_swapchain_dirty();
            return Ok(false);
        }

        self.frames.wait_all()?;
        let backend = self.backend.as_ref();
        backend.recreate_swapchain(extent)?;
        self.swapchain_deletion.flush(backend);
        self.depth = DepthBuffer::new(
            backend,
            &mut self.upload,
            &mut self.swapchain_deletion,
            extent,
        )?;

        self.stats.swapchain_recreations += 1;
        info!("Swapchain recreated at {}x{}", extent.width, extent.height);
        Ok(true)
    }

    /// Waits for every frame in flight, then destroys everything the renderer
    /// created. Later calls do nothing.
    ///
    /// # Errors
    ///
    /// Returns the wait error, if any. Resources are destroyed regardless.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let waited = self.frames.wait_all();
        if let Err(e) = &waited {
            error!("Failed to wait for frames during shutdown: {}", e);
        }

        let backend = self.backend.as_ref();
        let swapchain = self.swapchain_deletion.flush(backend);
        let main = self.deletion.flush(backend);
        self.descriptor_allocator.cleanup(backend);
        self.layout_cache.cleanup(backend);
        self.meshes.clear();
        self.mesh_names.clear();
        self.textures.clear();
        self.texture_names.clear();
        self.effects.clear();
        self.materials.clear();
        self.material_names.clear();
        self.objects.clear();

        info!(
            "Renderer destroyed ({} swapchain and {} main deletions)",
            swapchain, main
        );
        waited
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn backend(&self) -> &Arc<dyn GpuBackend> {
        &self.backend
    }

    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.frames.frame_number()
    }

    #[inline]
    pub fn stats(&self) -> &RenderStats {
        &self.stats
    }

    #[inline]
    pub fn swapchain_extent(&self) -> Extent2D {
        self.depth.extent()
    }

    #[inline]
    pub fn uniform_layout(&self) -> &UniformLayout {
        &self.uniform_layout
    }

    pub fn mesh(&self, id: MeshId) -> Option<&GpuMesh> {
        self.meshes.get(id.index())
    }

    pub fn texture(&self, id: TextureId) -> Option<&GpuTexture> {
        self.textures.get(id.index())
    }

    pub fn material(&self, id: MaterialId) -> Option<&GpuMaterial> {
        self.materials.get(id.index())
    }

    pub fn effect(&self, name: &str) -> Option<&Effect> {
        self.effects.get(name)
    }

    pub fn mesh_id(&self, name: &str) -> Option<MeshId> {
        self.mesh_names.get(name).copied()
    }

    pub fn texture_id(&self, name: &str) -> Option<TextureId> {
        self.texture_names.get(name).copied()
    }

    pub fn material_id(&self, name: &str) -> Option<MaterialId> {
        self.material_names.get(name).copied()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Renderer shutdown during drop failed: {}", e);
        }
    }
}

fn asset_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderer_assets::{VertexPncvF32, pack_mesh};
    use renderer_rhi::headless::HeadlessBackend;
    use renderer_rhi::shader::{SPIRV_MAGIC, ShaderStage};

    fn shader(stage: ShaderStage) -> ShaderCode {
        ShaderCode::from_words(vec![SPIRV_MAGIC, 0x0001_0000, 0, 1, 0], stage, "main").unwrap()
    }

    fn triangle() -> MeshData {
        let vertices = [
            VertexPncvF32::new(Vec3::ZERO, Vec3::Z, Vec3::ONE, [0.0, 0.0]),
            VertexPncvF32::new(Vec3::X, Vec3::Z, Vec3::ONE, [1.0, 0.0]),
            VertexPncvF32::new(Vec3::Y, Vec3::Z, Vec3::ONE, [0.0, 1.0]),
        ];
        let container = pack_mesh(
            VertexFormat::PncvF32,
            bytemuck::cast_slice(&vertices),
            bytemuck::cast_slice(&[0u16, 1, 2]),
            2,
            "triangle.obj",
        )
        .unwrap();
        MeshData::from_container(&container).unwrap()
    }

    fn renderer() -> (Arc<HeadlessBackend>, Renderer, VarRegistry) {
        let backend = Arc::new(HeadlessBackend::with_surface(
            Extent2D::new(320, 240),
            Default::default(),
        ));
        let config = RendererConfig {
            max_objects: 8,
            ..RendererConfig::default()
        };
        let mut vars = VarRegistry::new();
        let renderer = Renderer::new(backend.clone(), &config, &mut vars).unwrap();
        (backend, renderer, vars)
    }

    #[test]
    fn test_registers_vars() {
        let (_backend, _renderer, vars) = renderer();
        assert_eq!(vars.get_int(SORT_OBJECTS_VAR), Some(1));
        assert_eq!(vars.get_int(STATS_INTERVAL_VAR), Some(120));
    }

    #[test]
    fn test_uniform_layout_matches_device() {
        let (_backend, renderer, _vars) = renderer();
        let layout = renderer.uniform_layout();
        assert_eq!(layout.stride(), 512);
        assert_eq!(layout.buffer_size(MAX_FRAMES_IN_FLIGHT), 1024);
    }

    #[test]
    fn test_material_needs_known_effect() {
        let (_backend, mut renderer, _vars) = renderer();
        let err = renderer
            .create_material("m", "missing", None, TransparencyMode::Opaque)
            .unwrap_err();
        assert!(matches!(err, RenderError::UnknownResource { kind: "effect", .. }));
    }

    #[test]
    fn test_effect_pipelines_and_duplicates() {
        let (_backend, mut renderer, _vars) = renderer();
        let vs = shader(ShaderStage::Vertex);
        let fs = shader(ShaderStage::Fragment);
        renderer
            .create_effect("defaultmesh", &vs, &fs, VertexFormat::PncvF32, false)
            .unwrap();
        let effect = renderer.effect("defaultmesh").unwrap();
        assert_ne!(effect.opaque, effect.blended);

        assert!(
            renderer
                .create_effect("defaultmesh", &vs, &fs, VertexFormat::PncvF32, false)
                .is_err()
        );
        // Stages swapped
        assert!(
            renderer
                .create_effect("broken", &fs, &vs, VertexFormat::PncvF32, false)
                .is_err()
        );
        assert!(renderer.effect("broken").is_none());
    }

    #[test]
    fn test_textured_effect_requires_texture() {
        let (_backend, mut renderer, _vars) = renderer();
        renderer
            .create_effect(
                "texturedmesh",
                &shader(ShaderStage::Vertex),
                &shader(ShaderStage::Fragment),
                VertexFormat::PncvF32,
                true,
            )
            .unwrap();
        assert!(matches!(
            renderer.create_material("m", "texturedmesh", None, TransparencyMode::Opaque),
            Err(RenderError::Unsupported(_))
        ));
    }

    #[test]
    fn test_transparency_selects_blended_pipeline() {
        let (_backend, mut renderer, _vars) = renderer();
        renderer
            .create_effect(
                "defaultmesh",
                &shader(ShaderStage::Vertex),
                &shader(ShaderStage::Fragment),
                VertexFormat::PncvF32,
                false,
            )
            .unwrap();
        let solid = renderer
            .create_material("solid", "defaultmesh", None, TransparencyMode::Opaque)
            .unwrap();
        let glass = renderer
            .create_material("glass", "defaultmesh", None, TransparencyMode::Transparent)
            .unwrap();
        let effect = renderer.effect("defaultmesh").unwrap().clone();
        assert_eq!(renderer.material(solid).unwrap().pipeline, effect.opaque);
        assert_eq!(renderer.material(glass).unwrap().pipeline, effect.blended);
        assert_eq!(renderer.material_id("glass"), Some(glass));
    }

    #[test]
    fn test_add_object_validation() {
        let (_backend, mut renderer, _vars) = renderer();
        renderer
            .create_effect(
                "packed",
                &shader(ShaderStage::Vertex),
                &shader(ShaderStage::Fragment),
                VertexFormat::P32N8C8V16,
                false,
            )
            .unwrap();
        let material = renderer
            .create_material("packed", "packed", None, TransparencyMode::Opaque)
            .unwrap();
        let mesh = renderer.upload_mesh("triangle", &triangle()).unwrap();

        assert!(matches!(
            renderer.add_object(MeshId::from_index(9), material, Mat4::IDENTITY),
            Err(RenderError::UnknownResource { kind: "mesh", .. })
        ));
        // PncvF32 mesh with a P32N8C8V16 effect
        assert!(matches!(
            renderer.add_object(mesh, material, Mat4::IDENTITY),
            Err(RenderError::Unsupported(_))
        ));
        assert!(renderer.objects().is_empty());
    }

    #[test]
    fn test_object_capacity() {
        let (_backend, mut renderer, _vars) = renderer();
        renderer
            .create_effect(
                "defaultmesh",
                &shader(ShaderStage::Vertex),
                &shader(ShaderStage::Fragment),
                VertexFormat::PncvF32,
                false,
            )
            .unwrap();
        let material = renderer
            .create_material("m", "defaultmesh", None, TransparencyMode::Opaque)
            .unwrap();
        let mesh = renderer.upload_mesh("triangle", &triangle()).unwrap();
        for _ in 0..8 {
            renderer.add_object(mesh, material, Mat4::IDENTITY).unwrap();
        }
        assert!(matches!(
            renderer.add_object(mesh, material, Mat4::IDENTITY),
            Err(RenderError::TooManyObjects { count: 9, capacity: 8 })
        ));
    }

    #[test]
    fn test_draw_after_shutdown_fails() {
        let (backend, mut renderer, vars) = renderer();
        renderer.shutdown().unwrap();
        assert!(matches!(renderer.draw_frame(&vars), Err(RenderError::ShutDown)));
        assert_eq!(backend.live_resource_count(), 0);
        // Second shutdown is a no-op
        renderer.shutdown().unwrap();
    }

    #[test]
    fn test_shutdown_forgets_registries() {
        let (_backend, mut renderer, _vars) = renderer();
        renderer
            .create_effect(
                "defaultmesh",
                &shader(ShaderStage::Vertex),
                &shader(ShaderStage::Fragment),
                VertexFormat::PncvF32,
                false,
            )
            .unwrap();
        let mesh = renderer.upload_mesh("triangle", &triangle()).unwrap();
        let material = renderer
            .create_material("plain", "defaultmesh", None, TransparencyMode::Opaque)
            .unwrap();
        renderer.add_object(mesh, material, Mat4::IDENTITY).unwrap();

        renderer.shutdown().unwrap();

        assert!(renderer.effect("defaultmesh").is_none());
        assert!(renderer.mesh(mesh).is_none());
        assert!(renderer.mesh_id("triangle").is_none());
        assert!(renderer.material_id("plain").is_none());
        assert!(renderer.objects().is_empty());
    }

    #[test]
    fn test_zero_sized_surface_skips() {
        let (backend, mut renderer, vars) = renderer();
        backend.resize_surface(Extent2D::new(0, 0));
        assert_eq!(renderer.draw_frame(&vars).unwrap(), FrameOutcome::Skipped);
        assert_eq!(renderer.draw_frame(&vars).unwrap(), FrameOutcome::Skipped);

        backend.resize_surface(Extent2D::new(640, 480));
        assert!(matches!(
            renderer.draw_frame(&vars).unwrap(),
            FrameOutcome::Rendered(_)
        ));
        assert_eq!(renderer.swapchain_extent(), Extent2D::new(640, 480));
        assert!(backend.hazards().is_empty());
    }
}
