//! Renderable objects and draw recording.
//!
//! Objects are sorted so that draws sharing a pipeline and mesh end up next to
//! each other, then recorded with redundant binds skipped. The sorted position
//! of an object is also its index into the frame's object buffer, passed to
//! the shader as `first_instance`.

use std::cmp::Ordering;

use glam::Mat4;

use renderer_rhi::DescriptorSetHandle;
use renderer_rhi::command::CommandRecorder;

use crate::resources::{GpuMaterial, GpuMesh, MaterialId, MeshId};
use crate::ubo::ObjectData;

/// Set index of the global (camera + scene) descriptor set.
pub const GLOBAL_SET: u32 = 0;
/// Set index of the per-frame object buffer.
pub const OBJECT_SET: u32 = 1;
/// Set index of a material's texture set.
pub const TEXTURE_SET: u32 = 2;

/// A mesh drawn with a material at a transform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderObject {
    pub mesh: MeshId,
    pub material: MaterialId,
    pub transform: Mat4,
}

impl RenderObject {
    pub fn new(mesh: MeshId, material: MaterialId, transform: Mat4) -> Self {
        Self {
            mesh,
            material,
            transform,
        }
    }
}

/// Stable sort by pipeline, then mesh.
///
/// Objects whose material is unknown sort last.
pub fn sort_objects(objects: &mut [RenderObject], materials: &[GpuMaterial]) {
    let key = |object: &RenderObject| {
        materials
            .get(object.material.index())
            .map(|m| m.pipeline)
    };
    objects.sort_by(|a, b| match (key(a), key(b)) {
        (Some(pa), Some(pb)) => pa.cmp(&pb).then(a.mesh.cmp(&b.mesh)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.mesh.cmp(&b.mesh),
    });
}

/// Per-object shader data in draw order.
pub fn object_data(objects: &[RenderObject]) -> Vec<ObjectData> {
    objects.iter().map(|o| ObjectData::new(o.transform)).collect()
}

/// Descriptor sets shared by every draw of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawBindings {
    pub global_set: DescriptorSetHandle,
    /// Camera then scene dynamic offsets for this frame.
    pub global_offsets: [u32; 2],
    pub object_set: DescriptorSetHandle,
}

/// Counters for one call to [`record_draws`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawStats {
    pub objects: u32,
    pub draws: u32,
    pub pipeline_binds: u32,
    pub texture_binds: u32,
    pub mesh_binds: u32,
}

/// Records one draw per object into an open rendering scope.
///
/// `objects` must already be in the order their [`ObjectData`] was written.
/// Objects referencing unknown meshes or materials are skipped.
pub fn record_draws(
    cmd: &mut CommandRecorder,
    objects: &[RenderObject],
    meshes: &[GpuMesh],
    materials: &[GpuMaterial],
    bindings: &DrawBindings,
) -> DrawStats {
    let mut stats = DrawStats::default();
    let mut last_pipeline = None;
    let mut last_texture = None;
    let mut last_mesh = None;

    for (index, object) in objects.iter().enumerate() {
        let (Some(mesh), Some(material)) = (
            meshes.get(object.mesh.index()),
            materials.get(object.material.index()),
        ) else {
            continue;
        };
        stats.objects += 1;

        if last_pipeline != Some(material.pipeline) {
            cmd.bind_pipeline(material.pipeline);
            cmd.bind_descriptor_sets(
                material.layout,
                GLOBAL_SET,
                &[bindings.global_set, bindings.object_set],
                &bindings.global_offsets,
            );
            last_pipeline = Some(material.pipeline);
            // A new layout invalidates set 2
            last_texture = None;
            stats.pipeline_binds += 1;
        }

        if let Some(texture_set) = material.texture_set
            && last_texture != Some(texture_set)
        {
            cmd.bind_descriptor_sets(material.layout, TEXTURE_SET, &[texture_set], &[]);
            last_texture = Some(texture_set);
            stats.texture_binds += 1;
        }

        if last_mesh != Some(object.mesh) {
            cmd.bind_vertex_buffer(mesh.vertex_buffer.handle(), 0);
            if let Some(index_buffer) = &mesh.index_buffer {
                cmd.bind_index_buffer(index_buffer.handle(), 0, mesh.index_type);
            }
            last_mesh = Some(object.mesh);
            stats.mesh_binds += 1;
        }

        let instance = index as u32;
        if mesh.index_buffer.is_some() {
            cmd.draw_indexed(mesh.index_count, 1, 0, 0, instance);
        } else {
            cmd.draw(mesh.vertex_count, 1, 0, instance);
        }
        stats.draws += 1;
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderer_assets::{MeshBounds, TransparencyMode, VertexFormat};
    use renderer_rhi::buffer::{Buffer, BufferUsage};
    use renderer_rhi::command::{Command, IndexType, RenderingInfo};
    use renderer_rhi::headless::HeadlessBackend;
    use renderer_rhi::image::Extent2D;
    use renderer_rhi::{CommandPoolHandle, PipelineHandle, PipelineLayoutHandle};

    fn material(pipeline: u64, texture_set: Option<DescriptorSetHandle>) -> GpuMaterial {
        GpuMaterial {
            name: format!("material{}", pipeline),
            pipeline: PipelineHandle::from_raw(pipeline),
            layout: PipelineLayoutHandle::from_raw(pipeline),
            vertex_format: VertexFormat::PncvF32,
            texture_set,
            transparency: TransparencyMode::Opaque,
        }
    }

    fn mesh(backend: &HeadlessBackend, indexed: bool) -> GpuMesh {
        let vertex_buffer = Buffer::new(backend, BufferUsage::Vertex, 132, "vertices").unwrap();
        let index_buffer =
            indexed.then(|| Buffer::new(backend, BufferUsage::Index, 12, "indices").unwrap());
        GpuMesh {
            vertex_buffer,
            index_buffer,
            index_type: IndexType::U16,
            vertex_count: 3,
            index_count: 6,
            format: VertexFormat::PncvF32,
            bounds: MeshBounds::default(),
        }
    }

    fn bindings() -> DrawBindings {
        DrawBindings {
            global_set: DescriptorSetHandle::from_raw(100),
            global_offsets: [512, 768],
            object_set: DescriptorSetHandle::from_raw(101),
        }
    }

    fn record(
        objects: &[RenderObject],
        meshes: &[GpuMesh],
        materials: &[GpuMaterial],
    ) -> (DrawStats, Vec<Command>) {
        let mut cmd = CommandRecorder::begin(CommandPoolHandle::from_raw(1));
        cmd.begin_rendering(RenderingInfo {
            image_index: 0,
            depth: None,
            clear_color: [0.0; 4],
            clear_depth: 1.0,
            extent: Extent2D::new(64, 64),
        });
        let stats = record_draws(&mut cmd, objects, meshes, materials, &bindings());
        cmd.end_rendering();
        let list = cmd.end().unwrap();
        (stats, list.commands().to_vec())
    }

    #[test]
    fn test_sort_groups_by_pipeline_then_mesh() {
        let materials = vec![material(2, None), material(1, None)];
        let m = |mesh: usize, material: usize, x: f32| {
            RenderObject::new(
                MeshId::from_index(mesh),
                MaterialId::from_index(material),
                Mat4::from_translation(glam::Vec3::new(x, 0.0, 0.0)),
            )
        };
        let mut objects = vec![
            m(1, 0, 0.0),
            m(0, 1, 1.0),
            m(0, 0, 2.0),
            m(1, 1, 3.0),
            m(0, 0, 4.0),
        ];
        sort_objects(&mut objects, &materials);

        let order: Vec<(usize, usize)> = objects
            .iter()
            .map(|o| (o.material.index(), o.mesh.index()))
            .collect();
        assert_eq!(order, vec![(1, 0), (1, 1), (0, 0), (0, 0), (0, 1)]);
        // Stable: equal keys keep their insertion order
        assert_eq!(objects[2].transform.w_axis.x, 2.0);
        assert_eq!(objects[3].transform.w_axis.x, 4.0);
    }

    #[test]
    fn test_object_data_follows_order() {
        let objects = [
            RenderObject::new(MeshId::from_index(0), MaterialId::from_index(0), Mat4::IDENTITY),
            RenderObject::new(
                MeshId::from_index(0),
                MaterialId::from_index(0),
                Mat4::from_scale(glam::Vec3::splat(2.0)),
            ),
        ];
        let data = object_data(&objects);
        assert_eq!(data.len(), 2);
        assert_eq!(data[1].model, Mat4::from_scale(glam::Vec3::splat(2.0)));
    }

    #[test]
    fn test_redundant_binds_are_skipped() {
        let backend = HeadlessBackend::new();
        let meshes = vec![mesh(&backend, true), mesh(&backend, false)];
        let texture = DescriptorSetHandle::from_raw(50);
        let materials = vec![material(1, Some(texture)), material(2, None)];

        let obj = |mesh, material| {
            RenderObject::new(
                MeshId::from_index(mesh),
                MaterialId::from_index(material),
                Mat4::IDENTITY,
            )
        };
        let objects = [obj(0, 0), obj(0, 0), obj(1, 0), obj(1, 1)];
        let (stats, commands) = record(&objects, &meshes, &materials);

        assert_eq!(
            stats,
            DrawStats {
                objects: 4,
                draws: 4,
                pipeline_binds: 2,
                texture_binds: 1,
                mesh_binds: 2,
            }
        );

        let first_instances: Vec<u32> = commands
            .iter()
            .filter_map(|c| match c {
                Command::DrawIndexed { first_instance, .. } => Some(*first_instance),
                Command::Draw { first_instance, .. } => Some(*first_instance),
                _ => None,
            })
            .collect();
        assert_eq!(first_instances, vec![0, 1, 2, 3]);

        assert!(commands.iter().any(|c| matches!(
            c,
            Command::BindDescriptorSets { first_set: 0, dynamic_offsets, sets, .. }
                if dynamic_offsets == &vec![512, 768] && sets.len() == 2
        )));

        for m in meshes {
            m.vertex_buffer.destroy(&backend);
            if let Some(index_buffer) = m.index_buffer {
                index_buffer.destroy(&backend);
            }
        }
        assert_eq!(backend.live_resource_count(), 0);
    }

    #[test]
    fn test_unknown_references_are_skipped() {
        let objects = [RenderObject::new(
            MeshId::from_index(7),
            MaterialId::from_index(0),
            Mat4::IDENTITY,
        )];
        let (stats, commands) = record(&objects, &[], &[material(1, None)]);
        assert_eq!(stats, DrawStats::default());
        assert!(!commands.iter().any(Command::is_draw));
    }
}
