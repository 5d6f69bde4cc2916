//! GPU-visible per-frame data.
//!
//! These structures must match the shader-side layouts exactly. All use
//! `#[repr(C)]` and implement `Pod` so they can be written to mapped buffers
//! as bytes.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

/// Camera uniform data (set 0, binding 0, dynamic offset).
///
/// # Memory Layout
///
/// - Offset 0: view matrix (64 bytes)
/// - Offset 64: projection matrix (64 bytes)
/// - Offset 128: view-projection matrix (64 bytes)
/// - Offset 192: camera position (12 bytes) + padding (4 bytes)
/// - Total size: 208 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CameraUBO {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub camera_position: Vec3,
    pub _padding: f32,
}

impl CameraUBO {
    pub const SIZE: usize = size_of::<Self>();

    pub fn new(view: Mat4, projection: Mat4, camera_position: Vec3) -> Self {
        Self {
            view,
            projection,
            view_projection: projection * view,
            camera_position,
            _padding: 0.0,
        }
    }

    /// Right-handed perspective camera at `eye` looking at `target`.
    ///
    /// The projection flips Y so clip space matches a Y-down viewport.
    pub fn look_at(eye: Vec3, target: Vec3, aspect_ratio: f32) -> Self {
        let view = Mat4::look_at_rh(eye, target, Vec3::Y);
        let mut projection = Mat4::perspective_rh(70f32.to_radians(), aspect_ratio, 0.1, 200.0);
        projection.y_axis.y *= -1.0;
        Self::new(view, projection, eye)
    }
}

/// Scene uniform data (set 0, binding 1, dynamic offset).
///
/// Five `Vec4`s, 80 bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct SceneUBO {
    pub fog_color: Vec4,
    /// x = near, y = far, z and w unused.
    pub fog_distances: Vec4,
    pub ambient_color: Vec4,
    /// w = sun power.
    pub sunlight_direction: Vec4,
    pub sunlight_color: Vec4,
}

impl SceneUBO {
    pub const SIZE: usize = size_of::<Self>();

    /// Ambient color pulsing with `frame_number`.
    pub fn animated(frame_number: u64) -> Self {
        let phase = frame_number as f32 / 120.0;
        Self {
            ambient_color: Vec4::new(phase.sin(), 0.0, phase.cos(), 1.0),
            ..Self::default()
        }
    }
}

impl Default for SceneUBO {
    fn default() -> Self {
        Self {
            fog_color: Vec4::ZERO,
            fog_distances: Vec4::ZERO,
            ambient_color: Vec4::new(0.1, 0.1, 0.1, 1.0),
            sunlight_direction: Vec4::new(0.0, -1.0, 0.0, 1.0),
            sunlight_color: Vec4::ONE,
        }
    }
}

/// One entry of the per-object storage buffer (set 1, binding 0).
///
/// Draws pass their object index as `first_instance`, and shaders read
/// `objects[gl_BaseInstance]`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ObjectData {
    pub model: Mat4,
}

impl ObjectData {
    pub const SIZE: usize = size_of::<Self>();

    pub fn new(model: Mat4) -> Self {
        Self { model }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uniform::pad_uniform_size;

    #[test]
    fn test_camera_ubo_size() {
        // 3 Mat4 (3 * 64) + Vec3 (12) + padding (4) = 208 bytes
        assert_eq!(CameraUBO::SIZE, 208);
        assert_eq!(align_of::<CameraUBO>(), 16);
    }

    #[test]
    fn test_scene_ubo_size() {
        assert_eq!(SceneUBO::SIZE, 80);
        assert_eq!(pad_uniform_size(SceneUBO::SIZE as u64, 256), 256);
    }

    #[test]
    fn test_object_data_size() {
        assert_eq!(ObjectData::SIZE, 64);
    }

    #[test]
    fn test_camera_ubo_new() {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let projection = Mat4::perspective_rh(45.0_f32.to_radians(), 16.0 / 9.0, 0.1, 1000.0);
        let ubo = CameraUBO::new(view, projection, Vec3::new(0.0, 0.0, 5.0));

        assert_eq!(ubo.view_projection, projection * view);
        assert_eq!(ubo.camera_position, Vec3::new(0.0, 0.0, 5.0));
    }

    #[test]
    fn test_look_at_flips_y() {
        let ubo = CameraUBO::look_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, 1.0);
        assert!(ubo.projection.y_axis.y < 0.0);
    }

    #[test]
    fn test_pod_bytes() {
        let scene = SceneUBO::animated(60);
        assert_eq!(bytemuck::bytes_of(&scene).len(), SceneUBO::SIZE);
        let object = ObjectData::new(Mat4::IDENTITY);
        assert_eq!(bytemuck::bytes_of(&object).len(), ObjectData::SIZE);
    }
}
