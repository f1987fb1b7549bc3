//! Procedural scene used by the demo drivers.

use std::f32::consts::{FRAC_PI_3, TAU};

use inflight_core::cascade::{CascadeCamera, CascadeInfo};
use inflight_core::math::{Mat4, Vec3, WORLD_UP, look_at_rh, perspective_rh};
use inflight_graphics::types::{VertexFormat, VertexLayout};
use inflight_graphics::{
    Bounds, BufferDescriptor, BufferHandle, BufferUsage, FrameScene, GpuBackend, GraphicsError,
    Renderable, VisibilityFlags,
};

/// Vertices of the unit cube mesh: position and normal, 36 of them.
pub const CUBE_VERTEX_COUNT: u32 = 36;

const FAR_PLANE: f32 = 2000.0;

/// Layout matching [`cube_vertices`].
pub fn cube_vertex_layout() -> VertexLayout {
    VertexLayout::interleaved(&[VertexFormat::Float32x3, VertexFormat::Float32x3])
}

/// Interleaved position/normal triangle list of a cube spanning `[-0.5, 0.5]`.
pub fn cube_vertices() -> Vec<f32> {
    let mut vertices = Vec::with_capacity(CUBE_VERTEX_COUNT as usize * 6);
    for axis in 0..3 {
        for sign in [-1.0f32, 1.0] {
            let mut normal = [0.0f32; 3];
            normal[axis] = sign;
            let u = (axis + 1) % 3;
            let v = (axis + 2) % 3;
            let corner = |a: f32, b: f32| {
                let mut p = [0.0f32; 3];
                p[axis] = 0.5 * sign;
                p[u] = a * 0.5;
                p[v] = b * 0.5 * sign;
                p
            };
            let quad = [corner(-1.0, -1.0), corner(1.0, -1.0), corner(1.0, 1.0), corner(-1.0, 1.0)];
            for index in [0, 1, 2, 0, 2, 3] {
                vertices.extend_from_slice(&quad[index]);
                vertices.extend_from_slice(&normal);
            }
        }
    }
    vertices
}

/// Upload the cube mesh into a host-visible vertex buffer.
pub fn upload_cube(backend: &dyn GpuBackend) -> Result<BufferHandle, GraphicsError> {
    let vertices = cube_vertices();
    let bytes: &[u8] = bytemuck::cast_slice(&vertices);
    let buffer = backend.create_buffer(
        &BufferDescriptor::new(bytes.len() as u64, BufferUsage::VERTEX | BufferUsage::MAP_WRITE)
            .with_label("cube vertices"),
    )?;
    backend.write_buffer(buffer, 0, bytes)?;
    Ok(buffer)
}

/// Camera circling the origin, one revolution every 600 frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrbitCamera {
    pub radius: f32,
    pub height: f32,
    pub aspect: f32,
    pub near: f32,
}

impl OrbitCamera {
    pub fn new(aspect: f32) -> Self {
        Self {
            radius: 30.0,
            height: 12.0,
            aspect,
            near: 0.1,
        }
    }

    pub fn position(&self, frame: u64) -> Vec3 {
        let angle = (frame % 600) as f32 / 600.0 * TAU;
        Vec3::new(angle.cos() * self.radius, self.height, angle.sin() * self.radius)
    }

    pub fn view_projection(&self, frame: u64) -> Mat4 {
        let eye = self.position(frame);
        perspective_rh(FRAC_PI_3, self.aspect, self.near, FAR_PLANE)
            * look_at_rh(&eye, &Vec3::zeros(), &WORLD_UP)
    }

    pub fn cascade_camera(&self, frame: u64) -> CascadeCamera {
        let eye = self.position(frame);
        CascadeCamera::perspective(eye, -eye, WORLD_UP, FRAC_PI_3, self.aspect, self.near)
    }
}

/// Build the scene snapshot of one frame.
///
/// Cubes sit on a `grid` x `grid` field with spacing 3; cascade membership
/// is assigned from `cascades`.
pub fn build_scene(
    mesh: BufferHandle,
    grid: u32,
    view_projection: Mat4,
    cascades: Vec<CascadeInfo>,
) -> FrameScene {
    let half = grid as f32 * 1.5;
    let mut scene = FrameScene::new()
        .with_view_projection(view_projection)
        .with_cascades(cascades);
    for x in 0..grid {
        for z in 0..grid {
            let position = Vec3::new(x as f32 * 3.0 - half, 0.5, z as f32 * 3.0 - half);
            scene = scene.with_renderable(
                Renderable::new(mesh, CUBE_VERTEX_COUNT)
                    .with_transform(Mat4::new_translation(&position))
                    .with_bounds(Bounds::new(Vec3::zeros(), 0.87))
                    .with_visibility(VisibilityFlags::VISIBLE | VisibilityFlags::SHADOW_CASTER),
            );
        }
    }
    scene.assign_cascade_visibility();
    scene
}
