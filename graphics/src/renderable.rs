//! Per-frame scene data handed to stage recorders.
//!
//! A [`FrameScene`] is built by the application each frame and shared
//! read-only with every stage task.

use bitflags::bitflags;
use inflight_core::cascade::{CascadeInfo, MAX_CASCADES};
use inflight_core::math::{Mat4, Vec3, transform_point};

use crate::handle::{BufferHandle, DescriptorSetHandle};
use crate::types::IndexFormat;

bitflags! {
    /// Which stages a renderable takes part in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VisibilityFlags: u32 {
        const VISIBLE = 1 << 0;
        const SHADOW_CASTER = 1 << 1;
        const CASCADE_0 = 1 << 2;
        const CASCADE_1 = 1 << 3;
        const CASCADE_2 = 1 << 4;
        const CASCADE_3 = 1 << 5;
        const ALL_CASCADES = Self::CASCADE_0.bits()
            | Self::CASCADE_1.bits()
            | Self::CASCADE_2.bits()
            | Self::CASCADE_3.bits();
    }
}

impl VisibilityFlags {
    /// Flag of shadow cascade `index`.
    pub fn cascade(index: usize) -> Self {
        assert!(index < MAX_CASCADES, "cascade index {index} out of range");
        Self::from_bits_retain(Self::CASCADE_0.bits() << index)
    }
}

impl Default for VisibilityFlags {
    fn default() -> Self {
        Self::VISIBLE | Self::SHADOW_CASTER
    }
}

/// Object-space bounding sphere.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub center: Vec3,
    pub radius: f32,
}

impl Bounds {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// World-space sphere under `transform`.
    ///
    /// The radius is scaled by the largest axis scale so the sphere stays
    /// conservative under non-uniform scaling.
    pub fn transformed(&self, transform: &Mat4) -> Self {
        let scale = (0..3)
            .map(|axis| transform.fixed_view::<3, 1>(0, axis).norm())
            .fold(0.0f32, f32::max);
        Self {
            center: transform_point(transform, &self.center),
            radius: self.radius * scale,
        }
    }
}

/// One drawable object.
#[derive(Debug, Clone, PartialEq)]
pub struct Renderable {
    pub transform: Mat4,
    pub vertex_buffer: BufferHandle,
    pub index_buffer: Option<(BufferHandle, IndexFormat)>,
    /// Index count when indexed, vertex count otherwise.
    pub element_count: u32,
    pub material: Option<DescriptorSetHandle>,
    pub visibility: VisibilityFlags,
    pub bounds: Bounds,
}

impl Renderable {
    pub fn new(vertex_buffer: BufferHandle, element_count: u32) -> Self {
        Self {
            transform: Mat4::identity(),
            vertex_buffer,
            index_buffer: None,
            element_count,
            material: None,
            visibility: VisibilityFlags::default(),
            bounds: Bounds::new(Vec3::zeros(), 1.0),
        }
    }

    pub fn with_transform(mut self, transform: Mat4) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_index_buffer(mut self, buffer: BufferHandle, format: IndexFormat) -> Self {
        self.index_buffer = Some((buffer, format));
        self
    }

    pub fn with_material(mut self, material: DescriptorSetHandle) -> Self {
        self.material = Some(material);
        self
    }

    pub fn with_visibility(mut self, visibility: VisibilityFlags) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn world_bounds(&self) -> Bounds {
        self.bounds.transformed(&self.transform)
    }
}

/// Read-only snapshot of everything the stages of one frame draw.
#[derive(Debug, Clone, Default)]
pub struct FrameScene {
    pub renderables: Vec<Renderable>,
    pub cascades: Vec<CascadeInfo>,
    /// Camera view-projection used by the main stages.
    pub view_projection: Mat4,
}

static_assertions::assert_impl_all!(FrameScene: Send, Sync);

impl FrameScene {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_renderable(mut self, renderable: Renderable) -> Self {
        self.renderables.push(renderable);
        self
    }

    pub fn with_cascades(mut self, cascades: Vec<CascadeInfo>) -> Self {
        self.cascades = cascades;
        self
    }

    pub fn with_view_projection(mut self, view_projection: Mat4) -> Self {
        self.view_projection = view_projection;
        self
    }

    /// Recompute the cascade flags of every shadow caster.
    ///
    /// A caster joins cascade `i` when its world-space bounding sphere
    /// touches that cascade's frustum.
    pub fn assign_cascade_visibility(&mut self) {
        inflight_core::profile_function!();
        for renderable in &mut self.renderables {
            renderable.visibility.remove(VisibilityFlags::ALL_CASCADES);
            if !renderable.visibility.contains(VisibilityFlags::SHADOW_CASTER) {
                continue;
            }
            let bounds = renderable.world_bounds();
            for (index, cascade) in self.cascades.iter().enumerate().take(MAX_CASCADES) {
                if cascade.frustum.contains_sphere(&bounds.center, bounds.radius) {
                    renderable.visibility |= VisibilityFlags::cascade(index);
                }
            }
        }
    }

    /// Renderables whose flags contain all of `mask`.
    pub fn filter(&self, mask: VisibilityFlags) -> impl Iterator<Item = &Renderable> {
        self.renderables
            .iter()
            .filter(move |renderable| renderable.visibility.contains(mask))
    }
}
