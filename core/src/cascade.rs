//! Cascaded shadow map fitting.
//!
//! Each cascade covers one distance band of the camera frustum. The band's
//! eight corner points are moved into a light-facing space, boxed, and the box
//! becomes an orthographic projection. The resulting [`CascadeInfo`] is
//! computed once per frame per cascade and reused for every renderable tested
//! against it.
//!
//! ```text
//!   camera ──┬── split 0 ──┬──── split 1 ────┬──────── split 2 ────────┬── ...
//!            │  cascade 0  │    cascade 1    │        cascade 2        │
//! ```
//!
//! Split distances come from a fixed geometric progression of factors applied
//! to the configured view distance, see [`cascade_splits`].

use crate::math::{Mat4, Vec3, Vec4, WORLD_UP, inverse_sqrt, look_at_rh, orthographic_rh};

/// Maximum number of cascades a renderer can request.
pub const MAX_CASCADES: usize = 4;

/// Default split factors, applied to the view distance.
pub const DEFAULT_CASCADE_FACTORS: [f32; MAX_CASCADES] = [1.0 / 64.0, 1.0 / 16.0, 1.0 / 4.0, 1.0];

/// Camera parameters needed to slice the view frustum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeCamera {
    /// World-space camera position.
    pub position: Vec3,
    /// Normalized world-space directions through the four screen corners,
    /// ordered (0,0), (0,1), (1,0), (1,1) in screen coordinates.
    pub corner_rays: [Vec3; 4],
    /// Camera near plane distance.
    pub near: f32,
}

impl CascadeCamera {
    /// Build a camera from its position and the inverse of its view-projection matrix.
    pub fn from_inverse_view_projection(
        position: Vec3,
        inverse_view_projection: &Mat4,
        near: f32,
    ) -> Self {
        let screen = [(0.0, 0.0), (0.0, 1.0), (1.0, 0.0), (1.0, 1.0)];
        let corner_rays = screen.map(|(u, v): (f32, f32)| {
            // Screen (0,0) is the top-left corner; NDC y points down in Vulkan.
            let ndc = Vec4::new(u * 2.0 - 1.0, v * 2.0 - 1.0, 1.0, 1.0);
            let world = inverse_view_projection * ndc;
            let world = Vec3::new(world.x, world.y, world.z) / world.w;
            (world - position).normalize()
        });
        Self {
            position,
            corner_rays,
            near,
        }
    }

    /// Build a symmetric perspective camera looking along `forward`.
    pub fn perspective(
        position: Vec3,
        forward: Vec3,
        up: Vec3,
        yfov: f32,
        aspect: f32,
        near: f32,
    ) -> Self {
        let forward = forward.normalize();
        let right = forward.cross(&up).normalize();
        let up = right.cross(&forward);
        let half_h = (yfov * 0.5).tan();
        let half_w = half_h * aspect;

        let screen = [(0.0, 0.0), (0.0, 1.0), (1.0, 0.0), (1.0, 1.0)];
        let corner_rays = screen.map(|(u, v): (f32, f32)| {
            let x = (u * 2.0 - 1.0) * half_w;
            let y = (1.0 - v * 2.0) * half_h;
            (forward + right * x + up * y).normalize()
        });
        Self {
            position,
            corner_rays,
            near,
        }
    }

    /// Direction through the center of the screen.
    pub fn center_ray(&self) -> Vec3 {
        let sum = self.corner_rays.iter().fold(Vec3::zeros(), |acc, r| acc + r);
        sum.normalize()
    }
}

/// A plane `normal · p + distance = 0` with a unit-length normal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    fn from_row(row: Vec4) -> Self {
        let normal = Vec3::new(row.x, row.y, row.z);
        let scale = inverse_sqrt(normal.norm_squared());
        Self {
            normal: normal * scale,
            distance: row.w * scale,
        }
    }

    /// Signed distance from the plane; positive on the inner side.
    #[inline]
    pub fn signed_distance(&self, point: &Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }
}

/// Six inward-facing planes extracted from a view-projection matrix.
///
/// Order: left, right, bottom, top, near, far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extract the planes from the rows of `m` and normalize them.
    pub fn from_matrix(m: &Mat4) -> Self {
        let row = |i: usize| {
            let r = m.row(i);
            Vec4::new(r[0], r[1], r[2], r[3])
        };
        let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));
        Self {
            planes: [
                Plane::from_row(r3 + r0),
                Plane::from_row(r3 - r0),
                Plane::from_row(r3 + r1),
                Plane::from_row(r3 - r1),
                Plane::from_row(r3 + r2),
                Plane::from_row(r3 - r2),
            ],
        }
    }

    /// Returns true if any part of the sphere lies inside the frustum.
    pub fn contains_sphere(&self, center: &Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.signed_distance(center) >= -radius)
    }

    /// Returns true if the axis-aligned box intersects the frustum.
    pub fn intersects_aabb(&self, min: &Vec3, max: &Vec3) -> bool {
        self.planes.iter().all(|plane| {
            // Corner furthest along the plane normal.
            let positive = Vec3::new(
                if plane.normal.x >= 0.0 { max.x } else { min.x },
                if plane.normal.y >= 0.0 { max.y } else { min.y },
                if plane.normal.z >= 0.0 { max.z } else { min.z },
            );
            plane.signed_distance(&positive) >= 0.0
        })
    }
}

/// Per-frame data of one shadow cascade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CascadeInfo {
    /// Light-space projection × view.
    pub light_matrix: Mat4,
    /// Extent of the fitted box along the light direction.
    pub depth_range: f32,
    /// Planes of `light_matrix`.
    pub frustum: Frustum,
    /// Far distance of this cascade's band.
    pub split_distance: f32,
    /// Normalized light direction the cascade was fitted for.
    pub light_direction: Vec3,
}

/// Compute split distances for `factors` applied to `view_distance`.
pub fn cascade_splits(view_distance: f32, factors: &[f32]) -> Vec<f32> {
    factors.iter().map(|factor| view_distance * factor).collect()
}

/// Fit one cascade covering `[near_split, far_split]` of the camera frustum.
pub fn compute_cascade(
    light_direction: Vec3,
    near_split: f32,
    far_split: f32,
    camera: &CascadeCamera,
) -> CascadeInfo {
    debug_assert!(far_split > near_split, "cascade band must not be empty");
    let light_direction = light_direction.normalize();

    let mut corners = [Vec3::zeros(); 8];
    for (i, ray) in camera.corner_rays.iter().enumerate() {
        corners[i] = camera.position + ray * near_split;
        corners[i + 4] = camera.position + ray * far_split;
    }
    let center = camera.position + camera.center_ray() * ((near_split + far_split) * 0.5);

    // A light parallel to the up axis makes the look-at basis degenerate.
    let up = if light_direction.cross(&WORLD_UP).norm_squared() < 1e-6 {
        Vec3::new(0.0, 0.0, 1.0)
    } else {
        WORLD_UP
    };
    let light_view = look_at_rh(&center, &(center + light_direction), &up);

    let mut min = Vec3::repeat(f32::MAX);
    let mut max = Vec3::repeat(f32::MIN);
    for corner in &corners {
        let p = light_view * Vec4::new(corner.x, corner.y, corner.z, 1.0);
        min = min.inf(&Vec3::new(p.x, p.y, p.z));
        max = max.sup(&Vec3::new(p.x, p.y, p.z));
    }

    // Light space looks down -Z, so the nearest corner has the largest z.
    let projection = orthographic_rh(min.x, max.x, min.y, max.y, -max.z, -min.z);
    let light_matrix = projection * light_view;

    CascadeInfo {
        light_matrix,
        depth_range: max.z - min.z,
        frustum: Frustum::from_matrix(&light_matrix),
        split_distance: far_split,
        light_direction,
    }
}

/// Fit every cascade for one frame.
///
/// Cascade 0 starts at the camera near plane, cascade `i` at split `i - 1`.
/// A split at or before its band start (a short view distance against the
/// near plane) moves the start to half the split, so every cascade keeps a
/// non-empty band and the cascade count always matches `factors`.
pub fn compute_cascades(
    light_direction: Vec3,
    view_distance: f32,
    factors: &[f32],
    camera: &CascadeCamera,
) -> Vec<CascadeInfo> {
    let splits = cascade_splits(view_distance, factors);
    let mut start = camera.near;
    splits
        .iter()
        .map(|&end| {
            let near = if start < end { start } else { end * 0.5 };
            let cascade = compute_cascade(light_direction, near, end, camera);
            start = end;
            cascade
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_camera() -> CascadeCamera {
        CascadeCamera::perspective(
            Vec3::zeros(),
            Vec3::new(0.0, 0.0, -1.0),
            WORLD_UP,
            std::f32::consts::FRAC_PI_3,
            16.0 / 9.0,
            0.1,
        )
    }

    fn tilted_light() -> Vec3 {
        Vec3::new(-0.3, -1.0, -0.2)
    }

    #[test]
    fn test_split_distances() {
        let splits = cascade_splits(1000.0, &DEFAULT_CASCADE_FACTORS);
        assert_eq!(splits[0], 15.625);
        assert_eq!(splits[1], 62.5);
        assert_eq!(splits[2], 250.0);
        assert_eq!(splits[3], 1000.0);
    }

    #[test]
    fn test_cascades_cover_view_distance() {
        let cascades = compute_cascades(tilted_light(), 1000.0, &DEFAULT_CASCADE_FACTORS, &test_camera());
        assert_eq!(cascades.len(), 4);
        assert_eq!(cascades[0].split_distance, 15.625);
        assert_eq!(cascades[3].split_distance, 1000.0);
    }

    #[test]
    fn test_short_view_distance_inside_near_plane() {
        // 5 / 64 lands before the 0.1 near plane.
        let camera = test_camera();
        let cascades = compute_cascades(tilted_light(), 5.0, &DEFAULT_CASCADE_FACTORS, &camera);
        assert_eq!(cascades.len(), 4);
        assert_eq!(cascades[0].split_distance, 5.0 / 64.0);
        assert_eq!(cascades[3].split_distance, 5.0);
        for cascade in &cascades {
            assert!(cascade.depth_range > 0.0);
            assert!(cascade.light_matrix.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_depth_ranges_positive_and_non_decreasing() {
        let cascades = compute_cascades(tilted_light(), 1000.0, &DEFAULT_CASCADE_FACTORS, &test_camera());
        let mut previous = 0.0;
        for cascade in &cascades {
            assert!(cascade.depth_range > 0.0);
            assert!(cascade.depth_range >= previous);
            previous = cascade.depth_range;
        }
    }

    #[test]
    fn test_deterministic() {
        let camera = test_camera();
        let a = compute_cascade(tilted_light(), 0.1, 15.625, &camera);
        let b = compute_cascade(tilted_light(), 0.1, 15.625, &camera);
        assert_eq!(a.light_matrix.as_slice(), b.light_matrix.as_slice());
        for (pa, pb) in a.frustum.planes.iter().zip(b.frustum.planes.iter()) {
            assert_eq!(pa.normal.as_slice(), pb.normal.as_slice());
            assert_eq!(pa.distance.to_bits(), pb.distance.to_bits());
        }
    }

    #[test]
    fn test_planes_are_normalized() {
        let cascade = compute_cascade(tilted_light(), 15.625, 62.5, &test_camera());
        for plane in &cascade.frustum.planes {
            assert!((plane.normal.norm() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_slice_corners_inside_cascade() {
        let camera = test_camera();
        let cascade = compute_cascade(tilted_light(), 15.625, 62.5, &camera);
        for ray in &camera.corner_rays {
            for distance in [15.625, 62.5] {
                let corner = camera.position + ray * distance;
                assert!(cascade.frustum.contains_sphere(&corner, 0.01));
            }
        }
    }

    #[test]
    fn test_far_point_outside_cascade() {
        let camera = test_camera();
        let cascade = compute_cascade(tilted_light(), 0.1, 15.625, &camera);
        let far_away = Vec3::new(0.0, 0.0, -900.0);
        assert!(!cascade.frustum.contains_sphere(&far_away, 1.0));
        assert!(!cascade.frustum.intersects_aabb(
            &(far_away - Vec3::repeat(1.0)),
            &(far_away + Vec3::repeat(1.0))
        ));
    }

    #[test]
    fn test_vertical_light_uses_fallback_up() {
        let cascade = compute_cascade(Vec3::new(0.0, -1.0, 0.0), 0.1, 15.625, &test_camera());
        assert!(cascade.depth_range > 0.0);
        assert!(cascade.light_matrix.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_inverse_view_projection_rays_match_perspective() {
        let yfov = std::f32::consts::FRAC_PI_3;
        let aspect = 16.0 / 9.0;
        let view = look_at_rh(&Vec3::zeros(), &Vec3::new(0.0, 0.0, -1.0), &WORLD_UP);
        let mut proj = crate::math::perspective_rh(yfov, aspect, 0.1, 1000.0);
        // Flip Y to match Vulkan's downward NDC y.
        proj[(1, 1)] *= -1.0;
        let inverse = (proj * view).try_inverse().unwrap();

        let from_matrix = CascadeCamera::from_inverse_view_projection(Vec3::zeros(), &inverse, 0.1);
        let expected = CascadeCamera::perspective(
            Vec3::zeros(),
            Vec3::new(0.0, 0.0, -1.0),
            WORLD_UP,
            yfov,
            aspect,
            0.1,
        );
        for (a, b) in from_matrix.corner_rays.iter().zip(expected.corner_rays.iter()) {
            assert!((a - b).norm() < 1e-3, "{a:?} vs {b:?}");
        }
    }
}
