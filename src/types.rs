//! Vector and transform types shared across the scene, graph, and node layers.
//!
//! These mirror the teacher library's `Vertex`/`Affine3A` plumbing
//! (`affine_to_rows`, `affine_to_4x4rows`) but are named after what spec.md calls
//! them (`V3f`, `V3i`, `M3x4f`) so node and array code reads the same vocabulary
//! the rest of the crate uses.

use bytemuck_derive::{Pod, Zeroable};
use glam::Affine3A;

/// Three 32-bit floats: a position, direction, or normal.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq, Default)]
pub struct V3f {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl V3f {
    pub const ZERO: Self = Self { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn from_glam(v: glam::Vec3) -> Self {
        Self { x: v.x, y: v.y, z: v.z }
    }

    pub fn to_glam(self) -> glam::Vec3 {
        glam::Vec3::new(self.x, self.y, self.z)
    }
}

/// Three 32-bit ints: one mesh triangle's vertex indices.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq, Default)]
pub struct V3i {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl V3i {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// A 3x4 row-major affine transform: rotation in columns 0-2, translation in
/// column 3. Laid out flat as 12 floats the way the teacher library's
/// `affine_to_rows` produces for `wgpu::TlasInstance::new`.
///
/// Column-3 convention (locked down per SPEC_FULL.md Open Questions): when this
/// transform describes a ray, column 3 is the ray origin and the un-negated
/// rotated local `+Z` axis (i.e. `matrix3 * Vec3::Z`) is the ray direction.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, PartialEq)]
pub struct M3x4f {
    pub rows: [f32; 12],
}

impl M3x4f {
    pub fn from_affine(mat: &Affine3A) -> Self {
        let row_0 = mat.matrix3.row(0);
        let row_1 = mat.matrix3.row(1);
        let row_2 = mat.matrix3.row(2);
        let t = mat.translation;
        Self {
            rows: [
                row_0.x, row_0.y, row_0.z, t.x, row_1.x, row_1.y, row_1.z, t.y, row_2.x, row_2.y,
                row_2.z, t.z,
            ],
        }
    }

    pub fn to_affine(self) -> Affine3A {
        let r = self.rows;
        Affine3A::from_cols_array(&[
            r[0], r[4], r[8], r[1], r[5], r[9], r[2], r[6], r[10], r[3], r[7], r[11],
        ])
    }

    /// Ray origin, when this transform describes a ray.
    pub fn translation(&self) -> glam::Vec3 {
        glam::Vec3::new(self.rows[3], self.rows[7], self.rows[11])
    }

    /// Ray direction, when this transform describes a ray: the rotated local
    /// `+Z` axis, un-negated (see struct docs).
    pub fn direction(&self) -> glam::Vec3 {
        glam::Vec3::new(self.rows[2], self.rows[6], self.rows[10]).normalize_or_zero()
    }

    /// Flattens to the 4x4 padded layout the compute shaders bind as a uniform,
    /// matching the teacher's `affine_to_4x4rows`.
    pub fn to_padded_rows(self) -> [f32; 16] {
        let r = self.rows;
        [
            r[0], r[1], r[2], r[3], r[4], r[5], r[6], r[7], r[8], r[9], r[10], r[11], 0.0, 0.0,
            0.0, 1.0,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn round_trips_through_affine() {
        let affine = Affine3A::from_rotation_translation(
            Quat::from_rotation_y(0.37),
            Vec3::new(1.0, 2.0, 3.0),
        );
        let m = M3x4f::from_affine(&affine);
        let back = m.to_affine();
        assert!((back.translation - affine.translation).length() < 1e-5);
    }

    #[test]
    fn identity_ray_points_down_local_z() {
        let m = M3x4f::from_affine(&Affine3A::IDENTITY);
        assert!((m.direction() - Vec3::Z).length() < 1e-6);
        assert_eq!(m.translation(), Vec3::ZERO);
    }
}
