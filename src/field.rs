//! Per-point field tags (spec.md §3 "Field").
//!
//! The source leans on templates plus enumerated tags to map a field to a
//! pointee type (spec.md §9). This crate exposes the runtime half of that split
//! as a plain enum with a fixed element size; the compile-time half is the
//! typed accessors on [`crate::array::Array`] used by nodes that statically
//! know which field they're touching.

use serde::{Deserialize, Serialize};

/// An enumerated per-point attribute tag.
///
/// `RayTransform` is not one of spec.md's per-point output fields — it is
/// this crate's wiring tag for the M3x4f ray buffer a rays-producing node
/// hands to the ray-trace node, reusing the same field-keyed plumbing
/// ([`crate::node::NodeOutputs`]) that carries every other inter-node buffer
/// instead of a parallel one-off channel. It never appears in a yield node's
/// requested field list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Field {
    Xyz,
    Distance,
    Azimuth,
    Elevation,
    Intensity,
    IsHit,
    RayIdx,
    Normal,
    RingId,
    TimeStamp,
    RayTransform,
}

impl Field {
    /// Byte size of one element of this field, matching spec.md §3's "fixed
    /// element size" invariant. `IsHit` is 4 bytes, not 1: WGSL storage
    /// buffers have no addressable byte/bool element, so this crate's
    /// `gpuFilter`/ray-trace kernels carry it as a `u32` the way every other
    /// WGSL storage array element is at least word-sized.
    pub fn element_size(self) -> usize {
        match self {
            Field::Xyz => 12,
            Field::Distance => 4,
            Field::Azimuth => 4,
            Field::Elevation => 4,
            Field::Intensity => 4,
            Field::IsHit => 4,
            Field::RayIdx => 4,
            Field::Normal => 12,
            Field::RingId => 4,
            Field::TimeStamp => 4,
            Field::RayTransform => 48,
        }
    }

    /// Per-point output fields a client can request from a yield node.
    /// Excludes [`Field::RayTransform`].
    pub const POINT_FIELDS: [Field; 10] = [
        Field::Xyz,
        Field::Distance,
        Field::Azimuth,
        Field::Elevation,
        Field::Intensity,
        Field::IsHit,
        Field::RayIdx,
        Field::Normal,
        Field::RingId,
        Field::TimeStamp,
    ];

    pub const ALL: [Field; 11] = [
        Field::Xyz,
        Field::Distance,
        Field::Azimuth,
        Field::Elevation,
        Field::Intensity,
        Field::IsHit,
        Field::RayIdx,
        Field::Normal,
        Field::RingId,
        Field::TimeStamp,
        Field::RayTransform,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_field_has_a_nonzero_size() {
        for f in Field::ALL {
            assert!(f.element_size() > 0);
        }
    }
}
