//! Ray-producing node fed from a caller-supplied buffer (spec.md §4.6
//! "from-matrix-rays").
//!
//! This is the common entry point into a graph: a sensor model (LiDAR beam
//! table, radar antenna pattern, ...) is computed by the caller as an array of
//! `M3x4f` and handed in once; everything downstream only ever sees the
//! `RayTransform` field the rest of the node roster shares.

use std::sync::Arc;

use crate::array::Array;
use crate::error::{NodeError, SimError};
use crate::field::Field;
use crate::node::{Capabilities, EnqueueEnv, FieldBuffer, NodeKind, OutputStore, PredecessorView};
use crate::types::M3x4f;

/// Produces rays from a fixed host-supplied buffer of `M3x4f` transforms.
///
/// spec.md §9 flags the source's `validate()` as empty (`// :)`) and names the
/// correct behavior: verify `ray_count() > 0` and that the stored buffer's
/// length matches. This node does exactly that (SPEC_FULL.md §3 Open
/// Questions #2).
pub struct FromMatrixRaysNode {
    rays: Vec<M3x4f>,
    outputs: OutputStore,
    width: usize,
}

impl FromMatrixRaysNode {
    pub fn new(rays: Vec<M3x4f>) -> Self {
        Self { rays, outputs: OutputStore::default(), width: 0 }
    }

    pub fn set_rays(&mut self, rays: Vec<M3x4f>) {
        self.rays = rays;
    }

    pub fn ray_count(&self) -> usize {
        self.rays.len()
    }
}

impl NodeKind for FromMatrixRaysNode {
    fn name(&self) -> &str {
        "from_matrix_rays"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { produces_rays: true, ..Default::default() }
    }

    fn required_fields(&self) -> &[Field] {
        &[]
    }

    fn produced_fields(&self) -> Vec<Field> {
        vec![Field::RayTransform]
    }

    fn validate(&mut self, _predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError> {
        if self.rays.is_empty() {
            return Err(NodeError::MissingInput(self.name().to_string()));
        }
        Ok(())
    }

    fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError> {
        let mut array = Array::new_device(env.device, Field::RayTransform, self.rays.len());
        array.write_from_slice(env.queue, &self.rays);
        self.width = self.rays.len();
        self.outputs.set(Field::RayTransform, FieldBuffer::Rays(array));
        Ok(())
    }

    fn width(&self) -> usize {
        self.width
    }

    fn output_fields(&self) -> Vec<Field> {
        self.outputs.fields()
    }

    fn output(&self, field: Field) -> Option<Arc<FieldBuffer>> {
        self.outputs.get(field)
    }

    fn get_field_data(
        &mut self,
        field: Field,
        _device: &wgpu::Device,
        _queue: &wgpu::Queue,
    ) -> Result<Arc<FieldBuffer>, NodeError> {
        self.outputs.get(field).ok_or_else(|| NodeError::MissingInput(self.name().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_ray_buffer() {
        let mut node = FromMatrixRaysNode::new(vec![]);
        assert!(node.validate(&[]).is_err());
    }

    #[test]
    fn validate_accepts_nonempty_ray_buffer() {
        let mut node = FromMatrixRaysNode::new(vec![M3x4f::from_affine(&glam::Affine3A::IDENTITY)]);
        assert!(node.validate(&[]).is_ok());
        assert_eq!(node.ray_count(), 1);
    }
}
