//! Rigid-transform nodes (spec.md §4.6: "transform points/rays").
//!
//! Both nodes apply a fixed `M3x4f` to their input and are cheap enough
//! (one affine multiply per element) that a host round trip through
//! `Array::read_to_vec`/`write_from_slice` is simpler than a bespoke WGSL
//! kernel and bind-group layout for each — the same trade the teacher makes
//! in `DepthCamera::project_to_world` before handing points back to the
//! caller.

use std::sync::Arc;

use crate::array::Array;
use crate::error::{NodeError, SimError};
use crate::field::Field;
use crate::node::{
    find_predecessor, require_input, Capabilities, EnqueueEnv, FieldBuffer, NodeId, NodeKind,
    OutputStore, PredecessorView,
};
use crate::types::M3x4f;

/// Applies a fixed affine transform to a point cloud's `Xyz`/`Normal`
/// fields, passing every other field it receives through unchanged.
pub struct TransformPointsNode {
    input: NodeId,
    transform: M3x4f,
    outputs: OutputStore,
    width: usize,
}

impl TransformPointsNode {
    pub fn new(input: NodeId, transform: M3x4f) -> Self {
        Self { input, transform, outputs: OutputStore::default(), width: 0 }
    }

    pub fn set_transform(&mut self, transform: M3x4f) {
        self.transform = transform;
    }
}

impl NodeKind for TransformPointsNode {
    fn name(&self) -> &str {
        "transform_points"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { accepts_points: true, produces_points: true, ..Default::default() }
    }

    fn required_fields(&self) -> &[Field] {
        &[Field::Xyz]
    }

    fn produced_fields(&self) -> Vec<Field> {
        Field::POINT_FIELDS.to_vec()
    }

    fn validate(&mut self, predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError> {
        let pred = find_predecessor(predecessors, self.input)
            .ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        if !pred.produced_fields.contains(&Field::Xyz) {
            return Err(NodeError::FieldTypeMismatch { node: self.name().to_string(), field: Field::Xyz });
        }
        Ok(())
    }

    fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError> {
        self.outputs.clear();
        let affine = self.transform.to_affine();

        let xyz_buf = require_input(env.inputs, self.input, Field::Xyz, self.name())?.clone();
        let xyz = xyz_buf.as_vec3().ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        self.width = xyz.get_count();
        let transformed: Vec<crate::types::V3f> = xyz
            .read_to_vec(env.device, env.queue)
            .into_iter()
            .map(|p| crate::types::V3f::from_glam(affine.transform_point3(p.to_glam())))
            .collect();
        let mut out_xyz = Array::new_device(env.device, Field::Xyz, self.width);
        out_xyz.write_from_slice(env.queue, &transformed);
        self.outputs.set(Field::Xyz, FieldBuffer::Vec3(out_xyz));

        if let Some(normal_buf) = env.inputs.get(&self.input).and_then(|m| m.get(&Field::Normal)) {
            if let Some(normal) = normal_buf.as_vec3() {
                let rotated: Vec<crate::types::V3f> = normal
                    .read_to_vec(env.device, env.queue)
                    .into_iter()
                    .map(|n| {
                        crate::types::V3f::from_glam(
                            (affine.matrix3 * n.to_glam()).normalize_or_zero(),
                        )
                    })
                    .collect();
                let mut out_normal = Array::new_device(env.device, Field::Normal, self.width);
                out_normal.write_from_slice(env.queue, &rotated);
                self.outputs.set(Field::Normal, FieldBuffer::Vec3(out_normal));
            }
        }

        if let Some(inputs) = env.inputs.get(&self.input) {
            for (&field, buf) in inputs.iter() {
                if field == Field::Xyz || field == Field::Normal || field == Field::RayTransform {
                    continue;
                }
                self.outputs.set_arc(field, buf.clone());
            }
        }
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

/// Composes a fixed affine transform onto every ray in its input's
/// `RayTransform` buffer (e.g. a sensor-to-world mount offset applied after a
/// ray source produces rays in sensor-local space).
pub struct TransformRaysNode {
    input: NodeId,
    transform: M3x4f,
    outputs: OutputStore,
    width: usize,
}

impl TransformRaysNode {
    pub fn new(input: NodeId, transform: M3x4f) -> Self {
        Self { input, transform, outputs: OutputStore::default(), width: 0 }
    }

    pub fn set_transform(&mut self, transform: M3x4f) {
        self.transform = transform;
    }
}

impl NodeKind for TransformRaysNode {
    fn name(&self) -> &str {
        "transform_rays"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { accepts_rays: true, produces_rays: true, ..Default::default() }
    }

    fn required_fields(&self) -> &[Field] {
        &[Field::RayTransform]
    }

    fn produced_fields(&self) -> Vec<Field> {
        vec![Field::RayTransform]
    }

    fn validate(&mut self, predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError> {
        let pred = find_predecessor(predecessors, self.input)
            .ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        if !pred.produced_fields.contains(&Field::RayTransform) {
            return Err(NodeError::FieldTypeMismatch {
                node: self.name().to_string(),
                field: Field::RayTransform,
            });
        }
        Ok(())
    }

    fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError> {
        let rays_buf = require_input(env.inputs, self.input, Field::RayTransform, self.name())?;
        let rays = rays_buf.as_rays().ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        self.width = rays.get_count();
        let outer = self.transform.to_affine();
        let composed: Vec<M3x4f> = rays
            .read_to_vec(env.device, env.queue)
            .into_iter()
            .map(|ray| M3x4f::from_affine(&(outer * ray.to_affine())))
            .collect();
        let mut out = Array::new_device(env.device, Field::RayTransform, self.width);
        out.write_from_slice(env.queue, &composed);
        self.outputs.set(Field::RayTransform, FieldBuffer::Rays(out));
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
    use glam::Affine3A;

    #[test]
    fn transform_points_requires_xyz_from_predecessor() {
        use crate::node::PredecessorView;
        let mut node = TransformPointsNode::new(NodeId(0), M3x4f::from_affine(&Affine3A::IDENTITY));
        let preds = vec![PredecessorView {
            id: NodeId(0),
            capabilities: Capabilities::default(),
            produced_fields: &[Field::Distance],
            width: 0,
        }];
        assert!(node.validate(&preds).is_err());
    }

    #[test]
    fn transform_rays_requires_ray_transform_from_predecessor() {
        use crate::node::PredecessorView;
        let mut node = TransformRaysNode::new(NodeId(0), M3x4f::from_affine(&Affine3A::IDENTITY));
        let preds = vec![PredecessorView {
            id: NodeId(0),
            capabilities: Capabilities { produces_rays: true, ..Default::default() },
            produced_fields: &[Field::RayTransform],
            width: 4,
        }];
        assert!(node.validate(&preds).is_ok());
    }
}
