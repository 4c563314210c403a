//! The remaining "same contract" post-process and boundary node kinds
//! spec.md §4.6 names: range clamping, ring-id/time-offset tagging, ground
//! filtering, a host-array point source, and the terminal yield node.

use std::sync::Arc;

use crate::array::Array;
use crate::error::{NodeError, SimError};
use crate::field::Field;
use crate::node::gather::gpu_gather;
use crate::node::{
    find_predecessor, require_input, Capabilities, EnqueueEnv, FieldBuffer, NodeId, NodeKind,
    OutputStore, PredecessorView,
};
use crate::types::V3f;

fn pass_through_rest(env: &EnqueueEnv<'_>, input: NodeId, skip: &[Field], outputs: &mut OutputStore) {
    if let Some(inputs) = env.inputs.get(&input) {
        for (&field, buf) in inputs.iter() {
            if skip.contains(&field) {
                continue;
            }
            outputs.set_arc(field, buf.clone());
        }
    }
}

/// Clamps points to a maximum range: any point whose `Distance` exceeds
/// `range_max` is marked a miss (`IsHit = 0`, `Distance = range_max`), the
/// same convention the ray-trace node uses for an out-of-range ray.
pub struct SetRangeNode {
    input: NodeId,
    range_max: f32,
    outputs: OutputStore,
    width: usize,
}

impl SetRangeNode {
    pub fn new(input: NodeId, range_max: f32) -> Self {
        Self { input, range_max, outputs: OutputStore::default(), width: 0 }
    }
}

impl NodeKind for SetRangeNode {
    fn name(&self) -> &str {
        "set_range"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { accepts_points: true, produces_points: true, ..Default::default() }
    }

    fn required_fields(&self) -> &[Field] {
        &[Field::Distance]
    }

    fn produced_fields(&self) -> Vec<Field> {
        Field::POINT_FIELDS.to_vec()
    }

    fn validate(&mut self, predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError> {
        let pred = find_predecessor(predecessors, self.input)
            .ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        if !pred.produced_fields.contains(&Field::Distance) {
            return Err(NodeError::FieldTypeMismatch { node: self.name().to_string(), field: Field::Distance });
        }
        Ok(())
    }

    fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError> {
        self.outputs.clear();
        let distance_arr = require_input(env.inputs, self.input, Field::Distance, self.name())?
            .as_scalar()
            .ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        let mut distances = distance_arr.read_to_vec(env.device, env.queue);
        self.width = distances.len();

        let mut is_hit = env
            .inputs
            .get(&self.input)
            .and_then(|m| m.get(&Field::IsHit))
            .and_then(|b| b.as_flag())
            .map(|a| a.read_to_vec(env.device, env.queue))
            .unwrap_or_else(|| vec![1u32; self.width]);

        for (d, hit) in distances.iter_mut().zip(is_hit.iter_mut()) {
            if *d > self.range_max {
                *d = self.range_max;
                *hit = 0;
            }
        }

        let mut out_distance = Array::new_device(env.device, Field::Distance, self.width);
        out_distance.write_from_slice(env.queue, &distances);
        self.outputs.set(Field::Distance, FieldBuffer::Scalar(out_distance));

        let mut out_hit = Array::new_device(env.device, Field::IsHit, self.width);
        out_hit.write_from_slice(env.queue, &is_hit);
        self.outputs.set(Field::IsHit, FieldBuffer::Flag(out_hit));

        pass_through_rest(env, self.input, &[Field::Distance, Field::IsHit], &mut self.outputs);
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

/// Tags every point with a `RingId`, cycling through a fixed per-ray pattern
/// (e.g. the scan-line table of a multi-beam LiDAR) indexed by position in
/// the input, wrapping if the input is wider than the pattern.
pub struct SetRingIdsNode {
    input: NodeId,
    ring_ids: Vec<u32>,
    outputs: OutputStore,
    width: usize,
}

impl SetRingIdsNode {
    pub fn new(input: NodeId, ring_ids: Vec<u32>) -> Self {
        Self { input, ring_ids, outputs: OutputStore::default(), width: 0 }
    }
}

impl NodeKind for SetRingIdsNode {
    fn name(&self) -> &str {
        "set_ring_ids"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { accepts_points: true, produces_points: true, ..Default::default() }
    }

    fn required_fields(&self) -> &[Field] {
        &[]
    }

    fn produced_fields(&self) -> Vec<Field> {
        Field::POINT_FIELDS.to_vec()
    }

    fn validate(&mut self, predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError> {
        find_predecessor(predecessors, self.input).ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        if self.ring_ids.is_empty() {
            return Err(NodeError::MissingInput(self.name().to_string()));
        }
        Ok(())
    }

    fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError> {
        self.outputs.clear();
        let width = env
            .inputs
            .get(&self.input)
            .and_then(|m| m.values().next())
            .map(|b| b.count())
            .unwrap_or(0);
        self.width = width;

        let ids: Vec<u32> = (0..width).map(|i| self.ring_ids[i % self.ring_ids.len()]).collect();
        let mut out = Array::new_device(env.device, Field::RingId, width);
        out.write_from_slice(env.queue, &ids);
        self.outputs.set(Field::RingId, FieldBuffer::Index(out));

        pass_through_rest(env, self.input, &[Field::RingId], &mut self.outputs);
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

/// Tags every point with a `TimeStamp` computed as `base_time + ray_idx *
/// dt`, the linear per-ray firing schedule a rolling-shutter LiDAR scan
/// follows between its start-of-scan and end-of-scan times.
pub struct SetTimeOffsetsNode {
    input: NodeId,
    base_time: f32,
    dt: f32,
    outputs: OutputStore,
    width: usize,
}

impl SetTimeOffsetsNode {
    pub fn new(input: NodeId, base_time: f32, dt: f32) -> Self {
        Self { input, base_time, dt, outputs: OutputStore::default(), width: 0 }
    }
}

impl NodeKind for SetTimeOffsetsNode {
    fn name(&self) -> &str {
        "set_time_offsets"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { accepts_points: true, produces_points: true, ..Default::default() }
    }

    fn required_fields(&self) -> &[Field] {
        &[Field::RayIdx]
    }

    fn produced_fields(&self) -> Vec<Field> {
        Field::POINT_FIELDS.to_vec()
    }

    fn validate(&mut self, predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError> {
        let pred = find_predecessor(predecessors, self.input)
            .ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        if !pred.produced_fields.contains(&Field::RayIdx) {
            return Err(NodeError::FieldTypeMismatch { node: self.name().to_string(), field: Field::RayIdx });
        }
        Ok(())
    }

    fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError> {
        self.outputs.clear();
        let ray_idx = require_input(env.inputs, self.input, Field::RayIdx, self.name())?
            .as_index()
            .ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?
            .read_to_vec(env.device, env.queue);
        self.width = ray_idx.len();

        let stamps: Vec<f32> = ray_idx.iter().map(|&i| self.base_time + i as f32 * self.dt).collect();
        let mut out = Array::new_device(env.device, Field::TimeStamp, self.width);
        out.write_from_slice(env.queue, &stamps);
        self.outputs.set(Field::TimeStamp, FieldBuffer::Scalar(out));

        pass_through_rest(env, self.input, &[Field::TimeStamp], &mut self.outputs);
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

/// Removes points near an assumed-flat ground plane (world `+Z` up): a point
/// survives unless its height above `ground_z` is within `thickness`.
pub struct FilterGroundNode {
    input: NodeId,
    ground_z: f32,
    thickness: f32,
    outputs: OutputStore,
    width: usize,
}

impl FilterGroundNode {
    pub fn new(input: NodeId, ground_z: f32, thickness: f32) -> Self {
        Self { input, ground_z, thickness, outputs: OutputStore::default(), width: 0 }
    }
}

impl NodeKind for FilterGroundNode {
    fn name(&self) -> &str {
        "filter_ground"
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
        let xyz = require_input(env.inputs, self.input, Field::Xyz, self.name())?
            .as_vec3()
            .ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?
            .read_to_vec(env.device, env.queue);

        let indices: Vec<u32> = xyz
            .iter()
            .enumerate()
            .filter(|(_, p)| (p.z - self.ground_z).abs() > self.thickness)
            .map(|(i, _)| i as u32)
            .collect();
        self.width = indices.len();

        if let Some(inputs) = env.inputs.get(&self.input) {
            let mut fields: Vec<(Field, Arc<FieldBuffer>)> =
                inputs.iter().map(|(&f, b)| (f, b.clone())).collect();
            fields.sort_by_key(|(f, _)| format!("{f:?}"));
            for (field, buf) in fields {
                let gathered = gpu_gather(env.device, env.queue, &buf, &indices);
                self.outputs.set(field, gathered);
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

/// Produces a point cloud directly from caller-supplied host arrays (spec.md
/// §4.6 "from-array-points"), the points-side counterpart of
/// [`crate::node::rays::FromMatrixRaysNode`]. `xyz` is required; every other
/// field is optional but, if present, must match `xyz`'s length.
#[derive(Default)]
pub struct FromArrayPointsNode {
    xyz: Vec<V3f>,
    distance: Option<Vec<f32>>,
    intensity: Option<Vec<f32>>,
    is_hit: Option<Vec<u32>>,
    outputs: OutputStore,
    width: usize,
}

impl FromArrayPointsNode {
    pub fn new(xyz: Vec<V3f>) -> Self {
        Self { xyz, ..Default::default() }
    }

    pub fn with_distance(mut self, distance: Vec<f32>) -> Self {
        self.distance = Some(distance);
        self
    }

    pub fn with_intensity(mut self, intensity: Vec<f32>) -> Self {
        self.intensity = Some(intensity);
        self
    }

    pub fn with_is_hit(mut self, is_hit: Vec<u32>) -> Self {
        self.is_hit = Some(is_hit);
        self
    }
}

impl NodeKind for FromArrayPointsNode {
    fn name(&self) -> &str {
        "from_array_points"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { produces_points: true, ..Default::default() }
    }

    fn required_fields(&self) -> &[Field] {
        &[]
    }

    fn produced_fields(&self) -> Vec<Field> {
        let mut fields = vec![Field::Xyz];
        if self.distance.is_some() {
            fields.push(Field::Distance);
        }
        if self.intensity.is_some() {
            fields.push(Field::Intensity);
        }
        if self.is_hit.is_some() {
            fields.push(Field::IsHit);
        }
        fields
    }

    fn validate(&mut self, _predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError> {
        if self.xyz.is_empty() {
            return Err(NodeError::MissingInput(self.name().to_string()));
        }
        for len in [self.distance.as_ref().map(Vec::len), self.intensity.as_ref().map(Vec::len), self.is_hit.as_ref().map(Vec::len)]
            .into_iter()
            .flatten()
        {
            if len != self.xyz.len() {
                return Err(NodeError::MissingInput(self.name().to_string()));
            }
        }
        Ok(())
    }

    fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError> {
        self.outputs.clear();
        self.width = self.xyz.len();

        let mut out_xyz = Array::new_device(env.device, Field::Xyz, self.width);
        out_xyz.write_from_slice(env.queue, &self.xyz);
        self.outputs.set(Field::Xyz, FieldBuffer::Vec3(out_xyz));

        if let Some(distance) = &self.distance {
            let mut out = Array::new_device(env.device, Field::Distance, self.width);
            out.write_from_slice(env.queue, distance);
            self.outputs.set(Field::Distance, FieldBuffer::Scalar(out));
        }
        if let Some(intensity) = &self.intensity {
            let mut out = Array::new_device(env.device, Field::Intensity, self.width);
            out.write_from_slice(env.queue, intensity);
            self.outputs.set(Field::Intensity, FieldBuffer::Scalar(out));
        }
        if let Some(is_hit) = &self.is_hit {
            let mut out = Array::new_device(env.device, Field::IsHit, self.width);
            out.write_from_slice(env.queue, is_hit);
            self.outputs.set(Field::IsHit, FieldBuffer::Flag(out));
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

/// Terminal node (spec.md §3 "Yield node"): exposes a caller-selected subset
/// of its predecessor's fields and nothing else. Performs no computation of
/// its own — wiring a yield node's requested field to an upstream buffer
/// that already exists is exactly the "consistent arrays, no data race"
/// contract spec.md §8 scenario 6 asks for, since both are the same `Arc`.
pub struct YieldNode {
    input: NodeId,
    requested: Vec<Field>,
    outputs: OutputStore,
    width: usize,
}

impl YieldNode {
    pub fn new(input: NodeId, requested: Vec<Field>) -> Self {
        Self { input, requested, outputs: OutputStore::default(), width: 0 }
    }

    pub fn requested_fields(&self) -> &[Field] {
        &self.requested
    }
}

impl NodeKind for YieldNode {
    fn name(&self) -> &str {
        "yield"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { accepts_points: true, ..Default::default() }
    }

    fn required_fields(&self) -> &[Field] {
        &self.requested
    }

    fn produced_fields(&self) -> Vec<Field> {
        self.requested.clone()
    }

    fn validate(&mut self, predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError> {
        let pred = find_predecessor(predecessors, self.input)
            .ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        for field in &self.requested {
            if !pred.produced_fields.contains(field) {
                return Err(NodeError::FieldTypeMismatch { node: self.name().to_string(), field: *field });
            }
        }
        Ok(())
    }

    fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError> {
        self.outputs.clear();
        for &field in &self.requested {
            let buf = require_input(env.inputs, self.input, field, self.name())?.clone();
            self.width = self.width.max(buf.count());
            self.outputs.set_arc(field, buf);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_array_points_rejects_mismatched_distance_length() {
        let mut node = FromArrayPointsNode::new(vec![V3f::ZERO, V3f::ZERO]).with_distance(vec![1.0]);
        assert!(node.validate(&[]).is_err());
    }

    #[test]
    fn from_array_points_accepts_matching_lengths() {
        let mut node =
            FromArrayPointsNode::new(vec![V3f::ZERO, V3f::ZERO]).with_distance(vec![1.0, 2.0]);
        assert!(node.validate(&[]).is_ok());
    }

    #[test]
    fn yield_node_requires_every_requested_field_from_predecessor() {
        let mut node = YieldNode::new(NodeId(0), vec![Field::Xyz, Field::Intensity]);
        let preds = vec![PredecessorView {
            id: NodeId(0),
            capabilities: Capabilities::default(),
            produced_fields: &[Field::Xyz],
            width: 0,
        }];
        assert!(node.validate(&preds).is_err());
    }

    #[test]
    fn set_ring_ids_rejects_empty_pattern() {
        let mut node = SetRingIdsNode::new(NodeId(0), vec![]);
        let preds = vec![PredecessorView {
            id: NodeId(0),
            capabilities: Capabilities::default(),
            produced_fields: &[Field::Xyz],
            width: 0,
        }];
        assert!(node.validate(&preds).is_err());
    }
}
