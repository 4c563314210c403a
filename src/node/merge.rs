//! Merge nodes (spec.md §4.6: "temporal/spatial merge"). Both concatenate
//! every field common to all their inputs, in input order, preserving each
//! input's own point order within the concatenation — the only difference
//! between the two is what the caller's graph topology means by "temporal"
//! (successive scans of the same sensor) versus "spatial" (simultaneous
//! sensors covering different regions); the node contract is identical, so
//! both share [`concat_inputs`].

use std::collections::HashSet;
use std::sync::Arc;

use crate::array::Array;
use crate::error::{NodeError, SimError};
use crate::field::Field;
use crate::node::{Capabilities, EnqueueEnv, FieldBuffer, NodeId, NodeKind, OutputStore, PredecessorView};
use crate::types::{M3x4f, V3f};

fn concat_field(device: &wgpu::Device, queue: &wgpu::Queue, field: Field, bufs: &[Arc<FieldBuffer>]) -> FieldBuffer {
    match bufs.first().map(|b| &**b) {
        Some(FieldBuffer::Vec3(_)) => {
            let mut all: Vec<V3f> = Vec::new();
            for b in bufs {
                if let Some(a) = b.as_vec3() {
                    all.extend(a.read_to_vec(device, queue));
                }
            }
            let mut out = Array::new_device(device, field, all.len());
            out.write_from_slice(queue, &all);
            FieldBuffer::Vec3(out)
        }
        Some(FieldBuffer::Scalar(_)) => {
            let mut all: Vec<f32> = Vec::new();
            for b in bufs {
                if let Some(a) = b.as_scalar() {
                    all.extend(a.read_to_vec(device, queue));
                }
            }
            let mut out = Array::new_device(device, field, all.len());
            out.write_from_slice(queue, &all);
            FieldBuffer::Scalar(out)
        }
        Some(FieldBuffer::Index(_)) => {
            let mut all: Vec<u32> = Vec::new();
            for b in bufs {
                if let Some(a) = b.as_index() {
                    all.extend(a.read_to_vec(device, queue));
                }
            }
            let mut out = Array::new_device(device, field, all.len());
            out.write_from_slice(queue, &all);
            FieldBuffer::Index(out)
        }
        Some(FieldBuffer::Flag(_)) => {
            let mut all: Vec<u32> = Vec::new();
            for b in bufs {
                if let Some(a) = b.as_flag() {
                    all.extend(a.read_to_vec(device, queue));
                }
            }
            let mut out = Array::new_device(device, field, all.len());
            out.write_from_slice(queue, &all);
            FieldBuffer::Flag(out)
        }
        Some(FieldBuffer::Rays(_)) => {
            let mut all: Vec<M3x4f> = Vec::new();
            for b in bufs {
                if let Some(a) = b.as_rays() {
                    all.extend(a.read_to_vec(device, queue));
                }
            }
            let mut out = Array::new_device(device, field, all.len());
            out.write_from_slice(queue, &all);
            FieldBuffer::Rays(out)
        }
        None => FieldBuffer::Scalar(Array::new_device(device, field, 0)),
    }
}

/// Concatenates every field common to all of `inputs`, in `inputs` order,
/// into `outputs`. Returns the total point count.
fn concat_inputs(env: &EnqueueEnv<'_>, inputs: &[NodeId], outputs: &mut OutputStore) -> usize {
    let per_input: Vec<&crate::node::NodeOutputs> =
        inputs.iter().filter_map(|id| env.inputs.get(id)).collect();

    let mut common: Option<HashSet<Field>> = None;
    for produced in &per_input {
        let fields: HashSet<Field> = produced.keys().copied().collect();
        common = Some(match common {
            Some(prev) => prev.intersection(&fields).copied().collect(),
            None => fields,
        });
    }
    let common = common.unwrap_or_default();

    let mut width = 0usize;
    for &field in &common {
        let bufs: Vec<Arc<FieldBuffer>> =
            per_input.iter().filter_map(|m| m.get(&field).cloned()).collect();
        width = bufs.iter().map(|b| b.count()).sum();
        let merged = concat_field(env.device, env.queue, field, &bufs);
        outputs.set(field, merged);
    }
    width
}

macro_rules! merge_node {
    ($name:ident, $label:literal) => {
        pub struct $name {
            inputs: Vec<NodeId>,
            outputs: OutputStore,
            width: usize,
        }

        impl $name {
            pub fn new(inputs: Vec<NodeId>) -> Self {
                Self { inputs, outputs: OutputStore::default(), width: 0 }
            }
        }

        impl NodeKind for $name {
            fn name(&self) -> &str {
                $label
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
                if self.inputs.is_empty() {
                    return Err(NodeError::MissingInput(self.name().to_string()));
                }
                for input in &self.inputs {
                    if !predecessors.iter().any(|p| p.id == *input) {
                        return Err(NodeError::MissingInput(self.name().to_string()));
                    }
                }
                Ok(())
            }

            fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError> {
                self.outputs.clear();
                self.width = concat_inputs(env, &self.inputs, &mut self.outputs);
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
    };
}

merge_node!(TemporalMergeNode, "temporal_merge");
merge_node!(SpatialMergeNode, "spatial_merge");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_input_list() {
        let mut node = TemporalMergeNode::new(vec![]);
        assert!(node.validate(&[]).is_err());
    }

    #[test]
    fn validate_rejects_unwired_input() {
        let mut node = SpatialMergeNode::new(vec![NodeId(7)]);
        assert!(node.validate(&[]).is_err());
    }
}
