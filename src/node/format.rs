//! Format node (spec.md §4.6 "Format").
//!
//! Packs a caller-chosen subset of an input's fields into one contiguous
//! host-side byte buffer at caller-specified offsets, the SoA→interleaved
//! step a yield node's caller needs for e.g. a PCL `PointCloud2`-style
//! buffer. Dummy slots (an offset with no field behind it) are reserved but
//! left zeroed, matching spec.md's "reserved space but not written".

use std::sync::Arc;

use crate::error::NodeError;
use crate::error::SimError;
use crate::field::Field;
use crate::node::{
    find_predecessor, require_input, Capabilities, EnqueueEnv, FieldBuffer, NodeId, NodeKind,
    OutputStore, PredecessorView,
};

/// One field's placement within the packed stride. `field: None` reserves
/// `size` dummy bytes without writing anything into them.
#[derive(Clone, Copy, Debug)]
pub struct FieldLayout {
    pub field: Option<Field>,
    pub offset: usize,
    pub size: usize,
}

pub struct FormatNode {
    input: NodeId,
    layout: Vec<FieldLayout>,
    stride: usize,
    outputs: OutputStore,
    packed: Vec<u8>,
    width: usize,
}

impl FormatNode {
    /// `layout` need not be sorted by offset; `stride` is the caller's
    /// chosen total row width (must be at least as large as every
    /// `offset + size`).
    pub fn new(input: NodeId, layout: Vec<FieldLayout>, stride: usize) -> Self {
        Self { input, layout, stride, outputs: OutputStore::default(), packed: Vec::new(), width: 0 }
    }

    /// The packed interleaved buffer from the most recent `enqueue`, one row
    /// of `stride()` bytes per point.
    pub fn packed(&self) -> &[u8] {
        &self.packed
    }

    pub fn stride(&self) -> usize {
        self.stride
    }
}

impl NodeKind for FormatNode {
    fn name(&self) -> &str {
        "format"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities { accepts_points: true, produces_points: true, ..Default::default() }
    }

    fn required_fields(&self) -> &[Field] {
        &[]
    }

    fn produced_fields(&self) -> Vec<Field> {
        self.layout.iter().filter_map(|l| l.field).collect()
    }

    fn validate(&mut self, predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError> {
        let pred = find_predecessor(predecessors, self.input)
            .ok_or_else(|| NodeError::MissingInput(self.name().to_string()))?;
        for layout in &self.layout {
            if let Some(field) = layout.field {
                if layout.offset + layout.size > self.stride {
                    return Err(NodeError::FieldTypeMismatch { node: self.name().to_string(), field });
                }
                if !pred.produced_fields.contains(&field) {
                    return Err(NodeError::FieldTypeMismatch { node: self.name().to_string(), field });
                }
            }
        }
        Ok(())
    }

    fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError> {
        self.outputs.clear();

        let mut width = 0usize;
        let mut field_bytes: Vec<(FieldLayout, Vec<u8>)> = Vec::with_capacity(self.layout.len());
        for &layout in &self.layout {
            let Some(field) = layout.field else { continue };
            let buf = require_input(env.inputs, self.input, field, self.name())?.clone();
            width = width.max(buf.count());
            let bytes = field_to_bytes(env.device, env.queue, &buf);
            field_bytes.push((layout, bytes));
            self.outputs.set_arc(field, buf);
        }
        self.width = width;

        let mut packed = vec![0u8; width * self.stride];
        for (layout, bytes) in &field_bytes {
            for row in 0..width {
                let src = &bytes[row * layout.size..(row + 1) * layout.size];
                let dst_start = row * self.stride + layout.offset;
                packed[dst_start..dst_start + layout.size].copy_from_slice(src);
            }
        }
        self.packed = packed;
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

fn field_to_bytes(device: &wgpu::Device, queue: &wgpu::Queue, buf: &FieldBuffer) -> Vec<u8> {
    match buf {
        FieldBuffer::Vec3(a) => bytemuck::cast_slice(&a.read_to_vec(device, queue)).to_vec(),
        FieldBuffer::Scalar(a) => bytemuck::cast_slice(&a.read_to_vec(device, queue)).to_vec(),
        FieldBuffer::Index(a) => bytemuck::cast_slice(&a.read_to_vec(device, queue)).to_vec(),
        FieldBuffer::Flag(a) => bytemuck::cast_slice(&a.read_to_vec(device, queue)).to_vec(),
        FieldBuffer::Rays(a) => bytemuck::cast_slice(&a.read_to_vec(device, queue)).to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn produced_fields_matches_non_dummy_layout_entries() {
        let layout = vec![
            FieldLayout { field: Some(Field::Xyz), offset: 0, size: 12 },
            FieldLayout { field: None, offset: 12, size: 4 },
            FieldLayout { field: Some(Field::Intensity), offset: 16, size: 4 },
        ];
        let node = FormatNode::new(NodeId(0), layout, 20);
        let produced = node.produced_fields();
        assert_eq!(produced, vec![Field::Xyz, Field::Intensity]);
    }

    #[test]
    fn validate_rejects_layout_overrunning_stride() {
        let layout = vec![FieldLayout { field: Some(Field::Xyz), offset: 16, size: 12 }];
        let mut node = FormatNode::new(NodeId(0), layout, 20);
        let preds = vec![PredecessorView {
            id: NodeId(0),
            capabilities: Capabilities::default(),
            produced_fields: &[Field::Xyz],
            width: 1,
        }];
        assert!(node.validate(&preds).is_err());
    }
}
