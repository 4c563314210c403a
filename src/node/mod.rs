//! Node base: capability negotiation, the per-run state machine, and the
//! tagged output-buffer type every node kind shares (spec.md §4.3, §9).
//!
//! The source's deep node-kind class hierarchy is replaced here with the
//! capability-set record plus dispatch-table design spec.md §9 recommends:
//! [`Capabilities`] is a plain struct of booleans, and [`NodeKind`] is the
//! dispatch table (`validate`/`enqueue`/`get_field_data`) every concrete node
//! struct implements. Each concrete node (in `raytrace.rs`, `format.rs`, ...)
//! holds its own parameters and output arrays in a plain struct, the way the
//! teacher's `Lidar`/`DepthCamera` hold their pipelines and buffers directly
//! rather than behind a deep inheritance chain.

pub mod compact;
pub mod format;
mod gather;
pub mod merge;
pub mod misc;
pub mod noise;
pub mod radar;
pub mod raytrace;
pub mod rays;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;

use crate::array::Array;
use crate::error::{NodeError, SimError};
use crate::field::Field;
use crate::scene::Scene;
use crate::types::{M3x4f, V3f};

/// Identifies one node within a [`crate::graph::Graph`]. Stable across runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// What a node can produce/consume, replacing the source's `IRaysNode`/
/// `IPointsNode`/etc. class hierarchy with a plain record (spec.md §9).
/// `needs_scene` marks nodes the scheduler must commit the scene for before
/// enqueueing (spec.md §4.4 step 4) — only the ray-trace node sets it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub produces_rays: bool,
    pub produces_points: bool,
    pub accepts_rays: bool,
    pub accepts_points: bool,
    pub needs_scene: bool,
}

/// A node's lifecycle within one run (spec.md §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Idle,
    Validated,
    Enqueued,
    Completed,
    Skipped,
}

/// One produced field, tagged by its element type. This is the runtime half
/// of the field/type split spec.md §9 calls for: a node that statically knows
/// it is touching `Field::Distance` can still match on this enum once and get
/// a typed `Array<f32>` back, while generic kernels (format/compact) only
/// need `field()`/`byte_len()`.
pub enum FieldBuffer {
    Vec3(Array<V3f>),
    Scalar(Array<f32>),
    Index(Array<u32>),
    /// Boolean-valued fields (`IsHit`), carried as `u32` 0/1 — see
    /// [`crate::field::Field::element_size`].
    Flag(Array<u32>),
    /// `Field::RayTransform` only: the M3x4f buffer a rays-producing node
    /// hands the ray-trace node.
    Rays(Array<M3x4f>),
}

impl FieldBuffer {
    pub fn field(&self) -> Field {
        match self {
            FieldBuffer::Vec3(a) => a.field(),
            FieldBuffer::Scalar(a) => a.field(),
            FieldBuffer::Index(a) => a.field(),
            FieldBuffer::Flag(a) => a.field(),
            FieldBuffer::Rays(a) => a.field(),
        }
    }

    pub fn count(&self) -> usize {
        match self {
            FieldBuffer::Vec3(a) => a.get_count(),
            FieldBuffer::Scalar(a) => a.get_count(),
            FieldBuffer::Index(a) => a.get_count(),
            FieldBuffer::Flag(a) => a.get_count(),
            FieldBuffer::Rays(a) => a.get_count(),
        }
    }

    pub fn as_vec3(&self) -> Option<&Array<V3f>> {
        match self {
            FieldBuffer::Vec3(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Array<f32>> {
        match self {
            FieldBuffer::Scalar(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_index(&self) -> Option<&Array<u32>> {
        match self {
            FieldBuffer::Index(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<&Array<u32>> {
        match self {
            FieldBuffer::Flag(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_rays(&self) -> Option<&Array<M3x4f>> {
        match self {
            FieldBuffer::Rays(a) => Some(a),
            _ => None,
        }
    }
}

/// Read-only view of one predecessor a node validates/consumes against.
/// Deliberately narrow — a node must not reach into a predecessor's private
/// state, only its advertised capabilities and fields (spec.md §3 invariant 2:
/// "a node never writes to another node's outputs").
pub struct PredecessorView<'a> {
    pub id: NodeId,
    pub capabilities: Capabilities,
    pub produced_fields: &'a [Field],
    pub width: usize,
}

/// One predecessor's already-enqueued output buffers, keyed by field. Shared
/// via `Arc` so wiring them into a successor's [`EnqueueEnv`] is a refcount
/// bump, not a GPU-side copy — the buffers themselves stay owned by the
/// producing node.
pub type NodeOutputs = HashMap<Field, Arc<FieldBuffer>>;

/// Everything a node's `enqueue` needs from the run: the GPU handles, the
/// scene (only the ray-trace node touches it), and read access to
/// predecessors' already-enqueued output buffers. Because every node in a run
/// is walked in topological order, `inputs` only ever contains entries for
/// nodes enqueued earlier in this same run.
pub struct EnqueueEnv<'a> {
    pub device: &'a wgpu::Device,
    pub queue: &'a wgpu::Queue,
    pub scene: Option<&'a mut Scene>,
    pub inputs: &'a HashMap<NodeId, NodeOutputs>,
}

/// Common per-node-kind behavior (spec.md §4.3). Implemented by each concrete
/// node struct (`RayTraceNode`, `FormatNode`, `RadarPostprocessNode`, ...).
pub trait NodeKind: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Fields this node needs from its input(s).
    fn required_fields(&self) -> &[Field];

    /// Fields this node is capable of producing, independent of whether a run
    /// has actually allocated them yet — the static half `validate()` checks
    /// a successor's `required_fields` against. Most nodes return a fixed
    /// list; `FormatNode` returns whatever subset its parameters name.
    fn produced_fields(&self) -> Vec<Field>;

    /// Verifies inputs exist, have matching widths, and advertise required
    /// fields. Must not mutate GPU state.
    fn validate(&mut self, predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError>;

    /// Submits this node's work; must return immediately without blocking on
    /// GPU completion (spec.md §5 "Suspension points"). Sizes and allocates
    /// this node's output buffers before returning, so successors can be
    /// wired to them even though they aren't filled in yet.
    fn enqueue(&mut self, env: &mut EnqueueEnv<'_>) -> Result<(), SimError>;

    /// Number of points/rays this node produces for the current run. Only
    /// meaningful from `Enqueued` state on.
    fn width(&self) -> usize;

    /// Fields this node has allocated output buffers for in the current run.
    fn output_fields(&self) -> Vec<Field>;

    /// Non-blocking access to an already-enqueued output buffer, used by the
    /// scheduler to wire this node into a successor's [`EnqueueEnv`]. Returns
    /// `None` before `enqueue` has run or for a field this node doesn't
    /// produce.
    fn output(&self, field: Field) -> Option<Arc<FieldBuffer>>;

    /// The host-observable half of `getFieldData`: synchronizes on the run's
    /// queue (the caller does this via `device.poll` before calling in) and
    /// returns the same buffer `output()` would, materializing it first via a
    /// device-side kernel if this node only has it in an intermediate form.
    fn get_field_data(
        &mut self,
        field: Field,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
    ) -> Result<Arc<FieldBuffer>, NodeError>;
}

/// The bookkeeping the graph keeps per node, separate from the node's own
/// kind-specific state (spec.md §4.3's dirtiness flags and state machine).
pub struct Node {
    pub id: NodeId,
    pub inputs: Vec<NodeId>,
    pub params_dirty: bool,
    pub structure_dirty: bool,
    pub state: NodeState,
    pub kind: Box<dyn NodeKind>,
}

impl Node {
    pub fn new(id: NodeId, kind: Box<dyn NodeKind>) -> Self {
        Self {
            id,
            inputs: Vec::new(),
            params_dirty: true,
            structure_dirty: true,
            state: NodeState::Idle,
            kind,
        }
    }
}

pub(crate) fn m3x4_array_to_buf(array: &[M3x4f]) -> Vec<f32> {
    array.iter().flat_map(|m| m.rows).collect()
}

/// The output-buffer bookkeeping every concrete node kind embeds, so
/// `output_fields`/`output` have one obvious implementation instead of each
/// node kind reinventing a `HashMap<Field, Arc<FieldBuffer>>`.
#[derive(Default)]
pub(crate) struct OutputStore(HashMap<Field, Arc<FieldBuffer>>);

impl OutputStore {
    pub fn set(&mut self, field: Field, buf: FieldBuffer) {
        self.0.insert(field, Arc::new(buf));
    }

    /// Re-exposes an already-Arc'd buffer under this node's own output
    /// table, for pass-through nodes that forward a predecessor's field
    /// unchanged instead of computing a new one.
    pub fn set_arc(&mut self, field: Field, buf: Arc<FieldBuffer>) {
        self.0.insert(field, buf);
    }

    pub fn get(&self, field: Field) -> Option<Arc<FieldBuffer>> {
        self.0.get(&field).cloned()
    }

    pub fn fields(&self) -> Vec<Field> {
        self.0.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

/// Finds one specific predecessor in a `validate()` call's predecessor list.
///
/// Every concrete node kind with a fixed-arity input (everything except the
/// merge nodes) stores the [`NodeId`]s of its predecessors itself, set when
/// the graph-building API wires the connection (mirroring spec.md §3's "inputs
/// (0..N other nodes, by reference)" — the reference lives on the node, not
/// just in the scheduler's bookkeeping `Vec` on [`Node`]). `validate()` then
/// looks its stored id up in the predecessor list the scheduler built from
/// that same `Node.inputs` `Vec`, so the two always agree.
pub(crate) fn find_predecessor<'a, 'b>(
    predecessors: &'b [PredecessorView<'a>],
    id: NodeId,
) -> Option<&'b PredecessorView<'a>> {
    predecessors.iter().find(|p| p.id == id)
}

/// Fetches one predecessor's required field from the wired inputs, or the
/// `NodeError::MissingInput` every node kind would otherwise report by hand.
pub(crate) fn require_input<'a>(
    inputs: &'a HashMap<NodeId, NodeOutputs>,
    predecessor: NodeId,
    field: Field,
    node_name: &str,
) -> Result<&'a Arc<FieldBuffer>, NodeError> {
    inputs
        .get(&predecessor)
        .and_then(|m| m.get(&field))
        .ok_or_else(|| NodeError::MissingInput(node_name.to_string()))
}
