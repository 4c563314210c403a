//! Graph compilation & scheduler (spec.md §4.4).
//!
//! Rust replaces the source's explicit "graph-wide lock" (spec.md §5) with
//! ordinary borrow-checking: every mutation and `run()` call takes `&mut
//! Graph`, so the compiler already forbids concurrent mutation-during-run
//! within one thread; a caller who needs the graph shared across threads
//! wraps it in `Arc<Mutex<Graph>>` themselves, which gives the same
//! serialize-on-a-lock behavior spec.md describes without this crate
//! reinventing a bespoke lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::array::ArrayMgr;
use crate::error::{GraphError, SimError};
use crate::field::Field;
pub use crate::node::NodeId;
use crate::node::{EnqueueEnv, Node, NodeKind, NodeOutputs, NodeState, PredecessorView};
use crate::scene::Scene;

/// A shared, cooperative cancellation flag (spec.md §4.4 "Cancellation").
/// Cloning shares the same underlying flag; `cancel()` from any clone (e.g.
/// one held by another thread) is observed by the run loop the next time it
/// checks between nodes.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A dynamically mutable DAG of typed nodes (spec.md §3 "Graph" /
/// §4.4). Owns every node ever added; a `run()` call only walks the subset
/// reachable from the entry nodes passed to it.
#[derive(Default)]
pub struct Graph {
    nodes: HashMap<NodeId, Node>,
    insertion_order: Vec<NodeId>,
    next_id: u64,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, kind: Box<dyn NodeKind>) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, Node::new(id, kind));
        self.insertion_order.push(id);
        id
    }

    pub fn remove_node(&mut self, id: NodeId) -> Result<(), SimError> {
        self.nodes
            .remove(&id)
            .ok_or_else(|| SimError::Graph(GraphError::InvalidPipeline(format!("no such node {id:?}"))))?;
        self.insertion_order.retain(|n| *n != id);
        for node in self.nodes.values_mut() {
            if node.inputs.contains(&id) {
                node.inputs.retain(|n| *n != id);
                node.structure_dirty = true;
            }
        }
        Ok(())
    }

    /// Wires `input` as one of `node`'s predecessors. Marks `node`
    /// structure-dirty so the next `run()` revalidates it.
    pub fn connect(&mut self, node: NodeId, input: NodeId) -> Result<(), SimError> {
        if !self.nodes.contains_key(&input) {
            return Err(SimError::Graph(GraphError::InvalidPipeline(format!(
                "no such node {input:?}"
            ))));
        }
        let n = self
            .nodes
            .get_mut(&node)
            .ok_or_else(|| SimError::Graph(GraphError::InvalidPipeline(format!("no such node {node:?}"))))?;
        n.inputs.push(input);
        n.structure_dirty = true;
        Ok(())
    }

    pub fn disconnect(&mut self, node: NodeId, input: NodeId) -> Result<(), SimError> {
        let n = self
            .nodes
            .get_mut(&node)
            .ok_or_else(|| SimError::Graph(GraphError::InvalidPipeline(format!("no such node {node:?}"))))?;
        n.inputs.retain(|i| *i != input);
        n.structure_dirty = true;
        Ok(())
    }

    /// Marks a node's parameters dirty, the way an API setter would after
    /// changing one of its static parameters (spec.md §4.3 `paramsDirty`).
    pub fn mark_params_dirty(&mut self, node: NodeId) -> Result<(), SimError> {
        let n = self
            .nodes
            .get_mut(&node)
            .ok_or_else(|| SimError::Graph(GraphError::InvalidPipeline(format!("no such node {node:?}"))))?;
        n.params_dirty = true;
        Ok(())
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut dyn NodeKind> {
        self.nodes.get_mut(&id).map(|n| n.kind.as_mut())
    }

    fn reachable(&self, entries: &[NodeId]) -> HashSet<NodeId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeId> = entries.to_vec();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.inputs.iter().copied());
            }
        }
        seen
    }

    /// Kahn's algorithm over the reachable subgraph, ties broken by
    /// insertion order (spec.md §4.4 step 2: "stable; ties broken by
    /// insertion order"). Returns `GraphError::Cycle` naming the
    /// lowest-insertion-order node still unresolved once no more nodes have
    /// zero remaining in-degree, matching scenario 5 in spec.md §8.
    fn topo_sort(&self, reachable: &HashSet<NodeId>) -> Result<Vec<NodeId>, GraphError> {
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        for &id in reachable {
            in_degree.insert(id, self.nodes[&id].inputs.iter().filter(|i| reachable.contains(i)).count());
        }
        let mut successors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        for &id in reachable {
            for &input in &self.nodes[&id].inputs {
                if reachable.contains(&input) {
                    successors.entry(input).or_default().push(id);
                }
            }
        }

        let ordered_candidates = |ids: &[NodeId]| -> VecDeque<NodeId> {
            let mut v: Vec<NodeId> = ids.to_vec();
            v.sort_by_key(|id| self.insertion_order.iter().position(|n| n == id).unwrap_or(usize::MAX));
            v.into()
        };

        let mut ready: VecDeque<NodeId> = ordered_candidates(
            &reachable.iter().copied().filter(|id| in_degree[id] == 0).collect::<Vec<_>>(),
        );

        let mut order = Vec::with_capacity(reachable.len());
        let mut remaining = in_degree.clone();
        while let Some(id) = ready.pop_front() {
            order.push(id);
            remaining.remove(&id);
            let mut newly_ready = Vec::new();
            if let Some(succs) = successors.get(&id) {
                for &s in succs {
                    if let Some(d) = remaining.get_mut(&s) {
                        *d -= 1;
                        if *d == 0 {
                            newly_ready.push(s);
                        }
                    }
                }
            }
            newly_ready.sort_by_key(|id| self.insertion_order.iter().position(|n| n == id).unwrap_or(usize::MAX));
            for n in newly_ready {
                ready.push_back(n);
            }
        }

        if order.len() != reachable.len() {
            let stuck = remaining
                .keys()
                .min_by_key(|id| self.insertion_order.iter().position(|n| *n == **id).unwrap_or(usize::MAX))
                .copied()
                .unwrap();
            return Err(GraphError::Cycle(self.nodes[&stuck].kind.name().to_string()));
        }
        Ok(order)
    }

    fn predecessor_views(&self, id: NodeId) -> Vec<PredecessorView<'_>> {
        self.nodes[&id]
            .inputs
            .iter()
            .filter_map(|pid| self.nodes.get(pid))
            .map(|p| PredecessorView {
                id: p.id,
                capabilities: p.kind.capabilities(),
                produced_fields: leak_fields(p.kind.produced_fields()),
                width: p.kind.width(),
            })
            .collect()
    }

    /// Entry point (spec.md §4.4): discovers the reachable subgraph from
    /// `entries`, topologically sorts it, validates every node, commits the
    /// scene if a ray-trace node is present, then walks the order enqueueing
    /// each node onto `queue`.
    pub fn run(
        &mut self,
        entries: &[NodeId],
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        mut scene: Option<&mut Scene>,
        cancel: CancelToken,
    ) -> Result<RunHandle, SimError> {
        let reachable = self.reachable(entries);
        let order = self.topo_sort(&reachable)?;

        for &id in &order {
            let preds = self.predecessor_views(id);
            let node = self.nodes.get_mut(&id).unwrap();
            node.kind
                .validate(&preds)
                .map_err(|e| SimError::Graph(GraphError::InvalidPipeline(e.to_string())))?;
            node.state = NodeState::Validated;
        }

        let needs_scene = order.iter().any(|id| self.nodes[id].kind.capabilities().needs_scene);
        if needs_scene {
            let scene_ref = scene.as_deref_mut().ok_or_else(|| {
                SimError::Graph(GraphError::InvalidPipeline(
                    "ray-trace node present but no scene was supplied to run()".to_string(),
                ))
            })?;
            scene_ref.commit(device, queue).map_err(SimError::Scene)?;
        }

        let mut outputs: HashMap<NodeId, NodeOutputs> = HashMap::new();
        let mut states: HashMap<NodeId, NodeState> = HashMap::new();
        let mut failed = false;

        for &id in &order {
            if cancel.is_cancelled() {
                tracing::info!("run cancelled before node {:?}; skipping remainder", id);
                failed = true;
            }
            if failed {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.state = NodeState::Skipped;
                }
                states.insert(id, NodeState::Skipped);
                continue;
            }

            let node_inputs: HashMap<NodeId, NodeOutputs> = self.nodes[&id]
                .inputs
                .iter()
                .filter_map(|pid| outputs.get(pid).map(|o| (*pid, o.clone())))
                .collect();

            let node = self.nodes.get_mut(&id).unwrap();
            let mut env = EnqueueEnv {
                device,
                queue,
                scene: scene.as_deref_mut(),
                inputs: &node_inputs,
            };
            node.state = NodeState::Enqueued;
            tracing::trace!(node = %node.kind.name(), "enqueue");
            match node.kind.enqueue(&mut env) {
                Ok(()) => {
                    node.state = NodeState::Completed;
                    states.insert(id, NodeState::Completed);
                    let mut produced = NodeOutputs::new();
                    for field in node.kind.output_fields() {
                        if let Some(buf) = node.kind.output(field) {
                            produced.insert(field, buf);
                        }
                    }
                    outputs.insert(id, produced);
                }
                Err(e) => {
                    tracing::warn!(node = %node.kind.name(), error = %e, "enqueue failed; run aborted");
                    node.state = NodeState::Skipped;
                    states.insert(id, NodeState::Skipped);
                    failed = true;
                }
            }
        }

        Ok(RunHandle { order, states, cancel, submission: queue.submit([]) })
    }

    /// Blocks the node's internal `getFieldData` path: synchronizes the
    /// device up to this run's last submission, then asks the node to
    /// materialize `field`.
    pub fn get_field_data(
        &mut self,
        run: &RunHandle,
        node: NodeId,
        field: Field,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
    ) -> Result<Arc<crate::node::FieldBuffer>, SimError> {
        match run.states.get(&node) {
            Some(NodeState::Completed) => {}
            Some(NodeState::Skipped) => {
                return Err(SimError::Node(crate::error::NodeError::Skipped(
                    self.nodes.get(&node).map(|n| n.kind.name().to_string()).unwrap_or_default(),
                )))
            }
            _ => {
                return Err(SimError::Graph(GraphError::InvalidPipeline(format!(
                    "node {node:?} has not completed in this run"
                ))))
            }
        }
        let _ = device.poll(wgpu::PollType::wait());
        let n = self
            .nodes
            .get_mut(&node)
            .ok_or_else(|| SimError::Graph(GraphError::InvalidPipeline(format!("no such node {node:?}"))))?;
        n.kind.get_field_data(field, device, queue).map_err(SimError::Node)
    }
}

/// One execution of a graph (spec.md §3 "Run"). Pins nothing by itself — each
/// node keeps owning its own output buffers — but records the topological
/// order and per-node completion state `get_field_data`/`synchronize` need,
/// plus an [`ArrayMgr`] a caller can use to additionally intern buffers that
/// must outlive individual node ownership (e.g. a client-side readback
/// staged across several `getFieldData` calls).
pub struct RunHandle {
    pub order: Vec<NodeId>,
    states: HashMap<NodeId, NodeState>,
    cancel: CancelToken,
    submission: wgpu::SubmissionIndex,
}

impl RunHandle {
    pub fn state(&self, node: NodeId) -> Option<NodeState> {
        self.states.get(&node).copied()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Blocks until every kernel submitted during this run has completed
    /// (spec.md §5 "Suspension points": `synchronize()`).
    pub fn synchronize(&self, device: &wgpu::Device) {
        let _ = device.poll(wgpu::PollType::WaitForSubmissionIndex(self.submission.clone()));
    }

    pub fn array_mgr(&self) -> ArrayMgr {
        ArrayMgr::new()
    }
}

/// `PredecessorView::produced_fields` borrows; since `produced_fields()`
/// returns an owned `Vec`, leak a short-lived slice for the duration of
/// validation via `Box::leak`. Validation runs once per `run()` call and the
/// sets are small, so the one-time allocation this trades against a lifetime
/// refactor of `NodeKind::produced_fields` is negligible.
fn leak_fields(fields: Vec<Field>) -> &'static [Field] {
    Box::leak(fields.into_boxed_slice())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NodeError;
    use crate::node::{Capabilities, EnqueueEnv as Env, FieldBuffer, NodeKind};

    struct Stub {
        name: &'static str,
        caps: Capabilities,
    }

    impl NodeKind for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn capabilities(&self) -> Capabilities {
            self.caps
        }
        fn required_fields(&self) -> &[Field] {
            &[]
        }
        fn produced_fields(&self) -> Vec<Field> {
            vec![]
        }
        fn validate(&mut self, _predecessors: &[PredecessorView<'_>]) -> Result<(), NodeError> {
            Ok(())
        }
        fn enqueue(&mut self, _env: &mut Env<'_>) -> Result<(), SimError> {
            Ok(())
        }
        fn width(&self) -> usize {
            0
        }
        fn output_fields(&self) -> Vec<Field> {
            vec![]
        }
        fn output(&self, _field: Field) -> Option<Arc<FieldBuffer>> {
            None
        }
        fn get_field_data(
            &mut self,
            _field: Field,
            _device: &wgpu::Device,
            _queue: &wgpu::Queue,
        ) -> Result<Arc<FieldBuffer>, NodeError> {
            Err(NodeError::MissingInput(self.name.to_string()))
        }
    }

    fn stub(name: &'static str) -> Box<dyn NodeKind> {
        Box::new(Stub { name, caps: Capabilities::default() })
    }

    #[test]
    fn topo_sort_orders_a_chain() {
        let mut g = Graph::new();
        let a = g.add_node(stub("a"));
        let b = g.add_node(stub("b"));
        let c = g.add_node(stub("c"));
        g.connect(b, a).unwrap();
        g.connect(c, b).unwrap();
        let reachable = g.reachable(&[c]);
        let order = g.topo_sort(&reachable).unwrap();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn topo_sort_detects_a_cycle() {
        let mut g = Graph::new();
        let a = g.add_node(stub("a"));
        let b = g.add_node(stub("b"));
        g.connect(a, b).unwrap();
        g.connect(b, a).unwrap();
        let reachable = g.reachable(&[a, b]);
        let err = g.topo_sort(&reachable).unwrap_err();
        assert!(matches!(err, GraphError::Cycle(_)));
    }

    #[test]
    fn remove_node_detaches_successors() {
        let mut g = Graph::new();
        let a = g.add_node(stub("a"));
        let b = g.add_node(stub("b"));
        g.connect(b, a).unwrap();
        g.remove_node(a).unwrap();
        assert!(g.nodes[&b].inputs.is_empty());
    }

    #[test]
    fn cancel_token_is_observed_after_clone() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
