//! Per-thread graph store (spec §3, §4.B). Node indices are dense and
//! assigned in execution order (I1); all cross-node references are by index,
//! never by pointer (design note, §9).

use crate::instruction::Instruction;
use crate::layout::{self, PositionInput};
use crate::types::{Address, NodeIndex, ThreadId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VCoord {
    pub a: i64,
    pub b: i64,
    pub b_mod: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeClass {
    New,
    Old,
    Call,
    Return,
    Exception,
    Library,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub source: NodeIndex,
    pub target: NodeIndex,
    pub class: EdgeClass,
    pub chained_weight: u64,
}

/// What a node represents: an executed instruction, or a call into
/// uninstrumented code (an "external node" per the glossary, which carries
/// no instruction).
#[derive(Debug, Clone)]
pub enum NodeKind {
    Instruction(Arc<Instruction>),
    External { address: Address },
}

#[derive(Debug, Clone)]
pub struct ArgRecord {
    pub position: u32,
    pub value: String,
}

pub type ArgList = Vec<ArgRecord>;

#[derive(Debug, Clone)]
pub struct Node {
    pub index: NodeIndex,
    pub kind: NodeKind,
    pub vcoord: VCoord,
    pub execution_count: u64,
    pub calls: u64,
    pub module: Option<usize>,
    pub external: bool,
    pub parent: Option<NodeIndex>,
    pub child_externs: u32,
    pub func_args: Vec<ArgList>,
    pub outgoing: HashSet<NodeIndex>,
    pub incoming: HashSet<NodeIndex>,
}

impl Node {
    pub fn address(&self) -> Address {
        match &self.kind {
            NodeKind::Instruction(ins) => ins.address,
            NodeKind::External { address } => *address,
        }
    }

    pub fn instruction(&self) -> Option<&Arc<Instruction>> {
        match &self.kind {
            NodeKind::Instruction(ins) => Some(ins),
            NodeKind::External { .. } => None,
        }
    }
}

/// Everything guarded by the "main store" lock (spec §4.B: locks a).
struct StoreInner {
    nodes: Vec<Node>,
    edges: HashMap<(NodeIndex, NodeIndex), Edge>,
    used_coords: HashSet<(i64, i64)>,
    max_a: i64,
    max_b: i64,
}

/// Everything guarded by the animation-sequence lock (locks b).
#[derive(Default)]
pub struct AnimationState {
    pub bb_sequence: Vec<(Address, u32)>,
    pub mutation_sequence: Vec<u32>,
    /// `(loop_counter, repeat_count)` per executed tag; `(0, LOOP_SENTINEL)`
    /// for a tag executed outside a loop (spec §4.G/§8).
    pub loop_state_list: Vec<(u64, u64)>,
    pub extern_call_sequence: HashMap<NodeIndex, Vec<(NodeIndex, NodeIndex)>>,
}

pub const LOOP_SENTINEL: u64 = 0xbad;

/// Everything guarded by the highlights lock (locks c).
#[derive(Default)]
pub struct HighlightState {
    pub exception_set: Vec<NodeIndex>,
    pub extern_list: Vec<NodeIndex>,
}

#[derive(Debug, Clone)]
pub struct FloatingExtern {
    pub edge: (NodeIndex, NodeIndex),
    pub node: NodeIndex,
    pub caller_address: Address,
    pub extern_path: String,
    pub args: ArgList,
}

/// A per-thread control-flow graph. Four independent locks guard disjoint
/// parts of the state; code must never hold two at once except in the
/// documented order store -> animation -> highlights -> args.
pub struct PerThreadGraph {
    pub thread_id: ThreadId,
    store: Mutex<StoreInner>,
    animation: Mutex<AnimationState>,
    highlights: Mutex<HighlightState>,
    args: Mutex<VecDeque<FloatingExtern>>,
    pub terminated: AtomicBool,
    pub loop_counter: AtomicU64,
    pub total_instructions: AtomicU64,
    /// Items (records) processed per second, updated once a second by the
    /// worker as a backlog-out-rate meter for the UI (spec §5).
    pub backlog_rate: AtomicU64,
    final_node: Mutex<Option<NodeIndex>>,
}

impl PerThreadGraph {
    pub fn new(thread_id: ThreadId) -> Self {
        Self {
            thread_id,
            store: Mutex::new(StoreInner {
                nodes: Vec::new(),
                edges: HashMap::new(),
                used_coords: HashSet::new(),
                max_a: 0,
                max_b: 0,
            }),
            animation: Mutex::new(AnimationState::default()),
            highlights: Mutex::new(HighlightState::default()),
            args: Mutex::new(VecDeque::new()),
            terminated: AtomicBool::new(false),
            loop_counter: AtomicU64::new(0),
            total_instructions: AtomicU64::new(0),
            backlog_rate: AtomicU64::new(0),
            final_node: Mutex::new(None),
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.store.lock().nodes.len()
    }

    pub fn node_exists(&self, idx: NodeIndex) -> bool {
        idx < self.store.lock().nodes.len()
    }

    pub fn with_node<R>(&self, idx: NodeIndex, f: impl FnOnce(&Node) -> R) -> Option<R> {
        self.store.lock().nodes.get(idx).map(f)
    }

    pub fn with_node_mut<R>(&self, idx: NodeIndex, f: impl FnOnce(&mut Node) -> R) -> Option<R> {
        self.store.lock().nodes.get_mut(idx).map(f)
    }

    pub fn vcoord(&self, idx: NodeIndex) -> Option<VCoord> {
        self.with_node(idx, |n| n.vcoord)
    }

    /// Computes a free coordinate for the next node per the layout rules
    /// (§4.C) and reserves it, all under one lock so no other node can be
    /// placed at the same coordinate in between.
    pub fn position_next(&self, input: PositionInput) -> layout::PositionResult {
        let mut inner = self.store.lock();
        layout::position_vert(
            &inner.nodes,
            &mut inner.used_coords,
            &mut inner.max_a,
            &mut inner.max_b,
            &input,
        )
    }

    /// Inserts a node at the next dense index (I1). Returns the assigned index.
    pub fn insert_node(&self, build: impl FnOnce(NodeIndex) -> Node) -> NodeIndex {
        let mut inner = self.store.lock();
        let idx = inner.nodes.len();
        let node = build(idx);
        debug_assert_eq!(node.index, idx);
        inner.nodes.push(node);
        idx
    }

    pub fn edge_exists(&self, pair: (NodeIndex, NodeIndex)) -> bool {
        self.store.lock().edges.contains_key(&pair)
    }

    /// Adds an edge and updates both endpoints' neighbour sets (I3).
    pub fn add_edge(&self, source: NodeIndex, target: NodeIndex, class: EdgeClass) {
        let mut inner = self.store.lock();
        if inner.edges.contains_key(&(source, target)) {
            return;
        }
        inner.edges.insert(
            (source, target),
            Edge {
                source,
                target,
                class,
                chained_weight: 0,
            },
        );
        if let Some(n) = inner.nodes.get_mut(source) {
            n.outgoing.insert(target);
        }
        if let Some(n) = inner.nodes.get_mut(target) {
            n.incoming.insert(source);
        }
    }

    /// `get_edge_create`: ensures an edge exists between two nodes, creating
    /// a generic `Old`-class edge (a chained repeat, not a fresh transition)
    /// if none is present yet.
    pub fn get_edge_create(&self, source: NodeIndex, target: NodeIndex) {
        if !self.edge_exists((source, target)) {
            self.add_edge(source, target, EdgeClass::Old);
        }
    }

    /// Connects the last instruction of `source_block` to the first
    /// instruction of `target_block` for this thread, iff both already have
    /// nodes. Used by the deferred-edge pass (§4.H).
    pub fn insert_edge_between_bbs(
        &self,
        source_block: &[Arc<Instruction>],
        target_block: &[Arc<Instruction>],
    ) -> bool {
        let (Some(last), Some(first)) = (source_block.last(), target_block.first()) else {
            return false;
        };
        let (Some(src_idx), Some(tgt_idx)) = (
            last.node_for_thread(self.thread_id),
            first.node_for_thread(self.thread_id),
        ) else {
            return false;
        };
        self.get_edge_create(src_idx, tgt_idx);
        true
    }

    pub fn outgoing_address_match(&self, from: NodeIndex, address: Address) -> bool {
        let inner = self.store.lock();
        let Some(node) = inner.nodes.get(from) else {
            return false;
        };
        node.outgoing
            .iter()
            .any(|&o| inner.nodes[o].address() == address)
    }

    pub fn animation(&self) -> parking_lot::MutexGuard<'_, AnimationState> {
        self.animation.lock()
    }

    pub fn highlights(&self) -> parking_lot::MutexGuard<'_, HighlightState> {
        self.highlights.lock()
    }

    pub fn args_queue(&self) -> parking_lot::MutexGuard<'_, VecDeque<FloatingExtern>> {
        self.args.lock()
    }

    pub fn set_final_node(&self, idx: NodeIndex) {
        *self.final_node.lock() = Some(idx);
    }

    pub fn final_node(&self) -> Option<NodeIndex> {
        *self.final_node.lock()
    }

    /// Snapshot of all edges, for read-only consumers (the GUI server) that
    /// need the full graph rather than per-node neighbour sets.
    pub fn snapshot_edges(&self) -> Vec<Edge> {
        self.store.lock().edges.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_node(idx: NodeIndex, addr: Address) -> Node {
        Node {
            index: idx,
            kind: NodeKind::External { address: addr },
            vcoord: VCoord::default(),
            execution_count: 1,
            calls: 0,
            module: None,
            external: true,
            parent: None,
            child_externs: 0,
            func_args: Vec::new(),
            outgoing: HashSet::new(),
            incoming: HashSet::new(),
        }
    }

    #[test]
    fn nodes_assigned_densely() {
        let g = PerThreadGraph::new(1);
        let i0 = g.insert_node(|idx| dummy_node(idx, 0x1000));
        let i1 = g.insert_node(|idx| dummy_node(idx, 0x1004));
        assert_eq!(i0, 0);
        assert_eq!(i1, 1);
        assert_eq!(g.num_nodes(), 2);
    }

    #[test]
    fn add_edge_updates_both_neighbour_sets() {
        let g = PerThreadGraph::new(1);
        let a = g.insert_node(|idx| dummy_node(idx, 0x1000));
        let b = g.insert_node(|idx| dummy_node(idx, 0x1004));
        g.add_edge(a, b, EdgeClass::New);
        assert!(g.edge_exists((a, b)));
        g.with_node(a, |n| assert!(n.outgoing.contains(&b)));
        g.with_node(b, |n| assert!(n.incoming.contains(&a)));
    }

    #[test]
    fn add_edge_is_idempotent() {
        let g = PerThreadGraph::new(1);
        let a = g.insert_node(|idx| dummy_node(idx, 0x1000));
        let b = g.insert_node(|idx| dummy_node(idx, 0x1004));
        g.add_edge(a, b, EdgeClass::New);
        g.add_edge(a, b, EdgeClass::Old);
        let inner = g.store.lock();
        assert!(matches!(
            inner.edges.get(&(a, b)).unwrap().class,
            EdgeClass::New
        ));
    }
}
