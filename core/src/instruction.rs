//! Static data model shared across all threads (spec §3): instructions,
//! modules and extern descriptors. Instances live in [`crate::process::ProcessData`]
//! and are reached through `Arc` so that per-thread graphs can hold a
//! reference without copying.

use crate::types::{Address, BlockId, NodeIndex, ThreadId};
use parking_lot::RwLock;
use std::collections::HashMap;

/// The control-transfer shape of an instruction, decoded once by the
/// disassembler and never re-derived by a handler (design note, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Call,
    Jump,
    Return,
    NonFlow,
}

/// An instruction at a fixed address. Immutable once disassembled except for
/// `thread_node`, which records where each thread first turned this
/// instruction into a graph node (I2).
///
/// The source (rgat) protects `threadvertIdx` with the whole disassembly
/// table's write lock; here each instruction owns a narrower per-instruction
/// lock instead, which is strictly less contention while preserving the same
/// "read lock to look up, write lock to insert" shape the design notes call
/// for. See DESIGN.md for the rationale.
#[derive(Debug)]
pub struct Instruction {
    pub address: Address,
    pub length: u8,
    pub op_class: OpClass,
    /// Target address if this is a conditional jump whose condition is taken;
    /// `None` for unconditional or non-branching instructions.
    pub cond_taken_target: Option<Address>,
    pub mnemonic: String,
    pub operands: String,
    /// (block-addr, block-id) pairs this instruction appears under -- lets
    /// self-modifying code track every block a given byte range participated in.
    mutations: RwLock<Vec<(Address, BlockId)>>,
    thread_node: RwLock<HashMap<ThreadId, NodeIndex>>,
}

impl Instruction {
    pub fn new(
        address: Address,
        length: u8,
        op_class: OpClass,
        cond_taken_target: Option<Address>,
        mnemonic: String,
        operands: String,
    ) -> Self {
        Self {
            address,
            length,
            op_class,
            cond_taken_target,
            mnemonic,
            operands,
            mutations: RwLock::new(Vec::new()),
            thread_node: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_conditional(&self) -> bool {
        self.cond_taken_target.is_some()
    }

    pub fn record_mutation(&self, block_addr: Address, block_id: BlockId) {
        let mut m = self.mutations.write();
        if !m.iter().any(|&(a, b)| a == block_addr && b == block_id) {
            m.push((block_addr, block_id));
        }
    }

    pub fn mutations(&self) -> Vec<(Address, BlockId)> {
        self.mutations.read().clone()
    }

    /// I2: exactly one node per (instruction, thread) -- returns the existing
    /// node if this thread has already executed the instruction.
    pub fn node_for_thread(&self, thread: ThreadId) -> Option<NodeIndex> {
        self.thread_node.read().get(&thread).copied()
    }

    pub fn bind_thread_node(&self, thread: ThreadId, node: NodeIndex) {
        self.thread_node.write().insert(thread, node);
    }
}

/// Status of a loaded memory region w.r.t. instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Instrumented,
    Uninstrumented,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Module {
    pub start: Address,
    pub end: Address,
    pub status: ModuleStatus,
    pub path: String,
}

impl Module {
    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.end
    }
}

/// A symbol harvested by the binary loader (ambient, §4.K); attached to an
/// [`ExternDescriptor`] when its address matches an extern target.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub address: Address,
    pub size: u64,
    pub name: String,
}

/// Describes an uninstrumented call target (spec §3). `thread_callers` is
/// mutated from worker tasks concurrently; guarded by its own lock per the
/// open correctness note in §9 rather than the whole extern table's lock.
#[derive(Debug)]
pub struct ExternDescriptor {
    pub module: usize,
    pub symbol: RwLock<Option<String>>,
    thread_callers: RwLock<HashMap<ThreadId, Vec<(NodeIndex, NodeIndex)>>>,
}

impl ExternDescriptor {
    pub fn new(module: usize, symbol: Option<String>) -> Self {
        Self {
            module,
            symbol: RwLock::new(symbol),
            thread_callers: RwLock::new(HashMap::new()),
        }
    }

    /// I6: looks for an existing (caller, target) edge for this thread.
    pub fn find_caller_edge(&self, thread: ThreadId, caller: NodeIndex) -> Option<NodeIndex> {
        self.thread_callers
            .read()
            .get(&thread)
            .and_then(|edges| edges.iter().find(|&&(c, _)| c == caller).map(|&(_, t)| t))
    }

    pub fn register_caller_edge(&self, thread: ThreadId, caller: NodeIndex, target: NodeIndex) {
        self.thread_callers
            .write()
            .entry(thread)
            .or_default()
            .push((caller, target));
    }

    pub fn callers_for_thread(&self, thread: ThreadId) -> Vec<(NodeIndex, NodeIndex)> {
        self.thread_callers
            .read()
            .get(&thread)
            .cloned()
            .unwrap_or_default()
    }
}
