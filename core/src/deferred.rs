//! Deferred Work Queues (spec §4.H): edges and block-repeat counts that
//! named a block before that block had been seen. Resolved periodically and
//! drained (up to 10 passes) on shutdown. Worker-local; no locking needed.

use crate::graph::PerThreadGraph;
use crate::process::ProcessData;
use crate::signals::CancelFlag;
use crate::types::{Address, BlockId, ThreadId};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct PendingEdge {
    pub src_addr: Address,
    pub src_id: BlockId,
    pub tgt_addr: Address,
    pub tgt_id: BlockId,
}

#[derive(Debug, Clone)]
pub struct BlockRepeat {
    pub block_addr: Address,
    pub block_id: BlockId,
    pub ins_count: u32,
    pub total_execs: u64,
    pub targets: Vec<(Address, BlockId)>,
}

#[derive(Default)]
pub struct DeferredQueues {
    pending_edges: Vec<PendingEdge>,
    block_repeats: Vec<BlockRepeat>,
}

impl DeferredQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_pending_edge(&mut self, edge: PendingEdge) {
        self.pending_edges.push(edge);
    }

    pub fn push_block_repeat(&mut self, repeat: BlockRepeat) {
        self.block_repeats.push(repeat);
    }

    pub fn is_empty(&self) -> bool {
        self.pending_edges.is_empty() && self.block_repeats.is_empty()
    }

    pub fn pending_edge_count(&self) -> usize {
        self.pending_edges.len()
    }

    /// Resolves as many queued pending edges as both endpoint blocks now
    /// allow; unresolved entries stay queued.
    pub fn resolve_pending_edges(&mut self, process: &ProcessData, graph: &PerThreadGraph) {
        self.pending_edges.retain(|e| {
            let (Some(src), Some(tgt)) = (
                process.block(e.src_addr, e.src_id),
                process.block(e.tgt_addr, e.tgt_id),
            ) else {
                return true;
            };
            let resolved = graph.insert_edge_between_bbs(&src, &tgt);
            if resolved {
                trace!(src = e.src_addr, tgt = e.tgt_addr, "pending edge resolved");
            }
            !resolved
        });
    }

    /// Resolves as many queued block-repeat entries as the block (and its
    /// targets) now allow. A block whose first/last instructions have no
    /// node yet for this thread is left queued untouched.
    pub fn resolve_block_repeats(
        &mut self,
        process: &ProcessData,
        graph: &PerThreadGraph,
        thread: ThreadId,
    ) {
        self.block_repeats.retain_mut(|br| {
            let Some(block) = process.block(br.block_addr, br.block_id) else {
                return true;
            };
            let (Some(first), Some(last)) = (block.first(), block.last()) else {
                return true;
            };
            let (Some(_first_idx), Some(last_idx)) = (
                first.node_for_thread(thread),
                last.node_for_thread(thread),
            ) else {
                return true;
            };

            for ins in block.iter().take(br.ins_count as usize) {
                if let Some(idx) = ins.node_for_thread(thread) {
                    graph.with_node_mut(idx, |n| n.execution_count += br.total_execs);
                }
            }

            br.targets.retain(|&(taddr, tid)| {
                if graph.outgoing_address_match(last_idx, taddr) {
                    return false;
                }
                let Some(tblock) = process.block(taddr, tid) else {
                    return true;
                };
                let Some(tfirst) = tblock.first() else {
                    return true;
                };
                let Some(tfirst_idx) = tfirst.node_for_thread(thread) else {
                    return true;
                };
                graph.get_edge_create(last_idx, tfirst_idx);
                false
            });

            !br.targets.is_empty()
        });
    }

    /// Runs both resolution passes repeatedly (bounded, per §4.H/§5) until
    /// either nothing is left, the pass budget is exhausted, or `cancel`
    /// fires. Used at shutdown (E4), where the worker must drain what it can
    /// before exit, but must still honor a die flag mid-drain.
    pub fn drain(
        &mut self,
        process: &ProcessData,
        graph: &PerThreadGraph,
        thread: ThreadId,
        max_passes: u32,
        cancel: &CancelFlag,
    ) {
        for _ in 0..max_passes {
            if self.is_empty() || cancel.is_cancelled() {
                break;
            }
            self.resolve_pending_edges(process, graph);
            self.resolve_block_repeats(process, graph, thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PerThreadGraph;
    use crate::instruction::{Instruction, OpClass};
    use std::sync::Arc;

    fn block(addrs: &[Address]) -> Vec<Arc<Instruction>> {
        addrs
            .iter()
            .map(|&a| Arc::new(Instruction::new(a, 4, OpClass::NonFlow, None, "nop".into(), "".into())))
            .collect()
    }

    #[test]
    fn pending_edge_stays_queued_until_both_blocks_known() {
        let process = ProcessData::new();
        let graph = PerThreadGraph::new(1);
        let mut deferred = DeferredQueues::new();
        deferred.push_pending_edge(PendingEdge {
            src_addr: 0x405000,
            src_id: 1,
            tgt_addr: 0x405100,
            tgt_id: 1,
        });

        deferred.resolve_pending_edges(&process, &graph);
        assert_eq!(deferred.pending_edge_count(), 1);

        let src_block = block(&[0x405000, 0x405004]);
        let tgt_block = block(&[0x405100]);
        for ins in src_block.iter().chain(tgt_block.iter()) {
            let idx = graph.insert_node(|idx| crate::graph::Node {
                index: idx,
                kind: crate::graph::NodeKind::Instruction(ins.clone()),
                vcoord: Default::default(),
                execution_count: 1,
                calls: 0,
                module: Some(0),
                external: false,
                parent: None,
                child_externs: 0,
                func_args: Vec::new(),
                outgoing: Default::default(),
                incoming: Default::default(),
            });
            ins.bind_thread_node(1, idx);
        }
        process.insert_block(0x405000, 1, src_block.clone());
        process.insert_block(0x405100, 1, tgt_block.clone());

        deferred.resolve_pending_edges(&process, &graph);
        assert_eq!(deferred.pending_edge_count(), 0);

        let src_last = src_block.last().unwrap().node_for_thread(1).unwrap();
        let tgt_first = tgt_block.first().unwrap().node_for_thread(1).unwrap();
        assert!(graph.edge_exists((src_last, tgt_first)));
    }

    #[test]
    fn drain_stops_as_soon_as_cancel_fires() {
        use crate::signals::CancelFlag;

        let process = ProcessData::new();
        let graph = PerThreadGraph::new(1);
        let mut deferred = DeferredQueues::new();
        deferred.push_pending_edge(PendingEdge {
            src_addr: 0x405000,
            src_id: 1,
            tgt_addr: 0x405100,
            tgt_id: 1,
        });

        let cancel = CancelFlag::new();
        cancel.cancel();

        // Never resolvable (no blocks registered), so a full drain would
        // otherwise burn every one of its passes -- cancellation should cut
        // it short at the very first pass boundary either way.
        deferred.drain(&process, &graph, 1, 10, &cancel);
        assert_eq!(deferred.pending_edge_count(), 1);
    }
}
