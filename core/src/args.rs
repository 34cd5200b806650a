//! Argument Collector (spec §4.F): buffers `ARG` fragments into call-site
//! argument lists and dispatches them once the owning extern is known.
//! Worker-local; no locking needed on the collector itself.

use crate::graph::{ArgList, ArgRecord, FloatingExtern, PerThreadGraph};
use crate::process::ProcessData;
use crate::types::{Address, NodeIndex, ThreadId};
use std::collections::HashMap;
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgEncoding {
    Raw,
    Base64,
}

pub struct ArgCollector {
    in_progress: ArgList,
    /// `funcpc -> returnpc -> completed arg-lists awaiting dispatch`.
    pending: HashMap<Address, HashMap<Address, Vec<ArgList>>>,
}

impl Default for ArgCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ArgCollector {
    pub fn new() -> Self {
        Self {
            in_progress: Vec::new(),
            pending: HashMap::new(),
        }
    }

    /// Handles one `ARG` record. `more` is `true` for the `M` marker,
    /// `false` for `E`. Decodes base64 payloads opaquely into the stored
    /// string (the decoded bytes are not otherwise interpreted).
    pub fn handle_arg(
        &mut self,
        argpos: u32,
        funcpc: Address,
        returnpc: Address,
        more: bool,
        encoding: ArgEncoding,
        payload: &str,
    ) {
        let value = match encoding {
            ArgEncoding::Raw => payload.to_string(),
            ArgEncoding::Base64 => match base64_decode(payload) {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(reason) => {
                    warn!(argpos, funcpc, reason, "malformed base64 arg payload");
                    return;
                }
            },
        };

        self.in_progress.push(ArgRecord {
            position: argpos,
            value,
        });

        if !more {
            let list = std::mem::take(&mut self.in_progress);
            self.pending
                .entry(funcpc)
                .or_default()
                .entry(returnpc)
                .or_default()
                .push(list);
        }
    }

    /// Drains every pending arg-list whose owning extern is now known,
    /// feeding each into the target node's `func_args` (bounded) and
    /// always into the graph's floating-extern queue for UI consumption.
    pub fn process_new_args(
        &mut self,
        process: &ProcessData,
        graph: &PerThreadGraph,
        thread: ThreadId,
        arg_storage_capacity: usize,
    ) {
        let mut drained_funcs = Vec::new();

        for (&funcpc, by_return) in self.pending.iter_mut() {
            let Some(descriptor) = process.extern_at(funcpc) else {
                continue;
            };
            let callers = descriptor.callers_for_thread(thread);
            if callers.is_empty() {
                continue;
            }

            let mut drained_returns = Vec::new();
            for (&returnpc, lists) in by_return.iter_mut() {
                // Only dispatch to the caller whose own return address matches
                // this arg list's `returnpc` -- a function with more than one
                // call site registers more than one entry in `callers`, and an
                // unfiltered dispatch would attach the wrong call's arguments
                // to every call site's external node.
                let matching_callers: Vec<(NodeIndex, NodeIndex)> = callers
                    .iter()
                    .copied()
                    .filter(|&(caller_idx, _)| {
                        graph
                            .with_node(caller_idx, |n| {
                                n.instruction().map(|ins| ins.address + ins.length as Address)
                            })
                            .flatten()
                            == Some(returnpc)
                    })
                    .collect();

                if matching_callers.is_empty() {
                    continue;
                }

                while let Some(args) = lists.pop() {
                    for &(caller_idx, target_idx) in &matching_callers {
                        graph.with_node_mut(target_idx, |n| {
                            if n.func_args.len() < arg_storage_capacity {
                                n.func_args.push(args.clone());
                            }
                        });

                        let path = descriptor
                            .symbol
                            .read()
                            .clone()
                            .unwrap_or_else(|| format!("0x{funcpc:x}"));

                        graph.args_queue().push_back(FloatingExtern {
                            edge: (caller_idx, target_idx),
                            node: target_idx,
                            caller_address: returnpc,
                            extern_path: path,
                            args: args.clone(),
                        });
                        trace!(funcpc, returnpc, target_idx, "dispatched argument list");
                    }
                }
                drained_returns.push(returnpc);
            }
            for returnpc in drained_returns {
                by_return.remove(&returnpc);
            }
            if by_return.is_empty() {
                drained_funcs.push(funcpc);
            }
        }

        for funcpc in drained_funcs {
            self.pending.remove(&funcpc);
        }
    }
}

fn base64_decode(input: &str) -> Result<Vec<u8>, String> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(input.trim())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::PerThreadGraph;
    use crate::instruction::{Instruction, OpClass};
    use crate::process::ProcessData;
    use std::sync::Arc;

    fn caller_node(idx: crate::types::NodeIndex, call_addr: Address) -> crate::graph::Node {
        crate::graph::Node {
            index: idx,
            kind: crate::graph::NodeKind::Instruction(Arc::new(Instruction::new(
                call_addr,
                4,
                OpClass::Call,
                None,
                "call".into(),
                "".into(),
            ))),
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
        }
    }

    #[test]
    fn m_then_e_produces_single_atomic_capture() {
        let mut collector = ArgCollector::new();
        collector.handle_arg(0, 0x401500, 0x401200, true, ArgEncoding::Raw, "foo");
        collector.handle_arg(1, 0x401500, 0x401200, false, ArgEncoding::Raw, "bar");

        let lists = &collector.pending[&0x401500][&0x401200];
        assert_eq!(lists.len(), 1);
        assert_eq!(lists[0].len(), 2);
        assert_eq!(lists[0][0].value, "foo");
        assert_eq!(lists[0][1].value, "bar");
    }

    #[test]
    fn dispatch_reaches_target_funcargs_and_floating_queue() {
        let process = ProcessData::new();
        let graph = PerThreadGraph::new(1);
        // Call instruction at 0x4011fc, 4 bytes long, so its return address
        // (0x401200) matches the ARG records' `returnpc` below.
        let caller = graph.insert_node(|idx| caller_node(idx, 0x4011fc));
        let target = graph.insert_node(|idx| crate::graph::Node {
            index: idx,
            kind: crate::graph::NodeKind::External { address: 0x401500 },
            vcoord: Default::default(),
            execution_count: 1,
            calls: 0,
            module: None,
            external: true,
            parent: None,
            child_externs: 0,
            func_args: Vec::new(),
            outgoing: Default::default(),
            incoming: Default::default(),
        });

        let descriptor = process.extern_entry(0x401500, 0);
        descriptor.register_caller_edge(1, caller, target);

        let mut collector = ArgCollector::new();
        collector.handle_arg(0, 0x401500, 0x401200, true, ArgEncoding::Raw, "foo");
        collector.handle_arg(1, 0x401500, 0x401200, false, ArgEncoding::Raw, "bar");
        collector.process_new_args(&process, &graph, 1, 8);

        graph.with_node(target, |n| assert_eq!(n.func_args.len(), 1));
        assert_eq!(graph.args_queue().len(), 1);
        assert!(collector.pending.is_empty());
    }

    #[test]
    fn dispatch_only_reaches_caller_whose_returnpc_matches() {
        let process = ProcessData::new();
        let graph = PerThreadGraph::new(1);

        // Two distinct call sites for the same callee (0x401500), each
        // bound to its own external node, as `run_external` does.
        let caller_a = graph.insert_node(|idx| caller_node(idx, 0x4011fc));
        let target_a = graph.insert_node(|idx| crate::graph::Node {
            index: idx,
            kind: crate::graph::NodeKind::External { address: 0x401500 },
            vcoord: Default::default(),
            execution_count: 1,
            calls: 0,
            module: None,
            external: true,
            parent: None,
            child_externs: 0,
            func_args: Vec::new(),
            outgoing: Default::default(),
            incoming: Default::default(),
        });

        let caller_b = graph.insert_node(|idx| caller_node(idx, 0x402000));
        let target_b = graph.insert_node(|idx| crate::graph::Node {
            index: idx,
            kind: crate::graph::NodeKind::External { address: 0x401500 },
            vcoord: Default::default(),
            execution_count: 1,
            calls: 0,
            module: None,
            external: true,
            parent: None,
            child_externs: 0,
            func_args: Vec::new(),
            outgoing: Default::default(),
            incoming: Default::default(),
        });

        let descriptor = process.extern_entry(0x401500, 0);
        descriptor.register_caller_edge(1, caller_a, target_a);
        descriptor.register_caller_edge(1, caller_b, target_b);

        // Arg list's returnpc (0x401200) only matches caller_a's return
        // address (0x4011fc + 4), not caller_b's (0x402000 + 4).
        let mut collector = ArgCollector::new();
        collector.handle_arg(0, 0x401500, 0x401200, true, ArgEncoding::Raw, "foo");
        collector.handle_arg(1, 0x401500, 0x401200, false, ArgEncoding::Raw, "bar");
        collector.process_new_args(&process, &graph, 1, 8);

        graph.with_node(target_a, |n| assert_eq!(n.func_args.len(), 1));
        graph.with_node(target_b, |n| assert_eq!(n.func_args.len(), 0));
        assert_eq!(graph.args_queue().len(), 1);
        assert!(collector.pending.is_empty());
    }
}
