//! External-Call Binder (spec §4.E): `run_external` binds a call/jump whose
//! target lands in uninstrumented code to a reusable external node.

use crate::graph::{EdgeClass, Node, NodeKind, PerThreadGraph, VCoord};
use crate::instruction::ModuleStatus;
use crate::process::ProcessData;
use crate::types::{Address, NodeIndex, ThreadId};
use tracing::{debug, trace};

pub struct ExternBindConfig {
    pub retry_attempts: u32,
    pub retry_interval: std::time::Duration,
}

/// Binds `last_vert_id`'s outgoing transition to `target_address`.
///
/// Preconditions (spec): two independent failure checks, either of which
/// returns `None` without mutating anything -- `last_vert_id` must name an
/// instrumented node (never chain external→external), and that node's own
/// module must still be `Instrumented` (a caller whose module has since
/// been unloaded or marked uninstrumented can't originate a fresh bind).
pub async fn run_external(
    graph: &PerThreadGraph,
    process: &ProcessData,
    thread: ThreadId,
    last_vert_id: NodeIndex,
    target_address: Address,
    repeats: u64,
    config: &ExternBindConfig,
) -> Option<NodeIndex> {
    let (caller_is_external, caller_address) =
        graph.with_node(last_vert_id, |n| (n.external, n.address()))?;
    if caller_is_external {
        return None;
    }
    if process.module_status(caller_address) != ModuleStatus::Instrumented {
        return None;
    }

    // A descriptor that never resolves still gets bound as external (E1
    // degrades to "no symbol name" rather than dropping the event).
    let descriptor = process
        .extern_at_retry(target_address, config.retry_attempts, config.retry_interval)
        .await;

    if let Some(ref descriptor) = descriptor {
        if let Some(existing_target) = descriptor.find_caller_edge(thread, last_vert_id) {
            graph.with_node_mut(existing_target, |n| {
                n.execution_count += repeats;
                n.calls += repeats;
            });
            trace!(target_address, "reused existing external edge");
            return Some(existing_target);
        }
    }

    let siblings = graph
        .with_node(last_vert_id, |n| n.child_externs)
        .unwrap_or(0) as i64;
    let (la, lb, lb_mod) = graph
        .vcoord(last_vert_id)
        .map(|c| (c.a, c.b, c.b_mod))
        .unwrap_or_default();
    let coord = VCoord {
        a: la + 2 * siblings + 5,
        b: lb + siblings + 5,
        b_mod: lb_mod,
    };

    let module = descriptor.as_ref().map(|d| d.module);
    let target_idx = graph.insert_node(|idx| Node {
        index: idx,
        kind: NodeKind::External {
            address: target_address,
        },
        vcoord: coord,
        execution_count: repeats,
        calls: repeats,
        module,
        external: true,
        parent: Some(last_vert_id),
        child_externs: 0,
        func_args: Vec::new(),
        outgoing: Default::default(),
        incoming: Default::default(),
    });

    if let Some(descriptor) = descriptor {
        descriptor.register_caller_edge(thread, last_vert_id, target_idx);
    }

    graph.add_edge(last_vert_id, target_idx, EdgeClass::Library);
    graph.with_node_mut(last_vert_id, |n| n.child_externs += 1);
    graph.highlights().extern_list.push(target_idx);

    debug!(target_address, target_idx, "bound new external node");
    Some(target_idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Instruction, Module, OpClass};
    use std::sync::Arc;

    fn instrumented_node(idx: NodeIndex) -> Node {
        Node {
            index: idx,
            kind: NodeKind::Instruction(Arc::new(Instruction::new(
                0x1000,
                4,
                OpClass::Call,
                None,
                "call".into(),
                "".into(),
            ))),
            vcoord: VCoord { a: 0, b: 0, b_mod: 0 },
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

    #[tokio::test]
    async fn binds_new_external_and_reuses_on_repeat() {
        let graph = PerThreadGraph::new(1);
        let process = ProcessData::new();
        process.register_module(Module {
            start: 0x1000,
            end: 0x2000,
            status: ModuleStatus::Instrumented,
            path: "test".into(),
        });
        let caller = graph.insert_node(instrumented_node);
        let config = ExternBindConfig {
            retry_attempts: 1,
            retry_interval: std::time::Duration::from_millis(1),
        };

        let first = run_external(&graph, &process, 1, caller, 0x7f000000, 1, &config)
            .await
            .unwrap();
        assert!(graph.edge_exists((caller, first)));

        let second = run_external(&graph, &process, 1, caller, 0x7f000000, 3, &config)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(graph.num_nodes(), 2);
        graph.with_node(second, |n| assert_eq!(n.execution_count, 4));
    }

    #[tokio::test]
    async fn refuses_to_chain_external_to_external() {
        let graph = PerThreadGraph::new(1);
        let process = ProcessData::new();
        let external = graph.insert_node(|idx| Node {
            index: idx,
            kind: NodeKind::External { address: 0x8000 },
            vcoord: VCoord::default(),
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
        let config = ExternBindConfig {
            retry_attempts: 1,
            retry_interval: std::time::Duration::from_millis(1),
        };
        let result = run_external(&graph, &process, 1, external, 0x9000, 1, &config).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn refuses_to_bind_when_callers_module_is_uninstrumented() {
        let graph = PerThreadGraph::new(1);
        let process = ProcessData::new();
        process.register_module(Module {
            start: 0x1000,
            end: 0x2000,
            status: ModuleStatus::Uninstrumented,
            path: "test".into(),
        });
        let caller = graph.insert_node(instrumented_node);
        let config = ExternBindConfig {
            retry_attempts: 1,
            retry_interval: std::time::Duration::from_millis(1),
        };
        let result = run_external(&graph, &process, 1, caller, 0x7f000000, 1, &config).await;
        assert!(result.is_none());
    }
}
