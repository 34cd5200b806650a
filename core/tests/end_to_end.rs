//! End-to-end ingestion scenarios driven entirely through `Worker::run`
//! against an in-memory byte slice, the same way a tracer's TCP stream is
//! consumed in production.

use std::sync::Arc;
use std::time::Duration;
use tracegraph_core::graph::NodeKind;
use tracegraph_core::instruction::{Instruction, Module, ModuleStatus, OpClass};
use tracegraph_core::{PerThreadGraph, ProcessData, Worker, WorkerConfig};

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        lookup_retry_attempts: 1,
        address_not_found_sleep: Duration::from_millis(1),
        deferred_work_period: Duration::from_millis(0),
        ..WorkerConfig::default()
    }
}

fn instrumented_module(process: &ProcessData, start: u64, end: u64) {
    process.register_module(Module {
        start,
        end,
        status: ModuleStatus::Instrumented,
        path: "test".into(),
    });
}

async fn run_trace(process: Arc<ProcessData>, graph: Arc<PerThreadGraph>, wire: &str) {
    let mut worker = Worker::new(1, process, graph, fast_config());
    worker.run(format!("{wire}\n").as_bytes()).await;
}

#[tokio::test]
async fn single_call_to_external_binds_library_edge() {
    let process = Arc::new(ProcessData::new());
    instrumented_module(&process, 0x400000, 0x410000);
    process.insert_instruction(Arc::new(Instruction::new(
        0x400100,
        4,
        OpClass::Call,
        None,
        "call".into(),
        "0x7ffa0000".into(),
    )));
    let graph = Arc::new(PerThreadGraph::new(1));

    run_trace(
        process,
        graph.clone(),
        "j0x400100,0x7ffa0000,0x100000001@j0x400100,0,0x100000001",
    )
    .await;

    assert_eq!(graph.num_nodes(), 2);
    assert!(graph.edge_exists((0, 1)));
    graph.with_node(1, |n| assert!(matches!(n.kind, NodeKind::External { address: 0x7ffa0000 })));
    assert_eq!(graph.highlights().extern_list.len(), 1);
    graph.with_node(0, |n| assert_eq!(n.execution_count, 2));
}

#[tokio::test]
async fn loop_of_three_iterations_scales_execution_count() {
    let process = Arc::new(ProcessData::new());
    instrumented_module(&process, 0x401000, 0x402000);
    process.insert_instruction(Arc::new(Instruction::new(0x401000, 4, OpClass::NonFlow, None, "nop".into(), "".into())));
    process.insert_instruction(Arc::new(Instruction::new(0x401100, 4, OpClass::NonFlow, None, "nop".into(), "".into())));
    let graph = Arc::new(PerThreadGraph::new(1));

    run_trace(
        process,
        graph.clone(),
        "\u{25C6}S3@j0x401000,0x401100,0x200000001@j0x401100,0,0x200000001@\u{25C6}E",
    )
    .await;

    assert_eq!(graph.num_nodes(), 2);
    graph.with_node(0, |n| assert_eq!(n.execution_count, 3));
    graph.with_node(1, |n| assert_eq!(n.execution_count, 3));
    assert_eq!(graph.animation().loop_state_list, vec![(1, 3)]);
}

#[tokio::test]
async fn argument_fragments_attach_to_the_external_node_once_bound() {
    let process = Arc::new(ProcessData::new());
    instrumented_module(&process, 0x401000, 0x402000);
    process.insert_instruction(Arc::new(Instruction::new(
        0x401180,
        4,
        OpClass::Call,
        None,
        "call".into(),
        "0x401500".into(),
    )));
    let graph = Arc::new(PerThreadGraph::new(1));

    // The call executes first, which binds the external node and registers
    // its caller edge; the argument fragments that follow then find a live
    // extern descriptor with a registered caller to dispatch into.
    run_trace(
        process,
        graph.clone(),
        "j0x401180,0x401500,0x100000001@ARG 0,0x401500,0x401184,M,R,foo@ARG 1,0x401500,0x401184,E,R,bar",
    )
    .await;

    assert_eq!(graph.num_nodes(), 2);
    graph.with_node(1, |n| {
        assert_eq!(n.func_args.len(), 1);
        assert_eq!(n.func_args[0][0].value, "foo");
        assert_eq!(n.func_args[0][1].value, "bar");
    });
    assert_eq!(graph.args_queue().len(), 1);
}

#[tokio::test]
async fn return_repositions_near_caller() {
    use tracegraph_core::layout::{RETURNA_OFFSET, RETURNB_OFFSET};

    let process = Arc::new(ProcessData::new());
    instrumented_module(&process, 0x402000, 0x404000);
    // Caller: a single-instruction block ending in a call, returning to 0x402005.
    process.insert_instruction(Arc::new(Instruction::new(
        0x402000,
        5,
        OpClass::Call,
        None,
        "call".into(),
        "0x403000".into(),
    )));
    // Callee: a single-instruction block that returns.
    process.insert_instruction(Arc::new(Instruction::new(0x403000, 1, OpClass::Return, None, "ret".into(), "".into())));
    // Instruction after the call, where execution resumes post-return.
    process.insert_instruction(Arc::new(Instruction::new(0x402005, 1, OpClass::NonFlow, None, "nop".into(), "".into())));
    let graph = Arc::new(PerThreadGraph::new(1));

    run_trace(
        process,
        graph.clone(),
        "j0x402000,0x403000,0x100000001@j0x403000,0x402005,0x200000001@j0x402005,0,0x300000001",
    )
    .await;

    assert_eq!(graph.num_nodes(), 3);
    let caller_coord = graph.vcoord(0).unwrap();
    let return_coord = graph.vcoord(2).unwrap();
    assert_eq!(return_coord.a, caller_coord.a + RETURNA_OFFSET);
    assert_eq!(return_coord.b, caller_coord.b + RETURNB_OFFSET);
}

#[tokio::test]
async fn exception_mid_block_marks_third_node_and_highlights_it() {
    let process = Arc::new(ProcessData::new());
    instrumented_module(&process, 0x404000, 0x405000);
    for addr in [0x404000u64, 0x404004, 0x404008] {
        process.insert_instruction(Arc::new(Instruction::new(addr, 4, OpClass::NonFlow, None, "nop".into(), "".into())));
    }
    let graph = Arc::new(PerThreadGraph::new(1));

    run_trace(
        process,
        graph.clone(),
        "j0x404000,0,0x100000003@EXC ,0x404008,0xC0000005,0x0",
    )
    .await;

    assert_eq!(graph.num_nodes(), 3);
    assert_eq!(graph.highlights().exception_set, vec![2]);
}

#[tokio::test]
async fn exception_mid_block_stops_at_the_actual_fault_not_the_cached_blocks_end() {
    let process = Arc::new(ProcessData::new());
    instrumented_module(&process, 0x406000, 0x407000);
    for addr in [0x406000u64, 0x406004, 0x406008] {
        process.insert_instruction(Arc::new(Instruction::new(addr, 4, OpClass::NonFlow, None, "nop".into(), "".into())));
    }
    let graph = Arc::new(PerThreadGraph::new(1));

    // The block is fully resolved (and cached with all 3 instructions) by a
    // normal, non-faulting tag first. The fault then lands on the *middle*
    // instruction of that already-larger cached block -- the highlighted
    // node must be the one that actually faulted, not the cached block's
    // last instruction.
    run_trace(
        process,
        graph.clone(),
        "j0x406000,0,0x100000003@EXC ,0x406004,0xC0000005,0x0",
    )
    .await;

    assert_eq!(graph.num_nodes(), 3);
    assert_eq!(graph.highlights().exception_set, vec![1]);
}

#[tokio::test]
async fn deferred_edge_resolves_once_both_blocks_are_seen() {
    let process = Arc::new(ProcessData::new());
    instrumented_module(&process, 0x405000, 0x406000);
    process.insert_instruction(Arc::new(Instruction::new(0x405000, 4, OpClass::NonFlow, None, "nop".into(), "".into())));
    process.insert_instruction(Arc::new(Instruction::new(0x405100, 4, OpClass::NonFlow, None, "nop".into(), "".into())));
    let graph = Arc::new(PerThreadGraph::new(1));

    run_trace(
        process.clone(),
        graph.clone(),
        "SAT ,0x405000,0x1,0x405100,0x1@j0x405000,0,0x100000001@j0x405100,0,0x100000001",
    )
    .await;

    let src = process.instruction_at(0x405000).unwrap().node_for_thread(1).unwrap();
    let tgt = process.instruction_at(0x405100).unwrap().node_for_thread(1).unwrap();
    assert!(graph.edge_exists((src, tgt)));
}
