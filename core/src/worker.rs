//! Worker loop (spec §4.I/§4.J): one task per traced thread, owning every
//! piece of single-threaded state. Graph and Process Data Store mutations
//! are the only cross-thread-visible effects; everything else here needs no
//! lock.

use crate::args::{ArgCollector, ArgEncoding};
use crate::callstack::CallStack;
use crate::config::WorkerConfig;
use crate::deferred::{BlockRepeat, DeferredQueues, PendingEdge};
use crate::externs::{run_external, ExternBindConfig};
use crate::graph::{EdgeClass, Node, NodeKind, PerThreadGraph};
use crate::instruction::OpClass;
use crate::layout::{PositionInput, RipType};
use crate::loopbatch::LoopBatcher;
use crate::process::ProcessData;
use crate::protocol::{self, JumpModifier, Record, Tag};
use crate::signals::{CancelFlag, SaveFlag};
use crate::types::{Address, NodeIndex, ThreadId};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, warn};

pub struct Worker {
    thread: ThreadId,
    process: Arc<ProcessData>,
    graph: Arc<PerThreadGraph>,
    config: WorkerConfig,
    call_stack: CallStack,
    loop_batcher: LoopBatcher,
    args: ArgCollector,
    deferred: DeferredQueues,
    loop_counter: u64,
    last_vert_id: Option<NodeIndex>,
    last_rip_type: RipType,
    last_conditional: bool,
    last_cond_taken: Option<Address>,
    after_return: bool,
    cancel: CancelFlag,
    save_flag: SaveFlag,
}

impl Worker {
    pub fn new(thread: ThreadId, process: Arc<ProcessData>, graph: Arc<PerThreadGraph>, config: WorkerConfig) -> Self {
        Self {
            thread,
            process,
            graph,
            config,
            call_stack: CallStack::new(),
            loop_batcher: LoopBatcher::new(),
            args: ArgCollector::new(),
            deferred: DeferredQueues::new(),
            loop_counter: 0,
            last_vert_id: None,
            last_rip_type: RipType::FirstInThread,
            last_conditional: false,
            last_cond_taken: None,
            after_return: false,
            cancel: CancelFlag::new(),
            save_flag: SaveFlag::new(),
        }
    }

    /// Wires in an externally-owned die flag (e.g. the server's ctrl-c
    /// handler) instead of the private one `new` creates.
    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wires in an externally-owned save-in-progress flag.
    pub fn with_save_flag(mut self, save_flag: SaveFlag) -> Self {
        self.save_flag = save_flag;
        self
    }

    fn extern_bind_config(&self) -> ExternBindConfig {
        ExternBindConfig {
            retry_attempts: self.config.lookup_retry_attempts,
            retry_interval: self.config.address_not_found_sleep,
        }
    }

    /// Main loop: reads newline-framed messages until the pipe closes (E4),
    /// the die flag fires, or a save pauses ingestion (never spins while
    /// paused). Drains deferred work and marks the graph terminated on exit.
    pub async fn run(&mut self, mut reader: impl AsyncBufRead + Unpin) {
        let mut line = String::new();
        let mut last_deferred_pass = tokio::time::Instant::now();
        let mut last_backlog_tick = tokio::time::Instant::now();
        let mut processed_since_tick: u64 = 0;

        loop {
            if self.graph.terminated.load(Ordering::Acquire) || self.cancel.is_cancelled() {
                break;
            }

            while self.save_flag.is_saving() {
                tokio::time::sleep(self.config.save_pause_poll).await;
                if self.cancel.is_cancelled() {
                    break;
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }

            line.clear();
            let bytes_read = match reader.read_line(&mut line).await {
                Ok(n) => n,
                Err(e) => {
                    error!(thread = self.thread, error = %e, "pipe read failed");
                    break;
                }
            };
            if bytes_read == 0 {
                break; // E4: pipe closed.
            }

            for record in protocol::split_records(line.trim_end()) {
                self.dispatch(record).await;
                processed_since_tick += 1;
            }

            if last_deferred_pass.elapsed() >= self.config.deferred_work_period {
                self.deferred.resolve_pending_edges(&self.process, &self.graph);
                self.deferred
                    .resolve_block_repeats(&self.process, &self.graph, self.thread);
                last_deferred_pass = tokio::time::Instant::now();
            }

            let elapsed = last_backlog_tick.elapsed();
            if elapsed >= std::time::Duration::from_secs(1) {
                let rate = (processed_since_tick as f64 / elapsed.as_secs_f64()).round() as u64;
                self.graph.backlog_rate.store(rate, Ordering::Relaxed);
                processed_since_tick = 0;
                last_backlog_tick = tokio::time::Instant::now();
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(&mut self) {
        self.dump_loop().await;

        self.deferred.drain(
            &self.process,
            &self.graph,
            self.thread,
            self.config.shutdown_drain_passes,
            &self.cancel,
        );

        self.graph.terminated.store(true, Ordering::Release);
        if let Some(last) = self.last_vert_id {
            self.graph.set_final_node(last);
        }
    }

    async fn dispatch(&mut self, record: &str) {
        let parsed = match protocol::parse_record(record) {
            Ok(r) => r,
            Err(err) => {
                error!(record, error = %err, "malformed record (E2)");
                debug_assert!(false, "malformed record reached dispatch: {record}");
                return;
            }
        };

        match parsed {
            Record::BlockTag {
                addr,
                next_block,
                ins_count,
                block_id,
            } => self.handle_block_tag(addr, next_block, ins_count, block_id).await,
            Record::LoopStart(n) => self.loop_batcher.loop_start(n),
            Record::LoopEnd => self.dump_loop().await,
            Record::Arg {
                argpos,
                funcpc,
                returnpc,
                more,
                encoding,
                payload,
            } => self.handle_arg(argpos, funcpc, returnpc, more, encoding, &payload),
            Record::UnchainedLink {
                source_addr,
                source_block_id,
                addr,
                next_block,
                ins_count,
                block_id,
            } => {
                self.handle_unchained_link(source_addr, source_block_id, addr, next_block, ins_count, block_id)
                    .await;
            }
            Record::BlockRepeat {
                block_addr,
                block_id,
                ins_count,
                total_execs,
                targets,
            } => self.deferred.push_block_repeat(BlockRepeat {
                block_addr,
                block_id,
                ins_count,
                total_execs,
                targets,
            }),
            Record::PendingEdge {
                src_addr,
                src_id,
                tgt_addr,
                tgt_id,
            } => self.deferred.push_pending_edge(PendingEdge {
                src_addr,
                src_id,
                tgt_addr,
                tgt_id,
            }),
            Record::Exception { ip, code, flags } => self.handle_exception(ip, code, flags).await,
        }
    }

    /// `dump_loop`, wired to this worker's state. Splitting the fields out
    /// as separate `&mut` locals before the call lets the closure borrow
    /// them independently of the `&mut self.loop_batcher` the call itself
    /// needs -- disjoint field borrows, no extra synchronization required.
    async fn dump_loop(&mut self) {
        let process = &self.process;
        let graph = &self.graph;
        let thread = self.thread;
        let extern_config = self.extern_bind_config();
        let call_stack = &mut self.call_stack;
        let last_vert_id = &mut self.last_vert_id;
        let last_rip_type = &mut self.last_rip_type;
        let last_conditional = &mut self.last_conditional;
        let last_cond_taken = &mut self.last_cond_taken;
        let after_return = &mut self.after_return;
        let mut counter = self.loop_counter;
        let counter_before = counter;
        let repeats_seen = std::cell::Cell::new(0u64);
        let repeats_seen_ref = &repeats_seen;

        self.loop_batcher
            .dump_loop(&mut counter, move |tag, repeats| {
                repeats_seen_ref.set(repeats);
                let call_stack = &mut *call_stack;
                let last_vert_id = &mut *last_vert_id;
                let last_rip_type = &mut *last_rip_type;
                let last_conditional = &mut *last_conditional;
                let last_cond_taken = &mut *last_cond_taken;
                let after_return = &mut *after_return;
                let tag = tag.clone();
                async move {
                    run_tag(
                        process,
                        graph,
                        thread,
                        &extern_config,
                        call_stack,
                        last_vert_id,
                        last_rip_type,
                        last_conditional,
                        last_cond_taken,
                        after_return,
                        &tag,
                        repeats,
                    )
                    .await
                }
            })
            .await;

        // One `(counter, repeats)` entry per replayed loop, not per tag (§8 law).
        if counter > counter_before {
            self.graph.animation().loop_state_list.push((counter, repeats_seen.get()));
        }

        self.loop_counter = counter;
    }

    async fn handle_tag(&mut self, tag: &Tag, repeats: u64) -> NodeIndex {
        let config = self.extern_bind_config();
        run_tag(
            &self.process,
            &self.graph,
            self.thread,
            &config,
            &mut self.call_stack,
            &mut self.last_vert_id,
            &mut self.last_rip_type,
            &mut self.last_conditional,
            &mut self.last_cond_taken,
            &mut self.after_return,
            tag,
            repeats,
        )
        .await
    }

    async fn handle_block_tag(&mut self, addr: Address, next_block: Address, ins_count: u32, block_id: u32) {
        let tag = Tag {
            block_addr: addr,
            ins_count,
            block_id,
            jump_modifier: JumpModifier::Instrumented,
        };

        if !self.loop_batcher.offer(tag.clone()) {
            self.handle_tag(&tag, 1).await;
        }

        if next_block == 0 || self.process.module_status(next_block) == crate::instruction::ModuleStatus::Instrumented {
            // Either there's nothing to chain to, or the tracer will send its
            // own block tag for `next_block` when it's instrumented code.
            return;
        }

        let follow_up = Tag {
            block_addr: next_block,
            ins_count: 0,
            block_id: 0,
            jump_modifier: JumpModifier::Uninstrumented,
        };
        if !self.loop_batcher.offer(follow_up.clone()) {
            self.handle_tag(&follow_up, 1).await;
        }
    }

    fn handle_arg(&mut self, argpos: u32, funcpc: Address, returnpc: Address, more: bool, encoding: ArgEncoding, payload: &str) {
        self.args.handle_arg(argpos, funcpc, returnpc, more, encoding, payload);
        if !more {
            self.args
                .process_new_args(&self.process, &self.graph, self.thread, self.config.arg_storage_capacity);
        }
    }

    async fn handle_unchained_link(
        &mut self,
        source_addr: Address,
        source_block_id: u32,
        addr: Address,
        next_block: Address,
        ins_count: u32,
        block_id: u32,
    ) {
        if let Some(block) = self
            .process
            .block_retry(
                source_addr,
                source_block_id,
                self.config.lookup_retry_attempts,
                self.config.address_not_found_sleep,
            )
            .await
        {
            if let Some(idx) = block.last().and_then(|ins| ins.node_for_thread(self.thread)) {
                self.last_vert_id = Some(idx);
            }
        }
        self.handle_block_tag(addr, next_block, ins_count, block_id).await;
    }

    async fn handle_exception(&mut self, ip: Address, code: u64, flags: u64) {
        let Some(ins) = self.process.instruction_at(ip) else {
            warn!(ip, code, flags, "exception in unresolved module (E5)");
            return;
        };

        // The instruction's containing block is whatever block it was last
        // placed under -- self-modifying code can place the same address
        // under more than one (block_addr, block_id), so the most recent
        // mutation is the one that actually faulted.
        let Some(&(block_addr, block_id)) = ins.mutations().last() else {
            warn!(ip, code, flags, "exception instruction has no recorded containing block (E5)");
            return;
        };

        let Some(block) = self.process.block(block_addr, block_id) else {
            warn!(ip, block_addr, block_id, "exception's containing block not cached (E5)");
            return;
        };

        let Some(fault_index) = block.iter().position(|b| b.address == ip) else {
            warn!(ip, block_addr, block_id, "fault address not found in its own containing block (E5)");
            return;
        };

        let tag = Tag {
            block_addr,
            ins_count: (fault_index + 1) as u32,
            block_id,
            jump_modifier: JumpModifier::Instrumented,
        };

        if self.loop_batcher.offer(tag.clone()) {
            return;
        }

        let config = self.extern_bind_config();
        run_bb(
            &self.process,
            &self.graph,
            self.thread,
            &config,
            &mut self.call_stack,
            &mut self.last_vert_id,
            &mut self.last_rip_type,
            &mut self.last_conditional,
            &mut self.last_cond_taken,
            &mut self.after_return,
            &tag,
            1,
            true,
        )
        .await;
    }
}

/// Shared implementation of `handle_tag`, usable both from the worker's
/// normal dispatch path and from `dump_loop`'s replay closure.
#[allow(clippy::too_many_arguments)]
async fn run_tag(
    process: &ProcessData,
    graph: &PerThreadGraph,
    thread: ThreadId,
    extern_config: &ExternBindConfig,
    call_stack: &mut CallStack,
    last_vert_id: &mut Option<NodeIndex>,
    last_rip_type: &mut RipType,
    last_conditional: &mut bool,
    last_cond_taken: &mut Option<Address>,
    after_return: &mut bool,
    tag: &Tag,
    repeats: u64,
) -> NodeIndex {
    match tag.jump_modifier {
        JumpModifier::Instrumented => {
            run_bb(
                process,
                graph,
                thread,
                extern_config,
                call_stack,
                last_vert_id,
                last_rip_type,
                last_conditional,
                last_cond_taken,
                after_return,
                tag,
                repeats,
                false,
            )
            .await
        }
        JumpModifier::Uninstrumented => {
            let caller = last_vert_id.expect("external transition requires a prior instrumented node (E3)");
            let target = run_external(graph, process, thread, caller, tag.block_addr, repeats, extern_config)
                .await
                .unwrap_or(caller);
            *last_vert_id = Some(target);
            *last_rip_type = RipType::External;
            *after_return = true;
            graph.animation().bb_sequence.push((tag.block_addr, tag.block_id));
            target
        }
    }
}

/// Block execution (spec §4.J). `faulting` selects the `run_faulting_BB`
/// variant: the tail instruction's transition is forced to
/// `ExceptionGenerator` and recorded in the highlight set.
#[allow(clippy::too_many_arguments)]
async fn run_bb(
    process: &ProcessData,
    graph: &PerThreadGraph,
    thread: ThreadId,
    extern_config: &ExternBindConfig,
    call_stack: &mut CallStack,
    last_vert_id: &mut Option<NodeIndex>,
    last_rip_type: &mut RipType,
    last_conditional: &mut bool,
    last_cond_taken: &mut Option<Address>,
    after_return: &mut bool,
    tag: &Tag,
    repeats: u64,
    faulting: bool,
) -> NodeIndex {
    let Some(block) = process
        .resolve_block_retry(
            tag.block_addr,
            tag.block_id,
            tag.ins_count.max(1),
            extern_config.retry_attempts,
            extern_config.retry_interval,
        )
        .await
    else {
        warn!(addr = tag.block_addr, "block unresolved, dropping tag (E1)");
        return last_vert_id.unwrap_or(0);
    };

    let mut target = last_vert_id.unwrap_or(0);

    // A faulting tag may name a block already cached with more instructions
    // than ran before the fault (e.g. a block resolved earlier via a
    // non-faulting path); bound the walk to the actual fault point instead
    // of running past it into instructions that never executed this time.
    let effective_len = if faulting {
        (tag.ins_count.max(1) as usize).min(block.len())
    } else {
        block.len()
    };

    for (i, ins) in block.iter().take(effective_len).enumerate() {
        let is_tail = faulting && i + 1 == effective_len;
        let first_in_thread = last_vert_id.is_none() && i == 0;
        let existing = ins.node_for_thread(thread);

        target = match existing {
            Some(idx) => {
                graph.with_node_mut(idx, |n| n.execution_count += repeats);
                idx
            }
            None => {
                let transition = if first_in_thread {
                    RipType::FirstInThread
                } else if i > 0 {
                    RipType::NonFlow
                } else if is_tail {
                    RipType::ExceptionGenerator
                } else if *after_return {
                    RipType::AfterReturn
                } else {
                    *last_rip_type
                };

                let input = PositionInput {
                    last_rip_type: transition,
                    last_coord: last_vert_id.and_then(|idx| graph.vcoord(idx)),
                    last_conditional: *last_conditional,
                    last_cond_taken: *last_cond_taken,
                    target_address: ins.address,
                    call_stack: call_stack.snapshot(),
                };
                let result = graph.position_next(input);
                if let Some(truncate_to) = result.call_stack_truncate_to {
                    call_stack.truncate_to(truncate_to);
                }

                let idx = graph.insert_node(|idx| Node {
                    index: idx,
                    kind: NodeKind::Instruction(ins.clone()),
                    vcoord: result.coord,
                    execution_count: repeats,
                    calls: 0,
                    module: process.module_index_at(ins.address),
                    external: false,
                    parent: *last_vert_id,
                    child_externs: 0,
                    func_args: Vec::new(),
                    outgoing: Default::default(),
                    incoming: Default::default(),
                });
                ins.bind_thread_node(thread, idx);
                idx
            }
        };
        let placed_new_node = existing.is_none();

        if !first_in_thread {
            let from = last_vert_id.unwrap_or(target);
            if !graph.edge_exists((from, target)) {
                let class = classify_edge(i, existing.is_some(), *last_rip_type);
                graph.add_edge(from, target, class);
            }
        }

        if is_tail {
            graph.highlights().exception_set.push(target);
            *last_rip_type = RipType::ExceptionGenerator;
        } else {
            *last_rip_type = match ins.op_class {
                OpClass::Call => {
                    let return_addr = ins.address + ins.length as Address;
                    call_stack.push(return_addr, target);
                    RipType::Call
                }
                OpClass::Jump => RipType::Jump,
                OpClass::Return => RipType::Return,
                OpClass::NonFlow => RipType::NonFlow,
            };
        }
        *last_conditional = ins.is_conditional();
        *last_cond_taken = ins.cond_taken_target;
        // Only a freshly placed node's outgoing transition should update
        // `after_return` -- a reused (repeat-execution) node leaves whatever
        // the last genuine placement decided untouched. A real `ret`
        // instruction (not just the external-continuation hack in
        // `run_tag`) also drives the next block's first node through the
        // `AfterReturn` layout rule.
        if placed_new_node {
            *after_return = *last_rip_type == RipType::Return;
        }
        *last_vert_id = Some(target);
    }

    graph.animation().bb_sequence.push((tag.block_addr, tag.block_id));
    debug!(addr = tag.block_addr, ins = effective_len, repeats, "block executed");
    target
}

fn classify_edge(index_in_block: usize, target_existed: bool, prev_rip: RipType) -> EdgeClass {
    if index_in_block > 0 {
        if target_existed {
            EdgeClass::Old
        } else {
            EdgeClass::New
        }
    } else {
        match prev_rip {
            RipType::Return => EdgeClass::Return,
            RipType::ExceptionGenerator => EdgeClass::Exception,
            _ if target_existed => EdgeClass::Old,
            RipType::Call => EdgeClass::Call,
            _ => EdgeClass::New,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Instruction, Module, ModuleStatus};

    fn setup() -> (Arc<ProcessData>, Arc<PerThreadGraph>, WorkerConfig) {
        let process = Arc::new(ProcessData::new());
        process.register_module(Module {
            start: 0x400000,
            end: 0x410000,
            status: ModuleStatus::Instrumented,
            path: "test".into(),
        });
        let graph = Arc::new(PerThreadGraph::new(1));
        let config = WorkerConfig {
            lookup_retry_attempts: 1,
            address_not_found_sleep: std::time::Duration::from_millis(1),
            ..WorkerConfig::default()
        };
        (process, graph, config)
    }

    fn push_instruction(process: &ProcessData, addr: Address, op: OpClass) {
        process.insert_instruction(Arc::new(Instruction::new(addr, 4, op, None, "nop".into(), "".into())));
    }

    #[tokio::test]
    async fn single_instrumented_block_creates_one_node_per_instruction() {
        let (process, graph, config) = setup();
        push_instruction(&process, 0x400100, OpClass::NonFlow);
        push_instruction(&process, 0x400104, OpClass::NonFlow);

        let mut worker = Worker::new(1, process, graph.clone(), config);
        worker.handle_block_tag(0x400100, 0, 2, 1).await;

        assert_eq!(graph.num_nodes(), 2);
        assert!(graph.edge_exists((0, 1)));
    }

    #[tokio::test]
    async fn single_call_to_external_binds_library_edge() {
        let (process, graph, config) = setup();
        push_instruction(&process, 0x400100, OpClass::Call);

        let mut worker = Worker::new(1, process, graph.clone(), config);
        worker.handle_block_tag(0x400100, 0x7ffa0000, 1, 1).await;

        assert_eq!(graph.num_nodes(), 2);
        assert!(graph.edge_exists((0, 1)));
        assert_eq!(graph.highlights().extern_list.len(), 1);
    }

    #[tokio::test]
    async fn cancel_flag_stops_run_before_reading_pending_input() {
        let (process, graph, config) = setup();
        push_instruction(&process, 0x400100, OpClass::NonFlow);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let mut worker = Worker::new(1, process, graph.clone(), config).with_cancel_flag(cancel);

        let reader = tokio::io::BufReader::new(&b"j400100,0,1\n"[..]);
        worker.run(reader).await;

        assert_eq!(graph.num_nodes(), 0);
        assert!(graph.terminated.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn save_flag_pauses_ingestion_until_cleared() {
        let (process, graph, config) = setup();
        push_instruction(&process, 0x400100, OpClass::NonFlow);

        let save_flag = SaveFlag::new();
        save_flag.begin();
        let mut worker = Worker::new(1, process, graph.clone(), config).with_save_flag(save_flag.clone());

        let reader = tokio::io::BufReader::new(&b"j400100,0,1\n"[..]);
        let run = tokio::spawn(async move {
            worker.run(reader).await;
            worker
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(graph.num_nodes(), 0);

        save_flag.end();
        let worker = run.await.unwrap();
        assert_eq!(graph.num_nodes(), 1);
        drop(worker);
    }

    #[tokio::test]
    async fn loop_replay_scales_execution_count_by_repeat_count() {
        let (process, graph, config) = setup();
        push_instruction(&process, 0x401000, OpClass::NonFlow);
        push_instruction(&process, 0x401100, OpClass::NonFlow);

        let mut worker = Worker::new(1, process, graph.clone(), config);
        worker.dispatch("\u{25C6}S3").await;
        worker.dispatch("j401000,401100,200000001").await;
        worker.dispatch("j401100,0,300000001").await;
        worker.dispatch("\u{25C6}E").await;

        assert_eq!(graph.num_nodes(), 2);
        graph.with_node(0, |n| assert_eq!(n.execution_count, 3));
        graph.with_node(1, |n| assert_eq!(n.execution_count, 3));
        assert_eq!(worker.loop_counter, 1);
    }
}
