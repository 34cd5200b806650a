//! Process Data Store (spec §4.A): the tables shared by every worker task
//! for one traced process. Reads are lock-free or read-locked; writes are
//! serialized per table.

use crate::instruction::{ExternDescriptor, Instruction, Module, ModuleStatus, Symbol};
use crate::types::{Address, BlockId};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Disassembly table: latest element for an address is the currently active
/// mutation (self-modifying code keeps older variants reachable via
/// [`Instruction::mutations`]).
type DisassemblyTable = DashMap<Address, Vec<Arc<Instruction>>>;
type BlockList = DashMap<(Address, BlockId), Vec<Arc<Instruction>>>;
type ExternTable = DashMap<Address, Arc<ExternDescriptor>>;

pub struct ProcessData {
    disassembly: DisassemblyTable,
    externdict: ExternTable,
    blocklist: BlockList,
    modules: RwLock<Vec<Module>>,
    symbols: RwLock<Vec<Symbol>>,
}

impl Default for ProcessData {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessData {
    pub fn new() -> Self {
        Self {
            disassembly: DashMap::new(),
            externdict: ExternTable::new(),
            blocklist: BlockList::new(),
            modules: RwLock::new(Vec::new()),
            symbols: RwLock::new(Vec::new()),
        }
    }

    pub fn register_module(&self, module: Module) {
        self.modules.write().push(module);
    }

    pub fn register_symbol(&self, symbol: Symbol) {
        self.symbols.write().push(symbol);
    }

    pub fn module_status(&self, address: Address) -> ModuleStatus {
        self.modules
            .read()
            .iter()
            .find(|m| m.contains(address))
            .map(|m| m.status)
            .unwrap_or(ModuleStatus::Unknown)
    }

    pub fn module_index_at(&self, address: Address) -> Option<usize> {
        self.modules.read().iter().position(|m| m.contains(address))
    }

    pub fn symbol_at(&self, address: Address) -> Option<String> {
        self.symbols
            .read()
            .iter()
            .find(|s| s.address == address)
            .map(|s| s.name.clone())
    }

    /// Latest disassembled variant of the instruction at `address`, if any.
    pub fn instruction_at(&self, address: Address) -> Option<Arc<Instruction>> {
        self.disassembly.get(&address).and_then(|v| v.last().cloned())
    }

    pub fn insert_instruction(&self, instruction: Arc<Instruction>) {
        self.disassembly
            .entry(instruction.address)
            .or_default()
            .push(instruction);
    }

    pub fn block(&self, addr: Address, block_id: BlockId) -> Option<Vec<Arc<Instruction>>> {
        self.blocklist.get(&(addr, block_id)).map(|v| v.clone())
    }

    pub fn insert_block(&self, addr: Address, block_id: BlockId, instructions: Vec<Arc<Instruction>>) {
        self.blocklist.insert((addr, block_id), instructions);
    }

    /// Builds (and caches) the instruction list for a block on first sight,
    /// by walking the disassembly table forward from `addr` for `ins_count`
    /// instructions. Returns `None` if any instruction in the chain hasn't
    /// been disassembled yet -- the caller treats that as E1 and retries.
    pub fn resolve_block(&self, addr: Address, block_id: BlockId, ins_count: u32) -> Option<Vec<Arc<Instruction>>> {
        if let Some(existing) = self.block(addr, block_id) {
            return Some(existing);
        }
        let mut instructions = Vec::with_capacity(ins_count.max(1) as usize);
        let mut cursor = addr;
        for _ in 0..ins_count.max(1) {
            let ins = self.instruction_at(cursor)?;
            cursor = cursor.wrapping_add(ins.length as Address);
            instructions.push(ins);
        }
        for ins in &instructions {
            ins.record_mutation(addr, block_id);
        }
        self.insert_block(addr, block_id, instructions.clone());
        Some(instructions)
    }

    /// Polls the block cache only -- never synthesizes a block from the
    /// disassembly table. Used where the caller already knows the block was
    /// tagged elsewhere (e.g. an unchained-link source) and a miss means
    /// "not cached yet", not "doesn't exist".
    pub async fn block_retry(
        &self,
        addr: Address,
        block_id: BlockId,
        attempts: u32,
        interval: Duration,
    ) -> Option<Vec<Arc<Instruction>>> {
        for attempt in 0..attempts.max(1) {
            if let Some(block) = self.block(addr, block_id) {
                return Some(block);
            }
            debug!(addr, block_id, attempt, "cached block not yet present, retrying");
            tokio::time::sleep(interval).await;
        }
        warn!(addr, block_id, attempts, "block lookup exhausted retry budget");
        None
    }

    pub async fn resolve_block_retry(
        &self,
        addr: Address,
        block_id: BlockId,
        ins_count: u32,
        attempts: u32,
        interval: Duration,
    ) -> Option<Vec<Arc<Instruction>>> {
        for attempt in 0..attempts.max(1) {
            if let Some(block) = self.resolve_block(addr, block_id, ins_count) {
                return Some(block);
            }
            debug!(addr, block_id, attempt, "block not yet resolvable, retrying");
            tokio::time::sleep(interval).await;
        }
        warn!(addr, block_id, attempts, "block resolution exhausted retry budget");
        None
    }

    pub fn extern_at(&self, address: Address) -> Option<Arc<ExternDescriptor>> {
        self.externdict.get(&address).map(|e| e.clone())
    }

    pub fn extern_entry(&self, address: Address, module: usize) -> Arc<ExternDescriptor> {
        self.externdict
            .entry(address)
            .or_insert_with(|| Arc::new(ExternDescriptor::new(module, self.symbol_at(address))))
            .clone()
    }

    /// Bounded retry lookup for an instruction that may not have been
    /// disassembled yet (E1). Sleeps `interval` between attempts; gives up
    /// after `attempts` tries and lets the caller decide whether to queue
    /// the work or drop the event.
    pub async fn instruction_at_retry(
        &self,
        address: Address,
        attempts: u32,
        interval: Duration,
    ) -> Option<Arc<Instruction>> {
        for attempt in 0..attempts.max(1) {
            if let Some(ins) = self.instruction_at(address) {
                return Some(ins);
            }
            debug!(address, attempt, "instruction not yet disassembled, retrying");
            tokio::time::sleep(interval).await;
        }
        warn!(address, attempts, "instruction lookup exhausted retry budget");
        None
    }

    pub async fn extern_at_retry(
        &self,
        address: Address,
        attempts: u32,
        interval: Duration,
    ) -> Option<Arc<ExternDescriptor>> {
        for attempt in 0..attempts.max(1) {
            if let Some(ext) = self.extern_at(address) {
                return Some(ext);
            }
            debug!(address, attempt, "extern descriptor not yet known, retrying");
            tokio::time::sleep(interval).await;
        }
        warn!(address, attempts, "extern lookup exhausted retry budget");
        None
    }
}
