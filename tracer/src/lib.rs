use lazy_static::lazy_static;
use qemu_plugin_sys::*;
use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// A translated block, keyed by its start vaddr for as long as QEMU keeps
/// the translation around. `block_id` is assigned once per distinct vaddr
/// seen, so a self-modifying retranslation at the same address reuses it
/// unless the instruction count changed.
#[derive(Clone, Copy)]
struct BlockInfo {
    ins_count: u32,
    block_id: u32,
}

#[derive(Clone, Copy)]
struct PendingBlock {
    addr: u64,
    ins_count: u32,
    block_id: u32,
}

lazy_static! {
    static ref STREAM: Mutex<Option<TcpStream>> = Mutex::new(None);
    static ref TB_INFO: Mutex<HashMap<u64, BlockInfo>> = Mutex::new(HashMap::new());
    /// One entry per vCPU: the block that executed last, not yet flushed
    /// because we don't know its successor until the next block starts.
    static ref PENDING: Mutex<HashMap<u32, PendingBlock>> = Mutex::new(HashMap::new());
}

static NEXT_BLOCK_ID: AtomicU32 = AtomicU32::new(1);

fn connect() -> Option<TcpStream> {
    let addr = "host.docker.internal:3001";
    if let Ok(stream) = TcpStream::connect(addr) {
        println!("tracegraph tracer: connected to server at {addr}");
        return Some(stream);
    }
    if let Ok(stream) = TcpStream::connect("127.0.0.1:3001") {
        println!("tracegraph tracer: connected to server at 127.0.0.1:3001");
        return Some(stream);
    }
    None
}

/// Sends one `@`-terminated wire record (spec §6) to the server, connecting
/// lazily on first use.
fn send_record(record: &str) {
    let mut guard = STREAM.lock().unwrap();
    if guard.is_none() {
        *guard = connect();
    }
    if let Some(stream) = guard.as_mut() {
        if stream.write_all(record.as_bytes()).is_err() || stream.write_all(b"@\n").is_err() {
            *guard = None;
        }
    }
}

fn block_tag(addr: u64, next_block: u64, ins_count: u32, block_id: u32) -> String {
    let id_count = ((block_id as u64) << 32) | ins_count as u64;
    format!("j{addr:x},{next_block:x},{id_count:x}")
}

fn flush_pending(vcpu_index: u32, next_block: u64) {
    let prev = PENDING.lock().unwrap().remove(&vcpu_index);
    if let Some(prev) = prev {
        send_record(&block_tag(prev.addr, next_block, prev.ins_count, prev.block_id));
    }
}

extern "C" fn vcpu_init(_id: qemu_plugin_id_t, vcpu_index: u32) {
    println!("tracegraph tracer: vCPU {vcpu_index} initialized");
}

extern "C" fn vcpu_exit(_id: qemu_plugin_id_t, vcpu_index: u32) {
    flush_pending(vcpu_index, 0);
    println!("tracegraph tracer: vCPU {vcpu_index} exited");
}

extern "C" fn plugin_exit(_id: qemu_plugin_id_t, _data: *mut c_void) {
    let pending: Vec<u32> = PENDING.lock().unwrap().keys().copied().collect();
    for vcpu_index in pending {
        flush_pending(vcpu_index, 0);
    }
}

/// Runs on the first instruction of a freshly entered block. Flushes the
/// previous pending block for this vCPU now that its successor (this
/// block's address) is known, then makes this block the new pending one.
extern "C" fn tb_entered(vcpu_index: u32, userdata: *mut c_void) {
    let addr = userdata as u64;
    let Some(info) = TB_INFO.lock().unwrap().get(&addr).copied() else {
        return;
    };

    flush_pending(vcpu_index, addr);
    PENDING.lock().unwrap().insert(
        vcpu_index,
        PendingBlock {
            addr,
            ins_count: info.ins_count,
            block_id: info.block_id,
        },
    );
}

extern "C" fn vcpu_tb_trans(_id: qemu_plugin_id_t, tb: *mut qemu_plugin_tb) {
    unsafe {
        let n = qemu_plugin_tb_n_insns(tb);
        if n == 0 {
            return;
        }
        let first_insn = qemu_plugin_tb_get_insn(tb, 0);
        let addr = qemu_plugin_insn_vaddr(first_insn);

        {
            let mut ids = TB_INFO.lock().unwrap();
            let needs_new_id = !matches!(ids.get(&addr), Some(existing) if existing.ins_count == n as u32);
            if needs_new_id {
                let id = NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed);
                ids.insert(
                    addr,
                    BlockInfo {
                        ins_count: n as u32,
                        block_id: id,
                    },
                );
            }
        }

        qemu_plugin_register_vcpu_insn_exec_cb(
            first_insn,
            Some(tb_entered),
            qemu_plugin_cb_flags::QEMU_PLUGIN_CB_NO_REGS,
            addr as *mut c_void,
        );
    }
}

#[no_mangle]
#[used]
pub static qemu_plugin_version: c_int = 2;

#[no_mangle]
pub extern "C" fn qemu_plugin_install(
    id: qemu_plugin_id_t,
    _info: *const qemu_info_t,
    _argc: c_int,
    _argv: *const *const c_char,
) -> c_int {
    println!("tracegraph tracer: install");

    unsafe {
        qemu_plugin_register_vcpu_init_cb(id, Some(vcpu_init));
        qemu_plugin_register_vcpu_exit_cb(id, Some(vcpu_exit));
        qemu_plugin_register_atexit_cb(id, Some(plugin_exit), std::ptr::null_mut());
        qemu_plugin_register_vcpu_tb_trans_cb(id, Some(vcpu_tb_trans));
    }

    0
}
