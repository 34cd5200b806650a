//! Wire protocol parsing (spec §6, §4.I). UTF-8 ASCII records separated by
//! `@`; fields within a record separated by `,`. Parsing never panics on
//! malformed input in release builds (E2): it returns an error the caller
//! logs and skips, and `debug_assert!`s in debug builds so corruption
//! surfaces immediately in development.

use crate::args::ArgEncoding;
use crate::error::IngestError;
use crate::types::{Address, BlockId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpModifier {
    Instrumented,
    Uninstrumented,
}

#[derive(Debug, Clone)]
pub struct Tag {
    pub block_addr: Address,
    pub ins_count: u32,
    pub block_id: BlockId,
    pub jump_modifier: JumpModifier,
}

#[derive(Debug, Clone)]
pub enum Record {
    BlockTag {
        addr: Address,
        next_block: Address,
        ins_count: u32,
        block_id: BlockId,
    },
    LoopStart(u64),
    LoopEnd,
    Arg {
        argpos: u32,
        funcpc: Address,
        returnpc: Address,
        more: bool,
        encoding: ArgEncoding,
        payload: String,
    },
    UnchainedLink {
        source_addr: Address,
        source_block_id: BlockId,
        addr: Address,
        next_block: Address,
        ins_count: u32,
        block_id: BlockId,
    },
    BlockRepeat {
        block_addr: Address,
        block_id: BlockId,
        ins_count: u32,
        total_execs: u64,
        targets: Vec<(Address, BlockId)>,
    },
    PendingEdge {
        src_addr: Address,
        src_id: BlockId,
        tgt_addr: Address,
        tgt_id: BlockId,
    },
    Exception {
        ip: Address,
        code: u64,
        flags: u64,
    },
}

/// Splits one pipe read into its `@`-separated records.
pub fn split_records(message: &str) -> impl Iterator<Item = &str> {
    message.split('@').filter(|s| !s.is_empty())
}

/// Builds an `E2` error. The debug-abort half of E2's handling lives in the
/// dispatcher (`worker::run`), not here, so this parser stays a pure,
/// panic-free function callers can unit test directly.
fn malformed(record: &str, reason: impl Into<String>) -> IngestError {
    IngestError::MalformedRecord {
        record: record.to_string(),
        reason: reason.into(),
    }
}

fn parse_hex(record: &str, field: &str) -> Result<u64, IngestError> {
    let field = field.trim().trim_start_matches("0x");
    u64::from_str_radix(field, 16).map_err(|e| malformed(record, format!("bad hex field: {e}")))
}

fn parse_dec(record: &str, field: &str) -> Result<u64, IngestError> {
    field
        .trim()
        .parse()
        .map_err(|e| malformed(record, format!("bad decimal field: {e}")))
}

/// Unpacks a packed `id_count`: `insCount` in the low 32 bits, `blockID` in
/// the high 32 bits.
fn unpack_id_count(id_count: u64) -> (u32, BlockId) {
    ((id_count & 0xffff_ffff) as u32, (id_count >> 32) as BlockId)
}

pub fn parse_record(record: &str) -> Result<Record, IngestError> {
    let trimmed = record.trim();

    if let Some(rest) = trimmed.strip_prefix("j") {
        let fields: Vec<&str> = rest.splitn(3, ',').collect();
        let [addr, next_block, id_count] = fields[..] else {
            return Err(malformed(record, "block tag needs 3 fields"));
        };
        let (ins_count, block_id) = unpack_id_count(parse_hex(record, id_count)?);
        return Ok(Record::BlockTag {
            addr: parse_hex(record, addr)?,
            next_block: parse_hex(record, next_block)?,
            ins_count,
            block_id,
        });
    }

    if let Some(rest) = trimmed.strip_prefix("\u{25C6}S") {
        return Ok(Record::LoopStart(parse_dec(record, rest)?));
    }
    if trimmed.starts_with("\u{25C6}E") {
        return Ok(Record::LoopEnd);
    }

    if let Some(rest) = trimmed.strip_prefix("ARG") {
        let fields: Vec<&str> = rest.trim_start().splitn(6, ',').collect();
        let [argpos, funcpc, returnpc, marker, encoding, payload] = fields[..] else {
            return Err(malformed(record, "ARG needs 6 fields"));
        };
        let more = match marker.trim() {
            "M" => true,
            "E" => false,
            other => return Err(malformed(record, format!("unknown ARG marker {other:?}"))),
        };
        let encoding = match encoding.trim() {
            "ARG_BASE64" => ArgEncoding::Base64,
            _ => ArgEncoding::Raw,
        };
        return Ok(Record::Arg {
            argpos: parse_dec(record, argpos)? as u32,
            funcpc: parse_hex(record, funcpc)?,
            returnpc: parse_hex(record, returnpc)?,
            more,
            encoding,
            payload: payload.to_string(),
        });
    }

    if let Some(rest) = trimmed.strip_prefix("UL") {
        let fields: Vec<&str> = rest.trim_start().trim_start_matches(',').splitn(5, ',').collect();
        let [source_addr, source_block_id, addr, next_block, id_count] = fields[..] else {
            return Err(malformed(record, "UL needs 5 fields"));
        };
        let (ins_count, block_id) = unpack_id_count(parse_hex(record, id_count)?);
        return Ok(Record::UnchainedLink {
            source_addr: parse_hex(record, source_addr)?,
            source_block_id: parse_hex(record, source_block_id)? as BlockId,
            addr: parse_hex(record, addr)?,
            next_block: parse_hex(record, next_block)?,
            ins_count,
            block_id,
        });
    }

    if let Some(rest) = trimmed.strip_prefix("BX") {
        let mut fields = rest.trim_start().trim_start_matches(',').split(',');
        let block_addr = parse_hex(record, fields.next().unwrap_or(""))?;
        let id_count = parse_hex(record, fields.next().unwrap_or(""))?;
        let total_execs = parse_hex(record, fields.next().unwrap_or(""))?;
        let (ins_count, block_id) = unpack_id_count(id_count);

        let rest: Vec<&str> = fields.collect();
        if rest.len() % 2 != 0 {
            return Err(malformed(record, "BX targets must come in (addr, blockID) pairs"));
        }
        let mut targets = Vec::with_capacity(rest.len() / 2);
        for pair in rest.chunks(2) {
            targets.push((parse_hex(record, pair[0])?, parse_hex(record, pair[1])? as BlockId));
        }

        return Ok(Record::BlockRepeat {
            block_addr,
            block_id,
            ins_count,
            total_execs,
            targets,
        });
    }

    if let Some(rest) = trimmed.strip_prefix("SAT") {
        let fields: Vec<&str> = rest.trim_start().trim_start_matches(',').splitn(4, ',').collect();
        let [src_addr, src_id, tgt_addr, tgt_id] = fields[..] else {
            return Err(malformed(record, "SAT needs 4 fields"));
        };
        return Ok(Record::PendingEdge {
            src_addr: parse_hex(record, src_addr)?,
            src_id: parse_hex(record, src_id)? as BlockId,
            tgt_addr: parse_hex(record, tgt_addr)?,
            tgt_id: parse_hex(record, tgt_id)? as BlockId,
        });
    }

    if let Some(rest) = trimmed.strip_prefix("EXC") {
        let fields: Vec<&str> = rest.trim_start().trim_start_matches(',').splitn(3, ',').collect();
        let [ip, code, flags] = fields[..] else {
            return Err(malformed(record, "EXC needs 3 fields"));
        };
        return Ok(Record::Exception {
            ip: parse_hex(record, ip)?,
            code: parse_hex(record, code)?,
            flags: parse_hex(record, flags)?,
        });
    }

    Err(malformed(record, "unrecognized verb"))
}
