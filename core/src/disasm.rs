//! Disassembler feeder (ambient, §4.K/§6): decodes raw code bytes into
//! [`Instruction`]s. Invoked once per loaded code range by [`crate::loader`],
//! never from the per-event ingestion hot path -- the spec treats
//! disassembly as an external collaborator the core merely consumes.

use crate::instruction::{Instruction, OpClass};
use crate::types::Address;
use anyhow::{anyhow, Result};
use capstone::prelude::*;
use std::sync::Arc;

pub struct Disassembler {
    cs: Capstone,
}

// Capstone's handle is not thread-safe; callers serialize access (the
// loader runs single-threaded at startup, well before any worker exists).
unsafe impl Send for Disassembler {}

impl Disassembler {
    pub fn new() -> Result<Self> {
        let cs = Capstone::new()
            .x86()
            .mode(arch::x86::ArchMode::Mode64)
            .syntax(arch::x86::ArchSyntax::Intel)
            .detail(true)
            .build()
            .map_err(|e| anyhow!("failed to initialize capstone: {e}"))?;

        Ok(Self { cs })
    }

    /// Disassembles a code range into [`Instruction`]s keyed by address.
    /// Decode failures for trailing garbage bytes at the end of a segment
    /// are silently truncated (capstone simply stops yielding instructions).
    pub fn disassemble_range(&self, bytes: &[u8], base: Address) -> Result<Vec<Arc<Instruction>>> {
        let insns = self
            .cs
            .disasm_all(bytes, base)
            .map_err(|e| anyhow!("disassembly failed at 0x{base:x}: {e}"))?;

        let mut out = Vec::with_capacity(insns.len());
        for insn in insns.iter() {
            let op_class = self.classify(insn);
            let cond_taken_target = if self.is_conditional_jump(insn) {
                self.branch_target(insn)
            } else {
                None
            };

            out.push(Arc::new(Instruction::new(
                insn.address(),
                insn.len() as u8,
                op_class,
                cond_taken_target,
                insn.mnemonic().unwrap_or("???").to_string(),
                insn.op_str().unwrap_or("").to_string(),
            )));
        }
        Ok(out)
    }

    fn classify(&self, insn: &capstone::Insn) -> OpClass {
        let Ok(detail) = self.cs.insn_detail(insn) else {
            return OpClass::NonFlow;
        };
        let groups = detail.groups();
        let is = |g: u32| groups.iter().any(|grp| grp.0 as u32 == g);

        if is(capstone::InsnGroupId::CS_GRP_CALL as u32) {
            OpClass::Call
        } else if is(capstone::InsnGroupId::CS_GRP_RET as u32) {
            OpClass::Return
        } else if is(capstone::InsnGroupId::CS_GRP_JUMP as u32) {
            OpClass::Jump
        } else {
            OpClass::NonFlow
        }
    }

    fn is_conditional_jump(&self, insn: &capstone::Insn) -> bool {
        insn.mnemonic()
            .map(|m| m.starts_with('j') && m != "jmp")
            .unwrap_or(false)
    }

    fn branch_target(&self, insn: &capstone::Insn) -> Option<Address> {
        let detail = self.cs.insn_detail(insn).ok()?;
        if let capstone::arch::ArchDetail::X86Detail(x86) = detail.arch_detail() {
            for op in x86.operands() {
                if let capstone::arch::x86::X86OperandType::Imm(imm) = op.op_type {
                    return Some(imm as Address);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_simple_return() {
        let disasm = Disassembler::new().unwrap();
        // `ret`
        let instructions = disasm.disassemble_range(&[0xc3], 0x1000).unwrap();
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].op_class, OpClass::Return);
        assert_eq!(instructions[0].address, 0x1000);
    }

    #[test]
    fn decodes_unconditional_jump_as_non_conditional() {
        let disasm = Disassembler::new().unwrap();
        // `jmp $+2`: eb 00
        let instructions = disasm.disassemble_range(&[0xeb, 0x00], 0x2000).unwrap();
        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].op_class, OpClass::Jump);
        assert!(!instructions[0].is_conditional());
    }
}
