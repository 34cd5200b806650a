//! Binary Loader (ambient, §4.K). Parses an ELF or PE image, registers its
//! loadable/executable segments as modules, harvests defined function
//! symbols, and eagerly disassembles executable segments so later trace
//! ingestion finds instructions already known. Runs once at startup, well
//! before any worker task is spawned.

use crate::disasm::Disassembler;
use crate::instruction::{Module, ModuleStatus, Symbol};
use crate::process::ProcessData;
use anyhow::{Context, Result};
use goblin::{elf, pe, Object};
use std::fs;
use std::path::Path;
use tracing::info;

pub struct BinaryLoader {
    disassembler: Disassembler,
}

impl BinaryLoader {
    pub fn new() -> Result<Self> {
        Ok(Self {
            disassembler: Disassembler::new()?,
        })
    }

    pub fn load_file(&self, process: &ProcessData, path: &Path) -> Result<()> {
        let buffer = fs::read(path).context("failed to read binary file")?;

        match Object::parse(&buffer)? {
            Object::Elf(elf) => self.load_elf(process, &elf, &buffer, path),
            Object::PE(pe) => self.load_pe(process, &pe, &buffer, path),
            other => Err(anyhow::anyhow!("unsupported binary format: {other:?}")),
        }
    }

    fn load_elf(&self, process: &ProcessData, elf: &elf::Elf, buffer: &[u8], path: &Path) -> Result<()> {
        for ph in &elf.program_headers {
            if ph.p_type != elf::program_header::PT_LOAD {
                continue;
            }
            let start = ph.p_vaddr;
            let size = ph.p_filesz;
            let offset = ph.p_offset as usize;
            if size == 0 {
                continue;
            }
            let executable = ph.p_flags & elf::program_header::PF_X != 0;
            let status = if executable {
                ModuleStatus::Instrumented
            } else {
                ModuleStatus::Uninstrumented
            };
            process.register_module(Module {
                start,
                end: start + size,
                status,
                path: path.display().to_string(),
            });

            if executable {
                let data = &buffer[offset..offset + size as usize];
                for ins in self.disassembler.disassemble_range(data, start)? {
                    process.insert_instruction(ins);
                }
            }
        }

        for sym in elf.syms.iter() {
            if sym.st_type() == elf::sym::STT_FUNC && sym.st_value != 0 {
                if let Some(name) = elf.strtab.get_at(sym.st_name) {
                    process.register_symbol(Symbol {
                        address: sym.st_value,
                        size: sym.st_size,
                        name: name.to_string(),
                    });
                }
            }
        }

        info!(entry = elf.header.e_entry, path = %path.display(), "loaded ELF binary");
        Ok(())
    }

    fn load_pe(&self, process: &ProcessData, pe: &pe::PE, buffer: &[u8], path: &Path) -> Result<()> {
        for section in &pe.sections {
            let start = pe.image_base as u64 + section.virtual_address as u64;
            let size = section.size_of_raw_data;
            let offset = section.pointer_to_raw_data as usize;
            if size == 0 {
                continue;
            }
            let executable = section.characteristics & 0x2000_0000 != 0; // IMAGE_SCN_MEM_EXECUTE
            let status = if executable {
                ModuleStatus::Instrumented
            } else {
                ModuleStatus::Uninstrumented
            };
            process.register_module(Module {
                start,
                end: start + size as u64,
                status,
                path: path.display().to_string(),
            });

            if executable {
                let data = &buffer[offset..offset + size as usize];
                for ins in self.disassembler.disassemble_range(data, start)? {
                    process.insert_instruction(ins);
                }
            }
        }

        for export in &pe.exports {
            if let Some(name) = export.name {
                let addr = pe.image_base as u64 + export.rva as u64;
                process.register_symbol(Symbol {
                    address: addr,
                    size: 0,
                    name: name.to_string(),
                });
            }
        }

        info!(path = %path.display(), "loaded PE binary");
        Ok(())
    }
}
