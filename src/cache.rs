//! Disassembly cache: discovers and caches basic blocks for a guest
//! executable section, and invalidates them when the MMU reports a
//! protection or unmap event over that section. Grounded on
//! `x64::DisassemblyCache` / `ExecutableSection`.

use crate::instruction::{InstructionDecoder, X64Instruction};
use crate::mmu::{MmuCallback, Prot, ProtFlags};
use std::collections::BTreeMap;

/// Supplies the raw bytes backing a guest address range, and the region's
/// base and a human-readable name for diagnostics. Implemented by the
/// embedder (typically backed by the MMU directly).
pub trait BytecodeRetriever {
    fn retrieve_bytecode(&self, address: u64, size: u64) -> Option<(Vec<u8>, String, u64)>;
}

/// One executable section: a contiguous run of guest addresses that have
/// been decoded, plus the decoded instruction stream.
pub struct ExecutableSection {
    begin: u64,
    end: u64,
    instructions: Vec<X64Instruction>,
    filename: String,
}

impl ExecutableSection {
    fn index_of(&self, address: u64) -> Option<usize> {
        self.instructions.iter().position(|i| i.address() == address)
    }

    /// Drops instructions before `keep_from` in place, used when only part
    /// of the section loses EXEC permission rather than the whole thing.
    fn trim(&mut self, keep_from: u64, keep_to: u64) {
        self.instructions.retain(|i| i.address() >= keep_from && i.next_address() <= keep_to);
        if let (Some(first), Some(last)) = (self.instructions.first(), self.instructions.last()) {
            self.begin = first.address();
            self.end = last.next_address();
        }
    }
}

#[derive(Default)]
struct BasicBlockBuilder;

impl BasicBlockBuilder {
    /// Decodes forward from `address` until an instruction that ends a
    /// basic block, or decoding runs out of contiguous bytes.
    fn build(&self, bytes: &[u8], region_base: u64, address: u64) -> Vec<X64Instruction> {
        let mut out = Vec::new();
        let offset = (address - region_base) as usize;
        if offset >= bytes.len() {
            return out;
        }
        let mut decoder = InstructionDecoder::new(&bytes[offset..], address);
        let mut expected_next = address;
        while decoder.can_decode() {
            let Some(instr) = decoder.decode_next() else { break };
            if instr.address() != expected_next {
                break;
            }
            expected_next = instr.next_address();
            let ends = instr.ends_basic_block();
            out.push(instr);
            if ends {
                break;
            }
        }
        out
    }
}

/// Caches decoded basic blocks keyed by the executable section they live
/// in, invalidating them in response to MMU protection changes.
pub struct DisassemblyCache {
    sections_by_begin: BTreeMap<u64, ExecutableSection>,
    builder: BasicBlockBuilder,
    #[cfg(feature = "multiprocessing")]
    guard: std::sync::Mutex<()>,
}

impl Default for DisassemblyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DisassemblyCache {
    pub fn new() -> Self {
        Self {
            sections_by_begin: BTreeMap::new(),
            builder: BasicBlockBuilder,
            #[cfg(feature = "multiprocessing")]
            guard: std::sync::Mutex::new(()),
        }
    }

    fn section_containing(&self, address: u64) -> Option<&ExecutableSection> {
        self.sections_by_begin
            .range(..=address)
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| address >= s.begin && address < s.end)
    }

    /// Returns the decoded basic block starting at `address`, decoding and
    /// caching it first if necessary.
    pub fn get_basic_block(&mut self, address: u64, retriever: &dyn BytecodeRetriever) -> Option<Vec<X64Instruction>> {
        #[cfg(feature = "multiprocessing")]
        let _lock = self.guard.lock().unwrap();

        if let Some(section) = self.section_containing(address) {
            if let Some(start) = section.index_of(address) {
                let mut block = Vec::new();
                for instr in &section.instructions[start..] {
                    let ends = instr.ends_basic_block();
                    block.push(instr.clone());
                    if ends {
                        break;
                    }
                }
                if !block.is_empty() {
                    return Some(block);
                }
            }
        }

        let (bytes, name, region_base) = retriever.retrieve_bytecode(address, 4096)?;
        let block = self.builder.build(&bytes, region_base, address);
        if block.is_empty() {
            return None;
        }
        self.insert_section(region_base, &bytes, name, &block);
        Some(block)
    }

    fn insert_section(&mut self, region_base: u64, bytes: &[u8], name: String, block: &[X64Instruction]) {
        let begin = block.first().unwrap().address();
        let end = block.last().unwrap().next_address();
        if let Some(existing) = self.sections_by_begin.get_mut(&region_base) {
            existing.instructions.extend(block.iter().cloned());
            existing.end = existing.end.max(end);
        } else {
            let _ = bytes;
            self.sections_by_begin.insert(
                region_base,
                ExecutableSection { begin, end, instructions: block.to_vec(), filename: name },
            );
        }
    }

    pub fn try_find_containing_file(&self, address: u64) -> Option<&str> {
        self.section_containing(address).map(|s| s.filename.as_str())
    }

    /// Whether a basic block starting at `address` is already cached,
    /// without decoding or inserting anything. Used for cache-hit/miss
    /// telemetry, where `get_basic_block` itself is too late to tell.
    pub fn contains(&self, address: u64) -> bool {
        self.section_containing(address).is_some_and(|s| s.index_of(address).is_some())
    }
}

impl MmuCallback for DisassemblyCache {
    fn on_region_protection_change(&mut self, base: u64, length: u64, before: ProtFlags, after: ProtFlags) {
        let gained_exec = !before.test(Prot::Exec) && after.test(Prot::Exec);
        let lost_exec = before.test(Prot::Exec) && !after.test(Prot::Exec);
        if lost_exec {
            self.invalidate_range(base, base + length);
        } else if gained_exec {
            log::debug!("region [{base:#x}, {:#x}) gained EXEC, nothing cached yet", base + length);
        }
    }

    fn on_region_destruction(&mut self, base: u64, length: u64, prot: ProtFlags) {
        if prot.test(Prot::Exec) {
            self.invalidate_range(base, base + length);
        }
    }
}

impl DisassemblyCache {
    fn invalidate_range(&mut self, base: u64, end: u64) {
        let keys: Vec<u64> = self.sections_by_begin.keys().copied().collect();
        for key in keys {
            let section = self.sections_by_begin.get_mut(&key).unwrap();
            if section.end <= base || section.begin >= end {
                continue;
            }
            if base <= section.begin && end >= section.end {
                log::debug!("dropping fully-invalidated section [{:#x}, {:#x})", section.begin, section.end);
                self.sections_by_begin.remove(&key);
            } else {
                let keep_from = if base > section.begin { end } else { section.begin };
                let keep_to = if base > section.begin { section.end } else { base };
                log::debug!("trimming section [{:#x}, {:#x}) to [{:#x}, {:#x})", section.begin, section.end, keep_from, keep_to);
                section.trim(keep_from, keep_to);
            }
        }
    }
}
