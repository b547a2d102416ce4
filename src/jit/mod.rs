//! Compile-on-threshold JIT runtime: turns a hot basic block's decoded
//! instructions into an [`ir::Ir`], optimizes and lowers it to native code,
//! and keeps running compiled successors back to back without returning
//! through the interpreter dispatch loop in between. Grounded on
//! `x64::compiler::Jit` / `CodeSegment`'s compilation-policy and chaining
//! machinery, restricted to the scalar-integer IR subset `codegen.rs`
//! knows how to emit — everything `build_ir` can't lower (memory operands,
//! conditional branches, call/ret/syscall) falls back to the interpreter,
//! exactly as `codesegment.cpp`'s failed-compile path does.

pub mod allocator;
pub mod codegen;
pub mod codesegment;
pub mod ir;
pub mod optimizer;

use std::collections::HashMap;

use iced_x86::{Instruction, Mnemonic, OpKind};

use crate::cpu::Registers;
use crate::error::JitError;
use crate::instruction::{Gpr, X64Instruction};

use allocator::ExecutableMemoryAllocator;
use codegen::{CodeGenerator, RelocationTarget};
use codesegment::{CodeSegment, CompilationCounter, FixedDestinationInfo, JitBasicBlock, VariableDestinationInfo};
use ir::{Ir, IrFlags, IrInstruction, IrOp, Operand, VReg};
use optimizer::Optimizer;

/// Signature of a compiled native block. The sole argument is a pointer to
/// the guest register file in `Gpr::index()` order (`Registers::as_mut_ptr`);
/// the return value is the guest address execution should resume at. Host
/// callee-saved registers and the register-file base are handled entirely
/// within the generated prologue/epilogue (`codegen.rs`), so this is a
/// plain System V `extern "C"` call from the caller's point of view.
pub type NativeEntry = unsafe extern "C" fn(*mut u64) -> u64;

/// Result of asking the JIT to run the block at a guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitExit {
    /// Nothing is compiled there yet — caller falls back to the
    /// interpreter and calls [`Jit::note_execution`] afterwards.
    NotCompiled,
    /// One or more native blocks ran; execution should resume at the
    /// returned guest address (via the interpreter or another `execute`
    /// call, whichever the caller prefers).
    Resumed(u64),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JitStats {
    pub compiled_blocks: u64,
    pub failed_compiles: u64,
    pub chained_jumps: u64,
}

/// Builds IR for one decoded basic block. Covers `mov`/`add`/`sub`/`and`/
/// `or`/`xor`/`not`/`neg`/`cmp`/`test` over register and immediate operands,
/// terminated by at most one direct `jmp` — the subset `codegen.rs` can
/// lower to native code. Any memory operand, conditional branch, call,
/// return, syscall, or opcode outside that set aborts the build with
/// [`JitError::UnsupportedInstruction`]; the caller treats that exactly
/// like a codegen failure and keeps interpreting the block.
fn build_ir(block: &[X64Instruction]) -> Result<Ir, JitError> {
    let mut ir = Ir::new();
    for instr in block {
        let i = &instr.inner;
        if (0..i.op_count()).any(|n| i.op_kind(n) == OpKind::Memory) {
            return Err(JitError::UnsupportedInstruction { rip: i.ip(), mnemonic: format!("{:?} (memory operand)", i.mnemonic()) });
        }
        match i.mnemonic() {
            Mnemonic::Nop => {}
            Mnemonic::Mov => {
                let v = load_operand(&mut ir, i, 1)?;
                store_operand(&mut ir, i, 0, v);
            }
            Mnemonic::Add | Mnemonic::Sub | Mnemonic::And | Mnemonic::Or | Mnemonic::Xor => {
                let op = alu_op(i.mnemonic());
                let a = load_operand(&mut ir, i, 0)?;
                let b = load_operand(&mut ir, i, 1)?;
                let dst = ir.alloc_vreg();
                ir.push(IrInstruction::new(dst, op, i.ip(), IrFlags::UPDATES_FLAGS).with_in1(Operand::Vreg(a)).with_in2(Operand::Vreg(b)));
                store_operand(&mut ir, i, 0, dst);
            }
            Mnemonic::Cmp | Mnemonic::Test => {
                let op = alu_op(i.mnemonic());
                let a = load_operand(&mut ir, i, 0)?;
                let b = load_operand(&mut ir, i, 1)?;
                ir.push(IrInstruction::new(VReg::NONE, op, i.ip(), IrFlags::UPDATES_FLAGS).with_in1(Operand::Vreg(a)).with_in2(Operand::Vreg(b)));
            }
            Mnemonic::Not | Mnemonic::Neg => {
                let op = if i.mnemonic() == Mnemonic::Not { IrOp::Not } else { IrOp::Neg };
                let v = load_operand(&mut ir, i, 0)?;
                let dst = ir.alloc_vreg();
                ir.push(IrInstruction::new(dst, op, i.ip(), IrFlags::empty()).with_in1(Operand::Vreg(v)));
                store_operand(&mut ir, i, 0, dst);
            }
            Mnemonic::Jmp if instr.is_fixed_destination_jump() => {
                let target = instr.branch_target().expect("fixed-destination jump carries a branch target");
                ir.push(IrInstruction::new(VReg::NONE, IrOp::Jmp, i.ip(), IrFlags::TERMINATOR).with_in1(Operand::Imm(target)));
            }
            other => {
                return Err(JitError::UnsupportedInstruction { rip: i.ip(), mnemonic: format!("{other:?}") });
            }
        }
    }
    if !matches!(ir.instructions.last().map(|last| last.op), Some(IrOp::Jmp)) {
        return Err(JitError::CompileError("block has no compilable direct-jump terminator".into()));
    }
    Ok(ir)
}

fn alu_op(m: Mnemonic) -> IrOp {
    match m {
        Mnemonic::Add => IrOp::Add,
        Mnemonic::Sub => IrOp::Sub,
        Mnemonic::And => IrOp::And,
        Mnemonic::Or => IrOp::Or,
        Mnemonic::Xor => IrOp::Xor,
        Mnemonic::Cmp => IrOp::Cmp,
        Mnemonic::Test => IrOp::Test,
        _ => unreachable!("not a binary ALU mnemonic"),
    }
}

fn load_operand(ir: &mut Ir, i: &Instruction, operand: u32) -> Result<VReg, JitError> {
    match i.op_kind(operand) {
        OpKind::Register => {
            let gpr = Gpr::from_iced(i.op_register(operand))
                .ok_or_else(|| JitError::UnsupportedInstruction { rip: i.ip(), mnemonic: "non-GPR register operand".into() })?;
            let dst = ir.alloc_vreg();
            ir.push(IrInstruction::new(dst, IrOp::LoadGpr(gpr), i.ip(), IrFlags::empty()));
            Ok(dst)
        }
        OpKind::Immediate8
        | OpKind::Immediate8_2nd
        | OpKind::Immediate16
        | OpKind::Immediate32
        | OpKind::Immediate64
        | OpKind::Immediate8to16
        | OpKind::Immediate8to32
        | OpKind::Immediate8to64
        | OpKind::Immediate32to64 => {
            let dst = ir.alloc_vreg();
            ir.push(IrInstruction::new(dst, IrOp::Const, i.ip(), IrFlags::empty()).with_in1(Operand::Imm(i.immediate(operand))));
            Ok(dst)
        }
        other => Err(JitError::UnsupportedInstruction { rip: i.ip(), mnemonic: format!("{other:?} operand") }),
    }
}

fn store_operand(ir: &mut Ir, i: &Instruction, operand: u32, value: VReg) {
    if let OpKind::Register = i.op_kind(operand) {
        if let Some(gpr) = Gpr::from_iced(i.op_register(operand)) {
            ir.push(IrInstruction::new(VReg::NONE, IrOp::StoreGpr(gpr), i.ip(), IrFlags::SIDE_EFFECT).with_in1(Operand::Vreg(value)));
        }
    }
}

/// Owns every compiled block for one guest thread, the executable memory
/// backing them, and the per-block-start compilation-threshold counters.
/// One `Jit` belongs to exactly one [`crate::vm::Vm`] thread, matching
/// `SPEC_FULL.md` §5's single-guest-CPU-per-host-thread model.
pub struct Jit {
    segment: CodeSegment,
    allocator: ExecutableMemoryAllocator,
    counters: HashMap<u64, CompilationCounter>,
    compilation_threshold: u32,
    chaining_enabled: bool,
    telemetry_level: u8,
    stats: JitStats,
}

impl Jit {
    pub fn new(compilation_threshold: u32, chaining_enabled: bool, telemetry_level: u8) -> Self {
        Self {
            segment: CodeSegment::new(),
            allocator: ExecutableMemoryAllocator::new(),
            counters: HashMap::new(),
            compilation_threshold,
            chaining_enabled,
            telemetry_level,
            stats: JitStats::default(),
        }
    }

    pub fn is_compiled(&self, guest_addr: u64) -> bool {
        self.segment.find(guest_addr).is_some()
    }

    /// The native bytes compiled for the block beginning at `guest_addr`,
    /// for tests that need to inspect a chaining patch directly rather than
    /// through its observable effect on execution.
    pub fn native_bytes(&self, guest_addr: u64) -> Option<&[u8]> {
        let block = self.segment.find(guest_addr)?;
        // SAFETY: `host_code`/`host_len` describe a live allocation for as
        // long as `segment` holds this block, same as in `execute`.
        Some(unsafe { std::slice::from_raw_parts(block.host_code, block.host_len) })
    }

    /// The host address a compiled block's entry point runs at — what a
    /// chaining patch's `rel32` resolves against.
    pub fn host_entry(&self, guest_addr: u64) -> Option<u64> {
        self.segment.find(guest_addr).map(|b| b.host_code as u64)
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    /// Records one interpreted execution of the block starting at
    /// `guest_addr`. Once its counter reaches the compilation threshold,
    /// attempts to compile `block` and, on success, chains it into any
    /// already-compiled predecessor waiting on it. A failed attempt halves
    /// the counter's remaining budget rather than retrying immediately
    /// (`CompilationCounter`'s one-shot policy, matching `codesegment.cpp`).
    pub fn note_execution(&mut self, guest_addr: u64, block: &[X64Instruction]) {
        if self.segment.find(guest_addr).is_some() {
            return;
        }
        let should_compile = self.counters.entry(guest_addr).or_insert_with(|| CompilationCounter::new(self.compilation_threshold)).tick();
        if !should_compile {
            return;
        }
        match self.compile_block(guest_addr, block) {
            Ok(()) => {
                self.counters.get_mut(&guest_addr).unwrap().record_success();
                self.stats.compiled_blocks += 1;
                if self.telemetry_level >= 1 {
                    log::debug!("jit: compiled block at {guest_addr:#x} ({} compiled, {} failed)", self.stats.compiled_blocks, self.stats.failed_compiles);
                }
            }
            Err(e) => {
                self.counters.get_mut(&guest_addr).unwrap().record_failure();
                self.stats.failed_compiles += 1;
                log::debug!("jit: compilation of block at {guest_addr:#x} abandoned: {e}");
            }
        }
    }

    fn compile_block(&mut self, guest_addr: u64, block: &[X64Instruction]) -> Result<(), JitError> {
        let mut ir = build_ir(block)?;
        Optimizer::new().optimize(&mut ir);
        let buf = CodeGenerator::new().generate(&ir)?;

        let host_len = buf.bytes.len();
        let host_code = self.allocator.allocate(host_len).ok_or(JitError::CodeCacheFull)?;
        // SAFETY: `host_code` was just handed out by `allocator` as an
        // RWX-mapped, `host_len`-byte region not yet aliased by any other
        // compiled block.
        unsafe {
            std::ptr::copy_nonoverlapping(buf.bytes.as_ptr(), host_code, host_len);
        }

        let guest_end = block.last().map(|last| last.next_address()).unwrap_or(guest_addr);
        let mut fixed_destinations = FixedDestinationInfo::default();
        for reloc in &buf.relocations {
            if let RelocationTarget::GuestBlock(target) = reloc.target {
                fixed_destinations.push(target, reloc.offset);
                self.segment.queue_for_chaining(target);
            }
        }

        self.segment.insert(JitBasicBlock {
            guest_begin: guest_addr,
            guest_end,
            host_code,
            host_len,
            fixed_destinations,
            variable_destinations: VariableDestinationInfo::default(),
        });

        if self.chaining_enabled {
            self.chain_into(guest_addr);
        }
        Ok(())
    }

    /// Walks every already-compiled block's fixed-destination slots for one
    /// that targets `newly_compiled` and rewrites it in place to a direct
    /// native branch into the new block's entry (`CodeSegment::
    /// patch_fixed_destinations`), the same self-modifying-code trick
    /// `codesegment.cpp`'s `tryPatch` uses. After this, running the patched
    /// predecessor never returns through [`Jit::execute`]'s dispatch loop at
    /// all for this edge — the host CPU branches straight from one block's
    /// native code into the other's and back, with no trampoline hop through
    /// Rust in between.
    fn chain_into(&mut self, newly_compiled: u64) {
        let patched = self.segment.patch_fixed_destinations(newly_compiled);
        self.stats.chained_jumps += patched as u64;
    }

    /// Runs compiled code starting at `guest_addr`, and keeps running as
    /// long as chaining is enabled and each exit address is itself
    /// compiled — the observable equivalent of `SPEC_FULL.md` §4.6's block
    /// chaining: the VM's interpreter dispatch loop is never re-entered
    /// between a chained block and its successor.
    pub fn execute(&mut self, guest_addr: u64, regs: &mut Registers) -> JitExit {
        let mut addr = guest_addr;
        let mut ran_any = false;
        loop {
            let Some(block) = self.segment.find(addr) else {
                return if ran_any { JitExit::Resumed(addr) } else { JitExit::NotCompiled };
            };
            // SAFETY: `host_code` was populated by `compile_block` with a
            // buffer `CodeGenerator` produced for the `NativeEntry` ABI,
            // and remains valid (and executable) for as long as `segment`
            // holds this block.
            let entry: NativeEntry = unsafe { std::mem::transmute(block.host_code) };
            addr = unsafe { entry(regs.as_mut_ptr()) };
            ran_any = true;
            if !self.chaining_enabled {
                return JitExit::Resumed(addr);
            }
        }
    }

    /// Drops every compiled block intersecting `[begin, end)` and returns
    /// their host memory to the executable allocator's free list, along
    /// with their compilation counters — mirrors `CodeSegment::
    /// removeFromCaches` plus the disassembly cache's own invalidation in
    /// `cache.rs`, both driven from the same MMU protection-change event.
    pub fn invalidate_range(&mut self, begin: u64, end: u64) {
        for (host_code, host_len) in self.segment.invalidate_range(begin, end) {
            self.allocator.free(host_code, host_len);
        }
        self.counters.retain(|addr, _| *addr < begin || *addr >= end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::InstructionDecoder;

    fn decode_all(bytes: &[u8], ip: u64) -> Vec<X64Instruction> {
        let mut dec = InstructionDecoder::new(bytes, ip);
        let mut out = Vec::new();
        while let Some(i) = dec.decode_next() {
            out.push(i);
        }
        out
    }

    #[test]
    fn build_ir_lowers_mov_add_and_direct_jump() {
        // b8 05 00 00 00 = mov eax, 5
        // 01 c8          = add eax, ecx
        // e9 00 00 00 00 = jmp <next ip> (target doesn't need to resolve to
        //                  anything compiled for this test)
        let bytes = vec![0xb8, 0x05, 0x00, 0x00, 0x00, 0x01, 0xc8, 0xe9, 0x00, 0x00, 0x00, 0x00];
        let block = decode_all(&bytes, 0x1000);
        let ir = build_ir(&block).unwrap();
        assert!(matches!(ir.instructions.last().unwrap().op, IrOp::Jmp));
    }

    #[test]
    fn build_ir_rejects_memory_operand() {
        // 8b 00 = mov eax, [rax]
        let bytes = vec![0x8b, 0x00];
        let block = decode_all(&bytes, 0x1000);
        let err = build_ir(&block).unwrap_err();
        assert!(matches!(err, JitError::UnsupportedInstruction { .. }));
    }

    #[test]
    fn note_execution_compiles_after_threshold_and_not_again() {
        let bytes = vec![0xb8, 0x05, 0x00, 0x00, 0x00, 0xe9, 0x00, 0x00, 0x00, 0x00];
        let block = decode_all(&bytes, 0x1000);
        let mut jit = Jit::new(2, true, 0);
        jit.note_execution(0x1000, &block);
        assert!(!jit.is_compiled(0x1000));
        jit.note_execution(0x1000, &block);
        assert!(!jit.is_compiled(0x1000));
        jit.note_execution(0x1000, &block);
        assert!(jit.is_compiled(0x1000));
        assert_eq!(jit.stats().compiled_blocks, 1);
    }

    #[test]
    fn compiled_block_executes_and_returns_jump_target() {
        // mov eax, 7 ; add eax, ecx ; jmp 0x2000
        let mut bytes = vec![0xb8, 0x07, 0x00, 0x00, 0x00, 0x01, 0xc8];
        bytes.extend_from_slice(&[0xe9, 0x00, 0x00, 0x00, 0x00]);
        let block = decode_all(&bytes, 0x1000);
        let jmp_target = block.last().unwrap().branch_target().unwrap();

        let mut jit = Jit::new(0, true, 0);
        jit.note_execution(0x1000, &block);
        assert!(jit.is_compiled(0x1000));

        let mut regs = Registers::default();
        regs.set(Gpr::Rcx, 3);
        let exit = jit.execute(0x1000, &mut regs);
        assert_eq!(exit, JitExit::Resumed(jmp_target));
        assert_eq!(regs.get(Gpr::Rax), 10);
    }

    #[test]
    fn invalidate_range_drops_compiled_block_and_counter() {
        let bytes = vec![0xb8, 0x01, 0x00, 0x00, 0x00, 0xe9, 0x00, 0x00, 0x00, 0x00];
        let block = decode_all(&bytes, 0x1000);
        let mut jit = Jit::new(0, true, 0);
        jit.note_execution(0x1000, &block);
        assert!(jit.is_compiled(0x1000));
        jit.invalidate_range(0x1000, 0x1100);
        assert!(!jit.is_compiled(0x1000));
    }

    /// Interpreter/JIT equivalence property from `SPEC_FULL.md` §8: random
    /// chains of register-to-register ALU opcodes, run once through
    /// `Cpu::step` and once through a forced JIT compile, must leave `eax`
    /// and `ecx` in the same state either way.
    #[test]
    fn interpreter_and_jit_agree_on_random_alu_chains() {
        use crate::cpu::{Cpu, NoopCallback};
        use crate::mmu::Mmu;
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let alu_encodings: [[u8; 2]; 5] = [
            [0x01, 0xc8], // add eax, ecx
            [0x29, 0xc8], // sub eax, ecx
            [0x21, 0xc8], // and eax, ecx
            [0x09, 0xc8], // or eax, ecx
            [0x31, 0xc8], // xor eax, ecx
        ];

        let mut rng = StdRng::seed_from_u64(1234);
        for trial in 0..40u32 {
            let mut bytes = Vec::new();
            let eax0: u32 = rng.gen();
            let ecx0: u32 = rng.gen();
            bytes.push(0xb8); // mov eax, imm32
            bytes.extend_from_slice(&eax0.to_le_bytes());
            bytes.push(0xb9); // mov ecx, imm32
            bytes.extend_from_slice(&ecx0.to_le_bytes());

            let n_ops = rng.gen_range(1..6);
            for _ in 0..n_ops {
                bytes.extend_from_slice(&alu_encodings[rng.gen_range(0..alu_encodings.len())]);
            }
            bytes.extend_from_slice(&[0xe9, 0x00, 0x00, 0x00, 0x00]); // jmp <next>

            let block = decode_all(&bytes, 0x4000);

            let mut mmu = Mmu::new(1 << 16).unwrap();
            let mut cpu = Cpu::new(0x4000);
            for instr in &block {
                cpu.step(&mut mmu, instr, &mut NoopCallback).unwrap();
            }
            let interpreted_eax = cpu.regs.get(Gpr::Rax);
            let interpreted_ecx = cpu.regs.get(Gpr::Rcx);

            let mut jit = Jit::new(0, true, 0);
            jit.note_execution(0x4000, &block);
            assert!(jit.is_compiled(0x4000), "trial {trial}: block failed to compile");
            let mut regs = Registers::default();
            let exit = jit.execute(0x4000, &mut regs);
            assert!(matches!(exit, JitExit::Resumed(_)));

            assert_eq!(regs.get(Gpr::Rax), interpreted_eax, "trial {trial}: eax mismatch");
            assert_eq!(regs.get(Gpr::Rcx), interpreted_ecx, "trial {trial}: ecx mismatch");
        }
    }
}
