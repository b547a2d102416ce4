//! Host x86-64 code generator: turns optimized IR into a byte buffer of
//! native machine code. Grounded on the original's assembler/code
//! generator pair — a straight-line emitter over a growable byte buffer,
//! walking the IR once and emitting one instruction sequence per IR op,
//! with fixups recorded for anything whose target isn't known yet (a
//! forward jump, a not-yet-compiled call target).
//!
//! This only emits for the scalar-integer subset in [`super::ir::IrOp`] —
//! each guest register is kept resident in the `Cpu`'s register file in
//! host memory, addressed relative to a fixed base pointer held in `rbx`
//! for the lifetime of the generated block, rather than allocated to host
//! registers. It trades peak throughput for an encoder simple enough to
//! trust without a disassembler to check its own output.

use super::ir::{Ir, IrOp, Operand, VReg};
use crate::error::JitError;

/// Where in the generated byte stream a relocation needs patching once its
/// target address is known — either a guest basic block (resolved once
/// that block itself is compiled) or an internal label within this buffer.
#[derive(Clone, Copy, Debug)]
pub enum RelocationTarget {
    GuestBlock(u64),
    Label(u32),
}

#[derive(Clone, Copy, Debug)]
pub struct Relocation {
    pub offset: usize,
    pub target: RelocationTarget,
}

/// Accumulates emitted bytes and records patch sites, the same job
/// `x64::compiler::Assembler` does over a `std::vector<uint8_t>`.
#[derive(Default)]
pub struct CodeBuffer {
    pub bytes: Vec<u8>,
    pub relocations: Vec<Relocation>,
    labels: std::collections::HashMap<u32, usize>,
}

impl CodeBuffer {
    fn push_u8(&mut self, b: u8) {
        self.bytes.push(b);
    }

    fn push_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn push_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn mark_label(&mut self, label: u32) {
        self.labels.insert(label, self.bytes.len());
    }

    fn offset(&self) -> usize {
        self.bytes.len()
    }
}

/// Offset of each guest register within the interpreter's register file,
/// matching `Gpr::index() * 8` so generated loads/stores agree with
/// `Registers`' layout in `cpu.rs`.
fn reg_file_offset(gpr: crate::instruction::Gpr) -> i32 {
    (gpr.index() as i32) * 8
}

pub struct CodeGenerator {
    buf: CodeBuffer,
    /// Host stack slot assigned to each virtual register, relative to rbp.
    slots: std::collections::HashMap<VReg, i32>,
    next_slot: i32,
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeGenerator {
    pub fn new() -> Self {
        Self { buf: CodeBuffer::default(), slots: std::collections::HashMap::new(), next_slot: -8 }
    }

    fn slot_for(&mut self, v: VReg) -> i32 {
        *self.slots.entry(v).or_insert_with(|| {
            let s = self.next_slot;
            self.next_slot -= 8;
            s
        })
    }

    /// Emits the standard prologue: push rbp, mov rbp,rsp, push rbx (callee-
    /// saved, repurposed for the lifetime of the block to hold the guest
    /// register file pointer), then loads that pointer from `rdi` — the
    /// sole argument of the `NativeEntry` calling convention (System V:
    /// first integer argument arrives in `rdi`).
    fn emit_prologue(&mut self) {
        self.buf.push_u8(0x55); // push rbp
        self.buf.bytes.extend_from_slice(&[0x48, 0x89, 0xe5]); // mov rbp, rsp
        self.buf.push_u8(0x53); // push rbx
        self.buf.bytes.extend_from_slice(&[0x48, 0x89, 0xfb]); // mov rbx, rdi
    }

    fn emit_epilogue(&mut self) {
        self.buf.push_u8(0x5b); // pop rbx
        self.buf.bytes.extend_from_slice(&[0x48, 0x89, 0xec]); // mov rsp, rbp
        self.buf.push_u8(0x5d); // pop rbp
        self.buf.push_u8(0xc3); // ret
    }

    /// mov rax, [rbp + slot]
    fn emit_load_slot_to_rax(&mut self, slot: i32) {
        self.buf.bytes.extend_from_slice(&[0x48, 0x8b, 0x85]);
        self.buf.push_u32(slot as u32);
    }

    /// mov [rbp + slot], rax
    fn emit_store_rax_to_slot(&mut self, slot: i32) {
        self.buf.bytes.extend_from_slice(&[0x48, 0x89, 0x85]);
        self.buf.push_u32(slot as u32);
    }

    fn emit_load_operand_to_rax(&mut self, op: Operand) {
        match op {
            Operand::Imm(v) => {
                // mov eax, imm32 — a 32-bit destination write always zero-extends
                // into rax on x86-64, matching the interpreter's 32-bit operand
                // semantics in `cpu::Cpu::read_operand32`.
                self.buf.push_u8(0xb8);
                self.buf.push_u32(v as u32);
            }
            Operand::Vreg(v) => {
                let slot = self.slot_for(v);
                self.emit_load_slot_to_rax(slot);
            }
            Operand::Gpr(gpr) => {
                // mov eax, [rbx + offset] — 32-bit load, zero-extends into rax
                // so the in-memory register file's upper 32 bits read as zero
                // the same way `Cpu::read_operand32` narrows its reads.
                self.buf.bytes.extend_from_slice(&[0x8b, 0x83]);
                self.buf.push_u32(reg_file_offset(gpr) as u32);
            }
            _ => {}
        }
    }

    fn emit_binary_alu(&mut self, op: IrOp, dst: VReg, in1: Operand, in2: Operand) -> Result<(), JitError> {
        self.emit_load_operand_to_rax(in1);
        // mov ecx, <in2> — 32-bit forms throughout, for the same
        // zero-extension reason as `emit_load_operand_to_rax`.
        match in2 {
            Operand::Imm(v) => {
                self.buf.push_u8(0xb9);
                self.buf.push_u32(v as u32);
            }
            Operand::Vreg(v) => {
                let slot = self.slot_for(v);
                self.buf.bytes.extend_from_slice(&[0x48, 0x8b, 0x8d]); // mov rcx, [rbp+slot]
                self.buf.push_u32(slot as u32);
            }
            Operand::Gpr(gpr) => {
                self.buf.bytes.extend_from_slice(&[0x8b, 0x8b]); // mov ecx, [rbx+off]
                self.buf.push_u32(reg_file_offset(gpr) as u32);
            }
            _ => return Err(JitError::CompileError("binary alu op missing rhs operand".into())),
        }
        match op {
            IrOp::Add => self.buf.bytes.extend_from_slice(&[0x01, 0xc8]), // add eax, ecx
            IrOp::Sub | IrOp::Cmp => self.buf.bytes.extend_from_slice(&[0x29, 0xc8]), // sub eax, ecx
            IrOp::And | IrOp::Test => self.buf.bytes.extend_from_slice(&[0x21, 0xc8]), // and eax, ecx
            IrOp::Or => self.buf.bytes.extend_from_slice(&[0x09, 0xc8]), // or eax, ecx
            IrOp::Xor => self.buf.bytes.extend_from_slice(&[0x31, 0xc8]), // xor eax, ecx
            _ => return Err(JitError::CompileError(format!("{op:?} is not a binary alu op"))),
        }
        if !matches!(op, IrOp::Cmp | IrOp::Test) {
            let slot = self.slot_for(dst);
            self.emit_store_rax_to_slot(slot);
        }
        Ok(())
    }

    /// Lowers one optimized [`Ir`] block to native code, returning the
    /// finished buffer. Any unsupported opcode aborts the whole block — the
    /// interpreter remains available as a fallback for it.
    pub fn generate(mut self, ir: &Ir) -> Result<CodeBuffer, JitError> {
        self.emit_prologue();
        for instr in &ir.instructions {
            match instr.op {
                IrOp::Const => {
                    self.emit_load_operand_to_rax(instr.in1);
                    let slot = self.slot_for(instr.dst);
                    self.emit_store_rax_to_slot(slot);
                }
                IrOp::LoadGpr(gpr) => {
                    // mov eax, [rbx+off] — 32-bit load, zero-extends into rax
                    // the same way every other register-file read does.
                    self.buf.bytes.extend_from_slice(&[0x8b, 0x83]);
                    self.buf.push_u32(reg_file_offset(gpr) as u32);
                    let slot = self.slot_for(instr.dst);
                    self.emit_store_rax_to_slot(slot);
                }
                IrOp::StoreGpr(gpr) => {
                    self.emit_load_operand_to_rax(instr.in1);
                    self.buf.bytes.extend_from_slice(&[0x48, 0x89, 0x83]); // mov [rbx+off], rax
                    self.buf.push_u32(reg_file_offset(gpr) as u32);
                }
                IrOp::Add | IrOp::Sub | IrOp::And | IrOp::Or | IrOp::Xor | IrOp::Cmp | IrOp::Test => {
                    self.emit_binary_alu(instr.op, instr.dst, instr.in1, instr.in2)?;
                }
                IrOp::Not => {
                    self.emit_load_operand_to_rax(instr.in1);
                    self.buf.bytes.extend_from_slice(&[0xf7, 0xd0]); // not eax
                    let slot = self.slot_for(instr.dst);
                    self.emit_store_rax_to_slot(slot);
                }
                IrOp::Neg => {
                    self.emit_load_operand_to_rax(instr.in1);
                    self.buf.bytes.extend_from_slice(&[0xf7, 0xd8]); // neg eax
                    let slot = self.slot_for(instr.dst);
                    self.emit_store_rax_to_slot(slot);
                }
                IrOp::Ret => {
                    self.emit_epilogue();
                    return Ok(self.buf);
                }
                IrOp::Jmp => {
                    // The block's only supported terminator: a direct jump to
                    // a guest address known at compile time. Until its target
                    // is itself compiled, this is a `movabs rax, <target>`
                    // followed by the epilogue — `NativeEntry`'s contract is
                    // that its return value is the guest address execution
                    // should resume at. The instruction's start offset is
                    // recorded as a relocation so `CodeSegment::
                    // patch_fixed_destinations` can later overwrite these same
                    // bytes with a direct relative branch into the target's
                    // host entry once it compiles, chaining the two blocks
                    // without a trampoline hop back through this
                    // `NativeEntry` call.
                    if let Operand::Imm(target) = instr.in1 {
                        let offset = self.buf.offset();
                        self.buf.push_u8(0x48);
                        self.buf.push_u8(0xb8); // movabs rax, imm64
                        self.buf.push_u64(target);
                        self.buf.relocations.push(Relocation { offset, target: RelocationTarget::GuestBlock(target) });
                    }
                    self.emit_epilogue();
                    return Ok(self.buf);
                }
                IrOp::Syscall | IrOp::Call | IrOp::Jcc(_) => {
                    // Control flow bails out to the interpreter dispatch loop;
                    // the VM resumes there with the guest rip already updated.
                    self.emit_epilogue();
                    return Ok(self.buf);
                }
                other => {
                    return Err(JitError::UnsupportedInstruction { rip: instr.guest_rip, mnemonic: format!("{other:?}") });
                }
            }
        }
        self.emit_epilogue();
        Ok(self.buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{IrFlags, IrInstruction};
    use crate::instruction::Gpr;

    #[test]
    fn generates_nonempty_buffer_for_simple_add() {
        let mut ir = Ir::new();
        let a = ir.alloc_vreg();
        ir.push(IrInstruction::new(a, IrOp::LoadGpr(Gpr::Rax), 0, IrFlags::empty()));
        let b = ir.alloc_vreg();
        ir.push(IrInstruction::new(b, IrOp::LoadGpr(Gpr::Rcx), 0, IrFlags::empty()));
        let sum = ir.alloc_vreg();
        ir.push(
            IrInstruction::new(sum, IrOp::Add, 0, IrFlags::UPDATES_FLAGS)
                .with_in1(Operand::Vreg(a))
                .with_in2(Operand::Vreg(b)),
        );
        ir.push(IrInstruction::new(VReg::NONE, IrOp::StoreGpr(Gpr::Rax), 0, IrFlags::SIDE_EFFECT).with_in1(Operand::Vreg(sum)));
        ir.push(IrInstruction::new(VReg::NONE, IrOp::Ret, 0, IrFlags::TERMINATOR));

        let gen = CodeGenerator::new();
        let buf = gen.generate(&ir).unwrap();
        assert!(!buf.bytes.is_empty());
        assert_eq!(*buf.bytes.last().unwrap(), 0xc3);
    }

    #[test]
    fn unsupported_opcode_is_reported_as_jit_error() {
        let mut ir = Ir::new();
        ir.push(IrInstruction::new(VReg::NONE, IrOp::Select, 0, IrFlags::empty()));
        let gen = CodeGenerator::new();
        let err = gen.generate(&ir).unwrap_err();
        assert!(matches!(err, JitError::UnsupportedInstruction { .. }));
    }

    /// Assembler round-trip property from `SPEC_FULL.md` §8: for random
    /// two-operand ALU IR, the host bytes this module emits must decode
    /// back (through the same `iced-x86` decoder `instruction.rs` wraps
    /// for guest disassembly) into the expected host mnemonic over `eax`
    /// and `ecx` — the generator never emits anything the decoder itself
    /// would call malformed or reassign to different registers.
    #[test]
    fn generated_alu_bytes_round_trip_through_the_decoder() {
        use iced_x86::{Decoder, DecoderOptions, Mnemonic as HostMnemonic, Register as HostRegister};
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let cases = [
            (IrOp::Add, HostMnemonic::Add),
            (IrOp::Sub, HostMnemonic::Sub),
            (IrOp::And, HostMnemonic::And),
            (IrOp::Or, HostMnemonic::Or),
            (IrOp::Xor, HostMnemonic::Xor),
        ];

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..30 {
            let (irop, expect_mnemonic) = cases[rng.gen_range(0..cases.len())];

            let mut ir = Ir::new();
            let a = ir.alloc_vreg();
            ir.push(IrInstruction::new(a, IrOp::LoadGpr(crate::instruction::Gpr::Rax), 0, IrFlags::empty()));
            let b = ir.alloc_vreg();
            ir.push(IrInstruction::new(b, IrOp::LoadGpr(crate::instruction::Gpr::Rcx), 0, IrFlags::empty()));
            let dst = ir.alloc_vreg();
            ir.push(IrInstruction::new(dst, irop, 0, IrFlags::UPDATES_FLAGS).with_in1(Operand::Vreg(a)).with_in2(Operand::Vreg(b)));
            if !matches!(irop, IrOp::Cmp | IrOp::Test) {
                ir.push(IrInstruction::new(VReg::NONE, IrOp::StoreGpr(crate::instruction::Gpr::Rax), 0, IrFlags::SIDE_EFFECT).with_in1(Operand::Vreg(dst)));
            }

            let buf = CodeGenerator::new().generate(&ir).unwrap();

            let mut decoder = Decoder::with_ip(64, &buf.bytes, 0, DecoderOptions::NONE);
            let mut decoded = Vec::new();
            while decoder.can_decode() {
                let mut instr = iced_x86::Instruction::default();
                decoder.decode_out(&mut instr);
                decoded.push(instr);
            }
            assert!(!decoded.is_empty(), "decoder produced no instructions for {expect_mnemonic:?}");

            let found = decoded.iter().any(|instr| {
                instr.mnemonic() == expect_mnemonic
                    && instr.op0_register() == HostRegister::EAX
                    && instr.op1_register() == HostRegister::ECX
            });
            assert!(found, "expected a decoded `{expect_mnemonic:?} eax, ecx` in {decoded:?} for IR op {irop:?}");
        }
    }
}
