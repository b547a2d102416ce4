//! Typed instruction model and the decoder binding. Decoding itself is
//! delegated to `iced-x86`; this module adds the classification the rest
//! of the emulator needs (fixed- vs variable-destination jumps, register
//! read/write sets) on top of the raw decoded instruction.

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction, Mnemonic, OpKind, Register};

/// One decoded guest instruction together with its length, so callers
/// don't need to re-derive `next_ip` from the decoder.
#[derive(Clone, Debug)]
pub struct X64Instruction {
    pub inner: Instruction,
}

impl X64Instruction {
    pub fn address(&self) -> u64 {
        self.inner.ip()
    }

    pub fn len(&self) -> u32 {
        self.inner.len() as u32
    }

    pub fn next_address(&self) -> u64 {
        self.inner.next_ip()
    }

    pub fn mnemonic(&self) -> Mnemonic {
        self.inner.mnemonic()
    }

    /// A direct `jmp`/`jcc`/`call` whose target is an immediate encoded in
    /// the instruction, as opposed to `jmp rax`/`ret`/`call [rax]` whose
    /// target can only be known at execution time.
    pub fn is_fixed_destination_jump(&self) -> bool {
        matches!(
            self.inner.flow_control(),
            FlowControl::UnconditionalBranch | FlowControl::ConditionalBranch | FlowControl::Call
        ) && matches!(self.inner.op0_kind(), OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64)
    }

    pub fn is_variable_destination_jump(&self) -> bool {
        matches!(
            self.inner.flow_control(),
            FlowControl::IndirectBranch | FlowControl::IndirectCall
        )
    }

    pub fn is_return(&self) -> bool {
        matches!(self.inner.flow_control(), FlowControl::Return)
    }

    pub fn is_call(&self) -> bool {
        matches!(self.inner.flow_control(), FlowControl::Call | FlowControl::IndirectCall)
    }

    /// Basic blocks always end on a control-flow instruction, an
    /// interrupt/syscall, or a `rep`-prefixed string instruction (which the
    /// interpreter treats as a single multi-iteration unit). `call` ends a
    /// block too, consistent with `is_fixed_destination_jump` already
    /// classifying it as a terminator — a block never runs past one.
    pub fn ends_basic_block(&self) -> bool {
        !matches!(self.inner.flow_control(), FlowControl::Next)
            || self.inner.has_rep_prefix()
            || self.inner.has_repe_prefix()
            || self.inner.has_repne_prefix()
            || matches!(self.inner.mnemonic(), Mnemonic::Syscall | Mnemonic::Int | Mnemonic::Int3)
    }

    /// Immediate near-branch target, when the instruction has one.
    pub fn branch_target(&self) -> Option<u64> {
        if self.is_fixed_destination_jump() {
            Some(self.inner.near_branch_target())
        } else {
            None
        }
    }
}

/// Wraps an `iced_x86::Decoder` bound to a borrowed byte slice at a given
/// guest instruction pointer.
pub struct InstructionDecoder<'a> {
    decoder: Decoder<'a>,
}

impl<'a> InstructionDecoder<'a> {
    pub fn new(bytes: &'a [u8], ip: u64) -> Self {
        Self { decoder: Decoder::with_ip(64, bytes, ip, DecoderOptions::NONE) }
    }

    pub fn can_decode(&self) -> bool {
        self.decoder.can_decode()
    }

    pub fn position(&self) -> usize {
        self.decoder.position()
    }

    /// Decodes exactly one instruction, or `None` if the bytes ran out or
    /// the encoding is invalid (callers treat the latter as end-of-block,
    /// deferring to the guest's own fault-on-execute behaviour).
    pub fn decode_next(&mut self) -> Option<X64Instruction> {
        if !self.decoder.can_decode() {
            return None;
        }
        let inner = self.decoder.decode();
        if inner.is_invalid() {
            return None;
        }
        Some(X64Instruction { inner })
    }
}

/// GPR indices used by the interpreter and IR, matching the 16-entry guest
/// register file (`RAX..R15`) plus the synthetic `RIP` and `ZERO` slots
/// used as an always-zero operand for displacement-only addressing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Gpr {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Zero,
}

impl Gpr {
    pub const COUNT: usize = 18;

    pub fn index(self) -> usize {
        self as usize
    }

    /// Maps an `iced_x86::Register` (any width) to the 64-bit GPR that
    /// contains it.
    pub fn from_iced(reg: Register) -> Option<Gpr> {
        use Register::*;
        Some(match reg.full_register() {
            RAX => Gpr::Rax,
            RCX => Gpr::Rcx,
            RDX => Gpr::Rdx,
            RBX => Gpr::Rbx,
            RSP => Gpr::Rsp,
            RBP => Gpr::Rbp,
            RSI => Gpr::Rsi,
            RDI => Gpr::Rdi,
            R8 => Gpr::R8,
            R9 => Gpr::R9,
            R10 => Gpr::R10,
            R11 => Gpr::R11,
            R12 => Gpr::R12,
            R13 => Gpr::R13,
            R14 => Gpr::R14,
            R15 => Gpr::R15,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Segment {
    Cs,
    Ds,
    Es,
    Fs,
    Gs,
    Ss,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_add_eax_ecx() -> Vec<u8> {
        // 01 c8 = add eax, ecx
        vec![0x01, 0xc8]
    }

    #[test]
    fn decodes_simple_add() {
        let bytes = encode_add_eax_ecx();
        let mut dec = InstructionDecoder::new(&bytes, 0x1000);
        let instr = dec.decode_next().unwrap();
        assert_eq!(instr.mnemonic(), Mnemonic::Add);
        assert_eq!(instr.address(), 0x1000);
        assert_eq!(instr.next_address(), 0x1002);
        assert!(!instr.ends_basic_block());
    }

    #[test]
    fn recognizes_fixed_destination_jump() {
        // e9 00 00 00 00 = jmp rel32 (target == next_ip, doesn't matter here)
        let bytes = vec![0xe9, 0x00, 0x00, 0x00, 0x00];
        let mut dec = InstructionDecoder::new(&bytes, 0x2000);
        let instr = dec.decode_next().unwrap();
        assert!(instr.is_fixed_destination_jump());
        assert!(instr.ends_basic_block());
        assert!(instr.branch_target().is_some());
    }

    #[test]
    fn recognizes_indirect_call() {
        // ff d0 = call rax
        let bytes = vec![0xff, 0xd0];
        let mut dec = InstructionDecoder::new(&bytes, 0x3000);
        let instr = dec.decode_next().unwrap();
        assert!(instr.is_variable_destination_jump());
        assert!(instr.is_call());
    }

    #[test]
    fn gpr_from_iced_maps_subregisters_to_full_register() {
        assert_eq!(Gpr::from_iced(Register::AL), Some(Gpr::Rax));
        assert_eq!(Gpr::from_iced(Register::ECX), Some(Gpr::Rcx));
        assert_eq!(Gpr::from_iced(Register::R15D), Some(Gpr::R15));
    }
}
