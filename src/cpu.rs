//! The interpreter: per-opcode execution of decoded guest instructions
//! against a register file and the guest's [`crate::mmu::Mmu`]. Grounded
//! on `x64::Cpu`'s register/flags layout; none of the teacher crate's
//! VMX/ring-0 semantics (CR/DR/MSR emulation, CPUID, interrupt injection)
//! survive here, since this interpreter runs entirely in guest user mode.

use crate::instruction::{Gpr, X64Instruction};
use crate::mmu::Mmu;
use iced_x86::{Mnemonic, OpKind, Register};

/// The sixteen architectural GPRs plus `RIP`; `ZERO` is a synthetic
/// always-zero slot used for displacement-only addressing, never written.
#[derive(Clone, Debug)]
pub struct Registers {
    gprs: [u64; Gpr::COUNT],
}

impl Default for Registers {
    fn default() -> Self {
        Self { gprs: [0; Gpr::COUNT] }
    }
}

impl Registers {
    pub fn get(&self, reg: Gpr) -> u64 {
        if reg == Gpr::Zero {
            0
        } else {
            self.gprs[reg.index()]
        }
    }

    pub fn set(&mut self, reg: Gpr, value: u64) {
        if reg != Gpr::Zero {
            self.gprs[reg.index()] = value;
        }
    }

    pub fn rip(&self) -> u64 {
        self.get(Gpr::Rip)
    }

    pub fn set_rip(&mut self, value: u64) {
        self.set(Gpr::Rip, value);
    }

    /// Raw pointer to the backing register array, in `Gpr::index()` order.
    /// Used as the sole argument handed to JIT-compiled native code (see
    /// `jit::NativeEntry`), which addresses guest registers relative to it.
    pub fn as_mut_ptr(&mut self) -> *mut u64 {
        self.gprs.as_mut_ptr()
    }
}

bitflags::bitflags! {
    /// Arithmetic and control flags. `AF`/`TF` are carried even though the
    /// interpreter currently only computes them for decimal-adjust-style
    /// opcodes — they're part of the real RFLAGS layout the rest of the
    /// register file copies to/from.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RFlags: u64 {
        const CF = 1 << 0;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const DF = 1 << 10;
        const OF = 1 << 11;
    }
}

/// The sixteen Jcc/SETcc/CMOVcc condition codes, shared across all three
/// opcode families so the flag test lives in exactly one place.
#[derive(Clone, Copy)]
enum Cond {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
}

impl Cond {
    fn holds(self, f: &RFlags) -> bool {
        match self {
            Cond::O => f.contains(RFlags::OF),
            Cond::No => !f.contains(RFlags::OF),
            Cond::B => f.contains(RFlags::CF),
            Cond::Ae => !f.contains(RFlags::CF),
            Cond::E => f.contains(RFlags::ZF),
            Cond::Ne => !f.contains(RFlags::ZF),
            Cond::Be => f.contains(RFlags::CF) || f.contains(RFlags::ZF),
            Cond::A => !f.contains(RFlags::CF) && !f.contains(RFlags::ZF),
            Cond::S => f.contains(RFlags::SF),
            Cond::Ns => !f.contains(RFlags::SF),
            Cond::P => f.contains(RFlags::PF),
            Cond::Np => !f.contains(RFlags::PF),
            Cond::L => f.contains(RFlags::SF) != f.contains(RFlags::OF),
            Cond::Ge => f.contains(RFlags::SF) == f.contains(RFlags::OF),
            Cond::Le => f.contains(RFlags::ZF) || (f.contains(RFlags::SF) != f.contains(RFlags::OF)),
            Cond::G => !f.contains(RFlags::ZF) && (f.contains(RFlags::SF) == f.contains(RFlags::OF)),
        }
    }
}

fn condition_from_mnemonic(m: Mnemonic) -> Option<Cond> {
    use Mnemonic::*;
    Some(match m {
        Jo | Seto | Cmovo => Cond::O,
        Jno | Setno | Cmovno => Cond::No,
        Jb | Setb | Cmovb => Cond::B,
        Jae | Setae | Cmovae => Cond::Ae,
        Je | Sete | Cmove => Cond::E,
        Jne | Setne | Cmovne => Cond::Ne,
        Jbe | Setbe | Cmovbe => Cond::Be,
        Ja | Seta | Cmova => Cond::A,
        Js | Sets | Cmovs => Cond::S,
        Jns | Setns | Cmovns => Cond::Ns,
        Jp | Setp | Cmovp => Cond::P,
        Jnp | Setnp | Cmovnp => Cond::Np,
        Jl | Setl | Cmovl => Cond::L,
        Jge | Setge | Cmovge => Cond::Ge,
        Jle | Setle | Cmovle => Cond::Le,
        Jg | Setg | Cmovg => Cond::G,
        _ => return None,
    })
}

/// `2^(width*8) - 1`, the mask of a `width`-byte operand. `width` is
/// always 1/2/4/8 in practice, but the `>= 8` branch is what keeps a
/// genuine 64-bit width from shifting `1u64` out of range.
fn width_mask(width: u32) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (width * 8)) - 1
    }
}

/// Sign-extends a `width`-byte value into an `i128`, wide enough to hold
/// the full double-width product `IMUL` needs to check for overflow.
fn sign_extend(value: u64, width: u32) -> i128 {
    let bits = width * 8;
    let v = (value & width_mask(width)) as u128;
    let shift = 128 - bits;
    (((v << shift) as i128) >> shift) as i128
}

fn is_xmm_reg(r: Register) -> bool {
    (r as u32) >= (Register::XMM0 as u32) && (r as u32) <= (Register::XMM31 as u32)
}

fn is_mmx_reg(r: Register) -> bool {
    (r as u32) >= (Register::MM0 as u32) && (r as u32) <= (Register::MM7 as u32)
}

fn xmm_index(r: Register) -> usize {
    (r as u32 - Register::XMM0 as u32) as usize
}

fn mmx_index(r: Register) -> usize {
    (r as u32 - Register::MM0 as u32) as usize
}

fn is_vector_operand(i: &iced_x86::Instruction, operand: u32) -> bool {
    matches!(i.op_kind(operand), OpKind::Register) && {
        let r = i.op_register(operand);
        is_xmm_reg(r) || is_mmx_reg(r)
    }
}

impl RFlags {
    fn set_from_result(&mut self, result: u64, width: u32) {
        let r = result & width_mask(width);
        self.set(RFlags::ZF, r == 0);
        self.set(RFlags::SF, r & (1u64 << (width * 8 - 1)) != 0);
        self.set(RFlags::PF, (r as u8).count_ones() % 2 == 0);
    }

    fn apply_add(&mut self, a: u64, b: u64, width: u32) -> u64 {
        let mask = width_mask(width);
        let (ua, ub) = (a & mask, b & mask);
        let full = ua as u128 + ub as u128;
        let result = full as u64 & mask;
        let sign = 1u64 << (width * 8 - 1);
        let overflow = (!(ua ^ ub) & (ua ^ result)) & sign != 0;
        self.set(RFlags::CF, full > mask as u128);
        self.set(RFlags::OF, overflow);
        self.set_from_result(result, width);
        result
    }

    fn apply_sub(&mut self, a: u64, b: u64, width: u32) -> u64 {
        let mask = width_mask(width);
        let (ua, ub) = (a & mask, b & mask);
        let result = ua.wrapping_sub(ub) & mask;
        let sign = 1u64 << (width * 8 - 1);
        let overflow = ((ua ^ ub) & (ua ^ result)) & sign != 0;
        self.set(RFlags::CF, ua < ub);
        self.set(RFlags::OF, overflow);
        self.set_from_result(result, width);
        result
    }

    fn apply_adc(&mut self, a: u64, b: u64, width: u32) -> u64 {
        let carry_in = self.contains(RFlags::CF) as u128;
        let mask = width_mask(width);
        let (ua, ub) = (a & mask, b & mask);
        let full = ua as u128 + ub as u128 + carry_in;
        let result = full as u64 & mask;
        let sign = 1u64 << (width * 8 - 1);
        let overflow = (!(ua ^ ub) & (ua ^ result)) & sign != 0;
        self.set(RFlags::CF, full > mask as u128);
        self.set(RFlags::OF, overflow);
        self.set_from_result(result, width);
        result
    }

    fn apply_sbb(&mut self, a: u64, b: u64, width: u32) -> u64 {
        let carry_in = self.contains(RFlags::CF) as u128;
        let mask = width_mask(width) as u128;
        let ua = (a as u128) & mask;
        let ub = ((b as u128) & mask) + carry_in;
        let borrow = ua < ub;
        let result = (ua.wrapping_sub(ub) & mask) as u64;
        let sign = 1u64 << (width * 8 - 1);
        let overflow = ((ua as u64 ^ ub as u64) & (ua as u64 ^ result)) & sign != 0;
        self.set(RFlags::CF, borrow);
        self.set(RFlags::OF, overflow);
        self.set_from_result(result, width);
        result
    }
}

/// A basic block's outcome: where the interpreter (or a JIT-compiled
/// native block, at the `exec` boundary in `jit::mod`) left the guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Fell through to the next sequential instruction.
    Continue,
    /// Took a branch to the given guest address.
    Jump(u64),
    /// The guest executed `syscall`/`int 0x80` — control returns to the
    /// embedder via [`CpuCallback::on_syscall`].
    Syscall,
    /// `hlt` or an unsupported/invalid instruction; the guest thread stops.
    Halt,
}

/// Notified of call/return/syscall/stack-pointer events as the interpreter
/// executes, mirroring `x64::Cpu::Callback`. Default no-op implementations
/// let embedders override only what they need.
pub trait CpuCallback {
    fn on_syscall(&mut self, _cpu: &mut Cpu) {}
    fn on_call(&mut self, _address: u64) {}
    fn on_ret(&mut self) {}
    fn on_stack_change(&mut self, _stackptr: u64) {}
}

pub struct NoopCallback;
impl CpuCallback for NoopCallback {}

/// Per-guest-thread architectural state: GPRs, flags, segment bases, and
/// the vector/x87 register files. One `Cpu` drives exactly one guest
/// thread; SMP is out of scope (see `SPEC_FULL.md` §1 Non-goals).
pub struct Cpu {
    pub regs: Registers,
    pub flags: RFlags,
    pub fs_base: u64,
    pub gs_base: u64,
    pub mmx: [u64; 8],
    pub xmm: [u128; 16],
    /// SSE control/status register; only the rounding-control field (bits
    /// 13:14) is honored, installed into the host's MXCSR around scalar
    /// float ops and restored afterward. `LDMXCSR`/`STMXCSR` themselves
    /// aren't modeled, so guests that never touch this field see the
    /// reset-state default (round-to-nearest, all exceptions masked).
    pub mxcsr: u32,
}

impl Default for Cpu {
    fn default() -> Self {
        Self {
            regs: Registers::default(),
            flags: RFlags::default(),
            fs_base: 0,
            gs_base: 0,
            mmx: [0; 8],
            xmm: [0; 16],
            mxcsr: 0x1f80,
        }
    }
}

impl Cpu {
    pub fn new(entry_rip: u64) -> Self {
        let mut cpu = Self::default();
        cpu.regs.set_rip(entry_rip);
        cpu
    }

    fn gpr_operand(&self, reg: Register) -> Gpr {
        Gpr::from_iced(reg).expect("operand register not a GPR")
    }

    fn read_gpr_sized(&self, reg: Register) -> u64 {
        let full = self.regs.get(self.gpr_operand(reg));
        match reg.size() {
            1 => full & 0xff,
            2 => full & 0xffff,
            4 => full & 0xffff_ffff,
            _ => full,
        }
    }

    fn write_gpr_sized(&mut self, reg: Register, value: u64) {
        let gpr = self.gpr_operand(reg);
        let new = match reg.size() {
            1 => (self.regs.get(gpr) & !0xff) | (value & 0xff),
            2 => (self.regs.get(gpr) & !0xffff) | (value & 0xffff),
            // writing a 32-bit GPR zero-extends into the full 64-bit register
            4 => value & 0xffff_ffff,
            _ => value,
        };
        self.regs.set(gpr, new);
    }

    fn segment_base(&self, segment: Register) -> u64 {
        match segment {
            Register::FS => self.fs_base,
            Register::GS => self.gs_base,
            _ => 0,
        }
    }

    fn effective_address(&self, instr: &iced_x86::Instruction, operand: u32) -> u64 {
        let mut addr = self.segment_base(instr.memory_segment());
        if instr.memory_base() != Register::None {
            addr = addr.wrapping_add(self.read_gpr_sized(instr.memory_base()));
        }
        if instr.memory_index() != Register::None {
            let index = self.read_gpr_sized(instr.memory_index());
            addr = addr.wrapping_add(index.wrapping_mul(instr.memory_index_scale() as u64));
        }
        addr = addr.wrapping_add(instr.memory_displacement64());
        let _ = operand;
        addr
    }

    /// Width in bytes of `operand`: the register's own size, the memory
    /// operand's declared size, or 4 for anything else (immediates never
    /// drive a destination width).
    fn operand_width(&self, instr: &iced_x86::Instruction, operand: u32) -> u32 {
        match instr.op_kind(operand) {
            OpKind::Register => instr.op_register(operand).size() as u32,
            OpKind::Memory => instr.memory_size().size() as u32,
            _ => 4,
        }
    }

    fn read_operand(&self, instr: &iced_x86::Instruction, mmu: &Mmu, operand: u32) -> u64 {
        match instr.op_kind(operand) {
            OpKind::Register => self.read_gpr_sized(instr.op_register(operand)),
            OpKind::Memory => {
                let addr = self.effective_address(instr, operand);
                match instr.memory_size().size() as u32 {
                    1 => mmu.read8(addr) as u64,
                    2 => mmu.read16(addr) as u64,
                    4 => mmu.read32(addr) as u64,
                    _ => mmu.read64(addr),
                }
            }
            OpKind::Immediate8
            | OpKind::Immediate8_2nd
            | OpKind::Immediate16
            | OpKind::Immediate32
            | OpKind::Immediate64
            | OpKind::Immediate8to16
            | OpKind::Immediate8to32
            | OpKind::Immediate8to64
            | OpKind::Immediate32to64 => instr.immediate(operand),
            _ => 0,
        }
    }

    fn write_operand(&mut self, instr: &iced_x86::Instruction, mmu: &mut Mmu, operand: u32, value: u64, width: u32) {
        match instr.op_kind(operand) {
            OpKind::Register => self.write_gpr_sized(instr.op_register(operand), value),
            OpKind::Memory => {
                let addr = self.effective_address(instr, operand);
                match width {
                    1 => mmu.write8(addr, value as u8),
                    2 => mmu.write16(addr, value as u16),
                    4 => mmu.write32(addr, value as u32),
                    _ => mmu.write64(addr, value),
                }
            }
            _ => unreachable!("invalid destination operand kind"),
        }
    }

    /// The shift/rotate count: the source operand masked the way real
    /// hardware masks it (5 bits for 8/16/32-bit destinations, 6 bits for
    /// 64-bit ones), before any further per-opcode clamping.
    fn shift_count(&self, instr: &iced_x86::Instruction, mmu: &Mmu, width: u32) -> u32 {
        let count_mask = if width == 8 { 0x3f } else { 0x1f };
        (self.read_operand(instr, mmu, 1) & count_mask) as u32
    }

    /// Installs the guest's MXCSR rounding-control bits (13:14) into the
    /// host SSE unit for the duration of `f`, restoring the host's prior
    /// value afterward — the delegate-to-host-FPU approach for SSE scalar
    /// ops; x87 has no such stable host control-word setter, so this
    /// crate doesn't attempt to emulate it (see `Cpu::mxcsr`'s doc comment
    /// and the crate-level Non-goals around full x87 precision).
    fn with_guest_rounding<R>(&self, f: impl FnOnce() -> R) -> R {
        #[cfg(target_arch = "x86_64")]
        unsafe {
            let host_saved = std::arch::x86_64::_mm_getcsr();
            std::arch::x86_64::_mm_setcsr((host_saved & !0x6000) | (self.mxcsr & 0x6000));
            let result = f();
            std::arch::x86_64::_mm_setcsr(host_saved);
            result
        }
        #[cfg(not(target_arch = "x86_64"))]
        f()
    }

    fn evaluate_condition(&self, instr: &iced_x86::Instruction) -> bool {
        condition_from_mnemonic(instr.mnemonic()).map(|c| c.holds(&self.flags)).unwrap_or(true)
    }

    /// Executes one decoded instruction. `mmu` is borrowed rather than
    /// owned by `Cpu` since it's shared by every guest thread in the
    /// process (see `SPEC_FULL.md` §5). Covers general-purpose integer
    /// ops at every width, the condition-code family (Jcc/SETcc/CMOVcc),
    /// string ops, and a scalar/packed SSE2 subset; anything outside that
    /// — full x87, the wider AVX surface — falls through to the
    /// `UnsupportedInstruction` error below.
    pub fn step(
        &mut self,
        mmu: &mut Mmu,
        instr: &X64Instruction,
        callback: &mut dyn CpuCallback,
    ) -> Result<StepOutcome, crate::error::JitError> {
        let i = &instr.inner;
        use Mnemonic::*;
        match i.mnemonic() {
            Nop => {}
            Mov => {
                let width = self.operand_width(i, 0);
                let value = self.read_operand(i, mmu, 1);
                self.write_operand(i, mmu, 0, value, width);
            }
            Movzx => {
                // Source width comes from the decoded operand's register/memory
                // size; the destination is always zero-extended to its own width.
                let src_size = match i.op_kind(1) {
                    OpKind::Register => i.op_register(1).size(),
                    OpKind::Memory => i.memory_size().size(),
                    _ => 4,
                };
                let value = match i.op_kind(1) {
                    OpKind::Register => self.read_gpr_sized(i.op_register(1)),
                    OpKind::Memory => {
                        let addr = self.effective_address(i, 1);
                        match src_size {
                            1 => mmu.read8(addr) as u64,
                            2 => mmu.read16(addr) as u64,
                            _ => mmu.read32(addr) as u64,
                        }
                    }
                    _ => 0,
                };
                let value = match src_size {
                    1 => value & 0xff,
                    2 => value & 0xffff,
                    _ => value & 0xffff_ffff,
                };
                self.write_gpr_sized(i.op0_register(), value);
            }
            Movsx | Movsxd => {
                let src_width = match i.op_kind(1) {
                    OpKind::Register => i.op_register(1).size() as u32,
                    OpKind::Memory => i.memory_size().size() as u32,
                    _ => 4,
                };
                let raw = match i.op_kind(1) {
                    OpKind::Register => self.read_gpr_sized(i.op_register(1)),
                    OpKind::Memory => {
                        let addr = self.effective_address(i, 1);
                        match src_width {
                            1 => mmu.read8(addr) as u64,
                            2 => mmu.read16(addr) as u64,
                            _ => mmu.read32(addr) as u64,
                        }
                    }
                    _ => 0,
                };
                let dest_width = i.op_register(0).size() as u32;
                let extended = sign_extend(raw, src_width) as u64 & width_mask(dest_width);
                self.write_gpr_sized(i.op0_register(), extended);
            }
            Lea => {
                let addr = self.effective_address(i, 1);
                self.write_gpr_sized(i.op0_register(), addr);
            }
            Add => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let b = self.read_operand(i, mmu, 1);
                let result = self.flags.apply_add(a, b, width);
                self.write_operand(i, mmu, 0, result, width);
            }
            Sub => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let b = self.read_operand(i, mmu, 1);
                let result = self.flags.apply_sub(a, b, width);
                self.write_operand(i, mmu, 0, result, width);
            }
            Adc => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let b = self.read_operand(i, mmu, 1);
                let result = self.flags.apply_adc(a, b, width);
                self.write_operand(i, mmu, 0, result, width);
            }
            Sbb => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let b = self.read_operand(i, mmu, 1);
                let result = self.flags.apply_sbb(a, b, width);
                self.write_operand(i, mmu, 0, result, width);
            }
            Cmp => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let b = self.read_operand(i, mmu, 1);
                self.flags.apply_sub(a, b, width);
            }
            And => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let b = self.read_operand(i, mmu, 1);
                let result = a & b;
                self.flags.set(RFlags::CF, false);
                self.flags.set(RFlags::OF, false);
                self.flags.set_from_result(result, width);
                self.write_operand(i, mmu, 0, result, width);
            }
            Or => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let b = self.read_operand(i, mmu, 1);
                let result = a | b;
                self.flags.set(RFlags::CF, false);
                self.flags.set(RFlags::OF, false);
                self.flags.set_from_result(result, width);
                self.write_operand(i, mmu, 0, result, width);
            }
            Xor => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let b = self.read_operand(i, mmu, 1);
                let result = a ^ b;
                self.flags.set(RFlags::CF, false);
                self.flags.set(RFlags::OF, false);
                self.flags.set_from_result(result, width);
                self.write_operand(i, mmu, 0, result, width);
            }
            Test => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let b = self.read_operand(i, mmu, 1);
                let result = a & b;
                self.flags.set(RFlags::CF, false);
                self.flags.set(RFlags::OF, false);
                self.flags.set_from_result(result, width);
            }
            Inc => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let cf = self.flags.contains(RFlags::CF);
                let result = self.flags.apply_add(a, 1, width);
                self.flags.set(RFlags::CF, cf);
                self.write_operand(i, mmu, 0, result, width);
            }
            Dec => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let cf = self.flags.contains(RFlags::CF);
                let result = self.flags.apply_sub(a, 1, width);
                self.flags.set(RFlags::CF, cf);
                self.write_operand(i, mmu, 0, result, width);
            }
            Not => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let result = (!a) & width_mask(width);
                self.write_operand(i, mmu, 0, result, width);
            }
            Neg => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let result = self.flags.apply_sub(0, a, width);
                self.flags.set(RFlags::CF, a & width_mask(width) != 0);
                self.write_operand(i, mmu, 0, result, width);
            }
            Imul => {
                let width = self.operand_width(i, 0);
                let (a, b) = match i.op_count() {
                    2 => (self.read_operand(i, mmu, 0), self.read_operand(i, mmu, 1)),
                    3 => (self.read_operand(i, mmu, 1), self.read_operand(i, mmu, 2)),
                    _ => {
                        return Err(crate::error::JitError::UnsupportedInstruction {
                            rip: i.ip(),
                            mnemonic: "imul (one-operand widening form)".into(),
                        })
                    }
                };
                let full = sign_extend(a, width) * sign_extend(b, width);
                let mask = width_mask(width);
                let result = full as u64 & mask;
                let fits = full == sign_extend(result, width);
                self.flags.set(RFlags::CF, !fits);
                self.flags.set(RFlags::OF, !fits);
                self.write_operand(i, mmu, 0, result, width);
            }
            Shl => {
                let width = self.operand_width(i, 0);
                let bits = width * 8;
                let mask = width_mask(width);
                let a = self.read_operand(i, mmu, 0) & mask;
                let count = self.shift_count(i, mmu, width);
                if count != 0 {
                    let result = a.checked_shl(count).unwrap_or(0) & mask;
                    let cf = if count <= bits { (a >> (bits - count)) & 1 != 0 } else { false };
                    self.flags.set(RFlags::CF, cf);
                    if count == 1 {
                        let sign = 1u64 << (bits - 1);
                        self.flags.set(RFlags::OF, (result & sign != 0) != cf);
                    }
                    self.flags.set_from_result(result, width);
                    self.write_operand(i, mmu, 0, result, width);
                }
            }
            Shr => {
                let width = self.operand_width(i, 0);
                let bits = width * 8;
                let mask = width_mask(width);
                let a = self.read_operand(i, mmu, 0) & mask;
                let count = self.shift_count(i, mmu, width);
                if count != 0 {
                    let result = a.checked_shr(count).unwrap_or(0) & mask;
                    let cf = if count <= bits { (a >> (count - 1)) & 1 != 0 } else { false };
                    self.flags.set(RFlags::CF, cf);
                    if count == 1 {
                        let sign = 1u64 << (bits - 1);
                        self.flags.set(RFlags::OF, a & sign != 0);
                    }
                    self.flags.set_from_result(result, width);
                    self.write_operand(i, mmu, 0, result, width);
                }
            }
            Sar => {
                let width = self.operand_width(i, 0);
                let bits = width * 8;
                let a = self.read_operand(i, mmu, 0);
                let count = self.shift_count(i, mmu, width);
                if count != 0 {
                    let signed = sign_extend(a, width);
                    let shift = count.min(bits - 1);
                    let result = (signed >> shift) as u64 & width_mask(width);
                    let bit_pos = count.min(bits) - 1;
                    let cf = (a >> bit_pos) & 1 != 0;
                    self.flags.set(RFlags::CF, cf);
                    if count == 1 {
                        self.flags.set(RFlags::OF, false);
                    }
                    self.flags.set_from_result(result, width);
                    self.write_operand(i, mmu, 0, result, width);
                }
            }
            Rol => {
                let width = self.operand_width(i, 0);
                let bits = width * 8;
                let mask = width_mask(width);
                let a = self.read_operand(i, mmu, 0) & mask;
                let count = self.shift_count(i, mmu, width) % bits;
                if count != 0 {
                    let result = ((a << count) | (a >> (bits - count))) & mask;
                    let cf = result & 1 != 0;
                    self.flags.set(RFlags::CF, cf);
                    if count == 1 {
                        let sign = 1u64 << (bits - 1);
                        self.flags.set(RFlags::OF, (result & sign != 0) != cf);
                    }
                    self.write_operand(i, mmu, 0, result, width);
                }
            }
            Ror => {
                let width = self.operand_width(i, 0);
                let bits = width * 8;
                let mask = width_mask(width);
                let a = self.read_operand(i, mmu, 0) & mask;
                let count = self.shift_count(i, mmu, width) % bits;
                if count != 0 {
                    let result = ((a >> count) | (a << (bits - count))) & mask;
                    let sign = 1u64 << (bits - 1);
                    self.flags.set(RFlags::CF, result & sign != 0);
                    if count == 1 {
                        let second = 1u64 << (bits - 2);
                        self.flags.set(RFlags::OF, (result & sign != 0) != (result & second != 0));
                    }
                    self.write_operand(i, mmu, 0, result, width);
                }
            }
            Push => {
                let value = self.read_operand(i, mmu, 0);
                let new_rsp = self.regs.get(Gpr::Rsp).wrapping_sub(8);
                mmu.write64(new_rsp, value);
                self.regs.set(Gpr::Rsp, new_rsp);
                callback.on_stack_change(new_rsp);
            }
            Pop => {
                let rsp = self.regs.get(Gpr::Rsp);
                let value = mmu.read64(rsp);
                self.regs.set(Gpr::Rsp, rsp.wrapping_add(8));
                self.write_operand(i, mmu, 0, value, 8);
                callback.on_stack_change(rsp.wrapping_add(8));
            }
            Xchg => {
                let width = self.operand_width(i, 0);
                let a = self.read_operand(i, mmu, 0);
                let b = self.read_operand(i, mmu, 1);
                self.write_operand(i, mmu, 0, b, width);
                self.write_operand(i, mmu, 1, a, width);
            }
            Cmpxchg => {
                // LOCK CMPXCHG: compare-and-swap against [EAX], serialized
                // through the destination region's spinlock so concurrent
                // guest threads observe the RMW atomically.
                if i.has_lock_prefix() && i.op_kind(0) == OpKind::Memory {
                    let addr = self.effective_address(i, 0);
                    let expected = self.read_gpr_sized(Register::EAX) as u32;
                    let source = self.read_operand(i, mmu, 1) as u32;
                    let mut flags = self.flags;
                    let mut eax_update = None;
                    mmu.with_exclusive_region_u32(addr, |current| {
                        if current == expected {
                            flags.set(RFlags::ZF, true);
                            source
                        } else {
                            flags.set(RFlags::ZF, false);
                            eax_update = Some(current);
                            current
                        }
                    })
                    .map_err(|e| crate::error::JitError::CompileError(e.to_string()))?;
                    self.flags = flags;
                    if let Some(v) = eax_update {
                        self.write_gpr_sized(Register::EAX, v as u64);
                    }
                } else {
                    let a = self.read_operand(i, mmu, 0) as u32;
                    let expected = self.read_gpr_sized(Register::EAX) as u32;
                    if a == expected {
                        self.flags.set(RFlags::ZF, true);
                        let source = self.read_operand(i, mmu, 1);
                        self.write_operand(i, mmu, 0, source, 4);
                    } else {
                        self.flags.set(RFlags::ZF, false);
                        self.write_gpr_sized(Register::EAX, a as u64);
                    }
                }
            }
            Movsb if i.op_count() == 0 => return self.exec_rep_movs(mmu, 1, i.has_rep_prefix()),
            Movsw if i.op_count() == 0 => return self.exec_rep_movs(mmu, 2, i.has_rep_prefix()),
            Movsd if i.op_count() == 0 => return self.exec_rep_movs(mmu, 4, i.has_rep_prefix()),
            Movsq if i.op_count() == 0 => return self.exec_rep_movs(mmu, 8, i.has_rep_prefix()),
            Stosb if i.op_count() == 0 => return self.exec_rep_stos(mmu, 1, i.has_rep_prefix()),
            Stosw if i.op_count() == 0 => return self.exec_rep_stos(mmu, 2, i.has_rep_prefix()),
            Stosd if i.op_count() == 0 => return self.exec_rep_stos(mmu, 4, i.has_rep_prefix()),
            Stosq if i.op_count() == 0 => return self.exec_rep_stos(mmu, 8, i.has_rep_prefix()),
            Lodsb if i.op_count() == 0 => return self.exec_rep_lods(mmu, 1, i.has_rep_prefix()),
            Lodsw if i.op_count() == 0 => return self.exec_rep_lods(mmu, 2, i.has_rep_prefix()),
            Lodsd if i.op_count() == 0 => return self.exec_rep_lods(mmu, 4, i.has_rep_prefix()),
            Lodsq if i.op_count() == 0 => return self.exec_rep_lods(mmu, 8, i.has_rep_prefix()),
            Scasb if i.op_count() == 0 => return self.exec_rep_scas(mmu, 1, i.has_rep_prefix() || i.has_repne_prefix(), i.has_rep_prefix()),
            Scasw if i.op_count() == 0 => return self.exec_rep_scas(mmu, 2, i.has_rep_prefix() || i.has_repne_prefix(), i.has_rep_prefix()),
            Scasd if i.op_count() == 0 => return self.exec_rep_scas(mmu, 4, i.has_rep_prefix() || i.has_repne_prefix(), i.has_rep_prefix()),
            Scasq if i.op_count() == 0 => return self.exec_rep_scas(mmu, 8, i.has_rep_prefix() || i.has_repne_prefix(), i.has_rep_prefix()),
            Cmpsb if i.op_count() == 0 => return self.exec_rep_cmps(mmu, 1, i.has_rep_prefix() || i.has_repne_prefix(), i.has_rep_prefix()),
            Cmpsw if i.op_count() == 0 => return self.exec_rep_cmps(mmu, 2, i.has_rep_prefix() || i.has_repne_prefix(), i.has_rep_prefix()),
            Cmpsd if i.op_count() == 0 => return self.exec_rep_cmps(mmu, 4, i.has_rep_prefix() || i.has_repne_prefix(), i.has_rep_prefix()),
            Cmpsq if i.op_count() == 0 => return self.exec_rep_cmps(mmu, 8, i.has_rep_prefix() || i.has_repne_prefix(), i.has_rep_prefix()),
            Movaps | Movups => {
                let aligned = i.mnemonic() == Mnemonic::Movaps;
                let value = match i.op_kind(1) {
                    OpKind::Register => self.xmm[xmm_index(i.op_register(1))],
                    OpKind::Memory => {
                        let addr = self.effective_address(i, 1);
                        if aligned {
                            mmu.read128(addr).map_err(|e| crate::error::JitError::CompileError(e.to_string()))?
                        } else {
                            mmu.read_unaligned128(addr)
                        }
                    }
                    _ => 0,
                };
                match i.op_kind(0) {
                    OpKind::Register => self.xmm[xmm_index(i.op0_register())] = value,
                    OpKind::Memory => {
                        let addr = self.effective_address(i, 0);
                        if aligned {
                            mmu.write128(addr, value).map_err(|e| crate::error::JitError::CompileError(e.to_string()))?;
                        } else {
                            mmu.write_unaligned128(addr, value);
                        }
                    }
                    _ => {}
                }
            }
            Pxor => {
                let dest = i.op0_register();
                let a = self.xmm[xmm_index(dest)];
                let b = match i.op_kind(1) {
                    OpKind::Register => self.xmm[xmm_index(i.op_register(1))],
                    OpKind::Memory => mmu.read_unaligned128(self.effective_address(i, 1)),
                    _ => 0,
                };
                self.xmm[xmm_index(dest)] = a ^ b;
            }
            Paddd => {
                let dest = i.op0_register();
                let a = self.xmm[xmm_index(dest)];
                let b = match i.op_kind(1) {
                    OpKind::Register => self.xmm[xmm_index(i.op_register(1))],
                    OpKind::Memory => mmu.read_unaligned128(self.effective_address(i, 1)),
                    _ => 0,
                };
                let mut result = 0u128;
                for lane in 0..4 {
                    let shift = lane * 32;
                    let sum = ((a >> shift) as u32).wrapping_add((b >> shift) as u32);
                    result |= (sum as u128) << shift;
                }
                self.xmm[xmm_index(dest)] = result;
            }
            Paddq => {
                let dest = i.op0_register();
                let a = self.xmm[xmm_index(dest)];
                let b = match i.op_kind(1) {
                    OpKind::Register => self.xmm[xmm_index(i.op_register(1))],
                    OpKind::Memory => mmu.read_unaligned128(self.effective_address(i, 1)),
                    _ => 0,
                };
                let mut result = 0u128;
                for lane in 0..2 {
                    let shift = lane * 64;
                    let sum = ((a >> shift) as u64).wrapping_add((b >> shift) as u64);
                    result |= (sum as u128) << shift;
                }
                self.xmm[xmm_index(dest)] = result;
            }
            Addss | Subss | Mulss | Divss => {
                let dest = i.op0_register();
                let a = f32::from_bits(self.xmm[xmm_index(dest)] as u32);
                let b_bits = match i.op_kind(1) {
                    OpKind::Register => self.xmm[xmm_index(i.op_register(1))] as u32,
                    OpKind::Memory => mmu.read32(self.effective_address(i, 1)),
                    _ => 0,
                };
                let b = f32::from_bits(b_bits);
                let mnemonic = i.mnemonic();
                let result = self.with_guest_rounding(|| match mnemonic {
                    Mnemonic::Addss => a + b,
                    Mnemonic::Subss => a - b,
                    Mnemonic::Mulss => a * b,
                    _ => a / b,
                });
                let old = self.xmm[xmm_index(dest)];
                self.xmm[xmm_index(dest)] = (old & !0xffff_ffffu128) | result.to_bits() as u128;
            }
            Addsd | Subsd | Mulsd | Divsd => {
                let dest = i.op0_register();
                let a = f64::from_bits(self.xmm[xmm_index(dest)] as u64);
                let b_bits = match i.op_kind(1) {
                    OpKind::Register => self.xmm[xmm_index(i.op_register(1))] as u64,
                    OpKind::Memory => mmu.read64(self.effective_address(i, 1)),
                    _ => 0,
                };
                let b = f64::from_bits(b_bits);
                let mnemonic = i.mnemonic();
                let result = self.with_guest_rounding(|| match mnemonic {
                    Mnemonic::Addsd => a + b,
                    Mnemonic::Subsd => a - b,
                    Mnemonic::Mulsd => a * b,
                    _ => a / b,
                });
                let old = self.xmm[xmm_index(dest)];
                self.xmm[xmm_index(dest)] = (old & !0xffff_ffff_ffff_ffffu128) | result.to_bits() as u128;
            }
            Movd | Movq if is_vector_operand(i, 0) && !is_vector_operand(i, 1) => {
                let value = self.read_operand(i, mmu, 1);
                let dest = i.op0_register();
                if is_xmm_reg(dest) {
                    self.xmm[xmm_index(dest)] = value as u128;
                } else {
                    self.mmx[mmx_index(dest)] = value;
                }
            }
            Movd | Movq if !is_vector_operand(i, 0) && is_vector_operand(i, 1) => {
                let src = i.op_register(1);
                let value = if is_xmm_reg(src) { self.xmm[xmm_index(src)] as u64 } else { self.mmx[mmx_index(src)] };
                let width = if i.mnemonic() == Mnemonic::Movd { 4 } else { 8 };
                self.write_operand(i, mmu, 0, value, width);
            }
            Movq if is_vector_operand(i, 0) && is_vector_operand(i, 1) => {
                let src = i.op_register(1);
                let dest = i.op0_register();
                if is_xmm_reg(dest) {
                    let value = if is_xmm_reg(src) { self.xmm[xmm_index(src)] & 0xffff_ffff_ffff_ffff } else { self.mmx[mmx_index(src)] as u128 };
                    self.xmm[xmm_index(dest)] = value;
                } else {
                    self.mmx[mmx_index(dest)] = self.mmx[mmx_index(src)];
                }
            }
            Jmp => {
                return Ok(StepOutcome::Jump(self.branch_target(i, mmu)));
            }
            Call => {
                let target = self.branch_target(i, mmu);
                let new_rsp = self.regs.get(Gpr::Rsp).wrapping_sub(8);
                mmu.write64(new_rsp, i.next_ip());
                self.regs.set(Gpr::Rsp, new_rsp);
                callback.on_call(target);
                callback.on_stack_change(new_rsp);
                return Ok(StepOutcome::Jump(target));
            }
            Ret => {
                let rsp = self.regs.get(Gpr::Rsp);
                let target = mmu.read64(rsp);
                self.regs.set(Gpr::Rsp, rsp.wrapping_add(8));
                callback.on_ret();
                callback.on_stack_change(rsp.wrapping_add(8));
                return Ok(StepOutcome::Jump(target));
            }
            Syscall => {
                callback.on_syscall(self);
                return Ok(StepOutcome::Syscall);
            }
            Hlt => return Ok(StepOutcome::Halt),
            Jo | Jno | Jb | Jae | Je | Jne | Jbe | Ja | Js | Jns | Jp | Jnp | Jl | Jge | Jle | Jg => {
                if self.evaluate_condition(i) {
                    return Ok(StepOutcome::Jump(self.branch_target(i, mmu)));
                }
            }
            Seto | Setno | Setb | Setae | Sete | Setne | Setbe | Seta | Sets | Setns | Setp | Setnp | Setl | Setge | Setle | Setg => {
                let holds = self.evaluate_condition(i) as u64;
                self.write_operand(i, mmu, 0, holds, 1);
            }
            Cmovo | Cmovno | Cmovb | Cmovae | Cmove | Cmovne | Cmovbe | Cmova | Cmovs | Cmovns | Cmovp | Cmovnp | Cmovl | Cmovge | Cmovle | Cmovg => {
                if self.evaluate_condition(i) {
                    let width = self.operand_width(i, 0);
                    let value = self.read_operand(i, mmu, 1);
                    self.write_operand(i, mmu, 0, value, width);
                }
            }
            other => {
                return Err(crate::error::JitError::UnsupportedInstruction {
                    rip: i.ip(),
                    mnemonic: format!("{other:?}"),
                });
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn branch_target(&self, i: &iced_x86::Instruction, mmu: &Mmu) -> u64 {
        match i.op0_kind() {
            OpKind::Register => self.read_gpr_sized(i.op0_register()),
            OpKind::Memory => {
                let addr = self.effective_address(i, 0);
                mmu.read64(addr)
            }
            _ => i.near_branch_target(),
        }
    }

    /// `rep movs`: copies `count` elements of `elem_size` bytes from
    /// `[RSI]` to `[RDI]`, honouring `DF` for the direction of travel.
    /// `repeated` is false for a bare (unprefixed) string instruction,
    /// which still executes exactly once but leaves `RCX` untouched.
    fn exec_rep_movs(&mut self, mmu: &mut Mmu, elem_size: u64, repeated: bool) -> Result<StepOutcome, crate::error::JitError> {
        let step: i64 = if self.flags.contains(RFlags::DF) { -(elem_size as i64) } else { elem_size as i64 };
        let mut count = if repeated { self.regs.get(Gpr::Rcx) } else { 1 };
        let mut src = self.regs.get(Gpr::Rsi);
        let mut dst = self.regs.get(Gpr::Rdi);
        while count > 0 {
            let value = match elem_size {
                1 => mmu.read8(src) as u64,
                2 => mmu.read16(src) as u64,
                4 => mmu.read32(src) as u64,
                _ => mmu.read64(src),
            };
            match elem_size {
                1 => mmu.write8(dst, value as u8),
                2 => mmu.write16(dst, value as u16),
                4 => mmu.write32(dst, value as u32),
                _ => mmu.write64(dst, value),
            }
            src = (src as i64).wrapping_add(step) as u64;
            dst = (dst as i64).wrapping_add(step) as u64;
            count -= 1;
        }
        if repeated {
            self.regs.set(Gpr::Rcx, 0);
        }
        self.regs.set(Gpr::Rsi, src);
        self.regs.set(Gpr::Rdi, dst);
        Ok(StepOutcome::Continue)
    }

    /// `rep stos`: stores the accumulator to `[RDI]` `count` times.
    fn exec_rep_stos(&mut self, mmu: &mut Mmu, elem_size: u64, repeated: bool) -> Result<StepOutcome, crate::error::JitError> {
        let step: i64 = if self.flags.contains(RFlags::DF) { -(elem_size as i64) } else { elem_size as i64 };
        let mut count = if repeated { self.regs.get(Gpr::Rcx) } else { 1 };
        let mut dst = self.regs.get(Gpr::Rdi);
        let acc = self.regs.get(Gpr::Rax);
        while count > 0 {
            match elem_size {
                1 => mmu.write8(dst, acc as u8),
                2 => mmu.write16(dst, acc as u16),
                4 => mmu.write32(dst, acc as u32),
                _ => mmu.write64(dst, acc),
            }
            dst = (dst as i64).wrapping_add(step) as u64;
            count -= 1;
        }
        if repeated {
            self.regs.set(Gpr::Rcx, 0);
        }
        self.regs.set(Gpr::Rdi, dst);
        Ok(StepOutcome::Continue)
    }

    /// `rep lods`: loads `[RSI]` into the accumulator, advancing `count`
    /// times (only the final load's value survives, matching hardware).
    fn exec_rep_lods(&mut self, mmu: &mut Mmu, elem_size: u64, repeated: bool) -> Result<StepOutcome, crate::error::JitError> {
        let step: i64 = if self.flags.contains(RFlags::DF) { -(elem_size as i64) } else { elem_size as i64 };
        let mut count = if repeated { self.regs.get(Gpr::Rcx) } else { 1 };
        let mut src = self.regs.get(Gpr::Rsi);
        let mut value = 0u64;
        while count > 0 {
            value = match elem_size {
                1 => mmu.read8(src) as u64,
                2 => mmu.read16(src) as u64,
                4 => mmu.read32(src) as u64,
                _ => mmu.read64(src),
            };
            src = (src as i64).wrapping_add(step) as u64;
            count -= 1;
        }
        match elem_size {
            1 => self.write_gpr_sized(Register::AL, value),
            2 => self.write_gpr_sized(Register::AX, value),
            4 => self.write_gpr_sized(Register::EAX, value),
            _ => self.regs.set(Gpr::Rax, value),
        }
        if repeated {
            self.regs.set(Gpr::Rcx, 0);
        }
        self.regs.set(Gpr::Rsi, src);
        Ok(StepOutcome::Continue)
    }

    /// `(rep|repne) scas`: compares the accumulator against `[RDI]`,
    /// stopping early when `repe`/`repne`'s ZF condition fails to hold.
    fn exec_rep_scas(&mut self, mmu: &mut Mmu, elem_size: u64, repeated: bool, repe: bool) -> Result<StepOutcome, crate::error::JitError> {
        let step: i64 = if self.flags.contains(RFlags::DF) { -(elem_size as i64) } else { elem_size as i64 };
        let width = elem_size as u32;
        let mut count = if repeated { self.regs.get(Gpr::Rcx) } else { 1 };
        let mut dst = self.regs.get(Gpr::Rdi);
        let acc = self.regs.get(Gpr::Rax) & width_mask(width);
        while count > 0 {
            let value = match elem_size {
                1 => mmu.read8(dst) as u64,
                2 => mmu.read16(dst) as u64,
                4 => mmu.read32(dst) as u64,
                _ => mmu.read64(dst),
            };
            self.flags.apply_sub(acc, value, width);
            dst = (dst as i64).wrapping_add(step) as u64;
            count -= 1;
            if repeated {
                let zf = self.flags.contains(RFlags::ZF);
                if (repe && !zf) || (!repe && zf) {
                    break;
                }
            } else {
                break;
            }
        }
        if repeated {
            self.regs.set(Gpr::Rcx, count);
        }
        self.regs.set(Gpr::Rdi, dst);
        Ok(StepOutcome::Continue)
    }

    /// `(rep|repne) cmps`: compares `[RSI]` against `[RDI]`, same early
    /// exit rule as `exec_rep_scas`.
    fn exec_rep_cmps(&mut self, mmu: &mut Mmu, elem_size: u64, repeated: bool, repe: bool) -> Result<StepOutcome, crate::error::JitError> {
        let step: i64 = if self.flags.contains(RFlags::DF) { -(elem_size as i64) } else { elem_size as i64 };
        let width = elem_size as u32;
        let mut count = if repeated { self.regs.get(Gpr::Rcx) } else { 1 };
        let mut src = self.regs.get(Gpr::Rsi);
        let mut dst = self.regs.get(Gpr::Rdi);
        while count > 0 {
            let a = match elem_size {
                1 => mmu.read8(src) as u64,
                2 => mmu.read16(src) as u64,
                4 => mmu.read32(src) as u64,
                _ => mmu.read64(src),
            };
            let b = match elem_size {
                1 => mmu.read8(dst) as u64,
                2 => mmu.read16(dst) as u64,
                4 => mmu.read32(dst) as u64,
                _ => mmu.read64(dst),
            };
            self.flags.apply_sub(a, b, width);
            src = (src as i64).wrapping_add(step) as u64;
            dst = (dst as i64).wrapping_add(step) as u64;
            count -= 1;
            if repeated {
                let zf = self.flags.contains(RFlags::ZF);
                if (repe && !zf) || (!repe && zf) {
                    break;
                }
            } else {
                break;
            }
        }
        if repeated {
            self.regs.set(Gpr::Rcx, count);
        }
        self.regs.set(Gpr::Rsi, src);
        self.regs.set(Gpr::Rdi, dst);
        Ok(StepOutcome::Continue)
    }
}
