//! The VM loop: owns the shared [`Mmu`]/[`DisassemblyCache`]/[`Jit`] for one
//! host thread and a set of cooperatively-scheduled guest threads,
//! dispatching each through the interpreter or the JIT until its slice runs
//! out, it requests a syscall, or it exits. Grounded on `emulator::VM` /
//! `emulator::VMThread`: the tick accounting in [`GuestThread`] mirrors
//! `ThreadTime`, and the parallel `call_stack`/`callpoints` vectors mirror
//! `ThreadCallstackData`'s `callstack_`/`callpoint_`.

use crate::cache::DisassemblyCache;
use crate::cpu::{Cpu, CpuCallback, StepOutcome};
use crate::error::JitError;
use crate::instruction::X64Instruction;
use crate::jit::{Jit, JitExit, JitStats};
use crate::mmu::{page_round_down, page_round_up, MapFlags, Mmu, MmuCallback, MmuError, Prot, ProtFlags};

/// What the kernel layer should do after handling a guest syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallAction {
    /// Clear the syscall request and resume the thread.
    Continue,
    /// The syscall (e.g. `exit`/`exit_group`) terminates the thread.
    ExitThread,
}

/// The external collaborator that actually implements guest syscalls.
/// Nothing in this crate knows what any syscall number means — see
/// `SPEC_FULL.md` §1's Non-goals.
pub trait SyscallHandler {
    fn handle_syscall(&mut self, cpu: &mut Cpu, mmu: &mut Mmu) -> SyscallAction;
}

/// A handler for embedders with no kernel layer wired up yet: every syscall
/// terminates the calling thread.
pub struct NoopSyscallHandler;

impl SyscallHandler for NoopSyscallHandler {
    fn handle_syscall(&mut self, _cpu: &mut Cpu, _mmu: &mut Mmu) -> SyscallAction {
        SyscallAction::ExitThread
    }
}

/// Per-thread syscall/function-call counters, mirroring `VMThread::Stats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadStats {
    pub syscalls: u64,
    pub function_calls: u64,
    pub interpreted_blocks: u64,
    pub jit_blocks: u64,
}

/// One guest thread's saved architectural state plus the VM loop's own
/// bookkeeping: call stack, tick accounting, and exit/syscall request
/// flags. Mirrors `emulator::VMThread`.
pub struct GuestThread {
    pub pid: u32,
    pub tid: u32,
    pub cpu: Cpu,
    /// Return addresses pushed by `CALL`, popped by `RET` — parallel to
    /// `callpoints`. Mirrors `ThreadCallstackData::callstack_`.
    pub call_stack: Vec<u64>,
    /// The address of the `CALL` instruction that pushed the matching
    /// `call_stack` entry. Mirrors `ThreadCallstackData::callpoint_`.
    pub callpoints: Vec<u64>,
    pub stats: ThreadStats,
    wait_time: u64,
    instructions_retired: u64,
    instruction_limit: u64,
    exit_requested: bool,
    syscall_requested: bool,
}

impl GuestThread {
    pub fn new(pid: u32, tid: u32, entry_rip: u64) -> Self {
        Self {
            pid,
            tid,
            cpu: Cpu::new(entry_rip),
            call_stack: Vec::new(),
            callpoints: Vec::new(),
            stats: ThreadStats::default(),
            wait_time: 0,
            instructions_retired: 0,
            instruction_limit: 0,
            exit_requested: false,
            syscall_requested: false,
        }
    }

    pub fn instructions_retired(&self) -> u64 {
        self.instructions_retired
    }

    pub fn is_stop_asked(&self) -> bool {
        self.instructions_retired >= self.instruction_limit
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }

    /// Stops the thread's current slice immediately, as if it had just run
    /// out of budget. Mirrors `ThreadTime::yield()`.
    pub fn request_yield(&mut self) {
        self.instruction_limit = self.instructions_retired;
    }
}

/// Why a dispatch call into the VM loop returned control to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The thread's instruction slice ran out; reschedule it later.
    SliceExhausted,
    /// The thread hit `syscall`/`int 0x80` and the configured
    /// [`SyscallHandler`] has been invoked for it.
    Syscall,
    /// The thread executed `hlt`, a syscall requesting termination, or hit
    /// an unrecoverable error.
    ThreadExited,
    /// Every thread has exited; there is nothing left to schedule.
    NoRunnableThreads,
}

/// Telemetry counters maintained regardless of `jit_telemetry_level`
/// (logging volume is what that knob actually gates), mirroring
/// `emulator::VM`'s `VM_JIT_TELEMETRY`/`VM_BASICBLOCK_TELEMETRY` counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct VmTelemetry {
    pub jit_exit_ret: u64,
    pub jit_exit_indirect_call: u64,
    pub jit_exit_indirect_jmp: u64,
    pub block_cache_hits: u64,
    pub block_cache_misses: u64,
}

/// Notified of `on_syscall` while a block is interpreted. Call-stack
/// bookkeeping is handled separately in [`Vm::interpret_block`] by
/// inspecting the decoded instruction directly, since `on_call` only
/// carries the branch target, not the call site.
struct ThreadTrace<'a> {
    syscall_requested: &'a mut bool,
}

impl CpuCallback for ThreadTrace<'_> {
    fn on_syscall(&mut self, _cpu: &mut Cpu) {
        *self.syscall_requested = true;
    }
}

/// One host thread's emulated guest CPU(s): the shared [`Mmu`], disassembly
/// cache, and JIT runtime, plus a round-robin set of [`GuestThread`]s.
/// Mirrors `emulator::VM`, minus the kernel-layer callback wiring, which is
/// out of scope (see `SPEC_FULL.md` §1).
pub struct Vm<S: SyscallHandler = NoopSyscallHandler> {
    mmu: Mmu,
    cache: DisassemblyCache,
    jit: Jit,
    threads: Vec<GuestThread>,
    next_thread: usize,
    syscall_handler: S,
    telemetry: VmTelemetry,
}

impl<S: SyscallHandler> Vm<S> {
    pub fn new(config: crate::config::VmConfig, syscall_handler: S) -> Result<Self, MmuError> {
        let mmu = Mmu::new(config.guest_memory_reservation)?;
        let threshold = config.compilation_threshold.min(u32::MAX as u64) as u32;
        let jit = Jit::new(threshold, config.jit_chaining, config.jit_telemetry_level);
        Ok(Self {
            mmu,
            cache: DisassemblyCache::new(),
            jit,
            threads: Vec::new(),
            next_thread: 0,
            syscall_handler,
            telemetry: VmTelemetry::default(),
        })
    }

    pub fn mmu(&self) -> &Mmu {
        &self.mmu
    }

    pub fn mmu_mut(&mut self) -> &mut Mmu {
        &mut self.mmu
    }

    pub fn jit_stats(&self) -> JitStats {
        self.jit.stats()
    }

    pub fn jit(&self) -> &Jit {
        &self.jit
    }

    pub fn telemetry(&self) -> VmTelemetry {
        self.telemetry
    }

    pub fn spawn_thread(&mut self, pid: u32, tid: u32, entry_rip: u64) -> usize {
        self.threads.push(GuestThread::new(pid, tid, entry_rip));
        self.threads.len() - 1
    }

    pub fn thread(&self, idx: usize) -> &GuestThread {
        &self.threads[idx]
    }

    pub fn thread_mut(&mut self, idx: usize) -> &mut GuestThread {
        &mut self.threads[idx]
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Arms `idx`'s instruction slice: it may run up to `slice_duration`
    /// more instructions before `is_stop_asked` returns true. `current_tick`
    /// must not be behind the thread's own already-elapsed tick count.
    /// Mirrors `ThreadTime::setSlice`.
    pub fn set_slice(&mut self, idx: usize, current_tick: u64, slice_duration: u64) -> Result<(), JitError> {
        let thread = &mut self.threads[idx];
        crate::verify!(
            current_tick >= thread.wait_time + thread.instructions_retired,
            "set_slice: tick {current_tick} is behind thread {}'s elapsed time",
            thread.tid
        );
        thread.wait_time = current_tick - thread.instructions_retired;
        thread.instruction_limit = thread.instructions_retired + slice_duration;
        Ok(())
    }

    /// Maps guest memory and notifies the disassembly cache of a new
    /// region, per `Mmu::Callback::onRegionCreation`.
    pub fn mmap(&mut self, address: u64, length: u64, prot: ProtFlags, flags: MapFlags) -> Result<u64, MmuError> {
        let base = self.mmu.mmap(address, length, prot, flags)?;
        self.cache.on_region_creation(base, page_round_up(length), prot);
        Ok(base)
    }

    /// Unmaps guest memory, notifying the disassembly cache and the JIT so
    /// any cached sections or compiled blocks over the range are dropped.
    pub fn munmap(&mut self, address: u64, length: u64) -> Result<(), MmuError> {
        let base = page_round_down(address);
        let length = page_round_up(length);
        let prot = self.mmu.prot(base);
        self.mmu.munmap(address, length)?;
        self.cache.on_region_destruction(base, length, prot);
        if prot.test(Prot::Exec) {
            self.jit.invalidate_range(base, base + length);
        }
        Ok(())
    }

    /// Changes a region's protection, notifying the disassembly cache of
    /// the transition and invalidating JIT-compiled blocks that lose EXEC.
    pub fn mprotect(&mut self, address: u64, length: u64, prot: ProtFlags) -> Result<(), MmuError> {
        let base = page_round_down(address);
        let length = page_round_up(length);
        let before = self.mmu.prot(base);
        self.mmu.mprotect(address, length, prot)?;
        self.cache.on_region_protection_change(base, length, before, prot);
        if before.test(Prot::Exec) && !prot.test(Prot::Exec) {
            self.jit.invalidate_range(base, base + length);
        }
        Ok(())
    }

    pub fn brk(&mut self, address: u64) -> Result<u64, MmuError> {
        self.mmu.brk(address)
    }

    /// Runs `idx` until its armed slice is exhausted, it requests a
    /// syscall, or it exits. Does not invoke the syscall handler; callers
    /// that want syscalls handled automatically should use
    /// [`Vm::run_round_robin`] instead.
    pub fn run_thread_slice(&mut self, idx: usize) -> ExitReason {
        loop {
            if self.threads[idx].exit_requested {
                return ExitReason::ThreadExited;
            }
            if self.threads[idx].is_stop_asked() {
                return ExitReason::SliceExhausted;
            }
            if let Err(e) = self.step_one_block(idx) {
                log::warn!("guest thread {} aborted: {e}", self.threads[idx].tid);
                self.threads[idx].exit_requested = true;
                return ExitReason::ThreadExited;
            }
            if self.threads[idx].exit_requested {
                return ExitReason::ThreadExited;
            }
            if self.threads[idx].syscall_requested {
                return ExitReason::Syscall;
            }
        }
    }

    /// Drives the round-robin scheduler: picks the next non-exited thread,
    /// arms it with `slice` instructions, runs it, hands any syscall to the
    /// configured [`SyscallHandler`] and re-enters immediately, and repeats
    /// for up to `max_rounds` dispatched slices or until every thread has
    /// exited, whichever comes first.
    pub fn run_round_robin(&mut self, slice: u64, max_rounds: u64) -> ExitReason {
        if self.threads.is_empty() {
            return ExitReason::NoRunnableThreads;
        }
        for _ in 0..max_rounds {
            let Some(idx) = self.pick_next_runnable() else {
                return ExitReason::NoRunnableThreads;
            };
            let current_tick = self.threads[idx].instructions_retired;
            self.set_slice(idx, current_tick, slice).expect("tick is monotonic by construction");

            loop {
                match self.run_thread_slice(idx) {
                    ExitReason::Syscall => {
                        self.threads[idx].syscall_requested = false;
                        self.threads[idx].stats.syscalls += 1;
                        let action = {
                            let thread = &mut self.threads[idx];
                            self.syscall_handler.handle_syscall(&mut thread.cpu, &mut self.mmu)
                        };
                        match action {
                            SyscallAction::Continue => continue,
                            SyscallAction::ExitThread => {
                                self.threads[idx].exit_requested = true;
                                break;
                            }
                        }
                    }
                    _ => break,
                }
            }
            self.next_thread = (idx + 1) % self.threads.len();
        }
        ExitReason::SliceExhausted
    }

    fn pick_next_runnable(&mut self) -> Option<usize> {
        let start = self.next_thread % self.threads.len().max(1);
        for offset in 0..self.threads.len() {
            let idx = (start + offset) % self.threads.len();
            if !self.threads[idx].exit_requested {
                return Some(idx);
            }
        }
        None
    }

    /// Dispatches exactly one basic block for thread `idx`: through the
    /// JIT if one is already compiled at its current RIP, otherwise through
    /// the interpreter, which also reports the execution to the JIT so it
    /// can count toward that block's compilation threshold.
    fn step_one_block(&mut self, idx: usize) -> Result<(), JitError> {
        let rip = self.threads[idx].cpu.regs.rip();

        if self.jit.is_compiled(rip) {
            let thread = &mut self.threads[idx];
            if let JitExit::Resumed(next) = self.jit.execute(rip, &mut thread.cpu.regs) {
                thread.cpu.regs.set_rip(next);
                thread.instructions_retired += 1;
                thread.stats.jit_blocks += 1;
            }
            return Ok(());
        }

        if self.cache.contains(rip) {
            self.telemetry.block_cache_hits += 1;
        } else {
            self.telemetry.block_cache_misses += 1;
        }

        let block = self
            .cache
            .get_basic_block(rip, &self.mmu)
            .ok_or_else(|| JitError::DecodeError { rip, reason: "no executable bytes at address".into() })?;

        let outcome = self.interpret_block(idx, &block)?;
        self.jit.note_execution(rip, &block);
        self.threads[idx].stats.interpreted_blocks += 1;
        self.threads[idx].instructions_retired += block.len() as u64;

        match outcome {
            StepOutcome::Syscall => self.threads[idx].syscall_requested = true,
            StepOutcome::Halt => self.threads[idx].exit_requested = true,
            StepOutcome::Continue | StepOutcome::Jump(_) => {}
        }
        Ok(())
    }

    /// Interprets every instruction of `block` in order, advancing RIP and
    /// maintaining `call_stack`/`callpoints` and exit-class telemetry along
    /// the way.
    fn interpret_block(&mut self, idx: usize, block: &[X64Instruction]) -> Result<StepOutcome, JitError> {
        let mut outcome = StepOutcome::Continue;
        for instr in block {
            let is_call = instr.is_call();
            let is_return = instr.is_return();
            let is_indirect = instr.is_variable_destination_jump();
            let callsite = instr.address();
            let fallthrough = instr.next_address();

            outcome = {
                let thread = &mut self.threads[idx];
                let mut cb = ThreadTrace { syscall_requested: &mut thread.syscall_requested };
                thread.cpu.step(&mut self.mmu, instr, &mut cb)?
            };

            {
                let thread = &mut self.threads[idx];
                match outcome {
                    StepOutcome::Continue => thread.cpu.regs.set_rip(fallthrough),
                    StepOutcome::Jump(target) => {
                        thread.cpu.regs.set_rip(target);
                        if is_call {
                            thread.call_stack.push(target);
                            thread.callpoints.push(callsite);
                            thread.stats.function_calls += 1;
                        } else if is_return {
                            thread.call_stack.pop();
                            thread.callpoints.pop();
                        }
                    }
                    StepOutcome::Syscall | StepOutcome::Halt => thread.cpu.regs.set_rip(fallthrough),
                }
            }

            if is_return {
                self.telemetry.jit_exit_ret += 1;
            } else if is_indirect && is_call {
                self.telemetry.jit_exit_indirect_call += 1;
            } else if is_indirect {
                self.telemetry.jit_exit_indirect_jmp += 1;
            }

            if !matches!(outcome, StepOutcome::Continue) {
                break;
            }
        }
        Ok(outcome)
    }
}

impl Vm<NoopSyscallHandler> {
    /// Convenience constructor for embedders with no kernel layer yet.
    pub fn with_defaults(config: crate::config::VmConfig) -> Result<Self, MmuError> {
        Self::new(config, NoopSyscallHandler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::instruction::Gpr;
    use crate::mmu::Map;
    use crate::primitives::BitFlags;

    fn rwx() -> ProtFlags {
        BitFlags::single(Prot::Read).union(BitFlags::single(Prot::Write)).union(BitFlags::single(Prot::Exec))
    }

    fn write_code(vm: &mut Vm, addr: u64, bytes: &[u8]) {
        vm.mmu_mut().copy_to_mmu(addr, bytes);
    }

    #[test]
    fn movzx_then_hlt_runs_to_completion_through_the_vm_loop() {
        let mut vm = Vm::with_defaults(VmConfig::default()).unwrap();
        let base = vm.mmap(0x1000, 0x1000, rwx(), BitFlags::single(Map::Anonymous)).unwrap();
        // movzx eax, cl ; hlt
        write_code(&mut vm, base, &[0x0f, 0xb6, 0xc1, 0xf4]);

        let idx = vm.spawn_thread(1, 1, base);
        vm.thread_mut(idx).cpu.regs.set(Gpr::Rcx, 0x58);
        vm.set_slice(idx, 0, 10).unwrap();
        let reason = vm.run_thread_slice(idx);
        assert_eq!(reason, ExitReason::ThreadExited);
        assert_eq!(vm.thread(idx).cpu.regs.get(Gpr::Rax), 0x58);
    }

    #[test]
    fn syscall_hands_off_to_handler_and_resumes() {
        struct CountingHandler {
            calls: u32,
        }
        impl SyscallHandler for CountingHandler {
            fn handle_syscall(&mut self, cpu: &mut Cpu, _mmu: &mut Mmu) -> SyscallAction {
                self.calls += 1;
                cpu.regs.set(Gpr::Rax, 0);
                SyscallAction::Continue
            }
        }

        let mut vm = Vm::new(VmConfig::default(), CountingHandler { calls: 0 }).unwrap();
        let base = vm.mmap(0x2000, 0x1000, rwx(), BitFlags::single(Map::Anonymous)).unwrap();
        // syscall ; hlt
        write_code(&mut vm, base, &[0x0f, 0x05, 0xf4]);

        let idx = vm.spawn_thread(1, 1, base);
        let reason = vm.run_round_robin(100, 10);
        assert_eq!(reason, ExitReason::NoRunnableThreads);
        assert_eq!(vm.thread(idx).stats.syscalls, 1);
        assert_eq!(vm.thread(idx).cpu.regs.get(Gpr::Rax), 0);
    }

    #[test]
    fn slice_exhaustion_stops_before_completion() {
        let mut vm = Vm::with_defaults(VmConfig::default()).unwrap();
        let base = vm.mmap(0x3000, 0x1000, rwx(), BitFlags::single(Map::Anonymous)).unwrap();
        // a run of nops then hlt; a one-instruction slice should stop after
        // the first nop without reaching hlt.
        write_code(&mut vm, base, &[0x90, 0x90, 0x90, 0x90, 0xf4]);

        let idx = vm.spawn_thread(1, 1, base);
        vm.set_slice(idx, 0, 1).unwrap();
        let reason = vm.run_thread_slice(idx);
        assert_eq!(reason, ExitReason::SliceExhausted);
        assert!(!vm.thread(idx).exit_requested());
    }

    #[test]
    fn mprotect_losing_exec_invalidates_cached_block() {
        let mut vm = Vm::with_defaults(VmConfig::default()).unwrap();
        let base = vm.mmap(0x4000, 0x1000, rwx(), BitFlags::single(Map::Anonymous)).unwrap();
        write_code(&mut vm, base, &[0x01, 0xc8, 0xc3]); // add eax, ecx; ret

        assert!(vm.cache.get_basic_block(base, vm.mmu()).is_some());
        vm.mprotect(base, 0x1000, BitFlags::single(Prot::Read).union(BitFlags::single(Prot::Write))).unwrap();
        assert!(vm.cache.try_find_containing_file(base).is_none());
    }

    #[test]
    fn call_then_ret_pushes_and_pops_the_call_stack() {
        let mut vm = Vm::with_defaults(VmConfig::default()).unwrap();
        let base = vm.mmap(0x5000, 0x2000, rwx(), BitFlags::single(Map::Anonymous)).unwrap();
        let callee = base + 0x100;
        // at base: call callee ; hlt
        let mut code = vec![0xe8];
        code.extend_from_slice(&((callee as i64 - (base as i64 + 5)) as i32).to_le_bytes());
        code.push(0xf4);
        write_code(&mut vm, base, &code);
        // at callee: ret
        write_code(&mut vm, callee, &[0xc3]);

        let idx = vm.spawn_thread(1, 1, base);
        vm.set_slice(idx, 0, 10).unwrap();
        vm.run_thread_slice(idx);
        vm.run_thread_slice(idx);
        assert_eq!(vm.thread(idx).call_stack.len(), 0);
        assert_eq!(vm.thread(idx).stats.function_calls, 1);
        assert!(vm.thread(idx).exit_requested());
    }
}
