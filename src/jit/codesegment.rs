//! Compiled basic blocks and the block-chaining machinery that lets one
//! compiled block jump directly into another without falling back through
//! the interpreter's dispatch loop. Grounded on `x64::CodeSegment` /
//! `x64::compiler::Jit`.

use std::collections::HashMap;

/// A direct jump/call target known at compile time: patched in place once
/// the destination block is itself compiled. Mirrors `FixedDestinationInfo`'s
/// two-slot cache — most blocks chain to at most two successors (fallthrough
/// and taken branch), so a fixed two-entry array avoids a heap allocation
/// for the common case.
#[derive(Clone, Copy, Default)]
pub struct FixedDestinationInfo {
    slots: [Option<FixedDestination>; 2],
}

#[derive(Clone, Copy)]
pub struct FixedDestination {
    pub guest_target: u64,
    pub patch_offset: usize,
}

impl FixedDestinationInfo {
    pub fn push(&mut self, guest_target: u64, patch_offset: usize) -> bool {
        for slot in &mut self.slots {
            if slot.is_none() {
                *slot = Some(FixedDestination { guest_target, patch_offset });
                return true;
            }
        }
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = &FixedDestination> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }
}

/// Indirect jump/call targets discovered at runtime — unlike fixed
/// destinations there's no compile-time bound on how many a block might
/// resolve to, so these grow as parallel arrays rather than a fixed cache.
#[derive(Clone, Default)]
pub struct VariableDestinationInfo {
    pub guest_targets: Vec<u64>,
    pub patch_offsets: Vec<usize>,
}

impl VariableDestinationInfo {
    pub fn push(&mut self, guest_target: u64, patch_offset: usize) {
        self.guest_targets.push(guest_target);
        self.patch_offsets.push(patch_offset);
    }
}

/// How many times a block's interpreted slow path has run, and the
/// halving compilation-threshold policy: each failed compile attempt
/// halves the remaining budget rather than resetting it, so a block that
/// fails to compile once (e.g. an unsupported instruction) isn't retried
/// on every single subsequent execution.
pub struct CompilationCounter {
    calls_for_compilation: u32,
    compilation_attempted: bool,
}

impl CompilationCounter {
    pub fn new(initial_threshold: u32) -> Self {
        Self { calls_for_compilation: initial_threshold, compilation_attempted: false }
    }

    /// Called on every interpreted execution of the block. Returns `true`
    /// once the threshold is reached and compilation should be attempted.
    pub fn tick(&mut self) -> bool {
        if self.compilation_attempted {
            return false;
        }
        if self.calls_for_compilation == 0 {
            return true;
        }
        self.calls_for_compilation -= 1;
        false
    }

    /// Records a failed compile attempt: halve the threshold and try again
    /// later, up to the one-shot limit below.
    pub fn record_failure(&mut self) {
        if self.calls_for_compilation == 0 {
            self.compilation_attempted = true;
        } else {
            self.calls_for_compilation /= 2;
        }
    }

    pub fn record_success(&mut self) {
        self.compilation_attempted = true;
    }
}

/// One compiled basic block: its host machine code, the guest address
/// range it covers, and the chaining info needed to patch in direct jumps
/// to sibling blocks once they're compiled too.
pub struct JitBasicBlock {
    pub guest_begin: u64,
    pub guest_end: u64,
    pub host_code: *mut u8,
    pub host_len: usize,
    pub fixed_destinations: FixedDestinationInfo,
    pub variable_destinations: VariableDestinationInfo,
}

unsafe impl Send for JitBasicBlock {}

impl JitBasicBlock {
    pub fn contains(&self, guest_addr: u64) -> bool {
        guest_addr >= self.guest_begin && guest_addr < self.guest_end
    }
}

/// Owns every compiled block and the lookup table used to resolve
/// indirect-branch targets to an already-compiled block, mirroring
/// `x64::CodeSegment`'s block table plus `Jit`'s compilation queue.
#[derive(Default)]
pub struct CodeSegment {
    blocks_by_begin: HashMap<u64, JitBasicBlock>,
    compilation_queue: Vec<u64>,
}

impl CodeSegment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, guest_addr: u64) -> Option<&JitBasicBlock> {
        self.blocks_by_begin.get(&guest_addr).filter(|b| b.contains(guest_addr))
    }

    pub fn insert(&mut self, block: JitBasicBlock) {
        self.blocks_by_begin.insert(block.guest_begin, block);
    }

    /// Called when a block's jump/call target could only be resolved at
    /// compile time to an address that isn't compiled yet — the target is
    /// queued so the chaining patch can be applied once it is.
    pub fn queue_for_chaining(&mut self, guest_target: u64) {
        if !self.blocks_by_begin.contains_key(&guest_target) && !self.compilation_queue.contains(&guest_target) {
            self.compilation_queue.push(guest_target);
        }
    }

    pub fn drain_compilation_queue(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.compilation_queue)
    }

    /// Patches every fixed destination in the segment that targets
    /// `newly_compiled` into a direct near `call` straight into its host
    /// entry, overwriting the placeholder `movabs rax, <target>` sequence
    /// `codegen.rs` left at `dest.patch_offset` — the same bytes
    /// `NativeEntry` would otherwise have returned through `rax` for the
    /// caller to re-dispatch. Mirrors `codesegment.cpp`'s `tryPatch`, which
    /// rewrites the jitted bytes in place.
    ///
    /// A `call` rather than a bare `jmp` into the successor's entry: every
    /// block still carries its own `push rbp`/`push rbx` prologue and
    /// matching epilogue, so jumping straight into another block's prologue
    /// would push a second frame that nothing ever pops, unbalancing the
    /// stack the first time either block's `ret` runs. `call`'s implicit
    /// return address falls straight through the five bytes of NOP padding
    /// left in place of the old placeholder's tail into this block's own
    /// epilogue, so the frame stays balanced while the host CPU still goes
    /// from one block's native code directly into the other's without ever
    /// returning through `Jit::execute`'s dispatch loop in between — the
    /// trampoline hop the chaining exists to remove.
    ///
    /// Returns the number of sites patched; a site whose target is out of
    /// `call rel32`'s +/-2GiB range is left as the `movabs` trampoline and
    /// not counted (the executable allocator's ranges never get anywhere
    /// near that far apart in practice, but the fallback keeps this total).
    pub fn patch_fixed_destinations(&mut self, newly_compiled: u64) -> usize {
        let Some(target_host_code) = self.blocks_by_begin.get(&newly_compiled).map(|b| b.host_code) else {
            return 0;
        };
        let mut patched = 0;
        for block in self.blocks_by_begin.values() {
            if block.guest_begin == newly_compiled {
                // A block whose only fixed destination is itself (a tight
                // guest loop) never gets chained: a `call` into your own
                // entry never returns, and recurses on every guest
                // iteration until the host stack overflows. Left as the
                // `movabs` trampoline, such a block still runs correctly —
                // just one interpreter-dispatch hop per guest iteration.
                continue;
            }
            for dest in block.fixed_destinations.iter() {
                if dest.guest_target != newly_compiled {
                    continue;
                }
                // SAFETY: `dest.patch_offset` was recorded by `codegen.rs` as
                // the start of a 10-byte `movabs rax, imm64` placeholder
                // still live inside `block.host_code`'s `host_len`-byte
                // executable allocation; a 5-byte `call rel32` fits entirely
                // within those 10 bytes.
                unsafe {
                    let site = block.host_code.add(dest.patch_offset);
                    let next_instr = site.add(5) as i64;
                    let rel = target_host_code as i64 - next_instr;
                    let Ok(rel32) = i32::try_from(rel) else { continue };
                    site.write(0xe8); // call rel32
                    std::ptr::copy_nonoverlapping(rel32.to_le_bytes().as_ptr(), site.add(1), 4);
                    for i in 5..10 {
                        site.add(i).write(0x90); // nop out the movabs placeholder's dead tail
                    }
                }
                patched += 1;
            }
        }
        patched
    }

    /// Drops every block whose guest range intersects `[begin, end)`,
    /// returning the host code pointer and length of each so the caller
    /// (the `Jit` runtime) can return that memory to its allocator's free
    /// list instead of leaking it.
    pub fn invalidate_range(&mut self, begin: u64, end: u64) -> Vec<(*mut u8, usize)> {
        let mut removed = Vec::new();
        self.blocks_by_begin.retain(|_, b| {
            let overlaps = !(b.guest_end <= begin || b.guest_begin >= end);
            if overlaps {
                removed.push((b.host_code, b.host_len));
            }
            !overlaps
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.blocks_by_begin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks_by_begin.is_empty()
    }
}
