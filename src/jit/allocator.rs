//! Executable memory allocator backing compiled basic blocks. Grounded on
//! `ExecutableMemoryAllocator::allocate` (`executablememoryallocator.cpp`):
//! search a free list first, then carve from the tail of an existing
//! reserved range, and only map a fresh range when both fail. Freed blocks
//! go back on the free list rather than being returned to the OS.

use std::sync::Arc;

use crate::mmu::{Prot, ProtFlags, VirtualMemoryRange};

/// Growth factor applied to a requested allocation size before mapping a
/// new backing range, so the next few allocations are likely to fit
/// without another mmap call.
const RANGE_SLOP: f64 = 1.3;

const DEFAULT_RANGE_SIZE: usize = 2 * 1024 * 1024;

struct FreeBlock {
    addr: *mut u8,
    size: usize,
}

struct MemRange {
    range: Arc<VirtualMemoryRange>,
    cursor: usize,
}

impl MemRange {
    fn remaining(&self) -> usize {
        self.range.size() as usize - self.cursor
    }

    fn try_allocate(&mut self, size: usize) -> Option<*mut u8> {
        if self.remaining() < size {
            return None;
        }
        let ptr = unsafe { self.range.base().add(self.cursor) };
        self.cursor += size;
        Some(ptr)
    }
}

/// Hands out writable-then-executable pages for JIT-compiled code.
/// `unsafe impl Send` is sound because every pointer handed out is either
/// still owned by this allocator or has been explicitly leased to exactly
/// one `CodeSegment`, which outlives the JIT's lifetime.
pub struct ExecutableMemoryAllocator {
    ranges: Vec<MemRange>,
    free_list: Vec<FreeBlock>,
    total_allocated: usize,
}

unsafe impl Send for ExecutableMemoryAllocator {}

impl Default for ExecutableMemoryAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutableMemoryAllocator {
    pub fn new() -> Self {
        Self { ranges: Vec::new(), free_list: Vec::new(), total_allocated: 0 }
    }

    /// Allocates `size` bytes of RWX-capable memory. Tries the free list
    /// first (first block large enough wins, remainder goes back on the
    /// list), then the tail of an existing range, then maps a new range
    /// sized to `size * RANGE_SLOP` rounded up to `DEFAULT_RANGE_SIZE`.
    pub fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }
        let max_reusable = ((size as f64 * RANGE_SLOP) as usize).max(size);
        if let Some(idx) = self.free_list.iter().position(|b| b.size >= size && b.size <= max_reusable) {
            let block = self.free_list.swap_remove(idx);
            if block.size > size {
                self.free_list.push(FreeBlock {
                    addr: unsafe { block.addr.add(size) },
                    size: block.size - size,
                });
            }
            self.total_allocated += size;
            return Some(block.addr);
        }

        for range in &mut self.ranges {
            if let Some(ptr) = range.try_allocate(size) {
                self.total_allocated += size;
                return Some(ptr);
            }
        }

        let range_size = ((size as f64 * RANGE_SLOP) as usize).max(DEFAULT_RANGE_SIZE);
        let range_size = (range_size + 0xfff) & !0xfff;
        let vmr = VirtualMemoryRange::try_create(range_size as u64)?;
        let rwx = ProtFlags::single(Prot::Read).union(ProtFlags::single(Prot::Write)).union(ProtFlags::single(Prot::Exec));
        if !vmr.protect(0, range_size as u64, rwx) {
            return None;
        }
        let mut mem_range = MemRange { range: Arc::new(vmr), cursor: 0 };
        let ptr = mem_range.try_allocate(size)?;
        self.ranges.push(mem_range);
        self.total_allocated += size;
        Some(ptr)
    }

    /// Returns a block to the free list. The allocator never calls
    /// `munmap` on the underlying range — recycling keeps the working set
    /// of mapped pages stable across recompilation churn.
    pub fn free(&mut self, addr: *mut u8, size: usize) {
        if size == 0 {
            return;
        }
        self.total_allocated = self.total_allocated.saturating_sub(size);
        self.free_list.push(FreeBlock { addr, size });
    }

    pub fn total_allocated(&self) -> usize {
        self.total_allocated
    }

    pub fn ranges_count(&self) -> usize {
        self.ranges.len()
    }
}
