//! Guest virtual memory: a flat, host-backed address space built out of
//! page-aligned regions, in the style of `x64::Mmu` — `mmap`/`munmap`/
//! `mprotect`/`brk` over a single large host reservation rather than a
//! walked page table.

use crate::primitives::{BitFlags, FlagEnum, IntervalItem, IntervalValue, IntervalVector};
use std::sync::Arc;

pub const PAGE_SIZE: u64 = 0x1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Prot {
    Read,
    Write,
    Exec,
}

impl FlagEnum for Prot {
    fn bits(self) -> u64 {
        match self {
            Prot::Read => 1 << 0,
            Prot::Write => 1 << 1,
            Prot::Exec => 1 << 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Map {
    Anonymous,
    Fixed,
    Private,
    Shared,
}

impl FlagEnum for Map {
    fn bits(self) -> u64 {
        match self {
            Map::Anonymous => 1 << 1,
            Map::Fixed => 1 << 2,
            Map::Private => 1 << 3,
            Map::Shared => 1 << 4,
        }
    }
}

pub type ProtFlags = BitFlags<Prot>;
pub type MapFlags = BitFlags<Map>;

/// Host-owned reservation of guest address space, released on drop.
/// Grounded on `host::VirtualMemoryRange`.
pub struct VirtualMemoryRange {
    base: *mut u8,
    size: u64,
}

unsafe impl Send for VirtualMemoryRange {}
unsafe impl Sync for VirtualMemoryRange {}

impl VirtualMemoryRange {
    pub fn try_create(size: u64) -> Option<Self> {
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                size as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return None;
            }
            Some(Self { base: ptr as *mut u8, size })
        }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn protect(&self, offset: u64, length: u64, prot: ProtFlags) -> bool {
        let mut native = 0;
        if prot.test(Prot::Read) {
            native |= libc::PROT_READ;
        }
        if prot.test(Prot::Write) {
            native |= libc::PROT_WRITE;
        }
        if prot.test(Prot::Exec) {
            native |= libc::PROT_EXEC;
        }
        unsafe {
            let addr = self.base.add(offset as usize) as *mut libc::c_void;
            libc::mprotect(addr, length as usize, native) == 0
        }
    }
}

impl Drop for VirtualMemoryRange {
    fn drop(&mut self) {
        if !self.base.is_null() {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size as usize);
            }
        }
    }
}

/// One mapped region of guest address space.
pub struct Region {
    base: u64,
    size: u64,
    prot: ProtFlags,
    name: String,
    lock: crate::primitives::Spinlock,
}

impl Region {
    fn new(base: u64, size: u64, prot: ProtFlags) -> Self {
        Self { base, size, prot, name: String::new(), lock: crate::primitives::Spinlock::new() }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn prot(&self) -> ProtFlags {
        self.prot
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }

    pub fn lock(&self) -> &crate::primitives::Spinlock {
        &self.lock
    }
}

impl IntervalItem for Region {
    fn end(&self) -> u64 {
        self.end()
    }
}

/// Receives notifications about region lifecycle changes. A default no-op
/// implementation is provided for each method so callers override only
/// what they need.
pub trait MmuCallback {
    fn on_region_creation(&mut self, _base: u64, _length: u64, _prot: ProtFlags) {}
    fn on_region_protection_change(&mut self, _base: u64, _length: u64, _before: ProtFlags, _after: ProtFlags) {}
    fn on_region_destruction(&mut self, _base: u64, _length: u64, _prot: ProtFlags) {}
}

/// Notified whenever a range of guest address space is unmapped, even if
/// that range only partially overlaps an existing mapping.
pub trait MunmapCallback {
    fn on_munmap(&mut self, base: u64, length: u64);
}

#[derive(Debug)]
pub struct MmuError(pub String);

impl std::fmt::Display for MmuError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mmu error: {}", self.0)
    }
}

impl std::error::Error for MmuError {}

pub(crate) fn page_round_down(address: u64) -> u64 {
    address & !(PAGE_SIZE - 1)
}

pub(crate) fn page_round_up(address: u64) -> u64 {
    page_round_down(address + PAGE_SIZE - 1)
}

/// The guest's virtual address space: a host-backed flat reservation of
/// `reservation_size` bytes, carved into regions on demand.
pub struct Mmu {
    reservation: Arc<VirtualMemoryRange>,
    regions: IntervalVector<Region>,
    brk_base: u64,
    brk_top: u64,
    top_of_reserved: u64,
}

impl Mmu {
    pub fn new(reservation_size: u64) -> Result<Self, MmuError> {
        let reservation = VirtualMemoryRange::try_create(reservation_size)
            .ok_or_else(|| MmuError("failed to reserve guest address space".into()))?;
        Ok(Self {
            reservation: Arc::new(reservation),
            regions: IntervalVector::new(),
            brk_base: 0,
            brk_top: 0,
            top_of_reserved: 0,
        })
    }

    fn host_ptr(&self, offset: u64) -> *mut u8 {
        unsafe { self.reservation.base().add(offset as usize) }
    }

    fn first_fit_page_aligned(&self, length: u64) -> u64 {
        let mut candidate = self.top_of_reserved;
        for region in self.regions.iter() {
            if candidate + length <= region.start() {
                return candidate;
            }
            candidate = candidate.max(region.end());
        }
        candidate
    }

    pub fn mmap(&mut self, address: u64, length: u64, prot: ProtFlags, flags: MapFlags) -> Result<u64, MmuError> {
        let length = page_round_up(length);
        let explicit = flags.test(Map::Fixed) || address != 0;
        let base = if explicit { page_round_down(address) } else { self.first_fit_page_aligned(length) };
        if explicit {
            // FIXED (or any other explicit address) replaces whatever
            // already lives there atomically, per `SPEC_FULL.md` §4.2 —
            // without this, a remap over a live region would either panic
            // inside `IntervalVector::insert`'s overlap assertion or, for a
            // remap whose start lands inside (rather than at the edge of)
            // an existing region, silently violate the no-overlap invariant.
            self.regions.remove(base, base + length);
        }
        let mut region = IntervalValue::new(base, base + length);
        region.push(Region::new(base, length, prot));
        self.regions.insert(region);
        if !self.reservation.protect(base, length, prot) {
            return Err(MmuError("host mprotect failed during mmap".into()));
        }
        self.top_of_reserved = self.top_of_reserved.max(base + length);
        Ok(base)
    }

    pub fn munmap(&mut self, address: u64, length: u64) -> Result<(), MmuError> {
        let base = page_round_down(address);
        let length = page_round_up(length);
        self.reservation.protect(base, length, BitFlags::new());
        self.regions.remove(base, base + length);
        Ok(())
    }

    pub fn mprotect(&mut self, address: u64, length: u64, prot: ProtFlags) -> Result<(), MmuError> {
        let base = page_round_down(address);
        let length = page_round_up(length);
        if !self.reservation.protect(base, length, prot) {
            return Err(MmuError("host mprotect failed".into()));
        }
        self.regions.for_each_mut_in_range(base, base + length, |region| {
            region.prot = prot;
        });
        Ok(())
    }

    pub fn brk(&mut self, address: u64) -> Result<u64, MmuError> {
        if address == 0 {
            return Ok(self.brk_top);
        }
        if self.brk_base == 0 {
            self.brk_base = page_round_up(address);
            self.brk_top = self.brk_base;
        }
        let new_top = page_round_up(address);
        if new_top > self.brk_top {
            let grow = new_top - self.brk_top;
            self.mmap(self.brk_top, grow, BitFlags::single(Prot::Read).union(BitFlags::single(Prot::Write)), BitFlags::single(Map::Anonymous).union(BitFlags::single(Map::Private)))?;
        }
        self.brk_top = new_top;
        Ok(self.brk_top)
    }

    pub fn find_address(&self, address: u64) -> Option<&Region> {
        self.regions.find(address).and_then(|iv| iv_region(iv))
    }

    pub fn prot(&self, address: u64) -> ProtFlags {
        self.find_address(address).map(|r| r.prot()).unwrap_or_else(BitFlags::new)
    }

    pub fn read8(&self, addr: u64) -> u8 {
        unsafe { *self.host_ptr(addr) }
    }

    pub fn write8(&mut self, addr: u64, value: u8) {
        unsafe { *self.host_ptr(addr) = value }
    }

    pub fn read16(&self, addr: u64) -> u16 {
        unsafe { (self.host_ptr(addr) as *const u16).read_unaligned() }
    }

    pub fn write16(&mut self, addr: u64, value: u16) {
        unsafe { (self.host_ptr(addr) as *mut u16).write_unaligned(value) }
    }

    pub fn read32(&self, addr: u64) -> u32 {
        unsafe { (self.host_ptr(addr) as *const u32).read_unaligned() }
    }

    pub fn write32(&mut self, addr: u64, value: u32) {
        unsafe { (self.host_ptr(addr) as *mut u32).write_unaligned(value) }
    }

    pub fn read64(&self, addr: u64) -> u64 {
        unsafe { (self.host_ptr(addr) as *const u64).read_unaligned() }
    }

    pub fn write64(&mut self, addr: u64, value: u64) {
        unsafe { (self.host_ptr(addr) as *mut u64).write_unaligned(value) }
    }

    /// Reads a 128-bit value. `addr` must be 16-byte aligned; use
    /// [`Mmu::read_unaligned128`] when the guest access doesn't guarantee
    /// that (e.g. an unaligned SSE load).
    pub fn read128(&self, addr: u64) -> Result<u128, MmuError> {
        if addr % 16 != 0 {
            return Err(MmuError(format!("unaligned 128-bit read at {:#x}", addr)));
        }
        Ok(unsafe { *(self.host_ptr(addr) as *const u128) })
    }

    /// Writes a 128-bit value. `addr` must be 16-byte aligned; use
    /// [`Mmu::write_unaligned128`] otherwise.
    pub fn write128(&mut self, addr: u64, value: u128) -> Result<(), MmuError> {
        if addr % 16 != 0 {
            return Err(MmuError(format!("unaligned 128-bit write at {:#x}", addr)));
        }
        unsafe { *(self.host_ptr(addr) as *mut u128) = value };
        Ok(())
    }

    pub fn read_unaligned128(&self, addr: u64) -> u128 {
        unsafe { (self.host_ptr(addr) as *const u128).read_unaligned() }
    }

    pub fn write_unaligned128(&mut self, addr: u64, value: u128) {
        unsafe { (self.host_ptr(addr) as *mut u128).write_unaligned(value) }
    }

    pub fn copy_from_mmu(&self, dst: &mut [u8], src: u64) {
        unsafe {
            std::ptr::copy_nonoverlapping(self.host_ptr(src), dst.as_mut_ptr(), dst.len());
        }
    }

    pub fn copy_to_mmu(&mut self, dst: u64, src: &[u8]) {
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.host_ptr(dst), src.len());
        }
    }

    pub fn read_string(&self, src: u64) -> String {
        let mut bytes = Vec::new();
        let mut addr = src;
        loop {
            let b = self.read8(addr);
            if b == 0 {
                break;
            }
            bytes.push(b);
            addr += 1;
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Performs `modify` on the value at `ptr` while holding the owning
    /// region's spinlock, so concurrent `LOCK CMPXCHG`-style read-modify-
    /// write sequences from other guest threads observe a consistent value.
    pub fn with_exclusive_region_u32(&mut self, addr: u64, modify: impl FnOnce(u32) -> u32) -> Result<(), MmuError> {
        let lock_ptr: *const crate::primitives::Spinlock = {
            let region = self.regions.find(addr).and_then(iv_region).ok_or_else(|| MmuError("no region found".into()))?;
            region.lock()
        };
        // Safety: the region outlives this call — it's only ever removed by
        // `munmap`, which the caller must not invoke concurrently with this.
        let _guard = unsafe { (*lock_ptr).lock() };
        let old = self.read32(addr);
        let new = modify(old);
        self.write32(addr, new);
        Ok(())
    }
}

impl crate::cache::BytecodeRetriever for Mmu {
    fn retrieve_bytecode(&self, address: u64, size: u64) -> Option<(Vec<u8>, String, u64)> {
        let region = self.find_address(address)?;
        if !region.prot().test(Prot::Exec) {
            return None;
        }
        let available = region.end().saturating_sub(address).min(size.max(1));
        let mut buf = vec![0u8; available as usize];
        self.copy_from_mmu(&mut buf, address);
        Some((buf, region.name().to_string(), region.base()))
    }
}

fn iv_region(iv: &IntervalValue<Region>) -> Option<&Region> {
    let mut found = None;
    iv.for_each(|r| found = Some(r as *const Region));
    found.map(|p| unsafe { &*p })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmap_then_read_write_roundtrip() {
        let mut mmu = Mmu::new(1 << 20).unwrap();
        let base = mmu
            .mmap(0, 0x1000, BitFlags::single(Prot::Read).union(BitFlags::single(Prot::Write)), BitFlags::single(Map::Anonymous))
            .unwrap();
        mmu.write32(base + 8, 0xdead_beef);
        assert_eq!(mmu.read32(base + 8), 0xdead_beef);
    }

    #[test]
    fn munmap_then_remap_is_allowed() {
        let mut mmu = Mmu::new(1 << 20).unwrap();
        let base = mmu.mmap(0, 0x1000, BitFlags::single(Prot::Read), BitFlags::single(Map::Anonymous)).unwrap();
        mmu.munmap(base, 0x1000).unwrap();
        assert!(mmu.find_address(base).is_none());
        let base2 = mmu.mmap(0, 0x1000, BitFlags::single(Prot::Read), BitFlags::single(Map::Anonymous)).unwrap();
        assert!(mmu.find_address(base2).is_some());
    }

    #[test]
    fn brk_extends_monotonically() {
        let mut mmu = Mmu::new(1 << 20).unwrap();
        let a = mmu.brk(0x10000).unwrap();
        let b = mmu.brk(0x20000).unwrap();
        assert!(b >= a);
    }

    #[test]
    fn mprotect_updates_region_flags() {
        let mut mmu = Mmu::new(1 << 20).unwrap();
        let base = mmu.mmap(0, 0x1000, BitFlags::single(Prot::Read), BitFlags::single(Map::Anonymous)).unwrap();
        mmu.mprotect(base, 0x1000, BitFlags::single(Prot::Read).union(BitFlags::single(Prot::Exec))).unwrap();
        assert!(mmu.prot(base).test(Prot::Exec));
    }

    #[test]
    fn read128_rejects_unaligned_address_but_unaligned_variant_allows_it() {
        let mut mmu = Mmu::new(1 << 20).unwrap();
        let base = mmu
            .mmap(0, 0x1000, BitFlags::single(Prot::Read).union(BitFlags::single(Prot::Write)), BitFlags::single(Map::Anonymous))
            .unwrap();
        mmu.write_unaligned128(base + 1, 0x1122_3344_5566_7788_99aa_bbcc_ddee_ff00);
        assert!(mmu.read128(base + 1).is_err());
        assert_eq!(mmu.read_unaligned128(base + 1), 0x1122_3344_5566_7788_99aa_bbcc_ddee_ff00);
        mmu.write128(base + 16, 0xdead_beef).unwrap();
        assert_eq!(mmu.read128(base + 16).unwrap(), 0xdead_beef);
    }

    #[test]
    fn retrieves_bytecode_only_from_executable_regions() {
        use crate::cache::BytecodeRetriever;
        let mut mmu = Mmu::new(1 << 20).unwrap();
        let base = mmu
            .mmap(0, 0x1000, BitFlags::single(Prot::Read).union(BitFlags::single(Prot::Exec)), BitFlags::single(Map::Anonymous))
            .unwrap();
        mmu.write32(base, 0x9090_9090);
        assert!(mmu.retrieve_bytecode(base, 4).is_some());

        let data_base = mmu.mmap(0, 0x1000, BitFlags::single(Prot::Read), BitFlags::single(Map::Anonymous)).unwrap();
        assert!(mmu.retrieve_bytecode(data_base, 4).is_none());
    }

    /// MMU overlap invariant from `SPEC_FULL.md` §8: after any sequence of
    /// `mmap`/`munmap`/`mprotect` calls, the region list stays sorted and
    /// disjoint. Runs a random walk of page-aligned operations and checks
    /// the invariant after every step, not just at the end, so a
    /// transiently-broken sequence can't slip past a final-state-only
    /// check.
    #[test]
    fn region_list_stays_disjoint_after_random_map_operations() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        const PAGE: u64 = 0x1000;
        let mut rng = StdRng::seed_from_u64(99);
        let mut mmu = Mmu::new(1 << 24).unwrap();
        let mut live_bases: Vec<u64> = Vec::new();

        for _ in 0..200 {
            match rng.gen_range(0..3) {
                0 => {
                    let pages = rng.gen_range(1..4);
                    let prot = match rng.gen_range(0..3) {
                        0 => BitFlags::single(Prot::Read),
                        1 => BitFlags::single(Prot::Read).union(BitFlags::single(Prot::Write)),
                        _ => BitFlags::single(Prot::Read).union(BitFlags::single(Prot::Exec)),
                    };
                    if let Ok(base) = mmu.mmap(0, pages * PAGE, prot, BitFlags::single(Map::Anonymous)) {
                        live_bases.push(base);
                    }
                }
                1 if !live_bases.is_empty() => {
                    let idx = rng.gen_range(0..live_bases.len());
                    let base = live_bases.remove(idx);
                    mmu.munmap(base, PAGE).unwrap();
                }
                2 if !live_bases.is_empty() => {
                    let idx = rng.gen_range(0..live_bases.len());
                    let base = live_bases[idx];
                    let prot = if rng.gen_bool(0.5) { BitFlags::single(Prot::Read) } else { BitFlags::single(Prot::Read).union(BitFlags::single(Prot::Write)) };
                    mmu.mprotect(base, PAGE, prot).unwrap();
                }
                _ => {}
            }

            let mut previous_end: Option<u64> = None;
            for interval in mmu.regions.iter() {
                if let Some(end) = previous_end {
                    assert!(interval.start() >= end, "overlapping regions: previous end {end:#x}, next start {:#x}", interval.start());
                }
                assert!(interval.start() < interval.end(), "zero/negative-length region in the list");
                previous_end = Some(interval.end());
            }
        }
    }
}
