//! Benchmarks block compilation and the interpreter/JIT dispatch loop,
//! the two throughput-sensitive paths `SPEC_FULL.md` §2 calls out.
//! `criterion` is already a dev-dependency of the host crate for this job.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use nvm::config::VmConfig;
use nvm::instruction::Gpr;
use nvm::mmu::{Map, Prot};
use nvm::primitives::BitFlags;
use nvm::vm::Vm;

fn rwx() -> nvm::mmu::ProtFlags {
    BitFlags::single(Prot::Read).union(BitFlags::single(Prot::Write)).union(BitFlags::single(Prot::Exec))
}

/// A tight loop the compilation threshold will promote to native code
/// partway through: `add eax, ecx` repeated, then `jmp` back to the start.
fn build_hot_loop(vm: &mut Vm, base: u64) {
    let mut code = Vec::new();
    for _ in 0..8 {
        code.extend_from_slice(&[0x01, 0xc8]); // add eax, ecx
    }
    let jmp_site = base + code.len() as u64;
    code.extend_from_slice(&[0xe9, 0, 0, 0, 0]); // jmp base (patched below)
    let rel = (base as i64 - (jmp_site as i64 + 5)) as i32;
    code[code.len() - 4..].copy_from_slice(&rel.to_le_bytes());
    vm.mmu_mut().copy_to_mmu(base, &code);
}

fn bench_interpreted_dispatch(c: &mut Criterion) {
    c.bench_function("interpreter dispatch of a hot add loop", |b| {
        b.iter(|| {
            let mut vm = Vm::with_defaults(VmConfig { compilation_threshold: u64::MAX, ..VmConfig::default() }).unwrap();
            let base = vm.mmap(0x10000, 0x1000, rwx(), BitFlags::single(Map::Anonymous)).unwrap();
            build_hot_loop(&mut vm, base);
            let idx = vm.spawn_thread(1, 1, base);
            vm.thread_mut(idx).cpu.regs.set(Gpr::Rcx, 1);
            vm.set_slice(idx, 0, 2000).unwrap();
            vm.run_thread_slice(idx);
            black_box(vm.thread(idx).cpu.regs.get(Gpr::Rax));
        });
    });
}

fn bench_jit_compilation_and_chained_execution(c: &mut Criterion) {
    c.bench_function("jit compiles and chains a hot add loop", |b| {
        b.iter(|| {
            let mut vm = Vm::with_defaults(VmConfig { compilation_threshold: 4, ..VmConfig::default() }).unwrap();
            let base = vm.mmap(0x20000, 0x1000, rwx(), BitFlags::single(Map::Anonymous)).unwrap();
            build_hot_loop(&mut vm, base);
            let idx = vm.spawn_thread(1, 1, base);
            vm.thread_mut(idx).cpu.regs.set(Gpr::Rcx, 1);
            vm.set_slice(idx, 0, 5000).unwrap();
            vm.run_thread_slice(idx);
            black_box(vm.jit_stats().compiled_blocks);
        });
    });
}

criterion_group!(benches, bench_interpreted_dispatch, bench_jit_compilation_and_chained_execution);
criterion_main!(benches);
