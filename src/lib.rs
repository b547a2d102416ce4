//! User-mode x86-64 CPU emulator with a tracing JIT.
//!
//! [`mmu`] provides a flat, host-backed guest address space; [`cache`]
//! decodes and caches basic blocks out of it; [`cpu`] interprets those
//! blocks against a guest register file; [`jit`] compiles hot blocks to
//! native code once the interpreter has run them often enough; and [`vm`]
//! ties all four together into a round-robin scheduler over one or more
//! guest threads.
//!
//! ```no_run
//! use nvm::config::VmConfig;
//! use nvm::mmu::{Map, Prot};
//! use nvm::primitives::BitFlags;
//! use nvm::vm::Vm;
//!
//! let mut vm = Vm::with_defaults(VmConfig::default()).unwrap();
//! let prot = BitFlags::single(Prot::Read).union(BitFlags::single(Prot::Exec));
//! let base = vm.mmap(0, 0x1000, prot, BitFlags::single(Map::Anonymous)).unwrap();
//! vm.mmu_mut().write8(base, 0xf4); // hlt
//! let thread = vm.spawn_thread(1, 1, base);
//! vm.set_slice(thread, 0, 100).unwrap();
//! vm.run_thread_slice(thread);
//! ```

pub mod cache;
pub mod config;
pub mod cpu;
pub mod error;
pub mod instruction;
pub mod jit;
pub mod mmu;
pub mod primitives;
pub mod vm;

pub use config::VmConfig;
pub use error::{JitError, VerifyError};
pub use vm::{ExitReason, GuestThread, NoopSyscallHandler, SyscallAction, SyscallHandler, Vm, VmTelemetry};
