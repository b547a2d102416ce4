//! The four knobs a caller can set on a [`crate::vm::Vm`], loaded from a
//! TOML file with `serde` the same way the host crate's deployment
//! configuration is loaded, trimmed down to what a library with no daemon
//! or CLI surface needs.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Size, in bytes, of the contiguous host reservation backing the
    /// guest's entire virtual address space.
    pub guest_memory_reservation: u64,
    /// Number of calls a basic block must receive before the JIT attempts
    /// to compile it.
    pub compilation_threshold: u64,
    /// 0 disables JIT telemetry; higher values enable progressively more
    /// detailed `dumpJitTelemetry`-style logging.
    pub jit_telemetry_level: u8,
    /// Whether compiled blocks patch direct jumps into calls to their
    /// already-compiled successor instead of falling back to the
    /// interpreter dispatch loop.
    pub jit_chaining: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            guest_memory_reservation: 64 * (1u64 << 30),
            compilation_threshold: 1024,
            jit_telemetry_level: 0,
            jit_chaining: true,
        }
    }
}

impl VmConfig {
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = VmConfig::default();
        assert_eq!(cfg.guest_memory_reservation, 64 << 30);
        assert_eq!(cfg.compilation_threshold, 1024);
        assert_eq!(cfg.jit_telemetry_level, 0);
        assert!(cfg.jit_chaining);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let cfg = VmConfig::from_toml("compilation_threshold = 64\n").unwrap();
        assert_eq!(cfg.compilation_threshold, 64);
        assert!(cfg.jit_chaining);
    }
}
