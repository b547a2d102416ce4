//! Verification and JIT error types, following the hand-rolled `Display` +
//! `std::error::Error` convention used throughout this codebase rather than
//! a derive macro.

/// Raised by the `verify!` macro when an internal invariant doesn't hold.
/// Unlike a panic, callers are expected to catch this at the VM loop's
/// dispatch boundary and mark the offending guest thread dead rather than
/// unwind the whole process.
#[derive(Debug, Clone, Default)]
pub struct VerifyError {
    pub message: Option<String>,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(m) => write!(f, "verification failed: {m}"),
            None => write!(f, "verification failed"),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Checks `$cond`, returning `Err(VerifyError)` from the enclosing function
/// if it's false. The optional message is logged at `error` level first,
/// mirroring `verify(condition, message)` in the original.
#[macro_export]
macro_rules! verify {
    ($cond:expr) => {
        if !($cond) {
            return Err($crate::error::VerifyError { message: None }.into());
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            let msg = format!($($arg)+);
            log::error!("{}", msg);
            return Err($crate::error::VerifyError { message: Some(msg) }.into());
        }
    };
}

/// Outcomes from the compiler pipeline. `CompileError` is recoverable: the
/// caller falls back to interpreting the basic block.
#[derive(Debug, Clone)]
pub enum JitError {
    DecodeError { rip: u64, reason: String },
    InvalidOpcode { rip: u64 },
    UnsupportedInstruction { rip: u64, mnemonic: String },
    CodeCacheFull,
    CompileError(String),
    InvalidRelocation,
    UnresolvedLabel,
}

impl std::fmt::Display for JitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JitError::DecodeError { rip, reason } => write!(f, "decode error at {rip:#x}: {reason}"),
            JitError::InvalidOpcode { rip } => write!(f, "invalid opcode at {rip:#x}"),
            JitError::UnsupportedInstruction { rip, mnemonic } => {
                write!(f, "unsupported instruction {mnemonic} at {rip:#x}")
            }
            JitError::CodeCacheFull => write!(f, "executable code cache is full"),
            JitError::CompileError(reason) => write!(f, "compilation failed: {reason}"),
            JitError::InvalidRelocation => write!(f, "invalid relocation while patching a chained jump"),
            JitError::UnresolvedLabel => write!(f, "unresolved label in generated code"),
        }
    }
}

impl std::error::Error for JitError {}

impl From<VerifyError> for JitError {
    fn from(e: VerifyError) -> Self {
        JitError::CompileError(e.to_string())
    }
}
