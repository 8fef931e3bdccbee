//! Error taxonomy for the AArch64 backend.
//!
//! Mirrors the re-architecture note in the design docs: instead of throwing on
//! an unsupported opcode, [`crate::isa::aarch64::lower::OpcodeDispatch`] returns a
//! [`DispatchOutcome`] and lets the driver ([`crate::isa::aarch64::lower::Lowerer`])
//! decide whether to log a warning or escalate to a hard [`CodegenError`].

use crate::il::Opcode;
use std::fmt;

/// Result alias used throughout the backend.
pub type CodegenResult<T> = Result<T, CodegenError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CodegenError {
    #[error("unsupported opcode `{opcode:?}` in function `{function}`")]
    UnsupportedOpcode { opcode: Opcode, function: String },

    #[error("malformed IL in function `{function}`: {reason}")]
    MalformedIl { function: String, reason: String },
}

/// Outcome of attempting to lower a single IL instruction.
///
/// `OpcodeDispatch` never panics or throws for an opcode it simply doesn't
/// implement; it reports back and lets the caller decide (see `spec.md` §7, §9).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The instruction was lowered; MIR was appended to the current block.
    Handled,
    /// The opcode is recognised but not implemented by this backend
    /// (structured-error opcodes: `EhPush`, `EhPop`, `ResumeSame`, ...).
    Unhandled(Opcode),
    /// The IL itself was malformed for this opcode (bad arity, dangling temp).
    Malformed(String),
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchOutcome::Handled => write!(f, "handled"),
            DispatchOutcome::Unhandled(op) => write!(f, "unhandled opcode {op:?}"),
            DispatchOutcome::Malformed(reason) => write!(f, "malformed IL: {reason}"),
        }
    }
}
