//! The AArch64 backend of the Viper compiler.
//!
//! This crate takes a single [`il::Function`] (already parsed, type-checked, and
//! optimised by an upstream frontend) and produces AArch64 assembly text
//! conforming to AAPCS64 (Darwin flavour). See `isa::aarch64` for the pipeline:
//! frame layout, liveness, lowering, linear-scan register allocation, peephole,
//! and assembly emission.

pub mod error;
pub mod il;
pub mod isa;

pub use error::{CodegenError, CodegenResult};
pub use isa::aarch64::{AArch64Backend, Flags};

/// Compile a single IL function to AArch64 assembly text using the default
/// Darwin/macOS target flags.
pub fn compile_function(func: &il::Function) -> CodegenResult<String> {
    AArch64Backend::new(Flags::default()).compile_function(func)
}
