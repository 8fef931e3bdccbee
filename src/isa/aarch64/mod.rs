//! ARM 64-bit Instruction Set Architecture, Darwin/macOS AAPCS64 flavour.
//!
//! Pipeline (`spec.md` §2): `Lowerer` builds the stack frame, runs cross-block
//! liveness, and lowers IL to MIR (trying `FastPaths` before the generic
//! `OpcodeDispatch`/`TerminatorLowering` walk); `RegAllocLinear` then assigns
//! physical registers; `Peephole` cleans up the result; `AsmEmitter` prints it.

mod abi;
mod context;
mod emit;
mod fastpaths;
mod frame;
mod instr_lowering;
mod liveness;
mod lower;
mod mir;
mod peephole;
mod regalloc;
mod target;
mod terminator;

use crate::error::{CodegenError, CodegenResult};
use crate::il;
use target::TargetDescriptor;

/// Backend-wide options. Only the Darwin/arm64 target flavour is supported
/// (`spec.md` §3.1); other flavours are a sibling backend's concern, not a
/// runtime switch on this one.
#[derive(Debug, Clone)]
pub struct Flags {
    /// Promote an unsupported or malformed opcode from a logged warning
    /// (the default) to a hard [`CodegenError`]. Off by default so a
    /// best-effort frontend can still get assembly for the parts of a
    /// function this backend does handle.
    pub strict_unsupported_opcodes: bool,

    /// Run the `Peephole` pass after register allocation. Disabling it is
    /// useful when comparing pre/post-peephole output, e.g. in tests.
    pub enable_peephole: bool,

    /// Try `FastPaths` before falling back to the generic pipeline. Disabling
    /// it forces every function through `OpcodeDispatch`/`TerminatorLowering`,
    /// which is how tests assert the two paths are observationally
    /// equivalent (`spec.md` §4.6).
    pub enable_fastpaths: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Flags { strict_unsupported_opcodes: false, enable_peephole: true, enable_fastpaths: true }
    }
}

/// The AArch64 (Darwin) backend: owns no per-function state, so one instance
/// can compile any number of functions, including concurrently from multiple
/// threads (`spec.md` §5, §9).
pub struct AArch64Backend {
    flags: Flags,
    target: TargetDescriptor,
}

impl AArch64Backend {
    pub fn new(flags: Flags) -> Self {
        AArch64Backend { flags, target: TargetDescriptor::darwin_arm64() }
    }

    /// Compile one IL function to AAPCS64 (Darwin) assembly text, running the
    /// full pipeline: `Lowerer` -> `RegAllocLinear` -> `Peephole` -> `AsmEmitter`
    /// (`spec.md` §2).
    pub fn compile_function(&self, func: &il::Function) -> CodegenResult<String> {
        let (mut mf, mut frame, unhandled) = lower::lower_function(func, &self.target, self.flags.enable_fastpaths);

        if self.flags.strict_unsupported_opcodes {
            if let Some(outcome) = unhandled.into_iter().next() {
                return Err(match outcome {
                    crate::error::DispatchOutcome::Unhandled(opcode) => {
                        CodegenError::UnsupportedOpcode { opcode, function: func.name.clone() }
                    }
                    crate::error::DispatchOutcome::Malformed(reason) => {
                        CodegenError::MalformedIl { function: func.name.clone(), reason }
                    }
                    crate::error::DispatchOutcome::Handled => unreachable!("Handled is never recorded"),
                });
            }
        }

        regalloc::allocate(&mut mf, &self.target, &mut frame);
        mf.frame = frame.finalize();

        if self.flags.enable_peephole {
            let stats = peephole::run(&mut mf);
            log::debug!(
                "{}: peephole rewrote {} constants, folded {} moves, removed {} identities, {} dead instrs, {} branches-to-next, reordered {} cold blocks",
                func.name,
                stats.constant_rewrites,
                stats.moves_folded,
                stats.identities_removed,
                stats.dead_instrs_removed,
                stats.branches_to_next_removed,
                stats.blocks_reordered,
            );
        }

        debug_assert!(mf.is_fully_allocated(), "register allocation left virtual registers in {}", func.name);
        Ok(emit::emit(&mf))
    }
}

impl Default for AArch64Backend {
    fn default() -> Self {
        Self::new(Flags::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{Block, BlockParam, Instruction, Opcode, TempId, Type, Value};

    #[test]
    fn compiles_identity_function_via_fast_path() {
        let mut entry = Block::new("entry");
        entry.params.push(BlockParam { id: TempId(0), ty: Type::I64 });
        entry.insts.push(Instruction::new(Opcode::Ret).with_operands(vec![Value::Temp(TempId(0))]));
        let func = il::Function { name: "id".into(), blocks: vec![entry] };

        let backend = AArch64Backend::new(Flags::default());
        let asm = backend.compile_function(&func).expect("compiles");
        assert!(asm.contains(".globl _id"));
        assert!(asm.contains("ret"));
    }

    #[test]
    fn compiles_function_with_branch_through_generic_pipeline() {
        let mut entry = Block::new("entry");
        entry.params.push(BlockParam { id: TempId(0), ty: Type::I64 });
        entry.insts.push(
            Instruction::new(Opcode::ICmpEq)
                .with_result(TempId(1), Type::I1)
                .with_operands(vec![Value::Temp(TempId(0)), Value::ConstInt(0)]),
        );
        entry.insts.push(
            Instruction::new(Opcode::CBr)
                .with_operands(vec![Value::Temp(TempId(1))])
                .with_labels(vec!["zero".into(), "nonzero".into()])
                .with_block_args(vec![vec![], vec![]]),
        );
        let mut zero = Block::new("zero");
        zero.insts.push(Instruction::new(Opcode::Ret).with_operands(vec![Value::ConstInt(0)]));
        let mut nonzero = Block::new("nonzero");
        nonzero.insts.push(Instruction::new(Opcode::Ret).with_operands(vec![Value::ConstInt(1)]));
        let func = il::Function { name: "is_zero".into(), blocks: vec![entry, zero, nonzero] };

        let backend = AArch64Backend::new(Flags::default());
        let asm = backend.compile_function(&func).expect("compiles");
        assert!(asm.contains("cmp"));
        assert!(asm.contains("b."));
    }

    #[test]
    fn compile_function_entry_point_from_crate_root_matches() {
        let mut entry = Block::new("entry");
        entry.insts.push(Instruction::new(Opcode::Ret).with_operands(vec![Value::ConstInt(7)]));
        let func = il::Function { name: "seven".into(), blocks: vec![entry] };
        let asm = crate::compile_function(&func).expect("compiles");
        assert!(asm.contains("mov x0, #7"));
    }

    #[test]
    fn unhandled_opcode_is_a_warning_by_default_and_a_hard_error_when_strict() {
        let mut entry = Block::new("entry");
        entry.insts.push(Instruction::new(Opcode::EhPush));
        entry.insts.push(Instruction::new(Opcode::Ret).with_operands(vec![Value::ConstInt(0)]));
        let func = il::Function { name: "uses_eh".into(), blocks: vec![entry] };

        let lenient = AArch64Backend::new(Flags::default());
        assert!(lenient.compile_function(&func).is_ok());

        let strict = AArch64Backend::new(Flags { strict_unsupported_opcodes: true, ..Flags::default() });
        let err = strict.compile_function(&func).expect_err("strict mode escalates");
        assert!(matches!(err, CodegenError::UnsupportedOpcode { opcode: Opcode::EhPush, .. }));
    }

    #[test]
    fn disabling_fastpaths_forces_the_generic_pipeline_but_keeps_the_same_observable_result() {
        let mut entry = Block::new("entry");
        entry.params.push(BlockParam { id: TempId(0), ty: Type::I64 });
        entry.insts.push(Instruction::new(Opcode::Ret).with_operands(vec![Value::Temp(TempId(0))]));
        let func = il::Function { name: "id".into(), blocks: vec![entry] };

        let fast = AArch64Backend::new(Flags::default());
        let generic = AArch64Backend::new(Flags { enable_fastpaths: false, ..Flags::default() });

        let fast_asm = fast.compile_function(&func).expect("compiles");
        let generic_asm = generic.compile_function(&func).expect("compiles");
        assert!(fast_asm.contains("ret"));
        assert!(generic_asm.contains("ret"));
    }
}
