//! The `Lowerer` orchestrator: drives `FrameBuilder`, `LivenessAnalysis`,
//! `FastPaths`, `OpcodeDispatch` (via [`super::instr_lowering`]), and
//! `TerminatorLowering` to turn one IL function into MIR (`spec.md` §4.3).
//!
//! Register allocation and peephole run afterwards, outside this module (see
//! [`super::AArch64Backend::compile_function`]); this module's job ends once
//! every IL instruction has a corresponding (still virtual-register) MIR
//! sequence.

use super::context::{LoweringContext, PhiPlan};
use super::fastpaths;
use super::frame::FrameBuilder;
use super::instr_lowering;
use super::liveness;
use super::mir::{MBasicBlock, MFunction, MInstr, MOpcode, MOperand, MReg};
use super::target::{RegClass, TargetDescriptor};
use super::terminator;
use crate::error::DispatchOutcome;
use crate::il::{Function, Opcode};
use rustc_hash::FxHashSet;

fn op(r: MReg) -> MOperand {
    MOperand::Reg(r)
}

/// Default alloca slot shape: every scalar type this IL models (`spec.md`
/// §6's fixed value/type set) fits in one 8-byte, 8-byte-aligned word.
const ALLOCA_SIZE_BYTES: i32 = 8;
const ALLOCA_ALIGN_BYTES: i32 = 8;

/// Disjoint key range for per-block-parameter ("phi-edge") spill slots, so
/// they never collide with vreg-id-keyed spill slots (regalloc, §4.7) or
/// cross-block-temp-keyed ones (liveness, §3.4/§4.2).
const PHI_SPILL_KEY_BASE: u32 = 200_000;

fn phi_spill_key(block_index: usize, param_index: usize) -> u32 {
    PHI_SPILL_KEY_BASE + (block_index as u32) * 1000 + param_index as u32
}

/// Declare a frame local for every `Alloca` result in the function, and
/// collect the set of IL temp ids that are alloca producers (`spec.md` §4.1,
/// §4.2 — alloca producers are addresses, excluded from cross-block spilling).
fn collect_allocas(func: &Function, frame: &mut FrameBuilder) -> FxHashSet<u32> {
    let mut allocas = FxHashSet::default();
    for block in &func.blocks {
        for inst in &block.insts {
            if inst.opcode == Opcode::Alloca {
                if let Some(id) = inst.result {
                    frame.add_local(id.0, ALLOCA_SIZE_BYTES, ALLOCA_ALIGN_BYTES);
                    allocas.insert(id.0);
                }
            }
        }
    }
    allocas
}

/// Reserve a phi-edge spill slot and a vreg id for every parameter of every
/// non-entry block (`spec.md` §3.4, §3.6 `phiVregId`/`phiRegClass`/`phiSpillOffset`).
///
/// The entry block's parameters arrive in AAPCS64 argument registers, not on
/// the stack, so it is excluded here and handled separately by
/// [`bind_entry_params`].
fn setup_phi_plans(ctx: &mut LoweringContext, func: &Function) {
    for (bi, block) in func.blocks.iter().enumerate() {
        if bi == 0 || block.params.is_empty() {
            continue;
        }
        let mut plan = PhiPlan::default();
        for (pi, param) in block.params.iter().enumerate() {
            let class = if param.ty.is_float() { RegClass::Fpr } else { RegClass::Gpr };
            let vreg = ctx.fresh_vreg(class);
            let offset = ctx.frame.ensure_spill(phi_spill_key(bi, pi), 8, 8);
            plan.vreg_id.push(vreg.vreg_id());
            plan.reg_class.push(class);
            plan.spill_offset.push(offset);
        }
        ctx.phi_plans.insert(block.label.clone(), plan);
    }
}

/// Bind every entry-block parameter to a fresh vreg, emitting the ABI-register
/// move the materialisation contract promises for "temp is an entry-block
/// parameter" (`spec.md` §4.3).
fn bind_entry_params(ctx: &mut LoweringContext, mf: &mut MFunction, func: &Function) {
    let entry = &func.blocks[0];
    let mut next_gpr = 0usize;
    let mut next_fpr = 0usize;
    for param in &entry.params {
        let is_fp = param.ty.is_float();
        let arg_reg = if is_fp {
            let r = ctx.target.f64_arg_order.get(next_fpr).copied();
            next_fpr += 1;
            r
        } else {
            let r = ctx.target.int_arg_order.get(next_gpr).copied();
            next_gpr += 1;
            r
        };
        let Some(arg_reg) = arg_reg else {
            // More parameters than the ABI has registers for falls outside
            // this IL model's assumed shape (`spec.md` §6); leave unbound
            // rather than panic (`spec.md` §7).
            continue;
        };
        let class = if is_fp { RegClass::Fpr } else { RegClass::Gpr };
        let dst = ctx.fresh_vreg(class);
        let mopcode = if is_fp { MOpcode::FMovRR } else { MOpcode::MovRR };
        mf.block_mut(0).push(MInstr::new(mopcode, [op(dst), op(MReg::phys(arg_reg))]));
        ctx.bind_temp(param.id.0, dst);
    }
}

/// At the start of a non-entry block, reload every parameter from its
/// phi-edge spill slot — the load side of the phi-edge copies
/// `TerminatorLowering` writes on every predecessor edge (`spec.md` §4.4,
/// scenario 6).
fn bind_block_params_from_phi_slots(ctx: &mut LoweringContext, mf: &mut MFunction, func: &Function, block_idx: usize) {
    let block = &func.blocks[block_idx];
    if block.params.is_empty() {
        return;
    }
    let Some(plan) = ctx.phi_plans.get(&block.label).cloned() else { return };
    for (pi, param) in block.params.iter().enumerate() {
        let class = plan.reg_class[pi];
        let vreg = MReg::virt(class, plan.vreg_id[pi]);
        let offset = plan.spill_offset[pi];
        let mopcode = match class {
            RegClass::Gpr => MOpcode::LdrRegFpImm,
            RegClass::Fpr => MOpcode::LdrFprFpImm,
        };
        mf.block_mut(block_idx).push(MInstr::new(mopcode, [op(vreg), MOperand::Imm(offset as i64)]));
        ctx.bind_temp(param.id.0, vreg);
    }
}

/// Lower one IL function to MIR over virtual (and, where a fast path or a
/// fixed physical register is used, physical) registers. Returns the MIR
/// function, the still-open `FrameBuilder` (so the caller can run register
/// allocation, which may add more spill slots, before finalising the frame —
/// `spec.md` §2 pipeline), and every non-`Handled` dispatch outcome collected
/// along the way.
///
/// `enable_fastpaths` lets a caller force the generic pipeline even for
/// shapes `FastPaths` would otherwise match, so tests can assert the two
/// paths are observationally equivalent (`spec.md` §4.6; `Flags::enable_fastpaths`).
pub fn lower_function(
    func: &Function,
    target: &TargetDescriptor,
    enable_fastpaths: bool,
) -> (MFunction, FrameBuilder, Vec<DispatchOutcome>) {
    let mut frame = FrameBuilder::new();
    let alloca_temps = collect_allocas(func, &mut frame);
    let liveness = liveness::analyze_cross_block_liveness(func, &alloca_temps, &mut frame);

    if enable_fastpaths {
        if let Some(mf) = fastpaths::try_match(func, target, &mut frame) {
            return (mf, frame, Vec::new());
        }
    }

    let mut ctx = LoweringContext::new(target, frame, liveness);
    ctx.alloca_temps = alloca_temps;
    setup_phi_plans(&mut ctx, func);

    let mut mf = MFunction::new(func.name.clone());
    for block in &func.blocks {
        mf.blocks.push(MBasicBlock::new(block.label.clone()));
    }

    bind_entry_params(&mut ctx, &mut mf, func);

    for block_idx in 0..func.blocks.len() {
        if block_idx > 0 {
            bind_block_params_from_phi_slots(&mut ctx, &mut mf, func, block_idx);
        }
        // `Ret` is a terminator in the IL model but is lowered here, by
        // `OpcodeDispatch`, not by `TerminatorLowering` (`spec.md` §4.3): it
        // is plain data movement into the ABI return register, not a
        // control-flow construction. Every other terminator is skipped here
        // and handled once every block's data instructions are lowered.
        for inst in &func.blocks[block_idx].insts {
            if inst.opcode.is_terminator() && inst.opcode != Opcode::Ret {
                continue;
            }
            instr_lowering::lower_instruction(&mut ctx, &mut mf, block_idx, inst);
        }
        ctx.snapshot_block(block_idx);
    }

    terminator::lower_terminators(&mut ctx, func, &mut mf);

    (mf, ctx.frame, ctx.unhandled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{Block, BlockParam, Instruction, TempId, Type, Value};

    fn target() -> TargetDescriptor {
        TargetDescriptor::darwin_arm64()
    }

    #[test]
    fn identity_function_matches_return_fast_path() {
        let mut entry = Block::new("entry");
        entry.params.push(BlockParam { id: TempId(0), ty: Type::I64 });
        entry.insts.push(Instruction::new(Opcode::Ret).with_operands(vec![Value::Temp(TempId(0))]));
        let func = Function { name: "id".into(), blocks: vec![entry] };

        let target = target();
        let (mf, _frame, _unhandled) = lower_function(&func, &target, true);
        assert_eq!(mf.blocks.len(), 1);
        assert_eq!(mf.blocks[0].instrs.len(), 1);
        assert_eq!(mf.blocks[0].instrs[0].opcode, MOpcode::Ret);
    }

    #[test]
    fn cross_block_branch_reloads_param_from_phi_slot() {
        let mut entry = Block::new("entry");
        entry.params.push(BlockParam { id: TempId(0), ty: Type::I64 });
        entry.insts.push(
            Instruction::new(Opcode::Add)
                .with_result(TempId(1), Type::I64)
                .with_operands(vec![Value::Temp(TempId(0)), Value::ConstInt(1)]),
        );
        entry.insts.push(
            Instruction::new(Opcode::Br)
                .with_labels(vec!["loop".into()])
                .with_block_args(vec![vec![Value::Temp(TempId(1))]]),
        );

        let mut loop_block = Block::new("loop");
        loop_block.params.push(BlockParam { id: TempId(2), ty: Type::I64 });
        loop_block
            .insts
            .push(Instruction::new(Opcode::Ret).with_operands(vec![Value::Temp(TempId(2))]));

        let func = Function { name: "looper".into(), blocks: vec![entry, loop_block] };
        let target = target();
        let (mf, _frame, _unhandled) = lower_function(&func, &target, true);

        assert_eq!(mf.blocks.len(), 2);
        assert!(mf.blocks[0].instrs.iter().any(|i| i.opcode == MOpcode::StrRegFpImm));
        assert!(mf.blocks[0].instrs.iter().any(|i| i.opcode == MOpcode::Br));
        assert!(mf.blocks[1].instrs.iter().any(|i| i.opcode == MOpcode::LdrRegFpImm));
        assert!(mf.blocks[1].instrs.iter().any(|i| i.opcode == MOpcode::Ret));
    }

    #[test]
    fn generic_path_still_binds_entry_params_to_arg_registers() {
        let mut entry = Block::new("entry");
        entry.params.push(BlockParam { id: TempId(0), ty: Type::I64 });
        entry.params.push(BlockParam { id: TempId(1), ty: Type::I64 });
        // Three non-terminators rules out every fast-path family, forcing the
        // generic pipeline to run.
        entry.insts.push(
            Instruction::new(Opcode::Add)
                .with_result(TempId(2), Type::I64)
                .with_operands(vec![Value::Temp(TempId(0)), Value::Temp(TempId(1))]),
        );
        entry.insts.push(
            Instruction::new(Opcode::Add)
                .with_result(TempId(3), Type::I64)
                .with_operands(vec![Value::Temp(TempId(2)), Value::ConstInt(1)]),
        );
        entry.insts.push(
            Instruction::new(Opcode::Sub)
                .with_result(TempId(4), Type::I64)
                .with_operands(vec![Value::Temp(TempId(3)), Value::ConstInt(1)]),
        );
        entry.insts.push(Instruction::new(Opcode::Ret).with_operands(vec![Value::Temp(TempId(4))]));
        let func = Function { name: "f".into(), blocks: vec![entry] };

        let target = target();
        let (mf, _frame, _unhandled) = lower_function(&func, &target, true);
        assert!(mf.blocks[0].instrs.iter().any(|i| i.opcode == MOpcode::MovRR));
        assert!(mf.blocks[0].instrs.iter().any(|i| i.opcode == MOpcode::Ret));
    }
}
