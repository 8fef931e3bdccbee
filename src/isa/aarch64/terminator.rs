//! Control-flow terminator lowering (`spec.md` §4.4).
//!
//! Runs once per function after every block's non-terminators have been
//! lowered, consulting each block's `tempVReg` snapshot (taken the moment
//! that block finished) to recover the correct vregs for branch-argument
//! materialisation — by the time terminators run globally, `tempVReg` has
//! been overwritten by later blocks' definitions.

use super::context::LoweringContext;
use super::instr_lowering::materialize_value_to_vreg;
use super::mir::{MFunction, MInstr, MOpcode, MOperand, MReg};
use super::target::RegClass;
use crate::error::DispatchOutcome;
use crate::il::{Function, Instruction, Opcode, Value};

fn push(func: &mut MFunction, block_idx: usize, instr: MInstr) {
    func.block_mut(block_idx).push(instr);
}

fn op(r: MReg) -> MOperand {
    MOperand::Reg(r)
}

fn is_noreturn_runtime_call(instr: &MInstr) -> bool {
    instr.opcode == MOpcode::Bl
        && matches!(instr.operands.first(), Some(MOperand::Label(l)) if l == "rt_trap" || l == "rt_arr_oob_panic")
}

/// Materialise a branch argument from block `block_idx`'s snapshot and store
/// it into `target_label`'s phi spill slot at `param_index`.
fn emit_phi_edge_copy(
    ctx: &mut LoweringContext,
    func: &mut MFunction,
    block_idx: usize,
    arg: &Value,
    target_label: &str,
    param_index: usize,
) {
    let reg = match arg {
        Value::Temp(id) => ctx
            .lookup_temp_in_snapshot(block_idx, id.0)
            .unwrap_or_else(|| materialize_value_to_vreg(ctx, func, block_idx, arg)),
        other => materialize_value_to_vreg(ctx, func, block_idx, other),
    };

    let Some(plan) = ctx.phi_plans.get(target_label) else { return };
    let Some(&class) = plan.reg_class.get(param_index) else { return };
    let Some(&offset) = plan.spill_offset.get(param_index) else { return };

    let reg = if reg.class == class {
        reg
    } else {
        let dst = ctx.fresh_vreg(class);
        let conv = match class {
            RegClass::Fpr => MOpcode::SCvtF,
            RegClass::Gpr => MOpcode::FCvtZS,
        };
        push(func, block_idx, MInstr::new(conv, [op(dst), op(reg)]));
        dst
    };

    let store_op = match class {
        RegClass::Gpr => MOpcode::StrRegFpImm,
        RegClass::Fpr => MOpcode::StrFprFpImm,
    };
    push(func, block_idx, MInstr::new(store_op, [op(reg), MOperand::Imm(offset as i64)]));
}

fn emit_br_args(
    ctx: &mut LoweringContext,
    func: &mut MFunction,
    block_idx: usize,
    target_label: &str,
    args: &[Value],
) {
    for (i, arg) in args.iter().enumerate() {
        emit_phi_edge_copy(ctx, func, block_idx, arg, target_label, i);
    }
}

/// True when `cond` is produced, in this same (entry) block, by an integer
/// compare whose operands are both entry-block parameters — the shape that
/// admits the fused compare-and-branch form (`spec.md` §4.4 step 2).
fn fused_compare_and_branch<'a>(
    il_func: &'a Function,
    block_idx: usize,
    cond: &Value,
) -> Option<&'a Instruction> {
    if block_idx != 0 {
        return None;
    }
    let Value::Temp(id) = cond else { return None };
    let block = &il_func.blocks[block_idx];
    let param_ids: Vec<u32> = block.params.iter().map(|p| p.id.0).collect();
    block.insts.iter().find(|i| {
        i.result == Some(*id)
            && matches!(
                i.opcode,
                Opcode::ICmpEq
                    | Opcode::ICmpNe
                    | Opcode::SCmpLt
                    | Opcode::SCmpLe
                    | Opcode::SCmpGt
                    | Opcode::SCmpGe
                    | Opcode::UCmpLt
                    | Opcode::UCmpLe
                    | Opcode::UCmpGt
                    | Opcode::UCmpGe
            )
            && i.operands.iter().all(|v| match v {
                Value::Temp(t) => param_ids.contains(&t.0),
                _ => false,
            })
    })
}

fn int_cmp_cc(opcode: Opcode) -> &'static str {
    use Opcode::*;
    match opcode {
        ICmpEq => "eq",
        ICmpNe => "ne",
        SCmpLt => "lt",
        SCmpLe => "le",
        SCmpGt => "gt",
        SCmpGe => "ge",
        UCmpLt => "lo",
        UCmpLe => "ls",
        UCmpGt => "hi",
        UCmpGe => "hs",
        _ => "eq",
    }
}

/// Lower every block's terminator (`spec.md` §4.4). Must run after all
/// non-terminators in all blocks have been lowered and snapshotted.
pub fn lower_terminators(ctx: &mut LoweringContext, il_func: &Function, func: &mut MFunction) {
    for block_idx in 0..il_func.blocks.len() {
        let Some(term) = il_func.blocks[block_idx].terminator() else { continue };
        match term.opcode {
            Opcode::Br => {
                let target = &term.labels[0];
                let args = term.block_args.first().cloned().unwrap_or_default();
                emit_br_args(ctx, func, block_idx, target, &args);
                push(func, block_idx, MInstr::new(MOpcode::Br, [MOperand::Label(target.clone())]));
            }

            Opcode::CBr => {
                let true_label = term.labels[0].clone();
                let false_label = term.labels[1].clone();
                let true_args = term.block_args.first().cloned().unwrap_or_default();
                let false_args = term.block_args.get(1).cloned().unwrap_or_default();
                emit_br_args(ctx, func, block_idx, &true_label, &true_args);
                emit_br_args(ctx, func, block_idx, &false_label, &false_args);

                let cond = &term.operands[0];
                if let Some(cmp_inst) = fused_compare_and_branch(il_func, block_idx, cond) {
                    let lhs = materialize_value_to_vreg(ctx, func, block_idx, &cmp_inst.operands[0]);
                    if let Some(imm) = cmp_inst.operands[1].as_const_int() {
                        push(func, block_idx, MInstr::new(MOpcode::CmpRI, [op(lhs), MOperand::Imm(imm)]));
                    } else {
                        let rhs = materialize_value_to_vreg(ctx, func, block_idx, &cmp_inst.operands[1]);
                        push(func, block_idx, MInstr::new(MOpcode::CmpRR, [op(lhs), op(rhs)]));
                    }
                    let cc = int_cmp_cc(cmp_inst.opcode);
                    push(
                        func,
                        block_idx,
                        MInstr::new(MOpcode::BCond, [MOperand::Cond(cc), MOperand::Label(true_label)]),
                    );
                    push(func, block_idx, MInstr::new(MOpcode::Br, [MOperand::Label(false_label)]));
                } else {
                    let v = materialize_value_to_vreg(ctx, func, block_idx, cond);
                    push(func, block_idx, MInstr::new(MOpcode::CmpRI, [op(v), MOperand::Imm(0)]));
                    push(
                        func,
                        block_idx,
                        MInstr::new(MOpcode::BCond, [MOperand::Cond("ne"), MOperand::Label(true_label)]),
                    );
                    push(func, block_idx, MInstr::new(MOpcode::Br, [MOperand::Label(false_label)]));
                }
            }

            Opcode::Trap => {
                let suppress = func.blocks[block_idx].instrs.last().is_some_and(is_noreturn_runtime_call);
                if !suppress {
                    push(func, block_idx, MInstr::new(MOpcode::Bl, [MOperand::Label("rt_trap".into())]));
                }
            }

            Opcode::TrapFromErr => {
                if let Some(code) = term.operands.first() {
                    let x0 = MReg::phys(super::target::PhysReg::X0);
                    match code {
                        Value::ConstInt(v) => {
                            push(func, block_idx, MInstr::new(MOpcode::MovRI, [op(x0), MOperand::Imm(*v)]));
                        }
                        other => {
                            let v = materialize_value_to_vreg(ctx, func, block_idx, other);
                            push(func, block_idx, MInstr::new(MOpcode::MovRR, [op(x0), op(v)]));
                        }
                    }
                }
                push(func, block_idx, MInstr::new(MOpcode::Bl, [MOperand::Label("rt_trap".into())]));
            }

            // Ret is lowered in OpcodeDispatch (`spec.md` §4.3), not here.
            Opcode::Ret => {}

            other => {
                log::warn!("block {} ends with non-terminator opcode {other:?}", il_func.blocks[block_idx].label);
                ctx.record_outcome(DispatchOutcome::Malformed(format!(
                    "block {} ends with non-terminator opcode {other:?}",
                    il_func.blocks[block_idx].label
                )));
            }
        }
    }
}
