//! Call marshalling: argument/return register assignment, stack-argument
//! spilling, and callee-specific post-processing (`spec.md` §4.5).

use super::context::LoweringContext;
use super::instr_lowering::materialize_value_to_vreg;
use super::mir::{MFunction, MInstr, MOpcode, MOperand, MReg};
use super::target::{PhysReg, RegClass};
use crate::il::{Instruction, Opcode, Type};

fn push(func: &mut MFunction, block_idx: usize, instr: MInstr) {
    func.block_mut(block_idx).push(instr);
}

fn op(r: MReg) -> MOperand {
    MOperand::Reg(r)
}

/// Lower `Call @callee(args...)` or `CallIndirect fnptr(args...)`
/// (`spec.md` §4.5).
pub fn lower_call(
    ctx: &mut LoweringContext,
    func: &mut MFunction,
    block_idx: usize,
    inst: &Instruction,
) -> Option<MReg> {
    let (callee_reg, arg_values) = match inst.opcode {
        Opcode::Call => (None, &inst.operands[..]),
        Opcode::CallIndirect => {
            let fnptr = materialize_value_to_vreg(ctx, func, block_idx, &inst.operands[0]);
            // Move into a fresh vreg not touched by argument marshalling, so
            // marshalling the remaining args can't clobber it before the branch.
            let holder = ctx.fresh_vreg(RegClass::Gpr);
            push(func, block_idx, MInstr::new(MOpcode::MovRR, [op(holder), op(fnptr)]));
            (Some(holder), &inst.operands[1..])
        }
        _ => unreachable!("lower_call only handles Call/CallIndirect"),
    };

    let arg_regs: Vec<MReg> = arg_values
        .iter()
        .map(|v| materialize_value_to_vreg(ctx, func, block_idx, v))
        .collect();

    let mut next_gpr = 0usize;
    let mut next_fpr = 0usize;
    let mut stack_count = 0usize;
    for reg in &arg_regs {
        let fits = match reg.class {
            RegClass::Gpr => next_gpr < ctx.target.int_arg_order.len(),
            RegClass::Fpr => next_fpr < ctx.target.f64_arg_order.len(),
        };
        if fits {
            match reg.class {
                RegClass::Gpr => next_gpr += 1,
                RegClass::Fpr => next_fpr += 1,
            }
        } else {
            stack_count += 1;
        }
    }

    let stack_bytes = if stack_count == 0 {
        0
    } else {
        let raw = stack_count as i32 * 8;
        ((raw + 15) / 16) * 16
    };
    if stack_bytes > 0 {
        push(func, block_idx, MInstr::new(MOpcode::SubSpImm, [MOperand::Imm(stack_bytes as i64)]));
    }

    let mut next_gpr = 0usize;
    let mut next_fpr = 0usize;
    let mut stack_offset = 0i64;
    for reg in &arg_regs {
        match reg.class {
            RegClass::Gpr if next_gpr < ctx.target.int_arg_order.len() => {
                let dst = MReg::phys(ctx.target.int_arg_order[next_gpr]);
                push(func, block_idx, MInstr::new(MOpcode::MovRR, [op(dst), op(*reg)]));
                next_gpr += 1;
            }
            RegClass::Fpr if next_fpr < ctx.target.f64_arg_order.len() => {
                let dst = MReg::phys(ctx.target.f64_arg_order[next_fpr]);
                push(func, block_idx, MInstr::new(MOpcode::FMovRR, [op(dst), op(*reg)]));
                next_fpr += 1;
            }
            RegClass::Gpr => {
                push(
                    func,
                    block_idx,
                    MInstr::new(MOpcode::StrRegSpImm, [op(*reg), MOperand::Imm(stack_offset)]),
                );
                stack_offset += 8;
            }
            RegClass::Fpr => {
                push(
                    func,
                    block_idx,
                    MInstr::new(MOpcode::StrFprSpImm, [op(*reg), MOperand::Imm(stack_offset)]),
                );
                stack_offset += 8;
            }
        }
    }

    match (inst.opcode, callee_reg) {
        (Opcode::Call, _) => {
            let callee = inst.callee.clone().unwrap_or_default();
            push(func, block_idx, MInstr::new(MOpcode::Bl, [MOperand::Label(callee)]));
        }
        (Opcode::CallIndirect, Some(holder)) => {
            push(func, block_idx, MInstr::new(MOpcode::Blr, [op(holder)]));
        }
        _ => {
            log::warn!("call marshalling could not resolve a callee; emitting bare branch");
            push(func, block_idx, MInstr::new(MOpcode::Bl, [MOperand::Label(String::new())]));
        }
    }

    if stack_bytes > 0 {
        push(func, block_idx, MInstr::new(MOpcode::AddSpImm, [MOperand::Imm(stack_bytes as i64)]));
    }

    if inst.result_ty == Type::Void {
        return None;
    }

    let is_fp = inst.result_ty.is_float();
    let ret_phys = if is_fp { ctx.target.f64_return_reg } else { ctx.target.int_return_reg };
    let ret_reg = MReg::phys(ret_phys);
    let class = if is_fp { RegClass::Fpr } else { RegClass::Gpr };
    let mut dst = ctx.fresh_vreg(class);
    let mopcode = if is_fp { MOpcode::FMovRR } else { MOpcode::MovRR };
    push(func, block_idx, MInstr::new(mopcode, [op(dst), op(ret_reg)]));

    if inst.result_ty == Type::I1 {
        // AAPCS64 only guarantees the low 8 bits of w0 for a boolean return.
        let one = ctx.fresh_vreg(RegClass::Gpr);
        push(func, block_idx, MInstr::new(MOpcode::MovRI, [op(one), MOperand::Imm(1)]));
        let masked = ctx.fresh_vreg(RegClass::Gpr);
        push(func, block_idx, MInstr::new(MOpcode::AndRRR, [op(masked), op(dst), op(one)]));
        dst = masked;
    }

    if inst.result_ty == Type::Str {
        // Counter-balances the unref certain string-producing runtime
        // functions perform internally.
        push(func, block_idx, MInstr::new(MOpcode::Bl, [MOperand::Label("rt_str_retain_maybe".into())]));
    }

    if inst.callee.as_deref() == Some("rt_arr_obj_get") {
        // Force a spill/reload round trip so the allocator can't keep this
        // value live across a subsequent call.
        let key = dst.vreg_id() as u32;
        let offset = ctx.frame.ensure_spill(key, 8, 8);
        push(func, block_idx, MInstr::new(MOpcode::StrRegFpImm, [op(dst), MOperand::Imm(offset as i64)]));
        let reloaded = ctx.fresh_vreg(RegClass::Gpr);
        push(
            func,
            block_idx,
            MInstr::new(MOpcode::LdrRegFpImm, [op(reloaded), MOperand::Imm(offset as i64)]),
        );
        dst = reloaded;
    }

    Some(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::Value;
    use crate::isa::aarch64::frame::FrameBuilder;
    use crate::isa::aarch64::liveness::LivenessInfo;
    use crate::isa::aarch64::mir::MBasicBlock;
    use crate::isa::aarch64::target::TargetDescriptor;

    #[test]
    fn simple_call_marshals_two_int_args() {
        let target = TargetDescriptor::darwin_arm64();
        let mut ctx = LoweringContext::new(&target, FrameBuilder::new(), LivenessInfo::default());
        let mut func = MFunction::new("f");
        func.blocks.push(MBasicBlock::new("entry"));

        let inst = Instruction::new(Opcode::Call)
            .with_result(crate::il::TempId(0), Type::I64)
            .with_operands(vec![Value::ConstInt(1), Value::ConstInt(2)])
            .with_callee("add_two");

        let result = lower_call(&mut ctx, &mut func, 0, &inst);
        assert!(result.is_some());
        let has_bl = func.blocks[0]
            .instrs
            .iter()
            .any(|i| i.opcode == MOpcode::Bl && i.operands[0].as_label() == "add_two");
        assert!(has_bl);
        let moves_into_x0 = func.blocks[0]
            .instrs
            .iter()
            .any(|i| i.opcode == MOpcode::MovRR && i.operands[0].as_reg() == MReg::phys(PhysReg::X0));
        assert!(moves_into_x0);
    }

    #[test]
    fn stack_args_beyond_eight_spill_to_sp() {
        let target = TargetDescriptor::darwin_arm64();
        let mut ctx = LoweringContext::new(&target, FrameBuilder::new(), LivenessInfo::default());
        let mut func = MFunction::new("f");
        func.blocks.push(MBasicBlock::new("entry"));

        let operands: Vec<Value> = (0..9).map(Value::ConstInt).collect();
        let inst = Instruction::new(Opcode::Call).with_operands(operands).with_callee("many_args");

        lower_call(&mut ctx, &mut func, 0, &inst);
        assert!(func.blocks[0].instrs.iter().any(|i| i.opcode == MOpcode::SubSpImm));
        assert!(func.blocks[0].instrs.iter().any(|i| i.opcode == MOpcode::StrRegSpImm));
    }
}
