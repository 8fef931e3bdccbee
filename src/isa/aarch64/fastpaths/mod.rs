//! Short-circuits for trivial function shapes, tried before generic lowering
//! begins (`spec.md` §4.6).
//!
//! Every pattern here must produce MIR observationally identical to what the
//! generic pipeline (`Lowerer` + `RegAllocLinear` + `Peephole`) would produce
//! for the same IL. This module covers the return, memory, integer-arithmetic,
//! floating-point-arithmetic, cast, and (direct, all-GPR, no-stack-args) call
//! pattern families; multi-op chains are not implemented — see `DESIGN.md`.

use super::frame::FrameBuilder;
use super::mir::{MBasicBlock, MFunction, MInstr, MOpcode, MOperand, MReg};
use super::target::{PhysReg, RegClass, TargetDescriptor};
use crate::il::{Function, Opcode, Type, Value};

fn op(r: MReg) -> MOperand {
    MOperand::Reg(r)
}

/// Assign each entry-block parameter its AAPCS64 argument register, GPR and
/// FPR counted independently (`spec.md` §3.1, §4.5).
fn param_phys_regs(func: &Function, target: &TargetDescriptor) -> Option<Vec<PhysReg>> {
    let entry = &func.blocks[0];
    let mut next_gpr = 0usize;
    let mut next_fpr = 0usize;
    let mut out = Vec::with_capacity(entry.params.len());
    for p in &entry.params {
        if p.ty.is_float() {
            let r = *target.f64_arg_order.get(next_fpr)?;
            next_fpr += 1;
            out.push(r);
        } else {
            let r = *target.int_arg_order.get(next_gpr)?;
            next_gpr += 1;
            out.push(r);
        }
    }
    Some(out)
}

fn param_index(func: &Function, id: crate::il::TempId) -> Option<usize> {
    func.blocks[0].params.iter().position(|p| p.id == id)
}

/// Try every fast-path family in turn; `None` means the caller must fall back
/// to the generic pipeline.
pub fn try_match(func: &Function, target: &TargetDescriptor, frame: &mut FrameBuilder) -> Option<MFunction> {
    if func.blocks.len() != 1 {
        return None;
    }
    let entry = &func.blocks[0];
    let non_term = entry.non_terminators();
    let term = entry.terminator()?;
    if term.opcode != Opcode::Ret {
        return None;
    }
    let param_regs = param_phys_regs(func, target)?;

    if let Some(mf) = try_return_pattern(func, target, non_term, term, &param_regs) {
        return Some(mf);
    }
    if let Some(mf) = try_memory_pattern(func, target, frame, non_term, term, &param_regs) {
        return Some(mf);
    }
    if let Some(mf) = try_int_arith_pattern(func, target, non_term, term, &param_regs) {
        return Some(mf);
    }
    if let Some(mf) = try_fp_arith_pattern(func, target, non_term, term, &param_regs) {
        return Some(mf);
    }
    if let Some(mf) = try_cast_pattern(func, target, non_term, term, &param_regs) {
        return Some(mf);
    }
    if let Some(mf) = try_call_pattern(func, target, non_term, term, &param_regs) {
        return Some(mf);
    }
    None
}

fn new_single_block_fn(func: &Function) -> (MFunction, usize) {
    let mut mf = MFunction::new(func.name.clone());
    mf.blocks.push(MBasicBlock::new(func.blocks[0].label.clone()));
    (mf, 0)
}

/// Return patterns: a parameter, a constant int, or a local ConstStr/AddrOf,
/// with no other non-terminator instructions.
fn try_return_pattern(
    func: &Function,
    target: &TargetDescriptor,
    non_term: &[crate::il::Instruction],
    term: &crate::il::Instruction,
    param_regs: &[PhysReg],
) -> Option<MFunction> {
    if !non_term.is_empty() {
        return None;
    }
    let value = term.operands.first()?;
    let (mut mf, bi) = new_single_block_fn(func);

    match value {
        Value::Temp(id) => {
            let idx = param_index(func, *id)?;
            let src = param_regs[idx];
            let is_fp = src.is_fpr();
            let ret_reg = MReg::phys(if is_fp { target.f64_return_reg } else { target.int_return_reg });
            if MReg::phys(src) != ret_reg {
                let mopcode = if is_fp { MOpcode::FMovRR } else { MOpcode::MovRR };
                mf.block_mut(bi).push(MInstr::new(mopcode, [op(ret_reg), op(MReg::phys(src))]));
            }
        }
        Value::ConstInt(v) => {
            let ret_reg = MReg::phys(target.int_return_reg);
            mf.block_mut(bi).push(MInstr::new(MOpcode::MovRI, [op(ret_reg), MOperand::Imm(*v)]));
        }
        Value::GlobalAddr(sym) if term.result_ty != Type::Str => {
            let ret_reg = MReg::phys(target.int_return_reg);
            mf.block_mut(bi)
                .push(MInstr::new(MOpcode::AdrPage, [op(ret_reg), MOperand::Label(sym.clone())]));
            mf.block_mut(bi)
                .push(MInstr::new(MOpcode::AddPageOff, [op(ret_reg), op(ret_reg), MOperand::Label(sym.clone())]));
        }
        _ => return None,
    }

    mf.block_mut(bi).push(MInstr::new(MOpcode::Ret, []));
    Some(mf)
}

/// `alloca`, `store param`, `load`, `ret loaded` — collapses to a single
/// FP-relative store/load pair.
fn try_memory_pattern(
    func: &Function,
    target: &TargetDescriptor,
    frame: &mut FrameBuilder,
    non_term: &[crate::il::Instruction],
    term: &crate::il::Instruction,
    param_regs: &[PhysReg],
) -> Option<MFunction> {
    if non_term.len() != 3 {
        return None;
    }
    let alloca = &non_term[0];
    let store = &non_term[1];
    let load = &non_term[2];
    if alloca.opcode != Opcode::Alloca || store.opcode != Opcode::Store || load.opcode != Opcode::Load {
        return None;
    }
    let alloca_id = alloca.result?;
    if store.operands[0].as_temp() != Some(alloca_id) {
        return None;
    }
    let param_id = store.operands[1].as_temp()?;
    let param_idx = param_index(func, param_id)?;
    if load.operands[0].as_temp() != Some(alloca_id) {
        return None;
    }
    let loaded_id = load.result?;
    if term.operands.first()?.as_temp() != Some(loaded_id) {
        return None;
    }

    let size = store.result_ty.bit_width() as i32 / 8;
    let size = size.max(1);
    frame.add_local(alloca_id.0, size, super::frame::SLOT_SIZE_BYTES);
    let offset = frame.local_offset(alloca_id.0);

    let (mut mf, bi) = new_single_block_fn(func);
    let src = param_regs[param_idx];
    let is_fp = src.is_fpr();
    let store_op = if is_fp { MOpcode::StrFprFpImm } else { MOpcode::StrRegFpImm };
    mf.block_mut(bi).push(MInstr::new(store_op, [op(MReg::phys(src)), MOperand::Imm(offset as i64)]));

    let ret_reg = MReg::phys(if is_fp { target.f64_return_reg } else { target.int_return_reg });
    let load_op = if is_fp { MOpcode::LdrFprFpImm } else { MOpcode::LdrRegFpImm };
    mf.block_mut(bi).push(MInstr::new(load_op, [op(ret_reg), MOperand::Imm(offset as i64)]));
    mf.block_mut(bi).push(MInstr::new(MOpcode::Ret, []));
    Some(mf)
}

fn int_binop_rrr(opcode: Opcode) -> Option<MOpcode> {
    use MOpcode::*;
    Some(match opcode {
        Opcode::Add | Opcode::AddOvfS | Opcode::AddOvfU => AddRRR,
        Opcode::Sub | Opcode::SubOvfS | Opcode::SubOvfU => SubRRR,
        Opcode::Mul | Opcode::MulOvfS | Opcode::MulOvfU => MulRRR,
        Opcode::And => AndRRR,
        Opcode::Or => OrrRRR,
        Opcode::Xor => EorRRR,
        _ => return None,
    })
}

fn int_binop_ri(opcode: Opcode) -> Option<MOpcode> {
    use MOpcode::*;
    Some(match opcode {
        Opcode::Add | Opcode::AddOvfS | Opcode::AddOvfU => AddRI,
        Opcode::Sub | Opcode::SubOvfS | Opcode::SubOvfU => SubRI,
        _ => return None,
    })
}

fn int_cmp_cc(opcode: Opcode) -> Option<&'static str> {
    use Opcode::*;
    Some(match opcode {
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
        _ => return None,
    })
}

/// A binop (or compare) on two parameters, or a parameter and an immediate,
/// immediately returned.
fn try_int_arith_pattern(
    func: &Function,
    target: &TargetDescriptor,
    non_term: &[crate::il::Instruction],
    term: &crate::il::Instruction,
    param_regs: &[PhysReg],
) -> Option<MFunction> {
    if non_term.len() != 1 {
        return None;
    }
    let inst = &non_term[0];
    if term.operands.first()?.as_temp() != inst.result {
        return None;
    }

    let lhs_reg = match &inst.operands.first()? {
        Value::Temp(id) => MReg::phys(param_regs[param_index(func, *id)?]),
        _ => return None,
    };

    let (mut mf, bi) = new_single_block_fn(func);
    let ret_reg = MReg::phys(target.int_return_reg);

    if let Some(cc) = int_cmp_cc(inst.opcode) {
        match &inst.operands[1] {
            Value::ConstInt(imm) => {
                mf.block_mut(bi).push(MInstr::new(MOpcode::CmpRI, [op(lhs_reg), MOperand::Imm(*imm)]));
            }
            Value::Temp(id) => {
                let rhs_reg = MReg::phys(param_regs[param_index(func, *id)?]);
                mf.block_mut(bi).push(MInstr::new(MOpcode::CmpRR, [op(lhs_reg), op(rhs_reg)]));
            }
            _ => return None,
        }
        mf.block_mut(bi).push(MInstr::new(MOpcode::Cset, [op(ret_reg), MOperand::Cond(cc)]));
        mf.block_mut(bi).push(MInstr::new(MOpcode::Ret, []));
        return Some(mf);
    }

    let rrr = int_binop_rrr(inst.opcode)?;
    match &inst.operands[1] {
        Value::ConstInt(imm) => {
            let ri = int_binop_ri(inst.opcode)?;
            mf.block_mut(bi).push(MInstr::new(ri, [op(ret_reg), op(lhs_reg), MOperand::Imm(*imm)]));
        }
        Value::Temp(id) => {
            let rhs_reg = MReg::phys(param_regs[param_index(func, *id)?]);
            mf.block_mut(bi).push(MInstr::new(rrr, [op(ret_reg), op(lhs_reg), op(rhs_reg)]));
        }
        _ => return None,
    }
    mf.block_mut(bi).push(MInstr::new(MOpcode::Ret, []));
    Some(mf)
}

fn fp_binop_rrr(opcode: Opcode) -> Option<MOpcode> {
    use MOpcode::*;
    Some(match opcode {
        Opcode::FAdd => FAddRRR,
        Opcode::FSub => FSubRRR,
        Opcode::FMul => FMulRRR,
        Opcode::FDiv => FDivRRR,
        _ => return None,
    })
}

fn try_fp_arith_pattern(
    func: &Function,
    target: &TargetDescriptor,
    non_term: &[crate::il::Instruction],
    term: &crate::il::Instruction,
    param_regs: &[PhysReg],
) -> Option<MFunction> {
    if non_term.len() != 1 {
        return None;
    }
    let inst = &non_term[0];
    let mopcode = fp_binop_rrr(inst.opcode)?;
    if term.operands.first()?.as_temp() != inst.result {
        return None;
    }
    let Value::Temp(lid) = &inst.operands[0] else { return None };
    let Value::Temp(rid) = &inst.operands[1] else { return None };
    let lhs = param_regs[param_index(func, *lid)?];
    let rhs = param_regs[param_index(func, *rid)?];
    if lhs.class() != RegClass::Fpr || rhs.class() != RegClass::Fpr {
        return None;
    }

    let (mut mf, bi) = new_single_block_fn(func);
    let ret_reg = MReg::phys(target.f64_return_reg);
    mf.block_mut(bi).push(MInstr::new(mopcode, [op(ret_reg), op(MReg::phys(lhs)), op(MReg::phys(rhs))]));
    mf.block_mut(bi).push(MInstr::new(MOpcode::Ret, []));
    Some(mf)
}

/// `Zext1`/`Trunc1` or `CastSiNarrowChk` applied directly to a parameter.
fn try_cast_pattern(
    func: &Function,
    target: &TargetDescriptor,
    non_term: &[crate::il::Instruction],
    term: &crate::il::Instruction,
    param_regs: &[PhysReg],
) -> Option<MFunction> {
    if non_term.len() != 1 {
        return None;
    }
    let inst = &non_term[0];
    if term.operands.first()?.as_temp() != inst.result {
        return None;
    }
    let Value::Temp(id) = &inst.operands[0] else { return None };
    let src = MReg::phys(param_regs[param_index(func, *id)?]);
    let ret_reg = MReg::phys(target.int_return_reg);

    let (mut mf, bi) = new_single_block_fn(func);
    // Patterns here run before regalloc and must never leave a virtual
    // register in the output; the global scratch GPR covers the one
    // transient value each needs.
    let scratch = MReg::phys(super::target::GLOBAL_SCRATCH_GPR);
    match inst.opcode {
        Opcode::Zext1 | Opcode::Trunc1 => {
            mf.block_mut(bi).push(MInstr::new(MOpcode::MovRI, [op(scratch), MOperand::Imm(1)]));
            mf.block_mut(bi).push(MInstr::new(MOpcode::AndRRR, [op(ret_reg), op(src), op(scratch)]));
        }
        Opcode::CastSiNarrowChk | Opcode::CastUiNarrowChk => {
            let sh = 64 - inst.result_ty.bit_width() as i64;
            let widened = scratch;
            mf.block_mut(bi).push(MInstr::new(MOpcode::LslRI, [op(widened), op(src), MOperand::Imm(sh)]));
            let shr = if inst.opcode == Opcode::CastSiNarrowChk { MOpcode::AsrRI } else { MOpcode::LsrRI };
            mf.block_mut(bi).push(MInstr::new(shr, [op(ret_reg), op(widened), MOperand::Imm(sh)]));
            let trap_label = super::context::next_trap_label("cast");
            mf.block_mut(bi).push(MInstr::new(MOpcode::CmpRR, [op(ret_reg), op(src)]));
            mf.block_mut(bi).push(MInstr::new(
                MOpcode::BCond,
                [MOperand::Cond("ne"), MOperand::Label(trap_label.clone())],
            ));
            let mut trap_block = MBasicBlock::new(trap_label);
            trap_block.push(MInstr::new(MOpcode::Bl, [MOperand::Label("rt_trap".into())]));
            mf.blocks.push(trap_block);
        }
        _ => return None,
    }
    mf.block_mut(bi).push(MInstr::new(MOpcode::Ret, []));
    Some(mf)
}

/// Sequentialise a parallel register-to-register move set (`dst`s pairwise
/// distinct) into an order safe to emit one `mov` at a time, breaking any
/// permutation cycle through `scratch`. A move is emitted as soon as its `dst`
/// is not needed as another pending move's `src`; once no such move remains,
/// every pending move is part of a cycle, so one is opened by stashing its
/// `dst` in `scratch` and the chain is walked to its close.
fn sequentialize_moves(mut pending: Vec<(PhysReg, PhysReg)>, scratch: PhysReg) -> Vec<(PhysReg, PhysReg)> {
    let mut order = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        if let Some(idx) = pending.iter().position(|&(d, _)| !pending.iter().any(|&(_, s)| s == d)) {
            order.push(pending.remove(idx));
            continue;
        }

        let (d0, s0) = pending.remove(0);
        order.push((scratch, d0));
        order.push((d0, s0));
        let mut cur_dst = s0;
        loop {
            let Some(idx) = pending.iter().position(|&(d, _)| d == cur_dst) else { break };
            let (d, s) = pending.remove(idx);
            order.push((d, if s == d0 { scratch } else { s }));
            cur_dst = s;
            if s == d0 {
                break;
            }
        }
    }
    order
}

/// `call @f(args...); ret` (or a void-returning call with a bare `ret`),
/// where every argument is a parameter or an immediate and all of them fit in
/// GPR argument registers. Collapses straight to register moves (with cycle
/// breaking via the global scratch register) and a `bl`, instead of the
/// vreg-materialising, regalloc-allocated path `abi::lower_call` takes
/// generically. Stack-argument calls, floating-point arguments, and the
/// `rt_arr_obj_get` result barrier fall back to the generic pipeline.
fn try_call_pattern(
    func: &Function,
    target: &TargetDescriptor,
    non_term: &[crate::il::Instruction],
    term: &crate::il::Instruction,
    param_regs: &[PhysReg],
) -> Option<MFunction> {
    if non_term.len() != 1 {
        return None;
    }
    let inst = &non_term[0];
    if inst.opcode != Opcode::Call {
        return None;
    }
    match inst.result {
        Some(id) => {
            if term.operands.first()?.as_temp() != Some(id) {
                return None;
            }
        }
        None => {
            if !term.operands.is_empty() {
                return None;
            }
        }
    }
    if inst.result_ty.is_float() || inst.result_ty == Type::Str {
        return None;
    }
    if inst.operands.len() > target.int_arg_order.len() {
        return None;
    }
    if inst.callee.as_deref() == Some("rt_arr_obj_get") {
        return None;
    }

    enum Arg {
        Reg(PhysReg),
        Imm(i64),
    }
    let mut args = Vec::with_capacity(inst.operands.len());
    for v in &inst.operands {
        match v {
            Value::ConstInt(imm) => args.push(Arg::Imm(*imm)),
            Value::Temp(id) => {
                let src = param_regs[param_index(func, *id)?];
                if src.class() != RegClass::Gpr {
                    return None;
                }
                args.push(Arg::Reg(src));
            }
            _ => return None,
        }
    }

    let mut reg_pairs = Vec::new();
    let mut imm_pairs = Vec::new();
    for (i, a) in args.iter().enumerate() {
        let dst = target.int_arg_order[i];
        match a {
            Arg::Reg(src) if *src != dst => reg_pairs.push((dst, *src)),
            Arg::Reg(_) => {}
            Arg::Imm(v) => imm_pairs.push((dst, *v)),
        }
    }

    let (mut mf, bi) = new_single_block_fn(func);
    let scratch = super::target::GLOBAL_SCRATCH_GPR;
    for (dst, src) in sequentialize_moves(reg_pairs, scratch) {
        mf.block_mut(bi).push(MInstr::new(MOpcode::MovRR, [op(MReg::phys(dst)), op(MReg::phys(src))]));
    }
    for (dst, imm) in imm_pairs {
        mf.block_mut(bi).push(MInstr::new(MOpcode::MovRI, [op(MReg::phys(dst)), MOperand::Imm(imm)]));
    }

    let callee = inst.callee.clone().unwrap_or_default();
    mf.block_mut(bi).push(MInstr::new(MOpcode::Bl, [MOperand::Label(callee)]));

    if inst.result.is_some() {
        let ret_reg = MReg::phys(target.int_return_reg);
        if inst.result_ty == Type::I1 {
            let scratch_reg = MReg::phys(scratch);
            mf.block_mut(bi).push(MInstr::new(MOpcode::MovRI, [op(scratch_reg), MOperand::Imm(1)]));
            mf.block_mut(bi).push(MInstr::new(MOpcode::AndRRR, [op(ret_reg), op(ret_reg), op(scratch_reg)]));
        }
    }
    mf.block_mut(bi).push(MInstr::new(MOpcode::Ret, []));
    Some(mf)
}
