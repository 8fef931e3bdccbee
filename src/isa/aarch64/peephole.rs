//! Local rewrites and dead-code elimination over allocated MIR (`spec.md` §4.8).
//!
//! A single pass, sequential phases per block, then one cross-block phase.
//! Each phase returns a count, purely for reporting — nothing downstream
//! consumes the numbers.

use super::mir::{MBasicBlock, MFunction, MInstr, MOpcode, MOperand, MReg};
use super::target::PhysReg;
use rustc_hash::FxHashMap;

/// Per-phase rewrite counts. Not consumed beyond reporting (`spec.md` §4.8).
#[derive(Debug, Default, Clone, Copy)]
pub struct PeepholeStats {
    pub blocks_reordered: usize,
    pub constant_rewrites: usize,
    pub moves_folded: usize,
    pub identities_removed: usize,
    pub dead_instrs_removed: usize,
    pub branches_to_next_removed: usize,
}

fn is_cold_block(block: &MBasicBlock) -> bool {
    let name_says_cold = ["trap", "error", "panic"].iter().any(|kw| block.name.to_lowercase().contains(kw));
    if name_says_cold {
        return true;
    }
    block.instrs.len() == 1
        && block.instrs[0].opcode == MOpcode::Bl
        && matches!(
            block.instrs[0].operands.first(),
            Some(MOperand::Label(l)) if l == "rt_trap" || l == "rt_arr_oob_panic"
        )
}

fn reorder_cold_blocks(func: &mut MFunction, stats: &mut PeepholeStats) {
    let (hot, cold): (Vec<_>, Vec<_>) = func.blocks.drain(..).partition(|b| !is_cold_block(b));
    stats.blocks_reordered = cold.len();
    func.blocks = hot;
    func.blocks.extend(cold);
}

fn reg_key(r: MReg) -> (bool, bool, u16) {
    (r.is_phys, matches!(r.class, super::target::RegClass::Fpr), r.id_or_phys)
}

/// Constant tracking + local rewrites (`spec.md` §4.8 phase 1).
fn constant_track_and_rewrite(block: &mut MBasicBlock, stats: &mut PeepholeStats) {
    let mut known: FxHashMap<(bool, bool, u16), i64> = FxHashMap::default();
    let mut i = 0;
    while i < block.instrs.len() {
        let instr = block.instrs[i].clone();

        match instr.opcode {
            MOpcode::MovRI => {
                let dst = instr.operands[0].as_reg();
                known.insert(reg_key(dst), instr.operands[1].as_imm());
            }
            // Calls clobber caller-saved registers; drop all tracked constants
            // rather than model which survive.
            MOpcode::Bl | MOpcode::Blr => {
                known.clear();
            }
            _ => {
                for r in instr.reg_operands() {
                    known.remove(&reg_key(r));
                }
            }
        }

        if instr.opcode == MOpcode::CmpRI && instr.operands[1].as_imm() == 0 {
            let reg = instr.operands[0].as_reg();
            block.instrs[i] = MInstr::new(MOpcode::TstRR, [MOperand::Reg(reg), MOperand::Reg(reg)]);
            stats.constant_rewrites += 1;
        } else if matches!(instr.opcode, MOpcode::AddRI | MOpcode::SubRI) && instr.operands[2].as_imm() == 0 {
            let dst = instr.operands[0].clone();
            let src = instr.operands[1].clone();
            block.instrs[i] = MInstr::new(MOpcode::MovRR, [dst, src]);
            stats.constant_rewrites += 1;
        } else if instr.opcode == MOpcode::MulRRR {
            if let Some(rewritten) = as_pow2_shift(&instr, &known) {
                block.instrs[i] = rewritten;
                stats.constant_rewrites += 1;
            }
        }

        i += 1;
    }
}

fn as_pow2_shift(instr: &MInstr, known: &FxHashMap<(bool, bool, u16), i64>) -> Option<MInstr> {
    let dst = instr.operands[0].as_reg();
    let a = instr.operands[1].as_reg();
    let b = instr.operands[2].as_reg();
    let (other, constant_val) = if let Some(&v) = known.get(&reg_key(b)) {
        (a, v)
    } else if let Some(&v) = known.get(&reg_key(a)) {
        (b, v)
    } else {
        return None;
    };
    if constant_val <= 0 || (constant_val & (constant_val - 1)) != 0 {
        return None;
    }
    let log2 = constant_val.trailing_zeros();
    if log2 > 63 {
        return None;
    }
    Some(MInstr::new(MOpcode::LslRI, [MOperand::Reg(dst), MOperand::Reg(other), MOperand::Imm(log2 as i64)]))
}

/// Consecutive move folding (`spec.md` §4.8 phase 2): `MovRR r1, r2; MovRR r3,
/// r1` with no intervening use of `r1` collapses to `MovRR r3, r2`.
fn fold_consecutive_moves(block: &mut MBasicBlock, stats: &mut PeepholeStats) {
    let mut i = 0;
    while i + 1 < block.instrs.len() {
        let (first_is_mov, r1, r2) = match &block.instrs[i] {
            instr if instr.opcode == MOpcode::MovRR => {
                (true, instr.operands[0].as_reg(), instr.operands[1].as_reg())
            }
            _ => (false, MReg::phys(PhysReg::X0), MReg::phys(PhysReg::X0)),
        };
        if !first_is_mov {
            i += 1;
            continue;
        }
        let second = &block.instrs[i + 1];
        if second.opcode == MOpcode::MovRR && second.operands[1].as_reg() == r1 {
            let r3 = second.operands[0].as_reg();
            let used_between = false; // adjacent instructions: no instructions between them
            if !used_between {
                block.instrs[i] = MInstr::new(MOpcode::MovRR, [MOperand::Reg(r1), MOperand::Reg(r1)]);
                block.instrs[i + 1] = MInstr::new(MOpcode::MovRR, [MOperand::Reg(r3), MOperand::Reg(r2)]);
                stats.moves_folded += 1;
            }
        }
        i += 1;
    }
}

/// Identity-move removal (`spec.md` §4.8 phase 3).
fn remove_identity_moves(block: &mut MBasicBlock, stats: &mut PeepholeStats) {
    let before = block.instrs.len();
    block.instrs.retain(|i| {
        let identity = matches!(i.opcode, MOpcode::MovRR | MOpcode::FMovRR)
            && i.operands[0].as_reg() == i.operands[1].as_reg();
        !identity
    });
    stats.identities_removed += before - block.instrs.len();
}

fn arg_return_regs() -> Vec<PhysReg> {
    use PhysReg::*;
    vec![X0, X1, X2, X3, X4, X5, X6, X7, V0, V1, V2, V3, V4, V5, V6, V7]
}

/// Conservative dead-instruction elimination (`spec.md` §4.8 phase 4).
fn eliminate_dead(block: &mut MBasicBlock, stats: &mut PeepholeStats) {
    let mut live_out: rustc_hash::FxHashSet<MReg> =
        arg_return_regs().into_iter().map(MReg::phys).collect();
    let mut keep = vec![true; block.instrs.len()];

    for i in (0..block.instrs.len()).rev() {
        let instr = &block.instrs[i];
        let writes_live_arg_reg = instr
            .reg_operands()
            .next()
            .map(|dst| arg_return_regs().contains(&dst.as_phys_opt().unwrap_or(PhysReg::Sp)))
            .unwrap_or(false);
        let dest_in_live_out = instr.reg_operands().next().map(|r| live_out.contains(&r)).unwrap_or(false);

        if instr.is_side_effecting() || writes_live_arg_reg || dest_in_live_out {
            keep[i] = true;
            for r in instr.reg_operands() {
                live_out.insert(r);
            }
            if let Some(dst) = instr.reg_operands().next() {
                if !instr.is_side_effecting() {
                    live_out.remove(&dst);
                    for r in instr.reg_operands().skip(1) {
                        live_out.insert(r);
                    }
                }
            }
        } else {
            keep[i] = false;
        }
    }

    let mut idx = 0;
    let before = block.instrs.len();
    block.instrs.retain(|_| {
        let k = keep[idx];
        idx += 1;
        k
    });
    stats.dead_instrs_removed += before - block.instrs.len();
}

/// Branch-to-next elimination, cross-block (`spec.md` §4.8 phase 5).
fn remove_branch_to_next(func: &mut MFunction, stats: &mut PeepholeStats) {
    for i in 0..func.blocks.len().saturating_sub(1) {
        let next_name = func.blocks[i + 1].name.clone();
        let block = &mut func.blocks[i];
        if let Some(last) = block.instrs.last() {
            if last.opcode == MOpcode::Br && last.operands.first() == Some(&MOperand::Label(next_name)) {
                block.instrs.pop();
                stats.branches_to_next_removed += 1;
            }
        }
    }
}

/// Run the full peephole pipeline over `func` in place.
pub fn run(func: &mut MFunction) -> PeepholeStats {
    let mut stats = PeepholeStats::default();
    reorder_cold_blocks(func, &mut stats);
    for block in &mut func.blocks {
        constant_track_and_rewrite(block, &mut stats);
        fold_consecutive_moves(block, &mut stats);
        remove_identity_moves(block, &mut stats);
        eliminate_dead(block, &mut stats);
    }
    remove_branch_to_next(func, &mut stats);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_moves_are_removed() {
        let mut block = MBasicBlock::new("b");
        let r = MReg::phys(PhysReg::X2);
        block.push(MInstr::new(MOpcode::MovRR, [MOperand::Reg(r), MOperand::Reg(r)]));
        block.push(MInstr::new(MOpcode::Ret, []));
        let mut stats = PeepholeStats::default();
        remove_identity_moves(&mut block, &mut stats);
        assert_eq!(stats.identities_removed, 1);
        assert_eq!(block.instrs.len(), 1);
    }

    #[test]
    fn cmp_zero_becomes_tst() {
        let mut block = MBasicBlock::new("b");
        let r = MReg::phys(PhysReg::X0);
        block.push(MInstr::new(MOpcode::CmpRI, [MOperand::Reg(r), MOperand::Imm(0)]));
        let mut stats = PeepholeStats::default();
        constant_track_and_rewrite(&mut block, &mut stats);
        assert_eq!(block.instrs[0].opcode, MOpcode::TstRR);
    }

    #[test]
    fn branch_to_immediately_following_block_is_removed() {
        let mut func = MFunction::new("f");
        let mut b0 = MBasicBlock::new("entry");
        b0.push(MInstr::new(MOpcode::Br, [MOperand::Label("next".into())]));
        let mut b1 = MBasicBlock::new("next");
        b1.push(MInstr::new(MOpcode::Ret, []));
        func.blocks.push(b0);
        func.blocks.push(b1);

        let mut stats = PeepholeStats::default();
        remove_branch_to_next(&mut func, &mut stats);
        assert_eq!(stats.branches_to_next_removed, 1);
        assert!(func.blocks[0].instrs.is_empty());
    }

    #[test]
    fn cold_blocks_move_to_end() {
        let mut func = MFunction::new("f");
        let mut trap = MBasicBlock::new(".Ltrap_div0_0");
        trap.push(MInstr::new(MOpcode::Bl, [MOperand::Label("rt_trap".into())]));
        let mut hot = MBasicBlock::new("entry");
        hot.push(MInstr::new(MOpcode::Ret, []));
        func.blocks.push(trap);
        func.blocks.push(hot);

        let mut stats = PeepholeStats::default();
        reorder_cold_blocks(&mut func, &mut stats);
        assert_eq!(func.blocks[0].name, "entry");
        assert_eq!(stats.blocks_reordered, 1);
    }
}
