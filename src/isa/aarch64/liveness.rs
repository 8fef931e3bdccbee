//! Cross-block liveness analysis for IL -> MIR lowering (`spec.md` §3.5, §4.2).
//!
//! A single linear sweep identifies IL temporaries that are defined in one
//! block and used in another. Since register allocation runs per-block, such
//! temps must be spilled at definition and reloaded at every cross-block use.

use super::frame::{FrameBuilder, SLOT_SIZE_BYTES};
use crate::il::{Function, Value};
use rustc_hash::{FxHashMap, FxHashSet};

/// Offset added to an IL temp id before calling `ensureSpill`, so cross-block
/// spill keys never collide with vreg-id spill keys (`spec.md` §3.4).
const CROSS_BLOCK_SPILL_KEY_BASE: u32 = 50_000;

/// Result of [`analyze_cross_block_liveness`] (`spec.md` §3.5).
#[derive(Debug, Default)]
pub struct LivenessInfo {
    /// IL temp id -> defining block index.
    pub temp_def_block: FxHashMap<u32, usize>,
    /// IL temp ids used in a block other than their definer's.
    pub cross_block_temps: FxHashSet<u32>,
    /// IL temp id -> FP-relative spill offset reserved for it.
    pub cross_block_spill_offset: FxHashMap<u32, i32>,
}

impl LivenessInfo {
    pub fn is_cross_block(&self, temp_id: u32) -> bool {
        self.cross_block_temps.contains(&temp_id)
    }
}

/// Run the single-pass analysis described in `spec.md` §4.2.
///
/// Alloca producers are excluded: their "value" is a stack address, always
/// recomputable from the frame pointer, so they never need a spill slot.
pub fn analyze_cross_block_liveness(
    func: &Function,
    alloca_temps: &FxHashSet<u32>,
    fb: &mut FrameBuilder,
) -> LivenessInfo {
    let mut info = LivenessInfo::default();

    for (bi, block) in func.blocks.iter().enumerate() {
        for param in &block.params {
            info.temp_def_block.insert(param.id.0, bi);
        }
        for inst in &block.insts {
            if let Some(result) = inst.result {
                info.temp_def_block.insert(result.0, bi);
            }
        }
    }

    for (bi, block) in func.blocks.iter().enumerate() {
        let mut check_value = |v: &Value, info: &mut LivenessInfo| {
            if let Value::Temp(id) = v {
                if alloca_temps.contains(&id.0) {
                    return;
                }
                if let Some(&def_block) = info.temp_def_block.get(&id.0) {
                    if def_block != bi {
                        info.cross_block_temps.insert(id.0);
                    }
                }
            }
        };

        for inst in &block.insts {
            for op in &inst.operands {
                check_value(op, &mut info);
            }
            for args in &inst.block_args {
                for arg in args {
                    check_value(arg, &mut info);
                }
            }
        }
    }

    let mut cross_block_ids: Vec<u32> = info.cross_block_temps.iter().copied().collect();
    cross_block_ids.sort_unstable();
    for temp_id in cross_block_ids {
        let offset =
            fb.ensure_spill(CROSS_BLOCK_SPILL_KEY_BASE + temp_id, SLOT_SIZE_BYTES, SLOT_SIZE_BYTES);
        info.cross_block_spill_offset.insert(temp_id, offset);
    }

    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{Block, BlockParam, Instruction, Opcode, TempId, Type};

    #[test]
    fn temp_used_only_locally_is_not_cross_block() {
        let mut entry = Block::new("entry");
        entry.insts.push(
            Instruction::new(Opcode::Add)
                .with_result(TempId(0), Type::I64)
                .with_operands(vec![Value::ConstInt(1), Value::ConstInt(2)]),
        );
        entry.insts.push(Instruction::new(Opcode::Ret).with_operands(vec![Value::Temp(TempId(0))]));
        let func = Function { name: "f".into(), blocks: vec![entry] };

        let mut fb = FrameBuilder::new();
        let info = analyze_cross_block_liveness(&func, &FxHashSet::default(), &mut fb);
        assert!(!info.is_cross_block(0));
    }

    #[test]
    fn temp_defined_in_entry_used_in_loop_is_cross_block() {
        let mut entry = Block::new("entry");
        entry.insts.push(
            Instruction::new(Opcode::Add)
                .with_result(TempId(0), Type::I64)
                .with_operands(vec![Value::ConstInt(1), Value::ConstInt(2)]),
        );
        entry.insts.push(Instruction::new(Opcode::Br).with_labels(vec!["loop".into()]));

        let mut loop_block = Block::new("loop");
        loop_block
            .insts
            .push(Instruction::new(Opcode::Ret).with_operands(vec![Value::Temp(TempId(0))]));

        let func = Function { name: "f".into(), blocks: vec![entry, loop_block] };

        let mut fb = FrameBuilder::new();
        let info = analyze_cross_block_liveness(&func, &FxHashSet::default(), &mut fb);
        assert!(info.is_cross_block(0));
        assert!(info.cross_block_spill_offset.contains_key(&0));
    }

    #[test]
    fn alloca_temps_are_excluded() {
        let mut entry = Block::new("entry");
        entry.insts.push(Instruction::new(Opcode::Alloca).with_result(TempId(0), Type::Ptr));
        entry.insts.push(Instruction::new(Opcode::Br).with_labels(vec!["next".into()]));
        let mut next = Block::new("next");
        next.insts.push(Instruction::new(Opcode::Load).with_operands(vec![Value::Temp(TempId(0))]));
        next.insts.push(Instruction::new(Opcode::Ret));
        let func = Function { name: "f".into(), blocks: vec![entry, next] };

        let mut allocas = FxHashSet::default();
        allocas.insert(0u32);
        let mut fb = FrameBuilder::new();
        let info = analyze_cross_block_liveness(&func, &allocas, &mut fb);
        assert!(!info.is_cross_block(0));
    }

    #[test]
    fn block_params_count_as_definitions() {
        let mut entry = Block::new("entry");
        entry.insts.push(Instruction::new(Opcode::Br).with_labels(vec!["loop".into()]));
        let mut loop_block = Block::new("loop");
        loop_block.params.push(BlockParam { id: TempId(5), ty: Type::I64 });
        loop_block
            .insts
            .push(Instruction::new(Opcode::Ret).with_operands(vec![Value::Temp(TempId(5))]));
        let func = Function { name: "f".into(), blocks: vec![entry, loop_block] };

        let mut fb = FrameBuilder::new();
        let info = analyze_cross_block_liveness(&func, &FxHashSet::default(), &mut fb);
        assert_eq!(info.temp_def_block.get(&5), Some(&1));
        assert!(!info.is_cross_block(5));
    }
}
