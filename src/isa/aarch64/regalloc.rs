//! Linear-scan register allocation over one function's MIR (`spec.md` §4.7).

use super::frame::{FrameBuilder, SLOT_SIZE_BYTES};
use super::mir::{MFunction, MInstr, MOpcode, MOperand, MReg};
use super::target::{PhysReg, RegClass, TargetDescriptor};
use rustc_hash::{FxHashMap, FxHashSet};

#[derive(Debug, Clone, Default)]
struct VregState {
    phys: Option<PhysReg>,
    spilled: bool,
    last_use: usize,
}

/// Mirrors the original's `isAllocatableGPR`: excludes the frame pointer
/// (X29), link register (X30), stack pointer, X18 (reserved on Darwin), and
/// the global scratch GPR. FPR registers never match any of these, so this is
/// safe to apply uniformly to both register classes.
fn is_allocatable(r: PhysReg) -> bool {
    !matches!(r, PhysReg::X29 | PhysReg::X30 | PhysReg::Sp | PhysReg::X18) && r != super::target::GLOBAL_SCRATCH_GPR
}

struct Pool {
    free: Vec<PhysReg>,
}

impl Pool {
    fn new(target: &TargetDescriptor, class: RegClass) -> Self {
        let (caller, callee) = match class {
            RegClass::Gpr => (&target.caller_saved_gpr, &target.callee_saved_gpr),
            RegClass::Fpr => (&target.caller_saved_fpr, &target.callee_saved_fpr),
        };
        // Caller-saved first (preferred, spares callee-saved preservation
        // overhead), then callee-saved. Argument registers stay reserved for
        // call marshalling, and `is_allocatable` drops the frame
        // pointer/link register/SP/X18/global scratch GPR from *either* list
        // — `callee_saved_gpr` carries X29, so without this filter on the
        // callee chain too the frame pointer could be handed out under
        // register pressure (`spec.md` §3.1 invariant iv).
        let mut free: Vec<PhysReg> = caller
            .iter()
            .chain(callee.iter())
            .copied()
            .filter(|r| !target.is_arg_register(*r) && is_allocatable(*r))
            .collect();
        free.reverse(); // pop() takes from the preferred end first
        Pool { free }
    }

    fn take(&mut self) -> Option<PhysReg> {
        self.free.pop()
    }

    fn give_back(&mut self, r: PhysReg) {
        self.free.push(r);
    }
}

/// Per-opcode register-operand role (`spec.md` §4.7): true when the operand
/// at `idx` is written (a definition), false when merely read. Every
/// MIR-producing lowerer places its sole def, when it has one, at operand
/// index 0; opcodes with no register def (compares, stores, branches, calls)
/// return false for every index.
fn is_def_operand(opcode: MOpcode, idx: usize) -> bool {
    use MOpcode::*;
    idx == 0
        && matches!(
            opcode,
            MovRR | MovRI
                | AddRRR
                | SubRRR
                | MulRRR
                | SDivRRR
                | UDivRRR
                | AndRRR
                | OrrRRR
                | EorRRR
                | MSubRRRR
                | AddRI
                | SubRI
                | LslRI
                | LsrRI
                | AsrRI
                | LslRRR
                | LsrRRR
                | AsrRRR
                | Cset
                | FMovRR
                | FMovRI
                | FMovGR
                | FAddRRR
                | FSubRRR
                | FMulRRR
                | FDivRRR
                | FRintN
                | SCvtF
                | UCvtF
                | FCvtZS
                | FCvtZU
                | LdrRegFpImm
                | LdrFprFpImm
                | LdrRegBaseImm
                | LdrFprBaseImm
                | AddFpImm
                | AdrPage
                | AddPageOff
        )
}

/// Linear-scan allocator state for one function (`spec.md` §4.7).
pub struct RegAllocLinear<'a> {
    target: &'a TargetDescriptor,
    gpr_pool: Pool,
    fpr_pool: Pool,
    gpr_states: FxHashMap<u16, VregState>,
    fpr_states: FxHashMap<u16, VregState>,
    callee_used: FxHashSet<PhysReg>,
    callee_used_fpr: FxHashSet<PhysReg>,
}

impl<'a> RegAllocLinear<'a> {
    pub fn new(target: &'a TargetDescriptor) -> Self {
        RegAllocLinear {
            target,
            gpr_pool: Pool::new(target, RegClass::Gpr),
            fpr_pool: Pool::new(target, RegClass::Fpr),
            gpr_states: FxHashMap::default(),
            fpr_states: FxHashMap::default(),
            callee_used: FxHashSet::default(),
            callee_used_fpr: FxHashSet::default(),
        }
    }

    fn states(&mut self, class: RegClass) -> &mut FxHashMap<u16, VregState> {
        match class {
            RegClass::Gpr => &mut self.gpr_states,
            RegClass::Fpr => &mut self.fpr_states,
        }
    }

    fn pool(&mut self, class: RegClass) -> &mut Pool {
        match class {
            RegClass::Gpr => &mut self.gpr_pool,
            RegClass::Fpr => &mut self.fpr_pool,
        }
    }

    fn record_callee_used(&mut self, r: PhysReg) {
        if self.target.callee_saved_gpr.contains(&r) {
            self.callee_used.insert(r);
        } else if self.target.callee_saved_fpr.contains(&r) {
            self.callee_used_fpr.insert(r);
        }
    }

    /// Pick a victim to spill when `class`'s pool is empty: prefer a vreg with
    /// no remaining use in this block; break ties by highest `last_use`
    /// ("furthest next-use" heuristic, `spec.md` §4.7).
    fn choose_victim(&self, class: RegClass, next_use: &FxHashMap<u16, usize>) -> Option<u16> {
        let states = match class {
            RegClass::Gpr => &self.gpr_states,
            RegClass::Fpr => &self.fpr_states,
        };
        states
            .iter()
            .filter(|(_, s)| s.phys.is_some() && !s.spilled)
            .max_by_key(|(id, s)| {
                let next = next_use.get(id).copied().unwrap_or(usize::MAX);
                (next, s.last_use)
            })
            .map(|(id, _)| *id)
    }

    /// Spill `id` to its frame slot, inserting the store immediately before
    /// `*cursor` and advancing `*cursor` past it so it still points at the
    /// instruction being allocated.
    fn spill_vreg(&mut self, func: &mut MFunction, block_idx: usize, cursor: &mut usize, class: RegClass, id: u16, frame: &mut FrameBuilder) {
        let phys = {
            let state = self.states(class).get(&id).cloned().unwrap_or_default();
            state.phys
        };
        let Some(phys) = phys else { return };
        let offset = frame.ensure_spill(id as u32, SLOT_SIZE_BYTES, SLOT_SIZE_BYTES);
        let store_op = match class {
            RegClass::Gpr => MOpcode::StrRegFpImm,
            RegClass::Fpr => MOpcode::StrFprFpImm,
        };
        let instr = MInstr::new(store_op, [MOperand::Reg(MReg::phys(phys)), MOperand::Imm(offset as i64)]);
        func.block_mut(block_idx).instrs.insert(*cursor, instr);
        *cursor += 1;
        self.pool(class).give_back(phys);
        let state = self.states(class).entry(id).or_default();
        state.phys = None;
        state.spilled = true;
    }

    /// Assign `reg` a physical register, spilling a victim and/or emitting a
    /// reload as needed. Any inserted instruction goes immediately before
    /// `*cursor`, which is advanced past it so it keeps pointing at the
    /// instruction currently being allocated.
    fn materialize(
        &mut self,
        func: &mut MFunction,
        block_idx: usize,
        cursor: &mut usize,
        reg: MReg,
        is_use: bool,
        next_use: &FxHashMap<u16, usize>,
        frame: &mut FrameBuilder,
    ) -> PhysReg {
        let id = reg.vreg_id();
        if let Some(phys) = self.states(reg.class).get(&id).and_then(|s| s.phys) {
            return phys;
        }
        if self.pool(reg.class).free.is_empty() {
            if let Some(victim) = self.choose_victim(reg.class, next_use) {
                if victim != id {
                    self.spill_vreg(func, block_idx, cursor, reg.class, victim, frame);
                }
            }
        }
        let phys = self.pool(reg.class).take().unwrap_or_else(|| {
            // Pool exhaustion despite spilling is a fatal invariant violation
            // (`spec.md` §7).
            panic!("register allocator ran out of physical registers for class {:?}", reg.class)
        });
        self.record_callee_used(phys);

        let was_spilled = self.states(reg.class).get(&id).map(|s| s.spilled).unwrap_or(false);
        if is_use && was_spilled {
            let offset = frame.ensure_spill(id as u32, SLOT_SIZE_BYTES, SLOT_SIZE_BYTES);
            let load_op = match reg.class {
                RegClass::Gpr => MOpcode::LdrRegFpImm,
                RegClass::Fpr => MOpcode::LdrFprFpImm,
            };
            let instr = MInstr::new(load_op, [MOperand::Reg(MReg::phys(phys)), MOperand::Imm(offset as i64)]);
            func.block_mut(block_idx).instrs.insert(*cursor, instr);
            *cursor += 1;
        }

        let state = self.states(reg.class).entry(id).or_default();
        state.phys = Some(phys);
        state.spilled = false;
        phys
    }

    /// Materialize the register operand at `operand_idx` of the instruction
    /// currently at `*cursor`, then rewrite it to the assigned physical
    /// register. A no-op if that operand is already physical (or isn't a
    /// register). `is_use` selects whether a reload is owed if the vreg was
    /// previously spilled, and whether `last_use` tracking applies — a pure
    /// def must not reload a value it's about to overwrite (`spec.md` §4.7).
    fn materialize_operand(
        &mut self,
        func: &mut MFunction,
        block_idx: usize,
        cursor: &mut usize,
        operand_idx: usize,
        is_use: bool,
        next_use: &FxHashMap<u16, usize>,
        frame: &mut FrameBuilder,
    ) {
        let reg = match &func.blocks[block_idx].instrs[*cursor].operands[operand_idx] {
            MOperand::Reg(r) if !r.is_phys => *r,
            _ => return,
        };
        let phys = self.materialize(func, block_idx, cursor, reg, is_use, next_use, frame);
        if let MOperand::Reg(r) = &mut func.block_mut(block_idx).instrs[*cursor].operands[operand_idx] {
            *r = MReg::phys(phys);
        }
        if is_use {
            let state = self.states(reg.class).entry(reg.vreg_id()).or_default();
            state.last_use = *cursor;
        }
    }

    /// Spill every caller-saved vreg currently resident before a call
    /// instruction (`spec.md` §4.7). Callee-saved registers survive calls by
    /// convention. Each inserted store advances `*cursor`, which keeps
    /// pointing at the call instruction itself.
    fn spill_across_call(&mut self, func: &mut MFunction, block_idx: usize, cursor: &mut usize, frame: &mut FrameBuilder) {
        for class in [RegClass::Gpr, RegClass::Fpr] {
            let caller_saved = match class {
                RegClass::Gpr => &self.target.caller_saved_gpr,
                RegClass::Fpr => &self.target.caller_saved_fpr,
            };
            let resident: Vec<u16> = self
                .states(class)
                .iter()
                .filter(|(_, s)| s.phys.map(|p| caller_saved.contains(&p)).unwrap_or(false))
                .map(|(id, _)| *id)
                .collect();
            for id in resident {
                self.spill_vreg(func, block_idx, cursor, class, id, frame);
            }
        }
    }

    /// Compute each vreg's last-use instruction index within one block, for
    /// the victim-selection heuristic.
    fn next_use_map(instrs: &[MInstr]) -> FxHashMap<u16, usize> {
        let mut map = FxHashMap::default();
        for (i, instr) in instrs.iter().enumerate() {
            for r in instr.reg_operands() {
                if !r.is_phys {
                    map.insert(r.vreg_id(), i);
                }
            }
        }
        map
    }

    /// Allocate one block in place, rewriting every virtual-register operand
    /// to a physical one.
    fn allocate_block(&mut self, func: &mut MFunction, block_idx: usize, frame: &mut FrameBuilder, live_out: &FxHashSet<u16>) {
        let next_use = Self::next_use_map(&func.blocks[block_idx].instrs);

        let mut i = 0;
        while i < func.blocks[block_idx].instrs.len() {
            let opcode = func.blocks[block_idx].instrs[i].opcode;
            if matches!(opcode, MOpcode::Bl | MOpcode::Blr) {
                if opcode == MOpcode::Blr {
                    // The indirect-call target is a use; materialize and
                    // rewrite it before spilling callers around the call, so
                    // the emitted `blr` never references a spilled/virtual
                    // register (`spec.md` §4.5).
                    self.materialize_operand(func, block_idx, &mut i, 0, true, &next_use, frame);
                }
                self.spill_across_call(func, block_idx, &mut i, frame);
                i += 1;
                continue;
            }

            let roles: Vec<(usize, bool)> = func.blocks[block_idx].instrs[i]
                .operands
                .iter()
                .enumerate()
                .filter_map(|(idx, o)| match o {
                    MOperand::Reg(r) if !r.is_phys => Some((idx, is_def_operand(opcode, idx))),
                    _ => None,
                })
                .collect();

            // Uses are materialized before defs: a def that reuses the same
            // vreg as an earlier use in the same instruction (e.g.
            // `AddPageOff`'s in-place `dst`) must see it already resident
            // rather than trigger a reload of a value about to be
            // overwritten. Each materialize_operand call may insert a
            // spill/reload before the current instruction and advances `i`
            // to match, so every later lookup in this loop still lands on
            // the instruction being allocated.
            for &(idx, is_def) in &roles {
                if !is_def {
                    self.materialize_operand(func, block_idx, &mut i, idx, true, &next_use, frame);
                }
            }
            for &(idx, is_def) in &roles {
                if is_def {
                    self.materialize_operand(func, block_idx, &mut i, idx, false, &next_use, frame);
                }
            }

            i += 1;
        }

        for &id in live_out {
            for class in [RegClass::Gpr, RegClass::Fpr] {
                if let Some(state) = self.states(class).get(&id).cloned() {
                    if let Some(phys) = state.phys {
                        if !state.spilled {
                            let offset = frame.ensure_spill(id as u32, SLOT_SIZE_BYTES, SLOT_SIZE_BYTES);
                            let store_op = match class {
                                RegClass::Gpr => MOpcode::StrRegFpImm,
                                RegClass::Fpr => MOpcode::StrFprFpImm,
                            };
                            let last = func.blocks[block_idx].instrs.len().saturating_sub(1);
                            let instr = MInstr::new(
                                store_op,
                                [MOperand::Reg(MReg::phys(phys)), MOperand::Imm(offset as i64)],
                            );
                            func.block_mut(block_idx).instrs.insert(last, instr);
                            self.pool(class).give_back(phys);
                            if let Some(s) = self.states(class).get_mut(&id) {
                                s.phys = None;
                                s.spilled = true;
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn finish(self, func: &mut MFunction) {
        func.saved_gprs = {
            let mut v: Vec<PhysReg> = self.callee_used.into_iter().collect();
            v.sort_by_key(|r| r.name());
            v
        };
        func.saved_fprs = {
            let mut v: Vec<PhysReg> = self.callee_used_fpr.into_iter().collect();
            v.sort_by_key(|r| r.name());
            v
        };
    }
}

/// A conservative cross-block liveOut: the union of vregs used (as an
/// operand, in any role) by any successor block (`spec.md` §4.7).
fn compute_live_out(func: &MFunction) -> Vec<FxHashSet<u16>> {
    let successors: Vec<Vec<usize>> = func
        .blocks
        .iter()
        .map(|b| {
            b.instrs
                .iter()
                .filter(|i| matches!(i.opcode, MOpcode::Br | MOpcode::BCond))
                .filter_map(|i| i.operands.iter().find_map(|o| match o {
                    MOperand::Label(l) => func.block_index(l),
                    _ => None,
                }))
                .collect()
        })
        .collect();

    func.blocks
        .iter()
        .enumerate()
        .map(|(bi, _)| {
            let mut out = FxHashSet::default();
            for &succ in &successors[bi] {
                for instr in &func.blocks[succ].instrs {
                    for r in instr.reg_operands() {
                        if !r.is_phys {
                            out.insert(r.vreg_id());
                        }
                    }
                }
            }
            out
        })
        .collect()
}

/// Run linear-scan allocation over every block of `func`, mutating it in
/// place so every register operand becomes physical.
pub fn allocate(func: &mut MFunction, target: &TargetDescriptor, frame: &mut FrameBuilder) {
    let live_out_sets = compute_live_out(func);
    let mut alloc = RegAllocLinear::new(target);
    for bi in 0..func.blocks.len() {
        alloc.allocate_block(func, bi, frame, &live_out_sets[bi]);
    }
    alloc.finish(func);
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::mir::MBasicBlock;

    #[test]
    fn simple_block_becomes_fully_physical() {
        let target = TargetDescriptor::darwin_arm64();
        let mut func = MFunction::new("f");
        let mut block = MBasicBlock::new("entry");
        let v0 = MReg::virt(RegClass::Gpr, 0);
        let v1 = MReg::virt(RegClass::Gpr, 1);
        block.push(MInstr::new(MOpcode::MovRI, [MOperand::Reg(v0), MOperand::Imm(1)]));
        block.push(MInstr::new(MOpcode::MovRI, [MOperand::Reg(v1), MOperand::Imm(2)]));
        block.push(MInstr::new(MOpcode::AddRRR, [MOperand::Reg(v0), MOperand::Reg(v0), MOperand::Reg(v1)]));
        func.blocks.push(block);

        let mut frame = FrameBuilder::new();
        allocate(&mut func, &target, &mut frame);
        assert!(func.is_fully_allocated());
    }

    #[test]
    fn callee_saved_recorded_when_pool_forces_their_use() {
        let target = TargetDescriptor::darwin_arm64();
        let mut func = MFunction::new("f");
        let mut block = MBasicBlock::new("entry");
        for i in 0..20u16 {
            let v = MReg::virt(RegClass::Gpr, i);
            block.push(MInstr::new(MOpcode::MovRI, [MOperand::Reg(v), MOperand::Imm(i as i64)]));
        }
        func.blocks.push(block);
        let mut frame = FrameBuilder::new();
        allocate(&mut func, &target, &mut frame);
        assert!(func.is_fully_allocated());
    }

    #[test]
    fn global_scratch_gpr_never_assigned_by_the_allocator() {
        let target = TargetDescriptor::darwin_arm64();
        let pool = Pool::new(&target, RegClass::Gpr);
        assert!(!pool.free.contains(&super::super::target::GLOBAL_SCRATCH_GPR));
    }

    #[test]
    fn frame_pointer_never_assigned_by_the_allocator() {
        let target = TargetDescriptor::darwin_arm64();
        let pool = Pool::new(&target, RegClass::Gpr);
        assert!(!pool.free.contains(&PhysReg::X29));
    }

    #[test]
    fn indirect_call_target_is_rewritten_to_a_physical_register() {
        let target = TargetDescriptor::darwin_arm64();
        let mut func = MFunction::new("f");
        let mut block = MBasicBlock::new("entry");
        let holder = MReg::virt(RegClass::Gpr, 0);
        block.push(MInstr::new(MOpcode::MovRI, [MOperand::Reg(holder), MOperand::Imm(0)]));
        block.push(MInstr::new(MOpcode::Blr, [MOperand::Reg(holder)]));
        func.blocks.push(block);

        let mut frame = FrameBuilder::new();
        allocate(&mut func, &target, &mut frame);
        assert!(func.is_fully_allocated());
    }

    #[test]
    fn value_spilled_across_a_call_stays_fully_allocated_on_reuse() {
        // Enough concurrently live vregs to exhaust the pool, each used again
        // after an intervening call, forcing both a spill-across-call and a
        // later reload — the path that used to leave a stale vreg behind
        // when the reload instruction shifted the consuming instruction.
        let target = TargetDescriptor::darwin_arm64();
        let mut func = MFunction::new("f");
        let mut block = MBasicBlock::new("entry");
        let vregs: Vec<MReg> = (0..18u16).map(|i| MReg::virt(RegClass::Gpr, i)).collect();
        for (i, &v) in vregs.iter().enumerate() {
            block.push(MInstr::new(MOpcode::MovRI, [MOperand::Reg(v), MOperand::Imm(i as i64)]));
        }
        block.push(MInstr::new(MOpcode::Bl, [MOperand::Label("callee".into())]));
        for &v in &vregs {
            block.push(MInstr::new(MOpcode::AddRI, [MOperand::Reg(v), MOperand::Reg(v), MOperand::Imm(1)]));
        }
        func.blocks.push(block);

        let mut frame = FrameBuilder::new();
        allocate(&mut func, &target, &mut frame);
        assert!(func.is_fully_allocated());
    }
}
