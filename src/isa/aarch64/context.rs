//! Per-function lowering state (`spec.md` §3.6, §9 "Shared mutable state").
//!
//! The reference implementation groups everything a dispatch handler might
//! need to mutate into one context value passed by mutable reference. We keep
//! that shape rather than threading a dozen parameters through every
//! `InstrLowering` call.

use super::frame::FrameBuilder;
use super::liveness::LivenessInfo;
use super::mir::MReg;
use super::target::{RegClass, TargetDescriptor};
use crate::error::DispatchOutcome;
use rustc_hash::FxHashMap;
use std::cell::Cell;

thread_local! {
    /// Per-thread trap-label counter (`spec.md` §5, §9): guarantees unique
    /// trap-block names across functions compiled in parallel on different
    /// threads without synchronisation.
    static TRAP_LABEL_COUNTER: Cell<u32> = Cell::new(0);
}

/// Mint a unique trap-block label. Exposed standalone so call sites that
/// don't otherwise need a [`LoweringContext`] (e.g. fast paths) can still mint
/// one from the same per-thread sequence.
pub fn next_trap_label(prefix: &str) -> String {
    TRAP_LABEL_COUNTER.with(|c| {
        let n = c.get();
        c.set(n + 1);
        format!(".Ltrap_{prefix}_{n}")
    })
}

/// Per-block parameter register plan for phi-edge lowering.
#[derive(Debug, Clone, Default)]
pub struct PhiPlan {
    pub vreg_id: Vec<u16>,
    pub reg_class: Vec<RegClass>,
    pub spill_offset: Vec<i32>,
}

/// The mutable aggregate threaded through `Lowerer`, `OpcodeDispatch`,
/// `InstrLowering`, and `TerminatorLowering` for the duration of one function's
/// lowering (`spec.md` §3.6).
pub struct LoweringContext<'a> {
    pub target: &'a TargetDescriptor,
    pub frame: FrameBuilder,
    pub liveness: LivenessInfo,

    next_vreg: u16,

    /// IL temp id -> assigned virtual-register id.
    pub temp_vreg: FxHashMap<u32, u16>,
    /// IL temp id -> register class.
    pub temp_reg_class: FxHashMap<u32, RegClass>,
    /// Snapshot of `temp_vreg` at the end of lowering block `i`, indexed by
    /// block index; consulted by `TerminatorLowering` after all blocks'
    /// non-terminators have been lowered (`spec.md` §4.4).
    pub block_temp_vreg_snapshot: Vec<FxHashMap<u32, u16>>,

    /// Block label -> its parameters' vreg/class/spill plan.
    pub phi_plans: FxHashMap<String, PhiPlan>,

    /// IL temp ids known to be produced by an `Alloca`.
    pub alloca_temps: rustc_hash::FxHashSet<u32>,

    /// Every non-[`DispatchOutcome::Handled`] result `OpcodeDispatch` and
    /// `TerminatorLowering` reported while lowering this function. The driver
    /// consults this after lowering completes and, under `Flags::strict_unsupported_opcodes`,
    /// escalates the first one to a hard [`crate::error::CodegenError`].
    pub unhandled: Vec<DispatchOutcome>,
}

impl<'a> LoweringContext<'a> {
    pub fn new(target: &'a TargetDescriptor, frame: FrameBuilder, liveness: LivenessInfo) -> Self {
        LoweringContext {
            target,
            frame,
            liveness,
            next_vreg: 0,
            temp_vreg: FxHashMap::default(),
            temp_reg_class: FxHashMap::default(),
            block_temp_vreg_snapshot: Vec::new(),
            phi_plans: FxHashMap::default(),
            alloca_temps: rustc_hash::FxHashSet::default(),
            unhandled: Vec::new(),
        }
    }

    /// Record a non-`Handled` dispatch outcome so the driver can inspect it
    /// after lowering completes (`Flags::strict_unsupported_opcodes`). Callers
    /// log their own message at the point of detection, since they have more
    /// context (which opcode family, which block) than this aggregate does.
    pub fn record_outcome(&mut self, outcome: DispatchOutcome) {
        if outcome != DispatchOutcome::Handled {
            self.unhandled.push(outcome);
        }
    }

    /// Mint a fresh virtual register; no id is ever reused within a function
    /// (`spec.md` §3.2).
    pub fn fresh_vreg(&mut self, class: RegClass) -> MReg {
        let id = self.next_vreg;
        self.next_vreg = self.next_vreg.checked_add(1).expect("virtual register id overflow");
        MReg::virt(class, id)
    }

    pub fn bind_temp(&mut self, temp_id: u32, reg: MReg) {
        self.temp_vreg.insert(temp_id, reg.vreg_id());
        self.temp_reg_class.insert(temp_id, reg.class);
    }

    pub fn lookup_temp(&self, temp_id: u32) -> Option<MReg> {
        let id = *self.temp_vreg.get(&temp_id)?;
        let class = *self.temp_reg_class.get(&temp_id)?;
        Some(MReg::virt(class, id))
    }

    pub fn snapshot_block(&mut self, block_index: usize) {
        if self.block_temp_vreg_snapshot.len() <= block_index {
            self.block_temp_vreg_snapshot.resize_with(block_index + 1, FxHashMap::default);
        }
        self.block_temp_vreg_snapshot[block_index] = self.temp_vreg.clone();
    }

    pub fn lookup_temp_in_snapshot(&self, block_index: usize, temp_id: u32) -> Option<MReg> {
        let id = *self.block_temp_vreg_snapshot.get(block_index)?.get(&temp_id)?;
        let class = *self.temp_reg_class.get(&temp_id)?;
        Some(MReg::virt(class, id))
    }

    pub fn new_trap_label(&self, kind: &str) -> String {
        self::next_trap_label(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_vreg_ids_are_monotonic_and_unique() {
        let target = TargetDescriptor::darwin_arm64();
        let mut ctx = LoweringContext::new(&target, FrameBuilder::new(), LivenessInfo::default());
        let a = ctx.fresh_vreg(RegClass::Gpr);
        let b = ctx.fresh_vreg(RegClass::Gpr);
        assert_ne!(a.vreg_id(), b.vreg_id());
        assert!(b.vreg_id() > a.vreg_id());
    }

    #[test]
    fn trap_labels_are_unique_within_a_thread() {
        let a = next_trap_label("div0");
        let b = next_trap_label("div0");
        assert_ne!(a, b);
    }

    #[test]
    fn bind_and_lookup_round_trip() {
        let target = TargetDescriptor::darwin_arm64();
        let mut ctx = LoweringContext::new(&target, FrameBuilder::new(), LivenessInfo::default());
        let r = ctx.fresh_vreg(RegClass::Fpr);
        ctx.bind_temp(7, r);
        assert_eq!(ctx.lookup_temp(7), Some(r));
        assert_eq!(ctx.lookup_temp(8), None);
    }
}
