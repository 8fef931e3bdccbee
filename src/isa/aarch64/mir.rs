//! Machine IR: the target-specific instruction set this backend lowers IL into
//! (`spec.md` §3.3).

use super::target::{PhysReg, RegClass};
use smallvec::SmallVec;
use std::fmt;

/// A register operand: either a concrete physical register, or a virtual
/// register minted during lowering (`spec.md` §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MReg {
    pub is_phys: bool,
    pub class: RegClass,
    /// A `PhysReg` encoding when `is_phys`, otherwise a per-function virtual id.
    pub id_or_phys: u16,
}

impl MReg {
    pub fn phys(r: PhysReg) -> Self {
        MReg { is_phys: true, class: r.class(), id_or_phys: phys_to_u16(r) }
    }

    pub fn virt(class: RegClass, id: u16) -> Self {
        MReg { is_phys: false, class, id_or_phys: id }
    }

    pub fn as_phys(self) -> PhysReg {
        debug_assert!(self.is_phys);
        u16_to_phys(self.id_or_phys)
    }

    pub fn vreg_id(self) -> u16 {
        debug_assert!(!self.is_phys);
        self.id_or_phys
    }

    pub fn as_phys_opt(self) -> Option<PhysReg> {
        self.is_phys.then(|| self.as_phys())
    }
}

impl fmt::Display for MReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_phys {
            write!(f, "{}", self.as_phys())
        } else {
            let prefix = if self.class == RegClass::Gpr { "v" } else { "fv" };
            write!(f, "%{prefix}{}", self.id_or_phys)
        }
    }
}

/// Encode a `PhysReg` into the 16-bit id space used by `MReg`, so physical and
/// virtual registers share one representation (`spec.md` §3.2).
fn phys_to_u16(r: PhysReg) -> u16 {
    all_phys_regs().iter().position(|p| *p == r).expect("exhaustive PhysReg table") as u16
}

fn u16_to_phys(id: u16) -> PhysReg {
    all_phys_regs()[id as usize]
}

fn all_phys_regs() -> &'static [PhysReg] {
    use PhysReg::*;
    &[
        X0, X1, X2, X3, X4, X5, X6, X7, X8, X9, X10, X11, X12, X13, X14, X15, X16, X17, X18, X19,
        X20, X21, X22, X23, X24, X25, X26, X27, X28, X29, X30, Sp, V0, V1, V2, V3, V4, V5, V6, V7,
        V8, V9, V10, V11, V12, V13, V14, V15, V16, V17, V18, V19, V20, V21, V22, V23, V24, V25,
        V26, V27, V28, V29, V30, V31,
    ]
}

/// One machine operand (`spec.md` §3.3).
#[derive(Debug, Clone, PartialEq)]
pub enum MOperand {
    Reg(MReg),
    Imm(i64),
    Cond(&'static str),
    Label(String),
}

impl MOperand {
    pub fn reg(r: MReg) -> Self {
        MOperand::Reg(r)
    }

    pub fn as_reg(&self) -> MReg {
        match self {
            MOperand::Reg(r) => *r,
            other => panic!("expected register operand, found {other:?}"),
        }
    }

    pub fn as_reg_mut(&mut self) -> &mut MReg {
        match self {
            MOperand::Reg(r) => r,
            other => panic!("expected register operand, found {other:?}"),
        }
    }

    pub fn as_imm(&self) -> i64 {
        match self {
            MOperand::Imm(v) => *v,
            other => panic!("expected immediate operand, found {other:?}"),
        }
    }

    pub fn as_cond(&self) -> &'static str {
        match self {
            MOperand::Cond(c) => c,
            other => panic!("expected condition-code operand, found {other:?}"),
        }
    }

    pub fn as_label(&self) -> &str {
        match self {
            MOperand::Label(l) => l,
            other => panic!("expected label operand, found {other:?}"),
        }
    }
}

/// The MIR opcode tag set (`spec.md` §3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MOpcode {
    // Integer data movement.
    MovRR,
    MovRI,

    // Integer ALU register-register.
    AddRRR,
    SubRRR,
    MulRRR,
    SDivRRR,
    UDivRRR,
    AndRRR,
    OrrRRR,
    EorRRR,
    /// dst = op3 - op1*op2 (four-operand remainder helper).
    MSubRRRR,

    // Integer ALU register-immediate.
    AddRI,
    SubRI,
    LslRI,
    LsrRI,
    AsrRI,
    /// Register-amount shift forms, used when the shift count isn't a
    /// compile-time constant (`spec.md` §4.3 "otherwise RRR"). Not part of the
    /// spec's literal opcode tag list, which enumerates only the immediate
    /// forms; added so the encoding actually matches the shift amount's operand
    /// kind instead of reusing the `RI` tag with a register in the immediate
    /// slot.
    LslRRR,
    LsrRRR,
    AsrRRR,

    // Compare / condition.
    CmpRR,
    CmpRI,
    TstRR,
    Cset,
    Cbz,

    // Floating point.
    FMovRR,
    FMovRI,
    /// Bit-cast GPR -> FPR.
    FMovGR,
    FAddRRR,
    FSubRRR,
    FMulRRR,
    FDivRRR,
    FCmpRR,
    /// Round to nearest-even.
    FRintN,

    // Conversions.
    SCvtF,
    UCvtF,
    FCvtZS,
    FCvtZU,

    // Memory.
    LdrRegFpImm,
    StrRegFpImm,
    LdrRegBaseImm,
    StrRegBaseImm,
    LdrFprFpImm,
    StrFprFpImm,
    LdrFprBaseImm,
    StrFprBaseImm,
    StrRegSpImm,
    StrFprSpImm,
    AddFpImm,

    // Control.
    Br,
    BCond,
    Bl,
    Blr,
    Ret,

    // Stack.
    SubSpImm,
    AddSpImm,

    // Address materialisation.
    AdrPage,
    AddPageOff,
}

/// One machine instruction: an opcode and a small operand vector
/// (`spec.md` §3.3).
#[derive(Debug, Clone)]
pub struct MInstr {
    pub opcode: MOpcode,
    pub operands: SmallVec<[MOperand; 4]>,
}

impl MInstr {
    pub fn new(opcode: MOpcode, operands: impl Into<SmallVec<[MOperand; 4]>>) -> Self {
        MInstr { opcode, operands: operands.into() }
    }

    pub fn reg_operands_mut(&mut self) -> impl Iterator<Item = &mut MReg> {
        self.operands.iter_mut().filter_map(|op| match op {
            MOperand::Reg(r) => Some(r),
            _ => None,
        })
    }

    pub fn reg_operands(&self) -> impl Iterator<Item = MReg> + '_ {
        self.operands.iter().filter_map(|op| match op {
            MOperand::Reg(r) => Some(*r),
            _ => None,
        })
    }

    /// Does this opcode read or write memory, transfer control, or otherwise
    /// have an effect the peephole DCE pass must never remove transparently?
    pub fn is_side_effecting(&self) -> bool {
        use MOpcode::*;
        matches!(
            self.opcode,
            StrRegFpImm
                | StrRegBaseImm
                | StrFprFpImm
                | StrFprBaseImm
                | StrRegSpImm
                | StrFprSpImm
                | LdrRegFpImm
                | LdrRegBaseImm
                | LdrFprFpImm
                | LdrFprBaseImm
                | Br
                | BCond
                | Bl
                | Blr
                | Ret
                | Cbz
                | CmpRR
                | CmpRI
                | TstRR
                | SubSpImm
                | AddSpImm
                | AdrPage
                | AddPageOff
        )
    }
}

/// A basic block: a label and an ordered instruction list (`spec.md` §3.3).
#[derive(Debug, Clone)]
pub struct MBasicBlock {
    pub name: String,
    pub instrs: Vec<MInstr>,
}

impl MBasicBlock {
    pub fn new(name: impl Into<String>) -> Self {
        MBasicBlock { name: name.into(), instrs: Vec::new() }
    }

    pub fn push(&mut self, instr: MInstr) {
        self.instrs.push(instr);
    }
}

/// A stack local (alloca) slot (`spec.md` §3.4).
#[derive(Debug, Clone, Copy)]
pub struct StackLocal {
    pub temp_id: u32,
    pub size: i32,
    pub align: i32,
    pub offset: i32,
}

/// A spill slot, keyed by vreg id (or by a cross-block IL temp id offset into a
/// reserved high range; see `spec.md` §3.4) (`spec.md` §3.4).
#[derive(Debug, Clone, Copy)]
pub struct SpillSlot {
    pub key: u32,
    pub size: i32,
    pub align: i32,
    pub offset: i32,
}

/// The finalised frame layout (`spec.md` §3.4, §4.1).
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    pub locals: Vec<StackLocal>,
    pub spills: Vec<SpillSlot>,
    pub total_bytes: i32,
    pub max_outgoing_bytes: i32,
}

impl FrameLayout {
    pub fn local_offset(&self, temp_id: u32) -> i32 {
        self.locals.iter().find(|l| l.temp_id == temp_id).map(|l| l.offset).unwrap_or(0)
    }

    pub fn spill_offset(&self, key: u32) -> Option<i32> {
        self.spills.iter().find(|s| s.key == key).map(|s| s.offset)
    }
}

/// A full machine function: its blocks, the finalised frame layout, and the
/// callee-saved registers the allocator actually used (`spec.md` §3.3, §3.4).
#[derive(Debug, Clone)]
pub struct MFunction {
    pub name: String,
    pub blocks: Vec<MBasicBlock>,
    pub frame: FrameLayout,
    pub saved_gprs: Vec<PhysReg>,
    pub saved_fprs: Vec<PhysReg>,
}

impl MFunction {
    pub fn new(name: impl Into<String>) -> Self {
        MFunction {
            name: name.into(),
            blocks: Vec::new(),
            frame: FrameLayout::default(),
            saved_gprs: Vec::new(),
            saved_fprs: Vec::new(),
        }
    }

    pub fn block_mut(&mut self, idx: usize) -> &mut MBasicBlock {
        &mut self.blocks[idx]
    }

    pub fn block_index(&self, name: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.name == name)
    }

    /// True only once every register operand in every instruction is physical
    /// (`spec.md` §8 "Allocation completeness").
    pub fn is_fully_allocated(&self) -> bool {
        self.blocks
            .iter()
            .flat_map(|b| b.instrs.iter())
            .flat_map(|i| i.reg_operands())
            .all(|r| r.is_phys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phys_round_trips_through_mreg() {
        for &r in all_phys_regs() {
            let m = MReg::phys(r);
            assert_eq!(m.as_phys(), r);
        }
    }

    #[test]
    fn empty_function_is_trivially_allocated() {
        let f = MFunction::new("f");
        assert!(f.is_fully_allocated());
    }
}
