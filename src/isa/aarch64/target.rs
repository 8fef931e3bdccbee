//! AArch64 register and target descriptions (`spec.md` §3.1).

use std::fmt;

/// A concrete AArch64 physical register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysReg {
    X0, X1, X2, X3, X4, X5, X6, X7,
    X8, X9, X10, X11, X12, X13, X14, X15,
    X16, X17, X18, X19, X20, X21, X22, X23,
    X24, X25, X26, X27, X28,
    X29, // frame pointer
    X30, // link register
    Sp,
    V0, V1, V2, V3, V4, V5, V6, V7,
    V8, V9, V10, V11, V12, V13, V14, V15,
    V16, V17, V18, V19, V20, V21, V22, V23,
    V24, V25, V26, V27, V28, V29, V30, V31,
}

impl PhysReg {
    pub fn class(self) -> RegClass {
        if self.is_gpr() {
            RegClass::Gpr
        } else {
            RegClass::Fpr
        }
    }

    pub fn is_gpr(self) -> bool {
        use PhysReg::*;
        matches!(
            self,
            X0 | X1 | X2 | X3 | X4 | X5 | X6 | X7 | X8 | X9 | X10 | X11 | X12 | X13 | X14 | X15
                | X16 | X17 | X18 | X19 | X20 | X21 | X22 | X23 | X24 | X25 | X26 | X27 | X28
                | X29 | X30 | Sp
        )
    }

    pub fn is_fpr(self) -> bool {
        !self.is_gpr()
    }

    /// The assembly mnemonic for this register (`x0`, `v17`, `sp`, ...).
    pub fn name(self) -> &'static str {
        use PhysReg::*;
        match self {
            X0 => "x0", X1 => "x1", X2 => "x2", X3 => "x3", X4 => "x4", X5 => "x5",
            X6 => "x6", X7 => "x7", X8 => "x8", X9 => "x9", X10 => "x10", X11 => "x11",
            X12 => "x12", X13 => "x13", X14 => "x14", X15 => "x15", X16 => "x16", X17 => "x17",
            X18 => "x18", X19 => "x19", X20 => "x20", X21 => "x21", X22 => "x22", X23 => "x23",
            X24 => "x24", X25 => "x25", X26 => "x26", X27 => "x27", X28 => "x28", X29 => "x29",
            X30 => "x30", Sp => "sp",
            V0 => "v0", V1 => "v1", V2 => "v2", V3 => "v3", V4 => "v4", V5 => "v5", V6 => "v6",
            V7 => "v7", V8 => "v8", V9 => "v9", V10 => "v10", V11 => "v11", V12 => "v12",
            V13 => "v13", V14 => "v14", V15 => "v15", V16 => "v16", V17 => "v17", V18 => "v18",
            V19 => "v19", V20 => "v20", V21 => "v21", V22 => "v22", V23 => "v23", V24 => "v24",
            V25 => "v25", V26 => "v26", V27 => "v27", V28 => "v28", V29 => "v29", V30 => "v30",
            V31 => "v31",
        }
    }

    /// The FP-register view used for bit-cast/scalar FP ops (`d0`, `d17`, ...).
    pub fn fp_name(self) -> String {
        debug_assert!(self.is_fpr());
        format!("d{}", &self.name()[1..])
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// The register-class tag carried by every operand (`spec.md` §3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegClass {
    Gpr,
    Fpr,
}

/// The global scratch GPR: reserved for transient marshalling during lowering
/// and register allocation; never appears in the allocatable pool
/// (`spec.md` §3.1 invariant iv, confirmed by the reference implementation's
/// `isAllocatableGPR`, which excludes `x9`).
pub const GLOBAL_SCRATCH_GPR: PhysReg = PhysReg::X9;

/// The frame pointer (x29) and link register (x30).
pub const FP_REG: PhysReg = PhysReg::X29;
pub const LR_REG: PhysReg = PhysReg::X30;
pub const SP_REG: PhysReg = PhysReg::Sp;

/// A process-wide immutable description of one target flavour (`spec.md` §3.1).
#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    pub caller_saved_gpr: Vec<PhysReg>,
    pub callee_saved_gpr: Vec<PhysReg>,
    pub caller_saved_fpr: Vec<PhysReg>,
    pub callee_saved_fpr: Vec<PhysReg>,
    pub int_arg_order: [PhysReg; 8],
    pub f64_arg_order: [PhysReg; 8],
    pub int_return_reg: PhysReg,
    pub f64_return_reg: PhysReg,
    pub stack_alignment: u32,
}

impl TargetDescriptor {
    /// The Darwin/macOS arm64 target flavour (`spec.md` §3.1; register lists
    /// grounded on the reference implementation's `makeDarwinTarget`).
    pub fn darwin_arm64() -> Self {
        use PhysReg::*;
        let td = TargetDescriptor {
            caller_saved_gpr: vec![
                X0, X1, X2, X3, X4, X5, X6, X7, X8, X9, X10, X11, X12, X13, X14, X15, X16, X17,
            ],
            callee_saved_gpr: vec![X19, X20, X21, X22, X23, X24, X25, X26, X27, X28, X29],
            caller_saved_fpr: vec![
                V0, V1, V2, V3, V4, V5, V6, V7, V16, V17, V18, V19, V20, V21, V22, V23, V24, V25,
                V26, V27, V28, V29, V30, V31,
            ],
            callee_saved_fpr: vec![V8, V9, V10, V11, V12, V13, V14, V15],
            int_arg_order: [X0, X1, X2, X3, X4, X5, X6, X7],
            f64_arg_order: [V0, V1, V2, V3, V4, V5, V6, V7],
            int_return_reg: X0,
            f64_return_reg: V0,
            stack_alignment: 16,
        };
        td.check_invariants();
        td
    }

    fn check_invariants(&self) {
        debug_assert!(
            self.caller_saved_gpr.iter().all(|r| !self.callee_saved_gpr.contains(r)),
            "caller-saved and callee-saved GPR sets must be disjoint"
        );
        debug_assert!(
            self.caller_saved_fpr.iter().all(|r| !self.callee_saved_fpr.contains(r)),
            "caller-saved and callee-saved FPR sets must be disjoint"
        );
        for v8_15 in [PhysReg::V8, PhysReg::V9, PhysReg::V10, PhysReg::V11, PhysReg::V12,
            PhysReg::V13, PhysReg::V14, PhysReg::V15]
        {
            debug_assert!(self.callee_saved_fpr.contains(&v8_15));
        }
        debug_assert!(self.int_arg_order.iter().all(|r| self.caller_saved_gpr.contains(r)));
        debug_assert!(self.f64_arg_order.iter().all(|r| self.caller_saved_fpr.contains(r)));
    }

    pub fn is_arg_register(&self, r: PhysReg) -> bool {
        self.int_arg_order.contains(&r) || self.f64_arg_order.contains(&r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_caller_callee_gpr() {
        let td = TargetDescriptor::darwin_arm64();
        for r in &td.caller_saved_gpr {
            assert!(!td.callee_saved_gpr.contains(r));
        }
    }

    #[test]
    fn v8_15_only_in_callee_saved_fpr() {
        let td = TargetDescriptor::darwin_arm64();
        for v in &td.caller_saved_fpr {
            let n: u8 = v.name()[1..].parse().unwrap();
            if (8..=15).contains(&n) {
                panic!("v{n} must not be in caller-saved FPR list");
            }
        }
    }

    #[test]
    fn arg_registers_are_prefix_of_caller_saved() {
        let td = TargetDescriptor::darwin_arm64();
        for (i, r) in td.int_arg_order.iter().enumerate() {
            assert_eq!(td.caller_saved_gpr[i], *r);
        }
    }

    #[test]
    fn scratch_register_excluded_from_arg_orders() {
        let td = TargetDescriptor::darwin_arm64();
        assert!(!td.is_arg_register(GLOBAL_SCRATCH_GPR));
    }
}
