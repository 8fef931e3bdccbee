//! Assembly text emission (`spec.md` §4.9).
//!
//! Runs over fully-allocated, peephole-cleaned MIR and produces AAPCS64
//! (Darwin) assembly text. One `AsmEmitter` per function; stateless beyond the
//! output buffer. The epilogue has no dedicated exit block — it is re-emitted
//! inline at every `Ret`, mirroring the reference emitter's per-exit-point
//! prologue mirror.

use super::mir::{MFunction, MInstr, MOpcode, MOperand};
use super::target::PhysReg;
use std::fmt::Write as _;

pub struct AsmEmitter {
    out: String,
}

impl AsmEmitter {
    pub fn new() -> Self {
        AsmEmitter { out: String::new() }
    }

    pub fn emit_function(mut self, func: &MFunction) -> String {
        self.header(&func.name);
        self.prologue(func);
        for block in &func.blocks {
            self.label(&block.name);
            for instr in &block.instrs {
                if instr.opcode == MOpcode::Ret {
                    self.epilogue(func);
                } else {
                    self.instr(instr);
                }
            }
        }
        self.out
    }

    fn header(&mut self, name: &str) {
        writeln!(self.out, "\t.text").unwrap();
        writeln!(self.out, "\t.align 2").unwrap();
        writeln!(self.out, "\t.globl _{name}").unwrap();
        writeln!(self.out, "_{name}:").unwrap();
    }

    fn label(&mut self, name: &str) {
        writeln!(self.out, "{name}:").unwrap();
    }

    /// `stp x29, x30, [sp, #-16]!` then pair up callee-saved register saves,
    /// with a trailing `str` if the count is odd (`spec.md` §4.9).
    fn prologue(&mut self, func: &MFunction) {
        writeln!(self.out, "\tstp x29, x30, [sp, #-16]!").unwrap();
        writeln!(self.out, "\tmov x29, sp").unwrap();
        emit_paired_saves(&mut self.out, &func.saved_gprs, false);
        emit_paired_saves(&mut self.out, &func.saved_fprs, true);
    }

    /// Mirror of the prologue in reverse order, followed by `ret`
    /// (`spec.md` §4.9).
    fn epilogue(&mut self, func: &MFunction) {
        emit_paired_restores(&mut self.out, &func.saved_fprs, true);
        emit_paired_restores(&mut self.out, &func.saved_gprs, false);
        writeln!(self.out, "\tldp x29, x30, [sp], #16").unwrap();
        writeln!(self.out, "\tret").unwrap();
    }

    fn instr(&mut self, instr: &MInstr) {
        use MOpcode::*;
        match instr.opcode {
            MovRR => self.rr("mov", instr),
            MovRI => self.mov_ri(instr),
            AddRRR => self.rrr("add", instr),
            SubRRR => self.rrr("sub", instr),
            MulRRR => self.rrr("mul", instr),
            SDivRRR => self.rrr("sdiv", instr),
            UDivRRR => self.rrr("udiv", instr),
            AndRRR => self.rrr("and", instr),
            OrrRRR => self.rrr("orr", instr),
            EorRRR => self.rrr("eor", instr),
            MSubRRRR => self.rrrr("msub", instr),
            AddRI => self.rri("add", instr),
            SubRI => self.rri("sub", instr),
            LslRI => self.rri("lsl", instr),
            LsrRI => self.rri("lsr", instr),
            AsrRI => self.rri("asr", instr),
            LslRRR => self.rrr("lsl", instr),
            LsrRRR => self.rrr("lsr", instr),
            AsrRRR => self.rrr("asr", instr),
            CmpRR => self.cmp_rr(instr),
            CmpRI => self.cmp_ri(instr),
            TstRR => self.tst_rr(instr),
            Cset => self.cset(instr),
            Cbz => self.cbz(instr),
            FMovRR => self.frr("fmov", instr),
            FMovRI => self.fmov_ri(instr),
            FMovGR => self.fmov_gr(instr),
            FAddRRR => self.frrr("fadd", instr),
            FSubRRR => self.frrr("fsub", instr),
            FMulRRR => self.frrr("fmul", instr),
            FDivRRR => self.frrr("fdiv", instr),
            FCmpRR => self.fcmp(instr),
            FRintN => self.frr("frintn", instr),
            SCvtF => self.cvt("scvtf", instr, true),
            UCvtF => self.cvt("ucvtf", instr, true),
            FCvtZS => self.cvt("fcvtzs", instr, false),
            FCvtZU => self.cvt("fcvtzu", instr, false),
            LdrRegFpImm => self.ldst_fp_imm("ldr", instr, false),
            StrRegFpImm => self.ldst_fp_imm("str", instr, false),
            LdrFprFpImm => self.ldst_fp_imm("ldr", instr, true),
            StrFprFpImm => self.ldst_fp_imm("str", instr, true),
            LdrRegBaseImm => self.ldst_base_imm("ldr", instr, false),
            StrRegBaseImm => self.ldst_base_imm("str", instr, false),
            LdrFprBaseImm => self.ldst_base_imm("ldr", instr, true),
            StrFprBaseImm => self.ldst_base_imm("str", instr, true),
            StrRegSpImm => self.ldst_sp_imm("str", instr, false),
            StrFprSpImm => self.ldst_sp_imm("str", instr, true),
            AddFpImm => self.add_fp_imm(instr),
            Br => self.branch(instr),
            BCond => self.bcond(instr),
            Bl => self.call_label(instr),
            Blr => self.call_reg(instr),
            SubSpImm => self.sp_imm("sub", instr),
            AddSpImm => self.sp_imm("add", instr),
            AdrPage => self.adr_page(instr),
            AddPageOff => self.add_page_off(instr),
            Ret => {}
        }
    }

    fn reg_name(&self, op: &MOperand, is_fp_view: bool) -> String {
        let r = op.as_reg().as_phys();
        if is_fp_view { r.fp_name() } else { r.name().to_string() }
    }

    fn rr(&mut self, mnem: &str, instr: &MInstr) {
        writeln!(
            self.out,
            "\t{mnem} {}, {}",
            self.reg_name(&instr.operands[0], false),
            self.reg_name(&instr.operands[1], false)
        )
        .unwrap();
    }

    fn frr(&mut self, mnem: &str, instr: &MInstr) {
        writeln!(
            self.out,
            "\t{mnem} {}, {}",
            self.reg_name(&instr.operands[0], true),
            self.reg_name(&instr.operands[1], true)
        )
        .unwrap();
    }

    fn rrr(&mut self, mnem: &str, instr: &MInstr) {
        writeln!(
            self.out,
            "\t{mnem} {}, {}, {}",
            self.reg_name(&instr.operands[0], false),
            self.reg_name(&instr.operands[1], false),
            self.reg_name(&instr.operands[2], false)
        )
        .unwrap();
    }

    fn frrr(&mut self, mnem: &str, instr: &MInstr) {
        writeln!(
            self.out,
            "\t{mnem} {}, {}, {}",
            self.reg_name(&instr.operands[0], true),
            self.reg_name(&instr.operands[1], true),
            self.reg_name(&instr.operands[2], true)
        )
        .unwrap();
    }

    /// `msub dst, a, b, c` computes `dst = c - a*b` (the remainder helper).
    fn rrrr(&mut self, mnem: &str, instr: &MInstr) {
        writeln!(
            self.out,
            "\t{mnem} {}, {}, {}, {}",
            self.reg_name(&instr.operands[0], false),
            self.reg_name(&instr.operands[1], false),
            self.reg_name(&instr.operands[2], false),
            self.reg_name(&instr.operands[3], false)
        )
        .unwrap();
    }

    fn rri(&mut self, mnem: &str, instr: &MInstr) {
        writeln!(
            self.out,
            "\t{mnem} {}, {}, #{}",
            self.reg_name(&instr.operands[0], false),
            self.reg_name(&instr.operands[1], false),
            instr.operands[2].as_imm()
        )
        .unwrap();
    }

    fn cmp_rr(&mut self, instr: &MInstr) {
        writeln!(
            self.out,
            "\tcmp {}, {}",
            self.reg_name(&instr.operands[0], false),
            self.reg_name(&instr.operands[1], false)
        )
        .unwrap();
    }

    fn cmp_ri(&mut self, instr: &MInstr) {
        writeln!(self.out, "\tcmp {}, #{}", self.reg_name(&instr.operands[0], false), instr.operands[1].as_imm())
            .unwrap();
    }

    fn tst_rr(&mut self, instr: &MInstr) {
        writeln!(
            self.out,
            "\ttst {}, {}",
            self.reg_name(&instr.operands[0], false),
            self.reg_name(&instr.operands[1], false)
        )
        .unwrap();
    }

    fn cset(&mut self, instr: &MInstr) {
        writeln!(
            self.out,
            "\tcset {}, {}",
            self.reg_name(&instr.operands[0], false),
            instr.operands[1].as_cond()
        )
        .unwrap();
    }

    fn cbz(&mut self, instr: &MInstr) {
        writeln!(
            self.out,
            "\tcbz {}, {}",
            self.reg_name(&instr.operands[0], false),
            instr.operands[1].as_label()
        )
        .unwrap();
    }

    fn fcmp(&mut self, instr: &MInstr) {
        writeln!(
            self.out,
            "\tfcmp {}, {}",
            self.reg_name(&instr.operands[0], true),
            self.reg_name(&instr.operands[1], true)
        )
        .unwrap();
    }

    fn cvt(&mut self, mnem: &str, instr: &MInstr, dst_is_fp: bool) {
        writeln!(
            self.out,
            "\t{mnem} {}, {}",
            self.reg_name(&instr.operands[0], dst_is_fp),
            self.reg_name(&instr.operands[1], !dst_is_fp)
        )
        .unwrap();
    }

    fn fmov_gr(&mut self, instr: &MInstr) {
        writeln!(
            self.out,
            "\tfmov {}, {}",
            self.reg_name(&instr.operands[0], true),
            self.reg_name(&instr.operands[1], false)
        )
        .unwrap();
    }

    /// `mov` for the `[0, 65535]` range; otherwise `movz` plus up to three
    /// `movk` chunks covering bits 16/32/48 (`spec.md` §4.9).
    fn mov_ri(&mut self, instr: &MInstr) {
        let dst = self.reg_name(&instr.operands[0], false);
        let imm = instr.operands[1].as_imm();
        if (0..=0xFFFF).contains(&imm) {
            writeln!(self.out, "\tmov {dst}, #{imm}").unwrap();
            return;
        }
        let bits = imm as u64;
        let chunks = [bits & 0xFFFF, (bits >> 16) & 0xFFFF, (bits >> 32) & 0xFFFF, (bits >> 48) & 0xFFFF];
        writeln!(self.out, "\tmovz {dst}, #{:#x}, lsl #0", chunks[0]).unwrap();
        for (i, chunk) in chunks.iter().enumerate().skip(1) {
            if *chunk != 0 {
                writeln!(self.out, "\tmovk {dst}, #{:#x}, lsl #{}", chunk, i * 16).unwrap();
            }
        }
    }

    fn fmov_ri(&mut self, instr: &MInstr) {
        let dst = self.reg_name(&instr.operands[0], true);
        writeln!(self.out, "\tfmov {dst}, #{}", instr.operands[1].as_imm()).unwrap();
    }

    fn ldst_fp_imm(&mut self, mnem: &str, instr: &MInstr, fp: bool) {
        let reg = self.reg_name(&instr.operands[0], fp);
        let offset = instr.operands[1].as_imm();
        writeln!(self.out, "\t{mnem} {reg}, [x29, #{offset}]").unwrap();
    }

    fn ldst_base_imm(&mut self, mnem: &str, instr: &MInstr, fp: bool) {
        let reg = self.reg_name(&instr.operands[0], fp);
        let base = self.reg_name(&instr.operands[1], false);
        let offset = instr.operands[2].as_imm();
        writeln!(self.out, "\t{mnem} {reg}, [{base}, #{offset}]").unwrap();
    }

    fn ldst_sp_imm(&mut self, mnem: &str, instr: &MInstr, fp: bool) {
        let reg = self.reg_name(&instr.operands[0], fp);
        let offset = instr.operands[1].as_imm();
        writeln!(self.out, "\t{mnem} {reg}, [sp, #{offset}]").unwrap();
    }

    /// `AddFpImm` materialises an address, not a memory access; AArch64 `add`
    /// only takes unsigned immediates, so a negative offset (the common case —
    /// locals sit below the frame pointer) is emitted as `sub` of the
    /// magnitude instead.
    fn add_fp_imm(&mut self, instr: &MInstr) {
        let dst = self.reg_name(&instr.operands[0], false);
        let offset = instr.operands[1].as_imm();
        if offset >= 0 {
            writeln!(self.out, "\tadd {dst}, x29, #{offset}").unwrap();
        } else {
            writeln!(self.out, "\tsub {dst}, x29, #{}", -offset).unwrap();
        }
    }

    fn branch(&mut self, instr: &MInstr) {
        writeln!(self.out, "\tb {}", instr.operands[0].as_label()).unwrap();
    }

    fn bcond(&mut self, instr: &MInstr) {
        writeln!(self.out, "\tb.{} {}", instr.operands[0].as_cond(), instr.operands[1].as_label()).unwrap();
    }

    fn call_label(&mut self, instr: &MInstr) {
        let label = instr.operands[0].as_label();
        writeln!(self.out, "\tbl _{label}").unwrap();
    }

    fn call_reg(&mut self, instr: &MInstr) {
        writeln!(self.out, "\tblr {}", self.reg_name(&instr.operands[0], false)).unwrap();
    }

    fn sp_imm(&mut self, mnem: &str, instr: &MInstr) {
        writeln!(self.out, "\t{mnem} sp, sp, #{}", instr.operands[0].as_imm()).unwrap();
    }

    fn adr_page(&mut self, instr: &MInstr) {
        writeln!(
            self.out,
            "\tadrp {}, {}@PAGE",
            self.reg_name(&instr.operands[0], false),
            instr.operands[1].as_label()
        )
        .unwrap();
    }

    fn add_page_off(&mut self, instr: &MInstr) {
        writeln!(
            self.out,
            "\tadd {}, {}, {}@PAGEOFF",
            self.reg_name(&instr.operands[0], false),
            self.reg_name(&instr.operands[1], false),
            instr.operands[2].as_label()
        )
        .unwrap();
    }
}

impl Default for AsmEmitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit `stp`/`str` saves for a callee-saved register list, pairing up
/// consecutive registers and leaving an odd tail as a single `str`
/// (`spec.md` §4.9).
fn emit_paired_saves(out: &mut String, regs: &[PhysReg], fp: bool) {
    let names: Vec<String> = regs.iter().map(|r| if fp { r.fp_name() } else { r.name().to_string() }).collect();
    let mut i = 0;
    while i + 1 < names.len() {
        writeln!(out, "\tstp {}, {}, [sp, #-16]!", names[i], names[i + 1]).unwrap();
        i += 2;
    }
    if i < names.len() {
        writeln!(out, "\tstr {}, [sp, #-16]!", names[i]).unwrap();
    }
}

/// Mirror of [`emit_paired_saves`] in reverse order.
fn emit_paired_restores(out: &mut String, regs: &[PhysReg], fp: bool) {
    let names: Vec<String> = regs.iter().map(|r| if fp { r.fp_name() } else { r.name().to_string() }).collect();
    let mut rest = names;
    if rest.len() % 2 == 1 {
        let last = rest.pop().unwrap();
        writeln!(out, "\tldr {last}, [sp], #16").unwrap();
    }
    for pair in rest.chunks(2).rev() {
        if let [a, b] = pair {
            writeln!(out, "\tldp {a}, {b}, [sp], #16").unwrap();
        }
    }
}

/// Emit one function's full assembly text, including the per-`Ret` epilogue.
pub fn emit(func: &MFunction) -> String {
    AsmEmitter::new().emit_function(func)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::aarch64::mir::{MBasicBlock, MFunction, MReg};

    #[test]
    fn small_constant_uses_mov() {
        let mut func = MFunction::new("f");
        let mut b = MBasicBlock::new("entry");
        b.push(MInstr::new(MOpcode::MovRI, [MOperand::Reg(MReg::phys(PhysReg::X0)), MOperand::Imm(5)]));
        b.push(MInstr::new(MOpcode::Ret, []));
        func.blocks.push(b);
        let text = emit(&func);
        assert!(text.contains("mov x0, #5"));
        assert!(!text.contains("movz"));
    }

    #[test]
    fn wide_constant_uses_movz_movk_chain() {
        let mut func = MFunction::new("f");
        let mut b = MBasicBlock::new("entry");
        b.push(MInstr::new(
            MOpcode::MovRI,
            [MOperand::Reg(MReg::phys(PhysReg::X0)), MOperand::Imm(0x1122334455667788u64 as i64)],
        ));
        b.push(MInstr::new(MOpcode::Ret, []));
        func.blocks.push(b);
        let text = emit(&func);
        assert!(text.contains("movz x0, #"));
        assert_eq!(text.matches("movk x0,").count(), 3);
    }

    #[test]
    fn prologue_saves_callee_used_registers_in_pairs() {
        let mut func = MFunction::new("f");
        func.saved_gprs = vec![PhysReg::X19, PhysReg::X20, PhysReg::X21];
        func.blocks.push(MBasicBlock::new("entry"));
        let text = emit(&func);
        assert!(text.contains("stp x19, x20, [sp, #-16]!"));
        assert!(text.contains("str x21, [sp, #-16]!"));
    }

    #[test]
    fn function_header_uses_underscore_prefixed_global() {
        let mut func = MFunction::new("add_two");
        func.blocks.push(MBasicBlock::new("entry"));
        let text = emit(&func);
        assert!(text.contains(".globl _add_two"));
        assert!(text.contains("_add_two:"));
    }
}
