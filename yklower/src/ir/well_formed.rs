//! Basic well-formedness checks for unlowered IR. These are intended both to help debugging
//! incorrectly formed IR and to state what the lowerer can assume about its input.
//!
//! Specifically, after calling [Func::assert_well_formed] one can safely assume:
//!
//!   * The instruction list starts with `FunctionEntry`, ends with `FunctionExit`, and its
//!     `prev`/`next` links agree with each other.
//!   * There are no `PrologStart`/`PrologEnd` markers: only lowering inserts those.
//!   * Label instructions, and only label instructions, carry [super::LabelInfo]. Every loop and
//!     exception region a label names exists.
//!   * Every direct branch targets a label that is linked into the instruction list.
//!   * Every bailout index refers to an existing [super::BailOutInfo], whose live symbols exist.
//!   * Every symbol referenced by an operand exists.
//!   * `ArgIn` reads a parameter symbol, and argument-slot symbols are defined by `ArgOut`.

use super::{Func, InstrIdx, InstrKind, Opcode, Opnd, SymIdx, SymKind};

impl Func {
    fn malformed(&self, iidx: InstrIdx, msg: &str) -> ! {
        panic!(
            "Instruction at position {} {msg}\n  {}",
            usize::from(iidx),
            self.instr_to_string(iidx)
        );
    }

    fn check_sym(&self, iidx: InstrIdx, s: SymIdx) {
        if usize::from(s) >= self.syms.len() {
            self.malformed(iidx, &format!("references non-existent symbol s{}", usize::from(s)));
        }
    }

    pub fn assert_well_formed(&self) {
        if self.instrs[self.head].opcode != Opcode::FunctionEntry {
            panic!("Function does not start with FunctionEntry");
        }
        if self.instrs[self.tail].opcode != Opcode::FunctionExit {
            panic!("Function does not end with FunctionExit");
        }

        let mut prev = None;
        let mut cur = Some(self.head);
        let mut nlinked = 0;
        while let Some(iidx) = cur {
            let inst = &self.instrs[iidx];
            if !inst.linked || inst.prev != prev {
                self.malformed(iidx, "has inconsistent links");
            }
            nlinked += 1;
            prev = Some(iidx);
            cur = inst.next;
        }
        if prev != Some(self.tail) {
            panic!("Instruction list does not end at FunctionExit");
        }
        if self.instrs.iter().filter(|x| x.linked).count() != nlinked {
            panic!("Instructions are marked as linked but are not reachable from FunctionEntry");
        }

        for iidx in self.instr_idxs() {
            let inst = &self.instrs[iidx];
            match inst.opcode {
                Opcode::PrologStart | Opcode::PrologEnd => {
                    self.malformed(iidx, "is a prolog marker in unlowered code")
                }
                Opcode::Label if !inst.is_label() => self.malformed(iidx, "is a label without label info"),
                _ if inst.opcode != Opcode::Label && inst.is_label() => {
                    self.malformed(iidx, "has label info but is not a label")
                }
                _ => (),
            }

            match &inst.kind {
                InstrKind::Label(li) => {
                    if li.loop_.is_some_and(|l| usize::from(l) >= self.loops.len()) {
                        self.malformed(iidx, "heads a non-existent loop");
                    }
                    if li.region.is_some_and(|r| usize::from(r) >= self.regions.len()) {
                        self.malformed(iidx, "starts a non-existent region");
                    }
                }
                InstrKind::Branch(Some(t)) => {
                    if usize::from(*t) >= self.instrs.len() {
                        self.malformed(iidx, "branches to a non-existent instruction");
                    }
                    let target = &self.instrs[*t];
                    if !target.is_label() {
                        self.malformed(iidx, "branches to an instruction that is not a label");
                    }
                    if !target.linked {
                        self.malformed(iidx, "branches to an unlinked label");
                    }
                }
                InstrKind::Branch(None) => {
                    if inst.src1.is_none() {
                        self.malformed(iidx, "is an indirect branch with no address");
                    }
                }
                InstrKind::Plain | InstrKind::Pragma => {
                    if inst.opcode.is_branch() {
                        self.malformed(iidx, "is a branch with no target");
                    }
                }
            }

            if let Some(b) = inst.bailout {
                if usize::from(b) >= self.bailouts.len() {
                    self.malformed(iidx, "has a non-existent bailout");
                }
                for s in &self.bailouts[b].live_syms {
                    self.check_sym(iidx, *s);
                }
            }

            for x in inst.iter_opnds() {
                match x {
                    Opnd::Sym(s) => self.check_sym(iidx, s.sym),
                    Opnd::Label(l) if usize::from(l.label) >= self.instrs.len() => {
                        self.malformed(iidx, "takes the address of a non-existent label")
                    }
                    _ => (),
                }
                for r in x.iter_regs() {
                    if let Some(s) = r.sym {
                        self.check_sym(iidx, s);
                    }
                }
            }

            match inst.opcode {
                Opcode::ArgIn => match &inst.src1 {
                    Some(Opnd::Sym(s)) if matches!(self.syms[s.sym].kind, SymKind::Param(_)) => (),
                    _ => self.malformed(iidx, "does not read a parameter"),
                },
                Opcode::ArgOut => match &inst.dst {
                    Some(Opnd::Sym(s)) if matches!(self.syms[s.sym].kind, SymKind::ArgSlot(_)) => {
                        if self.syms[s.sym].def != Some(iidx) {
                            self.malformed(iidx, "defines an argument slot that names another definition");
                        }
                    }
                    _ => self.malformed(iidx, "does not define an argument slot"),
                },
                _ => (),
            }
        }

        for (sidx, s) in self.syms.iter_enumerated() {
            if let SymKind::ArgSlot(_) = s.kind {
                match s.def {
                    Some(d) if self.instrs[d].opcode == Opcode::ArgOut => (),
                    _ => panic!(
                        "Argument slot s{} is not defined by an ArgOut",
                        usize::from(sidx)
                    ),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        ir::{
            builder::FuncBuilder, Func, Instr, InstrKind, Opcode, Opnd, SymKind, SymOpnd, Ty,
        },
        target::Target,
    };

    #[test]
    fn empty() {
        Func::new(Target::X86, "f").assert_well_formed();
    }

    #[test]
    fn built() {
        let mut b = FuncBuilder::new(Target::SysVX64, "f");
        let x = b.param(0);
        let l = b.loop_header();
        b.place(l);
        let one = b.tagged(1);
        b.op(Opcode::Add, Some(x.clone()), &[x.clone(), one]);
        b.br(Opcode::BrLt, l, &x, &x);
        b.ret(Some(x));
        b.finish().assert_well_formed();
    }

    #[should_panic(expected = "Instruction at position 3 branches to an unlinked label")]
    #[test]
    fn branch_to_unlinked_label() {
        let mut f = Func::new(Target::X86, "f");
        let l = f.new_label(false);
        f.append(Instr::branch(Opcode::Br, l));
        f.assert_well_formed();
    }

    #[should_panic(expected = "Instruction at position 3 branches to an instruction that is not a label")]
    #[test]
    fn branch_to_non_label() {
        let mut f = Func::new(Target::X86, "f");
        let n = f.append(Instr::new(Opcode::Nop));
        f.append(Instr::branch(Opcode::Br, n));
        f.assert_well_formed();
    }

    #[should_panic(expected = "Instruction at position 2 is a prolog marker in unlowered code")]
    #[test]
    fn prolog_marker() {
        let mut f = Func::new(Target::Arm32, "f");
        f.append(Instr::pragma(Opcode::PrologStart));
        f.assert_well_formed();
    }

    #[should_panic(expected = "Instruction at position 2 references non-existent symbol s7")]
    #[test]
    fn missing_sym() {
        let mut f = Func::new(Target::WinX64, "f");
        let s = Opnd::Sym(SymOpnd::new(crate::ir::SymIdx::from_usize(7), Ty::Var));
        f.append(Instr::new(Opcode::Ld).with_src1(s));
        f.assert_well_formed();
    }

    #[should_panic(expected = "Instruction at position 2 does not read a parameter")]
    #[test]
    fn arg_in_from_var() {
        let mut f = Func::new(Target::SysVX64, "f");
        let s = f.new_sym(Ty::Var);
        let d = f.new_temp(Ty::Var);
        f.append(
            Instr::new(Opcode::ArgIn)
                .with_dst(Opnd::Reg(d))
                .with_src1(Opnd::Sym(SymOpnd::new(s, Ty::Var))),
        );
        f.assert_well_formed();
    }

    #[should_panic(expected = "Argument slot s0 is not defined by an ArgOut")]
    #[test]
    fn orphan_arg_slot() {
        let mut f = Func::new(Target::SysVX64, "f");
        f.new_sym_of_kind(Ty::Var, SymKind::ArgSlot(0));
        f.assert_well_formed();
    }

    #[should_panic(expected = "Instruction at position 2 is a branch with no target")]
    #[test]
    fn targetless_branch() {
        let mut f = Func::new(Target::X86, "f");
        let i = f.append(Instr::new(Opcode::Br));
        assert_eq!(f.instr(i).kind, InstrKind::Plain);
        f.assert_well_formed();
    }
}
