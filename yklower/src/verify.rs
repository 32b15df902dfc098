//! Structural verification of lowered code.
//!
//! This runs after the peephole pass whenever the crate is built with `yk_lower_verify`, and
//! always in tests. It checks what the register allocator and encoder rely on:
//!
//!   * Only machine-dependent opcodes remain, other than the function's entry and exit, labels and
//!     the prolog markers.
//!   * Every machine instruction is legal for the target (see [crate::legalize]).
//!   * Every direct branch targets a linked label.
//!   * There is exactly one `PrologStart`, followed (later) by exactly one `PrologEnd`.
//!   * Only branches carry a bailout.
//!   * Every symbol used as a memory operand has been given a stack slot.

use crate::{
    ir::{Func, InstrKind, Opcode, Opnd},
    legalize,
    target::{
        arm::Arm32,
        x64::{SysVX64, WinX64, X64},
        x86::X86,
        Target, TargetLowering,
    },
};

/// Verify the lowered function `f`.
pub fn verify(f: &Func) -> Result<(), String> {
    match f.target {
        Target::WinX64 => check(&X64::<WinX64>::new(), f),
        Target::SysVX64 => check(&X64::<SysVX64>::new(), f),
        Target::X86 => check(&X86, f),
        Target::Arm32 => check(&Arm32, f),
    }
}

pub(crate) fn check<T: TargetLowering + ?Sized>(md: &T, f: &Func) -> Result<(), String> {
    let mut prolog_start = None;
    let mut prolog_end = None;
    for (pos, iidx) in f.instr_idxs().into_iter().enumerate() {
        let inst = f.instr(iidx);
        let err = |msg: &str| Err(format!("{msg}: {}", f.instr_to_string(iidx)));
        match inst.opcode {
            Opcode::FunctionEntry | Opcode::FunctionExit | Opcode::Label => (),
            Opcode::PrologStart => {
                if prolog_start.replace(pos).is_some() {
                    return err("second PrologStart");
                }
            }
            Opcode::PrologEnd => {
                if prolog_start.is_none() {
                    return err("PrologEnd before PrologStart");
                }
                if prolog_end.replace(pos).is_some() {
                    return err("second PrologEnd");
                }
            }
            x if !x.is_md() => return err("unlowered instruction"),
            _ => (),
        }

        if let InstrKind::Branch(Some(t)) = inst.kind {
            let target = f.instr(t);
            if !target.is_label() || !target.is_linked() {
                return err("branch to something other than a linked label");
            }
        }
        if inst.bailout.is_some() && !matches!(inst.kind, InstrKind::Branch(_)) {
            return err("bailout on a non-branch");
        }
        for x in inst.iter_opnds() {
            if let Opnd::Sym(s) = x {
                if f.sym(s.sym).offset.is_none() {
                    return err("stack symbol without a slot");
                }
            }
        }
    }
    if prolog_start.is_none() || prolog_end.is_none() {
        return Err("missing prolog markers".to_owned());
    }
    legalize::check(md, f)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::LowerOpts,
        ir::{builder::FuncBuilder, Instr, Ty},
        lower::lower_func,
    };

    fn lowered(target: Target) -> Func {
        let mut b = FuncBuilder::new(target, "f");
        let x = b.param(0);
        let y = b.param(1);
        let r = b.var(Ty::Var);
        b.op(Opcode::Add, Some(r.clone()), &[x, y]);
        b.ret(Some(r));
        lower_func(b.finish(), &LowerOpts::default()).unwrap().func
    }

    #[test]
    fn lowered_code_verifies() {
        for target in [Target::WinX64, Target::SysVX64, Target::X86, Target::Arm32] {
            assert_eq!(verify(&lowered(target)), Ok(()));
        }
    }

    #[test]
    fn unlowered_code_rejected() {
        let mut f = lowered(Target::X86);
        let tail = f.tail();
        f.insert_instr_before(tail, Instr::new(Opcode::Add));
        assert!(verify(&f).unwrap_err().starts_with("unlowered instruction"));
    }

    #[test]
    fn duplicate_prolog_rejected() {
        let mut f = lowered(Target::SysVX64);
        let tail = f.tail();
        f.insert_instr_before(tail, Instr::pragma(Opcode::PrologStart));
        assert!(verify(&f).unwrap_err().starts_with("second PrologStart"));
    }

    #[test]
    fn illegal_form_rejected() {
        let mut f = lowered(Target::WinX64);
        let tail = f.tail();
        // x64 has no 64-bit immediate ADD.
        let t = f.new_temp(Ty::I64);
        f.insert_instr_before(
            tail,
            Instr::new(Opcode::ADD)
                .with_dst(Opnd::Reg(t.clone()))
                .with_src1(Opnd::Reg(t))
                .with_src2(Opnd::int(1 << 40, Ty::I64)),
        );
        assert!(verify(&f).is_err());
    }

    #[test]
    fn non_branch_bailout_rejected() {
        let mut f = lowered(Target::X86);
        let b = f.bailouts().count();
        assert_eq!(b, 0);
        let b = f.add_bailout(crate::ir::BailOutInfo::new(
            crate::ir::BailOutKind::EXPLICIT,
            0,
            vec![],
        ));
        let tail = f.tail();
        f.insert_instr_before(tail, Instr::new(Opcode::INT3).with_bailout(b));
        assert!(verify(&f).unwrap_err().starts_with("bailout on a non-branch"));
    }
}
