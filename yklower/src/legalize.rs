//! Legalization: make every machine instruction's operands encodable.
//!
//! The lowerer emits machine instructions without regard for what the encoder accepts (e.g. an
//! `ADD` of two memory operands, or a 64-bit immediate where only 32 bits fit). This pass walks the
//! instruction list and, consulting the target's legal-forms table, hoists offending operands into
//! fresh temporaries. Moves inserted by this pass are legalized in turn, so afterwards every
//! linked machine instruction is legal: [check_instr] holds for all of them.

use crate::{
    ir::{Func, InstrIdx, InstrKind, Opnd, OpndKind, OpndT},
    target::{temp, OpForms, Slot, TargetLowering},
};
use std::fmt;

/// Why an instruction is not legal.
#[derive(Debug, PartialEq)]
pub(crate) enum Illegal {
    /// The target has no such opcode.
    NoForms,
    /// The operand in `slot` has a form the opcode does not accept.
    Slot(Slot, OpndKind),
    /// The two-address opcode's destination and first source differ.
    TwoAddress,
    /// More than one operand is in memory.
    TwoMem,
}

impl fmt::Display for Illegal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Illegal::NoForms => write!(f, "opcode not available"),
            Illegal::Slot(s, k) => write!(f, "{s:?} cannot be {k:?}"),
            Illegal::TwoAddress => write!(f, "destination and first source differ"),
            Illegal::TwoMem => write!(f, "more than one memory operand"),
        }
    }
}

/// Is the linked machine instruction `iidx` legal?
pub(crate) fn check_instr<T: TargetLowering + ?Sized>(
    md: &T,
    f: &Func,
    iidx: InstrIdx,
) -> Result<(), Illegal> {
    let inst = f.instr(iidx);
    let forms = md.legal_forms(inst.opcode).ok_or(Illegal::NoForms)?;
    let ps = md.ptr_size();
    for (slot, x) in slots(&inst.dst, &inst.src1, &inst.src2) {
        let k = x.kind(ps);
        if !forms.slot(slot).contains_kind(k) {
            return Err(Illegal::Slot(slot, k));
        }
    }
    if forms.two_address {
        if let (Some(d), Some(s)) = (&inst.dst, &inst.src1) {
            if !d.same_location(s) {
                return Err(Illegal::TwoAddress);
            }
        }
    }
    if forms.one_mem && mem_count(&forms, &inst.dst, &inst.src1, &inst.src2) > 1 {
        return Err(Illegal::TwoMem);
    }
    Ok(())
}

/// Check that every linked machine instruction of `f` is legal.
pub(crate) fn check<T: TargetLowering + ?Sized>(md: &T, f: &Func) -> Result<(), String> {
    for iidx in f.instr_idxs() {
        let inst = f.instr(iidx);
        if !inst.opcode.is_md() {
            continue;
        }
        if let Err(e) = check_instr(md, f, iidx) {
            return Err(format!("{}: {e}", f.instr_to_string(iidx)));
        }
    }
    Ok(())
}

/// Legalize every linked machine instruction of `f`.
///
/// # Panics
///
/// If an instruction uses an opcode the target does not have: the lowerer must never emit one.
pub(crate) fn legalize<T: TargetLowering + ?Sized>(md: &T, f: &mut Func) {
    for iidx in f.instr_idxs() {
        let inst = f.instr(iidx);
        if !inst.is_linked()
            || !inst.opcode.is_md()
            || matches!(inst.kind, InstrKind::Label(_) | InstrKind::Pragma)
        {
            continue;
        }
        legalize_instr(md, f, iidx);
    }
}

/// Legalize the single instruction `iidx`, and any moves that doing so inserts.
pub(crate) fn legalize_instr<T: TargetLowering + ?Sized>(md: &T, f: &mut Func, iidx: InstrIdx) {
    materialize_float_consts(f, iidx);
    md.legalize_special(f, iidx);
    let Some(forms) = md.legal_forms(f.instr(iidx).opcode) else {
        panic!(
            "{} has no encoding on {}",
            f.instr_to_string(iidx),
            md.target()
        );
    };
    let ps = md.ptr_size();

    if forms.two_address {
        fix_two_address(md, f, iidx, &forms);
    } else if let Some(dst) = f.instr(iidx).dst.clone() {
        if !forms.dst.contains_kind(dst.kind(ps)) {
            // Compute into a register and store it afterwards.
            let t = temp(f, dst.ty());
            f.instr_mut(iidx).dst = Some(t.clone());
            let next = f.next(iidx).unwrap();
            let m = md.insert_move(f, next, dst, t);
            legalize_instr(md, f, m);
        }
    }

    for slot in [Slot::Src1, Slot::Src2] {
        if slot == Slot::Src1 && forms.two_address {
            continue;
        }
        let Some(x) = opnd(f, iidx, slot) else {
            continue;
        };
        if !forms.slot(slot).contains_kind(x.kind(ps)) {
            hoist(md, f, iidx, slot);
        }
    }

    if forms.one_mem {
        let inst = f.instr(iidx);
        if mem_count(&forms, &inst.dst, &inst.src1, &inst.src2) > 1 {
            let slot = if inst.src2.as_ref().is_some_and(|x| x.is_mem()) {
                Slot::Src2
            } else {
                Slot::Src1
            };
            hoist(md, f, iidx, slot);
        }
    }

    debug_assert_eq!(
        check_instr(md, f, iidx),
        Ok(()),
        "{} is still illegal on {}",
        f.instr_to_string(iidx),
        md.target()
    );
}

/// Make `dst` and `src1` of the two-address instruction `iidx` the same location, and that
/// location one `dst` may legally be.
fn fix_two_address<T: TargetLowering + ?Sized>(
    md: &T,
    f: &mut Func,
    iidx: InstrIdx,
    forms: &OpForms,
) {
    let inst = f.instr(iidx).clone();
    let (Some(dst), Some(src1)) = (inst.dst.clone(), inst.src1.clone()) else {
        return;
    };
    let ps = md.ptr_size();
    let dst_ok = forms.dst.contains_kind(dst.kind(ps));
    if dst_ok && dst.same_location(&src1) {
        return;
    }
    // `dst = op src1, dst` cannot be computed in `dst` without clobbering the second source.
    let src2_is_dst = inst.src2.as_ref().is_some_and(|x| x.same_location(&dst));
    if dst_ok && !src2_is_dst {
        let m = md.insert_move(f, iidx, dst.clone(), src1.with_ty(dst.ty()));
        legalize_instr(md, f, m);
        f.instr_mut(iidx).src1 = Some(dst);
    } else {
        let t = temp(f, dst.ty());
        let m = md.insert_move(f, iidx, t.clone(), src1.with_ty(dst.ty()));
        legalize_instr(md, f, m);
        let i = f.instr_mut(iidx);
        i.dst = Some(t.clone());
        i.src1 = Some(t.clone());
        let next = f.next(iidx).unwrap();
        let m = md.insert_move(f, next, dst, t);
        legalize_instr(md, f, m);
    }
}

/// Move the source in `slot` into a fresh register.
fn hoist<T: TargetLowering + ?Sized>(md: &T, f: &mut Func, iidx: InstrIdx, slot: Slot) {
    let x = opnd(f, iidx, slot).unwrap();
    let t = temp(f, x.ty());
    let m = md.insert_move(f, iidx, t.clone(), x);
    legalize_instr(md, f, m);
    let i = f.instr_mut(iidx);
    match slot {
        Slot::Dst => i.dst = Some(t),
        Slot::Src1 => i.src1 = Some(t),
        Slot::Src2 => i.src2 = Some(t),
    }
}

/// Floating-point constants are never encodable: replace them with a reference to the function's
/// constant pool.
fn materialize_float_consts(f: &mut Func, iidx: InstrIdx) {
    for slot in [Slot::Dst, Slot::Src1, Slot::Src2] {
        if let Some(Opnd::FloatConst(c)) = opnd(f, iidx, slot) {
            let addr = f.float_const_addr(c.value);
            let m = Opnd::MemRef(crate::ir::MemRefOpnd { addr, ty: c.ty });
            let i = f.instr_mut(iidx);
            match slot {
                Slot::Dst => i.dst = Some(m),
                Slot::Src1 => i.src1 = Some(m),
                Slot::Src2 => i.src2 = Some(m),
            }
        }
    }
}

fn opnd(f: &Func, iidx: InstrIdx, slot: Slot) -> Option<Opnd> {
    let i = f.instr(iidx);
    match slot {
        Slot::Dst => i.dst.clone(),
        Slot::Src1 => i.src1.clone(),
        Slot::Src2 => i.src2.clone(),
    }
}

fn slots<'a>(
    dst: &'a Option<Opnd>,
    src1: &'a Option<Opnd>,
    src2: &'a Option<Opnd>,
) -> impl Iterator<Item = (Slot, &'a Opnd)> {
    [(Slot::Dst, dst), (Slot::Src1, src1), (Slot::Src2, src2)]
        .into_iter()
        .filter_map(|(s, x)| x.as_ref().map(|x| (s, x)))
}

/// How many distinct memory operands are there? A two-address instruction's `dst` and `src1` are
/// one operand.
fn mem_count(forms: &OpForms, dst: &Option<Opnd>, src1: &Option<Opnd>, src2: &Option<Opnd>) -> usize {
    slots(dst, src1, src2)
        .filter(|(s, x)| x.is_mem() && !(forms.two_address && *s == Slot::Src1 && dst.is_some()))
        .count()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ir::{Instr, Opcode, SymOpnd, Ty},
        target::{arm::Arm32, x64::X64, x64::SysVX64, x86::X86},
        testing::ir_matches,
    };
    use proptest::prelude::*;

    fn mem(f: &mut Func, ty: Ty) -> Opnd {
        let s = f.new_sym(ty);
        Opnd::Sym(SymOpnd::new(s, ty))
    }

    #[test]
    fn two_mem_add() {
        let md = X64::<SysVX64>::new();
        let mut f = Func::new(md.target(), "t");
        let a = mem(&mut f, Ty::I32);
        let b = mem(&mut f, Ty::I32);
        let iidx = f.append(
            Instr::new(Opcode::ADD)
                .with_dst(a.clone())
                .with_src1(a)
                .with_src2(b),
        );
        legalize(&md, &mut f);
        assert_eq!(check(&md, &f), Ok(()));
        assert!(f.instr(iidx).src2.as_ref().unwrap().is_reg());
        ir_matches(
            &f,
            "
            ...
            {{t}}.i32 = MOV [s1].i32
            [s0].i32 = ADD [s0].i32, {{t}}.i32
            ...",
        );
    }

    #[test]
    fn two_address_with_clobbered_source() {
        let md = X86;
        let mut f = Func::new(md.target(), "t");
        let d = Opnd::Reg(f.new_temp(Ty::I32));
        let a = Opnd::Reg(f.new_temp(Ty::I32));
        f.append(
            Instr::new(Opcode::SUB)
                .with_dst(d.clone())
                .with_src1(a)
                .with_src2(d),
        );
        legalize(&md, &mut f);
        assert_eq!(check(&md, &f), Ok(()));
        ir_matches(
            &f,
            "
            ...
            {{t}}.i32 = MOV s1.i32
            {{t}}.i32 = SUB {{t}}.i32, s0.i32
            s0.i32 = MOV {{t}}.i32
            ...",
        );
    }

    #[test]
    fn float_consts_live_in_memory() {
        let md = X64::<SysVX64>::new();
        let mut f = Func::new(md.target(), "t");
        let x = Opnd::Reg(f.new_temp(Ty::F64));
        f.append(
            Instr::new(Opcode::ADDSD)
                .with_dst(x.clone())
                .with_src1(x)
                .with_src2(Opnd::FloatConst(crate::ir::FloatConstOpnd {
                    value: 2.5,
                    ty: Ty::F64,
                })),
        );
        legalize(&md, &mut f);
        assert_eq!(check(&md, &f), Ok(()));
        ir_matches(
            &f,
            "
            ...
            s0.f64 = ADDSD s0.f64, [0x20000].f64
            ...",
        );
    }

    #[test]
    fn arm_store_of_immediate() {
        let md = Arm32;
        let mut f = Func::new(md.target(), "t");
        let m = mem(&mut f, Ty::I32);
        f.append(
            Instr::new(Opcode::MOV)
                .with_dst(m)
                .with_src1(Opnd::int(0x12345, Ty::I32)),
        );
        legalize(&md, &mut f);
        assert_eq!(check(&md, &f), Ok(()));
        ir_matches(
            &f,
            "
            ...
            {{t}}.i32 = LDIMM 0x12345
            [s0].i32 = STR {{t}}.i32
            ...",
        );
    }

    #[test]
    #[should_panic(expected = "has no encoding on")]
    fn foreign_opcode() {
        let md = Arm32;
        let mut f = Func::new(md.target(), "t");
        f.append(Instr::new(Opcode::CDQ));
        legalize(&md, &mut f);
    }

    /// Operand shapes the lowerer may emit.
    #[derive(Clone, Debug)]
    enum Shape {
        Reg,
        Mem,
        Imm(i64),
    }

    fn shape() -> impl Strategy<Value = Shape> {
        prop_oneof![
            Just(Shape::Reg),
            Just(Shape::Mem),
            any::<i8>().prop_map(|x| Shape::Imm(i64::from(x))),
            any::<i32>().prop_map(|x| Shape::Imm(i64::from(x))),
            any::<i64>().prop_map(Shape::Imm),
        ]
    }

    fn make(f: &mut Func, s: &Shape, ty: Ty) -> Opnd {
        match s {
            Shape::Reg => Opnd::Reg(f.new_temp(ty)),
            Shape::Mem => mem(f, ty),
            Shape::Imm(v) => Opnd::int(*v, ty),
        }
    }

    fn closure<T: TargetLowering>(md: &T, ops: &[Opcode], shapes: &[(usize, Shape, Shape, Shape)]) {
        let mut f = Func::new(md.target(), "t");
        let word = if md.ptr_size() == 8 { Ty::I64 } else { Ty::I32 };
        for (op, d, a, b) in shapes {
            let op = ops[op % ops.len()];
            // Destinations are never immediates.
            let d = match d {
                Shape::Imm(_) => Shape::Reg,
                x => x.clone(),
            };
            let dst = make(&mut f, &d, word);
            let src1 = make(&mut f, a, word);
            let src2 = make(&mut f, b, word);
            let mut i = Instr::new(op).with_src1(src1);
            if !matches!(op, Opcode::CMP | Opcode::TEST) {
                i = i.with_dst(dst);
            }
            if !matches!(op, Opcode::MOV | Opcode::NEG | Opcode::NOT | Opcode::MVN) {
                i = i.with_src2(src2);
            }
            f.append(i);
        }
        legalize(md, &mut f);
        if let Err(e) = check(md, &f) {
            panic!("{e}\n{f}");
        }
    }

    proptest! {
        #[test]
        fn legalization_closure_x86_family(shapes in prop::collection::vec((0usize..8, shape(), shape(), shape()), 1..20)) {
            let ops = [Opcode::MOV, Opcode::ADD, Opcode::SUB, Opcode::AND, Opcode::XOR, Opcode::CMP, Opcode::IMUL2, Opcode::NEG];
            closure(&X64::<SysVX64>::new(), &ops, &shapes);
            closure(&X86, &ops, &shapes);
        }

        #[test]
        fn legalization_closure_arm(shapes in prop::collection::vec((0usize..8, shape(), shape(), shape()), 1..20)) {
            let ops = [Opcode::MOV, Opcode::ADD, Opcode::SUB, Opcode::ORR, Opcode::EOR, Opcode::CMP, Opcode::MUL_ARM, Opcode::MVN];
            closure(&Arm32, &ops, &shapes);
        }
    }
}
