//! Code shared by the x86 family (x64 and IA-32).
//!
//! The two instruction sets are close enough that their legal-forms tables, implicit clobbers,
//! int32 arithmetic, division and float lowering are the same modulo register names and the word
//! size. The differences (tagging, calls, frames) live in [super::x64] and [super::x86].

use super::{
    magic::{log2_of_pow2, signed_magic, unsigned_magic},
    emit, emit2, emit_cmp, param_kinds, script_context_opnd, stack_limit_opnd, temp, word_imm,
    ArgLoc, ArgKind, Cond, LegalForms, OpForms, RegT, TargetLowering, MIN_STACK_JIT,
};
use crate::{
    helpers::HelperMethod,
    ir::{BailOutKind, Func, Instr, InstrIdx, Opcode, Opnd, OpndKind, OpndT, RegIdx, RegOpnd, Ty},
    peephole::{flags_live_after, jumps_to_next_label},
};
use smallvec::SmallVec;

/// What the x86-family lowering needs beyond [TargetLowering].
pub(super) trait X86Family: TargetLowering {
    /// `RAX`/`EAX`: the implicit operand of widening multiplies and divides.
    fn acc(&self) -> Self::Reg;
    /// `RDX`/`EDX`: the high half of widening multiplies and divides.
    fn dx(&self) -> Self::Reg;
    /// `RCX`/`ECX`: the only register a variable shift count can live in.
    fn cx(&self) -> Self::Reg;
    /// Scratch space the callee may write below its arguments (the Windows x64 shadow space).
    fn call_scratch(&self) -> u32 {
        0
    }
}

pub(super) fn legal_forms(op: Opcode, ptr_size: u32) -> Option<OpForms> {
    use LegalForms as L;
    let word_imm = if ptr_size == 8 { L::IMM | L::IMM64 } else { L::IMM };
    let addr = L::HELPER | L::LABEL;
    Some(match op {
        Opcode::MOV => OpForms::new(L::REG_MEM, L::REG_MEM | word_imm | addr, L::NONE),
        Opcode::MOV_TRUNC | Opcode::MOVSXD => OpForms::new(L::REG, L::REG_MEM, L::NONE),
        Opcode::MOVSD | Opcode::MOVAPS => OpForms::new(L::REG_MEM, L::REG_MEM, L::NONE),
        Opcode::LEA => OpForms::new(L::REG, L::MEM, L::NONE),
        Opcode::ADD | Opcode::SUB | Opcode::AND | Opcode::OR | Opcode::XOR => {
            OpForms::new(L::REG_MEM, L::REG_MEM, L::REG_MEM_IMM).two_address()
        }
        Opcode::IMUL2 => OpForms::new(L::REG, L::REG, L::REG_MEM_IMM).two_address(),
        Opcode::IMUL | Opcode::MUL | Opcode::IDIV | Opcode::DIV => {
            OpForms::new(L::REG, L::REG, L::REG_MEM)
        }
        Opcode::CDQ | Opcode::XCHG => OpForms::new(L::REG, L::REG, L::NONE),
        Opcode::NEG | Opcode::NOT => OpForms::new(L::REG_MEM, L::REG_MEM, L::NONE).two_address(),
        Opcode::SHL | Opcode::SHR | Opcode::SAR => {
            OpForms::new(L::REG_MEM, L::REG_MEM, L::REG | L::IMM8).two_address()
        }
        Opcode::TEST => OpForms::new(L::NONE, L::REG_MEM, L::REG_IMM),
        Opcode::CMP => OpForms::new(L::NONE, L::REG_MEM, L::REG_MEM_IMM),
        Opcode::PUSH => {
            if ptr_size == 8 {
                OpForms::new(L::NONE, L::REG_MEM | L::IMM, L::NONE)
            } else {
                OpForms::new(L::NONE, L::REG_MEM | L::IMM | addr, L::NONE)
            }
        }
        Opcode::POP => OpForms::new(L::REG_MEM, L::NONE, L::NONE),
        Opcode::CALL => {
            if ptr_size == 8 {
                OpForms::new(L::NONE, L::REG_MEM, L::NONE)
            } else {
                OpForms::new(L::NONE, L::REG_MEM | L::HELPER, L::NONE)
            }
        }
        Opcode::RET => OpForms::new(L::NONE, L::IMM, L::NONE),
        Opcode::JMP => OpForms::new(L::NONE, L::REG_MEM, L::NONE),
        Opcode::JO
        | Opcode::JNO
        | Opcode::JEQ
        | Opcode::JNE
        | Opcode::JLT
        | Opcode::JLE
        | Opcode::JGT
        | Opcode::JGE
        | Opcode::JB
        | Opcode::JBE
        | Opcode::JA
        | Opcode::JAE
        | Opcode::JSB
        | Opcode::JNSB
        | Opcode::JP
        | Opcode::JNP
        | Opcode::INT3 => OpForms::new(L::NONE, L::NONE, L::NONE),
        Opcode::CVTSI2SD | Opcode::CVTTSD2SI => OpForms::new(L::REG, L::REG_MEM, L::NONE),
        Opcode::ADDSD | Opcode::SUBSD | Opcode::MULSD | Opcode::DIVSD => {
            OpForms::new(L::REG, L::REG, L::REG_MEM).two_address()
        }
        Opcode::UCOMISD => OpForms::new(L::NONE, L::REG, L::REG_MEM),
        _ => return None,
    })
}

/// How an instruction writes registers it does not name as its destination.
#[derive(Clone, Copy, Debug)]
enum Clobber {
    /// The high half of a widening multiply (`dx`).
    HighHalf,
    /// Whichever of `acc` and `dx` the divide does not name as its destination.
    OtherHalf,
    /// Both register operands.
    BothOperands,
}

static IMPLICIT_CLOBBERS: [(Opcode, Clobber); 5] = [
    (Opcode::IMUL, Clobber::HighHalf),
    (Opcode::MUL, Clobber::HighHalf),
    (Opcode::IDIV, Clobber::OtherHalf),
    (Opcode::DIV, Clobber::OtherHalf),
    (Opcode::XCHG, Clobber::BothOperands),
];

pub(super) fn implicit_clobbers<T: X86Family + ?Sized>(
    md: &T,
    inst: &Instr,
) -> SmallVec<[RegIdx; 2]> {
    let mut v = SmallVec::new();
    let Some((_, c)) = IMPLICIT_CLOBBERS.iter().find(|(op, _)| *op == inst.opcode) else {
        return v;
    };
    let dst_reg = inst.dst.as_ref().and_then(|x| x.as_reg()).and_then(|x| x.reg);
    match c {
        Clobber::HighHalf => v.push(md.dx().regidx()),
        Clobber::OtherHalf => {
            if dst_reg == Some(md.dx().regidx()) {
                v.push(md.acc().regidx());
            } else {
                v.push(md.dx().regidx());
            }
        }
        Clobber::BothOperands => {
            for x in [&inst.dst, &inst.src1].into_iter().flatten() {
                if let Some(r) = x.as_reg().and_then(|x| x.reg) {
                    v.push(r);
                }
            }
        }
    }
    v
}

pub(super) fn branch_op(cond: Cond) -> Opcode {
    match cond {
        Cond::Eq => Opcode::JEQ,
        Cond::Ne => Opcode::JNE,
        Cond::Lt => Opcode::JLT,
        Cond::Le => Opcode::JLE,
        Cond::Gt => Opcode::JGT,
        Cond::Ge => Opcode::JGE,
        Cond::B => Opcode::JB,
        Cond::Be => Opcode::JBE,
        Cond::A => Opcode::JA,
        Cond::Ae => Opcode::JAE,
        Cond::Overflow => Opcode::JO,
        Cond::NoOverflow => Opcode::JNO,
        Cond::Sign => Opcode::JSB,
        Cond::NotSign => Opcode::JNSB,
    }
}

pub(super) fn move_op(dst: &Opnd, src: &Opnd) -> Opcode {
    if dst.ty().is_float() || src.ty().is_float() {
        Opcode::MOVSD
    } else {
        Opcode::MOV
    }
}

fn imm32(v: i64) -> Opnd {
    Opnd::int(v, Ty::I32)
}

/// Fixed-register constraints and forms the generic legal-forms walk cannot express.
pub(super) fn legalize_special<T: X86Family + ?Sized>(md: &T, f: &mut Func, iidx: InstrIdx) {
    let inst = f.instr(iidx).clone();
    match inst.opcode {
        Opcode::SHL | Opcode::SHR | Opcode::SAR => {
            // A variable shift count must be in CL.
            if let Some(Opnd::Reg(r)) = &inst.src2 {
                if r.reg != Some(md.cx().regidx()) {
                    let cx = Opnd::Reg(f.phys_reg(md.cx(), r.ty));
                    md.insert_move(f, iidx, cx.clone(), inst.src2.clone().unwrap());
                    f.instr_mut(iidx).src2 = Some(cx);
                }
            }
        }
        Opcode::MOV if md.ptr_size() == 8 => {
            // Only `MOV r64, imm64` exists, and code/label addresses may need all 64 bits.
            if let (Some(dst), Some(src)) = (&inst.dst, &inst.src1) {
                if dst.is_mem()
                    && matches!(
                        src.kind(8),
                        OpndKind::Imm64 | OpndKind::Helper | OpndKind::Label
                    )
                {
                    let t = temp(f, src.ty());
                    md.insert_move(f, iidx, t.clone(), src.clone());
                    f.instr_mut(iidx).src1 = Some(t);
                }
            }
        }
        _ => (),
    }
}

/// The kind of an instruction's bailout, if it has one.
pub(super) fn bail_kind(f: &Func, inst: &Instr) -> Option<BailOutKind> {
    inst.bailout.map(|b| f.bailout(b).kind)
}

/// Branch to `bail` if `result` is zero and `sign_src` is negative: a zero that should have been
/// -0.
pub(super) fn emit_negative_zero_check<T: TargetLowering + ?Sized>(
    md: &T,
    f: &mut Func,
    before: InstrIdx,
    result: &Opnd,
    sign_src: &Opnd,
    bail: InstrIdx,
) {
    let nz = f.new_label(false);
    emit_cmp(f, before, Opcode::TEST, result, result);
    md.insert_branch(f, before, Some(Cond::Ne), nz);
    emit_cmp(f, before, Opcode::TEST, sign_src, sign_src);
    md.insert_branch(f, before, Some(Cond::Sign), bail);
    f.insert_before(before, nz);
}

pub(super) fn lower_int4_op<T: X86Family + ?Sized>(
    md: &T,
    f: &mut Func,
    iidx: InstrIdx,
    bail: Option<InstrIdx>,
) {
    let inst = f.instr(iidx).clone();
    let op = match inst.opcode {
        Opcode::AddI4 => Opcode::ADD,
        Opcode::SubI4 => Opcode::SUB,
        Opcode::MulI4 => Opcode::IMUL2,
        Opcode::NegI4 => Opcode::NEG,
        x => panic!("{x} is not an int32 operation"),
    };
    let (Some(bail), Some(kind)) = (bail, bail_kind(f, &inst)) else {
        let i = f.instr_mut(iidx);
        i.opcode = op;
        i.bailout = None;
        return;
    };
    let dst = inst.dst.clone().unwrap();
    let src1 = inst.src1.clone().unwrap();

    // The result is computed into a temporary so that the sources are intact on the bailout
    // path.
    if inst.opcode == Opcode::NegI4 && kind.contains(BailOutKind::ON_NEGATIVE_ZERO) {
        emit_cmp(f, iidx, Opcode::TEST, &src1, &src1);
        md.insert_branch(f, iidx, Some(Cond::Eq), bail);
    }
    let t = temp(f, Ty::I32);
    md.insert_move(f, iidx, t.clone(), src1.clone());
    match &inst.src2 {
        Some(s2) => emit2(f, iidx, op, &t, s2),
        None => {
            emit(f, iidx, op, Some(&t), &t, None);
        }
    }
    if kind.contains(BailOutKind::ON_OVERFLOW) || kind.contains(BailOutKind::ON_MUL_OVERFLOW) {
        md.insert_branch(f, iidx, Some(Cond::Overflow), bail);
    }
    if inst.opcode == Opcode::MulI4 && kind.contains(BailOutKind::ON_NEGATIVE_ZERO) {
        // A zero product is -0 if either source is negative.
        let u = temp(f, Ty::I32);
        md.insert_move(f, iidx, u.clone(), src1);
        emit2(f, iidx, Opcode::OR, &u, inst.src2.as_ref().unwrap());
        emit_negative_zero_check(md, f, iidx, &t, &u, bail);
    }
    md.insert_move(f, iidx, dst, t);
    f.unlink(iidx);
}

/// `(signed, remainder)` for a division opcode.
fn div_kind(op: Opcode) -> (bool, bool) {
    match op {
        Opcode::DivI4 => (true, false),
        Opcode::RemI4 => (true, true),
        Opcode::DivU4 => (false, false),
        Opcode::RemU4 => (false, true),
        x => panic!("{x} is not a division"),
    }
}

pub(super) fn lower_int4_div<T: X86Family + ?Sized>(
    md: &T,
    f: &mut Func,
    iidx: InstrIdx,
    bail: Option<InstrIdx>,
) {
    let inst = f.instr(iidx).clone();
    let (signed, is_rem) = div_kind(inst.opcode);
    let ty = if signed { Ty::I32 } else { Ty::U32 };
    let dst = inst.dst.clone().unwrap();
    let n = inst.src1.clone().unwrap();
    let mut d = inst.src2.clone().unwrap();
    let kind = bail.and(bail_kind(f, &inst));

    if d.is_imm() {
        let t = temp(f, ty);
        md.insert_move(f, iidx, t.clone(), d);
        d = t;
    }
    if let (Some(bail), Some(kind)) = (bail, kind) {
        // Division by zero has no int32 result.
        emit_cmp(f, iidx, Opcode::TEST, &d, &d);
        md.insert_branch(f, iidx, Some(Cond::Eq), bail);
        if signed {
            // Neither does INT_MIN / -1.
            let ok = f.new_label(false);
            emit_cmp(f, iidx, Opcode::CMP, &d, &imm32(-1));
            md.insert_branch(f, iidx, Some(Cond::Ne), ok);
            emit_cmp(f, iidx, Opcode::CMP, &n, &imm32(i64::from(i32::MIN)));
            md.insert_branch(f, iidx, Some(Cond::Eq), bail);
            f.insert_before(iidx, ok);
            if !is_rem && kind.contains(BailOutKind::ON_NEGATIVE_ZERO) {
                // 0 / negative is -0.
                emit_negative_zero_check(md, f, iidx, &n, &d, bail);
            }
        }
    }

    let acc = Opnd::Reg(f.phys_reg(md.acc(), ty));
    let dx = Opnd::Reg(f.phys_reg(md.dx(), ty));
    md.insert_move(f, iidx, acc.clone(), n.clone());
    if signed {
        emit(f, iidx, Opcode::CDQ, Some(&dx), &acc, None);
    } else {
        md.insert_move(f, iidx, dx.clone(), imm32(0));
    }
    let op = if signed { Opcode::IDIV } else { Opcode::DIV };
    let res = if is_rem { dx.clone() } else { acc.clone() };
    emit(f, iidx, op, Some(&res), &acc, Some(&d));
    if let (Some(bail), Some(kind)) = (bail, kind) {
        if !is_rem && kind.contains(BailOutKind::ON_DIV_RESULT_NOT_INT) {
            // The remainder is in `dx` even though the divide only names the quotient.
            emit_cmp(f, iidx, Opcode::TEST, &dx, &dx);
            md.insert_branch(f, iidx, Some(Cond::Ne), bail);
        }
        if is_rem && signed && kind.contains(BailOutKind::ON_NEGATIVE_ZERO) {
            emit_negative_zero_check(md, f, iidx, &dx, &n, bail);
        }
    }
    md.insert_move(f, iidx, dst, res);
    f.unlink(iidx);
}

/// Strength-reduce a division by a constant into a multiply-high, shifts and corrections.
pub(super) fn generate_fast_div_and_rem<T: X86Family + ?Sized>(
    md: &T,
    f: &mut Func,
    iidx: InstrIdx,
    bail: Option<InstrIdx>,
) -> bool {
    let inst = f.instr(iidx).clone();
    let Some(Opnd::IntConst(dc)) = &inst.src2 else {
        return false;
    };
    let (signed, is_rem) = div_kind(inst.opcode);
    let ty = if signed { Ty::I32 } else { Ty::U32 };
    let dst = inst.dst.clone().unwrap();
    let n = inst.src1.clone().unwrap();
    let kind = bail.and(bail_kind(f, &inst));
    let has = |k| kind.map(|x| x.contains(k)).unwrap_or(false);

    let q = temp(f, ty);
    let d_imm;
    if signed {
        let d = dc.value as i32;
        if d == 0 || d == -1 {
            return false;
        }
        d_imm = Opnd::int(i64::from(d), ty);
        if d < 0 && !is_rem && has(BailOutKind::ON_NEGATIVE_ZERO) {
            // 0 / negative is -0.
            let bail = bail.unwrap();
            let t = temp(f, ty);
            md.insert_move(f, iidx, t.clone(), n.clone());
            emit_cmp(f, iidx, Opcode::TEST, &t, &t);
            md.insert_branch(f, iidx, Some(Cond::Eq), bail);
        }
        if d == 1 {
            md.insert_move(f, iidx, q.clone(), n.clone());
        } else if let Some(k) = log2_of_pow2(d.unsigned_abs()) {
            // Round towards zero by adding `2^k - 1` to negative dividends before shifting.
            md.insert_move(f, iidx, q.clone(), n.clone());
            emit2(f, iidx, Opcode::SAR, &q, &Opnd::int(31, Ty::I8));
            emit2(f, iidx, Opcode::SHR, &q, &Opnd::int(i64::from(32 - k), Ty::I8));
            emit2(f, iidx, Opcode::ADD, &q, &n);
            emit2(f, iidx, Opcode::SAR, &q, &Opnd::int(i64::from(k), Ty::I8));
            if d < 0 {
                emit(f, iidx, Opcode::NEG, Some(&q), &q, None);
            }
        } else {
            let m = signed_magic(d);
            let acc = Opnd::Reg(f.phys_reg(md.acc(), ty));
            let dx = Opnd::Reg(f.phys_reg(md.dx(), ty));
            md.insert_move(f, iidx, acc.clone(), Opnd::int(i64::from(m.multiplier), ty));
            emit(f, iidx, Opcode::IMUL, Some(&acc), &acc, Some(&n));
            md.insert_move(f, iidx, q.clone(), dx);
            if d > 0 && m.multiplier < 0 {
                emit2(f, iidx, Opcode::ADD, &q, &n);
            } else if d < 0 && m.multiplier > 0 {
                emit2(f, iidx, Opcode::SUB, &q, &n);
            }
            if m.shift > 0 {
                emit2(f, iidx, Opcode::SAR, &q, &Opnd::int(i64::from(m.shift), Ty::I8));
            }
            // Add one to negative quotients.
            let t = temp(f, ty);
            md.insert_move(f, iidx, t.clone(), q.clone());
            emit2(f, iidx, Opcode::SHR, &t, &Opnd::int(31, Ty::I8));
            emit2(f, iidx, Opcode::ADD, &q, &t);
        }
    } else {
        let d = dc.value as u32;
        if d == 0 {
            return false;
        }
        d_imm = Opnd::int(i64::from(d), ty);
        md.insert_move(f, iidx, q.clone(), n.clone());
        if let Some(k) = log2_of_pow2(d) {
            if k > 0 {
                emit2(f, iidx, Opcode::SHR, &q, &Opnd::int(i64::from(k), Ty::I8));
            }
        } else {
            let m = unsigned_magic(d);
            let acc = Opnd::Reg(f.phys_reg(md.acc(), ty));
            let dx = Opnd::Reg(f.phys_reg(md.dx(), ty));
            md.insert_move(f, iidx, acc.clone(), Opnd::int(i64::from(m.multiplier), ty));
            emit(f, iidx, Opcode::MUL, Some(&acc), &acc, Some(&n));
            md.insert_move(f, iidx, q.clone(), dx);
            if m.add {
                // q = (((n - q) >> 1) + q) >> (shift - 1)
                let t = temp(f, ty);
                md.insert_move(f, iidx, t.clone(), n.clone());
                emit2(f, iidx, Opcode::SUB, &t, &q);
                emit2(f, iidx, Opcode::SHR, &t, &Opnd::int(1, Ty::I8));
                emit2(f, iidx, Opcode::ADD, &t, &q);
                if m.shift > 1 {
                    emit2(f, iidx, Opcode::SHR, &t, &Opnd::int(i64::from(m.shift - 1), Ty::I8));
                }
                md.insert_move(f, iidx, q.clone(), t);
            } else if m.shift > 0 {
                emit2(f, iidx, Opcode::SHR, &q, &Opnd::int(i64::from(m.shift), Ty::I8));
            }
        }
    }

    let mut res = q.clone();
    if is_rem || has(BailOutKind::ON_DIV_RESULT_NOT_INT) {
        // rem = n - q * d
        let p = temp(f, ty);
        md.insert_move(f, iidx, p.clone(), q.clone());
        emit2(f, iidx, Opcode::IMUL2, &p, &d_imm);
        let r = temp(f, ty);
        md.insert_move(f, iidx, r.clone(), n.clone());
        emit2(f, iidx, Opcode::SUB, &r, &p);
        if let Some(bail) = bail {
            if !is_rem && has(BailOutKind::ON_DIV_RESULT_NOT_INT) {
                emit_cmp(f, iidx, Opcode::TEST, &r, &r);
                md.insert_branch(f, iidx, Some(Cond::Ne), bail);
            }
            if is_rem && signed && has(BailOutKind::ON_NEGATIVE_ZERO) {
                let sn = temp(f, ty);
                md.insert_move(f, iidx, sn.clone(), n.clone());
                emit_negative_zero_check(md, f, iidx, &r, &sn, bail);
            }
        }
        if is_rem {
            res = r;
        }
    }
    md.insert_move(f, iidx, dst, res);
    f.unlink(iidx);
    true
}

pub(super) fn lower_typed_cmp_branch<T: X86Family + ?Sized>(md: &T, f: &mut Func, iidx: InstrIdx) {
    let inst = f.instr(iidx).clone();
    let a = inst.src1.clone().unwrap();
    let b = inst.src2.clone().unwrap();
    let target = inst.branch_target().unwrap();
    if a.ty().is_float() {
        // UCOMISD sets the flags like an unsigned compare, with PF set if either side is NaN (in
        // which case ZF and CF are set too).
        let (x, y, cond) = match inst.opcode {
            Opcode::BrLt => (&b, &a, Cond::A),
            Opcode::BrLe => (&b, &a, Cond::Ae),
            Opcode::BrGt => (&a, &b, Cond::A),
            Opcode::BrGe => (&a, &b, Cond::Ae),
            Opcode::BrEq => (&a, &b, Cond::Eq),
            Opcode::BrNeq => (&a, &b, Cond::Ne),
            x => panic!("{x} is not a compare-and-branch"),
        };
        emit_cmp(f, iidx, Opcode::UCOMISD, x, y);
        match inst.opcode {
            Opcode::BrEq => {
                let skip = f.new_label(false);
                f.insert_instr_before(iidx, Instr::branch(Opcode::JP, skip));
                f.insert_after(iidx, skip);
            }
            Opcode::BrNeq => {
                f.insert_instr_before(iidx, Instr::branch(Opcode::JP, target));
            }
            _ => (),
        }
        set_branch(f, iidx, md.branch_op(cond));
    } else {
        emit_cmp(f, iidx, Opcode::CMP, &a, &b);
        let cond = Cond::for_br(inst.opcode, a.ty().is_unsigned());
        set_branch(f, iidx, md.branch_op(cond));
    }
}

/// Turn the compare-and-branch `iidx` into the operand-less conditional branch `op`.
pub(super) fn set_branch(f: &mut Func, iidx: InstrIdx, op: Opcode) {
    let i = f.instr_mut(iidx);
    i.opcode = op;
    i.src1 = None;
    i.src2 = None;
    i.bailout = None;
}

pub(super) fn lower_float_op(f: &mut Func, iidx: InstrIdx) {
    let op = match f.instr(iidx).opcode {
        Opcode::AddF => Opcode::ADDSD,
        Opcode::SubF => Opcode::SUBSD,
        Opcode::MulF => Opcode::MULSD,
        Opcode::DivF => Opcode::DIVSD,
        Opcode::ToFloat => Opcode::CVTSI2SD,
        x => panic!("{x} is not a float operation"),
    };
    f.instr_mut(iidx).opcode = op;
}

/// The stack probe. It runs after the frame pointer is set up and before anything else is pushed,
/// so it may use the accumulator freely; on its cold path it preserves the registers the
/// function's parameters arrive in.
pub(super) fn generate_prologue_stack_probe<T: X86Family + ?Sized>(
    md: &T,
    f: &mut Func,
    before: InstrIdx,
    frame_size: u32,
) {
    let word = Ty::MachPtr;
    let acc = Opnd::Reg(f.phys_reg(md.acc(), word));
    let sp = md.phys(md.reg_sp(), word);
    let size = u64::from(frame_size + MIN_STACK_JIT);
    let helper = f.new_label(true);
    let done = f.new_label(false);
    if f.tctx.thread_bound {
        let limit = f.tctx.script_stack_limit.wrapping_add(size);
        md.insert_move(f, before, acc.clone(), word_imm(f, limit as i64));
    } else {
        md.insert_move(f, before, acc.clone(), stack_limit_opnd(f));
        emit2(f, before, Opcode::ADD, &acc, &word_imm(f, size as i64));
        if f.tctx.interrupt_probe {
            // A pending interrupt sets the limit so high that adding the frame size wraps.
            md.insert_branch(f, before, Some(Cond::B), helper);
        }
    }
    emit_cmp(f, before, Opcode::CMP, &sp, &acc);
    md.insert_branch(f, before, Some(Cond::A), done);
    f.insert_before(before, helper);

    let saved = f
        .target
        .arg_locs(&param_kinds(f))
        .into_iter()
        .filter_map(|l| match l {
            ArgLoc::Reg(r) => Some(r),
            ArgLoc::Stack(_) => None,
        })
        .collect::<Vec<_>>();
    for r in &saved {
        emit(f, before, Opcode::PUSH, None, &Opnd::Reg(RegOpnd::phys(*r, word)), None);
    }
    let pushed = u32::try_from(saved.len()).unwrap() * md.ptr_size() + md.call_scratch();
    let pad = pushed.next_multiple_of(md.stack_align()) - pushed + md.call_scratch();
    if pad > 0 {
        emit2(f, before, Opcode::SUB, &sp, &imm32(i64::from(pad)));
    }
    let args = [word_imm(f, i64::from(frame_size)), script_context_opnd(f)];
    let kinds = [ArgKind::Int, ArgKind::Int];
    let locs = md.arg_locs(&kinds);
    let arg_pushed = md.place_call_args(f, before, &args, &locs);
    md.emit_call(
        f,
        before,
        Opnd::helper(HelperMethod::ProbeCurrentStack),
        None,
        arg_pushed,
    );
    if pad > 0 {
        emit2(f, before, Opcode::ADD, &sp, &imm32(i64::from(pad)));
    }
    for r in saved.iter().rev() {
        f.insert_instr_before(
            before,
            Instr::new(Opcode::POP).with_dst(Opnd::Reg(RegOpnd::phys(*r, word))),
        );
    }
    f.insert_before(before, done);
}

/// `InterruptProbe`: a stack-limit check with an inline helper call.
pub(super) fn lower_interrupt_probe<T: X86Family + ?Sized>(md: &T, f: &mut Func, iidx: InstrIdx) {
    let word = Ty::MachPtr;
    let t = temp(f, word);
    let sp = md.phys(md.reg_sp(), word);
    md.insert_move(f, iidx, t.clone(), stack_limit_opnd(f));
    emit_cmp(f, iidx, Opcode::CMP, &sp, &t);
    let helper = f.new_label(true);
    let done = f.new_label(false);
    md.insert_branch(f, iidx, Some(Cond::A), done);
    f.insert_before(iidx, helper);
    let args = [word_imm(f, 0), script_context_opnd(f)];
    md.lower_helper_call(f, iidx, HelperMethod::ProbeCurrentStack, &args, None);
    f.insert_before(iidx, done);
    f.unlink(iidx);
}

/// Return to the exception-region helper with the continuation address in the accumulator. The
/// return goes through `Op_ReturnFromCallWithFakeFrame`, which tears down the region's fake frame.
pub(super) fn lower_eh_region_return<T: X86Family + ?Sized>(
    md: &T,
    f: &mut Func,
    before: InstrIdx,
    target: Opnd,
) {
    let word = Ty::MachPtr;
    let acc = Opnd::Reg(f.phys_reg(md.acc(), word));
    let cx = Opnd::Reg(f.phys_reg(md.cx(), word));
    md.insert_move(f, before, acc, target);
    md.insert_move(
        f,
        before,
        cx.clone(),
        Opnd::helper(HelperMethod::Op_ReturnFromCallWithFakeFrame),
    );
    emit(f, before, Opcode::PUSH, None, &cx, None);
    f.insert_instr_before(before, Instr::new(Opcode::RET));
}

pub(super) fn peephole_instr<T: X86Family + ?Sized>(_md: &T, f: &mut Func, iidx: InstrIdx) -> bool {
    let inst = f.instr(iidx);
    match inst.opcode {
        Opcode::MOV | Opcode::MOVSD | Opcode::MOVAPS => {
            let (Some(dst), Some(src)) = (&inst.dst, &inst.src1) else {
                return false;
            };
            if dst.same_location(src) && (inst.opcode == Opcode::MOVAPS || dst.ty() == src.ty()) {
                f.unlink(iidx);
                return true;
            }
            if inst.opcode == Opcode::MOV
                && dst.is_reg()
                && !dst.ty().is_float()
                && src.int_value() == Some(0)
                && matches!(src, Opnd::IntConst(_))
                && !flags_live_after(f, iidx)
            {
                let dst = dst.clone();
                let i = f.instr_mut(iidx);
                i.opcode = Opcode::XOR;
                i.src1 = Some(dst.clone());
                i.src2 = Some(dst);
            }
            false
        }
        Opcode::JMP if inst.branch_target().is_some() && jumps_to_next_label(f, iidx) => {
            f.unlink(iidx);
            true
        }
        _ => false,
    }
}
