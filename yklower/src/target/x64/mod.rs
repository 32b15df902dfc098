//! x64 lowering.
//!
//! The instruction selection (tag tests, fast paths, int32 arithmetic) is shared by both x64
//! ABIs; [X64] is parameterised by an [X64Abi] for the calling convention and frame layout.
//!
//! Tagged ints use [TagScheme::Atom64](crate::value::TagScheme): the payload is the low 32 bits
//! and bit 48 is the tag. Because every int32 is representable, arithmetic fast paths work on the
//! 32-bit halves of registers (which x64 zero-extends) and then OR the tag back in.

use super::{
    binop_opnds, emit, emit2, emit_cmp, may_be_tagged, needs_stack_probe, param_kinds,
    tagged_payload, temp,
    x86_common::{self, X86Family},
    ArgKind, ArgLoc, Cond, FrameGeometry, OpForms, RegT, Target, TargetLowering, MAX_FRAME_SIZE,
    PAGE_SIZE,
};
use crate::{
    helpers::HelperMethod,
    ir::{
        Func, IndirOpnd, Instr, InstrIdx, Opcode, Opnd, OpndT, RegIdx, RegOpnd, SymOpnd, Ty,
    },
    lower::AbortReason,
    value::{ATOM_TAG, ATOM_TAG_PAIR, VAR_TAG_SHIFT},
};
use smallvec::SmallVec;
use std::marker::PhantomData;
use strum::{EnumCount, FromRepr, IntoStaticStr};

mod abi;

pub(crate) use abi::{SysVX64, WinX64};

#[repr(u8)]
#[derive(Clone, Copy, Debug, EnumCount, FromRepr, IntoStaticStr, PartialEq, Eq)]
pub enum X64Reg {
    RAX,
    RCX,
    RDX,
    RBX,
    RSP,
    RBP,
    RSI,
    RDI,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    XMM0,
    XMM1,
    XMM2,
    XMM3,
    XMM4,
    XMM5,
    XMM6,
    XMM7,
    XMM8,
    XMM9,
    XMM10,
    XMM11,
    XMM12,
    XMM13,
    XMM14,
    XMM15,
}

impl RegT for X64Reg {
    fn from_regidx(idx: RegIdx) -> Self {
        Self::from_repr(idx.raw()).unwrap_or_else(|| panic!("{idx:?} is not an x64 register"))
    }

    fn regidx(self) -> RegIdx {
        RegIdx::from_raw(self as u8)
    }

    fn name(self) -> &'static str {
        self.into()
    }

    fn is_float(self) -> bool {
        self as u8 >= X64Reg::XMM0 as u8
    }
}

/// An x64 calling convention.
pub(crate) trait X64Abi: 'static {
    const TARGET: Target;
    /// Callee-saved general-purpose registers other than `RBP`, in push order.
    const CALLEE_SAVED: &'static [X64Reg];
    /// Callee-saved XMM registers, saved with `MOVAPS`.
    const CALLEE_SAVED_XMM: &'static [X64Reg];
    /// Space the caller must reserve below the arguments for the callee's use.
    const SHADOW_SPACE: u32;
    /// Does the prolog home register parameters into the caller's shadow space?
    const HOME_PARAMS: bool;

    fn arg_locs(kinds: &[ArgKind]) -> Vec<ArgLoc>;
}

pub(crate) struct X64<A: X64Abi> {
    abi: PhantomData<A>,
}

impl<A: X64Abi> X64<A> {
    pub(crate) fn new() -> Self {
        Self { abi: PhantomData }
    }

    fn word(&self, f: &mut Func, reg: X64Reg) -> Opnd {
        Opnd::Reg(f.phys_reg(reg, Ty::MachPtr))
    }

    /// The int32 view of the tagged int `x` for use as a source operand.
    fn payload_view(&self, f: &Func, x: &Opnd) -> Opnd {
        match tagged_payload(f, x) {
            Some(v) => Opnd::int(i64::from(v), Ty::I32),
            None => x.with_ty(Ty::I32),
        }
    }

    /// Load the payload of the tagged int `x` into a fresh int32 temporary.
    fn load_payload(&self, f: &mut Func, before: InstrIdx, x: &Opnd) -> Opnd {
        let t = temp(f, Ty::I32);
        match tagged_payload(f, x) {
            Some(v) => {
                self.insert_move(f, before, t.clone(), Opnd::int(i64::from(v), Ty::I32));
            }
            None => {
                emit(f, before, Opcode::MOV_TRUNC, Some(&t), &x.with_ty(Ty::I32), None);
            }
        }
        t
    }

    /// `dst = t | ATOM_TAG`, where `t` is an int32 temporary whose upper half is zero.
    fn tag_into(&self, f: &mut Func, before: InstrIdx, t: &Opnd, dst: &Opnd) {
        let w = t.with_ty(Ty::Var);
        emit2(f, before, Opcode::OR, &w, &Opnd::int(ATOM_TAG as i64, Ty::Var));
        self.insert_move(f, before, dst.clone(), w);
    }

    fn fast_arith(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx, op: Opcode) -> bool {
        let Some((dst, a, b)) = binop_opnds(f, iidx) else {
            return false;
        };
        if !may_be_tagged(&a) || !may_be_tagged(&b) {
            return false;
        }
        self.generate_smint_pair_test(f, iidx, &a, &b, helper);
        let t = self.load_payload(f, iidx, &a);
        let bv = self.payload_view(f, &b);
        emit2(f, iidx, op, &t, &bv);
        self.insert_branch(f, iidx, Some(Cond::Overflow), helper);
        self.tag_into(f, iidx, &t, &dst);
        true
    }

    fn saved_regs(&self, f: &Func) -> Vec<X64Reg> {
        A::CALLEE_SAVED
            .iter()
            .filter(|r| f.regs_used.get(usize::from(r.regidx())) == Some(true))
            .copied()
            .collect()
    }

    fn saved_xmms(&self, f: &Func) -> Vec<X64Reg> {
        A::CALLEE_SAVED_XMM
            .iter()
            .filter(|r| f.regs_used.get(usize::from(r.regidx())) == Some(true))
            .copied()
            .collect()
    }

    fn xmm_save_slot(&self, f: &Func, k: usize) -> Opnd {
        let off = f.frame.args_size + 16 * u32::try_from(k).unwrap();
        Opnd::Indir(IndirOpnd::new(
            RegOpnd::phys(X64Reg::RSP.regidx(), Ty::MachPtr),
            i32::try_from(off).unwrap(),
            Ty::F64,
        ))
    }
}

impl<A: X64Abi> X86Family for X64<A> {
    fn acc(&self) -> X64Reg {
        X64Reg::RAX
    }

    fn dx(&self) -> X64Reg {
        X64Reg::RDX
    }

    fn cx(&self) -> X64Reg {
        X64Reg::RCX
    }

    fn call_scratch(&self) -> u32 {
        A::SHADOW_SPACE
    }
}

impl<A: X64Abi> TargetLowering for X64<A> {
    type Reg = X64Reg;

    fn target(&self) -> Target {
        A::TARGET
    }

    fn stack_align(&self) -> u32 {
        16
    }

    fn reg_sp(&self) -> X64Reg {
        X64Reg::RSP
    }

    fn reg_fp(&self) -> X64Reg {
        X64Reg::RBP
    }

    fn reg_return(&self, ty: Ty) -> X64Reg {
        if ty.is_float() {
            X64Reg::XMM0
        } else {
            X64Reg::RAX
        }
    }

    fn callee_saved(&self) -> &'static [X64Reg] {
        A::CALLEE_SAVED
    }

    fn legal_forms(&self, opcode: Opcode) -> Option<OpForms> {
        x86_common::legal_forms(opcode, 8)
    }

    fn implicit_clobbers(&self, inst: &Instr) -> SmallVec<[RegIdx; 2]> {
        x86_common::implicit_clobbers(self, inst)
    }

    fn arg_locs(&self, kinds: &[ArgKind]) -> Vec<ArgLoc> {
        A::arg_locs(kinds)
    }

    fn arg_area_size(&self, locs: &[ArgLoc], kinds: &[ArgKind]) -> u32 {
        let stack = locs
            .iter()
            .filter_map(|l| match l {
                ArgLoc::Stack(off) => Some(off + 8),
                ArgLoc::Reg(_) => None,
            })
            .max()
            .unwrap_or(0);
        debug_assert_eq!(locs.len(), kinds.len());
        stack.max(A::SHADOW_SPACE)
    }

    fn branch_op(&self, cond: Cond) -> Opcode {
        x86_common::branch_op(cond)
    }

    fn branch_op_uncond(&self) -> Opcode {
        Opcode::JMP
    }

    fn move_op(&self, dst: &Opnd, src: &Opnd) -> Opcode {
        x86_common::move_op(dst, src)
    }

    fn legalize_special(&self, f: &mut Func, iidx: InstrIdx) {
        x86_common::legalize_special(self, f, iidx)
    }

    fn generate_smint_test(&self, f: &mut Func, before: InstrIdx, opnd: &Opnd, fail: InstrIdx) {
        if opnd.value_type().is_tagged_int() || tagged_payload(f, opnd).is_some() {
            return;
        }
        let t = temp(f, Ty::Var);
        self.insert_move(f, before, t.clone(), opnd.clone());
        emit2(f, before, Opcode::SHR, &t, &Opnd::int(i64::from(VAR_TAG_SHIFT), Ty::I8));
        emit_cmp(f, before, Opcode::CMP, &t, &Opnd::int(1, Ty::I32));
        self.insert_branch(f, before, Some(Cond::Ne), fail);
    }

    fn generate_smint_pair_test(
        &self,
        f: &mut Func,
        before: InstrIdx,
        a: &Opnd,
        b: &Opnd,
        fail: InstrIdx,
    ) {
        let known = |x: &Opnd| x.value_type().is_tagged_int() || tagged_payload(f, x).is_some();
        match (known(a), known(b)) {
            (true, true) => (),
            (true, false) => self.generate_smint_test(f, before, b, fail),
            (false, true) => self.generate_smint_test(f, before, a, fail),
            (false, false) => {
                // (a >> 48) | (b >> 32) is 0x10001 iff both are tagged ints.
                let s1 = temp(f, Ty::Var);
                let s2 = temp(f, Ty::Var);
                self.insert_move(f, before, s1.clone(), a.clone());
                emit2(f, before, Opcode::SHR, &s1, &Opnd::int(48, Ty::I8));
                self.insert_move(f, before, s2.clone(), b.clone());
                emit2(f, before, Opcode::SHR, &s2, &Opnd::int(32, Ty::I8));
                emit2(f, before, Opcode::OR, &s1, &s2);
                emit_cmp(f, before, Opcode::CMP, &s1, &Opnd::int(ATOM_TAG_PAIR, Ty::I32));
                self.insert_branch(f, before, Some(Cond::Ne), fail);
            }
        }
    }

    fn generate_fast_add(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool {
        self.fast_arith(f, iidx, helper, Opcode::ADD)
    }

    fn generate_fast_sub(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool {
        self.fast_arith(f, iidx, helper, Opcode::SUB)
    }

    fn generate_fast_mul(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool {
        let Some((dst, a, b)) = binop_opnds(f, iidx) else {
            return false;
        };
        if !may_be_tagged(&a) || !may_be_tagged(&b) {
            return false;
        }
        self.generate_smint_pair_test(f, iidx, &a, &b, helper);
        let t = self.load_payload(f, iidx, &a);
        let bv = self.payload_view(f, &b);
        emit2(f, iidx, Opcode::IMUL2, &t, &bv);
        self.insert_branch(f, iidx, Some(Cond::Overflow), helper);
        // A zero product is -0 if either source is negative: only the helper can produce that.
        let nz = f.new_label(false);
        emit_cmp(f, iidx, Opcode::TEST, &t, &t);
        self.insert_branch(f, iidx, Some(Cond::Ne), nz);
        let u = self.load_payload(f, iidx, &a);
        emit2(f, iidx, Opcode::OR, &u, &bv);
        self.insert_branch(f, iidx, Some(Cond::Sign), helper);
        f.insert_before(iidx, nz);
        self.tag_into(f, iidx, &t, &dst);
        true
    }

    fn generate_fast_shift(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool {
        let Some((dst, a, b)) = binop_opnds(f, iidx) else {
            return false;
        };
        if !may_be_tagged(&a) || !may_be_tagged(&b) {
            return false;
        }
        let op = match f.instr(iidx).opcode {
            Opcode::Shl => Opcode::SHL,
            Opcode::Shr => Opcode::SAR,
            Opcode::ShrU => Opcode::SHR,
            _ => return false,
        };
        self.generate_smint_pair_test(f, iidx, &a, &b, helper);
        let t = self.load_payload(f, iidx, &a);
        let count = match tagged_payload(f, &b) {
            Some(v) => Opnd::int(i64::from(v & 31), Ty::I8),
            None => {
                let cx = Opnd::Reg(f.phys_reg(X64Reg::RCX, Ty::I32));
                emit(f, iidx, Opcode::MOV_TRUNC, Some(&cx), &b.with_ty(Ty::I32), None);
                cx
            }
        };
        emit2(f, iidx, op, &t, &count);
        if op == Opcode::SHR {
            // An unsigned result above i32::MAX is not an int32.
            emit_cmp(f, iidx, Opcode::TEST, &t, &t);
            self.insert_branch(f, iidx, Some(Cond::Sign), helper);
        }
        self.tag_into(f, iidx, &t, &dst);
        true
    }

    fn generate_fast_bitwise(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool {
        let Some((dst, a, b)) = binop_opnds(f, iidx) else {
            return false;
        };
        if !may_be_tagged(&a) || !may_be_tagged(&b) {
            return false;
        }
        let op = match f.instr(iidx).opcode {
            Opcode::And => Opcode::AND,
            Opcode::Or => Opcode::OR,
            Opcode::Xor => Opcode::XOR,
            _ => return false,
        };
        self.generate_smint_pair_test(f, iidx, &a, &b, helper);
        // AND and OR preserve the tag; XOR cancels it out.
        let r = temp(f, Ty::Var);
        self.insert_move(f, iidx, r.clone(), a);
        emit2(f, iidx, op, &r, &b);
        if op == Opcode::XOR {
            emit2(f, iidx, Opcode::OR, &r, &Opnd::int(ATOM_TAG as i64, Ty::Var));
        }
        self.insert_move(f, iidx, dst, r);
        true
    }

    fn generate_fast_neg(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool {
        let inst = f.instr(iidx).clone();
        let (Some(dst), Some(a)) = (inst.dst, inst.src1) else {
            return false;
        };
        if !may_be_tagged(&a) {
            return false;
        }
        self.generate_smint_test(f, iidx, &a, helper);
        let t = self.load_payload(f, iidx, &a);
        // -0 and -INT_MIN are not int32s.
        emit_cmp(f, iidx, Opcode::TEST, &t, &t);
        self.insert_branch(f, iidx, Some(Cond::Eq), helper);
        emit(f, iidx, Opcode::NEG, Some(&t), &t, None);
        self.insert_branch(f, iidx, Some(Cond::Overflow), helper);
        self.tag_into(f, iidx, &t, &dst);
        true
    }

    fn generate_fast_not(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool {
        let inst = f.instr(iidx).clone();
        let (Some(dst), Some(a)) = (inst.dst, inst.src1) else {
            return false;
        };
        if !may_be_tagged(&a) {
            return false;
        }
        self.generate_smint_test(f, iidx, &a, helper);
        let t = self.load_payload(f, iidx, &a);
        emit(f, iidx, Opcode::NOT, Some(&t), &t, None);
        self.tag_into(f, iidx, &t, &dst);
        true
    }

    fn generate_fast_cmp_branch(
        &self,
        f: &mut Func,
        iidx: InstrIdx,
        helper: InstrIdx,
        done: InstrIdx,
    ) -> bool {
        let inst = f.instr(iidx).clone();
        let target = inst.branch_target();
        let (Some(a), Some(b), Some(target)) = (inst.src1, inst.src2, target) else {
            return false;
        };
        if !may_be_tagged(&a) || !may_be_tagged(&b) {
            return false;
        }
        self.generate_smint_pair_test(f, iidx, &a, &b, helper);
        let t = self.load_payload(f, iidx, &a);
        let bv = self.payload_view(f, &b);
        emit_cmp(f, iidx, Opcode::CMP, &t, &bv);
        self.insert_branch(f, iidx, Some(Cond::for_br(inst.opcode, false)), target);
        self.insert_branch(f, iidx, None, done);
        true
    }

    fn generate_fast_div_and_rem(
        &self,
        f: &mut Func,
        iidx: InstrIdx,
        bail: Option<InstrIdx>,
    ) -> bool {
        x86_common::generate_fast_div_and_rem(self, f, iidx, bail)
    }

    fn lower_int4_op(&self, f: &mut Func, iidx: InstrIdx, bail: Option<InstrIdx>) {
        x86_common::lower_int4_op(self, f, iidx, bail)
    }

    fn lower_int4_div(&self, f: &mut Func, iidx: InstrIdx, bail: Option<InstrIdx>) {
        x86_common::lower_int4_div(self, f, iidx, bail)
    }

    fn lower_typed_cmp_branch(&self, f: &mut Func, iidx: InstrIdx) {
        x86_common::lower_typed_cmp_branch(self, f, iidx)
    }

    fn lower_float_op(&self, f: &mut Func, iidx: InstrIdx) {
        x86_common::lower_float_op(f, iidx)
    }

    fn emit_untag_int(&self, f: &mut Func, before: InstrIdx, dst: &Opnd, src: &Opnd) {
        emit(f, before, Opcode::MOV_TRUNC, Some(dst), &src.with_ty(Ty::I32), None);
    }

    fn emit_tag_int(
        &self,
        f: &mut Func,
        before: InstrIdx,
        dst: &Opnd,
        src: &Opnd,
        _overflow: Option<InstrIdx>,
    ) {
        // A 32-bit move zero-extends.
        let t = temp(f, Ty::I32);
        self.insert_move(f, before, t.clone(), src.with_ty(Ty::I32));
        self.tag_into(f, before, &t, dst);
    }

    fn emit_call(
        &self,
        f: &mut Func,
        before: InstrIdx,
        target: Opnd,
        dst: Option<Opnd>,
        pushed: u32,
    ) -> InstrIdx {
        let target = match target {
            Opnd::HelperCall(_) | Opnd::Addr(_) | Opnd::IntConst(_) => {
                let rax = self.word(f, X64Reg::RAX);
                self.insert_move(f, before, rax.clone(), target);
                rax
            }
            x => x,
        };
        let call = f.insert_instr_before(before, Instr::new(Opcode::CALL).with_src1(target));
        if pushed > 0 {
            let rsp = self.word(f, X64Reg::RSP);
            emit2(f, before, Opcode::ADD, &rsp, &Opnd::int(i64::from(pushed), Ty::I32));
        }
        if let Some(dst) = dst {
            let ret = Opnd::Reg(f.phys_reg(self.reg_return(dst.ty()), dst.ty()));
            if dst.ty() == Ty::I32 {
                emit(f, before, Opcode::MOV_TRUNC, Some(&dst), &ret, None);
            } else {
                self.insert_move(f, before, dst, ret);
            }
        }
        call
    }

    fn lower_entry_instr(&self, f: &mut Func) -> Result<FrameGeometry, AbortReason> {
        let zeroed = [f.flags.argument_slot, f.flags.inlinee_argc]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();
        for s in &zeroed {
            f.stack_allocate(*s);
        }
        let saved = self.saved_regs(f);
        let xmms = self.saved_xmms(f);
        let pushed = 16 + 8 * u32::try_from(saved.len()).unwrap();
        let xmm_area = 16 * u32::try_from(xmms.len()).unwrap();
        let args_area = (f.frame.arg_slots_for_functions_called * 8).next_multiple_of(16);
        let body = f.frame.local_stack_height
            + f.frame.max_inlinee_argout_size
            + xmm_area
            + args_area;
        let total = (pushed + body).next_multiple_of(16);
        if total > MAX_FRAME_SIZE {
            return Err(AbortReason::FrameTooLarge { size: total });
        }
        let geom = FrameGeometry {
            pushed,
            alloc: total - pushed,
        };
        f.frame.saved_reg_size = 8 * u32::try_from(saved.len()).unwrap();
        f.shift_locals(f.frame.saved_reg_size);
        f.frame.args_size = args_area;
        f.frame.frame_size = total;

        let at = f.next(f.head()).unwrap();
        let rsp = self.word(f, X64Reg::RSP);
        let rbp = self.word(f, X64Reg::RBP);
        f.insert_instr_before(at, Instr::pragma(Opcode::PrologStart));
        emit(f, at, Opcode::PUSH, None, &rbp, None);
        self.insert_move(f, at, rbp.clone(), rsp.clone());
        if A::HOME_PARAMS && f.has_calls {
            for (i, loc) in A::arg_locs(&param_kinds(f)).into_iter().enumerate() {
                if let ArgLoc::Reg(r) = loc {
                    let slot = Opnd::Indir(IndirOpnd::new(
                        RegOpnd::phys(X64Reg::RBP.regidx(), Ty::MachPtr),
                        16 + 8 * i32::try_from(i).unwrap(),
                        Ty::Var,
                    ));
                    self.insert_move(f, at, slot, Opnd::Reg(RegOpnd::phys(r, Ty::Var)));
                }
            }
        }
        if needs_stack_probe(f, total) {
            self.generate_prologue_stack_probe(f, at, total);
        }
        for r in &saved {
            emit(f, at, Opcode::PUSH, None, &Opnd::Reg(RegOpnd::phys(r.regidx(), Ty::MachPtr)), None);
        }
        if geom.alloc >= PAGE_SIZE {
            // Touch each page of the new frame in order so the guard page is never skipped.
            let rax = self.word(f, X64Reg::RAX);
            let r11 = self.word(f, X64Reg::R11);
            self.insert_move(f, at, rax.clone(), Opnd::int(i64::from(geom.alloc), Ty::I64));
            self.insert_move(f, at, r11.clone(), Opnd::helper(HelperMethod::CRT_chkstk));
            emit(f, at, Opcode::CALL, None, &r11, None);
            emit2(f, at, Opcode::SUB, &rsp, &rax);
        } else if geom.alloc > 0 {
            emit2(f, at, Opcode::SUB, &rsp, &Opnd::int(i64::from(geom.alloc), Ty::I32));
        }
        for (k, x) in xmms.iter().enumerate() {
            let slot = self.xmm_save_slot(f, k);
            emit(f, at, Opcode::MOVAPS, Some(&slot), &Opnd::Reg(RegOpnd::phys(x.regidx(), Ty::F64)), None);
        }
        if !zeroed.is_empty() {
            let rax = self.word(f, X64Reg::RAX);
            self.insert_move(f, at, rax.clone(), Opnd::int(0, Ty::I64));
            for s in zeroed {
                self.insert_move(f, at, Opnd::Sym(SymOpnd::new(s, Ty::MachPtr)), rax.clone());
            }
        }
        f.insert_instr_before(at, Instr::pragma(Opcode::PrologEnd));
        Ok(geom)
    }

    fn lower_exit_instr(&self, f: &mut Func, epilog: InstrIdx, geom: &FrameGeometry) {
        let at = f.next(epilog).unwrap();
        let rsp = self.word(f, X64Reg::RSP);
        let rbp = self.word(f, X64Reg::RBP);
        for (k, x) in self.saved_xmms(f).iter().enumerate() {
            let slot = self.xmm_save_slot(f, k);
            emit(f, at, Opcode::MOVAPS, Some(&Opnd::Reg(RegOpnd::phys(x.regidx(), Ty::F64))), &slot, None);
        }
        if geom.alloc > 0 {
            emit2(f, at, Opcode::ADD, &rsp, &Opnd::int(i64::from(geom.alloc), Ty::I32));
        }
        for r in self.saved_regs(f).iter().rev() {
            f.insert_instr_before(
                at,
                Instr::new(Opcode::POP).with_dst(Opnd::Reg(RegOpnd::phys(r.regidx(), Ty::MachPtr))),
            );
        }
        f.insert_instr_before(at, Instr::new(Opcode::POP).with_dst(rbp));
        f.insert_instr_before(at, Instr::new(Opcode::RET));
    }

    fn generate_prologue_stack_probe(&self, f: &mut Func, before: InstrIdx, frame_size: u32) {
        x86_common::generate_prologue_stack_probe(self, f, before, frame_size)
    }

    fn lower_interrupt_probe(&self, f: &mut Func, iidx: InstrIdx) {
        x86_common::lower_interrupt_probe(self, f, iidx)
    }

    fn lower_eh_region_return(&self, f: &mut Func, before: InstrIdx, target: Opnd) {
        x86_common::lower_eh_region_return(self, f, before, target)
    }

    fn peephole_instr(&self, f: &mut Func, iidx: InstrIdx) -> bool {
        x86_common::peephole_instr(self, f, iidx)
    }
}
