//! IA-32 lowering.
//!
//! Tagged ints use [TagScheme::LowBit32](crate::value::TagScheme): `(v << 1) | 1`. Fast paths
//! mostly operate on tagged values directly, correcting for the tag bit, so that the common case
//! needs no untagging. Outgoing arguments are pushed (cdecl), so unlike the other targets there is
//! no pre-allocated outgoing-argument area.

use super::{
    binop_opnds, emit, emit2, emit_cmp, may_be_tagged, needs_stack_probe, tagged_payload, temp,
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
};
use smallvec::SmallVec;
use strum::{EnumCount, FromRepr, IntoStaticStr};

#[repr(u8)]
#[derive(Clone, Copy, Debug, EnumCount, FromRepr, IntoStaticStr, PartialEq, Eq)]
pub enum X86Reg {
    EAX,
    ECX,
    EDX,
    EBX,
    ESP,
    EBP,
    ESI,
    EDI,
    XMM0,
    XMM1,
    XMM2,
    XMM3,
    XMM4,
    XMM5,
    XMM6,
    XMM7,
}

impl RegT for X86Reg {
    fn from_regidx(idx: RegIdx) -> Self {
        Self::from_repr(idx.raw()).unwrap_or_else(|| panic!("{idx:?} is not an x86 register"))
    }

    fn regidx(self) -> RegIdx {
        RegIdx::from_raw(self as u8)
    }

    fn name(self) -> &'static str {
        self.into()
    }

    fn is_float(self) -> bool {
        self as u8 >= X86Reg::XMM0 as u8
    }
}

static CALLEE_SAVED: [X86Reg; 3] = [X86Reg::EBX, X86Reg::ESI, X86Reg::EDI];

pub(crate) struct X86;

impl X86 {
    fn word(&self, f: &mut Func, reg: X86Reg) -> Opnd {
        Opnd::Reg(f.phys_reg(reg, Ty::MachPtr))
    }

    /// `[ESP + off]`, for address arithmetic with `LEA`.
    fn esp_plus(&self, off: i64) -> Opnd {
        Opnd::Indir(IndirOpnd::new(
            RegOpnd::phys(X86Reg::ESP.regidx(), Ty::MachPtr),
            i32::try_from(off).unwrap(),
            Ty::MachPtr,
        ))
    }

    /// Copy the tagged value `x` into a fresh temporary.
    fn copy(&self, f: &mut Func, before: InstrIdx, x: &Opnd) -> Opnd {
        let t = temp(f, Ty::Var);
        self.insert_move(f, before, t.clone(), x.clone());
        t
    }

    /// Load the untagged payload of `x` into a fresh int32 temporary.
    fn load_payload(&self, f: &mut Func, before: InstrIdx, x: &Opnd) -> Opnd {
        let t = temp(f, Ty::I32);
        match tagged_payload(f, x) {
            Some(v) => {
                self.insert_move(f, before, t.clone(), Opnd::int(i64::from(v), Ty::I32));
            }
            None => self.emit_untag_int(f, before, &t, x),
        }
        t
    }

    /// Retag the int32 `t` in place, branching to `overflow` if it does not fit in 31 bits.
    fn retag(&self, f: &mut Func, before: InstrIdx, t: &Opnd, overflow: InstrIdx) {
        emit2(f, before, Opcode::ADD, t, t);
        self.insert_branch(f, before, Some(Cond::Overflow), overflow);
        emit2(f, before, Opcode::OR, t, &Opnd::int(1, Ty::I32));
    }

    fn saved_regs(&self, f: &Func) -> Vec<X86Reg> {
        CALLEE_SAVED
            .iter()
            .filter(|r| f.regs_used.get(usize::from(r.regidx())) == Some(true))
            .copied()
            .collect()
    }
}

impl X86Family for X86 {
    fn acc(&self) -> X86Reg {
        X86Reg::EAX
    }

    fn dx(&self) -> X86Reg {
        X86Reg::EDX
    }

    fn cx(&self) -> X86Reg {
        X86Reg::ECX
    }
}

impl TargetLowering for X86 {
    type Reg = X86Reg;

    fn target(&self) -> Target {
        Target::X86
    }

    fn stack_align(&self) -> u32 {
        4
    }

    fn reg_sp(&self) -> X86Reg {
        X86Reg::ESP
    }

    fn reg_fp(&self) -> X86Reg {
        X86Reg::EBP
    }

    fn reg_return(&self, ty: Ty) -> X86Reg {
        if ty.is_float() {
            X86Reg::XMM0
        } else {
            X86Reg::EAX
        }
    }

    fn callee_saved(&self) -> &'static [X86Reg] {
        &CALLEE_SAVED
    }

    fn legal_forms(&self, opcode: Opcode) -> Option<OpForms> {
        x86_common::legal_forms(opcode, 4)
    }

    fn implicit_clobbers(&self, inst: &Instr) -> SmallVec<[RegIdx; 2]> {
        x86_common::implicit_clobbers(self, inst)
    }

    fn arg_locs(&self, kinds: &[ArgKind]) -> Vec<ArgLoc> {
        let mut off = 0;
        kinds
            .iter()
            .map(|k| {
                let l = ArgLoc::Stack(off);
                off += match k {
                    ArgKind::Int => 4,
                    ArgKind::Float => 8,
                };
                l
            })
            .collect()
    }

    fn arg_area_size(&self, _locs: &[ArgLoc], _kinds: &[ArgKind]) -> u32 {
        0
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
        emit_cmp(f, before, Opcode::TEST, opnd, &Opnd::int(1, Ty::I32));
        self.insert_branch(f, before, Some(Cond::Eq), fail);
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
                let t = self.copy(f, before, a);
                emit2(f, before, Opcode::AND, &t, b);
                emit_cmp(f, before, Opcode::TEST, &t, &Opnd::int(1, Ty::I32));
                self.insert_branch(f, before, Some(Cond::Eq), fail);
            }
        }
    }

    fn generate_fast_add(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool {
        let Some((dst, a, b)) = binop_opnds(f, iidx) else {
            return false;
        };
        if !may_be_tagged(&a) || !may_be_tagged(&b) {
            return false;
        }
        self.generate_smint_pair_test(f, iidx, &a, &b, helper);
        // (2x + 1) - 1 + (2y + 1) = 2(x + y) + 1
        let t = self.copy(f, iidx, &a);
        emit2(f, iidx, Opcode::SUB, &t, &Opnd::int(1, Ty::I32));
        emit2(f, iidx, Opcode::ADD, &t, &b);
        self.insert_branch(f, iidx, Some(Cond::Overflow), helper);
        self.insert_move(f, iidx, dst, t);
        true
    }

    fn generate_fast_sub(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool {
        let Some((dst, a, b)) = binop_opnds(f, iidx) else {
            return false;
        };
        if !may_be_tagged(&a) || !may_be_tagged(&b) {
            return false;
        }
        self.generate_smint_pair_test(f, iidx, &a, &b, helper);
        // (2x + 1) - (2y + 1) = 2(x - y)
        let t = self.copy(f, iidx, &a);
        emit2(f, iidx, Opcode::SUB, &t, &b);
        self.insert_branch(f, iidx, Some(Cond::Overflow), helper);
        emit2(f, iidx, Opcode::OR, &t, &Opnd::int(1, Ty::I32));
        self.insert_move(f, iidx, dst, t);
        true
    }

    fn generate_fast_mul(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool {
        let Some((dst, a, b)) = binop_opnds(f, iidx) else {
            return false;
        };
        if !may_be_tagged(&a) || !may_be_tagged(&b) {
            return false;
        }
        self.generate_smint_pair_test(f, iidx, &a, &b, helper);
        // x * 2y = 2xy
        let t = self.load_payload(f, iidx, &a);
        let u = self.copy(f, iidx, &b);
        emit2(f, iidx, Opcode::SUB, &u, &Opnd::int(1, Ty::I32));
        emit2(f, iidx, Opcode::IMUL2, &t, &u);
        self.insert_branch(f, iidx, Some(Cond::Overflow), helper);
        // A zero product is -0 if either source is negative.
        let nz = f.new_label(false);
        emit_cmp(f, iidx, Opcode::TEST, &t, &t);
        self.insert_branch(f, iidx, Some(Cond::Ne), nz);
        let w = self.copy(f, iidx, &a);
        emit2(f, iidx, Opcode::OR, &w, &b);
        self.insert_branch(f, iidx, Some(Cond::Sign), helper);
        f.insert_before(iidx, nz);
        emit2(f, iidx, Opcode::OR, &t, &Opnd::int(1, Ty::I32));
        self.insert_move(f, iidx, dst, t);
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
                // The hardware masks the count to 5 bits.
                let cx = Opnd::Reg(f.phys_reg(X86Reg::ECX, Ty::I32));
                self.emit_untag_int(f, iidx, &cx, &b);
                cx
            }
        };
        emit2(f, iidx, op, &t, &count);
        if op == Opcode::SHR {
            emit_cmp(f, iidx, Opcode::TEST, &t, &t);
            self.insert_branch(f, iidx, Some(Cond::Sign), helper);
        }
        self.retag(f, iidx, &t, helper);
        self.insert_move(f, iidx, dst, t.with_ty(Ty::Var));
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
        let t = self.copy(f, iidx, &a);
        emit2(f, iidx, op, &t, &b);
        if op == Opcode::XOR {
            emit2(f, iidx, Opcode::OR, &t, &Opnd::int(1, Ty::I32));
        }
        self.insert_move(f, iidx, dst, t);
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
        // -0 is not an int32.
        emit_cmp(f, iidx, Opcode::CMP, &a, &Opnd::int(1, Ty::I32));
        self.insert_branch(f, iidx, Some(Cond::Eq), helper);
        // 2 - (2x + 1) = 2(-x) + 1
        let t = temp(f, Ty::Var);
        self.insert_move(f, iidx, t.clone(), Opnd::int(2, Ty::I32));
        emit2(f, iidx, Opcode::SUB, &t, &a);
        self.insert_branch(f, iidx, Some(Cond::Overflow), helper);
        self.insert_move(f, iidx, dst, t);
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
        // ~(2x + 1) = 2(~x), so only the tag needs restoring.
        let t = self.copy(f, iidx, &a);
        emit(f, iidx, Opcode::NOT, Some(&t), &t, None);
        emit2(f, iidx, Opcode::OR, &t, &Opnd::int(1, Ty::I32));
        self.insert_move(f, iidx, dst, t);
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
        // Tagging is monotonic, so tagged values compare like their payloads.
        let a = if a.is_imm() { self.copy(f, iidx, &a) } else { a };
        emit_cmp(f, iidx, Opcode::CMP, &a, &b);
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
        self.insert_move(f, before, dst.clone(), src.with_ty(dst.ty()));
        emit2(f, before, Opcode::SAR, dst, &Opnd::int(1, Ty::I8));
    }

    fn emit_tag_int(
        &self,
        f: &mut Func,
        before: InstrIdx,
        dst: &Opnd,
        src: &Opnd,
        overflow: Option<InstrIdx>,
    ) {
        let overflow = overflow.expect("31-bit tagging needs an overflow target");
        let t = temp(f, Ty::I32);
        self.insert_move(f, before, t.clone(), src.clone());
        self.retag(f, before, &t, overflow);
        self.insert_move(f, before, dst.clone(), t.with_ty(Ty::Var));
    }

    fn place_call_args(
        &self,
        f: &mut Func,
        before: InstrIdx,
        args: &[Opnd],
        locs: &[ArgLoc],
    ) -> u32 {
        debug_assert_eq!(args.len(), locs.len());
        let esp = self.word(f, X86Reg::ESP);
        let mut pushed = 0;
        for a in args.iter().rev() {
            if a.ty().is_float() {
                emit2(f, before, Opcode::SUB, &esp, &Opnd::int(8, Ty::I32));
                let slot = Opnd::Indir(IndirOpnd::new(
                    RegOpnd::phys(X86Reg::ESP.regidx(), Ty::MachPtr),
                    0,
                    Ty::F64,
                ));
                self.insert_move(f, before, slot, a.clone());
                pushed += 8;
            } else {
                emit(f, before, Opcode::PUSH, None, a, None);
                pushed += 4;
            }
        }
        pushed
    }

    fn emit_call(
        &self,
        f: &mut Func,
        before: InstrIdx,
        target: Opnd,
        dst: Option<Opnd>,
        pushed: u32,
    ) -> InstrIdx {
        let call = f.insert_instr_before(before, Instr::new(Opcode::CALL).with_src1(target));
        if pushed > 0 {
            // LEA leaves the flags alone.
            let esp = self.word(f, X86Reg::ESP);
            let addr = self.esp_plus(i64::from(pushed));
            emit(f, before, Opcode::LEA, Some(&esp), &addr, None);
        }
        if let Some(dst) = dst {
            let ret = Opnd::Reg(f.phys_reg(self.reg_return(dst.ty()), dst.ty()));
            self.insert_move(f, before, dst, ret);
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
        let pushed = 8 + 4 * u32::try_from(saved.len()).unwrap();
        let total = (pushed + f.frame.local_stack_height + f.frame.max_inlinee_argout_size)
            .next_multiple_of(self.stack_align());
        if total > MAX_FRAME_SIZE {
            return Err(AbortReason::FrameTooLarge { size: total });
        }
        let geom = FrameGeometry {
            pushed,
            alloc: total - pushed,
        };
        f.frame.saved_reg_size = 4 * u32::try_from(saved.len()).unwrap();
        f.shift_locals(f.frame.saved_reg_size);
        f.frame.args_size = 0;
        f.frame.frame_size = total;

        let at = f.next(f.head()).unwrap();
        let esp = self.word(f, X86Reg::ESP);
        let ebp = self.word(f, X86Reg::EBP);
        f.insert_instr_before(at, Instr::pragma(Opcode::PrologStart));
        emit(f, at, Opcode::PUSH, None, &ebp, None);
        self.insert_move(f, at, ebp, esp.clone());
        if needs_stack_probe(f, total) {
            self.generate_prologue_stack_probe(f, at, total);
        }
        for r in &saved {
            emit(f, at, Opcode::PUSH, None, &Opnd::Reg(RegOpnd::phys(r.regidx(), Ty::MachPtr)), None);
        }
        if geom.alloc >= PAGE_SIZE {
            let eax = self.word(f, X86Reg::EAX);
            self.insert_move(f, at, eax.clone(), Opnd::int(i64::from(geom.alloc), Ty::I32));
            emit(f, at, Opcode::CALL, None, &Opnd::helper(HelperMethod::CRT_chkstk), None);
            emit2(f, at, Opcode::SUB, &esp, &eax);
        } else if geom.alloc > 0 {
            let addr = self.esp_plus(-i64::from(geom.alloc));
            emit(f, at, Opcode::LEA, Some(&esp), &addr, None);
        }
        for s in zeroed {
            self.insert_move(f, at, Opnd::Sym(SymOpnd::new(s, Ty::MachPtr)), Opnd::int(0, Ty::I32));
        }
        f.insert_instr_before(at, Instr::pragma(Opcode::PrologEnd));
        Ok(geom)
    }

    fn lower_exit_instr(&self, f: &mut Func, epilog: InstrIdx, geom: &FrameGeometry) {
        let at = f.next(epilog).unwrap();
        let esp = self.word(f, X86Reg::ESP);
        let ebp = self.word(f, X86Reg::EBP);
        if geom.alloc > 0 {
            let addr = self.esp_plus(i64::from(geom.alloc));
            emit(f, at, Opcode::LEA, Some(&esp), &addr, None);
        }
        for r in self.saved_regs(f).iter().rev() {
            f.insert_instr_before(
                at,
                Instr::new(Opcode::POP).with_dst(Opnd::Reg(RegOpnd::phys(r.regidx(), Ty::MachPtr))),
            );
        }
        f.insert_instr_before(at, Instr::new(Opcode::POP).with_dst(ebp));
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
