//! ARM32 lowering.
//!
//! ARM is a load/store architecture: arithmetic only takes registers and small immediates, and
//! memory is reached only through `LDR`/`STR` (`VLDR`/`VSTR` for doubles). A "move" is thus one of
//! several opcodes depending on its operands (see [Arm32::move_op]), and [Arm32::legalize_special]
//! rewrites `MOV`s the lowerer emitted generically into the right one. Absolute memory references
//! are not addressable and are rebased on a register loaded with `LDIMM`.
//!
//! Tagged ints use the same 31-bit encoding as IA-32. There is no hardware divide: int32 division
//! always calls a runtime helper.

use super::{
    binop_opnds, emit, emit_cmp, may_be_tagged, needs_stack_probe, param_kinds,
    script_context_opnd, stack_limit_opnd, tagged_payload, temp, word_imm, ArgKind, ArgLoc, Cond,
    FrameGeometry, LegalForms, OpForms, RegT, Target, TargetLowering, MAX_FRAME_SIZE,
    MIN_STACK_JIT, PAGE_SIZE,
};
use crate::{
    helpers::HelperMethod,
    ir::{
        BailOutKind, Func, IndirOpnd, Instr, InstrIdx, Opcode, Opnd, OpndKind, OpndT, RegIdx,
        RegOpnd, SymOpnd, Ty,
    },
    lower::AbortReason,
    peephole::jumps_to_next_label,
};
use smallvec::SmallVec;
use strum::{EnumCount, FromRepr, IntoStaticStr};

#[repr(u8)]
#[derive(Clone, Copy, Debug, EnumCount, FromRepr, IntoStaticStr, PartialEq, Eq)]
pub enum ArmReg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    /// The frame pointer.
    R11,
    /// The intra-procedure scratch register. Also receives the high half of `SMULL`.
    R12,
    SP,
    LR,
    PC,
    D0,
    D1,
    D2,
    D3,
    D4,
    D5,
    D6,
    D7,
    D8,
    D9,
    D10,
    D11,
    D12,
    D13,
    D14,
    D15,
}

impl RegT for ArmReg {
    fn from_regidx(idx: RegIdx) -> Self {
        Self::from_repr(idx.raw()).unwrap_or_else(|| panic!("{idx:?} is not an ARM register"))
    }

    fn regidx(self) -> RegIdx {
        RegIdx::from_raw(self as u8)
    }

    fn name(self) -> &'static str {
        self.into()
    }

    fn is_float(self) -> bool {
        self as u8 >= ArmReg::D0 as u8
    }
}

static CALLEE_SAVED: [ArmReg; 7] = [
    ArmReg::R4,
    ArmReg::R5,
    ArmReg::R6,
    ArmReg::R7,
    ArmReg::R8,
    ArmReg::R9,
    ArmReg::R10,
];
static CALLEE_SAVED_D: [ArmReg; 8] = [
    ArmReg::D8,
    ArmReg::D9,
    ArmReg::D10,
    ArmReg::D11,
    ArmReg::D12,
    ArmReg::D13,
    ArmReg::D14,
    ArmReg::D15,
];
const INT_ARGS: [ArmReg; 4] = [ArmReg::R0, ArmReg::R1, ArmReg::R2, ArmReg::R3];
const FLOAT_ARGS: [ArmReg; 8] = [
    ArmReg::D0,
    ArmReg::D1,
    ArmReg::D2,
    ArmReg::D3,
    ArmReg::D4,
    ArmReg::D5,
    ArmReg::D6,
    ArmReg::D7,
];

/// Registers written by an instruction without being named as its destination.
static IMPLICIT_CLOBBERS: [(Opcode, ArmReg); 3] = [
    (Opcode::SMULL, ArmReg::R12),
    (Opcode::BL, ArmReg::LR),
    (Opcode::BLX, ArmReg::LR),
];

pub(crate) struct Arm32;

fn imm(v: i64) -> Opnd {
    Opnd::int(v, Ty::I32)
}

impl Arm32 {
    fn word(&self, f: &mut Func, reg: ArmReg) -> Opnd {
        Opnd::Reg(f.phys_reg(reg, Ty::MachPtr))
    }

    fn emit3(&self, f: &mut Func, before: InstrIdx, op: Opcode, dst: &Opnd, a: &Opnd, b: &Opnd) {
        emit(f, before, op, Some(dst), a, Some(b));
    }

    fn load_payload(&self, f: &mut Func, before: InstrIdx, x: &Opnd) -> Opnd {
        let t = temp(f, Ty::I32);
        match tagged_payload(f, x) {
            Some(v) => {
                self.insert_move(f, before, t.clone(), imm(i64::from(v)));
            }
            None => self.emit_untag_int(f, before, &t, x),
        }
        t
    }

    /// Retag the int32 `t` in place, branching to `overflow` if it does not fit in 31 bits.
    fn retag(&self, f: &mut Func, before: InstrIdx, t: &Opnd, overflow: InstrIdx) {
        self.emit3(f, before, Opcode::ADDS, t, t, t);
        self.insert_branch(f, before, Some(Cond::Overflow), overflow);
        self.emit3(f, before, Opcode::ORR, t, t, &imm(1));
    }

    /// Branch to `fail` unless the signed 64-bit product whose low half is `lo` (and whose high
    /// half `SMULL` left in `R12`) fits in 32 bits.
    fn emit_mul_overflow_check(&self, f: &mut Func, before: InstrIdx, lo: &Opnd, fail: InstrIdx) {
        let hi = Opnd::Reg(f.phys_reg(ArmReg::R12, Ty::I32));
        let s = temp(f, Ty::I32);
        self.emit3(f, before, Opcode::ASR, &s, lo, &imm(31));
        emit_cmp(f, before, Opcode::CMP, &hi, &s);
        self.insert_branch(f, before, Some(Cond::Ne), fail);
    }

    /// Branch to `fail` if `result` is zero and `sign_src` is negative.
    fn emit_negative_zero_check(
        &self,
        f: &mut Func,
        before: InstrIdx,
        result: &Opnd,
        sign_src: &Opnd,
        fail: InstrIdx,
    ) {
        let nz = f.new_label(false);
        emit_cmp(f, before, Opcode::CMP, result, &imm(0));
        self.insert_branch(f, before, Some(Cond::Ne), nz);
        emit_cmp(f, before, Opcode::TST, sign_src, sign_src);
        self.insert_branch(f, before, Some(Cond::Sign), fail);
        f.insert_before(before, nz);
    }

    fn saved_regs(&self, f: &Func, regs: &'static [ArmReg]) -> Vec<ArmReg> {
        regs.iter()
            .filter(|r| f.regs_used.get(usize::from(r.regidx())) == Some(true))
            .copied()
            .collect()
    }

    /// Replace an absolute memory reference with an indirection through a register.
    fn rebase_memref(&self, f: &mut Func, before: InstrIdx, x: &Opnd) -> Option<Opnd> {
        let Opnd::MemRef(m) = x else {
            return None;
        };
        let base = f.new_temp(Ty::MachPtr);
        f.insert_instr_before(
            before,
            Instr::new(Opcode::LDIMM)
                .with_dst(Opnd::Reg(base.clone()))
                .with_src1(word_imm(f, m.addr as i64)),
        );
        Some(Opnd::Indir(IndirOpnd::new(base, 0, m.ty)))
    }
}

impl TargetLowering for Arm32 {
    type Reg = ArmReg;

    fn target(&self) -> Target {
        Target::Arm32
    }

    fn stack_align(&self) -> u32 {
        8
    }

    fn reg_sp(&self) -> ArmReg {
        ArmReg::SP
    }

    fn reg_fp(&self) -> ArmReg {
        ArmReg::R11
    }

    fn reg_return(&self, ty: Ty) -> ArmReg {
        if ty.is_float() {
            ArmReg::D0
        } else {
            ArmReg::R0
        }
    }

    fn callee_saved(&self) -> &'static [ArmReg] {
        &CALLEE_SAVED
    }

    fn legal_forms(&self, op: Opcode) -> Option<OpForms> {
        use LegalForms as L;
        let reg_imm = L::REG | L::IMM8;
        Some(match op {
            Opcode::MOV | Opcode::MVN => OpForms::new(L::REG, reg_imm, L::NONE),
            Opcode::LDIMM => OpForms::new(L::REG, L::IMM | L::HELPER | L::LABEL, L::NONE),
            Opcode::LDR | Opcode::VLDR => OpForms::new(L::REG, L::MEM, L::NONE),
            Opcode::STR | Opcode::VSTR => OpForms::new(L::MEM, L::REG, L::NONE),
            Opcode::VMOV
            | Opcode::VCVT_F64_S32
            | Opcode::VCVT_S32_F64 => OpForms::new(L::REG, L::REG, L::NONE),
            Opcode::ADD
            | Opcode::SUB
            | Opcode::AND
            | Opcode::ORR
            | Opcode::EOR
            | Opcode::RSB
            | Opcode::ADDS
            | Opcode::SUBS
            | Opcode::RSBS
            | Opcode::LSL
            | Opcode::LSR
            | Opcode::ASR => OpForms::new(L::REG, L::REG, reg_imm),
            Opcode::MUL_ARM
            | Opcode::SMULL
            | Opcode::VADD
            | Opcode::VSUB
            | Opcode::VMUL
            | Opcode::VDIV => OpForms::new(L::REG, L::REG, L::REG),
            Opcode::CMP | Opcode::CMN | Opcode::TST => OpForms::new(L::NONE, L::REG, reg_imm),
            Opcode::VCMP => OpForms::new(L::NONE, L::REG, L::REG),
            Opcode::PUSH | Opcode::VPUSH => OpForms::new(L::NONE, L::REG, L::NONE),
            Opcode::POP | Opcode::VPOP => OpForms::new(L::REG, L::NONE, L::NONE),
            Opcode::BL => OpForms::new(L::NONE, L::HELPER, L::NONE),
            Opcode::BLX | Opcode::BX => OpForms::new(L::NONE, L::REG, L::NONE),
            Opcode::B
            | Opcode::BEQ
            | Opcode::BNE
            | Opcode::BLT
            | Opcode::BLE
            | Opcode::BGT
            | Opcode::BGE
            | Opcode::BLO
            | Opcode::BLS
            | Opcode::BHI
            | Opcode::BHS
            | Opcode::BMI
            | Opcode::BPL
            | Opcode::BVS
            | Opcode::BVC
            | Opcode::DEBUGBREAK => OpForms::new(L::NONE, L::NONE, L::NONE),
            _ => return None,
        })
    }

    fn implicit_clobbers(&self, inst: &Instr) -> SmallVec<[RegIdx; 2]> {
        IMPLICIT_CLOBBERS
            .iter()
            .filter(|(op, _)| *op == inst.opcode)
            .map(|(_, r)| r.regidx())
            .collect()
    }

    fn arg_locs(&self, kinds: &[ArgKind]) -> Vec<ArgLoc> {
        let (mut ints, mut floats, mut stack) = (0, 0, 0u32);
        kinds
            .iter()
            .map(|k| match k {
                ArgKind::Int if ints < INT_ARGS.len() => {
                    ints += 1;
                    ArgLoc::Reg(INT_ARGS[ints - 1].regidx())
                }
                ArgKind::Float if floats < FLOAT_ARGS.len() => {
                    floats += 1;
                    ArgLoc::Reg(FLOAT_ARGS[floats - 1].regidx())
                }
                ArgKind::Int => {
                    stack += 4;
                    ArgLoc::Stack(stack - 4)
                }
                ArgKind::Float => {
                    // Doubles are 8-byte aligned on the stack.
                    stack = stack.next_multiple_of(8) + 8;
                    ArgLoc::Stack(stack - 8)
                }
            })
            .collect()
    }

    fn branch_op(&self, cond: Cond) -> Opcode {
        match cond {
            Cond::Eq => Opcode::BEQ,
            Cond::Ne => Opcode::BNE,
            Cond::Lt => Opcode::BLT,
            Cond::Le => Opcode::BLE,
            Cond::Gt => Opcode::BGT,
            Cond::Ge => Opcode::BGE,
            Cond::B => Opcode::BLO,
            Cond::Be => Opcode::BLS,
            Cond::A => Opcode::BHI,
            Cond::Ae => Opcode::BHS,
            Cond::Overflow => Opcode::BVS,
            Cond::NoOverflow => Opcode::BVC,
            Cond::Sign => Opcode::BMI,
            Cond::NotSign => Opcode::BPL,
        }
    }

    fn branch_op_uncond(&self) -> Opcode {
        Opcode::B
    }

    fn branch_op_indirect(&self) -> Opcode {
        Opcode::BX
    }

    fn move_op(&self, dst: &Opnd, src: &Opnd) -> Opcode {
        if dst.ty().is_float() || src.ty().is_float() {
            if dst.is_mem() {
                Opcode::VSTR
            } else if src.is_mem() || matches!(src, Opnd::FloatConst(_)) {
                Opcode::VLDR
            } else {
                Opcode::VMOV
            }
        } else if dst.is_mem() {
            Opcode::STR
        } else if src.is_mem() {
            Opcode::LDR
        } else {
            match src.kind(4) {
                OpndKind::Imm8 | OpndKind::Reg => Opcode::MOV,
                _ => Opcode::LDIMM,
            }
        }
    }

    fn legalize_special(&self, f: &mut Func, iidx: InstrIdx) {
        let inst = f.instr(iidx).clone();
        if matches!(inst.opcode, Opcode::MOV | Opcode::VMOV) {
            if let (Some(dst), Some(src)) = (&inst.dst, &inst.src1) {
                let op = self.move_op(dst, src);
                if op != inst.opcode {
                    f.instr_mut(iidx).opcode = op;
                }
                if op == Opcode::STR || op == Opcode::VSTR {
                    // A store of memory or an immediate goes through a register.
                    if !src.is_reg() {
                        let t = temp(f, src.ty());
                        self.insert_move(f, iidx, t.clone(), src.clone());
                        f.instr_mut(iidx).src1 = Some(t);
                    }
                }
            }
        }
        for slot in [0, 1, 2] {
            let x = match slot {
                0 => f.instr(iidx).dst.clone(),
                1 => f.instr(iidx).src1.clone(),
                _ => f.instr(iidx).src2.clone(),
            };
            if let Some(new) = x.and_then(|x| self.rebase_memref(f, iidx, &x)) {
                let i = f.instr_mut(iidx);
                match slot {
                    0 => i.dst = Some(new),
                    1 => i.src1 = Some(new),
                    _ => i.src2 = Some(new),
                }
            }
        }
    }

    fn generate_smint_test(&self, f: &mut Func, before: InstrIdx, opnd: &Opnd, fail: InstrIdx) {
        if opnd.value_type().is_tagged_int() || tagged_payload(f, opnd).is_some() {
            return;
        }
        emit_cmp(f, before, Opcode::TST, opnd, &imm(1));
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
                let t = temp(f, Ty::Var);
                self.emit3(f, before, Opcode::AND, &t, a, b);
                emit_cmp(f, before, Opcode::TST, &t, &imm(1));
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
        let t = temp(f, Ty::Var);
        self.emit3(f, iidx, Opcode::SUB, &t, &a, &imm(1));
        self.emit3(f, iidx, Opcode::ADDS, &t, &t, &b);
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
        let t = temp(f, Ty::Var);
        self.emit3(f, iidx, Opcode::SUBS, &t, &a, &b);
        self.insert_branch(f, iidx, Some(Cond::Overflow), helper);
        self.emit3(f, iidx, Opcode::ORR, &t, &t, &imm(1));
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
        let x = self.load_payload(f, iidx, &a);
        let u = temp(f, Ty::I32);
        self.emit3(f, iidx, Opcode::SUB, &u, &b, &imm(1));
        let t = temp(f, Ty::I32);
        self.emit3(f, iidx, Opcode::SMULL, &t, &x, &u);
        self.emit_mul_overflow_check(f, iidx, &t, helper);
        let w = temp(f, Ty::Var);
        self.emit3(f, iidx, Opcode::ORR, &w, &a, &b);
        self.emit_negative_zero_check(f, iidx, &t, &w, helper);
        self.emit3(f, iidx, Opcode::ORR, &t, &t, &imm(1));
        self.insert_move(f, iidx, dst, t.with_ty(Ty::Var));
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
            Opcode::Shl => Opcode::LSL,
            Opcode::Shr => Opcode::ASR,
            Opcode::ShrU => Opcode::LSR,
            _ => return false,
        };
        self.generate_smint_pair_test(f, iidx, &a, &b, helper);
        let t = self.load_payload(f, iidx, &a);
        let count = match tagged_payload(f, &b) {
            Some(v) => imm(i64::from(v & 31)),
            None => {
                // Register-specified shifts use the bottom byte of the count, not five bits.
                let c = temp(f, Ty::I32);
                self.emit_untag_int(f, iidx, &c, &b);
                self.emit3(f, iidx, Opcode::AND, &c, &c, &imm(31));
                c
            }
        };
        self.emit3(f, iidx, op, &t, &t, &count);
        if op == Opcode::LSR {
            emit_cmp(f, iidx, Opcode::TST, &t, &t);
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
            Opcode::Or => Opcode::ORR,
            Opcode::Xor => Opcode::EOR,
            _ => return false,
        };
        self.generate_smint_pair_test(f, iidx, &a, &b, helper);
        let t = temp(f, Ty::Var);
        self.emit3(f, iidx, op, &t, &a, &b);
        if op == Opcode::EOR {
            self.emit3(f, iidx, Opcode::ORR, &t, &t, &imm(1));
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
        emit_cmp(f, iidx, Opcode::CMP, &a, &imm(1));
        self.insert_branch(f, iidx, Some(Cond::Eq), helper);
        // 2 - (2x + 1) = 2(-x) + 1
        let t = temp(f, Ty::Var);
        self.emit3(f, iidx, Opcode::RSBS, &t, &a, &imm(2));
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
        let t = temp(f, Ty::Var);
        emit(f, iidx, Opcode::MVN, Some(&t), &a, None);
        self.emit3(f, iidx, Opcode::ORR, &t, &t, &imm(1));
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
        emit_cmp(f, iidx, Opcode::CMP, &a, &b);
        self.insert_branch(f, iidx, Some(Cond::for_br(inst.opcode, false)), target);
        self.insert_branch(f, iidx, None, done);
        true
    }

    fn lower_int4_op(&self, f: &mut Func, iidx: InstrIdx, bail: Option<InstrIdx>) {
        let inst = f.instr(iidx).clone();
        let kind = bail.and(inst.bailout.map(|b| f.bailout(b).kind));
        let (Some(bail), Some(kind)) = (bail, kind) else {
            let i = f.instr_mut(iidx);
            i.bailout = None;
            match inst.opcode {
                Opcode::AddI4 => i.opcode = Opcode::ADD,
                Opcode::SubI4 => i.opcode = Opcode::SUB,
                Opcode::MulI4 => i.opcode = Opcode::MUL_ARM,
                Opcode::NegI4 => {
                    i.opcode = Opcode::RSB;
                    i.src2 = Some(imm(0));
                }
                x => panic!("{x} is not an int32 operation"),
            }
            return;
        };
        let dst = inst.dst.clone().unwrap();
        let a = inst.src1.clone().unwrap();
        let t = temp(f, Ty::I32);
        match inst.opcode {
            Opcode::AddI4 | Opcode::SubI4 => {
                let op = if inst.opcode == Opcode::AddI4 {
                    Opcode::ADDS
                } else {
                    Opcode::SUBS
                };
                self.emit3(f, iidx, op, &t, &a, inst.src2.as_ref().unwrap());
                if kind.contains(BailOutKind::ON_OVERFLOW) {
                    self.insert_branch(f, iidx, Some(Cond::Overflow), bail);
                }
            }
            Opcode::MulI4 => {
                let b = inst.src2.clone().unwrap();
                self.emit3(f, iidx, Opcode::SMULL, &t, &a, &b);
                if kind.contains(BailOutKind::ON_OVERFLOW)
                    || kind.contains(BailOutKind::ON_MUL_OVERFLOW)
                {
                    self.emit_mul_overflow_check(f, iidx, &t, bail);
                }
                if kind.contains(BailOutKind::ON_NEGATIVE_ZERO) {
                    let w = temp(f, Ty::I32);
                    self.emit3(f, iidx, Opcode::ORR, &w, &a, &b);
                    self.emit_negative_zero_check(f, iidx, &t, &w, bail);
                }
            }
            Opcode::NegI4 => {
                if kind.contains(BailOutKind::ON_NEGATIVE_ZERO) {
                    emit_cmp(f, iidx, Opcode::CMP, &a, &imm(0));
                    self.insert_branch(f, iidx, Some(Cond::Eq), bail);
                }
                self.emit3(f, iidx, Opcode::RSBS, &t, &a, &imm(0));
                if kind.contains(BailOutKind::ON_OVERFLOW) {
                    self.insert_branch(f, iidx, Some(Cond::Overflow), bail);
                }
            }
            x => panic!("{x} is not an int32 operation"),
        }
        self.insert_move(f, iidx, dst, t);
        f.unlink(iidx);
    }

    fn lower_int4_div(&self, f: &mut Func, iidx: InstrIdx, bail: Option<InstrIdx>) {
        let inst = f.instr(iidx).clone();
        let (helper, signed, is_rem) = match inst.opcode {
            Opcode::DivI4 => (HelperMethod::Int32Div, true, false),
            Opcode::RemI4 => (HelperMethod::Int32Rem, true, true),
            Opcode::DivU4 => (HelperMethod::UInt32Div, false, false),
            Opcode::RemU4 => (HelperMethod::UInt32Rem, false, true),
            x => panic!("{x} is not a division"),
        };
        let dst = inst.dst.clone().unwrap();
        let n = inst.src1.clone().unwrap();
        let mut d = inst.src2.clone().unwrap();
        let kind = bail.and(inst.bailout.map(|b| f.bailout(b).kind));
        if let (Some(bail), Some(kind)) = (bail, kind) {
            if !d.is_reg() {
                let t = temp(f, Ty::I32);
                self.insert_move(f, iidx, t.clone(), d);
                d = t;
            }
            emit_cmp(f, iidx, Opcode::CMP, &d, &imm(0));
            self.insert_branch(f, iidx, Some(Cond::Eq), bail);
            if signed {
                let ok = f.new_label(false);
                emit_cmp(f, iidx, Opcode::CMP, &d, &imm(-1));
                self.insert_branch(f, iidx, Some(Cond::Ne), ok);
                emit_cmp(f, iidx, Opcode::CMP, &n, &imm(i64::from(i32::MIN)));
                self.insert_branch(f, iidx, Some(Cond::Eq), bail);
                f.insert_before(iidx, ok);
                if !is_rem && kind.contains(BailOutKind::ON_NEGATIVE_ZERO) {
                    self.emit_negative_zero_check(f, iidx, &n, &d, bail);
                }
            }
            let r = temp(f, Ty::I32);
            self.lower_helper_call(f, iidx, helper, &[n.clone(), d.clone()], Some(r.clone()));
            if !is_rem && kind.contains(BailOutKind::ON_DIV_RESULT_NOT_INT) {
                let p = temp(f, Ty::I32);
                self.emit3(f, iidx, Opcode::MUL_ARM, &p, &r, &d);
                emit_cmp(f, iidx, Opcode::CMP, &p, &n);
                self.insert_branch(f, iidx, Some(Cond::Ne), bail);
            }
            if is_rem && signed && kind.contains(BailOutKind::ON_NEGATIVE_ZERO) {
                self.emit_negative_zero_check(f, iidx, &r, &n, bail);
            }
            self.insert_move(f, iidx, dst, r);
        } else {
            self.lower_helper_call(f, iidx, helper, &[n, d], Some(dst));
        }
        f.unlink(iidx);
    }

    fn lower_typed_cmp_branch(&self, f: &mut Func, iidx: InstrIdx) {
        let inst = f.instr(iidx).clone();
        let a = inst.src1.clone().unwrap();
        let b = inst.src2.clone().unwrap();
        let op = if a.ty().is_float() {
            emit_cmp(f, iidx, Opcode::VCMP, &a, &b);
            // An unordered comparison sets C and V: only BNE may be taken.
            match inst.opcode {
                Opcode::BrLt => Opcode::BMI,
                Opcode::BrLe => Opcode::BLS,
                Opcode::BrGt => Opcode::BGT,
                Opcode::BrGe => Opcode::BGE,
                Opcode::BrEq => Opcode::BEQ,
                Opcode::BrNeq => Opcode::BNE,
                x => panic!("{x} is not a compare-and-branch"),
            }
        } else {
            emit_cmp(f, iidx, Opcode::CMP, &a, &b);
            self.branch_op(Cond::for_br(inst.opcode, a.ty().is_unsigned()))
        };
        let i = f.instr_mut(iidx);
        i.opcode = op;
        i.src1 = None;
        i.src2 = None;
        i.bailout = None;
    }

    fn lower_float_op(&self, f: &mut Func, iidx: InstrIdx) {
        let op = match f.instr(iidx).opcode {
            Opcode::AddF => Opcode::VADD,
            Opcode::SubF => Opcode::VSUB,
            Opcode::MulF => Opcode::VMUL,
            Opcode::DivF => Opcode::VDIV,
            Opcode::ToFloat => Opcode::VCVT_F64_S32,
            x => panic!("{x} is not a float operation"),
        };
        f.instr_mut(iidx).opcode = op;
    }

    fn emit_untag_int(&self, f: &mut Func, before: InstrIdx, dst: &Opnd, src: &Opnd) {
        self.emit3(f, before, Opcode::ASR, dst, &src.with_ty(dst.ty()), &imm(1));
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

    fn emit_call(
        &self,
        f: &mut Func,
        before: InstrIdx,
        target: Opnd,
        dst: Option<Opnd>,
        pushed: u32,
    ) -> InstrIdx {
        debug_assert_eq!(pushed, 0);
        let call = match target {
            Opnd::HelperCall(_) => {
                f.insert_instr_before(before, Instr::new(Opcode::BL).with_src1(target))
            }
            Opnd::Reg(_) => f.insert_instr_before(before, Instr::new(Opcode::BLX).with_src1(target)),
            x => {
                let r12 = self.word(f, ArmReg::R12);
                self.insert_move(f, before, r12.clone(), x);
                f.insert_instr_before(before, Instr::new(Opcode::BLX).with_src1(r12))
            }
        };
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
        let saved = self.saved_regs(f, &CALLEE_SAVED);
        let saved_d = self.saved_regs(f, &CALLEE_SAVED_D);
        let pushed = 8
            + 4 * u32::try_from(saved.len()).unwrap()
            + 8 * u32::try_from(saved_d.len()).unwrap();
        let args_area = f.frame.arg_slots_for_functions_called * 4;
        let total = (pushed
            + f.frame.local_stack_height
            + f.frame.max_inlinee_argout_size
            + args_area)
            .next_multiple_of(self.stack_align());
        if total > MAX_FRAME_SIZE {
            return Err(AbortReason::FrameTooLarge { size: total });
        }
        let geom = FrameGeometry {
            pushed,
            alloc: total - pushed,
        };
        f.frame.saved_reg_size = pushed - 8;
        f.shift_locals(f.frame.saved_reg_size);
        f.frame.args_size = args_area;
        f.frame.frame_size = total;

        let at = f.next(f.head()).unwrap();
        let sp = self.word(f, ArmReg::SP);
        let fp = self.word(f, ArmReg::R11);
        let lr = self.word(f, ArmReg::LR);
        f.insert_instr_before(at, Instr::pragma(Opcode::PrologStart));
        emit(f, at, Opcode::PUSH, None, &lr, None);
        emit(f, at, Opcode::PUSH, None, &fp, None);
        self.insert_move(f, at, fp, sp.clone());
        if needs_stack_probe(f, total) {
            self.generate_prologue_stack_probe(f, at, total);
        }
        for r in &saved {
            emit(f, at, Opcode::PUSH, None, &Opnd::Reg(RegOpnd::phys(r.regidx(), Ty::MachPtr)), None);
        }
        for d in &saved_d {
            emit(f, at, Opcode::VPUSH, None, &Opnd::Reg(RegOpnd::phys(d.regidx(), Ty::F64)), None);
        }
        if geom.alloc >= PAGE_SIZE {
            let r12 = self.word(f, ArmReg::R12);
            self.insert_move(f, at, r12.clone(), imm(i64::from(geom.alloc)));
            emit(f, at, Opcode::BL, None, &Opnd::helper(HelperMethod::CRT_chkstk), None);
            self.emit3(f, at, Opcode::SUB, &sp, &sp, &r12);
        } else if geom.alloc > 0 {
            self.emit3(f, at, Opcode::SUB, &sp, &sp, &imm(i64::from(geom.alloc)));
        }
        if !zeroed.is_empty() {
            let r12 = self.word(f, ArmReg::R12);
            self.insert_move(f, at, r12.clone(), imm(0));
            for s in zeroed {
                self.insert_move(f, at, Opnd::Sym(SymOpnd::new(s, Ty::MachPtr)), r12.clone());
            }
        }
        f.insert_instr_before(at, Instr::pragma(Opcode::PrologEnd));
        Ok(geom)
    }

    fn lower_exit_instr(&self, f: &mut Func, epilog: InstrIdx, geom: &FrameGeometry) {
        let at = f.next(epilog).unwrap();
        let sp = self.word(f, ArmReg::SP);
        let fp = self.word(f, ArmReg::R11);
        let lr = self.word(f, ArmReg::LR);
        if geom.alloc > 0 {
            self.emit3(f, at, Opcode::ADD, &sp, &sp, &imm(i64::from(geom.alloc)));
        }
        for d in self.saved_regs(f, &CALLEE_SAVED_D).iter().rev() {
            f.insert_instr_before(
                at,
                Instr::new(Opcode::VPOP).with_dst(Opnd::Reg(RegOpnd::phys(d.regidx(), Ty::F64))),
            );
        }
        for r in self.saved_regs(f, &CALLEE_SAVED).iter().rev() {
            f.insert_instr_before(
                at,
                Instr::new(Opcode::POP).with_dst(Opnd::Reg(RegOpnd::phys(r.regidx(), Ty::MachPtr))),
            );
        }
        f.insert_instr_before(at, Instr::new(Opcode::POP).with_dst(fp));
        f.insert_instr_before(at, Instr::new(Opcode::POP).with_dst(lr.clone()));
        emit(f, at, Opcode::BX, None, &lr, None);
    }

    fn generate_prologue_stack_probe(&self, f: &mut Func, before: InstrIdx, frame_size: u32) {
        let word = Ty::MachPtr;
        let r12 = self.word(f, ArmReg::R12);
        let sp = self.phys(ArmReg::SP, word);
        let size = u64::from(frame_size + MIN_STACK_JIT);
        let helper = f.new_label(true);
        let done = f.new_label(false);
        if f.tctx.thread_bound {
            let limit = f.tctx.script_stack_limit.wrapping_add(size);
            self.insert_move(f, before, r12.clone(), word_imm(f, limit as i64));
        } else {
            self.insert_move(f, before, r12.clone(), stack_limit_opnd(f));
            self.emit3(f, before, Opcode::ADDS, &r12, &r12, &word_imm(f, size as i64));
            if f.tctx.interrupt_probe {
                // Carry is set when adding the frame size to the limit wraps.
                self.insert_branch(f, before, Some(Cond::Ae), helper);
            }
        }
        emit_cmp(f, before, Opcode::CMP, &sp, &r12);
        self.insert_branch(f, before, Some(Cond::A), done);
        f.insert_before(before, helper);

        let saved = self
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
        // The frame pointer has been pushed with the return address, so the stack is aligned
        // before the argument registers are saved.
        let pad = u32::try_from(saved.len()).unwrap() % 2 * 4;
        if pad > 0 {
            self.emit3(f, before, Opcode::SUB, &sp, &sp, &imm(i64::from(pad)));
        }
        let args = [word_imm(f, i64::from(frame_size)), script_context_opnd(f)];
        let locs = self.arg_locs(&[ArgKind::Int, ArgKind::Int]);
        self.place_call_args(f, before, &args, &locs);
        self.emit_call(
            f,
            before,
            Opnd::helper(HelperMethod::ProbeCurrentStack),
            None,
            0,
        );
        if pad > 0 {
            self.emit3(f, before, Opcode::ADD, &sp, &sp, &imm(i64::from(pad)));
        }
        for r in saved.iter().rev() {
            f.insert_instr_before(
                before,
                Instr::new(Opcode::POP).with_dst(Opnd::Reg(RegOpnd::phys(*r, word))),
            );
        }
        f.insert_before(before, done);
    }

    fn lower_interrupt_probe(&self, f: &mut Func, iidx: InstrIdx) {
        let t = temp(f, Ty::MachPtr);
        let sp = self.phys(ArmReg::SP, Ty::MachPtr);
        self.insert_move(f, iidx, t.clone(), stack_limit_opnd(f));
        emit_cmp(f, iidx, Opcode::CMP, &sp, &t);
        let helper = f.new_label(true);
        let done = f.new_label(false);
        self.insert_branch(f, iidx, Some(Cond::A), done);
        f.insert_before(iidx, helper);
        let args = [word_imm(f, 0), script_context_opnd(f)];
        self.lower_helper_call(f, iidx, HelperMethod::ProbeCurrentStack, &args, None);
        f.insert_before(iidx, done);
        f.unlink(iidx);
    }

    fn lower_eh_region_return(&self, f: &mut Func, before: InstrIdx, target: Opnd) {
        let r0 = self.word(f, ArmReg::R0);
        let r12 = self.word(f, ArmReg::R12);
        self.insert_move(f, before, r0, target);
        self.insert_move(
            f,
            before,
            r12.clone(),
            Opnd::helper(HelperMethod::Op_ReturnFromCallWithFakeFrame),
        );
        emit(f, before, Opcode::BX, None, &r12, None);
    }

    fn peephole_instr(&self, f: &mut Func, iidx: InstrIdx) -> bool {
        let inst = f.instr(iidx);
        match inst.opcode {
            Opcode::MOV | Opcode::VMOV => {
                let (Some(dst), Some(src)) = (&inst.dst, &inst.src1) else {
                    return false;
                };
                if dst.same_location(src) && dst.ty() == src.ty() {
                    f.unlink(iidx);
                    return true;
                }
                false
            }
            Opcode::B if inst.branch_target().is_some() && jumps_to_next_label(f, iidx) => {
                f.unlink(iidx);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn moves() {
        let md = Arm32;
        let r = Opnd::Reg(RegOpnd::phys(ArmReg::R4.regidx(), Ty::I32));
        let m = Opnd::Indir(IndirOpnd::new(
            RegOpnd::phys(ArmReg::SP.regidx(), Ty::MachPtr),
            4,
            Ty::I32,
        ));
        let d = Opnd::Reg(RegOpnd::phys(ArmReg::D1.regidx(), Ty::F64));
        assert_eq!(md.move_op(&r, &imm(5)), Opcode::MOV);
        assert_eq!(md.move_op(&r, &imm(0x1234)), Opcode::LDIMM);
        assert_eq!(md.move_op(&r, &m), Opcode::LDR);
        assert_eq!(md.move_op(&m, &r), Opcode::STR);
        assert_eq!(md.move_op(&d, &m.with_ty(Ty::F64)), Opcode::VLDR);
        assert_eq!(md.move_op(&d, &d), Opcode::VMOV);
        assert_eq!(
            md.move_op(&r, &Opnd::helper(HelperMethod::Int32Div)),
            Opcode::LDIMM
        );
    }

    #[test]
    fn clobbers() {
        let md = Arm32;
        let i = Instr::new(Opcode::SMULL);
        assert_eq!(md.implicit_clobbers(&i).as_slice(), &[ArmReg::R12.regidx()]);
        assert!(md.implicit_clobbers(&Instr::new(Opcode::ADDS)).is_empty());
    }
}
