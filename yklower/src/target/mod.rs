//! Target architectures.
//!
//! Everything the architecture-independent [crate::lower] code needs from a target is behind the
//! [TargetLowering] trait. Conceptually the trait has three layers:
//!
//! 1. Tables: legal operand forms per opcode, implicit register clobbers, the calling convention
//!    ([TargetLowering::arg_locs]). These are immutable data.
//! 2. The "MD" facade: tag tests, inline fast paths, int32 arithmetic, conversions. A fast-path
//!    generator returns `false` if it could not generate a fast path, in which case it must not
//!    have inserted anything and the caller falls back to a helper call.
//! 3. The "arch" primitives: calls, prolog/epilog, stack probes, exception-region returns. These
//!    differ per ABI even when the instruction set is shared.
//!
//! All four targets are always compiled: [Target::host] picks the one matching the build
//! configuration, but any [crate::ir::Func] can be lowered for any target.

use crate::{
    config::LowerOpts,
    helpers::HelperMethod,
    ir::{
        AddrKind, AddrOpnd, Func, IndirOpnd, Instr, InstrIdx, InstrKind, MemRefOpnd, Opcode, Opnd, OpndKind,
        OpndT, RegIdx, RegOpnd, SymKind, Ty,
    },
    lower::AbortReason,
    value::TagScheme,
};
use smallvec::SmallVec;
use std::{fmt::Debug, ops::BitOr};
use strum::Display;

pub(crate) mod arm;
pub(crate) mod magic;
pub(crate) mod x64;
pub(crate) mod x86;
mod x86_common;

pub use arm::ArmReg;
pub use x64::X64Reg;
pub use x86::X86Reg;

/// Code above this much stack use is always probed. Frames smaller than this in leaf functions
/// need no probe.
pub const MAX_STACK_SIZE_FOR_NO_PROBE: u32 = 0x400;
/// The stack headroom the runtime requires beyond a JIT frame.
pub const MIN_STACK_JIT: u32 = 0x2000;
/// Frames larger than this must be allocated a page at a time (via `CRT_chkstk`).
pub const PAGE_SIZE: u32 = 0x1000;
/// The largest frame whose unwind information we can encode.
pub const MAX_FRAME_SIZE: u32 = 1 << 20;
/// The largest number of outgoing arguments of a native call.
pub const MAX_NATIVE_CALL_ARGS: usize = 255;

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum Target {
    #[strum(to_string = "win-x64")]
    WinX64,
    #[strum(to_string = "sysv-x64")]
    SysVX64,
    #[strum(to_string = "x86")]
    X86,
    #[strum(to_string = "arm32")]
    Arm32,
}

impl Target {
    /// The target matching the build configuration.
    pub fn host() -> Self {
        if cfg!(all(target_arch = "x86_64", target_os = "windows")) {
            Target::WinX64
        } else if cfg!(target_arch = "x86_64") {
            Target::SysVX64
        } else if cfg!(target_arch = "x86") {
            Target::X86
        } else if cfg!(target_arch = "arm") {
            Target::Arm32
        } else {
            // Lowering for any target is possible anywhere; default to the most common.
            Target::SysVX64
        }
    }

    pub fn ptr_size(self) -> u32 {
        match self {
            Target::WinX64 | Target::SysVX64 => 8,
            Target::X86 | Target::Arm32 => 4,
        }
    }

    pub fn tag_scheme(self) -> TagScheme {
        match self {
            Target::WinX64 | Target::SysVX64 => TagScheme::Atom64,
            Target::X86 | Target::Arm32 => TagScheme::LowBit32,
        }
    }

    pub fn is_x86_family(self) -> bool {
        self != Target::Arm32
    }

    pub fn reg_name(self, reg: RegIdx) -> &'static str {
        match self {
            Target::WinX64 | Target::SysVX64 => X64Reg::from_regidx(reg).name(),
            Target::X86 => X86Reg::from_regidx(reg).name(),
            Target::Arm32 => ArmReg::from_regidx(reg).name(),
        }
    }

    pub fn reg_is_float(self, reg: RegIdx) -> bool {
        match self {
            Target::WinX64 | Target::SysVX64 => X64Reg::from_regidx(reg).is_float(),
            Target::X86 => X86Reg::from_regidx(reg).is_float(),
            Target::Arm32 => ArmReg::from_regidx(reg).is_float(),
        }
    }

    /// The physical registers a call to `target` may use for arguments, in the order of
    /// [TargetLowering::arg_locs].
    pub fn arg_locs(self, kinds: &[ArgKind]) -> Vec<ArgLoc> {
        match self {
            Target::WinX64 => x64::X64::<x64::WinX64>::new().arg_locs(kinds),
            Target::SysVX64 => x64::X64::<x64::SysVX64>::new().arg_locs(kinds),
            Target::X86 => x86::X86.arg_locs(kinds),
            Target::Arm32 => arm::Arm32.arg_locs(kinds),
        }
    }
}

/// A physical register of some target.
pub trait RegT: Copy + Debug + PartialEq + 'static {
    /// Make a register from an index.
    ///
    /// # Panics
    ///
    /// If `idx` does not name a register of this target.
    fn from_regidx(idx: RegIdx) -> Self;
    fn regidx(self) -> RegIdx;
    fn name(self) -> &'static str;
    fn is_float(self) -> bool;
}

/// How an argument is passed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    /// An integer or pointer, up to one machine word.
    Int,
    /// A double.
    Float,
}

impl ArgKind {
    pub fn of(ty: Ty) -> Self {
        if ty.is_float() {
            ArgKind::Float
        } else {
            ArgKind::Int
        }
    }
}

/// Where an argument lives at the moment of the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgLoc {
    Reg(RegIdx),
    /// At this byte offset from the stack pointer (just before the call pushes a return address).
    Stack(u32),
}

/// A set of [OpndKind]s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LegalForms(u8);

impl LegalForms {
    pub const NONE: Self = Self(0);
    pub const REG: Self = Self(1);
    pub const MEM: Self = Self(1 << 1);
    pub const IMM8: Self = Self(1 << 2);
    /// 32-bit immediates. Tables always include [Self::IMM8] alongside this.
    pub const IMM32: Self = Self(1 << 3);
    pub const IMM64: Self = Self(1 << 4);
    pub const HELPER: Self = Self(1 << 5);
    pub const LABEL: Self = Self(1 << 6);

    pub const REG_MEM: Self = Self(Self::REG.0 | Self::MEM.0);
    pub const IMM: Self = Self(Self::IMM8.0 | Self::IMM32.0);
    pub const REG_IMM: Self = Self(Self::REG.0 | Self::IMM.0);
    pub const REG_MEM_IMM: Self = Self(Self::REG_MEM.0 | Self::IMM.0);

    pub fn contains_kind(self, kind: OpndKind) -> bool {
        let bit = match kind {
            OpndKind::Reg => Self::REG,
            OpndKind::Mem => Self::MEM,
            OpndKind::Imm8 => Self::IMM8,
            OpndKind::Imm32 => Self::IMM32,
            OpndKind::Imm64 => Self::IMM64,
            // Floating-point constants are never directly encodable: they live in memory.
            OpndKind::FloatConst => return false,
            OpndKind::Helper => Self::HELPER,
            OpndKind::Label => Self::LABEL,
        };
        self.0 & bit.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The kinds in this set.
    pub fn kinds(self) -> impl Iterator<Item = OpndKind> {
        [
            OpndKind::Reg,
            OpndKind::Mem,
            OpndKind::Imm8,
            OpndKind::Imm32,
            OpndKind::Imm64,
            OpndKind::Helper,
            OpndKind::Label,
        ]
        .into_iter()
        .filter(move |k| self.contains_kind(*k))
    }
}

impl BitOr for LegalForms {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The legal forms of one opcode's operand slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpForms {
    pub dst: LegalForms,
    pub src1: LegalForms,
    pub src2: LegalForms,
    /// Must `dst` and `src1` be the same location (x86-style two-address form)?
    pub two_address: bool,
    /// May at most one operand be in memory?
    pub one_mem: bool,
}

impl OpForms {
    pub const fn new(dst: LegalForms, src1: LegalForms, src2: LegalForms) -> Self {
        Self {
            dst,
            src1,
            src2,
            two_address: false,
            one_mem: true,
        }
    }

    pub const fn two_address(mut self) -> Self {
        self.two_address = true;
        self
    }

    pub fn slot(&self, slot: Slot) -> LegalForms {
        match slot {
            Slot::Dst => self.dst,
            Slot::Src1 => self.src1,
            Slot::Src2 => self.src2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Slot {
    Dst,
    Src1,
    Src2,
}

/// Conditions for conditional branches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned `<`.
    B,
    /// Unsigned `<=`.
    Be,
    /// Unsigned `>`.
    A,
    /// Unsigned `>=`.
    Ae,
    Overflow,
    NoOverflow,
    /// The sign flag is set.
    Sign,
    NotSign,
}

impl Cond {
    /// The condition for a high-level compare-and-branch opcode.
    pub fn for_br(op: Opcode, unsigned: bool) -> Self {
        match (op, unsigned) {
            (Opcode::BrEq, _) => Cond::Eq,
            (Opcode::BrNeq, _) => Cond::Ne,
            (Opcode::BrLt, false) => Cond::Lt,
            (Opcode::BrLe, false) => Cond::Le,
            (Opcode::BrGt, false) => Cond::Gt,
            (Opcode::BrGe, false) => Cond::Ge,
            (Opcode::BrLt, true) => Cond::B,
            (Opcode::BrLe, true) => Cond::Be,
            (Opcode::BrGt, true) => Cond::A,
            (Opcode::BrGe, true) => Cond::Ae,
            _ => panic!("{op} is not a compare-and-branch"),
        }
    }
}

/// The frame geometry computed by a target's prolog.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameGeometry {
    /// Bytes pushed before the stack allocation (return address, frame pointer, callee-saved
    /// registers).
    pub pushed: u32,
    /// Bytes allocated by the single stack-allocation instruction.
    pub alloc: u32,
}

impl FrameGeometry {
    pub fn total(&self) -> u32 {
        self.pushed + self.alloc
    }
}

/// Does a function with the given frame need a prologue stack probe?
pub fn needs_stack_probe(f: &Func, frame_size: u32) -> bool {
    f.has_calls || frame_size >= MAX_STACK_SIZE_FOR_NO_PROBE
}

/// The operand naming the script context of `f`.
pub fn script_context_opnd(f: &Func) -> Opnd {
    Opnd::Addr(AddrOpnd {
        addr: f.tctx.script_context_addr,
        kind: AddrKind::ScriptContext,
        ty: Ty::MachPtr,
    })
}

/// A machine-word immediate.
pub fn word_imm(f: &Func, value: i64) -> Opnd {
    Opnd::int(value, if f.ptr_size() == 8 { Ty::I64 } else { Ty::I32 })
}

/// A tagged-int constant in `f`'s target encoding.
///
/// # Panics
///
/// If `value` does not fit in a tagged int.
pub fn tagged_int_opnd(f: &Func, value: i64) -> Opnd {
    let addr = f
        .target
        .tag_scheme()
        .tag_int(value)
        .unwrap_or_else(|| panic!("{value} is not representable as a tagged int"));
    Opnd::Addr(AddrOpnd {
        addr,
        kind: AddrKind::TaggedInt,
        ty: Ty::Var,
    })
}

/// If `opnd` is a tagged-int constant, return its payload.
pub fn tagged_payload(f: &Func, opnd: &Opnd) -> Option<i32> {
    match opnd {
        Opnd::Addr(AddrOpnd {
            addr,
            kind: AddrKind::TaggedInt,
            ..
        }) => f.target.tag_scheme().untag_int(*addr),
        _ => None,
    }
}

/// The current stack limit: a constant for thread-bound code, otherwise the contents of the
/// thread's limit cell.
pub fn stack_limit_opnd(f: &Func) -> Opnd {
    if f.tctx.thread_bound {
        word_imm(f, f.tctx.script_stack_limit as i64)
    } else {
        Opnd::MemRef(MemRefOpnd {
            addr: f.tctx.stack_limit_addr,
            ty: Ty::MachPtr,
        })
    }
}

/// The destination and sources of the binary operation `iidx`, if it has all three.
pub(crate) fn binop_opnds(f: &Func, iidx: InstrIdx) -> Option<(Opnd, Opnd, Opnd)> {
    let inst = f.instr(iidx);
    Some((
        inst.dst.clone()?,
        inst.src1.clone()?,
        inst.src2.clone()?,
    ))
}

/// Could the tagged value `x` be a tagged int?
pub(crate) fn may_be_tagged(x: &Opnd) -> bool {
    match x {
        Opnd::Addr(a) => a.kind == AddrKind::TaggedInt,
        Opnd::IntConst(_) | Opnd::FloatConst(_) | Opnd::HelperCall(_) | Opnd::Label(_) => false,
        Opnd::Reg(_) | Opnd::Sym(_) | Opnd::Indir(_) | Opnd::MemRef(_) => {
            !x.value_type().is_definitely_not_number()
        }
    }
}

/// The kinds of `f`'s incoming parameters: all are tagged values.
pub fn param_kinds(f: &Func) -> Vec<ArgKind> {
    vec![ArgKind::Int; usize::from(f.flags.param_count)]
}

/// A reference to the stack slot `off` bytes above the stack pointer.
pub fn sp_slot<T: TargetLowering + ?Sized>(md: &T, off: u32, ty: Ty) -> Opnd {
    Opnd::Indir(IndirOpnd::new(
        RegOpnd::phys(md.reg_sp().regidx(), Ty::MachPtr),
        i32::try_from(off).unwrap(),
        ty,
    ))
}

/// Insert `dst = op src1, src2` before `before`.
pub(crate) fn emit(
    f: &mut Func,
    before: InstrIdx,
    op: Opcode,
    dst: Option<&Opnd>,
    src1: &Opnd,
    src2: Option<&Opnd>,
) -> InstrIdx {
    let mut i = Instr::new(op).with_src1(src1.clone());
    if let Some(d) = dst {
        i = i.with_dst(d.clone());
    }
    if let Some(s) = src2 {
        i = i.with_src2(s.clone());
    }
    f.insert_instr_before(before, i)
}

/// Insert the two-address `x = op x, src`.
pub(crate) fn emit2(f: &mut Func, before: InstrIdx, op: Opcode, x: &Opnd, src: &Opnd) {
    emit(f, before, op, Some(x), x, Some(src));
}

/// Insert a flags-only `op a, b` (`CMP` or `TEST`).
pub(crate) fn emit_cmp(f: &mut Func, before: InstrIdx, op: Opcode, a: &Opnd, b: &Opnd) {
    emit(f, before, op, None, a, Some(b));
}

pub(crate) fn temp(f: &mut Func, ty: Ty) -> Opnd {
    Opnd::Reg(f.new_temp(ty))
}

/// The architecture-specific half of lowering. See the module documentation.
pub trait TargetLowering {
    type Reg: RegT;

    fn target(&self) -> Target;

    fn ptr_size(&self) -> u32 {
        self.target().ptr_size()
    }

    fn tag_scheme(&self) -> TagScheme {
        self.target().tag_scheme()
    }

    /// Stack pointer alignment at call boundaries.
    fn stack_align(&self) -> u32;

    // Registers

    fn reg_sp(&self) -> Self::Reg;
    fn reg_fp(&self) -> Self::Reg;
    /// The register a value of type `ty` is returned in.
    fn reg_return(&self, ty: Ty) -> Self::Reg;
    /// The callee-saved registers the prolog may have to save, in save order.
    fn callee_saved(&self) -> &'static [Self::Reg];

    fn phys(&self, reg: Self::Reg, ty: Ty) -> Opnd {
        Opnd::Reg(RegOpnd::phys(reg.regidx(), ty))
    }

    // Tables

    /// The legal operand forms of `opcode`, or `None` if this target does not have `opcode`.
    fn legal_forms(&self, opcode: Opcode) -> Option<OpForms>;

    /// The registers `inst` writes without naming them as operands.
    fn implicit_clobbers(&self, inst: &Instr) -> SmallVec<[RegIdx; 2]>;

    /// Where each argument of a call with argument kinds `kinds` is passed.
    fn arg_locs(&self, kinds: &[ArgKind]) -> Vec<ArgLoc>;

    /// How many bytes of outgoing-argument area a call with argument locations `locs` needs to
    /// have reserved in the frame.
    fn arg_area_size(&self, locs: &[ArgLoc], kinds: &[ArgKind]) -> u32 {
        locs.iter()
            .zip(kinds)
            .filter_map(|(l, k)| match l {
                ArgLoc::Stack(off) => Some(
                    off + match k {
                        ArgKind::Int => self.ptr_size(),
                        ArgKind::Float => 8,
                    },
                ),
                ArgLoc::Reg(_) => None,
            })
            .max()
            .unwrap_or(0)
    }

    fn branch_op(&self, cond: Cond) -> Opcode;

    /// The opcode that moves `src` into `dst`.
    fn move_op(&self, dst: &Opnd, src: &Opnd) -> Opcode;

    // Insertion primitives

    fn insert_move(&self, f: &mut Func, before: InstrIdx, dst: Opnd, src: Opnd) -> InstrIdx {
        let op = self.move_op(&dst, &src);
        f.insert_instr_before(before, Instr::new(op).with_dst(dst).with_src1(src))
    }

    /// Insert a branch to `target`: unconditional if `cond` is `None`.
    fn insert_branch(
        &self,
        f: &mut Func,
        before: InstrIdx,
        cond: Option<Cond>,
        target: InstrIdx,
    ) -> InstrIdx {
        let op = match cond {
            Some(c) => self.branch_op(c),
            None => self.branch_op_uncond(),
        };
        f.insert_instr_before(before, Instr::branch(op, target))
    }

    fn branch_op_uncond(&self) -> Opcode;

    /// The opcode of a branch to the address in a register.
    fn branch_op_indirect(&self) -> Opcode {
        self.branch_op_uncond()
    }

    /// Insert a branch to the address in `addr`.
    fn insert_indirect_branch(&self, f: &mut Func, before: InstrIdx, addr: Opnd) -> InstrIdx {
        let mut i = Instr::new(self.branch_op_indirect()).with_src1(addr);
        i.kind = InstrKind::Branch(None);
        f.insert_instr_before(before, i)
    }

    /// Target-specific legalization, run before the generic legal-forms walk. This is where
    /// fixed-register constraints (e.g. x86 shift counts in `CL`) and opcode selection by operand
    /// form (e.g. ARM `MOV` from memory becoming `LDR`) are handled.
    fn legalize_special(&self, _f: &mut Func, _iidx: InstrIdx) {}

    // The MD facade

    /// Turn a high-level `Ld`/`LdC` into a machine move.
    fn change_to_assign(&self, f: &mut Func, iidx: InstrIdx) {
        let inst = f.instr(iidx);
        let op = self.move_op(inst.dst.as_ref().unwrap(), inst.src1.as_ref().unwrap());
        f.instr_mut(iidx).opcode = op;
    }

    /// Branch to `fail` unless `opnd` is a tagged int.
    fn generate_smint_test(&self, f: &mut Func, before: InstrIdx, opnd: &Opnd, fail: InstrIdx);

    /// Branch to `fail` unless both `a` and `b` are tagged ints.
    fn generate_smint_pair_test(
        &self,
        f: &mut Func,
        before: InstrIdx,
        a: &Opnd,
        b: &Opnd,
        fail: InstrIdx,
    );

    /// Inline tagged-int `Add` with an overflow check. On any guard failure, branch to `helper`.
    fn generate_fast_add(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool;
    fn generate_fast_sub(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool;
    fn generate_fast_mul(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool;
    /// `Shl`, `Shr` and `ShrU`.
    fn generate_fast_shift(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool;
    /// `And`, `Or` and `Xor`.
    fn generate_fast_bitwise(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool;
    fn generate_fast_neg(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool;
    fn generate_fast_not(&self, f: &mut Func, iidx: InstrIdx, helper: InstrIdx) -> bool;
    /// A compare-and-branch on two tagged ints: branch to the instruction's target if the
    /// comparison holds, fall through to `done` (via a jump) otherwise.
    fn generate_fast_cmp_branch(
        &self,
        f: &mut Func,
        iidx: InstrIdx,
        helper: InstrIdx,
        done: InstrIdx,
    ) -> bool;

    /// Strength-reduce an int32 division or remainder by a constant. On success the instruction
    /// at `iidx` has been removed.
    fn generate_fast_div_and_rem(
        &self,
        _f: &mut Func,
        _iidx: InstrIdx,
        _bail: Option<InstrIdx>,
    ) -> bool {
        false
    }

    /// Lower `AddI4`, `SubI4`, `MulI4`, `NegI4`. If `bail` is `Some`, branch to it on the result
    /// conditions in the instruction's bailout kind, leaving the destination (and so the sources)
    /// unmodified.
    fn lower_int4_op(&self, f: &mut Func, iidx: InstrIdx, bail: Option<InstrIdx>);

    /// Lower `DivI4`, `RemI4`, `DivU4`, `RemU4` without strength reduction.
    fn lower_int4_div(&self, f: &mut Func, iidx: InstrIdx, bail: Option<InstrIdx>);

    /// Lower a compare-and-branch on int32 or float operands.
    fn lower_typed_cmp_branch(&self, f: &mut Func, iidx: InstrIdx);

    /// Lower `AddF`, `SubF`, `MulF`, `DivF`, `ToFloat`.
    fn lower_float_op(&self, f: &mut Func, iidx: InstrIdx);

    /// `dst = payload of src`, where `src` is known to be a tagged int.
    fn emit_untag_int(&self, f: &mut Func, before: InstrIdx, dst: &Opnd, src: &Opnd);

    /// `dst = tagged src`. If the tag scheme cannot represent every int32, branch to `overflow`
    /// (which must then be `Some`) when `src` is out of range, leaving `dst` unmodified.
    fn emit_tag_int(
        &self,
        f: &mut Func,
        before: InstrIdx,
        dst: &Opnd,
        src: &Opnd,
        overflow: Option<InstrIdx>,
    );

    /// Lower `FromVar`: convert a tagged value to an int32. A tagged int is untagged inline;
    /// anything else takes the bailout `bail` if there is one, and otherwise calls
    /// `Conv_ToInt32`. Aborts if that call is needed but `opts` forbid helper fallback.
    fn emit_load_int32(
        &self,
        f: &mut Func,
        iidx: InstrIdx,
        bail: Option<InstrIdx>,
        opts: &LowerOpts,
    ) -> Result<(), AbortReason> {
        let inst = f.instr(iidx).clone();
        let dst = inst.dst.clone().unwrap();
        let src = inst.src1.clone().unwrap();
        if let Some(v) = tagged_payload(f, &src) {
            self.insert_move(f, iidx, dst, Opnd::int(i64::from(v), Ty::I32));
        } else if src.value_type().is_tagged_int() {
            self.emit_untag_int(f, iidx, &dst, &src);
        } else if let Some(bail) = bail {
            self.generate_smint_test(f, iidx, &src, bail);
            self.emit_untag_int(f, iidx, &dst, &src);
        } else {
            if !opts.helper_fallback {
                return Err(AbortReason::HelperFallbackDisabled { op: inst.opcode });
            }
            let done = f.new_label(false);
            if opts.fast_paths && may_be_tagged(&src) {
                let helper = f.new_label(true);
                self.generate_smint_test(f, iidx, &src, helper);
                self.emit_untag_int(f, iidx, &dst, &src);
                self.insert_branch(f, iidx, None, done);
                f.insert_before(iidx, helper);
            }
            let args = [src, script_context_opnd(f)];
            self.lower_helper_call(f, iidx, HelperMethod::Conv_ToInt32, &args, Some(dst));
            f.insert_before(iidx, done);
        }
        f.unlink(iidx);
        Ok(())
    }

    /// Lower `ToVar`: convert an int32 to a tagged value. Where the tag scheme cannot represent
    /// every int32, out-of-range values are boxed by `Op_Int32ToAtom`; aborts if that call is
    /// needed but `opts` forbid helper fallback.
    fn emit_load_var(
        &self,
        f: &mut Func,
        iidx: InstrIdx,
        opts: &LowerOpts,
    ) -> Result<(), AbortReason> {
        let inst = f.instr(iidx).clone();
        let dst = inst.dst.clone().unwrap();
        let src = inst.src1.clone().unwrap();
        match src.int_value() {
            Some(v) if matches!(src, Opnd::IntConst(_)) && self.tag_scheme().fits(v) => {
                let c = tagged_int_opnd(f, v);
                self.insert_move(f, iidx, dst, c);
            }
            _ if self.tag_scheme().fits(i64::from(i32::MIN)) => {
                self.emit_tag_int(f, iidx, &dst, &src, None);
            }
            _ => {
                if !opts.helper_fallback {
                    return Err(AbortReason::HelperFallbackDisabled { op: inst.opcode });
                }
                let done = f.new_label(false);
                if opts.fast_paths {
                    let helper = f.new_label(true);
                    self.emit_tag_int(f, iidx, &dst, &src, Some(helper));
                    self.insert_branch(f, iidx, None, done);
                    f.insert_before(iidx, helper);
                }
                let args = [src, script_context_opnd(f)];
                self.lower_helper_call(f, iidx, HelperMethod::Op_Int32ToAtom, &args, Some(dst));
                f.insert_before(iidx, done);
            }
        }
        f.unlink(iidx);
        Ok(())
    }

    // Arch primitives

    /// Move each of `args` to its location in `locs`. Returns the number of bytes pushed (which
    /// the caller pops after the call).
    fn place_call_args(&self, f: &mut Func, before: InstrIdx, args: &[Opnd], locs: &[ArgLoc]) -> u32 {
        // Arguments are loaded last to first.
        for (a, l) in args.iter().zip(locs).rev() {
            let dst = match l {
                ArgLoc::Reg(r) => Opnd::Reg(RegOpnd::phys(*r, a.ty())),
                ArgLoc::Stack(off) => sp_slot(self, *off, a.ty()),
            };
            self.insert_move(f, before, dst, a.clone());
        }
        0
    }

    /// Emit the call instruction itself, any cleanup of `pushed` bytes, and the move of the
    /// result to `dst`. Returns the call instruction.
    fn emit_call(
        &self,
        f: &mut Func,
        before: InstrIdx,
        target: Opnd,
        dst: Option<Opnd>,
        pushed: u32,
    ) -> InstrIdx;

    /// Lower a call to `target` with `args`, placing the result (if any) in `dst`. Returns the
    /// call instruction.
    fn lower_call(
        &self,
        f: &mut Func,
        before: InstrIdx,
        target: Opnd,
        args: &[Opnd],
        dst: Option<Opnd>,
    ) -> InstrIdx {
        let kinds = args.iter().map(|x| ArgKind::of(x.ty())).collect::<Vec<_>>();
        let locs = self.arg_locs(&kinds);
        let area = self.arg_area_size(&locs, &kinds);
        let slots = area.div_ceil(self.ptr_size());
        f.frame.arg_slots_for_functions_called = f.frame.arg_slots_for_functions_called.max(slots);
        f.has_calls = true;
        let pushed = self.place_call_args(f, before, args, &locs);
        self.emit_call(f, before, target, dst, pushed)
    }

    /// Lower a call to the runtime helper `helper`.
    ///
    /// # Panics
    ///
    /// If `args` does not match the helper's arity.
    fn lower_helper_call(
        &self,
        f: &mut Func,
        before: InstrIdx,
        helper: HelperMethod,
        args: &[Opnd],
        dst: Option<Opnd>,
    ) -> InstrIdx {
        assert_eq!(
            args.len(),
            helper.arg_count(),
            "{helper} takes {} arguments",
            helper.arg_count()
        );
        self.lower_call(f, before, Opnd::helper(helper), args, dst)
    }

    /// Lower `dst = ArgIn n`: load the `n`th incoming argument.
    fn lower_arg_in(&self, f: &mut Func, iidx: InstrIdx) {
        let inst = f.instr(iidx);
        let dst = inst.dst.clone().unwrap();
        let n = match inst.src1.as_ref() {
            Some(Opnd::Sym(s)) => match f.sym(s.sym).kind {
                SymKind::Param(n) => usize::from(n),
                _ => panic!("ArgIn source must be a parameter"),
            },
            _ => panic!("ArgIn source must be a parameter"),
        };
        let kinds = vec![ArgKind::Int; usize::from(f.flags.param_count).max(n + 1)];
        let src = match self.arg_locs(&kinds)[n] {
            ArgLoc::Reg(r) => Opnd::Reg(RegOpnd::phys(r, dst.ty())),
            ArgLoc::Stack(off) => Opnd::Indir(IndirOpnd::new(
                RegOpnd::phys(self.reg_fp().regidx(), Ty::MachPtr),
                i32::try_from(2 * self.ptr_size() + off).unwrap(),
                dst.ty(),
            )),
        };
        self.insert_move(f, iidx, dst, src);
        f.unlink(iidx);
    }

    /// Insert the prolog after the function's entry. Aborts if the frame is too large.
    fn lower_entry_instr(&self, f: &mut Func) -> Result<FrameGeometry, AbortReason>;

    /// Insert the epilog after the label `epilog`.
    fn lower_exit_instr(&self, f: &mut Func, epilog: InstrIdx, geom: &FrameGeometry);

    /// Insert a stack-overflow check before `before` for a frame of `frame_size` bytes.
    fn generate_prologue_stack_probe(&self, f: &mut Func, before: InstrIdx, frame_size: u32);

    /// Lower `InterruptProbe`: a stack-limit check at the top of a loop.
    fn lower_interrupt_probe(&self, f: &mut Func, iidx: InstrIdx);

    /// Return from the current exception region to its runtime helper, which continues at
    /// `target` (a label address, or zero for "no continuation").
    fn lower_eh_region_return(&self, f: &mut Func, before: InstrIdx, target: Opnd);

    // Peephole

    /// Rewrite `iidx` in place. Returns `true` if the instruction was removed.
    fn peephole_instr(&self, f: &mut Func, iidx: InstrIdx) -> bool;
}
