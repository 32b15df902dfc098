//! The architecture-independent half of lowering.
//!
//! [lower_func] takes an [ir::Func](crate::ir::Func) using high-level opcodes and drives it
//! through the whole pipeline for the function's target:
//!
//!  1. The [Lowerer] makes a single pass over the instruction list, replacing every high-level
//!     instruction with machine instructions. Where the architecture matters it calls into the
//!     target's [TargetLowering] implementation.
//!  2. Bailout paths, exception-region thunks and the generator epilog are emitted after the
//!     function body, then every stack-resident symbol is given a slot and the target inserts the
//!     prolog and epilog.
//!  3. The [legalizer](crate::legalize) makes every operand encodable.
//!  4. The [peephole pass](crate::peephole) tidies up and records implicit register clobbers.
//!
//! Lowering can fail in only a small number of well-defined ways (see [AbortReason]). Such
//! failures are not bugs: [Jit::compile] turns them into [CompileOutcome::InterpreterStub].
//! Malformed input IR, on the other hand, causes a panic.

use crate::{
    config::LowerOpts,
    helpers::HelperMethod,
    ir::{
        BailOutIdx, BailOutKind, Func, InstrIdx, Opcode, Opnd, OpndT, RegIdx, RegionIdx, SymIdx,
        SymOpnd, Ty,
    },
    legalize,
    log::{
        log_ir, should_log_ir,
        stats::{FuncCounts, Phase, Stats},
        IRPhase, Log, Verbosity,
    },
    peephole,
    target::{
        arm::Arm32,
        emit_cmp, may_be_tagged, script_context_opnd, tagged_payload, temp,
        x64::{SysVX64, WinX64, X64},
        x86::X86,
        Cond, FrameGeometry, Target, TargetLowering,
    },
    value::{TYPE_ID_NUMBER, TYPE_ID_OFFSET},
};
use smallvec::SmallVec;
use std::{error::Error, time::Instant};
use thiserror::Error;

mod bailout;
mod call;
mod eh;
mod generator;

pub use bailout::{bailout_for_record_addr, bailout_record_addr};

/// Why lowering a function was abandoned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AbortReason {
    #[error("frame of {size} bytes exceeds the unwind-encodable maximum")]
    FrameTooLarge { size: u32 },
    #[error("{op} needs a helper call but helper fallback is disabled")]
    HelperFallbackDisabled { op: Opcode },
    #[error("native call with {count} arguments")]
    TooManyArgs { count: usize },
}

/// A successfully lowered function, ready for register allocation.
#[derive(Debug)]
pub struct LoweredFunc {
    pub func: Func,
    pub frame: FrameGeometry,
    /// For each instruction that writes registers it does not name, those registers.
    pub implicit_clobbers: Vec<(InstrIdx, SmallVec<[RegIdx; 2]>)>,
}

/// The result of compiling one function.
#[derive(Debug)]
pub enum CompileOutcome {
    Lowered(LoweredFunc),
    /// Lowering aborted: the function runs in the interpreter via a trivial stub.
    InterpreterStub,
}

/// The entry point for compiling functions: owns the lowering policy, the log and statistics.
pub struct Jit {
    opts: LowerOpts,
    log: Log,
    stats: Stats,
}

impl Jit {
    /// Create a JIT configured from the environment (`YK_LOWER_*`, `YKD_LOG`, `YKD_LOG_STATS`).
    pub fn new() -> Result<Self, Box<dyn Error>> {
        Self::with_opts(LowerOpts::from_env()?)
    }

    pub fn with_opts(opts: LowerOpts) -> Result<Self, Box<dyn Error>> {
        crate::helpers::assert_table_well_formed();
        Ok(Self {
            opts,
            log: Log::new()?,
            stats: Stats::new(),
        })
    }

    pub fn opts(&self) -> &LowerOpts {
        &self.opts
    }

    /// Lower `f`. If lowering aborts, the abort is logged and the function is compiled as an
    /// interpreter stub instead.
    pub fn compile(&self, f: Func) -> CompileOutcome {
        let name = f.name.clone();
        self.log.log(
            Verbosity::LowerEvent,
            &format!("start lowering: {name} ({})", f.target),
        );
        match lower_with_stats(f, &self.opts, Some(&self.stats)) {
            Ok(x) => {
                self.log
                    .log(Verbosity::LowerEvent, &format!("stop lowering: {name}"));
                CompileOutcome::Lowered(x)
            }
            Err(e) => {
                self.stats.func_aborted();
                self.log.log(
                    Verbosity::Warning,
                    &format!("lowering aborted: {name}: {e}"),
                );
                CompileOutcome::InterpreterStub
            }
        }
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        self.stats.output();
    }
}

/// Lower `f` for its target.
pub fn lower_func(f: Func, opts: &LowerOpts) -> Result<LoweredFunc, AbortReason> {
    lower_with_stats(f, opts, None)
}

fn lower_with_stats(
    f: Func,
    opts: &LowerOpts,
    stats: Option<&Stats>,
) -> Result<LoweredFunc, AbortReason> {
    match f.target {
        Target::WinX64 => pipeline(&X64::<WinX64>::new(), f, opts, stats),
        Target::SysVX64 => pipeline(&X64::<SysVX64>::new(), f, opts, stats),
        Target::X86 => pipeline(&X86, f, opts, stats),
        Target::Arm32 => pipeline(&Arm32, f, opts, stats),
    }
}

fn log_phase(f: &Func, phase: IRPhase, name: &str) {
    if should_log_ir(phase) {
        log_ir(&format!("--- Begin {name} ---\n{f}\n--- End {name} ---\n"));
    }
}

pub(crate) fn pipeline<T: TargetLowering + ?Sized>(
    md: &T,
    f: Func,
    opts: &LowerOpts,
    stats: Option<&Stats>,
) -> Result<LoweredFunc, AbortReason> {
    assert_eq!(md.target(), f.target);
    #[cfg(any(debug_assertions, test))]
    f.assert_well_formed();
    log_phase(&f, IRPhase::PreLower, "lower-pre");

    let start = Instant::now();
    let (mut f, frame, counts) = Lowerer::new(md, f, opts).lower()?;
    if let Some(s) = stats {
        s.phase_done(Phase::Lowering, start);
    }
    log_phase(&f, IRPhase::PostLower, "lower-post");

    let start = Instant::now();
    legalize::legalize(md, &mut f);
    if let Some(s) = stats {
        s.phase_done(Phase::Legalizing, start);
    }
    log_phase(&f, IRPhase::Legalized, "lower-legalized");

    if opts.peephole {
        let start = Instant::now();
        peephole::peephole(md, &mut f);
        if let Some(s) = stats {
            s.phase_done(Phase::Peephole, start);
        }
        log_phase(&f, IRPhase::Peephole, "lower-peephole");
    }

    #[cfg(any(test, feature = "yk_lower_verify"))]
    if let Err(e) = crate::verify::check(md, &f) {
        panic!("lowering {} produced malformed code: {e}\n{f}", f.name);
    }

    let implicit_clobbers = peephole::implicit_clobbers(md, &f);
    if let Some(s) = stats {
        s.func_lowered_ok(&counts);
    }
    Ok(LoweredFunc {
        func: f,
        frame,
        implicit_clobbers,
    })
}

/// A bailout path waiting to be emitted after the function body.
struct PendingBail {
    bidx: BailOutIdx,
    label: InstrIdx,
    region: RegionIdx,
}

/// The architecture-independent lowerer for one function.
pub(crate) struct Lowerer<'a, T: TargetLowering + ?Sized> {
    md: &'a T,
    f: Func,
    opts: &'a LowerOpts,
    /// The label starting the epilog.
    epilog: InstrIdx,
    /// For generators, the label starting the frame null-out that precedes the epilog: returns go
    /// here, bailouts straight to `epilog`.
    epilog_null: Option<InstrIdx>,
    /// The label of each bailout's path, created on first use.
    bail_labels: Vec<Option<InstrIdx>>,
    pending_bails: Vec<PendingBail>,
    /// The stack slot a bailout inside an exception region leaves its result in.
    bail_result: Option<SymIdx>,
    /// Where region bailout thunks continue once back in the function's own frame.
    bail_resume: Option<InstrIdx>,
    counts: FuncCounts,
}

impl<'a, T: TargetLowering + ?Sized> Lowerer<'a, T> {
    fn new(md: &'a T, mut f: Func, opts: &'a LowerOpts) -> Self {
        let root = f.root_region();
        let root_label = |f: &mut Func, before: InstrIdx| {
            let l = f.new_label(false);
            f.instr_mut(l).label_info_mut().unwrap().region = Some(root);
            f.insert_before(before, l);
            l
        };
        let tail = f.tail();
        let epilog = root_label(&mut f, tail);
        let epilog_null = f
            .flags
            .is_generator
            .then(|| root_label(&mut f, epilog));
        let nbails = f.bailouts().count();
        Self {
            md,
            f,
            opts,
            epilog,
            epilog_null,
            bail_labels: vec![None; nbails],
            pending_bails: Vec::new(),
            bail_result: None,
            bail_resume: None,
            counts: FuncCounts::default(),
        }
    }

    /// Where a function return jumps to.
    fn return_label(&self) -> InstrIdx {
        self.epilog_null.unwrap_or(self.epilog)
    }

    fn lower(mut self) -> Result<(Func, FrameGeometry, FuncCounts), AbortReason> {
        for iidx in self.f.instr_idxs() {
            if iidx == self.return_label() {
                break;
            }
            if self.f.instr(iidx).is_linked() {
                self.lower_instr(iidx)?;
            }
        }
        self.lower_generator_epilog();
        self.emit_bail_blocks();
        self.allocate_stack_syms();
        let geom = self.md.lower_entry_instr(&mut self.f)?;
        self.md.lower_exit_instr(&mut self.f, self.epilog, &geom);
        Ok((self.f, geom, self.counts))
    }

    fn lower_instr(&mut self, iidx: InstrIdx) -> Result<(), AbortReason> {
        let inst = self.f.instr(iidx).clone();
        // Nothing to lower, and `FunctionEntry` has no predecessor.
        if matches!(
            inst.opcode,
            Opcode::FunctionEntry | Opcode::FunctionExit | Opcode::Label
        ) {
            return Ok(());
        }
        let prev = self.f.prev(iidx).unwrap();
        let next = self.f.next(iidx).unwrap();
        let bidx = inst.bailout;
        let kind = bidx.map(|b| self.f.bailout(b).kind);
        let bail = bidx.map(|b| self.bail_label(b, iidx));
        let implicit = kind.is_some_and(|k| k.has_implicit_calls());
        // The bailout, if any, taken when a type guard fails.
        let guard_bail = match kind.map(|k| k.without_implicit_calls().primary()) {
            Some(k) if k == BailOutKind::ON_NOT_TAGGED_INT || k == BailOutKind::ON_NOT_NUMBER => {
                bail
            }
            _ => None,
        };
        if implicit {
            self.clear_implicit_call_flags(iidx);
        }

        match inst.opcode {
            Opcode::PrologStart | Opcode::PrologEnd => {
                panic!("{} in unlowered IR", inst.opcode)
            }
            Opcode::Nop | Opcode::StatementBoundary | Opcode::Finally | Opcode::BrOnException => {
                self.f.unlink(iidx)
            }
            // The call they belong to finds them through their symbols' definitions.
            Opcode::StartCall | Opcode::ArgOut => self.f.unlink(iidx),
            Opcode::ArgIn => self.md.lower_arg_in(&mut self.f, iidx),
            Opcode::Ld | Opcode::LdC => self.md.change_to_assign(&mut self.f, iidx),
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Shl
            | Opcode::Shr
            | Opcode::ShrU
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Neg
            | Opcode::Not => self.lower_var_op(iidx, prev, guard_bail),
            Opcode::Div | Opcode::Rem => {
                self.helper_call_for(iidx);
                self.f.unlink(iidx);
            }
            Opcode::AddI4 | Opcode::SubI4 | Opcode::MulI4 | Opcode::NegI4 => {
                self.md.lower_int4_op(&mut self.f, iidx, bail)
            }
            Opcode::DivI4 | Opcode::RemI4 | Opcode::DivU4 | Opcode::RemU4 => {
                if !(self.opts.fast_div
                    && self.md.generate_fast_div_and_rem(&mut self.f, iidx, bail))
                {
                    self.md.lower_int4_div(&mut self.f, iidx, bail);
                }
            }
            Opcode::AddF | Opcode::SubF | Opcode::MulF | Opcode::DivF | Opcode::ToFloat => {
                self.md.lower_float_op(&mut self.f, iidx)
            }
            Opcode::FromVar => {
                self.md
                    .emit_load_int32(&mut self.f, iidx, guard_bail, self.opts)?
            }
            Opcode::ToVar => self.md.emit_load_var(&mut self.f, iidx, self.opts)?,
            Opcode::ConvNum => self.lower_conv_num(iidx),
            Opcode::Br => {
                let op = self.md.branch_op_uncond();
                self.f.instr_mut(iidx).opcode = op;
            }
            Opcode::BrLt
            | Opcode::BrLe
            | Opcode::BrGt
            | Opcode::BrGe
            | Opcode::BrEq
            | Opcode::BrNeq => self.lower_cmp_branch(iidx, prev, guard_bail),
            Opcode::CallI => self.lower_call_i(iidx)?,
            Opcode::CallDirect => self.lower_call_direct(iidx)?,
            Opcode::CallHelper => self.lower_call_helper(iidx),
            Opcode::Ret => self.lower_ret(iidx),
            Opcode::BailTarget => {
                let b = bail.unwrap_or_else(|| panic!("BailTarget without a bailout"));
                self.md.insert_branch(&mut self.f, iidx, None, b);
                self.f.unlink(iidx);
            }
            Opcode::BailOnNotTaggedInt => {
                let b = bail.unwrap_or_else(|| panic!("BailOnNotTaggedInt without a bailout"));
                let src = inst.src1.clone().unwrap();
                self.md.generate_smint_test(&mut self.f, iidx, &src, b);
                self.f.unlink(iidx);
            }
            Opcode::BailOnNotNumber => {
                let b = bail.unwrap_or_else(|| panic!("BailOnNotNumber without a bailout"));
                self.lower_bail_on_not_number(iidx, b);
            }
            Opcode::InterruptProbe => self.md.lower_interrupt_probe(&mut self.f, iidx),
            Opcode::TryCatch | Opcode::TryFinally => self.lower_try(iidx),
            Opcode::Catch => self.lower_catch(iidx),
            Opcode::Leave => self.lower_leave(iidx),
            Opcode::LeaveNull => self.lower_leave_null(iidx),
            Opcode::Throw => self.lower_throw(iidx),
            Opcode::GeneratorResumeJumpTable => self.lower_generator_resume_jump_table(iidx),
            Opcode::CreateInterpreterStackFrameForGenerator => {
                self.lower_create_generator_frame(iidx)
            }
            Opcode::Yield => self.lower_yield(iidx, bail),
            Opcode::ResumeYield => self.lower_resume_yield(iidx),
            // Already machine code.
            x if x.is_md() => (),
            x => panic!("no lowering for {x}"),
        }

        if implicit {
            self.check_implicit_call_flags(next, bail.unwrap());
        }
        if let (Some(b), Some(l)) = (bidx, bail) {
            self.tag_bailout_branches(prev, next, b, l);
        }
        Ok(())
    }

    /// Call `helper` before `before`, appending the script context if the helper takes one.
    fn helper_call(
        &mut self,
        before: InstrIdx,
        helper: HelperMethod,
        mut args: Vec<Opnd>,
        dst: Option<Opnd>,
    ) -> InstrIdx {
        if helper.takes_script_context() {
            args.push(script_context_opnd(&self.f));
        }
        self.counts.helper_calls += 1;
        self.md
            .lower_helper_call(&mut self.f, before, helper, &args, dst)
    }

    /// Call the generic helper for the tagged-value operation `iidx`, with its original operands.
    fn helper_call_for(&mut self, iidx: InstrIdx) {
        let inst = self.f.instr(iidx).clone();
        let helper = HelperMethod::for_var_op(inst.opcode)
            .unwrap_or_else(|| panic!("no helper for {}", inst.opcode));
        let args = inst.iter_src_opnds().cloned().collect();
        self.helper_call(iidx, helper, args, inst.dst.clone());
    }

    /// Lower a tagged-value arithmetic or bitwise operation: a guarded fast path with the generic
    /// helper on a cold path, or just the helper. If `bail` is `Some`, a failed guard bails out
    /// instead of calling the helper.
    fn lower_var_op(&mut self, iidx: InstrIdx, prev: InstrIdx, bail: Option<InstrIdx>) {
        if self.opts.fast_paths {
            let helper = self.f.new_label(true);
            let md = self.md;
            let f = &mut self.f;
            let ok = match f.instr(iidx).opcode {
                Opcode::Add => md.generate_fast_add(f, iidx, helper),
                Opcode::Sub => md.generate_fast_sub(f, iidx, helper),
                Opcode::Mul => md.generate_fast_mul(f, iidx, helper),
                Opcode::Shl | Opcode::Shr | Opcode::ShrU => md.generate_fast_shift(f, iidx, helper),
                Opcode::And | Opcode::Or | Opcode::Xor => md.generate_fast_bitwise(f, iidx, helper),
                Opcode::Neg => md.generate_fast_neg(f, iidx, helper),
                Opcode::Not => md.generate_fast_not(f, iidx, helper),
                x => panic!("{x} is not a tagged-value operation"),
            };
            if ok {
                self.counts.fast_paths += 1;
                match bail {
                    Some(b) => self.retarget(prev, iidx, helper, b),
                    None => {
                        let done = self.f.new_label(false);
                        self.md.insert_branch(&mut self.f, iidx, None, done);
                        self.f.insert_before(iidx, helper);
                        self.helper_call_for(iidx);
                        self.f.insert_before(iidx, done);
                    }
                }
                self.f.unlink(iidx);
                return;
            }
        }
        self.helper_call_for(iidx);
        self.f.unlink(iidx);
    }

    /// Lower a compare-and-branch. Tagged values get a fast path; the helper path calls the
    /// comparison helper and branches on its int32 result.
    fn lower_cmp_branch(&mut self, iidx: InstrIdx, prev: InstrIdx, bail: Option<InstrIdx>) {
        let inst = self.f.instr(iidx).clone();
        let (a, b) = (inst.src1.clone().unwrap(), inst.src2.clone().unwrap());
        if a.ty() != Ty::Var && b.ty() != Ty::Var {
            self.md.lower_typed_cmp_branch(&mut self.f, iidx);
            return;
        }
        let target = inst.branch_target().unwrap();
        let done = self.f.new_label(false);
        if self.opts.fast_paths {
            let helper = self.f.new_label(true);
            if self
                .md
                .generate_fast_cmp_branch(&mut self.f, iidx, helper, done)
            {
                self.counts.fast_paths += 1;
                match bail {
                    Some(l) => self.retarget(prev, iidx, helper, l),
                    None => {
                        self.f.insert_before(iidx, helper);
                        self.helper_cmp_branch(iidx, &a, &b, target);
                    }
                }
                self.f.insert_before(iidx, done);
                self.f.unlink(iidx);
                return;
            }
        }
        self.helper_cmp_branch(iidx, &a, &b, target);
        self.f.unlink(iidx);
    }

    fn helper_cmp_branch(&mut self, before: InstrIdx, a: &Opnd, b: &Opnd, target: InstrIdx) {
        let op = self.f.instr(before).opcode;
        let helper = HelperMethod::for_var_op(op).unwrap();
        let r = temp(&mut self.f, Ty::I32);
        self.helper_call(before, helper, vec![a.clone(), b.clone()], Some(r.clone()));
        emit_cmp(&mut self.f, before, Opcode::CMP, &r, &Opnd::int(0, Ty::I32));
        self.md
            .insert_branch(&mut self.f, before, Some(Cond::Ne), target);
    }

    /// Point every branch to `from` between `prev` and `iidx` at `to` instead.
    fn retarget(&mut self, prev: InstrIdx, iidx: InstrIdx, from: InstrIdx, to: InstrIdx) {
        let mut cur = self.f.next(prev);
        while let Some(x) = cur {
            if x == iidx {
                break;
            }
            if self.f.instr(x).branch_target() == Some(from) {
                self.f.instr_mut(x).kind = crate::ir::InstrKind::Branch(Some(to));
            }
            cur = self.f.next(x);
        }
    }

    /// `dst = ConvNum src`: a number is its own numeric value; anything else needs the helper.
    fn lower_conv_num(&mut self, iidx: InstrIdx) {
        let inst = self.f.instr(iidx).clone();
        let dst = inst.dst.clone().unwrap();
        let src = inst.src1.clone().unwrap();
        if src.value_type().is_tagged_int() || tagged_payload(&self.f, &src).is_some() {
            self.md.insert_move(&mut self.f, iidx, dst, src);
        } else if self.opts.fast_paths && may_be_tagged(&src) {
            let helper = self.f.new_label(true);
            let done = self.f.new_label(false);
            self.md
                .generate_smint_test(&mut self.f, iidx, &src, helper);
            self.md
                .insert_move(&mut self.f, iidx, dst.clone(), src.clone());
            self.md.insert_branch(&mut self.f, iidx, None, done);
            self.f.insert_before(iidx, helper);
            self.helper_call(iidx, HelperMethod::Op_ConvNumber, vec![src], Some(dst));
            self.f.insert_before(iidx, done);
            self.counts.fast_paths += 1;
        } else {
            self.helper_call(iidx, HelperMethod::Op_ConvNumber, vec![src], Some(dst));
        }
        self.f.unlink(iidx);
    }

    fn lower_ret(&mut self, iidx: InstrIdx) {
        if let Some(v) = self.f.instr(iidx).src1.clone() {
            let ty = v.ty();
            let r = Opnd::Reg(self.f.phys_reg(self.md.reg_return(ty), ty));
            self.md.insert_move(&mut self.f, iidx, r, v);
        }
        let l = self.return_label();
        self.md.insert_branch(&mut self.f, iidx, None, l);
        self.f.unlink(iidx);
    }

    /// Bail out unless `src` is a number: a tagged int, or a heap object whose type id is that of
    /// a boxed number.
    fn lower_bail_on_not_number(&mut self, iidx: InstrIdx, bail: InstrIdx) {
        let src = self.f.instr(iidx).src1.clone().unwrap();
        if src.value_type().is_tagged_int() || tagged_payload(&self.f, &src).is_some() {
            self.f.unlink(iidx);
            return;
        }
        let obj = self.f.new_label(false);
        let ok = self.f.new_label(false);
        self.md.generate_smint_test(&mut self.f, iidx, &src, obj);
        self.md.insert_branch(&mut self.f, iidx, None, ok);
        self.f.insert_before(iidx, obj);
        let base = match &src {
            Opnd::Reg(r) => r.clone(),
            x => {
                let t = self.f.new_temp(Ty::Var);
                self.md
                    .insert_move(&mut self.f, iidx, Opnd::Reg(t.clone()), x.clone());
                t
            }
        };
        let tid = temp(&mut self.f, Ty::I32);
        let field = Opnd::Indir(crate::ir::IndirOpnd::new(base, TYPE_ID_OFFSET, Ty::I32));
        self.md.insert_move(&mut self.f, iidx, tid.clone(), field);
        emit_cmp(
            &mut self.f,
            iidx,
            Opcode::CMP,
            &tid,
            &Opnd::int(TYPE_ID_NUMBER as i64, Ty::I32),
        );
        self.md
            .insert_branch(&mut self.f, iidx, Some(Cond::Ne), bail);
        self.f.insert_before(iidx, ok);
        self.f.unlink(iidx);
    }

    /// Give every symbol used as a memory operand a stack slot.
    fn allocate_stack_syms(&mut self) {
        let mut syms = Vec::new();
        for iidx in self.f.instr_idxs() {
            for x in self.f.instr(iidx).iter_opnds() {
                if let Opnd::Sym(SymOpnd { sym, .. }) = x {
                    syms.push(*sym);
                }
            }
        }
        for s in syms {
            self.f.stack_allocate(s);
        }
    }
}
