//! Generators.
//!
//! A generator's state lives in an interpreter frame hanging off the generator object. A
//! generator function is entered afresh on every resumption: the resume jump table at its top
//! continues at the address the last `Yield` saved in the frame, or at the start if there is no
//! frame yet.
//!
//! A generator that returns is finished, so a return nulls the frame pointer before the epilog.
//! A bailout must not: the interpreter carries on with the same frame. Hence the two epilog labels
//! (see [Lowerer::return_label]).

use super::Lowerer;
use crate::{
    helpers::HelperMethod,
    ir::{IndirOpnd, InstrIdx, Opcode, Opnd, OpndT, RegOpnd, Ty},
    target::{emit_cmp, temp, word_imm, Cond, TargetLowering},
};

/// The word of a generator object that points to its interpreter frame.
const GENERATOR_FRAME_WORD: u32 = 3;
/// The word of a generator frame holding the address to resume at.
const FRAME_RESUME_ADDR_WORD: u32 = 4;
/// The word of a generator frame holding the value the generator was resumed with.
const FRAME_RESUME_VALUE_WORD: u32 = 5;

impl<T: TargetLowering + ?Sized> Lowerer<'_, T> {
    fn generator_obj(&self) -> RegOpnd {
        let g = self
            .f
            .flags
            .generator
            .unwrap_or_else(|| panic!("generator opcode in a function with no generator symbol"));
        RegOpnd::sym(g, Ty::Var)
    }

    fn word_field(&self, base: RegOpnd, word: u32) -> Opnd {
        let off = i32::try_from(word * self.f.ptr_size()).unwrap();
        Opnd::Indir(IndirOpnd::new(base, off, Ty::MachPtr))
    }

    /// Load the generator's frame pointer before `before`.
    fn load_generator_frame(&mut self, before: InstrIdx) -> Opnd {
        let field = self.word_field(self.generator_obj(), GENERATOR_FRAME_WORD);
        let fr = temp(&mut self.f, Ty::MachPtr);
        self.md.insert_move(&mut self.f, before, fr.clone(), field);
        fr
    }

    fn frame_field(&self, fr: &Opnd, word: u32) -> Opnd {
        self.word_field(fr.as_reg().unwrap().clone(), word)
    }

    /// Null the generator's frame on the return path, between the return label and the epilog.
    pub(super) fn lower_generator_epilog(&mut self) {
        if self.epilog_null.is_none() {
            return;
        }
        let field = self.word_field(self.generator_obj(), GENERATOR_FRAME_WORD);
        let zero = word_imm(&self.f, 0);
        let epilog = self.epilog;
        self.md.insert_move(&mut self.f, epilog, field, zero);
    }

    /// `GeneratorResumeJumpTable`: continue where the last `Yield` left off, if anywhere.
    pub(super) fn lower_generator_resume_jump_table(&mut self, iidx: InstrIdx) {
        let start = self.f.new_label(false);
        let fr = self.load_generator_frame(iidx);
        let zero = word_imm(&self.f, 0);
        emit_cmp(&mut self.f, iidx, Opcode::CMP, &fr, &zero);
        self.md
            .insert_branch(&mut self.f, iidx, Some(Cond::Eq), start);
        let t = temp(&mut self.f, Ty::MachPtr);
        let resume = self.frame_field(&fr, FRAME_RESUME_ADDR_WORD);
        self.md.insert_move(&mut self.f, iidx, t.clone(), resume);
        self.md.insert_indirect_branch(&mut self.f, iidx, t);
        self.f.insert_before(iidx, start);
        self.f.unlink(iidx);
    }

    /// `[dst =] CreateInterpreterStackFrameForGenerator`: give the generator a frame.
    pub(super) fn lower_create_generator_frame(&mut self, iidx: InstrIdx) {
        let g = Opnd::Reg(self.generator_obj());
        let fr = temp(&mut self.f, Ty::MachPtr);
        self.helper_call(
            iidx,
            HelperMethod::CreateInterpreterStackFrameForGenerator,
            vec![g],
            Some(fr.clone()),
        );
        let field = self.word_field(self.generator_obj(), GENERATOR_FRAME_WORD);
        self.md.insert_move(&mut self.f, iidx, field, fr.clone());
        if let Some(dst) = self.f.instr(iidx).dst.clone() {
            self.md.insert_move(&mut self.f, iidx, dst, fr);
        }
        self.f.unlink(iidx);
    }

    /// `Yield x`: return `x` to the caller, arranging for the next resumption to continue after
    /// the yield. A yield the optimiser could not keep carries a bailout and becomes a jump to it.
    pub(super) fn lower_yield(&mut self, iidx: InstrIdx, bail: Option<InstrIdx>) {
        if let Some(b) = bail {
            self.md.insert_branch(&mut self.f, iidx, None, b);
            self.f.unlink(iidx);
            return;
        }
        let x = self.f.instr(iidx).src1.clone().unwrap();
        let resume = self.f.new_label(false);
        let fr = self.load_generator_frame(iidx);
        let slot = self.frame_field(&fr, FRAME_RESUME_ADDR_WORD);
        self.md
            .insert_move(&mut self.f, iidx, slot, Opnd::label(resume));
        let ty = x.ty();
        let ret = Opnd::Reg(self.f.phys_reg(self.md.reg_return(ty), ty));
        self.md.insert_move(&mut self.f, iidx, ret, x);
        // The frame stays alive: skip the null-out.
        let epilog = self.epilog;
        self.md.insert_branch(&mut self.f, iidx, None, epilog);
        self.f.insert_before(iidx, resume);
        self.f.unlink(iidx);
    }

    /// `dst = ResumeYield`: the value the generator was resumed with.
    pub(super) fn lower_resume_yield(&mut self, iidx: InstrIdx) {
        let dst = self.f.instr(iidx).dst.clone();
        let fr = self.load_generator_frame(iidx);
        if let Some(dst) = dst {
            let v = self.frame_field(&fr, FRAME_RESUME_VALUE_WORD).with_ty(dst.ty());
            self.md.insert_move(&mut self.f, iidx, dst, v);
        }
        self.f.unlink(iidx);
    }
}
