//! Exception regions.
//!
//! A `try` body, its handler and any `finally` block each run in a fake frame set up by the
//! runtime: `Op_TryCatch`/`Op_TryFinally` call the body, passing it this function's frame
//! pointer so that it addresses the same stack slots, and return the address execution continues
//! at once the region has been left. The body leaves its region by returning that continuation
//! to the runtime ([TargetLowering::lower_eh_region_return]).
//!
//! Which region a block belongs to is recorded on its label. Code that starts before any such
//! label is in the root region.

use super::Lowerer;
use crate::{
    helpers::HelperMethod,
    ir::{InstrIdx, Opcode, Opnd, OpndT, RegionIdx, Ty},
    target::{temp, word_imm, TargetLowering},
};

impl<T: TargetLowering + ?Sized> Lowerer<'_, T> {
    /// The exception region `iidx` is in.
    pub(super) fn region_of(&self, iidx: InstrIdx) -> RegionIdx {
        let mut cur = Some(iidx);
        while let Some(x) = cur {
            if let Some(r) = self.f.instr(x).label_info().and_then(|li| li.region) {
                return r;
            }
            cur = self.f.prev(x);
        }
        self.f.root_region()
    }

    /// `TryCatch $handler` / `TryFinally $handler`, immediately followed by the label that starts
    /// the protected body.
    pub(super) fn lower_try(&mut self, iidx: InstrIdx) {
        let inst = self.f.instr(iidx).clone();
        let handler = inst.branch_target().unwrap();
        let body = self
            .f
            .next(iidx)
            .filter(|x| self.f.instr(*x).is_label())
            .unwrap_or_else(|| panic!("{} not followed by its body's label", inst.opcode));
        let helper = match inst.opcode {
            Opcode::TryCatch => HelperMethod::Op_TryCatch,
            Opcode::TryFinally => HelperMethod::Op_TryFinally,
            x => panic!("{x} does not start a region"),
        };
        let fp = Opnd::Reg(self.f.phys_reg(self.md.reg_fp(), Ty::MachPtr));
        let cont = temp(&mut self.f, Ty::MachPtr);
        self.helper_call(
            iidx,
            helper,
            vec![Opnd::label(body), Opnd::label(handler), fp],
            Some(cont.clone()),
        );
        self.md.insert_indirect_branch(&mut self.f, iidx, cont);
        self.f.unlink(iidx);
    }

    /// `dst = Catch`: the runtime enters a catch handler with the exception object in the return
    /// register.
    pub(super) fn lower_catch(&mut self, iidx: InstrIdx) {
        if let Some(dst) = self.f.instr(iidx).dst.clone() {
            let ty = dst.ty();
            let exc = Opnd::Reg(self.f.phys_reg(self.md.reg_return(ty), ty));
            self.md.insert_move(&mut self.f, iidx, dst, exc);
        }
        self.f.unlink(iidx);
    }

    /// `Leave $target`: jump to `target`, leaving the current region if there is one.
    pub(super) fn lower_leave(&mut self, iidx: InstrIdx) {
        let target = self.f.instr(iidx).branch_target().unwrap();
        if self.region_of(iidx) == self.f.root_region() {
            self.md.insert_branch(&mut self.f, iidx, None, target);
        } else {
            self.md
                .lower_eh_region_return(&mut self.f, iidx, Opnd::label(target));
        }
        self.f.unlink(iidx);
    }

    /// `LeaveNull`: leave the current region without a continuation of its own. At the end of a
    /// `finally` this means "continue wherever the protected body was going".
    pub(super) fn lower_leave_null(&mut self, iidx: InstrIdx) {
        assert_ne!(
            self.region_of(iidx),
            self.f.root_region(),
            "LeaveNull outside an exception region"
        );
        let zero = word_imm(&self.f, 0);
        self.md.lower_eh_region_return(&mut self.f, iidx, zero);
        self.f.unlink(iidx);
    }

    /// `Throw x`.
    pub(super) fn lower_throw(&mut self, iidx: InstrIdx) {
        let x = self.f.instr(iidx).src1.clone().unwrap();
        self.helper_call(iidx, HelperMethod::Op_Throw, vec![x], None);
        self.f.unlink(iidx);
    }
}
