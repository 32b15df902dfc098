//! Bailout paths.
//!
//! Every instruction carrying a bailout gets a cold label that its guards branch to. Once the
//! whole body has been lowered, each label that ended up with at least one branch to it gets a
//! block calling `SaveAllRegistersAndBailOut` with the bailout's [BailOutRecord]. The helper
//! resumes the function in the interpreter and returns its result, which is then returned from the
//! JIT'd frame.
//!
//! A bailout inside an exception region runs in the region's fake frame, so it cannot simply jump
//! to the epilog: it stores the result in a stack slot and leaves the region through a thunk that
//! continues in the real frame.

use super::{Lowerer, PendingBail};
use crate::{
    helpers::HelperMethod,
    ir::{
        AddrKind, AddrOpnd, BailOutIdx, BailOutRecord, InstrIdx, MemRefOpnd, Opcode,
        Opnd, RegionIdx, RestoreLoc, SymOpnd, Ty,
    },
    target::{emit_cmp, temp, Cond, TargetLowering},
};

/// Bailout records are laid out from here, [BAILOUT_RECORD_STRIDE] bytes apart.
const BAILOUT_RECORD_BASE: u64 = 0x3_0000;
const BAILOUT_RECORD_STRIDE: u64 = 0x40;

/// The address of bailout `bidx`'s record.
pub fn bailout_record_addr(bidx: BailOutIdx) -> u64 {
    BAILOUT_RECORD_BASE + BAILOUT_RECORD_STRIDE * (usize::from(bidx) as u64)
}

/// If `addr` is the address of a bailout record, which one?
pub fn bailout_for_record_addr(addr: u64) -> Option<BailOutIdx> {
    let off = addr.checked_sub(BAILOUT_RECORD_BASE)?;
    (off % BAILOUT_RECORD_STRIDE == 0)
        .then(|| BailOutIdx::from_usize(usize::try_from(off / BAILOUT_RECORD_STRIDE).unwrap()))
}

impl<T: TargetLowering + ?Sized> Lowerer<'_, T> {
    /// The label of bailout `bidx`'s path, creating it (on behalf of `iidx`) if necessary.
    pub(super) fn bail_label(&mut self, bidx: BailOutIdx, iidx: InstrIdx) -> InstrIdx {
        if let Some(l) = self.bail_labels[usize::from(bidx)] {
            return l;
        }
        let label = self.f.new_label(true);
        let region = self.region_of(iidx);
        self.bail_labels[usize::from(bidx)] = Some(label);
        self.pending_bails.push(PendingBail {
            bidx,
            label,
            region,
        });
        label
    }

    fn implicit_call_flags(&self) -> Opnd {
        Opnd::MemRef(MemRefOpnd {
            addr: self.f.tctx.implicit_call_flags_addr,
            ty: Ty::U8,
        })
    }

    /// Reset the thread's implicit-call flags before `iidx`.
    pub(super) fn clear_implicit_call_flags(&mut self, iidx: InstrIdx) {
        let flags = self.implicit_call_flags();
        self.md
            .insert_move(&mut self.f, iidx, flags, Opnd::int(0, Ty::U8));
    }

    /// Before `before`, branch to `bail` if an implicit call happened.
    pub(super) fn check_implicit_call_flags(&mut self, before: InstrIdx, bail: InstrIdx) {
        let flags = self.implicit_call_flags();
        let t = temp(&mut self.f, Ty::U8);
        self.md.insert_move(&mut self.f, before, t.clone(), flags);
        emit_cmp(&mut self.f, before, Opcode::CMP, &t, &Opnd::int(0, Ty::U8));
        self.md
            .insert_branch(&mut self.f, before, Some(Cond::Ne), bail);
    }

    /// Mark every branch to `label` strictly between `prev` and `next` as taking bailout `bidx`.
    /// Other machine instructions in the range lose any bailout they inherited.
    pub(super) fn tag_bailout_branches(
        &mut self,
        prev: InstrIdx,
        next: InstrIdx,
        bidx: BailOutIdx,
        label: InstrIdx,
    ) {
        let mut cur = self.f.next(prev);
        while let Some(x) = cur {
            if x == next {
                break;
            }
            let inst = self.f.instr(x);
            if inst.opcode.is_md() {
                if inst.branch_target() == Some(label) {
                    self.f.instr_mut(x).bailout = Some(bidx);
                    let info = self.f.bailout_mut(bidx);
                    if info.instr.is_none() {
                        info.instr = Some(x);
                    }
                } else {
                    self.f.instr_mut(x).bailout = None;
                }
            }
            cur = self.f.next(x);
        }
    }

    /// Emit the blocks for every bailout that is branched to, after the function body.
    pub(super) fn emit_bail_blocks(&mut self) {
        let pending = std::mem::take(&mut self.pending_bails);
        if !pending
            .iter()
            .any(|pb| self.f.bailout(pb.bidx).instr.is_some())
        {
            return;
        }
        let at = self.return_label();
        // Keep the body from falling into the bailout blocks.
        let body_end = self.f.prev(at).map(|x| self.f.instr(x).opcode);
        if !body_end.is_some_and(Opcode::is_uncond_branch) {
            self.md.insert_branch(&mut self.f, at, None, at);
        }
        let root = self.f.root_region();
        for pb in pending {
            let info = self.f.bailout(pb.bidx);
            if info.instr.is_none() {
                continue;
            }
            // The thunk goes in before this block so that nothing is emitted between the block's
            // last instruction and its jump.
            let thunk = (pb.region != root).then(|| self.region_bail_thunk(pb.region));
            let info = self.f.bailout(pb.bidx);
            let record = BailOutRecord {
                bytecode_offset: info.bytecode_offset,
                polymorphic_cache_index: info.polymorphic_cache_index,
                kind: info.kind,
                restores: info
                    .live_syms
                    .iter()
                    .map(|s| {
                        let loc = info
                            .constants
                            .iter()
                            .find(|(c, _)| c == s)
                            .map(|(_, v)| RestoreLoc::Const(*v))
                            .unwrap_or(RestoreLoc::Sym(*s));
                        (*s, loc)
                    })
                    .collect(),
            };
            self.f.bailout_mut(pb.bidx).record = Some(record);

            self.f
                .instr_mut(pb.label)
                .label_info_mut()
                .unwrap()
                .region = Some(pb.region);
            self.f.insert_before(at, pb.label);
            let rec = Opnd::Addr(AddrOpnd {
                addr: bailout_record_addr(pb.bidx),
                kind: AddrKind::BailOutRecord(pb.bidx),
                ty: Ty::MachPtr,
            });
            self.md.lower_helper_call(
                &mut self.f,
                at,
                HelperMethod::SaveAllRegistersAndBailOut,
                &[rec],
                None,
            );
            match thunk {
                None => {
                    let epilog = self.epilog;
                    self.md.insert_branch(&mut self.f, at, None, epilog);
                }
                Some(thunk) => {
                    let slot = self.bail_result_slot();
                    let ret = Opnd::Reg(self.f.phys_reg(self.md.reg_return(Ty::Var), Ty::Var));
                    self.md.insert_move(&mut self.f, at, slot, ret);
                    self.md.insert_branch(&mut self.f, at, None, thunk);
                }
            }
            self.f.has_bailout = true;
            self.counts.bailouts += 1;
        }
    }

    fn bail_result_slot(&mut self) -> Opnd {
        let s = match self.bail_result {
            Some(s) => s,
            None => {
                let s = self.f.new_sym(Ty::Var);
                self.bail_result = Some(s);
                s
            }
        };
        Opnd::Sym(SymOpnd::new(s, Ty::Var))
    }

    /// The thunk through which bailouts in `region` leave it, emitted on first use.
    fn region_bail_thunk(&mut self, region: RegionIdx) -> InstrIdx {
        if let Some(t) = self.f.region(region).bail_thunk {
            return t;
        }
        let at = self.return_label();
        let resume = self.bail_resume_label();
        let thunk = self.f.new_label(true);
        self.f.instr_mut(thunk).label_info_mut().unwrap().region = Some(region);
        self.f.insert_before(at, thunk);
        self.md
            .lower_eh_region_return(&mut self.f, at, Opnd::label(resume));
        self.f.region_mut(region).bail_thunk = Some(thunk);
        thunk
    }

    /// The label, back in the function's own frame, that returns a region bailout's result.
    fn bail_resume_label(&mut self) -> InstrIdx {
        if let Some(l) = self.bail_resume {
            return l;
        }
        let at = self.return_label();
        let l = self.f.new_label(true);
        let root = self.f.root_region();
        self.f.instr_mut(l).label_info_mut().unwrap().region = Some(root);
        self.f.insert_before(at, l);
        let slot = self.bail_result_slot();
        let ret = Opnd::Reg(self.f.phys_reg(self.md.reg_return(Ty::Var), Ty::Var));
        self.md.insert_move(&mut self.f, at, ret, slot);
        let epilog = self.epilog;
        self.md.insert_branch(&mut self.f, at, None, epilog);
        self.bail_resume = Some(l);
        l
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::LowerOpts,
        ir::{builder::FuncBuilder, BailOutKind},
        target::Target,
        testing::{interp, ir_matches, lower_ok, machine::Machine},
    };

    #[test]
    fn record_addrs() {
        let b = BailOutIdx::from_usize(3);
        assert_eq!(bailout_for_record_addr(bailout_record_addr(b)), Some(b));
        assert_eq!(bailout_for_record_addr(BAILOUT_RECORD_BASE + 1), None);
        assert_eq!(bailout_for_record_addr(0), None);
    }

    /// `r = x + 1` guarded by a tagged-int bailout, for `x` the first parameter.
    fn guarded_inc(target: Target) -> crate::ir::Func {
        let mut b = FuncBuilder::new(target, "inc");
        let x = b.param(0);
        let r = b.var(Ty::Var);
        let one = b.tagged(1);
        b.op_bail(
            Opcode::Add,
            Some(r.clone()),
            &[x.clone(), one],
            BailOutKind::ON_NOT_TAGGED_INT,
            &[x],
        );
        b.ret(Some(r));
        b.finish()
    }

    #[test]
    fn unused_bailout_emits_nothing() {
        let mut b = FuncBuilder::new(Target::SysVX64, "f");
        let x = b.var(Ty::I32);
        let y = b.var(Ty::I32);
        let one = b.int(1);
        b.op(Opcode::LdC, Some(x.clone()), &[one]);
        // An int-only bailout with no result conditions has nothing to guard.
        b.op_bail(
            Opcode::AddI4,
            Some(y.clone()),
            &[x.clone(), x.clone()],
            BailOutKind::INT_ONLY,
            &[x],
        );
        b.ret(Some(y));
        let lf = lower_ok(b.finish(), &LowerOpts::default());
        assert!(!lf.func.has_bailout);
        assert!(!lf.func.to_string().contains("SaveAllRegistersAndBailOut"));
    }

    #[test]
    fn record_built() {
        let lf = lower_ok(guarded_inc(Target::X86), &LowerOpts::default());
        let (_, info) = lf.func.bailouts().next().unwrap();
        let rec = info.record.as_ref().unwrap();
        assert_eq!(rec.kind, BailOutKind::ON_NOT_TAGGED_INT);
        assert_eq!(rec.restores.len(), 1);
        assert!(matches!(rec.restores[0].1, RestoreLoc::Sym(_)));
        ir_matches(
            &lf.func,
            "
            ...
            L{{bail}}: [helper]
              PUSH &bailout_record0
              CALL &SaveAllRegistersAndBailOut
              ESP = LEA [ESP+4]
              JMP L{{epilog}}
            ...
            L{{epilog}}:
            ...
            ",
        );
    }

    #[test]
    fn bailout_round_trip() {
        // Bailing out and finishing in the interpreter gives the same result as never bailing.
        for target in [Target::SysVX64, Target::WinX64, Target::X86] {
            let f = guarded_inc(target);
            let lf = lower_ok(guarded_inc(target), &LowerOpts::default());
            for arg in [None, Some(41), Some(-1)] {
                let mut m = Machine::new(&lf.func);
                let a = match arg {
                    Some(v) => m.rt.tag(v),
                    None => m.rt.new_number(0.5),
                };
                let mut rt = m.rt.clone();
                let want = interp::run(&f, &mut rt, &[a]);
                let mut got = m.run(&[a]);
                assert_eq!(m.bailout.is_some(), arg.is_none());
                if let Some(b) = m.bailout.take() {
                    assert_eq!(b.bidx, BailOutIdx::from_usize(0));
                    got = interp::resume(&f, &mut m.rt, b.record.bytecode_offset, &b.values, &[a]);
                }
                assert_eq!(m.rt.to_number(got), rt.to_number(want));
            }
        }
    }

    #[test]
    fn region_bailout_goes_through_thunk() {
        let mut b = FuncBuilder::new(Target::SysVX64, "f");
        let x = b.param(0);
        let r = b.var(Ty::Var);
        let (body, handler, after) = b.try_catch();
        b.place(body);
        b.op_bail(
            Opcode::BailOnNotTaggedInt,
            None,
            &[x.clone()],
            BailOutKind::ON_NOT_TAGGED_INT,
            &[x.clone()],
        );
        b.op(Opcode::Ld, Some(r.clone()), &[x.clone()]);
        b.leave(after);
        b.place(handler);
        b.catch(Some(r.clone()));
        b.leave(after);
        b.place(after);
        b.ret(Some(r));
        let lf = lower_ok(b.finish(), &LowerOpts::default());
        ir_matches(
            &lf.func,
            "
            ...
              JNE L{{bail}} [bailout 0: not_tagged_int]
            ...
            L{{resume}}: [helper]
              RAX = MOV [{{slot}}]
              JMP L{{epilog}}
            L{{thunk}}: [helper, region 1]
              RAX = MOV &L{{resume}}
              RCX = MOV &Op_ReturnFromCallWithFakeFrame
              PUSH RCX
              RET
            L{{bail}}: [helper, region 1]
              RDI = MOV &bailout_record0
              RAX = MOV &SaveAllRegistersAndBailOut
              CALL RAX
              [{{slot}}] = MOV RAX
              JMP L{{thunk}}
            ...
            L{{epilog}}:
            ...
            ",
        );

        // No bailout: the region's result comes back as normal.
        let mut m = Machine::new(&lf.func);
        let x = m.rt.tag(9);
        assert_eq!(m.run(&[x]), x);
        assert!(m.bailout.is_none());

        // The bailout leaves the fake frame through the thunk and returns the bailout's result.
        let mut m = Machine::new(&lf.func);
        let x = m.rt.new_number(0.5);
        assert_eq!(m.run(&[x]), 0);
        let bail = m.bailout.take().unwrap();
        assert_eq!(bail.bidx, BailOutIdx::from_usize(0));
    }

    #[test]
    fn no_duplicate_jump_over_bail_blocks() {
        let lf = lower_ok(guarded_inc(Target::SysVX64), &LowerOpts::default());
        let f = &lf.func;
        for iidx in f.instr_idxs() {
            let inst = f.instr(iidx);
            if !inst.is_linked() || !inst.opcode.is_uncond_branch() {
                continue;
            }
            if let Some(n) = f.next(iidx) {
                let next = f.instr(n);
                assert!(
                    !(next.opcode.is_uncond_branch() && next.branch_target() == inst.branch_target()),
                    "{f}"
                );
            }
        }
    }

    #[test]
    fn implicit_calls_flag_cleared_then_checked() {
        let mut b = FuncBuilder::new(Target::Arm32, "f");
        let x = b.param(0);
        let r = b.var(Ty::Var);
        b.op_bail(
            Opcode::Not,
            Some(r.clone()),
            &[x.clone()],
            BailOutKind::ON_IMPLICIT_CALLS,
            &[x],
        );
        b.ret(Some(r));
        let lf = lower_ok(b.finish(), &LowerOpts::default());
        let s = lf.func.to_string();
        let clear = s.find("STR").unwrap();
        let call = s.find("Op_Not").unwrap();
        let check = s.rfind("[bailout 0: implicit_calls]").unwrap();
        assert!(clear < call && call < check);
    }
}
