//! The post-legalization peephole pass.
//!
//! The rewrites themselves are target-specific (see [TargetLowering::peephole_instr]); this module
//! drives them and provides the flow queries they share.

use crate::{
    ir::{Func, InstrIdx, InstrKind, Opcode, RegIdx},
    target::TargetLowering,
};
use smallvec::SmallVec;

/// Run the target's peephole rewrites over every linked machine instruction of `f`. Returns how
/// many instructions were removed.
pub(crate) fn peephole<T: TargetLowering + ?Sized>(md: &T, f: &mut Func) -> usize {
    let mut removed = 0;
    for iidx in f.instr_idxs() {
        let inst = f.instr(iidx);
        if !inst.is_linked() || !inst.opcode.is_md() {
            continue;
        }
        if md.peephole_instr(f, iidx) {
            removed += 1;
        }
    }
    removed
}

/// Might the condition flags as they are after `iidx` be read before they are next written?
///
/// The scan is confined to the rest of `iidx`'s basic block: reaching a label is conservatively
/// treated as "live".
pub(crate) fn flags_live_after(f: &Func, iidx: InstrIdx) -> bool {
    let mut cur = f.next(iidx);
    while let Some(x) = cur {
        let inst = f.instr(x);
        if inst.opcode.reads_flags() {
            return true;
        }
        if inst.opcode.writes_flags() {
            return false;
        }
        if inst.is_label() {
            return true;
        }
        if inst.opcode.is_uncond_branch()
            || inst.opcode.is_call()
            || matches!(
                inst.opcode,
                Opcode::RET | Opcode::BX | Opcode::FunctionExit
            )
        {
            return false;
        }
        cur = f.next(x);
    }
    false
}

/// Is `iidx` a direct branch to a label that immediately follows it (possibly with other labels
/// and pragmas in between)?
pub(crate) fn jumps_to_next_label(f: &Func, iidx: InstrIdx) -> bool {
    let Some(target) = f.instr(iidx).branch_target() else {
        return false;
    };
    let mut cur = f.next(iidx);
    while let Some(x) = cur {
        let inst = f.instr(x);
        if x == target {
            return true;
        }
        if !inst.is_label() && inst.kind != InstrKind::Pragma {
            return false;
        }
        cur = f.next(x);
    }
    false
}

/// For every linked instruction that writes registers it does not name, the registers it writes.
pub(crate) fn implicit_clobbers<T: TargetLowering + ?Sized>(
    md: &T,
    f: &Func,
) -> Vec<(InstrIdx, SmallVec<[RegIdx; 2]>)> {
    f.instr_idxs()
        .into_iter()
        .filter_map(|iidx| {
            let c = md.implicit_clobbers(f.instr(iidx));
            (!c.is_empty()).then_some((iidx, c))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        ir::{Instr, Opnd, Ty},
        target::Target,
    };

    #[test]
    fn flags() {
        let mut f = Func::new(Target::SysVX64, "t");
        let x = Opnd::Reg(f.new_temp(Ty::I32));
        let l = f.new_label(false);
        let a = f.append(
            Instr::new(Opcode::MOV)
                .with_dst(x.clone())
                .with_src1(Opnd::int(0, Ty::I32)),
        );
        let jeq = f.append(Instr::branch(Opcode::JEQ, l));
        let tail = f.tail();
        f.insert_before(tail, l);
        assert!(flags_live_after(&f, a));

        f.insert_instr_before(jeq, Instr::new(Opcode::CMP).with_src1(x.clone()).with_src2(x));
        assert!(!flags_live_after(&f, a));
    }

    #[test]
    fn next_label() {
        let mut f = Func::new(Target::SysVX64, "t");
        let l1 = f.new_label(false);
        let l2 = f.new_label(true);
        let j = f.append(Instr::branch(Opcode::JMP, l2));
        let tail = f.tail();
        f.insert_before(tail, l1);
        f.append(Instr::pragma(Opcode::PrologEnd));
        f.insert_before(tail, l2);
        assert!(jumps_to_next_label(&f, j));
        let nop = f.insert_instr_before(l2, Instr::new(Opcode::INT3));
        assert!(!jumps_to_next_label(&f, j));
        f.unlink(nop);
        assert!(jumps_to_next_label(&f, j));
    }
}
