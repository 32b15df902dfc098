//! Calls.
//!
//! Outgoing arguments arrive as a chain: `StartCall` opens a call and defines a link symbol, then
//! each `ArgOut` defines an argument-slot symbol and links back to its predecessor. The call
//! itself takes the last link as `src2`:
//!
//! ```text
//! s1 = StartCall 2
//! [s2] = ArgOut s0, s1
//! [s3] = ArgOut s4, [s2]
//! s5 = CallI s6, [s3]
//! ```
//!
//! `StartCall` and `ArgOut` are removed as they are visited; by the time the call is lowered the
//! chain is found through each symbol's defining instruction.

use super::{AbortReason, Lowerer};
use crate::{
    ir::{IndirOpnd, InstrIdx, Opcode, Opnd, OpndT, SymKind, Ty},
    target::{word_imm, TargetLowering, MAX_NATIVE_CALL_ARGS},
};

/// The offset, in machine words, of a function object's entry point.
const FUNCTION_ENTRY_POINT_WORD: u32 = 1;

/// A call's arguments, as collected from its chain.
struct CallArgs {
    /// The `StartCall` argument count.
    argc: usize,
    flags: i64,
    args: Vec<Opnd>,
}

impl<T: TargetLowering + ?Sized> Lowerer<'_, T> {
    /// Walk the argument chain ending in `link`.
    fn call_args(&self, mut link: Opnd) -> CallArgs {
        let mut slots = Vec::new();
        loop {
            let s = match &link {
                Opnd::Reg(r) => r.sym.unwrap_or_else(|| panic!("call link is not a symbol")),
                Opnd::Sym(s) => s.sym,
                x => panic!("call link {} is not a symbol", x.to_string(&self.f)),
            };
            let def = self
                .f
                .sym(s)
                .def
                .unwrap_or_else(|| panic!("call link s{} has no definition", usize::from(s)));
            let inst = self.f.instr(def);
            match inst.opcode {
                Opcode::ArgOut => {
                    let n = match self.f.sym(s).kind {
                        SymKind::ArgSlot(n) => n,
                        _ => panic!("ArgOut defines s{}, which is not an argument slot", usize::from(s)),
                    };
                    slots.push((n, inst.src1.clone().unwrap()));
                    link = inst.src2.clone().unwrap();
                }
                Opcode::StartCall => {
                    let argc = usize::try_from(inst.src1.as_ref().and_then(|x| x.int_value()).unwrap())
                        .unwrap();
                    let flags = inst.src2.as_ref().and_then(|x| x.int_value()).unwrap_or(0);
                    slots.sort_by_key(|(n, _)| *n);
                    assert!(
                        slots.iter().enumerate().all(|(i, (n, _))| usize::from(*n) == i),
                        "argument slots of a call are not contiguous"
                    );
                    assert_eq!(slots.len(), argc, "StartCall {argc} with {} ArgOuts", slots.len());
                    return CallArgs {
                        argc,
                        flags,
                        args: slots.into_iter().map(|(_, x)| x).collect(),
                    };
                }
                x => panic!("{x} in a call's argument chain"),
            }
        }
    }

    /// The chain of the call `iidx`, checked against the native argument limit. `extra` is the
    /// number of arguments the lowering adds.
    fn checked_call_args(&self, iidx: InstrIdx, extra: usize) -> Result<CallArgs, AbortReason> {
        let link = self.f.instr(iidx).src2.clone().unwrap();
        let ca = self.call_args(link);
        let count = ca.args.len() + extra;
        if count > MAX_NATIVE_CALL_ARGS {
            return Err(AbortReason::TooManyArgs { count });
        }
        Ok(ca)
    }

    /// `dst = CallI fn, link`: call the function object `fn` through its entry point, passing the
    /// function object and the call info before the arguments.
    pub(super) fn lower_call_i(&mut self, iidx: InstrIdx) -> Result<(), AbortReason> {
        let ca = self.checked_call_args(iidx, 2)?;
        let inst = self.f.instr(iidx).clone();
        let func = match inst.src1.clone().unwrap() {
            Opnd::Reg(r) => r,
            x => {
                let t = self.f.new_temp(Ty::Var);
                self.md
                    .insert_move(&mut self.f, iidx, Opnd::Reg(t.clone()), x);
                t
            }
        };
        let entry = self.f.new_temp(Ty::MachPtr);
        let p = i32::try_from(FUNCTION_ENTRY_POINT_WORD * self.f.ptr_size()).unwrap();
        self.md.insert_move(
            &mut self.f,
            iidx,
            Opnd::Reg(entry.clone()),
            Opnd::Indir(IndirOpnd::new(func.clone(), p, Ty::MachPtr)),
        );
        let info = word_imm(&self.f, ca.flags << 24 | i64::try_from(ca.argc).unwrap());
        let mut args = vec![Opnd::Reg(func), info];
        args.extend(ca.args);
        self.md
            .lower_call(&mut self.f, iidx, Opnd::Reg(entry), &args, inst.dst.clone());
        self.counts.calls += 1;
        self.f.unlink(iidx);
        Ok(())
    }

    /// `dst = CallDirect target, link`: a native call.
    pub(super) fn lower_call_direct(&mut self, iidx: InstrIdx) -> Result<(), AbortReason> {
        let ca = self.checked_call_args(iidx, 0)?;
        let inst = self.f.instr(iidx).clone();
        self.md.lower_call(
            &mut self.f,
            iidx,
            inst.src1.clone().unwrap(),
            &ca.args,
            inst.dst.clone(),
        );
        self.counts.calls += 1;
        self.f.unlink(iidx);
        Ok(())
    }

    /// `dst = CallHelper &helper, link`.
    pub(super) fn lower_call_helper(&mut self, iidx: InstrIdx) {
        let inst = self.f.instr(iidx).clone();
        let helper = match inst.src1.as_ref() {
            Some(Opnd::HelperCall(h)) => h.helper,
            _ => panic!("CallHelper target is not a helper"),
        };
        let ca = self.call_args(inst.src2.clone().unwrap());
        self.helper_call(iidx, helper, ca.args, inst.dst.clone());
        self.f.unlink(iidx);
    }
}
