//! Programmatic construction of unlowered IR.
//!
//! [FuncBuilder] appends high-level instructions to a [Func] in program order, giving each one the
//! next bytecode offset. It also does the bookkeeping the optimiser is responsible for: parameter
//! symbols, the argument chains of calls, bailout descriptors and exception regions.

use super::{
    BailOutInfo, BailOutKind, Func, Instr, InstrIdx, Opcode, Opnd, OpndT, Region, RegionIdx,
    RegionKind, RegOpnd, SymKind, SymOpnd, Ty, ValueType,
};
use crate::{
    helpers::HelperMethod,
    ir::{AddrKind, AddrOpnd, FloatConstOpnd},
    target::{tagged_int_opnd, Target},
};

pub struct FuncBuilder {
    f: Func,
    /// The bytecode offset of the next instruction.
    offset: u32,
    /// The region code appended now belongs to.
    region: RegionIdx,
}

impl FuncBuilder {
    pub fn new(target: Target, name: &str) -> Self {
        let f = Func::new(target, name);
        let region = f.root_region();
        Self {
            f,
            offset: 0,
            region,
        }
    }

    pub fn func_mut(&mut self) -> &mut Func {
        &mut self.f
    }

    pub fn finish(self) -> Func {
        self.f
    }

    // Operands

    /// A fresh virtual register of type `ty`.
    pub fn var(&mut self, ty: Ty) -> Opnd {
        Opnd::Reg(self.f.new_temp(ty))
    }

    /// A fresh tagged-value register the optimiser knows the dynamic type of.
    pub fn var_with(&mut self, vt: ValueType) -> Opnd {
        Opnd::Reg(self.f.new_temp(Ty::Var).with_vt(vt))
    }

    /// The tagged int `v`.
    pub fn tagged(&self, v: i64) -> Opnd {
        tagged_int_opnd(&self.f, v)
    }

    /// The int32 `v`.
    pub fn int(&self, v: i64) -> Opnd {
        Opnd::int(v, Ty::I32)
    }

    pub fn float(&self, v: f64) -> Opnd {
        Opnd::FloatConst(FloatConstOpnd { value: v, ty: Ty::F64 })
    }

    /// The run-time address `addr`.
    pub fn addr(&self, addr: u64) -> Opnd {
        Opnd::Addr(AddrOpnd {
            addr,
            kind: AddrKind::Dynamic,
            ty: Ty::MachPtr,
        })
    }

    /// Load the `n`th incoming parameter into a fresh tagged-value register.
    pub fn param(&mut self, n: u16) -> Opnd {
        let p = self.f.new_sym_of_kind(Ty::Var, SymKind::Param(n));
        let v = self.var(Ty::Var);
        self.op(
            Opcode::ArgIn,
            Some(v.clone()),
            &[Opnd::Sym(SymOpnd::new(p, Ty::Var))],
        );
        self.f.flags.param_count = self.f.flags.param_count.max(n + 1);
        v
    }

    // Instructions

    fn push(&mut self, mut inst: Instr) -> InstrIdx {
        inst.bytecode_offset = Some(self.offset);
        self.offset += 1;
        self.f.append(inst)
    }

    /// Append `dst = opcode srcs...`.
    ///
    /// # Panics
    ///
    /// If there are more than two sources.
    pub fn op(&mut self, opcode: Opcode, dst: Option<Opnd>, srcs: &[Opnd]) -> InstrIdx {
        assert!(srcs.len() <= 2, "{opcode} with {} sources", srcs.len());
        let mut inst = Instr::new(opcode);
        inst.dst = dst;
        inst.src1 = srcs.first().cloned();
        inst.src2 = srcs.get(1).cloned();
        self.push(inst)
    }

    /// As [Self::op], with a bailout of kind `kind` that resumes the interpreter at this
    /// instruction with the registers `live` restored.
    pub fn op_bail(
        &mut self,
        opcode: Opcode,
        dst: Option<Opnd>,
        srcs: &[Opnd],
        kind: BailOutKind,
        live: &[Opnd],
    ) -> InstrIdx {
        let live_syms = live
            .iter()
            .map(|x| {
                x.as_reg()
                    .and_then(|r| r.sym)
                    .unwrap_or_else(|| panic!("live values must be virtual registers"))
            })
            .collect();
        let b = self
            .f
            .add_bailout(BailOutInfo::new(kind, self.offset, live_syms));
        let iidx = self.op(opcode, dst, srcs);
        self.f.instr_mut(iidx).bailout = Some(b);
        iidx
    }

    /// A new label, not yet placed.
    pub fn label(&mut self) -> InstrIdx {
        self.f.new_label(false)
    }

    /// A new label heading a loop, not yet placed.
    pub fn loop_header(&mut self) -> InstrIdx {
        let l = self.f.new_label(false);
        self.f.add_loop(l);
        l
    }

    /// Place the label `l` here. Code after a region's label belongs to that region.
    pub fn place(&mut self, l: InstrIdx) {
        let tail = self.f.tail();
        self.f.insert_before(tail, l);
        if let Some(r) = self.f.instr(l).label_info().and_then(|li| li.region) {
            self.region = r;
        }
    }

    /// A compare-and-branch `op a, b` to `target`.
    pub fn br(&mut self, op: Opcode, target: InstrIdx, a: &Opnd, b: &Opnd) -> InstrIdx {
        self.push(
            Instr::branch(op, target)
                .with_src1(a.clone())
                .with_src2(b.clone()),
        )
    }

    pub fn jmp(&mut self, target: InstrIdx) -> InstrIdx {
        self.push(Instr::branch(Opcode::Br, target))
    }

    pub fn ret(&mut self, v: Option<Opnd>) -> InstrIdx {
        let mut inst = Instr::new(Opcode::Ret);
        inst.src1 = v;
        self.push(inst)
    }

    // Calls

    /// Append a `StartCall` and one `ArgOut` per argument, returning the last link.
    fn arg_chain(&mut self, args: &[Opnd]) -> Opnd {
        let link = self.f.new_sym(Ty::MachPtr);
        let argc = i64::try_from(args.len()).unwrap();
        let start = self.push(
            Instr::new(Opcode::StartCall)
                .with_dst(Opnd::Reg(RegOpnd::sym(link, Ty::MachPtr)))
                .with_src1(Opnd::int(argc, Ty::I32)),
        );
        self.f.sym_mut(link).def = Some(start);
        let mut prev = Opnd::Reg(RegOpnd::sym(link, Ty::MachPtr));
        for (n, a) in args.iter().enumerate() {
            let slot = self
                .f
                .new_sym_of_kind(a.ty(), SymKind::ArgSlot(u16::try_from(n).unwrap()));
            let dst = Opnd::Sym(SymOpnd::new(slot, a.ty()));
            let iidx = self.push(
                Instr::new(Opcode::ArgOut)
                    .with_dst(dst.clone())
                    .with_src1(a.clone())
                    .with_src2(prev),
            );
            self.f.sym_mut(slot).def = Some(iidx);
            prev = dst;
        }
        prev
    }

    /// `dst = CallI func, args...`: call a function object.
    pub fn call_i(&mut self, dst: Option<Opnd>, func: Opnd, args: &[Opnd]) -> InstrIdx {
        let link = self.arg_chain(args);
        self.op(Opcode::CallI, dst, &[func, link])
    }

    /// `dst = CallDirect target, args...`: a native call.
    pub fn call_direct(&mut self, dst: Option<Opnd>, target: Opnd, args: &[Opnd]) -> InstrIdx {
        let link = self.arg_chain(args);
        self.op(Opcode::CallDirect, dst, &[target, link])
    }

    /// `dst = CallHelper &helper, args...`. The script context is added by lowering.
    pub fn call_helper(
        &mut self,
        dst: Option<Opnd>,
        helper: HelperMethod,
        args: &[Opnd],
    ) -> InstrIdx {
        let link = self.arg_chain(args);
        self.op(Opcode::CallHelper, dst, &[Opnd::helper(helper), link])
    }

    // Exception regions

    fn region_label(&mut self, region: RegionIdx) -> InstrIdx {
        let l = self.f.new_label(false);
        self.f.instr_mut(l).label_info_mut().unwrap().region = Some(region);
        l
    }

    fn try_region(&mut self, op: Opcode, handler_kind: RegionKind) -> (InstrIdx, InstrIdx, InstrIdx) {
        let parent = self.region;
        let body_r = self.f.add_region(Region::new(RegionKind::Try, parent));
        let handler_r = self.f.add_region(Region::new(handler_kind, parent));
        let body = self.region_label(body_r);
        let handler = self.region_label(handler_r);
        let after = self.region_label(parent);
        self.f.region_mut(body_r).handler = Some(handler);
        self.push(Instr::branch(op, handler));
        (body, handler, after)
    }

    /// Start a `try`/`catch`. Returns the labels of the protected body (which must be placed
    /// next), the handler, and the code after both.
    pub fn try_catch(&mut self) -> (InstrIdx, InstrIdx, InstrIdx) {
        self.try_region(Opcode::TryCatch, RegionKind::Catch)
    }

    /// As [Self::try_catch], for a `try`/`finally`.
    pub fn try_finally(&mut self) -> (InstrIdx, InstrIdx, InstrIdx) {
        self.try_region(Opcode::TryFinally, RegionKind::Finally)
    }

    /// Leave the current region for `target`.
    pub fn leave(&mut self, target: InstrIdx) -> InstrIdx {
        self.push(Instr::branch(Opcode::Leave, target))
    }

    /// `dst = Catch`: the exception a handler was entered with.
    pub fn catch(&mut self, dst: Option<Opnd>) -> InstrIdx {
        self.op(Opcode::Catch, dst, &[])
    }

    // Generators

    /// Make this a generator function whose generator object is in `g`.
    pub fn set_generator(&mut self, g: &Opnd) {
        let s = g
            .as_reg()
            .and_then(|r| r.sym)
            .unwrap_or_else(|| panic!("the generator object must be in a virtual register"));
        self.f.flags.is_generator = true;
        self.f.flags.generator = Some(s);
    }
}
