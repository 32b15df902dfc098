//! A reference interpreter for unlowered IR.
//!
//! Tagged-value operations always go through the [Runtime]'s helpers, so the interpreter computes
//! what a function means independently of any fast path. Guards and probes are no-ops: the
//! interpreter handles every type. Exception regions, generators and calls other than helper calls
//! are not supported.

use super::Runtime;
use crate::{
    helpers::HelperMethod,
    ir::{Func, InstrIdx, Opcode, Opnd, OpndT, SymIdx, SymKind, Ty},
};
use std::collections::HashMap;

/// Give up on programs that run for longer than this many instructions.
const MAX_STEPS: usize = 1_000_000;

struct Interp<'a> {
    f: &'a Func,
    rt: &'a mut Runtime,
    args: &'a [u64],
    vals: HashMap<SymIdx, u64>,
}

/// Run `f` from the start with the parameters `args`.
pub(crate) fn run(f: &Func, rt: &mut Runtime, args: &[u64]) -> u64 {
    let mut i = Interp {
        f,
        rt,
        args,
        vals: HashMap::new(),
    };
    i.exec(f.head())
}

/// Resume `f` at the instruction with bytecode offset `offset`, as the interpreter does after a
/// bailout: the symbols in `values` are restored, and nothing before `offset` is rerun.
pub(crate) fn resume(
    f: &Func,
    rt: &mut Runtime,
    offset: u32,
    values: &[(SymIdx, u64)],
    args: &[u64],
) -> u64 {
    let start = f
        .instr_idxs()
        .into_iter()
        .find(|x| f.instr(*x).bytecode_offset == Some(offset))
        .unwrap_or_else(|| panic!("no instruction at bytecode offset {offset}"));
    let mut i = Interp {
        f,
        rt,
        args,
        vals: values.iter().copied().collect(),
    };
    i.exec(start)
}

/// `v`, a value of type `ty`, sign-extended.
fn sext(v: u64, ty: Ty, ptr_size: u32) -> i64 {
    let bits = ty.byte_size(ptr_size) * 8;
    if bits >= 64 {
        v as i64
    } else {
        ((v << (64 - bits)) as i64) >> (64 - bits)
    }
}

fn zext(v: u64, ty: Ty, ptr_size: u32) -> u64 {
    let bits = ty.byte_size(ptr_size) * 8;
    if bits >= 64 {
        v
    } else {
        v & ((1 << bits) - 1)
    }
}

impl Interp<'_> {
    fn get(&self, x: &Opnd) -> u64 {
        let s = match x {
            Opnd::Reg(r) => r
                .sym
                .unwrap_or_else(|| panic!("physical register in unlowered code")),
            Opnd::Sym(s) => {
                if let SymKind::Param(n) = self.f.sym(s.sym).kind {
                    return self.args[usize::from(n)];
                }
                s.sym
            }
            Opnd::IntConst(c) => return zext(c.value as u64, c.ty, self.f.ptr_size()),
            Opnd::FloatConst(c) => return c.value.to_bits(),
            Opnd::Addr(a) => return a.addr,
            x => panic!("cannot interpret {}", x.to_string(self.f)),
        };
        *self
            .vals
            .get(&s)
            .unwrap_or_else(|| panic!("s{} read before being written", usize::from(s)))
    }

    fn set(&mut self, x: &Opnd, v: u64) {
        let s = match x {
            Opnd::Reg(r) => r.sym.unwrap(),
            Opnd::Sym(s) => s.sym,
            x => panic!("cannot assign to {}", x.to_string(self.f)),
        };
        self.vals.insert(s, zext(v, x.ty(), self.f.ptr_size()));
    }

    /// The values of the arguments of the call whose chain ends in `link`.
    fn call_args(&self, mut link: Opnd) -> Vec<u64> {
        let mut slots = Vec::new();
        loop {
            let s = match &link {
                Opnd::Reg(r) => r.sym.unwrap(),
                Opnd::Sym(s) => s.sym,
                _ => panic!("malformed call chain"),
            };
            let def = self.f.instr(self.f.sym(s).def.unwrap());
            match (def.opcode, self.f.sym(s).kind) {
                (Opcode::ArgOut, SymKind::ArgSlot(n)) => {
                    slots.push((n, self.vals[&s]));
                    link = def.src2.clone().unwrap();
                }
                (Opcode::StartCall, _) => break,
                _ => panic!("malformed call chain"),
            }
        }
        slots.sort_by_key(|(n, _)| *n);
        slots.into_iter().map(|(_, v)| v).collect()
    }

    fn cmp(&mut self, op: Opcode, a: &Opnd, b: &Opnd) -> bool {
        let (x, y) = (self.get(a), self.get(b));
        let ps = self.f.ptr_size();
        if a.ty() == Ty::Var || b.ty() == Ty::Var {
            let h = HelperMethod::for_var_op(op).unwrap();
            return self.rt.call_helper(h, &[x, y]) != 0;
        }
        let ord = if a.ty().is_float() {
            match f64::from_bits(x).partial_cmp(&f64::from_bits(y)) {
                Some(o) => o,
                // Every ordered comparison with NaN is false; only `!=` holds.
                None => return op == Opcode::BrNeq,
            }
        } else if a.ty().is_unsigned() {
            zext(x, a.ty(), ps).cmp(&zext(y, b.ty(), ps))
        } else {
            sext(x, a.ty(), ps).cmp(&sext(y, b.ty(), ps))
        };
        match op {
            Opcode::BrLt => ord.is_lt(),
            Opcode::BrLe => ord.is_le(),
            Opcode::BrGt => ord.is_gt(),
            Opcode::BrGe => ord.is_ge(),
            Opcode::BrEq => ord.is_eq(),
            Opcode::BrNeq => ord.is_ne(),
            x => panic!("{x} is not a compare-and-branch"),
        }
    }

    fn exec(&mut self, start: InstrIdx) -> u64 {
        let mut pc = start;
        for _ in 0..MAX_STEPS {
            let inst = self.f.instr(pc).clone();
            let src = |i: &Self, n: usize| {
                let x = if n == 1 { &inst.src1 } else { &inst.src2 };
                i.get(x.as_ref().unwrap())
            };
            let mut next = self.f.next(pc);
            match inst.opcode {
                Opcode::FunctionEntry
                | Opcode::Label
                | Opcode::Nop
                | Opcode::StatementBoundary
                | Opcode::StartCall
                | Opcode::BailTarget
                | Opcode::BailOnNotTaggedInt
                | Opcode::BailOnNotNumber
                | Opcode::InterruptProbe => (),
                Opcode::FunctionExit => panic!("{}: fell off the end", self.f.name),
                Opcode::ArgIn | Opcode::Ld | Opcode::LdC => {
                    let v = src(self, 1);
                    self.set(inst.dst.as_ref().unwrap(), v);
                }
                Opcode::ArgOut => {
                    let v = src(self, 1);
                    self.set(inst.dst.as_ref().unwrap(), v);
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Rem
                | Opcode::Shl
                | Opcode::Shr
                | Opcode::ShrU
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Neg
                | Opcode::Not => {
                    let h = HelperMethod::for_var_op(inst.opcode).unwrap();
                    let args = inst
                        .iter_src_opnds()
                        .map(|x| self.get(x))
                        .collect::<Vec<_>>();
                    let v = self.rt.call_helper(h, &args);
                    self.set(inst.dst.as_ref().unwrap(), v);
                }
                Opcode::AddI4
                | Opcode::SubI4
                | Opcode::MulI4
                | Opcode::NegI4
                | Opcode::DivI4
                | Opcode::RemI4 => {
                    let a = src(self, 1) as u32 as i32;
                    let b = inst.src2.as_ref().map(|x| self.get(x) as u32 as i32);
                    let v = match (inst.opcode, b) {
                        (Opcode::AddI4, Some(b)) => a.wrapping_add(b),
                        (Opcode::SubI4, Some(b)) => a.wrapping_sub(b),
                        (Opcode::MulI4, Some(b)) => a.wrapping_mul(b),
                        (Opcode::DivI4, Some(b)) => a.wrapping_div(b),
                        (Opcode::RemI4, Some(b)) => a.wrapping_rem(b),
                        (Opcode::NegI4, None) => a.wrapping_neg(),
                        (x, _) => panic!("malformed {x}"),
                    };
                    self.set(inst.dst.as_ref().unwrap(), u64::from(v as u32));
                }
                Opcode::DivU4 | Opcode::RemU4 => {
                    let (a, b) = (src(self, 1) as u32, src(self, 2) as u32);
                    let v = if inst.opcode == Opcode::DivU4 { a / b } else { a % b };
                    self.set(inst.dst.as_ref().unwrap(), u64::from(v));
                }
                Opcode::AddF | Opcode::SubF | Opcode::MulF | Opcode::DivF => {
                    let (a, b) = (f64::from_bits(src(self, 1)), f64::from_bits(src(self, 2)));
                    let v = match inst.opcode {
                        Opcode::AddF => a + b,
                        Opcode::SubF => a - b,
                        Opcode::MulF => a * b,
                        _ => a / b,
                    };
                    self.set(inst.dst.as_ref().unwrap(), v.to_bits());
                }
                Opcode::FromVar => {
                    let v = src(self, 1);
                    let i = self.rt.to_int32(v);
                    self.set(inst.dst.as_ref().unwrap(), u64::from(i as u32));
                }
                Opcode::ToVar => {
                    let i = src(self, 1) as u32 as i32;
                    let v = self.rt.from_number(f64::from(i));
                    self.set(inst.dst.as_ref().unwrap(), v);
                }
                Opcode::ConvNum => {
                    let x = src(self, 1);
                    let v = if self.rt.tags.is_tagged_int(x) {
                        x
                    } else {
                        self.rt.call_helper(HelperMethod::Op_ConvNumber, &[x])
                    };
                    self.set(inst.dst.as_ref().unwrap(), v);
                }
                Opcode::ToFloat => {
                    let x = inst.src1.as_ref().unwrap();
                    let v = sext(self.get(x), x.ty(), self.f.ptr_size()) as f64;
                    self.set(inst.dst.as_ref().unwrap(), v.to_bits());
                }
                Opcode::Br => next = inst.branch_target(),
                Opcode::BrLt
                | Opcode::BrLe
                | Opcode::BrGt
                | Opcode::BrGe
                | Opcode::BrEq
                | Opcode::BrNeq => {
                    if self.cmp(
                        inst.opcode,
                        inst.src1.as_ref().unwrap(),
                        inst.src2.as_ref().unwrap(),
                    ) {
                        next = inst.branch_target();
                    }
                }
                Opcode::CallHelper => {
                    let Some(Opnd::HelperCall(h)) = &inst.src1 else {
                        panic!("CallHelper target is not a helper")
                    };
                    let args = self.call_args(inst.src2.clone().unwrap());
                    let v = self.rt.call_helper(h.helper, &args);
                    if let Some(dst) = &inst.dst {
                        self.set(dst, v);
                    }
                }
                Opcode::Ret => return inst.src1.as_ref().map(|x| self.get(x)).unwrap_or(0),
                x => panic!("the interpreter does not support {x}"),
            }
            pc = next.unwrap();
        }
        panic!("{}: no result after {MAX_STEPS} steps", self.f.name);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ir::builder::FuncBuilder, target::Target};

    #[test]
    fn sum_to_n() {
        // r = 0; i = 0; while i < n { i += 1; r += i }; return r
        let mut b = FuncBuilder::new(Target::SysVX64, "sum");
        let n = b.param(0);
        let (r, i) = (b.var(Ty::Var), b.var(Ty::Var));
        let (zero, one) = (b.tagged(0), b.tagged(1));
        b.op(Opcode::LdC, Some(r.clone()), &[zero.clone()]);
        b.op(Opcode::LdC, Some(i.clone()), &[zero]);
        let (head, done) = (b.loop_header(), b.label());
        b.place(head);
        b.br(Opcode::BrGe, done, &i, &n);
        b.op(Opcode::Add, Some(i.clone()), &[i.clone(), one]);
        b.op(Opcode::Add, Some(r.clone()), &[r.clone(), i.clone()]);
        b.jmp(head);
        b.place(done);
        b.ret(Some(r));
        let f = b.finish();
        let mut rt = Runtime::new(Target::SysVX64.tag_scheme(), 8);
        let n = rt.tag(10);
        assert_eq!(run(&f, &mut rt, &[n]), rt.tag(55));
    }

    #[test]
    fn int32_and_float() {
        let mut b = FuncBuilder::new(Target::X86, "f");
        let x = b.param(0);
        let i = b.var(Ty::I32);
        b.op(Opcode::FromVar, Some(i.clone()), &[x]);
        let m = b.int(-3);
        b.op(Opcode::MulI4, Some(i.clone()), &[i.clone(), m]);
        let d = b.var(Ty::F64);
        b.op(Opcode::ToFloat, Some(d.clone()), &[i.clone()]);
        let h = b.float(0.5);
        b.op(Opcode::MulF, Some(d.clone()), &[d.clone(), h]);
        let l = b.label();
        let z = b.float(0.0);
        b.br(Opcode::BrLt, l, &d, &z);
        b.ret(Some(i.clone()));
        b.place(l);
        let r = b.var(Ty::Var);
        b.op(Opcode::ToVar, Some(r.clone()), &[i]);
        b.ret(Some(r));
        let f = b.finish();
        let mut rt = Runtime::new(Target::X86.tag_scheme(), 4);
        let x = rt.tag(7);
        let res = run(&f, &mut rt, &[x]);
        assert_eq!(rt.to_number(res), Some(-21.0));
    }

    #[test]
    fn helper_call_chain() {
        let mut b = FuncBuilder::new(Target::WinX64, "f");
        let x = b.param(0);
        let y = b.param(1);
        let r = b.var(Ty::I32);
        b.call_helper(Some(r.clone()), HelperMethod::Op_Less, &[x, y]);
        b.ret(Some(r));
        let f = b.finish();
        let mut rt = Runtime::new(Target::WinX64.tag_scheme(), 8);
        let (a, c) = (rt.tag(1), rt.new_number(1.5));
        assert_eq!(run(&f, &mut rt, &[a, c]), 1);
        assert_eq!(run(&f, &mut rt, &[c, a]), 0);
        assert_eq!(rt.calls, vec![HelperMethod::Op_Less; 2]);
    }
}
