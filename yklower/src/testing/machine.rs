//! A simulator for lowered x86-family code.
//!
//! The simulator runs the instruction list directly: virtual registers that survived lowering
//! (there is no register allocator in this crate) live in a map beside the physical registers.
//! Memory is the [Runtime]'s sparse word map, so each store and load is of one operand-sized
//! value at one byte address. Calls must be to runtime helpers. The helpers that transfer control
//! (bailouts, exception regions, throws) are implemented here. The rest are run by the
//! [Runtime], as the [super::interp] runs them.

use super::Runtime;
use crate::{
    helpers::HelperMethod,
    ir::{
        BailOutIdx, BailOutRecord, Func, Instr, InstrIdx, Opcode, Opnd, OpndT, RegOpnd,
        RestoreLoc, SymIdx,
    },
    lower::bailout_for_record_addr,
    target::{ArgKind, ArgLoc},
};
use std::collections::HashMap;

/// The stack pointer on entry.
pub(crate) const STACK_TOP: u64 = 0x0800_0000;
/// The address of label `n` is `LABEL_BASE + 4 * n`.
const LABEL_BASE: u64 = 0x6000_0000;
/// The return address `run` pushes: returning to it ends the run.
const RET_SENTINEL: u64 = 0x0dea_d000;
/// How far below the caller's stack pointer an exception region's fake frame starts.
const REGION_STACK: u64 = 0x200;
const MAX_STEPS: usize = 1_000_000;

// Register numbers common to x64 and x86.
const ACC: usize = 0;
const DX: usize = 2;
const SP: usize = 4;
const FP: usize = 5;

#[derive(Clone, Copy, Debug, Default)]
struct Flags {
    zf: bool,
    sf: bool,
    of: bool,
    cf: bool,
    pf: bool,
}

/// A bailout taken during a run: which one, its record, and the values it restores.
#[derive(Debug)]
pub(crate) struct Bailout {
    pub(crate) bidx: BailOutIdx,
    pub(crate) record: BailOutRecord,
    pub(crate) values: Vec<(SymIdx, u64)>,
}

/// How a stretch of code stopped.
#[derive(Debug)]
enum Exit {
    /// Returned to the caller of [Machine::run].
    Return,
    /// Returned from an exception region with a continuation address.
    RegionReturn(u64),
    Throw(u64),
}

pub(crate) struct Machine<'a> {
    f: &'a Func,
    pub(crate) rt: Runtime,
    /// The most recent bailout, if any.
    pub(crate) bailout: Option<Bailout>,
    regs: [u64; 32],
    vregs: HashMap<SymIdx, u64>,
    flags: Flags,
}

fn mask(w: u32) -> u64 {
    if w >= 8 {
        u64::MAX
    } else {
        (1 << (8 * w)) - 1
    }
}

fn sext(v: u64, w: u32) -> i64 {
    let sh = 64 - 8 * w.min(8);
    ((v << sh) as i64) >> sh
}

fn sign(v: u64, w: u32) -> bool {
    (v >> (8 * w.min(8) - 1)) & 1 == 1
}

fn label_addr(l: InstrIdx) -> u64 {
    LABEL_BASE + 4 * (usize::from(l) as u64)
}

impl<'a> Machine<'a> {
    /// A machine to run `f`, which must have been lowered for an x86-family target.
    pub(crate) fn new(f: &'a Func) -> Self {
        assert!(
            f.target.is_x86_family(),
            "cannot simulate {} code",
            f.target
        );
        let mut rt = Runtime::new(f.target.tag_scheme(), f.ptr_size());
        for (addr, v) in f.float_consts() {
            rt.store(addr, v.to_bits());
        }
        Self {
            f,
            rt,
            bailout: None,
            regs: [0; 32],
            vregs: HashMap::new(),
            flags: Flags::default(),
        }
    }

    fn p(&self) -> u32 {
        self.f.ptr_size()
    }

    /// Call the function with `args` and return its result. The heap persists between runs.
    pub(crate) fn run(&mut self, args: &[u64]) -> u64 {
        self.regs = [0; 32];
        self.vregs.clear();
        self.flags = Flags::default();
        let p = u64::from(self.p());
        let locs = self.f.target.arg_locs(&vec![ArgKind::Int; args.len()]);
        for (a, l) in args.iter().zip(locs) {
            match l {
                ArgLoc::Reg(r) => self.regs[usize::from(r)] = *a,
                ArgLoc::Stack(off) => self.rt.store(STACK_TOP + u64::from(off), *a),
            }
        }
        self.regs[SP] = STACK_TOP - p;
        self.rt.store(self.regs[SP], RET_SENTINEL);
        match self.exec(self.f.head()) {
            Exit::Return => self.regs[ACC] & mask(self.p()),
            Exit::Throw(x) => panic!("{}: uncaught exception {x:#x}", self.f.name),
            x => panic!("{}: stopped with {x:?}", self.f.name),
        }
    }

    fn label_at(&self, addr: u64) -> InstrIdx {
        let l = addr
            .checked_sub(LABEL_BASE)
            .filter(|x| x % 4 == 0)
            .map(|x| InstrIdx::from_usize(usize::try_from(x / 4).unwrap()))
            .filter(|l| usize::from(*l) < self.f.arena_len() && self.f.instr(*l).is_label())
            .unwrap_or_else(|| panic!("{addr:#x} is not the address of a label"));
        assert!(self.f.instr(l).is_linked());
        l
    }

    // Operands

    fn width(&self, x: &Opnd) -> u32 {
        x.ty().byte_size(self.p())
    }

    fn read_reg(&self, r: &RegOpnd) -> u64 {
        let v = match (r.reg, r.sym) {
            (Some(reg), _) => self.regs[usize::from(reg)],
            // A register read before being written (e.g. `XOR r, r`) is zero.
            (None, Some(s)) => self.vregs.get(&s).copied().unwrap_or(0),
            (None, None) => panic!("register operand with neither symbol nor register"),
        };
        v & mask(r.ty.byte_size(self.p()))
    }

    fn addr_of(&self, x: &Opnd) -> u64 {
        let a = match x {
            Opnd::Sym(s) => {
                let off = self
                    .f
                    .sym(s.sym)
                    .offset
                    .unwrap_or_else(|| panic!("s{} has no stack slot", usize::from(s.sym)));
                self.regs[FP].wrapping_add((i64::from(off) + i64::from(s.offset)) as u64)
            }
            Opnd::Indir(i) => {
                let idx = i
                    .index
                    .as_ref()
                    .map(|r| self.read_reg(r).wrapping_mul(u64::from(i.scale)))
                    .unwrap_or(0);
                self.read_reg(&i.base)
                    .wrapping_add(idx)
                    .wrapping_add(i64::from(i.offset) as u64)
            }
            Opnd::MemRef(m) => m.addr,
            x => panic!("{} is not a memory operand", x.to_string(self.f)),
        };
        a & mask(self.p())
    }

    fn read(&self, x: &Opnd) -> u64 {
        match x {
            Opnd::Reg(r) => self.read_reg(r),
            Opnd::IntConst(c) => c.value as u64,
            Opnd::FloatConst(c) => c.value.to_bits(),
            Opnd::Addr(a) => a.addr,
            Opnd::HelperCall(h) => h.helper.addr(),
            Opnd::Label(l) => label_addr(l.label),
            Opnd::Sym(_) | Opnd::Indir(_) | Opnd::MemRef(_) => {
                self.rt.load(self.addr_of(x)) & mask(self.width(x))
            }
        }
    }

    fn write(&mut self, x: &Opnd, v: u64) {
        let w = self.width(x);
        match x {
            Opnd::Reg(r) => {
                let slot = match (r.reg, r.sym) {
                    (Some(reg), _) => &mut self.regs[usize::from(reg)],
                    (None, Some(s)) => self.vregs.entry(s).or_insert(0),
                    (None, None) => panic!("register operand with neither symbol nor register"),
                };
                // 32-bit writes zero-extend; narrower ones merge.
                *slot = if w >= 4 {
                    v & mask(w)
                } else {
                    (*slot & !mask(w)) | (v & mask(w))
                };
            }
            Opnd::Sym(_) | Opnd::Indir(_) | Opnd::MemRef(_) => {
                let a = self.addr_of(x);
                self.rt.store(a, v & mask(w));
            }
            x => panic!("cannot write to {}", x.to_string(self.f)),
        }
    }

    fn src1(&self, inst: &Instr) -> u64 {
        self.read(inst.src1.as_ref().unwrap())
    }

    fn src2(&self, inst: &Instr) -> u64 {
        self.read(inst.src2.as_ref().unwrap())
    }

    fn push(&mut self, v: u64) {
        let p = self.p();
        self.regs[SP] = (self.regs[SP] - u64::from(p)) & mask(p);
        self.rt.store(self.regs[SP], v & mask(p));
    }

    fn pop(&mut self) -> u64 {
        let p = self.p();
        let v = self.rt.load(self.regs[SP]);
        self.regs[SP] = (self.regs[SP] + u64::from(p)) & mask(p);
        v
    }

    // Arithmetic

    fn set_result_flags(&mut self, r: u64, w: u32) {
        self.flags.zf = r & mask(w) == 0;
        self.flags.sf = sign(r, w);
        self.flags.pf = (r as u8).count_ones() % 2 == 0;
    }

    fn alu(&mut self, op: Opcode, a: u64, b: u64, w: u32) -> u64 {
        let m = mask(w);
        let (a, b) = (a & m, b & m);
        let r = match op {
            Opcode::ADD => {
                let r = a.wrapping_add(b) & m;
                self.flags.cf = u128::from(a) + u128::from(b) > u128::from(m);
                self.flags.of = sign(a, w) == sign(b, w) && sign(r, w) != sign(a, w);
                r
            }
            Opcode::SUB | Opcode::CMP => {
                let r = a.wrapping_sub(b) & m;
                self.flags.cf = a < b;
                self.flags.of = sign(a, w) != sign(b, w) && sign(r, w) != sign(a, w);
                r
            }
            Opcode::AND | Opcode::TEST | Opcode::OR | Opcode::XOR => {
                self.flags.cf = false;
                self.flags.of = false;
                match op {
                    Opcode::OR => a | b,
                    Opcode::XOR => a ^ b,
                    _ => a & b,
                }
            }
            x => panic!("{x} is not an ALU operation"),
        };
        self.set_result_flags(r, w);
        r
    }

    fn shift(&mut self, op: Opcode, a: u64, b: u64, w: u32) -> u64 {
        let bits = 8 * w;
        let c = (b as u32) & if w == 8 { 63 } else { 31 };
        let m = mask(w);
        let a = a & m;
        if c == 0 {
            return a;
        }
        let (r, cf) = match op {
            Opcode::SHL => (
                a.checked_shl(c).unwrap_or(0) & m,
                c <= bits && (a >> (bits - c)) & 1 == 1,
            ),
            Opcode::SHR => (
                a.checked_shr(c).unwrap_or(0),
                c <= bits && (a >> (c - 1)) & 1 == 1,
            ),
            Opcode::SAR => {
                let s = sext(a, w);
                (
                    (s >> c.min(63)) as u64 & m,
                    (s >> (c - 1).min(63)) & 1 == 1,
                )
            }
            x => panic!("{x} is not a shift"),
        };
        self.flags.cf = cf;
        self.flags.of = false;
        self.set_result_flags(r, w);
        r
    }

    /// `IMUL`/`MUL`: the double-width product of the accumulator and `b`, low half in the
    /// accumulator and high half in `dx`.
    fn widening_mul(&mut self, signed: bool, a: u64, b: u64, w: u32) {
        let m = mask(w);
        let p = if signed {
            i128::from(sext(a, w)) * i128::from(sext(b, w))
        } else {
            i128::from(a & m) * i128::from(b & m)
        };
        let lo = (p as u64) & m;
        let hi = ((p >> (8 * w)) as u64) & m;
        self.regs[ACC] = lo;
        self.regs[DX] = hi;
        let fits = if signed {
            i128::from(sext(lo, w)) == p
        } else {
            hi == 0
        };
        self.flags.cf = !fits;
        self.flags.of = !fits;
    }

    /// `IDIV`/`DIV`: divide `dx:acc` by `d`, the quotient in the accumulator and the remainder in
    /// `dx`.
    fn divide(&mut self, signed: bool, d: u64, w: u32) {
        let m = mask(w);
        let bits = 8 * w;
        let (acc, dx) = (self.regs[ACC] & m, self.regs[DX] & m);
        let (q, r) = if signed {
            let n = (i128::from(sext(dx, w)) << bits) | i128::from(acc);
            let d = i128::from(sext(d, w));
            assert_ne!(d, 0, "{}: division by zero", self.f.name);
            let q = n / d;
            assert_eq!(i128::from(sext(q as u64, w)), q, "{}: divide overflow", self.f.name);
            (q as u64, (n % d) as u64)
        } else {
            let n = (u128::from(dx) << bits) | u128::from(acc);
            let d = u128::from(d & m);
            assert_ne!(d, 0, "{}: division by zero", self.f.name);
            let q = n / d;
            assert!(q <= u128::from(m), "{}: divide overflow", self.f.name);
            (q as u64, (n % d) as u64)
        };
        self.regs[ACC] = q & m;
        self.regs[DX] = r & m;
    }

    fn float_op(op: Opcode, a: u64, b: u64) -> u64 {
        let (a, b) = (f64::from_bits(a), f64::from_bits(b));
        match op {
            Opcode::ADDSD => a + b,
            Opcode::SUBSD => a - b,
            Opcode::MULSD => a * b,
            Opcode::DIVSD => a / b,
            x => panic!("{x} is not a float operation"),
        }
        .to_bits()
    }

    fn cond(&self, op: Opcode) -> bool {
        let f = self.flags;
        match op {
            Opcode::JO => f.of,
            Opcode::JNO => !f.of,
            Opcode::JEQ => f.zf,
            Opcode::JNE => !f.zf,
            Opcode::JLT => f.sf != f.of,
            Opcode::JLE => f.zf || f.sf != f.of,
            Opcode::JGT => !f.zf && f.sf == f.of,
            Opcode::JGE => f.sf == f.of,
            Opcode::JB => f.cf,
            Opcode::JBE => f.cf || f.zf,
            Opcode::JA => !f.cf && !f.zf,
            Opcode::JAE => !f.cf,
            Opcode::JSB => f.sf,
            Opcode::JNSB => !f.sf,
            Opcode::JP => f.pf,
            Opcode::JNP => !f.pf,
            x => panic!("{x} is not a conditional jump"),
        }
    }

    // Calls

    /// Call the helper at `target`. Returns how execution stops if the call does not return
    /// normally.
    fn call(&mut self, target: u64) -> Option<Exit> {
        use HelperMethod as H;
        let h = H::from_addr(target)
            .unwrap_or_else(|| panic!("{}: call to non-helper {target:#x}", self.f.name));
        let m = mask(self.p());
        let sp = self.regs[SP];
        let mut args = self
            .f
            .target
            .arg_locs(&vec![ArgKind::Int; h.arg_count()])
            .into_iter()
            .map(|l| match l {
                ArgLoc::Reg(r) => self.regs[usize::from(r)] & m,
                ArgLoc::Stack(off) => self.rt.load(sp + u64::from(off)) & m,
            })
            .collect::<Vec<_>>();
        if h.takes_script_context() {
            // The script context is always the last argument.
            args.pop();
        }
        let res = match h {
            // Allocation probing leaves the requested size in the accumulator.
            H::CRT_chkstk => return None,
            H::SaveAllRegistersAndBailOut => {
                self.save_bailout(args[0]);
                0
            }
            H::Op_TryCatch | H::Op_TryFinally => {
                match self.run_region(h == H::Op_TryCatch, args[0], args[1], args[2]) {
                    Ok(cont) => cont,
                    Err(x) => return Some(Exit::Throw(x)),
                }
            }
            H::CreateInterpreterStackFrameForGenerator => {
                self.rt.calls.push(h);
                self.rt.new_generator_frame()
            }
            H::Op_Throw => return Some(Exit::Throw(args[0])),
            H::Op_ReturnFromCallWithFakeFrame => {
                panic!("{h} is returned to, not called")
            }
            _ => {
                self.rt.implicit_call = false;
                let v = self.rt.call_helper(h, &args);
                if self.rt.implicit_call {
                    self.rt.store(self.f.tctx.implicit_call_flags_addr, 1);
                }
                v
            }
        };
        self.regs[ACC] = res & m;
        None
    }

    fn save_bailout(&mut self, record_addr: u64) {
        let bidx = bailout_for_record_addr(record_addr)
            .unwrap_or_else(|| panic!("{record_addr:#x} is not a bailout record"));
        let record = self
            .f
            .bailout(bidx)
            .record
            .clone()
            .unwrap_or_else(|| panic!("bailout {} has no record", usize::from(bidx)));
        let fp = self.regs[FP];
        let m = mask(self.p());
        let values = record
            .restores
            .iter()
            .map(|(s, loc)| {
                let v = match loc {
                    RestoreLoc::Sym(x) => match self.f.sym(*x).offset {
                        Some(off) => self.rt.load(fp.wrapping_add(i64::from(off) as u64) & m),
                        None => self.vregs.get(x).copied().unwrap_or(0),
                    },
                    RestoreLoc::Const(c) => *c,
                };
                (*s, v)
            })
            .collect();
        self.bailout = Some(Bailout {
            bidx,
            record,
            values,
        });
    }

    /// Run an exception region's body, and its handler if need be, in a fake frame addressing
    /// the stack slots of `fp`. Returns the continuation address or the exception that escapes.
    fn run_region(&mut self, catch: bool, body: u64, handler: u64, fp: u64) -> Result<u64, u64> {
        let (sp0, fp0) = (self.regs[SP], self.regs[FP]);
        let enter = |m: &mut Self| {
            m.regs[FP] = fp;
            m.regs[SP] = sp0 - REGION_STACK;
        };
        enter(self);
        let handler = self.label_at(handler);
        let run_handler = |m: &mut Self, exc: Option<u64>| {
            enter(m);
            if let Some(x) = exc {
                m.regs[ACC] = x;
            }
            m.exec(handler)
        };
        let body = self.label_at(body);
        let out = match (self.exec(body), catch) {
            (Exit::RegionReturn(c), true) => Ok(c),
            (Exit::RegionReturn(c), false) => match run_handler(self, None) {
                Exit::RegionReturn(0) => Ok(c),
                Exit::RegionReturn(c2) => Ok(c2),
                Exit::Throw(y) => Err(y),
                Exit::Return => panic!("return from a finally handler"),
            },
            (Exit::Throw(x), true) => match run_handler(self, Some(x)) {
                Exit::RegionReturn(c) => Ok(c),
                Exit::Throw(y) => Err(y),
                Exit::Return => panic!("return from a catch handler"),
            },
            (Exit::Throw(x), false) => match run_handler(self, None) {
                Exit::RegionReturn(_) => Err(x),
                Exit::Throw(y) => Err(y),
                Exit::Return => panic!("return from a finally handler"),
            },
            (Exit::Return, _) => panic!("return from inside an exception region"),
        };
        self.regs[SP] = sp0;
        self.regs[FP] = fp0;
        out
    }

    // Execution

    fn exec(&mut self, start: InstrIdx) -> Exit {
        let f = self.f;
        let mut pc = start;
        for _ in 0..MAX_STEPS {
            let inst = f.instr(pc);
            let mut next = f.next(pc);
            let dst = inst.dst.as_ref();
            match inst.opcode {
                Opcode::FunctionEntry | Opcode::Label | Opcode::PrologStart | Opcode::PrologEnd => {}
                Opcode::FunctionExit => panic!("{}: fell off the end", f.name),
                Opcode::MOV | Opcode::MOVSD | Opcode::MOVAPS | Opcode::MOV_TRUNC => {
                    let v = self.src1(inst);
                    self.write(dst.unwrap(), v);
                }
                Opcode::MOVSXD => {
                    let s = inst.src1.as_ref().unwrap();
                    let v = sext(self.read(s), self.width(s)) as u64;
                    self.write(dst.unwrap(), v);
                }
                Opcode::LEA => {
                    let a = self.addr_of(inst.src1.as_ref().unwrap());
                    self.write(dst.unwrap(), a);
                }
                Opcode::XCHG => {
                    let (d, s) = (dst.unwrap(), inst.src1.as_ref().unwrap());
                    let (a, b) = (self.read(d), self.read(s));
                    self.write(d, b);
                    self.write(s, a);
                }
                Opcode::ADD | Opcode::SUB | Opcode::AND | Opcode::OR | Opcode::XOR => {
                    let d = dst.unwrap();
                    let r = self.alu(inst.opcode, self.src1(inst), self.src2(inst), self.width(d));
                    self.write(d, r);
                }
                Opcode::CMP | Opcode::TEST => {
                    let w = self.width(inst.src1.as_ref().unwrap());
                    self.alu(inst.opcode, self.src1(inst), self.src2(inst), w);
                }
                Opcode::SHL | Opcode::SHR | Opcode::SAR => {
                    let d = dst.unwrap();
                    let r = self.shift(inst.opcode, self.src1(inst), self.src2(inst), self.width(d));
                    self.write(d, r);
                }
                Opcode::IMUL2 => {
                    let d = dst.unwrap();
                    let w = self.width(d);
                    let p = i128::from(sext(self.src1(inst), w)) * i128::from(sext(self.src2(inst), w));
                    let r = (p as u64) & mask(w);
                    let overflow = i128::from(sext(r, w)) != p;
                    self.flags.cf = overflow;
                    self.flags.of = overflow;
                    self.set_result_flags(r, w);
                    self.write(d, r);
                }
                Opcode::IMUL | Opcode::MUL => {
                    let w = self.width(dst.unwrap());
                    self.widening_mul(inst.opcode == Opcode::IMUL, self.src1(inst), self.src2(inst), w);
                }
                Opcode::IDIV | Opcode::DIV => {
                    let w = self.width(inst.src1.as_ref().unwrap());
                    self.divide(inst.opcode == Opcode::IDIV, self.src2(inst), w);
                }
                Opcode::CDQ => {
                    let s = inst.src1.as_ref().unwrap();
                    let w = self.width(s);
                    let v = if sign(self.read(s), w) { mask(w) } else { 0 };
                    self.write(dst.unwrap(), v);
                }
                Opcode::NEG => {
                    let d = dst.unwrap();
                    let w = self.width(d);
                    let a = self.src1(inst) & mask(w);
                    let r = 0u64.wrapping_sub(a) & mask(w);
                    self.flags.cf = a != 0;
                    self.flags.of = a == 1 << (8 * w - 1);
                    self.set_result_flags(r, w);
                    self.write(d, r);
                }
                Opcode::NOT => {
                    let v = !self.src1(inst);
                    self.write(dst.unwrap(), v);
                }
                Opcode::CVTSI2SD => {
                    let s = inst.src1.as_ref().unwrap();
                    let v = sext(self.read(s), self.width(s)) as f64;
                    self.write(dst.unwrap(), v.to_bits());
                }
                Opcode::CVTTSD2SI => {
                    let d = dst.unwrap();
                    let w = self.width(d);
                    let v = f64::from_bits(self.src1(inst)).trunc();
                    let lim = 2f64.powi(i32::try_from(8 * w - 1).unwrap());
                    // Unrepresentable results are the "integer indefinite" value.
                    let r = if v.is_nan() || v < -lim || v >= lim {
                        1 << (8 * w - 1)
                    } else {
                        v as i64 as u64
                    };
                    self.write(d, r);
                }
                Opcode::ADDSD | Opcode::SUBSD | Opcode::MULSD | Opcode::DIVSD => {
                    let r = Self::float_op(inst.opcode, self.src1(inst), self.src2(inst));
                    self.write(dst.unwrap(), r);
                }
                Opcode::UCOMISD => {
                    let (a, b) = (f64::from_bits(self.src1(inst)), f64::from_bits(self.src2(inst)));
                    let unordered = a.is_nan() || b.is_nan();
                    self.flags = Flags {
                        zf: unordered || a == b,
                        pf: unordered,
                        cf: unordered || a < b,
                        ..Flags::default()
                    };
                }
                Opcode::PUSH => {
                    let v = self.src1(inst);
                    self.push(v);
                }
                Opcode::POP => {
                    let v = self.pop();
                    self.write(dst.unwrap(), v);
                }
                Opcode::CALL => {
                    if let Some(e) = self.call(self.src1(inst)) {
                        return e;
                    }
                }
                Opcode::RET => {
                    let ra = self.pop();
                    if ra == RET_SENTINEL {
                        return Exit::Return;
                    } else if ra == HelperMethod::Op_ReturnFromCallWithFakeFrame.addr() {
                        return Exit::RegionReturn(self.regs[ACC] & mask(self.p()));
                    }
                    panic!("{}: return to {ra:#x}", f.name);
                }
                Opcode::JMP => {
                    next = Some(match inst.branch_target() {
                        Some(t) => t,
                        None => self.label_at(self.src1(inst)),
                    });
                }
                x if x.is_cond_branch() => {
                    if self.cond(x) {
                        next = inst.branch_target();
                    }
                }
                Opcode::INT3 => panic!("{}: hit INT3", f.name),
                x => panic!("{}: cannot simulate {x}", f.name),
            }
            pc = next.unwrap_or_else(|| panic!("{}: fell off the end", f.name));
        }
        panic!("{}: no result after {MAX_STEPS} steps", f.name);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::LowerOpts,
        ir::{builder::FuncBuilder, Ty},
        target::{x64::X64Reg, x86::X86Reg, RegT, Target},
        testing::lower_ok,
    };

    #[test]
    fn register_numbering() {
        for (acc, dx, sp, fp) in [
            (X64Reg::RAX.regidx(), X64Reg::RDX.regidx(), X64Reg::RSP.regidx(), X64Reg::RBP.regidx()),
            (X86Reg::EAX.regidx(), X86Reg::EDX.regidx(), X86Reg::ESP.regidx(), X86Reg::EBP.regidx()),
        ] {
            assert_eq!(
                [acc, dx, sp, fp].map(usize::from),
                [ACC, DX, SP, FP]
            );
        }
    }

    #[test]
    fn flags() {
        let f = Func::new(Target::SysVX64, "f");
        let mut m = Machine::new(&f);
        assert_eq!(m.alu(Opcode::ADD, 0x7fff_ffff, 1, 4), 0x8000_0000);
        assert!(m.cond(Opcode::JO) && m.cond(Opcode::JSB) && !m.cond(Opcode::JB));
        assert_eq!(m.alu(Opcode::SUB, 1, 2, 4), 0xffff_ffff);
        assert!(m.cond(Opcode::JB) && m.cond(Opcode::JLT) && !m.cond(Opcode::JO));
        m.alu(Opcode::CMP, 5, 5, 8);
        assert!(m.cond(Opcode::JEQ) && m.cond(Opcode::JGE) && m.cond(Opcode::JAE));
        assert_eq!(m.shift(Opcode::SAR, 0x8000_0000, 31, 4), 0xffff_ffff);
        assert_eq!(m.shift(Opcode::SHR, 0x8000_0000, 31, 4), 1);
        m.widening_mul(true, (-3i32) as u32 as u64, 5, 4);
        assert_eq!((m.regs[ACC], m.regs[DX]), ((-15i32) as u32 as u64, 0xffff_ffff));
        m.regs[DX] = 0xffff_ffff;
        m.regs[ACC] = (-7i32) as u32 as u64;
        m.divide(true, 2, 4);
        assert_eq!((m.regs[ACC], m.regs[DX]), ((-3i32) as u32 as u64, (-1i32) as u32 as u64));
    }

    #[test]
    fn tagged_add() {
        for target in [Target::SysVX64, Target::WinX64, Target::X86] {
            let mut b = FuncBuilder::new(target, "f");
            let x = b.param(0);
            let y = b.param(1);
            let r = b.var(Ty::Var);
            b.op(Opcode::Add, Some(r.clone()), &[x, y]);
            b.ret(Some(r));
            let lf = lower_ok(b.finish(), &LowerOpts::default());
            let mut m = Machine::new(&lf.func);
            let (a, c) = (m.rt.tag(-5), m.rt.tag(12));
            assert_eq!(m.run(&[a, c]), m.rt.tag(7));
            assert!(m.rt.calls.is_empty());
            let h = m.rt.new_number(0.25);
            let res = m.run(&[h, c]);
            assert_eq!(m.rt.to_number(res), Some(12.25));
            assert_eq!(m.rt.calls, vec![HelperMethod::Op_Add]);
        }
    }

    #[should_panic(expected = "cannot simulate arm32 code")]
    #[test]
    fn arm_rejected() {
        let f = Func::new(Target::Arm32, "f");
        Machine::new(&f);
    }
}
