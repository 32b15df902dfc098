//! Test support: textual matching of instruction lists, a reference interpreter for unlowered IR
//! ([interp]) and a simulator for lowered x86-family code ([machine]).

use crate::{
    config::LowerOpts,
    helpers::HelperMethod,
    ir::Func,
    lower::{lower_func, LoweredFunc},
    value::TagScheme,
};
use fm::{FMBuilder, FMatcher};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;

pub(crate) mod interp;
pub(crate) mod machine;

lazy_static! {
    /// Use `{{name}}` to match non-literal strings in tests.
    static ref PTN_RE: Regex = {
        Regex::new(r"\{\{.+?\}\}").unwrap()
    };

    static ref PTN_RE_IGNORE: Regex = {
        Regex::new(r"\{\{_}\}").unwrap()
    };

    /// Names are symbol, register and label numbers: a `.` starts an operand's type suffix.
    static ref TEXT_RE: Regex = {
        Regex::new(r"[a-zA-Z0-9_]+").unwrap()
    };
}

pub(crate) fn fmatcher(ptn: &str) -> FMatcher<'_> {
    FMBuilder::new(ptn)
        .unwrap()
        .name_matcher(PTN_RE.clone(), TEXT_RE.clone())
        .name_matcher_ignore(PTN_RE_IGNORE.clone(), TEXT_RE.clone())
        .build()
        .unwrap()
}

/// Check that the textual form of `f` matches the [fm] pattern `ptn`.
///
/// # Panics
///
/// If it does not.
pub(crate) fn ir_matches(f: &Func, ptn: &str) {
    let s = f.to_string();
    if let Err(e) = fmatcher(ptn).matches(&s) {
        panic!("{e}\n\n{s}");
    }
}

/// Lower `f` with `opts`, panicking on abort.
pub(crate) fn lower_ok(f: Func, opts: &LowerOpts) -> LoweredFunc {
    match lower_func(f, opts) {
        Ok(x) => x,
        Err(e) => panic!("unexpected abort: {e}"),
    }
}

/// The type id stored in the first word of every heap object.
pub(crate) const TYPE_ID_OBJECT: u64 = 0;

/// A heap and a set of runtime helpers that both [interp] and [machine] execute against, so that
/// a value computed by a helper in one is bit-identical to the same value computed in the other.
///
/// Heap numbers are boxed `f64`s: the first word is [crate::value::TYPE_ID_NUMBER], the second
/// the bits of the double.
#[derive(Clone, Debug)]
pub(crate) struct Runtime {
    pub(crate) tags: TagScheme,
    pub(crate) ptr_size: u32,
    /// Sparse memory: word-addressed by byte address.
    pub(crate) mem: HashMap<u64, u64>,
    next_alloc: u64,
    /// Every `ProbeCurrentStack(frame_size)` call made.
    pub(crate) probes: Vec<u64>,
    /// Helpers called, in order.
    pub(crate) calls: Vec<HelperMethod>,
    /// Set by helpers that model a user-visible implicit call (e.g. `valueOf`).
    pub(crate) implicit_call: bool,
}

/// Heap objects are allocated from here upwards: well clear of every fixed address the lowerer
/// uses and below `1 << 48`.
const HEAP_BASE: u64 = 0x10_0000;

impl Runtime {
    pub(crate) fn new(tags: TagScheme, ptr_size: u32) -> Self {
        Self {
            tags,
            ptr_size,
            mem: HashMap::new(),
            next_alloc: HEAP_BASE,
            probes: Vec::new(),
            calls: Vec::new(),
            implicit_call: false,
        }
    }

    pub(crate) fn load(&self, addr: u64) -> u64 {
        self.mem.get(&addr).copied().unwrap_or(0)
    }

    pub(crate) fn store(&mut self, addr: u64, v: u64) {
        self.mem.insert(addr, v);
    }

    fn alloc(&mut self, words: &[u64]) -> u64 {
        let p = self.next_alloc;
        for (i, w) in words.iter().enumerate() {
            self.store(p + u64::from(self.ptr_size) * (i as u64), *w);
        }
        self.next_alloc += 16 * (words.len() as u64).div_ceil(2).max(1);
        p
    }

    /// Box `v` as a heap number.
    pub(crate) fn new_number(&mut self, v: f64) -> u64 {
        self.alloc(&[crate::value::TYPE_ID_NUMBER, v.to_bits()])
    }

    /// Allocate a non-number object.
    pub(crate) fn new_object(&mut self) -> u64 {
        self.alloc(&[TYPE_ID_OBJECT, 0])
    }

    /// Allocate a generator object with no interpreter frame.
    pub(crate) fn new_generator(&mut self) -> u64 {
        self.alloc(&[TYPE_ID_OBJECT, 0, 0, 0])
    }

    /// Allocate a generator's interpreter frame.
    pub(crate) fn new_generator_frame(&mut self) -> u64 {
        self.alloc(&[TYPE_ID_OBJECT, 0, 0, 0, 0, 0])
    }

    pub(crate) fn tag(&self, v: i64) -> u64 {
        self.tags.tag_int(v).unwrap()
    }

    /// The numeric value of `x`, or `None` if `x` is not a number.
    pub(crate) fn to_number(&self, x: u64) -> Option<f64> {
        if let Some(i) = self.tags.untag_int(x) {
            return Some(f64::from(i));
        }
        if self.load(x) == crate::value::TYPE_ID_NUMBER {
            let bits = if self.ptr_size == 8 {
                self.load(x + 8)
            } else {
                self.load(x + 4)
            };
            return Some(f64::from_bits(bits));
        }
        None
    }

    /// Turn `v` into a value: a tagged int if it is an integral int32 (and not -0) that the tag
    /// scheme can represent, otherwise a heap number.
    pub(crate) fn from_number(&mut self, v: f64) -> u64 {
        let i = v as i32;
        if f64::from(i) == v && !(v == 0.0 && v.is_sign_negative()) && self.tags.fits(i64::from(i))
        {
            self.tag(i64::from(i))
        } else {
            self.new_number(v)
        }
    }

    /// ECMAScript `ToInt32`.
    pub(crate) fn to_int32(&mut self, x: u64) -> i32 {
        let v = self.to_number(x).unwrap_or_else(|| {
            self.implicit_call = true;
            0.0
        });
        if !v.is_finite() {
            return 0;
        }
        let m = v.trunc().rem_euclid(4294967296.0);
        m as u32 as i32
    }

    /// Run `helper` on `args` (script context excluded), returning its result as a machine word.
    pub(crate) fn call_helper(&mut self, helper: HelperMethod, args: &[u64]) -> u64 {
        use HelperMethod as H;
        self.calls.push(helper);
        let num = |rt: &mut Self, x: u64| {
            rt.to_number(x).unwrap_or_else(|| {
                rt.implicit_call = true;
                f64::NAN
            })
        };
        match helper {
            H::Op_Add | H::Op_Subtract | H::Op_Multiply | H::Op_Divide | H::Op_Modulus => {
                let (a, b) = (num(self, args[0]), num(self, args[1]));
                let r = match helper {
                    H::Op_Add => a + b,
                    H::Op_Subtract => a - b,
                    H::Op_Multiply => a * b,
                    H::Op_Divide => a / b,
                    _ => a % b,
                };
                self.from_number(r)
            }
            H::Op_ShiftLeft | H::Op_ShiftRight | H::Op_ShiftRightU | H::Op_And | H::Op_Or
            | H::Op_Xor => {
                let (a, b) = (self.to_int32(args[0]), self.to_int32(args[1]));
                let c = (b as u32) & 31;
                let r = match helper {
                    H::Op_ShiftLeft => f64::from(a.wrapping_shl(c)),
                    H::Op_ShiftRight => f64::from(a >> c),
                    H::Op_ShiftRightU => f64::from((a as u32) >> c),
                    H::Op_And => f64::from(a & b),
                    H::Op_Or => f64::from(a | b),
                    _ => f64::from(a ^ b),
                };
                self.from_number(r)
            }
            H::Op_Negate => {
                let a = num(self, args[0]);
                self.from_number(-a)
            }
            H::Op_Not => {
                let a = self.to_int32(args[0]);
                self.from_number(f64::from(!a))
            }
            H::Op_Less
            | H::Op_LessEqual
            | H::Op_Greater
            | H::Op_GreaterEqual
            | H::Op_Equal
            | H::Op_NotEqual => {
                let (a, b) = (num(self, args[0]), num(self, args[1]));
                let r = match helper {
                    H::Op_Less => a < b,
                    H::Op_LessEqual => a <= b,
                    H::Op_Greater => a > b,
                    H::Op_GreaterEqual => a >= b,
                    H::Op_Equal => a == b,
                    _ => a != b,
                };
                u64::from(r)
            }
            H::Conv_ToInt32 => u64::from(self.to_int32(args[0]) as u32),
            H::Op_ConvNumber => {
                let a = num(self, args[0]);
                self.from_number(a)
            }
            H::Op_Int32ToAtom => {
                let a = args[0] as u32 as i32;
                self.from_number(f64::from(a))
            }
            H::Int32Div => u64::from((args[0] as i32).wrapping_div(args[1] as i32) as u32),
            H::Int32Rem => u64::from((args[0] as i32).wrapping_rem(args[1] as i32) as u32),
            H::UInt32Div => u64::from((args[0] as u32) / (args[1] as u32)),
            H::UInt32Rem => u64::from((args[0] as u32) % (args[1] as u32)),
            H::ProbeCurrentStack => {
                self.probes.push(args[0]);
                0
            }
            H::CRT_chkstk => 0,
            H::SaveAllRegistersAndBailOut
            | H::Op_TryCatch
            | H::Op_TryFinally
            | H::Op_ReturnFromCallWithFakeFrame
            | H::CreateInterpreterStackFrameForGenerator
            | H::Op_Throw => panic!("{helper} must be handled by the executor"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn numbers() {
        let mut rt = Runtime::new(TagScheme::Atom64, 8);
        let x = rt.from_number(3.0);
        assert_eq!(rt.tags.untag_int(x), Some(3));
        let y = rt.from_number(0.5);
        assert_eq!(rt.to_number(y), Some(0.5));
        let nz = rt.from_number(-0.0);
        assert!(rt.tags.untag_int(nz).is_none());
        assert_eq!(rt.to_int32(rt.tag(-7)), -7);
        let big = rt.new_number(4294967297.0);
        assert_eq!(rt.to_int32(big), 1);
        let o = rt.new_object();
        assert_eq!(rt.to_number(o), None);
        assert!(!rt.implicit_call);
        let _ = rt.call_helper(HelperMethod::Op_Add, &[o, x]);
        assert!(rt.implicit_call);
    }

    #[test]
    fn lowbit_overflow_boxes() {
        let mut rt = Runtime::new(TagScheme::LowBit32, 4);
        let x = rt.call_helper(HelperMethod::Op_Int32ToAtom, &[u64::from(i32::MAX as u32)]);
        assert_eq!(rt.to_number(x), Some(f64::from(i32::MAX)));
        assert_eq!(rt.calls, vec![HelperMethod::Op_Int32ToAtom]);
    }
}
