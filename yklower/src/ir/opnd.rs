//! Instruction operands.
//!
//! An [Opnd] is a closed sum type: every consumer matches exhaustively on it. Each variant carries
//! a machine [Ty]; register operands additionally carry a [ValueType] hint from the optimiser.

use super::{BailOutIdx, Func, InstrIdx, RegIdx, SymIdx, Ty, ValueType};
use crate::helpers::HelperMethod;
use enum_dispatch::enum_dispatch;

/// The encoder-visible form of an operand. Legal-forms tables are expressed in terms of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpndKind {
    Reg,
    Mem,
    Imm8,
    Imm32,
    Imm64,
    FloatConst,
    Helper,
    Label,
}

#[enum_dispatch]
pub trait OpndT {
    fn ty(&self) -> Ty;
    /// What form will this operand take when encoded on a machine whose word is `ptr_size` bytes?
    fn kind(&self, ptr_size: u32) -> OpndKind;
    fn to_string(&self, f: &Func) -> String;
}

#[enum_dispatch(OpndT)]
#[derive(Clone, Debug, PartialEq)]
pub enum Opnd {
    Reg(RegOpnd),
    Sym(SymOpnd),
    IntConst(IntConstOpnd),
    FloatConst(FloatConstOpnd),
    Addr(AddrOpnd),
    Indir(IndirOpnd),
    MemRef(MemRefOpnd),
    HelperCall(HelperCallOpnd),
    Label(LabelOpnd),
}

impl Opnd {
    pub fn int(value: i64, ty: Ty) -> Self {
        Opnd::IntConst(IntConstOpnd { value, ty })
    }

    pub fn helper(helper: HelperMethod) -> Self {
        Opnd::HelperCall(HelperCallOpnd { helper })
    }

    pub fn label(label: InstrIdx) -> Self {
        Opnd::Label(LabelOpnd { label })
    }

    pub fn is_reg(&self) -> bool {
        matches!(self, Opnd::Reg(_))
    }

    pub fn is_mem(&self) -> bool {
        matches!(self, Opnd::Sym(_) | Opnd::Indir(_) | Opnd::MemRef(_))
    }

    pub fn is_imm(&self) -> bool {
        matches!(self, Opnd::IntConst(_) | Opnd::Addr(_))
    }

    pub fn as_reg(&self) -> Option<&RegOpnd> {
        match self {
            Opnd::Reg(x) => Some(x),
            _ => None,
        }
    }

    /// If this operand is a compile-time integer (an immediate or an address), return it.
    pub fn int_value(&self) -> Option<i64> {
        match self {
            Opnd::IntConst(x) => Some(x.value),
            Opnd::Addr(x) => Some(x.addr as i64),
            _ => None,
        }
    }

    /// The operand's value-type hint. Only registers carry one.
    pub fn value_type(&self) -> ValueType {
        match self {
            Opnd::Reg(x) => x.vt,
            Opnd::Addr(AddrOpnd {
                kind: AddrKind::TaggedInt,
                ..
            }) => ValueType::TaggedInt,
            _ => ValueType::Any,
        }
    }

    /// Return a copy of this operand that reads/writes the same location as `ty`.
    pub fn with_ty(&self, ty: Ty) -> Self {
        let mut x = self.clone();
        match &mut x {
            Opnd::Reg(r) => r.ty = ty,
            Opnd::Sym(s) => s.ty = ty,
            Opnd::IntConst(c) => c.ty = ty,
            Opnd::FloatConst(c) => c.ty = ty,
            Opnd::Addr(a) => a.ty = ty,
            Opnd::Indir(i) => i.ty = ty,
            Opnd::MemRef(m) => m.ty = ty,
            Opnd::HelperCall(_) | Opnd::Label(_) => (),
        }
        x
    }

    /// Do `self` and `other` name the same storage location (ignoring types)?
    pub fn same_location(&self, other: &Opnd) -> bool {
        match (self, other) {
            (Opnd::Reg(x), Opnd::Reg(y)) => x.same_reg(y),
            (Opnd::Sym(x), Opnd::Sym(y)) => x.sym == y.sym && x.offset == y.offset,
            (Opnd::Indir(x), Opnd::Indir(y)) => {
                x.base.same_reg(&y.base)
                    && x.offset == y.offset
                    && x.scale == y.scale
                    && match (&x.index, &y.index) {
                        (Some(a), Some(b)) => a.same_reg(b),
                        (None, None) => true,
                        _ => false,
                    }
            }
            (Opnd::MemRef(x), Opnd::MemRef(y)) => x.addr == y.addr,
            _ => false,
        }
    }

    /// Iterate over the register operands this operand reads (including an indirection's base
    /// and index).
    pub fn iter_regs(&self) -> impl Iterator<Item = &RegOpnd> {
        let (a, b) = match self {
            Opnd::Reg(x) => (Some(x), None),
            Opnd::Indir(x) => (Some(&x.base), x.index.as_ref()),
            _ => (None, None),
        };
        a.into_iter().chain(b)
    }
}

/// A register: either a virtual register (backed by a symbol), a physical register, or a
/// symbol that has been pinned to a physical register.
#[derive(Clone, Debug, PartialEq)]
pub struct RegOpnd {
    pub sym: Option<SymIdx>,
    pub reg: Option<RegIdx>,
    pub ty: Ty,
    pub vt: ValueType,
}

impl RegOpnd {
    pub fn sym(sym: SymIdx, ty: Ty) -> Self {
        Self {
            sym: Some(sym),
            reg: None,
            ty,
            vt: ValueType::Any,
        }
    }

    pub fn phys(reg: RegIdx, ty: Ty) -> Self {
        Self {
            sym: None,
            reg: Some(reg),
            ty,
            vt: ValueType::Any,
        }
    }

    pub fn with_vt(mut self, vt: ValueType) -> Self {
        self.vt = vt;
        self
    }

    /// Two register operands name the same register if they share a physical register or, when
    /// neither is pinned, they share a symbol.
    pub fn same_reg(&self, other: &RegOpnd) -> bool {
        match (self.reg, other.reg) {
            (Some(x), Some(y)) => x == y,
            (None, None) => self.sym.is_some() && self.sym == other.sym,
            _ => false,
        }
    }
}

impl OpndT for RegOpnd {
    fn ty(&self) -> Ty {
        self.ty
    }

    fn kind(&self, _: u32) -> OpndKind {
        OpndKind::Reg
    }

    fn to_string(&self, f: &Func) -> String {
        let base = match (self.sym, self.reg) {
            (Some(s), Some(r)) => format!("s{}({})", usize::from(s), f.target.reg_name(r)),
            (Some(s), None) => format!("s{}", usize::from(s)),
            (None, Some(r)) => f.target.reg_name(r).to_owned(),
            (None, None) => "<noreg>".to_owned(),
        };
        format!("{base}{}", self.ty.suffix())
    }
}

/// A stack-resident symbol.
#[derive(Clone, Debug, PartialEq)]
pub struct SymOpnd {
    pub sym: SymIdx,
    pub offset: i32,
    pub ty: Ty,
}

impl SymOpnd {
    pub fn new(sym: SymIdx, ty: Ty) -> Self {
        Self { sym, offset: 0, ty }
    }
}

impl OpndT for SymOpnd {
    fn ty(&self) -> Ty {
        self.ty
    }

    fn kind(&self, _: u32) -> OpndKind {
        OpndKind::Mem
    }

    fn to_string(&self, _: &Func) -> String {
        if self.offset == 0 {
            format!("[s{}]{}", usize::from(self.sym), self.ty.suffix())
        } else {
            format!(
                "[s{}{:+}]{}",
                usize::from(self.sym),
                self.offset,
                self.ty.suffix()
            )
        }
    }
}

fn int_kind(value: i64, ty: Ty, ptr_size: u32) -> OpndKind {
    let value = if ty.byte_size(ptr_size) <= 4 {
        i64::from(value as i32)
    } else {
        value
    };
    if i8::try_from(value).is_ok() {
        OpndKind::Imm8
    } else if i32::try_from(value).is_ok() {
        OpndKind::Imm32
    } else {
        OpndKind::Imm64
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct IntConstOpnd {
    pub value: i64,
    pub ty: Ty,
}

impl OpndT for IntConstOpnd {
    fn ty(&self) -> Ty {
        self.ty
    }

    fn kind(&self, ptr_size: u32) -> OpndKind {
        int_kind(self.value, self.ty, ptr_size)
    }

    fn to_string(&self, _: &Func) -> String {
        if self.value.unsigned_abs() >= 0x10000 {
            if self.value < 0 {
                format!("-0x{:x}", self.value.unsigned_abs())
            } else {
                format!("0x{:x}", self.value)
            }
        } else {
            self.value.to_string()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FloatConstOpnd {
    pub value: f64,
    pub ty: Ty,
}

impl OpndT for FloatConstOpnd {
    fn ty(&self) -> Ty {
        self.ty
    }

    fn kind(&self, _: u32) -> OpndKind {
        OpndKind::FloatConst
    }

    fn to_string(&self, _: &Func) -> String {
        format!("{:?}", self.value)
    }
}

/// What an [AddrOpnd] points at. Only used for display and by tests that execute lowered code.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AddrKind {
    /// A tagged integer, encoded in the target's [crate::value::TagScheme].
    TaggedInt,
    /// Some run-time address.
    Dynamic,
    /// The script context of the function being compiled.
    ScriptContext,
    /// The [crate::ir::BailOutRecord] of a bailout.
    BailOutRecord(BailOutIdx),
}

#[derive(Clone, Debug, PartialEq)]
pub struct AddrOpnd {
    pub addr: u64,
    pub kind: AddrKind,
    pub ty: Ty,
}

impl OpndT for AddrOpnd {
    fn ty(&self) -> Ty {
        self.ty
    }

    fn kind(&self, ptr_size: u32) -> OpndKind {
        if ptr_size == 4 {
            int_kind(i64::from(self.addr as u32 as i32), Ty::I32, ptr_size)
        } else {
            int_kind(self.addr as i64, Ty::I64, ptr_size)
        }
    }

    fn to_string(&self, _: &Func) -> String {
        match self.kind {
            AddrKind::BailOutRecord(b) => format!("&bailout_record{}", usize::from(b)),
            AddrKind::ScriptContext => "&script_context".to_owned(),
            AddrKind::TaggedInt | AddrKind::Dynamic => format!("0x{:x}", self.addr),
        }
    }
}

/// `[base + index * scale + offset]`.
#[derive(Clone, Debug, PartialEq)]
pub struct IndirOpnd {
    pub base: RegOpnd,
    pub index: Option<RegOpnd>,
    pub scale: u8,
    pub offset: i32,
    pub ty: Ty,
}

impl IndirOpnd {
    pub fn new(base: RegOpnd, offset: i32, ty: Ty) -> Self {
        Self {
            base,
            index: None,
            scale: 1,
            offset,
            ty,
        }
    }
}

impl OpndT for IndirOpnd {
    fn ty(&self) -> Ty {
        self.ty
    }

    fn kind(&self, _: u32) -> OpndKind {
        OpndKind::Mem
    }

    fn to_string(&self, f: &Func) -> String {
        let mut s = format!("[{}", self.base.to_string(f));
        if let Some(idx) = &self.index {
            s.push_str(&format!("+{}*{}", idx.to_string(f), self.scale));
        }
        if self.offset != 0 {
            s.push_str(&format!("{:+}", self.offset));
        }
        s.push(']');
        s.push_str(self.ty.suffix());
        s
    }
}

/// An absolute memory reference.
#[derive(Clone, Debug, PartialEq)]
pub struct MemRefOpnd {
    pub addr: u64,
    pub ty: Ty,
}

impl OpndT for MemRefOpnd {
    fn ty(&self) -> Ty {
        self.ty
    }

    fn kind(&self, _: u32) -> OpndKind {
        OpndKind::Mem
    }

    fn to_string(&self, _: &Func) -> String {
        format!("[0x{:x}]{}", self.addr, self.ty.suffix())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HelperCallOpnd {
    pub helper: HelperMethod,
}

impl OpndT for HelperCallOpnd {
    fn ty(&self) -> Ty {
        Ty::MachPtr
    }

    fn kind(&self, _: u32) -> OpndKind {
        OpndKind::Helper
    }

    fn to_string(&self, _: &Func) -> String {
        format!("&{}", self.helper)
    }
}

/// The address of a label, used for continuation addresses.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelOpnd {
    pub label: InstrIdx,
}

impl OpndT for LabelOpnd {
    fn ty(&self) -> Ty {
        Ty::MachPtr
    }

    fn kind(&self, _: u32) -> OpndKind {
        OpndKind::Label
    }

    fn to_string(&self, _: &Func) -> String {
        format!("&L{}", usize::from(self.label))
    }
}
