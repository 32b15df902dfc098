//! Bailout descriptors.
//!
//! A [BailOutInfo] is attached (by index) to every instruction that may need to transfer control
//! back to the interpreter. It names the symbols live at that program point and where execution
//! should resume. When the lowerer emits the bailout path it converts the info into a
//! [BailOutRecord]: the runtime's view of the same information, which the bailout helper uses to
//! rebuild the interpreter's frame.

use super::{InstrIdx, SymIdx};
use std::fmt;

/// Why a bailout happens. The low bits are a primary kind; the high bits are flags that can be
/// combined with some primary kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BailOutKind(u32);

impl BailOutKind {
    /// Unconditional bailout.
    pub const EXPLICIT: Self = Self(1);
    pub const ON_NOT_TAGGED_INT: Self = Self(2);
    pub const ON_NOT_NUMBER: Self = Self(3);
    /// A `Yield` the optimiser could not keep: return to the interpreter instead.
    pub const FOR_GENERATOR_YIELD: Self = Self(4);
    /// Bail if the operation made an implicit call (e.g. a user-defined `valueOf`).
    pub const ON_IMPLICIT_CALLS: Self = Self(5);
    /// An int32 operation whose only bailouts are result conditions.
    pub const INT_ONLY: Self = Self(6);

    pub const ON_OVERFLOW: Self = Self(1 << 16);
    pub const ON_MUL_OVERFLOW: Self = Self(1 << 17);
    pub const ON_NEGATIVE_ZERO: Self = Self(1 << 18);
    pub const ON_DIV_RESULT_NOT_INT: Self = Self(1 << 19);
    /// Also bail if the operation made an implicit call.
    pub const AND_IMPLICIT_CALLS: Self = Self(1 << 20);

    const PRIMARY_MASK: u32 = 0xffff;
    const RESULT_CONDITIONS: u32 = Self::ON_OVERFLOW.0
        | Self::ON_MUL_OVERFLOW.0
        | Self::ON_NEGATIVE_ZERO.0
        | Self::ON_DIV_RESULT_NOT_INT.0;

    pub fn primary(self) -> Self {
        Self(self.0 & Self::PRIMARY_MASK)
    }

    /// Does `self` include all the bits of `other`?
    pub fn contains(self, other: Self) -> bool {
        if other.0 & Self::PRIMARY_MASK != 0 && self.primary() != other.primary() {
            return false;
        }
        self.0 & !Self::PRIMARY_MASK & other.0 == other.0 & !Self::PRIMARY_MASK
    }

    /// Does this kind carry any result-condition bits (overflow, negative zero, ...)?
    pub fn has_result_condition(self) -> bool {
        self.0 & Self::RESULT_CONDITIONS != 0
    }

    pub fn has_implicit_calls(self) -> bool {
        self.primary() == Self::ON_IMPLICIT_CALLS || self.contains(Self::AND_IMPLICIT_CALLS)
    }

    /// Remove the implicit-call bits from this kind.
    pub fn without_implicit_calls(self) -> Self {
        if self.primary() == Self::ON_IMPLICIT_CALLS {
            Self(self.0 & !Self::PRIMARY_MASK & !Self::AND_IMPLICIT_CALLS.0)
        } else {
            Self(self.0 & !Self::AND_IMPLICIT_CALLS.0)
        }
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl std::ops::BitOr for BailOutKind {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        debug_assert!(
            self.0 & Self::PRIMARY_MASK == 0 || rhs.0 & Self::PRIMARY_MASK == 0,
            "two primary bailout kinds"
        );
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for BailOutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        match self.primary() {
            Self::EXPLICIT => parts.push("explicit"),
            Self::ON_NOT_TAGGED_INT => parts.push("not_tagged_int"),
            Self::ON_NOT_NUMBER => parts.push("not_number"),
            Self::FOR_GENERATOR_YIELD => parts.push("generator_yield"),
            Self::ON_IMPLICIT_CALLS => parts.push("implicit_calls"),
            Self::INT_ONLY => parts.push("int_only"),
            _ => (),
        }
        for (k, s) in [
            (Self::ON_OVERFLOW, "overflow"),
            (Self::ON_MUL_OVERFLOW, "mul_overflow"),
            (Self::ON_NEGATIVE_ZERO, "negative_zero"),
            (Self::ON_DIV_RESULT_NOT_INT, "div_result_not_int"),
            (Self::AND_IMPLICIT_CALLS, "implicit_calls"),
        ] {
            if self.0 & k.0 != 0 {
                parts.push(s);
            }
        }
        if parts.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}

/// Where the value of a restored symbol comes from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RestoreLoc {
    /// The symbol's current location (register or stack slot).
    Sym(SymIdx),
    /// A constant known at compile time. The value is in the tagged encoding of the target.
    Const(u64),
}

/// The optimiser's description of one bailout point.
#[derive(Clone, Debug)]
pub struct BailOutInfo {
    pub kind: BailOutKind,
    /// The interpreter offset to resume at.
    pub bytecode_offset: u32,
    /// The polymorphic inline cache slot the guarded operation used, if any.
    pub polymorphic_cache_index: Option<u32>,
    /// Symbols live at the bailout point, in the order the interpreter's frame expects them.
    pub live_syms: Vec<SymIdx>,
    /// Live symbols whose value is a compile-time constant.
    pub constants: Vec<(SymIdx, u64)>,
    /// The record built for this bailout when its path is lowered.
    pub record: Option<BailOutRecord>,
    /// The instruction that branches to (or makes) the bailout once lowered.
    pub instr: Option<InstrIdx>,
}

impl BailOutInfo {
    pub fn new(kind: BailOutKind, bytecode_offset: u32, live_syms: Vec<SymIdx>) -> Self {
        Self {
            kind,
            bytecode_offset,
            polymorphic_cache_index: None,
            live_syms,
            constants: Vec::new(),
            record: None,
            instr: None,
        }
    }
}

/// The runtime form of a bailout point, referenced by the lowered code.
#[derive(Clone, Debug, PartialEq)]
pub struct BailOutRecord {
    pub bytecode_offset: u32,
    pub polymorphic_cache_index: Option<u32>,
    pub kind: BailOutKind,
    /// How to restore each live symbol, in frame order.
    pub restores: Vec<(SymIdx, RestoreLoc)>,
}
