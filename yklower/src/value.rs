//! Tagged value encodings.
//!
//! A dynamic-language value (`Ty::Var`) is a machine word that either directly encodes a small
//! integer (a "tagged int") or is a pointer to a heap object. How small integers are tagged
//! depends on the word size:
//!
//! * On 64-bit targets ([TagScheme::Atom64]) a tagged int is its 32-bit payload zero-extended
//!   with bit 48 set. Every int32 is representable. Heap pointers are always below `1 << 48`.
//! * On 32-bit targets ([TagScheme::LowBit32]) a tagged int is `(v << 1) | 1`, so only 31-bit
//!   integers are representable. Heap pointers are always word-aligned so their low bit is 0.

/// How far the tag is shifted on 64-bit targets.
pub const VAR_TAG_SHIFT: u32 = 48;
/// The tag OR'd into a 64-bit tagged int.
pub const ATOM_TAG: u64 = 1 << VAR_TAG_SHIFT;
/// `(a >> 48) | (b >> 32)` for two 64-bit tagged ints `a` and `b`.
pub const ATOM_TAG_PAIR: i64 = 0x0001_0001;

/// The smallest 31-bit integer.
pub const SMINT31_MIN: i32 = -(1 << 30);
/// The largest 31-bit integer.
pub const SMINT31_MAX: i32 = (1 << 30) - 1;

/// The offset of a heap object's 32-bit type id.
pub const TYPE_ID_OFFSET: i32 = 0;
/// The type id of a boxed number.
pub const TYPE_ID_NUMBER: u64 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagScheme {
    Atom64,
    LowBit32,
}

impl TagScheme {
    /// Can `v` be represented as a tagged int?
    pub fn fits(self, v: i64) -> bool {
        match self {
            TagScheme::Atom64 => i32::try_from(v).is_ok(),
            TagScheme::LowBit32 => (i64::from(SMINT31_MIN)..=i64::from(SMINT31_MAX)).contains(&v),
        }
    }

    /// Tag `v`. Returns `None` if `v` is not representable.
    pub fn tag_int(self, v: i64) -> Option<u64> {
        if !self.fits(v) {
            return None;
        }
        Some(match self {
            TagScheme::Atom64 => u64::from(v as i32 as u32) | ATOM_TAG,
            TagScheme::LowBit32 => u64::from(((v as i32) << 1 | 1) as u32),
        })
    }

    pub fn is_tagged_int(self, x: u64) -> bool {
        match self {
            TagScheme::Atom64 => x >> VAR_TAG_SHIFT == 1,
            TagScheme::LowBit32 => x & 1 == 1,
        }
    }

    /// Untag `x`, returning `None` if it is not a tagged int.
    pub fn untag_int(self, x: u64) -> Option<i32> {
        if !self.is_tagged_int(x) {
            return None;
        }
        Some(match self {
            TagScheme::Atom64 => x as u32 as i32,
            TagScheme::LowBit32 => (x as u32 as i32) >> 1,
        })
    }
}
