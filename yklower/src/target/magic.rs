//! Magic numbers for division by constants.
//!
//! Division of an int32 by a constant `d` can be replaced by a multiply-high by a "magic" number
//! `M`, a shift `s`, and a small correction. The computations below are those of Hacker's
//! Delight (2nd ed.), chapter 10.

/// Magic numbers for signed division by `d`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SignedMagic {
    pub(crate) multiplier: i32,
    pub(crate) shift: u32,
}

/// Magic numbers for unsigned division by `d`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct UnsignedMagic {
    pub(crate) multiplier: u32,
    /// If true, the quotient needs the "add" fix-up: `q = (((n - q) >> 1) + q) >> (shift - 1)`.
    pub(crate) add: bool,
    pub(crate) shift: u32,
}

/// Compute the magic numbers for signed division by `d`.
///
/// # Panics
///
/// If `d` is -1, 0 or 1.
pub(crate) fn signed_magic(d: i32) -> SignedMagic {
    assert!(!(-1..=1).contains(&d), "no magic number for {d}");
    const TWO31: u32 = 0x8000_0000;
    let ad = d.unsigned_abs();
    let t = TWO31 + ((d as u32) >> 31);
    // Absolute value of nc.
    let anc = t - 1 - t % ad;
    let mut p = 31;
    let mut q1 = TWO31 / anc;
    let mut r1 = TWO31 - q1 * anc;
    let mut q2 = TWO31 / ad;
    let mut r2 = TWO31 - q2 * ad;
    loop {
        p += 1;
        q1 = q1.wrapping_mul(2);
        r1 = r1.wrapping_mul(2);
        if r1 >= anc {
            q1 = q1.wrapping_add(1);
            r1 = r1.wrapping_sub(anc);
        }
        q2 = q2.wrapping_mul(2);
        r2 = r2.wrapping_mul(2);
        if r2 >= ad {
            q2 = q2.wrapping_add(1);
            r2 = r2.wrapping_sub(ad);
        }
        let delta = ad - r2;
        if !(q1 < delta || (q1 == delta && r1 == 0)) {
            break;
        }
    }
    let m = q2.wrapping_add(1) as i32;
    SignedMagic {
        multiplier: if d < 0 { m.wrapping_neg() } else { m },
        shift: p - 32,
    }
}

/// Compute the magic numbers for unsigned division by `d`.
///
/// # Panics
///
/// If `d` is 0.
pub(crate) fn unsigned_magic(d: u32) -> UnsignedMagic {
    assert!(d != 0, "no magic number for 0");
    let mut add = false;
    let nc = u32::MAX - 0u32.wrapping_sub(d) % d;
    let mut p = 31;
    let mut q1 = 0x8000_0000 / nc;
    let mut r1 = 0x8000_0000 - q1 * nc;
    let mut q2 = 0x7fff_ffff / d;
    let mut r2 = 0x7fff_ffff - q2 * d;
    loop {
        p += 1;
        if r1 >= nc - r1 {
            q1 = q1.wrapping_mul(2).wrapping_add(1);
            r1 = r1.wrapping_mul(2).wrapping_sub(nc);
        } else {
            q1 = q1.wrapping_mul(2);
            r1 = r1.wrapping_mul(2);
        }
        if r2.wrapping_add(1) >= d - r2 {
            if q2 >= 0x7fff_ffff {
                add = true;
            }
            q2 = q2.wrapping_mul(2).wrapping_add(1);
            r2 = r2.wrapping_mul(2).wrapping_add(1).wrapping_sub(d);
        } else {
            if q2 >= 0x8000_0000 {
                add = true;
            }
            q2 = q2.wrapping_mul(2);
            r2 = r2.wrapping_mul(2).wrapping_add(1);
        }
        let delta = d - 1 - r2;
        if !(p < 64 && (q1 < delta || (q1 == delta && r1 == 0))) {
            break;
        }
    }
    UnsignedMagic {
        multiplier: q2.wrapping_add(1),
        add,
        shift: p - 32,
    }
}

/// If `d`'s magnitude is a power of two, return its log2.
pub(crate) fn log2_of_pow2(d: u32) -> Option<u32> {
    if d.is_power_of_two() {
        Some(d.trailing_zeros())
    } else {
        None
    }
}
