//! The two x64 calling conventions.

use super::{X64Abi, X64Reg};
use crate::target::{ArgKind, ArgLoc, RegT, Target};

/// The Windows x64 convention: the first four arguments go in registers by position (an integer
/// in `RCX`, `RDX`, `R8`, `R9` or a float in `XMM0`-`XMM3`), the rest on the stack. The caller
/// always reserves 32 bytes of "shadow space" for the callee to home its register arguments in,
/// so the `n`th argument's stack slot is at `8 * n` whether or not it was passed in a register.
pub(crate) struct WinX64;

const WIN_INT_ARGS: [X64Reg; 4] = [X64Reg::RCX, X64Reg::RDX, X64Reg::R8, X64Reg::R9];
const WIN_FLOAT_ARGS: [X64Reg; 4] = [X64Reg::XMM0, X64Reg::XMM1, X64Reg::XMM2, X64Reg::XMM3];

impl X64Abi for WinX64 {
    const TARGET: Target = Target::WinX64;
    const CALLEE_SAVED: &'static [X64Reg] = &[
        X64Reg::RBX,
        X64Reg::RSI,
        X64Reg::RDI,
        X64Reg::R12,
        X64Reg::R13,
        X64Reg::R14,
        X64Reg::R15,
    ];
    const CALLEE_SAVED_XMM: &'static [X64Reg] = &[
        X64Reg::XMM6,
        X64Reg::XMM7,
        X64Reg::XMM8,
        X64Reg::XMM9,
        X64Reg::XMM10,
        X64Reg::XMM11,
        X64Reg::XMM12,
        X64Reg::XMM13,
        X64Reg::XMM14,
        X64Reg::XMM15,
    ];
    const SHADOW_SPACE: u32 = 32;
    const HOME_PARAMS: bool = true;

    fn arg_locs(kinds: &[ArgKind]) -> Vec<ArgLoc> {
        kinds
            .iter()
            .enumerate()
            .map(|(i, k)| match (i, k) {
                (0..=3, ArgKind::Int) => ArgLoc::Reg(WIN_INT_ARGS[i].regidx()),
                (0..=3, ArgKind::Float) => ArgLoc::Reg(WIN_FLOAT_ARGS[i].regidx()),
                _ => ArgLoc::Stack(8 * u32::try_from(i).unwrap()),
            })
            .collect()
    }
}

/// The System V AMD64 convention: integers and floats are assigned to their own register
/// sequences independently, and whatever does not fit goes on the stack in order with no shadow
/// space.
pub(crate) struct SysVX64;

const SYSV_INT_ARGS: [X64Reg; 6] = [
    X64Reg::RDI,
    X64Reg::RSI,
    X64Reg::RDX,
    X64Reg::RCX,
    X64Reg::R8,
    X64Reg::R9,
];
const SYSV_FLOAT_ARGS: [X64Reg; 8] = [
    X64Reg::XMM0,
    X64Reg::XMM1,
    X64Reg::XMM2,
    X64Reg::XMM3,
    X64Reg::XMM4,
    X64Reg::XMM5,
    X64Reg::XMM6,
    X64Reg::XMM7,
];

impl X64Abi for SysVX64 {
    const TARGET: Target = Target::SysVX64;
    const CALLEE_SAVED: &'static [X64Reg] = &[
        X64Reg::RBX,
        X64Reg::R12,
        X64Reg::R13,
        X64Reg::R14,
        X64Reg::R15,
    ];
    const CALLEE_SAVED_XMM: &'static [X64Reg] = &[];
    const SHADOW_SPACE: u32 = 0;
    const HOME_PARAMS: bool = false;

    fn arg_locs(kinds: &[ArgKind]) -> Vec<ArgLoc> {
        let (mut ints, mut floats, mut stack) = (0, 0, 0);
        kinds
            .iter()
            .map(|k| match k {
                ArgKind::Int if ints < SYSV_INT_ARGS.len() => {
                    ints += 1;
                    ArgLoc::Reg(SYSV_INT_ARGS[ints - 1].regidx())
                }
                ArgKind::Float if floats < SYSV_FLOAT_ARGS.len() => {
                    floats += 1;
                    ArgLoc::Reg(SYSV_FLOAT_ARGS[floats - 1].regidx())
                }
                _ => {
                    stack += 8;
                    ArgLoc::Stack(stack - 8)
                }
            })
            .collect()
    }
}
