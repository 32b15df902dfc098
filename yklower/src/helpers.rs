//! The runtime helper table.
//!
//! Slow paths call into the runtime through a fixed table of entry points. Every helper uses the
//! platform C calling convention and takes at most [MAX_HELPER_ARGS] arguments. Helpers that need
//! the current script context take it as their last argument.

use strum::{Display, EnumCount, EnumIter, FromRepr, IntoEnumIterator};

/// The maximum number of arguments any helper takes (including the script context).
pub const MAX_HELPER_ARGS: usize = 16;

/// Helper addresses are `HELPER_BASE + HELPER_STRIDE * n` for the `n`th helper.
const HELPER_BASE: u64 = 0x7f00_0000;
const HELPER_STRIDE: u64 = 0x100;

/// What a helper returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HelperRet {
    /// A tagged value, in the integer return register.
    Var,
    /// An int32, in the low half of the integer return register.
    I32,
    /// A machine word.
    MachPtr,
    Void,
    /// The helper never returns normally.
    NoReturn,
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, EnumCount, EnumIter, FromRepr, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum HelperMethod {
    Op_Add,
    Op_Subtract,
    Op_Multiply,
    Op_Divide,
    Op_Modulus,
    Op_ShiftLeft,
    Op_ShiftRight,
    Op_ShiftRightU,
    Op_And,
    Op_Or,
    Op_Xor,
    Op_Negate,
    Op_Not,
    Op_Less,
    Op_LessEqual,
    Op_Greater,
    Op_GreaterEqual,
    Op_Equal,
    Op_NotEqual,
    Conv_ToInt32,
    Op_ConvNumber,
    Op_Int32ToAtom,
    Int32Div,
    Int32Rem,
    UInt32Div,
    UInt32Rem,
    ProbeCurrentStack,
    CRT_chkstk,
    SaveAllRegistersAndBailOut,
    Op_TryCatch,
    Op_TryFinally,
    Op_ReturnFromCallWithFakeFrame,
    CreateInterpreterStackFrameForGenerator,
    Op_Throw,
}

/// One row of the helper table.
struct HelperInfo {
    /// The number of arguments, not counting the script context.
    args: usize,
    script_context: bool,
    ret: HelperRet,
}

const fn info(args: usize, script_context: bool, ret: HelperRet) -> HelperInfo {
    HelperInfo {
        args,
        script_context,
        ret,
    }
}

static HELPER_TABLE: [HelperInfo; HelperMethod::COUNT] = [
    info(2, true, HelperRet::Var),       // Op_Add
    info(2, true, HelperRet::Var),       // Op_Subtract
    info(2, true, HelperRet::Var),       // Op_Multiply
    info(2, true, HelperRet::Var),       // Op_Divide
    info(2, true, HelperRet::Var),       // Op_Modulus
    info(2, true, HelperRet::Var),       // Op_ShiftLeft
    info(2, true, HelperRet::Var),       // Op_ShiftRight
    info(2, true, HelperRet::Var),       // Op_ShiftRightU
    info(2, true, HelperRet::Var),       // Op_And
    info(2, true, HelperRet::Var),       // Op_Or
    info(2, true, HelperRet::Var),       // Op_Xor
    info(1, true, HelperRet::Var),       // Op_Negate
    info(1, true, HelperRet::Var),       // Op_Not
    info(2, true, HelperRet::I32),       // Op_Less
    info(2, true, HelperRet::I32),       // Op_LessEqual
    info(2, true, HelperRet::I32),       // Op_Greater
    info(2, true, HelperRet::I32),       // Op_GreaterEqual
    info(2, true, HelperRet::I32),       // Op_Equal
    info(2, true, HelperRet::I32),       // Op_NotEqual
    info(1, true, HelperRet::I32),       // Conv_ToInt32
    info(1, true, HelperRet::Var),       // Op_ConvNumber
    info(1, true, HelperRet::Var),       // Op_Int32ToAtom
    info(2, false, HelperRet::I32),      // Int32Div
    info(2, false, HelperRet::I32),      // Int32Rem
    info(2, false, HelperRet::I32),      // UInt32Div
    info(2, false, HelperRet::I32),      // UInt32Rem
    info(1, true, HelperRet::Void),      // ProbeCurrentStack
    info(1, false, HelperRet::MachPtr),  // CRT_chkstk
    info(1, false, HelperRet::Var),      // SaveAllRegistersAndBailOut
    info(3, true, HelperRet::MachPtr),   // Op_TryCatch
    info(3, true, HelperRet::MachPtr),   // Op_TryFinally
    info(0, false, HelperRet::NoReturn), // Op_ReturnFromCallWithFakeFrame
    info(1, true, HelperRet::MachPtr),   // CreateInterpreterStackFrameForGenerator
    info(1, true, HelperRet::NoReturn),  // Op_Throw
];

impl HelperMethod {
    fn info(self) -> &'static HelperInfo {
        &HELPER_TABLE[self as usize]
    }

    /// The total number of arguments, including the script context if there is one.
    pub fn arg_count(self) -> usize {
        let i = self.info();
        i.args + usize::from(i.script_context)
    }

    pub fn takes_script_context(self) -> bool {
        self.info().script_context
    }

    pub fn ret(self) -> HelperRet {
        self.info().ret
    }

    pub fn addr(self) -> u64 {
        HELPER_BASE + HELPER_STRIDE * u64::from(self as u8)
    }

    pub fn from_addr(addr: u64) -> Option<Self> {
        let off = addr.checked_sub(HELPER_BASE)?;
        if off % HELPER_STRIDE != 0 {
            return None;
        }
        Self::from_repr(u8::try_from(off / HELPER_STRIDE).ok()?)
    }

    /// The generic helper for a tagged-value binary or unary operation.
    pub fn for_var_op(op: crate::ir::Opcode) -> Option<Self> {
        use crate::ir::Opcode;
        Some(match op {
            Opcode::Add => Self::Op_Add,
            Opcode::Sub => Self::Op_Subtract,
            Opcode::Mul => Self::Op_Multiply,
            Opcode::Div => Self::Op_Divide,
            Opcode::Rem => Self::Op_Modulus,
            Opcode::Shl => Self::Op_ShiftLeft,
            Opcode::Shr => Self::Op_ShiftRight,
            Opcode::ShrU => Self::Op_ShiftRightU,
            Opcode::And => Self::Op_And,
            Opcode::Or => Self::Op_Or,
            Opcode::Xor => Self::Op_Xor,
            Opcode::Neg => Self::Op_Negate,
            Opcode::Not => Self::Op_Not,
            Opcode::BrLt => Self::Op_Less,
            Opcode::BrLe => Self::Op_LessEqual,
            Opcode::BrGt => Self::Op_Greater,
            Opcode::BrGe => Self::Op_GreaterEqual,
            Opcode::BrEq => Self::Op_Equal,
            Opcode::BrNeq => Self::Op_NotEqual,
            _ => return None,
        })
    }
}

/// Check the table's invariants.
pub(crate) fn assert_table_well_formed() {
    for h in HelperMethod::iter() {
        assert!(h.arg_count() <= MAX_HELPER_ARGS, "{h} takes too many arguments");
        assert_eq!(HelperMethod::from_addr(h.addr()), Some(h));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn table() {
        assert_table_well_formed();
        assert_eq!(HelperMethod::Op_Add.arg_count(), 3);
        assert_eq!(HelperMethod::Int32Div.arg_count(), 2);
        assert_eq!(HelperMethod::Op_Add.to_string(), "Op_Add");
        assert_eq!(HelperMethod::from_addr(HELPER_BASE + 1), None);
        assert_eq!(HelperMethod::from_addr(0), None);
    }
}
