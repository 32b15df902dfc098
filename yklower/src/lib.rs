//! Machine-dependent lowering for yk's method JIT.
//!
//! This crate takes the machine-independent instruction list produced by the optimiser (see
//! [ir]) and turns it, for one of four targets, into a machine-dependent instruction list that
//! the register allocator and encoder can consume. The pipeline for one function is:
//!
//! ```text
//! ir::Func --Lowerer--> MD instructions --legalize--> legal MD instructions --peephole--> LoweredFunc
//! ```
//!
//! The architecture-independent half of every lowering lives in [lower]; the architecture
//! specific half is behind the [target::TargetLowering] trait, with one implementation per ABI.

#![allow(clippy::type_complexity)]
#![allow(clippy::upper_case_acronyms)]
#![allow(clippy::comparison_chain)]
#![allow(clippy::too_many_arguments)]

pub mod config;
pub mod helpers;
pub mod ir;
mod legalize;
mod log;
pub mod lower;
mod peephole;
pub mod target;
#[cfg(test)]
mod testing;
pub mod value;
#[cfg(any(test, feature = "yk_lower_verify"))]
pub mod verify;

pub use config::LowerOpts;
pub use lower::{lower_func, AbortReason, CompileOutcome, Jit, LoweredFunc};
pub use target::Target;
