//! Lowering policy.

use std::{env, error::Error};

/// Run-time lowering options. Each can be set by a `YK_LOWER_*` environment variable, which must
/// be `0` or `1`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LowerOpts {
    /// `YK_LOWER_FASTPATHS`: emit guarded inline fast paths. If false, every dynamically typed
    /// operation becomes an unconditional helper call.
    pub fast_paths: bool,
    /// `YK_LOWER_HELPER_FALLBACK`: if false, a conversion that cannot be proven safe without a
    /// helper call aborts compilation instead.
    pub helper_fallback: bool,
    /// `YK_LOWER_FAST_DIV`: strength-reduce division by constants.
    pub fast_div: bool,
    /// `YK_LOWER_PEEPHOLE`: run the peephole rewrites.
    pub peephole: bool,
}

impl Default for LowerOpts {
    fn default() -> Self {
        Self {
            fast_paths: true,
            helper_fallback: true,
            fast_div: true,
            peephole: true,
        }
    }
}

impl LowerOpts {
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        let mut opts = Self::default();
        for (var, field) in [
            ("YK_LOWER_FASTPATHS", &mut opts.fast_paths),
            ("YK_LOWER_HELPER_FALLBACK", &mut opts.helper_fallback),
            ("YK_LOWER_FAST_DIV", &mut opts.fast_div),
            ("YK_LOWER_PEEPHOLE", &mut opts.peephole),
        ] {
            if let Ok(x) = env::var(var) {
                *field = parse_flag(var, &x)?;
            }
        }
        Ok(opts)
    }

    /// Options with every fast path disabled: the reference helper-only lowering.
    pub fn helpers_only() -> Self {
        Self {
            fast_paths: false,
            fast_div: false,
            ..Self::default()
        }
    }
}

fn parse_flag(var: &str, s: &str) -> Result<bool, Box<dyn Error>> {
    match s {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => Err(format!("{var} must be '0' or '1', not '{s}'").into()),
    }
}
