//! The implementation of the `YKD_LOG*` environment variables.
//!
//! Note that IR logging is only meaningfully available when the `ykd` feature is enabled:
//! otherwise we expose no-op functions.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should the lowerer's logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings (including compile aborts).
    Warning,
    /// Log lowering events (e.g. a function starting or finishing lowering).
    LowerEvent,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("YKD_LOG") {
            Ok(s) => Self::parse(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    fn parse(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // Truncate any existing log so that appends don't extend a previous run's log.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("YKD_LOG must be of the format `[<path|->:]<level>".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid YKD_LOG level '{s}': {e}"))?;
        let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("YKD_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    #[cfg(test)]
    pub(crate) fn level(&self) -> Verbosity {
        self.level
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "yk-error",
                Verbosity::Warning => "yk-warning",
                Verbosity::LowerEvent => "yk-lower-event",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

/// The points in the pipeline at which the instruction list can be dumped.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[allow(dead_code)]
pub(crate) enum IRPhase {
    /// The optimiser's IR, before lowering.
    PreLower,
    /// Lowered, but not yet legalized.
    PostLower,
    /// After legalization.
    Legalized,
    /// After the peephole pass: what the register allocator receives.
    Peephole,
}

#[cfg(not(feature = "ykd"))]
mod internals {
    use super::IRPhase;
    pub(crate) fn should_log_ir(_: IRPhase) -> bool {
        false
    }
    pub(crate) fn log_ir(_: &str) {}
}

#[cfg(feature = "ykd")]
mod internals {
    use super::IRPhase;
    use std::{collections::HashSet, env, error::Error, fs::File, io::Write, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let mut log_phases = HashSet::new();
        if let Ok(x) = env::var("YKD_LOG_IR") {
            let (path, phases) = match x.split(':').collect::<Vec<_>>().as_slice() {
                [path, phases] => (*path, *phases),
                [phases] => ("-", *phases),
                _ => panic!("YKD_LOG_IR must be of the format '[<path>:]<phase_1>[,...,<phase_n>]'"),
            };
            for x in phases.split(',') {
                log_phases.insert(IRPhase::from_str(x).unwrap());
            }
            if path != "-" {
                File::create(path).ok();
            }
            Some((path.to_string(), log_phases))
        } else {
            None
        }
    });

    impl IRPhase {
        fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
            match s {
                "lower-pre" => Ok(Self::PreLower),
                "lower-post" => Ok(Self::PostLower),
                "lower-legalized" => Ok(Self::Legalized),
                "lower-peephole" => Ok(Self::Peephole),
                _ => Err(format!("Invalid YKD_LOG_IR value: {s}").into()),
            }
        }
    }

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        matches!(
            LOG_IR.as_ref().map(|(_, phases)| phases.contains(&phase)),
            Some(true)
        )
    }

    pub(crate) fn log_ir(s: &str) {
        match LOG_IR.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub(crate) use internals::{log_ir, should_log_ir};

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_levels() {
        assert_eq!(Log::parse("3").unwrap().level(), Verbosity::LowerEvent);
        assert_eq!(Log::parse("-:0").unwrap().level(), Verbosity::Disabled);
        assert_eq!(
            Log::parse("4").err().unwrap().to_string(),
            "YKD_LOG level 4 exceeds maximum 3"
        );
        assert!(Log::parse("a:b:c").is_err());
        assert!(Log::parse("x").is_err());
    }
}
