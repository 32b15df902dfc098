//! Statistics about lowering. Durations are wall-clock time, so they are best-effort only.

use parking_lot::Mutex;
#[cfg(not(test))]
use std::env;
use std::{
    fs,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record lowering statistics if enabled. Outside of testing this is only enabled if the
/// environment variable `YKD_LOG_STATS` is set. In testing, it is always enabled, with output
/// sent to `stderr`.
pub(crate) struct Stats {
    // Most runs won't record statistics, so the outer `Option` makes "are stats enabled?" a simple
    // null check: only if they are do we take the lock.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    /// How many functions were lowered successfully?
    funcs_lowered_ok: u64,
    /// How many functions aborted lowering and were compiled as interpreter stubs?
    funcs_aborted: u64,
    /// How many guarded fast paths were emitted?
    fast_paths: u64,
    /// How many helper calls were emitted?
    helper_calls: u64,
    /// How many calls (other than helper calls) were lowered?
    calls: u64,
    /// How many bailout paths were emitted?
    bailouts: u64,
    /// The time spent in each [Phase].
    durations: [Duration; Phase::COUNT],
}

/// Counts gathered while lowering one function, merged into [Stats] when it finishes.
#[derive(Clone, Debug, Default)]
pub(crate) struct FuncCounts {
    pub(crate) fast_paths: u64,
    pub(crate) helper_calls: u64,
    pub(crate) calls: u64,
    pub(crate) bailouts: u64,
}

impl Stats {
    #[cfg(not(test))]
    pub(crate) fn new() -> Self {
        if let Ok(p) = env::var("YKD_LOG_STATS") {
            Self {
                inner: Some(Mutex::new(StatsInner::new(p))),
            }
        } else {
            Self { inner: None }
        }
    }

    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// If stats are enabled, update `inner` by running the function `f`, otherwise return
    /// immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            f(&mut mtx.lock());
        }
    }

    pub(crate) fn func_lowered_ok(&self, counts: &FuncCounts) {
        self.update_with(|inner| {
            inner.funcs_lowered_ok += 1;
            inner.fast_paths += counts.fast_paths;
            inner.helper_calls += counts.helper_calls;
            inner.calls += counts.calls;
            inner.bailouts += counts.bailouts;
        });
    }

    pub(crate) fn func_aborted(&self) {
        self.update_with(|inner| inner.funcs_aborted += 1);
    }

    /// Record that `phase` started at `start` and has just finished.
    pub(crate) fn phase_done(&self, phase: Phase, start: Instant) {
        self.update_with(|inner| {
            let d = Instant::now().saturating_duration_since(start);
            inner.durations[phase as usize] = inner.durations[phase as usize].saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }

    #[cfg(test)]
    pub(crate) fn to_json(&self) -> String {
        self.inner.as_ref().unwrap().lock().to_json()
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            funcs_lowered_ok: 0,
            funcs_aborted: 0,
            fast_paths: 0,
            helper_calls: 0,
            calls: 0,
            bailouts: 0,
            durations: [Duration::new(0, 0); Phase::COUNT],
        }
    }

    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is sorted by field name so that tests can
    /// match it textually.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = vec![
            (
                "funcs_lowered_ok".to_owned(),
                self.funcs_lowered_ok.to_string(),
            ),
            ("funcs_aborted".to_owned(), self.funcs_aborted.to_string()),
            ("fast_paths".to_owned(), self.fast_paths.to_string()),
            ("helper_calls".to_owned(), self.helper_calls.to_string()),
            ("calls".to_owned(), self.calls.to_string()),
            ("bailouts".to_owned(), self.bailouts.to_string()),
        ];
        for v in Phase::iter() {
            fields.push((v.to_string(), fmt_duration(self.durations[v as usize])));
        }
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

/// The timed phases of the lowering pipeline.
#[repr(u8)]
#[derive(Copy, Clone, Display, EnumCount, EnumIter)]
pub(crate) enum Phase {
    #[strum(to_string = "duration_lowering")]
    Lowering,
    #[strum(to_string = "duration_legalizing")]
    Legalizing,
    #[strum(to_string = "duration_peephole")]
    Peephole,
}
