//! This module records statistics about specialization. Durations are wall-clock time and are
//! very much in "best effort" territory.

#[cfg(not(test))]
use std::env;
use std::{
    cell::Cell,
    fs,
    ops::DerefMut,
    sync::Mutex,
    time::{Duration, Instant},
};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// Record statistics if enabled. In non-testing mode, this is only enabled if the end user
/// defines the environment variable `TSD_LOG_STATS`. In testing mode, this is always enabled,
/// with output being sent to `stderr`.
pub(crate) struct Stats {
    // Most runs won't record statistics, so "are stats enabled?" should be a simple `None`
    // check.
    inner: Option<Mutex<StatsInner>>,
}

struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    /// How many portal specializations were compiled successfully?
    portals_compiled_ok: u64,
    /// How many portal specializations failed to compile?
    portals_compiled_err: u64,
    /// How many residual blocks were started at merge points?
    blocks_started: u64,
    /// How many times did a merge point have to generalize?
    merges_generalized: u64,
    /// How many flexswitch arms were added by promotion?
    flexswitch_arms: u64,
    /// How many times was specialization resumed from a promotion point?
    continuations: u64,
    /// How many machine code blocks were opened (fresh or recycled)?
    code_blocks_opened: u64,
    /// The time spent in each [TimingState].
    durations: [Duration; TimingState::COUNT],
}

impl Stats {
    #[cfg(not(test))]
    pub fn new() -> Self {
        if let Ok(p) = env::var("TSD_LOG_STATS") {
            Self {
                inner: Some(Mutex::new(StatsInner::new(p))),
            }
        } else {
            Self { inner: None }
        }
    }

    #[cfg(test)]
    pub fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// If `TSD_LOG_STATS` was specified, update `inner` by running the function `f`, otherwise
    /// return immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            let mut lk = mtx.lock().unwrap();
            f(lk.deref_mut());
        }
    }

    /// Increment the "a portal specialization was compiled successfully" count.
    pub fn portal_compiled_ok(&self) {
        self.update_with(|inner| inner.portals_compiled_ok += 1);
    }

    /// Increment the "a portal specialization failed to compile" count.
    pub fn portal_compiled_err(&self) {
        self.update_with(|inner| inner.portals_compiled_err += 1);
    }

    /// Increment the "a residual block was started at a merge point" count.
    pub fn block_started(&self) {
        self.update_with(|inner| inner.blocks_started += 1);
    }

    /// Increment the "a merge point generalized" count.
    pub fn merge_generalized(&self) {
        self.update_with(|inner| inner.merges_generalized += 1);
    }

    /// Increment the "a flexswitch arm was added" count.
    pub fn flexswitch_arm(&self) {
        self.update_with(|inner| inner.flexswitch_arms += 1);
    }

    /// Increment the "specialization resumed from a promotion point" count.
    pub fn continuation(&self) {
        self.update_with(|inner| inner.continuations += 1);
    }

    /// Increment the "a machine code block was opened" count.
    pub fn code_block_opened(&self) {
        self.update_with(|inner| inner.code_blocks_opened += 1);
    }

    /// Change the [TimingState] the current thread is in.
    pub fn timing_state(&self, new_state: TimingState) {
        self.update_with(|inner| {
            let now = Instant::now();
            let (prev_state, then) = TS_STATE.replace((new_state, now));
            let d = now.saturating_duration_since(then);
            inner.durations[prev_state as usize] =
                inner.durations[prev_state as usize].saturating_add(d);
        });
    }

    /// Output these statistics to the appropriate output path.
    pub(crate) fn output(&self) {
        self.update_with(|inner| inner.output());
    }

    /// The current value of the counter `name`, as named in the JSON output.
    #[cfg(test)]
    pub(crate) fn counter(&self, name: &str) -> u64 {
        let mut x = 0;
        self.update_with(|inner| {
            x = match name {
                "portals_compiled_ok" => inner.portals_compiled_ok,
                "portals_compiled_err" => inner.portals_compiled_err,
                "blocks_started" => inner.blocks_started,
                "merges_generalized" => inner.merges_generalized,
                "flexswitch_arms" => inner.flexswitch_arms,
                "continuations" => inner.continuations,
                "code_blocks_opened" => inner.code_blocks_opened,
                _ => panic!("no counter {name}"),
            }
        });
        x
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            portals_compiled_ok: 0,
            portals_compiled_err: 0,
            blocks_started: 0,
            merges_generalized: 0,
            flexswitch_arms: 0,
            continuations: 0,
            code_blocks_opened: 0,
            durations: [Duration::new(0, 0); TimingState::COUNT],
        }
    }

    /// Output these statistics to the appropriate output path.
    fn output(&self) {
        let json = self.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }

    /// Turn these statistics into JSON. The output is guaranteed to be sorted by field name so
    /// that textual matching of the JSON string is possible.
    fn to_json(&self) -> String {
        fn fmt_duration(d: Duration) -> String {
            format!("{}.{:03}", d.as_secs(), d.subsec_millis())
        }

        let mut fields = vec![
            ("portals_compiled_ok", self.portals_compiled_ok.to_string()),
            ("portals_compiled_err", self.portals_compiled_err.to_string()),
            ("blocks_started", self.blocks_started.to_string()),
            ("merges_generalized", self.merges_generalized.to_string()),
            ("flexswitch_arms", self.flexswitch_arms.to_string()),
            ("continuations", self.continuations.to_string()),
            ("code_blocks_opened", self.code_blocks_opened.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v))
        .collect::<Vec<_>>();
        for v in TimingState::iter() {
            let s = v.to_string();
            if !s.is_empty() {
                fields.push((s, fmt_duration(self.durations[v as usize])));
            }
        }
        // We sort the output fields so that tests can match the output with a simple text match.
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

/// The different timing states specialization goes through.
#[repr(u8)]
#[derive(Copy, Clone, Display, EnumCount, EnumIter)]
// New states must keep the variants in `0..TimingState::COUNT` (no `= <int>`), and their
// `to_string` is the JSON key (an empty string hides the state).
pub(crate) enum TimingState {
    /// Time not attributed to anything.
    #[strum(to_string = "")]
    None,
    /// Running the hint annotator.
    #[strum(to_string = "duration_hint_annotating")]
    HintAnnotating,
    /// Transforming and resolving timeshifted graphs.
    #[strum(to_string = "duration_timeshifting")]
    Timeshifting,
    /// Interpreting timeshifted graphs to generate machine code.
    #[strum(to_string = "duration_specializing")]
    Specializing,
}

thread_local! {
    static TS_STATE: Cell<(TimingState, Instant)> = Cell::new((TimingState::None, Instant::now()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use fm::FMatcher;

    #[test]
    fn json_sorted() {
        let mut inner = StatsInner::new("-".to_owned());
        inner.blocks_started = 3;
        inner.flexswitch_arms = 2;
        let json = inner.to_json();
        let ptn = r#"{
    "blocks_started": 3,
    "code_blocks_opened": 0,
    "continuations": 0,
    "duration_hint_annotating": ...
    "duration_specializing": ...
    "duration_timeshifting": ...
    "flexswitch_arms": 2,
    "merges_generalized": 0,
    "portals_compiled_err": 0,
    "portals_compiled_ok": 0
}"#;
        FMatcher::new(ptn).unwrap().matches(&json).unwrap();
    }

    #[test]
    fn counters() {
        let stats = Stats::new();
        stats.block_started();
        stats.block_started();
        stats.continuation();
        let lk = stats.inner.as_ref().unwrap().lock().unwrap();
        assert_eq!(lk.blocks_started, 2);
        assert_eq!(lk.continuations, 1);
    }
}
