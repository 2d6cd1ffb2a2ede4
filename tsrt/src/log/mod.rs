//! The implementation of the `TSD_LOG*` environment variables.

use std::{collections::HashSet, env, error::Error, fs::File, io::Write, path::PathBuf, sync::LazyLock};
use strum::{EnumCount, FromRepr};

pub(crate) mod stats;

/// How verbose should tsrt's normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub(crate) enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors.
    Error,
    /// Log warnings.
    Warning,
    /// Log specialization events (e.g. portal compiled, promotion resumed).
    SpecializationEvent,
    /// Log merge point and split decisions.
    MergeEvent,
}

pub(crate) struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` means stderr.
    path: Option<PathBuf>,
}

impl Log {
    pub(crate) fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("TSD_LOG") {
            Ok(s) => {
                let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
                    [path, level] => {
                        if path == "-" {
                            (None, level)
                        } else {
                            let path = PathBuf::from(path);
                            // Each run starts with an empty log.
                            File::create(&path).ok();
                            (Some(path), level)
                        }
                    }
                    [level] => (None, level),
                    [..] => return Err("TSD_LOG must be of the format `[<path|->:]<level>".into()),
                };
                let level = level
                    .parse::<u8>()
                    .map_err(|e| format!("Invalid TSD_LOG level '{s}': {e}"))?;
                // `Verbosity` is `repr(u8)`, so its count always fits.
                let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
                let level = Verbosity::from_repr(level)
                    .ok_or_else(|| format!("TSD_LOG level {level} exceeds maximum {max_level}"))?;
                Ok(Self { path, level })
            }
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    /// Log `msg` with the [Verbosity] level `verbosity`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub(crate) fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "tsrt-error",
                Verbosity::Warning => "tsrt-warning",
                Verbosity::SpecializationEvent => "tsrt-specialization",
                Verbosity::MergeEvent => "tsrt-merge",
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

#[derive(Eq, Hash, PartialEq)]
pub(crate) enum IRPhase {
    /// The colours the hint annotator assigned to each graph.
    Hint,
    /// The timeshifted graphs after transformation and op resolution.
    TsGraph,
    /// The machine code emitted by builders.
    Asm,
}

impl IRPhase {
    fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
        match s {
            "hint" => Ok(Self::Hint),
            "ts-graph" => Ok(Self::TsGraph),
            "asm" => Ok(Self::Asm),
            _ => Err(format!("Invalid TSD_LOG_IR value: {s}").into()),
        }
    }
}

static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
    let mut log_phases = HashSet::new();
    if let Ok(x) = env::var("TSD_LOG_IR") {
        let (path, phases) = match x.split(':').collect::<Vec<_>>().as_slice() {
            [path, phases] => (*path, *phases),
            [phases] => ("-", *phases),
            _ => panic!("TSD_LOG_IR must be of the format '[<path>:]<phase_1>[,...,<phase_n>]'"),
        };
        for x in phases.split(',') {
            log_phases.insert(IRPhase::from_str(x).unwrap());
        }
        if path != "-" {
            // Each run starts with an empty log.
            File::create(path).ok();
        }
        Some((path.to_string(), log_phases))
    } else {
        None
    }
});

pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
    if let Some(true) = LOG_IR.as_ref().map(|(_, phases)| phases.contains(&phase)) {
        return true;
    }
    false
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
