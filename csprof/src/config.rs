//! `PROF_*` environment configuration (C9, spec §6.2, SPEC_FULL.md §10.3).
//!
//! Parsed once, at `process_init`, into an immutable [`Config`]. Anything
//! malformed aborts the process rather than silently falling back to a
//! default — spec §6.2 "invalid values abort rather than substitute a
//! default silently", spec §7 "Config value out of range: Abort at
//! startup with a message naming the variable."

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid size (expected a number optionally suffixed with K/k/M/m)")]
    BadSize { var: &'static str, value: String },
    #[error("{var}={value:?} is not a valid integer")]
    BadInt { var: &'static str, value: String },
    #[error("PROF_MAX_METRICS={0} is out of range (0..=10)")]
    MaxMetricsOutOfRange(usize),
    #[error("PROF_OUT_PATH={0:?} does not resolve to a real path")]
    BadOutPath(String),
    #[error("PROF_SAMPLE_PERIOD={0} must be a positive decimal (microseconds)")]
    SamplePeriodNotPositive(u64),
    #[error("PROF_VERBOSITY={0} is out of range (0..=65536)")]
    VerbosityOutOfRange(u32),
}

/// Upper bound on `PROF_VERBOSITY` (spec §6.2: "0-65536 message level").
const MAX_VERBOSITY: u32 = 65536;

/// Process-wide, read-only configuration. Every field has a named
/// default so a host can construct one directly in tests without going
/// through environment variables at all.
#[derive(Debug, Clone)]
pub struct Config {
    /// `PROF_OUT_PATH`: directory profile files are written into.
    pub out_path: std::path::PathBuf,
    /// `PROF_MEM_SZ`: initial arena segment size, in bytes.
    pub mem_sz: usize,
    /// `PROF_SAMPLE_PERIOD`: default sampling period, in microseconds.
    pub sample_period_usec: u64,
    /// `PROF_MAX_METRICS`: upper bound on metric-vector width.
    pub max_metrics: usize,
    /// `PROF_LUSH_AGENTS`: colon-separated logical-unwinder plug-in paths.
    pub lush_agents: Vec<std::path::PathBuf>,
    /// `PROF_WAIT`: spin on a shared volatile before initializing, to let
    /// a debugger attach.
    pub wait: bool,
    /// `PROF_VERBOSITY`: 0–65536 message level, independent of `RUST_LOG`.
    pub verbosity: u32,
    /// `PROF_DEBUG`: bitmask of debug channels, independent of `RUST_LOG`.
    pub debug: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            out_path: std::path::PathBuf::from("."),
            mem_sz: crate::arena::DEFAULT_SEGMENT_SIZE,
            sample_period_usec: 5000,
            max_metrics: 5,
            lush_agents: Vec::new(),
            wait: false,
            verbosity: 0,
            debug: 0,
        }
    }
}

fn parse_size(var: &'static str, value: &str) -> Result<usize, ConfigError> {
    let trimmed = value.trim();
    let (digits, mult) = match trimmed.chars().last() {
        Some('K') | Some('k') => (&trimmed[..trimmed.len() - 1], 1024usize),
        Some('M') | Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        _ => (trimmed, 1),
    };
    digits
        .parse::<usize>()
        .map(|n| n * mult)
        .map_err(|_| ConfigError::BadSize {
            var,
            value: value.to_string(),
        })
}

fn parse_int<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::BadInt {
        var,
        value: value.to_string(),
    })
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "yes")
}

impl Config {
    /// Read `PROF_*` variables from the process environment, overriding
    /// [`Config::default`] field by field. Unset variables keep their
    /// default; present-but-malformed variables are a [`ConfigError`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Config::default();

        if let Ok(v) = std::env::var("PROF_OUT_PATH") {
            if v.trim().is_empty() {
                return Err(ConfigError::BadOutPath(v));
            }
            cfg.out_path = std::path::PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PROF_MEM_SZ") {
            cfg.mem_sz = parse_size("PROF_MEM_SZ", &v)?;
        }
        if let Ok(v) = std::env::var("PROF_SAMPLE_PERIOD") {
            let n: u64 = parse_int("PROF_SAMPLE_PERIOD", &v)?;
            if n == 0 {
                return Err(ConfigError::SamplePeriodNotPositive(n));
            }
            cfg.sample_period_usec = n;
        }
        if let Ok(v) = std::env::var("PROF_MAX_METRICS") {
            let n: usize = parse_int("PROF_MAX_METRICS", &v)?;
            if n > crate::metric::MAX_METRICS_CEILING {
                return Err(ConfigError::MaxMetricsOutOfRange(n));
            }
            cfg.max_metrics = n;
        }
        if let Ok(v) = std::env::var("PROF_LUSH_AGENTS") {
            cfg.lush_agents = v
                .split(':')
                .filter(|s| !s.is_empty())
                .map(std::path::PathBuf::from)
                .collect();
        }
        if let Ok(v) = std::env::var("PROF_WAIT") {
            cfg.wait = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("PROF_VERBOSITY") {
            let n: u32 = parse_int("PROF_VERBOSITY", &v)?;
            if n > MAX_VERBOSITY {
                return Err(ConfigError::VerbosityOutOfRange(n));
            }
            cfg.verbosity = n;
        }
        if let Ok(v) = std::env::var("PROF_DEBUG") {
            cfg.debug = parse_int("PROF_DEBUG", &v)?;
        }

        log::info!(
            "configuration: out_path={} mem_sz={} sample_period_usec={} max_metrics={}",
            cfg.out_path.display(),
            cfg.mem_sz,
            cfg.sample_period_usec,
            cfg.max_metrics,
        );
        Ok(cfg)
    }

    /// Map `PROF_VERBOSITY` onto a [`log::LevelFilter`] for convenience,
    /// independent of whatever `RUST_LOG`/`env_logger` otherwise has
    /// configured (SPEC_FULL.md §6.2) — the raw integer remains available
    /// on `self.verbosity` for a consumer that wants the original
    /// numeric semantics instead.
    pub fn verbosity_level_filter(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Off,
            1 => log::LevelFilter::Error,
            2 => log::LevelFilter::Warn,
            3 => log::LevelFilter::Info,
            4 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    /// Spin on a shared volatile until released, per `PROF_WAIT` (spec
    /// §6.2) — a debugger-attach hook, not a synchronization primitive.
    /// No-op unless `PROF_WAIT` was set.
    pub fn wait_for_debugger(&self, released: &std::sync::atomic::AtomicBool) {
        if !self.wait {
            return;
        }
        log::info!("PROF_WAIT set: spinning until a debugger releases this process");
        while !released.load(std::sync::atomic::Ordering::Acquire) {
            std::hint::spin_loop();
        }
    }
}
