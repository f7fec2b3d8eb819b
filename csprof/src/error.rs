//! Top-level error type (spec §7, SPEC_FULL.md §10.2).

use thiserror::Error;

use crate::metric::MetricTableError;
use csprof_unwind::UnwindError;

/// Errors recoverable within a single sample: the sampler logs them,
/// bumps a counter, and resumes the mutator. `on_signal` itself only ever
/// returns `EpochLocked` as an `Err` — an unsafe context or a bad unwind
/// are counted (`trampoline_samples`/`bad_unwind_count`) and reported as
/// `Ok(())`, per spec §4.4/§7's "discarded samples are counted, not
/// propagated as failures" — but both variants stay part of the public
/// type since a caller may want to construct or match on them directly.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("unwind failed: {0}")]
    Unwind(#[from] UnwindError),
    #[error("sample arrived while epoch registry was locked")]
    EpochLocked,
    #[error("sample arrived in an unsafe context")]
    UnsafeContext,
}

/// Errors that abort the process (spec §7 "process-fatal"): a failed
/// arena growth (handled by the allocator itself, so it never reaches
/// this type), a malformed configuration, or an I/O failure writing the
/// final profile.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("metric table error: {0}")]
    Metric(#[from] MetricTableError),
    #[error("failed to write profile: {0}")]
    Io(#[from] std::io::Error),
    #[error("refusing to overwrite existing profile at {0}")]
    ProfileExists(std::path::PathBuf),
}
