//! Asynchronous, sampling-based call-path profiler core.
//!
//! Built from the bottom up: [`arena`] and [`ids`] are the raw building
//! blocks; [`metric`], [`epoch`], and [`cct`] are the data structures that
//! accumulate a profile; [`state`] ties one thread's accumulation
//! together; [`sampler`] drives it from a timer; [`serialize`] writes the
//! result to disk; [`config`] and [`host`] are the ambient plumbing a
//! real embedding needs around all of the above.

pub mod arena;
pub mod cct;
pub mod config;
pub mod epoch;
pub mod error;
pub mod host;
pub mod ids;
pub mod metric;
pub mod sampler;
pub mod serialize;
pub mod state;

pub use cct::{Cct, ContextChainEntry, Node};
pub use config::{Config, ConfigError};
pub use epoch::{Epoch, EpochRegistry, LoadModule};
pub use error::{FatalError, SampleError};
pub use host::Process;
pub use ids::PersistentIdCounter;
pub use metric::{MetricDescriptor, MetricDescriptorTable, MetricFlags, MetricId, MetricKind, MetricTableError};
pub use sampler::{Sampler, SamplerStatus};
pub use state::{BacktraceBuffer, PersistentIdentity, ThreadFlags, ThreadProfilingState};
