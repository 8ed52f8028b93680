//! Sampling and accounting layer for a high-performance memory allocator.
//!
//! Three tightly coupled pieces share one hard problem: capturing and
//! deduplicating call-stack-keyed data safely against a table a concurrent
//! allocator is mutating, without calling back into that allocator in
//! unsafe ways.
//!
//! - [`AllocationTable`] attributes every live allocation to a
//!   deduplicated call-stack [`Bucket`] and produces [`Snapshot`]s for
//!   leak reporting and diffing.
//! - [`TraceCoalescer`] accumulates raw sampled allocation-site traces
//!   under the allocator's internal lock and flattens them later, off
//!   that lock.
//! - [`Sampler`] drives periodic stack capture from a dedicated timer
//!   thread and forwards samples to a [`Collector`], with a
//!   drain-on-disable control lifecycle.

mod bucket;
mod coalescer;
mod config;
mod profile;
mod sampler;
mod snapshot;
mod table;

pub use {
  bucket::{Bucket, BucketStore, MAX_STACK_DEPTH, Stats},
  coalescer::{SampledTrace, TraceCoalescer},
  config::{ConfigError, PROFILE_PATH_ENV, ProfileEnv, TOGGLE_SIGNAL_ENV},
  profile::{
    PROFILE_FILE_EXT, ProfileError, cleanup_old_profiles, write_profile,
    write_profile_json,
  },
  sampler::{
    BucketCollector, Collector, CollectorState, DEFAULT_FREQUENCY_HZ,
    Profiler, SampleFilter, Sampler, SamplerError, SamplerOptions,
    capture_stack,
  },
  snapshot::Snapshot,
  table::{AllocDetails, AllocationTable},
};
