//! # Collective Benchmark Library
//!
//! A distributed micro-benchmark harness: a fixed group of processes (each
//! running one or more local worker threads) repeatedly executes a timed
//! operation and reports latency and bandwidth statistics that are
//! consistent across the whole group.
//!
//! The hard part, and the focus of this crate, is the synchronization
//! core. The timed operation is typically itself a cross-process collective
//! call, so the group must agree on membership, on the start of every timed
//! phase, and critically on the exact number of iterations to run: a count
//! mismatch between ranks does not skew the numbers, it hangs the run.
//!
//! ## Architecture Overview
//!
//! - `stats`: append-only latency sample sets and their sorted distribution
//! - `worker`: fixed pool of job-executing threads, one OS thread each
//! - `transport`: the point-to-point `Device`/`Pair` seam (tcp, uds)
//! - `store`: key-value stores backing the rendezvous (file, tcp)
//! - `rendezvous`: group membership and full-mesh context establishment
//! - `collectives`: the barrier and broadcast primitives
//! - `benchmark`: the timed-operation trait and built-in workloads
//! - `runner`: orchestration (warmup, negotiation, measurement, merging)
//! - `results`: sweep records, bandwidth derivation, rank-0 reporting
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use collective_bench::{builtin_factory, Options, Runner};
//! use collective_bench::cli::BenchmarkKind;
//!
//! fn main() -> anyhow::Result<()> {
//!     let options = Options {
//!         store_path: Some("/tmp/bench-store".into()),
//!         threads: 2,
//!         elements: 1000,
//!         iteration_count: 100,
//!         ..Options::default()
//!     };
//!     let workload = builtin_factory(BenchmarkKind::Ring, options.data_type);
//!     let mut runner = Runner::new(options)?;
//!     let records = runner.run(&workload)?;
//!     println!("p50 = {}ns", records[0].p50_ns);
//!     Ok(())
//! }
//! ```
//!
//! ## Group synchronization protocol
//!
//! Every sweep point runs the same sequence on every process: contexts are
//! minted per worker, an optional correctness pass runs under a barrier,
//! a warmup pass measures the operation, rank 0 broadcasts the warmup
//! median, every rank computes `max(1, target / median)` iterations from
//! that one agreed value, and the measurement pass starts behind another
//! barrier. Only rank 0 emits output.

pub mod benchmark;
pub mod cli;
pub mod collectives;
pub mod error;
pub mod logging;
pub mod rendezvous;
pub mod results;
pub mod runner;
pub mod stats;
pub mod store;
pub mod transport;
pub mod worker;

// Re-export the types that make up the primary surface.

pub use benchmark::{builtin_factory, Benchmark, BenchmarkFactory, DataType};
pub use cli::{Args, BenchmarkKind, Options};
pub use collectives::{Barrier, Broadcast};
pub use error::Error;
pub use rendezvous::{ContextFactory, GroupContext, GroupRendezvous};
pub use results::{Reporter, SweepRecord};
pub use runner::Runner;
pub use stats::{Distribution, Samples};
pub use worker::{Job, JobHandle, Worker};

/// The current version of the benchmark suite, from Cargo.toml.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values.
pub mod defaults {
    use std::time::Duration;

    /// One worker thread keeps the default run free of local scheduling
    /// noise; concurrency is opt-in via `--threads`.
    pub const THREADS: usize = 1;

    /// Zero elements selects the geometric sweep.
    pub const ELEMENTS: usize = 0;

    /// Zero selects time-based mode: the count is negotiated from the
    /// warmup median so that the measurement pass fills the target
    /// duration.
    pub const ITERATION_COUNT: usize = 0;

    /// Target duration of a time-based measurement pass.
    pub const ITERATION_TIME: Duration = Duration::from_secs(2);

    /// Warmup iterations per worker. Enough samples for a stable median
    /// without stretching the sweep.
    pub const WARMUP_ITERATION_COUNT: usize = 10;

    /// Store key prefix; vary it per run when a store is reused.
    pub const STORE_PREFIX: &str = "collective-bench";

    /// Patience for peers that are still binding listeners or publishing
    /// addresses while the group assembles.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
}
