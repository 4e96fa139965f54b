//! The orchestrator: owns the worker pool, drives rendezvous, runs the
//! synchronization primitives, negotiates the iteration count and merges
//! results.
//!
//! Every timed phase is bracketed the same way on every process: build one
//! job per worker, pass a group barrier, assign, wait, merge. The barrier
//! is what keeps a fast-starting process from calling into the collective
//! operation before a slow peer has even entered the phase; without it
//! the numbers would be corrupted at best and the group deadlocked at
//! worst.

use crate::benchmark::BenchmarkFactory;
use crate::cli::Options;
use crate::collectives::{Barrier, Broadcast};
use crate::error::Error;
use crate::rendezvous::{self, ContextFactory, GroupRendezvous};
use crate::results::{Reporter, RunMetadata, SweepRecord};
use crate::stats::{Distribution, Samples};
use crate::transport::{self, Device};
use crate::worker::{BoxedOp, Job, Worker};
use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BROADCAST_ROOT: usize = 0;

// Sweep points: {1, 2, 5} per decade from 100 to 5,000,000 elements.
const SWEEP_FIRST_DECADE: usize = 100;
const SWEEP_LAST_DECADE: usize = 1_000_000;
const SWEEP_SUB_STEPS: [usize; 3] = [1, 2, 5];

pub struct Runner {
    options: Options,
    device: Arc<dyn Device>,
    workers: Vec<Worker>,
    // Taken in declaration order during drop: every context must be gone
    // before the rendezvous backend is finalized.
    barrier: Option<Barrier>,
    broadcast: Option<Broadcast>,
    factory: Option<ContextFactory>,
    rendezvous: Box<dyn GroupRendezvous>,
    reporter: Reporter,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("options", &self.options)
            .field("workers", &self.workers)
            .field("barrier", &self.barrier)
            .field("broadcast", &self.broadcast)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Resolve the transport and rendezvous from the options and stand up
    /// the full harness: worker pool, group membership and the two
    /// synchronization primitives.
    pub fn new(options: Options) -> Result<Self> {
        let rendezvous = rendezvous::resolve(&options)?;
        Self::with_rendezvous(options, rendezvous)
    }

    /// Same as [`Runner::new`] with a caller-supplied rendezvous backend.
    pub fn with_rendezvous(
        options: Options,
        mut rendezvous: Box<dyn GroupRendezvous>,
    ) -> Result<Self> {
        let device = transport::create_device(&options.transport)?;

        let mut workers = Vec::with_capacity(options.threads);
        for index in 0..options.threads {
            workers.push(Worker::spawn(index)?);
        }

        let factory = rendezvous.establish()?;
        let broadcast = Broadcast::new(factory.make_context(device.as_ref())?, BROADCAST_ROOT);
        let barrier = Barrier::new(factory.make_context(device.as_ref())?);
        info!(
            rank = factory.rank(),
            size = factory.size(),
            "process group established"
        );

        let metadata = RunMetadata::collect(&options, factory.size());
        let reporter = Reporter::new(
            factory.rank(),
            options.show_nanos,
            options.output_file.clone(),
            metadata,
        );

        Ok(Self {
            options,
            device,
            workers,
            barrier: Some(barrier),
            broadcast: Some(broadcast),
            factory: Some(factory),
            rendezvous,
            reporter,
        })
    }

    pub fn rank(&self) -> usize {
        self.reporter_rank()
    }

    fn reporter_rank(&self) -> usize {
        self.factory.as_ref().map(|f| f.rank()).unwrap_or(0)
    }

    /// Execute the configured run: a single sweep point when an element
    /// count is fixed, otherwise the full geometric sweep. Returns this
    /// process's records (statistics are per-process; only rank 0 prints).
    pub fn run(&mut self, benchmark_factory: &BenchmarkFactory) -> Result<Vec<SweepRecord>> {
        self.reporter.print_header(&self.device.description())?;

        if self.options.elements > 0 {
            self.run_point(benchmark_factory, self.options.elements)?;
        } else {
            let mut decade = SWEEP_FIRST_DECADE;
            while decade <= SWEEP_LAST_DECADE {
                for sub_step in SWEEP_SUB_STEPS {
                    self.run_point(benchmark_factory, decade * sub_step)?;
                }
                decade *= 10;
            }
        }

        self.reporter.finalize()?;
        Ok(self.reporter.records().to_vec())
    }

    /// One fully re-synchronized measurement at a fixed element count.
    fn run_point(&mut self, benchmark_factory: &BenchmarkFactory, elements: usize) -> Result<()> {
        debug!(elements, "starting sweep point");

        // One benchmark object per worker, each over its own context.
        let mut ops: Vec<BoxedOp> = Vec::with_capacity(self.options.threads);
        for _ in 0..self.options.threads {
            let mut context = self
                .context_factory()?
                .make_context(self.device.as_ref())?;
            if self.options.sync {
                context.set_sync(true, self.options.busy_poll)?;
            }

            let mut benchmark = benchmark_factory(context)?;
            benchmark
                .initialize(elements)
                .context("benchmark initialization failed")?;

            if self.options.verify {
                benchmark.run()?;
                benchmark.verify()?;
                // No worker may start timing before every worker on every
                // process has passed verification.
                self.run_barrier()?;
            }

            ops.push(Box::new(move || benchmark.run()));
        }

        let mut iterations = self.options.iteration_count;
        if iterations == 0 {
            let target = self.options.iteration_time;
            if target.is_zero() {
                return Err(Error::InvalidIterationTime.into());
            }

            // Warmup pass. Its median runs through a broadcast so that
            // every process derives the identical iteration count: the
            // timed operation is a collective call, and ranks disagreeing
            // on call counts hang the group.
            let warmup = self.execute_phase(&mut ops, self.options.warmup_iteration_count)?;
            let local_median = warmup.percentile(0.5);
            let agreed_median = self.run_broadcast(local_median)?;
            iterations = negotiated_iterations(target, agreed_median);
            debug!(local_median, agreed_median, iterations, "negotiated iteration count");
        }

        let latency = self.execute_phase(&mut ops, iterations)?;
        let record = SweepRecord::from_distribution(
            elements,
            self.options.data_type.size_of(),
            self.options.threads,
            &latency,
        );
        self.reporter.record(record)?;
        Ok(())
    }

    /// Run one job of `iterations` on every worker, aligned on the group
    /// barrier, and merge all local samples. The operations are handed
    /// back through `ops` for the next phase.
    fn execute_phase(&mut self, ops: &mut Vec<BoxedOp>, iterations: usize) -> Result<Distribution> {
        let mut jobs = Vec::with_capacity(ops.len());
        for op in ops.drain(..) {
            jobs.push(Job::new(op, iterations)?);
        }

        self.run_barrier()?;

        let mut handles = Vec::with_capacity(jobs.len());
        for (worker, job) in self.workers.iter().zip(jobs) {
            handles.push(worker.assign(job)?);
        }

        let mut samples = Samples::new();
        for handle in handles {
            let (op, job_samples) = handle.wait()?.into_parts();
            samples.merge(job_samples);
            ops.push(op);
        }
        Distribution::new(samples)
    }

    fn context_factory(&self) -> Result<&ContextFactory> {
        self.factory
            .as_ref()
            .ok_or_else(|| anyhow!("runner is shut down"))
    }

    fn run_barrier(&mut self) -> Result<()> {
        match &mut self.barrier {
            Some(barrier) => barrier.run(),
            None => Err(anyhow!("runner is shut down")),
        }
    }

    fn run_broadcast(&mut self, value: u64) -> Result<u64> {
        match &mut self.broadcast {
            Some(broadcast) => broadcast.run(value),
            None => Err(anyhow!("runner is shut down")),
        }
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        // Order matters: primitives and factory first (dropping every
        // group context), workers next, and only then the rendezvous
        // backend: an MPI-style backend must not be finalized while a
        // context still references the shared group handle.
        self.barrier.take();
        self.broadcast.take();
        self.factory.take();
        for worker in &mut self.workers {
            worker.shutdown();
        }
        if let Err(e) = self.rendezvous.finalize() {
            warn!("rendezvous finalize failed: {e:#}");
        }
    }
}

/// Iteration count from the group-agreed median: enough iterations to fill
/// the target duration, never fewer than one. A sub-nanosecond median is
/// clamped so the division stays defined.
pub(crate) fn negotiated_iterations(target: Duration, agreed_median_nanos: u64) -> usize {
    let count = target.as_nanos() as u64 / agreed_median_nanos.max(1);
    usize::max(1, count as usize)
}
