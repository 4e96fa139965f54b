//! Worker threads and the jobs they execute.
//!
//! A `Worker` is a persistent execution unit backed by one dedicated OS
//! thread. The pool is created once at runner startup, sized to the
//! configured thread count, and never resized. Hand-off is a bounded
//! single-slot channel: `assign` places a job, the worker runs its closure
//! exactly `iterations` times while timing each call, and the completed job
//! travels back over a per-job completion channel. That completion send is
//! the happens-before edge that makes the samples safe to read.
//!
//! There is no mid-job cancellation: a job always runs its full iteration
//! count, and a closure failure is fatal for the whole run: the timed
//! operation is a cross-process collective, so a failure on one rank may
//! have left peers blocked and retrying is not meaningful.

use crate::error::Error;
use crate::stats::Samples;
use anyhow::Result;
use crossbeam::channel::{bounded, Receiver, Sender};
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// The timed operation, run back-to-back by a single worker.
pub type BoxedOp = Box<dyn FnMut() -> Result<()> + Send>;

/// One bounded unit of repeated timed work, owned by exactly one worker
/// while executing and read back by the runner afterwards.
pub struct Job {
    op: BoxedOp,
    iterations: usize,
    samples: Samples,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("iterations", &self.iterations)
            .field("samples", &self.samples)
            .finish()
    }
}

impl Job {
    /// A zero-iteration job is rejected outright: it would produce an empty
    /// sample set, which the statistics layer refuses anyway.
    pub fn new(op: BoxedOp, iterations: usize) -> Result<Self> {
        if iterations == 0 {
            anyhow::bail!("job iteration count must be nonzero");
        }
        Ok(Self {
            op,
            iterations,
            samples: Samples::with_capacity(iterations),
        })
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn samples(&self) -> &Samples {
        &self.samples
    }

    /// Split the job back into its operation and collected samples, so the
    /// runner can merge the samples and reuse the operation for the next
    /// phase (warmup and measurement share one benchmark object).
    pub fn into_parts(self) -> (BoxedOp, Samples) {
        (self.op, self.samples)
    }

    fn execute(&mut self) -> Result<()> {
        for _ in 0..self.iterations {
            let start = Instant::now();
            (self.op)()?;
            self.samples.add(start.elapsed().as_nanos() as u64);
        }
        Ok(())
    }
}

/// Awaits completion of an assigned job.
pub struct JobHandle {
    done: Receiver<Result<Job>>,
}

impl JobHandle {
    /// Block until the worker marks the job done and hand it back. An error
    /// from the job's closure surfaces here; a vanished worker maps to
    /// [`Error::WorkerStopped`].
    pub fn wait(self) -> Result<Job> {
        match self.done.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::WorkerStopped.into()),
        }
    }
}

type Assignment = (Job, Sender<Result<Job>>);

/// A long-lived execution thread accepting one job at a time.
#[derive(Debug)]
pub struct Worker {
    slot: Option<Sender<Assignment>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(index: usize) -> Result<Self> {
        let (slot, assignments) = bounded::<Assignment>(1);
        let thread = thread::Builder::new()
            .name(format!("bench-worker-{index}"))
            .spawn(move || Self::run_loop(assignments))?;
        Ok(Self {
            slot: Some(slot),
            thread: Some(thread),
        })
    }

    fn run_loop(assignments: Receiver<Assignment>) {
        // Ends when the slot sender is dropped by shutdown().
        for (mut job, done) in assignments.iter() {
            let result = job.execute();
            let _ = done.send(result.map(|()| job));
        }
    }

    /// Hand the worker a new job. At most one job may be in flight per
    /// worker; that contract is the caller's to uphold.
    pub fn assign(&self, job: Job) -> Result<JobHandle> {
        let slot = self.slot.as_ref().ok_or(Error::WorkerStopped)?;
        let (done_tx, done) = bounded(1);
        slot.send((job, done_tx)).map_err(|_| Error::WorkerStopped)?;
        Ok(JobHandle { done })
    }

    /// Stop the worker and join its thread. Idempotent, and safe to call
    /// even if no job was ever assigned.
    pub fn shutdown(&mut self) {
        self.slot.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::{Distribution, Samples};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_op(counter: Arc<AtomicUsize>) -> BoxedOp {
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn job_produces_exactly_k_samples() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut worker = Worker::spawn(0).unwrap();

        let job = Job::new(counting_op(counter.clone()), 17).unwrap();
        let done = worker.assign(job).unwrap().wait().unwrap();

        assert_eq!(done.samples().len(), 17);
        assert_eq!(counter.load(Ordering::SeqCst), 17);
        worker.shutdown();
    }

    #[test]
    fn zero_iterations_are_rejected() {
        assert!(Job::new(Box::new(|| Ok(())), 0).is_err());
    }

    #[test]
    fn pool_of_workers_merges_to_t_times_k() {
        let threads = 3;
        let iterations = 20;
        let workers: Vec<Worker> = (0..threads).map(|i| Worker::spawn(i).unwrap()).collect();

        let handles: Vec<JobHandle> = workers
            .iter()
            .map(|w| {
                let job = Job::new(Box::new(|| Ok(())), iterations).unwrap();
                w.assign(job).unwrap()
            })
            .collect();

        let mut merged = Samples::new();
        for handle in handles {
            let (_, samples) = handle.wait().unwrap().into_parts();
            merged.merge(samples);
        }
        let dist = Distribution::new(merged).unwrap();
        assert_eq!(dist.len(), threads * iterations);
    }

    #[test]
    fn closure_error_surfaces_from_wait() {
        let worker = Worker::spawn(0).unwrap();
        let job = Job::new(Box::new(|| anyhow::bail!("collective call failed")), 5).unwrap();
        let err = worker.assign(job).unwrap().wait().unwrap_err();
        assert!(err.to_string().contains("collective call failed"));
    }

    #[test]
    fn shutdown_is_idempotent_and_safe_without_a_job() {
        let mut worker = Worker::spawn(0).unwrap();
        worker.shutdown();
        worker.shutdown();
        assert!(worker.assign(Job::new(Box::new(|| Ok(())), 1).unwrap()).is_err());
    }

    #[test]
    fn worker_runs_consecutive_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let worker = Worker::spawn(0).unwrap();

        for _ in 0..3 {
            let job = Job::new(counting_op(counter.clone()), 4).unwrap();
            worker.assign(job).unwrap().wait().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 12);
    }
}
