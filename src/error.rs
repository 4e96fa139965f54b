use thiserror::Error;

/// Fatal and propagated error conditions of the benchmark core.
///
/// These are deliberate fail-fast conditions: a misconfigured transport or
/// rendezvous cannot be papered over with defaults, and statistics over an
/// empty sample set are meaningless. Callers carry these through
/// `anyhow::Result` and may downcast where the distinction matters.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport selected by name does not exist.
    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    /// Neither a store endpoint nor launcher-provided group information
    /// was configured.
    #[error("no means for rendezvous: set a store endpoint/path or run under a launcher")]
    NoRendezvousMechanism,

    /// Statistics were requested over zero latency samples.
    #[error("no latency samples found")]
    InsufficientSamples,

    /// Time-based iteration mode requires a positive target duration.
    #[error("iteration time must be greater than zero when no iteration count is set")]
    InvalidIterationTime,

    /// A job was assigned to (or awaited on) a worker that has stopped.
    #[error("worker is stopped")]
    WorkerStopped,

    /// The optional correctness pass observed a mismatch.
    #[error("verification failed: {0}")]
    VerificationFailed(String),
}
