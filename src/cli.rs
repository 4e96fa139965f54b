use crate::benchmark::DataType;
use crate::error::Error;
use anyhow::Result;
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Collective Benchmark - latency and bandwidth of group communication
/// primitives, measured consistently across a process group
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Built-in workload to time
    #[clap(short = 'b', long, value_enum, default_value_t = BenchmarkKind::Ring)]
    pub benchmark: BenchmarkKind,

    /// Transport device (tcp or uds)
    #[clap(long, default_value = "tcp")]
    pub transport: String,

    /// Element data type
    #[clap(long, value_enum, default_value_t = DataType::F32)]
    pub data_type: DataType,

    /// Number of local worker threads
    #[clap(short = 't', long, default_value_t = crate::defaults::THREADS)]
    pub threads: usize,

    /// Number of elements per operation (0 runs a geometric sweep)
    #[clap(short = 'n', long, default_value_t = crate::defaults::ELEMENTS)]
    pub elements: usize,

    /// Fixed iteration count (0 derives the count from --iteration-time)
    #[clap(short = 'i', long, default_value_t = crate::defaults::ITERATION_COUNT)]
    pub iteration_count: usize,

    /// Target duration of the measurement pass when no fixed count is set
    #[clap(long, value_parser = parse_duration, default_value = "2s")]
    pub iteration_time: Duration,

    /// Warmup iterations used to estimate per-iteration latency
    #[clap(short = 'w', long, default_value_t = crate::defaults::WARMUP_ITERATION_COUNT)]
    pub warmup_iteration_count: usize,

    /// Switch pairs to synchronous mode
    #[clap(long, default_value_t = false)]
    pub sync: bool,

    /// Busy-poll the transport instead of blocking (implies --sync)
    #[clap(long, default_value_t = false)]
    pub busy_poll: bool,

    /// Verify workload output once per worker before measuring
    #[clap(long, default_value_t = false)]
    pub verify: bool,

    /// Rank of this process within the group (store rendezvous)
    #[clap(long, default_value_t = 0)]
    pub rank: usize,

    /// Total number of processes in the group (store rendezvous)
    #[clap(long, default_value_t = 1)]
    pub size: usize,

    /// Key-value store endpoint (host:port) for rendezvous; rank 0 hosts it
    #[clap(long)]
    pub store_addr: Option<String>,

    /// Directory of a file-backed rendezvous store (single-host groups)
    #[clap(long)]
    pub store_path: Option<PathBuf>,

    /// Store key prefix; must be unique per run when a store is reused
    #[clap(long, default_value = crate::defaults::STORE_PREFIX)]
    pub prefix: String,

    /// How long to keep retrying peer connections and store lookups
    #[clap(long, value_parser = parse_duration, default_value = "30s")]
    pub connect_timeout: Duration,

    /// Report latencies in nanoseconds instead of microseconds
    #[clap(long, default_value_t = false)]
    pub show_nanos: bool,

    /// Output file for results (JSON), written by rank 0 only
    #[clap(short = 'o', long)]
    pub output_file: Option<PathBuf>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

/// Built-in workloads available to the binary
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum BenchmarkKind {
    /// Pass buffers around the ring of ranks
    #[clap(name = "ring")]
    Ring,

    /// Exchange buffers between adjacent rank pairs
    #[clap(name = "ping-pong")]
    PingPong,
}

impl std::fmt::Display for BenchmarkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BenchmarkKind::Ring => write!(f, "ring"),
            BenchmarkKind::PingPong => write!(f, "ping-pong"),
        }
    }
}

/// Configuration snapshot driving one runner, read-only for its lifetime.
#[derive(Clone, Debug)]
pub struct Options {
    pub benchmark: BenchmarkKind,
    pub transport: String,
    pub data_type: DataType,
    pub threads: usize,
    pub elements: usize,
    pub iteration_count: usize,
    pub iteration_time: Duration,
    pub warmup_iteration_count: usize,
    pub sync: bool,
    pub busy_poll: bool,
    pub verify: bool,
    pub rank: usize,
    pub size: usize,
    pub store_addr: Option<String>,
    pub store_path: Option<PathBuf>,
    pub prefix: String,
    pub connect_timeout: Duration,
    pub show_nanos: bool,
    pub output_file: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            benchmark: BenchmarkKind::Ring,
            transport: "tcp".to_string(),
            data_type: DataType::F32,
            threads: crate::defaults::THREADS,
            elements: crate::defaults::ELEMENTS,
            iteration_count: crate::defaults::ITERATION_COUNT,
            iteration_time: crate::defaults::ITERATION_TIME,
            warmup_iteration_count: crate::defaults::WARMUP_ITERATION_COUNT,
            sync: false,
            busy_poll: false,
            verify: false,
            rank: 0,
            size: 1,
            store_addr: None,
            store_path: None,
            prefix: crate::defaults::STORE_PREFIX.to_string(),
            connect_timeout: crate::defaults::CONNECT_TIMEOUT,
            show_nanos: false,
            output_file: None,
        }
    }
}

impl Options {
    /// Validate the parsed arguments into a runner configuration. The
    /// misconfigurations rejected here are irrecoverable by design:
    /// guessing a default for any of them would silently change what is
    /// being measured.
    pub fn from_args(args: &Args) -> Result<Self> {
        if args.threads == 0 {
            anyhow::bail!("at least one worker thread is required");
        }
        if args.iteration_count == 0 {
            if args.iteration_time.is_zero() {
                return Err(Error::InvalidIterationTime.into());
            }
            if args.warmup_iteration_count == 0 {
                anyhow::bail!("time-based iteration mode requires warmup iterations");
            }
        }

        Ok(Self {
            benchmark: args.benchmark,
            transport: args.transport.clone(),
            data_type: args.data_type,
            threads: args.threads,
            elements: args.elements,
            iteration_count: args.iteration_count,
            iteration_time: args.iteration_time,
            warmup_iteration_count: args.warmup_iteration_count,
            // Busy polling only makes sense on a synchronous pair.
            sync: args.sync || args.busy_poll,
            busy_poll: args.busy_poll,
            verify: args.verify,
            rank: args.rank,
            size: args.size,
            store_addr: args.store_addr.clone(),
            store_path: args.store_path.clone(),
            prefix: args.prefix.clone(),
            connect_timeout: args.connect_timeout,
            show_nanos: args.show_nanos,
            output_file: args.output_file.clone(),
        })
    }
}

/// Parse a duration from a string (e.g., "500ms", "10s", "5m", "250us")
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ns") {
        (stripped, "ns")
    } else if let Some(stripped) = s.strip_suffix("us") {
        (stripped, "us")
    } else if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("invalid number in duration: {num_str}"))?;

    let duration = match unit {
        "ns" => Duration::from_nanos(num as u64),
        "us" => Duration::from_micros(num as u64),
        "ms" => Duration::from_millis(num as u64),
        "s" => Duration::from_secs(num as u64),
        "m" => Duration::from_secs((num * 60.0) as u64),
        "h" => Duration::from_secs((num * 3600.0) as u64),
        _ => return Err(format!("invalid duration unit: {unit}")),
    };

    Ok(duration)
}
