//! Command-line entry point for the collective benchmark suite.
//!
//! Parsing, logging and configuration validation happen here; everything
//! else is the [`Runner`]'s job. The process participates in exactly one
//! group run and exits non-zero on any fatal condition: an unknown
//! transport, a missing rendezvous mechanism, or a failure inside the
//! timed operation itself.

use anyhow::Result;
use clap::Parser;
use collective_bench::{builtin_factory, cli::Args, logging, Options, Runner, VERSION};
use tracing::{error, info};

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(args.verbose);

    info!("collective-bench {VERSION} starting");
    let options = Options::from_args(&args)?;
    let workload = builtin_factory(options.benchmark, options.data_type);

    let mut runner = Runner::new(options)?;
    match runner.run(&workload) {
        Ok(records) => {
            info!("run complete: {} sweep point(s)", records.len());
            Ok(())
        }
        Err(e) => {
            // A failed collective may have left peer ranks blocked; there
            // is nothing to salvage, so surface the error and exit.
            error!("benchmark run failed: {e:#}");
            Err(e)
        }
    }
}
