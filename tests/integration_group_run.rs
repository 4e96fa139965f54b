//! End-to-end group runs: multiple ranks driven as threads within one test
//! process, rendezvousing through a file store in a scratch directory.

use anyhow::Result;
use collective_bench::{builtin_factory, BenchmarkKind, Options, Runner, SweepRecord};
use std::path::Path;
use std::thread;
use std::time::Duration;

fn run_rank(options: Options) -> Result<Vec<SweepRecord>> {
    let workload = builtin_factory(options.benchmark, options.data_type);
    let mut runner = Runner::new(options)?;
    runner.run(&workload)
}

fn group_options(store: &Path, rank: usize, prefix: &str) -> Options {
    Options {
        rank,
        size: 2,
        store_path: Some(store.to_path_buf()),
        prefix: prefix.to_string(),
        connect_timeout: Duration::from_secs(20),
        ..Options::default()
    }
}

fn run_group(make_options: impl Fn(usize) -> Options) -> Vec<Vec<SweepRecord>> {
    let handles: Vec<_> = (0..2)
        .map(|rank| {
            let options = make_options(rank);
            thread::spawn(move || run_rank(options).unwrap())
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

#[test]
fn fixed_count_ping_pong_with_verification() {
    let dir = tempfile::tempdir().unwrap();
    let results = run_group(|rank| {
        let mut options = group_options(dir.path(), rank, "fixed");
        options.benchmark = BenchmarkKind::PingPong;
        options.threads = 2;
        options.elements = 256;
        options.iteration_count = 25;
        options.verify = true;
        options
    });

    for records in &results {
        assert_eq!(records.len(), 1);
        // Two workers times the fixed count, merged per process.
        assert_eq!(records[0].samples, 2 * 25);
        assert_eq!(records[0].elements, 256);
        assert!(records[0].min_ns <= records[0].p50_ns);
        assert!(records[0].p50_ns <= records[0].p99_ns);
        assert!(records[0].p99_ns <= records[0].max_ns);
        assert!(records[0].bandwidth_gibps > 0.0);
    }
}

#[test]
fn time_based_ranks_agree_on_the_iteration_count() {
    let dir = tempfile::tempdir().unwrap();
    let results = run_group(|rank| {
        let mut options = group_options(dir.path(), rank, "timed");
        options.benchmark = BenchmarkKind::PingPong;
        options.threads = 1;
        options.elements = 64;
        options.iteration_count = 0;
        options.iteration_time = Duration::from_millis(5);
        options.warmup_iteration_count = 5;
        options
    });

    // Local warmup medians differ between the ranks, but the broadcast
    // pins one value, so the negotiated counts are identical.
    assert_eq!(results[0][0].samples, results[1][0].samples);
    assert!(results[0][0].samples >= 1);
}

#[test]
fn ring_sweeps_multiple_element_counts() {
    let dir = tempfile::tempdir().unwrap();
    // Fixed elements per point, driven twice: one run per element count,
    // both fully re-synchronized, reusing the same store directory under
    // distinct prefixes.
    for (prefix, elements) in [("sweep-a", 100usize), ("sweep-b", 500)] {
        let results = run_group(|rank| {
            let mut options = group_options(dir.path(), rank, prefix);
            options.benchmark = BenchmarkKind::Ring;
            options.threads = 1;
            options.elements = elements;
            options.iteration_count = 10;
            options.verify = true;
            options
        });
        for records in &results {
            assert_eq!(records[0].elements, elements);
            assert_eq!(records[0].samples, 10);
        }
    }
}

#[cfg(unix)]
#[test]
fn unix_domain_socket_transport_runs_a_group() {
    let dir = tempfile::tempdir().unwrap();
    let results = run_group(|rank| {
        let mut options = group_options(dir.path(), rank, "uds");
        options.transport = "uds".to_string();
        options.benchmark = BenchmarkKind::PingPong;
        options.threads = 1;
        options.elements = 128;
        options.iteration_count = 8;
        options.verify = true;
        options
    });
    for records in &results {
        assert_eq!(records[0].samples, 8);
    }
}

#[test]
fn tcp_store_rendezvous_runs_a_group() {
    // Rank 0 hosts the store server at the shared endpoint; rank 1 retries
    // its client connection until the server is up.
    let addr = "127.0.0.1:23671";
    let results = run_group(|rank| {
        let mut options = Options {
            rank,
            size: 2,
            store_addr: Some(addr.to_string()),
            prefix: "tcp-store".to_string(),
            connect_timeout: Duration::from_secs(20),
            ..Options::default()
        };
        options.threads = 1;
        options.elements = 32;
        options.iteration_count = 5;
        options
    });
    for records in &results {
        assert_eq!(records[0].samples, 5);
    }
}
