//! Result records, bandwidth derivation and rank-0 reporting.

use crate::cli::Options;
use crate::stats::Distribution;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// One sweep point's worth of merged statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepRecord {
    pub elements: usize,
    pub element_size: usize,
    pub min_ns: u64,
    pub p50_ns: u64,
    pub p99_ns: u64,
    pub max_ns: u64,
    pub bandwidth_gibps: f64,
    pub samples: usize,
}

impl SweepRecord {
    pub fn from_distribution(
        elements: usize,
        element_size: usize,
        threads: usize,
        latency: &Distribution,
    ) -> Self {
        Self {
            elements,
            element_size,
            min_ns: latency.min(),
            p50_ns: latency.percentile(0.50),
            p99_ns: latency.percentile(0.99),
            max_ns: latency.max(),
            bandwidth_gibps: bandwidth_gibps(elements, element_size, threads, latency),
            samples: latency.len(),
        }
    }
}

/// Aggregate bandwidth in GiB/s: total bytes moved across all samples over
/// the per-thread-normalized total time. Workers run concurrently, so the
/// summed latencies overstate wall time by a factor of the thread count.
pub fn bandwidth_gibps(
    elements: usize,
    element_size: usize,
    threads: usize,
    latency: &Distribution,
) -> f64 {
    let total_bytes = (elements * element_size * latency.len()) as f64;
    let total_nanos = (latency.sum() as f64 / threads as f64).max(1.0);
    total_bytes * 1e9 / total_nanos / GIB
}

/// Environment captured alongside the records for reproducibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub transport: String,
    pub benchmark: String,
    pub data_type: String,
    pub processes: usize,
    pub threads: usize,
}

impl RunMetadata {
    pub fn collect(options: &Options, processes: usize) -> Self {
        Self {
            version: crate::VERSION.to_string(),
            timestamp: chrono::Utc::now(),
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            transport: options.transport.clone(),
            benchmark: options.benchmark.to_string(),
            data_type: options.data_type.to_string(),
            processes,
            threads: options.threads,
        }
    }
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    metadata: &'a RunMetadata,
    records: &'a [SweepRecord],
}

/// Accumulates sweep records and emits output on the coordinating rank.
///
/// Every rank owns a reporter and feeds it the statistics computed from its
/// local samples; only rank 0's reporter ever writes a byte, so non-root
/// processes stay silent in every sweep point.
pub struct Reporter {
    rank: usize,
    show_nanos: bool,
    output_file: Option<PathBuf>,
    metadata: RunMetadata,
    records: Vec<SweepRecord>,
    out: Box<dyn Write + Send>,
}

impl Reporter {
    pub fn new(
        rank: usize,
        show_nanos: bool,
        output_file: Option<PathBuf>,
        metadata: RunMetadata,
    ) -> Self {
        Self::with_writer(
            rank,
            show_nanos,
            output_file,
            metadata,
            Box::new(std::io::stdout()),
        )
    }

    pub(crate) fn with_writer(
        rank: usize,
        show_nanos: bool,
        output_file: Option<PathBuf>,
        metadata: RunMetadata,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            rank,
            show_nanos,
            output_file,
            metadata,
            records: Vec::new(),
            out,
        }
    }

    fn unit_suffix(&self) -> &'static str {
        if self.show_nanos {
            "(ns)"
        } else {
            "(us)"
        }
    }

    fn unit_divisor(&self) -> u64 {
        if self.show_nanos {
            1
        } else {
            1000
        }
    }

    pub fn print_header(&mut self, device_description: &str) -> Result<()> {
        if self.rank != 0 {
            return Ok(());
        }

        writeln!(self.out, "{:<13}{}", "Device:", device_description)?;
        writeln!(self.out, "{:<13}{}", "Benchmark:", self.metadata.benchmark)?;
        writeln!(
            self.out,
            "{:<13}processes={}, threads={}, data type={}",
            "Options:", self.metadata.processes, self.metadata.threads, self.metadata.data_type
        )?;
        writeln!(self.out)?;

        let unit = self.unit_suffix();
        writeln!(
            self.out,
            "{:>11}{:>11}{:>11}{:>11}{:>11}{:>14}{:>11}",
            "elements",
            format!("min {unit}"),
            format!("p50 {unit}"),
            format!("p99 {unit}"),
            format!("max {unit}"),
            "avg (GiB/s)",
            "samples"
        )?;
        Ok(())
    }

    /// Record one sweep point; prints the row when this is rank 0.
    pub fn record(&mut self, record: SweepRecord) -> Result<()> {
        if self.rank == 0 {
            let div = self.unit_divisor();
            writeln!(
                self.out,
                "{:>11}{:>11}{:>11}{:>11}{:>11}{:>14.3}{:>11}",
                record.elements,
                record.min_ns / div,
                record.p50_ns / div,
                record.p99_ns / div,
                record.max_ns / div,
                record.bandwidth_gibps,
                record.samples
            )?;
            self.out.flush()?;
        }
        self.records.push(record);
        Ok(())
    }

    pub fn records(&self) -> &[SweepRecord] {
        &self.records
    }

    /// Write the JSON document when configured. Rank 0 only.
    pub fn finalize(&self) -> Result<()> {
        let Some(path) = &self.output_file else {
            return Ok(());
        };
        if self.rank != 0 {
            return Ok(());
        }

        let document = ReportDocument {
            metadata: &self.metadata,
            records: &self.records,
        };
        let json = serde_json::to_string_pretty(&document)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write results to {}", path.display()))?;
        info!("results written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Samples;
    use std::sync::{Arc, Mutex};

    fn distribution_of(values: &[u64]) -> Distribution {
        let mut samples = Samples::new();
        for &v in values {
            samples.add(v);
        }
        Distribution::new(samples).unwrap()
    }

    #[test]
    fn bandwidth_matches_the_reference_figures() {
        // 1000 elements x 4 bytes x 20 samples over a per-thread total of
        // 1ms: 80 KB at 80 MB/s, which is ~0.0745 GiB/s.
        let values: Vec<u64> = vec![100_000; 20];
        let latency = distribution_of(&values);
        assert_eq!(latency.sum(), 2_000_000);

        let gibps = bandwidth_gibps(1000, 4, 2, &latency);
        assert!((gibps - 0.0745058).abs() < 1e-6, "got {gibps}");
    }

    #[test]
    fn record_carries_the_distribution_statistics() {
        let latency = distribution_of(&[10, 20, 30, 40, 50]);
        let record = SweepRecord::from_distribution(100, 4, 1, &latency);
        assert_eq!(record.min_ns, 10);
        assert_eq!(record.p50_ns, 30);
        assert_eq!(record.max_ns, 50);
        assert_eq!(record.samples, 5);
    }

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn test_metadata() -> RunMetadata {
        RunMetadata::collect(&Options::default(), 2)
    }

    #[test]
    fn only_rank_zero_prints() {
        let latency = distribution_of(&[1000, 2000, 3000]);
        let record = SweepRecord::from_distribution(10, 4, 1, &latency);

        let root_buf = SharedBuf::default();
        let mut root = Reporter::with_writer(
            0,
            false,
            None,
            test_metadata(),
            Box::new(root_buf.clone()),
        );
        root.print_header("tcp").unwrap();
        root.record(record.clone()).unwrap();
        assert!(!root_buf.0.lock().unwrap().is_empty());

        let peer_buf = SharedBuf::default();
        let mut peer = Reporter::with_writer(
            1,
            false,
            None,
            test_metadata(),
            Box::new(peer_buf.clone()),
        );
        peer.print_header("tcp").unwrap();
        peer.record(record).unwrap();
        assert!(peer_buf.0.lock().unwrap().is_empty());
        assert_eq!(peer.records().len(), 1);
    }

    #[test]
    fn finalize_writes_json_on_rank_zero_only() {
        let dir = tempfile::tempdir().unwrap();
        let root_path = dir.path().join("root.json");
        let peer_path = dir.path().join("peer.json");
        let latency = distribution_of(&[500, 600]);
        let record = SweepRecord::from_distribution(8, 4, 1, &latency);

        let mut root = Reporter::with_writer(
            0,
            false,
            Some(root_path.clone()),
            test_metadata(),
            Box::new(SharedBuf::default()),
        );
        root.record(record.clone()).unwrap();
        root.finalize().unwrap();
        let written = std::fs::read_to_string(&root_path).unwrap();
        assert!(written.contains("\"records\""));

        let mut peer = Reporter::with_writer(
            1,
            false,
            Some(peer_path.clone()),
            test_metadata(),
            Box::new(SharedBuf::default()),
        );
        peer.record(record).unwrap();
        peer.finalize().unwrap();
        assert!(!peer_path.exists());
    }
}
