//! The timed-operation seam and the built-in workloads.
//!
//! The runner never sees anything but the [`Benchmark`] trait: one object
//! per local worker, each owning its own [`GroupContext`]. The built-ins
//! are sample workloads that move `elements * element_size` bytes between
//! peers per call, enough to exercise the harness end-to-end and to give
//! the bandwidth column meaning; they are not reference implementations of
//! any particular collective algorithm.

use crate::cli::BenchmarkKind;
use crate::error::Error;
use crate::rendezvous::GroupContext;
use anyhow::Result;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Element type tag. The orchestration is type-independent (it only ever
/// consumes the element size), so a tag is all that is needed to size
/// buffers and label reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum DataType {
    /// Single bytes
    #[clap(name = "u8")]
    U8,
    /// 32-bit floats
    #[clap(name = "f32")]
    F32,
    /// 64-bit floats
    #[clap(name = "f64")]
    F64,
}

impl DataType {
    pub fn size_of(&self) -> usize {
        match self {
            DataType::U8 => 1,
            DataType::F32 => 4,
            DataType::F64 => 8,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::U8 => write!(f, "u8"),
            DataType::F32 => write!(f, "f32"),
            DataType::F64 => write!(f, "f64"),
        }
    }
}

/// One timed operation bound to one worker's context.
pub trait Benchmark: Send {
    /// Size buffers for `elements` elements. Called once per sweep point,
    /// before any timing.
    fn initialize(&mut self, elements: usize) -> Result<()>;

    /// One timed call. This is the closure body the workers execute; it may
    /// block on peer ranks, which is exactly what is being measured.
    fn run(&mut self) -> Result<()>;

    /// Check the output of the preceding `run` call.
    fn verify(&self) -> Result<()>;
}

/// Builds one benchmark per worker, each consuming its own context.
pub type BenchmarkFactory = Box<dyn Fn(GroupContext) -> Result<Box<dyn Benchmark>>>;

/// Factory for the built-in workloads selected on the command line.
pub fn builtin_factory(kind: BenchmarkKind, data_type: DataType) -> BenchmarkFactory {
    match kind {
        BenchmarkKind::Ring => {
            Box::new(move |context| Ok(Box::new(RingBenchmark::new(context, data_type))))
        }
        BenchmarkKind::PingPong => {
            Box::new(move |context| Ok(Box::new(PingPongBenchmark::new(context, data_type))))
        }
    }
}

// Deterministic per-rank fill so every receiver can verify the sender.
fn fill_pattern(rank: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((rank * 31 + i * 7) % 251) as u8).collect()
}

fn verify_against(received: &[u8], source_rank: usize) -> Result<()> {
    let expected = fill_pattern(source_rank, received.len());
    if let Some(index) = received
        .iter()
        .zip(expected.iter())
        .position(|(got, want)| got != want)
    {
        return Err(Error::VerificationFailed(format!(
            "byte {index} from rank {source_rank}: got {:#04x}, expected {:#04x}",
            received[index], expected[index]
        ))
        .into());
    }
    Ok(())
}

/// Each rank passes its buffer to the next rank around the ring and
/// receives from the previous one. Rank 0 opens the chain, every other
/// rank forwards after receiving, so the ring cannot deadlock regardless
/// of payload size. A group of one degrades to a local copy.
pub struct RingBenchmark {
    context: GroupContext,
    data_type: DataType,
    send_buf: Vec<u8>,
    recv_buf: Vec<u8>,
}

impl RingBenchmark {
    pub fn new(context: GroupContext, data_type: DataType) -> Self {
        Self {
            context,
            data_type,
            send_buf: Vec::new(),
            recv_buf: Vec::new(),
        }
    }

    fn source_rank(&self) -> usize {
        let size = self.context.size();
        (self.context.rank() + size - 1) % size
    }
}

impl Benchmark for RingBenchmark {
    fn initialize(&mut self, elements: usize) -> Result<()> {
        let bytes = elements * self.data_type.size_of();
        self.send_buf = fill_pattern(self.context.rank(), bytes);
        self.recv_buf = vec![0; bytes];
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let rank = self.context.rank();
        let size = self.context.size();
        if size == 1 {
            self.recv_buf.copy_from_slice(&self.send_buf);
            return Ok(());
        }

        let next = (rank + 1) % size;
        let prev = (rank + size - 1) % size;
        if rank == 0 {
            self.context.send(next, &self.send_buf)?;
            self.recv_buf = self.context.recv(prev)?;
        } else {
            self.recv_buf = self.context.recv(prev)?;
            self.context.send(next, &self.send_buf)?;
        }
        Ok(())
    }

    fn verify(&self) -> Result<()> {
        if self.recv_buf.len() != self.send_buf.len() {
            return Err(Error::VerificationFailed(format!(
                "received {} bytes, expected {}",
                self.recv_buf.len(),
                self.send_buf.len()
            ))
            .into());
        }
        verify_against(&self.recv_buf, self.source_rank())
    }
}

/// Adjacent ranks pair up (0 with 1, 2 with 3, and so on) and exchange
/// buffers. The even
/// rank of each pair sends first. With an odd group size the last rank has
/// no partner and degrades to a local copy.
pub struct PingPongBenchmark {
    context: GroupContext,
    data_type: DataType,
    send_buf: Vec<u8>,
    recv_buf: Vec<u8>,
}

impl PingPongBenchmark {
    pub fn new(context: GroupContext, data_type: DataType) -> Self {
        Self {
            context,
            data_type,
            send_buf: Vec::new(),
            recv_buf: Vec::new(),
        }
    }

    fn partner(&self) -> Option<usize> {
        let partner = self.context.rank() ^ 1;
        (partner < self.context.size()).then_some(partner)
    }
}

impl Benchmark for PingPongBenchmark {
    fn initialize(&mut self, elements: usize) -> Result<()> {
        let bytes = elements * self.data_type.size_of();
        self.send_buf = fill_pattern(self.context.rank(), bytes);
        self.recv_buf = vec![0; bytes];
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let Some(partner) = self.partner() else {
            self.recv_buf.copy_from_slice(&self.send_buf);
            return Ok(());
        };
        if self.context.rank() % 2 == 0 {
            self.context.send(partner, &self.send_buf)?;
            self.recv_buf = self.context.recv(partner)?;
        } else {
            self.recv_buf = self.context.recv(partner)?;
            self.context.send(partner, &self.send_buf)?;
        }
        Ok(())
    }

    fn verify(&self) -> Result<()> {
        let source = self.partner().unwrap_or(self.context.rank());
        verify_against(&self.recv_buf, source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::{GroupRendezvous, StoreRendezvous};
    use crate::transport::create_device;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn data_type_sizes() {
        assert_eq!(DataType::U8.size_of(), 1);
        assert_eq!(DataType::F32.size_of(), 4);
        assert_eq!(DataType::F64.size_of(), 8);
    }

    #[test]
    fn fill_pattern_is_rank_specific() {
        assert_ne!(fill_pattern(0, 64), fill_pattern(1, 64));
        assert_eq!(fill_pattern(2, 64), fill_pattern(2, 64));
    }

    #[test]
    fn verify_reports_the_mismatch() {
        let mut data = fill_pattern(4, 32);
        data[7] ^= 0xff;
        let err = verify_against(&data, 4).unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::VerificationFailed(msg)) => assert!(msg.contains("byte 7")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    fn run_group(size: usize, prefix: &str, kind: BenchmarkKind) {
        let dir = tempfile::tempdir().unwrap();
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let path = dir.path().to_path_buf();
                let prefix = prefix.to_string();
                thread::spawn(move || {
                    let mut rendezvous = StoreRendezvous::with_file_store(
                        &path,
                        rank,
                        size,
                        &prefix,
                        Duration::from_secs(10),
                    )
                    .unwrap();
                    let factory = rendezvous.establish().unwrap();
                    let device = create_device("tcp").unwrap();
                    let context = factory.make_context(device.as_ref()).unwrap();

                    let make = builtin_factory(kind, DataType::F32);
                    let mut benchmark = make(context).unwrap();
                    benchmark.initialize(128).unwrap();
                    for _ in 0..3 {
                        benchmark.run().unwrap();
                        benchmark.verify().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn ring_verifies_across_three_ranks() {
        run_group(3, "ring", BenchmarkKind::Ring);
    }

    #[test]
    fn ping_pong_verifies_across_pairs_and_odd_tail() {
        run_group(2, "pp2", BenchmarkKind::PingPong);
        run_group(3, "pp3", BenchmarkKind::PingPong);
    }

    #[test]
    fn single_rank_workloads_self_copy() {
        run_group(1, "solo", BenchmarkKind::Ring);
        run_group(1, "solo-pp", BenchmarkKind::PingPong);
    }
}
