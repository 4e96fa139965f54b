//! The two synchronization primitives the runner is built on.
//!
//! Both are tiny collective algorithms over a dedicated [`GroupContext`]
//! with rank 0 as the fixed coordinator/root. Neither carries a timeout: a
//! non-responsive peer stalls the whole group. That is a deliberate
//! liveness trade-off, since for a benchmarking tool hanging visibly beats
//! producing numbers measured against an absent peer.

use crate::rendezvous::GroupContext;
use anyhow::{anyhow, Result};

const COORDINATOR: usize = 0;

const ARRIVAL: u8 = 0x1;
const RELEASE: u8 = 0x2;

/// All-to-one barrier: every rank signals arrival to the coordinator and
/// blocks until the coordinator has seen all arrivals and releases the
/// group. Used to align the start of every timed phase, so no process can
/// begin the collective operation before its peers have entered the phase.
#[derive(Debug)]
pub struct Barrier {
    context: GroupContext,
}

impl Barrier {
    pub fn new(context: GroupContext) -> Self {
        Self { context }
    }

    pub fn run(&mut self) -> Result<()> {
        let rank = self.context.rank();
        let size = self.context.size();
        if size == 1 {
            return Ok(());
        }

        if rank == COORDINATOR {
            for peer in 1..size {
                self.context.recv(peer)?;
            }
            for peer in 1..size {
                self.context.send(peer, &[RELEASE])?;
            }
        } else {
            self.context.send(COORDINATOR, &[ARRIVAL])?;
            self.context.recv(COORDINATOR)?;
        }
        Ok(())
    }
}

/// One-to-all broadcast of a single value. The root's value wins; whatever
/// a non-root rank passes in is discarded. The runner uses this once per
/// sweep point to distribute the warmup median, so every process derives
/// the identical iteration count: the timed operation is itself a
/// collective call, and a count mismatch hangs the group rather than just
/// skewing the numbers.
#[derive(Debug)]
pub struct Broadcast {
    context: GroupContext,
    root: usize,
}

impl Broadcast {
    pub fn new(context: GroupContext, root: usize) -> Self {
        Self { context, root }
    }

    pub fn run(&mut self, value: u64) -> Result<u64> {
        let rank = self.context.rank();
        let size = self.context.size();
        if size == 1 {
            return Ok(value);
        }

        if rank == self.root {
            let bytes = value.to_le_bytes();
            for peer in (0..size).filter(|&peer| peer != self.root) {
                self.context.send(peer, &bytes)?;
            }
            Ok(value)
        } else {
            let payload = self.context.recv(self.root)?;
            let bytes: [u8; 8] = payload
                .as_slice()
                .try_into()
                .map_err(|_| anyhow!("malformed broadcast payload"))?;
            Ok(u64::from_le_bytes(bytes))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::{GroupRendezvous, StoreRendezvous};
    use crate::transport::create_device;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn for_each_rank(
        size: usize,
        prefix: &str,
        body: impl Fn(GroupContext, usize) + Send + Sync + 'static,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let body = Arc::new(body);
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let path = dir.path().to_path_buf();
                let prefix = prefix.to_string();
                let body = body.clone();
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
                    body(context, rank);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn barrier_releases_only_after_all_arrive() {
        let arrivals = Arc::new(AtomicUsize::new(0));
        let observed = arrivals.clone();
        for_each_rank(3, "barrier", move |context, rank| {
            // Stagger arrivals so a broken barrier would let rank 0 through
            // before the slow ranks have shown up.
            thread::sleep(Duration::from_millis(20 * rank as u64));
            observed.fetch_add(1, Ordering::SeqCst);

            let mut barrier = Barrier::new(context);
            barrier.run().unwrap();
            assert_eq!(observed.load(Ordering::SeqCst), 3);

            // The primitive must be reusable run-to-run.
            barrier.run().unwrap();
        });
    }

    #[test]
    fn broadcast_distributes_the_root_value() {
        for_each_rank(3, "broadcast", |context, rank| {
            let mut broadcast = Broadcast::new(context, 0);
            // Every rank offers its own local value; only rank 0's survives.
            let local = 1000 + rank as u64;
            let agreed = broadcast.run(local).unwrap();
            assert_eq!(agreed, 1000);
        });
    }

    #[test]
    fn single_rank_primitives_are_no_ops() {
        let dir = tempfile::tempdir().unwrap();
        let mut rendezvous =
            StoreRendezvous::with_file_store(dir.path(), 0, 1, "solo", Duration::from_secs(1))
                .unwrap();
        let factory = rendezvous.establish().unwrap();
        let device = create_device("tcp").unwrap();

        let mut barrier = Barrier::new(factory.make_context(device.as_ref()).unwrap());
        barrier.run().unwrap();

        let mut broadcast = Broadcast::new(factory.make_context(device.as_ref()).unwrap(), 0);
        assert_eq!(broadcast.run(7).unwrap(), 7);
    }
}
