//! Group membership and full-mesh context establishment.
//!
//! Before any timing happens, every process must agree on `(rank, size)`
//! and hold a connected pair to every peer. Two interchangeable strategies
//! provide that, resolved once at startup into a single
//! [`GroupRendezvous`] value:
//!
//! - [`StoreRendezvous`]: rank and size come from the options; listen
//!   addresses are exchanged through a shared [`Store`] (TCP store hosted
//!   by rank 0, or a file store for single-host groups).
//! - [`LauncherRendezvous`]: rank, size and per-rank endpoints are supplied
//!   by an external launcher through environment variables.
//!
//! A [`ContextFactory`] can mint any number of independent
//! [`GroupContext`]s over the same membership: one per local worker plus
//! one for each synchronization primitive. Every process creates contexts
//! in the same program order, so the per-context sequence numbers agree
//! group-wide without further coordination.
//!
//! Teardown ordering is significant: every `GroupContext` (and the
//! primitives built on top) and the factory must be dropped before
//! [`GroupRendezvous::finalize`] is called. Each context holds a reference
//! to the shared membership, which lets a backend check the invariant.

use crate::error::Error;
use crate::store::{FileStore, Store, StoreServer, TcpStore};
use crate::transport::{Device, Pair};
use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variables recognized by [`LauncherRendezvous::from_env`].
pub const ENV_RANK: &str = "COLLECTIVE_BENCH_RANK";
pub const ENV_SIZE: &str = "COLLECTIVE_BENCH_SIZE";
pub const ENV_PEERS: &str = "COLLECTIVE_BENCH_PEERS";

/// A process's identity within one benchmark run: the same `size` and a
/// unique `rank` in `[0, size)` on every participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Membership {
    pub rank: usize,
    pub size: usize,
}

/// How a context-in-the-making learns where its peers listen.
pub trait AddressExchange: Send + Sync {
    /// Launcher-assigned listen address for `(seq, rank)`, if the strategy
    /// dictates one; `None` lets the device pick an ephemeral address.
    fn listen_hint(&self, seq: usize, rank: usize) -> Option<String>;

    fn publish(&self, seq: usize, rank: usize, addr: &str) -> Result<()>;

    /// Blocking: returns once the peer's address is known.
    fn lookup(&self, seq: usize, rank: usize) -> Result<String>;
}

struct StoreExchange {
    store: Arc<dyn Store>,
    prefix: String,
    timeout: Duration,
}

impl StoreExchange {
    fn key(&self, seq: usize, rank: usize) -> String {
        format!("{}/{}/addr/{}", self.prefix, seq, rank)
    }
}

impl AddressExchange for StoreExchange {
    fn listen_hint(&self, _seq: usize, _rank: usize) -> Option<String> {
        None
    }

    fn publish(&self, seq: usize, rank: usize, addr: &str) -> Result<()> {
        self.store.set(&self.key(seq, rank), addr.as_bytes())
    }

    fn lookup(&self, seq: usize, rank: usize) -> Result<String> {
        let value = self.store.wait(&self.key(seq, rank), self.timeout)?;
        String::from_utf8(value).context("stored peer address is not valid UTF-8")
    }
}

/// Static endpoints handed down by a launcher. Each context sequence gets
/// its own derived endpoint: TCP ports are offset by the sequence number,
/// socket paths get a sequence suffix.
pub struct LauncherExchange {
    peers: Vec<String>,
}

impl LauncherExchange {
    pub fn new(peers: Vec<String>) -> Self {
        Self { peers }
    }

    fn endpoint(&self, seq: usize, rank: usize) -> Result<String> {
        let base = self
            .peers
            .get(rank)
            .ok_or_else(|| anyhow!("no launcher endpoint for rank {rank}"))?;
        if let Some((host, port)) = base.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                let port = u16::try_from(port as usize + seq)
                    .context("context sequence exhausted the launcher port range")?;
                return Ok(format!("{host}:{port}"));
            }
        }
        Ok(format!("{base}.{seq}"))
    }
}

impl AddressExchange for LauncherExchange {
    fn listen_hint(&self, seq: usize, rank: usize) -> Option<String> {
        self.endpoint(seq, rank).ok()
    }

    fn publish(&self, _seq: usize, _rank: usize, _addr: &str) -> Result<()> {
        Ok(())
    }

    fn lookup(&self, seq: usize, rank: usize) -> Result<String> {
        self.endpoint(seq, rank)
    }
}

/// Mints independent full-mesh contexts over one established membership.
pub struct ContextFactory {
    membership: Arc<Membership>,
    exchange: Arc<dyn AddressExchange>,
    connect_timeout: Duration,
    next_seq: AtomicUsize,
}

impl ContextFactory {
    pub fn new(
        membership: Arc<Membership>,
        exchange: Arc<dyn AddressExchange>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            membership,
            exchange,
            connect_timeout,
            next_seq: AtomicUsize::new(0),
        }
    }

    pub fn rank(&self) -> usize {
        self.membership.rank
    }

    pub fn size(&self) -> usize {
        self.membership.size
    }

    /// Connect a fresh full mesh. Lower ranks dial, higher ranks accept;
    /// each dialer identifies itself with a framed rank handshake so the
    /// acceptor can place the pair regardless of arrival order.
    pub fn make_context(&self, device: &dyn Device) -> Result<GroupContext> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let Membership { rank, size } = *self.membership;
        let mut pairs: Vec<Option<Box<dyn Pair>>> = (0..size).map(|_| None).collect();

        if size > 1 {
            let hint = self.exchange.listen_hint(seq, rank);
            let mut listener = device.bind(hint.as_deref())?;
            self.exchange.publish(seq, rank, &listener.local_addr()?)?;

            for peer in 0..rank {
                let addr = self.exchange.lookup(seq, peer)?;
                let mut pair = device.connect(&addr, self.connect_timeout)?;
                pair.send(&(rank as u32).to_le_bytes())?;
                pairs[peer] = Some(pair);
            }

            for _ in rank + 1..size {
                let mut pair = listener.accept()?;
                let handshake = pair.recv()?;
                let bytes: [u8; 4] = handshake
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("malformed rank handshake"))?;
                let peer = u32::from_le_bytes(bytes) as usize;
                if peer <= rank || peer >= size {
                    bail!("unexpected peer rank {peer} in handshake");
                }
                if pairs[peer].is_some() {
                    bail!("duplicate connection from rank {peer}");
                }
                pairs[peer] = Some(pair);
            }
        }

        debug!(seq, rank, size, "group context established");
        Ok(GroupContext {
            membership: self.membership.clone(),
            pairs,
        })
    }
}

/// Per-worker communication handles for one run: a connected pair to every
/// peer rank, owned exclusively by one worker (or one primitive).
#[derive(Debug)]
pub struct GroupContext {
    membership: Arc<Membership>,
    pairs: Vec<Option<Box<dyn Pair>>>,
}

impl GroupContext {
    pub fn rank(&self) -> usize {
        self.membership.rank
    }

    pub fn size(&self) -> usize {
        self.membership.size
    }

    pub fn send(&mut self, to: usize, payload: &[u8]) -> Result<()> {
        self.pair_mut(to)?.send(payload)
    }

    pub fn recv(&mut self, from: usize) -> Result<Vec<u8>> {
        self.pair_mut(from)?.recv()
    }

    /// Apply the transport mode to every pair in the context.
    pub fn set_sync(&mut self, sync: bool, busy_poll: bool) -> Result<()> {
        for pair in self.pairs.iter_mut().flatten() {
            pair.set_sync(sync, busy_poll)?;
        }
        Ok(())
    }

    fn pair_mut(&mut self, peer: usize) -> Result<&mut Box<dyn Pair>> {
        if peer == self.membership.rank {
            bail!("rank {} has no pair to itself", peer);
        }
        self.pairs
            .get_mut(peer)
            .and_then(|pair| pair.as_mut())
            .ok_or_else(|| anyhow!("no pair for rank {peer}"))
    }
}

/// One of the two rendezvous strategies, resolved once at startup.
pub trait GroupRendezvous: Send {
    /// Establish membership and return the context factory. Called once.
    fn establish(&mut self) -> Result<ContextFactory>;

    /// Tear down the backing mechanism. Must only be called after every
    /// context and the factory have been dropped.
    fn finalize(&mut self) -> Result<()>;
}

/// Store-backed rendezvous: rank/size are configured, addresses discovered
/// through the shared store. With a TCP store endpoint, rank 0 hosts the
/// server and every rank (rank 0 included) connects as a client.
pub struct StoreRendezvous {
    membership: Membership,
    store: Arc<dyn Store>,
    prefix: String,
    timeout: Duration,
    server: Option<StoreServer>,
}

impl StoreRendezvous {
    pub fn with_tcp_store(
        addr: &str,
        rank: usize,
        size: usize,
        prefix: &str,
        timeout: Duration,
    ) -> Result<Self> {
        validate_membership(rank, size)?;
        let server = if rank == 0 {
            Some(StoreServer::bind(addr)?)
        } else {
            None
        };
        let store = Arc::new(TcpStore::connect(addr, timeout)?);
        info!(%addr, rank, size, "rendezvous through tcp store");
        Ok(Self {
            membership: Membership { rank, size },
            store,
            prefix: prefix.to_string(),
            timeout,
            server,
        })
    }

    pub fn with_file_store(
        path: &Path,
        rank: usize,
        size: usize,
        prefix: &str,
        timeout: Duration,
    ) -> Result<Self> {
        validate_membership(rank, size)?;
        let store = Arc::new(FileStore::new(path)?);
        info!(path = %path.display(), rank, size, "rendezvous through file store");
        Ok(Self {
            membership: Membership { rank, size },
            store,
            prefix: prefix.to_string(),
            timeout,
            server: None,
        })
    }
}

impl GroupRendezvous for StoreRendezvous {
    fn establish(&mut self) -> Result<ContextFactory> {
        let exchange = Arc::new(StoreExchange {
            store: self.store.clone(),
            prefix: self.prefix.clone(),
            timeout: self.timeout,
        });
        Ok(ContextFactory::new(
            Arc::new(self.membership),
            exchange,
            self.timeout,
        ))
    }

    fn finalize(&mut self) -> Result<()> {
        if let Some(mut server) = self.server.take() {
            server.shutdown();
        }
        Ok(())
    }
}

/// Launcher-provided rendezvous: the surrounding launcher pins rank, size
/// and the per-rank base endpoints up front, so no store is involved.
#[derive(Debug)]
pub struct LauncherRendezvous {
    membership: Membership,
    peers: Vec<String>,
    connect_timeout: Duration,
}

impl LauncherRendezvous {
    pub fn new(
        rank: usize,
        size: usize,
        peers: Vec<String>,
        connect_timeout: Duration,
    ) -> Result<Self> {
        validate_membership(rank, size)?;
        if peers.len() != size {
            bail!(
                "launcher provided {} endpoints for a group of {}",
                peers.len(),
                size
            );
        }
        Ok(Self {
            membership: Membership { rank, size },
            peers,
            connect_timeout,
        })
    }

    /// Pick up launcher-provided group information from the environment.
    /// Returns `Ok(None)` when not running under a launcher.
    pub fn from_env(connect_timeout: Duration) -> Result<Option<Self>> {
        let (rank, size) = match (std::env::var(ENV_RANK), std::env::var(ENV_SIZE)) {
            (Ok(rank), Ok(size)) => (rank, size),
            _ => return Ok(None),
        };
        let rank: usize = rank
            .parse()
            .with_context(|| format!("{ENV_RANK} must be an integer"))?;
        let size: usize = size
            .parse()
            .with_context(|| format!("{ENV_SIZE} must be an integer"))?;
        let peers: Vec<String> = std::env::var(ENV_PEERS)
            .with_context(|| format!("{ENV_PEERS} must list one endpoint per rank"))?
            .split(',')
            .map(|peer| peer.trim().to_string())
            .collect();
        info!(rank, size, "rendezvous through launcher environment");
        Ok(Some(Self::new(rank, size, peers, connect_timeout)?))
    }
}

impl GroupRendezvous for LauncherRendezvous {
    fn establish(&mut self) -> Result<ContextFactory> {
        let exchange = Arc::new(LauncherExchange::new(self.peers.clone()));
        Ok(ContextFactory::new(
            Arc::new(self.membership),
            exchange,
            self.connect_timeout,
        ))
    }

    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Resolve the configured rendezvous strategy, once, at startup. Store
/// configuration wins over the launcher environment; with neither present
/// the run is refused rather than guessing.
pub fn resolve(options: &crate::cli::Options) -> Result<Box<dyn GroupRendezvous>> {
    if let Some(addr) = &options.store_addr {
        return Ok(Box::new(StoreRendezvous::with_tcp_store(
            addr,
            options.rank,
            options.size,
            &options.prefix,
            options.connect_timeout,
        )?));
    }
    if let Some(path) = &options.store_path {
        return Ok(Box::new(StoreRendezvous::with_file_store(
            path,
            options.rank,
            options.size,
            &options.prefix,
            options.connect_timeout,
        )?));
    }
    if let Some(launcher) = LauncherRendezvous::from_env(options.connect_timeout)? {
        return Ok(Box::new(launcher));
    }
    Err(Error::NoRendezvousMechanism.into())
}

fn validate_membership(rank: usize, size: usize) -> Result<()> {
    if size == 0 {
        bail!("group size must be at least 1");
    }
    if rank >= size {
        bail!("rank {rank} is outside the group [0, {size})");
    }
    Ok(())
}
