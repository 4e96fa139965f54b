//! Point-to-point transport abstraction.
//!
//! The synchronization core only ever sees the [`Device`], [`Listener`] and
//! [`Pair`] traits; the concrete transports live in the submodules. Two
//! interchangeable kinds are provided and selected by name:
//!
//! - `tcp`: TCP sockets with `TCP_NODELAY`, usable across hosts
//! - `uds`: Unix domain sockets for single-host groups
//!
//! All pair traffic is framed as a little-endian u32 length prefix followed
//! by the payload. Messages exchanged by the synchronization primitives are
//! tiny (a rank handshake, a barrier arrival, one broadcast value), so the
//! framing cost is irrelevant next to the operations being timed.

use crate::error::Error;
use anyhow::{bail, Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub mod tcp;
#[cfg(unix)]
pub mod uds;

/// Upper bound on a single frame, matching the largest sweep payload with
/// room to spare. Anything bigger indicates a corrupted length prefix.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A transport kind capable of producing listeners and outbound pairs.
pub trait Device: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Human-readable description for the report header.
    fn description(&self) -> String;

    /// Bind a listener. `hint` carries a launcher-assigned address; without
    /// one the device picks an ephemeral address of its own.
    fn bind(&self, hint: Option<&str>) -> Result<Box<dyn Listener>>;

    /// Connect to a peer, retrying until `timeout` elapses; the peer's
    /// listener may not exist yet while the group is still assembling.
    fn connect(&self, addr: &str, timeout: Duration) -> Result<Box<dyn Pair>>;
}

pub trait Listener: Send {
    /// The address peers should connect to, as published during rendezvous.
    fn local_addr(&self) -> Result<String>;

    fn accept(&mut self) -> Result<Box<dyn Pair>>;
}

/// A connected, framed, blocking point-to-point channel.
pub trait Pair: Send + std::fmt::Debug {
    fn send(&mut self, payload: &[u8]) -> Result<()>;

    fn recv(&mut self) -> Result<Vec<u8>>;

    /// Switch the pair's polling mode. Reads and writes here are already
    /// performed on the calling thread, so `sync` alone changes nothing;
    /// `busy_poll` additionally puts the socket into non-blocking mode and
    /// spins instead of parking in the kernel.
    fn set_sync(&mut self, sync: bool, busy_poll: bool) -> Result<()>;
}

/// Resolve a device by name. Unknown names are a fatal misconfiguration.
pub fn create_device(name: &str) -> Result<Arc<dyn Device>> {
    match name {
        tcp::TRANSPORT_NAME => Ok(Arc::new(tcp::TcpDevice::new())),
        #[cfg(unix)]
        uds::TRANSPORT_NAME => Ok(Arc::new(uds::UnixDevice::new())),
        other => Err(Error::UnknownTransport(other.to_string()).into()),
    }
}

/// Retry `attempt` until it succeeds or `timeout` elapses. Connection
/// refusals are expected while a peer is still binding its listener.
pub(crate) fn retry_for<T>(
    timeout: Duration,
    what: &str,
    mut attempt: impl FnMut() -> std::io::Result<T>,
) -> Result<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(e) if Instant::now() >= deadline => {
                return Err(e).with_context(|| format!("timed out connecting to {what}"));
            }
            Err(_) => std::thread::sleep(CONNECT_RETRY_DELAY),
        }
    }
}

pub(crate) fn write_frame<S: Write>(stream: &mut S, payload: &[u8], busy_poll: bool) -> Result<()> {
    if payload.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds the transport limit", payload.len());
    }
    let len = payload.len() as u32;
    write_full(stream, &len.to_le_bytes(), busy_poll)?;
    write_full(stream, payload, busy_poll)?;
    stream.flush()?;
    Ok(())
}

pub(crate) fn read_frame<S: Read>(stream: &mut S, busy_poll: bool) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    read_full(stream, &mut len_bytes, busy_poll)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        bail!("frame length {len} exceeds the transport limit");
    }
    let mut payload = vec![0u8; len];
    read_full(stream, &mut payload, busy_poll)?;
    Ok(payload)
}

// read_exact/write_all cannot be used directly: in busy-poll mode the
// socket is non-blocking and partial transfers interleave with WouldBlock.
fn read_full<S: Read>(stream: &mut S, buf: &mut [u8], busy_poll: bool) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => bail!("peer closed the connection"),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if busy_poll {
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e).context("transport read failed"),
        }
    }
    Ok(())
}

fn write_full<S: Write>(stream: &mut S, buf: &[u8], busy_poll: bool) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => bail!("peer closed the connection"),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if busy_poll {
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e).context("transport write failed"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_transport_is_fatal() {
        let err = create_device("ibverbs").unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::UnknownTransport(name)) => assert_eq!(name, "ibverbs"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn known_transports_resolve() {
        assert_eq!(create_device("tcp").unwrap().name(), "tcp");
        #[cfg(unix)]
        assert_eq!(create_device("uds").unwrap().name(), "uds");
    }

    #[test]
    fn frames_round_trip_through_a_buffer() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello", false).unwrap();
        write_frame(&mut buf, b"", false).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor, false).unwrap(), b"hello");
        assert_eq!(read_frame(&mut cursor, false).unwrap(), b"");
    }

    #[test]
    fn oversized_frame_length_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        assert!(read_frame(&mut cursor, false).is_err());
    }
}
