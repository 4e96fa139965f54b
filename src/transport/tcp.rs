//! TCP transport.
//!
//! Nagle's algorithm is disabled on every stream: the synchronization
//! primitives exchange single small frames and wait for the reply, the
//! worst case for delayed-ACK interaction.

use super::{read_frame, retry_for, write_frame, Device, Listener, Pair};
use anyhow::{Context, Result};
use socket2::{Domain, Socket, Type};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;
use tracing::debug;

pub const TRANSPORT_NAME: &str = "tcp";

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:0";

#[derive(Debug)]
pub struct TcpDevice;

impl TcpDevice {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for TcpDevice {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn description(&self) -> String {
        "tcp (nodelay)".to_string()
    }

    fn bind(&self, hint: Option<&str>) -> Result<Box<dyn Listener>> {
        let addr = hint.unwrap_or(DEFAULT_BIND_ADDR);
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid tcp bind address: {addr}"))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("failed to bind tcp listener on {addr}"))?;
        socket.listen(128)?;

        let listener: TcpListener = socket.into();
        debug!(addr = %listener.local_addr()?, "tcp listener bound");
        Ok(Box::new(TcpPairListener { listener }))
    }

    fn connect(&self, addr: &str, timeout: Duration) -> Result<Box<dyn Pair>> {
        let stream = retry_for(timeout, addr, || TcpStream::connect(addr))?;
        configure_stream(&stream)?;
        Ok(Box::new(TcpPair {
            stream,
            busy_poll: false,
        }))
    }
}

fn configure_stream(stream: &TcpStream) -> Result<()> {
    let socket = Socket::from(stream.try_clone()?);
    socket.set_nodelay(true)?;
    Ok(())
}

struct TcpPairListener {
    listener: TcpListener,
}

impl Listener for TcpPairListener {
    fn local_addr(&self) -> Result<String> {
        Ok(self.listener.local_addr()?.to_string())
    }

    fn accept(&mut self) -> Result<Box<dyn Pair>> {
        let (stream, peer) = self.listener.accept()?;
        configure_stream(&stream)?;
        debug!(%peer, "tcp pair accepted");
        Ok(Box::new(TcpPair {
            stream,
            busy_poll: false,
        }))
    }
}

#[derive(Debug)]
struct TcpPair {
    stream: TcpStream,
    busy_poll: bool,
}

impl Pair for TcpPair {
    fn send(&mut self, payload: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, payload, self.busy_poll)
    }

    fn recv(&mut self) -> Result<Vec<u8>> {
        read_frame(&mut self.stream, self.busy_poll)
    }

    fn set_sync(&mut self, _sync: bool, busy_poll: bool) -> Result<()> {
        self.busy_poll = busy_poll;
        self.stream.set_nonblocking(busy_poll)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn loopback_pair_exchanges_frames() {
        let device = TcpDevice::new();
        let mut listener = device.bind(Some("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let mut pair = listener.accept().unwrap();
            let msg = pair.recv().unwrap();
            pair.send(&msg).unwrap();
        });

        let mut pair = device.connect(&addr, Duration::from_secs(5)).unwrap();
        pair.send(b"ping").unwrap();
        assert_eq!(pair.recv().unwrap(), b"ping");
        server.join().unwrap();
    }

    #[test]
    fn busy_poll_mode_still_exchanges_frames() {
        let device = TcpDevice::new();
        let mut listener = device.bind(Some("127.0.0.1:0")).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let mut pair = listener.accept().unwrap();
            pair.set_sync(true, true).unwrap();
            for _ in 0..8 {
                let msg = pair.recv().unwrap();
                pair.send(&msg).unwrap();
            }
        });

        let mut pair = device.connect(&addr, Duration::from_secs(5)).unwrap();
        pair.set_sync(true, true).unwrap();
        for i in 0..8u32 {
            pair.send(&i.to_le_bytes()).unwrap();
            assert_eq!(pair.recv().unwrap(), i.to_le_bytes());
        }
        server.join().unwrap();
    }

    #[test]
    fn connect_times_out_without_a_listener() {
        let device = TcpDevice::new();
        // Reserved port with nothing listening; keep the timeout short.
        let err = device
            .connect("127.0.0.1:1", Duration::from_millis(200))
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
