//! Unix domain socket transport for single-host groups.

use super::{read_frame, retry_for, write_frame, Device, Listener, Pair};
use anyhow::{Context, Result};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub const TRANSPORT_NAME: &str = "uds";

#[derive(Debug)]
pub struct UnixDevice;

impl UnixDevice {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UnixDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for UnixDevice {
    fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    fn description(&self) -> String {
        format!("uds ({})", std::env::temp_dir().display())
    }

    fn bind(&self, hint: Option<&str>) -> Result<Box<dyn Listener>> {
        let path = match hint {
            Some(path) => PathBuf::from(path),
            // Without a launcher-assigned path, generate a unique one; the
            // actual path reaches peers through the rendezvous exchange.
            None => std::env::temp_dir().join(format!("collective-bench-{}.sock", Uuid::new_v4())),
        };

        // A stale socket file from a crashed run would make bind fail.
        let _ = std::fs::remove_file(&path);

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("failed to bind unix socket at {}", path.display()))?;
        debug!(path = %path.display(), "unix listener bound");
        Ok(Box::new(UnixPairListener { listener, path }))
    }

    fn connect(&self, addr: &str, timeout: Duration) -> Result<Box<dyn Pair>> {
        let stream = retry_for(timeout, addr, || UnixStream::connect(addr))?;
        Ok(Box::new(UnixPair {
            stream,
            busy_poll: false,
        }))
    }
}

struct UnixPairListener {
    listener: UnixListener,
    path: PathBuf,
}

impl Listener for UnixPairListener {
    fn local_addr(&self) -> Result<String> {
        Ok(self.path.display().to_string())
    }

    fn accept(&mut self) -> Result<Box<dyn Pair>> {
        let (stream, _) = self.listener.accept()?;
        Ok(Box::new(UnixPair {
            stream,
            busy_poll: false,
        }))
    }
}

impl Drop for UnixPairListener {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(
                "failed to remove socket file {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

#[derive(Debug)]
struct UnixPair {
    stream: UnixStream,
    busy_poll: bool,
}

impl Pair for UnixPair {
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
