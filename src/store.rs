//! Key-value stores backing the rendezvous address exchange.
//!
//! Two implementations cover the common deployment shapes: a filesystem
//! store for single-host groups and tests, and a TCP store whose server is
//! hosted by rank 0 for multi-host groups. Keys are written once per run
//! (addresses under a per-run prefix), so neither store supports deletion.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::transport::{read_frame, retry_for, write_frame};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Write-once key-value storage shared by all ranks of a group.
pub trait Store: Send + Sync {
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Block until `key` exists or `timeout` elapses. The default
    /// implementation polls `get`.
    fn wait(&self, key: &str, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.get(key)? {
                return Ok(value);
            }
            if Instant::now() >= deadline {
                bail!("timed out after {timeout:?} waiting for store key {key}");
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Filesystem-backed store: one file per key under a shared directory.
///
/// Publication is atomic (write to a temporary name, then rename), so a
/// reader never observes a half-written address.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store directory {}", root.display()))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys contain '/' separators; flatten them into a single file name.
        self.root.join(key.replace('/', "__"))
    }
}

impl Store for FileStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, value)
            .with_context(|| format!("failed to write store key {key}"))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to publish store key {key}"))?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match std::fs::read(self.path_for(key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read store key {key}")),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum StoreRequest {
    Set { key: String, value: Vec<u8> },
    Get { key: String },
    Wait { key: String, timeout_ms: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
enum StoreResponse {
    Done,
    Value(Option<Vec<u8>>),
    TimedOut,
}

#[derive(Default)]
struct StoreState {
    map: Mutex<HashMap<String, Vec<u8>>>,
    published: Condvar,
}

/// In-memory store server, hosted by rank 0 at the configured endpoint.
pub struct StoreServer {
    addr: String,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl StoreServer {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .with_context(|| format!("failed to bind store server on {addr}"))?;
        let addr = listener.local_addr()?.to_string();
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(StoreState::default());

        let accept_shutdown = shutdown.clone();
        let accept_thread = thread::Builder::new()
            .name("store-server".to_string())
            .spawn(move || Self::accept_loop(listener, state, accept_shutdown))?;

        debug!(%addr, "store server listening");
        Ok(Self {
            addr,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> &str {
        &self.addr
    }

    fn accept_loop(listener: TcpListener, state: Arc<StoreState>, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "store client connected");
                    let state = state.clone();
                    // Client threads end on their own when the peer
                    // disconnects; teardown ordering guarantees every
                    // client is gone before the server shuts down.
                    let _ = thread::Builder::new()
                        .name("store-client".to_string())
                        .spawn(move || Self::serve_client(stream, state));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    warn!("store server accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn serve_client(mut stream: TcpStream, state: Arc<StoreState>) {
        if stream.set_nonblocking(false).is_err() {
            return;
        }
        loop {
            let frame = match read_frame(&mut stream, false) {
                Ok(frame) => frame,
                Err(_) => return, // client disconnected
            };
            let request: StoreRequest = match bincode::deserialize(&frame) {
                Ok(request) => request,
                Err(e) => {
                    warn!("malformed store request: {e}");
                    return;
                }
            };
            let response = Self::handle(request, &state);
            let encoded = match bincode::serialize(&response) {
                Ok(encoded) => encoded,
                Err(_) => return,
            };
            if write_frame(&mut stream, &encoded, false).is_err() {
                return;
            }
        }
    }

    fn handle(request: StoreRequest, state: &StoreState) -> StoreResponse {
        match request {
            StoreRequest::Set { key, value } => {
                let mut map = match state.map.lock() {
                    Ok(map) => map,
                    Err(poisoned) => poisoned.into_inner(),
                };
                map.insert(key, value);
                state.published.notify_all();
                StoreResponse::Done
            }
            StoreRequest::Get { key } => {
                let map = match state.map.lock() {
                    Ok(map) => map,
                    Err(poisoned) => poisoned.into_inner(),
                };
                StoreResponse::Value(map.get(&key).cloned())
            }
            StoreRequest::Wait { key, timeout_ms } => {
                let deadline = Instant::now() + Duration::from_millis(timeout_ms);
                let mut map = match state.map.lock() {
                    Ok(map) => map,
                    Err(poisoned) => poisoned.into_inner(),
                };
                loop {
                    if let Some(value) = map.get(&key) {
                        return StoreResponse::Value(Some(value.clone()));
                    }
                    let remaining = match deadline.checked_duration_since(Instant::now()) {
                        Some(remaining) => remaining,
                        None => return StoreResponse::TimedOut,
                    };
                    map = match state.published.wait_timeout(map, remaining) {
                        Ok((map, _)) => map,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            }
        }
    }

    /// Idempotent: stop accepting and join the accept loop.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.accept_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for StoreServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Client side of the TCP store. One connection per process, shared by all
/// context-creation sequences through a mutex; rendezvous traffic is
/// strictly sequential, so contention never occurs in practice.
pub struct TcpStore {
    stream: Mutex<TcpStream>,
}

impl TcpStore {
    /// Connect with retry: every rank other than 0 may race the server
    /// coming up.
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = retry_for(timeout, addr, || TcpStream::connect(addr))?;
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    fn request(&self, request: &StoreRequest) -> Result<StoreResponse> {
        let mut stream = self
            .stream
            .lock()
            .map_err(|_| anyhow!("store client mutex poisoned"))?;
        write_frame(&mut *stream, &bincode::serialize(request)?, false)?;
        let frame = read_frame(&mut *stream, false)?;
        Ok(bincode::deserialize(&frame)?)
    }
}

impl Store for TcpStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        match self.request(&StoreRequest::Set {
            key: key.to_string(),
            value: value.to_vec(),
        })? {
            StoreResponse::Done => Ok(()),
            other => bail!("unexpected store response to set: {other:?}"),
        }
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.request(&StoreRequest::Get {
            key: key.to_string(),
        })? {
            StoreResponse::Value(value) => Ok(value),
            other => bail!("unexpected store response to get: {other:?}"),
        }
    }

    /// Server-side wait: the request blocks on the server until the key is
    /// published or the deadline passes, instead of client-side polling.
    fn wait(&self, key: &str, timeout: Duration) -> Result<Vec<u8>> {
        let request = StoreRequest::Wait {
            key: key.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        match self.request(&request)? {
            StoreResponse::Value(Some(value)) => Ok(value),
            StoreResponse::TimedOut => {
                bail!("timed out after {timeout:?} waiting for store key {key}")
            }
            other => bail!("unexpected store response to wait: {other:?}"),
        }
    }
}
