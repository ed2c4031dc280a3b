//! Line-delimited JSON frames between clients and the node.
//!
//! Request:  `{"id": 7, "mode": "commit", "call": {...}}`
//! Response: `{"id": 7, "ok": ...}` or `{"id": 7, "err": {"kind": ..., "message": ...}}`

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::identity::{Call, SignedCall};
use crate::ledger::AccountId;
use crate::runtime::{Runtime, RuntimeError};
use crate::config::DEFAULT_TIMEOUT_MS;
use crate::store;

/// Longest request line the server accepts, newline included.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Request {
    /// Simulated call, never committed.
    Static { call: Call },
    Commit { call: SignedCall },
    Balance { account: AccountId },
    Nonce { account: AccountId },
    Status,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestFrame {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl From<RuntimeError> for RemoteError {
    fn from(err: RuntimeError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Reply {
    Ok(Value),
    Err(RemoteError),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseFrame {
    pub id: u64,
    #[serde(flatten)]
    pub reply: Reply,
}

/// Answer to [`Request::Status`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainStatus {
    pub contract_address: String,
    pub height: u64,
    pub timestamp: u64,
    pub state_root: String,
    pub initialized: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind}: {message}")]
    Remote { kind: String, message: String },
    #[error("node closed the connection")]
    Closed,
    #[error("response id {got} does not match request id {expected}")]
    IdMismatch { expected: u64, got: u64 },
    #[error("node state is unavailable")]
    Poisoned,
}

impl RpcError {
    /// Remote error kind, if the node rejected the request.
    pub fn remote_kind(&self) -> Option<&str> {
        match self {
            RpcError::Remote { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

impl From<RemoteError> for RpcError {
    fn from(err: RemoteError) -> Self {
        RpcError::Remote {
            kind: err.kind,
            message: err.message,
        }
    }
}

pub struct Dispatched {
    pub reply: Reply,
    pub committed: bool,
}

fn encode<T: Serialize>(value: T) -> Result<Value, RemoteError> {
    serde_json::to_value(value).map_err(|e| RemoteError {
        kind: "encode".into(),
        message: e.to_string(),
    })
}

/// Runs one request against the runtime.
pub fn dispatch(runtime: &mut Runtime, request: Request, now: u64) -> Dispatched {
    let mut committed = false;
    let result = match request {
        Request::Static { call } => runtime
            .call_static(&call)
            .map_err(RemoteError::from)
            .and_then(encode),
        Request::Commit { call } => match runtime.commit(&call, now) {
            Ok(receipt) => {
                committed = true;
                encode(receipt)
            }
            Err(err) => Err(err.into()),
        },
        Request::Balance { account } => encode(runtime.balance(&account)),
        Request::Nonce { account } => encode(runtime.next_nonce(&account)),
        Request::Status => encode(ChainStatus {
            contract_address: runtime.contract_address().to_string(),
            height: runtime.meta().height,
            timestamp: runtime.meta().timestamp,
            state_root: hex::encode(runtime.state_root()),
            initialized: runtime.contract_state().is_some(),
        }),
    };
    let reply = match result {
        Ok(value) => Reply::Ok(value),
        Err(err) => Reply::Err(err),
    };
    Dispatched { reply, committed }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Seam between the client adapter and wherever the ledger lives.
pub trait Transport: Send + Sync {
    fn round_trip(&self, request: Request) -> Result<Value, RpcError>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn round_trip(&self, request: Request) -> Result<Value, RpcError> {
        (**self).round_trip(request)
    }
}

/// One short-lived TCP connection per request.
pub struct TcpTransport {
    addr: String,
    timeout: Duration,
    next_id: AtomicU64,
}

impl TcpTransport {
    pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn connect(&self) -> Result<TcpStream, RpcError> {
        let mut last_err = None;
        for addr in self.addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing"))
            .into())
    }
}

impl Transport for TcpTransport {
    fn round_trip(&self, request: Request) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = self.connect()?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut frame = serde_json::to_vec(&RequestFrame { id, request })?;
        frame.push(b'\n');
        (&stream).write_all(&frame)?;

        let mut line = String::new();
        if BufReader::new(&stream).read_line(&mut line)? == 0 {
            return Err(RpcError::Closed);
        }
        let response: ResponseFrame = serde_json::from_str(&line)?;
        if response.id != id {
            return Err(RpcError::IdMismatch {
                expected: id,
                got: response.id,
            });
        }
        match response.reply {
            Reply::Ok(value) => Ok(value),
            Reply::Err(err) => Err(err.into()),
        }
    }
}

/// In-process transport over a shared runtime.
#[derive(Clone)]
pub struct LocalTransport {
    runtime: Arc<Mutex<Runtime>>,
}

impl LocalTransport {
    pub fn new(runtime: Runtime) -> Self {
        Self::shared(Arc::new(Mutex::new(runtime)))
    }

    pub fn shared(runtime: Arc<Mutex<Runtime>>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> Arc<Mutex<Runtime>> {
        Arc::clone(&self.runtime)
    }
}

impl Transport for LocalTransport {
    fn round_trip(&self, request: Request) -> Result<Value, RpcError> {
        let mut runtime = self.runtime.lock().map_err(|_| RpcError::Poisoned)?;
        match dispatch(&mut runtime, request, unix_now()).reply {
            Reply::Ok(value) => Ok(value),
            Reply::Err(err) => Err(err.into()),
        }
    }
}

/// Serves one runtime over TCP. All requests go through a single lock, so
/// calls are applied one at a time in lock order.
pub struct Server {
    runtime: Arc<Mutex<Runtime>>,
    state_path: Option<PathBuf>,
    max_frame: usize,
    idle_timeout: Duration,
}

impl Server {
    pub fn new(runtime: Runtime, state_path: Option<PathBuf>) -> Self {
        Self {
            runtime: Arc::new(Mutex::new(runtime)),
            state_path,
            max_frame: MAX_FRAME_BYTES,
            idle_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    /// A connection that sends nothing for this long is dropped.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn runtime(&self) -> Arc<Mutex<Runtime>> {
        Arc::clone(&self.runtime)
    }

    pub fn serve(self, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "node listening");
        let server = Arc::new(self);
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let server = Arc::clone(&server);
                    thread::spawn(move || {
                        if let Err(err) = server.handle_connection(stream) {
                            debug!(error = %err, "connection dropped");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            }
        }
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream) -> io::Result<()> {
        stream.set_read_timeout(Some(self.idle_timeout))?;
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        let limit = self.max_frame as u64;
        let mut line = String::new();
        loop {
            line.clear();
            let read = (&mut reader).take(limit).read_line(&mut line)?;
            if read == 0 {
                return Ok(());
            }
            if read as u64 == limit && !line.ends_with('\n') {
                warn!(limit, "oversized frame, closing connection");
                let response = ResponseFrame {
                    id: 0,
                    reply: Reply::Err(RemoteError {
                        kind: "frame_too_large".into(),
                        message: format!("request line exceeds {limit} bytes"),
                    }),
                };
                return write_frame(&mut writer, &response);
            }
            if line.trim().is_empty() {
                continue;
            }
            write_frame(&mut writer, &self.handle_line(line.trim_end()))?;
        }
    }

    pub fn handle_line(&self, line: &str) -> ResponseFrame {
        let frame: RequestFrame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(err) => {
                return ResponseFrame {
                    id: 0,
                    reply: Reply::Err(RemoteError {
                        kind: "malformed_frame".into(),
                        message: err.to_string(),
                    }),
                }
            }
        };
        debug!(id = frame.id, "request");

        let mut runtime = match self.runtime.lock() {
            Ok(runtime) => runtime,
            Err(_) => {
                return ResponseFrame {
                    id: frame.id,
                    reply: Reply::Err(RemoteError {
                        kind: "unavailable".into(),
                        message: "node state lock poisoned".into(),
                    }),
                }
            }
        };
        let dispatched = dispatch(&mut runtime, frame.request, unix_now());
        if dispatched.committed {
            if let Some(path) = &self.state_path {
                // still under the lock: snapshots land in commit order
                if let Err(err) = store::save(path, &runtime.snapshot()) {
                    error!(path = %path.display(), error = %err, "failed to persist snapshot");
                }
            }
        }
        ResponseFrame {
            id: frame.id,
            reply: dispatched.reply,
        }
    }
}

fn write_frame(writer: &mut TcpStream, response: &ResponseFrame) -> io::Result<()> {
    let mut out = serde_json::to_vec(response)?;
    out.push(b'\n');
    writer.write_all(&out)
}
