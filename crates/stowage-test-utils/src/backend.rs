//! In-process mock of the remote backend.
//!
//! [`MockBackend`] listens on a Unix socket in a temp directory and speaks
//! the line protocol against an in-memory map. Fault knobs let tests reorder,
//! withhold, or reject replies, push arbitrary lines at the client, and hang
//! up mid-session.
//!
//! Connections are served one at a time, matching the single-client model.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use stowage_config::AppConfig;
use stowage_core::ipc::{Operation, Payload, Request, Response};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::TestConfigBuilder;

/// Reply behaviour, changeable while the backend runs.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Hold replies until this many are queued, then send them newest
    /// first. `0` replies immediately.
    pub reverse_batch: usize,
    /// Never reply.
    pub withhold: bool,
    /// Answer every request with `Err` carrying this message.
    pub reject: Option<String>,
}

enum Control {
    Inject(String),
    HangUp,
}

#[derive(Default)]
struct Shared {
    store: Mutex<HashMap<(String, String), String>>,
    requests: Mutex<Vec<Request>>,
    faults: Mutex<Faults>,
    flushes: AtomicUsize,
    connections: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("mock backend lock poisoned")
}

impl Shared {
    /// Record and answer one request line. `None` means no reply.
    fn handle(&self, line: &str) -> Option<String> {
        let request = match Request::parse(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, line, "Mock backend got a malformed request");
                return None;
            }
        };
        lock(&self.requests).push(request.clone());

        let faults = lock(&self.faults).clone();
        if faults.withhold {
            return None;
        }
        let response = match faults.reject {
            Some(message) => Response::err(message),
            None => self.apply(request.operation()),
        };
        Some(response.answering(request.id()).to_line())
    }

    fn apply(&self, operation: &Operation) -> Response {
        match operation {
            Operation::Save { group, key, value } => {
                lock(&self.store).insert((group.clone(), key.clone()), value.clone());
                Response::ok()
            }
            Operation::Load { group, key } => {
                match lock(&self.store).get(&(group.clone(), key.clone())) {
                    Some(value) => Response::object(Payload::Encoded(value.clone())),
                    None => Response::err("value not found"),
                }
            }
            Operation::Flush => {
                self.flushes.fetch_add(1, Ordering::SeqCst);
                Response::ok()
            }
        }
    }
}

/// A running mock backend. Stops when dropped.
pub struct MockBackend {
    socket_path: PathBuf,
    shared: Arc<Shared>,
    control: mpsc::UnboundedSender<Control>,
    task: JoinHandle<()>,
    _dir: Option<TempDir>,
}

impl MockBackend {
    /// Start on a fresh socket in a temp directory.
    pub async fn start() -> Self {
        let dir = TempDir::new().expect("failed to create temp dir");
        let mut backend = Self::start_at(dir.path().join("game.sock")).await;
        backend._dir = Some(dir);
        backend
    }

    /// Start on `socket_path`. The caller owns the directory.
    pub async fn start_at(socket_path: impl Into<PathBuf>) -> Self {
        let socket_path = socket_path.into();
        let listener = UnixListener::bind(&socket_path).expect("failed to bind mock backend socket");
        let shared = Arc::new(Shared::default());
        let (control, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(serve(listener, Arc::clone(&shared), control_rx));
        debug!(path = %socket_path.display(), "Mock backend listening");

        Self {
            socket_path,
            shared,
            control,
            task,
            _dir: None,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// A remote-mode config pointing at this backend, with short timeouts.
    pub fn config(&self) -> AppConfig {
        TestConfigBuilder::new().remote(&self.socket_path).build()
    }

    pub fn set_faults(&self, faults: Faults) {
        *lock(&self.shared.faults) = faults;
    }

    /// Write `line` to the connected client as is.
    pub fn inject_line(&self, line: impl Into<String>) {
        let _ = self.control.send(Control::Inject(line.into()));
    }

    /// Drop the current client connection.
    pub fn hang_up(&self) {
        let _ = self.control.send(Control::HangUp);
    }

    /// Every well-formed request received so far, in arrival order.
    pub fn requests(&self) -> Vec<Request> {
        lock(&self.shared.requests).clone()
    }

    pub fn request_ids(&self) -> Vec<u64> {
        self.requests().iter().map(Request::id).collect()
    }

    pub fn stored(&self, group: &str, key: &str) -> Option<String> {
        lock(&self.shared.store)
            .get(&(group.to_string(), key.to_string()))
            .cloned()
    }

    pub fn flush_count(&self) -> usize {
        self.shared.flushes.load(Ordering::SeqCst)
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    listener: UnixListener,
    shared: Arc<Shared>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(error = %e, "Mock backend accept failed");
                return;
            }
        };
        shared.connections.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = serve_connection(stream, &shared, &mut control).await {
            debug!(error = %e, "Mock backend connection ended with an error");
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    shared: &Shared,
    control: &mut mpsc::UnboundedReceiver<Control>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut held = Vec::new();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                let Some(reply) = shared.handle(&line) else {
                    continue;
                };
                let batch = lock(&shared.faults).reverse_batch;
                if batch == 0 {
                    write_line(&mut write_half, &reply).await?;
                    continue;
                }
                held.push(reply);
                if held.len() >= batch {
                    for reply in held.drain(..).rev() {
                        write_line(&mut write_half, &reply).await?;
                    }
                }
            }
            command = control.recv() => match command {
                Some(Control::Inject(line)) => write_line(&mut write_half, &line).await?,
                Some(Control::HangUp) | None => {
                    debug!("Mock backend hanging up");
                    return Ok(());
                }
            },
        }
    }
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
