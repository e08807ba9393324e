//! Request/response correlation over a single duplex stream.
//!
//! Every outgoing request gets a fresh id and a pending entry holding the
//! completion handle its caller waits on. The reader resolves entries by id,
//! so responses may arrive in any order.
//!
//! Invariants:
//! - ids are strictly increasing and never reused within a correlator;
//! - a request's pending entry exists before its line is written;
//! - an entry is resolved at most once and is gone the moment it resolves,
//!   times out, or its caller stops waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::types::{Operation, Request, Response};
use crate::error::PersistError;

/// Write half of the backend stream.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type Completion = oneshot::Sender<Result<Response, PersistError>>;
type Waiter = oneshot::Receiver<Result<Response, PersistError>>;

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, Completion>,
    /// Set once the stream is gone; no new entries are accepted after that.
    closed: Option<String>,
}

/// Matches responses to the requests that caused them.
pub struct Correlator {
    next_id: AtomicU64,
    pending: Mutex<PendingTable>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    timeout: Duration,
}

impl Correlator {
    /// Create a correlator with no stream attached yet.
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            pending: Mutex::new(PendingTable::default()),
            writer: tokio::sync::Mutex::new(None),
            timeout,
        }
    }

    /// Allocate an id for `operation`.
    pub fn next_request(&self, operation: Operation) -> Request {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Request::new(id, operation)
    }

    /// Give the correlator the stream's write half.
    pub async fn attach(&self, writer: BoxedWriter) {
        *self.writer.lock().await = Some(writer);
    }

    /// Drop the write half, closing our side of the stream.
    pub async fn detach(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Send a request and wait for its response.
    ///
    /// One deadline covers queueing for the stream, writing the line, and
    /// waiting for the reply. Fails with `TimedOut` when it passes, and with
    /// `BackendUnavailable` when the stream goes away first.
    pub async fn send(&self, request: Request) -> Result<Response, PersistError> {
        let id = request.id();
        let deadline = Instant::now() + self.timeout;
        let (rx, _guard) = self.register(id)?;

        self.write_line(id, &request.to_line(), deadline).await?;
        debug!(request_id = id, kind = ?request.kind(), "Request sent");

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PersistError::BackendUnavailable(
                "completion handle dropped".to_string(),
            )),
            Err(_) => Err(self.timed_out(id)),
        }
    }

    /// Resolve the pending entry matching `response`.
    ///
    /// Returns `false` when no entry matches; the response is dropped.
    pub fn resolve(&self, response: Response) -> bool {
        let Some(id) = response.request_id() else {
            return false;
        };
        let Some(tx) = self.table().entries.remove(&id) else {
            return false;
        };
        if tx.send(Ok(response)).is_err() {
            debug!(request_id = id, "Caller stopped waiting before the response arrived");
        }
        true
    }

    /// Refuse new requests and fail every pending one with
    /// `BackendUnavailable`.
    pub fn close(&self, reason: &str) {
        let drained: Vec<(u64, Completion)> = {
            let mut table = self.table();
            if table.closed.is_none() {
                table.closed = Some(reason.to_string());
            }
            table.entries.drain().collect()
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), reason, "Failing pending requests");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(PersistError::BackendUnavailable(reason.to_string())));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.table().closed.is_some()
    }

    /// Number of requests currently awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.table().entries.len()
    }

    fn table(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: u64) -> Result<(Waiter, PendingGuard<'_>), PersistError> {
        let mut table = self.table();
        if let Some(reason) = &table.closed {
            return Err(PersistError::BackendUnavailable(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        table.entries.insert(id, tx);
        Ok((rx, PendingGuard { correlator: self, id }))
    }

    fn timed_out(&self, id: u64) -> PersistError {
        warn!(request_id = id, timeout = ?self.timeout, "Request timed out");
        PersistError::TimedOut {
            request_id: id,
            timeout: self.timeout,
        }
    }

    async fn write_line(&self, id: u64, line: &str, deadline: Instant) -> Result<(), PersistError> {
        let mut guard = tokio::time::timeout_at(deadline, self.writer.lock())
            .await
            .map_err(|_| self.timed_out(id))?;
        let Some(writer) = guard.as_mut() else {
            return Err(match &self.table().closed {
                Some(reason) => PersistError::BackendUnavailable(reason.clone()),
                None => PersistError::NotInitialized,
            });
        };

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');

        let write = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        };
        let written = tokio::time::timeout_at(deadline, write).await;
        match written {
            Ok(result) => {
                result.map_err(|e| PersistError::BackendUnavailable(format!("write failed: {e}")))
            }
            Err(_) => {
                // A partly written line would corrupt every later request.
                guard.take();
                self.close("backend stopped reading requests");
                Err(self.timed_out(id))
            }
        }
    }
}

/// Removes a pending entry when the sending call ends, however it ends.
/// A no-op if the reader already resolved it.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.table().entries.remove(&self.id);
    }
}
