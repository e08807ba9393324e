//! Connection manager. Opens the backend socket, retrying per policy, then
//! runs the response reader for the life of the connection.
//!
//! Progress is published on a `watch` channel as [`ConnectionState`] so
//! callers can wait for readiness instead of polling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use stowage_config::{ReconnectConfig, RequestConfig};
use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::correlator::Correlator;
use super::reader::ResponseReader;
use crate::error::PersistError;

/// Where the connection to the backend stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Trying to connect; `attempt` counts from 1.
    Connecting { attempt: u32 },
    /// Connected; requests flow.
    Connected,
    /// Retry budget exhausted without ever connecting.
    GaveUp { attempts: u32 },
    /// Connection lost or released. Terminal.
    Disconnected { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Whether the state can still change to `Connected`.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting { attempt } => write!(f, "connecting (attempt {attempt})"),
            Self::Connected => f.write_str("connected"),
            Self::GaveUp { attempts } => write!(f, "gave up after {attempts} attempts"),
            Self::Disconnected { reason } => write!(f, "disconnected: {reason}"),
        }
    }
}

/// How long to wait between connection attempts, and when to stop.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub backoff_factor: f64,
    pub max_interval: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Retry forever at a fixed interval.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            backoff_factor: 1.0,
            max_interval: interval,
            max_attempts: None,
        }
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.interval.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = secs.min(self.max_interval.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self {
            interval: config.interval(),
            backoff_factor: config.backoff_factor,
            max_interval: config.max_interval(),
            max_attempts: (config.max_attempts > 0).then_some(config.max_attempts),
        }
    }
}

/// Owns the backend stream for one session.
pub struct ConnectionManager {
    socket_path: PathBuf,
    policy: ReconnectPolicy,
    idle_backoff: Duration,
    correlator: Arc<Correlator>,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        policy: ReconnectPolicy,
        request: &RequestConfig,
        correlator: Arc<Correlator>,
    ) -> (Self, watch::Receiver<ConnectionState>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting { attempt: 1 });
        let manager = Self {
            socket_path: socket_path.into(),
            policy,
            idle_backoff: request.idle_backoff(),
            correlator,
            state_tx,
        };
        (manager, state_rx)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Run on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Connect, then read responses until the stream ends.
    pub async fn run(self) {
        let Some(stream) = self.connect_with_retry().await else {
            return;
        };

        let (read_half, write_half) = stream.into_split();
        self.correlator.attach(Box::new(write_half)).await;
        self.state_tx.send_replace(ConnectionState::Connected);
        info!(path = %self.socket_path.display(), "Connected to backend");

        let reader = ResponseReader::new(
            BufReader::new(read_half),
            Arc::clone(&self.correlator),
            self.idle_backoff,
        );
        let exit = reader.run().await;

        self.correlator.detach().await;
        self.state_tx.send_replace(ConnectionState::Disconnected {
            reason: exit.to_string(),
        });
    }

    async fn connect_with_retry(&self) -> Option<UnixStream> {
        let mut attempt = 1;
        loop {
            self.state_tx
                .send_replace(ConnectionState::Connecting { attempt });
            match self.try_connect().await {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    if !self.policy.allows_retry(attempt) {
                        warn!(attempts = attempt, error = %e, "Giving up on backend connection");
                        self.correlator
                            .close(&format!("gave up connecting after {attempt} attempts"));
                        self.state_tx
                            .send_replace(ConnectionState::GaveUp { attempts: attempt });
                        return None;
                    }
                    let delay = self.policy.delay_after(attempt);
                    warn!(attempt, ?delay, error = %e, "Could not connect to backend, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<UnixStream, PersistError> {
        info!(path = %self.socket_path.display(), "Trying to open backend socket");
        UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| PersistError::ConnectionUnavailable {
                path: self.socket_path.clone(),
                source,
            })
    }
}
