//! Background response reader.
//!
//! One reader runs per connection. It parses each line into a [`Response`]
//! and hands it to the [`Correlator`]. Unmatched or malformed lines are
//! logged and dropped; the request they may have answered is left to time
//! out. The reader stops on end-of-stream or a read error and closes the
//! correlator, failing everything still pending.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info, warn};

use super::correlator::Correlator;
use super::types::Response;

/// Why a reader stopped.
#[derive(Debug)]
pub enum ReaderExit {
    /// The backend closed the stream.
    Eof,
    /// Reading failed.
    Failed(std::io::Error),
}

impl std::fmt::Display for ReaderExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Eof => f.write_str("backend closed the connection"),
            Self::Failed(e) => write!(f, "read failed: {e}"),
        }
    }
}

/// Reads response lines and resolves pending requests.
pub struct ResponseReader<R> {
    reader: R,
    correlator: Arc<Correlator>,
    idle_backoff: Duration,
}

impl<R: AsyncBufRead + Unpin> ResponseReader<R> {
    pub fn new(reader: R, correlator: Arc<Correlator>, idle_backoff: Duration) -> Self {
        Self {
            reader,
            correlator,
            idle_backoff,
        }
    }

    /// Run until the stream ends. Closes the correlator before returning.
    pub async fn run(mut self) -> ReaderExit {
        info!("Starting response read loop");
        let mut buf = Vec::new();
        let exit = loop {
            buf.clear();
            match self.reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break ReaderExit::Eof,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim();
                    if line.is_empty() {
                        tokio::time::sleep(self.idle_backoff).await;
                        continue;
                    }
                    self.dispatch(line);
                }
                Err(e) => break ReaderExit::Failed(e),
            }
        };

        match &exit {
            ReaderExit::Eof => info!("Backend closed the connection"),
            ReaderExit::Failed(e) => error!(error = %e, "Response reader failed"),
        }
        self.correlator.close(&exit.to_string());
        exit
    }

    fn dispatch(&self, line: &str) {
        match Response::parse(line) {
            Ok(response) => {
                let request_id = response.request_id();
                if self.correlator.resolve(response) {
                    debug!(?request_id, "Response delivered");
                } else {
                    warn!(?request_id, "Got unexpected response, dropping it");
                }
            }
            Err(e) => warn!(error = %e, line, "Dropping malformed response line"),
        }
    }
}
