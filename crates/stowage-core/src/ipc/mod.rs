//! Remote backend transport over a Unix domain socket.
//!
//! Requests and responses are single-line JSON objects. Many requests may be
//! in flight at once; each carries an id and the backend echoes it back, in
//! whatever order it finishes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  send()   ┌────────────┐  line JSON   ┌───────────┐
//! │ Persistence │──────────▶│ Correlator │─────────────▶│           │
//! │   façade    │◀──────────│  (pending) │              │  Backend  │
//! └─────────────┘  resolve  └─────▲──────┘              │  process  │
//!                                 │ resolve(id)         │           │
//!                          ┌──────┴─────────┐ line JSON │           │
//!                          │ ResponseReader │◀──────────│           │
//!                          └────────────────┘           └───────────┘
//! ```
//!
//! [`ConnectionManager`] owns the socket: it connects with retry, hands the
//! write half to the [`Correlator`], and drives the [`ResponseReader`] on the
//! read half until the stream ends.

pub mod connection;
pub mod correlator;
pub mod reader;
pub mod types;

pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use correlator::Correlator;
pub use reader::{ReaderExit, ResponseReader};
pub use types::*;
