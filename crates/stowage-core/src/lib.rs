#![deny(unsafe_code)]

//! Stowage core: key/value persistence against local disk or a remote
//! backend process.
//!
//! [`Persistence`] is the entry point. It picks a backend at init and offers
//! the same save/load/flush operations, async or blocking, for either one.
//! Remote sessions multiplex concurrent requests over one Unix socket; see
//! [`ipc`] for the transport.

/// Value codecs for typed payloads.
pub mod codec;
/// Persistence error type.
pub mod error;
/// Remote backend transport: wire types, correlator, reader, connection.
pub mod ipc;
/// Filesystem-backed store.
pub mod local;
/// The persistence session.
pub mod persistence;

pub use codec::{JsonCodec, PrettyJsonCodec, ValueCodec};
pub use error::PersistError;
pub use ipc::{ConnectionState, Payload, Response, ResponseBody, ResponseKind};
pub use local::LocalStore;
pub use persistence::{Persistence, select_mode};
pub use stowage_config::StorageMode;
