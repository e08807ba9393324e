//! The persistence session: one entry point for save, load and flush that
//! works the same against local disk and the remote backend.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use stowage_config::{AppConfig, StorageConfig, StorageMode};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::codec::{self, JsonCodec, ValueCodec};
use crate::error::PersistError;
use crate::ipc::{
    ConnectionManager, ConnectionState, Correlator, Operation, Payload, ReconnectPolicy, Response,
    ResponseBody,
};
use crate::local::LocalStore;

/// Resolve `storage.mode` to a concrete backend. `Auto` picks remote when
/// the deployment marker directory exists.
pub fn select_mode(storage: &StorageConfig) -> StorageMode {
    match storage.mode {
        StorageMode::Auto => {
            if Path::new(&storage.deployment_marker).is_dir() {
                StorageMode::Remote
            } else {
                StorageMode::Local
            }
        }
        explicit => explicit,
    }
}

enum Backend {
    Local(LocalStore),
    Remote(RemoteBackend),
}

struct RemoteBackend {
    socket_path: PathBuf,
    correlator: Arc<Correlator>,
    state: watch::Receiver<ConnectionState>,
    ready_timeout: Duration,
    task: JoinHandle<()>,
}

impl RemoteBackend {
    async fn wait_ready(&self, timeout: Duration) -> Result<(), PersistError> {
        let mut state = self.state.clone();
        let settled = tokio::time::timeout(timeout, state.wait_for(|s| !s.is_pending())).await;
        let settled = match settled {
            Err(_) => return Err(PersistError::NotInitialized),
            Ok(Err(_)) => {
                return Err(PersistError::BackendUnavailable(
                    "connection task stopped".to_string(),
                ));
            }
            Ok(Ok(state)) => state.clone(),
        };
        match settled {
            ConnectionState::Connected => Ok(()),
            other => Err(PersistError::BackendUnavailable(other.to_string())),
        }
    }

    async fn request(&self, operation: Operation) -> Result<Response, PersistError> {
        self.wait_ready(self.ready_timeout).await?;
        let request = self.correlator.next_request(operation);
        self.correlator.send(request).await
    }
}

/// A persistence session.
///
/// Remote sessions own a background task that keeps the backend connection
/// and reads responses. Dropping the session stops it and fails whatever is
/// still in flight.
pub struct Persistence {
    backend: Backend,
    codec: Arc<dyn ValueCodec>,
    runtime: Handle,
}

impl Persistence {
    /// Start a session on the current tokio runtime.
    pub fn init(config: &AppConfig) -> Result<Self, PersistError> {
        let runtime = Handle::try_current()
            .map_err(|e| PersistError::Runtime(format!("no tokio runtime available: {e}")))?;
        Self::init_on(config, runtime)
    }

    /// Start a session on the given runtime. Use this to drive the
    /// `*_blocking` calls from threads outside the runtime.
    pub fn init_on(config: &AppConfig, runtime: Handle) -> Result<Self, PersistError> {
        let mode = select_mode(&config.storage);
        info!(configured = %config.storage.mode, selected = %mode, "Initializing persistence");

        let backend = match mode {
            StorageMode::Remote => Backend::Remote(Self::start_remote(config, &runtime)),
            _ => Backend::Local(LocalStore::new(&config.storage.local_path)),
        };

        Ok(Self {
            backend,
            codec: Arc::new(JsonCodec),
            runtime,
        })
    }

    fn start_remote(config: &AppConfig, runtime: &Handle) -> RemoteBackend {
        let socket_path = config.ipc.resolve_socket_path();
        let correlator = Arc::new(Correlator::new(config.request.timeout()));
        let (manager, state) = ConnectionManager::new(
            &socket_path,
            ReconnectPolicy::from(&config.reconnect),
            &config.request,
            Arc::clone(&correlator),
        );
        let task = runtime.spawn(manager.run());
        RemoteBackend {
            socket_path,
            correlator,
            state,
            ready_timeout: config.reconnect.ready_timeout(),
            task,
        }
    }

    /// Replace the default codec used by `save` and `load`.
    pub fn with_codec(mut self, codec: impl ValueCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// The backend in use: `Local` or `Remote`.
    pub fn mode(&self) -> StorageMode {
        match self.backend {
            Backend::Local(_) => StorageMode::Local,
            Backend::Remote(_) => StorageMode::Remote,
        }
    }

    /// Current connection state; `None` for local sessions.
    pub fn connection_state(&self) -> Option<ConnectionState> {
        match &self.backend {
            Backend::Local(_) => None,
            Backend::Remote(remote) => Some(remote.state.borrow().clone()),
        }
    }

    /// Socket path of a remote session.
    pub fn socket_path(&self) -> Option<&Path> {
        match &self.backend {
            Backend::Local(_) => None,
            Backend::Remote(remote) => Some(&remote.socket_path),
        }
    }

    /// Wait up to `timeout` for the backend connection.
    ///
    /// Local sessions are always ready. Fails with `NotInitialized` if the
    /// connection is still being attempted when the time runs out, and with
    /// `BackendUnavailable` if it never will be.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), PersistError> {
        match &self.backend {
            Backend::Local(_) => Ok(()),
            Backend::Remote(remote) => remote.wait_ready(timeout).await,
        }
    }

    /// Store `value` under `group`/`key` using the session codec.
    pub async fn save<T: Serialize + ?Sized>(
        &self,
        group: &str,
        key: &str,
        value: &T,
    ) -> Result<(), PersistError> {
        self.save_with(group, key, value, self.codec.as_ref()).await
    }

    /// Store `value` using an explicit codec.
    pub async fn save_with<T: Serialize + ?Sized>(
        &self,
        group: &str,
        key: &str,
        value: &T,
        codec: &dyn ValueCodec,
    ) -> Result<(), PersistError> {
        let payload = codec::encode_value(codec, value)?;
        debug!(group, key, codec = codec.name(), "Encoded value");
        self.save_raw(group, key, payload).await
    }

    /// Store an already-serialized payload as is.
    pub async fn save_raw(&self, group: &str, key: &str, payload: String) -> Result<(), PersistError> {
        match &self.backend {
            Backend::Local(store) => store.save(group, key, payload).await,
            Backend::Remote(remote) => {
                let response = remote
                    .request(Operation::Save {
                        group: group.to_string(),
                        key: key.to_string(),
                        value: payload,
                    })
                    .await?;
                expect_ok(response, "Save")
            }
        }
    }

    /// Load and decode the value under `group`/`key` using the session codec.
    pub async fn load<T: DeserializeOwned>(&self, group: &str, key: &str) -> Result<T, PersistError> {
        self.load_with(group, key, self.codec.as_ref()).await
    }

    /// Load and decode with an explicit codec.
    pub async fn load_with<T: DeserializeOwned>(
        &self,
        group: &str,
        key: &str,
        codec: &dyn ValueCodec,
    ) -> Result<T, PersistError> {
        self.load_response(group, key).await?.try_as_type_with(codec)
    }

    /// Load the stored payload string without decoding it.
    pub async fn load_raw(&self, group: &str, key: &str) -> Result<String, PersistError> {
        match self.load_response(group, key).await?.into_body() {
            ResponseBody::Object(payload) => Ok(payload.to_raw()),
            ResponseBody::Err(message) => Err(PersistError::Remote(message)),
            ResponseBody::Ok => Err(PersistError::Protocol(
                "Load answered with Ok and no value".to_string(),
            )),
        }
    }

    /// Load the response for `group`/`key` as the backend sent it.
    ///
    /// Local sessions produce an `Object` response, or `NotFound`.
    pub async fn load_response(&self, group: &str, key: &str) -> Result<Response, PersistError> {
        match &self.backend {
            Backend::Local(store) => {
                let payload = store.load(group, key).await?;
                Ok(Response::object(Payload::Encoded(payload)))
            }
            Backend::Remote(remote) => {
                remote
                    .request(Operation::Load {
                        group: group.to_string(),
                        key: key.to_string(),
                    })
                    .await
            }
        }
    }

    /// Persist everything saved so far.
    pub async fn flush(&self) -> Result<(), PersistError> {
        match &self.backend {
            Backend::Local(store) => store.flush().await.map(|_| ()),
            Backend::Remote(remote) => {
                let response = remote.request(Operation::Flush).await?;
                expect_ok(response, "Flush")
            }
        }
    }

    /// Release the backend connection. Requests still in flight fail with
    /// `BackendUnavailable`.
    pub async fn shutdown(self) {
        if let Backend::Remote(remote) = &self.backend {
            remote.task.abort();
            remote.correlator.close("persistence session shut down");
            remote.correlator.detach().await;
            info!(path = %remote.socket_path.display(), "Persistence session shut down");
        }
    }

    pub fn save_blocking<T: Serialize + ?Sized>(
        &self,
        group: &str,
        key: &str,
        value: &T,
    ) -> Result<(), PersistError> {
        self.block_on(self.save(group, key, value))?
    }

    pub fn save_with_blocking<T: Serialize + ?Sized>(
        &self,
        group: &str,
        key: &str,
        value: &T,
        codec: &dyn ValueCodec,
    ) -> Result<(), PersistError> {
        self.block_on(self.save_with(group, key, value, codec))?
    }

    pub fn save_raw_blocking(&self, group: &str, key: &str, payload: String) -> Result<(), PersistError> {
        self.block_on(self.save_raw(group, key, payload))?
    }

    pub fn load_blocking<T: DeserializeOwned>(&self, group: &str, key: &str) -> Result<T, PersistError> {
        self.block_on(self.load(group, key))?
    }

    pub fn load_with_blocking<T: DeserializeOwned>(
        &self,
        group: &str,
        key: &str,
        codec: &dyn ValueCodec,
    ) -> Result<T, PersistError> {
        self.block_on(self.load_with(group, key, codec))?
    }

    pub fn load_raw_blocking(&self, group: &str, key: &str) -> Result<String, PersistError> {
        self.block_on(self.load_raw(group, key))?
    }

    pub fn load_response_blocking(&self, group: &str, key: &str) -> Result<Response, PersistError> {
        self.block_on(self.load_response(group, key))?
    }

    pub fn flush_blocking(&self) -> Result<(), PersistError> {
        self.block_on(self.flush())?
    }

    pub fn wait_ready_blocking(&self, timeout: Duration) -> Result<(), PersistError> {
        self.block_on(self.wait_ready(timeout))?
    }

    /// Run `future` to completion on the session's runtime, blocking this
    /// thread. Refuses to run on a runtime thread, where blocking would
    /// stall the tasks the future depends on.
    fn block_on<F: Future>(&self, future: F) -> Result<F::Output, PersistError> {
        if Handle::try_current().is_ok() {
            return Err(PersistError::Runtime(
                "blocking persistence call made from inside the async runtime".to_string(),
            ));
        }
        Ok(self.runtime.block_on(future))
    }
}

impl Drop for Persistence {
    fn drop(&mut self) {
        if let Backend::Remote(remote) = &self.backend {
            remote.task.abort();
            remote.correlator.close("persistence session dropped");
        }
    }
}

fn expect_ok(response: Response, operation: &str) -> Result<(), PersistError> {
    match response.into_body() {
        ResponseBody::Ok => Ok(()),
        ResponseBody::Err(message) => Err(PersistError::Remote(message)),
        ResponseBody::Object(_) => Err(PersistError::Protocol(format!(
            "{operation} answered with an Object response"
        ))),
    }
}
