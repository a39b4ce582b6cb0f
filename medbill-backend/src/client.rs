//! Lazily initialized backend client
//!
//! [`ClientManager`] owns the one backend client of a process. The first call
//! to [`ClientManager::get_client`] resolves credentials and connects; calls
//! that arrive while that is in progress wait on the same attempt and receive
//! the same outcome. A successful client is reused for the rest of the
//! process. A failed attempt is not cached, so the next call starts over.
//!
//! ```text
//! Uninitialized ──get_client──▶ Initializing ──ok──▶ Ready
//!        ▲                            │
//!        └──────── Failed ◀───err─────┘   (next get_client retries)
//! ```

use crate::backend::{
    BackendConnector, ClientHandle, ConnectRequest, DocumentStore, KeyDelivery, ObjectStore,
};
use crate::config::{ClientConfig, InputSource};
use crate::diagnostics::DiagnosticEmitter;
use crate::error::{Error, Result};
use crate::key_format::NormalizedKey;
use crate::resolver::{CredentialResolver, CredentialSource};
use crate::temp_key::TemporaryKeyFile;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::json;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const CLIENT_SOURCE: &str = "backend-client";
const KEY_FILE_SOURCE: &str = "key-file";

type InitFlight = Shared<BoxFuture<'static, Result<Arc<ClientHandle>>>>;

enum State {
    Uninitialized,
    Initializing { flight: InitFlight, generation: u64 },
    Ready(Arc<ClientHandle>),
    Failed(Error),
}

/// Observable lifecycle of a [`ClientManager`]
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleState {
    /// No attempt has been made, or the manager was reset
    Uninitialized,
    /// An attempt is in flight
    Initializing,
    /// A client is available
    Ready,
    /// The most recent attempt failed; the next call retries
    Failed(Error),
}

// Everything an attempt needs. Kept apart from `State` so an in-flight
// attempt never holds a reference to the state that holds it.
struct InitContext {
    resolver: CredentialResolver,
    connector: Arc<dyn BackendConnector>,
    config: ClientConfig,
    emitter: DiagnosticEmitter,
}

struct Inner {
    context: Arc<InitContext>,
    state: Mutex<State>,
    generation: AtomicU64,
}

/// Process-wide owner of the backend client
///
/// Cheap to clone; clones share one client.
#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<Inner>,
}

impl ClientManager {
    /// Create a manager; nothing is resolved until the first `get_client`
    pub fn new(
        resolver: CredentialResolver,
        connector: Arc<dyn BackendConnector>,
        config: ClientConfig,
        emitter: DiagnosticEmitter,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                context: Arc::new(InitContext {
                    resolver,
                    connector,
                    config,
                    emitter,
                }),
                state: Mutex::new(State::Uninitialized),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Manager reading credentials and settings from the process environment
    pub fn from_env(connector: Arc<dyn BackendConnector>, emitter: DiagnosticEmitter) -> Self {
        let resolver = CredentialResolver::new(InputSource::Environment, emitter.clone());
        Self::new(resolver, connector, ClientConfig::from_env(), emitter)
    }

    /// Get the backend client, initializing it on first use
    ///
    /// Concurrent callers share one attempt. Every initialization failure is
    /// reported as [`Error::CredentialResolutionFailed`] carrying the sources
    /// attempted and the underlying error: [`Error::NoCredentialAvailable`]
    /// when no source produced a credential, the backend's own error when it
    /// refused one, [`Error::Timeout`] when the connection ran too long, or
    /// [`Error::Panicked`] when the connector panicked.
    pub async fn get_client(&self) -> Result<Arc<ClientHandle>> {
        let (flight, generation) = {
            let mut state = self.lock_state()?;
            match &*state {
                State::Ready(client) => return Ok(Arc::clone(client)),
                State::Initializing { flight, generation } => (flight.clone(), *generation),
                State::Uninitialized | State::Failed(_) => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let flight = initialize(Arc::clone(&self.inner.context))
                        .boxed()
                        .shared();
                    *state = State::Initializing {
                        flight: flight.clone(),
                        generation,
                    };
                    (flight, generation)
                }
            }
        };

        let outcome = flight.await;
        self.settle(generation, &outcome);
        outcome
    }

    /// Document store of the backend client
    pub async fn get_document_store(&self) -> Result<Arc<dyn DocumentStore>> {
        Ok(self.get_client().await?.documents())
    }

    /// Object store of the backend client
    pub async fn get_object_store(&self) -> Result<Arc<dyn ObjectStore>> {
        Ok(self.get_client().await?.objects())
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        match self.inner.state.lock() {
            Ok(state) => match &*state {
                State::Uninitialized => LifecycleState::Uninitialized,
                State::Initializing { .. } => LifecycleState::Initializing,
                State::Ready(_) => LifecycleState::Ready,
                State::Failed(err) => LifecycleState::Failed(err.clone()),
            },
            Err(e) => LifecycleState::Failed(Error::LockPoisoned(e.to_string())),
        }
    }

    /// Forget the current client or failure
    ///
    /// An attempt already in flight still completes for its waiters but its
    /// outcome is discarded; the next `get_client` starts a fresh attempt.
    pub fn reset(&self) -> Result<()> {
        let mut state = self.lock_state()?;
        *state = State::Uninitialized;
        drop(state);
        self.inner
            .context
            .emitter
            .info(CLIENT_SOURCE, "Backend client reset", None);
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, State>> {
        self.inner
            .state
            .lock()
            .map_err(|e| Error::LockPoisoned(e.to_string()))
    }

    // Record the outcome of attempt `generation` unless it was superseded
    fn settle(&self, generation: u64, outcome: &Result<Arc<ClientHandle>>) {
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        let current = matches!(
            &*state,
            State::Initializing { generation: g, .. } if *g == generation
        );
        if current {
            *state = match outcome {
                Ok(client) => State::Ready(Arc::clone(client)),
                Err(err) => State::Failed(err.clone()),
            };
        }
    }
}

impl fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientManager")
            .field("state", &self.state())
            .field("connector", &self.inner.context.connector)
            .field("config", &self.inner.context.config)
            .finish()
    }
}

async fn initialize(context: Arc<InitContext>) -> Result<Arc<ClientHandle>> {
    let timeout = context.config.init_timeout();
    context.emitter.info(
        CLIENT_SOURCE,
        "Initializing backend client",
        Some(json!({ "timeoutSecs": timeout.as_secs() })),
    );

    // A panic must settle the attempt like any other failure
    let outcome = AssertUnwindSafe(build_client(&context, timeout))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(terminal(
                Vec::new(),
                Error::Panicked(panic_message(panic.as_ref())),
            ))
        });

    match outcome {
        Ok(client) => {
            context.emitter.info(
                CLIENT_SOURCE,
                "Backend client ready",
                Some(json!({
                    "projectId": client.project_id(),
                    "storageBucket": client.objects().bucket(),
                    "source": client.source().as_str(),
                })),
            );
            Ok(Arc::new(client))
        }
        Err(err) => {
            let message = match err.root_cause() {
                Error::Timeout(_) => "Backend client initialization timed out",
                _ => "Backend client initialization failed",
            };
            context.emitter.error(
                CLIENT_SOURCE,
                message,
                Some(json!({
                    "error": err.to_string(),
                    "attemptedSources": err
                        .attempted_sources()
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>(),
                })),
            );
            Err(err)
        }
    }
}

fn terminal(attempted_sources: Vec<CredentialSource>, err: Error) -> Error {
    match err {
        Error::CredentialResolutionFailed { .. } => err,
        other => Error::CredentialResolutionFailed {
            attempted_sources,
            last_error: Box::new(other),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

// Resolution is synchronous and runs before the clock starts; `timeout`
// bounds the backend connection only.
async fn build_client(context: &InitContext, timeout: Duration) -> Result<ClientHandle> {
    let resolution = context
        .resolver
        .resolve()
        .map_err(|err| terminal(err.attempted_sources().to_vec(), err))?;
    let attempted_sources = resolution.attempted_sources();
    let source = resolution.source();
    let credential = resolution.into_credential();

    let key_file = match (context.connector.key_delivery(), credential.private_key()) {
        (KeyDelivery::FilePath, Some(key)) => Some(
            write_key_file(context, key).map_err(|err| terminal(attempted_sources.clone(), err))?,
        ),
        _ => None,
    };

    let request = ConnectRequest {
        credential,
        source,
        key_file: key_file.as_ref().map(TemporaryKeyFile::to_path_buf),
    };
    let connecting = AssertUnwindSafe(context.connector.connect(request)).catch_unwind();
    let connected = match tokio::time::timeout(timeout, connecting).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(Error::Panicked(panic_message(panic.as_ref()))),
        Err(_) => Err(Error::Timeout(timeout)),
    };

    if let Some(file) = key_file {
        remove_key_file(context, file);
    }

    connected.map_err(|err| terminal(attempted_sources, err))
}

fn write_key_file(context: &InitContext, key: &NormalizedKey) -> Result<TemporaryKeyFile> {
    match TemporaryKeyFile::write(key, context.config.key_file_dir.as_deref()) {
        Ok(file) => {
            context.emitter.info(
                KEY_FILE_SOURCE,
                "Wrote temporary key file",
                Some(json!({
                    "path": file.path().display().to_string(),
                    "privateKeyLength": key.len(),
                })),
            );
            Ok(file)
        }
        Err(err) => {
            context.emitter.error(
                KEY_FILE_SOURCE,
                "Failed to write temporary key file",
                Some(json!({ "error": err.to_string() })),
            );
            Err(err)
        }
    }
}

fn remove_key_file(context: &InitContext, file: TemporaryKeyFile) {
    let path = file.path().display().to_string();
    match file.remove() {
        Ok(()) => context.emitter.debug(
            KEY_FILE_SOURCE,
            "Removed temporary key file",
            Some(json!({ "path": path })),
        ),
        Err(err) => context.emitter.warn(
            KEY_FILE_SOURCE,
            "Failed to remove temporary key file",
            Some(json!({ "path": path, "error": err.to_string() })),
        ),
    }
}
