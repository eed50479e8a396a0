//! # Client Lifecycle
//!
//! Owns the single queue client shared by everything in a job system.
//!
//! The first `get_client` call creates and starts the client; callers that
//! arrive while the start is in flight await the same shared future instead of
//! issuing their own start. A failed start is returned to every waiter and
//! cleared so a later call can retry. `stop` drains and discards the instance,
//! after which the next `get_client` starts a fresh one.
//!
//! Termination signal handlers are installed once per process, no matter how
//! many managers are constructed. The listener runs on the runtime that
//! installed it; when that runtime shuts down the process-wide slot is freed
//! and the next manager built on a live runtime installs a new listener.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::ClientSettings;
use crate::error::{JobError, Result};
use crate::messaging::{ErrorCallback, PgBossClient, QueueClient, StopOptions};

/// Process-wide guard so signal handlers are registered at most once
static SIGNAL_HANDLERS_REGISTERED: AtomicBool = AtomicBool::new(false);

/// Held by the listener task; frees the process-wide slot when the task is dropped
struct ListenerGuard;

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        SIGNAL_HANDLERS_REGISTERED.store(false, Ordering::SeqCst);
        info!("Termination signal listener released");
    }
}

type StartFuture = Shared<BoxFuture<'static, Result<Arc<dyn QueueClient>>>>;

/// Builds unstarted queue clients
pub trait ClientFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn QueueClient>>;
}

/// Factory for the bundled [`PgBossClient`]
#[derive(Debug, Clone)]
pub struct PgBossClientFactory {
    connection_string: String,
    schema: String,
    settings: ClientSettings,
}

impl PgBossClientFactory {
    pub fn new(
        connection_string: impl Into<String>,
        schema: impl Into<String>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            connection_string: connection_string.into(),
            schema: schema.into(),
            settings,
        }
    }
}

impl ClientFactory for PgBossClientFactory {
    fn create(&self) -> Result<Arc<dyn QueueClient>> {
        Ok(Arc::new(PgBossClient::new(
            self.connection_string.clone(),
            self.schema.clone(),
            self.settings.clone(),
        )))
    }
}

#[derive(Default)]
struct ClientState {
    instance: Option<Arc<dyn QueueClient>>,
    /// At most one in-flight start at a time
    starting: Option<StartFuture>,
}

/// Lazily starts, shares and stops the queue client
#[derive(Clone)]
pub struct ClientManager {
    state: Arc<Mutex<ClientState>>,
    factory: Arc<dyn ClientFactory>,
    on_error: ErrorCallback,
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ClientManager")
            .field("started", &state.instance.is_some())
            .field("starting", &state.starting.is_some())
            .finish()
    }
}

impl ClientManager {
    pub fn new(factory: Arc<dyn ClientFactory>, on_error: ErrorCallback) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClientState::default())),
            factory,
            on_error,
        }
    }

    /// Create a manager and install the process-wide signal handlers if no
    /// manager has done so yet.
    ///
    /// The listener is spawned on the current Tokio runtime and stops the
    /// manager that installed it. If that runtime is dropped first, the slot is
    /// released and a manager created afterwards on another runtime installs
    /// its own listener.
    pub fn with_signal_handlers(factory: Arc<dyn ClientFactory>, on_error: ErrorCallback) -> Self {
        let manager = Self::new(factory, on_error);
        register_signal_handlers(&manager);
        manager
    }

    /// The shared client, starting it if necessary
    pub async fn get_client(&self) -> Result<Arc<dyn QueueClient>> {
        let start = {
            let mut state = self.state.lock();
            if let Some(instance) = &state.instance {
                return Ok(instance.clone());
            }
            match &state.starting {
                Some(start) => start.clone(),
                None => {
                    let start = start_client(
                        self.state.clone(),
                        self.factory.clone(),
                        self.on_error.clone(),
                    )
                    .boxed()
                    .shared();
                    state.starting = Some(start.clone());
                    start
                }
            }
        };

        start.await
    }

    /// Gracefully stop the client; a no-op when none is running
    pub async fn stop(&self) -> Result<()> {
        let instance = {
            let mut state = self.state.lock();
            let instance = state.instance.take();
            if instance.is_some() {
                state.starting = None;
            }
            instance
        };

        if let Some(instance) = instance {
            instance.stop(StopOptions { graceful: true }).await?;
            info!("🛑 Queue client stopped");
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().instance.is_some()
    }
}

async fn start_client(
    state: Arc<Mutex<ClientState>>,
    factory: Arc<dyn ClientFactory>,
    on_error: ErrorCallback,
) -> Result<Arc<dyn QueueClient>> {
    let result = async {
        let client = factory.create()?;
        client.on_error(on_error);
        client.start().await?;
        Ok::<_, JobError>(client)
    }
    .await;

    let mut guard = state.lock();
    guard.starting = None;
    match &result {
        Ok(client) => {
            guard.instance = Some(client.clone());
            info!("🚀 Queue client started");
        }
        Err(e) => error!(error = %e, "❌ Queue client failed to start"),
    }
    result
}

/// Install SIGINT/SIGTERM handlers that gracefully stop `manager`.
///
/// Only one listener exists per process at a time. Without a Tokio runtime
/// nothing is installed and a later call may try again; the same holds once
/// the runtime hosting the listener has shut down.
pub fn register_signal_handlers(manager: &ClientManager) -> bool {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No Tokio runtime available, termination signal handlers not installed");
        return false;
    };

    if SIGNAL_HANDLERS_REGISTERED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        debug!("Termination signal handlers already installed for this process");
        return false;
    }

    let guard = ListenerGuard;
    let manager = manager.clone();
    runtime.spawn(async move {
        let _guard = guard;
        let exit_code = shutdown_signal().await;
        info!("🛑 Shutdown signal received, stopping queue client...");
        if let Err(e) = manager.stop().await {
            error!(error = %e, "Failed to stop queue client cleanly");
        }
        std::process::exit(exit_code);
    });

    debug!("Termination signal handlers installed");
    true
}

/// Wait for Ctrl+C or SIGTERM, returning the conventional exit code
async fn shutdown_signal() -> i32 {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
            130
        },
        _ = terminate => {
            info!("Received SIGTERM");
            143
        },
    }
}
