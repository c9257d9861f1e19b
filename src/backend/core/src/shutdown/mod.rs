//! Graceful shutdown.
//!
//! The [`ShutdownCoordinator`] owns the listener for the lifetime of the
//! server. On the first termination signal it stops accepting connections,
//! lets in-flight requests finish, waits for background tasks and finally
//! releases shared resources. Listener drain and task drain share one grace
//! deadline. A second signal during the drain cuts it short.
//!
//! ```text
//! Idle --signal--> Draining --(listener closed and tasks drained) or deadline--> Terminated
//! ```

use axum::Router;
use futures::future::BoxFuture;
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{AppError, ErrorCode};
use crate::tasks::TaskTracker;

/// Upper bound for a single release hook.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Shared deadline for listener drain and task drain
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(30),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle of the server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShutdownState {
    Idle = 0,
    Draining = 1,
    Terminated = 2,
}

impl ShutdownState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Draining,
            _ => Self::Terminated,
        }
    }
}

/// How the drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Listener closed and every background task finished in time.
    Clean,
    /// The deadline passed or a second signal arrived first.
    Forced,
}

impl ShutdownOutcome {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Clean => 0,
            Self::Forced => 1,
        }
    }
}

/// What a termination signal did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    /// First signal: draining started.
    Drain,
    /// Signal while draining: drain abandoned.
    Force,
    /// Already terminated.
    Ignored,
}

struct ReleaseHook {
    name: &'static str,
    release: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════════════════════

/// Coordinates signal handling, listener drain, task drain and resource release.
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    tasks: TaskTracker,
    state: AtomicU8,
    drain: CancellationToken,
    force: CancellationToken,
    hooks: Mutex<Vec<ReleaseHook>>,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig, tasks: TaskTracker) -> Self {
        Self {
            config,
            tasks,
            state: AtomicU8::new(ShutdownState::Idle as u8),
            drain: CancellationToken::new(),
            force: CancellationToken::new(),
            hooks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Token cancelled when draining starts. Long-running helpers such as the
    /// limiter sweeper stop on it.
    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    /// Register a resource to release after the drain, in registration order.
    pub fn on_release<F, Fut>(&self, name: &'static str, release: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.lock().push(ReleaseHook {
            name,
            release: Box::new(move || -> BoxFuture<'static, ()> { Box::pin(release()) }),
        });
    }

    /// React to a termination signal from `source`.
    pub fn trigger(&self, source: &str) -> SignalDisposition {
        let started = self.state.compare_exchange(
            ShutdownState::Idle as u8,
            ShutdownState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );

        match started {
            Ok(_) => {
                info!(source, "Shutdown signal received, draining");
                self.drain.cancel();
                SignalDisposition::Drain
            }
            Err(current) if ShutdownState::from_u8(current) == ShutdownState::Draining => {
                warn!(source, "Second shutdown signal received, forcing termination");
                self.force.cancel();
                SignalDisposition::Force
            }
            Err(_) => SignalDisposition::Ignored,
        }
    }

    /// Listen for SIGINT and SIGTERM (Ctrl+C elsewhere) and feed them to
    /// [`trigger`](Self::trigger).
    pub fn spawn_signal_listener(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(listen_for_signals(self.clone()))
    }

    /// Serve `app` on `listener` until shutdown completes.
    ///
    /// Returns the outcome once the coordinator reaches `Terminated`. An
    /// error is returned only if the listener failed on its own; resources
    /// are released in that case too.
    pub async fn serve(&self, listener: TcpListener, app: Router) -> Result<ShutdownOutcome, AppError> {
        let drain = self.drain.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move { drain.cancelled().await })
                .await
        });

        let early_exit = tokio::select! {
            _ = self.drain.cancelled() => None,
            joined = &mut server => Some(listener_result(joined)),
        };
        if early_exit.is_some() {
            self.trigger("listener");
        }

        let grace = self.config.grace_period;
        info!(
            grace = ?grace,
            in_flight_tasks = self.tasks.in_flight(),
            "Draining connections and background tasks"
        );

        let listener_closed = early_exit.is_some();
        let drained = async {
            let result = if listener_closed {
                Ok(())
            } else {
                listener_result((&mut server).await)
            };
            self.tasks.wait().await;
            result
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout(grace, drained) => match result {
                Ok(Ok(())) => ShutdownOutcome::Clean,
                Ok(Err(e)) => {
                    error!(error = %e, "Listener failed while draining");
                    ShutdownOutcome::Clean
                }
                Err(_) => ShutdownOutcome::Forced,
            },
            _ = self.force.cancelled() => ShutdownOutcome::Forced,
        };

        if outcome == ShutdownOutcome::Forced {
            server.abort();
            counter!("shutdown_forced_total").increment(1);
            error!(
                code = %ErrorCode::ShutdownTimeout,
                error = %AppError::ShutdownTimeout { grace },
                in_flight_tasks = self.tasks.in_flight(),
                "Shutdown did not complete cleanly"
            );
        }

        self.release().await;
        self.state.store(ShutdownState::Terminated as u8, Ordering::SeqCst);
        info!(outcome = ?outcome, "Shutdown complete");

        match early_exit {
            Some(Err(e)) => Err(e),
            _ => Ok(outcome),
        }
    }

    async fn release(&self) {
        let hooks = std::mem::take(&mut *self.hooks.lock());
        for hook in hooks {
            info!(resource = hook.name, "Releasing resource");
            if tokio::time::timeout(RELEASE_TIMEOUT, (hook.release)()).await.is_err() {
                warn!(resource = hook.name, "Resource release timed out");
            }
        }
    }
}

#[cfg(unix)]
async fn listen_for_signals(coordinator: Arc<ShutdownCoordinator>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut interrupt) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(terminate), Ok(interrupt)) => (terminate, interrupt),
            (Err(e), _) | (_, Err(e)) => {
                error!(error = %e, "Failed to install signal handlers");
                return;
            }
        };

    loop {
        let source = tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        };
        if coordinator.trigger(source) != SignalDisposition::Drain {
            break;
        }
    }
}

#[cfg(not(unix))]
async fn listen_for_signals(coordinator: Arc<ShutdownCoordinator>) {
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            return;
        }
        if coordinator.trigger("ctrl_c") != SignalDisposition::Drain {
            break;
        }
    }
}

fn listener_result(
    joined: Result<std::io::Result<()>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(result) => result.map_err(AppError::from),
        Err(e) => Err(AppError::unexpected(format!("listener task failed: {}", e))),
    }
}
