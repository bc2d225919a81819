//! Graceful shutdown of the pipeline.
//!
//! The process is stopped in two steps. First the [`ShutdownManager`] signals every registered
//! component (the consumer tasks) through its [`ShutdownToken`]. Each component finishes the
//! event it is handling, so the lake write and the checkpoint commit of that event either both
//! happen or the event is redelivered on the next start, then reports back with
//! [`complete`][ShutdownToken::complete]. Once every component completed, the manager cancels the
//! token of the serving side (the metrics endpoint) and [`join`][ShutdownManager::join] returns.
use std::sync::Arc;

use observability_deps::tracing::info;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

/// Wait for a `SIGTERM` or `SIGINT`.
#[cfg(unix)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM"),
        _ = int.recv() => info!("received SIGINT"),
    }
    Ok(())
}

/// Wait for a `ctrl+c`.
#[cfg(windows)]
pub async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received SIGINT");
    Ok(())
}

#[derive(Debug)]
pub struct ShutdownManager {
    serving_shutdown: CancellationToken,
    consumer_shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownManager {
    /// `serving_shutdown` is cancelled after every registered component completed.
    pub fn new(serving_shutdown: CancellationToken) -> Self {
        Self {
            serving_shutdown,
            consumer_shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn new_testing() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Register a component that must drain before the process exits.
    ///
    /// The component must call [`complete`][ShutdownToken::complete] (or drop every clone of the
    /// token) for [`join`][Self::join] to return.
    pub fn register(&self, component: impl Into<String>) -> ShutdownToken {
        let (tx, rx) = oneshot::channel();
        let component = component.into();
        let name = component.clone();
        self.tasks.spawn(async move {
            // a dropped sender counts as completion
            let _ = rx.await;
            info!(component = %name, "component shut down");
        });
        ShutdownToken {
            component: component.into(),
            token: self.consumer_shutdown.clone(),
            complete_tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Wait for every registered component, then signal the serving side.
    pub async fn join(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.serving_shutdown.cancel();
    }

    /// Ask every registered component to stop.
    pub fn shutdown(&self) {
        info!("shutting down consumers");
        self.consumer_shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.consumer_shutdown.is_cancelled()
    }
}

/// Handle of a registered component.
///
/// Cloned freely into the tasks that make up the component.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    component: Arc<str>,
    token: CancellationToken,
    complete_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownToken {
    /// A token not attached to any manager, cancelled only through [`trigger_shutdown`].
    ///
    /// [`trigger_shutdown`]: Self::trigger_shutdown
    pub fn detached(component: impl Into<String>) -> Self {
        Self {
            component: component.into().into(),
            token: CancellationToken::new(),
            complete_tx: Default::default(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Stop the whole process because of an unrecoverable state in this component.
    pub fn trigger_shutdown(&self) {
        self.token.cancel();
    }

    /// Non-blocking check, used between units of work.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once shutdown was requested.
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Report that this component has drained.
    pub fn complete(&self) {
        if let Some(s) = self.complete_tx.lock().take() {
            let _ = s.send(());
        }
    }
}
