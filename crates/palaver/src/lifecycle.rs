//! Process lifecycle: termination signals, ordered cleanup, optional
//! parent-liveness monitoring.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resolves when SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

type CleanupFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Ordered list of named async shutdown tasks. Each runs with its own
/// timeout; failures never abort the tasks after it.
#[derive(Default)]
pub struct CleanupRegistry {
    tasks: Mutex<Vec<(String, CleanupFn)>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, name: impl Into<String>, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: CleanupFn = Box::new(move || Box::pin(task()));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((name.into(), boxed));
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered task in registration order.
    pub async fn run_all(&self, per_task_timeout: Duration) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for (name, task) in tasks {
            debug!(task = %name, "running cleanup task");
            match tokio::time::timeout(per_task_timeout, task()).await {
                Ok(()) => {}
                Err(_) => warn!(task = %name, "cleanup task timed out"),
            }
        }
    }
}

/// Watch a parent process; when it disappears, fire the token so the hub
/// drains. Off unless `PARENT_PID` is configured.
#[cfg(unix)]
pub fn spawn_parent_watcher(
    parent_pid: u32,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    tokio::spawn(async move {
        let pid = Pid::from_raw(parent_pid as i32);
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Signal 0 probes existence without delivering anything.
                    if kill(pid, None).is_err() {
                        info!(parent_pid, "parent process gone, initiating shutdown");
                        cancel.cancel();
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}

#[cfg(not(unix))]
pub fn spawn_parent_watcher(
    _parent_pid: u32,
    _cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async {})
}
