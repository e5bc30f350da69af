//! Start/stop bookkeeping for long-lived background loops.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handles of a running set of loops plus their shutdown signal
#[derive(Debug, Default)]
pub(crate) struct Background {
    running: Option<Running>,
}

#[derive(Debug)]
struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Background {
    pub(crate) fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Spawn loops via `spawn`; returns false if already running
    pub(crate) fn start<F>(&mut self, spawn: F) -> bool
    where
        F: FnOnce(&watch::Receiver<bool>) -> Vec<JoinHandle<()>>,
    {
        if self.running.is_some() {
            return false;
        }
        let (shutdown, rx) = watch::channel(false);
        let handles = spawn(&rx);
        self.running = Some(Running { shutdown, handles });
        true
    }

    /// Signal shutdown, wait up to `grace`, then abort stragglers.
    ///
    /// Returns false if nothing was running.
    pub(crate) async fn stop(&mut self, name: &str, grace: Duration) -> bool {
        let Some(Running { shutdown, handles }) = self.running.take() else {
            return false;
        };
        let _ = shutdown.send(true);

        for mut handle in handles {
            match tokio::time::timeout(grace, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "Background task panicked"),
                Err(_) => {
                    warn!(task = name, "Background task did not stop in time, aborting");
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
        debug!(task = name, "Background task stopped");
        true
    }
}

/// Sleep for `delay` unless shutdown is signalled first.
///
/// Returns true when shutdown was requested.
pub(crate) async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let mut background = Background::default();
        let started = background.start(|rx| {
            let mut rx = rx.clone();
            vec![tokio::spawn(async move {
                while !sleep_or_shutdown(&mut rx, Duration::from_secs(60)).await {}
            })]
        });
        assert!(started);
        assert!(!background.start(|_| Vec::new()));

        assert!(background.stop("test", Duration::from_secs(1)).await);
        assert!(!background.stop("test", Duration::from_secs(1)).await);
        assert!(!background.is_running());
    }

    #[tokio::test]
    async fn test_stuck_task_is_aborted_after_grace() {
        let mut background = Background::default();
        background.start(|_| {
            vec![tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })]
        });

        let stopped = tokio::time::timeout(
            Duration::from_secs(5),
            background.stop("stuck", Duration::from_millis(20)),
        )
        .await;
        assert_eq!(stopped.ok(), Some(true));
    }
}
