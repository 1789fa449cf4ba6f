//! Background task slots polled by the agent main loop
//!
//! A slot runs at most one task at a time and remembers how its last run
//! failed, panics included. The main loop checks the slot once per tick
//! instead of joining.

use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Resolves once `shutdown` holds true, or once its sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Clone)]
pub struct TaskSlot {
    name: &'static str,
    running: Arc<AtomicBool>,
    error: Arc<Mutex<Option<String>>>,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

/// Clears the running flag however the task ends: returned, panicked or aborted.
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl TaskSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Arc::new(AtomicBool::new(false)),
            error: Arc::new(Mutex::new(None)),
            handle: Arc::new(Mutex::new(None)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Failure of the last run, cleared by reading it.
    pub fn take_error(&self) -> Option<String> {
        self.error.lock().take()
    }

    /// Spawn `task` unless one is already running. Returns whether it was spawned.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }

        let flag = RunningFlag(self.running.clone());
        let error = self.error.clone();
        let name = self.name;
        let handle = tokio::spawn(async move {
            let _flag = flag;
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("Task {} failed: {:#}", name, e);
                    *error.lock() = Some(format!("{e:#}"));
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!("Task {} panicked: {}", name, message);
                    *error.lock() = Some(format!("task panicked: {message}"));
                }
            }
        });
        *self.handle.lock() = Some(handle);
        true
    }

    /// Cancel the running task and wait until it is gone, so everything it
    /// owned has been dropped when this returns.
    pub async fn stop(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            debug!("Task {} stopped", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{RestartCoordinator, REQUEST_LOCK};
    use std::time::Duration;

    async fn wait_stopped(slot: &TaskSlot) {
        for _ in 0..100 {
            if !slot.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} still running", slot.name());
    }

    #[tokio::test]
    async fn test_single_instance_and_error_capture() {
        let slot = TaskSlot::new("watcher");
        let (release, wait) = tokio::sync::oneshot::channel::<()>();

        assert!(slot.spawn(async move {
            let _ = wait.await;
            anyhow::bail!("inotify watch failed")
        }));
        assert!(slot.is_running());
        assert!(!slot.spawn(async { Ok(()) }));

        release.send(()).unwrap();
        wait_stopped(&slot).await;

        assert_eq!(slot.take_error().as_deref(), Some("inotify watch failed"));
        assert!(slot.take_error().is_none());
    }

    #[tokio::test]
    async fn test_successful_run_leaves_no_error() {
        let slot = TaskSlot::new("connection");
        slot.spawn(async { Ok(()) });
        wait_stopped(&slot).await;
        assert!(slot.take_error().is_none());
    }

    #[tokio::test]
    async fn test_panicking_task_frees_the_slot() {
        let slot = TaskSlot::new("watcher");
        assert!(slot.spawn(async {
            tokio::task::yield_now().await;
            panic!("watch descriptor vanished")
        }));
        wait_stopped(&slot).await;

        let error = slot.take_error().unwrap();
        assert!(error.contains("watch descriptor vanished"), "{error}");
        assert!(slot.spawn(async { Ok(()) }));
        wait_stopped(&slot).await;
    }

    #[tokio::test]
    async fn test_stop_drops_what_the_task_owns() {
        let dir = tempfile::TempDir::new().unwrap();
        let coordinator = RestartCoordinator::new(dir.path());
        let guard = coordinator.guard(REQUEST_LOCK).unwrap();

        let slot = TaskSlot::new("connection");
        slot.spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
            Ok(())
        });
        assert!(coordinator.is_held(REQUEST_LOCK));

        slot.stop().await;
        assert!(!slot.is_running());
        assert!(!coordinator.is_held(REQUEST_LOCK));
        assert!(slot.take_error().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_shutdown(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(&mut rx))
            .await
            .unwrap();
    }
}
