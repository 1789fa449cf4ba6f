//! Package manager log watcher
//!
//! Watches the native package manager log for completed writes (a manual
//! `apt` or `dnf` run) and pushes the package history to the fleet server.
//! Events closer together than the debounce window are ignored. The watch
//! follows the inode, so a rotated or deleted log ends the watcher with an
//! error and the agent exits to be restarted on the new file.

use crate::reporter::StatusPush;
use anyhow::{Context, Result};
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info};

/// Drops events that follow the previous accepted one within `window`.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    last: Option<Instant>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    pub fn should_fire(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last {
            if now.saturating_duration_since(last) < self.window {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

pub fn is_write_completed(event: &Event) -> bool {
    matches!(event.kind, EventKind::Access(AccessKind::Close(AccessMode::Write)))
}

/// The watched path no longer points at the watched file (rotation, deletion).
pub fn is_file_replaced(event: &Event) -> bool {
    matches!(event.kind, EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)))
}

pub struct LogWatcher {
    log_file: PathBuf,
    reporter: Arc<dyn StatusPush>,
    debouncer: Debouncer,
    settle: Option<Duration>,
}

impl LogWatcher {
    /// `dnf_settle` only applies when watching `dnf.log`, which dnf also writes
    /// when the agent itself reads the history.
    pub fn new(log_file: &Path, reporter: Arc<dyn StatusPush>, debounce: Duration, dnf_settle: Duration) -> Self {
        let settle = (log_file.file_name().and_then(|name| name.to_str()) == Some("dnf.log")).then_some(dnf_settle);
        Self {
            log_file: log_file.to_path_buf(),
            reporter,
            debouncer: Debouncer::new(debounce),
            settle,
        }
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Watch until the underlying watcher fails or the log file is replaced.
    pub async fn run(mut self) -> Result<()> {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = event_tx.send(res);
            },
            Config::default(),
        )
        .context("failed to create package log watcher")?;

        watcher
            .watch(&self.log_file, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", self.log_file.display()))?;

        info!("Starting package event monitoring from {}", self.log_file.display());

        while let Some(res) = event_rx.recv().await {
            let event = res.context("package event monitoring failed")?;
            if is_file_replaced(&event) {
                anyhow::bail!("{} was moved or removed", self.log_file.display());
            }
            if !is_write_completed(&event) || !self.debouncer.should_fire(Instant::now()) {
                continue;
            }
            self.on_change().await;
        }

        anyhow::bail!("package event monitoring stopped unexpectedly")
    }

    async fn on_change(&self) {
        if let Some(settle) = self.settle {
            tokio::time::sleep(settle).await;
        }

        info!(
            "New event has been detected in {} - sending history to the reposerver",
            self.log_file.display()
        );
        if let Err(e) = self.reporter.send_packages_history().await {
            error!("Could not send packages history: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{DataChange, RemoveKind, RenameMode};

    #[test]
    fn test_debouncer_window() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_secs(120));

        assert!(debouncer.should_fire(start));
        assert!(!debouncer.should_fire(start + Duration::from_secs(60)));
        assert!(!debouncer.should_fire(start + Duration::from_secs(119)));
        assert!(debouncer.should_fire(start + Duration::from_secs(120)));
        assert!(!debouncer.should_fire(start + Duration::from_secs(200)));
    }

    #[test]
    fn test_only_close_write_counts() {
        let close_write = Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write)));
        let modify = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)));
        let close_read = Event::new(EventKind::Access(AccessKind::Close(AccessMode::Read)));

        assert!(is_write_completed(&close_write));
        assert!(!is_write_completed(&modify));
        assert!(!is_write_completed(&close_read));
    }

    #[test]
    fn test_rotation_and_deletion_replace_the_file() {
        let moved = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)));
        let removed = Event::new(EventKind::Remove(RemoveKind::File));
        let written = Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)));
        let closed = Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write)));

        assert!(is_file_replaced(&moved));
        assert!(is_file_replaced(&removed));
        assert!(!is_file_replaced(&written));
        assert!(!is_file_replaced(&closed));
    }

    struct NoopPush;

    #[async_trait::async_trait]
    impl StatusPush for NoopPush {
        async fn send_general_info(&self) -> Result<()> {
            Ok(())
        }
        async fn send_packages_info(&self) -> Result<()> {
            Ok(())
        }
        async fn send_packages_history(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_settle_only_for_dnf() {
        let push: Arc<dyn StatusPush> = Arc::new(NoopPush);
        let dnf = LogWatcher::new(
            Path::new("/var/log/dnf.log"),
            push.clone(),
            Duration::from_secs(120),
            Duration::from_secs(15),
        );
        assert_eq!(dnf.settle, Some(Duration::from_secs(15)));

        let apt = LogWatcher::new(
            Path::new("/var/log/apt/history.log"),
            push,
            Duration::from_secs(120),
            Duration::from_secs(15),
        );
        assert_eq!(apt.settle, None);
    }

    #[tokio::test]
    async fn test_missing_log_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let watcher = LogWatcher::new(
            &dir.path().join("missing.log"),
            Arc::new(NoopPush),
            Duration::from_secs(120),
            Duration::from_secs(15),
        );
        assert!(watcher.run().await.is_err());
    }
}
