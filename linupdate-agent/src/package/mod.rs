//! Package manager contract and backends
//!
//! One `PackageManager` implementation per OS family (`Apt`, `Dnf`), selected
//! once at startup. `PackageService` runs the update workflow on top of it:
//! plan, exclusions, self-update trigger, summary.

pub mod apt;
pub mod dnf;
pub mod service;

pub use apt::Apt;
pub use dnf::Dnf;
pub use service::{Exclusions, PackageService, Selection, UpdateOutcome};

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::config::Timings;
use crate::status::ProgressHandle;
use crate::system::OsFamily;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("{command} failed: {detail}")]
    Failed { command: String, detail: String },
    #[error("could not parse {what}: {detail}")]
    Parse { what: String, detail: String },
    #[error("invalid exclusion pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("timed out after {0:?} waiting for the package manager lock")]
    LockTimeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PackageError {
    pub(crate) fn parse(what: impl Into<String>, detail: impl Into<String>) -> Self {
        PackageError::Parse {
            what: what.into(),
            detail: detail.into(),
        }
    }
}

/// Run a command and turn a non-zero exit into `PackageError::Failed`.
pub(crate) async fn checked(runner: CommandRunner) -> Result<CommandOutput, PackageError> {
    let output = runner.run().await?;
    if output.success {
        Ok(output)
    } else {
        Err(PackageError::Failed {
            command: runner.display(),
            detail: output.stderr.trim().to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailablePackage {
    pub name: String,
    pub current_version: String,
    pub available_version: String,
    pub repository: Option<String>,
}

/// One line of an update plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedPackage {
    pub name: String,
    pub current_version: String,
    pub target_version: String,
    pub install: bool,
    pub decision: Option<String>,
}

impl From<AvailablePackage> for PlannedPackage {
    fn from(package: AvailablePackage) -> Self {
        PlannedPackage {
            name: package.name,
            current_version: package.current_version,
            target_version: package.available_version,
            install: true,
            decision: None,
        }
    }
}

/// Parameters carried by an update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateParams {
    pub dry_run: bool,
    pub ignore_exclusions: bool,
    pub keep_config_files: bool,
    pub full_upgrade: bool,
}

impl Default for UpdateParams {
    fn default() -> Self {
        Self {
            dry_run: false,
            ignore_exclusions: false,
            keep_config_files: true,
            full_upgrade: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateOptions {
    pub dry_run: bool,
    pub keep_config_files: bool,
    pub full_upgrade: bool,
    /// Stop at the first failed package.
    pub stop_on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PackageResult {
    pub version: String,
    pub log: String,
}

/// What a backend did with an update plan.
#[derive(Debug, Clone, Default)]
pub struct UpdateReport {
    pub log: String,
    pub success: BTreeMap<String, PackageResult>,
    pub failed: BTreeMap<String, PackageResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOrder {
    Oldest,
    Newest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPackage {
    pub name: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
}

/// One package manager transaction, as sent to the fleet server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HistoryEvent {
    pub date_start: String,
    pub time_start: String,
    pub date_end: String,
    pub time_end: String,
    pub command: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub installed: Vec<HistoryPackage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dep_installed: Vec<HistoryPackage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub upgraded: Vec<HistoryPackage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<HistoryPackage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub purged: Vec<HistoryPackage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub downgraded: Vec<HistoryPackage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reinstalled: Vec<HistoryPackage>,
}

#[async_trait]
pub trait PackageManager: Send + Sync {
    fn family(&self) -> OsFamily;

    async fn installed_packages(&self) -> Result<Vec<InstalledPackage>, PackageError>;

    async fn available_packages(&self, dist_upgrade: bool) -> Result<Vec<AvailablePackage>, PackageError>;

    async fn is_installed(&self, name: &str) -> Result<bool, PackageError>;

    async fn current_version(&self, name: &str) -> Result<Option<String>, PackageError>;

    async fn available_version(&self, name: &str) -> Result<Option<String>, PackageError>;

    /// Keep `name` out of the next update.
    async fn exclude(&self, name: &str) -> Result<(), PackageError>;

    async fn remove_all_exclusions(&self) -> Result<(), PackageError>;

    /// Install the plan lines marked `install`, waiting for the package manager lock first.
    async fn update(
        &self,
        plan: &[PlannedPackage],
        options: &UpdateOptions,
        progress: &ProgressHandle,
    ) -> Result<UpdateReport, PackageError>;

    /// History entries (log files or transaction ids) in the given order.
    async fn history(&self, order: HistoryOrder) -> Result<Vec<String>, PackageError>;

    async fn parse_history(&self, entries: &[String], limit: usize) -> Result<Vec<HistoryEvent>, PackageError>;
}

/// Backend for the detected OS family.
pub fn select(family: OsFamily, timings: &Timings) -> Arc<dyn PackageManager> {
    match family {
        OsFamily::Debian => Arc::new(Apt::new(timings)),
        OsFamily::Redhat => Arc::new(Dnf::new(timings)),
    }
}

/// Poll `is_locked` until it reports free, reporting progress periodically.
pub(crate) async fn wait_for_lock<F, Fut>(
    mut is_locked: F,
    max_wait: Duration,
    report_every: Duration,
    progress: &ProgressHandle,
) -> Result<(), PackageError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let poll = Duration::from_secs(2).min(report_every);
    let start = tokio::time::Instant::now();
    let mut last_report: Option<tokio::time::Instant> = None;

    while is_locked().await {
        let waited = start.elapsed();
        if waited >= max_wait {
            progress.restore();
            return Err(PackageError::LockTimeout(max_wait));
        }
        if last_report.map_or(true, |at| at.elapsed() >= report_every) {
            if last_report.is_none() {
                progress.save();
            }
            progress.update(format!(
                "Waiting for the package manager lock to be released ({}s)",
                waited.as_secs()
            ));
            tracing::info!("Package manager is locked, waiting... ({}s elapsed)", waited.as_secs());
            last_report = Some(tokio::time::Instant::now());
        }
        tokio::time::sleep(poll).await;
    }

    if last_report.is_some() {
        progress.restore();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_lock_reports_then_returns() {
        let progress = ProgressHandle::new();
        progress.update("Updating");
        let polls = Arc::new(AtomicU32::new(0));

        let counter = polls.clone();
        wait_for_lock(
            move || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) < 3 }
            },
            Duration::from_secs(60),
            Duration::from_secs(30),
            &progress,
        )
        .await
        .unwrap();

        assert_eq!(polls.load(Ordering::SeqCst), 4);
        assert_eq!(progress.current().as_deref(), Some("Updating"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_lock_times_out() {
        let progress = ProgressHandle::new();
        let err = wait_for_lock(|| async { true }, Duration::from_secs(10), Duration::from_secs(30), &progress)
            .await
            .unwrap_err();
        assert!(matches!(err, PackageError::LockTimeout(_)));
    }

    #[test]
    fn test_history_event_serialization_skips_empty_lists() {
        let event = HistoryEvent {
            date_start: "2024-05-01".into(),
            time_start: "10:00:00".into(),
            command: "apt-get install nginx".into(),
            installed: vec![HistoryPackage {
                name: "nginx".into(),
                version: "1.24.0".into(),
                repo: None,
            }],
            ..Default::default()
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["installed"][0]["name"], "nginx");
        assert!(value.get("removed").is_none());
        assert!(value["installed"][0].get("repo").is_none());
    }
}
