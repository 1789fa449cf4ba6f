/*!
Mock package manager and status reporter

`MockPackageManager` keeps an in-memory package database and records every
update plan it receives. `MockReporter` counts status pushes and can be
told to fail.
*/

use async_trait::async_trait;
use linupdate_agent::ledger::{RequestLedger, RequestStatus};
use linupdate_agent::package::{
    AvailablePackage, HistoryEvent, HistoryOrder, InstalledPackage, PackageError, PackageManager, PackageResult,
    PlannedPackage, UpdateOptions, UpdateReport,
};
use linupdate_agent::reporter::StatusPush;
use linupdate_agent::status::ProgressHandle;
use linupdate_agent::system::OsFamily;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One call to `PackageManager::update`.
#[derive(Debug, Clone)]
pub struct UpdateCall {
    pub plan: Vec<PlannedPackage>,
    pub options: UpdateOptions,
    /// Ledger statuses at the time of the call, when a ledger is attached.
    pub ledger_statuses: BTreeMap<String, Option<RequestStatus>>,
}

#[derive(Default)]
struct PackageDb {
    installed: BTreeMap<String, String>,
    available: BTreeMap<String, String>,
    failing: BTreeSet<String>,
    broken: Option<String>,
    excluded: Vec<String>,
    updates: Vec<UpdateCall>,
    ledger: Option<RequestLedger>,
}

pub struct MockPackageManager {
    family: OsFamily,
    db: Mutex<PackageDb>,
}

impl Default for MockPackageManager {
    fn default() -> Self {
        Self::new(OsFamily::Debian)
    }
}

impl MockPackageManager {
    pub fn new(family: OsFamily) -> Self {
        Self {
            family,
            db: Mutex::new(PackageDb::default()),
        }
    }

    pub fn installed(self, name: &str, version: &str) -> Self {
        self.db.lock().installed.insert(name.to_string(), version.to_string());
        self
    }

    /// Installed package with a newer version available.
    pub fn upgradable(self, name: &str, current: &str, available: &str) -> Self {
        {
            let mut db = self.db.lock();
            db.installed.insert(name.to_string(), current.to_string());
            db.available.insert(name.to_string(), available.to_string());
        }
        self
    }

    /// The backend reports this package as failed.
    pub fn failing(self, name: &str) -> Self {
        self.db.lock().failing.insert(name.to_string());
        self
    }

    /// Every update call fails with `message`.
    pub fn broken(self, message: &str) -> Self {
        self.db.lock().broken = Some(message.to_string());
        self
    }

    pub fn with_ledger_snapshot(self, ledger: RequestLedger) -> Self {
        self.db.lock().ledger = Some(ledger);
        self
    }

    pub fn update_calls(&self) -> Vec<UpdateCall> {
        self.db.lock().updates.clone()
    }

    /// Exclusions currently applied.
    pub fn excluded(&self) -> Vec<String> {
        self.db.lock().excluded.clone()
    }
}

#[async_trait]
impl PackageManager for MockPackageManager {
    fn family(&self) -> OsFamily {
        self.family
    }

    async fn installed_packages(&self) -> Result<Vec<InstalledPackage>, PackageError> {
        Ok(self
            .db
            .lock()
            .installed
            .iter()
            .map(|(name, version)| InstalledPackage {
                name: name.clone(),
                version: version.clone(),
            })
            .collect())
    }

    async fn available_packages(&self, _dist_upgrade: bool) -> Result<Vec<AvailablePackage>, PackageError> {
        let db = self.db.lock();
        Ok(db
            .available
            .iter()
            .map(|(name, available)| AvailablePackage {
                name: name.clone(),
                current_version: db.installed.get(name).cloned().unwrap_or_default(),
                available_version: available.clone(),
                repository: None,
            })
            .collect())
    }

    async fn is_installed(&self, name: &str) -> Result<bool, PackageError> {
        Ok(self.db.lock().installed.contains_key(name))
    }

    async fn current_version(&self, name: &str) -> Result<Option<String>, PackageError> {
        Ok(self.db.lock().installed.get(name).cloned())
    }

    async fn available_version(&self, name: &str) -> Result<Option<String>, PackageError> {
        let db = self.db.lock();
        Ok(db.available.get(name).or_else(|| db.installed.get(name)).cloned())
    }

    async fn exclude(&self, name: &str) -> Result<(), PackageError> {
        self.db.lock().excluded.push(name.to_string());
        Ok(())
    }

    async fn remove_all_exclusions(&self) -> Result<(), PackageError> {
        self.db.lock().excluded.clear();
        Ok(())
    }

    async fn update(
        &self,
        plan: &[PlannedPackage],
        options: &UpdateOptions,
        progress: &ProgressHandle,
    ) -> Result<UpdateReport, PackageError> {
        let mut db = self.db.lock();

        let ledger_statuses = match &db.ledger {
            Some(ledger) => ledger
                .list()
                .unwrap_or_default()
                .into_iter()
                .map(|id| {
                    let status = ledger.read_all(&id).ok().and_then(|record| record.status);
                    (id, status)
                })
                .collect(),
            None => BTreeMap::new(),
        };
        db.updates.push(UpdateCall {
            plan: plan.to_vec(),
            options: options.clone(),
            ledger_statuses,
        });

        if let Some(message) = &db.broken {
            return Err(PackageError::Failed {
                command: "mock update".into(),
                detail: message.clone(),
            });
        }

        let mut report = UpdateReport::default();
        for package in plan.iter().filter(|package| package.install) {
            progress.update(format!("Updating {}", package.name));
            if db.failing.contains(&package.name) {
                report.log.push_str(&format!("E: could not update {}\n", package.name));
                report.failed.insert(
                    package.name.clone(),
                    PackageResult {
                        version: package.target_version.clone(),
                        log: "mock failure".into(),
                    },
                );
                if options.stop_on_error {
                    break;
                }
                continue;
            }

            report.log.push_str(&format!(
                "\u{1b}[32mSetting up {} ({})\u{1b}[0m\n",
                package.name, package.target_version
            ));
            if !options.dry_run {
                db.installed.insert(package.name.clone(), package.target_version.clone());
                db.available.remove(&package.name);
            }
            report.success.insert(
                package.name.clone(),
                PackageResult {
                    version: package.target_version.clone(),
                    log: String::new(),
                },
            );
        }
        Ok(report)
    }

    async fn history(&self, _order: HistoryOrder) -> Result<Vec<String>, PackageError> {
        Ok(Vec::new())
    }

    async fn parse_history(&self, _entries: &[String], _limit: usize) -> Result<Vec<HistoryEvent>, PackageError> {
        Ok(Vec::new())
    }
}

/// Counts status pushes; optionally fails them all.
#[derive(Default)]
pub struct MockReporter {
    general: AtomicUsize,
    packages: AtomicUsize,
    history: AtomicUsize,
    failing: AtomicBool,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn general_pushes(&self) -> usize {
        self.general.load(Ordering::SeqCst)
    }

    pub fn packages_pushes(&self) -> usize {
        self.packages.load(Ordering::SeqCst)
    }

    pub fn history_pushes(&self) -> usize {
        self.history.load(Ordering::SeqCst)
    }

    fn outcome(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("reposerver returned 503 Service Unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl StatusPush for MockReporter {
    async fn send_general_info(&self) -> anyhow::Result<()> {
        self.general.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }

    async fn send_packages_info(&self) -> anyhow::Result<()> {
        self.packages.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }

    async fn send_packages_history(&self) -> anyhow::Result<()> {
        self.history.fetch_add(1, Ordering::SeqCst);
        self.outcome()
    }
}
