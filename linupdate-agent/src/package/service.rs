//! Update workflow on top of a `PackageManager`
//!
//! Builds the plan, applies exclusions, requests a supervisor restart when
//! linupdate itself is updated, and produces the summary sent back to the
//! fleet server. Exclusions are always removed before returning.

use super::{PackageError, PackageManager, PlannedPackage, UpdateOptions, UpdateParams, UpdateReport};
use crate::config::ExcludeSection;
use crate::coordinator::RestartCoordinator;
use crate::status::ProgressHandle;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Package name of the agent itself.
pub const SELF_PACKAGE: &str = "linupdate";

pub const CRITICAL_ERROR: &str = "Critical error: package update failed";

/// Which packages an update request covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Packages(Vec<String>),
}

/// Compiled exclusion patterns, matched from the start of the package name.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    always: Vec<Regex>,
    on_major_update: Vec<Regex>,
}

impl Exclusions {
    pub fn from_config(section: &ExcludeSection) -> Result<Self, PackageError> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, PackageError> {
            patterns
                .iter()
                .filter(|pattern| !pattern.trim().is_empty())
                .map(|pattern| Regex::new(&format!("^(?:{})", pattern.trim())).map_err(PackageError::from))
                .collect()
        };
        Ok(Self {
            always: compile(&section.always)?,
            on_major_update: compile(&section.on_major_update)?,
        })
    }

    /// Whether `package` must be kept out of the update.
    pub fn excludes(&self, package: &PlannedPackage) -> bool {
        if self.always.iter().any(|re| re.is_match(&package.name)) {
            return true;
        }
        self.on_major_update.iter().any(|re| re.is_match(&package.name)) && is_major_update(package)
    }
}

fn major(version: &str) -> &str {
    version.split('.').next().unwrap_or_default()
}

fn is_major_update(package: &PlannedPackage) -> bool {
    major(&package.current_version) != major(&package.target_version)
}

/// Result of one update request.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub log: String,
    pub summary: Value,
    pub error: Option<String>,
}

impl UpdateOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct PackageService {
    manager: Arc<dyn PackageManager>,
    exclusions: Exclusions,
    exit_on_error: bool,
    coordinator: RestartCoordinator,
}

impl PackageService {
    pub fn new(
        manager: Arc<dyn PackageManager>,
        exclusions: Exclusions,
        exit_on_error: bool,
        coordinator: RestartCoordinator,
    ) -> Self {
        Self {
            manager,
            exclusions,
            exit_on_error,
            coordinator,
        }
    }

    pub fn manager(&self) -> &Arc<dyn PackageManager> {
        &self.manager
    }

    async fn plan_selected(&self, names: &[String]) -> Result<Vec<PlannedPackage>, PackageError> {
        let mut plan = Vec::new();
        for name in names {
            if !self.manager.is_installed(name).await? {
                plan.push(PlannedPackage {
                    name: name.clone(),
                    current_version: "-".into(),
                    target_version: "-".into(),
                    install: false,
                    decision: Some("Package is not installed".into()),
                });
                continue;
            }

            let current = self.manager.current_version(name).await?.unwrap_or_default();
            let target = self.manager.available_version(name).await?.unwrap_or_default();
            if current.is_empty() || target.is_empty() || current == target {
                continue;
            }

            plan.push(PlannedPackage {
                name: name.clone(),
                current_version: current,
                target_version: target,
                install: true,
                decision: None,
            });
        }
        Ok(plan)
    }

    async fn run(
        &self,
        selection: &Selection,
        params: &UpdateParams,
        progress: &ProgressHandle,
        log: &mut String,
        status: &mut &'static str,
    ) -> Result<Option<UpdateReport>, PackageError> {
        // Leftovers from an interrupted run
        self.manager.remove_all_exclusions().await?;

        progress.update("Building packages update list...");
        let mut plan = match selection {
            Selection::All => self
                .manager
                .available_packages(params.full_upgrade)
                .await?
                .into_iter()
                .map(PlannedPackage::from)
                .collect(),
            Selection::Packages(names) => self.plan_selected(names).await?,
        };

        if !params.ignore_exclusions {
            for package in plan.iter_mut().filter(|package| package.install) {
                if self.exclusions.excludes(package) {
                    self.manager.exclude(&package.name).await?;
                    package.install = false;
                    package.decision = Some("excluded".into());
                }
            }
        }

        let to_update = plan.iter().filter(|package| package.install).count();
        let ignored = plan.len() - to_update;
        let prefix = if params.dry_run { "(dry run) " } else { "" };
        log.push_str(&format!(
            "{prefix}{to_update} packages will be updated, {ignored} will be ignored\n"
        ));
        for package in &plan {
            log.push_str(&format!(
                "  {} {} -> {} {}\n",
                package.name,
                package.current_version,
                package.target_version,
                package.decision.as_deref().unwrap_or(if package.install { "ok" } else { "ignored" })
            ));
        }

        if to_update == 0 {
            log.push_str("No package updates\n");
            *status = "nothing-to-do";
            return Ok(None);
        }

        if !params.dry_run && plan.iter().any(|package| package.install && package.name == SELF_PACKAGE) {
            info!("linupdate is part of the update, requesting a service restart");
            if let Err(e) = self.coordinator.request_restart() {
                warn!("Could not create restart trigger: {}", e);
            }
        }

        let options = UpdateOptions {
            dry_run: params.dry_run,
            keep_config_files: params.keep_config_files,
            full_upgrade: params.full_upgrade,
            stop_on_error: self.exit_on_error,
        };
        let report = self.manager.update(&plan, &options, progress).await?;
        log.push_str(&report.log);
        *status = "done";
        Ok(Some(report))
    }

    /// Run one update request to completion; failures end up in the outcome.
    pub async fn update(&self, selection: &Selection, params: &UpdateParams, progress: &ProgressHandle) -> UpdateOutcome {
        let mut log = String::new();
        let mut status = "running";
        progress.update("Initialising updates...");

        let result = self.run(selection, params, progress, &mut log, &mut status).await;

        if let Err(e) = self.manager.remove_all_exclusions().await {
            warn!("Could not remove package exclusions: {}", e);
        }
        progress.clear();

        let (report, mut error) = match result {
            Ok(report) => (report.unwrap_or_default(), None),
            Err(e) => {
                error!("Packages update failed: {}", e);
                log.push_str(&format!("Packages update failed: {e}\n"));
                status = "failed";
                (UpdateReport::default(), Some(e.to_string()))
            }
        };

        let failed_count = report.failed.len();
        if self.exit_on_error && (failed_count > 0 || status == "failed") {
            error = Some(CRITICAL_ERROR.to_string());
        }

        log.push_str(&format!(
            "{} packages updated, {} packages failed\n",
            report.success.len(),
            failed_count
        ));

        let summary = json!({
            "update": {
                "status": status,
                "options": { "dry_run": params.dry_run },
                "success": {
                    "count": report.success.len(),
                    "packages": report.success,
                },
                "failed": {
                    "count": failed_count,
                    "packages": report.failed,
                },
            }
        });

        UpdateOutcome { log, summary, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planned(name: &str, current: &str, target: &str) -> PlannedPackage {
        PlannedPackage {
            name: name.into(),
            current_version: current.into(),
            target_version: target.into(),
            install: true,
            decision: None,
        }
    }

    #[test]
    fn test_exclusions() {
        let exclusions = Exclusions::from_config(&ExcludeSection {
            always: vec!["kernel.*".into()],
            on_major_update: vec!["php".into()],
        })
        .unwrap();

        assert!(exclusions.excludes(&planned("kernel-core", "5.14", "5.15")));
        assert!(!exclusions.excludes(&planned("linux-kernel", "1", "2")));
        assert!(exclusions.excludes(&planned("php", "7.4.3", "8.1.2")));
        assert!(!exclusions.excludes(&planned("php", "8.1.1", "8.1.2")));
        assert!(!exclusions.excludes(&planned("nginx", "1.18", "2.0")));
    }

    #[test]
    fn test_invalid_pattern() {
        let err = Exclusions::from_config(&ExcludeSection {
            always: vec!["(".into()],
            on_major_update: vec![],
        })
        .unwrap_err();
        assert!(matches!(err, PackageError::Pattern(_)));
    }
}
