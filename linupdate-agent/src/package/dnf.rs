//! Redhat family backend (dnf / rpm)
//!
//! Exclusions are kept in memory and passed as `--exclude` to each update
//! command instead of editing `/etc/dnf/dnf.conf`.

use super::{
    checked, wait_for_lock, AvailablePackage, HistoryEvent, HistoryOrder, HistoryPackage, InstalledPackage,
    PackageError, PackageManager, PackageResult, PlannedPackage, UpdateOptions, UpdateReport,
};
use crate::command::CommandRunner;
use crate::config::Timings;
use crate::status::ProgressHandle;
use crate::system::OsFamily;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use regex::Regex;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{info, warn};

const DNF_PID: &str = "/var/run/dnf.pid";
const VERSION_FORMAT: &str = "--qf=%{version}-%{release}.%{arch}";

static ALTERED_PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s+(Install|Dep-Install|Upgrade|Upgraded|Obsoleting|Obsoleted|Erase|Removed|Downgrade|Downgraded|Reinstall|Reinstalled)\s+(\S+)(?:\s+(\S+))?")
        .expect("Invalid dnf history regex")
});

static VERSION_START: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"-[0-9]").expect("Invalid version regex"));

pub struct Dnf {
    lock_wait: Duration,
    lock_report: Duration,
    excluded: Mutex<Vec<String>>,
}

impl Dnf {
    pub fn new(timings: &Timings) -> Self {
        Self {
            lock_wait: timings.package_lock_wait,
            lock_report: timings.package_lock_report,
            excluded: Mutex::new(Vec::new()),
        }
    }

    async fn dnf_locked() -> bool {
        Path::new(DNF_PID).exists()
    }

    fn update_command(&self, package: &PlannedPackage, options: &UpdateOptions) -> CommandRunner {
        let mut command = CommandRunner::new("dnf").args([
            "update".to_string(),
            format!("{}-{}", package.name, package.target_version),
            "-y".to_string(),
        ]);
        for excluded in self.excluded.lock().iter() {
            command = command.arg(format!("--exclude={excluded}"));
        }
        if options.dry_run {
            command = command.arg("--setopt=tsflags=test");
        }
        command
    }

    fn first_line(stdout: &str) -> Option<String> {
        stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
    }
}

#[async_trait]
impl PackageManager for Dnf {
    fn family(&self) -> OsFamily {
        OsFamily::Redhat
    }

    async fn installed_packages(&self) -> Result<Vec<InstalledPackage>, PackageError> {
        let output = checked(CommandRunner::new("dnf").args([
            "repoquery",
            "--installed",
            "-a",
            "--qf=%{name} %{epoch}:%{version}-%{release}.%{arch}",
        ]))
        .await?;

        let mut packages: Vec<InstalledPackage> = output
            .stdout
            .lines()
            .filter_map(|line| line.trim().split_once(' '))
            .map(|(name, version)| InstalledPackage {
                name: name.to_string(),
                version: version.trim_start_matches("0:").to_string(),
            })
            .collect();
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(packages)
    }

    async fn available_packages(&self, _dist_upgrade: bool) -> Result<Vec<AvailablePackage>, PackageError> {
        let output = checked(CommandRunner::new("dnf").args([
            "repoquery",
            "--upgrades",
            "--latest-limit",
            "1",
            "-a",
            "--qf=%{name} %{version}-%{release}.%{arch} %{repoid}",
        ]))
        .await?;

        let mut packages = Vec::new();
        for line in output.stdout.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [name, available, repository] = fields[..] else {
                continue;
            };
            let current = CommandRunner::new("rpm")
                .args(["-q", VERSION_FORMAT, name])
                .run()
                .await?;
            packages.push(AvailablePackage {
                name: name.to_string(),
                current_version: Self::first_line(&current.stdout).unwrap_or_default(),
                available_version: available.to_string(),
                repository: Some(repository.to_string()),
            });
        }
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(packages)
    }

    async fn is_installed(&self, name: &str) -> Result<bool, PackageError> {
        Ok(CommandRunner::new("rpm").args(["-q", name]).run().await?.success)
    }

    async fn current_version(&self, name: &str) -> Result<Option<String>, PackageError> {
        let output = checked(CommandRunner::new("dnf").args(["repoquery", "--installed", VERSION_FORMAT, name])).await?;
        Ok(Self::first_line(&output.stdout))
    }

    async fn available_version(&self, name: &str) -> Result<Option<String>, PackageError> {
        let output = checked(CommandRunner::new("dnf").args([
            "repoquery",
            "--upgrades",
            "--latest-limit",
            "1",
            VERSION_FORMAT,
            name,
        ]))
        .await?;
        Ok(Self::first_line(&output.stdout))
    }

    async fn exclude(&self, name: &str) -> Result<(), PackageError> {
        let mut excluded = self.excluded.lock();
        if !excluded.iter().any(|package| package == name) {
            excluded.push(name.to_string());
        }
        Ok(())
    }

    async fn remove_all_exclusions(&self) -> Result<(), PackageError> {
        self.excluded.lock().clear();
        Ok(())
    }

    async fn update(
        &self,
        plan: &[PlannedPackage],
        options: &UpdateOptions,
        progress: &ProgressHandle,
    ) -> Result<UpdateReport, PackageError> {
        wait_for_lock(Self::dnf_locked, self.lock_wait, self.lock_report, progress).await?;

        let mut report = UpdateReport::default();
        let to_install: Vec<&PlannedPackage> = plan.iter().filter(|package| package.install).collect();

        for (index, package) in to_install.iter().enumerate() {
            progress.update(format!("Updating {} ({}/{})", package.name, index + 1, to_install.len()));
            report.log.push_str(&format!(
                "Updating {} ({} -> {}):\n",
                package.name, package.current_version, package.target_version
            ));

            if !options.dry_run && self.current_version(&package.name).await?.as_deref() == Some(package.target_version.as_str()) {
                report.log.push_str(&format!("{} is already up to date\n", package.name));
                report.success.insert(
                    package.name.clone(),
                    PackageResult {
                        version: package.target_version.clone(),
                        log: String::new(),
                    },
                );
                continue;
            }

            let output = self.update_command(package, options).run().await?;
            let log = output.combined();
            report.log.push_str(&log);
            let result = PackageResult {
                version: package.target_version.clone(),
                log,
            };

            if output.success {
                info!("{} updated successfully", package.name);
                report.success.insert(package.name.clone(), result);
            } else {
                warn!("Error while updating {}", package.name);
                report.log.push_str(&format!("Error while updating {}\n", package.name));
                report.failed.insert(package.name.clone(), result);
                if options.stop_on_error {
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn history(&self, order: HistoryOrder) -> Result<Vec<String>, PackageError> {
        let output = checked(CommandRunner::new("dnf").args(["history", "list"])).await?;
        let mut ids = parse_history_list(&output.stdout);
        if order == HistoryOrder::Oldest {
            ids.reverse();
        }
        Ok(ids)
    }

    async fn parse_history(&self, entries: &[String], limit: usize) -> Result<Vec<HistoryEvent>, PackageError> {
        let mut events = Vec::new();
        for id in entries {
            if events.len() >= limit {
                break;
            }
            if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            let output = checked(
                CommandRunner::new("dnf")
                    .args(["history", "info", id.as_str()])
                    .env("LC_ALL", "en_US.UTF-8"),
            )
            .await?;
            events.push(parse_history_info(id, &output.stdout)?);
        }
        Ok(events)
    }
}

/// Transaction ids of `dnf history list`, newest first.
fn parse_history_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|id| id.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
        .collect()
}

fn parse_begin_time(value: &str) -> (String, String) {
    const FORMATS: &[&str] = &["%a %d %b %Y %I:%M:%S %p", "%a %d %b %Y %H:%M:%S", "%a %b %d %H:%M:%S %Y"];
    let tokens: Vec<&str> = value.split_whitespace().collect();

    // Trailing timezone names are not parseable, retry without them
    for end in (1..=tokens.len()).rev() {
        let candidate = tokens[..end].join(" ");
        for format in FORMATS {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(&candidate, format) {
                return (
                    parsed.format("%Y-%m-%d").to_string(),
                    parsed.format("%H:%M:%S").to_string(),
                );
            }
        }
    }
    (value.to_string(), String::new())
}

/// Parse the output of `dnf history info <id>`.
pub fn parse_history_info(id: &str, content: &str) -> Result<HistoryEvent, PackageError> {
    let content = content.replace("**", "");
    let what = format!("dnf event id #{id}");

    let field = |name: &str| {
        content.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            (key.trim() == name).then(|| value.trim().to_string())
        })
    };

    let begin = field("Begin time").ok_or_else(|| PackageError::parse(&what, "could not retrieve event date and time"))?;
    let command = field("Command Line").ok_or_else(|| PackageError::parse(&what, "could not retrieve command line"))?;
    let altered = content
        .split_once("Packages Altered")
        .map(|(_, rest)| rest)
        .ok_or_else(|| PackageError::parse(&what, "could not find any packages altered in the event"))?;

    let (date_start, time_start) = parse_begin_time(&begin);
    let mut event = HistoryEvent {
        date_start,
        time_start,
        command,
        ..Default::default()
    };

    let mut found = false;

    for line in altered.lines() {
        let Some(caps) = ALTERED_PACKAGE.captures(line) else {
            continue;
        };
        found = true;
        let package_and_version = &caps[2];
        if package_and_version.starts_with('@') {
            continue;
        }
        let Some(split) = VERSION_START.find(package_and_version) else {
            return Err(PackageError::parse(&what, format!("cannot retrieve package version for line: {line}")));
        };
        let name = package_and_version[..split.start()].to_string();
        let version = package_and_version[split.start() + 1..].to_string();
        let repo = caps.get(3).map(|repo| repo.as_str().to_string());

        let package = HistoryPackage { name, version, repo };
        match &caps[1] {
            "Install" => event.installed.push(package),
            "Dep-Install" => event.dep_installed.push(package),
            "Upgrade" => event.upgraded.push(package),
            "Removed" | "Erase" => event.removed.push(HistoryPackage { repo: None, ..package }),
            "Downgrade" => event.downgraded.push(HistoryPackage { repo: None, ..package }),
            "Reinstall" => event.reinstalled.push(package),
            _ => {}
        }
    }

    if !found {
        return Err(PackageError::parse(&what, "could not find any operation lines in the event"));
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    const INFO: &str = "\
Transaction ID : 12
Begin time     : Wed 01 May 2024 10:00:00 AM UTC
Begin rpmdb    : 1a2b3c
End time       : Wed 01 May 2024 10:00:09 AM UTC (9 seconds)
User           : root <root>
Return-Code    : Success
Command Line   : update nginx -y
Packages Altered:
    Upgrade  nginx-1:1.20.1-14.el9.x86_64             @appstream
    Upgraded nginx-1:1.20.1-13.el9.x86_64             @@System
    Dep-Install nginx-filesystem-1:1.20.1-14.el9.noarch @appstream
    Removed  telnet-1:0.17-85.el9.x86_64              @@System
";

    #[test]
    fn test_parse_history_info() {
        let event = parse_history_info("12", INFO).unwrap();
        assert_eq!(event.date_start, "2024-05-01");
        assert_eq!(event.time_start, "10:00:00");
        assert_eq!(event.command, "update nginx -y");

        assert_eq!(event.upgraded.len(), 1);
        assert_eq!(event.upgraded[0].name, "nginx");
        assert_eq!(event.upgraded[0].version, "1:1.20.1-14.el9.x86_64");
        assert_eq!(event.upgraded[0].repo.as_deref(), Some("@appstream"));
        assert_eq!(event.dep_installed[0].name, "nginx-filesystem");
        assert_eq!(event.removed[0].name, "telnet");
        assert!(event.removed[0].repo.is_none());
    }

    #[test]
    fn test_parse_history_info_without_packages() {
        let err = parse_history_info("3", "Begin time : Wed 01 May 2024 10:00:00 AM\nCommand Line : list\n").unwrap_err();
        assert!(err.to_string().contains("packages altered"));
    }

    #[test]
    fn test_parse_history_list() {
        let stdout = "\
ID     | Command line             | Date and time    | Action(s)      | Altered
-------------------------------------------------------------------------------
    12 | update nginx -y          | 2024-05-01 10:00 | Upgrade        |    2
    11 | install telnet           | 2024-04-30 09:00 | Install        |    1
";
        assert_eq!(parse_history_list(stdout), vec!["12", "11"]);
    }

    #[test]
    fn test_update_command_carries_exclusions() {
        let dnf = Dnf::new(&Timings::default());
        futures::executor::block_on(dnf.exclude("kernel")).unwrap();
        let package = PlannedPackage {
            name: "nginx".into(),
            current_version: "1.20.1-13.el9.x86_64".into(),
            target_version: "1.20.1-14.el9.x86_64".into(),
            install: true,
            decision: None,
        };
        let options = UpdateOptions {
            dry_run: true,
            keep_config_files: true,
            full_upgrade: false,
            stop_on_error: true,
        };
        assert_eq!(
            dnf.update_command(&package, &options).display(),
            "dnf update nginx-1.20.1-14.el9.x86_64 -y --exclude=kernel --setopt=tsflags=test"
        );

        futures::executor::block_on(dnf.remove_all_exclusions()).unwrap();
        assert!(dnf.excluded.lock().is_empty());
    }
}
