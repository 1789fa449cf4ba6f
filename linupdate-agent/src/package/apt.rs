//! Debian family backend (dpkg / apt-get / apt-mark)

use super::{
    checked, wait_for_lock, AvailablePackage, HistoryEvent, HistoryOrder, HistoryPackage, InstalledPackage,
    PackageError, PackageManager, PackageResult, PlannedPackage, UpdateOptions, UpdateReport,
};
use crate::command::CommandRunner;
use crate::config::Timings;
use crate::status::ProgressHandle;
use crate::system::OsFamily;
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

const DPKG_LOCK: &str = "/var/lib/dpkg/lock-frontend";
const HISTORY_DIR: &str = "/var/log/apt";

// Inst libc6 [2.35-0ubuntu3.7] (2.35-0ubuntu3.8 Ubuntu:22.04/jammy-updates [amd64]) []
static INST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Inst (\S+) \[([^\]]+)\] \((\S+) ([^\[\)]*)").expect("Invalid apt simulation regex")
});

static HISTORY_ENTRY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([^\s,()]+) \(([^)]*)\)").expect("Invalid apt history regex"));

pub struct Apt {
    lock_wait: Duration,
    lock_report: Duration,
    history_dir: PathBuf,
}

impl Apt {
    pub fn new(timings: &Timings) -> Self {
        Self {
            lock_wait: timings.package_lock_wait,
            lock_report: timings.package_lock_report,
            history_dir: PathBuf::from(HISTORY_DIR),
        }
    }

    fn apt_get() -> CommandRunner {
        CommandRunner::new("apt-get").env("DEBIAN_FRONTEND", "noninteractive")
    }

    async fn dpkg_locked() -> bool {
        // fuser exits 0 when some process holds the file
        CommandRunner::new("fuser")
            .arg(DPKG_LOCK)
            .timeout(Duration::from_secs(10))
            .run()
            .await
            .map(|output| output.success)
            .unwrap_or(false)
    }

    fn install_command(package: &PlannedPackage, options: &UpdateOptions) -> CommandRunner {
        let mut command = Self::apt_get().args(["install", package.name.as_str(), "-y"]);
        if options.dry_run {
            command = command.arg("-s");
        }
        if options.keep_config_files {
            command = command.args([
                "-o",
                "Dpkg::Options::=--force-confdef",
                "-o",
                "Dpkg::Options::=--force-confold",
            ]);
        }
        command
    }
}

#[async_trait]
impl PackageManager for Apt {
    fn family(&self) -> OsFamily {
        OsFamily::Debian
    }

    async fn installed_packages(&self) -> Result<Vec<InstalledPackage>, PackageError> {
        let output = checked(
            CommandRunner::new("dpkg-query").args(["-W", "-f=${db:Status-Abbrev}|${Package}|${Version}\n"]),
        )
        .await?;
        Ok(parse_dpkg_query(&output.stdout))
    }

    async fn available_packages(&self, dist_upgrade: bool) -> Result<Vec<AvailablePackage>, PackageError> {
        let action = if dist_upgrade { "dist-upgrade" } else { "upgrade" };
        let output = checked(Self::apt_get().args(["-s", action])).await?;
        Ok(parse_simulation(&output.stdout))
    }

    async fn is_installed(&self, name: &str) -> Result<bool, PackageError> {
        let output = CommandRunner::new("dpkg-query")
            .args(["-W", "-f=${db:Status-Abbrev}", name])
            .run()
            .await?;
        Ok(output.success && output.stdout.starts_with("ii"))
    }

    async fn current_version(&self, name: &str) -> Result<Option<String>, PackageError> {
        let output = CommandRunner::new("dpkg-query")
            .args(["-W", "-f=${Version}", name])
            .run()
            .await?;
        let version = output.stdout.trim();
        Ok((output.success && !version.is_empty()).then(|| version.to_string()))
    }

    async fn available_version(&self, name: &str) -> Result<Option<String>, PackageError> {
        let output = checked(CommandRunner::new("apt-cache").args(["policy", name])).await?;
        Ok(output
            .stdout
            .lines()
            .find_map(|line| line.trim().strip_prefix("Candidate:"))
            .map(str::trim)
            .filter(|version| !version.is_empty() && *version != "(none)")
            .map(str::to_string))
    }

    async fn exclude(&self, name: &str) -> Result<(), PackageError> {
        checked(CommandRunner::new("apt-mark").args(["hold", name])).await?;
        Ok(())
    }

    async fn remove_all_exclusions(&self) -> Result<(), PackageError> {
        let held = checked(CommandRunner::new("apt-mark").arg("showhold")).await?;
        for package in held.stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
            checked(CommandRunner::new("apt-mark").args(["unhold", package])).await?;
        }
        Ok(())
    }

    async fn update(
        &self,
        plan: &[PlannedPackage],
        options: &UpdateOptions,
        progress: &ProgressHandle,
    ) -> Result<UpdateReport, PackageError> {
        wait_for_lock(Self::dpkg_locked, self.lock_wait, self.lock_report, progress).await?;

        let mut report = UpdateReport::default();
        let to_install: Vec<&PlannedPackage> = plan.iter().filter(|package| package.install).collect();

        for (index, package) in to_install.iter().enumerate() {
            progress.update(format!(
                "Updating {} ({}/{})",
                package.name,
                index + 1,
                to_install.len()
            ));
            report.log.push_str(&format!(
                "Updating {} ({} -> {}):\n",
                package.name, package.current_version, package.target_version
            ));

            // A previous package may have pulled this one in as a dependency
            if !options.dry_run {
                if let Some(current) = self.current_version(&package.name).await? {
                    if current == package.target_version {
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
                }
            }

            let output = Self::install_command(package, options).run().await?;
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
        let mut files = history_files(&self.history_dir)?;
        files.sort_by_key(|(_, modified)| *modified);
        if order == HistoryOrder::Newest {
            files.reverse();
        }
        Ok(files
            .into_iter()
            .map(|(path, _)| path.to_string_lossy().to_string())
            .collect())
    }

    async fn parse_history(&self, entries: &[String], limit: usize) -> Result<Vec<HistoryEvent>, PackageError> {
        let mut events = Vec::new();
        for entry in entries {
            if events.len() >= limit {
                break;
            }
            let content = tokio::fs::read_to_string(entry).await?;
            let remaining = limit - events.len();
            events.extend(parse_history_log(&content).into_iter().take(remaining));
        }
        Ok(events)
    }
}

/// Uncompressed `history.log*` files with their modification time.
fn history_files(dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>, PackageError> {
    let mut files = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("history.log") || name.ends_with(".gz") {
            continue;
        }
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            files.push((entry.path(), metadata.modified()?));
        }
    }
    Ok(files)
}

fn parse_dpkg_query(stdout: &str) -> Vec<InstalledPackage> {
    let mut packages: Vec<InstalledPackage> = stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '|');
            let status = parts.next()?;
            let name = parts.next()?;
            let version = parts.next()?;
            status.starts_with("ii").then(|| InstalledPackage {
                name: name.to_string(),
                version: version.to_string(),
            })
        })
        .collect();
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    packages
}

/// Parse the `Inst` lines of `apt-get -s upgrade`.
fn parse_simulation(stdout: &str) -> Vec<AvailablePackage> {
    let mut packages: Vec<AvailablePackage> = stdout
        .lines()
        .filter_map(|line| INST_LINE.captures(line))
        .map(|caps| AvailablePackage {
            name: caps[1].to_string(),
            current_version: caps[2].to_string(),
            available_version: caps[3].to_string(),
            repository: Some(caps[4].trim().to_string()).filter(|repo| !repo.is_empty()),
        })
        .collect();
    packages.sort_by(|a, b| a.name.cmp(&b.name));
    packages
}

/// Split `name:arch (v1, v2), other:arch (v1)` into packages.
fn parse_packages_line(line: &str, upgrade_like: bool) -> Vec<HistoryPackage> {
    HISTORY_ENTRY
        .captures_iter(line)
        .filter_map(|caps| {
            let name = caps[1].split(':').next().unwrap_or_default().to_string();
            let versions: Vec<&str> = caps[2].split(',').map(str::trim).collect();
            let version = if upgrade_like { versions.get(1) } else { versions.first() }?;
            (!name.is_empty()).then(|| HistoryPackage {
                name,
                version: version.to_string(),
                repo: None,
            })
        })
        .collect()
}

fn split_date_time(value: &str) -> (String, String) {
    let mut parts = value.split_whitespace();
    (
        parts.next().unwrap_or_default().to_string(),
        parts.next().unwrap_or_default().to_string(),
    )
}

/// Parse an apt `history.log`; incomplete blocks are skipped.
pub fn parse_history_log(content: &str) -> Vec<HistoryEvent> {
    let mut events = Vec::new();

    for block in content.split("\n\n") {
        let mut event = HistoryEvent::default();
        let (mut started, mut ended, mut has_command) = (false, false, false);

        for line in block.lines() {
            let Some((key, value)) = line.split_once(": ") else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "Start-Date" => {
                    (event.date_start, event.time_start) = split_date_time(value);
                    started = true;
                }
                "End-Date" => {
                    (event.date_end, event.time_end) = split_date_time(value);
                    ended = true;
                }
                "Commandline" => {
                    event.command = value.to_string();
                    has_command = true;
                }
                "Install" => event.installed = parse_packages_line(value, false),
                "Upgrade" => event.upgraded = parse_packages_line(value, true),
                "Remove" => event.removed = parse_packages_line(value, false),
                "Purge" => event.purged = parse_packages_line(value, false),
                "Downgrade" => event.downgraded = parse_packages_line(value, true),
                "Reinstall" => event.reinstalled = parse_packages_line(value, false),
                _ => {}
            }
        }

        if started && ended && has_command {
            events.push(event);
        }
    }

    events
}
