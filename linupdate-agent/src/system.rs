//! Host identification for linupdate agents
//!
//! This module handles:
//! - OS family detection from `/etc/os-release` (selects the package backend)
//! - General host facts pushed to the fleet server (hostname, OS, kernel,
//!   virtualization, reboot state, service state)
//! - Locating the package manager log file watched by the agent

use crate::command::CommandRunner;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const OS_RELEASE: &str = "/etc/os-release";

/// Package manager log files, in lookup order.
pub const PACKAGE_LOG_FILES: &[&str] = &["/var/log/yum.log", "/var/log/dnf.log", "/var/log/apt/history.log"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OsFamily {
    Debian,
    Redhat,
}

impl OsFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Debian => "Debian",
            OsFamily::Redhat => "Redhat",
        }
    }

    pub fn detect() -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(OS_RELEASE)
            .map_err(|e| anyhow::anyhow!("could not read {}: {}", OS_RELEASE, e))?;
        Self::from_os_release(&content)
            .ok_or_else(|| anyhow::anyhow!("this program does not support your Linux distribution yet"))
    }

    /// Map `ID` and `ID_LIKE` entries of an os-release file to a family.
    pub fn from_os_release(content: &str) -> Option<Self> {
        let mut ids = Vec::new();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key.trim() == "ID" || key.trim() == "ID_LIKE" {
                let value = value.trim().trim_matches('"').trim_matches('\'').to_lowercase();
                ids.extend(value.split_whitespace().map(str::to_string));
            }
        }

        for id in &ids {
            match id.as_str() {
                "debian" | "ubuntu" | "kubuntu" | "xubuntu" | "linuxmint" => return Some(OsFamily::Debian),
                "rhel" | "centos" | "fedora" | "almalinux" | "rocky" | "ol" => return Some(OsFamily::Redhat),
                _ => {}
            }
        }
        None
    }
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// General host information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os_family: OsFamily,
    pub os: String,
    pub os_version: String,
    pub virtualization: String,
    pub kernel: String,
    pub arch: String,
    pub reboot_required: bool,
    pub agent_status: String,
}

impl SystemInfo {
    pub async fn gather(os_family: OsFamily) -> Self {
        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let os = sysinfo::System::name().unwrap_or_else(|| "unknown".into());
        let os_version = sysinfo::System::os_version().unwrap_or_default();
        let kernel = sysinfo::System::kernel_version().unwrap_or_default();
        let arch = std::env::consts::ARCH.to_string();

        let info = SystemInfo {
            hostname,
            os_family,
            os,
            os_version,
            virtualization: virtualization().await,
            kernel,
            arch,
            reboot_required: reboot_required(os_family).await,
            agent_status: agent_status().await,
        };

        debug!(
            "Host facts gathered - Hostname: {}, OS: {} {}, Kernel: {}",
            info.hostname, info.os, info.os_version, info.kernel
        );
        info
    }
}

async fn virtualization() -> String {
    let virt_what = Path::new("/usr/sbin/virt-what");
    if !virt_what.is_file() {
        return "Bare-metal".to_string();
    }

    match CommandRunner::new("/usr/sbin/virt-what")
        .timeout(Duration::from_secs(30))
        .run()
        .await
    {
        Ok(output) => {
            let virt = output.stdout.split_whitespace().collect::<Vec<_>>().join(" ");
            if virt.is_empty() {
                "Bare-metal".to_string()
            } else {
                virt
            }
        }
        Err(e) => {
            debug!("virt-what failed: {}", e);
            "Bare-metal".to_string()
        }
    }
}

async fn reboot_required(os_family: OsFamily) -> bool {
    match os_family {
        OsFamily::Debian => Path::new("/var/run/reboot-required").is_file(),
        OsFamily::Redhat => {
            if !Path::new("/usr/bin/needs-restarting").is_file() {
                return false;
            }
            CommandRunner::new("/usr/bin/needs-restarting")
                .arg("-r")
                .timeout(Duration::from_secs(60))
                .run()
                .await
                .map(|output| !output.success)
                .unwrap_or(false)
        }
    }
}

/// State of the linupdate service as seen by systemd.
async fn agent_status() -> String {
    match CommandRunner::new("systemctl")
        .args(["is-active", "linupdate"])
        .timeout(Duration::from_secs(10))
        .run()
        .await
    {
        Ok(output) if output.success => "running".to_string(),
        Ok(_) => "stopped".to_string(),
        Err(_) => "disabled".to_string(),
    }
}

/// First existing file of `candidates`.
pub fn find_log_file<P: AsRef<Path>>(candidates: &[P]) -> Option<PathBuf> {
    let found = candidates
        .iter()
        .map(|candidate| candidate.as_ref())
        .find(|candidate| candidate.is_file())
        .map(Path::to_path_buf);
    if let Some(path) = &found {
        debug!("Package manager log file: {}", path.display());
    }
    found
}
