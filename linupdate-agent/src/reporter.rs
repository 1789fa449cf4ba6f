//! Host status push to the fleet server HTTP API
//!
//! Every call is a `PUT` authenticated with the host id/token pair. The
//! control agent, the periodic push and the log watcher all go through the
//! `StatusPush` trait so tests can substitute a recorder.

use crate::config::{ConfigSource, Identity};
use crate::package::{AvailablePackage, HistoryOrder, InstalledPackage, PackageManager};
use crate::system::{OsFamily, SystemInfo};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[async_trait]
pub trait StatusPush: Send + Sync {
    async fn send_general_info(&self) -> Result<()>;

    /// History, then available packages, then installed packages.
    async fn send_packages_info(&self) -> Result<()>;

    async fn send_packages_history(&self) -> Result<()>;
}

pub struct HttpReporter {
    client: reqwest::Client,
    url: String,
    identity: Identity,
    manager: Arc<dyn PackageManager>,
    config: ConfigSource,
}

impl HttpReporter {
    pub fn new(url: &str, identity: Identity, manager: Arc<dyn PackageManager>, config: ConfigSource) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("linupdate/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url: url.trim_end_matches('/').to_string(),
            identity,
            manager,
            config,
        })
    }

    async fn put(&self, path: &str, body: &Value) -> Result<()> {
        let endpoint = format!("{}{}", self.url, path);
        debug!("PUT {}", endpoint);

        let response = self
            .client
            .put(&endpoint)
            .header(
                "Authorization",
                format!("Host {}:{}", self.identity.id, self.identity.token),
            )
            .json(body)
            .send()
            .await
            .with_context(|| format!("HTTP request to {} failed", endpoint))?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let parsed: Option<Value> = serde_json::from_str(&text).ok();

        if !status.is_success() {
            let detail = parsed
                .as_ref()
                .and_then(|body| body.get("message_error"))
                .map(Value::to_string)
                .unwrap_or_else(|| status.to_string());
            anyhow::bail!("HTTP request error on {}: {}", endpoint, detail);
        }

        if let Some(messages) = parsed.as_ref().and_then(|body| body.get("message")).and_then(Value::as_array) {
            for message in messages.iter().filter_map(Value::as_str) {
                info!("{}", message);
            }
        }
        Ok(())
    }

    async fn send_available_packages(&self) -> Result<()> {
        let packages = self
            .manager
            .available_packages(true)
            .await
            .context("error while retrieving available packages")?;
        let body = json!({ "available_packages": available_payload(&packages, self.manager.family()) });
        info!("Sending available packages to {}", self.url);
        self.put("/api/v2/host/packages/available", &body).await
    }

    async fn send_installed_packages(&self) -> Result<()> {
        let packages = self
            .manager
            .installed_packages()
            .await
            .context("error while retrieving installed packages")?;
        let body = json!({ "installed_packages": installed_payload(&packages) });
        info!("Sending installed packages to {}", self.url);
        self.put("/api/v2/host/packages/installed", &body).await
    }
}

#[async_trait]
impl StatusPush for HttpReporter {
    async fn send_general_info(&self) -> Result<()> {
        let main = self.config.load_main().await.context("could not build general status data")?;
        let facts = SystemInfo::gather(self.manager.family()).await;

        let body = json!({
            "hostname": facts.hostname,
            "os_family": facts.os_family.as_str(),
            "os": facts.os,
            "os_version": facts.os_version,
            "type": facts.virtualization,
            "kernel": facts.kernel,
            "arch": facts.arch,
            "profile": main.main.profile.unwrap_or_default(),
            "env": main.main.environment.unwrap_or_default(),
            "agent_status": facts.agent_status,
            "linupdate_version": env!("CARGO_PKG_VERSION"),
            "reboot_required": facts.reboot_required.to_string(),
        });

        info!("Sending general informations to {}", self.url);
        self.put("/api/v2/host/status", &body)
            .await
            .context("error while sending general status to reposerver")
    }

    async fn send_packages_info(&self) -> Result<()> {
        self.send_packages_history().await?;
        self.send_available_packages().await?;
        self.send_installed_packages()
            .await
            .context("error while sending packages status to reposerver")
    }

    async fn send_packages_history(&self) -> Result<()> {
        let entries = self
            .manager
            .history(HistoryOrder::Oldest)
            .await
            .context("error while retrieving history")?;
        if entries.is_empty() {
            info!("No package history found");
            return Ok(());
        }

        let events = self
            .manager
            .parse_history(&entries, usize::MAX)
            .await
            .context("could not parse packages history")?;

        info!("Sending {} packages events to {}", events.len(), self.url);
        self.put("/api/v2/host/packages/event", &json!({ "events": events })).await
    }
}

/// `name|version,...`, or `none` when nothing is available.
pub fn available_payload(packages: &[AvailablePackage], family: OsFamily) -> String {
    let entries: Vec<String> = packages
        .iter()
        .filter(|package| !package.name.is_empty())
        .map(|package| {
            let version = match family {
                OsFamily::Redhat => package
                    .available_version
                    .strip_prefix("0:")
                    .unwrap_or(&package.available_version),
                OsFamily::Debian => package.available_version.as_str(),
            };
            format!("{}|{}", package.name, version)
        })
        .collect();

    if entries.is_empty() {
        "none".to_string()
    } else {
        entries.join(",")
    }
}

pub fn installed_payload(packages: &[InstalledPackage]) -> String {
    packages
        .iter()
        .filter(|package| !package.name.is_empty() && !package.version.is_empty())
        .map(|package| format!("{}|{}", package.name, package.version))
        .collect::<Vec<_>>()
        .join(",")
}
