//! Configuration management for linupdate agents
//!
//! Handles:
//! - Main configuration (`linupdate.yml`): enabled modules, update exclusions
//! - Reposerver module configuration (`modules/reposerver.yml`): server URL,
//!   host identity, agent switches
//! - Runtime paths (request ledger, lock and trigger files)
//! - Timing constants shared by the supervisor and the agents
//!
//! Files are re-read on demand so that live configuration changes are
//! picked up on the next tick.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_DIR: &str = "/etc/linupdate";
pub const DEFAULT_LEDGER_DIR: &str = "/opt/linupdate/.reposerver/requests";
pub const DEFAULT_RUNTIME_DIR: &str = "/tmp";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file {0} does not exist")]
    Missing(PathBuf),
    #[error("could not read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("error while reading configuration file {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Treat an explicit YAML `null` like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MainConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub main: MainSection,
    #[serde(default, deserialize_with = "null_as_default")]
    pub modules: ModulesSection,
    #[serde(default, deserialize_with = "null_as_default")]
    pub update: UpdateSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MainSection {
    pub profile: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModulesSection {
    #[serde(default, deserialize_with = "null_as_default")]
    pub enabled: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSection {
    #[serde(default = "default_true")]
    pub exit_on_package_update_error: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub packages: PackagesSection,
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            exit_on_package_update_error: true,
            packages: PackagesSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackagesSection {
    #[serde(default, deserialize_with = "null_as_default")]
    pub exclude: ExcludeSection,
}

/// Package name patterns (regular expressions) excluded from updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExcludeSection {
    #[serde(default, deserialize_with = "null_as_default")]
    pub always: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub on_major_update: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReposerverConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub reposerver: ServerSection,
    #[serde(default, deserialize_with = "null_as_default")]
    pub client: ClientSection,
    #[serde(default, deserialize_with = "null_as_default")]
    pub agent: AgentSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSection {
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default, deserialize_with = "null_as_default")]
    pub auth: AuthSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    pub id: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub listen: ListenSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenSection {
    #[serde(default)]
    pub enabled: bool,
}

/// Opaque host identity presented to the fleet server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub token: String,
}

impl ReposerverConfig {
    /// Server URL without trailing slash, `None` when unset or blank.
    pub fn url(&self) -> Option<String> {
        self.reposerver
            .url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| url.trim_end_matches('/').to_string())
    }

    pub fn identity(&self) -> Option<Identity> {
        let id = self.client.auth.id.as_deref().map(str::trim).unwrap_or_default();
        let token = self.client.auth.token.as_deref().map(str::trim).unwrap_or_default();
        if id.is_empty() || token.is_empty() {
            return None;
        }
        Some(Identity {
            id: id.to_string(),
            token: token.to_string(),
        })
    }
}

/// Only the `agent` switch of a module file, whatever the module.
#[derive(Debug, Default, Deserialize)]
struct ModuleAgentSwitch {
    #[serde(default, deserialize_with = "null_as_default")]
    agent: AgentSection,
}

/// Location of the YAML configuration files.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    dir: PathBuf,
}

impl ConfigSource {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// `LINUPDATE_CONFIG_DIR` or `/etc/linupdate`.
    pub fn from_env() -> Self {
        let dir = std::env::var("LINUPDATE_CONFIG_DIR").unwrap_or_else(|_| DEFAULT_CONFIG_DIR.into());
        Self::new(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn main_file(&self) -> PathBuf {
        self.dir.join("linupdate.yml")
    }

    pub fn module_file(&self, module: &str) -> PathBuf {
        self.dir.join("modules").join(format!("{module}.yml"))
    }

    pub async fn load_main(&self) -> Result<MainConfig, ConfigError> {
        read_yaml(&self.main_file()).await
    }

    pub async fn load_reposerver(&self) -> Result<ReposerverConfig, ConfigError> {
        read_yaml(&self.module_file("reposerver")).await
    }

    pub async fn enabled_modules(&self) -> Result<Vec<String>, ConfigError> {
        Ok(self.load_main().await?.modules.enabled)
    }

    /// Whether the module's own file switches its agent on.
    pub async fn module_agent_enabled(&self, module: &str) -> Result<bool, ConfigError> {
        let switch: ModuleAgentSwitch = read_yaml(&self.module_file(module)).await?;
        Ok(switch.agent.enabled)
    }
}

async fn read_yaml<T>(path: &Path) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de> + Default,
{
    if !path.exists() {
        return Err(ConfigError::Missing(path.to_path_buf()));
    }

    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    if content.trim().is_empty() {
        return Ok(T::default());
    }

    serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

/// Directories holding the request ledger and the lock/trigger files.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub ledger_dir: PathBuf,
    pub runtime_dir: PathBuf,
}

impl RuntimePaths {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(ledger_dir: P, runtime_dir: Q) -> Self {
        Self {
            ledger_dir: ledger_dir.as_ref().to_path_buf(),
            runtime_dir: runtime_dir.as_ref().to_path_buf(),
        }
    }

    /// `LINUPDATE_LEDGER_DIR` / `LINUPDATE_RUNTIME_DIR`, falling back to the packaged defaults.
    pub fn from_env() -> Self {
        let ledger_dir = std::env::var("LINUPDATE_LEDGER_DIR").unwrap_or_else(|_| DEFAULT_LEDGER_DIR.into());
        let runtime_dir = std::env::var("LINUPDATE_RUNTIME_DIR").unwrap_or_else(|_| DEFAULT_RUNTIME_DIR.into());
        Self::new(ledger_dir, runtime_dir)
    }
}

impl Default for RuntimePaths {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_DIR, DEFAULT_RUNTIME_DIR)
    }
}

/// Fixed intervals and windows used across the service.
#[derive(Debug, Clone)]
pub struct Timings {
    /// Main loop interval of both the supervisor and the agent.
    pub tick: Duration,
    /// Number of agent ticks between two proactive full status pushes.
    pub periodic_push_ticks: u32,
    /// Minimum time between two starts of the same capability.
    pub restart_cooldown: Duration,
    /// Ledger records younger than this are never flushed.
    pub ledger_age_guard: Duration,
    /// Interval of the in-connection flush pass.
    pub flush_interval: Duration,
    /// Grace period between terminate and kill on shutdown.
    pub shutdown_grace: Duration,
    /// Poll interval while waiting for lock files to disappear.
    pub lock_poll: Duration,
    /// Package log events closer than this to the previous one are ignored.
    pub watcher_debounce: Duration,
    /// Extra delay before reacting to a dnf log event.
    pub dnf_settle: Duration,
    /// Upper bound on waiting for the dpkg/rpm lock.
    pub package_lock_wait: Duration,
    /// Interval of progress reports while waiting for the package lock.
    pub package_lock_report: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(5),
            periodic_push_ticks: 720,
            restart_cooldown: Duration::from_secs(120),
            ledger_age_guard: Duration::from_secs(300),
            flush_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            lock_poll: Duration::from_secs(2),
            watcher_debounce: Duration::from_secs(120),
            dnf_settle: Duration::from_secs(15),
            package_lock_wait: Duration::from_secs(3600),
            package_lock_report: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, relative: &str, content: &str) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_load_main_config() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "linupdate.yml",
            r#"
main:
  profile: web
  environment: prod
modules:
  enabled:
    - reposerver
update:
  exit_on_package_update_error: false
  packages:
    exclude:
      always:
        - "kernel.*"
      on_major_update: ~
"#,
        );

        let source = ConfigSource::new(dir.path());
        let config = source.load_main().await.unwrap();
        assert_eq!(config.main.profile.as_deref(), Some("web"));
        assert_eq!(config.modules.enabled, vec!["reposerver"]);
        assert!(!config.update.exit_on_package_update_error);
        assert_eq!(config.update.packages.exclude.always, vec!["kernel.*"]);
        assert!(config.update.packages.exclude.on_major_update.is_empty());
    }

    #[tokio::test]
    async fn test_reposerver_identity_and_url() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "modules/reposerver.yml",
            r#"
reposerver:
  url: "https://repo.example.com/"
client:
  auth:
    id: "host-1"
    token: "secret"
agent:
  enabled: true
  listen:
    enabled: true
"#,
        );

        let source = ConfigSource::new(dir.path());
        let config = source.load_reposerver().await.unwrap();
        assert_eq!(config.url().as_deref(), Some("https://repo.example.com"));
        assert_eq!(
            config.identity(),
            Some(Identity {
                id: "host-1".into(),
                token: "secret".into()
            })
        );
        assert!(config.agent.listen.enabled);
        assert!(source.module_agent_enabled("reposerver").await.unwrap());
    }

    #[tokio::test]
    async fn test_blank_identity_is_missing() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "modules/reposerver.yml", "client:\n  auth:\n    id: ''\n    token: abc\n");

        let config = ConfigSource::new(dir.path()).load_reposerver().await.unwrap();
        assert!(config.identity().is_none());
        assert!(config.url().is_none());
        assert!(!config.agent.enabled);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = ConfigSource::new(dir.path()).load_main().await.unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_default_timings() {
        let timings = Timings::default();
        assert_eq!(timings.restart_cooldown, Duration::from_secs(120));
        assert_eq!(timings.ledger_age_guard, Duration::from_secs(300));
        assert_eq!(timings.periodic_push_ticks, 720);
    }
}
