//! Reposerver agent - main loop of the `reposerver` capability process
//!
//! Every tick the agent:
//! - Re-reads its configuration and checks the preconditions
//! - Pushes the full host status once per `periodic_push_ticks`
//! - Keeps the package log watcher running (a failure is fatal)
//! - Keeps the control connection running (a failure is retried)
//!
//! On shutdown, and on every exit, both background tasks are stopped and
//! awaited, so a request lock held by an in-flight update is released.

use crate::channel::{websocket_url, ControlConnection};
use crate::config::{ConfigError, ConfigSource, Identity, MainConfig, ReposerverConfig, RuntimePaths, Timings};
use crate::control::ControlAgent;
use crate::coordinator::{RestartCoordinator, REQUEST_LOCK};
use crate::ledger::RequestLedger;
use crate::package::{self, Exclusions, PackageManager, PackageService};
use crate::reporter::{HttpReporter, StatusPush};
use crate::status::ProgressHandle;
use crate::system::{find_log_file, OsFamily, PACKAGE_LOG_FILES};
use crate::task::{wait_for_shutdown, TaskSlot};
use crate::watcher::LogWatcher;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info, warn};

pub const MODULE_NAME: &str = "reposerver";

/// Clean termination of the agent, as opposed to a fatal error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// Switched off on purpose.
    Disabled,
    /// Required setup is missing.
    Misconfigured,
    /// Asked to stop by a signal.
    Stopped,
}

impl AgentExit {
    pub fn code(&self) -> i32 {
        match self {
            AgentExit::Disabled | AgentExit::Stopped => 0,
            AgentExit::Misconfigured => 1,
        }
    }
}

/// Proactive pushes happen on the first tick and then every `every` ticks.
pub fn periodic_push_due(counter: u32, every: u32) -> bool {
    every == 0 || counter % every == 0
}

/// Configuration that passed the precondition checks of one tick.
struct Checked {
    main: MainConfig,
    module: ReposerverConfig,
    url: String,
    identity: Identity,
    log_file: PathBuf,
}

enum Preconditions {
    Ready(Box<Checked>),
    Exit(AgentExit),
}

pub struct ReposerverAgent {
    config: ConfigSource,
    paths: RuntimePaths,
    timings: Timings,
    log_candidates: Vec<PathBuf>,
    watcher: TaskSlot,
    connection: TaskSlot,
    progress: ProgressHandle,
    reporter: Option<(String, Identity, Arc<HttpReporter>)>,
}

impl ReposerverAgent {
    pub fn new(config: ConfigSource, paths: RuntimePaths, timings: Timings) -> Self {
        Self {
            config,
            paths,
            timings,
            log_candidates: PACKAGE_LOG_FILES.iter().map(PathBuf::from).collect(),
            watcher: TaskSlot::new("package log watcher"),
            connection: TaskSlot::new("reposerver connection"),
            progress: ProgressHandle::new(),
            reporter: None,
        }
    }

    /// Replace the default package log locations.
    pub fn with_log_files(mut self, candidates: Vec<PathBuf>) -> Self {
        self.log_candidates = candidates;
        self
    }

    /// Run until the configuration asks to stop, `shutdown` flips to true or
    /// a fatal error occurs.
    pub async fn run(&mut self, shutdown: watch::Receiver<bool>) -> Result<AgentExit> {
        info!("Starting {} agent", MODULE_NAME);
        self.release_stale_lock();

        let os_family = OsFamily::detect().context("Failed to detect OS family")?;
        let manager = package::select(os_family, &self.timings);
        info!("Using {} package backend", os_family);

        self.supervise(&manager, shutdown).await
    }

    /// Main loop over an already selected package manager.
    pub async fn supervise(
        &mut self,
        manager: &Arc<dyn PackageManager>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<AgentExit> {
        let mut ticker = interval(self.timings.tick);
        let mut counter: u32 = 0;
        let outcome = loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Shutdown requested");
                    break Ok(AgentExit::Stopped);
                }
                _ = ticker.tick() => {}
            }

            match self.tick(manager, counter).await {
                Ok(Some(exit)) => break Ok(exit),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
            counter = counter.wrapping_add(1) % self.timings.periodic_push_ticks.max(1);
        };

        self.stop_tasks().await;
        if let Ok(exit) = &outcome {
            info!("Stopping {} agent (exit code {})", MODULE_NAME, exit.code());
        }
        outcome
    }

    /// A fresh agent process has no request in flight, so a request lock
    /// found now was left by a process that died mid-update.
    fn release_stale_lock(&self) {
        let coordinator = RestartCoordinator::new(&self.paths.runtime_dir);
        if !coordinator.is_held(REQUEST_LOCK) {
            return;
        }
        warn!("Removing request lock left by a previous agent process");
        if let Err(e) = coordinator.release(REQUEST_LOCK) {
            error!("Could not remove stale request lock: {}", e);
        }
    }

    async fn stop_tasks(&self) {
        self.connection.stop().await;
        self.watcher.stop().await;
    }

    /// One iteration of the main loop; `Some` means the agent must stop.
    pub async fn tick(&mut self, manager: &Arc<dyn PackageManager>, counter: u32) -> Result<Option<AgentExit>> {
        let checked = match self.check_preconditions().await? {
            Preconditions::Ready(checked) => *checked,
            Preconditions::Exit(exit) => return Ok(Some(exit)),
        };

        let reporter = self.reporter(&checked, manager)?;

        if periodic_push_due(counter, self.timings.periodic_push_ticks) {
            info!("Sending full status to the reposerver");
            if let Err(e) = reporter.send_general_info().await {
                error!("Could not send general informations: {:#}", e);
            }
            if let Err(e) = reporter.send_packages_info().await {
                error!("Could not send packages informations: {:#}", e);
            }
        }

        self.ensure_watcher(&checked, reporter.clone())?;

        if checked.module.agent.listen.enabled {
            let service = match self.package_service(&checked, manager) {
                Ok(service) => service,
                Err(e) => {
                    error!("{:#}", e);
                    return Ok(Some(AgentExit::Misconfigured));
                }
            };
            if let Err(e) = self.ensure_connection(&checked, service, reporter) {
                error!("{:#}", e);
                return Ok(Some(AgentExit::Misconfigured));
            }
        } else if self.connection.is_running() {
            info!("Reposerver listening is disabled, closing the connection");
            self.connection.stop().await;
        }

        Ok(None)
    }

    async fn check_preconditions(&self) -> Result<Preconditions> {
        let main = match self.config.load_main().await {
            Ok(main) => main,
            Err(e @ ConfigError::Missing(_)) => {
                error!("{}", e);
                return Ok(Preconditions::Exit(AgentExit::Misconfigured));
            }
            Err(e) => return Err(e).context("Failed to load main configuration"),
        };

        if !main.modules.enabled.iter().any(|module| module == MODULE_NAME) {
            info!("Module {} is disabled", MODULE_NAME);
            return Ok(Preconditions::Exit(AgentExit::Disabled));
        }

        let module = match self.config.load_reposerver().await {
            Ok(module) => module,
            Err(e @ ConfigError::Missing(_)) => {
                error!("{}", e);
                return Ok(Preconditions::Exit(AgentExit::Misconfigured));
            }
            Err(e) => return Err(e).context("Failed to load reposerver configuration"),
        };

        let Some(url) = module.url() else {
            error!("Reposerver URL is not configured");
            return Ok(Preconditions::Exit(AgentExit::Misconfigured));
        };

        let Some(identity) = module.identity() else {
            error!("Host is not registered to the reposerver (missing id or token)");
            return Ok(Preconditions::Exit(AgentExit::Misconfigured));
        };

        if !module.agent.enabled {
            info!("Reposerver agent is disabled");
            return Ok(Preconditions::Exit(AgentExit::Disabled));
        }

        let log_file =
            find_log_file(&self.log_candidates).context("No package manager log file found to monitor")?;

        Ok(Preconditions::Ready(Box::new(Checked {
            main,
            module,
            url,
            identity,
            log_file,
        })))
    }

    /// Reuse the HTTP reporter while url and identity are unchanged.
    fn reporter(&mut self, checked: &Checked, manager: &Arc<dyn PackageManager>) -> Result<Arc<HttpReporter>> {
        if let Some((url, identity, reporter)) = &self.reporter {
            if *url == checked.url && *identity == checked.identity {
                return Ok(reporter.clone());
            }
        }

        let reporter = Arc::new(HttpReporter::new(
            &checked.url,
            checked.identity.clone(),
            manager.clone(),
            self.config.clone(),
        )?);
        self.reporter = Some((checked.url.clone(), checked.identity.clone(), reporter.clone()));
        Ok(reporter)
    }

    fn ensure_watcher(&self, checked: &Checked, reporter: Arc<HttpReporter>) -> Result<()> {
        if let Some(e) = self.watcher.take_error() {
            anyhow::bail!("Package log watcher failed: {}", e);
        }
        if self.watcher.is_running() {
            return Ok(());
        }

        let watcher = LogWatcher::new(
            &checked.log_file,
            reporter,
            self.timings.watcher_debounce,
            self.timings.dnf_settle,
        );
        self.watcher.spawn(watcher.run());
        Ok(())
    }

    fn package_service(&self, checked: &Checked, manager: &Arc<dyn PackageManager>) -> Result<Arc<PackageService>> {
        let update = &checked.main.update;
        let exclusions =
            Exclusions::from_config(&update.packages.exclude).context("Invalid package exclusion pattern")?;
        Ok(Arc::new(PackageService::new(
            manager.clone(),
            exclusions,
            update.exit_on_package_update_error,
            RestartCoordinator::new(&self.paths.runtime_dir),
        )))
    }

    fn ensure_connection(
        &self,
        checked: &Checked,
        service: Arc<PackageService>,
        reporter: Arc<HttpReporter>,
    ) -> Result<()> {
        if let Some(e) = self.connection.take_error() {
            warn!("Reposerver connection lost: {}", e);
        }
        if self.connection.is_running() {
            return Ok(());
        }

        let connection = ControlConnection::new(websocket_url(&checked.url)?, self.timings.tick);
        let mut control = ControlAgent::new(
            checked.identity.clone(),
            RequestLedger::new(&self.paths.ledger_dir),
            RestartCoordinator::new(&self.paths.runtime_dir),
            service,
            reporter,
            self.progress.clone(),
            self.timings.clone(),
        );

        self.connection.spawn(async move {
            control.connecting();
            connection.run(&mut control).await?;
            Ok(())
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    const MAIN_ENABLED: &str = "modules:\n  enabled:\n    - reposerver\n";

    fn write(dir: &Path, relative: &str, content: &str) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn agent(dir: &TempDir) -> ReposerverAgent {
        let log = dir.path().join("history.log");
        ReposerverAgent::new(
            ConfigSource::new(dir.path().join("etc")),
            RuntimePaths::new(dir.path().join("requests"), dir.path()),
            Timings::default(),
        )
        .with_log_files(vec![log])
    }

    async fn tick(dir: &TempDir) -> Result<Option<AgentExit>> {
        let manager = package::select(OsFamily::Debian, &Timings::default());
        agent(dir).tick(&manager, 1).await
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(AgentExit::Disabled.code(), 0);
        assert_eq!(AgentExit::Misconfigured.code(), 1);
        assert_eq!(AgentExit::Stopped.code(), 0);
    }

    #[test]
    fn test_periodic_push_schedule() {
        assert!(periodic_push_due(0, 720));
        assert!(!periodic_push_due(1, 720));
        assert!(!periodic_push_due(719, 720));
        assert!(periodic_push_due(720, 720));
    }

    #[tokio::test]
    async fn test_module_disabled_exits_cleanly() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "etc/linupdate.yml", "modules:\n  enabled: []\n");
        assert_eq!(tick(&dir).await.unwrap(), Some(AgentExit::Disabled));
    }

    #[tokio::test]
    async fn test_missing_url_is_misconfigured() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "etc/linupdate.yml", MAIN_ENABLED);
        write(
            dir.path(),
            "etc/modules/reposerver.yml",
            "client:\n  auth:\n    id: host\n    token: secret\nagent:\n  enabled: true\n",
        );
        assert_eq!(tick(&dir).await.unwrap(), Some(AgentExit::Misconfigured));
    }

    #[tokio::test]
    async fn test_missing_identity_is_misconfigured() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "etc/linupdate.yml", MAIN_ENABLED);
        write(
            dir.path(),
            "etc/modules/reposerver.yml",
            "reposerver:\n  url: https://repo.example.com\nagent:\n  enabled: true\n",
        );
        assert_eq!(tick(&dir).await.unwrap(), Some(AgentExit::Misconfigured));
    }

    #[tokio::test]
    async fn test_agent_switch_off_exits_cleanly() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "etc/linupdate.yml", MAIN_ENABLED);
        write(
            dir.path(),
            "etc/modules/reposerver.yml",
            "reposerver:\n  url: https://repo.example.com\nclient:\n  auth:\n    id: host\n    token: secret\nagent:\n  enabled: false\n",
        );
        assert_eq!(tick(&dir).await.unwrap(), Some(AgentExit::Disabled));
    }

    #[tokio::test]
    async fn test_missing_log_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "etc/linupdate.yml", MAIN_ENABLED);
        write(
            dir.path(),
            "etc/modules/reposerver.yml",
            "reposerver:\n  url: https://repo.example.com\nclient:\n  auth:\n    id: host\n    token: secret\nagent:\n  enabled: true\n",
        );
        assert!(tick(&dir).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_main_config_is_misconfigured() {
        let dir = TempDir::new().unwrap();
        assert_eq!(tick(&dir).await.unwrap(), Some(AgentExit::Misconfigured));
    }

    const LISTEN_OFF: &str = "reposerver:\n  url: http://127.0.0.1:9\nclient:\n  auth:\n    id: host\n    token: secret\nagent:\n  enabled: true\n  listen:\n    enabled: false\n";

    /// Occupy the connection slot with a task holding the request lock, like
    /// an update in progress.
    fn hold_request_lock(agent: &ReposerverAgent, dir: &TempDir) -> RestartCoordinator {
        let coordinator = RestartCoordinator::new(dir.path());
        let guard = coordinator.guard(REQUEST_LOCK).unwrap();
        agent.connection.spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
            Ok(())
        });
        assert!(coordinator.is_held(REQUEST_LOCK));
        coordinator
    }

    #[tokio::test]
    async fn test_shutdown_releases_request_lock() {
        let dir = TempDir::new().unwrap();
        let mut agent = agent(&dir);
        let coordinator = hold_request_lock(&agent, &dir);

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let manager = package::select(OsFamily::Debian, &Timings::default());
        let exit = tokio::time::timeout(std::time::Duration::from_secs(3), agent.supervise(&manager, rx))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(exit, AgentExit::Stopped);
        assert!(!agent.connection.is_running());
        assert!(!coordinator.is_held(REQUEST_LOCK));
    }

    #[test]
    fn test_stale_request_lock_released_on_start() {
        let dir = TempDir::new().unwrap();
        let coordinator = RestartCoordinator::new(dir.path());
        coordinator.acquire(REQUEST_LOCK).unwrap();

        agent(&dir).release_stale_lock();
        assert!(!coordinator.is_held(REQUEST_LOCK));

        // Nothing to do the second time
        agent(&dir).release_stale_lock();
        assert!(!coordinator.is_held(REQUEST_LOCK));
    }

    #[tokio::test]
    async fn test_listen_switch_off_closes_connection() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "etc/linupdate.yml", MAIN_ENABLED);
        write(dir.path(), "etc/modules/reposerver.yml", LISTEN_OFF);
        write(dir.path(), "history.log", "");

        let mut agent = agent(&dir);
        let coordinator = hold_request_lock(&agent, &dir);

        let manager = package::select(OsFamily::Debian, &Timings::default());
        assert_eq!(agent.tick(&manager, 1).await.unwrap(), None);

        assert!(!agent.connection.is_running());
        assert!(!coordinator.is_held(REQUEST_LOCK));
        agent.stop_tasks().await;
    }
}
