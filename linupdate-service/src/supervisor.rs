//! Capability supervisor
//!
//! Keeps one agent process per enabled capability:
//! - Reaps exited agents and respawns them, at most once per cooldown window
//! - Restarts the whole service when the restart trigger file appears, once
//!   no request lock is held (a shutdown cuts that wait short)
//! - Terminates every agent on shutdown (SIGTERM, then SIGKILL after a grace period)

use crate::registry::CapabilityRegistry;
use async_trait::async_trait;
use linupdate_agent::command::CommandRunner;
use linupdate_agent::config::{ConfigError, ConfigSource, Timings};
use linupdate_agent::coordinator::{CoordinatorError, RestartCoordinator, REQUEST_LOCK};
use linupdate_agent::task::wait_for_shutdown;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Locks that block a service restart.
pub const RESTART_BLOCKING_LOCKS: &[&str] = &[REQUEST_LOCK];

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("could not start agent {capability}: {source}")]
    Spawn {
        capability: String,
        source: std::io::Error,
    },
    #[error("could not restart the service: {0}")]
    Restart(String),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// Starts agent processes and restarts the service.
#[async_trait]
pub trait Launcher: Send + Sync {
    fn spawn_agent(&self, capability: &str) -> std::io::Result<Child>;

    async fn restart_service(&self) -> anyhow::Result<()>;
}

/// Launches agents by re-executing the current binary with the capability name.
pub struct SelfLauncher {
    program: PathBuf,
}

impl SelfLauncher {
    pub fn current() -> std::io::Result<Self> {
        Ok(Self {
            program: std::env::current_exe()?,
        })
    }
}

#[async_trait]
impl Launcher for SelfLauncher {
    fn spawn_agent(&self, capability: &str) -> std::io::Result<Child> {
        Command::new(&self.program)
            .arg(capability)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
    }

    async fn restart_service(&self) -> anyhow::Result<()> {
        let output = CommandRunner::new("systemctl")
            .args(["restart", "linupdate", "--no-block"])
            .timeout(Duration::from_secs(30))
            .run()
            .await?;
        if !output.success {
            anyhow::bail!("systemctl restart linupdate failed: {}", output.combined().trim());
        }
        Ok(())
    }
}

/// One running agent process.
#[derive(Debug)]
pub struct ModuleAgentProcess {
    pub capability: String,
    pub child: Child,
    pub started_at: Instant,
}

/// Minimum delay between two starts of the same capability.
#[derive(Debug, Clone)]
pub struct RestartCooldown {
    window: Duration,
    last_start: HashMap<String, Instant>,
}

impl RestartCooldown {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_start: HashMap::new(),
        }
    }

    pub fn may_start(&self, capability: &str, now: Instant) -> bool {
        match self.last_start.get(capability) {
            Some(last) => now.saturating_duration_since(*last) >= self.window,
            None => true,
        }
    }

    pub fn stamp(&mut self, capability: &str, now: Instant) {
        self.last_start.insert(capability.to_string(), now);
    }
}

/// Outcome of one restart check or tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartCheck {
    /// No restart pending, or the service was restarted.
    Done,
    /// Shutdown was requested while waiting for the request lock.
    Interrupted,
}

/// Which agents stopped on SIGTERM and which had to be killed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub terminated: Vec<String>,
    pub killed: Vec<String>,
}

pub struct Supervisor<L: Launcher> {
    config: ConfigSource,
    registry: CapabilityRegistry,
    coordinator: RestartCoordinator,
    launcher: L,
    timings: Timings,
    processes: HashMap<String, ModuleAgentProcess>,
    cooldown: RestartCooldown,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(
        config: ConfigSource,
        registry: CapabilityRegistry,
        coordinator: RestartCoordinator,
        launcher: L,
        timings: Timings,
    ) -> Self {
        let cooldown = RestartCooldown::new(timings.restart_cooldown);
        Self {
            config,
            registry,
            coordinator,
            launcher,
            timings,
            processes: HashMap::new(),
            cooldown,
        }
    }

    #[cfg(test)]
    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Names of the capabilities with a live process.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self.processes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Supervise until `shutdown` flips to true, then stop every agent.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<ShutdownReport, SupervisorError> {
        info!("Starting linupdate service");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick(Instant::now(), &mut shutdown).await {
                Ok(RestartCheck::Done) => {}
                Ok(RestartCheck::Interrupted) => break,
                Err(e) => {
                    error!("{}", e);
                    self.shutdown().await;
                    return Err(e);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.timings.tick) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Shutdown requested, stopping agents: [{}]", self.running().join(", "));
        Ok(self.shutdown().await)
    }

    pub async fn tick(
        &mut self,
        now: Instant,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RestartCheck, SupervisorError> {
        if self.check_restart(shutdown).await? == RestartCheck::Interrupted {
            return Ok(RestartCheck::Interrupted);
        }
        self.reap();
        self.spawn_missing(now).await?;
        Ok(RestartCheck::Done)
    }

    /// Restart the service if asked to, once no request is in flight. The
    /// trigger is left in place when shutdown interrupts the wait.
    pub async fn check_restart(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RestartCheck, SupervisorError> {
        if !self.coordinator.restart_requested() {
            return Ok(RestartCheck::Done);
        }

        info!("A restart of the linupdate service has been requested");
        tokio::select! {
            _ = self.coordinator.wait_until_released(RESTART_BLOCKING_LOCKS, self.timings.lock_poll) => {}
            _ = wait_for_shutdown(shutdown) => {
                info!("Shutdown requested while waiting for the request lock");
                return Ok(RestartCheck::Interrupted);
            }
        }
        self.coordinator.consume_trigger()?;

        info!("Restarting linupdate service");
        self.launcher
            .restart_service()
            .await
            .map_err(|e| SupervisorError::Restart(format!("{e:#}")))?;
        Ok(RestartCheck::Done)
    }

    /// Forget every agent process that has exited.
    pub fn reap(&mut self) {
        let mut exited = Vec::new();
        for (name, process) in self.processes.iter_mut() {
            match process.child.try_wait() {
                Ok(Some(status)) => {
                    let uptime = process.started_at.elapsed().as_secs();
                    match status.code() {
                        Some(0) => info!(capability = %name, "Agent stopped after {}s", uptime),
                        Some(code) => warn!(capability = %name, "Agent exited with code {} after {}s", code, uptime),
                        None => warn!(capability = %name, "Agent was terminated by a signal after {}s", uptime),
                    }
                    exited.push(name.clone());
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(capability = %name, "Could not check agent status: {}", e);
                    exited.push(name.clone());
                }
            }
        }
        for name in exited {
            self.processes.remove(&name);
        }
    }

    async fn enabled_capabilities(&self) -> Vec<String> {
        let modules = match self.config.enabled_modules().await {
            Ok(modules) => modules,
            Err(e @ ConfigError::Missing(_)) => {
                debug!("{}", e);
                return Vec::new();
            }
            Err(e) => {
                warn!("Could not read enabled modules: {}", e);
                return Vec::new();
            }
        };

        let mut enabled = Vec::new();
        for module in modules {
            if !self.registry.contains(&module) {
                continue;
            }
            match self.config.module_agent_enabled(&module).await {
                Ok(true) => enabled.push(module),
                Ok(false) => {}
                Err(e) => debug!(capability = %module, "Agent not enabled: {}", e),
            }
        }
        enabled
    }

    /// Start an agent for every enabled capability without one.
    pub async fn spawn_missing(&mut self, now: Instant) -> Result<(), SupervisorError> {
        for capability in self.enabled_capabilities().await {
            if self.processes.contains_key(&capability) {
                continue;
            }

            if !self.cooldown.may_start(&capability, now) {
                info!(
                    capability = %capability,
                    "Agent was started less than {}s ago, delaying restart",
                    self.timings.restart_cooldown.as_secs()
                );
                continue;
            }

            let child = self
                .launcher
                .spawn_agent(&capability)
                .map_err(|source| SupervisorError::Spawn {
                    capability: capability.clone(),
                    source,
                })?;
            info!(capability = %capability, pid = ?child.id(), "Agent started");

            self.cooldown.stamp(&capability, now);
            self.processes.insert(
                capability.clone(),
                ModuleAgentProcess {
                    capability,
                    child,
                    started_at: now,
                },
            );
        }
        Ok(())
    }

    /// SIGTERM every agent, then SIGKILL those still alive after the grace period.
    pub async fn shutdown(&mut self) -> ShutdownReport {
        let mut report = ShutdownReport::default();
        let mut processes: Vec<ModuleAgentProcess> = self.processes.drain().map(|(_, process)| process).collect();
        processes.sort_by(|a, b| a.capability.cmp(&b.capability));

        for process in &processes {
            if let Some(pid) = process.child.id() {
                debug!(capability = %process.capability, "Sending SIGTERM");
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(capability = %process.capability, "Could not send SIGTERM: {}", e);
                }
            }
        }

        for mut process in processes {
            match tokio::time::timeout(self.timings.shutdown_grace, process.child.wait()).await {
                Ok(_) => {
                    info!(capability = %process.capability, "Agent stopped");
                    report.terminated.push(process.capability);
                }
                Err(_) => {
                    warn!(capability = %process.capability, "Agent did not stop in time, killing it");
                    if let Err(e) = process.child.kill().await {
                        error!(capability = %process.capability, "Could not kill agent: {}", e);
                    }
                    report.killed.push(process.capability);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct ShellLauncher {
        script: &'static str,
        spawned: AtomicUsize,
        restarts: Arc<AtomicUsize>,
        restart_fails: bool,
    }

    impl ShellLauncher {
        fn new(script: &'static str) -> Self {
            Self {
                script,
                spawned: AtomicUsize::new(0),
                restarts: Arc::new(AtomicUsize::new(0)),
                restart_fails: false,
            }
        }
    }

    #[async_trait]
    impl Launcher for ShellLauncher {
        fn spawn_agent(&self, _capability: &str) -> std::io::Result<Child> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            Command::new("sh").arg("-c").arg(self.script).spawn()
        }

        async fn restart_service(&self) -> anyhow::Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            if self.restart_fails {
                anyhow::bail!("Job for linupdate.service canceled");
            }
            Ok(())
        }
    }

    fn write(dir: &Path, relative: &str, content: &str) {
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn supervisor(dir: &TempDir, launcher: ShellLauncher) -> Supervisor<ShellLauncher> {
        write(dir.path(), "etc/linupdate.yml", "modules:\n  enabled:\n    - reposerver\n");
        write(dir.path(), "etc/modules/reposerver.yml", "agent:\n  enabled: true\n");

        let timings = Timings {
            lock_poll: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(300),
            ..Timings::default()
        };
        Supervisor::new(
            ConfigSource::new(dir.path().join("etc")),
            CapabilityRegistry::builtin(),
            RestartCoordinator::new(dir.path()),
            launcher,
            timings,
        )
    }

    async fn wait_reaped<L: Launcher>(supervisor: &mut Supervisor<L>) {
        for _ in 0..200 {
            supervisor.reap();
            if supervisor.running().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("agent did not exit");
    }

    #[test]
    fn test_cooldown_window() {
        let start = Instant::now();
        let mut cooldown = RestartCooldown::new(Duration::from_secs(120));
        assert!(cooldown.may_start("reposerver", start));

        cooldown.stamp("reposerver", start);
        assert!(!cooldown.may_start("reposerver", start + Duration::from_secs(119)));
        assert!(cooldown.may_start("reposerver", start + Duration::from_secs(120)));
        assert!(cooldown.may_start("mail", start));
    }

    #[tokio::test]
    async fn test_crashing_agent_respawn_is_throttled() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = supervisor(&dir, ShellLauncher::new("exit 3"));
        let (_tx, mut rx) = watch::channel(false);
        let start = Instant::now();

        supervisor.tick(start, &mut rx).await.unwrap();
        assert_eq!(supervisor.launcher().spawned.load(Ordering::SeqCst), 1);
        wait_reaped(&mut supervisor).await;

        supervisor.tick(start + Duration::from_secs(5), &mut rx).await.unwrap();
        supervisor.tick(start + Duration::from_secs(60), &mut rx).await.unwrap();
        assert_eq!(supervisor.launcher().spawned.load(Ordering::SeqCst), 1);

        supervisor.tick(start + Duration::from_secs(120), &mut rx).await.unwrap();
        assert_eq!(supervisor.launcher().spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_running_agent_is_not_duplicated() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = supervisor(&dir, ShellLauncher::new("sleep 30"));
        let (_tx, mut rx) = watch::channel(false);
        let start = Instant::now();

        supervisor.tick(start, &mut rx).await.unwrap();
        supervisor.tick(start + Duration::from_secs(300), &mut rx).await.unwrap();
        assert_eq!(supervisor.launcher().spawned.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.running(), vec!["reposerver"]);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_waits_for_request_lock() {
        let dir = TempDir::new().unwrap();
        let launcher = ShellLauncher::new("exit 0");
        let restarts = launcher.restarts.clone();
        let mut supervisor = supervisor(&dir, launcher);

        let coordinator = RestartCoordinator::new(dir.path());
        coordinator.acquire(REQUEST_LOCK).unwrap();
        coordinator.request_restart().unwrap();

        let (_tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move { supervisor.check_restart(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
        assert!(coordinator.restart_requested());

        coordinator.release(REQUEST_LOCK).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), RestartCheck::Done);
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert!(!coordinator.restart_requested());
    }

    #[tokio::test]
    async fn test_failed_self_restart_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut launcher = ShellLauncher::new("exit 0");
        launcher.restart_fails = true;
        let mut supervisor = supervisor(&dir, launcher);
        RestartCoordinator::new(dir.path()).request_restart().unwrap();

        let (_tx, mut rx) = watch::channel(false);
        let result = supervisor.tick(Instant::now(), &mut rx).await;
        assert!(matches!(result, Err(SupervisorError::Restart(_))));
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_request_lock() {
        let dir = TempDir::new().unwrap();
        let launcher = ShellLauncher::new("sleep 30");
        let restarts = launcher.restarts.clone();
        let mut supervisor = supervisor(&dir, launcher);

        let coordinator = RestartCoordinator::new(dir.path());
        coordinator.acquire(REQUEST_LOCK).unwrap();
        coordinator.request_restart().unwrap();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { supervisor.run(rx).await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!task.is_finished());

        tx.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(3), task)
            .await
            .expect("supervisor kept waiting for the request lock")
            .unwrap()
            .unwrap();

        assert_eq!(report, ShutdownReport::default());
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
        assert!(coordinator.restart_requested());
        assert!(coordinator.is_held(REQUEST_LOCK));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_then_kills() {
        let dir = TempDir::new().unwrap();
        let mut supervisor = supervisor(&dir, ShellLauncher::new("exit 0"));
        let now = Instant::now();

        for (name, script) in [("polite", "sleep 30"), ("stubborn", "trap '' TERM; sleep 30")] {
            let child = Command::new("sh").arg("-c").arg(script).spawn().unwrap();
            supervisor.processes.insert(
                name.to_string(),
                ModuleAgentProcess {
                    capability: name.to_string(),
                    child,
                    started_at: now,
                },
            );
        }
        // Let the shell install its trap before signalling
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = supervisor.shutdown().await;
        assert_eq!(report.terminated, vec!["polite"]);
        assert_eq!(report.killed, vec!["stubborn"]);
        assert!(supervisor.running().is_empty());
    }
}
