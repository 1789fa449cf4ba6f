//! Static table of the capabilities the service knows how to run

use futures::future::BoxFuture;
use linupdate_agent::config::{ConfigSource, RuntimePaths, Timings};
use linupdate_agent::{AgentExit, ReposerverAgent};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Entry point of one capability agent process. The agent returns once the
/// receiver holds true.
pub type AgentFactory =
    fn(ConfigSource, RuntimePaths, Timings, watch::Receiver<bool>) -> BoxFuture<'static, anyhow::Result<AgentExit>>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown capability: {0}")]
    Unknown(String),
}

#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<&'static str, AgentFactory>,
}

fn reposerver(
    config: ConfigSource,
    paths: RuntimePaths,
    timings: Timings,
    shutdown: watch::Receiver<bool>,
) -> BoxFuture<'static, anyhow::Result<AgentExit>> {
    Box::pin(async move { ReposerverAgent::new(config, paths, timings).run(shutdown).await })
}

impl CapabilityRegistry {
    /// Registry with every capability compiled into this binary.
    pub fn builtin() -> Self {
        let mut registry = Self::default();
        registry.register(linupdate_agent::agent::MODULE_NAME, reposerver);
        registry
    }

    pub fn register(&mut self, name: &'static str, factory: AgentFactory) {
        self.capabilities.insert(name, factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.capabilities.keys().copied().collect()
    }

    pub async fn run(
        &self,
        name: &str,
        config: ConfigSource,
        paths: RuntimePaths,
        timings: Timings,
        shutdown: watch::Receiver<bool>,
    ) -> Result<anyhow::Result<AgentExit>, RegistryError> {
        let factory = self
            .capabilities
            .get(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_string()))?;
        Ok(factory(config, paths, timings, shutdown).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled(
        _: ConfigSource,
        _: RuntimePaths,
        _: Timings,
        _: watch::Receiver<bool>,
    ) -> BoxFuture<'static, anyhow::Result<AgentExit>> {
        Box::pin(async { Ok(AgentExit::Disabled) })
    }

    fn until_shutdown(
        _: ConfigSource,
        _: RuntimePaths,
        _: Timings,
        mut shutdown: watch::Receiver<bool>,
    ) -> BoxFuture<'static, anyhow::Result<AgentExit>> {
        Box::pin(async move {
            linupdate_agent::task::wait_for_shutdown(&mut shutdown).await;
            Ok(AgentExit::Stopped)
        })
    }

    #[test]
    fn test_builtin_has_reposerver() {
        let registry = CapabilityRegistry::builtin();
        assert!(registry.contains("reposerver"));
        assert!(!registry.contains("mail"));
        assert_eq!(registry.names(), vec!["reposerver"]);
    }

    #[tokio::test]
    async fn test_run_by_name() {
        let mut registry = CapabilityRegistry::default();
        registry.register("noop", disabled);

        let (_tx, rx) = watch::channel(false);
        let exit = registry
            .run("noop", ConfigSource::new("/nonexistent"), RuntimePaths::default(), Timings::default(), rx.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, AgentExit::Disabled);

        let unknown = registry
            .run("mail", ConfigSource::new("/nonexistent"), RuntimePaths::default(), Timings::default(), rx)
            .await;
        assert!(matches!(unknown, Err(RegistryError::Unknown(name)) if name == "mail"));
    }

    #[tokio::test]
    async fn test_shutdown_reaches_the_agent() {
        let mut registry = CapabilityRegistry::default();
        registry.register("idle", until_shutdown);

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(async move {
            registry
                .run("idle", ConfigSource::new("/nonexistent"), RuntimePaths::default(), Timings::default(), rx)
                .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!running.is_finished());

        tx.send(true).unwrap();
        let exit = tokio::time::timeout(std::time::Duration::from_secs(3), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(exit, AgentExit::Stopped);
    }
}
