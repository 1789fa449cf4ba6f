//! linupdate service - entry point
//!
//! Without argument the binary supervises the capability agents. With one
//! argument it runs the named capability agent in this process.

mod registry;
mod supervisor;

use crate::registry::CapabilityRegistry;
use crate::supervisor::{SelfLauncher, Supervisor};
use linupdate_agent::config::{ConfigSource, RuntimePaths, Timings};
use linupdate_agent::coordinator::RestartCoordinator;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = match args.as_slice() {
        [] => run_supervisor().await,
        [capability] => run_capability(capability).await,
        _ => {
            eprintln!("usage: linupdate-service [capability]");
            2
        }
    };
    std::process::exit(code);
}

async fn run_supervisor() -> i32 {
    let launcher = match SelfLauncher::current() {
        Ok(launcher) => launcher,
        Err(e) => {
            error!("Could not locate the service executable: {}", e);
            return 1;
        }
    };

    let Some(shutdown_rx) = shutdown_channel() else {
        return 1;
    };

    let paths = RuntimePaths::from_env();
    let mut supervisor = Supervisor::new(
        ConfigSource::from_env(),
        CapabilityRegistry::builtin(),
        RestartCoordinator::new(&paths.runtime_dir),
        launcher,
        Timings::default(),
    );

    match supervisor.run(shutdown_rx).await {
        Ok(report) => {
            info!(
                "linupdate service stopped ({} agents terminated, {} killed)",
                report.terminated.len(),
                report.killed.len()
            );
            0
        }
        Err(e) => {
            error!("linupdate service failed: {}", e);
            1
        }
    }
}

async fn run_capability(capability: &str) -> i32 {
    let Some(shutdown_rx) = shutdown_channel() else {
        return 1;
    };

    let registry = CapabilityRegistry::builtin();
    let result = registry
        .run(
            capability,
            ConfigSource::from_env(),
            RuntimePaths::from_env(),
            Timings::default(),
            shutdown_rx,
        )
        .await;

    match result {
        Ok(Ok(exit)) => exit.code(),
        Ok(Err(e)) => {
            error!(capability = %capability, "Agent failed: {:#}", e);
            1
        }
        Err(e) => {
            error!("{} (known: {})", e, registry.names().join(", "));
            1
        }
    }
}

/// Flips to true on SIGTERM or SIGINT.
fn shutdown_channel() -> Option<watch::Receiver<bool>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Could not install SIGTERM handler: {}", e);
            return None;
        }
    };
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => info!("Received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        }
        let _ = shutdown_tx.send(true);
    });
    Some(shutdown_rx)
}
