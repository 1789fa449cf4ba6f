use linupdate_agent::config::{ConfigSource, RuntimePaths, Timings};
use linupdate_agent::package::PackageManager;
use linupdate_agent::reporter::StatusPush;
use linupdate_agent::watcher::LogWatcher;
use linupdate_agent::ReposerverAgent;
use linupdate_devkit::{MockPackageManager, MockReporter};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Same as `apt` appending one transaction.
fn append(log: &Path, line: &str) {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new().append(true).open(log).unwrap();
    writeln!(file, "{line}").unwrap();
}

async fn wait_for_pushes(reporter: &MockReporter, expected: usize) {
    for _ in 0..300 {
        if reporter.history_pushes() >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("expected {} history pushes, got {}", expected, reporter.history_pushes());
}

fn start(log: &Path, reporter: Arc<MockReporter>, debounce: Duration, settle: Duration) -> tokio::task::JoinHandle<()> {
    let push: Arc<dyn StatusPush> = reporter;
    let watcher = LogWatcher::new(log, push, debounce, settle);
    tokio::spawn(async move {
        let _ = watcher.run().await;
    })
}

#[tokio::test]
async fn test_writes_within_debounce_window_push_once() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("history.log");
    std::fs::write(&log, "").unwrap();

    let reporter = Arc::new(MockReporter::new());
    let watcher = start(&log, reporter.clone(), Duration::from_secs(1), Duration::from_secs(15));
    tokio::time::sleep(Duration::from_millis(300)).await;

    append(&log, "Start-Date: 2026-10-18  09:12:01");
    append(&log, "End-Date: 2026-10-18  09:12:04");
    wait_for_pushes(&reporter, 1).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(reporter.history_pushes(), 1);

    tokio::time::sleep(Duration::from_millis(800)).await;
    append(&log, "Start-Date: 2026-10-18  09:14:30");
    wait_for_pushes(&reporter, 2).await;

    watcher.abort();
}

#[tokio::test]
async fn test_dnf_log_waits_before_pushing() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("dnf.log");
    std::fs::write(&log, "").unwrap();

    let reporter = Arc::new(MockReporter::new());
    let watcher = start(&log, reporter.clone(), Duration::ZERO, Duration::from_millis(600));
    tokio::time::sleep(Duration::from_millis(300)).await;

    append(&log, "2026-10-18T09:12:01+0000 DDEBUG Command: dnf update -y");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(reporter.history_pushes(), 0);

    wait_for_pushes(&reporter, 1).await;
    watcher.abort();
}

#[tokio::test]
async fn test_rotated_log_stops_the_watcher() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("history.log");
    std::fs::write(&log, "").unwrap();

    let reporter: Arc<dyn StatusPush> = Arc::new(MockReporter::new());
    let watcher = LogWatcher::new(&log, reporter, Duration::from_secs(1), Duration::ZERO);
    let running = tokio::spawn(watcher.run());
    tokio::time::sleep(Duration::from_millis(300)).await;

    std::fs::rename(&log, dir.path().join("history.log.1")).unwrap();
    let error = tokio::time::timeout(Duration::from_secs(3), running)
        .await
        .expect("watcher kept running on the rotated file")
        .unwrap()
        .unwrap_err();
    assert!(error.to_string().contains("moved or removed"), "{error:#}");
}

#[tokio::test]
async fn test_agent_exits_when_the_watcher_fails() {
    let dir = TempDir::new().unwrap();
    let etc = dir.path().join("etc");
    std::fs::create_dir_all(etc.join("modules")).unwrap();
    std::fs::write(etc.join("linupdate.yml"), "modules:\n  enabled:\n    - reposerver\n").unwrap();
    std::fs::write(
        etc.join("modules/reposerver.yml"),
        "reposerver:\n  url: http://127.0.0.1:9\nclient:\n  auth:\n    id: host\n    token: secret\nagent:\n  enabled: true\n  listen:\n    enabled: false\n",
    )
    .unwrap();
    let log = dir.path().join("history.log");
    std::fs::write(&log, "").unwrap();

    let mut agent = ReposerverAgent::new(
        ConfigSource::new(&etc),
        RuntimePaths::new(dir.path().join("requests"), dir.path()),
        Timings::default(),
    )
    .with_log_files(vec![log.clone()]);
    let manager: Arc<dyn PackageManager> = Arc::new(MockPackageManager::default());

    assert_eq!(agent.tick(&manager, 1).await.unwrap(), None);
    tokio::time::sleep(Duration::from_millis(300)).await;

    // logrotate: move the file away and start a new one
    std::fs::rename(&log, dir.path().join("history.log.1")).unwrap();
    std::fs::write(&log, "").unwrap();

    for _ in 0..300 {
        match agent.tick(&manager, 1).await {
            Ok(None) => tokio::time::sleep(Duration::from_millis(10)).await,
            Ok(Some(exit)) => panic!("unexpected exit {exit:?}"),
            Err(e) => {
                assert!(format!("{e:#}").contains("Package log watcher failed"), "{e:#}");
                return;
            }
        }
    }
    panic!("watcher failure was never raised");
}
