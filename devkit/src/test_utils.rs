/*!
Test harness for the reposerver control agent

Wires a `ControlAgent` to a temporary ledger and runtime directory, a mock
outbound channel, a mock package manager and a mock reporter. Messages are
fed straight into the agent, the way the connection loop would.
*/

use crate::mock_channel::MockOutbox;
use crate::mock_packages::{MockPackageManager, MockReporter};
use linupdate_agent::channel::{ChannelError, ConnectionHandler, ConnectionState};
use linupdate_agent::config::{ExcludeSection, Identity, Timings};
use linupdate_agent::control::{ControlAgent, FlushReport};
use linupdate_agent::coordinator::RestartCoordinator;
use linupdate_agent::ledger::{RequestLedger, RequestRecord, RequestStatus};
use linupdate_agent::package::{Exclusions, PackageService};
use linupdate_agent::status::ProgressHandle;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

pub const HOST_ID: &str = "host-test";
pub const HOST_TOKEN: &str = "token-test";

/// Complete control agent environment backed by mocks.
pub struct TestHarness {
    pub dir: TempDir,
    pub ledger: RequestLedger,
    pub coordinator: RestartCoordinator,
    pub outbox: MockOutbox,
    pub packages: Arc<MockPackageManager>,
    pub reporter: Arc<MockReporter>,
    pub agent: ControlAgent,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_packages(MockPackageManager::default())
    }

    pub fn with_packages(packages: MockPackageManager) -> Self {
        Self::with_options(packages, ExcludeSection::default(), true)
    }

    pub fn with_options(packages: MockPackageManager, exclude: ExcludeSection, exit_on_error: bool) -> Self {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter("debug")
            .try_init()
            .ok();

        let dir = TempDir::new().expect("temp dir");
        let ledger = RequestLedger::new(dir.path().join("requests"));
        let coordinator = RestartCoordinator::new(dir.path());
        let outbox = MockOutbox::new().with_ledger_snapshot(ledger.clone());
        let packages = Arc::new(packages.with_ledger_snapshot(ledger.clone()));
        let reporter = Arc::new(MockReporter::new());

        let exclusions = Exclusions::from_config(&exclude).expect("valid exclusions");
        let service = Arc::new(PackageService::new(
            packages.clone(),
            exclusions,
            exit_on_error,
            coordinator.clone(),
        ));
        let agent = ControlAgent::new(
            Identity {
                id: HOST_ID.into(),
                token: HOST_TOKEN.into(),
            },
            ledger.clone(),
            coordinator.clone(),
            service,
            reporter.clone(),
            ProgressHandle::new(),
            Timings::default(),
        );

        Self {
            dir,
            ledger,
            coordinator,
            outbox,
            packages,
            reporter,
            agent,
        }
    }

    /// Connection opened: the agent announces itself.
    pub async fn open(&mut self) {
        self.agent.on_open(&self.outbox).await;
    }

    pub async fn receive(&mut self, raw: &str) {
        self.agent.handle_message(&self.outbox, raw).await;
    }

    /// Open the connection and complete authentication (runs the first flush).
    pub async fn connect(&mut self) {
        self.open().await;
        self.receive(&crate::messages::authenticated()).await;
        assert_eq!(self.agent.state(), ConnectionState::Authenticated);
    }

    /// Connection lost: the agent falls back to disconnected.
    pub async fn drop_connection(&mut self) {
        self.outbox.disconnect();
        self.agent
            .on_error(&ChannelError::Transport("connection reset by peer".into()))
            .await;
    }

    /// New connection after a drop, authenticated.
    pub async fn reconnect(&mut self) {
        self.outbox.reconnect();
        self.connect().await;
    }

    /// Flush pass as if run `after` from now.
    pub async fn flush_after(&mut self, after: Duration) -> FlushReport {
        self.agent
            .send_remaining_requests_logs(&self.outbox, SystemTime::now() + after)
            .await
    }

    /// A point in time past the ledger age guard.
    pub fn past_age_guard() -> Duration {
        Timings::default().ledger_age_guard + Duration::from_secs(60)
    }

    /// Move the record's modification time `by` into the past.
    pub fn backdate(&self, request_id: &str, by: Duration) {
        let dir = self.ledger.record_dir(request_id).expect("valid id");
        std::fs::File::open(&dir)
            .and_then(|handle| handle.set_modified(SystemTime::now() - by))
            .expect("backdate record directory");
    }

    pub fn status(&self, request_id: &str) -> Option<RequestStatus> {
        self.ledger.read_all(request_id).ok().and_then(|record| record.status)
    }

    pub fn record(&self, request_id: &str) -> RequestRecord {
        self.ledger.read_all(request_id).expect("readable record")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
