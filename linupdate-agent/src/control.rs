//! Control agent - request dispatch over the control connection
//!
//! Every request with an id that has side effects is written to the request
//! ledger before anything is sent for it. Sending is best-effort: whatever
//! could not be delivered stays in the ledger and is flushed once the next
//! connection is authenticated.
//!
//! Messages are handled strictly one after the other, and the flush pass runs
//! on the same path, so a flush never races a live request.

use crate::channel::{ChannelError, ConnectionHandler, ConnectionState, Outbox};
use crate::config::{Identity, Timings};
use crate::coordinator::{RestartCoordinator, REQUEST_LOCK};
use crate::ledger::{Field, LedgerError, RequestLedger, RequestStatus};
use crate::package::{PackageService, Selection, UpdateOutcome};
use crate::protocol::{
    self, Inbound, Outbound, Request, RequestKind, ResponseEnvelope, INFO_AUTHENTICATED, INFO_RESPONSE_RECEIVED,
};
use crate::reporter::StatusPush;
use crate::status::ProgressHandle;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const INTERRUPTED_ERROR: &str = "request was interrupted before completion";

/// What one flush pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: Vec<String>,
    pub skipped: Vec<String>,
    pub removed_empty: Vec<String>,
    pub failed: Vec<String>,
}

pub struct ControlAgent {
    identity: Identity,
    ledger: RequestLedger,
    coordinator: RestartCoordinator,
    packages: Arc<PackageService>,
    reporter: Arc<dyn StatusPush>,
    progress: ProgressHandle,
    timings: Timings,
    state: ConnectionState,
    last_flush: Option<Instant>,
}

impl ControlAgent {
    pub fn new(
        identity: Identity,
        ledger: RequestLedger,
        coordinator: RestartCoordinator,
        packages: Arc<PackageService>,
        reporter: Arc<dyn StatusPush>,
        progress: ProgressHandle,
        timings: Timings,
    ) -> Self {
        Self {
            identity,
            ledger,
            coordinator,
            packages,
            reporter,
            progress,
            timings,
            state: ConnectionState::Disconnected,
            last_flush: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    /// Mark the connection as being established.
    pub fn connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    /// Parse one inbound frame and handle each item it carries.
    pub async fn handle_message(&mut self, out: &dyn Outbox, raw: &str) {
        let messages = match protocol::parse(raw) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Ignoring malformed message from reposerver: {}", e);
                return;
            }
        };

        for message in messages {
            match message {
                Inbound::Request(request) => self.handle_request(out, request).await,
                Inbound::UnknownRequest { id, name } => self.handle_unknown(out, id, &name).await,
                Inbound::Info { text, request_id, data } => {
                    self.handle_info(out, &text, request_id.as_deref(), &data).await
                }
                Inbound::Error { text } => error!("Received error message from reposerver: {}", text),
            }
        }
    }

    async fn handle_request(&mut self, out: &dyn Outbox, request: Request) {
        let Request { id, kind, payload } = request;

        if kind == RequestKind::Authenticate {
            info!("Authenticating to the reposerver");
            let auth = Outbound::Authenticate {
                id: self.identity.id.clone(),
                token: self.identity.token.clone(),
            };
            if let Err(e) = out.send(&auth).await {
                warn!("Could not send authentication: {}", e);
            }
            return;
        }

        match kind {
            RequestKind::GeneralInfo | RequestKind::PackagesInfo => self.handle_status_request(out, id, kind).await,
            RequestKind::UpdateAllPackages | RequestKind::UpdateSelectedPackages => match id {
                Some(id) => self.handle_update(out, &id, kind, &payload).await,
                None => warn!("Ignoring {} request without request id", kind.wire_name()),
            },
            RequestKind::Authenticate => {}
        }
    }

    /// Read-only requests answer directly; only an undeliverable answer is persisted.
    async fn handle_status_request(&mut self, out: &dyn Outbox, id: Option<String>, kind: RequestKind) {
        let result = match kind {
            RequestKind::GeneralInfo => {
                info!("Reposerver requested general informations");
                self.reporter.send_general_info().await
            }
            _ => {
                info!("Reposerver requested packages informations");
                self.reporter.send_packages_info().await
            }
        };

        let error = result.err().map(|e| format!("{e:#}"));
        if let Some(e) = &error {
            error!("{} request failed: {}", kind.wire_name(), e);
        }

        let Some(id) = id else {
            return;
        };
        let envelope = ResponseEnvelope {
            request_id: id.clone(),
            status: if error.is_some() {
                RequestStatus::Failed
            } else {
                RequestStatus::Completed
            },
            summary: None,
            error,
            log: None,
        };

        if let Err(e) = out.send(&Outbound::Response(envelope.clone())).await {
            warn!(request_id = %id, "Could not send response, keeping it for later: {}", e);
            if let Err(e) = self.persist_envelope(&envelope) {
                error!(request_id = %id, "Could not persist response: {}", e);
            }
        }
    }

    fn persist_envelope(&self, envelope: &ResponseEnvelope) -> Result<(), LedgerError> {
        let id = &envelope.request_id;
        if let Some(error) = &envelope.error {
            self.ledger.write(id, Field::Error, error)?;
        }
        self.ledger.write_status(id, envelope.status)
    }

    async fn handle_unknown(&mut self, out: &dyn Outbox, id: Option<String>, name: &str) {
        let message = format!("unknown request sent by reposerver: {name}");
        error!("{}", message);
        let Some(id) = id else {
            return;
        };

        let outcome = UpdateOutcome {
            log: String::new(),
            summary: Value::Null,
            error: Some(message),
        };
        self.finish_request(out, &id, outcome).await;
    }

    async fn handle_update(&mut self, out: &dyn Outbox, id: &str, kind: RequestKind, payload: &Value) {
        match kind {
            RequestKind::UpdateAllPackages => info!(request_id = %id, "Reposerver requested all packages update"),
            _ => info!(request_id = %id, "Reposerver requested packages update"),
        }

        if let Err(e) = self.ledger.create(id) {
            error!(request_id = %id, "Could not create request record: {}", e);
        }

        let selection = match kind {
            RequestKind::UpdateSelectedPackages => protocol::selected_packages(payload).map(Selection::Packages),
            _ => Ok(Selection::All),
        };
        let request = selection.and_then(|selection| Ok((selection, protocol::update_params(payload)?)));
        let (selection, params) = match request {
            Ok(request) => request,
            Err(e) => {
                let outcome = UpdateOutcome {
                    log: String::new(),
                    summary: Value::Null,
                    error: Some(format!("invalid request: {e}")),
                };
                self.finish_request(out, id, outcome).await;
                return;
            }
        };

        if let Err(e) = self.ledger.write_status(id, RequestStatus::Running) {
            error!(request_id = %id, "Could not write request status: {}", e);
        }
        if let Err(e) = out.send(&Outbound::Response(ResponseEnvelope::running(id))).await {
            warn!(request_id = %id, "Could not send running status: {}", e);
        }

        let outcome = match self.coordinator.guard(REQUEST_LOCK) {
            Ok(_lock) => self.packages.update(&selection, &params, &self.progress).await,
            Err(e) => UpdateOutcome {
                log: String::new(),
                summary: Value::Null,
                error: Some(format!("could not create request lock: {e}")),
            },
        };

        self.finish_request(out, id, outcome).await;
    }

    /// Persist the outcome (status last) and then send it from the ledger.
    async fn finish_request(&mut self, out: &dyn Outbox, id: &str, outcome: UpdateOutcome) {
        let status = if outcome.succeeded() {
            RequestStatus::Completed
        } else {
            RequestStatus::Failed
        };

        match status {
            RequestStatus::Completed => info!(request_id = %id, "Request completed"),
            _ => warn!(
                request_id = %id,
                "Request failed: {}",
                outcome.error.as_deref().unwrap_or_default()
            ),
        }

        let persisted = self.persist_outcome(id, &outcome, status);
        let envelope = match persisted {
            Ok(()) => self
                .ledger
                .read_all(id)
                .ok()
                .and_then(|record| ResponseEnvelope::from_record(&record)),
            Err(e) => {
                error!(request_id = %id, "Could not persist request outcome: {}", e);
                None
            }
        };

        let envelope = envelope.unwrap_or_else(|| ResponseEnvelope {
            request_id: id.to_string(),
            status,
            summary: (!outcome.summary.is_null()).then(|| outcome.summary.clone()),
            error: outcome.error.clone(),
            log: Some(protocol::clean_log(&outcome.log)).filter(|log| !log.is_empty()),
        });

        if let Err(e) = out.send(&Outbound::Response(envelope)).await {
            warn!(request_id = %id, "Could not send request result, it will be sent on reconnect: {}", e);
        }
    }

    fn persist_outcome(&self, id: &str, outcome: &UpdateOutcome, status: RequestStatus) -> Result<(), LedgerError> {
        if !outcome.log.is_empty() {
            self.ledger.write(id, Field::Log, &outcome.log)?;
        }
        if !outcome.summary.is_null() {
            self.ledger.write_summary(id, &outcome.summary)?;
        }
        if let Some(error) = &outcome.error {
            self.ledger.write(id, Field::Error, error)?;
        }
        self.ledger.write_status(id, status)
    }

    async fn handle_info(&mut self, out: &dyn Outbox, text: &str, request_id: Option<&str>, data: &Value) {
        info!("Received info message from reposerver: {}", text);

        if text == INFO_AUTHENTICATED {
            self.state = ConnectionState::Authenticated;
            self.send_remaining_requests_logs(out, SystemTime::now()).await;
            return;
        }

        if text == INFO_RESPONSE_RECEIVED {
            let Some(id) = request_id else {
                return;
            };
            let fields: Vec<Field> = data
                .get("received")
                .and_then(Value::as_array)
                .map(|names| names.iter().filter_map(Value::as_str).filter_map(Field::from_name).collect())
                .unwrap_or_default();

            let result = if fields.is_empty() {
                self.ledger.delete(id)
            } else {
                self.ledger.delete_fields(id, &fields)
            };
            match result {
                Ok(()) => debug!(request_id = %id, "Acknowledged request record cleaned up"),
                Err(e) => warn!(request_id = %id, "Could not clean up acknowledged record: {}", e),
            }
        }
    }

    /// Send every ledger record older than the age guard, then delete it.
    pub async fn send_remaining_requests_logs(&mut self, out: &dyn Outbox, now: SystemTime) -> FlushReport {
        let mut report = FlushReport::default();
        if !self.is_authenticated() {
            return report;
        }
        self.last_flush = Some(Instant::now());

        let ids = match self.ledger.list() {
            Ok(ids) => ids,
            Err(e) => {
                error!("Could not list request records: {}", e);
                return report;
            }
        };

        for id in ids {
            match self.flush_one(out, &id, now).await {
                Ok(FlushAction::Sent) => report.sent.push(id),
                Ok(FlushAction::Skipped) => report.skipped.push(id),
                Ok(FlushAction::RemovedEmpty) => report.removed_empty.push(id),
                Err(e) => {
                    warn!(request_id = %id, "Could not flush request record: {}", e);
                    report.failed.push(id);
                }
            }
        }

        if !report.sent.is_empty() {
            info!("Sent {} pending request results to the reposerver", report.sent.len());
        }
        report
    }

    async fn flush_one(&mut self, out: &dyn Outbox, id: &str, now: SystemTime) -> anyhow::Result<FlushAction> {
        if self.ledger.age(id, now)? < self.timings.ledger_age_guard {
            return Ok(FlushAction::Skipped);
        }

        let mut record = self.ledger.read_all(id)?;
        if record.is_empty() {
            self.ledger.delete(id)?;
            return Ok(FlushAction::RemovedEmpty);
        }

        // Past the age guard a missing or running status means the agent died mid-request
        if !record.status.is_some_and(|status| status.is_final()) {
            self.ledger.write(id, Field::Error, INTERRUPTED_ERROR)?;
            self.ledger.write_status(id, RequestStatus::Failed)?;
            record = self.ledger.read_all(id)?;
        }

        let envelope = ResponseEnvelope::from_record(&record)
            .ok_or_else(|| anyhow::anyhow!("record {} has no status", id))?;
        out.send(&Outbound::Response(envelope)).await?;
        self.ledger.delete(id)?;
        Ok(FlushAction::Sent)
    }
}

enum FlushAction {
    Sent,
    Skipped,
    RemovedEmpty,
}

#[async_trait]
impl ConnectionHandler for ControlAgent {
    async fn on_open(&mut self, out: &dyn Outbox) {
        self.state = ConnectionState::Open;
        if let Err(e) = out.send(&Outbound::ConnectionType).await {
            warn!("Could not announce connection type: {}", e);
        }
    }

    async fn on_message(&mut self, out: &dyn Outbox, text: &str) {
        self.handle_message(out, text).await;
    }

    async fn on_tick(&mut self, out: &dyn Outbox) {
        let due = self
            .last_flush
            .map_or(true, |at| at.elapsed() >= self.timings.flush_interval);
        if self.is_authenticated() && due {
            self.send_remaining_requests_logs(out, SystemTime::now()).await;
        }
    }

    async fn on_error(&mut self, error: &ChannelError) {
        self.state = ConnectionState::Disconnected;
        warn!("Reposerver connection error: {}", error);
    }

    async fn on_close(&mut self, code: Option<u16>, reason: &str) {
        self.state = ConnectionState::Disconnected;
        info!(
            "Reposerver websocket connection closed with status code: {} and message: {}",
            code.map(|code| code.to_string()).unwrap_or_else(|| "none".into()),
            reason
        );
    }
}
