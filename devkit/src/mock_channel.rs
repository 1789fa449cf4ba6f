/*!
Mock outbound channel for the control agent

Records every message the agent sends and can simulate a dropped
connection, immediately or after a number of successful sends. With a
ledger attached it also records, for each response, the status the
ledger held for that request at the moment of sending.
*/

use async_trait::async_trait;
use linupdate_agent::channel::{ChannelError, Outbox};
use linupdate_agent::ledger::{RequestLedger, RequestStatus};
use linupdate_agent::protocol::{Outbound, ResponseEnvelope};
use parking_lot::Mutex;
use std::sync::Arc;

/// Ledger status of a request observed when its response was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSnapshot {
    pub request_id: String,
    pub sent_status: RequestStatus,
    pub ledger_status: Option<RequestStatus>,
}

#[derive(Default)]
struct OutboxState {
    disconnected: bool,
    sends_before_drop: Option<usize>,
    sent: Vec<Outbound>,
    rejected: usize,
    ledger: Option<RequestLedger>,
    snapshots: Vec<SendSnapshot>,
}

#[derive(Clone, Default)]
pub struct MockOutbox {
    state: Arc<Mutex<OutboxState>>,
}

impl MockOutbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the ledger status of every response at send time.
    pub fn with_ledger_snapshot(self, ledger: RequestLedger) -> Self {
        self.state.lock().ledger = Some(ledger);
        self
    }

    pub fn disconnect(&self) {
        self.state.lock().disconnected = true;
    }

    /// Accept `sends` more messages, then behave as disconnected.
    pub fn drop_after(&self, sends: usize) {
        self.state.lock().sends_before_drop = Some(sends);
    }

    pub fn reconnect(&self) {
        let mut state = self.state.lock();
        state.disconnected = false;
        state.sends_before_drop = None;
    }

    pub fn is_connected(&self) -> bool {
        !self.state.lock().disconnected
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.state.lock().sent.clone()
    }

    /// Number of sends refused while disconnected.
    pub fn rejected(&self) -> usize {
        self.state.lock().rejected
    }

    pub fn responses(&self) -> Vec<ResponseEnvelope> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|message| match message {
                Outbound::Response(envelope) => Some(envelope.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn responses_for(&self, request_id: &str) -> Vec<ResponseEnvelope> {
        self.responses()
            .into_iter()
            .filter(|envelope| envelope.request_id == request_id)
            .collect()
    }

    pub fn snapshots(&self) -> Vec<SendSnapshot> {
        self.state.lock().snapshots.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.sent.clear();
        state.snapshots.clear();
        state.rejected = 0;
    }
}

#[async_trait]
impl Outbox for MockOutbox {
    async fn send(&self, message: &Outbound) -> Result<(), ChannelError> {
        let mut state = self.state.lock();

        if let Some(remaining) = state.sends_before_drop {
            if remaining == 0 {
                state.disconnected = true;
                state.sends_before_drop = None;
            } else {
                state.sends_before_drop = Some(remaining - 1);
            }
        }
        if state.disconnected {
            state.rejected += 1;
            tracing::debug!("[MOCK] dropped {}", message.to_json());
            return Err(ChannelError::Closed);
        }

        if let Outbound::Response(envelope) = message {
            if let Some(ledger) = &state.ledger {
                let ledger_status = ledger.read_all(&envelope.request_id).ok().and_then(|record| record.status);
                let snapshot = SendSnapshot {
                    request_id: envelope.request_id.clone(),
                    sent_status: envelope.status,
                    ledger_status,
                };
                state.snapshots.push(snapshot);
            }
        }

        tracing::debug!("[MOCK] sent {}", message.to_json());
        state.sent.push(message.clone());
        Ok(())
    }
}
