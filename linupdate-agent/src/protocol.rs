//! Control channel wire protocol (JSON text frames)
//!
//! Inbound frames may carry a `request`, an `info` notice and an `error`
//! notice; each present key becomes one `Inbound` item, in that order.

use crate::ledger::{RequestRecord, RequestStatus};
use crate::package::UpdateParams;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::LazyLock;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("invalid value for '{field}': {value}")]
    InvalidField { field: String, value: String },
    #[error("no packages specified")]
    NoPackages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Authenticate,
    GeneralInfo,
    PackagesInfo,
    UpdateAllPackages,
    UpdateSelectedPackages,
}

impl RequestKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            RequestKind::Authenticate => "authenticate",
            RequestKind::GeneralInfo => "request-general-infos",
            RequestKind::PackagesInfo => "request-packages-infos",
            RequestKind::UpdateAllPackages => "request-all-packages-update",
            RequestKind::UpdateSelectedPackages => "request-packages-update",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        [
            RequestKind::Authenticate,
            RequestKind::GeneralInfo,
            RequestKind::PackagesInfo,
            RequestKind::UpdateAllPackages,
            RequestKind::UpdateSelectedPackages,
        ]
        .into_iter()
        .find(|kind| kind.wire_name() == name)
    }
}

/// Inbound unit of work; the authentication handshake has no id.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Option<String>,
    pub kind: RequestKind,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request(Request),
    UnknownRequest { id: Option<String>, name: String },
    Info { text: String, request_id: Option<String>, data: Value },
    Error { text: String },
}

/// CSI, OSC, charset selection and two-byte escape sequences.
static TERMINAL_ESCAPES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[()*+][0-9A-Za-z]|\x1b[@-Z\\-_]")
        .expect("Invalid terminal escape regex")
});

pub const INFO_AUTHENTICATED: &str = "Authentication successful";
pub const INFO_RESPONSE_RECEIVED: &str = "Request response received";

/// Request ids arrive as strings or numbers.
fn request_id(object: &Map<String, Value>) -> Option<String> {
    match object.get("request-id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

pub fn parse(raw: &str) -> Result<Vec<Inbound>, ProtocolError> {
    let value: Value = serde_json::from_str(raw)?;
    let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;
    let id = request_id(object);
    let data = object.get("data").cloned().unwrap_or(Value::Null);
    let mut messages = Vec::new();

    if let Some(request) = object.get("request") {
        let name = text(request);
        messages.push(match RequestKind::from_wire(&name) {
            Some(kind) => Inbound::Request(Request {
                id: id.clone(),
                kind,
                payload: data.clone(),
            }),
            None => Inbound::UnknownRequest { id: id.clone(), name },
        });
    }

    if let Some(info) = object.get("info") {
        messages.push(Inbound::Info {
            text: text(info),
            request_id: id.clone(),
            data,
        });
    }

    if let Some(error) = object.get("error") {
        messages.push(Inbound::Error { text: text(error) });
    }

    Ok(messages)
}

fn flag(params: &Map<String, Value>, field: &str, default: bool) -> Result<bool, ProtocolError> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(Value::Bool(value)) => Ok(*value),
        Some(Value::String(value)) => match value.trim().to_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            "" => Ok(default),
            _ => Err(ProtocolError::InvalidField {
                field: field.to_string(),
                value: value.clone(),
            }),
        },
        Some(other) => Err(ProtocolError::InvalidField {
            field: field.to_string(),
            value: other.to_string(),
        }),
    }
}

/// `data.update-params` of an update request; missing flags take their defaults.
pub fn update_params(payload: &Value) -> Result<UpdateParams, ProtocolError> {
    let defaults = UpdateParams::default();
    let empty = Map::new();
    let params = match payload.get("update-params") {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(params)) => params,
        Some(other) => {
            return Err(ProtocolError::InvalidField {
                field: "update-params".into(),
                value: other.to_string(),
            })
        }
    };

    Ok(UpdateParams {
        dry_run: flag(params, "dry-run", defaults.dry_run)?,
        ignore_exclusions: flag(params, "ignore-exclusions", defaults.ignore_exclusions)?,
        keep_config_files: flag(params, "keep-config-files", defaults.keep_config_files)?,
        full_upgrade: flag(params, "full-upgrade", defaults.full_upgrade)?,
    })
}

/// Package names of `data.packages`, given as strings or `{"name": ...}` objects.
pub fn selected_packages(payload: &Value) -> Result<Vec<String>, ProtocolError> {
    let names: Vec<String> = payload
        .get("packages")
        .and_then(Value::as_array)
        .map(|packages| {
            packages
                .iter()
                .filter_map(|package| match package {
                    Value::String(name) => Some(name.trim().to_string()),
                    Value::Object(object) => object.get("name").and_then(Value::as_str).map(|name| name.trim().to_string()),
                    _ => None,
                })
                .filter(|name| !name.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if names.is_empty() {
        return Err(ProtocolError::NoPackages);
    }
    Ok(names)
}

/// `response-to-request` body for a request id.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub status: RequestStatus,
    pub summary: Option<Value>,
    pub error: Option<String>,
    pub log: Option<String>,
}

impl ResponseEnvelope {
    pub fn running(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            status: RequestStatus::Running,
            summary: None,
            error: None,
            log: None,
        }
    }

    /// Envelope of a persisted record, `None` while it has no status.
    pub fn from_record(record: &RequestRecord) -> Option<Self> {
        Some(Self {
            request_id: record.id.clone(),
            status: record.status?,
            summary: record.summary.clone(),
            error: record.error.clone(),
            log: record.log.as_deref().map(clean_log).filter(|log| !log.is_empty()),
        })
    }

    fn to_value(&self) -> Value {
        let mut body = Map::new();
        body.insert("request-id".into(), json!(self.request_id));
        body.insert("status".into(), json!(self.status.as_str()));
        if let Some(summary) = &self.summary {
            body.insert("summary".into(), summary.clone());
        }
        if let Some(error) = &self.error {
            body.insert("error".into(), json!(error));
        }
        if let Some(log) = &self.log {
            body.insert("log".into(), json!(log));
        }
        Value::Object(body)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    ConnectionType,
    Authenticate { id: String, token: String },
    Response(ResponseEnvelope),
}

impl Outbound {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Outbound::Response(envelope) => Some(envelope.request_id.as_str()),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Outbound::ConnectionType => json!({ "connection-type": "host" }),
            Outbound::Authenticate { id, token } => json!({
                "response-to-request": {
                    "request": "authenticate",
                    "auth-id": id,
                    "token": token,
                }
            }),
            Outbound::Response(envelope) => json!({ "response-to-request": envelope.to_value() }),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

/// Strip terminal escape sequences and resolve carriage-return overwrites.
pub fn clean_log(raw: &str) -> String {
    let stripped = TERMINAL_ESCAPES.replace_all(raw, "");

    let lines: Vec<String> = stripped
        .replace("\r\n", "\n")
        .split('\n')
        .map(|line| {
            let visible = line
                .split('\r')
                .filter(|segment| !segment.is_empty())
                .last()
                .unwrap_or_default();
            visible
                .chars()
                .filter(|c| !c.is_control() || *c == '\t')
                .collect::<String>()
                .trim_end()
                .to_string()
        })
        .collect();

    lines.join("\n").trim().to_string()
}
