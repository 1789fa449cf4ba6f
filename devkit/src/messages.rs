/*!
Builders for the JSON messages the fleet server sends to the agent
*/

use serde_json::{json, Value};

pub fn authenticate() -> String {
    json!({ "request": "authenticate" }).to_string()
}

pub fn general_info(request_id: &str) -> String {
    json!({ "request": "request-general-infos", "request-id": request_id }).to_string()
}

pub fn packages_info(request_id: &str) -> String {
    json!({ "request": "request-packages-infos", "request-id": request_id }).to_string()
}

/// `update-params` object with only `dry-run` set.
pub fn dry_run(enabled: bool) -> Value {
    json!({ "dry-run": enabled })
}

pub fn update_all(request_id: &str, params: Value) -> String {
    json!({
        "request": "request-all-packages-update",
        "request-id": request_id,
        "data": { "update-params": params },
    })
    .to_string()
}

pub fn update_packages(request_id: &str, packages: &[&str], params: Value) -> String {
    json!({
        "request": "request-packages-update",
        "request-id": request_id,
        "data": { "packages": packages, "update-params": params },
    })
    .to_string()
}

pub fn unknown_request(request_id: &str, name: &str) -> String {
    json!({ "request": name, "request-id": request_id }).to_string()
}

pub fn authenticated() -> String {
    json!({ "info": "Authentication successful" }).to_string()
}

/// Acknowledgement of a response; an empty field list acknowledges the whole record.
pub fn response_received(request_id: &str, fields: &[&str]) -> String {
    if fields.is_empty() {
        return json!({ "info": "Request response received", "request-id": request_id }).to_string();
    }
    json!({
        "info": "Request response received",
        "request-id": request_id,
        "data": { "received": fields },
    })
    .to_string()
}

pub fn error(text: &str) -> String {
    json!({ "error": text }).to_string()
}
