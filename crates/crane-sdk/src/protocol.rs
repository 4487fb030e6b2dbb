use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Event names used on the real-time channel, in both directions.
pub mod events {
    pub const REGISTER: &str = "register";
    pub const REQUEST_CONTROL: &str = "request-control";
    pub const REASSIGN_CONTROL: &str = "reassign-control";
    pub const RELEASE_CONTROL: &str = "release-control";
    pub const CHECK_ACCESS: &str = "check-access";
    pub const REFRESH_STATUS: &str = "refresh-status";
    pub const RELAY_TEXT: &str = "relay-text";
    pub const LOCATION_UPDATE: &str = "location-update";
    pub const LOCATION_QUERY: &str = "location-query";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const EXIT: &str = "exit";
    pub const FORCE_MAP_UPDATE: &str = "force-map-update";
    pub const STATUS_NOTIFY: &str = "status-notify";
}

/// Crane state as seen by one operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CraneStatus {
    Free,
    Using,
    Occupied,
    Disconnected,
}

impl CraneStatus {
    /// Holder sees `Using`, everyone else `Occupied`, everyone `Free` if unheld.
    pub fn for_viewer(holder: Option<&str>, viewer: &str) -> Self {
        match holder {
            None => CraneStatus::Free,
            Some(h) if h == viewer => CraneStatus::Using,
            Some(_) => CraneStatus::Occupied,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CraneStatus::Free => "free",
            CraneStatus::Using => "using",
            CraneStatus::Occupied => "occupied",
            CraneStatus::Disconnected => "disconnected",
        }
    }
}

/// Binary answer to a request/response pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Success,
    Fail,
}

impl Reply {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reply::Success => "success",
            Reply::Fail => "fail",
        }
    }

    pub fn to_value(self) -> Value {
        Value::String(self.as_str().to_string())
    }
}

impl From<bool> for Reply {
    fn from(ok: bool) -> Self {
        if ok { Reply::Success } else { Reply::Fail }
    }
}

/// Per-observer status push: `{action, <craneId>: status, craneId, currentOccupiedId, userName?}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEnvelope {
    pub action: &'static str,
    pub crane_id: String,
    pub status: CraneStatus,
    pub current_occupied_id: Option<String>,
    pub user_name: Option<String>,
}

impl StatusEnvelope {
    pub const STATUS_ACTION: &'static str = "crane_status";
    pub const CHECK_ACTION: &'static str = "check_access";

    /// Envelope fields win over a crane id that shares their name.
    pub fn to_value(&self) -> Value {
        let mut body = crane_keyed(&self.crane_id, self.status);
        body["action"] = json!(self.action);
        body["craneId"] = json!(self.crane_id);
        body["currentOccupiedId"] = json!(self.current_occupied_id);
        if let Some(name) = &self.user_name {
            body["userName"] = Value::String(name.clone());
        }
        body
    }
}

fn crane_keyed(crane_id: &str, status: CraneStatus) -> Value {
    let mut body = json!({});
    body[crane_id] = Value::String(status.as_str().to_string());
    body
}

fn with_fields(mut body: Value, fields: Value) -> Value {
    if let (Some(body), Value::Object(fields)) = (body.as_object_mut(), fields) {
        body.extend(fields);
    }
    body
}

/// Broadcast sent to everyone when a lease lapses on its own.
pub fn control_expired_notice(crane_id: &str, expired_at: i64) -> Value {
    with_fields(
        crane_keyed(crane_id, CraneStatus::Free),
        json!({
            "action": "control_expired",
            "craneId": crane_id,
            "currentOccupiedId": Value::Null,
            "expiredAt": expired_at,
            "reason": "control_expired",
        }),
    )
}

/// Broadcast sent to everyone when an agent connection drops.
pub fn agent_offline_notice(crane_id: &str) -> Value {
    with_fields(
        crane_keyed(crane_id, CraneStatus::Disconnected),
        json!({
            "action": "agent_offline",
            "craneId": crane_id,
        }),
    )
}
