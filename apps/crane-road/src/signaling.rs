use crane_sdk::protocol::events;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire envelope of every text frame, both directions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRegister {
    pub name: String,
    #[serde(default)]
    pub map_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CraneRequest {
    pub crane_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reassign {
    pub crane_id: String,
    pub from_user_id: String,
    pub to_user_id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub user_id: String,
    pub place_id: String,
    pub location: Value,
    #[serde(default)]
    pub user_info: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationQuery {
    pub place_id: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Exit {
    pub user_id: String,
    #[serde(default)]
    pub place_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForceMapUpdate {
    pub crane_id: String,
}

/// Inbound text events after validation.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Register(AgentRegister),
    RequestControl(CraneRequest),
    ReassignControl(Reassign),
    ReleaseControl(CraneRequest),
    CheckAccess(CraneRequest),
    RefreshStatus(CraneRequest),
    RelayText(Value),
    LocationUpdate(LocationUpdate),
    LocationQuery(LocationQuery),
    Heartbeat,
    Exit(Exit),
    /// The whole payload travels on to the agent.
    ForceMapUpdate { request: ForceMapUpdate, payload: Value },
}

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("invalid envelope: {0}")]
    Envelope(serde_json::Error),
    #[error("unknown event {0}")]
    UnknownEvent(String),
    #[error("invalid {event} payload: {source}")]
    Payload {
        event: String,
        source: serde_json::Error,
    },
    #[error("{event} without {field}")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },
}

fn payload<T: for<'de> Deserialize<'de>>(event: &str, data: Value) -> Result<T, SignalError> {
    serde_json::from_value(data).map_err(|source| SignalError::Payload {
        event: event.to_string(),
        source,
    })
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, SignalError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(SignalError::Envelope)?;
        Self::from_envelope(envelope)
    }

    pub fn from_envelope(envelope: Envelope) -> Result<Self, SignalError> {
        let Envelope { event, data } = envelope;
        let parsed = match event.as_str() {
            events::REGISTER => ClientEvent::Register(payload(&event, data)?),
            events::REQUEST_CONTROL => ClientEvent::RequestControl(payload(&event, data)?),
            events::REASSIGN_CONTROL => ClientEvent::ReassignControl(payload(&event, data)?),
            events::RELEASE_CONTROL => ClientEvent::ReleaseControl(payload(&event, data)?),
            events::CHECK_ACCESS => ClientEvent::CheckAccess(payload(&event, data)?),
            events::REFRESH_STATUS => ClientEvent::RefreshStatus(payload(&event, data)?),
            events::RELAY_TEXT => ClientEvent::RelayText(data),
            events::LOCATION_UPDATE => ClientEvent::LocationUpdate(payload(&event, data)?),
            events::LOCATION_QUERY => ClientEvent::LocationQuery(payload(&event, data)?),
            events::HEARTBEAT => ClientEvent::Heartbeat,
            events::EXIT => ClientEvent::Exit(payload(&event, data)?),
            events::FORCE_MAP_UPDATE => ClientEvent::ForceMapUpdate {
                request: payload(&event, data.clone())?,
                payload: data,
            },
            _ => return Err(SignalError::UnknownEvent(event)),
        };
        parsed.require_fields()?;
        Ok(parsed)
    }

    /// Empty identifiers count as absent.
    fn require_fields(&self) -> Result<(), SignalError> {
        let fields: Vec<(&'static str, &str)> = match self {
            ClientEvent::Register(r) => vec![("name", r.name.as_str())],
            ClientEvent::RequestControl(r)
            | ClientEvent::ReleaseControl(r)
            | ClientEvent::CheckAccess(r)
            | ClientEvent::RefreshStatus(r) => {
                vec![("craneId", r.crane_id.as_str()), ("userId", r.user_id.as_str())]
            }
            ClientEvent::ReassignControl(r) => vec![
                ("craneId", r.crane_id.as_str()),
                ("fromUserId", r.from_user_id.as_str()),
                ("toUserId", r.to_user_id.as_str()),
            ],
            ClientEvent::LocationUpdate(l) => {
                vec![("userId", l.user_id.as_str()), ("placeId", l.place_id.as_str())]
            }
            ClientEvent::LocationQuery(q) => vec![("placeId", q.place_id.as_str())],
            ClientEvent::Exit(e) => vec![("userId", e.user_id.as_str())],
            ClientEvent::ForceMapUpdate { request, .. } => vec![("craneId", request.crane_id.as_str())],
            ClientEvent::RelayText(_) | ClientEvent::Heartbeat => Vec::new(),
        };
        match fields.into_iter().find(|(_, value)| value.is_empty()) {
            Some((field, _)) => Err(SignalError::MissingField {
                event: self.name(),
                field,
            }),
            None => Ok(()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Register(_) => events::REGISTER,
            ClientEvent::RequestControl(_) => events::REQUEST_CONTROL,
            ClientEvent::ReassignControl(_) => events::REASSIGN_CONTROL,
            ClientEvent::ReleaseControl(_) => events::RELEASE_CONTROL,
            ClientEvent::CheckAccess(_) => events::CHECK_ACCESS,
            ClientEvent::RefreshStatus(_) => events::REFRESH_STATUS,
            ClientEvent::RelayText(_) => events::RELAY_TEXT,
            ClientEvent::LocationUpdate(_) => events::LOCATION_UPDATE,
            ClientEvent::LocationQuery(_) => events::LOCATION_QUERY,
            ClientEvent::Heartbeat => events::HEARTBEAT,
            ClientEvent::Exit(_) => events::EXIT,
            ClientEvent::ForceMapUpdate { .. } => events::FORCE_MAP_UPDATE,
        }
    }

    /// The `userId` an operator event claims to act for, if any.
    pub fn claimed_user(&self) -> Option<&str> {
        match self {
            ClientEvent::RequestControl(r)
            | ClientEvent::ReleaseControl(r)
            | ClientEvent::CheckAccess(r)
            | ClientEvent::RefreshStatus(r) => Some(&r.user_id),
            ClientEvent::ReassignControl(r) => Some(&r.from_user_id),
            ClientEvent::LocationUpdate(l) => Some(&l.user_id),
            ClientEvent::Exit(e) => Some(&e.user_id),
            _ => None,
        }
    }
}
