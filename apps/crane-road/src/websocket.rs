use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::auth::authenticate;
use crate::broker::{Broker, Peer};
use crate::registry::Outbound;
use crate::signaling::{ClientEvent, Envelope};

pub type SharedBroker = Arc<Broker>;

/// Handshake parameters. Agents connect with `mode=algorithm`; everyone else
/// is an operator and must present a credential.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl Handshake {
    pub fn is_agent(&self) -> bool {
        self.mode.as_deref() == Some("algorithm")
    }
}

#[derive(Serialize)]
pub struct HealthStatus {
    status: &'static str,
    connections: usize,
    expirations: bool,
}

pub async fn health_check(State(broker): State<SharedBroker>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        connections: broker.hub().len(),
        expirations: broker.watcher().is_running().await,
    })
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(handshake): Query<Handshake>,
    headers: HeaderMap,
    State(broker): State<SharedBroker>,
) -> Response {
    if handshake.is_agent() {
        return ws.on_upgrade(move |socket| handle_socket(socket, broker, Peer::agent(), None));
    }

    let Some(user_id) = handshake.user_id.as_deref() else {
        return (StatusCode::BAD_REQUEST, "userId required").into_response();
    };
    let credential = handshake.credential.as_deref().or_else(|| bearer(&headers));
    let identity = match authenticate(broker.verifier(), credential, user_id) {
        Ok(identity) => identity,
        Err(err) => {
            warn!(user_id, error = %err, "operator handshake rejected");
            return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
        }
    };
    let peer = Peer::operator(&identity.user_id);
    ws.on_upgrade(move |socket| handle_socket(socket, broker, peer, identity.phone_number))
}

fn to_message(outbound: Outbound) -> Option<Message> {
    match outbound {
        Outbound::Event { event, data } => serde_json::to_string(&Envelope::new(event, data))
            .map(Message::Text)
            .map_err(|e| error!("failed to encode outbound event: {}", e))
            .ok(),
        Outbound::Binary(bytes) => Some(Message::Binary(bytes)),
        Outbound::Close => Some(Message::Close(None)),
    }
}

async fn handle_socket(
    socket: WebSocket,
    broker: SharedBroker,
    mut peer: Peer,
    display_name: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = broker.hub().attach(&peer.connection_id);

    let connection_id = peer.connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let closing = matches!(outbound, Outbound::Close);
            if let Some(message) = to_message(outbound) {
                if sender.send(message).await.is_err() {
                    break;
                }
            }
            if closing {
                break;
            }
        }
        debug!("writer task ended for {}", connection_id);
    });

    if let Err(err) = broker.open_operator(&peer, display_name).await {
        error!(connection_id = %peer.connection_id, error = %err, "session not recorded, closing");
        broker.hub().detach(&peer.connection_id);
        writer.abort();
        return;
    }
    debug!(connection_id = %peer.connection_id, role = ?peer.role, "websocket connected");

    while let Some(frame) = receiver.next().await {
        let message = match frame {
            Ok(m) => m,
            Err(e) => {
                debug!("websocket error on {}: {}", peer.connection_id, e);
                break;
            }
        };
        match message {
            Message::Text(text) => match ClientEvent::parse(&text) {
                Ok(event) => broker.handle_event(&mut peer, event).await,
                Err(err) => {
                    warn!(connection_id = %peer.connection_id, error = %err, "unreadable event dropped");
                }
            },
            Message::Binary(data) => broker.handle_binary(&peer, &data).await,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    broker.handle_disconnect(&peer).await;
    writer.abort();
    debug!(connection_id = %peer.connection_id, "websocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_timeout::timeout]
    fn agent_mode_skips_credentials() {
        let handshake = Handshake {
            mode: Some("algorithm".into()),
            ..Handshake::default()
        };
        assert!(handshake.is_agent());
        assert!(!Handshake::default().is_agent());
    }

    #[test_timeout::timeout]
    fn events_become_text_envelopes() {
        let message = to_message(Outbound::event("heartbeat", json!({"at": 1}))).unwrap();
        match message {
            Message::Text(text) => {
                let envelope: Envelope = serde_json::from_str(&text).unwrap();
                assert_eq!(envelope.event, "heartbeat");
                assert_eq!(envelope.data["at"], 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(to_message(Outbound::Close), Some(Message::Close(None))));
    }
}
