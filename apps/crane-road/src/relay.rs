use std::sync::Arc;

use crane_sdk::frame::{with_flag, ControlFrame, BINARY_FLAG};
use crane_sdk::protocol::events;
use crane_sdk::store::{SessionKind, SessionRecord, StoreError};
use serde_json::Value;
use tracing::{debug, info};

use crate::lease::ControlArbiter;
use crate::registry::{ConnectionRegistry, Outbound};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered { to: String },
    /// The counterpart is known but has no live socket on this broker.
    Unreachable { to: String },
    NoCounterpart,
}

/// Best-effort forwarding between an operator and the agent of the crane it
/// controls. Nothing is ever queued.
#[derive(Clone)]
pub struct MessageRelay {
    arbiter: Arc<ControlArbiter>,
    registry: ConnectionRegistry,
}

impl MessageRelay {
    pub fn new(arbiter: Arc<ControlArbiter>, registry: ConnectionRegistry) -> Self {
        Self { arbiter, registry }
    }

    async fn counterpart(
        &self,
        from: &SessionRecord,
    ) -> Result<Option<(SessionKind, String)>, StoreError> {
        Ok(match from.kind {
            SessionKind::Operator => self
                .arbiter
                .find_crane_by_user(&from.entity_id)
                .await?
                .map(|crane| (SessionKind::Agent, crane)),
            SessionKind::Agent => self
                .arbiter
                .find_user_by_crane(&from.entity_id)
                .await?
                .map(|holder| (SessionKind::Operator, holder)),
        })
    }

    async fn deliver(
        &self,
        from: &SessionRecord,
        message: Outbound,
    ) -> Result<RelayOutcome, StoreError> {
        let Some((kind, target)) = self.counterpart(from).await? else {
            return Ok(RelayOutcome::NoCounterpart);
        };
        if self.registry.send_to(kind, &target, message).await? {
            Ok(RelayOutcome::Delivered { to: target })
        } else {
            debug!(from = %from.entity_id, to = %target, "relay target unreachable");
            Ok(RelayOutcome::Unreachable { to: target })
        }
    }

    pub async fn relay_text(
        &self,
        from: &SessionRecord,
        payload: Value,
    ) -> Result<RelayOutcome, StoreError> {
        let outcome = self
            .deliver(from, Outbound::event(events::RELAY_TEXT, payload))
            .await?;
        if outcome == RelayOutcome::NoCounterpart {
            info!(from = %from.entity_id, kind = from.kind.as_str(), "text dropped: no bound counterpart");
        }
        Ok(outcome)
    }

    /// Operator payloads gain the flag byte on their way to the agent; agent
    /// payloads travel back untouched.
    pub async fn relay_binary(
        &self,
        from: &SessionRecord,
        payload: &[u8],
    ) -> Result<RelayOutcome, StoreError> {
        let framed = match from.kind {
            SessionKind::Operator => with_flag(payload),
            SessionKind::Agent => payload.to_vec(),
        };
        let outcome = self.deliver(from, Outbound::Binary(framed)).await?;
        if outcome == RelayOutcome::NoCounterpart {
            log_dropped_frame(from, payload);
        }
        Ok(outcome)
    }
}

fn log_dropped_frame(from: &SessionRecord, payload: &[u8]) {
    let decoded = match payload.first() {
        Some(&BINARY_FLAG) => ControlFrame::decode_flagged(payload),
        _ => ControlFrame::decode(payload),
    };
    match decoded {
        Ok(frame) => info!(
            from = %from.entity_id,
            user = frame.user_id,
            command = frame.command_type,
            timestamp = frame.timestamp,
            "frame dropped: no bound counterpart"
        ),
        Err(err) => info!(
            from = %from.entity_id,
            len = payload.len(),
            error = %err,
            "binary payload dropped: no bound counterpart"
        ),
    }
}
