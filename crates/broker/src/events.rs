use {serde::Serialize, tokio::sync::broadcast};

use crate::session::LifecycleState;

/// Capacity of the session event bus. Slow subscribers lag instead of
/// blocking the broker.
pub const EVENT_BUS_CAPACITY: usize = 256;

/// Events published by the broker for real-time observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        tenant_id: String,
        state: LifecycleState,
    },
    /// A fresh pairing image is available (codes rotate while pairing).
    PairingCode {
        tenant_id: String,
        pairing_image: String,
    },
    InboundMessage {
        tenant_id: String,
        message_id: String,
        from: String,
        body: String,
    },
}

impl SessionEvent {
    /// Same value as the serialized `kind` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::PairingCode { .. } => "pairing_code",
            Self::InboundMessage { .. } => "inbound_message",
        }
    }

    pub fn tenant_id(&self) -> &str {
        match self {
            Self::StateChanged { tenant_id, .. }
            | Self::PairingCode { tenant_id, .. }
            | Self::InboundMessage { tenant_id, .. } => tenant_id,
        }
    }
}

/// Publishing half of the event bus.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    pub(crate) fn state_changed(&self, tenant_id: &str, state: LifecycleState) {
        self.publish(SessionEvent::StateChanged {
            tenant_id: tenant_id.to_string(),
            state,
        });
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kind_tag() {
        let event = SessionEvent::StateChanged {
            tenant_id: "school-1".into(),
            state: LifecycleState::AwaitingPairing,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "kind": "state_changed",
                "tenant_id": "school-1",
                "state": "awaiting_pairing",
            })
        );
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.state_changed("school-1", LifecycleState::Ready);

        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::InboundMessage {
            tenant_id: "school-1".into(),
            message_id: "m1".into(),
            from: "919999999999@c.us".into(),
            body: "hi".into(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.tenant_id(), "school-1");
    }
}
