//! JSON frames exchanged with the WhatsApp Web sidecar over its WebSocket.

use serde::{Deserialize, Serialize};

use campusline_broker::{DriverEvent, MediaKind};

/// Gateway → sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    /// Start the WhatsApp Web session using the credential store the process
    /// was launched with.
    Login { tenant_id: String },
    SendText {
        request_id: String,
        to: String,
        text: String,
    },
    SendMedia {
        request_id: String,
        to: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
        media_type: MediaKind,
    },
    Logout,
}

/// Why a send failed, when the sidecar can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendErrorKind {
    /// The media URL could not be downloaded.
    MediaFetch,
    /// Anything else (unknown number, network error).
    Provider,
}

/// Sidecar → gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SidecarMessage {
    /// Raw pairing token to be rendered as a QR code.
    Qr { qr: String },
    Connected {
        #[serde(default)]
        phone_number: Option<String>,
        #[serde(default)]
        push_name: Option<String>,
    },
    Disconnected {
        #[serde(default)]
        reason: String,
    },
    AuthFailure {
        #[serde(default)]
        reason: String,
    },
    LoggedOut,
    InboundMessage {
        message_id: String,
        from: String,
        #[serde(default)]
        body: String,
    },
    SendResult {
        request_id: String,
        success: bool,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        error_kind: Option<SendErrorKind>,
    },
    Error { error: String },
}

impl SidecarMessage {
    /// The broker-level event this frame represents, if any. Send results,
    /// logout acknowledgements and sidecar errors are handled by the
    /// connection itself.
    pub fn into_driver_event(self, address_suffix: &str) -> Option<DriverEvent> {
        match self {
            Self::Qr { qr } => Some(DriverEvent::PairingCode(qr)),
            Self::Connected {
                phone_number,
                push_name,
            } => Some(DriverEvent::Ready {
                address: phone_number
                    .map(|number| to_address(&number, address_suffix))
                    .unwrap_or_default(),
                display_name: push_name,
            }),
            Self::Disconnected { reason } => Some(DriverEvent::Disconnected { reason }),
            Self::AuthFailure { reason } => Some(DriverEvent::AuthFailure { reason }),
            Self::InboundMessage {
                message_id,
                from,
                body,
            } => Some(DriverEvent::InboundMessage {
                message_id,
                from,
                body,
            }),
            Self::LoggedOut | Self::SendResult { .. } | Self::Error { .. } => None,
        }
    }
}

/// Sidecars report either a bare number or a full JID with a device part
/// (`919876543210:12@s.whatsapp.net`); keep the user part.
fn to_address(phone: &str, suffix: &str) -> String {
    let user = phone.split(['@', ':']).next().unwrap_or(phone);
    format!("{user}{suffix}")
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    #[test]
    fn send_media_frame_shape() {
        let msg = GatewayMessage::SendMedia {
            request_id: "r1".into(),
            to: "919876543210@c.us".into(),
            url: "https://cdn.example.com/a.png".into(),
            caption: None,
            media_type: MediaKind::Image,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "send_media",
                "request_id": "r1",
                "to": "919876543210@c.us",
                "url": "https://cdn.example.com/a.png",
                "media_type": "image",
            })
        );
        assert_eq!(
            serde_json::to_value(GatewayMessage::Logout).unwrap(),
            json!({"type": "logout"})
        );
    }

    #[test]
    fn parses_send_result_with_error_kind() {
        let msg: SidecarMessage = serde_json::from_value(json!({
            "type": "send_result",
            "request_id": "r9",
            "success": false,
            "error": "404 Not Found",
            "error_kind": "media_fetch",
        }))
        .unwrap();
        assert_eq!(msg, SidecarMessage::SendResult {
            request_id: "r9".into(),
            success: false,
            message_id: None,
            error: Some("404 Not Found".into()),
            error_kind: Some(SendErrorKind::MediaFetch),
        });
    }

    #[test]
    fn disconnected_without_reason() {
        let msg: SidecarMessage =
            serde_json::from_value(json!({"type": "disconnected"})).unwrap();
        assert_eq!(
            msg.into_driver_event("@c.us"),
            Some(DriverEvent::Disconnected {
                reason: String::new()
            })
        );
    }

    #[rstest]
    #[case("919876543210", "919876543210@c.us")]
    #[case("919876543210:12@s.whatsapp.net", "919876543210@c.us")]
    #[case("919876543210@s.whatsapp.net", "919876543210@c.us")]
    fn connected_maps_to_ready_address(#[case] phone: &str, #[case] expected: &str) {
        let event = SidecarMessage::Connected {
            phone_number: Some(phone.into()),
            push_name: Some("Front Office".into()),
        }
        .into_driver_event("@c.us");
        assert_eq!(
            event,
            Some(DriverEvent::Ready {
                address: expected.into(),
                display_name: Some("Front Office".into()),
            })
        );
    }

    #[test]
    fn bookkeeping_frames_are_not_driver_events() {
        assert!(SidecarMessage::LoggedOut.into_driver_event("@c.us").is_none());
        assert!(
            SidecarMessage::Error {
                error: "boom".into()
            }
            .into_driver_event("@c.us")
            .is_none()
        );
    }
}
