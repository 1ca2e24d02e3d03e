//! Capability traits for the automation-driven messaging client.
//!
//! A [`ClientDriver`] constructs one [`ClientHandle`] per tenant. The client
//! reports what happens on the network through [`DriverEvent`]s pushed into
//! the channel it was started with; the broker reacts to those events.

use std::path::PathBuf;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::sync::mpsc,
};

use crate::Result;

/// Events emitted by a running client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// A (rotating) pairing token that a human must scan.
    PairingCode(String),
    /// The client is authenticated and can send.
    Ready {
        address: String,
        display_name: Option<String>,
    },
    /// The connection dropped; the client is no longer usable.
    Disconnected { reason: String },
    /// The network rejected the stored or scanned credentials.
    AuthFailure { reason: String },
    InboundMessage {
        message_id: String,
        from: String,
        body: String,
    },
}

/// Kind of media attached to an outbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Document => "document",
        }
    }
}

/// Media sent by URL reference; the client fetches it at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMessage {
    pub url: String,
    pub caption: Option<String>,
    pub kind: MediaKind,
}

/// Everything a driver needs to start a client for one tenant.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub tenant_id: String,
    /// Persisted credential store for this tenant, opaque to the broker.
    pub auth_dir: PathBuf,
}

/// Handle to one running client. Owned exclusively by a managed session.
#[async_trait]
pub trait ClientHandle: Send + Sync {
    /// Send a text message; returns the provider-assigned message id.
    async fn send_text(&self, to: &str, text: &str) -> Result<String>;

    /// Send media by URL; returns the provider-assigned message id.
    async fn send_media(&self, to: &str, media: &MediaMessage) -> Result<String>;

    /// Log the device out of the network, invalidating stored credentials.
    async fn logout(&self) -> Result<()>;

    /// Release the client and every resource it holds (processes, sockets).
    async fn destroy(&self);
}

/// Factory for clients.
#[async_trait]
pub trait ClientDriver: Send + Sync {
    /// Start a client. Startup failures must be reported as
    /// [`Error::EngineStartupFailed`](crate::Error::EngineStartupFailed)
    /// with an actionable message.
    async fn start(
        &self,
        request: StartRequest,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<Box<dyn ClientHandle>>;
}
