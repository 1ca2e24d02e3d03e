/// Crate-wide result type for broker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed broker errors returned to callers of the lifecycle and dispatch APIs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Another `initialize` for the same tenant is still running and has no
    /// pairing image yet. Callers should poll status instead of retrying.
    #[error("session for tenant {tenant_id} is already initializing")]
    AlreadyInitializing { tenant_id: String },

    #[error("initialization for tenant {tenant_id} timed out after {timeout_ms}ms")]
    InitializationTimeout { tenant_id: String, timeout_ms: u64 },

    #[error("authentication failed for tenant {tenant_id}: {reason}")]
    AuthenticationFailed { tenant_id: String, reason: String },

    /// The tenant has no session in the `Ready` state.
    #[error("tenant {tenant_id} is not connected")]
    NotConnected { tenant_id: String },

    #[error("invalid recipient {input:?}: {reason}")]
    InvalidRecipient { input: String, reason: String },

    /// Provider-level send failure (network error, rejected number).
    #[error("send failed: {message}")]
    SendFailed { message: String },

    #[error("failed to fetch media {url}: {message}")]
    MediaFetchFailed { url: String, message: String },

    /// The automation engine could not be started (missing runtime, bad
    /// install, process exited immediately).
    #[error("messaging engine failed to start: {message}")]
    EngineStartupFailed { message: String },

    /// The session was torn down, or its client went away before the
    /// initialization request was resolved.
    #[error("session for tenant {tenant_id} closed: {reason}")]
    SessionClosed { tenant_id: String, reason: String },

    #[error("failed to render pairing code: {message}")]
    PairingRender { message: String },
}

impl Error {
    #[must_use]
    pub fn not_connected(tenant_id: impl Into<String>) -> Self {
        Self::NotConnected {
            tenant_id: tenant_id.into(),
        }
    }

    #[must_use]
    pub fn invalid_recipient(input: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::InvalidRecipient {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn send_failed(message: impl std::fmt::Display) -> Self {
        Self::SendFailed {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn media_fetch_failed(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::MediaFetchFailed {
            url: url.into(),
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn init_timeout(tenant_id: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::InitializationTimeout {
            tenant_id: tenant_id.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    #[must_use]
    pub fn engine_startup(message: impl std::fmt::Display) -> Self {
        Self::EngineStartupFailed {
            message: message.to_string(),
        }
    }

    #[must_use]
    pub fn session_closed(tenant_id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::SessionClosed {
            tenant_id: tenant_id.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn pairing_render(message: impl std::fmt::Display) -> Self {
        Self::PairingRender {
            message: message.to_string(),
        }
    }

    /// Stable snake_case name of the error kind, used by API layers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyInitializing { .. } => "already_initializing",
            Self::InitializationTimeout { .. } => "initialization_timeout",
            Self::AuthenticationFailed { .. } => "authentication_failed",
            Self::NotConnected { .. } => "not_connected",
            Self::InvalidRecipient { .. } => "invalid_recipient",
            Self::SendFailed { .. } => "send_failed",
            Self::MediaFetchFailed { .. } => "media_fetch_failed",
            Self::EngineStartupFailed { .. } => "engine_startup_failed",
            Self::SessionClosed { .. } => "session_closed",
            Self::PairingRender { .. } => "pairing_render_failed",
        }
    }
}
