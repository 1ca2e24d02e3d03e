//! Outbound send path. Every send requires a `Ready` session; nothing here
//! retries.

use std::sync::Arc;

use {
    serde::Serialize,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    Error, Result,
    address::AddressNormalizer,
    driver::{ClientHandle, MediaKind, MediaMessage},
    registry::SessionRegistry,
    session::{LifecycleState, ManagedSession},
};

/// Result of a successful send, for the caller's message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReceipt {
    /// Provider-assigned message id.
    pub message_id: String,
    /// Canonical address the message went to.
    pub recipient: String,
}

pub struct DispatchGateway {
    registry: Arc<SessionRegistry>,
    normalizer: AddressNormalizer,
}

impl DispatchGateway {
    pub fn new(registry: Arc<SessionRegistry>, normalizer: AddressNormalizer) -> Self {
        Self {
            registry,
            normalizer,
        }
    }

    pub fn normalizer(&self) -> &AddressNormalizer {
        &self.normalizer
    }

    pub async fn send_text(
        &self,
        tenant_id: &str,
        recipient_raw: &str,
        text: &str,
    ) -> Result<SendReceipt> {
        let (session, client) = self.ready_client(tenant_id)?;
        let recipient = self.normalizer.normalize(recipient_raw)?;

        debug!(tenant_id, recipient, text_len = text.len(), "outbound text send start");
        let message_id = client.send_text(&recipient, text).await.map_err(|e| {
            warn!(tenant_id, recipient, error = %e, "outbound text send failed");
            as_send_error(e)
        })?;

        session.lock().touch();
        info!(tenant_id, recipient, message_id, "outbound text sent");
        Ok(SendReceipt {
            message_id,
            recipient,
        })
    }

    pub async fn send_media(
        &self,
        tenant_id: &str,
        recipient_raw: &str,
        media_url: &str,
        caption: Option<&str>,
        kind: MediaKind,
    ) -> Result<SendReceipt> {
        let (session, client) = self.ready_client(tenant_id)?;
        let recipient = self.normalizer.normalize(recipient_raw)?;
        validate_media_url(media_url)?;

        let media = MediaMessage {
            url: media_url.to_string(),
            caption: caption.map(str::to_string),
            kind,
        };
        debug!(
            tenant_id,
            recipient,
            kind = kind.as_str(),
            has_caption = media.caption.is_some(),
            "outbound media send start"
        );
        let message_id = client.send_media(&recipient, &media).await.map_err(|e| {
            warn!(tenant_id, recipient, error = %e, "outbound media send failed");
            match e {
                Error::MediaFetchFailed { .. } => e,
                other => as_send_error(other),
            }
        })?;

        session.lock().touch();
        info!(tenant_id, recipient, message_id, "outbound media sent");
        Ok(SendReceipt {
            message_id,
            recipient,
        })
    }

    /// Resolve the tenant's client, requiring the session to be `Ready`.
    fn ready_client(&self, tenant_id: &str) -> Result<(Arc<ManagedSession>, Arc<dyn ClientHandle>)> {
        let session = self
            .registry
            .get(tenant_id)
            .ok_or_else(|| Error::not_connected(tenant_id))?;
        let client = {
            let inner = session.lock();
            match (&inner.state, &inner.handle) {
                (LifecycleState::Ready, Some(handle)) => Arc::clone(handle),
                _ => return Err(Error::not_connected(tenant_id)),
            }
        };
        Ok((session, client))
    }
}

fn as_send_error(e: Error) -> Error {
    match e {
        Error::SendFailed { .. } => e,
        other => Error::send_failed(other),
    }
}

fn validate_media_url(media_url: &str) -> Result<()> {
    let url = Url::parse(media_url).map_err(|e| Error::media_fetch_failed(media_url, e))?;
    match url.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(Error::media_fetch_failed(
            media_url,
            format!("unsupported scheme {scheme:?}"),
        )),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            driver::{ClientDriver, DriverEvent},
            events::EventBus,
            lifecycle::{LifecycleController, LifecycleSettings},
            pairing::PairingRenderer,
            testing::{ScriptedDriver, SendBehavior, StartScript},
        },
        std::{path::PathBuf, time::Duration},
    };

    struct Fixture {
        driver: Arc<ScriptedDriver>,
        lifecycle: LifecycleController,
        dispatch: DispatchGateway,
    }

    fn fixture(script: StartScript) -> Fixture {
        let registry = Arc::new(SessionRegistry::new());
        let driver = Arc::new(ScriptedDriver::new(script));
        let lifecycle = LifecycleController::new(
            Arc::clone(&registry),
            Arc::clone(&driver) as Arc<dyn ClientDriver>,
            PairingRenderer::new(2, 1),
            EventBus::new(),
            LifecycleSettings {
                auth_base_dir: PathBuf::from("/tmp/campusline-test-auth"),
                init_timeout: Duration::from_secs(5),
                logout_timeout: Duration::from_millis(200),
            },
        );
        let dispatch = DispatchGateway::new(registry, AddressNormalizer::new("91", "@c.us"));
        Fixture {
            driver,
            lifecycle,
            dispatch,
        }
    }

    fn ready_script() -> StartScript {
        StartScript::Ready {
            address: "911234567890@c.us".into(),
        }
    }

    #[tokio::test]
    async fn send_before_initialize_is_not_connected() {
        let f = fixture(ready_script());
        let err = f
            .dispatch
            .send_text("school-1", "+91 98765 43210", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected { .. }), "{err}");
    }

    #[tokio::test]
    async fn send_while_awaiting_pairing_is_not_connected() {
        let f = fixture(StartScript::PairingCode("2@token".into()));
        f.lifecycle.initialize("school-1").await.unwrap();
        let err = f
            .dispatch
            .send_text("school-1", "9876543210", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected { .. }), "{err}");
    }

    #[tokio::test]
    async fn send_text_normalizes_and_returns_message_id() {
        let f = fixture(ready_script());
        f.lifecycle.initialize("school-1").await.unwrap();

        let receipt = f
            .dispatch
            .send_text("school-1", "+91 98765 43210", "hi")
            .await
            .unwrap();
        assert_eq!(receipt.recipient, "919876543210@c.us");
        assert!(!receipt.message_id.is_empty());

        let sent = f.driver.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "919876543210@c.us");
        assert_eq!(sent[0].text.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn send_after_disconnect_is_not_connected() {
        let f = fixture(ready_script());
        f.lifecycle.initialize("school-1").await.unwrap();
        f.driver
            .emit("school-1", DriverEvent::Disconnected {
                reason: "phone offline".into(),
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = f
            .dispatch
            .send_text("school-1", "9876543210", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected { .. }), "{err}");
        assert!(f.driver.sent().is_empty());
    }

    #[tokio::test]
    async fn invalid_recipient_is_rejected_before_sending() {
        let f = fixture(ready_script());
        f.lifecycle.initialize("school-1").await.unwrap();
        let err = f.dispatch.send_text("school-1", "n/a", "hi").await.unwrap_err();
        assert!(matches!(err, Error::InvalidRecipient { .. }), "{err}");
        assert!(f.driver.sent().is_empty());
    }

    #[tokio::test]
    async fn provider_failure_is_send_failed() {
        let f = fixture(ready_script());
        f.lifecycle.initialize("school-1").await.unwrap();
        f.driver
            .set_send_behavior(SendBehavior::Fail("number not on network".into()));

        let err = f
            .dispatch
            .send_text("school-1", "9876543210", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SendFailed { .. }), "{err}");
        assert!(err.to_string().contains("number not on network"));
    }

    #[tokio::test]
    async fn send_media_passes_url_reference() {
        let f = fixture(ready_script());
        f.lifecycle.initialize("school-1").await.unwrap();

        f.dispatch
            .send_media(
                "school-1",
                "9876543210",
                "https://cdn.example.com/report.pdf",
                Some("Term report"),
                MediaKind::Document,
            )
            .await
            .unwrap();

        let sent = f.driver.sent();
        let media = sent[0].media.as_ref().unwrap();
        assert_eq!(media.url, "https://cdn.example.com/report.pdf");
        assert_eq!(media.caption.as_deref(), Some("Term report"));
        assert_eq!(media.kind, MediaKind::Document);
    }

    #[tokio::test]
    async fn unfetchable_media_is_media_fetch_failed() {
        let f = fixture(ready_script());
        f.lifecycle.initialize("school-1").await.unwrap();
        f.driver
            .set_send_behavior(SendBehavior::MediaFetchFails("404 Not Found".into()));

        let err = f
            .dispatch
            .send_media(
                "school-1",
                "9876543210",
                "https://cdn.example.com/missing.png",
                None,
                MediaKind::Image,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MediaFetchFailed { .. }), "{err}");
    }

    #[tokio::test]
    async fn non_http_media_url_is_rejected() {
        let f = fixture(ready_script());
        f.lifecycle.initialize("school-1").await.unwrap();

        for url in ["file:///etc/passwd", "not a url"] {
            let err = f
                .dispatch
                .send_media("school-1", "9876543210", url, None, MediaKind::Image)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::MediaFetchFailed { .. }), "{url}: {err}");
        }
        assert!(f.driver.sent().is_empty());
    }
}
