//! Multi-tenant messaging session broker.
//!
//! Each tenant owns at most one automation-driven messaging client. The
//! broker pairs clients through a scannable code, tracks their lifecycle,
//! and sends text and media on behalf of connected tenants.

pub mod address;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod pairing;
pub mod registry;
pub mod session;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::sync::Arc;

use {
    campusline_config::{BrokerConfig, PairingConfig},
    tokio::sync::broadcast,
};

pub use {
    address::AddressNormalizer,
    dispatch::{DispatchGateway, SendReceipt},
    driver::{ClientDriver, ClientHandle, DriverEvent, MediaKind, MediaMessage, StartRequest},
    error::{Error, Result},
    events::{EventBus, SessionEvent},
    lifecycle::{InitOutcome, LifecycleController, LifecycleSettings},
    pairing::PairingRenderer,
    registry::SessionRegistry,
    session::{ConnectionInfo, LifecycleState, SessionSnapshot},
};

/// Everything the outer API layer needs, wired around one shared registry.
pub struct Broker {
    registry: Arc<SessionRegistry>,
    lifecycle: LifecycleController,
    dispatch: DispatchGateway,
    events: EventBus,
}

impl Broker {
    pub fn new(
        broker: &BrokerConfig,
        pairing: &PairingConfig,
        driver: Arc<dyn ClientDriver>,
    ) -> Self {
        Self::with_settings(
            AddressNormalizer::from_config(broker),
            PairingRenderer::from_config(pairing),
            LifecycleSettings::from_config(broker),
            driver,
        )
    }

    pub fn with_settings(
        normalizer: AddressNormalizer,
        renderer: PairingRenderer,
        settings: LifecycleSettings,
        driver: Arc<dyn ClientDriver>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let events = EventBus::new();
        let lifecycle = LifecycleController::new(
            Arc::clone(&registry),
            driver,
            renderer,
            events.clone(),
            settings,
        );
        let dispatch = DispatchGateway::new(Arc::clone(&registry), normalizer);
        Self {
            registry,
            lifecycle,
            dispatch,
            events,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn normalizer(&self) -> &AddressNormalizer {
        self.dispatch.normalizer()
    }

    pub async fn initialize(&self, tenant_id: &str) -> Result<InitOutcome> {
        self.lifecycle.initialize(tenant_id).await
    }

    /// Current view of the tenant's session, `None` when never initialized
    /// or already torn down.
    pub fn status(&self, tenant_id: &str) -> Option<SessionSnapshot> {
        self.registry.snapshot(tenant_id)
    }

    pub async fn send_text(
        &self,
        tenant_id: &str,
        recipient: &str,
        text: &str,
    ) -> Result<SendReceipt> {
        self.dispatch.send_text(tenant_id, recipient, text).await
    }

    pub async fn send_media(
        &self,
        tenant_id: &str,
        recipient: &str,
        media_url: &str,
        caption: Option<&str>,
        kind: MediaKind,
    ) -> Result<SendReceipt> {
        self.dispatch
            .send_media(tenant_id, recipient, media_url, caption, kind)
            .await
    }

    /// Log out and drop the tenant's session. Returns whether the graceful
    /// logout succeeded.
    pub async fn disconnect(&self, tenant_id: &str) -> bool {
        self.lifecycle.teardown(tenant_id).await
    }

    /// Tenants with a `Ready` session.
    pub fn list_active(&self) -> Vec<String> {
        self.registry.list_ready_tenants()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
    }
}
