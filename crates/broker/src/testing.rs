//! Scripted in-memory driver for exercising the broker without a real
//! messaging engine.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {async_trait::async_trait, tokio::sync::mpsc};

use crate::{
    Error, Result,
    driver::{ClientDriver, ClientHandle, DriverEvent, MediaMessage, StartRequest},
};

/// What a freshly started client does on its own.
#[derive(Debug, Clone)]
pub enum StartScript {
    /// Emit nothing; the test drives events with [`ScriptedDriver::emit`].
    Silent,
    PairingCode(String),
    Ready { address: String },
    AuthFailure(String),
    FailStartup(String),
}

/// How sends on scripted clients behave.
#[derive(Debug, Clone, Default)]
pub enum SendBehavior {
    #[default]
    Succeed,
    Fail(String),
    MediaFetchFails(String),
}

/// A message accepted by a scripted client.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub tenant_id: String,
    pub to: String,
    pub text: Option<String>,
    pub media: Option<MediaMessage>,
}

#[derive(Default)]
struct Shared {
    starts: AtomicUsize,
    destroyed: AtomicUsize,
    logout_fails: AtomicBool,
    send_behavior: Mutex<SendBehavior>,
    sent: Mutex<Vec<SentMessage>>,
    next_message_id: AtomicUsize,
}

pub struct ScriptedDriver {
    script: StartScript,
    start_delay: Option<Duration>,
    shared: Arc<Shared>,
    /// Event sender of the latest client per tenant.
    clients: Mutex<HashMap<String, Arc<Mutex<Option<mpsc::Sender<DriverEvent>>>>>>,
}

impl ScriptedDriver {
    pub fn new(script: StartScript) -> Self {
        Self {
            script,
            start_delay: None,
            shared: Arc::new(Shared::default()),
            clients: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_failing_logout(self) -> Self {
        self.shared.logout_fails.store(true, Ordering::SeqCst);
        self
    }

    pub fn set_send_behavior(&self, behavior: SendBehavior) {
        *lock(&self.shared.send_behavior) = behavior;
    }

    /// Number of clients constructed so far.
    pub fn starts(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }

    /// Number of clients destroyed so far.
    pub fn destroyed(&self) -> usize {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.shared.sent).clone()
    }

    /// Push an event from the tenant's latest client. Returns `false` when
    /// nobody is listening any more.
    pub async fn emit(&self, tenant_id: &str, event: DriverEvent) -> bool {
        let sender = lock(&self.clients)
            .get(tenant_id)
            .and_then(|slot| lock(slot).clone());
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Simulate the client process dying: its event stream closes.
    pub fn crash(&self, tenant_id: &str) {
        if let Some(slot) = lock(&self.clients).get(tenant_id) {
            lock(slot).take();
        }
    }
}

#[async_trait]
impl ClientDriver for ScriptedDriver {
    async fn start(
        &self,
        request: StartRequest,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<Box<dyn ClientHandle>> {
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }

        let initial = match &self.script {
            StartScript::FailStartup(message) => return Err(Error::engine_startup(message)),
            StartScript::Silent => None,
            StartScript::PairingCode(token) => Some(DriverEvent::PairingCode(token.clone())),
            StartScript::Ready { address } => Some(DriverEvent::Ready {
                address: address.clone(),
                display_name: None,
            }),
            StartScript::AuthFailure(reason) => Some(DriverEvent::AuthFailure {
                reason: reason.clone(),
            }),
        };
        if let Some(event) = initial {
            let _ = events.try_send(event);
        }

        let slot = Arc::new(Mutex::new(Some(events)));
        lock(&self.clients).insert(request.tenant_id.clone(), Arc::clone(&slot));

        Ok(Box::new(ScriptedClient {
            tenant_id: request.tenant_id,
            shared: Arc::clone(&self.shared),
            events: slot,
            destroyed: AtomicBool::new(false),
        }))
    }
}

struct ScriptedClient {
    tenant_id: String,
    shared: Arc<Shared>,
    events: Arc<Mutex<Option<mpsc::Sender<DriverEvent>>>>,
    destroyed: AtomicBool,
}

impl ScriptedClient {
    fn record(&self, to: &str, text: Option<&str>, media: Option<&MediaMessage>) -> Result<String> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::send_failed("client destroyed"));
        }
        match lock(&self.shared.send_behavior).clone() {
            SendBehavior::Succeed => {},
            SendBehavior::Fail(message) => return Err(Error::send_failed(message)),
            SendBehavior::MediaFetchFails(message) => {
                let url = media.map(|m| m.url.clone()).unwrap_or_default();
                return Err(Error::media_fetch_failed(url, message));
            },
        }
        lock(&self.shared.sent).push(SentMessage {
            tenant_id: self.tenant_id.clone(),
            to: to.to_string(),
            text: text.map(str::to_string),
            media: media.cloned(),
        });
        let id = self.shared.next_message_id.fetch_add(1, Ordering::SeqCst);
        Ok(format!("msg-{id}"))
    }
}

#[async_trait]
impl ClientHandle for ScriptedClient {
    async fn send_text(&self, to: &str, text: &str) -> Result<String> {
        self.record(to, Some(text), None)
    }

    async fn send_media(&self, to: &str, media: &MediaMessage) -> Result<String> {
        self.record(to, None, Some(media))
    }

    async fn logout(&self) -> Result<()> {
        if self.shared.logout_fails.load(Ordering::SeqCst) {
            return Err(Error::send_failed("logout rejected"));
        }
        Ok(())
    }

    async fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            lock(&self.events).take();
            self.shared.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
