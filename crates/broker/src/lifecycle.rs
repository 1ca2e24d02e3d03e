//! Lifecycle controller: drives one tenant session through
//! `Uninitialized → Initializing → AwaitingPairing → Ready` and the failure
//! edges, resolving each `initialize` call exactly once.
//!
//! Client events are consumed by a single pump task per started client, so
//! transitions for one tenant are totally ordered. Each pump is tagged with
//! the session generation it was started for; once the session moves on to a
//! newer client (or is torn down) the pump's events are dropped.

use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    campusline_config::BrokerConfig,
    chrono::Utc,
    serde::Serialize,
    tokio::{
        sync::{mpsc, oneshot},
        time::Instant,
    },
    tracing::{debug, error, info, warn},
};

use crate::{
    Error, Result,
    driver::{ClientDriver, ClientHandle, DriverEvent, StartRequest},
    events::{EventBus, SessionEvent},
    pairing::PairingRenderer,
    registry::SessionRegistry,
    session::{ConnectionInfo, LifecycleState, ManagedSession},
};

/// Buffered client events per session before the driver is back-pressured.
const CLIENT_EVENT_BUFFER: usize = 64;

/// Successful result of an `initialize` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InitOutcome {
    /// The session is connected (fresh pairing or restored credentials).
    Ready,
    /// A human must scan the pairing image to finish the handshake.
    AwaitingPairing { pairing_image: String },
}

/// Timing and storage knobs for the controller.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub auth_base_dir: PathBuf,
    pub init_timeout: Duration,
    pub logout_timeout: Duration,
}

impl LifecycleSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            auth_base_dir: config.resolved_auth_base_dir(),
            init_timeout: Duration::from_secs(config.init_timeout_secs),
            logout_timeout: Duration::from_secs(config.logout_timeout_secs),
        }
    }
}

pub struct LifecycleController {
    registry: Arc<SessionRegistry>,
    driver: Arc<dyn ClientDriver>,
    renderer: PairingRenderer,
    events: EventBus,
    settings: LifecycleSettings,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<SessionRegistry>,
        driver: Arc<dyn ClientDriver>,
        renderer: PairingRenderer,
        events: EventBus,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            driver,
            renderer,
            events,
            settings,
        }
    }

    /// Credential directory handed to the client for `tenant_id`.
    pub fn auth_dir_for(&self, tenant_id: &str) -> PathBuf {
        self.settings.auth_base_dir.join(sanitize_tenant_id(tenant_id))
    }

    /// Bring the tenant's session up, or report where it stands.
    ///
    /// Resolves on the first of: pairing code, ready, auth failure, or the
    /// initialization timeout. Only one client is ever started per in-flight
    /// attempt; concurrent callers get the cached pairing image or
    /// [`Error::AlreadyInitializing`].
    pub async fn initialize(&self, tenant_id: &str) -> Result<InitOutcome> {
        let session = self.registry.get_or_create(tenant_id);
        let deadline = Instant::now() + self.settings.init_timeout;

        let (generation, stale_handle, waiter) = {
            let mut inner = session.lock();
            if inner.retired {
                return Err(Error::session_closed(
                    tenant_id,
                    "session is being torn down, retry shortly",
                ));
            }
            if inner.state == LifecycleState::Ready {
                debug!(tenant_id, "session already ready");
                return Ok(InitOutcome::Ready);
            }
            if inner.in_flight {
                return match &inner.pairing_image {
                    Some(image) => Ok(InitOutcome::AwaitingPairing {
                        pairing_image: image.clone(),
                    }),
                    None => Err(Error::AlreadyInitializing {
                        tenant_id: tenant_id.to_string(),
                    }),
                };
            }

            let generation = inner.enter_initializing();
            let (tx, rx) = oneshot::channel();
            inner.waiter = Some(tx);
            (generation, inner.handle.take(), rx)
        };
        self.events
            .state_changed(tenant_id, LifecycleState::Initializing);

        let starter = ClientStarter {
            driver: Arc::clone(&self.driver),
            request: StartRequest {
                tenant_id: tenant_id.to_string(),
                auth_dir: self.auth_dir_for(tenant_id),
            },
            stale_handle,
            pump: EventPump {
                session: Arc::clone(&session),
                generation,
                renderer: self.renderer,
                events: self.events.clone(),
                init_timeout: self.settings.init_timeout,
            },
        };
        // Detached from the caller: dropping this future must not strand the
        // session in flight.
        tokio::spawn(starter.run(deadline));

        match waiter.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::session_closed(
                tenant_id,
                "client stopped before initialization completed",
            )),
        }
    }

    /// Log out and destroy the tenant's client, then drop the session.
    ///
    /// Returns whether the graceful logout succeeded. The session is removed
    /// from the registry either way.
    pub async fn teardown(&self, tenant_id: &str) -> bool {
        let Some(session) = self.registry.get(tenant_id) else {
            debug!(tenant_id, "teardown for unknown tenant");
            return false;
        };

        let handle = {
            let mut inner = session.lock();
            inner.retired = true;
            inner.generation += 1;
            inner.resolve(Err(Error::session_closed(tenant_id, "session torn down")));
            inner.enter_disconnected();
            inner.handle.take()
        };

        let logged_out = match handle {
            Some(handle) => {
                let logged_out =
                    match tokio::time::timeout(self.settings.logout_timeout, handle.logout()).await
                    {
                        Ok(Ok(())) => true,
                        Ok(Err(e)) => {
                            warn!(tenant_id, error = %e, "graceful logout failed");
                            false
                        },
                        Err(_) => {
                            warn!(tenant_id, "graceful logout timed out");
                            false
                        },
                    };
                handle.destroy().await;
                logged_out
            },
            None => false,
        };

        self.registry.remove(tenant_id);
        self.events
            .state_changed(tenant_id, LifecycleState::Disconnected);
        info!(tenant_id, logged_out, "session torn down");
        logged_out
    }

    /// Tear down every registered session.
    pub async fn shutdown(&self) {
        let tenants = self.registry.tenant_ids();
        if tenants.is_empty() {
            return;
        }
        info!(count = tenants.len(), "tearing down all sessions");
        futures::future::join_all(tenants.iter().map(|tenant_id| self.teardown(tenant_id))).await;
    }
}

/// Map a tenant id onto a single safe path component.
fn sanitize_tenant_id(tenant_id: &str) -> String {
    let sanitized: String = tenant_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "_".to_string()
    } else {
        sanitized
    }
}

/// Destroys the previous client, starts a new one within the
/// initialization window and hands its events to a pump.
struct ClientStarter {
    driver: Arc<dyn ClientDriver>,
    request: StartRequest,
    stale_handle: Option<Arc<dyn ClientHandle>>,
    pump: EventPump,
}

impl ClientStarter {
    async fn run(self, deadline: Instant) {
        let Self {
            driver,
            request,
            stale_handle,
            pump,
        } = self;
        let tenant_id = request.tenant_id.clone();
        let generation = pump.generation;
        let (events_tx, events_rx) = mpsc::channel(CLIENT_EVENT_BUFFER);

        let started = tokio::time::timeout_at(deadline, async {
            // A previous client that disconnected or failed is never reused.
            if let Some(stale) = stale_handle {
                debug!(tenant_id, "destroying stale messaging client");
                stale.destroy().await;
            }
            info!(tenant_id, generation, "starting messaging client");
            driver.start(request, events_tx).await
        })
        .await;

        let handle: Arc<dyn ClientHandle> = match started {
            Ok(Ok(handle)) => Arc::from(handle),
            Ok(Err(e)) => {
                error!(tenant_id, error = %e, "messaging client failed to start");
                pump.fail_start(match e {
                    Error::EngineStartupFailed { .. } => e,
                    other => Error::engine_startup(other),
                });
                return;
            },
            Err(_) => {
                warn!(
                    tenant_id,
                    timeout_ms = pump.init_timeout.as_millis() as u64,
                    "messaging client did not start within the initialization window"
                );
                pump.fail_start(Error::init_timeout(&tenant_id, pump.init_timeout));
                return;
            },
        };

        let installed = {
            let mut inner = pump.session.lock();
            let current = inner.generation == generation && !inner.retired;
            if current {
                inner.handle = Some(Arc::clone(&handle));
            }
            current
        };
        if !installed {
            warn!(tenant_id, "session torn down while client was starting");
            handle.destroy().await;
            return;
        }

        pump.run(events_rx, deadline).await;
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Single consumer of one client's events.
struct EventPump {
    session: Arc<ManagedSession>,
    generation: u64,
    renderer: PairingRenderer,
    events: EventBus,
    init_timeout: Duration,
}

impl EventPump {
    async fn run(self, mut rx: mpsc::Receiver<DriverEvent>, deadline: Instant) {
        let tenant_id = self.session.tenant_id().to_string();
        let timer = tokio::time::sleep_until(deadline);
        tokio::pin!(timer);
        let mut timer_armed = true;

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        if let Flow::Stop = self.apply(event) {
                            break;
                        }
                    },
                    None => {
                        self.on_stream_closed();
                        break;
                    },
                },
                () = &mut timer, if timer_armed => {
                    timer_armed = false;
                    if let Flow::Stop = self.on_deadline() {
                        break;
                    }
                },
            }
        }
        debug!(tenant_id, generation = self.generation, "client event pump stopped");
    }

    fn apply(&self, event: DriverEvent) -> Flow {
        let tenant_id = self.session.tenant_id();
        match event {
            DriverEvent::PairingCode(token) => {
                let image = match self.renderer.render_data_uri(&token) {
                    Ok(image) => image,
                    Err(e) => {
                        warn!(tenant_id, error = %e, "dropping unrenderable pairing code");
                        return Flow::Continue;
                    },
                };
                let changed = {
                    let mut inner = self.session.lock();
                    if inner.generation != self.generation {
                        return Flow::Stop;
                    }
                    if !matches!(
                        inner.state,
                        LifecycleState::Initializing | LifecycleState::AwaitingPairing
                    ) {
                        debug!(tenant_id, state = %inner.state, "ignoring pairing code");
                        return Flow::Continue;
                    }
                    let changed = inner.state != LifecycleState::AwaitingPairing;
                    inner.enter_awaiting_pairing(image.clone());
                    inner.resolve(Ok(InitOutcome::AwaitingPairing {
                        pairing_image: image.clone(),
                    }));
                    changed
                };
                info!(tenant_id, "pairing code issued");
                if changed {
                    self.events
                        .state_changed(tenant_id, LifecycleState::AwaitingPairing);
                }
                self.events.publish(SessionEvent::PairingCode {
                    tenant_id: tenant_id.to_string(),
                    pairing_image: image,
                });
                Flow::Continue
            },
            DriverEvent::Ready {
                address,
                display_name,
            } => {
                {
                    let mut inner = self.session.lock();
                    if inner.generation != self.generation {
                        return Flow::Stop;
                    }
                    inner.enter_ready(ConnectionInfo {
                        address: address.clone(),
                        display_name,
                        last_seen_at: Utc::now(),
                    });
                    inner.resolve(Ok(InitOutcome::Ready));
                }
                info!(tenant_id, address, "session ready");
                self.events.state_changed(tenant_id, LifecycleState::Ready);
                Flow::Continue
            },
            DriverEvent::Disconnected { reason } => {
                {
                    let mut inner = self.session.lock();
                    if inner.generation != self.generation {
                        return Flow::Stop;
                    }
                    inner.enter_disconnected();
                    inner.resolve(Err(Error::session_closed(tenant_id, &reason)));
                }
                warn!(tenant_id, reason, "session disconnected");
                self.events
                    .state_changed(tenant_id, LifecycleState::Disconnected);
                // Reconnecting requires an explicit initialize.
                Flow::Stop
            },
            DriverEvent::AuthFailure { reason } => {
                {
                    let mut inner = self.session.lock();
                    if inner.generation != self.generation {
                        return Flow::Stop;
                    }
                    inner.enter_failed();
                    inner.resolve(Err(Error::AuthenticationFailed {
                        tenant_id: tenant_id.to_string(),
                        reason: reason.clone(),
                    }));
                }
                warn!(tenant_id, reason, "authentication failed");
                self.events.state_changed(tenant_id, LifecycleState::Failed);
                Flow::Stop
            },
            DriverEvent::InboundMessage {
                message_id,
                from,
                body,
            } => {
                {
                    let mut inner = self.session.lock();
                    if inner.generation != self.generation {
                        return Flow::Stop;
                    }
                    inner.touch();
                }
                debug!(tenant_id, from, "inbound message");
                self.events.publish(SessionEvent::InboundMessage {
                    tenant_id: tenant_id.to_string(),
                    message_id,
                    from,
                    body,
                });
                Flow::Continue
            },
        }
    }

    /// The client never came up: fail the attempt it belongs to.
    fn fail_start(&self, error: Error) {
        let tenant_id = self.session.tenant_id();
        {
            let mut inner = self.session.lock();
            if inner.generation != self.generation || inner.retired {
                return;
            }
            inner.enter_failed();
            inner.resolve(Err(error));
        }
        self.events.state_changed(tenant_id, LifecycleState::Failed);
    }

    /// Initialization window elapsed. The client keeps running: a late
    /// ready event still brings the session up.
    fn on_deadline(&self) -> Flow {
        let tenant_id = self.session.tenant_id();
        {
            let mut inner = self.session.lock();
            if inner.generation != self.generation {
                return Flow::Stop;
            }
            if !matches!(
                inner.state,
                LifecycleState::Initializing | LifecycleState::AwaitingPairing
            ) {
                return Flow::Continue;
            }
            inner.enter_failed();
            inner.resolve(Err(Error::init_timeout(tenant_id, self.init_timeout)));
        }
        warn!(
            tenant_id,
            timeout_ms = self.init_timeout.as_millis() as u64,
            "initialization timed out"
        );
        self.events.state_changed(tenant_id, LifecycleState::Failed);
        Flow::Continue
    }

    /// The client dropped its event sender: the process is gone.
    fn on_stream_closed(&self) {
        let tenant_id = self.session.tenant_id();
        let changed = {
            let mut inner = self.session.lock();
            if inner.generation != self.generation {
                return;
            }
            inner.resolve(Err(Error::session_closed(
                tenant_id,
                "messaging client exited",
            )));
            match inner.state {
                LifecycleState::Disconnected | LifecycleState::Failed => false,
                _ => {
                    inner.enter_disconnected();
                    true
                },
            }
        };
        if changed {
            warn!(tenant_id, "messaging client exited unexpectedly");
            self.events
                .state_changed(tenant_id, LifecycleState::Disconnected);
        }
    }
}
