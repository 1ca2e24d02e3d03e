//! Per-tenant managed session state.

use std::sync::{Arc, Mutex, MutexGuard};

use {
    chrono::{DateTime, Utc},
    serde::Serialize,
    tokio::sync::oneshot,
};

use crate::{Result, driver::ClientHandle, lifecycle::InitOutcome};

/// Connection lifecycle of one tenant session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    #[default]
    Uninitialized,
    Initializing,
    AwaitingPairing,
    Ready,
    Disconnected,
    Failed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::AwaitingPairing => "awaiting_pairing",
            Self::Ready => "ready",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the connected device, present only while `Ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub address: String,
    pub display_name: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

/// Read-only copy of a session, safe to hand out without holding locks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub tenant_id: String,
    pub state: LifecycleState,
    pub pairing_image: Option<String>,
    pub connection: Option<ConnectionInfo>,
    pub initialization_in_flight: bool,
}

impl SessionSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == LifecycleState::Ready
    }
}

pub(crate) type InitWaiter = oneshot::Sender<Result<InitOutcome>>;

/// Mutable session fields. Only touched through [`ManagedSession::lock`],
/// never across an `.await`.
pub(crate) struct SessionInner {
    pub(crate) state: LifecycleState,
    pub(crate) pairing_image: Option<String>,
    pub(crate) connection: Option<ConnectionInfo>,
    pub(crate) in_flight: bool,
    pub(crate) handle: Option<Arc<dyn ClientHandle>>,
    /// Bumped on every client start and on teardown. Events tagged with an
    /// older generation belong to a client that is gone.
    pub(crate) generation: u64,
    pub(crate) retired: bool,
    pub(crate) waiter: Option<InitWaiter>,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: LifecycleState::Uninitialized,
            pairing_image: None,
            connection: None,
            in_flight: false,
            handle: None,
            generation: 0,
            retired: false,
            waiter: None,
        }
    }

    pub(crate) fn enter_initializing(&mut self) -> u64 {
        self.generation += 1;
        self.state = LifecycleState::Initializing;
        self.in_flight = true;
        self.pairing_image = None;
        self.connection = None;
        self.generation
    }

    pub(crate) fn enter_awaiting_pairing(&mut self, image: String) {
        self.state = LifecycleState::AwaitingPairing;
        self.pairing_image = Some(image);
        self.connection = None;
    }

    pub(crate) fn enter_ready(&mut self, connection: ConnectionInfo) {
        self.state = LifecycleState::Ready;
        self.connection = Some(connection);
        self.pairing_image = None;
        self.in_flight = false;
    }

    pub(crate) fn enter_disconnected(&mut self) {
        self.state = LifecycleState::Disconnected;
        self.connection = None;
        self.pairing_image = None;
        self.in_flight = false;
    }

    pub(crate) fn enter_failed(&mut self) {
        self.state = LifecycleState::Failed;
        self.connection = None;
        self.pairing_image = None;
        self.in_flight = false;
    }

    /// Resolve the pending `initialize` caller, if it is still waiting.
    pub(crate) fn resolve(&mut self, outcome: Result<InitOutcome>) {
        if let Some(waiter) = self.waiter.take() {
            let _ = waiter.send(outcome);
        }
    }

    pub(crate) fn touch(&mut self) {
        if let Some(connection) = self.connection.as_mut() {
            connection.last_seen_at = Utc::now();
        }
    }

    #[cfg(test)]
    pub(crate) fn invariants_hold(&self) -> bool {
        (self.pairing_image.is_none() || self.state == LifecycleState::AwaitingPairing)
            && (self.connection.is_none() || self.state == LifecycleState::Ready)
    }
}

/// One tenant's session: lifecycle state plus the exclusively-owned client
/// handle.
pub struct ManagedSession {
    tenant_id: String,
    inner: Mutex<SessionInner>,
}

impl ManagedSession {
    pub(crate) fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            inner: Mutex::new(SessionInner::new()),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.lock();
        SessionSnapshot {
            tenant_id: self.tenant_id.clone(),
            state: inner.state,
            pairing_image: inner.pairing_image.clone(),
            connection: inner.connection.clone(),
            initialization_in_flight: inner.in_flight,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ManagedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ManagedSession")
            .field("tenant_id", &self.tenant_id)
            .field("state", &inner.state)
            .field("in_flight", &inner.in_flight)
            .field("generation", &inner.generation)
            .field("has_handle", &inner.handle.is_some())
            .finish_non_exhaustive()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> ConnectionInfo {
        ConnectionInfo {
            address: "919876543210@c.us".into(),
            display_name: Some("Front Office".into()),
            last_seen_at: Utc::now(),
        }
    }

    #[test]
    fn new_session_is_uninitialized() {
        let session = ManagedSession::new("school-1");
        let snap = session.snapshot();
        assert_eq!(snap.state, LifecycleState::Uninitialized);
        assert!(snap.pairing_image.is_none());
        assert!(snap.connection.is_none());
        assert!(!snap.initialization_in_flight);
    }

    #[test]
    fn invariants_hold_across_every_transition_order() {
        type Step = fn(&mut SessionInner);
        let steps: [(&str, Step); 5] = [
            ("initializing", |s| {
                s.enter_initializing();
            }),
            ("awaiting", |s| s.enter_awaiting_pairing("data:image/png;base64,AA".into())),
            ("ready", |s| s.enter_ready(connection())),
            ("disconnected", SessionInner::enter_disconnected),
            ("failed", SessionInner::enter_failed),
        ];

        // Every ordered pair and triple of transitions.
        for a in &steps {
            for b in &steps {
                for c in &steps {
                    let mut inner = SessionInner::new();
                    for (name, step) in [a, b, c] {
                        step(&mut inner);
                        assert!(
                            inner.invariants_hold(),
                            "invariant broken after {name} ({:?})",
                            inner.state
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn ready_clears_pairing_image_and_in_flight() {
        let mut inner = SessionInner::new();
        inner.enter_initializing();
        inner.enter_awaiting_pairing("img".into());
        inner.enter_ready(connection());
        assert_eq!(inner.state, LifecycleState::Ready);
        assert!(inner.pairing_image.is_none());
        assert!(!inner.in_flight);
        assert!(inner.connection.is_some());
    }

    #[test]
    fn each_start_gets_a_new_generation() {
        let mut inner = SessionInner::new();
        let first = inner.enter_initializing();
        inner.enter_failed();
        let second = inner.enter_initializing();
        assert!(second > first);
    }

    #[test]
    fn resolve_fires_once() {
        let mut inner = SessionInner::new();
        let (tx, mut rx) = oneshot::channel();
        inner.waiter = Some(tx);
        inner.resolve(Ok(InitOutcome::Ready));
        inner.resolve(Ok(InitOutcome::AwaitingPairing {
            pairing_image: "late".into(),
        }));
        assert_eq!(rx.try_recv().unwrap().unwrap(), InitOutcome::Ready);
    }
}
