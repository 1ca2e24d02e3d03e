use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use crate::session::{LifecycleState, ManagedSession, SessionSnapshot};

/// Process-wide map from tenant id to its managed session.
///
/// Every method only touches in-memory state and is safe to call from many
/// tasks at once.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ManagedSession>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the session for `tenant_id`, creating an `Uninitialized` one if
    /// none exists. Concurrent callers always observe the same instance.
    pub fn get_or_create(&self, tenant_id: &str) -> Arc<ManagedSession> {
        if let Some(session) = self.get(tenant_id) {
            return session;
        }

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        // Double-check after acquiring the write lock.
        Arc::clone(
            sessions
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(ManagedSession::new(tenant_id))),
        )
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<ManagedSession>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(tenant_id).cloned()
    }

    /// Remove the entry for `tenant_id`. No-op when absent.
    pub fn remove(&self, tenant_id: &str) -> Option<Arc<ManagedSession>> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(tenant_id)
    }

    pub fn contains(&self, tenant_id: &str) -> bool {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.contains_key(tenant_id)
    }

    pub fn snapshot(&self, tenant_id: &str) -> Option<SessionSnapshot> {
        self.get(tenant_id).map(|session| session.snapshot())
    }

    /// Tenant ids whose session is currently `Ready`, sorted.
    pub fn list_ready_tenants(&self) -> Vec<String> {
        let mut ready: Vec<String> = self
            .all()
            .into_iter()
            .filter(|session| session.state() == LifecycleState::Ready)
            .map(|session| session.tenant_id().to_string())
            .collect();
        ready.sort();
        ready
    }

    /// Every registered tenant id, sorted.
    pub fn tenant_ids(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Clone out of the map so session locks are never taken under the map lock.
    fn all(&self) -> Vec<Arc<ManagedSession>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.values().cloned().collect()
    }
}
