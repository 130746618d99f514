//! Explicit session storage owned by the hosting application.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::session::{ChatSession, SessionState};

/// Thread-safe map from session id to session.
///
/// Sessions share nothing with each other; the registry only decides
/// which one a request belongs to.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<ChatSession>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unbound session and register it.
    pub fn create(&self) -> Arc<ChatSession> {
        let session = Arc::new(ChatSession::create());
        self.insert(Arc::clone(&session));
        session
    }

    pub fn insert(&self, session: Arc<ChatSession>) {
        let mut guard = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        guard.insert(session.id(), session);
    }

    /// Look a session up on behalf of its owner; counts as activity.
    pub fn get(&self, id: &Uuid) -> Option<Arc<ChatSession>> {
        let guard = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let session = guard.get(id).cloned();
        if let Some(session) = &session {
            session.touch();
        }
        session
    }

    pub fn remove(&self, id: &Uuid) -> Option<Arc<ChatSession>> {
        let mut guard = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let removed = guard.remove(id);
        if removed.is_some() {
            log::info!("session {id} closed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop sessions untouched for longer than `ttl`. Sessions with an
    /// answer in flight are kept. Returns how many were removed.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let mut guard = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let before = guard.len();
        guard.retain(|_, session| {
            session.state() == SessionState::Generating || session.idle_for() <= ttl
        });
        before - guard.len()
    }

    /// Periodically evict sessions whose owner went away.
    pub fn spawn_idle_sweep(&self, ttl: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let period = (ttl / 4).clamp(Duration::from_millis(10), Duration::from_secs(60));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let evicted = registry.evict_idle(ttl);
                if evicted > 0 {
                    log::info!("evicted {evicted} idle sessions, {} left", registry.len());
                }
            }
        })
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::ScriptedEngine;
    use crate::session::SessionState;

    #[test]
    fn test_registry_lifecycle() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());

        let session = registry.create();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ids(), vec![session.id()]);

        let found = registry.get(&session.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &session));

        assert!(registry.remove(&session.id()).is_some());
        assert!(registry.remove(&session.id()).is_none());
        assert!(registry.get(&session.id()).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_idle_sessions_are_evicted() {
        let registry = SessionRegistry::new();
        let idle = registry.create();
        let active = registry.create();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(registry.get(&active.id()).is_some());

        assert_eq!(registry.evict_idle(Duration::from_millis(30)), 1);
        assert!(registry.get(&idle.id()).is_none());
        assert!(registry.get(&active.id()).is_some());
    }

    #[tokio::test]
    async fn test_idle_sweep_empties_registry() {
        let registry = SessionRegistry::new();
        registry.create();
        registry.create();

        let sweep = registry.spawn_idle_sweep(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        sweep.abort();

        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let registry = SessionRegistry::new();
        let engine = Arc::new(ScriptedEngine::answering(&["respuesta"]));
        let a = registry.create();
        let b = registry.create();
        a.bind_engine(engine.clone());
        b.bind_engine(engine);

        a.submit("hola").await.unwrap();
        b.reset();

        assert_ne!(a.id(), b.id());
        assert_eq!(a.message_count(), 2);
        assert_eq!(b.message_count(), 0);
        assert_eq!(b.state(), SessionState::Idle);
    }
}
