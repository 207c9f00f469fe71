//! In-memory map from instance id to its live handle.
//!
//! The registry is the authoritative answer to "is this instance running".
//! Lifecycle transitions for one id are serialized through [`Registry::lock`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::LifecycleError;
use crate::gateway::{GatewaySession, ReadyInfo};
use crate::sandbox::{ClientSource, ScriptHandle};

/// An authenticated, running instance.
pub struct LiveHandle {
    id: String,
    session_id: Uuid,
    name: String,
    started_at: DateTime<Utc>,
    ready: ReadyInfo,
    client_source: ClientSource,
    session: Arc<dyn GatewaySession>,
    script: Arc<ScriptHandle>,
    pump: JoinHandle<()>,
}

impl LiveHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: &str,
        session_id: Uuid,
        name: &str,
        ready: ReadyInfo,
        client_source: ClientSource,
        session: Arc<dyn GatewaySession>,
        script: Arc<ScriptHandle>,
        pump: JoinHandle<()>,
    ) -> Self {
        Self {
            id: id.to_string(),
            session_id,
            name: name.to_string(),
            started_at: Utc::now(),
            ready,
            client_source,
            session,
            script,
            pump,
        }
    }

    /// Unique per start; a restart always yields a new value.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ready(&self) -> &ReadyInfo {
        &self.ready
    }

    pub fn client_source(&self) -> ClientSource {
        self.client_source
    }

    /// Close the gateway session and stop the script, bounded by `timeout`.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), LifecycleError> {
        let Self {
            id,
            session,
            script,
            pump,
            ..
        } = self;

        pump.abort();
        let teardown = async {
            let destroyed = session.destroy().await;
            script.shutdown().await;
            destroyed
        };

        match tokio::time::timeout(timeout, teardown).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LifecycleError::Teardown {
                id,
                reason: e.to_string(),
            }),
            Err(_) => Err(LifecycleError::Teardown {
                id,
                reason: format!("timed out after {}ms", timeout.as_millis()),
            }),
        }
    }
}

/// Snapshot of a registered handle for status surfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSummary {
    pub id: String,
    pub session_id: Uuid,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub username: String,
}

#[derive(Default)]
pub struct Registry {
    handles: RwLock<HashMap<String, LiveHandle>>,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the transition lock for `id`.
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the transition lock for `id` if nobody holds or waits on it.
    pub fn forget_lock(&self, id: &str) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
    }

    /// Number of ids that currently have a transition lock.
    pub fn lock_count(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Whether a live handle is registered for `id`.
    pub async fn status(&self, id: &str) -> bool {
        self.handles.read().await.contains_key(id)
    }

    /// Register `handle`, returning any handle it displaced.
    pub async fn set(&self, id: &str, handle: LiveHandle) -> Option<LiveHandle> {
        self.handles.write().await.insert(id.to_string(), handle)
    }

    pub async fn remove(&self, id: &str) -> Option<LiveHandle> {
        self.handles.write().await.remove(id)
    }

    /// Remove the handle for `id` only if it belongs to `session_id`.
    pub async fn remove_session(&self, id: &str, session_id: Uuid) -> Option<LiveHandle> {
        let mut handles = self.handles.write().await;
        if handles.get(id).is_some_and(|h| h.session_id == session_id) {
            handles.remove(id)
        } else {
            None
        }
    }

    pub async fn session_id(&self, id: &str) -> Option<Uuid> {
        self.handles.read().await.get(id).map(LiveHandle::session_id)
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.handles.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.handles.read().await.is_empty()
    }

    pub async fn summaries(&self) -> Vec<LiveSummary> {
        let mut out: Vec<LiveSummary> = self
            .handles
            .read()
            .await
            .iter()
            .map(|(id, h)| LiveSummary {
                id: id.clone(),
                session_id: h.session_id,
                name: h.name.clone(),
                started_at: h.started_at,
                username: h.ready.username.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Tear down every registered handle concurrently.
    ///
    /// Each id's lock is held while its handle is removed and shut down.
    /// Resolves once every teardown has finished or hit `timeout`.
    pub async fn stop_all(&self, timeout: Duration) -> Vec<(String, Result<(), LifecycleError>)> {
        let ids = self.ids().await;
        let stops = ids.into_iter().map(|id| async move {
            let _guard = self.lock(&id).await;
            let result = match self.remove(&id).await {
                Some(handle) => handle.shutdown(timeout).await,
                None => Ok(()),
            };
            (id, result)
        });
        futures::future::join_all(stops).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use secrecy::SecretString;

    use super::*;
    use crate::config::SandboxConfig;
    use crate::error::GatewayError;
    use crate::gateway::OutboundAction;
    use crate::sandbox::{EnvironmentBuilder, launch};

    #[derive(Default)]
    struct CountingSession {
        destroyed: AtomicUsize,
        hang: bool,
    }

    #[async_trait]
    impl GatewaySession for CountingSession {
        async fn perform(&self, _action: OutboundAction) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn destroy(&self) -> Result<(), GatewayError> {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    async fn handle(id: &str, session: Arc<CountingSession>) -> LiveHandle {
        let env = EnvironmentBuilder::new(id, SecretString::from("tok-123")).build();
        let launched = launch(env, "const x = 1;".to_string(), &SandboxConfig::default())
            .await
            .unwrap();
        LiveHandle::new(
            id,
            Uuid::new_v4(),
            id,
            ReadyInfo {
                user_id: "1".to_string(),
                username: "bot".to_string(),
                session_id: "s".to_string(),
            },
            launched.harvest.source,
            session,
            Arc::new(launched.handle),
            tokio::spawn(async {}),
        )
    }

    #[tokio::test]
    async fn test_set_status_remove() {
        let registry = Registry::new();
        assert!(!registry.status("a").await);

        let session = Arc::new(CountingSession::default());
        assert!(registry.set("a", handle("a", session).await).await.is_none());
        assert!(registry.status("a").await);
        assert_eq!(registry.ids().await, vec!["a".to_string()]);
        assert!(registry.session_id("a").await.is_some());
        let summaries = registry.summaries().await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].name, "a");
        assert_eq!(summaries[0].username, "bot");

        let stale = Uuid::new_v4();
        assert!(registry.remove_session("a", stale).await.is_none());
        assert!(registry.status("a").await);

        let current = registry.session_id("a").await.unwrap();
        let removed = registry.remove_session("a", current).await.unwrap();
        assert!(!registry.status("a").await);
        removed.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_all_tears_down_everything() {
        let registry = Registry::new();
        let sessions: Vec<_> = (0..3).map(|_| Arc::new(CountingSession::default())).collect();
        for (i, session) in sessions.iter().enumerate() {
            let id = format!("bot-{i}");
            registry
                .set(&id, handle(&id, Arc::clone(session)).await)
                .await;
        }

        let results = registry.stop_all(Duration::from_secs(5)).await;
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(registry.is_empty().await);
        for session in &sessions {
            assert_eq!(session.destroyed.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn test_hung_teardown_is_bounded() {
        let registry = Registry::new();
        let session = Arc::new(CountingSession {
            hang: true,
            ..CountingSession::default()
        });
        registry.set("slow", handle("slow", session).await).await;

        let results = registry.stop_all(Duration::from_millis(100)).await;
        assert!(matches!(
            results[0].1,
            Err(LifecycleError::Teardown { ref id, .. }) if id == "slow"
        ));
        assert!(!registry.status("slow").await);
    }

    #[tokio::test]
    async fn test_lock_serializes_same_id() {
        let registry = Arc::new(Registry::new());
        let guard = registry.lock("a").await;

        let other = Arc::clone(&registry);
        let waiter = tokio::spawn(async move {
            let _g = other.lock("a").await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // A different id is not blocked.
        let _b = registry.lock("b").await;

        drop(guard);
        waiter.await.unwrap();
        registry.forget_lock("a");
        assert!(!registry.locks.lock().unwrap().contains_key("a"));
        assert_eq!(registry.lock_count(), 1);
    }
}
