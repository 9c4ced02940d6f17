//! Readiness registry: push-based listener state.
//!
//! Each supervised listener holds a [`ReadinessReporter`] and writes its state
//! as it changes: `Starting` when registered, `Bound` once its socket or
//! overlay protocol is accepting, `Failed` when it gives up.  The node is
//! *ready* when every listener registered as required is `Bound`.
//!
//! Waiters are woken on every write, so [`ReadinessRegistry::wait_ready`]
//! never polls.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ListenerState {
    Starting,
    Bound { addr: String },
    Failed { reason: String },
}

/// State snapshot for one listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerStatus {
    pub id: String,
    /// Whether this listener gates readiness.
    pub required: bool,
    #[serde(flatten)]
    pub state: ListenerState,
}

#[derive(Default)]
struct Inner {
    listeners: RwLock<HashMap<String, ListenerStatus>>,
    changed: Notify,
}

/// Shared registry of listener states.  Clone freely.
#[derive(Clone, Default)]
pub struct ReadinessRegistry {
    inner: Arc<Inner>,
}

impl ReadinessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener in the `Starting` state and return its reporter.
    pub async fn reporter(&self, id: impl Into<String>, required: bool) -> ReadinessReporter {
        let id = id.into();
        self.inner.listeners.write().await.insert(
            id.clone(),
            ListenerStatus {
                id: id.clone(),
                required,
                state: ListenerState::Starting,
            },
        );
        ReadinessReporter {
            id,
            registry: self.clone(),
        }
    }

    /// Snapshot all listener states, sorted by id.
    pub async fn snapshot(&self) -> Vec<ListenerStatus> {
        let map = self.inner.listeners.read().await;
        let mut v: Vec<_> = map.values().cloned().collect();
        v.sort_by(|a, b| a.id.cmp(&b.id));
        v
    }

    /// `true` when at least one listener is required and all required ones are bound.
    pub async fn is_ready(&self) -> bool {
        let map = self.inner.listeners.read().await;
        let mut required = map.values().filter(|s| s.required).peekable();
        required.peek().is_some()
            && required.all(|s| matches!(s.state, ListenerState::Bound { .. }))
    }

    /// `true` when some required listener has failed.
    pub async fn has_failed(&self) -> bool {
        self.inner
            .listeners
            .read()
            .await
            .values()
            .any(|s| s.required && matches!(s.state, ListenerState::Failed { .. }))
    }

    /// Wait until [`is_ready`](Self::is_ready).  Returns `false` if a required
    /// listener failed first.
    pub async fn wait_ready(&self) -> bool {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            // Register interest before checking so a write in between is not lost.
            changed.as_mut().enable();
            if self.is_ready().await {
                return true;
            }
            if self.has_failed().await {
                return false;
            }
            changed.await;
        }
    }

    async fn write(&self, id: &str, state: ListenerState) {
        if let Some(status) = self.inner.listeners.write().await.get_mut(id) {
            status.state = state;
        }
        self.inner.changed.notify_waiters();
    }
}

/// Per-listener write handle into the [`ReadinessRegistry`].
#[derive(Clone)]
pub struct ReadinessReporter {
    id: String,
    registry: ReadinessRegistry,
}

impl ReadinessReporter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn set_bound(&self, addr: impl Into<String>) {
        let addr = addr.into();
        debug!(listener = %self.id, %addr, "listener bound");
        metrics::gauge!("p2pnode_listeners_bound").increment(1.0);
        self.registry.write(&self.id, ListenerState::Bound { addr }).await;
    }

    pub async fn set_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(listener = %self.id, %reason, "listener failed");
        self.registry.write(&self.id, ListenerState::Failed { reason }).await;
    }

    pub async fn current(&self) -> Option<ListenerState> {
        self.registry
            .inner
            .listeners
            .read()
            .await
            .get(&self.id)
            .map(|s| s.state.clone())
    }
}
