use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use uuid::Uuid;

use crate::controller::RemoteDebugJobController;
use crate::error::DebugError;

/// In-flight debug sessions of one caller, keyed by a generated id.
///
/// Owned by whoever starts the sessions. Entries stay until `remove` is
/// called, also after their pipeline finished.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<Uuid, Arc<RemoteDebugJobController>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, controller: Arc<RemoteDebugJobController>) -> Uuid {
        let id = Uuid::new_v4();
        self.sessions.insert(id, controller);
        tracing::debug!(session = %id, "Registered debug session");
        id
    }

    pub fn get(&self, id: &Uuid) -> Option<Arc<RemoteDebugJobController>> {
        self.sessions.get(id).cloned()
    }

    pub fn remove(&mut self, id: &Uuid) -> Option<Arc<RemoteDebugJobController>> {
        let removed = self.sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session = %id, "Removed debug session");
        }
        removed
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.sessions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Kills every registered session concurrently, for shutdown.
    pub async fn kill_all(&self) -> Vec<(Uuid, Result<(), DebugError>)> {
        let kills = self.sessions.iter().map(|(id, controller)| {
            let id = *id;
            let controller = Arc::clone(controller);
            async move { (id, controller.kill().await) }
        });
        join_all(kills).await
    }
}
