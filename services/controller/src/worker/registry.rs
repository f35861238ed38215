//! Tasks currently running in this process.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use vnet_id::TaskId;

/// Abort handles of in-flight tasks, keyed by task.
#[derive(Debug, Default)]
pub struct InFlightRegistry {
    tasks: Mutex<HashMap<TaskId, AbortHandle>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: TaskId, handle: AbortHandle) {
        self.tasks.lock().await.insert(id, handle);
    }

    pub async fn remove(&self, id: &TaskId) {
        self.tasks.lock().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.tasks.lock().await.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Abort every in-flight task. Returns how many were signalled.
    pub async fn abort_all(&self) -> usize {
        let tasks = self.tasks.lock().await;
        for handle in tasks.values() {
            handle.abort();
        }
        tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_abort_all_stops_tasks() {
        let registry = InFlightRegistry::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let id = TaskId::new();
        registry.insert(id, handle.abort_handle()).await;
        assert_eq!(registry.ids().await, vec![id]);

        assert_eq!(registry.abort_all().await, 1);
        let err = handle.await.unwrap_err();
        assert!(err.is_cancelled());

        registry.remove(&id).await;
        assert!(registry.is_empty().await);
    }
}
