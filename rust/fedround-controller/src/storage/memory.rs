//! An in-memory checkpoint store.

use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::Mutex;

use fedround_core::ExperimentId;

use crate::storage::{CheckpointId, CheckpointStorage, StorageResult};

#[derive(Debug, Clone, Default)]
/// A checkpoint store which keeps the blobs in memory. Clones share the blobs.
pub struct MemoryStore {
    blobs: Arc<Mutex<BTreeMap<CheckpointId, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the ids of all stored checkpoints in ascending order.
    pub async fn ids(&self) -> Vec<CheckpointId> {
        self.blobs.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl CheckpointStorage for MemoryStore {
    async fn set_checkpoint(&mut self, id: &CheckpointId, blob: &[u8]) -> StorageResult<()> {
        self.blobs.lock().await.insert(id.clone(), blob.to_vec());
        Ok(())
    }

    async fn checkpoint(&mut self, id: &CheckpointId) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.blobs.lock().await.get(id).cloned())
    }

    async fn latest_checkpoint_id(
        &mut self,
        experiment_id: &ExperimentId,
    ) -> StorageResult<Option<CheckpointId>> {
        Ok(self
            .blobs
            .lock()
            .await
            .keys()
            .filter(|id| &id.experiment_id == experiment_id)
            .max_by_key(|id| id.round)
            .cloned())
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_is_per_experiment() {
        let mut store = MemoryStore::new();
        let (a, b) = (ExperimentId::from("a"), ExperimentId::from("b"));
        store.set_checkpoint(&CheckpointId::new(a.clone(), 1), b"1").await.unwrap();
        store.set_checkpoint(&CheckpointId::new(a.clone(), 3), b"3").await.unwrap();
        store.set_checkpoint(&CheckpointId::new(b.clone(), 7), b"7").await.unwrap();

        assert_eq!(
            store.latest_checkpoint_id(&a).await.unwrap(),
            Some(CheckpointId::new(a.clone(), 3))
        );
        assert_eq!(
            store.checkpoint(&CheckpointId::new(b, 7)).await.unwrap(),
            Some(b"7".to_vec())
        );
        assert_eq!(store.checkpoint(&CheckpointId::new(a, 2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clones_share_blobs() {
        let mut store = MemoryStore::new();
        let clone = store.clone();
        let id = CheckpointId::new(ExperimentId::from("a"), 0);
        store.set_checkpoint(&id, b"blob").await.unwrap();
        assert_eq!(clone.ids().await, vec![id]);
    }
}
