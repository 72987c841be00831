use fedround_core::ExperimentId;

use crate::storage::{CheckpointId, CheckpointStorage, StorageResult};

#[derive(Debug, Clone, Copy, Default)]
/// A store which drops every checkpoint.
pub struct NoopStore;

#[async_trait]
impl CheckpointStorage for NoopStore {
    async fn set_checkpoint(&mut self, _id: &CheckpointId, _blob: &[u8]) -> StorageResult<()> {
        Ok(())
    }

    async fn checkpoint(&mut self, _id: &CheckpointId) -> StorageResult<Option<Vec<u8>>> {
        Err(anyhow::anyhow!("No-op checkpoint store"))
    }

    async fn latest_checkpoint_id(
        &mut self,
        _experiment_id: &ExperimentId,
    ) -> StorageResult<Option<CheckpointId>> {
        Ok(None)
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}
