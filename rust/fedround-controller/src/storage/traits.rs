//! Storage API.

use derive_more::Display;

use fedround_core::{ExperimentId, RoundNumber};

/// The error type for storage operations that are not directly related to application domain.
/// These include, for example IO errors like broken pipe, file not found, out-of-memory, etc.
pub type StorageError = anyhow::Error;

/// The result of the storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Display, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[display(fmt = "{}/round_{}", experiment_id, round)]
/// The handle of a checkpoint.
///
/// `round` is the number of completed rounds captured by the checkpoint.
pub struct CheckpointId {
    pub experiment_id: ExperimentId,
    pub round: RoundNumber,
}

impl CheckpointId {
    pub fn new(experiment_id: ExperimentId, round: RoundNumber) -> Self {
        Self {
            experiment_id,
            round,
        }
    }
}

#[async_trait]
/// An abstract checkpoint storage.
pub trait CheckpointStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Sets a checkpoint.
    ///
    /// # Behavior
    ///
    /// - If no checkpoint exists for the `id`, store the `blob` and return `StorageResult::Ok(())`.
    /// - If a checkpoint already exists, override it and return `StorageResult::Ok(())`.
    /// - The checkpoint must not be visible to [`checkpoint`] or [`latest_checkpoint_id`] before
    ///   it is completely written.
    ///
    /// [`checkpoint`]: CheckpointStorage::checkpoint
    /// [`latest_checkpoint_id`]: CheckpointStorage::latest_checkpoint_id
    async fn set_checkpoint(&mut self, id: &CheckpointId, blob: &[u8]) -> StorageResult<()>;

    /// Returns a checkpoint.
    ///
    /// # Behavior
    ///
    /// - If the checkpoint does not exist, return `StorageResult::Ok(Option::None)`.
    /// - If the checkpoint exists, return `StorageResult::Ok(Option::Some(Vec<u8>))`.
    async fn checkpoint(&mut self, id: &CheckpointId) -> StorageResult<Option<Vec<u8>>>;

    /// Returns the id of the checkpoint with the highest round of an experiment.
    ///
    /// # Behavior
    ///
    /// - If the experiment has no checkpoint, return `StorageResult::Ok(Option::None)`.
    /// - Otherwise return `StorageResult::Ok(Option::Some(CheckpointId))`.
    async fn latest_checkpoint_id(
        &mut self,
        experiment_id: &ExperimentId,
    ) -> StorageResult<Option<CheckpointId>>;

    /// Checks if the storage is ready to process requests.
    ///
    /// # Behavior
    ///
    /// If the storage is ready to process requests, return `StorageResult::Ok(())`.
    /// If the storage cannot process requests because of a connection error, for example,
    /// return `StorageResult::Err(error)`.
    async fn is_ready(&mut self) -> StorageResult<()>;
}
