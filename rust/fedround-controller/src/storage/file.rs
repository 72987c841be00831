//! A checkpoint store backed by the local file system.
//!
//! The checkpoints of an experiment live in their own directory below the root of the store, one
//! file per checkpoint:
//!
//! ```text
//! <root>/<experiment_id>/round_000003.json
//! ```
//!
//! A checkpoint is written to a temporary file first and renamed afterwards, hence it is either
//! completely visible or not at all. The file is synced before the rename and, on unix, the
//! directory after it, so a stored checkpoint survives a crash of the host.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use tokio::{fs, io::AsyncWriteExt};

use fedround_core::{ExperimentId, RoundNumber};

use crate::storage::{CheckpointId, CheckpointStorage, StorageResult};

const PREFIX: &str = "round_";
const SUFFIX: &str = ".json";

#[derive(Debug, Clone)]
/// A file system checkpoint store.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Creates a store rooted at `root`. The directory is created on the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Gets the root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn experiment_dir(&self, experiment_id: &ExperimentId) -> StorageResult<PathBuf> {
        let name = experiment_id.as_str();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(|c: char| c == '/' || c == '\\')
        {
            return Err(anyhow!("invalid experiment id for a file store: {:?}", name));
        }
        Ok(self.root.join(name))
    }

    fn file_name(round: RoundNumber) -> String {
        format!("{}{:06}{}", PREFIX, round, SUFFIX)
    }

    fn parse_file_name(name: &str) -> Option<RoundNumber> {
        name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?.parse().ok()
    }

    fn path(&self, id: &CheckpointId) -> StorageResult<PathBuf> {
        Ok(self
            .experiment_dir(&id.experiment_id)?
            .join(Self::file_name(id.round)))
    }
}

/// Persists the entries of `dir`, i.e. a rename within it.
#[cfg(unix)]
async fn sync_dir(dir: &Path) -> StorageResult<()> {
    let handle = fs::File::open(dir)
        .await
        .with_context(|| format!("failed to open {}", dir.display()))?;
    handle
        .sync_all()
        .await
        .with_context(|| format!("failed to sync {}", dir.display()))
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> StorageResult<()> {
    Ok(())
}

#[async_trait]
impl CheckpointStorage for FileStore {
    async fn set_checkpoint(&mut self, id: &CheckpointId, blob: &[u8]) -> StorageResult<()> {
        let dir = self.experiment_dir(&id.experiment_id)?;
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;

        let path = self.path(id)?;
        let tmp = dir.join(format!(".{}.tmp", Self::file_name(id.round)));
        let mut file = fs::File::create(&tmp)
            .await
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        file.write_all(blob)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
        drop(file);

        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move the checkpoint to {}", path.display()))?;
        sync_dir(&dir).await?;
        debug!("checkpoint written to {}", path.display());
        Ok(())
    }

    async fn checkpoint(&mut self, id: &CheckpointId) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path(id)?;
        match fs::read(&path).await {
            Ok(blob) => Ok(Some(blob)),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
            Err(error) => {
                Err(error).with_context(|| format!("failed to read {}", path.display()))
            }
        }
    }

    async fn latest_checkpoint_id(
        &mut self,
        experiment_id: &ExperimentId,
    ) -> StorageResult<Option<CheckpointId>> {
        let dir = self.experiment_dir(experiment_id)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error).with_context(|| format!("failed to list {}", dir.display()))
            }
        };

        let mut latest = None;
        while let Some(entry) = entries.next_entry().await? {
            let round = entry
                .file_name()
                .to_str()
                .and_then(Self::parse_file_name);
            if round > latest {
                latest = round;
            }
        }
        Ok(latest.map(|round| CheckpointId::new(experiment_id.clone(), round)))
    }

    async fn is_ready(&mut self) -> StorageResult<()> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create {}", self.root.display()))
    }
}
