//! Durable storage of experiment checkpoints.
//!
//! The [`CheckpointStorage`] trait addresses opaque checkpoint blobs by [`CheckpointId`]. A blob
//! becomes visible only once it is completely written, so a reader never observes a partial
//! checkpoint. Encoding and validation of the blobs is the job of the [`checkpoint`] module.
//!
//! [`checkpoint`]: crate::checkpoint

pub mod file;
pub mod memory;
pub mod noop;
pub mod traits;

pub use self::{
    file::FileStore,
    memory::MemoryStore,
    noop::NoopStore,
    traits::{CheckpointId, CheckpointStorage, StorageError, StorageResult},
};
