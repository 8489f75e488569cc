use thiserror::Error as ThisError;
use vbstore_storage::error::StorageError;
use vbstore_types::config::ConfigError;
use vbstore_types::{VBucketId, VBucketState};

/// Engine error.
#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("vbucket {0} does not exist")]
    UnknownVBucket(VBucketId),

    #[error("vbucket {0} already exists")]
    VBucketExists(VBucketId),

    /// The operation requires an active vbucket.
    #[error("vbucket {vbucket} is {state}, not active")]
    NotMyVBucket {
        vbucket: VBucketId,
        state: VBucketState,
    },

    #[error("vbucket {vbucket} is {state}, it must be dead to be deleted")]
    NotDead {
        vbucket: VBucketId,
        state: VBucketState,
    },

    #[error("no replication connection named '{0}'")]
    UnknownConnection(String),
}
