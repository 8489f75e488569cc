use thiserror::Error;
use vbstore_types::VBucketId;

/// An error that can occur when using the backing store.
#[derive(Clone, Error, Debug, Eq, PartialEq)]
pub enum StorageError {
    /// The store has been closed.
    #[error("The backing store is closed.")]
    Closed,

    /// [`KvStore::begin`](crate::KvStore::begin) was called while a
    /// transaction was open.
    #[error("A transaction is already in progress.")]
    TransactionInProgress,

    /// The vbucket batch count must be positive.
    #[error("Invalid vbucket batch count {0}; the batch count must be positive.")]
    InvalidBatchCount(usize),

    /// A state record could not be encoded.
    #[error("Failed to encode the state record of vbucket {vbucket}: {error}")]
    StateEncoding { vbucket: VBucketId, error: String },
}
