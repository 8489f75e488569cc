//! Types shared by the vbstore crates: shard states, queued items, persisted
//! shard metadata, and engine configuration.

pub mod config;
pub mod item;
pub mod state;

pub use item::{QueueOp, QueuedItem};
pub use state::{PersistedVBucketState, UnknownVBucketState, VBucketId, VBucketState};
