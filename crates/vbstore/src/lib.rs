//! A sharded key-value store engine.
//!
//! The key space is split into vbuckets ([`vbucket::VBucket`]), each with its
//! own state, in-memory items and change log.  The [`EpStore`] facade writes
//! mutations to a [`vbstore_storage::KvStore`] through the flusher and feeds
//! replication connections: a full snapshot of the requested vbuckets through
//! [`backfill`], then the incremental change stream.

pub mod backfill;
pub mod dispatcher;
mod error;
pub mod metrics;
pub mod stats;
pub mod store;
pub mod tap;
pub mod vbucket;

pub use error::Error;
pub use store::EpStore;

#[cfg(test)]
mod test;
