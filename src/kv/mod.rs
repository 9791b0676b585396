//! Consensus store interface.
//!
//! The shard lifecycle needs only a narrow slice of a strongly
//! consistent KV: read-only multi-key gets, and compare-and-swap
//! transactions keyed by per-key create and modification revisions.
//! `MemStore` provides the reference in-process implementation.

mod mem;

pub use mem::MemStore;

use bytes::Bytes;
use thiserror::Error;

/// A key/value pair with its revision bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Bytes,
    /// Revision at which the key was created.
    pub create_revision: i64,
    /// Revision of the last modification.
    pub mod_revision: i64,
}

/// A guard evaluated before a transaction's ops are applied.
///
/// A missing key compares with revision 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compare {
    CreateRevision { key: String, revision: i64 },
    ModRevision { key: String, revision: i64 },
}

/// A mutation applied when all of a transaction's compares hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnOp {
    Put { key: String, value: Bytes },
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KvError {
    #[error("consensus store unavailable: {reason}")]
    Unavailable { reason: String },
}

pub trait ConsensusStore: Send + Sync {
    /// Fetch each key in a single read-only transaction. The result is
    /// positionally aligned with `keys`; absent keys yield `None`.
    fn range(&self, keys: &[String]) -> Result<Vec<Option<KeyValue>>, KvError>;

    /// Evaluate `compares` and, if all hold, apply `ops` atomically.
    /// Returns whether the compares held.
    fn txn(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool, KvError>;

    /// Unconditional put.
    fn put(&self, key: &str, value: Bytes) -> Result<(), KvError> {
        self.txn(
            Vec::new(),
            vec![TxnOp::Put {
                key: key.to_string(),
                value,
            }],
        )
        .map(|_| ())
    }
}
