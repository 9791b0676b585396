use thiserror::Error;

use crate::broker::BrokerError;
use crate::consumer::ShardError;
use crate::fragment::{ParseError, StoreError, WalkError};
use crate::journal::ClientError;
use crate::kv::KvError;
use crate::recoverylog::HintsError;

/// Crate-level convenience error.
///
/// A thin wrapper over the canonical per-capability errors; logic
/// matches on those, not on this.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Hints(#[from] HintsError),

    #[error(transparent)]
    Shard(#[from] ShardError),
}

impl Error {
    /// Whether this error is a cancellation or deadline expiry, which
    /// propagate with identity and should not be treated as failures.
    pub fn is_cancellation(&self) -> bool {
        match self {
            Error::Shard(err) => err.is_cancellation(),
            _ => false,
        }
    }
}
