//! The consumer framework: shards deriving stateful materializations
//! from journals with exactly-once semantics.

pub mod hints;
pub mod lifecycle;
pub mod prune;

pub use hints::{fetch_backup_hints, fetch_hints, store_recorded_hints, store_recovered_hints};
pub use lifecycle::{
    TxnTimer, complete_playback, consume_messages, play_log, pump_messages, run_shard,
};
pub use prune::{PruneStats, prune_shard_log};

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::{CancelCause, CancelToken};
use crate::fragment::{StoreError, WalkError};
use crate::journal::{ClientError, Journal, JournalClient, JournalSpec};
use crate::kv::{KeyValue, KvError};
use crate::message::{Envelope, Message};
use crate::recoverylog::{HintsError, Recorder};

/// Identity of a consumer shard.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> ShardId {
        ShardId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A journal the shard consumes, with a floor on resume offsets.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub journal: Journal,
    pub min_offset: i64,
}

/// Specification of a shard: its identity, hint keys in the consensus
/// store, recovery log, source journals, and transaction bounds.
///
/// `hint_keys[0]` holds hints recorded periodically by the live
/// primary; `hint_keys[1]` holds hints recovered at handoff, with
/// subsequent keys retaining rotated history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardSpec {
    pub id: ShardId,
    pub hint_keys: Vec<String>,
    pub recovery_log: Journal,
    pub sources: Vec<Source>,
    pub min_txn_duration: Duration,
    pub max_txn_duration: Duration,
}

/// A shard under a leased primary assignment. The process serving the
/// shard implements this; the lifecycle consumes it.
pub trait Shard: Send + Sync {
    fn spec(&self) -> Arc<ShardSpec>;

    /// Cancellation scope of the current assignment.
    fn context(&self) -> &CancelToken;

    /// The shard's assignment key/value in the consensus store. Its
    /// create revision guards every hint write: a mismatch means this
    /// process has been preempted as primary.
    fn assignment(&self) -> KeyValue;

    fn journal_client(&self) -> Arc<dyn JournalClient>;
}

/// Opaque application error carried through the lifecycle.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A stateful store materialized from the shard's recovery log.
pub trait Store: Send {
    fn recorder_mut(&mut self) -> &mut dyn Recorder;

    /// Downcast hook: applications cast the store back to their
    /// concrete type inside callbacks.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    /// Offsets at which journal consumption should resume, as persisted
    /// by the last flush.
    fn fetch_journal_offsets(&self) -> Result<BTreeMap<Journal, i64>, BoxedError>;

    /// Atomically persist store state together with consumed offsets.
    fn flush(&mut self, offsets: &BTreeMap<Journal, i64>) -> Result<(), BoxedError>;
}

/// User-defined message decoding and transactional consumption.
pub trait Application: Send + Sync {
    /// Open or initialize the Store from a recovered directory.
    fn new_store(
        &self,
        shard: &dyn Shard,
        dir: &Path,
        recorder: Box<dyn Recorder>,
    ) -> Result<Box<dyn Store>, BoxedError>;

    /// A zeroed message instance suitable for frames of `spec`.
    fn new_message(&self, spec: &JournalSpec) -> Result<Box<dyn Message>, BoxedError>;

    fn consume_message(
        &self,
        shard: &dyn Shard,
        store: &mut dyn Store,
        envelope: Envelope,
    ) -> Result<(), BoxedError>;

    fn finalize_txn(&self, shard: &dyn Shard, store: &mut dyn Store) -> Result<(), BoxedError>;

    /// Capability query for the optional begin/finish pair.
    fn as_begin_finisher(&self) -> Option<&dyn BeginFinisher> {
        None
    }
}

/// Optional transaction begin/finish callbacks, paired exactly once per
/// non-empty transaction.
pub trait BeginFinisher {
    /// Called before the first message of a transaction is consumed.
    /// May block to gate transaction start.
    fn begin_txn(&self, shard: &dyn Shard, store: &mut dyn Store) -> Result<(), BoxedError>;

    fn finish_txn(&self, shard: &dyn Shard, store: &mut dyn Store);
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ShardError {
    #[error("shard canceled")]
    Canceled,

    #[error("shard deadline exceeded")]
    DeadlineExceeded,

    #[error("playback aborted without a recovered FSM")]
    PlaybackAborted,

    #[error("hint rotation rejected by the consensus store")]
    HintRotationConflict,

    #[error(transparent)]
    Hints(#[from] HintsError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Walk(#[from] WalkError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no backup hints stored for shard {0}")]
    NoBackupHints(ShardId),

    #[error("recovery log playback: {0}")]
    Play(#[source] BoxedError),

    #[error("initializing store: {0}")]
    StoreInit(#[source] BoxedError),

    #[error("flushing store: {0}")]
    Flush(#[source] BoxedError),

    #[error("application {op}: {source}")]
    App {
        op: &'static str,
        #[source]
        source: BoxedError,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{ctx}: {source}")]
    Context {
        ctx: String,
        #[source]
        source: Box<ShardError>,
    },
}

impl ShardError {
    /// Whether this is a cancellation or deadline error. Those are
    /// never wrapped, so identity holds at the top level.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ShardError::Canceled | ShardError::DeadlineExceeded)
    }
}

impl From<CancelCause> for ShardError {
    fn from(cause: CancelCause) -> ShardError {
        match cause {
            CancelCause::Canceled => ShardError::Canceled,
            CancelCause::DeadlineExceeded => ShardError::DeadlineExceeded,
        }
    }
}

/// Attach one layer of human context to `err`. Cancellation and
/// deadline errors propagate unwrapped so their identity remains
/// comparable at the root.
pub(crate) fn extend_err(err: ShardError, ctx: impl Into<String>) -> ShardError {
    if err.is_cancellation() {
        return err;
    }
    ShardError::Context {
        ctx: ctx.into(),
        source: Box::new(err),
    }
}

/// The cancellation error of `token`, defaulting to `Canceled` when the
/// token has not (yet) fired.
pub(crate) fn context_err(token: &CancelToken) -> ShardError {
    token.cause().unwrap_or(CancelCause::Canceled).into()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;

    #[test]
    fn extend_err_wraps_once_per_layer() {
        let err = extend_err(
            ShardError::PlaybackAborted,
            "completing playback",
        );
        let err = extend_err(err, "serving shard");
        assert_eq!(
            err.to_string(),
            "serving shard: completing playback: playback aborted without a recovered FSM"
        );
    }

    #[test]
    fn cancellation_is_never_wrapped() {
        let err = extend_err(ShardError::Canceled, "reading message");
        assert!(matches!(err, ShardError::Canceled));

        let err = extend_err(ShardError::DeadlineExceeded, "reading message");
        assert!(matches!(err, ShardError::DeadlineExceeded));
    }

    #[test]
    fn context_err_maps_cause() {
        let (canceller, token) = cancel_pair();
        canceller.cancel();
        assert!(matches!(context_err(&token), ShardError::Canceled));
    }
}
