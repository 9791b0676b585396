#![forbid(unsafe_code)]

//! Core of an append-only journal system: the fragment model and its
//! dominance-free interval index, the fragments listing/paging API, and
//! the consumer shard lifecycle deriving stateful materializations from
//! journals with exactly-once semantics.

pub mod broker;
pub mod cancel;
pub mod config;
pub mod consumer;
pub mod error;
pub mod fragment;
pub mod journal;
pub mod kv;
pub mod message;
pub mod metrics;
pub mod recoverylog;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the types most embedders touch.
pub use crate::cancel::{CancelToken, Canceller, cancel_pair};
pub use crate::config::Config;
pub use crate::consumer::{
    Application, BeginFinisher, Shard, ShardId, ShardSpec, Source, Store, run_shard,
};
pub use crate::fragment::{CompressionCodec, CoverSet, Fragment, StoreUrl, walk_all_stores};
pub use crate::journal::{Journal, JournalClient, JournalSpec};
pub use crate::message::Envelope;
pub use crate::recoverylog::{Author, Barrier, Fsm, FsmHints, Player, Recorder};
