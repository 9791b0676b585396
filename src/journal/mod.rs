//! Journals: named append-only byte streams, and the client interface
//! through which the consumer core reads and appends them.

mod mem;

pub use mem::MemJournalClient;

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::fragment::{Fragment, StoreUrl};
use crate::message::FramingKind;
use crate::recoverylog::Barrier;

/// Name of an append-only byte stream.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Journal(String);

impl Journal {
    pub fn new(name: impl Into<String>) -> Journal {
        Journal(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read/write posture of a journal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalFlags {
    #[default]
    NotSpecified,
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl JournalFlags {
    pub fn may_read(self) -> bool {
        !matches!(self, JournalFlags::WriteOnly)
    }

    pub fn may_write(self) -> bool {
        !matches!(self, JournalFlags::ReadOnly)
    }
}

/// Journal metadata the consumer core consumes: its flags, backing
/// stores, and message framing.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalSpec {
    pub name: Journal,
    pub flags: JournalFlags,
    pub stores: Vec<StoreUrl>,
    pub framing: FramingKind,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    #[error("named journal does not exist ({0})")]
    NoSuchJournal(Journal),
    #[error("appending to {journal}: {reason}")]
    Append { journal: Journal, reason: String },
}

/// A blocking, resumable reader over one journal.
///
/// `read` blocks until content is available at the current offset and
/// returns a zero-length read only after the reader's cancellation
/// token has fired.
pub trait JournalRead: io::Read + Send {
    /// The reader's offset, adjusted down by `buffered` bytes read from
    /// the underlying stream but not yet consumed by the caller.
    fn adjusted_offset(&self, buffered: i64) -> i64;

    /// The fragment the reader is currently reading from, when known.
    fn fragment(&self) -> Option<Fragment>;
}

/// Client interface for reading and appending journals. Appends are
/// framed writes bounded by write barriers; readers resume transparently
/// across fragments.
pub trait JournalClient: Send + Sync {
    /// Fetch the current spec of `journal`.
    fn fetch_spec(&self, journal: &Journal) -> Result<JournalSpec, ClientError>;

    /// Open a blocking reader at `offset`, honoring `token`.
    fn open_reader(
        &self,
        journal: &Journal,
        offset: i64,
        token: CancelToken,
    ) -> Box<dyn JournalRead>;

    /// Queue an append of `content`. The returned barrier resolves when
    /// the write is durable.
    fn append(&self, journal: &Journal, content: &[u8]) -> Result<Barrier, ClientError>;

    /// A barrier resolving once pending appends to `journal` are
    /// durable.
    fn write_barrier(&self, journal: &Journal) -> Barrier;

    /// A barrier resolving once pending appends to all journals are
    /// durable.
    fn flush_barrier(&self) -> Barrier;
}
