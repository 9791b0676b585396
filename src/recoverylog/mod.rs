//! Recovery-log contracts: hints, their FSM validation, and the
//! player/recorder collaborator interfaces.
//!
//! A recovery log is a journal of filesystem operations replayable into
//! a shard working directory. Hints are a compact FSM snapshot letting
//! a new primary skip to the live tail of that log; the Author recorded
//! in a handoff adjudicates between competing recorders.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::journal::{Journal, JournalClient};

/// A recorder identity: non-zero, with 63 bits of entropy.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Author(pub u64);

impl Author {
    pub fn random() -> Author {
        loop {
            let id = rand::random::<u64>() >> 1;
            if id != 0 {
                return Author(id);
            }
        }
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

/// A contiguous span of recovery-log operations by one author.
///
/// `last_offset` of zero marks a segment still being extended at the
/// log head.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub author: Author,
    pub first_seq_no: i64,
    pub first_offset: i64,
    pub last_seq_no: i64,
    #[serde(default)]
    pub last_offset: i64,
}

impl Segment {
    fn validate(&self) -> Result<(), HintsError> {
        if self.author.is_zero() {
            return Err(HintsError::InvalidSegment {
                reason: "segment author is zero".to_string(),
            });
        }
        if self.first_seq_no <= 0 || self.last_seq_no < self.first_seq_no {
            return Err(HintsError::InvalidSegment {
                reason: format!(
                    "invalid seq-no range [{}, {}]",
                    self.first_seq_no, self.last_seq_no
                ),
            });
        }
        if self.first_offset < 0 {
            return Err(HintsError::InvalidSegment {
                reason: format!("negative first offset {}", self.first_offset),
            });
        }
        if self.last_offset != 0 && self.last_offset < self.first_offset {
            return Err(HintsError::InvalidSegment {
                reason: format!(
                    "last offset {} precedes first offset {}",
                    self.last_offset, self.first_offset
                ),
            });
        }
        Ok(())
    }

    /// Whether this segment's log byte range overlaps `[begin, end)`.
    fn overlaps(&self, begin: i64, end: i64) -> bool {
        if self.first_offset >= end {
            return false;
        }
        self.last_offset == 0 || self.last_offset > begin
    }
}

/// An offset-sorted collection of segments supporting intersection
/// queries against fragment byte ranges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentSet(Vec<Segment>);

impl SegmentSet {
    pub fn add(&mut self, segment: Segment) -> Result<(), HintsError> {
        segment.validate()?;
        if let Some(last) = self.0.last()
            && (segment.first_offset < last.first_offset
                || segment.first_seq_no <= last.last_seq_no)
        {
            return Err(HintsError::InvalidSegment {
                reason: "segments are not ordered".to_string(),
            });
        }
        self.0.push(segment);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[Segment] {
        &self.0
    }

    /// The subset of segments whose byte ranges overlap `[begin, end)`.
    pub fn intersect(&self, begin: i64, end: i64) -> SegmentSet {
        SegmentSet(
            self.0
                .iter()
                .filter(|s| s.overlaps(begin, end))
                .copied()
                .collect(),
        )
    }
}

/// The live operations of one file node: the seq-no which created it
/// and the log segments carrying its operations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FnodeSegments {
    pub fnode: i64,
    pub segments: Vec<Segment>,
}

/// A small file fully captured in hints rather than replayed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub path: String,
    pub content: String,
}

/// A compact FSM snapshot persisted to the consensus store, enabling a
/// new primary to begin playback from the tail of the recovery log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FsmHints {
    pub log: Journal,
    #[serde(default)]
    pub live_nodes: Vec<FnodeSegments>,
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl FsmHints {
    /// Empty-but-valid hints naming `log`.
    pub fn new(log: Journal) -> FsmHints {
        FsmHints {
            log,
            ..FsmHints::default()
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HintsError {
    #[error("hints name an empty recovery log")]
    EmptyLog,
    #[error("hints log {actual} does not match shard recovery log {expected}")]
    WrongLog { expected: Journal, actual: Journal },
    #[error("invalid hints segment: {reason}")]
    InvalidSegment { reason: String },
    #[error("live node {fnode} is invalid: {reason}")]
    InvalidNode { fnode: i64, reason: String },
    #[error("hints encoding: {0}")]
    Codec(#[from] serde_json::Error),
}

/// The recovery-log FSM, constructed from (and validating) hints.
#[derive(Clone, Debug, PartialEq)]
pub struct Fsm {
    log: Journal,
    live_nodes: Vec<FnodeSegments>,
    properties: Vec<Property>,
}

impl Fsm {
    /// Build an FSM from hints, rejecting malformed ones.
    pub fn new(hints: FsmHints) -> Result<Fsm, HintsError> {
        if hints.log.is_empty() {
            return Err(HintsError::EmptyLog);
        }
        let mut prev_fnode = 0i64;
        for node in &hints.live_nodes {
            if node.fnode <= prev_fnode {
                return Err(HintsError::InvalidNode {
                    fnode: node.fnode,
                    reason: "live nodes are not ordered by fnode".to_string(),
                });
            }
            prev_fnode = node.fnode;

            let first = node.segments.first().ok_or_else(|| HintsError::InvalidNode {
                fnode: node.fnode,
                reason: "live node has no segments".to_string(),
            })?;
            if first.first_seq_no != node.fnode {
                return Err(HintsError::InvalidNode {
                    fnode: node.fnode,
                    reason: format!(
                        "first segment seq-no {} does not match fnode",
                        first.first_seq_no
                    ),
                });
            }
            let mut prev: Option<&Segment> = None;
            for segment in &node.segments {
                segment.validate()?;
                if let Some(prev) = prev
                    && (segment.first_seq_no <= prev.last_seq_no
                        || segment.first_offset < prev.first_offset)
                {
                    return Err(HintsError::InvalidNode {
                        fnode: node.fnode,
                        reason: "segments are not ordered".to_string(),
                    });
                }
                prev = Some(segment);
            }
        }
        Ok(Fsm {
            log: hints.log,
            live_nodes: hints.live_nodes,
            properties: hints.properties,
        })
    }

    pub fn log(&self) -> &Journal {
        &self.log
    }

    /// Round-trip the FSM back into hints.
    pub fn build_hints(&self) -> FsmHints {
        FsmHints {
            log: self.log.clone(),
            live_nodes: self.live_nodes.clone(),
            properties: self.properties.clone(),
        }
    }

    /// All live segments of the log, flattened and offset-sorted.
    /// Fragments intersecting none of them hold no live operations.
    pub fn live_log_segments(&self) -> SegmentSet {
        let mut segments: Vec<Segment> = self
            .live_nodes
            .iter()
            .flat_map(|node| node.segments.iter().copied())
            .collect();
        segments.sort_by_key(|s| (s.first_offset, s.first_seq_no));

        let mut set = SegmentSet::default();
        for segment in segments {
            // Validated at construction; ordering is by sort.
            set.0.push(segment);
        }
        set
    }
}

/// A write fence through the recorder. The `done` receiver disconnects
/// once the fenced writes are durable.
pub struct Barrier {
    rx: Receiver<()>,
}

impl Barrier {
    /// A barrier and the release resolving it.
    pub fn new() -> (BarrierRelease, Barrier) {
        let (tx, rx) = channel::bounded::<()>(0);
        (BarrierRelease { _tx: tx }, Barrier { rx })
    }

    /// An already-resolved barrier.
    pub fn resolved() -> Barrier {
        let (release, barrier) = Barrier::new();
        release.release();
        barrier
    }

    /// Select-able completion channel.
    pub fn done(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Block until the barrier resolves.
    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self.rx.try_recv(),
            Err(channel::TryRecvError::Disconnected)
        )
    }
}

/// Resolves its paired barrier when released or dropped.
pub struct BarrierRelease {
    _tx: Sender<()>,
}

impl BarrierRelease {
    pub fn release(self) {}
}

/// Replays a recovery log into a local directory.
///
/// `play` blocks until playback completes: after `inject_handoff` the
/// player reads through the log head, writes a handoff record under the
/// new author, and returns. Implementations close `done` when `play`
/// returns, and surface the recovered FSM via `take_fsm` only when
/// playback built a valid one.
pub trait Player: Send + Sync {
    fn play(
        &self,
        token: &CancelToken,
        hints: FsmHints,
        dir: &Path,
        client: &dyn JournalClient,
    ) -> Result<(), PlayError>;

    /// Ask playback to finish by injecting a handoff record authored by
    /// `author`, superseding any other recorder still writing.
    fn inject_handoff(&self, author: Author);

    /// Disconnects when playback has completed.
    fn done(&self) -> Receiver<()>;

    /// The recovered FSM, if playback completed successfully.
    fn take_fsm(&self) -> Option<Fsm>;
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlayError {
    #[error("reading recovery log: {0}")]
    Log(#[from] crate::journal::ClientError),
    #[error("replaying into working directory: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Hints(#[from] HintsError),
}

/// Records a shard store's operations into its recovery log.
pub trait Recorder: Send {
    /// Snapshot the FSM as hints for persistence.
    fn build_hints(&self) -> FsmHints;

    /// A barrier which resolves only once pending writes to all
    /// journals are durable.
    fn strong_barrier(&mut self) -> Barrier;

    /// A barrier over pending writes to the recovery log alone.
    fn weak_barrier(&mut self) -> Barrier;
}

/// The default recorder: owns the recovered FSM and fences through the
/// journal client.
pub struct FsmRecorder {
    fsm: Mutex<Fsm>,
    author: Author,
    dir: PathBuf,
    client: Arc<dyn JournalClient>,
}

impl FsmRecorder {
    pub fn new(fsm: Fsm, author: Author, dir: PathBuf, client: Arc<dyn JournalClient>) -> Self {
        Self {
            fsm: Mutex::new(fsm),
            author,
            dir,
            client,
        }
    }

    pub fn author(&self) -> Author {
        self.author
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Recorder for FsmRecorder {
    fn build_hints(&self) -> FsmHints {
        self.fsm
            .lock()
            .expect("recorder fsm lock poisoned")
            .build_hints()
    }

    fn strong_barrier(&mut self) -> Barrier {
        self.client.flush_barrier()
    }

    fn weak_barrier(&mut self) -> Barrier {
        let log = {
            let fsm = self.fsm.lock().expect("recorder fsm lock poisoned");
            fsm.log().clone()
        };
        self.client.write_barrier(&log)
    }
}
