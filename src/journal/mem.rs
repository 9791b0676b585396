//! In-process journal client backing tests and embedded pipelines.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use super::{ClientError, Journal, JournalClient, JournalRead, JournalSpec};
use crate::cancel::CancelToken;
use crate::fragment::Fragment;
use crate::recoverylog::Barrier;

/// An in-memory `JournalClient`. Appends are durable the moment they
/// land, so every barrier is returned already resolved. Readers block
/// on a condvar until content arrives or their token fires.
#[derive(Clone, Default)]
pub struct MemJournalClient {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    journals: Mutex<HashMap<Journal, MemJournal>>,
    grew: Condvar,
}

struct MemJournal {
    spec: JournalSpec,
    content: Vec<u8>,
}

impl MemJournalClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_journal(&self, spec: JournalSpec) {
        let mut journals = self.shared.journals.lock().expect("journal lock poisoned");
        journals.insert(
            spec.name.clone(),
            MemJournal {
                spec,
                content: Vec::new(),
            },
        );
    }

    /// Current write head of `journal`.
    pub fn head(&self, journal: &Journal) -> i64 {
        let journals = self.shared.journals.lock().expect("journal lock poisoned");
        journals
            .get(journal)
            .map(|j| j.content.len() as i64)
            .unwrap_or(0)
    }
}

impl JournalClient for MemJournalClient {
    fn fetch_spec(&self, journal: &Journal) -> Result<JournalSpec, ClientError> {
        let journals = self.shared.journals.lock().expect("journal lock poisoned");
        journals
            .get(journal)
            .map(|j| j.spec.clone())
            .ok_or_else(|| ClientError::NoSuchJournal(journal.clone()))
    }

    fn open_reader(
        &self,
        journal: &Journal,
        offset: i64,
        token: CancelToken,
    ) -> Box<dyn JournalRead> {
        Box::new(MemReader {
            shared: self.shared.clone(),
            journal: journal.clone(),
            offset,
            token,
        })
    }

    fn append(&self, journal: &Journal, content: &[u8]) -> Result<Barrier, ClientError> {
        let mut journals = self.shared.journals.lock().expect("journal lock poisoned");
        let entry = journals
            .get_mut(journal)
            .ok_or_else(|| ClientError::NoSuchJournal(journal.clone()))?;
        entry.content.extend_from_slice(content);
        self.shared.grew.notify_all();
        Ok(Barrier::resolved())
    }

    fn write_barrier(&self, _journal: &Journal) -> Barrier {
        Barrier::resolved()
    }

    fn flush_barrier(&self) -> Barrier {
        Barrier::resolved()
    }
}

struct MemReader {
    shared: Arc<Shared>,
    journal: Journal,
    offset: i64,
    token: CancelToken,
}

impl io::Read for MemReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut journals = self.shared.journals.lock().expect("journal lock poisoned");
        loop {
            if self.token.is_canceled() {
                return Err(io::Error::other("journal read canceled"));
            }
            let content = journals
                .get(&self.journal)
                .map(|j| j.content.as_slice())
                .unwrap_or_default();
            let offset = self.offset as usize;
            if offset < content.len() {
                let n = (content.len() - offset).min(buf.len());
                buf[..n].copy_from_slice(&content[offset..offset + n]);
                self.offset += n as i64;
                return Ok(n);
            }
            // Block for growth, waking periodically to observe the
            // cancellation token.
            let (guard, _) = self
                .shared
                .grew
                .wait_timeout(journals, Duration::from_millis(10))
                .expect("journal lock poisoned");
            journals = guard;
        }
    }
}

impl JournalRead for MemReader {
    fn adjusted_offset(&self, buffered: i64) -> i64 {
        self.offset - buffered
    }

    fn fragment(&self) -> Option<Fragment> {
        None
    }
}
