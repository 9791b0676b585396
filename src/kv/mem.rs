//! In-memory consensus store with revision bookkeeping.

use std::collections::BTreeMap;
use std::sync::Mutex;

use bytes::Bytes;

use super::{Compare, ConsensusStore, KeyValue, KvError, TxnOp};

#[derive(Clone, Debug)]
struct Entry {
    value: Bytes,
    create_revision: i64,
    mod_revision: i64,
}

/// A single-process `ConsensusStore`. All mutations within one `txn`
/// share a single new revision, as an etcd transaction would.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    revision: i64,
    data: BTreeMap<String, Entry>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a single key, mostly for test assertions.
    pub fn get(&self, key: &str) -> Option<KeyValue> {
        let inner = self.inner.lock().expect("mem store lock poisoned");
        inner.data.get(key).map(|entry| KeyValue {
            key: key.to_string(),
            value: entry.value.clone(),
            create_revision: entry.create_revision,
            mod_revision: entry.mod_revision,
        })
    }
}

impl Inner {
    fn holds(&self, compare: &Compare) -> bool {
        match compare {
            Compare::CreateRevision { key, revision } => {
                self.data.get(key).map(|e| e.create_revision).unwrap_or(0) == *revision
            }
            Compare::ModRevision { key, revision } => {
                self.data.get(key).map(|e| e.mod_revision).unwrap_or(0) == *revision
            }
        }
    }
}

impl ConsensusStore for MemStore {
    fn range(&self, keys: &[String]) -> Result<Vec<Option<KeyValue>>, KvError> {
        let inner = self.inner.lock().expect("mem store lock poisoned");
        Ok(keys
            .iter()
            .map(|key| {
                inner.data.get(key).map(|entry| KeyValue {
                    key: key.clone(),
                    value: entry.value.clone(),
                    create_revision: entry.create_revision,
                    mod_revision: entry.mod_revision,
                })
            })
            .collect())
    }

    fn txn(&self, compares: Vec<Compare>, ops: Vec<TxnOp>) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().expect("mem store lock poisoned");

        if !compares.iter().all(|compare| inner.holds(compare)) {
            return Ok(false);
        }

        inner.revision += 1;
        let revision = inner.revision;
        for op in ops {
            match op {
                TxnOp::Put { key, value } => match inner.data.get_mut(&key) {
                    Some(entry) => {
                        entry.value = value;
                        entry.mod_revision = revision;
                    }
                    None => {
                        inner.data.insert(
                            key,
                            Entry {
                                value,
                                create_revision: revision,
                                mod_revision: revision,
                            },
                        );
                    }
                },
            }
        }
        Ok(true)
    }
}
