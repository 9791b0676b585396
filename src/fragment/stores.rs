//! Object-store adapter interface for persisted fragments.
//!
//! A backing store is addressed by a URL prefix; fragment objects live
//! under `<prefix><journal>/<content-name><codec-extension>`. The
//! adapter lists, signs GET URLs for, and deletes those objects.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Fragment;
use crate::journal::Journal;

/// URL prefix of a backing store, e.g. `s3://bucket/prefix/` or
/// `file:///var/journals/`. Always ends with a slash.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreUrl(String);

impl StoreUrl {
    pub fn new(url: impl Into<String>) -> StoreUrl {
        let mut url = url.into();
        if !url.ends_with('/') {
            url.push('/');
        }
        StoreUrl(url)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StoreUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A listed fragment object: its name relative to the store prefix, and
/// its modification time in Unix seconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreObject {
    pub name: String,
    pub mod_time: i64,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("listing store {store}: {reason}")]
    List { store: StoreUrl, reason: String },
    #[error("object {name} not found in store {store}")]
    NotFound { store: StoreUrl, name: String },
    #[error("signing {name} in store {store}: {reason}")]
    Sign {
        store: StoreUrl,
        name: String,
        reason: String,
    },
}

pub trait StoreAdapter: Send + Sync {
    /// List objects of `journal` under the store prefix.
    fn list(&self, store: &StoreUrl, journal: &Journal) -> Result<Vec<StoreObject>, StoreError>;

    /// Produce a signed GET URL for the fragment's object, valid for
    /// `ttl`.
    fn sign_get_url(
        &self,
        store: &StoreUrl,
        fragment: &Fragment,
        ttl: Duration,
    ) -> Result<String, StoreError>;

    /// Delete the fragment's object.
    fn remove(&self, store: &StoreUrl, fragment: &Fragment) -> Result<(), StoreError>;
}

/// Object name of a fragment relative to its store prefix.
pub(crate) fn object_name(fragment: &Fragment) -> String {
    format!(
        "{}/{}{}",
        fragment.journal,
        fragment.content_name(),
        fragment.codec.extension()
    )
}

/// In-process `StoreAdapter` keyed by store URL. Signing simply joins
/// the prefix and object name; listing failures can be injected to
/// exercise error paths.
#[derive(Default)]
pub struct MemStoreAdapter {
    inner: Mutex<MemStores>,
}

#[derive(Default)]
struct MemStores {
    objects: BTreeMap<StoreUrl, BTreeMap<String, i64>>,
    failing: Vec<StoreUrl>,
}

impl MemStoreAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist a fragment object into `store`, stamping `mod_time`.
    pub fn insert(&self, store: &StoreUrl, fragment: &Fragment, mod_time: i64) {
        let mut inner = self.inner.lock().expect("store adapter lock poisoned");
        inner
            .objects
            .entry(store.clone())
            .or_default()
            .insert(object_name(fragment), mod_time);
    }

    /// Make subsequent listings of `store` fail.
    pub fn fail_store(&self, store: &StoreUrl) {
        let mut inner = self.inner.lock().expect("store adapter lock poisoned");
        inner.failing.push(store.clone());
    }

    pub fn contains(&self, store: &StoreUrl, fragment: &Fragment) -> bool {
        let inner = self.inner.lock().expect("store adapter lock poisoned");
        inner
            .objects
            .get(store)
            .is_some_and(|objects| objects.contains_key(&object_name(fragment)))
    }
}

impl StoreAdapter for MemStoreAdapter {
    fn list(&self, store: &StoreUrl, journal: &Journal) -> Result<Vec<StoreObject>, StoreError> {
        let inner = self.inner.lock().expect("store adapter lock poisoned");
        if inner.failing.contains(store) {
            return Err(StoreError::List {
                store: store.clone(),
                reason: "injected listing failure".to_string(),
            });
        }
        let prefix = format!("{journal}/");
        Ok(inner
            .objects
            .get(store)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|(name, _)| name.starts_with(&prefix))
                    .map(|(name, &mod_time)| StoreObject {
                        name: name.clone(),
                        mod_time,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn sign_get_url(
        &self,
        store: &StoreUrl,
        fragment: &Fragment,
        _ttl: Duration,
    ) -> Result<String, StoreError> {
        Ok(format!("{}{}", store, object_name(fragment)))
    }

    fn remove(&self, store: &StoreUrl, fragment: &Fragment) -> Result<(), StoreError> {
        let name = object_name(fragment);
        let mut inner = self.inner.lock().expect("store adapter lock poisoned");
        let removed = inner
            .objects
            .get_mut(store)
            .and_then(|objects| objects.remove(&name));
        if removed.is_none() {
            return Err(StoreError::NotFound {
                store: store.clone(),
                name,
            });
        }
        Ok(())
    }
}
