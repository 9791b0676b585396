//! Walking a journal's fragments across its backing stores.

use std::thread;

use thiserror::Error;

use super::{CompressionCodec, CoverSet, Fragment, StoreAdapter, StoreError, StoreObject, StoreUrl};
use crate::journal::Journal;

/// A per-store listing failure, with the failing store identified.
#[derive(Debug, Error)]
#[error("walking fragments of {journal} in {store}: {source}")]
pub struct WalkError {
    pub journal: Journal,
    pub store: StoreUrl,
    #[source]
    pub source: StoreError,
}

/// List every backing store of `journal` concurrently and fold the
/// parsed fragments into a CoverSet: the union of all stores' fragments
/// deduplicated modulo dominance. Objects which don't parse, or which
/// belong to another journal, are logged and skipped. Any store's
/// listing failure fails the walk; partial progress is discarded.
pub fn walk_all_stores(
    journal: &Journal,
    stores: &[StoreUrl],
    adapter: &dyn StoreAdapter,
) -> Result<CoverSet, WalkError> {
    let listings: Vec<Result<Vec<StoreObject>, StoreError>> = thread::scope(|scope| {
        let handles: Vec<_> = stores
            .iter()
            .map(|store| scope.spawn(move || adapter.list(store, journal)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().expect("store listing thread panicked"))
            .collect()
    });

    // Fold on a single reducer; `add` is never called concurrently.
    let mut set = CoverSet::new();
    for (store, listing) in stores.iter().zip(listings) {
        let objects = listing.map_err(|source| WalkError {
            journal: journal.clone(),
            store: store.clone(),
            source,
        })?;
        for object in objects {
            match parse_store_object(journal, store, &object) {
                Ok(fragment) => {
                    set.add(fragment);
                }
                Err(reason) => {
                    tracing::warn!(
                        store = %store,
                        object = %object.name,
                        %reason,
                        "skipping unrecognized store object"
                    );
                }
            }
        }
    }
    Ok(set)
}

fn parse_store_object(
    journal: &Journal,
    store: &StoreUrl,
    object: &StoreObject,
) -> Result<Fragment, String> {
    let rest = object
        .name
        .strip_prefix(&format!("{journal}/"))
        .ok_or_else(|| format!("object does not belong to journal {journal}"))?;

    let (name, codec) = match rest.rfind('.') {
        Some(dot) => {
            let codec = CompressionCodec::from_extension(&rest[dot..])
                .ok_or_else(|| format!("unrecognized extension {}", &rest[dot..]))?;
            (&rest[..dot], codec)
        }
        None => (rest, CompressionCodec::None),
    };

    let mut fragment = Fragment::parse(name).map_err(|err| err.to_string())?;
    fragment.journal = journal.clone();
    fragment.codec = codec;
    fragment.backing_store = Some(store.clone());
    fragment.mod_time = object.mod_time;
    Ok(fragment)
}
