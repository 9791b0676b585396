//! Pruning of recovery-log fragments no longer referenced by hints.
//!
//! Hints pin the live segments of a shard's recovery log. Persisted
//! fragments intersecting none of those segments hold only dead
//! operations and can be deleted from their backing stores.

use super::hints::fetch_backup_hints;
use super::{ShardError, ShardSpec, extend_err};
use crate::fragment::{StoreAdapter, walk_all_stores};
use crate::journal::JournalClient;
use crate::kv::ConsensusStore;
use crate::metrics;
use crate::recoverylog::Fsm;

/// Accounting of one prune pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub total_fragments: usize,
    pub pruned_fragments: usize,
    pub total_bytes: i64,
    pub pruned_bytes: i64,
}

/// Delete persisted recovery-log fragments of `spec` which intersect no
/// live hinted segment. With `dry_run`, candidates are logged and
/// counted but not deleted.
pub fn prune_shard_log(
    spec: &ShardSpec,
    kv: &dyn ConsensusStore,
    client: &dyn JournalClient,
    adapter: &dyn StoreAdapter,
    dry_run: bool,
) -> Result<PruneStats, ShardError> {
    let hints = fetch_backup_hints(spec, kv)
        .map_err(|err| extend_err(err, "fetching backup hints"))?
        .ok_or_else(|| ShardError::NoBackupHints(spec.id.clone()))?;
    let segments = Fsm::new(hints)?.live_log_segments();

    let log_spec = client
        .fetch_spec(&spec.recovery_log)
        .map_err(|err| extend_err(err.into(), "fetching recovery log spec"))?;
    let set = walk_all_stores(&spec.recovery_log, &log_spec.stores, adapter)?;

    let mut stats = PruneStats::default();
    for fragment in &set {
        stats.total_fragments += 1;
        stats.total_bytes += fragment.content_length();

        // Live fragments have no backing object to delete.
        let Some(store) = &fragment.backing_store else {
            continue;
        };
        if !segments.intersect(fragment.begin, fragment.end).is_empty() {
            continue;
        }

        tracing::warn!(
            log = %fragment.journal,
            name = %fragment.content_name(),
            size = fragment.content_length(),
            mod_time = fragment.mod_time,
            "pruning fragment"
        );
        stats.pruned_fragments += 1;
        stats.pruned_bytes += fragment.content_length();

        if !dry_run {
            adapter.remove(store, fragment)?;
            metrics::fragment_pruned(fragment.content_length());
        }
    }

    tracing::info!(
        shard = %spec.id,
        total_fragments = stats.total_fragments,
        pruned = stats.pruned_fragments,
        live = stats.total_fragments - stats.pruned_fragments,
        total_bytes = stats.total_bytes,
        pruned_bytes = stats.pruned_bytes,
        live_bytes = stats.total_bytes - stats.pruned_bytes,
        "finished pruning log for shard"
    );
    Ok(stats)
}
