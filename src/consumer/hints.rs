//! Hint storage and rotation in the consensus store.
//!
//! A shard's `hint_keys` are an ordered list of consensus-store keys:
//! slot 0 holds hints recorded periodically by the live primary, slot 1
//! holds hints recovered at handoff, and slots beyond retain rotation
//! history. Every write is guarded by the create revision of the
//! shard's assignment key, so a preempted primary cannot clobber its
//! successor.

use bytes::Bytes;

use super::{Shard, ShardError, ShardSpec, extend_err};
use crate::kv::{Compare, ConsensusStore, KeyValue, TxnOp};
use crate::recoverylog::{Fsm, FsmHints, HintsError};

/// Fetch the shard's current best hints: the first populated hint slot
/// whose value decodes, validates as an FSM, and names the shard's
/// recovery log. When no slot is populated, empty-but-valid hints
/// naming the recovery log are returned.
///
/// Also returns the raw value of every slot, positionally aligned with
/// `spec.hint_keys`, for use in transactional rotation.
pub fn fetch_hints(
    spec: &ShardSpec,
    kv: &dyn ConsensusStore,
) -> Result<(FsmHints, Vec<Option<KeyValue>>), ShardError> {
    let slots = kv.range(&spec.hint_keys)?;

    for slot in &slots {
        let Some(slot) = slot else { continue };
        let hints: FsmHints = serde_json::from_slice(&slot.value)
            .map_err(HintsError::Codec)?;
        Fsm::new(hints.clone())?;
        if hints.log != spec.recovery_log {
            return Err(HintsError::WrongLog {
                expected: spec.recovery_log.clone(),
                actual: hints.log,
            }
            .into());
        }
        return Ok((hints, slots));
    }
    Ok((FsmHints::new(spec.recovery_log.clone()), slots))
}

/// Fetch the most recent populated backup hints (slots 1 and beyond),
/// preferring the deepest rotation slot: it reflects the oldest
/// recovery still potentially referenced.
pub fn fetch_backup_hints(
    spec: &ShardSpec,
    kv: &dyn ConsensusStore,
) -> Result<Option<FsmHints>, ShardError> {
    let (_, slots) = fetch_hints(spec, kv)?;

    for slot in slots.iter().skip(1).rev() {
        let Some(slot) = slot else { continue };
        let hints: FsmHints = serde_json::from_slice(&slot.value)
            .map_err(HintsError::Codec)?;
        return Ok(Some(hints));
    }
    Ok(None)
}

/// Write `hints` into hint slot 0, guarded by the shard assignment
/// still being in effect. Returns false when the guard failed: the
/// primary has been preempted and should shut down, but the failure is
/// not itself fatal.
pub fn store_recorded_hints(
    shard: &dyn Shard,
    hints: &FsmHints,
    kv: &dyn ConsensusStore,
) -> Result<bool, ShardError> {
    let spec = shard.spec();
    let value = encode(hints)?;
    let assignment = shard.assignment();

    let ok = kv.txn(
        vec![Compare::CreateRevision {
            key: assignment.key,
            revision: assignment.create_revision,
        }],
        vec![TxnOp::Put {
            key: spec.hint_keys[0].clone(),
            value,
        }],
    )?;
    Ok(ok)
}

/// Write `hints` into hint slot 1, rotating the prior value of each
/// backup slot one position deeper as a single transaction: slot 1's
/// prior value moves to slot 2, and so on until the chain reaches an
/// empty slot or runs out of keys.
///
/// Concurrent modification of any touched slot, or loss of the
/// assignment, rejects the transaction with `HintRotationConflict`.
pub fn store_recovered_hints(
    shard: &dyn Shard,
    hints: &FsmHints,
    kv: &dyn ConsensusStore,
) -> Result<(), ShardError> {
    let spec = shard.spec();
    let (_, slots) = fetch_hints(&spec, kv)?;
    let assignment = shard.assignment();

    let mut compares = vec![Compare::CreateRevision {
        key: assignment.key,
        revision: assignment.create_revision,
    }];
    let mut ops = Vec::new();

    // Slot 0 belongs to the live primary's recorded hints and is never
    // rotated.
    let mut value = Some(encode(hints)?);
    for (key, slot) in spec.hint_keys.iter().zip(&slots).skip(1) {
        let Some(value_to_place) = value.take() else {
            break;
        };
        ops.push(TxnOp::Put {
            key: key.clone(),
            value: value_to_place,
        });
        match slot {
            None => {
                // The slot must still be empty; the chain ends here.
                compares.push(Compare::ModRevision {
                    key: key.clone(),
                    revision: 0,
                });
            }
            Some(prior) => {
                // The slot must be unchanged since fetch; its prior
                // value shifts into the next slot.
                compares.push(Compare::ModRevision {
                    key: key.clone(),
                    revision: prior.mod_revision,
                });
                value = Some(prior.value.clone());
            }
        }
    }

    if !kv.txn(compares, ops)? {
        return Err(ShardError::HintRotationConflict);
    }
    Ok(())
}

fn encode(hints: &FsmHints) -> Result<Bytes, ShardError> {
    let value = serde_json::to_vec(hints).map_err(HintsError::Codec)?;
    Ok(Bytes::from(value))
}

/// Fetch hints with a human context attached to failures.
pub(crate) fn fetch_hints_ctx(
    spec: &ShardSpec,
    kv: &dyn ConsensusStore,
) -> Result<FsmHints, ShardError> {
    fetch_hints(spec, kv)
        .map(|(hints, _)| hints)
        .map_err(|err| extend_err(err, "fetching FSM hints"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cancel::CancelToken;
    use crate::consumer::testutil::{TestShard, shard_spec};
    use crate::journal::Journal;
    use crate::kv::MemStore;

    fn spec() -> ShardSpec {
        shard_spec("shard-a")
    }

    fn shard_with(kv: &MemStore) -> TestShard {
        TestShard::new(spec(), kv, CancelToken::never())
    }

    fn hints(log: &str) -> FsmHints {
        FsmHints::new(Journal::new(log))
    }

    fn slot_hints(kv: &MemStore, key: &str) -> Option<FsmHints> {
        kv.get(key)
            .map(|kvv| serde_json::from_slice(&kvv.value).unwrap())
    }

    #[test]
    fn fetch_of_empty_slots_yields_valid_empty_hints() {
        let kv = MemStore::new();
        let (fetched, slots) = fetch_hints(&spec(), &kv).unwrap();
        assert_eq!(fetched, hints("recovery/shard-a"));
        assert_eq!(slots.len(), 3);
        assert!(slots.iter().all(Option::is_none));
    }

    #[test]
    fn fetch_returns_first_populated_slot() {
        let kv = MemStore::new();
        let mut second = hints("recovery/shard-a");
        second.properties.push(crate::recoverylog::Property {
            path: "/slot".to_string(),
            content: "recovered".to_string(),
        });
        kv.put(
            "/hints/shard-a.recovered",
            Bytes::from(serde_json::to_vec(&second).unwrap()),
        )
        .unwrap();

        let (fetched, _) = fetch_hints(&spec(), &kv).unwrap();
        assert_eq!(fetched, second);

        // A populated slot 0 takes precedence.
        let mut first = hints("recovery/shard-a");
        first.properties.push(crate::recoverylog::Property {
            path: "/slot".to_string(),
            content: "recorded".to_string(),
        });
        kv.put(
            "/hints/shard-a.recorded",
            Bytes::from(serde_json::to_vec(&first).unwrap()),
        )
        .unwrap();

        let (fetched, _) = fetch_hints(&spec(), &kv).unwrap();
        assert_eq!(fetched, first);
    }

    #[test]
    fn fetch_rejects_wrong_log() {
        let kv = MemStore::new();
        kv.put(
            "/hints/shard-a.recorded",
            Bytes::from(serde_json::to_vec(&hints("recovery/other")).unwrap()),
        )
        .unwrap();

        assert!(matches!(
            fetch_hints(&spec(), &kv),
            Err(ShardError::Hints(
                HintsError::WrongLog { .. }
            ))
        ));
    }

    #[test]
    fn fetch_rejects_invalid_hints() {
        let kv = MemStore::new();
        // An empty log fails FSM construction.
        kv.put(
            "/hints/shard-a.recorded",
            Bytes::from(serde_json::to_vec(&hints("")).unwrap()),
        )
        .unwrap();

        assert!(matches!(
            fetch_hints(&spec(), &kv),
            Err(ShardError::Hints(_))
        ));

        let kv = MemStore::new();
        kv.put("/hints/shard-a.recorded", Bytes::from_static(b"not json"))
            .unwrap();
        assert!(matches!(
            fetch_hints(&spec(), &kv),
            Err(ShardError::Hints(
                HintsError::Codec(_)
            ))
        ));
    }

    #[test]
    fn store_recorded_writes_slot_zero_under_guard() {
        let kv = MemStore::new();
        let shard = shard_with(&kv);

        let ok = store_recorded_hints(&shard, &hints("recovery/shard-a"), &kv).unwrap();
        assert!(ok);
        assert_eq!(
            slot_hints(&kv, "/hints/shard-a.recorded"),
            Some(hints("recovery/shard-a"))
        );
    }

    #[test]
    fn store_recorded_detects_preemption() {
        let kv = MemStore::new();
        let mut shard = shard_with(&kv);
        // A newer assignment re-created the key at a later revision.
        shard.assignment.create_revision -= 1;

        let ok = store_recorded_hints(&shard, &hints("recovery/shard-a"), &kv).unwrap();
        assert!(!ok);
        assert_eq!(slot_hints(&kv, "/hints/shard-a.recorded"), None);
    }

    #[test]
    fn store_recovered_fills_first_backup_slot() {
        let kv = MemStore::new();
        let shard = shard_with(&kv);

        store_recovered_hints(&shard, &hints("recovery/shard-a"), &kv).unwrap();
        assert_eq!(
            slot_hints(&kv, "/hints/shard-a.recovered"),
            Some(hints("recovery/shard-a"))
        );
        // The chain stopped at the empty slot: nothing rotated deeper.
        assert_eq!(slot_hints(&kv, "/hints/shard-a.backup-1"), None);
        // Slot 0 is never touched by rotation.
        assert_eq!(slot_hints(&kv, "/hints/shard-a.recorded"), None);
    }

    #[test]
    fn store_recovered_shifts_prior_value_right() {
        let kv = MemStore::new();
        let shard = shard_with(&kv);

        let mut older = hints("recovery/shard-a");
        older.properties.push(crate::recoverylog::Property {
            path: "/age".to_string(),
            content: "older".to_string(),
        });
        store_recovered_hints(&shard, &older, &kv).unwrap();

        let newer = hints("recovery/shard-a");
        store_recovered_hints(&shard, &newer, &kv).unwrap();

        assert_eq!(slot_hints(&kv, "/hints/shard-a.recovered"), Some(newer));
        assert_eq!(slot_hints(&kv, "/hints/shard-a.backup-1"), Some(older));
    }

    #[test]
    fn store_recovered_drops_history_beyond_last_slot() {
        let kv = MemStore::new();
        let shard = shard_with(&kv);

        for age in ["first", "second", "third"] {
            let mut h = hints("recovery/shard-a");
            h.properties.push(crate::recoverylog::Property {
                path: "/age".to_string(),
                content: age.to_string(),
            });
            store_recovered_hints(&shard, &h, &kv).unwrap();
        }

        let recovered = slot_hints(&kv, "/hints/shard-a.recovered").unwrap();
        let backup = slot_hints(&kv, "/hints/shard-a.backup-1").unwrap();
        assert_eq!(recovered.properties[0].content, "third");
        assert_eq!(backup.properties[0].content, "second");
        // "first" fell off the end of the chain.
    }

    #[test]
    fn store_recovered_surfaces_rotation_conflict() {
        let kv = MemStore::new();
        let mut shard = shard_with(&kv);
        shard.assignment.create_revision -= 1;

        assert!(matches!(
            store_recovered_hints(&shard, &hints("recovery/shard-a"), &kv),
            Err(ShardError::HintRotationConflict)
        ));
    }

    #[test]
    fn fetch_backup_prefers_deepest_slot() {
        let kv = MemStore::new();
        let shard = shard_with(&kv);

        assert!(fetch_backup_hints(&spec(), &kv).unwrap().is_none());

        let mut older = hints("recovery/shard-a");
        older.properties.push(crate::recoverylog::Property {
            path: "/age".to_string(),
            content: "older".to_string(),
        });
        store_recovered_hints(&shard, &older, &kv).unwrap();
        store_recovered_hints(&shard, &hints("recovery/shard-a"), &kv).unwrap();

        let backup = fetch_backup_hints(&spec(), &kv).unwrap().unwrap();
        assert_eq!(backup, older);
    }
}
