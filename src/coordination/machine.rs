//! Swap state machine
//!
//! Pure transitions over a `SwapRecord`. Nothing here performs I/O; the
//! registry applies these functions under the swap's lock and discards the
//! working copy when one of them fails, so a rejected input never mutates
//! the stored record.
//!
//! All merges are idempotent: replaying a chain event yields `Ok(false)`.

use super::swap::{EscrowUpdate, MerkleProof, Side, SwapRecord, SwapStatus};
use crate::chain::timelock::{self, TimelockSchedule, TimelockStage};
use crate::chain::EscrowSnapshot;
use crate::crypto::{self, Hash};
use crate::error::{SwapError, SwapResult};

use chrono::{DateTime, Utc};

/// Check a revealed secret against the hashlock and record it on both sides.
///
/// Once known on one chain, the secret is valid proof on the other. Callers
/// record the side it was observed on in the audit event.
pub fn reveal_secret(record: &mut SwapRecord, secret: &str) -> SwapResult<bool> {
    if crypto::hashlock(secret) != record.hashlock() {
        return Err(SwapError::SecretMismatch {
            swap_id: record.id.clone(),
        });
    }

    let mut changed = false;
    for side in [Side::Source, Side::Destination] {
        let escrow = record.escrow_mut(side);
        if escrow.revealed_secret.as_deref() != Some(secret) {
            escrow.revealed_secret = Some(secret.to_string());
            changed = true;
        }
    }
    Ok(changed)
}

/// Merge fields into one side and recompute the swap status
pub fn apply_escrow_update(
    record: &mut SwapRecord,
    side: Side,
    update: &EscrowUpdate,
) -> SwapResult<bool> {
    let escrow = record.escrow_mut(side);
    let mut changed = false;

    if let Some(address) = &update.contract_address {
        if escrow.contract_address.is_empty() {
            escrow.contract_address = address.clone();
            changed = true;
        } else if &escrow.contract_address != address {
            return Err(SwapError::InvalidStateTransition {
                from: format!("{} escrow at {}", side, escrow.contract_address),
                to: format!("{} escrow at {}", side, address),
            });
        }
    }

    if let Some(deployed_at) = update.deployed_at {
        if escrow.deployed_at == 0 && deployed_at != 0 {
            escrow.deployed_at = deployed_at;
            changed = true;
        }
    }

    if update.withdrawn == Some(true) && !escrow.withdrawn {
        if escrow.cancelled {
            return Err(settle_conflict(side, "cancelled", "withdrawn"));
        }
        escrow.withdrawn = true;
        changed = true;
    }

    if update.cancelled == Some(true) && !escrow.cancelled {
        if escrow.withdrawn {
            return Err(settle_conflict(side, "withdrawn", "cancelled"));
        }
        escrow.cancelled = true;
        changed = true;
    }

    let status_changed = recompute_status(record);
    Ok(changed || status_changed)
}

fn settle_conflict(side: Side, from: &str, to: &str) -> SwapError {
    SwapError::InvalidStateTransition {
        from: format!("{} escrow {}", side, from),
        to: format!("{} escrow {}", side, to),
    }
}

/// Derive status from both escrows. `failed` is sticky.
pub fn derive_status(record: &SwapRecord) -> SwapStatus {
    if record.status == SwapStatus::Failed {
        return SwapStatus::Failed;
    }

    let src = &record.src_escrow;
    let dst = &record.dst_escrow;

    if src.withdrawn && dst.withdrawn {
        SwapStatus::Completed
    } else if src.cancelled || dst.cancelled {
        SwapStatus::Cancelled
    } else if src.is_deployed() && dst.is_deployed() {
        SwapStatus::Active
    } else if src.is_deployed() || dst.is_deployed() {
        SwapStatus::Deployed
    } else {
        SwapStatus::Pending
    }
}

/// Store the derived status, reporting whether it moved
pub fn recompute_status(record: &mut SwapRecord) -> bool {
    let status = derive_status(record);
    if status != record.status {
        record.status = status;
        true
    } else {
        false
    }
}

/// Stage of the escrow on `side` at chain time `now`
pub fn current_stage(record: &SwapRecord, side: Side, schedule: &TimelockSchedule, now: u64) -> TimelockStage {
    let escrow = record.escrow(side);
    if escrow.deployed_at == 0 {
        return timelock::first_stage(side);
    }
    schedule.stage_at(side, escrow.timelock_duration, escrow.deployed_at, now)
}

/// Stage of the swap, anchored on the first deployed escrow
pub fn swap_stage(record: &SwapRecord, schedule: &TimelockSchedule, now: u64) -> TimelockStage {
    let anchor = if record.src_escrow.deployed_at == 0 && record.dst_escrow.deployed_at != 0 {
        Side::Destination
    } else {
        Side::Source
    };
    current_stage(record, anchor, schedule, now)
}

/// A partial fill that passed every check short of the chain call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedFill {
    pub index: u32,
    /// Secret hash proven to sit at `index` under the committed root
    pub leaf: Hash,
}

/// Validate a partial-fill proof without mutating the record.
///
/// Order of checks: partial fills enabled, proof structure, bounds,
/// duplicate index, fill ordering, Merkle inclusion.
pub fn check_partial_fill(
    record: &SwapRecord,
    side: Side,
    proof: &MerkleProof,
) -> SwapResult<VerifiedFill> {
    let info = record
        .escrow(side)
        .partial_fill
        .as_ref()
        .ok_or_else(|| SwapError::PartialFillsDisabled {
            swap_id: record.id.clone(),
        })?;

    let leaf = crypto::parse_hash(&proof.secret_hash).ok_or_else(|| {
        SwapError::InvalidProof(format!("malformed secret hash {:?}", proof.secret_hash))
    })?;

    let siblings = proof
        .proof
        .iter()
        .enumerate()
        .map(|(level, sibling)| {
            crypto::parse_hash(sibling).ok_or_else(|| {
                SwapError::InvalidProof(format!("malformed sibling hash at level {}", level))
            })
        })
        .collect::<SwapResult<Vec<_>>>()?;

    if proof.index >= info.total_parts {
        return Err(SwapError::InvalidProof(format!(
            "index {} outside of {} parts",
            proof.index, info.total_parts
        )));
    }

    if info.used_indices.contains(&proof.index) {
        return Err(SwapError::DuplicateFill { index: proof.index });
    }

    let expected = info.used_indices.len() as u32;
    if proof.index != expected {
        return Err(SwapError::OutOfOrderFill {
            expected,
            got: proof.index,
        });
    }

    if crypto::root_from_proof(&leaf, proof.index, &siblings) != info.merkle_root {
        return Err(SwapError::InvalidProof(format!(
            "secret hash is not committed at index {}",
            proof.index
        )));
    }

    Ok(VerifiedFill {
        index: proof.index,
        leaf,
    })
}

/// Record a claimed part. Exhausting every part marks the escrow withdrawn.
pub fn record_partial_fill(
    record: &mut SwapRecord,
    side: Side,
    index: u32,
    now: DateTime<Utc>,
) -> SwapResult<bool> {
    let swap_id = record.id.clone();
    let escrow = record.escrow_mut(side);
    let amount = escrow.amount;
    let info = escrow
        .partial_fill
        .as_mut()
        .ok_or(SwapError::PartialFillsDisabled { swap_id })?;

    if info.used_indices.contains(&index) {
        return Ok(false);
    }
    if index >= info.total_parts {
        return Err(SwapError::InvalidProof(format!(
            "index {} outside of {} parts",
            index, info.total_parts
        )));
    }

    info.used_indices.push(index);
    info.used_indices.sort_unstable();
    info.filled_amount = info.amount_after(amount, info.used_indices.len() as u32);
    info.last_validated = Some(now);
    let exhausted = info.is_exhausted();

    if exhausted {
        apply_escrow_update(record, side, &EscrowUpdate::withdrawn())?;
    }
    Ok(true)
}

/// Validate a proof and, on success, consume its index
pub fn validate_partial_fill(
    record: &mut SwapRecord,
    side: Side,
    proof: &MerkleProof,
    now: DateTime<Utc>,
) -> SwapResult<u32> {
    let fill = check_partial_fill(record, side, proof)?;
    record_partial_fill(record, side, fill.index, now)?;
    Ok(fill.index)
}

/// True unless the two sides disagree on the revealed secret
pub fn is_synchronized(record: &SwapRecord) -> bool {
    match (
        &record.src_escrow.revealed_secret,
        &record.dst_escrow.revealed_secret,
    ) {
        (None, None) => true,
        (Some(src), Some(dst)) => src == dst,
        _ => false,
    }
}

/// Fold a chain read-back into one side. Flags only ever move forward.
pub fn merge_snapshot(
    record: &mut SwapRecord,
    side: Side,
    snapshot: &EscrowSnapshot,
    now: DateTime<Utc>,
) -> SwapResult<bool> {
    let mut changed = false;

    if let Some(secret) = &snapshot.revealed_secret {
        changed |= reveal_secret(record, secret)?;
    }

    if record.escrow(side).partial_fill.is_some() {
        for index in &snapshot.used_indices {
            changed |= record_partial_fill(record, side, *index, now)?;
        }
    }

    let update = EscrowUpdate {
        contract_address: None,
        deployed_at: (snapshot.deployed_at != 0).then_some(snapshot.deployed_at),
        withdrawn: snapshot.withdrawn.then_some(true),
        cancelled: snapshot.cancelled.then_some(true),
    };
    changed |= apply_escrow_update(record, side, &update)?;

    Ok(changed)
}

/// Move a swap to `failed` for manual inspection
pub fn mark_failed(record: &mut SwapRecord) -> SwapResult<bool> {
    match record.status {
        SwapStatus::Failed => Ok(false),
        SwapStatus::Completed | SwapStatus::Cancelled => Err(SwapError::AlreadyTerminal {
            swap_id: record.id.clone(),
            status: record.status,
        }),
        _ => {
            record.status = SwapStatus::Failed;
            Ok(true)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::swap::fixtures::{config, partial_config};
    use crate::crypto::SecretTree;

    fn record(secret: &str) -> SwapRecord {
        SwapRecord::new("swap-1".into(), &config(secret), Utc::now())
    }

    fn deployed(secret: &str) -> SwapRecord {
        let mut r = record(secret);
        apply_escrow_update(&mut r, Side::Source, &EscrowUpdate::deployed("0xsrc", 100)).unwrap();
        apply_escrow_update(&mut r, Side::Destination, &EscrowUpdate::deployed("dst.near", 101)).unwrap();
        r
    }

    fn partial_record(tree: &SecretTree) -> SwapRecord {
        let cfg = partial_config("s1", &tree.root(), tree.len() as u32);
        SwapRecord::new("swap-p".into(), &cfg, Utc::now())
    }

    fn proof_for(tree: &SecretTree, index: usize) -> MerkleProof {
        MerkleProof {
            index: index as u32,
            secret_hash: crypto::to_hex(&tree.leaf(index).unwrap()),
            proof: tree.proof(index).unwrap().iter().map(crypto::to_hex).collect(),
        }
    }

    #[test]
    fn test_reveal_mirrors_to_both_sides() {
        let mut r = deployed("s1");
        assert!(reveal_secret(&mut r, "s1").unwrap());

        assert_eq!(r.src_escrow.revealed_secret.as_deref(), Some("s1"));
        assert_eq!(r.dst_escrow.revealed_secret.as_deref(), Some("s1"));
        assert!(!reveal_secret(&mut r, "s1").unwrap());
    }

    #[test]
    fn test_wrong_secret_leaves_record_untouched() {
        let mut r = deployed("s1");
        let before = r.clone();

        let err = reveal_secret(&mut r, "wrong").unwrap_err();
        assert!(matches!(err, SwapError::SecretMismatch { .. }));
        assert_eq!(r, before);
    }

    #[test]
    fn test_status_progression() {
        let mut r = record("s1");
        assert_eq!(r.status, SwapStatus::Pending);

        apply_escrow_update(&mut r, Side::Source, &EscrowUpdate::deployed("0xsrc", 1)).unwrap();
        assert_eq!(r.status, SwapStatus::Deployed);

        apply_escrow_update(&mut r, Side::Destination, &EscrowUpdate::deployed("dst.near", 1)).unwrap();
        assert_eq!(r.status, SwapStatus::Active);

        apply_escrow_update(&mut r, Side::Destination, &EscrowUpdate::withdrawn()).unwrap();
        assert_eq!(r.status, SwapStatus::Active);

        apply_escrow_update(&mut r, Side::Source, &EscrowUpdate::withdrawn()).unwrap();
        assert_eq!(r.status, SwapStatus::Completed);
    }

    #[test]
    fn test_either_side_cancelled_cancels_swap() {
        let mut r = deployed("s1");
        apply_escrow_update(&mut r, Side::Destination, &EscrowUpdate::cancelled()).unwrap();
        assert_eq!(r.status, SwapStatus::Cancelled);
    }

    #[test]
    fn test_updates_are_idempotent() {
        let mut r = deployed("s1");
        assert!(apply_escrow_update(&mut r, Side::Source, &EscrowUpdate::withdrawn()).unwrap());
        let snapshot = r.clone();

        assert!(!apply_escrow_update(&mut r, Side::Source, &EscrowUpdate::withdrawn()).unwrap());
        assert!(!apply_escrow_update(&mut r, Side::Source, &EscrowUpdate::deployed("0xsrc", 100)).unwrap());
        assert_eq!(r, snapshot);
    }

    #[test]
    fn test_withdrawn_and_cancelled_are_exclusive() {
        let mut r = deployed("s1");
        apply_escrow_update(&mut r, Side::Source, &EscrowUpdate::withdrawn()).unwrap();

        let err = apply_escrow_update(&mut r, Side::Source, &EscrowUpdate::cancelled()).unwrap_err();
        assert!(matches!(err, SwapError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_address_cannot_change_once_set() {
        let mut r = deployed("s1");
        let err = apply_escrow_update(&mut r, Side::Source, &EscrowUpdate::deployed("0xother", 100)).unwrap_err();
        assert!(matches!(err, SwapError::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_failed_is_sticky() {
        let mut r = deployed("s1");
        assert!(mark_failed(&mut r).unwrap());
        apply_escrow_update(&mut r, Side::Source, &EscrowUpdate::withdrawn()).unwrap();
        apply_escrow_update(&mut r, Side::Destination, &EscrowUpdate::withdrawn()).unwrap();
        assert_eq!(r.status, SwapStatus::Failed);

        let mut done = deployed("s1");
        apply_escrow_update(&mut done, Side::Source, &EscrowUpdate::cancelled()).unwrap();
        assert!(matches!(mark_failed(&mut done), Err(SwapError::AlreadyTerminal { .. })));
    }

    #[test]
    fn test_synchronization() {
        let mut r = deployed("s1");
        assert!(is_synchronized(&r));

        reveal_secret(&mut r, "s1").unwrap();
        assert!(is_synchronized(&r));

        r.dst_escrow.revealed_secret = Some("corrupted".into());
        assert!(!is_synchronized(&r));

        r.dst_escrow.revealed_secret = None;
        assert!(!is_synchronized(&r));
    }

    #[test]
    fn test_stage_anchors_on_source_deployment() {
        let schedule = TimelockSchedule::default();
        let r = deployed("s1");
        assert_eq!(swap_stage(&r, &schedule, 100 + 700), TimelockStage::SrcWithdrawal);
        assert_eq!(swap_stage(&r, &schedule, 100 + 1_300), TimelockStage::SrcPublicWithdrawal);

        let undeployed = record("s1");
        assert_eq!(swap_stage(&undeployed, &schedule, 99_999), TimelockStage::SrcWithdrawal);
    }

    #[test]
    fn test_stage_follows_side_and_duration() {
        let schedule = TimelockSchedule::default();
        let mut short = deployed("s1");
        let mut long = deployed("s1");
        for side in [Side::Source, Side::Destination] {
            short.escrow_mut(side).timelock_duration = 1;
            long.escrow_mut(side).timelock_duration = 10_000_000;
        }

        let now = 100 + 50_000;
        assert_eq!(current_stage(&short, Side::Destination, &schedule, now), TimelockStage::DstCancellation);
        assert_eq!(current_stage(&long, Side::Destination, &schedule, now), TimelockStage::DstWithdrawal);
        assert_ne!(
            current_stage(&short, Side::Source, &schedule, now),
            current_stage(&long, Side::Source, &schedule, now)
        );

        let fresh = deployed("s1");
        assert_eq!(current_stage(&fresh, Side::Destination, &schedule, 101), TimelockStage::DstWithdrawal);
        assert_eq!(current_stage(&record("s1"), Side::Destination, &schedule, 5), TimelockStage::DstWithdrawal);
    }

    #[test]
    fn test_partial_fills_in_order() {
        let tree = SecretTree::from_secrets(&["p0", "p1", "p2", "p3"]);
        let mut r = partial_record(&tree);

        for index in 0..4 {
            let claimed = validate_partial_fill(&mut r, Side::Destination, &proof_for(&tree, index), Utc::now()).unwrap();
            assert_eq!(claimed, index as u32);
        }

        let info = r.dst_escrow.partial_fill.as_ref().unwrap();
        assert_eq!(info.used_indices, vec![0, 1, 2, 3]);
        assert_eq!(info.filled_amount, 100);
        assert!(r.dst_escrow.withdrawn);

        for index in 0..4 {
            let err = validate_partial_fill(&mut r, Side::Destination, &proof_for(&tree, index), Utc::now()).unwrap_err();
            assert!(matches!(err, SwapError::DuplicateFill { .. }));
        }
    }

    #[test]
    fn test_out_of_order_fill_rejected() {
        let tree = SecretTree::from_secrets(&["p0", "p1", "p2", "p3"]);
        let mut r = partial_record(&tree);

        let err = validate_partial_fill(&mut r, Side::Destination, &proof_for(&tree, 2), Utc::now()).unwrap_err();
        assert!(matches!(err, SwapError::OutOfOrderFill { expected: 0, got: 2 }));
        assert!(r.dst_escrow.partial_fill.as_ref().unwrap().used_indices.is_empty());
    }

    #[test]
    fn test_malformed_proofs_rejected() {
        let tree = SecretTree::from_secrets(&["p0", "p1", "p2", "p3"]);
        let r = partial_record(&tree);

        let mut short_leaf = proof_for(&tree, 0);
        short_leaf.secret_hash = "0xabcd".into();
        assert!(matches!(check_partial_fill(&r, Side::Destination, &short_leaf), Err(SwapError::InvalidProof(_))));

        let mut bad_sibling = proof_for(&tree, 0);
        bad_sibling.proof[1] = "not-hex".into();
        assert!(matches!(check_partial_fill(&r, Side::Destination, &bad_sibling), Err(SwapError::InvalidProof(_))));

        let mut wrong_leaf = proof_for(&tree, 0);
        wrong_leaf.secret_hash = crypto::to_hex(&crypto::hashlock("not-committed"));
        assert!(matches!(check_partial_fill(&r, Side::Destination, &wrong_leaf), Err(SwapError::InvalidProof(_))));

        let mut beyond = proof_for(&tree, 0);
        beyond.index = 4;
        assert!(matches!(check_partial_fill(&r, Side::Destination, &beyond), Err(SwapError::InvalidProof(_))));
    }

    #[test]
    fn test_partial_fill_requires_partial_escrow() {
        let tree = SecretTree::from_secrets(&["p0", "p1"]);
        let r = record("s1");
        assert!(matches!(
            check_partial_fill(&r, Side::Destination, &proof_for(&tree, 0)),
            Err(SwapError::PartialFillsDisabled { .. })
        ));
    }

    #[test]
    fn test_snapshot_merge() {
        let mut r = deployed("s1");
        let snapshot = EscrowSnapshot {
            address: "dst.near".into(),
            deployed_at: 101,
            withdrawn: true,
            revealed_secret: Some("s1".into()),
            ..Default::default()
        };

        assert!(merge_snapshot(&mut r, Side::Destination, &snapshot, Utc::now()).unwrap());
        assert!(r.dst_escrow.withdrawn);
        assert_eq!(r.src_escrow.revealed_secret.as_deref(), Some("s1"));
        assert!(!merge_snapshot(&mut r, Side::Destination, &snapshot, Utc::now()).unwrap());
    }
}
