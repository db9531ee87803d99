//! Lock validation: the full conflict matrix for acquiring a lock on a
//! node. `None` for a transaction id stands for "outside any transaction";
//! an outside-transaction request is never mandatory.

use std::collections::HashMap;

use thiserror::Error;

use super::model::{CypressNode, LockMode, LockRequest, Transaction, TransactionId};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("{0:?} lock requires a transaction")]
    SnapshotRequiresTransaction(LockMode),
    #[error("cannot take {requested:?} lock since {existing:?} lock is already taken by the same transaction")]
    SameTransactionLockConflict { requested: LockMode, existing: LockMode },
    #[error("cannot take {requested:?} lock since {existing:?} lock is taken by descendant transaction {descendant}")]
    DescendantTransactionLockConflict { requested: LockMode, existing: LockMode, descendant: TransactionId },
    #[error("cannot take {requested:?} lock since {existing:?} lock is taken by concurrent transaction {concurrent}")]
    ConcurrentTransactionLockConflict { requested: LockMode, existing: LockMode, concurrent: TransactionId },
    #[error("cannot take lock: pending locks exist for this node")]
    PendingLockConflict,
}

/// Is `ancestor_candidate` equal to `transaction` or one of its ancestors?
/// `None` (no transaction) has no ancestor chain, so the walk never runs.
pub fn is_parent_transaction(
    transactions: &HashMap<TransactionId, Transaction>,
    transaction: Option<TransactionId>,
    ancestor_candidate: Option<TransactionId>,
) -> bool {
    let mut current = transaction;
    loop {
        let Some(id) = current else { return false };
        if Some(id) == ancestor_candidate {
            return true;
        }
        current = transactions.get(&id).and_then(|t| t.parent);
    }
}

pub fn is_concurrent_transaction(
    transactions: &HashMap<TransactionId, Transaction>,
    a: Option<TransactionId>,
    b: Option<TransactionId>,
) -> bool {
    !is_parent_transaction(transactions, a, b) && !is_parent_transaction(transactions, b, a)
}

fn is_redundant_lock_request(state: &super::model::TransactionLockState, request: &LockRequest) -> bool {
    if state.mode > request.mode && request.mode != LockMode::Snapshot {
        return true;
    }
    if state.mode == request.mode {
        if request.mode == LockMode::Shared {
            if let Some(key) = &request.child_key {
                if !state.child_keys.contains(key) {
                    return false;
                }
            }
            if let Some(key) = &request.attribute_key {
                if !state.attribute_keys.contains(key) {
                    return false;
                }
            }
        }
        return true;
    }
    false
}

/// Returns `Ok(is_mandatory)` on success, matching `ValidateLock`'s
/// `(TError, bool* isMandatory)` out-parameter pair.
pub fn validate_lock(
    node: &CypressNode,
    transactions: &HashMap<TransactionId, Transaction>,
    transaction: Option<TransactionId>,
    request: &LockRequest,
    check_pending: bool,
    locks: &HashMap<super::model::LockId, super::model::Lock>,
) -> Result<bool, LockError> {
    let mut is_mandatory = true;

    if request.mode == LockMode::Snapshot && transaction.is_none() {
        return Err(LockError::SnapshotRequiresTransaction(request.mode));
    }

    if let Some(tx) = transaction {
        if let Some(existing) = node.lock_state_map.get(&tx) {
            if is_redundant_lock_request(existing, request) {
                return Ok(false);
            }
            if existing.mode == LockMode::Snapshot {
                return Err(LockError::SameTransactionLockConflict { requested: request.mode, existing: existing.mode });
            }
        }
    }

    for (&existing_tx, existing_state) in node.lock_state_map.iter() {
        if existing_state.mode == LockMode::Snapshot {
            continue;
        }

        if request.mode == LockMode::Snapshot && is_parent_transaction(transactions, Some(existing_tx), transaction) {
            return Err(LockError::DescendantTransactionLockConflict {
                requested: request.mode,
                existing: existing_state.mode,
                descendant: existing_tx,
            });
        }

        if transaction.is_none() || is_concurrent_transaction(transactions, transaction, Some(existing_tx)) {
            let exclusive_conflict = (request.mode == LockMode::Exclusive && existing_state.mode != LockMode::Snapshot)
                || (existing_state.mode == LockMode::Exclusive && request.mode != LockMode::Snapshot);
            if exclusive_conflict {
                return Err(LockError::ConcurrentTransactionLockConflict {
                    requested: request.mode,
                    existing: existing_state.mode,
                    concurrent: existing_tx,
                });
            }

            if request.mode == LockMode::Shared && existing_state.mode == LockMode::Shared {
                if let Some(key) = &request.child_key {
                    if existing_state.child_keys.contains(key) {
                        return Err(LockError::ConcurrentTransactionLockConflict {
                            requested: request.mode,
                            existing: existing_state.mode,
                            concurrent: existing_tx,
                        });
                    }
                }
                if let Some(key) = &request.attribute_key {
                    if existing_state.attribute_keys.contains(key) {
                        return Err(LockError::ConcurrentTransactionLockConflict {
                            requested: request.mode,
                            existing: existing_state.mode,
                            concurrent: existing_tx,
                        });
                    }
                }
            }
        }
    }

    if transaction.is_none() {
        is_mandatory = false;
    }

    if check_pending && node.last_lock_is_pending(locks) {
        return Err(LockError::PendingLockConflict);
    }

    Ok(is_mandatory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn node() -> CypressNode {
        CypressNode::new(1)
    }

    #[test]
    fn snapshot_lock_requires_a_transaction() {
        let node = node();
        let transactions = HashMap::new();
        let locks = HashMap::new();
        let err = validate_lock(&node, &transactions, None, &LockRequest::new(LockMode::Snapshot), true, &locks).unwrap_err();
        assert!(matches!(err, LockError::SnapshotRequiresTransaction(_)));
    }

    #[test]
    fn snapshot_existing_same_transaction_nonsnapshot_request_conflicts() {
        let mut node = node();
        node.lock_state_map.insert(1, super::super::model::TransactionLockState { mode: LockMode::Snapshot, ..Default::default() });
        let transactions = HashMap::new();
        let locks = HashMap::new();
        let err = validate_lock(&node, &transactions, Some(1), &LockRequest::new(LockMode::Shared), true, &locks).unwrap_err();
        assert!(matches!(
            err,
            LockError::SameTransactionLockConflict { existing: LockMode::Snapshot, requested: LockMode::Shared }
        ));

        let err = validate_lock(&node, &transactions, Some(1), &LockRequest::new(LockMode::Exclusive), true, &locks).unwrap_err();
        assert!(matches!(
            err,
            LockError::SameTransactionLockConflict { existing: LockMode::Snapshot, requested: LockMode::Exclusive }
        ));
    }

    #[test]
    fn redundant_same_transaction_lock_is_not_mandatory() {
        let mut node = node();
        node.lock_state_map.insert(1, super::super::model::TransactionLockState { mode: LockMode::Exclusive, ..Default::default() });
        let transactions = HashMap::new();
        let locks = HashMap::new();
        let mandatory = validate_lock(&node, &transactions, Some(1), &LockRequest::new(LockMode::Shared), true, &locks).unwrap();
        assert!(!mandatory);
    }

    #[test]
    fn concurrent_exclusive_locks_conflict() {
        let mut node = node();
        node.lock_state_map.insert(2, super::super::model::TransactionLockState { mode: LockMode::Exclusive, ..Default::default() });
        let mut transactions = HashMap::new();
        transactions.insert(1, Transaction::new(1, None));
        transactions.insert(2, Transaction::new(2, None));
        let locks = HashMap::new();
        let err = validate_lock(&node, &transactions, Some(1), &LockRequest::new(LockMode::Exclusive), true, &locks).unwrap_err();
        assert!(matches!(err, LockError::ConcurrentTransactionLockConflict { .. }));
    }

    #[test]
    fn nested_transaction_is_not_concurrent_with_parent() {
        let mut node = node();
        node.lock_state_map.insert(1, super::super::model::TransactionLockState { mode: LockMode::Exclusive, ..Default::default() });
        let mut transactions = HashMap::new();
        transactions.insert(1, Transaction::new(1, None));
        transactions.insert(2, Transaction::new(2, Some(1)));
        let locks = HashMap::new();
        // child transaction 2 of 1 requesting exclusive again: not concurrent, no conflict from this check.
        let result = validate_lock(&node, &transactions, Some(2), &LockRequest::new(LockMode::Exclusive), true, &locks);
        assert!(result.is_ok());
    }

    #[test]
    fn snapshot_conflicts_with_descendant_transaction_lock() {
        let mut node = node();
        node.lock_state_map.insert(2, super::super::model::TransactionLockState { mode: LockMode::Exclusive, ..Default::default() });
        let mut transactions = HashMap::new();
        transactions.insert(1, Transaction::new(1, None));
        transactions.insert(2, Transaction::new(2, Some(1)));
        let locks = HashMap::new();
        let err = validate_lock(&node, &transactions, Some(1), &LockRequest::new(LockMode::Snapshot), true, &locks).unwrap_err();
        assert!(matches!(err, LockError::DescendantTransactionLockConflict { .. }));
    }

    #[test]
    fn pending_lock_blocks_non_waitable_request() {
        let mut node = node();
        let mut locks = HashMap::new();
        locks.insert(1, super::super::model::Lock {
            id: 1,
            trunk_node: node.id,
            transaction_id: 7,
            request: LockRequest::new(LockMode::Shared),
            state: super::super::model::LockState::Pending,
        });
        node.lock_list.push_back(1);
        let transactions = HashMap::new();
        let err = validate_lock(&node, &transactions, Some(2), &LockRequest::new(LockMode::Shared), true, &locks).unwrap_err();
        assert!(matches!(err, LockError::PendingLockConflict));
    }
}
