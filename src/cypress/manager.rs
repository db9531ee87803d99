//! Cypress manager: lock acquisition, transaction commit/abort, pending-lock
//! promotion, access tracking, and per-type node content branch/merge.
//! Resource accounting (account usage propagation) that the real branch
//! path also touches is out of scope here; the lock/transaction lifecycle
//! and the branch/merge dispatch are fully implemented.

use std::collections::{HashMap, HashSet};

use anyhow::{anyhow, Result};

use super::lock::{is_concurrent_transaction, validate_lock, LockError};
use super::model::{
    node_type_handlers, CypressNode, CypressNodeId, Lock, LockId, LockMode, LockRequest, LockState, NodeKind, NodePayload,
    NodeTypeHandler, Transaction, TransactionId, TransactionLockState,
};

pub struct CypressManager {
    pub nodes: HashMap<CypressNodeId, CypressNode>,
    pub transactions: HashMap<TransactionId, Transaction>,
    pub locks: HashMap<LockId, Lock>,
    type_handlers: HashMap<NodeKind, NodeTypeHandler>,
    next_lock_id: LockId,
    clock: u64,
}

impl CypressManager {
    pub fn new() -> Self {
        CypressManager {
            nodes: HashMap::new(),
            transactions: HashMap::new(),
            locks: HashMap::new(),
            type_handlers: node_type_handlers(),
            next_lock_id: 1,
            clock: 0,
        }
    }

    pub fn create_node(&mut self, id: CypressNodeId) {
        self.nodes.entry(id).or_insert_with(|| CypressNode::new(id));
    }

    pub fn create_node_with_payload(&mut self, id: CypressNodeId, payload: NodePayload) {
        self.nodes.entry(id).or_insert_with(|| CypressNode::with_payload(id, payload));
    }

    pub fn add_child(&mut self, parent: CypressNodeId, key: impl Into<String>, child: CypressNodeId) {
        self.create_node(child);
        self.nodes.get_mut(&parent).expect("parent node must exist").children.insert(key.into(), child);
    }

    pub fn start_transaction(&mut self, id: TransactionId, parent: Option<TransactionId>) {
        self.transactions.insert(id, Transaction::new(id, parent));
    }

    fn next_lock_id(&mut self) -> LockId {
        let id = self.next_lock_id;
        self.next_lock_id += 1;
        id
    }

    fn subtree_ids(&self, root: CypressNodeId, recursive: bool) -> Vec<CypressNodeId> {
        if !recursive {
            return vec![root];
        }
        let mut out = vec![root];
        if let Some(node) = self.nodes.get(&root) {
            for &child in node.children.values() {
                out.extend(self.subtree_ids(child, true));
            }
        }
        out
    }

    /// `ValidateLock`, threading through this manager's transaction table.
    fn validate(&self, node_id: CypressNodeId, transaction: Option<TransactionId>, request: &LockRequest, check_pending: bool) -> Result<bool, LockError> {
        let node = &self.nodes[&node_id];
        validate_lock(node, &self.transactions, transaction, request, check_pending, &self.locks)
    }

    /// `UpdateNodeLockState`: records or upgrades the lock-state entry for
    /// one (node, transaction) pair.
    fn update_node_lock_state(&mut self, node_id: CypressNodeId, transaction_id: TransactionId, request: &LockRequest) {
        let tx_locked_nodes = &mut self.transactions.get_mut(&transaction_id).expect("transaction must exist").locked_nodes;
        let node = self.nodes.get_mut(&node_id).expect("node must exist");
        let state = node.lock_state_map.entry(transaction_id).or_insert_with(|| {
            tx_locked_nodes.insert(node_id);
            TransactionLockState { mode: request.mode, ..Default::default() }
        });
        if state.mode < request.mode {
            state.mode = request.mode;
        }
        if let Some(key) = &request.child_key {
            state.child_keys.insert(key.clone());
        }
        if let Some(key) = &request.attribute_key {
            state.attribute_keys.insert(key.clone());
        }
    }

    /// `DoLockNode`: branches the node along the ancestor chain as needed
    /// and bumps every ancestor transaction's recorded lock mode. The
    /// branched-node payload is produced by the node's type handler's
    /// `branch` function, looked up in the handler table by [`NodeKind`].
    fn do_lock_node(&mut self, node_id: CypressNodeId, transaction_id: TransactionId, request: &LockRequest) {
        self.update_node_lock_state(node_id, transaction_id, request);

        if request.mode != LockMode::Snapshot {
            let mut current = self.transactions[&transaction_id].parent;
            while let Some(tx) = current {
                self.update_node_lock_state(node_id, tx, request);
                current = self.transactions[&tx].parent;
            }
        }

        let already_branched = self.nodes[&node_id].branched_payloads.contains_key(&transaction_id);
        if !already_branched {
            let node = &self.nodes[&node_id];
            let handler = self.type_handlers[&node.payload.kind()];
            let branched_payload = (handler.branch)(&node.payload);
            self.nodes.get_mut(&node_id).unwrap().branched_payloads.insert(transaction_id, branched_payload);
            self.transactions.get_mut(&transaction_id).unwrap().branched_nodes.push(node_id);
        }
    }

    fn insert_lock(&mut self, node_id: CypressNodeId, transaction_id: TransactionId, request: LockRequest, state: LockState) -> LockId {
        let id = self.next_lock_id();
        self.locks.insert(id, Lock { id, trunk_node: node_id, transaction_id, request, state });
        self.nodes.get_mut(&node_id).unwrap().lock_list.push_back(id);
        self.transactions.get_mut(&transaction_id).unwrap().locks.insert(id);
        id
    }

    /// `LockNode`: validates the whole (possibly recursive) subtree first,
    /// only creating locks if at least one is mandatory, in deterministic
    /// (sorted-by-key) order.
    pub fn lock_node(&mut self, node_id: CypressNodeId, transaction_id: TransactionId, request: LockRequest, recursive: bool) -> Result<Vec<LockId>> {
        let children = self.subtree_ids(node_id, recursive);

        let mut any_mandatory = false;
        for &child in &children {
            let mandatory = self.validate(child, Some(transaction_id), &request, true)?;
            any_mandatory |= mandatory;
        }
        if !any_mandatory {
            return Ok(Vec::new());
        }

        let mut created = Vec::new();
        for &child in &children {
            let lock_id = self.insert_lock(child, transaction_id, clone_request(&request), LockState::Acquired);
            self.do_lock_node(child, transaction_id, &request);
            created.push(lock_id);
        }
        Ok(created)
    }

    /// `CreateLock` non-recursive path with optional waiting.
    pub fn create_lock(&mut self, node_id: CypressNodeId, transaction_id: TransactionId, request: LockRequest, waitable: bool) -> Result<Option<LockId>> {
        match self.validate(node_id, Some(transaction_id), &request, true) {
            Ok(mandatory) => {
                if !mandatory {
                    return Ok(None);
                }
                let lock_id = self.insert_lock(node_id, transaction_id, clone_request(&request), LockState::Acquired);
                self.do_lock_node(node_id, transaction_id, &request);
                Ok(Some(lock_id))
            }
            Err(err) => {
                if !waitable {
                    return Err(anyhow!(err));
                }
                Ok(Some(self.insert_lock(node_id, transaction_id, request, LockState::Pending)))
            }
        }
    }

    /// `CheckPendingLocks`: scans back to the first pending lock, then
    /// forward, promoting pending locks while validation keeps succeeding.
    fn check_pending_locks(&mut self, node_id: CypressNodeId) {
        let lock_list: Vec<LockId> = self.nodes[&node_id].lock_list.iter().copied().collect();
        let mut first_pending = lock_list.len();
        for (i, &lock_id) in lock_list.iter().enumerate().rev() {
            if self.locks[&lock_id].state == LockState::Acquired {
                break;
            }
            first_pending = i;
        }

        for &lock_id in &lock_list[first_pending..] {
            let (transaction_id, request) = {
                let lock = &self.locks[&lock_id];
                (lock.transaction_id, clone_request(&lock.request))
            };
            match self.validate(node_id, Some(transaction_id), &request, false) {
                Ok(mandatory) => {
                    if mandatory {
                        self.update_node_lock_state(node_id, transaction_id, &request);
                    }
                    self.locks.get_mut(&lock_id).unwrap().state = LockState::Acquired;
                }
                Err(_) => return,
            }
        }
    }

    fn release_locks(&mut self, transaction_id: TransactionId) {
        let (locks, locked_nodes): (HashSet<LockId>, HashSet<CypressNodeId>) = {
            let tx = self.transactions.get_mut(&transaction_id).unwrap();
            (std::mem::take(&mut tx.locks), std::mem::take(&mut tx.locked_nodes))
        };

        for lock_id in &locks {
            let trunk_node = self.locks[lock_id].trunk_node;
            if let Some(node) = self.nodes.get_mut(&trunk_node) {
                node.lock_list.retain(|id| id != lock_id);
            }
            self.locks.remove(lock_id);
        }

        for &node_id in &locked_nodes {
            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.lock_state_map.remove(&transaction_id);
            }
        }

        for &node_id in &locked_nodes {
            self.check_pending_locks(node_id);
        }
    }

    /// `OnTransactionCommitted`: for each branched node, call the type
    /// handler's `merge(trunk, branched)` — except snapshot branches, which
    /// are destroyed without merging — then release locks and promote
    /// pending ones.
    pub fn commit_transaction(&mut self, transaction_id: TransactionId) {
        let branched = std::mem::take(&mut self.transactions.get_mut(&transaction_id).unwrap().branched_nodes);
        for node_id in branched {
            let Some(node) = self.nodes.get_mut(&node_id) else { continue };
            let Some(branched_payload) = node.branched_payloads.remove(&transaction_id) else { continue };
            let is_snapshot = node.lock_state_map.get(&transaction_id).map_or(false, |s| s.mode == LockMode::Snapshot);
            if is_snapshot {
                continue;
            }
            let handler = self.type_handlers[&node.payload.kind()];
            let node = self.nodes.get_mut(&node_id).unwrap();
            node.payload = (handler.merge)(node.payload.clone(), branched_payload);
        }
        self.release_locks(transaction_id);
    }

    /// `OnTransactionAborted`: destroy every branch without merging, then
    /// release locks.
    pub fn abort_transaction(&mut self, transaction_id: TransactionId) {
        let branched = std::mem::take(&mut self.transactions.get_mut(&transaction_id).unwrap().branched_nodes);
        for node_id in branched {
            if let Some(node) = self.nodes.get_mut(&node_id) {
                node.branched_payloads.remove(&transaction_id);
            }
        }
        self.release_locks(transaction_id);
    }

    pub fn is_parent_transaction(&self, transaction: Option<TransactionId>, ancestor_candidate: Option<TransactionId>) -> bool {
        super::lock::is_parent_transaction(&self.transactions, transaction, ancestor_candidate)
    }

    pub fn is_concurrent_transaction(&self, a: Option<TransactionId>, b: Option<TransactionId>) -> bool {
        is_concurrent_transaction(&self.transactions, a, b)
    }

    /// `AccessTracker::SetAccessed`: bumps access time to the max of the
    /// current tick and stores it, increments the access counter. The
    /// source batches these into a periodic mutation; this applies
    /// immediately since there is no replicated log to batch against here.
    pub fn set_accessed(&mut self, node_id: CypressNodeId) {
        self.clock += 1;
        let tick = self.clock;
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.access_time = node.access_time.max(tick);
            node.access_counter += 1;
        }
    }
}

impl Default for CypressManager {
    fn default() -> Self {
        Self::new()
    }
}

fn clone_request(request: &LockRequest) -> LockRequest {
    LockRequest { mode: request.mode, child_key: request.child_key.clone(), attribute_key: request.attribute_key.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_node() -> CypressManager {
        let mut manager = CypressManager::new();
        manager.create_node(1);
        manager
    }

    #[test]
    fn exclusive_lock_is_acquired_and_branches_the_node() {
        let mut manager = manager_with_node();
        manager.start_transaction(1, None);
        let locks = manager.lock_node(1, 1, LockRequest::new(LockMode::Exclusive), false).unwrap();
        assert_eq!(locks.len(), 1);
        assert!(manager.nodes[&1].branched_payloads.contains_key(&1));
        assert_eq!(manager.nodes[&1].lock_state_map[&1].mode, LockMode::Exclusive);
    }

    #[test]
    fn second_concurrent_exclusive_lock_is_rejected() {
        let mut manager = manager_with_node();
        manager.start_transaction(1, None);
        manager.start_transaction(2, None);
        manager.lock_node(1, 1, LockRequest::new(LockMode::Exclusive), false).unwrap();
        let err = manager.lock_node(1, 2, LockRequest::new(LockMode::Exclusive), false).unwrap_err();
        assert!(err.to_string().contains("concurrent transaction"));
    }

    #[test]
    fn commit_releases_locks_and_promotes_pending() {
        let mut manager = manager_with_node();
        manager.start_transaction(1, None);
        manager.start_transaction(2, None);
        manager.lock_node(1, 1, LockRequest::new(LockMode::Exclusive), false).unwrap();
        let pending = manager.create_lock(1, 2, LockRequest::new(LockMode::Exclusive), true).unwrap();
        assert!(pending.is_some());
        assert_eq!(manager.locks[&pending.unwrap()].state, LockState::Pending);

        manager.commit_transaction(1);

        assert_eq!(manager.locks[&pending.unwrap()].state, LockState::Acquired);
        assert!(!manager.nodes[&1].lock_state_map.contains_key(&1));
        assert!(manager.nodes[&1].lock_state_map.contains_key(&2));
    }

    #[test]
    fn abort_destroys_branch_without_merging() {
        let mut manager = manager_with_node();
        manager.start_transaction(1, None);
        manager.lock_node(1, 1, LockRequest::new(LockMode::Exclusive), false).unwrap();
        manager.abort_transaction(1);
        assert!(!manager.nodes[&1].branched_payloads.contains_key(&1));
        assert!(manager.nodes[&1].lock_state_map.is_empty());
    }

    #[test]
    fn commit_merges_branched_scalar_payload_into_trunk() {
        let mut manager = CypressManager::new();
        manager.create_node_with_payload(1, NodePayload::Int64(1));
        manager.start_transaction(1, None);
        manager.lock_node(1, 1, LockRequest::new(LockMode::Exclusive), false).unwrap();

        let branched = manager.nodes[&1].branched_payloads[&1].clone();
        assert_eq!(branched, NodePayload::Int64(1));
        manager.nodes.get_mut(&1).unwrap().branched_payloads.insert(1, NodePayload::Int64(42));

        manager.commit_transaction(1);

        assert_eq!(manager.nodes[&1].payload, NodePayload::Int64(42));
        assert!(!manager.nodes[&1].branched_payloads.contains_key(&1));
    }

    #[test]
    fn commit_discards_snapshot_branch_without_merging() {
        let mut manager = CypressManager::new();
        manager.create_node_with_payload(1, NodePayload::Int64(1));
        manager.start_transaction(1, None);
        manager.lock_node(1, 1, LockRequest::new(LockMode::Snapshot), false).unwrap();
        manager.nodes.get_mut(&1).unwrap().branched_payloads.insert(1, NodePayload::Int64(99));

        manager.commit_transaction(1);

        assert_eq!(manager.nodes[&1].payload, NodePayload::Int64(1));
    }

    #[test]
    fn recursive_lock_covers_entire_subtree_in_sorted_order() {
        let mut manager = manager_with_node();
        manager.add_child(1, "b", 3);
        manager.add_child(1, "a", 2);
        manager.start_transaction(1, None);
        let locks = manager.lock_node(1, 1, LockRequest::new(LockMode::Shared), true).unwrap();
        assert_eq!(locks.len(), 3);
        for &id in &[1u64, 2, 3] {
            assert!(manager.nodes[&id].lock_state_map.contains_key(&1));
        }
    }

    #[test]
    fn nested_transaction_lock_upgrades_ancestor_state() {
        let mut manager = manager_with_node();
        manager.start_transaction(1, None);
        manager.start_transaction(2, Some(1));
        manager.lock_node(1, 2, LockRequest::new(LockMode::Exclusive), false).unwrap();
        assert_eq!(manager.nodes[&1].lock_state_map[&1].mode, LockMode::Exclusive);
        assert_eq!(manager.nodes[&1].lock_state_map[&2].mode, LockMode::Exclusive);
    }

    #[test]
    fn set_accessed_bumps_time_and_counter() {
        let mut manager = manager_with_node();
        manager.set_accessed(1);
        manager.set_accessed(1);
        assert_eq!(manager.nodes[&1].access_counter, 2);
        assert!(manager.nodes[&1].access_time > 0);
    }
}
