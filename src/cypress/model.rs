//! Cypress data model: nodes, locks, and transactions, simplified to an
//! in-process tree. Replicated persistence, the security manager, and
//! resource accounting are out of scope here.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

pub type CypressNodeId = u64;
pub type TransactionId = u64;
pub type LockId = u64;

/// Declaration order doubles as strength order: snapshot is the weakest
/// mode (it never conflicts with a concurrent shared/exclusive request on
/// an ancestor transaction, only with another request in the *same*
/// transaction), shared is next, exclusive is strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    Snapshot,
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Pending,
    Acquired,
}

#[derive(Debug, Clone)]
pub struct LockRequest {
    pub mode: LockMode,
    pub child_key: Option<String>,
    pub attribute_key: Option<String>,
}

impl LockRequest {
    pub fn new(mode: LockMode) -> Self {
        LockRequest { mode, child_key: None, attribute_key: None }
    }

    pub fn with_child_key(mut self, key: impl Into<String>) -> Self {
        self.child_key = Some(key.into());
        self
    }

    pub fn with_attribute_key(mut self, key: impl Into<String>) -> Self {
        self.attribute_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct Lock {
    pub id: LockId,
    pub trunk_node: CypressNodeId,
    pub transaction_id: TransactionId,
    pub request: LockRequest,
    pub state: LockState,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionLockState {
    pub mode: LockMode,
    pub child_keys: HashSet<String>,
    pub attribute_keys: HashSet<String>,
}

impl Default for LockMode {
    fn default() -> Self {
        LockMode::Shared
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub parent: Option<TransactionId>,
    pub branched_nodes: Vec<CypressNodeId>,
    pub locked_nodes: HashSet<CypressNodeId>,
    pub locks: HashSet<LockId>,
}

impl Transaction {
    pub fn new(id: TransactionId, parent: Option<TransactionId>) -> Self {
        Transaction { id, parent, branched_nodes: Vec::new(), locked_nodes: HashSet::new(), locks: HashSet::new() }
    }
}

/// The tag half of the tagged-variant node model: replaces a deep
/// inheritance hierarchy of per-type handler classes with a plain enum that
/// can key a function-pointer table (see [`NodeTypeHandler`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Map,
    List,
    String,
    Int64,
    Double,
    Link,
    Document,
}

/// Per-type node payload. `Map`/`List` carry ordered/keyed references to
/// other nodes; `String`/`Int64`/`Double` are scalar leaves; `Link` holds a
/// target node id; `Document` is an opaque, schema-less tree (attribute
/// bags, job specs, ...) that no handler needs to interpret structurally.
#[derive(Debug, Clone, PartialEq)]
pub enum NodePayload {
    Map(BTreeMap<String, CypressNodeId>),
    List(Vec<CypressNodeId>),
    String(String),
    Int64(i64),
    Double(f64),
    Link(CypressNodeId),
    Document(serde_json::Value),
}

impl NodePayload {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodePayload::Map(_) => NodeKind::Map,
            NodePayload::List(_) => NodeKind::List,
            NodePayload::String(_) => NodeKind::String,
            NodePayload::Int64(_) => NodeKind::Int64,
            NodePayload::Double(_) => NodeKind::Double,
            NodePayload::Link(_) => NodeKind::Link,
            NodePayload::Document(_) => NodeKind::Document,
        }
    }
}

impl Default for NodePayload {
    fn default() -> Self {
        NodePayload::Map(BTreeMap::new())
    }
}

/// One entry of the function-pointer table keyed by [`NodeKind`]: `branch`
/// produces a branched-transaction copy of a trunk payload, `merge` folds a
/// committed branched copy back into the trunk. Every kind here shares the
/// same clone/overwrite behavior (there's no per-kind structural merge to
/// do once payloads are opaque values), but the table — not a match
/// expression wired into the call sites — is what decides which function
/// runs, so adding a kind with genuinely different branch/merge behavior
/// only touches [`node_type_handlers`].
#[derive(Debug, Clone, Copy)]
pub struct NodeTypeHandler {
    pub branch: fn(&NodePayload) -> NodePayload,
    pub merge: fn(NodePayload, NodePayload) -> NodePayload,
}

fn clone_branch(payload: &NodePayload) -> NodePayload {
    payload.clone()
}

/// The branched copy becomes the new trunk value; the trunk's pre-branch
/// value is discarded, since the branch already started as its clone and
/// any trunk-side writes during the transaction's lifetime are impossible
/// in this lock model (the lock itself prevents that).
fn overwrite_merge(_trunk: NodePayload, branched: NodePayload) -> NodePayload {
    branched
}

pub fn node_type_handlers() -> HashMap<NodeKind, NodeTypeHandler> {
    let handler = NodeTypeHandler { branch: clone_branch, merge: overwrite_merge };
    [
        NodeKind::Map,
        NodeKind::List,
        NodeKind::String,
        NodeKind::Int64,
        NodeKind::Double,
        NodeKind::Link,
        NodeKind::Document,
    ]
    .iter()
    .map(|kind| (*kind, handler))
    .collect()
}

/// A Cypress node: trunk copy, plus a per-transaction map of branched
/// payload copies for transactions that currently hold one. `children` is
/// the structural lock-subtree index (every node kind can be locked with a
/// `childKey`, not just maps); `payload` is the type-specific value content
/// that branch/merge operate on.
#[derive(Debug, Clone)]
pub struct CypressNode {
    pub id: CypressNodeId,
    pub children: BTreeMap<String, CypressNodeId>,
    pub payload: NodePayload,
    pub lock_state_map: HashMap<TransactionId, TransactionLockState>,
    pub lock_list: VecDeque<LockId>,
    pub branched_payloads: HashMap<TransactionId, NodePayload>,
    pub access_time: u64,
    pub access_counter: u64,
}

impl CypressNode {
    pub fn new(id: CypressNodeId) -> Self {
        Self::with_payload(id, NodePayload::default())
    }

    pub fn with_payload(id: CypressNodeId, payload: NodePayload) -> Self {
        CypressNode {
            id,
            children: BTreeMap::new(),
            payload,
            lock_state_map: HashMap::new(),
            lock_list: VecDeque::new(),
            branched_payloads: HashMap::new(),
            access_time: 0,
            access_counter: 0,
        }
    }

    pub fn last_lock_is_pending(&self, locks: &HashMap<LockId, Lock>) -> bool {
        self.lock_list.back().map_or(false, |id| locks[id].state == LockState::Pending)
    }
}
