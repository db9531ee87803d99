//! Cypress manager: replicated metadata tree, locks, transactions.
//! See `model.rs` for the node/lock/transaction shapes, `lock.rs` for the
//! conflict-validation matrix and transaction-tree relations, `manager.rs`
//! for lock acquisition, transaction commit/abort, and access tracking.

pub mod lock;
pub mod manager;
pub mod model;

pub use lock::LockError;
pub use manager::CypressManager;
pub use model::{
    node_type_handlers, CypressNode, CypressNodeId, Lock, LockId, LockMode, LockRequest, LockState, NodeKind, NodePayload,
    NodeTypeHandler, Transaction, TransactionId,
};
