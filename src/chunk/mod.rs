//! Chunk entity, requisition flyweight, and the data model pieces they
//! share with the sealer.

pub mod id;
pub mod meta;
pub mod object;
pub mod requisition;
pub mod sealer;

pub use id::{ChunkId, ChunkKind, NodeId};
pub use meta::{ChunkFormat, ChunkMeta, ChunkType, MiscExt};
pub use object::{Chunk, Replica, ReplicaState};
pub use requisition::{MediumRequirement, Requisition, RequisitionIndex, RequisitionRegistry};
