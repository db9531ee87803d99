//! Chunk fragment reader. See `session.rs` for the read-session and
//! periodic-update logic, `cache.rs` for the TTL-expiring caches it layers
//! its fast path on top of.

pub mod cache;
pub mod session;

pub use cache::ExpiringCache;
pub use session::{ChunkFragmentReader, ChunkProbeInfo, ChunkProbeService, FragmentRequest, PeerInfo, ProbeChunkSetResult, ReplicaDirectory};
