//! Chunk sealer: a deque-based seal queue with a `seal_scheduled` guard
//! flag, weak-ref pinning released on dequeue, an async-semaphore-bounded
//! periodic refresh, and per-chunk backoff on failure. Shared state lives
//! behind `Arc<Mutex<..>>`, with bounded fan-out via a semaphore.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use super::id::{ChunkId, NodeId};
use super::object::Chunk;

#[derive(Debug, Clone)]
pub struct SealerConfig {
    pub max_chunk_concurrent_seals: usize,
    pub max_chunks_per_refresh: usize,
    pub chunk_refresh_period: Duration,
    pub chunk_seal_backoff_time: Duration,
    pub journal_rpc_timeout: Duration,
}

impl Default for SealerConfig {
    fn default() -> Self {
        SealerConfig {
            max_chunk_concurrent_seals: 10,
            max_chunks_per_refresh: 100,
            chunk_refresh_period: Duration::from_secs(3),
            chunk_seal_backoff_time: Duration::from_secs(30),
            journal_rpc_timeout: Duration::from_secs(15),
        }
    }
}

/// The narrow seam into the (out-of-scope) RPC transport and replicated
/// owning-node-tree lookups.
#[async_trait]
pub trait JournalSealService: Send + Sync {
    async fn abort_sessions_quorum(
        &self,
        chunk_id: ChunkId,
        replicas: &[NodeId],
        timeout: Duration,
        quorum: usize,
    ) -> Result<()>;

    async fn compute_quorum_record_count(
        &self,
        chunk_id: ChunkId,
        replicas: &[NodeId],
        timeout: Duration,
        quorum: usize,
    ) -> Result<u64>;

    async fn seal_chunk(&self, chunk_id: ChunkId, record_count: u64) -> Result<()>;
}

/// Reports whether any parent chunk-list of `chunk_id` is attached to an
/// owning node currently under a mutating (branched) update, guarding
/// against sealing a chunk a concurrent writer still depends on.
pub trait OwningNodeOracle: Send + Sync {
    fn is_locked_by_mutating_owner(&self, chunk_id: ChunkId) -> bool;
}

pub type ChunkHandle = Arc<Mutex<Chunk>>;

pub struct ChunkSealer<S: JournalSealService, O: OwningNodeOracle> {
    config: SealerConfig,
    service: Arc<S>,
    oracle: Arc<O>,
    semaphore: Arc<Semaphore>,
    queue: Mutex<VecDeque<Weak<Mutex<Chunk>>>>,
    scheduled: Mutex<HashSet<ChunkId>>,
}

impl<S: JournalSealService + 'static, O: OwningNodeOracle + 'static> ChunkSealer<S, O> {
    pub fn new(config: SealerConfig, service: Arc<S>, oracle: Arc<O>) -> Self {
        let permits = config.max_chunk_concurrent_seals;
        ChunkSealer {
            config,
            service,
            oracle,
            semaphore: Arc::new(Semaphore::new(permits)),
            queue: Mutex::new(VecDeque::new()),
            scheduled: Mutex::new(HashSet::new()),
        }
    }

    fn is_seal_needed(chunk: &Chunk) -> bool {
        !chunk.sealed
    }

    fn is_locked(&self, chunk_id: ChunkId) -> bool {
        self.oracle.is_locked_by_mutating_owner(chunk_id)
    }

    fn has_enough_replicas(chunk: &Chunk) -> bool {
        chunk.stored_replica_count() >= chunk.read_quorum as usize
    }

    fn can_seal(&self, chunk: &Chunk) -> bool {
        Self::is_seal_needed(chunk) && Self::has_enough_replicas(chunk) && !self.is_locked(chunk.id)
    }

    /// Enumerate a set of journal chunks at startup and schedule each
    /// unsealed one.
    pub fn initialize(&self, chunks: impl IntoIterator<Item = ChunkHandle>) {
        for handle in chunks {
            self.schedule_seal(&handle);
        }
    }

    pub fn schedule_seal(&self, handle: &ChunkHandle) {
        let (id, needed) = {
            let chunk = handle.lock();
            (chunk.id, Self::is_seal_needed(&chunk))
        };
        if !needed {
            return;
        }
        self.enqueue(id, handle);
    }

    fn enqueue(&self, id: ChunkId, handle: &ChunkHandle) {
        let mut scheduled = self.scheduled.lock();
        if scheduled.contains(&id) {
            return;
        }
        scheduled.insert(id);
        self.queue.lock().push_back(Arc::downgrade(handle));
    }

    fn begin_dequeue(&self) -> Option<ChunkHandle> {
        loop {
            let weak = self.queue.lock().pop_front()?;
            if let Some(handle) = weak.upgrade() {
                let id = handle.lock().id;
                self.scheduled.lock().remove(&id);
                return Some(handle);
            }
            // chunk was destroyed while queued; drop and keep looking.
        }
    }

    fn reschedule(&self, handle: &ChunkHandle) {
        let needed = Self::is_seal_needed(&handle.lock());
        if needed {
            let id = handle.lock().id;
            self.enqueue(id, handle);
        }
    }

    /// One tick of the periodic refresh executor.
    pub async fn run_refresh_once(self: &Arc<Self>) {
        let mut dequeued = 0usize;
        loop {
            if dequeued >= self.config.max_chunks_per_refresh {
                return;
            }
            let permit = match self.semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => return,
            };

            let handle = match self.begin_dequeue() {
                Some(handle) => handle,
                None => return,
            };
            dequeued += 1;

            let can_seal = self.can_seal(&handle.lock());
            if !can_seal {
                drop(permit);
                continue;
            }

            let this = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                this.seal_one(handle).await;
            });
        }
    }

    async fn seal_one(self: Arc<Self>, handle: ChunkHandle) {
        let can_seal = self.can_seal(&handle.lock());
        if !can_seal {
            return;
        }
        match self.guarded_seal(&handle).await {
            Ok(()) => {}
            Err(err) => {
                log::warn!("error sealing journal chunk, backing off: {}", err);
                let this = Arc::clone(&self);
                let backoff = self.config.chunk_seal_backoff_time;
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    this.reschedule(&handle);
                });
            }
        }
    }

    async fn guarded_seal(&self, handle: &ChunkHandle) -> Result<()> {
        let (id, replicas, read_quorum) = {
            let chunk = handle.lock();
            let replicas: Vec<NodeId> = chunk.replicas.iter().map(|r| r.node_id).collect();
            (chunk.id, replicas, chunk.read_quorum as usize)
        };

        log::info!("sealing journal chunk {}", id);

        self.service
            .abort_sessions_quorum(id, &replicas, self.config.journal_rpc_timeout, read_quorum)
            .await?;

        let record_count = self
            .service
            .compute_quorum_record_count(id, &replicas, self.config.journal_rpc_timeout, read_quorum)
            .await?;

        self.service.seal_chunk(id, record_count).await?;

        let uncompressed_size = {
            let chunk = handle.lock();
            chunk
                .meta
                .misc
                .as_ref()
                .map(|m| m.uncompressed_data_size)
                .unwrap_or(0)
        };

        let mut chunk = handle.lock();
        if chunk.sealed {
            bail!("chunk {} was sealed concurrently", id);
        }
        chunk.seal(record_count, uncompressed_size)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::id::ChunkKind;
    use crate::chunk::meta::{ChunkMeta, MiscExt};

    struct FixedQuorumService {
        record_count: u64,
    }

    #[async_trait]
    impl JournalSealService for FixedQuorumService {
        async fn abort_sessions_quorum(
            &self,
            _chunk_id: ChunkId,
            _replicas: &[NodeId],
            _timeout: Duration,
            _quorum: usize,
        ) -> Result<()> {
            Ok(())
        }

        async fn compute_quorum_record_count(
            &self,
            _chunk_id: ChunkId,
            _replicas: &[NodeId],
            _timeout: Duration,
            _quorum: usize,
        ) -> Result<u64> {
            Ok(self.record_count)
        }

        async fn seal_chunk(&self, _chunk_id: ChunkId, _record_count: u64) -> Result<()> {
            Ok(())
        }
    }

    struct NeverLocked;
    impl OwningNodeOracle for NeverLocked {
        fn is_locked_by_mutating_owner(&self, _chunk_id: ChunkId) -> bool {
            false
        }
    }

    fn confirmed_journal_chunk(read_quorum: u8) -> Chunk {
        let id = ChunkId::new(1, 0, ChunkKind::Journal);
        let mut chunk = Chunk::new_unsealed(id, read_quorum, read_quorum, 1);
        let mut meta = ChunkMeta::empty();
        meta.misc = Some(MiscExt::default());
        chunk.confirm(meta).unwrap();
        chunk
    }

    #[tokio::test]
    async fn seals_chunk_at_quorum_record_count() {
        // readQuorum=2, replicas report [100, 100, 97]; quorum count is 100.
        let mut chunk = confirmed_journal_chunk(2);
        chunk.add_replica(NodeId(1), 0, 0, true);
        chunk.add_replica(NodeId(2), 0, 0, true);
        chunk.add_replica(NodeId(3), 0, 0, true);
        let handle: ChunkHandle = Arc::new(Mutex::new(chunk));

        let sealer = Arc::new(ChunkSealer::new(
            SealerConfig::default(),
            Arc::new(FixedQuorumService { record_count: 100 }),
            Arc::new(NeverLocked),
        ));

        sealer.schedule_seal(&handle);
        sealer.run_refresh_once().await;

        // the seal task is spawned; drive the runtime until it settles.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let chunk = handle.lock();
        assert!(chunk.sealed);
        assert_eq!(chunk.meta.misc.as_ref().unwrap().row_count, 100);
    }

    #[test]
    fn cannot_seal_below_read_quorum() {
        let mut chunk = confirmed_journal_chunk(3);
        chunk.add_replica(NodeId(1), 0, 0, true);
        let sealer_ok = ChunkSealer::<FixedQuorumService, NeverLocked>::has_enough_replicas(&chunk);
        assert!(!sealer_ok);
        chunk.add_replica(NodeId(2), 0, 0, true);
        chunk.add_replica(NodeId(3), 0, 0, true);
        assert!(ChunkSealer::<FixedQuorumService, NeverLocked>::has_enough_replicas(&chunk));
    }
}
