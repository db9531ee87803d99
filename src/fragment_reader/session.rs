//! Chunk fragment reader: group pending fragment requests by chunk, resolve
//! replicas, probe candidate peers in parallel for queue-depth penalties,
//! pick the cheapest peer per chunk, fetch, and retry unresolved chunks up
//! to `max_retry_count`. The RPC channel and replicated node directory are
//! an out-of-scope collaborator; both sit behind
//! [`ReplicaDirectory`]/[`ChunkProbeService`] trait seams here, mirroring
//! the `JournalSealService` seam in [`crate::chunk::sealer`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;

use crate::chunk::id::{ChunkId, NodeId};
use crate::config::FragmentReaderConfig;

use super::cache::ExpiringCache;

#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct FragmentRequest {
    pub chunk_id: ChunkId,
    pub offset: u64,
    pub length: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ChunkProbeInfo {
    pub has_complete_chunk: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProbeChunkSetResult {
    pub per_chunk: HashMap<ChunkId, ChunkProbeInfo>,
    pub net_queue_size: i64,
    pub disk_queue_size: i64,
}

/// Reports chunk-to-replica and node-to-address mappings; the replicated
/// node directory and chunk replica locator collapsed into one seam since
/// neither is in scope here.
pub trait ReplicaDirectory: Send + Sync {
    fn replicas_for(&self, chunk_id: ChunkId) -> Vec<NodeId>;
    fn peer_info(&self, node_id: NodeId) -> Option<PeerInfo>;
}

/// The narrow seam into the (out-of-scope) data-node RPC service.
#[async_trait]
pub trait ChunkProbeService: Send + Sync {
    async fn probe_chunk_set(&self, peer: &PeerInfo, chunk_ids: &[ChunkId], timeout: Duration) -> Result<ProbeChunkSetResult>;

    async fn fetch_fragments(&self, peer: &PeerInfo, chunk_id: ChunkId, fragments: &[(u64, u32)]) -> Result<Vec<Vec<u8>>>;
}

#[derive(Clone)]
struct FastPathEntry {
    peer: NodeId,
    last_successful_access: Instant,
}

/// Owns the fast-path `ChunkId -> last-good-peer` cache plus the
/// TTL-expiring replica and peer lookup caches.
pub struct ChunkFragmentReader<S: ChunkProbeService, D: ReplicaDirectory> {
    config: FragmentReaderConfig,
    service: Arc<S>,
    directory: Arc<D>,
    fast_path: Mutex<HashMap<ChunkId, FastPathEntry>>,
    replica_cache: ExpiringCache<ChunkId, Vec<NodeId>>,
    peer_cache: ExpiringCache<NodeId, PeerInfo>,
}

impl<S: ChunkProbeService + 'static, D: ReplicaDirectory + 'static> ChunkFragmentReader<S, D> {
    pub fn new(config: FragmentReaderConfig, service: Arc<S>, directory: Arc<D>) -> Self {
        let replica_ttl = Duration::from_secs(60);
        let peer_ttl = Duration::from_secs(60);
        ChunkFragmentReader {
            config,
            service,
            directory,
            fast_path: Mutex::new(HashMap::new()),
            replica_cache: ExpiringCache::new(replica_ttl),
            peer_cache: ExpiringCache::new(peer_ttl),
        }
    }

    fn resolve_replicas(&self, chunk_id: ChunkId) -> Vec<NodeId> {
        if let Some(cached) = self.replica_cache.get(&chunk_id) {
            return cached;
        }
        let replicas = self.directory.replicas_for(chunk_id);
        self.replica_cache.insert(chunk_id, replicas.clone());
        replicas
    }

    fn resolve_peer(&self, node_id: NodeId) -> Option<PeerInfo> {
        if let Some(cached) = self.peer_cache.get(&node_id) {
            return Some(cached);
        }
        let peer = self.directory.peer_info(node_id)?;
        self.peer_cache.insert(node_id, peer.clone());
        Some(peer)
    }

    fn probing_penalty(&self, probe: &ProbeChunkSetResult) -> f64 {
        self.config.net_queue_size_factor * probe.net_queue_size as f64 + self.config.disk_queue_size_factor * probe.disk_queue_size as f64
    }

    fn fast_path_peer(&self, chunk_id: ChunkId) -> Option<NodeId> {
        let fast_path = self.fast_path.lock();
        fast_path.get(&chunk_id).and_then(|entry| {
            if entry.last_successful_access.elapsed() < self.config.evict_after_successful_access_time {
                Some(entry.peer)
            } else {
                None
            }
        })
    }

    fn record_success(&self, chunk_id: ChunkId, peer: NodeId) {
        self.fast_path.lock().insert(chunk_id, FastPathEntry { peer, last_successful_access: Instant::now() });
    }

    /// Resolve every fragment request's bytes, grouping by chunk and
    /// retrying unresolved chunks against fresh peers up to
    /// `max_retry_count` times, sleeping `retry_backoff_time` between
    /// iterations. Typed errors encountered along the way are accumulated
    /// rather than discarded, and surface together if retries exhaust.
    pub async fn read_fragments(&self, requests: Vec<FragmentRequest>) -> Result<Vec<Vec<u8>>> {
        let mut results: Vec<Option<Vec<u8>>> = vec![None; requests.len()];
        let mut by_chunk: HashMap<ChunkId, Vec<usize>> = HashMap::new();
        for (idx, req) in requests.iter().enumerate() {
            by_chunk.entry(req.chunk_id).or_default().push(idx);
        }
        let mut pending: Vec<ChunkId> = by_chunk.keys().copied().collect();
        let mut excluded_peers: HashMap<ChunkId, Vec<NodeId>> = HashMap::new();
        let mut inner_errors: Vec<anyhow::Error> = Vec::new();

        for iteration in 0..self.config.max_retry_count {
            if pending.is_empty() {
                break;
            }

            let mut still_pending = Vec::new();
            let mut fast_path_chunks = Vec::new();
            let mut probe_chunks = Vec::new();
            for chunk_id in pending.drain(..) {
                match self.fast_path_peer(chunk_id) {
                    Some(peer) if !excluded_peers.get(&chunk_id).map_or(false, |v| v.contains(&peer)) => {
                        fast_path_chunks.push((chunk_id, peer));
                    }
                    _ => probe_chunks.push(chunk_id),
                }
            }

            for (chunk_id, peer_id) in fast_path_chunks {
                let resolved = self.try_fetch_chunk(chunk_id, peer_id, &by_chunk, &requests, &mut results, &mut inner_errors).await;
                if resolved {
                    self.record_success(chunk_id, peer_id);
                } else {
                    excluded_peers.entry(chunk_id).or_default().push(peer_id);
                    still_pending.push(chunk_id);
                }
            }

            if !probe_chunks.is_empty() {
                let resolved_chunks = self
                    .probe_and_fetch(&probe_chunks, &excluded_peers, &by_chunk, &requests, &mut results, &mut inner_errors)
                    .await?;
                for chunk_id in probe_chunks {
                    if !resolved_chunks.contains(&chunk_id) {
                        still_pending.push(chunk_id);
                    }
                }
            }

            pending = still_pending;

            if !pending.is_empty() && iteration + 1 < self.config.max_retry_count {
                tokio::time::sleep(self.config.retry_backoff_time).await;
            }
        }

        if !pending.is_empty() {
            let causes: Vec<String> = inner_errors.iter().map(|e| e.to_string()).collect();
            bail!(
                "read_fragments: exhausted retries for chunks {:?}, inner errors: [{}]",
                pending,
                causes.join("; ")
            );
        }

        Ok(results.into_iter().map(|r| r.expect("resolved chunk leaves no unfilled fragment")).collect())
    }

    /// Returns whether the chunk resolved; any underlying error is pushed
    /// to `inner_errors` rather than propagated, so the caller can keep
    /// retrying other chunks.
    async fn try_fetch_chunk(
        &self,
        chunk_id: ChunkId,
        peer_id: NodeId,
        by_chunk: &HashMap<ChunkId, Vec<usize>>,
        requests: &[FragmentRequest],
        results: &mut [Option<Vec<u8>>],
        inner_errors: &mut Vec<anyhow::Error>,
    ) -> bool {
        let peer = match self.resolve_peer(peer_id) {
            Some(p) => p,
            None => {
                inner_errors.push(anyhow!("try_fetch_chunk: no peer info for node {:?}", peer_id));
                return false;
            }
        };
        let indexes = &by_chunk[&chunk_id];
        let specs: Vec<(u64, u32)> = indexes.iter().map(|&i| (requests[i].offset, requests[i].length)).collect();
        let bytes = match self.service.fetch_fragments(&peer, chunk_id, &specs).await {
            Ok(b) => b,
            Err(err) => {
                inner_errors.push(err.context(format!("try_fetch_chunk: fetch_fragments failed for chunk {:?}", chunk_id)));
                return false;
            }
        };
        for (&idx, data) in indexes.iter().zip(bytes.into_iter()) {
            results[idx] = Some(data);
        }
        true
    }

    async fn probe_and_fetch(
        &self,
        chunk_ids: &[ChunkId],
        excluded_peers: &HashMap<ChunkId, Vec<NodeId>>,
        by_chunk: &HashMap<ChunkId, Vec<usize>>,
        requests: &[FragmentRequest],
        results: &mut [Option<Vec<u8>>],
        inner_errors: &mut Vec<anyhow::Error>,
    ) -> Result<Vec<ChunkId>> {
        // Group chunks by candidate peer the way `GroupChunksByPeer` does,
        // so one probe RPC per peer covers every chunk it might serve.
        let mut peer_to_chunks: HashMap<NodeId, Vec<ChunkId>> = HashMap::new();
        for &chunk_id in chunk_ids {
            let empty = Vec::new();
            let excluded = excluded_peers.get(&chunk_id).unwrap_or(&empty);
            for node_id in self.resolve_replicas(chunk_id) {
                if !excluded.contains(&node_id) {
                    peer_to_chunks.entry(node_id).or_default().push(chunk_id);
                }
            }
        }

        if peer_to_chunks.is_empty() {
            bail!("probe_and_fetch: no replicas available for {:?}", chunk_ids);
        }

        let timeout = self.config.probe_chunk_set_rpc_timeout;
        let probes: Vec<Result<(NodeId, PeerInfo, Vec<ChunkId>, ProbeChunkSetResult)>> =
            join_all(peer_to_chunks.iter().map(|(node_id, chunks)| {
                let node_id = *node_id;
                let chunks = chunks.clone();
                async move {
                    let peer = self
                        .resolve_peer(node_id)
                        .ok_or_else(|| anyhow!("probe_and_fetch: no peer info for node {:?}", node_id))?;
                    let probe = self.service.probe_chunk_set(&peer, &chunks, timeout).await?;
                    Ok((node_id, peer, chunks, probe))
                }
            }))
            .await;

        // For each chunk, among peers that reported completeness, pick the
        // one with the lowest queue-depth penalty.
        let mut best_peer_for_chunk: HashMap<ChunkId, (NodeId, PeerInfo, f64)> = HashMap::new();
        for outcome in probes {
            let (node_id, peer, chunks, probe) = match outcome {
                Ok(outcome) => outcome,
                Err(err) => {
                    inner_errors.push(err);
                    continue;
                }
            };
            let penalty = self.probing_penalty(&probe);
            for chunk_id in chunks {
                let complete = probe.per_chunk.get(&chunk_id).map_or(false, |info| info.has_complete_chunk);
                if !complete {
                    continue;
                }
                let better = best_peer_for_chunk.get(&chunk_id).map_or(true, |(_, _, existing)| penalty < *existing);
                if better {
                    best_peer_for_chunk.insert(chunk_id, (node_id, peer.clone(), penalty));
                }
            }
        }

        let mut resolved = Vec::new();
        for (chunk_id, (node_id, peer, _)) in best_peer_for_chunk {
            let indexes = &by_chunk[&chunk_id];
            let specs: Vec<(u64, u32)> = indexes.iter().map(|&i| (requests[i].offset, requests[i].length)).collect();
            match self.service.fetch_fragments(&peer, chunk_id, &specs).await {
                Ok(bytes) => {
                    for (&idx, data) in indexes.iter().zip(bytes.into_iter()) {
                        results[idx] = Some(data);
                    }
                    self.record_success(chunk_id, node_id);
                    resolved.push(chunk_id);
                }
                Err(err) => {
                    inner_errors.push(err.context(format!("probe_and_fetch: fetch_fragments failed for chunk {:?}", chunk_id)));
                }
            }
        }
        Ok(resolved)
    }

    /// One tick of the periodic update session: re-validate fast-path peers
    /// are still current replicas, dropping stale entries.
    pub fn run_periodic_update_once(&self) {
        let stale: Vec<ChunkId> = {
            let fast_path = self.fast_path.lock();
            fast_path
                .iter()
                .filter(|(chunk_id, entry)| {
                    let replicas = self.directory.replicas_for(**chunk_id);
                    !replicas.contains(&entry.peer)
                })
                .map(|(id, _)| *id)
                .collect()
        };
        let mut fast_path = self.fast_path.lock();
        for chunk_id in stale {
            fast_path.remove(&chunk_id);
        }
    }

    pub fn periodic_update_delay(&self) -> Duration {
        self.config.periodic_update_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::id::ChunkKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeDirectory {
        replicas: HashMap<ChunkId, Vec<NodeId>>,
    }

    impl ReplicaDirectory for FakeDirectory {
        fn replicas_for(&self, chunk_id: ChunkId) -> Vec<NodeId> {
            self.replicas.get(&chunk_id).cloned().unwrap_or_default()
        }
        fn peer_info(&self, node_id: NodeId) -> Option<PeerInfo> {
            Some(PeerInfo { node_id, address: format!("node-{}", node_id.0) })
        }
    }

    struct FakeService {
        probe_calls: AtomicUsize,
        queue_sizes: HashMap<NodeId, (i64, i64)>,
    }

    #[async_trait]
    impl ChunkProbeService for FakeService {
        async fn probe_chunk_set(&self, peer: &PeerInfo, chunk_ids: &[ChunkId], _timeout: Duration) -> Result<ProbeChunkSetResult> {
            self.probe_calls.fetch_add(1, Ordering::SeqCst);
            let (net, disk) = self.queue_sizes.get(&peer.node_id).copied().unwrap_or((0, 0));
            let per_chunk = chunk_ids.iter().map(|id| (*id, ChunkProbeInfo { has_complete_chunk: true })).collect();
            Ok(ProbeChunkSetResult { per_chunk, net_queue_size: net, disk_queue_size: disk })
        }

        async fn fetch_fragments(&self, peer: &PeerInfo, _chunk_id: ChunkId, fragments: &[(u64, u32)]) -> Result<Vec<Vec<u8>>> {
            Ok(fragments.iter().map(|_| peer.address.clone().into_bytes()).collect())
        }
    }

    fn chunk(n: u128) -> ChunkId {
        ChunkId::new(n, 0, ChunkKind::Regular)
    }

    #[tokio::test]
    async fn picks_the_cheapest_peer_by_queue_penalty() {
        let chunk_id = chunk(1);
        let mut replicas = HashMap::new();
        replicas.insert(chunk_id, vec![NodeId(1), NodeId(2)]);
        let directory = Arc::new(FakeDirectory { replicas });

        let mut queue_sizes = HashMap::new();
        queue_sizes.insert(NodeId(1), (10, 0));
        queue_sizes.insert(NodeId(2), (1, 0));
        let service = Arc::new(FakeService { probe_calls: AtomicUsize::new(0), queue_sizes });

        let reader = ChunkFragmentReader::new(FragmentReaderConfig::default(), service, directory);
        let out = reader.read_fragments(vec![FragmentRequest { chunk_id, offset: 0, length: 4 }]).await.unwrap();
        assert_eq!(out[0], b"node-2".to_vec());
    }

    #[tokio::test]
    async fn fast_path_skips_probing_on_repeat_reads() {
        let chunk_id = chunk(2);
        let mut replicas = HashMap::new();
        replicas.insert(chunk_id, vec![NodeId(1)]);
        let directory = Arc::new(FakeDirectory { replicas });
        let service = Arc::new(FakeService { probe_calls: AtomicUsize::new(0), queue_sizes: HashMap::new() });

        let reader = ChunkFragmentReader::new(FragmentReaderConfig::default(), service.clone(), directory);
        reader.read_fragments(vec![FragmentRequest { chunk_id, offset: 0, length: 4 }]).await.unwrap();
        assert_eq!(service.probe_calls.load(Ordering::SeqCst), 1);

        reader.read_fragments(vec![FragmentRequest { chunk_id, offset: 4, length: 4 }]).await.unwrap();
        // second read hits the fast path; no additional probe RPC.
        assert_eq!(service.probe_calls.load(Ordering::SeqCst), 1);
    }

    struct FailingService;

    #[async_trait]
    impl ChunkProbeService for FailingService {
        async fn probe_chunk_set(&self, _peer: &PeerInfo, chunk_ids: &[ChunkId], _timeout: Duration) -> Result<ProbeChunkSetResult> {
            let per_chunk = chunk_ids.iter().map(|id| (*id, ChunkProbeInfo { has_complete_chunk: true })).collect();
            Ok(ProbeChunkSetResult { per_chunk, net_queue_size: 0, disk_queue_size: 0 })
        }

        async fn fetch_fragments(&self, _peer: &PeerInfo, _chunk_id: ChunkId, _fragments: &[(u64, u32)]) -> Result<Vec<Vec<u8>>> {
            Err(anyhow!("simulated fetch failure"))
        }
    }

    #[tokio::test]
    async fn exhausted_retries_surfaces_accumulated_inner_errors() {
        let chunk_id = chunk(5);
        let mut replicas = HashMap::new();
        replicas.insert(chunk_id, vec![NodeId(1)]);
        let directory = Arc::new(FakeDirectory { replicas });
        let service = Arc::new(FailingService);

        let config = FragmentReaderConfig { max_retry_count: 2, retry_backoff_time: Duration::from_millis(1), ..FragmentReaderConfig::default() };
        let reader = ChunkFragmentReader::new(config, service, directory);
        let err = reader
            .read_fragments(vec![FragmentRequest { chunk_id, offset: 0, length: 4 }])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exhausted retries"));
        assert!(err.to_string().contains("simulated fetch failure"));
    }

    #[tokio::test]
    async fn missing_replicas_yields_error() {
        let directory = Arc::new(FakeDirectory { replicas: HashMap::new() });
        let service = Arc::new(FakeService { probe_calls: AtomicUsize::new(0), queue_sizes: HashMap::new() });
        let reader = ChunkFragmentReader::new(FragmentReaderConfig::default(), service, directory);
        let result = reader.read_fragments(vec![FragmentRequest { chunk_id: chunk(3), offset: 0, length: 1 }]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn periodic_update_evicts_fast_path_entry_for_dropped_replica() {
        let chunk_id = chunk(4);
        let mut replicas = HashMap::new();
        replicas.insert(chunk_id, vec![NodeId(1)]);
        let directory = Arc::new(FakeDirectory { replicas });
        let service = Arc::new(FakeService { probe_calls: AtomicUsize::new(0), queue_sizes: HashMap::new() });
        let reader = ChunkFragmentReader::new(FragmentReaderConfig::default(), service, directory);

        reader.read_fragments(vec![FragmentRequest { chunk_id, offset: 0, length: 4 }]).await.unwrap();
        assert!(reader.fast_path_peer(chunk_id).is_some());

        reader.fast_path.lock().get_mut(&chunk_id).unwrap().peer = NodeId(99);
        reader.run_periodic_update_once();
        assert!(reader.fast_path_peer(chunk_id).is_none());
    }
}
