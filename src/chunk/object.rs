//! In-memory chunk entity: replica vector semantics (swap-remove, append or
//! update-in-place for journals), a `LastSeenReplicas` circular buffer for
//! regular chunks vs. indexed slots for erasure chunks, and the
//! export/unexport 0->1 / N->0 ref-count transitions.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};

use super::id::{ChunkId, ChunkKind, NodeId};
use super::meta::{ChunkMeta, MiscExt};
use super::requisition::{RequisitionIndex, RequisitionRegistry, EMPTY_REQUISITION_INDEX};

const LAST_SEEN_REGULAR_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Sealed,
    Active,
    Unsealed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replica {
    pub node_id: NodeId,
    pub replica_index: u8,
    pub medium: u16,
    pub state: ReplicaState,
    pub approved: bool,
}

#[derive(Debug)]
enum LastSeenReplicas {
    /// Circular buffer of the most recently seen node ids, regardless of
    /// slot — matches `chunk.cpp`'s single ring buffer for regular chunks.
    Regular { ring: Vec<Option<NodeId>>, next: usize },
    /// One slot per erasure part index.
    Erasure(Vec<Option<NodeId>>),
}

impl LastSeenReplicas {
    fn for_kind(kind: ChunkKind, erasure_parts: usize) -> Self {
        if kind.is_erasure() {
            LastSeenReplicas::Erasure(vec![None; erasure_parts.max(1)])
        } else {
            LastSeenReplicas::Regular { ring: vec![None; LAST_SEEN_REGULAR_CAPACITY], next: 0 }
        }
    }

    fn record(&mut self, node_id: NodeId, replica_index: u8) {
        match self {
            LastSeenReplicas::Regular { ring, next } => {
                ring[*next] = Some(node_id);
                *next = (*next + 1) % ring.len();
            }
            LastSeenReplicas::Erasure(slots) => {
                if (replica_index as usize) < slots.len() {
                    slots[replica_index as usize] = Some(node_id);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct ExportData {
    ref_counter: u32,
    requisition_index: RequisitionIndex,
}

pub struct Chunk {
    pub id: ChunkId,
    pub meta: ChunkMeta,
    pub confirmed: bool,
    pub sealed: bool,
    pub overlayed: bool,
    pub movable: bool,
    pub striped_erasure: bool,
    pub replicas: Vec<Replica>,
    last_seen: LastSeenReplicas,
    approved_replica_count: i64,
    /// Multiset of owning chunk-list ids; counts preserved for duplicate
    /// references from the same parent.
    pub parents: HashMap<u64, u32>,
    export_data: Option<Vec<ExportData>>,
    export_counter: u32,
    pub requisition_index: RequisitionIndex,
    pub aggregated_requisition_index: RequisitionIndex,
    pub read_quorum: u8,
    pub write_quorum: u8,
    pub log_replica_lag_limit: u64,
    pub disk_space: u64,
}

impl Chunk {
    pub fn new_unsealed(id: ChunkId, read_quorum: u8, write_quorum: u8, cell_count: usize) -> Self {
        Chunk {
            id,
            meta: ChunkMeta::empty(),
            confirmed: false,
            sealed: false,
            overlayed: false,
            movable: true,
            striped_erasure: false,
            replicas: Vec::new(),
            last_seen: LastSeenReplicas::for_kind(id.kind(), 16),
            approved_replica_count: 0,
            parents: HashMap::new(),
            export_data: None,
            export_counter: 0,
            requisition_index: EMPTY_REQUISITION_INDEX,
            aggregated_requisition_index: EMPTY_REQUISITION_INDEX,
            read_quorum,
            write_quorum,
            log_replica_lag_limit: 0,
            disk_space: 0,
            // cell_count is used lazily on first export; stash it via capacity hint.
        }
        .with_export_capacity(cell_count)
    }

    fn with_export_capacity(mut self, _cell_count: usize) -> Self {
        self.export_data = None;
        self
    }

    pub fn add_parent(&mut self, chunk_list_id: u64) {
        *self.parents.entry(chunk_list_id).or_insert(0) += 1;
    }

    pub fn remove_parent(&mut self, chunk_list_id: u64) {
        if let Some(count) = self.parents.get_mut(&chunk_list_id) {
            *count -= 1;
            if *count == 0 {
                self.parents.remove(&chunk_list_id);
            }
        }
    }

    /// Adds a replica, tracking the last-seen set and approved count.
    pub fn add_replica(&mut self, node_id: NodeId, replica_index: u8, medium: u16, approved: bool) {
        if self.id.kind().is_journal() {
            if let Some(existing) = self
                .replicas
                .iter_mut()
                .find(|r| r.node_id == node_id && r.replica_index == replica_index)
            {
                existing.state = ReplicaState::Active;
                existing.approved = existing.approved || approved;
            } else {
                self.replicas.push(Replica {
                    node_id,
                    replica_index,
                    medium,
                    state: ReplicaState::Active,
                    approved,
                });
            }
        } else {
            self.replicas.push(Replica {
                node_id,
                replica_index,
                medium,
                state: ReplicaState::Active,
                approved,
            });
        }

        if approved {
            self.approved_replica_count += 1;
        }

        self.last_seen.record(node_id, replica_index);
    }

    /// Removes a replica: swap-pop from the vector.
    pub fn remove_replica(&mut self, node_id: NodeId, replica_index: u8, approved: bool) {
        if let Some(pos) = self
            .replicas
            .iter()
            .position(|r| r.node_id == node_id && r.replica_index == replica_index)
        {
            self.replicas.swap_remove(pos);
            if approved {
                self.approved_replica_count -= 1;
                // Clamped rather than left negative; `approved_replica_count()`
                // always stays non-negative.
                if self.approved_replica_count < 0 {
                    self.approved_replica_count = 0;
                }
            }
        }
    }

    pub fn approved_replica_count(&self) -> i64 {
        self.approved_replica_count
    }

    pub fn stored_replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn sealed_replica_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.state == ReplicaState::Sealed).count()
    }

    /// Whether the chunk currently has enough replicas to be readable.
    pub fn is_available(&self) -> bool {
        match self.id.kind() {
            ChunkKind::Journal | ChunkKind::ErasureJournal => {
                self.sealed_replica_count() >= 1 || self.replicas.len() >= self.read_quorum as usize
            }
            ChunkKind::Erasure => {
                // union of present replica indices must cover all data parts;
                // the caller is expected to have set up `data_part_count`
                // via the meta extension. We approximate using replica_index
                // uniqueness against block_count as the part count.
                let data_parts = self.meta.block_count.max(1) as usize;
                let mut seen = vec![false; data_parts];
                for r in &self.replicas {
                    if (r.replica_index as usize) < data_parts {
                        seen[r.replica_index as usize] = true;
                    }
                }
                seen.iter().all(|&s| s)
            }
            ChunkKind::Regular | ChunkKind::ChunkList => !self.replicas.is_empty(),
        }
    }

    /// Attaches the final chunk meta once every replica has reported in.
    pub fn confirm(&mut self, meta: ChunkMeta) -> Result<()> {
        let misc = meta.require_misc()?.clone();
        self.meta = meta;
        self.confirmed = true;
        self.striped_erasure = misc.striped_erasure;
        self.disk_space = misc.compressed_data_size;
        Ok(())
    }

    /// Precondition: confirmed, not yet sealed, and `rowCount == 0` (the
    /// in-memory placeholder before quorum seal fills it in).
    pub fn seal(&mut self, final_row_count: u64, final_uncompressed_size: u64) -> Result<()> {
        if !self.confirmed {
            bail!("cannot seal chunk {}: not confirmed", self.id);
        }
        if self.sealed {
            bail!("cannot seal chunk {}: already sealed", self.id);
        }
        let current_row_count = self.meta.misc.as_ref().map(|m| m.row_count).unwrap_or(0);
        if current_row_count != 0 {
            bail!(
                "cannot seal chunk {}: rowCount already non-zero ({})",
                self.id,
                current_row_count
            );
        }

        let misc = self.meta.misc.get_or_insert_with(MiscExt::default);
        misc.row_count = final_row_count;
        misc.uncompressed_data_size = final_uncompressed_size;
        self.sealed = true;
        // diskSpace becomes the uncompressed size, an approximation until
        // a real compression pass runs.
        self.disk_space = final_uncompressed_size;
        Ok(())
    }

    fn ensure_export_data(&mut self, cell_count: usize) -> &mut Vec<ExportData> {
        if self.export_data.is_none() {
            let mut list = Vec::with_capacity(cell_count);
            list.resize_with(cell_count, ExportData::default);
            self.export_data = Some(list);
        }
        self.export_data.as_mut().unwrap()
    }

    /// Marks the chunk as exported to the given cell, ref-counted.
    pub fn export(&mut self, cell_index: usize, registry: &mut RequisitionRegistry) -> Result<()> {
        let cell_count = cell_index + 1;
        let list = self.ensure_export_data(cell_count.max(1));
        if cell_index >= list.len() {
            list.resize_with(cell_index + 1, ExportData::default);
        }
        let entry = &mut list[cell_index];
        entry.ref_counter += 1;
        let is_first_ref = entry.ref_counter == 1;
        let requisition_index = entry.requisition_index;
        if is_first_ref {
            assert_eq!(requisition_index, EMPTY_REQUISITION_INDEX);
            self.export_counter += 1;
            registry.ref_index(requisition_index);
        }
        Ok(())
    }

    /// Reverses `export` by `n`, releasing the requisition reference at 0.
    pub fn unexport(&mut self, cell_index: usize, n: u32, registry: &mut RequisitionRegistry) -> Result<()> {
        let id = self.id;
        let list = self
            .export_data
            .as_mut()
            .ok_or_else(|| anyhow!("unexport on chunk {} with no export data", id))?;
        let entry = list
            .get_mut(cell_index)
            .ok_or_else(|| anyhow!("unexport: cell {} out of range", cell_index))?;
        entry.ref_counter = entry.ref_counter.saturating_sub(n);
        if entry.ref_counter == 0 {
            if registry.unref_index(entry.requisition_index) {
                // nothing extra to do: an empty requisition does not
                // contribute to the aggregate.
            }
            entry.requisition_index = EMPTY_REQUISITION_INDEX;
            self.export_counter -= 1;
            if self.export_counter == 0 {
                self.export_data = None;
            }
            self.recompute_aggregated_requisition(registry);
        }
        Ok(())
    }

    pub fn is_exported(&self) -> bool {
        self.export_counter != 0
    }

    fn recompute_aggregated_requisition(&mut self, registry: &mut RequisitionRegistry) {
        let mut total = registry.get(self.requisition_index).clone();
        if let Some(list) = &self.export_data {
            for entry in list {
                if entry.ref_counter > 0 {
                    total.aggregate(registry.get(entry.requisition_index));
                }
            }
        }
        self.aggregated_requisition_index = registry.intern(total);
    }
}
