//! Requisition flyweight: a shared `medium -> {replication_factor,
//! data_parts_only}` summary referenced by many chunks.

use std::collections::HashMap;

pub type MediumId = u16;
pub type RequisitionIndex = u32;

pub const EMPTY_REQUISITION_INDEX: RequisitionIndex = 0;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MediumRequirement {
    pub replication_factor: u8,
    pub data_parts_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Requisition {
    pub entries: Vec<(MediumId, MediumRequirement)>,
}

impl Requisition {
    pub fn empty() -> Self {
        Requisition { entries: Vec::new() }
    }

    pub fn aggregate(&mut self, other: &Requisition) {
        for (medium, req) in &other.entries {
            match self.entries.iter_mut().find(|(m, _)| m == medium) {
                Some((_, existing)) => {
                    existing.replication_factor =
                        existing.replication_factor.max(req.replication_factor);
                    existing.data_parts_only = existing.data_parts_only && req.data_parts_only;
                }
                None => self.entries.push((*medium, req.clone())),
            }
        }
    }
}

/// Interns [`Requisition`] values behind small indices and ref-counts them,
/// the way `TChunkRequisitionRegistry` backs `Export`/`Unexport` (grounded
/// on `chunk.cpp`'s `Export`/`Unexport` 0->1 / N->0 transition rules).
#[derive(Debug, Default)]
pub struct RequisitionRegistry {
    table: Vec<Requisition>,
    ref_counts: Vec<u32>,
    index_of: HashMap<Requisition, RequisitionIndex>,
}

impl RequisitionRegistry {
    pub fn new() -> Self {
        let mut registry = RequisitionRegistry::default();
        let empty = Requisition::empty();
        registry.index_of.insert(empty.clone(), EMPTY_REQUISITION_INDEX);
        registry.table.push(empty);
        registry.ref_counts.push(0);
        registry
    }

    pub fn intern(&mut self, requisition: Requisition) -> RequisitionIndex {
        if let Some(&idx) = self.index_of.get(&requisition) {
            return idx;
        }
        let idx = self.table.len() as RequisitionIndex;
        self.index_of.insert(requisition.clone(), idx);
        self.table.push(requisition);
        self.ref_counts.push(0);
        idx
    }

    pub fn get(&self, index: RequisitionIndex) -> &Requisition {
        &self.table[index as usize]
    }

    pub fn ref_index(&mut self, index: RequisitionIndex) {
        self.ref_counts[index as usize] += 1;
    }

    /// Returns true if the entry's ref count dropped to zero.
    pub fn unref_index(&mut self, index: RequisitionIndex) -> bool {
        let count = &mut self.ref_counts[index as usize];
        assert!(*count > 0, "unref of requisition with zero refcount");
        *count -= 1;
        *count == 0
    }

    pub fn ref_count(&self, index: RequisitionIndex) -> u32 {
        self.ref_counts[index as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_deduplicates_equal_requisitions() {
        let mut registry = RequisitionRegistry::new();
        let mut req = Requisition::empty();
        req.entries.push((1, MediumRequirement { replication_factor: 3, data_parts_only: false }));

        let a = registry.intern(req.clone());
        let b = registry.intern(req);
        assert_eq!(a, b);
        assert_ne!(a, EMPTY_REQUISITION_INDEX);
    }

    #[test]
    fn aggregate_takes_max_replication_factor() {
        let mut total = Requisition::empty();
        total.entries.push((1, MediumRequirement { replication_factor: 2, data_parts_only: true }));
        let mut other = Requisition::empty();
        other.entries.push((1, MediumRequirement { replication_factor: 5, data_parts_only: true }));
        total.aggregate(&other);
        assert_eq!(total.entries[0].1.replication_factor, 5);
    }
}
