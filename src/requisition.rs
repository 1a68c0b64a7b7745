//! Chunk requisition registry.
//!
//! A requisition is the set of replication policies a chunk owes to the accounts owning it.
//! Requisitions are content addressed: every holder of an identical set of entries shares a
//! single registered requisition, and the registry keeps a ref-counter of all such holders.
//! Each chunk owner holds its local requisition, and each chunk holds its aggregated
//! requisition, which is the union of the local requisitions of all of its live owners.

use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::{ChunkId, ReplicationPolicy};

/// The index of a registered requisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequisitionIndex(pub u32);

/// A single entry of a requisition: the policy owed to an account.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequisitionEntry {
    pub account: String,
    pub medium: String,
    pub replication_factor: u8,
    pub data_parts_only: bool,
}

impl RequisitionEntry {
    pub fn new(account: impl Into<String>, policy: &ReplicationPolicy) -> Self {
        Self {
            account: account.into(),
            medium: policy.medium.clone(),
            replication_factor: policy.replication_factor,
            data_parts_only: policy.data_parts_only,
        }
    }
}

/// The canonical content of a requisition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Requisition {
    /// Sorted & deduplicated entries.
    entries: Vec<RequisitionEntry>,
    vital: bool,
}

impl Requisition {
    /// Build a canonical requisition from the given entries.
    pub fn new(entries: impl IntoIterator<Item = RequisitionEntry>, vital: bool) -> Self {
        let mut entries: Vec<_> = entries.into_iter().collect();
        entries.sort();
        entries.dedup();
        Self { entries, vital }
    }

    pub fn entries(&self) -> &[RequisitionEntry] {
        &self.entries
    }

    pub fn vital(&self) -> bool {
        self.vital
    }

    /// The aggregated replication factor required on the given medium.
    ///
    /// This is the max over all entries for the medium, or `0` if nothing is owed there.
    pub fn replication_factor(&self, medium: &str) -> u8 {
        self.entries
            .iter()
            .filter(|entry| entry.medium == medium)
            .map(|entry| entry.replication_factor)
            .max()
            .unwrap_or(0)
    }

    /// Check if every entry for the given medium only requires data parts.
    pub fn data_parts_only(&self, medium: &str) -> bool {
        let mut entries = self.entries.iter().filter(|entry| entry.medium == medium).peekable();
        entries.peek().is_some() && entries.all(|entry| entry.data_parts_only)
    }

    /// All distinct accounts of this requisition.
    pub fn accounts(&self) -> impl Iterator<Item = &str> + '_ {
        let mut last: Option<&str> = None;
        self.entries.iter().filter_map(move |entry| {
            if last == Some(entry.account.as_str()) {
                return None;
            }
            last = Some(entry.account.as_str());
            last
        })
    }
}

/// A requisition as stored in the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredRequisition {
    pub requisition: Requisition,
    pub ref_counter: u32,
}

/// Deduplicated, ref-counted storage of requisitions.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequisitionRegistry {
    next_index: u32,
    #[serde(with = "crate::utils::pairs")]
    registered: BTreeMap<RequisitionIndex, RegisteredRequisition>,
    #[serde(skip)]
    by_content: HashMap<Requisition, RequisitionIndex>,
    /// Chunks whose aggregated requisition changed, awaiting re-evaluation.
    #[serde(skip)]
    updates: Vec<ChunkId>,
}

impl RequisitionRegistry {
    /// Intern the given requisition content, returning its shared index.
    ///
    /// Every call must be balanced with a call to `release`.
    pub fn intern(&mut self, entries: impl IntoIterator<Item = RequisitionEntry>, vital: bool) -> RequisitionIndex {
        self.intern_requisition(Requisition::new(entries, vital))
    }

    /// Intern the given canonical requisition, returning its shared index.
    pub fn intern_requisition(&mut self, requisition: Requisition) -> RequisitionIndex {
        if let Some(index) = self.by_content.get(&requisition).copied() {
            if let Some(registered) = self.registered.get_mut(&index) {
                registered.ref_counter += 1;
                return index;
            }
        }
        let index = RequisitionIndex(self.next_index);
        self.next_index = self.next_index.wrapping_add(1);
        self.by_content.insert(requisition.clone(), index);
        self.registered.insert(index, RegisteredRequisition { requisition, ref_counter: 1 });
        index
    }

    /// Add a reference to an already registered requisition.
    pub fn acquire(&mut self, index: RequisitionIndex) -> Result<()> {
        let registered = self
            .registered
            .get_mut(&index)
            .with_context(|| format!("attempted to acquire unknown requisition {}", index.0))?;
        registered.ref_counter += 1;
        Ok(())
    }

    /// Release a reference to the given requisition, dropping it once unreferenced.
    pub fn release(&mut self, index: RequisitionIndex) -> Result<()> {
        let registered = self
            .registered
            .get_mut(&index)
            .with_context(|| format!("attempted to release unknown requisition {}", index.0))?;
        registered.ref_counter = registered.ref_counter.saturating_sub(1);
        if registered.ref_counter == 0 {
            if let Some(registered) = self.registered.remove(&index) {
                self.by_content.remove(&registered.requisition);
            }
            tracing::trace!(index = index.0, "requisition dropped");
        }
        Ok(())
    }

    /// Replace the aggregated requisition of a chunk after a change of its owners.
    ///
    /// The new requisition is computed solely from the given live entries, so the entries of
    /// an owner which has vacated the chunk never survive the update. The chunk is published
    /// for re-evaluation by the replicator.
    pub fn update_on_merge(
        &mut self, chunk: ChunkId, current: RequisitionIndex, live_entries: impl IntoIterator<Item = RequisitionEntry>, vital: bool,
    ) -> Result<RequisitionIndex> {
        let next = self.intern(live_entries, vital);
        self.release(current).context("error releasing stale aggregated requisition")?;
        if next != current {
            tracing::debug!(%chunk, old = current.0, new = next.0, "chunk requisition updated");
        }
        self.updates.push(chunk);
        Ok(next)
    }

    /// Get the requisition registered under the given index.
    pub fn get(&self, index: RequisitionIndex) -> Option<&Requisition> {
        self.registered.get(&index).map(|registered| &registered.requisition)
    }

    /// Get the full registry record of the given index.
    pub fn get_registered(&self, index: RequisitionIndex) -> Option<&RegisteredRequisition> {
        self.registered.get(&index)
    }

    /// Iterate over all registered requisitions.
    pub fn iter(&self) -> impl Iterator<Item = (&RequisitionIndex, &RegisteredRequisition)> {
        self.registered.iter()
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Take all chunks whose requisition changed since the last call.
    pub fn take_updates(&mut self) -> Vec<ChunkId> {
        std::mem::take(&mut self.updates)
    }

    /// Rebuild the content index after deserialization.
    pub fn rebuild_index(&mut self) -> Result<()> {
        self.by_content.clear();
        for (index, registered) in self.registered.iter() {
            if registered.ref_counter == 0 {
                bail!("requisition {} is registered with a zero ref-counter", index.0);
            }
            if let Some(other) = self.by_content.insert(registered.requisition.clone(), *index) {
                bail!("requisitions {} and {} have identical content", other.0, index.0);
            }
            if index.0 >= self.next_index {
                bail!("requisition {} is beyond the next index {}", index.0, self.next_index);
            }
        }
        Ok(())
    }

    /// Validate ref-counters against the references actually held by the given holders.
    pub fn validate_ref_counts(&self, expected: &BTreeMap<RequisitionIndex, u32>) -> Result<()> {
        for (index, registered) in self.registered.iter() {
            let held = expected.get(index).copied().unwrap_or(0);
            if held != registered.ref_counter {
                bail!(
                    "requisition {} has ref-counter {} but {} references are held",
                    index.0,
                    registered.ref_counter,
                    held
                );
            }
        }
        if let Some((index, _)) = expected.iter().find(|(index, _)| !self.registered.contains_key(index)) {
            bail!("reference held to unknown requisition {}", index.0);
        }
        Ok(())
    }
}
