//! The allocation ledger for one CIDR.
//!
//! `allocations` holds one slot per address ordinal (ordinal 0 is the network
//! address). An occupied slot stores an index into `attributes`, a dense
//! arena of allocation metadata shared by every ordinal claimed together.
//! `unallocated` lists the free ordinals. The free list and the occupied
//! slots always partition `0..len()`.
//!
//! Releasing an ordinal only drops its reference; records nobody points at
//! any more stay in the arena until [`AllocationBlock::compact`] runs.

use crate::errors::{Error, Result};
use crate::helpers::{block_size, canonical, ip_to_ordinal, ordinal_to_ip};
use crate::key::BlockKey;
use ipnet::IpNet;
use log::{debug, trace};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Metadata shared by the ordinals of one claim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationAttribute {
    pub handle_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub secondary: BTreeMap<String, String>,
}

impl AllocationAttribute {
    pub fn new(handle_id: Option<&str>, secondary: &BTreeMap<String, String>) -> Self {
        Self {
            handle_id: handle_id.map(str::to_string),
            secondary: secondary.clone(),
        }
    }

    fn matches(&self, handle_id: Option<&str>, secondary: &BTreeMap<String, String>) -> bool {
        self.handle_id.as_deref() == handle_id && &self.secondary == secondary
    }
}

// Older writers serialise an empty attribute map as `null`.
fn null_as_empty<'de, D>(d: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, String>>::deserialize(d)?.unwrap_or_default())
}

/// Allocation ledger for one block CIDR.
///
/// Deserializing does not check the ledger invariants; run
/// [`validate`](Self::validate) on anything read from outside (the
/// `BlockStore` does). Operations on an unchecked ledger never panic but
/// skip entries that contradict each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationBlock {
    cidr: IpNet,
    #[serde(default)]
    host_affinity: Option<String>,
    #[serde(default)]
    strict_affinity: bool,
    allocations: Vec<Option<usize>>,
    #[serde(default)]
    unallocated: Vec<usize>,
    #[serde(default)]
    attributes: Vec<AllocationAttribute>,
}

/// Result of [`AllocationBlock::allocate`]: the ordinals actually claimed,
/// which may be fewer than requested when the block runs dry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    pub ordinals: Vec<usize>,
    pub requested: usize,
}

impl Allocation {
    pub fn shortfall(&self) -> usize {
        self.requested.saturating_sub(self.ordinals.len())
    }

    pub fn is_complete(&self) -> bool {
        self.shortfall() == 0
    }
}

/// Per-ordinal outcome of a best-effort release batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: Vec<usize>,
    pub failures: Vec<Error>,
}

impl ReleaseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl AllocationBlock {
    /// A fresh, unaffiliated block with every ordinal free.
    pub fn new(cidr: IpNet) -> Result<Self> {
        let cidr = canonical(cidr);
        let size = block_size(&cidr)?;
        Ok(Self {
            cidr,
            host_affinity: None,
            strict_affinity: false,
            allocations: vec![None; size],
            unallocated: (0..size).collect(),
            attributes: Vec::new(),
        })
    }

    pub fn cidr(&self) -> IpNet {
        self.cidr
    }

    pub fn key(&self) -> BlockKey {
        BlockKey::new(self.cidr)
    }

    pub fn host_affinity(&self) -> Option<&str> {
        self.host_affinity.as_deref()
    }

    pub fn strict_affinity(&self) -> bool {
        self.strict_affinity
    }

    pub fn allocations(&self) -> &[Option<usize>] {
        &self.allocations
    }

    pub fn unallocated(&self) -> &[usize] {
        &self.unallocated
    }

    pub fn attributes(&self) -> &[AllocationAttribute] {
        &self.attributes
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn num_free(&self) -> usize {
        self.unallocated.len()
    }

    pub fn num_allocated(&self) -> usize {
        self.len() - self.num_free()
    }

    /// True when no ordinal is allocated.
    pub fn is_empty(&self) -> bool {
        self.num_free() == self.len()
    }

    pub fn ordinal_to_ip(&self, ordinal: usize) -> Option<IpAddr> {
        if ordinal >= self.len() {
            return None;
        }
        ordinal_to_ip(&self.cidr, ordinal)
    }

    pub fn ip_to_ordinal(&self, ip: IpAddr) -> Option<usize> {
        ip_to_ordinal(&self.cidr, ip).filter(|&o| o < self.len())
    }

    // ---- affinity -------------------------------------------------------

    pub fn is_affine_to(&self, host: &str) -> bool {
        self.host_affinity.as_deref() == Some(host)
    }

    pub fn claim_affinity(&mut self, host: &str, strict: bool) {
        debug!("block {} affinity -> {host} (strict={strict})", self.cidr);
        self.host_affinity = Some(host.to_string());
        self.strict_affinity = strict;
    }

    /// Drops the affinity and returns the previous owner.
    pub fn release_affinity(&mut self) -> Option<String> {
        debug!("block {} affinity released", self.cidr);
        self.strict_affinity = false;
        self.host_affinity.take()
    }

    fn check_affinity(&self, host: &str) -> Result<()> {
        match &self.host_affinity {
            Some(owner) if self.strict_affinity && owner != host => Err(Error::AffinityViolation {
                cidr: self.cidr,
                owner: owner.clone(),
                requester: host.to_string(),
            }),
            _ => Ok(()),
        }
    }

    // ---- allocation -----------------------------------------------------

    /// Claim up to `count` free ordinals for one handle, lowest ordinals
    /// first. Identical `(handle_id, secondary)` pairs share one attribute
    /// record.
    pub fn allocate(
        &mut self,
        count: usize,
        handle_id: Option<&str>,
        secondary: &BTreeMap<String, String>,
        host: &str,
    ) -> Result<Allocation> {
        self.check_affinity(host)?;

        // entries that disagree with `allocations` are never handed out
        let mut picked: Vec<usize> = self
            .unallocated
            .iter()
            .copied()
            .filter(|&o| matches!(self.allocations.get(o), Some(None)))
            .collect();
        picked.sort_unstable();
        picked.dedup();
        picked.truncate(count);
        if picked.is_empty() {
            debug!("block {} has no free ordinals for {count} requested", self.cidr);
            return Ok(Allocation {
                ordinals: picked,
                requested: count,
            });
        }

        let attr = self.find_or_add_attribute(handle_id, secondary);
        self.unallocated.retain(|o| picked.binary_search(o).is_err());
        for &ordinal in &picked {
            self.allocations[ordinal] = Some(attr);
        }
        debug!(
            "block {} allocated {:?} (attr={attr}, requested={count})",
            self.cidr, picked
        );
        Ok(Allocation {
            ordinals: picked,
            requested: count,
        })
    }

    /// Claim one specific ordinal.
    pub fn assign(
        &mut self,
        ordinal: usize,
        handle_id: Option<&str>,
        secondary: &BTreeMap<String, String>,
        host: &str,
    ) -> Result<()> {
        self.check_affinity(host)?;
        match self.allocations.get(ordinal) {
            None => {
                return Err(Error::OrdinalOutOfRange {
                    cidr: self.cidr,
                    ordinal,
                })
            }
            Some(Some(_)) => {
                return Err(Error::AlreadyAllocated {
                    cidr: self.cidr,
                    ordinal,
                })
            }
            Some(None) => {}
        }
        let attr = self.find_or_add_attribute(handle_id, secondary);
        self.unallocated.retain(|&o| o != ordinal);
        self.allocations[ordinal] = Some(attr);
        debug!("block {} assigned ordinal {ordinal} (attr={attr})", self.cidr);
        Ok(())
    }

    pub fn assign_ip(
        &mut self,
        ip: IpAddr,
        handle_id: Option<&str>,
        secondary: &BTreeMap<String, String>,
        host: &str,
    ) -> Result<usize> {
        let ordinal = self
            .ip_to_ordinal(ip)
            .ok_or(Error::AddressNotInBlock { cidr: self.cidr, ip })?;
        self.assign(ordinal, handle_id, secondary, host)?;
        Ok(ordinal)
    }

    fn find_or_add_attribute(
        &mut self,
        handle_id: Option<&str>,
        secondary: &BTreeMap<String, String>,
    ) -> usize {
        if let Some(idx) = self
            .attributes
            .iter()
            .position(|a| a.matches(handle_id, secondary))
        {
            trace!("block {} reusing attribute record {idx}", self.cidr);
            return idx;
        }
        self.attributes
            .push(AllocationAttribute::new(handle_id, secondary));
        self.attributes.len() - 1
    }

    // ---- release --------------------------------------------------------

    /// Free each ordinal independently; a bad ordinal is reported and the
    /// rest of the batch still goes through.
    pub fn release(&mut self, ordinals: &[usize]) -> ReleaseReport {
        let mut report = ReleaseReport::default();
        for &ordinal in ordinals {
            let Some(slot) = self.allocations.get_mut(ordinal) else {
                report.failures.push(Error::OrdinalOutOfRange {
                    cidr: self.cidr,
                    ordinal,
                });
                continue;
            };
            match slot.take() {
                Some(_) => {
                    self.unallocated.push(ordinal);
                    report.released.push(ordinal);
                }
                None => report.failures.push(Error::AlreadyUnallocated {
                    cidr: self.cidr,
                    ordinal,
                }),
            }
        }
        debug!(
            "block {} released {:?}, {} failures",
            self.cidr,
            report.released,
            report.failures.len()
        );
        report
    }

    /// Free every ordinal claimed under `handle_id`. Unknown handles free
    /// nothing.
    pub fn release_by_handle(&mut self, handle_id: &str) -> Vec<usize> {
        let ordinals = self.ordinals_by_handle(handle_id);
        // every ordinal came from an occupied slot, so the report is clean
        self.release(&ordinals).released
    }

    // ---- queries --------------------------------------------------------

    pub fn attributes_for(&self, ordinal: usize) -> Option<&AllocationAttribute> {
        let idx = (*self.allocations.get(ordinal)?)?;
        self.attributes.get(idx)
    }

    pub fn attributes_for_ip(&self, ip: IpAddr) -> Option<&AllocationAttribute> {
        self.attributes_for(self.ip_to_ordinal(ip)?)
    }

    pub fn ordinals_by_handle(&self, handle_id: &str) -> Vec<usize> {
        self.allocations
            .iter()
            .enumerate()
            .filter_map(|(ordinal, slot)| {
                let attr = self.attributes.get((*slot)?)?;
                (attr.handle_id.as_deref() == Some(handle_id)).then_some(ordinal)
            })
            .collect()
    }

    pub fn ips_by_handle(&self, handle_id: &str) -> Vec<IpAddr> {
        self.ordinals_by_handle(handle_id)
            .into_iter()
            .filter_map(|o| ordinal_to_ip(&self.cidr, o))
            .collect()
    }

    /// Number of ordinals pointing at attribute record `index`.
    pub fn attribute_ref_count(&self, index: usize) -> usize {
        self.allocations
            .iter()
            .filter(|slot| **slot == Some(index))
            .count()
    }

    // ---- maintenance ----------------------------------------------------

    /// Drop attribute records no ordinal refers to and renumber the rest,
    /// keeping their relative order. Returns how many records were removed.
    pub fn compact(&mut self) -> usize {
        let mut refs = vec![0usize; self.attributes.len()];
        for idx in self.allocations.iter().flatten() {
            if let Some(r) = refs.get_mut(*idx) {
                *r += 1;
            }
        }

        let mut remap = vec![None; refs.len()];
        let mut kept = Vec::with_capacity(refs.len());
        for (old, attr) in std::mem::take(&mut self.attributes).into_iter().enumerate() {
            if refs[old] > 0 {
                remap[old] = Some(kept.len());
                kept.push(attr);
            }
        }
        let removed = refs.len() - kept.len();
        self.attributes = kept;

        if removed > 0 {
            for idx in self.allocations.iter_mut().flatten() {
                if let Some(new) = remap.get(*idx).copied().flatten() {
                    *idx = new;
                }
            }
            debug!("block {} compacted {removed} attribute records", self.cidr);
        }
        removed
    }

    /// Check the structural invariants. Used on every ledger read back from
    /// the datastore.
    pub fn validate(&self) -> Result<()> {
        let corrupt = |reason: String| Error::CorruptBlock {
            cidr: self.cidr,
            reason,
        };

        if canonical(self.cidr) != self.cidr {
            return Err(corrupt("CIDR has host bits set".into()));
        }
        let size = block_size(&self.cidr)?;
        if self.allocations.len() != size {
            return Err(corrupt(format!(
                "{} allocation slots for a block of {size}",
                self.allocations.len()
            )));
        }
        for (ordinal, slot) in self.allocations.iter().enumerate() {
            if let Some(idx) = slot {
                if *idx >= self.attributes.len() {
                    return Err(corrupt(format!(
                        "ordinal {ordinal} points at missing attribute {idx}"
                    )));
                }
            }
        }

        let mut seen = vec![false; size];
        for &ordinal in &self.unallocated {
            match self.allocations.get(ordinal) {
                None => return Err(corrupt(format!("free ordinal {ordinal} out of range"))),
                Some(Some(_)) => {
                    return Err(corrupt(format!("ordinal {ordinal} is both free and allocated")))
                }
                Some(None) if seen[ordinal] => {
                    return Err(corrupt(format!("ordinal {ordinal} listed free twice")))
                }
                Some(None) => seen[ordinal] = true,
            }
        }
        let free_slots = self.allocations.iter().filter(|s| s.is_none()).count();
        if free_slots != self.unallocated.len() {
            return Err(corrupt(format!(
                "{free_slots} empty slots but {} free ordinals",
                self.unallocated.len()
            )));
        }
        Ok(())
    }
}
