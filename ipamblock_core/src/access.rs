//! Read-modify-CAS access to allocation blocks held in a shared datastore.
//!
//! Every mutation runs against an owned copy of the stored ledger and is
//! committed with a compare-and-swap on the revision it was read at. When
//! another writer got there first the whole cycle repeats on fresh state:
//! the caller's closure is applied again, the stale result is discarded.

use crate::block::{Allocation, AllocationBlock, ReleaseReport};
use crate::config::AccessConfig;
use crate::datastore::{Datastore, KvPair, Revision};
use crate::errors::{Error, Result};
use crate::key::{BlockKey, BlockListOptions};
use crate::telemetry::{
    ALLOCATIONS_TOTAL, CAS_CONFLICTS_TOTAL, CAS_EXHAUSTED_TOTAL, FREE_ORDINALS, RELEASES_TOTAL,
};
use log::{debug, info, trace, warn};
use metrics::{counter, gauge};
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;

/// A ledger together with the datastore revision it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedBlock {
    pub block: AllocationBlock,
    pub revision: Revision,
}

pub struct BlockStore<S> {
    store: S,
    config: AccessConfig,
}

impl<S: Datastore> BlockStore<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, AccessConfig::default())
    }

    pub fn with_config(store: S, config: AccessConfig) -> Self {
        Self::ensure_logging();
        Self {
            store,
            config: config.with_max_attempts(config.max_attempts),
        }
    }

    // ---- logging bootstrap ----------------------------------------------
    fn ensure_logging() {
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
        });
    }

    pub fn datastore(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    pub fn get(&self, key: &BlockKey) -> Result<Option<VersionedBlock>> {
        let path = key.path()?;
        self.store
            .get(&path)?
            .map(|kv| Self::decode(key, &kv))
            .transpose()
    }

    fn decode(key: &BlockKey, kv: &KvPair) -> Result<VersionedBlock> {
        let block: AllocationBlock = serde_json::from_str(&kv.value)?;
        block.validate()?;
        if Some(block.cidr()) != key.cidr() {
            return Err(Error::CorruptBlock {
                cidr: block.cidr(),
                reason: format!("stored under {}", kv.path),
            });
        }
        Ok(VersionedBlock {
            block,
            revision: kv.revision,
        })
    }

    /// Apply `op` to the stored block and commit it. A missing block is
    /// [`Error::BlockNotFound`].
    pub fn update<T, F>(&self, key: &BlockKey, op: F) -> Result<T>
    where
        F: FnMut(&mut AllocationBlock) -> Result<T>,
    {
        self.commit(key, false, op)
    }

    /// Like [`update`](Self::update), but a missing block starts out empty
    /// and is created by the commit.
    pub fn update_or_create<T, F>(&self, key: &BlockKey, op: F) -> Result<T>
    where
        F: FnMut(&mut AllocationBlock) -> Result<T>,
    {
        self.commit(key, true, op)
    }

    fn commit<T, F>(&self, key: &BlockKey, create: bool, mut op: F) -> Result<T>
    where
        F: FnMut(&mut AllocationBlock) -> Result<T>,
    {
        let path = key.path()?;
        let cidr = key.cidr().ok_or(Error::InsufficientIdentifiers)?;
        let max = self.config.max_attempts;

        for attempt in 1..=max {
            let (mut block, expected) = match self.get(key)? {
                Some(current) => (current.block, Some(current.revision)),
                None if create => (AllocationBlock::new(cidr)?, None),
                None => return Err(Error::BlockNotFound { cidr }),
            };
            let before = block.clone();
            let out = op(&mut block)?;
            if block == before {
                trace!("[CAS] {path}: nothing to write");
                return Ok(out);
            }

            let value = serde_json::to_string(&block)?;
            match self.store.compare_and_swap(&path, value, expected) {
                Ok(rev) => {
                    debug!("[CAS] {path} committed at revision {rev} (attempt {attempt})");
                    gauge!(FREE_ORDINALS).set(block.num_free() as f64);
                    return Ok(out);
                }
                Err(e) if e.is_retryable() => {
                    counter!(CAS_CONFLICTS_TOTAL).increment(1);
                    debug!("[CAS] {path} conflict on attempt {attempt}/{max}, refetching");
                }
                Err(e) => return Err(e),
            }
        }

        counter!(CAS_EXHAUSTED_TOTAL).increment(1);
        warn!("[CAS] {path}: giving up after {max} conflicting attempts");
        Err(Error::ConcurrentModification {
            cidr,
            attempts: max,
        })
    }

    // ---- ledger operations ----------------------------------------------

    pub fn allocate(
        &self,
        key: &BlockKey,
        count: usize,
        handle_id: Option<&str>,
        secondary: &BTreeMap<String, String>,
        host: &str,
    ) -> Result<Allocation> {
        let allocation = self.update_or_create(key, |block| {
            block.allocate(count, handle_id, secondary, host)
        })?;
        counter!(ALLOCATIONS_TOTAL).increment(allocation.ordinals.len() as u64);
        if !allocation.is_complete() {
            info!(
                "block {key}: allocated {} of {count} for {handle_id:?}",
                allocation.ordinals.len()
            );
        }
        Ok(allocation)
    }

    pub fn assign(
        &self,
        key: &BlockKey,
        ordinal: usize,
        handle_id: Option<&str>,
        secondary: &BTreeMap<String, String>,
        host: &str,
    ) -> Result<()> {
        self.update_or_create(key, |block| {
            block.assign(ordinal, handle_id, secondary, host)
        })?;
        counter!(ALLOCATIONS_TOTAL).increment(1);
        Ok(())
    }

    pub fn release(&self, key: &BlockKey, ordinals: &[usize]) -> Result<ReleaseReport> {
        let compact = self.config.compact_on_release;
        let report = self.update(key, |block| {
            let report = block.release(ordinals);
            if compact {
                block.compact();
            }
            Ok(report)
        })?;
        counter!(RELEASES_TOTAL).increment(report.released.len() as u64);
        for failure in &report.failures {
            debug!("block {key}: {failure}");
        }
        Ok(report)
    }

    pub fn release_by_handle(&self, key: &BlockKey, handle_id: &str) -> Result<Vec<usize>> {
        let compact = self.config.compact_on_release;
        let released = self.update(key, |block| {
            let released = block.release_by_handle(handle_id);
            if compact {
                block.compact();
            }
            Ok(released)
        })?;
        counter!(RELEASES_TOTAL).increment(released.len() as u64);
        Ok(released)
    }

    /// Drop unreferenced attribute records; returns how many went.
    pub fn compact(&self, key: &BlockKey) -> Result<usize> {
        self.update(key, |block| Ok(block.compact()))
    }

    pub fn claim_affinity(&self, key: &BlockKey, host: &str, strict: bool) -> Result<()> {
        self.update_or_create(key, |block| {
            block.claim_affinity(host, strict);
            Ok(())
        })
    }

    pub fn release_affinity(&self, key: &BlockKey) -> Result<Option<String>> {
        self.update(key, |block| Ok(block.release_affinity()))
    }

    /// Every stored block in scope. Unrelated keys under the assignment root
    /// are skipped.
    pub fn list(&self, options: &BlockListOptions) -> Result<Vec<VersionedBlock>> {
        let mut blocks = Vec::new();
        for kv in self.store.list(&options.path_root())? {
            match options.key_from_path(&kv.path)? {
                Some(key) => blocks.push(Self::decode(&key, &kv)?),
                None => trace!("skipping non-block key {}", kv.path),
            }
        }
        Ok(blocks)
    }

    /// Remove a block, provided nobody wrote it since `revision`.
    pub fn delete(&self, key: &BlockKey, revision: Revision) -> Result<()> {
        let path = key.delete_path()?;
        self.store.delete(&path, revision)?;
        info!("deleted block {key} at revision {revision}");
        Ok(())
    }
}
