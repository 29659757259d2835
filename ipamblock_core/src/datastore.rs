//! Key-value datastore seam used by the block access loop.
//!
//! Real deployments put etcd or a Kubernetes API behind [`Datastore`];
//! [`MemoryDatastore`] is the in-process backend used by tests and embedders.

use crate::errors::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::trace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Datastore version stamp of one key; bumped on every write.
pub type Revision = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub path: String,
    pub value: String,
    pub revision: Revision,
}

pub trait Datastore: Send + Sync {
    fn get(&self, path: &str) -> Result<Option<KvPair>>;

    /// Write `value` only if the key is still at `expected`; `None` means the
    /// key must not exist yet. A mismatch is [`Error::RevisionConflict`].
    fn compare_and_swap(
        &self,
        path: &str,
        value: String,
        expected: Option<Revision>,
    ) -> Result<Revision>;

    fn delete(&self, path: &str, expected: Revision) -> Result<()>;

    /// Every key under `prefix`, sorted by path.
    fn list(&self, prefix: &str) -> Result<Vec<KvPair>>;
}

impl<T: Datastore + ?Sized> Datastore for Arc<T> {
    fn get(&self, path: &str) -> Result<Option<KvPair>> {
        (**self).get(path)
    }

    fn compare_and_swap(
        &self,
        path: &str,
        value: String,
        expected: Option<Revision>,
    ) -> Result<Revision> {
        (**self).compare_and_swap(path, value, expected)
    }

    fn delete(&self, path: &str, expected: Revision) -> Result<()> {
        (**self).delete(path, expected)
    }

    fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        (**self).list(prefix)
    }
}

#[derive(Debug, Default)]
pub struct MemoryDatastore {
    entries: DashMap<String, (String, Revision)>,
    revision: AtomicU64,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_revision(&self) -> Revision {
        self.revision.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Datastore for MemoryDatastore {
    fn get(&self, path: &str) -> Result<Option<KvPair>> {
        Ok(self.entries.get(path).map(|e| KvPair {
            path: path.to_string(),
            value: e.0.clone(),
            revision: e.1,
        }))
    }

    fn compare_and_swap(
        &self,
        path: &str,
        value: String,
        expected: Option<Revision>,
    ) -> Result<Revision> {
        // the entry guard holds the shard lock, so check and write are atomic
        match (self.entries.entry(path.to_string()), expected) {
            (Entry::Vacant(slot), None) => {
                let rev = self.next_revision();
                slot.insert((value, rev));
                trace!("[CAS] created {path} at revision {rev}");
                Ok(rev)
            }
            (Entry::Occupied(mut slot), Some(exp)) if slot.get().1 == exp => {
                let rev = self.next_revision();
                slot.insert((value, rev));
                trace!("[CAS] updated {path} {exp} -> {rev}");
                Ok(rev)
            }
            _ => Err(Error::RevisionConflict {
                path: path.to_string(),
            }),
        }
    }

    fn delete(&self, path: &str, expected: Revision) -> Result<()> {
        self.entries
            .remove_if(path, |_, (_, rev)| *rev == expected)
            .map(|_| ())
            .ok_or_else(|| Error::RevisionConflict {
                path: path.to_string(),
            })
    }

    fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let mut out: Vec<KvPair> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| KvPair {
                path: e.key().clone(),
                value: e.value().0.clone(),
                revision: e.value().1,
            })
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}
