use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Barrier,
    },
    thread,
};

use ipamblock_core::{
    AccessConfig, AllocationBlock, BlockKey, BlockListOptions, BlockStore, Datastore, Error,
    KvPair, MemoryDatastore, Result, Revision,
};

fn key(s: &str) -> BlockKey {
    BlockKey::new(s.parse().unwrap())
}

fn no_attrs() -> BTreeMap<String, String> {
    BTreeMap::new()
}

#[test]
fn allocate_release_cycle() {
    let store = BlockStore::new(MemoryDatastore::new());
    let k = key("10.0.0.0/30");

    let a = store.allocate(&k, 2, Some("h1"), &no_attrs(), "nodeA").unwrap();
    assert_eq!(a.ordinals, vec![0, 1]);

    let stored = store.get(&k).unwrap().unwrap();
    assert_eq!(stored.block.allocations(), &[Some(0), Some(0), None, None]);
    assert_eq!(stored.block.unallocated(), &[2, 3]);
    assert_eq!(stored.block.attributes().len(), 1);

    // what actually sits in the datastore
    let raw = store.datastore().get(&k.path().unwrap()).unwrap().unwrap();
    assert!(raw.value.contains(r#""allocations":[0,0,null,null]"#));
    assert!(raw.value.contains(r#""handle_id":"h1""#));

    let report = store.release(&k, &[0]).unwrap();
    assert_eq!(report.released, vec![0]);
    assert!(report.is_clean());

    let again = store.release(&k, &[0, 1]).unwrap();
    assert_eq!(again.released, vec![1]);
    assert!(matches!(
        again.failures.as_slice(),
        [Error::AlreadyUnallocated { ordinal: 0, .. }]
    ));

    let stored = store.get(&k).unwrap().unwrap();
    assert!(stored.block.is_empty());
    // the record outlives its last reference until an explicit compaction
    assert_eq!(stored.block.attributes().len(), 1);
    assert_eq!(store.compact(&k).unwrap(), 1);
    assert!(store.get(&k).unwrap().unwrap().block.attributes().is_empty());
}

#[test]
fn release_leaves_attribute_indices_alone() {
    let store = BlockStore::new(MemoryDatastore::new());
    let k = key("10.0.0.0/29");
    store.allocate(&k, 1, Some("a"), &no_attrs(), "n").unwrap();
    store.allocate(&k, 1, Some("b"), &no_attrs(), "n").unwrap();

    assert!(store.release(&k, &[0]).unwrap().is_clean());
    let block = store.get(&k).unwrap().unwrap().block;
    assert_eq!(block.attributes().len(), 2);
    assert_eq!(block.allocations()[1], Some(1));
    assert_eq!(block.attribute_ref_count(0), 0);

    let rev = store.get(&k).unwrap().unwrap().revision;
    assert_eq!(store.compact(&k).unwrap(), 1);
    let block = store.get(&k).unwrap().unwrap().block;
    assert_eq!(block.allocations()[1], Some(0));
    assert_eq!(block.attributes_for(1).unwrap().handle_id.as_deref(), Some("b"));

    // nothing left to drop: no write
    let rev_after = store.get(&k).unwrap().unwrap().revision;
    assert!(rev_after > rev);
    assert_eq!(store.compact(&k).unwrap(), 0);
    assert_eq!(store.get(&k).unwrap().unwrap().revision, rev_after);
}

#[test]
fn compact_on_release_when_configured() {
    let cfg = AccessConfig::default().with_compact_on_release(true);
    let store = BlockStore::with_config(MemoryDatastore::new(), cfg);
    let k = key("10.0.0.0/29");
    store.allocate(&k, 3, Some("web"), &no_attrs(), "n").unwrap();
    store.allocate(&k, 1, Some("db"), &no_attrs(), "n").unwrap();
    assert_eq!(store.release_by_handle(&k, "web").unwrap(), vec![0, 1, 2]);

    let block = store.get(&k).unwrap().unwrap().block;
    assert_eq!(block.attributes().len(), 1);
    assert_eq!(block.allocations()[3], Some(0));
    assert!(store.release_by_handle(&k, "web").unwrap().is_empty());
}

#[test]
fn compact_missing_block_fails() {
    let store = BlockStore::new(MemoryDatastore::new());
    assert!(matches!(
        store.compact(&key("10.0.0.0/30")),
        Err(Error::BlockNotFound { .. })
    ));
}

#[test]
fn strict_affinity_is_enforced_through_the_store() {
    let store = BlockStore::new(MemoryDatastore::new());
    let k = key("192.168.10.0/28");
    store.claim_affinity(&k, "nodeA", true).unwrap();
    let before = store.get(&k).unwrap().unwrap();

    let err = store.allocate(&k, 1, Some("h"), &no_attrs(), "nodeB").unwrap_err();
    assert!(matches!(err, Error::AffinityViolation { .. }));
    assert_eq!(store.get(&k).unwrap().unwrap(), before);

    store.assign(&k, 5, Some("h"), &no_attrs(), "nodeA").unwrap();
    let block = store.get(&k).unwrap().unwrap().block;
    assert_eq!(block.ips_by_handle("h"), vec!["192.168.10.5".parse::<std::net::IpAddr>().unwrap()]);

    assert_eq!(store.release_affinity(&k).unwrap(), Some("nodeA".into()));
    store.allocate(&k, 1, Some("h2"), &no_attrs(), "nodeB").unwrap();
}

#[test]
fn list_filters_and_scopes() {
    let mem = Arc::new(MemoryDatastore::new());
    let store = BlockStore::new(Arc::clone(&mem));
    store.claim_affinity(&key("10.0.0.0/30"), "a", false).unwrap();
    store.claim_affinity(&key("10.0.1.0/30"), "a", false).unwrap();
    store.claim_affinity(&key("fd00::/126"), "b", false).unwrap();
    // neighbours in the same namespace that are not blocks
    mem.compare_and_swap("/calico/ipam/v2/assignment/ipv4/handle/h1", "{}".into(), None)
        .unwrap();
    mem.compare_and_swap("/calico/ipam/v2/host/a/ipv4/block/10.0.0.0-30", "{}".into(), None)
        .unwrap();

    let all = store.list(&BlockListOptions::default()).unwrap();
    assert_eq!(all.len(), 3);
    let v4: Vec<_> = store
        .list(&BlockListOptions::new(4))
        .unwrap()
        .into_iter()
        .map(|v| v.block.cidr().to_string())
        .collect();
    assert_eq!(v4, vec!["10.0.0.0/30", "10.0.1.0/30"]);
    assert_eq!(store.list(&BlockListOptions::new(6)).unwrap().len(), 1);
}

#[test]
fn list_reports_malformed_block_paths() {
    let mem = MemoryDatastore::new();
    mem.compare_and_swap("/calico/ipam/v2/assignment/ipv4/block/bogus", "{}".into(), None)
        .unwrap();
    let store = BlockStore::new(mem);
    assert!(matches!(
        store.list(&BlockListOptions::default()),
        Err(Error::MalformedBlockPath { .. })
    ));
}

#[test]
fn list_keeps_blocks_under_a_mismatched_version_segment() {
    let mem = MemoryDatastore::new();
    let block = AllocationBlock::new("10.0.0.0/30".parse().unwrap()).unwrap();
    mem.compare_and_swap(
        "/calico/ipam/v2/assignment/ipv6/block/10.0.0.0-30",
        serde_json::to_string(&block).unwrap(),
        None,
    )
    .unwrap();
    let store = BlockStore::new(mem);
    let listed = store.list(&BlockListOptions::default()).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].block, block);
}

#[test]
fn delete_is_revision_checked() {
    let store = BlockStore::new(MemoryDatastore::new());
    let k = key("10.0.0.0/30");
    store.claim_affinity(&k, "n", false).unwrap();
    let stale = store.get(&k).unwrap().unwrap().revision;
    store.release_affinity(&k).unwrap();

    assert!(matches!(
        store.delete(&k, stale),
        Err(Error::RevisionConflict { .. })
    ));
    let current = store.get(&k).unwrap().unwrap().revision;
    store.delete(&k, current).unwrap();
    assert!(store.get(&k).unwrap().is_none());
    assert_eq!(store.delete(&BlockKey::default(), 1), Err(Error::InsufficientIdentifiers));
}

/// A datastore whose writes fail outright.
struct Unreachable {
    inner: MemoryDatastore,
    swaps: AtomicUsize,
}

impl Datastore for Unreachable {
    fn get(&self, path: &str) -> Result<Option<KvPair>> {
        self.inner.get(path)
    }
    fn compare_and_swap(&self, _: &str, _: String, _: Option<Revision>) -> Result<Revision> {
        self.swaps.fetch_add(1, Ordering::SeqCst);
        Err(Error::Datastore("connection refused".into()))
    }
    fn delete(&self, _: &str, _: Revision) -> Result<()> {
        Err(Error::Datastore("connection refused".into()))
    }
    fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        self.inner.list(prefix)
    }
}

#[test]
fn backend_failures_are_not_retried() {
    let ds = Unreachable {
        inner: MemoryDatastore::new(),
        swaps: AtomicUsize::new(0),
    };
    let store = BlockStore::new(ds);
    let k = key("10.0.0.0/30");
    let err = store.allocate(&k, 1, None, &no_attrs(), "n").unwrap_err();
    assert_eq!(err, Error::Datastore("connection refused".into()));
    assert!(!err.is_retryable());
    assert_eq!(store.datastore().swaps.load(Ordering::SeqCst), 1);
    assert!(matches!(store.delete(&k, 1), Err(Error::Datastore(_))));
}

/// A datastore that loses every compare-and-swap.
struct AlwaysConflicting {
    inner: MemoryDatastore,
    swaps: AtomicUsize,
}

impl Datastore for AlwaysConflicting {
    fn get(&self, path: &str) -> Result<Option<KvPair>> {
        self.inner.get(path)
    }
    fn compare_and_swap(&self, path: &str, _: String, _: Option<Revision>) -> Result<Revision> {
        self.swaps.fetch_add(1, Ordering::SeqCst);
        Err(Error::RevisionConflict { path: path.to_string() })
    }
    fn delete(&self, path: &str, expected: Revision) -> Result<()> {
        self.inner.delete(path, expected)
    }
    fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        self.inner.list(prefix)
    }
}

#[test]
fn retries_are_bounded() {
    let ds = AlwaysConflicting {
        inner: MemoryDatastore::new(),
        swaps: AtomicUsize::new(0),
    };
    let store = BlockStore::with_config(ds, AccessConfig::default().with_max_attempts(5));
    let k = key("10.0.0.0/30");
    let err = store.allocate(&k, 1, Some("h"), &no_attrs(), "n").unwrap_err();
    assert_eq!(
        err,
        Error::ConcurrentModification {
            cidr: "10.0.0.0/30".parse().unwrap(),
            attempts: 5
        }
    );
    assert_eq!(store.datastore().swaps.load(Ordering::SeqCst), 5);
}

/// Lets a rival node commit between our read and our write, once.
struct RivalWriter {
    inner: MemoryDatastore,
    armed: AtomicBool,
}

impl Datastore for RivalWriter {
    fn get(&self, path: &str) -> Result<Option<KvPair>> {
        self.inner.get(path)
    }
    fn compare_and_swap(
        &self,
        path: &str,
        value: String,
        expected: Option<Revision>,
    ) -> Result<Revision> {
        if self.armed.swap(false, Ordering::SeqCst) {
            let current = self.inner.get(path)?.expect("rival needs an existing block");
            let mut block: AllocationBlock = serde_json::from_str(&current.value)?;
            block.allocate(1, Some("rival"), &BTreeMap::new(), "other-node")?;
            self.inner.compare_and_swap(
                path,
                serde_json::to_string(&block)?,
                Some(current.revision),
            )?;
        }
        self.inner.compare_and_swap(path, value, expected)
    }
    fn delete(&self, path: &str, expected: Revision) -> Result<()> {
        self.inner.delete(path, expected)
    }
    fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        self.inner.list(prefix)
    }
}

#[test]
fn conflict_reapplies_the_operation_on_fresh_state() {
    let ds = RivalWriter {
        inner: MemoryDatastore::new(),
        armed: AtomicBool::new(false),
    };
    let store = BlockStore::new(ds);
    let k = key("10.0.0.0/30");
    store.claim_affinity(&k, "n", false).unwrap();
    store.datastore().armed.store(true, Ordering::SeqCst);

    let mine = store.allocate(&k, 1, Some("mine"), &no_attrs(), "n").unwrap();
    // the rival took ordinal 0 first; our retry saw that and moved on
    assert_eq!(mine.ordinals, vec![1]);

    let block = store.get(&k).unwrap().unwrap().block;
    assert_eq!(block.ordinals_by_handle("rival"), vec![0]);
    assert_eq!(block.ordinals_by_handle("mine"), vec![1]);
    block.validate().unwrap();
}

#[test]
fn concurrent_allocators_get_disjoint_ordinals() {
    let threads = num_cpus::get().clamp(2, 8);
    const PER_THREAD: usize = 4;

    let store = Arc::new(BlockStore::new(MemoryDatastore::new()));
    let k = key("10.20.0.0/26");
    let barrier = Arc::new(Barrier::new(threads));

    let mut handles = vec![];
    for t in 0..threads {
        let store = Arc::clone(&store);
        let b = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            b.wait();
            let handle = format!("t{t}");
            let mut mine = vec![];
            for _ in 0..PER_THREAD {
                let a = store
                    .allocate(&k, 2, Some(&handle), &BTreeMap::new(), "shared")
                    .expect("allocation should survive contention");
                assert_eq!(a.ordinals.len(), 2);
                mine.extend(a.ordinals);
            }
            (handle, mine)
        }));
    }

    let mut seen = HashSet::new();
    let block_results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for (_, ordinals) in &block_results {
        for o in ordinals {
            assert!(seen.insert(*o), "ordinal {o} handed out twice");
        }
    }

    let block = store.get(&k).unwrap().unwrap().block;
    block.validate().unwrap();
    assert_eq!(block.num_allocated(), threads * PER_THREAD * 2);
    assert_eq!(block.attributes().len(), threads);
    for (handle, ordinals) in block_results {
        let mut ordinals = ordinals;
        ordinals.sort_unstable();
        assert_eq!(block.ordinals_by_handle(&handle), ordinals);
    }
}
