//! Per-CIDR IPAM allocation blocks.
//!
//! An [`AllocationBlock`] is the ledger for one CIDR: which address ordinals
//! are free, which are claimed and under what handle and attributes, and
//! which host the block is affine to. Ledgers live in a shared key-value
//! datastore at the path produced by [`BlockKey::path`] and are only ever
//! changed through [`BlockStore`]'s read-modify-CAS loop.
//!
//! ```
//! use ipamblock_core::{BlockKey, BlockStore, MemoryDatastore};
//! use std::collections::BTreeMap;
//!
//! let key = BlockKey::new("10.0.0.0/30".parse().unwrap());
//! assert_eq!(key.path().unwrap(), "/calico/ipam/v2/assignment/ipv4/block/10.0.0.0-30");
//!
//! let store = BlockStore::new(MemoryDatastore::new());
//! let got = store.allocate(&key, 2, Some("h1"), &BTreeMap::new(), "node-a").unwrap();
//! assert_eq!(got.ordinals, vec![0, 1]);
//! ```

pub mod access;
pub mod block;
pub mod config;
pub mod constants;
pub mod datastore;
pub mod errors;
pub mod helpers;
pub mod key;
pub mod telemetry;

pub use access::{BlockStore, VersionedBlock};
pub use block::{Allocation, AllocationAttribute, AllocationBlock, ReleaseReport};
pub use config::AccessConfig;
pub use datastore::{Datastore, KvPair, MemoryDatastore, Revision};
pub use errors::{Error, Result};
pub use key::{BlockKey, BlockListOptions};
