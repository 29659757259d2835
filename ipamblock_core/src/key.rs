//! Datastore key paths for allocation blocks.
//!
//! A block lives at
//!
//! ```text
//! /calico/ipam/v2/assignment/ipv{4|6}/block/{network}-{prefix_len}
//! ```
//!
//! The CIDR's first `/` is swapped for `-` so the block stays a single path
//! segment. `BlockKey::from_path` reverses the mapping and is also the
//! filter used while enumerating the assignment namespace: any path that does
//! not have the block layout decodes to `Ok(None)`.

use crate::constants::{ASSIGNMENT_ROOT, BLOCK_SEGMENT};
use crate::errors::{Error, Result};
use crate::helpers::{canonical, ip_version};
use ipnet::IpNet;
use log::{trace, warn};
use std::fmt;

/// Identity of one allocation block. Keys built from a CIDR are canonical
/// (host bits zeroed), so equal networks always produce equal keys.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BlockKey {
    cidr: Option<IpNet>,
}

impl BlockKey {
    pub fn new(cidr: IpNet) -> Self {
        Self {
            cidr: Some(canonical(cidr)),
        }
    }

    pub fn cidr(&self) -> Option<IpNet> {
        self.cidr
    }

    /// Encode the key as its datastore path.
    pub fn path(&self) -> Result<String> {
        let cidr = self.cidr.ok_or(Error::InsufficientIdentifiers)?;
        let segment = cidr.to_string().replacen('/', "-", 1);
        Ok(format!(
            "{ASSIGNMENT_ROOT}ipv{}{BLOCK_SEGMENT}{segment}",
            ip_version(&cidr)
        ))
    }

    pub fn delete_path(&self) -> Result<String> {
        self.path()
    }

    /// Decode a datastore path. `Ok(None)` means "not a block key"; an error
    /// means the path has the block layout but names no valid CIDR. A
    /// version segment that disagrees with the CIDR is logged and accepted.
    pub fn from_path(path: &str) -> Result<Option<BlockKey>> {
        let Some((version, segment)) = split_block_path(path) else {
            trace!("{path} is not a block path");
            return Ok(None);
        };
        let cidr_str = segment.replacen('-', "/", 1);
        let cidr: IpNet = cidr_str.parse().map_err(|e| Error::MalformedBlockPath {
            path: path.to_string(),
            reason: format!("{cidr_str:?}: {e}"),
        })?;
        // the CIDR decides the family; the version segment is advisory
        let family = char::from(b'0' + ip_version(&cidr));
        if version != family {
            warn!("{path}: ipv{version} segment holds an IPv{family} CIDR");
        }
        Ok(Some(BlockKey::new(cidr)))
    }
}

impl From<IpNet> for BlockKey {
    fn from(cidr: IpNet) -> Self {
        BlockKey::new(cidr)
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cidr {
            Some(cidr) => write!(f, "{cidr}"),
            None => f.write_str("<unset>"),
        }
    }
}

// Grammar: "/"? ASSIGNMENT_ROOT "ipv" <any char> "/block/" <one or more non-'/'> EOS
fn split_block_path(path: &str) -> Option<(char, &str)> {
    let path = match path.strip_prefix('/') {
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    };
    let rest = path.strip_prefix(ASSIGNMENT_ROOT)?.strip_prefix("ipv")?;
    let mut chars = rest.chars();
    let version = chars.next()?;
    let segment = chars.as_str().strip_prefix(BLOCK_SEGMENT)?;
    if segment.is_empty() || segment.contains('/') {
        return None;
    }
    Some((version, segment))
}

/// Scope of a block listing; `ip_version == 0` lists every family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockListOptions {
    pub ip_version: u8,
}

impl BlockListOptions {
    pub fn new(ip_version: u8) -> Self {
        Self { ip_version }
    }

    pub fn path_root(&self) -> String {
        if self.ip_version == 0 {
            ASSIGNMENT_ROOT.to_string()
        } else {
            format!("{ASSIGNMENT_ROOT}ipv{}/", self.ip_version)
        }
    }

    pub fn key_from_path(&self, path: &str) -> Result<Option<BlockKey>> {
        BlockKey::from_path(path)
    }
}
