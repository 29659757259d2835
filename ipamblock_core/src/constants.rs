//! Constants and defaults for IPAM allocation blocks

/// Root of every IPAM assignment key; also the "any version" list prefix.
pub const ASSIGNMENT_ROOT: &str = "/calico/ipam/v2/assignment/";
pub const BLOCK_SEGMENT: &str = "/block/";

/// One ledger entry per address, so the host part is capped at 16 bits.
pub const MAX_HOST_BITS: u8 = 16;
pub const MAX_BLOCK_ORDINALS: usize = 1 << MAX_HOST_BITS;

pub const DEFAULT_MAX_ATTEMPTS: usize = 100;

pub const ENV_MAX_ATTEMPTS: &str = "IPAM_BLOCK_MAX_ATTEMPTS";
pub const ENV_COMPACT_ON_RELEASE: &str = "IPAM_BLOCK_COMPACT_ON_RELEASE";
