//! Address arithmetic shared by the path codec and the block ledger

use crate::constants::MAX_HOST_BITS;
use crate::errors::{Error, Result};
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// IPv4 addresses sit in the low 32 bits; IPv6 uses all 128.
#[inline]
pub fn addr_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

#[inline]
pub fn host_bits(cidr: &IpNet) -> u8 {
    cidr.max_prefix_len() - cidr.prefix_len()
}

/// 4 for IPv4 networks, 6 for IPv6.
#[inline]
pub fn ip_version(cidr: &IpNet) -> u8 {
    match cidr {
        IpNet::V4(_) => 4,
        IpNet::V6(_) => 6,
    }
}

// Canonicalise a CIDR: zero host bits beyond the prefix.
#[inline(always)]
pub fn canonical(cidr: IpNet) -> IpNet {
    cidr.trunc()
}

/// Number of ordinals (addresses) in a block, network address included.
pub fn block_size(cidr: &IpNet) -> Result<usize> {
    let bits = host_bits(cidr);
    if bits > MAX_HOST_BITS {
        return Err(Error::BlockTooLarge { cidr: *cidr });
    }
    Ok(1usize << bits)
}

fn in_range(cidr: &IpNet, ordinal: usize) -> bool {
    let bits = host_bits(cidr);
    bits >= 64 || (ordinal as u128) < (1u128 << bits)
}

pub fn ordinal_to_ip(cidr: &IpNet, ordinal: usize) -> Option<IpAddr> {
    if !in_range(cidr, ordinal) {
        return None;
    }
    let value = addr_to_u128(cidr.network()) + ordinal as u128;
    Some(match cidr {
        IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(value as u32)),
        IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
    })
}

pub fn ip_to_ordinal(cidr: &IpNet, ip: IpAddr) -> Option<usize> {
    if !cidr.contains(&ip) {
        return None;
    }
    let offset = addr_to_u128(ip) - addr_to_u128(cidr.network());
    usize::try_from(offset).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn sizes() {
        assert_eq!(block_size(&net("10.0.0.0/30")).unwrap(), 4);
        assert_eq!(block_size(&net("10.0.0.0/26")).unwrap(), 64);
        assert_eq!(block_size(&net("fd00::/122")).unwrap(), 64);
        assert_eq!(block_size(&net("10.0.0.1/32")).unwrap(), 1);
        assert!(matches!(
            block_size(&net("10.0.0.0/8")),
            Err(Error::BlockTooLarge { .. })
        ));
    }

    #[test]
    fn ordinal_mapping_v4() {
        let c = net("192.168.1.0/30");
        assert_eq!(ordinal_to_ip(&c, 0), Some("192.168.1.0".parse().unwrap()));
        assert_eq!(ordinal_to_ip(&c, 3), Some("192.168.1.3".parse().unwrap()));
        assert_eq!(ordinal_to_ip(&c, 4), None);
        assert_eq!(ip_to_ordinal(&c, "192.168.1.2".parse().unwrap()), Some(2));
        assert_eq!(ip_to_ordinal(&c, "192.168.1.4".parse().unwrap()), None);
    }

    #[test]
    fn ordinal_mapping_v6() {
        let c = net("fd00:1::/126");
        assert_eq!(ordinal_to_ip(&c, 2), Some("fd00:1::2".parse().unwrap()));
        assert_eq!(ip_to_ordinal(&c, "fd00:1::3".parse().unwrap()), Some(3));
        // wrong family never maps
        assert_eq!(ip_to_ordinal(&c, "10.0.0.1".parse().unwrap()), None);
    }

    #[test]
    fn canonical_zeroes_host_bits() {
        assert_eq!(canonical(net("10.0.0.5/30")), net("10.0.0.4/30"));
    }
}
