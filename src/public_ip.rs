//! Filtering of addresses that are meaningless to geolocate.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Implementation of unstable IpAddr::to_canonical
/// https://github.com/rust-lang/rust/issues/27709
pub trait CanonicalIpAddr {
    fn to_canonical_ip(&self) -> Self;
}

impl CanonicalIpAddr for IpAddr {
    fn to_canonical_ip(&self) -> Self {
        match self {
            IpAddr::V4(v4) => IpAddr::V4(*v4),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => IpAddr::V4(v4),
                None => IpAddr::V6(*v6),
            },
        }
    }
}

/// Parse an address and accept it only if it is public-routable.
///
/// Private, loopback, link-local, reserved and unspecified ranges are
/// rejected: geolocating them cannot produce a meaningful answer, so they
/// must not reach the cache or the database. V4-mapped v6 addresses are
/// canonicalised to their v4 form first.
pub fn parse_public_ip(address: &str) -> Option<IpAddr> {
    let ip: IpAddr = address.trim().parse().ok()?;
    let ip = ip.to_canonical_ip();
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4).then_some(ip),
        IpAddr::V6(v6) => is_public_v6(v6).then_some(ip),
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        // 0.0.0.0/8 "this network"
        || octets[0] == 0
        // 100.64.0.0/10 shared address space (CGNAT)
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64)
        // 192.0.0.0/24 IETF protocol assignments
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0)
        // TEST-NET-1/2/3
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 2)
        || (octets[0] == 198 && octets[1] == 51 && octets[2] == 100)
        || (octets[0] == 203 && octets[1] == 0 && octets[2] == 113)
        // 198.18.0.0/15 benchmarking
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18)
        // 240.0.0.0/4 reserved
        || octets[0] >= 240)
}

fn is_public_v6(ip: Ipv6Addr) -> bool {
    let segments = ip.segments();
    !(ip.is_unspecified()
        || ip.is_loopback()
        // fc00::/7 unique local
        || (segments[0] & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (segments[0] & 0xffc0) == 0xfe80
        // ff00::/8 multicast
        || (segments[0] & 0xff00) == 0xff00
        // 2001:db8::/32 documentation
        || (segments[0] == 0x2001 && segments[1] == 0xdb8))
}
