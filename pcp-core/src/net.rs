//! Address classification for firewall probes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// True when `ip` may be reached across the public internet.
///
/// Private, loopback, link-local, unspecified, broadcast, multicast, shared (CGNAT)
/// and documentation ranges are never probed.
#[must_use]
pub fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_routable_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_routable_v4(&v4),
            None => is_routable_v6(v6),
        },
    }
}

fn is_routable_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_multicast()
        || ip.is_documentation()
        // 100.64.0.0/10
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
        // 0.0.0.0/8
        || octets[0] == 0)
}

fn is_routable_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    !(ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (segments[0] & 0xFE00) == 0xFC00
        // fe80::/10 link local
        || (segments[0] & 0xFFC0) == 0xFE80
        // 2001:db8::/32 documentation
        || (segments[0] == 0x2001 && segments[1] == 0x0DB8))
}
