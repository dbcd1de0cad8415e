use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use shared::types::AddressRanking;

/// How likely a peer can reach an address, lower is better
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Reachability {
    RoutableV4 = 0,
    RoutableV6 = 1,
    LinkLocal = 2,
    Loopback = 3,
    Unusable = 4,
}

pub fn classify(addr: &IpAddr) -> Reachability {
    match addr {
        IpAddr::V4(v4) => classify_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => classify_v4(&v4),
            None => classify_v6(v6),
        },
    }
}

fn classify_v4(addr: &Ipv4Addr) -> Reachability {
    if addr.is_unspecified() || addr.is_multicast() || addr.is_broadcast() {
        Reachability::Unusable
    } else if addr.is_loopback() {
        Reachability::Loopback
    } else if addr.is_link_local() {
        Reachability::LinkLocal
    } else {
        Reachability::RoutableV4
    }
}

fn classify_v6(addr: &Ipv6Addr) -> Reachability {
    if addr.is_unspecified() || addr.is_multicast() {
        Reachability::Unusable
    } else if addr.is_loopback() {
        Reachability::Loopback
    } else if (addr.segments()[0] & 0xffc0) == 0xfe80 {
        Reachability::LinkLocal
    } else {
        Reachability::RoutableV6
    }
}

/// Rank addresses best first: stable sort by reachability class, so
/// addresses of the same class keep their discovery order.
pub fn rank_addresses(addresses: &[IpAddr]) -> AddressRanking {
    let mut ranked = addresses.to_vec();
    ranked.sort_by_key(classify);
    AddressRanking(ranked)
}
