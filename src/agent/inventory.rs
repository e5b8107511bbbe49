//! # Address Inventory
//!
//! Enumerates the local addresses an agent can bind outbound sockets to.
//! The scan is advisory: an address disappearing mid-session surfaces as a
//! `BindError` on the next request from it, which the coordinator handles by
//! failing that job.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use sysinfo::Networks;

/// Scan interface addresses and return the reportable set, sorted and
/// deduplicated. Re-runnable; the result feeds `register` and `heartbeat`.
pub fn scan() -> Vec<String> {
    let networks = Networks::new_with_refreshed_list();
    let addresses = networks
        .iter()
        .flat_map(|(_, data)| data.ip_networks().iter().map(|network| network.addr));
    collect_reportable(addresses)
}

/// Filter, format, sort and deduplicate a set of candidate addresses
pub fn collect_reportable<I: IntoIterator<Item = IpAddr>>(candidates: I) -> Vec<String> {
    let mut addresses: Vec<String> = candidates
        .into_iter()
        .filter(is_reportable)
        .map(|ip| ip.to_string())
        .collect();
    addresses.sort();
    addresses.dedup();
    addresses
}

/// Usable as an egress source: not loopback, link-local, multicast,
/// unspecified, or a documentation/benchmark range
fn is_reportable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !v4.is_loopback()
                && !v4.is_link_local()
                && !v4.is_multicast()
                && !v4.is_unspecified()
                && !v4.is_broadcast()
                && !v4.is_documentation()
                && !is_benchmarking_v4(v4)
        }
        IpAddr::V6(v6) => {
            !v6.is_loopback()
                && !v6.is_multicast()
                && !v6.is_unspecified()
                && !is_unicast_link_local_v6(v6)
                && !is_documentation_v6(v6)
        }
    }
}

/// 198.18.0.0/15 (RFC 2544)
fn is_benchmarking_v4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[0] == 198 && (octets[1] & 0xfe) == 18
}

/// fe80::/10
fn is_unicast_link_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// 2001:db8::/32 (RFC 3849)
fn is_documentation_v6(ip: &Ipv6Addr) -> bool {
    let segments = ip.segments();
    segments[0] == 0x2001 && segments[1] == 0x0db8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ips(list: &[&str]) -> Vec<IpAddr> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_filters_special_ranges() {
        let collected = collect_reportable(ips(&[
            "127.0.0.1",       // loopback
            "::1",             // loopback
            "169.254.10.1",    // link-local
            "fe80::1",         // link-local
            "224.0.0.1",       // multicast
            "ff02::1",         // multicast
            "0.0.0.0",         // unspecified
            "192.0.2.7",       // documentation
            "198.51.100.1",    // documentation
            "203.0.113.200",   // documentation
            "198.18.0.5",      // benchmarking
            "198.19.255.1",    // benchmarking
            "2001:db8::42",    // documentation
            "10.1.2.3",
            "2001:470:1f0b::2",
        ]));

        assert_eq!(collected, vec!["10.1.2.3", "2001:470:1f0b::2"]);
    }

    #[test]
    fn test_output_is_sorted_and_deduplicated() {
        let collected = collect_reportable(ips(&["10.0.0.2", "10.0.0.1", "10.0.0.2"]));
        assert_eq!(collected, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_scan_is_rerunnable_and_excludes_loopback() {
        let first = scan();
        let second = scan();
        assert_eq!(first, second, "back-to-back scans must agree");
        assert!(!first.iter().any(|a| a == "127.0.0.1" || a == "::1"));
    }
}
