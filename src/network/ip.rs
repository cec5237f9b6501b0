// Local IP discovery for LAN hosting
// The host shows this address so the other player knows what to dial

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalAddress {
    Found(Ipv4Addr),
    Unavailable,
}

impl fmt::Display for LocalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalAddress::Found(ip) => write!(f, "{}", ip),
            LocalAddress::Unavailable => write!(f, "unknown (check your WiFi settings)"),
        }
    }
}

/// Discover the device's LAN IPv4 address
///
/// Skips loopback and link-local (169.254.x.x) addresses. An interface whose
/// name looks like WiFi wins outright; otherwise the first usable address is
/// returned.
pub fn discover_local_ip() -> LocalAddress {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!("Failed to get network interfaces: {}", e);
            return LocalAddress::Unavailable;
        }
    };

    debug!("Found {} interfaces", interfaces.len());

    let candidates = interfaces
        .into_iter()
        .map(|iface| (iface.name.clone(), iface.addr.ip()));

    select_address(candidates)
}

/// Pick the best address from `(interface name, address)` pairs
pub fn select_address<I>(candidates: I) -> LocalAddress
where
    I: IntoIterator<Item = (String, IpAddr)>,
{
    let mut fallback = None;

    for (name, ip) in candidates {
        let IpAddr::V4(ipv4) = ip else {
            continue;
        };
        if ipv4.is_loopback() || ipv4.is_link_local() || ipv4.is_unspecified() {
            continue;
        }

        if is_wifi_interface(&name) {
            debug!("Using WiFi interface {} ({})", name, ipv4);
            return LocalAddress::Found(ipv4);
        }

        if fallback.is_none() {
            fallback = Some(ipv4);
        }
    }

    fallback.map_or(LocalAddress::Unavailable, LocalAddress::Found)
}

fn is_wifi_interface(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains("wlan") || name.contains("wifi") || name.starts_with("wl")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn test_prefers_wifi_interface() {
        let picked = select_address(vec![
            ("lo".to_string(), v4(127, 0, 0, 1)),
            ("eth0".to_string(), v4(10, 0, 0, 5)),
            ("wlan0".to_string(), v4(192, 168, 1, 20)),
        ]);
        assert_eq!(picked, LocalAddress::Found(Ipv4Addr::new(192, 168, 1, 20)));
    }

    #[test]
    fn test_skips_loopback_link_local_and_ipv6() {
        let picked = select_address(vec![
            ("lo".to_string(), v4(127, 0, 0, 1)),
            ("eth1".to_string(), v4(169, 254, 3, 4)),
            ("eth2".to_string(), "fe80::1".parse().unwrap()),
            ("eth0".to_string(), v4(192, 168, 0, 7)),
        ]);
        assert_eq!(picked, LocalAddress::Found(Ipv4Addr::new(192, 168, 0, 7)));
    }

    #[test]
    fn test_nothing_usable() {
        let picked = select_address(vec![("lo".to_string(), v4(127, 0, 0, 1))]);
        assert_eq!(picked, LocalAddress::Unavailable);
        assert!(picked.to_string().contains("WiFi"));
    }
}
