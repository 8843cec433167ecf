use get_if_addrs::get_if_addrs;
use std::net::{IpAddr, Ipv4Addr};

/// Lists the non-loopback IPv4 addresses of the local interfaces.
///
/// GDM sockets join the multicast group once per address returned here, the
/// same way the SSDP client does for UPnP. Interfaces that cannot be listed
/// yield an empty vector; the caller then falls back to `0.0.0.0`.
///
/// ```
/// let addrs = pkcutils::ipv4_interfaces();
/// assert!(addrs.iter().all(|ip| !ip.is_loopback()));
/// ```
pub fn ipv4_interfaces() -> Vec<Ipv4Addr> {
    let mut result = Vec::new();

    if let Ok(interfaces) = get_if_addrs() {
        for iface in interfaces {
            if let IpAddr::V4(ip) = iface.ip() {
                if ip.is_loopback() || result.contains(&ip) {
                    continue;
                }
                result.push(ip);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ipv4_interfaces_no_loopback() {
        for ip in ipv4_interfaces() {
            assert!(!ip.is_loopback(), "Loopback addresses should be filtered out");
        }
    }

    #[test]
    fn test_ipv4_interfaces_no_duplicates() {
        let ips = ipv4_interfaces();
        let unique: HashSet<_> = ips.iter().collect();
        assert_eq!(ips.len(), unique.len());
    }
}
