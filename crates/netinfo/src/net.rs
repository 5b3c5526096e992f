use anyhow::Result;
use std::io::Error;
use std::net::IpAddr;

use crate::model::InterfaceIp;

pub fn list_interface_ips_result() -> Result<Vec<InterfaceIp>, Error> {
    let ifs = if_addrs::get_if_addrs()?;

    let mut out: Vec<InterfaceIp> = ifs
        .into_iter()
        .map(|ifa| {
            let ip = ifa.ip();
            let family = if ip.is_ipv4() { "ipv4" } else { "ipv6" };
            let is_loopback = ip.is_loopback();

            InterfaceIp {
                name: ifa.name,
                ip,
                family,
                is_loopback,
            }
        })
        .collect();

    out.sort_by(|a, b| (&a.name, &a.ip).cmp(&(&b.name, &b.ip)));
    out.dedup_by(|a, b| a.name == b.name && a.ip == b.ip);
    Ok(out)
}

/// The address to put in our certificate and hand to peers.
///
/// When `interface` is given only that interface is considered.
pub fn primary_lan_ip(interface: Option<&str>) -> Result<IpAddr> {
    let ips = list_interface_ips_result()?;
    pick_lan_ip(&ips, interface).ok_or_else(|| match interface {
        Some(name) => anyhow::anyhow!("No usable IPv4 address on interface {}", name),
        None => anyhow::anyhow!("No usable LAN IPv4 address found"),
    })
}

pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn pick_lan_ip(ips: &[InterfaceIp], interface: Option<&str>) -> Option<IpAddr> {
    ips.iter()
        .filter(|item| interface.map_or(true, |name| item.name == name))
        .find(|item| item.is_lan_candidate())
        .map(|item| item.ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, ip: &str) -> InterfaceIp {
        let ip: IpAddr = ip.parse().unwrap();
        InterfaceIp {
            name: name.to_string(),
            ip,
            family: if ip.is_ipv4() { "ipv4" } else { "ipv6" },
            is_loopback: ip.is_loopback(),
        }
    }

    #[test]
    fn test_pick_skips_loopback_and_link_local() {
        let ips = vec![
            iface("eth0", "169.254.10.2"),
            iface("eth0", "fe80::1"),
            iface("lo", "127.0.0.1"),
            iface("wlan0", "192.168.1.40"),
        ];
        assert_eq!(pick_lan_ip(&ips, None), Some("192.168.1.40".parse().unwrap()));
    }

    #[test]
    fn test_pick_respects_interface() {
        let ips = vec![iface("eth0", "10.0.0.2"), iface("wlan0", "192.168.1.40")];
        assert_eq!(pick_lan_ip(&ips, Some("wlan0")), Some("192.168.1.40".parse().unwrap()));
        assert_eq!(pick_lan_ip(&ips, Some("eth9")), None);
    }
}
