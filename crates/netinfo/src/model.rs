use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceIp {
    pub name: String,
    pub ip: IpAddr,
    pub family: &'static str, //ipv4 or ipv6
    pub is_loopback: bool,
}

impl InterfaceIp {
    /// Addresses a LAN peer could actually reach us on.
    pub fn is_lan_candidate(&self) -> bool {
        if self.is_loopback {
            return false;
        }
        match self.ip {
            IpAddr::V4(v4) => !v4.is_link_local() && !v4.is_unspecified(),
            IpAddr::V6(_) => false,
        }
    }
}
