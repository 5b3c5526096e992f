//! Local host and LAN interface lookup.

pub mod model;
pub mod net;

pub use model::InterfaceIp;
pub use net::{list_interface_ips_result, local_hostname, primary_lan_ip};
