use std::net::IpAddr;

use ipnet::IpNet;

use crate::tun2io::id::FullAddr;

/// Format a dial target for a flow destination.
///
/// Equivalent to `FullAddr`'s `Display`, kept as a named helper so call sites
/// read as "this is the upstream address string".
pub fn host_port(addr: FullAddr) -> String {
    addr.to_string()
}

/// Whether `addr` falls inside any of the given subnets.
pub fn in_subnets(addr: IpAddr, subnets: &[IpNet]) -> bool {
    subnets.iter().any(|n| n.contains(&addr))
}
