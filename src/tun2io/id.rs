use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

/// Transport protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A full transport address: network address plus port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FullAddr {
    pub addr: IpAddr,
    pub port: u16,
}

impl FullAddr {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for FullAddr {
    // IPv6 literals need brackets before the port so the output is a valid
    // "host:port" string.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            IpAddr::V4(a) => write!(f, "{}:{}", a, self.port),
            IpAddr::V6(a) => write!(f, "[{}]:{}", a, self.port),
        }
    }
}

/// Names one flow observed at the TUN device.
///
/// `src` is the originating host behind the TUN; `dst` is the destination the
/// flow is addressed to, which is also the address the gateway dials upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TransportId {
    pub proto: Protocol,
    pub src: FullAddr,
    pub dst: FullAddr,
}

impl TransportId {
    pub fn new(proto: Protocol, src: FullAddr, dst: FullAddr) -> Self {
        Self { proto, src, dst }
    }

    /// The passive-endpoint form of this id: the src fields cleared, keyed by
    /// the `(dst, dst_port)` pair a listener would be bound to.
    pub fn listener_id(&self) -> ListenerId {
        ListenerId { dst: self.dst }
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.proto, self.src, self.dst)
    }
}

/// Names a passive TCP endpoint awaiting synthesized inbound connections for
/// one local target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ListenerId {
    pub dst: FullAddr,
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp *:* -> {}", self.dst)
    }
}
