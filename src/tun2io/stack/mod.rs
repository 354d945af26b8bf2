//! Collaborator surface of the user-space network stack.
//!
//! The gateway terminates flows inside a stack that provides non-blocking
//! endpoints, readiness notifiers, a transport demultiplexer and packet
//! re-delivery. This module defines that surface; `smol` implements it on
//! smoltcp over a packet link.

pub mod device;
pub mod smol;

#[cfg(test)]
pub mod harness;

use std::sync::Arc;

use bytes::Bytes;
use ipnet::IpNet;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;

use crate::tun2io::id::{FullAddr, ListenerId, Protocol, TransportId};

/// Errors surfaced by stack endpoints.
///
/// `WouldBlock` is the only retryable variant; callers suspend on the
/// endpoint's wait queue and retry.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("operation would block")]
    WouldBlock,
    #[error("endpoint is closed for send")]
    ClosedForSend,
    #[error("endpoint is closed for receive")]
    ClosedForReceive,
    #[error("endpoint is in invalid state")]
    InvalidState,
    #[error("endpoint already bound")]
    AlreadyBound,
    #[error("endpoint not connected")]
    NotConnected,
    #[error("port is in use")]
    PortInUse,
    #[error("operation not supported")]
    NotSupported,
}

/// Readiness notifier pair published by an endpoint.
///
/// Readable fires when data (or a pending connection, or an EOF) is
/// available; writable fires when buffer space frees up. Notifications are
/// edge-ish: a permit is stored if nobody is waiting, so a transition is
/// never lost between a non-blocking call and the subsequent wait.
#[derive(Clone, Default)]
pub struct WaitQueue {
    readable: Arc<Notify>,
    writable: Arc<Notify>,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn readable(&self) {
        self.readable.notified().await;
    }

    pub async fn writable(&self) {
        self.writable.notified().await;
    }

    pub fn notify_readable(&self) {
        self.readable.notify_one();
    }

    pub fn notify_writable(&self) {
        self.writable.notify_one();
    }
}

impl std::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitQueue").finish_non_exhaustive()
    }
}

/// One UDP datagram together with the peer it came from or goes to.
#[derive(Debug, Clone)]
pub struct UdpDatagram {
    pub peer: FullAddr,
    pub data: Bytes,
}

/// A socket-like object terminated inside the stack.
///
/// All operations are non-blocking; `WouldBlock` pairs with the endpoint's
/// `WaitQueue`. Operations that don't apply to the endpoint's protocol or
/// state return `NotSupported`/`InvalidState`.
pub trait Endpoint: Send + Sync {
    /// Read a chunk from a connected endpoint.
    fn read(&self) -> Result<Bytes, StackError>;
    /// Write to a connected endpoint; may accept a prefix.
    fn write(&self, data: &[u8]) -> Result<usize, StackError>;
    /// Receive one datagram on a bound, unconnected UDP endpoint.
    fn recv_from(&self) -> Result<UdpDatagram, StackError>;
    /// Send one datagram from a bound UDP endpoint.
    fn send_to(&self, data: &[u8], peer: FullAddr) -> Result<usize, StackError>;
    fn bind(&self, local: FullAddr) -> Result<(), StackError>;
    fn listen(&self, backlog: usize) -> Result<(), StackError>;
    /// Accept one synthesized inbound connection; the returned wait queue is
    /// owned by the new endpoint.
    fn accept(&self) -> Result<(Arc<dyn Endpoint>, WaitQueue), StackError>;
    fn connect(&self, peer: FullAddr) -> Result<(), StackError>;
    /// Idempotent.
    fn close(&self);
    fn local_addr(&self) -> Option<FullAddr>;
    fn remote_addr(&self) -> Option<FullAddr>;
}

/// A transport-layer packet handed to a registered handler before the stack
/// applies its default processing.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub proto: Protocol,
    pub id: TransportId,
    /// The raw IP frame, suitable for re-delivery.
    pub frame: Bytes,
}

/// Returns true when the handler took responsibility for the packet
/// (typically after provisioning an endpoint and re-delivering the frame).
pub type TransportHandler = Arc<dyn Fn(&InboundPacket) -> bool + Send + Sync>;

/// Per-stack transport statistics, printed with the periodic census.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StackStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub dropped_packets: u64,
    pub tcp_sockets: usize,
    pub udp_endpoints: usize,
}

/// The stack as seen by the flow-mediation engine.
pub trait Stack: Send + Sync {
    fn new_endpoint(&self, proto: Protocol) -> Result<(Arc<dyn Endpoint>, WaitQueue), StackError>;
    /// Demultiplexer query: is there an endpoint owning this flow id?
    fn has_endpoint(&self, proto: Protocol, id: &TransportId) -> bool;
    /// Demultiplexer query for the passive form of a flow id.
    fn has_listener(&self, id: &ListenerId) -> bool;
    /// Re-inject a frame at the NIC so it can drive newly provisioned
    /// endpoints.
    fn redeliver(&self, pkt: &InboundPacket);
    /// Subnets configured on the gateway's NIC.
    fn subnets(&self) -> Vec<IpNet>;
    fn set_transport_handler(&self, proto: Protocol, handler: TransportHandler);
    fn stats(&self) -> StackStats;
}
