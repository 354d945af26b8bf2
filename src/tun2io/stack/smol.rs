//! smoltcp-backed implementation of the stack surface.
//!
//! A single driver task owns the interface: it pulls frames off the packet
//! link, classifies them, consults the registered transport handlers for
//! unknown flows, polls smoltcp, and pushes produced frames back to the link.
//! TCP flows terminate in smoltcp sockets (one listening child socket per
//! observed SYN, bounded by the listener backlog). UDP flows are
//! demultiplexed and framed here at the wire level, which gives each flow
//! connected-endpoint semantics that a single shared UDP socket cannot.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use ipnet::IpNet;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{self, ChecksumCapabilities, DeviceCapabilities, Medium};
use smoltcp::socket::tcp;
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpListenEndpoint, IpProtocol, IpVersion, Ipv4Address,
    Ipv4Packet, Ipv4Repr, Ipv6Address, Ipv6Packet, Ipv6Repr, TcpPacket, UdpPacket, UdpRepr,
};
use tokio::sync::{Notify, watch};

use crate::tun2io::id::{FullAddr, ListenerId, Protocol, TransportId};
use crate::tun2io::stack::device::PacketLink;
use crate::tun2io::stack::{
    Endpoint, InboundPacket, Stack, StackError, StackStats, TransportHandler, UdpDatagram,
    WaitQueue,
};

const DEFAULT_MTU: usize = 1500;
const TCP_BUFFER_BYTES: usize = 64 * 1024;
const UDP_RX_BACKLOG: usize = 128;
const UDP_TX_BACKLOG: usize = 256;
const UDP_TTL: u8 = 64;

pub struct SmolStack {
    shared: Arc<Shared>,
    subnets: Vec<IpNet>,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Notify,
    handlers: Mutex<Handlers>,
}

#[derive(Default)]
struct Handlers {
    tcp: Option<TransportHandler>,
    udp: Option<TransportHandler>,
}

impl Shared {
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct Inner {
    iface: Interface,
    sockets: SocketSet<'static>,
    device: QueueDevice,
    conns: HashMap<TransportId, TcpConn>,
    listeners: HashMap<ListenerId, ListenerState>,
    udp: HashMap<u64, UdpEp>,
    udp_by_conn: HashMap<TransportId, u64>,
    udp_by_bind: HashMap<FullAddr, u64>,
    udp_tx: VecDeque<UdpOut>,
    next_udp_token: u64,
    stats: StackStats,
}

struct TcpConn {
    handle: SocketHandle,
    wq: WaitQueue,
    lid: ListenerId,
    established: bool,
    accepted: bool,
    closing: bool,
}

struct ListenerState {
    wq: WaitQueue,
    backlog: usize,
    pending: VecDeque<TransportId>,
}

struct UdpEp {
    local: Option<FullAddr>,
    peer: Option<FullAddr>,
    rx: VecDeque<UdpDatagram>,
    wq: WaitQueue,
}

struct UdpOut {
    src: FullAddr,
    dst: FullAddr,
    data: Bytes,
}

impl SmolStack {
    pub fn new(local: IpAddr, subnet: IpNet, mtu: usize) -> anyhow::Result<Arc<Self>> {
        let mut device = QueueDevice::new(if mtu == 0 { DEFAULT_MTU } else { mtu });

        let mut cfg = Config::new(HardwareAddress::Ip);
        cfg.random_seed = rand::random();
        let mut iface = Interface::new(cfg, &mut device, SmolInstant::now());

        // Terminate flows addressed to any destination; the TUN routes the
        // whole default route at us.
        iface.set_any_ip(true);
        iface.update_ip_addrs(|addrs| {
            let _ = addrs.push(IpCidr::new(to_smol_ip(local), subnet.prefix_len()));
        });
        match local {
            IpAddr::V4(a) => {
                iface
                    .routes_mut()
                    .add_default_ipv4_route(Ipv4Address(a.octets()))
                    .map_err(|_| anyhow::anyhow!("stack: route table full"))?;
            }
            IpAddr::V6(a) => {
                iface
                    .routes_mut()
                    .add_default_ipv6_route(Ipv6Address(a.octets()))
                    .map_err(|_| anyhow::anyhow!("stack: route table full"))?;
            }
        }

        let host = IpNet::new(local, if local.is_ipv4() { 32 } else { 128 })
            .context("stack: host subnet")?;

        Ok(Arc::new(Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    iface,
                    sockets: SocketSet::new(vec![]),
                    device,
                    conns: HashMap::new(),
                    listeners: HashMap::new(),
                    udp: HashMap::new(),
                    udp_by_conn: HashMap::new(),
                    udp_by_bind: HashMap::new(),
                    udp_tx: VecDeque::new(),
                    next_udp_token: 1,
                    stats: StackStats::default(),
                }),
                wake: Notify::new(),
                handlers: Mutex::new(Handlers::default()),
            }),
            subnets: vec![subnet, host],
        }))
    }

    /// Drive the interface until shutdown. Owns all smoltcp polling.
    pub async fn run<L: PacketLink>(
        self: Arc<Self>,
        link: L,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mtu = self.shared.lock_inner().device.mtu;
        let mut buf = vec![0u8; mtu.max(DEFAULT_MTU)];
        tracing::debug!("stack: driver started");

        loop {
            let delay = {
                let mut guard = self.shared.lock_inner();
                let inner = &mut *guard;
                let ts = SmolInstant::now();
                inner
                    .iface
                    .poll_delay(ts, &inner.sockets)
                    .map(Duration::from)
            };

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = link.recv(&mut buf) => {
                    match res {
                        Ok(0) => {}
                        Ok(n) => self.ingest(Bytes::copy_from_slice(&buf[..n])),
                        Err(err) => return Err(err).context("stack: link receive"),
                    }
                }
                _ = self.shared.wake.notified() => {}
                _ = idle(delay) => {}
            }

            let frames = self.shared.lock_inner().pump();
            for f in &frames {
                link.send(f).await.context("stack: link send")?;
            }
        }

        tracing::debug!("stack: driver stopped");
        Ok(())
    }

    fn ingest(&self, frame: Bytes) {
        {
            let mut inner = self.shared.lock_inner();
            inner.stats.rx_packets += 1;
            inner.stats.rx_bytes += frame.len() as u64;
        }

        let Some(id) = classify(&frame) else {
            // Not TCP/UDP; hand it to the stack unfiltered.
            self.shared.lock_inner().device.rx.push_back(frame.to_vec());
            return;
        };

        let known = {
            let inner = self.shared.lock_inner();
            match id.proto {
                Protocol::Tcp => {
                    inner.conns.contains_key(&id)
                        || inner.listeners.contains_key(&id.listener_id())
                }
                Protocol::Udp => {
                    inner.udp_by_conn.contains_key(&id)
                        || inner.udp_by_bind.contains_key(&id.dst)
                }
            }
        };

        if !known {
            let handler = {
                let handlers = self
                    .shared
                    .handlers
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                match id.proto {
                    Protocol::Tcp => handlers.tcp.clone(),
                    Protocol::Udp => handlers.udp.clone(),
                }
            };
            if let Some(handler) = handler {
                let pkt = InboundPacket {
                    proto: id.proto,
                    id,
                    frame: frame.clone(),
                };
                if handler(&pkt) {
                    return;
                }
            }
        }

        self.shared.lock_inner().admit(&id, &frame);
    }
}

async fn idle(delay: Option<Duration>) {
    match delay {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}

impl Stack for SmolStack {
    fn new_endpoint(
        &self,
        proto: Protocol,
    ) -> Result<(Arc<dyn Endpoint>, WaitQueue), StackError> {
        let wq = WaitQueue::new();
        match proto {
            Protocol::Tcp => {
                let ep = Arc::new(TcpEndpointHandle {
                    shared: self.shared.clone(),
                    wq: wq.clone(),
                    role: Mutex::new(TcpRole::Fresh { local: None }),
                    closed: AtomicBool::new(false),
                });
                Ok((ep, wq))
            }
            Protocol::Udp => {
                let token = {
                    let mut inner = self.shared.lock_inner();
                    let token = inner.next_udp_token;
                    inner.next_udp_token += 1;
                    inner.udp.insert(
                        token,
                        UdpEp {
                            local: None,
                            peer: None,
                            rx: VecDeque::new(),
                            wq: wq.clone(),
                        },
                    );
                    token
                };
                let ep = Arc::new(UdpEndpointHandle {
                    shared: self.shared.clone(),
                    wq: wq.clone(),
                    token,
                    closed: AtomicBool::new(false),
                });
                Ok((ep, wq))
            }
        }
    }

    fn has_endpoint(&self, proto: Protocol, id: &TransportId) -> bool {
        let inner = self.shared.lock_inner();
        match proto {
            Protocol::Tcp => inner.conns.contains_key(id),
            Protocol::Udp => {
                inner.udp_by_conn.contains_key(id) || inner.udp_by_bind.contains_key(&id.dst)
            }
        }
    }

    fn has_listener(&self, id: &ListenerId) -> bool {
        self.shared.lock_inner().listeners.contains_key(id)
    }

    fn redeliver(&self, pkt: &InboundPacket) {
        self.shared.lock_inner().admit(&pkt.id, &pkt.frame);
        self.shared.wake.notify_one();
    }

    fn subnets(&self) -> Vec<IpNet> {
        self.subnets.clone()
    }

    fn set_transport_handler(&self, proto: Protocol, handler: TransportHandler) {
        let mut handlers = self
            .shared
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match proto {
            Protocol::Tcp => handlers.tcp = Some(handler),
            Protocol::Udp => handlers.udp = Some(handler),
        }
    }

    fn stats(&self) -> StackStats {
        let mut guard = self.shared.lock_inner();
        let inner = &mut *guard;
        inner.stats.tcp_sockets = inner.conns.len();
        inner.stats.udp_endpoints = inner.udp.len();
        inner.stats
    }
}

impl Inner {
    /// Enqueue one classified frame, provisioning a backlog child socket for
    /// SYNs addressed to a registered listener.
    fn admit(&mut self, id: &TransportId, frame: &Bytes) {
        match id.proto {
            Protocol::Tcp => {
                if !self.conns.contains_key(id) {
                    let lid = id.listener_id();
                    let spawn = match self.listeners.get(&lid) {
                        Some(ls) => {
                            is_syn(frame) && self.handshaking(&lid) + ls.pending.len() < ls.backlog
                        }
                        None => false,
                    };
                    if spawn {
                        let mut s = tcp::Socket::new(
                            tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_BYTES]),
                            tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_BYTES]),
                        );
                        let listen_to = IpListenEndpoint {
                            addr: Some(to_smol_ip(id.dst.addr)),
                            port: id.dst.port,
                        };
                        if s.listen(listen_to).is_ok() {
                            let handle = self.sockets.add(s);
                            self.conns.insert(
                                *id,
                                TcpConn {
                                    handle,
                                    wq: WaitQueue::new(),
                                    lid,
                                    established: false,
                                    accepted: false,
                                    closing: false,
                                },
                            );
                        }
                    }
                }
                self.device.rx.push_back(frame.to_vec());
            }
            Protocol::Udp => {
                let Some(payload) = udp_payload(frame) else {
                    self.stats.dropped_packets += 1;
                    return;
                };
                let token = self
                    .udp_by_conn
                    .get(id)
                    .copied()
                    .or_else(|| self.udp_by_bind.get(&id.dst).copied());
                match token.and_then(|t| self.udp.get_mut(&t)) {
                    Some(ep) if ep.rx.len() < UDP_RX_BACKLOG => {
                        ep.rx.push_back(UdpDatagram {
                            peer: id.src,
                            data: payload,
                        });
                        ep.wq.notify_readable();
                    }
                    _ => self.stats.dropped_packets += 1,
                }
            }
        }
    }

    fn handshaking(&self, lid: &ListenerId) -> usize {
        self.conns
            .values()
            .filter(|c| c.lid == *lid && !c.established)
            .count()
    }

    /// Poll smoltcp, sweep socket readiness into wait-queue notifications,
    /// and collect frames to push onto the link.
    fn pump(&mut self) -> Vec<Vec<u8>> {
        let ts = SmolInstant::now();
        let _ = self.iface.poll(ts, &mut self.device, &mut self.sockets);

        let mut finished: Vec<TransportId> = Vec::new();
        let mut established: Vec<(ListenerId, TransportId)> = Vec::new();

        for (id, conn) in self.conns.iter_mut() {
            let s = self.sockets.get_mut::<tcp::Socket>(conn.handle);
            if !conn.established {
                match s.state() {
                    tcp::State::Established => {
                        conn.established = true;
                        established.push((conn.lid, *id));
                    }
                    tcp::State::Closed => finished.push(*id),
                    _ => {}
                }
            } else {
                if s.can_recv() || !s.may_recv() {
                    conn.wq.notify_readable();
                }
                if s.can_send() {
                    conn.wq.notify_writable();
                }
                if conn.closing && s.state() == tcp::State::Closed {
                    finished.push(*id);
                }
            }
        }

        for (lid, id) in established {
            match self.listeners.get_mut(&lid) {
                Some(ls) => {
                    ls.pending.push_back(id);
                    ls.wq.notify_readable();
                }
                None => {
                    // Listener collected while the handshake completed.
                    if let Some(conn) = self.conns.get_mut(&id) {
                        self.sockets.get_mut::<tcp::Socket>(conn.handle).abort();
                        conn.closing = true;
                    }
                }
            }
        }

        for id in finished {
            if let Some(conn) = self.conns.remove(&id) {
                self.sockets.remove(conn.handle);
            }
        }

        let mut frames: Vec<Vec<u8>> = Vec::new();
        let drained = !self.udp_tx.is_empty();
        while let Some(out) = self.udp_tx.pop_front() {
            match build_udp_frame(&out) {
                Some(f) => frames.push(f),
                None => self.stats.dropped_packets += 1,
            }
        }
        if drained {
            for ep in self.udp.values() {
                ep.wq.notify_writable();
            }
        }

        frames.extend(self.device.tx.drain(..));
        self.stats.tx_packets += frames.len() as u64;
        self.stats.tx_bytes += frames.iter().map(|f| f.len() as u64).sum::<u64>();
        frames
    }
}

enum TcpRole {
    Fresh { local: Option<FullAddr> },
    Listener(ListenerId),
}

/// A fresh or listening TCP endpoint.
struct TcpEndpointHandle {
    shared: Arc<Shared>,
    wq: WaitQueue,
    role: Mutex<TcpRole>,
    closed: AtomicBool,
}

impl TcpEndpointHandle {
    fn lock_role(&self) -> MutexGuard<'_, TcpRole> {
        self.role.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Endpoint for TcpEndpointHandle {
    fn read(&self) -> Result<Bytes, StackError> {
        Err(StackError::InvalidState)
    }

    fn write(&self, _data: &[u8]) -> Result<usize, StackError> {
        Err(StackError::InvalidState)
    }

    fn recv_from(&self) -> Result<UdpDatagram, StackError> {
        Err(StackError::NotSupported)
    }

    fn send_to(&self, _data: &[u8], _peer: FullAddr) -> Result<usize, StackError> {
        Err(StackError::NotSupported)
    }

    fn bind(&self, local: FullAddr) -> Result<(), StackError> {
        let mut role = self.lock_role();
        match &mut *role {
            TcpRole::Fresh { local: slot } => {
                if slot.is_some() {
                    return Err(StackError::AlreadyBound);
                }
                *slot = Some(local);
                Ok(())
            }
            TcpRole::Listener(_) => Err(StackError::AlreadyBound),
        }
    }

    fn listen(&self, backlog: usize) -> Result<(), StackError> {
        let mut role = self.lock_role();
        let local = match &*role {
            TcpRole::Fresh { local: Some(l) } => *l,
            TcpRole::Fresh { local: None } => return Err(StackError::InvalidState),
            TcpRole::Listener(_) => return Err(StackError::InvalidState),
        };
        let lid = ListenerId { dst: local };
        {
            let mut inner = self.shared.lock_inner();
            if inner.listeners.contains_key(&lid) {
                return Err(StackError::PortInUse);
            }
            inner.listeners.insert(
                lid,
                ListenerState {
                    wq: self.wq.clone(),
                    backlog: backlog.max(1),
                    pending: VecDeque::new(),
                },
            );
        }
        *role = TcpRole::Listener(lid);
        Ok(())
    }

    fn accept(&self) -> Result<(Arc<dyn Endpoint>, WaitQueue), StackError> {
        let lid = match &*self.lock_role() {
            TcpRole::Listener(lid) => *lid,
            _ => return Err(StackError::InvalidState),
        };
        let mut inner = self.shared.lock_inner();
        loop {
            let id = {
                let Some(ls) = inner.listeners.get_mut(&lid) else {
                    return Err(StackError::InvalidState);
                };
                match ls.pending.pop_front() {
                    Some(id) => id,
                    None => return Err(StackError::WouldBlock),
                }
            };
            let Some(conn) = inner.conns.get_mut(&id) else {
                continue;
            };
            conn.accepted = true;
            let wq = conn.wq.clone();
            let ep = Arc::new(ConnEndpointHandle {
                shared: self.shared.clone(),
                id,
                wq: wq.clone(),
                closed: AtomicBool::new(false),
            });
            return Ok((ep, wq));
        }
    }

    fn connect(&self, _peer: FullAddr) -> Result<(), StackError> {
        Err(StackError::NotSupported)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let role = self.lock_role();
        if let TcpRole::Listener(lid) = &*role {
            let mut guard = self.shared.lock_inner();
            let inner = &mut *guard;
            if inner.listeners.remove(lid).is_some() {
                let orphaned: Vec<TransportId> = inner
                    .conns
                    .iter()
                    .filter(|(_, c)| c.lid == *lid && !c.accepted)
                    .map(|(id, _)| *id)
                    .collect();
                for id in orphaned {
                    if let Some(conn) = inner.conns.get_mut(&id) {
                        inner.sockets.get_mut::<tcp::Socket>(conn.handle).abort();
                        conn.closing = true;
                    }
                }
            }
        }
        drop(role);
        self.wq.notify_readable();
        self.shared.wake.notify_one();
    }

    fn local_addr(&self) -> Option<FullAddr> {
        match &*self.lock_role() {
            TcpRole::Fresh { local } => *local,
            TcpRole::Listener(lid) => Some(lid.dst),
        }
    }

    fn remote_addr(&self) -> Option<FullAddr> {
        None
    }
}

/// An accepted, connected TCP endpoint.
struct ConnEndpointHandle {
    shared: Arc<Shared>,
    id: TransportId,
    wq: WaitQueue,
    closed: AtomicBool,
}

impl Endpoint for ConnEndpointHandle {
    fn read(&self) -> Result<Bytes, StackError> {
        let res = {
            let mut inner = self.shared.lock_inner();
            let Some(conn) = inner.conns.get(&self.id) else {
                return Err(StackError::ClosedForReceive);
            };
            let handle = conn.handle;
            let s = inner.sockets.get_mut::<tcp::Socket>(handle);
            if s.can_recv() {
                s.recv(|buf| {
                    let n = buf.len();
                    (n, Bytes::copy_from_slice(buf))
                })
                .map_err(|_| StackError::ClosedForReceive)
            } else if !s.may_recv() {
                Err(StackError::ClosedForReceive)
            } else {
                Err(StackError::WouldBlock)
            }
        };
        if res.is_ok() {
            // Reading frees receive-window space worth advertising.
            self.shared.wake.notify_one();
        }
        res
    }

    fn write(&self, data: &[u8]) -> Result<usize, StackError> {
        let res = {
            let mut inner = self.shared.lock_inner();
            let Some(conn) = inner.conns.get(&self.id) else {
                return Err(StackError::ClosedForSend);
            };
            let handle = conn.handle;
            let s = inner.sockets.get_mut::<tcp::Socket>(handle);
            if !s.may_send() {
                Err(StackError::ClosedForSend)
            } else if !s.can_send() {
                Err(StackError::WouldBlock)
            } else {
                match s.send_slice(data) {
                    Ok(0) => Err(StackError::WouldBlock),
                    Ok(n) => Ok(n),
                    Err(_) => Err(StackError::ClosedForSend),
                }
            }
        };
        if res.is_ok() {
            self.shared.wake.notify_one();
        }
        res
    }

    fn recv_from(&self) -> Result<UdpDatagram, StackError> {
        Err(StackError::NotSupported)
    }

    fn send_to(&self, _data: &[u8], _peer: FullAddr) -> Result<usize, StackError> {
        Err(StackError::NotSupported)
    }

    fn bind(&self, _local: FullAddr) -> Result<(), StackError> {
        Err(StackError::AlreadyBound)
    }

    fn listen(&self, _backlog: usize) -> Result<(), StackError> {
        Err(StackError::InvalidState)
    }

    fn accept(&self) -> Result<(Arc<dyn Endpoint>, WaitQueue), StackError> {
        Err(StackError::InvalidState)
    }

    fn connect(&self, _peer: FullAddr) -> Result<(), StackError> {
        Err(StackError::NotSupported)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.shared.lock_inner();
        if let Some(conn) = inner.conns.get_mut(&self.id) {
            conn.closing = true;
            let handle = conn.handle;
            inner.sockets.get_mut::<tcp::Socket>(handle).close();
        }
        drop(inner);
        self.shared.wake.notify_one();
    }

    fn local_addr(&self) -> Option<FullAddr> {
        Some(self.id.dst)
    }

    fn remote_addr(&self) -> Option<FullAddr> {
        Some(self.id.src)
    }
}

/// A UDP endpoint; bound-only for servers, bound+connected for flows.
struct UdpEndpointHandle {
    shared: Arc<Shared>,
    wq: WaitQueue,
    token: u64,
    closed: AtomicBool,
}

impl UdpEndpointHandle {
    fn enqueue(&self, inner: &mut Inner, src: FullAddr, dst: FullAddr, data: &[u8]) -> Result<usize, StackError> {
        if inner.udp_tx.len() >= UDP_TX_BACKLOG {
            return Err(StackError::WouldBlock);
        }
        inner.udp_tx.push_back(UdpOut {
            src,
            dst,
            data: Bytes::copy_from_slice(data),
        });
        Ok(data.len())
    }
}

impl Endpoint for UdpEndpointHandle {
    fn read(&self) -> Result<Bytes, StackError> {
        let mut inner = self.shared.lock_inner();
        let Some(ep) = inner.udp.get_mut(&self.token) else {
            return Err(StackError::ClosedForReceive);
        };
        if ep.peer.is_none() {
            return Err(StackError::NotConnected);
        }
        match ep.rx.pop_front() {
            Some(d) => Ok(d.data),
            None => Err(StackError::WouldBlock),
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize, StackError> {
        let mut inner = self.shared.lock_inner();
        let Some(ep) = inner.udp.get(&self.token) else {
            return Err(StackError::ClosedForSend);
        };
        let (Some(local), Some(peer)) = (ep.local, ep.peer) else {
            return Err(StackError::NotConnected);
        };
        let n = self.enqueue(&mut inner, local, peer, data)?;
        drop(inner);
        self.shared.wake.notify_one();
        Ok(n)
    }

    fn recv_from(&self) -> Result<UdpDatagram, StackError> {
        let mut inner = self.shared.lock_inner();
        let Some(ep) = inner.udp.get_mut(&self.token) else {
            return Err(StackError::ClosedForReceive);
        };
        match ep.rx.pop_front() {
            Some(d) => Ok(d),
            None => Err(StackError::WouldBlock),
        }
    }

    fn send_to(&self, data: &[u8], peer: FullAddr) -> Result<usize, StackError> {
        let mut inner = self.shared.lock_inner();
        let Some(ep) = inner.udp.get(&self.token) else {
            return Err(StackError::ClosedForSend);
        };
        let Some(local) = ep.local else {
            return Err(StackError::InvalidState);
        };
        let n = self.enqueue(&mut inner, local, peer, data)?;
        drop(inner);
        self.shared.wake.notify_one();
        Ok(n)
    }

    fn bind(&self, local: FullAddr) -> Result<(), StackError> {
        let mut inner = self.shared.lock_inner();
        if inner.udp_by_bind.contains_key(&local) {
            return Err(StackError::PortInUse);
        }
        let Some(ep) = inner.udp.get_mut(&self.token) else {
            return Err(StackError::InvalidState);
        };
        if ep.local.is_some() {
            return Err(StackError::AlreadyBound);
        }
        ep.local = Some(local);
        inner.udp_by_bind.insert(local, self.token);
        Ok(())
    }

    fn listen(&self, _backlog: usize) -> Result<(), StackError> {
        Err(StackError::NotSupported)
    }

    fn accept(&self) -> Result<(Arc<dyn Endpoint>, WaitQueue), StackError> {
        Err(StackError::NotSupported)
    }

    fn connect(&self, peer: FullAddr) -> Result<(), StackError> {
        let mut inner = self.shared.lock_inner();
        let Some(ep) = inner.udp.get_mut(&self.token) else {
            return Err(StackError::InvalidState);
        };
        let Some(local) = ep.local else {
            return Err(StackError::InvalidState);
        };
        if ep.peer.is_some() {
            return Err(StackError::InvalidState);
        }
        ep.peer = Some(peer);
        let id = TransportId::new(Protocol::Udp, peer, local);
        inner.udp_by_bind.remove(&local);
        inner.udp_by_conn.insert(id, self.token);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.shared.lock_inner();
        if let Some(ep) = inner.udp.remove(&self.token) {
            if let Some(local) = ep.local {
                match ep.peer {
                    Some(peer) => {
                        inner
                            .udp_by_conn
                            .remove(&TransportId::new(Protocol::Udp, peer, local));
                    }
                    None => {
                        inner.udp_by_bind.remove(&local);
                    }
                }
            }
            ep.wq.notify_readable();
        }
    }

    fn local_addr(&self) -> Option<FullAddr> {
        self.shared
            .lock_inner()
            .udp
            .get(&self.token)
            .and_then(|ep| ep.local)
    }

    fn remote_addr(&self) -> Option<FullAddr> {
        self.shared
            .lock_inner()
            .udp
            .get(&self.token)
            .and_then(|ep| ep.peer)
    }
}

/// In-process packet queues implementing smoltcp's device model.
struct QueueDevice {
    rx: VecDeque<Vec<u8>>,
    tx: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl QueueDevice {
    fn new(mtu: usize) -> Self {
        Self {
            rx: VecDeque::new(),
            tx: VecDeque::new(),
            mtu,
        }
    }
}

impl phy::Device for QueueDevice {
    type RxToken<'a>
        = RxToken
    where
        Self: 'a;
    type TxToken<'a>
        = TxToken<'a>
    where
        Self: 'a;

    fn receive(&mut self, _ts: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((RxToken(frame), TxToken { queue: &mut self.tx }))
    }

    fn transmit(&mut self, _ts: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(TxToken {
            queue: &mut self.tx,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

struct RxToken(Vec<u8>);

impl phy::RxToken for RxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.0)
    }
}

struct TxToken<'a> {
    queue: &'a mut VecDeque<Vec<u8>>,
}

impl phy::TxToken for TxToken<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let r = f(&mut frame);
        self.queue.push_back(frame);
        r
    }
}

fn to_smol_ip(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(a) => IpAddress::Ipv4(Ipv4Address(a.octets())),
        IpAddr::V6(a) => IpAddress::Ipv6(Ipv6Address(a.octets())),
    }
}

/// Extract the transport 5-tuple of a raw IP frame. `None` for anything that
/// is not a well-formed TCP or UDP packet.
fn classify(frame: &[u8]) -> Option<TransportId> {
    let (src, dst, proto, payload) = match IpVersion::of_packet(frame).ok()? {
        IpVersion::Ipv4 => {
            let pkt = Ipv4Packet::new_checked(frame).ok()?;
            (
                IpAddr::V4(pkt.src_addr().0.into()),
                IpAddr::V4(pkt.dst_addr().0.into()),
                pkt.next_header(),
                pkt.payload(),
            )
        }
        IpVersion::Ipv6 => {
            let pkt = Ipv6Packet::new_checked(frame).ok()?;
            (
                IpAddr::V6(pkt.src_addr().0.into()),
                IpAddr::V6(pkt.dst_addr().0.into()),
                pkt.next_header(),
                pkt.payload(),
            )
        }
    };
    match proto {
        IpProtocol::Tcp => {
            let t = TcpPacket::new_checked(payload).ok()?;
            Some(TransportId::new(
                Protocol::Tcp,
                FullAddr::new(src, t.src_port()),
                FullAddr::new(dst, t.dst_port()),
            ))
        }
        IpProtocol::Udp => {
            let u = UdpPacket::new_checked(payload).ok()?;
            Some(TransportId::new(
                Protocol::Udp,
                FullAddr::new(src, u.src_port()),
                FullAddr::new(dst, u.dst_port()),
            ))
        }
        _ => None,
    }
}

fn is_syn(frame: &[u8]) -> bool {
    let payload = match IpVersion::of_packet(frame) {
        Ok(IpVersion::Ipv4) => match Ipv4Packet::new_checked(frame) {
            Ok(pkt) => pkt.payload(),
            Err(_) => return false,
        },
        Ok(IpVersion::Ipv6) => match Ipv6Packet::new_checked(frame) {
            Ok(pkt) => pkt.payload(),
            Err(_) => return false,
        },
        Err(_) => return false,
    };
    match TcpPacket::new_checked(payload) {
        Ok(t) => t.syn() && !t.ack(),
        Err(_) => false,
    }
}

fn udp_payload(frame: &[u8]) -> Option<Bytes> {
    let payload = match IpVersion::of_packet(frame).ok()? {
        IpVersion::Ipv4 => Ipv4Packet::new_checked(frame).ok()?.payload(),
        IpVersion::Ipv6 => Ipv6Packet::new_checked(frame).ok()?.payload(),
    };
    let u = UdpPacket::new_checked(payload).ok()?;
    Some(Bytes::copy_from_slice(u.payload()))
}

fn build_udp_frame(out: &UdpOut) -> Option<Vec<u8>> {
    let udp = UdpRepr {
        src_port: out.src.port,
        dst_port: out.dst.port,
    };
    let caps = ChecksumCapabilities::default();
    match (out.src.addr, out.dst.addr) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let src = Ipv4Address(s.octets());
            let dst = Ipv4Address(d.octets());
            let ip = Ipv4Repr {
                src_addr: src,
                dst_addr: dst,
                next_header: IpProtocol::Udp,
                payload_len: udp.header_len() + out.data.len(),
                hop_limit: UDP_TTL,
            };
            let mut buf = vec![0u8; ip.buffer_len() + ip.payload_len];
            let mut ip_pkt = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.emit(&mut ip_pkt, &caps);
            let mut udp_pkt = UdpPacket::new_unchecked(ip_pkt.payload_mut());
            udp.emit(
                &mut udp_pkt,
                &IpAddress::Ipv4(src),
                &IpAddress::Ipv4(dst),
                out.data.len(),
                |b| b.copy_from_slice(&out.data),
                &caps,
            );
            Some(buf)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let src = Ipv6Address(s.octets());
            let dst = Ipv6Address(d.octets());
            let ip = Ipv6Repr {
                src_addr: src,
                dst_addr: dst,
                next_header: IpProtocol::Udp,
                payload_len: udp.header_len() + out.data.len(),
                hop_limit: UDP_TTL,
            };
            let mut buf = vec![0u8; ip.buffer_len() + ip.payload_len];
            let mut ip_pkt = Ipv6Packet::new_unchecked(&mut buf[..]);
            ip.emit(&mut ip_pkt);
            let mut udp_pkt = UdpPacket::new_unchecked(ip_pkt.payload_mut());
            udp.emit(
                &mut udp_pkt,
                &IpAddress::Ipv6(src),
                &IpAddress::Ipv6(dst),
                out.data.len(),
                |b| b.copy_from_slice(&out.data),
                &caps,
            );
            Some(buf)
        }
        _ => None,
    }
}
