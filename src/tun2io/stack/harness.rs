//! Wire-level client harness for driving a stack over the in-memory link:
//! crafts IPv4 TCP/UDP frames, parses replies, and speaks just enough TCP to
//! exercise handshakes, payload exchange and teardown from the TUN side.

use std::net::IpAddr;
use std::time::Duration;

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, TcpControl, TcpPacket, TcpRepr,
    TcpSeqNumber, UdpPacket, UdpRepr,
};

use crate::tun2io::id::FullAddr;
use crate::tun2io::stack::device::{MemLink, PacketLink};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// The far (client) side of an in-memory packet link.
pub struct WirePeer {
    link: MemLink,
}

impl WirePeer {
    pub fn new(link: MemLink) -> Self {
        Self { link }
    }

    pub async fn send(&self, frame: Vec<u8>) {
        PacketLink::send(&self.link, &frame).await.expect("wire send");
    }

    pub async fn recv(&self) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; 4096];
        match tokio::time::timeout(RECV_TIMEOUT, PacketLink::recv(&self.link, &mut buf)).await {
            Ok(Ok(n)) => Some(buf[..n].to_vec()),
            _ => None,
        }
    }
}

fn v4_pair(src: FullAddr, dst: FullAddr) -> (Ipv4Address, Ipv4Address) {
    match (src.addr, dst.addr) {
        (IpAddr::V4(s), IpAddr::V4(d)) => (Ipv4Address(s.octets()), Ipv4Address(d.octets())),
        _ => panic!("harness is ipv4-only"),
    }
}

pub fn udp_frame(src: FullAddr, dst: FullAddr, payload: &[u8]) -> Vec<u8> {
    let (src_addr, dst_addr) = v4_pair(src, dst);
    let caps = ChecksumCapabilities::default();
    let udp = UdpRepr {
        src_port: src.port,
        dst_port: dst.port,
    };
    let ip = Ipv4Repr {
        src_addr,
        dst_addr,
        next_header: IpProtocol::Udp,
        payload_len: udp.header_len() + payload.len(),
        hop_limit: 64,
    };
    let mut buf = vec![0u8; ip.buffer_len() + ip.payload_len];
    let mut ip_pkt = Ipv4Packet::new_unchecked(&mut buf[..]);
    ip.emit(&mut ip_pkt, &caps);
    let mut udp_pkt = UdpPacket::new_unchecked(ip_pkt.payload_mut());
    udp.emit(
        &mut udp_pkt,
        &IpAddress::Ipv4(src_addr),
        &IpAddress::Ipv4(dst_addr),
        payload.len(),
        |b| b.copy_from_slice(payload),
        &caps,
    );
    buf
}

pub fn parse_udp(frame: &[u8]) -> Option<(FullAddr, FullAddr, Vec<u8>)> {
    let pkt = Ipv4Packet::new_checked(frame).ok()?;
    if pkt.next_header() != IpProtocol::Udp {
        return None;
    }
    let u = UdpPacket::new_checked(pkt.payload()).ok()?;
    Some((
        FullAddr::new(IpAddr::V4(pkt.src_addr().0.into()), u.src_port()),
        FullAddr::new(IpAddr::V4(pkt.dst_addr().0.into()), u.dst_port()),
        u.payload().to_vec(),
    ))
}

pub fn tcp_frame(
    src: FullAddr,
    dst: FullAddr,
    control: TcpControl,
    seq: TcpSeqNumber,
    ack: Option<TcpSeqNumber>,
    payload: &[u8],
) -> Vec<u8> {
    let (src_addr, dst_addr) = v4_pair(src, dst);
    let caps = ChecksumCapabilities::default();
    let tcp = TcpRepr {
        src_port: src.port,
        dst_port: dst.port,
        control,
        seq_number: seq,
        ack_number: ack,
        window_len: 65_000,
        window_scale: None,
        max_seg_size: if matches!(control, TcpControl::Syn) {
            Some(1460)
        } else {
            None
        },
        sack_permitted: false,
        sack_ranges: [None, None, None],
        payload,
    };
    let ip = Ipv4Repr {
        src_addr,
        dst_addr,
        next_header: IpProtocol::Tcp,
        payload_len: tcp.buffer_len(),
        hop_limit: 64,
    };
    let mut buf = vec![0u8; ip.buffer_len() + ip.payload_len];
    let mut ip_pkt = Ipv4Packet::new_unchecked(&mut buf[..]);
    ip.emit(&mut ip_pkt, &caps);
    let mut tcp_pkt = TcpPacket::new_unchecked(ip_pkt.payload_mut());
    tcp.emit(
        &mut tcp_pkt,
        &IpAddress::Ipv4(src_addr),
        &IpAddress::Ipv4(dst_addr),
        &caps,
    );
    buf
}

#[derive(Debug)]
pub struct ParsedTcp {
    pub src: FullAddr,
    pub dst: FullAddr,
    pub control: TcpControl,
    pub syn: bool,
    pub fin: bool,
    pub rst: bool,
    pub seq: TcpSeqNumber,
    pub ack: Option<TcpSeqNumber>,
    pub payload: Vec<u8>,
}

pub fn parse_tcp(frame: &[u8]) -> Option<ParsedTcp> {
    let pkt = Ipv4Packet::new_checked(frame).ok()?;
    if pkt.next_header() != IpProtocol::Tcp {
        return None;
    }
    let t = TcpPacket::new_checked(pkt.payload()).ok()?;
    let src_addr = IpAddress::Ipv4(pkt.src_addr());
    let dst_addr = IpAddress::Ipv4(pkt.dst_addr());
    let repr = TcpRepr::parse(&t, &src_addr, &dst_addr, &ChecksumCapabilities::default()).ok()?;
    Some(ParsedTcp {
        src: FullAddr::new(IpAddr::V4(pkt.src_addr().0.into()), repr.src_port),
        dst: FullAddr::new(IpAddr::V4(pkt.dst_addr().0.into()), repr.dst_port),
        control: repr.control,
        syn: matches!(repr.control, TcpControl::Syn),
        fin: matches!(repr.control, TcpControl::Fin),
        rst: matches!(repr.control, TcpControl::Rst),
        seq: repr.seq_number,
        ack: repr.ack_number,
        payload: repr.payload.to_vec(),
    })
}

/// A minimal TCP client living on the TUN side of the link.
pub struct TcpClient {
    pub src: FullAddr,
    pub dst: FullAddr,
    seq: TcpSeqNumber,
    ack: Option<TcpSeqNumber>,
}

impl TcpClient {
    pub fn new(src: FullAddr, dst: FullAddr) -> Self {
        Self {
            src,
            dst,
            seq: TcpSeqNumber(10_000),
            ack: None,
        }
    }

    pub fn syn_frame(&mut self) -> Vec<u8> {
        tcp_frame(self.src, self.dst, TcpControl::Syn, self.seq, None, &[])
    }

    fn ack_frame(&self) -> Vec<u8> {
        tcp_frame(self.src, self.dst, TcpControl::None, self.seq, self.ack, &[])
    }

    fn is_mine(&self, seg: &ParsedTcp) -> bool {
        seg.src == self.dst && seg.dst == self.src
    }

    /// Three-way handshake. Panics on timeout or reset.
    pub async fn connect(&mut self, peer: &WirePeer) {
        let syn = self.syn_frame();
        peer.send(syn).await;
        loop {
            let frame = peer.recv().await.expect("timed out waiting for syn-ack");
            let Some(seg) = parse_tcp(&frame) else {
                continue;
            };
            if !self.is_mine(&seg) {
                continue;
            }
            assert!(!seg.rst, "connection was reset");
            assert!(seg.syn, "expected syn-ack, got {:?}", seg.control);
            self.seq = self.seq + 1;
            self.ack = Some(seg.seq + 1);
            peer.send(self.ack_frame()).await;
            return;
        }
    }

    pub async fn send_data(&mut self, peer: &WirePeer, payload: &[u8]) {
        let frame = tcp_frame(
            self.src,
            self.dst,
            TcpControl::Psh,
            self.seq,
            self.ack,
            payload,
        );
        self.seq = self.seq + payload.len();
        peer.send(frame).await;
    }

    /// Wait for the next in-order payload segment, acknowledging as needed.
    /// Returns `None` on FIN, reset or timeout.
    pub async fn recv_data(&mut self, peer: &WirePeer) -> Option<Vec<u8>> {
        loop {
            let frame = peer.recv().await?;
            let Some(seg) = parse_tcp(&frame) else {
                continue;
            };
            if !self.is_mine(&seg) {
                continue;
            }
            if seg.rst {
                return None;
            }
            if Some(seg.seq) == self.ack {
                let advance = seg.payload.len() + usize::from(seg.fin);
                if advance > 0 {
                    self.ack = Some(seg.seq + advance);
                    peer.send(self.ack_frame()).await;
                }
                if !seg.payload.is_empty() {
                    return Some(seg.payload);
                }
                if seg.fin {
                    return None;
                }
            } else if !seg.payload.is_empty() || seg.fin {
                // Retransmission; re-acknowledge what we have.
                peer.send(self.ack_frame()).await;
            }
        }
    }

    /// Send FIN and absorb the peer's side of the teardown.
    pub async fn close(&mut self, peer: &WirePeer) {
        let frame = tcp_frame(self.src, self.dst, TcpControl::Fin, self.seq, self.ack, &[]);
        self.seq = self.seq + 1;
        peer.send(frame).await;
        for _ in 0..8 {
            let Some(frame) = peer.recv().await else {
                return;
            };
            let Some(seg) = parse_tcp(&frame) else {
                continue;
            };
            if !self.is_mine(&seg) {
                continue;
            }
            if seg.rst {
                return;
            }
            if seg.fin {
                self.ack = Some(seg.seq + seg.payload.len() + 1);
                peer.send(self.ack_frame()).await;
                return;
            }
        }
    }
}
