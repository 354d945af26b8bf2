use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpStream, UdpSocket};

use socks5_impl::protocol::{
    Address, AsyncStreamOperation, AuthMethod, Command, Reply, Request, Response, UserKey,
    handshake,
};

use crate::tun2io::id::Protocol;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// An upstream connection produced by a dialer: a byte stream for TCP flows,
/// a connected datagram socket for UDP flows.
pub enum Outbound {
    Stream(BoxedStream),
    Datagram(Arc<UdpSocket>),
}

impl Outbound {
    /// Split into independently owned read/write sides for the two upstream
    /// pipelines of a tunnel.
    pub fn split(self) -> (OutboundReader, OutboundWriter) {
        match self {
            Outbound::Stream(s) => {
                let (r, w) = tokio::io::split(s);
                (OutboundReader::Stream(r), OutboundWriter::Stream(w))
            }
            Outbound::Datagram(s) => {
                (OutboundReader::Datagram(s.clone()), OutboundWriter::Datagram(s))
            }
        }
    }
}

pub enum OutboundReader {
    Stream(ReadHalf<BoxedStream>),
    Datagram(Arc<UdpSocket>),
}

impl OutboundReader {
    pub async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            OutboundReader::Stream(r) => r.read(buf).await,
            OutboundReader::Datagram(s) => s.recv(buf).await,
        }
    }

    /// Whether a zero-length read means end of stream.
    pub fn eof_on_zero(&self) -> bool {
        matches!(self, OutboundReader::Stream(_))
    }
}

pub enum OutboundWriter {
    Stream(WriteHalf<BoxedStream>),
    Datagram(Arc<UdpSocket>),
}

impl OutboundWriter {
    pub async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            OutboundWriter::Stream(w) => w.write_all(data).await,
            OutboundWriter::Datagram(s) => s.send(data).await.map(|_| ()),
        }
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            OutboundWriter::Stream(w) => w.shutdown().await,
            OutboundWriter::Datagram(_) => Ok(()),
        }
    }
}

/// Produces an upstream connection for `(network, "host:port")`.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, network: Protocol, addr: &str) -> anyhow::Result<Outbound>;
}

/// Dials on the host's own network stack.
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, network: Protocol, addr: &str) -> anyhow::Result<Outbound> {
        match network {
            Protocol::Tcp => {
                let c = TcpStream::connect(addr)
                    .await
                    .with_context(|| format!("dial tcp {addr}"))?;
                Ok(Outbound::Stream(Box::new(c)))
            }
            Protocol::Udp => {
                let target: SocketAddr = addr
                    .parse()
                    .with_context(|| format!("dial udp {addr}: bad address"))?;
                let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let s = UdpSocket::bind(bind_addr)
                    .await
                    .context("dial udp: bind local")?;
                s.connect(target)
                    .await
                    .with_context(|| format!("dial udp {addr}"))?;
                Ok(Outbound::Datagram(Arc::new(s)))
            }
        }
    }
}

/// Dials TCP through a SOCKS5 server; UDP falls through to a direct dial.
pub struct Socks5Dialer {
    server: String,
    auth: Option<UserKey>,
}

impl Socks5Dialer {
    pub fn new(server: impl Into<String>, auth: Option<UserKey>) -> Self {
        Self {
            server: server.into(),
            auth,
        }
    }

    async fn connect_through(&self, target: &str) -> anyhow::Result<TcpStream> {
        let mut stream = TcpStream::connect(&self.server)
            .await
            .with_context(|| format!("socks5: dial server {}", self.server))?;

        let methods = if self.auth.is_some() {
            vec![AuthMethod::UserPass, AuthMethod::NoAuth]
        } else {
            vec![AuthMethod::NoAuth]
        };
        handshake::Request::new(methods)
            .write_to_async_stream(&mut stream)
            .await
            .context("socks5: send greeting")?;
        let chosen = handshake::Response::retrieve_from_async_stream(&mut stream)
            .await
            .context("socks5: read method selection")?;

        match chosen.method {
            AuthMethod::NoAuth => {}
            AuthMethod::UserPass => {
                let key = self
                    .auth
                    .clone()
                    .context("socks5: server requires username/password auth")?;
                handshake::password_method::Request::new(&key.username, &key.password)
                    .write_to_async_stream(&mut stream)
                    .await
                    .context("socks5: send credentials")?;
                let resp =
                    handshake::password_method::Response::retrieve_from_async_stream(&mut stream)
                        .await
                        .context("socks5: read auth response")?;
                if !matches!(
                    resp.status,
                    handshake::password_method::Status::Succeeded
                ) {
                    anyhow::bail!("socks5: authentication rejected");
                }
            }
            other => anyhow::bail!("socks5: unsupported auth method {other:?}"),
        }

        let address = match target.parse::<SocketAddr>() {
            Ok(sa) => Address::from(sa),
            Err(_) => {
                let (host, port) = split_host_port(target)
                    .with_context(|| format!("socks5: bad target {target}"))?;
                Address::from((host, port))
            }
        };
        Request::new(Command::Connect, address)
            .write_to_async_stream(&mut stream)
            .await
            .context("socks5: send connect")?;
        let resp = Response::retrieve_from_async_stream(&mut stream)
            .await
            .context("socks5: read connect reply")?;
        if resp.reply != Reply::Succeeded {
            anyhow::bail!("socks5: connect failed: {:?}", resp.reply);
        }
        Ok(stream)
    }
}

#[async_trait]
impl Dialer for Socks5Dialer {
    async fn dial(&self, network: Protocol, addr: &str) -> anyhow::Result<Outbound> {
        match network {
            // UDP through SOCKS5 is not required; use the host network.
            Protocol::Udp => DirectDialer.dial(network, addr).await,
            Protocol::Tcp => {
                let stream = self.connect_through(addr).await?;
                Ok(Outbound::Stream(Box::new(stream)))
            }
        }
    }
}

fn split_host_port(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.trim_matches(['[', ']']).to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn spawn_tcp_echo() -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut c, _) = match ln.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match c.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                if c.write_all(&buf[..n]).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn direct_tcp_round_trip() {
        let echo = spawn_tcp_echo().await;
        let out = DirectDialer
            .dial(Protocol::Tcp, &echo.to_string())
            .await
            .unwrap();
        let (mut r, mut w) = out.split();
        w.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = r.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn direct_udp_round_trip() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, peer)) = sock.recv_from(&mut buf).await {
                let _ = sock.send_to(&buf[..n], peer).await;
            }
        });

        let out = DirectDialer
            .dial(Protocol::Udp, &addr.to_string())
            .await
            .unwrap();
        let (mut r, mut w) = out.split();
        w.write_all(b"query").await.unwrap();
        let mut buf = [0u8; 2048];
        let n = r.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"query");
    }

    /// Mock SOCKS5 server: performs the server side of the handshake, records
    /// the CONNECT target, then dials it and bridges.
    async fn spawn_socks5(
        targets: Arc<std::sync::Mutex<Vec<String>>>,
    ) -> SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut c, _) = match ln.accept().await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let targets = targets.clone();
                tokio::spawn(async move {
                    let _greeting = handshake::Request::retrieve_from_async_stream(&mut c)
                        .await
                        .unwrap();
                    handshake::Response::new(AuthMethod::NoAuth)
                        .write_to_async_stream(&mut c)
                        .await
                        .unwrap();
                    let req = Request::retrieve_from_async_stream(&mut c).await.unwrap();
                    assert_eq!(req.command, Command::Connect);
                    let target = req.address.to_string();
                    targets.lock().unwrap().push(target.clone());
                    let mut upstream = TcpStream::connect(&target).await.unwrap();
                    Response::new(Reply::Succeeded, Address::unspecified())
                        .write_to_async_stream(&mut c)
                        .await
                        .unwrap();
                    let _ = tokio::io::copy_bidirectional(&mut c, &mut upstream).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn socks5_connect_observes_target_and_bridges() {
        let echo = spawn_tcp_echo().await;
        let targets = Arc::new(std::sync::Mutex::new(Vec::new()));
        let socks = spawn_socks5(targets.clone()).await;

        let dialer = Socks5Dialer::new(socks.to_string(), None);
        let out = dialer.dial(Protocol::Tcp, &echo.to_string()).await.unwrap();
        let (mut r, mut w) = out.split();
        w.write_all(b"through-socks").await.unwrap();
        let mut buf = [0u8; 32];
        let n = r.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"through-socks");

        let seen = targets.lock().unwrap().clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], echo.to_string());
    }

    #[test]
    fn split_host_port_forms() {
        assert_eq!(
            split_host_port("example.com:443"),
            Some(("example.com".into(), 443))
        );
        assert_eq!(split_host_port("[fd00::1]:53"), Some(("fd00::1".into(), 53)));
        assert_eq!(split_host_port("no-port"), None);
    }
}
