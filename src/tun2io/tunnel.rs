use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::tun2io::config::Settings;
use crate::tun2io::dialer::{Dialer, Outbound, OutboundReader, OutboundWriter};
use crate::tun2io::id::{Protocol, TransportId};
use crate::tun2io::net;
use crate::tun2io::stack::{Endpoint, StackError, WaitQueue};

const UPSTREAM_READ_BUF: usize = 64 * 1024;

/// Lifecycle of a tunnel. Transitions are strictly monotone:
/// `New → Connecting → {ConnectionFailed, Connected} → Proxying → Closing →
/// Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TunnelStatus {
    New,
    Connecting,
    ConnectionFailed,
    Connected,
    Proxying,
    Closing,
    Closed,
}

pub type CloseCallback = Arc<dyn Fn(TransportId) + Send + Sync>;

/// One flow terminated in-stack and bridged to an upstream connection.
///
/// Four pipelines shuttle payload: endpoint reads feed the inbound channel,
/// which drains into the upstream writer; upstream reads feed the outbound
/// channel, which drains into the endpoint writer. Any fatal pipeline error
/// runs the single-shot close, which cancels the other three.
pub struct Tunnel {
    id: TransportId,
    ep: Arc<dyn Endpoint>,
    wq: WaitQueue,
    status: Mutex<TunnelStatus>,
    cancel: watch::Sender<bool>,
    closed: AtomicBool,
    on_close: CloseCallback,
    out: Mutex<Option<Outbound>>,
    // Write half of the upstream connection once running; taken by close()
    // so the upstream side is shut down before the endpoint.
    out_writer: tokio::sync::Mutex<Option<OutboundWriter>>,
    read_timeout: Duration,
    write_timeout: Duration,
    channel_capacity: usize,
}

impl Tunnel {
    /// Terminate `ep` and dial the flow's destination upstream. Fails with
    /// the dial error; the caller owns `ep` cleanup in that case.
    pub async fn connect(
        network: Protocol,
        wq: WaitQueue,
        ep: Arc<dyn Endpoint>,
        dialer: Arc<dyn Dialer>,
        settings: &Settings,
        on_close: CloseCallback,
    ) -> anyhow::Result<Arc<Tunnel>> {
        let src = ep
            .remote_addr()
            .ok_or_else(|| anyhow::anyhow!("tunnel: endpoint has no remote address"))?;
        let dst = ep
            .local_addr()
            .ok_or_else(|| anyhow::anyhow!("tunnel: endpoint has no local address"))?;
        let id = TransportId::new(network, src, dst);

        let (cancel, _) = watch::channel(false);
        let t = Arc::new(Tunnel {
            id,
            ep,
            wq,
            status: Mutex::new(TunnelStatus::New),
            cancel,
            closed: AtomicBool::new(false),
            on_close,
            out: Mutex::new(None),
            out_writer: tokio::sync::Mutex::new(None),
            read_timeout: settings.read_timeout,
            write_timeout: settings.write_timeout,
            channel_capacity: settings.channel_capacity,
        });

        t.set_status(TunnelStatus::Connecting);
        let target = net::host_port(dst);
        let dialed = time::timeout(settings.dial_timeout, dialer.dial(network, &target)).await;
        let out = match dialed {
            Ok(Ok(out)) => out,
            Ok(Err(err)) => {
                t.set_status(TunnelStatus::ConnectionFailed);
                return Err(err.context(format!("tunnel: dial {target}")));
            }
            Err(_) => {
                t.set_status(TunnelStatus::ConnectionFailed);
                anyhow::bail!("tunnel: dial {target}: timed out");
            }
        };
        *t.lock_out() = Some(out);
        t.set_status(TunnelStatus::Connected);
        tracing::info!(id = %id, upstream = %target, "tunnel: connected");
        Ok(t)
    }

    pub fn id(&self) -> TransportId {
        self.id
    }

    pub fn status(&self) -> TunnelStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, s: TunnelStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = s;
    }

    fn lock_out(&self) -> MutexGuard<'_, Option<Outbound>> {
        self.out.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Launch the four pipelines. A no-op if the upstream connection was
    /// already taken.
    pub async fn run(self: &Arc<Self>) {
        let Some(out) = self.lock_out().take() else {
            return;
        };
        let (out_reader, out_writer) = out.split();
        *self.out_writer.lock().await = Some(out_writer);

        let (inbound_tx, inbound_rx) = mpsc::channel::<Bytes>(self.channel_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel::<Bytes>(self.channel_capacity);

        self.set_status(TunnelStatus::Proxying);
        metrics::counter!("tun2io_tunnels_total").increment(1);
        metrics::gauge!("tun2io_active_tunnels").increment(1.0);
        tracing::debug!(id = %self.id, "tunnel: proxying");

        tokio::spawn(self.clone().reader(inbound_tx));
        tokio::spawn(self.clone().tunnel_writer(inbound_rx));
        tokio::spawn(self.clone().tunnel_reader(outbound_tx, out_reader));
        tokio::spawn(self.clone().writer(outbound_rx));
    }

    /// Idempotent shutdown, run by whichever pipeline fails first: cancels
    /// the others, closes the upstream connection and then the endpoint, and
    /// reports the id to the manager exactly once.
    pub async fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(id = %self.id, reason = %reason, "tunnel: closing");
        self.set_status(TunnelStatus::Closing);
        let _ = self.cancel.send(true);
        // Upstream before endpoint. Taking the slot waits out at most one
        // in-flight write; the read half drops as its pipeline unwinds.
        if let Some(mut out) = self.out_writer.lock().await.take() {
            let _ = out.shutdown().await;
        }
        self.ep.close();
        self.set_status(TunnelStatus::Closed);
        metrics::gauge!("tun2io_active_tunnels").decrement(1.0);
        (self.on_close)(self.id);
    }

    /// Endpoint → inbound channel.
    async fn reader(self: Arc<Self>, tx: mpsc::Sender<Bytes>) {
        let mut cancel = self.cancel.subscribe();
        loop {
            match self.ep.read() {
                Ok(data) => {
                    if data.is_empty() {
                        continue;
                    }
                    metrics::counter!("tun2io_bytes_in_total").increment(data.len() as u64);
                    tokio::select! {
                        res = tx.send(data) => {
                            if res.is_err() {
                                return;
                            }
                        }
                        _ = cancelled(&mut cancel) => return,
                    }
                }
                Err(StackError::WouldBlock) => {
                    tokio::select! {
                        _ = self.wq.readable() => {}
                        _ = cancelled(&mut cancel) => return,
                        _ = time::sleep(self.read_timeout) => {
                            self.close("read timeout").await;
                            return;
                        }
                    }
                }
                Err(err) => {
                    self.close(&format!("endpoint read: {err}")).await;
                    return;
                }
            }
        }
    }

    /// Inbound channel → upstream. Each write carries its own deadline.
    async fn tunnel_writer(self: Arc<Self>, mut rx: mpsc::Receiver<Bytes>) {
        let mut cancel = self.cancel.subscribe();
        loop {
            let chunk = tokio::select! {
                c = rx.recv() => match c {
                    Some(c) => c,
                    None => return,
                },
                _ = cancelled(&mut cancel) => return,
            };
            let res = {
                let mut slot = self.out_writer.lock().await;
                // close() already took the connection.
                let Some(out) = slot.as_mut() else { return };
                time::timeout(self.write_timeout, out.write_all(&chunk)).await
            };
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    self.close(&format!("upstream write: {err}")).await;
                    return;
                }
                Err(_) => {
                    self.close("upstream write timeout").await;
                    return;
                }
            }
        }
    }

    /// Upstream → outbound channel, with a read deadline as the idle timer.
    async fn tunnel_reader(self: Arc<Self>, tx: mpsc::Sender<Bytes>, mut out: OutboundReader) {
        let mut cancel = self.cancel.subscribe();
        let mut buf = vec![0u8; UPSTREAM_READ_BUF];
        loop {
            let res = tokio::select! {
                r = time::timeout(self.read_timeout, out.read(&mut buf)) => r,
                _ = cancelled(&mut cancel) => return,
            };
            match res {
                Err(_) => {
                    self.close("upstream read timeout").await;
                    return;
                }
                Ok(Err(err)) => {
                    self.close(&format!("upstream read: {err}")).await;
                    return;
                }
                Ok(Ok(0)) if out.eof_on_zero() => {
                    self.close("upstream closed").await;
                    return;
                }
                Ok(Ok(0)) => {}
                Ok(Ok(n)) => {
                    metrics::counter!("tun2io_bytes_out_total").increment(n as u64);
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    tokio::select! {
                        res = tx.send(chunk) => {
                            if res.is_err() {
                                return;
                            }
                        }
                        _ = cancelled(&mut cancel) => return,
                    }
                }
            }
        }
    }

    /// Outbound channel → endpoint, retrying the unwritten tail after the
    /// writable event on WouldBlock and partial writes.
    async fn writer(self: Arc<Self>, mut rx: mpsc::Receiver<Bytes>) {
        let mut cancel = self.cancel.subscribe();
        loop {
            let chunk = tokio::select! {
                c = rx.recv() => match c {
                    Some(c) => c,
                    None => return,
                },
                _ = cancelled(&mut cancel) => return,
            };
            let mut off = 0;
            while off < chunk.len() {
                match self.ep.write(&chunk[off..]) {
                    Ok(0) | Err(StackError::WouldBlock) => {
                        tokio::select! {
                            _ = self.wq.writable() => {}
                            _ = cancelled(&mut cancel) => return,
                            _ = time::sleep(self.write_timeout) => {
                                self.close("write timeout").await;
                                return;
                            }
                        }
                    }
                    Ok(n) => off += n,
                    Err(err) => {
                        self.close(&format!("endpoint write: {err}")).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun2io::dialer::DirectDialer;
    use crate::tun2io::id::FullAddr;
    use crate::tun2io::stack::UdpDatagram;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// In-memory endpoint standing in for a terminated in-stack socket.
    struct FakeEndpoint {
        rx: Mutex<VecDeque<Bytes>>,
        written: Mutex<Vec<u8>>,
        wq: WaitQueue,
        peer_closed: AtomicBool,
        closed: AtomicBool,
        local: FullAddr,
        remote: FullAddr,
    }

    impl FakeEndpoint {
        fn new(remote: FullAddr, local: FullAddr) -> Arc<Self> {
            Arc::new(Self {
                rx: Mutex::new(VecDeque::new()),
                written: Mutex::new(Vec::new()),
                wq: WaitQueue::new(),
                peer_closed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                local,
                remote,
            })
        }

        fn push(&self, data: &[u8]) {
            self.rx.lock().unwrap().push_back(Bytes::copy_from_slice(data));
            self.wq.notify_readable();
        }

        fn push_eof(&self) {
            self.peer_closed.store(true, Ordering::SeqCst);
            self.wq.notify_readable();
        }

        fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }
    }

    impl Endpoint for FakeEndpoint {
        fn read(&self) -> Result<Bytes, StackError> {
            match self.rx.lock().unwrap().pop_front() {
                Some(b) => Ok(b),
                None if self.peer_closed.load(Ordering::SeqCst) => {
                    Err(StackError::ClosedForReceive)
                }
                None => Err(StackError::WouldBlock),
            }
        }

        fn write(&self, data: &[u8]) -> Result<usize, StackError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(StackError::ClosedForSend);
            }
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(data.len())
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
            self.closed.store(true, Ordering::SeqCst);
        }

        fn local_addr(&self) -> Option<FullAddr> {
            Some(self.local)
        }

        fn remote_addr(&self) -> Option<FullAddr> {
            Some(self.remote)
        }
    }

    fn addr(s: &str, port: u16) -> FullAddr {
        FullAddr::new(s.parse().unwrap(), port)
    }

    async fn spawn_echo() -> std::net::SocketAddr {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a = ln.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut c, _)) = ln.accept().await {
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
        a
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn echo_round_trip_and_single_close() {
        let echo = spawn_echo().await;
        let local = FullAddr::new(echo.ip(), echo.port());
        let ep = FakeEndpoint::new(addr("192.168.4.2", 40000), local);

        let closes = Arc::new(AtomicUsize::new(0));
        let closes2 = closes.clone();
        let on_close: CloseCallback = Arc::new(move |_id| {
            closes2.fetch_add(1, Ordering::SeqCst);
        });

        let settings = Settings::default();
        let t = Tunnel::connect(
            Protocol::Tcp,
            ep.wq.clone(),
            ep.clone(),
            Arc::new(DirectDialer),
            &settings,
            on_close,
        )
        .await
        .unwrap();
        assert_eq!(t.status(), TunnelStatus::Connected);
        assert_eq!(t.id().src, addr("192.168.4.2", 40000));
        t.run().await;
        assert_eq!(t.status(), TunnelStatus::Proxying);

        ep.push(b"ping");
        {
            let ep = ep.clone();
            wait_for(move || ep.written() == b"ping").await;
        }

        // Client side closes; the tunnel must tear down and report once.
        ep.push_eof();
        {
            let closes = closes.clone();
            wait_for(move || closes.load(Ordering::SeqCst) == 1).await;
        }
        assert_eq!(t.status(), TunnelStatus::Closed);

        // R1: closing again is a no-op.
        t.close("again").await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dial_failure_marks_connection_failed() {
        // A port that refuses connections.
        let refused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a = refused.local_addr().unwrap();
        drop(refused);

        let ep = FakeEndpoint::new(
            addr("192.168.4.2", 40001),
            FullAddr::new(a.ip(), a.port()),
        );
        let on_close: CloseCallback = Arc::new(|_id| {
            panic!("close callback must not fire for a failed dial");
        });
        let settings = Settings::default();
        let res = Tunnel::connect(
            Protocol::Tcp,
            ep.wq.clone(),
            ep.clone(),
            Arc::new(DirectDialer),
            &settings,
            on_close,
        )
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn upstream_eof_closes_tunnel() {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let a = ln.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and immediately close the upstream side.
            if let Ok((c, _)) = ln.accept().await {
                drop(c);
            }
        });

        let ep = FakeEndpoint::new(
            addr("192.168.4.2", 40002),
            FullAddr::new(a.ip(), a.port()),
        );
        let closes = Arc::new(AtomicUsize::new(0));
        let closes2 = closes.clone();
        let on_close: CloseCallback = Arc::new(move |_| {
            closes2.fetch_add(1, Ordering::SeqCst);
        });
        let settings = Settings::default();
        let t = Tunnel::connect(
            Protocol::Tcp,
            ep.wq.clone(),
            ep.clone(),
            Arc::new(DirectDialer),
            &settings,
            on_close,
        )
        .await
        .unwrap();
        t.run().await;

        {
            let closes = closes.clone();
            wait_for(move || closes.load(Ordering::SeqCst) == 1).await;
        }
        assert_eq!(t.status(), TunnelStatus::Closed);
    }
}
