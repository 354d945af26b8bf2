use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time;

use crate::tun2io::config::Settings;
use crate::tun2io::id::{FullAddr, Protocol};
use crate::tun2io::stack::{Endpoint, Stack, StackError, UdpDatagram, WaitQueue};

/// A long-lived bound UDP endpoint exposed as a pair of datagram queues.
///
/// The reader drains the endpoint into the recv queue; the writer drains the
/// send queue into the endpoint, retrying on backpressure like a tunnel's
/// endpoint writer. Used by local in-stack services such as the DNS
/// responder.
pub struct UdpEndpointServer {
    local: FullAddr,
    ep: Arc<dyn Endpoint>,
    wq: WaitQueue,
    cancel: watch::Sender<bool>,
    closed: AtomicBool,
    write_timeout: Duration,
    /// Unlike tunnels, servers default to no read-idle timeout.
    idle_timeout: Option<Duration>,
}

impl UdpEndpointServer {
    /// Bind `local` and start the pipelines. Returns the server handle, the
    /// receive queue and the send queue.
    pub fn bind(
        stack: &Arc<dyn Stack>,
        local: FullAddr,
        settings: &Settings,
    ) -> Result<
        (
            Arc<Self>,
            mpsc::Receiver<UdpDatagram>,
            mpsc::Sender<UdpDatagram>,
        ),
        StackError,
    > {
        let (ep, wq) = stack.new_endpoint(Protocol::Udp)?;
        ep.bind(local)?;

        let (recv_tx, recv_rx) = mpsc::channel(settings.udp_queue_capacity);
        let (send_tx, send_rx) = mpsc::channel(settings.udp_queue_capacity);
        let (cancel, _) = watch::channel(false);

        let server = Arc::new(Self {
            local,
            ep,
            wq,
            cancel,
            closed: AtomicBool::new(false),
            write_timeout: settings.write_timeout,
            idle_timeout: None,
        });
        tracing::info!(local = %local, "udp server: bound");

        tokio::spawn(server.clone().reader(recv_tx));
        tokio::spawn(server.clone().writer(send_rx));
        Ok((server, recv_rx, send_tx))
    }

    pub fn local(&self) -> FullAddr {
        self.local
    }

    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(local = %self.local, reason = %reason, "udp server: closed");
        let _ = self.cancel.send(true);
        self.ep.close();
    }

    async fn reader(self: Arc<Self>, tx: mpsc::Sender<UdpDatagram>) {
        let mut cancel = self.cancel.subscribe();
        loop {
            match self.ep.recv_from() {
                Ok(datagram) => {
                    tokio::select! {
                        res = tx.send(datagram) => {
                            if res.is_err() {
                                self.close("recv queue dropped");
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
                        _ = idle(self.idle_timeout) => {
                            self.close("read timeout");
                            return;
                        }
                    }
                }
                Err(err) => {
                    self.close(&format!("endpoint read: {err}"));
                    return;
                }
            }
        }
    }

    async fn writer(self: Arc<Self>, mut rx: mpsc::Receiver<UdpDatagram>) {
        let mut cancel = self.cancel.subscribe();
        loop {
            let datagram = tokio::select! {
                d = rx.recv() => match d {
                    Some(d) => d,
                    None => return,
                },
                _ = cancelled(&mut cancel) => return,
            };
            loop {
                match self.ep.send_to(&datagram.data, datagram.peer) {
                    Ok(_) => break,
                    Err(StackError::WouldBlock) => {
                        tokio::select! {
                            _ = self.wq.writable() => {}
                            _ = cancelled(&mut cancel) => return,
                            _ = time::sleep(self.write_timeout) => {
                                self.close("write timeout");
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        self.close(&format!("endpoint write: {err}"));
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

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(d) => time::sleep(d).await,
        None => std::future::pending().await,
    }
}
