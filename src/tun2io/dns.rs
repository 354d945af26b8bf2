use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use hickory_proto::op::{Message, OpCode, ResponseCode};
use tokio::sync::{mpsc, watch};

use crate::tun2io::stack::UdpDatagram;

/// Computes a reply for one decoded DNS query. Returning `None` drops the
/// query silently.
pub trait DnsHandler: Send + Sync {
    fn handle(&self, query: &Message) -> Option<Message>;
}

/// In-stack DNS responder: drains queries from a `UdpEndpointServer` recv
/// queue, runs the handler, and enqueues encoded replies to the sender.
pub struct DnsResponder {
    cancel: watch::Sender<bool>,
    closed: AtomicBool,
}

impl DnsResponder {
    pub fn spawn(
        mut recv: mpsc::Receiver<UdpDatagram>,
        send: mpsc::Sender<UdpDatagram>,
        handler: Arc<dyn DnsHandler>,
    ) -> Arc<Self> {
        let (cancel, mut cancelled) = watch::channel(false);
        let responder = Arc::new(Self {
            cancel,
            closed: AtomicBool::new(false),
        });

        tokio::spawn(async move {
            loop {
                let datagram = tokio::select! {
                    d = recv.recv() => match d {
                        Some(d) => d,
                        None => return,
                    },
                    _ = cancelled.changed() => {
                        if *cancelled.borrow() {
                            return;
                        }
                        continue;
                    }
                };

                let reply = match Message::from_vec(&datagram.data) {
                    Ok(query) => {
                        tracing::debug!(peer = %datagram.peer, id = query.id(), "dns: query");
                        match handler.handle(&query) {
                            Some(mut reply) => {
                                reply.set_id(query.id());
                                reply
                            }
                            None => continue,
                        }
                    }
                    Err(err) => {
                        tracing::debug!(peer = %datagram.peer, err = %err, "dns: malformed query");
                        let id = datagram
                            .data
                            .get(..2)
                            .map(|b| u16::from_be_bytes([b[0], b[1]]))
                            .unwrap_or(0);
                        Message::error_msg(id, OpCode::Query, ResponseCode::FormErr)
                    }
                };

                let encoded = match reply.to_vec() {
                    Ok(b) => b,
                    Err(err) => {
                        tracing::warn!(err = %err, "dns: encode reply failed");
                        continue;
                    }
                };
                if send
                    .send(UdpDatagram {
                        peer: datagram.peer,
                        data: Bytes::from(encoded),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        responder
    }

    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(reason = %reason, "dns: responder closed");
        let _ = self.cancel.send(true);
    }
}
