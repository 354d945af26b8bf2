use std::io;

use async_trait::async_trait;

/// Raw L3 packet I/O under the stack: the TUN device in production, an
/// in-memory pair in tests.
#[async_trait]
pub trait PacketLink: Send + Sync + 'static {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn send(&self, frame: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl PacketLink for tun_rs::AsyncDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        tun_rs::AsyncDevice::recv(self, buf).await
    }

    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        tun_rs::AsyncDevice::send(self, frame).await.map(|_| ())
    }
}

#[cfg(test)]
pub use mem::MemLink;

#[cfg(test)]
mod mem {
    use super::*;
    use tokio::sync::{Mutex, mpsc};

    /// One side of an in-memory packet link. Frames sent on one side arrive
    /// on the other.
    pub struct MemLink {
        tx: mpsc::Sender<Vec<u8>>,
        rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    }

    impl MemLink {
        pub fn pair(capacity: usize) -> (MemLink, MemLink) {
            let (atx, arx) = mpsc::channel(capacity);
            let (btx, brx) = mpsc::channel(capacity);
            (
                MemLink {
                    tx: atx,
                    rx: Mutex::new(brx),
                },
                MemLink {
                    tx: btx,
                    rx: Mutex::new(arx),
                },
            )
        }
    }

    #[async_trait]
    impl PacketLink for MemLink {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            let mut rx = self.rx.lock().await;
            match rx.recv().await {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "link closed")),
            }
        }

        async fn send(&self, frame: &[u8]) -> io::Result<()> {
            self.tx
                .send(frame.to_vec())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "link closed"))
        }
    }
}
