use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;

use crate::tun2io::id::{ListenerId, Protocol};
use crate::tun2io::stack::{Endpoint, Stack, StackError, WaitQueue};

/// Result of one accept attempt.
pub enum AcceptOutcome {
    /// A synthesized inbound connection and its own wait queue.
    Accepted(Arc<dyn Endpoint>, WaitQueue),
    /// No traffic for `listen_timeout`. A liveness signal, not a fault; the
    /// listener stays healthy.
    TimedOut,
    Cancelled,
}

/// Wraps an in-stack TCP endpoint bound and listening on one
/// `(dst, dst_port)` target.
pub struct FlowListener {
    id: ListenerId,
    ep: Arc<dyn Endpoint>,
    wq: WaitQueue,
    listen_timeout: Duration,
    cancel: watch::Sender<bool>,
    closed: AtomicBool,
}

impl FlowListener {
    pub fn bind(
        stack: &Arc<dyn Stack>,
        id: ListenerId,
        backlog: usize,
        listen_timeout: Duration,
    ) -> Result<Arc<Self>, StackError> {
        let (ep, wq) = stack.new_endpoint(Protocol::Tcp)?;
        ep.bind(id.dst)?;
        ep.listen(backlog)?;
        let (cancel, _) = watch::channel(false);
        Ok(Arc::new(Self {
            id,
            ep,
            wq,
            listen_timeout,
            cancel,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Loop on the endpoint's non-blocking accept, suspending on the
    /// readable event, cancellation or the listen timer.
    pub async fn accept(&self) -> Result<AcceptOutcome, StackError> {
        let mut cancel = self.cancel.subscribe();
        loop {
            if *cancel.borrow() {
                return Ok(AcceptOutcome::Cancelled);
            }
            match self.ep.accept() {
                Ok((ep, wq)) => {
                    if let (Some(remote), Some(local)) = (ep.remote_addr(), ep.local_addr()) {
                        tracing::info!(remote = %remote, local = %local, "listener: accepted connection");
                    }
                    return Ok(AcceptOutcome::Accepted(ep, wq));
                }
                Err(StackError::WouldBlock) => {
                    tokio::select! {
                        _ = self.wq.readable() => {}
                        _ = cancel.changed() => {}
                        _ = time::sleep(self.listen_timeout) => return Ok(AcceptOutcome::TimedOut),
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Idempotent: closes the endpoint and unblocks in-flight accepts.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cancel.send(true);
        self.ep.close();
        tracing::debug!(id = %self.id, "listener: closed");
    }
}
