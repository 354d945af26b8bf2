use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use ipnet::IpNet;
use serde::Serialize;

use crate::tun2io::config::Settings;
use crate::tun2io::dialer::Dialer;
use crate::tun2io::id::{ListenerId, Protocol, TransportId};
use crate::tun2io::listener::{AcceptOutcome, FlowListener};
use crate::tun2io::net;
use crate::tun2io::stack::{Endpoint, InboundPacket, Stack, WaitQueue};
use crate::tun2io::tunnel::{CloseCallback, Tunnel};

/// Debug snapshot of the live flow tables.
#[derive(Debug, Clone, Serialize)]
pub struct Census {
    pub tunnels: Vec<TransportId>,
    pub listeners: Vec<ListenerId>,
    pub attribution: Vec<ListenerAttribution>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerAttribution {
    pub listener: ListenerId,
    pub tunnels: Vec<TransportId>,
}

#[derive(Default)]
struct State {
    tunnels: HashMap<TransportId, Arc<Tunnel>>,
    tcp_listeners: HashMap<ListenerId, Arc<FlowListener>>,
    listener_children: HashMap<ListenerId, HashSet<TransportId>>,
}

/// Owns the live flow tables and wires the transport handlers into the
/// stack. All three maps are mutated under one mutex.
pub struct Manager {
    stack: Arc<dyn Stack>,
    dialer: Arc<dyn Dialer>,
    settings: Settings,
    subnets: Vec<IpNet>,
    state: Mutex<State>,
}

impl Manager {
    pub fn install(
        stack: Arc<dyn Stack>,
        dialer: Arc<dyn Dialer>,
        settings: Settings,
    ) -> Arc<Manager> {
        let subnets = stack.subnets();
        let m = Arc::new(Manager {
            stack: stack.clone(),
            dialer,
            settings,
            subnets,
            state: Mutex::new(State::default()),
        });

        let tcp = {
            let m = m.clone();
            Arc::new(move |pkt: &InboundPacket| m.clone().handle_tcp(pkt))
                as crate::tun2io::stack::TransportHandler
        };
        stack.set_transport_handler(Protocol::Tcp, tcp);

        let udp = {
            let m = m.clone();
            Arc::new(move |pkt: &InboundPacket| m.clone().handle_udp(pkt))
                as crate::tun2io::stack::TransportHandler
        };
        stack.set_transport_handler(Protocol::Udp, udp);

        m
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn census(&self) -> Census {
        let st = self.lock_state();
        let mut tunnels: Vec<TransportId> = st.tunnels.keys().copied().collect();
        tunnels.sort_by_key(|id| id.to_string());
        let mut listeners: Vec<ListenerId> = st.tcp_listeners.keys().copied().collect();
        listeners.sort_by_key(|id| id.to_string());
        let mut attribution: Vec<ListenerAttribution> = st
            .listener_children
            .iter()
            .map(|(lid, children)| {
                let mut tunnels: Vec<TransportId> = children.iter().copied().collect();
                tunnels.sort_by_key(|id| id.to_string());
                ListenerAttribution {
                    listener: *lid,
                    tunnels,
                }
            })
            .collect();
        attribution.sort_by_key(|a| a.listener.to_string());
        Census {
            tunnels,
            listeners,
            attribution,
        }
    }

    /// Called by the stack for every TCP segment with no owning endpoint.
    fn handle_tcp(self: Arc<Self>, pkt: &InboundPacket) -> bool {
        if net::in_subnets(pkt.id.dst.addr, &self.subnets) {
            // Destined to the gateway itself; the stack owns it.
            tracing::trace!(id = %pkt.id, "manager: local destination, not handled");
            return false;
        }

        let lid = pkt.id.listener_id();
        if self.stack.has_endpoint(Protocol::Tcp, &pkt.id) || self.stack.has_listener(&lid) {
            return false;
        }

        let listener = match FlowListener::bind(
            &self.stack,
            lid,
            self.settings.listen_backlog,
            self.settings.listen_timeout,
        ) {
            Ok(l) => l,
            Err(err) => {
                tracing::warn!(id = %lid, err = %err, "manager: listener create failed");
                return false;
            }
        };

        {
            let mut st = self.lock_state();
            st.tcp_listeners.insert(lid, listener.clone());
            st.listener_children.insert(lid, HashSet::new());
        }
        tracing::info!(id = %lid, "manager: listener created");
        metrics::counter!("tun2io_listeners_total").increment(1);

        tokio::spawn(self.clone().accept_loop(listener, lid));

        // Let the SYN drive the freshly created listening endpoint.
        self.stack.redeliver(pkt);
        true
    }

    /// Called by the stack for every UDP datagram with no owning endpoint.
    fn handle_udp(self: Arc<Self>, pkt: &InboundPacket) -> bool {
        if net::in_subnets(pkt.id.dst.addr, &self.subnets) {
            tracing::trace!(id = %pkt.id, "manager: local destination, not handled");
            return false;
        }

        if self.stack.has_endpoint(Protocol::Udp, &pkt.id) {
            return false;
        }

        let (ep, wq) = match self.stack.new_endpoint(Protocol::Udp) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(id = %pkt.id, err = %err, "manager: udp endpoint create failed");
                return false;
            }
        };
        if let Err(err) = ep.bind(pkt.id.dst) {
            tracing::warn!(id = %pkt.id, err = %err, "manager: udp bind failed");
            ep.close();
            return false;
        }
        if let Err(err) = ep.connect(pkt.id.src) {
            tracing::warn!(id = %pkt.id, err = %err, "manager: udp connect failed");
            ep.close();
            return false;
        }

        tracing::info!(id = %pkt.id, "manager: udp flow created");
        tokio::spawn(self.clone().start_tunnel(Protocol::Udp, None, ep, wq));

        self.stack.redeliver(pkt);
        true
    }

    /// Per-listener accept loop. Timeouts garbage-collect the listener once
    /// no attributed tunnels remain; anything fatal drops it immediately.
    async fn accept_loop(self: Arc<Self>, listener: Arc<FlowListener>, lid: ListenerId) {
        loop {
            match listener.accept().await {
                Ok(AcceptOutcome::Accepted(ep, wq)) => {
                    tokio::spawn(
                        self.clone()
                            .start_tunnel(Protocol::Tcp, Some(lid), ep, wq),
                    );
                }
                Ok(AcceptOutcome::TimedOut) => {
                    let collected = {
                        let mut st = self.lock_state();
                        let idle = st
                            .listener_children
                            .get(&lid)
                            .is_none_or(|children| children.is_empty());
                        if idle {
                            st.tcp_listeners.remove(&lid);
                            st.listener_children.remove(&lid);
                        }
                        idle
                    };
                    if collected {
                        listener.close();
                        tracing::info!(id = %lid, "manager: idle listener collected");
                        return;
                    }
                }
                Ok(AcceptOutcome::Cancelled) => return,
                Err(err) => {
                    tracing::error!(id = %lid, err = %err, "manager: accept failed");
                    {
                        let mut st = self.lock_state();
                        st.tcp_listeners.remove(&lid);
                        st.listener_children.remove(&lid);
                    }
                    listener.close();
                    return;
                }
            }
        }
    }

    /// Dial upstream for one accepted endpoint, register the tunnel, run it.
    async fn start_tunnel(
        self: Arc<Self>,
        network: Protocol,
        lid: Option<ListenerId>,
        ep: Arc<dyn Endpoint>,
        wq: WaitQueue,
    ) {
        let on_close: CloseCallback = {
            let m = self.clone();
            Arc::new(move |id| m.tunnel_closed(id))
        };

        match Tunnel::connect(
            network,
            wq,
            ep.clone(),
            self.dialer.clone(),
            &self.settings,
            on_close,
        )
        .await
        {
            Ok(tunnel) => {
                {
                    let mut st = self.lock_state();
                    st.tunnels.insert(tunnel.id(), tunnel.clone());
                    // Attribution only while the listener is still registered;
                    // a tunnel may outlive a collected listener.
                    if let Some(children) = lid.and_then(|l| st.listener_children.get_mut(&l)) {
                        children.insert(tunnel.id());
                    }
                }
                // Registration is visible before anything can close.
                tunnel.run().await;
            }
            Err(err) => {
                tracing::warn!(err = %err, "manager: tunnel setup failed");
                ep.close();
            }
        }
    }

    /// Tunnel close callback: drop the id from the tables. The listener
    /// itself is only collected by its accept loop, so bursts to the same
    /// destination reuse it.
    fn tunnel_closed(&self, id: TransportId) {
        let mut st = self.lock_state();
        st.tunnels.remove(&id);
        if id.proto == Protocol::Tcp {
            if let Some(children) = st.listener_children.get_mut(&id.listener_id()) {
                children.remove(&id);
            }
        }
        tracing::debug!(id = %id, "manager: tunnel unregistered");
    }
}
