use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ipnet::IpNet;
use socks5_impl::protocol::UserKey;
use tokio::task::JoinSet;

use crate::tun2io::config::{LoggingConfig, Settings};
use crate::tun2io::dialer::{Dialer, DirectDialer, Socks5Dialer};
use crate::tun2io::logging;
use crate::tun2io::manager::Manager;
use crate::tun2io::stack::Stack;
use crate::tun2io::stack::smol::SmolStack;

#[derive(Debug, Clone)]
pub struct Options {
    /// TUN device to attach to.
    pub tun_device: String,
    /// Local address with prefix, e.g. `192.168.4.1/24`.
    pub local_address: String,
    /// Optional SOCKS5 upstream as `host:port`.
    pub socks5: Option<String>,
    pub socks5_user: Option<String>,
    pub socks5_pass: Option<String>,
    pub settings: Settings,
    pub logging: LoggingConfig,
}

pub async fn run(opts: Options) -> anyhow::Result<()> {
    let logrt = logging::init(&opts.logging)?;
    let _logrt_guard = logrt; // keep alive

    let subnet: IpNet = opts
        .local_address
        .parse()
        .with_context(|| format!("bad local address: {}", opts.local_address))?;
    let local = subnet.addr();

    let dev = tun_rs::DeviceBuilder::new()
        .name(&opts.tun_device)
        .build_async()
        .with_context(|| format!("open tun device {}", opts.tun_device))?;
    let mtu = dev
        .mtu()
        .with_context(|| format!("probe mtu of {}", opts.tun_device))? as usize;

    tracing::info!(
        device = %opts.tun_device,
        local = %local,
        subnet = %subnet,
        mtu,
        socks5 = opts.socks5.as_deref().unwrap_or("(direct)"),
        "tun2io: starting"
    );

    let dialer: Arc<dyn Dialer> = match &opts.socks5 {
        Some(server) => {
            let auth = match (&opts.socks5_user, &opts.socks5_pass) {
                (Some(user), Some(pass)) => Some(UserKey::new(user.clone(), pass.clone())),
                (Some(user), None) => Some(UserKey::new(user.clone(), String::new())),
                _ => None,
            };
            Arc::new(Socks5Dialer::new(server.clone(), auth))
        }
        None => Arc::new(DirectDialer),
    };

    let stack = SmolStack::new(local, subnet, mtu).context("stack init")?;
    let stack_dyn: Arc<dyn Stack> = stack.clone();
    let manager = Manager::install(stack_dyn.clone(), dialer, opts.settings.clone());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    {
        let stack = stack.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { stack.run(dev, shutdown).await });
    }

    // Periodic transport-stats and flow-census line.
    {
        let manager = manager.clone();
        let stack = stack_dyn.clone();
        let mut shutdown = shutdown_rx.clone();
        let interval = opts.settings.census_interval;
        tasks.spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Ok(());
                        }
                    }
                    _ = tick.tick() => {}
                }
                let stats = stack.stats();
                let census = manager.census();
                tracing::info!(
                    rx_packets = stats.rx_packets,
                    tx_packets = stats.tx_packets,
                    rx_bytes = stats.rx_bytes,
                    tx_bytes = stats.tx_bytes,
                    dropped = stats.dropped_packets,
                    tcp_sockets = stats.tcp_sockets,
                    udp_endpoints = stats.udp_endpoints,
                    tunnels = census.tunnels.len(),
                    listeners = census.listeners.len(),
                    census = %serde_json::to_string(&census).unwrap_or_else(|_| "{}".into()),
                    "tun2io: census"
                );
            }
        });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task exit.
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
        }
        res = tasks.join_next() => {
            if let Some(res) = res {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        let _ = shutdown_tx.send(true);
                        return Err(err);
                    }
                    Err(join_err) => return Err(join_err.into()),
                }
            }
        }
    }

    // Drain tasks; cap the wait so a stuck teardown can't hang the process.
    let drain = async {
        while tasks.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(5), drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = match signal(SignalKind::terminate()) {
            Ok(t) => t,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
