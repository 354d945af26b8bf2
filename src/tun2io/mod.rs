pub mod app;
pub mod config;
pub mod dialer;
pub mod dns;
pub mod id;
pub mod listener;
pub mod logging;
pub mod manager;
pub mod net;
pub mod stack;
pub mod tunnel;
pub mod udp_server;

pub async fn run(opts: app::Options) -> anyhow::Result<()> {
    app::run(opts).await
}
