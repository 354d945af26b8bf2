mod tun2io;

use std::time::Duration;

use clap::Parser;

use tun2io::app;
use tun2io::config::{LoggingConfig, Settings};

#[derive(Debug, Parser)]
#[command(
    name = "tun2io",
    version,
    about = "Transparent user-space traffic-redirection gateway for a TUN device"
)]
struct Cli {
    /// TUN device to attach to (e.g. tun2).
    tun_device: String,

    /// Local address with prefix assigned to the device (e.g. 192.168.4.1/24).
    local_address: String,

    /// SOCKS5 upstream as host:port. TCP flows egress through it; UDP always
    /// dials directly.
    #[arg(long, env = "TUN2IO_SOCKS5")]
    socks5: Option<String>,

    /// SOCKS5 username (optional auth).
    #[arg(long, env = "TUN2IO_SOCKS5_USER", requires = "socks5")]
    socks5_user: Option<String>,

    /// SOCKS5 password.
    #[arg(long, env = "TUN2IO_SOCKS5_PASS", requires = "socks5_user")]
    socks5_pass: Option<String>,

    /// Idle timeout for payload on either side of a flow.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s")]
    read_timeout: Duration,

    /// Bound on a single blocked write.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    write_timeout: Duration,

    /// How long an idle listener lingers before collection.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "120s")]
    listen_timeout: Duration,

    /// Bound on the upstream dial, SOCKS5 handshake included.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "20s")]
    dial_timeout: Duration,

    /// Log level (debug|info|warn|error).
    #[arg(long, env = "TUN2IO_LOG", default_value = "info")]
    log_level: String,

    /// Log format (text|json).
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log output (stderr|stdout|discard|<path>).
    #[arg(long, default_value = "stderr")]
    log_output: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = Settings {
        read_timeout: cli.read_timeout,
        write_timeout: cli.write_timeout,
        listen_timeout: cli.listen_timeout,
        dial_timeout: cli.dial_timeout,
        ..Settings::default()
    };
    let logging = LoggingConfig {
        level: cli.log_level,
        format: cli.log_format,
        output: cli.log_output,
        ..LoggingConfig::default()
    };

    tun2io::run(app::Options {
        tun_device: cli.tun_device,
        local_address: cli.local_address,
        socks5: cli.socks5,
        socks5_user: cli.socks5_user,
        socks5_pass: cli.socks5_pass,
        settings,
        logging,
    })
    .await
}
