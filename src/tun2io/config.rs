use std::time::Duration;

/// Runtime knobs for the flow-mediation engine.
///
/// Defaults mirror the behavior of the richest reference driver: payload
/// idleness closes a flow after a minute, backpressure waits are bounded at
/// ten seconds, and an idle listener lingers for two minutes before it is
/// collected.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Idle timeout for incoming payload on either side of a tunnel. Also
    /// serves as the UDP flow idle timer.
    pub read_timeout: Duration,
    /// Bound on a single blocked write (endpoint backpressure or upstream).
    pub write_timeout: Duration,
    /// How long a listener's accept may sit idle before it reports a
    /// liveness timeout to the manager.
    pub listen_timeout: Duration,
    /// Bound on the upstream dial, SOCKS5 handshake included.
    pub dial_timeout: Duration,
    /// Backlog for auto-provisioned in-stack listeners.
    pub listen_backlog: usize,
    /// Capacity, in chunks, of each per-tunnel payload channel.
    pub channel_capacity: usize,
    /// Capacity of the recv/send queues of a `UdpEndpointServer`.
    pub udp_queue_capacity: usize,
    /// Period of the transport-stats and census log line.
    pub census_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            listen_timeout: Duration::from_secs(120),
            dial_timeout: Duration::from_secs(20),
            listen_backlog: 10,
            channel_capacity: 256,
            udp_queue_capacity: 100,
            census_interval: Duration::from_secs(5),
        }
    }
}

/// Logging setup, resolved from the command line.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// debug | info | warn | error
    pub level: String,
    /// text | json
    pub format: String,
    /// stderr | stdout | discard | <path>
    pub output: String,
    /// Include file/line in log events.
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}
