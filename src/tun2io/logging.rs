use std::io;
use std::path::PathBuf;

use anyhow::Context;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

use crate::tun2io::config;

/// Keeps the non-blocking writer's worker thread alive for the life of the
/// process; dropping it flushes buffered log lines.
#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Sink {
    Stderr,
    Stdout,
    Discard,
    File(PathBuf),
}

impl Sink {
    fn parse(output: &str) -> Sink {
        match output.trim() {
            "" | "stderr" => Sink::Stderr,
            "stdout" => Sink::Stdout,
            "discard" => Sink::Discard,
            path => Sink::File(PathBuf::from(path)),
        }
    }

    fn open(self) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
        let pair = match self {
            Sink::Stderr => tracing_appender::non_blocking(io::stderr()),
            Sink::Stdout => tracing_appender::non_blocking(io::stdout()),
            Sink::Discard => tracing_appender::non_blocking(io::sink()),
            Sink::File(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(dir)
                        .with_context(|| format!("logging: create {}", dir.display()))?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("logging: open {}", path.display()))?;
                tracing_appender::non_blocking(file)
            }
        };
        Ok(pair)
    }
}

/// `RUST_LOG` wins when set; otherwise the configured level, falling back to
/// `info` for anything unrecognized.
fn filter_for(level: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let level = level.trim().to_ascii_lowercase();
    let directive = match level.as_str() {
        "debug" | "info" | "warn" | "error" => level.as_str(),
        _ => "info",
    };
    EnvFilter::try_new(directive).context("logging: build filter")
}

pub fn init(cfg: &config::LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let filter = filter_for(&cfg.level)?;
    let (writer, guard) = Sink::parse(&cfg.output).open()?;
    let json = cfg.format.trim().eq_ignore_ascii_case("json");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(!json)
        .with_target(true)
        .with_file(cfg.add_source)
        .with_line_number(cfg.add_source);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }

    Ok(LoggingRuntime { _guard: guard })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_forms() {
        assert_eq!(Sink::parse("stderr"), Sink::Stderr);
        assert_eq!(Sink::parse(" stdout "), Sink::Stdout);
        assert_eq!(Sink::parse("discard"), Sink::Discard);
        assert_eq!(Sink::parse(""), Sink::Stderr);
        assert_eq!(
            Sink::parse("/var/log/tun2io.log"),
            Sink::File(PathBuf::from("/var/log/tun2io.log"))
        );
    }
}
