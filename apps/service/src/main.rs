#![warn(clippy::all)]

mod budget;
mod catalogue;
mod config;
mod engine;
mod error;
mod escalation;
mod multiplexer;
mod pool;
mod probe;
mod reporting;
mod store;
#[cfg(test)]
mod testing;
mod workers;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Parser};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use config::{Config, DnsStrategy};
use engine::Engine;
use error::ServiceError;
use reporting::{ReportSink, StdoutSink, TcpCollector};
use store::LibsqlStore;
use workers::SystemLauncher;

/// Probe network services and report their status to a collector.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Config file; created with defaults when missing.
    #[arg(long, env = "NETPROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Per-connection timeout in seconds.
    #[arg(long, value_name = "SECONDS")]
    timeout: Option<u64>,

    /// Ceiling on concurrently open sockets.
    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long, value_enum)]
    dns: Option<DnsStrategy>,

    /// Ping every host, optionally under another column name.
    #[arg(long, value_name = "COLUMN", num_args = 0..=1, require_equals = true, default_missing_value = "conn")]
    ping: Option<String>,

    #[arg(long, conflicts_with = "ping")]
    no_ping: bool,

    /// Column for content checks.
    #[arg(long, value_name = "COLUMN")]
    content: Option<String>,

    /// Column for TLS session details.
    #[arg(long, value_name = "COLUMN")]
    ssl: Option<String>,

    #[arg(long, conflicts_with = "ssl")]
    no_ssl: bool,

    /// Days of certificate validity left before the TLS column turns yellow.
    #[arg(long, value_name = "DAYS")]
    sslwarn: Option<u32>,

    /// Days of certificate validity left before the TLS column turns red.
    #[arg(long, value_name = "DAYS")]
    sslalarm: Option<u32>,

    /// Report the engine's own status, optionally under another column name.
    #[arg(long, value_name = "COLUMN", num_args = 0..=1, require_equals = true, default_missing_value = "netprobe")]
    report: Option<String>,

    /// Only test hosts tagged with this location.
    #[arg(long, env = "NETPROBE_LOCATION")]
    location: Option<String>,

    /// With --location, also test hosts that carry no location.
    #[arg(long)]
    test_untagged: bool,

    /// Run a single sweep and exit.
    #[arg(long)]
    once: bool,

    /// Print status messages instead of sending them.
    #[arg(long)]
    dry_run: bool,

    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        let engine = &mut config.engine;
        if let Some(timeout) = self.timeout {
            engine.timeout_seconds = timeout;
        }
        if let Some(concurrency) = self.concurrency {
            engine.concurrency = concurrency;
        }
        if let Some(dns) = self.dns {
            engine.dns = dns;
        }
        if let Some(column) = &self.ping {
            engine.ping_enabled = true;
            engine.ping_column = column.clone();
        }
        if self.no_ping {
            engine.ping_enabled = false;
        }
        if let Some(column) = &self.content {
            engine.content_column = column.clone();
        }
        if let Some(column) = &self.ssl {
            engine.ssl_column = Some(column.clone());
        }
        if self.no_ssl {
            engine.ssl_column = None;
        }
        if let Some(days) = self.sslwarn {
            engine.sslwarn_days = days;
        }
        if let Some(days) = self.sslalarm {
            engine.sslalarm_days = days;
        }
        if let Some(column) = &self.report {
            engine.report_column = Some(column.clone());
        }
        if let Some(location) = &self.location {
            engine.location = Some(location.clone());
        }
        engine.test_untagged |= self.test_untagged;
    }
}

/// Cancel `token` on SIGINT, SIGTERM or SIGHUP.
fn cancel_on_signal(token: CancellationToken) -> std::io::Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
        };
        info!("received {name}, shutting down");
        token.cancel();
    });
    Ok(())
}

async fn run(cli: Cli) -> Result<(), ServiceError> {
    let mut config = Config::from_config(cli.config.as_ref())?;
    cli.apply(&mut config);
    debug!("{config}");

    let store = LibsqlStore::open(&config.engine.store_path).await.map_err(ServiceError::StoreUnavailable)?;
    let sink: Arc<dyn ReportSink> = if cli.dry_run {
        Arc::new(StdoutSink)
    } else {
        Arc::new(TcpCollector::new(
            &config.collector.address,
            config.collector.port,
            Duration::from_secs(config.collector.timeout_seconds),
        ))
    };

    let mut engine = Engine::from_config(&config, Arc::new(store), sink, Box::new(SystemLauncher))?;
    info!(tests = engine.catalogue().len(), location = ?config.engine.location, "netprobe starting");

    let cancel = CancellationToken::new();
    if let Err(err) = cancel_on_signal(cancel.clone()) {
        warn!("signal handlers unavailable: {err}");
    }

    engine.run(cli.once, cancel).await.map_err(ServiceError::StoreUnavailable)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::init(logger::level_for_verbosity(cli.verbose));

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_config() {
        let cli = Cli::parse_from([
            "netprobe",
            "--timeout=3",
            "--dns",
            "only",
            "--ping=icmp",
            "--no-ssl",
            "--report",
            "--location",
            "dc1",
        ]);
        let mut config = Config::default();
        cli.apply(&mut config);

        assert_eq!(config.engine.timeout_seconds, 3);
        assert_eq!(config.engine.dns, DnsStrategy::Only);
        assert_eq!(config.engine.ping_column, "icmp");
        assert_eq!(config.engine.ssl_column, None);
        assert_eq!(config.engine.report_column.as_deref(), Some("netprobe"));
        assert_eq!(config.engine.location.as_deref(), Some("dc1"));
    }

    #[test]
    fn certificate_expiry_limits() {
        let cli = Cli::parse_from(["netprobe", "--sslwarn=45", "--sslalarm=7"]);
        let mut config = Config::default();
        assert_eq!((config.engine.sslwarn_days, config.engine.sslalarm_days), (30, 10));
        cli.apply(&mut config);
        assert_eq!((config.engine.sslwarn_days, config.engine.sslalarm_days), (45, 7));
    }

    #[test]
    fn no_ping_disables_the_implicit_test() {
        let cli = Cli::parse_from(["netprobe", "--no-ping", "--once"]);
        let mut config = Config::default();
        cli.apply(&mut config);
        assert!(!config.engine.ping_enabled);
        assert!(cli.once);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
