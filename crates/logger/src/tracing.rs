use std::env::var;

use tracing::{level_filters::LevelFilter, warn};
use tracing_subscriber::{Layer, filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Map a `-v` count from the command line onto a default level.
///
/// `RUST_LOG` still wins over whatever this returns.
pub fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber.
///
/// Calling this twice is harmless; the second registration is ignored so
/// tests and the binary can both call it.
pub fn init(level: LevelFilter) {
    let env_filter = EnvFilter::builder().with_default_directive(level.into()).from_env_lossy();

    let log_format = var("RUST_LOG_FORMAT").unwrap_or_default();

    let log_layer = match log_format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_filter(env_filter)
            .boxed(),
        "" | "compact" => tracing_subscriber::fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(env_filter)
            .boxed(),
        other => {
            let layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_filter(env_filter)
                .boxed();
            if tracing_subscriber::registry().with(layer).try_init().is_ok() {
                warn!("Unknown RUST_LOG_FORMAT '{other}', using compact output");
            }
            return;
        }
    };

    let _ = tracing_subscriber::registry().with(log_layer).try_init();
}
