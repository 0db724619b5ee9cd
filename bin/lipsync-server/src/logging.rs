//! Tracing setup: console output plus an optional daily-rotated log file.

use std::io;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::Config;

const LOG_FILE_PREFIX: &str = "lipsync-server.log";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// lifetime of the process. It is `None` when file logging is disabled.
pub fn init(cfg: &Config) -> Result<Option<WorkerGuard>, io::Error> {
    let mut layers: Vec<BoxedLayer> = Vec::new();

    let console = fmt::layer().with_target(true).with_thread_ids(true);
    layers.push(if cfg.log_json {
        console.json().boxed()
    } else {
        console.boxed()
    });

    let guard = match &cfg.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true);
            layers.push(if cfg.log_json {
                file.json().boxed()
            } else {
                file.boxed()
            });
            Some(guard)
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter(&cfg.log_level))
        .init();

    Ok(guard)
}

/// `RUST_LOG` wins over `LIPSYNC_LOG`.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| parse_filter(level))
}

/// Parse `level`, warning loudly and falling back to `info` when it is not a
/// valid filter expression.
fn parse_filter(level: &str) -> EnvFilter {
    match level.parse::<EnvFilter>() {
        Ok(f) => f,
        Err(e) => {
            eprintln!(
                "WARN: LIPSYNC_LOG='{level}' is not a valid tracing filter ({e}); \
                 falling back to 'info'"
            );
            EnvFilter::new("info")
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_filter_is_kept() {
        assert_eq!(parse_filter("debug").to_string(), "debug");
    }

    #[test]
    fn invalid_filter_falls_back_to_info() {
        assert_eq!(parse_filter("lipsync=notalevel").to_string(), "info");
    }
}
