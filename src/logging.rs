//! Logging bootstrap.
//!
//! Structured logs go to stderr so stdout stays reserved for progress
//! lines and plan output. The filter honors `ANVIL_LOG` and falls back to
//! `info` (`debug` with `--verbose`). Output is human-readable by
//! default; `--log-format json` switches to one JSON object per line for
//! log shippers.

use std::str::FromStr;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "ANVIL_LOG";

/// Wire format of the stderr log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format {other}, expected text or json")),
        }
    }
}

/// Install the global tracing subscriber.
///
/// The returned guard flushes buffered log lines on drop; keep it alive
/// for the lifetime of the process.
pub fn init(verbose: bool, format: LogFormat) -> WorkerGuard {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parses_known_values() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}
