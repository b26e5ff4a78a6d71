//! Process-wide `tracing` subscriber setup.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset. Includes the debug events of
/// finished trace spans.
pub const DEFAULT_DIRECTIVES: &str = "info,keel_server=debug";

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human-readable, colored when attached to a terminal.
    #[default]
    Pretty,
    /// One JSON object per event, with span fields flattened in.
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => anyhow::bail!("unknown log format {other:?}, expected \"pretty\" or \"json\""),
        }
    }
}

/// Builds the filter from `RUST_LOG`, falling back to `default_directives`.
///
/// # Errors
///
/// Returns an error when `RUST_LOG` is unset and `default_directives` does not parse.
pub fn env_filter(default_directives: &str) -> anyhow::Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(default_directives)?),
    }
}

/// Installs the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter is invalid or a global subscriber is
/// already installed.
pub fn init(format: LogFormat, default_directives: &str) -> anyhow::Result<()> {
    let filter = env_filter(default_directives)?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let installed = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;
    use crate::middleware::trace::LOG_TARGET;

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default().to_string(), "pretty");
    }

    #[test]
    fn invalid_default_directives_are_rejected() {
        // RUST_LOG is not set by the test runner, so the default is parsed.
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(env_filter(DEFAULT_DIRECTIVES).is_ok());
            assert!(env_filter("keel_server=loud").is_err());
        }
    }

    #[test]
    fn default_directives_show_finished_spans() {
        let filter = EnvFilter::try_new(DEFAULT_DIRECTIVES).unwrap();
        let subscriber = tracing_subscriber::registry().with(filter);
        tracing::subscriber::with_default(subscriber, || {
            assert!(tracing::enabled!(target: LOG_TARGET, tracing::Level::DEBUG));
            assert!(tracing::enabled!(target: "keel_server::middleware", tracing::Level::DEBUG));
            assert!(!tracing::enabled!(target: "hyper::proto", tracing::Level::DEBUG));
        });
    }
}
