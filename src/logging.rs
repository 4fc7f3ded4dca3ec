//! Structured logging configuration.
//!
//! Uses `tracing` with `tracing-subscriber`. Logs go to stderr so command
//! output on stdout stays clean.
//!
//! ## Environment Variables
//!
//! - `TASKSTREAM_LOG` or `RUST_LOG`: log filter (e.g. `taskstream=debug,reqwest=warn`)
//! - `TASKSTREAM_LOG_FORMAT`: output format (`pretty`, `compact`, `json`)
//!
//! Remote tracebacks are logged under the `taskstream::diagnostics` target,
//! so `TASKSTREAM_LOG=taskstream::diagnostics=off` silences them.

use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

const DEFAULT_FILTER: &str = "taskstream=info,warn";

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-line
    Pretty,
    /// Compact single-line output
    #[default]
    Compact,
    /// JSON output for log aggregation
    Json,
}

impl LogFormat {
    /// Parse from string (case-insensitive); unknown values fall back to compact.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive (e.g. "debug", "taskstream=debug,hyper=warn")
    pub filter: String,
    pub format: LogFormat,
    /// Include span events (enter/exit)
    pub with_spans: bool,
    /// Include file/line in logs
    pub with_file: bool,
    /// Include target (module path)
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::default(),
            with_spans: false,
            with_file: false,
            with_target: true,
        }
    }
}

impl LogConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let filter = std::env::var("TASKSTREAM_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| DEFAULT_FILTER.to_string());

        let format = std::env::var("TASKSTREAM_LOG_FORMAT")
            .map(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        Self {
            filter,
            format,
            ..Default::default()
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Call once at the start of the program; later calls are ignored.
pub fn init(config: LogConfig) {
    let env_filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let span_events = if config.with_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(span_events)
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_target(config.with_target);

    match config.format {
        LogFormat::Json => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.json());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        LogFormat::Compact => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.compact());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
        LogFormat::Pretty => {
            let subscriber = tracing_subscriber::registry()
                .with(env_filter)
                .with(layer.pretty());
            let _ = tracing::subscriber::set_global_default(subscriber);
        }
    }
}

/// Convenience for `init(LogConfig::from_env())`.
pub fn init_from_env() {
    init(LogConfig::from_env());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parsing() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("bogus"), LogFormat::Compact);
    }

    #[test]
    fn default_filter_is_crate_info() {
        assert_eq!(LogConfig::default().filter, DEFAULT_FILTER);
    }
}
