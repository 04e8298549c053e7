//! Logging setup
//!
//! Log lines go to stderr; stdout carries only the result table, so
//! `goss apply > report.txt` captures just the report.
//!
//! `--log-level` applies to goss itself while other crates stay at `warn`.
//! Setting `GOSS_LOG` replaces the whole filter with an [`EnvFilter`]
//! directive string, e.g. `GOSS_LOG=goss::transfer=trace,info`.
//!
//! Each host loop runs inside a `host` span carrying the worker index and
//! address, so interleaved lines from concurrent hosts stay attributable.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the computed filter
pub const LOG_ENV: &str = "GOSS_LOG";

/// Level for crates other than goss
const DEPENDENCY_LEVEL: &str = "warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Lenient parse; anything unrecognised is `Info`
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" | "quiet" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// `pretty` for terminals, `json` for log shippers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

impl LogFormat {
    pub fn parse(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Raw directive from [`LOG_ENV`], if any
    pub directive: Option<String>,
}

impl LogConfig {
    /// Level and format as given on the command line, plus [`LOG_ENV`]
    pub fn new(level: &str, format: &str) -> Self {
        Self {
            level: LogLevel::parse(level),
            format: LogFormat::parse(format),
            directive: std::env::var(LOG_ENV).ok().filter(|d| !d.trim().is_empty()),
        }
    }

    /// Filter directive string the subscriber is built from
    pub fn filter_directive(&self) -> String {
        match &self.directive {
            Some(directive) => directive.clone(),
            None => format!(
                "{},{}={}",
                DEPENDENCY_LEVEL,
                env!("CARGO_CRATE_NAME"),
                self.level.as_directive()
            ),
        }
    }

    fn filter(&self) -> anyhow::Result<EnvFilter> {
        let directive = self.filter_directive();
        EnvFilter::try_new(&directive)
            .map_err(|e| anyhow::anyhow!("invalid log filter '{}' (from {}): {}", directive, LOG_ENV, e))
    }
}

/// Install the global subscriber; fails if one is already installed
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let filter = config.filter()?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match config.format {
        // Span close events carry each host loop's busy/idle time
        LogFormat::Json => builder
            .json()
            .with_current_span(true)
            .with_span_events(FmtSpan::CLOSE)
            .try_init(),
        LogFormat::Pretty => builder.with_target(false).try_init(),
    }
    .map_err(|e| anyhow::anyhow!("cannot install log subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: &str, directive: Option<&str>) -> LogConfig {
        LogConfig {
            level: LogLevel::parse(level),
            format: LogFormat::Pretty,
            directive: directive.map(|d| d.to_string()),
        }
    }

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::parse(" debug "), LogLevel::Debug);
        assert_eq!(LogLevel::parse("quiet"), LogLevel::Error);
        assert_eq!(LogLevel::parse("verbose"), LogLevel::Info);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("logfmt"), LogFormat::Pretty);
    }

    #[test]
    fn test_level_applies_to_goss_only() {
        assert_eq!(config("debug", None).filter_directive(), "warn,goss=debug");
        assert_eq!(config("error", None).filter_directive(), "warn,goss=error");
    }

    #[test]
    fn test_env_directive_replaces_filter() {
        let config = config("info", Some("goss::transfer=trace,info"));
        assert_eq!(config.filter_directive(), "goss::transfer=trace,info");
        assert!(config.filter().is_ok());
    }

    #[test]
    fn test_invalid_directive_is_reported() {
        let err = config("info", Some("goss=notalevel")).filter().unwrap_err();
        assert!(err.to_string().contains(LOG_ENV));
    }
}
