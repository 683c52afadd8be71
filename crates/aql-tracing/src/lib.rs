//! Log and performance-span setup for the AQL runtime workspace.
//!
//! Test harnesses, benchmarks and host programs embedding the runtime install
//! their `tracing` subscriber through [`install`], so filter resolution,
//! output format and performance-span settings agree across the workspace.
//!
//! ```rust,no_run
//! use aql_tracing::{install, LogConfig};
//!
//! install(&LogConfig::from_env()).expect("subscriber");
//! ```

pub mod performance;

#[macro_use]
pub mod macros;

use std::env;
use std::str::FromStr;

pub use tracing;
pub use tracing::{debug, error, info, trace, warn};

use tracing::Subscriber;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Preset name: `terminal`, `collector` or `profiling`.
pub const ENV_LOG_PROFILE: &str = "AQL_LOG_PROFILE";
/// Filter directives, taking precedence over `RUST_LOG`.
pub const ENV_LOG_FILTER: &str = "AQL_LOG";
/// `compact`, `pretty` or `json`.
pub const ENV_LOG_FORMAT: &str = "AQL_LOG_FORMAT";
pub const ENV_PERF_TRACING: &str = "AQL_PERF_TRACING";
/// Microseconds a performance span must last before it is logged.
pub const ENV_PERF_THRESHOLD_US: &str = "AQL_PERF_THRESHOLD_US";

const RUNTIME_DEBUG_FILTER: &str = "aql_runtime=debug,aql_core=debug,info";

/// Named starting points for a [`LogConfig`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogProfile {
    /// Pretty, coloured output; performance spans on in debug builds
    #[default]
    Terminal,
    /// JSON lines for a log collector
    Collector,
    /// JSON with span close events and debug-level runtime targets
    Profiling,
}

impl FromStr for LogProfile {
    type Err = LogSetupError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "terminal" | "local" => Ok(Self::Terminal),
            "collector" | "ci" => Ok(Self::Collector),
            "profiling" | "perf" => Ok(Self::Profiling),
            _ => Err(LogSetupError::UnknownProfile(name.to_string())),
        }
    }
}

/// Line format of emitted events
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = LogSetupError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(LogSetupError::UnknownFormat(name.to_string())),
        }
    }
}

/// Subscriber settings
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Explicit filter. When absent `RUST_LOG` is consulted, then `fallback`.
    pub filter: Option<String>,
    pub fallback: String,
    pub format: LogFormat,
    pub targets: bool,
    /// Ignored for [`LogFormat::Json`].
    pub ansi: bool,
    pub span_events: FmtSpan,
    /// Gate for [`performance::PerformanceSpan`] and the `record_*` events.
    pub perf_spans: bool,
    pub perf_threshold_us: Option<u64>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::profile(LogProfile::default())
    }
}

impl LogConfig {
    pub fn profile(profile: LogProfile) -> Self {
        let terminal = Self {
            filter: None,
            fallback: "info".to_string(),
            format: LogFormat::Pretty,
            targets: true,
            ansi: true,
            span_events: FmtSpan::NONE,
            perf_spans: cfg!(debug_assertions),
            perf_threshold_us: None,
        };
        match profile {
            LogProfile::Terminal => terminal,
            LogProfile::Collector => Self {
                format: LogFormat::Json,
                ansi: false,
                perf_spans: false,
                ..terminal
            },
            LogProfile::Profiling => Self {
                filter: Some(RUNTIME_DEBUG_FILTER.to_string()),
                format: LogFormat::Json,
                ansi: false,
                span_events: FmtSpan::CLOSE,
                perf_spans: true,
                ..terminal
            },
        }
    }

    /// Profile from `AQL_LOG_PROFILE` with the other `AQL_LOG*` and
    /// `AQL_PERF_*` variables layered on top. Unparseable values are skipped.
    pub fn from_env() -> Self {
        let profile = env::var(ENV_LOG_PROFILE)
            .ok()
            .and_then(|name| name.parse().ok())
            .unwrap_or_default();
        let mut config = Self::profile(profile);

        if let Some(filter) = env::var(ENV_LOG_FILTER).ok().filter(|f| !f.trim().is_empty()) {
            config.filter = Some(filter);
        }
        if let Some(format) = env::var(ENV_LOG_FORMAT).ok().and_then(|f| f.parse().ok()) {
            config.format = format;
        }
        if let Ok(flag) = env::var(ENV_PERF_TRACING) {
            config.perf_spans = is_enabled(&flag);
        }
        if let Some(us) = env::var(ENV_PERF_THRESHOLD_US).ok().and_then(|v| v.trim().parse().ok()) {
            config.perf_threshold_us = Some(us);
        }
        config
    }

    fn env_filter(&self) -> Result<EnvFilter, LogSetupError> {
        if let Some(filter) = &self.filter {
            return EnvFilter::try_new(filter).map_err(|e| LogSetupError::InvalidFilter(e.to_string()));
        }
        Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.fallback)))
    }
}

fn is_enabled(flag: &str) -> bool {
    matches!(flag.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[derive(Debug, thiserror::Error)]
pub enum LogSetupError {
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("unknown log profile {0:?}")]
    UnknownProfile(String),

    #[error("unknown log format {0:?}")]
    UnknownFormat(String),

    /// Another global subscriber is already installed.
    #[error("global subscriber already set: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Filter plus formatting layer, for callers composing their own registry.
pub fn layers(config: &LogConfig) -> Result<(EnvFilter, BoxedLayer), LogSetupError> {
    let filter = config.env_filter()?;
    let fmt = tracing_subscriber::fmt::layer()
        .with_target(config.targets)
        .with_span_events(config.span_events.clone());
    let layer: BoxedLayer = match config.format {
        LogFormat::Compact => Box::new(fmt.compact().with_ansi(config.ansi)),
        LogFormat::Pretty => Box::new(fmt.pretty().with_ansi(config.ansi)),
        LogFormat::Json => Box::new(fmt.json().with_ansi(false)),
    };
    Ok((filter, layer))
}

/// Subscriber for `config`, not yet installed.
pub fn subscriber(config: &LogConfig) -> Result<impl Subscriber + Send + Sync, LogSetupError> {
    let (filter, layer) = layers(config)?;
    Ok(Registry::default().with(layer).with(filter))
}

/// Install the subscriber process-wide and apply the performance-span switches.
pub fn install(config: &LogConfig) -> Result<(), LogSetupError> {
    subscriber(config)?.try_init()?;
    performance::configure(config.perf_spans, config.perf_threshold_us);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            ENV_LOG_PROFILE,
            ENV_LOG_FILTER,
            ENV_LOG_FORMAT,
            ENV_PERF_TRACING,
            ENV_PERF_THRESHOLD_US,
            "RUST_LOG",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_profiles() {
        let terminal = LogConfig::profile(LogProfile::Terminal);
        assert_eq!(terminal.format, LogFormat::Pretty);
        assert!(terminal.filter.is_none());

        let collector = LogConfig::profile(LogProfile::Collector);
        assert_eq!(collector.format, LogFormat::Json);
        assert!(!collector.perf_spans);

        let profiling = LogConfig::profile(LogProfile::Profiling);
        assert!(profiling.perf_spans);
        assert_eq!(profiling.filter.as_deref(), Some(RUNTIME_DEBUG_FILTER));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("CI".parse::<LogProfile>().unwrap(), LogProfile::Collector);
        assert_eq!(" perf ".parse::<LogProfile>().unwrap(), LogProfile::Profiling);
        assert!(matches!("loud".parse::<LogProfile>(), Err(LogSetupError::UnknownProfile(_))));
        assert_eq!("Json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!(matches!("xml".parse::<LogFormat>(), Err(LogSetupError::UnknownFormat(_))));
    }

    #[test]
    #[serial]
    fn test_bad_filter_is_rejected() {
        clear_env();
        let config = LogConfig {
            filter: Some("=::invalid".to_string()),
            ..LogConfig::default()
        };
        assert!(matches!(subscriber(&config), Err(LogSetupError::InvalidFilter(_))));
    }

    #[test]
    #[serial]
    fn test_every_format_builds() {
        clear_env();
        for format in [LogFormat::Compact, LogFormat::Pretty, LogFormat::Json] {
            let config = LogConfig {
                format,
                ..LogConfig::default()
            };
            assert!(subscriber(&config).is_ok());
        }
    }

    #[test]
    #[serial]
    fn test_env_overrides_profile() {
        clear_env();
        env::set_var(ENV_LOG_PROFILE, "collector");
        env::set_var(ENV_LOG_FORMAT, "compact");
        env::set_var(ENV_LOG_FILTER, "aql_runtime=trace");
        env::set_var(ENV_PERF_TRACING, "yes");
        env::set_var(ENV_PERF_THRESHOLD_US, "250");

        let config = LogConfig::from_env();
        assert_eq!(config.filter.as_deref(), Some("aql_runtime=trace"));
        assert_eq!(config.format, LogFormat::Compact);
        assert!(!config.ansi);
        assert!(config.perf_spans);
        assert_eq!(config.perf_threshold_us, Some(250));

        env::set_var(ENV_PERF_TRACING, "off");
        env::set_var(ENV_LOG_PROFILE, "nonsense");
        let config = LogConfig::from_env();
        assert!(!config.perf_spans);
        assert_eq!(config.format, LogFormat::Compact);
        clear_env();
    }
}
