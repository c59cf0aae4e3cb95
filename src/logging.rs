//! Structured logging setup.
//!
//! ## Environment Variables
//!
//! - `TUNNELMUX_LOG` or `RUST_LOG`: filter directive (e.g. `tunnelmux=debug,warn`)
//! - `TUNNELMUX_LOG_FORMAT`: output format (`pretty`, `compact`, `json`)
//!
//! ```bash
//! # Trace every frame the gateway routes
//! TUNNELMUX_LOG=tunnelmux::gateway=trace tunnelmux gateway
//!
//! # JSON lines for log shipping
//! TUNNELMUX_LOG_FORMAT=json tunnelmux tunnel --relay https://relay.example --id dev
//! ```

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const DEFAULT_FILTER: &str = "tunnelmux=info,warn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-line
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// One JSON object per event
    Json,
}

impl LogFormat {
    /// Case-insensitive; anything unknown falls back to `Pretty`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            "compact" => Self::Compact,
            _ => Self::Pretty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub filter: String,
    pub format: LogFormat,
    /// Include file and line
    pub with_file: bool,
    /// Include module path
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            format: LogFormat::Pretty,
            with_file: false,
            with_target: true,
        }
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let filter = lookup("TUNNELMUX_LOG")
            .or_else(|| lookup("RUST_LOG"))
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let format = lookup("TUNNELMUX_LOG_FORMAT")
            .map(|s| LogFormat::parse(&s))
            .unwrap_or_default();

        Self {
            filter,
            format,
            ..Default::default()
        }
    }

    /// What `--verbose` selects: debug for this crate, file and line on.
    pub fn verbose(self) -> Self {
        Self {
            filter: "tunnelmux=debug,info".to_string(),
            with_file: true,
            ..self
        }
    }
}

/// Install the global subscriber. Only the first call has any effect.
pub fn init(config: LogConfig) {
    let env_filter =
        EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_file(config.with_file)
        .with_line_number(config.with_file)
        .with_target(config.with_target);

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = match config.format {
        LogFormat::Json => tracing::subscriber::set_global_default(registry.with(layer.json())),
        LogFormat::Compact => {
            tracing::subscriber::set_global_default(registry.with(layer.compact()))
        }
        LogFormat::Pretty => {
            tracing::subscriber::set_global_default(registry.with(layer.pretty()))
        }
    };
    // Already installed by an earlier call or a test harness.
    let _ = result;
}
