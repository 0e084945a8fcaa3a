use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "parley_llm" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// JSON lines on stdout when true, human-readable otherwise.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: true,
        }
    }
}

impl TelemetryConfig {
    /// Build from a textual level such as `"debug"`; unknown values fall back to INFO.
    pub fn from_level_str(level: &str, json: bool) -> Self {
        Self {
            log_level: level.parse().unwrap_or(Level::INFO),
            module_levels: Vec::new(),
            json,
        }
    }

    /// The filter directive string used when RUST_LOG is absent.
    pub fn filter_directives(&self) -> String {
        let mut filter_str = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter_str.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter_str
    }
}

/// Initialize the global subscriber. Call once at startup; later calls are no-ops.
pub fn init_telemetry(config: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    if tracing_subscriber::registry().with(fmt_layer).try_init().is_err() {
        tracing::debug!("global subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_includes_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![("parley_server".into(), Level::DEBUG)],
            json: true,
        };
        assert_eq!(config.filter_directives(), "warn,parley_server=debug");
    }

    #[test]
    fn level_parsing_falls_back_to_info() {
        assert_eq!(TelemetryConfig::from_level_str("debug", false).log_level, Level::DEBUG);
        assert_eq!(TelemetryConfig::from_level_str("loud", false).log_level, Level::INFO);
    }

    #[test]
    fn init_twice_does_not_panic() {
        init_telemetry(&TelemetryConfig::default());
        init_telemetry(&TelemetryConfig::default());
    }
}
