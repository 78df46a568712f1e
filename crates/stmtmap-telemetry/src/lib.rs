use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the logging subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "stmtmap_core" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
        }
    }
}

impl TelemetryConfig {
    pub fn with_module_level(mut self, module: &str, level: Level) -> Self {
        if let Some(entry) = self.module_levels.iter_mut().find(|(m, _)| m == module) {
            entry.1 = level;
        } else {
            self.module_levels.push((module.to_string(), level));
        }
        self
    }

    /// Filter directive string, e.g. `"info,stmtmap_core=debug"`.
    pub fn directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Parse a level name as used in settings files and env vars.
pub fn parse_level(raw: &str) -> Option<Level> {
    raw.trim().parse().ok()
}

/// Build the env filter from config. RUST_LOG wins when set.
pub fn build_filter(config: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()))
}

/// Initialize the global subscriber. Call once at startup; later calls
/// leave the first subscriber in place.
pub fn init_telemetry(config: &TelemetryConfig) {
    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    };

    let result = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(build_filter(config)))
        .try_init();
    if let Err(e) = result {
        tracing::debug!(error = %e, "telemetry already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives() {
        assert_eq!(TelemetryConfig::default().directives(), "info");
    }

    #[test]
    fn module_levels_append_and_replace() {
        let config = TelemetryConfig::default()
            .with_module_level("stmtmap_core", Level::DEBUG)
            .with_module_level("stmtmap_sqlite", Level::WARN)
            .with_module_level("stmtmap_core", Level::TRACE);
        assert_eq!(
            config.directives(),
            "info,stmtmap_core=trace,stmtmap_sqlite=warn"
        );
    }

    #[test]
    fn parse_level_accepts_names() {
        assert_eq!(parse_level("debug"), Some(Level::DEBUG));
        assert_eq!(parse_level(" WARN "), Some(Level::WARN));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = TelemetryConfig::default();
        init_telemetry(&config);
        init_telemetry(&config);
        tracing::info!("still logging");
    }
}
