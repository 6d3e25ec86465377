// Layered settings for embedding processes: optional file, then
// environment overrides
//
// The runtime itself is configured programmatically through TriggerConfig
// and JobConfig; these settings only cover process-level concerns.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log filter directive, e.g. "info" or "jobsphere=debug".
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON-formatted log lines instead of human-readable ones.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Settings {
    /// Load from `jobsphere.toml` in the working directory (if present),
    /// then apply `JOBSPHERE_*` environment overrides, e.g.
    /// `JOBSPHERE_LOGGING_LEVEL=debug`.
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name("jobsphere").required(false))
            .add_source(Environment::with_prefix("JOBSPHERE").separator("_"))
            .build()?
            .try_deserialize()
    }
}
