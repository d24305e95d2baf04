use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Tracing filter directive, e.g. `"info"` or `"replog=debug"`.
    pub filter: Option<String>,
    /// Emit JSON log lines instead of human-readable ones.
    pub json: bool,
}

/// One replication target: a replica database fed from one source
/// directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Replica database the segments are applied to.
    pub db_name: String,
    /// Directory where the primary archives its change-log segments.
    pub log_source_directory: PathBuf,
    /// Expected source GUID; omit to accept segments from any source.
    #[serde(default)]
    pub source_guid: Option<Uuid>,
    /// User name for the replica connection.
    #[serde(default = "default_apply_user")]
    pub apply_user: String,
    /// Sleep after a pass that found nothing to do.
    #[serde(default = "default_apply_idle_timeout_secs")]
    pub apply_idle_timeout_secs: u64,
    /// Sleep after a failed pass before retrying.
    #[serde(default = "default_apply_error_timeout_secs")]
    pub apply_error_timeout_secs: u64,
    #[serde(default)]
    pub verbose_logging: bool,
    /// Rename consumed segments instead of deleting them.
    #[serde(default)]
    pub preserve_segments: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            db_name: String::new(),
            log_source_directory: PathBuf::new(),
            source_guid: None,
            apply_user: default_apply_user(),
            apply_idle_timeout_secs: default_apply_idle_timeout_secs(),
            apply_error_timeout_secs: default_apply_error_timeout_secs(),
            verbose_logging: false,
            preserve_segments: false,
        }
    }
}

impl TargetConfig {
    pub fn apply_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_idle_timeout_secs)
    }

    pub fn apply_error_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_error_timeout_secs)
    }
}

fn default_apply_user() -> String {
    "SYSDBA".to_string()
}

fn default_apply_idle_timeout_secs() -> u64 {
    10
}

fn default_apply_error_timeout_secs() -> u64 {
    60
}
