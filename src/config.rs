use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound for every configured timeout (one week)
pub const MAX_TIMEOUT_SECS: u64 = 7 * 24 * 3600;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Message hub settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Bounded inbox size per agent
    pub inbox_capacity: usize,
    /// Number of routed messages kept in the history ring
    pub history_capacity: usize,
    /// Deadline for a capability request (seconds)
    pub request_timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: 1_000,
            history_capacity: 1_000,
            request_timeout_secs: 300, // 5 minutes
        }
    }
}

impl HubConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Consensus engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Endpoint id the engine registers with on the hub
    pub engine_id: String,
    /// Timeout used when a caller does not pass one (seconds)
    pub default_timeout_secs: u64,
    /// Minimum votes before MAJORITY / SUPERMAJORITY may resolve
    pub quorum: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            engine_id: "consensus_engine".to_string(),
            default_timeout_secs: 600, // 10 minutes
            quorum: 3,
        }
    }
}

impl ConsensusConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

/// How a consensus-gated workflow step relates to its proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStepMode {
    /// Block the workflow until the proposal resolves; only approval succeeds
    #[default]
    Await,
    /// Record the proposal handle and continue immediately
    FireAndForget,
}

/// Workflow engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Sender id used for capability requests and proposals
    pub coordinator_id: String,
    /// Proposal timeout for consensus steps (seconds)
    pub consensus_timeout_secs: u64,
    pub consensus_step_mode: ConsensusStepMode,
    /// Number of finished workflows kept for status queries
    pub history_capacity: usize,
    /// Optional TOML file with extra workflow templates
    pub templates_file: Option<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            coordinator_id: "treasury_coordinator".to_string(),
            consensus_timeout_secs: 1_800, // 30 minutes
            consensus_step_mode: ConsensusStepMode::Await,
            history_capacity: 1_000,
            templates_file: None,
        }
    }
}

impl WorkflowConfig {
    pub fn consensus_timeout(&self) -> Duration {
        Duration::from_secs(self.consensus_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives, e.g. `info` or `warn,concord::hub=debug`
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info,concord=debug".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info,concord=debug")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CONCORD_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (CONCORD_HUB__INBOX_CAPACITY, etc.)
            .add_source(
                Environment::with_prefix("CONCORD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.hub.inbox_capacity == 0 {
            errors.push("hub.inbox_capacity must be positive".to_string());
        }
        if self.hub.history_capacity == 0 {
            errors.push("hub.history_capacity must be positive".to_string());
        }
        if self.hub.request_timeout_secs == 0 {
            errors.push("hub.request_timeout_secs must be positive".to_string());
        }
        if self.hub.request_timeout_secs > MAX_TIMEOUT_SECS {
            errors.push(format!(
                "hub.request_timeout_secs must be at most {}",
                MAX_TIMEOUT_SECS
            ));
        }
        if self.consensus.quorum == 0 {
            errors.push("consensus.quorum must be at least 1".to_string());
        }
        if self.consensus.default_timeout_secs == 0 {
            errors.push("consensus.default_timeout_secs must be positive".to_string());
        }
        if self.consensus.default_timeout_secs > MAX_TIMEOUT_SECS {
            errors.push(format!(
                "consensus.default_timeout_secs must be at most {}",
                MAX_TIMEOUT_SECS
            ));
        }
        if self.consensus.engine_id.trim().is_empty() {
            errors.push("consensus.engine_id must not be empty".to_string());
        }
        if self.workflow.coordinator_id.trim().is_empty() {
            errors.push("workflow.coordinator_id must not be empty".to_string());
        }
        if self.workflow.coordinator_id == self.consensus.engine_id {
            errors.push("workflow.coordinator_id must differ from consensus.engine_id".to_string());
        }
        if self.workflow.consensus_timeout_secs == 0 {
            errors.push("workflow.consensus_timeout_secs must be positive".to_string());
        }
        if self.workflow.consensus_timeout_secs > MAX_TIMEOUT_SECS {
            errors.push(format!(
                "workflow.consensus_timeout_secs must be at most {}",
                MAX_TIMEOUT_SECS
            ));
        }
        if self.workflow.history_capacity == 0 {
            errors.push("workflow.history_capacity must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.hub.request_timeout(), Duration::from_secs(300));
        assert_eq!(config.workflow.consensus_timeout(), Duration::from_secs(1800));
        assert_eq!(config.consensus.quorum, 3);
        assert_eq!(config.workflow.consensus_step_mode, ConsensusStepMode::Await);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = AppConfig::default();
        config.hub.inbox_capacity = 0;
        config.consensus.quorum = 0;
        config.workflow.coordinator_id = config.consensus.engine_id.clone();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_validate_rejects_unbounded_timeouts() {
        let mut config = AppConfig::default();
        config.hub.request_timeout_secs = u64::MAX;
        config.consensus.default_timeout_secs = MAX_TIMEOUT_SECS + 1;
        config.workflow.consensus_timeout_secs = u64::MAX;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors[0].starts_with("hub.request_timeout_secs"));

        config.hub.request_timeout_secs = MAX_TIMEOUT_SECS;
        config.consensus.default_timeout_secs = MAX_TIMEOUT_SECS;
        config.workflow.consensus_timeout_secs = MAX_TIMEOUT_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            r#"
[hub]
inbox_capacity = 16

[consensus]
quorum = 5

[workflow]
consensus_step_mode = "fire_and_forget"
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(config.hub.inbox_capacity, 16);
        // Unset fields keep their defaults
        assert_eq!(config.hub.history_capacity, 1_000);
        assert_eq!(config.consensus.quorum, 5);
        assert_eq!(config.consensus.engine_id, "consensus_engine");
        assert_eq!(
            config.workflow.consensus_step_mode,
            ConsensusStepMode::FireAndForget
        );
        assert_eq!(config.logging.level, "info,concord=debug");
    }

    #[test]
    fn test_load_from_missing_directory_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load_from(dir.path().join("nope")).unwrap();
        assert_eq!(config.hub.inbox_capacity, 1_000);
        assert!(config.workflow.templates_file.is_none());
    }
}
