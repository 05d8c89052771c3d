use thiserror::Error;

/// Main error type for the coordination core
#[derive(Error, Debug)]
pub enum ConcordError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    // Lookup errors
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    // Timing errors
    #[error("Timed out after {elapsed_ms}ms: {what}")]
    Timeout { what: String, elapsed_ms: u64 },

    // Workflow errors
    #[error("Step {step} failed: {reason}")]
    StepFailure { step: String, reason: String },

    #[error("Invalid workflow template {template}: {reason}")]
    InvalidTemplate { template: String, reason: String },

    #[error("Invalid state transition: from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // Agent errors
    #[error("Agent {agent_id} failed: {reason}")]
    Agent { agent_id: String, reason: String },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ConcordError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn agent(agent_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Agent {
            agent_id: agent_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error is a lookup miss rather than a real failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConcordError::NotFound { .. })
    }
}

/// Result type alias for ConcordError
pub type Result<T> = std::result::Result<T, ConcordError>;
