use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PmsError {
    #[error("Scope not found: {0}")]
    ScopeNotFound(String),
    #[error("Integrity check failed for '{scope}': expected {expected}, found {actual}")]
    Integrity {
        scope: String,
        expected: String,
        actual: String,
    },
    #[error("Permission denied: {agent} cannot {operation} '{scope}'")]
    Permission {
        agent: String,
        operation: String,
        scope: String,
    },
    #[error("Agent not found: {0}")]
    AgentNotFound(String),
    #[error("Transaction failed for '{scope}': {reason}")]
    Transaction { scope: String, reason: String },
    #[error("Timed out after {waited_ms}ms waiting for lock on '{scope}'")]
    Timeout { scope: String, waited_ms: u64 },
    #[error("Invalid transition for proposal {id}: {from} -> {to}")]
    InvalidTransition { id: u64, from: String, to: String },
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl PmsError {
    pub fn transaction(scope: &str, reason: impl Into<String>) -> Self {
        PmsError::Transaction {
            scope: scope.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable snake_case code for audit reasons and JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            PmsError::ScopeNotFound(_) => "scope_not_found",
            PmsError::Integrity { .. } => "integrity",
            PmsError::Permission { .. } => "permission",
            PmsError::AgentNotFound(_) => "agent_not_found",
            PmsError::Transaction { .. } => "transaction",
            PmsError::Timeout { .. } => "timeout",
            PmsError::InvalidTransition { .. } => "invalid_transition",
            PmsError::IoError(_) => "io",
            PmsError::ConfigError(_) => "config",
            PmsError::CsvError(_) => "csv",
            PmsError::ValidationError(_) => "validation",
        }
    }

    /// Lock contention is the only transient failure; everything else is terminal for the call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PmsError::Timeout { .. })
    }
}

impl From<toml::de::Error> for PmsError {
    fn from(e: toml::de::Error) -> Self {
        PmsError::ConfigError(e.to_string())
    }
}

impl From<serde_json::Error> for PmsError {
    fn from(e: serde_json::Error) -> Self {
        PmsError::ConfigError(e.to_string())
    }
}
