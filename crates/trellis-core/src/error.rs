use std::fmt;

use thiserror::Error;

/// A single field-level problem found by a schema check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldIssue {
    /// Dotted path to the offending field (`forecast.days[2].max`), or `$` for the root.
    pub path: String,
    pub message: String,
}

impl FieldIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum TrellisError {
    // Engine errors
    #[error("Schema validation failed for {target}: {}", join_issues(.issues))]
    SchemaValidation {
        target: String,
        issues: Vec<FieldIssue>,
    },

    #[error("Workflow composition error: {0}")]
    Composition(String),

    #[error("No branch matched in workflow '{workflow}' at stage {stage}")]
    NoBranchMatched { workflow: String, stage: usize },

    #[error("Run cancelled")]
    Cancelled,

    // Agent errors
    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    // Routing errors
    #[error("No route found: {0}")]
    NoRouteFound(String),

    // LLM transport errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    // External collaborator errors
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Location '{0}' not found")]
    LocationNotFound(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrellisError {
    /// Shorthand for a schema failure against a named target.
    pub fn schema(target: impl Into<String>, issues: Vec<FieldIssue>) -> Self {
        Self::SchemaValidation {
            target: target.into(),
            issues,
        }
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;
