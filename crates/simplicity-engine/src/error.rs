//! Error types for the analysis engine.
//!
//! Uses `thiserror` for typed errors that surface through the whole
//! pipeline: configuration, prompt rendering, backend calls, response
//! parsing, stage validation, and ingestion input checks.

/// Errors that can occur during engine operation.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration is invalid or missing.
    #[error("config error: {0}")]
    Config(String),

    /// Failed to render a prompt template.
    #[error("template render error: {0}")]
    Template(String),

    /// The generative-analysis backend returned an error or was unreachable.
    #[error("analysis backend error: {0}")]
    Backend(String),

    /// The backend response could not be parsed into the stage contract.
    #[error("response parse error: {0}")]
    Parse(String),

    /// A stage result violated a structural invariant (e.g. one agent
    /// position claimed by two structures).
    #[error("stage validation failed: {0}")]
    Validation(String),

    /// Ingestion input was rejected (missing agent id, malformed image).
    #[error("invalid input: {0}")]
    Input(String),

    /// Serialization or deserialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}
