// ============================================================================
// SECTION 5: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error enum per subsystem, folded into `AgentError` through `#[from]`.
// Only configuration and wiring errors are fatal; everything raised while the
// pipeline runs is counted, logged and contained to the plugin that raised it.
// ============================================================================

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// ----------------------------------------------------------------------------
// 5.1 Root Error Type
// ----------------------------------------------------------------------------

/// Root error type for the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] SerializeError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            AgentError::Config(_) => "config",
            AgentError::Input(_) => "input",
            AgentError::Output(_) => "output",
            AgentError::Serialize(_) => "serialize",
            AgentError::Parse(_) => "parse",
            AgentError::Io(_) => "io",
            AgentError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors raised while loading configuration or wiring plugins
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Unknown {kind} plugin type '{name}'")]
    UnknownPlugin { kind: &'static str, name: String },

    #[error("Invalid options for plugin '{plugin}': {message}")]
    InvalidOptions { plugin: String, message: String },

    #[error("Duplicate {kind} plugin registration '{name}'")]
    DuplicatePlugin { kind: &'static str, name: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_options(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidOptions {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::ParseError {
            message: e.to_string(),
        }
    }
}

impl From<validator::ValidationErrors> for ConfigError {
    fn from(e: validator::ValidationErrors) -> Self {
        ConfigError::ValidationFailed {
            message: e.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.3 Input Errors
// ----------------------------------------------------------------------------

/// Non-fatal errors raised during a collection cycle
#[derive(Error, Debug)]
pub enum InputError {
    #[error("Collection failed for '{input}': {message}")]
    CollectionFailed { input: String, message: String },

    #[error("Collection for '{input}' not complete after {timeout_ms}ms")]
    Timeout { input: String, timeout_ms: u64 },

    #[error("Input '{name}' panicked: {message}")]
    Panicked { name: String, message: String },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl InputError {
    pub fn collection_failed(input: impl Into<String>, message: impl Into<String>) -> Self {
        InputError::CollectionFailed {
            input: input.into(),
            message: message.into(),
        }
    }

    pub fn timeout(input: impl Into<String>, timeout_ms: u64) -> Self {
        InputError::Timeout {
            input: input.into(),
            timeout_ms,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.4 Output Errors
// ----------------------------------------------------------------------------

/// Errors returned by an output's `connect` or `write`
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to connect to output '{name}': {message}")]
    ConnectionFailed { name: String, message: String },

    #[error("Failed to write to output '{name}': {message}")]
    WriteFailed { name: String, message: String },

    #[error("Output '{name}' is not ready")]
    NotReady { name: String },

    #[error("Output '{name}' rejected the payload: {message}")]
    Rejected { name: String, message: String },

    #[error("Output '{name}' is misconfigured: {message}")]
    InvalidConfig { name: String, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl OutputError {
    /// Retryable errors requeue the batch and back off; the rest drop it.
    pub fn is_retryable(&self) -> bool {
        match self {
            OutputError::ConnectionFailed { .. } => true,
            OutputError::WriteFailed { .. } => true,
            OutputError::NotReady { .. } => true,
            OutputError::Rejected { .. } => false,
            OutputError::InvalidConfig { .. } => false,
            OutputError::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::InvalidInput
                    | io::ErrorKind::InvalidData
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::Unsupported
            ),
        }
    }

    pub fn write_failed(name: impl Into<String>, message: impl Into<String>) -> Self {
        OutputError::WriteFailed {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn rejected(name: impl Into<String>, message: impl Into<String>) -> Self {
        OutputError::Rejected {
            name: name.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 5.5 Serializer & Parser Errors
// ----------------------------------------------------------------------------

/// Serialization failures; never retried, the batch is dropped
#[derive(Error, Debug)]
pub enum SerializeError {
    #[error("Metric '{metric}' has no fields")]
    NoFields { metric: String },

    #[error("Field '{field}' of metric '{metric}' cannot be encoded: {reason}")]
    UnsupportedValue {
        metric: String,
        field: String,
        reason: String,
    },

    #[error("Encoding failed: {message}")]
    Encode { message: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors raised while turning raw payloads into metrics
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Invalid input at line {line}: {message}")]
    InvalidLine { line: usize, message: String },

    #[error("Payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

// ----------------------------------------------------------------------------
// 5.6 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for agent operations
pub type AgentResult<T> = Result<T, AgentError>;

/// Result type for configuration loading and plugin wiring
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Result type for input gather cycles
pub type InputResult<T> = Result<T, InputError>;

/// Result type for output operations
pub type OutputResult<T> = Result<T, OutputError>;

/// Result type for serializers
pub type SerializeResult<T> = Result<T, SerializeError>;

/// Result type for parsers
pub type ParseResult<T> = Result<T, ParseError>;
