use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Top-level error for loading, compiling and running Schematron validation
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status error: {status} for {url} - {message}")]
    HttpStatus {
        url: String,
        status: u16,
        message: String,
    },

    #[error("Request timeout: {url} after {timeout_seconds} seconds")]
    Timeout { url: String, timeout_seconds: u64 },

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Scope error: {0}")]
    Scope(#[from] ScopeError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Schema not found: {url}")]
    SchemaNotFound { url: String },

    #[error("No Schematron schema referenced by {file}")]
    SchemaReferenceNotFound { file: PathBuf },

    #[error("Instance document is not well-formed: {file} - {details}")]
    InstanceParsing { file: PathBuf, details: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File system traversal error: {path} - {reason}")]
    FileSystemTraversal { path: PathBuf, reason: String },

    #[error("Concurrent operation error: {details}")]
    Concurrency { details: String },

    #[error("Validation cancelled")]
    Cancelled,

    /// An error produced once and handed to every waiter on a shared cache
    /// entry.
    #[error(transparent)]
    Shared(Arc<ValidationError>),
}

/// Structural and reference errors found while reading or compiling a schema
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Schema is not well-formed XML: {0}")]
    Xml(String),

    #[error("Malformed schema: {0}")]
    Malformed(String),

    #[error("Unsupported query binding: {0}")]
    UnsupportedQueryBinding(String),

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    #[error("Duplicate pattern id: {0}")]
    DuplicatePatternId(String),

    #[error("Pattern '{pattern}' references unknown abstract pattern '{base}'")]
    UnresolvedPattern { pattern: String, base: String },

    #[error("Rule '{rule}' extends unknown rule '{target}'")]
    UnresolvedRule { rule: String, target: String },

    #[error("Phase '{phase}' activates unknown pattern '{pattern}'")]
    UnknownActivePattern { phase: String, pattern: String },

    #[error("Phase '{phase}' activates abstract pattern '{pattern}'")]
    AbstractActivePattern { phase: String, pattern: String },

    #[error("Pattern '{pattern}' does not supply parameter '{parameter}' required by '{base}'")]
    MissingParameter {
        pattern: String,
        base: String,
        parameter: String,
    },

    #[error("Cyclic rule extension: {}", .chain.join(" -> "))]
    CyclicExtension { chain: Vec<String> },
}

/// Misuse of the variable scope stack
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    #[error("Scope popped without a matching push")]
    Underflow,

    #[error("Variable '{name}' is already bound in this scope")]
    DuplicateBinding { name: String },
}

/// Failure to compile or evaluate a query expression
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Cannot compile '{expression}': {details}")]
    Compile { expression: String, details: String },

    #[error("Evaluating '{expression}' failed: {details}")]
    Execution { expression: String, details: String },

    #[error("Unknown variable: ${0}")]
    UnknownVariable(String),

    #[error("Variable ${0} depends on itself")]
    CircularVariable(String),
}

/// Syntax error in an XPath expression
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Syntax error in '{expression}' at offset {offset}: {message}")]
pub struct ParseError {
    pub expression: String,
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(expression: &str, offset: usize, message: impl Into<String>) -> Self {
        Self {
            expression: expression.to_string(),
            offset,
            message: message.into(),
        }
    }
}

impl From<crate::config::ConfigError> for ValidationError {
    fn from(err: crate::config::ConfigError) -> Self {
        ValidationError::Config(err.to_string())
    }
}

impl From<Arc<ValidationError>> for ValidationError {
    fn from(err: Arc<ValidationError>) -> Self {
        ValidationError::Shared(err)
    }
}

impl ValidationError {
    /// Structural problems with the schema itself, as opposed to the instance
    /// or the environment.
    pub fn is_schema_error(&self) -> bool {
        match self {
            ValidationError::Schema(_) => true,
            ValidationError::Shared(inner) => inner.is_schema_error(),
            _ => false,
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ValidationError>;

/// Schema result type alias
pub type SchemaResult<T> = std::result::Result<T, SchemaError>;

/// Evaluation result type alias
pub type EvalResult<T> = std::result::Result<T, EvaluationError>;
