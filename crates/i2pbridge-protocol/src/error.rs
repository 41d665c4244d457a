//! Grammar error types

use thiserror::Error;

/// Errors raised while tokenizing router output
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GrammarError {
    #[error("Malformed line: {0:?}")]
    MalformedLine(String),

    #[error("Unexpected reply {found:?}, expected {expected}")]
    UnexpectedReply { expected: &'static str, found: String },

    #[error("Missing field {field} in {line:?}")]
    MissingField { field: &'static str, line: String },

    #[error("Invalid value {value:?} for field {field}")]
    InvalidField { field: &'static str, value: String },

    #[error("Line is not valid UTF-8")]
    InvalidUtf8,
}

/// Result type for grammar operations
pub type Result<T> = std::result::Result<T, GrammarError>;
