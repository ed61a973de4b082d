use thiserror::Error;

/// Source position carried by errors that originate from a specific piece of
/// SQL text. Line and column are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLocation {
    pub line: u64,
    pub column: u64,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

#[derive(Error, Debug, Clone)]
pub enum QuereusError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("planning error: {message}")]
    Planning {
        message: String,
        location: Option<SourceLocation>,
    },

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("misuse: {0}")]
    Misuse(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl QuereusError {
    pub fn planning(message: impl Into<String>) -> Self {
        QuereusError::Planning {
            message: message.into(),
            location: None,
        }
    }

    pub fn planning_at(message: impl Into<String>, location: SourceLocation) -> Self {
        QuereusError::Planning {
            message: message.into(),
            location: Some(location),
        }
    }

    /// Constraint errors interact with the DML conflict policy; everything
    /// else propagates unchanged.
    pub fn is_constraint(&self) -> bool {
        matches!(self, QuereusError::Constraint(_))
    }
}

pub type Result<T> = std::result::Result<T, QuereusError>;

impl From<sqlparser::parser::ParserError> for QuereusError {
    fn from(e: sqlparser::parser::ParserError) -> Self {
        QuereusError::Parse(e.to_string())
    }
}

impl From<serde_json::Error> for QuereusError {
    fn from(e: serde_json::Error) -> Self {
        QuereusError::Runtime(e.to_string())
    }
}
