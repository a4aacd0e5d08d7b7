//! Error handling for the Luna compiler.
//!
//! All compiler stages report failures through [`LunaError`]; there is no
//! unwinding. A message already carries its `chunk:line:` prefix when it
//! is built, so callers can surface it verbatim.

use thiserror::Error;

/// The main error type for the Luna compiler.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LunaError {
    #[error("{message}")]
    Lexical { message: String },

    #[error("{message}")]
    Syntax { message: String },

    #[error("{message}")]
    Semantic { message: String },

    /// A hard limit of the bytecode format was exceeded
    /// (registers, constants, upvalues, jump range, ...).
    #[error("{message}")]
    Limit { message: String },

    /// Malformed binary chunk detected by the loader.
    #[error("{message}")]
    BadBinary { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },
}

/// Result type alias for Luna compiler operations.
pub type LunaResult<T> = Result<T, LunaError>;

impl LunaError {
    pub fn lexical(message: impl Into<String>) -> Self {
        Self::Lexical { message: message.into() }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::Syntax { message: message.into() }
    }

    pub fn semantic(message: impl Into<String>) -> Self {
        Self::Semantic { message: message.into() }
    }

    pub fn limit(message: impl Into<String>) -> Self {
        Self::Limit { message: message.into() }
    }

    pub fn bad_binary(message: impl Into<String>) -> Self {
        Self::BadBinary { message: message.into() }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io { message: message.into() }
    }

    /// The raw message, without the variant's framing.
    pub fn message(&self) -> &str {
        match self {
            Self::Lexical { message }
            | Self::Syntax { message }
            | Self::Semantic { message }
            | Self::Limit { message }
            | Self::BadBinary { message }
            | Self::Io { message } => message,
        }
    }
}

impl From<std::io::Error> for LunaError {
    fn from(e: std::io::Error) -> Self {
        Self::Io { message: e.to_string() }
    }
}
