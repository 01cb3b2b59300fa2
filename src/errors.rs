//! internal error types; none of them ever crosses the C boundary

use thiserror::Error;

/// malformed or partially specified fault configuration
///
/// every variant resolves to the affected fault being disarmed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var} is not valid unicode")]
    NotUnicode { var: &'static str },

    #[error("{var}={value:?} is not an integer")]
    InvalidInteger { var: &'static str, value: String },

    #[error("{var}={value} is out of range")]
    OutOfRange { var: &'static str, value: i64 },

    #[error("{var} is set but {companion} is missing")]
    MissingCompanion {
        var: &'static str,
        companion: &'static str,
    },

    #[error("{var}={value:?} is not a percentage between 0 and 100")]
    InvalidProbability { var: &'static str, value: String },
}

/// the real implementation of an intercepted symbol could not be bound
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("could not find real '{symbol}': {reason}")]
    NotFound { symbol: String, reason: String },

    #[error("only the injector's own '{symbol}' is visible")]
    SelfReference { symbol: String },
}
