//! Error types.

use thiserror::Error;

use crate::database::ScopeId;

/// Errors raised by the scoped singleton registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The type was never registered at startup.
    #[error("type {0} is not registered as a scoped singleton")]
    Unregistered(&'static str),

    /// The type was registered twice.
    #[error("type {0} is already registered")]
    AlreadyRegistered(&'static str),

    /// The factory produced a value of another type.
    #[error("factory for {0} produced a value of a different type")]
    TypeMismatch(&'static str),

    /// Resolving the type required resolving itself.
    #[error("cyclic construction of {0}")]
    Cycle(&'static str),
}

/// Errors raised by a raw cache store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The payload is bigger than the store accepts.
    #[error("entry '{key}' is {size} bytes, limit is {limit}")]
    EntryTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },

    /// The backend could not be reached.
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by the transaction wrapper.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransactionError {
    #[error("no transaction or savepoint is active")]
    NoActiveScope,

    /// A block closed its own scope before returning.
    #[error("{0} was closed before its block returned")]
    Unbalanced(ScopeId),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: '{value}'")]
    Invalid { name: &'static str, value: String },
}
