//! Error types for the synced-state layer
//!
//! One enum per component, unified under [`SyncError`] for callers that
//! want a single error type.

use thiserror::Error;

use crate::transport::ContextId;

/// Main error type for the synced-state layer
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Value for key '{key}' could not be encoded: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Stored schema version {stored} does not match expected version {expected}")]
    SchemaMismatch { stored: u32, expected: u32 },

    #[error("Must be called from within a tokio runtime")]
    NoRuntime,
}

/// Errors from durable key/value storage
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store file is not a JSON object: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Persistence queue is closed")]
    QueueClosed,
}

/// Errors from cross-context message passing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Target context unreachable: {0}")]
    Unreachable(ContextId),

    #[error("Send to {target} rejected: {reason}")]
    Rejected { target: ContextId, reason: String },
}

/// Errors from execution-context classification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("Unable to determine the execution context: no capability probe matched")]
    Unclassified,

    #[error("Unknown context kind '{0}'")]
    UnknownKind(String),
}

/// Errors while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {var}: {message}")]
    InvalidVar { var: &'static str, message: String },

    #[error("Environment error: {0}")]
    Environment(#[from] EnvironmentError),
}

/// Result alias used across the crate
pub type SyncResult<T> = Result<T, SyncError>;
