use parley_core::{BrokerError, InvalidCursorMode, InvalidFormFactor};
use parley_protocol::ProtocolError;
use parley_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the conversation service.
///
/// Only durable failures and caller mistakes appear here; cache, fan-out
/// and push failures are logged and swallowed.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The caller may not act on this conversation or channel.
    #[error("Not allowed")]
    NotAllowed,

    #[error(transparent)]
    InvalidFormFactor(#[from] InvalidFormFactor),

    #[error(transparent)]
    InvalidCursorMode(#[from] InvalidCursorMode),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ServiceError {
    /// Whether the error names a missing record.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, ServiceError::Store(StoreError::NotFound))
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
