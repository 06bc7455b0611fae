//! Error types for the ESB client

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when using the ESB client
///
/// The type is `Clone` because a single outcome (a login or a subscription)
/// may be awaited by several callers at once.
#[derive(Error, Debug, Clone)]
pub enum EsbError {
    /// The underlying byte stream failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame could not be decoded, or a reply violated the protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A message was built from structurally invalid input
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// A send was attempted without any login having been started
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The remote side answered with `FAILURE`
    #[error("RPC failed: {reason}")]
    RpcFailure { reason: String },

    /// No correlated reply arrived in time
    #[error("RPC timed out after {0:?}")]
    RpcTimeout(Duration),

    /// Not currently connected to the bus
    #[error("Not connected")]
    NotConnected,

    /// Failed to serialize a message
    #[error("Serialization error: {0}")]
    Serialization(Arc<serde_json::Error>),

    /// The client has been shut down
    #[error("Client shut down")]
    Shutdown,
}

impl From<serde_json::Error> for EsbError {
    fn from(err: serde_json::Error) -> Self {
        EsbError::Serialization(Arc::new(err))
    }
}

impl EsbError {
    /// Remote-supplied reason for an RPC failure, if this is one
    pub fn reason(&self) -> Option<&str> {
        match self {
            EsbError::RpcFailure { reason } => Some(reason),
            _ => None,
        }
    }
}

/// Result type for ESB operations
pub type Result<T> = std::result::Result<T, EsbError>;
