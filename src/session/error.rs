//! Error definitions for the session engine

use thiserror::Error;

use super::parameter::ParamType;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Connect, publish or subscribe failed at the transport level
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Inbound JSON did not parse or lacked a required field
    #[error("Malformed message on {topic}: {reason}")]
    MalformedMessage { topic: String, reason: String },

    #[error("Parameter not found: {0}")]
    ParameterNotFound(String),

    /// A value could not be represented as the declared type
    #[error("Cannot coerce {value} to {target}")]
    Coercion { value: String, target: ParamType },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// `send_data` was called after the broker rejected our credentials
    #[error("Refusing to send data: session failed authentication")]
    SendAfterFailure,
}
