use thiserror::Error;

use crate::mode::VehicleType;
use crate::protocol::AckResult;

/// Everything a caller of the session core can get back as a failure.
///
/// Variants are `Clone` because a single transport failure is fanned out to
/// every outstanding command.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    // local, surfaced immediately
    #[error("invalid connection parameter: {message}")]
    InvalidParameter { message: String },

    #[error("a connection is already active or being established")]
    AlreadyConnected,

    #[error("vehicle is not connected")]
    NotConnected,

    #[error("mode {mode:?} is not valid for a {vehicle_type} vehicle")]
    InvalidMode {
        vehicle_type: VehicleType,
        mode: String,
    },

    #[error("no heartbeat received within {timeout_ms}ms")]
    HandshakeTimeout { timeout_ms: u64 },

    #[error("connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("command {seq} was not acknowledged within {timeout_ms}ms")]
    CommandTimeout { seq: u16, timeout_ms: u64 },

    #[error("command {seq} was rejected by the vehicle: {result}")]
    CommandRejected { seq: u16, result: AckResult },

    #[error("cannot encode frame: {message}")]
    Encode { message: String },

    #[error("vehicle or home position is not available")]
    PositionUnavailable,
}

impl Error {
    pub(crate) fn invalid_parameter(message: impl Into<String>) -> Self {
        Error::InvalidParameter {
            message: message.into(),
        }
    }

    pub(crate) fn connection_lost(reason: impl Into<String>) -> Self {
        Error::ConnectionLost {
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
