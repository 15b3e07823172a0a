use crate::peer::TrackKind;
use crate::session::CallStatus;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("relay is not connected")]
    NotConnected,

    #[error("relay connection closed")]
    Closed,
}

/// Failures reported by a peer connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RtcError {
    #[error("{operation} failed: {reason}")]
    Operation {
        operation: &'static str,
        reason: String,
    },

    #[error("unknown sender {0}")]
    UnknownSender(u32),

    #[error("peer connection is closed")]
    Closed,
}

impl RtcError {
    pub fn operation(operation: &'static str, reason: impl Into<String>) -> Self {
        RtcError::Operation {
            operation,
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("permission to use media devices was denied")]
    PermissionDenied,

    #[error("no {0:?} capture device available")]
    NotFound(TrackKind),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("a call in conversation {conversation_id} is already active")]
    SessionActive { conversation_id: String },

    #[error("no active call")]
    NoSession,

    #[error("invalid call transition from {from:?} to {to:?}")]
    InvalidTransition { from: CallStatus, to: CallStatus },

    #[error("adding a new {0:?} track requires renegotiation, which is not supported")]
    RenegotiationUnsupported(TrackKind),

    #[error("call manager has stopped")]
    Stopped,

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Rtc(#[from] RtcError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}
