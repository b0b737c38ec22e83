//! Error types, one enum per boundary.

use crate::peer::media::AcquisitionAttempt;
use crate::peer::state::InvalidTransition;
use thiserror::Error;

/// Raw classification reported by a capture device.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("insecure context")]
    InsecureContext,

    #[error("permission denied")]
    PermissionDenied,

    #[error("device not found")]
    DeviceNotFound,

    #[error("device busy or unreadable")]
    DeviceBusyOrUnreadable,

    #[error("overconstrained request")]
    OverconstrainedRequest,

    #[error("platform error: {0}")]
    Platform(String),
}

/// Media failure surfaced to the UI, with a stable code for localized messaging.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("media capture requires a secure context")]
    InsecureContext,

    #[error("media permission denied")]
    PermissionDenied,

    #[error("no capture device found")]
    DeviceNotFound,

    #[error("media acquisition failed")]
    AcquisitionFailed,
}

impl MediaError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InsecureContext => "insecure_context",
            Self::PermissionDenied => "permission_denied",
            Self::DeviceNotFound => "device_not_found",
            Self::AcquisitionFailed => "media_acquisition_failed",
        }
    }
}

impl From<&DeviceError> for MediaError {
    fn from(err: &DeviceError) -> Self {
        match err {
            DeviceError::InsecureContext => Self::InsecureContext,
            DeviceError::PermissionDenied => Self::PermissionDenied,
            DeviceError::DeviceNotFound => Self::DeviceNotFound,
            DeviceError::DeviceBusyOrUnreadable
            | DeviceError::OverconstrainedRequest
            | DeviceError::Platform(_) => Self::AcquisitionFailed,
        }
    }
}

/// A failed acquisition together with the attempts it took.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{error} after {} attempt(s)", .attempt.attempts)]
pub struct AcquireError {
    pub error: MediaError,
    pub attempt: AcquisitionAttempt,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{op} failed: {detail}")]
    Operation { op: &'static str, detail: String },

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn op(op: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Operation {
            op,
            detail: err.to_string(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("no active transport")]
    NoActiveTransport,

    #[error("local media not attached")]
    MediaNotAttached,

    #[error("local description already produced")]
    LocalDescriptionExists,

    #[error("out of order: {0}")]
    OutOfOrder(&'static str),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("signaling channel closed")]
    Closed,

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),
}

/// Errors returned by the public call API.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("busy with a call to {0}")]
    Busy(String),

    #[error("call not found: {0}")]
    NotFound(String),

    #[error("session closed")]
    SessionClosed,

    #[error("no local media")]
    NoLocalMedia,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid session state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

impl CallError {
    /// Stable code for UI messaging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Busy(_) => "busy",
            Self::NotFound(_) => "not_found",
            Self::SessionClosed => "session_closed",
            Self::NoLocalMedia => "no_local_media",
            Self::Config(_) => "config",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Media(e) => e.code(),
            Self::Negotiation(NegotiationError::NoActiveTransport) => "no_active_transport",
            Self::Negotiation(_) => "negotiation_failed",
            Self::Transport(_) => "transport",
            Self::Signaling(_) => "signaling",
        }
    }
}
