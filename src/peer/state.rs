//! Session state machine.
//!
//! ```text
//! Idle → AcquiringMedia → Negotiating → Connected ⇄ Recovering
//!              ↓               ↓                        ↓
//!           Failed          Failed                   Failed → Closed
//! ```
//! Every non-terminal state can be hung up into `Closed`.

use crate::error::MediaError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Media(MediaError),
    NegotiationFailed,
    ConnectionLost,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Media(e) => e.code(),
            Self::NegotiationFailed => "negotiation_failed",
            Self::ConnectionLost => "connection_lost",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    AcquiringMedia,
    Negotiating,
    Connected,
    Recovering,
    Closed,
    Failed(FailureReason),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Apply a transition, returning the next state or the rejected pair.
    pub fn apply(&self, transition: &SessionTransition) -> Result<SessionState, InvalidTransition> {
        use SessionState as S;
        use SessionTransition as T;

        let next = match (self, transition) {
            (S::Idle, T::Start) => S::AcquiringMedia,
            (S::AcquiringMedia, T::MediaReady) => S::Negotiating,
            (S::AcquiringMedia, T::MediaFailed(e)) => S::Failed(FailureReason::Media(e.clone())),
            (S::AcquiringMedia | S::Negotiating, T::NegotiationFailed) => {
                S::Failed(FailureReason::NegotiationFailed)
            }
            (S::Negotiating, T::LinkUp) => S::Connected,
            (S::Connected, T::RestartAttempted) => S::Recovering,
            (S::Recovering, T::LinkUp) => S::Connected,
            (S::Connected | S::Recovering, T::LinkLost) => {
                S::Failed(FailureReason::ConnectionLost)
            }
            (state, T::HangUp) if state.is_live() => S::Closed,
            (S::Failed(_), T::Acknowledge) => S::Closed,
            (state, transition) => {
                return Err(InvalidTransition {
                    from: state.clone(),
                    transition: transition.name(),
                })
            }
        };
        Ok(next)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::AcquiringMedia => f.write_str("acquiring_media"),
            Self::Negotiating => f.write_str("negotiating"),
            Self::Connected => f.write_str("connected"),
            Self::Recovering => f.write_str("recovering"),
            Self::Closed => f.write_str("closed"),
            Self::Failed(reason) => write!(f, "failed({})", reason.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTransition {
    Start,
    MediaReady,
    MediaFailed(MediaError),
    NegotiationFailed,
    LinkUp,
    RestartAttempted,
    LinkLost,
    HangUp,
    Acknowledge,
}

impl SessionTransition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::MediaReady => "media_ready",
            Self::MediaFailed(_) => "media_failed",
            Self::NegotiationFailed => "negotiation_failed",
            Self::LinkUp => "link_up",
            Self::RestartAttempted => "restart_attempted",
            Self::LinkLost => "link_lost",
            Self::HangUp => "hang_up",
            Self::Acknowledge => "acknowledge",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{transition} is not valid in state {from}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub transition: &'static str,
}
