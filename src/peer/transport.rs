//! Transport seam between the session logic and the peer connection.

use crate::error::TransportError;
use crate::peer::media::LocalTrack;
use crate::peer::types::{IceCandidate, LinkState, RemoteTrack, SessionDescription, TrackKind};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events a transport reports back to its session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    GatheringComplete,
    LinkState(LinkState),
    RemoteTrack(RemoteTrack),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a local track for sending and receiving.
    async fn add_local_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), TransportError>;

    /// Keep receiving `kind` even without a local track of that kind.
    async fn add_receive_only(&self, kind: TrackKind) -> Result<(), TransportError>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    fn link_state(&self) -> LinkState;

    /// Detach every event handler and close. Must be safe to call twice.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        session_id: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}
