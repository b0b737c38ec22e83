//! Offer/answer exchange for one session.

use crate::error::NegotiationError;
use crate::peer::ice::CandidateBuffer;
use crate::peer::media::LocalTrack;
use crate::peer::transport::Transport;
use crate::peer::types::{MediaKind, SessionDescription};
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Negotiator {
    transport: Mutex<Option<Arc<dyn Transport>>>,
    candidates: Arc<CandidateBuffer>,
    media_attached: AtomicBool,
    local_produced: AtomicBool,
    remote: Mutex<Option<SessionDescription>>,
}

impl Negotiator {
    pub fn new(candidates: Arc<CandidateBuffer>) -> Self {
        Self {
            transport: Mutex::new(None),
            candidates,
            media_attached: AtomicBool::new(false),
            local_produced: AtomicBool::new(false),
            remote: Mutex::new(None),
        }
    }

    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *self.transport.lock() = Some(transport);
    }

    pub fn detach(&self) {
        self.transport.lock().take();
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote.lock().is_some()
    }

    fn transport(&self) -> Result<Arc<dyn Transport>, NegotiationError> {
        self.transport
            .lock()
            .clone()
            .ok_or(NegotiationError::NoActiveTransport)
    }

    /// Binds local tracks; kinds requested but not captured stay receive-only.
    pub async fn attach_media(
        &self,
        tracks: &[Arc<dyn LocalTrack>],
        requested: MediaKind,
    ) -> Result<(), NegotiationError> {
        let transport = self.transport()?;
        for track in tracks {
            debug!("Attaching local {:?} track {}", track.kind(), track.id());
            transport.add_local_track(track.clone()).await?;
        }
        for kind in requested.track_kinds() {
            if !tracks.iter().any(|t| t.kind() == *kind) {
                info!("No local {:?} track, receiving only", kind);
                transport.add_receive_only(*kind).await?;
            }
        }
        self.media_attached.store(true, Ordering::Release);
        Ok(())
    }

    /// The offer is already the active local description when this returns.
    pub async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let transport = self.transport()?;
        if !self.media_attached.load(Ordering::Acquire) {
            return Err(NegotiationError::MediaNotAttached);
        }
        if self.local_produced.swap(true, Ordering::AcqRel) {
            return Err(NegotiationError::LocalDescriptionExists);
        }
        let offer = transport.create_offer(false).await?;
        transport.set_local_description(offer.clone()).await?;
        info!("Local offer set");
        Ok(offer)
    }

    pub async fn accept_offer_and_answer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let transport = self.transport()?;
        if !self.media_attached.load(Ordering::Acquire) {
            return Err(NegotiationError::MediaNotAttached);
        }
        if self.local_produced.swap(true, Ordering::AcqRel) {
            return Err(NegotiationError::LocalDescriptionExists);
        }
        self.set_remote(transport.as_ref(), offer).await?;
        self.candidates.flush().await;
        self.answer(transport.as_ref()).await
    }

    /// Returns `false` for a re-delivered answer that was already applied.
    pub async fn accept_answer(&self, answer: SessionDescription) -> Result<bool, NegotiationError> {
        let transport = self.transport()?;
        if !self.local_produced.load(Ordering::Acquire) {
            return Err(NegotiationError::OutOfOrder("answer before local offer"));
        }
        if self.is_duplicate(&answer) {
            debug!("Ignoring duplicate answer");
            return Ok(false);
        }
        if self.has_remote_description() {
            return Err(NegotiationError::OutOfOrder("second answer to the same offer"));
        }
        self.set_remote(transport.as_ref(), answer).await?;
        self.candidates.flush().await;
        Ok(true)
    }

    /// ICE-restart offer on an already negotiated session.
    pub async fn create_restart_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let transport = self.transport()?;
        if !self.has_remote_description() {
            return Err(NegotiationError::OutOfOrder("restart before negotiation"));
        }
        let offer = transport.create_offer(true).await?;
        transport.set_local_description(offer.clone()).await?;
        info!("ICE restart offer set");
        Ok(offer)
    }

    pub async fn accept_restart_answer(
        &self,
        answer: SessionDescription,
    ) -> Result<bool, NegotiationError> {
        let transport = self.transport()?;
        if self.is_duplicate(&answer) {
            debug!("Ignoring duplicate restart answer");
            return Ok(false);
        }
        self.set_remote(transport.as_ref(), answer).await?;
        Ok(true)
    }

    /// Remote ICE-restart offer; `None` when the offer was already answered.
    pub async fn accept_renegotiation(
        &self,
        offer: SessionDescription,
    ) -> Result<Option<SessionDescription>, NegotiationError> {
        let transport = self.transport()?;
        if !self.has_remote_description() {
            return Err(NegotiationError::OutOfOrder("renegotiation before negotiation"));
        }
        if self.is_duplicate(&offer) {
            debug!("Ignoring duplicate offer");
            return Ok(None);
        }
        self.set_remote(transport.as_ref(), offer).await?;
        self.answer(transport.as_ref()).await.map(Some)
    }

    pub fn is_duplicate(&self, desc: &SessionDescription) -> bool {
        self.remote.lock().as_ref() == Some(desc)
    }

    async fn set_remote(
        &self,
        transport: &dyn Transport,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        transport.set_remote_description(desc.clone()).await?;
        info!("Remote {:?} accepted", desc.sdp_type);
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn answer(&self, transport: &dyn Transport) -> Result<SessionDescription, NegotiationError> {
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        info!("Local answer set");
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::ice::Disposition;
    use crate::peer::media::tests::FakeTrack;
    use crate::peer::transport::fakes::FakeTransport;
    use crate::peer::types::{IceCandidate, TrackKind};

    fn negotiator() -> (Negotiator, Arc<CandidateBuffer>) {
        let buffer = Arc::new(CandidateBuffer::new("s1"));
        (Negotiator::new(buffer.clone()), buffer)
    }

    fn audio() -> Vec<Arc<dyn LocalTrack>> {
        vec![FakeTrack::new(TrackKind::Audio)]
    }

    fn cand(line: &str) -> IceCandidate {
        IceCandidate {
            candidate: line.into(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
            connection_id: "s1".into(),
        }
    }

    #[tokio::test]
    async fn calls_without_transport_fail() {
        let (negotiator, _) = negotiator();
        assert_eq!(
            negotiator.create_offer().await.unwrap_err(),
            NegotiationError::NoActiveTransport
        );
        assert_eq!(
            negotiator
                .accept_answer(SessionDescription::answer("a"))
                .await
                .unwrap_err(),
            NegotiationError::NoActiveTransport
        );
    }

    #[tokio::test]
    async fn offer_requires_media_and_is_produced_once() {
        let (negotiator, _) = negotiator();
        let transport = FakeTransport::new();
        negotiator.attach_transport(transport.clone());
        assert_eq!(
            negotiator.create_offer().await.unwrap_err(),
            NegotiationError::MediaNotAttached
        );

        negotiator
            .attach_media(&audio(), MediaKind::Audio)
            .await
            .unwrap();
        let offer = negotiator.create_offer().await.unwrap();
        assert_eq!(transport.local.lock().as_ref(), Some(&offer));
        assert_eq!(
            negotiator.create_offer().await.unwrap_err(),
            NegotiationError::LocalDescriptionExists
        );
    }

    #[tokio::test]
    async fn missing_camera_is_receive_only() {
        let (negotiator, _) = negotiator();
        let transport = FakeTransport::new();
        negotiator.attach_transport(transport.clone());
        negotiator
            .attach_media(&audio(), MediaKind::AudioVideo)
            .await
            .unwrap();
        assert_eq!(
            *transport.calls.lock(),
            vec!["add_track:Audio", "recv_only:Video"]
        );
    }

    #[tokio::test]
    async fn answering_flushes_buffered_candidates_first() {
        let (negotiator, buffer) = negotiator();
        let transport = FakeTransport::new();
        negotiator.attach_transport(transport.clone());
        buffer.attach(transport.clone()).await;
        assert_eq!(buffer.offer(cand("c1")).await, Disposition::Buffered);
        negotiator
            .attach_media(&audio(), MediaKind::Audio)
            .await
            .unwrap();

        let answer = negotiator
            .accept_offer_and_answer(SessionDescription::offer("o"))
            .await
            .unwrap();

        assert_eq!(answer, SessionDescription::answer("answer-0"));
        let calls = transport.calls.lock().clone();
        let remote = calls.iter().position(|c| c == "set_remote").unwrap();
        let applied = calls.iter().position(|c| c == "add_candidate").unwrap();
        let answered = calls.iter().position(|c| c == "create_answer").unwrap();
        assert!(remote < applied && applied < answered);
    }

    #[tokio::test]
    async fn answer_is_applied_once_and_flushes() {
        let (negotiator, buffer) = negotiator();
        let transport = FakeTransport::new();
        negotiator.attach_transport(transport.clone());
        buffer.attach(transport.clone()).await;
        negotiator
            .attach_media(&audio(), MediaKind::Audio)
            .await
            .unwrap();
        buffer.offer(cand("c1")).await;

        assert_eq!(
            negotiator
                .accept_answer(SessionDescription::answer("a"))
                .await
                .unwrap_err(),
            NegotiationError::OutOfOrder("answer before local offer")
        );

        negotiator.create_offer().await.unwrap();
        assert!(negotiator
            .accept_answer(SessionDescription::answer("a"))
            .await
            .unwrap());
        assert!(!negotiator
            .accept_answer(SessionDescription::answer("a"))
            .await
            .unwrap());
        assert_eq!(transport.count("set_remote"), 1);
        assert_eq!(*transport.applied.lock(), vec!["c1"]);
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_negotiation_error() {
        let (negotiator, _) = negotiator();
        let transport = FakeTransport::new();
        *transport.fail_remote.lock() = true;
        negotiator.attach_transport(transport.clone());
        negotiator
            .attach_media(&audio(), MediaKind::Audio)
            .await
            .unwrap();
        let err = negotiator
            .accept_offer_and_answer(SessionDescription::offer("o"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Transport(_)));
    }

    #[tokio::test]
    async fn restart_offer_needs_prior_negotiation() {
        let (negotiator, _) = negotiator();
        let transport = FakeTransport::new();
        negotiator.attach_transport(transport.clone());
        assert!(negotiator.create_restart_offer().await.is_err());

        negotiator
            .attach_media(&audio(), MediaKind::Audio)
            .await
            .unwrap();
        negotiator.create_offer().await.unwrap();
        negotiator
            .accept_answer(SessionDescription::answer("a"))
            .await
            .unwrap();
        negotiator.create_restart_offer().await.unwrap();
        assert_eq!(
            transport.restarts.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }
}
