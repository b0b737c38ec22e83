//! One call with one remote peer.
//!
//! A session walks the state machine in [`crate::peer::state`]: it acquires
//! local media, negotiates over a [`Transport`], watches the link and tears
//! everything down exactly once when it reaches `Closed` or `Failed`.
//!
//! Every continuation re-checks liveness after its await point. A hang-up
//! that lands while media or a transport is being created wins: the late
//! resource is released and the step's result is dropped.

use crate::config::CallConfig;
use crate::error::{CallError, NegotiationError};
use crate::peer::connection::RtcTransportFactory;
use crate::peer::ice::{analyze_candidates, CandidateBuffer, Disposition};
use crate::peer::media::{LocalTrack, MediaDevices, MediaHandle, MediaSource};
use crate::peer::monitor::{ConnectivityMonitor, MonitorAction};
use crate::peer::negotiator::Negotiator;
use crate::peer::state::{InvalidTransition, SessionState, SessionTransition};
use crate::peer::transport::{Transport, TransportEvent, TransportFactory};
use crate::peer::types::{
    IceCandidate, LinkState, MediaKind, RemoteTrack, Role, SessionDescription, TrackKind,
};
use crate::signaling::{Envelope, SignalingMessage, SignalingSink};
use crate::utils::random_id;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// UI-facing notifications.
pub trait SessionObserver: Send + Sync {
    fn on_state_changed(&self, session_id: &str, state: &SessionState);

    fn on_remote_track(&self, session_id: &str, track: &RemoteTrack);

    fn on_incoming_call(&self, call_id: &str, from: &str, kind: MediaKind) {
        let _ = (call_id, from, kind);
    }
}

/// Everything a session needs from the outside world.
#[derive(Clone)]
pub struct SessionContext {
    pub config: CallConfig,
    pub devices: Arc<dyn MediaDevices>,
    pub transports: Arc<dyn TransportFactory>,
    pub signaling: Arc<dyn SignalingSink>,
    pub observer: Arc<dyn SessionObserver>,
}

impl SessionContext {
    pub fn new(
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        transports: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingSink>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        Self {
            config,
            devices,
            transports,
            signaling,
            observer,
        }
    }

    /// Context backed by real webrtc peer connections.
    pub fn with_webrtc(
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        signaling: Arc<dyn SignalingSink>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let transports = Arc::new(RtcTransportFactory::new(config.clone()));
        Self::new(config, devices, transports, signaling, observer)
    }
}

pub struct Session {
    id: String,
    role: Role,
    local_peer: String,
    remote_peer: String,
    kind: MediaKind,
    media_source: MediaSource,
    transports: Arc<dyn TransportFactory>,
    state: Mutex<SessionState>,
    media: Mutex<Option<MediaHandle>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    candidates: Arc<CandidateBuffer>,
    negotiator: Negotiator,
    monitor: Mutex<ConnectivityMonitor>,
    observer: Mutex<Option<Arc<dyn SessionObserver>>>,
    signaling: Mutex<Option<Arc<dyn SignalingSink>>>,
    pending_offer: Mutex<Option<SessionDescription>>,
    restart_pending: AtomicBool,
    restart_timeout: Duration,
    /// Fails the session if `Recovering` outlasts `restart_timeout`.
    restart_deadline: Mutex<Option<JoinHandle<()>>>,
    local_candidates: Mutex<Vec<IceCandidate>>,
    remote_tracks: Mutex<Vec<RemoteTrack>>,
    torn_down: AtomicBool,
}

impl Session {
    /// Outgoing call with a fresh call id. Nothing happens until `start`.
    pub fn outgoing(
        context: &SessionContext,
        local_peer: &str,
        remote_peer: &str,
        kind: MediaKind,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            context,
            random_id(),
            Role::Caller,
            local_peer,
            remote_peer,
            kind,
            None,
        ))
    }

    /// Incoming call holding the remote offer until the user accepts it.
    pub fn incoming(
        context: &SessionContext,
        call_id: &str,
        local_peer: &str,
        remote_peer: &str,
        kind: MediaKind,
        offer: SessionDescription,
    ) -> Arc<Self> {
        Arc::new(Self::build(
            context,
            call_id.to_string(),
            Role::Callee,
            local_peer,
            remote_peer,
            kind,
            Some(offer),
        ))
    }

    fn build(
        context: &SessionContext,
        id: String,
        role: Role,
        local_peer: &str,
        remote_peer: &str,
        kind: MediaKind,
        offer: Option<SessionDescription>,
    ) -> Self {
        let candidates = Arc::new(CandidateBuffer::new(id.clone()));
        Self {
            negotiator: Negotiator::new(candidates.clone()),
            candidates,
            id,
            role,
            local_peer: local_peer.to_string(),
            remote_peer: remote_peer.to_string(),
            kind,
            media_source: MediaSource::new(context.devices.clone(), &context.config),
            transports: context.transports.clone(),
            state: Mutex::new(SessionState::Idle),
            media: Mutex::new(None),
            transport: Mutex::new(None),
            monitor: Mutex::new(ConnectivityMonitor::new()),
            observer: Mutex::new(Some(context.observer.clone())),
            signaling: Mutex::new(Some(context.signaling.clone())),
            pending_offer: Mutex::new(offer),
            restart_pending: AtomicBool::new(false),
            restart_timeout: context.config.restart_timeout,
            restart_deadline: Mutex::new(None),
            local_candidates: Mutex::new(Vec::new()),
            remote_tracks: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    /// What the call asked for; `granted_media` may be narrower.
    pub fn media_kind(&self) -> MediaKind {
        self.kind
    }

    pub fn granted_media(&self) -> Option<MediaKind> {
        self.media.lock().as_ref().map(|m| m.granted())
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().is_live()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().is_connected()
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.remote_tracks.lock().clone()
    }

    /// Acquire media, open the transport and send the offer (caller) or the
    /// answer to the held offer (callee).
    pub async fn start(self: &Arc<Self>) -> Result<(), CallError> {
        self.enter(SessionTransition::Start).await?;

        let handle = match self.media_source.acquire(self.kind).await {
            Ok(handle) => handle,
            Err(err) => {
                if !self.is_live() {
                    return Err(CallError::SessionClosed);
                }
                warn!("Session {}: {}", self.id, err);
                self.fail(SessionTransition::MediaFailed(err.error.clone()))
                    .await;
                return Err(err.error.into());
            }
        };
        let tracks = handle.tracks().to_vec();
        *self.media.lock() = Some(handle);
        if !self.is_live() {
            self.release_media();
            return Err(CallError::SessionClosed);
        }
        self.advance(SessionTransition::MediaReady).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = match self.transports.create(&self.id, events_tx).await {
            Ok(transport) => transport,
            Err(e) => return Err(self.negotiation_failed(e.into()).await),
        };
        *self.transport.lock() = Some(transport.clone());
        if !self.is_live() {
            let late = self.transport.lock().take();
            if let Some(late) = late {
                let _ = late.close().await;
            }
            return Err(CallError::SessionClosed);
        }
        self.negotiator.attach_transport(transport.clone());
        self.candidates.attach(transport).await;
        self.spawn_event_pump(events_rx);

        let negotiated = match self.role {
            Role::Caller => self.send_offer(&tracks).await,
            Role::Callee => self.send_answer(&tracks).await,
        };
        match negotiated {
            Ok(()) => Ok(()),
            Err(e) => Err(self.negotiation_failed(e.into()).await),
        }
    }

    async fn send_offer(
        &self,
        tracks: &[Arc<dyn LocalTrack>],
    ) -> Result<(), NegotiationError> {
        self.negotiator.attach_media(tracks, self.kind).await?;
        let offer = self.negotiator.create_offer().await?;
        if self.is_live() {
            self.send(SignalingMessage::Offer {
                sdp: offer.sdp,
                media: self.kind,
            });
        }
        Ok(())
    }

    async fn send_answer(
        &self,
        tracks: &[Arc<dyn LocalTrack>],
    ) -> Result<(), NegotiationError> {
        let offer = self
            .pending_offer
            .lock()
            .clone()
            .ok_or(NegotiationError::OutOfOrder("no remote offer to answer"))?;
        self.negotiator.attach_media(tracks, self.kind).await?;
        let answer = self.negotiator.accept_offer_and_answer(offer).await?;
        if self.is_live() {
            self.send(SignalingMessage::Answer { sdp: answer.sdp });
        }
        Ok(())
    }

    /// Answer to our offer, or to our ICE-restart offer.
    pub async fn handle_answer(&self, answer: SessionDescription) -> Result<(), CallError> {
        if self.role != Role::Caller {
            warn!("Session {}: callee ignoring answer", self.id);
            return Ok(());
        }
        if !self.is_live() {
            debug!("Session {}: answer after close ignored", self.id);
            return Ok(());
        }

        if self.restart_pending.load(Ordering::Acquire) {
            return match self.negotiator.accept_restart_answer(answer).await {
                Ok(applied) => {
                    if applied {
                        self.restart_pending.store(false, Ordering::Release);
                        info!("Session {}: restart answer accepted", self.id);
                    }
                    Ok(())
                }
                Err(e) => {
                    if self.is_live() {
                        self.fail_connectivity().await;
                    }
                    Err(e.into())
                }
            };
        }

        match self.negotiator.accept_answer(answer).await {
            Ok(true) => {
                info!("Session {}: answer accepted", self.id);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => Err(self.negotiation_failed(e.into()).await),
        }
    }

    /// Offer for an existing session: a re-delivery of the original offer or
    /// an ICE-restart from the caller.
    pub async fn handle_offer(&self, offer: SessionDescription) -> Result<(), CallError> {
        if !self.is_live() {
            return Ok(());
        }
        let redelivered = self.pending_offer.lock().as_ref() == Some(&offer);
        if redelivered || self.negotiator.is_duplicate(&offer) {
            debug!("Session {}: duplicate offer ignored", self.id);
            return Ok(());
        }
        if self.role == Role::Caller {
            warn!("Session {}: caller ignoring remote offer", self.id);
            return Ok(());
        }
        if !self.negotiator.has_remote_description() {
            warn!(
                "Session {}: renegotiation offer while {}",
                self.id,
                self.state()
            );
            return Ok(());
        }

        match self.negotiator.accept_renegotiation(offer).await {
            Ok(Some(answer)) => {
                info!("Session {}: answered ICE restart", self.id);
                if self.is_live() {
                    self.send(SignalingMessage::Answer { sdp: answer.sdp });
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                if self.is_live() {
                    self.fail_connectivity().await;
                }
                Err(e.into())
            }
        }
    }

    pub async fn handle_candidate(&self, candidate: IceCandidate) -> Disposition {
        self.candidates.offer(candidate).await
    }

    /// Local hang-up. A failed session is acknowledged instead.
    pub async fn hang_up(&self) {
        if self.transition(SessionTransition::HangUp).is_ok() {
            self.send(SignalingMessage::Hangup);
            self.teardown().await;
        } else {
            self.acknowledge().await;
        }
    }

    pub async fn remote_hang_up(&self) {
        info!("Session {}: remote hung up", self.id);
        if self.transition(SessionTransition::HangUp).is_ok() {
            self.teardown().await;
        } else {
            self.acknowledge().await;
        }
    }

    /// Moves a failed session to `Closed`. Does nothing otherwise.
    pub async fn acknowledge(&self) {
        if matches!(self.state(), SessionState::Failed(_)) {
            let _ = self.enter(SessionTransition::Acknowledge).await;
        }
    }

    pub fn toggle_mic(&self) -> Result<bool, CallError> {
        self.toggle(TrackKind::Audio)
    }

    /// Without a camera track (audio fallback) this stays `false`.
    pub fn toggle_camera(&self) -> Result<bool, CallError> {
        self.toggle(TrackKind::Video)
    }

    fn toggle(&self, kind: TrackKind) -> Result<bool, CallError> {
        if !self.is_live() {
            return Err(CallError::SessionClosed);
        }
        let media = self.media.lock();
        let handle = media.as_ref().ok_or(CallError::NoLocalMedia)?;
        let enabled = handle.toggle(kind);
        info!("Session {}: {:?} enabled = {}", self.id, kind, enabled);
        Ok(enabled)
    }

    fn spawn_event_pump(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        let session: Weak<Session> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(session) = session.upgrade() else {
                    break;
                };
                if !session.is_live() {
                    break;
                }
                session.on_transport_event(event).await;
            }
            debug!("Transport event pump finished");
        });
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.local_candidates.lock().push(candidate.clone());
                self.send(SignalingMessage::IceCandidate { candidate });
            }
            TransportEvent::GatheringComplete => {
                let stats = analyze_candidates(&self.local_candidates.lock());
                debug!("Session {}: gathering complete {:?}", self.id, stats);
            }
            TransportEvent::LinkState(state) => self.on_link_state(state).await,
            TransportEvent::RemoteTrack(track) => {
                let observer = self.observer.lock().clone();
                if let Some(observer) = observer {
                    observer.on_remote_track(&self.id, &track);
                }
                self.remote_tracks.lock().push(track);
            }
        }
    }

    async fn on_link_state(self: &Arc<Self>, link: LinkState) {
        let action = self.monitor.lock().observe(link);
        let current = self.state();

        match (action, current) {
            (MonitorAction::Established, SessionState::Negotiating | SessionState::Recovering) => {
                self.cancel_restart_deadline();
                let _ = self.enter(SessionTransition::LinkUp).await;
            }
            (MonitorAction::Restart, SessionState::Connected) => {
                if self.enter(SessionTransition::RestartAttempted).await.is_ok() {
                    self.arm_restart_deadline();
                    if self.role == Role::Caller {
                        self.restart_ice().await;
                    }
                }
            }
            (MonitorAction::Restart | MonitorAction::GiveUp, SessionState::Negotiating)
            | (MonitorAction::GiveUp, SessionState::Connected | SessionState::Recovering) => {
                self.fail_connectivity().await;
            }
            _ => {}
        }
    }

    /// Both roles wait at most `restart_timeout` for the link to come back.
    fn arm_restart_deadline(self: &Arc<Self>) {
        let session: Weak<Session> = Arc::downgrade(self);
        let timeout = self.restart_timeout;
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = session.upgrade() else {
                return;
            };
            session.restart_deadline.lock().take();
            if session.state() != SessionState::Recovering {
                return;
            }
            let transport = session.transport.lock().clone();
            let link = transport.map(|t| t.link_state());
            match link {
                Some(link) if link.is_up() => session.on_link_state(link).await,
                _ => {
                    warn!(
                        "Session {}: link not restored within {:?}",
                        session.id, timeout
                    );
                    session.fail_connectivity().await;
                }
            }
        });
        if let Some(previous) = self.restart_deadline.lock().replace(task) {
            previous.abort();
        }
    }

    fn cancel_restart_deadline(&self) {
        if let Some(task) = self.restart_deadline.lock().take() {
            task.abort();
        }
    }

    async fn restart_ice(&self) {
        self.restart_pending.store(true, Ordering::Release);
        match self.negotiator.create_restart_offer().await {
            Ok(offer) => {
                if self.is_live() {
                    self.send(SignalingMessage::Offer {
                        sdp: offer.sdp,
                        media: self.kind,
                    });
                }
            }
            Err(e) => {
                self.restart_pending.store(false, Ordering::Release);
                if self.is_live() {
                    warn!("Session {}: ICE restart failed: {}", self.id, e);
                    self.fail_connectivity().await;
                }
            }
        }
    }

    async fn negotiation_failed(&self, err: CallError) -> CallError {
        if !self.is_live() {
            return CallError::SessionClosed;
        }
        warn!("Session {}: negotiation failed: {}", self.id, err);
        self.fail(SessionTransition::NegotiationFailed).await;
        err
    }

    async fn fail_connectivity(&self) {
        let transition = if self.state() == SessionState::Negotiating {
            SessionTransition::NegotiationFailed
        } else {
            SessionTransition::LinkLost
        };
        self.fail(transition).await;
    }

    async fn fail(&self, transition: SessionTransition) {
        if let Err(e) = self.enter(transition).await {
            debug!("Session {}: {}", self.id, e);
        }
    }

    async fn advance(&self, transition: SessionTransition) -> Result<(), CallError> {
        match self.enter(transition).await {
            Ok(_) => Ok(()),
            Err(_) if !self.is_live() => Err(CallError::SessionClosed),
            Err(e) => Err(e.into()),
        }
    }

    /// Applies `transition`; a terminal result is torn down before returning.
    async fn enter(
        &self,
        transition: SessionTransition,
    ) -> Result<SessionState, InvalidTransition> {
        let next = self.transition(transition)?;
        if next.is_terminal() {
            if matches!(next, SessionState::Failed(_)) {
                self.send(SignalingMessage::Hangup);
            }
            self.teardown().await;
        }
        Ok(next)
    }

    fn transition(
        &self,
        transition: SessionTransition,
    ) -> Result<SessionState, InvalidTransition> {
        let (prev, next) = {
            let mut state = self.state.lock();
            let next = state.apply(&transition)?;
            let prev = std::mem::replace(&mut *state, next.clone());
            (prev, next)
        };
        info!("Session {}: {} -> {}", self.id, prev, next);

        let observer = self.observer.lock().clone();
        if let Some(observer) = observer {
            observer.on_state_changed(&self.id, &next);
        }
        Ok(next)
    }

    fn release_media(&self) {
        let media = self.media.lock().take();
        if let Some(media) = media {
            media.release();
        }
    }

    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Session {}: tearing down", self.id);

        self.cancel_restart_deadline();
        self.release_media();

        let transport = self.transport.lock().take();
        self.negotiator.detach();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                warn!("Session {}: transport close failed: {}", self.id, e);
            }
        }

        self.candidates.discard().await;
        self.observer.lock().take();
        self.signaling.lock().take();
        self.remote_tracks.lock().clear();
    }

    fn send(&self, message: SignalingMessage) {
        let Some(sink) = self.signaling.lock().clone() else {
            debug!("Session {}: signaling detached, dropping {}", self.id, message.name());
            return;
        };
        let name = message.name();
        let envelope = Envelope::new(&self.id, &self.local_peer, &self.remote_peer, message);
        if let Err(e) = sink.send(envelope) {
            warn!("Session {}: failed to send {}: {}", self.id, name, e);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("remote_peer", &self.remote_peer)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.torn_down.load(Ordering::Acquire) {
            debug!("Session {} dropped without teardown", self.id);
        }
    }
}
