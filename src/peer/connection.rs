use crate::config::CallConfig;
use crate::error::TransportError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::media::LocalTrack;
use crate::peer::transport::{Transport, TransportEvent, TransportEvents, TransportFactory};
use crate::peer::types::{
    IceCandidate, LinkState, RemoteTrack, SdpType, ServerConfig, SessionDescription, TrackKind,
};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine,
        APIBuilder,
    },
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
};

/// webrtc-rs backed transport for one session.
pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    session_id: String,
}

impl RtcTransport {
    /// Builds the peer connection and routes its callbacks into `events`.
    pub async fn new(
        config: &CallConfig,
        session_id: &str,
        events: TransportEvents,
    ) -> Result<Self, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::op("register_default_codecs", e))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| TransportError::op("register_default_interceptors", e))?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(rtc_config(&config.ice_servers))
                .await
                .map_err(|e| TransportError::op("new_peer_connection", e))?,
        );
        info!("Peer connection created for session {}", session_id);

        // local candidates go straight to signaling (trickle ICE)
        let candidate_events = events.clone();
        let connection_id = session_id.to_string();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            let connection_id = connection_id.clone();
            Box::pin(async move {
                let Some(c) = cand else {
                    debug!("ICE candidate gathering completed (null candidate received)");
                    let _ = events.send(TransportEvent::GatheringComplete);
                    return;
                };
                dump_candidate("LOCAL", &c).await;
                match c.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            connection_id,
                        }));
                    }
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        pc.on_ice_gathering_state_change(Box::new(move |state| {
            debug!("ICE gathering state changed to: {:?}", state);
            Box::pin(async {})
        }));

        let link_events = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
            info!("ICE connection state changed to: {:?}", st);
            let _ = link_events.send(TransportEvent::LinkState(link_state(st)));
            Box::pin(async {})
        }));

        let pc_stats = Arc::downgrade(&pc);
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!("Peer connection state changed to: {:?}", st);
            let pc_stats = pc_stats.clone();
            Box::pin(async move {
                if st == RTCPeerConnectionState::Failed {
                    if let Some(pc) = pc_stats.upgrade() {
                        dump_selected_pair(&pc, "BEFORE-FAIL").await;
                    }
                }
            })
        }));

        let track_events = events;
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            info!("Remote {:?} track {} received", kind, track.id());
            let _ = track_events.send(TransportEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
                handle: Some(track),
            }));
            Box::pin(async {})
        }));

        Ok(Self {
            pc,
            session_id: session_id.to_string(),
        })
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    fn detach_handlers(&self) {
        self.pc
            .on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_ice_gathering_state_change(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_peer_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_track(Box::new(|_, _, _| Box::pin(async {})));
    }
}

#[async_trait]
impl Transport for RtcTransport {
    async fn add_local_track(&self, track: Arc<dyn LocalTrack>) -> Result<(), TransportError> {
        let Some(rtc_track) = track.rtc_track() else {
            return Err(TransportError::op("add_track", "track has no RTP sink"));
        };
        let sender = self
            .pc
            .add_track(rtc_track)
            .await
            .map_err(|e| TransportError::op("add_track", e))?;

        // interceptors only see RTCP that somebody reads
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn add_receive_only(&self, kind: TrackKind) -> Result<(), TransportError> {
        let codec_type = match kind {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        };
        self.pc
            .add_transceiver_from_kind(
                codec_type,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| TransportError::op("add_transceiver", e))?;
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, TransportError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| TransportError::op("create_offer", e))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TransportError::op("create_answer", e))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::op("set_local_description", e))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TransportError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::op("set_remote_description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        if candidate.connection_id != self.session_id {
            return Err(TransportError::op(
                "add_ice_candidate",
                format!("candidate belongs to {}", candidate.connection_id),
            ));
        }
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| TransportError::op("add_ice_candidate", e))
    }

    fn link_state(&self) -> LinkState {
        link_state(self.pc.ice_connection_state())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.detach_handlers();
        info!("Closing peer connection for session {}", self.session_id);
        self.pc
            .close()
            .await
            .map_err(|e| TransportError::op("close", e))
    }
}

/// Creates one `RtcTransport` per session from a fixed configuration.
pub struct RtcTransportFactory {
    config: CallConfig,
}

impl RtcTransportFactory {
    pub fn new(config: CallConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        session_id: &str,
        events: TransportEvents,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let transport = RtcTransport::new(&self.config, session_id, events).await?;
        Ok(Arc::new(transport))
    }
}

/// Peer connection configuration for the given ICE servers.
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_ice_servers(servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn link_state(state: RTCIceConnectionState) -> LinkState {
    match state {
        RTCIceConnectionState::Checking => LinkState::Checking,
        RTCIceConnectionState::Connected => LinkState::Connected,
        RTCIceConnectionState::Completed => LinkState::Completed,
        RTCIceConnectionState::Disconnected => LinkState::Disconnected,
        RTCIceConnectionState::Failed => LinkState::Failed,
        RTCIceConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|e| TransportError::op("parse_session_description", e))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::op(
            "session_description",
            format!("unsupported type {:?}", other),
        )),
    }
}
