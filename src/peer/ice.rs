use crate::error::TransportError;
use crate::peer::transport::Transport;
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::utils::add_ice_url_scheme;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use webrtc::{
    api::APIBuilder,
    ice_transport::{
        ice_candidate::RTCIceCandidate, ice_gatherer_state::RTCIceGathererState,
        ice_server::RTCIceServer,
    },
    peer_connection::{configuration::RTCConfiguration, RTCPeerConnection},
};

/// What happened to an offered remote candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Buffered,
    Rejected,
}

#[derive(Default)]
struct BufferState {
    pending: Vec<IceCandidate>,
    transport: Option<Arc<dyn Transport>>,
    remote_accepted: bool,
}

/// Remote candidates that arrived before a remote description was accepted.
///
/// The async lock is held while candidates are applied, so a candidate offered
/// during a flush lands after every buffered one.
pub struct CandidateBuffer {
    session_id: String,
    state: Mutex<BufferState>,
    discarded: AtomicBool,
}

impl CandidateBuffer {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            state: Mutex::new(BufferState::default()),
            discarded: AtomicBool::new(false),
        }
    }

    pub async fn attach(&self, transport: Arc<dyn Transport>) {
        if self.discarded.load(Ordering::Acquire) {
            return;
        }
        self.state.lock().await.transport = Some(transport);
    }

    pub async fn offer(&self, candidate: IceCandidate) -> Disposition {
        if candidate.connection_id != self.session_id {
            warn!(
                "Dropping candidate for session {} (current {})",
                candidate.connection_id, self.session_id
            );
            return Disposition::Rejected;
        }
        if self.discarded.load(Ordering::Acquire) {
            debug!("Candidate buffer discarded, ignoring candidate");
            return Disposition::Rejected;
        }

        let mut state = self.state.lock().await;
        if state.remote_accepted {
            if let Some(transport) = state.transport.clone() {
                apply(transport.as_ref(), candidate).await;
                return Disposition::Applied;
            }
        }
        debug!("Remote description not set yet, queuing candidate");
        state.pending.push(candidate);
        Disposition::Buffered
    }

    /// Applies buffered candidates in arrival order. Only the first call does any
    /// work; failures of single candidates are logged and skipped.
    pub async fn flush(&self) -> usize {
        let mut state = self.state.lock().await;
        if state.remote_accepted || self.discarded.load(Ordering::Acquire) {
            return 0;
        }
        let Some(transport) = state.transport.clone() else {
            warn!("Flush requested without a transport, keeping candidates");
            return 0;
        };
        state.remote_accepted = true;

        let pending = std::mem::take(&mut state.pending);
        info!("Applying {} pending remote candidate(s)", pending.len());
        let mut applied = 0;
        for candidate in pending {
            if self.discarded.load(Ordering::Acquire) {
                break;
            }
            if apply(transport.as_ref(), candidate).await {
                applied += 1;
            }
        }
        applied
    }

    /// Drops everything and refuses further candidates.
    pub async fn discard(&self) {
        self.discarded.store(true, Ordering::Release);
        let mut state = self.state.lock().await;
        state.pending.clear();
        state.transport = None;
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

async fn apply(transport: &dyn Transport, candidate: IceCandidate) -> bool {
    debug!("Applying remote candidate: {}", candidate.candidate);
    match transport.add_ice_candidate(candidate).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to apply remote candidate: {}", e);
            false
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateStats {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateStats {
    let mut stats = CandidateStats::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            stats.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            stats.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            stats.relay += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        stats.host, stats.srflx, stats.relay
    );

    if stats.relay == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    stats
}

/// STUN servers prove themselves with srflx candidates, TURN servers with relay ones.
pub fn candidate_matches_server(server_type: &str, candidate: &str) -> bool {
    match server_type {
        "stun" => candidate.contains("srflx"),
        "turn" => candidate.contains("relay"),
        _ => false,
    }
}

/// Checks that an ICE server answers by gathering candidates against it alone.
pub async fn probe_ice_server(
    config: &ServerConfig,
    wait: Duration,
) -> Result<bool, TransportError> {
    let url = add_ice_url_scheme(config);
    info!("Probing ICE server {} ({})", config.id, url);

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![url],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        }],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    let pc = Arc::new(
        api.new_peer_connection(rtc_config)
            .await
            .map_err(|e| TransportError::op("new_peer_connection", e))?,
    );

    let found = probe_via_gathering(&pc, &config.r#type, wait).await;
    if let Err(e) = pc.close().await {
        debug!("Closing probe connection failed: {}", e);
    }
    found
}

async fn probe_via_gathering(
    pc: &Arc<RTCPeerConnection>,
    server_type: &str,
    wait: Duration,
) -> Result<bool, TransportError> {
    let (state_tx, mut state_rx) = mpsc::unbounded_channel();
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!("Probe gathering state changed to: {:?}", state);
        let _ = state_tx.send(state);
        Box::pin(async {})
    }));

    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    let server_type = server_type.to_string();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(init) if candidate_matches_server(&server_type, &init.candidate) => {
                    debug!("Probe found matching candidate: {}", init.candidate);
                    let _ = found_tx.send(());
                }
                Ok(init) => debug!("Probe candidate ignored: {}", init.candidate),
                Err(e) => debug!("Failed to get candidate JSON: {:?}", e),
            }
        }
        Box::pin(async {})
    }));

    // a data channel is enough to start gathering
    pc.create_data_channel("probe", None)
        .await
        .map_err(|e| TransportError::op("create_data_channel", e))?;
    let offer = pc
        .create_offer(None)
        .await
        .map_err(|e| TransportError::op("create_offer", e))?;
    pc.set_local_description(offer)
        .await
        .map_err(|e| TransportError::op("set_local_description", e))?;

    let gathering_done = async {
        while let Some(state) = state_rx.recv().await {
            if state == RTCIceGathererState::Complete {
                break;
            }
        }
    };

    let matched = tokio::select! {
        found = timeout(wait, found_rx.recv()) => matches!(found, Ok(Some(()))),
        _ = gathering_done => false,
    };
    // a candidate may land right before gathering completes
    let found = matched || found_rx.try_recv().is_ok();
    info!("ICE server probe result: {}", found);
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::transport::fakes::FakeTransport;

    fn cand(line: &str) -> IceCandidate {
        IceCandidate {
            candidate: line.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            connection_id: "s1".into(),
        }
    }

    #[tokio::test]
    async fn buffered_candidates_flush_in_arrival_order() {
        let transport = FakeTransport::new();
        let buffer = CandidateBuffer::new("s1");
        buffer.attach(transport.clone()).await;

        for line in ["c1", "c2", "c3"] {
            assert_eq!(buffer.offer(cand(line)).await, Disposition::Buffered);
        }
        assert!(transport.applied.lock().is_empty());

        assert_eq!(buffer.flush().await, 3);
        assert_eq!(*transport.applied.lock(), vec!["c1", "c2", "c3"]);
        assert_eq!(buffer.pending_len().await, 0);
    }

    #[tokio::test]
    async fn candidates_after_flush_apply_immediately() {
        let transport = FakeTransport::new();
        let buffer = CandidateBuffer::new("s1");
        buffer.attach(transport.clone()).await;
        buffer.flush().await;

        assert_eq!(buffer.offer(cand("late")).await, Disposition::Applied);
        assert_eq!(buffer.pending_len().await, 0);
        assert_eq!(*transport.applied.lock(), vec!["late"]);
    }

    #[tokio::test]
    async fn failing_candidate_does_not_abort_flush() {
        let transport = FakeTransport::new();
        let buffer = CandidateBuffer::new("s1");
        buffer.attach(transport.clone()).await;
        buffer.offer(cand("c1")).await;
        buffer.offer(cand("bad")).await;
        buffer.offer(cand("c3")).await;

        assert_eq!(buffer.flush().await, 2);
        assert_eq!(*transport.applied.lock(), vec!["c1", "c3"]);
    }

    #[tokio::test]
    async fn flush_runs_once() {
        let transport = FakeTransport::new();
        let buffer = CandidateBuffer::new("s1");
        buffer.attach(transport.clone()).await;
        buffer.offer(cand("c1")).await;
        assert_eq!(buffer.flush().await, 1);
        assert_eq!(buffer.flush().await, 0);
        assert_eq!(transport.count("add_candidate"), 1);
    }

    #[tokio::test]
    async fn candidates_wait_for_a_transport() {
        let buffer = CandidateBuffer::new("s1");
        assert_eq!(buffer.offer(cand("early")).await, Disposition::Buffered);
        assert_eq!(buffer.flush().await, 0);

        let transport = FakeTransport::new();
        buffer.attach(transport.clone()).await;
        assert_eq!(buffer.flush().await, 1);
        assert_eq!(*transport.applied.lock(), vec!["early"]);
    }

    #[tokio::test]
    async fn foreign_and_discarded_candidates_are_rejected() {
        let transport = FakeTransport::new();
        let buffer = CandidateBuffer::new("s1");
        buffer.attach(transport.clone()).await;

        let mut foreign = cand("c1");
        foreign.connection_id = "other".into();
        assert_eq!(buffer.offer(foreign).await, Disposition::Rejected);

        buffer.offer(cand("c2")).await;
        buffer.discard().await;
        assert_eq!(buffer.pending_len().await, 0);
        assert_eq!(buffer.offer(cand("c3")).await, Disposition::Rejected);
        assert_eq!(buffer.flush().await, 0);
        assert!(transport.applied.lock().is_empty());
    }

    #[test]
    fn analysis_counts_candidate_types() {
        let stats = analyze_candidates(&[
            cand("candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host"),
            cand("candidate:2 1 udp 1694498815 1.2.3.4 5000 typ srflx raddr 10.0.0.2"),
            cand("candidate:3 1 udp 16777215 5.6.7.8 3478 typ relay raddr 1.2.3.4"),
            cand("candidate:4 1 udp 2130706431 10.0.0.3 5001 typ host"),
        ]);
        assert_eq!(
            stats,
            CandidateStats {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }

    #[test]
    fn probe_match_depends_on_server_type() {
        let srflx = "candidate:2 1 udp 1694498815 1.2.3.4 5000 typ srflx";
        assert!(candidate_matches_server("stun", srflx));
        assert!(!candidate_matches_server("turn", srflx));
        assert!(candidate_matches_server("turn", "typ relay"));
        assert!(!candidate_matches_server("other", "typ relay"));
    }
}
