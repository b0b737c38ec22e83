use crate::error::{DeviceError, TransportError};
use crate::peer::media::{LocalTrack, MediaDevices};
use crate::peer::types::{MediaKind, TrackKind};
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

type Claims = Arc<Mutex<HashSet<TrackKind>>>;

/// Capture devices fed by the application through `SampleTrack::write_sample`.
///
/// Each device class can be held by one open track at a time; a second
/// open fails as busy until the first track is stopped.
#[derive(Clone)]
pub struct SampleDevices {
    camera_present: bool,
    claims: Claims,
}

impl Default for SampleDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleDevices {
    pub fn new() -> Self {
        Self {
            camera_present: true,
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn without_camera(mut self) -> Self {
        self.camera_present = false;
        self
    }

    pub fn in_use(&self, kind: TrackKind) -> bool {
        self.claims.lock().contains(&kind)
    }

    fn present(&self, kind: TrackKind) -> bool {
        kind == TrackKind::Audio || self.camera_present
    }
}

#[async_trait]
impl MediaDevices for SampleDevices {
    async fn open(&self, kind: MediaKind) -> Result<Vec<Arc<dyn LocalTrack>>, DeviceError> {
        let kinds = kind.track_kinds();
        if kinds.iter().any(|k| !self.present(*k)) {
            return Err(DeviceError::DeviceNotFound);
        }

        {
            let mut claims = self.claims.lock();
            if kinds.iter().any(|k| claims.contains(k)) {
                debug!("Capture device busy for {:?}", kind);
                return Err(DeviceError::DeviceBusyOrUnreadable);
            }
            claims.extend(kinds.iter().copied());
        }

        let stream_id = format!("local-{}", random_id());
        let tracks = kinds
            .iter()
            .map(|k| {
                Arc::new(SampleTrack::new(*k, &stream_id, self.claims.clone()))
                    as Arc<dyn LocalTrack>
            })
            .collect();
        info!("Opened capture devices for {:?}", kind);
        Ok(tracks)
    }
}

/// Local track backed by a `TrackLocalStaticSample`.
pub struct SampleTrack {
    id: String,
    kind: TrackKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
    claims: Claims,
}

impl SampleTrack {
    fn new(kind: TrackKind, stream_id: &str, claims: Claims) -> Self {
        let id = match kind {
            TrackKind::Audio => format!("audio-{}", random_id()),
            TrackKind::Video => format!("video-{}", random_id()),
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec_for(kind),
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            id,
            kind,
            rtc,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            claims,
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Pushes one encoded frame. Returns `false` when the track is muted or
    /// stopped and the frame was dropped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool, TransportError> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }
        self.rtc
            .write_sample(sample)
            .await
            .map_err(|e| TransportError::op("write_sample", e))?;
        Ok(true)
    }

    pub async fn write_frame(&self, data: Bytes, duration: Duration) -> Result<bool, TransportError> {
        self.write_sample(&Sample {
            data,
            duration,
            ..Default::default()
        })
        .await
    }
}

impl LocalTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.claims.lock().remove(&self.kind);
        debug!("Stopped local track {}", self.id);
    }

    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        Some(self.rtc.clone())
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}
