//! Local media acquisition with retry and audio-only fallback.

use crate::config::CallConfig;
use crate::error::{AcquireError, DeviceError, MediaError};
use crate::peer::types::{MediaKind, TrackKind};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::track::track_local::TrackLocal;

/// One local capture track.
pub trait LocalTrack: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> TrackKind;

    fn is_enabled(&self) -> bool;

    /// Enablement only gates what is sent; it never renegotiates.
    fn set_enabled(&self, enabled: bool);

    /// Stop capturing and give the device back.
    fn stop(&self);

    /// RTP track to bind to a peer connection, if this track has one.
    fn rtc_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

/// Platform capture devices. Every open is one suspending device request.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open(&self, kind: MediaKind) -> Result<Vec<Arc<dyn LocalTrack>>, DeviceError>;
}

/// Record of one `acquire` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionAttempt {
    pub requested: MediaKind,
    /// Device opens performed, fallback included.
    pub attempts: u32,
    pub fell_back: bool,
    pub last_failure: Option<DeviceError>,
}

impl AcquisitionAttempt {
    fn new(requested: MediaKind) -> Self {
        Self {
            requested,
            attempts: 0,
            fell_back: false,
            last_failure: None,
        }
    }
}

/// Exclusively owned local capture. Tracks are stopped exactly once, by
/// `release` or on drop.
pub struct MediaHandle {
    tracks: Vec<Arc<dyn LocalTrack>>,
    granted: MediaKind,
    attempt: AcquisitionAttempt,
    released: AtomicBool,
}

impl MediaHandle {
    pub fn new(
        tracks: Vec<Arc<dyn LocalTrack>>,
        granted: MediaKind,
        attempt: AcquisitionAttempt,
    ) -> Self {
        Self {
            tracks,
            granted,
            attempt,
            released: AtomicBool::new(false),
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn LocalTrack>] {
        &self.tracks
    }

    pub fn granted(&self) -> MediaKind {
        self.granted
    }

    pub fn attempt(&self) -> &AcquisitionAttempt {
        &self.attempt
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<dyn LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Flip enablement of the track of `kind`; returns the resulting state.
    /// Without such a track the answer is `false`.
    pub fn toggle(&self, kind: TrackKind) -> bool {
        match self.track(kind) {
            Some(track) => {
                track.set_enabled(!track.is_enabled());
                track.is_enabled()
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for track in &self.tracks {
            debug!("Stopping local {:?} track {}", track.kind(), track.id());
            track.stop();
        }
    }
}

impl Drop for MediaHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("tracks", &self.tracks.len())
            .field("granted", &self.granted)
            .field("attempt", &self.attempt)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Applies the capture failure policy on top of `MediaDevices`.
pub struct MediaSource {
    devices: Arc<dyn MediaDevices>,
    backoff: Duration,
    max_retries: u32,
}

impl MediaSource {
    pub fn new(devices: Arc<dyn MediaDevices>, config: &CallConfig) -> Self {
        Self {
            devices,
            backoff: config.media_retry_backoff,
            max_retries: config.media_max_retries,
        }
    }

    pub async fn acquire(&self, kind: MediaKind) -> Result<MediaHandle, AcquireError> {
        let mut attempt = AcquisitionAttempt::new(kind);

        let first = self.open_with_retry(kind, &mut attempt).await;
        let err = match first {
            Ok(tracks) => return Ok(self.granted(tracks, kind, attempt)),
            Err(err) => err,
        };

        if !kind.includes_video() || !falls_back(&err) {
            let error = MediaError::from(&err);
            warn!("Media acquisition for {:?} failed: {} ({})", kind, err, error.code());
            return Err(AcquireError { error, attempt });
        }

        warn!("Camera+mic unavailable ({}), falling back to audio only", err);
        attempt.fell_back = true;
        match self.open_with_retry(MediaKind::Audio, &mut attempt).await {
            Ok(tracks) => Ok(self.granted(tracks, MediaKind::Audio, attempt)),
            Err(err) => {
                warn!("Audio-only fallback failed: {}", err);
                Err(AcquireError {
                    error: MediaError::AcquisitionFailed,
                    attempt,
                })
            }
        }
    }

    fn granted(
        &self,
        tracks: Vec<Arc<dyn LocalTrack>>,
        kind: MediaKind,
        attempt: AcquisitionAttempt,
    ) -> MediaHandle {
        info!(
            "Acquired {:?} media: {} track(s) after {} attempt(s)",
            kind,
            tracks.len(),
            attempt.attempts
        );
        MediaHandle::new(tracks, kind, attempt)
    }

    async fn open_with_retry(
        &self,
        kind: MediaKind,
        attempt: &mut AcquisitionAttempt,
    ) -> Result<Vec<Arc<dyn LocalTrack>>, DeviceError> {
        let mut retry = 0;
        loop {
            attempt.attempts += 1;
            match self.devices.open(kind).await {
                Ok(tracks) => return Ok(tracks),
                Err(err) => {
                    if let DeviceError::Platform(detail) = &err {
                        warn!("Capture device platform error: {}", detail);
                    }
                    attempt.last_failure = Some(err.clone());
                    if !retryable(kind, &err) || retry >= self.max_retries {
                        return Err(err);
                    }
                    retry += 1;
                    let delay = self.backoff * retry;
                    debug!(
                        "Capture of {:?} failed with {}, retry {} in {:?}",
                        kind, err, retry, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn retryable(kind: MediaKind, err: &DeviceError) -> bool {
    match kind {
        MediaKind::Audio => matches!(err, DeviceError::DeviceBusyOrUnreadable),
        MediaKind::AudioVideo => falls_back(err),
    }
}

fn falls_back(err: &DeviceError) -> bool {
    matches!(
        err,
        DeviceError::DeviceBusyOrUnreadable
            | DeviceError::DeviceNotFound
            | DeviceError::OverconstrainedRequest
    )
}
