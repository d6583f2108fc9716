//! Local media tracks and streams
//!
//! A [`LocalTrack`] wraps a `TrackLocalStaticSample` with an enabled flag.
//! Toggling the flag mutes the track in place: the track stays attached to the
//! peer connection, so no renegotiation happens. Clones share the same flags.

use crate::{Error, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Microphone
    Audio,
    /// Camera
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// Local capture track
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,

    /// Track id as announced in SDP
    id: String,

    /// Sample track handed to the peer connection
    rtc: Arc<TrackLocalStaticSample>,

    /// Enabled flag (mute/unmute)
    enabled: Arc<AtomicBool>,

    /// Set once the owning stream is released
    stopped: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create a track of `kind` belonging to stream `stream_id`
    ///
    /// Audio tracks use Opus at 48 kHz stereo, video tracks VP8 at 90 kHz.
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let capability = match kind {
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
        };

        let id = format!("{}-{}", kind, stream_id);
        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_id.to_string(),
        ));

        Self {
            kind,
            id,
            rtc,
            enabled: Arc::new(AtomicBool::new(true)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Track kind
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Track id as announced in SDP
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sample track for attaching to a peer connection
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtc)
    }

    /// Whether samples are currently forwarded
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the enabled flag
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            debug!("{} track {} enabled={}", self.kind, self.id(), enabled);
        }
    }

    /// Whether the owning stream has been released
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Write one encoded sample
    ///
    /// Returns `Ok(false)` when the sample was dropped because the track is
    /// disabled or stopped.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool> {
        if self.is_stopped() || !self.is_enabled() {
            return Ok(false);
        }

        self.rtc
            .write_sample(sample)
            .await
            .map_err(|e| Error::WebRtc(format!("Failed to write {} sample: {}", self.kind, e)))?;

        Ok(true)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Handle on the underlying capture hardware, released exactly once
pub trait DeviceLease: Send + Sync {
    /// Return the devices to the platform
    fn release(self: Box<Self>);
}

/// Set of local tracks opened together by a capture device
///
/// Dropping the stream releases the device lease if [`LocalStream::release`]
/// was never called.
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
    lease: Option<Box<dyn DeviceLease>>,
}

impl LocalStream {
    /// Assemble a stream from tracks and the lease that keeps the devices open
    pub fn new(
        id: impl Into<String>,
        tracks: Vec<LocalTrack>,
        lease: Option<Box<dyn DeviceLease>>,
    ) -> Self {
        Self {
            id: id.into(),
            tracks,
            lease,
        }
    }

    /// Stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// First track of `kind`
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    /// Set the enabled flag on every track of `kind`
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }

    /// Whether the stream has been released
    pub fn is_released(&self) -> bool {
        self.lease.is_none() && self.tracks.iter().all(LocalTrack::is_stopped)
    }

    /// Stop all tracks and release the device; later calls are no-ops
    pub fn release(&mut self) {
        for track in &self.tracks {
            track.stop();
        }
        if let Some(lease) = self.lease.take() {
            info!("Releasing capture devices for stream {}", self.id);
            lease.release();
        }
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .field("released", &self.lease.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingLease(Arc<AtomicUsize>);

    impl DeviceLease for CountingLease {
        fn release(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stream(releases: &Arc<AtomicUsize>) -> LocalStream {
        LocalStream::new(
            "s-1",
            vec![
                LocalTrack::new(TrackKind::Audio, "s-1"),
                LocalTrack::new(TrackKind::Video, "s-1"),
            ],
            Some(Box::new(CountingLease(Arc::clone(releases)))),
        )
    }

    fn sample() -> Sample {
        Sample {
            data: Bytes::from_static(&[0u8; 16]),
            duration: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[test]
    fn test_release_is_idempotent() {
        let releases = Arc::new(AtomicUsize::new(0));
        let mut stream = stream(&releases);

        stream.release();
        stream.release();
        assert!(stream.is_released());
        drop(stream);

        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_releases_device() {
        let releases = Arc::new(AtomicUsize::new(0));
        drop(stream(&releases));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_toggle_shared_between_clones() {
        let releases = Arc::new(AtomicUsize::new(0));
        let stream = stream(&releases);
        let attached = stream.track(TrackKind::Video).unwrap().clone();

        stream.set_enabled(TrackKind::Video, false);
        assert!(!attached.is_enabled());
        assert!(stream.track(TrackKind::Audio).unwrap().is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_track_drops_samples() {
        let track = LocalTrack::new(TrackKind::Audio, "s-2");
        assert!(track.write_sample(&sample()).await.unwrap());

        track.set_enabled(false);
        assert!(!track.write_sample(&sample()).await.unwrap());

        track.set_enabled(true);
        track.stop();
        assert!(!track.write_sample(&sample()).await.unwrap());
    }
}
