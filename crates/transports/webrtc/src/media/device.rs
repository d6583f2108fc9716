//! Capture devices
//!
//! [`CaptureDevice`] is the seam between the session and the platform's
//! camera/microphone. [`SampleSourceDevice`] is the default: it opens virtual
//! Opus/VP8 tracks that the application feeds with encoded samples through
//! [`LocalTrack::write_sample`](super::LocalTrack::write_sample).

use super::tracks::{LocalStream, LocalTrack, TrackKind};
use crate::config::MediaConstraints;
use crate::{Error, Result};
use async_trait::async_trait;
use tracing::debug;

/// Source of local audio/video tracks
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Open the devices named by `constraints`
    ///
    /// Fails with [`Error::DeviceDenied`] when access is refused and
    /// [`Error::DeviceUnavailable`] when the hardware is missing or busy.
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream>;
}

/// Virtual device fed by the application
#[derive(Debug, Default, Clone)]
pub struct SampleSourceDevice;

impl SampleSourceDevice {
    /// Create the device
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CaptureDevice for SampleSourceDevice {
    async fn open(&self, constraints: &MediaConstraints) -> Result<LocalStream> {
        if !constraints.audio && !constraints.video {
            return Err(Error::DeviceUnavailable(
                "neither audio nor video requested".to_string(),
            ));
        }

        let stream_id = uuid::Uuid::new_v4().simple().to_string();
        let mut tracks = Vec::with_capacity(2);
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, &stream_id));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, &stream_id));
        }

        debug!("Opened sample source stream {} ({} tracks)", stream_id, tracks.len());
        Ok(LocalStream::new(stream_id, tracks, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_opens_requested_tracks() {
        let device = SampleSourceDevice::new();

        let stream = device.open(&MediaConstraints::default()).await.unwrap();
        assert_eq!(stream.tracks().len(), 2);
        assert!(stream.track(TrackKind::Audio).is_some());

        let audio_only = MediaConstraints {
            audio: true,
            video: false,
        };
        let stream = device.open(&audio_only).await.unwrap();
        assert!(stream.track(TrackKind::Video).is_none());
    }

    #[tokio::test]
    async fn test_nothing_requested_is_unavailable() {
        let none = MediaConstraints {
            audio: false,
            video: false,
        };
        let result = SampleSourceDevice::new().open(&none).await;
        assert!(matches!(result, Err(Error::DeviceUnavailable(_))));
    }
}
