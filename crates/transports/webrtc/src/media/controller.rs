//! Media Controller
//!
//! Owns the session's single [`LocalStream`]. Enable toggles are remembered
//! and applied to whatever stream is current, so toggling before acquisition
//! or across a re-acquire behaves the same.

use super::device::CaptureDevice;
use super::tracks::{LocalStream, TrackKind};
use crate::config::MediaConstraints;
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Acquires, toggles and releases local capture devices
pub struct MediaController {
    device: Arc<dyn CaptureDevice>,
    constraints: MediaConstraints,
    stream: Option<LocalStream>,
    audio_enabled: bool,
    video_enabled: bool,
}

impl MediaController {
    /// Create a controller for `device`
    pub fn new(device: Arc<dyn CaptureDevice>, constraints: MediaConstraints) -> Self {
        Self {
            device,
            constraints,
            stream: None,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    /// Open the capture devices
    ///
    /// A second call before [`release`](Self::release) is a caller error.
    pub async fn acquire(&mut self) -> Result<&LocalStream> {
        self.acquire_until(std::future::pending::<()>()).await
    }

    /// Open the capture devices unless `cancelled` resolves first
    ///
    /// The device open keeps running on its own task when cancelled; whatever it
    /// eventually produces is released immediately instead of leaking.
    #[instrument(skip(self, cancelled))]
    pub async fn acquire_until<F>(&mut self, cancelled: F) -> Result<&LocalStream>
    where
        F: Future<Output = ()>,
    {
        if self.stream.is_some() {
            return Err(Error::InvalidState(
                "media already acquired; release before acquiring again".to_string(),
            ));
        }

        let device = Arc::clone(&self.device);
        let constraints = self.constraints;
        let mut open = tokio::spawn(async move { device.open(&constraints).await });

        let joined = tokio::select! {
            joined = &mut open => Some(joined),
            _ = cancelled => None,
        };

        let Some(joined) = joined else {
            warn!("Media acquisition cancelled, releasing devices when the open completes");
            tokio::spawn(async move {
                if let Ok(Ok(mut stream)) = open.await {
                    stream.release();
                }
            });
            return Err(Error::Cancelled("media acquisition".to_string()));
        };

        let stream = joined
            .map_err(|e| Error::DeviceUnavailable(format!("capture task failed: {}", e)))??;
        stream.set_enabled(TrackKind::Audio, self.audio_enabled);
        stream.set_enabled(TrackKind::Video, self.video_enabled);
        info!(
            "Acquired local stream {} ({} tracks)",
            stream.id(),
            stream.tracks().len()
        );

        Ok(self.stream.insert(stream))
    }

    /// Stop all tracks; safe to call any number of times
    pub fn release(&mut self) {
        match self.stream.take() {
            Some(mut stream) => stream.release(),
            None => debug!("Media release: nothing acquired"),
        }
    }

    /// Enable or disable the camera without renegotiating
    pub fn set_video_enabled(&mut self, enabled: bool) {
        self.video_enabled = enabled;
        if let Some(stream) = &self.stream {
            stream.set_enabled(TrackKind::Video, enabled);
        }
    }

    /// Enable or disable the microphone without renegotiating
    pub fn set_audio_enabled(&mut self, enabled: bool) {
        self.audio_enabled = enabled;
        if let Some(stream) = &self.stream {
            stream.set_enabled(TrackKind::Audio, enabled);
        }
    }

    /// Current video preference
    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    /// Current audio preference
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    /// Current stream, if acquired
    pub fn stream(&self) -> Option<&LocalStream> {
        self.stream.as_ref()
    }

    /// Whether a stream is held
    pub fn is_acquired(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for MediaController {
    fn drop(&mut self) {
        self.release();
    }
}
