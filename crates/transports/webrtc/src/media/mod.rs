//! Media Controller and local capture tracks
//!
//! Acquisition and release of the local camera/microphone, plus mute toggles
//! that never touch the network path.

pub mod controller;
pub mod device;
pub mod tracks;

pub use controller::MediaController;
pub use device::{CaptureDevice, SampleSourceDevice};
pub use tracks::{DeviceLease, LocalStream, LocalTrack, TrackKind};
