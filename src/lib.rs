pub mod audio;
pub mod codec;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod retry;
pub mod tap;
pub mod topology;
pub mod transceiver;

#[cfg(test)]
mod fakes;

pub use codec::{CodecEngine, CodecHandle, CodecLoader, CodecParameters, InstanceId, ProtocolId};
pub use error::*;
pub use gateway::{AudioContext, AudioHost, CaptureConstraints, DeviceSession, DeviceState};
pub use protocol::Deframing;
pub use retry::RetryPolicy;
pub use tap::VisualizerTap;
pub use transceiver::{Transceiver, TransceiverState};

use std::time::Duration;

pub const PREFERRED_SAMPLE_RATE: u32 = 48000;
pub const FRAME_SIZE: usize = 1024;
pub const DEFAULT_VOLUME: u8 = 10;
pub const SOUND_MARKER_THRESHOLD: f32 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransmissionMode {
    Audible,
    Ultrasonic,
}

impl TransmissionMode {
    pub fn protocol(&self, fastest: bool) -> ProtocolId {
        match (self, fastest) {
            (TransmissionMode::Audible, false) => ProtocolId::AudibleFast,
            (TransmissionMode::Audible, true) => ProtocolId::AudibleFastest,
            (TransmissionMode::Ultrasonic, false) => ProtocolId::UltrasoundFast,
            (TransmissionMode::Ultrasonic, true) => ProtocolId::UltrasoundFastest,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: TransmissionMode,
    pub preferred_sample_rate: u32,
    pub frame_size: usize,
    pub volume: u8,
    pub sound_marker_threshold: f32,
    pub deframing: Deframing,
    /// Wait for a resumed context to report a usable sample rate.
    pub device_rate_wait: RetryPolicy,
    /// Wait for the codec engine module to become available.
    pub codec_load: RetryPolicy,
    /// Retries of spurious invalid codec instances.
    pub codec_init: RetryPolicy,
    pub tap_fft_size: usize,
    pub tap_smoothing: f32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: TransmissionMode::Audible,
            preferred_sample_rate: PREFERRED_SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            volume: DEFAULT_VOLUME,
            sound_marker_threshold: SOUND_MARKER_THRESHOLD,
            deframing: Deframing::SenderTag,
            device_rate_wait: RetryPolicy::new(10, Duration::from_millis(100)),
            codec_load: RetryPolicy::new(20, Duration::from_millis(100)),
            codec_init: RetryPolicy::new(5, Duration::from_millis(200)),
            tap_fft_size: tap::DEFAULT_FFT_SIZE,
            tap_smoothing: tap::DEFAULT_SMOOTHING,
        }
    }
}
