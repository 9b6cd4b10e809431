//! Audio device gateway.
//!
//! Owns the single audio context of the process and hands out scoped access
//! to its output sink and to microphone capture streams. Hardware specifics
//! live behind [`AudioHost`] / [`AudioContext`]; the cpal implementation is in
//! [`crate::audio`].

use crate::error::{Result, TransceiverError};
use crate::retry::RetryPolicy;
use crate::tap::VisualizerTap;
use std::sync::{mpsc, Mutex, MutexGuard};
use std::time::Duration;

/// Lifecycle of the audio context as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    NotInitialized,
    Suspended,
    Running,
    Closed,
}

impl DeviceState {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceState::NotInitialized => "not-initialized",
            DeviceState::Suspended => "suspended",
            DeviceState::Running => "running",
            DeviceState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Snapshot of the live session returned by [`AudioDeviceGateway::ensure_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSession {
    pub sample_rate: u32,
    pub state: DeviceState,
}

/// Microphone processing switches. Voice-oriented processing smears the
/// tones, so data-over-sound capture asks for all of it to be off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub auto_gain_control: bool,
    pub noise_suppression: bool,
    pub channel_count: u16,
}

impl CaptureConstraints {
    pub fn raw() -> Self {
        Self {
            echo_cancellation: false,
            auto_gain_control: false,
            noise_suppression: false,
            channel_count: 1,
        }
    }
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self::raw()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSink {
    pub name: String,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Receives mono capture samples on the audio thread. Must not block.
pub type FrameSink = Box<dyn FnMut(&[f32]) + Send>;

pub trait CaptureStream: Send {
    /// Stops the underlying hardware stream. Calling it again is a no-op.
    fn stop(&mut self);

    fn is_active(&self) -> bool;
}

/// Mono waveform ready for playback at a given rate.
#[derive(Debug, Clone)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Sending half of a playback-completion signal, held by the backend.
pub struct PlaybackCompletion(mpsc::Sender<Result<()>>);

impl PlaybackCompletion {
    pub fn finish(self, outcome: Result<()>) {
        let _ = self.0.send(outcome);
    }
}

/// Receiving half: resolves once the backend reports the end of playback.
pub struct Playback {
    done: mpsc::Receiver<Result<()>>,
    expected: Duration,
}

/// Slack granted on top of the buffer duration before a playback that never
/// reports completion is declared failed.
const PLAYBACK_GRACE: Duration = Duration::from_secs(5);

impl Playback {
    pub fn channel(expected: Duration) -> (PlaybackCompletion, Playback) {
        let (tx, rx) = mpsc::channel();
        (
            PlaybackCompletion(tx),
            Playback {
                done: rx,
                expected,
            },
        )
    }

    pub fn wait(self) -> Result<()> {
        match self.done.recv_timeout(self.expected + PLAYBACK_GRACE) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(TransceiverError::Playback(
                "no completion signal from output stream".into(),
            )),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(TransceiverError::Playback(
                "output stream ended without completing".into(),
            )),
        }
    }
}

/// A live hardware audio context.
pub trait AudioContext: Send {
    /// Current rate in Hz. Zero while the hardware has not settled.
    fn sample_rate(&self) -> u32;

    fn state(&self) -> DeviceState;

    fn resume(&mut self) -> Result<()>;

    fn suspend(&mut self) -> Result<()>;

    fn close(&mut self);

    fn output_sink(&self) -> OutputSink;

    /// Starts playback and returns immediately; completion is signaled
    /// through the returned [`Playback`]. Samples written to the device are
    /// mirrored into `tap` when one is given.
    fn play(&mut self, buffer: PlaybackBuffer, tap: Option<VisualizerTap>) -> Result<Playback>;

    fn open_capture(
        &mut self,
        constraints: &CaptureConstraints,
        sink: FrameSink,
    ) -> Result<Box<dyn CaptureStream>>;
}

pub trait AudioHost: Send + Sync {
    /// Creates a context at `sample_rate`, or at the platform default when
    /// `None`.
    fn create_context(&self, sample_rate: Option<u32>) -> Result<Box<dyn AudioContext>>;
}

/// Owned capture stream. Closing is idempotent and also happens on drop.
pub struct CaptureHandle {
    stream: Option<Box<dyn CaptureStream>>,
}

impl CaptureHandle {
    pub fn is_open(&self) -> bool {
        self.stream.as_ref().map_or(false, |s| s.is_active())
    }

    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
            log::debug!("Capture stream closed");
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct AudioDeviceGateway {
    host: Box<dyn AudioHost>,
    preferred_sample_rate: u32,
    rate_wait: RetryPolicy,
    context: Mutex<Option<Box<dyn AudioContext>>>,
}

impl AudioDeviceGateway {
    pub fn new(host: Box<dyn AudioHost>, preferred_sample_rate: u32, rate_wait: RetryPolicy) -> Self {
        Self {
            host,
            preferred_sample_rate,
            rate_wait,
            context: Mutex::new(None),
        }
    }

    /// Creates, resumes and validates the session. Safe to call repeatedly.
    pub fn ensure_session(&self) -> Result<DeviceSession> {
        let mut slot = self.lock();

        if slot.as_ref().map_or(false, |ctx| ctx.state() == DeviceState::Closed) {
            log::debug!("Dropping closed audio context");
            *slot = None;
        }

        if slot.is_none() {
            *slot = Some(self.create_context()?);
        }

        let ctx = slot
            .as_mut()
            .ok_or_else(|| TransceiverError::DeviceUnavailable("no audio context".into()))?;

        if ctx.state() == DeviceState::Suspended {
            log::debug!("Resuming suspended audio context");
            if let Err(e) = ctx.resume() {
                ctx.close();
                *slot = None;
                return Err(e);
            }
        }

        let rate = self
            .rate_wait
            .poll("audio context sample rate", || Some(ctx.sample_rate()).filter(|r| *r > 0));

        match rate {
            Some(sample_rate) => Ok(DeviceSession {
                sample_rate,
                state: ctx.state(),
            }),
            None => {
                ctx.close();
                *slot = None;
                Err(TransceiverError::DeviceUnavailable(
                    "audio context reported no sample rate".into(),
                ))
            }
        }
    }

    fn create_context(&self) -> Result<Box<dyn AudioContext>> {
        match self.host.create_context(Some(self.preferred_sample_rate)) {
            Ok(ctx) => {
                log::info!("Audio context created at {} Hz", ctx.sample_rate());
                Ok(ctx)
            }
            Err(e) => {
                log::warn!(
                    "Audio context at {} Hz failed ({}), using platform default",
                    self.preferred_sample_rate,
                    e
                );
                let ctx = self.host.create_context(None)?;
                log::info!("Audio context created at default {} Hz", ctx.sample_rate());
                Ok(ctx)
            }
        }
    }

    pub fn state(&self) -> DeviceState {
        self.lock()
            .as_ref()
            .map_or(DeviceState::NotInitialized, |ctx| ctx.state())
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.lock().as_ref().map(|ctx| ctx.sample_rate())
    }

    pub fn output_sink(&self) -> Result<OutputSink> {
        self.with_context(|ctx| Ok(ctx.output_sink()))
    }

    pub fn play(&self, buffer: PlaybackBuffer, tap: Option<VisualizerTap>) -> Result<Playback> {
        self.with_context(|ctx| ctx.play(buffer, tap))
    }

    pub fn open_capture(&self, constraints: &CaptureConstraints, sink: FrameSink) -> Result<CaptureHandle> {
        let stream = self.with_context(|ctx| ctx.open_capture(constraints, sink))?;
        log::debug!("Capture stream opened ({:?})", constraints);
        Ok(CaptureHandle {
            stream: Some(stream),
        })
    }

    pub fn close_capture(&self, handle: &mut CaptureHandle) {
        handle.close();
    }

    pub fn suspend(&self) -> Result<()> {
        let mut slot = self.lock();
        match slot.as_mut() {
            Some(ctx) if ctx.state() == DeviceState::Running => ctx.suspend(),
            _ => Ok(()),
        }
    }

    pub fn close(&self) {
        if let Some(mut ctx) = self.lock().take() {
            ctx.close();
            log::info!("Audio context closed");
        }
    }

    fn with_context<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut Box<dyn AudioContext>) -> Result<T>,
    {
        let mut slot = self.lock();
        match slot.as_mut() {
            Some(ctx) if ctx.state() == DeviceState::Running => op(ctx),
            Some(ctx) => Err(TransceiverError::DeviceUnavailable(format!(
                "audio context is {}",
                ctx.state()
            ))),
            None => Err(TransceiverError::DeviceUnavailable(
                "audio context not initialized".into(),
            )),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn AudioContext>>> {
        self.context.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
