//! cpal-backed audio host.
//!
//! `cpal::Stream` is not `Send`, so every stream is built, played and dropped
//! on its own thread. The context only keeps devices and the negotiated rate.

use crate::error::{Result, TransceiverError};
use crate::gateway::{
    AudioContext, AudioHost, CaptureConstraints, CaptureStream, DeviceState, FrameSink, OutputSink,
    Playback, PlaybackBuffer,
};
use crate::protocol::downmix;
use crate::tap::VisualizerTap;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, SampleRate, StreamConfig};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Time left for the device to drain its last buffer before the stream is
/// dropped.
const DRAIN: Duration = Duration::from_millis(100);
const COMPLETION_GRACE: Duration = Duration::from_secs(2);

/// Default host of the platform.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalHost;

impl AudioHost for CpalHost {
    fn create_context(&self, sample_rate: Option<u32>) -> Result<Box<dyn AudioContext>> {
        let host = cpal::default_host();
        let output = host
            .default_output_device()
            .ok_or_else(|| TransceiverError::DeviceUnavailable("No output device found".into()))?;

        let default = output
            .default_output_config()
            .map_err(|e| TransceiverError::DeviceUnavailable(e.to_string()))?;

        let sample_rate = match sample_rate {
            Some(rate) => {
                if !supports_rate(&output, rate)? {
                    return Err(TransceiverError::DeviceUnavailable(format!(
                        "{} Hz not supported by output device",
                        rate
                    )));
                }
                rate
            }
            None => default.sample_rate().0,
        };

        let input = host.default_input_device();
        if input.is_none() {
            log::warn!("No input device found, listening will be unavailable");
        }

        Ok(Box::new(CpalContext {
            output,
            input,
            sample_rate,
            output_channels: default.channels(),
            state: DeviceState::Running,
        }))
    }
}

fn supports_rate(device: &Device, rate: u32) -> Result<bool> {
    let mut configs = device
        .supported_output_configs()
        .map_err(|e| TransceiverError::DeviceUnavailable(e.to_string()))?;
    Ok(configs.any(|c| c.min_sample_rate().0 <= rate && rate <= c.max_sample_rate().0))
}

fn map_build_error(err: BuildStreamError) -> TransceiverError {
    match err {
        BuildStreamError::BackendSpecific { err } => {
            let description = err.description.to_lowercase();
            if description.contains("permission") || description.contains("denied") {
                TransceiverError::PermissionDenied(err.description)
            } else {
                TransceiverError::DeviceUnavailable(err.description)
            }
        }
        other => TransceiverError::DeviceUnavailable(other.to_string()),
    }
}

pub struct CpalContext {
    output: Device,
    input: Option<Device>,
    sample_rate: u32,
    output_channels: u16,
    state: DeviceState,
}

impl AudioContext for CpalContext {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn resume(&mut self) -> Result<()> {
        if self.state == DeviceState::Closed {
            return Err(TransceiverError::DeviceUnavailable("audio context closed".into()));
        }
        self.state = DeviceState::Running;
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        if self.state == DeviceState::Running {
            self.state = DeviceState::Suspended;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.state = DeviceState::Closed;
    }

    fn output_sink(&self) -> OutputSink {
        OutputSink {
            name: self.output.name().unwrap_or_else(|_| "unknown".into()),
            sample_rate: self.sample_rate,
            channels: self.output_channels,
        }
    }

    fn play(&mut self, buffer: PlaybackBuffer, tap: Option<VisualizerTap>) -> Result<Playback> {
        let (completion, playback) = Playback::channel(buffer.duration());
        let (started_tx, started_rx) = mpsc::channel();
        let device = self.output.clone();
        let config = StreamConfig {
            channels: self.output_channels,
            sample_rate: SampleRate(buffer.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        thread::Builder::new()
            .name("playback".into())
            .spawn(move || {
                let outcome = run_playback(&device, &config, buffer, tap, started_tx);
                completion.finish(outcome);
            })?;

        started_rx
            .recv()
            .map_err(|_| TransceiverError::Playback("playback thread exited".into()))??;
        Ok(playback)
    }

    fn open_capture(
        &mut self,
        constraints: &CaptureConstraints,
        sink: FrameSink,
    ) -> Result<Box<dyn CaptureStream>> {
        let device = self
            .input
            .clone()
            .ok_or_else(|| TransceiverError::DeviceUnavailable("No input device found".into()))?;

        let supported = device
            .default_input_config()
            .map_err(|e| TransceiverError::DeviceUnavailable(e.to_string()))?;
        let channels = supported.channels();
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // cpal delivers the raw device signal; none of the voice processing
        // the constraints turn off is applied on this path.
        log::debug!(
            "Opening capture on {} ({} ch, {} Hz, aec={}, agc={}, ns={})",
            device.name().unwrap_or_else(|_| "unknown".into()),
            channels,
            self.sample_rate,
            constraints.echo_cancellation,
            constraints.auto_gain_control,
            constraints.noise_suppression
        );

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("capture".into())
            .spawn(move || run_capture(&device, &config, sink, started_tx, stop_rx))?;

        started_rx
            .recv()
            .map_err(|_| TransceiverError::DeviceUnavailable("capture thread exited".into()))??;

        Ok(Box::new(CpalCapture {
            stop: Some(stop_tx),
            worker: Some(worker),
        }))
    }
}

fn run_playback(
    device: &Device,
    config: &StreamConfig,
    buffer: PlaybackBuffer,
    tap: Option<VisualizerTap>,
    started: mpsc::Sender<Result<()>>,
) -> Result<()> {
    let channels = config.channels.max(1) as usize;
    let expected = buffer.duration();
    let samples = buffer.samples;
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let mut done_tx = Some(done_tx);
    let mut position = 0usize;

    let stream = device.build_output_stream(
        config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            let end = (position + frames).min(samples.len());

            if let Some(tap) = &tap {
                tap.write(&samples[position.min(end)..end]);
            }

            for (i, frame) in data.chunks_mut(channels).enumerate() {
                let sample = samples.get(position + i).copied().unwrap_or(0.0);
                frame.fill(sample);
            }
            position += frames;

            if position >= samples.len() {
                if let Some(tx) = done_tx.take() {
                    let _ = tx.send(());
                }
            }
        },
        |err| log::error!("Audio output error: {}", err),
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = started.send(Err(map_build_error(e)));
            return Err(TransceiverError::Playback("output stream not built".into()));
        }
    };

    if let Err(e) = stream.play() {
        let _ = started.send(Err(TransceiverError::DeviceUnavailable(e.to_string())));
        return Err(TransceiverError::Playback("output stream not started".into()));
    }
    let _ = started.send(Ok(()));

    let outcome = match done_rx.recv_timeout(expected + COMPLETION_GRACE) {
        Ok(()) => {
            thread::sleep(DRAIN);
            Ok(())
        }
        Err(_) => Err(TransceiverError::Playback("output stream stalled".into())),
    };

    drop(stream);
    outcome
}

fn run_capture(
    device: &Device,
    config: &StreamConfig,
    mut sink: FrameSink,
    started: mpsc::Sender<Result<()>>,
    stop: mpsc::Receiver<()>,
) {
    let channels = config.channels.max(1) as usize;

    let stream = device.build_input_stream(
        config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            if channels == 1 {
                sink(data);
            } else {
                sink(&downmix(data, channels));
            }
        },
        |err| log::error!("Audio input error: {}", err),
        None,
    );

    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            let _ = started.send(Err(map_build_error(e)));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = started.send(Err(TransceiverError::DeviceUnavailable(e.to_string())));
        return;
    }
    let _ = started.send(Ok(()));

    // Returns when the handle sends or is dropped.
    let _ = stop.recv();
    drop(stream);
}

struct CpalCapture {
    stop: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureStream for CpalCapture {
    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn is_active(&self) -> bool {
        self.stop.is_some()
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn list_audio_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                devices.push(format!("Output: {}", name));
            }
        }
    }

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                devices.push(format!("Input: {}", name));
            }
        }
    }

    devices
}
