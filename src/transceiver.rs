//! Transceiver core.
//!
//! [`Transceiver`] owns the device gateway and the codec binding and runs the
//! state machine below. Transmit and listen share one graph slot, so the
//! capture chain is always gone before a waveform reaches the speaker.
//!
//! ```text
//! Idle ──transmit / start_listening──▶ Initializing ──ready──▶ Transmitting | Listening
//!                                      Initializing ──retries exhausted──▶ Failed
//! Transmitting ──playback complete──▶ Idle (or Listening again if it was listening)
//! Listening ──stop_listening──▶ Idle
//! Failed ──next call──▶ Initializing
//! ```

use crate::codec::{CodecBinding, CodecHandle, CodecLoader, CodecPolicy, ProtocolId};
use crate::error::{Result, TransceiverError};
use crate::gateway::{
    AudioDeviceGateway, AudioHost, CaptureConstraints, CaptureHandle, DeviceSession, DeviceState,
    FrameSink, PlaybackBuffer,
};
use crate::protocol::{samples_to_frame_bytes, Deframing, Framer};
use crate::tap::VisualizerTap;
use crate::topology::{GraphKind, GraphSlot, GraphTopology};
use crate::Config;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Frames buffered between the capture callback and the decode thread.
const FRAME_QUEUE_DEPTH: usize = 64;
const FRAME_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransceiverState {
    #[default]
    Idle,
    Initializing,
    Transmitting,
    Listening,
    Failed,
}

impl TransceiverState {
    pub fn label(&self) -> &'static str {
        match self {
            TransceiverState::Idle => "Idle",
            TransceiverState::Initializing => "Initializing",
            TransceiverState::Transmitting => "Transmitting",
            TransceiverState::Listening => "Listening",
            TransceiverState::Failed => "Failed",
        }
    }
}

/// Decoded-text subscriber. Runs on the decode thread and must not call back
/// into the [`Transceiver`].
pub type Listener = Box<dyn FnMut(String) + Send>;
type SharedListener = Arc<Mutex<Listener>>;

/// capture stream → framer/decoder thread → (muted) sink.
struct CaptureGraph {
    capture: CaptureHandle,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Drop for CaptureGraph {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.capture.close();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
        log::debug!("Capture graph torn down");
    }
}

enum ActiveGraph {
    Listen(CaptureGraph),
    Transmit,
}

struct Core {
    graph: GraphSlot<ActiveGraph>,
    listener: Option<SharedListener>,
}

pub struct Transceiver {
    config: Config,
    gateway: AudioDeviceGateway,
    codec: CodecBinding,
    state: Mutex<TransceiverState>,
    core: Mutex<Core>,
    tap: Mutex<Option<VisualizerTap>>,
}

impl Transceiver {
    pub fn new<H, L>(config: Config, host: H, loader: L) -> Self
    where
        H: AudioHost + 'static,
        L: CodecLoader + 'static,
    {
        let gateway = AudioDeviceGateway::new(
            Box::new(host),
            config.preferred_sample_rate,
            config.device_rate_wait,
        );
        let codec = CodecBinding::new(
            Box::new(loader),
            CodecPolicy {
                load: config.codec_load,
                init: config.codec_init,
                sound_marker_threshold: config.sound_marker_threshold,
            },
        );

        Self {
            config,
            gateway,
            codec,
            state: Mutex::new(TransceiverState::Idle),
            core: Mutex::new(Core {
                graph: GraphSlot::new(),
                listener: None,
            }),
            tap: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Brings up the device session and codec ahead of the first call.
    pub fn init(&self) -> Result<DeviceSession> {
        let core = self.lock_core();
        let (session, _) = self.ensure_ready()?;
        self.set_state(match core.graph.kind() {
            Some(GraphKind::Listen) => TransceiverState::Listening,
            _ => TransceiverState::Idle,
        });
        Ok(session)
    }

    /// Stops listening and releases the codec and the audio context.
    pub fn shutdown(&self) {
        let mut core = self.lock_core();
        core.graph.take();
        core.listener = None;
        if let Some(tap) = lock(&self.tap).take() {
            tap.detach();
        }
        self.codec.release();
        self.gateway.close();
        self.set_state(TransceiverState::Idle);
        log::info!("Transceiver shut down");
    }

    pub fn state(&self) -> TransceiverState {
        *lock(&self.state)
    }

    pub fn is_transmitting(&self) -> bool {
        self.state() == TransceiverState::Transmitting
    }

    pub fn is_listening(&self) -> bool {
        self.lock_core().graph.kind() == Some(GraphKind::Listen)
    }

    pub fn current_device_state(&self) -> DeviceState {
        match self.gateway.state() {
            DeviceState::Closed => DeviceState::NotInitialized,
            state => state,
        }
    }

    /// Suspends the audio context. An active listen graph is torn down first.
    pub fn suspend_device(&self) -> Result<()> {
        let mut core = self.lock_core();
        if self.teardown_capture(&mut core) {
            core.listener = None;
            self.set_state(TransceiverState::Idle);
        }
        self.gateway.suspend()
    }

    /// Encodes `text` and plays it, returning once playback has finished.
    pub fn transmit(&self, text: &str, use_fastest: bool) -> Result<()> {
        self.transmit_with(text, self.config.mode.protocol(use_fastest))
    }

    pub fn transmit_with(&self, text: &str, protocol: ProtocolId) -> Result<()> {
        if text.trim().is_empty() {
            return Err(TransceiverError::Encode("empty message".into()));
        }

        let mut core = self.lock_core();
        let was_listening = self.teardown_capture(&mut core);

        let outcome = self.play_message(&mut core, text, protocol);
        match &outcome {
            Ok(()) => {
                log::info!("Transmission complete");
                self.set_state(TransceiverState::Idle);
            }
            Err(e) => {
                log::error!("Transmission failed: {}", e);
                self.set_state(TransceiverState::Failed);
            }
        }

        if was_listening {
            if let Err(e) = self.wire_capture(&mut core) {
                log::warn!("Could not resume listening after transmission: {}", e);
                core.listener = None;
            }
        }

        outcome
    }

    fn play_message(&self, core: &mut Core, text: &str, protocol: ProtocolId) -> Result<()> {
        let (session, codec) = self.ensure_ready()?;

        let samples = codec.encode(text, protocol, self.config.volume)?;
        let buffer = PlaybackBuffer::new(samples, session.sample_rate);
        let tap = lock(&self.tap).clone();

        core.graph.install(
            GraphTopology::transmit(buffer.samples.len(), tap.is_some()),
            ActiveGraph::Transmit,
        )?;
        self.set_state(TransceiverState::Transmitting);
        log::info!(
            "Transmitting {} chars via {:?} ({:.0} ms)",
            text.chars().count(),
            protocol,
            buffer.duration().as_secs_f64() * 1000.0
        );

        if let Some(tap) = &tap {
            tap.attach();
        }
        let result = self.gateway.play(buffer, tap.clone()).and_then(|playback| playback.wait());
        if let Some(tap) = &tap {
            tap.detach();
        }

        core.graph.take();
        result
    }

    /// Registers `on_decoded` and starts capturing. While already listening
    /// the new callback replaces the current one and no second capture is
    /// opened.
    pub fn start_listening<F>(&self, on_decoded: F) -> Result<()>
    where
        F: FnMut(String) + Send + 'static,
    {
        let listener: Listener = Box::new(on_decoded);
        let mut core = self.lock_core();

        if core.graph.kind() == Some(GraphKind::Listen) {
            if let Some(current) = &core.listener {
                *lock(current) = listener;
            }
            log::debug!("Already listening, subscriber replaced");
            return Ok(());
        }

        core.listener = Some(Arc::new(Mutex::new(listener)));
        let result = self.wire_capture(&mut core);
        if result.is_err() {
            core.listener = None;
        }
        result
    }

    /// Channel flavour of [`Transceiver::start_listening`].
    pub fn listen_channel(&self) -> Result<Receiver<String>> {
        let (tx, rx) = mpsc::channel();
        self.start_listening(move |text| {
            let _ = tx.send(text);
        })?;
        Ok(rx)
    }

    pub fn stop_listening(&self) {
        let mut core = self.lock_core();
        if self.teardown_capture(&mut core) {
            log::info!("Stopped listening");
        }
        core.listener = None;
        self.set_state(TransceiverState::Idle);
    }

    /// Creates the visualizer tap on first use. `None` until the audio
    /// context exists.
    pub fn create_visualizer_tap(&self) -> Option<VisualizerTap> {
        if self.current_device_state() == DeviceState::NotInitialized {
            log::warn!("Cannot create visualizer tap: audio context not initialized");
            return None;
        }
        let mut slot = lock(&self.tap);
        let tap = slot.get_or_insert_with(|| {
            VisualizerTap::new(self.config.tap_fft_size, self.config.tap_smoothing)
        });
        Some(tap.clone())
    }

    pub fn visualizer_tap(&self) -> Option<VisualizerTap> {
        lock(&self.tap).clone()
    }

    pub fn release_visualizer_tap(&self) {
        if let Some(tap) = lock(&self.tap).take() {
            tap.detach();
        }
    }

    fn ensure_ready(&self) -> Result<(DeviceSession, CodecHandle)> {
        let ready = self.gateway.state() == DeviceState::Running && self.codec.handle().is_some();
        if !ready {
            self.set_state(TransceiverState::Initializing);
        }

        let result = self.gateway.ensure_session().and_then(|session| {
            let codec = self.codec.ensure_codec(session.sample_rate)?;
            Ok((session, codec))
        });

        if let Err(e) = &result {
            log::error!("Transceiver initialization failed: {}", e);
            self.set_state(TransceiverState::Failed);
        }
        result
    }

    fn wire_capture(&self, core: &mut Core) -> Result<()> {
        let listener = core
            .listener
            .clone()
            .ok_or(TransceiverError::GraphBusy("no listener registered"))?;

        let result = self.build_capture_graph(listener).and_then(|graph| {
            core.graph.install(
                GraphTopology::listen(self.config.frame_size),
                ActiveGraph::Listen(graph),
            )
        });

        match &result {
            Ok(()) => {
                log::info!("Listening ({} sample frames)", self.config.frame_size);
                self.set_state(TransceiverState::Listening);
            }
            Err(e) => {
                log::error!("Could not start listening: {}", e);
                self.set_state(TransceiverState::Failed);
            }
        }
        result
    }

    fn build_capture_graph(&self, listener: SharedListener) -> Result<CaptureGraph> {
        let (_, codec) = self.ensure_ready()?;

        let (frames_tx, frames_rx) = mpsc::sync_channel::<Vec<f32>>(FRAME_QUEUE_DEPTH);
        let mut framer = Framer::new(self.config.frame_size);
        let sink: FrameSink = Box::new(move |samples: &[f32]| {
            framer.push(samples, |frame| match frames_tx.try_send(frame) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(_)) => log::debug!("Decoder behind, frame dropped"),
            });
        });

        let capture = self.gateway.open_capture(&CaptureConstraints::raw(), sink)?;

        let running = Arc::new(AtomicBool::new(true));
        let worker = {
            let running = Arc::clone(&running);
            let deframing = self.config.deframing;
            thread::Builder::new()
                .name("decode".into())
                .spawn(move || decode_loop(frames_rx, &running, &codec, deframing, &listener))?
        };

        Ok(CaptureGraph {
            capture,
            running,
            worker: Some(worker),
        })
    }

    /// Removes a live listen graph, blocking until the decode thread has
    /// exited. Returns whether one was live.
    fn teardown_capture(&self, core: &mut Core) -> bool {
        if core.graph.kind() != Some(GraphKind::Listen) {
            return false;
        }
        if let Some((_, ActiveGraph::Listen(mut graph))) = core.graph.take() {
            self.gateway.close_capture(&mut graph.capture);
        }
        true
    }

    fn set_state(&self, next: TransceiverState) {
        let mut state = lock(&self.state);
        if *state != next {
            log::debug!("Transceiver {} -> {}", state.label(), next.label());
            *state = next;
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, Core> {
        lock(&self.core)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn decode_loop(
    frames: Receiver<Vec<f32>>,
    running: &AtomicBool,
    codec: &CodecHandle,
    deframing: Deframing,
    listener: &SharedListener,
) {
    loop {
        match frames.recv_timeout(FRAME_POLL) {
            Ok(frame) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                let Some(payload) = codec.decode(&samples_to_frame_bytes(&frame)) else {
                    continue;
                };
                match deframing.apply(&payload) {
                    Some(text) => {
                        log::info!("Decoded message ({} bytes)", payload.len());
                        let mut callback = lock(listener);
                        (*callback)(text);
                    }
                    None => log::debug!("Decoded empty payload, ignored"),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("Decode thread exiting");
}
