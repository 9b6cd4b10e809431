//! In-memory audio host and codec engine used by the unit tests.
//!
//! The fake engine is a faithful stub: its waveform carries the payload bytes
//! verbatim between sentinel samples, and its decoder recovers them from the
//! little-endian frames the transceiver hands it.

use crate::codec::{CodecEngine, CodecParameters, InstanceId, ProtocolId};
use crate::error::{Result, TransceiverError};
use crate::gateway::{
    AudioContext, AudioHost, CaptureConstraints, CaptureStream, DeviceState, FrameSink, OutputSink,
    Playback, PlaybackBuffer,
};
use crate::tap::VisualizerTap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

const START: f32 = 2.0;
const END: f32 = -2.0;

struct HostState {
    default_rate: u32,
    rejected_rates: Vec<u32>,
    unavailable: bool,
    zero_rate_reads: u32,
    deny_microphone: bool,
    contexts_created: u32,
    captures_opened: u32,
    next_capture_id: u64,
    mic: Option<(u64, FrameSink)>,
    last_constraints: Option<CaptureConstraints>,
    play_delay: Duration,
    loopback: bool,
    loopback_delivered: u32,
    played: Vec<Vec<f32>>,
    events: Vec<String>,
}

#[derive(Clone)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HostState {
                default_rate: 44100,
                rejected_rates: Vec::new(),
                unavailable: false,
                zero_rate_reads: 0,
                deny_microphone: false,
                contexts_created: 0,
                captures_opened: 0,
                next_capture_id: 0,
                mic: None,
                last_constraints: None,
                play_delay: Duration::from_millis(5),
                loopback: false,
                loopback_delivered: 0,
                played: Vec::new(),
                events: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    pub fn default_rate(&self) -> u32 {
        self.lock().default_rate
    }

    pub fn reject_rate(&self, rate: u32) {
        self.lock().rejected_rates.push(rate);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn zero_rate_reads(&self, reads: u32) {
        self.lock().zero_rate_reads = reads;
    }

    pub fn deny_microphone(&self, deny: bool) {
        self.lock().deny_microphone = deny;
    }

    pub fn set_play_delay(&self, delay: Duration) {
        self.lock().play_delay = delay;
    }

    /// Routes played samples straight into the open microphone, if any.
    pub fn set_loopback(&self, loopback: bool) {
        self.lock().loopback = loopback;
    }

    pub fn contexts_created(&self) -> u32 {
        self.lock().contexts_created
    }

    /// Capture streams currently open.
    pub fn open_captures(&self) -> u32 {
        u32::from(self.lock().mic.is_some())
    }

    pub fn captures_opened(&self) -> u32 {
        self.lock().captures_opened
    }

    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        self.lock().last_constraints
    }

    pub fn loopback_delivered(&self) -> u32 {
        self.lock().loopback_delivered
    }

    pub fn last_played(&self) -> Option<Vec<f32>> {
        self.lock().played.last().cloned()
    }

    pub fn events(&self) -> Vec<String> {
        self.lock().events.clone()
    }

    /// Pushes samples into the open microphone. Returns false when no
    /// capture stream is open.
    pub fn feed(&self, samples: &[f32]) -> bool {
        let mut state = self.lock();
        match state.mic.as_mut() {
            Some((_, sink)) => {
                for chunk in samples.chunks(480) {
                    sink(chunk);
                }
                true
            }
            None => false,
        }
    }
}

impl AudioHost for FakeHost {
    fn create_context(&self, sample_rate: Option<u32>) -> Result<Box<dyn AudioContext>> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(TransceiverError::DeviceUnavailable("no fake device".into()));
        }
        let rate = sample_rate.unwrap_or(state.default_rate);
        if state.rejected_rates.contains(&rate) {
            return Err(TransceiverError::DeviceUnavailable(format!("{} Hz unsupported", rate)));
        }
        state.contexts_created += 1;
        Ok(Box::new(FakeContext {
            host: self.clone(),
            rate,
            state: DeviceState::Running,
        }))
    }
}

struct FakeContext {
    host: FakeHost,
    rate: u32,
    state: DeviceState,
}

impl AudioContext for FakeContext {
    fn sample_rate(&self) -> u32 {
        let mut host = self.host.lock();
        if host.zero_rate_reads > 0 {
            host.zero_rate_reads -= 1;
            return 0;
        }
        self.rate
    }

    fn state(&self) -> DeviceState {
        self.state
    }

    fn resume(&mut self) -> Result<()> {
        self.state = DeviceState::Running;
        Ok(())
    }

    fn suspend(&mut self) -> Result<()> {
        self.state = DeviceState::Suspended;
        Ok(())
    }

    fn close(&mut self) {
        self.state = DeviceState::Closed;
    }

    fn output_sink(&self) -> OutputSink {
        OutputSink {
            name: "fake speaker".into(),
            sample_rate: self.rate,
            channels: 1,
        }
    }

    fn play(&mut self, buffer: PlaybackBuffer, tap: Option<VisualizerTap>) -> Result<Playback> {
        let (completion, playback) = Playback::channel(buffer.duration());
        let host = self.host.clone();
        let delay = {
            let mut state = host.lock();
            state.events.push("play_start".into());
            state.played.push(buffer.samples.clone());
            state.play_delay
        };

        thread::spawn(move || {
            if let Some(tap) = &tap {
                if tap.is_attached() {
                    host.lock().events.push("tap_attached".into());
                }
                tap.write(&buffer.samples);
            }
            let echoed = {
                let state = host.lock();
                state.loopback && state.mic.is_some()
            };
            if echoed {
                host.feed(&buffer.samples);
                host.lock().loopback_delivered += 1;
            }
            thread::sleep(delay);
            host.lock().events.push("play_end".into());
            completion.finish(Ok(()));
        });

        Ok(playback)
    }

    fn open_capture(
        &mut self,
        constraints: &CaptureConstraints,
        sink: FrameSink,
    ) -> Result<Box<dyn CaptureStream>> {
        let mut state = self.host.lock();
        if state.deny_microphone {
            return Err(TransceiverError::PermissionDenied("fake user said no".into()));
        }
        state.next_capture_id += 1;
        let id = state.next_capture_id;
        state.mic = Some((id, sink));
        state.captures_opened += 1;
        state.last_constraints = Some(*constraints);
        state.events.push("capture_open".into());
        Ok(Box::new(FakeCapture {
            host: self.host.clone(),
            id,
            active: true,
        }))
    }
}

struct FakeCapture {
    host: FakeHost,
    id: u64,
    active: bool,
}

impl CaptureStream for FakeCapture {
    fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        let mut state = self.host.lock();
        if state.mic.as_ref().map_or(false, |(id, _)| *id == self.id) {
            state.mic = None;
        }
        state.events.push("capture_stop".into());
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

#[derive(Default)]
struct EngineState {
    loads: u32,
    init_calls: u32,
    failing_inits: u32,
    next_instance: i32,
    last_parameters: Option<CodecParameters>,
    last_protocol: Option<ProtocolId>,
    reject_encodes: bool,
    freed: Vec<InstanceId>,
    rx: HashMap<i32, Vec<f32>>,
}

pub struct FakeEngine {
    state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EngineState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap()
    }

    /// Loader that always finds the module and counts each load.
    pub fn loader(self: &Arc<Self>) -> impl Fn() -> Option<Arc<dyn CodecEngine>> + Send + Sync {
        let engine = Arc::clone(self);
        move || {
            engine.lock().loads += 1;
            Some(Arc::clone(&engine) as Arc<dyn CodecEngine>)
        }
    }

    pub fn waveform(&self, payload: &[u8]) -> Vec<f32> {
        let mut samples = vec![0.0, START, payload.len() as f32];
        samples.extend(payload.iter().map(|&b| b as f32));
        samples.push(END);
        samples
    }

    pub fn fail_next_inits(&self, count: u32) {
        self.lock().failing_inits = count;
    }

    pub fn reject_encodes(&self, reject: bool) {
        self.lock().reject_encodes = reject;
    }

    pub fn loads(&self) -> u32 {
        self.lock().loads
    }

    pub fn init_calls(&self) -> u32 {
        self.lock().init_calls
    }

    pub fn last_parameters(&self) -> Option<CodecParameters> {
        self.lock().last_parameters.clone()
    }

    pub fn last_protocol(&self) -> Option<ProtocolId> {
        self.lock().last_protocol
    }

    pub fn freed(&self) -> Vec<InstanceId> {
        self.lock().freed.clone()
    }
}

impl CodecEngine for FakeEngine {
    fn default_parameters(&self) -> CodecParameters {
        CodecParameters::default()
    }

    fn init(&self, parameters: &CodecParameters) -> InstanceId {
        let mut state = self.lock();
        state.init_calls += 1;
        state.last_parameters = Some(parameters.clone());
        if state.failing_inits > 0 {
            state.failing_inits -= 1;
            return InstanceId(-1);
        }
        state.next_instance += 1;
        InstanceId(state.next_instance)
    }

    fn encode(
        &self,
        _instance: InstanceId,
        text: &str,
        protocol: ProtocolId,
        _volume: u8,
    ) -> std::result::Result<Vec<f32>, String> {
        {
            let mut state = self.lock();
            state.last_protocol = Some(protocol);
            if state.reject_encodes {
                return Err("unsupported input".into());
            }
        }
        Ok(self.waveform(text.as_bytes()))
    }

    fn decode(&self, instance: InstanceId, frame: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.lock();
        let buffer = state.rx.entry(instance.0).or_default();
        buffer.extend(
            frame
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );

        let Some(start) = buffer.iter().position(|&s| s == START) else {
            buffer.clear();
            return None;
        };
        buffer.drain(..start);

        let len = *buffer.get(1)? as usize;
        if buffer.len() < len + 3 {
            return None;
        }
        let payload: Vec<u8> = buffer[2..2 + len].iter().map(|&s| s as u8).collect();
        let terminated = buffer[2 + len] == END;
        buffer.drain(..len + 3);

        terminated.then_some(payload)
    }

    fn free(&self, instance: InstanceId) {
        let mut state = self.lock();
        state.rx.remove(&instance.0);
        state.freed.push(instance);
    }
}
