//! Binding to the external waveform codec engine.
//!
//! The engine itself (modulation, marker detection, payload coding) is not
//! part of this crate. It is reached through [`CodecEngine`], obtained from a
//! [`CodecLoader`] that may need a while before the module becomes available.

use crate::error::{Result, TransceiverError};
use crate::retry::RetryPolicy;
use std::sync::{Arc, Mutex};

/// Protocol variants understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolId {
    AudibleNormal,
    AudibleFast,
    AudibleFastest,
    UltrasoundNormal,
    UltrasoundFast,
    UltrasoundFastest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    F32,
    I16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodecParameters {
    pub sample_rate_inp: u32,
    pub sample_rate_out: u32,
    pub samples_per_frame: usize,
    pub sound_marker_threshold: f32,
    pub sample_format_inp: SampleFormat,
    pub sample_format_out: SampleFormat,
}

impl Default for CodecParameters {
    fn default() -> Self {
        Self {
            sample_rate_inp: crate::PREFERRED_SAMPLE_RATE,
            sample_rate_out: crate::PREFERRED_SAMPLE_RATE,
            samples_per_frame: crate::FRAME_SIZE,
            sound_marker_threshold: 3.0,
            sample_format_inp: SampleFormat::F32,
            sample_format_out: SampleFormat::F32,
        }
    }
}

/// Engine-side instance number. Negative values mean initialization failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceId(pub i32);

impl InstanceId {
    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

/// Capability interface of the external codec engine.
pub trait CodecEngine: Send + Sync {
    fn default_parameters(&self) -> CodecParameters;

    fn init(&self, parameters: &CodecParameters) -> InstanceId;

    /// Produces mono samples at the instance's output rate.
    fn encode(
        &self,
        instance: InstanceId,
        text: &str,
        protocol: ProtocolId,
        volume: u8,
    ) -> std::result::Result<Vec<f32>, String>;

    /// Feeds one frame of little-endian f32 bytes. `None` until a complete
    /// message has been recognized.
    fn decode(&self, instance: InstanceId, frame: &[u8]) -> Option<Vec<u8>>;

    fn free(&self, _instance: InstanceId) {}
}

/// Source of the engine module; returns `None` while it is not loaded yet.
pub trait CodecLoader: Send + Sync {
    fn load(&self) -> Option<Arc<dyn CodecEngine>>;
}

impl<F> CodecLoader for F
where
    F: Fn() -> Option<Arc<dyn CodecEngine>> + Send + Sync,
{
    fn load(&self) -> Option<Arc<dyn CodecEngine>> {
        self()
    }
}

/// An initialized engine instance, valid only for `sample_rate`.
#[derive(Clone)]
pub struct CodecHandle {
    engine: Arc<dyn CodecEngine>,
    instance: InstanceId,
    sample_rate: u32,
}

impl CodecHandle {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn encode(&self, text: &str, protocol: ProtocolId, volume: u8) -> Result<Vec<f32>> {
        let samples = self
            .engine
            .encode(self.instance, text, protocol, volume)
            .map_err(TransceiverError::Encode)?;

        if samples.is_empty() {
            return Err(TransceiverError::Encode("engine produced no samples".into()));
        }
        Ok(samples)
    }

    pub fn decode(&self, frame: &[u8]) -> Option<Vec<u8>> {
        self.engine.decode(self.instance, frame)
    }
}

impl std::fmt::Debug for CodecHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecHandle")
            .field("instance", &self.instance)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodecPolicy {
    pub load: RetryPolicy,
    pub init: RetryPolicy,
    pub sound_marker_threshold: f32,
}

#[derive(Default)]
struct BindingState {
    module: Option<Arc<dyn CodecEngine>>,
    handle: Option<CodecHandle>,
}

pub struct CodecBinding {
    loader: Box<dyn CodecLoader>,
    policy: CodecPolicy,
    state: Mutex<BindingState>,
}

impl CodecBinding {
    pub fn new(loader: Box<dyn CodecLoader>, policy: CodecPolicy) -> Self {
        Self {
            loader,
            policy,
            state: Mutex::new(BindingState::default()),
        }
    }

    /// Returns the handle for `sample_rate`, loading and initializing the
    /// engine as needed. A handle created for another rate is freed first.
    pub fn ensure_codec(&self, sample_rate: u32) -> Result<CodecHandle> {
        let mut state = self.lock();

        if let Some(handle) = state.handle.take() {
            if handle.sample_rate == sample_rate {
                state.handle = Some(handle.clone());
                return Ok(handle);
            }
            log::info!(
                "Session rate changed {} -> {} Hz, reinitializing codec",
                handle.sample_rate,
                sample_rate
            );
            handle.engine.free(handle.instance);
        }

        let engine = match state.module.clone() {
            Some(engine) => engine,
            None => {
                let engine = self
                    .policy
                    .load
                    .poll("codec module load", || self.loader.load())
                    .ok_or_else(|| {
                        TransceiverError::CodecUnavailable("engine module did not load".into())
                    })?;
                state.module = Some(Arc::clone(&engine));
                engine
            }
        };

        let mut parameters = engine.default_parameters();
        parameters.sample_rate_inp = sample_rate;
        parameters.sample_rate_out = sample_rate;
        parameters.sound_marker_threshold = self.policy.sound_marker_threshold;
        parameters.sample_format_inp = SampleFormat::F32;
        parameters.sample_format_out = SampleFormat::F32;

        let initialized = self.policy.init.run("codec init", |_| {
            let instance = engine.init(&parameters);
            if instance.is_valid() {
                Ok(instance)
            } else {
                Err(format!("invalid instance {}", instance.0))
            }
        });

        match initialized {
            Ok(instance) => {
                log::info!("Codec initialized (instance {}, {} Hz)", instance.0, sample_rate);
                let handle = CodecHandle {
                    engine,
                    instance,
                    sample_rate,
                };
                state.handle = Some(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                state.module = None;
                state.handle = None;
                Err(TransceiverError::CodecUnavailable(e))
            }
        }
    }

    pub fn handle(&self) -> Option<CodecHandle> {
        self.lock().handle.clone()
    }

    /// Frees the instance and drops the module reference.
    pub fn release(&self) {
        let mut state = self.lock();
        if let Some(handle) = state.handle.take() {
            handle.engine.free(handle.instance);
        }
        state.module = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BindingState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeEngine;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn policy() -> CodecPolicy {
        CodecPolicy {
            load: RetryPolicy::new(20, Duration::ZERO),
            init: RetryPolicy::new(5, Duration::ZERO),
            sound_marker_threshold: 4.0,
        }
    }

    fn binding_for(engine: Arc<FakeEngine>) -> CodecBinding {
        CodecBinding::new(Box::new(engine.loader()), policy())
    }

    #[test]
    fn test_parameters_follow_session_rate() {
        let engine = FakeEngine::new();
        let binding = binding_for(Arc::clone(&engine));

        let handle = binding.ensure_codec(44100).unwrap();
        assert_eq!(handle.sample_rate(), 44100);

        let params = engine.last_parameters().unwrap();
        assert_eq!(params.sample_rate_inp, 44100);
        assert_eq!(params.sample_rate_out, 44100);
        assert_eq!(params.sound_marker_threshold, 4.0);
    }

    #[test]
    fn test_handle_is_reused_for_same_rate() {
        let engine = FakeEngine::new();
        let binding = binding_for(Arc::clone(&engine));

        binding.ensure_codec(48000).unwrap();
        binding.ensure_codec(48000).unwrap();
        assert_eq!(engine.init_calls(), 1);
    }

    #[test]
    fn test_rate_change_reinitializes() {
        let engine = FakeEngine::new();
        let binding = binding_for(Arc::clone(&engine));

        let first = binding.ensure_codec(48000).unwrap();
        let second = binding.ensure_codec(44100).unwrap();
        assert_ne!(first.instance(), second.instance());
        assert_eq!(engine.freed(), vec![first.instance()]);
    }

    #[test]
    fn test_waits_for_module() {
        let engine = FakeEngine::new();
        let loads = Arc::new(AtomicU32::new(0));
        let loads_clone = Arc::clone(&loads);
        let engine_clone = Arc::clone(&engine);
        let loader = move || -> Option<Arc<dyn CodecEngine>> {
            if loads_clone.fetch_add(1, Ordering::SeqCst) < 3 {
                None
            } else {
                Some(engine_clone.clone() as Arc<dyn CodecEngine>)
            }
        };
        let binding = CodecBinding::new(Box::new(loader), policy());

        assert!(binding.ensure_codec(48000).is_ok());
        assert_eq!(loads.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_module_never_loads() {
        let loader = || -> Option<Arc<dyn CodecEngine>> { None };
        let binding = CodecBinding::new(Box::new(loader), policy());
        assert!(matches!(
            binding.ensure_codec(48000),
            Err(TransceiverError::CodecUnavailable(_))
        ));
    }

    #[test]
    fn test_spurious_invalid_instance_is_retried() {
        let engine = FakeEngine::new();
        engine.fail_next_inits(2);
        let binding = binding_for(Arc::clone(&engine));

        assert!(binding.ensure_codec(48000).is_ok());
        assert_eq!(engine.init_calls(), 3);
    }

    #[test]
    fn test_init_ceiling_then_fresh_load() {
        let engine = FakeEngine::new();
        engine.fail_next_inits(u32::MAX);
        let binding = binding_for(Arc::clone(&engine));

        assert!(matches!(
            binding.ensure_codec(48000),
            Err(TransceiverError::CodecUnavailable(_))
        ));
        assert_eq!(engine.init_calls(), 5);
        assert_eq!(engine.loads(), 1);
        assert!(binding.handle().is_none());

        let _ = binding.ensure_codec(48000);
        assert_eq!(engine.init_calls(), 10);
        assert_eq!(engine.loads(), 2);
    }

    #[test]
    fn test_rejected_text_is_encode_error() {
        let engine = FakeEngine::new();
        let binding = binding_for(Arc::clone(&engine));
        let handle = binding.ensure_codec(48000).unwrap();
        engine.reject_encodes(true);
        assert!(matches!(
            handle.encode("hi", ProtocolId::AudibleFast, 10),
            Err(TransceiverError::Encode(_))
        ));
    }
}
