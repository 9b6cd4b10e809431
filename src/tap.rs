//! Passive monitoring point fed by the output stream during transmission.
//!
//! Mirrors what an analyser node offers a visualizer: the most recent block of
//! time-domain samples and a smoothed magnitude spectrum of that block.

use rustfft::{num_complex::Complex, FftPlanner};
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};

pub const DEFAULT_FFT_SIZE: usize = 2048;
pub const DEFAULT_SMOOTHING: f32 = 0.8;

struct TapState {
    window: VecDeque<f32>,
    smoothed: Vec<f32>,
    attached: bool,
}

#[derive(Clone)]
pub struct VisualizerTap {
    fft_size: usize,
    smoothing: f32,
    state: Arc<Mutex<TapState>>,
}

impl VisualizerTap {
    pub fn new(fft_size: usize, smoothing: f32) -> Self {
        let fft_size = fft_size.max(32).next_power_of_two();
        Self {
            fft_size,
            smoothing: smoothing.clamp(0.0, 1.0),
            state: Arc::new(Mutex::new(TapState {
                window: VecDeque::from(vec![0.0; fft_size]),
                smoothed: vec![0.0; fft_size / 2],
                attached: false,
            })),
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    pub fn is_attached(&self) -> bool {
        self.lock().attached
    }

    pub(crate) fn attach(&self) {
        self.lock().attached = true;
    }

    /// Detaches and resets to silence.
    pub(crate) fn detach(&self) {
        let mut state = self.lock();
        state.attached = false;
        state.window.iter_mut().for_each(|s| *s = 0.0);
        state.smoothed.iter_mut().for_each(|m| *m = 0.0);
    }

    /// Called from the output stream. Skips the block rather than waiting if
    /// a reader holds the lock.
    pub fn write(&self, samples: &[f32]) {
        if let Ok(mut state) = self.state.try_lock() {
            if !state.attached {
                return;
            }
            for &sample in samples {
                state.window.pop_front();
                state.window.push_back(sample);
            }
        }
    }

    pub fn time_domain_data(&self) -> Vec<f32> {
        self.lock().window.iter().copied().collect()
    }

    /// Peak absolute amplitude of the current block.
    pub fn peak(&self) -> f32 {
        self.lock().window.iter().fold(0.0f32, |a, &b| a.max(b.abs()))
    }

    pub fn rms(&self) -> f32 {
        let state = self.lock();
        let sum: f32 = state.window.iter().map(|s| s * s).sum();
        (sum / state.window.len() as f32).sqrt()
    }

    /// Blackman-windowed magnitude spectrum with exponential smoothing over
    /// successive calls. Bin `i` covers `i * sample_rate / fft_size` Hz.
    pub fn frequency_data(&self) -> Vec<f32> {
        let mut state = self.lock();
        let n = self.fft_size;

        let mut buffer: Vec<Complex<f32>> = state
            .window
            .iter()
            .enumerate()
            .map(|(i, &s)| Complex::new(s * blackman(i, n), 0.0))
            .collect();

        let fft = FftPlanner::new().plan_fft_forward(n);
        fft.process(&mut buffer);

        let smoothing = self.smoothing;
        for (smoothed, c) in state.smoothed.iter_mut().zip(buffer.iter().take(n / 2)) {
            let magnitude = (c.re * c.re + c.im * c.im).sqrt() / n as f32;
            *smoothed = smoothing * *smoothed + (1.0 - smoothing) * magnitude;
        }

        state.smoothed.clone()
    }

    fn lock(&self) -> MutexGuard<'_, TapState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for VisualizerTap {
    fn default() -> Self {
        Self::new(DEFAULT_FFT_SIZE, DEFAULT_SMOOTHING)
    }
}

fn blackman(i: usize, n: usize) -> f32 {
    let a = 0.16;
    let x = 2.0 * PI * i as f32 / n as f32;
    (1.0 - a) / 2.0 - 0.5 * x.cos() + (a / 2.0) * (2.0 * x).cos()
}
