use byteorder::{ByteOrder, LittleEndian};

/// Length of a sender tag such as `NM$`.
pub const SENDER_TAG_LEN: usize = 3;
pub const SENDER_TAG_MARKER: char = '$';

/// How decoded payloads are turned into delivered text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Deframing {
    /// Strip a leading two-character sender tag terminated by `$` when one
    /// is present; anything else passes through untouched.
    #[default]
    SenderTag,
    /// Deliver the payload exactly as decoded.
    Raw,
}

impl Deframing {
    /// Returns the text to deliver, or `None` when nothing remains.
    pub fn apply(&self, payload: &[u8]) -> Option<String> {
        if payload.is_empty() {
            return None;
        }

        let text = String::from_utf8_lossy(payload);
        let body = match self {
            Deframing::SenderTag => strip_sender_tag(&text),
            Deframing::Raw => &text,
        };

        if body.is_empty() {
            None
        } else {
            Some(body.to_string())
        }
    }
}

fn strip_sender_tag(text: &str) -> &str {
    let mut chars = text.char_indices();
    let tagged = matches!(
        (chars.next(), chars.next(), chars.next()),
        (Some((_, a)), Some((_, b)), Some((_, SENDER_TAG_MARKER)))
            if a != SENDER_TAG_MARKER && b != SENDER_TAG_MARKER
    );

    if tagged {
        let cut = text
            .char_indices()
            .nth(SENDER_TAG_LEN)
            .map(|(i, _)| i)
            .unwrap_or(text.len());
        &text[cut..]
    } else {
        text
    }
}

/// Serializes a frame of f32 samples into the little-endian byte layout the
/// codec's decoder consumes.
pub fn samples_to_frame_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 4];
    LittleEndian::write_f32_into(samples, &mut bytes);
    bytes
}

/// Mixes interleaved channels down to mono by averaging.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Cuts a continuous mono sample stream into fixed-size frames.
pub struct Framer {
    frame_size: usize,
    pending: Vec<f32>,
}

impl Framer {
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            pending: Vec::with_capacity(frame_size),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Appends samples and calls `emit` once per completed frame.
    pub fn push<F>(&mut self, mut samples: &[f32], mut emit: F)
    where
        F: FnMut(Vec<f32>),
    {
        while !samples.is_empty() {
            let take = (self.frame_size - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_size {
                let frame = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                emit(frame);
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
