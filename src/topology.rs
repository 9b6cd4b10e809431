//! Audio graph descriptors.
//!
//! A graph is an ordered chain of stages from a source to a sink. The
//! transceiver owns a single [`GraphSlot`]; installing a graph while another
//! one is live fails, which is what keeps transmit and listen apart.

use crate::error::{Result, TransceiverError};

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Microphone capture.
    Capture,
    /// Encoded waveform buffer.
    Buffer { samples: usize },
    /// Fixed-size framing followed by codec decode.
    Decoder { frame_size: usize },
    /// Analyser tap for visualization.
    Visualizer,
    /// Output device at `gain`.
    Sink { gain: f32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphKind {
    Listen,
    Transmit,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphTopology {
    kind: GraphKind,
    stages: Vec<Stage>,
}

impl GraphTopology {
    /// capture → decoder → muted sink. The zero-gain sink keeps the chain
    /// pulling without anything reaching the speaker.
    pub fn listen(frame_size: usize) -> Self {
        Self {
            kind: GraphKind::Listen,
            stages: vec![
                Stage::Capture,
                Stage::Decoder { frame_size },
                Stage::Sink { gain: 0.0 },
            ],
        }
    }

    /// buffer → [visualizer] → speaker.
    pub fn transmit(samples: usize, with_tap: bool) -> Self {
        let mut stages = vec![Stage::Buffer { samples }];
        if with_tap {
            stages.push(Stage::Visualizer);
        }
        stages.push(Stage::Sink { gain: 1.0 });
        Self {
            kind: GraphKind::Transmit,
            stages,
        }
    }

    pub fn kind(&self) -> GraphKind {
        self.kind
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Whether anything in this graph reaches the speaker.
    pub fn is_audible(&self) -> bool {
        self.stages
            .iter()
            .any(|s| matches!(s, Stage::Sink { gain } if *gain > 0.0))
    }

    pub fn captures_input(&self) -> bool {
        self.stages.contains(&Stage::Capture)
    }

    pub fn has_visualizer(&self) -> bool {
        self.stages.contains(&Stage::Visualizer)
    }
}

/// Holder for the one graph allowed to exist at a time.
#[derive(Debug, Default)]
pub struct GraphSlot<G> {
    active: Option<(GraphTopology, G)>,
}

impl<G> GraphSlot<G> {
    pub fn new() -> Self {
        Self { active: None }
    }

    pub fn install(&mut self, topology: GraphTopology, graph: G) -> Result<()> {
        if let Some((live, _)) = &self.active {
            return Err(TransceiverError::GraphBusy(match live.kind() {
                GraphKind::Listen => "listen graph is live",
                GraphKind::Transmit => "transmit graph is live",
            }));
        }
        log::debug!("Installing {:?} graph: {:?}", topology.kind(), topology.stages());
        self.active = Some((topology, graph));
        Ok(())
    }

    pub fn take(&mut self) -> Option<(GraphTopology, G)> {
        self.active.take()
    }

    pub fn kind(&self) -> Option<GraphKind> {
        self.active.as_ref().map(|(t, _)| t.kind())
    }

    pub fn get_mut(&mut self) -> Option<&mut G> {
        self.active.as_mut().map(|(_, g)| g)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_none()
    }
}
