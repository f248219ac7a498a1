use anyhow::{anyhow, Result};

use crate::detect::backend::ObjectDetector;
use crate::detect::result::{BoundingBox, Detection};
use crate::frame::Frame;

/// Stub backend for demos and tests. No model involved.
///
/// Either replays a script of per-frame detections (cycling), or simulates a
/// single object walking from the top of the frame to the bottom.
pub struct StubBackend {
    mode: StubMode,
    calls: u64,
    fail_on_call: Option<u64>,
}

enum StubMode {
    Script(Vec<Vec<Detection>>),
    Walker { label: String, steps: u32 },
}

impl StubBackend {
    /// Backend that never detects anything.
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    /// Same detections on every frame.
    pub fn fixed(detections: Vec<Detection>) -> Self {
        Self::scripted(vec![detections])
    }

    /// One entry per call, wrapping around at the end.
    pub fn scripted(script: Vec<Vec<Detection>>) -> Self {
        Self {
            mode: StubMode::Script(script),
            calls: 0,
            fail_on_call: None,
        }
    }

    /// A 15%-of-frame box labelled `label` that moves down the frame center,
    /// reaching the bottom after `steps` frames and then starting over.
    pub fn walker(label: &str, steps: u32) -> Self {
        Self {
            mode: StubMode::Walker {
                label: label.to_string(),
                steps: steps.max(1),
            },
            calls: 0,
            fail_on_call: None,
        }
    }

    /// Make the n-th call (0-based) return an error.
    pub fn failing_on(mut self, call: u64) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    fn walker_detection(label: &str, steps: u32, call: u64, frame: &Frame) -> Detection {
        let (w, h) = (frame.width as f32, frame.height as f32);
        let size = (w.min(h) * 0.15).max(1.0);
        let step = (call % steps as u64) as f32;
        let travel = (h - size).max(0.0);
        let y2 = size + travel * step / (steps.saturating_sub(1).max(1)) as f32;
        let x1 = (w - size) / 2.0;
        Detection::new(label, 0.9, BoundingBox::new(x1, y2 - size, x1 + size, y2))
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectDetector for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on_call == Some(call) {
            return Err(anyhow!("stub detector failure on call {}", call));
        }
        let detections = match &self.mode {
            StubMode::Script(script) if script.is_empty() => Vec::new(),
            StubMode::Script(script) => script[(call as usize) % script.len()].clone(),
            StubMode::Walker { label, steps } => {
                vec![Self::walker_detection(label, *steps, call, frame)]
            }
        };
        Ok(detections)
    }
}
