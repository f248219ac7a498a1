//! Atomically published detection results.
//!
//! The detection loop builds a fresh `DetectionSnapshot` every iteration and
//! swaps it in whole. Readers clone an `Arc` and never observe a half-written
//! list; they may observe one that is a frame or two stale.

use serde::Serialize;
use std::sync::{Arc, RwLock};

use crate::detect::Detection;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionSnapshot {
    /// Sequence number of the frame these detections came from (0 = none yet).
    pub frame_seq: u64,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Detections in detector order, targeted or not.
    pub detections: Vec<Detection>,
}

/// Single-writer, many-reader cell holding the latest snapshot.
#[derive(Default)]
pub struct SnapshotCell {
    current: RwLock<Arc<DetectionSnapshot>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest published snapshot. Cheap: one `Arc` clone under a read lock.
    pub fn load(&self) -> Arc<DetectionSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Replace the published snapshot in full.
    pub fn publish(&self, snapshot: DetectionSnapshot) {
        let next = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }
}
