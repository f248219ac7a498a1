//! Frame types and the latest-frame hand-off.
//!
//! - `Frame`: immutable RGB pixel buffer. Pixels are private and read-only.
//! - `FrameSource`: non-blocking "give me the newest frame" capability.
//! - `FrameSlot`: single-slot cell written by capture, read by detection.
//!
//! Frames move between threads as `Arc<Frame>`. Nothing mutates a frame after
//! construction; code that wants to draw on one must copy the pixels first.

use anyhow::{anyhow, Result};
use std::sync::{Arc, RwLock};

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

/// Decoded RGB frame.
///
/// There is no `pixels_mut()` and no `Clone`; share it through `Arc`.
#[derive(Debug)]
pub struct Frame {
    data: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Capture sequence number, monotonically increasing per producer.
    pub seq: u64,
}

impl Frame {
    /// Build a frame from packed RGB8 pixels.
    pub fn new(data: Vec<u8>, width: u32, height: u32, seq: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            seq,
        })
    }

    /// Solid-color frame. Handy for stubs and tests.
    pub fn filled(width: u32, height: u32, seq: u64, rgb: [u8; 3]) -> Result<Self> {
        let pixels = (width as usize) * (height as usize);
        let mut data = Vec::with_capacity(pixels * 3);
        for _ in 0..pixels {
            data.extend_from_slice(&rgb);
        }
        Self::new(data, width, height, seq)
    }

    /// Read-only pixel access (packed RGB8, row-major).
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Private, mutable copy of the pixels for overlay drawing.
    pub fn to_rgb_vec(&self) -> Vec<u8> {
        self.data.clone()
    }
}

// ----------------------------------------------------------------------------
// FrameSource
// ----------------------------------------------------------------------------

/// Supplies the most recent frame, or `None` if nothing has been captured yet.
///
/// Implementations must not block.
pub trait FrameSource: Send + Sync {
    fn latest_frame(&self) -> Option<Arc<Frame>>;
}

/// Latest-frame cell. The capture side overwrites, the detection side peeks.
///
/// Older frames are dropped when replaced; there is no queue.
#[derive(Default)]
pub struct FrameSlot {
    latest: RwLock<Option<Arc<Frame>>>,
}

impl FrameSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored frame.
    pub fn store(&self, frame: Frame) -> Result<()> {
        let mut guard = self
            .latest
            .write()
            .map_err(|_| anyhow!("frame slot lock poisoned"))?;
        *guard = Some(Arc::new(frame));
        Ok(())
    }

    /// Drop the stored frame (e.g. when the camera is reconfigured).
    pub fn clear(&self) -> Result<()> {
        let mut guard = self
            .latest
            .write()
            .map_err(|_| anyhow!("frame slot lock poisoned"))?;
        *guard = None;
        Ok(())
    }
}

impl FrameSource for FrameSlot {
    fn latest_frame(&self) -> Option<Arc<Frame>> {
        match self.latest.read() {
            Ok(guard) => guard.clone(),
            Err(_) => {
                log::warn!("frame slot lock poisoned; reporting no frame");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_mismatched_buffer() {
        assert!(Frame::new(vec![0u8; 10], 4, 4, 0).is_err());
        assert!(Frame::new(vec![0u8; 48], 4, 4, 0).is_ok());
    }

    #[test]
    fn filled_frame_has_expected_pixels() {
        let frame = Frame::filled(2, 2, 7, [1, 2, 3]).unwrap();
        assert_eq!(frame.pixels(), &[1, 2, 3, 1, 2, 3, 1, 2, 3, 1, 2, 3]);
        assert_eq!(frame.seq, 7);
    }

    #[test]
    fn overlay_copy_does_not_touch_shared_frame() {
        let frame = Arc::new(Frame::filled(2, 1, 0, [0, 0, 0]).unwrap());
        let mut copy = frame.to_rgb_vec();
        copy[0] = 255;
        assert_eq!(frame.pixels()[0], 0);
    }

    #[test]
    fn slot_starts_empty_and_keeps_latest() {
        let slot = FrameSlot::new();
        assert!(slot.latest_frame().is_none());

        slot.store(Frame::filled(2, 2, 1, [0, 0, 0]).unwrap()).unwrap();
        slot.store(Frame::filled(2, 2, 2, [0, 0, 0]).unwrap()).unwrap();
        assert_eq!(slot.latest_frame().unwrap().seq, 2);

        slot.clear().unwrap();
        assert!(slot.latest_frame().is_none());
    }

    #[test]
    fn reader_keeps_old_frame_after_replacement() {
        let slot = FrameSlot::new();
        slot.store(Frame::filled(2, 2, 1, [9, 9, 9]).unwrap()).unwrap();
        let held = slot.latest_frame().unwrap();
        slot.store(Frame::filled(2, 2, 2, [0, 0, 0]).unwrap()).unwrap();
        assert_eq!(held.seq, 1);
        assert_eq!(held.pixels()[0], 9);
    }
}
