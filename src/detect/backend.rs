use anyhow::Result;

use crate::detect::result::Detection;
use crate::frame::Frame;

/// Object detection capability.
///
/// Backends receive a shared, read-only frame and return labeled boxes in
/// frame-pixel coordinates, in the order they want them evaluated. Errors
/// propagate to the caller; the detection loop logs them and skips the frame.
pub trait ObjectDetector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
