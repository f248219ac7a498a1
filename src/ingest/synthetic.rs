//! Synthetic camera for `stub://` URLs.
//!
//! Produces a dim noisy background at the configured size and rate. Paired with
//! the stub detector it exercises the whole loop without a camera.

use anyhow::Result;
use rand::Rng;
use std::time::Instant;

use super::{frame_interval, FrameProducer};
use crate::config::SourceSettings;
use crate::frame::Frame;

pub struct SyntheticSource {
    settings: SourceSettings,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(settings: SourceSettings) -> Self {
        Self {
            settings,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    fn generate_pixels(&self) -> Vec<u8> {
        let len = self.settings.width as usize * self.settings.height as usize * 3;
        let mut rng = rand::thread_rng();
        (0..len).map(|_| rng.gen_range(16u8..48)).collect()
    }
}

impl FrameProducer for SyntheticSource {
    fn describe(&self) -> String {
        format!(
            "{} (synthetic {}x{} @ {}fps)",
            self.settings.url, self.settings.width, self.settings.height, self.settings.target_fps
        )
    }

    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let interval = frame_interval(self.settings.target_fps);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Frame::new(
            self.generate_pixels(),
            self.settings.width,
            self.settings.height,
            self.frame_count,
        )
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn source(fps: u32) -> SyntheticSource {
        SyntheticSource::new(SourceSettings {
            url: "stub://test".to_string(),
            target_fps: fps,
            width: 8,
            height: 6,
        })
    }

    #[test]
    fn sequence_numbers_increase() {
        let mut source = source(0);
        let a = source.next_frame().unwrap();
        let b = source.next_frame().unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(a.pixels().len(), 8 * 6 * 3);
        assert_eq!(source.frames_captured(), 2);
    }

    #[test]
    fn rate_is_limited() {
        let mut source = source(20);
        let start = Instant::now();
        for _ in 0..3 {
            source.next_frame().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
