//! HTTP camera source.
//!
//! Handles both `multipart/x-mixed-replace` MJPEG streams (e.g. ESP32-CAM
//! `/stream`) and plain JPEG snapshot endpoints, polled once per frame.

use anyhow::{anyhow, Context, Result};
use image::GenericImageView;
use std::io::Read;
use std::time::{Duration, Instant};

use super::{frame_interval, FrameProducer};
use crate::config::SourceSettings;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MjpegSource {
    settings: SourceSettings,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    frame_count: u64,
}

enum HttpStream {
    Mjpeg(MjpegReader),
    SingleJpeg,
}

impl MjpegSource {
    pub fn new(settings: SourceSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(READ_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Self {
            settings,
            agent,
            stream: None,
            last_frame_at: None,
            frame_count: 0,
        }
    }
}

impl FrameProducer for MjpegSource {
    fn describe(&self) -> String {
        self.settings.url.clone()
    }

    fn connect(&mut self) -> Result<()> {
        let response = self
            .agent
            .get(&self.settings.url)
            .call()
            .with_context(|| format!("connect to camera {}", self.settings.url))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        self.stream = Some(if content_type.contains("multipart") {
            HttpStream::Mjpeg(MjpegReader::new(response.into_reader()))
        } else {
            HttpStream::SingleJpeg
        });
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let min_interval = frame_interval(self.settings.target_fps);
        loop {
            let jpeg = match &mut self.stream {
                Some(HttpStream::Mjpeg(reader)) => reader.read_next_jpeg()?,
                Some(HttpStream::SingleJpeg) => fetch_single_jpeg(&self.agent, &self.settings.url)?,
                None => return Err(anyhow!("camera not connected")),
            };

            let now = Instant::now();
            if let Some(last) = self.last_frame_at {
                if now.duration_since(last) < min_interval {
                    if matches!(self.stream, Some(HttpStream::SingleJpeg)) {
                        std::thread::sleep(min_interval - now.duration_since(last));
                    }
                    continue;
                }
            }

            let (pixels, width, height) = decode_jpeg(&jpeg)?;
            self.frame_count += 1;
            self.last_frame_at = Some(now);
            return Frame::new(pixels, width, height, self.frame_count);
        }
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }
}

struct MjpegReader {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let jpeg = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(jpeg);
            }
            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                // keep a possible split SOI marker
                let drain_len = self.buffer.len() - 2;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_single_jpeg(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>> {
    let response = agent
        .get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<(Vec<u8>, u32, u32)> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    let (width, height) = image.dimensions();
    Ok((image.into_rgb8().into_raw(), width, height))
}

/// Locate the first complete SOI..EOI span.
///
/// Walks the marker segments by their declared lengths, so an EOI inside an
/// APP segment (an EXIF thumbnail) does not end the frame early. Streams that
/// do not parse as marker segments fall back to the first EOI after SOI.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let mut pos = start + 2;
    loop {
        if *buffer.get(pos)? != 0xFF {
            return first_eoi_after(buffer, start, pos);
        }
        let mut marker_at = pos;
        while *buffer.get(marker_at + 1)? == 0xFF {
            marker_at += 1;
        }
        let marker = buffer[marker_at + 1];
        pos = marker_at + 2;
        match marker {
            0xD9 => return Some((start, pos)),
            0x01 | 0xD0..=0xD7 => {}
            _ => {
                let len = u16::from_be_bytes([*buffer.get(pos)?, *buffer.get(pos + 1)?]) as usize;
                if len < 2 {
                    return first_eoi_after(buffer, start, pos);
                }
                pos += len;
                if marker == 0xDA {
                    // scan data ends at the first marker that is not stuffing or a restart
                    let skip = buffer
                        .get(pos..)?
                        .windows(2)
                        .position(|w| w[0] == 0xFF && w[1] != 0x00 && !(0xD0..=0xD7).contains(&w[1]))?;
                    pos += skip;
                }
            }
        }
    }
}

fn first_eoi_after(buffer: &[u8], start: usize, from: usize) -> Option<(usize, usize)> {
    let end = buffer.get(from..)?.windows(2).position(|w| w == [0xFF, 0xD9])?;
    Some((start, from + end + 2))
}
