//! Line-crossing geometry.
//!
//! The configured line is stored in fractional (0..1) frame coordinates so it
//! survives resolution changes. Each frame resolves it to pixels and measures
//! how far an object's ground-contact point sits from the segment.

use serde::{Deserialize, Serialize};

use crate::detect::BoundingBox;

/// Segments shorter than this are treated as unset.
pub const MIN_SEGMENT_LEN: f32 = 1e-6;

/// Distance reported for degenerate segments. Never within any threshold.
pub const NO_LINE_DISTANCE: f32 = f32::INFINITY;

/// Default pixel threshold for a crossing.
pub const DEFAULT_THRESHOLD_PX: f32 = 25.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn distance_to(self, other: Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Virtual line in fractional frame coordinates.
///
/// Serialized as `[x1, y1, x2, y2]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(into = "[f32; 4]", try_from = "Vec<f32>")]
pub struct Line {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl Line {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Parse a persisted `[x1, y1, x2, y2]` array.
    ///
    /// Returns `None` for anything that is not exactly four finite numbers;
    /// callers treat that the same as "no line".
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        match values {
            [x1, y1, x2, y2] if values.iter().all(|v| v.is_finite()) => {
                Some(Self::new(*x1, *y1, *x2, *y2))
            }
            _ => None,
        }
    }

    /// Resolve to pixel coordinates for a frame of the given size.
    pub fn to_pixels(&self, width: u32, height: u32) -> Segment {
        let (w, h) = (width as f32, height as f32);
        Segment {
            a: Point::new(self.x1 * w, self.y1 * h),
            b: Point::new(self.x2 * w, self.y2 * h),
        }
    }
}

impl From<Line> for [f32; 4] {
    fn from(line: Line) -> Self {
        [line.x1, line.y1, line.x2, line.y2]
    }
}

impl TryFrom<Vec<f32>> for Line {
    type Error = String;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Line::from_slice(&values)
            .ok_or_else(|| format!("line must be 4 finite numbers, got {}", values.len()))
    }
}

/// Line segment in pixel coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub a: Point,
    pub b: Point,
}

impl Segment {
    pub fn new(a: Point, b: Point) -> Self {
        Self { a, b }
    }

    pub fn length(&self) -> f32 {
        self.a.distance_to(self.b)
    }

    /// Distance from `p` to the closest point on the segment.
    ///
    /// The projection parameter is clamped to `[0, 1]`, so points beyond either
    /// end measure to that endpoint. Degenerate segments return
    /// [`NO_LINE_DISTANCE`].
    pub fn distance_to(&self, p: Point) -> f32 {
        let len = self.length();
        if len < MIN_SEGMENT_LEN {
            return NO_LINE_DISTANCE;
        }
        let dx = self.b.x - self.a.x;
        let dy = self.b.y - self.a.y;
        let u = ((p.x - self.a.x) * dx + (p.y - self.a.y) * dy) / (len * len);
        let u = u.clamp(0.0, 1.0);
        let closest = Point::new(self.a.x + u * dx, self.a.y + u * dy);
        p.distance_to(closest)
    }
}

/// Ground-contact approximation: bottom edge, horizontal center.
pub fn reference_point(bbox: &BoundingBox) -> Point {
    Point::new((bbox.x1 + bbox.x2) / 2.0, bbox.y1.max(bbox.y2))
}

/// Decides whether a box touches the configured segment.
#[derive(Clone, Copy, Debug)]
pub struct CrossingEvaluator {
    threshold_px: f32,
}

impl CrossingEvaluator {
    pub fn new(threshold_px: f32) -> Self {
        Self { threshold_px }
    }

    pub fn threshold_px(&self) -> f32 {
        self.threshold_px
    }

    /// Pixel distance between the box's reference point and the segment.
    pub fn distance(&self, segment: &Segment, bbox: &BoundingBox) -> f32 {
        segment.distance_to(reference_point(bbox))
    }

    pub fn is_crossing(&self, segment: &Segment, bbox: &BoundingBox) -> bool {
        self.distance(segment, bbox) < self.threshold_px
    }
}

impl Default for CrossingEvaluator {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD_PX)
    }
}
