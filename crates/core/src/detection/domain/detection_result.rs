use std::time::Duration;

use serde::{Serialize, Serializer};

/// A point in normalized image space, both axes in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Pixel position in an image of the given size.
    pub fn to_pixels(self, width: u32, height: u32) -> (f32, f32) {
        (self.x * width as f32, self.y * height as f32)
    }
}

/// Coordinates surfaced to the presentation layer for one analyzed frame.
///
/// Absent fields mean the engine did not report that landmark; they are
/// omitted from serialized output rather than written as zero.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nose: Option<Point2>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left_iris: Option<Point2>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right_iris: Option<Point2>,
    #[serde(rename = "timestampNs", serialize_with = "serialize_nanos")]
    pub timestamp: Duration,
    pub image_width: u32,
    pub image_height: u32,
}

impl DetectionResult {
    pub fn has_iris(&self) -> bool {
        self.left_iris.is_some() && self.right_iris.is_some()
    }
}

pub(crate) fn serialize_nanos<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(value.as_nanos() as u64)
}
