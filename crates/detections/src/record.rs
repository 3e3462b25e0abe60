use serde::{Deserialize, Serialize};

/// Box expressed as fractions of the frame, anchored on its centre.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelativeBox {
    pub center_x: f64,
    pub center_y: f64,
    pub width: f64,
    pub height: f64,
}

/// Single object as emitted by the detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub class_id: u32,
    pub name: String,
    pub relative_coordinates: RelativeBox,
    pub confidence: f64,
}

/// All objects the detector reported for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub frame_id: u32,
    #[serde(default)]
    pub objects: Vec<DetectedObject>,
}

impl DetectionRecord {
    /// Record for a frame without any detections.
    pub fn empty(frame_id: u32) -> Self {
        Self {
            frame_id,
            objects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSize {
    pub width: u32,
    pub height: u32,
}

/// Box in pixel units.
///
/// `center_x`/`center_y` hold the top-left corner. The field names are kept
/// for wire compatibility with the tracker that consumes the metadata stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbsoluteBox {
    pub center_x: f64,
    pub center_y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsoluteObject {
    pub class_id: u32,
    pub name: String,
    pub absolute_coordinates: AbsoluteBox,
    pub confidence: f64,
}

/// Per-frame record pushed on the metadata stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbsoluteDetectionRecord {
    pub frame_id: u32,
    pub video_size: VideoSize,
    pub objects: Vec<AbsoluteObject>,
}
