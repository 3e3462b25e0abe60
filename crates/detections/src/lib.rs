//! Detection records shared between the detector supervisor and its stream
//! emulator.
//!
//! Records arrive in the detector's relative-coordinate JSON format and are
//! converted to absolute pixel boxes before they are pushed to consumers.

pub mod dataset;
pub mod record;
pub mod transform;

pub use dataset::{DatasetError, DetectionDataset};
pub use record::{
    AbsoluteBox, AbsoluteDetectionRecord, AbsoluteObject, DetectedObject, DetectionRecord,
    RelativeBox, VideoSize,
};
pub use transform::{REFERENCE_FRAME_SIZE, to_absolute};
