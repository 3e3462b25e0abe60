use crate::record::{
    AbsoluteBox, AbsoluteDetectionRecord, AbsoluteObject, DetectionRecord, RelativeBox, VideoSize,
};

/// Frame size the canned detections were recorded against.
pub const REFERENCE_FRAME_SIZE: VideoSize = VideoSize {
    width: 640,
    height: 360,
};

/// Convert a relative centre-anchored record into top-left anchored pixel boxes.
pub fn to_absolute(record: &DetectionRecord, size: VideoSize) -> AbsoluteDetectionRecord {
    AbsoluteDetectionRecord {
        frame_id: record.frame_id,
        video_size: size,
        objects: record
            .objects
            .iter()
            .map(|object| AbsoluteObject {
                class_id: object.class_id,
                name: object.name.clone(),
                absolute_coordinates: scale_box(&object.relative_coordinates, size),
                confidence: object.confidence,
            })
            .collect(),
    }
}

fn scale_box(rel: &RelativeBox, size: VideoSize) -> AbsoluteBox {
    let frame_w = f64::from(size.width);
    let frame_h = f64::from(size.height);
    AbsoluteBox {
        center_x: (rel.center_x - rel.width / 2.0) * frame_w,
        center_y: (rel.center_y - rel.height / 2.0) * frame_h,
        width: rel.width * frame_w,
        height: rel.height * frame_h,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DetectedObject;

    fn object(rel: RelativeBox) -> DetectedObject {
        DetectedObject {
            class_id: 2,
            name: "car".into(),
            relative_coordinates: rel,
            confidence: 0.87,
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn centred_box_maps_to_top_left_pixels() {
        let record = DetectionRecord {
            frame_id: 42,
            objects: vec![object(RelativeBox {
                center_x: 0.5,
                center_y: 0.5,
                width: 0.2,
                height: 0.1,
            })],
        };

        let absolute = to_absolute(&record, REFERENCE_FRAME_SIZE);
        let bbox = absolute.objects[0].absolute_coordinates;
        assert_close(bbox.center_x, 256.0);
        assert_close(bbox.center_y, 162.0);
        assert_close(bbox.width, 128.0);
        assert_close(bbox.height, 36.0);
        assert_eq!(absolute.frame_id, 42);
        assert_eq!(absolute.video_size, REFERENCE_FRAME_SIZE);
    }

    #[test]
    fn keeps_object_order_and_labels() {
        let mut first = object(RelativeBox {
            center_x: 0.1,
            center_y: 0.1,
            width: 0.1,
            height: 0.1,
        });
        first.name = "person".into();
        first.class_id = 0;
        let second = object(RelativeBox {
            center_x: 0.9,
            center_y: 0.9,
            width: 0.1,
            height: 0.1,
        });
        let record = DetectionRecord {
            frame_id: 7,
            objects: vec![first, second],
        };

        let absolute = to_absolute(&record, REFERENCE_FRAME_SIZE);
        let names: Vec<_> = absolute.objects.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, ["person", "car"]);
        assert_eq!(absolute.objects[0].class_id, 0);
        assert_close(absolute.objects[1].confidence, 0.87);
    }

    #[test]
    fn serializes_with_wire_field_names() {
        let record = DetectionRecord {
            frame_id: 16,
            objects: vec![object(RelativeBox {
                center_x: 0.5,
                center_y: 0.5,
                width: 0.5,
                height: 0.5,
            })],
        };
        let json = serde_json::to_value(to_absolute(&record, REFERENCE_FRAME_SIZE))
            .expect("record serializes");

        assert_eq!(json["frame_id"], 16);
        assert_eq!(json["video_size"]["width"], 640);
        assert_eq!(json["video_size"]["height"], 360);
        let coords = &json["objects"][0]["absolute_coordinates"];
        assert_eq!(coords["center_x"], 160.0);
        assert_eq!(coords["center_y"], 90.0);
        assert_eq!(coords["width"], 320.0);
        assert_eq!(coords["height"], 180.0);
        assert_eq!(json["objects"][0]["name"], "car");
    }
}
