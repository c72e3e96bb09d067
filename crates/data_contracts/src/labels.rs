use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Slack allowed when checking normalized coordinates against the unit square.
/// Annotation tools round to 6 decimals, so boxes touching the border can land
/// a hair outside.
pub const BOUNDS_TOLERANCE: f32 = 1e-4;

/// One labelled box. `bbox` is normalized corner form `[x_min, y_min, x_max, y_max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBoxAnnotation {
    pub class_id: u32,
    pub bbox: [f32; 4],
}

/// One image plus its ordered annotations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSample {
    pub image: PathBuf,
    pub annotations: Vec<BoundingBoxAnnotation>,
}

#[derive(Debug, Error, PartialEq)]
pub enum LabelError {
    #[error("expected 5 fields `class cx cy w h`, got {0}")]
    FieldCount(usize),
    #[error("class id `{0}` is not a non-negative integer")]
    ClassId(String),
    #[error("coordinate `{0}` is not a number")]
    Coordinate(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("class id {class_id} outside [0, {num_classes})")]
    InvalidClass { class_id: u32, num_classes: usize },
    #[error("bbox out of image bounds: {0:?}")]
    OutOfBounds([f32; 4]),
    #[error("bbox non-finite or empty: {0:?}")]
    Degenerate([f32; 4]),
}

impl BoundingBoxAnnotation {
    /// Parse one `class cx cy w h` line (normalized center form).
    pub fn from_yolo_line(line: &str) -> Result<Self, LabelError> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(LabelError::FieldCount(fields.len()));
        }
        let class_id = fields[0]
            .parse::<u32>()
            .map_err(|_| LabelError::ClassId(fields[0].to_string()))?;
        let mut coords = [0.0f32; 4];
        for (slot, raw) in coords.iter_mut().zip(&fields[1..]) {
            *slot = raw
                .parse::<f32>()
                .map_err(|_| LabelError::Coordinate(raw.to_string()))?;
        }
        let [cx, cy, w, h] = coords;
        Ok(Self {
            class_id,
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
        })
    }

    pub fn validate(&self, num_classes: usize) -> Result<(), ValidationError> {
        if self.class_id as usize >= num_classes {
            return Err(ValidationError::InvalidClass {
                class_id: self.class_id,
                num_classes,
            });
        }
        let b = self.bbox;
        if b.iter().any(|v| !v.is_finite()) || b[0] >= b[2] || b[1] >= b[3] {
            return Err(ValidationError::Degenerate(b));
        }
        let lo = -BOUNDS_TOLERANCE;
        let hi = 1.0 + BOUNDS_TOLERANCE;
        if b.iter().any(|v| *v < lo || *v > hi) {
            return Err(ValidationError::OutOfBounds(b));
        }
        Ok(())
    }

    /// Box clamped into the unit square; call after `validate`.
    pub fn clamped(&self) -> [f32; 4] {
        self.bbox.map(|v| v.clamp(0.0, 1.0))
    }
}

impl DetectionSample {
    pub fn validate(&self, num_classes: usize) -> Result<(), ValidationError> {
        for annotation in &self.annotations {
            annotation.validate(num_classes)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_center_form_into_corners() {
        let ann = BoundingBoxAnnotation::from_yolo_line("2 0.5 0.5 0.2 0.4").unwrap();
        assert_eq!(ann.class_id, 2);
        let expected = [0.4, 0.3, 0.6, 0.7];
        for (a, e) in ann.bbox.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6);
        }
    }

    #[test]
    fn malformed_lines_rejected() {
        assert_eq!(
            BoundingBoxAnnotation::from_yolo_line("1 0.5 0.5"),
            Err(LabelError::FieldCount(3))
        );
        assert!(matches!(
            BoundingBoxAnnotation::from_yolo_line("-1 0.5 0.5 0.1 0.1"),
            Err(LabelError::ClassId(_))
        ));
        assert!(matches!(
            BoundingBoxAnnotation::from_yolo_line("1 x 0.5 0.1 0.1"),
            Err(LabelError::Coordinate(_))
        ));
    }

    #[test]
    fn class_outside_range_fails() {
        let sample = DetectionSample {
            image: "a.jpg".into(),
            annotations: vec![
                BoundingBoxAnnotation {
                    class_id: 0,
                    bbox: [0.1, 0.1, 0.2, 0.2],
                },
                BoundingBoxAnnotation {
                    class_id: 3,
                    bbox: [0.1, 0.1, 0.2, 0.2],
                },
            ],
        };
        assert_eq!(
            sample.validate(3),
            Err(ValidationError::InvalidClass {
                class_id: 3,
                num_classes: 3
            })
        );
        assert!(sample.validate(4).is_ok());
    }

    #[test]
    fn out_of_bounds_and_degenerate_boxes_fail() {
        let outside = BoundingBoxAnnotation {
            class_id: 0,
            bbox: [0.8, 0.8, 1.2, 0.9],
        };
        assert!(matches!(
            outside.validate(1),
            Err(ValidationError::OutOfBounds(_))
        ));
        let empty = BoundingBoxAnnotation {
            class_id: 0,
            bbox: [0.5, 0.5, 0.5, 0.9],
        };
        assert!(matches!(empty.validate(1), Err(ValidationError::Degenerate(_))));
        let nan = BoundingBoxAnnotation {
            class_id: 0,
            bbox: [f32::NAN, 0.1, 0.2, 0.2],
        };
        assert!(matches!(nan.validate(1), Err(ValidationError::Degenerate(_))));
    }

    #[test]
    fn border_rounding_is_tolerated() {
        let ann = BoundingBoxAnnotation {
            class_id: 0,
            bbox: [-0.00005, 0.0, 1.00005, 1.0],
        };
        assert!(ann.validate(1).is_ok());
        assert_eq!(ann.clamped(), [0.0, 0.0, 1.0, 1.0]);
    }
}
