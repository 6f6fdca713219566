//! Wire types shared by the detection server, its stdio worker and the
//! realtime capture client.

pub mod settings;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One labeled finding reported by a detection worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub label: String,
    pub confidence: f32,
    pub description: String,
    /// `[x_min, y_min, x_max, y_max]` in pixels of the processed image.
    #[serde(rename = "box", default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[i32; 4]>,
}

/// Annotated image plus findings, in the order the worker produced them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub processed_image_base64: String,
    pub detections: Vec<Finding>,
}

/// JSON body accepted by `POST /detect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectRequest {
    pub image_base64: String,
}

/// Error body returned by every non-2xx response of `POST /detect`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum FindingError {
    #[error("finding {index} ({label}) has confidence {confidence} outside [0, 1]")]
    ConfidenceOutOfRange {
        index: usize,
        label: String,
        confidence: f32,
    },
}

impl Finding {
    pub fn has_valid_confidence(&self) -> bool {
        self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence)
    }
}

impl DetectionResult {
    /// Rejects the result if any finding carries a confidence that is NaN,
    /// infinite or outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), FindingError> {
        match self
            .detections
            .iter()
            .enumerate()
            .find(|(_, finding)| !finding.has_valid_confidence())
        {
            Some((index, finding)) => Err(FindingError::ConfidenceOutOfRange {
                index,
                label: finding.label.clone(),
                confidence: finding.confidence,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(label: &str, confidence: f32) -> Finding {
        Finding {
            label: label.to_string(),
            confidence,
            description: format!("{label} seen"),
            bbox: None,
        }
    }

    #[test]
    fn test_validate_accepts_bounds_inclusive() {
        let result = DetectionResult {
            processed_image_base64: "aGk=".into(),
            detections: vec![finding("a", 0.0), finding("b", 1.0), finding("c", 0.42)],
        };
        assert_eq!(result.validate(), Ok(()));
    }

    #[test]
    fn test_validate_reports_first_offending_finding() {
        let result = DetectionResult {
            processed_image_base64: String::new(),
            detections: vec![finding("ok", 0.5), finding("high", 1.5), finding("low", -0.1)],
        };
        assert_eq!(
            result.validate(),
            Err(FindingError::ConfidenceOutOfRange {
                index: 1,
                label: "high".into(),
                confidence: 1.5,
            })
        );
    }

    #[test]
    fn test_validate_rejects_nan() {
        let result = DetectionResult {
            processed_image_base64: String::new(),
            detections: vec![finding("nan", f32::NAN)],
        };
        assert!(result.validate().is_err());
    }

    #[test]
    fn test_box_field_is_optional_and_renamed() {
        let raw = r#"{
            "processed_image_base64": "aGk=",
            "detections": [
                {"label": "phone", "confidence": 0.85, "description": "d", "box": [1, 2, 3, 4]},
                {"label": "book", "confidence": 0.5, "description": "d"}
            ]
        }"#;
        let result: DetectionResult = serde_json::from_str(raw).unwrap();
        assert_eq!(result.detections[0].bbox, Some([1, 2, 3, 4]));
        assert_eq!(result.detections[1].bbox, None);

        let encoded = serde_json::to_value(&result.detections[1]).unwrap();
        assert!(encoded.get("box").is_none());
    }

    #[test]
    fn test_error_body_omits_missing_details() {
        let body = serde_json::to_string(&ErrorBody::new("No image file provided")).unwrap();
        assert_eq!(body, r#"{"error":"No image file provided"}"#);
    }
}
