use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::detection::domain::face_detection::RawDetection;
use crate::shared::constants::{DEFAULT_INPUT_SIZE, DEFAULT_SCORE_THRESHOLD};
use crate::shared::frame::Frame;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference backend failed: {0}")]
    Backend(String),
    #[error("frame {index} cannot be analysed: {reason}")]
    InvalidFrame { index: usize, reason: String },
}

/// Speed/accuracy trade-off of the face detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Lightweight detector suited to live video.
    Tiny,
    /// Slower, more accurate detector.
    Ssd,
}

/// Per-call configuration handed to the inference engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceOptions {
    pub detector: DetectorKind,
    pub input_size: u32,
    pub score_threshold: f64,
    pub with_expressions: bool,
    pub with_age_gender: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            detector: DetectorKind::Tiny,
            input_size: DEFAULT_INPUT_SIZE,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            with_expressions: true,
            with_age_gender: true,
        }
    }
}

impl InferenceOptions {
    /// Drops detections below the score threshold and strips attributes
    /// whose estimator is disabled.
    pub fn apply(&self, detections: Vec<RawDetection>) -> Vec<RawDetection> {
        detections
            .into_iter()
            .filter(|d| d.score >= self.score_threshold)
            .map(|mut d| {
                if !self.with_age_gender {
                    d.age = None;
                    d.gender = None;
                }
                if !self.with_expressions {
                    d.expressions = Default::default();
                }
                d
            })
            .collect()
    }
}

/// Domain interface to the external face-inference engine.
///
/// Given a frame, returns detections in the frame's native coordinates.
/// A call may take non-trivial wall-clock time; the pipeline never issues
/// two overlapping calls on the same adapter, hence `&mut self`.
pub trait InferenceAdapter: Send {
    fn detect(
        &mut self,
        frame: &Frame,
        options: &InferenceOptions,
    ) -> Result<Vec<RawDetection>, InferenceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::domain::face_attributes::{Emotion, ExpressionScores, Gender, GenderEstimate};
    use crate::shared::bounding_box::BoundingBox;

    fn detection(score: f64) -> RawDetection {
        RawDetection {
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            score,
            age: Some(25.0),
            gender: Some(GenderEstimate::new(Gender::Male, 0.8)),
            expressions: ExpressionScores::new().with(Emotion::Happy, 0.9),
        }
    }

    #[test]
    fn test_defaults_select_lightweight_detector() {
        let opts = InferenceOptions::default();
        assert_eq!(opts.detector, DetectorKind::Tiny);
        assert_eq!(opts.input_size, 416);
        assert!(opts.with_expressions);
        assert!(opts.with_age_gender);
    }

    #[test]
    fn test_apply_filters_by_score() {
        let opts = InferenceOptions {
            score_threshold: 0.6,
            ..Default::default()
        };
        let kept = opts.apply(vec![detection(0.5), detection(0.6), detection(0.9)]);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_apply_strips_disabled_estimators() {
        let opts = InferenceOptions {
            with_expressions: false,
            with_age_gender: false,
            ..Default::default()
        };
        let kept = opts.apply(vec![detection(1.0)]);
        assert!(kept[0].age.is_none());
        assert!(kept[0].gender.is_none());
        assert!(kept[0].expressions.is_empty());
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let opts: InferenceOptions = serde_json::from_str(r#"{"detector": "ssd"}"#).unwrap();
        assert_eq!(opts.detector, DetectorKind::Ssd);
        assert_eq!(opts.input_size, 416);
    }
}
