use serde::{Deserialize, Serialize};

use crate::detection::domain::face_attributes::{format_percent, ExpressionScores, GenderEstimate};
use crate::shared::bounding_box::BoundingBox;

/// One face as reported by the inference engine, in native frame coordinates.
///
/// `age` and `gender` are absent when the age/gender estimator is disabled;
/// `expressions` is empty when the expression estimator is disabled.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    #[serde(default = "default_score")]
    pub score: f64,
    #[serde(default)]
    pub age: Option<f64>,
    #[serde(flatten)]
    pub gender: Option<GenderEstimate>,
    #[serde(default)]
    pub expressions: ExpressionScores,
}

fn default_score() -> f64 {
    1.0
}

/// A detection whose box has been rescaled into display coordinates.
///
/// Created only by the coordinate mapper and never mutated afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayDetection {
    bbox: BoundingBox,
    score: f64,
    age: Option<f64>,
    gender: Option<GenderEstimate>,
    expressions: ExpressionScores,
}

impl DisplayDetection {
    pub(crate) fn from_raw(raw: &RawDetection, bbox: BoundingBox) -> Self {
        Self {
            bbox,
            score: raw.score,
            age: raw.age,
            gender: raw.gender,
            expressions: raw.expressions.clone(),
        }
    }

    pub(crate) fn with_box(&self, bbox: BoundingBox) -> Self {
        Self {
            bbox,
            ..self.clone()
        }
    }

    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn age(&self) -> Option<f64> {
        self.age
    }

    pub fn gender(&self) -> Option<&GenderEstimate> {
        self.gender.as_ref()
    }

    pub fn expressions(&self) -> &ExpressionScores {
        &self.expressions
    }

    /// Box label: rounded age, gender and gender confidence,
    /// e.g. `"30 yrs, female (92.0%)"`. Parts whose estimator was disabled
    /// are omitted; `None` when neither is available.
    pub fn label(&self) -> Option<String> {
        let age = self.age.map(|a| format!("{} yrs", a.round() as i64));
        let gender = self
            .gender
            .map(|g| format!("{} ({})", g.gender, format_percent(g.probability)));
        match (age, gender) {
            (Some(a), Some(g)) => Some(format!("{a}, {g}")),
            (Some(a), None) => Some(a),
            (None, Some(g)) => Some(g),
            (None, None) => None,
        }
    }

    /// Ranked emotion list, e.g. `"happy (80.0%), neutral (15.0%)"`.
    pub fn emotion_ranking(&self) -> String {
        self.expressions.ranking_text()
    }
}
