use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Gender::Male => write!(f, "male"),
            Gender::Female => write!(f, "female"),
        }
    }
}

/// Estimated gender together with the estimator's probability for it.
///
/// Deserializing goes through [`GenderEstimate::new`], so out-of-range
/// probabilities from recorded or engine JSON are clamped too.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "GenderRecord")]
pub struct GenderEstimate {
    pub gender: Gender,
    pub probability: f64,
}

#[derive(Deserialize)]
struct GenderRecord {
    gender: Gender,
    probability: f64,
}

impl From<GenderRecord> for GenderEstimate {
    fn from(record: GenderRecord) -> Self {
        Self::new(record.gender, record.probability)
    }
}

impl GenderEstimate {
    /// Clamps `probability` into [0, 1].
    pub fn new(gender: Gender, probability: f64) -> Self {
        Self {
            gender,
            probability: clamp_probability(probability),
        }
    }
}

/// The fixed set of facial expressions the estimator reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Emotion {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgusted,
    Surprised,
}

impl Emotion {
    /// Canonical order; ranking ties fall back to it.
    pub const ALL: [Emotion; 7] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Fearful,
        Emotion::Disgusted,
        Emotion::Surprised,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Fearful => "fearful",
            Emotion::Disgusted => "disgusted",
            Emotion::Surprised => "surprised",
        }
    }

    /// Case-insensitive lookup by label.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|e| e.label().eq_ignore_ascii_case(label.trim()))
    }

    fn slot(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-emotion probabilities over the fixed [`Emotion`] key set.
///
/// Each emotion is either absent (the estimator did not report it) or
/// carries a probability in [0, 1]. Probabilities are estimated
/// independently and need not sum to 1.
///
/// Converting from a label map drops unknown labels and clamps values, so
/// malformed input never produces out-of-range scores.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, f64>", into = "BTreeMap<String, f64>")]
pub struct ExpressionScores {
    scores: [Option<f64>; 7],
}

impl ExpressionScores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, emotion: Emotion, probability: f64) -> Self {
        self.set(emotion, probability);
        self
    }

    pub fn set(&mut self, emotion: Emotion, probability: f64) {
        self.scores[emotion.slot()] = Some(clamp_probability(probability));
    }

    pub fn get(&self, emotion: Emotion) -> Option<f64> {
        self.scores[emotion.slot()]
    }

    pub fn is_empty(&self) -> bool {
        self.scores.iter().all(Option::is_none)
    }

    /// Reported emotions, highest probability first.
    pub fn ranked(&self) -> Vec<(Emotion, f64)> {
        let mut present: Vec<(Emotion, f64)> = Emotion::ALL
            .into_iter()
            .filter_map(|e| self.get(e).map(|p| (e, p)))
            .collect();
        // stable sort keeps canonical order among ties
        present.sort_by(|a, b| b.1.total_cmp(&a.1));
        present
    }

    /// `"happy (80.0%), neutral (15.0%)"`; empty when nothing was reported.
    pub fn ranking_text(&self) -> String {
        self.ranked_lines().join(", ")
    }

    /// One `"label (pct%)"` entry per reported emotion, ranked.
    pub fn ranked_lines(&self) -> Vec<String> {
        self.ranked()
            .into_iter()
            .map(|(emotion, p)| format!("{emotion} ({})", format_percent(p)))
            .collect()
    }
}

impl From<BTreeMap<String, f64>> for ExpressionScores {
    fn from(map: BTreeMap<String, f64>) -> Self {
        let mut scores = ExpressionScores::new();
        for (label, probability) in map {
            match Emotion::from_label(&label) {
                Some(emotion) => scores.set(emotion, probability),
                None => log::debug!("Ignoring unknown expression label '{label}'"),
            }
        }
        scores
    }
}

impl From<ExpressionScores> for BTreeMap<String, f64> {
    fn from(scores: ExpressionScores) -> Self {
        Emotion::ALL
            .into_iter()
            .filter_map(|e| scores.get(e).map(|p| (e.label().to_string(), p)))
            .collect()
    }
}

/// Formats a probability as a percentage with one decimal, e.g. `0.92` → `92.0%`.
pub fn format_percent(probability: f64) -> String {
    format!("{:.1}%", probability * 100.0)
}

fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}
