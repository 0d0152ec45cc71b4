use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::detection::domain::face_detection::RawDetection;
use crate::detection::domain::inference_adapter::{InferenceAdapter, InferenceError, InferenceOptions};
use crate::shared::frame::Frame;

/// Recorded inference output, one entry per frame.
///
/// A `null` entry stands for a call on which the engine failed.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct ReplayScript {
    #[serde(default)]
    pub frames: Vec<Option<Vec<RawDetection>>>,
}

impl ReplayScript {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let json = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }
}

/// Replays recorded detections by frame index.
///
/// Stands in for a live inference engine when results were computed
/// elsewhere: frame `i` receives entry `i % len`, so a short script loops
/// over a long capture. Options are honoured the same way an engine would
/// (score threshold, disabled estimators).
pub struct ReplayInferenceAdapter {
    script: Arc<ReplayScript>,
}

impl ReplayInferenceAdapter {
    pub fn new(script: Arc<ReplayScript>) -> Self {
        Self { script }
    }
}

impl InferenceAdapter for ReplayInferenceAdapter {
    fn detect(
        &mut self,
        frame: &Frame,
        options: &InferenceOptions,
    ) -> Result<Vec<RawDetection>, InferenceError> {
        let frames = &self.script.frames;
        if frames.is_empty() {
            return Ok(Vec::new());
        }
        match &frames[frame.index() % frames.len()] {
            Some(detections) => Ok(options.apply(detections.clone())),
            None => Err(InferenceError::Backend(format!(
                "recorded failure for frame {}",
                frame.index()
            ))),
        }
    }
}
