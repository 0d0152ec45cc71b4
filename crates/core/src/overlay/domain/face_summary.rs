use crate::pipeline::result_store::StreamState;

/// Text panel listing every detected face, one line per face.
pub struct FaceSummary;

impl FaceSummary {
    /// `"Face 1: 30 yrs, female (92.0%) | Emotions: happy (80.0%), ..."`.
    /// Empty (panel hidden) while inactive or when no faces were found.
    pub fn lines(state: &StreamState) -> Vec<String> {
        if !state.is_active() {
            return Vec::new();
        }
        state
            .results()
            .detections()
            .iter()
            .enumerate()
            .map(|(i, detection)| {
                let label = detection.label().unwrap_or_else(|| "unknown".to_string());
                let ranking = detection.emotion_ranking();
                let ranking = if ranking.is_empty() { "none".to_string() } else { ranking };
                format!("Face {}: {label} | Emotions: {ranking}", i + 1)
            })
            .collect()
    }
}
