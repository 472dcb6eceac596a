//! Frame scores produced by the external vision scorer.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Rank of a pose label; still subjects give the clearest view.
pub fn pose_rank(pose: &str) -> u8 {
    match pose.trim().to_lowercase().as_str() {
        "standing" | "stationary" => 3,
        "sitting" => 2,
        "walking" | "moving" => 1,
        _ => 0,
    }
}

/// What the external scorer said about one image.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FrameAssessment {
    pub face_score: f64,
    pub person_score: f64,
    /// Overall shot quality; defaults to `person_score` when the scorer omits it
    pub frame_score: f64,
    /// Lower-cased pose label ("standing", "walking", ...), empty if unknown
    #[serde(default)]
    pub pose: String,
    /// Short description of the scene
    #[serde(default)]
    pub summary: String,
    /// Raw object returned by the scorer
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl FrameAssessment {
    pub fn pose_rank(&self) -> u8 {
        pose_rank(&self.pose)
    }
}

/// Whether a score was computed for this request or reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    Fresh,
    Cached,
}

/// Result of evaluating a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Score {
    pub frame_index: usize,
    pub face_score: f64,
    pub person_score: f64,
    pub frame_score: f64,
    #[serde(default)]
    pub pose: String,
    #[serde(default)]
    pub summary: String,
    /// Epoch seconds
    pub computed_ts: f64,
    pub source: ScoreSource,
}

impl Score {
    pub fn from_assessment(
        frame_index: usize,
        assessment: &FrameAssessment,
        computed_ts: f64,
        source: ScoreSource,
    ) -> Self {
        Self {
            frame_index,
            face_score: assessment.face_score,
            person_score: assessment.person_score,
            frame_score: assessment.frame_score,
            pose: assessment.pose.clone(),
            summary: assessment.summary.clone(),
            computed_ts,
            source,
        }
    }

    /// Same score, re-labelled as served from cache.
    pub fn cached(&self) -> Self {
        Self {
            source: ScoreSource::Cached,
            ..self.clone()
        }
    }

    pub fn pose_rank(&self) -> u8 {
        pose_rank(&self.pose)
    }

    /// True when the person score does not clear the no-people threshold.
    pub fn is_empty_scene(&self, no_people_threshold: f64) -> bool {
        self.person_score <= no_people_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pose_rank() {
        let mut a = FrameAssessment::default();
        assert_eq!(a.pose_rank(), 0);
        a.pose = "Standing".to_string();
        assert_eq!(a.pose_rank(), 3);
        a.pose = "walking".to_string();
        assert_eq!(a.pose_rank(), 1);
    }

    #[test]
    fn test_empty_scene_threshold_inclusive() {
        let assessment = FrameAssessment {
            person_score: 0.2,
            ..Default::default()
        };
        let score = Score::from_assessment(3, &assessment, 0.0, ScoreSource::Fresh);
        assert!(score.is_empty_scene(0.2));
        assert!(!score.is_empty_scene(0.1));
        assert_eq!(score.cached().source, ScoreSource::Cached);
    }
}
