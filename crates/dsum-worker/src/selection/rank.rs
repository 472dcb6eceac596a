//! Ranking policies for scored frames.
//!
//! A policy maps a score to a [`RankKey`]; keys compare tier first, then
//! components left to right. Equal keys fall back to capture order so the
//! first good view of a subject wins.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dsum_models::Score;

use crate::error::WorkerError;

/// Comparable rank of one score. Higher is better.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankKey {
    pub tier: u8,
    pub components: [f64; 4],
}

impl RankKey {
    pub fn compare(&self, other: &RankKey) -> Ordering {
        self.tier.cmp(&other.tier).then_with(|| {
            self.components
                .iter()
                .zip(other.components.iter())
                .map(|(a, b)| a.total_cmp(b))
                .find(|o| o.is_ne())
                .unwrap_or(Ordering::Equal)
        })
    }
}

/// Orders scored frames for best-frame choice and the shortlist.
pub trait RankPolicy: Send + Sync + fmt::Debug {
    fn key(&self, score: &Score) -> RankKey;

    fn name(&self) -> &'static str;

    /// Best-first ordering; equal keys keep the earlier frame first.
    fn compare(&self, a: &Score, b: &Score) -> Ordering {
        self.key(b)
            .compare(&self.key(a))
            .then_with(|| a.frame_index.cmp(&b.frame_index))
    }
}

/// Any detected face outranks any frame with only a person in it.
///
/// Tiers: face > 0, then person > 0, then nothing. Within a tier the
/// primary score (face, or person without a face) decides, then frame
/// quality, then pose, then person score.
#[derive(Debug, Clone, Copy, Default)]
pub struct FacesFirst;

impl RankPolicy for FacesFirst {
    fn key(&self, score: &Score) -> RankKey {
        let (tier, primary) = if score.face_score > 0.0 {
            (2, score.face_score)
        } else if score.person_score > 0.0 {
            (1, score.person_score)
        } else {
            (0, 0.0)
        };
        RankKey {
            tier,
            components: [
                primary,
                score.frame_score,
                f64::from(score.pose_rank()),
                score.person_score,
            ],
        }
    }

    fn name(&self) -> &'static str {
        RankPolicyName::FacesFirst.as_str()
    }
}

/// Person score first; faces only break ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct PersonFirst;

impl RankPolicy for PersonFirst {
    fn key(&self, score: &Score) -> RankKey {
        RankKey {
            tier: u8::from(score.person_score > 0.0),
            components: [
                score.person_score,
                score.face_score,
                score.frame_score,
                f64::from(score.pose_rank()),
            ],
        }
    }

    fn name(&self) -> &'static str {
        RankPolicyName::PersonFirst.as_str()
    }
}

/// Configurable policy name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankPolicyName {
    #[default]
    FacesFirst,
    PersonFirst,
}

impl RankPolicyName {
    pub fn as_str(&self) -> &'static str {
        match self {
            RankPolicyName::FacesFirst => "faces_first",
            RankPolicyName::PersonFirst => "person_first",
        }
    }

    pub fn policy(&self) -> Arc<dyn RankPolicy> {
        match self {
            RankPolicyName::FacesFirst => Arc::new(FacesFirst),
            RankPolicyName::PersonFirst => Arc::new(PersonFirst),
        }
    }
}

impl FromStr for RankPolicyName {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "faces_first" | "" => Ok(RankPolicyName::FacesFirst),
            "person_first" => Ok(RankPolicyName::PersonFirst),
            other => Err(WorkerError::config_error(format!("unknown rank policy {:?}", other))),
        }
    }
}

/// Compare two optional scores; a missing score ranks below any score.
pub fn compare_optional(policy: &dyn RankPolicy, a: Option<&Score>, b: Option<&Score>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => policy.key(a).compare(&policy.key(b)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsum_models::{FrameAssessment, ScoreSource};

    fn score(idx: usize, person: f64, face: f64, frame: f64, pose: &str) -> Score {
        let a = FrameAssessment {
            person_score: person,
            face_score: face,
            frame_score: frame,
            pose: pose.to_string(),
            ..Default::default()
        };
        Score::from_assessment(idx, &a, 0.0, ScoreSource::Fresh)
    }

    fn order(policy: &dyn RankPolicy, mut scores: Vec<Score>) -> Vec<usize> {
        scores.sort_by(|a, b| policy.compare(a, b));
        scores.iter().map(|s| s.frame_index).collect()
    }

    #[test]
    fn test_face_outranks_person() {
        let scores = vec![
            score(0, 9.0, 0.0, 9.0, "standing"),
            score(1, 1.0, 0.1, 1.0, ""),
            score(2, 0.0, 0.0, 5.0, ""),
        ];
        assert_eq!(order(&FacesFirst, scores), vec![1, 0, 2]);
    }

    #[test]
    fn test_secondary_keys() {
        let scores = vec![
            score(0, 5.0, 0.0, 4.0, "walking"),
            score(1, 5.0, 0.0, 6.0, "walking"),
            score(2, 5.0, 0.0, 6.0, "standing"),
        ];
        assert_eq!(order(&FacesFirst, scores), vec![2, 1, 0]);
    }

    #[test]
    fn test_ties_prefer_earliest() {
        let scores = vec![score(7, 3.0, 1.0, 3.0, ""), score(2, 3.0, 1.0, 3.0, "")];
        assert_eq!(order(&FacesFirst, scores), vec![2, 7]);
    }

    #[test]
    fn test_person_first() {
        let scores = vec![score(0, 2.0, 1.0, 2.0, ""), score(1, 8.0, 0.0, 2.0, "")];
        assert_eq!(order(&PersonFirst, scores.clone()), vec![1, 0]);
        assert_eq!(order(&FacesFirst, scores), vec![0, 1]);
    }

    #[test]
    fn test_policy_names() {
        assert_eq!("faces_first".parse::<RankPolicyName>().unwrap(), RankPolicyName::FacesFirst);
        assert_eq!(" Person_First ".parse::<RankPolicyName>().unwrap(), RankPolicyName::PersonFirst);
        assert!("loudest".parse::<RankPolicyName>().is_err());
        assert_eq!(RankPolicyName::PersonFirst.policy().name(), "person_first");
    }

    #[test]
    fn test_missing_ranks_lowest() {
        let s = score(0, 0.0, 0.0, 0.0, "");
        assert_eq!(compare_optional(&FacesFirst, Some(&s), None), Ordering::Greater);
        assert_eq!(compare_optional(&FacesFirst, None, None), Ordering::Equal);
    }
}
