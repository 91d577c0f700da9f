//! Descriptor comparison.
//!
//! Both metrics report a distance and a normalized similarity
//! `clamp(1 - distance, 0, 1)`:
//!
//! - [`Metric::Distance`]: Euclidean distance over the raw descriptors.
//! - [`Metric::Cosine`]: cosine distance over L2-normalized descriptors,
//!   computed as `|â - b̂|² / 2` (equal to `1 - cos θ`), so the similarity is
//!   the cosine similarity floored at zero.
//!
//! Computing cosine through the normalized difference keeps identical
//! descriptors at exactly 1.0 and keeps the score exactly symmetric.

use thiserror::Error;

use crate::options::{Metric, VerificationOptions};
use crate::types::{MatchDecision, MatchResult};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScoreError {
    #[error("descriptor length mismatch: template has {expected} values, observation has {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("descriptor is empty")]
    Empty,
    #[error("descriptor contains NaN or infinite values")]
    NonFinite,
    #[error("descriptor has zero norm and cannot be normalized")]
    ZeroNorm,
}

/// Stateless descriptor scorer with three-way decision bands.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityScorer {
    metric: Metric,
    match_threshold: f32,
    reject_threshold: f32,
}

impl SimilarityScorer {
    pub const fn new(metric: Metric, match_threshold: f32, reject_threshold: f32) -> Self {
        Self {
            metric,
            match_threshold,
            reject_threshold,
        }
    }

    pub fn from_options(options: &VerificationOptions) -> Self {
        Self::new(
            options.metric,
            options.match_threshold,
            options.reject_threshold,
        )
    }

    pub const fn metric(&self) -> Metric {
        self.metric
    }

    /// Score an observed descriptor against a template descriptor.
    pub fn score(&self, a: &[f32], b: &[f32]) -> Result<MatchResult, ScoreError> {
        let distance = distance(self.metric, a, b)?;
        let similarity = Metric::similarity_from_distance(distance);
        let decision = self.decide(similarity);
        Ok(MatchResult {
            distance,
            similarity,
            is_match: decision == MatchDecision::Match,
            decision,
        })
    }

    /// Place a similarity into the match / inconclusive / reject bands.
    ///
    /// Both edges are inclusive: a similarity exactly at `match_threshold`
    /// matches and one exactly at `reject_threshold` rejects. Under the
    /// Euclidean preset that means a distance of exactly 0.55 is a match.
    pub fn decide(&self, similarity: f32) -> MatchDecision {
        if similarity >= self.match_threshold {
            MatchDecision::Match
        } else if similarity <= self.reject_threshold {
            MatchDecision::Reject
        } else {
            MatchDecision::Inconclusive
        }
    }
}

/// Check that a descriptor can be scored under the given metric.
pub fn validate_descriptor(metric: Metric, values: &[f32]) -> Result<(), ScoreError> {
    if values.is_empty() {
        return Err(ScoreError::Empty);
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(ScoreError::NonFinite);
    }
    if metric == Metric::Cosine && squared_norm(values) <= 0.0 {
        return Err(ScoreError::ZeroNorm);
    }
    Ok(())
}

/// Metric-native distance between two descriptors of equal length.
pub fn distance(metric: Metric, a: &[f32], b: &[f32]) -> Result<f32, ScoreError> {
    if a.len() != b.len() {
        return Err(ScoreError::LengthMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    validate_descriptor(metric, a)?;
    validate_descriptor(metric, b)?;

    let d = match metric {
        Metric::Distance => a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
        Metric::Cosine => {
            let na = squared_norm(a).sqrt();
            let nb = squared_norm(b).sqrt();
            a.iter()
                .zip(b.iter())
                .map(|(x, y)| {
                    let diff = x / na - y / nb;
                    diff * diff
                })
                .sum::<f32>()
                / 2.0
        }
    };
    Ok(d)
}

fn squared_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum()
}
