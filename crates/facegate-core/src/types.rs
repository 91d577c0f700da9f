use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eye;

/// A landmark point. `z` is zero for 2D landmark models.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

impl Point3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Distance in the image plane, ignoring depth.
    pub fn planar_distance(&self, other: &Point3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Fixed-length face descriptor produced by the external extractor
/// (128 values for the dlib/face-api family, 512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor(pub Vec<f32>);

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<f32>> for Descriptor {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

/// The enrolled reference descriptor for a subject. Read-only to the
/// verification path; re-enrollment replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledTemplate {
    pub subject_id: String,
    pub descriptor: Descriptor,
    pub enrolled_at: DateTime<Utc>,
}

/// Per-eye openness in [0, 1], 1.0 fully open.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EyeState {
    pub left_openness: f32,
    pub right_openness: f32,
}

impl EyeState {
    pub const fn new(left_openness: f32, right_openness: f32) -> Self {
        Self {
            left_openness,
            right_openness,
        }
    }

    /// Both eyes at the same openness.
    pub const fn uniform(openness: f32) -> Self {
        Self::new(openness, openness)
    }

    pub fn mean_openness(&self) -> f32 {
        (self.left_openness + self.right_openness) / 2.0
    }
}

/// One frame's worth of extractor output. Ephemeral: owned by the
/// processing step that scores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceObservation {
    pub descriptor: Descriptor,
    #[serde(default)]
    pub landmarks: Vec<Point3>,
    pub detection_confidence: f32,
    /// Eye openness reported directly by the extractor (e.g. blendshape
    /// scores). Takes precedence over landmark geometry when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eyes: Option<EyeState>,
    #[serde(default = "Utc::now")]
    pub captured_at: DateTime<Utc>,
}

impl FaceObservation {
    pub fn new(descriptor: impl Into<Descriptor>, detection_confidence: f32) -> Self {
        Self {
            descriptor: descriptor.into(),
            landmarks: Vec::new(),
            detection_confidence,
            eyes: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_eyes(mut self, eyes: EyeState) -> Self {
        self.eyes = Some(eyes);
        self
    }

    pub fn with_landmarks(mut self, landmarks: Vec<Point3>) -> Self {
        self.landmarks = landmarks;
        self
    }

    /// Eye state for the liveness challenge, if the frame carries one.
    pub fn eye_state(&self) -> Option<EyeState> {
        self.eyes.or_else(|| eye::eye_state_from_landmarks(&self.landmarks))
    }
}

/// Three-way outcome of comparing an observation against a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchDecision {
    Match,
    /// Between the bands: keep sampling.
    Inconclusive,
    Reject,
}

/// Result of scoring one descriptor pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Metric-native distance (Euclidean distance, or cosine distance).
    pub distance: f32,
    /// Normalized similarity in [0, 1], 1.0 identical.
    pub similarity: f32,
    pub is_match: bool,
    pub decision: MatchDecision,
}
