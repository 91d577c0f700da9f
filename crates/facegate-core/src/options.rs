use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Descriptor comparison metric. The two descriptor families in use are
/// calibrated differently, so the metric is chosen per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Euclidean distance over raw descriptors (dlib / face-api family).
    #[default]
    Distance,
    /// Cosine similarity over L2-normalized descriptors (ArcFace family).
    Cosine,
}

impl Metric {
    /// Convert a metric-native distance into the normalized similarity.
    pub fn similarity_from_distance(distance: f32) -> f32 {
        (1.0 - distance).clamp(0.0, 1.0)
    }
}

/// The call site a verification runs for. Liveness policy is decided per
/// call site rather than globally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    CheckIn,
    CheckOut,
    #[default]
    Login,
    Enrollment,
    Fallback,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::CheckIn => "check_in",
            Purpose::CheckOut => "check_out",
            Purpose::Login => "login",
            Purpose::Enrollment => "enrollment",
            Purpose::Fallback => "fallback",
        }
    }
}

impl std::str::FromStr for Purpose {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check_in" => Ok(Purpose::CheckIn),
            "check_out" => Ok(Purpose::CheckOut),
            "login" => Ok(Purpose::Login),
            "enrollment" => Ok(Purpose::Enrollment),
            "fallback" => Ok(Purpose::Fallback),
            other => Err(ConfigError::UnknownPurpose(other.to_string())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("match threshold {match_threshold} must be above reject threshold {reject_threshold}")]
    InvertedBands {
        match_threshold: f32,
        reject_threshold: f32,
    },
    #[error("{name} must be within [0, 1], got {value}")]
    OutOfUnitRange { name: &'static str, value: f32 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("unknown purpose: {0}")]
    UnknownPurpose(String),
}

/// Tunables for one verification session.
///
/// Thresholds are expressed in normalized similarity, whichever metric is
/// selected. Use [`VerificationOptions::with_distance_bands`] to configure
/// them as Euclidean distances instead.
///
/// When deserialized, keys that are left out take the preset of the
/// selected `metric`, so a file that only switches to cosine gets the
/// cosine bands rather than the Euclidean ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PartialOptions")]
pub struct VerificationOptions {
    pub metric: Metric,
    /// Similarity at or above which a frame is a confident match.
    pub match_threshold: f32,
    /// Similarity at or below which a frame is a confident rejection.
    pub reject_threshold: f32,
    /// Blinks required before a match is accepted. Zero disables liveness.
    pub required_blink_count: u32,
    /// Mean eye openness below which a frame counts as eyes-closed.
    pub closed_threshold: f32,
    /// Consecutive closed frames needed before a reopening counts as a blink.
    pub min_closed_frames: u32,
    pub max_attempts: u32,
    #[serde(serialize_with = "secs::serialize")]
    pub lockout_duration: Duration,
    #[serde(serialize_with = "secs::serialize")]
    pub session_timeout: Duration,
    /// Once a face is continuously present and liveness needs no more
    /// samples, extract only every Nth frame.
    pub sample_every_n_frames: u32,
    pub min_detection_confidence: f32,
    /// Whether a fallback credential path is available on lockout.
    pub fallback_enabled: bool,
    /// Wrong fallback credentials tolerated per lockout window before the
    /// fallback is withdrawn.
    pub max_fallback_attempts: u32,
}

/// Wire shape of [`VerificationOptions`]: every key optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialOptions {
    metric: Option<Metric>,
    match_threshold: Option<f32>,
    reject_threshold: Option<f32>,
    required_blink_count: Option<u32>,
    closed_threshold: Option<f32>,
    min_closed_frames: Option<u32>,
    max_attempts: Option<u32>,
    lockout_duration: Option<u64>,
    session_timeout: Option<u64>,
    sample_every_n_frames: Option<u32>,
    min_detection_confidence: Option<f32>,
    fallback_enabled: Option<bool>,
    max_fallback_attempts: Option<u32>,
}

impl From<PartialOptions> for VerificationOptions {
    fn from(p: PartialOptions) -> Self {
        let preset = match p.metric.unwrap_or_default() {
            Metric::Distance => Self::euclidean(),
            Metric::Cosine => Self::cosine(),
        };
        Self {
            metric: preset.metric,
            match_threshold: p.match_threshold.unwrap_or(preset.match_threshold),
            reject_threshold: p.reject_threshold.unwrap_or(preset.reject_threshold),
            required_blink_count: p.required_blink_count.unwrap_or(preset.required_blink_count),
            closed_threshold: p.closed_threshold.unwrap_or(preset.closed_threshold),
            min_closed_frames: p.min_closed_frames.unwrap_or(preset.min_closed_frames),
            max_attempts: p.max_attempts.unwrap_or(preset.max_attempts),
            lockout_duration: p
                .lockout_duration
                .map_or(preset.lockout_duration, Duration::from_secs),
            session_timeout: p
                .session_timeout
                .map_or(preset.session_timeout, Duration::from_secs),
            sample_every_n_frames: p.sample_every_n_frames.unwrap_or(preset.sample_every_n_frames),
            min_detection_confidence: p
                .min_detection_confidence
                .unwrap_or(preset.min_detection_confidence),
            fallback_enabled: p.fallback_enabled.unwrap_or(preset.fallback_enabled),
            max_fallback_attempts: p.max_fallback_attempts.unwrap_or(preset.max_fallback_attempts),
        }
    }
}

impl Default for VerificationOptions {
    fn default() -> Self {
        Self::euclidean()
    }
}

impl VerificationOptions {
    /// Defaults for Euclidean-distance descriptors: match below distance
    /// 0.55, reject above 0.65.
    pub fn euclidean() -> Self {
        Self {
            metric: Metric::Distance,
            match_threshold: Metric::similarity_from_distance(0.55),
            reject_threshold: Metric::similarity_from_distance(0.65),
            required_blink_count: 2,
            closed_threshold: 0.3,
            min_closed_frames: 2,
            max_attempts: 3,
            lockout_duration: Duration::from_secs(5 * 60),
            session_timeout: Duration::from_secs(30),
            sample_every_n_frames: 5,
            min_detection_confidence: 0.70,
            fallback_enabled: true,
            max_fallback_attempts: crate::policy::DEFAULT_MAX_FALLBACK_ATTEMPTS,
        }
    }

    /// Defaults for cosine-calibrated descriptors: match at cosine 0.40.
    pub fn cosine() -> Self {
        Self {
            metric: Metric::Cosine,
            match_threshold: 0.40,
            reject_threshold: 0.25,
            ..Self::euclidean()
        }
    }

    /// Set the decision bands as Euclidean distances.
    pub fn with_distance_bands(mut self, match_below: f32, reject_above: f32) -> Self {
        self.match_threshold = Metric::similarity_from_distance(match_below);
        self.reject_threshold = Metric::similarity_from_distance(reject_above);
        self
    }

    pub fn with_required_blinks(mut self, count: u32) -> Self {
        self.required_blink_count = count;
        self
    }

    pub fn requires_liveness(&self) -> bool {
        self.required_blink_count > 0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("match_threshold", self.match_threshold),
            ("reject_threshold", self.reject_threshold),
            ("closed_threshold", self.closed_threshold),
            ("min_detection_confidence", self.min_detection_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfUnitRange { name, value });
            }
        }
        if self.match_threshold <= self.reject_threshold {
            return Err(ConfigError::InvertedBands {
                match_threshold: self.match_threshold,
                reject_threshold: self.reject_threshold,
            });
        }
        if self.sample_every_n_frames == 0 {
            return Err(ConfigError::Zero("sample_every_n_frames"));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("max_attempts"));
        }
        if self.min_closed_frames == 0 {
            return Err(ConfigError::Zero("min_closed_frames"));
        }
        if self.session_timeout.is_zero() {
            return Err(ConfigError::Zero("session_timeout"));
        }
        Ok(())
    }
}

/// Durations as whole seconds in config files.
mod secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}
