//! Enrollment capture.
//!
//! Collects observations of a subject, keeps the highest-confidence one and
//! runs the same blink challenge as verification before producing a
//! template. The face must stay in view: losing it restarts the capture.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;

use crate::clock::Clock;
use crate::liveness::LivenessDetector;
use crate::options::VerificationOptions;
use crate::scorer::{self, ScoreError};
use crate::types::{EnrolledTemplate, FaceObservation};

/// Faces required before a capture may complete.
pub const DEFAULT_MIN_FRAMES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentState {
    /// Waiting for a usable face.
    Capturing,
    /// Face in view; waiting for blinks or more frames.
    BlinkChallenge,
    Complete,
    TimedOut,
    Cancelled,
}

impl EnrollmentState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            EnrollmentState::Complete | EnrollmentState::TimedOut | EnrollmentState::Cancelled
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollError {
    #[error("unusable descriptor: {0}")]
    InvalidDescriptor(#[from] ScoreError),
    #[error("enrollment timed out before a live face was captured")]
    TimedOut,
    #[error("enrollment cancelled")]
    Cancelled,
    #[error("enrollment not finished (state {0:?})")]
    Incomplete(EnrollmentState),
}

pub struct EnrollmentCapture {
    subject_id: String,
    options: VerificationOptions,
    clock: Arc<dyn Clock>,
    liveness: LivenessDetector,
    state: EnrollmentState,
    min_frames: u32,
    faces_seen: u32,
    best: Option<FaceObservation>,
    started_at: Instant,
}

impl std::fmt::Debug for EnrollmentCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentCapture")
            .field("subject_id", &self.subject_id)
            .field("state", &self.state)
            .field("faces_seen", &self.faces_seen)
            .finish_non_exhaustive()
    }
}

impl EnrollmentCapture {
    pub fn new(
        subject_id: impl Into<String>,
        options: VerificationOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let started_at = clock.now();
        Self {
            subject_id: subject_id.into(),
            liveness: LivenessDetector::from_options(&options),
            options,
            clock,
            state: EnrollmentState::Capturing,
            min_frames: DEFAULT_MIN_FRAMES,
            faces_seen: 0,
            best: None,
            started_at,
        }
    }

    pub fn with_min_frames(mut self, frames: u32) -> Self {
        self.min_frames = frames.max(1);
        self
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn state(&self) -> EnrollmentState {
        self.state
    }

    pub fn blink_count(&self) -> u32 {
        self.liveness.blink_count()
    }

    /// Confidence of the best face kept so far.
    pub fn best_confidence(&self) -> Option<f32> {
        self.best.as_ref().map(|o| o.detection_confidence)
    }

    pub fn submit_frame(
        &mut self,
        observation: Option<FaceObservation>,
    ) -> Result<EnrollmentState, EnrollError> {
        if self.state.is_finished() {
            return Ok(self.state);
        }
        if self.clock.now().saturating_duration_since(self.started_at) >= self.options.session_timeout {
            tracing::info!(subject = %self.subject_id, faces = self.faces_seen, "enroll: timed out");
            self.state = EnrollmentState::TimedOut;
            self.best = None;
            return Ok(self.state);
        }

        let floor = self.options.min_detection_confidence;
        let Some(obs) = observation.filter(|o| o.detection_confidence >= floor) else {
            if self.faces_seen > 0 {
                tracing::debug!(subject = %self.subject_id, "enroll: face lost, restarting capture");
            }
            self.restart();
            return Ok(self.state);
        };

        scorer::validate_descriptor(self.options.metric, obs.descriptor.values())?;
        if let Some(best) = &self.best {
            if best.descriptor.len() != obs.descriptor.len() {
                return Err(ScoreError::LengthMismatch {
                    expected: best.descriptor.len(),
                    actual: obs.descriptor.len(),
                }
                .into());
            }
        }

        self.faces_seen += 1;
        self.liveness.process_frame(obs.eye_state());
        if self.best_confidence().map_or(true, |c| obs.detection_confidence > c) {
            self.best = Some(obs);
        }

        let live = self.liveness.blink_count() >= self.options.required_blink_count;
        self.state = if live && self.faces_seen >= self.min_frames {
            tracing::info!(
                subject = %self.subject_id,
                faces = self.faces_seen,
                confidence = ?self.best_confidence(),
                "enroll: best face selected"
            );
            EnrollmentState::Complete
        } else {
            EnrollmentState::BlinkChallenge
        };
        Ok(self.state)
    }

    /// Whether the capture has run out of time. For hosts that poll without frames.
    pub fn poll(&mut self) -> EnrollmentState {
        if !self.state.is_finished()
            && self.clock.now().saturating_duration_since(self.started_at) >= self.options.session_timeout
        {
            self.state = EnrollmentState::TimedOut;
            self.best = None;
        }
        self.state
    }

    pub fn cancel(&mut self) {
        if !self.state.is_finished() {
            self.state = EnrollmentState::Cancelled;
            self.best = None;
        }
    }

    /// Consume the capture and produce the template.
    pub fn finish(self) -> Result<EnrolledTemplate, EnrollError> {
        match (self.state, self.best) {
            (EnrollmentState::Complete, Some(best)) => Ok(EnrolledTemplate {
                subject_id: self.subject_id,
                descriptor: best.descriptor,
                enrolled_at: self.clock.wall(),
            }),
            (EnrollmentState::TimedOut, _) => Err(EnrollError::TimedOut),
            (EnrollmentState::Cancelled, _) => Err(EnrollError::Cancelled),
            (state, _) => Err(EnrollError::Incomplete(state)),
        }
    }

    fn restart(&mut self) {
        self.state = EnrollmentState::Capturing;
        self.faces_seen = 0;
        self.best = None;
        self.liveness.reset();
    }
}
