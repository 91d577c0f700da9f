//! The verification state machine.
//!
//! ```text
//! Idle → Scanning ⇄ CandidateDetected → Verified
//!                                     ↘ Failed → Idle (retry)
//!                                              ↘ LockedOut → FallbackOffered
//! any → Cancelled
//! ```
//!
//! One session is driven by one logical frame pipeline: callers feed it
//! observations through [`VerificationSession::submit_frame`], one at a time,
//! and read [`VerificationSession::outcome`]. It performs no I/O; terminal
//! outcomes are queued as [`AuditRecord`]s for the host to persist.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::liveness::LivenessDetector;
use crate::options::{ConfigError, Purpose, VerificationOptions};
use crate::policy::{AttemptPolicy, LockStatus, PolicyDecision};
use crate::ports::{AuditOutcome, AuditRecord};
use crate::sampler::FrameSampler;
use crate::scorer::{self, ScoreError, SimilarityScorer};
use crate::types::{EnrolledTemplate, FaceObservation, MatchDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Scanning,
    CandidateDetected,
    Verified,
    Failed,
    LockedOut,
    FallbackOffered,
    Cancelled,
}

impl SessionState {
    /// Frames are being consumed.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Scanning | SessionState::CandidateDetected)
    }

    /// No further transition except teardown.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Verified | SessionState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ConfidentRejection,
    Timeout,
    IncompatibleDescriptor,
    LockedOut,
    FallbackRejected,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::ConfidentRejection => "confident_rejection",
            FailureReason::Timeout => "timeout",
            FailureReason::IncompatibleDescriptor => "incompatible_descriptor",
            FailureReason::LockedOut => "locked_out",
            FailureReason::FallbackRejected => "fallback_rejected",
        }
    }

    /// Only these consume one of the subject's attempts.
    pub fn counts_as_attempt(&self) -> bool {
        matches!(self, FailureReason::ConfidentRejection | FailureReason::Timeout)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Biometric,
    Fallback,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("no enrolled template for subject '{0}'")]
    NoEnrollment(String),
    #[error("incompatible descriptor: {0}")]
    IncompatibleDescriptor(#[from] ScoreError),
    #[error("subject is locked out; retry in {}s", .0.as_secs())]
    AlreadyLockedOut(Duration),
    #[error("template belongs to '{template}' but the session is for '{session}'")]
    SubjectMismatch { template: String, session: String },
    #[error("invalid options: {0}")]
    InvalidOptions(#[from] ConfigError),
    #[error("operation not allowed in state {0:?}")]
    InvalidState(SessionState),
}

/// Caller-facing snapshot of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub subject_id: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<VerificationMethod>,
    /// Similarity that verified the subject.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    /// Best similarity seen during the current attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_similarity: Option<f32>,
    #[serde(rename = "elapsed_ms", serialize_with = "opt_millis")]
    pub elapsed: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub attempts_remaining: u32,
    #[serde(rename = "lockout_remaining_ms", serialize_with = "opt_millis")]
    pub lockout_remaining: Option<Duration>,
    pub blink_count: u32,
    pub required_blinks: u32,
}

fn opt_millis<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        None => s.serialize_none(),
    }
}

#[derive(Debug, Clone, Copy)]
struct Verification {
    similarity: Option<f32>,
    elapsed: Duration,
    method: VerificationMethod,
}

pub struct VerificationSession {
    subject_id: String,
    purpose: Purpose,
    policy: Arc<AttemptPolicy>,
    clock: Arc<dyn Clock>,
    state: SessionState,
    options: VerificationOptions,
    scorer: SimilarityScorer,
    liveness: LivenessDetector,
    sampler: FrameSampler,
    /// Paces descriptor scoring while blinks are still owed; eye state is
    /// fed to the liveness detector on every extracted frame regardless.
    score_gate: FrameSampler,
    template: Option<EnrolledTemplate>,
    started_at: Option<Instant>,
    /// Last sampled frame carried a usable face.
    face_present: bool,
    /// Best confident match since the face was last lost.
    confirmed: Option<f32>,
    best_similarity: Option<f32>,
    verified: Option<Verification>,
    last_failure: Option<FailureReason>,
    pending_audit: Vec<AuditRecord>,
}

impl std::fmt::Debug for VerificationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationSession")
            .field("subject_id", &self.subject_id)
            .field("purpose", &self.purpose)
            .field("state", &self.state)
            .field("blinks", &self.liveness.blink_count())
            .finish_non_exhaustive()
    }
}

impl VerificationSession {
    pub fn new(
        subject_id: impl Into<String>,
        purpose: Purpose,
        policy: Arc<AttemptPolicy>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let options = VerificationOptions::default();
        Self {
            subject_id: subject_id.into(),
            purpose,
            policy,
            clock,
            state: SessionState::Idle,
            scorer: SimilarityScorer::from_options(&options),
            liveness: LivenessDetector::from_options(&options),
            sampler: FrameSampler::new(options.sample_every_n_frames),
            score_gate: FrameSampler::new(options.sample_every_n_frames),
            options,
            template: None,
            started_at: None,
            face_present: false,
            confirmed: None,
            best_similarity: None,
            verified: None,
            last_failure: None,
            pending_audit: Vec::new(),
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn purpose(&self) -> Purpose {
        self.purpose
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn options(&self) -> &VerificationOptions {
        &self.options
    }

    /// Begin (or, after a failure, retry) an attempt.
    ///
    /// Fails fast with [`SessionError::AlreadyLockedOut`] when the subject is
    /// inside a lockout window; the session then moves to `LockedOut` (and on
    /// to `FallbackOffered` when a fallback is enabled).
    pub fn start(
        &mut self,
        template: EnrolledTemplate,
        options: VerificationOptions,
    ) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle
            | SessionState::Failed
            | SessionState::LockedOut
            | SessionState::FallbackOffered => {}
            other => return Err(SessionError::InvalidState(other)),
        }
        options.validate()?;
        if template.subject_id != self.subject_id {
            return Err(SessionError::SubjectMismatch {
                template: template.subject_id,
                session: self.subject_id.clone(),
            });
        }
        if let Err(err) = scorer::validate_descriptor(options.metric, template.descriptor.values()) {
            tracing::error!(subject = %self.subject_id, error = %err, "enrolled template is unusable");
            return Err(err.into());
        }

        self.scorer = SimilarityScorer::from_options(&options);
        self.liveness = LivenessDetector::from_options(&options);
        self.sampler = FrameSampler::new(options.sample_every_n_frames);
        self.score_gate = FrameSampler::new(options.sample_every_n_frames);
        self.options = options;

        if let LockStatus::Locked { remaining } = self.policy.check_lock(&self.subject_id) {
            tracing::info!(
                subject = %self.subject_id,
                remaining_secs = remaining.as_secs(),
                "start refused: subject locked out"
            );
            self.last_failure = Some(FailureReason::LockedOut);
            if self.policy.note_refusal(&self.subject_id) {
                self.push_audit(AuditOutcome::LockedOut, None, Some(FailureReason::LockedOut), None);
            }
            if !matches!(self.state, SessionState::LockedOut | SessionState::FallbackOffered) {
                self.enter_lockout();
            }
            return Err(SessionError::AlreadyLockedOut(remaining));
        }

        if self.state != SessionState::Idle {
            self.transition(SessionState::Idle);
        }
        self.template = Some(template);
        self.started_at = Some(self.clock.now());
        self.face_present = false;
        self.confirmed = None;
        self.best_similarity = None;
        self.verified = None;
        self.last_failure = None;
        self.transition(SessionState::Scanning);
        Ok(())
    }

    /// Whether the next incoming frame should be sent to the extractor.
    /// Counts the frame against the sampling interval.
    pub fn should_sample(&mut self) -> bool {
        if !self.state.is_active() {
            return false;
        }
        let throttled = self.face_present && self.liveness_satisfied();
        self.sampler.should_sample(throttled)
    }

    /// Advance the state machine by one frame. `None` means the extractor
    /// found no face (or failed) on this frame.
    ///
    /// A no-op returning the current state once the session is not scanning.
    pub fn submit_frame(
        &mut self,
        observation: Option<FaceObservation>,
    ) -> Result<SessionState, SessionError> {
        if !self.state.is_active() {
            tracing::trace!(state = ?self.state, "frame ignored: session not scanning");
            return Ok(self.state);
        }
        if self.budget_exhausted() {
            self.fail(FailureReason::Timeout, self.best_similarity);
            return Ok(self.state);
        }

        let floor = self.options.min_detection_confidence;
        let Some(obs) = observation.filter(|o| o.detection_confidence >= floor) else {
            self.face_present = false;
            self.confirmed = None;
            self.liveness.process_frame(None);
            if self.state == SessionState::CandidateDetected {
                self.transition(SessionState::Scanning);
            }
            return Ok(self.state);
        };

        if self.state == SessionState::Scanning {
            self.transition(SessionState::CandidateDetected);
        }
        let continuing = self.face_present;
        self.face_present = true;
        self.liveness.process_frame(obs.eye_state());

        // A new candidate and every frame after the blink challenge are
        // scored; in between only every Nth frame is.
        let throttled = continuing && !self.liveness_satisfied();
        if !self.score_gate.should_sample(throttled) {
            tracing::trace!(
                subject = %self.subject_id,
                blinks = self.liveness.blink_count(),
                "frame used for liveness only"
            );
            return Ok(self.state);
        }

        let scored = match &self.template {
            Some(t) => self.scorer.score(t.descriptor.values(), obs.descriptor.values()),
            None => return Err(SessionError::InvalidState(self.state)),
        };
        let result = match scored {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(
                    subject = %self.subject_id,
                    error = %err,
                    "observation descriptor incompatible with enrolled template; check extractor configuration"
                );
                self.fail(FailureReason::IncompatibleDescriptor, None);
                return Err(err.into());
            }
        };

        let similarity = result.similarity;
        self.best_similarity = Some(self.best_similarity.map_or(similarity, |b| b.max(similarity)));
        tracing::debug!(
            subject = %self.subject_id,
            distance = result.distance,
            similarity,
            decision = ?result.decision,
            blinks = self.liveness.blink_count(),
            "frame scored"
        );

        match result.decision {
            MatchDecision::Reject => {
                self.fail(FailureReason::ConfidentRejection, Some(similarity));
                return Ok(self.state);
            }
            MatchDecision::Match => {
                self.confirmed = Some(self.confirmed.map_or(similarity, |c| c.max(similarity)));
            }
            MatchDecision::Inconclusive => {}
        }

        if let Some(confirmed) = self.confirmed {
            if self.liveness_satisfied() {
                self.verify(Some(confirmed), VerificationMethod::Biometric);
                return Ok(self.state);
            }
        }
        if result.decision == MatchDecision::Inconclusive {
            self.transition(SessionState::Scanning);
        }
        Ok(self.state)
    }

    /// Enforce the session budget when no frame arrives.
    pub fn poll(&mut self) -> SessionState {
        if self.state.is_active() && self.budget_exhausted() {
            self.fail(FailureReason::Timeout, self.best_similarity);
        }
        self.state
    }

    /// Settle a fallback credential check performed by the host.
    pub fn resolve_fallback(&mut self, accepted: bool) -> Result<SessionState, SessionError> {
        if self.state != SessionState::FallbackOffered {
            return Err(SessionError::InvalidState(self.state));
        }
        if accepted {
            self.verify(None, VerificationMethod::Fallback);
            return Ok(self.state);
        }
        self.push_audit(
            AuditOutcome::FallbackRejected,
            None,
            Some(FailureReason::FallbackRejected),
            None,
        );
        let remaining = self.policy.record_fallback_failure(&self.subject_id);
        tracing::info!(subject = %self.subject_id, remaining, "fallback credential rejected");
        if remaining == 0 {
            self.last_failure = Some(FailureReason::FallbackRejected);
            self.transition(SessionState::LockedOut);
        }
        Ok(self.state)
    }

    /// Abort from any state and drop everything the session holds.
    pub fn cancel(&mut self) {
        if self.state == SessionState::Cancelled {
            return;
        }
        if self.state.is_active() {
            let elapsed = self.elapsed();
            self.push_audit(AuditOutcome::Cancelled, self.best_similarity, None, elapsed);
        }
        self.transition(SessionState::Cancelled);
        self.release();
    }

    pub fn outcome(&self) -> Outcome {
        let (attempts_remaining, lockout_remaining) = match self.policy.check_lock(&self.subject_id) {
            LockStatus::Unlocked { attempts_remaining } => (attempts_remaining, None),
            LockStatus::Locked { remaining } => (0, Some(remaining)),
        };
        let elapsed = match self.verified {
            Some(v) => Some(v.elapsed),
            None => self.elapsed(),
        };
        Outcome {
            subject_id: self.subject_id.clone(),
            state: self.state,
            method: self.verified.map(|v| v.method),
            similarity: self.verified.and_then(|v| v.similarity),
            best_similarity: self.best_similarity,
            elapsed,
            reason: if self.state == SessionState::Verified {
                None
            } else {
                self.last_failure
            },
            attempts_remaining,
            lockout_remaining,
            blink_count: self.liveness.blink_count(),
            required_blinks: self.options.required_blink_count,
        }
    }

    /// Descriptor comparisons run since the last `start`.
    pub fn scored_frames(&self) -> u64 {
        self.score_gate.frames_sampled()
    }

    /// Drain audit records queued by terminal outcomes.
    pub fn take_audit_records(&mut self) -> Vec<AuditRecord> {
        std::mem::take(&mut self.pending_audit)
    }

    fn liveness_satisfied(&self) -> bool {
        self.liveness.blink_count() >= self.options.required_blink_count
    }

    fn elapsed(&self) -> Option<Duration> {
        self.started_at
            .map(|s| self.clock.now().saturating_duration_since(s))
    }

    fn budget_exhausted(&self) -> bool {
        self.elapsed()
            .is_some_and(|e| e >= self.options.session_timeout)
    }

    fn verify(&mut self, similarity: Option<f32>, method: VerificationMethod) {
        let elapsed = self.elapsed().unwrap_or_default();
        self.policy.record_success(&self.subject_id);
        self.verified = Some(Verification {
            similarity,
            elapsed,
            method,
        });
        self.last_failure = None;
        self.transition(SessionState::Verified);
        tracing::info!(
            subject = %self.subject_id,
            purpose = self.purpose.as_str(),
            ?method,
            similarity = ?similarity,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "subject verified"
        );
        let outcome = match method {
            VerificationMethod::Biometric => AuditOutcome::Verified,
            VerificationMethod::Fallback => AuditOutcome::FallbackVerified,
        };
        self.push_audit(outcome, similarity, None, Some(elapsed));
        self.release();
    }

    fn fail(&mut self, reason: FailureReason, similarity: Option<f32>) {
        let elapsed = self.elapsed();
        self.transition(SessionState::Failed);
        self.last_failure = Some(reason);
        self.face_present = false;
        self.confirmed = None;
        tracing::info!(subject = %self.subject_id, %reason, similarity = ?similarity, "attempt failed");

        if !reason.counts_as_attempt() {
            self.push_audit(AuditOutcome::Failed, similarity, Some(reason), elapsed);
            return;
        }
        match self.policy.record_failure(&self.subject_id) {
            PolicyDecision::AttemptsRemaining(_) => {
                self.push_audit(AuditOutcome::Failed, similarity, Some(reason), elapsed);
            }
            PolicyDecision::LockedUntil { .. } => {
                self.push_audit(AuditOutcome::LockedOut, similarity, Some(reason), elapsed);
                self.enter_lockout();
            }
        }
    }

    fn enter_lockout(&mut self) {
        self.transition(SessionState::LockedOut);
        if self.options.fallback_enabled && self.policy.fallback_remaining(&self.subject_id) > 0 {
            self.transition(SessionState::FallbackOffered);
        }
    }

    fn release(&mut self) {
        self.template = None;
        self.face_present = false;
        self.confirmed = None;
        self.sampler.reset();
    }

    fn transition(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        tracing::debug!(subject = %self.subject_id, from = ?self.state, to = ?to, "session transition");
        self.state = to;
    }

    fn push_audit(
        &mut self,
        outcome: AuditOutcome,
        similarity: Option<f32>,
        reason: Option<FailureReason>,
        elapsed: Option<Duration>,
    ) {
        let purpose = match outcome {
            AuditOutcome::FallbackVerified | AuditOutcome::FallbackRejected => Purpose::Fallback,
            _ => self.purpose,
        };
        self.pending_audit.push(AuditRecord {
            id: Uuid::new_v4(),
            subject_id: self.subject_id.clone(),
            timestamp: self.clock.wall(),
            purpose,
            outcome,
            similarity,
            reason: reason.map(|r| r.as_str().to_string()),
            elapsed_ms: elapsed.map(|e| u64::try_from(e.as_millis()).unwrap_or(u64::MAX)),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::types::{Descriptor, EyeState};
    use chrono::Utc;

    const DIM: usize = 16;
    const OPEN: EyeState = EyeState::uniform(0.9);
    const CLOSED: EyeState = EyeState::uniform(0.05);

    struct Harness {
        clock: Arc<ManualClock>,
        policy: Arc<AttemptPolicy>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new());
            let policy = Arc::new(AttemptPolicy::from_options(
                &VerificationOptions::default(),
                clock.clone(),
            ));
            Self { clock, policy }
        }

        fn session(&self) -> VerificationSession {
            VerificationSession::new("alice", Purpose::CheckIn, self.policy.clone(), self.clock.clone())
        }

        fn started(&self, options: VerificationOptions) -> VerificationSession {
            let mut s = self.session();
            s.start(template(), options).unwrap();
            s
        }
    }

    fn template() -> EnrolledTemplate {
        EnrolledTemplate {
            subject_id: "alice".into(),
            descriptor: Descriptor::new(vec![0.0; DIM]),
            enrolled_at: Utc::now(),
        }
    }

    /// Observation at Euclidean distance `d` from the template.
    fn obs(d: f32, eyes: EyeState) -> Option<FaceObservation> {
        let mut v = vec![0.0; DIM];
        v[0] = d;
        Some(FaceObservation::new(v, 0.95).with_eyes(eyes))
    }

    fn no_liveness() -> VerificationOptions {
        VerificationOptions::default().with_required_blinks(0)
    }

    #[test]
    fn test_start_enters_scanning() {
        let h = Harness::new();
        let s = h.started(no_liveness());
        assert_eq!(s.state(), SessionState::Scanning);
    }

    #[test]
    fn test_no_face_keeps_scanning() {
        let h = Harness::new();
        let mut s = h.started(no_liveness());
        assert_eq!(s.submit_frame(None).unwrap(), SessionState::Scanning);

        let mut weak = obs(0.1, OPEN).unwrap();
        weak.detection_confidence = 0.5;
        assert_eq!(s.submit_frame(Some(weak)).unwrap(), SessionState::Scanning);
        assert_eq!(h.policy.record("alice"), None);
    }

    #[test]
    fn test_band_scenario() {
        let h = Harness::new();

        let mut s = h.started(no_liveness());
        assert_eq!(s.submit_frame(obs(0.60, OPEN)).unwrap(), SessionState::Scanning);
        assert_eq!(s.submit_frame(obs(0.50, OPEN)).unwrap(), SessionState::Verified);

        let mut s = h.started(no_liveness());
        assert_eq!(s.submit_frame(obs(0.70, OPEN)).unwrap(), SessionState::Failed);
        let outcome = s.outcome();
        assert_eq!(outcome.reason, Some(FailureReason::ConfidentRejection));
        assert_eq!(outcome.attempts_remaining, 2);
    }

    #[test]
    fn test_verified_outcome_reports_similarity_and_elapsed() {
        let h = Harness::new();
        h.policy.record_failure("alice");
        let mut s = h.started(no_liveness());
        h.clock.advance(Duration::from_millis(1500));
        s.submit_frame(obs(0.2, OPEN)).unwrap();

        let outcome = s.outcome();
        assert_eq!(outcome.state, SessionState::Verified);
        assert_eq!(outcome.method, Some(VerificationMethod::Biometric));
        assert!((outcome.similarity.unwrap() - 0.8).abs() < 1e-6);
        assert_eq!(outcome.elapsed, Some(Duration::from_millis(1500)));
        assert_eq!(h.policy.record("alice"), None);
    }

    #[test]
    fn test_liveness_required_before_verify() {
        let h = Harness::new();
        let mut s = h.started(VerificationOptions::default());
        let frames = [OPEN, CLOSED, CLOSED, OPEN, CLOSED, CLOSED];
        for eyes in frames {
            let state = s.submit_frame(obs(0.3, eyes)).unwrap();
            assert_eq!(state, SessionState::CandidateDetected);
        }
        assert_eq!(s.outcome().blink_count, 1);
        assert_eq!(s.submit_frame(obs(0.3, OPEN)).unwrap(), SessionState::Verified);
        assert_eq!(s.outcome().blink_count, 2);
    }

    #[test]
    fn test_blinks_during_inconclusive_frames_complete_after_match() {
        let h = Harness::new();
        let mut s = h.started(VerificationOptions::default());
        s.submit_frame(obs(0.3, OPEN)).unwrap();
        for eyes in [CLOSED, CLOSED, OPEN, CLOSED, CLOSED] {
            s.submit_frame(obs(0.6, eyes)).unwrap();
        }
        // The earlier confident match is still latched: the face never left.
        assert_eq!(s.submit_frame(obs(0.6, OPEN)).unwrap(), SessionState::Verified);
    }

    #[test]
    fn test_face_loss_clears_latched_match() {
        let h = Harness::new();
        let mut s = h.started(VerificationOptions::default());
        s.submit_frame(obs(0.3, OPEN)).unwrap();
        assert_eq!(s.submit_frame(None).unwrap(), SessionState::Scanning);
        for eyes in [CLOSED, CLOSED, OPEN, CLOSED, CLOSED, OPEN] {
            s.submit_frame(obs(0.6, eyes)).unwrap();
        }
        assert_eq!(s.state(), SessionState::Scanning);
        assert_eq!(s.outcome().blink_count, 2);
    }

    #[test]
    fn test_three_rejections_lock_out() {
        let h = Harness::new();
        let mut s = h.session();
        for attempt in 1..=3 {
            s.start(template(), no_liveness()).unwrap();
            s.submit_frame(obs(0.9, OPEN)).unwrap();
            if attempt < 3 {
                assert_eq!(s.state(), SessionState::Failed);
            }
        }
        assert_eq!(s.state(), SessionState::FallbackOffered);
        let outcome = s.outcome();
        assert_eq!(outcome.attempts_remaining, 0);
        assert_eq!(outcome.lockout_remaining, Some(Duration::from_secs(300)));

        let err = s.start(template(), no_liveness()).unwrap_err();
        assert_eq!(err, SessionError::AlreadyLockedOut(Duration::from_secs(300)));
    }

    #[test]
    fn test_lockout_without_fallback_stays_locked() {
        let h = Harness::new();
        let opts = VerificationOptions {
            fallback_enabled: false,
            ..no_liveness()
        };
        let mut s = h.session();
        for _ in 0..3 {
            s.start(template(), opts.clone()).unwrap();
            s.submit_frame(obs(0.9, OPEN)).unwrap();
        }
        assert_eq!(s.state(), SessionState::LockedOut);
        assert!(matches!(
            s.resolve_fallback(true),
            Err(SessionError::InvalidState(SessionState::LockedOut))
        ));
    }

    #[test]
    fn test_start_after_lockout_elapses() {
        let h = Harness::new();
        for _ in 0..3 {
            h.policy.record_failure("alice");
        }
        let mut s = h.session();
        assert!(matches!(
            s.start(template(), no_liveness()),
            Err(SessionError::AlreadyLockedOut(_))
        ));
        assert_eq!(s.state(), SessionState::FallbackOffered);

        h.clock.advance(Duration::from_secs(301));
        s.start(template(), no_liveness()).unwrap();
        assert_eq!(s.state(), SessionState::Scanning);
        assert_eq!(s.outcome().attempts_remaining, 3);
    }

    #[test]
    fn test_fallback_success_clears_lock() {
        let h = Harness::new();
        for _ in 0..3 {
            h.policy.record_failure("alice");
        }
        let mut s = h.session();
        let _ = s.start(template(), no_liveness());
        assert_eq!(s.resolve_fallback(false).unwrap(), SessionState::FallbackOffered);
        assert_eq!(s.resolve_fallback(true).unwrap(), SessionState::Verified);
        assert_eq!(s.outcome().method, Some(VerificationMethod::Fallback));
        let records = s.take_audit_records();
        let last = records.last().unwrap();
        assert_eq!(last.outcome, AuditOutcome::FallbackVerified);
        assert_eq!(last.purpose, Purpose::Fallback);
        assert_eq!(h.policy.check_lock("alice"), LockStatus::Unlocked { attempts_remaining: 3 });
    }

    #[test]
    fn test_fallback_withdrawn_after_repeated_wrong_credentials() {
        let h = Harness::new();
        for _ in 0..3 {
            h.policy.record_failure("alice");
        }
        let mut s = h.session();
        let _ = s.start(template(), no_liveness());
        assert_eq!(s.resolve_fallback(false).unwrap(), SessionState::FallbackOffered);
        assert_eq!(s.resolve_fallback(false).unwrap(), SessionState::FallbackOffered);
        assert_eq!(s.resolve_fallback(false).unwrap(), SessionState::LockedOut);
        assert_eq!(s.outcome().reason, Some(FailureReason::FallbackRejected));

        // The right credential no longer gets a hearing in this window.
        assert_eq!(
            s.resolve_fallback(true),
            Err(SessionError::InvalidState(SessionState::LockedOut))
        );

        // Nor does a fresh session for the same subject.
        let mut again = h.session();
        let _ = again.start(template(), no_liveness());
        assert_eq!(again.state(), SessionState::LockedOut);

        h.clock.advance(Duration::from_secs(301));
        again.start(template(), no_liveness()).unwrap();
        assert_eq!(again.state(), SessionState::Scanning);
    }

    #[test]
    fn test_refused_starts_audit_once_per_lockout() {
        let h = Harness::new();
        for _ in 0..3 {
            h.policy.record_failure("alice");
        }
        let mut s = h.session();
        for _ in 0..50 {
            assert!(s.start(template(), no_liveness()).is_err());
        }
        let records = s.take_audit_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, AuditOutcome::LockedOut);
        assert_eq!(s.outcome().reason, Some(FailureReason::LockedOut));
    }

    #[test]
    fn test_timeout_counts_as_attempt() {
        let h = Harness::new();
        let mut s = h.started(VerificationOptions::default());
        s.submit_frame(obs(0.3, OPEN)).unwrap();
        h.clock.advance(Duration::from_secs(31));
        assert_eq!(s.submit_frame(obs(0.3, OPEN)).unwrap(), SessionState::Failed);
        assert_eq!(s.outcome().reason, Some(FailureReason::Timeout));
        assert_eq!(h.policy.record("alice").unwrap().attempt_count, 1);
    }

    #[test]
    fn test_poll_enforces_budget_without_frames() {
        let h = Harness::new();
        let mut s = h.started(no_liveness());
        h.clock.advance(Duration::from_secs(10));
        assert_eq!(s.poll(), SessionState::Scanning);
        h.clock.advance(Duration::from_secs(20));
        assert_eq!(s.poll(), SessionState::Failed);
    }

    #[test]
    fn test_incompatible_descriptor_is_fatal_but_free() {
        let h = Harness::new();
        let mut s = h.started(no_liveness());
        let oversized = Some(FaceObservation::new(vec![0.0; DIM * 2], 0.95));
        let err = s.submit_frame(oversized).unwrap_err();
        assert!(matches!(
            err,
            SessionError::IncompatibleDescriptor(ScoreError::LengthMismatch { .. })
        ));
        assert_eq!(s.state(), SessionState::Failed);
        assert_eq!(s.outcome().reason, Some(FailureReason::IncompatibleDescriptor));
        assert_eq!(h.policy.record("alice"), None);
    }

    #[test]
    fn test_cancel_from_any_state() {
        let h = Harness::new();

        let mut idle = h.session();
        idle.cancel();
        assert_eq!(idle.state(), SessionState::Cancelled);

        let mut scanning = h.started(no_liveness());
        scanning.cancel();
        assert_eq!(scanning.state(), SessionState::Cancelled);
        assert_eq!(scanning.submit_frame(obs(0.1, OPEN)).unwrap(), SessionState::Cancelled);
        assert!(!scanning.should_sample());

        let mut verified = h.started(no_liveness());
        verified.submit_frame(obs(0.1, OPEN)).unwrap();
        verified.cancel();
        assert_eq!(verified.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_frames_after_terminal_are_noops() {
        let h = Harness::new();
        let mut s = h.started(no_liveness());
        s.submit_frame(obs(0.1, OPEN)).unwrap();
        assert_eq!(s.submit_frame(obs(0.9, OPEN)).unwrap(), SessionState::Verified);
        assert_eq!(h.policy.record("alice"), None);
    }

    #[test]
    fn test_start_rejected_while_scanning_or_terminal() {
        let h = Harness::new();
        let mut s = h.started(no_liveness());
        assert_eq!(
            s.start(template(), no_liveness()),
            Err(SessionError::InvalidState(SessionState::Scanning))
        );
        s.cancel();
        assert_eq!(
            s.start(template(), no_liveness()),
            Err(SessionError::InvalidState(SessionState::Cancelled))
        );
    }

    #[test]
    fn test_subject_mismatch() {
        let h = Harness::new();
        let mut s = h.session();
        let mut t = template();
        t.subject_id = "bob".into();
        assert!(matches!(
            s.start(t, no_liveness()),
            Err(SessionError::SubjectMismatch { .. })
        ));
    }

    #[test]
    fn test_sampling_throttles_once_face_present() {
        let h = Harness::new();
        let mut s = h.started(no_liveness());
        assert!(s.should_sample());
        s.submit_frame(obs(0.6, OPEN)).unwrap();
        let picks: Vec<bool> = (0..5).map(|_| s.should_sample()).collect();
        assert_eq!(picks, vec![false, false, false, false, true]);

        s.submit_frame(None).unwrap();
        assert!(s.should_sample());
    }

    #[test]
    fn test_sampling_stays_dense_during_liveness() {
        let h = Harness::new();
        let mut s = h.started(VerificationOptions::default());
        s.submit_frame(obs(0.3, OPEN)).unwrap();
        assert!((0..5).all(|_| s.should_sample()));
    }

    #[test]
    fn test_scoring_sparse_while_blinks_pending() {
        let h = Harness::new();
        let mut s = h.started(VerificationOptions::default());
        // Eyes stay open for a while before the subject blinks twice.
        let mut frames = vec![OPEN; 12];
        frames.extend([CLOSED, CLOSED, OPEN, CLOSED, CLOSED, OPEN]);
        let total = frames.len() as u64;
        for eyes in frames {
            assert!(s.should_sample());
            s.submit_frame(obs(0.3, eyes)).unwrap();
        }
        assert_eq!(s.state(), SessionState::Verified);
        assert_eq!(s.outcome().blink_count, 2);
        // First frame, every fifth frame after it, and the frame that
        // completed the challenge.
        assert_eq!(s.scored_frames(), 5);
        assert!(s.scored_frames() < total);
    }

    #[test]
    fn test_scoring_dense_once_live() {
        let h = Harness::new();
        let mut s = h.started(no_liveness());
        for _ in 0..4 {
            s.submit_frame(obs(0.6, OPEN)).unwrap();
        }
        assert_eq!(s.scored_frames(), 4);
    }

    #[test]
    fn test_audit_one_record_per_terminal_outcome() {
        let h = Harness::new();
        let mut s = h.session();
        for _ in 0..3 {
            s.start(template(), no_liveness()).unwrap();
            s.submit_frame(obs(0.9, OPEN)).unwrap();
        }
        let records = s.take_audit_records();
        let outcomes: Vec<_> = records.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![AuditOutcome::Failed, AuditOutcome::Failed, AuditOutcome::LockedOut]
        );
        assert!(records.iter().all(|r| r.purpose == Purpose::CheckIn));
        assert_eq!(records[0].reason.as_deref(), Some("confident_rejection"));
        assert!(s.take_audit_records().is_empty());
    }

    #[test]
    fn test_outcome_serializes_millis() {
        let h = Harness::new();
        let mut s = h.started(no_liveness());
        h.clock.advance(Duration::from_millis(250));
        s.submit_frame(obs(0.1, OPEN)).unwrap();
        let json = serde_json::to_value(s.outcome()).unwrap();
        assert_eq!(json["state"], "verified");
        assert_eq!(json["elapsed_ms"], 250);
        assert_eq!(json["method"], "biometric");
    }
}
