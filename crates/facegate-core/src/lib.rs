//! facegate-core — Face verification engine.
//!
//! Scores externally extracted face descriptors against an enrolled
//! template, runs a blink-based liveness challenge and enforces a
//! per-subject attempt lockout, all behind a frame-driven session state
//! machine. Camera capture and descriptor extraction are collaborators the
//! host injects through the traits in [`ports`].

pub mod clock;
pub mod driver;
pub mod enroll;
pub mod eye;
pub mod liveness;
pub mod options;
pub mod policy;
pub mod ports;
pub mod sampler;
pub mod scorer;
pub mod session;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use driver::{load_template, CancelHandle, DriverError, SessionDriver};
pub use enroll::{EnrollError, EnrollmentCapture, EnrollmentState};
pub use liveness::{BlinkState, LivenessDetector};
pub use options::{ConfigError, Metric, Purpose, VerificationOptions};
pub use policy::{AttemptPolicy, AttemptRecord, LockStatus, PolicyDecision};
pub use ports::{
    AuditOutcome, AuditRecord, AuditSink, BoxError, ExtractionError, FallbackVerifier,
    FrameObserver, FrameSource, TemplateStore, TracingAuditSink, UnknownOutcome,
};
pub use sampler::FrameSampler;
pub use scorer::{ScoreError, SimilarityScorer};
pub use session::{
    FailureReason, Outcome, SessionError, SessionState, VerificationMethod, VerificationSession,
};
pub use types::{Descriptor, EnrolledTemplate, EyeState, FaceObservation, MatchDecision, MatchResult, Point3};
