//! Offline replay of recorded extractor output.
//!
//! An observation file is JSON Lines: one `FaceObservation` object per
//! frame, or `null` for a frame where the extractor found no face. Each
//! line is one frame at a fixed frame interval on a manual clock, so a
//! replay is deterministic regardless of how fast it runs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use facegate_core::{
    AttemptPolicy, Clock, EnrolledTemplate, EnrollmentCapture, ExtractionError, FaceObservation,
    FrameObserver, FrameSource, ManualClock, Outcome, Purpose, SessionDriver, TracingAuditSink,
    VerificationOptions, VerificationSession,
};

/// 30 fps.
pub const DEFAULT_FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Read an observation file, dropping blank lines and `#` comments.
pub fn read_observations(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(parse_lines(&text))
}

fn parse_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Decode one line. `null` means no face.
pub fn decode_line(line: &str) -> Result<Option<FaceObservation>, ExtractionError> {
    serde_json::from_str(line).map_err(|e| ExtractionError(e.to_string()))
}

/// Frames from a recorded file. Every pull advances the clock by one frame
/// interval, including pulls past the end, so a session with nothing left
/// to read still runs into its timeout.
pub struct RecordedSource {
    lines: std::vec::IntoIter<String>,
    clock: Arc<ManualClock>,
    frame_interval: Duration,
    stopped: bool,
}

impl RecordedSource {
    pub fn new(lines: Vec<String>, clock: Arc<ManualClock>) -> Self {
        Self {
            lines: lines.into_iter(),
            clock,
            frame_interval: DEFAULT_FRAME_INTERVAL,
            stopped: false,
        }
    }
}

#[async_trait]
impl FrameSource for RecordedSource {
    type Frame = String;

    async fn next_frame(&mut self) -> Option<String> {
        self.clock.advance(self.frame_interval);
        if self.stopped {
            return None;
        }
        self.lines.next()
    }

    async fn stop(&mut self) {
        self.stopped = true;
    }
}

/// The "extractor" for recorded frames: the frame already is its output.
pub struct RecordedObserver;

#[async_trait]
impl FrameObserver<String> for RecordedObserver {
    async fn observe(&mut self, frame: &String) -> Result<Option<FaceObservation>, ExtractionError> {
        decode_line(frame)
    }
}

/// Run one verification attempt over recorded frames.
pub async fn verify(
    lines: Vec<String>,
    template: EnrolledTemplate,
    purpose: Purpose,
    options: VerificationOptions,
) -> Result<Outcome> {
    let clock = Arc::new(ManualClock::new());
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let policy = Arc::new(AttemptPolicy::from_options(&options, dyn_clock.clone()));

    let mut session = VerificationSession::new(template.subject_id.clone(), purpose, policy, dyn_clock);
    session.start(template, options)?;

    let (driver, _cancel) = SessionDriver::new(RecordedSource::new(lines, clock), RecordedObserver);
    let outcome = driver
        .with_idle_backoff(Duration::ZERO)
        .run(&mut session, &TracingAuditSink)
        .await?;
    Ok(outcome)
}

/// Build a template from recorded frames the way a live enrollment would.
pub async fn capture(
    lines: Vec<String>,
    subject: &str,
    options: VerificationOptions,
    min_frames: u32,
) -> Result<EnrolledTemplate> {
    let clock = Arc::new(ManualClock::new());
    let capture = EnrollmentCapture::new(subject, options, clock.clone()).with_min_frames(min_frames);
    let (driver, _cancel) = SessionDriver::new(RecordedSource::new(lines, clock), RecordedObserver);
    let template = driver
        .with_idle_backoff(Duration::ZERO)
        .run_enrollment(capture)
        .await?;
    Ok(template)
}
