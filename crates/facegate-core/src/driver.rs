//! Async pipeline that pulls frames from a [`FrameSource`], runs them
//! through a [`FrameObserver`] and feeds the results to a session.
//!
//! At most one extraction is in flight at a time; frames that arrive while
//! the observer is busy stay with the source, which only ever hands out its
//! freshest frame. Cancellation is cooperative: [`CancelHandle::cancel`]
//! returns once the source has been stopped.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::enroll::{EnrollError, EnrollmentCapture};
use crate::ports::{AuditSink, BoxError, FrameObserver, FrameSource, TemplateStore};
use crate::session::{Outcome, SessionError, VerificationSession};
use crate::types::{EnrolledTemplate, FaceObservation};

/// Pause between polls when the source has no frame ready.
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Enroll(#[from] EnrollError),
    #[error("template store: {0}")]
    Store(BoxError),
}

/// Handle for cancelling a running driver from another task.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: mpsc::Sender<oneshot::Sender<()>>,
}

impl CancelHandle {
    /// Request cancellation and wait until the driver has released the
    /// source. Returns false if the driver had already finished.
    pub async fn cancel(&self) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(ack_tx).await.is_err() {
            return false;
        }
        ack_rx.await.is_ok()
    }
}

enum Step {
    Continue,
    Cancelled(Option<oneshot::Sender<()>>),
}

pub struct SessionDriver<S, O> {
    source: S,
    observer: O,
    cancel_rx: mpsc::Receiver<oneshot::Sender<()>>,
    idle_backoff: Duration,
}

impl<S, O> SessionDriver<S, O>
where
    S: FrameSource,
    O: FrameObserver<S::Frame>,
{
    pub fn new(source: S, observer: O) -> (Self, CancelHandle) {
        let (tx, cancel_rx) = mpsc::channel(1);
        let driver = Self {
            source,
            observer,
            cancel_rx,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
        };
        (driver, CancelHandle { tx })
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Drive a started session until it leaves the scanning states, then
    /// stop the source and forward queued audit records.
    pub async fn run(
        mut self,
        session: &mut VerificationSession,
        audit: &dyn AuditSink,
    ) -> Result<Outcome, DriverError> {
        let result = self.drive(session, audit).await;
        self.source.stop().await;
        forward_audit(session, audit).await;
        result.map(|()| session.outcome())
    }

    async fn drive(
        &mut self,
        session: &mut VerificationSession,
        audit: &dyn AuditSink,
    ) -> Result<(), DriverError> {
        while session.state().is_active() {
            let step = tokio::select! {
                biased;
                Some(ack) = self.cancel_rx.recv() => Step::Cancelled(Some(ack)),
                res = verify_step(&mut self.source, &mut self.observer, session, self.idle_backoff) => {
                    res?;
                    Step::Continue
                }
            };
            if let Step::Cancelled(ack) = step {
                tracing::info!(subject = session.subject_id(), "verification cancelled");
                session.cancel();
                self.source.stop().await;
                forward_audit(session, audit).await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                return Ok(());
            }
            forward_audit(session, audit).await;
        }
        Ok(())
    }

    /// Drive an enrollment capture to completion and return the template.
    pub async fn run_enrollment(
        mut self,
        mut capture: EnrollmentCapture,
    ) -> Result<EnrolledTemplate, DriverError> {
        let result = self.drive_enrollment(&mut capture).await;
        self.source.stop().await;
        result?;
        Ok(capture.finish()?)
    }

    async fn drive_enrollment(&mut self, capture: &mut EnrollmentCapture) -> Result<(), DriverError> {
        while !capture.state().is_finished() {
            let step = tokio::select! {
                biased;
                Some(ack) = self.cancel_rx.recv() => Step::Cancelled(Some(ack)),
                res = enroll_step(&mut self.source, &mut self.observer, capture, self.idle_backoff) => {
                    res?;
                    Step::Continue
                }
            };
            if let Step::Cancelled(ack) = step {
                capture.cancel();
                self.source.stop().await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
        }
        Ok(())
    }
}

async fn verify_step<S, O>(
    source: &mut S,
    observer: &mut O,
    session: &mut VerificationSession,
    idle_backoff: Duration,
) -> Result<(), DriverError>
where
    S: FrameSource,
    O: FrameObserver<S::Frame>,
{
    let Some(frame) = source.next_frame().await else {
        session.poll();
        idle(idle_backoff).await;
        return Ok(());
    };
    if !session.should_sample() {
        session.poll();
        return Ok(());
    }
    let observation = observe(observer, &frame, session.subject_id()).await;
    session.submit_frame(observation)?;
    Ok(())
}

async fn enroll_step<S, O>(
    source: &mut S,
    observer: &mut O,
    capture: &mut EnrollmentCapture,
    idle_backoff: Duration,
) -> Result<(), DriverError>
where
    S: FrameSource,
    O: FrameObserver<S::Frame>,
{
    let Some(frame) = source.next_frame().await else {
        capture.poll();
        idle(idle_backoff).await;
        return Ok(());
    };
    let observation = observe(observer, &frame, capture.subject_id()).await;
    capture.submit_frame(observation)?;
    Ok(())
}

async fn idle(backoff: Duration) {
    if backoff.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(backoff).await;
    }
}

async fn observe<F, O>(observer: &mut O, frame: &F, subject: &str) -> Option<FaceObservation>
where
    F: Send + Sync,
    O: FrameObserver<F>,
{
    match observer.observe(frame).await {
        Ok(observation) => observation,
        Err(err) => {
            tracing::warn!(subject, error = %err, "extraction failed, treating frame as no face");
            None
        }
    }
}

async fn forward_audit(session: &mut VerificationSession, audit: &dyn AuditSink) {
    for record in session.take_audit_records() {
        if let Err(err) = audit.record(record).await {
            tracing::warn!(subject = session.subject_id(), error = %err, "failed to persist audit record");
        }
    }
}

/// Fetch the subject's active template, mapping absence to `NoEnrollment`.
pub async fn load_template(
    store: &dyn TemplateStore,
    subject_id: &str,
) -> Result<EnrolledTemplate, DriverError> {
    match store.active_template(subject_id).await {
        Ok(Some(template)) => Ok(template),
        Ok(None) => Err(SessionError::NoEnrollment(subject_id.to_string()).into()),
        Err(err) => Err(DriverError::Store(err)),
    }
}
