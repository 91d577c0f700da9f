//! Contracts for the collaborators the engine consumes or produces to.
//!
//! Camera access, descriptor extraction, template persistence, audit
//! persistence and the fallback credential check all live outside the
//! engine. Hosts implement these traits and inject them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::options::Purpose;
use crate::types::{EnrolledTemplate, FaceObservation};

/// Boxed error for collaborator failures the engine only reports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The observer failed on a frame. Treated as "no observation".
#[derive(Error, Debug)]
#[error("extraction failed: {0}")]
pub struct ExtractionError(pub String);

/// Pull-based frame source. The engine decides the cadence.
#[async_trait]
pub trait FrameSource: Send {
    type Frame: Send + Sync;

    /// The freshest frame, or `None` if no frame is ready.
    async fn next_frame(&mut self) -> Option<Self::Frame>;

    /// Release the device. Must be idempotent.
    async fn stop(&mut self);
}

/// External landmark/descriptor extractor. May be slow; the engine never
/// has more than one call in flight.
#[async_trait]
pub trait FrameObserver<F: Send + Sync>: Send {
    async fn observe(&mut self, frame: &F) -> Result<Option<FaceObservation>, ExtractionError>;
}

/// Read access to enrolled templates.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn active_template(&self, subject_id: &str) -> Result<Option<EnrolledTemplate>, BoxError>;
}

/// Sink for one record per terminal outcome.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), BoxError>;
}

/// Opaque fallback credential check, used only once a fallback is offered.
#[async_trait]
pub trait FallbackVerifier: Send + Sync {
    async fn verify_fallback(&self, subject_id: &str, credential: &str) -> Result<bool, BoxError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Verified,
    Failed,
    LockedOut,
    Cancelled,
    FallbackVerified,
    FallbackRejected,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Verified => "verified",
            AuditOutcome::Failed => "failed",
            AuditOutcome::LockedOut => "locked_out",
            AuditOutcome::Cancelled => "cancelled",
            AuditOutcome::FallbackVerified => "fallback_verified",
            AuditOutcome::FallbackRejected => "fallback_rejected",
        }
    }
}

impl std::str::FromStr for AuditOutcome {
    type Err = UnknownOutcome;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "verified" => Ok(AuditOutcome::Verified),
            "failed" => Ok(AuditOutcome::Failed),
            "locked_out" => Ok(AuditOutcome::LockedOut),
            "cancelled" => Ok(AuditOutcome::Cancelled),
            "fallback_verified" => Ok(AuditOutcome::FallbackVerified),
            "fallback_rejected" => Ok(AuditOutcome::FallbackRejected),
            other => Err(UnknownOutcome(other.to_string())),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("unknown audit outcome: {0}")]
pub struct UnknownOutcome(pub String);

/// One audit entry, handed to the host for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
    pub purpose: Purpose,
    pub outcome: AuditOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

/// Audit sink that only logs. Useful when no persistent log is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), BoxError> {
        tracing::info!(
            subject = %record.subject_id,
            purpose = record.purpose.as_str(),
            outcome = record.outcome.as_str(),
            similarity = ?record.similarity,
            reason = ?record.reason,
            elapsed_ms = ?record.elapsed_ms,
            "audit"
        );
        Ok(())
    }
}
