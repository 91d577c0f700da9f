use std::collections::HashMap;

use facegate_core::{AuditRecord, VerificationSession};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("subject '{0}' already has an active verification session")]
    SessionActive(String),
    #[error("unknown session '{0}'")]
    UnknownSession(String),
}

/// Open sessions, keyed by session id, at most one live per subject.
///
/// A session that has left the scanning states no longer blocks its
/// subject; starting a new one closes it.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, VerificationSession>,
    by_subject: HashMap<String, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail if the subject already has a scanning session. A finished (or
    /// just timed out) session is closed; its pending audit records are
    /// returned for persistence.
    pub fn ensure_available(&mut self, subject: &str) -> Result<Vec<AuditRecord>, RegistryError> {
        let Some(existing) = self.by_subject.get(subject).cloned() else {
            return Ok(Vec::new());
        };
        if let Some(session) = self.sessions.get_mut(&existing) {
            if session.poll().is_active() {
                return Err(RegistryError::SessionActive(subject.to_string()));
            }
        }
        tracing::debug!(subject, session = %existing, "closing finished session");
        Ok(self
            .remove(&existing)
            .map(|mut s| s.take_audit_records())
            .unwrap_or_default())
    }

    /// Register a session. Returns its id.
    pub fn insert(&mut self, session: VerificationSession) -> Result<String, RegistryError> {
        let subject = session.subject_id().to_string();
        if let Some(existing) = self.by_subject.get(&subject).cloned() {
            if self.sessions.get(&existing).is_some_and(|s| s.state().is_active()) {
                return Err(RegistryError::SessionActive(subject));
            }
            self.remove(&existing);
        }
        let id = Uuid::new_v4().to_string();
        self.by_subject.insert(subject, id.clone());
        self.sessions.insert(id.clone(), session);
        Ok(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut VerificationSession, RegistryError> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownSession(id.to_string()))
    }

    pub fn remove(&mut self, id: &str) -> Option<VerificationSession> {
        let session = self.sessions.remove(id)?;
        if self.by_subject.get(session.subject_id()).map(String::as_str) == Some(id) {
            self.by_subject.remove(session.subject_id());
        }
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions currently consuming frames.
    pub fn active_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state().is_active())
            .count()
    }
}
