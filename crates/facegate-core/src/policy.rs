use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::options::VerificationOptions;

pub const DEFAULT_MAX_FALLBACK_ATTEMPTS: u32 = 3;

/// Per-subject failure bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub subject_id: String,
    pub attempt_count: u32,
    pub locked_until: Option<Instant>,
    /// Wrong fallback credentials during the current lockout window.
    pub fallback_failures: u32,
    /// A refused start has been reported for the current lockout window.
    pub refusal_reported: bool,
}

impl AttemptRecord {
    fn new(subject_id: &str) -> Self {
        Self {
            subject_id: subject_id.to_string(),
            attempt_count: 0,
            locked_until: None,
            fallback_failures: 0,
            refusal_reported: false,
        }
    }
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    AttemptsRemaining(u32),
    LockedUntil { until: Instant, remaining: Duration },
}

/// Whether a subject may attempt verification right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Unlocked { attempts_remaining: u32 },
    Locked { remaining: Duration },
}

/// Per-subject attempt limiter shared by every session in the process.
///
/// After `max_attempts` failed verifications the subject is locked out for
/// `lockout` from the failure that crossed the limit. Expiry is evaluated
/// lazily on the next read; there is no background timer. Only confident
/// rejections and timeouts are recorded here; frames without a usable face
/// never are.
///
/// The fallback credential path has its own budget inside each lockout
/// window: after `max_fallback_attempts` wrong credentials the fallback is
/// withdrawn until the window elapses.
#[derive(Debug)]
pub struct AttemptPolicy {
    max_attempts: u32,
    max_fallback_attempts: u32,
    lockout: Duration,
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<String, AttemptRecord>>,
}

impl AttemptPolicy {
    pub fn new(max_attempts: u32, lockout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            max_fallback_attempts: DEFAULT_MAX_FALLBACK_ATTEMPTS,
            lockout,
            clock,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_options(options: &VerificationOptions, clock: Arc<dyn Clock>) -> Self {
        Self::new(options.max_attempts, options.lockout_duration, clock)
            .with_max_fallback_attempts(options.max_fallback_attempts)
    }

    pub fn with_max_fallback_attempts(mut self, attempts: u32) -> Self {
        self.max_fallback_attempts = attempts;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn lockout_duration(&self) -> Duration {
        self.lockout
    }

    /// Report whether the subject is locked, resetting an elapsed lockout.
    pub fn check_lock(&self, subject: &str) -> LockStatus {
        let now = self.clock.now();
        let mut records = self.records();
        let Some(record) = records.get_mut(subject) else {
            return LockStatus::Unlocked {
                attempts_remaining: self.max_attempts,
            };
        };
        self.expire(record, now);
        match record.locked_until {
            Some(until) => LockStatus::Locked {
                remaining: until.saturating_duration_since(now),
            },
            None => LockStatus::Unlocked {
                attempts_remaining: self.max_attempts.saturating_sub(record.attempt_count),
            },
        }
    }

    /// Record a failed attempt. Opens the lockout window when the count
    /// reaches `max_attempts`. The check and increment happen under one lock.
    pub fn record_failure(&self, subject: &str) -> PolicyDecision {
        let now = self.clock.now();
        let mut records = self.records();
        let record = records
            .entry(subject.to_string())
            .or_insert_with(|| AttemptRecord::new(subject));
        self.expire(record, now);

        if let Some(until) = record.locked_until {
            // Already locked: the window is not extended.
            return PolicyDecision::LockedUntil {
                until,
                remaining: until.saturating_duration_since(now),
            };
        }

        record.attempt_count += 1;
        if record.attempt_count >= self.max_attempts {
            let until = now + self.lockout;
            record.locked_until = Some(until);
            record.fallback_failures = 0;
            record.refusal_reported = false;
            tracing::warn!(
                subject,
                failures = record.attempt_count,
                lockout_secs = self.lockout.as_secs(),
                "attempt limit reached, locking subject"
            );
            PolicyDecision::LockedUntil {
                until,
                remaining: self.lockout,
            }
        } else {
            tracing::debug!(
                subject,
                failures = record.attempt_count,
                max = self.max_attempts,
                "verification failed, incrementing attempt counter"
            );
            PolicyDecision::AttemptsRemaining(self.max_attempts - record.attempt_count)
        }
    }

    /// Record a successful verification (biometric or fallback). Clears the
    /// counter and any open lockout window.
    pub fn record_success(&self, subject: &str) {
        if self.records().remove(subject).is_some() {
            tracing::debug!(subject, "attempt counter reset");
        }
    }

    /// Wrong fallback credentials still tolerated in the current lockout
    /// window. Zero when the subject is not locked.
    pub fn fallback_remaining(&self, subject: &str) -> u32 {
        let now = self.clock.now();
        let mut records = self.records();
        let Some(record) = records.get_mut(subject) else {
            return 0;
        };
        self.expire(record, now);
        if record.locked_until.is_none() {
            return 0;
        }
        self.max_fallback_attempts.saturating_sub(record.fallback_failures)
    }

    /// Record a rejected fallback credential. Returns how many more are
    /// tolerated in this lockout window.
    pub fn record_fallback_failure(&self, subject: &str) -> u32 {
        let now = self.clock.now();
        let mut records = self.records();
        let record = records
            .entry(subject.to_string())
            .or_insert_with(|| AttemptRecord::new(subject));
        self.expire(record, now);
        record.fallback_failures = record.fallback_failures.saturating_add(1);
        let remaining = self.max_fallback_attempts.saturating_sub(record.fallback_failures);
        if remaining == 0 {
            tracing::warn!(
                subject,
                failures = record.fallback_failures,
                "fallback attempts exhausted, withdrawing fallback until lockout ends"
            );
        }
        remaining
    }

    /// Mark a start refused by an open lockout. True only for the first
    /// refusal in each window.
    pub fn note_refusal(&self, subject: &str) -> bool {
        let now = self.clock.now();
        let mut records = self.records();
        let Some(record) = records.get_mut(subject) else {
            return false;
        };
        self.expire(record, now);
        if record.locked_until.is_none() || record.refusal_reported {
            return false;
        }
        record.refusal_reported = true;
        true
    }

    /// Snapshot of a subject's record, after lazy expiry.
    pub fn record(&self, subject: &str) -> Option<AttemptRecord> {
        let now = self.clock.now();
        let mut records = self.records();
        let record = records.get_mut(subject)?;
        self.expire(record, now);
        Some(record.clone())
    }

    fn expire(&self, record: &mut AttemptRecord, now: Instant) {
        if let Some(until) = record.locked_until {
            if now >= until {
                tracing::debug!(subject = %record.subject_id, "lockout window elapsed");
                record.attempt_count = 0;
                record.locked_until = None;
                record.fallback_failures = 0;
                record.refusal_reported = false;
            }
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, AttemptRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
