use std::sync::Arc;

use facegate_core::{
    load_template, scorer, AttemptPolicy, AuditSink, Clock, Descriptor, EnrolledTemplate,
    FaceObservation, Outcome, Purpose, SessionError, VerificationSession,
};
use tokio::sync::Mutex;
use zbus::interface;

use crate::config::Config;
use crate::fallback::PinVerifier;
use crate::sessions::{RegistryError, SessionRegistry};
use crate::store::FacegateStore;

pub const BUS_NAME: &str = "org.facegate.Verifier1";
pub const OBJECT_PATH: &str = "/org/facegate/Verifier1";

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub store: FacegateStore,
    pub pins: PinVerifier,
    pub policy: Arc<AttemptPolicy>,
    pub clock: Arc<dyn Clock>,
    pub sessions: SessionRegistry,
}

/// D-Bus interface for the facegate verification daemon.
///
/// Bus name: org.facegate.Verifier1
/// Object path: /org/facegate/Verifier1
///
/// Clients own the camera and the extractor: they open a session, ask
/// `ShouldSample` per frame, and push the extractor's output through
/// `SubmitObservation` until the returned outcome leaves the scanning states.
pub struct FacegateService {
    pub state: Arc<Mutex<AppState>>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

fn invalid_args(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::InvalidArgs(e.to_string())
}

fn registry_error(e: RegistryError) -> zbus::fdo::Error {
    match e {
        RegistryError::UnknownSession(_) => invalid_args(e),
        RegistryError::SessionActive(_) => failed(e),
    }
}

fn outcome_json(outcome: &Outcome) -> zbus::fdo::Result<String> {
    serde_json::to_string(outcome).map_err(failed)
}

/// UID of the D-Bus peer behind a unique bus name.
async fn get_caller_uid(sender: &str, conn: &zbus::Connection) -> zbus::fdo::Result<u32> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn).await.map_err(failed)?;
    let bus_name = zbus::names::BusName::try_from(sender).map_err(failed)?;
    dbus_proxy.get_connection_unix_user(bus_name).await.map_err(failed)
}

/// UID for a local account name in passwd(5) format.
fn uid_in_passwd(contents: &str, name: &str) -> Option<u32> {
    contents.lines().find_map(|line| {
        let mut fields = line.split(':');
        if fields.next()? != name {
            return None;
        }
        fields.nth(1)?.parse().ok()
    })
}

fn uid_for_name(name: &str) -> Option<u32> {
    let contents = std::fs::read_to_string("/etc/passwd").ok()?;
    uid_in_passwd(&contents, name)
}

/// Root may act for anyone; any other caller only for the account whose
/// name is the subject id. Subjects without a local account are root-only.
fn check_caller(subject: &str, caller_uid: u32, subject_uid: Option<u32>) -> zbus::fdo::Result<()> {
    if caller_uid == 0 || subject_uid == Some(caller_uid) {
        return Ok(());
    }
    tracing::warn!(subject, caller_uid, ?subject_uid, "caller is not the subject");
    Err(zbus::fdo::Error::AccessDenied(format!(
        "caller is not permitted to act for subject '{subject}'"
    )))
}

/// Persist whatever terminal outcomes the session has queued.
async fn flush_audit(store: &FacegateStore, session: &mut VerificationSession) {
    for record in session.take_audit_records() {
        if let Err(e) = store.record(record).await {
            tracing::error!(error = %e, "audit: store write failed");
        }
    }
}

impl FacegateService {
    /// Check the calling peer against `subject`. Skipped on the session bus.
    async fn authorize(
        &self,
        subject: &str,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        // Read the flag without holding the lock across the UID lookup
        if self.state.lock().await.config.session_bus {
            return Ok(());
        }
        let sender = header
            .sender()
            .ok_or_else(|| failed("no sender in message"))?;
        let caller_uid = get_caller_uid(sender.as_str(), conn).await?;
        check_caller(subject, caller_uid, uid_for_name(subject))
    }

    async fn enroll_template(&self, subject: &str, descriptor_json: &str) -> zbus::fdo::Result<String> {
        tracing::info!(subject, "enroll requested");
        let descriptor: Descriptor = serde_json::from_str(descriptor_json).map_err(invalid_args)?;

        let state = self.state.lock().await;
        scorer::validate_descriptor(state.config.metric(), descriptor.values()).map_err(invalid_args)?;
        let template = EnrolledTemplate {
            subject_id: subject.to_string(),
            descriptor,
            enrolled_at: state.clock.wall(),
        };
        let id = state.store.enroll(&template).await.map_err(|e| {
            tracing::error!(error = %e, "enroll: store insert failed");
            invalid_args(e)
        })?;
        tracing::info!(subject, template_id = %id, "enrolled successfully");
        Ok(id)
    }

    async fn remove_subject_templates(&self, subject: &str) -> zbus::fdo::Result<u32> {
        tracing::info!(subject, "remove_templates requested");
        let state = self.state.lock().await;
        let removed = state.store.remove_templates(subject).await.map_err(failed)?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    async fn open_session(&self, subject: &str, purpose: &str) -> zbus::fdo::Result<String> {
        let purpose: Purpose = purpose.parse().map_err(invalid_args)?;
        tracing::info!(subject, purpose = purpose.as_str(), "start_session requested");

        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let closed = state.sessions.ensure_available(subject).map_err(registry_error)?;
        for record in closed {
            if let Err(e) = state.store.record(record).await {
                tracing::error!(error = %e, "audit: store write failed");
            }
        }

        let template = load_template(&state.store, subject).await.map_err(|e| {
            tracing::warn!(subject, error = %e, "start_session: no usable template");
            failed(e)
        })?;

        let mut session =
            VerificationSession::new(subject, purpose, state.policy.clone(), state.clock.clone());
        let started = session.start(template, state.config.options_for(purpose));
        flush_audit(&state.store, &mut session).await;
        match started {
            Ok(()) => {}
            Err(SessionError::AlreadyLockedOut(remaining)) => {
                tracing::warn!(subject, remaining_secs = remaining.as_secs(), "start_session: locked out");
            }
            Err(e) => return Err(failed(e)),
        }

        let outcome = session.outcome();
        let session_id = state.sessions.insert(session).map_err(registry_error)?;
        serde_json::to_string(&serde_json::json!({
            "session_id": session_id,
            "outcome": outcome,
        }))
        .map_err(failed)
    }

    async fn store_pin(&self, subject: &str, pin: &str) -> zbus::fdo::Result<()> {
        tracing::info!(subject, "set_pin requested");
        let state = self.state.lock().await;
        state.pins.set_pin(subject, pin).await.map_err(invalid_args)
    }
}

/// Subject-scoped methods (`Enroll`, `RemoveTemplates`, `StartSession`,
/// `SetPin`) are limited to root and the subject's own account on the
/// system bus.
#[interface(name = "org.facegate.Verifier1")]
impl FacegateService {
    /// Store a descriptor (JSON array) as the subject's active template,
    /// replacing any previous one. Returns the template id.
    async fn enroll(
        &self,
        subject: &str,
        descriptor_json: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize(subject, &header, conn).await?;
        self.enroll_template(subject, descriptor_json).await
    }

    /// Delete every template for the subject. Returns the number removed.
    async fn remove_templates(
        &self,
        subject: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<u32> {
        self.authorize(subject, &header, conn).await?;
        self.remove_subject_templates(subject).await
    }

    /// Template metadata for the subject as JSON.
    async fn list_templates(&self, subject: &str) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let templates = state.store.list_templates(subject).await.map_err(failed)?;
        serde_json::to_string(&templates).map_err(failed)
    }

    /// Open a verification session for `purpose` (`check_in`, `check_out`,
    /// `login`, ...). Returns `{"session_id", "outcome"}` as JSON.
    ///
    /// A locked-out subject still gets a session, parked in `locked_out`
    /// or `fallback_offered`, so the client can take the fallback path.
    async fn start_session(
        &self,
        subject: &str,
        purpose: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.authorize(subject, &header, conn).await?;
        self.open_session(subject, purpose).await
    }

    /// Whether the client should run the extractor on its next frame.
    async fn should_sample(&self, session_id: &str) -> zbus::fdo::Result<bool> {
        let mut state = self.state.lock().await;
        let session = state.sessions.get_mut(session_id).map_err(registry_error)?;
        Ok(session.should_sample())
    }

    /// Feed one extractor result. `null` (or an empty string) means no face.
    /// Returns the session outcome as JSON.
    async fn submit_observation(
        &self,
        session_id: &str,
        observation_json: &str,
    ) -> zbus::fdo::Result<String> {
        let observation: Option<FaceObservation> = if observation_json.trim().is_empty() {
            None
        } else {
            serde_json::from_str(observation_json).map_err(invalid_args)?
        };

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let session = state.sessions.get_mut(session_id).map_err(registry_error)?;
        let result = session.submit_frame(observation);
        flush_audit(&state.store, session).await;
        result.map_err(failed)?;
        outcome_json(&session.outcome())
    }

    /// Current outcome. Also enforces the session budget when the client
    /// has stopped sending frames.
    async fn outcome(&self, session_id: &str) -> zbus::fdo::Result<String> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let session = state.sessions.get_mut(session_id).map_err(registry_error)?;
        session.poll();
        flush_audit(&state.store, session).await;
        outcome_json(&session.outcome())
    }

    async fn cancel_session(&self, session_id: &str) -> zbus::fdo::Result<String> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let session = state.sessions.get_mut(session_id).map_err(registry_error)?;
        session.cancel();
        flush_audit(&state.store, session).await;
        tracing::info!(session_id, "session cancelled");
        outcome_json(&session.outcome())
    }

    /// Check a fallback PIN for a session in `fallback_offered`.
    async fn submit_fallback(&self, session_id: &str, pin: &str) -> zbus::fdo::Result<String> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let session = state.sessions.get_mut(session_id).map_err(registry_error)?;
        if !session.options().fallback_enabled {
            return Err(zbus::fdo::Error::NotSupported("fallback disabled".into()));
        }
        let accepted = state
            .pins
            .verify(session.subject_id(), pin)
            .await
            .map_err(failed)?;
        let result = session.resolve_fallback(accepted);
        flush_audit(&state.store, session).await;
        result.map_err(failed)?;
        outcome_json(&session.outcome())
    }

    /// Drop a session, cancelling it first if it is still scanning.
    async fn close_session(&self, session_id: &str) -> zbus::fdo::Result<bool> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(mut session) = state.sessions.remove(session_id) else {
            return Ok(false);
        };
        session.cancel();
        flush_audit(&state.store, &mut session).await;
        Ok(true)
    }

    async fn set_pin(
        &self,
        subject: &str,
        pin: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<()> {
        self.authorize(subject, &header, conn).await?;
        self.store_pin(subject, pin).await
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let enrolled = state.store.count_enrolled().await.unwrap_or(0);
        let options = &state.config.verification;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "metric": options.metric,
            "match_threshold": options.match_threshold,
            "reject_threshold": options.reject_threshold,
            "required_blink_count": options.required_blink_count,
            "max_attempts": options.max_attempts,
            "lockout_secs": options.lockout_duration.as_secs(),
            "descriptor_dim": state.store.dimension(),
            "subjects_enrolled": enrolled,
            "sessions_open": state.sessions.len(),
            "sessions_active": state.sessions.active_count(),
            "session_bus": state.config.session_bus,
        })
        .to_string())
    }

    /// Most recent audit records as JSON. An empty subject means all.
    async fn recent_audit(&self, subject: &str, limit: u32) -> zbus::fdo::Result<String> {
        let state = self.state.lock().await;
        let subject = (!subject.is_empty()).then_some(subject);
        let records = state
            .store
            .recent_audit(subject, limit.clamp(1, 1000))
            .await
            .map_err(failed)?;
        serde_json::to_string(&records).map_err(failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::ManualClock;
    use std::path::Path;

    async fn service() -> (FacegateService, Arc<ManualClock>) {
        let mut config = Config::from_lookup(|_| None);
        config.descriptor_dim = 4;
        let store = FacegateStore::open(Path::new(":memory:"), 4).await.unwrap();
        let clock = Arc::new(ManualClock::new());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let state = AppState {
            policy: Arc::new(AttemptPolicy::from_options(&config.verification, dyn_clock.clone())),
            pins: PinVerifier::new(store.clone()),
            store,
            config,
            clock: dyn_clock,
            sessions: SessionRegistry::new(),
        };
        (
            FacegateService {
                state: Arc::new(Mutex::new(state)),
            },
            clock,
        )
    }

    fn observation(d: f32) -> String {
        let obs = FaceObservation::new(vec![d, 0.0, 0.0, 0.0], 0.95)
            .with_eyes(facegate_core::EyeState::uniform(0.9));
        serde_json::to_string(&obs).unwrap()
    }

    async fn start(svc: &FacegateService, purpose: &str) -> (String, serde_json::Value) {
        let reply: serde_json::Value =
            serde_json::from_str(&svc.open_session("alice", purpose).await.unwrap()).unwrap();
        (reply["session_id"].as_str().unwrap().to_string(), reply["outcome"].clone())
    }

    #[tokio::test]
    async fn test_check_out_without_liveness_verifies() {
        let (svc, _) = service().await;
        svc.state.lock().await.config.liveness_exempt.insert(Purpose::CheckOut);
        svc.enroll_template("alice", "[0.0, 0.0, 0.0, 0.0]").await.unwrap();

        let (id, outcome) = start(&svc, "check_out").await;
        assert_eq!(outcome["state"], "scanning");
        assert!(svc.should_sample(&id).await.unwrap());

        let reply: serde_json::Value =
            serde_json::from_str(&svc.submit_observation(&id, &observation(0.1)).await.unwrap()).unwrap();
        assert_eq!(reply["state"], "verified");

        let audit: Vec<serde_json::Value> =
            serde_json::from_str(&svc.recent_audit("alice", 10).await.unwrap()).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0]["outcome"], "verified");
        assert_eq!(audit[0]["purpose"], "check_out");
    }

    #[tokio::test]
    async fn test_second_session_refused_while_scanning() {
        let (svc, _) = service().await;
        svc.enroll_template("alice", "[0.0, 0.0, 0.0, 0.0]").await.unwrap();
        start(&svc, "check_in").await;
        assert!(svc.open_session("alice", "check_in").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_subject_and_purpose() {
        let (svc, _) = service().await;
        assert!(svc.open_session("nobody", "check_in").await.is_err());
        assert!(matches!(
            svc.open_session("alice", "lunch").await,
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
    }

    #[tokio::test]
    async fn test_lockout_then_pin_fallback() {
        let (svc, _) = service().await;
        svc.enroll_template("alice", "[0.0, 0.0, 0.0, 0.0]").await.unwrap();
        svc.store_pin("alice", "4821").await.unwrap();

        let mut last = serde_json::Value::Null;
        for _ in 0..3 {
            let (id, _) = start(&svc, "login").await;
            last = serde_json::from_str(&svc.submit_observation(&id, &observation(0.9)).await.unwrap())
                .unwrap();
        }
        assert_eq!(last["state"], "fallback_offered");

        let (id, outcome) = start(&svc, "login").await;
        assert_eq!(outcome["state"], "fallback_offered");
        assert_eq!(outcome["attempts_remaining"], 0);

        let wrong: serde_json::Value =
            serde_json::from_str(&svc.submit_fallback(&id, "0000").await.unwrap()).unwrap();
        assert_eq!(wrong["state"], "fallback_offered");
        let right: serde_json::Value =
            serde_json::from_str(&svc.submit_fallback(&id, "4821").await.unwrap()).unwrap();
        assert_eq!(right["state"], "verified");
        assert_eq!(right["method"], "fallback");
        assert_eq!(right["attempts_remaining"], 3);
    }

    #[tokio::test]
    async fn test_wrong_pins_withdraw_fallback() {
        let (svc, _) = service().await;
        svc.enroll_template("alice", "[0.0, 0.0, 0.0, 0.0]").await.unwrap();
        svc.store_pin("alice", "4821").await.unwrap();
        for _ in 0..3 {
            let (id, _) = start(&svc, "login").await;
            svc.submit_observation(&id, &observation(0.9)).await.unwrap();
        }

        let (id, _) = start(&svc, "login").await;
        let mut last = serde_json::Value::Null;
        for guess in ["0000", "1111", "2222"] {
            last = serde_json::from_str(&svc.submit_fallback(&id, guess).await.unwrap()).unwrap();
        }
        assert_eq!(last["state"], "locked_out");
        assert_eq!(last["reason"], "fallback_rejected");
        assert!(matches!(
            svc.submit_fallback(&id, "4821").await,
            Err(zbus::fdo::Error::Failed(_))
        ));

        // Reopening the session does not restore the fallback.
        svc.close_session(&id).await.unwrap();
        let (_, outcome) = start(&svc, "login").await;
        assert_eq!(outcome["state"], "locked_out");
    }

    #[test]
    fn test_uid_in_passwd() {
        let passwd = "root:x:0:0:root:/root:/bin/bash\n\
                      alice:x:1000:1000:Alice:/home/alice:/bin/bash\n\
                      broken:x\n";
        assert_eq!(uid_in_passwd(passwd, "root"), Some(0));
        assert_eq!(uid_in_passwd(passwd, "alice"), Some(1000));
        assert_eq!(uid_in_passwd(passwd, "broken"), None);
        assert_eq!(uid_in_passwd(passwd, "bob"), None);
        assert_eq!(uid_in_passwd(passwd, "ali"), None);
    }

    #[test]
    fn test_check_caller() {
        assert!(check_caller("alice", 0, Some(1000)).is_ok());
        assert!(check_caller("kiosk-42", 0, None).is_ok());
        assert!(check_caller("alice", 1000, Some(1000)).is_ok());
        assert!(matches!(
            check_caller("alice", 1001, Some(1000)),
            Err(zbus::fdo::Error::AccessDenied(_))
        ));
        assert!(matches!(
            check_caller("kiosk-42", 1001, None),
            Err(zbus::fdo::Error::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_session_times_out_on_outcome_poll() {
        let (svc, clock) = service().await;
        svc.enroll_template("alice", "[0.0, 0.0, 0.0, 0.0]").await.unwrap();
        let (id, _) = start(&svc, "check_in").await;

        clock.advance(std::time::Duration::from_secs(31));
        let reply: serde_json::Value = serde_json::from_str(&svc.outcome(&id).await.unwrap()).unwrap();
        assert_eq!(reply["state"], "failed");
        assert_eq!(reply["reason"], "timeout");
    }

    #[tokio::test]
    async fn test_cancel_and_close() {
        let (svc, _) = service().await;
        svc.enroll_template("alice", "[0.0, 0.0, 0.0, 0.0]").await.unwrap();
        let (id, _) = start(&svc, "check_in").await;

        let reply: serde_json::Value =
            serde_json::from_str(&svc.cancel_session(&id).await.unwrap()).unwrap();
        assert_eq!(reply["state"], "cancelled");
        assert!(svc.close_session(&id).await.unwrap());
        assert!(!svc.close_session(&id).await.unwrap());
        assert!(matches!(
            svc.should_sample(&id).await,
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
        let state = svc.state.lock().await;
        assert_eq!(state.sessions.len(), 0);
    }

    #[tokio::test]
    async fn test_enroll_rejects_wrong_dimension() {
        let (svc, _) = service().await;
        assert!(matches!(
            svc.enroll_template("alice", "[0.0, 0.0]").await,
            Err(zbus::fdo::Error::InvalidArgs(_))
        ));
    }
}
