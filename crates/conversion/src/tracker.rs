//! Conversion progress tracker.
//!
//! [`ConversionTracker`] runs one [`TrackingSession`] per job id on top of
//! the shared [`ConnectionManager`]. It connects on demand, subscribes
//! the session's handler to the job topic, and moves a session to a new
//! job id when the backend assigns one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bitzomax_bus::{BusError, ConnectionManager, Delivery, MessageHandler, SubscriptionRegistry};
use bitzomax_core::error::CoreError;
use bitzomax_core::ids::validate_job_id;

use crate::session::{SessionState, TrackingCallbacks, TrackingSession};

/// Message reported when the bus cannot be reached before subscribing.
pub const CONNECT_FAILED_MESSAGE: &str = "Failed to connect to message bus";

type SessionMap = Mutex<HashMap<String, Arc<TrackingSession>>>;

/// Errors from tracker operations that return a `Result`.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("No tracking session for job {0}")]
    UnknownJob(String),

    #[error("Invalid job id: {0}")]
    InvalidJobId(#[from] CoreError),

    #[error("Tracking session for job {0} has already finished")]
    SessionFinished(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

fn lock_sessions(sessions: &SessionMap) -> MutexGuard<'_, HashMap<String, Arc<TrackingSession>>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether `session` is tracking under a subscription the registry still
/// holds. A global disconnect drops the subscription but not the session.
fn is_live(session: &TrackingSession) -> bool {
    session.state() == SessionState::Tracking
        && session.subscription().is_some_and(|h| h.is_live())
}

/// Remove `session` from the map if it is still the entry for its job id.
fn forget(sessions: &SessionMap, session: &Arc<TrackingSession>) {
    let job_id = session.job_id();
    let mut map = lock_sessions(sessions);
    if map.get(&job_id).is_some_and(|s| Arc::ptr_eq(s, session)) {
        map.remove(&job_id);
    }
}

/// Tracks conversion jobs over the shared message bus connection.
///
/// Cheap to clone; clones share the same sessions.
#[derive(Clone)]
pub struct ConversionTracker {
    manager: Arc<ConnectionManager>,
    sessions: Arc<SessionMap>,
    /// Sessions waiting for the bus connection.
    connecting: Arc<Mutex<Vec<Arc<TrackingSession>>>>,
}

impl ConversionTracker {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            manager,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            connecting: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    fn registry(&self) -> &Arc<SubscriptionRegistry> {
        self.manager.registry()
    }

    /// Start tracking `job_id`.
    ///
    /// Never fails: problems are reported through `on_error` and an inert
    /// handle is returned. Connects first when the bus is not connected.
    /// A session already tracking the same id is cancelled and replaced.
    /// [`cancel_all`](Self::cancel_all) also cancels sessions still waiting
    /// for the connection; those end without subscribing.
    pub async fn track(&self, job_id: &str, callbacks: TrackingCallbacks) -> TrackingHandle {
        let session = TrackingSession::new(job_id, callbacks);
        let handle = self.handle_for(&session);

        if let Err(e) = validate_job_id(job_id) {
            let message = match e {
                CoreError::Validation(message) => message,
                other => other.to_string(),
            };
            tracing::warn!(job_id, error = %message, "Refusing to track job");
            session.fail(&message);
            return handle;
        }

        session.transition(SessionState::Connecting);
        if !self.manager.is_connected() {
            self.lock_connecting().push(Arc::clone(&session));
            let connected = self.manager.connect(None).await;
            self.lock_connecting().retain(|s| !Arc::ptr_eq(s, &session));
            if !connected {
                tracing::warn!(job_id, "Cannot track job, message bus unavailable");
                session.fail(CONNECT_FAILED_MESSAGE);
                return handle;
            }
        }

        // Tracking before subscribing, so the first message is not dropped.
        if !session.transition(SessionState::Tracking) {
            tracing::debug!(job_id, "Tracking cancelled while connecting");
            return handle;
        }

        let mut sessions = lock_sessions(&self.sessions);
        sessions.retain(|_, s| is_live(s));
        let subscribed = self
            .registry()
            .subscribe(job_id, self.handler_for(&session));
        match subscribed {
            Ok(subscription) => {
                session.attach(subscription);
                if let Some(previous) = sessions.insert(job_id.to_string(), Arc::clone(&session)) {
                    if previous.transition(SessionState::Cancelled) {
                        tracing::debug!(job_id, "Replaced existing tracking session");
                    }
                }
                drop(sessions);
                tracing::info!(job_id, "Tracking conversion progress");
            }
            Err(e) => {
                drop(sessions);
                tracing::warn!(job_id, error = %e, "Subscription failed");
                session.fail(&format!("Failed to subscribe to conversion updates: {e}"));
            }
        }
        handle
    }

    /// Move the session tracking `old_job_id` to `new_job_id`.
    ///
    /// The old subscription is inert before the new one is installed, so a
    /// stale publish on the old topic is never delivered. Callbacks and the
    /// progress floor carry over. Switching to the same id is a no-op.
    pub fn switch_identifier(&self, old_job_id: &str, new_job_id: &str) -> Result<(), TrackerError> {
        validate_job_id(new_job_id)?;
        if old_job_id == new_job_id {
            return Ok(());
        }

        let mut sessions = lock_sessions(&self.sessions);
        let session = sessions
            .get(old_job_id)
            .cloned()
            .ok_or_else(|| TrackerError::UnknownJob(old_job_id.to_string()))?;
        if session.state().is_terminal() {
            sessions.remove(old_job_id);
            return Err(TrackerError::SessionFinished(old_job_id.to_string()));
        }

        let subscription = match self.registry().switch(old_job_id, new_job_id) {
            Ok(subscription) => subscription,
            Err(BusError::NotSubscribed(_)) => {
                // Subscription dropped by a global disconnect; resubscribe
                // under the new id if the link is up.
                self.registry()
                    .subscribe(new_job_id, self.handler_for(&session))?
            }
            Err(e) => return Err(e.into()),
        };

        sessions.remove(old_job_id);
        session.attach(subscription);
        if let Some(previous) = sessions.insert(new_job_id.to_string(), Arc::clone(&session)) {
            previous.transition(SessionState::Cancelled);
        }
        drop(sessions);

        tracing::info!(old_job_id, new_job_id, "Switched tracked job id");
        Ok(())
    }

    /// Whether a live session is tracking `job_id`.
    pub fn is_tracking(&self, job_id: &str) -> bool {
        lock_sessions(&self.sessions)
            .get(job_id)
            .is_some_and(|s| is_live(s))
    }

    /// Job ids with a live session, sorted.
    pub fn active_jobs(&self) -> Vec<String> {
        let mut jobs: Vec<String> = lock_sessions(&self.sessions)
            .iter()
            .filter(|(_, s)| is_live(s))
            .map(|(id, _)| id.clone())
            .collect();
        jobs.sort();
        jobs
    }

    /// Cancel every session and drop their subscriptions, including
    /// sessions still waiting for the connection.
    pub fn cancel_all(&self) {
        let mut sessions: Vec<Arc<TrackingSession>> =
            lock_sessions(&self.sessions).drain().map(|(_, s)| s).collect();
        sessions.append(&mut self.lock_connecting());
        for session in sessions {
            cancel_session(self.registry(), &session);
        }
    }

    /// Cancel every session, then close the shared connection.
    pub fn disconnect(&self) {
        self.cancel_all();
        self.manager.disconnect();
    }

    // ---- private helpers ----

    fn lock_connecting(&self) -> MutexGuard<'_, Vec<Arc<TrackingSession>>> {
        self.connecting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_for(&self, session: &Arc<TrackingSession>) -> TrackingHandle {
        TrackingHandle {
            session: Arc::clone(session),
            registry: Arc::downgrade(self.registry()),
            sessions: Arc::downgrade(&self.sessions),
        }
    }

    /// Registry handler feeding `session`. Holds only weak references so a
    /// dropped tracker does not keep sessions alive through the registry.
    fn handler_for(&self, session: &Arc<TrackingSession>) -> MessageHandler {
        let weak_session = Arc::downgrade(session);
        let sessions = Arc::downgrade(&self.sessions);
        Arc::new(move |body: &str| {
            let Some(session) = weak_session.upgrade() else {
                return Delivery::Finished;
            };
            let delivery = session.handle_body(body);
            if delivery == Delivery::Finished {
                if let Some(sessions) = sessions.upgrade() {
                    forget(&sessions, &session);
                }
            }
            delivery
        })
    }
}

fn cancel_session(registry: &SubscriptionRegistry, session: &Arc<TrackingSession>) -> bool {
    if !session.transition(SessionState::Cancelled) {
        return false;
    }
    if let Some(subscription) = session.subscription() {
        registry.release(&subscription);
    }
    tracing::info!(job_id = %session.job_id(), "Tracking cancelled");
    true
}

/// Cancel function for one tracking session.
///
/// Inert when tracking never started (invalid id, no connection,
/// subscription failure) or after the session finished.
#[derive(Clone)]
pub struct TrackingHandle {
    session: Arc<TrackingSession>,
    registry: Weak<SubscriptionRegistry>,
    sessions: Weak<SessionMap>,
}

impl TrackingHandle {
    /// Stop tracking. Later in-flight messages are ignored. Idempotent.
    pub fn cancel(&self) {
        let Some(registry) = self.registry.upgrade() else {
            self.session.transition(SessionState::Cancelled);
            return;
        };
        if cancel_session(&registry, &self.session) {
            if let Some(sessions) = self.sessions.upgrade() {
                forget(&sessions, &self.session);
            }
        }
    }

    /// Current job id; follows identifier switches.
    pub fn job_id(&self) -> String {
        self.session.job_id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    /// Highest percent reported so far.
    pub fn progress(&self) -> u8 {
        self.session.progress()
    }

    /// Whether the session is tracking under a live subscription. False
    /// after cancellation, a terminal event, or a global disconnect.
    pub fn is_active(&self) -> bool {
        is_live(&self.session)
    }
}

impl std::fmt::Debug for TrackingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingHandle")
            .field("session", &self.session)
            .finish()
    }
}
