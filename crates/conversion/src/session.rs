//! Per-job tracking session and its state machine.
//!
//! A [`TrackingSession`] owns the caller's three callbacks and turns raw
//! message bodies into callback invocations. It survives an identifier
//! switch: the same session (and therefore the same callbacks and
//! progress floor) moves from the temporary id to the server id.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitzomax_bus::{Delivery, SubscriptionHandle};

use crate::messages::{decode_progress, ProgressEvent};

/// Lifecycle of one tracking session.
///
/// `Idle -> Connecting -> Tracking -> {Completed | Error}`, with
/// `Cancelled` reachable from `Connecting` or `Tracking`. Terminal states
/// have no outgoing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Tracking,
    Completed,
    Error,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Error | SessionState::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Error)
                | (Connecting, Tracking)
                | (Connecting, Error)
                | (Connecting, Cancelled)
                | (Tracking, Completed)
                | (Tracking, Error)
                | (Tracking, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Tracking => "tracking",
            SessionState::Completed => "completed",
            SessionState::Error => "error",
            SessionState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ProgressCallback = Arc<dyn Fn(u8, &str) + Send + Sync>;
pub type CompleteCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// The three callbacks a caller registers for one job.
#[derive(Clone)]
pub struct TrackingCallbacks {
    pub on_progress: ProgressCallback,
    pub on_complete: CompleteCallback,
    pub on_error: ErrorCallback,
}

impl TrackingCallbacks {
    pub fn new(
        on_progress: impl Fn(u8, &str) + Send + Sync + 'static,
        on_complete: impl Fn(&str) + Send + Sync + 'static,
        on_error: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_progress: Arc::new(on_progress),
            on_complete: Arc::new(on_complete),
            on_error: Arc::new(on_error),
        }
    }

    /// Callbacks that ignore everything.
    pub fn noop() -> Self {
        Self::new(|_, _| {}, |_| {}, |_| {})
    }
}

impl fmt::Debug for TrackingCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingCallbacks").finish_non_exhaustive()
    }
}

struct SessionInner {
    job_id: String,
    state: SessionState,
    /// Highest percent reported so far.
    high_water: u8,
    subscription: Option<SubscriptionHandle>,
}

/// One caller's interest in one conversion job.
pub struct TrackingSession {
    inner: Mutex<SessionInner>,
    callbacks: TrackingCallbacks,
}

impl TrackingSession {
    pub fn new(job_id: &str, callbacks: TrackingCallbacks) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SessionInner {
                job_id: job_id.to_string(),
                state: SessionState::Idle,
                high_water: 0,
                subscription: None,
            }),
            callbacks,
        })
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn job_id(&self) -> String {
        self.lock().job_id.clone()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    /// Highest percent delivered to `on_progress` so far.
    pub fn progress(&self) -> u8 {
        self.lock().high_water
    }

    /// Current subscription, if the session has one.
    pub fn subscription(&self) -> Option<SubscriptionHandle> {
        self.lock().subscription.clone()
    }

    /// Apply a state transition. Illegal transitions are refused and
    /// logged; returns whether the transition happened.
    pub(crate) fn transition(&self, next: SessionState) -> bool {
        let mut inner = self.lock();
        if !inner.state.can_transition_to(next) {
            tracing::debug!(
                job_id = %inner.job_id,
                from = %inner.state,
                to = %next,
                "Ignoring illegal session transition",
            );
            return false;
        }
        inner.state = next;
        true
    }

    pub(crate) fn attach(&self, handle: SubscriptionHandle) {
        let mut inner = self.lock();
        inner.job_id = handle.job_id().to_string();
        inner.subscription = Some(handle);
    }

    /// Move into `Error` and report `message`, unless already terminal.
    pub(crate) fn fail(&self, message: &str) {
        if self.transition(SessionState::Error) {
            (self.callbacks.on_error)(message);
        }
    }

    /// Handle one raw message body.
    ///
    /// Callbacks run after the session lock is released. Terminal events
    /// return [`Delivery::Finished`]; decode failures are reported through
    /// `on_error` and keep the subscription.
    pub fn handle_body(&self, body: &str) -> Delivery {
        let mut inner = self.lock();
        if inner.state != SessionState::Tracking {
            tracing::debug!(
                job_id = %inner.job_id,
                state = %inner.state,
                "Ignoring message for inactive session",
            );
            return if inner.state.is_terminal() {
                Delivery::Finished
            } else {
                Delivery::Continue
            };
        }

        let event = match decode_progress(body) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(job_id = %inner.job_id, error = %e, "Undecodable progress message");
                drop(inner);
                (self.callbacks.on_error)(&e.to_string());
                return Delivery::Continue;
            }
        };

        let delivery = if event.is_terminal() {
            Delivery::Finished
        } else {
            Delivery::Continue
        };
        match event {
            ProgressEvent::Processing { percent, message } => {
                let percent = percent.max(inner.high_water);
                inner.high_water = percent;
                tracing::trace!(job_id = %inner.job_id, percent, "Conversion progress");
                drop(inner);
                (self.callbacks.on_progress)(percent, &message);
            }
            ProgressEvent::Complete {
                message,
                result_file,
            } => {
                inner.state = SessionState::Completed;
                inner.high_water = 100;
                tracing::info!(job_id = %inner.job_id, result_file = %result_file, "Conversion complete");
                drop(inner);
                (self.callbacks.on_progress)(100, &message);
                (self.callbacks.on_complete)(&result_file);
            }
            ProgressEvent::Error { message } => {
                inner.state = SessionState::Error;
                tracing::warn!(job_id = %inner.job_id, message = %message, "Conversion failed");
                drop(inner);
                (self.callbacks.on_error)(&message);
            }
        }
        delivery
    }
}

impl fmt::Debug for TrackingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("TrackingSession")
            .field("job_id", &inner.job_id)
            .field("state", &inner.state)
            .field("progress", &inner.high_water)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Progress(u8, String),
        Complete(String),
        Error(String),
    }

    fn recording() -> (TrackingCallbacks, Arc<Mutex<Vec<Call>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (p, c, e) = (calls.clone(), calls.clone(), calls.clone());
        let callbacks = TrackingCallbacks::new(
            move |pct, msg| p.lock().unwrap().push(Call::Progress(pct, msg.to_string())),
            move |file| c.lock().unwrap().push(Call::Complete(file.to_string())),
            move |err| e.lock().unwrap().push(Call::Error(err.to_string())),
        );
        (callbacks, calls)
    }

    fn tracking_session() -> (Arc<TrackingSession>, Arc<Mutex<Vec<Call>>>) {
        let (callbacks, calls) = recording();
        let session = TrackingSession::new("job-1", callbacks);
        assert!(session.transition(SessionState::Connecting));
        assert!(session.transition(SessionState::Tracking));
        (session, calls)
    }

    #[test]
    fn legal_transitions() {
        use SessionState::*;
        assert!(Idle.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Tracking));
        assert!(Connecting.can_transition_to(Cancelled));
        assert!(Tracking.can_transition_to(Completed));
        assert!(Tracking.can_transition_to(Error));
        assert!(Tracking.can_transition_to(Cancelled));
    }

    #[test]
    fn terminal_states_have_no_exits() {
        use SessionState::*;
        for terminal in [Completed, Error, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Idle, Connecting, Tracking, Completed, Error, Cancelled] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
        assert!(!Idle.can_transition_to(Cancelled));
        assert!(!Idle.can_transition_to(Tracking));
    }

    #[test]
    fn processing_reports_progress() {
        let (session, calls) = tracking_session();
        let delivery =
            session.handle_body(r#"{"percentComplete":50,"status":"processing","message":"halfway"}"#);
        assert_eq!(delivery, Delivery::Continue);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![Call::Progress(50, "halfway".into())]
        );
        assert_eq!(session.progress(), 50);
    }

    #[test]
    fn progress_never_regresses() {
        let (session, calls) = tracking_session();
        session.handle_body(r#"{"percentComplete":60,"status":"processing","message":"a"}"#);
        session.handle_body(r#"{"percentComplete":40,"status":"processing","message":"b"}"#);
        session.handle_body(r#"{"percentComplete":70,"status":"processing","message":"c"}"#);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                Call::Progress(60, "a".into()),
                Call::Progress(60, "b".into()),
                Call::Progress(70, "c".into()),
            ]
        );
    }

    #[test]
    fn complete_reports_full_progress_then_result() {
        let (session, calls) = tracking_session();
        let delivery =
            session.handle_body(r#"{"status":"complete","resultFile":"out.webm","message":"done"}"#);
        assert_eq!(delivery, Delivery::Finished);
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                Call::Progress(100, "done".into()),
                Call::Complete("out.webm".into())
            ]
        );
    }

    #[test]
    fn error_is_terminal() {
        let (session, calls) = tracking_session();
        let delivery = session.handle_body(r#"{"status":"error","message":"bad codec"}"#);
        assert_eq!(delivery, Delivery::Finished);
        assert_eq!(session.state(), SessionState::Error);

        let late = session.handle_body(r#"{"percentComplete":90,"status":"processing"}"#);
        assert_eq!(late, Delivery::Finished);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![Call::Error("bad codec".into())]
        );
    }

    #[test]
    fn decode_failure_reports_error_and_keeps_tracking() {
        let (session, calls) = tracking_session();
        assert_eq!(session.handle_body("garbage"), Delivery::Continue);
        assert_eq!(
            session.handle_body(r#"{"status":"complete"}"#),
            Delivery::Continue
        );
        assert_eq!(session.state(), SessionState::Tracking);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[0], Call::Error(m) if m.starts_with("Error parsing server response")));
        assert!(matches!(&calls[1], Call::Error(m) if m.contains("without a result file")));
    }

    #[test]
    fn cancelled_session_ignores_messages() {
        let (session, calls) = tracking_session();
        assert!(session.transition(SessionState::Cancelled));
        let delivery = session.handle_body(r#"{"percentComplete":10,"status":"processing"}"#);
        assert_eq!(delivery, Delivery::Finished);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn fail_reports_once() {
        let (callbacks, calls) = recording();
        let session = TrackingSession::new("", callbacks);
        session.fail("No job id provided for tracking");
        session.fail("again");
        assert_eq!(session.state(), SessionState::Error);
        assert_eq!(
            *calls.lock().unwrap(),
            vec![Call::Error("No job id provided for tracking".into())]
        );
    }
}
