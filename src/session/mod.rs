//! Challenge session: the single in-flight "waiting for a code" state machine.
//!
//! Every transition happens under one mutex. The background timeout and a
//! concurrent `submit` both try to leave Listening; whichever takes the lock
//! first wins and the other sees a non-Listening state and does nothing.
//!
//! Each `start` bumps a generation counter. A timer only acts if its
//! generation is still current, so a timer left over from a stopped session
//! can never time out a newer one.

pub mod state;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

pub use state::{CodeSource, ReceivedCode, SessionOutcome, SessionState, SessionStatus};

use crate::clock::{Clock, SystemClock};
use crate::code::VerificationCode;
use crate::error::SessionError;

/// Handed to whoever starts a session. The receiver resolves with the
/// accepted code, or errors if the session times out or is stopped first.
#[derive(Debug)]
pub struct SessionTicket {
    pub session_id: Uuid,
    pub deadline: DateTime<Utc>,
    pub code: oneshot::Receiver<ReceivedCode>,
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    session_id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    deadline: Option<DateTime<Utc>>,
    received: Option<ReceivedCode>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    waiter: Option<oneshot::Sender<ReceivedCode>>,
}

impl Inner {
    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            session_id: self.session_id,
            started_at: self.started_at,
            deadline: self.deadline,
            has_code: self.received.is_some(),
            code_received_time: self.received.as_ref().map(|r| r.received_at),
        }
    }

    /// Drop everything tied to the current session and return to Idle.
    fn reset(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.state = SessionState::Idle;
        self.session_id = None;
        self.started_at = None;
        self.deadline = None;
        self.received = None;
        self.waiter = None;
    }

    fn time_out(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.state = SessionState::TimedOut;
        // Dropping the sender wakes the ticket holder with an error.
        self.waiter = None;
    }
}

/// The challenge session. Construct once and share via `Arc`.
pub struct ChallengeSession {
    inner: Mutex<Inner>,
    timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl ChallengeSession {
    /// Create an Idle session using the wall clock.
    pub fn new(timeout: Duration) -> Arc<Self> {
        Self::with_clock(timeout, Arc::new(SystemClock))
    }

    pub fn with_clock(timeout: Duration, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            timeout,
            clock,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Idle → Listening. Must be called inside a tokio runtime.
    ///
    /// Rejected while Listening (the deadline is left alone) or while a
    /// finished session is still unconsumed.
    pub fn start(self: &Arc<Self>) -> Result<SessionTicket, SessionError> {
        let mut inner = self.lock();
        match inner.state {
            SessionState::Idle => {}
            SessionState::Listening => {
                debug!(session_id = ?inner.session_id, "Start rejected: already listening");
                return Err(SessionError::AlreadyListening);
            }
            SessionState::Received | SessionState::TimedOut => {
                debug!(state = %inner.state, "Start rejected: previous session unconsumed");
                return Err(SessionError::Unconsumed);
            }
        }

        let now = self.clock.now();
        let session_id = Uuid::new_v4();
        let deadline = chrono::Duration::from_std(self.timeout)
            .ok()
            .and_then(|timeout| now.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let (tx, rx) = oneshot::channel();

        inner.generation += 1;
        inner.state = SessionState::Listening;
        inner.session_id = Some(session_id);
        inner.started_at = Some(now);
        inner.deadline = Some(deadline);
        inner.received = None;
        inner.waiter = Some(tx);
        inner.timer = Some(spawn_timer(Arc::downgrade(self), inner.generation, self.timeout));

        info!(
            session_id = %session_id,
            at = %now,
            deadline = %deadline,
            state = %SessionState::Listening,
            "Challenge session started"
        );

        Ok(SessionTicket {
            session_id,
            deadline,
            code: rx,
        })
    }

    /// Listening → Received, if the deadline has not passed.
    ///
    /// At or after the deadline the session times out instead and the
    /// submit is rejected as expired.
    pub fn submit(
        &self,
        code: VerificationCode,
        source: CodeSource,
    ) -> Result<ReceivedCode, SessionError> {
        let mut inner = self.lock();
        self.accept(&mut inner, code, source)
    }

    /// Like [`submit`](Self::submit), but only into the session identified
    /// by `session_id`.
    ///
    /// A caller that started a session uses this so its code can never land
    /// in a later session someone else started after a stop.
    pub fn submit_for(
        &self,
        session_id: Uuid,
        code: VerificationCode,
        source: CodeSource,
    ) -> Result<ReceivedCode, SessionError> {
        let mut inner = self.lock();
        if inner.session_id != Some(session_id) {
            debug!(
                session_id = %session_id,
                current = ?inner.session_id,
                %source,
                "Submit rejected: session replaced"
            );
            return Err(SessionError::NotWaiting);
        }
        self.accept(&mut inner, code, source)
    }

    fn accept(
        &self,
        inner: &mut Inner,
        code: VerificationCode,
        source: CodeSource,
    ) -> Result<ReceivedCode, SessionError> {
        let now = self.clock.now();

        match inner.state {
            SessionState::Listening => {}
            SessionState::TimedOut => {
                debug!(session_id = ?inner.session_id, %source, "Submit rejected: session expired");
                return Err(SessionError::Expired);
            }
            SessionState::Idle | SessionState::Received => {
                debug!(state = %inner.state, %source, "Submit rejected: not waiting");
                return Err(SessionError::NotWaiting);
            }
        }

        let session_id = inner.session_id.unwrap_or_else(Uuid::nil);
        if inner.deadline.is_some_and(|deadline| now >= deadline) {
            inner.time_out();
            info!(
                session_id = %session_id,
                at = %now,
                state = %SessionState::TimedOut,
                "Challenge session timed out on late submit"
            );
            return Err(SessionError::Expired);
        }

        let received = ReceivedCode {
            session_id,
            code,
            source,
            received_at: now,
        };
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.state = SessionState::Received;
        inner.received = Some(received.clone());
        if let Some(waiter) = inner.waiter.take() {
            // The ticket holder may have gone away; the code stays in the session.
            let _ = waiter.send(received.clone());
        }

        info!(
            session_id = %session_id,
            at = %now,
            state = %SessionState::Received,
            %source,
            "Verification code received"
        );
        Ok(received)
    }

    /// Timer callback: Listening → TimedOut if `generation` is still current.
    ///
    /// Returns whether this call performed the transition.
    pub(crate) fn fire_timeout(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation || inner.state != SessionState::Listening {
            debug!(generation, "Stale or lost timeout ignored");
            return false;
        }
        inner.timer = None;
        inner.time_out();
        info!(
            session_id = ?inner.session_id,
            at = %self.clock.now(),
            state = %SessionState::TimedOut,
            "Challenge session timed out"
        );
        true
    }

    /// Current status, without consuming anything.
    pub fn snapshot(&self) -> SessionStatus {
        self.lock().status()
    }

    /// Status as served to HTTP clients.
    ///
    /// A Received session is a one-time read: it is reported once and the
    /// session returns to Idle. TimedOut stays visible until stopped or
    /// consumed.
    pub fn status(&self) -> SessionStatus {
        let mut inner = self.lock();
        let status = inner.status();
        if inner.state == SessionState::Received {
            info!(
                session_id = ?inner.session_id,
                at = %self.clock.now(),
                state = %SessionState::Idle,
                "Received session consumed by status read"
            );
            inner.reset();
        }
        status
    }

    /// Consume a finished session, returning it to Idle.
    ///
    /// Only acts on the session identified by `session_id` and only once it
    /// is terminal; otherwise returns `None` and changes nothing.
    pub fn consume(&self, session_id: Uuid) -> Option<SessionOutcome> {
        let mut inner = self.lock();
        if inner.session_id != Some(session_id) {
            return None;
        }
        let outcome = match inner.state {
            SessionState::Received => SessionOutcome::Received(inner.received.clone()?),
            SessionState::TimedOut => SessionOutcome::TimedOut,
            SessionState::Idle | SessionState::Listening => return None,
        };
        inner.reset();
        info!(
            session_id = %session_id,
            at = %self.clock.now(),
            state = %SessionState::Idle,
            "Challenge session consumed"
        );
        Some(outcome)
    }

    /// Reset to Idle, but only if `session_id` is still the current session.
    ///
    /// Lets a cycle clean up after itself without clobbering a session
    /// someone else started in the meantime.
    pub fn release(&self, session_id: Uuid) -> bool {
        let mut inner = self.lock();
        if inner.session_id != Some(session_id) {
            return false;
        }
        let previous = inner.state;
        inner.reset();
        info!(
            session_id = %session_id,
            at = %self.clock.now(),
            from = %previous,
            state = %SessionState::Idle,
            "Challenge session released"
        );
        true
    }

    /// Force-reset to Idle from any state, cancelling the pending timer.
    pub fn stop(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        let session_id = inner.session_id;
        inner.reset();
        if previous != SessionState::Idle {
            info!(
                session_id = ?session_id,
                at = %self.clock.now(),
                from = %previous,
                state = %SessionState::Idle,
                "Challenge session stopped"
            );
        }
    }

    #[cfg(test)]
    fn generation(&self) -> u64 {
        self.lock().generation
    }
}

fn spawn_timer(session: Weak<ChallengeSession>, generation: u64, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(session) = session.upgrade() {
            session.fire_timeout(generation);
        }
    })
}
