//! Orchestrator: drives one end-to-end verification cycle.
//!
//! 1. Start a challenge session (when HTTP ingress is in use).
//! 2. Wait out the mail-delivery latency budget.
//! 3. Poll the mailbox up to `max_polls` times with a fixed interval.
//! 4. Relay the first code found to the worker.
//!
//! While a session is open, a code pushed by a human through the challenge
//! server ends any wait early. A mailbox code is submitted to the same
//! session, so both ingress paths go through one state machine.
//!
//! "No code found" and relay failures are distinct error classes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Sleeper, TokioSleeper};
use crate::code::VerificationCode;
use crate::config::{PollConfig, RelayConfig};
use crate::error::{CycleError, SessionError};
use crate::mailbox::MailboxPoller;
use crate::relay::{RelayAttempt, RelayForwarder, RelayOutcome};
use crate::session::{ChallengeSession, CodeSource, SessionState, SessionTicket};

/// Per-cycle budgets and relay target.
#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub poll: PollConfig,
    pub target_url: String,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl CycleSettings {
    pub fn new(poll: PollConfig, relay: &RelayConfig) -> Self {
        Self {
            poll,
            target_url: relay.target_url.clone(),
            max_attempts: relay.max_attempts,
            base_delay: relay.base_delay,
        }
    }
}

/// What a successful cycle did.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub session_id: Option<Uuid>,
    pub source: CodeSource,
    /// Mailbox polls performed before a code was in hand.
    pub polls: u32,
    pub relay_attempts: Vec<RelayAttempt>,
}

struct AcquiredCode {
    code: VerificationCode,
    source: CodeSource,
    polls: u32,
}

/// Runs verification cycles. Holds no state between cycles.
pub struct Orchestrator {
    poller: MailboxPoller,
    forwarder: RelayForwarder,
    session: Option<Arc<ChallengeSession>>,
    sleeper: Arc<dyn Sleeper>,
    settings: CycleSettings,
}

impl Orchestrator {
    pub fn new(poller: MailboxPoller, forwarder: RelayForwarder, settings: CycleSettings) -> Self {
        Self {
            poller,
            forwarder,
            session: None,
            sleeper: Arc::new(TokioSleeper),
            settings,
        }
    }

    /// Open a challenge session per cycle so a human can push a code too.
    pub fn with_session(mut self, session: Arc<ChallengeSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Run one cycle. `triggered_at` is when the portal sent the code; older
    /// mail is ignored unless the poll config says otherwise.
    pub async fn run_cycle(&self, triggered_at: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        let mut ticket = match &self.session {
            Some(session) => Some(session.start().map_err(CycleError::SessionBusy)?),
            None => None,
        };
        let session_id = ticket.as_ref().map(|t| t.session_id);
        info!(session_id = ?session_id, triggered_at = %triggered_at, "Verification cycle started");

        let acquired = self.acquire_code(triggered_at, ticket.as_mut()).await;

        if let (Some(session), Some(id)) = (&self.session, session_id) {
            if acquired.is_ok() {
                session.consume(id);
            }
            session.release(id);
        }

        let acquired = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                error!(session_id = ?session_id, error = %e, "Verification cycle failed before relay");
                return Err(e);
            }
        };

        info!(
            session_id = ?session_id,
            source = %acquired.source,
            polls = acquired.polls,
            "Relaying verification code"
        );

        let outcome = self
            .forwarder
            .relay(
                &acquired.code,
                &self.settings.target_url,
                self.settings.max_attempts,
                self.settings.base_delay,
            )
            .await;

        match outcome {
            RelayOutcome::Delivered { attempts } => {
                info!(
                    session_id = ?session_id,
                    attempts = attempts.len(),
                    "Verification cycle complete"
                );
                Ok(CycleReport {
                    session_id,
                    source: acquired.source,
                    polls: acquired.polls,
                    relay_attempts: attempts,
                })
            }
            RelayOutcome::Rejected { status, .. } => {
                error!(session_id = ?session_id, status, "Worker rejected the verification code");
                Err(CycleError::RelayRejected { status })
            }
            RelayOutcome::Exhausted { record } => {
                error!(
                    session_id = ?session_id,
                    dead_letter_id = %record.id,
                    "Relay exhausted its retry budget"
                );
                Err(CycleError::RelayExhausted { record })
            }
        }
    }

    async fn acquire_code(
        &self,
        since: DateTime<Utc>,
        mut ticket: Option<&mut SessionTicket>,
    ) -> Result<AcquiredCode, CycleError> {
        let poll = &self.settings.poll;
        let session_id = ticket.as_ref().map(|t| t.session_id);

        if let Some(human) = self.wait(poll.initial_wait, ticket.as_deref_mut()).await {
            return self.human_code(human, session_id, 0);
        }

        for attempt in 1..=poll.max_polls {
            match self.poller.poll(since, poll.ignore_window).await {
                Ok(Some(found)) => {
                    return self.accept_mailbox_code(found.code, ticket.as_deref_mut(), attempt).await;
                }
                Ok(None) => debug!(poll = attempt, max_polls = poll.max_polls, "No code yet"),
                Err(e) if !e.is_transient() => {
                    return Err(CycleError::MailboxAuth(e.to_string()));
                }
                Err(e) => warn!(poll = attempt, error = %e, "Mailbox poll failed"),
            }

            if attempt < poll.max_polls
                && let Some(human) = self.wait(poll.interval, ticket.as_deref_mut()).await
            {
                return self.human_code(human, session_id, attempt);
            }
        }

        Err(CycleError::NoCodeFound {
            polls: poll.max_polls,
        })
    }

    /// Sleep for `delay`, returning early if the session resolves.
    ///
    /// `Some(Ok(code))` means a code arrived through the session;
    /// `Some(Err(()))` means the session ended without one.
    async fn wait(
        &self,
        delay: Duration,
        ticket: Option<&mut SessionTicket>,
    ) -> Option<Result<VerificationCode, ()>> {
        let Some(ticket) = ticket else {
            self.sleeper.sleep(delay).await;
            return None;
        };
        tokio::select! {
            biased;
            received = &mut ticket.code => Some(received.map(|r| r.code).map_err(|_| ())),
            _ = self.sleeper.sleep(delay) => None,
        }
    }

    fn human_code(
        &self,
        received: Result<VerificationCode, ()>,
        session_id: Option<Uuid>,
        polls: u32,
    ) -> Result<AcquiredCode, CycleError> {
        match received {
            Ok(code) => {
                info!(polls, "Verification code pushed through challenge server");
                Ok(AcquiredCode {
                    code,
                    source: CodeSource::Human,
                    polls,
                })
            }
            Err(()) => Err(self.session_end_error(session_id)),
        }
    }

    async fn accept_mailbox_code(
        &self,
        code: VerificationCode,
        ticket: Option<&mut SessionTicket>,
        polls: u32,
    ) -> Result<AcquiredCode, CycleError> {
        let (Some(session), Some(ticket)) = (&self.session, ticket) else {
            return Ok(AcquiredCode {
                code,
                source: CodeSource::Mailbox,
                polls,
            });
        };

        match session.submit_for(ticket.session_id, code, CodeSource::Mailbox) {
            Ok(received) => Ok(AcquiredCode {
                code: received.code,
                source: CodeSource::Mailbox,
                polls,
            }),
            Err(SessionError::Expired) => Err(CycleError::SessionTimedOut {
                timeout: session.timeout(),
            }),
            // A human code beat the mailbox to the session and is already
            // waiting on the ticket, or our session was stopped (and maybe
            // replaced), which drops the ticket's sender.
            Err(_) => match (&mut ticket.code).await {
                Ok(received) => Ok(AcquiredCode {
                    code: received.code,
                    source: received.source,
                    polls,
                }),
                Err(_) => Err(self.session_end_error(Some(ticket.session_id))),
            },
        }
    }

    /// Why our session ended without a code. A session someone else started
    /// after ours was stopped does not count.
    fn session_end_error(&self, session_id: Option<Uuid>) -> CycleError {
        let Some(session) = &self.session else {
            return CycleError::SessionStopped;
        };
        let status = session.snapshot();
        if status.state == SessionState::TimedOut && status.session_id == session_id {
            CycleError::SessionTimedOut {
                timeout: session.timeout(),
            }
        } else {
            CycleError::SessionStopped
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::clock::RecordingSleeper;
    use crate::config::ExtractionConfig;
    use crate::error::MailboxError;
    use crate::mailbox::{CodeExtractor, MailMessage, MailboxQuery};
    use crate::relay::MemoryDeadLetterSink;

    const SENDER: &str = "noreply@portal.example";

    /// Serves one scripted response per poll, then empty results.
    struct ScriptedMailbox {
        script: Mutex<Vec<Result<Vec<MailMessage>, MailboxError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedMailbox {
        fn new(mut script: Vec<Result<Vec<MailMessage>, MailboxError>>) -> Arc<Self> {
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl MailboxQuery for ScriptedMailbox {
        async fn query(
            &self,
            _sender: &str,
            _since: DateTime<Utc>,
            _ignore_window: bool,
        ) -> Result<Vec<MailMessage>, MailboxError> {
            *self.calls.lock().unwrap() += 1;
            self.script.lock().unwrap().pop().unwrap_or(Ok(Vec::new()))
        }
    }

    /// Stops the cycle's session and starts a new one mid-query, as an
    /// operator hitting `/stop` then `/start` during a slow IMAP fetch would.
    struct SessionSwappingMailbox {
        session: Arc<ChallengeSession>,
        replacement: Mutex<Option<SessionTicket>>,
    }

    #[async_trait]
    impl MailboxQuery for SessionSwappingMailbox {
        async fn query(
            &self,
            _sender: &str,
            _since: DateTime<Utc>,
            _ignore_window: bool,
        ) -> Result<Vec<MailMessage>, MailboxError> {
            self.session.stop();
            *self.replacement.lock().unwrap() = Some(self.session.start().unwrap());
            Ok(vec![MailMessage::new(
                1,
                SENDER,
                Utc::now() + chrono::Duration::minutes(1),
                "Your code is 552210",
            )])
        }
    }

    fn settings(max_polls: u32) -> CycleSettings {
        CycleSettings {
            poll: PollConfig {
                initial_wait: Duration::from_secs(30),
                interval: Duration::from_secs(15),
                max_polls,
                ignore_window: false,
                since_grace: Duration::from_secs(60),
            },
            // Never contacted in these tests.
            target_url: "http://127.0.0.1:9/verify".into(),
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
        }
    }

    fn orchestrator(
        mailbox: Arc<ScriptedMailbox>,
        sleeper: RecordingSleeper,
        max_polls: u32,
    ) -> Orchestrator {
        let extractor = CodeExtractor::new(SENDER, &ExtractionConfig::digits_pattern(6), 6).unwrap();
        let forwarder = RelayForwarder::new(
            Duration::from_secs(1),
            Arc::new(MemoryDeadLetterSink::new()),
        )
        .unwrap();
        Orchestrator::new(MailboxPoller::new(mailbox, extractor), forwarder, settings(max_polls))
            .with_sleeper(Arc::new(sleeper))
    }

    #[tokio::test]
    async fn no_code_after_budget_is_distinct_failure() {
        let mailbox = ScriptedMailbox::new(vec![]);
        let sleeper = RecordingSleeper::new();
        let orch = orchestrator(Arc::clone(&mailbox), sleeper.clone(), 4);

        let err = orch.run_cycle(Utc::now()).await.unwrap_err();
        assert!(matches!(err, CycleError::NoCodeFound { polls: 4 }));
        assert_eq!(mailbox.calls(), 4);
        assert_eq!(
            sleeper.delays(),
            vec![
                Duration::from_secs(30),
                Duration::from_secs(15),
                Duration::from_secs(15),
                Duration::from_secs(15),
            ]
        );
    }

    #[tokio::test]
    async fn transient_mailbox_errors_count_as_polls() {
        let mailbox = ScriptedMailbox::new(vec![
            Err(MailboxError::Transport("reset".into())),
            Err(MailboxError::Transport("reset".into())),
        ]);
        let orch = orchestrator(Arc::clone(&mailbox), RecordingSleeper::new(), 3);

        let err = orch.run_cycle(Utc::now()).await.unwrap_err();
        assert!(matches!(err, CycleError::NoCodeFound { polls: 3 }));
        assert_eq!(mailbox.calls(), 3);
    }

    #[tokio::test]
    async fn mailbox_auth_failure_aborts_immediately() {
        let mailbox = ScriptedMailbox::new(vec![Err(MailboxError::Auth("LOGIN rejected".into()))]);
        let orch = orchestrator(Arc::clone(&mailbox), RecordingSleeper::new(), 5);

        let err = orch.run_cycle(Utc::now()).await.unwrap_err();
        assert!(matches!(err, CycleError::MailboxAuth(_)));
        assert_eq!(mailbox.calls(), 1);
    }

    #[tokio::test]
    async fn busy_session_fails_fast() {
        let session = ChallengeSession::new(Duration::from_secs(1800));
        let _held = session.start().unwrap();
        let mailbox = ScriptedMailbox::new(vec![]);
        let orch = orchestrator(Arc::clone(&mailbox), RecordingSleeper::new(), 3)
            .with_session(Arc::clone(&session));

        let err = orch.run_cycle(Utc::now()).await.unwrap_err();
        assert!(matches!(
            err,
            CycleError::SessionBusy(SessionError::AlreadyListening)
        ));
        assert_eq!(mailbox.calls(), 0);
        assert_eq!(session.snapshot().state, SessionState::Listening);
    }

    #[tokio::test]
    async fn failed_cycle_returns_session_to_idle() {
        let session = ChallengeSession::new(Duration::from_secs(1800));
        let mailbox = ScriptedMailbox::new(vec![]);
        let orch = orchestrator(mailbox, RecordingSleeper::new(), 2)
            .with_session(Arc::clone(&session));

        let err = orch.run_cycle(Utc::now()).await.unwrap_err();
        assert!(matches!(err, CycleError::NoCodeFound { .. }));
        assert_eq!(session.snapshot().state, SessionState::Idle);
    }

    #[tokio::test]
    async fn mailbox_code_never_lands_in_a_replacement_session() {
        let session = ChallengeSession::new(Duration::from_secs(1800));
        let mailbox = Arc::new(SessionSwappingMailbox {
            session: Arc::clone(&session),
            replacement: Mutex::new(None),
        });
        let extractor =
            CodeExtractor::new(SENDER, &ExtractionConfig::digits_pattern(6), 6).unwrap();
        let forwarder = RelayForwarder::new(
            Duration::from_secs(1),
            Arc::new(MemoryDeadLetterSink::new()),
        )
        .unwrap();
        let orch = Orchestrator::new(
            MailboxPoller::new(Arc::clone(&mailbox) as Arc<dyn MailboxQuery>, extractor),
            forwarder,
            settings(3),
        )
        .with_sleeper(Arc::new(RecordingSleeper::new()))
        .with_session(Arc::clone(&session));

        let err = orch.run_cycle(Utc::now()).await.unwrap_err();
        assert!(matches!(err, CycleError::SessionStopped));

        let replacement = mailbox.replacement.lock().unwrap().take().unwrap();
        let status = session.snapshot();
        assert_eq!(status.state, SessionState::Listening);
        assert_eq!(status.session_id, Some(replacement.session_id));
        assert!(!status.has_code);
    }
}
