//! Challenge session states and the values the session hands out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::code::VerificationCode;

/// Lifecycle of a challenge session.
///
/// Idle → Listening → (Received | TimedOut) → Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
    Received,
    TimedOut,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Received => "received",
            Self::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// Where a submitted code came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeSource {
    /// Pushed through `POST /submit`.
    Human,
    /// Found by the mailbox poller.
    Mailbox,
}

impl std::fmt::Display for CodeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Human => write!(f, "human"),
            Self::Mailbox => write!(f, "mailbox"),
        }
    }
}

/// A code accepted by a Listening session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCode {
    pub session_id: Uuid,
    pub code: VerificationCode,
    pub source: CodeSource,
    pub received_at: DateTime<Utc>,
}

/// Point-in-time view of the session. Never carries the code value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub has_code: bool,
    pub code_received_time: Option<DateTime<Utc>>,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            session_id: None,
            started_at: None,
            deadline: None,
            has_code: false,
            code_received_time: None,
        }
    }

    pub fn waiting_for_code(&self) -> bool {
        self.state == SessionState::Listening
    }
}

/// How a consumed session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Received(ReceivedCode),
    TimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_serde() {
        use SessionState::*;
        for state in [Idle, Listening, Received, TimedOut] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(format!("\"{state}\""), json);
        }
    }

    #[test]
    fn idle_status_has_no_code() {
        let status = SessionStatus::idle();
        assert!(!status.has_code);
        assert!(!status.waiting_for_code());
        assert_eq!(status.state, SessionState::Idle);
    }
}
