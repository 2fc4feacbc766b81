//! Error types for the code relay.

use std::time::Duration;

use crate::relay::dead_letter::DeadLetterRecord;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// State-conflict errors raised by the challenge session.
///
/// None of these are retryable; they are resolved where they occur.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Not currently waiting")]
    NotWaiting,

    #[error("Already listening")]
    AlreadyListening,

    #[error("Previous session has not been consumed")]
    Unconsumed,

    #[error("Verification window expired")]
    Expired,
}

/// Malformed client input, rejected before the session is touched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    #[error("verificationId is required")]
    Missing,

    #[error("verificationId must contain digits only")]
    NotNumeric,

    #[error("verificationId must be {expected} digits, got {actual}")]
    WrongLength { expected: usize, actual: usize },

    #[error("Malformed request body: {0}")]
    Body(String),
}

/// Mailbox query failures. "No message yet" is `Ok(None)`, never one of these.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Mailbox authentication failed: {0}")]
    Auth(String),

    #[error("Mailbox transport failure: {0}")]
    Transport(String),

    #[error("Mailbox protocol error: {0}")]
    Protocol(String),
}

impl MailboxError {
    /// Whether retrying on a later poll could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Auth(_))
    }
}

/// Relay setup failures. Delivery results are `RelayOutcome` values.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Invalid target URL {url}: {reason}")]
    InvalidTarget { url: String, reason: String },

    #[error("HTTP client error: {0}")]
    Client(String),
}

/// Failure classes of one orchestrated verification cycle.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("No verification code found after {polls} mailbox poll(s)")]
    NoCodeFound { polls: u32 },

    #[error("Worker rejected the code with HTTP {status}")]
    RelayRejected { status: u16 },

    #[error("Relay exhausted after {} attempt(s): {}", .record.attempt_history.len(), .record.failure_reason)]
    RelayExhausted { record: Box<DeadLetterRecord> },

    #[error("Challenge session timed out after {timeout:?}")]
    SessionTimedOut { timeout: Duration },

    #[error("Challenge session busy: {0}")]
    SessionBusy(SessionError),

    #[error("Challenge session was stopped before a code arrived")]
    SessionStopped,

    #[error("Mailbox authentication failed: {0}")]
    MailboxAuth(String),
}

impl CycleError {
    /// Process exit code for this failure class.
    ///
    /// 2 = mail never arrived, 3 = worker side, 4 = session, 5 = mailbox credentials.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NoCodeFound { .. } => 2,
            Self::RelayRejected { .. } | Self::RelayExhausted { .. } => 3,
            Self::SessionTimedOut { .. } | Self::SessionBusy(_) | Self::SessionStopped => 4,
            Self::MailboxAuth(_) => 5,
        }
    }
}
