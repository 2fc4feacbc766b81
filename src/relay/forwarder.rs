//! Relay forwarder: POSTs a recovered code to the Automation Worker Endpoint.
//!
//! Retry policy:
//! - 2xx: delivered.
//! - 4xx: the worker rejected the code. Terminal at once; retrying an invalid
//!   code cannot succeed.
//! - 5xx, other statuses, transport errors: retried, waiting
//!   `base_delay * attempt_number` after each failed attempt.
//! - Budget exhausted: a `DeadLetterRecord` goes to the sink and the outcome
//!   is `Exhausted`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::dead_letter::{DeadLetterPayload, DeadLetterRecord, DeadLetterSink};
use crate::clock::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::code::VerificationCode;
use crate::error::RelayError;

/// One POST to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayAttempt {
    /// 1-based.
    pub attempt_number: u32,
    pub sent_at: DateTime<Utc>,
    /// `None` when the request never got a response.
    pub http_status: Option<u16>,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one relay operation. Failures must be surfaced by the caller.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered { attempts: Vec<RelayAttempt> },
    /// The worker answered 4xx. No retries, no dead letter.
    Rejected { status: u16, attempts: Vec<RelayAttempt> },
    /// Every attempt failed; the record has been handed to the sink.
    Exhausted { record: Box<DeadLetterRecord> },
}

impl RelayOutcome {
    pub fn attempts(&self) -> &[RelayAttempt] {
        match self {
            Self::Delivered { attempts } | Self::Rejected { attempts, .. } => attempts,
            Self::Exhausted { record } => &record.attempt_history,
        }
    }
}

#[derive(Serialize)]
struct RelayBody<'a> {
    #[serde(rename = "verificationId")]
    verification_id: &'a str,
}

enum AttemptResult {
    Success,
    Reject(u16),
    Retry(String),
}

/// Forwards codes to the worker with bounded retries.
pub struct RelayForwarder {
    client: reqwest::Client,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn DeadLetterSink>,
}

impl RelayForwarder {
    pub fn new(
        request_timeout: Duration,
        sink: Arc<dyn DeadLetterSink>,
    ) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RelayError::Client(e.to_string()))?;
        Ok(Self {
            client,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(SystemClock),
            sink,
        })
    }

    /// Replace the delay source (tests use a recording sleeper).
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Check that a target URL is usable before any code is at stake.
    pub fn validate_target(target_url: &str) -> Result<(), RelayError> {
        let url = reqwest::Url::parse(target_url).map_err(|e| RelayError::InvalidTarget {
            url: target_url.to_string(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(RelayError::InvalidTarget {
                url: target_url.to_string(),
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }

    /// Deliver `code` to `target_url`, making at most `max_attempts` POSTs.
    pub async fn relay(
        &self,
        code: &VerificationCode,
        target_url: &str,
        max_attempts: u32,
        base_delay: Duration,
    ) -> RelayOutcome {
        let max_attempts = max_attempts.max(1);
        let mut attempts = Vec::new();
        let mut last_failure = String::new();

        for attempt_number in 1..=max_attempts {
            let sent_at = self.clock.now();
            let (result, http_status) = self.send_once(code, target_url).await;

            match result {
                AttemptResult::Success => {
                    attempts.push(RelayAttempt {
                        attempt_number,
                        sent_at,
                        http_status,
                        succeeded: true,
                        error: None,
                    });
                    info!(attempt = attempt_number, target_url, "Code relayed to worker");
                    return RelayOutcome::Delivered { attempts };
                }
                AttemptResult::Reject(status) => {
                    attempts.push(RelayAttempt {
                        attempt_number,
                        sent_at,
                        http_status,
                        succeeded: false,
                        error: None,
                    });
                    warn!(
                        attempt = attempt_number,
                        status,
                        target_url,
                        "Worker rejected the code; not retrying"
                    );
                    return RelayOutcome::Rejected { status, attempts };
                }
                AttemptResult::Retry(reason) => {
                    warn!(
                        attempt = attempt_number,
                        max_attempts,
                        status = ?http_status,
                        reason = %reason,
                        "Relay attempt failed"
                    );
                    attempts.push(RelayAttempt {
                        attempt_number,
                        sent_at,
                        http_status,
                        succeeded: false,
                        error: http_status.is_none().then(|| reason.clone()),
                    });
                    last_failure = reason;
                }
            }

            if attempt_number < max_attempts {
                let delay = backoff_delay(base_delay, attempt_number);
                debug!(
                    attempt = attempt_number,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Backing off"
                );
                self.sleeper.sleep(delay).await;
            }
        }

        let record = DeadLetterRecord::new(
            DeadLetterPayload {
                code: code.clone(),
                target_url: target_url.to_string(),
            },
            format!("retry budget of {max_attempts} exhausted; last failure: {last_failure}"),
            attempts,
            self.clock.now(),
        );
        if let Err(e) = self.sink.record(&record).await {
            error!(dead_letter_id = %record.id, error = %e, "Failed to persist dead letter");
        }
        RelayOutcome::Exhausted {
            record: Box::new(record),
        }
    }

    async fn send_once(
        &self,
        code: &VerificationCode,
        target_url: &str,
    ) -> (AttemptResult, Option<u16>) {
        let body = RelayBody {
            verification_id: code.expose_secret(),
        };
        match self.client.post(target_url).json(&body).send().await {
            Ok(resp) => {
                let status = resp.status();
                let result = if status.is_success() {
                    AttemptResult::Success
                } else if status.is_client_error() {
                    AttemptResult::Reject(status.as_u16())
                } else {
                    AttemptResult::Retry(format!("worker returned HTTP {}", status.as_u16()))
                };
                (result, Some(status.as_u16()))
            }
            Err(e) => (AttemptResult::Retry(format!("transport error: {e}")), None),
        }
    }
}

/// Delay after failed attempt `attempt_number`: `base_delay * attempt_number`,
/// saturating instead of overflowing.
fn backoff_delay(base_delay: Duration, attempt_number: u32) -> Duration {
    base_delay.saturating_mul(attempt_number)
}
