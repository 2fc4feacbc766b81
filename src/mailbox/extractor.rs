//! Code extractor: pulls a verification code out of a mail message.
//!
//! Pure: no I/O and no state beyond the compiled pattern. A message
//! qualifies when its sender matches the expected sender
//! (case-insensitive, on the bare address) and its body matches the pattern.
//! A match is only a code if it passes the same shape check as a code
//! submitted over HTTP.
//!
//! When a body holds several matches, the first in document order is taken
//! and the ambiguity is logged. This is deliberate: there is no reliable way
//! to pick the "most plausible" candidate.

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use super::types::{MailMessage, sender_address};
use crate::code::VerificationCode;
use crate::config::ExtractionConfig;
use crate::error::ConfigError;

/// A code together with the message it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedCode {
    pub code: VerificationCode,
    pub message_id: u64,
    pub received_at: DateTime<Utc>,
}

/// Applies sender and pattern matching to mail messages.
#[derive(Debug, Clone)]
pub struct CodeExtractor {
    expected_sender: String,
    pattern: Regex,
    code_length: usize,
}

impl CodeExtractor {
    pub fn new(
        expected_sender: &str,
        pattern: &str,
        code_length: usize,
    ) -> Result<Self, ConfigError> {
        let pattern = Regex::new(pattern).map_err(|e| ConfigError::InvalidValue {
            key: "RELAY_CODE_PATTERN".into(),
            message: e.to_string(),
        })?;
        Ok(Self {
            expected_sender: sender_address(expected_sender).to_string(),
            pattern,
            code_length,
        })
    }

    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ConfigError> {
        Self::new(&config.expected_sender, &config.pattern, config.code_length)
    }

    pub fn expected_sender(&self) -> &str {
        &self.expected_sender
    }

    /// Whether the message comes from the expected sender.
    pub fn sender_matches(&self, message: &MailMessage) -> bool {
        message
            .sender_address()
            .eq_ignore_ascii_case(&self.expected_sender)
    }

    /// Extract the code from one message, or `None` if it does not qualify.
    pub fn extract(&self, message: &MailMessage) -> Option<VerificationCode> {
        if !self.sender_matches(message) {
            debug!(message_id = message.id, "Skipping message from unexpected sender");
            return None;
        }

        let mut candidates = self
            .pattern
            .captures_iter(&message.body)
            .filter_map(|caps| caps.get(1).or_else(|| caps.get(0)))
            .filter_map(|m| match VerificationCode::parse(m.as_str(), self.code_length) {
                Ok(code) => Some(code),
                Err(e) => {
                    debug!(message_id = message.id, error = %e, "Pattern match is not a valid code");
                    None
                }
            });

        let first = candidates.next()?;
        let others = candidates.count();
        if others > 0 {
            warn!(
                message_id = message.id,
                candidates = others + 1,
                "Message body holds several candidate codes; taking the first in document order"
            );
        }
        Some(first)
    }

    /// Extract from the most recently received qualifying message.
    ///
    /// Messages are ranked by `received_at` descending, ties broken by `id`
    /// descending, so the input order never matters.
    pub fn extract_newest(&self, messages: &[MailMessage]) -> Option<ExtractedCode> {
        let mut ranked: Vec<&MailMessage> = messages.iter().collect();
        ranked.sort_by(|a, b| {
            b.received_at
                .cmp(&a.received_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        ranked.into_iter().find_map(|message| {
            self.extract(message).map(|code| ExtractedCode {
                code,
                message_id: message.id,
                received_at: message.received_at,
            })
        })
    }
}
