//! Mailbox poller: one query against the Mailbox Query Service per call.
//!
//! No internal retry: a failed query is returned to the caller, which decides
//! whether another poll is worthwhile. Authentication and transport failures
//! stay distinguishable from "nothing yet" (`Ok(None)`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::extractor::{CodeExtractor, ExtractedCode};
use super::types::MailMessage;
use crate::error::MailboxError;

/// The Mailbox Query Service.
#[async_trait]
pub trait MailboxQuery: Send + Sync {
    /// Messages from `sender` received at or after `since`.
    ///
    /// With `ignore_window` set, `since` is ignored and all available
    /// messages from `sender` are returned.
    async fn query(
        &self,
        sender: &str,
        since: DateTime<Utc>,
        ignore_window: bool,
    ) -> Result<Vec<MailMessage>, MailboxError>;
}

/// Queries the mailbox and applies the extractor to the result.
pub struct MailboxPoller {
    mailbox: Arc<dyn MailboxQuery>,
    extractor: CodeExtractor,
}

impl MailboxPoller {
    pub fn new(mailbox: Arc<dyn MailboxQuery>, extractor: CodeExtractor) -> Self {
        Self { mailbox, extractor }
    }

    /// Return the newest qualifying code, `None` if there is none yet.
    pub async fn poll(
        &self,
        since: DateTime<Utc>,
        ignore_window: bool,
    ) -> Result<Option<ExtractedCode>, MailboxError> {
        let sender = self.extractor.expected_sender();
        let messages = self.mailbox.query(sender, since, ignore_window).await?;
        let fetched = messages.len();

        // The service may be coarser than we are (IMAP SINCE is day-granular).
        let in_window: Vec<MailMessage> = if ignore_window {
            messages
        } else {
            messages
                .into_iter()
                .filter(|m| m.received_at >= since)
                .collect()
        };

        if in_window.len() < fetched {
            debug!(
                dropped = fetched - in_window.len(),
                since = %since,
                "Dropped messages older than the poll window"
            );
        }

        match self.extractor.extract_newest(&in_window) {
            Some(found) => {
                info!(
                    message_id = found.message_id,
                    received_at = %found.received_at,
                    considered = in_window.len(),
                    "Verification code found in mailbox"
                );
                Ok(Some(found))
            }
            None => {
                if !in_window.is_empty() {
                    warn!(
                        considered = in_window.len(),
                        "Messages from sender present but none carried a code"
                    );
                }
                Ok(None)
            }
        }
    }
}
