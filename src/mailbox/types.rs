//! Mail message type as returned by the Mailbox Query Service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fetched message. Immutable, and only held for the current poll cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailMessage {
    /// Mailbox-assigned identifier (IMAP UID). Breaks `received_at` ties.
    pub id: u64,
    /// Sender, either a bare address or `Name <address>`.
    pub sender: String,
    pub received_at: DateTime<Utc>,
    /// Plain-text body.
    pub body: String,
}

impl MailMessage {
    pub fn new(
        id: u64,
        sender: impl Into<String>,
        received_at: DateTime<Utc>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id,
            sender: sender.into(),
            received_at,
            body: body.into(),
        }
    }

    /// The bare address of the sender.
    pub fn sender_address(&self) -> &str {
        sender_address(&self.sender)
    }
}

/// Extract the address from `Name <address>`, or return the trimmed input.
pub fn sender_address(sender: &str) -> &str {
    let trimmed = sender.trim();
    if let (Some(open), Some(close)) = (trimmed.rfind('<'), trimmed.rfind('>'))
        && open < close
    {
        return trimmed[open + 1..close].trim();
    }
    trimmed
}
