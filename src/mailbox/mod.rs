//! Mailbox side of the relay: message types, code extraction, polling.

pub mod extractor;
pub mod imap;
pub mod poller;
pub mod types;

pub use extractor::{CodeExtractor, ExtractedCode};
pub use imap::{ImapConfig, ImapMailbox};
pub use poller::{MailboxPoller, MailboxQuery};
pub use types::MailMessage;
