//! IMAP-backed Mailbox Query Service.
//!
//! Raw IMAP over rustls, blocking, run inside `spawn_blocking`. One
//! connection per query: LOGIN, SELECT, UID SEARCH, UID FETCH each hit,
//! LOGOUT. Messages are read with `BODY.PEEK` so their flags are untouched.
//!
//! A message's receipt time is the server's INTERNALDATE. The sender-written
//! `Date:` header is only a fallback, and a message with neither is treated
//! as the oldest possible.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::poller::MailboxQuery;
use super::types::MailMessage;
use crate::error::MailboxError;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// IMAP mailbox configuration.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub folder: String,
}

impl ImapConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAILBOX_IMAP_HOST` is not set (mailbox disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("MAILBOX_IMAP_HOST").ok()?;

        let port: u16 = std::env::var("MAILBOX_IMAP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(993);

        let username = std::env::var("MAILBOX_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("MAILBOX_PASSWORD").unwrap_or_default());
        let folder = std::env::var("MAILBOX_FOLDER").unwrap_or_else(|_| "INBOX".to_string());

        Some(Self {
            host,
            port,
            username,
            password,
            folder,
        })
    }
}

/// Mailbox Query Service over IMAP.
pub struct ImapMailbox {
    config: ImapConfig,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailboxQuery for ImapMailbox {
    async fn query(
        &self,
        sender: &str,
        since: DateTime<Utc>,
        ignore_window: bool,
    ) -> Result<Vec<MailMessage>, MailboxError> {
        let config = self.config.clone();
        let criteria = search_criteria(sender, since, ignore_window);
        tokio::task::spawn_blocking(move || fetch_matching(&config, &criteria))
            .await
            .map_err(|e| MailboxError::Transport(format!("IMAP task failed: {e}")))?
    }
}

/// Build the `UID SEARCH` criteria.
///
/// IMAP `SINCE` has day granularity; the poller filters to the exact instant.
pub fn search_criteria(sender: &str, since: DateTime<Utc>, ignore_window: bool) -> String {
    let sender: String = sender.chars().filter(|c| *c != '"' && *c != '\\').collect();
    if ignore_window {
        format!("FROM \"{sender}\"")
    } else {
        format!("FROM \"{sender}\" SINCE {}", since.format("%d-%b-%Y"))
    }
}

/// Parse `* SEARCH 4 9 12` lines into UIDs.
pub fn parse_search_response(lines: &[String]) -> Vec<u64> {
    lines
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2))
        .filter_map(|uid| uid.parse().ok())
        .collect()
}

/// Pull `INTERNALDATE "02-Mar-2026 10:05:00 +0000"` out of a FETCH response.
///
/// Only the untagged FETCH line and the closing line (before the tagged
/// status) are searched; message body lines are never trusted.
pub fn parse_internal_date(lines: &[String]) -> Option<DateTime<Utc>> {
    let closing = lines
        .len()
        .checked_sub(2)
        .filter(|&i| i > 0)
        .and_then(|i| lines.get(i));
    lines.first().into_iter().chain(closing).find_map(|line| {
        let start = line.find("INTERNALDATE \"")? + "INTERNALDATE \"".len();
        let len = line[start..].find('"')?;
        let value = line[start..start + len].trim();
        DateTime::parse_from_str(value, "%d-%b-%Y %H:%M:%S %z")
            .ok()
            .map(|d| d.with_timezone(&Utc))
    })
}

/// Convert a raw RFC 822 message into a `MailMessage`.
///
/// `internal_date` is the server's receipt time when the FETCH returned one.
pub fn parse_message(
    uid: u64,
    raw: &[u8],
    internal_date: Option<DateTime<Utc>>,
) -> Option<MailMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into());

    let received_at = internal_date
        .or_else(|| {
            parsed
                .date()
                .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        })
        .unwrap_or_else(|| {
            debug!(uid, "Message has no receipt time; ranking it oldest");
            DateTime::UNIX_EPOCH
        });

    Some(MailMessage {
        id: uid,
        sender,
        received_at,
        body: message_text(&parsed),
    })
}

fn message_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

/// Strip HTML tags and normalize whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => {
                in_tag = true;
                result.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// A logged-in-or-not IMAP connection with a tag counter.
struct ImapConnection {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapConnection {
    fn connect(config: &ImapConfig) -> Result<Self, MailboxError> {
        let tcp = TcpStream::connect((config.host.as_str(), config.port)).map_err(transport)?;
        tcp.set_read_timeout(Some(IO_TIMEOUT)).map_err(transport)?;
        tcp.set_write_timeout(Some(IO_TIMEOUT)).map_err(transport)?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = ServerName::try_from(config.host.clone())
            .map_err(|e| MailboxError::Transport(format!("invalid IMAP host: {e}")))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| MailboxError::Transport(format!("TLS setup failed: {e}")))?;

        let mut connection = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
        };
        let greeting = connection.read_line()?;
        if !greeting.starts_with("* OK") && !greeting.starts_with("* PREAUTH") {
            return Err(MailboxError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.trim_end()
            )));
        }
        Ok(connection)
    }

    fn read_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => return Err(MailboxError::Transport("IMAP connection closed".into())),
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => return Err(transport(e)),
            }
        }
    }

    /// Send a command and collect response lines up to and including the tagged one.
    fn command(&mut self, cmd: &str) -> Result<Vec<String>, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        self.tls
            .write_all(format!("{tag} {cmd}\r\n").as_bytes())
            .map_err(transport)?;
        self.tls.flush().map_err(transport)?;

        let tagged = format!("{tag} ");
        let mut lines = Vec::new();
        loop {
            let line = self.read_line()?;
            let done = line.starts_with(&tagged);
            lines.push(line);
            if done {
                return Ok(lines);
            }
        }
    }

    fn login(&mut self, config: &ImapConfig) -> Result<(), MailboxError> {
        let username = quote(&config.username);
        let password = quote(config.password.expose_secret());
        let resp = self.command(&format!("LOGIN {username} {password}"))?;
        if tagged_ok(&resp) {
            Ok(())
        } else {
            Err(MailboxError::Auth(format!(
                "LOGIN rejected for {}",
                config.username
            )))
        }
    }
}

/// Log in, search, fetch. Blocking.
fn fetch_matching(config: &ImapConfig, criteria: &str) -> Result<Vec<MailMessage>, MailboxError> {
    let mut conn = ImapConnection::connect(config)?;
    conn.login(config)?;

    let select = conn.command(&format!("SELECT {}", quote(&config.folder)))?;
    if !tagged_ok(&select) {
        return Err(MailboxError::Protocol(format!(
            "cannot select folder {}",
            config.folder
        )));
    }

    let search = conn.command(&format!("UID SEARCH {criteria}"))?;
    if !tagged_ok(&search) {
        return Err(MailboxError::Protocol("UID SEARCH failed".into()));
    }
    let uids = parse_search_response(&search);
    debug!(hits = uids.len(), "IMAP search complete");

    let mut messages = Vec::with_capacity(uids.len());
    for uid in uids {
        let resp = conn.command(&format!("UID FETCH {uid} (INTERNALDATE BODY.PEEK[])"))?;
        if !tagged_ok(&resp) {
            debug!(uid, "IMAP fetch failed; skipping message");
            continue;
        }
        // Drop the untagged FETCH header, the closing ")" and the tagged status line.
        let raw: String = resp
            .iter()
            .skip(1)
            .take(resp.len().saturating_sub(3))
            .cloned()
            .collect();
        let internal_date = parse_internal_date(&resp);
        if let Some(message) = parse_message(uid, raw.as_bytes(), internal_date) {
            messages.push(message);
        }
    }

    // Best effort; the data is already in hand.
    let _ = conn.command("LOGOUT");

    Ok(messages)
}

fn tagged_ok(lines: &[String]) -> bool {
    lines
        .last()
        .and_then(|l| l.split_whitespace().nth(1))
        .is_some_and(|status| status.eq_ignore_ascii_case("OK"))
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn transport(e: std::io::Error) -> MailboxError {
    MailboxError::Transport(e.to_string())
}
