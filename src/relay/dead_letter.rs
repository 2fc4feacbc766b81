//! Dead letters: relays that exhausted their attempt budget.
//!
//! The relay only builds the record and hands it to a [`DeadLetterSink`];
//! where it ends up is the sink's business.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tokio::io::AsyncWriteExt;
use tracing::error;
use uuid::Uuid;

use super::forwarder::RelayAttempt;
use crate::code::VerificationCode;

/// What the relay was trying to deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterPayload {
    /// Written out in full: the record exists for manual follow-up.
    #[serde(serialize_with = "serialize_code")]
    pub code: VerificationCode,
    pub target_url: String,
}

fn serialize_code<S: Serializer>(code: &VerificationCode, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(code.expose_secret())
}

/// A permanently failed relay, with every attempt that was made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub payload: DeadLetterPayload,
    pub failure_reason: String,
    pub attempt_history: Vec<RelayAttempt>,
}

impl DeadLetterRecord {
    pub fn new(
        payload: DeadLetterPayload,
        failure_reason: impl Into<String>,
        attempt_history: Vec<RelayAttempt>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at,
            payload,
            failure_reason: failure_reason.into(),
            attempt_history,
        }
    }
}

/// Destination for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, record: &DeadLetterRecord) -> std::io::Result<()>;
}

/// Logs dead letters at error level. The code value is not logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDeadLetterSink;

#[async_trait]
impl DeadLetterSink for TracingDeadLetterSink {
    async fn record(&self, record: &DeadLetterRecord) -> std::io::Result<()> {
        let statuses: Vec<String> = record
            .attempt_history
            .iter()
            .map(|a| {
                a.http_status
                    .map_or_else(|| "transport".to_string(), |s| s.to_string())
            })
            .collect();
        error!(
            dead_letter_id = %record.id,
            target_url = %record.payload.target_url,
            attempts = record.attempt_history.len(),
            statuses = %statuses.join(","),
            reason = %record.failure_reason,
            "Relay dead-lettered"
        );
        Ok(())
    }
}

/// Appends each dead letter as one JSON line.
#[derive(Debug, Clone)]
pub struct JsonlDeadLetterSink {
    path: PathBuf,
}

impl JsonlDeadLetterSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DeadLetterSink for JsonlDeadLetterSink {
    async fn record(&self, record: &DeadLetterRecord) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        error!(
            dead_letter_id = %record.id,
            path = %self.path.display(),
            attempts = record.attempt_history.len(),
            "Relay dead-lettered to file"
        );
        Ok(())
    }
}

/// Keeps dead letters in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryDeadLetterSink {
    records: Arc<Mutex<Vec<DeadLetterRecord>>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, record: &DeadLetterRecord) -> std::io::Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
