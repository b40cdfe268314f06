//! Detection record keeping.
//!
//! A save only counts once its record has been written; the dispatcher
//! updates the per-camera dedup state after `write_record` succeeds.

use async_trait::async_trait;
use common::plates::DetectionRecord;
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Identifier assigned to a written record by the record keeper
pub type RecordId = String;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write detection log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record service request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("record service rejected the record: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait DetectionLog: Send + Sync {
    async fn write_record(&self, record: &DetectionRecord) -> Result<RecordId, RecordError>;
}

/// Appends one JSON object per line to a local file.
///
/// The id of a record is its 1-based line number.
pub struct JsonlDetectionLog {
    path: PathBuf,
    /// Lines in the file, counted on first write
    lines: Mutex<Option<u64>>,
}

impl JsonlDetectionLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lines: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> RecordError {
        RecordError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn count_lines(&self) -> Result<u64, RecordError> {
        let file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(self.io_error(e)),
        };
        let mut lines = BufReader::new(file).lines();
        let mut count = 0;
        while lines
            .next_line()
            .await
            .map_err(|e| self.io_error(e))?
            .is_some()
        {
            count += 1;
        }
        Ok(count)
    }
}

#[async_trait]
impl DetectionLog for JsonlDetectionLog {
    async fn write_record(&self, record: &DetectionRecord) -> Result<RecordId, RecordError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut lines = self.lines.lock().await;
        let written = match *lines {
            Some(n) => n,
            None => self.count_lines().await?,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(&line).await.map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))?;

        *lines = Some(written + 1);
        Ok((written + 1).to_string())
    }
}

#[derive(Debug, Deserialize)]
struct CreatedRecord {
    id: Option<serde_json::Value>,
}

/// POSTs records as JSON to a remote record service
pub struct HttpDetectionLog {
    client: Client,
    url: String,
}

impl HttpDetectionLog {
    pub fn new(url: impl Into<String>) -> Result<Self, RecordError> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DetectionLog for HttpDetectionLog {
    async fn write_record(&self, record: &DetectionRecord) -> Result<RecordId, RecordError> {
        let response = self.client.post(&self.url).json(record).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RecordError::Rejected(format!("{}: {}", status, body)));
        }

        let created: CreatedRecord = response.json().await?;
        match created.id {
            Some(serde_json::Value::String(id)) => Ok(id),
            Some(serde_json::Value::Number(id)) => Ok(id.to_string()),
            _ => Err(RecordError::Rejected("response carries no record id".to_string())),
        }
    }
}
