//! Append-only chat log backed by a single JSON-lines file.
//!
//! The file is opened lazily in append mode on the first write and kept open
//! for the life of the process. All physical writes go through one async
//! mutex, so concurrent appends from different sessions never interleave
//! mid-line. Reads take the same lock and therefore see only whole records.

use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::chat::record::{self, ChatMessage};

/// Errors from the chat log store.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("chat log I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode chat record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Writer-side state guarded by the log mutex.
#[derive(Debug, Default)]
struct Writer {
    file: Option<File>,
    /// Timestamp of the last successful append; new records never go below it.
    last_timestamp: Option<DateTime<Utc>>,
}

/// The process-wide chat log.
#[derive(Debug)]
pub struct MessageLog {
    path: PathBuf,
    sync_writes: bool,
    writer: Mutex<Writer>,
}

impl MessageLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sync_writes: false,
            writer: Mutex::new(Writer::default()),
        }
    }

    /// Call `sync_data` after every append instead of leaving the data in
    /// OS buffers until the process exits.
    pub fn with_sync_writes(mut self, sync_writes: bool) -> Self {
        self.sync_writes = sync_writes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamp a message with the current server time and append it.
    ///
    /// Returns the record as written. On failure nothing is partially
    /// retained in memory; the file handle is dropped and reopened on the
    /// next append. A reopened file that ends mid-line (a crash or a failed
    /// write) gets a newline first, so the new record starts on its own line.
    pub async fn append(&self, name: &str, content: &str) -> Result<ChatMessage, LogError> {
        let mut writer = self.writer.lock().await;

        let now = Utc::now();
        let received_at = match writer.last_timestamp {
            Some(last) if last > now => last,
            _ => now,
        };
        let message = ChatMessage::new(name, content, received_at);
        let line = record::encode_line(&message)?;

        let (mut file, torn_tail) = match writer.file.take() {
            Some(file) => (file, false),
            None => self.open_for_append().await?,
        };
        let bytes = if torn_tail {
            format!("\n{}", line)
        } else {
            line
        };
        self.write_line(&mut file, bytes.as_bytes()).await?;

        writer.file = Some(file);
        writer.last_timestamp = Some(received_at);
        Ok(message)
    }

    /// Read every record from the start of the file, in append order.
    ///
    /// A missing file is an empty history. Blank lines are skipped, and so
    /// are lines that fail to parse (each one is logged).
    pub async fn load_all(&self) -> Result<Vec<ChatMessage>, LogError> {
        let bytes = {
            let _writer = self.writer.lock().await;
            match tokio::fs::read(&self.path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(source) => {
                    return Err(LogError::Io {
                        path: self.path.clone(),
                        source,
                    })
                }
            }
        };

        Ok(parse_records(&String::from_utf8_lossy(&bytes)))
    }

    /// Open the log in append mode. The flag is true when the existing file
    /// does not end with a newline.
    async fn open_for_append(&self) -> Result<(File, bool), LogError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(source))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| self.io_error(source))?;

        let torn_tail = self
            .ends_mid_line()
            .await
            .map_err(|source| self.io_error(source))?;
        if torn_tail {
            tracing::warn!(
                path = %self.path.display(),
                "Chat log ends with an unterminated line, starting a new one"
            );
        }

        tracing::debug!(path = %self.path.display(), "Opened chat log for append");
        Ok((file, torn_tail))
    }

    async fn ends_mid_line(&self) -> std::io::Result<bool> {
        let mut reader = File::open(&self.path).await?;
        if reader.metadata().await?.len() == 0 {
            return Ok(false);
        }
        reader.seek(std::io::SeekFrom::End(-1)).await?;
        let mut last = [0u8; 1];
        reader.read_exact(&mut last).await?;
        Ok(last[0] != b'\n')
    }

    async fn write_line(&self, file: &mut File, line: &[u8]) -> Result<(), LogError> {
        file.write_all(line)
            .await
            .map_err(|source| self.io_error(source))?;
        // tokio's File completes writes in the background; flush so a
        // following load_all sees this record.
        file.flush().await.map_err(|source| self.io_error(source))?;
        if self.sync_writes {
            file.sync_data()
                .await
                .map_err(|source| self.io_error(source))?;
        }
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> LogError {
        LogError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn parse_records(data: &str) -> Vec<ChatMessage> {
    let mut records = Vec::new();
    for (index, line) in data.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match record::decode_line(line) {
            Ok(message) => records.push(message),
            Err(e) => {
                tracing::warn!(
                    line = index + 1,
                    error = %e,
                    "Skipping malformed chat log record"
                );
            }
        }
    }
    records
}
