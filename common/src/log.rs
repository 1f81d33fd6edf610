use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// A structured record for the optional event sink.
#[derive(Clone, Debug, Serialize)]
pub struct Record {
    pub server: String,
    pub log: String,
    pub timestamp: DateTime<Utc>,
}

/// Fan-out target for structured instance events.
///
/// Emission is fire-and-forget: implementations log their own failures and
/// must never fail the caller.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn emit(&self, record: Record);
}

/// Append-only writer for an instance `app.log`, with optional fan-out of
/// every line to a structured sink.
#[derive(Clone)]
pub struct InstanceLogger {
    path: PathBuf,
    server: String,
    sink: Option<Arc<dyn LogSink>>,
}

impl InstanceLogger {
    pub fn new(path: PathBuf, server: String, sink: Option<Arc<dyn LogSink>>) -> Self {
        Self { path, server, sink }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one timestamped line. Write failures are reported through
    /// tracing rather than bubbled up: a broken log file must not take a
    /// deployment down with it.
    pub async fn append(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        let timestamp = Utc::now();
        let line = format_line(timestamp, message);

        let result = async {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await
        }
        .await;

        if let Err(error) = result {
            tracing::warn!(
                path = %self.path.display(),
                %error,
                "failed to append to instance log"
            );
        }

        if let Some(sink) = &self.sink {
            sink.emit(Record {
                server: self.server.clone(),
                log: message.to_string(),
                timestamp,
            })
            .await;
        }
    }
}

pub fn format_line(timestamp: DateTime<Utc>, message: &str) -> String {
    format!(
        "[{}] {message}\n",
        timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
    )
}

/// Read at most the trailing `max_bytes` of a log file. Returns an empty
/// string when the file does not exist yet.
pub async fn read_tail(path: &Path, max_bytes: u64) -> std::io::Result<String> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(err) => return Err(err),
    };

    let len = file.metadata().await?.len();
    if len > max_bytes {
        file.seek(SeekFrom::End(-(max_bytes as i64))).await?;
    }

    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;

    Ok(String::from_utf8_lossy(&buf).into_owned())
}
