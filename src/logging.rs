use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use serde_json::json;
use std::fs::OpenOptions;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

pub struct AccessLogger {
    file: Option<Arc<Mutex<File>>>,
    format: AccessLogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLogFormat {
    Json,
    CommonLog,
    Combined,
}

impl AccessLogFormat {
    pub fn parse(name: &str) -> Self {
        match name {
            "json" => AccessLogFormat::Json,
            "common" => AccessLogFormat::CommonLog,
            _ => AccessLogFormat::Combined,
        }
    }
}

#[derive(Debug)]
pub struct LogEntry {
    pub request_id: Uuid,
    pub remote_addr: String,
    pub method: String,
    pub uri: String,
    pub status: u16,
    pub response_size: Option<u64>,
    pub duration_ms: f64,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    /// Prefix of the proxy rule that handled the request.
    pub route: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl AccessLogger {
    /// `None` when access logging is not configured. `-` logs to stdout.
    pub fn from_config(config: &LoggingConfig) -> Result<Option<Self>> {
        let format = AccessLogFormat::parse(&config.access_log_format);
        match config.access_log.as_deref() {
            None => Ok(None),
            Some("-") => Ok(Some(Self::new(None, format)?)),
            Some(path) => Ok(Some(Self::new(Some(path), format)?)),
        }
    }

    pub fn new(log_path: Option<&str>, format: AccessLogFormat) -> Result<Self> {
        let file = if let Some(path) = log_path {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open access log: {}", path))?;
            Some(Arc::new(Mutex::new(File::from_std(file))))
        } else {
            None
        };

        Ok(Self { file, format })
    }

    pub async fn log(&self, entry: LogEntry) {
        let log_line = self.format_entry(&entry);

        if let Some(ref file) = self.file {
            let mut file_guard = file.lock().await;
            if let Err(e) = file_guard.write_all(format!("{}\n", log_line).as_bytes()).await {
                error!("Failed to write access log: {}", e);
            }
            if let Err(e) = file_guard.flush().await {
                error!("Failed to flush access log: {}", e);
            }
        } else {
            println!("{}", log_line);
        }
    }

    pub fn format_entry(&self, entry: &LogEntry) -> String {
        let size = entry
            .response_size
            .map_or_else(|| "-".to_string(), |s| s.to_string());

        match self.format {
            AccessLogFormat::Json => json!({
                "timestamp": entry.timestamp.to_rfc3339(),
                "request_id": entry.request_id.to_string(),
                "remote_addr": entry.remote_addr,
                "method": entry.method,
                "uri": entry.uri,
                "status": entry.status,
                "response_size": entry.response_size,
                "duration_ms": entry.duration_ms,
                "user_agent": entry.user_agent,
                "referer": entry.referer,
                "route": entry.route,
            })
            .to_string(),
            AccessLogFormat::CommonLog => {
                format!(
                    "{} - - [{}] \"{} {} HTTP/1.1\" {} {}",
                    entry.remote_addr,
                    entry.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
                    entry.method,
                    entry.uri,
                    entry.status,
                    size
                )
            }
            AccessLogFormat::Combined => {
                format!(
                    "{} - - [{}] \"{} {} HTTP/1.1\" {} {} \"{}\" \"{}\"",
                    entry.remote_addr,
                    entry.timestamp.format("%d/%b/%Y:%H:%M:%S %z"),
                    entry.method,
                    entry.uri,
                    entry.status,
                    size,
                    entry.referer.as_deref().unwrap_or("-"),
                    entry.user_agent.as_deref().unwrap_or("-")
                )
            }
        }
    }
}
