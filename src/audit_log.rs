use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// One JSONL line per gateway request. Correlation data only, request and
/// response bodies are never captured.
#[derive(Clone, Debug, Serialize)]
pub struct AuditRecord {
    pub ts_start_ms: u128,
    pub ts_end_ms: u128,
    pub request_id: String,
    pub route: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

#[derive(Clone)]
pub struct AuditLogger {
    sender: mpsc::Sender<AuditRecord>,
}

impl AuditLogger {
    pub fn new(base_path: String, max_file_bytes: u64) -> Result<Self, String> {
        let (tx, rx) = mpsc::channel::<AuditRecord>(256);
        tokio::spawn(write_loop(base_path, max_file_bytes, rx));
        Ok(Self { sender: tx })
    }

    pub async fn push(&self, record: AuditRecord) {
        let _ = self.sender.send(record).await;
    }
}

async fn write_loop(base_path: String, max_file_bytes: u64, mut rx: mpsc::Receiver<AuditRecord>) {
    let mut current_path = build_log_path(&base_path);
    let mut file = match open_log_file(&current_path).await {
        Ok(file) => file,
        Err(err) => {
            tracing::error!("audit log open error: {}", err);
            return;
        }
    };
    let mut current_size = file.metadata().await.map(|m| m.len()).unwrap_or(0);

    while let Some(record) = rx.recv().await {
        let Ok(line) = serde_json::to_string(&record) else {
            continue;
        };
        let projected = current_size + line.len() as u64 + 1;
        if projected > max_file_bytes {
            current_path = build_log_path(&base_path);
            match open_log_file(&current_path).await {
                Ok(new_file) => {
                    file = new_file;
                    current_size = 0;
                }
                Err(err) => {
                    tracing::error!("audit log rotate error: {}", err);
                }
            }
        }
        if file.write_all(line.as_bytes()).await.is_err()
            || file.write_all(b"\n").await.is_err()
        {
            tracing::error!("audit log write error");
            continue;
        }
        current_size += line.len() as u64 + 1;
    }
}

pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn build_log_path(base: &str) -> String {
    let ts = now_ms();
    if let Some(stripped) = base.strip_suffix(".jsonl") {
        format!("{}.{}.jsonl", stripped, ts)
    } else {
        format!("{}.{}", base, ts)
    }
}

async fn open_log_file(path: &str) -> Result<tokio::fs::File, std::io::Error> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}
