//! Security audit log: newline-delimited JSON records shipped through
//! a bounded channel to a dedicated writer thread, so request handling
//! never blocks on disk. Files rotate by size.
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread::JoinHandle;

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct AuditParams {
    /// Where audit files land. When unset, records go to the
    /// diagnostic log instead.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// How many bytes to allow per file segment.
    #[serde(default = "AuditParams::default_max_file_size")]
    pub max_file_size: u64,
    /// Maximum number of outstanding records before submission blocks;
    /// keeps a runaway burst from eating the heap.
    #[serde(default = "AuditParams::default_back_pressure")]
    pub back_pressure: usize,
}

impl AuditParams {
    fn default_max_file_size() -> u64 {
        1_000_000_000
    }
    fn default_back_pressure() -> usize {
        128_000
    }
}

impl Default for AuditParams {
    fn default() -> Self {
        Self {
            log_dir: None,
            max_file_size: Self::default_max_file_size(),
            back_pressure: Self::default_back_pressure(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    AuthenticationSuccess,
    AuthenticationFailure,
    RateLimitExceeded,
    IpBlocked,
    Validation,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub client_ip: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub request_path: String,
    pub request_method: String,
    pub status_code: u16,
    pub details: serde_json::Value,
}

enum LogCommand {
    Record(Box<AuditRecord>),
    Terminate,
}

pub struct AuditLogger {
    sender: Option<flume::Sender<LogCommand>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLogger {
    pub fn init(params: &AuditParams) -> anyhow::Result<Self> {
        let Some(log_dir) = params.log_dir.clone() else {
            return Ok(Self {
                sender: None,
                thread: Mutex::new(None),
            });
        };

        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("creating audit log directory {}", log_dir.display()))?;

        let (sender, receiver) = flume::bounded(params.back_pressure);
        let max_file_size = params.max_file_size;
        let thread = std::thread::Builder::new()
            .name("audit-writer".to_string())
            .spawn(move || writer_thread(log_dir, max_file_size, receiver))
            .context("spawning audit writer thread")?;

        Ok(Self {
            sender: Some(sender),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub async fn log(&self, record: AuditRecord) {
        match &self.sender {
            Some(sender) => {
                if let Err(err) = sender.send_async(LogCommand::Record(Box::new(record))).await
                {
                    tracing::error!("failed to submit audit record: {err}");
                }
            }
            None => match serde_json::to_string(&record) {
                Ok(json) => tracing::info!(target: "audit", "{json}"),
                Err(err) => tracing::error!("failed to serialize audit record: {err}"),
            },
        }
    }

    /// Flush and stop the writer. Idempotent.
    pub fn shutdown(&self) {
        if let Some(sender) = &self.sender {
            sender.send(LogCommand::Terminate).ok();
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            thread.join().ok();
        }
    }
}

struct OpenedFile {
    file: File,
    name: PathBuf,
    written: u64,
}

fn writer_thread(log_dir: PathBuf, max_file_size: u64, receiver: flume::Receiver<LogCommand>) {
    let mut file: Option<OpenedFile> = None;

    fn do_record(
        log_dir: &PathBuf,
        max_file_size: u64,
        file: &mut Option<OpenedFile>,
        record: &AuditRecord,
    ) -> anyhow::Result<()> {
        if file.is_none() {
            let now = Utc::now();
            let name = log_dir.join(format!("audit-{}.log", now.format("%Y%m%d-%H%M%S")));
            let f = std::fs::OpenOptions::new()
                .append(true)
                .create(true)
                .open(&name)
                .with_context(|| format!("open audit log file {name:?}"))?;
            file.replace(OpenedFile {
                file: f,
                name,
                written: 0,
            });
        }

        let mut need_rotate = false;
        if let Some(file) = file.as_mut() {
            let mut json = serde_json::to_string(record).context("serializing audit record")?;
            json.push('\n');
            file.file
                .write_all(json.as_bytes())
                .with_context(|| format!("writing record to {}", file.name.display()))?;
            file.written += json.len() as u64;
            need_rotate = file.written >= max_file_size;
        }

        if need_rotate {
            file.take();
        }
        Ok(())
    }

    while let Ok(cmd) = receiver.recv() {
        match cmd {
            LogCommand::Terminate => break,
            LogCommand::Record(record) => {
                if let Err(err) = do_record(&log_dir, max_file_size, &mut file, &record) {
                    tracing::error!("failed to write audit record: {err:#}");
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "mxcheckd-audit-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::SystemTime::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ))
    }

    fn record(event_type: AuditEventType) -> AuditRecord {
        AuditRecord {
            timestamp: Utc::now(),
            event_type,
            client_ip: "192.0.2.1".to_string(),
            api_key: Some("key-123".to_string()),
            request_path: "/validate".to_string(),
            request_method: "POST".to_string(),
            status_code: 200,
            details: serde_json::json!({"email": "user@example.com"}),
        }
    }

    #[tokio::test]
    async fn records_land_as_json_lines() {
        let dir = scratch_dir("lines");
        let logger = AuditLogger::init(&AuditParams {
            log_dir: Some(dir.clone()),
            ..AuditParams::default()
        })
        .unwrap();

        logger.log(record(AuditEventType::Validation)).await;
        logger.log(record(AuditEventType::RateLimitExceeded)).await;
        logger.shutdown();

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let content = std::fs::read_to_string(entries.pop().unwrap()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.event_type, AuditEventType::Validation);
        assert_eq!(parsed.client_ip, "192.0.2.1");

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn rotates_by_size() {
        let dir = scratch_dir("rotate");
        let logger = AuditLogger::init(&AuditParams {
            log_dir: Some(dir.clone()),
            max_file_size: 64,
            ..AuditParams::default()
        })
        .unwrap();

        logger.log(record(AuditEventType::Validation)).await;
        // sleep past one second so the rotated file gets a fresh name
        std::thread::sleep(std::time::Duration::from_millis(1100));
        logger.log(record(AuditEventType::Validation)).await;
        logger.shutdown();

        let entries = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(entries, 2);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn event_types_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&AuditEventType::AuthenticationFailure).unwrap(),
            r#""authentication_failure""#
        );
        assert_eq!(
            serde_json::to_string(&AuditEventType::IpBlocked).unwrap(),
            r#""ip_blocked""#
        );
    }
}
