//! Atomic status management for `status.json`.
//!
//! All writes go through a temp-file + rename under an in-process lock, so
//! clients never observe a half-written document. Clients should wait for
//! `server_status == "ready"` before issuing requests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Server lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Process started, still initializing.
    Starting,
    /// Transport is listening and ready for requests.
    Ready,
    /// Graceful shutdown in progress.
    Stopping,
    /// Stopped normally.
    Stopped,
    /// Failed due to config/initialization error.
    Error,
    /// Terminated unexpectedly (detected by the next startup).
    Crashed,
}

impl ServerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Crashed => "crashed",
        }
    }

    /// States that indicate a live server owns the workdir.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Stopping)
    }
}

/// Project scan states (RAG indexing progress).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Idle,
    Scanning,
    Done,
    Error,
    Canceled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Done => "done",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }
}

/// Thread-safe writer for the project `status.json`.
pub struct StatusManager {
    path: PathBuf,
    lock: Mutex<()>,
}

impl StatusManager {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    fn read_doc(&self) -> BTreeMap<String, Value> {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    fn write_doc(&self, doc: &BTreeMap<String, Value>) {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("tmp");
            let text = serde_json::to_string_pretty(doc).unwrap_or_else(|_| "{}".into());
            std::fs::write(&tmp, text)?;
            let file = std::fs::File::open(&tmp)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        };
        if let Err(e) = write() {
            // Best-effort at this layer; the server must not die on status I/O.
            tracing::warn!(error = %e, path = %self.path.display(), "Failed to write status.json");
        }
    }

    /// Atomically update the server-status fields.
    pub fn update_server_status(
        &self,
        status: ServerStatus,
        pid: Option<u32>,
        port: Option<u16>,
        error: Option<&str>,
    ) {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut doc = self.read_doc();
        let now = Utc::now().to_rfc3339();
        doc.insert("server_status".into(), json!(status.as_str()));
        doc.insert("server_updated_at".into(), json!(now));

        match status {
            ServerStatus::Starting => {
                doc.insert("server_started_at".into(), json!(now));
                if let Some(pid) = pid {
                    doc.insert("server_pid".into(), json!(pid));
                }
                if let Some(port) = port {
                    doc.insert("port".into(), json!(port));
                }
                doc.remove("server_error");
            }
            ServerStatus::Error | ServerStatus::Crashed => {
                // Keep the failure reason, drop liveness fields.
                doc.remove("server_pid");
                doc.remove("port");
                if let Some(error) = error {
                    doc.insert("server_error".into(), json!(error));
                }
            }
            ServerStatus::Stopped => {
                doc.remove("server_pid");
                doc.remove("port");
                doc.remove("server_started_at");
                doc.remove("server_error");
            }
            ServerStatus::Ready | ServerStatus::Stopping => {
                doc.remove("server_error");
            }
        }

        self.write_doc(&doc);
    }

    /// Atomically update the scan-status fields.
    pub fn update_scan_status(
        &self,
        status: ScanStatus,
        progress: Option<u8>,
        error: Option<&str>,
    ) {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut doc = self.read_doc();
        let now = Utc::now().to_rfc3339();
        doc.insert("scan_status".into(), json!(status.as_str()));
        doc.insert("scan_updated_at".into(), json!(now));
        if status == ScanStatus::Scanning && !doc.contains_key("scan_started_at") {
            doc.insert("scan_started_at".into(), json!(now));
        }
        if let Some(progress) = progress {
            doc.insert("scan_progress".into(), json!(progress.min(100)));
        }
        match error {
            Some(error) => {
                doc.insert("error".into(), json!(error));
            }
            None => {
                doc.remove("error");
            }
        }
        self.write_doc(&doc);
    }

    /// Record config validation results.
    pub fn update_config_status(&self, valid: bool, errors: &[String]) {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut doc = self.read_doc();
        doc.insert("config_valid".into(), json!(valid));
        doc.insert("config_errors".into(), json!(errors));
        self.write_doc(&doc);
    }

    /// Read the current document.
    pub fn get_status(&self) -> BTreeMap<String, Value> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        self.read_doc()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn starting_records_pid_and_port() {
        let dir = TempDir::new().unwrap();
        let mgr = StatusManager::new(dir.path().join("status.json"));
        mgr.update_server_status(ServerStatus::Starting, Some(4242), Some(8765), None);

        let doc = mgr.get_status();
        assert_eq!(doc["server_status"], "starting");
        assert_eq!(doc["server_pid"], 4242);
        assert_eq!(doc["port"], 8765);
        assert!(doc.contains_key("server_started_at"));
    }

    #[test]
    fn stopped_clears_liveness_fields() {
        let dir = TempDir::new().unwrap();
        let mgr = StatusManager::new(dir.path().join("status.json"));
        mgr.update_server_status(ServerStatus::Starting, Some(1), Some(8765), None);
        mgr.update_server_status(ServerStatus::Ready, None, None, None);
        mgr.update_server_status(ServerStatus::Stopped, None, None, None);

        let doc = mgr.get_status();
        assert_eq!(doc["server_status"], "stopped");
        assert!(!doc.contains_key("server_pid"));
        assert!(!doc.contains_key("port"));
        assert!(!doc.contains_key("server_error"));
    }

    #[test]
    fn error_keeps_reason_drops_pid() {
        let dir = TempDir::new().unwrap();
        let mgr = StatusManager::new(dir.path().join("status.json"));
        mgr.update_server_status(ServerStatus::Starting, Some(1), Some(8765), None);
        mgr.update_server_status(ServerStatus::Error, None, None, Some("bad config"));

        let doc = mgr.get_status();
        assert_eq!(doc["server_status"], "error");
        assert_eq!(doc["server_error"], "bad config");
        assert!(!doc.contains_key("server_pid"));
    }

    #[test]
    fn scan_fields_coexist_with_server_fields() {
        let dir = TempDir::new().unwrap();
        let mgr = StatusManager::new(dir.path().join("status.json"));
        mgr.update_server_status(ServerStatus::Ready, None, None, None);
        mgr.update_scan_status(ScanStatus::Scanning, Some(40), None);

        let doc = mgr.get_status();
        assert_eq!(doc["server_status"], "ready");
        assert_eq!(doc["scan_status"], "scanning");
        assert_eq!(doc["scan_progress"], 40);
    }

    #[test]
    fn config_errors_are_recorded() {
        let dir = TempDir::new().unwrap();
        let mgr = StatusManager::new(dir.path().join("status.json"));
        mgr.update_config_status(false, &["missing key".into()]);

        let doc = mgr.get_status();
        assert_eq!(doc["config_valid"], false);
        assert_eq!(doc["config_errors"][0], "missing key");
    }
}
