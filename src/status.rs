//! Worker status files and health probes
//!
//! Each long-running worker writes its status JSON atomically (temp file +
//! rename) on every meaningful transition and on a periodic heartbeat. The
//! ingest API reads the file back to answer health probes.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Heartbeat cadence for status files
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Worker lifecycle states reported in status files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Connecting,
    Authenticated,
    ChannelCreated,
    Subscribed,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Error,
    NotRunning,
    Unknown,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Connecting => "connecting",
            WorkerState::Authenticated => "authenticated",
            WorkerState::ChannelCreated => "channel_created",
            WorkerState::Subscribed => "subscribed",
            WorkerState::Running => "running",
            WorkerState::Degraded => "degraded",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Error => "error",
            WorkerState::NotRunning => "not_running",
            WorkerState::Unknown => "unknown",
        }
    }
}

/// Atomic status-file writer shared by a worker's tasks
pub struct StatusWriter {
    path: PathBuf,
    fields: Mutex<serde_json::Map<String, Value>>,
}

impl StatusWriter {
    pub fn new(path: PathBuf, service: &str, dry_run: bool) -> Self {
        let now = Utc::now().to_rfc3339();
        let mut fields = serde_json::Map::new();
        fields.insert("service".to_string(), json!(service));
        fields.insert("state".to_string(), json!(WorkerState::Starting.as_str()));
        fields.insert("updated_at".to_string(), json!(now));
        fields.insert("started_at".to_string(), json!(now));
        fields.insert("pid".to_string(), json!(std::process::id()));
        fields.insert("dry_run".to_string(), json!(dry_run));
        fields.insert("last_error".to_string(), json!(""));

        let writer = Self {
            path,
            fields: Mutex::new(fields),
        };
        writer.persist(true);
        writer
    }

    pub fn set_state(&self, state: WorkerState) {
        self.set("state", json!(state.as_str()));
    }

    pub fn set_error(&self, state: WorkerState, message: &str) {
        self.update(&[
            ("state", json!(state.as_str())),
            ("last_error", json!(message)),
        ]);
    }

    pub fn set(&self, key: &str, value: Value) {
        self.update(&[(key, value)]);
    }

    pub fn update(&self, entries: &[(&str, Value)]) {
        {
            let mut fields = self.fields.lock().expect("status fields poisoned");
            for (key, value) in entries {
                fields.insert((*key).to_string(), value.clone());
            }
            fields.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
        }
        self.persist(false);
    }

    pub fn increment(&self, key: &str, amount: u64) {
        {
            let mut fields = self.fields.lock().expect("status fields poisoned");
            let current = fields.get(key).and_then(Value::as_u64).unwrap_or(0);
            fields.insert(key.to_string(), json!(current + amount));
            fields.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
        }
        self.persist(false);
    }

    /// Lower a gauge-style counter, clamping at zero
    pub fn decrement_gauge(&self, key: &str, amount: u64) {
        {
            let mut fields = self.fields.lock().expect("status fields poisoned");
            let current = fields.get(key).and_then(Value::as_u64).unwrap_or(0);
            fields.insert(key.to_string(), json!(current.saturating_sub(amount)));
            fields.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
        }
        self.persist(false);
    }

    /// Touch `updated_at` so health probes see a live worker during silence
    pub fn heartbeat(&self) {
        self.update(&[]);
    }

    fn persist(&self, initial: bool) {
        let snapshot = {
            let fields = self.fields.lock().expect("status fields poisoned");
            Value::Object(fields.clone())
        };
        if let Err(err) = write_atomic(&self.path, &snapshot) {
            if initial {
                warn!(path = %self.path.display(), error = %err, "status file init write failed");
            } else {
                debug!(path = %self.path.display(), error = %err, "status file write failed");
            }
        }
    }
}

fn write_atomic(path: &Path, payload: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, serde_json::to_vec_pretty(payload).unwrap_or_default())?;
    std::fs::rename(&tmp_path, path)
}

/// Health verdict computed from a status file
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub stale_after_seconds: u64,
    pub status_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Value>,
}

/// Read a worker status file and compute liveness. A missing file is a
/// healthy=false report; an unreadable file is an IO error the caller maps
/// to 500.
pub fn read_health(
    path: &Path,
    stale_after_seconds: u64,
    now: DateTime<Utc>,
) -> std::io::Result<HealthReport> {
    if !path.exists() {
        return Ok(HealthReport {
            healthy: false,
            state: WorkerState::NotRunning.as_str().to_string(),
            age_seconds: None,
            reason: Some("status_file_missing".to_string()),
            stale_after_seconds,
            status_path: path.display().to_string(),
            status: None,
        });
    }

    let raw = std::fs::read_to_string(path)?;
    let payload: Value = serde_json::from_str(&raw)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;

    let state = payload
        .get("state")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let updated_at = payload
        .get("updated_at")
        .and_then(Value::as_str)
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|value| value.with_timezone(&Utc));

    let (age_seconds, fresh) = match updated_at {
        Some(updated) => {
            let age = (now - updated).num_milliseconds().max(0) as f64 / 1000.0;
            (Some((age * 100.0).round() / 100.0), age <= stale_after_seconds as f64)
        }
        None => (None, false),
    };
    let dead = matches!(state.as_str(), "error" | "stopped" | "not_running");

    Ok(HealthReport {
        healthy: fresh && !dead,
        state,
        age_seconds,
        reason: None,
        stale_after_seconds,
        status_path: path.display().to_string(),
        status: Some(payload),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker_status.json");
        let writer = StatusWriter::new(path.clone(), "test_worker", false);
        writer.set_state(WorkerState::Running);
        writer.increment("forwarded_events", 3);
        writer.increment("forwarded_events", 2);

        let report = read_health(&path, 90, Utc::now()).unwrap();
        assert!(report.healthy);
        assert_eq!(report.state, "running");
        let status = report.status.unwrap();
        assert_eq!(status["forwarded_events"], json!(5));
        assert_eq!(status["service"], json!("test_worker"));
    }

    #[test]
    fn test_missing_status_file_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let report = read_health(&dir.path().join("absent.json"), 90, Utc::now()).unwrap();
        assert!(!report.healthy);
        assert_eq!(report.state, "not_running");
        assert_eq!(report.reason.as_deref(), Some("status_file_missing"));
    }

    #[test]
    fn test_unreadable_status_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(read_health(&path, 90, Utc::now()).is_err());
    }

    #[test]
    fn test_stale_status_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.json");
        let writer = StatusWriter::new(path.clone(), "test_worker", false);
        writer.set_state(WorkerState::Running);

        let future = Utc::now() + chrono::Duration::seconds(600);
        let report = read_health(&path, 90, future).unwrap();
        assert!(!report.healthy);
        assert!(report.age_seconds.unwrap() > 90.0);
    }

    #[test]
    fn test_error_state_is_unhealthy_even_when_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("error.json");
        let writer = StatusWriter::new(path.clone(), "test_worker", false);
        writer.set_error(WorkerState::Error, "boom");

        let report = read_health(&path, 90, Utc::now()).unwrap();
        assert!(!report.healthy);
        assert_eq!(report.state, "error");
    }
}
