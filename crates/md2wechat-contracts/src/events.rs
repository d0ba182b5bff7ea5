use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RunStarted,
    ImageResolved,
    UploadAttemptFailed,
    ImageUploaded,
    DraftCreated,
    ImageGenerated,
    RunFailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::ImageResolved => "image_resolved",
            Self::UploadAttemptFailed => "upload_attempt_failed",
            Self::ImageUploaded => "image_uploaded",
            Self::DraftCreated => "draft_created",
            Self::ImageGenerated => "image_generated",
            Self::RunFailed => "run_failed",
        }
    }
}

/// Append-only `events.jsonl` for one CLI run.
///
/// Every line carries `type`, `run_id` and `ts`; those keys are reserved and
/// win over payload keys of the same name. A disabled log accepts events and
/// writes nothing.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<EventLogInner>,
}

#[derive(Debug)]
struct EventLogInner {
    path: Option<PathBuf>,
    run_id: String,
    lock: Mutex<()>,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self::build(Some(path.into()), run_id.into())
    }

    /// Opens a log with a fresh random run id, or a disabled one for `None`.
    pub fn open(path: Option<&Path>) -> Self {
        Self::build(
            path.map(Path::to_path_buf),
            uuid::Uuid::new_v4().to_string(),
        )
    }

    pub fn disabled() -> Self {
        Self::build(None, String::new())
    }

    fn build(path: Option<PathBuf>, run_id: String) -> Self {
        Self {
            inner: Arc::new(EventLogInner {
                path,
                run_id,
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, kind: EventKind, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = payload;
        event.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));

        let Some(path) = self.inner.path.as_deref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
