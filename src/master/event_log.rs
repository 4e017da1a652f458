//! Durable event log of mbatchd.
//!
//! A pipeline stage counts as committed only once its event is in the log,
//! so every append must reach stable storage before returning.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SbdError};
use crate::protocol::message::JobStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Dispatch {
        job_id: i64,
        host: String,
    },
    StartAccept {
        job_id: i64,
        pid: i32,
        pgid: i32,
    },
    Execute {
        job_id: i64,
        exec_username: String,
        exec_cwd: String,
    },
    Finish {
        job_id: i64,
        status: JobStatus,
        exit_status: i32,
    },
    StartFail {
        job_id: i64,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> i64 {
        match self {
            JobEvent::Dispatch { job_id, .. }
            | JobEvent::StartAccept { job_id, .. }
            | JobEvent::Execute { job_id, .. }
            | JobEvent::Finish { job_id, .. }
            | JobEvent::StartFail { job_id } => *job_id,
        }
    }
}

/// One line of the log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub time: DateTime<Utc>,
    pub event: JobEvent,
}

pub trait EventLog: Send {
    /// Appends `event` durably.
    fn append(&mut self, event: &JobEvent) -> Result<()>;
}

/// JSON-lines log file, fsynced on every append.
#[derive(Debug)]
pub struct FileEventLog {
    path: PathBuf,
    file: File,
}

impl FileEventLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every record back, in append order.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<EventRecord>> {
        let text = std::fs::read_to_string(path)?;
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(SbdError::from))
            .collect()
    }
}

impl EventLog for FileEventLog {
    fn append(&mut self, event: &JobEvent) -> Result<()> {
        let record = EventRecord {
            time: Utc::now(),
            event: event.clone(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    events: Vec<JobEvent>,
    failing: bool,
}

/// In-memory log whose handle can be cloned and told to fail.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventLog {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent appends fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn events(&self) -> Vec<JobEvent> {
        self.lock().events.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventLog for MemoryEventLog {
    fn append(&mut self, event: &JobEvent) -> Result<()> {
        let mut inner = self.lock();
        if inner.failing {
            return Err(SbdError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "event log unavailable",
            )));
        }
        inner.events.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lsb.events");
        let mut log = FileEventLog::open(&path).unwrap();
        log.append(&JobEvent::Dispatch {
            job_id: 1,
            host: "node01".to_string(),
        })
        .unwrap();
        log.append(&JobEvent::StartFail { job_id: 1 }).unwrap();

        let records = FileEventLog::read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].event, JobEvent::StartFail { job_id: 1 });

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.lines().next().unwrap().contains("\"type\":\"dispatch\""));
    }

    #[test]
    fn memory_log_can_fail() {
        let log = MemoryEventLog::new();
        let mut writer = log.clone();
        writer.append(&JobEvent::StartFail { job_id: 2 }).unwrap();
        log.set_failing(true);
        assert!(writer.append(&JobEvent::StartFail { job_id: 3 }).is_err());
        assert_eq!(log.events().len(), 1);
        assert_eq!(log.events()[0].job_id(), 2);
    }
}
