//! Crash-safe on-disk state of sbatchd.
//!
//! Layout under the state directory:
//!
//! - `job.<id>`: the durable job record, see [`record`]
//! - `go.<id>`: marker written once mbatchd committed the pid
//! - `exit.status.<id>`: `"<exit code> <epoch>"` captured at reap time
//!
//! Every file is written to a temporary name, fsynced and renamed into
//! place, so readers only ever see a complete file.

pub mod record;

use std::collections::BTreeMap;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::config::SbdConfig;
use crate::error::{Result, SbdError};
use crate::job::Job;

/// What [`JobStore::load_all`] found.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub loaded: usize,
    pub pruned: usize,
}

#[derive(Debug, Clone)]
pub struct JobStore {
    state_dir: PathBuf,
    jfiles_dir: PathBuf,
}

impl JobStore {
    /// Creates `<sharedir>/sbatchd/{state,jfiles}` if needed.
    pub fn init(config: &SbdConfig) -> Result<Self> {
        let root = config.sbd_root();
        let store = Self {
            state_dir: config.state_dir(),
            jfiles_dir: config.jfiles_dir(),
        };

        for dir in [&root, &store.state_dir, &store.jfiles_dir] {
            match DirBuilder::new().mode(0o700).create(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
            if !fs::metadata(dir)?.is_dir() {
                return Err(SbdError::InvalidArgument(format!(
                    "{} exists but is not a directory",
                    dir.display()
                )));
            }
        }

        tracing::info!(state_dir = %store.state_dir.display(), "sbatchd state dir ready");
        Ok(store)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn jfiles_dir(&self) -> &Path {
        &self.jfiles_dir
    }

    pub fn record_path(&self, job_id: i64) -> PathBuf {
        self.state_dir.join(format!("job.{}", job_id))
    }

    pub fn go_path(&self, job_id: i64) -> PathBuf {
        self.state_dir.join(format!("go.{}", job_id))
    }

    pub fn exit_status_path(&self, job_id: i64) -> PathBuf {
        self.state_dir.join(format!("exit.status.{}", job_id))
    }

    /// Per-job directory holding the materialized script.
    pub fn job_file_dir(&self, job_file: &str) -> PathBuf {
        self.jfiles_dir.join(job_file)
    }

    /// Atomically replaces the record of `job`.
    pub fn write(&self, job: &Job) -> Result<()> {
        let text = record::render(job)?;
        let path = self.record_path(job.job_id);
        let tmp = self
            .state_dir
            .join(format!("job.{}.tmp.{}", job.job_id, std::process::id()));

        write_atomic(&tmp, &path, text.as_bytes()).map_err(|e| {
            tracing::error!(job_id = job.job_id, path = %path.display(), error = %e, "Record write failed");
            e
        })?;

        tracing::debug!(
            job_id = job.job_id,
            pid = job.pid,
            state = %job.state,
            step = %job.step,
            pid_acked = job.pid_acked,
            execute_acked = job.execute_acked,
            finish_acked = job.finish_acked,
            exit_status_valid = job.exit_status_valid,
            missing = job.missing,
            "Record written"
        );
        Ok(())
    }

    /// Reads the record of `job_id`.
    pub fn read(&self, job_id: i64) -> Result<Job> {
        let path = self.record_path(job_id);
        let text = fs::read_to_string(&path)?;
        record::parse(&path, job_id, &text)
    }

    /// Loads every `job.<id>` record into `jobs`.
    ///
    /// Records already finish-acked are deleted instead of loaded. Unreadable
    /// records are logged and skipped.
    pub fn load_all(&self, jobs: &mut BTreeMap<i64, Job>) -> Result<LoadSummary> {
        let mut summary = LoadSummary::default();

        for entry in fs::read_dir(&self.state_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(job_id) = name.to_str().and_then(parse_record_name) else {
                continue;
            };

            let job = match self.read(job_id) {
                Ok(job) => job,
                Err(e) => {
                    tracing::error!(job_id, error = %e, "Skipping unreadable job record");
                    continue;
                }
            };

            if job.finish_acked {
                tracing::info!(job_id, "Job already finish-acked, pruning record");
                self.remove(job_id)?;
                summary.pruned += 1;
                continue;
            }

            jobs.insert(job_id, job);
            summary.loaded += 1;
        }

        tracing::info!(
            loaded = summary.loaded,
            pruned = summary.pruned,
            "Loaded jobs from state directory"
        );
        Ok(summary)
    }

    /// Deletes the record and its side files. Missing files are fine.
    pub fn remove(&self, job_id: i64) -> Result<()> {
        tracing::info!(job_id, "Removing job record");
        remove_if_exists(&self.record_path(job_id))?;
        remove_if_exists(&self.exit_status_path(job_id))?;
        remove_if_exists(&self.go_path(job_id))?;
        Ok(())
    }

    /// Deletes the materialized script directory of a job.
    pub fn remove_job_files(&self, job_file: &str) -> Result<()> {
        if job_file.is_empty() {
            return Ok(());
        }
        match fs::remove_dir_all(self.job_file_dir(job_file)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the `go.<id>` marker holding the current epoch.
    pub fn write_go(&self, job_id: i64) -> Result<()> {
        let tmp = self
            .state_dir
            .join(format!(".go.{}.{}", job_id, std::process::id()));
        let now = chrono::Utc::now().timestamp();
        write_atomic(&tmp, &self.go_path(job_id), format!("{}\n", now).as_bytes())
    }

    pub fn write_exit_status(&self, job_id: i64, exit_code: i32, epoch: i64) -> Result<()> {
        let tmp = self
            .state_dir
            .join(format!(".exit.status.{}.{}", job_id, std::process::id()));
        write_atomic(
            &tmp,
            &self.exit_status_path(job_id),
            format!("{} {}\n", exit_code, epoch).as_bytes(),
        )
    }

    /// Reads `exit.status.<id>`, if present.
    pub fn read_exit_status(&self, job_id: i64) -> Result<Option<(i32, i64)>> {
        let path = self.exit_status_path(job_id);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut fields = text.split_whitespace();
        let parsed = match (fields.next(), fields.next()) {
            (Some(code), Some(epoch)) => code.parse::<i32>().ok().zip(epoch.parse::<i64>().ok()),
            _ => None,
        };
        parsed.map(Some).ok_or_else(|| SbdError::CorruptRecord {
            path,
            reason: format!("bad exit status line {:?}", text.trim()),
        })
    }
}

/// `job.<digits>` and nothing else.
fn parse_record_name(name: &str) -> Option<i64> {
    let id = name.strip_prefix("job.")?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    id.parse().ok()
}

/// temp write, fsync, close, rename. The temp file is unlinked on failure.
fn write_atomic(tmp: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let result = (|| -> io::Result<()> {
        let mut file: File = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(tmp);
        return Err(e.into());
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
