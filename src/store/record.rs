//! `key=value` rendering of the durable job fields.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::{Result, SbdError};
use crate::job::{Job, JobState, PipelineStep};

pub const RECORD_VERSION: i64 = 1;

/// Bound on a rendered record.
pub const RECORD_BUF_LEN: usize = 2048;

fn flag(b: bool) -> u8 {
    u8::from(b)
}

/// Renders every durable field of `job`.
pub fn render(job: &Job) -> Result<String> {
    let mut buf = String::with_capacity(512);
    // Writing into a String cannot fail.
    let _ = write!(
        buf,
        "version={}\n\
         job_id={}\n\
         pid={}\n\
         pgid={}\n\
         state={}\n\
         step={}\n\
         reply_sent={}\n\
         pid_acked={}\n\
         execute_sent={}\n\
         execute_acked={}\n\
         finish_sent={}\n\
         finish_acked={}\n\
         exit_status_valid={}\n\
         exit_status={}\n\
         end_time={}\n\
         missing={}\n",
        RECORD_VERSION,
        job.job_id,
        job.pid,
        job.pgid,
        job.state as i32,
        job.step as i32,
        job.reply_sent.unwrap_or(0),
        flag(job.pid_acked),
        job.execute_sent.unwrap_or(0),
        flag(job.execute_acked),
        job.finish_sent.unwrap_or(0),
        flag(job.finish_acked),
        flag(job.exit_status_valid),
        job.exit_status,
        job.end_time,
        flag(job.missing),
    );

    if buf.len() >= RECORD_BUF_LEN {
        return Err(SbdError::InvalidArgument(format!(
            "record for job {} does not fit {} bytes",
            job.job_id, RECORD_BUF_LEN
        )));
    }
    Ok(buf)
}

/// Parses a record for `job_id`. Unknown keys are ignored.
pub fn parse(path: &Path, job_id: i64, text: &str) -> Result<Job> {
    let corrupt = |reason: String| SbdError::CorruptRecord {
        path: path.to_path_buf(),
        reason,
    };

    let mut job = Job::recovered(job_id);
    let mut version = None;
    let mut found_id = None;

    for line in text.lines() {
        let Some((key, val)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        let num = || -> Result<i64> {
            val.parse::<i64>()
                .map_err(|_| corrupt(format!("bad value for {}: {:?}", key, val)))
        };
        let stamp = || -> Result<Option<i64>> { num().map(|v| (v != 0).then_some(v)) };

        match key {
            "version" => version = Some(num()?),
            "job_id" => found_id = Some(num()?),
            "pid" => job.pid = num()? as i32,
            "pgid" => job.pgid = num()? as i32,
            "state" => {
                job.state = JobState::from_code(num()?)
                    .ok_or_else(|| corrupt(format!("bad state {:?}", val)))?
            }
            "step" => {
                job.step = PipelineStep::from_code(num()?)
                    .ok_or_else(|| corrupt(format!("bad step {:?}", val)))?
            }
            "reply_sent" => job.reply_sent = stamp()?,
            "pid_acked" => job.pid_acked = num()? != 0,
            "execute_sent" => job.execute_sent = stamp()?,
            "execute_acked" => job.execute_acked = num()? != 0,
            "finish_sent" => job.finish_sent = stamp()?,
            "finish_acked" => job.finish_acked = num()? != 0,
            "exit_status_valid" => job.exit_status_valid = num()? != 0,
            "exit_status" => job.exit_status = num()? as i32,
            "end_time" => job.end_time = num()?,
            "missing" => job.missing = num()? != 0,
            _ => {}
        }
    }

    match version {
        Some(RECORD_VERSION) => {}
        Some(found) => {
            return Err(SbdError::RecordVersion {
                path: path.to_path_buf(),
                found,
            })
        }
        None => return Err(corrupt("no version line".to_string())),
    }

    match found_id {
        Some(id) if id == job_id => {}
        Some(found) => {
            return Err(SbdError::RecordJobMismatch {
                path: path.to_path_buf(),
                expected: job_id,
                found,
            })
        }
        None => return Err(corrupt("no job_id line".to_string())),
    }

    Ok(job)
}
