use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SbdError};

/// Size of the fixed path buffers, terminator included.
pub const PATH_MAX: usize = 4096;

/// Job description as dispatched by mbatchd.
///
/// sbatchd keeps its own copy for the lifetime of the job; the decoded
/// wire value is never shared with the job object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: i64,
    pub job_name: String,
    pub queue: String,
    /// Submission host
    pub from_host: String,
    pub user_name: String,
    pub user_id: u32,
    /// Submitting user's home directory
    pub sub_home_dir: String,
    /// Encoded working directory: empty, absolute, or home-relative
    pub cwd: String,
    pub command: String,
    pub res_req: String,
    /// `KEY=VALUE` entries exported to the job
    pub env: Vec<String>,
    pub in_file: String,
    pub out_file: String,
    pub err_file: String,
    pub umask: u32,
    /// Name of the per-job directory under the jfiles dir
    pub job_file: String,
    /// Script payload materialized as `job.sh`
    pub job_file_data: Vec<u8>,
    pub queue_pre_cmd: String,
    pub pre_exec_cmd: String,
}

impl JobSpec {
    pub fn new(job_id: i64, command: impl Into<String>) -> Self {
        Self {
            job_id,
            command: command.into(),
            job_file: format!("{}", job_id),
            umask: 0o022,
            ..Default::default()
        }
    }

    /// Placeholder spec for a job recovered from its record alone.
    pub fn recovered(job_id: i64) -> Self {
        Self {
            job_id,
            ..Default::default()
        }
    }
}

/// Resolves the execution directory from the encoded `cwd`.
///
/// Empty means home, absolute paths are taken as-is and anything else is
/// relative to `home`.
pub fn decode_exec_cwd(cwd: &str, home: &str) -> Result<String> {
    let exec_cwd = if cwd.is_empty() {
        home.to_string()
    } else if cwd.starts_with('/') {
        cwd.to_string()
    } else {
        format!("{}/{}", home, cwd)
    };

    if exec_cwd.len() >= PATH_MAX {
        return Err(SbdError::PathTooLong(PathBuf::from(exec_cwd)));
    }
    Ok(exec_cwd)
}

/// Expands `%J` and `%I` in a stdio path template.
///
/// Other `%X` sequences and a trailing `%` are copied literally.
pub fn expand_stdio_path(template: &str, job_id: i64) -> Result<String> {
    let mut out = String::with_capacity(template.len() + 16);
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            None => out.push('%'),
            Some('J') | Some('I') => out.push_str(&job_id.to_string()),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
        }
    }

    if out.len() >= PATH_MAX {
        return Err(SbdError::PathTooLong(PathBuf::from(out)));
    }
    Ok(out)
}
