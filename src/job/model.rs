use crate::error::{Result, SbdError};
use crate::job::spec::{decode_exec_cwd, JobSpec};
use crate::protocol::commit::PipelineStage;
use crate::protocol::message::{JobInfo, JobReply, JobStatus};

/// sbatchd-local process state. Not visible on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    New = 0,
    Running = 1,
    Exited = 2,
    Failed = 3,
    Killed = 4,
}

impl JobState {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(JobState::New),
            1 => Some(JobState::Running),
            2 => Some(JobState::Exited),
            3 => Some(JobState::Failed),
            4 => Some(JobState::Killed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::New => write!(f, "new"),
            JobState::Running => write!(f, "running"),
            JobState::Exited => write!(f, "exited"),
            JobState::Failed => write!(f, "failed"),
            JobState::Killed => write!(f, "killed"),
        }
    }
}

/// Highest pipeline milestone committed by mbatchd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineStep {
    None = 0,
    PidCommitted = 1,
    ExecuteCommitted = 2,
    FinishCommitted = 3,
}

impl PipelineStep {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(PipelineStep::None),
            1 => Some(PipelineStep::PidCommitted),
            2 => Some(PipelineStep::ExecuteCommitted),
            3 => Some(PipelineStep::FinishCommitted),
            _ => None,
        }
    }
}

impl std::fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStep::None => write!(f, "none"),
            PipelineStep::PidCommitted => write!(f, "pid_committed"),
            PipelineStep::ExecuteCommitted => write!(f, "execute_committed"),
            PipelineStep::FinishCommitted => write!(f, "finish_committed"),
        }
    }
}

/// A job owned by sbatchd.
///
/// The three `*_acked` flags only ever go from false to true. The `*_sent`
/// stamps (epoch seconds) drive resends and may be cleared at any time.
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: i64,
    pub spec: JobSpec,
    pub exec_username: String,
    pub exec_cwd: String,
    pub pid: i32,
    pub pgid: i32,
    pub state: JobState,
    pub step: PipelineStep,
    pub jstatus: JobStatus,

    pub reply_sent: Option<i64>,
    pub execute_sent: Option<i64>,
    pub finish_sent: Option<i64>,

    pub pid_acked: bool,
    pub execute_acked: bool,
    pub finish_acked: bool,

    /// Raw wait status as returned by waitpid
    pub exit_status: i32,
    pub exit_status_valid: bool,
    pub missing: bool,
    pub start_time: i64,
    pub end_time: i64,
    pub run_time: i64,
}

impl Job {
    /// Builds a job from a dispatched spec.
    ///
    /// Fails if the identity fields needed to run and report the job are
    /// missing, or if the execution directory does not fit a path buffer.
    pub fn create(spec: &JobSpec) -> Result<Self> {
        if spec.user_name.is_empty() {
            return Err(SbdError::InvalidArgument(format!(
                "job {} has no exec username",
                spec.job_id
            )));
        }
        if spec.sub_home_dir.is_empty() {
            return Err(SbdError::InvalidArgument(format!(
                "job {} has no submission home directory",
                spec.job_id
            )));
        }
        let exec_cwd = decode_exec_cwd(&spec.cwd, &spec.sub_home_dir)?;

        let mut job = Self::empty(spec.clone());
        job.exec_username = spec.user_name.clone();
        job.exec_cwd = exec_cwd;
        Ok(job)
    }

    /// A job known only by id, as reconstructed from its record.
    pub fn recovered(job_id: i64) -> Self {
        Self::empty(JobSpec::recovered(job_id))
    }

    fn empty(spec: JobSpec) -> Self {
        Self {
            job_id: spec.job_id,
            spec,
            exec_username: String::new(),
            exec_cwd: String::new(),
            pid: -1,
            pgid: -1,
            state: JobState::New,
            step: PipelineStep::None,
            jstatus: JobStatus::Started,
            reply_sent: None,
            execute_sent: None,
            finish_sent: None,
            pid_acked: false,
            execute_acked: false,
            finish_acked: false,
            exit_status: 0,
            exit_status_valid: false,
            missing: false,
            start_time: 0,
            end_time: 0,
            run_time: 0,
        }
    }

    /// The NEW_JOB_REPLY recorded at spawn.
    ///
    /// Every resend repeats it unchanged: the job is reported running even
    /// if it has exited since, because the exit travels in JOB_FINISH.
    pub fn reply(&self) -> JobReply {
        JobReply {
            job_id: self.job_id,
            job_pid: self.pid,
            job_pgid: self.pgid,
            jstatus: JobStatus::Running,
        }
    }

    /// Exit code derived from the raw wait status.
    ///
    /// Signalled processes report `128 + signal`.
    pub fn exit_code(&self) -> Option<i32> {
        if !self.exit_status_valid {
            return None;
        }
        Some(exit_code_of(self.exit_status))
    }

    /// Clears every resend stamp. Returns true if anything changed.
    pub fn clear_sent(&mut self) -> bool {
        let changed =
            self.reply_sent.is_some() || self.execute_sent.is_some() || self.finish_sent.is_some();
        self.reply_sent = None;
        self.execute_sent = None;
        self.finish_sent = None;
        changed
    }

    /// True when the commit flags respect the pipeline ordering.
    pub fn flags_consistent(&self) -> bool {
        (!self.execute_acked || self.pid_acked)
            && (!self.finish_acked || self.execute_acked)
            && (!self.finish_acked || self.exit_status_valid || self.missing)
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            job_id: self.job_id,
            pid: self.pid,
            pgid: self.pgid,
            state: self.state.to_string(),
            step: self.step.to_string(),
            stage: PipelineStage::of(self).to_string(),
            reply_sent: self.reply_sent.is_some(),
            pid_acked: self.pid_acked,
            execute_sent: self.execute_sent.is_some(),
            execute_acked: self.execute_acked,
            finish_sent: self.finish_sent.is_some(),
            finish_acked: self.finish_acked,
            exit_status_valid: self.exit_status_valid,
            exit_status: self.exit_status,
            missing: self.missing,
            job_file: self.spec.job_file.clone(),
        }
    }
}

/// Decodes a raw wait status into a shell-style exit code.
pub fn exit_code_of(raw: i32) -> i32 {
    if libc::WIFEXITED(raw) {
        libc::WEXITSTATUS(raw)
    } else if libc::WIFSIGNALED(raw) {
        128 + libc::WTERMSIG(raw)
    } else {
        raw
    }
}

/// Encodes an exit code the way waitpid reports a normal exit.
pub fn raw_exit_status(code: i32) -> i32 {
    (code & 0xff) << 8
}

/// Encodes a termination signal the way waitpid reports it.
pub fn raw_signal_status(signo: i32, core_dumped: bool) -> i32 {
    (signo & 0x7f) | if core_dumped { 0x80 } else { 0 }
}
