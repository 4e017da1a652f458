use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SbdError};
use crate::job::JobSpec;
use crate::protocol::codec::Packet;

/// Operation codes carried in the packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum Opcode {
    SbdRegister = 1,
    SbdRegisterAck = 2,
    NewJob = 10,
    NewJobReply = 11,
    NewJobAck = 12,
    JobExecute = 20,
    JobExecuteAck = 21,
    JobFinish = 30,
    JobFinishAck = 31,
    RusageUpdate = 40,
    JobSignal = 50,
    JobSignalReply = 51,
    JobsList = 60,
    JobsListReply = 61,
    Error = 99,
}

impl Opcode {
    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::SbdRegister => "SBD_REGISTER",
            Opcode::SbdRegisterAck => "SBD_REGISTER_ACK",
            Opcode::NewJob => "NEW_JOB",
            Opcode::NewJobReply => "NEW_JOB_REPLY",
            Opcode::NewJobAck => "NEW_JOB_ACK",
            Opcode::JobExecute => "JOB_EXECUTE",
            Opcode::JobExecuteAck => "JOB_EXECUTE_ACK",
            Opcode::JobFinish => "JOB_FINISH",
            Opcode::JobFinishAck => "JOB_FINISH_ACK",
            Opcode::RusageUpdate => "RUSAGE_UPDATE",
            Opcode::JobSignal => "JOB_SIGNAL",
            Opcode::JobSignalReply => "JOB_SIGNAL_REPLY",
            Opcode::JobsList => "JOBS_LIST",
            Opcode::JobsListReply => "JOBS_LIST_REPLY",
            Opcode::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i32> for Opcode {
    type Error = SbdError;

    fn try_from(value: i32) -> Result<Self> {
        let op = match value {
            1 => Opcode::SbdRegister,
            2 => Opcode::SbdRegisterAck,
            10 => Opcode::NewJob,
            11 => Opcode::NewJobReply,
            12 => Opcode::NewJobAck,
            20 => Opcode::JobExecute,
            21 => Opcode::JobExecuteAck,
            30 => Opcode::JobFinish,
            31 => Opcode::JobFinishAck,
            40 => Opcode::RusageUpdate,
            50 => Opcode::JobSignal,
            51 => Opcode::JobSignalReply,
            60 => Opcode::JobsList,
            61 => Opcode::JobsListReply,
            99 => Opcode::Error,
            other => return Err(SbdError::Protocol(format!("unknown opcode {}", other))),
        };
        Ok(op)
    }
}

/// Job status as seen by mbatchd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    /// Dispatched to a host, waiting for the NEW_JOB reply
    Started,
    Running,
    Suspended,
    Done,
    Exit,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Exit)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PEND"),
            JobStatus::Started => write!(f, "START"),
            JobStatus::Running => write!(f, "RUN"),
            JobStatus::Suspended => write!(f, "SUSP"),
            JobStatus::Done => write!(f, "DONE"),
            JobStatus::Exit => write!(f, "EXIT"),
        }
    }
}

/// Batch reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyCode {
    NoError,
    NoJob,
    NotStarted,
    JobFinished,
    StopJob,
    LockJob,
    BadArg,
    BadHost,
    SysCall,
    Protocol,
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReplyCode::NoError => "NO_ERROR",
            ReplyCode::NoJob => "NO_JOB",
            ReplyCode::NotStarted => "NOT_STARTED",
            ReplyCode::JobFinished => "JOB_FINISHED",
            ReplyCode::StopJob => "STOP_JOB",
            ReplyCode::LockJob => "LOCK_JOB",
            ReplyCode::BadArg => "BAD_ARG",
            ReplyCode::BadHost => "BAD_HOST",
            ReplyCode::SysCall => "SYS_CALL",
            ReplyCode::Protocol => "PROTOCOL",
        };
        f.write_str(s)
    }
}

/// Outcome of a NEW_JOB on the sbatchd side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SbdReplyCode {
    NoError,
    BadReq,
    ForkFail,
}

/// Reason recorded when a job goes back to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendReason {
    JobStartFail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SbdRegister {
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReply {
    pub job_id: i64,
    pub job_pid: i32,
    pub job_pgid: i32,
    pub jstatus: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJobReply {
    pub job_id: i64,
    pub code: SbdReplyCode,
    pub reply: Option<JobReply>,
}

/// Acknowledgement of a committed pipeline stage.
///
/// `seq` echoes the header sequence of the acknowledged message and
/// `acked_op` names the operation that was committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusAck {
    pub job_id: i64,
    pub seq: i32,
    pub acked_op: Opcode,
}

/// Status update sent by sbatchd for EXECUTE, FINISH and RUSAGE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReq {
    pub job_id: i64,
    pub job_pid: i32,
    pub job_pgid: i32,
    pub new_status: JobStatus,
    pub exit_status: i32,
    pub exec_uid: u32,
    pub exec_username: String,
    pub exec_home: String,
    pub exec_cwd: String,
    pub run_time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSignalReq {
    pub job_id: i64,
    pub sig: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSignalReply {
    pub job_id: i64,
    pub sig: i32,
    pub rc: ReplyCode,
    pub detail_errno: i32,
}

/// One row of the local job listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: i64,
    pub pid: i32,
    pub pgid: i32,
    pub state: String,
    pub step: String,
    /// Position in the commit pipeline, e.g. `EXEC_SENT`
    pub stage: String,
    pub reply_sent: bool,
    pub pid_acked: bool,
    pub execute_sent: bool,
    pub execute_acked: bool,
    pub finish_sent: bool,
    pub finish_acked: bool,
    pub exit_status_valid: bool,
    pub exit_status: i32,
    pub missing: bool,
    pub job_file: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobsListReply {
    pub jobs: Vec<JobInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub code: ReplyCode,
}

/// Every message exchanged between mbatchd, sbatchd and local clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SbdRegister(SbdRegister),
    SbdRegisterAck,
    NewJob(JobSpec),
    NewJobReply(NewJobReply),
    NewJobAck(JobStatusAck),
    JobExecute(StatusReq),
    JobExecuteAck(JobStatusAck),
    JobFinish(StatusReq),
    JobFinishAck(JobStatusAck),
    RusageUpdate(StatusReq),
    JobSignal(JobSignalReq),
    JobSignalReply(JobSignalReply),
    JobsList,
    JobsListReply(JobsListReply),
    Error(ErrorReply),
}

impl Message {
    pub fn opcode(&self) -> Opcode {
        match self {
            Message::SbdRegister(_) => Opcode::SbdRegister,
            Message::SbdRegisterAck => Opcode::SbdRegisterAck,
            Message::NewJob(_) => Opcode::NewJob,
            Message::NewJobReply(_) => Opcode::NewJobReply,
            Message::NewJobAck(_) => Opcode::NewJobAck,
            Message::JobExecute(_) => Opcode::JobExecute,
            Message::JobExecuteAck(_) => Opcode::JobExecuteAck,
            Message::JobFinish(_) => Opcode::JobFinish,
            Message::JobFinishAck(_) => Opcode::JobFinishAck,
            Message::RusageUpdate(_) => Opcode::RusageUpdate,
            Message::JobSignal(_) => Opcode::JobSignal,
            Message::JobSignalReply(_) => Opcode::JobSignalReply,
            Message::JobsList => Opcode::JobsList,
            Message::JobsListReply(_) => Opcode::JobsListReply,
            Message::Error(_) => Opcode::Error,
        }
    }

    pub fn error(code: ReplyCode) -> Self {
        Message::Error(ErrorReply { code })
    }

    /// Encodes the message into a packet carrying `sequence`.
    pub fn to_packet(&self, sequence: i32) -> Result<Packet> {
        let payload = match self {
            Message::SbdRegisterAck | Message::JobsList => Vec::new(),
            Message::SbdRegister(m) => serde_json::to_vec(m)?,
            Message::NewJob(m) => serde_json::to_vec(m)?,
            Message::NewJobReply(m) => serde_json::to_vec(m)?,
            Message::NewJobAck(m) | Message::JobExecuteAck(m) | Message::JobFinishAck(m) => {
                serde_json::to_vec(m)?
            }
            Message::JobExecute(m) | Message::JobFinish(m) | Message::RusageUpdate(m) => {
                serde_json::to_vec(m)?
            }
            Message::JobSignal(m) => serde_json::to_vec(m)?,
            Message::JobSignalReply(m) => serde_json::to_vec(m)?,
            Message::JobsListReply(m) => serde_json::to_vec(m)?,
            Message::Error(m) => serde_json::to_vec(m)?,
        };
        Ok(Packet::new(self.opcode() as i32, sequence, payload.into()))
    }

    /// Decodes a packet into a typed message.
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        let op = Opcode::try_from(packet.operation)?;
        let body = &packet.payload[..];
        let msg = match op {
            Opcode::SbdRegister => Message::SbdRegister(decode(op, body)?),
            Opcode::SbdRegisterAck => Message::SbdRegisterAck,
            Opcode::NewJob => Message::NewJob(decode(op, body)?),
            Opcode::NewJobReply => Message::NewJobReply(decode(op, body)?),
            Opcode::NewJobAck => Message::NewJobAck(decode(op, body)?),
            Opcode::JobExecute => Message::JobExecute(decode(op, body)?),
            Opcode::JobExecuteAck => Message::JobExecuteAck(decode(op, body)?),
            Opcode::JobFinish => Message::JobFinish(decode(op, body)?),
            Opcode::JobFinishAck => Message::JobFinishAck(decode(op, body)?),
            Opcode::RusageUpdate => Message::RusageUpdate(decode(op, body)?),
            Opcode::JobSignal => Message::JobSignal(decode(op, body)?),
            Opcode::JobSignalReply => Message::JobSignalReply(decode(op, body)?),
            Opcode::JobsList => Message::JobsList,
            Opcode::JobsListReply => Message::JobsListReply(decode(op, body)?),
            Opcode::Error => Message::Error(decode(op, body)?),
        };
        Ok(msg)
    }
}

fn decode<T: DeserializeOwned>(op: Opcode, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| SbdError::Protocol(format!("bad {} payload: {}", op, e)))
}
