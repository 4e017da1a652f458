use std::collections::{BTreeMap, HashMap};

use tokio::sync::mpsc;

use crate::error::{Result, SbdError};
use crate::job::JobSpec;
use crate::master::event_log::{EventLog, JobEvent};
use crate::protocol::commit::{ack_opcode, is_committed};
use crate::protocol::message::{
    JobSignalReply, JobSignalReq, JobStatus, JobStatusAck, NewJobReply, PendReason, ReplyCode,
    SbdReplyCode, StatusReq,
};
use crate::protocol::{Message, Opcode};

/// mbatchd's view of one job.
#[derive(Debug, Clone)]
pub struct MasterJob {
    pub job_id: i64,
    pub host: String,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub pend_reason: Option<PendReason>,
    pub pid: i32,
    pub pgid: i32,
    pub exec_username: String,
    pub exec_cwd: String,
    pub exit_status: i32,
    pub run_time: i64,
    pub execute_committed: bool,
    pub finish_committed: bool,
}

impl MasterJob {
    fn dispatched(spec: JobSpec, host: &str) -> Self {
        Self {
            job_id: spec.job_id,
            host: host.to_string(),
            spec,
            status: JobStatus::Started,
            pend_reason: None,
            pid: -1,
            pgid: -1,
            exec_username: String::new(),
            exec_cwd: String::new(),
            exit_status: 0,
            run_time: 0,
            execute_committed: false,
            finish_committed: false,
        }
    }
}

#[derive(Debug, Default)]
struct HostEntry {
    channel: Option<mpsc::UnboundedSender<Message>>,
}

/// Master-side job table.
///
/// Decides when a pipeline stage reported by sbatchd is committed and
/// answers with the matching ACK. A stage is committed only after its event
/// reached the event log.
pub struct MasterJobRegistry {
    jobs: BTreeMap<i64, MasterJob>,
    hosts: HashMap<String, HostEntry>,
    log: Box<dyn EventLog>,
}

impl std::fmt::Debug for MasterJobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterJobRegistry")
            .field("jobs", &self.jobs.len())
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl MasterJobRegistry {
    pub fn new(log: impl EventLog + 'static) -> Self {
        Self {
            jobs: BTreeMap::new(),
            hosts: HashMap::new(),
            log: Box::new(log),
        }
    }

    /// Declares a host allowed to register.
    pub fn add_host(&mut self, name: impl Into<String>) {
        self.hosts.entry(name.into()).or_default();
    }

    pub fn is_attached(&self, host: &str) -> bool {
        self.hosts
            .get(host)
            .map_or(false, |h| h.channel.is_some())
    }

    pub fn job(&self, job_id: i64) -> Option<&MasterJob> {
        self.jobs.get(&job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &MasterJob> {
        self.jobs.values()
    }

    /// Attaches the channel of a registering sbatchd.
    pub fn handle_register(
        &mut self,
        hostname: &str,
        channel: mpsc::UnboundedSender<Message>,
    ) -> Message {
        match self.hosts.get_mut(hostname) {
            Some(host) => {
                host.channel = Some(channel);
                tracing::info!(host = hostname, "sbatchd registered");
                Message::SbdRegisterAck
            }
            None => {
                tracing::warn!(host = hostname, "Registration from unknown host");
                Message::error(ReplyCode::BadHost)
            }
        }
    }

    /// Detaches the host if `channel` is still the one it registered with.
    /// Job state is left untouched.
    ///
    /// A session closing after the host re-registered on a new connection
    /// leaves the newer channel attached.
    pub fn handle_disconnect(&mut self, hostname: &str, channel: &mpsc::UnboundedSender<Message>) {
        let Some(host) = self.hosts.get_mut(hostname) else {
            return;
        };
        match &host.channel {
            Some(current) if current.same_channel(channel) => host.channel = None,
            _ => {
                tracing::debug!(host = hostname, "Stale session closed, newer registration kept");
                return;
            }
        }
        let jobs = self.jobs.values().filter(|j| j.host == hostname).count();
        tracing::info!(host = hostname, jobs, "sbatchd disconnected");
    }

    /// Logs the dispatch and sends NEW_JOB to the host.
    pub fn dispatch(&mut self, spec: JobSpec, hostname: &str) -> Result<()> {
        let job_id = spec.job_id;
        if let Some(job) = self.jobs.get(&job_id) {
            if job.status != JobStatus::Pending {
                return Err(SbdError::InvalidArgument(format!(
                    "job {} is {} and cannot be dispatched",
                    job_id, job.status
                )));
            }
        }
        let channel = self
            .hosts
            .get(hostname)
            .ok_or_else(|| SbdError::UnknownHost(hostname.to_string()))?
            .channel
            .clone()
            .ok_or(SbdError::LinkNotReady)?;

        self.log.append(&JobEvent::Dispatch {
            job_id,
            host: hostname.to_string(),
        })?;
        self.jobs
            .insert(job_id, MasterJob::dispatched(spec.clone(), hostname));

        channel
            .send(Message::NewJob(spec))
            .map_err(|_| SbdError::LinkNotReady)?;
        tracing::info!(job_id, host = hostname, "Job dispatched");
        Ok(())
    }

    /// Queues JOB_SIGNAL for the job's host.
    pub fn signal_job(&mut self, job_id: i64, sig: i32) -> Result<()> {
        let job = self.jobs.get(&job_id).ok_or(SbdError::JobNotFound(job_id))?;
        let channel = self
            .hosts
            .get(&job.host)
            .and_then(|h| h.channel.clone())
            .ok_or(SbdError::LinkNotReady)?;
        channel
            .send(Message::JobSignal(JobSignalReq { job_id, sig }))
            .map_err(|_| SbdError::LinkNotReady)
    }

    /// Marks a running job suspended.
    pub fn suspend_job(&mut self, job_id: i64) -> bool {
        match self.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Suspended;
                true
            }
            _ => false,
        }
    }

    /// Commits the pid reported by sbatchd.
    ///
    /// A failed start sends the job back to pending. A resend whose pid
    /// matches the accepted one is acked again without a second event.
    pub fn handle_new_job_reply(&mut self, seq: i32, reply: &NewJobReply) -> Option<Message> {
        let job_id = reply.job_id;
        let Some(job) = self.jobs.get_mut(&job_id) else {
            tracing::warn!(job_id, "NEW_JOB reply for unknown job");
            return None;
        };

        if reply.code != SbdReplyCode::NoError {
            if job.status == JobStatus::Started {
                if let Err(e) = self.log.append(&JobEvent::StartFail { job_id }) {
                    tracing::error!(job_id, error = %e, "Cannot log start failure");
                }
                job.status = JobStatus::Pending;
                job.pend_reason = Some(PendReason::JobStartFail);
                job.pid = -1;
                job.pgid = -1;
                tracing::warn!(job_id, code = ?reply.code, "Job start failed, back to pending");
            }
            return None;
        }

        let Some(started) = reply.reply.as_ref() else {
            tracing::error!(job_id, "NEW_JOB reply without job details");
            return Some(Message::error(ReplyCode::Protocol));
        };

        if job.status != JobStatus::Started {
            if job.pid > 0 && job.pid == started.job_pid {
                tracing::debug!(job_id, pid = job.pid, "Duplicate NEW_JOB reply, re-acking");
                return ack_message(Opcode::NewJobReply, job_id, seq);
            }
            tracing::warn!(job_id, status = %job.status, "NEW_JOB reply for job not in START, ignored");
            return None;
        }

        if let Err(e) = self.log.append(&JobEvent::StartAccept {
            job_id,
            pid: started.job_pid,
            pgid: started.job_pgid,
        }) {
            tracing::error!(job_id, error = %e, "Cannot log start accept, ack withheld");
            return None;
        }

        job.pid = started.job_pid;
        job.pgid = started.job_pgid;
        // A job only finishes through a committed FINISH.
        job.status = if started.jstatus.is_finished() {
            tracing::warn!(job_id, status = %started.jstatus, "Start reply carries a finished status, recording RUNNING");
            JobStatus::Running
        } else {
            started.jstatus
        };
        job.pend_reason = None;
        tracing::info!(job_id, pid = job.pid, "Job start accepted");
        ack_message(Opcode::NewJobReply, job_id, seq)
    }

    /// Routes a status update and acks it if committed.
    pub fn handle_status(&mut self, seq: i32, op: Opcode, req: &StatusReq) -> Option<Message> {
        match op {
            Opcode::JobExecute | Opcode::JobFinish => {
                let code = self.status_job(op, req);
                if is_committed(code) {
                    ack_message(op, req.job_id, seq)
                } else {
                    tracing::warn!(job_id = req.job_id, op = %op, %code, "Status not committed, ack withheld");
                    Some(Message::error(code))
                }
            }
            Opcode::RusageUpdate => {
                self.rusage_job(req);
                None
            }
            other => {
                tracing::error!(job_id = req.job_id, op = %other, "Not a status operation");
                Some(Message::error(ReplyCode::Protocol))
            }
        }
    }

    /// Applies an EXECUTE or FINISH update and returns the batch reply code.
    pub fn status_job(&mut self, op: Opcode, req: &StatusReq) -> ReplyCode {
        let job_id = req.job_id;
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return ReplyCode::NoJob;
        };

        match op {
            Opcode::JobExecute => {
                if job.execute_committed {
                    tracing::debug!(job_id, "Duplicate EXECUTE");
                    return running_code(job.status);
                }
                match job.status {
                    JobStatus::Pending | JobStatus::Started => return ReplyCode::NotStarted,
                    JobStatus::Done | JobStatus::Exit => return ReplyCode::JobFinished,
                    JobStatus::Running | JobStatus::Suspended => {}
                }

                if let Err(e) = self.log.append(&JobEvent::Execute {
                    job_id,
                    exec_username: req.exec_username.clone(),
                    exec_cwd: req.exec_cwd.clone(),
                }) {
                    tracing::error!(job_id, error = %e, "Cannot log EXECUTE");
                    return ReplyCode::SysCall;
                }

                job.execute_committed = true;
                job.exec_username = req.exec_username.clone();
                job.exec_cwd = req.exec_cwd.clone();
                if req.job_pid > 0 {
                    job.pid = req.job_pid;
                    job.pgid = req.job_pgid;
                }
                tracing::info!(job_id, user = %job.exec_username, "Job executing");
                running_code(job.status)
            }
            Opcode::JobFinish => {
                if job.finish_committed {
                    tracing::debug!(job_id, "Duplicate FINISH");
                    return ReplyCode::NoError;
                }
                if !job.execute_committed {
                    return ReplyCode::NotStarted;
                }

                let status = if req.new_status.is_finished() {
                    req.new_status
                } else {
                    JobStatus::Exit
                };
                if let Err(e) = self.log.append(&JobEvent::Finish {
                    job_id,
                    status,
                    exit_status: req.exit_status,
                }) {
                    tracing::error!(job_id, error = %e, "Cannot log FINISH");
                    return ReplyCode::SysCall;
                }

                job.finish_committed = true;
                job.status = status;
                job.exit_status = req.exit_status;
                job.run_time = job.run_time.max(req.run_time);
                tracing::info!(job_id, status = %status, exit_status = req.exit_status, "Job finished");
                ReplyCode::NoError
            }
            _ => ReplyCode::Protocol,
        }
    }

    fn rusage_job(&mut self, req: &StatusReq) {
        match self.jobs.get_mut(&req.job_id) {
            Some(job) if !job.status.is_finished() => {
                job.run_time = req.run_time;
                tracing::debug!(job_id = req.job_id, run_time = req.run_time, "Rusage update");
            }
            Some(_) => {}
            None => tracing::warn!(job_id = req.job_id, "Rusage for unknown job"),
        }
    }

    pub fn handle_signal_reply(&mut self, reply: &JobSignalReply) {
        if reply.rc == ReplyCode::NoError {
            tracing::info!(job_id = reply.job_id, sig = reply.sig, "Signal delivered");
        } else {
            tracing::warn!(
                job_id = reply.job_id,
                sig = reply.sig,
                rc = %reply.rc,
                errno = reply.detail_errno,
                "Signal not delivered"
            );
        }
    }

    /// Handles one message from a registered sbatchd.
    pub fn handle_message(&mut self, seq: i32, msg: Message) -> Option<Message> {
        match msg {
            Message::NewJobReply(reply) => self.handle_new_job_reply(seq, &reply),
            Message::JobExecute(req) => self.handle_status(seq, Opcode::JobExecute, &req),
            Message::JobFinish(req) => self.handle_status(seq, Opcode::JobFinish, &req),
            Message::RusageUpdate(req) => self.handle_status(seq, Opcode::RusageUpdate, &req),
            Message::JobSignalReply(reply) => {
                self.handle_signal_reply(&reply);
                None
            }
            Message::Error(err) => {
                tracing::warn!(code = %err.code, seq, "sbatchd reported an error");
                None
            }
            other => {
                tracing::error!(op = %other.opcode(), seq, "Unexpected operation from sbatchd");
                Some(Message::error(ReplyCode::Protocol))
            }
        }
    }
}

/// Reply for a committed EXECUTE: suspended jobs are told to stop.
fn running_code(status: JobStatus) -> ReplyCode {
    if status == JobStatus::Suspended {
        ReplyCode::StopJob
    } else {
        ReplyCode::NoError
    }
}

fn ack_message(op: Opcode, job_id: i64, seq: i32) -> Option<Message> {
    let ack = JobStatusAck {
        job_id,
        seq,
        acked_op: op,
    };
    match ack_opcode(op)? {
        Opcode::NewJobAck => Some(Message::NewJobAck(ack)),
        Opcode::JobExecuteAck => Some(Message::JobExecuteAck(ack)),
        Opcode::JobFinishAck => Some(Message::JobFinishAck(ack)),
        _ => None,
    }
}
