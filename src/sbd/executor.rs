use std::collections::{BTreeMap, BTreeSet};

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{self, fork, ForkResult, Pid};

use crate::config::SbdConfig;
use crate::error::{invariant_violation, Result, SbdError};
use crate::job::model::{exit_code_of, raw_exit_status, raw_signal_status};
use crate::job::{Job, JobSpec, JobState, PipelineStep};
use crate::protocol::commit::{self, AckVerdict};
use crate::protocol::message::{
    JobInfo, JobReply, JobSignalReply, JobSignalReq, JobStatus, JobStatusAck, NewJobReply,
    ReplyCode, SbdReplyCode, StatusReq,
};
use crate::protocol::{Message, Opcode};
use crate::sbd::child::ChildProcessRunner;
use crate::sbd::link::MbdSink;
use crate::store::{JobStore, LoadSummary};

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Owns every job on this host and drives its commit pipeline.
///
/// All mutation happens on the event-loop thread. Each change to a commit
/// flag is persisted before the executor acts on it.
#[derive(Debug)]
pub struct JobExecutor {
    config: SbdConfig,
    store: JobStore,
    jobs: BTreeMap<i64, Job>,
    /// Jobs inherited from a previous daemon instance, not our children
    adopted: BTreeSet<i64>,
}

impl JobExecutor {
    pub fn new(config: SbdConfig, store: JobStore) -> Self {
        Self {
            config,
            store,
            jobs: BTreeMap::new(),
            adopted: BTreeSet::new(),
        }
    }

    pub fn config(&self) -> &SbdConfig {
        &self.config
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn job(&self, job_id: i64) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Snapshot for the local job listing, in job-id order.
    pub fn jobs_info(&self) -> Vec<JobInfo> {
        self.jobs.values().map(Job::info).collect()
    }

    /// Loads the state directory and prepares every job for resend.
    ///
    /// A job recorded as running whose exit was never captured adopts the
    /// exit-status side file if one exists, and is marked missing if its
    /// process is gone.
    pub fn recover(&mut self) -> Result<LoadSummary> {
        let summary = self.store.load_all(&mut self.jobs)?;

        for job in self.jobs.values_mut() {
            if job.state == JobState::Running && !job.exit_status_valid {
                match self.store.read_exit_status(job.job_id) {
                    Ok(Some((code, epoch))) => {
                        adopt_exit_status(job, code, epoch);
                        tracing::info!(job_id = job.job_id, code, "Adopted exit status from side file");
                    }
                    Ok(None) if process_gone(job.pid) => {
                        mark_missing(job);
                        tracing::warn!(job_id = job.job_id, pid = job.pid, "Job process vanished while sbatchd was down");
                    }
                    Ok(None) => {
                        self.adopted.insert(job.job_id);
                    }
                    Err(e) => {
                        tracing::error!(job_id = job.job_id, error = %e, "Cannot read exit status file");
                        self.adopted.insert(job.job_id);
                    }
                }
            }

            job.jstatus = recovered_status(job);
            job.clear_sent();
            if let Err(e) = self.store.write(job) {
                tracing::error!(job_id = job.job_id, error = %e, "Failed to persist recovered job");
            }
        }

        tracing::info!(jobs = self.jobs.len(), adopted = self.adopted.len(), "Recovery complete");
        Ok(summary)
    }

    /// Validates a dispatched spec and builds its job.
    pub fn create(&self, spec: &JobSpec) -> Result<Job> {
        Job::create(spec)
    }

    /// Forks the job process and persists its record before replying.
    ///
    /// Spawning a job id that is already known returns its recorded reply
    /// and never forks again. If the record cannot be written the child is
    /// killed and the spawn fails.
    pub fn spawn(&mut self, mut job: Job) -> Result<JobReply> {
        if let Some(existing) = self.jobs.get(&job.job_id) {
            tracing::debug!(job_id = job.job_id, pid = existing.pid, "Duplicate NEW_JOB, echoing prior reply");
            return Ok(existing.reply());
        }

        let runner = ChildProcessRunner::prepare(
            &job,
            &self.config,
            self.store.jfiles_dir(),
            self.store.state_dir(),
        )?;

        // SAFETY: the child only runs the prepared runner, which either execs
        // the job script or calls _exit.
        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => runner.run(),
            Ok(ForkResult::Parent { child }) => child,
            Err(source) => {
                tracing::error!(job_id = job.job_id, error = %source, "fork failed");
                return Err(SbdError::Fork {
                    job_id: job.job_id,
                    source,
                });
            }
        };

        // Both sides set the group so signals work whichever runs first.
        let _ = unistd::setpgid(child, child);

        job.pid = child.as_raw();
        job.pgid = child.as_raw();
        job.state = JobState::Running;
        job.jstatus = JobStatus::Running;
        job.start_time = now();

        let job_id = job.job_id;
        if let Err(e) = self.store.write(&job) {
            tracing::error!(job_id, pid = job.pid, error = %e, "Cannot persist spawned job, killing it");
            discard_child(child);
            let _ = self.store.remove_job_files(&job.spec.job_file);
            return Err(e);
        }

        tracing::info!(job_id, pid = job.pid, user = %job.exec_username, "Job spawned");
        let reply = job.reply();
        self.jobs.insert(job_id, job);
        Ok(reply)
    }

    /// Creates and spawns a dispatched job, mapping failures to a reply code.
    pub fn new_job(&mut self, spec: &JobSpec) -> NewJobReply {
        let job_id = spec.job_id;
        let failed = |code| NewJobReply {
            job_id,
            code,
            reply: None,
        };

        let job = match self.create(spec) {
            Ok(job) => job,
            Err(e) => {
                tracing::error!(job_id, error = %e, "Rejecting NEW_JOB");
                return failed(SbdReplyCode::BadReq);
            }
        };

        match self.spawn(job) {
            Ok(reply) => NewJobReply {
                job_id,
                code: SbdReplyCode::NoError,
                reply: Some(reply),
            },
            Err(SbdError::Fork { .. }) => failed(SbdReplyCode::ForkFail),
            Err(e) => {
                tracing::error!(job_id, error = %e, "Cannot start job");
                failed(SbdReplyCode::BadReq)
            }
        }
    }

    /// Answers a NEW_JOB request and stamps the reply as sent.
    pub fn handle_new_job<S: MbdSink + ?Sized>(
        &mut self,
        seq: i32,
        spec: &JobSpec,
        sink: &mut S,
    ) -> Result<()> {
        let reply = self.new_job(spec);
        let committed = reply.code == SbdReplyCode::NoError;
        sink.reply(seq, Message::NewJobReply(reply))?;

        if committed {
            if let Some(job) = self.jobs.get_mut(&spec.job_id) {
                if !job.pid_acked {
                    job.reply_sent = Some(now());
                    if let Err(e) = self.store.write(job) {
                        tracing::error!(job_id = job.job_id, error = %e, "Failed to persist reply stamp");
                    }
                }
            }
        }
        Ok(())
    }

    /// Routes an ack received on `carrier`.
    pub fn on_ack(&mut self, carrier: Opcode, ack: &JobStatusAck) -> Result<()> {
        let Some(job) = self.jobs.get(&ack.job_id) else {
            tracing::warn!(job_id = ack.job_id, op = %carrier, "Ack for unknown job");
            return Ok(());
        };

        if commit::classify_ack(job, carrier, ack) == AckVerdict::Mismatch {
            tracing::error!(
                job_id = ack.job_id,
                op = %carrier,
                acked_op = %ack.acked_op,
                "Ack names the wrong operation, dropping"
            );
            return Ok(());
        }
        self.apply_ack(ack.job_id, ack.acked_op)
    }

    /// mbatchd committed the pid.
    pub fn on_pid_ack(&mut self, job_id: i64) -> Result<()> {
        self.apply_ack(job_id, Opcode::NewJobReply)
    }

    /// mbatchd committed the execute stage.
    pub fn on_execute_ack(&mut self, job_id: i64) -> Result<()> {
        self.apply_ack(job_id, Opcode::JobExecute)
    }

    /// mbatchd committed the finish. The job's record is removed and the
    /// job is destroyed.
    pub fn on_finish_ack(&mut self, job_id: i64) -> Result<()> {
        self.apply_ack(job_id, Opcode::JobFinish)
    }

    fn apply_ack(&mut self, job_id: i64, op: Opcode) -> Result<()> {
        let job = self.jobs.get(&job_id).ok_or(SbdError::JobNotFound(job_id))?;

        match commit::ack_verdict(job, op) {
            AckVerdict::Apply => {}
            AckVerdict::Duplicate => {
                tracing::debug!(job_id, op = %op, "Duplicate ack ignored");
                return Ok(());
            }
            AckVerdict::Mismatch => {
                tracing::error!(job_id, op = %op, "Not an ackable operation, dropping");
                return Ok(());
            }
            AckVerdict::OutOfOrder if op == Opcode::JobExecute => {
                tracing::error!(job_id, "EXECUTE ack before PID ack, dropping");
                return Ok(());
            }
            AckVerdict::OutOfOrder => invariant_violation(job_id, "FINISH acked before EXECUTE"),
            AckVerdict::NoExitStatus => {
                invariant_violation(job_id, "FINISH acked without exit status")
            }
        }

        self.commit(job_id, op)?;

        match op {
            Opcode::NewJobReply => {
                if let Err(e) = self.store.write_go(job_id) {
                    tracing::error!(job_id, error = %e, "Failed to write go marker");
                }
                tracing::info!(job_id, "PID committed by mbatchd");
            }
            Opcode::JobExecute => {
                tracing::info!(job_id, "EXECUTE committed by mbatchd");
            }
            Opcode::JobFinish => {
                tracing::info!(job_id, "FINISH committed by mbatchd");
                self.destroy(job_id);
            }
            _ => {}
        }
        Ok(())
    }

    /// Sets the acked flag for `op` and persists it. On a failed write the
    /// flag is reverted and the stage becomes eligible for resend.
    fn commit(&mut self, job_id: i64, op: Opcode) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(SbdError::JobNotFound(job_id))?;
        let prev_step = job.step;

        match op {
            Opcode::NewJobReply => {
                job.pid_acked = true;
                job.step = job.step.max(PipelineStep::PidCommitted);
            }
            Opcode::JobExecute => {
                job.execute_acked = true;
                job.step = job.step.max(PipelineStep::ExecuteCommitted);
            }
            Opcode::JobFinish => {
                job.finish_acked = true;
                job.step = PipelineStep::FinishCommitted;
            }
            _ => return Ok(()),
        }

        if let Err(e) = self.store.write(job) {
            match op {
                Opcode::NewJobReply => {
                    job.pid_acked = false;
                    job.reply_sent = None;
                }
                Opcode::JobExecute => {
                    job.execute_acked = false;
                    job.execute_sent = None;
                }
                _ => {
                    job.finish_acked = false;
                    job.finish_sent = None;
                }
            }
            job.step = prev_step;
            tracing::error!(job_id, op = %op, error = %e, "Cannot persist commit, stage will be resent");
            return Err(e);
        }
        Ok(())
    }

    fn destroy(&mut self, job_id: i64) {
        let Some(job) = self.jobs.remove(&job_id) else {
            return;
        };
        self.adopted.remove(&job_id);
        if let Err(e) = self.store.remove(job_id) {
            tracing::error!(job_id, error = %e, "Failed to remove job record");
        }
        if let Err(e) = self.store.remove_job_files(&job.spec.job_file) {
            tracing::error!(job_id, error = %e, "Failed to remove job files");
        }
        tracing::info!(job_id, "Job destroyed");
    }

    /// Records the exit of `pid`. Returns the job it belonged to.
    pub fn reap(&mut self, pid: i32, wait_status: i32) -> Option<i64> {
        let Some(job) = self
            .jobs
            .values_mut()
            .find(|j| j.pid == pid && !j.exit_status_valid)
        else {
            tracing::warn!(pid, wait_status, "Reaped unknown pid");
            return None;
        };

        job.exit_status = wait_status;
        job.exit_status_valid = true;
        job.end_time = now();
        job.state = if libc::WIFEXITED(wait_status) {
            JobState::Exited
        } else if libc::WIFSIGNALED(wait_status) {
            JobState::Killed
        } else {
            JobState::Failed
        };
        let code = exit_code_of(wait_status);
        job.jstatus = if code == 0 {
            JobStatus::Done
        } else {
            JobStatus::Exit
        };
        if job.start_time > 0 {
            job.run_time = job.end_time - job.start_time;
        }

        tracing::info!(job_id = job.job_id, pid, code, state = %job.state, "Job exited");

        if let Err(e) = self.store.write_exit_status(job.job_id, code, job.end_time) {
            tracing::error!(job_id = job.job_id, error = %e, "Failed to write exit status file");
        }
        if let Err(e) = self.store.write(job) {
            tracing::error!(job_id = job.job_id, error = %e, "Failed to persist exit status");
        }
        Some(job.job_id)
    }

    /// Marks adopted jobs whose process disappeared as missing.
    ///
    /// Processes inherited from a previous daemon are not our children, so
    /// their exit is never reported by waitpid.
    pub fn probe_adopted(&mut self) -> usize {
        let mut gone = Vec::new();
        for &job_id in &self.adopted {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.exit_status_valid || job.missing {
                continue;
            }
            match self.store.read_exit_status(job_id) {
                Ok(Some((code, epoch))) => adopt_exit_status(job, code, epoch),
                _ if process_gone(job.pid) => mark_missing(job),
                _ => continue,
            }
            if let Err(e) = self.store.write(job) {
                tracing::error!(job_id, error = %e, "Failed to persist adopted job exit");
            }
            gone.push(job_id);
        }
        for job_id in &gone {
            self.adopted.remove(job_id);
        }
        gone.len()
    }

    /// Transport to mbatchd was lost: clear every resend stamp, keep the
    /// commit flags.
    pub fn link_down(&mut self) -> usize {
        let mut cleared = 0;
        for job in self.jobs.values_mut() {
            if job.clear_sent() {
                cleared += 1;
                if let Err(e) = self.store.write(job) {
                    tracing::error!(job_id = job.job_id, error = %e, "Failed to persist cleared stamps");
                }
            }
        }
        tracing::info!(jobs = cleared, "Link down, unacked stages will be resent");
        cleared
    }

    /// Sends the next pending stage of every job, in job-id order.
    pub fn drive<S: MbdSink + ?Sized>(&mut self, sink: &mut S) -> Result<usize> {
        let mut sent = 0;

        for job in self.jobs.values_mut() {
            if !sink.is_ready() {
                break;
            }
            let Some(op) = commit::next_send(job) else {
                continue;
            };

            let msg = match op {
                Opcode::NewJobReply => Message::NewJobReply(NewJobReply {
                    job_id: job.job_id,
                    code: SbdReplyCode::NoError,
                    reply: Some(job.reply()),
                }),
                Opcode::JobExecute => Message::JobExecute(status_req(job, JobStatus::Running)),
                Opcode::JobFinish => Message::JobFinish(status_req(job, finish_status(job))),
                _ => continue,
            };
            let seq = sink.send(msg)?;

            let stamp = Some(now());
            match op {
                Opcode::NewJobReply => job.reply_sent = stamp,
                Opcode::JobExecute => job.execute_sent = stamp,
                _ => job.finish_sent = stamp,
            }
            if let Err(e) = self.store.write(job) {
                tracing::error!(job_id = job.job_id, error = %e, "Failed to persist sent stamp");
            }

            tracing::info!(job_id = job.job_id, op = %op, seq, "Sent to mbatchd");
            sent += 1;
        }
        Ok(sent)
    }

    /// Refreshes the run time of executing jobs and reports it.
    pub fn update_runtimes<S: MbdSink + ?Sized>(&mut self, sink: &mut S) -> Result<usize> {
        let now = now();
        let mut sent = 0;

        for job in self.jobs.values_mut() {
            if job.state != JobState::Running
                || !job.execute_acked
                || job.exit_status_valid
                || job.start_time == 0
            {
                continue;
            }
            job.run_time = now - job.start_time;
            if sink.is_ready() {
                sink.send(Message::RusageUpdate(status_req(job, JobStatus::Running)))?;
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Delivers a signal to the job's process group, or its pid when the
    /// group is unknown.
    pub fn signal_job(&self, req: &JobSignalReq) -> JobSignalReply {
        let reply = |rc, detail_errno| JobSignalReply {
            job_id: req.job_id,
            sig: req.sig,
            rc,
            detail_errno,
        };

        let Some(job) = self.jobs.get(&req.job_id) else {
            return reply(ReplyCode::NoJob, 0);
        };
        let Ok(sig) = Signal::try_from(req.sig) else {
            return reply(ReplyCode::BadArg, Errno::EINVAL as i32);
        };
        if job.pid <= 0 && job.pgid <= 0 {
            return reply(ReplyCode::NoJob, 0);
        }
        if job.exit_status_valid || job.missing {
            return reply(ReplyCode::JobFinished, 0);
        }

        let result = if job.pgid > 0 {
            killpg(Pid::from_raw(job.pgid), sig)
        } else {
            kill(Pid::from_raw(job.pid), sig)
        };

        match result {
            Ok(()) => {
                tracing::info!(job_id = job.job_id, signal = %sig, "Signal delivered");
                reply(ReplyCode::NoError, 0)
            }
            Err(Errno::ESRCH) => reply(ReplyCode::NoJob, Errno::ESRCH as i32),
            Err(e) => {
                tracing::error!(job_id = job.job_id, signal = %sig, error = %e, "Signal delivery failed");
                reply(ReplyCode::SysCall, e as i32)
            }
        }
    }
}

fn status_req(job: &Job, new_status: JobStatus) -> StatusReq {
    StatusReq {
        job_id: job.job_id,
        job_pid: job.pid,
        job_pgid: job.pgid,
        new_status,
        exit_status: job.exit_status,
        exec_uid: job.spec.user_id,
        exec_username: job.exec_username.clone(),
        exec_home: job.spec.sub_home_dir.clone(),
        exec_cwd: job.exec_cwd.clone(),
        run_time: job.run_time,
    }
}

fn finish_status(job: &Job) -> JobStatus {
    if !job.missing && job.exit_code() == Some(0) {
        JobStatus::Done
    } else {
        JobStatus::Exit
    }
}

fn recovered_status(job: &Job) -> JobStatus {
    match job.state {
        JobState::New => JobStatus::Started,
        JobState::Running if !job.exit_status_valid && !job.missing => JobStatus::Running,
        _ => finish_status(job),
    }
}

fn adopt_exit_status(job: &mut Job, code: i32, epoch: i64) {
    if code >= 128 {
        job.exit_status = raw_signal_status(code - 128, false);
        job.state = JobState::Killed;
    } else {
        job.exit_status = raw_exit_status(code);
        job.state = JobState::Exited;
    }
    job.exit_status_valid = true;
    job.end_time = epoch;
    job.jstatus = finish_status(job);
}

fn mark_missing(job: &mut Job) {
    job.missing = true;
    job.state = JobState::Failed;
    job.end_time = now();
    job.jstatus = JobStatus::Exit;
}

/// Kills and collects a child that was never recorded.
fn discard_child(child: Pid) {
    if killpg(child, Signal::SIGKILL).is_err() {
        let _ = kill(child, Signal::SIGKILL);
    }
    if let Err(e) = waitpid(child, None) {
        tracing::warn!(pid = child.as_raw(), error = %e, "Cannot collect discarded child");
    }
}

/// True when `kill(pid, 0)` reports the process does not exist.
fn process_gone(pid: i32) -> bool {
    pid > 0 && kill(Pid::from_raw(pid), None) == Err(Errno::ESRCH)
}
