//! Acceptance rules of the ordered commit handshake.
//!
//! Each job walks `NEW -> PID_SENT -> PID_ACKED -> EXEC_SENT -> EXEC_ACKED
//! -> FINISH_SENT -> FINISH_ACKED`. A stage is only sent once the previous
//! one is acked locally, and mbatchd only acks a stage it has durably logged.

use crate::job::Job;
use crate::protocol::message::{JobStatusAck, Opcode, ReplyCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineStage {
    New,
    PidSent,
    PidAcked,
    ExecSent,
    ExecAcked,
    FinishSent,
    FinishAcked,
}

impl PipelineStage {
    /// Derives the stage from the job's flags and resend stamps.
    pub fn of(job: &Job) -> Self {
        if job.finish_acked {
            PipelineStage::FinishAcked
        } else if job.finish_sent.is_some() {
            PipelineStage::FinishSent
        } else if job.execute_acked {
            PipelineStage::ExecAcked
        } else if job.execute_sent.is_some() {
            PipelineStage::ExecSent
        } else if job.pid_acked {
            PipelineStage::PidAcked
        } else if job.reply_sent.is_some() {
            PipelineStage::PidSent
        } else {
            PipelineStage::New
        }
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineStage::New => "NEW",
            PipelineStage::PidSent => "PID_SENT",
            PipelineStage::PidAcked => "PID_ACKED",
            PipelineStage::ExecSent => "EXEC_SENT",
            PipelineStage::ExecAcked => "EXEC_ACKED",
            PipelineStage::FinishSent => "FINISH_SENT",
            PipelineStage::FinishAcked => "FINISH_ACKED",
        };
        f.write_str(s)
    }
}

/// Reply codes for which mbatchd considers a status update committed.
pub fn is_committed(code: ReplyCode) -> bool {
    matches!(
        code,
        ReplyCode::NoError | ReplyCode::StopJob | ReplyCode::LockJob
    )
}

/// Carrier opcode of the ack for a committed operation.
pub fn ack_opcode(committed_op: Opcode) -> Option<Opcode> {
    match committed_op {
        Opcode::NewJobReply => Some(Opcode::NewJobAck),
        Opcode::JobExecute => Some(Opcode::JobExecuteAck),
        Opcode::JobFinish => Some(Opcode::JobFinishAck),
        _ => None,
    }
}

/// Operation acknowledged by an ack carrier.
pub fn acked_operation(carrier: Opcode) -> Option<Opcode> {
    match carrier {
        Opcode::NewJobAck => Some(Opcode::NewJobReply),
        Opcode::JobExecuteAck => Some(Opcode::JobExecute),
        Opcode::JobFinishAck => Some(Opcode::JobFinish),
        _ => None,
    }
}

/// What to do with an incoming ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckVerdict {
    /// First receipt, advance the job.
    Apply,
    /// Stage already committed locally.
    Duplicate,
    /// `acked_op` disagrees with the carrier opcode.
    Mismatch,
    /// The previous stage is not acked yet.
    OutOfOrder,
    /// FINISH acked for a job with neither exit status nor missing flag.
    NoExitStatus,
}

/// Classifies an ack received on `carrier` against the local job.
pub fn classify_ack(job: &Job, carrier: Opcode, ack: &JobStatusAck) -> AckVerdict {
    if acked_operation(carrier) != Some(ack.acked_op) {
        return AckVerdict::Mismatch;
    }
    ack_verdict(job, ack.acked_op)
}

/// Verdict for a commit of `acked_op` given the job's current flags.
pub fn ack_verdict(job: &Job, acked_op: Opcode) -> AckVerdict {
    match acked_op {
        Opcode::NewJobReply => {
            if job.pid_acked {
                AckVerdict::Duplicate
            } else {
                AckVerdict::Apply
            }
        }
        Opcode::JobExecute => {
            if !job.pid_acked {
                AckVerdict::OutOfOrder
            } else if job.execute_acked {
                AckVerdict::Duplicate
            } else {
                AckVerdict::Apply
            }
        }
        Opcode::JobFinish => {
            if job.finish_acked {
                AckVerdict::Duplicate
            } else if !job.pid_acked || !job.execute_acked {
                AckVerdict::OutOfOrder
            } else if !job.exit_status_valid && !job.missing {
                AckVerdict::NoExitStatus
            } else {
                AckVerdict::Apply
            }
        }
        _ => AckVerdict::Mismatch,
    }
}

/// The next message the pipeline should send for `job`, if any.
///
/// At most one stage is offered per call, so EXECUTE and FINISH never go
/// out in the same pass.
pub fn next_send(job: &Job) -> Option<Opcode> {
    if job.finish_acked {
        return None;
    }
    if !job.pid_acked {
        return (job.reply_sent.is_none() && job.pid > 0).then_some(Opcode::NewJobReply);
    }
    if !job.execute_acked {
        return job.execute_sent.is_none().then_some(Opcode::JobExecute);
    }
    if (job.exit_status_valid || job.missing) && job.finish_sent.is_none() {
        return Some(Opcode::JobFinish);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(job_id: i64, acked_op: Opcode) -> JobStatusAck {
        JobStatusAck {
            job_id,
            seq: 1,
            acked_op,
        }
    }

    fn spawned(job_id: i64) -> Job {
        let mut job = Job::recovered(job_id);
        job.pid = 1234;
        job.pgid = 1234;
        job
    }

    #[test]
    fn committed_set() {
        assert!(is_committed(ReplyCode::NoError));
        assert!(is_committed(ReplyCode::StopJob));
        assert!(is_committed(ReplyCode::LockJob));
        assert!(!is_committed(ReplyCode::NoJob));
        assert!(!is_committed(ReplyCode::SysCall));
        assert!(!is_committed(ReplyCode::NotStarted));
    }

    #[test]
    fn ack_opcode_pairs() {
        for op in [Opcode::NewJobReply, Opcode::JobExecute, Opcode::JobFinish] {
            let carrier = ack_opcode(op).unwrap();
            assert_eq!(acked_operation(carrier), Some(op));
        }
        assert_eq!(ack_opcode(Opcode::RusageUpdate), None);
    }

    #[test]
    fn stage_follows_flags() {
        let mut job = spawned(1);
        assert_eq!(PipelineStage::of(&job), PipelineStage::New);
        job.reply_sent = Some(10);
        assert_eq!(PipelineStage::of(&job), PipelineStage::PidSent);
        job.pid_acked = true;
        assert_eq!(PipelineStage::of(&job), PipelineStage::PidAcked);
        job.execute_sent = Some(11);
        assert_eq!(PipelineStage::of(&job), PipelineStage::ExecSent);
        job.execute_acked = true;
        assert_eq!(PipelineStage::of(&job), PipelineStage::ExecAcked);
        job.finish_sent = Some(12);
        assert_eq!(PipelineStage::of(&job), PipelineStage::FinishSent);
        job.finish_acked = true;
        assert_eq!(PipelineStage::of(&job), PipelineStage::FinishAcked);
    }

    #[test]
    fn mismatched_carrier_is_rejected() {
        let job = spawned(1);
        assert_eq!(
            classify_ack(&job, Opcode::JobExecuteAck, &ack(1, Opcode::NewJobReply)),
            AckVerdict::Mismatch
        );
    }

    #[test]
    fn execute_before_pid_is_out_of_order() {
        let job = spawned(1);
        assert_eq!(
            classify_ack(&job, Opcode::JobExecuteAck, &ack(1, Opcode::JobExecute)),
            AckVerdict::OutOfOrder
        );
    }

    #[test]
    fn finish_without_status_is_flagged() {
        let mut job = spawned(1);
        job.pid_acked = true;
        job.execute_acked = true;
        assert_eq!(
            classify_ack(&job, Opcode::JobFinishAck, &ack(1, Opcode::JobFinish)),
            AckVerdict::NoExitStatus
        );
        job.missing = true;
        assert_eq!(
            classify_ack(&job, Opcode::JobFinishAck, &ack(1, Opcode::JobFinish)),
            AckVerdict::Apply
        );
    }

    #[test]
    fn duplicate_pid_ack() {
        let mut job = spawned(1);
        job.pid_acked = true;
        assert_eq!(
            classify_ack(&job, Opcode::NewJobAck, &ack(1, Opcode::NewJobReply)),
            AckVerdict::Duplicate
        );
    }

    #[test]
    fn next_send_walks_one_stage_at_a_time() {
        let mut job = Job::recovered(1);
        // not spawned
        assert_eq!(next_send(&job), None);

        job.pid = 99;
        assert_eq!(next_send(&job), Some(Opcode::NewJobReply));
        job.reply_sent = Some(1);
        assert_eq!(next_send(&job), None);

        job.pid_acked = true;
        job.exit_status_valid = true;
        assert_eq!(next_send(&job), Some(Opcode::JobExecute));
        job.execute_sent = Some(2);
        assert_eq!(next_send(&job), None);

        job.execute_acked = true;
        assert_eq!(next_send(&job), Some(Opcode::JobFinish));
        job.finish_sent = Some(3);
        assert_eq!(next_send(&job), None);
    }

    #[test]
    fn finish_waits_for_exit_status() {
        let mut job = spawned(1);
        job.pid_acked = true;
        job.execute_acked = true;
        assert_eq!(next_send(&job), None);
        job.missing = true;
        assert_eq!(next_send(&job), Some(Opcode::JobFinish));
    }
}
