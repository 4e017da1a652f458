use tokio::sync::mpsc;

use lavalite_sbd::job::JobSpec;
use lavalite_sbd::master::{JobEvent, MasterJobRegistry, MemoryEventLog};
use lavalite_sbd::protocol::message::{
    JobReply, JobStatus, NewJobReply, PendReason, SbdRegister, SbdReplyCode, StatusReq,
};
use lavalite_sbd::protocol::{Message, Opcode, ReplyCode};

struct Fixture {
    registry: MasterJobRegistry,
    log: MemoryEventLog,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
}

fn attached() -> Fixture {
    let log = MemoryEventLog::new();
    let mut registry = MasterJobRegistry::new(log.clone());
    registry.add_host("node01");
    let (tx, rx) = mpsc::unbounded_channel();
    assert_eq!(
        registry.handle_register("node01", tx.clone()),
        Message::SbdRegisterAck
    );
    Fixture {
        registry,
        log,
        tx,
        rx,
    }
}

fn spec(job_id: i64) -> JobSpec {
    JobSpec {
        user_name: "alice".to_string(),
        sub_home_dir: "/home/alice".to_string(),
        ..JobSpec::new(job_id, "/bin/true")
    }
}

fn started_reply(job_id: i64, pid: i32) -> NewJobReply {
    NewJobReply {
        job_id,
        code: SbdReplyCode::NoError,
        reply: Some(JobReply {
            job_id,
            job_pid: pid,
            job_pgid: pid,
            jstatus: JobStatus::Running,
        }),
    }
}

fn status(job_id: i64, new_status: JobStatus, exit_status: i32) -> StatusReq {
    StatusReq {
        job_id,
        job_pid: 4242,
        job_pgid: 4242,
        new_status,
        exit_status,
        exec_uid: 1000,
        exec_username: "alice".to_string(),
        exec_home: "/home/alice".to_string(),
        exec_cwd: "/home/alice".to_string(),
        run_time: 12,
    }
}

fn acked_op(msg: &Option<Message>) -> Option<(Opcode, Opcode, i32)> {
    match msg {
        Some(Message::NewJobAck(a)) => Some((Opcode::NewJobAck, a.acked_op, a.seq)),
        Some(Message::JobExecuteAck(a)) => Some((Opcode::JobExecuteAck, a.acked_op, a.seq)),
        Some(Message::JobFinishAck(a)) => Some((Opcode::JobFinishAck, a.acked_op, a.seq)),
        _ => None,
    }
}

/// Dispatches `job_id` and accepts its start with `pid`.
fn running(fx: &mut Fixture, job_id: i64, pid: i32) {
    fx.registry.dispatch(spec(job_id), "node01").unwrap();
    let ack = fx.registry.handle_new_job_reply(1, &started_reply(job_id, pid));
    assert!(acked_op(&ack).is_some());
}

#[test]
fn test_register_unknown_host_is_rejected() {
    let mut registry = MasterJobRegistry::new(MemoryEventLog::new());
    let (tx, _rx) = mpsc::unbounded_channel();
    assert_eq!(
        registry.handle_register("stranger", tx),
        Message::error(ReplyCode::BadHost)
    );
    assert!(!registry.is_attached("stranger"));
}

#[test]
fn test_dispatch_sends_new_job() {
    let mut fx = attached();
    fx.registry.dispatch(spec(42), "node01").unwrap();

    let sent = fx.rx.try_recv().unwrap();
    assert_eq!(sent, Message::NewJob(spec(42)));
    assert_eq!(fx.registry.job(42).unwrap().status, JobStatus::Started);
    assert_eq!(
        fx.log.events(),
        vec![JobEvent::Dispatch {
            job_id: 42,
            host: "node01".to_string()
        }]
    );

    // A started job cannot be dispatched again.
    assert!(fx.registry.dispatch(spec(42), "node01").is_err());
}

#[test]
fn test_dispatch_requires_attached_host() {
    let mut registry = MasterJobRegistry::new(MemoryEventLog::new());
    registry.add_host("node02");
    assert!(registry.dispatch(spec(1), "node02").is_err());
    assert!(registry.dispatch(spec(1), "nowhere").is_err());
    assert!(registry.job(1).is_none());
}

#[test]
fn test_new_job_reply_is_acked_after_logging() {
    let mut fx = attached();
    fx.registry.dispatch(spec(42), "node01").unwrap();

    let ack = fx.registry.handle_new_job_reply(7, &started_reply(42, 4242));
    assert_eq!(acked_op(&ack), Some((Opcode::NewJobAck, Opcode::NewJobReply, 7)));

    let job = fx.registry.job(42).unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.pid, 4242);
    assert!(fx.log.events().contains(&JobEvent::StartAccept {
        job_id: 42,
        pid: 4242,
        pgid: 4242
    }));
}

#[test]
fn test_duplicate_new_job_reply_is_reacked_once_logged() {
    let mut fx = attached();
    running(&mut fx, 42, 4242);
    let logged = fx.log.events().len();

    let again = fx.registry.handle_new_job_reply(8, &started_reply(42, 4242));
    assert_eq!(acked_op(&again), Some((Opcode::NewJobAck, Opcode::NewJobReply, 8)));
    assert_eq!(fx.log.events().len(), logged);

    // A different pid is not the job we accepted.
    assert_eq!(fx.registry.handle_new_job_reply(9, &started_reply(42, 1)), None);
}

#[test]
fn test_failed_start_goes_back_to_pending() {
    let mut fx = attached();
    fx.registry.dispatch(spec(43), "node01").unwrap();

    let reply = NewJobReply {
        job_id: 43,
        code: SbdReplyCode::ForkFail,
        reply: None,
    };
    assert_eq!(fx.registry.handle_new_job_reply(2, &reply), None);

    let job = fx.registry.job(43).unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.pend_reason, Some(PendReason::JobStartFail));
    assert_eq!(job.pid, -1);
    assert!(fx.log.events().contains(&JobEvent::StartFail { job_id: 43 }));

    // Pending jobs may be dispatched again.
    fx.registry.dispatch(spec(43), "node01").unwrap();
}

#[test]
fn test_log_failure_withholds_ack() {
    let mut fx = attached();
    fx.registry.dispatch(spec(44), "node01").unwrap();

    fx.log.set_failing(true);
    assert_eq!(fx.registry.handle_new_job_reply(3, &started_reply(44, 99)), None);
    assert_eq!(fx.registry.job(44).unwrap().status, JobStatus::Started);

    // The resend after the log recovers is committed.
    fx.log.set_failing(false);
    let ack = fx.registry.handle_new_job_reply(4, &started_reply(44, 99));
    assert!(acked_op(&ack).is_some());

    fx.log.set_failing(true);
    let reply = fx
        .registry
        .handle_status(5, Opcode::JobExecute, &status(44, JobStatus::Running, 0));
    assert_eq!(reply, Some(Message::error(ReplyCode::SysCall)));
    assert!(!fx.registry.job(44).unwrap().execute_committed);
}

#[test]
fn test_execute_before_start_is_not_committed() {
    let mut fx = attached();
    fx.registry.dispatch(spec(45), "node01").unwrap();

    let reply = fx
        .registry
        .handle_status(1, Opcode::JobExecute, &status(45, JobStatus::Running, 0));
    assert_eq!(reply, Some(Message::error(ReplyCode::NotStarted)));

    let reply = fx
        .registry
        .handle_status(1, Opcode::JobExecute, &status(999, JobStatus::Running, 0));
    assert_eq!(reply, Some(Message::error(ReplyCode::NoJob)));
}

#[test]
fn test_execute_and_finish_are_committed() {
    let mut fx = attached();
    running(&mut fx, 46, 4242);

    // FINISH before EXECUTE is refused.
    let early = fx
        .registry
        .handle_status(2, Opcode::JobFinish, &status(46, JobStatus::Done, 0));
    assert_eq!(early, Some(Message::error(ReplyCode::NotStarted)));

    let ack = fx
        .registry
        .handle_status(3, Opcode::JobExecute, &status(46, JobStatus::Running, 0));
    assert_eq!(acked_op(&ack), Some((Opcode::JobExecuteAck, Opcode::JobExecute, 3)));
    let job = fx.registry.job(46).unwrap();
    assert!(job.execute_committed);
    assert_eq!(job.exec_username, "alice");

    // Duplicate EXECUTE is acked again without a second event.
    let events = fx.log.events().len();
    let again = fx
        .registry
        .handle_status(4, Opcode::JobExecute, &status(46, JobStatus::Running, 0));
    assert!(acked_op(&again).is_some());
    assert_eq!(fx.log.events().len(), events);

    let ack = fx
        .registry
        .handle_status(5, Opcode::JobFinish, &status(46, JobStatus::Exit, 3 << 8));
    assert_eq!(acked_op(&ack), Some((Opcode::JobFinishAck, Opcode::JobFinish, 5)));
    let job = fx.registry.job(46).unwrap();
    assert!(job.finish_committed);
    assert_eq!(job.status, JobStatus::Exit);
    assert_eq!(job.exit_status, 3 << 8);
    assert_eq!(job.run_time, 12);

    let dup = fx
        .registry
        .handle_status(6, Opcode::JobFinish, &status(46, JobStatus::Exit, 3 << 8));
    assert!(acked_op(&dup).is_some());
}

#[test]
fn test_start_reply_never_finishes_job() {
    let mut fx = attached();

    // A resent start reply from a job that has already exited.
    let mut reply = started_reply(53, 77);
    fx.registry.dispatch(spec(53), "node01").unwrap();
    reply.reply.as_mut().unwrap().jstatus = JobStatus::Done;
    let ack = fx.registry.handle_new_job_reply(1, &reply);
    assert_eq!(acked_op(&ack), Some((Opcode::NewJobAck, Opcode::NewJobReply, 1)));
    assert_eq!(fx.registry.job(53).unwrap().status, JobStatus::Running);

    assert_eq!(
        fx.registry
            .status_job(Opcode::JobExecute, &status(53, JobStatus::Running, 0)),
        ReplyCode::NoError
    );
    let fin = fx
        .registry
        .handle_status(2, Opcode::JobFinish, &status(53, JobStatus::Done, 0));
    assert!(acked_op(&fin).is_some());
    assert_eq!(fx.registry.job(53).unwrap().status, JobStatus::Done);
}

#[test]
fn test_suspended_job_execute_commits_with_stop() {
    let mut fx = attached();
    running(&mut fx, 47, 4242);
    assert!(fx.registry.suspend_job(47));

    assert_eq!(
        fx.registry
            .status_job(Opcode::JobExecute, &status(47, JobStatus::Running, 0)),
        ReplyCode::StopJob
    );
    assert!(fx.registry.job(47).unwrap().execute_committed);
}

#[test]
fn test_suspended_execute_is_acked() {
    let mut fx = attached();
    running(&mut fx, 48, 4242);
    fx.registry.suspend_job(48);

    let ack = fx
        .registry
        .handle_status(9, Opcode::JobExecute, &status(48, JobStatus::Running, 0));
    assert_eq!(acked_op(&ack), Some((Opcode::JobExecuteAck, Opcode::JobExecute, 9)));
}

#[test]
fn test_rusage_is_never_acked() {
    let mut fx = attached();
    running(&mut fx, 49, 4242);

    let mut req = status(49, JobStatus::Running, 0);
    req.run_time = 30;
    assert_eq!(
        fx.registry.handle_status(1, Opcode::RusageUpdate, &req),
        None
    );
    assert_eq!(fx.registry.job(49).unwrap().run_time, 30);

    assert_eq!(
        fx.registry.handle_message(2, Message::RusageUpdate(req)),
        None
    );
}

#[test]
fn test_disconnect_keeps_job_state() {
    let mut fx = attached();
    running(&mut fx, 50, 4242);
    fx.registry
        .handle_status(1, Opcode::JobExecute, &status(50, JobStatus::Running, 0));

    fx.registry.handle_disconnect("node01", &fx.tx);
    assert!(!fx.registry.is_attached("node01"));
    let job = fx.registry.job(50).unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.execute_committed);
    assert!(fx.registry.signal_job(50, 15).is_err());

    // Reconnect; resent stages are acked as duplicates.
    let (tx, _rx) = mpsc::unbounded_channel();
    fx.registry.handle_register("node01", tx);
    let ack = fx
        .registry
        .handle_status(2, Opcode::JobExecute, &status(50, JobStatus::Running, 0));
    assert!(acked_op(&ack).is_some());
}

#[test]
fn test_stale_session_close_keeps_new_registration() {
    let mut fx = attached();
    running(&mut fx, 51, 4242);

    // sbatchd reconnects before the old session notices it is gone.
    let (new_tx, mut new_rx) = mpsc::unbounded_channel();
    fx.registry.handle_register("node01", new_tx.clone());
    fx.registry.handle_disconnect("node01", &fx.tx);
    assert!(fx.registry.is_attached("node01"));

    fx.registry.signal_job(51, 15).unwrap();
    assert!(matches!(new_rx.try_recv().unwrap(), Message::JobSignal(_)));

    fx.registry.handle_disconnect("node01", &new_tx);
    assert!(!fx.registry.is_attached("node01"));
}

#[test]
fn test_signal_is_routed_to_host() {
    let mut fx = attached();
    running(&mut fx, 51, 4242);
    let _ = fx.rx.try_recv();

    fx.registry.signal_job(51, 15).unwrap();
    match fx.rx.try_recv().unwrap() {
        Message::JobSignal(req) => {
            assert_eq!(req.job_id, 51);
            assert_eq!(req.sig, 15);
        }
        other => panic!("expected JOB_SIGNAL, got {:?}", other),
    }
    assert!(fx.registry.signal_job(9999, 15).is_err());
}

#[test]
fn test_unexpected_message_is_protocol_error() {
    let mut fx = attached();
    assert_eq!(
        fx.registry.handle_message(
            1,
            Message::SbdRegister(SbdRegister {
                hostname: "node01".to_string()
            })
        ),
        Some(Message::error(ReplyCode::Protocol))
    );
    assert_eq!(
        fx.registry
            .handle_status(1, Opcode::NewJob, &status(1, JobStatus::Running, 0)),
        Some(Message::error(ReplyCode::Protocol))
    );
}
