//! Dispatch of packets received by sbatchd.

use crate::error::Result;
use crate::protocol::message::JobsListReply;
use crate::protocol::{Message, Opcode, Packet, ReplyCode};
use crate::sbd::executor::JobExecutor;
use crate::sbd::link::MbdSink;

/// What the event loop does with the link after a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Keep,
    /// mbatchd withheld a commit. Drop the connection and resend after
    /// reconnecting.
    Reconnect,
}

/// Handles one packet from mbatchd, then drives the pipeline.
///
/// Undecodable packets are answered with a protocol error and change
/// nothing. An ERROR from mbatchd clears every resend stamp and nothing is
/// driven on the current connection.
pub fn handle_packet<S: MbdSink + ?Sized>(
    executor: &mut JobExecutor,
    sink: &mut S,
    packet: &Packet,
) -> Result<LinkAction> {
    let seq = packet.sequence;
    let msg = match Message::from_packet(packet) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::error!(op = packet.operation, seq, error = %e, "Bad packet from mbatchd");
            sink.reply(seq, Message::error(ReplyCode::Protocol))?;
            return Ok(LinkAction::Keep);
        }
    };

    tracing::debug!(op = %msg.opcode(), seq, "Packet from mbatchd");

    match msg {
        Message::NewJob(spec) => executor.handle_new_job(seq, &spec, sink)?,
        Message::NewJobAck(ack) | Message::JobExecuteAck(ack) | Message::JobFinishAck(ack) => {
            // carrier opcode comes from the header, not the payload
            let carrier = Opcode::try_from(packet.operation)?;
            if let Err(e) = executor.on_ack(carrier, &ack) {
                tracing::error!(job_id = ack.job_id, error = %e, "Ack not applied");
            }
        }
        Message::JobSignal(req) => {
            let reply = executor.signal_job(&req);
            sink.reply(seq, Message::JobSignalReply(reply))?;
        }
        Message::SbdRegisterAck => {
            tracing::info!("Registered with mbatchd");
        }
        Message::Error(err) => {
            tracing::warn!(code = %err.code, seq, "mbatchd withheld a commit, reconnecting");
            executor.link_down();
            return Ok(LinkAction::Reconnect);
        }
        other => {
            tracing::error!(op = %other.opcode(), seq, "Unexpected operation from mbatchd");
            sink.reply(seq, Message::error(ReplyCode::Protocol))?;
        }
    }

    executor.drive(sink)?;
    Ok(LinkAction::Keep)
}

/// Answers a request from a local client.
pub fn handle_client(executor: &JobExecutor, msg: &Message) -> Message {
    match msg {
        Message::JobsList => Message::JobsListReply(JobsListReply {
            jobs: executor.jobs_info(),
        }),
        other => {
            tracing::warn!(op = %other.opcode(), "Unsupported client request");
            Message::error(ReplyCode::Protocol)
        }
    }
}
