//! Connection from sbatchd to mbatchd.

use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::error::{Result, SbdError};
use crate::protocol::message::SbdRegister;
use crate::protocol::{Message, Packet, PacketCodec};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outbound side of the master link as seen by the executor.
pub trait MbdSink {
    /// True while a connection is established.
    fn is_ready(&self) -> bool;

    /// Queues `msg` under a fresh sequence number and returns it.
    fn send(&mut self, msg: Message) -> Result<i32>;

    /// Queues `msg` as the answer to request `seq`.
    fn reply(&mut self, seq: i32, msg: Message) -> Result<()>;
}

/// Framed TCP link to mbatchd with an outbound queue.
///
/// Messages are queued synchronously by the executor and written by
/// [`MbdLink::flush`] from the event loop.
#[derive(Debug, Default)]
pub struct MbdLink {
    framed: Option<Framed<TcpStream, PacketCodec>>,
    outbound: VecDeque<Packet>,
    next_seq: i32,
}

impl MbdLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects to `addr` and queues the registration for `hostname`.
    pub async fn connect(&mut self, addr: &str, hostname: &str) -> Result<()> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                SbdError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                ))
            })??;
        stream.set_nodelay(true)?;

        self.framed = Some(Framed::new(stream, PacketCodec));
        self.outbound.clear();
        self.send(Message::SbdRegister(SbdRegister {
            hostname: hostname.to_string(),
        }))?;

        tracing::info!(mbd = addr, hostname, "Connected to mbatchd");
        Ok(())
    }

    /// Drops the connection and everything still queued on it.
    pub fn disconnect(&mut self) {
        if self.framed.take().is_some() {
            tracing::warn!(dropped = self.outbound.len(), "Link to mbatchd lost");
        }
        self.outbound.clear();
    }

    /// Writes every queued packet.
    pub async fn flush(&mut self) -> Result<()> {
        let Some(framed) = self.framed.as_mut() else {
            self.outbound.clear();
            return Ok(());
        };
        if self.outbound.is_empty() {
            return Ok(());
        }
        while let Some(packet) = self.outbound.pop_front() {
            framed.feed(packet).await?;
        }
        framed.flush().await
    }

    /// Next packet from mbatchd. Pending forever while disconnected.
    pub async fn next_packet(&mut self) -> Option<Result<Packet>> {
        match self.framed.as_mut() {
            Some(framed) => framed.next().await,
            None => std::future::pending().await,
        }
    }

    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    fn push(&mut self, seq: i32, msg: &Message) -> Result<()> {
        if self.framed.is_none() {
            return Err(SbdError::LinkNotReady);
        }
        let packet = msg.to_packet(seq)?;
        tracing::debug!(op = %msg.opcode(), seq, "Queued for mbatchd");
        self.outbound.push_back(packet);
        Ok(())
    }
}

impl MbdSink for MbdLink {
    fn is_ready(&self) -> bool {
        self.framed.is_some()
    }

    fn send(&mut self, msg: Message) -> Result<i32> {
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        let seq = self.next_seq;
        self.push(seq, &msg)?;
        Ok(seq)
    }

    fn reply(&mut self, seq: i32, msg: Message) -> Result<()> {
        self.push(seq, &msg)
    }
}
