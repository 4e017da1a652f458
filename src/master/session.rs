use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::master::registry::MasterJobRegistry;
use crate::protocol::{Message, PacketCodec, ReplyCode};

pub type SharedRegistry = Arc<Mutex<MasterJobRegistry>>;

/// Serves one sbatchd connection against the shared registry.
pub struct MasterSession {
    registry: SharedRegistry,
    framed: Framed<TcpStream, PacketCodec>,
    host: Option<String>,
    next_seq: i32,
}

impl MasterSession {
    pub fn new(registry: SharedRegistry, stream: TcpStream) -> Self {
        Self {
            registry,
            framed: Framed::new(stream, PacketCodec),
            host: None,
            next_seq: 0,
        }
    }

    /// Runs until the peer disconnects. The host is detached on exit.
    pub async fn run(mut self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let result = self.serve(tx.clone(), &mut rx).await;

        if let Some(host) = self.host.take() {
            self.registry.lock().await.handle_disconnect(&host, &tx);
        }
        result
    }

    async fn serve(
        &mut self,
        tx: mpsc::UnboundedSender<Message>,
        rx: &mut mpsc::UnboundedReceiver<Message>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                frame = self.framed.next() => {
                    let packet = match frame {
                        Some(packet) => packet?,
                        None => return Ok(()),
                    };
                    let seq = packet.sequence;

                    let reply = match Message::from_packet(&packet) {
                        Ok(Message::SbdRegister(reg)) => {
                            let reply = self
                                .registry
                                .lock()
                                .await
                                .handle_register(&reg.hostname, tx.clone());
                            if reply == Message::SbdRegisterAck {
                                self.host = Some(reg.hostname);
                            }
                            Some(reply)
                        }
                        Ok(msg) if self.host.is_some() => {
                            self.registry.lock().await.handle_message(seq, msg)
                        }
                        Ok(msg) => {
                            tracing::warn!(op = %msg.opcode(), "Message before registration");
                            Some(Message::error(ReplyCode::BadHost))
                        }
                        Err(e) => {
                            tracing::error!(seq, error = %e, "Bad packet from sbatchd");
                            Some(Message::error(ReplyCode::Protocol))
                        }
                    };

                    if let Some(reply) = reply {
                        self.framed.send(reply.to_packet(seq)?).await?;
                    }
                }

                // Dispatches and signals queued by the registry
                Some(msg) = rx.recv() => {
                    self.next_seq = self.next_seq.wrapping_add(1).max(1);
                    self.framed.send(msg.to_packet(self.next_seq)?).await?;
                }
            }
        }
    }
}

/// Accepts sbatchd connections until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    registry: SharedRegistry,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                tracing::debug!(%peer, "sbatchd connected");
                let session = MasterSession::new(registry.clone(), stream);
                tokio::spawn(async move {
                    if let Err(e) = session.run().await {
                        tracing::warn!(%peer, error = %e, "sbatchd session ended");
                    }
                });
            }
        }
    }
}
