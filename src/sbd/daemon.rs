use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::config::SbdConfig;
use crate::error::{Result, SbdError};
use crate::protocol::message::JobInfo;
use crate::protocol::{Message, PacketCodec, ReplyCode};
use crate::sbd::executor::JobExecutor;
use crate::sbd::handler::{self, LinkAction};
use crate::sbd::link::{MbdLink, MbdSink};
use crate::sbd::reaper;
use crate::store::JobStore;

/// A local client request waiting for the event loop.
struct ClientRequest {
    msg: Message,
    reply: oneshot::Sender<Message>,
}

/// sbatchd: one event loop owning every job on this host.
pub struct SbdDaemon {
    config: SbdConfig,
    executor: JobExecutor,
    link: MbdLink,
    listener: TcpListener,
}

impl SbdDaemon {
    /// Opens the state directory, recovers persisted jobs and binds the
    /// client listener.
    pub async fn bind(config: SbdConfig) -> Result<Self> {
        let store = JobStore::init(&config)?;
        let mut executor = JobExecutor::new(config.clone(), store);
        let summary = executor.recover()?;
        tracing::info!(
            loaded = summary.loaded,
            pruned = summary.pruned,
            "sbatchd state recovered"
        );

        let listener = TcpListener::bind(config.listen_addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "sbatchd client listener ready");

        Ok(Self {
            config,
            executor,
            link: MbdLink::new(),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Running jobs are left alone on exit; their records are picked up by
    /// the next start.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let mut sigchld = signal(SignalKind::child())?;
        let mut ticker = tokio::time::interval(self.config.timer_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let (client_tx, mut client_rx) = mpsc::channel::<ClientRequest>(64);

        tracing::info!(
            hostname = %self.config.hostname,
            mbd = %self.config.mbd_addr,
            debug = self.config.debug,
            "sbatchd running"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown requested");
                    break;
                }

                _ = sigchld.recv() => {
                    reaper::reap_children(&mut self.executor);
                    self.drive();
                }

                // Maintenance: reconnect, reap, report usage, resend
                _ = ticker.tick() => {
                    if !self.link.is_ready() {
                        self.reconnect().await;
                    }
                    reaper::reap_children(&mut self.executor);
                    self.executor.probe_adopted();
                    if let Err(e) = self.executor.update_runtimes(&mut self.link) {
                        tracing::warn!(error = %e, "Cannot report run times");
                    }
                    self.drive();
                }

                frame = self.link.next_packet() => {
                    match frame {
                        Some(Ok(packet)) => {
                            match handler::handle_packet(&mut self.executor, &mut self.link, &packet) {
                                Ok(LinkAction::Keep) => {}
                                Ok(LinkAction::Reconnect) => self.link.disconnect(),
                                Err(e) => {
                                    tracing::error!(error = %e, "Failed to handle packet from mbatchd");
                                }
                            }
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Link to mbatchd failed");
                            self.link_down();
                        }
                        None => {
                            tracing::warn!("mbatchd closed the connection");
                            self.link_down();
                        }
                    }
                }

                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "Client connected");
                            tokio::spawn(serve_client(stream, client_tx.clone()));
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }

                Some(req) = client_rx.recv() => {
                    let reply = handler::handle_client(&self.executor, &req.msg);
                    let _ = req.reply.send(reply);
                }
            }

            if let Err(e) = self.link.flush().await {
                tracing::error!(error = %e, "Write to mbatchd failed");
                self.link_down();
            }
        }

        if let Err(e) = self.link.flush().await {
            tracing::warn!(error = %e, "Final flush to mbatchd failed");
        }
        tracing::info!(jobs = self.executor.len(), "sbatchd stopped");
        Ok(())
    }

    async fn reconnect(&mut self) {
        match self
            .link
            .connect(&self.config.mbd_addr, &self.config.hostname)
            .await
        {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(mbd = %self.config.mbd_addr, error = %e, "Cannot reach mbatchd");
            }
        }
    }

    fn drive(&mut self) {
        if let Err(e) = self.executor.drive(&mut self.link) {
            tracing::warn!(error = %e, "Pipeline drive interrupted");
        }
    }

    fn link_down(&mut self) {
        self.link.disconnect();
        self.executor.link_down();
    }
}

/// Reads requests from a local client and forwards them to the event loop.
async fn serve_client(stream: TcpStream, requests: mpsc::Sender<ClientRequest>) {
    let mut framed = Framed::new(stream, PacketCodec);

    while let Some(frame) = framed.next().await {
        let packet = match frame {
            Ok(packet) => packet,
            Err(e) => {
                tracing::debug!(error = %e, "Client stream error");
                return;
            }
        };

        let reply = match Message::from_packet(&packet) {
            Ok(msg) => {
                let (tx, rx) = oneshot::channel();
                if requests.send(ClientRequest { msg, reply: tx }).await.is_err() {
                    return;
                }
                match rx.await {
                    Ok(reply) => reply,
                    Err(_) => return,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Bad client request");
                Message::error(ReplyCode::Protocol)
            }
        };

        let packet = match reply.to_packet(packet.sequence) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::error!(error = %e, "Cannot encode client reply");
                return;
            }
        };
        if framed.send(packet).await.is_err() {
            return;
        }
    }
}

/// Fetches the job listing from a running sbatchd.
pub async fn fetch_jobs(addr: &str) -> Result<Vec<JobInfo>> {
    let stream = TcpStream::connect(addr).await?;
    let mut framed = Framed::new(stream, PacketCodec);
    framed.send(Message::JobsList.to_packet(1)?).await?;

    match framed.next().await {
        Some(packet) => match Message::from_packet(&packet?)? {
            Message::JobsListReply(reply) => Ok(reply.jobs),
            Message::Error(err) => Err(SbdError::Protocol(format!(
                "sbatchd answered {}",
                err.code
            ))),
            other => Err(SbdError::Protocol(format!(
                "unexpected reply {}",
                other.opcode()
            ))),
        },
        None => Err(SbdError::Protocol(
            "sbatchd closed the connection".to_string(),
        )),
    }
}
