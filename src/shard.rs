//! IRC connection shard.
//!
//! Each shard owns one long-lived TCP session to the chat server and runs
//! in its own task: registration, PING/PONG, socket writes serialized
//! through a command channel, and reconnection with capped exponential
//! backoff. Inbound traffic and lifecycle transitions are emitted as
//! [`ShardEvent`]s; the shard itself knows nothing about channels beyond
//! relaying JOIN/PART/SAY.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use eloward_irc::{Command, IrcCodec, Message};

use crate::auth::TokenProvider;

/// Extensions required for membership events, message tags, and
/// moderation-context commands.
const CAPABILITIES: &str = "twitch.tv/membership twitch.tv/tags twitch.tv/commands";

/// Tag-bearing lines far exceed the classic 512-byte limit.
const MAX_LINE_LEN: usize = 8192;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Commands accepted from the scheduler, dispatcher, and supervisor.
/// Channel names are logins without the `#` sigil.
#[derive(Debug)]
pub enum ShardCommand {
    Join(String),
    Part(String),
    Say(String, String),
    /// Close and reconnect immediately with a fresh credential. Silent: no
    /// backoff, no `Closed` event.
    Rotate,
    /// Send a farewell QUIT and stop the shard task.
    Quit(String),
}

/// Lifecycle and traffic events, tagged with the shard id.
#[derive(Debug)]
pub enum ShardEvent {
    Registered(usize),
    Closed(usize),
    Line(usize, Message),
}

/// Cheap cloneable handle for submitting commands to a shard.
#[derive(Clone)]
pub struct ShardHandle {
    id: usize,
    tx: mpsc::Sender<ShardCommand>,
}

impl ShardHandle {
    pub(crate) fn new(id: usize, tx: mpsc::Sender<ShardCommand>) -> ShardHandle {
        ShardHandle { id, tx }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub async fn join(&self, channel: &str) {
        self.send(ShardCommand::Join(channel.to_string())).await;
    }

    pub async fn part(&self, channel: &str) {
        self.send(ShardCommand::Part(channel.to_string())).await;
    }

    pub async fn say(&self, channel: &str, text: &str) {
        self.send(ShardCommand::Say(channel.to_string(), text.to_string()))
            .await;
    }

    pub async fn rotate(&self) {
        self.send(ShardCommand::Rotate).await;
    }

    pub async fn quit(&self, farewell: &str) {
        self.send(ShardCommand::Quit(farewell.to_string())).await;
    }

    async fn send(&self, cmd: ShardCommand) {
        if self.tx.send(cmd).await.is_err() {
            warn!(shard = self.id, "shard task gone, command dropped");
        }
    }
}

/// Why a connection attempt ended.
enum Drive {
    Lost,
    Rotate,
    Quit,
}

pub struct Shard {
    id: usize,
    addr: String,
    provider: Arc<TokenProvider>,
    events: mpsc::Sender<ShardEvent>,
    commands: mpsc::Receiver<ShardCommand>,
}

/// Reconnect delay: `min(2^attempts * 1 s, 30 s)`.
fn backoff(attempts: u32) -> Duration {
    let secs = 1u64 << attempts.min(5);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

impl Shard {
    /// Spawn the shard task; the returned handle is the only way in.
    pub fn spawn(
        id: usize,
        addr: String,
        provider: Arc<TokenProvider>,
        events: mpsc::Sender<ShardEvent>,
    ) -> ShardHandle {
        let (tx, commands) = mpsc::channel(256);
        let shard = Shard {
            id,
            addr,
            provider,
            events,
            commands,
        };
        tokio::spawn(shard.run());
        ShardHandle::new(id, tx)
    }

    #[instrument(skip(self), fields(shard = self.id), name = "shard")]
    async fn run(mut self) {
        let mut attempts: u32 = 0;
        loop {
            match self.connect_and_drive(&mut attempts).await {
                Drive::Quit => {
                    info!("shard stopped");
                    break;
                }
                Drive::Rotate => {
                    // Rotation closes are silent; reconnect right away with
                    // whatever credential the provider now holds.
                    info!("reconnecting after credential rotation");
                    attempts = 0;
                }
                Drive::Lost => {
                    let _ = self.events.send(ShardEvent::Closed(self.id)).await;
                    let delay = backoff(attempts);
                    attempts = attempts.saturating_add(1);
                    warn!(attempts = attempts, delay_secs = delay.as_secs(), "connection lost, reconnecting");
                    tokio::time::sleep(delay).await;
                    if let Err(e) = self.provider.refresh().await {
                        debug!(error = %e, "pre-reconnect credential refresh failed, using current token");
                    }
                }
            }
        }
    }

    async fn connect_and_drive(&mut self, attempts: &mut u32) -> Drive {
        let stream = match TcpStream::connect(&self.addr).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "connect failed");
                return Drive::Lost;
            }
        };
        let mut framed = Framed::new(stream, IrcCodec::with_max_len(MAX_LINE_LEN));

        let cred = self.provider.current();
        for msg in [
            Message::cap_req(CAPABILITIES),
            Message::from_command(Command::Pass(cred.irc_pass())),
            Message::from_command(Command::Nick(cred.login.clone())),
        ] {
            if framed.send(msg).await.is_err() {
                return Drive::Lost;
            }
        }

        loop {
            tokio::select! {
                frame = framed.next() => {
                    match frame {
                        Some(Ok(msg)) => {
                            match &msg.command {
                                Command::Response(1, _) => {
                                    info!("registered");
                                    *attempts = 0;
                                    let _ = self.events.send(ShardEvent::Registered(self.id)).await;
                                }
                                Command::Ping(token) => {
                                    if framed.send(Message::pong(token)).await.is_err() {
                                        return Drive::Lost;
                                    }
                                }
                                _ => {
                                    let _ = self.events.send(ShardEvent::Line(self.id, msg)).await;
                                }
                            }
                        }
                        Some(Err(e)) if e.is_recoverable() => {
                            debug!(error = %e, "skipping unparseable line");
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "read error");
                            return Drive::Lost;
                        }
                        None => {
                            info!("server closed connection");
                            return Drive::Lost;
                        }
                    }
                }
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ShardCommand::Join(channel)) => {
                            if framed.send(Message::join(&format!("#{channel}"))).await.is_err() {
                                return Drive::Lost;
                            }
                        }
                        Some(ShardCommand::Part(channel)) => {
                            if framed.send(Message::part(&format!("#{channel}"))).await.is_err() {
                                return Drive::Lost;
                            }
                        }
                        Some(ShardCommand::Say(channel, text)) => {
                            if framed.send(Message::privmsg(&format!("#{channel}"), &text)).await.is_err() {
                                return Drive::Lost;
                            }
                        }
                        Some(ShardCommand::Rotate) => {
                            return Drive::Rotate;
                        }
                        Some(ShardCommand::Quit(farewell)) => {
                            let _ = framed.send(Message::quit(&farewell)).await;
                            let _ = framed.flush().await;
                            return Drive::Quit;
                        }
                        None => {
                            // All handles dropped; nothing can drive us.
                            return Drive::Quit;
                        }
                    }
                }
            }
        }
    }
}
