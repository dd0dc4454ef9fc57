use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::codec::FrameCodec;
use crate::commands::Command;
use crate::counters::CountersSnapshot;
use crate::features::{self, Features};
use crate::frame::Frame;
use crate::queue::{Batch, ReplyHandle, RequestQueue, Submission};
use crate::sentinel::{self, Config};
use crate::subscriptions::Subscriptions;
use crate::Error;

/// Lifecycle of a connection. Only `Open` admits ordinary requests;
/// `Opening` admits the handshake. Terminal states (`Closed`, `Faulted`) are
/// not reusable; reconnecting means building a new `Connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Opening,
    Open,
    Closing,
    Faulted,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Faulted)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Opening => "opening",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Faulted => "faulted",
        };
        write!(f, "{}", name)
    }
}

/// One logical connection to a Redis-compatible server. Many tasks may
/// submit commands concurrently; they are pipelined over a single ordered
/// byte stream and their replies are matched back in strict send order.
pub struct Connection {
    pub(crate) id: Uuid,
    pub(crate) queue: Arc<RequestQueue>,
    pub(crate) subscriptions: Arc<Subscriptions>,
    pub(crate) features: Features,
    pub(crate) config: Config,
}

impl Connection {
    /// Parses a configuration string, resolves the endpoint (directly or via
    /// sentinels when `serviceName` is present) and opens a connection to it.
    pub async fn connect(configuration: &str) -> Result<Connection, Error> {
        let config = Config::parse(configuration)?;

        let mut log = String::new();
        let selected = sentinel::select_configuration(&config, &mut log).await;
        debug!(log = %log.trim_end(), "endpoint selection");

        match selected {
            Some(address) => Connection::open(&address, config).await,
            None => Err(Error::Transport("no server available".to_string())),
        }
    }

    /// Opens a connection to a known address, runs the handshake and spawns
    /// the writer, reader and deadline-sweeper loops.
    pub async fn open(address: &str, config: Config) -> Result<Connection, Error> {
        let id = Uuid::new_v4();
        let stream = TcpStream::connect(address).await?;
        let (read_half, write_half) = stream.into_split();

        let queue = RequestQueue::new(0);
        queue.transition(ConnectionState::Opening);
        let subscriptions = Arc::new(Subscriptions::new());

        tokio::spawn(read_loop(id, queue.clone(), subscriptions.clone(), read_half));
        tokio::spawn(write_loop(id, queue.clone(), write_half));
        tokio::spawn(sweep_deadlines(queue.clone()));

        let mut connection = Connection {
            id,
            queue,
            subscriptions,
            features: Features::default(),
            config,
        };

        connection.features = connection.handshake().await?;
        connection.queue.transition(ConnectionState::Open);
        connection.queue.writer.notify_one();
        info!(connection_id = %id, %address, "connection open");

        Ok(connection)
    }

    /// Handshake commands run while the connection is Opening and jump any
    /// queue there could be: INFO for feature detection, then CLIENT SETNAME
    /// and SELECT as configuration demands.
    async fn handshake(&self) -> Result<Features, Error> {
        let info = self.submit_handshake(Command::new("INFO"))?;
        let features = match info.wait().await {
            Ok(Frame::Bulk(payload)) => {
                let (version, role) = features::parse_info(&String::from_utf8_lossy(&payload));
                debug!(connection_id = %self.id, %version, ?role, "detected server");
                Features::derive(version, role)
            }
            // A server that rejects or garbles INFO still speaks the
            // protocol; it simply advertises no features.
            Ok(_) | Err(Error::Server(_)) => Features::default(),
            Err(err) => return Err(err),
        };

        if features.client_name {
            if let Some(name) = self.config.name.clone() {
                let ack =
                    self.submit_handshake(Command::new("CLIENT").arg("SETNAME").arg(name))?;
                match ack.wait().await {
                    Ok(_) | Err(Error::Server(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        if self.config.db != 0 {
            let ack = self
                .submit_handshake(Command::new("SELECT").arg(self.config.db.to_string()))?;
            ack.wait().await?;
            self.queue.set_pending_db(self.config.db);
        }

        Ok(features)
    }

    fn submit_handshake(&self, command: Command) -> Result<ReplyHandle, Error> {
        self.queue.submit(Submission {
            command,
            db: None,
            deadline: Some(Instant::now() + self.config.timeout),
            high_priority: true,
            handshake: true,
        })
    }

    /// The one path every command takes into the engine.
    pub(crate) fn submit(&self, db: Option<u32>, command: Command) -> Result<ReplyHandle, Error> {
        self.queue.submit(Submission {
            command,
            db,
            deadline: Some(Instant::now() + self.config.timeout),
            high_priority: false,
            handshake: false,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.queue.state()
    }

    pub fn features(&self) -> Features {
        self.features
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// An immutable snapshot of the connection's counters.
    pub fn counters(&self) -> CountersSnapshot {
        self.queue.snapshot()
    }

    /// Gracefully closes the connection: no new requests are admitted,
    /// in-flight work drains (bounded by the configured timeout), and
    /// whatever is left is cancelled with the graceful-close reason.
    pub async fn close(&self) {
        if !self.queue.begin_close() {
            return;
        }

        let _ = tokio::time::timeout(self.config.timeout, async {
            loop {
                let drained = self.queue.drained.notified();
                tokio::pin!(drained);
                // Register for the drain signal before checking, so a drain
                // landing in between cannot be missed.
                drained.as_mut().enable();
                if self.queue.is_drained() {
                    break;
                }
                drained.await;
            }
        })
        .await;

        self.queue.finish_close();
        info!(connection_id = %self.id, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.queue.abandon();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Drains ready requests and writes them out, many commands per transport
/// write. Runs until the connection reaches a terminal state or the
/// transport fails.
#[instrument(name = "writer", skip_all, fields(connection_id = %id))]
async fn write_loop(id: Uuid, queue: Arc<RequestQueue>, mut writer: OwnedWriteHalf) {
    let mut codec = FrameCodec;
    loop {
        match queue.take_batch() {
            Batch::Write(commands) => {
                let mut buffer = BytesMut::new();
                for command in &commands {
                    if let Err(err) = codec.encode(command, &mut buffer) {
                        queue.fault(err);
                        return;
                    }
                }
                debug!(commands = commands.len(), bytes = buffer.len(), "writing batch");
                if let Err(err) = writer.write_all(&buffer).await {
                    queue.fault(Error::Transport(err.to_string()));
                    return;
                }
                queue.mark_sent(commands.len() as u64);
            }
            Batch::Idle => queue.writer.notified().await,
            Batch::Shutdown => break,
        }
    }
    let _ = writer.shutdown().await;
    debug!("writer loop stopped");
}

/// Continuously decodes frames. Pushed pub/sub frames are routed to the
/// subscription manager; everything else completes the oldest outstanding
/// request.
#[instrument(name = "reader", skip_all, fields(connection_id = %id))]
async fn read_loop(
    id: Uuid,
    queue: Arc<RequestQueue>,
    subscriptions: Arc<Subscriptions>,
    read_half: OwnedReadHalf,
) {
    let mut frames = FramedRead::new(read_half, FrameCodec);

    // Pinned once so the shutdown signal is registered for the whole loop;
    // a notification between iterations is not lost.
    let shutdown = queue.shutdown.notified();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            next = frames.next() => match next {
                Some(Ok(frame)) => {
                    if let Some(reply) = subscriptions.route(frame) {
                        if let Err(err) = queue.complete_head(reply) {
                            queue.fault(err);
                            break;
                        }
                    }
                }
                Some(Err(err)) => {
                    queue.fault(err);
                    break;
                }
                None => {
                    if !queue.state().is_terminal() && queue.state() != ConnectionState::Closing {
                        queue.fault(Error::Transport(
                            "connection closed by server".to_string(),
                        ));
                    }
                    break;
                }
            }
        }
    }
    debug!("reader loop stopped");
}

/// Fails requests whose deadline passed. Mirrors the queue's view of the
/// next due instant and sleeps until then, or parks until a new deadline is
/// registered.
async fn sweep_deadlines(queue: Arc<RequestQueue>) {
    loop {
        if queue.state().is_terminal() {
            break;
        }

        match queue.expire_due(Instant::now()) {
            Some(next) => {
                tokio::select! {
                    _ = sleep_until(next) => {}
                    _ = queue.sweeper.notified() => {}
                }
            }
            None => queue.sweeper.notified().await,
        }
    }
}

/// Returns the default per-request deadline budget when a configuration
/// does not name one.
pub(crate) const fn default_timeout() -> Duration {
    Duration::from_secs(10)
}
