//! Command channel - request/reply transport between the two nodes.
//!
//! ```text
//!   vision node (client)                         actuator node (server)
//!   ────────────────────                         ──────────────────────
//!   send("switch", "0-->2") ── frame ──────────►  listeners, in registration order
//!                           ◄───────── frame ──   first listener reply, or {"status","ok"}
//!   every liveness_interval: {"status","ping"} ─► {"status","ok"}
//! ```
//!
//! Each side runs as one `SupervisedTask`. The server accepts exactly one
//! peer connection. A lost connection, a failed liveness probe or a reply
//! timeout faults the task, which surfaces to the retry supervisor.

use crate::wire::{write_frame, CommandMessage, FrameReader, WireError};
use async_trait::async_trait;
use lanepilot_env::{Fault, Shutdown, SupervisedTask};
use serde_json::Value;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

// ============================================================================
// LISTENERS
// ============================================================================

/// Receives every command delivered by the channel.
pub trait CommandListener: Send + Sync {
    /// Shown in log lines.
    fn name(&self) -> &str;

    /// Handles one command. `Ok(Some(reply))` replaces the default
    /// acknowledgment (the first listener to reply wins).
    fn on_command(&self, message: &CommandMessage) -> Result<Option<CommandMessage>, Fault>;
}

/// Handle returned by `add_listener`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered listener set shared between the channel handle and its task.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<Mutex<Vec<(ListenerId, Arc<dyn CommandListener>)>>>,
    next_id: Arc<AtomicU64>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, Arc<dyn CommandListener>)>> {
        self.listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add(&self, listener: Arc<dyn CommandListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!("Adding listener: {}", listener.name());
        self.lock().push((id, listener));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock();
        match listeners.iter().position(|(lid, _)| *lid == id) {
            Some(index) => {
                let (_, listener) = listeners.remove(index);
                info!("Removing listener: {}", listener.name());
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every listener in registration order.
    ///
    /// A listener that errors or panics is logged and skipped; the others
    /// still run. Returns the first reply any listener produced.
    pub fn dispatch(&self, message: &CommandMessage) -> Option<CommandMessage> {
        // Snapshot so listeners may add/remove listeners while running
        let listeners: Vec<Arc<dyn CommandListener>> = self.lock().iter().map(|(_, l)| Arc::clone(l)).collect();

        let mut reply = None;
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_command(message))) {
                Ok(Ok(Some(response))) => {
                    reply.get_or_insert(response);
                }
                Ok(Ok(None)) => {}
                Ok(Err(fault)) => warn!(listener = listener.name(), command = %message.command, "Listener failed: {}", fault),
                Err(_) => error!(listener = listener.name(), command = %message.command, "Listener panicked"),
            }
        }
        reply
    }
}

// ============================================================================
// SINK
// ============================================================================

/// Outbound path for commands, as used by the pipeline.
#[async_trait]
pub trait CommandSink: Send + Sync {
    /// Sends one command and returns the peer's reply.
    async fn send_command(&self, message: CommandMessage) -> Result<CommandMessage, Fault>;
}

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Client probe period; the server faults after two silent periods
    pub liveness_interval: Duration,

    /// Max wait for the reply to one request
    pub reply_timeout: Duration,

    /// Max wait for the TCP connect
    pub connect_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(30),
            reply_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Server,
    Client,
}

impl ChannelRole {
    fn label(&self) -> &'static str {
        match self {
            Self::Server => "command server",
            Self::Client => "command client",
        }
    }
}

struct Outbound {
    message: CommandMessage,
    reply: oneshot::Sender<Result<CommandMessage, Fault>>,
}

// ============================================================================
// CHANNEL
// ============================================================================

/// One end of the command channel.
pub struct CommandChannel {
    role: ChannelRole,
    local_addr: SocketAddr,
    listeners: ListenerRegistry,
    outbound: Option<mpsc::Sender<Outbound>>,
    task: SupervisedTask,
    config: ChannelConfig,
    disposed: AtomicBool,
}

impl CommandChannel {
    /// Server role: binds `addr` and serves the first peer that connects.
    pub async fn bind(addr: SocketAddr, config: ChannelConfig) -> Result<Self, Fault> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let listeners = ListenerRegistry::new();

        let task_listeners = listeners.clone();
        let idle_limit = config.liveness_interval * 2;
        let task = SupervisedTask::start("command-server", move |shutdown| {
            run_server(listener, task_listeners, idle_limit, shutdown)
        });

        info!("{} started on {}", ChannelRole::Server.label(), local_addr);
        Ok(Self {
            role: ChannelRole::Server,
            local_addr,
            listeners,
            outbound: None,
            task,
            config,
            disposed: AtomicBool::new(false),
        })
    }

    /// Client role: connects to the peer's server.
    pub async fn connect(peer: SocketAddr, config: ChannelConfig) -> Result<Self, Fault> {
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| Fault::Timeout(config.connect_timeout.as_millis() as u64))??;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr()?;

        let listeners = ListenerRegistry::new();
        let (tx, rx) = mpsc::channel(16);

        let task_listeners = listeners.clone();
        let task_config = config.clone();
        let task = SupervisedTask::start("command-client", move |shutdown| {
            let (reader, writer) = stream.into_split();
            run_client(reader, writer, rx, task_listeners, task_config, shutdown)
        });

        info!("{} connected to {}", ChannelRole::Client.label(), peer);
        Ok(Self {
            role: ChannelRole::Client,
            local_addr,
            listeners,
            outbound: Some(tx),
            task,
            config,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn add_listener(&self, listener: Arc<dyn CommandListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Sends one command and waits for its reply (client role only).
    ///
    /// Commands from one caller are delivered in call order.
    pub async fn send(&self, command: impl Into<String>, value: impl Into<Value>) -> Result<CommandMessage, Fault> {
        self.send_message(CommandMessage::new(command, value)).await
    }

    pub async fn send_message(&self, message: CommandMessage) -> Result<CommandMessage, Fault> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| Fault::protocol("the command server only replies; requests originate at the client"))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        outbound
            .send(Outbound {
                message,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Fault::transport("command channel closed"))?;

        reply_rx
            .await
            .map_err(|_| Fault::transport("command channel closed before reply"))?
    }

    /// Waits for the channel task to exit and returns its outcome.
    pub async fn join(&self) -> Result<(), Fault> {
        self.task.join().await
    }

    pub fn stop(&self) {
        self.task.stop();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancellation handle of the channel task.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.task.shutdown_handle()
    }

    /// Best-effort `"exit"` to the peer, then closes the transport and
    /// clears listeners. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.role == ChannelRole::Client && !self.task.is_finished() {
            let notice = self.send_message(CommandMessage::exit());
            match tokio::time::timeout(self.config.reply_timeout, notice).await {
                Ok(Ok(_)) => debug!("Exit notice acknowledged"),
                Ok(Err(fault)) => debug!("Exit notice not delivered: {}", fault),
                Err(_) => debug!("Exit notice timed out"),
            }
        }

        self.task.stop();
        let _ = self.task.join().await;
        self.listeners.clear();
        info!("{} disposed.", self.role.label());
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl CommandSink for CommandChannel {
    async fn send_command(&self, message: CommandMessage) -> Result<CommandMessage, Fault> {
        self.send_message(message).await
    }
}

// ============================================================================
// TASK BODIES
// ============================================================================

async fn run_server(
    listener: TcpListener,
    listeners: ListenerRegistry,
    idle_limit: Duration,
    shutdown: Shutdown,
) -> Result<(), Fault> {
    info!("Waiting for commands...");
    let (stream, peer) = tokio::select! {
        _ = shutdown.triggered() => return Ok(()),
        accepted = listener.accept() => accepted?,
    };
    // At most one peer session
    drop(listener);
    stream.set_nodelay(true)?;
    info!(peer = %peer, "Command peer connected");

    let (reader, mut writer) = stream.into_split();
    let mut reader = FrameReader::new(reader);
    let mut last_seen = Instant::now();

    loop {
        let frame = tokio::select! {
            _ = shutdown.triggered() => return Ok(()),
            _ = tokio::time::sleep_until(last_seen + idle_limit) => {
                return Err(Fault::transport(format!("no traffic from {} for {:?}", peer, idle_limit)));
            }
            frame = reader.read_frame() => frame,
        };
        last_seen = Instant::now();

        let message = match frame {
            Ok(Some(message)) => message,
            Ok(None) => return Err(Fault::transport(format!("{} closed the command channel", peer))),
            Err(WireError::Json(e)) => {
                warn!(peer = %peer, "Undecodable command: {}", e);
                write_frame(&mut writer, &CommandMessage::status_error(e.to_string())).await?;
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        if message.is_ping() {
            write_frame(&mut writer, &CommandMessage::status_ok()).await?;
            continue;
        }

        debug!(command = %message.command, value = %message.value, "Command received");
        let reply = listeners.dispatch(&message).unwrap_or_else(CommandMessage::status_ok);
        write_frame(&mut writer, &reply).await?;

        if message.is_exit() {
            info!("Exit command received, shutting down command server.");
            return Ok(());
        }
    }
}

async fn run_client<R, W>(
    reader: R,
    mut writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
    listeners: ListenerRegistry,
    config: ChannelConfig,
    shutdown: Shutdown,
) -> Result<(), Fault>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut reader = FrameReader::new(reader);
    let mut liveness = tokio::time::interval_at(Instant::now() + config.liveness_interval, config.liveness_interval);

    loop {
        tokio::select! {
            _ = shutdown.triggered() => return Ok(()),
            _ = liveness.tick() => {
                exchange(&mut reader, &mut writer, &CommandMessage::ping(), config.reply_timeout)
                    .await
                    .map_err(|f| Fault::transport(format!("liveness probe failed: {}", f)))?;
                debug!("Liveness probe answered");
            }
            request = outbound.recv() => {
                let Some(Outbound { message, reply }) = request else {
                    return Ok(());
                };
                let is_exit = message.is_exit();
                let result = exchange(&mut reader, &mut writer, &message, config.reply_timeout).await;

                if let Ok(response) = &result {
                    if !response.is_status_ok() {
                        listeners.dispatch(response);
                    }
                }
                let _ = reply.send(result.clone());
                result?;

                if is_exit {
                    info!("Exit sent, shutting down command client.");
                    return Ok(());
                }
            }
        }
    }
}

/// One request, one reply.
async fn exchange<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut W,
    message: &CommandMessage,
    reply_timeout: Duration,
) -> Result<CommandMessage, Fault>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    write_frame(writer, message).await?;
    match tokio::time::timeout(reply_timeout, reader.read_frame()).await {
        Err(_) => Err(Fault::Timeout(reply_timeout.as_millis() as u64)),
        Ok(Ok(Some(reply))) => Ok(reply),
        Ok(Ok(None)) => Err(Fault::transport("peer closed the command channel")),
        Ok(Err(e)) => Err(e.into()),
    }
}
