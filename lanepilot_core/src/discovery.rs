//! Peer discovery - authenticated UDP broadcast handshake.
//!
//! ```text
//!   requester (actuator node)                 responder (vision node)
//!   ─────────────────────────                 ───────────────────────
//!   "P2P_BROADCAST_REQ:" + nonce[16]  ──────►
//!                                      ◄──────  "P2P_BROADCAST_RES:" + HMAC-SHA256(secret, nonce)[32]
//!   verify (constant time) ─► PeerSession
//! ```
//!
//! Within one attempt the requester drops its own broadcast echo, malformed
//! packets and digests that fail verification, and keeps waiting until the
//! attempt deadline. Only a verified digest yields a peer.

use hmac::{Hmac, Mac};
use lanepilot_env::{Fault, LanePilotContext, SessionId, Shutdown, SupervisedTask};
use sha2::Sha256;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const REQUEST_TAG: &[u8] = b"P2P_BROADCAST_REQ:";
pub const RESPONSE_TAG: &[u8] = b"P2P_BROADCAST_RES:";
pub const NONCE_LEN: usize = 16;
pub const DIGEST_LEN: usize = 32;

/// Environment variable holding the handshake secret.
pub const SECRET_ENV_VAR: &str = "LANEPILOT_HANDSHAKE_SECRET";

const MAX_PACKET: usize = 1024;

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Handshake secret missing: set {0}")]
    MissingSecret(String),

    #[error("Handshake secret must not be empty")]
    EmptySecret,

    #[error("No peer found after {attempts} attempt(s)")]
    NoPeer { attempts: u32 },

    #[error("Discovery socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed discovery packet: {0}")]
    Malformed(String),

    #[error("HMAC verification failed, peer not authorized")]
    BadDigest,

    #[error("Discovery responder failed: {0}")]
    Responder(Fault),

    #[error("Discovery interrupted")]
    Interrupted,
}

impl From<DiscoveryError> for Fault {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::MissingSecret(_) | DiscoveryError::EmptySecret => {
                Fault::configuration(err.to_string())
            }
            DiscoveryError::NoPeer { .. } | DiscoveryError::Io(_) => Fault::transport(err.to_string()),
            DiscoveryError::Malformed(_) | DiscoveryError::BadDigest => Fault::protocol(err.to_string()),
            DiscoveryError::Responder(fault) => fault,
            DiscoveryError::Interrupted => Fault::Interrupted,
        }
    }
}

// ============================================================================
// SHARED SECRET
// ============================================================================

/// HMAC key shared by both nodes. Never printed.
#[derive(Clone)]
pub struct SharedSecret {
    keyed: HmacSha256,
}

impl SharedSecret {
    pub fn new(bytes: impl AsRef<[u8]>) -> Result<Self, DiscoveryError> {
        let bytes = bytes.as_ref();
        if bytes.is_empty() {
            return Err(DiscoveryError::EmptySecret);
        }
        let keyed = <HmacSha256 as Mac>::new_from_slice(bytes).map_err(|_| DiscoveryError::EmptySecret)?;
        Ok(Self { keyed })
    }

    /// Reads the secret from `var`.
    pub fn from_env(var: &str) -> Result<Self, DiscoveryError> {
        let value = std::env::var(var).map_err(|_| DiscoveryError::MissingSecret(var.to_string()))?;
        Self::new(value)
    }

    /// `HMAC-SHA256(secret, nonce)`.
    pub fn sign(&self, nonce: &[u8]) -> [u8; DIGEST_LEN] {
        let mut mac = self.keyed.clone();
        mac.update(nonce);
        mac.finalize().into_bytes().into()
    }

    /// Constant-time check of `digest` against `HMAC(secret, nonce)`.
    pub fn verify(&self, nonce: &[u8], digest: &[u8]) -> bool {
        let mut mac = self.keyed.clone();
        mac.update(nonce);
        mac.verify_slice(digest).is_ok()
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(<redacted>)")
    }
}

// ============================================================================
// PACKETS
// ============================================================================

pub fn encode_request(nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
    [REQUEST_TAG, nonce.as_slice()].concat()
}

/// Extracts the nonce of a well-formed request.
pub fn parse_request(packet: &[u8]) -> Result<[u8; NONCE_LEN], DiscoveryError> {
    let payload = packet
        .strip_prefix(REQUEST_TAG)
        .ok_or_else(|| DiscoveryError::Malformed("expected P2P_BROADCAST_REQ".into()))?;

    payload
        .try_into()
        .map_err(|_| DiscoveryError::Malformed(format!("nonce is {} bytes, expected {}", payload.len(), NONCE_LEN)))
}

pub fn encode_response(secret: &SharedSecret, nonce: &[u8]) -> Vec<u8> {
    [RESPONSE_TAG, secret.sign(nonce).as_slice()].concat()
}

/// Checks a response packet against the nonce this requester sent.
pub fn verify_response(secret: &SharedSecret, nonce: &[u8], packet: &[u8]) -> Result<(), DiscoveryError> {
    let digest = packet
        .strip_prefix(RESPONSE_TAG)
        .ok_or_else(|| DiscoveryError::Malformed("expected P2P_BROADCAST_RES".into()))?;

    if secret.verify(nonce, digest) {
        Ok(())
    } else {
        Err(DiscoveryError::BadDigest)
    }
}

// ============================================================================
// CONFIGURATION & SESSION
// ============================================================================

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port both roles use
    pub port: u16,

    /// Where requests are broadcast
    pub broadcast_address: IpAddr,

    /// Local interface to bind
    pub bind_address: IpAddr,

    /// This node's own address, used to drop its broadcast echo
    pub self_address: Option<IpAddr>,

    /// Wait per attempt
    pub timeout: Duration,

    pub attempts: u32,

    /// Responder returns after answering the first peer
    pub stop_on_response: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self_address: None,
            timeout: Duration::from_secs(10),
            attempts: 3,
            stop_on_response: true,
        }
    }
}

/// The authenticated link to the other node.
#[derive(Debug)]
pub struct PeerSession {
    pub local_address: SocketAddr,
    pub peer_address: SocketAddr,
    pub session_id: SessionId,
    secret: SharedSecret,
    established: AtomicBool,
}

impl PeerSession {
    fn new(local_address: SocketAddr, peer_address: SocketAddr, secret: SharedSecret) -> Self {
        Self {
            local_address,
            peer_address,
            session_id: SessionId::new(),
            secret,
            established: AtomicBool::new(true),
        }
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.peer_address.ip()
    }

    pub fn secret(&self) -> &SharedSecret {
        &self.secret
    }

    pub fn is_established(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }

    /// Marks the session closed. Returns false if it already was.
    pub fn close(&self) -> bool {
        self.established.swap(false, Ordering::AcqRel)
    }
}

// ============================================================================
// PEER DISCOVERY
// ============================================================================

/// Both discovery roles. A node uses exactly one.
pub struct PeerDiscovery<Ctx: LanePilotContext> {
    context: Arc<Ctx>,
    config: DiscoveryConfig,
    secret: SharedSecret,
    responder: tokio::sync::Mutex<Option<SupervisedTask>>,
    disposed: AtomicBool,
}

impl<Ctx: LanePilotContext> PeerDiscovery<Ctx> {
    pub fn new(context: Arc<Ctx>, config: DiscoveryConfig, secret: SharedSecret) -> Self {
        Self {
            context,
            config,
            secret,
            responder: tokio::sync::Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    fn is_self(&self, from: SocketAddr) -> bool {
        self.config.self_address == Some(from.ip())
    }

    /// Requester role: broadcasts a challenge and returns the first peer
    /// whose response verifies.
    pub async fn discover_peer(&self, shutdown: &Shutdown) -> Result<PeerSession, DiscoveryError> {
        let attempts = self.config.attempts.max(1);
        let target = SocketAddr::new(self.config.broadcast_address, self.config.port);

        for attempt in 1..=attempts {
            let socket = UdpSocket::bind(SocketAddr::new(self.config.bind_address, 0)).await?;
            socket.set_broadcast(true)?;

            let mut nonce = [0u8; NONCE_LEN];
            self.context.fill_random(&mut nonce);

            socket.send_to(&encode_request(&nonce), target).await?;
            info!("[{}/{}] Broadcasting to {}, waiting for response...", attempt, attempts, target);

            if let Some(peer) = self.await_response(&socket, &nonce, shutdown).await? {
                let session = PeerSession::new(socket.local_addr()?, peer, self.secret.clone());
                info!(peer = %peer, session = %session.session_id, "Peer authenticated");
                return Ok(session);
            }

            if attempt < attempts {
                warn!("Attempt {} timed out. Retrying...", attempt);
            } else {
                warn!("No response, peer not found.");
            }
        }

        Err(DiscoveryError::NoPeer { attempts })
    }

    async fn await_response(
        &self,
        socket: &UdpSocket,
        nonce: &[u8; NONCE_LEN],
        shutdown: &Shutdown,
    ) -> Result<Option<SocketAddr>, DiscoveryError> {
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        let mut buf = [0u8; MAX_PACKET];

        loop {
            let (len, from) = tokio::select! {
                _ = shutdown.triggered() => return Err(DiscoveryError::Interrupted),
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                received = socket.recv_from(&mut buf) => received?,
            };

            if self.is_self(from) {
                debug!(from = %from, "Ignoring own broadcast echo");
                continue;
            }

            match verify_response(&self.secret, nonce, &buf[..len]) {
                Ok(()) => return Ok(Some(from)),
                Err(e) => warn!(from = %from, "Discarding response: {}", e),
            }
        }
    }

    /// Responder role: binds the discovery port and answers requests.
    pub async fn respond_to_broadcast(&self, shutdown: &Shutdown) -> Result<PeerSession, DiscoveryError> {
        // A lingering responder still holds the discovery port
        self.stop_responder().await;
        let socket = UdpSocket::bind(SocketAddr::new(self.config.bind_address, self.config.port)).await?;
        self.respond_on(socket, shutdown).await
    }

    /// Answers requests on an already bound socket.
    ///
    /// The responder runs as a `SupervisedTask`. The first answered peer is
    /// returned; with `stop_on_response` the task then exits, otherwise it
    /// keeps serving until `dispose()`.
    /// Any responder left from an earlier call is stopped first.
    pub async fn respond_on(&self, socket: UdpSocket, shutdown: &Shutdown) -> Result<PeerSession, DiscoveryError> {
        self.stop_responder().await;
        let local = socket.local_addr()?;
        info!("Listening for broadcast messages on {}...", local);

        let (peer_tx, peer_rx) = oneshot::channel();
        let secret = self.secret.clone();
        let self_address = self.config.self_address;
        let stop_on_response = self.config.stop_on_response;

        let task = SupervisedTask::start("discovery-responder", move |task_shutdown| {
            serve_requests(socket, secret, self_address, stop_on_response, peer_tx, task_shutdown)
        });
        let task_shutdown = task.shutdown_handle();
        *self.responder.lock().await = Some(task);

        let answered = tokio::select! {
            _ = shutdown.triggered() => {
                task_shutdown.trigger();
                return Err(DiscoveryError::Interrupted);
            }
            answered = peer_rx => answered,
        };

        match answered {
            Ok(peer) => Ok(PeerSession::new(local, peer, self.secret.clone())),
            Err(_) => {
                // Responder exited without answering anyone
                let fault = match self.responder.lock().await.as_ref() {
                    Some(task) => task.join().await.err(),
                    None => None,
                };
                Err(match fault {
                    Some(f) => DiscoveryError::Responder(f),
                    None => DiscoveryError::Interrupted,
                })
            }
        }
    }

    /// Stops the responder (if any). Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_responder().await;
        debug!("Peer discovery disposed");
    }

    async fn stop_responder(&self) {
        let previous = self.responder.lock().await.take();
        if let Some(task) = previous {
            task.stop();
            if let Err(fault) = task.join().await {
                debug!("Previous responder ended with: {}", fault);
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

async fn serve_requests(
    socket: UdpSocket,
    secret: SharedSecret,
    self_address: Option<IpAddr>,
    stop_on_response: bool,
    peer_tx: oneshot::Sender<SocketAddr>,
    shutdown: Shutdown,
) -> Result<(), Fault> {
    let mut peer_tx = Some(peer_tx);
    let mut buf = [0u8; MAX_PACKET];

    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.triggered() => return Ok(()),
            received = socket.recv_from(&mut buf) => received?,
        };

        if self_address == Some(from.ip()) {
            debug!(from = %from, "Ignoring message from self");
            continue;
        }

        let nonce = match parse_request(&buf[..len]) {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(from = %from, "Invalid message received: {}", e);
                continue;
            }
        };

        socket.send_to(&encode_response(&secret, &nonce), from).await?;
        info!(peer = %from, "Answered discovery request");

        if let Some(tx) = peer_tx.take() {
            let _ = tx.send(from);
        }
        if stop_on_response {
            info!("Response sent, stopping broadcast responder.");
            return Ok(());
        }
    }
}
