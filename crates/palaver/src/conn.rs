//! One websocket endpoint as the hub sees it.
//!
//! Each accepted socket gets a reader task and a writer task; everything the
//! hub wants to send goes through the per-connection outbound queue, so the
//! sink has a single writer. The handle is the cheap clonable view the
//! registry and router work with.
//!
//! Liveness model: the keepalive ticker sends a websocket ping and clears
//! `alive`; a pong or any inbound frame sets it again and refreshes
//! `last_activity`. A connection is declared dead only when `alive` is clear
//! AND it has been idle past the dead threshold; the reaper enforces that.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use palaverproto::{Frame, Message, Role};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

/// Idle threshold past which a non-responding connection is terminated.
pub const DEAD_AFTER: Duration = Duration::from_secs(120);

/// Deadline for draining the outbound queue on graceful close.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Outbound queue depth per connection.
pub const OUTBOUND_QUEUE: usize = 256;

/// Monotonic connection id, assigned on accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("{conn} is gone (outbound channel closed)")]
    Gone { conn: ConnId },

    #[error("{conn} outbound queue is full")]
    QueueFull { conn: ConnId },
}

fn role_from_u8(v: u8) -> Role {
    match v {
        1 => Role::Automator,
        2 => Role::Requester,
        _ => Role::Unassigned,
    }
}

fn role_to_u8(role: Role) -> u8 {
    match role {
        Role::Unassigned => 0,
        Role::Automator => 1,
        Role::Requester => 2,
    }
}

/// State shared between the reader/writer tasks and every handle clone.
#[derive(Debug)]
pub struct ConnShared {
    role: AtomicU8,
    alive: AtomicBool,
    closing: AtomicBool,
    messages_seen: AtomicU64,
    last_activity: Mutex<Instant>,
    /// Client id attached at registration; never outlives the connection.
    client_id: Mutex<Option<String>>,
}

impl ConnShared {
    fn new() -> Self {
        Self {
            role: AtomicU8::new(role_to_u8(Role::Unassigned)),
            alive: AtomicBool::new(true),
            closing: AtomicBool::new(false),
            messages_seen: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            client_id: Mutex::new(None),
        }
    }
}

/// Clonable view of one connection.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub id: ConnId,
    pub addr: SocketAddr,
    outbound: mpsc::Sender<WsMessage>,
    cancel: CancellationToken,
    shared: Arc<ConnShared>,
}

impl ConnHandle {
    /// Create a handle plus the receiving end of its outbound queue.
    pub fn new(
        id: ConnId,
        addr: SocketAddr,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        (
            Self {
                id,
                addr,
                outbound: tx,
                cancel,
                shared: Arc::new(ConnShared::new()),
            },
            rx,
        )
    }

    pub fn role(&self) -> Role {
        role_from_u8(self.shared.role.load(Ordering::Relaxed))
    }

    pub fn set_role(&self, role: Role) {
        self.shared.role.store(role_to_u8(role), Ordering::Relaxed);
    }

    pub fn client_id(&self) -> Option<String> {
        self.shared.client_id.lock().ok().and_then(|g| g.clone())
    }

    pub fn set_client_id(&self, id: impl Into<String>) {
        if let Ok(mut guard) = self.shared.client_id.lock() {
            *guard = Some(id.into());
        }
    }

    /// Record inbound activity: refreshes last-activity, sets the liveness
    /// flag, bumps the message counter.
    pub fn touch(&self) {
        if let Ok(mut guard) = self.shared.last_activity.lock() {
            *guard = Instant::now();
        }
        self.shared.alive.store(true, Ordering::Relaxed);
        self.shared.messages_seen.fetch_add(1, Ordering::Relaxed);
    }

    /// The keepalive ticker clears the flag when it sends a ping; anything
    /// inbound sets it back.
    pub fn clear_alive(&self) {
        self.shared.alive.store(false, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        self.shared
            .last_activity
            .lock()
            .map(|g| g.elapsed())
            .unwrap_or_default()
    }

    pub fn messages_seen(&self) -> u64 {
        self.shared.messages_seen.load(Ordering::Relaxed)
    }

    /// Dead = ping unanswered AND idle past the threshold. Everything else
    /// counts as live for routing purposes.
    pub fn is_live(&self) -> bool {
        self.shared.alive.load(Ordering::Relaxed) || self.idle_for() <= DEAD_AFTER
    }

    pub fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::Relaxed)
    }

    /// Begin a close: the reader task observes the token, sends a Close
    /// frame, and lets the writer drain.
    pub fn begin_close(&self) {
        self.shared.closing.store(true, Ordering::Relaxed);
        self.cancel.cancel();
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Queue a typed message.
    pub async fn send(&self, message: Message) -> Result<(), ConnError> {
        self.send_text(message.to_text(palaverproto::now_ms())).await
    }

    /// Queue a raw frame (the relay path).
    pub async fn send_frame(&self, frame: &Frame) -> Result<(), ConnError> {
        self.send_text(frame.to_text()).await
    }

    pub async fn send_text(&self, text: String) -> Result<(), ConnError> {
        self.send_ws(WsMessage::text(text)).await
    }

    pub async fn send_ws(&self, message: WsMessage) -> Result<(), ConnError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| ConnError::Gone { conn: self.id })
    }

    /// Non-blocking variant for ticker paths that must not stall on one slow
    /// peer.
    pub fn try_send_ws(&self, message: WsMessage) -> Result<(), ConnError> {
        self.outbound.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnError::QueueFull { conn: self.id },
            mpsc::error::TrySendError::Closed(_) => ConnError::Gone { conn: self.id },
        })
    }
}
