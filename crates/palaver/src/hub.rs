//! The hub value: registry, operation manager, route table, and the set of
//! live connections, owned together and passed by handle.
//!
//! There is one `Hub` per process but nothing global; the server, the
//! router, and the health endpoint all hold the same `Arc<Hub>`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use palaverconf::Config;
use palaverproto::{now_ms, HubInfo, Message};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::conn::{ConnHandle, ConnId};
use crate::operations::OperationManager;
use crate::registry::Registry;

/// Hub-side record of a forwarded request, for reverse routing of the
/// automator's response.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub source_client_id: String,
    pub source_client_name: String,
    pub tool_name: Option<String>,
    pub created: Instant,
}

/// `requestId -> RouteEntry`. Entries leave on response delivery, when the
/// source requester disconnects, or by the age sweep; a response arriving
/// after that is dropped with a warning.
#[derive(Debug, Default)]
pub struct RouteTable {
    entries: Mutex<HashMap<String, RouteEntry>>,
}

impl RouteTable {
    pub fn insert(&self, request_id: &str, entry: RouteEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.to_string(), entry);
    }

    pub fn take(&self, request_id: &str) -> Option<RouteEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id)
    }

    /// Drop every entry owned by a departed requester.
    pub fn purge_client(&self, client_id: &str) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| e.source_client_id != client_id);
        before - entries.len()
    }

    /// Drop entries older than `max_age`; the client-side pending table has
    /// long since timed these out.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, e| e.created.elapsed() <= max_age);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the hub owns. See module docs.
pub struct Hub {
    pub config: Config,
    pub info: HubInfo,
    pub registry: Registry,
    pub operations: OperationManager,
    pub routes: RouteTable,
    started: Instant,
    connections: RwLock<HashMap<ConnId, ConnHandle>>,
    next_conn_id: AtomicU64,
    hub_message_id: AtomicU64,
    draining: AtomicBool,
}

impl Hub {
    pub fn new(config: Config) -> Self {
        let operations = OperationManager::new(
            Duration::from_millis(config.operation_cleanup_age_ms),
            Duration::from_millis(config.abandoned_age_ms()),
        );
        let info = HubInfo {
            version: palaverproto::PROTOCOL_VERSION.to_string(),
            hub_id: format!("hub-{}", uuid::Uuid::new_v4()),
            started_at: now_ms(),
        };
        Self {
            config,
            info,
            registry: Registry::new(),
            operations,
            routes: RouteTable::default(),
            started: Instant::now(),
            connections: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            hub_message_id: AtomicU64::new(1),
            draining: AtomicBool::new(false),
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        ConnId(self.next_conn_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_hub_message_id(&self) -> u64 {
        self.hub_message_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }

    pub fn state_str(&self) -> &'static str {
        if self.is_draining() {
            "draining"
        } else {
            "running"
        }
    }

    pub async fn track_conn(&self, handle: ConnHandle) {
        self.connections.write().await.insert(handle.id, handle);
    }

    pub async fn conns(&self) -> Vec<ConnHandle> {
        self.connections.read().await.values().cloned().collect()
    }

    pub async fn conn_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Tear down everything a closed connection owned.
    pub async fn handle_disconnect(&self, conn_id: ConnId) {
        self.connections.write().await.remove(&conn_id);

        let removal = self.registry.remove_conn(conn_id).await;
        if let Some(ref client_id) = removal.requester_id {
            let purged = self.routes.purge_client(client_id);
            if purged > 0 {
                debug!(
                    conn = %conn_id, client_id = %client_id, purged,
                    "dropped routes for departed requester"
                );
            }
        }
        if removal.changed_anything() {
            self.broadcast_client_list().await;
        }
        info!(conn = %conn_id, "connection closed");
    }

    /// Send the current requester roster to the automator (and only the
    /// automator).
    pub async fn broadcast_client_list(&self) {
        let Some(automator) = self.registry.automator().await else {
            return;
        };
        let clients = self.registry.summaries(now_ms()).await;
        if let Err(e) = automator.send(Message::ClientListUpdate { clients }).await {
            warn!(error = %e, "failed to deliver client_list_update");
        }
    }
}
