//! Client registry: one automator slot, many requesters.
//!
//! Identity attaches to a connection at registration and never outlives it.
//! Relationships are lookups by id; connections hold the client id only as a
//! value, so there are no back-pointers to keep consistent.

use std::collections::HashMap;

use palaverproto::{ClientInfo, ClientSummary};
use tokio::sync::RwLock;
use tracing::info;

use crate::conn::{ConnHandle, ConnId};

/// The automator slot.
#[derive(Debug, Clone)]
pub struct AutomatorEntry {
    pub conn: ConnHandle,
    pub extension_id: String,
    pub registered_at: i64,
}

/// One registered requester.
#[derive(Debug, Clone)]
pub struct RequesterEntry {
    pub conn: ConnHandle,
    pub info: ClientInfo,
    pub registered_at: i64,
    pub request_count: u64,
}

/// What a connection removal took with it.
#[derive(Debug, Default)]
pub struct Removal {
    pub was_automator: bool,
    pub requester_id: Option<String>,
}

impl Removal {
    pub fn changed_anything(&self) -> bool {
        self.was_automator || self.requester_id.is_some()
    }
}

/// Tracks the automator and all registered requesters.
#[derive(Debug, Default)]
pub struct Registry {
    automator: RwLock<Option<AutomatorEntry>>,
    requesters: RwLock<HashMap<String, RequesterEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a new automator. Returns the evicted entry, if any; the
    /// caller owes it a `hub_shutdown { reason: "replaced" }` close.
    pub async fn register_automator(
        &self,
        conn: ConnHandle,
        extension_id: String,
        now_ms: i64,
    ) -> Option<AutomatorEntry> {
        let mut slot = self.automator.write().await;
        let evicted = slot.take();
        if let Some(ref old) = evicted {
            info!(
                old = %old.conn.id, new = %conn.id,
                "automator replaced"
            );
        } else {
            info!(conn = %conn.id, extension_id = %extension_id, "automator registered");
        }
        *slot = Some(AutomatorEntry {
            conn,
            extension_id,
            registered_at: now_ms,
        });
        evicted
    }

    /// Register a requester, resolving id collisions with a unique suffix.
    /// Returns the final id.
    pub async fn register_requester(
        &self,
        conn: ConnHandle,
        mut info: ClientInfo,
        now_ms: i64,
    ) -> String {
        let mut requesters = self.requesters.write().await;

        let wanted = info
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("client-{}", uuid::Uuid::new_v4()));

        let final_id = match requesters.get(&wanted) {
            // Same connection re-registering keeps its id.
            Some(existing) if existing.conn.id == conn.id => wanted,
            Some(_) => {
                let mut n = 2;
                loop {
                    let candidate = format!("{}-{}", wanted, n);
                    if !requesters.contains_key(&candidate) {
                        info!(wanted = %wanted, assigned = %candidate, "requester id collision, suffixed");
                        break candidate;
                    }
                    n += 1;
                }
            }
            None => wanted,
        };

        info.id = Some(final_id.clone());
        info!(conn = %conn.id, client_id = %final_id, name = %info.name, "requester registered");
        requesters.insert(
            final_id.clone(),
            RequesterEntry {
                conn,
                info,
                registered_at: now_ms,
                request_count: 0,
            },
        );
        final_id
    }

    /// Remove whatever the closing connection had registered.
    pub async fn remove_conn(&self, conn_id: ConnId) -> Removal {
        let mut removal = Removal::default();

        {
            let mut slot = self.automator.write().await;
            if slot.as_ref().is_some_and(|a| a.conn.id == conn_id) {
                *slot = None;
                removal.was_automator = true;
                info!(conn = %conn_id, "automator detached");
            }
        }

        let mut requesters = self.requesters.write().await;
        if let Some(id) = requesters
            .iter()
            .find(|(_, e)| e.conn.id == conn_id)
            .map(|(id, _)| id.clone())
        {
            requesters.remove(&id);
            info!(conn = %conn_id, client_id = %id, "requester removed");
            removal.requester_id = Some(id);
        }

        removal
    }

    pub async fn automator(&self) -> Option<ConnHandle> {
        self.automator.read().await.as_ref().map(|a| a.conn.clone())
    }

    pub async fn requester(&self, client_id: &str) -> Option<ConnHandle> {
        self.requesters
            .read()
            .await
            .get(client_id)
            .map(|e| e.conn.clone())
    }

    pub async fn requester_conns(&self) -> Vec<ConnHandle> {
        self.requesters
            .read()
            .await
            .values()
            .map(|e| e.conn.clone())
            .collect()
    }

    pub async fn requester_count(&self) -> usize {
        self.requesters.read().await.len()
    }

    pub async fn requester_name(&self, client_id: &str) -> Option<String> {
        self.requesters
            .read()
            .await
            .get(client_id)
            .map(|e| e.info.name.clone())
    }

    pub async fn bump_request_count(&self, client_id: &str) {
        if let Some(entry) = self.requesters.write().await.get_mut(client_id) {
            entry.request_count += 1;
        }
    }

    /// Snapshot for `client_list_update`. Last activity is derived from the
    /// connection's idle time against the supplied wall clock.
    pub async fn summaries(&self, now_ms: i64) -> Vec<ClientSummary> {
        self.requesters
            .read()
            .await
            .values()
            .map(|entry| ClientSummary {
                id: entry.info.id.clone().unwrap_or_default(),
                name: entry.info.name.clone(),
                client_type: entry.info.client_type.clone(),
                capabilities: entry.info.capabilities.clone(),
                registered_at: entry.registered_at,
                request_count: entry.request_count,
                last_activity: now_ms - entry.conn.idle_for().as_millis() as i64,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn conn(id: u64) -> ConnHandle {
        // Registry tests never write to the socket; the receiver can drop.
        let (handle, _rx) = ConnHandle::new(
            ConnId(id),
            "127.0.0.1:9".parse().unwrap(),
            CancellationToken::new(),
        );
        handle
    }

    #[tokio::test]
    async fn automator_replacement_returns_evicted() {
        let registry = Registry::new();
        assert!(registry
            .register_automator(conn(1), "ext-1".into(), 100)
            .await
            .is_none());

        let evicted = registry
            .register_automator(conn(2), "ext-2".into(), 200)
            .await
            .unwrap();
        assert_eq!(evicted.conn.id, ConnId(1));
        assert_eq!(registry.automator().await.unwrap().id, ConnId(2));
    }

    #[tokio::test]
    async fn duplicate_requester_ids_get_suffixed() {
        let registry = Registry::new();
        let a = registry
            .register_requester(conn(1), ClientInfo::named("A").with_id("tool"), 1)
            .await;
        assert_eq!(a, "tool");

        let b = registry
            .register_requester(conn(2), ClientInfo::named("B").with_id("tool"), 2)
            .await;
        assert_eq!(b, "tool-2");

        let c = registry
            .register_requester(conn(3), ClientInfo::named("C").with_id("tool"), 3)
            .await;
        assert_eq!(c, "tool-3");
        assert_eq!(registry.requester_count().await, 3);
    }

    #[tokio::test]
    async fn re_registration_on_same_conn_keeps_id() {
        let registry = Registry::new();
        let handle = conn(1);
        let first = registry
            .register_requester(handle.clone(), ClientInfo::named("A").with_id("tool"), 1)
            .await;
        let second = registry
            .register_requester(handle, ClientInfo::named("A").with_id("tool"), 2)
            .await;
        assert_eq!(first, second);
        assert_eq!(registry.requester_count().await, 1);
    }

    #[tokio::test]
    async fn missing_id_is_synthesized() {
        let registry = Registry::new();
        let id = registry
            .register_requester(conn(1), ClientInfo::named("anon"), 1)
            .await;
        assert!(id.starts_with("client-"));
    }

    #[tokio::test]
    async fn remove_conn_clears_both_roles() {
        let registry = Registry::new();
        registry
            .register_automator(conn(1), "ext".into(), 1)
            .await;
        registry
            .register_requester(conn(2), ClientInfo::named("A").with_id("a"), 1)
            .await;

        let removal = registry.remove_conn(ConnId(2)).await;
        assert_eq!(removal.requester_id.as_deref(), Some("a"));
        assert!(!removal.was_automator);
        assert!(registry.requester("a").await.is_none());

        let removal = registry.remove_conn(ConnId(1)).await;
        assert!(removal.was_automator);
        assert!(registry.automator().await.is_none());
    }

    #[tokio::test]
    async fn summaries_reflect_request_counts() {
        let registry = Registry::new();
        registry
            .register_requester(conn(1), ClientInfo::named("A").with_id("a"), 50)
            .await;
        registry.bump_request_count("a").await;
        registry.bump_request_count("a").await;

        let summaries = registry.summaries(1_000).await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, "a");
        assert_eq!(summaries[0].request_count, 2);
        assert_eq!(summaries[0].registered_at, 50);
    }
}
