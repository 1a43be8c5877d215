//! Events surfaced to embedders over a broadcast channel.

use palaverproto::ClientSummary;
use serde_json::Value;
use std::time::Duration;

/// What the reactor tells the embedding process. Progress events carry
/// operation milestones pushed by the automator; the rest track the life of
/// the hub connection.
#[derive(Debug, Clone)]
pub enum BeckonEvent {
    /// Registered with the hub; `client_id` is the final (possibly
    /// suffixed) id.
    Connected { client_id: String },
    /// Connection dropped; a reconnect attempt is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Permanent failure: reconnect attempts exhausted or never allowed.
    Disconnected { reason: String },
    /// A progress milestone for an operation this client owns.
    Progress {
        operation_id: String,
        milestone: String,
        data: Value,
    },
    /// Requester roster change (delivered to automator-role clients).
    ClientListUpdate { clients: Vec<ClientSummary> },
    /// The hub announced it is going away; no reconnect is attempted.
    HubShutdown { reason: String },
}
