//! Palaver hub: a correlating relay between many tool clients and one
//! browser automator.
//!
//! Requesters send typed requests; the automator fulfils them; the hub
//! annotates, forwards, and correlates replies back to their origin, and
//! tracks long-running operations across connection churn. `beckon` embeds
//! this crate to start a hub in-process when none is running.

pub mod conn;
pub mod health;
pub mod hub;
pub mod lifecycle;
pub mod operations;
pub mod registry;
pub mod router;
pub mod server;
pub mod snapshot;

pub use conn::{ConnHandle, ConnId};
pub use hub::Hub;
pub use operations::{OperationManager, OpStatus};
pub use server::{BindError, HubServer};
