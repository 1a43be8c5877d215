//! Long-running operation tracking.
//!
//! Operations decouple browser work from the connection that requested it.
//! The hub learns about an operation either from the request that declares
//! an `operationId` or from the response that announces one; after that,
//! progress milestones from the automator mutate the record until a terminal
//! milestone lands. Terminal states are sticky.
//!
//! Waiters subscribe before reading state so a milestone arriving between
//! the read and the await cannot be lost.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use palaverproto::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Milestone names that drive the state machine into a terminal state.
const MILESTONE_COMPLETED: &str = "completed";
const MILESTONE_ERROR: &str = "error";
const MILESTONE_CANCELLED: &str = "cancelled";

/// Operation status. Terminal states are irreversible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Started,
    Progress,
    Completed,
    Error,
    Cancelled,
}

impl OpStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OpStatus::Completed | OpStatus::Error | OpStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpStatus::Started => "started",
            OpStatus::Progress => "progress",
            OpStatus::Completed => "completed",
            OpStatus::Error => "error",
            OpStatus::Cancelled => "cancelled",
        }
    }
}

/// One progress event, kept in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub name: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

/// A long-lived unit of work keyed by operation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_type: Option<String>,
    /// Requester client id that initiated the work.
    pub owner: String,
    pub created_at: i64,
    pub last_updated: i64,
    pub status: OpStatus,
    pub milestones: Vec<Milestone>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Operation {
    fn new(id: String, owner: String, op_type: Option<String>, now: i64) -> Self {
        Self {
            id,
            op_type,
            owner,
            created_at: now,
            last_updated: now,
            status: OpStatus::Started,
            milestones: Vec::new(),
            result: None,
            error: None,
        }
    }

    /// Wire form, as returned from `get_operation` and `wait_for_operation`.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Outcome of applying a progress milestone.
#[derive(Debug, PartialEq, Eq)]
pub enum Applied {
    /// Milestone recorded; `true` when it was terminal.
    Recorded { terminal: bool },
    /// Operation already terminal; milestone ignored.
    LateIgnored,
    /// No such operation.
    Unknown,
}

/// Why a cancel request did not forward.
#[derive(Debug)]
pub enum CancelDisposition {
    Unknown,
    AlreadyTerminal(Operation),
    /// Not terminal; forward the cancel to the automator.
    Forward,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("no such operation")]
    Unknown,
    #[error("operation did not reach a terminal state in time")]
    Timeout,
}

/// Results of one GC sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub removed: usize,
    pub abandoned: usize,
}

/// The operation table. Mutation happens under one mutex; waiters park on a
/// manager-wide `Notify` and re-check after every milestone.
#[derive(Debug)]
pub struct OperationManager {
    ops: Mutex<HashMap<String, Operation>>,
    notify: Notify,
    cleanup_age: Duration,
    abandoned_age: Duration,
}

impl OperationManager {
    pub fn new(cleanup_age: Duration, abandoned_age: Duration) -> Self {
        Self {
            ops: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            cleanup_age,
            abandoned_age,
        }
    }

    /// Register an operation if it is not already known. Registration is
    /// idempotent: the first sighting wins.
    pub fn register(&self, id: &str, owner: &str, op_type: Option<&str>) {
        let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        if !ops.contains_key(id) {
            debug!(operation = %id, owner = %owner, "operation registered");
            ops.insert(
                id.to_string(),
                Operation::new(
                    id.to_string(),
                    owner.to_string(),
                    op_type.map(str::to_string),
                    now_ms(),
                ),
            );
        }
    }

    pub fn owner_of(&self, id: &str) -> Option<String> {
        self.ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|op| op.owner.clone())
    }

    pub fn get(&self, id: &str) -> Option<Operation> {
        self.ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn count(&self) -> usize {
        self.ops.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Append a milestone. Terminal milestone names (`completed`, `error`,
    /// `cancelled`) drive the status machine; anything else marks progress.
    pub fn apply_progress(&self, id: &str, milestone: &str, data: Value) -> Applied {
        let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        let Some(op) = ops.get_mut(id) else {
            return Applied::Unknown;
        };

        if op.status.is_terminal() {
            warn!(
                operation = %id, milestone = %milestone, status = op.status.as_str(),
                "late progress after terminal state ignored"
            );
            return Applied::LateIgnored;
        }

        let now = now_ms();
        op.milestones.push(Milestone {
            name: milestone.to_string(),
            timestamp: now,
            data: data.clone(),
        });
        op.last_updated = now;

        let terminal = match milestone {
            MILESTONE_COMPLETED => {
                op.status = OpStatus::Completed;
                if !data.is_null() {
                    op.result = Some(data);
                }
                true
            }
            MILESTONE_ERROR => {
                op.status = OpStatus::Error;
                if !data.is_null() {
                    op.error = Some(data);
                }
                true
            }
            MILESTONE_CANCELLED => {
                op.status = OpStatus::Cancelled;
                true
            }
            _ => {
                op.status = OpStatus::Progress;
                false
            }
        };

        drop(ops);
        self.notify.notify_waiters();
        Applied::Recorded { terminal }
    }

    /// Block until the operation reaches a terminal state, the timeout
    /// expires, or the operation disappears.
    pub async fn wait_for_completion(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<Operation, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Subscribe before reading state so a terminal milestone landing
            // between the check and the await still wakes us.
            let notified = self.notify.notified();

            match self.get(id) {
                None => return Err(WaitError::Unknown),
                Some(op) if op.status.is_terminal() => return Ok(op),
                Some(_) => {}
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(WaitError::Timeout);
            }
        }
    }

    /// Classify a cancel request. A cancel after a terminal state is a
    /// no-op reporting `alreadyTerminal`.
    pub fn cancel_disposition(&self, id: &str) -> CancelDisposition {
        match self.get(id) {
            None => CancelDisposition::Unknown,
            Some(op) if op.status.is_terminal() => CancelDisposition::AlreadyTerminal(op),
            Some(_) => CancelDisposition::Forward,
        }
    }

    /// Periodic sweep: terminal records older than the cleanup age are
    /// removed; non-terminal records past the hard ceiling are marked
    /// abandoned (waking waiters) and removed by a later sweep.
    pub fn sweep(&self) -> SweepStats {
        let now = now_ms();
        let cleanup_ms = self.cleanup_age.as_millis() as i64;
        let abandoned_ms = self.abandoned_age.as_millis() as i64;
        let mut stats = SweepStats::default();
        let mut woke_waiters = false;

        {
            let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());

            ops.retain(|id, op| {
                let keep =
                    !(op.status.is_terminal() && now - op.last_updated > cleanup_ms);
                if !keep {
                    debug!(operation = %id, "terminal operation swept");
                    stats.removed += 1;
                }
                keep
            });

            for (id, op) in ops.iter_mut() {
                if !op.status.is_terminal() && now - op.last_updated > abandoned_ms {
                    info!(operation = %id, "non-terminal operation abandoned");
                    op.status = OpStatus::Error;
                    op.error = Some(serde_json::json!({
                        "code": "ABANDONED",
                        "message": palaverproto::ErrorCode::Abandoned.message(),
                    }));
                    op.last_updated = now;
                    stats.abandoned += 1;
                    woke_waiters = true;
                }
            }
        }

        if stats.removed > 0 {
            // Waiters on removed ids must observe UNKNOWN_OPERATION.
            woke_waiters = true;
        }
        if woke_waiters {
            self.notify.notify_waiters();
        }
        stats
    }

    /// Clone the table for snapshotting.
    pub fn export(&self) -> Vec<Operation> {
        self.ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Reload a snapshot. In-flight operations did not survive the restart,
    /// so anything non-terminal comes back as `error { ABANDONED }`.
    pub fn import(&self, operations: Vec<Operation>) {
        let now = now_ms();
        let mut ops = self.ops.lock().unwrap_or_else(|e| e.into_inner());
        for mut op in operations {
            if !op.status.is_terminal() {
                op.status = OpStatus::Error;
                op.error = Some(serde_json::json!({
                    "code": "ABANDONED",
                    "message": palaverproto::ErrorCode::Abandoned.message(),
                }));
                op.last_updated = now;
            }
            ops.insert(op.id.clone(), op);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager() -> OperationManager {
        OperationManager::new(Duration::from_secs(3600), Duration::from_secs(7200))
    }

    #[test]
    fn milestones_append_in_arrival_order() {
        let mgr = manager();
        mgr.register("op1", "a", Some("tab_send_message"));

        mgr.apply_progress("op1", "input_filled", Value::Null);
        mgr.apply_progress("op1", "send_clicked", Value::Null);
        let applied =
            mgr.apply_progress("op1", "completed", serde_json::json!({ "tabId": 42 }));
        assert_eq!(applied, Applied::Recorded { terminal: true });

        let op = mgr.get("op1").unwrap();
        let names: Vec<_> = op.milestones.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["input_filled", "send_clicked", "completed"]);
        assert_eq!(op.status, OpStatus::Completed);
        assert_eq!(op.result.unwrap()["tabId"], 42);
        assert!(op
            .milestones
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mgr = manager();
        mgr.register("op1", "a", None);
        mgr.apply_progress("op1", "completed", Value::Null);

        assert_eq!(
            mgr.apply_progress("op1", "late_news", Value::Null),
            Applied::LateIgnored
        );
        assert_eq!(mgr.get("op1").unwrap().status, OpStatus::Completed);
    }

    #[test]
    fn registration_is_idempotent() {
        let mgr = manager();
        mgr.register("op1", "a", None);
        mgr.apply_progress("op1", "step", Value::Null);
        mgr.register("op1", "b", None);
        // First sighting wins.
        assert_eq!(mgr.owner_of("op1").as_deref(), Some("a"));
        assert_eq!(mgr.get("op1").unwrap().milestones.len(), 1);
    }

    #[test]
    fn error_milestone_carries_payload() {
        let mgr = manager();
        mgr.register("op1", "a", None);
        mgr.apply_progress(
            "op1",
            "error",
            serde_json::json!({ "code": "TAB_CLOSED", "message": "tab went away" }),
        );
        let op = mgr.get("op1").unwrap();
        assert_eq!(op.status, OpStatus::Error);
        assert_eq!(op.error.unwrap()["code"], "TAB_CLOSED");
    }

    #[tokio::test]
    async fn wait_resolves_on_terminal_milestone() {
        let mgr = std::sync::Arc::new(manager());
        mgr.register("op1", "a", None);

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.wait_for_completion("op1", Duration::from_secs(5)).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        mgr.apply_progress("op1", "completed", serde_json::json!({ "tabId": 42 }));

        let op = waiter.await.unwrap().unwrap();
        assert_eq!(op.status, OpStatus::Completed);
        assert_eq!(op.result.unwrap()["tabId"], 42);
    }

    #[tokio::test]
    async fn wait_times_out() {
        let mgr = manager();
        mgr.register("op1", "a", None);
        let err = mgr
            .wait_for_completion("op1", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Timeout);
    }

    #[tokio::test]
    async fn wait_on_unknown_operation() {
        let mgr = manager();
        let err = mgr
            .wait_for_completion("nope", Duration::from_millis(30))
            .await
            .unwrap_err();
        assert_eq!(err, WaitError::Unknown);
    }

    #[tokio::test]
    async fn wait_resolves_immediately_when_already_terminal() {
        let mgr = manager();
        mgr.register("op1", "a", None);
        mgr.apply_progress("op1", "completed", Value::Null);
        let op = mgr
            .wait_for_completion("op1", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(op.status, OpStatus::Completed);
    }

    #[test]
    fn cancel_dispositions() {
        let mgr = manager();
        assert!(matches!(
            mgr.cancel_disposition("nope"),
            CancelDisposition::Unknown
        ));

        mgr.register("op1", "a", None);
        assert!(matches!(
            mgr.cancel_disposition("op1"),
            CancelDisposition::Forward
        ));

        mgr.apply_progress("op1", "cancelled", Value::Null);
        match mgr.cancel_disposition("op1") {
            CancelDisposition::AlreadyTerminal(op) => {
                assert_eq!(op.status, OpStatus::Cancelled)
            }
            other => panic!("unexpected disposition: {:?}", other),
        }
    }

    #[test]
    fn sweep_removes_old_terminal_and_abandons_stale() {
        let mgr = OperationManager::new(Duration::from_millis(0), Duration::from_millis(0));
        mgr.register("done", "a", None);
        mgr.apply_progress("done", "completed", Value::Null);
        mgr.register("stuck", "a", None);

        std::thread::sleep(Duration::from_millis(5));
        let stats = mgr.sweep();
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.abandoned, 1);

        assert!(mgr.get("done").is_none());
        let stuck = mgr.get("stuck").unwrap();
        assert_eq!(stuck.status, OpStatus::Error);
        assert_eq!(stuck.error.unwrap()["code"], "ABANDONED");

        // Next sweep collects the now-terminal abandoned record.
        std::thread::sleep(Duration::from_millis(5));
        let stats = mgr.sweep();
        assert_eq!(stats.removed, 1);
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn import_abandons_in_flight_operations() {
        let mgr = manager();
        let mut live = Operation::new("op1".into(), "a".into(), None, 1);
        live.status = OpStatus::Progress;
        let mut done = Operation::new("op2".into(), "a".into(), None, 1);
        done.status = OpStatus::Completed;

        mgr.import(vec![live, done]);

        assert_eq!(mgr.get("op1").unwrap().status, OpStatus::Error);
        assert_eq!(mgr.get("op2").unwrap().status, OpStatus::Completed);
    }
}
