//! Approval broker: pending permission requests awaiting the renderer
//!
//! Each suspended tool-use request holds a oneshot the renderer resolves
//! through `resolveApproval`. Requests are indexed per session so a dying
//! session can deny everything it left dangling.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::oneshot;
use tracing::{debug, warn};

/// The renderer's answer to one approval request
#[derive(Debug, Clone)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub message: Option<String>,
}

/// Lock-guarded pending-approval state shared by runner and command surface
#[derive(Default)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalResponse>>>,
    session_ids: Mutex<HashMap<String, HashSet<String>>>,
}

impl ApprovalBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request and get the receiver the runner awaits
    pub fn register(&self, session_key: &str, request_id: &str) -> oneshot::Receiver<ApprovalResponse> {
        debug!(%session_key, %request_id, "ApprovalBroker::register");
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("approval broker poisoned")
            .insert(request_id.to_string(), tx);
        self.session_ids
            .lock()
            .expect("approval broker poisoned")
            .entry(session_key.to_string())
            .or_default()
            .insert(request_id.to_string());
        rx
    }

    /// Resolve a pending request. Returns false for unknown ids (already
    /// resolved, or the session ended first).
    pub fn resolve(&self, request_id: &str, approved: bool, message: Option<String>) -> bool {
        debug!(%request_id, approved, "ApprovalBroker::resolve");
        let sender = self
            .pending
            .lock()
            .expect("approval broker poisoned")
            .remove(request_id);
        for ids in self.session_ids.lock().expect("approval broker poisoned").values_mut() {
            ids.remove(request_id);
        }
        match sender {
            Some(tx) => tx.send(ApprovalResponse { approved, message }).is_ok(),
            None => {
                warn!(%request_id, "resolve for unknown approval request");
                false
            }
        }
    }

    /// Deny every request the session left unresolved
    pub fn end_session(&self, session_key: &str) {
        let ids = self
            .session_ids
            .lock()
            .expect("approval broker poisoned")
            .remove(session_key)
            .unwrap_or_default();
        if ids.is_empty() {
            return;
        }
        debug!(%session_key, count = ids.len(), "ApprovalBroker::end_session: denying dangling requests");
        let mut pending = self.pending.lock().expect("approval broker poisoned");
        for id in ids {
            if let Some(tx) = pending.remove(&id) {
                let _ = tx.send(ApprovalResponse {
                    approved: false,
                    message: Some("Session ended".to_string()),
                });
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("approval broker poisoned").len()
    }
}
