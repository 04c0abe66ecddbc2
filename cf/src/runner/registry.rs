//! Session registry: cancellation tokens keyed by session
//!
//! One token is created per `run` call and registered under its session
//! key. The same token cancels both the in-flight stream and any backoff
//! sleep between retries. The registry replaces the source's ambient
//! global maps with one lock-guarded instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

/// A one-shot cancellation signal shared by a session's stream and sleeps
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when the token fires; immediately if it already has
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleep that checks the signal on entry and wakes the moment it fires.
/// Returns true when the full duration elapsed, false on abort.
pub async fn abortable_sleep(duration: Duration, token: &CancelToken) -> bool {
    if token.is_cancelled() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = token.cancelled() => false,
    }
}

/// Process-wide map of active sessions to their cancellation tokens
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<String, CancelToken>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token under `session_key`, replacing any stale one
    pub fn register(&self, session_key: &str) -> CancelToken {
        debug!(%session_key, "SessionRegistry::register");
        let token = CancelToken::new();
        self.inner
            .lock()
            .expect("session registry poisoned")
            .insert(session_key.to_string(), token.clone());
        token
    }

    /// Remove a session's token (terminal exit)
    pub fn remove(&self, session_key: &str) {
        debug!(%session_key, "SessionRegistry::remove");
        self.inner.lock().expect("session registry poisoned").remove(session_key);
    }

    /// Cancel an in-flight run or its pending retry sleep. Returns whether
    /// a session was found.
    pub fn abort(&self, session_key: &str) -> bool {
        debug!(%session_key, "SessionRegistry::abort");
        let token = self
            .inner
            .lock()
            .expect("session registry poisoned")
            .get(session_key)
            .cloned();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, session_key: &str) -> bool {
        self.inner
            .lock()
            .expect("session registry poisoned")
            .contains_key(session_key)
    }
}
