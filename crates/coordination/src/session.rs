//! Session state machine and transition notification

use crate::error::{Error, Result};
use crate::runtime;
use futures::channel::oneshot;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Connection session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No usable connection
    Disconnected,
    /// A connection attempt is in progress
    Connecting,
    /// Session established; operations run without queuing
    Connected,
    /// The backend invalidated the session; ephemeral state is gone
    Expired,
    /// Credentials were rejected
    AuthFailed,
}

/// A single applied state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTransition {
    /// Previous state
    pub from: SessionState,
    /// New state
    pub to: SessionState,
    /// Whether the session expired since the last time it was connected
    pub after_expiry: bool,
}

impl SessionTransition {
    /// Connected again after the previous session was lost
    pub fn is_recovery_from_expiry(&self) -> bool {
        self.to == SessionState::Connected && self.after_expiry
    }
}

/// Identifies a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&SessionTransition) + Send + Sync>;

struct WatcherState {
    state: SessionState,
    expired_since_connected: bool,
    waiters: Vec<(SessionState, oneshot::Sender<SessionState>)>,
    channels: Vec<async_channel::Sender<SessionTransition>>,
    closed: bool,
}

/// Tracks the session state of one connection and fans out transitions.
///
/// Transitions are applied by a single driver, so listeners never observe
/// two transitions concurrently. Listeners run synchronously in registration
/// order and must not block.
pub struct SessionWatcher {
    inner: Mutex<WatcherState>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: Mutex<u64>,
}

impl SessionWatcher {
    /// Create a watcher in the `Disconnected` state
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WatcherState {
                state: SessionState::Disconnected,
                expired_since_connected: false,
                waiters: Vec::new(),
                channels: Vec::new(),
                closed: false,
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: Mutex::new(0),
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.lock_state().state
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Whether the session expired since it was last connected
    pub fn expired_since_connected(&self) -> bool {
        self.lock_state().expired_since_connected
    }

    /// Apply a transition reported by the backend.
    pub fn transition(&self, to: SessionState) -> Result<SessionTransition> {
        let transition = {
            let mut inner = self.lock_state();
            if inner.closed {
                return Err(Error::Closed);
            }

            let from = inner.state;
            if !Self::is_valid_transition(from, to) {
                return Err(Error::InvalidStateTransition { from, to });
            }

            if to == SessionState::Expired {
                inner.expired_since_connected = true;
            }
            let transition = SessionTransition {
                from,
                to,
                after_expiry: inner.expired_since_connected,
            };
            if to == SessionState::Connected {
                inner.expired_since_connected = false;
            }
            inner.state = to;

            debug!("Session state: {:?} -> {:?}", from, to);
            Self::publish(&mut inner, transition);
            transition
        };

        self.notify_listeners(&transition);
        Ok(transition)
    }

    /// Wait until the session reaches `state`, up to `timeout`.
    ///
    /// Returns `true` if the state was reached (or already current) and
    /// `false` on timeout or close. Rejected credentials end the wait early
    /// with `false`, since no backend event leaves `AuthFailed` on its own.
    pub async fn wait_for(&self, state: SessionState, timeout: Duration) -> bool {
        let rx = {
            let mut inner = self.lock_state();
            if inner.state == state {
                return true;
            }
            if inner.closed || inner.state == SessionState::AuthFailed {
                return false;
            }
            inner.waiters.retain(|(_, tx)| !tx.is_canceled());
            let (tx, rx) = oneshot::channel();
            inner.waiters.push((state, tx));
            rx
        };

        matches!(runtime::timeout(timeout, rx).await, Some(Ok(reached)) if reached == state)
    }

    /// Register a listener invoked for every transition
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SessionTransition) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_listener.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            ListenerId(*next)
        };
        self.lock_listeners().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Channel receiving every subsequent transition
    pub fn watch(&self) -> async_channel::Receiver<SessionTransition> {
        let (tx, rx) = async_channel::unbounded();
        self.lock_state().channels.push(tx);
        rx
    }

    /// Stop the state machine. Pending waiters return `false`, watch
    /// channels end, and further transitions fail with `Closed`.
    pub fn close(&self) {
        let transition = {
            let mut inner = self.lock_state();
            if inner.closed {
                return;
            }
            inner.closed = true;

            let from = inner.state;
            inner.state = SessionState::Disconnected;
            let transition = (from != SessionState::Disconnected).then(|| SessionTransition {
                from,
                to: SessionState::Disconnected,
                after_expiry: inner.expired_since_connected,
            });
            if let Some(transition) = transition {
                Self::publish(&mut inner, transition);
            }
            inner.waiters.clear();
            inner.channels.clear();
            transition
        };

        if let Some(transition) = transition {
            self.notify_listeners(&transition);
        }
    }

    /// Check if a state transition is valid
    pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
        use SessionState::*;

        match (from, to) {
            // Credentials can be rejected at any point
            (AuthFailed, AuthFailed) => false,
            (_, AuthFailed) => true,

            // Connection attempts
            (Disconnected, Connecting) => true,
            (Expired, Connecting) => true,
            (AuthFailed, Connecting) => true,

            // Handshake, or a transient loss healing on the same session
            (Connecting, Connected) => true,
            (Disconnected, Connected) => true,

            // Transient loss
            (Connected, Disconnected) => true,
            (Connecting, Disconnected) => true,

            // Session invalidated
            (Connected, Expired) => true,
            (Disconnected, Expired) => true,
            (Connecting, Expired) => true,

            _ => false,
        }
    }

    fn publish(inner: &mut WatcherState, transition: SessionTransition) {
        let waiters = std::mem::take(&mut inner.waiters);
        for (target, tx) in waiters {
            if target == transition.to || transition.to == SessionState::AuthFailed {
                let _ = tx.send(transition.to);
            } else if !tx.is_canceled() {
                inner.waiters.push((target, tx));
            }
        }
        inner
            .channels
            .retain(|tx| tx.try_send(transition).is_ok());
    }

    fn notify_listeners(&self, transition: &SessionTransition) {
        let listeners: Vec<Listener> = self
            .lock_listeners()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(transition);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, WatcherState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SessionWatcher {
    fn default() -> Self {
        Self::new()
    }
}
