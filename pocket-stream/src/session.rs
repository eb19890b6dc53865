//! Session bookkeeping shared by the transport, its listener and callers

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use pocket_core::{Balance, ConnectionState, PocketError};

use crate::region::Region;

#[derive(Debug, Default)]
struct SessionInner {
    region: Option<Region>,
    authenticated: bool,
    /// Cleared on every disconnect; a balance from a dead session is stale
    balance: Option<Balance>,
    balance_fresh: bool,
    last_error: Option<PocketError>,
    /// Set when the venue refuses the credential; blocks reconnects
    auth_rejected: Option<String>,
}

/// Transitions buffered per subscriber before it starts lagging
const TRANSITION_CAPACITY: usize = 64;

/// Connection lifecycle plus per-session facts
pub struct Session {
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    /// Fresh balance of the current session; `None` once it goes stale
    fresh_balance: watch::Sender<Option<Balance>>,
    inner: RwLock<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (fresh_balance, _) = watch::channel(None);
        Self {
            state,
            transitions,
            fresh_balance,
            inner: RwLock::new(SessionInner::default()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next` unconditionally, leaving `Stopped` included
    ///
    /// Reserved for explicit connect and disconnect calls.
    pub fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            self.announce(previous, next);
        }
    }

    /// Move to `next` unless the session was stopped
    ///
    /// Returns whether the state changed.
    pub fn advance(&self, next: ConnectionState) -> bool {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Stopped || *state == next {
                return false;
            }
            previous = Some(std::mem::replace(state, next));
            true
        });

        match previous {
            Some(previous) => {
                self.announce(previous, next);
                true
            }
            None => false,
        }
    }

    fn announce(&self, previous: ConnectionState, next: ConnectionState) {
        debug!("[PO WS] State {} -> {}", previous, next);
        // No subscribers is fine
        let _ = self.transitions.send(next);
    }

    /// Observe the latest state
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Every state entered, in order; the watch only keeps the latest
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Observe the balance pushed during the current session
    pub fn subscribe_balance(&self) -> watch::Receiver<Option<Balance>> {
        self.fresh_balance.subscribe()
    }

    pub fn region(&self) -> Option<Region> {
        self.inner.read().region.clone()
    }

    pub fn set_region(&self, region: Region) {
        self.inner.write().region = Some(region);
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.read().authenticated
    }

    pub fn mark_authenticated(&self) {
        self.inner.write().authenticated = true;
    }

    /// Forget everything tied to the socket that just went away
    pub fn mark_disconnected(&self) {
        {
            let mut inner = self.inner.write();
            inner.authenticated = false;
            inner.balance_fresh = false;
        }
        self.fresh_balance.send_replace(None);
    }

    pub fn set_balance(&self, balance: Balance) {
        info!(
            "[PO WS] Balance {:.2} ({})",
            balance.value,
            if balance.is_demo { "demo" } else { "live" }
        );
        {
            let mut inner = self.inner.write();
            inner.balance = Some(balance.clone());
            inner.balance_fresh = true;
        }
        self.fresh_balance.send_replace(Some(balance));
    }

    /// Balance pushed during the current session, if any
    pub fn balance(&self) -> Option<Balance> {
        let inner = self.inner.read();
        if inner.balance_fresh {
            inner.balance.clone()
        } else {
            None
        }
    }

    /// Last balance seen in any session
    pub fn last_known_balance(&self) -> Option<Balance> {
        self.inner.read().balance.clone()
    }

    pub fn record_error(&self, error: PocketError) {
        self.inner.write().last_error = Some(error);
    }

    pub fn last_error(&self) -> Option<PocketError> {
        self.inner.read().last_error.clone()
    }

    pub fn mark_auth_rejected(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut inner = self.inner.write();
        inner.authenticated = false;
        inner.last_error = Some(PocketError::auth_rejected(reason.clone()));
        inner.auth_rejected = Some(reason);
    }

    /// Reason the current credential was refused, if it was
    pub fn auth_rejection(&self) -> Option<String> {
        self.inner.read().auth_rejected.clone()
    }

    pub fn clear_auth_rejection(&self) {
        self.inner.write().auth_rejected = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_goes_stale_on_disconnect() {
        let session = Session::new();
        assert!(session.balance().is_none());

        session.set_balance(Balance {
            value: 250.0,
            is_demo: true,
            uid: Some(7),
        });
        assert_eq!(session.balance().unwrap().value, 250.0);

        session.mark_disconnected();
        assert!(session.balance().is_none());
        assert_eq!(session.last_known_balance().unwrap().value, 250.0);
    }

    #[test]
    fn test_state_watch() {
        let session = Session::new();
        let rx = session.subscribe();
        session.set_state(ConnectionState::Connecting);
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_stopped_only_left_explicitly() {
        let session = Session::new();
        let mut transitions = session.subscribe_transitions();

        assert!(session.advance(ConnectionState::Connecting));
        session.set_state(ConnectionState::Stopped);
        assert!(!session.advance(ConnectionState::Authenticated));
        assert!(!session.advance(ConnectionState::Disconnected));
        assert_eq!(session.state(), ConnectionState::Stopped);

        session.set_state(ConnectionState::Disconnected);
        assert!(session.advance(ConnectionState::Connecting));

        let seen: Vec<ConnectionState> =
            std::iter::from_fn(|| transitions.try_recv().ok()).collect();
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Stopped,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
            ]
        );
    }

    #[test]
    fn test_balance_watch_follows_freshness() {
        let session = Session::new();
        let rx = session.subscribe_balance();
        assert!(rx.borrow().is_none());

        session.set_balance(Balance {
            value: 10.0,
            is_demo: false,
            uid: None,
        });
        assert_eq!(rx.borrow().as_ref().map(|b| b.value), Some(10.0));

        session.mark_disconnected();
        assert!(rx.borrow().is_none());
    }

    #[test]
    fn test_auth_rejection_is_sticky() {
        let session = Session::new();
        session.mark_auth_rejected("NotAuthorized");
        assert_eq!(session.auth_rejection().as_deref(), Some("NotAuthorized"));
        assert!(session.last_error().unwrap().is_fatal());
        session.clear_auth_rejection();
        assert!(session.auth_rejection().is_none());
    }
}
