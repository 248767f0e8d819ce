//! Session state machine.
//!
//! The tracker owns the `Unauthenticated -> Authenticating -> Authenticated`
//! transitions. Concurrent callers that need a login all observe the same
//! [`PendingLogin`]: the first one receives a [`LoginLease`] and runs the
//! handshake, everybody else waits on the lease's outcome channel.

use chrono::{DateTime, Utc};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

use crate::portal::PortalError;

/// Session handed out by the tracker: the bearer token (if the portal issued
/// one) and the generation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionGrant {
    pub token: Option<String>,
    pub generation: u64,
}

/// Outcome broadcast to every caller waiting on one handshake.
pub type LoginOutcome = Result<SessionGrant, PortalError>;

/// Handle on an in-flight handshake.
#[derive(Debug, Clone)]
pub struct PendingLogin {
    pub id: u64,
    pub started_at: DateTime<Utc>,
    outcome: watch::Receiver<Option<LoginOutcome>>,
}

/// Current authentication state of one client.
#[derive(Debug, Clone)]
pub enum SessionState {
    Unauthenticated,
    Authenticating(PendingLogin),
    Authenticated {
        token: Option<String>,
        generation: u64,
        since: DateTime<Utc>,
    },
}

impl SessionState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated { .. })
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            SessionState::Authenticated { token, .. } => token.as_deref(),
            _ => None,
        }
    }

    pub fn generation(&self) -> Option<u64> {
        match self {
            SessionState::Authenticated { generation, .. } => Some(*generation),
            _ => None,
        }
    }
}

/// How the caller wants the tracker to treat an existing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginMode {
    /// Reuse an authenticated session if there is one.
    Reuse,
    /// The session of `stale_generation` was rejected by the server. A newer
    /// session is reused; the stale one is replaced by a fresh handshake.
    Replace { stale_generation: Option<u64> },
}

/// What a caller has to do after asking the tracker for a session.
#[derive(Debug)]
pub enum LoginTicket<'a> {
    /// Already authenticated; no network traffic needed.
    Ready(SessionGrant),
    /// Another caller is running the handshake.
    Wait(PendingLogin),
    /// This caller must run the handshake and complete the lease.
    Lead(LoginLease<'a>),
}

#[derive(Debug)]
struct TrackerInner {
    state: SessionState,
    next_id: u64,
    generation: u64,
}

/// Owned, constructor-scoped session state.
#[derive(Debug)]
pub struct SessionTracker {
    inner: Mutex<TrackerInner>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                state: SessionState::Unauthenticated,
                next_id: 1,
                generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> SessionState {
        self.lock().state.clone()
    }

    /// Decide whether the caller can reuse a session, must wait for one, or
    /// has to lead a new handshake.
    pub fn begin(&self, mode: LoginMode) -> LoginTicket<'_> {
        let mut inner = self.lock();

        match (&inner.state, mode) {
            (SessionState::Authenticating(pending), _) => {
                return LoginTicket::Wait(pending.clone());
            }
            (SessionState::Authenticated { token, generation, .. }, LoginMode::Reuse) => {
                return LoginTicket::Ready(SessionGrant {
                    token: token.clone(),
                    generation: *generation,
                });
            }
            (
                SessionState::Authenticated { token, generation, .. },
                LoginMode::Replace { stale_generation },
            ) if stale_generation.is_some_and(|stale| stale != *generation) => {
                return LoginTicket::Ready(SessionGrant {
                    token: token.clone(),
                    generation: *generation,
                });
            }
            _ => {}
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let (sender, receiver) = watch::channel(None);
        inner.state = SessionState::Authenticating(PendingLogin {
            id,
            started_at: Utc::now(),
            outcome: receiver,
        });

        LoginTicket::Lead(LoginLease {
            tracker: self,
            id,
            sender: Some(sender),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.lock().state.is_authenticated()
    }

    /// Drop an authenticated session, e.g. when its cookie disappeared.
    /// In-flight handshakes are left alone.
    pub fn invalidate(&self) -> bool {
        let mut inner = self.lock();
        if inner.state.is_authenticated() {
            inner.state = SessionState::Unauthenticated;
            true
        } else {
            false
        }
    }

    fn finish(&self, id: u64, result: Result<Option<String>, PortalError>) -> LoginOutcome {
        let mut inner = self.lock();
        let owns_state =
            matches!(&inner.state, SessionState::Authenticating(pending) if pending.id == id);

        match result {
            Ok(token) => {
                if owns_state {
                    inner.generation += 1;
                    inner.state = SessionState::Authenticated {
                        token: token.clone(),
                        generation: inner.generation,
                        since: Utc::now(),
                    };
                }
                Ok(SessionGrant {
                    token,
                    generation: inner.generation,
                })
            }
            Err(err) => {
                if owns_state {
                    inner.state = SessionState::Unauthenticated;
                }
                Err(err)
            }
        }
    }
}

impl PendingLogin {
    /// Wait for the handshake outcome. `None` means the leader was dropped
    /// before finishing; the state has already been reset and the caller
    /// should start over.
    pub async fn wait(mut self) -> Option<LoginOutcome> {
        match self.outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }
}

/// Exclusive right to run the handshake for one `Authenticating` period.
///
/// Dropping the lease without completing it (cancellation, panic) resets the
/// state to `Unauthenticated` and wakes the waiters.
#[derive(Debug)]
pub struct LoginLease<'a> {
    tracker: &'a SessionTracker,
    id: u64,
    sender: Option<watch::Sender<Option<LoginOutcome>>>,
}

impl LoginLease<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record the handshake result and notify every waiter with the same
    /// outcome.
    pub fn complete(mut self, result: Result<Option<String>, PortalError>) -> LoginOutcome {
        let outcome = self.tracker.finish(self.id, result);
        if let Some(sender) = self.sender.take() {
            sender.send_replace(Some(outcome.clone()));
        }
        outcome
    }
}

impl Drop for LoginLease<'_> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            let mut inner = self.tracker.lock();
            if matches!(&inner.state, SessionState::Authenticating(pending) if pending.id == self.id)
            {
                inner.state = SessionState::Unauthenticated;
            }
            // Dropping the sender closes the channel for the waiters.
        }
    }
}
