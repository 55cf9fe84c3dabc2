//! Connection lifecycle.
//!
//! ## State Transitions
//!
//! ```text
//! Disconnected -> PreLoginSent (socket open, PreLogin written)
//! PreLoginSent -> TlsNegotiating (server answered ENCRYPT_ON/REQUIRED)
//! PreLoginSent -> LoginSent (no encryption)
//! TlsNegotiating -> LoginSent
//! LoginSent -> Ready (LOGINACK received)
//! any -> Closed (explicit close or fatal error)
//! ```
//!
//! `Closed` is terminal. The current state is published on a watch channel
//! so the client can observe transitions made by the connection driver.

use tokio::sync::watch;

use crate::error::Error;

/// Phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// No socket yet.
    Disconnected,
    /// PreLogin sent, awaiting the server's answer.
    PreLoginSent,
    /// TLS handshake running inside PreLogin packets.
    TlsNegotiating,
    /// Login7 sent, awaiting LOGINACK.
    LoginSent,
    /// Accepting requests.
    Ready,
    /// Closed; every operation fails.
    Closed,
}

impl LifecycleState {
    /// Whether `next` may follow this state.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Disconnected, PreLoginSent)
                | (PreLoginSent, TlsNegotiating | LoginSent)
                | (TlsNegotiating, LoginSent)
                | (LoginSent, Ready)
                | (Disconnected | PreLoginSent | TlsNegotiating | LoginSent | Ready, Closed)
        )
    }

    /// Whether requests can be issued.
    #[must_use]
    pub fn is_ready(self) -> bool {
        self == Self::Ready
    }

    /// Whether the connection is closed.
    #[must_use]
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::PreLoginSent => "prelogin sent",
            Self::TlsNegotiating => "TLS negotiating",
            Self::LoginSent => "login sent",
            Self::Ready => "ready",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Transition checker that publishes each accepted state.
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    /// Start in [`LifecycleState::Disconnected`].
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(LifecycleState::Disconnected);
        Self { tx }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.tx.borrow()
    }

    /// A receiver that observes every later transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.tx.subscribe()
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(&self, next: LifecycleState) -> Result<(), Error> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "cannot move from {current} to {next}"
            )));
        }
        tracing::debug!(from = %current, to = %next, "connection state changed");
        self.tx.send_replace(next);
        Ok(())
    }

    /// Move to [`LifecycleState::Closed`]. Closing twice is a no-op.
    pub fn close(&self) {
        if !self.state().is_closed() {
            tracing::debug!(from = %self.state(), "connection closed");
            self.tx.send_replace(LifecycleState::Closed);
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
