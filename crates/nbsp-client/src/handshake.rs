//! Registration handshake state.
//!
//! ```text
//! Idle ──register──▶ AwaitingInstall ──installed──▶ AwaitingResponse ──┬─▶ Reached
//!   └────────────────────────register (proxy present)────────┘         └─▶ TimedOut
//! ```
//!
//! At most one registration waits for an answer at a time. The slot holds
//! the sender half of that wait; whoever takes it first (the response or
//! the timeout) decides the outcome.
//!
//! Every `begin`/`park` opens a new session id. Only the current session may
//! settle the state, so a registration still finishing its timeout cannot
//! overwrite a newer one.

use nbsp_core::Frame;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Idle,
    /// Proxy app not installed yet; retried from `is_installed()`.
    AwaitingInstall { port: u16 },
    AwaitingResponse { port: u16, request_ms: u64 },
    Reached { port: u16, round_trip_ms: u64 },
    TimedOut { port: u16, needs_initial_launch: bool },
}

/// What a call to `register()` came to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// The proxy answered.
    Reached { round_trip_ms: u64 },
    /// No answer in time. `needs_initial_launch` means the proxy was
    /// installed after it was last heard from and must be opened once.
    TimedOut { needs_initial_launch: bool },
    /// Proxy app missing; parked until it shows up.
    AwaitingInstall,
    /// Another registration is still waiting; this one was dropped.
    AlreadyPending,
}

impl RegisterOutcome {
    pub fn app_reached(&self) -> bool {
        matches!(self, RegisterOutcome::Reached { .. })
    }

    pub fn needs_initial_launch(&self) -> bool {
        matches!(
            self,
            RegisterOutcome::TimedOut {
                needs_initial_launch: true
            }
        )
    }
}

pub(crate) struct Handshake {
    state: RegistrationState,
    /// Carries the measured round trip to the waiting `register()`.
    waiter: Option<oneshot::Sender<u64>>,
    session: u64,
}

impl Handshake {
    pub(crate) fn new() -> Self {
        Self {
            state: RegistrationState::Idle,
            waiter: None,
            session: 0,
        }
    }

    pub(crate) fn state(&self) -> RegistrationState {
        self.state
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.waiter.is_some()
    }

    fn next_session(&mut self) -> u64 {
        self.session += 1;
        self.session
    }

    /// Claim the wait slot, returning the new session id and the receiver
    /// for its round trip. `None` if a registration is already waiting.
    pub(crate) fn begin(
        &mut self,
        port: u16,
        request_ms: u64,
    ) -> Option<(u64, oneshot::Receiver<u64>)> {
        if self.is_pending() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.waiter = Some(tx);
        self.state = RegistrationState::AwaitingResponse { port, request_ms };
        Some((self.next_session(), rx))
    }

    /// Park `port` until the proxy is installed.
    pub(crate) fn park(&mut self, port: u16) -> Option<u64> {
        if self.is_pending() {
            return None;
        }
        self.state = RegistrationState::AwaitingInstall { port };
        Some(self.next_session())
    }

    /// Take the parked port, returning to `Idle`. The parked session can no
    /// longer settle.
    pub(crate) fn take_parked(&mut self) -> Option<u16> {
        match self.state {
            RegistrationState::AwaitingInstall { port } => {
                self.state = RegistrationState::Idle;
                self.next_session();
                Some(port)
            }
            _ => None,
        }
    }

    /// Hand a registration response to the waiting call. Returns `false`
    /// for responses nobody is waiting on (late, or for another request).
    pub(crate) fn respond(&mut self, frame: &Frame, now_ms: u64) -> bool {
        let RegistrationState::AwaitingResponse { port, request_ms } = self.state else {
            return false;
        };
        if frame.port != port || frame.request_timestamp != Some(request_ms) {
            return false;
        }
        match self.waiter.take() {
            Some(tx) => tx.send(now_ms.saturating_sub(request_ms)).is_ok(),
            None => false,
        }
    }

    /// Give up waiting; a response arriving from now on is ignored.
    pub(crate) fn expire(&mut self) {
        self.waiter = None;
    }

    /// Record the outcome of `session`. Returns `false`, leaving the state
    /// alone, when a newer session has started since.
    pub(crate) fn settle(&mut self, session: u64, port: u16, outcome: RegisterOutcome) -> bool {
        if session != self.session {
            return false;
        }
        self.state = match outcome {
            RegisterOutcome::Reached { round_trip_ms } => {
                RegistrationState::Reached { port, round_trip_ms }
            }
            RegisterOutcome::TimedOut {
                needs_initial_launch,
            } => RegistrationState::TimedOut {
                port,
                needs_initial_launch,
            },
            RegisterOutcome::AwaitingInstall => RegistrationState::AwaitingInstall { port },
            RegisterOutcome::AlreadyPending => return false,
        };
        true
    }
}
