//! Session state machine

use std::fmt::{self, Display};

/// State of one session slot in the session table
///
/// Transitions are exclusive; a session is in exactly one state at any time.
///
/// # State Transitions
/// ```text
/// Idle ── allocate (host create) ──► InCreation ── CreateSessionResponse(Open) ──► Active
/// Idle ── allocate (module open) ──► InCreation ── session callback accepts ─────► Active
/// Active ── destroy_session ──► InDeletion ── CloseSessionResponse ──► Idle
/// Active ── module CloseSessionRequest ─────────────────────────────► Idle
/// any    ── connection/slot close ──────────────────────────────────► Idle
/// ```
///
/// `InCreation` and `InDeletion` are transient: the session is parked there
/// while a response from the module is outstanding, which keeps concurrent
/// callers from operating on a half-built entry. The only completion
/// transitions are `InCreation -> Active` and `InDeletion -> Idle`; both
/// happen on receipt of the matching response SPDU, or when a connection or
/// slot close sweeps the session back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Slot is free
    ///
    /// An idle session carries no meaningful resource id, slot, connection
    /// or handler.
    Idle,

    /// Session is being established
    ///
    /// Entered on allocation. A `CreateSession` SPDU has been sent (host
    /// initiated) or an `OpenSessionRequest` is being answered (module
    /// initiated). Data cannot be sent yet.
    InCreation,

    /// Session is established
    ///
    /// Data SPDUs flow in both directions. The owning (slot, connection)
    /// pair is open as far as the session layer knows.
    Active,

    /// Session is being torn down
    ///
    /// A `CloseSessionRequest` has been sent; waiting for the matching
    /// `CloseSessionResponse`.
    InDeletion,
}

impl SessionState {
    /// Check if the slot is free
    pub const fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    /// Check if data can be sent on the session
    pub const fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    /// Check if the session may be torn down by the host
    ///
    /// Teardown is allowed while `Active` and remains allowed while a close
    /// is already outstanding.
    pub const fn can_destroy(&self) -> bool {
        matches!(self, SessionState::Active | SessionState::InDeletion)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Idle
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::InCreation => write!(f, "InCreation"),
            SessionState::Active => write!(f, "Active"),
            SessionState::InDeletion => write!(f, "InDeletion"),
        }
    }
}
