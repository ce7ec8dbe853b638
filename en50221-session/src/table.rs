//! Session table
//!
//! Fixed-size pool of session slots owned by the session layer. A session's
//! number is its index in the table and never migrates. Allocation is a
//! lowest-index-first scan for an idle slot.

use crate::callback::ResourceHandler;
use crate::state::SessionState;
use en50221_core::ResourceId;
use std::sync::Arc;

/// One session slot
///
/// Fields other than `state` are meaningful only while the slot is not idle.
pub(crate) struct Session {
    pub(crate) state: SessionState,
    pub(crate) resource_id: ResourceId,
    pub(crate) slot: u8,
    pub(crate) connection: u8,
    pub(crate) handler: Option<Arc<dyn ResourceHandler>>,
}

impl Session {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            resource_id: ResourceId::from_raw(0),
            slot: 0,
            connection: 0,
            handler: None,
        }
    }

    /// Check whether this session belongs to the given endpoint
    pub(crate) fn matches(&self, slot: u8, connection: u8) -> bool {
        self.slot == slot && self.connection == connection
    }
}

pub(crate) struct SessionTable {
    sessions: Vec<Session>,
}

impl SessionTable {
    /// Create a table with `max_sessions` idle slots
    ///
    /// `max_sessions` is a `u16`, so index 0xFFFF, reserved on the wire for
    /// "no session", can never be a valid session number.
    pub(crate) fn new(max_sessions: u16) -> Self {
        Self {
            sessions: (0..max_sessions).map(|_| Session::idle()).collect(),
        }
    }

    pub(crate) fn max_sessions(&self) -> u16 {
        self.sessions.len() as u16
    }

    /// Claim the lowest idle slot, moving it to `InCreation`
    pub(crate) fn allocate(&mut self) -> Option<u16> {
        let index = self.sessions.iter().position(|s| s.state.is_idle())?;
        self.sessions[index].state = SessionState::InCreation;
        Some(index as u16)
    }

    /// Checked lookup by session number
    pub(crate) fn get(&self, session_number: u16) -> Option<&Session> {
        self.sessions.get(session_number as usize)
    }

    /// Checked mutable lookup by session number
    pub(crate) fn get_mut(&mut self, session_number: u16) -> Option<&mut Session> {
        self.sessions.get_mut(session_number as usize)
    }

    /// Return a slot to `Idle`, clearing its fields; safe in any state
    pub(crate) fn release(&mut self, session_number: u16) {
        if let Some(session) = self.sessions.get_mut(session_number as usize) {
            *session = Session::idle();
        }
    }

    /// All non-idle sessions, in ascending session-number order
    pub(crate) fn iter(&self) -> impl Iterator<Item = (u16, &Session)> {
        self.sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.state.is_idle())
            .map(|(n, s)| (n as u16, s))
    }

    /// All non-idle sessions on one logical connection, ascending
    pub(crate) fn iter_by_connection(
        &self,
        slot: u8,
        connection: u8,
    ) -> impl Iterator<Item = (u16, &Session)> {
        self.iter().filter(move |(_, s)| s.matches(slot, connection))
    }

    /// All non-idle sessions on one slot, ascending
    pub(crate) fn iter_by_slot(&self, slot: u8) -> impl Iterator<Item = (u16, &Session)> {
        self.iter().filter(move |(_, s)| s.slot == slot)
    }
}
