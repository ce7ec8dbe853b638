//! Upward callbacks exposed by the session layer
//!
//! The session layer never interprets APDUs itself; it resolves resource ids
//! through a [`ResourceLookup`], reports lifecycle changes through a
//! [`SessionEventHandler`] and hands inbound data to the per-session
//! [`ResourceHandler`]. All three run without the layer lock held and may
//! re-enter the layer, for instance to send a reply from inside a data
//! callback.

use async_trait::async_trait;
use en50221_core::ResourceId;
use std::sync::Arc;

/// Outcome of a resource lookup that did not produce a handler
///
/// Each case maps onto the status byte of the `OpenSessionResponse` sent
/// back to the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError {
    /// No such resource on this host
    NoResource,
    /// The resource exists but cannot be used right now
    ResourceUnavailable,
    /// The resource exists only in a lower version than requested
    ResourceLowVersion,
}

/// Resolves a module's requested resource id to a handler
#[async_trait]
pub trait ResourceLookup: Send + Sync {
    /// Look up a resource requested by the module in `slot`
    async fn lookup(
        &self,
        slot: u8,
        resource_id: ResourceId,
    ) -> Result<Arc<dyn ResourceHandler>, LookupError>;
}

/// Receives the data SPDUs arriving on one session
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Called for each inbound data SPDU on the session
    ///
    /// The payload is valid only for the duration of the call; copy it if it
    /// must outlive the callback.
    async fn on_data(&self, slot: u8, session_number: u16, resource_id: ResourceId, payload: &[u8]);
}

/// Lifecycle stage reported through [`SessionEventHandler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    /// A session is being established; on a module-initiated open the
    /// verdict decides whether it goes ahead
    Connecting,
    /// The session reached `Active`
    Connected,
    /// Establishment failed; the slot has been reclaimed
    ConnectFail,
    /// The session was closed, by the module or by a connection or slot loss
    Close,
}

/// A session lifecycle notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub slot: u8,
    pub session_number: u16,
    pub resource_id: ResourceId,
}

/// Answer to a [`SessionEventKind::Connecting`] notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionVerdict {
    Accept,
    Refuse,
}

/// Observer of session lifecycle events
#[async_trait]
pub trait SessionEventHandler: Send + Sync {
    /// Observe a lifecycle event
    ///
    /// The verdict is honoured only for `Connecting` on a module-initiated
    /// open; every other event ignores it.
    async fn on_session_event(&self, event: SessionEvent) -> SessionVerdict;
}
