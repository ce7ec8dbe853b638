//! Transport layer contract for the EN 50221 Common Interface stack
//!
//! This crate defines the seam between the session layer and whatever
//! transport layer drives the physical CI slots: the downward
//! [`TransportLayer`] trait used for sending framed payloads, and the upward
//! [`TransportEvent`] / [`TransportEventSink`] pair through which a transport
//! driver delivers inbound payloads and connection lifecycle changes.

pub mod event;
pub mod layer;

pub use en50221_core::{En50221Error, En50221Result};
pub use event::{TransportEvent, TransportEventSink};
pub use layer::{TransportLayer, MAX_TRANSPORT_IOV};
