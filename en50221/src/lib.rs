//! EN 50221 Common Interface stack
//!
//! Rust implementation of the EN 50221 session layer for talking to
//! conditional access modules in DVB CI slots.
//!
//! # Architecture
//!
//! This library is organized as a workspace with multiple crates:
//!
//! - `en50221-core`: shared error type and resource identifiers
//! - `en50221-transport`: the transport layer contract the session layer
//!   rides on, and the event path a transport driver feeds
//! - `en50221-session`: session table, SPDU codec and protocol engine
//!
//! # Usage
//!
//! Construct a [`session::SessionLayer`] over your transport, register a
//! [`session::ResourceLookup`] and a [`session::SessionEventHandler`], and
//! hand the layer to the transport driver as its
//! [`transport::TransportEventSink`].

pub use en50221_core::{En50221Error, En50221Result, ResourceId};
pub use en50221_session as session;
pub use en50221_transport as transport;
