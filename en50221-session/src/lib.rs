//! Session layer for the EN 50221 Common Interface stack
//!
//! Multiplexes logical resource sessions between host-side resources and the
//! conditional access modules in the CI slots, on top of a transport layer
//! delivering framed byte payloads over per-slot logical connections.
//!
//! The layer owns a fixed-size session table, encodes and decodes the SPDU
//! wire format, drives session creation and teardown from either side and
//! fans connection or slot loss out to every affected session. Resources
//! plug in through the callback traits in [`callback`].

pub mod callback;
pub mod layer;
pub mod spdu;
pub mod state;
mod table;

pub use en50221_core::{En50221Error, En50221Result, ResourceId};

pub use callback::{
    LookupError, ResourceHandler, ResourceLookup, SessionEvent, SessionEventHandler,
    SessionEventKind, SessionVerdict,
};
pub use layer::{SessionLayer, SessionLayerConfig};
pub use spdu::{SessionStatus, Spdu, SESSION_NUMBER_NONE};
pub use state::SessionState;
