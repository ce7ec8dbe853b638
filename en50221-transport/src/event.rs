//! Upward event path from the transport layer

use async_trait::async_trait;

/// Event raised by a transport layer towards the layer above it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent<'a> {
    /// A payload arrived on an open connection
    ///
    /// The bytes belong to the transport layer and are valid only for the
    /// duration of the callback.
    Data {
        slot: u8,
        connection: u8,
        data: &'a [u8],
    },
    /// A single logical connection was closed
    ConnectionClose { slot: u8, connection: u8 },
    /// A slot was closed; every connection on it is gone
    SlotClose { slot: u8 },
}

/// Receiver of transport events
///
/// A transport driver holds its registered listener and pushes every inbound
/// payload and every lifecycle event into it from its read loop. Close
/// notifications for a (slot, connection) must be delivered before any data
/// for a later connection reusing the same identifiers.
#[async_trait]
pub trait TransportEventSink: Send + Sync {
    /// Handle one transport event
    async fn on_transport_event(&self, event: TransportEvent<'_>);
}
