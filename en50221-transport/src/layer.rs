//! Transport layer trait consumed by the session layer

use async_trait::async_trait;
use en50221_core::En50221Result;

/// Maximum number of buffers a transport accepts in a single
/// [`TransportLayer::send_datav`] call
pub const MAX_TRANSPORT_IOV: usize = 10;

/// Interface to a transport layer carrying framed byte payloads over
/// per-slot logical connections
///
/// Implementations own the physical CI driver and the transport framing. The
/// session layer only hands them fully formed payloads and observes their
/// lifecycle through [`TransportEvent`](crate::TransportEvent).
///
/// Outbound buffers must remain valid only until the call returns; a
/// transport that queues internally has to copy.
#[async_trait]
pub trait TransportLayer: Send + Sync {
    /// Send a single payload on a (slot, connection) pair
    async fn send_data(&self, slot: u8, connection: u8, data: &[u8]) -> En50221Result<()>;

    /// Send one payload gathered from multiple buffers
    ///
    /// At most [`MAX_TRANSPORT_IOV`] buffers are accepted. The buffers are
    /// concatenated into a single transport frame.
    async fn send_datav(&self, slot: u8, connection: u8, iov: &[&[u8]]) -> En50221Result<()>;
}
