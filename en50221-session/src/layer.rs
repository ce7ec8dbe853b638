//! Session layer protocol engine
//!
//! Drives session creation and teardown from both sides, routes data SPDUs
//! to resource handlers and fans connection or slot loss out to every
//! affected session.
//!
//! All shared state sits behind one layer-wide mutex. The guard is never
//! held across a transport send or an upward callback: each operation
//! validates and mutates under the lock, snapshots whatever the following
//! send or callback needs into locals, drops the guard and only then
//! suspends. Callbacks may therefore re-enter the layer freely.

use crate::callback::{
    LookupError, ResourceHandler, ResourceLookup, SessionEvent, SessionEventHandler,
    SessionEventKind, SessionVerdict,
};
use crate::spdu::{SessionStatus, Spdu, SESSION_NUMBER_NONE};
use crate::state::SessionState;
use crate::table::SessionTable;
use async_trait::async_trait;
use en50221_core::{En50221Error, En50221Result, ResourceId};
use en50221_transport::{TransportEvent, TransportEventSink, TransportLayer, MAX_TRANSPORT_IOV};
use std::sync::{Arc, Mutex, MutexGuard};

/// Session layer construction parameters
#[derive(Debug, Clone)]
pub struct SessionLayerConfig {
    /// Size of the session table; session numbers index into it
    pub max_sessions: u16,
    /// Most caller buffers accepted by `send_datav`; the SPDU header
    /// occupies one further transport buffer slot
    pub max_data_iov: usize,
}

impl SessionLayerConfig {
    /// Parameters for a table of `max_sessions` slots with the default
    /// iovec ceiling
    pub fn new(max_sessions: u16) -> Self {
        Self {
            max_sessions,
            max_data_iov: MAX_TRANSPORT_IOV - 1,
        }
    }
}

impl Default for SessionLayerConfig {
    fn default() -> Self {
        Self::new(256)
    }
}

struct Inner {
    table: SessionTable,
    lookup: Option<Arc<dyn ResourceLookup>>,
    session_handler: Option<Arc<dyn SessionEventHandler>>,
}

/// EN 50221 session layer
///
/// Multiplexes resource sessions between host-side resources and the modules
/// in the CI slots, on top of a transport layer delivering framed payloads
/// over per-slot logical connections. Wrap the layer in an [`Arc`] and hand
/// it to the transport driver as its [`TransportEventSink`].
pub struct SessionLayer<T> {
    transport: T,
    max_data_iov: usize,
    inner: Mutex<Inner>,
}

impl<T: TransportLayer> SessionLayer<T> {
    /// Create a session layer over `transport` with a table of
    /// `max_sessions` slots
    pub fn new(transport: T, max_sessions: u16) -> En50221Result<Self> {
        Self::with_config(transport, SessionLayerConfig::new(max_sessions))
    }

    /// Create a session layer with explicit parameters
    pub fn with_config(transport: T, config: SessionLayerConfig) -> En50221Result<Self> {
        if config.max_sessions == 0 {
            return Err(En50221Error::InvalidConfig(
                "max_sessions must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            transport,
            max_data_iov: config.max_data_iov.min(MAX_TRANSPORT_IOV - 1),
            inner: Mutex::new(Inner {
                table: SessionTable::new(config.max_sessions),
                lookup: None,
                session_handler: None,
            }),
        })
    }

    /// Register the resource lookup invoked for module-initiated opens
    ///
    /// Without a registered lookup every open session request is answered
    /// with "no such resource".
    pub fn register_lookup(&self, lookup: Arc<dyn ResourceLookup>) {
        self.lock().lookup = Some(lookup);
    }

    /// Register the observer of session lifecycle events
    pub fn register_session_handler(&self, handler: Arc<dyn SessionEventHandler>) {
        self.lock().session_handler = Some(handler);
    }

    /// Get the transport this layer sends through
    pub fn transport(&self) -> &T {
        &self.transport
    }

    // A poisoned lock only means another thread panicked inside a critical
    // section; the table is plain data, so carry on with it.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a session to `resource_id` on a (slot, connection) pair
    ///
    /// Allocates the lowest free session number, sends a `CreateSession`
    /// SPDU and returns immediately; the session stays in `InCreation` and
    /// cannot carry data until the module's `CreateSessionResponse` moves it
    /// to `Active`. `handler`, if given, receives the session's inbound data
    /// from then on.
    pub async fn create_session(
        &self,
        slot: u8,
        connection: u8,
        resource_id: ResourceId,
        handler: Option<Arc<dyn ResourceHandler>>,
    ) -> En50221Result<u16> {
        let (session_number, session_handler) = {
            let mut inner = self.lock();
            let session_number = match inner.table.allocate() {
                Some(n) => n,
                None => return Err(En50221Error::BadSessionNumber(SESSION_NUMBER_NONE)),
            };
            if let Some(session) = inner.table.get_mut(session_number) {
                session.resource_id = resource_id;
                session.slot = slot;
                session.connection = connection;
                session.handler = handler;
            }
            (session_number, inner.session_handler.clone())
        };

        let encoded = Spdu::CreateSession {
            resource_id,
            session_number,
        }
        .encode();
        if let Err(err) = self.transport.send_data(slot, connection, &encoded).await {
            // the module never saw this session; reclaim the entry
            self.lock().table.release(session_number);
            return Err(err);
        }

        if let Some(handler) = session_handler {
            let _ = handler
                .on_session_event(SessionEvent {
                    kind: SessionEventKind::Connecting,
                    slot,
                    session_number,
                    resource_id,
                })
                .await;
        }
        Ok(session_number)
    }

    /// Tear down an active session
    ///
    /// Sends a `CloseSessionRequest`; the session is parked in `InDeletion`
    /// until the module's `CloseSessionResponse` returns it to `Idle`.
    pub async fn destroy_session(&self, session_number: u16) -> En50221Result<()> {
        let (slot, connection) = {
            let mut inner = self.lock();
            let session = match inner.table.get_mut(session_number) {
                Some(s) if s.state.can_destroy() => s,
                _ => return Err(En50221Error::BadSessionNumber(session_number)),
            };
            session.state = SessionState::InDeletion;
            (session.slot, session.connection)
        };

        let encoded = Spdu::CloseSessionRequest { session_number }.encode();
        self.transport.send_data(slot, connection, &encoded).await
    }

    /// Send an APDU on an active session
    pub async fn send_data(&self, session_number: u16, data: &[u8]) -> En50221Result<()> {
        let (slot, connection) = self.active_endpoint(session_number)?;
        let header = Spdu::SessionNumber {
            session_number,
            payload: &[],
        }
        .encode();
        self.transport
            .send_datav(slot, connection, &[header.as_slice(), data])
            .await
    }

    /// Send an APDU gathered from multiple buffers on an active session
    ///
    /// At most `max_data_iov` caller buffers are accepted so that the frame,
    /// including the SPDU header, fits the transport's
    /// [`MAX_TRANSPORT_IOV`] limit.
    pub async fn send_datav(&self, session_number: u16, iov: &[&[u8]]) -> En50221Result<()> {
        if iov.len() > self.max_data_iov {
            return Err(En50221Error::IovLimit(iov.len()));
        }
        let (slot, connection) = self.active_endpoint(session_number)?;
        let header = Spdu::SessionNumber {
            session_number,
            payload: &[],
        }
        .encode();
        let mut vectors: Vec<&[u8]> = Vec::with_capacity(iov.len() + 1);
        vectors.push(header.as_slice());
        vectors.extend_from_slice(iov);
        self.transport.send_datav(slot, connection, &vectors).await
    }

    /// Send an APDU to every active session bound to `resource_id`
    ///
    /// When `slot` is given only sessions on that slot are addressed. The
    /// table lock is released around each send; a session closed in the
    /// meantime fails its send and stops the broadcast with that error.
    pub async fn broadcast_data(
        &self,
        slot: Option<u8>,
        resource_id: ResourceId,
        data: &[u8],
    ) -> En50221Result<()> {
        let matching: Vec<u16> = {
            let inner = self.lock();
            inner
                .table
                .iter()
                .filter(|(_, s)| {
                    s.state.is_active()
                        && s.resource_id == resource_id
                        && slot.map_or(true, |wanted| s.slot == wanted)
                })
                .map(|(n, _)| n)
                .collect()
        };

        for session_number in matching {
            self.send_data(session_number, data).await?;
        }
        Ok(())
    }

    fn active_endpoint(&self, session_number: u16) -> En50221Result<(u8, u8)> {
        let inner = self.lock();
        match inner.table.get(session_number) {
            Some(s) if s.state.is_active() => Ok((s.slot, s.connection)),
            _ => Err(En50221Error::BadSessionNumber(session_number)),
        }
    }

    async fn fire_session_event(
        &self,
        kind: SessionEventKind,
        slot: u8,
        session_number: u16,
        resource_id: ResourceId,
    ) -> SessionVerdict {
        let handler = self.lock().session_handler.clone();
        match handler {
            Some(h) => {
                h.on_session_event(SessionEvent {
                    kind,
                    slot,
                    session_number,
                    resource_id,
                })
                .await
            }
            None => SessionVerdict::Accept,
        }
    }

    async fn on_data(&self, slot: u8, connection: u8, data: &[u8]) {
        let spdu = match Spdu::decode(data) {
            Ok(spdu) => spdu,
            Err(err) => {
                log::warn!(
                    "Dropping malformed SPDU from module on slot {:02x}: {}",
                    slot,
                    err
                );
                return;
            }
        };

        match spdu {
            Spdu::OpenSessionRequest { resource_id } => {
                self.handle_open_session_request(slot, connection, resource_id)
                    .await;
            }
            Spdu::CreateSessionResponse {
                status,
                session_number,
                ..
            } => {
                self.handle_create_session_response(slot, connection, status, session_number)
                    .await;
            }
            Spdu::CloseSessionRequest { session_number } => {
                self.handle_close_session_request(slot, connection, session_number)
                    .await;
            }
            Spdu::CloseSessionResponse { session_number, .. } => {
                self.handle_close_session_response(slot, connection, session_number);
            }
            Spdu::SessionNumber {
                session_number,
                payload,
            } => {
                self.handle_session_data(slot, connection, session_number, payload)
                    .await;
            }
            Spdu::OpenSessionResponse { .. } | Spdu::CreateSession { .. } => {
                log::warn!(
                    "Received host-only SPDU tag 0x{:02x} from module on slot {:02x}",
                    spdu.tag(),
                    slot
                );
            }
        }
    }

    async fn handle_open_session_request(&self, slot: u8, connection: u8, resource_id: ResourceId) {
        // resolve the resource without the lock held; the lookup is user code
        let (lookup, session_handler) = {
            let inner = self.lock();
            (inner.lookup.clone(), inner.session_handler.clone())
        };
        let mut status;
        let mut handler = None;
        match lookup {
            Some(lookup) => match lookup.lookup(slot, resource_id).await {
                Ok(h) => {
                    status = SessionStatus::Open;
                    handler = Some(h);
                }
                Err(err) => status = status_for_lookup_error(err),
            },
            // an unregistered lookup behaves as "no such resource"
            None => status = SessionStatus::CloseNoResource,
        }

        let mut allocated = None;
        if status.is_open() {
            allocated = self.lock().table.allocate();
            if allocated.is_none() {
                log::warn!("Ran out of sessions for module on slot {:02x}", slot);
                status = SessionStatus::CloseNoResource;
            }
        }

        // the fresh entry sits in InCreation, so nothing else can claim it
        // while the Connecting callback runs without the lock
        let mut active = false;
        if let Some(session_number) = allocated {
            let verdict = match &session_handler {
                Some(h) => {
                    h.on_session_event(SessionEvent {
                        kind: SessionEventKind::Connecting,
                        slot,
                        session_number,
                        resource_id,
                    })
                    .await
                }
                None => SessionVerdict::Accept,
            };
            match verdict {
                SessionVerdict::Accept => {
                    let mut inner = self.lock();
                    if let Some(session) = inner.table.get_mut(session_number) {
                        session.resource_id = resource_id;
                        session.slot = slot;
                        session.connection = connection;
                        session.handler = handler.take();
                        session.state = SessionState::Active;
                    }
                    active = true;
                }
                SessionVerdict::Refuse => {
                    status = SessionStatus::CloseResourceBusy;
                    self.lock().table.release(session_number);
                }
            }
        }

        let wire_session_number = match allocated {
            Some(n) if active => n,
            _ => SESSION_NUMBER_NONE,
        };
        let response = Spdu::OpenSessionResponse {
            status,
            resource_id,
            session_number: wire_session_number,
        };
        if let Err(err) = self
            .transport
            .send_data(slot, connection, &response.encode())
            .await
        {
            log::warn!("Transport error on slot {:02x}: {}", slot, err);
            if active {
                // the module never learned of the session
                if let Some(session_number) = allocated {
                    self.lock().table.release(session_number);
                }
                active = false;
            }
        }

        // announce the outcome to whoever saw Connecting
        if session_handler.is_some() {
            if let Some(session_number) = allocated {
                let kind = if active {
                    SessionEventKind::Connected
                } else {
                    SessionEventKind::ConnectFail
                };
                let _ = self
                    .fire_session_event(kind, slot, session_number, resource_id)
                    .await;
            }
        }
    }

    async fn handle_create_session_response(
        &self,
        slot: u8,
        connection: u8,
        status: SessionStatus,
        session_number: u16,
    ) {
        let outcome = {
            let mut inner = self.lock();
            let resource_id = match inner.table.get(session_number) {
                Some(s)
                    if s.state == SessionState::InCreation && s.matches(slot, connection) =>
                {
                    Some(s.resource_id)
                }
                _ => None,
            };
            match resource_id {
                Some(resource_id) if status.is_open() => {
                    if let Some(session) = inner.table.get_mut(session_number) {
                        session.state = SessionState::Active;
                    }
                    Some((SessionEventKind::Connected, resource_id))
                }
                Some(resource_id) => {
                    inner.table.release(session_number);
                    Some((SessionEventKind::ConnectFail, resource_id))
                }
                None => None,
            }
        };

        match outcome {
            Some((kind, resource_id)) => {
                let _ = self
                    .fire_session_event(kind, slot, session_number, resource_id)
                    .await;
            }
            None => {
                log::warn!(
                    "Received unexpected create session response for session {} from module on slot {:02x}",
                    session_number,
                    slot
                );
            }
        }
    }

    async fn handle_close_session_request(&self, slot: u8, connection: u8, session_number: u16) {
        let closed = {
            let mut inner = self.lock();
            let resource_id = match inner.table.get(session_number) {
                Some(s) if !s.state.is_idle() && s.matches(slot, connection) => {
                    Some(s.resource_id)
                }
                _ => None,
            };
            if resource_id.is_some() {
                inner.table.release(session_number);
            }
            resource_id
        };

        let status = if closed.is_some() {
            SessionStatus::Open
        } else {
            log::warn!(
                "Received close for unknown session {} from module on slot {:02x}",
                session_number,
                slot
            );
            SessionStatus::CloseNoResource
        };
        let response = Spdu::CloseSessionResponse {
            status,
            session_number,
        };
        if let Err(err) = self
            .transport
            .send_data(slot, connection, &response.encode())
            .await
        {
            log::warn!("Transport error on slot {:02x}: {}", slot, err);
        }

        if let Some(resource_id) = closed {
            let _ = self
                .fire_session_event(SessionEventKind::Close, slot, session_number, resource_id)
                .await;
        }
    }

    fn handle_close_session_response(&self, slot: u8, connection: u8, session_number: u16) {
        let mut inner = self.lock();
        let closes = matches!(
            inner.table.get(session_number),
            Some(s) if s.state == SessionState::InDeletion && s.matches(slot, connection)
        );
        if closes {
            inner.table.release(session_number);
        } else {
            log::warn!(
                "Received unexpected close session response for session {} from module on slot {:02x}",
                session_number,
                slot
            );
        }
    }

    async fn handle_session_data(
        &self,
        slot: u8,
        connection: u8,
        session_number: u16,
        payload: &[u8],
    ) {
        let target = {
            let inner = self.lock();
            match inner.table.get(session_number) {
                Some(s) if s.state.is_active() && s.matches(slot, connection) => {
                    Some((s.handler.clone(), s.resource_id))
                }
                _ => None,
            }
        };

        let (handler, resource_id) = match target {
            Some(t) => t,
            None => {
                log::warn!(
                    "Received data for unexpected session {} from module on slot {:02x}",
                    session_number,
                    slot
                );
                return;
            }
        };
        if let Some(handler) = handler {
            handler
                .on_data(slot, session_number, resource_id, payload)
                .await;
        }
    }

    async fn on_connection_close(&self, slot: u8, connection: u8) {
        let closed = {
            let mut inner = self.lock();
            let matching: Vec<(u16, ResourceId)> = inner
                .table
                .iter_by_connection(slot, connection)
                .map(|(n, s)| (n, s.resource_id))
                .collect();
            // reclaim before any callback runs; a re-entrant caller sees Idle
            for &(n, _) in &matching {
                inner.table.release(n);
            }
            matching
        };

        for (session_number, resource_id) in closed {
            let _ = self
                .fire_session_event(SessionEventKind::Close, slot, session_number, resource_id)
                .await;
        }
    }

    async fn on_slot_close(&self, slot: u8) {
        let closed = {
            let mut inner = self.lock();
            let matching: Vec<(u16, ResourceId)> = inner
                .table
                .iter_by_slot(slot)
                .map(|(n, s)| (n, s.resource_id))
                .collect();
            for &(n, _) in &matching {
                inner.table.release(n);
            }
            matching
        };

        for (session_number, resource_id) in closed {
            let _ = self
                .fire_session_event(SessionEventKind::Close, slot, session_number, resource_id)
                .await;
        }
    }
}

fn status_for_lookup_error(err: LookupError) -> SessionStatus {
    match err {
        LookupError::NoResource => SessionStatus::CloseNoResource,
        LookupError::ResourceUnavailable => SessionStatus::CloseResourceUnavailable,
        LookupError::ResourceLowVersion => SessionStatus::CloseResourceLowVersion,
    }
}

#[async_trait]
impl<T: TransportLayer> TransportEventSink for SessionLayer<T> {
    async fn on_transport_event(&self, event: TransportEvent<'_>) {
        match event {
            TransportEvent::Data {
                slot,
                connection,
                data,
            } => self.on_data(slot, connection, data).await,
            TransportEvent::ConnectionClose { slot, connection } => {
                self.on_connection_close(slot, connection).await;
            }
            TransportEvent::SlotClose { slot } => self.on_slot_close(slot).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use en50221_core::resource_id::{RESOURCE_ID_CA_SUPPORT, RESOURCE_ID_RESOURCE_MANAGER};
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<(u8, u8, Vec<u8>)>>,
        fail_sends: AtomicBool,
    }

    impl MockTransport {
        fn sent_frames(&self) -> Vec<(u8, u8, Vec<u8>)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TransportLayer for MockTransport {
        async fn send_data(&self, slot: u8, connection: u8, data: &[u8]) -> En50221Result<()> {
            self.send_datav(slot, connection, &[data]).await
        }

        async fn send_datav(&self, slot: u8, connection: u8, iov: &[&[u8]]) -> En50221Result<()> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "module removed").into());
            }
            assert!(iov.len() <= MAX_TRANSPORT_IOV);
            let frame: Vec<u8> = iov.iter().flat_map(|buf| buf.iter().copied()).collect();
            self.sent.lock().unwrap().push((slot, connection, frame));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        data: Mutex<Vec<(u8, u16, ResourceId, Vec<u8>)>>,
    }

    #[async_trait]
    impl ResourceHandler for RecordingHandler {
        async fn on_data(
            &self,
            slot: u8,
            session_number: u16,
            resource_id: ResourceId,
            payload: &[u8],
        ) {
            self.data
                .lock()
                .unwrap()
                .push((slot, session_number, resource_id, payload.to_vec()));
        }
    }

    struct StaticLookup {
        answer: Result<Arc<dyn ResourceHandler>, LookupError>,
        calls: Mutex<Vec<(u8, ResourceId)>>,
    }

    impl StaticLookup {
        fn found(handler: Arc<dyn ResourceHandler>) -> Self {
            Self {
                answer: Ok(handler),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing(err: LookupError) -> Self {
            Self {
                answer: Err(err),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ResourceLookup for StaticLookup {
        async fn lookup(
            &self,
            slot: u8,
            resource_id: ResourceId,
        ) -> Result<Arc<dyn ResourceHandler>, LookupError> {
            self.calls.lock().unwrap().push((slot, resource_id));
            self.answer.clone()
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        events: Mutex<Vec<SessionEvent>>,
        refuse_connecting: AtomicBool,
    }

    #[async_trait]
    impl SessionEventHandler for RecordingEvents {
        async fn on_session_event(&self, event: SessionEvent) -> SessionVerdict {
            let refuse = event.kind == SessionEventKind::Connecting
                && self.refuse_connecting.load(Ordering::SeqCst);
            self.events.lock().unwrap().push(event);
            if refuse {
                SessionVerdict::Refuse
            } else {
                SessionVerdict::Accept
            }
        }
    }

    struct Fixture {
        layer: Arc<SessionLayer<MockTransport>>,
        lookup: Arc<StaticLookup>,
        handler: Arc<RecordingHandler>,
        events: Arc<RecordingEvents>,
    }

    fn fixture(max_sessions: u16) -> Fixture {
        let layer = Arc::new(SessionLayer::new(MockTransport::default(), max_sessions).unwrap());
        let handler = Arc::new(RecordingHandler::default());
        let lookup = Arc::new(StaticLookup::found(handler.clone()));
        let events = Arc::new(RecordingEvents::default());
        layer.register_lookup(lookup.clone());
        layer.register_session_handler(events.clone());
        Fixture {
            layer,
            lookup,
            handler,
            events,
        }
    }

    async fn feed(layer: &SessionLayer<MockTransport>, slot: u8, connection: u8, bytes: &[u8]) {
        layer
            .on_transport_event(TransportEvent::Data {
                slot,
                connection,
                data: bytes,
            })
            .await;
    }

    /// Module-initiated open of the resource manager on (slot, connection)
    async fn open_resource_manager(f: &Fixture, slot: u8, connection: u8) {
        feed(
            &f.layer,
            slot,
            connection,
            &[0x91, 0x04, 0x00, 0x01, 0x00, 0x41],
        )
        .await;
    }

    fn event(
        kind: SessionEventKind,
        slot: u8,
        session_number: u16,
        resource_id: ResourceId,
    ) -> SessionEvent {
        SessionEvent {
            kind,
            slot,
            session_number,
            resource_id,
        }
    }

    fn state_of(layer: &SessionLayer<MockTransport>, session_number: u16) -> SessionState {
        layer.lock().table.get(session_number).unwrap().state
    }

    #[tokio::test]
    async fn test_module_open_creates_session() {
        let f = fixture(5);
        open_resource_manager(&f, 0, 1).await;

        assert_eq!(
            f.lookup.calls.lock().unwrap().as_slice(),
            &[(0, RESOURCE_ID_RESOURCE_MANAGER)]
        );
        assert_eq!(
            f.layer.transport().sent_frames(),
            vec![(
                0,
                1,
                vec![0x92, 0x07, 0x00, 0x00, 0x01, 0x00, 0x41, 0x00, 0x00]
            )]
        );
        assert_eq!(
            f.events.events.lock().unwrap().as_slice(),
            &[
                event(SessionEventKind::Connecting, 0, 0, RESOURCE_ID_RESOURCE_MANAGER),
                event(SessionEventKind::Connected, 0, 0, RESOURCE_ID_RESOURCE_MANAGER),
            ]
        );

        let inner = f.layer.lock();
        let session = inner.table.get(0).unwrap();
        assert!(session.state.is_active());
        assert_eq!(session.resource_id, RESOURCE_ID_RESOURCE_MANAGER);
        assert!(session.matches(0, 1));
    }

    #[tokio::test]
    async fn test_data_routed_to_resource_handler() {
        let f = fixture(5);
        open_resource_manager(&f, 0, 1).await;

        feed(&f.layer, 0, 1, &[0x90, 0x02, 0x00, 0x00, 0xA0, 0x01, 0x82]).await;

        assert_eq!(
            f.handler.data.lock().unwrap().as_slice(),
            &[(
                0,
                0,
                RESOURCE_ID_RESOURCE_MANAGER,
                vec![0xA0, 0x01, 0x82]
            )]
        );
    }

    #[tokio::test]
    async fn test_data_for_wrong_endpoint_dropped() {
        let f = fixture(5);
        open_resource_manager(&f, 0, 1).await;

        // wrong connection
        feed(&f.layer, 0, 2, &[0x90, 0x02, 0x00, 0x00, 0xA0]).await;
        // session number beyond the table
        feed(&f.layer, 0, 1, &[0x90, 0x02, 0x00, 0x07, 0xA0]).await;
        // idle session
        feed(&f.layer, 0, 1, &[0x90, 0x02, 0x00, 0x01, 0xA0]).await;

        assert!(f.handler.data.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_host_create_session() {
        let f = fixture(5);
        open_resource_manager(&f, 0, 1).await;

        let session_number = f
            .layer
            .create_session(0, 1, RESOURCE_ID_CA_SUPPORT, Some(f.handler.clone()))
            .await
            .unwrap();
        assert_eq!(session_number, 1);
        assert_eq!(state_of(&f.layer, 1), SessionState::InCreation);
        assert_eq!(
            f.layer.transport().sent_frames().last().unwrap(),
            &(0, 1, vec![0x93, 0x06, 0x00, 0x03, 0x00, 0x41, 0x00, 0x01])
        );
        assert_eq!(
            f.events.events.lock().unwrap().last().unwrap(),
            &event(SessionEventKind::Connecting, 0, 1, RESOURCE_ID_CA_SUPPORT)
        );

        // data must not flow while the response is outstanding
        assert!(matches!(
            f.layer.send_data(1, &[0xA0]).await,
            Err(En50221Error::BadSessionNumber(1))
        ));

        feed(
            &f.layer,
            0,
            1,
            &[0x94, 0x07, 0x00, 0x00, 0x03, 0x00, 0x41, 0x00, 0x01],
        )
        .await;
        assert_eq!(state_of(&f.layer, 1), SessionState::Active);
        assert_eq!(
            f.events.events.lock().unwrap().last().unwrap(),
            &event(SessionEventKind::Connected, 0, 1, RESOURCE_ID_CA_SUPPORT)
        );
    }

    #[tokio::test]
    async fn test_create_session_response_failure_releases() {
        let f = fixture(5);
        let session_number = f
            .layer
            .create_session(0, 1, RESOURCE_ID_CA_SUPPORT, None)
            .await
            .unwrap();
        assert_eq!(session_number, 0);

        // module refuses with "no resource"
        feed(
            &f.layer,
            0,
            1,
            &[0x94, 0x07, 0xF0, 0x00, 0x03, 0x00, 0x41, 0x00, 0x00],
        )
        .await;

        assert_eq!(state_of(&f.layer, 0), SessionState::Idle);
        assert_eq!(
            f.events.events.lock().unwrap().as_slice(),
            &[
                event(SessionEventKind::Connecting, 0, 0, RESOURCE_ID_CA_SUPPORT),
                event(SessionEventKind::ConnectFail, 0, 0, RESOURCE_ID_CA_SUPPORT),
            ]
        );
    }

    #[tokio::test]
    async fn test_module_close_request() {
        let f = fixture(5);
        open_resource_manager(&f, 0, 1).await;

        feed(&f.layer, 0, 1, &[0x95, 0x02, 0x00, 0x00]).await;

        assert_eq!(
            f.layer.transport().sent_frames().last().unwrap(),
            &(0, 1, vec![0x96, 0x03, 0x00, 0x00, 0x00])
        );
        assert_eq!(state_of(&f.layer, 0), SessionState::Idle);
        assert_eq!(
            f.events.events.lock().unwrap().last().unwrap(),
            &event(SessionEventKind::Close, 0, 0, RESOURCE_ID_RESOURCE_MANAGER)
        );
    }

    #[tokio::test]
    async fn test_close_request_for_unknown_session() {
        let f = fixture(5);
        open_resource_manager(&f, 0, 1).await;
        let events_before = f.events.events.lock().unwrap().len();

        // out of range
        feed(&f.layer, 0, 1, &[0x95, 0x02, 0x00, 0x07]).await;
        assert_eq!(
            f.layer.transport().sent_frames().last().unwrap(),
            &(0, 1, vec![0x96, 0x03, 0xF0, 0x00, 0x07])
        );

        // wrong connection; the session must survive untouched
        feed(&f.layer, 0, 2, &[0x95, 0x02, 0x00, 0x00]).await;
        assert_eq!(
            f.layer.transport().sent_frames().last().unwrap(),
            &(0, 2, vec![0x96, 0x03, 0xF0, 0x00, 0x00])
        );
        assert_eq!(state_of(&f.layer, 0), SessionState::Active);
        assert_eq!(f.events.events.lock().unwrap().len(), events_before);
    }

    #[tokio::test]
    async fn test_connection_close_fans_out_in_order() {
        let f = fixture(5);
        open_resource_manager(&f, 0, 1).await;
        f.layer
            .create_session(0, 1, RESOURCE_ID_CA_SUPPORT, None)
            .await
            .unwrap();
        feed(
            &f.layer,
            0,
            1,
            &[0x94, 0x07, 0x00, 0x00, 0x03, 0x00, 0x41, 0x00, 0x01],
        )
        .await;

        f.layer
            .on_transport_event(TransportEvent::ConnectionClose {
                slot: 0,
                connection: 1,
            })
            .await;

        assert_eq!(state_of(&f.layer, 0), SessionState::Idle);
        assert_eq!(state_of(&f.layer, 1), SessionState::Idle);
        let events = f.events.events.lock().unwrap();
        assert_eq!(
            &events[events.len() - 2..],
            &[
                event(SessionEventKind::Close, 0, 0, RESOURCE_ID_RESOURCE_MANAGER),
                event(SessionEventKind::Close, 0, 1, RESOURCE_ID_CA_SUPPORT),
            ]
        );
        // no close SPDU goes out; the connection is already gone
        assert!(f
            .layer
            .transport()
            .sent_frames()
            .iter()
            .all(|(_, _, frame)| frame[0] != 0x95 && frame[0] != 0x96));
    }

    #[tokio::test]
    async fn test_slot_close_spares_other_slots() {
        let f = fixture(5);
        open_resource_manager(&f, 0, 1).await;
        open_resource_manager(&f, 0, 2).await;
        open_resource_manager(&f, 1, 1).await;

        f.layer
            .on_transport_event(TransportEvent::SlotClose { slot: 0 })
            .await;

        assert_eq!(state_of(&f.layer, 0), SessionState::Idle);
        assert_eq!(state_of(&f.layer, 1), SessionState::Idle);
        assert_eq!(state_of(&f.layer, 2), SessionState::Active);
        let events = f.events.events.lock().unwrap();
        assert_eq!(
            &events[events.len() - 2..],
            &[
                event(SessionEventKind::Close, 0, 0, RESOURCE_ID_RESOURCE_MANAGER),
                event(SessionEventKind::Close, 0, 1, RESOURCE_ID_RESOURCE_MANAGER),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_open_dropped() {
        let f = fixture(5);
        feed(&f.layer, 0, 1, &[0x91, 0x03, 0x00, 0x01, 0x00, 0x41]).await;

        assert!(f.layer.transport().sent_frames().is_empty());
        assert!(f.events.events.lock().unwrap().is_empty());
        assert_eq!(state_of(&f.layer, 0), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_destroy_session_round_trip() {
        let f = fixture(5);
        let session_number = f
            .layer
            .create_session(0, 1, RESOURCE_ID_CA_SUPPORT, None)
            .await
            .unwrap();
        feed(
            &f.layer,
            0,
            1,
            &[0x94, 0x07, 0x00, 0x00, 0x03, 0x00, 0x41, 0x00, 0x00],
        )
        .await;

        f.layer.destroy_session(session_number).await.unwrap();
        assert_eq!(state_of(&f.layer, 0), SessionState::InDeletion);

        let frames = f.layer.transport().sent_frames();
        let create = &frames[0].2;
        let close = &frames[1].2;
        assert_eq!(create[0], 0x93);
        assert_eq!(close, &vec![0x95, 0x02, 0x00, 0x00]);
        // both carry the same session number bytes
        assert_eq!(&create[6..8], &close[2..4]);

        feed(&f.layer, 0, 1, &[0x96, 0x03, 0x00, 0x00, 0x00]).await;
        assert_eq!(state_of(&f.layer, 0), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_destroy_session_wrong_state() {
        let f = fixture(5);
        let session_number = f
            .layer
            .create_session(0, 1, RESOURCE_ID_CA_SUPPORT, None)
            .await
            .unwrap();

        // still InCreation
        assert!(matches!(
            f.layer.destroy_session(session_number).await,
            Err(En50221Error::BadSessionNumber(0))
        ));
        // never allocated
        assert!(matches!(
            f.layer.destroy_session(4).await,
            Err(En50221Error::BadSessionNumber(4))
        ));
        // out of range
        assert!(matches!(
            f.layer.destroy_session(100).await,
            Err(En50221Error::BadSessionNumber(100))
        ));
    }

    #[tokio::test]
    async fn test_send_datav_iov_limit() {
        let f = fixture(5);
        open_resource_manager(&f, 0, 1).await;

        let chunk = [0x5Au8];
        let nine: Vec<&[u8]> = (0..9).map(|_| &chunk[..]).collect();
        f.layer.send_datav(0, &nine).await.unwrap();
        let frames = f.layer.transport().sent_frames();
        let (_, _, frame) = frames.last().unwrap();
        assert_eq!(frame[..4], [0x90, 0x02, 0x00, 0x00]);
        assert_eq!(frame.len(), 4 + 9);

        let ten: Vec<&[u8]> = (0..10).map(|_| &chunk[..]).collect();
        assert!(matches!(
            f.layer.send_datav(0, &ten).await,
            Err(En50221Error::IovLimit(10))
        ));
    }

    #[tokio::test]
    async fn test_full_table() {
        let f = fixture(1);
        open_resource_manager(&f, 0, 1).await;

        // module side: open refused with "no resource" and session 0xFFFF
        open_resource_manager(&f, 0, 1).await;
        assert_eq!(
            f.layer.transport().sent_frames().last().unwrap(),
            &(
                0,
                1,
                vec![0x92, 0x07, 0xF0, 0x00, 0x01, 0x00, 0x41, 0xFF, 0xFF]
            )
        );

        // host side: create fails, table unchanged
        assert!(matches!(
            f.layer
                .create_session(0, 1, RESOURCE_ID_CA_SUPPORT, None)
                .await,
            Err(En50221Error::BadSessionNumber(SESSION_NUMBER_NONE))
        ));
        assert_eq!(state_of(&f.layer, 0), SessionState::Active);
    }

    #[tokio::test]
    async fn test_refused_open() {
        let f = fixture(5);
        f.events.refuse_connecting.store(true, Ordering::SeqCst);

        open_resource_manager(&f, 0, 1).await;

        assert_eq!(
            f.layer.transport().sent_frames().last().unwrap(),
            &(
                0,
                1,
                vec![0x92, 0x07, 0xF3, 0x00, 0x01, 0x00, 0x41, 0xFF, 0xFF]
            )
        );
        assert_eq!(state_of(&f.layer, 0), SessionState::Idle);
        assert_eq!(
            f.events.events.lock().unwrap().as_slice(),
            &[
                event(SessionEventKind::Connecting, 0, 0, RESOURCE_ID_RESOURCE_MANAGER),
                event(SessionEventKind::ConnectFail, 0, 0, RESOURCE_ID_RESOURCE_MANAGER),
            ]
        );
    }

    #[tokio::test]
    async fn test_lookup_failure_status() {
        let layer = Arc::new(SessionLayer::new(MockTransport::default(), 5).unwrap());
        layer.register_lookup(Arc::new(StaticLookup::failing(
            LookupError::ResourceLowVersion,
        )));

        feed(&layer, 0, 1, &[0x91, 0x04, 0x00, 0x01, 0x00, 0x41]).await;

        assert_eq!(
            layer.transport().sent_frames().last().unwrap(),
            &(
                0,
                1,
                vec![0x92, 0x07, 0xF2, 0x00, 0x01, 0x00, 0x41, 0xFF, 0xFF]
            )
        );
        assert_eq!(state_of(&layer, 0), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_open_without_registered_lookup() {
        let layer = Arc::new(SessionLayer::new(MockTransport::default(), 5).unwrap());

        feed(&layer, 0, 1, &[0x91, 0x04, 0x00, 0x01, 0x00, 0x41]).await;

        assert_eq!(
            layer.transport().sent_frames().last().unwrap(),
            &(
                0,
                1,
                vec![0x92, 0x07, 0xF0, 0x00, 0x01, 0x00, 0x41, 0xFF, 0xFF]
            )
        );
    }

    #[tokio::test]
    async fn test_create_send_failure_releases() {
        let f = fixture(5);
        f.layer
            .transport()
            .fail_sends
            .store(true, Ordering::SeqCst);

        let result = f
            .layer
            .create_session(0, 1, RESOURCE_ID_CA_SUPPORT, None)
            .await;

        assert!(matches!(result, Err(En50221Error::Transport(_))));
        assert_eq!(state_of(&f.layer, 0), SessionState::Idle);
        assert!(f.events.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_data() {
        let f = fixture(5);
        open_resource_manager(&f, 0, 1).await;
        open_resource_manager(&f, 1, 1).await;
        f.layer
            .create_session(0, 1, RESOURCE_ID_CA_SUPPORT, None)
            .await
            .unwrap();
        feed(
            &f.layer,
            0,
            1,
            &[0x94, 0x07, 0x00, 0x00, 0x03, 0x00, 0x41, 0x00, 0x02],
        )
        .await;

        f.layer
            .broadcast_data(None, RESOURCE_ID_RESOURCE_MANAGER, &[0xA0])
            .await
            .unwrap();
        let frames = f.layer.transport().sent_frames();
        let data_frames: Vec<&(u8, u8, Vec<u8>)> =
            frames.iter().filter(|(_, _, b)| b[0] == 0x90).collect();
        assert_eq!(data_frames.len(), 2);
        assert_eq!(
            (data_frames[0].0, data_frames[0].1),
            (0, 1),
        );
        assert_eq!(
            (data_frames[1].0, data_frames[1].1),
            (1, 1),
        );

        f.layer
            .broadcast_data(Some(1), RESOURCE_ID_RESOURCE_MANAGER, &[0xA1])
            .await
            .unwrap();
        let frames = f.layer.transport().sent_frames();
        let (slot, _, frame) = frames.last().unwrap();
        assert_eq!(*slot, 1);
        assert_eq!(frame[..2], [0x90, 0x02]);
    }

    #[tokio::test]
    async fn test_unsolicited_responses_dropped() {
        let f = fixture(5);

        // create session response with no session in creation
        feed(
            &f.layer,
            0,
            1,
            &[0x94, 0x07, 0x00, 0x00, 0x03, 0x00, 0x41, 0x00, 0x00],
        )
        .await;
        // close session response with no session in deletion
        feed(&f.layer, 0, 1, &[0x96, 0x03, 0x00, 0x00, 0x00]).await;
        // host-only tags arriving from the module
        feed(
            &f.layer,
            0,
            1,
            &[0x92, 0x07, 0x00, 0x00, 0x01, 0x00, 0x41, 0x00, 0x00],
        )
        .await;
        feed(
            &f.layer,
            0,
            1,
            &[0x93, 0x06, 0x00, 0x03, 0x00, 0x41, 0x00, 0x00],
        )
        .await;

        assert!(f.layer.transport().sent_frames().is_empty());
        assert!(f.events.events.lock().unwrap().is_empty());
        assert_eq!(state_of(&f.layer, 0), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        assert!(SessionLayer::new(MockTransport::default(), 0).is_err());
    }
}
