//! Client transaction engine.
//!
//! Translates GATT operations into ATT request sequences and feeds responses
//! back as callback events. One logical operation per connection handle and
//! response type is in flight at a time; pagination and fragmentation are
//! chains of continuations triggered by the next inbound event, never
//! synchronous loops.
//!
//! Request bookkeeping follows the send-acknowledge protocol of the
//! transport: an issued request sits in the pending-send list until the
//! transport confirms the send, then moves to the pending-response list
//! where it is resolved exactly once by a matching response, an error
//! response, or the transaction timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use super::types::{
    CharacteristicEntry, CharacteristicProperties, DescriptorEntry, DiscoveryCache, IncludeEntry,
    MtuRecord, RequestId, ServiceEntry,
};
use crate::att::constants::*;
use crate::att::pdu::{
    AttPacket, AttPdu, ErrorResponse, ExchangeMtuRequest, ExecuteWriteFlag, ExecuteWriteRequest,
    FindByTypeValueRequest, FindInformationRequest, HandleRange, HandleValueConfirmation,
    PrepareWriteRequest, ReadBlobRequest, ReadByGroupTypeRequest, ReadByTypeRequest,
    ReadMultipleRequest, ReadRequest, SignedWriteCommand, WriteCommand, WriteRequest,
};
use crate::att::AttErrorCode;
use crate::connection::manager::LinkInfoSource;
use crate::connection::types::default_mtu;
use crate::error::GattError;
use crate::transport::{ConnectionHandle, Transport, TransportError, TransportSink};
use crate::uuid::Uuid;

/// Per-operation completion callbacks. Delivered from the dispatcher thread.
pub trait ClientEventHandler: Send + Sync {
    fn on_mtu_exchanged(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        _result: Result<u16, GattError>,
    ) {
    }

    fn on_services_discovered(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        _result: Result<Vec<ServiceEntry>, GattError>,
    ) {
    }

    fn on_includes_discovered(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        _result: Result<Vec<IncludeEntry>, GattError>,
    ) {
    }

    fn on_characteristics_discovered(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        _result: Result<Vec<CharacteristicEntry>, GattError>,
    ) {
    }

    fn on_descriptors_discovered(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        _result: Result<Vec<DescriptorEntry>, GattError>,
    ) {
    }

    fn on_read(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        _handle: u16,
        _result: Result<Vec<u8>, GattError>,
    ) {
    }

    fn on_write(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        _handle: u16,
        _result: Result<(), GattError>,
    ) {
    }

    /// Reliable write echo: the server's copy of the prepared value, for
    /// verification before the caller issues the execute.
    fn on_reliable_write_echo(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        _handle: u16,
        _echoed: Vec<u8>,
    ) {
    }

    fn on_execute_write(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        _result: Result<(), GattError>,
    ) {
    }

    fn on_notification(&self, _conn: ConnectionHandle, _handle: u16, _value: Vec<u8>) {}

    fn on_indication(&self, _conn: ConnectionHandle, _handle: u16, _value: Vec<u8>) {}
}

/// Response-type tag of an outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    ExchangeMtu,
    DiscoverServices,
    DiscoverServicesByUuid,
    DiscoverIncludes,
    DiscoverCharacteristics,
    DiscoverDescriptors,
    Read,
    ReadLong,
    ReadMultiple,
    Write,
    WriteLong,
    WriteLongExecute,
    ReliableWrite,
    ExecuteWrite,
}

impl RequestKind {
    /// Opcode of the request PDU this entry is waiting on.
    fn request_opcode(self) -> u8 {
        match self {
            RequestKind::ExchangeMtu => ATT_EXCHANGE_MTU_REQ,
            RequestKind::DiscoverServices => ATT_READ_BY_GROUP_TYPE_REQ,
            RequestKind::DiscoverServicesByUuid => ATT_FIND_BY_TYPE_VALUE_REQ,
            RequestKind::DiscoverIncludes | RequestKind::DiscoverCharacteristics => {
                ATT_READ_BY_TYPE_REQ
            }
            RequestKind::DiscoverDescriptors => ATT_FIND_INFO_REQ,
            RequestKind::Read => ATT_READ_REQ,
            RequestKind::ReadLong => ATT_READ_BLOB_REQ,
            RequestKind::ReadMultiple => ATT_READ_MULTIPLE_REQ,
            RequestKind::Write => ATT_WRITE_REQ,
            RequestKind::WriteLong | RequestKind::ReliableWrite => ATT_PREPARE_WRITE_REQ,
            RequestKind::WriteLongExecute | RequestKind::ExecuteWrite => ATT_EXECUTE_WRITE_REQ,
        }
    }

    /// Whether an "attribute not found" error response means end-of-data
    /// rather than failure for this request.
    fn not_found_is_end_of_data(self) -> bool {
        matches!(
            self,
            RequestKind::DiscoverServices
                | RequestKind::DiscoverServicesByUuid
                | RequestKind::DiscoverIncludes
                | RequestKind::DiscoverCharacteristics
                | RequestKind::DiscoverDescriptors
        )
    }
}

/// One issued ATT request awaiting a send acknowledgment or a response.
#[derive(Debug)]
struct PendingRequest {
    kind: RequestKind,
    request_id: RequestId,
    start: u16,
    end: u16,
    handle: u16,
    uuid: Option<Uuid>,
    requested_mtu: u16,
    /// Full source value for a multi-chunk long write.
    payload: Vec<u8>,
    /// Bytes of `payload` already covered by issued prepare-writes.
    written: usize,
}

impl PendingRequest {
    fn new(kind: RequestKind, request_id: RequestId) -> Self {
        PendingRequest {
            kind,
            request_id,
            start: 0,
            end: 0,
            handle: 0,
            uuid: None,
            requested_mtu: 0,
            payload: Vec::new(),
            written: 0,
        }
    }
}

/// Per-connection client state. Mutated only from the dispatcher thread.
struct ClientConnection {
    transport_kind: Transport,
    mtu: MtuRecord,
    pending_send: VecDeque<PendingRequest>,
    pending_response: VecDeque<PendingRequest>,
    cache: DiscoveryCache,
    /// Reassembly buffers for long reads, keyed by attribute handle.
    read_buffers: HashMap<u16, Vec<u8>>,
}

impl ClientConnection {
    fn new(transport_kind: Transport) -> Self {
        ClientConnection {
            transport_kind,
            mtu: MtuRecord::new(default_mtu(transport_kind)),
            pending_send: VecDeque::new(),
            pending_response: VecDeque::new(),
            cache: DiscoveryCache::default(),
            read_buffers: HashMap::new(),
        }
    }

    fn mtu(&self) -> usize {
        self.mtu.mtu as usize
    }
}

/// A resolved callback, executed after the state lock is released.
enum Outcome {
    MtuExchanged(RequestId, Result<u16, GattError>),
    Services(RequestId, Result<Vec<ServiceEntry>, GattError>),
    Includes(RequestId, Result<Vec<IncludeEntry>, GattError>),
    Characteristics(RequestId, Result<Vec<CharacteristicEntry>, GattError>),
    Descriptors(RequestId, Result<Vec<DescriptorEntry>, GattError>),
    Read(RequestId, u16, Result<Vec<u8>, GattError>),
    Write(RequestId, u16, Result<(), GattError>),
    ReliableEcho(RequestId, u16, Vec<u8>),
    ExecuteWrite(RequestId, Result<(), GattError>),
    Notification(u16, Vec<u8>),
    Indication(u16, Vec<u8>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// The client transaction engine. Constructed at the composition root; all
/// event entry points must run on the dispatcher thread.
pub struct ClientEngine {
    transport: Arc<dyn TransportSink>,
    links: Arc<dyn LinkInfoSource>,
    handler: Arc<dyn ClientEventHandler>,
    connections: Mutex<HashMap<ConnectionHandle, ClientConnection>>,
}

impl ClientEngine {
    pub fn new(
        transport: Arc<dyn TransportSink>,
        links: Arc<dyn LinkInfoSource>,
        handler: Arc<dyn ClientEventHandler>,
    ) -> Arc<Self> {
        Arc::new(ClientEngine {
            transport,
            links,
            handler,
            connections: Mutex::new(HashMap::new()),
        })
    }

    // --- lifecycle hooks (wired by the stack) ---

    /// Creates the per-connection state when a link comes up.
    pub fn on_connected(&self, conn: ConnectionHandle, transport_kind: Transport) {
        lock(&self.connections)
            .entry(conn)
            .or_insert_with(|| ClientConnection::new(transport_kind));
    }

    /// Drops all per-connection state; every outstanding request resolves
    /// with `NotConnected`.
    pub fn on_disconnected(&self, conn: ConnectionHandle) {
        let state = lock(&self.connections).remove(&conn);
        let Some(mut state) = state else { return };
        let mut outcomes = Vec::new();
        for req in state
            .pending_send
            .drain(..)
            .chain(state.pending_response.drain(..))
        {
            outcomes.push(failure_outcome(&req, GattError::NotConnected));
        }
        self.run(conn, outcomes);
    }

    // --- MTU ---

    /// Starts an MTU exchange. BR/EDR links report the transport default
    /// without any traffic; a repeated exchange reports the cached value.
    pub fn exchange_mtu(
        &self,
        conn: ConnectionHandle,
        request_id: RequestId,
        client_mtu: u16,
    ) -> Result<(), GattError> {
        let mut connections = lock(&self.connections);
        let state = self.state_mut(&mut connections, conn)?;

        if state.transport_kind == Transport::Classic || state.mtu.exchanged {
            let mtu = state.mtu.mtu;
            drop(connections);
            self.handler.on_mtu_exchanged(conn, request_id, Ok(mtu));
            return Ok(());
        }
        if !(ATT_DEFAULT_MTU..=ATT_MAX_MTU).contains(&client_mtu) {
            return Err(GattError::InvalidParameter("MTU out of range"));
        }

        let mut req = PendingRequest::new(RequestKind::ExchangeMtu, request_id);
        req.requested_mtu = client_mtu;
        let pdu = ExchangeMtuRequest { client_mtu }.serialize();
        self.issue(state, conn, req, pdu)
    }

    // --- discovery family ---

    pub fn discover_all_primary_services(
        &self,
        conn: ConnectionHandle,
        request_id: RequestId,
    ) -> Result<(), GattError> {
        self.start_discovery(
            conn,
            PendingRequest::new(RequestKind::DiscoverServices, request_id),
            ATT_HANDLE_MIN,
            ATT_HANDLE_MAX,
        )
    }

    pub fn discover_primary_services_by_uuid(
        &self,
        conn: ConnectionHandle,
        request_id: RequestId,
        uuid: Uuid,
    ) -> Result<(), GattError> {
        let mut req = PendingRequest::new(RequestKind::DiscoverServicesByUuid, request_id);
        req.uuid = Some(uuid);
        self.start_discovery(conn, req, ATT_HANDLE_MIN, ATT_HANDLE_MAX)
    }

    pub fn discover_included_services(
        &self,
        conn: ConnectionHandle,
        request_id: RequestId,
        start: u16,
        end: u16,
    ) -> Result<(), GattError> {
        self.start_discovery(
            conn,
            PendingRequest::new(RequestKind::DiscoverIncludes, request_id),
            start,
            end,
        )
    }

    pub fn discover_characteristics(
        &self,
        conn: ConnectionHandle,
        request_id: RequestId,
        start: u16,
        end: u16,
    ) -> Result<(), GattError> {
        self.start_discovery(
            conn,
            PendingRequest::new(RequestKind::DiscoverCharacteristics, request_id),
            start,
            end,
        )
    }

    /// Characteristic discovery with a UUID filter. The filter only affects
    /// which entries are cached; the page cursor still advances over every
    /// entry the server returns.
    pub fn discover_characteristics_by_uuid(
        &self,
        conn: ConnectionHandle,
        request_id: RequestId,
        start: u16,
        end: u16,
        uuid: Uuid,
    ) -> Result<(), GattError> {
        let mut req = PendingRequest::new(RequestKind::DiscoverCharacteristics, request_id);
        req.uuid = Some(uuid);
        self.start_discovery(conn, req, start, end)
    }

    pub fn discover_descriptors(
        &self,
        conn: ConnectionHandle,
        request_id: RequestId,
        start: u16,
        end: u16,
    ) -> Result<(), GattError> {
        self.start_discovery(
            conn,
            PendingRequest::new(RequestKind::DiscoverDescriptors, request_id),
            start,
            end,
        )
    }

    fn start_discovery(
        &self,
        conn: ConnectionHandle,
        mut req: PendingRequest,
        start: u16,
        end: u16,
    ) -> Result<(), GattError> {
        HandleRange::new(start, end).map_err(|_| GattError::InvalidParameter("bad handle range"))?;
        req.start = start;
        req.end = end;

        let mut connections = lock(&self.connections);
        let state = self.state_mut(&mut connections, conn)?;
        let pdu = build_discovery_pdu(&req);
        self.issue(state, conn, req, pdu)
    }

    // --- reads ---

    /// Reads an attribute value. Values longer than MTU-1 are fetched
    /// transparently via blob reads and delivered once, reassembled.
    pub fn read_value(
        &self,
        conn: ConnectionHandle,
        request_id: RequestId,
        handle: u16,
    ) -> Result<(), GattError> {
        let mut connections = lock(&self.connections);
        let state = self.state_mut(&mut connections, conn)?;
        let mut req = PendingRequest::new(RequestKind::Read, request_id);
        req.handle = handle;
        let pdu = ReadRequest { handle }.serialize();
        self.issue(state, conn, req, pdu)
    }

    pub fn read_multiple_values(
        &self,
        conn: ConnectionHandle,
        request_id: RequestId,
        handles: Vec<u16>,
    ) -> Result<(), GattError> {
        if handles.len() < 2 {
            return Err(GattError::InvalidParameter("read-multiple needs two handles"));
        }
        let mut connections = lock(&self.connections);
        let state = self.state_mut(&mut connections, conn)?;
        let req = PendingRequest::new(RequestKind::ReadMultiple, request_id);
        let pdu = ReadMultipleRequest { handles }.serialize();
        self.issue(state, conn, req, pdu)
    }

    // --- writes ---

    /// Writes an attribute value. Values longer than MTU-3 are rerouted to
    /// the prepare/execute long-write path in chunks of MTU-5 bytes.
    pub fn write_value(
        &self,
        conn: ConnectionHandle,
        request_id: RequestId,
        handle: u16,
        value: Vec<u8>,
    ) -> Result<(), GattError> {
        let mut connections = lock(&self.connections);
        let state = self.state_mut(&mut connections, conn)?;

        if value.len() <= state.mtu() - ATT_WRITE_HEADER_LEN as usize {
            let mut req = PendingRequest::new(RequestKind::Write, request_id);
            req.handle = handle;
            let pdu = WriteRequest { handle, value }.serialize();
            return self.issue(state, conn, req, pdu);
        }

        let mut req = PendingRequest::new(RequestKind::WriteLong, request_id);
        req.handle = handle;
        req.payload = value;
        self.send_next_chunk(state, conn, req)
    }

    /// Fire-and-forget write command; bypasses the request queues.
    pub fn write_without_response(
        &self,
        conn: ConnectionHandle,
        handle: u16,
        value: Vec<u8>,
    ) -> Result<(), GattError> {
        let mut connections = lock(&self.connections);
        let state = self.state_mut(&mut connections, conn)?;
        if value.len() > state.mtu() - ATT_WRITE_HEADER_LEN as usize {
            return Err(GattError::ValueTooLong);
        }
        let pdu = WriteCommand { handle, value }.serialize();
        self.transport.send_att(conn, &pdu)?;
        Ok(())
    }

    /// Signed write command (bonded links only; the signature comes from the
    /// security manager).
    pub fn signed_write(
        &self,
        conn: ConnectionHandle,
        handle: u16,
        value: Vec<u8>,
        signature: [u8; ATT_SIGNATURE_LEN],
    ) -> Result<(), GattError> {
        let mut connections = lock(&self.connections);
        let state = self.state_mut(&mut connections, conn)?;
        if value.len() + ATT_SIGNATURE_LEN > state.mtu() - ATT_WRITE_HEADER_LEN as usize {
            return Err(GattError::ValueTooLong);
        }
        let pdu = SignedWriteCommand {
            handle,
            value,
            signature,
        }
        .serialize();
        self.transport.send_att(conn, &pdu)?;
        Ok(())
    }

    /// Reliable write: prepares the full value and surfaces the server's
    /// echo for verification; the caller follows up with
    /// [`ClientEngine::execute_write`].
    pub fn reliable_write(
        &self,
        conn: ConnectionHandle,
        request_id: RequestId,
        handle: u16,
        value: Vec<u8>,
    ) -> Result<(), GattError> {
        let mut connections = lock(&self.connections);
        let state = self.state_mut(&mut connections, conn)?;
        if value.len() > state.mtu() - ATT_PREPARE_WRITE_HEADER_LEN as usize {
            return Err(GattError::ValueTooLong);
        }
        let mut req = PendingRequest::new(RequestKind::ReliableWrite, request_id);
        req.handle = handle;
        let pdu = PrepareWriteRequest {
            handle,
            offset: 0,
            part: value,
        }
        .serialize();
        self.issue(state, conn, req, pdu)
    }

    pub fn execute_write(
        &self,
        conn: ConnectionHandle,
        request_id: RequestId,
        commit: bool,
    ) -> Result<(), GattError> {
        let mut connections = lock(&self.connections);
        let state = self.state_mut(&mut connections, conn)?;
        let req = PendingRequest::new(RequestKind::ExecuteWrite, request_id);
        let flag = if commit {
            ExecuteWriteFlag::Commit
        } else {
            ExecuteWriteFlag::Cancel
        };
        let pdu = ExecuteWriteRequest { flag }.serialize();
        self.issue(state, conn, req, pdu)
    }

    // --- transport event entry points ---

    /// Send acknowledgment: moves the head pending-send entry to the
    /// pending-response list, or fails it if the send was rejected.
    pub fn handle_send_confirm(&self, conn: ConnectionHandle, opcode: u8, ok: bool) {
        let mut outcomes = Vec::new();
        {
            let mut connections = lock(&self.connections);
            let Some(state) = connections.get_mut(&conn) else { return };
            let matches = state
                .pending_send
                .front()
                .map(|req| req.kind.request_opcode() == opcode)
                .unwrap_or(false);
            if !matches {
                return;
            }
            let req = match state.pending_send.pop_front() {
                Some(req) => req,
                None => return,
            };
            if ok {
                state.pending_response.push_back(req);
            } else {
                warn!("send of opcode 0x{:02X} failed on 0x{:04X}", opcode, conn);
                outcomes.push(failure_outcome(
                    &req,
                    GattError::Transport(TransportError::Rejected("send failed")),
                ));
            }
        }
        self.run(conn, outcomes);
    }

    /// Transaction timeout: resolved identically to an error response. A
    /// request whose send acknowledgment never arrived is still in the
    /// pending-send list; it times out the same way.
    pub fn handle_timeout(&self, conn: ConnectionHandle, opcode: u8) {
        let mut outcomes = Vec::new();
        {
            let mut connections = lock(&self.connections);
            let Some(state) = connections.get_mut(&conn) else { return };
            let req = take_matching(&mut state.pending_response, |req| {
                req.kind.request_opcode() == opcode
            })
            .or_else(|| {
                take_matching(&mut state.pending_send, |req| {
                    req.kind.request_opcode() == opcode
                })
            });
            if let Some(req) = req {
                state.read_buffers.remove(&req.handle);
                outcomes.push(failure_outcome(&req, GattError::Timeout));
            }
        }
        self.run(conn, outcomes);
    }

    /// One decoded inbound PDU for this link (responses and server-initiated
    /// notifications/indications).
    pub fn handle_att(&self, conn: ConnectionHandle, pdu: AttPdu) {
        let mut outcomes = Vec::new();
        {
            let mut connections = lock(&self.connections);
            let Some(state) = connections.get_mut(&conn) else { return };
            match pdu {
                AttPdu::ErrorResponse(rsp) => self.on_error_response(state, conn, rsp, &mut outcomes),
                AttPdu::ExchangeMtuResponse(rsp) => {
                    if let Some(req) = take_kind(state, RequestKind::ExchangeMtu) {
                        let result = if rsp.server_mtu < ATT_DEFAULT_MTU {
                            Err(GattError::RequestRejected)
                        } else {
                            let negotiated = rsp.server_mtu.min(req.requested_mtu);
                            state.mtu = MtuRecord {
                                exchanged: true,
                                mtu: negotiated,
                            };
                            Ok(negotiated)
                        };
                        outcomes.push(Outcome::MtuExchanged(req.request_id, result));
                    }
                }
                AttPdu::ReadByGroupTypeResponse(rsp) => {
                    if let Some(req) = take_kind(state, RequestKind::DiscoverServices) {
                        let mut last = req.start;
                        for item in &rsp.items {
                            last = last.max(item.group_end_handle);
                            if let Some(uuid) = Uuid::try_from_slice_le(&item.value) {
                                state.cache.services.push(ServiceEntry {
                                    handle: item.handle,
                                    end_group_handle: item.group_end_handle,
                                    uuid,
                                });
                            }
                        }
                        self.continue_or_finish(state, conn, req, last, &mut outcomes);
                    }
                }
                AttPdu::FindByTypeValueResponse(rsp) => {
                    if let Some(req) = take_kind(state, RequestKind::DiscoverServicesByUuid) {
                        let uuid = req.uuid.unwrap_or_else(|| Uuid::from_u16(0));
                        let mut last = req.start;
                        for entry in &rsp.handles {
                            last = last.max(entry.group_end_handle);
                            state.cache.services.push(ServiceEntry {
                                handle: entry.found_handle,
                                end_group_handle: entry.group_end_handle,
                                uuid,
                            });
                        }
                        self.continue_or_finish(state, conn, req, last, &mut outcomes);
                    }
                }
                AttPdu::ReadByTypeResponse(rsp) => {
                    let taken = take_matching(&mut state.pending_response, |req| {
                        matches!(
                            req.kind,
                            RequestKind::DiscoverIncludes | RequestKind::DiscoverCharacteristics
                        )
                    });
                    if let Some(req) = taken {
                        let mut last = req.start;
                        for item in &rsp.items {
                            last = last.max(item.handle);
                            match req.kind {
                                RequestKind::DiscoverIncludes => {
                                    if let Some(entry) = parse_include(item.handle, &item.value) {
                                        state.cache.includes.push(entry);
                                    }
                                }
                                _ => {
                                    if let Some(entry) =
                                        parse_characteristic(item.handle, &item.value)
                                    {
                                        // Filter affects caching only; the
                                        // cursor advanced above regardless.
                                        if req.uuid.map_or(true, |filter| filter == entry.uuid) {
                                            state.cache.characteristics.push(entry);
                                        }
                                    }
                                }
                            }
                        }
                        self.continue_or_finish(state, conn, req, last, &mut outcomes);
                    }
                }
                AttPdu::FindInformationResponse(rsp) => {
                    if let Some(req) = take_kind(state, RequestKind::DiscoverDescriptors) {
                        let mut last = req.start;
                        for (handle, uuid) in &rsp.pairs {
                            last = last.max(*handle);
                            state.cache.descriptors.push(DescriptorEntry {
                                handle: *handle,
                                uuid: *uuid,
                            });
                        }
                        self.continue_or_finish(state, conn, req, last, &mut outcomes);
                    }
                }
                AttPdu::ReadResponse(rsp) => {
                    if let Some(req) = take_kind(state, RequestKind::Read) {
                        self.on_read_fragment(state, conn, req, rsp.value, &mut outcomes);
                    }
                }
                AttPdu::ReadBlobResponse(rsp) => {
                    if let Some(req) = take_kind(state, RequestKind::ReadLong) {
                        self.on_read_fragment(state, conn, req, rsp.part, &mut outcomes);
                    }
                }
                AttPdu::ReadMultipleResponse(rsp) => {
                    if let Some(req) = take_kind(state, RequestKind::ReadMultiple) {
                        outcomes.push(Outcome::Read(req.request_id, req.handle, Ok(rsp.values)));
                    }
                }
                AttPdu::WriteResponse(_) => {
                    if let Some(req) = take_kind(state, RequestKind::Write) {
                        outcomes.push(Outcome::Write(req.request_id, req.handle, Ok(())));
                    }
                }
                AttPdu::PrepareWriteResponse(rsp) => {
                    let taken = take_matching(&mut state.pending_response, |req| {
                        matches!(
                            req.kind,
                            RequestKind::WriteLong | RequestKind::ReliableWrite
                        )
                    });
                    match taken {
                        Some(req) if req.kind == RequestKind::ReliableWrite => {
                            outcomes.push(Outcome::ReliableEcho(
                                req.request_id,
                                req.handle,
                                rsp.part,
                            ));
                        }
                        Some(mut req) => {
                            let request_id = req.request_id;
                            let handle = req.handle;
                            if req.written < req.payload.len() {
                                if let Err(err) = self.send_next_chunk(state, conn, req) {
                                    outcomes.push(Outcome::Write(request_id, handle, Err(err)));
                                }
                            } else {
                                // All chunks prepared: commit.
                                req.kind = RequestKind::WriteLongExecute;
                                let pdu = ExecuteWriteRequest {
                                    flag: ExecuteWriteFlag::Commit,
                                }
                                .serialize();
                                if let Err(err) = self.issue(state, conn, req, pdu) {
                                    outcomes.push(Outcome::Write(request_id, handle, Err(err)));
                                }
                            }
                        }
                        None => {}
                    }
                }
                AttPdu::ExecuteWriteResponse(_) => {
                    let taken = take_matching(&mut state.pending_response, |req| {
                        matches!(
                            req.kind,
                            RequestKind::WriteLongExecute | RequestKind::ExecuteWrite
                        )
                    });
                    if let Some(req) = taken {
                        if req.kind == RequestKind::WriteLongExecute {
                            outcomes.push(Outcome::Write(req.request_id, req.handle, Ok(())));
                        } else {
                            outcomes.push(Outcome::ExecuteWrite(req.request_id, Ok(())));
                        }
                    }
                }
                AttPdu::HandleValueNotification(ntf) => {
                    outcomes.push(Outcome::Notification(ntf.handle, ntf.value));
                }
                AttPdu::HandleValueIndication(ind) => {
                    outcomes.push(Outcome::Indication(ind.handle, ind.value));
                    let pdu = HandleValueConfirmation.serialize();
                    if let Err(err) = self.transport.send_att(conn, &pdu) {
                        warn!("indication confirm failed: {}", err);
                    }
                }
                other => {
                    debug!("client engine ignoring {:?} on 0x{:04X}", other.opcode(), conn);
                }
            }
        }
        self.run(conn, outcomes);
    }

    // --- internals ---

    fn state_mut<'a>(
        &self,
        connections: &'a mut MutexGuard<'_, HashMap<ConnectionHandle, ClientConnection>>,
        conn: ConnectionHandle,
    ) -> Result<&'a mut ClientConnection, GattError> {
        if !connections.contains_key(&conn) {
            let transport_kind = self
                .links
                .link_transport(conn)
                .ok_or(GattError::NotConnected)?;
            connections.insert(conn, ClientConnection::new(transport_kind));
        }
        connections.get_mut(&conn).ok_or(GattError::NotConnected)
    }

    fn issue(
        &self,
        state: &mut ClientConnection,
        conn: ConnectionHandle,
        req: PendingRequest,
        pdu: Vec<u8>,
    ) -> Result<(), GattError> {
        self.transport.send_att(conn, &pdu)?;
        state.pending_send.push_back(req);
        Ok(())
    }

    /// Issues the next prepare-write chunk of MTU-5 bytes.
    fn send_next_chunk(
        &self,
        state: &mut ClientConnection,
        conn: ConnectionHandle,
        mut req: PendingRequest,
    ) -> Result<(), GattError> {
        let chunk_size = state.mtu() - ATT_PREPARE_WRITE_HEADER_LEN as usize;
        let offset = req.written;
        let chunk_end = (offset + chunk_size).min(req.payload.len());
        let part = req.payload[offset..chunk_end].to_vec();
        req.written = chunk_end;
        let pdu = PrepareWriteRequest {
            handle: req.handle,
            offset: offset as u16,
            part,
        }
        .serialize();
        self.issue(state, conn, req, pdu)
    }

    /// One read fragment arrived (direct read or blob). A full-size
    /// fragment (MTU-1 bytes) means more data follows.
    fn on_read_fragment(
        &self,
        state: &mut ClientConnection,
        conn: ConnectionHandle,
        mut req: PendingRequest,
        fragment: Vec<u8>,
        outcomes: &mut Vec<Outcome>,
    ) {
        let full_size = state.mtu() - ATT_READ_HEADER_LEN as usize;
        let handle = req.handle;
        let request_id = req.request_id;
        let buffer = state.read_buffers.entry(handle).or_default();
        buffer.extend_from_slice(&fragment);

        if fragment.len() == full_size && buffer.len() <= u16::MAX as usize {
            let offset = buffer.len() as u16;
            req.kind = RequestKind::ReadLong;
            let pdu = ReadBlobRequest { handle, offset }.serialize();
            if let Err(err) = self.issue(state, conn, req, pdu) {
                state.read_buffers.remove(&handle);
                outcomes.push(Outcome::Read(request_id, handle, Err(err)));
            }
        } else {
            let value = state.read_buffers.remove(&handle).unwrap_or_default();
            outcomes.push(Outcome::Read(req.request_id, handle, Ok(value)));
        }
    }

    fn on_error_response(
        &self,
        state: &mut ClientConnection,
        _conn: ConnectionHandle,
        rsp: ErrorResponse,
        outcomes: &mut Vec<Outcome>,
    ) {
        let taken = take_matching(&mut state.pending_response, |req| {
            req.kind.request_opcode() == rsp.request_opcode
        });
        let Some(req) = taken else {
            debug!(
                "error response for opcode 0x{:02X} with no outstanding request",
                rsp.request_opcode
            );
            return;
        };

        if rsp.error_code == AttErrorCode::AttributeNotFound && req.kind.not_found_is_end_of_data()
        {
            outcomes.push(success_with_cache(state, &req));
            return;
        }

        state.read_buffers.remove(&req.handle);
        outcomes.push(failure_outcome(
            &req,
            GattError::from_error_code(rsp.error_code),
        ));
    }

    /// Issues the next discovery page, or completes the operation when the
    /// queried range is exhausted.
    fn continue_or_finish(
        &self,
        state: &mut ClientConnection,
        conn: ConnectionHandle,
        mut req: PendingRequest,
        last_handle: u16,
        outcomes: &mut Vec<Outcome>,
    ) {
        if last_handle >= req.end || last_handle == ATT_HANDLE_MAX {
            outcomes.push(success_with_cache(state, &req));
            return;
        }
        req.start = last_handle + 1;
        let kind = req.kind;
        let request_id = req.request_id;
        let handle = req.handle;
        let pdu = build_discovery_pdu(&req);
        if let Err(err) = self.issue(state, conn, req, pdu) {
            warn!("discovery page request failed: {}", err);
            outcomes.push(failure_outcome_parts(kind, request_id, handle, err));
        }
    }

    fn run(&self, conn: ConnectionHandle, outcomes: Vec<Outcome>) {
        for outcome in outcomes {
            match outcome {
                Outcome::MtuExchanged(id, result) => {
                    self.handler.on_mtu_exchanged(conn, id, result)
                }
                Outcome::Services(id, result) => {
                    self.handler.on_services_discovered(conn, id, result)
                }
                Outcome::Includes(id, result) => {
                    self.handler.on_includes_discovered(conn, id, result)
                }
                Outcome::Characteristics(id, result) => {
                    self.handler.on_characteristics_discovered(conn, id, result)
                }
                Outcome::Descriptors(id, result) => {
                    self.handler.on_descriptors_discovered(conn, id, result)
                }
                Outcome::Read(id, handle, result) => self.handler.on_read(conn, id, handle, result),
                Outcome::Write(id, handle, result) => {
                    self.handler.on_write(conn, id, handle, result)
                }
                Outcome::ReliableEcho(id, handle, echoed) => {
                    self.handler.on_reliable_write_echo(conn, id, handle, echoed)
                }
                Outcome::ExecuteWrite(id, result) => {
                    self.handler.on_execute_write(conn, id, result)
                }
                Outcome::Notification(handle, value) => {
                    self.handler.on_notification(conn, handle, value)
                }
                Outcome::Indication(handle, value) => {
                    self.handler.on_indication(conn, handle, value)
                }
            }
        }
    }
}

fn take_kind(state: &mut ClientConnection, kind: RequestKind) -> Option<PendingRequest> {
    take_matching(&mut state.pending_response, |req| req.kind == kind)
}

fn take_matching<F>(queue: &mut VecDeque<PendingRequest>, pred: F) -> Option<PendingRequest>
where
    F: Fn(&PendingRequest) -> bool,
{
    let index = queue.iter().position(pred)?;
    queue.remove(index)
}

fn build_discovery_pdu(req: &PendingRequest) -> Vec<u8> {
    let range = HandleRange {
        start: req.start,
        end: req.end,
    };
    match req.kind {
        RequestKind::DiscoverServices => ReadByGroupTypeRequest {
            range,
            group_type: Uuid::from_u16(PRIMARY_SERVICE_UUID),
        }
        .serialize(),
        RequestKind::DiscoverServicesByUuid => FindByTypeValueRequest {
            range,
            attribute_type: PRIMARY_SERVICE_UUID,
            value: req.uuid.map(|uuid| uuid.to_wire()).unwrap_or_default(),
        }
        .serialize(),
        RequestKind::DiscoverIncludes => ReadByTypeRequest {
            range,
            attribute_type: Uuid::from_u16(INCLUDE_UUID),
        }
        .serialize(),
        RequestKind::DiscoverCharacteristics => ReadByTypeRequest {
            range,
            attribute_type: Uuid::from_u16(CHARACTERISTIC_UUID),
        }
        .serialize(),
        RequestKind::DiscoverDescriptors => FindInformationRequest { range }.serialize(),
        _ => Vec::new(),
    }
}

/// Include declaration value: included handle, end handle, optional 16-bit
/// service UUID.
fn parse_include(handle: u16, value: &[u8]) -> Option<IncludeEntry> {
    match value.len() {
        4 | 6 => {
            let included = u16::from_le_bytes([value[0], value[1]]);
            let end = u16::from_le_bytes([value[2], value[3]]);
            let uuid = if value.len() == 6 {
                Uuid::try_from_slice_le(&value[4..6])
            } else {
                None
            };
            Some(IncludeEntry {
                handle,
                included_service_handle: included,
                end_group_handle: end,
                uuid,
            })
        }
        _ => None,
    }
}

/// Characteristic declaration value: properties, value handle, UUID.
fn parse_characteristic(handle: u16, value: &[u8]) -> Option<CharacteristicEntry> {
    if value.len() != 5 && value.len() != 19 {
        return None;
    }
    let properties = CharacteristicProperties::from_bits_truncate(value[0]);
    let value_handle = u16::from_le_bytes([value[1], value[2]]);
    let uuid = Uuid::try_from_slice_le(&value[3..])?;
    Some(CharacteristicEntry {
        declaration_handle: handle,
        value_handle,
        properties,
        uuid,
    })
}

/// Completes a discovery operation with whatever accumulated so far.
fn success_with_cache(state: &mut ClientConnection, req: &PendingRequest) -> Outcome {
    match req.kind {
        RequestKind::DiscoverServices | RequestKind::DiscoverServicesByUuid => {
            Outcome::Services(req.request_id, Ok(std::mem::take(&mut state.cache.services)))
        }
        RequestKind::DiscoverIncludes => {
            Outcome::Includes(req.request_id, Ok(std::mem::take(&mut state.cache.includes)))
        }
        RequestKind::DiscoverCharacteristics => Outcome::Characteristics(
            req.request_id,
            Ok(std::mem::take(&mut state.cache.characteristics)),
        ),
        RequestKind::DiscoverDescriptors => Outcome::Descriptors(
            req.request_id,
            Ok(std::mem::take(&mut state.cache.descriptors)),
        ),
        _ => failure_outcome(req, GattError::RequestRejected),
    }
}

/// Maps a failed request onto the callback its caller is waiting on.
fn failure_outcome(req: &PendingRequest, err: GattError) -> Outcome {
    failure_outcome_parts(req.kind, req.request_id, req.handle, err)
}

fn failure_outcome_parts(
    kind: RequestKind,
    request_id: RequestId,
    handle: u16,
    err: GattError,
) -> Outcome {
    match kind {
        RequestKind::ExchangeMtu => Outcome::MtuExchanged(request_id, Err(err)),
        RequestKind::DiscoverServices | RequestKind::DiscoverServicesByUuid => {
            Outcome::Services(request_id, Err(err))
        }
        RequestKind::DiscoverIncludes => Outcome::Includes(request_id, Err(err)),
        RequestKind::DiscoverCharacteristics => Outcome::Characteristics(request_id, Err(err)),
        RequestKind::DiscoverDescriptors => Outcome::Descriptors(request_id, Err(err)),
        RequestKind::Read | RequestKind::ReadLong | RequestKind::ReadMultiple => {
            Outcome::Read(request_id, handle, Err(err))
        }
        RequestKind::Write
        | RequestKind::WriteLong
        | RequestKind::WriteLongExecute
        | RequestKind::ReliableWrite => Outcome::Write(request_id, handle, Err(err)),
        RequestKind::ExecuteWrite => Outcome::ExecuteWrite(request_id, Err(err)),
    }
}
