//! Server transaction engine.
//!
//! Answers inbound ATT requests against an [`AttributeStore`], enforcing
//! attribute permissions before any application callback fires. Values the
//! store does not hold inline are fetched from the application through a
//! deferred read/write exchange: the engine records the outstanding request
//! and the application answers with [`ServerEngine::respond_read`] or
//! [`ServerEngine::respond_write`].
//!
//! Per-connection state covers the negotiated MTU, the blob-read cache, the
//! prepare-write queue, the subscription (CCCD) table and at most one
//! indication awaiting confirmation. Subscription tables survive reconnects
//! of encrypted links only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use super::types::{
    AttPermissions, CccdFlags, CharacteristicProperties, CharacteristicRecord, DescriptorRecord,
    IncludeRecord, MtuRecord, QueuedWrite, ServiceRecord,
};
use crate::att::constants::*;
use crate::att::pdu::{
    AttPacket, AttPdu, AttributeData, AttributeGroupData, ErrorResponse, ExchangeMtuResponse,
    ExecuteWriteFlag, ExecuteWriteResponse, FindByTypeValueResponse, FindInformationResponse,
    HandleRange, HandlesInformation, HandleValueIndication, HandleValueNotification,
    PrepareWriteResponse, ReadBlobResponse, ReadByGroupTypeResponse, ReadByTypeResponse,
    ReadMultipleResponse, ReadResponse, WriteResponse,
};
use crate::att::AttErrorCode;
use crate::config::ServerConfig;
use crate::error::GattError;
use crate::transport::{BdAddr, ConnectionHandle, TransportSink};
use crate::uuid::Uuid;

/// Read-only view of the attribute database the server answers from.
///
/// Implementations return owned records; the engine never holds references
/// into the store across calls. `value: None` on a characteristic or
/// descriptor record marks an application-owned value that must be fetched
/// through the deferred read exchange.
pub trait AttributeStore: Send + Sync {
    fn services_in_range(&self, range: HandleRange, primary_only: bool) -> Vec<ServiceRecord>;
    fn services_by_uuid(&self, uuid: &Uuid, range: HandleRange) -> Vec<ServiceRecord>;
    fn service_at(&self, handle: u16) -> Option<ServiceRecord>;
    fn includes_in_range(&self, range: HandleRange) -> Vec<IncludeRecord>;
    fn characteristics_in_range(&self, range: HandleRange) -> Vec<CharacteristicRecord>;
    fn characteristic_declaration_at(&self, handle: u16) -> Option<CharacteristicRecord>;
    fn characteristic_by_value_handle(&self, handle: u16) -> Option<CharacteristicRecord>;
    fn descriptor_at(&self, handle: u16) -> Option<DescriptorRecord>;
    /// Every attribute in the range as (handle, type), ascending by handle.
    fn attributes_in_range(&self, range: HandleRange) -> Vec<(u16, Uuid)>;
    /// The characteristic a descriptor belongs to.
    fn characteristic_for_descriptor(&self, handle: u16) -> Option<CharacteristicRecord>;
}

/// Server-side application callbacks. Delivered from the dispatcher thread.
pub trait ServerEventHandler: Send + Sync {
    fn on_mtu_changed(&self, _conn: ConnectionHandle, _mtu: u16) {}

    /// The peer is reading an application-owned value; answer with
    /// [`ServerEngine::respond_read`].
    fn on_read_request(&self, _conn: ConnectionHandle, _handle: u16) {}

    /// The peer is reading several application-owned values at once; answer
    /// with [`ServerEngine::respond_read`] carrying the concatenation.
    fn on_read_multiple_request(&self, _conn: ConnectionHandle, _handles: &[u16]) {}

    /// The peer wrote a value; answer with [`ServerEngine::respond_write`].
    fn on_write_request(&self, _conn: ConnectionHandle, _handle: u16, _value: &[u8]) {}

    fn on_write_command(&self, _conn: ConnectionHandle, _handle: u16, _value: &[u8]) {}

    fn on_signed_write(
        &self,
        _conn: ConnectionHandle,
        _handle: u16,
        _value: &[u8],
        _signature: [u8; ATT_SIGNATURE_LEN],
    ) {
    }

    fn on_prepare_write(&self, _conn: ConnectionHandle, _handle: u16, _offset: u16, _part: &[u8]) {}

    /// The queued writes of a committed execute, in arrival order. Empty
    /// with `commit == false` when the peer cancelled.
    fn on_execute_write(&self, _conn: ConnectionHandle, _writes: Vec<QueuedWrite>, _commit: bool) {}

    fn on_subscription_changed(
        &self,
        _conn: ConnectionHandle,
        _value_handle: u16,
        _flags: CccdFlags,
    ) {
    }

    fn on_indication_result(
        &self,
        _conn: ConnectionHandle,
        _handle: u16,
        _result: Result<(), GattError>,
    ) {
    }
}

/// What an outstanding deferred read will be answered as.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingRead {
    Read { handle: u16 },
    ReadBlob { handle: u16, offset: u16 },
    ReadByType { handle: u16 },
    ReadMultiple { handles: Vec<u16> },
}

/// Reassembled value served out in blob fragments. Retained while the last
/// fragment filled the PDU, dropped once a short fragment ends the read.
#[derive(Debug, Clone)]
struct BlobCache {
    handle: u16,
    value: Vec<u8>,
}

struct ServerConnection {
    addr: BdAddr,
    encrypted: bool,
    mtu: MtuRecord,
    /// Negotiated MTU held back until the response send is acknowledged.
    pending_mtu: Option<u16>,
    blob: Option<BlobCache>,
    prepare_queue: Vec<QueuedWrite>,
    /// Subscriptions keyed by characteristic value handle.
    cccd: HashMap<u16, CccdFlags>,
    /// Value handle of the indication awaiting confirmation.
    pending_indication: Option<u16>,
    pending_read: Option<PendingRead>,
    pending_write: Option<u16>,
}

impl ServerConnection {
    fn new(addr: BdAddr, encrypted: bool) -> Self {
        ServerConnection {
            addr,
            encrypted,
            mtu: MtuRecord::new(ATT_DEFAULT_MTU),
            pending_mtu: None,
            blob: None,
            prepare_queue: Vec::new(),
            cccd: HashMap::new(),
            pending_indication: None,
            pending_read: None,
            pending_write: None,
        }
    }

    fn mtu(&self) -> usize {
        self.mtu.mtu as usize
    }
}

/// Handler callback resolved after the state lock is released.
enum Notify {
    MtuChanged(u16),
    ReadRequest(u16),
    ReadMultipleRequest(Vec<u16>),
    WriteRequest(u16, Vec<u8>),
    WriteCommand(u16, Vec<u8>),
    SignedWrite(u16, Vec<u8>, [u8; ATT_SIGNATURE_LEN]),
    PrepareWrite(u16, u16, Vec<u8>),
    ExecuteWrite(Vec<QueuedWrite>, bool),
    SubscriptionChanged(u16, CccdFlags),
    IndicationResult(u16, Result<(), GattError>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// The server transaction engine.
pub struct ServerEngine {
    transport: Arc<dyn TransportSink>,
    store: Arc<dyn AttributeStore>,
    handler: Arc<dyn ServerEventHandler>,
    config: ServerConfig,
    connections: Mutex<HashMap<ConnectionHandle, ServerConnection>>,
    /// Subscription tables of encrypted links, kept across reconnects.
    persisted_cccd: Mutex<HashMap<BdAddr, HashMap<u16, CccdFlags>>>,
}

impl ServerEngine {
    pub fn new(
        transport: Arc<dyn TransportSink>,
        store: Arc<dyn AttributeStore>,
        handler: Arc<dyn ServerEventHandler>,
        config: ServerConfig,
    ) -> Arc<Self> {
        Arc::new(ServerEngine {
            transport,
            store,
            handler,
            config,
            connections: Mutex::new(HashMap::new()),
            persisted_cccd: Mutex::new(HashMap::new()),
        })
    }

    // --- lifecycle hooks (wired by the stack) ---

    pub fn on_connected(&self, conn: ConnectionHandle, addr: BdAddr, encrypted: bool) {
        let mut state = ServerConnection::new(addr, encrypted);
        if encrypted {
            if let Some(saved) = lock(&self.persisted_cccd).get(&addr) {
                state.cccd = saved.clone();
            }
        }
        lock(&self.connections).insert(conn, state);
    }

    /// The link went down. Subscriptions of an encrypted link are kept for
    /// the next reconnect; everything else is discarded.
    pub fn on_disconnected(&self, conn: ConnectionHandle) {
        let state = lock(&self.connections).remove(&conn);
        let Some(state) = state else { return };
        {
            let mut persisted = lock(&self.persisted_cccd);
            if state.encrypted && !state.cccd.is_empty() {
                persisted.insert(state.addr, state.cccd.clone());
            } else {
                persisted.remove(&state.addr);
            }
        }
        if let Some(handle) = state.pending_indication {
            self.handler
                .on_indication_result(conn, handle, Err(GattError::NotConnected));
        }
    }

    /// Link security changed; a newly encrypted link restores any persisted
    /// subscription table for the peer.
    pub fn set_encryption(&self, conn: ConnectionHandle, encrypted: bool) {
        let mut connections = lock(&self.connections);
        let Some(state) = connections.get_mut(&conn) else { return };
        state.encrypted = encrypted;
        if encrypted && state.cccd.is_empty() {
            if let Some(saved) = lock(&self.persisted_cccd).get(&state.addr) {
                state.cccd = saved.clone();
            }
        }
    }

    // --- server-initiated value updates ---

    /// Sends a notification if the peer subscribed for one; a silent no-op
    /// otherwise. The value is truncated to MTU-3 bytes.
    pub fn notify(
        &self,
        conn: ConnectionHandle,
        value_handle: u16,
        value: &[u8],
    ) -> Result<(), GattError> {
        let mut connections = lock(&self.connections);
        let state = connections.get_mut(&conn).ok_or(GattError::NotConnected)?;
        let subscribed = state
            .cccd
            .get(&value_handle)
            .map(|flags| flags.contains(CccdFlags::NOTIFICATION))
            .unwrap_or(false);
        if !subscribed {
            return Ok(());
        }
        let cap = state.mtu() - ATT_WRITE_HEADER_LEN as usize;
        let pdu = HandleValueNotification {
            handle: value_handle,
            value: value[..value.len().min(cap)].to_vec(),
        }
        .serialize();
        self.transport.send_att(conn, &pdu)?;
        Ok(())
    }

    /// Sends an indication and records it until the peer confirms. At most
    /// one indication is outstanding per connection; the result arrives via
    /// [`ServerEventHandler::on_indication_result`].
    pub fn indicate(
        &self,
        conn: ConnectionHandle,
        value_handle: u16,
        value: &[u8],
    ) -> Result<(), GattError> {
        let mut connections = lock(&self.connections);
        let state = connections.get_mut(&conn).ok_or(GattError::NotConnected)?;
        let subscribed = state
            .cccd
            .get(&value_handle)
            .map(|flags| flags.contains(CccdFlags::INDICATION))
            .unwrap_or(false);
        if !subscribed {
            return Ok(());
        }
        if state.pending_indication.is_some() {
            return Err(GattError::IndicationPending);
        }
        let cap = state.mtu() - ATT_WRITE_HEADER_LEN as usize;
        let pdu = HandleValueIndication {
            handle: value_handle,
            value: value[..value.len().min(cap)].to_vec(),
        }
        .serialize();
        self.transport.send_att(conn, &pdu)?;
        state.pending_indication = Some(value_handle);
        Ok(())
    }

    // --- application responses to deferred requests ---

    /// Answers the outstanding deferred read with the value (or an error
    /// code the peer will see in an error response).
    pub fn respond_read(
        &self,
        conn: ConnectionHandle,
        result: Result<Vec<u8>, AttErrorCode>,
    ) -> Result<(), GattError> {
        let mut connections = lock(&self.connections);
        let state = connections.get_mut(&conn).ok_or(GattError::NotConnected)?;
        let pending = state
            .pending_read
            .take()
            .ok_or(GattError::InvalidParameter("no deferred read outstanding"))?;

        match (pending, result) {
            (PendingRead::Read { handle }, Ok(value)) => {
                self.send_read_value(state, conn, handle, value)
            }
            (PendingRead::ReadBlob { handle, offset }, Ok(value)) => {
                state.blob = Some(BlobCache { handle, value });
                self.send_blob_part(state, conn, handle, offset)
            }
            (PendingRead::ReadByType { handle }, Ok(value)) => {
                let cap = state.mtu() - 4;
                let item = AttributeData {
                    handle,
                    value: value[..value.len().min(cap)].to_vec(),
                };
                self.send(conn, ReadByTypeResponse { items: vec![item] }.serialize())
            }
            (PendingRead::ReadMultiple { .. }, Ok(values)) => {
                let cap = state.mtu() - ATT_READ_HEADER_LEN as usize;
                let values = values[..values.len().min(cap)].to_vec();
                self.send(conn, ReadMultipleResponse { values }.serialize())
            }
            (pending, Err(code)) => {
                let (opcode, handle) = match pending {
                    PendingRead::Read { handle } => (ATT_READ_REQ, handle),
                    PendingRead::ReadBlob { handle, .. } => (ATT_READ_BLOB_REQ, handle),
                    PendingRead::ReadByType { handle } => (ATT_READ_BY_TYPE_REQ, handle),
                    PendingRead::ReadMultiple { handles } => (
                        ATT_READ_MULTIPLE_REQ,
                        handles.first().copied().unwrap_or_default(),
                    ),
                };
                self.send_error(conn, opcode, handle, code)
            }
        }
    }

    /// Answers the outstanding deferred write.
    pub fn respond_write(
        &self,
        conn: ConnectionHandle,
        result: Result<(), AttErrorCode>,
    ) -> Result<(), GattError> {
        let mut connections = lock(&self.connections);
        let state = connections.get_mut(&conn).ok_or(GattError::NotConnected)?;
        let handle = state
            .pending_write
            .take()
            .ok_or(GattError::InvalidParameter("no deferred write outstanding"))?;
        match result {
            Ok(()) => self.send(conn, WriteResponse.serialize()),
            Err(code) => self.send_error(conn, ATT_WRITE_REQ, handle, code),
        }
    }

    // --- transport event entry points ---

    /// MTU responses take effect only once the transport acknowledges the
    /// send; a failed indication send resolves its pending record.
    pub fn handle_send_confirm(&self, conn: ConnectionHandle, opcode: u8, ok: bool) {
        let mut notifies = Vec::new();
        {
            let mut connections = lock(&self.connections);
            let Some(state) = connections.get_mut(&conn) else { return };
            match opcode {
                ATT_EXCHANGE_MTU_RSP => {
                    if let Some(mtu) = state.pending_mtu.take() {
                        if ok {
                            state.mtu = MtuRecord {
                                exchanged: true,
                                mtu,
                            };
                            notifies.push(Notify::MtuChanged(mtu));
                        }
                    }
                }
                ATT_HANDLE_VALUE_IND if !ok => {
                    if let Some(handle) = state.pending_indication.take() {
                        notifies.push(Notify::IndicationResult(
                            handle,
                            Err(GattError::Transport(
                                crate::transport::TransportError::Rejected("send failed"),
                            )),
                        ));
                    }
                }
                _ => {}
            }
        }
        self.run(conn, notifies);
    }

    /// Indication confirmation never arrived inside the transaction window.
    pub fn handle_timeout(&self, conn: ConnectionHandle, opcode: u8) {
        if opcode != ATT_HANDLE_VALUE_IND {
            return;
        }
        let mut notifies = Vec::new();
        {
            let mut connections = lock(&self.connections);
            let Some(state) = connections.get_mut(&conn) else { return };
            if let Some(handle) = state.pending_indication.take() {
                notifies.push(Notify::IndicationResult(handle, Err(GattError::Timeout)));
            }
        }
        self.run(conn, notifies);
    }

    /// One decoded client-originated PDU for this link.
    pub fn handle_att(&self, conn: ConnectionHandle, pdu: AttPdu) {
        let mut notifies = Vec::new();
        {
            let mut connections = lock(&self.connections);
            let Some(state) = connections.get_mut(&conn) else {
                debug!("request on unknown link 0x{:04X}", conn);
                return;
            };
            let sent = match pdu {
                AttPdu::ExchangeMtuRequest(req) => self.on_exchange_mtu(state, conn, req.client_mtu),
                AttPdu::FindInformationRequest(req) => self.on_find_information(state, conn, req.range),
                AttPdu::FindByTypeValueRequest(req) => {
                    self.on_find_by_type_value(state, conn, req.range, req.attribute_type, &req.value)
                }
                AttPdu::ReadByTypeRequest(req) => {
                    self.on_read_by_type(state, conn, req.range, req.attribute_type, &mut notifies)
                }
                AttPdu::ReadByGroupTypeRequest(req) => {
                    self.on_read_by_group_type(state, conn, req.range, req.group_type)
                }
                AttPdu::ReadRequest(req) => self.on_read(state, conn, req.handle, &mut notifies),
                AttPdu::ReadBlobRequest(req) => {
                    self.on_read_blob(state, conn, req.handle, req.offset, &mut notifies)
                }
                AttPdu::ReadMultipleRequest(req) => {
                    self.on_read_multiple(state, conn, req.handles, &mut notifies)
                }
                AttPdu::WriteRequest(req) => {
                    self.on_write(state, conn, req.handle, req.value, &mut notifies)
                }
                AttPdu::WriteCommand(cmd) => {
                    self.on_write_command(state, cmd.handle, cmd.value, &mut notifies);
                    Ok(())
                }
                AttPdu::SignedWriteCommand(cmd) => {
                    self.on_signed_write(state, cmd.handle, cmd.value, cmd.signature, &mut notifies);
                    Ok(())
                }
                AttPdu::PrepareWriteRequest(req) => {
                    self.on_prepare_write(state, conn, req.handle, req.offset, req.part, &mut notifies)
                }
                AttPdu::ExecuteWriteRequest(req) => {
                    self.on_execute_write(state, conn, req.flag, &mut notifies)
                }
                AttPdu::HandleValueConfirmation(_) => {
                    if let Some(handle) = state.pending_indication.take() {
                        notifies.push(Notify::IndicationResult(handle, Ok(())));
                    }
                    Ok(())
                }
                other => {
                    debug!("server engine ignoring opcode 0x{:02X}", other.opcode());
                    Ok(())
                }
            };
            if let Err(err) = sent {
                warn!("response send failed on 0x{:04X}: {}", conn, err);
            }
        }
        self.run(conn, notifies);
    }

    // --- request handlers ---

    fn on_exchange_mtu(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        client_mtu: u16,
    ) -> Result<(), GattError> {
        if client_mtu < ATT_DEFAULT_MTU {
            return self.send_error(
                conn,
                ATT_EXCHANGE_MTU_REQ,
                0,
                AttErrorCode::RequestNotSupported,
            );
        }
        let server_mtu = self.config.max_mtu;
        state.pending_mtu = Some(client_mtu.min(server_mtu));
        self.send(conn, ExchangeMtuResponse { server_mtu }.serialize())
    }

    fn on_find_information(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        range: HandleRange,
    ) -> Result<(), GattError> {
        if range.validate().is_err() {
            return self.send_error(conn, ATT_FIND_INFO_REQ, range.start, AttErrorCode::InvalidHandle);
        }
        let attributes = self.store.attributes_in_range(range);
        let Some(first_width) = attributes.first().map(|(_, uuid)| uuid.wire_len()) else {
            return self.send_error(
                conn,
                ATT_FIND_INFO_REQ,
                range.start,
                AttErrorCode::AttributeNotFound,
            );
        };
        let mut pairs = Vec::new();
        let mut used = 2usize;
        for (handle, uuid) in attributes {
            if uuid.wire_len() != first_width || used + 2 + first_width > state.mtu() {
                break;
            }
            pairs.push((handle, uuid));
            used += 2 + first_width;
        }
        self.send(conn, FindInformationResponse { pairs }.serialize())
    }

    fn on_find_by_type_value(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        range: HandleRange,
        attribute_type: u16,
        value: &[u8],
    ) -> Result<(), GattError> {
        if range.validate().is_err() {
            return self.send_error(
                conn,
                ATT_FIND_BY_TYPE_VALUE_REQ,
                range.start,
                AttErrorCode::InvalidHandle,
            );
        }
        let wanted = Uuid::try_from_slice_le(value);
        let services: Vec<ServiceRecord> = match (attribute_type, wanted) {
            (PRIMARY_SERVICE_UUID, Some(uuid)) => self
                .store
                .services_by_uuid(&uuid, range)
                .into_iter()
                .filter(|service| service.primary)
                .collect(),
            _ => Vec::new(),
        };
        if services.is_empty() {
            return self.send_error(
                conn,
                ATT_FIND_BY_TYPE_VALUE_REQ,
                range.start,
                AttErrorCode::AttributeNotFound,
            );
        }
        let max = (state.mtu() - 1) / 4;
        let handles = services
            .into_iter()
            .take(max)
            .map(|service| HandlesInformation {
                found_handle: service.handle,
                group_end_handle: service.end_handle,
            })
            .collect();
        self.send(conn, FindByTypeValueResponse { handles }.serialize())
    }

    fn on_read_by_type(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        range: HandleRange,
        attribute_type: Uuid,
        notifies: &mut Vec<Notify>,
    ) -> Result<(), GattError> {
        if range.validate().is_err() {
            return self.send_error(
                conn,
                ATT_READ_BY_TYPE_REQ,
                range.start,
                AttErrorCode::InvalidHandle,
            );
        }

        if attribute_type == INCLUDE_UUID {
            let includes = self.store.includes_in_range(range);
            return self.page_elements(
                state,
                conn,
                range,
                includes.into_iter().map(include_element).collect(),
            );
        }
        if attribute_type == CHARACTERISTIC_UUID {
            let characteristics = self.store.characteristics_in_range(range);
            return self.page_elements(
                state,
                conn,
                range,
                characteristics
                    .into_iter()
                    .map(|record| AttributeData {
                        handle: record.declaration_handle,
                        value: record.declaration_value(),
                    })
                    .collect(),
            );
        }

        // Read-by-type of an arbitrary UUID reads the first matching
        // characteristic value in the range.
        let found = self
            .store
            .characteristics_in_range(range)
            .into_iter()
            .find(|record| record.uuid == attribute_type);
        let Some(record) = found else {
            return self.send_error(
                conn,
                ATT_READ_BY_TYPE_REQ,
                range.start,
                AttErrorCode::AttributeNotFound,
            );
        };
        if let Err(code) = check_read(record.permissions, state.encrypted) {
            return self.send_error(conn, ATT_READ_BY_TYPE_REQ, record.value_handle, code);
        }
        match record.value {
            Some(value) => {
                let cap = state.mtu() - 4;
                let item = AttributeData {
                    handle: record.value_handle,
                    value: value[..value.len().min(cap)].to_vec(),
                };
                self.send(conn, ReadByTypeResponse { items: vec![item] }.serialize())
            }
            None => {
                state.pending_read = Some(PendingRead::ReadByType {
                    handle: record.value_handle,
                });
                notifies.push(Notify::ReadRequest(record.value_handle));
                Ok(())
            }
        }
    }

    fn page_elements(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        range: HandleRange,
        elements: Vec<AttributeData>,
    ) -> Result<(), GattError> {
        let Some(first_len) = elements.first().map(|item| item.value.len()) else {
            return self.send_error(
                conn,
                ATT_READ_BY_TYPE_REQ,
                range.start,
                AttErrorCode::AttributeNotFound,
            );
        };
        let mut items = Vec::new();
        let mut used = 2usize;
        for item in elements {
            if item.value.len() != first_len || used + 2 + first_len > state.mtu() {
                break;
            }
            used += 2 + first_len;
            items.push(item);
        }
        self.send(conn, ReadByTypeResponse { items }.serialize())
    }

    fn on_read_by_group_type(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        range: HandleRange,
        group_type: Uuid,
    ) -> Result<(), GattError> {
        if range.validate().is_err() {
            return self.send_error(
                conn,
                ATT_READ_BY_GROUP_TYPE_REQ,
                range.start,
                AttErrorCode::InvalidHandle,
            );
        }
        if group_type != Uuid::from_u16(PRIMARY_SERVICE_UUID) {
            return self.send_error(
                conn,
                ATT_READ_BY_GROUP_TYPE_REQ,
                range.start,
                AttErrorCode::UnsupportedGroupType,
            );
        }
        let services = self.store.services_in_range(range, true);
        let Some(first_width) = services.first().map(|service| service.uuid.wire_len()) else {
            return self.send_error(
                conn,
                ATT_READ_BY_GROUP_TYPE_REQ,
                range.start,
                AttErrorCode::AttributeNotFound,
            );
        };
        let mut items = Vec::new();
        let mut used = 2usize;
        for service in services {
            if service.uuid.wire_len() != first_width || used + 4 + first_width > state.mtu() {
                break;
            }
            used += 4 + first_width;
            items.push(AttributeGroupData {
                handle: service.handle,
                group_end_handle: service.end_handle,
                value: service.uuid.to_wire(),
            });
        }
        self.send(conn, ReadByGroupTypeResponse { items }.serialize())
    }

    fn on_read(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        handle: u16,
        notifies: &mut Vec<Notify>,
    ) -> Result<(), GattError> {
        match self.readable_value(state, handle) {
            ReadLookup::Value(value) => self.send_read_value(state, conn, handle, value),
            ReadLookup::Deferred => {
                state.pending_read = Some(PendingRead::Read { handle });
                notifies.push(Notify::ReadRequest(handle));
                Ok(())
            }
            ReadLookup::Error(code) => self.send_error(conn, ATT_READ_REQ, handle, code),
        }
    }

    fn on_read_blob(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        handle: u16,
        offset: u16,
        notifies: &mut Vec<Notify>,
    ) -> Result<(), GattError> {
        let cached = state
            .blob
            .as_ref()
            .map(|blob| blob.handle == handle)
            .unwrap_or(false);
        if cached {
            return self.send_blob_part(state, conn, handle, offset);
        }
        if offset != 0 {
            // A blob read that does not continue a cached value must start
            // at the beginning.
            return self.send_error(conn, ATT_READ_BLOB_REQ, handle, AttErrorCode::InvalidOffset);
        }
        match self.readable_value(state, handle) {
            ReadLookup::Value(value) => {
                state.blob = Some(BlobCache { handle, value });
                self.send_blob_part(state, conn, handle, 0)
            }
            ReadLookup::Deferred => {
                state.pending_read = Some(PendingRead::ReadBlob { handle, offset });
                notifies.push(Notify::ReadRequest(handle));
                Ok(())
            }
            ReadLookup::Error(code) => self.send_error(conn, ATT_READ_BLOB_REQ, handle, code),
        }
    }

    fn on_read_multiple(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        handles: Vec<u16>,
        notifies: &mut Vec<Notify>,
    ) -> Result<(), GattError> {
        let mut values = Vec::new();
        for &handle in &handles {
            match self.readable_value(state, handle) {
                ReadLookup::Value(value) => values.extend_from_slice(&value),
                ReadLookup::Deferred => {
                    state.pending_read = Some(PendingRead::ReadMultiple {
                        handles: handles.clone(),
                    });
                    notifies.push(Notify::ReadMultipleRequest(handles.clone()));
                    return Ok(());
                }
                ReadLookup::Error(code) => {
                    return self.send_error(conn, ATT_READ_MULTIPLE_REQ, handle, code)
                }
            }
        }
        let cap = state.mtu() - ATT_READ_HEADER_LEN as usize;
        values.truncate(cap);
        self.send(conn, ReadMultipleResponse { values }.serialize())
    }

    fn on_write(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        handle: u16,
        value: Vec<u8>,
        notifies: &mut Vec<Notify>,
    ) -> Result<(), GattError> {
        if let Some(descriptor) = self.store.descriptor_at(handle) {
            if descriptor.uuid == CLIENT_CHAR_CONFIG_UUID {
                return self.on_cccd_write(state, conn, handle, &value, notifies);
            }
            if let Err(code) = check_write(descriptor.permissions, state.encrypted) {
                return self.send_error(conn, ATT_WRITE_REQ, handle, code);
            }
            state.pending_write = Some(handle);
            notifies.push(Notify::WriteRequest(handle, value));
            return Ok(());
        }
        if let Some(record) = self.store.characteristic_by_value_handle(handle) {
            if let Err(code) = check_write(record.permissions, state.encrypted) {
                return self.send_error(conn, ATT_WRITE_REQ, handle, code);
            }
            state.pending_write = Some(handle);
            notifies.push(Notify::WriteRequest(handle, value));
            return Ok(());
        }
        let code = if self.store.service_at(handle).is_some()
            || self.store.characteristic_declaration_at(handle).is_some()
        {
            AttErrorCode::WriteNotPermitted
        } else {
            AttErrorCode::InvalidHandle
        };
        self.send_error(conn, ATT_WRITE_REQ, handle, code)
    }

    /// CCCD writes are answered by the engine: the flags are validated
    /// against the owning characteristic's properties and stored in the
    /// per-connection table.
    fn on_cccd_write(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        handle: u16,
        value: &[u8],
        notifies: &mut Vec<Notify>,
    ) -> Result<(), GattError> {
        if value.len() != 2 {
            return self.send_error(
                conn,
                ATT_WRITE_REQ,
                handle,
                AttErrorCode::InvalidAttributeValueLength,
            );
        }
        let Some(parent) = self.store.characteristic_for_descriptor(handle) else {
            return self.send_error(conn, ATT_WRITE_REQ, handle, AttErrorCode::InvalidHandle);
        };
        let raw = u16::from_le_bytes([value[0], value[1]]);
        let Some(flags) = CccdFlags::from_bits(raw) else {
            return self.send_error(conn, ATT_WRITE_REQ, handle, AttErrorCode::ValueNotAllowed);
        };
        let allowed = (!flags.contains(CccdFlags::NOTIFICATION)
            || parent.properties.contains(CharacteristicProperties::NOTIFY))
            && (!flags.contains(CccdFlags::INDICATION)
                || parent.properties.contains(CharacteristicProperties::INDICATE));
        if !allowed {
            return self.send_error(conn, ATT_WRITE_REQ, handle, AttErrorCode::ValueNotAllowed);
        }
        let key = parent.value_handle;
        if flags.is_empty() {
            state.cccd.remove(&key);
        } else {
            if !state.cccd.contains_key(&key) && state.cccd.len() >= self.config.cccd_capacity {
                return self.send_error(
                    conn,
                    ATT_WRITE_REQ,
                    handle,
                    AttErrorCode::InsufficientResources,
                );
            }
            state.cccd.insert(key, flags);
        }
        notifies.push(Notify::SubscriptionChanged(key, flags));
        self.send(conn, WriteResponse.serialize())
    }

    fn on_write_command(
        &self,
        state: &mut ServerConnection,
        handle: u16,
        value: Vec<u8>,
        notifies: &mut Vec<Notify>,
    ) {
        // Commands carry no response; failures are dropped silently.
        let Some(record) = self.store.characteristic_by_value_handle(handle) else {
            return;
        };
        if !record
            .properties
            .contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
            || check_write(record.permissions, state.encrypted).is_err()
        {
            return;
        }
        notifies.push(Notify::WriteCommand(handle, value));
    }

    fn on_signed_write(
        &self,
        state: &mut ServerConnection,
        handle: u16,
        value: Vec<u8>,
        signature: [u8; ATT_SIGNATURE_LEN],
        notifies: &mut Vec<Notify>,
    ) {
        let Some(record) = self.store.characteristic_by_value_handle(handle) else {
            return;
        };
        if !record
            .properties
            .contains(CharacteristicProperties::AUTHENTICATED_SIGNED_WRITES)
            || check_write(record.permissions, state.encrypted).is_err()
        {
            return;
        }
        // Signature verification belongs to the security layer; the raw
        // trailer is handed through.
        notifies.push(Notify::SignedWrite(handle, value, signature));
    }

    fn on_prepare_write(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        handle: u16,
        offset: u16,
        part: Vec<u8>,
        notifies: &mut Vec<Notify>,
    ) -> Result<(), GattError> {
        let permissions = self
            .store
            .characteristic_by_value_handle(handle)
            .map(|record| record.permissions)
            .or_else(|| self.store.descriptor_at(handle).map(|d| d.permissions));
        let Some(permissions) = permissions else {
            return self.send_error(conn, ATT_PREPARE_WRITE_REQ, handle, AttErrorCode::InvalidHandle);
        };
        if let Err(code) = check_write(permissions, state.encrypted) {
            return self.send_error(conn, ATT_PREPARE_WRITE_REQ, handle, code);
        }
        if state.prepare_queue.len() >= self.config.prepare_queue_limit {
            return self.send_error(
                conn,
                ATT_PREPARE_WRITE_REQ,
                handle,
                AttErrorCode::PrepareQueueFull,
            );
        }
        state.prepare_queue.push(QueuedWrite {
            handle,
            offset,
            part: part.clone(),
        });
        notifies.push(Notify::PrepareWrite(handle, offset, part.clone()));
        self.send(
            conn,
            PrepareWriteResponse {
                handle,
                offset,
                part,
            }
            .serialize(),
        )
    }

    fn on_execute_write(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        flag: ExecuteWriteFlag,
        notifies: &mut Vec<Notify>,
    ) -> Result<(), GattError> {
        let writes = std::mem::take(&mut state.prepare_queue);
        match flag {
            ExecuteWriteFlag::Commit => notifies.push(Notify::ExecuteWrite(writes, true)),
            ExecuteWriteFlag::Cancel => notifies.push(Notify::ExecuteWrite(Vec::new(), false)),
        }
        self.send(conn, ExecuteWriteResponse.serialize())
    }

    // --- helpers ---

    /// Resolves the readable value at a handle, applying the permission
    /// rules: declarations are always readable, values and descriptors are
    /// gated by their permission bits.
    fn readable_value(&self, state: &ServerConnection, handle: u16) -> ReadLookup {
        if let Some(service) = self.store.service_at(handle) {
            return ReadLookup::Value(service.uuid.to_wire());
        }
        if let Some(record) = self.store.characteristic_declaration_at(handle) {
            return ReadLookup::Value(record.declaration_value());
        }
        if let Some(record) = self.store.characteristic_by_value_handle(handle) {
            return match check_read(record.permissions, state.encrypted) {
                Err(code) => ReadLookup::Error(code),
                Ok(()) => match record.value {
                    Some(value) => ReadLookup::Value(value),
                    None => ReadLookup::Deferred,
                },
            };
        }
        if let Some(descriptor) = self.store.descriptor_at(handle) {
            if descriptor.uuid == CLIENT_CHAR_CONFIG_UUID {
                let flags = self
                    .store
                    .characteristic_for_descriptor(handle)
                    .and_then(|parent| state.cccd.get(&parent.value_handle).copied())
                    .unwrap_or(CccdFlags::empty());
                return ReadLookup::Value(flags.bits().to_le_bytes().to_vec());
            }
            return match check_read(descriptor.permissions, state.encrypted) {
                Err(code) => ReadLookup::Error(code),
                Ok(()) => match descriptor.value {
                    Some(value) => ReadLookup::Value(value),
                    None => ReadLookup::Deferred,
                },
            };
        }
        ReadLookup::Error(AttErrorCode::InvalidHandle)
    }

    /// Sends a read response; values longer than MTU-1 leave a blob cache
    /// behind for the follow-up blob reads.
    fn send_read_value(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        handle: u16,
        value: Vec<u8>,
    ) -> Result<(), GattError> {
        let cap = state.mtu() - ATT_READ_HEADER_LEN as usize;
        if value.len() > cap {
            let fragment = value[..cap].to_vec();
            state.blob = Some(BlobCache { handle, value });
            self.send(conn, ReadResponse { value: fragment }.serialize())
        } else {
            self.send(conn, ReadResponse { value }.serialize())
        }
    }

    fn send_blob_part(
        &self,
        state: &mut ServerConnection,
        conn: ConnectionHandle,
        handle: u16,
        offset: u16,
    ) -> Result<(), GattError> {
        let cap = state.mtu() - ATT_READ_HEADER_LEN as usize;
        let Some(blob) = state.blob.as_ref() else {
            return self.send_error(conn, ATT_READ_BLOB_REQ, handle, AttErrorCode::InvalidOffset);
        };
        let offset = offset as usize;
        if offset > blob.value.len() {
            return self.send_error(conn, ATT_READ_BLOB_REQ, handle, AttErrorCode::InvalidOffset);
        }
        let end = (offset + cap).min(blob.value.len());
        let part = blob.value[offset..end].to_vec();
        // A full fragment keeps the cache alive for the next blob read.
        if part.len() < cap {
            state.blob = None;
        }
        self.send(conn, ReadBlobResponse { part }.serialize())
    }

    fn send(&self, conn: ConnectionHandle, pdu: Vec<u8>) -> Result<(), GattError> {
        self.transport.send_att(conn, &pdu)?;
        Ok(())
    }

    fn send_error(
        &self,
        conn: ConnectionHandle,
        request_opcode: u8,
        handle: u16,
        error_code: AttErrorCode,
    ) -> Result<(), GattError> {
        let pdu = ErrorResponse {
            request_opcode,
            handle,
            error_code,
        }
        .serialize();
        self.transport.send_att(conn, &pdu)?;
        Ok(())
    }

    fn run(&self, conn: ConnectionHandle, notifies: Vec<Notify>) {
        for notify in notifies {
            match notify {
                Notify::MtuChanged(mtu) => self.handler.on_mtu_changed(conn, mtu),
                Notify::ReadRequest(handle) => self.handler.on_read_request(conn, handle),
                Notify::ReadMultipleRequest(handles) => {
                    self.handler.on_read_multiple_request(conn, &handles)
                }
                Notify::WriteRequest(handle, value) => {
                    self.handler.on_write_request(conn, handle, &value)
                }
                Notify::WriteCommand(handle, value) => {
                    self.handler.on_write_command(conn, handle, &value)
                }
                Notify::SignedWrite(handle, value, signature) => {
                    self.handler.on_signed_write(conn, handle, &value, signature)
                }
                Notify::PrepareWrite(handle, offset, part) => {
                    self.handler.on_prepare_write(conn, handle, offset, &part)
                }
                Notify::ExecuteWrite(writes, commit) => {
                    self.handler.on_execute_write(conn, writes, commit)
                }
                Notify::SubscriptionChanged(value_handle, flags) => {
                    self.handler.on_subscription_changed(conn, value_handle, flags)
                }
                Notify::IndicationResult(handle, result) => {
                    self.handler.on_indication_result(conn, handle, result)
                }
            }
        }
    }
}

enum ReadLookup {
    Value(Vec<u8>),
    Deferred,
    Error(AttErrorCode),
}

fn check_read(permissions: AttPermissions, encrypted: bool) -> Result<(), AttErrorCode> {
    if !permissions.can_read() {
        return Err(AttErrorCode::ReadNotPermitted);
    }
    if permissions.contains(AttPermissions::READ_ENCRYPTED) && !encrypted {
        return Err(AttErrorCode::InsufficientEncryption);
    }
    if permissions.contains(AttPermissions::READ_AUTHENTICATED) && !encrypted {
        return Err(AttErrorCode::InsufficientAuthentication);
    }
    Ok(())
}

fn check_write(permissions: AttPermissions, encrypted: bool) -> Result<(), AttErrorCode> {
    if !permissions.can_write() {
        return Err(AttErrorCode::WriteNotPermitted);
    }
    if permissions.contains(AttPermissions::WRITE_ENCRYPTED) && !encrypted {
        return Err(AttErrorCode::InsufficientEncryption);
    }
    if permissions.contains(AttPermissions::WRITE_AUTHENTICATED) && !encrypted {
        return Err(AttErrorCode::InsufficientAuthentication);
    }
    Ok(())
}

fn include_element(record: IncludeRecord) -> AttributeData {
    let mut value = Vec::with_capacity(6);
    value.extend_from_slice(&record.included_service_handle.to_le_bytes());
    value.extend_from_slice(&record.end_group_handle.to_le_bytes());
    if let Some(uuid) = record.uuid {
        if uuid.wire_len() == 2 {
            value.extend_from_slice(&uuid.to_wire());
        }
    }
    AttributeData {
        handle: record.handle,
        value,
    }
}

/// A flat, sorted attribute database backed by record vectors. Suitable for
/// servers whose layout is fixed at startup; handles are assigned by the
/// caller and must be ascending within each vector.
#[derive(Default)]
pub struct StaticStore {
    pub services: Vec<ServiceRecord>,
    pub includes: Vec<IncludeRecord>,
    pub characteristics: Vec<CharacteristicRecord>,
    pub descriptors: Vec<DescriptorRecord>,
}

impl AttributeStore for StaticStore {
    fn services_in_range(&self, range: HandleRange, primary_only: bool) -> Vec<ServiceRecord> {
        self.services
            .iter()
            .filter(|service| range.contains(service.handle))
            .filter(|service| !primary_only || service.primary)
            .cloned()
            .collect()
    }

    fn services_by_uuid(&self, uuid: &Uuid, range: HandleRange) -> Vec<ServiceRecord> {
        self.services
            .iter()
            .filter(|service| range.contains(service.handle) && service.uuid == *uuid)
            .cloned()
            .collect()
    }

    fn service_at(&self, handle: u16) -> Option<ServiceRecord> {
        self.services
            .iter()
            .find(|service| service.handle == handle)
            .cloned()
    }

    fn includes_in_range(&self, range: HandleRange) -> Vec<IncludeRecord> {
        self.includes
            .iter()
            .filter(|include| range.contains(include.handle))
            .cloned()
            .collect()
    }

    fn characteristics_in_range(&self, range: HandleRange) -> Vec<CharacteristicRecord> {
        self.characteristics
            .iter()
            .filter(|record| range.contains(record.declaration_handle))
            .cloned()
            .collect()
    }

    fn characteristic_declaration_at(&self, handle: u16) -> Option<CharacteristicRecord> {
        self.characteristics
            .iter()
            .find(|record| record.declaration_handle == handle)
            .cloned()
    }

    fn characteristic_by_value_handle(&self, handle: u16) -> Option<CharacteristicRecord> {
        self.characteristics
            .iter()
            .find(|record| record.value_handle == handle)
            .cloned()
    }

    fn descriptor_at(&self, handle: u16) -> Option<DescriptorRecord> {
        self.descriptors
            .iter()
            .find(|descriptor| descriptor.handle == handle)
            .cloned()
    }

    fn attributes_in_range(&self, range: HandleRange) -> Vec<(u16, Uuid)> {
        let mut attributes: Vec<(u16, Uuid)> = Vec::new();
        for service in &self.services {
            let uuid = if service.primary {
                PRIMARY_SERVICE_UUID
            } else {
                SECONDARY_SERVICE_UUID
            };
            attributes.push((service.handle, Uuid::from_u16(uuid)));
        }
        for include in &self.includes {
            attributes.push((include.handle, Uuid::from_u16(INCLUDE_UUID)));
        }
        for record in &self.characteristics {
            attributes.push((record.declaration_handle, Uuid::from_u16(CHARACTERISTIC_UUID)));
            attributes.push((record.value_handle, record.uuid));
        }
        for descriptor in &self.descriptors {
            attributes.push((descriptor.handle, descriptor.uuid));
        }
        attributes.retain(|(handle, _)| range.contains(*handle));
        attributes.sort_by_key(|(handle, _)| *handle);
        attributes
    }

    fn characteristic_for_descriptor(&self, handle: u16) -> Option<CharacteristicRecord> {
        self.characteristics
            .iter()
            .filter(|record| record.declaration_handle < handle)
            .max_by_key(|record| record.declaration_handle)
            .cloned()
    }
}
