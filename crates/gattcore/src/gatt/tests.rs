//! Engine tests against a mock link: the transport sink records every PDU,
//! and inbound traffic is fed in as decoded events.

use std::sync::{Arc, Mutex};

use crate::att::constants::*;
use crate::att::pdu::*;
use crate::att::AttErrorCode;
use crate::config::ServerConfig;
use crate::connection::manager::LinkInfoSource;
use crate::error::GattError;
use crate::gatt::client::{ClientEngine, ClientEventHandler};
use crate::gatt::server::{ServerEngine, ServerEventHandler, StaticStore};
use crate::gatt::types::*;
use crate::transport::{
    AddressType, BdAddr, ConnectionHandle, ConnectionParameters, Transport, TransportError,
    TransportSink,
};
use crate::uuid::Uuid;

const CONN: ConnectionHandle = 0x0040;
const PEER: BdAddr = BdAddr {
    bytes: [0x66, 0x55, 0x44, 0x33, 0x22, 0x11],
};

#[derive(Default)]
struct MockLink {
    sent: Mutex<Vec<(ConnectionHandle, Vec<u8>)>>,
}

impl MockLink {
    fn sent_pdus(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(_, pdu)| pdu.clone())
            .collect()
    }

    fn last_sent(&self) -> Option<Vec<u8>> {
        self.sent.lock().unwrap().last().map(|(_, pdu)| pdu.clone())
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl TransportSink for MockLink {
    fn connect(
        &self,
        _addr: BdAddr,
        _addr_type: AddressType,
        _transport: Transport,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    fn connect_cancel(&self, _addr: BdAddr) -> Result<(), TransportError> {
        Ok(())
    }

    fn disconnect(&self, _handle: ConnectionHandle) -> Result<(), TransportError> {
        Ok(())
    }

    fn send_att(&self, handle: ConnectionHandle, pdu: &[u8]) -> Result<(), TransportError> {
        self.sent.lock().unwrap().push((handle, pdu.to_vec()));
        Ok(())
    }

    fn update_connection_parameters(
        &self,
        _handle: ConnectionHandle,
        _params: &ConnectionParameters,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

struct FixedLinks(Transport);

impl LinkInfoSource for FixedLinks {
    fn link_transport(&self, _handle: ConnectionHandle) -> Option<Transport> {
        Some(self.0)
    }
}

// --- client harness ---

#[derive(Default)]
struct ClientEvents {
    mtu: Mutex<Vec<Result<u16, GattError>>>,
    services: Mutex<Vec<Result<Vec<ServiceEntry>, GattError>>>,
    characteristics: Mutex<Vec<Result<Vec<CharacteristicEntry>, GattError>>>,
    descriptors: Mutex<Vec<Result<Vec<DescriptorEntry>, GattError>>>,
    reads: Mutex<Vec<(u16, Result<Vec<u8>, GattError>)>>,
    writes: Mutex<Vec<(u16, Result<(), GattError>)>>,
    echoes: Mutex<Vec<(u16, Vec<u8>)>>,
    executes: Mutex<Vec<Result<(), GattError>>>,
    notifications: Mutex<Vec<(u16, Vec<u8>)>>,
    indications: Mutex<Vec<(u16, Vec<u8>)>>,
}

impl ClientEventHandler for ClientEvents {
    fn on_mtu_exchanged(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        result: Result<u16, GattError>,
    ) {
        self.mtu.lock().unwrap().push(result);
    }

    fn on_services_discovered(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        result: Result<Vec<ServiceEntry>, GattError>,
    ) {
        self.services.lock().unwrap().push(result);
    }

    fn on_characteristics_discovered(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        result: Result<Vec<CharacteristicEntry>, GattError>,
    ) {
        self.characteristics.lock().unwrap().push(result);
    }

    fn on_descriptors_discovered(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        result: Result<Vec<DescriptorEntry>, GattError>,
    ) {
        self.descriptors.lock().unwrap().push(result);
    }

    fn on_read(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        handle: u16,
        result: Result<Vec<u8>, GattError>,
    ) {
        self.reads.lock().unwrap().push((handle, result));
    }

    fn on_write(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        handle: u16,
        result: Result<(), GattError>,
    ) {
        self.writes.lock().unwrap().push((handle, result));
    }

    fn on_reliable_write_echo(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        handle: u16,
        echoed: Vec<u8>,
    ) {
        self.echoes.lock().unwrap().push((handle, echoed));
    }

    fn on_execute_write(
        &self,
        _conn: ConnectionHandle,
        _request_id: RequestId,
        result: Result<(), GattError>,
    ) {
        self.executes.lock().unwrap().push(result);
    }

    fn on_notification(&self, _conn: ConnectionHandle, handle: u16, value: Vec<u8>) {
        self.notifications.lock().unwrap().push((handle, value));
    }

    fn on_indication(&self, _conn: ConnectionHandle, handle: u16, value: Vec<u8>) {
        self.indications.lock().unwrap().push((handle, value));
    }
}

fn client_harness(
    transport_kind: Transport,
) -> (Arc<ClientEngine>, Arc<MockLink>, Arc<ClientEvents>) {
    let link = Arc::new(MockLink::default());
    let events = Arc::new(ClientEvents::default());
    let engine = ClientEngine::new(
        link.clone(),
        Arc::new(FixedLinks(transport_kind)),
        events.clone(),
    );
    engine.on_connected(CONN, transport_kind);
    (engine, link, events)
}

/// Acknowledges the send of the most recent PDU.
fn confirm(engine: &ClientEngine, link: &MockLink) {
    let pdu = link.last_sent().expect("nothing sent");
    engine.handle_send_confirm(CONN, pdu[0], true);
}

// --- client tests ---

#[test]
fn mtu_exchange_negotiates_and_caches() {
    let (client, link, events) = client_harness(Transport::Le);

    client.exchange_mtu(CONN, 1, 185).unwrap();
    confirm(&client, &link);
    client.handle_att(
        CONN,
        AttPdu::ExchangeMtuResponse(ExchangeMtuResponse { server_mtu: 200 }),
    );
    assert_eq!(events.mtu.lock().unwrap().as_slice(), [Ok(185)]);

    // Second exchange answers from the cache without touching the wire.
    let sent_before = link.sent_count();
    client.exchange_mtu(CONN, 2, 300).unwrap();
    assert_eq!(link.sent_count(), sent_before);
    assert_eq!(events.mtu.lock().unwrap().as_slice(), [Ok(185), Ok(185)]);
}

#[test]
fn mtu_exchange_on_classic_reports_default_without_traffic() {
    let (client, link, events) = client_harness(Transport::Classic);

    client.exchange_mtu(CONN, 1, 185).unwrap();
    assert_eq!(link.sent_count(), 0);
    assert_eq!(
        events.mtu.lock().unwrap().as_slice(),
        [Ok(ATT_BREDR_DEFAULT_MTU)]
    );
}

#[test]
fn mtu_below_default_is_a_failure_and_stays_unexchanged() {
    let (client, link, events) = client_harness(Transport::Le);

    client.exchange_mtu(CONN, 1, 185).unwrap();
    confirm(&client, &link);
    client.handle_att(
        CONN,
        AttPdu::ExchangeMtuResponse(ExchangeMtuResponse { server_mtu: 10 }),
    );
    assert_eq!(
        events.mtu.lock().unwrap().as_slice(),
        [Err(GattError::RequestRejected)]
    );

    // Not cached: a retry goes back to the wire.
    let sent_before = link.sent_count();
    client.exchange_mtu(CONN, 2, 185).unwrap();
    assert_eq!(link.sent_count(), sent_before + 1);
}

#[test]
fn service_discovery_paginates_from_last_handle() {
    let (client, link, events) = client_harness(Transport::Le);

    client.discover_all_primary_services(CONN, 1).unwrap();
    let first = ReadByGroupTypeRequest::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!((first.range.start, first.range.end), (0x0001, 0xFFFF));
    confirm(&client, &link);

    client.handle_att(
        CONN,
        AttPdu::ReadByGroupTypeResponse(ReadByGroupTypeResponse {
            items: vec![
                AttributeGroupData {
                    handle: 1,
                    group_end_handle: 5,
                    value: vec![0x00, 0x18],
                },
                AttributeGroupData {
                    handle: 6,
                    group_end_handle: 9,
                    value: vec![0x01, 0x18],
                },
            ],
        }),
    );

    // Next page starts one past the last returned group end.
    let second = ReadByGroupTypeRequest::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(second.range.start, 10);
    confirm(&client, &link);

    client.handle_att(
        CONN,
        AttPdu::ErrorResponse(ErrorResponse {
            request_opcode: ATT_READ_BY_GROUP_TYPE_REQ,
            handle: 10,
            error_code: AttErrorCode::AttributeNotFound,
        }),
    );

    let services = events.services.lock().unwrap();
    let list = services[0].as_ref().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!((list[0].handle, list[0].end_group_handle), (1, 5));
    assert_eq!(list[0].uuid, 0x1800u16);
    assert_eq!(list[1].handle, 6);
}

#[test]
fn service_discovery_terminates_at_handle_max() {
    let (client, link, events) = client_harness(Transport::Le);

    client.discover_all_primary_services(CONN, 1).unwrap();
    confirm(&client, &link);
    let sent_before = link.sent_count();
    client.handle_att(
        CONN,
        AttPdu::ReadByGroupTypeResponse(ReadByGroupTypeResponse {
            items: vec![AttributeGroupData {
                handle: 1,
                group_end_handle: 0xFFFF,
                value: vec![0x00, 0x18],
            }],
        }),
    );

    // No further page request; the operation completed.
    assert_eq!(link.sent_count(), sent_before);
    assert_eq!(events.services.lock().unwrap()[0].as_ref().unwrap().len(), 1);
}

#[test]
fn characteristic_uuid_filter_only_affects_caching() {
    let (client, link, events) = client_harness(Transport::Le);

    client
        .discover_characteristics_by_uuid(CONN, 1, 1, 0xFFFF, Uuid::from_u16(0x2A01))
        .unwrap();
    confirm(&client, &link);

    client.handle_att(
        CONN,
        AttPdu::ReadByTypeResponse(ReadByTypeResponse {
            items: vec![
                AttributeData {
                    handle: 2,
                    value: vec![0x02, 0x03, 0x00, 0x00, 0x2A],
                },
                AttributeData {
                    handle: 4,
                    value: vec![0x02, 0x05, 0x00, 0x01, 0x2A],
                },
            ],
        }),
    );

    // The cursor advanced over both declarations, filtered or not.
    let next = ReadByTypeRequest::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(next.range.start, 5);
    confirm(&client, &link);

    client.handle_att(
        CONN,
        AttPdu::ErrorResponse(ErrorResponse {
            request_opcode: ATT_READ_BY_TYPE_REQ,
            handle: 5,
            error_code: AttErrorCode::AttributeNotFound,
        }),
    );

    let discovered = events.characteristics.lock().unwrap();
    let list = discovered[0].as_ref().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].declaration_handle, 4);
    assert_eq!(list[0].uuid, 0x2A01u16);
}

#[test]
fn long_read_reassembles_blob_fragments() {
    let (client, link, events) = client_harness(Transport::Le);
    let value: Vec<u8> = (0..54u8).collect();

    client.read_value(CONN, 1, 0x0003).unwrap();
    confirm(&client, &link);

    // Full-size first fragment (MTU-1 = 22) means more data follows.
    client.handle_att(
        CONN,
        AttPdu::ReadResponse(ReadResponse {
            value: value[..22].to_vec(),
        }),
    );
    let blob = ReadBlobRequest::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!((blob.handle, blob.offset), (0x0003, 22));
    confirm(&client, &link);

    client.handle_att(
        CONN,
        AttPdu::ReadBlobResponse(ReadBlobResponse {
            part: value[22..44].to_vec(),
        }),
    );
    let blob = ReadBlobRequest::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(blob.offset, 44);
    confirm(&client, &link);

    // Short fragment terminates the read.
    client.handle_att(
        CONN,
        AttPdu::ReadBlobResponse(ReadBlobResponse {
            part: value[44..].to_vec(),
        }),
    );
    assert_eq!(
        events.reads.lock().unwrap().as_slice(),
        [(0x0003, Ok(value))]
    );
}

#[test]
fn long_write_chunks_then_commits() {
    let (client, link, events) = client_harness(Transport::Le);
    let value = vec![0xAB; 600];

    client.write_value(CONN, 1, 0x0003, value.clone()).unwrap();

    let mut chunks: Vec<PrepareWriteRequest> = Vec::new();
    loop {
        let pdu = link.last_sent().unwrap();
        match pdu[0] {
            ATT_PREPARE_WRITE_REQ => {
                let req = PrepareWriteRequest::parse(&pdu).unwrap();
                confirm(&client, &link);
                client.handle_att(
                    CONN,
                    AttPdu::PrepareWriteResponse(PrepareWriteResponse {
                        handle: req.handle,
                        offset: req.offset,
                        part: req.part.clone(),
                    }),
                );
                chunks.push(req);
            }
            ATT_EXECUTE_WRITE_REQ => break,
            other => panic!("unexpected opcode 0x{:02X}", other),
        }
    }

    // 600 bytes at MTU 23 move in 34 chunks of at most 18 bytes each.
    assert_eq!(chunks.len(), 34);
    let mut reassembled = Vec::new();
    for (index, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.offset as usize, index * 18);
        assert!(chunk.part.len() <= 18);
        reassembled.extend_from_slice(&chunk.part);
    }
    assert_eq!(reassembled, value);

    let execute = ExecuteWriteRequest::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(execute.flag, ExecuteWriteFlag::Commit);
    confirm(&client, &link);
    client.handle_att(CONN, AttPdu::ExecuteWriteResponse(ExecuteWriteResponse));

    assert_eq!(events.writes.lock().unwrap().as_slice(), [(0x0003, Ok(()))]);
}

#[test]
fn reliable_write_surfaces_echo_before_execute() {
    let (client, link, events) = client_harness(Transport::Le);

    client
        .reliable_write(CONN, 1, 0x0003, vec![1, 2, 3])
        .unwrap();
    confirm(&client, &link);
    client.handle_att(
        CONN,
        AttPdu::PrepareWriteResponse(PrepareWriteResponse {
            handle: 0x0003,
            offset: 0,
            part: vec![1, 2, 9],
        }),
    );

    // The (possibly corrupted) echo is the caller's to verify.
    assert_eq!(
        events.echoes.lock().unwrap().as_slice(),
        [(0x0003, vec![1, 2, 9])]
    );
    assert!(events.executes.lock().unwrap().is_empty());

    client.execute_write(CONN, 2, false).unwrap();
    let execute = ExecuteWriteRequest::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(execute.flag, ExecuteWriteFlag::Cancel);
    confirm(&client, &link);
    client.handle_att(CONN, AttPdu::ExecuteWriteResponse(ExecuteWriteResponse));
    assert_eq!(events.executes.lock().unwrap().as_slice(), [Ok(())]);
}

#[test]
fn error_response_resolves_by_request_opcode() {
    let (client, link, events) = client_harness(Transport::Le);

    client.read_value(CONN, 1, 0x0005).unwrap();
    confirm(&client, &link);
    client.handle_att(
        CONN,
        AttPdu::ErrorResponse(ErrorResponse {
            request_opcode: ATT_READ_REQ,
            handle: 0x0005,
            error_code: AttErrorCode::ReadNotPermitted,
        }),
    );
    assert_eq!(
        events.reads.lock().unwrap().as_slice(),
        [(0x0005, Err(GattError::ReadNotPermitted))]
    );
}

#[test]
fn transaction_timeout_fails_the_outstanding_request() {
    let (client, link, events) = client_harness(Transport::Le);

    client.read_value(CONN, 1, 0x0005).unwrap();
    confirm(&client, &link);
    client.handle_timeout(CONN, ATT_READ_REQ);
    assert_eq!(
        events.reads.lock().unwrap().as_slice(),
        [(0x0005, Err(GattError::Timeout))]
    );
}

#[test]
fn transaction_timeout_fails_an_unconfirmed_send() {
    let (client, _link, events) = client_harness(Transport::Le);

    // No send acknowledgment ever arrives; the entry is still in the
    // pending-send list when the timeout fires.
    client.read_value(CONN, 1, 0x0005).unwrap();
    client.handle_timeout(CONN, ATT_READ_REQ);
    assert_eq!(
        events.reads.lock().unwrap().as_slice(),
        [(0x0005, Err(GattError::Timeout))]
    );

    // The entry was removed; a straggling acknowledgment is a no-op.
    client.handle_send_confirm(CONN, ATT_READ_REQ, true);
    client.handle_timeout(CONN, ATT_READ_REQ);
    assert_eq!(events.reads.lock().unwrap().len(), 1);
}

#[test]
fn disconnect_fails_every_outstanding_request() {
    let (client, link, events) = client_harness(Transport::Le);

    client.read_value(CONN, 1, 0x0005).unwrap();
    confirm(&client, &link);
    client.on_disconnected(CONN);
    assert_eq!(
        events.reads.lock().unwrap().as_slice(),
        [(0x0005, Err(GattError::NotConnected))]
    );

    // State is gone; new operations are rejected only if the link registry
    // no longer knows the handle (the fixed mock still does).
    assert!(client.read_value(CONN, 2, 0x0005).is_ok());
}

#[test]
fn indications_are_confirmed_automatically() {
    let (client, link, events) = client_harness(Transport::Le);

    client.handle_att(
        CONN,
        AttPdu::HandleValueIndication(HandleValueIndication {
            handle: 0x0003,
            value: vec![7],
        }),
    );
    assert_eq!(
        events.indications.lock().unwrap().as_slice(),
        [(0x0003, vec![7])]
    );
    assert_eq!(link.last_sent().unwrap(), vec![ATT_HANDLE_VALUE_CONF]);
}

#[test]
fn write_without_response_respects_the_mtu() {
    let (client, link, _events) = client_harness(Transport::Le);

    assert_eq!(
        client.write_without_response(CONN, 0x0003, vec![0; 21]),
        Err(GattError::ValueTooLong)
    );
    client.write_without_response(CONN, 0x0003, vec![0; 20]).unwrap();
    assert_eq!(link.last_sent().unwrap()[0], ATT_WRITE_CMD);
}

// --- server harness ---

#[derive(Default)]
struct ServerEvents {
    mtu_changes: Mutex<Vec<u16>>,
    read_requests: Mutex<Vec<u16>>,
    write_requests: Mutex<Vec<(u16, Vec<u8>)>>,
    write_commands: Mutex<Vec<(u16, Vec<u8>)>>,
    executes: Mutex<Vec<(Vec<QueuedWrite>, bool)>>,
    subscriptions: Mutex<Vec<(u16, CccdFlags)>>,
    indication_results: Mutex<Vec<(u16, Result<(), GattError>)>>,
}

impl ServerEventHandler for ServerEvents {
    fn on_mtu_changed(&self, _conn: ConnectionHandle, mtu: u16) {
        self.mtu_changes.lock().unwrap().push(mtu);
    }

    fn on_read_request(&self, _conn: ConnectionHandle, handle: u16) {
        self.read_requests.lock().unwrap().push(handle);
    }

    fn on_write_request(&self, _conn: ConnectionHandle, handle: u16, value: &[u8]) {
        self.write_requests
            .lock()
            .unwrap()
            .push((handle, value.to_vec()));
    }

    fn on_write_command(&self, _conn: ConnectionHandle, handle: u16, value: &[u8]) {
        self.write_commands
            .lock()
            .unwrap()
            .push((handle, value.to_vec()));
    }

    fn on_execute_write(&self, _conn: ConnectionHandle, writes: Vec<QueuedWrite>, commit: bool) {
        self.executes.lock().unwrap().push((writes, commit));
    }

    fn on_subscription_changed(&self, _conn: ConnectionHandle, value_handle: u16, flags: CccdFlags) {
        self.subscriptions.lock().unwrap().push((value_handle, flags));
    }

    fn on_indication_result(
        &self,
        _conn: ConnectionHandle,
        handle: u16,
        result: Result<(), GattError>,
    ) {
        self.indication_results.lock().unwrap().push((handle, result));
    }
}

/// One service [1..8]: a readable/writable characteristic with a CCCD and
/// an unreadable user-description descriptor, plus an application-owned
/// characteristic.
fn fixture_store(value: Vec<u8>) -> StaticStore {
    StaticStore {
        services: vec![ServiceRecord {
            handle: 1,
            end_handle: 8,
            uuid: Uuid::from_u16(0x1800),
            primary: true,
        }],
        includes: Vec::new(),
        characteristics: vec![
            CharacteristicRecord {
                declaration_handle: 2,
                value_handle: 3,
                uuid: Uuid::from_u16(0x2A00),
                properties: CharacteristicProperties::READ
                    | CharacteristicProperties::WRITE
                    | CharacteristicProperties::WRITE_WITHOUT_RESPONSE
                    | CharacteristicProperties::NOTIFY
                    | CharacteristicProperties::INDICATE,
                permissions: AttPermissions::READ | AttPermissions::WRITE,
                value: Some(value),
            },
            CharacteristicRecord {
                declaration_handle: 6,
                value_handle: 7,
                uuid: Uuid::from_u16(0x2A01),
                properties: CharacteristicProperties::READ | CharacteristicProperties::WRITE,
                permissions: AttPermissions::READ | AttPermissions::WRITE,
                value: None,
            },
        ],
        descriptors: vec![
            DescriptorRecord {
                handle: 4,
                uuid: Uuid::from_u16(0x2902),
                permissions: AttPermissions::READ | AttPermissions::WRITE,
                value: None,
            },
            DescriptorRecord {
                handle: 5,
                uuid: Uuid::from_u16(0x2901),
                permissions: AttPermissions::empty(),
                value: Some(b"label".to_vec()),
            },
        ],
    }
}

fn server_harness(
    store: StaticStore,
    config: ServerConfig,
) -> (Arc<ServerEngine>, Arc<MockLink>, Arc<ServerEvents>) {
    let link = Arc::new(MockLink::default());
    let events = Arc::new(ServerEvents::default());
    let engine = ServerEngine::new(link.clone(), Arc::new(store), events.clone(), config);
    engine.on_connected(CONN, PEER, false);
    (engine, link, events)
}

fn subscribe(server: &ServerEngine, flags: u16) {
    server.handle_att(
        CONN,
        AttPdu::WriteRequest(WriteRequest {
            handle: 4,
            value: flags.to_le_bytes().to_vec(),
        }),
    );
}

// --- server tests ---

#[test]
fn mtu_clamp_takes_effect_after_send_confirm() {
    let (server, link, events) = server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    server.handle_att(
        CONN,
        AttPdu::ExchangeMtuRequest(ExchangeMtuRequest { client_mtu: 100 }),
    );
    let rsp = ExchangeMtuResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.server_mtu, ATT_MAX_MTU);
    assert!(events.mtu_changes.lock().unwrap().is_empty());

    server.handle_send_confirm(CONN, ATT_EXCHANGE_MTU_RSP, true);
    assert_eq!(events.mtu_changes.lock().unwrap().as_slice(), [100]);
}

#[test]
fn mtu_below_default_is_refused() {
    let (server, link, _events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    server.handle_att(
        CONN,
        AttPdu::ExchangeMtuRequest(ExchangeMtuRequest { client_mtu: 10 }),
    );
    let rsp = ErrorResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.error_code, AttErrorCode::RequestNotSupported);
}

#[test]
fn primary_service_discovery_answers_and_rejects_other_groups() {
    let (server, link, _events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());
    let range = HandleRange::new(1, 0xFFFF).unwrap();

    server.handle_att(
        CONN,
        AttPdu::ReadByGroupTypeRequest(ReadByGroupTypeRequest {
            range,
            group_type: Uuid::from_u16(PRIMARY_SERVICE_UUID),
        }),
    );
    let rsp = ReadByGroupTypeResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.items.len(), 1);
    assert_eq!((rsp.items[0].handle, rsp.items[0].group_end_handle), (1, 8));

    server.handle_att(
        CONN,
        AttPdu::ReadByGroupTypeRequest(ReadByGroupTypeRequest {
            range,
            group_type: Uuid::from_u16(SECONDARY_SERVICE_UUID),
        }),
    );
    let err = ErrorResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(err.error_code, AttErrorCode::UnsupportedGroupType);
}

#[test]
fn read_permission_matrix() {
    let (server, link, events) =
        server_harness(fixture_store(b"hello".to_vec()), ServerConfig::default());

    // Service declaration is always readable.
    server.handle_att(CONN, AttPdu::ReadRequest(ReadRequest { handle: 1 }));
    let rsp = ReadResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.value, vec![0x00, 0x18]);

    // Characteristic declaration assembles properties + handle + UUID.
    server.handle_att(CONN, AttPdu::ReadRequest(ReadRequest { handle: 2 }));
    let rsp = ReadResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.value[1..3], [0x03, 0x00]);

    // Stored characteristic value.
    server.handle_att(CONN, AttPdu::ReadRequest(ReadRequest { handle: 3 }));
    let rsp = ReadResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.value, b"hello");

    // Unreadable descriptor: protocol error, no application callback.
    server.handle_att(CONN, AttPdu::ReadRequest(ReadRequest { handle: 5 }));
    let err = ErrorResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(err.error_code, AttErrorCode::ReadNotPermitted);
    assert!(events.read_requests.lock().unwrap().is_empty());

    // Unknown handle.
    server.handle_att(CONN, AttPdu::ReadRequest(ReadRequest { handle: 99 }));
    let err = ErrorResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(err.error_code, AttErrorCode::InvalidHandle);
}

#[test]
fn application_owned_value_is_fetched_via_deferred_read() {
    let (server, link, events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    let sent_before = link.sent_count();
    server.handle_att(CONN, AttPdu::ReadRequest(ReadRequest { handle: 7 }));
    assert_eq!(link.sent_count(), sent_before);
    assert_eq!(events.read_requests.lock().unwrap().as_slice(), [7]);

    server.respond_read(CONN, Ok(b"app".to_vec())).unwrap();
    let rsp = ReadResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.value, b"app");

    // A second respond without an outstanding read is rejected.
    assert!(server.respond_read(CONN, Ok(Vec::new())).is_err());
}

#[test]
fn blob_cache_serves_fragments_and_polices_offsets() {
    let value: Vec<u8> = (0..60u8).collect();
    let (server, link, _events) = server_harness(fixture_store(value.clone()), ServerConfig::default());

    // First read leaves a cache behind with the full value.
    server.handle_att(CONN, AttPdu::ReadRequest(ReadRequest { handle: 3 }));
    let rsp = ReadResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.value, &value[..22]);

    server.handle_att(
        CONN,
        AttPdu::ReadBlobRequest(ReadBlobRequest { handle: 3, offset: 22 }),
    );
    let rsp = ReadBlobResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.part, &value[22..44]);

    // Offset past the cached value.
    server.handle_att(
        CONN,
        AttPdu::ReadBlobRequest(ReadBlobRequest { handle: 3, offset: 70 }),
    );
    let err = ErrorResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(err.error_code, AttErrorCode::InvalidOffset);

    // Short final fragment drops the cache.
    server.handle_att(
        CONN,
        AttPdu::ReadBlobRequest(ReadBlobRequest { handle: 3, offset: 44 }),
    );
    let rsp = ReadBlobResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.part, &value[44..]);

    // Without a cache a blob read must start at offset zero.
    server.handle_att(
        CONN,
        AttPdu::ReadBlobRequest(ReadBlobRequest { handle: 3, offset: 10 }),
    );
    let err = ErrorResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(err.error_code, AttErrorCode::InvalidOffset);
}

#[test]
fn subscriptions_gate_notifications_and_indications() {
    let (server, link, events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    // Unsubscribed: a silent no-op.
    server.notify(CONN, 3, &[1]).unwrap();
    assert_eq!(link.sent_count(), 0);

    subscribe(&server, 0x0001);
    assert_eq!(
        events.subscriptions.lock().unwrap().as_slice(),
        [(3, CccdFlags::NOTIFICATION)]
    );
    server.notify(CONN, 3, &[1]).unwrap();
    assert_eq!(link.last_sent().unwrap()[0], ATT_HANDLE_VALUE_NTF);

    // Notification-only subscription does not allow indications.
    let sent_before = link.sent_count();
    server.indicate(CONN, 3, &[2]).unwrap();
    assert_eq!(link.sent_count(), sent_before);

    subscribe(&server, 0x0002);
    server.indicate(CONN, 3, &[2]).unwrap();
    assert_eq!(link.last_sent().unwrap()[0], ATT_HANDLE_VALUE_IND);

    // One indication in flight at a time.
    assert_eq!(
        server.indicate(CONN, 3, &[3]),
        Err(GattError::IndicationPending)
    );

    server.handle_att(CONN, AttPdu::HandleValueConfirmation(HandleValueConfirmation));
    assert_eq!(
        events.indication_results.lock().unwrap().as_slice(),
        [(3, Ok(()))]
    );
}

#[test]
fn indication_timeout_resolves_the_pending_record() {
    let (server, _link, events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    subscribe(&server, 0x0002);
    server.indicate(CONN, 3, &[1]).unwrap();
    server.handle_timeout(CONN, ATT_HANDLE_VALUE_IND);
    assert_eq!(
        events.indication_results.lock().unwrap().as_slice(),
        [(3, Err(GattError::Timeout))]
    );

    // The slot is free again.
    server.indicate(CONN, 3, &[2]).unwrap();
}

#[test]
fn cccd_rejects_flags_without_matching_properties() {
    let (server, link, _events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    server.handle_att(
        CONN,
        AttPdu::WriteRequest(WriteRequest {
            handle: 4,
            value: vec![0x04, 0x00],
        }),
    );
    let err = ErrorResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(err.error_code, AttErrorCode::ValueNotAllowed);

    server.handle_att(
        CONN,
        AttPdu::WriteRequest(WriteRequest {
            handle: 4,
            value: vec![0x01],
        }),
    );
    let err = ErrorResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(err.error_code, AttErrorCode::InvalidAttributeValueLength);
}

#[test]
fn subscriptions_survive_encrypted_reconnects_only() {
    let (server, link, _events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    // Encrypted session subscribes, disconnects, comes back encrypted.
    server.on_disconnected(CONN);
    server.on_connected(CONN, PEER, true);
    subscribe(&server, 0x0001);
    server.on_disconnected(CONN);
    server.on_connected(CONN, PEER, true);
    server.notify(CONN, 3, &[1]).unwrap();
    assert_eq!(link.last_sent().unwrap()[0], ATT_HANDLE_VALUE_NTF);

    // An unencrypted session loses the table on disconnect.
    server.on_disconnected(CONN);
    server.on_connected(CONN, PEER, false);
    subscribe(&server, 0x0001);
    server.on_disconnected(CONN);
    server.on_connected(CONN, PEER, false);
    let sent_before = link.sent_count();
    server.notify(CONN, 3, &[1]).unwrap();
    assert_eq!(link.sent_count(), sent_before);
}

#[test]
fn prepare_queue_replays_in_order_on_commit() {
    let (server, link, events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    for (offset, part) in [(0u16, vec![1, 2]), (2, vec![3, 4]), (4, vec![5])] {
        server.handle_att(
            CONN,
            AttPdu::PrepareWriteRequest(PrepareWriteRequest {
                handle: 3,
                offset,
                part: part.clone(),
            }),
        );
        let echo = PrepareWriteResponse::parse(&link.last_sent().unwrap()).unwrap();
        assert_eq!((echo.offset, echo.part), (offset, part));
    }

    server.handle_att(
        CONN,
        AttPdu::ExecuteWriteRequest(ExecuteWriteRequest {
            flag: ExecuteWriteFlag::Commit,
        }),
    );
    assert_eq!(link.last_sent().unwrap()[0], ATT_EXECUTE_WRITE_RSP);

    let executes = events.executes.lock().unwrap();
    let (writes, commit) = &executes[0];
    assert!(*commit);
    assert_eq!(writes.len(), 3);
    assert_eq!((writes[0].offset, writes[2].offset), (0, 4));
}

#[test]
fn cancel_discards_the_prepare_queue() {
    let (server, _link, events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    server.handle_att(
        CONN,
        AttPdu::PrepareWriteRequest(PrepareWriteRequest {
            handle: 3,
            offset: 0,
            part: vec![1],
        }),
    );
    server.handle_att(
        CONN,
        AttPdu::ExecuteWriteRequest(ExecuteWriteRequest {
            flag: ExecuteWriteFlag::Cancel,
        }),
    );

    let executes = events.executes.lock().unwrap();
    let (writes, commit) = &executes[0];
    assert!(!*commit);
    assert!(writes.is_empty());
}

#[test]
fn prepare_queue_limit_is_enforced() {
    let config = ServerConfig {
        prepare_queue_limit: 2,
        ..ServerConfig::default()
    };
    let (server, link, _events) = server_harness(fixture_store(b"hi".to_vec()), config);

    for offset in 0..2u16 {
        server.handle_att(
            CONN,
            AttPdu::PrepareWriteRequest(PrepareWriteRequest {
                handle: 3,
                offset,
                part: vec![0],
            }),
        );
    }
    server.handle_att(
        CONN,
        AttPdu::PrepareWriteRequest(PrepareWriteRequest {
            handle: 3,
            offset: 2,
            part: vec![0],
        }),
    );
    let err = ErrorResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(err.error_code, AttErrorCode::PrepareQueueFull);
}

#[test]
fn write_command_requires_the_property() {
    let (server, link, events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    // Handle 7 lacks write-without-response: dropped silently.
    server.handle_att(
        CONN,
        AttPdu::WriteCommand(WriteCommand {
            handle: 7,
            value: vec![1],
        }),
    );
    assert_eq!(link.sent_count(), 0);
    assert!(events.write_commands.lock().unwrap().is_empty());

    server.handle_att(
        CONN,
        AttPdu::WriteCommand(WriteCommand {
            handle: 3,
            value: vec![1],
        }),
    );
    assert_eq!(
        events.write_commands.lock().unwrap().as_slice(),
        [(3, vec![1])]
    );
}

#[test]
fn deferred_write_answers_through_the_application() {
    let (server, link, events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    server.handle_att(
        CONN,
        AttPdu::WriteRequest(WriteRequest {
            handle: 3,
            value: vec![9, 9],
        }),
    );
    assert_eq!(
        events.write_requests.lock().unwrap().as_slice(),
        [(3, vec![9, 9])]
    );

    server.respond_write(CONN, Ok(())).unwrap();
    assert_eq!(link.last_sent().unwrap()[0], ATT_WRITE_RSP);

    // Rejection surfaces as an error response on the written handle.
    server.handle_att(
        CONN,
        AttPdu::WriteRequest(WriteRequest {
            handle: 3,
            value: vec![1],
        }),
    );
    server
        .respond_write(CONN, Err(AttErrorCode::ApplicationError(0x80)))
        .unwrap();
    let err = ErrorResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(err.error_code, AttErrorCode::ApplicationError(0x80));
    assert_eq!(err.handle, 3);
}

#[test]
fn cccd_reads_report_the_connection_state() {
    let (server, link, _events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    server.handle_att(CONN, AttPdu::ReadRequest(ReadRequest { handle: 4 }));
    let rsp = ReadResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.value, vec![0x00, 0x00]);

    subscribe(&server, 0x0001);
    server.handle_att(CONN, AttPdu::ReadRequest(ReadRequest { handle: 4 }));
    let rsp = ReadResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.value, vec![0x01, 0x00]);
}

#[test]
fn find_information_lists_descriptors() {
    let (server, link, _events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    server.handle_att(
        CONN,
        AttPdu::FindInformationRequest(FindInformationRequest {
            range: HandleRange::new(4, 5).unwrap(),
        }),
    );
    let rsp = FindInformationResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.pairs.len(), 2);
    assert_eq!(rsp.pairs[0], (4, Uuid::from_u16(0x2902)));
    assert_eq!(rsp.pairs[1], (5, Uuid::from_u16(0x2901)));
}

#[test]
fn find_by_type_value_matches_primary_services() {
    let (server, link, _events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());
    let range = HandleRange::new(1, 0xFFFF).unwrap();

    server.handle_att(
        CONN,
        AttPdu::FindByTypeValueRequest(FindByTypeValueRequest {
            range,
            attribute_type: PRIMARY_SERVICE_UUID,
            value: vec![0x00, 0x18],
        }),
    );
    let rsp = FindByTypeValueResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.handles.len(), 1);
    assert_eq!(rsp.handles[0].found_handle, 1);

    server.handle_att(
        CONN,
        AttPdu::FindByTypeValueRequest(FindByTypeValueRequest {
            range,
            attribute_type: PRIMARY_SERVICE_UUID,
            value: vec![0x0F, 0x18],
        }),
    );
    let err = ErrorResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(err.error_code, AttErrorCode::AttributeNotFound);
}

#[test]
fn characteristic_discovery_returns_declarations() {
    let (server, link, _events) =
        server_harness(fixture_store(b"hi".to_vec()), ServerConfig::default());

    server.handle_att(
        CONN,
        AttPdu::ReadByTypeRequest(ReadByTypeRequest {
            range: HandleRange::new(1, 8).unwrap(),
            attribute_type: Uuid::from_u16(CHARACTERISTIC_UUID),
        }),
    );
    let rsp = ReadByTypeResponse::parse(&link.last_sent().unwrap()).unwrap();
    assert_eq!(rsp.items.len(), 2);
    assert_eq!(rsp.items[0].handle, 2);
    // properties byte, value handle, 16-bit UUID
    assert_eq!(rsp.items[0].value.len(), 5);
    assert_eq!(rsp.items[1].value[1..3], [0x07, 0x00]);
}
