//! Composition root wiring the dispatcher, the connection manager and the
//! two transaction engines together.
//!
//! All services are constructed here and handed their dependencies
//! explicitly; nothing in the crate reaches for an ambient instance. The
//! transport adapter calls [`GattStack::on_transport_event`], which marshals
//! the event onto the dispatcher thread and routes it: lifecycle events to
//! the connection manager, ATT traffic to the engine that owns the opcode.

use std::sync::Arc;

use log::warn;

use crate::att::pdu::AttPdu;
use crate::config::{ConnectionConfig, ServerConfig};
use crate::connection::ConnectionManager;
use crate::dispatch::Dispatcher;
use crate::gatt::client::{ClientEngine, ClientEventHandler};
use crate::gatt::server::{AttributeStore, ServerEngine, ServerEventHandler};
use crate::transport::{ConnectionHandle, TransportEvent, TransportSink, STATUS_SUCCESS};

pub struct GattStack {
    dispatcher: Arc<Dispatcher>,
    connections: Arc<ConnectionManager>,
    client: Arc<ClientEngine>,
    server: Arc<ServerEngine>,
}

impl GattStack {
    pub fn new(
        transport: Arc<dyn TransportSink>,
        store: Arc<dyn AttributeStore>,
        client_handler: Arc<dyn ClientEventHandler>,
        server_handler: Arc<dyn ServerEventHandler>,
        connection_config: ConnectionConfig,
        server_config: ServerConfig,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher::new("gatt-stack"));
        let connections = ConnectionManager::new(
            connection_config,
            Arc::clone(&transport),
            Arc::clone(&dispatcher),
        );
        let links: Arc<dyn crate::connection::LinkInfoSource> = connections.clone();
        let client = ClientEngine::new(Arc::clone(&transport), links, client_handler);
        let server = ServerEngine::new(transport, store, server_handler, server_config);
        Arc::new(GattStack {
            dispatcher,
            connections,
            client,
            server,
        })
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn client(&self) -> &Arc<ClientEngine> {
        &self.client
    }

    pub fn server(&self) -> &Arc<ServerEngine> {
        &self.server
    }

    /// Entry point for the transport adapter. Safe to call from any thread;
    /// the event is processed on the dispatcher thread.
    pub fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        let this = Arc::clone(self);
        self.dispatcher.post(move || this.route(event));
    }

    /// Convenience wrapper decoding a raw inbound ATT PDU.
    pub fn on_att_received(self: &Arc<Self>, handle: ConnectionHandle, data: &[u8]) {
        match AttPdu::decode(data) {
            Ok(pdu) => self.on_transport_event(TransportEvent::AttReceived { handle, pdu }),
            Err(err) => warn!("undecodable ATT PDU on 0x{:04X}: {}", handle, err),
        }
    }

    /// Reports a link encryption change to every service that tracks it.
    pub fn set_encryption(self: &Arc<Self>, handle: ConnectionHandle, encrypted: bool) {
        let this = Arc::clone(self);
        self.dispatcher.post(move || {
            this.connections.set_encryption_state(handle, encrypted);
            this.server.set_encryption(handle, encrypted);
        });
    }

    fn route(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::ConnectComplete { status, handle, .. } => {
                self.connections.handle_transport_event(event);
                if status == STATUS_SUCCESS {
                    // The manager registered the link; spin up engine state.
                    if let Some(info) = self.connections.device_by_handle(handle) {
                        self.client.on_connected(handle, info.transport);
                        self.server.on_connected(handle, info.addr, info.encrypted);
                    }
                }
            }
            TransportEvent::DisconnectComplete { status, handle, .. } => {
                if status == STATUS_SUCCESS {
                    self.client.on_disconnected(handle);
                    self.server.on_disconnected(handle);
                }
                self.connections.handle_transport_event(event);
            }
            TransportEvent::ConnectionParameterUpdate { .. } => {
                self.connections.handle_transport_event(event);
            }
            TransportEvent::AttReceived { handle, pdu } => {
                if pdu.is_client_originated() {
                    self.server.handle_att(handle, pdu);
                } else {
                    self.client.handle_att(handle, pdu);
                }
            }
            TransportEvent::SendConfirm { handle, opcode, ok } => {
                // Each engine matches against its own outstanding sends.
                self.client.handle_send_confirm(handle, opcode, ok);
                self.server.handle_send_confirm(handle, opcode, ok);
            }
            TransportEvent::TransactionTimeout { handle, opcode } => {
                self.client.handle_timeout(handle, opcode);
                self.server.handle_timeout(handle, opcode);
            }
        }
    }
}
