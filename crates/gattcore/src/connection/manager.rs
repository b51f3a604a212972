//! Connection lifecycle manager.
//!
//! Owns the device registry and one state machine per device. The registry
//! mutex is short-held (lookup/insert only); each device carries its own
//! mutex. All state transitions run as dispatcher tasks, so transport events
//! and application calls never race. Observer callbacks fire after the
//! device lock is released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use super::types::{
    default_mtu, ConnectionEvent, ConnectionObserver, ConnectionPriority, ConnectionState, Device,
    DeviceId, DeviceInfo,
};
use crate::config::ConnectionConfig;
use crate::dispatch::Dispatcher;
use crate::error::ConnectionError;
use crate::transport::{
    AddressType, BdAddr, ConnectionHandle, LinkRole, Transport, TransportEvent, TransportSink,
    REASON_CONNECTION_FAILED_TO_BE_ESTABLISHED, STATUS_SUCCESS,
};

/// Fixed number of observer slots.
pub const MAX_OBSERVERS: usize = 8;

/// Reason reported when the local host gives up on a link.
const REASON_LOCAL_TERMINATION: u8 = 0x16;
/// Pseudo-reason for failures that never reached the controller.
const REASON_INTERNAL: u8 = 0xFF;

/// Read-only link facts other engines need (MTU sizing per transport).
pub trait LinkInfoSource: Send + Sync {
    fn link_transport(&self, handle: ConnectionHandle) -> Option<Transport>;
}

/// Events driving the per-device state machine.
#[derive(Debug, Clone, Copy)]
enum StateEvent {
    Connect,
    Reconnect,
    ConnectComplete {
        status: u8,
        handle: ConnectionHandle,
        role: LinkRole,
    },
    Disconnect,
    DisconnectComplete {
        status: u8,
        reason: u8,
    },
    RequestPriority(ConnectionPriority),
    ParametersUpdated {
        status: u8,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
}

#[derive(Default)]
struct Registry {
    devices: HashMap<DeviceId, Arc<Mutex<Device>>>,
    by_handle: HashMap<ConnectionHandle, DeviceId>,
}

/// What a transition decided, applied after the device lock is dropped.
#[derive(Default)]
struct Outcome {
    events: Vec<ConnectionEvent>,
    map_handle: Option<ConnectionHandle>,
    unmap_handle: Option<ConnectionHandle>,
    remove: bool,
    repost_connect: bool,
    repost_reconnect: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// The connection lifecycle service. Constructed once at the composition
/// root and shared by reference; there is no ambient global instance.
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn TransportSink>,
    dispatcher: Arc<Dispatcher>,
    registry: Mutex<Registry>,
    observers: Mutex<[Option<Arc<dyn ConnectionObserver>>; MAX_OBSERVERS]>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn TransportSink>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        Arc::new(ConnectionManager {
            config,
            transport,
            dispatcher,
            registry: Mutex::new(Registry::default()),
            observers: Mutex::new(std::array::from_fn(|_| None)),
        })
    }

    /// Registers an observer into a free slot, returning the slot index.
    pub fn register_observer(
        &self,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<usize, ConnectionError> {
        let mut slots = lock(&self.observers);
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(observer);
                return Ok(index);
            }
        }
        Err(ConnectionError::ObserverSlotsFull)
    }

    pub fn deregister_observer(&self, index: usize) {
        let mut slots = lock(&self.observers);
        if let Some(slot) = slots.get_mut(index) {
            *slot = None;
        }
    }

    /// Initiates (or re-initiates) a connection. Registration is idempotent
    /// per (address, transport); the capacity check only applies when a new
    /// entry would be created.
    pub fn connect(
        self: &Arc<Self>,
        addr: BdAddr,
        addr_type: AddressType,
        transport: Transport,
        auto_connect: bool,
    ) -> Result<(), ConnectionError> {
        self.check_transport_enabled(transport)?;
        let id = DeviceId::new(addr, transport);

        let device = {
            let mut registry = lock(&self.registry);
            match registry.devices.get(&id) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let active = registry
                        .devices
                        .keys()
                        .filter(|key| key.transport == transport)
                        .count();
                    if active >= self.max_connections(transport) {
                        return Err(ConnectionError::MaxConnections(transport));
                    }
                    let device = Arc::new(Mutex::new(Device::new(id, addr_type, auto_connect)));
                    registry.devices.insert(id, Arc::clone(&device));
                    device
                }
            }
        };
        lock(&device).auto_connect = auto_connect;

        info!("connect requested for {} over {:?}", addr, transport);
        self.post_event(id, StateEvent::Connect);
        Ok(())
    }

    /// Requests a disconnect. Clears auto-reconnect so the device will not
    /// come back on its own. Fails if the device is not registered.
    pub fn disconnect(
        self: &Arc<Self>,
        addr: BdAddr,
        transport: Transport,
    ) -> Result<(), ConnectionError> {
        let id = DeviceId::new(addr, transport);
        let device = self
            .lookup(id)
            .ok_or(ConnectionError::UnknownDevice)?;
        lock(&device).auto_connect = false;

        info!("disconnect requested for {} over {:?}", addr, transport);
        self.post_event(id, StateEvent::Disconnect);
        Ok(())
    }

    /// Translates a priority tier into concrete connection parameters and
    /// asks the transport for an update. LE links only.
    pub fn request_connection_priority(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        priority: ConnectionPriority,
    ) -> Result<(), ConnectionError> {
        let id = self
            .id_by_handle(handle)
            .ok_or(ConnectionError::UnknownDevice)?;
        if id.transport != Transport::Le {
            return Err(ConnectionError::PriorityNotApplicable);
        }
        let device = self.lookup(id).ok_or(ConnectionError::UnknownDevice)?;
        if lock(&device).state != ConnectionState::Connected {
            return Err(ConnectionError::PriorityNotApplicable);
        }
        self.post_event(id, StateEvent::RequestPriority(priority));
        Ok(())
    }

    /// Feeds a transport event into the state machines. Must run on the
    /// dispatcher thread; the stack wrapper takes care of marshaling.
    pub fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::ConnectComplete {
                status,
                handle,
                addr,
                addr_type,
                transport,
                role,
            } => {
                let id = DeviceId::new(addr, transport);
                if self.lookup(id).is_none() {
                    // Inbound link: register on first indication, still
                    // subject to the per-transport cap.
                    if !self.try_register_inbound(id, addr_type, role) {
                        warn!("inbound {:?} link from {} over capacity, ignored", transport, addr);
                        return;
                    }
                }
                self.drive(id, StateEvent::ConnectComplete { status, handle, role });
            }
            TransportEvent::DisconnectComplete {
                status,
                handle,
                reason,
            } => match self.id_by_handle(handle) {
                Some(id) => self.drive(id, StateEvent::DisconnectComplete { status, reason }),
                None => {
                    // Unknown handle: nothing registered, nothing to do.
                    debug!("disconnect-complete for unknown handle 0x{:04X}", handle);
                }
            },
            TransportEvent::ConnectionParameterUpdate {
                status,
                handle,
                interval,
                latency,
                supervision_timeout,
            } => {
                if let Some(id) = self.id_by_handle(handle) {
                    self.drive(
                        id,
                        StateEvent::ParametersUpdated {
                            status,
                            interval,
                            latency,
                            supervision_timeout,
                        },
                    );
                }
            }
            // ATT traffic and send bookkeeping belong to the engines.
            TransportEvent::AttReceived { .. }
            | TransportEvent::SendConfirm { .. }
            | TransportEvent::TransactionTimeout { .. } => {}
        }
    }

    /// Marks the link's encryption status, e.g. after the security manager
    /// finishes pairing. Reflected in [`DeviceInfo::encrypted`].
    pub fn set_encryption_state(&self, handle: ConnectionHandle, encrypted: bool) {
        if let Some(id) = self.id_by_handle(handle) {
            if let Some(device) = self.lookup(id) {
                lock(&device).encrypted = encrypted;
            }
        }
    }

    /// Snapshot of the device owning a connection handle.
    pub fn device_by_handle(&self, handle: ConnectionHandle) -> Option<DeviceInfo> {
        let id = self.id_by_handle(handle)?;
        self.lookup(id).map(|device| lock(&device).snapshot())
    }

    pub fn get_device_state(&self, addr: BdAddr, transport: Transport) -> Option<ConnectionState> {
        self.lookup(DeviceId::new(addr, transport))
            .map(|device| lock(&device).state)
    }

    pub fn get_device_info(&self, addr: BdAddr, transport: Transport) -> Option<DeviceInfo> {
        self.lookup(DeviceId::new(addr, transport))
            .map(|device| lock(&device).snapshot())
    }

    pub fn get_encryption_info(&self, addr: BdAddr, transport: Transport) -> Option<bool> {
        self.lookup(DeviceId::new(addr, transport))
            .map(|device| lock(&device).encrypted)
    }

    /// Snapshot of every registered device.
    pub fn get_devices(&self) -> Vec<DeviceInfo> {
        let registry = lock(&self.registry);
        registry
            .devices
            .values()
            .map(|device| lock(device).snapshot())
            .collect()
    }

    pub fn max_connections(&self, transport: Transport) -> usize {
        match transport {
            Transport::Le => self.config.max_le_connections,
            Transport::Classic => self.config.max_classic_connections,
        }
    }

    fn check_transport_enabled(&self, transport: Transport) -> Result<(), ConnectionError> {
        let enabled = match transport {
            Transport::Le => self.config.le_enabled,
            Transport::Classic => self.config.classic_enabled,
        };
        if enabled {
            Ok(())
        } else {
            Err(ConnectionError::TransportDisabled(transport))
        }
    }

    fn try_register_inbound(&self, id: DeviceId, addr_type: AddressType, role: LinkRole) -> bool {
        let mut registry = lock(&self.registry);
        let active = registry
            .devices
            .keys()
            .filter(|key| key.transport == id.transport)
            .count();
        if active >= self.max_connections(id.transport) {
            return false;
        }
        let mut device = Device::new(id, addr_type, false);
        device.role = role;
        device.state = ConnectionState::Connecting;
        registry.devices.insert(id, Arc::new(Mutex::new(device)));
        true
    }

    fn lookup(&self, id: DeviceId) -> Option<Arc<Mutex<Device>>> {
        lock(&self.registry).devices.get(&id).map(Arc::clone)
    }

    fn id_by_handle(&self, handle: ConnectionHandle) -> Option<DeviceId> {
        lock(&self.registry).by_handle.get(&handle).copied()
    }

    fn post_event(self: &Arc<Self>, id: DeviceId, event: StateEvent) {
        let this = Arc::clone(self);
        self.dispatcher.post(move || this.drive(id, event));
    }

    /// Runs one state-machine step for `id`. Dispatcher thread only.
    fn drive(self: &Arc<Self>, id: DeviceId, event: StateEvent) {
        let device = match self.lookup(id) {
            Some(device) => device,
            None => return,
        };

        let mut outcome = Outcome::default();
        let snapshot = {
            let mut dev = lock(&device);
            self.transition(&mut dev, event, &mut outcome);
            dev.snapshot()
        };

        if outcome.map_handle.is_some() || outcome.unmap_handle.is_some() || outcome.remove {
            let mut registry = lock(&self.registry);
            if let Some(handle) = outcome.unmap_handle {
                registry.by_handle.remove(&handle);
            }
            if let Some(handle) = outcome.map_handle {
                registry.by_handle.insert(handle, id);
            }
            if outcome.remove {
                registry.devices.remove(&id);
            }
        }

        for event in outcome.events {
            self.notify(&snapshot, event);
        }
        if outcome.repost_connect {
            self.post_event(id, StateEvent::Connect);
        }
        if outcome.repost_reconnect {
            self.post_event(id, StateEvent::Reconnect);
        }
    }

    fn transition(&self, dev: &mut Device, event: StateEvent, out: &mut Outcome) {
        use ConnectionState::*;

        match event {
            StateEvent::Connect => match dev.state {
                Idle | Disconnected => self.start_connect(dev, out),
                _ => debug!("connect ignored in state {:?}", dev.state),
            },
            StateEvent::Reconnect => {
                if dev.state == Connecting {
                    self.start_connect(dev, out);
                }
            }
            StateEvent::ConnectComplete { status, handle, role } => match dev.state {
                Connecting => {
                    if status == STATUS_SUCCESS {
                        dev.state = Connected;
                        dev.handle = Some(handle);
                        dev.role = role;
                        dev.retry_count = 0;
                        out.map_handle = Some(handle);
                        out.events.push(ConnectionEvent::Connected { handle });
                        info!("{} connected, handle 0x{:04X}", dev.id.addr, handle);
                    } else if self.should_retry(dev, status) {
                        dev.retry_count += 1;
                        debug!(
                            "{} connect failed with 0x3E, retry {}/{}",
                            dev.id.addr, dev.retry_count, self.config.connect_retry_limit
                        );
                        out.repost_reconnect = true;
                    } else {
                        dev.retry_count = 0;
                        self.enter_disconnected(dev, status, out);
                    }
                }
                Connected => {
                    if status == STATUS_SUCCESS {
                        dev.handle = Some(handle);
                        out.map_handle = Some(handle);
                        out.events.push(ConnectionEvent::Reconnected { handle });
                    }
                }
                _ => {}
            },
            StateEvent::Disconnect => match dev.state {
                Connecting => {
                    let _ = self.transport.connect_cancel(dev.id.addr);
                    self.enter_disconnected(dev, REASON_LOCAL_TERMINATION, out);
                }
                Connected => {
                    let handle = match dev.handle {
                        Some(handle) => handle,
                        None => return,
                    };
                    match self.transport.disconnect(handle) {
                        Ok(()) => {
                            dev.state = Disconnecting;
                            out.events.push(ConnectionEvent::Disconnecting);
                        }
                        Err(err) => warn!("disconnect command failed: {}", err),
                    }
                }
                _ => debug!("disconnect ignored in state {:?}", dev.state),
            },
            StateEvent::DisconnectComplete { status, reason } => match dev.state {
                Disconnecting => {
                    if status == STATUS_SUCCESS {
                        self.enter_disconnected(dev, reason, out);
                    } else {
                        warn!("disconnect failed (status 0x{:02X}), link stays up", status);
                        dev.state = Connected;
                    }
                }
                Connected => self.enter_disconnected(dev, reason, out),
                Connecting => {
                    // A connect attempt can also die late with a
                    // disconnect-complete; the 0x3E retry budget applies.
                    if self.should_retry(dev, reason) {
                        dev.retry_count += 1;
                        out.repost_reconnect = true;
                    } else {
                        dev.retry_count = 0;
                        self.enter_disconnected(dev, reason, out);
                    }
                }
                _ => {}
            },
            StateEvent::RequestPriority(priority) => {
                if dev.state == Connected && dev.id.transport == Transport::Le {
                    if let Some(handle) = dev.handle {
                        let params = self.config.priority_preset(priority);
                        if let Err(err) =
                            self.transport.update_connection_parameters(handle, &params)
                        {
                            warn!("connection parameter update failed: {}", err);
                        }
                    }
                }
            }
            StateEvent::ParametersUpdated {
                status,
                interval,
                latency,
                supervision_timeout,
            } => {
                if status == STATUS_SUCCESS && dev.state == Connected {
                    out.events.push(ConnectionEvent::ParametersUpdated {
                        interval,
                        latency,
                        supervision_timeout,
                    });
                }
            }
        }
    }

    fn start_connect(&self, dev: &mut Device, out: &mut Outcome) {
        match self
            .transport
            .connect(dev.id.addr, dev.addr_type, dev.id.transport)
        {
            Ok(()) => {
                if dev.state != ConnectionState::Connecting {
                    dev.state = ConnectionState::Connecting;
                    out.events.push(ConnectionEvent::Connecting);
                }
            }
            Err(err) => {
                warn!("connect command for {} failed: {}", dev.id.addr, err);
                // The command never reached the controller; auto-connect is
                // not re-armed, the device is dropped.
                dev.auto_connect = false;
                self.enter_disconnected(dev, REASON_INTERNAL, out);
            }
        }
    }

    /// Entry actions for Disconnected: reset the MTU record and handle,
    /// notify, then either re-arm auto-reconnect or drop the device.
    fn enter_disconnected(&self, dev: &mut Device, reason: u8, out: &mut Outcome) {
        dev.state = ConnectionState::Disconnected;
        if let Some(handle) = dev.handle.take() {
            out.unmap_handle = Some(handle);
        }
        dev.mtu = default_mtu(dev.id.transport);
        dev.encrypted = false;
        out.events.push(ConnectionEvent::Disconnected { reason });

        if dev.auto_connect {
            out.repost_connect = true;
        } else {
            out.remove = true;
        }
    }

    fn should_retry(&self, dev: &Device, reason: u8) -> bool {
        dev.id.transport == Transport::Le
            && dev.role == LinkRole::Central
            && reason == REASON_CONNECTION_FAILED_TO_BE_ESTABLISHED
            && dev.retry_count < self.config.connect_retry_limit
    }

    fn notify(&self, info: &DeviceInfo, event: ConnectionEvent) {
        let observers: Vec<Arc<dyn ConnectionObserver>> = lock(&self.observers)
            .iter()
            .flatten()
            .map(Arc::clone)
            .collect();
        for observer in observers {
            observer.on_connection_event(info, event);
        }
    }
}

impl LinkInfoSource for ConnectionManager {
    fn link_transport(&self, handle: ConnectionHandle) -> Option<Transport> {
        self.id_by_handle(handle).map(|id| id.transport)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;

    use super::*;
    use crate::transport::ConnectionParameters;
    use crate::transport::TransportError;

    const ADDR: BdAddr = BdAddr {
        bytes: [0x01, 0x02, 0x03, 0x04, 0x05, 0x06],
    };
    const HANDLE: ConnectionHandle = 0x0010;

    #[derive(Default)]
    struct MockLink {
        connects: AtomicUsize,
        cancels: AtomicUsize,
        disconnects: AtomicUsize,
        updates: AtomicUsize,
        reject_connects: AtomicBool,
    }

    impl TransportSink for MockLink {
        fn connect(
            &self,
            _addr: BdAddr,
            _addr_type: AddressType,
            _transport: Transport,
        ) -> Result<(), TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.reject_connects.load(Ordering::SeqCst) {
                return Err(TransportError::Rejected("connect refused"));
            }
            Ok(())
        }

        fn connect_cancel(&self, _addr: BdAddr) -> Result<(), TransportError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect(&self, _handle: ConnectionHandle) -> Result<(), TransportError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn send_att(&self, _handle: ConnectionHandle, _pdu: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        fn update_connection_parameters(
            &self,
            _handle: ConnectionHandle,
            _params: &ConnectionParameters,
        ) -> Result<(), TransportError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ConnectionEvent>>,
    }

    impl ConnectionObserver for Recorder {
        fn on_connection_event(&self, _device: &DeviceInfo, event: ConnectionEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    struct Harness {
        manager: Arc<ConnectionManager>,
        link: Arc<MockLink>,
        observer: Arc<Recorder>,
        dispatcher: Arc<Dispatcher>,
    }

    impl Harness {
        fn new(config: ConnectionConfig) -> Self {
            let dispatcher = Arc::new(Dispatcher::new("test"));
            let link = Arc::new(MockLink::default());
            let manager =
                ConnectionManager::new(config, link.clone(), Arc::clone(&dispatcher));
            let observer = Arc::new(Recorder::default());
            manager.register_observer(observer.clone()).unwrap();
            Harness {
                manager,
                link,
                observer,
                dispatcher,
            }
        }

        /// Blocks until every task queued so far has run.
        fn settle(&self) {
            let (tx, rx) = mpsc::channel();
            self.dispatcher.post(move || {
                let _ = tx.send(());
            });
            rx.recv().unwrap();
        }

        fn connect_complete(&self, status: u8, role: LinkRole) {
            self.manager.handle_transport_event(TransportEvent::ConnectComplete {
                status,
                handle: HANDLE,
                addr: ADDR,
                addr_type: AddressType::Public,
                transport: Transport::Le,
                role,
            });
        }

        fn events(&self) -> Vec<ConnectionEvent> {
            self.observer.events.lock().unwrap().clone()
        }
    }

    #[test]
    fn connect_establishes_and_maps_the_handle() {
        let h = Harness::new(ConnectionConfig::default());
        h.manager
            .connect(ADDR, AddressType::Public, Transport::Le, false)
            .unwrap();
        h.settle();
        assert_eq!(h.link.connects.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.manager.get_device_state(ADDR, Transport::Le),
            Some(ConnectionState::Connecting)
        );

        h.connect_complete(STATUS_SUCCESS, LinkRole::Central);
        h.settle();
        assert_eq!(
            h.manager.get_device_state(ADDR, Transport::Le),
            Some(ConnectionState::Connected)
        );
        assert_eq!(h.manager.link_transport(HANDLE), Some(Transport::Le));
        assert_eq!(
            h.events(),
            vec![
                ConnectionEvent::Connecting,
                ConnectionEvent::Connected { handle: HANDLE },
            ]
        );
    }

    #[test]
    fn disconnect_tears_down_and_forgets_the_device() {
        let h = Harness::new(ConnectionConfig::default());
        h.manager
            .connect(ADDR, AddressType::Public, Transport::Le, false)
            .unwrap();
        h.settle();
        h.connect_complete(STATUS_SUCCESS, LinkRole::Central);

        h.manager.disconnect(ADDR, Transport::Le).unwrap();
        h.settle();
        assert_eq!(h.link.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.manager.get_device_state(ADDR, Transport::Le),
            Some(ConnectionState::Disconnecting)
        );

        h.manager.handle_transport_event(TransportEvent::DisconnectComplete {
            status: STATUS_SUCCESS,
            handle: HANDLE,
            reason: 0x16,
        });
        h.settle();
        assert_eq!(h.manager.get_device_state(ADDR, Transport::Le), None);
        assert_eq!(h.manager.link_transport(HANDLE), None);
        assert!(h
            .events()
            .contains(&ConnectionEvent::Disconnected { reason: 0x16 }));
    }

    #[test]
    fn disconnect_of_an_unregistered_device_fails() {
        let h = Harness::new(ConnectionConfig::default());
        assert_eq!(
            h.manager.disconnect(ADDR, Transport::Le),
            Err(ConnectionError::UnknownDevice)
        );
    }

    #[test]
    fn disconnect_complete_for_an_unknown_handle_is_ignored() {
        let h = Harness::new(ConnectionConfig::default());
        h.manager.handle_transport_event(TransportEvent::DisconnectComplete {
            status: STATUS_SUCCESS,
            handle: 0x0099,
            reason: 0x13,
        });
        h.settle();
        assert!(h.events().is_empty());
    }

    #[test]
    fn failed_connects_retry_within_the_budget() {
        let config = ConnectionConfig {
            connect_retry_limit: 2,
            ..ConnectionConfig::default()
        };
        let h = Harness::new(config);
        h.manager
            .connect(ADDR, AddressType::Public, Transport::Le, false)
            .unwrap();
        h.settle();

        // Two silent retries on "failed to be established", then give up.
        for _ in 0..2 {
            h.connect_complete(REASON_CONNECTION_FAILED_TO_BE_ESTABLISHED, LinkRole::Central);
            h.settle();
        }
        assert_eq!(h.link.connects.load(Ordering::SeqCst), 3);
        assert_eq!(
            h.manager.get_device_state(ADDR, Transport::Le),
            Some(ConnectionState::Connecting)
        );

        h.connect_complete(REASON_CONNECTION_FAILED_TO_BE_ESTABLISHED, LinkRole::Central);
        h.settle();
        assert_eq!(h.link.connects.load(Ordering::SeqCst), 3);
        assert_eq!(h.manager.get_device_state(ADDR, Transport::Le), None);
        assert!(h.events().contains(&ConnectionEvent::Disconnected {
            reason: REASON_CONNECTION_FAILED_TO_BE_ESTABLISHED
        }));
    }

    #[test]
    fn auto_connect_rearms_after_a_remote_drop() {
        let h = Harness::new(ConnectionConfig::default());
        h.manager
            .connect(ADDR, AddressType::Public, Transport::Le, true)
            .unwrap();
        h.settle();
        h.connect_complete(STATUS_SUCCESS, LinkRole::Central);
        h.settle();

        h.manager.handle_transport_event(TransportEvent::DisconnectComplete {
            status: STATUS_SUCCESS,
            handle: HANDLE,
            reason: 0x08,
        });
        h.settle();
        assert_eq!(h.link.connects.load(Ordering::SeqCst), 2);
        assert_eq!(
            h.manager.get_device_state(ADDR, Transport::Le),
            Some(ConnectionState::Connecting)
        );
    }

    #[test]
    fn rejected_connect_commands_do_not_rearm_auto_connect() {
        let h = Harness::new(ConnectionConfig::default());
        h.link.reject_connects.store(true, Ordering::SeqCst);
        h.manager
            .connect(ADDR, AddressType::Public, Transport::Le, true)
            .unwrap();
        h.settle();

        // One attempt, one terminal Disconnected, no reposted Connect.
        assert_eq!(h.link.connects.load(Ordering::SeqCst), 1);
        assert_eq!(h.manager.get_device_state(ADDR, Transport::Le), None);
        assert_eq!(
            h.events(),
            vec![ConnectionEvent::Disconnected {
                reason: REASON_INTERNAL
            }]
        );
    }

    #[test]
    fn disconnect_while_connecting_cancels_the_attempt() {
        let h = Harness::new(ConnectionConfig::default());
        h.manager
            .connect(ADDR, AddressType::Public, Transport::Le, false)
            .unwrap();
        h.settle();

        h.manager.disconnect(ADDR, Transport::Le).unwrap();
        h.settle();
        assert_eq!(h.link.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(h.manager.get_device_state(ADDR, Transport::Le), None);
    }

    #[test]
    fn per_transport_capacity_is_enforced() {
        let config = ConnectionConfig {
            max_le_connections: 1,
            ..ConnectionConfig::default()
        };
        let h = Harness::new(config);
        h.manager
            .connect(ADDR, AddressType::Public, Transport::Le, false)
            .unwrap();
        let other = BdAddr::new([9, 9, 9, 9, 9, 9]);
        assert_eq!(
            h.manager.connect(other, AddressType::Public, Transport::Le, false),
            Err(ConnectionError::MaxConnections(Transport::Le))
        );
        // Re-connecting a registered device never counts against the cap.
        assert!(h
            .manager
            .connect(ADDR, AddressType::Public, Transport::Le, false)
            .is_ok());
        h.settle();
    }

    #[test]
    fn disabled_transport_rejects_connects() {
        let config = ConnectionConfig {
            classic_enabled: false,
            ..ConnectionConfig::default()
        };
        let h = Harness::new(config);
        assert_eq!(
            h.manager
                .connect(ADDR, AddressType::Public, Transport::Classic, false),
            Err(ConnectionError::TransportDisabled(Transport::Classic))
        );
    }

    #[test]
    fn inbound_links_register_on_first_sight() {
        let h = Harness::new(ConnectionConfig::default());
        h.connect_complete(STATUS_SUCCESS, LinkRole::Peripheral);
        h.settle();
        let info = h.manager.get_device_info(ADDR, Transport::Le).unwrap();
        assert_eq!(info.state, ConnectionState::Connected);
        assert_eq!(info.role, LinkRole::Peripheral);
        assert_eq!(h.manager.link_transport(HANDLE), Some(Transport::Le));
    }

    #[test]
    fn priority_requests_need_a_connected_le_link() {
        let h = Harness::new(ConnectionConfig::default());
        assert_eq!(
            h.manager
                .request_connection_priority(HANDLE, ConnectionPriority::High),
            Err(ConnectionError::UnknownDevice)
        );

        h.manager
            .connect(ADDR, AddressType::Public, Transport::Le, false)
            .unwrap();
        h.settle();
        h.connect_complete(STATUS_SUCCESS, LinkRole::Central);
        h.settle();
        h.manager
            .request_connection_priority(HANDLE, ConnectionPriority::High)
            .unwrap();
        h.settle();
        assert_eq!(h.link.updates.load(Ordering::SeqCst), 1);
    }
}
