//! Data types for the connection lifecycle manager.

use crate::att::constants::{ATT_BREDR_DEFAULT_MTU, ATT_DEFAULT_MTU};
use crate::transport::{AddressType, BdAddr, ConnectionHandle, LinkRole, Transport};

/// Per-device lifecycle state. `Idle` is the construction-time state;
/// `Disconnected` is re-enterable because auto-reconnect may immediately
/// re-issue a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// LE connection priority tiers, translated to concrete parameter presets
/// by the manager's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPriority {
    LowPower,
    Balanced,
    High,
}

/// Registry key: at most one device exists per (address, transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub addr: BdAddr,
    pub transport: Transport,
}

impl DeviceId {
    pub fn new(addr: BdAddr, transport: Transport) -> Self {
        DeviceId { addr, transport }
    }
}

/// Lifecycle and parameter-change notifications fanned out to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connecting,
    Connected {
        handle: ConnectionHandle,
    },
    /// Duplicate connect-complete while already connected.
    Reconnected {
        handle: ConnectionHandle,
    },
    Disconnecting,
    /// `reason` is the link-layer reason, or the failing status when a
    /// connect attempt never established.
    Disconnected {
        reason: u8,
    },
    ParametersUpdated {
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
}

/// Observer callback boundary. Events are delivered from the dispatcher
/// thread; implementations must not block.
pub trait ConnectionObserver: Send + Sync {
    fn on_connection_event(&self, device: &DeviceInfo, event: ConnectionEvent);
}

/// Read-only snapshot of a registered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub addr: BdAddr,
    pub addr_type: AddressType,
    pub transport: Transport,
    pub state: ConnectionState,
    pub role: LinkRole,
    pub handle: Option<ConnectionHandle>,
    pub mtu: u16,
    pub auto_connect: bool,
    pub encrypted: bool,
}

/// One registered device and its state-machine fields. Guarded by a
/// per-device mutex in the registry.
#[derive(Debug)]
pub(crate) struct Device {
    pub id: DeviceId,
    pub addr_type: AddressType,
    pub auto_connect: bool,
    pub role: LinkRole,
    pub retry_count: u8,
    pub mtu: u16,
    pub handle: Option<ConnectionHandle>,
    pub state: ConnectionState,
    pub encrypted: bool,
}

impl Device {
    pub fn new(id: DeviceId, addr_type: AddressType, auto_connect: bool) -> Self {
        Device {
            id,
            addr_type,
            auto_connect,
            role: LinkRole::Central,
            retry_count: 0,
            mtu: default_mtu(id.transport),
            handle: None,
            state: ConnectionState::Idle,
            encrypted: false,
        }
    }

    pub fn snapshot(&self) -> DeviceInfo {
        DeviceInfo {
            addr: self.id.addr,
            addr_type: self.addr_type,
            transport: self.id.transport,
            state: self.state,
            role: self.role,
            handle: self.handle,
            mtu: self.mtu,
            auto_connect: self.auto_connect,
            encrypted: self.encrypted,
        }
    }
}

/// The MTU a link starts from before (or instead of) an exchange.
pub fn default_mtu(transport: Transport) -> u16 {
    match transport {
        Transport::Le => ATT_DEFAULT_MTU,
        Transport::Classic => ATT_BREDR_DEFAULT_MTU,
    }
}
