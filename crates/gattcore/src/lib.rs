//! GATT transaction engine for a Bluetooth host stack.
//!
//! The crate is organised around three cooperating services, all constructed
//! at the composition root ([`GattStack`]) and driven by a single dispatcher
//! thread:
//!
//! - [`ConnectionManager`] owns device registration and the per-device
//!   lifecycle state machine (connect, auto-reconnect, disconnect).
//! - [`ClientEngine`] sequences outbound GATT operations into ATT request
//!   chains: MTU exchange, the discovery family, long reads and writes,
//!   reliable writes.
//! - [`ServerEngine`] answers inbound requests against an
//!   [`AttributeStore`], enforcing permissions and managing subscriptions,
//!   the prepare queue and indications.
//!
//! The transport below is abstracted behind [`TransportSink`] (outbound
//! commands) and [`TransportEvent`] (inbound completions and traffic), so
//! the engines can be exercised against a mock link in tests.

pub mod att;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod gatt;
pub mod stack;
pub mod transport;
pub mod uuid;

pub use att::{AttError, AttErrorCode, AttPacket, AttPdu, AttResult};
pub use config::{ConnectionConfig, ServerConfig};
pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionObserver, ConnectionPriority, ConnectionState,
    DeviceId, DeviceInfo,
};
pub use dispatch::Dispatcher;
pub use error::{ConnectionError, GattError};
pub use gatt::{
    AttPermissions, AttributeStore, CccdFlags, CharacteristicEntry, CharacteristicProperties,
    CharacteristicRecord, ClientEngine, ClientEventHandler, DescriptorEntry, DescriptorRecord,
    DiscoveryCache, IncludeEntry, IncludeRecord, MtuRecord, QueuedWrite, RequestId, ServerEngine,
    ServerEventHandler, ServiceEntry, ServiceRecord, StaticStore,
};
pub use stack::GattStack;
pub use transport::{
    AddressType, BdAddr, ConnectionHandle, ConnectionParameters, LinkRole, Transport,
    TransportError, TransportEvent, TransportSink,
};
pub use uuid::Uuid;
