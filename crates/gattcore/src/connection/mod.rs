//! Connection lifecycle: device registry, per-device state machines and
//! observer fan-out.

pub mod manager;
pub mod types;

pub use manager::{ConnectionManager, LinkInfoSource, MAX_OBSERVERS};
pub use types::{
    ConnectionEvent, ConnectionObserver, ConnectionPriority, ConnectionState, DeviceId, DeviceInfo,
};
