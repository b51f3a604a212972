//! GATT transaction engines: client-side operation sequencing and the
//! server-side request answering machinery, plus the shared data types.

pub mod client;
pub mod server;
pub mod types;

#[cfg(test)]
mod tests;

pub use client::{ClientEngine, ClientEventHandler};
pub use server::{AttributeStore, ServerEngine, ServerEventHandler, StaticStore};
pub use types::{
    AttPermissions, CccdFlags, CharacteristicEntry, CharacteristicProperties,
    CharacteristicRecord, DescriptorEntry, DescriptorRecord, DiscoveryCache, IncludeEntry,
    IncludeRecord, MtuRecord, QueuedWrite, RequestId, ServiceEntry, ServiceRecord,
};
