//! Shared GATT data types: permission/property flags, discovered entries and
//! the records served by an attribute store.

use bitflags::bitflags;

use crate::uuid::Uuid;

/// Application-supplied identifier echoed back on every per-operation
/// callback.
pub type RequestId = u32;

bitflags! {
    /// Characteristic property bits from the declaration attribute.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

bitflags! {
    /// Attribute permission bits stored with each attribute.
    ///
    /// The engine enforces the read/write, encrypted and authenticated bits.
    /// The authorized bits are informational only: authorization is decided
    /// by the application, which answers a deferred read/write with
    /// `InsufficientAuthorization` to deny access.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttPermissions: u16 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const READ_ENCRYPTED = 0x0004;
        const WRITE_ENCRYPTED = 0x0008;
        const READ_AUTHENTICATED = 0x0010;
        const WRITE_AUTHENTICATED = 0x0020;
        const READ_AUTHORIZED = 0x0040;
        const WRITE_AUTHORIZED = 0x0080;
    }
}

impl AttPermissions {
    pub fn can_read(&self) -> bool {
        self.contains(AttPermissions::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(AttPermissions::WRITE)
    }
}

bitflags! {
    /// Client Characteristic Configuration value bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CccdFlags: u16 {
        const NOTIFICATION = 0x0001;
        const INDICATION = 0x0002;
    }
}

/// Per-connection MTU record: negotiated size plus whether an exchange has
/// happened. Reset to the transport default on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtuRecord {
    pub exchanged: bool,
    pub mtu: u16,
}

impl MtuRecord {
    pub fn new(mtu: u16) -> Self {
        MtuRecord {
            exchanged: false,
            mtu,
        }
    }
}

// --- Entries accumulated by client-side discovery ---

/// A discovered primary or secondary service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceEntry {
    pub handle: u16,
    pub end_group_handle: u16,
    pub uuid: Uuid,
}

/// A discovered include declaration. The UUID is only present on the wire
/// for 16-bit service types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncludeEntry {
    pub handle: u16,
    pub included_service_handle: u16,
    pub end_group_handle: u16,
    pub uuid: Option<Uuid>,
}

/// A discovered characteristic declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicEntry {
    pub declaration_handle: u16,
    pub value_handle: u16,
    pub properties: CharacteristicProperties,
    pub uuid: Uuid,
}

/// A discovered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorEntry {
    pub handle: u16,
    pub uuid: Uuid,
}

/// Per-connection accumulation buffers for paged discovery results. Each
/// list fills across pages and is drained when its operation completes.
#[derive(Debug, Default)]
pub struct DiscoveryCache {
    pub services: Vec<ServiceEntry>,
    pub includes: Vec<IncludeEntry>,
    pub characteristics: Vec<CharacteristicEntry>,
    pub descriptors: Vec<DescriptorEntry>,
}

// --- Records served by an attribute store (server side) ---

/// A service definition row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub handle: u16,
    pub end_handle: u16,
    pub uuid: Uuid,
    pub primary: bool,
}

/// An include definition row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeRecord {
    pub handle: u16,
    pub included_service_handle: u16,
    pub end_group_handle: u16,
    pub uuid: Option<Uuid>,
}

/// A characteristic definition row. `value` is `None` when the application
/// owns the bytes and must be called back for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicRecord {
    pub declaration_handle: u16,
    pub value_handle: u16,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttPermissions,
    pub value: Option<Vec<u8>>,
}

impl CharacteristicRecord {
    /// The declaration attribute's value: properties, value handle, UUID.
    pub fn declaration_value(&self) -> Vec<u8> {
        let mut value = Vec::with_capacity(3 + self.uuid.wire_len());
        value.push(self.properties.bits());
        value.extend_from_slice(&self.value_handle.to_le_bytes());
        value.extend_from_slice(&self.uuid.to_wire());
        value
    }
}

/// A descriptor definition row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorRecord {
    pub handle: u16,
    pub uuid: Uuid,
    pub permissions: AttPermissions,
    pub value: Option<Vec<u8>>,
}

/// One queued prepare-write fragment, replayed in arrival order on commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedWrite {
    pub handle: u16,
    pub offset: u16,
    pub part: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_value_layout() {
        let record = CharacteristicRecord {
            declaration_handle: 0x0002,
            value_handle: 0x0003,
            uuid: Uuid::from_u16(0x2A00),
            properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            permissions: AttPermissions::READ,
            value: None,
        };
        assert_eq!(record.declaration_value(), vec![0x12, 0x03, 0x00, 0x00, 0x2A]);
    }

    #[test]
    fn permission_helpers() {
        let perms = AttPermissions::READ | AttPermissions::WRITE_ENCRYPTED;
        assert!(perms.can_read());
        assert!(!perms.can_write());
    }
}
