//! The typed boundary to the native link layer.
//!
//! Outbound commands go through the [`TransportSink`] trait, implemented by
//! whatever adapter owns the real controller (or by a mock in tests). Inbound
//! traffic arrives as owned [`TransportEvent`] values, decoded exactly once;
//! nothing in the core ever sees a raw callback context or a borrowed
//! controller buffer.

use std::fmt;

use thiserror::Error;

use crate::att::pdu::AttPdu;

/// Native connection handle, assigned by the controller per link.
pub type ConnectionHandle = u16;

/// Link-layer status code meaning success.
pub const STATUS_SUCCESS: u8 = 0x00;

/// Link-layer failure reason "connection failed to be established". An LE
/// connect attempt that dies with this reason is eligible for a silent retry
/// (see the lifecycle manager's retry budget).
pub const REASON_CONNECTION_FAILED_TO_BE_ESTABLISHED: u8 = 0x3E;

/// A 48-bit Bluetooth device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Addresses print most-significant byte first.
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5], self.bytes[4], self.bytes[3], self.bytes[2], self.bytes[1], self.bytes[0]
        )
    }
}

/// Device address type as carried by LE link-layer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
}

impl Default for AddressType {
    fn default() -> Self {
        AddressType::Public
    }
}

/// Which physical transport a link runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Bluetooth Low Energy (ACL over LE)
    Le,
    /// BR/EDR ("classic")
    Classic,
}

/// Local role on an established link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// Locally initiated (central / master)
    Central,
    /// Remotely initiated (peripheral / slave)
    Peripheral,
}

/// LE connection parameter set, as requested from or reported by the link
/// layer. Units follow the controller convention (interval in 1.25 ms steps,
/// timeout in 10 ms steps).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionParameters {
    pub interval_min: u16,
    pub interval_max: u16,
    pub latency: u16,
    pub supervision_timeout: u16,
}

/// Errors surfaced by the transport adapter when a command is rejected
/// before leaving the host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport for {0:?} links is not available")]
    Unavailable(Transport),

    #[error("no link with handle 0x{0:04X}")]
    UnknownHandle(ConnectionHandle),

    #[error("link layer rejected the command: {0}")]
    Rejected(&'static str),
}

/// Outbound command boundary. One implementation per platform adapter; the
/// core holds it behind `Arc<dyn TransportSink>` and never blocks in it.
pub trait TransportSink: Send + Sync {
    /// Initiates a connection to `addr` over `transport`.
    fn connect(&self, addr: BdAddr, addr_type: AddressType, transport: Transport)
        -> Result<(), TransportError>;

    /// Cancels a connect attempt still in flight.
    fn connect_cancel(&self, addr: BdAddr) -> Result<(), TransportError>;

    /// Tears down an established link.
    fn disconnect(&self, handle: ConnectionHandle) -> Result<(), TransportError>;

    /// Queues one serialized ATT PDU on the link. Completion is reported
    /// asynchronously via [`TransportEvent::SendConfirm`].
    fn send_att(&self, handle: ConnectionHandle, pdu: &[u8]) -> Result<(), TransportError>;

    /// Requests an LE connection-parameter update.
    fn update_connection_parameters(
        &self,
        handle: ConnectionHandle,
        params: &ConnectionParameters,
    ) -> Result<(), TransportError>;
}

/// Inbound event boundary. The adapter builds these on its own thread and
/// hands them to the stack, which marshals them onto the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A connect attempt finished (locally or remotely initiated).
    ConnectComplete {
        status: u8,
        handle: ConnectionHandle,
        addr: BdAddr,
        addr_type: AddressType,
        transport: Transport,
        role: LinkRole,
    },
    /// A link went down, or a connect attempt failed late.
    DisconnectComplete {
        status: u8,
        handle: ConnectionHandle,
        reason: u8,
    },
    /// The peer or controller changed the LE connection parameters.
    ConnectionParameterUpdate {
        status: u8,
        handle: ConnectionHandle,
        interval: u16,
        latency: u16,
        supervision_timeout: u16,
    },
    /// One inbound ATT PDU, already decoded.
    AttReceived {
        handle: ConnectionHandle,
        pdu: AttPdu,
    },
    /// The queued PDU with `opcode` was handed to the controller (or failed).
    SendConfirm {
        handle: ConnectionHandle,
        opcode: u8,
        ok: bool,
    },
    /// The ATT transaction timer fired for the outstanding request with
    /// `opcode` on this link.
    TransactionTimeout {
        handle: ConnectionHandle,
        opcode: u8,
    },
}
