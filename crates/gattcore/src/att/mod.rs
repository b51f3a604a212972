//! ATT (Attribute Protocol) layer: constants, error taxonomy, the
//! bounds-checked wire codec and the typed PDU set.

pub mod codec;
pub mod constants;
pub mod error;
pub mod pdu;

pub use codec::{Cursor, Writer};
pub use error::{AttError, AttErrorCode, AttResult};
pub use pdu::{AttPacket, AttPdu};
