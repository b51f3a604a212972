//! ATT PDU value types.
//!
//! Each request/response is an owned struct implementing [`AttPacket`];
//! inbound traffic is decoded exactly once at the transport boundary into the
//! [`AttPdu`] sum type and dispatched by variant from then on. Serialization
//! always produces the full PDU including the opcode byte, and `parse`
//! verifies the opcode it was handed.

use super::codec::{Cursor, Writer};
use super::constants::*;
use super::error::{AttError, AttErrorCode, AttResult};
use crate::uuid::Uuid;

/// A parseable/serializable ATT PDU.
pub trait AttPacket: Sized {
    /// The opcode identifying this PDU on the wire.
    fn opcode() -> u8;

    /// Parses a full PDU (opcode byte included).
    fn parse(data: &[u8]) -> AttResult<Self>;

    /// Serializes the full PDU (opcode byte included).
    fn serialize(&self) -> Vec<u8>;
}

fn expect_opcode(data: &[u8], expected: u8) -> AttResult<Cursor<'_>> {
    let mut cursor = Cursor::new(data);
    let actual = cursor.read_u8()?;
    if actual != expected {
        return Err(AttError::UnexpectedOpcode { expected, actual });
    }
    Ok(cursor)
}

/// Error Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub request_opcode: u8,
    pub handle: u16,
    pub error_code: AttErrorCode,
}

impl AttPacket for ErrorResponse {
    fn opcode() -> u8 {
        ATT_ERROR_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_ERROR_RSP)?;
        Ok(ErrorResponse {
            request_opcode: cursor.read_u8()?,
            handle: cursor.read_u16()?,
            error_code: AttErrorCode::from(cursor.read_u8()?),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(5);
        writer
            .write_u8(ATT_ERROR_RSP)
            .write_u8(self.request_opcode)
            .write_u16(self.handle)
            .write_u8(self.error_code.into());
        writer.into_inner()
    }
}

/// Exchange MTU Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeMtuRequest {
    pub client_mtu: u16,
}

impl AttPacket for ExchangeMtuRequest {
    fn opcode() -> u8 {
        ATT_EXCHANGE_MTU_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_EXCHANGE_MTU_REQ)?;
        Ok(ExchangeMtuRequest {
            client_mtu: cursor.read_u16()?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(3);
        writer.write_u8(ATT_EXCHANGE_MTU_REQ).write_u16(self.client_mtu);
        writer.into_inner()
    }
}

/// Exchange MTU Response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeMtuResponse {
    pub server_mtu: u16,
}

impl AttPacket for ExchangeMtuResponse {
    fn opcode() -> u8 {
        ATT_EXCHANGE_MTU_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_EXCHANGE_MTU_RSP)?;
        Ok(ExchangeMtuResponse {
            server_mtu: cursor.read_u16()?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(3);
        writer.write_u8(ATT_EXCHANGE_MTU_RSP).write_u16(self.server_mtu);
        writer.into_inner()
    }
}

/// An inclusive attribute handle range. `start` must be non-zero and not
/// exceed `end`; requests carrying a bad range are rejected before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleRange {
    pub start: u16,
    pub end: u16,
}

impl HandleRange {
    pub fn new(start: u16, end: u16) -> AttResult<Self> {
        if start < ATT_HANDLE_MIN || start > end {
            return Err(AttError::InvalidRange(start, end));
        }
        Ok(HandleRange { start, end })
    }

    pub fn validate(&self) -> AttResult<()> {
        if self.start < ATT_HANDLE_MIN || self.start > self.end {
            return Err(AttError::InvalidRange(self.start, self.end));
        }
        Ok(())
    }

    pub fn contains(&self, handle: u16) -> bool {
        handle >= self.start && handle <= self.end
    }
}

/// Find Information Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindInformationRequest {
    pub range: HandleRange,
}

impl AttPacket for FindInformationRequest {
    fn opcode() -> u8 {
        ATT_FIND_INFO_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_FIND_INFO_REQ)?;
        Ok(FindInformationRequest {
            range: HandleRange {
                start: cursor.read_u16()?,
                end: cursor.read_u16()?,
            },
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(5);
        writer
            .write_u8(ATT_FIND_INFO_REQ)
            .write_u16(self.range.start)
            .write_u16(self.range.end);
        writer.into_inner()
    }
}

/// Find Information Response: (handle, type) pairs of a uniform UUID width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindInformationResponse {
    pub pairs: Vec<(u16, Uuid)>,
}

impl FindInformationResponse {
    fn format(&self) -> u8 {
        match self.pairs.first() {
            Some((_, uuid)) if uuid.wire_len() == 16 => ATT_FIND_INFO_FORMAT_128BIT,
            _ => ATT_FIND_INFO_FORMAT_16BIT,
        }
    }
}

impl AttPacket for FindInformationResponse {
    fn opcode() -> u8 {
        ATT_FIND_INFO_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_FIND_INFO_RSP)?;
        let format = cursor.read_u8()?;
        let mut pairs = Vec::new();
        while !cursor.is_empty() {
            let handle = cursor.read_u16()?;
            let uuid = match format {
                ATT_FIND_INFO_FORMAT_16BIT => cursor.read_uuid16()?,
                ATT_FIND_INFO_FORMAT_128BIT => cursor.read_uuid128()?,
                _ => return Err(AttError::Malformed("bad find-information format")),
            };
            pairs.push((handle, uuid));
        }
        if pairs.is_empty() {
            return Err(AttError::Malformed("empty find-information response"));
        }
        Ok(FindInformationResponse { pairs })
    }

    fn serialize(&self) -> Vec<u8> {
        let format = self.format();
        let mut writer = Writer::new();
        writer.write_u8(ATT_FIND_INFO_RSP).write_u8(format);
        for (handle, uuid) in &self.pairs {
            writer.write_u16(*handle);
            if format == ATT_FIND_INFO_FORMAT_128BIT {
                writer.write_uuid128(uuid);
            } else {
                writer.write_uuid(uuid);
            }
        }
        writer.into_inner()
    }
}

/// Find By Type Value Request (only 16-bit attribute types are legal here).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindByTypeValueRequest {
    pub range: HandleRange,
    pub attribute_type: u16,
    pub value: Vec<u8>,
}

impl AttPacket for FindByTypeValueRequest {
    fn opcode() -> u8 {
        ATT_FIND_BY_TYPE_VALUE_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_FIND_BY_TYPE_VALUE_REQ)?;
        Ok(FindByTypeValueRequest {
            range: HandleRange {
                start: cursor.read_u16()?,
                end: cursor.read_u16()?,
            },
            attribute_type: cursor.read_u16()?,
            value: cursor.take_rest().to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(7 + self.value.len());
        writer
            .write_u8(ATT_FIND_BY_TYPE_VALUE_REQ)
            .write_u16(self.range.start)
            .write_u16(self.range.end)
            .write_u16(self.attribute_type)
            .write_slice(&self.value);
        writer.into_inner()
    }
}

/// One entry of a Find By Type Value Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlesInformation {
    pub found_handle: u16,
    pub group_end_handle: u16,
}

/// Find By Type Value Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindByTypeValueResponse {
    pub handles: Vec<HandlesInformation>,
}

impl AttPacket for FindByTypeValueResponse {
    fn opcode() -> u8 {
        ATT_FIND_BY_TYPE_VALUE_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_FIND_BY_TYPE_VALUE_RSP)?;
        let mut handles = Vec::new();
        while !cursor.is_empty() {
            handles.push(HandlesInformation {
                found_handle: cursor.read_u16()?,
                group_end_handle: cursor.read_u16()?,
            });
        }
        if handles.is_empty() {
            return Err(AttError::Malformed("empty find-by-type-value response"));
        }
        Ok(FindByTypeValueResponse { handles })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(1 + self.handles.len() * 4);
        writer.write_u8(ATT_FIND_BY_TYPE_VALUE_RSP);
        for entry in &self.handles {
            writer
                .write_u16(entry.found_handle)
                .write_u16(entry.group_end_handle);
        }
        writer.into_inner()
    }
}

/// Read By Type Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadByTypeRequest {
    pub range: HandleRange,
    pub attribute_type: Uuid,
}

impl AttPacket for ReadByTypeRequest {
    fn opcode() -> u8 {
        ATT_READ_BY_TYPE_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_READ_BY_TYPE_REQ)?;
        let range = HandleRange {
            start: cursor.read_u16()?,
            end: cursor.read_u16()?,
        };
        Ok(ReadByTypeRequest {
            range,
            attribute_type: cursor.read_uuid_rest()?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(5 + self.attribute_type.wire_len());
        writer
            .write_u8(ATT_READ_BY_TYPE_REQ)
            .write_u16(self.range.start)
            .write_u16(self.range.end)
            .write_uuid(&self.attribute_type);
        writer.into_inner()
    }
}

/// One (handle, value) element of a Read By Type Response page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeData {
    pub handle: u16,
    pub value: Vec<u8>,
}

/// Read By Type Response: fixed-size elements, all the same length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByTypeResponse {
    pub items: Vec<AttributeData>,
}

impl AttPacket for ReadByTypeResponse {
    fn opcode() -> u8 {
        ATT_READ_BY_TYPE_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_READ_BY_TYPE_RSP)?;
        let element_len = cursor.read_u8()? as usize;
        if element_len < 3 {
            return Err(AttError::Malformed("read-by-type element too short"));
        }
        let mut items = Vec::new();
        while !cursor.is_empty() {
            let handle = cursor.read_u16()?;
            let value = cursor.read_bytes(element_len - 2)?.to_vec();
            items.push(AttributeData { handle, value });
        }
        if items.is_empty() {
            return Err(AttError::Malformed("empty read-by-type response"));
        }
        Ok(ReadByTypeResponse { items })
    }

    fn serialize(&self) -> Vec<u8> {
        let element_len = self.items.first().map_or(0, |item| item.value.len() + 2);
        let mut writer = Writer::with_capacity(2 + element_len * self.items.len());
        writer.write_u8(ATT_READ_BY_TYPE_RSP).write_u8(element_len as u8);
        for item in &self.items {
            writer.write_u16(item.handle).write_slice(&item.value);
        }
        writer.into_inner()
    }
}

/// Read By Group Type Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadByGroupTypeRequest {
    pub range: HandleRange,
    pub group_type: Uuid,
}

impl AttPacket for ReadByGroupTypeRequest {
    fn opcode() -> u8 {
        ATT_READ_BY_GROUP_TYPE_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_READ_BY_GROUP_TYPE_REQ)?;
        let range = HandleRange {
            start: cursor.read_u16()?,
            end: cursor.read_u16()?,
        };
        Ok(ReadByGroupTypeRequest {
            range,
            group_type: cursor.read_uuid_rest()?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(5 + self.group_type.wire_len());
        writer
            .write_u8(ATT_READ_BY_GROUP_TYPE_REQ)
            .write_u16(self.range.start)
            .write_u16(self.range.end)
            .write_uuid(&self.group_type);
        writer.into_inner()
    }
}

/// One (handle, end-group-handle, value) element of a Read By Group Type
/// Response page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeGroupData {
    pub handle: u16,
    pub group_end_handle: u16,
    pub value: Vec<u8>,
}

/// Read By Group Type Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadByGroupTypeResponse {
    pub items: Vec<AttributeGroupData>,
}

impl AttPacket for ReadByGroupTypeResponse {
    fn opcode() -> u8 {
        ATT_READ_BY_GROUP_TYPE_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_READ_BY_GROUP_TYPE_RSP)?;
        let element_len = cursor.read_u8()? as usize;
        if element_len < 5 {
            return Err(AttError::Malformed("read-by-group-type element too short"));
        }
        let mut items = Vec::new();
        while !cursor.is_empty() {
            let handle = cursor.read_u16()?;
            let group_end_handle = cursor.read_u16()?;
            let value = cursor.read_bytes(element_len - 4)?.to_vec();
            items.push(AttributeGroupData {
                handle,
                group_end_handle,
                value,
            });
        }
        if items.is_empty() {
            return Err(AttError::Malformed("empty read-by-group-type response"));
        }
        Ok(ReadByGroupTypeResponse { items })
    }

    fn serialize(&self) -> Vec<u8> {
        let element_len = self.items.first().map_or(0, |item| item.value.len() + 4);
        let mut writer = Writer::with_capacity(2 + element_len * self.items.len());
        writer
            .write_u8(ATT_READ_BY_GROUP_TYPE_RSP)
            .write_u8(element_len as u8);
        for item in &self.items {
            writer
                .write_u16(item.handle)
                .write_u16(item.group_end_handle)
                .write_slice(&item.value);
        }
        writer.into_inner()
    }
}

/// Read Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub handle: u16,
}

impl AttPacket for ReadRequest {
    fn opcode() -> u8 {
        ATT_READ_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_READ_REQ)?;
        Ok(ReadRequest {
            handle: cursor.read_u16()?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(3);
        writer.write_u8(ATT_READ_REQ).write_u16(self.handle);
        writer.into_inner()
    }
}

/// Read Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub value: Vec<u8>,
}

impl AttPacket for ReadResponse {
    fn opcode() -> u8 {
        ATT_READ_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_READ_RSP)?;
        Ok(ReadResponse {
            value: cursor.take_rest().to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(1 + self.value.len());
        writer.write_u8(ATT_READ_RSP).write_slice(&self.value);
        writer.into_inner()
    }
}

/// Read Blob Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadBlobRequest {
    pub handle: u16,
    pub offset: u16,
}

impl AttPacket for ReadBlobRequest {
    fn opcode() -> u8 {
        ATT_READ_BLOB_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_READ_BLOB_REQ)?;
        Ok(ReadBlobRequest {
            handle: cursor.read_u16()?,
            offset: cursor.read_u16()?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(5);
        writer
            .write_u8(ATT_READ_BLOB_REQ)
            .write_u16(self.handle)
            .write_u16(self.offset);
        writer.into_inner()
    }
}

/// Read Blob Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBlobResponse {
    pub part: Vec<u8>,
}

impl AttPacket for ReadBlobResponse {
    fn opcode() -> u8 {
        ATT_READ_BLOB_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_READ_BLOB_RSP)?;
        Ok(ReadBlobResponse {
            part: cursor.take_rest().to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(1 + self.part.len());
        writer.write_u8(ATT_READ_BLOB_RSP).write_slice(&self.part);
        writer.into_inner()
    }
}

/// Read Multiple Request: two or more handles whose values are concatenated
/// by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMultipleRequest {
    pub handles: Vec<u16>,
}

impl AttPacket for ReadMultipleRequest {
    fn opcode() -> u8 {
        ATT_READ_MULTIPLE_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_READ_MULTIPLE_REQ)?;
        let mut handles = Vec::new();
        while !cursor.is_empty() {
            handles.push(cursor.read_u16()?);
        }
        if handles.len() < 2 {
            return Err(AttError::Malformed("read-multiple needs two handles"));
        }
        Ok(ReadMultipleRequest { handles })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(1 + self.handles.len() * 2);
        writer.write_u8(ATT_READ_MULTIPLE_REQ);
        for handle in &self.handles {
            writer.write_u16(*handle);
        }
        writer.into_inner()
    }
}

/// Read Multiple Response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMultipleResponse {
    pub values: Vec<u8>,
}

impl AttPacket for ReadMultipleResponse {
    fn opcode() -> u8 {
        ATT_READ_MULTIPLE_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_READ_MULTIPLE_RSP)?;
        Ok(ReadMultipleResponse {
            values: cursor.take_rest().to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(1 + self.values.len());
        writer.write_u8(ATT_READ_MULTIPLE_RSP).write_slice(&self.values);
        writer.into_inner()
    }
}

/// Write Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPacket for WriteRequest {
    fn opcode() -> u8 {
        ATT_WRITE_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_WRITE_REQ)?;
        Ok(WriteRequest {
            handle: cursor.read_u16()?,
            value: cursor.take_rest().to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(3 + self.value.len());
        writer
            .write_u8(ATT_WRITE_REQ)
            .write_u16(self.handle)
            .write_slice(&self.value);
        writer.into_inner()
    }
}

/// Write Response (no body)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteResponse;

impl AttPacket for WriteResponse {
    fn opcode() -> u8 {
        ATT_WRITE_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        expect_opcode(data, ATT_WRITE_RSP)?;
        Ok(WriteResponse)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![ATT_WRITE_RSP]
    }
}

/// Write Command (no response expected)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCommand {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPacket for WriteCommand {
    fn opcode() -> u8 {
        ATT_WRITE_CMD
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_WRITE_CMD)?;
        Ok(WriteCommand {
            handle: cursor.read_u16()?,
            value: cursor.take_rest().to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(3 + self.value.len());
        writer
            .write_u8(ATT_WRITE_CMD)
            .write_u16(self.handle)
            .write_slice(&self.value);
        writer.into_inner()
    }
}

/// Signed Write Command: a write command with a 12-byte CMAC trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedWriteCommand {
    pub handle: u16,
    pub value: Vec<u8>,
    pub signature: [u8; ATT_SIGNATURE_LEN],
}

impl AttPacket for SignedWriteCommand {
    fn opcode() -> u8 {
        ATT_SIGNED_WRITE_CMD
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_SIGNED_WRITE_CMD)?;
        let handle = cursor.read_u16()?;
        let rest = cursor.take_rest();
        if rest.len() < ATT_SIGNATURE_LEN {
            return Err(AttError::Malformed("signed write shorter than signature"));
        }
        let (value, sig) = rest.split_at(rest.len() - ATT_SIGNATURE_LEN);
        let mut signature = [0u8; ATT_SIGNATURE_LEN];
        signature.copy_from_slice(sig);
        Ok(SignedWriteCommand {
            handle,
            value: value.to_vec(),
            signature,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(3 + self.value.len() + ATT_SIGNATURE_LEN);
        writer
            .write_u8(ATT_SIGNED_WRITE_CMD)
            .write_u16(self.handle)
            .write_slice(&self.value)
            .write_slice(&self.signature);
        writer.into_inner()
    }
}

/// Prepare Write Request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareWriteRequest {
    pub handle: u16,
    pub offset: u16,
    pub part: Vec<u8>,
}

impl AttPacket for PrepareWriteRequest {
    fn opcode() -> u8 {
        ATT_PREPARE_WRITE_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_PREPARE_WRITE_REQ)?;
        Ok(PrepareWriteRequest {
            handle: cursor.read_u16()?,
            offset: cursor.read_u16()?,
            part: cursor.take_rest().to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(5 + self.part.len());
        writer
            .write_u8(ATT_PREPARE_WRITE_REQ)
            .write_u16(self.handle)
            .write_u16(self.offset)
            .write_slice(&self.part);
        writer.into_inner()
    }
}

/// Prepare Write Response: echoes the request for client-side verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareWriteResponse {
    pub handle: u16,
    pub offset: u16,
    pub part: Vec<u8>,
}

impl AttPacket for PrepareWriteResponse {
    fn opcode() -> u8 {
        ATT_PREPARE_WRITE_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_PREPARE_WRITE_RSP)?;
        Ok(PrepareWriteResponse {
            handle: cursor.read_u16()?,
            offset: cursor.read_u16()?,
            part: cursor.take_rest().to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(5 + self.part.len());
        writer
            .write_u8(ATT_PREPARE_WRITE_RSP)
            .write_u16(self.handle)
            .write_u16(self.offset)
            .write_slice(&self.part);
        writer.into_inner()
    }
}

/// Execute Write flag: commit replays the prepare queue, cancel discards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteWriteFlag {
    Cancel,
    Commit,
}

impl ExecuteWriteFlag {
    fn from_wire(byte: u8) -> AttResult<Self> {
        match byte {
            ATT_EXEC_WRITE_CANCEL => Ok(ExecuteWriteFlag::Cancel),
            ATT_EXEC_WRITE_COMMIT => Ok(ExecuteWriteFlag::Commit),
            _ => Err(AttError::Malformed("bad execute-write flag")),
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            ExecuteWriteFlag::Cancel => ATT_EXEC_WRITE_CANCEL,
            ExecuteWriteFlag::Commit => ATT_EXEC_WRITE_COMMIT,
        }
    }
}

/// Execute Write Request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteWriteRequest {
    pub flag: ExecuteWriteFlag,
}

impl AttPacket for ExecuteWriteRequest {
    fn opcode() -> u8 {
        ATT_EXECUTE_WRITE_REQ
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_EXECUTE_WRITE_REQ)?;
        Ok(ExecuteWriteRequest {
            flag: ExecuteWriteFlag::from_wire(cursor.read_u8()?)?,
        })
    }

    fn serialize(&self) -> Vec<u8> {
        vec![ATT_EXECUTE_WRITE_REQ, self.flag.to_wire()]
    }
}

/// Execute Write Response (no body)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecuteWriteResponse;

impl AttPacket for ExecuteWriteResponse {
    fn opcode() -> u8 {
        ATT_EXECUTE_WRITE_RSP
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        expect_opcode(data, ATT_EXECUTE_WRITE_RSP)?;
        Ok(ExecuteWriteResponse)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![ATT_EXECUTE_WRITE_RSP]
    }
}

/// Handle Value Notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueNotification {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPacket for HandleValueNotification {
    fn opcode() -> u8 {
        ATT_HANDLE_VALUE_NTF
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_HANDLE_VALUE_NTF)?;
        Ok(HandleValueNotification {
            handle: cursor.read_u16()?,
            value: cursor.take_rest().to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(3 + self.value.len());
        writer
            .write_u8(ATT_HANDLE_VALUE_NTF)
            .write_u16(self.handle)
            .write_slice(&self.value);
        writer.into_inner()
    }
}

/// Handle Value Indication
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleValueIndication {
    pub handle: u16,
    pub value: Vec<u8>,
}

impl AttPacket for HandleValueIndication {
    fn opcode() -> u8 {
        ATT_HANDLE_VALUE_IND
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        let mut cursor = expect_opcode(data, ATT_HANDLE_VALUE_IND)?;
        Ok(HandleValueIndication {
            handle: cursor.read_u16()?,
            value: cursor.take_rest().to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(3 + self.value.len());
        writer
            .write_u8(ATT_HANDLE_VALUE_IND)
            .write_u16(self.handle)
            .write_slice(&self.value);
        writer.into_inner()
    }
}

/// Handle Value Confirmation (no body)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandleValueConfirmation;

impl AttPacket for HandleValueConfirmation {
    fn opcode() -> u8 {
        ATT_HANDLE_VALUE_CONF
    }

    fn parse(data: &[u8]) -> AttResult<Self> {
        expect_opcode(data, ATT_HANDLE_VALUE_CONF)?;
        Ok(HandleValueConfirmation)
    }

    fn serialize(&self) -> Vec<u8> {
        vec![ATT_HANDLE_VALUE_CONF]
    }
}

/// A fully decoded inbound ATT PDU, tagged by family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttPdu {
    ErrorResponse(ErrorResponse),
    ExchangeMtuRequest(ExchangeMtuRequest),
    ExchangeMtuResponse(ExchangeMtuResponse),
    FindInformationRequest(FindInformationRequest),
    FindInformationResponse(FindInformationResponse),
    FindByTypeValueRequest(FindByTypeValueRequest),
    FindByTypeValueResponse(FindByTypeValueResponse),
    ReadByTypeRequest(ReadByTypeRequest),
    ReadByTypeResponse(ReadByTypeResponse),
    ReadRequest(ReadRequest),
    ReadResponse(ReadResponse),
    ReadBlobRequest(ReadBlobRequest),
    ReadBlobResponse(ReadBlobResponse),
    ReadMultipleRequest(ReadMultipleRequest),
    ReadMultipleResponse(ReadMultipleResponse),
    ReadByGroupTypeRequest(ReadByGroupTypeRequest),
    ReadByGroupTypeResponse(ReadByGroupTypeResponse),
    WriteRequest(WriteRequest),
    WriteResponse(WriteResponse),
    WriteCommand(WriteCommand),
    SignedWriteCommand(SignedWriteCommand),
    PrepareWriteRequest(PrepareWriteRequest),
    PrepareWriteResponse(PrepareWriteResponse),
    ExecuteWriteRequest(ExecuteWriteRequest),
    ExecuteWriteResponse(ExecuteWriteResponse),
    HandleValueNotification(HandleValueNotification),
    HandleValueIndication(HandleValueIndication),
    HandleValueConfirmation(HandleValueConfirmation),
}

impl AttPdu {
    /// Decodes a raw PDU. This is the single entry point for inbound bytes;
    /// everything past here works with typed variants.
    pub fn decode(data: &[u8]) -> AttResult<Self> {
        let opcode = *data.first().ok_or(AttError::Truncated {
            wanted: 1,
            remaining: 0,
        })?;
        let pdu = match opcode {
            ATT_ERROR_RSP => AttPdu::ErrorResponse(ErrorResponse::parse(data)?),
            ATT_EXCHANGE_MTU_REQ => AttPdu::ExchangeMtuRequest(ExchangeMtuRequest::parse(data)?),
            ATT_EXCHANGE_MTU_RSP => AttPdu::ExchangeMtuResponse(ExchangeMtuResponse::parse(data)?),
            ATT_FIND_INFO_REQ => {
                AttPdu::FindInformationRequest(FindInformationRequest::parse(data)?)
            }
            ATT_FIND_INFO_RSP => {
                AttPdu::FindInformationResponse(FindInformationResponse::parse(data)?)
            }
            ATT_FIND_BY_TYPE_VALUE_REQ => {
                AttPdu::FindByTypeValueRequest(FindByTypeValueRequest::parse(data)?)
            }
            ATT_FIND_BY_TYPE_VALUE_RSP => {
                AttPdu::FindByTypeValueResponse(FindByTypeValueResponse::parse(data)?)
            }
            ATT_READ_BY_TYPE_REQ => AttPdu::ReadByTypeRequest(ReadByTypeRequest::parse(data)?),
            ATT_READ_BY_TYPE_RSP => AttPdu::ReadByTypeResponse(ReadByTypeResponse::parse(data)?),
            ATT_READ_REQ => AttPdu::ReadRequest(ReadRequest::parse(data)?),
            ATT_READ_RSP => AttPdu::ReadResponse(ReadResponse::parse(data)?),
            ATT_READ_BLOB_REQ => AttPdu::ReadBlobRequest(ReadBlobRequest::parse(data)?),
            ATT_READ_BLOB_RSP => AttPdu::ReadBlobResponse(ReadBlobResponse::parse(data)?),
            ATT_READ_MULTIPLE_REQ => {
                AttPdu::ReadMultipleRequest(ReadMultipleRequest::parse(data)?)
            }
            ATT_READ_MULTIPLE_RSP => {
                AttPdu::ReadMultipleResponse(ReadMultipleResponse::parse(data)?)
            }
            ATT_READ_BY_GROUP_TYPE_REQ => {
                AttPdu::ReadByGroupTypeRequest(ReadByGroupTypeRequest::parse(data)?)
            }
            ATT_READ_BY_GROUP_TYPE_RSP => {
                AttPdu::ReadByGroupTypeResponse(ReadByGroupTypeResponse::parse(data)?)
            }
            ATT_WRITE_REQ => AttPdu::WriteRequest(WriteRequest::parse(data)?),
            ATT_WRITE_RSP => AttPdu::WriteResponse(WriteResponse::parse(data)?),
            ATT_WRITE_CMD => AttPdu::WriteCommand(WriteCommand::parse(data)?),
            ATT_SIGNED_WRITE_CMD => AttPdu::SignedWriteCommand(SignedWriteCommand::parse(data)?),
            ATT_PREPARE_WRITE_REQ => {
                AttPdu::PrepareWriteRequest(PrepareWriteRequest::parse(data)?)
            }
            ATT_PREPARE_WRITE_RSP => {
                AttPdu::PrepareWriteResponse(PrepareWriteResponse::parse(data)?)
            }
            ATT_EXECUTE_WRITE_REQ => {
                AttPdu::ExecuteWriteRequest(ExecuteWriteRequest::parse(data)?)
            }
            ATT_EXECUTE_WRITE_RSP => {
                AttPdu::ExecuteWriteResponse(ExecuteWriteResponse::parse(data)?)
            }
            ATT_HANDLE_VALUE_NTF => {
                AttPdu::HandleValueNotification(HandleValueNotification::parse(data)?)
            }
            ATT_HANDLE_VALUE_IND => {
                AttPdu::HandleValueIndication(HandleValueIndication::parse(data)?)
            }
            ATT_HANDLE_VALUE_CONF => {
                AttPdu::HandleValueConfirmation(HandleValueConfirmation::parse(data)?)
            }
            other => return Err(AttError::UnknownOpcode(other)),
        };
        Ok(pdu)
    }

    /// The wire opcode of this PDU.
    pub fn opcode(&self) -> u8 {
        match self {
            AttPdu::ErrorResponse(_) => ATT_ERROR_RSP,
            AttPdu::ExchangeMtuRequest(_) => ATT_EXCHANGE_MTU_REQ,
            AttPdu::ExchangeMtuResponse(_) => ATT_EXCHANGE_MTU_RSP,
            AttPdu::FindInformationRequest(_) => ATT_FIND_INFO_REQ,
            AttPdu::FindInformationResponse(_) => ATT_FIND_INFO_RSP,
            AttPdu::FindByTypeValueRequest(_) => ATT_FIND_BY_TYPE_VALUE_REQ,
            AttPdu::FindByTypeValueResponse(_) => ATT_FIND_BY_TYPE_VALUE_RSP,
            AttPdu::ReadByTypeRequest(_) => ATT_READ_BY_TYPE_REQ,
            AttPdu::ReadByTypeResponse(_) => ATT_READ_BY_TYPE_RSP,
            AttPdu::ReadRequest(_) => ATT_READ_REQ,
            AttPdu::ReadResponse(_) => ATT_READ_RSP,
            AttPdu::ReadBlobRequest(_) => ATT_READ_BLOB_REQ,
            AttPdu::ReadBlobResponse(_) => ATT_READ_BLOB_RSP,
            AttPdu::ReadMultipleRequest(_) => ATT_READ_MULTIPLE_REQ,
            AttPdu::ReadMultipleResponse(_) => ATT_READ_MULTIPLE_RSP,
            AttPdu::ReadByGroupTypeRequest(_) => ATT_READ_BY_GROUP_TYPE_REQ,
            AttPdu::ReadByGroupTypeResponse(_) => ATT_READ_BY_GROUP_TYPE_RSP,
            AttPdu::WriteRequest(_) => ATT_WRITE_REQ,
            AttPdu::WriteResponse(_) => ATT_WRITE_RSP,
            AttPdu::WriteCommand(_) => ATT_WRITE_CMD,
            AttPdu::SignedWriteCommand(_) => ATT_SIGNED_WRITE_CMD,
            AttPdu::PrepareWriteRequest(_) => ATT_PREPARE_WRITE_REQ,
            AttPdu::PrepareWriteResponse(_) => ATT_PREPARE_WRITE_RSP,
            AttPdu::ExecuteWriteRequest(_) => ATT_EXECUTE_WRITE_REQ,
            AttPdu::ExecuteWriteResponse(_) => ATT_EXECUTE_WRITE_RSP,
            AttPdu::HandleValueNotification(_) => ATT_HANDLE_VALUE_NTF,
            AttPdu::HandleValueIndication(_) => ATT_HANDLE_VALUE_IND,
            AttPdu::HandleValueConfirmation(_) => ATT_HANDLE_VALUE_CONF,
        }
    }

    /// Whether this PDU is a client-originated request the server engine
    /// must answer (commands included).
    pub fn is_client_originated(&self) -> bool {
        matches!(
            self,
            AttPdu::ExchangeMtuRequest(_)
                | AttPdu::FindInformationRequest(_)
                | AttPdu::FindByTypeValueRequest(_)
                | AttPdu::ReadByTypeRequest(_)
                | AttPdu::ReadRequest(_)
                | AttPdu::ReadBlobRequest(_)
                | AttPdu::ReadMultipleRequest(_)
                | AttPdu::ReadByGroupTypeRequest(_)
                | AttPdu::WriteRequest(_)
                | AttPdu::WriteCommand(_)
                | AttPdu::SignedWriteCommand(_)
                | AttPdu::PrepareWriteRequest(_)
                | AttPdu::ExecuteWriteRequest(_)
                | AttPdu::HandleValueConfirmation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_response_round_trip() {
        let rsp = ErrorResponse {
            request_opcode: ATT_READ_BY_GROUP_TYPE_REQ,
            handle: 0x0001,
            error_code: AttErrorCode::AttributeNotFound,
        };
        let bytes = rsp.serialize();
        assert_eq!(bytes, vec![0x01, 0x10, 0x01, 0x00, 0x0A]);
        assert_eq!(ErrorResponse::parse(&bytes).unwrap(), rsp);
    }

    #[test]
    fn read_by_group_type_response_pages() {
        // Two 16-bit-UUID services in one page, element length 6.
        let bytes = [
            0x11, 0x06, // opcode, element length
            0x01, 0x00, 0x05, 0x00, 0x00, 0x18, // [1..5] 0x1800
            0x06, 0x00, 0x09, 0x00, 0x01, 0x18, // [6..9] 0x1801
        ];
        let rsp = ReadByGroupTypeResponse::parse(&bytes).unwrap();
        assert_eq!(rsp.items.len(), 2);
        assert_eq!(rsp.items[0].handle, 1);
        assert_eq!(rsp.items[0].group_end_handle, 5);
        assert_eq!(rsp.items[1].value, vec![0x01, 0x18]);
        assert_eq!(rsp.serialize(), bytes);
    }

    #[test]
    fn find_information_formats() {
        let short = FindInformationResponse {
            pairs: vec![(0x0004, Uuid::from_u16(0x2902))],
        };
        let bytes = short.serialize();
        assert_eq!(bytes[1], ATT_FIND_INFO_FORMAT_16BIT);
        assert_eq!(FindInformationResponse::parse(&bytes).unwrap(), short);

        let custom = Uuid::from_bytes_le([7u8; 16]);
        let long = FindInformationResponse {
            pairs: vec![(0x0010, custom)],
        };
        let bytes = long.serialize();
        assert_eq!(bytes[1], ATT_FIND_INFO_FORMAT_128BIT);
        assert_eq!(bytes.len(), 2 + 2 + 16);
        assert_eq!(FindInformationResponse::parse(&bytes).unwrap(), long);
    }

    #[test]
    fn signed_write_splits_signature() {
        let cmd = SignedWriteCommand {
            handle: 0x0042,
            value: vec![1, 2, 3],
            signature: [9u8; ATT_SIGNATURE_LEN],
        };
        let parsed = SignedWriteCommand::parse(&cmd.serialize()).unwrap();
        assert_eq!(parsed, cmd);

        // Shorter than the signature trailer is malformed.
        let mut bad = vec![ATT_SIGNED_WRITE_CMD, 0x42, 0x00];
        bad.extend_from_slice(&[0u8; 5]);
        assert!(SignedWriteCommand::parse(&bad).is_err());
    }

    #[test]
    fn execute_write_flags() {
        assert_eq!(
            ExecuteWriteRequest::parse(&[0x18, 0x01]).unwrap().flag,
            ExecuteWriteFlag::Commit
        );
        assert_eq!(
            ExecuteWriteRequest::parse(&[0x18, 0x00]).unwrap().flag,
            ExecuteWriteFlag::Cancel
        );
        assert!(ExecuteWriteRequest::parse(&[0x18, 0x02]).is_err());
    }

    #[test]
    fn decode_rejects_unknown_and_truncated() {
        assert!(matches!(AttPdu::decode(&[]), Err(AttError::Truncated { .. })));
        assert!(matches!(
            AttPdu::decode(&[0x7F]),
            Err(AttError::UnknownOpcode(0x7F))
        ));
        // Read request missing its handle.
        assert!(AttPdu::decode(&[ATT_READ_REQ, 0x01]).is_err());
    }

    #[test]
    fn decode_tags_requests_and_responses() {
        let req = AttPdu::decode(&ReadRequest { handle: 3 }.serialize()).unwrap();
        assert!(req.is_client_originated());

        let rsp = AttPdu::decode(&ReadResponse { value: vec![1] }.serialize()).unwrap();
        assert!(!rsp.is_client_originated());
    }
}
