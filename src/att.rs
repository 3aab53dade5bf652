//! Attribute protocol PDU codec.
//!
//! Fixed-layout PDUs from the Bluetooth Core Specification Vol 3 Part F
//! §3.4. Requests and commands decode into [`AttReq`], responses into
//! [`AttRsp`], server-initiated value pushes into [`AttUns`].
use crate::codec::{self, Encode, Type};
use crate::cursor::{ReadCursor, WriteCursor};
use crate::types::uuid::Uuid;

pub(crate) const ATT_ERROR_RSP: u8 = 0x01;
pub(crate) const ATT_EXCHANGE_MTU_REQ: u8 = 0x02;
pub(crate) const ATT_EXCHANGE_MTU_RSP: u8 = 0x03;
pub(crate) const ATT_FIND_INFORMATION_REQ: u8 = 0x04;
pub(crate) const ATT_FIND_INFORMATION_RSP: u8 = 0x05;
pub(crate) const ATT_FIND_BY_TYPE_VALUE_REQ: u8 = 0x06;
pub(crate) const ATT_FIND_BY_TYPE_VALUE_RSP: u8 = 0x07;
pub(crate) const ATT_READ_BY_TYPE_REQ: u8 = 0x08;
pub(crate) const ATT_READ_BY_TYPE_RSP: u8 = 0x09;
pub(crate) const ATT_READ_REQ: u8 = 0x0a;
pub(crate) const ATT_READ_RSP: u8 = 0x0b;
pub(crate) const ATT_READ_BLOB_REQ: u8 = 0x0c;
pub(crate) const ATT_READ_BLOB_RSP: u8 = 0x0d;
pub(crate) const ATT_READ_MULTIPLE_REQ: u8 = 0x0e;
pub(crate) const ATT_READ_MULTIPLE_RSP: u8 = 0x0f;
pub(crate) const ATT_READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
pub(crate) const ATT_READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
pub(crate) const ATT_WRITE_REQ: u8 = 0x12;
pub(crate) const ATT_WRITE_RSP: u8 = 0x13;
pub(crate) const ATT_PREPARE_WRITE_REQ: u8 = 0x16;
pub(crate) const ATT_PREPARE_WRITE_RSP: u8 = 0x17;
pub(crate) const ATT_EXECUTE_WRITE_REQ: u8 = 0x18;
pub(crate) const ATT_EXECUTE_WRITE_RSP: u8 = 0x19;
/// Handle Value Notification opcode.
pub const ATT_HANDLE_VALUE_NTF: u8 = 0x1b;
/// Handle Value Indication opcode.
pub const ATT_HANDLE_VALUE_IND: u8 = 0x1d;
/// Handle Value Confirmation opcode.
pub const ATT_HANDLE_VALUE_CFM: u8 = 0x1e;
pub(crate) const ATT_WRITE_CMD: u8 = 0x52;
pub(crate) const ATT_SIGNED_WRITE_CMD: u8 = 0xd2;

/// Length of the signature trailing a Signed Write Command.
pub(crate) const ATT_SIGNATURE_LEN: usize = 12;

/// Execute Write flag: discard the prepare queue.
pub(crate) const ATT_EXEC_WRITE_FLAG_CANCEL: u8 = 0x00;
/// Execute Write flag: apply the prepare queue.
pub(crate) const ATT_EXEC_WRITE_FLAG_WRITE: u8 = 0x01;

/// Whether an opcode is in the response family (consumed by a pending
/// request, never valid otherwise).
pub(crate) fn is_response_opcode(opcode: u8) -> bool {
    opcode <= ATT_EXECUTE_WRITE_RSP && opcode % 2 == 1
}

/// ATT protocol error codes as they appear in an Error Response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum AttErrorCode {
    /// The attribute handle given was not valid on this server.
    InvalidHandle = 0x01,
    /// The attribute cannot be read.
    ReadNotPermitted = 0x02,
    /// The attribute cannot be written.
    WriteNotPermitted = 0x03,
    /// The attribute PDU was invalid.
    InvalidPdu = 0x04,
    /// The attribute requires authentication before it can be read or written.
    InsufficientAuthentication = 0x05,
    /// ATT Server does not support the request received from the client.
    RequestNotSupported = 0x06,
    /// Offset specified was past the end of the attribute.
    InvalidOffset = 0x07,
    /// The attribute requires authorization before it can be read or written.
    InsufficientAuthorization = 0x08,
    /// Too many prepare writes have been queued.
    PrepareQueueFull = 0x09,
    /// No attribute found within the given attribute handle range.
    AttributeNotFound = 0x0a,
    /// The attribute cannot be read using the Read Blob Request.
    AttributeNotLong = 0x0b,
    /// The Encryption Key Size used for encrypting this link is too short.
    InsufficientEncryptionKeySize = 0x0c,
    /// The attribute value length is invalid for the operation.
    InvalidAttributeValueLength = 0x0d,
    /// The request has encountered an unlikely error and cannot be completed.
    UnlikelyError = 0x0e,
    /// The attribute requires encryption before it can be read or written.
    InsufficientEncryption = 0x0f,
    /// The attribute type is not a supported grouping attribute.
    UnsupportedGroupType = 0x10,
    /// Insufficient Resources to complete the request.
    InsufficientResources = 0x11,
}

impl From<codec::Error> for AttErrorCode {
    fn from(_: codec::Error) -> Self {
        Self::UnlikelyError
    }
}

impl TryFrom<u8> for AttErrorCode {
    type Error = codec::Error;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0x01 => Ok(Self::InvalidHandle),
            0x02 => Ok(Self::ReadNotPermitted),
            0x03 => Ok(Self::WriteNotPermitted),
            0x04 => Ok(Self::InvalidPdu),
            0x05 => Ok(Self::InsufficientAuthentication),
            0x06 => Ok(Self::RequestNotSupported),
            0x07 => Ok(Self::InvalidOffset),
            0x08 => Ok(Self::InsufficientAuthorization),
            0x09 => Ok(Self::PrepareQueueFull),
            0x0a => Ok(Self::AttributeNotFound),
            0x0b => Ok(Self::AttributeNotLong),
            0x0c => Ok(Self::InsufficientEncryptionKeySize),
            0x0d => Ok(Self::InvalidAttributeValueLength),
            0x0e => Ok(Self::UnlikelyError),
            0x0f => Ok(Self::InsufficientEncryption),
            0x10 => Ok(Self::UnsupportedGroupType),
            0x11 => Ok(Self::InsufficientResources),
            _ => Err(codec::Error::InvalidValue),
        }
    }
}

/// A decoded request or command PDU (client to server direction).
#[derive(Debug, PartialEq)]
pub enum AttReq<'d> {
    /// Exchange MTU Request.
    ExchangeMtu {
        /// The client receive MTU.
        mtu: u16,
    },
    /// Find Information Request.
    FindInformation {
        /// First requested handle.
        start_handle: u16,
        /// Last requested handle.
        end_handle: u16,
    },
    /// Find By Type Value Request.
    FindByTypeValue {
        /// First requested handle.
        start_handle: u16,
        /// Last requested handle.
        end_handle: u16,
        /// 16-bit attribute type to match.
        att_type: u16,
        /// Attribute value to match.
        att_value: &'d [u8],
    },
    /// Read By Type Request.
    ReadByType {
        /// First requested handle.
        start: u16,
        /// Last requested handle.
        end: u16,
        /// Attribute type to match.
        attribute_type: Uuid,
    },
    /// Read By Group Type Request.
    ReadByGroupType {
        /// First requested handle.
        start: u16,
        /// Last requested handle.
        end: u16,
        /// Grouping attribute type to match.
        group_type: Uuid,
    },
    /// Read Request.
    Read {
        /// Handle of the attribute to read.
        handle: u16,
    },
    /// Read Blob Request.
    ReadBlob {
        /// Handle of the attribute to read.
        handle: u16,
        /// Offset of the first octet to read.
        offset: u16,
    },
    /// Read Multiple Request.
    ReadMultiple {
        /// Two or more handles, two octets each.
        handles: &'d [u8],
    },
    /// Write Request.
    Write {
        /// Handle of the attribute to write.
        handle: u16,
        /// Value to write.
        data: &'d [u8],
    },
    /// Write Command.
    WriteCmd {
        /// Handle of the attribute to write.
        handle: u16,
        /// Value to write.
        data: &'d [u8],
    },
    /// Signed Write Command.
    SignedWriteCmd {
        /// Handle of the attribute to write.
        handle: u16,
        /// Value to write.
        data: &'d [u8],
        /// Authentication signature.
        signature: &'d [u8],
    },
    /// Prepare Write Request.
    PrepareWrite {
        /// Handle of the attribute to write.
        handle: u16,
        /// Offset of the first octet to write.
        offset: u16,
        /// Part of the attribute value.
        value: &'d [u8],
    },
    /// Execute Write Request.
    ExecuteWrite {
        /// 0x00 cancels the queue, 0x01 applies it.
        flags: u8,
    },
}

fn read_nonzero_handle(r: &mut ReadCursor<'_>) -> Result<u16, codec::Error> {
    let handle: u16 = r.read()?;
    if handle == 0 {
        return Err(codec::Error::InvalidValue);
    }
    Ok(handle)
}

impl<'d> AttReq<'d> {
    /// Decode a request or command PDU.
    pub fn decode(data: &'d [u8]) -> Result<AttReq<'d>, codec::Error> {
        let mut r = ReadCursor::new(data);
        let opcode: u8 = r.read()?;
        match opcode {
            ATT_EXCHANGE_MTU_REQ => {
                let mtu = r.read()?;
                Ok(Self::ExchangeMtu { mtu })
            }
            ATT_FIND_INFORMATION_REQ => {
                let start_handle = read_nonzero_handle(&mut r)?;
                let end_handle = r.read()?;
                Ok(Self::FindInformation {
                    start_handle,
                    end_handle,
                })
            }
            ATT_FIND_BY_TYPE_VALUE_REQ => {
                let start_handle = read_nonzero_handle(&mut r)?;
                let end_handle = r.read()?;
                let att_type = r.read()?;
                let att_value = r.remaining();
                Ok(Self::FindByTypeValue {
                    start_handle,
                    end_handle,
                    att_type,
                    att_value,
                })
            }
            ATT_READ_BY_TYPE_REQ | ATT_READ_BY_GROUP_TYPE_REQ => {
                let start = read_nonzero_handle(&mut r)?;
                let end = r.read()?;
                let uuid = Uuid::try_from_slice(r.remaining())?;
                if opcode == ATT_READ_BY_TYPE_REQ {
                    Ok(Self::ReadByType {
                        start,
                        end,
                        attribute_type: uuid,
                    })
                } else {
                    Ok(Self::ReadByGroupType {
                        start,
                        end,
                        group_type: uuid,
                    })
                }
            }
            ATT_READ_REQ => {
                let handle = read_nonzero_handle(&mut r)?;
                Ok(Self::Read { handle })
            }
            ATT_READ_BLOB_REQ => {
                let handle = read_nonzero_handle(&mut r)?;
                let offset = r.read()?;
                Ok(Self::ReadBlob { handle, offset })
            }
            ATT_READ_MULTIPLE_REQ => {
                let handles = r.remaining();
                // Two or more handles, each non-zero.
                if handles.len() < 4 || handles.len() % 2 != 0 {
                    return Err(codec::Error::InvalidValue);
                }
                for pair in handles.chunks(2) {
                    if pair[0] == 0 && pair[1] == 0 {
                        return Err(codec::Error::InvalidValue);
                    }
                }
                Ok(Self::ReadMultiple { handles })
            }
            ATT_WRITE_REQ | ATT_WRITE_CMD => {
                let handle = read_nonzero_handle(&mut r)?;
                let data = r.remaining();
                if opcode == ATT_WRITE_REQ {
                    Ok(Self::Write { handle, data })
                } else {
                    Ok(Self::WriteCmd { handle, data })
                }
            }
            ATT_SIGNED_WRITE_CMD => {
                let handle = read_nonzero_handle(&mut r)?;
                let rest = r.remaining();
                if rest.len() < ATT_SIGNATURE_LEN {
                    return Err(codec::Error::InvalidValue);
                }
                let (data, signature) = rest.split_at(rest.len() - ATT_SIGNATURE_LEN);
                Ok(Self::SignedWriteCmd {
                    handle,
                    data,
                    signature,
                })
            }
            ATT_PREPARE_WRITE_REQ => {
                let handle = read_nonzero_handle(&mut r)?;
                let offset = r.read()?;
                let value = r.remaining();
                Ok(Self::PrepareWrite {
                    handle,
                    offset,
                    value,
                })
            }
            ATT_EXECUTE_WRITE_REQ => {
                let flags: u8 = r.read()?;
                if flags > ATT_EXEC_WRITE_FLAG_WRITE {
                    return Err(codec::Error::InvalidValue);
                }
                Ok(Self::ExecuteWrite { flags })
            }
            _ => Err(codec::Error::InvalidValue),
        }
    }

    fn opcode(&self) -> u8 {
        match self {
            Self::ExchangeMtu { .. } => ATT_EXCHANGE_MTU_REQ,
            Self::FindInformation { .. } => ATT_FIND_INFORMATION_REQ,
            Self::FindByTypeValue { .. } => ATT_FIND_BY_TYPE_VALUE_REQ,
            Self::ReadByType { .. } => ATT_READ_BY_TYPE_REQ,
            Self::ReadByGroupType { .. } => ATT_READ_BY_GROUP_TYPE_REQ,
            Self::Read { .. } => ATT_READ_REQ,
            Self::ReadBlob { .. } => ATT_READ_BLOB_REQ,
            Self::ReadMultiple { .. } => ATT_READ_MULTIPLE_REQ,
            Self::Write { .. } => ATT_WRITE_REQ,
            Self::WriteCmd { .. } => ATT_WRITE_CMD,
            Self::SignedWriteCmd { .. } => ATT_SIGNED_WRITE_CMD,
            Self::PrepareWrite { .. } => ATT_PREPARE_WRITE_REQ,
            Self::ExecuteWrite { .. } => ATT_EXECUTE_WRITE_REQ,
        }
    }

    /// The request method, with the command and signature flags stripped.
    pub(crate) fn method(&self) -> u8 {
        self.opcode() & 0x3f
    }

    /// Whether this PDU is a command (no response expected).
    pub(crate) fn is_command(&self) -> bool {
        self.opcode() & 0x40 != 0
    }
}

impl<'d> Type for AttReq<'d> {
    fn size(&self) -> usize {
        1 + match self {
            Self::ExchangeMtu { .. } => 2,
            Self::FindInformation { .. } => 4,
            Self::FindByTypeValue { att_value, .. } => 6 + att_value.len(),
            Self::ReadByType { attribute_type, .. } => 4 + attribute_type.size(),
            Self::ReadByGroupType { group_type, .. } => 4 + group_type.size(),
            Self::Read { .. } => 2,
            Self::ReadBlob { .. } => 4,
            Self::ReadMultiple { handles } => handles.len(),
            Self::Write { data, .. } => 2 + data.len(),
            Self::WriteCmd { data, .. } => 2 + data.len(),
            Self::SignedWriteCmd { data, .. } => 2 + data.len() + ATT_SIGNATURE_LEN,
            Self::PrepareWrite { value, .. } => 4 + value.len(),
            Self::ExecuteWrite { .. } => 1,
        }
    }
}

impl<'d> Encode for AttReq<'d> {
    fn encode(&self, dest: &mut [u8]) -> Result<(), codec::Error> {
        let mut w = WriteCursor::new(dest);
        w.write(self.opcode())?;
        match self {
            Self::ExchangeMtu { mtu } => w.write(*mtu)?,
            Self::FindInformation {
                start_handle,
                end_handle,
            } => {
                w.write(*start_handle)?;
                w.write(*end_handle)?;
            }
            Self::FindByTypeValue {
                start_handle,
                end_handle,
                att_type,
                att_value,
            } => {
                w.write(*start_handle)?;
                w.write(*end_handle)?;
                w.write(*att_type)?;
                w.append(att_value)?;
            }
            Self::ReadByType {
                start,
                end,
                attribute_type,
            } => {
                w.write(*start)?;
                w.write(*end)?;
                w.write_ref(attribute_type)?;
            }
            Self::ReadByGroupType { start, end, group_type } => {
                w.write(*start)?;
                w.write(*end)?;
                w.write_ref(group_type)?;
            }
            Self::Read { handle } => w.write(*handle)?,
            Self::ReadBlob { handle, offset } => {
                w.write(*handle)?;
                w.write(*offset)?;
            }
            Self::ReadMultiple { handles } => w.append(handles)?,
            Self::Write { handle, data } | Self::WriteCmd { handle, data } => {
                w.write(*handle)?;
                w.append(data)?;
            }
            Self::SignedWriteCmd {
                handle,
                data,
                signature,
            } => {
                w.write(*handle)?;
                w.append(data)?;
                if signature.len() != ATT_SIGNATURE_LEN {
                    return Err(codec::Error::InvalidValue);
                }
                w.append(signature)?;
            }
            Self::PrepareWrite { handle, offset, value } => {
                w.write(*handle)?;
                w.write(*offset)?;
                w.append(value)?;
            }
            Self::ExecuteWrite { flags } => w.write(*flags)?,
        }
        Ok(())
    }
}

/// A decoded response PDU (server to client direction).
pub enum AttRsp<'d> {
    /// Error Response.
    Error {
        /// The request opcode that failed.
        request: u8,
        /// The handle the failure refers to.
        handle: u16,
        /// The failure code.
        code: AttErrorCode,
    },
    /// Exchange MTU Response.
    ExchangeMtu {
        /// The server receive MTU.
        mtu: u16,
    },
    /// Find Information Response.
    FindInformation {
        /// Iterator over `(handle, uuid)` entries.
        it: FindInformationIter<'d>,
    },
    /// Find By Type Value Response.
    FindByTypeValue {
        /// Iterator over `(start, group_end)` pairs.
        it: FindByTypeValueIter<'d>,
    },
    /// Read By Type Response.
    ReadByType {
        /// Iterator over `(handle, value)` entries.
        it: ReadByTypeIter<'d>,
    },
    /// Read By Group Type Response.
    ReadByGroupType {
        /// Iterator over `(start, group_end, value)` entries.
        it: ReadByGroupTypeIter<'d>,
    },
    /// Read Response.
    Read {
        /// The attribute value, up to MTU-1 octets.
        data: &'d [u8],
    },
    /// Read Blob Response.
    ReadBlob {
        /// Part of the attribute value.
        data: &'d [u8],
    },
    /// Read Multiple Response.
    ReadMultiple {
        /// Concatenated attribute values.
        data: &'d [u8],
    },
    /// Write Response.
    Write,
    /// Prepare Write Response, echoing the queued entry.
    PrepareWrite {
        /// Echoed attribute handle.
        handle: u16,
        /// Echoed value offset.
        offset: u16,
        /// Echoed value part.
        value: &'d [u8],
    },
    /// Execute Write Response.
    ExecuteWrite,
}

impl<'d> AttRsp<'d> {
    /// Decode a response PDU.
    pub fn decode(data: &'d [u8]) -> Result<AttRsp<'d>, codec::Error> {
        let mut r = ReadCursor::new(data);
        let opcode: u8 = r.read()?;
        match opcode {
            ATT_ERROR_RSP => {
                let request = r.read()?;
                let handle = r.read()?;
                let code: u8 = r.read()?;
                Ok(Self::Error {
                    request,
                    handle,
                    code: code.try_into()?,
                })
            }
            ATT_EXCHANGE_MTU_RSP => {
                let mtu = r.read()?;
                Ok(Self::ExchangeMtu { mtu })
            }
            ATT_FIND_INFORMATION_RSP => {
                let format: u8 = r.read()?;
                let entry = match format {
                    crate::types::uuid::FORMAT_UUID16 => 4,
                    crate::types::uuid::FORMAT_UUID128 => 18,
                    _ => return Err(codec::Error::InvalidValue),
                };
                let entries = r.remaining();
                if entries.is_empty() || entries.len() % entry != 0 {
                    return Err(codec::Error::InvalidValue);
                }
                Ok(Self::FindInformation {
                    it: FindInformationIter { entries, entry, pos: 0 },
                })
            }
            ATT_FIND_BY_TYPE_VALUE_RSP => {
                let entries = r.remaining();
                if entries.is_empty() || entries.len() % 4 != 0 {
                    return Err(codec::Error::InvalidValue);
                }
                Ok(Self::FindByTypeValue {
                    it: FindByTypeValueIter { entries, pos: 0 },
                })
            }
            ATT_READ_BY_TYPE_RSP | ATT_READ_BY_GROUP_TYPE_RSP => {
                let entry: u8 = r.read()?;
                let header = if opcode == ATT_READ_BY_TYPE_RSP { 2 } else { 4 };
                let entry = entry as usize;
                let entries = r.remaining();
                if entry < header || entries.is_empty() || entries.len() % entry != 0 {
                    return Err(codec::Error::InvalidValue);
                }
                if opcode == ATT_READ_BY_TYPE_RSP {
                    Ok(Self::ReadByType {
                        it: ReadByTypeIter { entries, entry, pos: 0 },
                    })
                } else {
                    Ok(Self::ReadByGroupType {
                        it: ReadByGroupTypeIter { entries, entry, pos: 0 },
                    })
                }
            }
            ATT_READ_RSP => Ok(Self::Read { data: r.remaining() }),
            ATT_READ_BLOB_RSP => Ok(Self::ReadBlob { data: r.remaining() }),
            ATT_READ_MULTIPLE_RSP => Ok(Self::ReadMultiple { data: r.remaining() }),
            ATT_WRITE_RSP => Ok(Self::Write),
            ATT_PREPARE_WRITE_RSP => {
                let handle = r.read()?;
                let offset = r.read()?;
                Ok(Self::PrepareWrite {
                    handle,
                    offset,
                    value: r.remaining(),
                })
            }
            ATT_EXECUTE_WRITE_RSP => Ok(Self::ExecuteWrite),
            _ => Err(codec::Error::InvalidValue),
        }
    }
}

/// Iterator over Find Information Response entries.
pub struct FindInformationIter<'d> {
    entries: &'d [u8],
    entry: usize,
    pos: usize,
}

impl<'d> FindInformationIter<'d> {
    /// Next `(handle, uuid)` entry.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<(u16, Uuid), crate::Error>> {
        if self.pos + self.entry > self.entries.len() {
            return None;
        }
        let e = &self.entries[self.pos..self.pos + self.entry];
        self.pos += self.entry;
        let handle = u16::from_le_bytes([e[0], e[1]]);
        match Uuid::try_from_slice(&e[2..]) {
            Ok(uuid) => Some(Ok((handle, uuid))),
            Err(_) => Some(Err(crate::Error::Malformed)),
        }
    }
}

/// Iterator over Find By Type Value Response entries.
pub struct FindByTypeValueIter<'d> {
    entries: &'d [u8],
    pos: usize,
}

impl<'d> FindByTypeValueIter<'d> {
    /// Next `(start, group_end)` pair.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<(u16, u16), crate::Error>> {
        if self.pos + 4 > self.entries.len() {
            return None;
        }
        let e = &self.entries[self.pos..self.pos + 4];
        self.pos += 4;
        Some(Ok((
            u16::from_le_bytes([e[0], e[1]]),
            u16::from_le_bytes([e[2], e[3]]),
        )))
    }
}

/// Iterator over Read By Type Response entries.
pub struct ReadByTypeIter<'d> {
    entries: &'d [u8],
    entry: usize,
    pos: usize,
}

impl<'d> ReadByTypeIter<'d> {
    /// Next `(handle, value)` entry.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<(u16, &'d [u8]), crate::Error>> {
        if self.pos + self.entry > self.entries.len() {
            return None;
        }
        let e = &self.entries[self.pos..self.pos + self.entry];
        self.pos += self.entry;
        Some(Ok((u16::from_le_bytes([e[0], e[1]]), &e[2..])))
    }
}

/// Iterator over Read By Group Type Response entries.
pub struct ReadByGroupTypeIter<'d> {
    entries: &'d [u8],
    entry: usize,
    pos: usize,
}

impl<'d> ReadByGroupTypeIter<'d> {
    /// Next `(start, group_end, value)` entry.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Result<(u16, u16, &'d [u8]), crate::Error>> {
        if self.pos + self.entry > self.entries.len() {
            return None;
        }
        let e = &self.entries[self.pos..self.pos + self.entry];
        self.pos += self.entry;
        Some(Ok((
            u16::from_le_bytes([e[0], e[1]]),
            u16::from_le_bytes([e[2], e[3]]),
            &e[4..],
        )))
    }
}

/// A decoded unsolicited PDU (server-initiated value push).
#[derive(Debug, PartialEq)]
pub enum AttUns<'d> {
    /// Handle Value Notification.
    Notify {
        /// Handle of the attribute value.
        handle: u16,
        /// The pushed value.
        data: &'d [u8],
    },
    /// Handle Value Indication.
    Indicate {
        /// Handle of the attribute value.
        handle: u16,
        /// The pushed value.
        data: &'d [u8],
    },
}

impl<'d> AttUns<'d> {
    /// Decode an unsolicited PDU.
    pub fn decode(data: &'d [u8]) -> Result<AttUns<'d>, codec::Error> {
        let mut r = ReadCursor::new(data);
        let opcode: u8 = r.read()?;
        let handle = read_nonzero_handle(&mut r)?;
        match opcode {
            ATT_HANDLE_VALUE_NTF => Ok(Self::Notify {
                handle,
                data: r.remaining(),
            }),
            ATT_HANDLE_VALUE_IND => Ok(Self::Indicate {
                handle,
                data: r.remaining(),
            }),
            _ => Err(codec::Error::InvalidValue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Error;

    fn encode(req: &AttReq<'_>) -> ([u8; 64], usize) {
        let mut buf = [0u8; 64];
        let size = req.size();
        req.encode(&mut buf[..size]).unwrap();
        (buf, size)
    }

    #[test]
    fn exchange_mtu_wire_format() {
        let (buf, size) = encode(&AttReq::ExchangeMtu { mtu: 23 });
        assert_eq!(&buf[..size], &[0x02, 0x17, 0x00]);
    }

    #[test]
    fn read_wire_format() {
        let (buf, size) = encode(&AttReq::Read { handle: 0x0003 });
        assert_eq!(&buf[..size], &[0x0a, 0x03, 0x00]);
    }

    #[test]
    fn read_blob_wire_format() {
        let (buf, size) = encode(&AttReq::ReadBlob {
            handle: 0x0003,
            offset: 0x0016,
        });
        assert_eq!(&buf[..size], &[0x0c, 0x03, 0x00, 0x16, 0x00]);
    }

    #[test]
    fn requests_round_trip() {
        let cases = [
            AttReq::ExchangeMtu { mtu: 100 },
            AttReq::FindInformation {
                start_handle: 1,
                end_handle: 0xffff,
            },
            AttReq::FindByTypeValue {
                start_handle: 1,
                end_handle: 0xffff,
                att_type: 0x2800,
                att_value: &[0x00, 0x18],
            },
            AttReq::ReadByType {
                start: 0x10,
                end: 0x20,
                attribute_type: Uuid::new_short(0x2803),
            },
            AttReq::ReadByGroupType {
                start: 1,
                end: 0xffff,
                group_type: Uuid::new_short(0x2800),
            },
            AttReq::Read { handle: 3 },
            AttReq::ReadBlob { handle: 3, offset: 22 },
            AttReq::ReadMultiple {
                handles: &[0x03, 0x00, 0x05, 0x00],
            },
            AttReq::Write {
                handle: 3,
                data: &[1, 2, 3],
            },
            AttReq::WriteCmd {
                handle: 3,
                data: &[4, 5],
            },
            AttReq::SignedWriteCmd {
                handle: 3,
                data: &[6],
                signature: &[0; ATT_SIGNATURE_LEN],
            },
            AttReq::PrepareWrite {
                handle: 3,
                offset: 18,
                value: &[7, 8],
            },
            AttReq::ExecuteWrite { flags: 0x01 },
        ];
        for req in cases {
            let (buf, size) = encode(&req);
            assert_eq!(AttReq::decode(&buf[..size]).unwrap(), req);
        }
    }

    #[test]
    fn decode_rejects_malformed() {
        // Truncated PDUs.
        assert_eq!(AttReq::decode(&[]), Err(Error::InvalidValue));
        assert_eq!(AttReq::decode(&[0x02, 0x17]), Err(Error::InvalidValue));
        // Zero handle where disallowed.
        assert_eq!(AttReq::decode(&[0x0a, 0x00, 0x00]), Err(Error::InvalidValue));
        assert_eq!(
            AttReq::decode(&[0x04, 0x00, 0x00, 0xff, 0xff]),
            Err(Error::InvalidValue)
        );
        // Read Multiple with an odd byte count.
        assert_eq!(
            AttReq::decode(&[0x0e, 0x01, 0x00, 0x02]),
            Err(Error::InvalidValue)
        );
        // Execute Write with reserved flags.
        assert_eq!(AttReq::decode(&[0x18, 0x02]), Err(Error::InvalidValue));
        // Unknown opcode.
        assert_eq!(AttReq::decode(&[0x55, 0x00]), Err(Error::InvalidValue));
    }

    #[test]
    fn decode_error_response() {
        // Error Response: Read By Group Type at handle 1, Attribute Not Found.
        let rsp = AttRsp::decode(&[0x01, 0x10, 0x01, 0x00, 0x0a]).unwrap();
        match rsp {
            AttRsp::Error { request, handle, code } => {
                assert_eq!(request, ATT_READ_BY_GROUP_TYPE_REQ);
                assert_eq!(handle, 0x0001);
                assert_eq!(code, AttErrorCode::AttributeNotFound);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn decode_read_by_group_type_response() {
        let rsp = AttRsp::decode(&[
            0x11, 0x06, // opcode, entry length
            0x01, 0x00, 0x0f, 0x00, 0x00, 0x18, // [1..15] 0x1800
            0x10, 0x00, 0x1f, 0x00, 0x01, 0x18, // [16..31] 0x1801
        ])
        .unwrap();
        match rsp {
            AttRsp::ReadByGroupType { mut it } => {
                let (start, end, value) = it.next().unwrap().unwrap();
                assert_eq!((start, end), (0x0001, 0x000f));
                assert_eq!(value, &[0x00, 0x18]);
                let (start, end, _) = it.next().unwrap().unwrap();
                assert_eq!((start, end), (0x0010, 0x001f));
                assert!(it.next().is_none());
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn response_list_must_divide_evenly() {
        // Read By Type with entry length 7 but only 6 payload bytes.
        assert!(AttRsp::decode(&[0x09, 0x07, 0x01, 0x00, 0x02, 0x03, 0x04, 0x05]).is_err());
        // Find Information with an invalid format octet.
        assert!(AttRsp::decode(&[0x05, 0x03, 0x01, 0x00, 0x02, 0x29]).is_err());
    }

    #[test]
    fn unsolicited_round_trip() {
        let uns = AttUns::decode(&[0x1b, 0x03, 0x00, 0xaa, 0xbb]).unwrap();
        assert_eq!(
            uns,
            AttUns::Notify {
                handle: 3,
                data: &[0xaa, 0xbb]
            }
        );
        let uns = AttUns::decode(&[0x1d, 0x05, 0x00, 0x01]).unwrap();
        assert_eq!(uns, AttUns::Indicate { handle: 5, data: &[0x01] });
        assert!(AttUns::decode(&[0x1b, 0x00, 0x00]).is_err());
    }

    #[test]
    fn response_opcode_classification() {
        for op in [0x01, 0x03, 0x05, 0x0b, 0x0f, 0x13, 0x17, 0x19] {
            assert!(is_response_opcode(op));
        }
        for op in [0x02, 0x0a, 0x1b, 0x1d, 0x1e, 0x52, 0xd2] {
            assert!(!is_response_opcode(op));
        }
    }
}
