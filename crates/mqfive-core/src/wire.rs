//! Wire primitives: fixed-width integers, variable byte integers,
//! length-prefixed UTF-8 strings and binary data.
//!
//! Reading goes through [`Decoder`], a cursor over one packet body. Running
//! out of bytes inside a body is a malformed packet, never "need more data":
//! the caller has already checked that the whole packet is buffered.
//!
//! Writers append to a `Vec<u8>` and check ranges before touching it.

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::varint;

/// Maximum length of a string or binary field.
pub const MAX_FIELD_LEN: usize = u16::MAX as usize;

/// Cursor over a packet body.
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        if self.pos >= self.buf.len() {
            return Err(ProtocolError::IncompletePacket { needed: 1, have: 0 });
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a Variable Byte Integer.
    pub fn read_var_int(&mut self) -> Result<u32> {
        match varint::decode(&self.buf[self.pos..])? {
            Some((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            None => Err(ProtocolError::IncompletePacket {
                needed: 1,
                have: 0,
            }),
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(ProtocolError::IncompletePacket {
                needed: len,
                have: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Read everything left in the body.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let bytes = &self.buf[self.pos..];
        self.pos = self.buf.len();
        bytes
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        let s = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        // MQTT-1.5.4-2: UTF-8 string MUST NOT contain null character U+0000
        if s.contains('\0') {
            return Err(ProtocolError::MalformedPacket(
                "UTF-8 string must not contain null character".into(),
            ));
        }
        Ok(s.to_owned())
    }

    pub fn read_binary(&mut self) -> Result<Bytes> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(Bytes::copy_from_slice(bytes))
    }

    /// Split off a sub-decoder covering the next `len` bytes.
    pub fn sub(&mut self, len: usize) -> Result<Decoder<'a>> {
        let bytes = self.read_bytes(len)?;
        Ok(Decoder::new(bytes))
    }
}

pub fn write_u16(value: u16, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn write_u32(value: u32, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&value.to_be_bytes());
}

pub fn write_var_int(value: u32, buf: &mut Vec<u8>) -> Result<()> {
    varint::encode_to_vec(value, buf).map(|_| ())
}

/// Check that a string can be encoded as an MQTT UTF-8 string.
pub fn check_string(s: &str) -> Result<()> {
    if s.len() > MAX_FIELD_LEN {
        return Err(ProtocolError::StringTooLong(s.len()));
    }
    if s.contains('\0') {
        return Err(ProtocolError::Violation(
            "UTF-8 string must not contain null character".into(),
        ));
    }
    Ok(())
}

pub fn write_string(s: &str, buf: &mut Vec<u8>) -> Result<()> {
    check_string(s)?;
    write_u16(s.len() as u16, buf);
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

pub fn write_binary(data: &[u8], buf: &mut Vec<u8>) -> Result<()> {
    if data.len() > MAX_FIELD_LEN {
        return Err(ProtocolError::BinaryTooLong(data.len()));
    }
    write_u16(data.len() as u16, buf);
    buf.extend_from_slice(data);
    Ok(())
}
