//! Variable Byte Integer encoding/decoding for MQTT.
//!
//! MQTT uses a variable-length encoding for the remaining length, property
//! lengths and a handful of property values. Each byte carries 7 data bits;
//! the high bit says whether more bytes follow:
//! - 0-127: 1 byte
//! - 128-16383: 2 bytes
//! - 16384-2097151: 3 bytes
//! - 2097152-268435455: 4 bytes

use crate::error::{ProtocolError, Result};

/// Largest value a variable byte integer can carry.
pub const MAX: u32 = 268_435_455;

/// Decode a variable byte integer from a buffer.
///
/// Returns `Ok(Some((value, bytes_consumed)))` if successful,
/// `Ok(None)` if more data is needed, or `Err` if the encoding is invalid
/// (longer than 4 bytes, or not using the minimum number of bytes).
///
/// # Example
/// ```
/// use mqfive_core::varint::decode;
/// let buf = [0x80, 0x01]; // Encodes 128
/// let (value, consumed) = decode(&buf).unwrap().unwrap();
/// assert_eq!(value, 128);
/// assert_eq!(consumed, 2);
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value = 0u32;

    for (i, &byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(ProtocolError::InvalidRemainingLength);
        }

        value |= ((byte & 0x7F) as u32) << (7 * i);

        if (byte & 0x80) == 0 {
            // MQTT-1.5.5-1: minimum number of bytes
            if i > 0 && byte == 0 {
                return Err(ProtocolError::MalformedPacket(
                    "Variable byte integer is not minimally encoded".into(),
                ));
            }
            return Ok(Some((value, i + 1)));
        }
    }

    // Need more bytes
    Ok(None)
}

/// Encode a value as a variable byte integer, appending to a Vec.
///
/// Returns the number of bytes written. Values above [`MAX`] are rejected
/// before anything is written.
///
/// # Example
/// ```
/// use mqfive_core::varint::encode_to_vec;
/// let mut buf = Vec::new();
/// let written = encode_to_vec(300, &mut buf).unwrap();
/// assert_eq!(written, 2);
/// assert_eq!(&buf, &[0xAC, 0x02]);
/// ```
pub fn encode_to_vec(value: u32, buf: &mut Vec<u8>) -> Result<usize> {
    check(value as u64)?;
    let mut value = value;
    let start = buf.len();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    Ok(buf.len() - start)
}

/// Reject values that do not fit a variable byte integer.
pub fn check(value: u64) -> Result<()> {
    if value > MAX as u64 {
        return Err(ProtocolError::VarIntOutOfRange(value));
    }
    Ok(())
}

/// Calculate the number of bytes needed to encode a value.
///
/// # Example
/// ```
/// use mqfive_core::varint::encoded_len;
/// assert_eq!(encoded_len(0), 1);
/// assert_eq!(encoded_len(127), 1);
/// assert_eq!(encoded_len(128), 2);
/// assert_eq!(encoded_len(16383), 2);
/// assert_eq!(encoded_len(16384), 3);
/// ```
pub fn encoded_len(mut value: u32) -> usize {
    let mut len = 0;
    loop {
        len += 1;
        value /= 128;
        if value == 0 {
            break;
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_single_byte() {
        assert_eq!(decode(&[0]).unwrap(), Some((0, 1)));
        assert_eq!(decode(&[0x7F]).unwrap(), Some((127, 1)));
    }

    #[test]
    fn test_decode_two_bytes() {
        assert_eq!(decode(&[0x80, 0x01]).unwrap(), Some((128, 2)));
        assert_eq!(decode(&[0xFF, 0x7F]).unwrap(), Some((16383, 2)));
    }

    #[test]
    fn test_decode_four_bytes() {
        assert_eq!(
            decode(&[0x80, 0x80, 0x80, 0x01]).unwrap(),
            Some((2097152, 4))
        );
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap(),
            Some((268435455, 4))
        );
    }

    #[test]
    fn test_decode_incomplete() {
        assert_eq!(decode(&[]).unwrap(), None);
        assert_eq!(decode(&[0x80]).unwrap(), None);
        assert_eq!(decode(&[0x80, 0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_decode_invalid() {
        // Five bytes: continuation bit set on the fourth
        assert!(decode(&[0x80, 0x80, 0x80, 0x80, 0x01]).is_err());
        // Zero padded onto a second byte
        assert!(decode(&[0x80, 0x00]).is_err());
        assert!(decode(&[0xFF, 0x80, 0x00]).is_err());
    }

    #[test]
    fn test_boundary_lengths() {
        let cases = [
            (0u32, 1usize),
            (127, 1),
            (128, 2),
            (16383, 2),
            (16384, 3),
            (2097151, 3),
            (2097152, 4),
            (268435455, 4),
        ];
        for (value, len) in cases {
            let mut buf = Vec::new();
            assert_eq!(encode_to_vec(value, &mut buf).unwrap(), len, "value {value}");
            assert_eq!(encoded_len(value), len);
            assert_eq!(decode(&buf).unwrap(), Some((value, len)));
        }
    }

    #[test]
    fn test_encode_out_of_range() {
        let mut buf = Vec::new();
        assert_eq!(
            encode_to_vec(268435456, &mut buf),
            Err(ProtocolError::VarIntOutOfRange(268435456))
        );
        assert!(buf.is_empty());
    }
}
