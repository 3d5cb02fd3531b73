//! Generic payload decoders.
//!
//! These are building blocks for the decode hook of a device registration.
//! Sensor-specific unit conversions are left to the caller.

use bytes::{Buf, Bytes};

use crate::error::{DecodeError, DecodeResult};

fn ensure_len(data: &[u8], expected: usize) -> DecodeResult<()> {
    if data.len() < expected {
        return Err(DecodeError::InsufficientBytes {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Return the payload unchanged.
pub fn raw(data: &[u8]) -> DecodeResult<Bytes> {
    Ok(Bytes::copy_from_slice(data))
}

/// Decode the first byte.
pub fn u8(data: &[u8]) -> DecodeResult<u8> {
    ensure_len(data, 1)?;
    Ok(data[0])
}

/// Decode a little-endian `u16` from the start of the payload.
pub fn u16_le(data: &[u8]) -> DecodeResult<u16> {
    ensure_len(data, 2)?;
    let mut buf = data;
    Ok(buf.get_u16_le())
}

/// Decode a little-endian `i16` from the start of the payload.
pub fn i16_le(data: &[u8]) -> DecodeResult<i16> {
    ensure_len(data, 2)?;
    let mut buf = data;
    Ok(buf.get_i16_le())
}

/// Decode a little-endian `u32` from the start of the payload.
pub fn u32_le(data: &[u8]) -> DecodeResult<u32> {
    ensure_len(data, 4)?;
    let mut buf = data;
    Ok(buf.get_u32_le())
}

/// Decode a UTF-8 string, dropping trailing NUL padding.
pub fn utf8(data: &[u8]) -> DecodeResult<String> {
    let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    std::str::from_utf8(&data[..end])
        .map(str::to_string)
        .map_err(|e| DecodeError::invalid(format!("not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_little_endian() {
        assert_eq!(u8(&[0x55, 0x01]).unwrap(), 0x55);
        assert_eq!(u16_le(&[0x20, 0x03]).unwrap(), 800);
        assert_eq!(i16_le(&[0x18, 0xfc]).unwrap(), -1000);
        assert_eq!(u32_le(&[0x01, 0x00, 0x01, 0x00]).unwrap(), 65537);
    }

    #[test]
    fn test_short_payload_is_rejected() {
        assert_eq!(
            u16_le(&[0x01]),
            Err(DecodeError::InsufficientBytes {
                expected: 2,
                actual: 1
            })
        );
        assert!(matches!(
            u8(&[]),
            Err(DecodeError::InsufficientBytes { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn test_utf8_strips_padding() {
        assert_eq!(utf8(b"Thingy\0\0").unwrap(), "Thingy");
        assert_eq!(utf8(b"").unwrap(), "");
        assert!(matches!(utf8(&[0xff, 0xfe]), Err(DecodeError::InvalidValue(_))));
    }

    #[test]
    fn test_raw_copies() {
        assert_eq!(raw(&[1, 2, 3]).unwrap().as_ref(), &[1, 2, 3]);
    }
}
