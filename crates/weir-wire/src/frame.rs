//! Length-prefix encoding
//!
//! Message = 4-byte big-endian signed length + payload. The signed length
//! is an interoperability requirement: a negative value on the wire must be
//! recognized and rejected, not wrapped into a huge unsigned one.

use bytes::{BufMut, Bytes, BytesMut};

use weir_core::{WeirError, WeirResult};

/// Size of the length prefix preceding every message.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// On-wire size of a payload once framed. Output-queue byte caps are
/// measured in this unit.
#[inline]
pub fn framed_len(payload_len: usize) -> usize {
    LENGTH_PREFIX_SIZE + payload_len
}

/// Frame a payload into a freshly allocated chunk.
pub fn encode(payload: &[u8]) -> WeirResult<Bytes> {
    let mut buf = BytesMut::with_capacity(framed_len(payload.len()));
    encode_into(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Append the length prefix and payload to `buf`.
pub fn encode_into(payload: &[u8], buf: &mut BytesMut) -> WeirResult<()> {
    if payload.len() > i32::MAX as usize {
        return Err(WeirError::MessageTooLarge(payload.len()));
    }
    buf.reserve(framed_len(payload.len()));
    buf.put_i32(payload.len() as i32);
    buf.put_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let framed = encode(&[1, 2, 3]).unwrap();
        assert_eq!(&framed[..], &[0, 0, 0, 3, 1, 2, 3]);
    }

    #[test]
    fn test_encode_empty_payload() {
        let framed = encode(&[]).unwrap();
        assert_eq!(&framed[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_framed_len() {
        assert_eq!(framed_len(0), 4);
        assert_eq!(framed_len(1000), 1004);
    }

    #[test]
    fn test_encode_into_appends() {
        let mut buf = BytesMut::new();
        encode_into(b"one", &mut buf).unwrap();
        encode_into(b"two", &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 3, b'o', b'n', b'e', 0, 0, 0, 3, b't', b'w', b'o']);
    }
}
