use bytes::{Buf, BufMut};
use commonware_codec::Error;

/// Helper to write a fixed-size byte array.
pub(crate) fn write_bytes<const N: usize>(bytes: &[u8; N], writer: &mut impl BufMut) {
    writer.put_slice(bytes);
}

/// Helper to read a fixed-size byte array.
pub(crate) fn read_bytes<const N: usize>(reader: &mut impl Buf) -> Result<[u8; N], Error> {
    if reader.remaining() < N {
        return Err(Error::EndOfBuffer);
    }
    let mut out = [0u8; N];
    reader.copy_to_slice(&mut out);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_bytes_rejects_truncated_buffers() {
        let buf = [1u8, 2, 3];
        let mut reader = &buf[..];
        let err = read_bytes::<4>(&mut reader).expect_err("should reject short buffer");
        assert!(matches!(err, Error::EndOfBuffer));
    }

    #[test]
    fn write_read_roundtrip() {
        let bytes = [7u8; 16];
        let mut buf = Vec::new();
        write_bytes(&bytes, &mut buf);
        let mut reader = buf.as_slice();
        assert_eq!(read_bytes::<16>(&mut reader).unwrap(), bytes);
        assert_eq!(reader.len(), 0);
    }
}
