//! Little-endian buffer codec.
//!
//! All durable and wire formats in this workspace are written through these
//! traits, so that encoding stays explicit about widths and byte order, and
//! decoding never panics on short input.

use thiserror::Error;

/// Error returned when decoding from a [`BufReader`] fails.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short: expected {expected} more bytes, {given} available")]
    BufferLength { expected: usize, given: usize },
    #[error("invalid tag {tag} for {kind}")]
    InvalidTag { tag: u8, kind: &'static str },
}

/// A sink for encoding.
pub trait BufWriter {
    fn put_slice(&mut self, slice: &[u8]);

    fn put_u8(&mut self, val: u8) {
        self.put_slice(&[val]);
    }

    fn put_u16(&mut self, val: u16) {
        self.put_slice(&val.to_le_bytes());
    }

    fn put_u32(&mut self, val: u32) {
        self.put_slice(&val.to_le_bytes());
    }

    fn put_u64(&mut self, val: u64) {
        self.put_slice(&val.to_le_bytes());
    }

    fn put_i8(&mut self, val: i8) {
        self.put_slice(&val.to_le_bytes());
    }

    fn put_i32(&mut self, val: i32) {
        self.put_slice(&val.to_le_bytes());
    }

    fn put_i64(&mut self, val: i64) {
        self.put_slice(&val.to_le_bytes());
    }
}

impl BufWriter for Vec<u8> {
    fn put_slice(&mut self, slice: &[u8]) {
        self.extend_from_slice(slice);
    }
}

/// A source for decoding. The lifetime allows zero-copy slice reads.
pub trait BufReader<'a> {
    fn get_slice(&mut self, size: usize) -> Result<&'a [u8], DecodeError>;

    fn remaining(&self) -> usize;

    fn get_u8(&mut self) -> Result<u8, DecodeError> {
        self.get_array().map(u8::from_le_bytes)
    }

    fn get_u16(&mut self) -> Result<u16, DecodeError> {
        self.get_array().map(u16::from_le_bytes)
    }

    fn get_u32(&mut self) -> Result<u32, DecodeError> {
        self.get_array().map(u32::from_le_bytes)
    }

    fn get_u64(&mut self) -> Result<u64, DecodeError> {
        self.get_array().map(u64::from_le_bytes)
    }

    fn get_i8(&mut self) -> Result<i8, DecodeError> {
        self.get_array().map(i8::from_le_bytes)
    }

    fn get_i32(&mut self) -> Result<i32, DecodeError> {
        self.get_array().map(i32::from_le_bytes)
    }

    fn get_i64(&mut self) -> Result<i64, DecodeError> {
        self.get_array().map(i64::from_le_bytes)
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.get_slice(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(slice);
        Ok(arr)
    }
}

impl<'a> BufReader<'a> for &'a [u8] {
    fn get_slice(&mut self, size: usize) -> Result<&'a [u8], DecodeError> {
        if self.len() < size {
            return Err(DecodeError::BufferLength {
                expected: size,
                given: self.len(),
            });
        }
        let (ret, rest) = self.split_at(size);
        *self = rest;
        Ok(ret)
    }

    fn remaining(&self) -> usize {
        self.len()
    }
}

/// A datatype which can be encoded into a [`BufWriter`].
pub trait Encode {
    fn encode<W: BufWriter>(&self, writer: &mut W);

    fn to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }
}

/// A datatype which can be decoded from a [`BufReader`].
pub trait Decode: Sized {
    fn decode<'a, R: BufReader<'a>>(reader: &mut R) -> Result<Self, DecodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn short_read_is_an_error() {
        let mut buf: &[u8] = &[1, 2, 3];
        assert_eq!(
            buf.get_u32(),
            Err(DecodeError::BufferLength { expected: 4, given: 3 })
        );
    }

    proptest! {
        #[test]
        fn scalar_roundtrip(a in any::<u8>(), b in any::<u16>(), c in any::<u32>(), d in any::<u64>(), e in any::<i8>(), f in any::<i32>(), g in any::<i64>()) {
            let mut buf = Vec::new();
            buf.put_u8(a);
            buf.put_u16(b);
            buf.put_u32(c);
            buf.put_u64(d);
            buf.put_i8(e);
            buf.put_i32(f);
            buf.put_i64(g);

            let mut rd = buf.as_slice();
            prop_assert_eq!(rd.get_u8().unwrap(), a);
            prop_assert_eq!(rd.get_u16().unwrap(), b);
            prop_assert_eq!(rd.get_u32().unwrap(), c);
            prop_assert_eq!(rd.get_u64().unwrap(), d);
            prop_assert_eq!(rd.get_i8().unwrap(), e);
            prop_assert_eq!(rd.get_i32().unwrap(), f);
            prop_assert_eq!(rd.get_i64().unwrap(), g);
            prop_assert_eq!(rd.remaining(), 0);
        }
    }
}
