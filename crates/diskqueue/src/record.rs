//! Record framing.
//!
//! A frame is `u32 payload_len | payload | u8 valid_flag`, little-endian.
//! The flag is written last, so a frame whose flag is missing or not
//! [`RECORD_VALID`] was torn by a crash and marks the tail of the log.

use std::io::{self, Read, Write};

/// Bytes of framing around a payload: the length prefix plus the flag.
pub const FRAMING_LEN: usize = 4 + 1;

/// Value of the trailing flag byte of a complete frame.
pub const RECORD_VALID: u8 = 1;

/// Frame encoder/decoder.
pub struct Record;

impl Record {
    /// Total frame length for a payload of `payload_len` bytes.
    pub fn framed_len(payload_len: usize) -> u64 {
        (payload_len + FRAMING_LEN) as u64
    }

    /// Write one frame to `out`.
    pub fn write<W: Write>(payload: &[u8], mut out: W) -> io::Result<()> {
        out.write_all(&(payload.len() as u32).to_le_bytes())?;
        out.write_all(payload)?;
        out.write_all(&[RECORD_VALID])?;
        Ok(())
    }

    /// Attempt to read one frame from `reader`.
    ///
    /// Returns `Ok(Some(payload))` for a complete frame, `Ok(None)` for a
    /// clean EOF, a zeroed length prefix, a truncated frame, or an invalid
    /// flag — all of which mark the tail of the log.
    pub fn read<R: Read>(mut reader: R) -> io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(&mut reader, &mut len_buf)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Partial => return Ok(None),
            ReadOutcome::Full => {}
        }
        let len = u32::from_le_bytes(len_buf);
        if len == 0 {
            // Zero-length records are never written; this is zeroed or
            // torn tail data.
            return Ok(None);
        }

        let mut payload = vec![0u8; len as usize];
        match read_exact_or_eof(&mut reader, &mut payload)? {
            ReadOutcome::Eof | ReadOutcome::Partial => return Ok(None),
            ReadOutcome::Full => {}
        }

        let mut flag = [0u8; 1];
        match read_exact_or_eof(&mut reader, &mut flag)? {
            ReadOutcome::Eof | ReadOutcome::Partial => return Ok(None),
            ReadOutcome::Full => {}
        }
        if flag[0] != RECORD_VALID {
            return Ok(None);
        }

        Ok(Some(payload))
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        Record::write(b"hello", &mut buf).unwrap();
        assert_eq!(buf.len() as u64, Record::framed_len(5));
        assert_eq!(Record::read(buf.as_slice()).unwrap().unwrap(), b"hello");
    }

    #[test]
    fn empty_input_is_tail() {
        assert_eq!(Record::read(&[][..]).unwrap(), None);
    }

    #[test]
    fn zeroed_prefix_is_tail() {
        assert_eq!(Record::read(&[0u8; 64][..]).unwrap(), None);
    }

    #[test]
    fn invalid_flag_is_tail() {
        let mut buf = Vec::new();
        Record::write(b"hello", &mut buf).unwrap();
        *buf.last_mut().unwrap() = 0;
        assert_eq!(Record::read(buf.as_slice()).unwrap(), None);
    }

    proptest! {
        #[test]
        fn truncated_frame_is_tail(payload in proptest::collection::vec(any::<u8>(), 1..256), cut in 0usize..256) {
            let mut buf = Vec::new();
            Record::write(&payload, &mut buf).unwrap();
            let cut = cut.min(buf.len() - 1);
            prop_assert_eq!(Record::read(&buf[..cut]).unwrap(), None);
        }
    }
}
