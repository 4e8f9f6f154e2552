//! Wire-level framing: the length-prefixed reliable send/receive primitive,
//! the `a_block` field reader, and the response-token vocabulary.

use std::io::{Read, Write};

use super::{SessionError, SessionResult};

/// Read a `u32`-length-prefixed, then exactly that many bytes. Rejects a
/// declared length over `max_len` without attempting to read it.
pub fn read_framed<R: Read>(r: &mut R, max_len: usize) -> SessionResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > max_len {
        return Err(SessionError::FrameTooLarge { declared: len, max: max_len });
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

/// Write `bytes` prefixed with its `u32` little-endian length.
pub fn write_framed<W: Write>(w: &mut W, bytes: &[u8]) -> SessionResult<()> {
    w.write_all(&(bytes.len() as u32).to_le_bytes())?;
    w.write_all(bytes)?;
    Ok(())
}

/// Sequential reader over an `a_block`'s `u32 len | bytes` fields.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    /// Wrap `buf` for sequential field extraction.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Read the next `u32 len | bytes` field.
    pub fn read_field(&mut self) -> SessionResult<&'a [u8]> {
        if self.pos + 4 > self.buf.len() {
            return Err(SessionError::MalformedFrame("truncated field length"));
        }
        let len = u32::from_le_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap()) as usize;
        self.pos += 4;
        if self.pos + len > self.buf.len() {
            return Err(SessionError::MalformedFrame("truncated field body"));
        }
        let field = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(field)
    }

    /// Read the next field and interpret it as UTF-8 (lossily).
    pub fn read_string_field(&mut self) -> SessionResult<String> {
        Ok(String::from_utf8_lossy(self.read_field()?).into_owned())
    }
}

/// Response token vocabulary (see the external-interfaces response table).
pub mod tokens {
    pub const OK: &str = "OK";
    pub const OK_INSERT: &str = "OK_INSERT";
    pub const OK_UPDATE: &str = "OK_UPDATE";
    pub const ERR_LOGIN: &str = "ERR_LOGIN";
    pub const ERR_USER_EXISTS: &str = "ERR_USER_EXISTS";
    pub const ERR_NO_USER: &str = "ERR_NO_USER";
    pub const ERR_NO_DATA: &str = "ERR_NO_DATA";
    pub const ERR_KEY: &str = "ERR_KEY";
    pub const ERR_INV_CMD: &str = "ERR_INV_CMD";
    pub const ERR_MSG_FMT: &str = "ERR_MSG_FMT";
    pub const ERR_SERVER: &str = "ERR_SERVER";
    pub const ERR_QUOTA_REQ: &str = "ERR_QUOTA_REQ";
    pub const ERR_QUOTA_UP: &str = "ERR_QUOTA_UP";
    pub const ERR_QUOTA_DOWN: &str = "ERR_QUOTA_DOWN";
    pub const ERR_SO: &str = "ERR_SO";
    pub const ERR_FUNC: &str = "ERR_FUNC";
}

/// Build a response: a token, optionally followed by `u32 len | payload`.
pub fn encode_response(token: &str, payload: Option<&[u8]>) -> Vec<u8> {
    let mut out = token.as_bytes().to_vec();
    if let Some(p) = payload {
        out.extend_from_slice(&(p.len() as u32).to_le_bytes());
        out.extend_from_slice(p);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn framed_round_trip() {
        let mut buf = Vec::new();
        write_framed(&mut buf, b"hello").unwrap();
        let mut cursor = Cursor::new(buf);
        let out = read_framed(&mut cursor, 1024).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        write_framed(&mut buf, &vec![0u8; 100]).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(read_framed(&mut cursor, 10).is_err());
    }

    #[test]
    fn field_reader_reads_sequential_fields() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(b"abc");
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(b"xy");

        let mut reader = FieldReader::new(&buf);
        assert_eq!(reader.read_string_field().unwrap(), "abc");
        assert_eq!(reader.read_string_field().unwrap(), "xy");
    }

    #[test]
    fn field_reader_rejects_truncated_body() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_le_bytes());
        buf.extend_from_slice(b"short");
        let mut reader = FieldReader::new(&buf);
        assert!(reader.read_field().is_err());
    }

    #[test]
    fn encode_response_with_and_without_payload() {
        assert_eq!(encode_response(tokens::ERR_LOGIN, None), b"ERR_LOGIN");
        let encoded = encode_response(tokens::OK, Some(b"hi"));
        assert_eq!(&encoded[..2], b"OK");
        assert_eq!(u32::from_le_bytes(encoded[2..6].try_into().unwrap()), 2);
        assert_eq!(&encoded[6..], b"hi");
    }
}
