//! Self-delimited binary items.
//!
//! Every page on disk is a concatenation of tagged items produced by this
//! module: LEB128 varints for unsigned integers, single bytes for booleans,
//! varint-length-prefixed byte strings, and a presence byte in front of
//! optional byte strings. The encoding is deterministic (one byte sequence
//! per value) so serialized page length is a stable measure of page fill.
//!
//! Item layouts:
//! ```text
//! uint      [7-bit groups, low first, high bit = continuation]
//! bool      [0x00 | 0x01]
//! bytes     [uint len][len raw bytes]
//! opt bytes [0x00] | [0x01][bytes]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, VellumError};

/// Maximum encoded length of a u64 varint.
pub const MAX_UINT_LEN: usize = 10;

/// Appends a LEB128 varint.
pub fn put_uint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Reads a LEB128 varint.
pub fn get_uint<B: Buf>(buf: &mut B) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        if !buf.has_remaining() {
            return Err(VellumError::corrupt("truncated varint"));
        }
        let byte = buf.get_u8();
        if shift >= 63 && byte > 1 {
            return Err(VellumError::corrupt("varint exceeds 64 bits"));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Appends a boolean as a single byte.
pub fn put_bool(buf: &mut BytesMut, value: bool) {
    buf.put_u8(u8::from(value));
}

/// Reads a boolean, rejecting anything but 0 and 1.
pub fn get_bool<B: Buf>(buf: &mut B) -> Result<bool> {
    if !buf.has_remaining() {
        return Err(VellumError::corrupt("truncated boolean"));
    }
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(VellumError::corrupt(format!("invalid boolean byte: {}", other))),
    }
}

/// Appends a length-prefixed byte string.
pub fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_uint(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Reads a length-prefixed byte string.
pub fn get_bytes<B: Buf>(buf: &mut B) -> Result<Bytes> {
    let len = get_uint(buf)? as usize;
    if buf.remaining() < len {
        return Err(VellumError::corrupt(format!(
            "byte string of {} bytes exceeds remaining {}",
            len,
            buf.remaining()
        )));
    }
    Ok(buf.copy_to_bytes(len))
}

/// Appends an optional byte string: a presence byte, then the bytes.
pub fn put_opt_bytes(buf: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            put_bool(buf, true);
            put_bytes(buf, bytes);
        }
        None => put_bool(buf, false),
    }
}

/// Reads an optional byte string.
pub fn get_opt_bytes<B: Buf>(buf: &mut B) -> Result<Option<Bytes>> {
    if get_bool(buf)? {
        Ok(Some(get_bytes(buf)?))
    } else {
        Ok(None)
    }
}
