//! LEB128-style variable-length integers.
//!
//! Unsigned values use 7 bits per byte with a continuation bit. Signed
//! values (segment ids may be negative for realtime segments) go through a
//! zigzag mapping first so small magnitudes stay short.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;

use crate::error::{Result, TesseraError};

/// Longest encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Append the encoding of `value` to `out`. Returns the number of bytes added.
pub fn encode_u64_into(mut value: u64, out: &mut Vec<u8>) -> usize {
    let start = out.len();
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out.len() - start
}

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MAX_VARINT_LEN);
    encode_u64_into(value, &mut bytes);
    bytes
}

/// Decode a u64 value, returning it with the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0u32;

    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(TesseraError::corrupt("varint overflow"));
        }
        result |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
        shift += 7;
    }

    Err(TesseraError::corrupt("incomplete varint"))
}

/// Zigzag-map a signed value onto the unsigned range.
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Write a variable-length encoded u64 to a writer.
pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<usize> {
    let bytes = encode_u64(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u64 from a reader, also returning the raw
/// bytes consumed so callers can fold them into a checksum.
pub fn read_u64_raw<R: Read>(reader: &mut R) -> Result<(u64, Vec<u8>)> {
    let mut raw = Vec::with_capacity(4);
    loop {
        let byte = reader.read_u8()?;
        raw.push(byte);
        if byte & 0x80 == 0 {
            break;
        }
        if raw.len() >= MAX_VARINT_LEN {
            return Err(TesseraError::corrupt("varint overflow"));
        }
    }
    let (value, _) = decode_u64(&raw)?;
    Ok((value, raw))
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    read_u64_raw(reader).map(|(value, _)| value)
}
