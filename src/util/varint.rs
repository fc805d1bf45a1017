//! Variable-length integer encoding utilities.
//!
//! Seven bits per byte, least significant group first, high bit set on every
//! byte but the last. Posting blocks and the TOC header use this encoding.

use byteorder::ReadBytesExt;
use std::io::{Read, Write};

use crate::error::{Result, WhorlError};

/// Longest encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

/// Append the encoding of `value` to `buf`.
pub fn encode_into(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MAX_VARINT_LEN);
    encode_into(&mut bytes, value);
    bytes
}

/// Decode a value from the start of `bytes`, returning it with the number of
/// bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 || (shift == 63 && byte > 1) {
            return Err(WhorlError::format("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }

        shift += 7;
    }

    Err(WhorlError::format("Incomplete VarInt"))
}

/// Decode a value at `*pos`, advancing `pos` past it.
pub fn decode_at(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let tail = bytes
        .get(*pos..)
        .ok_or_else(|| WhorlError::format("VarInt position out of bounds"))?;
    let (value, read) = decode_u64(tail)?;
    *pos += read;
    Ok(value)
}

/// Write a variable-length encoded u64 to a writer.
pub fn write_u64<W: Write>(writer: &mut W, value: u64) -> Result<usize> {
    let bytes = encode_u64(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut bytes = [0u8; MAX_VARINT_LEN];
    for i in 0..MAX_VARINT_LEN {
        bytes[i] = reader.read_u8()?;
        if bytes[i] & 0x80 == 0 {
            return Ok(decode_u64(&bytes[..=i])?.0);
        }
    }
    Err(WhorlError::format("VarInt overflow"))
}

/// Encoded length of `value` in bytes.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}
