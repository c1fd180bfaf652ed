//! Name-value pair stream codec used by Params, GetValues, and GetValuesResult.
//!
//! "FastCGI transmits a name-value pair as the length of the name, followed
//! by the length of the value, followed by the name, followed by the value.
//! Lengths of 127 bytes and less can be encoded in one byte, while longer
//! lengths are always encoded in four bytes" -- FCGI spec.

use crate::error::FcgiError;
use indexmap::IndexMap;

/// An ordered name-to-value mapping. Insertion order is preserved even
/// when a later entry overwrites an earlier one, matching the behavior of
/// a Python dict (the reference implementation's underlying type).
pub type NameValues = IndexMap<Vec<u8>, Vec<u8>>;

fn read_length(b: &[u8], pos: &mut usize) -> Result<usize, FcgiError> {
    if *pos >= b.len() {
        return Err(FcgiError::Truncated);
    }
    let b0 = b[*pos];
    if b0 & 0x80 == 0 {
        *pos += 1;
        Ok(b0 as usize)
    } else {
        if *pos + 4 > b.len() {
            return Err(FcgiError::Truncated);
        }
        let n = u32::from_be_bytes([b[*pos], b[*pos + 1], b[*pos + 2], b[*pos + 3]]) & 0x7fff_ffff;
        *pos += 4;
        Ok(n as usize)
    }
}

fn write_length(out: &mut Vec<u8>, n: usize) {
    if n < 128 {
        out.push(n as u8);
    } else {
        let tagged = (n as u32) | 0x8000_0000;
        out.extend_from_slice(&tagged.to_be_bytes());
    }
}

/// Decode a name-value pair stream. Duplicate names overwrite in stream
/// order (later wins), but retain their first position -- the same rule a
/// plain map literal follows.
pub fn decode_name_values(b: &[u8]) -> Result<NameValues, FcgiError> {
    let mut pos = 0;
    let mut map = NameValues::new();
    while pos < b.len() {
        let name_len = read_length(b, &mut pos)?;
        let value_len = read_length(b, &mut pos)?;
        if pos + name_len > b.len() {
            return Err(FcgiError::Truncated);
        }
        let name = b[pos..pos + name_len].to_vec();
        pos += name_len;
        if pos + value_len > b.len() {
            return Err(FcgiError::Truncated);
        }
        let value = b[pos..pos + value_len].to_vec();
        pos += value_len;
        map.insert(name, value);
    }
    Ok(map)
}

/// Encode a name-value pair stream. Entry order on the wire matches the
/// iteration order of `pairs`.
pub fn encode_name_values(pairs: &NameValues) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in pairs {
        write_length(&mut out, name.len());
        write_length(&mut out, value.len());
        out.extend_from_slice(name);
        out.extend_from_slice(value);
    }
    out
}
