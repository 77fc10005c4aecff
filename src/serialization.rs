//! Helpers for encoding the framing conventions shared by every record.

use chrono::{Datelike, Local, Timelike};

use crate::{BYTE_COUNT_MASK, NEW_CLASS_TAG};

/// Encodes a length-prefixed string: one byte of length, or `0xFF` plus a
/// 4-byte big-endian length for strings of 255 bytes or more.
pub fn string(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 5);
    if bytes.len() < 255 {
        out.push(bytes.len() as u8);
    } else {
        out.push(255);
        out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    }
    out.extend_from_slice(bytes);
    out
}

/// Serialized size of a length-prefixed string without building it.
pub fn string_size(value: &str) -> u64 {
    let n = value.as_bytes().len() as u64;
    n + if n < 255 { 1 } else { 5 }
}

/// The 6-byte num-bytes/version header. `num_bytes` counts the bytes that
/// follow the 4-byte count field, excluding the 2-byte version, which this
/// helper adds.
pub fn numbytes_version(num_bytes: usize, version: u16) -> [u8; 6] {
    let mut out = [0u8; 6];
    out[..4].copy_from_slice(&((num_bytes as u32 + 2) | BYTE_COUNT_MASK).to_be_bytes());
    out[4..].copy_from_slice(&version.to_be_bytes());
    out
}

/// The 8-byte header that introduces an object with an inline class name in
/// the read-any-object protocol: a byte count and the new-class tag.
pub fn object_any_header(num_bytes_after_count: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&((num_bytes_after_count as u32) | BYTE_COUNT_MASK).to_be_bytes());
    out[4..].copy_from_slice(&NEW_CLASS_TAG.to_be_bytes());
    out
}

/// A serialized `TObject` base: short version 1, zero unique id, and the
/// on-heap/not-deleted status bits plus any extras.
pub fn tobject(extra_bits: u32) -> [u8; 10] {
    let mut out = [0u8; 10];
    out[..2].copy_from_slice(&1u16.to_be_bytes());
    // fUniqueID stays zero.
    out[6..].copy_from_slice(
        &(crate::ObjectBits::IS_ON_HEAP.bits() | crate::ObjectBits::NOT_DELETED.bits() | extra_bits)
            .to_be_bytes(),
    );
    out
}

/// A serialized, framed `TNamed`: `TObject` base plus name and title.
pub fn tnamed(name: &str, title: &str, extra_bits: u32) -> Vec<u8> {
    let mut body = tobject(extra_bits).to_vec();
    body.extend_from_slice(&string(name));
    body.extend_from_slice(&string(title));
    let mut out = numbytes_version(body.len(), 1).to_vec();
    out.extend_from_slice(&body);
    out
}

/// ROOT's packed date/time encoding, relative to 1995.
pub fn datime_code(datetime: chrono::DateTime<Local>) -> u32 {
    let year = (datetime.year() as u32).saturating_sub(1995);
    (year << 26)
        | (datetime.month() << 22)
        | (datetime.day() << 17)
        | (datetime.hour() << 12)
        | (datetime.minute() << 6)
        | datetime.second()
}

/// The current moment in ROOT's packed encoding.
pub fn datime_now() -> u32 {
    datime_code(Local::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn short_string_is_length_prefixed() {
        assert_eq!(string("hist"), vec![4, b'h', b'i', b's', b't']);
        assert_eq!(string_size("hist"), 5);
    }

    #[test]
    fn long_string_gets_escape_byte() {
        let long = "x".repeat(300);
        let out = string(&long);
        assert_eq!(out[0], 255);
        assert_eq!(&out[1..5], &300u32.to_be_bytes());
        assert_eq!(out.len() as u64, string_size(&long));
    }

    #[test]
    fn numbytes_header_sets_the_count_mask() {
        let out = numbytes_version(10, 4);
        assert_eq!(u32::from_be_bytes(out[..4].try_into().unwrap()), 12 | BYTE_COUNT_MASK);
        assert_eq!(u16::from_be_bytes(out[4..].try_into().unwrap()), 4);
    }

    #[test]
    fn datime_packs_fields() {
        let dt = Local.with_ymd_and_hms(2005, 3, 14, 15, 9, 26).unwrap();
        let code = datime_code(dt);
        assert_eq!(code >> 26, 10);
        assert_eq!((code >> 22) & 0xF, 3);
        assert_eq!((code >> 17) & 0x1F, 14);
        assert_eq!((code >> 12) & 0x1F, 15);
        assert_eq!((code >> 6) & 0x3F, 9);
        assert_eq!(code & 0x3F, 26);
    }
}
