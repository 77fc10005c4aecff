//! Position-tracked decoding of big-endian primitives out of a [`Chunk`].

use std::fmt::Write as _;
use std::path::Path;

use crate::errors::{Error, Result};
use crate::source::Chunk;

/// A movable position in a chunk.
///
/// `origin` is a bias applied when computing positions relative to the start
/// of a record whose key bytes were consumed before the record's payload was
/// decompressed; back-references in the read-any-object protocol are measured
/// in the biased coordinate system.
///
/// Cursors are plain values: copy one to remember a position.
#[derive(Clone, Copy, Debug)]
pub struct Cursor {
    index: u64,
    origin: i64,
}

macro_rules! primitive_readers {
    ($($name:ident => $ty:ty),* $(,)?) => {
        $(
            pub fn $name(&mut self, chunk: &Chunk, path: &Path) -> Result<$ty> {
                const N: usize = std::mem::size_of::<$ty>();
                let raw = self.bytes(chunk, N as u64, path)?;
                let mut buf = [0u8; N];
                buf.copy_from_slice(raw);
                Ok(<$ty>::from_be_bytes(buf))
            }
        )*
    };
}

impl Cursor {
    pub fn new(index: u64) -> Self {
        Cursor { index, origin: 0 }
    }

    pub fn with_origin(index: u64, origin: i64) -> Self {
        Cursor { index, origin }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn origin(&self) -> i64 {
        self.origin
    }

    /// Signed distance from `other` to `self`.
    pub fn displacement(&self, other: &Cursor) -> i64 {
        self.index as i64 - other.index as i64
    }

    /// Position relative to the enclosing record, in the biased coordinate
    /// system used by back-references.
    pub fn refpoint(&self) -> i64 {
        self.index as i64 - self.origin
    }

    pub fn skip(&mut self, num_bytes: u64) {
        self.index += num_bytes;
    }

    pub fn move_to(&mut self, index: u64) {
        self.index = index;
    }

    primitive_readers! {
        read_u8 => u8,
        read_i8 => i8,
        read_u16 => u16,
        read_i16 => i16,
        read_u32 => u32,
        read_i32 => i32,
        read_u64 => u64,
        read_i64 => i64,
        read_f32 => f32,
        read_f64 => f64,
    }

    pub fn read_bool(&mut self, chunk: &Chunk, path: &Path) -> Result<bool> {
        Ok(self.read_u8(chunk, path)? != 0)
    }

    /// Borrows `num_bytes` bytes and advances.
    pub fn bytes<'a>(&mut self, chunk: &'a Chunk, num_bytes: u64, path: &Path) -> Result<&'a [u8]> {
        let start = self.index;
        let stop = start + num_bytes;
        let out = chunk.get(start, stop, path)?;
        self.index = stop;
        Ok(out)
    }

    /// Reads a length-prefixed string: one byte of length, or `0xFF` followed
    /// by a 4-byte big-endian length when the string is 255 bytes or longer.
    /// Invalid UTF-8 is decoded lossily, never an error.
    pub fn string(&mut self, chunk: &Chunk, path: &Path) -> Result<String> {
        let length = match self.read_u8(chunk, path)? {
            255 => self.read_u32(chunk, path)? as u64,
            n => n as u64,
        };
        let raw = self.bytes(chunk, length, path)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// Reads a NUL-terminated class name (read-any-object protocol).
    pub fn classname(&mut self, chunk: &Chunk, path: &Path) -> Result<String> {
        let remainder = chunk.get(self.index, chunk.stop(), path)?;
        let end = remainder.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::format(path, "class name is not terminated before the end of the chunk")
        })?;
        let out = String::from_utf8_lossy(&remainder[..end]).into_owned();
        self.index += end as u64 + 1;
        Ok(out)
    }

    /// A human-readable dump of the bytes around this cursor, used in
    /// deserialization errors: hex on the left, printable characters on the
    /// right, with a marker at the cursor position.
    pub fn debug_dump(&self, chunk: &Chunk, offset: i64, limit: u64) -> String {
        let start = (self.index as i64 + offset).max(chunk.start() as i64) as u64;
        let stop = (start + limit).min(chunk.stop());
        let bytes = match chunk.get(start, stop, Path::new("")) {
            Ok(b) => b,
            Err(_) => return String::from("(no bytes available)"),
        };
        let mut out = String::new();
        for (row_index, row) in bytes.chunks(16).enumerate() {
            let row_start = start + row_index as u64 * 16;
            let _ = write!(out, "{row_start:>10}  ");
            for (i, byte) in row.iter().enumerate() {
                let here = row_start + i as u64 == self.index;
                let _ = write!(out, "{}{byte:02x}{}", if here { '[' } else { ' ' }, if here { ']' } else { ' ' });
            }
            for _ in row.len()..16 {
                out.push_str("    ");
            }
            out.push_str(" |");
            for byte in row {
                out.push(if byte.is_ascii_graphic() || *byte == b' ' {
                    *byte as char
                } else {
                    '.'
                });
            }
            out.push_str("|\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(bytes: &[u8]) -> Chunk {
        Chunk::wrap(bytes.to_vec())
    }

    const P: &str = "test.root";

    #[test]
    fn primitives_are_big_endian() {
        let chunk = chunk(&[0x00, 0x00, 0x00, 0x2a, 0x40, 0x09, 0x21, 0xfb, 0x54, 0x44, 0x2d, 0x18]);
        let mut cursor = Cursor::new(0);
        assert_eq!(cursor.read_i32(&chunk, Path::new(P)).unwrap(), 42);
        assert!((cursor.read_f64(&chunk, Path::new(P)).unwrap() - std::f64::consts::PI).abs() < 1e-15);
        assert_eq!(cursor.index(), 12);
    }

    #[test]
    fn short_and_long_strings() {
        let mut data = vec![3, b'a', b'b', b'c'];
        data.push(255);
        data.extend_from_slice(&300u32.to_be_bytes());
        data.extend(std::iter::repeat(b'x').take(300));
        let chunk = chunk(&data);
        let mut cursor = Cursor::new(0);
        assert_eq!(cursor.string(&chunk, Path::new(P)).unwrap(), "abc");
        let long = cursor.string(&chunk, Path::new(P)).unwrap();
        assert_eq!(long.len(), 300);
        assert_eq!(cursor.index(), data.len() as u64);
    }

    #[test]
    fn displacement_and_origin() {
        let chunk = chunk(&[0; 32]);
        let start = Cursor::with_origin(0, -10);
        let mut cursor = start;
        cursor.bytes(&chunk, 6, Path::new(P)).unwrap();
        assert_eq!(cursor.displacement(&start), 6);
        assert_eq!(cursor.refpoint(), 16);
    }

    #[test]
    fn dump_marks_the_cursor() {
        let chunk = chunk(b"root file bytes here");
        let cursor = Cursor::new(5);
        let dump = cursor.debug_dump(&chunk, -5, 16);
        assert!(dump.contains("[66]"));
        assert!(dump.contains("|root file bytes "));
    }
}
