//! The per-block compression codec multiplexer.
//!
//! Every compressed payload is a concatenation of blocks, each led by a
//! 9-byte header (17 for LZ4, which carries an xxHash64 checksum of the
//! compressed bytes):
//!
//! ```text
//! 2 bytes  algorithm tag: "ZL", "XZ", "L4", "ZS" ("CS" is retired)
//! 1 byte   method
//! 3 bytes  compressed length, packed little  (c1 | c2 << 8 | c3 << 16)
//! 3 bytes  uncompressed length, same packing
//! ```

use std::io::Read;
use std::path::Path;

use tracing::debug;

use crate::cursor::Cursor;
use crate::errors::{Error, Result};
use crate::source::Chunk;

/// The 24-bit block-length fields cap block payloads at 16 MiB - 1.
const MAX_BLOCK_BYTES: usize = 0x00FF_FFFF;

/// A compression algorithm and level, as stored in `fCompress` fields
/// (`algorithm * 100 + level`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Zlib(u8),
    Lzma(u8),
    Lz4(u8),
    Zstd(u8),
}

impl Compression {
    pub fn from_code(code: i32) -> Option<Compression> {
        let (algorithm, level) = (code / 100, (code % 100) as u8);
        if level == 0 {
            return None;
        }
        match algorithm {
            1 => Some(Compression::Zlib(level)),
            2 => Some(Compression::Lzma(level)),
            4 => Some(Compression::Lz4(level)),
            5 => Some(Compression::Zstd(level)),
            _ => None,
        }
    }

    pub fn code(&self) -> i32 {
        let (algorithm, level) = match *self {
            Compression::Zlib(level) => (1, level),
            Compression::Lzma(level) => (2, level),
            Compression::Lz4(level) => (4, level),
            Compression::Zstd(level) => (5, level),
        };
        algorithm * 100 + level as i32
    }

    pub fn level(&self) -> u8 {
        match *self {
            Compression::Zlib(level)
            | Compression::Lzma(level)
            | Compression::Lz4(level)
            | Compression::Zstd(level) => level,
        }
    }

    fn tag(&self) -> &'static [u8; 2] {
        match self {
            Compression::Zlib(_) => b"ZL",
            Compression::Lzma(_) => b"XZ",
            Compression::Lz4(_) => b"L4",
            Compression::Zstd(_) => b"ZS",
        }
    }

    fn method(&self) -> u8 {
        // Readers ignore this byte; 8 is Z_DEFLATED for ZLIB blocks.
        match self {
            Compression::Zlib(_) => 8,
            Compression::Lzma(_) => 0,
            Compression::Lz4(_) => 1,
            Compression::Zstd(_) => 0,
        }
    }
}

fn packed24(bytes: &[u8]) -> usize {
    bytes[0] as usize | (bytes[1] as usize) << 8 | (bytes[2] as usize) << 16
}

fn pack24(value: usize) -> [u8; 3] {
    [value as u8, (value >> 8) as u8, (value >> 16) as u8]
}

/// Decompresses `compressed_bytes` of blocks starting at `cursor`, expecting
/// exactly `uncompressed_bytes` of output across all blocks.
pub fn decompress(
    chunk: &Chunk,
    cursor: &mut Cursor,
    compressed_bytes: u64,
    uncompressed_bytes: u64,
    path: &Path,
) -> Result<Vec<u8>> {
    let start = *cursor;
    let mut out: Vec<u8> = Vec::with_capacity(uncompressed_bytes as usize);
    let mut num_blocks = 0usize;

    while (cursor.displacement(&start) as u64) < compressed_bytes {
        let header = cursor.bytes(chunk, 9, path)?;
        let algo = [header[0], header[1]];
        let mut block_compressed = packed24(&header[3..6]);
        let block_uncompressed = packed24(&header[6..9]);

        let data: &[u8];
        let uncompressed = match &algo {
            b"ZL" => {
                data = cursor.bytes(chunk, block_compressed as u64, path)?;
                let mut inflated = Vec::with_capacity(block_uncompressed);
                flate2::bufread::ZlibDecoder::new(data)
                    .read_to_end(&mut inflated)
                    .map_err(|e| Error::format(path, format!("zlib block failed to inflate: {e}")))?;
                inflated
            }
            b"XZ" => {
                data = cursor.bytes(chunk, block_compressed as u64, path)?;
                let mut inflated = Vec::with_capacity(block_uncompressed);
                xz2::bufread::XzDecoder::new(data)
                    .read_to_end(&mut inflated)
                    .map_err(|e| Error::format(path, format!("lzma block failed to inflate: {e}")))?;
                inflated
            }
            b"L4" => {
                if block_compressed < 8 {
                    return Err(Error::format(
                        path,
                        format!("lz4 block {} is too short for its checksum", num_blocks + 1),
                    ));
                }
                block_compressed -= 8;
                let expected = {
                    let raw = cursor.bytes(chunk, 8, path)?;
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(raw);
                    u64::from_be_bytes(buf)
                };
                data = cursor.bytes(chunk, block_compressed as u64, path)?;
                let computed = xxhash_rust::xxh64::xxh64(data, 0);
                if computed != expected {
                    return Err(Error::format(
                        path,
                        format!(
                            "lz4 block {} checksum mismatch: computed {computed} but the block header expects {expected}",
                            num_blocks + 1
                        ),
                    ));
                }
                lz4_flex::block::decompress(data, block_uncompressed)
                    .map_err(|e| Error::format(path, format!("lz4 block failed to inflate: {e}")))?
            }
            b"ZS" => {
                data = cursor.bytes(chunk, block_compressed as u64, path)?;
                zstd::bulk::decompress(data, block_uncompressed)
                    .map_err(|e| Error::format(path, format!("zstd block failed to inflate: {e}")))?
            }
            b"CS" => {
                return Err(Error::not_implemented(
                    path,
                    "compression algorithm \"CS\" has not been used in decades",
                ));
            }
            other => {
                return Err(Error::format(
                    path,
                    format!("unrecognized compression algorithm: {other:?}"),
                ));
            }
        };

        if uncompressed.len() != block_uncompressed {
            return Err(Error::format(
                path,
                format!(
                    "after {num_blocks} blocks, a block of compressed size {block_compressed} \
                     decompressed to {} bytes, but the block header expects {block_uncompressed}",
                    uncompressed.len()
                ),
            ));
        }

        num_blocks += 1;
        if out.is_empty() && uncompressed.len() as u64 == uncompressed_bytes {
            // The usual case: a single block.
            return Ok(uncompressed);
        }
        out.extend_from_slice(&uncompressed);
    }

    if out.len() as u64 != uncompressed_bytes {
        return Err(Error::format(
            path,
            format!(
                "{num_blocks} blocks decompressed to {} bytes in total, expected {uncompressed_bytes}",
                out.len()
            ),
        ));
    }
    Ok(out)
}

/// Compresses `data` into one block per 16 MiB of input. Returns the input
/// unchanged when `compression` is `None` or when compression does not
/// actually shrink it; the caller detects that case by comparing lengths.
pub fn compress(data: &[u8], compression: Option<Compression>, path: &Path) -> Result<Vec<u8>> {
    let compression = match compression {
        Some(c) if c.level() > 0 => c,
        _ => return Ok(data.to_vec()),
    };

    let mut out = Vec::new();
    for block in data.chunks(MAX_BLOCK_BYTES) {
        let compressed = match compression {
            Compression::Zlib(level) => {
                let mut deflated = Vec::new();
                flate2::bufread::ZlibEncoder::new(block, flate2::Compression::new(level as u32))
                    .read_to_end(&mut deflated)
                    .map_err(|e| Error::format(path, format!("zlib failed to deflate: {e}")))?;
                deflated
            }
            Compression::Lzma(level) => {
                let mut deflated = Vec::new();
                xz2::bufread::XzEncoder::new(block, level as u32)
                    .read_to_end(&mut deflated)
                    .map_err(|e| Error::format(path, format!("lzma failed to deflate: {e}")))?;
                deflated
            }
            Compression::Lz4(_) => lz4_flex::block::compress(block),
            Compression::Zstd(level) => zstd::bulk::compress(block, level as i32)
                .map_err(|e| Error::format(path, format!("zstd failed to deflate: {e}")))?,
        };

        let checksum_bytes = if matches!(compression, Compression::Lz4(_)) {
            8
        } else {
            0
        };
        out.extend_from_slice(compression.tag());
        out.push(compression.method());
        out.extend_from_slice(&pack24(compressed.len() + checksum_bytes));
        out.extend_from_slice(&pack24(block.len()));
        if checksum_bytes != 0 {
            out.extend_from_slice(&xxhash_rust::xxh64::xxh64(&compressed, 0).to_be_bytes());
        }
        out.extend_from_slice(&compressed);
    }

    if out.len() < data.len() {
        debug!(
            uncompressed = data.len(),
            compressed = out.len(),
            code = compression.code(),
            "compressed payload"
        );
        Ok(out)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: &str = "test.root";

    fn roundtrip(compression: Compression, data: &[u8]) {
        let packed = compress(data, Some(compression), Path::new(P)).unwrap();
        assert!(packed.len() < data.len());
        let chunk = Chunk::wrap(packed.clone());
        let mut cursor = Cursor::new(0);
        let unpacked = decompress(
            &chunk,
            &mut cursor,
            packed.len() as u64,
            data.len() as u64,
            Path::new(P),
        )
        .unwrap();
        assert_eq!(unpacked, data);
    }

    fn compressible(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i / 32) as u8).collect()
    }

    #[test]
    fn roundtrips_every_codec() {
        let data = compressible(100_000);
        roundtrip(Compression::Zlib(6), &data);
        roundtrip(Compression::Lzma(3), &data);
        roundtrip(Compression::Lz4(4), &data);
        roundtrip(Compression::Zstd(3), &data);
    }

    #[test]
    fn incompressible_data_is_stored() {
        let data: Vec<u8> = (0..1024u32).flat_map(|i| (i.wrapping_mul(2654435761)).to_be_bytes()).collect();
        let packed = compress(&data, Some(Compression::Zlib(9)), Path::new(P)).unwrap();
        assert_eq!(packed, data);
    }

    #[test]
    fn multi_block_payloads_concatenate() {
        // Larger than one block's 24-bit capacity, so two blocks are written.
        let data = compressible(MAX_BLOCK_BYTES + 5 * 1024 * 1024);
        let packed = compress(&data, Some(Compression::Lz4(1)), Path::new(P)).unwrap();
        let chunk = Chunk::wrap(packed.clone());
        let mut cursor = Cursor::new(0);
        let unpacked = decompress(
            &chunk,
            &mut cursor,
            packed.len() as u64,
            data.len() as u64,
            Path::new(P),
        )
        .unwrap();
        assert_eq!(unpacked.len(), data.len());
        assert!(unpacked == data);
    }

    #[test]
    fn lz4_corruption_is_caught_by_block_number() {
        let data = compressible(MAX_BLOCK_BYTES + 5 * 1024 * 1024);
        let mut packed = compress(&data, Some(Compression::Lz4(1)), Path::new(P)).unwrap();

        // Find the second block header and flip a byte inside its payload.
        let first_compressed = packed24(&packed[3..6]);
        let second_block = 9 + first_compressed;
        assert_eq!(&packed[second_block..second_block + 2], b"L4");
        packed[second_block + 17 + 100] ^= 0xFF;

        let chunk = Chunk::wrap(packed.clone());
        let mut cursor = Cursor::new(0);
        let err = decompress(
            &chunk,
            &mut cursor,
            packed.len() as u64,
            data.len() as u64,
            Path::new(P),
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("lz4 block 2 checksum mismatch"), "{message}");
    }

    #[test]
    fn cs_blocks_are_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"CS");
        payload.push(0);
        payload.extend_from_slice(&pack24(4));
        payload.extend_from_slice(&pack24(4));
        payload.extend_from_slice(&[1, 2, 3, 4]);
        let chunk = Chunk::wrap(payload.clone());
        let mut cursor = Cursor::new(0);
        let err = decompress(&chunk, &mut cursor, payload.len() as u64, 4, Path::new(P)).unwrap_err();
        assert!(matches!(err, Error::NotImplemented { .. }));
    }
}
