//! Compression stages of the filter pipeline.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tiledb_common::datatype::Datatype;
use tiledb_common::physical_type_go;

use crate::error::{Error, Result};

fn codec_error(what: &str, e: impl std::fmt::Display) -> Error {
    Error::Corrupted(format!("{what}: {e}"))
}

pub fn gzip_encode(buffer: &[u8], level: Option<i32>) -> Result<Vec<u8>> {
    let level = level
        .map(|l| Compression::new(l.clamp(0, 9) as u32))
        .unwrap_or_default();
    let mut encoder = GzEncoder::new(Vec::new(), level);
    encoder
        .write_all(buffer)
        .and_then(|_| encoder.finish())
        .map_err(|e| codec_error("gzip encode", e))
}

pub fn gzip_decode(buffer: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(buffer)
        .read_to_end(&mut out)
        .map_err(|e| codec_error("gzip decode", e))?;
    Ok(out)
}

pub fn zstd_encode(buffer: &[u8], level: Option<i32>) -> Result<Vec<u8>> {
    zstd::encode_all(buffer, level.unwrap_or(0))
        .map_err(|e| codec_error("zstd encode", e))
}

pub fn zstd_decode(buffer: &[u8]) -> Result<Vec<u8>> {
    zstd::decode_all(buffer).map_err(|e| codec_error("zstd decode", e))
}

pub fn lz4_encode(buffer: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress_prepend_size(buffer)
}

pub fn lz4_decode(buffer: &[u8]) -> Result<Vec<u8>> {
    lz4_flex::block::decompress_size_prepended(buffer)
        .map_err(|e| codec_error("lz4 decode", e))
}

pub fn bzip2_encode(buffer: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = bzip2::write::BzEncoder::new(
        Vec::new(),
        bzip2::Compression::default(),
    );
    encoder
        .write_all(buffer)
        .and_then(|_| encoder.finish())
        .map_err(|e| codec_error("bzip2 encode", e))
}

pub fn bzip2_decode(buffer: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut decoder = bzip2::read::BzDecoder::new(buffer);
    // An empty bzip2 stream is zero bytes; BzDecoder errors on it
    if buffer.is_empty() {
        return Ok(out);
    }
    decoder
        .read_to_end(&mut out)
        .map_err(|e| codec_error("bzip2 decode", e))?;
    Ok(out)
}

/// Byte-level run-length encoding: a sequence of `(run_length, value)`
/// pairs with runs capped at 255.
pub fn rle_encode(buffer: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut iter = buffer.iter().peekable();
    while let Some(value) = iter.next() {
        let mut run = 1u8;
        while run < u8::MAX && iter.peek() == Some(&value) {
            iter.next();
            run += 1;
        }
        out.push(run);
        out.push(*value);
    }
    out
}

pub fn rle_decode(buffer: &[u8]) -> Result<Vec<u8>> {
    if buffer.len() % 2 != 0 {
        return Err(Error::Corrupted(
            "rle stream has odd length".to_owned(),
        ));
    }
    let mut out = Vec::new();
    for pair in buffer.chunks_exact(2) {
        if pair[0] == 0 {
            return Err(Error::Corrupted("rle run of zero".to_owned()));
        }
        out.extend(std::iter::repeat(pair[1]).take(pair[0] as usize));
    }
    Ok(out)
}

pub(super) fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

pub(super) fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub(super) fn write_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(super) fn read_varint(buffer: &[u8], offset: &mut usize) -> Result<u64> {
    let mut v = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buffer.get(*offset).ok_or_else(|| {
            Error::Corrupted("truncated varint".to_owned())
        })?;
        *offset += 1;
        v |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(v);
        }
        shift += 7;
        if shift >= 64 {
            return Err(Error::Corrupted("oversized varint".to_owned()));
        }
    }
}

/// Double-delta coding over the integral elements of the buffer:
/// the first value and first delta are stored raw, every further
/// element as the zigzag varint of its second-order difference.
pub fn double_delta_encode(
    buffer: &[u8],
    datatype: Datatype,
) -> Result<Vec<u8>> {
    let values = read_integral_values(buffer, datatype)?;
    let mut out = Vec::new();
    write_varint(&mut out, values.len() as u64);
    if let Some(first) = values.first() {
        write_varint(&mut out, zigzag(*first));
    }
    if values.len() >= 2 {
        let first_delta = values[1].wrapping_sub(values[0]);
        write_varint(&mut out, zigzag(first_delta));
        let mut prev_delta = first_delta;
        for w in values.windows(2).skip(1) {
            let delta = w[1].wrapping_sub(w[0]);
            write_varint(&mut out, zigzag(delta.wrapping_sub(prev_delta)));
            prev_delta = delta;
        }
    }
    Ok(out)
}

pub fn double_delta_decode(
    buffer: &[u8],
    datatype: Datatype,
) -> Result<Vec<u8>> {
    let mut offset = 0usize;
    let count = read_varint(buffer, &mut offset)? as usize;
    let mut values = Vec::with_capacity(count);
    if count >= 1 {
        values.push(unzigzag(read_varint(buffer, &mut offset)?));
    }
    if count >= 2 {
        let mut delta = unzigzag(read_varint(buffer, &mut offset)?);
        values.push(values[0].wrapping_add(delta));
        for _ in 2..count {
            delta = delta
                .wrapping_add(unzigzag(read_varint(buffer, &mut offset)?));
            let prev = *values.last().unwrap();
            values.push(prev.wrapping_add(delta));
        }
    }
    if offset != buffer.len() {
        return Err(Error::Corrupted(
            "trailing bytes after double-delta stream".to_owned(),
        ));
    }
    write_integral_values(&values, datatype)
}

/// Reads the buffer as sign-extended 64-bit values of the datatype's
/// physical width. Floats are not representable as deltas.
pub(super) fn read_integral_values(
    buffer: &[u8],
    datatype: Datatype,
) -> Result<Vec<i64>> {
    if !datatype.is_integral_type()
        && !matches!(datatype, Datatype::Char | Datatype::StringUtf8)
    {
        return Err(Error::Unsupported(format!(
            "double-delta coding over {datatype}"
        )));
    }
    physical_type_go!(datatype, DT, {
        let size = std::mem::size_of::<DT>();
        if buffer.len() % size != 0 {
            return Err(Error::Corrupted(format!(
                "buffer of {} bytes is not a multiple of the element \
                 size {size}",
                buffer.len()
            )));
        }
        Ok(buffer
            .chunks_exact(size)
            .map(|c| {
                let mut raw = [0u8; 8];
                raw[..size].copy_from_slice(c);
                // sign-extend signed element types
                let v = i64::from_le_bytes(raw);
                let shift = 64 - 8 * size as u32;
                if matches!(
                    datatype,
                    Datatype::Int8
                        | Datatype::Int16
                        | Datatype::Int32
                        | Datatype::Int64
                        | Datatype::Char
                ) {
                    (v << shift) >> shift
                } else {
                    v
                }
            })
            .collect())
    })
}

pub(super) fn write_integral_values(
    values: &[i64],
    datatype: Datatype,
) -> Result<Vec<u8>> {
    physical_type_go!(datatype, DT, {
        let size = std::mem::size_of::<DT>();
        let mut out = Vec::with_capacity(values.len() * size);
        for v in values {
            out.extend_from_slice(&v.to_le_bytes()[..size]);
        }
        Ok(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rle() {
        let data = b"aaaabbbcc".to_vec();
        let encoded = rle_encode(&data);
        assert_eq!(vec![4, b'a', 3, b'b', 2, b'c'], encoded);
        assert_eq!(data, rle_decode(&encoded).unwrap());
    }

    #[test]
    fn rle_long_run() {
        let data = vec![7u8; 1000];
        assert_eq!(data, rle_decode(&rle_encode(&data)).unwrap());
    }

    #[test]
    fn zigzag_roundtrip() {
        for v in [0i64, 1, -1, i64::MAX, i64::MIN, 123456, -654321] {
            assert_eq!(v, unzigzag(zigzag(v)));
        }
    }

    #[test]
    fn double_delta_i16_negative() {
        let data: Vec<u8> = [-5i16, -3, 0, 2, 100, -100]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let encoded =
            double_delta_encode(&data, Datatype::Int16).unwrap();
        assert_eq!(
            data,
            double_delta_decode(&encoded, Datatype::Int16).unwrap()
        );
    }

    #[test]
    fn double_delta_compresses_arithmetic_sequences() {
        let data: Vec<u8> = (0..1000i64)
            .map(|i| i * 8)
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let encoded =
            double_delta_encode(&data, Datatype::Int64).unwrap();
        assert!(encoded.len() < data.len() / 4);
    }
}
