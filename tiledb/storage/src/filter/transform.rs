//! Reordering, width-reduction, and checksum stages of the filter
//! pipeline.

use sha2::{Digest, Sha256};
use tiledb_common::datatype::Datatype;

use crate::error::{Error, Result};

use super::compress::{
    read_integral_values, read_varint, unzigzag, write_integral_values,
    write_varint, zigzag,
};

/// Byte shuffle: groups byte `j` of every element together so that
/// same-significance bytes are adjacent for the downstream compressor.
/// Trailing bytes that do not fill an element pass through unshuffled.
pub fn byte_shuffle(buffer: &[u8], elem_size: usize, inverse: bool) -> Vec<u8> {
    if elem_size <= 1 || buffer.len() < elem_size {
        return buffer.to_vec();
    }
    let count = buffer.len() / elem_size;
    let body = count * elem_size;
    let mut out = vec![0u8; buffer.len()];
    for i in 0..count {
        for j in 0..elem_size {
            if inverse {
                out[i * elem_size + j] = buffer[j * count + i];
            } else {
                out[j * count + i] = buffer[i * elem_size + j];
            }
        }
    }
    out[body..].copy_from_slice(&buffer[body..]);
    out
}

/// Bit shuffle: groups bit `k` of every element together. Implemented
/// as a bit-matrix transpose over the element-aligned body; trailing
/// bytes pass through.
pub fn bit_shuffle(buffer: &[u8], elem_size: usize, inverse: bool) -> Vec<u8> {
    if buffer.len() < elem_size.max(1) {
        return buffer.to_vec();
    }
    let count = buffer.len() / elem_size;
    let body = count * elem_size;
    let bits_per_elem = elem_size * 8;
    let mut out = vec![0u8; buffer.len()];

    let get_bit = |bytes: &[u8], idx: usize| -> bool {
        bytes[idx / 8] & (1 << (idx % 8)) != 0
    };
    let set_bit = |bytes: &mut [u8], idx: usize| {
        bytes[idx / 8] |= 1 << (idx % 8);
    };

    for i in 0..count {
        for k in 0..bits_per_elem {
            let normal = i * bits_per_elem + k;
            let shuffled = k * count + i;
            let (src, dst) = if inverse {
                (shuffled, normal)
            } else {
                (normal, shuffled)
            };
            if get_bit(&buffer[..body], src) {
                set_bit(&mut out[..body], dst);
            }
        }
    }
    out[body..].copy_from_slice(&buffer[body..]);
    out
}

/// Bit-width reduction: stores values rebased to their minimum in the
/// smallest whole-byte width that fits the spread.
///
/// Layout: `varint count | varint zigzag(min) | u8 width | values`.
pub fn bit_width_reduction_encode(
    buffer: &[u8],
    datatype: Datatype,
) -> Result<Vec<u8>> {
    let values = integral_values(buffer, datatype)?;
    let mut out = Vec::new();
    write_varint(&mut out, values.len() as u64);
    if values.is_empty() {
        return Ok(out);
    }

    let min = *values.iter().min().unwrap();
    let max = *values.iter().max().unwrap();
    let spread = max.wrapping_sub(min) as u64;
    let width = ((64 - spread.leading_zeros() as usize) + 7) / 8;
    let width = width.max(1);

    write_varint(&mut out, zigzag(min));
    out.push(width as u8);
    for v in values {
        let rebased = v.wrapping_sub(min) as u64;
        out.extend_from_slice(&rebased.to_le_bytes()[..width]);
    }
    Ok(out)
}

pub fn bit_width_reduction_decode(
    buffer: &[u8],
    datatype: Datatype,
) -> Result<Vec<u8>> {
    let mut offset = 0usize;
    let count = read_varint(buffer, &mut offset)? as usize;
    if count == 0 {
        if offset != buffer.len() {
            return Err(Error::Corrupted(
                "trailing bytes after bit-width stream".to_owned(),
            ));
        }
        return integral_bytes(&[], datatype);
    }
    let min = unzigzag(read_varint(buffer, &mut offset)?);
    let width = *buffer.get(offset).ok_or_else(|| {
        Error::Corrupted("truncated bit-width stream".to_owned())
    })? as usize;
    offset += 1;
    if width == 0 || width > 8 {
        return Err(Error::Corrupted(format!(
            "invalid bit-width {width}"
        )));
    }
    if buffer.len() - offset != count * width {
        return Err(Error::Corrupted(
            "bit-width stream length mismatch".to_owned(),
        ));
    }

    let mut values = Vec::with_capacity(count);
    for chunk in buffer[offset..].chunks_exact(width) {
        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(chunk);
        values.push(min.wrapping_add(u64::from_le_bytes(raw) as i64));
    }
    integral_bytes(&values, datatype)
}

/// Positive-delta coding for monotonically non-decreasing streams such
/// as var-cell offset tables.
///
/// Layout: `varint count | varint first | varint deltas...`.
pub fn positive_delta_encode(
    buffer: &[u8],
    datatype: Datatype,
) -> Result<Vec<u8>> {
    let values = integral_values(buffer, datatype)?;
    let mut out = Vec::new();
    write_varint(&mut out, values.len() as u64);
    if let Some(first) = values.first() {
        write_varint(&mut out, zigzag(*first));
    }
    for w in values.windows(2) {
        let delta = w[1].wrapping_sub(w[0]);
        if delta < 0 {
            return Err(Error::Unsupported(
                "positive-delta coding over a decreasing stream"
                    .to_owned(),
            ));
        }
        write_varint(&mut out, delta as u64);
    }
    Ok(out)
}

pub fn positive_delta_decode(
    buffer: &[u8],
    datatype: Datatype,
) -> Result<Vec<u8>> {
    let mut offset = 0usize;
    let count = read_varint(buffer, &mut offset)? as usize;
    let mut values = Vec::with_capacity(count);
    if count >= 1 {
        values.push(unzigzag(read_varint(buffer, &mut offset)?));
    }
    for _ in 1..count {
        let delta = read_varint(buffer, &mut offset)? as i64;
        let prev = *values.last().unwrap();
        values.push(prev.wrapping_add(delta));
    }
    if offset != buffer.len() {
        return Err(Error::Corrupted(
            "trailing bytes after positive-delta stream".to_owned(),
        ));
    }
    integral_bytes(&values, datatype)
}

const SHA256_BYTES: usize = 32;

pub fn sha256_append(buffer: &[u8]) -> Vec<u8> {
    let digest = Sha256::digest(buffer);
    let mut out = Vec::with_capacity(buffer.len() + SHA256_BYTES);
    out.extend_from_slice(buffer);
    out.extend_from_slice(&digest);
    out
}

pub fn sha256_verify(buffer: &[u8]) -> Result<Vec<u8>> {
    if buffer.len() < SHA256_BYTES {
        return Err(Error::Corrupted(
            "buffer shorter than its checksum".to_owned(),
        ));
    }
    let (payload, digest) = buffer.split_at(buffer.len() - SHA256_BYTES);
    let expected = Sha256::digest(payload);
    if digest != expected.as_slice() {
        return Err(Error::Corrupted("SHA-256 mismatch".to_owned()));
    }
    Ok(payload.to_vec())
}

fn integral_values(buffer: &[u8], datatype: Datatype) -> Result<Vec<i64>> {
    read_integral_values(buffer, datatype)
}

fn integral_bytes(values: &[i64], datatype: Datatype) -> Result<Vec<u8>> {
    write_integral_values(values, datatype)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_shuffle_roundtrip() {
        let data: Vec<u8> = (0..37).collect();
        let shuffled = byte_shuffle(&data, 4, false);
        assert_ne!(data, shuffled);
        assert_eq!(data, byte_shuffle(&shuffled, 4, true));
    }

    #[test]
    fn byte_shuffle_groups_significance() {
        let data: Vec<u8> =
            [0x01020304u32, 0x05060708].iter().flat_map(|v| v.to_le_bytes()).collect();
        let shuffled = byte_shuffle(&data, 4, false);
        assert_eq!(vec![0x04, 0x08, 0x03, 0x07, 0x02, 0x06, 0x01, 0x05], shuffled);
    }

    #[test]
    fn bit_shuffle_roundtrip() {
        let data: Vec<u8> = (0..64).map(|i| i * 3).collect();
        let shuffled = bit_shuffle(&data, 2, false);
        assert_eq!(data, bit_shuffle(&shuffled, 2, true));
    }

    #[test]
    fn bit_width_reduction_narrow_spread() {
        let data: Vec<u8> = [1000i64, 1001, 1003, 1000, 1002]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let encoded =
            bit_width_reduction_encode(&data, Datatype::Int64).unwrap();
        // 5 values of spread <= 3 need one byte each
        assert!(encoded.len() < data.len() / 4);
        assert_eq!(
            data,
            bit_width_reduction_decode(&encoded, Datatype::Int64).unwrap()
        );
    }

    #[test]
    fn positive_delta_rejects_decreasing() {
        let data: Vec<u8> = [5u64, 3]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert!(matches!(
            positive_delta_encode(&data, Datatype::UInt64),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn sha256_detects_flip() {
        let encoded = sha256_append(b"payload");
        let decoded = sha256_verify(&encoded).unwrap();
        assert_eq!(b"payload".as_slice(), decoded);

        let mut tampered = encoded.clone();
        tampered[0] ^= 1;
        assert!(sha256_verify(&tampered).is_err());
    }
}
