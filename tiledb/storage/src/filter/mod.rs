//! Ordered chains of reversible transforms over tile byte buffers.
//!
//! A pipeline applies its filters in forward order on write and in
//! reverse order on read; each stage's output is self-describing so that
//! `decode(encode(x)) == x` holds for any buffer. The offsets, values,
//! and validity streams of a tile run through independent pipeline
//! instances that share only the pipeline spec.

mod compress;
mod transform;

use tiledb_common::datatype::Datatype;
use tiledb_common::filter::{ChecksumType, FilterData};

use crate::error::{Error, Result};

/// A filter pipeline bound to the element type of the stream it filters.
#[derive(Clone, Debug)]
pub struct FilterPipeline {
    filters: Vec<FilterData>,
    datatype: Datatype,
}

impl FilterPipeline {
    pub fn new(filters: &[FilterData], datatype: Datatype) -> Self {
        FilterPipeline {
            filters: filters.to_vec(),
            datatype,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs the buffer through all filters in forward order.
    pub fn encode(&self, buffer: Vec<u8>) -> Result<Vec<u8>> {
        let mut buffer = buffer;
        for f in self.filters.iter() {
            buffer = encode_one(f, self.datatype, buffer)?;
        }
        Ok(buffer)
    }

    /// Runs the buffer through all filters in reverse order.
    pub fn decode(&self, buffer: Vec<u8>) -> Result<Vec<u8>> {
        let mut buffer = buffer;
        for f in self.filters.iter().rev() {
            buffer = decode_one(f, self.datatype, buffer)?;
        }
        Ok(buffer)
    }
}

fn encode_one(
    filter: &FilterData,
    datatype: Datatype,
    buffer: Vec<u8>,
) -> Result<Vec<u8>> {
    match filter {
        FilterData::None => Ok(buffer),
        FilterData::Gzip { level } => compress::gzip_encode(&buffer, *level),
        FilterData::Zstd { level } => compress::zstd_encode(&buffer, *level),
        FilterData::Lz4 => Ok(compress::lz4_encode(&buffer)),
        FilterData::Bzip2 => compress::bzip2_encode(&buffer),
        FilterData::Rle => Ok(compress::rle_encode(&buffer)),
        FilterData::DoubleDelta => {
            compress::double_delta_encode(&buffer, datatype)
        }
        FilterData::BitWidthReduction { .. } => {
            transform::bit_width_reduction_encode(&buffer, datatype)
        }
        FilterData::BitShuffle => {
            Ok(transform::bit_shuffle(&buffer, datatype.size(), false))
        }
        FilterData::ByteShuffle => {
            Ok(transform::byte_shuffle(&buffer, datatype.size(), false))
        }
        FilterData::PositiveDelta { .. } => {
            transform::positive_delta_encode(&buffer, datatype)
        }
        FilterData::Checksum(ChecksumType::Sha256) => {
            Ok(transform::sha256_append(&buffer))
        }
        FilterData::Checksum(ChecksumType::Md5) => Err(Error::Unsupported(
            "MD5 checksum filter".to_owned(),
        )),
    }
}

fn decode_one(
    filter: &FilterData,
    datatype: Datatype,
    buffer: Vec<u8>,
) -> Result<Vec<u8>> {
    match filter {
        FilterData::None => Ok(buffer),
        FilterData::Gzip { .. } => compress::gzip_decode(&buffer),
        FilterData::Zstd { .. } => compress::zstd_decode(&buffer),
        FilterData::Lz4 => compress::lz4_decode(&buffer),
        FilterData::Bzip2 => compress::bzip2_decode(&buffer),
        FilterData::Rle => compress::rle_decode(&buffer),
        FilterData::DoubleDelta => {
            compress::double_delta_decode(&buffer, datatype)
        }
        FilterData::BitWidthReduction { .. } => {
            transform::bit_width_reduction_decode(&buffer, datatype)
        }
        FilterData::BitShuffle => {
            Ok(transform::bit_shuffle(&buffer, datatype.size(), true))
        }
        FilterData::ByteShuffle => {
            Ok(transform::byte_shuffle(&buffer, datatype.size(), true))
        }
        FilterData::PositiveDelta { .. } => {
            transform::positive_delta_decode(&buffer, datatype)
        }
        FilterData::Checksum(ChecksumType::Sha256) => {
            transform::sha256_verify(&buffer)
        }
        FilterData::Checksum(ChecksumType::Md5) => Err(Error::Unsupported(
            "MD5 checksum filter".to_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn i32_buffer(values: &[i32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn roundtrip(pipeline: &FilterPipeline, data: Vec<u8>) {
        let encoded = pipeline.encode(data.clone()).unwrap();
        let decoded = pipeline.decode(encoded).unwrap();
        assert_eq!(data, decoded);
    }

    #[test]
    fn single_filters_roundtrip() {
        let data =
            i32_buffer(&[3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5, 8, 9, 7, 9, 3]);
        for f in [
            FilterData::None,
            FilterData::Gzip { level: Some(6) },
            FilterData::Zstd { level: None },
            FilterData::Lz4,
            FilterData::Bzip2,
            FilterData::Rle,
            FilterData::DoubleDelta,
            FilterData::BitWidthReduction { max_window: None },
            FilterData::BitShuffle,
            FilterData::ByteShuffle,
            FilterData::Checksum(ChecksumType::Sha256),
        ] {
            let pipeline = FilterPipeline::new(
                std::slice::from_ref(&f),
                Datatype::Int32,
            );
            roundtrip(&pipeline, data.clone());
            roundtrip(&pipeline, Vec::new());
        }
    }

    #[test]
    fn chained_pipeline_roundtrip() {
        let data = i32_buffer(&(0..256).collect::<Vec<_>>());
        let pipeline = FilterPipeline::new(
            &[
                FilterData::ByteShuffle,
                FilterData::Gzip { level: None },
                FilterData::Checksum(ChecksumType::Sha256),
            ],
            Datatype::Int32,
        );
        roundtrip(&pipeline, data);
    }

    #[test]
    fn positive_delta_on_offsets() {
        let offsets: Vec<u8> = [0u64, 10, 25, 25, 90]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let pipeline = FilterPipeline::new(
            &[FilterData::PositiveDelta { max_window: None }],
            Datatype::UInt64,
        );
        roundtrip(&pipeline, offsets);
    }

    #[test]
    fn md5_is_unsupported() {
        let pipeline = FilterPipeline::new(
            &[FilterData::Checksum(ChecksumType::Md5)],
            Datatype::Int32,
        );
        assert!(matches!(
            pipeline.encode(vec![1, 2, 3]),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn double_delta_rejects_floats() {
        let pipeline = FilterPipeline::new(
            &[FilterData::DoubleDelta],
            Datatype::Float64,
        );
        assert!(matches!(
            pipeline.encode(vec![0u8; 16]),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn corrupted_checksum_detected() {
        let pipeline = FilterPipeline::new(
            &[FilterData::Checksum(ChecksumType::Sha256)],
            Datatype::UInt8,
        );
        let mut encoded = pipeline.encode(vec![1, 2, 3, 4]).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xff;
        assert!(matches!(
            pipeline.decode(encoded),
            Err(Error::Corrupted(_))
        ));
    }

    proptest! {
        #[test]
        fn arbitrary_chain_roundtrip(
            data in proptest::collection::vec(any::<u8>(), 0..512),
            codes in proptest::collection::vec(0usize..8, 0..3)
        ) {
            let menu = [
                FilterData::None,
                FilterData::Gzip { level: None },
                FilterData::Zstd { level: None },
                FilterData::Lz4,
                FilterData::Bzip2,
                FilterData::Rle,
                FilterData::BitShuffle,
                FilterData::ByteShuffle,
            ];
            let filters = codes
                .into_iter()
                .map(|c| menu[c].clone())
                .collect::<Vec<_>>();
            let pipeline =
                FilterPipeline::new(&filters, Datatype::UInt8);
            let encoded = pipeline.encode(data.clone()).unwrap();
            let decoded = pipeline.decode(encoded).unwrap();
            prop_assert_eq!(data, decoded);
        }
    }
}
