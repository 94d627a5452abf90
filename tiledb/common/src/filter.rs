use thiserror::Error;

#[cfg(feature = "proptest-strategies")]
use proptest::prelude::*;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum ChecksumType {
    Md5,
    Sha256,
}

/// Description of one stage of a filter pipeline.
///
/// A filter is a reversible transform over a tile byte buffer; the engine
/// treats each as an opaque `(encode, decode)` pair identified by this tag.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum FilterData {
    None,
    Gzip {
        level: Option<i32>,
    },
    Zstd {
        level: Option<i32>,
    },
    Lz4,
    Bzip2,
    Rle,
    BitWidthReduction {
        max_window: Option<u32>,
    },
    BitShuffle,
    ByteShuffle,
    PositiveDelta {
        max_window: Option<u32>,
    },
    DoubleDelta,
    Checksum(ChecksumType),
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum FilterError {
    #[error("Invalid on-disk compression code: {0}")]
    InvalidDiscriminant(u64),
}

impl FilterData {
    /// Returns the one-byte compression code of the array schema file,
    /// or `None` for filters the schema file cannot express.
    ///
    /// The schema file records a single compression stage per attribute;
    /// richer pipelines exist only in memory.
    pub fn disk_code(&self) -> Option<u8> {
        match self {
            FilterData::None => Some(0),
            FilterData::Gzip { .. } => Some(1),
            FilterData::Zstd { .. } => Some(2),
            FilterData::Lz4 => Some(3),
            FilterData::Rle => Some(4),
            FilterData::Bzip2 => Some(5),
            FilterData::DoubleDelta => Some(6),
            _ => None,
        }
    }

    pub fn try_from_disk_code(code: u8) -> Result<Self, FilterError> {
        Ok(match code {
            0 => FilterData::None,
            1 => FilterData::Gzip { level: None },
            2 => FilterData::Zstd { level: None },
            3 => FilterData::Lz4,
            4 => FilterData::Rle,
            5 => FilterData::Bzip2,
            6 => FilterData::DoubleDelta,
            _ => return Err(FilterError::InvalidDiscriminant(code as u64)),
        })
    }
}

/// Maps a pipeline to the single compression code the schema file stores.
///
/// The last stage with a disk code wins; an empty pipeline maps to `None`.
pub fn pipeline_disk_code(pipeline: &[FilterData]) -> u8 {
    pipeline
        .iter()
        .rev()
        .find_map(|f| f.disk_code())
        .unwrap_or(0)
}

/// Reconstructs the canonical pipeline for a schema file compression code.
pub fn pipeline_from_disk_code(
    code: u8,
) -> Result<Vec<FilterData>, FilterError> {
    match FilterData::try_from_disk_code(code)? {
        FilterData::None => Ok(Vec::new()),
        filter => Ok(vec![filter]),
    }
}

#[cfg(feature = "proptest-strategies")]
impl Arbitrary for FilterData {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            Just(FilterData::None),
            (1i32..=9).prop_map(|l| FilterData::Gzip { level: Some(l) }),
            (1i32..=19).prop_map(|l| FilterData::Zstd { level: Some(l) }),
            Just(FilterData::Lz4),
            Just(FilterData::Bzip2),
            Just(FilterData::Rle),
            Just(FilterData::BitShuffle),
            Just(FilterData::ByteShuffle),
            Just(FilterData::DoubleDelta),
            Just(FilterData::Checksum(ChecksumType::Sha256)),
        ]
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_code_roundtrip() {
        for code in 0u8..=6 {
            let pipeline = pipeline_from_disk_code(code).unwrap();
            assert_eq!(code, pipeline_disk_code(&pipeline));
        }
        assert!(pipeline_from_disk_code(7).is_err());
    }

    #[test]
    fn disk_code_last_compression_wins() {
        let pipeline = vec![
            FilterData::ByteShuffle,
            FilterData::Gzip { level: Some(6) },
        ];
        assert_eq!(1, pipeline_disk_code(&pipeline));

        let pipeline = vec![
            FilterData::Gzip { level: Some(6) },
            FilterData::Zstd { level: None },
        ];
        assert_eq!(2, pipeline_disk_code(&pipeline));
    }
}
