#[cfg(any(test, feature = "proptest-strategies"))]
pub mod strategy;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use tiledb_common::array::{ArrayType, CellOrder, CellValNum, TileOrder};
use tiledb_common::datatype::Datatype;
use tiledb_common::filter::FilterData;

/// Encapsulation of data needed to construct a dimension.
///
/// The domain and the tile extent are held as `f64`, the representation
/// of the array schema file; coordinate payloads are typed by the
/// domain's shared [Datatype].
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct DimensionData {
    pub name: String,
    pub domain: [f64; 2],
    pub extent: Option<f64>,
}

impl DimensionData {
    /// Returns the number of cells this dimension spans.
    pub fn num_cells(&self) -> f64 {
        self.domain[1] - self.domain[0] + 1.0
    }

    /// Returns the number of tile partitions along this dimension,
    /// if it has a tile extent.
    pub fn num_partitions(&self) -> Option<u64> {
        self.extent.map(|e| (self.num_cells() / e).ceil() as u64)
    }
}

/// Encapsulation of data needed to construct an array domain.
///
/// All dimensions share one coordinate datatype, which occupies the
/// final type slot of the array schema file.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct DomainData {
    pub datatype: Datatype,
    pub dimension: Vec<DimensionData>,
}

impl DomainData {
    pub fn dim_num(&self) -> usize {
        self.dimension.len()
    }

    /// An array either gives tile extents for every dimension
    /// (regular tiles) or for none (irregular tiles).
    pub fn has_regular_tiles(&self) -> bool {
        !self.dimension.is_empty()
            && self.dimension.iter().all(|d| d.extent.is_some())
    }

    /// Returns the number of cells per tile, if the tiles are regular
    /// over an integral domain.
    pub fn num_cells_per_tile(&self) -> Option<u64> {
        if !self.has_regular_tiles() || !self.datatype.is_integral_type() {
            return None;
        }
        let mut n = 1u64;
        for d in self.dimension.iter() {
            n = n.checked_mul(d.extent.unwrap() as u64)?;
        }
        Some(n)
    }
}

/// Encapsulation of data needed to construct an attribute.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct AttributeData {
    pub name: String,
    pub datatype: Datatype,
    pub cell_val_num: Option<CellValNum>,
    pub nullability: Option<bool>,
    pub filters: Vec<FilterData>,
}

impl AttributeData {
    pub fn cell_val_num(&self) -> CellValNum {
        self.cell_val_num.unwrap_or_else(|| {
            if self.datatype.is_string_type() {
                CellValNum::Var
            } else {
                CellValNum::single()
            }
        })
    }

    pub fn is_var_sized(&self) -> bool {
        self.cell_val_num().is_var_sized()
    }

    pub fn is_nullable(&self) -> bool {
        self.nullability.unwrap_or(false)
    }
}

/// Encapsulation of data needed to construct an array schema.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct SchemaData {
    pub array_name: String,
    pub array_type: ArrayType,
    pub domain: DomainData,
    pub capacity: Option<u64>,
    pub cell_order: Option<CellOrder>,
    pub tile_order: Option<TileOrder>,
    pub consolidation_step: Option<u32>,
    pub attributes: Vec<AttributeData>,
}

impl SchemaData {
    pub const DEFAULT_SPARSE_TILE_CAPACITY: u64 = 10000;

    pub fn num_fields(&self) -> usize {
        self.domain.dimension.len() + self.attributes.len()
    }

    pub fn attribute(&self, name: &str) -> Option<(usize, &AttributeData)> {
        self.attributes
            .iter()
            .enumerate()
            .find(|(_, a)| a.name == name)
    }

    /// Returns the number of cells per tile.
    pub fn num_cells_per_tile(&self) -> u64 {
        self.domain.num_cells_per_tile().unwrap_or_else(|| {
            self.capacity.unwrap_or(Self::DEFAULT_SPARSE_TILE_CAPACITY)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_tiles() {
        let domain = DomainData {
            datatype: Datatype::UInt32,
            dimension: vec![
                DimensionData {
                    name: "x".to_owned(),
                    domain: [1.0, 4.0],
                    extent: Some(2.0),
                },
                DimensionData {
                    name: "y".to_owned(),
                    domain: [1.0, 4.0],
                    extent: Some(2.0),
                },
            ],
        };
        assert!(domain.has_regular_tiles());
        assert_eq!(Some(4), domain.num_cells_per_tile());
        assert_eq!(Some(2), domain.dimension[0].num_partitions());
    }

    #[test]
    fn irregular_tiles() {
        let domain = DomainData {
            datatype: Datatype::UInt32,
            dimension: vec![DimensionData {
                name: "x".to_owned(),
                domain: [1.0, 100.0],
                extent: None,
            }],
        };
        assert!(!domain.has_regular_tiles());
        assert_eq!(None, domain.num_cells_per_tile());
    }
}
