//! Iteration over the coordinates of a hyper-rectangular range in the
//! array's cell order, forward or reverse. Dense-output paths use this
//! to visit every logical cell of a query range.

use tiledb_common::array::CellOrder;
use tiledb_common::datatype::PhysicalType;
use tiledb_common::physical_type_go;
use tiledb_common::range::SingleValueRange;

use tiledb_storage::error::{Error, Result};
use tiledb_storage::schema::ArraySchema;

/// Odometer over an integral range, yielding encoded coordinate tuples.
pub struct RangeWalk {
    lo: Vec<i128>,
    hi: Vec<i128>,
    current: Vec<i128>,
    /// Dimension indexes from most to least significant.
    significance: Vec<usize>,
    coord_size: usize,
    write: fn(i128, &mut [u8]),
    done: bool,
    reverse: bool,
}

impl RangeWalk {
    pub fn new(
        schema: &ArraySchema,
        range: &[SingleValueRange],
        reverse: bool,
    ) -> Result<Self> {
        if !schema.coords_type().is_integral_type() {
            return Err(Error::Unsupported(
                "cell walks over non-integral domains".to_owned(),
            ));
        }
        let significance: Vec<usize> = match schema.cell_order() {
            CellOrder::RowMajor => (0..schema.dim_num()).collect(),
            CellOrder::ColumnMajor => (0..schema.dim_num()).rev().collect(),
            CellOrder::Hilbert => {
                return Err(Error::Unsupported(
                    "cell walks in hilbert order".to_owned(),
                ))
            }
        };

        let mut lo = Vec::with_capacity(range.len());
        let mut hi = Vec::with_capacity(range.len());
        for r in range.iter() {
            let (a, b) = bounds_i128(r);
            lo.push(a);
            hi.push(b);
        }
        let current = if reverse { hi.clone() } else { lo.clone() };

        let (coord_size, write) =
            physical_type_go!(schema.coords_type(), DT, {
                fn write_coord<DT: PhysicalType>(
                    v: i128,
                    out: &mut [u8],
                ) {
                    DT::from_f64(v as f64).write_le(out)
                }
                (
                    std::mem::size_of::<DT>(),
                    write_coord::<DT> as fn(i128, &mut [u8]),
                )
            });

        Ok(RangeWalk {
            done: lo.iter().zip(hi.iter()).any(|(a, b)| a > b),
            lo,
            hi,
            current,
            significance,
            coord_size,
            write,
            reverse,
        })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.current.len() * self.coord_size];
        for (i, v) in self.current.iter().enumerate() {
            (self.write)(
                *v,
                &mut out[i * self.coord_size..(i + 1) * self.coord_size],
            );
        }
        out
    }

    fn step(&mut self) {
        // Advance the least significant dimension first
        for &d in self.significance.iter().rev() {
            if self.reverse {
                if self.current[d] > self.lo[d] {
                    self.current[d] -= 1;
                    return;
                }
                self.current[d] = self.hi[d];
            } else {
                if self.current[d] < self.hi[d] {
                    self.current[d] += 1;
                    return;
                }
                self.current[d] = self.lo[d];
            }
        }
        self.done = true;
    }
}

impl Iterator for RangeWalk {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let coords = self.encode();
        self.step();
        Some(coords)
    }
}

fn bounds_i128(range: &SingleValueRange) -> (i128, i128) {
    match *range {
        SingleValueRange::UInt8(lo, hi) => (lo as i128, hi as i128),
        SingleValueRange::UInt16(lo, hi) => (lo as i128, hi as i128),
        SingleValueRange::UInt32(lo, hi) => (lo as i128, hi as i128),
        SingleValueRange::UInt64(lo, hi) => (lo as i128, hi as i128),
        SingleValueRange::Int8(lo, hi) => (lo as i128, hi as i128),
        SingleValueRange::Int16(lo, hi) => (lo as i128, hi as i128),
        SingleValueRange::Int32(lo, hi) => (lo as i128, hi as i128),
        SingleValueRange::Int64(lo, hi) => (lo as i128, hi as i128),
        // Walks are constructed over integral domains only
        SingleValueRange::Float32(lo, hi) => (lo as i128, hi as i128),
        SingleValueRange::Float64(lo, hi) => (lo as i128, hi as i128),
    }
}

#[cfg(test)]
mod tests {
    use tiledb_common::array::{ArrayType, TileOrder};
    use tiledb_common::datatype::Datatype;
    use tiledb_pod::array::{
        AttributeData, DimensionData, DomainData, SchemaData,
    };

    use super::*;

    fn schema(cell_order: CellOrder) -> ArraySchema {
        ArraySchema::new(SchemaData {
            array_name: "walk".to_owned(),
            array_type: ArrayType::Dense,
            domain: DomainData {
                datatype: Datatype::Int32,
                dimension: vec![
                    DimensionData {
                        name: "x".to_owned(),
                        domain: [0.0, 9.0],
                        extent: Some(5.0),
                    },
                    DimensionData {
                        name: "y".to_owned(),
                        domain: [0.0, 9.0],
                        extent: Some(5.0),
                    },
                ],
            },
            capacity: None,
            cell_order: Some(cell_order),
            tile_order: Some(TileOrder::RowMajor),
            consolidation_step: None,
            attributes: vec![AttributeData {
                name: "a".to_owned(),
                datatype: Datatype::Int32,
                cell_val_num: None,
                nullability: None,
                filters: vec![],
            }],
        })
        .unwrap()
    }

    fn decode(coords: &[u8]) -> (i32, i32) {
        (
            i32::from_le_bytes(coords[0..4].try_into().unwrap()),
            i32::from_le_bytes(coords[4..8].try_into().unwrap()),
        )
    }

    #[test]
    fn row_major_walk() {
        let schema = schema(CellOrder::RowMajor);
        let range =
            vec![SingleValueRange::Int32(1, 2), SingleValueRange::Int32(5, 6)];
        let walk = RangeWalk::new(&schema, &range, false).unwrap();
        let visited: Vec<(i32, i32)> =
            walk.map(|c| decode(&c)).collect();
        assert_eq!(vec![(1, 5), (1, 6), (2, 5), (2, 6)], visited);
    }

    #[test]
    fn column_major_walk() {
        let schema = schema(CellOrder::ColumnMajor);
        let range =
            vec![SingleValueRange::Int32(1, 2), SingleValueRange::Int32(5, 6)];
        let walk = RangeWalk::new(&schema, &range, false).unwrap();
        let visited: Vec<(i32, i32)> =
            walk.map(|c| decode(&c)).collect();
        assert_eq!(vec![(1, 5), (2, 5), (1, 6), (2, 6)], visited);
    }

    #[test]
    fn reverse_is_exact_reverse() {
        let schema = schema(CellOrder::RowMajor);
        let range =
            vec![SingleValueRange::Int32(0, 2), SingleValueRange::Int32(0, 1)];
        let forward: Vec<(i32, i32)> = RangeWalk::new(&schema, &range, false)
            .unwrap()
            .map(|c| decode(&c))
            .collect();
        let mut backward: Vec<(i32, i32)> =
            RangeWalk::new(&schema, &range, true)
                .unwrap()
                .map(|c| decode(&c))
                .collect();
        backward.reverse();
        assert_eq!(forward, backward);
    }
}
