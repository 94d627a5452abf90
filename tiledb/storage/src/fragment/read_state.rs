//! The read pipeline of one fragment: mapping a query range to
//! overlapping tiles, staging and decoding tiles on demand, and
//! streaming qualifying cells in the global order (or its reverse).

use std::sync::Arc;

use tiledb_common::array::CellOrder;
use tiledb_common::datatype::PhysicalType;
use tiledb_common::physical_type_go;
use tiledb_common::range::SingleValueRange;

use crate::error::{Error, Result};
use crate::fragment::BookKeeping;
use crate::schema::ArraySchema;
use crate::tile::Tile;

/// How a tile's cells relate to the query range. `PartialSpecial` marks
/// the case where the qualifying cells form a single contiguous slab of
/// the tile payload, permitting one copy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Overlap {
    None,
    Full,
    Partial,
    PartialSpecial,
}

/// One tile the query range overlaps, in global order.
#[derive(Clone, Debug)]
pub struct OverlappingTile {
    pub rank: u64,
    pub tile_id: u64,
    pub overlap: Overlap,
}

/// Supplies decoded tiles and book-keeping; implemented by the storage
/// manager's open-fragment handle.
pub trait TileSource {
    fn book_keeping(&self) -> &BookKeeping;

    /// The decoded tile of a stream at a rank, loaded if absent.
    fn tile(&self, stream: usize, rank: u64) -> Result<Arc<Tile>>;
}

/// One cell produced by a read.
#[derive(Clone, Debug, PartialEq)]
pub struct CellValue {
    pub validity: Option<bool>,
    pub bytes: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CellOut {
    pub coords: Vec<u8>,
    pub values: Vec<CellValue>,
}

/// Classifies a tile's overlap with the query range.
///
/// `tile_region` and `query` are absolute per-dimension ranges; the
/// query range must already be clipped to the array domain.
pub fn classify_overlap(
    tile_region: &[SingleValueRange],
    query: &[SingleValueRange],
    cell_order: CellOrder,
) -> Overlap {
    let mut intersections = Vec::with_capacity(tile_region.len());
    for (t, q) in tile_region.iter().zip(query.iter()) {
        match t.intersection(q) {
            None => return Overlap::None,
            Some(i) => intersections.push(i),
        }
    }

    let full = tile_region
        .iter()
        .zip(query.iter())
        .all(|(t, q)| q.contains_range(t));
    if full {
        return Overlap::Full;
    }

    if contiguous_in_tile(tile_region, &intersections, cell_order) {
        Overlap::PartialSpecial
    } else {
        Overlap::Partial
    }
}

/// A hyper-rectangle within a tile is one contiguous slab of the tile's
/// cell-order payload iff, walking dimensions from least to most
/// significant, the innermost dimensions span the full tile region, at
/// most one dimension covers a partial interval, and every dimension
/// more significant than it is a singleton.
fn contiguous_in_tile(
    tile_region: &[SingleValueRange],
    overlap: &[SingleValueRange],
    cell_order: CellOrder,
) -> bool {
    let dim_num = tile_region.len();
    // Dimension indexes from least to most significant
    let ascending: Vec<usize> = match cell_order {
        CellOrder::RowMajor => (0..dim_num).rev().collect(),
        CellOrder::ColumnMajor => (0..dim_num).collect(),
        // Hilbert payloads have no rectilinear slabs
        CellOrder::Hilbert => return false,
    };

    let mut seen_partial = false;
    for &d in ascending.iter() {
        let spans_tile = overlap[d] == tile_region[d];
        if seen_partial {
            if overlap[d].num_cells() != Some(1) {
                return false;
            }
        } else if !spans_tile {
            seen_partial = true;
        }
    }
    true
}

/// Streams the cells of one fragment that fall inside a query range, in
/// the array's global order or its exact reverse.
pub struct ReadState<S: TileSource> {
    source: S,
    schema: Arc<ArraySchema>,
    range: Vec<SingleValueRange>,
    reverse: bool,
    overlapping: Vec<OverlappingTile>,
    /// Index into `overlapping` of the tile under the cursor.
    tile_idx: usize,
    /// Position within the current tile; counts down in reverse mode.
    cell_pos: u64,
    cell_pos_init: bool,
    current_rank: Option<u64>,
    current_tiles: Vec<Option<Arc<Tile>>>,
}

impl<S: TileSource> ReadState<S> {
    pub fn new(
        source: S,
        schema: Arc<ArraySchema>,
        range: Vec<SingleValueRange>,
        reverse: bool,
    ) -> Result<Self> {
        if range.len() != schema.dim_num() {
            return Err(Error::SchemaInvalid(format!(
                "query range has {} dimensions, schema has {}",
                range.len(),
                schema.dim_num()
            )));
        }
        for (r, d) in range.iter().zip(schema.domain_ranges().iter()) {
            r.check_datatype(schema.coords_type())
                .map_err(|e| Error::SchemaInvalid(e.to_string()))?;
            if r.intersection(d).as_ref() != Some(r) {
                return Err(Error::DomainOutOfRange {
                    dimension: 0,
                    value: f64::NAN,
                });
            }
        }

        let overlapping = if schema.is_sparse() {
            overlapping_sparse(source.book_keeping(), &range)
        } else {
            overlapping_dense(&schema, source.book_keeping(), &range)?
        };

        let stream_num = schema.attribute_num()
            + if schema.is_sparse() { 1 } else { 0 };

        Ok(ReadState {
            source,
            schema,
            range,
            reverse,
            overlapping,
            tile_idx: 0,
            cell_pos: 0,
            cell_pos_init: false,
            current_rank: None,
            current_tiles: vec![None; stream_num],
        })
    }

    pub fn overlapping_tiles(&self) -> &[OverlappingTile] {
        &self.overlapping
    }

    pub fn range(&self) -> &[SingleValueRange] {
        &self.range
    }

    fn tile(&mut self, stream: usize, rank: u64) -> Result<Arc<Tile>> {
        if self.current_rank != Some(rank) {
            for slot in self.current_tiles.iter_mut() {
                *slot = None;
            }
            self.current_rank = Some(rank);
        }
        if let Some(tile) = self.current_tiles[stream].as_ref() {
            return Ok(Arc::clone(tile));
        }
        let tile = self.source.tile(stream, rank)?;
        self.current_tiles[stream] = Some(Arc::clone(&tile));
        Ok(tile)
    }

    fn coords_stream(&self) -> usize {
        // The trailing stream of a sparse fragment holds the coordinates
        self.schema.attribute_num()
    }

    /// Produces the next qualifying cell, or `None` when exhausted.
    ///
    /// Cells come tile by tile in rank order (the global tile order) and
    /// in cell order within each tile; reverse mode yields the exact
    /// reverse sequence. The cursor persists across calls, so a caller
    /// whose output buffer fills mid-tile simply resumes later.
    pub fn next_cell(&mut self) -> Result<Option<CellOut>> {
        debug_assert!(self.schema.is_sparse());
        loop {
            let Some(tile_entry) =
                self.overlapping.get(self.ordered_tile_idx())
            else {
                return Ok(None);
            };
            let tile_entry = tile_entry.clone();
            let coords_stream = self.coords_stream();
            let coords_tile =
                self.tile(coords_stream, tile_entry.rank)?;
            let cell_num = coords_tile.cell_num();
            if cell_num == 0 {
                self.advance_tile();
                continue;
            }

            if !self.cell_pos_init {
                self.cell_pos =
                    if self.reverse { cell_num - 1 } else { 0 };
                self.cell_pos_init = true;
            }

            let pos = self.cell_pos;
            let in_range = tile_entry.overlap == Overlap::Full
                || coords_tile.cell_inside_range(pos, &self.range);

            let out = if in_range {
                let coords = coords_tile.cell(pos).to_vec();
                let mut values =
                    Vec::with_capacity(self.schema.attribute_num());
                for a in 0..self.schema.attribute_num() {
                    let tile = self.tile(a, tile_entry.rank)?;
                    let validity = self
                        .schema
                        .attributes()[a]
                        .is_nullable()
                        .then(|| !tile.is_null(pos));
                    values.push(CellValue {
                        validity,
                        bytes: tile.cell(pos).to_vec(),
                    });
                }
                Some(CellOut { coords, values })
            } else {
                None
            };

            // Step the cursor
            if self.reverse {
                if pos == 0 {
                    self.advance_tile();
                } else {
                    self.cell_pos = pos - 1;
                }
            } else if pos + 1 >= cell_num {
                self.advance_tile();
            } else {
                self.cell_pos = pos + 1;
            }

            if out.is_some() {
                return Ok(out);
            }
        }
    }

    fn ordered_tile_idx(&self) -> usize {
        if self.reverse {
            // overlapping is in forward order; index from the back
            match self
                .overlapping
                .len()
                .checked_sub(1 + self.tile_idx)
            {
                Some(i) => i,
                None => usize::MAX,
            }
        } else {
            self.tile_idx
        }
    }

    fn advance_tile(&mut self) {
        self.tile_idx += 1;
        self.cell_pos_init = false;
    }

    // ------------------------------------------------------------------
    // Dense random access
    // ------------------------------------------------------------------

    /// The cell at the given coordinates of a dense fragment, or `None`
    /// if the fragment holds no tile there.
    pub fn cell_at(&mut self, coords: &[u8]) -> Result<Option<CellOut>> {
        debug_assert!(!self.schema.is_sparse());
        let Some((rank, pos)) = self.locate_dense(coords)? else {
            return Ok(None);
        };
        let mut values =
            Vec::with_capacity(self.schema.attribute_num());
        for a in 0..self.schema.attribute_num() {
            let tile = self.tile(a, rank)?;
            if pos >= tile.cell_num() {
                return Err(Error::Corrupted(format!(
                    "cell {pos} beyond tile of {} cells",
                    tile.cell_num()
                )));
            }
            let validity = self
                .schema
                .attributes()[a]
                .is_nullable()
                .then(|| !tile.is_null(pos));
            values.push(CellValue {
                validity,
                bytes: tile.cell(pos).to_vec(),
            });
        }
        Ok(Some(CellOut {
            coords: coords.to_vec(),
            values,
        }))
    }

    /// The contiguous run of cells starting at `coords` along the least
    /// significant dimension, clipped to the tile and the query range:
    /// the slab a `PartialSpecial` overlap permits copying at once.
    ///
    /// Returns the attribute tile, the start position, and the run
    /// length, or `None` when the fragment holds no tile there.
    pub fn dense_run_at(
        &mut self,
        attribute_id: usize,
        coords: &[u8],
    ) -> Result<Option<(Arc<Tile>, u64, u64)>> {
        debug_assert!(!self.schema.is_sparse());
        let Some((rank, pos)) = self.locate_dense(coords)? else {
            return Ok(None);
        };

        let run = self.innermost_run_len(coords);
        let tile = self.tile(attribute_id, rank)?;
        Ok(Some((tile, pos, run)))
    }

    /// Locates the dense tile rank and in-tile cell position of
    /// absolute coordinates.
    fn locate_dense(&mut self, coords: &[u8]) -> Result<Option<(u64, u64)>> {
        let tile_id = self.schema.tile_id(coords)?;
        let Some(rank) = self.source.book_keeping().tile_rank(tile_id)
        else {
            return Ok(None);
        };
        let pos = self.in_tile_pos(coords)?;
        Ok(Some((rank, pos)))
    }

    /// Position of the coordinates within their tile, under the
    /// schema's cell order over the tile extents.
    fn in_tile_pos(&self, coords: &[u8]) -> Result<u64> {
        let schema = &self.schema;
        let dim_num = schema.dim_num();
        physical_type_go!(schema.coords_type(), DT, {
            let size = std::mem::size_of::<DT>();
            let mut local = Vec::with_capacity(dim_num);
            let mut extents = Vec::with_capacity(dim_num);
            for (i, d) in schema.domain().dimension.iter().enumerate() {
                let c = DT::read_le(&coords[i * size..(i + 1) * size])
                    .to_f64();
                let e = d.extent.unwrap();
                let origin =
                    d.domain[0] + ((c - d.domain[0]) / e).floor() * e;
                local.push((c - origin) as u64);
                // The trailing tile may be clipped by the domain
                let clip = d.domain[1] - origin + 1.0;
                extents.push(e.min(clip) as u64);
            }
            let order: Vec<usize> = match schema.cell_order() {
                CellOrder::RowMajor => (0..dim_num).collect(),
                CellOrder::ColumnMajor => (0..dim_num).rev().collect(),
                CellOrder::Hilbert => {
                    return Err(Error::Unsupported(
                        "dense hilbert cell order".to_owned(),
                    ))
                }
            };
            let mut pos = 0u64;
            for &d in order.iter() {
                pos = pos
                    .checked_mul(extents[d])
                    .and_then(|p| p.checked_add(local[d]))
                    .ok_or(Error::DomainOverflow)?;
            }
            Ok(pos)
        })
    }

    /// Length of the contiguous run starting at `coords` along the
    /// least significant dimension, clipped to tile and range bounds.
    fn innermost_run_len(&self, coords: &[u8]) -> u64 {
        let schema = &self.schema;
        let dim_num = schema.dim_num();
        let innermost = match schema.cell_order() {
            CellOrder::ColumnMajor => 0,
            _ => dim_num - 1,
        };
        physical_type_go!(schema.coords_type(), DT, {
            let size = std::mem::size_of::<DT>();
            let d = &schema.domain().dimension[innermost];
            let c = DT::read_le(
                &coords[innermost * size..(innermost + 1) * size],
            )
            .to_f64();
            let e = d.extent.unwrap();
            let origin = d.domain[0] + ((c - d.domain[0]) / e).floor() * e;
            let tile_end = (origin + e - 1.0).min(d.domain[1]);
            let (_, range_hi) = bounds_f64(&self.range[innermost]);
            let end = tile_end.min(range_hi);
            (end - c + 1.0).max(0.0) as u64
        })
    }
}

fn bounds_f64(range: &SingleValueRange) -> (f64, f64) {
    tiledb_common::single_value_range_go!(range, _DT, lo, hi, {
        (lo.to_f64(), hi.to_f64())
    })
}

/// MBR scan of a sparse fragment's book-keeping.
fn overlapping_sparse(
    book_keeping: &BookKeeping,
    range: &[SingleValueRange],
) -> Vec<OverlappingTile> {
    book_keeping
        .overlapping_tile_ranks(range)
        .into_iter()
        .map(|(rank, full)| OverlappingTile {
            rank,
            tile_id: book_keeping.tile_ids()[rank as usize],
            overlap: if full { Overlap::Full } else { Overlap::Partial },
        })
        .collect()
}

/// Tile-domain arithmetic for dense fragments: every tile id whose
/// region intersects the range, classified, in tile-id order.
fn overlapping_dense(
    schema: &ArraySchema,
    book_keeping: &BookKeeping,
    range: &[SingleValueRange],
) -> Result<Vec<OverlappingTile>> {
    let dim_num = schema.dim_num();

    // Map the query range to the tile domain
    let mut t_lo = Vec::with_capacity(dim_num);
    let mut t_hi = Vec::with_capacity(dim_num);
    for (i, d) in schema.domain().dimension.iter().enumerate() {
        let (lo, hi) = bounds_f64(&range[i]);
        let e = d.extent.unwrap();
        t_lo.push(((lo - d.domain[0]) / e).floor() as u64);
        t_hi.push(((hi - d.domain[0]) / e).floor() as u64);
    }

    // Walk the hyper-rectangle of overlapping tile coordinates
    let mut out = Vec::new();
    let mut tile_coords = t_lo.clone();
    'walk: loop {
        let tile_id = schema.tile_coords_to_id(&tile_coords)?;
        if let Some(rank) = book_keeping.tile_rank(tile_id) {
            let region = tile_region(schema, &tile_coords);
            let overlap =
                classify_overlap(&region, range, schema.cell_order());
            if overlap != Overlap::None {
                out.push(OverlappingTile {
                    rank,
                    tile_id,
                    overlap,
                });
            }
        }

        // Odometer over [t_lo, t_hi]
        let mut d = dim_num;
        loop {
            if d == 0 {
                break 'walk;
            }
            d -= 1;
            if tile_coords[d] < t_hi[d] {
                tile_coords[d] += 1;
                for i in d + 1..dim_num {
                    tile_coords[i] = t_lo[i];
                }
                continue 'walk;
            }
        }
    }

    out.sort_by_key(|t| t.tile_id);
    Ok(out)
}

/// Absolute coordinate region a dense tile covers, clipped to the
/// domain.
fn tile_region(
    schema: &ArraySchema,
    tile_coords: &[u64],
) -> Vec<SingleValueRange> {
    physical_type_go!(schema.coords_type(), DT, {
        schema
            .domain()
            .dimension
            .iter()
            .zip(tile_coords.iter())
            .map(|(d, t)| {
                let e = d.extent.unwrap();
                let lo = d.domain[0] + *t as f64 * e;
                let hi = (lo + e - 1.0).min(d.domain[1]);
                SingleValueRange::from(&[
                    DT::from_f64(lo),
                    DT::from_f64(hi),
                ])
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(lo: i64, hi: i64) -> SingleValueRange {
        SingleValueRange::Int64(lo, hi)
    }

    #[test]
    fn classify_1d() {
        // Tiles [1,5] and [6,10] of a 1-D array with extent 5,
        // query range {3..7}
        let q = vec![r(3, 7)];
        assert_eq!(
            Overlap::PartialSpecial,
            classify_overlap(&[r(1, 5)], &q, CellOrder::RowMajor)
        );
        assert_eq!(
            Overlap::PartialSpecial,
            classify_overlap(&[r(6, 10)], &q, CellOrder::RowMajor)
        );
        assert_eq!(
            Overlap::Full,
            classify_overlap(&[r(4, 6)], &q, CellOrder::RowMajor)
        );
        assert_eq!(
            Overlap::None,
            classify_overlap(&[r(11, 15)], &q, CellOrder::RowMajor)
        );
    }

    #[test]
    fn classify_2d_row_major() {
        let tile = vec![r(0, 3), r(0, 3)];

        // Full-width row band: contiguous
        assert_eq!(
            Overlap::PartialSpecial,
            classify_overlap(
                &tile,
                &[r(1, 2), r(0, 3)],
                CellOrder::RowMajor
            )
        );
        // Single row, partial columns: contiguous
        assert_eq!(
            Overlap::PartialSpecial,
            classify_overlap(
                &tile,
                &[r(2, 2), r(1, 2)],
                CellOrder::RowMajor
            )
        );
        // Several rows, partial columns: scattered
        assert_eq!(
            Overlap::Partial,
            classify_overlap(
                &tile,
                &[r(1, 2), r(1, 2)],
                CellOrder::RowMajor
            )
        );
        // Column band is scattered in row-major order
        assert_eq!(
            Overlap::Partial,
            classify_overlap(
                &tile,
                &[r(0, 3), r(1, 2)],
                CellOrder::RowMajor
            )
        );
        // The same column band is contiguous in column-major order
        assert_eq!(
            Overlap::PartialSpecial,
            classify_overlap(
                &tile,
                &[r(0, 3), r(1, 2)],
                CellOrder::ColumnMajor
            )
        );
    }

    #[test]
    fn classify_hilbert_never_special() {
        let tile = vec![r(0, 3), r(0, 3)];
        assert_eq!(
            Overlap::Partial,
            classify_overlap(
                &tile,
                &[r(0, 0), r(0, 1)],
                CellOrder::Hilbert
            )
        );
    }
}
