//! Fixed-capacity cell containers: attribute tiles hold value payloads,
//! coordinate tiles additionally maintain their MBR and bounding
//! coordinates as cells are appended in the global cell order.

use tiledb_common::datatype::physical::BitsOrd;
use tiledb_common::datatype::{Datatype, PhysicalType};
use tiledb_common::physical_type_go;
use tiledb_common::range::{MinimumBoundingRectangle, SingleValueRange};

use crate::error::{Error, Result};
use crate::schema::CellSize;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TileType {
    Attribute,
    Coordinate,
}

/// One logical tile of a single attribute (or of the coordinates).
///
/// Invariants maintained on append: the payload length stays a multiple
/// of the cell size for fixed tiles; coordinate appends match the
/// dimension count; the MBR only ever expands; the first bounding
/// coordinate is set by the first append and the last by every append.
#[derive(Clone, Debug)]
pub struct Tile {
    tile_type: TileType,
    datatype: Datatype,
    tile_id: u64,
    dim_num: usize,
    cell_size: CellSize,
    cell_num: u64,
    payload: Vec<u8>,
    /// Per-cell start offsets into `payload`, var-sized tiles only.
    var_offsets: Vec<u64>,
    /// Per-cell validity bytes, nullable attributes only.
    validity: Vec<u8>,
    mbr: Option<MinimumBoundingRectangle>,
    bounding_coords: Option<(Vec<u8>, Vec<u8>)>,
}

impl Tile {
    pub fn new(
        tile_type: TileType,
        datatype: Datatype,
        tile_id: u64,
        dim_num: usize,
        cell_size: CellSize,
        capacity_hint: u64,
    ) -> Self {
        let payload = match cell_size {
            CellSize::Fixed(size) => {
                Vec::with_capacity(size * capacity_hint as usize)
            }
            CellSize::Var => Vec::new(),
        };
        Tile {
            tile_type,
            datatype,
            tile_id,
            dim_num,
            cell_size,
            cell_num: 0,
            payload,
            var_offsets: Vec::new(),
            validity: Vec::new(),
            mbr: None,
            bounding_coords: None,
        }
    }

    /// Reassembles a tile from payload bytes read off disk.
    pub fn from_payload(
        tile_type: TileType,
        datatype: Datatype,
        tile_id: u64,
        dim_num: usize,
        cell_size: CellSize,
        payload: Vec<u8>,
        var_offsets: Vec<u64>,
        validity: Vec<u8>,
    ) -> Result<Self> {
        let cell_num = match cell_size {
            CellSize::Fixed(size) => {
                if size == 0 || payload.len() % size != 0 {
                    return Err(Error::Corrupted(format!(
                        "tile payload of {} bytes is not a multiple of the \
                         cell size {size}",
                        payload.len()
                    )));
                }
                (payload.len() / size) as u64
            }
            CellSize::Var => var_offsets.len() as u64,
        };
        Ok(Tile {
            tile_type,
            datatype,
            tile_id,
            dim_num,
            cell_size,
            cell_num,
            payload,
            var_offsets,
            validity,
            mbr: None,
            bounding_coords: None,
        })
    }

    pub fn tile_type(&self) -> TileType {
        self.tile_type
    }

    pub fn datatype(&self) -> Datatype {
        self.datatype
    }

    pub fn tile_id(&self) -> u64 {
        self.tile_id
    }

    pub fn cell_num(&self) -> u64 {
        self.cell_num
    }

    pub fn is_empty(&self) -> bool {
        self.cell_num == 0
    }

    pub fn cell_size(&self) -> CellSize {
        self.cell_size
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    pub fn var_offsets(&self) -> &[u64] {
        &self.var_offsets
    }

    pub fn validity(&self) -> &[u8] {
        &self.validity
    }

    pub fn mbr(&self) -> Option<&MinimumBoundingRectangle> {
        self.mbr.as_ref()
    }

    /// The first and last cell coordinates in the tile's global order.
    pub fn bounding_coords(&self) -> Option<(&[u8], &[u8])> {
        self.bounding_coords
            .as_ref()
            .map(|(first, last)| (first.as_slice(), last.as_slice()))
    }

    /// Appends one fixed-size cell value.
    pub fn append_cell(
        &mut self,
        value: &[u8],
        validity: Option<bool>,
    ) -> Result<()> {
        let CellSize::Fixed(size) = self.cell_size else {
            return Err(Error::SchemaInvalid(
                "append_cell on a var-sized tile".to_owned(),
            ));
        };
        if value.len() != size {
            return Err(Error::SchemaInvalid(format!(
                "cell of {} bytes appended to a tile with cell size {size}",
                value.len()
            )));
        }
        self.payload.extend_from_slice(value);
        if let Some(valid) = validity {
            self.validity.push(valid as u8);
        }
        self.cell_num += 1;
        Ok(())
    }

    /// Appends one var-sized cell value.
    pub fn append_var_cell(
        &mut self,
        value: &[u8],
        validity: Option<bool>,
    ) -> Result<()> {
        if !self.cell_size.is_var() {
            return Err(Error::SchemaInvalid(
                "append_var_cell on a fixed-size tile".to_owned(),
            ));
        }
        if value.len() % self.datatype.size() != 0 {
            return Err(Error::SchemaInvalid(format!(
                "var cell of {} bytes is not a multiple of the element \
                 size {}",
                value.len(),
                self.datatype.size()
            )));
        }
        self.var_offsets.push(self.payload.len() as u64);
        self.payload.extend_from_slice(value);
        if let Some(valid) = validity {
            self.validity.push(valid as u8);
        }
        self.cell_num += 1;
        Ok(())
    }

    /// Appends one coordinate tuple, expanding the MBR and updating the
    /// bounding coordinates.
    pub fn append_coords(&mut self, coords: &[u8]) -> Result<()> {
        if self.tile_type != TileType::Coordinate {
            return Err(Error::SchemaInvalid(
                "append_coords on an attribute tile".to_owned(),
            ));
        }
        let expect = self.dim_num * self.datatype.size();
        if coords.len() != expect {
            return Err(Error::SchemaInvalid(format!(
                "coordinate tuple of {} bytes appended, expected {expect}",
                coords.len()
            )));
        }

        self.expand_mbr(coords);
        if self.bounding_coords.is_none() {
            self.bounding_coords = Some((coords.to_vec(), coords.to_vec()));
        } else {
            self.bounding_coords.as_mut().unwrap().1 = coords.to_vec();
        }

        self.payload.extend_from_slice(coords);
        self.cell_num += 1;
        Ok(())
    }

    fn expand_mbr(&mut self, coords: &[u8]) {
        physical_type_go!(self.datatype, DT, {
            let size = std::mem::size_of::<DT>();
            match self.mbr.as_mut() {
                None => {
                    let mbr = (0..self.dim_num)
                        .map(|i| {
                            let c = DT::read_le(
                                &coords[i * size..(i + 1) * size],
                            );
                            SingleValueRange::from(&[c, c])
                        })
                        .collect();
                    self.mbr = Some(mbr);
                }
                Some(mbr) => {
                    for (i, range) in mbr.iter_mut().enumerate() {
                        let c =
                            DT::read_le(&coords[i * size..(i + 1) * size]);
                        let (lo, hi) =
                            <(DT, DT)>::try_from(&*range).unwrap();
                        let lo =
                            if c.bits_lt(&lo) { c } else { lo };
                        let hi =
                            if c.bits_gt(&hi) { c } else { hi };
                        *range = SingleValueRange::from(&[lo, hi]);
                    }
                }
            }
        })
    }

    /// The value bytes of the cell at `pos`. Constant time for fixed
    /// cells, one offset-table lookup for var cells.
    pub fn cell(&self, pos: u64) -> &[u8] {
        assert!(pos < self.cell_num, "cell {pos} of {}", self.cell_num);
        match self.cell_size {
            CellSize::Fixed(size) => {
                let start = pos as usize * size;
                &self.payload[start..start + size]
            }
            CellSize::Var => {
                let start = self.var_offsets[pos as usize] as usize;
                let end = self
                    .var_offsets
                    .get(pos as usize + 1)
                    .map(|o| *o as usize)
                    .unwrap_or(self.payload.len());
                &self.payload[start..end]
            }
        }
    }

    pub fn is_null(&self, pos: u64) -> bool {
        self.validity
            .get(pos as usize)
            .map(|v| *v == 0)
            .unwrap_or(false)
    }

    /// Whether the coordinate cell at `pos` falls inside `range`.
    pub fn cell_inside_range(
        &self,
        pos: u64,
        range: &[SingleValueRange],
    ) -> bool {
        debug_assert_eq!(self.tile_type, TileType::Coordinate);
        debug_assert_eq!(self.dim_num, range.len());
        let coords = self.cell(pos);
        physical_type_go!(self.datatype, DT, {
            let size = std::mem::size_of::<DT>();
            for (i, r) in range.iter().enumerate() {
                let c = DT::read_le(&coords[i * size..(i + 1) * size]);
                let (lo, hi) = <(DT, DT)>::try_from(r).unwrap();
                if c.bits_lt(&lo) || c.bits_gt(&hi) {
                    return false;
                }
            }
            true
        })
    }

    pub fn cursor(&self) -> CellCursor<'_> {
        CellCursor { tile: self, pos: 0 }
    }

    pub fn cursor_at(&self, pos: u64) -> CellCursor<'_> {
        CellCursor { tile: self, pos }
    }
}

/// Cursor over the cells of a tile.
#[derive(Clone, Copy, Debug)]
pub struct CellCursor<'a> {
    tile: &'a Tile,
    pos: u64,
}

impl<'a> CellCursor<'a> {
    pub fn pos(&self) -> u64 {
        self.pos
    }

    pub fn done(&self) -> bool {
        self.pos >= self.tile.cell_num()
    }

    pub fn at(&self) -> &'a [u8] {
        self.tile.cell(self.pos)
    }

    pub fn is_null(&self) -> bool {
        self.tile.is_null(self.pos)
    }

    pub fn inside_range(&self, range: &[SingleValueRange]) -> bool {
        self.tile.cell_inside_range(self.pos, range)
    }

    pub fn advance(&mut self) {
        self.pos += 1;
    }

    /// Steps backward; returns false at the front of the tile.
    pub fn retreat(&mut self) -> bool {
        if self.pos == 0 {
            false
        } else {
            self.pos -= 1;
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords_u32(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn coord_tile_2d() -> Tile {
        Tile::new(
            TileType::Coordinate,
            Datatype::UInt32,
            0,
            2,
            CellSize::Fixed(8),
            4,
        )
    }

    #[test]
    fn mbr_containment() {
        let mut tile = coord_tile_2d();
        let points: [[u32; 2]; 3] = [[4, 7], [2, 9], [6, 1]];
        for p in points.iter() {
            tile.append_coords(&coords_u32(p)).unwrap();
        }

        let mbr = tile.mbr().unwrap();
        assert_eq!(SingleValueRange::UInt32(2, 6), mbr[0]);
        assert_eq!(SingleValueRange::UInt32(1, 9), mbr[1]);

        for pos in 0..tile.cell_num() {
            assert!(tile.cell_inside_range(pos, mbr));
        }
    }

    #[test]
    fn bounding_coords_first_and_last() {
        let mut tile = coord_tile_2d();
        tile.append_coords(&coords_u32(&[1, 1])).unwrap();
        tile.append_coords(&coords_u32(&[1, 2])).unwrap();
        tile.append_coords(&coords_u32(&[2, 2])).unwrap();

        let (first, last) = tile.bounding_coords().unwrap();
        assert_eq!(coords_u32(&[1, 1]), first);
        assert_eq!(coords_u32(&[2, 2]), last);
    }

    #[test]
    fn rejects_wrong_sizes() {
        let mut tile = coord_tile_2d();
        assert!(tile.append_coords(&coords_u32(&[1])).is_err());

        let mut tile = Tile::new(
            TileType::Attribute,
            Datatype::Int32,
            0,
            0,
            CellSize::Fixed(4),
            4,
        );
        assert!(tile.append_cell(&[0u8; 3], None).is_err());
        assert!(tile.append_var_cell(&[0u8; 4], None).is_err());
    }

    #[test]
    fn var_cells() {
        let mut tile = Tile::new(
            TileType::Attribute,
            Datatype::StringUtf8,
            0,
            0,
            CellSize::Var,
            4,
        );
        tile.append_var_cell(b"a", None).unwrap();
        tile.append_var_cell(b"bb", None).unwrap();
        tile.append_var_cell(b"", None).unwrap();
        tile.append_var_cell(b"ccc", None).unwrap();

        assert_eq!(4, tile.cell_num());
        assert_eq!(&[0u64, 1, 3, 3], tile.var_offsets());
        assert_eq!(b"a".as_slice(), tile.cell(0));
        assert_eq!(b"".as_slice(), tile.cell(2));
        assert_eq!(b"ccc".as_slice(), tile.cell(3));
    }

    #[test]
    fn validity_cursor() {
        let mut tile = Tile::new(
            TileType::Attribute,
            Datatype::Int32,
            0,
            0,
            CellSize::Fixed(4),
            2,
        );
        tile.append_cell(&1i32.to_le_bytes(), Some(true)).unwrap();
        tile.append_cell(&2i32.to_le_bytes(), Some(false)).unwrap();

        let mut cursor = tile.cursor();
        assert!(!cursor.is_null());
        cursor.advance();
        assert!(cursor.is_null());
        cursor.advance();
        assert!(cursor.done());
    }
}
