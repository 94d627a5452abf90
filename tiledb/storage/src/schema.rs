//! Runtime array schema: validation, cell and tile id arithmetic, the
//! global cell order, and the on-disk schema file codec.

use std::cmp::Ordering;

use tiledb_common::array::{ArrayType, CellOrder, CellValNum, TileOrder};
use tiledb_common::datatype::physical::BitsOrd;
use tiledb_common::datatype::{Datatype, PhysicalType};
use tiledb_common::filter::{
    pipeline_disk_code, pipeline_from_disk_code, FilterData,
};
use tiledb_common::physical_type_go;
use tiledb_common::range::SingleValueRange;
use tiledb_pod::array::{AttributeData, DimensionData, DomainData, SchemaData};

use crate::error::{Error, Result};
use crate::hilbert::HilbertCurve;

/// Size in bytes of one cell of an attribute, or variable.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CellSize {
    Fixed(usize),
    Var,
}

impl CellSize {
    pub fn is_var(&self) -> bool {
        matches!(self, CellSize::Var)
    }
}

/// A validated array schema with the derived state used on the hot paths:
/// per-attribute cell sizes, tile-id digit offsets, and Hilbert bit widths.
#[derive(Clone, Debug)]
pub struct ArraySchema {
    data: SchemaData,
    cell_sizes: Vec<CellSize>,
    tile_id_offsets_row: Vec<u64>,
    tile_id_offsets_col: Vec<u64>,
    tile_partitions: Vec<u64>,
    hilbert_cell: Option<HilbertCurve>,
    hilbert_tile: Option<HilbertCurve>,
}

impl PartialEq for ArraySchema {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl ArraySchema {
    pub fn new(data: SchemaData) -> Result<Self> {
        validate(&data)?;

        let dim_num = data.domain.dim_num();
        let coords_type = data.domain.datatype;

        let mut cell_sizes = Vec::with_capacity(data.attributes.len() + 1);
        for a in data.attributes.iter() {
            cell_sizes.push(attribute_cell_size(a));
        }
        cell_sizes.push(CellSize::Fixed(dim_num * coords_type.size()));

        let regular = data.domain.has_regular_tiles();
        let mut tile_partitions = Vec::new();
        let mut tile_id_offsets_row = Vec::new();
        let mut tile_id_offsets_col = Vec::new();
        if regular {
            for d in data.domain.dimension.iter() {
                tile_partitions.push(d.num_partitions().unwrap());
            }
            tile_id_offsets_row = digit_offsets(&tile_partitions, true)?;
            tile_id_offsets_col = digit_offsets(&tile_partitions, false)?;
        }

        let cell_order = data.cell_order.unwrap_or_default();
        let hilbert_cell = if cell_order == CellOrder::Hilbert {
            let max_range = data
                .domain
                .dimension
                .iter()
                .map(|d| d.num_cells())
                .fold(0f64, f64::max);
            Some(HilbertCurve::new(bits_for_range(max_range), dim_num)?)
        } else {
            None
        };
        let hilbert_tile =
            if regular && data.tile_order == Some(TileOrder::Hilbert) {
                let max_range = tile_partitions
                    .iter()
                    .map(|p| *p as f64)
                    .fold(0f64, f64::max);
                Some(HilbertCurve::new(bits_for_range(max_range), dim_num)?)
            } else {
                None
            };

        Ok(ArraySchema {
            data,
            cell_sizes,
            tile_id_offsets_row,
            tile_id_offsets_col,
            tile_partitions,
            hilbert_cell,
            hilbert_tile,
        })
    }

    pub fn data(&self) -> &SchemaData {
        &self.data
    }

    pub fn array_name(&self) -> &str {
        &self.data.array_name
    }

    pub fn array_type(&self) -> ArrayType {
        self.data.array_type
    }

    pub fn is_sparse(&self) -> bool {
        self.data.array_type == ArrayType::Sparse
    }

    pub fn domain(&self) -> &DomainData {
        &self.data.domain
    }

    pub fn dim_num(&self) -> usize {
        self.data.domain.dim_num()
    }

    pub fn coords_type(&self) -> Datatype {
        self.data.domain.datatype
    }

    pub fn attributes(&self) -> &[AttributeData] {
        &self.data.attributes
    }

    pub fn attribute_num(&self) -> usize {
        self.data.attributes.len()
    }

    pub fn attribute_id(&self, name: &str) -> Option<usize> {
        self.data.attributes.iter().position(|a| a.name == name)
    }

    pub fn cell_order(&self) -> CellOrder {
        self.data.cell_order.unwrap_or_default()
    }

    pub fn tile_order(&self) -> TileOrder {
        self.data.tile_order.unwrap_or_default()
    }

    pub fn capacity(&self) -> u64 {
        self.data
            .capacity
            .unwrap_or(SchemaData::DEFAULT_SPARSE_TILE_CAPACITY)
    }

    pub fn has_regular_tiles(&self) -> bool {
        self.data.domain.has_regular_tiles()
    }

    pub fn has_irregular_tiles(&self) -> bool {
        !self.has_regular_tiles()
    }

    /// Number of cells a full tile holds: the extent product for regular
    /// tiles, the capacity for irregular tiles.
    pub fn cell_num_per_tile(&self) -> u64 {
        self.data.num_cells_per_tile()
    }

    /// Byte size of one cell of attribute `i`; index `attribute_num()`
    /// addresses the coordinates.
    pub fn compute_cell_size(&self, i: usize) -> CellSize {
        self.cell_sizes[i]
    }

    pub fn coords_size(&self) -> usize {
        self.dim_num() * self.coords_type().size()
    }

    /// Per-dimension count of tile partitions (regular tiles only).
    pub fn tile_partitions(&self) -> &[u64] {
        &self.tile_partitions
    }

    pub fn filters_for(&self, attribute_id: usize) -> &[FilterData] {
        if attribute_id < self.attribute_num() {
            &self.data.attributes[attribute_id].filters
        } else {
            // Coordinates travel unfiltered through the same pipeline engine
            &[]
        }
    }

    // ------------------------------------------------------------------
    // Cell and tile ids
    // ------------------------------------------------------------------

    /// Checks that raw coordinates lie inside the domain.
    pub fn check_coords(&self, coords: &[u8]) -> Result<()> {
        assert_eq!(coords.len(), self.coords_size());
        physical_type_go!(self.coords_type(), DT, {
            let size = std::mem::size_of::<DT>();
            for (i, d) in self.data.domain.dimension.iter().enumerate() {
                let c = DT::read_le(&coords[i * size..(i + 1) * size]);
                let v = c.to_f64();
                if v < d.domain[0] || v > d.domain[1] {
                    return Err(Error::DomainOutOfRange {
                        dimension: i,
                        value: v,
                    });
                }
            }
        });
        Ok(())
    }

    /// Maps coordinates to their Hilbert cell id. Coordinates are
    /// normalized to the domain origin, floored to integers, and walked
    /// through the curve.
    pub fn cell_id_hilbert(&self, coords: &[u8]) -> Result<u64> {
        let hc = self
            .hilbert_cell
            .as_ref()
            .expect("hilbert cell order required");
        self.check_coords(coords)?;
        let axes = self.normalized_axes(coords);
        hc.axes_to_line(&axes)
    }

    /// The tile id of the coordinates under the schema's tile order.
    pub fn tile_id(&self, coords: &[u8]) -> Result<u64> {
        match self.tile_order() {
            TileOrder::RowMajor => self.tile_id_row_major(coords),
            TileOrder::ColumnMajor => self.tile_id_column_major(coords),
            TileOrder::Hilbert => self.tile_id_hilbert(coords),
            TileOrder::None => Ok(0),
        }
    }

    pub fn tile_id_row_major(&self, coords: &[u8]) -> Result<u64> {
        self.check_coords(coords)?;
        let parts = self.partition_indexes(coords);
        self.combine_tile_id(&parts, &self.tile_id_offsets_row)
    }

    pub fn tile_id_column_major(&self, coords: &[u8]) -> Result<u64> {
        self.check_coords(coords)?;
        let parts = self.partition_indexes(coords);
        self.combine_tile_id(&parts, &self.tile_id_offsets_col)
    }

    pub fn tile_id_hilbert(&self, coords: &[u8]) -> Result<u64> {
        let hc = self
            .hilbert_tile
            .as_ref()
            .expect("hilbert tile order required");
        self.check_coords(coords)?;
        let parts = self.partition_indexes(coords);
        let axes = parts.iter().map(|p| *p as u32).collect::<Vec<_>>();
        hc.axes_to_line(&axes)
    }

    /// The tile id of a tile addressed by its per-dimension partition
    /// indexes, under the schema's tile order.
    pub fn tile_coords_to_id(&self, tile_coords: &[u64]) -> Result<u64> {
        match self.tile_order() {
            TileOrder::RowMajor => {
                self.combine_tile_id(tile_coords, &self.tile_id_offsets_row)
            }
            TileOrder::ColumnMajor => {
                self.combine_tile_id(tile_coords, &self.tile_id_offsets_col)
            }
            TileOrder::Hilbert => {
                let hc = self
                    .hilbert_tile
                    .as_ref()
                    .expect("hilbert tile order required");
                let axes =
                    tile_coords.iter().map(|p| *p as u32).collect::<Vec<_>>();
                hc.axes_to_line(&axes)
            }
            TileOrder::None => Ok(0),
        }
    }

    /// Per-dimension partition index of the coordinates, normalized to
    /// the domain origin.
    pub fn partition_indexes(&self, coords: &[u8]) -> Vec<u64> {
        physical_type_go!(self.coords_type(), DT, {
            let size = std::mem::size_of::<DT>();
            self.data
                .domain
                .dimension
                .iter()
                .enumerate()
                .map(|(i, d)| {
                    let c = DT::read_le(&coords[i * size..(i + 1) * size]);
                    ((c.to_f64() - d.domain[0]) / d.extent.unwrap()).floor()
                        as u64
                })
                .collect()
        })
    }

    fn combine_tile_id(&self, parts: &[u64], offsets: &[u64]) -> Result<u64> {
        let mut id = 0u64;
        for (p, o) in parts.iter().zip(offsets.iter()) {
            let term = p.checked_mul(*o).ok_or(Error::DomainOverflow)?;
            id = id.checked_add(term).ok_or(Error::DomainOverflow)?;
        }
        Ok(id)
    }

    fn normalized_axes(&self, coords: &[u8]) -> Vec<u32> {
        physical_type_go!(self.coords_type(), DT, {
            let size = std::mem::size_of::<DT>();
            self.data
                .domain
                .dimension
                .iter()
                .enumerate()
                .map(|(i, d)| {
                    let c = DT::read_le(&coords[i * size..(i + 1) * size]);
                    (c.to_f64() - d.domain[0]).floor() as u32
                })
                .collect()
        })
    }

    // ------------------------------------------------------------------
    // The global cell order
    // ------------------------------------------------------------------

    /// Strict total order over coordinates under the schema's cell order.
    ///
    /// For Hilbert order, ties on the cell id break by row-major
    /// coordinate comparison. Coordinates must lie inside the domain.
    pub fn precedes(&self, coords_a: &[u8], coords_b: &[u8]) -> bool {
        matches!(self.cell_cmp(coords_a, coords_b), Ordering::Less)
    }

    /// The reverse of [Self::precedes].
    pub fn succeeds(&self, coords_a: &[u8], coords_b: &[u8]) -> bool {
        matches!(self.cell_cmp(coords_a, coords_b), Ordering::Greater)
    }

    pub fn cell_cmp(&self, coords_a: &[u8], coords_b: &[u8]) -> Ordering {
        match self.cell_order() {
            CellOrder::RowMajor => self.coords_cmp_row_major(coords_a, coords_b),
            CellOrder::ColumnMajor => {
                self.coords_cmp_column_major(coords_a, coords_b)
            }
            CellOrder::Hilbert => {
                let id_a = self
                    .cell_id_hilbert(coords_a)
                    .expect("coordinates outside domain");
                let id_b = self
                    .cell_id_hilbert(coords_b)
                    .expect("coordinates outside domain");
                id_a.cmp(&id_b)
                    .then_with(|| self.coords_cmp_row_major(coords_a, coords_b))
            }
        }
    }

    pub fn coords_cmp_row_major(
        &self,
        coords_a: &[u8],
        coords_b: &[u8],
    ) -> Ordering {
        physical_type_go!(self.coords_type(), DT, {
            let size = std::mem::size_of::<DT>();
            for i in 0..self.dim_num() {
                let a = DT::read_le(&coords_a[i * size..(i + 1) * size]);
                let b = DT::read_le(&coords_b[i * size..(i + 1) * size]);
                match a.bits_cmp(&b) {
                    Ordering::Equal => continue,
                    ord => return ord,
                }
            }
            Ordering::Equal
        })
    }

    pub fn coords_cmp_column_major(
        &self,
        coords_a: &[u8],
        coords_b: &[u8],
    ) -> Ordering {
        physical_type_go!(self.coords_type(), DT, {
            let size = std::mem::size_of::<DT>();
            for i in (0..self.dim_num()).rev() {
                let a = DT::read_le(&coords_a[i * size..(i + 1) * size]);
                let b = DT::read_le(&coords_b[i * size..(i + 1) * size]);
                match a.bits_cmp(&b) {
                    Ordering::Equal => continue,
                    ord => return ord,
                }
            }
            Ordering::Equal
        })
    }

    /// The full domain as one range per dimension.
    pub fn domain_ranges(&self) -> Vec<SingleValueRange> {
        physical_type_go!(self.coords_type(), DT, {
            self.data
                .domain
                .dimension
                .iter()
                .map(|d| {
                    SingleValueRange::from(&[
                        DT::from_f64(d.domain[0]),
                        DT::from_f64(d.domain[1]),
                    ])
                })
                .collect()
        })
    }

    // ------------------------------------------------------------------
    // On-disk codec
    // ------------------------------------------------------------------

    /// Serializes the schema to the byte-packed little-endian layout of
    /// the `__array_schema` file.
    pub fn serialize(&self) -> Vec<u8> {
        let data = &self.data;
        let mut buf = Vec::new();

        write_str(&mut buf, &data.array_name);
        buf.push(u8::from(self.tile_order()));
        buf.push(u8::from(self.cell_order()));
        buf.extend_from_slice(&self.capacity().to_le_bytes());
        buf.extend_from_slice(
            &data.consolidation_step.unwrap_or(1).to_le_bytes(),
        );

        buf.extend_from_slice(&(data.attributes.len() as u32).to_le_bytes());
        for a in data.attributes.iter() {
            write_str(&mut buf, &a.name);
        }

        buf.extend_from_slice(&(self.dim_num() as u32).to_le_bytes());
        for d in data.domain.dimension.iter() {
            write_str(&mut buf, &d.name);
        }
        for d in data.domain.dimension.iter() {
            buf.extend_from_slice(&d.domain[0].to_le_bytes());
            buf.extend_from_slice(&d.domain[1].to_le_bytes());
        }

        let extents = if self.has_regular_tiles() {
            data.domain
                .dimension
                .iter()
                .map(|d| d.extent.unwrap())
                .collect::<Vec<_>>()
        } else {
            Vec::new()
        };
        buf.extend_from_slice(&(extents.len() as u32).to_le_bytes());
        for e in extents {
            buf.extend_from_slice(&e.to_le_bytes());
        }

        for a in data.attributes.iter() {
            buf.push(u8::from(a.datatype));
        }
        buf.push(u8::from(data.domain.datatype));

        for a in data.attributes.iter() {
            buf.push(pipeline_disk_code(&a.filters));
        }
        buf.push(0u8); // coordinates are stored uncompressed

        // Trailer: fields of the array model the historical layout has no
        // slot for. Readers of the documented prefix are unaffected.
        buf.push(match data.array_type {
            ArrayType::Dense => 0u8,
            ArrayType::Sparse => 1u8,
        });
        for a in data.attributes.iter() {
            buf.push(a.is_nullable() as u8);
        }

        buf
    }

    pub fn deserialize(buffer: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buffer);

        let array_name = r.read_str()?;
        let tile_order = TileOrder::try_from(r.read_u8()?)
            .map_err(|e| Error::Corrupted(e.to_string()))?;
        let cell_order = CellOrder::try_from(r.read_u8()?)
            .map_err(|e| Error::Corrupted(e.to_string()))?;
        let capacity = r.read_u64()?;
        let consolidation_step = r.read_u32()?;

        let attribute_num = r.read_u32()? as usize;
        let mut attribute_names = Vec::with_capacity(attribute_num);
        for _ in 0..attribute_num {
            attribute_names.push(r.read_str()?);
        }

        let dim_num = r.read_u32()? as usize;
        let mut dim_names = Vec::with_capacity(dim_num);
        for _ in 0..dim_num {
            dim_names.push(r.read_str()?);
        }
        let mut dim_domains = Vec::with_capacity(dim_num);
        for _ in 0..dim_num {
            let lo = r.read_f64()?;
            let hi = r.read_f64()?;
            dim_domains.push([lo, hi]);
        }

        let tile_extents_num = r.read_u32()? as usize;
        if tile_extents_num != 0 && tile_extents_num != dim_num {
            return Err(Error::Corrupted(format!(
                "expected 0 or {dim_num} tile extents, found {tile_extents_num}"
            )));
        }
        let mut extents = Vec::with_capacity(tile_extents_num);
        for _ in 0..tile_extents_num {
            extents.push(r.read_f64()?);
        }

        let mut types = Vec::with_capacity(attribute_num + 1);
        for _ in 0..=attribute_num {
            types.push(
                Datatype::try_from(r.read_u8()?)
                    .map_err(|e| Error::Corrupted(e.to_string()))?,
            );
        }
        let mut pipelines = Vec::with_capacity(attribute_num + 1);
        for _ in 0..=attribute_num {
            pipelines.push(
                pipeline_from_disk_code(r.read_u8()?)
                    .map_err(|e| Error::Corrupted(e.to_string()))?,
            );
        }

        let array_type = match r.read_u8()? {
            0 => ArrayType::Dense,
            1 => ArrayType::Sparse,
            other => {
                return Err(Error::Corrupted(format!(
                    "invalid array type code {other}"
                )))
            }
        };
        let mut nullable = Vec::with_capacity(attribute_num);
        for _ in 0..attribute_num {
            nullable.push(r.read_u8()? != 0);
        }

        if !r.is_empty() {
            return Err(Error::Corrupted(format!(
                "{} trailing bytes after array schema",
                r.remaining()
            )));
        }

        let dimension = dim_names
            .into_iter()
            .zip(dim_domains)
            .enumerate()
            .map(|(i, (name, domain))| DimensionData {
                name,
                domain,
                extent: extents.get(i).copied(),
            })
            .collect::<Vec<_>>();

        let attributes = attribute_names
            .into_iter()
            .enumerate()
            .map(|(i, name)| AttributeData {
                name,
                datatype: types[i],
                cell_val_num: None,
                nullability: Some(nullable[i]),
                filters: pipelines[i].clone(),
            })
            .collect::<Vec<_>>();

        ArraySchema::new(SchemaData {
            array_name,
            array_type,
            domain: DomainData {
                datatype: types[attribute_num],
                dimension,
            },
            capacity: Some(capacity),
            cell_order: Some(cell_order),
            tile_order: Some(tile_order),
            consolidation_step: Some(consolidation_step),
            attributes,
        })
    }
}

fn attribute_cell_size(a: &AttributeData) -> CellSize {
    match a.cell_val_num() {
        CellValNum::Var => CellSize::Var,
        CellValNum::Fixed(n) => {
            CellSize::Fixed(n.get() as usize * a.datatype.size())
        }
    }
}

/// Digit offsets of the mixed-radix tile-id number. Row-major treats
/// dimension 0 as the most significant digit; column-major mirrors
/// with reversed axes.
fn digit_offsets(partitions: &[u64], row_major: bool) -> Result<Vec<u64>> {
    let d = partitions.len();
    let mut offsets = vec![1u64; d];
    if row_major {
        for i in (0..d.saturating_sub(1)).rev() {
            offsets[i] = offsets[i + 1]
                .checked_mul(partitions[i + 1])
                .ok_or(Error::DomainOverflow)?;
        }
    } else {
        for i in 1..d {
            offsets[i] = offsets[i - 1]
                .checked_mul(partitions[i - 1])
                .ok_or(Error::DomainOverflow)?;
        }
    }
    Ok(offsets)
}

fn bits_for_range(max_range: f64) -> u32 {
    let bits = ((max_range + 0.5) as u64 as f64).log2().ceil() as u32;
    bits.max(1)
}

fn validate(data: &SchemaData) -> Result<()> {
    let invalid = |msg: String| Err(Error::SchemaInvalid(msg));

    if data.array_name.is_empty() {
        return invalid("array name must not be empty".to_owned());
    }
    if data.domain.dimension.is_empty() {
        return invalid("at least one dimension is required".to_owned());
    }
    if data.attributes.is_empty() {
        return invalid("at least one attribute is required".to_owned());
    }
    if !data.domain.datatype.is_allowed_dimension_type() {
        return invalid(format!(
            "{} is not a coordinate datatype",
            data.domain.datatype
        ));
    }
    if data.capacity == Some(0) {
        return invalid("capacity must be at least 1".to_owned());
    }

    let mut names = std::collections::HashSet::new();
    for d in data.domain.dimension.iter() {
        if d.name.is_empty() {
            return invalid("dimension name must not be empty".to_owned());
        }
        if !names.insert(d.name.as_str()) {
            return invalid(format!("duplicate field name '{}'", d.name));
        }
        if !d.domain[0].is_finite()
            || !d.domain[1].is_finite()
            || d.domain[0] > d.domain[1]
        {
            return invalid(format!(
                "dimension '{}' has invalid domain [{}, {}]",
                d.name, d.domain[0], d.domain[1]
            ));
        }
    }
    for a in data.attributes.iter() {
        if a.name.is_empty() {
            return invalid("attribute name must not be empty".to_owned());
        }
        if !names.insert(a.name.as_str()) {
            return invalid(format!("duplicate field name '{}'", a.name));
        }
        match a.cell_val_num() {
            CellValNum::Var => {
                if !a.datatype.is_string_type() {
                    return invalid(format!(
                        "attribute '{}': only string attributes are var-sized",
                        a.name
                    ));
                }
            }
            CellValNum::Fixed(_) => {
                if a.datatype.is_string_type() {
                    return invalid(format!(
                        "attribute '{}': string attributes must be var-sized",
                        a.name
                    ));
                }
            }
        }
    }

    let with_extent = data
        .domain
        .dimension
        .iter()
        .filter(|d| d.extent.is_some())
        .count();
    let regular = with_extent == data.domain.dim_num();
    if with_extent != 0 && !regular {
        return invalid(
            "tile extents must be given for every dimension or none"
                .to_owned(),
        );
    }
    if regular {
        for d in data.domain.dimension.iter() {
            let e = d.extent.unwrap();
            if !(e >= 1.0 && e <= d.num_cells()) {
                return invalid(format!(
                    "dimension '{}' has invalid tile extent {}",
                    d.name, e
                ));
            }
        }
    }

    match data.array_type {
        ArrayType::Dense => {
            if !regular {
                return invalid(
                    "dense arrays require tile extents on every dimension"
                        .to_owned(),
                );
            }
            if data.cell_order == Some(CellOrder::Hilbert) {
                return invalid(
                    "dense arrays use row- or column-major cell order"
                        .to_owned(),
                );
            }
            if !data.domain.datatype.is_integral_type() {
                return invalid(
                    "dense arrays require an integral coordinate datatype"
                        .to_owned(),
                );
            }
            // Every dense tile holds the full extent product of cells
            for d in data.domain.dimension.iter() {
                let e = d.extent.unwrap();
                if (d.num_cells() / e).fract() != 0.0 {
                    return invalid(format!(
                        "dimension '{}': tile extent {} does not divide \
                         the domain of {} cells",
                        d.name,
                        e,
                        d.num_cells()
                    ));
                }
            }
        }
        ArrayType::Sparse => {}
    }

    let tile_order = data.tile_order.unwrap_or_default();
    if regular && tile_order == TileOrder::None {
        return invalid(
            "regular tiles require a tile order".to_owned(),
        );
    }
    if !regular && tile_order != TileOrder::None {
        return invalid(
            "irregular tiles cannot have a tile order".to_owned(),
        );
    }

    Ok(())
}

fn write_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Bounds-checked little-endian reader over a schema file buffer.
struct Reader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Reader { buffer, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.offset + n > self.buffer.len() {
            return Err(Error::Corrupted(
                "truncated array schema".to_owned(),
            ));
        }
        let slice = &self.buffer[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_str(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Corrupted("non-UTF-8 name".to_owned()))
    }

    fn is_empty(&self) -> bool {
        self.offset == self.buffer.len()
    }

    fn remaining(&self) -> usize {
        self.buffer.len() - self.offset
    }
}
