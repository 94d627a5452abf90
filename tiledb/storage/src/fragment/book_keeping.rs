//! Per-fragment index metadata: tile ids, MBRs, bounding coordinates,
//! tile offsets, and the non-empty domain.
//!
//! ## On-disk format
//!
//! The `__fragment_metadata` file is a sequence of sections, each a
//! `u64` little-endian compressed length followed by one gzip member,
//! in this order:
//!
//! ```text
//! 1. format_version:  u32
//! 2. tile_ids:        u64 count | u64[count]
//! 3. bounding_coords: u64 count | (coord, coord)[count]     (sparse)
//! 4. mbrs:            u64 count | (lo, hi)[dim][count]      (sparse)
//! 5. tile_offsets:    u32 stream_num | (u64 count | u64[count])...
//! 6. tile_var_offsets / tile_var_sizes: same shape as 5
//! 7. non_empty_domain: u8 present | (lo, hi)[dim]
//! 8. last_tile_cell_num: u64
//! ```
//!
//! followed by a raw 5-byte trailer: `u8 kind (0 = CRC-32) | u32 digest`
//! computed over every preceding byte of the file. Coordinates and
//! domain bounds are little-endian values of the coordinate datatype,
//! interleaved low/high per dimension.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tiledb_common::datatype::PhysicalType;
use tiledb_common::physical_type_go;
use tiledb_common::range::{MinimumBoundingRectangle, SingleValueRange};

use crate::error::{Error, Result};
use crate::fragment::FORMAT_VERSION;
use crate::schema::ArraySchema;

/// Lifecycle of a fragment's book-keeping.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Empty,
    Appending,
    Finalized,
}

/// The book-keeping structures of one fragment.
///
/// Tile ids are strictly increasing and identical across attributes at
/// equal ranks; `tile_offsets` carries one stream per attribute plus a
/// final stream for the coordinates of sparse fragments.
#[derive(Clone, Debug)]
pub struct BookKeeping {
    sparse: bool,
    state: State,
    tile_ids: Vec<u64>,
    bounding_coords: Vec<(Vec<u8>, Vec<u8>)>,
    mbrs: Vec<MinimumBoundingRectangle>,
    tile_offsets: Vec<Vec<u64>>,
    tile_var_offsets: Vec<Vec<u64>>,
    tile_var_sizes: Vec<Vec<u64>>,
    non_empty_domain: Option<MinimumBoundingRectangle>,
    last_tile_cell_num: u64,
}

impl BookKeeping {
    /// Creates empty book-keeping for a fragment in create mode.
    ///
    /// `stream_num` counts the attribute data files: one per attribute,
    /// plus one for the coordinates when `sparse`.
    pub fn new(stream_num: usize, sparse: bool) -> Self {
        BookKeeping {
            sparse,
            state: State::Empty,
            tile_ids: Vec::new(),
            bounding_coords: Vec::new(),
            mbrs: Vec::new(),
            tile_offsets: vec![Vec::new(); stream_num],
            tile_var_offsets: vec![Vec::new(); stream_num],
            tile_var_sizes: vec![Vec::new(); stream_num],
            non_empty_domain: None,
            last_tile_cell_num: 0,
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn tile_num(&self) -> u64 {
        self.tile_ids.len() as u64
    }

    pub fn tile_ids(&self) -> &[u64] {
        &self.tile_ids
    }

    pub fn mbrs(&self) -> &[MinimumBoundingRectangle] {
        &self.mbrs
    }

    pub fn bounding_coords(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.bounding_coords
    }

    pub fn tile_offsets(&self, stream: usize) -> &[u64] {
        &self.tile_offsets[stream]
    }

    pub fn tile_var_offsets(&self, stream: usize) -> &[u64] {
        &self.tile_var_offsets[stream]
    }

    pub fn tile_var_sizes(&self, stream: usize) -> &[u64] {
        &self.tile_var_sizes[stream]
    }

    pub fn non_empty_domain(&self) -> Option<&MinimumBoundingRectangle> {
        self.non_empty_domain.as_ref()
    }

    pub fn last_tile_cell_num(&self) -> u64 {
        self.last_tile_cell_num
    }

    pub fn is_finalized(&self) -> bool {
        self.state == State::Finalized
    }

    // ------------------------------------------------------------------
    // Appending
    // ------------------------------------------------------------------

    fn appending(&mut self) -> Result<()> {
        match self.state {
            State::Finalized => Err(Error::TileOrderViolation(
                "append to finalized book-keeping".to_owned(),
            )),
            _ => {
                self.state = State::Appending;
                Ok(())
            }
        }
    }

    /// Registers a new tile. Ids must arrive strictly ascending.
    pub fn append_tile_id(&mut self, tile_id: u64) -> Result<()> {
        self.appending()?;
        if let Some(last) = self.tile_ids.last() {
            if *last >= tile_id {
                return Err(Error::TileOrderViolation(format!(
                    "tile id {tile_id} appended after {last}"
                )));
            }
        }
        self.tile_ids.push(tile_id);
        Ok(())
    }

    pub fn append_bounding_coords(
        &mut self,
        first: Vec<u8>,
        last: Vec<u8>,
    ) -> Result<()> {
        self.appending()?;
        self.bounding_coords.push((first, last));
        Ok(())
    }

    pub fn append_mbr(
        &mut self,
        mbr: MinimumBoundingRectangle,
    ) -> Result<()> {
        self.appending()?;
        self.mbrs.push(mbr);
        Ok(())
    }

    /// Appends the data-file start offset of the next tile of a stream,
    /// and for var-sized streams the var-file offset and byte size.
    pub fn append_tile_offset(
        &mut self,
        stream: usize,
        offset: u64,
        var: Option<(u64, u64)>,
    ) -> Result<()> {
        self.appending()?;
        self.tile_offsets[stream].push(offset);
        if let Some((var_offset, var_size)) = var {
            self.tile_var_offsets[stream].push(var_offset);
            self.tile_var_sizes[stream].push(var_size);
        }
        Ok(())
    }

    /// Grows the non-empty domain to cover a coordinate tuple's MBR.
    pub fn expand_non_empty_domain(
        &mut self,
        mbr: &MinimumBoundingRectangle,
    ) {
        match self.non_empty_domain.as_mut() {
            None => self.non_empty_domain = Some(mbr.clone()),
            Some(domain) => {
                for (d, r) in domain.iter_mut().zip(mbr.iter()) {
                    *d = d.union(r);
                }
            }
        }
    }

    pub fn set_last_tile_cell_num(&mut self, cell_num: u64) {
        self.last_tile_cell_num = cell_num;
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// The rank of a tile id, by binary search.
    pub fn tile_rank(&self, tile_id: u64) -> Option<u64> {
        self.tile_ids
            .binary_search(&tile_id)
            .ok()
            .map(|rank| rank as u64)
    }

    /// The ranks of the tiles whose MBR overlaps the query range, in
    /// rank order. `full` is set when the MBR lies entirely inside the
    /// range. Sparse fragments only; dense fragments locate tiles by
    /// tile-domain arithmetic instead.
    pub fn overlapping_tile_ranks(
        &self,
        range: &[SingleValueRange],
    ) -> Vec<(u64, bool)> {
        let mut out = Vec::new();
        for (rank, mbr) in self.mbrs.iter().enumerate() {
            let mut overlaps = true;
            let mut full = true;
            for (m, r) in mbr.iter().zip(range.iter()) {
                if m.intersection(r).is_none() {
                    overlaps = false;
                    break;
                }
                if !r.contains_range(m) {
                    full = false;
                }
            }
            if overlaps {
                out.push((rank as u64, full));
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // On-disk codec
    // ------------------------------------------------------------------

    /// Serializes all sections and the checksum trailer.
    pub fn finalize(&mut self, schema: &ArraySchema) -> Result<Vec<u8>> {
        self.validate(schema)?;
        self.state = State::Finalized;
        self.serialize(schema)
    }

    fn validate(&self, _schema: &ArraySchema) -> Result<()> {
        let tile_num = self.tile_ids.len();
        if self.sparse {
            if self.mbrs.len() != tile_num
                || self.bounding_coords.len() != tile_num
            {
                return Err(Error::Corrupted(format!(
                    "sparse book-keeping with {tile_num} tiles has {} MBRs \
                     and {} bounding coordinate pairs",
                    self.mbrs.len(),
                    self.bounding_coords.len()
                )));
            }
        }
        for offsets in self.tile_offsets.iter() {
            if offsets.len() != tile_num {
                return Err(Error::Corrupted(format!(
                    "stream with {} tile offsets in a fragment of \
                     {tile_num} tiles",
                    offsets.len()
                )));
            }
        }
        Ok(())
    }

    pub fn serialize(&self, schema: &ArraySchema) -> Result<Vec<u8>> {
        let mut out = Vec::new();

        write_section(&mut out, &FORMAT_VERSION.to_le_bytes())?;

        let mut section = Vec::new();
        section.extend_from_slice(&(self.tile_ids.len() as u64).to_le_bytes());
        for id in self.tile_ids.iter() {
            section.extend_from_slice(&id.to_le_bytes());
        }
        write_section(&mut out, &section)?;

        let mut section = Vec::new();
        section.extend_from_slice(
            &(self.bounding_coords.len() as u64).to_le_bytes(),
        );
        for (first, last) in self.bounding_coords.iter() {
            section.extend_from_slice(first);
            section.extend_from_slice(last);
        }
        write_section(&mut out, &section)?;

        let mut section = Vec::new();
        section.extend_from_slice(&(self.mbrs.len() as u64).to_le_bytes());
        for mbr in self.mbrs.iter() {
            write_ranges(&mut section, mbr);
        }
        write_section(&mut out, &section)?;

        write_section(&mut out, &serialize_streams(&self.tile_offsets))?;
        write_section(&mut out, &serialize_streams(&self.tile_var_offsets))?;
        write_section(&mut out, &serialize_streams(&self.tile_var_sizes))?;

        let mut section = Vec::new();
        match self.non_empty_domain.as_ref() {
            None => section.push(0u8),
            Some(domain) => {
                section.push(1u8);
                write_ranges(&mut section, domain);
            }
        }
        write_section(&mut out, &section)?;

        write_section(&mut out, &self.last_tile_cell_num.to_le_bytes())?;

        let digest = crc32fast::hash(&out);
        out.push(0u8); // checksum kind: CRC-32
        out.extend_from_slice(&digest.to_le_bytes());

        let _ = schema;
        Ok(out)
    }

    pub fn deserialize(
        buffer: &[u8],
        schema: &ArraySchema,
        sparse: bool,
    ) -> Result<Self> {
        if buffer.len() < 5 {
            return Err(Error::Corrupted(
                "book-keeping file too small".to_owned(),
            ));
        }
        let (body, trailer) = buffer.split_at(buffer.len() - 5);
        if trailer[0] != 0 {
            return Err(Error::Corrupted(format!(
                "unknown checksum kind {}",
                trailer[0]
            )));
        }
        let stored = u32::from_le_bytes(trailer[1..5].try_into().unwrap());
        if crc32fast::hash(body) != stored {
            return Err(Error::Corrupted(
                "book-keeping checksum mismatch".to_owned(),
            ));
        }

        let mut cursor = body;

        let section = read_section(&mut cursor)?;
        if section.len() != 4 {
            return Err(Error::Corrupted(
                "malformed format version section".to_owned(),
            ));
        }
        let version = u32::from_le_bytes(section.try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(Error::Corrupted(format!(
                "unknown book-keeping format version {version}"
            )));
        }

        let section = read_section(&mut cursor)?;
        let mut r = SectionReader::new(&section);
        let count = r.read_u64()? as usize;
        let mut tile_ids = Vec::with_capacity(count);
        for _ in 0..count {
            tile_ids.push(r.read_u64()?);
        }
        r.finish()?;

        let coords_size = schema.coords_size();
        let section = read_section(&mut cursor)?;
        let mut r = SectionReader::new(&section);
        let count = r.read_u64()? as usize;
        let mut bounding_coords = Vec::with_capacity(count);
        for _ in 0..count {
            let first = r.read_bytes(coords_size)?;
            let last = r.read_bytes(coords_size)?;
            bounding_coords.push((first, last));
        }
        r.finish()?;

        let section = read_section(&mut cursor)?;
        let mut r = SectionReader::new(&section);
        let count = r.read_u64()? as usize;
        let mut mbrs = Vec::with_capacity(count);
        for _ in 0..count {
            mbrs.push(read_ranges(&mut r, schema)?);
        }
        r.finish()?;

        let tile_offsets = deserialize_streams(&read_section(&mut cursor)?)?;
        let tile_var_offsets =
            deserialize_streams(&read_section(&mut cursor)?)?;
        let tile_var_sizes =
            deserialize_streams(&read_section(&mut cursor)?)?;

        let section = read_section(&mut cursor)?;
        let mut r = SectionReader::new(&section);
        let non_empty_domain = match r.read_u8()? {
            0 => None,
            1 => Some(read_ranges(&mut r, schema)?),
            other => {
                return Err(Error::Corrupted(format!(
                    "invalid non-empty-domain flag {other}"
                )))
            }
        };
        r.finish()?;

        let section = read_section(&mut cursor)?;
        if section.len() != 8 {
            return Err(Error::Corrupted(
                "malformed last-tile-cell-num section".to_owned(),
            ));
        }
        let last_tile_cell_num =
            u64::from_le_bytes(section.try_into().unwrap());

        if !cursor.is_empty() {
            return Err(Error::Corrupted(format!(
                "{} trailing bytes after book-keeping sections",
                cursor.len()
            )));
        }

        let loaded = BookKeeping {
            sparse,
            state: State::Finalized,
            tile_ids,
            bounding_coords,
            mbrs,
            tile_offsets,
            tile_var_offsets,
            tile_var_sizes,
            non_empty_domain,
            last_tile_cell_num,
        };
        loaded.validate(schema)?;
        Ok(loaded)
    }
}

fn serialize_streams(streams: &[Vec<u64>]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(streams.len() as u32).to_le_bytes());
    for stream in streams {
        out.extend_from_slice(&(stream.len() as u64).to_le_bytes());
        for v in stream {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

fn deserialize_streams(section: &[u8]) -> Result<Vec<Vec<u64>>> {
    let mut r = SectionReader::new(section);
    let stream_num = r.read_u32()? as usize;
    let mut streams = Vec::with_capacity(stream_num);
    for _ in 0..stream_num {
        let count = r.read_u64()? as usize;
        let mut stream = Vec::with_capacity(count);
        for _ in 0..count {
            stream.push(r.read_u64()?);
        }
        streams.push(stream);
    }
    r.finish()?;
    Ok(streams)
}

fn write_ranges(out: &mut Vec<u8>, ranges: &[SingleValueRange]) {
    for range in ranges {
        tiledb_common::single_value_range_go!(range, DT, lo, hi, {
            let size = std::mem::size_of::<DT>();
            let start = out.len();
            out.resize(start + 2 * size, 0);
            lo.write_le(&mut out[start..start + size]);
            hi.write_le(&mut out[start + size..start + 2 * size]);
        })
    }
}

fn read_ranges(
    r: &mut SectionReader,
    schema: &ArraySchema,
) -> Result<MinimumBoundingRectangle> {
    physical_type_go!(schema.coords_type(), DT, {
        let size = std::mem::size_of::<DT>();
        let mut ranges = Vec::with_capacity(schema.dim_num());
        for _ in 0..schema.dim_num() {
            let lo = DT::read_le(&r.read_bytes(size)?);
            let hi = DT::read_le(&r.read_bytes(size)?);
            ranges.push(SingleValueRange::from(&[lo, hi]));
        }
        Ok(ranges)
    })
}

/// Writes one section: a `u64` compressed length followed by a gzip
/// member holding the section bytes.
fn write_section(out: &mut Vec<u8>, section: &[u8]) -> Result<()> {
    let mut encoder =
        GzEncoder::new(Vec::new(), flate2::Compression::default());
    let compressed = encoder
        .write_all(section)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Corrupted(format!("gzip section: {e}")))?;
    out.extend_from_slice(&(compressed.len() as u64).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(())
}

fn read_section(cursor: &mut &[u8]) -> Result<Vec<u8>> {
    if cursor.len() < 8 {
        return Err(Error::Corrupted(
            "truncated book-keeping section".to_owned(),
        ));
    }
    let (len_raw, rest) = cursor.split_at(8);
    let len = u64::from_le_bytes(len_raw.try_into().unwrap()) as usize;
    if rest.len() < len {
        return Err(Error::Corrupted(
            "truncated book-keeping section".to_owned(),
        ));
    }
    let (member, rest) = rest.split_at(len);
    *cursor = rest;

    let mut section = Vec::new();
    GzDecoder::new(member)
        .read_to_end(&mut section)
        .map_err(|e| {
            Error::Corrupted(format!("book-keeping gzip member: {e}"))
        })?;
    Ok(section)
}

/// Bounds-checked little-endian reader over a decompressed section.
struct SectionReader<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> SectionReader<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        SectionReader { buffer, offset: 0 }
    }

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.offset + n > self.buffer.len() {
            return Err(Error::Corrupted(
                "truncated book-keeping section".to_owned(),
            ));
        }
        let out = self.buffer[self.offset..self.offset + n].to_vec();
        self.offset += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(
            self.read_bytes(4)?.as_slice().try_into().unwrap(),
        ))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(
            self.read_bytes(8)?.as_slice().try_into().unwrap(),
        ))
    }

    fn finish(&self) -> Result<()> {
        if self.offset != self.buffer.len() {
            return Err(Error::Corrupted(
                "trailing bytes in book-keeping section".to_owned(),
            ));
        }
        Ok(())
    }
}
