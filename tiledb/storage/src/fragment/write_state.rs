//! The write pipeline: cell buffering, external-merge sort into the
//! global cell order, tile formation, filtering, and segment-buffered
//! flush into an uncommitted fragment directory.

use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use tiledb_common::array::CellOrder;
use tiledb_common::datatype::Datatype;

use crate::cancel::CancelToken;
use crate::cell::CellLayout;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::filter::FilterPipeline;
use crate::fragment::{
    fragment_streams, BookKeeping, FragmentPaths, StreamSpec,
};
use crate::schema::{ArraySchema, CellSize};
use crate::sm::pools::Pools;
use crate::tile::Tile;

/// Which precomputed ids accompany each cell record in the sort,
/// selected by `tile_order x cell_order`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum IdsKind {
    /// Irregular tiles, row- or column-major cell order.
    None,
    /// One id: the Hilbert cell id (irregular) or the tile id (regular).
    One,
    /// Two ids: the tile id and the Hilbert cell id.
    Two,
}

/// One cell staged in the in-memory run.
#[derive(Clone, Debug)]
struct CellRecord {
    id: u64,
    id2: u64,
    cell: Box<[u8]>,
}

// ---------------------------------------------------------------------
// Segment-buffered appender
// ---------------------------------------------------------------------

/// Buffers appends to one data file and flushes in `segment_size`
/// chunks.
struct SegmentWriter {
    path: PathBuf,
    file: Option<File>,
    buffer: Vec<u8>,
    capacity: usize,
    /// Absolute file offset of the next appended byte.
    offset: u64,
}

impl SegmentWriter {
    fn new(path: PathBuf, capacity: usize) -> Self {
        SegmentWriter {
            path,
            file: None,
            buffer: Vec::with_capacity(capacity.min(1 << 20)),
            capacity,
            offset: 0,
        }
    }

    /// Appends bytes, returning the absolute offset they start at.
    fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let at = self.offset;
        if self.buffer.len() + bytes.len() > self.capacity {
            self.flush()?;
        }
        if bytes.len() >= self.capacity {
            self.write_through(bytes)?;
        } else {
            self.buffer.extend_from_slice(bytes);
        }
        self.offset = at + bytes.len() as u64;
        Ok(at)
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let buffer = std::mem::take(&mut self.buffer);
        self.write_through(&buffer)?;
        self.buffer = buffer;
        self.buffer.clear();
        Ok(())
    }

    fn write_through(&mut self, bytes: &[u8]) -> Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| Error::io(&self.path, e))?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .unwrap()
            .write_all(bytes)
            .map_err(|e| Error::io(&self.path, e))
    }

    fn finish(mut self) -> Result<()> {
        self.flush()?;
        if let Some(file) = self.file.take() {
            file.sync_all().map_err(|e| Error::io(&self.path, e))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Fragment writer: tiles in, files + book-keeping out
// ---------------------------------------------------------------------

struct StreamWriter {
    spec: StreamSpec,
    values: FilterPipeline,
    offsets: FilterPipeline,
    data: SegmentWriter,
    var: Option<SegmentWriter>,
    validity: Option<SegmentWriter>,
}

struct EncodedTile {
    data: Vec<u8>,
    var: Option<Vec<u8>>,
    validity: Option<Vec<u8>>,
}

/// Receives rows of logical tiles (one tile per stream, equal tile ids)
/// in ascending tile-id order and persists them: filter, append to the
/// attribute files, record book-keeping.
pub struct FragmentWriter {
    schema: Arc<ArraySchema>,
    paths: FragmentPaths,
    pools: Arc<Pools>,
    book_keeping: BookKeeping,
    streams: Vec<StreamWriter>,
    last_tile_id: Option<u64>,
    last_tile_cell_num: u64,
}

impl FragmentWriter {
    pub fn create(
        schema: Arc<ArraySchema>,
        paths: FragmentPaths,
        config: &Config,
        pools: Arc<Pools>,
    ) -> Result<Self> {
        std::fs::create_dir_all(paths.dir())
            .map_err(|e| Error::io(paths.dir(), e))?;

        let specs = fragment_streams(&schema);
        let segment = config.segment_size as usize;
        let streams = specs
            .into_iter()
            .map(|spec| {
                let values =
                    FilterPipeline::new(&spec.filters, spec.datatype);
                let offsets =
                    FilterPipeline::new(&spec.filters, Datatype::UInt64);
                let data =
                    SegmentWriter::new(paths.attr_file(&spec.name), segment);
                let var = spec.is_var().then(|| {
                    SegmentWriter::new(
                        paths.attr_var_file(&spec.name),
                        segment,
                    )
                });
                let validity = spec.nullable.then(|| {
                    SegmentWriter::new(
                        paths.attr_validity_file(&spec.name),
                        segment,
                    )
                });
                StreamWriter {
                    spec,
                    values,
                    offsets,
                    data,
                    var,
                    validity,
                }
            })
            .collect::<Vec<_>>();

        let book_keeping =
            BookKeeping::new(streams.len(), schema.is_sparse());

        Ok(FragmentWriter {
            schema,
            paths,
            pools,
            book_keeping,
            streams,
            last_tile_id: None,
            last_tile_cell_num: 0,
        })
    }

    pub fn paths(&self) -> &FragmentPaths {
        &self.paths
    }

    pub fn schema(&self) -> &ArraySchema {
        &self.schema
    }

    pub fn stream_num(&self) -> usize {
        self.streams.len()
    }

    pub fn stream_specs(&self) -> Vec<StreamSpec> {
        self.streams.iter().map(|s| s.spec.clone()).collect()
    }

    pub fn tile_num(&self) -> u64 {
        self.book_keeping.tile_num()
    }

    /// Builds an empty tile row with the given tile id, one tile per
    /// stream.
    pub fn new_tile_row(&self, tile_id: u64, capacity_hint: u64) -> Vec<Tile> {
        self.streams
            .iter()
            .map(|s| {
                Tile::new(
                    s.spec.tile_type,
                    s.spec.datatype,
                    tile_id,
                    s.spec.dim_num,
                    s.spec.cell_size,
                    capacity_hint,
                )
            })
            .collect()
    }

    /// Persists one row of tiles sharing a tile id.
    pub fn write_tile_row(&mut self, tiles: &[Tile]) -> Result<()> {
        assert_eq!(tiles.len(), self.streams.len());
        let tile_id = tiles[0].tile_id();
        let cell_num = tiles[0].cell_num();
        if cell_num == 0 {
            return Ok(());
        }
        for t in tiles.iter() {
            if t.tile_id() != tile_id {
                return Err(Error::TileOrderViolation(format!(
                    "tile row mixes ids {} and {}",
                    tile_id,
                    t.tile_id()
                )));
            }
            if t.cell_num() != cell_num {
                return Err(Error::TileOrderViolation(format!(
                    "tile row mixes cell counts {} and {}",
                    cell_num,
                    t.cell_num()
                )));
            }
        }
        if let Some(last) = self.last_tile_id {
            if tile_id <= last {
                return Err(Error::TileOrderViolation(format!(
                    "tile id {tile_id} appended after {last}"
                )));
            }
        }

        // Filter every stream's buffers on the compute pool; attribute
        // streams are independent of one another.
        let encoded: Vec<EncodedTile> = self.pools.compute().install(|| {
            self.streams
                .par_iter()
                .zip(tiles.par_iter())
                .map(|(stream, tile)| encode_tile(stream, tile))
                .collect::<Result<Vec<_>>>()
        })?;

        self.book_keeping.append_tile_id(tile_id)?;
        if self.schema.is_sparse() {
            // The coordinate tile is the trailing stream
            let coords = tiles.last().unwrap();
            let (first, last) = coords.bounding_coords().unwrap();
            self.book_keeping
                .append_bounding_coords(first.to_vec(), last.to_vec())?;
            let mbr = coords.mbr().unwrap().clone();
            self.book_keeping.expand_non_empty_domain(&mbr);
            self.book_keeping.append_mbr(mbr)?;
        }

        for (i, (stream, enc)) in self
            .streams
            .iter_mut()
            .zip(encoded.into_iter())
            .enumerate()
        {
            let offset = stream.data.append(&enc.data)?;
            let var = match enc.var {
                Some(bytes) => {
                    let var_offset =
                        stream.var.as_mut().unwrap().append(&bytes)?;
                    Some((var_offset, bytes.len() as u64))
                }
                None => None,
            };
            self.book_keeping.append_tile_offset(i, offset, var)?;
            if let Some(bytes) = enc.validity {
                stream.validity.as_mut().unwrap().append(&bytes)?;
            }
        }

        self.last_tile_id = Some(tile_id);
        self.last_tile_cell_num = cell_num;
        Ok(())
    }

    /// Expands the fragment's non-empty domain; used by the dense path
    /// which has no coordinate tiles.
    pub fn expand_non_empty_domain(
        &mut self,
        mbr: &tiledb_common::range::MinimumBoundingRectangle,
    ) {
        self.book_keeping.expand_non_empty_domain(mbr);
    }

    /// Flushes everything and writes the commit marker; the fragment
    /// becomes visible atomically with the marker. On error the whole
    /// fragment directory is removed.
    pub fn finalize(mut self) -> Result<BookKeeping> {
        match self.finalize_inner() {
            Ok(()) => Ok(self.book_keeping),
            Err(e) => {
                self.paths.remove();
                Err(e)
            }
        }
    }

    fn finalize_inner(&mut self) -> Result<()> {
        self.book_keeping
            .set_last_tile_cell_num(self.last_tile_cell_num);
        let metadata = self.book_keeping.finalize(&self.schema)?;

        for stream in self.streams.drain(..) {
            stream.data.finish()?;
            if let Some(var) = stream.var {
                var.finish()?;
            }
            if let Some(validity) = stream.validity {
                validity.finish()?;
            }
        }

        let path = self.paths.metadata();
        std::fs::write(&path, &metadata)
            .map_err(|e| Error::io(&path, e))?;
        self.paths.write_commit_marker()?;
        debug!(
            fragment = %self.paths.dir().display(),
            tiles = self.book_keeping.tile_num(),
            "fragment committed"
        );
        Ok(())
    }

    /// Removes the uncommitted fragment directory.
    pub fn abort(self) {
        self.paths.remove();
    }
}

fn encode_tile(stream: &StreamWriter, tile: &Tile) -> Result<EncodedTile> {
    match stream.spec.cell_size {
        CellSize::Fixed(_) => {
            let data = stream.values.encode(tile.payload().to_vec())?;
            let validity = stream
                .spec
                .nullable
                .then(|| tile.validity().to_vec());
            Ok(EncodedTile {
                data,
                var: None,
                validity,
            })
        }
        CellSize::Var => {
            let offsets_bytes: Vec<u8> = tile
                .var_offsets()
                .iter()
                .flat_map(|o| o.to_le_bytes())
                .collect();
            let data = stream.offsets.encode(offsets_bytes)?;
            let var = stream.values.encode(tile.payload().to_vec())?;
            let validity = stream
                .spec
                .nullable
                .then(|| tile.validity().to_vec());
            Ok(EncodedTile {
                data,
                var: Some(var),
                validity,
            })
        }
    }
}

// ---------------------------------------------------------------------
// Write state: the external sort
// ---------------------------------------------------------------------
/// Accepts cells in arbitrary order and produces a globally-ordered,
/// tile-packed, filtered fragment: cells accumulate in an in-memory run
/// bounded by `sm.write_state_max_size`, sorted runs spill to numbered
/// files under the fragment's temp directory, and finalization merges
/// them hierarchically before tiling.
pub struct WriteState {
    schema: Arc<ArraySchema>,
    layout: CellLayout,
    ids_kind: IdsKind,
    config: Config,
    cancel: CancelToken,
    writer: FragmentWriter,
    temp_dir: PathBuf,
    run: Vec<CellRecord>,
    run_size: usize,
    runs_num: u64,
    pending_runs: Vec<PathBuf>,
    /// The tile row currently being packed, with its tile id.
    current: Option<(u64, Vec<Tile>)>,
    cell_num_in_tile: u64,
    total_cell_num: u64,
}

impl WriteState {
    pub fn new(
        schema: Arc<ArraySchema>,
        paths: FragmentPaths,
        config: Config,
        pools: Arc<Pools>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let writer = FragmentWriter::create(
            Arc::clone(&schema),
            paths,
            &config,
            pools,
        )?;
        let temp_dir = writer.paths().temp_dir();
        std::fs::create_dir_all(&temp_dir)
            .map_err(|e| Error::io(&temp_dir, e))?;

        let regular = schema.has_regular_tiles();
        let hilbert = schema.cell_order() == CellOrder::Hilbert;
        let ids_kind = match (regular, hilbert) {
            (false, false) => IdsKind::None,
            (false, true) | (true, false) => IdsKind::One,
            (true, true) => IdsKind::Two,
        };

        Ok(WriteState {
            layout: CellLayout::from_schema(&schema),
            schema,
            ids_kind,
            config,
            cancel,
            writer,
            temp_dir,
            run: Vec::new(),
            run_size: 0,
            runs_num: 0,
            pending_runs: Vec::new(),
            current: None,
            cell_num_in_tile: 0,
            total_cell_num: 0,
        })
    }

    pub fn total_cell_num(&self) -> u64 {
        self.total_cell_num
    }

    /// Stages one cell for the external sort.
    pub fn write_cell(&mut self, cell: &[u8]) -> Result<()> {
        self.cancel.check()?;
        let parsed = self.layout.parse(cell)?;
        self.schema.check_coords(parsed.coords)?;

        let (id, id2) = match self.ids_kind {
            IdsKind::None => (0, 0),
            IdsKind::One => {
                if self.schema.has_regular_tiles() {
                    (self.schema.tile_id(parsed.coords)?, 0)
                } else {
                    (self.schema.cell_id_hilbert(parsed.coords)?, 0)
                }
            }
            IdsKind::Two => (
                self.schema.tile_id(parsed.coords)?,
                self.schema.cell_id_hilbert(parsed.coords)?,
            ),
        };

        let record = CellRecord {
            id,
            id2,
            cell: cell[..parsed.size].to_vec().into_boxed_slice(),
        };
        self.run_size += record_size(&record);
        self.run.push(record);

        if self.run_size as u64 >= self.config.write_state_max_size {
            self.sort_run();
            self.flush_sorted_run()?;
        }
        Ok(())
    }

    /// Writes one cell already known to arrive in the global cell order;
    /// the ordered dense path and array-to-array copies use this.
    pub fn write_cell_sorted(&mut self, cell: &[u8]) -> Result<()> {
        self.cancel.check()?;
        let parsed = self.layout.parse(cell)?;
        self.schema.check_coords(parsed.coords)?;
        let record = CellRecord {
            id: if self.schema.has_regular_tiles() {
                self.schema.tile_id(parsed.coords)?
            } else {
                0
            },
            id2: 0,
            cell: cell[..parsed.size].to_vec().into_boxed_slice(),
        };
        self.tile_cell(&record)
    }

    /// Sorts and flushes pending runs, merges them, forms tiles, and
    /// commits the fragment. On any error the entire fragment directory
    /// is removed.
    pub fn finalize(mut self) -> Result<BookKeeping> {
        match self.finalize_steps() {
            Ok(()) => {
                let _ = std::fs::remove_dir_all(&self.temp_dir);
                self.writer.finalize()
            }
            Err(e) => {
                self.writer.abort();
                Err(e)
            }
        }
    }

    fn finalize_steps(&mut self) -> Result<()> {
        // Last in-memory run: a single-run write tiles straight from
        // memory without touching the temp directory
        if !self.run.is_empty() {
            self.sort_run();
            if self.runs_num == 0 {
                let run = std::mem::take(&mut self.run);
                for record in run.iter() {
                    self.cancel.check()?;
                    self.tile_cell(record)?;
                }
            } else {
                self.flush_sorted_run()?;
            }
        }

        if self.runs_num > 0 {
            self.merge_sorted_runs()?;
            self.make_tiles()?;
        }

        self.flush_current_tile()
    }

    /// Drops all on-disk state of the in-flight fragment.
    pub fn abort(self) {
        self.writer.abort();
    }

    // ------------------------------------------------------------------
    // Sorting and run files
    // ------------------------------------------------------------------

    fn sort_run(&mut self) {
        let schema = Arc::clone(&self.schema);
        let cmp = record_comparator(&schema, self.ids_kind);
        self.run.sort_unstable_by(|a, b| cmp(a, b));
    }

    fn flush_sorted_run(&mut self) -> Result<()> {
        let path = self.temp_dir.join(self.runs_num.to_string());
        let mut writer = SegmentWriter::new(
            path.clone(),
            self.config.segment_size as usize,
        );
        for record in self.run.drain(..) {
            write_record(&mut writer, &record, self.ids_kind)?;
        }
        writer.finish()?;
        debug!(run = %path.display(), "sorted run flushed");
        self.run_size = 0;
        self.runs_num += 1;
        Ok(())
    }

    /// Hierarchically merges run files: each level combines up to
    /// `write_state_max_size / segment_size - 1` runs until few enough
    /// remain to stream straight into tile formation.
    fn merge_sorted_runs(&mut self) -> Result<()> {
        let runs_per_merge = ((self.config.write_state_max_size
            / self.config.segment_size)
            .saturating_sub(1) as usize)
            .max(2);

        let mut level_runs: Vec<PathBuf> = (0..self.runs_num)
            .map(|i| self.temp_dir.join(i.to_string()))
            .collect();

        while level_runs.len() > runs_per_merge {
            self.cancel.check()?;
            let mut next_level = Vec::new();
            for group in level_runs.chunks(runs_per_merge) {
                let out_path =
                    self.temp_dir.join(self.runs_num.to_string());
                self.runs_num += 1;
                self.merge_group(group, &out_path)?;
                for run in group {
                    let _ = std::fs::remove_file(run);
                }
                next_level.push(out_path);
            }
            level_runs = next_level;
        }

        self.pending_runs = level_runs;
        Ok(())
    }

    fn merge_group(
        &self,
        group: &[PathBuf],
        out_path: &PathBuf,
    ) -> Result<()> {
        let mut runs = group
            .iter()
            .map(|p| {
                SortedRun::open(
                    p,
                    self.ids_kind,
                    self.config.segment_size as usize,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let mut writer = SegmentWriter::new(
            out_path.clone(),
            self.config.segment_size as usize,
        );
        let cmp = record_comparator(&self.schema, self.ids_kind);
        while let Some(record) = next_record(&mut runs, &cmp)? {
            write_record(&mut writer, &record, self.ids_kind)?;
        }
        writer.finish()
    }

    /// Streams the final merged order into tile formation.
    fn make_tiles(&mut self) -> Result<()> {
        let run_paths = std::mem::take(&mut self.pending_runs);
        let mut runs = run_paths
            .iter()
            .map(|p| {
                SortedRun::open(
                    p,
                    self.ids_kind,
                    self.config.segment_size as usize,
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let cmp = record_comparator(&self.schema, self.ids_kind);
        while let Some(record) = next_record(&mut runs, &cmp)? {
            self.cancel.check()?;
            self.tile_cell(&record)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tile formation
    // ------------------------------------------------------------------

    /// Adds one globally-ordered cell to the tile under construction,
    /// flushing at tile boundaries.
    fn tile_cell(&mut self, record: &CellRecord) -> Result<()> {
        let regular = self.schema.has_regular_tiles();
        let boundary = match self.current.as_ref() {
            None => false,
            Some((current_id, _)) => {
                if regular {
                    record.id != *current_id
                } else {
                    self.cell_num_in_tile >= self.schema.capacity()
                }
            }
        };
        if boundary {
            self.flush_current_tile()?;
        }

        if self.current.is_none() {
            let tile_id = if regular {
                record.id
            } else {
                self.writer.tile_num()
            };
            let hint = self.schema.cell_num_per_tile();
            self.current =
                Some((tile_id, self.writer.new_tile_row(tile_id, hint)));
            self.cell_num_in_tile = 0;
        }

        let parsed = self.layout.parse(&record.cell)?;
        let attr_num = self.schema.attribute_num();
        let (_, tiles) = self.current.as_mut().unwrap();
        for (i, tile) in tiles.iter_mut().enumerate() {
            if i < attr_num {
                let value = parsed.attrs[i];
                match tile.cell_size() {
                    CellSize::Var => {
                        tile.append_var_cell(value.value, value.validity)?
                    }
                    CellSize::Fixed(_) => {
                        tile.append_cell(value.value, value.validity)?
                    }
                }
            } else {
                tile.append_coords(parsed.coords)?;
            }
        }
        if !self.schema.is_sparse() {
            // Dense fragments carry no coordinate tiles; grow the
            // non-empty domain from the cell itself
            let mbr = point_mbr(&self.schema, parsed.coords);
            self.writer.expand_non_empty_domain(&mbr);
        }
        self.cell_num_in_tile += 1;
        self.total_cell_num += 1;
        Ok(())
    }

    fn flush_current_tile(&mut self) -> Result<()> {
        if let Some((_, tiles)) = self.current.take() {
            if !self.schema.is_sparse()
                && tiles[0].cell_num() != self.schema.cell_num_per_tile()
            {
                return Err(Error::TileOrderViolation(format!(
                    "dense tile {} holds {} of {} cells; dense writes \
                     must cover whole tiles",
                    tiles[0].tile_id(),
                    tiles[0].cell_num(),
                    self.schema.cell_num_per_tile()
                )));
            }
            self.writer.write_tile_row(&tiles)?;
        }
        Ok(())
    }
}

fn point_mbr(
    schema: &ArraySchema,
    coords: &[u8],
) -> tiledb_common::range::MinimumBoundingRectangle {
    use tiledb_common::datatype::PhysicalType;
    use tiledb_common::range::SingleValueRange;

    tiledb_common::physical_type_go!(schema.coords_type(), DT, {
        let size = std::mem::size_of::<DT>();
        (0..schema.dim_num())
            .map(|i| {
                let c = DT::read_le(&coords[i * size..(i + 1) * size]);
                SingleValueRange::from(&[c, c])
            })
            .collect()
    })
}

fn record_size(record: &CellRecord) -> usize {
    record.cell.len() + 2 * std::mem::size_of::<u64>()
}

/// The sort comparators: precomputed ids first, the schema's coordinate
/// comparison as the final tiebreaker.
fn record_comparator(
    schema: &Arc<ArraySchema>,
    kind: IdsKind,
) -> impl Fn(&CellRecord, &CellRecord) -> Ordering {
    let schema = Arc::clone(schema);
    let coords_size = schema.coords_size();
    move |a: &CellRecord, b: &CellRecord| {
        let coords_a = &a.cell[..coords_size];
        let coords_b = &b.cell[..coords_size];
        match kind {
            IdsKind::None => schema.cell_cmp(coords_a, coords_b),
            IdsKind::One => a
                .id
                .cmp(&b.id)
                .then_with(|| schema.cell_cmp(coords_a, coords_b)),
            IdsKind::Two => a
                .id
                .cmp(&b.id)
                .then_with(|| a.id2.cmp(&b.id2))
                .then_with(|| {
                    schema.coords_cmp_row_major(coords_a, coords_b)
                }),
        }
    }
}

fn write_record(
    writer: &mut SegmentWriter,
    record: &CellRecord,
    kind: IdsKind,
) -> Result<()> {
    let mut header = Vec::with_capacity(20);
    match kind {
        IdsKind::None => {}
        IdsKind::One => header.extend_from_slice(&record.id.to_le_bytes()),
        IdsKind::Two => {
            header.extend_from_slice(&record.id.to_le_bytes());
            header.extend_from_slice(&record.id2.to_le_bytes());
        }
    }
    header.extend_from_slice(&(record.cell.len() as u32).to_le_bytes());
    writer.append(&header)?;
    writer.append(&record.cell)?;
    Ok(())
}

/// A sorted run file staged through a buffered reader.
struct SortedRun {
    reader: BufReader<File>,
    path: PathBuf,
    kind: IdsKind,
    current: Option<CellRecord>,
}

impl SortedRun {
    fn open(
        path: &PathBuf,
        kind: IdsKind,
        buffer_size: usize,
    ) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        let mut run = SortedRun {
            reader: BufReader::with_capacity(buffer_size.max(4096), file),
            path: path.clone(),
            kind,
            current: None,
        };
        run.advance()?;
        Ok(run)
    }

    fn current(&self) -> Option<&CellRecord> {
        self.current.as_ref()
    }

    fn advance(&mut self) -> Result<()> {
        let mut id = 0u64;
        let mut id2 = 0u64;
        let mut first = [0u8; 8];
        let first_field = match self.kind {
            IdsKind::None => 4,
            IdsKind::One | IdsKind::Two => 8,
        };

        // The first field read tells apart a clean end-of-run
        match self.reader.read_exact(&mut first[..first_field]) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.current = None;
                return Ok(());
            }
            Err(e) => return Err(Error::io(&self.path, e)),
        }

        let len = match self.kind {
            IdsKind::None => {
                u32::from_le_bytes(first[..4].try_into().unwrap()) as usize
            }
            IdsKind::One | IdsKind::Two => {
                id = u64::from_le_bytes(first);
                if self.kind == IdsKind::Two {
                    let mut raw = [0u8; 8];
                    self.reader
                        .read_exact(&mut raw)
                        .map_err(|e| Error::io(&self.path, e))?;
                    id2 = u64::from_le_bytes(raw);
                }
                let mut raw = [0u8; 4];
                self.reader
                    .read_exact(&mut raw)
                    .map_err(|e| Error::io(&self.path, e))?;
                u32::from_le_bytes(raw) as usize
            }
        };

        let mut cell = vec![0u8; len];
        self.reader
            .read_exact(&mut cell)
            .map_err(|e| Error::io(&self.path, e))?;

        self.current = Some(CellRecord {
            id,
            id2,
            cell: cell.into_boxed_slice(),
        });
        Ok(())
    }
}

/// Pops the globally-smallest record across the runs.
fn next_record(
    runs: &mut [SortedRun],
    cmp: &impl Fn(&CellRecord, &CellRecord) -> Ordering,
) -> Result<Option<CellRecord>> {
    let mut best: Option<usize> = None;
    for (i, run) in runs.iter().enumerate() {
        let Some(candidate) = run.current() else {
            continue;
        };
        match best {
            None => best = Some(i),
            Some(j) => {
                if cmp(candidate, runs[j].current().unwrap())
                    == Ordering::Less
                {
                    best = Some(i);
                }
            }
        }
    }
    match best {
        None => Ok(None),
        Some(i) => {
            let record = runs[i].current.take().unwrap();
            runs[i].advance()?;
            Ok(Some(record))
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use tiledb_common::array::{ArrayType, CellOrder, TileOrder};
    use tiledb_common::datatype::Datatype;
    use tiledb_pod::array::{
        AttributeData, DimensionData, DomainData, SchemaData,
    };

    use super::*;

    #[test]
    fn segment_writer_offsets_and_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.tdb");
        let mut writer = SegmentWriter::new(path.clone(), 8);

        assert_eq!(0, writer.append(b"abc").unwrap());
        assert_eq!(3, writer.append(b"defg").unwrap());
        // Exceeds the segment capacity: earlier bytes flush first
        assert_eq!(7, writer.append(b"0123456789").unwrap());
        assert_eq!(17, writer.append(b"hi").unwrap());
        writer.finish().unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(b"abcdefg0123456789hi".to_vec(), bytes);
    }

    fn sort_schema(cell_order: CellOrder) -> Arc<ArraySchema> {
        Arc::new(
            ArraySchema::new(SchemaData {
                array_name: "sorting".to_owned(),
                array_type: ArrayType::Sparse,
                domain: DomainData {
                    datatype: Datatype::UInt32,
                    dimension: vec![
                        DimensionData {
                            name: "x".to_owned(),
                            domain: [0.0, 3.0],
                            extent: Some(2.0),
                        },
                        DimensionData {
                            name: "y".to_owned(),
                            domain: [0.0, 3.0],
                            extent: Some(2.0),
                        },
                    ],
                },
                capacity: Some(4),
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
            .unwrap(),
        )
    }

    fn record(schema: &ArraySchema, x: u32, y: u32) -> CellRecord {
        let mut cell = Vec::new();
        cell.extend_from_slice(&x.to_le_bytes());
        cell.extend_from_slice(&y.to_le_bytes());
        cell.extend_from_slice(&0i32.to_le_bytes());
        let coords = &cell[..8];
        CellRecord {
            id: schema.tile_id(coords).unwrap(),
            id2: 0,
            cell: cell.clone().into_boxed_slice(),
        }
    }

    #[test]
    fn comparator_orders_by_tile_then_cell() {
        let schema = sort_schema(CellOrder::RowMajor);
        let cmp = record_comparator(&schema, IdsKind::One);

        let mut records = vec![
            record(&schema, 3, 3), // tile 3
            record(&schema, 0, 2), // tile 1
            record(&schema, 1, 0), // tile 0
            record(&schema, 0, 0), // tile 0
        ];
        records.sort_by(|a, b| cmp(a, b));

        let order: Vec<(u32, u32)> = records
            .iter()
            .map(|r| {
                (
                    u32::from_le_bytes(r.cell[0..4].try_into().unwrap()),
                    u32::from_le_bytes(r.cell[4..8].try_into().unwrap()),
                )
            })
            .collect();
        assert_eq!(vec![(0, 0), (1, 0), (0, 2), (3, 3)], order);
    }

    #[test]
    fn run_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let schema = sort_schema(CellOrder::RowMajor);
        let path = dir.path().join("0");

        let records = vec![
            record(&schema, 0, 0),
            record(&schema, 0, 1),
            record(&schema, 2, 3),
        ];
        let mut writer = SegmentWriter::new(path.clone(), 4096);
        for r in records.iter() {
            write_record(&mut writer, r, IdsKind::One).unwrap();
        }
        writer.finish().unwrap();

        let mut run =
            SortedRun::open(&path, IdsKind::One, 4096).unwrap();
        let mut seen = Vec::new();
        while let Some(snapshot) =
            run.current().map(|r| (r.id, r.cell.clone()))
        {
            seen.push(snapshot);
            run.advance().unwrap();
        }
        assert_eq!(3, seen.len());
        for (expect, got) in records.iter().zip(seen.iter()) {
            assert_eq!(expect.id, got.0);
            assert_eq!(expect.cell, got.1);
        }
    }
}
