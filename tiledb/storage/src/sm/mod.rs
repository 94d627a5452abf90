//! The storage manager: workspace and array lifecycle, the process-local
//! registry of open fragments, tile append validation, and segment-sized
//! staging of tile reads.

pub mod pools;
pub mod tile_cache;

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use tiledb_common::array::Mode;
use tiledb_common::range::SingleValueRange;

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::filter::FilterPipeline;
use crate::fragment::read_state::{ReadState, TileSource};
use crate::fragment::write_state::{FragmentWriter, WriteState};
use crate::fragment::{
    fragment_streams, BookKeeping, FragmentName, FragmentPaths,
    StreamSpec, ARRAY_SCHEMA_FILENAME, FRAGMENTS_BKP_FILENAME,
};
use crate::schema::{ArraySchema, CellSize};
use crate::tile::Tile;

use self::pools::Pools;
use self::tile_cache::{TileCache, TileKey};

/// Non-owning handle to an open fragment. Validated on every call; a
/// closed fragment invalidates its descriptors.
#[derive(Clone, Debug)]
pub struct FragmentDescriptor {
    key: String,
    generation: u64,
}

impl FragmentDescriptor {
    pub fn fragment_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap()
    }
}

/// Non-owning handle to an open array.
#[derive(Clone, Debug)]
pub struct ArrayDescriptor {
    array_name: String,
    generation: u64,
    schema: Arc<ArraySchema>,
    fragments: Vec<FragmentDescriptor>,
}

impl ArrayDescriptor {
    pub fn array_name(&self) -> &str {
        &self.array_name
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    pub fn fragments(&self) -> &[FragmentDescriptor] {
        &self.fragments
    }
}

/// One open fragment, exclusively owned by the storage manager.
enum OpenFragmentInfo {
    Read(Arc<ReadFragment>),
    Create(Mutex<CreateFragment>),
}

/// An open fragment in read mode: finalized book-keeping plus the
/// per-stream staging state of the segment loader.
pub struct ReadFragment {
    uid: u64,
    schema: Arc<ArraySchema>,
    paths: FragmentPaths,
    streams: Vec<StreamSpec>,
    book_keeping: BookKeeping,
    cache: Arc<TileCache>,
    pools: Arc<Pools>,
    segment_size: u64,
    staged: Mutex<Vec<StagedStream>>,
}

#[derive(Default)]
struct StagedStream {
    tiles: HashMap<u64, Arc<Tile>>,
    /// Insertion order of ranks; the oldest are evicted first.
    order: std::collections::VecDeque<u64>,
    bytes: usize,
}

/// An open fragment in create mode: assembles rows of tiles appended
/// round-robin by attribute.
struct CreateFragment {
    writer: Option<FragmentWriter>,
    stream_num: usize,
    /// Tile id of the row being assembled.
    row_id: Option<u64>,
    row: Vec<Option<Tile>>,
    last_flushed_id: Option<u64>,
    lastly_appended: Vec<Option<u64>>,
}

/// The storage manager owns every open fragment and array; all callers
/// hold descriptors only.
pub struct StorageManager {
    workspace: PathBuf,
    config: Config,
    pools: Arc<Pools>,
    tile_cache: Arc<TileCache>,
    open_fragments: RwLock<HashMap<String, (u64, Arc<OpenFragmentInfo>)>>,
    generation: AtomicU64,
}

impl StorageManager {
    pub fn new(workspace: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let workspace = workspace.into();
        std::fs::create_dir_all(&workspace)
            .map_err(|e| Error::io(&workspace, e))?;
        let pools = Arc::new(Pools::new(&config)?);
        let tile_cache = Arc::new(TileCache::new(config.tile_cache_size));
        info!(workspace = %workspace.display(), "storage manager ready");
        Ok(StorageManager {
            workspace,
            config,
            pools,
            tile_cache,
            open_fragments: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(1),
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn array_dir(&self, array_name: &str) -> PathBuf {
        self.workspace.join(array_name)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, AtomicOrdering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Array lifecycle
    // ------------------------------------------------------------------

    pub fn array_defined(&self, array_name: &str) -> bool {
        self.array_dir(array_name)
            .join(ARRAY_SCHEMA_FILENAME)
            .is_file()
    }

    /// Stores a new array schema; the array must not exist yet.
    pub fn define_array(&self, schema: &ArraySchema) -> Result<()> {
        let dir = self.array_dir(schema.array_name());
        if self.array_defined(schema.array_name()) {
            return Err(Error::AlreadyExists(format!(
                "array '{}'",
                schema.array_name()
            )));
        }
        std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
        let path = dir.join(ARRAY_SCHEMA_FILENAME);
        std::fs::write(&path, schema.serialize())
            .map_err(|e| Error::io(&path, e))?;
        info!(array = schema.array_name(), "array defined");
        Ok(())
    }

    /// Replaces the schema of an existing array.
    pub fn modify_array_schema(&self, schema: &ArraySchema) -> Result<()> {
        if !self.array_defined(schema.array_name()) {
            return Err(Error::NotFound(format!(
                "array '{}'",
                schema.array_name()
            )));
        }
        let path = self
            .array_dir(schema.array_name())
            .join(ARRAY_SCHEMA_FILENAME);
        std::fs::write(&path, schema.serialize())
            .map_err(|e| Error::io(&path, e))
    }

    pub fn load_array_schema(
        &self,
        array_name: &str,
    ) -> Result<Arc<ArraySchema>> {
        let path = self.array_dir(array_name).join(ARRAY_SCHEMA_FILENAME);
        if !path.is_file() {
            return Err(Error::NotFound(format!("array '{array_name}'")));
        }
        let bytes =
            std::fs::read(&path).map_err(|e| Error::io(&path, e))?;
        Ok(Arc::new(ArraySchema::deserialize(&bytes)?))
    }

    /// Deletes every fragment of the array, keeping the schema.
    pub fn clear_array(&self, array_name: &str) -> Result<()> {
        for name in self.all_fragment_dirs(array_name)? {
            FragmentPaths::new(&self.array_dir(array_name), &name).remove();
        }
        let bkp = self.array_dir(array_name).join(FRAGMENTS_BKP_FILENAME);
        let _ = std::fs::remove_file(bkp);
        Ok(())
    }

    /// Deletes the array regardless of whether it is open.
    pub fn delete_array(&self, array_name: &str) -> Result<()> {
        let dir = self.array_dir(array_name);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("array '{array_name}'")));
        }
        std::fs::remove_dir_all(&dir).map_err(|e| Error::io(&dir, e))
    }

    pub fn delete_fragment(
        &self,
        array_name: &str,
        fragment_name: &str,
    ) -> Result<()> {
        FragmentPaths::new(&self.array_dir(array_name), fragment_name)
            .remove();
        Ok(())
    }

    fn all_fragment_dirs(&self, array_name: &str) -> Result<Vec<String>> {
        let dir = self.array_dir(array_name);
        if !dir.is_dir() {
            return Err(Error::NotFound(format!("array '{array_name}'")));
        }
        let mut out = Vec::new();
        let entries =
            std::fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if FragmentName::from_str(&name).is_ok() {
                out.push(name);
            }
        }
        Ok(out)
    }

    /// The committed fragments visible at a snapshot, in fragment
    /// timestamp order. A reader opened at snapshot `t` observes exactly
    /// the fragments with `timestamp_hi <= t` that carry a commit marker.
    pub fn committed_fragment_names(
        &self,
        array_name: &str,
        snapshot: Option<u64>,
    ) -> Result<Vec<String>> {
        let dir = self.array_dir(array_name);
        let mut named = Vec::new();
        for name in self.all_fragment_dirs(array_name)? {
            let parsed = FragmentName::from_str(&name)?;
            if !FragmentPaths::new(&dir, &name).is_committed() {
                continue;
            }
            if let Some(t) = snapshot {
                if parsed.timestamp_hi > t {
                    continue;
                }
            }
            named.push((parsed, name));
        }
        named.sort_by_key(|(parsed, _)| {
            (parsed.timestamp_hi, parsed.timestamp_lo, parsed.uuid)
        });
        Ok(named.into_iter().map(|(_, name)| name).collect())
    }

    /// Rewrites the committed-fragment list file.
    pub fn flush_fragments_bkp(
        &self,
        array_name: &str,
        fragment_names: &[String],
    ) -> Result<()> {
        let path = self.array_dir(array_name).join(FRAGMENTS_BKP_FILENAME);
        let contents = fragment_names.join("\n");
        std::fs::write(&path, contents).map_err(|e| Error::io(&path, e))
    }

    pub fn load_fragments_bkp(
        &self,
        array_name: &str,
    ) -> Result<Vec<String>> {
        let path = self.array_dir(array_name).join(FRAGMENTS_BKP_FILENAME);
        if !path.is_file() {
            return Ok(Vec::new());
        }
        let contents = std::fs::read_to_string(&path)
            .map_err(|e| Error::io(&path, e))?;
        Ok(contents
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_owned())
            .collect())
    }

    /// Removes fragment directories that never received a commit marker;
    /// called when an array is opened for writing.
    pub fn remove_uncommitted_fragments(
        &self,
        array_name: &str,
    ) -> Result<()> {
        let dir = self.array_dir(array_name);
        for name in self.all_fragment_dirs(array_name)? {
            let paths = FragmentPaths::new(&dir, &name);
            if !paths.is_committed() {
                warn!(
                    array = array_name,
                    fragment = name.as_str(),
                    "removing uncommitted fragment"
                );
                paths.remove();
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Open and close
    // ------------------------------------------------------------------

    /// Opens an array: loads the schema and opens each named fragment.
    /// In create mode, opens one fresh fragment instead.
    pub fn open_array(
        &self,
        array_name: &str,
        fragment_names: &[String],
        mode: Mode,
    ) -> Result<ArrayDescriptor> {
        let schema = self.load_array_schema(array_name)?;
        let generation = self.next_generation();

        let fragments = match mode {
            Mode::Read => fragment_names
                .iter()
                .map(|name| self.open_fragment(&schema, name, Mode::Read))
                .collect::<Result<Vec<_>>>()?,
            Mode::Create => {
                self.remove_uncommitted_fragments(array_name)?;
                let name = FragmentName::generate().to_string();
                vec![self.open_fragment(&schema, &name, Mode::Create)?]
            }
        };

        Ok(ArrayDescriptor {
            array_name: array_name.to_owned(),
            generation,
            schema,
            fragments,
        })
    }

    /// Opens one fragment: loads book-keeping in read mode, initializes
    /// empty book-keeping in create mode.
    pub fn open_fragment(
        &self,
        schema: &Arc<ArraySchema>,
        fragment_name: &str,
        mode: Mode,
    ) -> Result<FragmentDescriptor> {
        let key = format!("{}/{}", schema.array_name(), fragment_name);
        let paths = FragmentPaths::new(
            &self.array_dir(schema.array_name()),
            fragment_name,
        );
        let generation = self.next_generation();

        let info = match mode {
            Mode::Read => {
                let metadata_path = paths.metadata();
                if !paths.is_committed() || !metadata_path.is_file() {
                    return Err(Error::NotFound(format!(
                        "fragment '{key}'"
                    )));
                }
                let parsed = FragmentName::from_str(fragment_name)?;
                if parsed.version != crate::fragment::FORMAT_VERSION {
                    return Err(Error::Corrupted(format!(
                        "fragment '{key}' has unknown format version {}",
                        parsed.version
                    )));
                }
                let bytes = std::fs::read(&metadata_path)
                    .map_err(|e| Error::io(&metadata_path, e))?;
                let book_keeping = BookKeeping::deserialize(
                    &bytes,
                    schema,
                    schema.is_sparse(),
                )?;
                let streams = fragment_streams(schema);
                let staged =
                    (0..streams.len()).map(|_| StagedStream::default());
                OpenFragmentInfo::Read(Arc::new(ReadFragment {
                    uid: generation,
                    schema: Arc::clone(schema),
                    paths,
                    streams,
                    book_keeping,
                    cache: Arc::clone(&self.tile_cache),
                    pools: Arc::clone(&self.pools),
                    segment_size: self.config.segment_size,
                    staged: Mutex::new(staged.collect()),
                }))
            }
            Mode::Create => {
                let writer = FragmentWriter::create(
                    Arc::clone(schema),
                    paths,
                    &self.config,
                    Arc::clone(&self.pools),
                )?;
                let stream_num = writer.stream_num();
                OpenFragmentInfo::Create(Mutex::new(CreateFragment {
                    writer: Some(writer),
                    stream_num,
                    row_id: None,
                    row: (0..stream_num).map(|_| None).collect(),
                    last_flushed_id: None,
                    lastly_appended: vec![None; stream_num],
                }))
            }
        };

        let mut registry = self.open_fragments.write();
        registry.insert(key.clone(), (generation, Arc::new(info)));
        debug!(fragment = key.as_str(), ?mode, "fragment opened");
        Ok(FragmentDescriptor { key, generation })
    }

    fn lookup(
        &self,
        fd: &FragmentDescriptor,
    ) -> Result<Arc<OpenFragmentInfo>> {
        let registry = self.open_fragments.read();
        match registry.get(&fd.key) {
            Some((generation, info)) if *generation == fd.generation => {
                Ok(Arc::clone(info))
            }
            _ => Err(Error::InvalidDescriptor("fragment")),
        }
    }

    fn lookup_read(
        &self,
        fd: &FragmentDescriptor,
    ) -> Result<Arc<ReadFragment>> {
        match self.lookup(fd)?.as_ref() {
            OpenFragmentInfo::Read(fragment) => Ok(Arc::clone(fragment)),
            OpenFragmentInfo::Create(_) => {
                Err(Error::InvalidDescriptor("fragment open for create"))
            }
        }
    }

    /// Closes all fragments of the array; create-mode fragments are
    /// finalized and registered in the committed-fragment list.
    pub fn close_array(&self, ad: &ArrayDescriptor) -> Result<()> {
        for fd in ad.fragments.iter() {
            self.close_fragment(fd)?;
        }
        Ok(())
    }

    /// Closes one fragment. In create mode this validates that every
    /// stream appended the same last tile, finalizes the book-keeping,
    /// and writes the commit marker.
    pub fn close_fragment(&self, fd: &FragmentDescriptor) -> Result<()> {
        let info = {
            let mut registry = self.open_fragments.write();
            match registry.get(&fd.key) {
                Some((generation, _)) if *generation == fd.generation => {
                    registry.remove(&fd.key).unwrap().1
                }
                _ => return Err(Error::InvalidDescriptor("fragment")),
            }
        };

        match info.as_ref() {
            OpenFragmentInfo::Read(fragment) => {
                self.tile_cache.evict_fragment(fragment.uid);
                Ok(())
            }
            OpenFragmentInfo::Create(create) => {
                let mut create = create.lock();
                // A complete row flushes eagerly, so a pending row id
                // means some stream never received the last tile
                if create.row_id.is_some() {
                    let incomplete: Vec<usize> = create
                        .row
                        .iter()
                        .enumerate()
                        .filter(|(_, t)| t.is_none())
                        .map(|(i, _)| i)
                        .collect();
                    let writer = create.writer.take().unwrap();
                    writer.abort();
                    return Err(Error::TileOrderViolation(format!(
                        "fragment closed with an incomplete tile row; \
                         streams {incomplete:?} never received the \
                         last tile"
                    )));
                }
                let writer = create.writer.take().unwrap();
                let array_name =
                    fd.key.rsplit_once('/').unwrap().0.to_owned();
                writer.finalize()?;

                let mut committed =
                    self.load_fragments_bkp(&array_name)?;
                committed.push(fd.fragment_name().to_owned());
                self.flush_fragments_bkp(&array_name, &committed)
            }
        }
    }

    // ------------------------------------------------------------------
    // Tile append (create mode)
    // ------------------------------------------------------------------

    /// Inserts a tile into the fragment. Two rules are enforced: per
    /// stream, tile ids must strictly increase; and once a tile id is
    /// appended for one stream, every other stream must receive that
    /// tile before any stream may move to a new id.
    pub fn append_tile(
        &self,
        fd: &FragmentDescriptor,
        stream: usize,
        tile: Tile,
    ) -> Result<()> {
        let info = self.lookup(fd)?;
        let OpenFragmentInfo::Create(create) = info.as_ref() else {
            return Err(Error::InvalidDescriptor("fragment open for read"));
        };
        let mut create = create.lock();
        create.append(stream, tile)
    }

    // ------------------------------------------------------------------
    // Tile access (read mode)
    // ------------------------------------------------------------------

    pub fn tile_rank(
        &self,
        fd: &FragmentDescriptor,
        tile_id: u64,
    ) -> Result<Option<u64>> {
        Ok(self.lookup_read(fd)?.book_keeping.tile_rank(tile_id))
    }

    pub fn tile_num(&self, fd: &FragmentDescriptor) -> Result<u64> {
        Ok(self.lookup_read(fd)?.book_keeping.tile_num())
    }

    /// The tile of a stream with the given tile id.
    pub fn get_tile(
        &self,
        fd: &FragmentDescriptor,
        stream: usize,
        tile_id: u64,
    ) -> Result<Arc<Tile>> {
        let fragment = self.lookup_read(fd)?;
        let rank =
            fragment.book_keeping.tile_rank(tile_id).ok_or_else(|| {
                Error::NotFound(format!("tile id {tile_id}"))
            })?;
        fragment.tile(stream, rank)
    }

    /// The tile of a stream at the given rank.
    pub fn get_tile_by_rank(
        &self,
        fd: &FragmentDescriptor,
        stream: usize,
        rank: u64,
    ) -> Result<Arc<Tile>> {
        self.lookup_read(fd)?.tile(stream, rank)
    }

    /// Lazy tile iterator over a stream, by ascending rank.
    pub fn iter(
        &self,
        fd: &FragmentDescriptor,
        stream: usize,
    ) -> Result<TileIter> {
        let fragment = self.lookup_read(fd)?;
        Ok(TileIter {
            tile_num: fragment.book_keeping.tile_num(),
            fragment,
            stream,
            next_rank: 0,
            reverse: false,
        })
    }

    /// Lazy tile iterator over a stream, by descending rank.
    pub fn reverse_iter(
        &self,
        fd: &FragmentDescriptor,
        stream: usize,
    ) -> Result<TileIter> {
        let fragment = self.lookup_read(fd)?;
        Ok(TileIter {
            tile_num: fragment.book_keeping.tile_num(),
            fragment,
            stream,
            next_rank: 0,
            reverse: true,
        })
    }

    /// A range read over one open fragment.
    pub fn read_state(
        &self,
        fd: &FragmentDescriptor,
        range: Vec<SingleValueRange>,
        reverse: bool,
    ) -> Result<ReadState<Arc<ReadFragment>>> {
        let fragment = self.lookup_read(fd)?;
        let schema = Arc::clone(&fragment.schema);
        ReadState::new(fragment, schema, range, reverse)
    }

    /// The open-fragment state behind a read-mode descriptor, giving
    /// access to its book-keeping.
    pub fn read_fragment(
        &self,
        fd: &FragmentDescriptor,
    ) -> Result<Arc<ReadFragment>> {
        self.lookup_read(fd)
    }

    pub fn non_empty_domain(
        &self,
        fd: &FragmentDescriptor,
    ) -> Result<Option<Vec<SingleValueRange>>> {
        Ok(self
            .lookup_read(fd)?
            .book_keeping
            .non_empty_domain()
            .cloned())
    }

    // ------------------------------------------------------------------
    // Cell writes
    // ------------------------------------------------------------------

    /// Creates a write state for a fresh fragment of the array; cells
    /// go through the external sort and the fragment commits on
    /// `WriteState::finalize`.
    pub fn cell_writer(
        &self,
        array_name: &str,
        cancel: CancelToken,
    ) -> Result<(WriteState, String)> {
        let schema = self.load_array_schema(array_name)?;
        self.remove_uncommitted_fragments(array_name)?;
        let fragment_name = FragmentName::generate().to_string();
        let paths = FragmentPaths::new(
            &self.array_dir(array_name),
            &fragment_name,
        );
        let ws = WriteState::new(
            schema,
            paths,
            self.config.clone(),
            Arc::clone(&self.pools),
            cancel,
        )?;
        Ok((ws, fragment_name))
    }

    /// Adds a freshly committed fragment to the committed-fragment list.
    pub fn register_fragment(
        &self,
        array_name: &str,
        fragment_name: &str,
    ) -> Result<()> {
        let mut committed = self.load_fragments_bkp(array_name)?;
        committed.push(fragment_name.to_owned());
        self.flush_fragments_bkp(array_name, &committed)
    }
}

impl CreateFragment {
    fn append(&mut self, stream: usize, tile: Tile) -> Result<()> {
        if stream >= self.stream_num {
            return Err(Error::NotFound(format!("stream {stream}")));
        }
        let id = tile.tile_id();

        // Per-stream ids strictly increase
        if let Some(last) = self.lastly_appended[stream] {
            if id <= last {
                return Err(Error::TileOrderViolation(format!(
                    "stream {stream} received tile {id} after {last}"
                )));
            }
        }

        match self.row_id {
            None => {
                if let Some(last) = self.last_flushed_id {
                    if id <= last {
                        return Err(Error::TileOrderViolation(format!(
                            "tile id {id} appended after {last}"
                        )));
                    }
                }
                self.row_id = Some(id);
            }
            Some(current) => {
                if id != current {
                    // Another stream has been lapped
                    return Err(Error::TileOrderViolation(format!(
                        "tile {id} appended before every stream \
                         received tile {current}"
                    )));
                }
            }
        }

        if self.row[stream].is_some() {
            return Err(Error::TileOrderViolation(format!(
                "stream {stream} received tile {id} twice"
            )));
        }
        self.row[stream] = Some(tile);
        self.lastly_appended[stream] = Some(id);

        if self.row.iter().all(|t| t.is_some()) {
            self.flush_row()?;
        }
        Ok(())
    }

    fn flush_row(&mut self) -> Result<()> {
        let tiles: Vec<Tile> =
            self.row.iter_mut().map(|t| t.take().unwrap()).collect();
        self.last_flushed_id = self.row_id.take();
        self.writer.as_mut().unwrap().write_tile_row(&tiles)
    }
}

/// Lazy tile iterator; the total order matches the fragment's global
/// tile order (rank order), or its reverse.
pub struct TileIter {
    fragment: Arc<ReadFragment>,
    stream: usize,
    tile_num: u64,
    next_rank: u64,
    reverse: bool,
}

impl TileIter {
    pub fn next_tile(&mut self) -> Result<Option<Arc<Tile>>> {
        if self.next_rank >= self.tile_num {
            return Ok(None);
        }
        let rank = if self.reverse {
            self.tile_num - 1 - self.next_rank
        } else {
            self.next_rank
        };
        self.next_rank += 1;
        Ok(Some(self.fragment.tile(self.stream, rank)?))
    }
}

impl ReadFragment {
    pub fn book_keeping(&self) -> &BookKeeping {
        &self.book_keeping
    }

    pub fn schema(&self) -> &Arc<ArraySchema> {
        &self.schema
    }

    /// Number of cells in the tile at a rank.
    fn tile_cell_num(&self, rank: u64) -> u64 {
        let last = self.book_keeping.tile_num().saturating_sub(1);
        if rank == last && self.book_keeping.last_tile_cell_num() > 0 {
            self.book_keeping.last_tile_cell_num()
        } else {
            self.schema.cell_num_per_tile()
        }
    }

    /// Cells stored before the tile at a rank; tiles fill to capacity
    /// except the last.
    fn cells_before(&self, rank: u64) -> u64 {
        rank * self.schema.cell_num_per_tile()
    }

    /// Fetches a decoded tile, consulting the process-wide cache, the
    /// staged segment, and finally the disk.
    pub fn tile(&self, stream: usize, rank: u64) -> Result<Arc<Tile>> {
        if rank >= self.book_keeping.tile_num() {
            return Err(Error::NotFound(format!("tile rank {rank}")));
        }
        let key = TileKey {
            fragment_uid: self.uid,
            stream,
            rank,
        };
        if let Some(tile) = self.cache.get(&key) {
            return Ok(tile);
        }
        {
            let staged = self.staged.lock();
            if let Some(tile) = staged[stream].tiles.get(&rank) {
                return Ok(Arc::clone(tile));
            }
        }

        let loaded = self.load_segment(stream, rank)?;
        let mut requested = None;
        let mut staged = self.staged.lock();
        let slot = &mut staged[stream];
        for (r, tile) in loaded {
            let tile = Arc::new(tile);
            if r == rank {
                requested = Some(Arc::clone(&tile));
            }
            self.cache.insert(
                TileKey {
                    fragment_uid: self.uid,
                    stream,
                    rank: r,
                },
                Arc::clone(&tile),
            );
            slot.bytes += tile.payload_size();
            slot.order.push_back(r);
            slot.tiles.insert(r, tile);
        }
        // Memory pressure: the oldest staged ranks go first
        let budget = 2 * self.segment_size as usize;
        while slot.bytes > budget && slot.order.len() > 1 {
            if let Some(old) = slot.order.pop_front() {
                if let Some(tile) = slot.tiles.remove(&old) {
                    slot.bytes -= tile.payload_size();
                }
            }
        }

        requested.ok_or_else(|| {
            Error::Corrupted(format!(
                "segment load did not produce tile rank {rank}"
            ))
        })
    }

    /// Reads the smallest contiguous span of whole tiles starting at
    /// `rank` whose aggregate size reaches the segment size, and decodes
    /// every tile in it.
    fn load_segment(
        &self,
        stream: usize,
        rank: u64,
    ) -> Result<Vec<(u64, Tile)>> {
        let spec = &self.streams[stream];
        let offsets = self.book_keeping.tile_offsets(stream);
        let tile_num = offsets.len() as u64;

        let path = self.paths.attr_file(&spec.name);
        let file_size = std::fs::metadata(&path)
            .map_err(|e| Error::io(&path, e))?
            .len();

        // Choose the rank span [rank, end)
        let start_offset = offsets[rank as usize];
        let mut end = rank + 1;
        let span_end = |end: u64| -> u64 {
            if end >= tile_num {
                file_size
            } else {
                offsets[end as usize]
            }
        };
        while span_end(end) - start_offset < self.segment_size
            && end < tile_num
        {
            end += 1;
        }
        let end_offset = span_end(end);

        let bytes = self.pools.io().install(|| {
            read_span(&path, start_offset, end_offset - start_offset)
        })?;

        // Split into per-tile payloads and decode in parallel
        let ranks: Vec<u64> = (rank..end).collect();
        let tiles = self.pools.compute().install(|| {
            ranks
                .par_iter()
                .map(|r| {
                    let lo = (offsets[*r as usize] - start_offset) as usize;
                    let hi = (span_end(*r + 1) - start_offset) as usize;
                    let tile = self.decode_tile(
                        stream,
                        *r,
                        bytes[lo..hi].to_vec(),
                    )?;
                    Ok((*r, tile))
                })
                .collect::<Result<Vec<_>>>()
        })?;
        Ok(tiles)
    }

    /// Decodes one tile's on-disk bytes through the filter pipeline and
    /// reassembles the logical tile, loading the var and validity
    /// payloads when the stream has them.
    fn decode_tile(
        &self,
        stream: usize,
        rank: u64,
        data: Vec<u8>,
    ) -> Result<Tile> {
        let spec = &self.streams[stream];
        let tile_id = self.book_keeping.tile_ids()[rank as usize];
        let cell_num = self.tile_cell_num(rank);

        let validity = if spec.nullable {
            let path = self.paths.attr_validity_file(&spec.name);
            read_span(&path, self.cells_before(rank), cell_num)?
        } else {
            Vec::new()
        };

        match spec.cell_size {
            CellSize::Fixed(_) => {
                let pipeline =
                    FilterPipeline::new(&spec.filters, spec.datatype);
                let payload = pipeline.decode(data)?;
                Tile::from_payload(
                    spec.tile_type,
                    spec.datatype,
                    tile_id,
                    spec.dim_num,
                    spec.cell_size,
                    payload,
                    Vec::new(),
                    validity,
                )
            }
            CellSize::Var => {
                let offsets_pipeline = FilterPipeline::new(
                    &spec.filters,
                    tiledb_common::datatype::Datatype::UInt64,
                );
                let offsets_bytes = offsets_pipeline.decode(data)?;
                if offsets_bytes.len() % 8 != 0 {
                    return Err(Error::Corrupted(
                        "var offsets tile is not a multiple of 8 bytes"
                            .to_owned(),
                    ));
                }
                let var_offsets: Vec<u64> = offsets_bytes
                    .chunks_exact(8)
                    .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                    .collect();

                let var_offset =
                    self.book_keeping.tile_var_offsets(stream)
                        [rank as usize];
                let var_size = self.book_keeping.tile_var_sizes(stream)
                    [rank as usize];
                let var_path = self.paths.attr_var_file(&spec.name);
                let var_raw = read_span(&var_path, var_offset, var_size)?;
                let values_pipeline =
                    FilterPipeline::new(&spec.filters, spec.datatype);
                let payload = values_pipeline.decode(var_raw)?;

                Tile::from_payload(
                    spec.tile_type,
                    spec.datatype,
                    tile_id,
                    spec.dim_num,
                    spec.cell_size,
                    payload,
                    var_offsets,
                    validity,
                )
            }
        }
    }
}

impl TileSource for Arc<ReadFragment> {
    fn book_keeping(&self) -> &BookKeeping {
        &self.book_keeping
    }

    fn tile(&self, stream: usize, rank: u64) -> Result<Arc<Tile>> {
        ReadFragment::tile(self, stream, rank)
    }
}

fn read_span(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|e| Error::io(path, e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| Error::io(path, e))?;
    let mut out = vec![0u8; len as usize];
    file.read_exact(&mut out).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Corrupted(format!(
                "{} is shorter than its book-keeping claims",
                path.display()
            ))
        } else {
            Error::io(path, e)
        }
    })?;
    Ok(out)
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
    use crate::tile::TileType;

    fn manager() -> (TempDir, StorageManager) {
        let dir = TempDir::new().unwrap();
        let config = Config {
            segment_size: 1024,
            write_state_max_size: 64 * 1024,
            compute_concurrency_level: 2,
            io_concurrency_level: 2,
            ..Config::default()
        };
        let sm = StorageManager::new(dir.path(), config).unwrap();
        (dir, sm)
    }

    fn two_attr_schema() -> Arc<ArraySchema> {
        Arc::new(
            ArraySchema::new(SchemaData {
                array_name: "pairs".to_owned(),
                array_type: ArrayType::Dense,
                domain: DomainData {
                    datatype: Datatype::Int32,
                    dimension: vec![DimensionData {
                        name: "x".to_owned(),
                        domain: [0.0, 3.0],
                        extent: Some(2.0),
                    }],
                },
                capacity: None,
                cell_order: Some(CellOrder::RowMajor),
                tile_order: Some(TileOrder::RowMajor),
                consolidation_step: None,
                attributes: vec![
                    AttributeData {
                        name: "a".to_owned(),
                        datatype: Datatype::Int32,
                        cell_val_num: None,
                        nullability: None,
                        filters: vec![],
                    },
                    AttributeData {
                        name: "b".to_owned(),
                        datatype: Datatype::Int32,
                        cell_val_num: None,
                        nullability: None,
                        filters: vec![],
                    },
                ],
            })
            .unwrap(),
        )
    }

    fn tile_of(tile_id: u64, values: &[i32]) -> Tile {
        let mut tile = Tile::new(
            TileType::Attribute,
            Datatype::Int32,
            tile_id,
            0,
            CellSize::Fixed(4),
            values.len() as u64,
        );
        for v in values {
            tile.append_cell(&v.to_le_bytes(), None).unwrap();
        }
        tile
    }

    #[test]
    fn define_twice_is_already_exists() {
        let (_dir, sm) = manager();
        let schema = two_attr_schema();
        sm.define_array(&schema).unwrap();
        assert!(matches!(
            sm.define_array(&schema),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn open_undefined_is_not_found() {
        let (_dir, sm) = manager();
        assert!(matches!(
            sm.open_array("missing", &[], Mode::Read),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn append_tile_round_robin() {
        let (_dir, sm) = manager();
        let schema = two_attr_schema();
        sm.define_array(&schema).unwrap();

        let name = FragmentName::generate().to_string();
        let fd = sm.open_fragment(&schema, &name, Mode::Create).unwrap();

        sm.append_tile(&fd, 0, tile_of(0, &[1, 2])).unwrap();

        // Stream 0 may not receive a second tile of the same id
        assert!(matches!(
            sm.append_tile(&fd, 0, tile_of(0, &[9, 9])),
            Err(Error::TileOrderViolation(_))
        ));

        // Nor move to a new id before stream 1 received tile 0
        assert!(matches!(
            sm.append_tile(&fd, 0, tile_of(1, &[3, 4])),
            Err(Error::TileOrderViolation(_))
        ));

        sm.append_tile(&fd, 1, tile_of(0, &[5, 6])).unwrap();
        sm.append_tile(&fd, 0, tile_of(1, &[3, 4])).unwrap();
        sm.append_tile(&fd, 1, tile_of(1, &[7, 8])).unwrap();
        sm.close_fragment(&fd).unwrap();

        // The committed fragment reads back in rank order
        let fd = sm.open_fragment(&schema, &name, Mode::Read).unwrap();
        assert_eq!(Some(1), sm.tile_rank(&fd, 1).unwrap());
        let tile = sm.get_tile(&fd, 1, 0).unwrap();
        assert_eq!(5i32.to_le_bytes(), tile.cell(0));

        let mut ranks = Vec::new();
        let mut iter = sm.reverse_iter(&fd, 0).unwrap();
        while let Some(tile) = iter.next_tile().unwrap() {
            ranks.push(tile.tile_id());
        }
        assert_eq!(vec![1, 0], ranks);
        sm.close_fragment(&fd).unwrap();
    }

    #[test]
    fn incomplete_row_aborts_on_close() {
        let (_dir, sm) = manager();
        let schema = two_attr_schema();
        sm.define_array(&schema).unwrap();

        let name = FragmentName::generate().to_string();
        let fd = sm.open_fragment(&schema, &name, Mode::Create).unwrap();
        sm.append_tile(&fd, 0, tile_of(0, &[1, 2])).unwrap();

        assert!(matches!(
            sm.close_fragment(&fd),
            Err(Error::TileOrderViolation(_))
        ));
        // The aborted fragment never became visible
        assert!(sm
            .committed_fragment_names("pairs", None)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn closed_descriptor_is_invalid() {
        let (_dir, sm) = manager();
        let schema = two_attr_schema();
        sm.define_array(&schema).unwrap();

        let name = FragmentName::generate().to_string();
        let fd = sm.open_fragment(&schema, &name, Mode::Create).unwrap();
        sm.append_tile(&fd, 0, tile_of(0, &[1, 2])).unwrap();
        sm.append_tile(&fd, 1, tile_of(0, &[3, 4])).unwrap();
        sm.close_fragment(&fd).unwrap();

        assert!(matches!(
            sm.append_tile(&fd, 0, tile_of(1, &[5, 6])),
            Err(Error::InvalidDescriptor(_))
        ));

        let stale = sm.open_fragment(&schema, &name, Mode::Read).unwrap();
        sm.close_fragment(&stale).unwrap();
        assert!(matches!(
            sm.tile_rank(&stale, 0),
            Err(Error::InvalidDescriptor(_))
        ));
    }
}
