//! Fragments: immutable, append-only write units of an array.
//!
//! A fragment is a directory named
//! `__<timestamp_lo>_<timestamp_hi>_<uuid>_<format_version>` holding one
//! data file per attribute, the serialized book-keeping, and an empty
//! commit marker whose presence makes the fragment visible to readers.

pub mod book_keeping;
pub mod read_state;
pub mod write_state;

use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use tiledb_common::datatype::Datatype;
use tiledb_common::filter::FilterData;

use crate::error::{Error, Result};
use crate::schema::{ArraySchema, CellSize};
use crate::tile::TileType;

pub use book_keeping::BookKeeping;

/// The book-keeping layout this engine writes and reads. Fragments of
/// any other version are rejected as corrupted.
pub const FORMAT_VERSION: u32 = 12;

pub const ARRAY_SCHEMA_FILENAME: &str = "__array_schema";
pub const FRAGMENTS_BKP_FILENAME: &str = "__fragments.bkp";
pub const FRAGMENT_METADATA_FILENAME: &str = "__fragment_metadata";
pub const COMMIT_FILENAME: &str = "__commit";
pub const TEMP_DIRNAME: &str = "__temp";
pub const COORDS_NAME: &str = "__coords";
pub const TILE_DATA_SUFFIX: &str = ".tdb";
pub const TILE_VAR_DATA_SUFFIX: &str = "_var.tdb";
pub const TILE_VALIDITY_SUFFIX: &str = "_validity.tdb";

/// Parsed form of a fragment directory name.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct FragmentName {
    pub timestamp_lo: u64,
    pub timestamp_hi: u64,
    pub uuid: Uuid,
    pub version: u32,
}

impl FragmentName {
    /// A fresh name stamped with the current wall-clock time in
    /// milliseconds. Timestamps are strictly increasing within the
    /// process so that concurrent writes order deterministically.
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static LAST: AtomicU64 = AtomicU64::new(0);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let prev = LAST
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap();
        let stamp = now.max(prev + 1);

        FragmentName {
            timestamp_lo: stamp,
            timestamp_hi: stamp,
            uuid: Uuid::new_v4(),
            version: FORMAT_VERSION,
        }
    }
}

impl Display for FragmentName {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(
            f,
            "__{}_{}_{}_{}",
            self.timestamp_lo,
            self.timestamp_hi,
            self.uuid.simple(),
            self.version
        )
    }
}

impl FromStr for FragmentName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || {
            Error::Corrupted(format!("invalid fragment name '{s}'"))
        };
        let rest = s.strip_prefix("__").ok_or_else(bad)?;
        let parts = rest.split('_').collect::<Vec<_>>();
        if parts.len() != 4 {
            return Err(bad());
        }
        let timestamp_lo = parts[0].parse::<u64>().map_err(|_| bad())?;
        let timestamp_hi = parts[1].parse::<u64>().map_err(|_| bad())?;
        let uuid = Uuid::parse_str(parts[2]).map_err(|_| bad())?;
        let version = parts[3].parse::<u32>().map_err(|_| bad())?;
        Ok(FragmentName {
            timestamp_lo,
            timestamp_hi,
            uuid,
            version,
        })
    }
}

/// Filesystem layout of one fragment directory.
#[derive(Clone, Debug)]
pub struct FragmentPaths {
    dir: PathBuf,
}

impl FragmentPaths {
    pub fn new(array_dir: &Path, fragment_name: &str) -> Self {
        FragmentPaths {
            dir: array_dir.join(fragment_name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn metadata(&self) -> PathBuf {
        self.dir.join(FRAGMENT_METADATA_FILENAME)
    }

    pub fn commit_marker(&self) -> PathBuf {
        self.dir.join(COMMIT_FILENAME)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.dir.join(TEMP_DIRNAME)
    }

    pub fn attr_file(&self, attr_name: &str) -> PathBuf {
        self.dir.join(format!("{attr_name}{TILE_DATA_SUFFIX}"))
    }

    pub fn attr_var_file(&self, attr_name: &str) -> PathBuf {
        self.dir.join(format!("{attr_name}{TILE_VAR_DATA_SUFFIX}"))
    }

    pub fn attr_validity_file(&self, attr_name: &str) -> PathBuf {
        self.dir.join(format!("{attr_name}{TILE_VALIDITY_SUFFIX}"))
    }

    pub fn is_committed(&self) -> bool {
        self.commit_marker().is_file()
    }

    /// Writes the empty commit marker; the last step of every write.
    pub fn write_commit_marker(&self) -> Result<()> {
        let path = self.commit_marker();
        std::fs::write(&path, b"").map_err(|e| Error::io(path, e))
    }

    /// Best-effort removal of the whole fragment directory.
    pub fn remove(&self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

/// Description of one data stream of a fragment: one per attribute, plus
/// a final coordinate stream for sparse fragments.
#[derive(Clone, Debug)]
pub struct StreamSpec {
    pub name: String,
    pub datatype: Datatype,
    pub tile_type: TileType,
    pub cell_size: CellSize,
    pub nullable: bool,
    pub dim_num: usize,
    pub filters: Vec<FilterData>,
}

impl StreamSpec {
    pub fn is_var(&self) -> bool {
        self.cell_size.is_var()
    }
}

/// The data streams a fragment of this schema carries, in book-keeping
/// order: attributes first, then the coordinates for sparse fragments.
pub fn fragment_streams(schema: &ArraySchema) -> Vec<StreamSpec> {
    let mut streams = schema
        .attributes()
        .iter()
        .enumerate()
        .map(|(i, a)| StreamSpec {
            name: a.name.clone(),
            datatype: a.datatype,
            tile_type: TileType::Attribute,
            cell_size: schema.compute_cell_size(i),
            nullable: a.is_nullable(),
            dim_num: 0,
            filters: a.filters.clone(),
        })
        .collect::<Vec<_>>();
    if schema.is_sparse() {
        streams.push(StreamSpec {
            name: COORDS_NAME.to_owned(),
            datatype: schema.coords_type(),
            tile_type: TileType::Coordinate,
            cell_size: schema.compute_cell_size(schema.attribute_num()),
            nullable: false,
            dim_num: schema.dim_num(),
            filters: Vec::new(),
        });
    }
    streams
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_roundtrip() {
        let name = FragmentName::generate();
        let parsed = name.to_string().parse::<FragmentName>().unwrap();
        assert_eq!(name, parsed);
    }

    #[test]
    fn name_rejects_garbage() {
        for bad in [
            "",
            "fragment",
            "__1_2_3",
            "__1_2_nonhex_12",
            "__x_2_00000000000000000000000000000000_12",
        ] {
            assert!(bad.parse::<FragmentName>().is_err(), "{bad}");
        }
    }

    #[test]
    fn generated_name_carries_format_version() {
        let name = FragmentName::generate();
        assert_eq!(FORMAT_VERSION, name.version);
        assert!(name.timestamp_lo <= name.timestamp_hi);
    }
}
