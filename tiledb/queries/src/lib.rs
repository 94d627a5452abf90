//! Query execution over the storage core: range reads, ordered and
//! unordered writes, array-to-array subarray copies, and CSV or binary
//! import and export.

pub mod csv;
pub mod export;
pub mod load;
pub mod subarray;
mod walk;

use std::sync::Arc;

use tiledb_common::array::Mode;
use tiledb_common::datatype::PhysicalType;
use tiledb_common::physical_type_go;
use tiledb_common::range::SingleValueRange;

use tiledb_storage::cancel::CancelToken;
use tiledb_storage::error::{Error, Result};
use tiledb_storage::fragment::read_state::{CellOut, ReadState};
use tiledb_storage::schema::ArraySchema;
use tiledb_storage::sm::{ArrayDescriptor, ReadFragment, StorageManager};

pub use export::{ExportFormat, ExportOptions};
pub use walk::RangeWalk;

/// Orchestrates reads and writes against a storage manager.
pub struct QueryProcessor<'a> {
    sm: &'a StorageManager,
}

impl<'a> QueryProcessor<'a> {
    pub fn new(sm: &'a StorageManager) -> Self {
        QueryProcessor { sm }
    }

    pub fn storage(&self) -> &StorageManager {
        self.sm
    }

    /// Opens an array over every committed fragment visible at the
    /// snapshot, in fragment timestamp order.
    pub fn open_for_read(
        &self,
        array_name: &str,
        snapshot: Option<u64>,
    ) -> Result<ArrayDescriptor> {
        let names =
            self.sm.committed_fragment_names(array_name, snapshot)?;
        self.sm.open_array(array_name, &names, Mode::Read)
    }

    /// Writes a batch of cells into a new fragment of the array.
    ///
    /// Unordered writes run the external sort; ordered writes expect
    /// cells already in the global cell order (dense writes must cover
    /// whole tiles). Returns the committed fragment's name.
    pub fn write_cells<I>(
        &self,
        array_name: &str,
        cells: I,
        ordered: bool,
        cancel: CancelToken,
    ) -> Result<String>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let (mut ws, fragment_name) =
            self.sm.cell_writer(array_name, cancel)?;
        let outcome = (|| -> Result<()> {
            for cell in cells {
                if ordered {
                    ws.write_cell_sorted(&cell)?;
                } else {
                    ws.write_cell(&cell)?;
                }
            }
            Ok(())
        })();
        match outcome {
            Ok(()) => {
                ws.finalize()?;
                self.sm.register_fragment(array_name, &fragment_name)?;
                Ok(fragment_name)
            }
            Err(e) => {
                ws.abort();
                Err(e)
            }
        }
    }

    /// The query range clipped to the array domain, defaulting to the
    /// full domain.
    pub fn resolve_range(
        schema: &ArraySchema,
        range: Option<Vec<SingleValueRange>>,
    ) -> Result<Vec<SingleValueRange>> {
        let domain = schema.domain_ranges();
        match range {
            None => Ok(domain),
            Some(range) => {
                if range.len() != schema.dim_num() {
                    return Err(Error::SchemaInvalid(format!(
                        "query range has {} dimensions, schema has {}",
                        range.len(),
                        schema.dim_num()
                    )));
                }
                range
                    .iter()
                    .zip(domain.iter())
                    .map(|(r, d)| {
                        r.intersection(d).ok_or_else(|| {
                            Error::DomainOutOfRange {
                                dimension: 0,
                                value: f64::NAN,
                            }
                        })
                    })
                    .collect()
            }
        }
    }

    /// Per-fragment read states over the open array, in fragment
    /// timestamp order.
    pub fn read_states(
        &self,
        ad: &ArrayDescriptor,
        range: &[SingleValueRange],
        reverse: bool,
    ) -> Result<Vec<ReadState<Arc<ReadFragment>>>> {
        ad.fragments()
            .iter()
            .map(|fd| {
                self.sm.read_state(fd, range.to_vec(), reverse)
            })
            .collect()
    }

    /// Streams every qualifying cell of a sparse array, fragment by
    /// fragment in timestamp order (reverse mode walks fragments and
    /// cells backwards).
    pub fn for_each_sparse_cell<F>(
        &self,
        ad: &ArrayDescriptor,
        range: &[SingleValueRange],
        reverse: bool,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(CellOut) -> Result<()>,
    {
        let mut states = self.read_states(ad, range, reverse)?;
        if reverse {
            states.reverse();
        }
        for state in states.iter_mut() {
            while let Some(cell) = state.next_cell()? {
                f(cell)?;
            }
        }
        Ok(())
    }

    /// The cell of a dense array at the given coordinates, consulting
    /// fragments newest-first so later writes overwrite earlier ones.
    pub fn dense_cell_at(
        states: &mut [ReadState<Arc<ReadFragment>>],
        coords: &[u8],
    ) -> Result<Option<CellOut>> {
        for state in states.iter_mut().rev() {
            if let Some(cell) = state.cell_at(coords)? {
                return Ok(Some(cell));
            }
        }
        Ok(None)
    }

    /// Reads one var-sized attribute over a range into the classic
    /// `(offset table, value bytes)` pair; the offset list carries a
    /// trailing total-length entry.
    pub fn read_var_attribute(
        &self,
        ad: &ArrayDescriptor,
        attribute_name: &str,
        range: Option<Vec<SingleValueRange>>,
    ) -> Result<(Vec<u64>, Vec<u8>)> {
        let schema = Arc::clone(ad.schema());
        let attribute_id =
            schema.attribute_id(attribute_name).ok_or_else(|| {
                Error::NotFound(format!("attribute '{attribute_name}'"))
            })?;
        if !schema.compute_cell_size(attribute_id).is_var() {
            return Err(Error::SchemaInvalid(format!(
                "attribute '{attribute_name}' is fixed-size"
            )));
        }
        let range = Self::resolve_range(&schema, range)?;

        let mut offsets = Vec::new();
        let mut bytes = Vec::new();
        let mut push = |cell: CellOut| -> Result<()> {
            offsets.push(bytes.len() as u64);
            bytes.extend_from_slice(&cell.values[attribute_id].bytes);
            Ok(())
        };

        if schema.is_sparse() {
            self.for_each_sparse_cell(ad, &range, false, push)?;
        } else {
            let mut states = self.read_states(ad, &range, false)?;
            let walk = RangeWalk::new(&schema, &range, false)?;
            for coords in walk {
                if let Some(cell) =
                    Self::dense_cell_at(&mut states, &coords)?
                {
                    push(cell)?;
                }
            }
        }
        offsets.push(bytes.len() as u64);
        Ok((offsets, bytes))
    }

    /// The null sentinel emitted for missing cells in dense exports.
    pub fn null_sentinel(
        datatype: tiledb_common::datatype::Datatype,
    ) -> Vec<u8> {
        use tiledb_common::datatype::Datatype;
        if datatype == Datatype::Char {
            return vec![b'$'];
        }
        physical_type_go!(datatype, DT, {
            let max = match datatype {
                Datatype::Float32 => DT::from_f64(f32::MAX as f64),
                Datatype::Float64 => DT::from_f64(f64::MAX),
                _ => {
                    // integer types saturate at their maximum
                    let mut raw = vec![0xffu8; DT::BYTES];
                    if matches!(
                        datatype,
                        Datatype::Int8
                            | Datatype::Int16
                            | Datatype::Int32
                            | Datatype::Int64
                    ) {
                        let last = raw.len() - 1;
                        raw[last] = 0x7f;
                    }
                    return raw;
                }
            };
            let mut out = vec![0u8; DT::BYTES];
            max.write_le(&mut out);
            out
        })
    }
}

#[cfg(test)]
mod tests {
    use tiledb_common::datatype::Datatype;

    use super::*;

    #[test]
    fn null_sentinels() {
        assert_eq!(vec![b'$'], QueryProcessor::null_sentinel(Datatype::Char));
        assert_eq!(
            i32::MAX.to_le_bytes().to_vec(),
            QueryProcessor::null_sentinel(Datatype::Int32)
        );
        assert_eq!(
            i64::MAX.to_le_bytes().to_vec(),
            QueryProcessor::null_sentinel(Datatype::Int64)
        );
        assert_eq!(
            u64::MAX.to_le_bytes().to_vec(),
            QueryProcessor::null_sentinel(Datatype::UInt64)
        );
        assert_eq!(
            f64::MAX.to_le_bytes().to_vec(),
            QueryProcessor::null_sentinel(Datatype::Float64)
        );
    }
}
