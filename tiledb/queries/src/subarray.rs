//! Subarray execution: copying a query range into a new array, and
//! serializing a range's cells into a caller buffer.

use std::sync::Arc;

use tracing::info;

use tiledb_common::range::SingleValueRange;

use tiledb_storage::cancel::CancelToken;
use tiledb_storage::cell::{AttrValue, CellLayout};
use tiledb_storage::error::{Error, Result};
use tiledb_storage::fragment::read_state::CellOut;
use tiledb_storage::schema::ArraySchema;
use tiledb_pod::array::SchemaData;

use crate::walk::RangeWalk;
use crate::{ArrayDescriptor, QueryProcessor};

impl QueryProcessor<'_> {
    /// Copies the cells of `range` into a newly defined array with the
    /// same dimensions and a schema projected over the chosen
    /// attributes.
    pub fn subarray(
        &self,
        array_name: &str,
        new_array_name: &str,
        range: Option<Vec<SingleValueRange>>,
        attribute_names: Option<&[String]>,
        cancel: CancelToken,
    ) -> Result<()> {
        let source_schema = self.sm.load_array_schema(array_name)?;
        let attribute_ids =
            resolve_attributes(&source_schema, attribute_names)?;

        // Destination: same dimensions, projected attributes
        let mut dest_data: SchemaData = source_schema.data().clone();
        dest_data.array_name = new_array_name.to_owned();
        dest_data.attributes = attribute_ids
            .iter()
            .map(|a| source_schema.attributes()[*a].clone())
            .collect();

        self.subarray_with_schema(
            array_name,
            dest_data,
            range,
            attribute_names,
            cancel,
        )
    }

    /// Copies the cells of `range` into a newly defined array with an
    /// explicit destination schema over the same dimensions; the retile
    /// path adjusts tiling through this.
    pub fn subarray_with_schema(
        &self,
        array_name: &str,
        dest_data: SchemaData,
        range: Option<Vec<SingleValueRange>>,
        attribute_names: Option<&[String]>,
        cancel: CancelToken,
    ) -> Result<()> {
        let ad = self.open_for_read(array_name, None)?;
        let source_schema = Arc::clone(ad.schema());
        let range =
            Self::resolve_range(&source_schema, range)?;

        let attribute_ids =
            resolve_attributes(&source_schema, attribute_names)?;
        let new_array_name = dest_data.array_name.clone();
        let dest_schema = ArraySchema::new(dest_data)?;
        self.sm.define_array(&dest_schema)?;
        let dest_layout = CellLayout::from_schema(&dest_schema);

        let (mut ws, fragment_name) =
            self.sm.cell_writer(&new_array_name, cancel)?;

        let project = |cell: &CellOut| -> Result<Vec<u8>> {
            let values: Vec<AttrValue> = attribute_ids
                .iter()
                .map(|a| AttrValue {
                    validity: cell.values[*a].validity,
                    value: &cell.values[*a].bytes,
                })
                .collect();
            let mut out = Vec::new();
            dest_layout.encode(&cell.coords, &values, &mut out)?;
            Ok(out)
        };

        let copy = (|| -> Result<()> {
            if source_schema.is_sparse() {
                let mut states = self.read_states(&ad, &range, false)?;
                for state in states.iter_mut() {
                    while let Some(cell) = state.next_cell()? {
                        ws.write_cell(&project(&cell)?)?;
                    }
                }
            } else {
                let mut states = self.read_states(&ad, &range, false)?;
                let walk = RangeWalk::new(&source_schema, &range, false)?;
                for coords in walk {
                    if let Some(cell) =
                        Self::dense_cell_at(&mut states, &coords)?
                    {
                        ws.write_cell(&project(&cell)?)?;
                    }
                }
            }
            Ok(())
        })();

        let outcome = match copy {
            Ok(()) => {
                ws.finalize()?;
                self.sm
                    .register_fragment(&new_array_name, &fragment_name)?;
                Ok(())
            }
            Err(e) => {
                ws.abort();
                Err(e)
            }
        };
        self.sm.close_array(&ad)?;
        info!(
            source = array_name,
            dest = new_array_name.as_str(),
            "subarray finished"
        );
        outcome
    }

    /// Serializes the cells of `range` into the caller's buffer in the
    /// binary cell format: coordinates, then the selected attribute
    /// values in schema order.
    ///
    /// On success `buf_size` holds the bytes written. If the result
    /// would not fit, returns [Error::BufferTooSmall] with `buf_size`
    /// set to `u64::MAX`.
    pub fn subarray_buf(
        &self,
        ad: &ArrayDescriptor,
        range: Option<Vec<SingleValueRange>>,
        attribute_names: Option<&[String]>,
        buf: &mut [u8],
        buf_size: &mut u64,
    ) -> Result<()> {
        let schema = Arc::clone(ad.schema());
        let range = Self::resolve_range(&schema, range)?;
        let attribute_ids =
            resolve_attributes(&schema, attribute_names)?;

        let mut offset = 0usize;
        let mut overflow = false;
        let mut push = |cell: CellOut| -> Result<()> {
            let record =
                crate::export::encode_cell_record(&cell, &attribute_ids, &schema);
            if offset + record.len() > buf.len() {
                overflow = true;
                return Err(Error::BufferTooSmall {
                    required: (offset + record.len()) as u64,
                    provided: buf.len() as u64,
                });
            }
            buf[offset..offset + record.len()]
                .copy_from_slice(&record);
            offset += record.len();
            Ok(())
        };

        let outcome = if schema.is_sparse() {
            self.for_each_sparse_cell(ad, &range, false, &mut push)
        } else {
            (|| {
                let mut states = self.read_states(ad, &range, false)?;
                let walk = RangeWalk::new(&schema, &range, false)?;
                for coords in walk {
                    if let Some(cell) =
                        Self::dense_cell_at(&mut states, &coords)?
                    {
                        push(cell)?;
                    }
                }
                Ok(())
            })()
        };

        match outcome {
            Ok(()) => {
                *buf_size = offset as u64;
                Ok(())
            }
            Err(e) => {
                if overflow {
                    *buf_size = u64::MAX;
                }
                Err(e)
            }
        }
    }
}

fn resolve_attributes(
    schema: &ArraySchema,
    attribute_names: Option<&[String]>,
) -> Result<Vec<usize>> {
    match attribute_names {
        None => Ok((0..schema.attribute_num()).collect()),
        Some(names) => names
            .iter()
            .map(|name| {
                schema.attribute_id(name).ok_or_else(|| {
                    Error::NotFound(format!("attribute '{name}'"))
                })
            })
            .collect(),
    }
}
