//! Array export: CSV or binary, dense or sparse form, forward or
//! reverse, over an optional query range and field selection.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use tiledb_common::datatype::{Datatype, PhysicalType};
use tiledb_common::physical_type_go;
use tiledb_common::range::SingleValueRange;

use tiledb_storage::error::{Error, Result};
use tiledb_storage::fragment::read_state::CellOut;
use tiledb_storage::schema::ArraySchema;

use crate::csv::{CsvOptions, CsvWriter};
use crate::walk::RangeWalk;
use crate::QueryProcessor;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ExportFormat {
    #[default]
    Csv,
    /// Concatenated records in the binary cell format.
    Binary,
}

#[derive(Clone, Debug, Default)]
pub struct ExportOptions {
    pub format: ExportFormat,
    /// Dense form emits a value for every cell in the range, filling
    /// missing cells with the type null sentinels.
    pub dense: bool,
    pub reverse: bool,
    /// Dimensions to emit, in order; all when `None`. CSV only.
    pub dim_ids: Option<Vec<usize>>,
    /// Attributes to emit, in order; all when `None`.
    pub attribute_ids: Option<Vec<usize>>,
    pub range: Option<Vec<SingleValueRange>>,
    /// Gzip-compress the output file.
    pub gzip: bool,
    pub csv: CsvOptions,
}

impl QueryProcessor<'_> {
    /// Exports an array to a file.
    pub fn array_export(
        &self,
        array_name: &str,
        file: &Path,
        options: &ExportOptions,
    ) -> Result<()> {
        let ad = self.open_for_read(array_name, None)?;
        let schema = Arc::clone(ad.schema());
        let range =
            Self::resolve_range(&schema, options.range.clone())?;

        let attribute_ids: Vec<usize> = match options.attribute_ids.clone()
        {
            Some(ids) => ids,
            None => (0..schema.attribute_num()).collect(),
        };
        for id in attribute_ids.iter() {
            if *id >= schema.attribute_num() {
                return Err(Error::NotFound(format!("attribute {id}")));
            }
        }
        let dim_ids: Vec<usize> = match options.dim_ids.clone() {
            Some(ids) => ids,
            None => (0..schema.dim_num()).collect(),
        };
        for id in dim_ids.iter() {
            if *id >= schema.dim_num() {
                return Err(Error::NotFound(format!("dimension {id}")));
            }
        }

        let raw =
            std::fs::File::create(file).map_err(|e| Error::io(file, e))?;
        let sink: Box<dyn Write> = if options.gzip {
            Box::new(flate2::write::GzEncoder::new(
                raw,
                flate2::Compression::default(),
            ))
        } else {
            Box::new(raw)
        };

        let outcome = match options.format {
            ExportFormat::Csv => self.export_csv(
                &ad,
                &schema,
                &range,
                &dim_ids,
                &attribute_ids,
                options,
                sink,
            ),
            ExportFormat::Binary => self.export_binary(
                &ad,
                &schema,
                &range,
                &attribute_ids,
                options,
                sink,
            ),
        };
        self.sm.close_array(&ad)?;
        info!(array = array_name, file = %file.display(), "export finished");
        outcome
    }

    fn export_csv(
        &self,
        ad: &crate::ArrayDescriptor,
        schema: &ArraySchema,
        range: &[SingleValueRange],
        dim_ids: &[usize],
        attribute_ids: &[usize],
        options: &ExportOptions,
        sink: Box<dyn Write>,
    ) -> Result<()> {
        let mut writer = CsvWriter::new(sink, options.csv);

        let emit = |writer: &mut CsvWriter<Box<dyn Write>>,
                    cell: &CellOut|
         -> Result<()> {
            let mut fields = Vec::new();
            for d in dim_ids.iter() {
                fields.push(format_coord(schema, &cell.coords, *d, writer));
            }
            for a in attribute_ids.iter() {
                let value = &cell.values[*a];
                if value.validity == Some(false) {
                    fields.push("$".to_owned());
                } else {
                    fields.push(format_value(
                        schema.attributes()[*a].datatype,
                        &value.bytes,
                        writer,
                    ));
                }
            }
            writer.write_record(&fields)
        };

        if options.dense {
            let mut states = self.read_states(ad, range, false)?;
            let walk = RangeWalk::new(schema, range, options.reverse)?;
            for coords in walk {
                match Self::dense_cell_at(&mut states, &coords)? {
                    Some(cell) => emit(&mut writer, &cell)?,
                    None => {
                        let mut fields = Vec::new();
                        for d in dim_ids.iter() {
                            fields.push(format_coord(
                                schema, &coords, *d, &writer,
                            ));
                        }
                        for a in attribute_ids.iter() {
                            let datatype =
                                schema.attributes()[*a].datatype;
                            let sentinel =
                                Self::null_sentinel(datatype);
                            fields.push(format_value(
                                datatype, &sentinel, &writer,
                            ));
                        }
                        writer.write_record(&fields)?;
                    }
                }
            }
        } else if schema.is_sparse() {
            self.for_each_sparse_cell(
                ad,
                range,
                options.reverse,
                |cell| emit(&mut writer, &cell),
            )?;
        } else {
            // Sparse-form export of a dense array: emit only the cells
            // the fragments actually hold
            let mut states = self.read_states(ad, range, false)?;
            let walk = RangeWalk::new(schema, range, options.reverse)?;
            for coords in walk {
                if let Some(cell) =
                    Self::dense_cell_at(&mut states, &coords)?
                {
                    emit(&mut writer, &cell)?;
                }
            }
        }

        writer.finish()
    }

    fn export_binary(
        &self,
        ad: &crate::ArrayDescriptor,
        schema: &ArraySchema,
        range: &[SingleValueRange],
        attribute_ids: &[usize],
        options: &ExportOptions,
        mut sink: Box<dyn Write>,
    ) -> Result<()> {
        let mut emit = |cell: &CellOut| -> Result<()> {
            sink.write_all(&encode_cell_record(cell, attribute_ids, schema))
                .map_err(|e| Error::io("<export>", e))
        };

        if schema.is_sparse() {
            self.for_each_sparse_cell(
                ad,
                range,
                options.reverse,
                |cell| emit(&cell),
            )?;
        } else {
            let mut states = self.read_states(ad, range, false)?;
            let walk = RangeWalk::new(schema, range, options.reverse)?;
            for coords in walk {
                match Self::dense_cell_at(&mut states, &coords)? {
                    Some(cell) => emit(&cell)?,
                    None if options.dense => {
                        // A missing cell exports the null sentinel of
                        // every attribute
                        let sentinel = CellOut {
                            coords: coords.clone(),
                            values: schema
                                .attributes()
                                .iter()
                                .map(|a| {
                                    tiledb_storage::fragment::read_state::CellValue {
                                        validity: a
                                            .is_nullable()
                                            .then_some(false),
                                        bytes: Self::null_sentinel(
                                            a.datatype,
                                        ),
                                    }
                                })
                                .collect(),
                        };
                        emit(&sentinel)?;
                    }
                    None => {}
                }
            }
        }
        sink.flush().map_err(|e| Error::io("<export>", e))
    }
}

/// Encodes coordinates and the selected attribute values in selection
/// order: fixed values raw, var values with a `u32` count prefix.
pub(crate) fn encode_cell_record(
    cell: &CellOut,
    attribute_ids: &[usize],
    schema: &ArraySchema,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(cell.coords.len() + 16);
    out.extend_from_slice(&cell.coords);
    for a in attribute_ids.iter() {
        let value = &cell.values[*a];
        let attr = &schema.attributes()[*a];
        if attr.is_nullable() {
            out.push(value.validity.unwrap_or(true) as u8);
        }
        if schema.compute_cell_size(*a).is_var() {
            let count =
                (value.bytes.len() / attr.datatype.size()) as u32;
            out.extend_from_slice(&count.to_le_bytes());
        }
        out.extend_from_slice(&value.bytes);
    }
    out
}

fn format_coord<W: Write>(
    schema: &ArraySchema,
    coords: &[u8],
    dim: usize,
    writer: &CsvWriter<W>,
) -> String {
    physical_type_go!(schema.coords_type(), DT, {
        let size = std::mem::size_of::<DT>();
        let v = DT::read_le(&coords[dim * size..(dim + 1) * size]);
        if schema.coords_type().is_real_type() {
            writer.format_float(v.to_f64())
        } else {
            format!("{v:?}")
        }
    })
}

fn format_value<W: Write>(
    datatype: Datatype,
    bytes: &[u8],
    writer: &CsvWriter<W>,
) -> String {
    match datatype {
        Datatype::StringUtf8 => {
            String::from_utf8_lossy(bytes).into_owned()
        }
        Datatype::Char => {
            let c = bytes.first().map(|b| *b as char).unwrap_or('$');
            c.to_string()
        }
        _ => physical_type_go!(datatype, DT, {
            let v = DT::read_le(&bytes[..std::mem::size_of::<DT>()]);
            if datatype.is_real_type() {
                writer.format_float(v.to_f64())
            } else {
                format!("{v:?}")
            }
        }),
    }
}
