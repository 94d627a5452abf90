//! CSV import: parses records of `coords..., attributes...` and drives
//! an unordered write into a new fragment.

use std::path::Path;

use tracing::info;

use tiledb_common::datatype::{Datatype, PhysicalType};
use tiledb_common::physical_type_go;

use tiledb_storage::cancel::CancelToken;
use tiledb_storage::cell::{AttrValue, CellLayout};
use tiledb_storage::error::{Error, Result};
use tiledb_storage::schema::ArraySchema;

use crate::csv::{CsvOptions, CsvReader};
use crate::QueryProcessor;

/// Field value used to write a null into a nullable attribute.
const CSV_NULL: &str = "$";

impl QueryProcessor<'_> {
    /// Loads a CSV file into a new fragment of the array. Returns the
    /// number of cells written.
    pub fn load_csv(
        &self,
        array_name: &str,
        path: &Path,
        options: CsvOptions,
        cancel: CancelToken,
    ) -> Result<u64> {
        let schema = self.sm.load_array_schema(array_name)?;
        let layout = CellLayout::from_schema(&schema);
        let mut reader = CsvReader::open(path, options)?;

        let (mut ws, fragment_name) =
            self.sm.cell_writer(array_name, cancel)?;

        let outcome = (|| -> Result<u64> {
            let mut cells = 0u64;
            while let Some(fields) = reader.next_line()? {
                let cell =
                    parse_cell(&schema, &layout, &fields, reader.lineno())?;
                ws.write_cell(&cell)?;
                cells += 1;
            }
            Ok(cells)
        })();

        match outcome {
            Ok(cells) => {
                ws.finalize()?;
                self.sm.register_fragment(array_name, &fragment_name)?;
                info!(
                    array = array_name,
                    file = %path.display(),
                    cells,
                    "load finished"
                );
                Ok(cells)
            }
            Err(e) => {
                ws.abort();
                Err(e)
            }
        }
    }
}

fn parse_cell(
    schema: &ArraySchema,
    layout: &CellLayout,
    fields: &[String],
    lineno: u64,
) -> Result<Vec<u8>> {
    let expected = schema.dim_num() + schema.attribute_num();
    if fields.len() != expected {
        return Err(Error::SchemaInvalid(format!(
            "csv line {lineno}: expected {expected} fields, found {}",
            fields.len()
        )));
    }

    let mut coords = Vec::with_capacity(schema.coords_size());
    for (i, field) in fields.iter().take(schema.dim_num()).enumerate() {
        parse_into(schema.coords_type(), field, &mut coords).map_err(
            |_| {
                Error::SchemaInvalid(format!(
                    "csv line {lineno}: bad coordinate '{field}' for \
                     dimension {i}"
                ))
            },
        )?;
    }

    // Owned value bytes first; AttrValue borrows them afterwards
    let mut owned: Vec<(Option<bool>, Vec<u8>)> =
        Vec::with_capacity(schema.attribute_num());
    for (a, field) in
        fields.iter().skip(schema.dim_num()).enumerate()
    {
        let attr = &schema.attributes()[a];
        if attr.is_nullable() && field.as_str() == CSV_NULL {
            let mut bytes = Vec::new();
            if !schema.compute_cell_size(a).is_var() {
                bytes = vec![0u8; attr.datatype.size()];
            }
            owned.push((Some(false), bytes));
            continue;
        }
        let validity = attr.is_nullable().then_some(true);
        let mut bytes = Vec::new();
        match attr.datatype {
            Datatype::StringUtf8 => {
                bytes.extend_from_slice(field.as_bytes())
            }
            Datatype::Char => {
                let c = field.chars().next().ok_or_else(|| {
                    Error::SchemaInvalid(format!(
                        "csv line {lineno}: empty char field"
                    ))
                })?;
                bytes.push(c as u8);
            }
            datatype => {
                parse_into(datatype, field, &mut bytes).map_err(|_| {
                    Error::SchemaInvalid(format!(
                        "csv line {lineno}: bad value '{field}' for \
                         attribute '{}'",
                        attr.name
                    ))
                })?;
            }
        }
        owned.push((validity, bytes));
    }

    let values: Vec<AttrValue> = owned
        .iter()
        .map(|(validity, bytes)| AttrValue {
            validity: *validity,
            value: bytes,
        })
        .collect();

    let mut out = Vec::new();
    layout.encode(&coords, &values, &mut out)?;
    Ok(out)
}

fn parse_into(
    datatype: Datatype,
    field: &str,
    out: &mut Vec<u8>,
) -> std::result::Result<(), ()> {
    physical_type_go!(datatype, DT, {
        let v = field
            .trim()
            .parse::<f64>()
            .map_err(|_| ())?;
        let typed = DT::from_f64(v);
        // Reject lossy integer parses such as "1.5" into an i32
        if typed.to_f64() != v && !datatype.is_real_type() {
            return Err(());
        }
        let start = out.len();
        out.resize(start + DT::BYTES, 0);
        typed.write_le(&mut out[start..]);
        Ok(())
    })
}
