//! Command-line driver for the storage core.
//!
//! Exit codes: 0 on success, 1 on user error, 2 on engine error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tiledb_common::array::{ArrayType, CellOrder, TileOrder};
use tiledb_common::datatype::Datatype;
use tiledb_common::filter::FilterData;
use tiledb_common::range::SingleValueRange;
use tiledb_pod::array::{
    AttributeData, DimensionData, DomainData, SchemaData,
};
use tiledb_queries::csv::CsvOptions;
use tiledb_queries::{ExportFormat, ExportOptions, QueryProcessor};
use tiledb_storage::{
    ArraySchema, CancelToken, Config, Error, StorageManager,
};

#[derive(Parser)]
#[command(name = "tiledb", about = "TileDB array storage engine")]
struct Cli {
    /// Workspace directory; defaults to $TILEDB_WORKSPACE.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Define a new array from a schema description.
    DefineArray(DefineArrayArgs),
    /// Load a CSV file into a new fragment of an array.
    Load(LoadArgs),
    /// Export an array to a CSV or binary file.
    Export(ExportArgs),
    /// Copy a query range into a new array.
    Subarray(SubarrayArgs),
    /// Delete every fragment of an array, keeping its schema.
    ClearArray(ArrayArg),
    /// Delete an array entirely.
    DeleteArray(ArrayArg),
    /// Write an additional fragment of cells from a CSV file.
    Update(LoadArgs),
    /// Rewrite an array with new tile extents, capacity, or orders.
    Retile(RetileArgs),
}

#[derive(Args)]
struct ArrayArg {
    /// Array name.
    name: String,
}

#[derive(Args)]
struct DefineArrayArgs {
    /// Array name.
    name: String,
    /// dense or sparse.
    #[arg(long, default_value = "dense")]
    array_type: String,
    /// Comma-separated dimension names, e.g. `x,y`.
    #[arg(long)]
    dims: String,
    /// Coordinate datatype shared by all dimensions.
    #[arg(long, default_value = "int64")]
    coords_type: String,
    /// Per-dimension inclusive domains, e.g. `1:4,1:4`.
    #[arg(long)]
    domain: String,
    /// Per-dimension tile extents, e.g. `2,2`; omit for irregular tiles.
    #[arg(long)]
    extents: Option<String>,
    /// Comma-separated attribute specs `name:type[:nullable]`.
    #[arg(long)]
    attrs: String,
    /// Cells per tile for irregular tiles.
    #[arg(long)]
    capacity: Option<u64>,
    /// row-major, column-major, or hilbert.
    #[arg(long, default_value = "row-major")]
    cell_order: String,
    /// row-major, column-major, or hilbert (regular tiles only).
    #[arg(long)]
    tile_order: Option<String>,
    /// Compression applied to every attribute:
    /// none, gzip, zstd, lz4, rle, bzip2, or double-delta.
    #[arg(long, default_value = "none")]
    compression: String,
}

#[derive(Args)]
struct LoadArgs {
    /// Array name.
    name: String,
    /// CSV file of `coords..., attributes...` records.
    file: PathBuf,
    #[arg(long, default_value_t = ',')]
    delimiter: char,
}

#[derive(Args)]
struct ExportArgs {
    /// Array name.
    name: String,
    /// Output file.
    file: PathBuf,
    /// csv or binary.
    #[arg(long, default_value = "csv")]
    format: String,
    /// Emit a value for every cell in the range.
    #[arg(long)]
    dense: bool,
    /// Emit cells in reverse order.
    #[arg(long)]
    reverse: bool,
    /// Query range, e.g. `2:3,2:3`; defaults to the full domain.
    #[arg(long)]
    range: Option<String>,
    /// Comma-separated attribute names to export.
    #[arg(long)]
    attributes: Option<String>,
    /// Gzip-compress the output.
    #[arg(long)]
    gzip: bool,
    #[arg(long, default_value_t = ',')]
    delimiter: char,
    /// Fractional digits for float output.
    #[arg(long, default_value_t = 6)]
    precision: usize,
}

#[derive(Args)]
struct SubarrayArgs {
    /// Source array name.
    name: String,
    /// Destination array name.
    dest: String,
    /// Query range, e.g. `2:3,2:3`; defaults to the full domain.
    #[arg(long)]
    range: Option<String>,
    /// Comma-separated attribute names to keep.
    #[arg(long)]
    attributes: Option<String>,
}

#[derive(Args)]
struct RetileArgs {
    /// Array name.
    name: String,
    /// New per-dimension tile extents, e.g. `2,2`.
    #[arg(long)]
    extents: Option<String>,
    /// New cells-per-tile capacity.
    #[arg(long)]
    capacity: Option<u64>,
    #[arg(long)]
    cell_order: Option<String>,
    #[arg(long)]
    tile_order: Option<String>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code(&e))
        }
    }
}

/// User mistakes exit 1; engine failures exit 2.
fn exit_code(e: &Error) -> u8 {
    match e {
        Error::SchemaInvalid(_)
        | Error::DomainOutOfRange { .. }
        | Error::NotFound(_)
        | Error::AlreadyExists(_)
        | Error::BufferTooSmall { .. }
        | Error::Unsupported(_) => 1,
        _ => 2,
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    let workspace = Config::resolve_workspace(cli.workspace.as_deref())?;
    let config = Config::from_env()?;
    let sm = StorageManager::new(workspace, config)?;
    let qp = QueryProcessor::new(&sm);

    match cli.command {
        Command::DefineArray(args) => define_array(&sm, args),
        Command::Load(args) | Command::Update(args) => {
            let options = CsvOptions {
                delimiter: args.delimiter,
                ..CsvOptions::default()
            };
            let cells = qp.load_csv(
                &args.name,
                &args.file,
                options,
                CancelToken::new(),
            )?;
            println!("loaded {cells} cells into '{}'", args.name);
            Ok(())
        }
        Command::Export(args) => export(&sm, &qp, args),
        Command::Subarray(args) => {
            let schema = sm.load_array_schema(&args.name)?;
            let range = args
                .range
                .map(|r| parse_range(&schema, &r))
                .transpose()?;
            let attributes = args
                .attributes
                .map(|a| split_csv(&a));
            qp.subarray(
                &args.name,
                &args.dest,
                range,
                attributes.as_deref(),
                CancelToken::new(),
            )
        }
        Command::ClearArray(args) => sm.clear_array(&args.name),
        Command::DeleteArray(args) => sm.delete_array(&args.name),
        Command::Retile(args) => retile(&sm, &qp, args),
    }
}

fn define_array(sm: &StorageManager, args: DefineArrayArgs) -> Result<(), Error> {
    let user = |msg: String| Error::SchemaInvalid(msg);

    let array_type = match args.array_type.as_str() {
        "dense" => ArrayType::Dense,
        "sparse" => ArrayType::Sparse,
        other => {
            return Err(user(format!("unknown array type '{other}'")))
        }
    };
    let coords_type = Datatype::from_str(&args.coords_type)
        .map_err(|s| user(format!("unknown coordinate type '{s}'")))?;

    let dim_names = split_csv(&args.dims);
    let domains = args
        .domain
        .split(',')
        .map(parse_bounds)
        .collect::<Result<Vec<_>, _>>()
        .map_err(user)?;
    if domains.len() != dim_names.len() {
        return Err(user(format!(
            "{} dimensions but {} domains",
            dim_names.len(),
            domains.len()
        )));
    }
    let regular = args.extents.is_some();
    let extents: Vec<Option<f64>> = match args.extents {
        None => vec![None; dim_names.len()],
        Some(list) => {
            let parsed = list
                .split(',')
                .map(|e| e.trim().parse::<f64>().map(Some))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| user(format!("bad tile extent: {e}")))?;
            if parsed.len() != dim_names.len() {
                return Err(user(format!(
                    "{} dimensions but {} tile extents",
                    dim_names.len(),
                    parsed.len()
                )));
            }
            parsed
        }
    };

    let compression = match args.compression.as_str() {
        "none" => Vec::new(),
        "gzip" => vec![FilterData::Gzip { level: None }],
        "zstd" => vec![FilterData::Zstd { level: None }],
        "lz4" => vec![FilterData::Lz4],
        "rle" => vec![FilterData::Rle],
        "bzip2" => vec![FilterData::Bzip2],
        "double-delta" => vec![FilterData::DoubleDelta],
        other => {
            return Err(user(format!("unknown compression '{other}'")))
        }
    };

    let attributes = split_csv(&args.attrs)
        .iter()
        .map(|spec| parse_attribute(spec, &compression))
        .collect::<Result<Vec<_>, _>>()
        .map_err(user)?;

    let dimension = dim_names
        .into_iter()
        .zip(domains)
        .zip(extents)
        .map(|((name, domain), extent)| DimensionData {
            name,
            domain,
            extent,
        })
        .collect();

    let cell_order = CellOrder::from_str(&args.cell_order)
        .map_err(|s| user(format!("unknown cell order '{s}'")))?;
    let tile_order = match args.tile_order {
        None => {
            if regular {
                TileOrder::RowMajor
            } else {
                TileOrder::None
            }
        }
        Some(t) => TileOrder::from_str(&t)
            .map_err(|s| user(format!("unknown tile order '{s}'")))?,
    };

    let schema = ArraySchema::new(SchemaData {
        array_name: args.name.clone(),
        array_type,
        domain: DomainData {
            datatype: coords_type,
            dimension,
        },
        capacity: args.capacity,
        cell_order: Some(cell_order),
        tile_order: Some(tile_order),
        consolidation_step: None,
        attributes,
    })?;
    sm.define_array(&schema)?;
    println!("defined array '{}'", args.name);
    Ok(())
}

fn export(
    sm: &StorageManager,
    qp: &QueryProcessor,
    args: ExportArgs,
) -> Result<(), Error> {
    let schema = sm.load_array_schema(&args.name)?;
    let format = match args.format.as_str() {
        "csv" => ExportFormat::Csv,
        "binary" => ExportFormat::Binary,
        other => {
            return Err(Error::SchemaInvalid(format!(
                "unknown export format '{other}'"
            )))
        }
    };
    let range = args
        .range
        .map(|r| parse_range(&schema, &r))
        .transpose()?;
    let attribute_ids = match args.attributes {
        None => None,
        Some(names) => Some(
            split_csv(&names)
                .iter()
                .map(|name| {
                    schema.attribute_id(name).ok_or_else(|| {
                        Error::NotFound(format!("attribute '{name}'"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
        ),
    };

    qp.array_export(
        &args.name,
        &args.file,
        &ExportOptions {
            format,
            dense: args.dense,
            reverse: args.reverse,
            dim_ids: None,
            attribute_ids,
            range,
            gzip: args.gzip,
            csv: CsvOptions {
                delimiter: args.delimiter,
                precision: args.precision,
            },
        },
    )
}

/// Rewrites the array under a new tiling: reads every cell, defines a
/// staging array with the adjusted schema, reloads, and swaps it in.
fn retile(
    sm: &StorageManager,
    qp: &QueryProcessor,
    args: RetileArgs,
) -> Result<(), Error> {
    let schema = sm.load_array_schema(&args.name)?;
    let mut data = schema.data().clone();

    if let Some(extents) = args.extents {
        let parsed = extents
            .split(',')
            .map(|e| e.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                Error::SchemaInvalid(format!("bad tile extent: {e}"))
            })?;
        if parsed.len() != data.domain.dim_num() {
            return Err(Error::SchemaInvalid(format!(
                "{} dimensions but {} tile extents",
                data.domain.dim_num(),
                parsed.len()
            )));
        }
        for (d, e) in data.domain.dimension.iter_mut().zip(parsed) {
            d.extent = Some(e);
        }
    }
    if let Some(capacity) = args.capacity {
        data.capacity = Some(capacity);
    }
    if let Some(order) = args.cell_order {
        data.cell_order = Some(CellOrder::from_str(&order).map_err(
            |s| Error::SchemaInvalid(format!("unknown cell order '{s}'")),
        )?);
    }
    if let Some(order) = args.tile_order {
        data.tile_order = Some(TileOrder::from_str(&order).map_err(
            |s| Error::SchemaInvalid(format!("unknown tile order '{s}'")),
        )?);
    }

    let staging = format!("{}__retile", args.name);
    data.array_name = staging.clone();
    // Validate the new tiling before touching anything
    ArraySchema::new(data.clone())?;

    let attributes: Vec<String> = schema
        .attributes()
        .iter()
        .map(|a| a.name.clone())
        .collect();
    let sm_retile = (|| -> Result<(), Error> {
        qp.subarray_with_schema(
            &args.name,
            data,
            None,
            Some(&attributes),
            CancelToken::new(),
        )?;
        sm.delete_array(&args.name)?;
        let from = sm.workspace().join(&staging);
        let to = sm.workspace().join(&args.name);
        std::fs::rename(&from, &to).map_err(|e| Error::io(&from, e))?;
        // The stored schema still carries the staging name
        let mut renamed = sm.load_array_schema(&args.name)?.data().clone();
        renamed.array_name = args.name.clone();
        sm.modify_array_schema(&ArraySchema::new(renamed)?)
    })();
    if sm_retile.is_err() {
        let _ = sm.delete_array(&staging);
    }
    sm_retile
}

fn parse_attribute(
    spec: &str,
    compression: &[FilterData],
) -> Result<AttributeData, String> {
    let parts: Vec<&str> = spec.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(format!(
            "attribute spec '{spec}' is not name:type[:nullable]"
        ));
    }
    let datatype = Datatype::from_str(parts[1])
        .map_err(|s| format!("unknown attribute type '{s}'"))?;
    let nullable = match parts.get(2) {
        None => false,
        Some(&"nullable") => true,
        Some(other) => {
            return Err(format!("unknown attribute flag '{other}'"))
        }
    };
    Ok(AttributeData {
        name: parts[0].to_owned(),
        datatype,
        cell_val_num: None,
        nullability: Some(nullable),
        filters: compression.to_vec(),
    })
}

fn parse_bounds(spec: &str) -> Result<[f64; 2], String> {
    let (lo, hi) = spec
        .split_once(':')
        .ok_or_else(|| format!("domain '{spec}' is not lo:hi"))?;
    let lo = lo
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad bound '{lo}': {e}"))?;
    let hi = hi
        .trim()
        .parse::<f64>()
        .map_err(|e| format!("bad bound '{hi}': {e}"))?;
    Ok([lo, hi])
}

/// Parses `lo:hi,lo:hi,...` into typed per-dimension ranges.
fn parse_range(
    schema: &ArraySchema,
    spec: &str,
) -> Result<Vec<SingleValueRange>, Error> {
    use tiledb_common::physical_type_go;

    let bounds = spec
        .split(',')
        .map(parse_bounds)
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::SchemaInvalid)?;
    if bounds.len() != schema.dim_num() {
        return Err(Error::SchemaInvalid(format!(
            "range has {} dimensions, schema has {}",
            bounds.len(),
            schema.dim_num()
        )));
    }
    Ok(physical_type_go!(schema.coords_type(), DT, {
        use tiledb_common::datatype::PhysicalType;
        bounds
            .iter()
            .map(|[lo, hi]| {
                SingleValueRange::from(&[
                    DT::from_f64(*lo),
                    DT::from_f64(*hi),
                ])
            })
            .collect()
    }))
}

fn split_csv(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect()
}
