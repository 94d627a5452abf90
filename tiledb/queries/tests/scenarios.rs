//! End-to-end scenarios over the full write and read pipelines.

use std::sync::Arc;

use tempfile::TempDir;

use tiledb_common::array::{ArrayType, CellOrder, TileOrder};
use tiledb_common::datatype::Datatype;
use tiledb_common::range::SingleValueRange;
use tiledb_pod::array::{
    AttributeData, DimensionData, DomainData, SchemaData,
};
use tiledb_queries::{QueryProcessor, RangeWalk};
use tiledb_storage::cell::{AttrValue, CellLayout};
use tiledb_storage::fragment::read_state::Overlap;
use tiledb_storage::schema::ArraySchema;
use tiledb_storage::{CancelToken, Config, StorageManager};

fn small_config() -> Config {
    Config {
        segment_size: 1024,
        write_state_max_size: 64 * 1024,
        compute_concurrency_level: 2,
        io_concurrency_level: 2,
        ..Config::default()
    }
}

fn manager() -> (TempDir, StorageManager) {
    let dir = TempDir::new().unwrap();
    let sm = StorageManager::new(dir.path(), small_config()).unwrap();
    (dir, sm)
}

fn attr_i32(name: &str) -> AttributeData {
    AttributeData {
        name: name.to_owned(),
        datatype: Datatype::Int32,
        cell_val_num: None,
        nullability: None,
        filters: vec![],
    }
}

fn dim(name: &str, lo: f64, hi: f64, extent: Option<f64>) -> DimensionData {
    DimensionData {
        name: name.to_owned(),
        domain: [lo, hi],
        extent,
    }
}

/// Builds one encoded cell of a single-`i32`-attribute array.
fn cell_i32(
    layout: &CellLayout,
    coords: &[u8],
    value: i32,
) -> Vec<u8> {
    let raw = value.to_le_bytes();
    let values = [AttrValue {
        validity: None,
        value: &raw,
    }];
    let mut out = Vec::new();
    layout.encode(coords, &values, &mut out).unwrap();
    out
}

fn coords_i32(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn coords_u32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Reads a dense `i32` attribute over a range in cell order.
fn read_dense_i32(
    qp: &QueryProcessor,
    array: &str,
    range: Option<Vec<SingleValueRange>>,
) -> Vec<i32> {
    let ad = qp.open_for_read(array, None).unwrap();
    let schema = Arc::clone(ad.schema());
    let range = QueryProcessor::resolve_range(&schema, range).unwrap();
    let mut states = qp.read_states(&ad, &range, false).unwrap();
    let walk = RangeWalk::new(&schema, &range, false).unwrap();
    let mut out = Vec::new();
    for coords in walk {
        let cell = QueryProcessor::dense_cell_at(&mut states, &coords)
            .unwrap()
            .expect("dense cell missing");
        out.push(i32::from_le_bytes(
            cell.values[0].bytes.as_slice().try_into().unwrap(),
        ));
    }
    qp.storage().close_array(&ad).unwrap();
    out
}

// ---------------------------------------------------------------------
// S1: regular dense 2-D write/read
// ---------------------------------------------------------------------

fn dense_4x4_schema() -> SchemaData {
    SchemaData {
        array_name: "dense_4x4".to_owned(),
        array_type: ArrayType::Dense,
        domain: DomainData {
            datatype: Datatype::Int32,
            dimension: vec![
                dim("x", 1.0, 4.0, Some(2.0)),
                dim("y", 1.0, 4.0, Some(2.0)),
            ],
        },
        capacity: None,
        cell_order: Some(CellOrder::RowMajor),
        tile_order: Some(TileOrder::RowMajor),
        consolidation_step: None,
        attributes: vec![attr_i32("a")],
    }
}

#[test]
fn s1_dense_2d_write_read() {
    let (_dir, sm) = manager();
    let qp = QueryProcessor::new(&sm);

    let schema = ArraySchema::new(dense_4x4_schema()).unwrap();
    sm.define_array(&schema).unwrap();

    let layout = CellLayout::from_schema(&schema);
    let mut cells = Vec::new();
    let mut value = 1i32;
    for x in 1..=4i32 {
        for y in 1..=4i32 {
            cells.push(cell_i32(&layout, &coords_i32(&[x, y]), value));
            value += 1;
        }
    }
    qp.write_cells("dense_4x4", cells, false, CancelToken::new())
        .unwrap();

    let full = read_dense_i32(&qp, "dense_4x4", None);
    assert_eq!((1..=16).collect::<Vec<i32>>(), full);

    let sub = read_dense_i32(
        &qp,
        "dense_4x4",
        Some(vec![
            SingleValueRange::Int32(2, 3),
            SingleValueRange::Int32(2, 3),
        ]),
    );
    assert_eq!(vec![6, 7, 10, 11], sub);
}

#[test]
fn s1_reads_are_idempotent() {
    let (_dir, sm) = manager();
    let qp = QueryProcessor::new(&sm);

    let schema = ArraySchema::new(dense_4x4_schema()).unwrap();
    sm.define_array(&schema).unwrap();
    let layout = CellLayout::from_schema(&schema);
    let cells: Vec<Vec<u8>> = (0..16)
        .map(|i| {
            let (x, y) = (1 + i / 4, 1 + i % 4);
            cell_i32(&layout, &coords_i32(&[x, y]), i)
        })
        .collect();
    qp.write_cells("dense_4x4", cells, false, CancelToken::new())
        .unwrap();

    let first = read_dense_i32(&qp, "dense_4x4", None);
    let second = read_dense_i32(&qp, "dense_4x4", None);
    assert_eq!(first, second);
}

// ---------------------------------------------------------------------
// S2: irregular sparse write/read
// ---------------------------------------------------------------------

fn sparse_1d_schema() -> SchemaData {
    SchemaData {
        array_name: "sparse_1d".to_owned(),
        array_type: ArrayType::Sparse,
        domain: DomainData {
            datatype: Datatype::UInt32,
            dimension: vec![dim("x", 1.0, 100.0, None)],
        },
        capacity: Some(2),
        cell_order: Some(CellOrder::RowMajor),
        tile_order: Some(TileOrder::None),
        consolidation_step: None,
        attributes: vec![attr_i32("a")],
    }
}

#[test]
fn s2_sparse_irregular_write_read() {
    let (_dir, sm) = manager();
    let qp = QueryProcessor::new(&sm);

    let schema = ArraySchema::new(sparse_1d_schema()).unwrap();
    sm.define_array(&schema).unwrap();
    let layout = CellLayout::from_schema(&schema);

    let cells: Vec<Vec<u8>> = [(5u32, 50i32), (1, 10), (3, 30), (9, 90)]
        .iter()
        .map(|(x, a)| cell_i32(&layout, &coords_u32(&[*x]), *a))
        .collect();
    qp.write_cells("sparse_1d", cells, false, CancelToken::new())
        .unwrap();

    // Cells come back in global order
    let ad = qp.open_for_read("sparse_1d", None).unwrap();
    let range = schema.domain_ranges();
    let mut coords_out = Vec::new();
    let mut values_out = Vec::new();
    qp.for_each_sparse_cell(&ad, &range, false, |cell| {
        coords_out.push(u32::from_le_bytes(
            cell.coords.as_slice().try_into().unwrap(),
        ));
        values_out.push(i32::from_le_bytes(
            cell.values[0].bytes.as_slice().try_into().unwrap(),
        ));
        Ok(())
    })
    .unwrap();
    assert_eq!(vec![1, 3, 5, 9], coords_out);
    assert_eq!(vec![10, 30, 50, 90], values_out);

    // Fragment book-keeping: 2 tiles with the expected index metadata
    let fd = &ad.fragments()[0];
    let fragment = sm.read_fragment(fd).unwrap();
    let bk = fragment.book_keeping();
    assert_eq!(&[0, 1], bk.tile_ids());
    assert_eq!(
        vec![
            (coords_u32(&[1]), coords_u32(&[3])),
            (coords_u32(&[5]), coords_u32(&[9])),
        ],
        bk.bounding_coords().to_vec()
    );
    assert_eq!(
        vec![
            vec![SingleValueRange::UInt32(1, 3)],
            vec![SingleValueRange::UInt32(5, 9)],
        ],
        bk.mbrs().to_vec()
    );
    assert_eq!(2, bk.last_tile_cell_num());
    assert_eq!(
        Some(vec![SingleValueRange::UInt32(1, 9)]),
        bk.non_empty_domain().cloned()
    );
    sm.close_array(&ad).unwrap();
}

#[test]
fn s2_sparse_range_and_reverse() {
    let (_dir, sm) = manager();
    let qp = QueryProcessor::new(&sm);

    let schema = ArraySchema::new(sparse_1d_schema()).unwrap();
    sm.define_array(&schema).unwrap();
    let layout = CellLayout::from_schema(&schema);

    let cells: Vec<Vec<u8>> = [(5u32, 50i32), (1, 10), (3, 30), (9, 90)]
        .iter()
        .map(|(x, a)| cell_i32(&layout, &coords_u32(&[*x]), *a))
        .collect();
    qp.write_cells("sparse_1d", cells, false, CancelToken::new())
        .unwrap();

    let ad = qp.open_for_read("sparse_1d", None).unwrap();

    let range = vec![SingleValueRange::UInt32(2, 8)];
    let mut forward = Vec::new();
    qp.for_each_sparse_cell(&ad, &range, false, |cell| {
        forward.push(u32::from_le_bytes(
            cell.coords.as_slice().try_into().unwrap(),
        ));
        Ok(())
    })
    .unwrap();
    assert_eq!(vec![3, 5], forward);

    let mut backward = Vec::new();
    qp.for_each_sparse_cell(&ad, &range, true, |cell| {
        backward.push(u32::from_le_bytes(
            cell.coords.as_slice().try_into().unwrap(),
        ));
        Ok(())
    })
    .unwrap();
    assert_eq!(vec![5, 3], backward);
    sm.close_array(&ad).unwrap();
}

// ---------------------------------------------------------------------
// S3: variable-length attribute
// ---------------------------------------------------------------------

#[test]
fn s3_var_length_attribute() {
    let (_dir, sm) = manager();
    let qp = QueryProcessor::new(&sm);

    let schema = ArraySchema::new(SchemaData {
        array_name: "strings".to_owned(),
        array_type: ArrayType::Dense,
        domain: DomainData {
            datatype: Datatype::UInt32,
            dimension: vec![dim("id", 0.0, 3.0, Some(2.0))],
        },
        capacity: None,
        cell_order: Some(CellOrder::RowMajor),
        tile_order: Some(TileOrder::RowMajor),
        consolidation_step: None,
        attributes: vec![AttributeData {
            name: "s".to_owned(),
            datatype: Datatype::StringUtf8,
            cell_val_num: None,
            nullability: None,
            filters: vec![],
        }],
    })
    .unwrap();
    sm.define_array(&schema).unwrap();
    let layout = CellLayout::from_schema(&schema);

    let mut cells = Vec::new();
    for (id, s) in
        [(0u32, "a"), (1, "bb"), (2, "ccc"), (3, "")]
    {
        let values = [AttrValue {
            validity: None,
            value: s.as_bytes(),
        }];
        let mut out = Vec::new();
        layout
            .encode(&coords_u32(&[id]), &values, &mut out)
            .unwrap();
        cells.push(out);
    }
    qp.write_cells("strings", cells, false, CancelToken::new())
        .unwrap();

    let ad = qp.open_for_read("strings", None).unwrap();
    let (offsets, bytes) =
        qp.read_var_attribute(&ad, "s", None).unwrap();
    assert_eq!(vec![0, 1, 3, 6, 6], offsets);
    assert_eq!(b"abbccc".to_vec(), bytes);
    sm.close_array(&ad).unwrap();
}

// ---------------------------------------------------------------------
// S4: Hilbert order sort
// ---------------------------------------------------------------------

#[test]
fn s4_hilbert_order() {
    let (_dir, sm) = manager();
    let qp = QueryProcessor::new(&sm);

    let schema = ArraySchema::new(SchemaData {
        array_name: "hilbert".to_owned(),
        array_type: ArrayType::Sparse,
        domain: DomainData {
            datatype: Datatype::UInt32,
            dimension: vec![
                dim("x", 0.0, 3.0, Some(4.0)),
                dim("y", 0.0, 3.0, Some(4.0)),
            ],
        },
        capacity: Some(10),
        cell_order: Some(CellOrder::Hilbert),
        tile_order: Some(TileOrder::RowMajor),
        consolidation_step: None,
        attributes: vec![attr_i32("a")],
    })
    .unwrap();
    sm.define_array(&schema).unwrap();
    let layout = CellLayout::from_schema(&schema);

    let cells: Vec<Vec<u8>> =
        [[0u32, 0], [3, 3], [0, 3], [3, 0]]
            .iter()
            .enumerate()
            .map(|(i, c)| cell_i32(&layout, &coords_u32(c), i as i32))
            .collect();
    qp.write_cells("hilbert", cells, false, CancelToken::new())
        .unwrap();

    let ad = qp.open_for_read("hilbert", None).unwrap();
    let mut visited = Vec::new();
    qp.for_each_sparse_cell(
        &ad,
        &schema.domain_ranges(),
        false,
        |cell| {
            visited.push((
                u32::from_le_bytes(cell.coords[0..4].try_into().unwrap()),
                u32::from_le_bytes(cell.coords[4..8].try_into().unwrap()),
            ));
            Ok(())
        },
    )
    .unwrap();
    assert_eq!(vec![(0, 0), (0, 3), (3, 3), (3, 0)], visited);
    sm.close_array(&ad).unwrap();
}

// ---------------------------------------------------------------------
// S5: range-overlap partial-special
// ---------------------------------------------------------------------

#[test]
fn s5_partial_special_overlap() {
    let (_dir, sm) = manager();
    let qp = QueryProcessor::new(&sm);

    let schema = ArraySchema::new(SchemaData {
        array_name: "lanes".to_owned(),
        array_type: ArrayType::Dense,
        domain: DomainData {
            datatype: Datatype::Int64,
            dimension: vec![dim("x", 1.0, 10.0, Some(5.0))],
        },
        capacity: None,
        cell_order: Some(CellOrder::RowMajor),
        tile_order: Some(TileOrder::RowMajor),
        consolidation_step: None,
        attributes: vec![attr_i32("a")],
    })
    .unwrap();
    sm.define_array(&schema).unwrap();
    let layout = CellLayout::from_schema(&schema);

    let cells: Vec<Vec<u8>> = (1..=10i64)
        .map(|x| {
            let coords: Vec<u8> = x.to_le_bytes().to_vec();
            cell_i32(&layout, &coords, x as i32)
        })
        .collect();
    qp.write_cells("lanes", cells, false, CancelToken::new())
        .unwrap();

    let ad = qp.open_for_read("lanes", None).unwrap();
    let mut state = sm
        .read_state(
            &ad.fragments()[0],
            vec![SingleValueRange::Int64(3, 7)],
            false,
        )
        .unwrap();
    let overlaps: Vec<Overlap> = state
        .overlapping_tiles()
        .iter()
        .map(|t| t.overlap)
        .collect();
    assert_eq!(
        vec![Overlap::PartialSpecial, Overlap::PartialSpecial],
        overlaps
    );

    // The qualifying slab of tile [1,5] is the single copy 3..=5
    let (tile, pos, run) = state
        .dense_run_at(0, &3i64.to_le_bytes())
        .unwrap()
        .unwrap();
    assert_eq!((2, 3), (pos, run));
    assert_eq!(3i32.to_le_bytes(), tile.cell(pos));
    assert_eq!(5i32.to_le_bytes(), tile.cell(pos + run - 1));

    // And of tile [6,10] the slab 6..=7
    let (_, pos, run) = state
        .dense_run_at(0, &6i64.to_le_bytes())
        .unwrap()
        .unwrap();
    assert_eq!((0, 2), (pos, run));
    sm.close_array(&ad).unwrap();
}

// ---------------------------------------------------------------------
// S6: write / crash / recovery
// ---------------------------------------------------------------------

#[test]
fn s6_crash_recovery() {
    let (_dir, sm) = manager();
    let qp = QueryProcessor::new(&sm);

    let schema = ArraySchema::new(sparse_1d_schema()).unwrap();
    sm.define_array(&schema).unwrap();
    let layout = CellLayout::from_schema(&schema);

    // A committed fragment to survive the crash
    let committed_cells: Vec<Vec<u8>> = [(1u32, 10i32), (2, 20)]
        .iter()
        .map(|(x, a)| cell_i32(&layout, &coords_u32(&[*x]), *a))
        .collect();
    qp.write_cells(
        "sparse_1d",
        committed_cells,
        false,
        CancelToken::new(),
    )
    .unwrap();

    // Interrupted write: many cells staged, no commit marker
    {
        let (mut ws, _fragment) = sm
            .cell_writer("sparse_1d", CancelToken::new())
            .unwrap();
        for x in 10..=100u32 {
            let cell = cell_i32(&layout, &coords_u32(&[x]), x as i32);
            ws.write_cell(&cell).unwrap();
        }
        // Dropped without finalize: the crash
    }

    // Readers see the array as if the write never happened
    let committed = sm
        .committed_fragment_names("sparse_1d", None)
        .unwrap();
    assert_eq!(1, committed.len());

    let ad = qp.open_for_read("sparse_1d", None).unwrap();
    let mut visible = Vec::new();
    qp.for_each_sparse_cell(
        &ad,
        &schema.domain_ranges(),
        false,
        |cell| {
            visible.push(u32::from_le_bytes(
                cell.coords.as_slice().try_into().unwrap(),
            ));
            Ok(())
        },
    )
    .unwrap();
    assert_eq!(vec![1, 2], visible);
    sm.close_array(&ad).unwrap();

    // The next write-open removes the leftover fragment directory
    let before = std::fs::read_dir(sm.workspace().join("sparse_1d"))
        .unwrap()
        .count();
    let (ws, _fragment) = sm
        .cell_writer("sparse_1d", CancelToken::new())
        .unwrap();
    ws.abort();
    let after = std::fs::read_dir(sm.workspace().join("sparse_1d"))
        .unwrap()
        .count();
    assert!(after < before, "uncommitted fragment was not removed");
}

// ---------------------------------------------------------------------
// Multi-fragment dense reads: the newer fragment wins
// ---------------------------------------------------------------------

#[test]
fn dense_update_overwrites() {
    let (_dir, sm) = manager();
    let qp = QueryProcessor::new(&sm);

    let schema = ArraySchema::new(dense_4x4_schema()).unwrap();
    sm.define_array(&schema).unwrap();
    let layout = CellLayout::from_schema(&schema);

    let base: Vec<Vec<u8>> = (0..16)
        .map(|i| {
            let (x, y) = (1 + i / 4, 1 + i % 4);
            cell_i32(&layout, &coords_i32(&[x, y]), 0)
        })
        .collect();
    qp.write_cells("dense_4x4", base, false, CancelToken::new())
        .unwrap();

    // Overwrite one whole tile (x in 1..=2, y in 1..=2)
    let update: Vec<Vec<u8>> = (1..=2i32)
        .flat_map(|x| {
            let layout = &layout;
            (1..=2i32).map(move |y| {
                cell_i32(layout, &coords_i32(&[x, y]), 7)
            })
        })
        .collect();
    qp.write_cells("dense_4x4", update, false, CancelToken::new())
        .unwrap();

    let full = read_dense_i32(&qp, "dense_4x4", None);
    let expected = vec![7, 7, 0, 0, 7, 7, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    assert_eq!(expected, full);
}

// ---------------------------------------------------------------------
// Subarray copy into a new array
// ---------------------------------------------------------------------

#[test]
fn subarray_copies_range() {
    let (_dir, sm) = manager();
    let qp = QueryProcessor::new(&sm);

    let schema = ArraySchema::new(sparse_1d_schema()).unwrap();
    sm.define_array(&schema).unwrap();
    let layout = CellLayout::from_schema(&schema);

    let cells: Vec<Vec<u8>> =
        [(5u32, 50i32), (1, 10), (3, 30), (9, 90)]
            .iter()
            .map(|(x, a)| cell_i32(&layout, &coords_u32(&[*x]), *a))
            .collect();
    qp.write_cells("sparse_1d", cells, false, CancelToken::new())
        .unwrap();

    qp.subarray(
        "sparse_1d",
        "sparse_sub",
        Some(vec![SingleValueRange::UInt32(2, 8)]),
        None,
        CancelToken::new(),
    )
    .unwrap();

    let ad = qp.open_for_read("sparse_sub", None).unwrap();
    let mut copied = Vec::new();
    qp.for_each_sparse_cell(
        &ad,
        &ad.schema().domain_ranges(),
        false,
        |cell| {
            copied.push((
                u32::from_le_bytes(
                    cell.coords.as_slice().try_into().unwrap(),
                ),
                i32::from_le_bytes(
                    cell.values[0].bytes.as_slice().try_into().unwrap(),
                ),
            ));
            Ok(())
        },
    )
    .unwrap();
    assert_eq!(vec![(3, 30), (5, 50)], copied);
    sm.close_array(&ad).unwrap();
}

// ---------------------------------------------------------------------
// Buffer reads: BufferTooSmall signalling
// ---------------------------------------------------------------------

#[test]
fn subarray_buf_too_small() {
    let (_dir, sm) = manager();
    let qp = QueryProcessor::new(&sm);

    let schema = ArraySchema::new(sparse_1d_schema()).unwrap();
    sm.define_array(&schema).unwrap();
    let layout = CellLayout::from_schema(&schema);

    let cells: Vec<Vec<u8>> = [(5u32, 50i32), (1, 10)]
        .iter()
        .map(|(x, a)| cell_i32(&layout, &coords_u32(&[*x]), *a))
        .collect();
    qp.write_cells("sparse_1d", cells, false, CancelToken::new())
        .unwrap();

    let ad = qp.open_for_read("sparse_1d", None).unwrap();

    // Large enough: both cells, 8 bytes each
    let mut buf = vec![0u8; 64];
    let mut buf_size = 0u64;
    qp.subarray_buf(&ad, None, None, &mut buf, &mut buf_size)
        .unwrap();
    assert_eq!(16, buf_size);

    // Too small: the sentinel size is reported
    let mut tiny = vec![0u8; 4];
    let mut tiny_size = 0u64;
    let err = qp
        .subarray_buf(&ad, None, None, &mut tiny, &mut tiny_size)
        .unwrap_err();
    assert!(matches!(
        err,
        tiledb_storage::Error::BufferTooSmall { .. }
    ));
    assert_eq!(u64::MAX, tiny_size);
    sm.close_array(&ad).unwrap();
}

// ---------------------------------------------------------------------
// Filtered attributes round-trip through the pipeline
// ---------------------------------------------------------------------

#[test]
fn compressed_attribute_roundtrip() {
    let (_dir, sm) = manager();
    let qp = QueryProcessor::new(&sm);

    let mut data = sparse_1d_schema();
    data.array_name = "compressed".to_owned();
    data.attributes[0].filters =
        vec![tiledb_common::filter::FilterData::Gzip { level: None }];
    let schema = ArraySchema::new(data).unwrap();
    sm.define_array(&schema).unwrap();
    let layout = CellLayout::from_schema(&schema);

    let cells: Vec<Vec<u8>> = (1..=50u32)
        .map(|x| cell_i32(&layout, &coords_u32(&[x]), (x * 3) as i32))
        .collect();
    qp.write_cells("compressed", cells, false, CancelToken::new())
        .unwrap();

    let ad = qp.open_for_read("compressed", None).unwrap();
    let mut values = Vec::new();
    qp.for_each_sparse_cell(
        &ad,
        &schema.domain_ranges(),
        false,
        |cell| {
            values.push(i32::from_le_bytes(
                cell.values[0].bytes.as_slice().try_into().unwrap(),
            ));
            Ok(())
        },
    )
    .unwrap();
    assert_eq!(
        (1..=50).map(|x| x * 3).collect::<Vec<i32>>(),
        values
    );
    sm.close_array(&ad).unwrap();
}
