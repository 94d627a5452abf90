use proptest::prelude::*;

use tiledb_common::array::{ArrayType, CellOrder, TileOrder};
use tiledb_common::datatype::strategy::DatatypeContext;
use tiledb_common::datatype::Datatype;

use super::{AttributeData, DimensionData, DomainData, SchemaData};

const MIN_DIMENSIONS: usize = 1;
const MAX_DIMENSIONS: usize = 3;
const MIN_ATTRIBUTES: usize = 1;
const MAX_ATTRIBUTES: usize = 4;

fn prop_field_name() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z][a-z0-9_]{0,15}").unwrap()
}

#[derive(Clone, Copy)]
enum DimensionKind {
    Irregular,
    Regular,
    /// Regular with an extent that divides the domain, as dense
    /// arrays require.
    Dense,
}

fn prop_dimension(
    kind: DimensionKind,
) -> impl Strategy<Value = DimensionData> {
    (prop_field_name(), 0u32..100).prop_flat_map(move |(name, lo)| {
        let span_extent: BoxedStrategy<(u32, Option<u32>)> = match kind {
            DimensionKind::Irregular => {
                (1u32..=64).prop_map(|span| (span, None)).boxed()
            }
            DimensionKind::Regular => (1u32..=64)
                .prop_flat_map(|span| {
                    (1u32..=span).prop_map(move |e| (span, Some(e)))
                })
                .boxed(),
            DimensionKind::Dense => (1u32..=8, 1u32..=8)
                .prop_map(|(extent, partitions)| {
                    (extent * partitions, Some(extent))
                })
                .boxed(),
        };
        span_extent.prop_map(move |(span, extent)| DimensionData {
            name: name.clone(),
            domain: [lo as f64, (lo + span - 1) as f64],
            extent: extent.map(|e| e as f64),
        })
    })
}

fn prop_attribute() -> impl Strategy<Value = AttributeData> {
    (
        prop_field_name(),
        any::<Datatype>(),
        any::<bool>(),
        // The schema file stores a single compression code per attribute,
        // so generate only the pipelines that code can reconstruct.
        (0u8..=6).prop_map(|code| {
            tiledb_common::filter::pipeline_from_disk_code(code).unwrap()
        }),
    )
        .prop_map(|(name, datatype, nullable, filters)| AttributeData {
            name,
            datatype,
            cell_val_num: None,
            nullability: Some(nullable),
            filters,
        })
}

impl Arbitrary for SchemaData {
    type Parameters = Option<ArrayType>;
    type Strategy = BoxedStrategy<SchemaData>;

    fn arbitrary_with(args: Self::Parameters) -> Self::Strategy {
        let array_type = match args {
            Some(at) => Just(at).boxed(),
            None => any::<ArrayType>().boxed(),
        };
        array_type
            .prop_flat_map(|array_type| {
                let regular = match array_type {
                    ArrayType::Dense => Just(true).boxed(),
                    ArrayType::Sparse => any::<bool>().boxed(),
                };
                (Just(array_type), regular)
            })
            .prop_flat_map(|(array_type, regular)| {
                let cell_order = any_with::<CellOrder>(Some(array_type));
                let tile_order = if regular {
                    any::<TileOrder>().boxed()
                } else {
                    Just(TileOrder::None).boxed()
                };
                let coords_type = match array_type {
                    ArrayType::Dense => DatatypeContext::DenseDimension,
                    ArrayType::Sparse => DatatypeContext::Dimension,
                };
                let dimension_kind = match (array_type, regular) {
                    (ArrayType::Dense, _) => DimensionKind::Dense,
                    (ArrayType::Sparse, true) => DimensionKind::Regular,
                    (ArrayType::Sparse, false) => DimensionKind::Irregular,
                };
                (
                    prop_field_name(),
                    Just(array_type),
                    any_with::<Datatype>(coords_type),
                    proptest::collection::vec(
                        prop_dimension(dimension_kind),
                        MIN_DIMENSIONS..=MAX_DIMENSIONS,
                    ),
                    1u64..10000,
                    cell_order,
                    tile_order,
                    proptest::collection::vec(
                        prop_attribute(),
                        MIN_ATTRIBUTES..=MAX_ATTRIBUTES,
                    ),
                )
            })
            .prop_map(
                |(
                    array_name,
                    array_type,
                    coords_type,
                    mut dimension,
                    capacity,
                    cell_order,
                    tile_order,
                    mut attributes,
                )| {
                    // Field names must be unique across dimensions and attributes
                    for (i, d) in dimension.iter_mut().enumerate() {
                        d.name = format!("d{i}_{}", d.name);
                    }
                    for (i, a) in attributes.iter_mut().enumerate() {
                        a.name = format!("a{i}_{}", a.name);
                    }
                    SchemaData {
                        array_name,
                        array_type,
                        domain: DomainData {
                            datatype: coords_type,
                            dimension,
                        },
                        capacity: Some(capacity),
                        cell_order: Some(cell_order),
                        tile_order: Some(tile_order),
                        consolidation_step: Some(1),
                        attributes,
                    }
                },
            )
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn schema_shape(schema in any::<SchemaData>()) {
            assert!(!schema.domain.dimension.is_empty());
            assert!(!schema.attributes.is_empty());

            let with_extent = schema
                .domain
                .dimension
                .iter()
                .filter(|d| d.extent.is_some())
                .count();
            assert!(
                with_extent == 0
                    || with_extent == schema.domain.dim_num()
            );
        }
    }
}
